pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod keys;
pub mod message;
pub mod navigator;
pub mod process;
pub mod shield;
pub mod stages;
pub mod system;
pub mod ui;
