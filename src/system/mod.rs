mod executor;
#[cfg(test)]
pub mod mock;
mod os;
mod privilege;

pub use executor::{
    CommandOutput, CommandSpec, DryrunExecutor, ExecError, Executor, LiveExecutor,
};
pub use os::{parse_os_release, OsInfo};
pub use privilege::ensure_privileges;

use std::sync::Arc;

pub fn create_executor(dryrun: bool) -> Arc<dyn Executor> {
    if dryrun {
        Arc::new(DryrunExecutor)
    } else {
        Arc::new(LiveExecutor)
    }
}
