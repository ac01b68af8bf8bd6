use archsetup::app::App;
use archsetup::bus::Bus;
use archsetup::config::SetupConfig;
use archsetup::error::{Result, SetupError};
use archsetup::event::EventHandler;
use archsetup::message::Message;
use archsetup::shield;
use archsetup::system::{self, OsInfo};
use archsetup::ui::Theme;
use clap::Parser;
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEBUG_LOG: &str = "debug.log";

#[derive(Parser, Debug)]
#[command(name = "archsetup")]
#[command(
    author,
    version,
    about = "Bootstrap a workstation: SSH identity, dotfiles, drivers and profiles"
)]
struct Args {
    /// Path to a TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log commands instead of running them
    #[arg(long)]
    dryrun: bool,

    /// Log file path (logging disabled unless this or DEBUG is set)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Default clone destination for the dotfiles repository
    #[arg(long)]
    dotfiles: Option<PathBuf>,

    /// Do not check for sudo before starting
    #[arg(long)]
    skip_privilege_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    info!("Starting archsetup");

    let mut config = match &args.config {
        Some(path) => SetupConfig::load_from(path)?,
        None => SetupConfig::default(),
    };
    if args.dryrun {
        config.general.dryrun = true;
    }
    if let Some(dotfiles) = &args.dotfiles {
        config.repo.default_destination = Some(dotfiles.clone());
    }

    if !config.general.dryrun && !args.skip_privilege_check {
        if let Err(e) = system::ensure_privileges() {
            error!("Privilege check failed: {}", e);
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    shield::install_panic_hook(|| {
        let _ = restore_terminal();
    });

    let mut terminal = setup_terminal()?;
    let result = run(&mut terminal, config).await;
    restore_terminal()?;

    if let Err(ref e) = result {
        error!("archsetup error: {}", e);
    }
    println!("Bye!");
    result
}

fn init_logging(args: &Args) -> Result<()> {
    let debug = std::env::var_os("DEBUG").is_some();
    let path = match (&args.log_file, debug) {
        (Some(path), _) => path.clone(),
        (None, true) => PathBuf::from(DEBUG_LOG),
        (None, false) => return Ok(()),
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file)
        .with_ansi(false)
        .try_init()
        .map_err(|e| SetupError::Logging(e.to_string()))
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<std::io::Stdout>>> {
    enable_raw_mode().map_err(|e| SetupError::Terminal(e.to_string()))?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen).map_err(|e| SetupError::Terminal(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend).map_err(|e| SetupError::Terminal(e.to_string()))?;
    Ok(terminal)
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode().map_err(|e| SetupError::Terminal(e.to_string()))?;
    execute!(stdout(), LeaveAlternateScreen).map_err(|e| SetupError::Terminal(e.to_string()))?;
    Ok(())
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    config: SetupConfig,
) -> Result<()> {
    let executor = system::create_executor(config.general.dryrun);
    let os = OsInfo::detect();
    info!("Detected {} / {}", os.family, os.distro);

    let mut app = App::new(&config, executor, os, Theme::default());
    let mut bus = Bus::new();
    let _events = EventHandler::new(
        bus.sender(),
        Duration::from_millis(config.general.tick_rate_ms),
    );

    let size = terminal.size().map_err(|e| SetupError::Terminal(e.to_string()))?;
    let startup = app.update(Message::Resize {
        width: size.width,
        height: size.height,
    });
    bus.schedule(startup);
    bus.schedule(app.init());

    loop {
        terminal
            .draw(|frame| app.view(frame))
            .map_err(|e| SetupError::Terminal(e.to_string()))?;

        let Some(msg) = bus.next().await else {
            break;
        };
        let cmd = app.update(msg);
        bus.schedule(cmd);

        if app.should_quit() {
            break;
        }
    }

    info!("Exiting");
    Ok(())
}
