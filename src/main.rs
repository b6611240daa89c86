use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use ntserve::broker::{ServerImpl, SharedServer};
use ntserve::config::{Settings, load_config_from};
use ntserve::persistence::{self, json_store};
use ntserve::transport::ConnectionRegistry;
use ntserve::transport::tcp::start_tcp_server;
use ntserve::transport::websocket::start_websocket_server;
use ntserve::utils::error::ServerError;
use ntserve::utils::logging;

#[derive(Parser)]
#[command(name = "ntserve", version, about = "NetworkTables server for NT4 and NT3 clients")]
struct Cli {
    /// Configuration file; the extension may be omitted
    #[arg(long, env = "NTSERVE_CONFIG_FILE", default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Server,
    /// Report problems in a persistent file without starting a server
    CheckPersistent { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_config_from(&cli.config)?;
    logging::init(&settings.logging.level);

    match cli.command.unwrap_or(Command::Server) {
        Command::Server => run_server(settings).await?,
        Command::CheckPersistent { path } => check_persistent(&path)?,
    }
    Ok(())
}

async fn run_server(settings: Settings) -> Result<(), ServerError> {
    let server: SharedServer = Arc::new(Mutex::new(ServerImpl::new()));
    let persistent_file = PathBuf::from(&settings.storage.persistent_file);

    let errors = persistence::load_into(&server, &persistent_file)?;
    if !errors.is_empty() {
        warn!("problems loading {}:\n{errors}", persistent_file.display());
    }

    let registry = ConnectionRegistry::new();
    tokio::spawn(ServerImpl::start_periodic_loop(
        server.clone(),
        settings.server.tick_ms,
    ));
    tokio::spawn(persistence::start_persistent_saver(
        server.clone(),
        persistent_file.clone(),
        settings.storage.save_interval_ms,
    ));

    let nt4_addr = settings.server.nt4_addr();
    let nt3_addr = settings.server.nt3_addr();
    let result = tokio::select! {
        r = start_websocket_server(&nt4_addr, server.clone(), registry.clone()) => {
            r.map_err(ServerError::from)
        }
        r = start_tcp_server(&nt3_addr, server.clone(), registry.clone()) => {
            r.map_err(ServerError::from)
        }
        r = tokio::signal::ctrl_c() => {
            info!("shutting down");
            r.map_err(ServerError::from)
        }
    };

    match persistence::save_if_changed(&server, &persistent_file) {
        Ok(true) => info!("saved persistent topics to {}", persistent_file.display()),
        Ok(false) => {}
        Err(e) => error!("final save of {} failed: {e}", persistent_file.display()),
    }
    result
}

fn check_persistent(path: &Path) -> Result<(), ServerError> {
    let input = json_store::load_file(path)?;
    let (usable, errors) = persistence::check(&input);
    println!("{}: {usable} usable entries", path.display());
    if errors.is_empty() {
        return Ok(());
    }
    print!("{errors}");
    Err(ServerError::Persistent {
        path: path.display().to_string(),
        errors: format!("{} bad entries", errors.lines().count()),
    })
}
