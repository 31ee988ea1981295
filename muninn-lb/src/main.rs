#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use muninn_lb_lib::api::{self, ApiState};
use muninn_lb_lib::config::{load_from_path, LoggingConfig};
use muninn_lb_lib::firewall::{Firewall, FIREWALL_FILE};
use muninn_lb_lib::geo::GeoDb;
use muninn_lb_lib::manager::Manager;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about = "Layer-4 reverse proxy and load balancer")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "./config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            // logging is not configured yet
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&cfg.logging);
    info!(version = VERSION, config = %cli.config.display(), "starting muninn-lb");

    let geo = match cfg.defaults.china_ipdb_path.as_deref() {
        Some(path) => match GeoDb::load(path) {
            Ok(db) => Some(Arc::new(db)),
            Err(err) => {
                error!(%err, path, "failed to load ip database");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let firewall = Arc::new(Firewall::open(FIREWALL_FILE));
    let manager = Arc::new(Manager::new(cfg.defaults.clone(), firewall, geo));

    if let Err(err) = manager.initialize(cfg.servers.clone()).await {
        error!(%err, "failed to start listeners");
        std::process::exit(1);
    }

    if cfg.api.enabled {
        let state = Arc::new(ApiState::new(
            &cfg.api,
            Arc::clone(&manager),
            cfg.clone(),
            VERSION,
        ));
        let api_cfg = cfg.api.clone();
        tokio::spawn(async move {
            if let Err(err) = api::serve(api_cfg, state).await {
                error!(%err, "api server exited");
                std::process::exit(1);
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(%err, "cannot listen for shutdown signal"),
    }
    manager.stop_all().await;
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match logging.output.as_str() {
        "stdout" => builder.init(),
        "stderr" => builder.with_writer(std::io::stderr).init(),
        path => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
            Err(err) => {
                eprintln!("cannot open log file {path}: {err}");
                builder.init();
            }
        },
    }
}
