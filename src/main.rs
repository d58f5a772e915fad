use std::env;

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "cablebeach=info,cablebeach_server=info,cablebeach_kernel=info".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: cablebeach serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match cablebeach_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(path = %config_path, hostname = %cfg.server.hostname, "config loaded");

    tokio::select! {
        result = cablebeach_server::serve(cfg) => {
            if let Err(e) = result {
                error!(error = %e, "server exited with error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
}
