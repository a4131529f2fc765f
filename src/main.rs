use anyhow::Context;
use clap::Parser;
use edgeplane::{
    cli::Cli,
    observability::{init_observability, log_config_info},
    Config, ControlPlane, APP_NAME, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn install_rustls_provider() {
    use rustls::crypto::{ring, CryptoProvider};

    if CryptoProvider::get_default().is_none() {
        ring::default_provider().install_default().expect("install ring crypto provider");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run() -> anyhow::Result<()> {
    install_rustls_provider();

    // Load .env file if it exists; it must be read before the configuration
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_observability(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting edgeplane control plane");
    log_config_info(&config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    ControlPlane::new(config)?.run(shutdown).await?;

    info!("Control plane shutdown completed");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "edgeplane terminated");
        eprintln!("edgeplane: {:#}", e);
        std::process::exit(1);
    }
}
