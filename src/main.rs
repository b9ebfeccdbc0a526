use clap::Parser;
use screenshot_api::{load_config, setup_logging, Cli, CliRunner, Commands};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting screenshot-api v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    // The server drains on its own receiver; one-shot commands are simply abandoned
    let serving = matches!(args.command, Commands::Serve { .. });
    let result = tokio::select! {
        result = runner.run(args.command, shutdown_tx.clone()) => result,
        _ = shutdown_rx.recv(), if !serving => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("screenshot-api stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }

        let _ = shutdown_tx.send(());
    })
}
