use rmcp::{ServiceExt, transport::stdio};

use bosun::config::Config;
use bosun::server::BosunServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("bosun starting");

    let config = Config::from_env();
    let server = BosunServer::new(config)?;
    let processes = server.process_manager();
    let terminals = server.terminal_manager();

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    // Best-effort sweep: TERM tracked children, grace, KILL, drop records.
    processes.shutdown().await;
    terminals.shutdown();

    tracing::info!("bosun shutting down");
    Ok(())
}
