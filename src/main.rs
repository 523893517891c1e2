use clap::Parser;
use scout::api::create_router;
use scout::config::Config;
use scout::pipeline::Pipeline;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scout", about = "Search-augmented chat server", version)]
struct Cli {
    /// Address to listen on. Overrides BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Bridge log crate -> tracing (so log::info! etc. work)
    tracing_log::LogTracer::init()?;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    let bind_addr = cli.bind.unwrap_or_else(|| config.bind_addr.clone());

    let pipeline = Arc::new(Pipeline::from_config(&config));
    let app = create_router(pipeline);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!(
        "listening on {} (model {} at {})",
        listener.local_addr()?,
        config.model_name,
        config.model_api_url
    );
    axum::serve(listener, app).await?;
    Ok(())
}
