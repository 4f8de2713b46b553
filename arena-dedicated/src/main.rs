use anyhow::Result;
use arena_server::{ArenaNode, Config};
use clap::Parser;
use tokio::select;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overrides SERVER_PORT / PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides SERVER_INSTANCE_ID.
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp_micros()
        .init();
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(instance_id) = args.instance_id {
        config.server_instance_id = instance_id;
    }
    if let Err(e) = config.validate() {
        // Misconfiguration is the one fatal error: exit before the
        // listener binds.
        log::error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let kv = arena_store::connect(config.redis_url.as_deref()).await?;
    match &config.redis_url {
        Some(_) => log::info!("using redis-backed stores"),
        None => log::info!("no REDIS_URL; running single-node with in-process stores"),
    }

    let port = config.port;
    let node = ArenaNode::spawn(config, kv).map_err(anyhow::Error::msg)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!(
        "{} listening on {}",
        node.state.server_id,
        listener.local_addr()?
    );

    let cancel = node.cancel_token();
    axum::serve(listener, node.router.clone())
        .with_graceful_shutdown(async move {
            select! {
                _ = tokio::signal::ctrl_c() => log::info!("shutdown requested"),
                _ = cancel.cancelled() => {}
            }
        })
        .await?;

    Ok(())
}
