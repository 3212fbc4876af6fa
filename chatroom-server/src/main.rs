use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (CHAT_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CHAT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("chatroom_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = chatroom_server::config::ServerConfig::parse();
    tracing::info!("Starting chat server on {}", config.listen_addr);
    match config.db_path {
        Some(ref path) => tracing::info!("Database: {path}"),
        None => tracing::warn!("No --db-path given; running without accounts"),
    }
    if config.admin_names.is_empty() {
        tracing::info!("No admin accounts configured");
    }
    tracing::info!(
        max_history = config.max_history,
        idle_timeout_secs = config.idle_timeout_secs,
        "Room limits"
    );

    let server = chatroom_server::server::Server::new(config);
    server.run().await
}
