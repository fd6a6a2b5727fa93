pub mod app;
pub mod channel;
pub mod config;
pub mod credential;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
