mod conduit;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "conduit",
    version,
    about = "Conduit - VLESS-style TCP tunnel over WebSocket"
)]
struct Cli {
    /// Path to Conduit config file (.toml/.yaml/.yml). If omitted, uses CONDUIT_CONFIG; then auto-detects conduit.toml > conduit.yaml > conduit.yml from CWD; then falls back to the OS default path (Linux: /etc/conduit/conduit.toml; others: user config dir). A missing file is created with a fresh credential.
    #[arg(long, env = "CONDUIT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    conduit::run(cli.config).await
}
