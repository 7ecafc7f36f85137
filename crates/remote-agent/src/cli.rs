use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "remote-agent",
    version,
    about = "Executes relayed commands on this machine"
)]
pub(crate) struct Args {
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// WebSocket URL of the relay's agent endpoint, e.g. ws://host:8700/ws/agent.
    #[arg(long)]
    pub(crate) relay_url: Option<String>,
    #[arg(long)]
    pub(crate) max_concurrency: Option<usize>,
}
