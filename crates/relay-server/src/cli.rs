use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "relay-server",
    version,
    about = "Relay that queues commands for a single remote executor"
)]
pub(crate) struct Args {
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    #[arg(long)]
    pub(crate) data_dir: Option<PathBuf>,
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
