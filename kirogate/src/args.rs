use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// OpenAI-compatible gateway for the Kiro chat backend
#[derive(Debug, Parser)]
#[command(name = "kirogate", version, about = "OpenAI-compatible chat gateway in front of Kiro")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "kirogate.toml", env = "KIROGATE_CONFIG")]
    pub config: PathBuf,

    /// Listen address, overriding `server.listen_address`
    #[arg(long, env = "KIROGATE_LISTEN")]
    pub listen: Option<SocketAddr>,
}
