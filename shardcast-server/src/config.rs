use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "shardcast database shard proxy")]
pub struct Args {
    /// Path to the JSON proxy configuration.
    #[arg(short, long, default_value = "shardcast.json")]
    pub config: PathBuf,

    /// Address for direct driver connections.
    #[arg(long, default_value = "127.0.0.1:43300")]
    pub client_addr: String,

    /// Unix socket path CAS workers register on.
    #[arg(long, default_value = "/tmp/shardcast-cas.sock")]
    pub cas_path: PathBuf,

    /// Unix socket path of the broker hand-off channel. Without it the
    /// proxy accepts drivers directly on --client-addr.
    #[arg(long)]
    pub broker_path: Option<PathBuf>,

    /// Pin the reactor thread to this core.
    #[arg(long)]
    pub pin_core: Option<usize>,
}
