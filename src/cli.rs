use std::{net::SocketAddr, time::Duration};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address of the broker answering request/reply calls.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub broker: SocketAddr,

    /// Address of the broadcast relay delivering subscribed notifications.
    #[arg(long, default_value = "127.0.0.1:5557")]
    pub feed: SocketAddr,

    /// Seconds to wait for a reply before a call is abandoned.
    #[arg(long = "reply-timeout", default_value_t = 30)]
    pub reply_timeout_secs: u64,
}

impl Cli {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}
