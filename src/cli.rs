use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ContentPolicy, DeletePolicy, SyncConfig};
use crate::error::{Result, SyncError};
use crate::path::Endpoint;

fn parse_endpoint(s: &str) -> std::result::Result<Endpoint, String> {
    Ok(Endpoint::parse(s))
}

#[derive(Parser, Debug)]
#[command(name = "sinkd")]
#[command(about = "Bidirectional directory synchronization daemon", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
  # Serve a tree and wait for the peer
  sinkd /srv/shared alice@laptop:/home/alice/shared --listen 0.0.0.0:7677

  # Mirror a tree against a serving peer
  sinkd ~/shared server:/srv/shared

  # Resolve concurrent edits by newest mtime instead of keeping both
  sinkd ~/shared server:/srv/shared --latest-wins")]
pub struct Cli {
    /// Local directory to synchronize
    pub root: PathBuf,

    /// The peer's tree ([user@]host:/path)
    #[arg(value_parser = parse_endpoint)]
    pub peer: Endpoint,

    /// Listen for the peer on this address instead of dialing out
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// TCP port of the listening peer
    #[arg(long, default_value = "7677")]
    pub port: u16,

    /// Entry name to skip while scanning and watching (repeatable)
    #[arg(long = "exclude")]
    pub excludes: Vec<String>,

    /// Resolve content conflicts by newest modification time
    #[arg(long)]
    pub latest_wins: bool,

    /// Let deletions win over concurrent edits
    #[arg(long)]
    pub delete_wins: bool,

    /// Treat path case as insignificant (for case-insensitive filesystems)
    #[arg(long)]
    pub case_insensitive: bool,

    /// Seconds between full reconciliation rounds
    #[arg(long, default_value = "300")]
    pub full_sync_interval: u64,

    /// Maximum concurrent file transfers
    #[arg(short = 'j', long, default_value = "4")]
    pub max_transfers: usize,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn to_config(&self) -> SyncConfig {
        let mut cfg = SyncConfig::new(self.root.clone(), self.peer.clone());
        cfg.excludes = self.excludes.clone();
        if self.latest_wins {
            cfg.content_policy = ContentPolicy::LatestModifiedWins;
        }
        if self.delete_wins {
            cfg.delete_policy = DeletePolicy::DeleteWins;
        }
        cfg.case_insensitive = self.case_insensitive;
        cfg.full_sync_interval = Duration::from_secs(self.full_sync_interval.max(1));
        cfg.max_transfers = self.max_transfers.max(1);
        cfg
    }

    /// Address to dial when running as the connecting side.
    pub fn peer_addr(&self) -> Result<String> {
        match &self.peer {
            Endpoint::Remote { host, .. } => Ok(format!("{}:{}", host, self.port)),
            Endpoint::Local(_) => Err(SyncError::Config(
                "Peer must be [user@]host:/path unless --listen is given".to_string(),
            )),
        }
    }
}
