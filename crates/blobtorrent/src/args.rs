use std::path::PathBuf;

use clap::Parser;
use url::Url;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Arguments {
    /// Torrent file to use, either a path or an http(s) URL
    #[arg(value_name = "TORRENT")]
    pub torrent: String,
    /// Base URL of the blob server
    #[arg(short, long, value_name = "URL", env = "BLOBTORRENT_SERVER")]
    pub server: Url,
    /// Upper bound for the memory used by cached pieces, in bytes
    #[arg(long, value_name = "BYTES")]
    pub cache_limit: Option<usize>,
    /// Where to save the torrent's content once every piece is in the blob server
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}
