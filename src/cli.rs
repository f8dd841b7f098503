use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "On-device semantic search over file paths", long_about = None)]
pub struct Args {
    /// Data directory holding config.yaml, the embedding store and model cache.
    /// Defaults to $PATHSEEK_DIR or ~/.local/share/pathseek
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Embed every file under ROOT
    Index {
        root: PathBuf,

        /// Only embed files without an embedding from the current model
        #[clap(long, default_value = "false")]
        missing: bool,
    },

    /// Search indexed files
    Search {
        query: String,

        /// Only consider paths under this prefix
        #[clap(short, long)]
        scope: Option<String>,

        /// Maximum number of results
        #[clap(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show model and index status
    Status {},

    /// Forget indexed files under ROOT that no longer exist
    Prune { root: PathBuf },
}
