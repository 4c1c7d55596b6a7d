use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::Extent;

/// diskmigrate - disk data path for VM migrations
#[derive(Parser)]
#[command(name = "diskmigrate")]
#[command(about = "Export, copy and convert VM disks onto target volumes")]
#[command(version)]
pub struct Cli {
    /// Verbose logging on stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Migrate one VM's disks as described by a request file
    Migrate {
        /// Path to the JSON migration request
        request: PathBuf,
    },
    /// Validate a request file without touching anything
    Validate {
        /// Path to the JSON migration request
        request: PathBuf,
    },
    /// Print the local device backing a target volume
    ResolveDevice {
        /// Target volume identifier
        volume_id: String,
        /// Device namespace to scan
        #[arg(long, default_value = "/dev/disk/by-id")]
        namespace: PathBuf,
        /// Retry with backoff until the device appears
        #[arg(long)]
        wait: bool,
    },
    /// Copy changed extents from an NBD export into a device (incremental copy helper)
    ExtentCopy {
        /// NBD URI of the export, e.g. nbd://127.0.0.1:10809 or nbd+unix:///?socket=PATH
        #[arg(long)]
        source: String,
        /// Target block device
        #[arg(long)]
        target: PathBuf,
        /// Extent as offset:length (repeatable)
        #[arg(long = "extent", value_parser = parse_extent)]
        extents: Vec<Extent>,
        /// Read more extents from a file, one offset:length per line ("-" for stdin)
        #[arg(long, value_name = "PATH")]
        extent_list: Option<PathBuf>,
    },
}

fn parse_extent(s: &str) -> Result<Extent, String> {
    s.parse()
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
