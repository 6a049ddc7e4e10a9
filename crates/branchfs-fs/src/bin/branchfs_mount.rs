//! branchfs-mount: mount a git repository's branches as directories.
//!
//! Every top-level entry of the mount is a branch; entering one checks
//! out that branch into a sibling `tmp/<branch>` worktree on first
//! access and exposes it as an ordinary directory tree.
//!
//! # Usage
//!
//! ```bash
//! # Mount ./myrepo at ./mount (created if absent)
//! branchfs-mount myrepo
//!
//! ls mount/            # branch names
//! ls mount/main/       # working tree of main, checked out on demand
//! ```

use branchfs_fs::fuse;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::fs;
use std::path::PathBuf;
use std::process;

/// Mount the branches of a git repository as a directory tree.
///
/// The mount point defaults to a sibling directory of the repository
/// named `mount` and is created if it does not exist.
#[derive(Parser, Debug)]
#[command(name = "branchfs-mount")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the git repository
    #[arg(value_name = "REPOSITORY")]
    repository: PathBuf,

    /// Mount point (default: sibling directory named "mount")
    #[arg(short, long)]
    mount_point: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    // Validate the repository path
    let repo_root = match args.repository.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            error!("Repository not found: {}: {}", args.repository.display(), e);
            process::exit(1);
        }
    };
    if !repo_root.is_dir() {
        error!("Not a directory: {}", repo_root.display());
        process::exit(1);
    }

    // Derive the mount point as a sibling of the repository unless
    // overridden, and create it if absent.
    let mount_point = args.mount_point.unwrap_or_else(|| {
        repo_root
            .parent()
            .map(|p| p.join("mount"))
            .unwrap_or_else(|| repo_root.join("mount"))
    });
    if let Err(e) = fs::create_dir_all(&mount_point) {
        error!(
            "Failed to create mount point {}: {}",
            mount_point.display(),
            e
        );
        process::exit(1);
    }

    // One-time setup: serve from inside the repository root. Request
    // handling never relies on the working directory after this point;
    // all resolved paths are absolute.
    if let Err(e) = std::env::set_current_dir(&repo_root) {
        error!(
            "Cannot enter repository root {}: {}",
            repo_root.display(),
            e
        );
        process::exit(1);
    }

    info!("Repository: {}", repo_root.display());
    info!("Mounting at: {}", mount_point.display());

    if let Err(e) = fuse::mount(&repo_root, &mount_point) {
        error!("Mount error: {}", e);
        process::exit(1);
    }
}
