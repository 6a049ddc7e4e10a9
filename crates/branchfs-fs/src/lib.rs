//! # branchfs-fs
//!
//! FUSE layer of branchfs: mounts a git repository so that every
//! branch appears as a top-level directory, with the branch's working
//! tree materialized lazily on first access and all file operations
//! forwarded to the real worktree on disk.
//!
//! The interesting decisions (which physical path a virtual path maps
//! to, and how a worktree comes into existence exactly once under
//! concurrent access) live in `branchfs-core`; this crate is the
//! mechanical passthrough around them.
//!
//! ## Example
//!
//! ```ignore
//! use branchfs_fs::fuse::mount;
//!
//! // Blocks until unmounted. Branch worktrees appear under
//! // parent(repo)/tmp/<branch> as they are first touched.
//! mount("/work/myrepo", "/work/mount")?;
//! ```

pub mod fuse;

pub use fuse::{mount, mount_background, BranchFuseFS};
