//! FUSE adapter for the branch namespace.
//!
//! Implements `fuser::Filesystem` over the core resolver: the root
//! directory lists branches, a depth-1 entry is a branch directory,
//! and anything deeper is forwarded to the branch's worktree on disk.
//!
//! # Semantics
//!
//! - Root listings re-read the repository's heads directory on every
//!   call, so branches created or deleted after mount show up without
//!   a remount.
//! - Any operation addressing the inside of a branch provisions the
//!   worktree first; listing is not special.
//! - Reads and writes are positional (`pread`/`pwrite`), so concurrent
//!   access to one open file needs no extra locking.

mod adapter;

pub use adapter::*;
