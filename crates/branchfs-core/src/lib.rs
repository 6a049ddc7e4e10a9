//! # branchfs-core
//!
//! Core of branchfs: exposes the branches of one git repository as a
//! virtual directory namespace, materializing each branch's working
//! tree lazily on first access.
//!
//! This crate provides:
//! - Branch enumeration from repository metadata ([`BranchCatalog`])
//! - Idempotent, concurrency-safe worktree provisioning
//!   ([`WorktreeProvisioner`])
//! - Virtual-to-physical path resolution ([`PathResolver`])
//!
//! It knows nothing about FUSE; the `branchfs-fs` crate forwards
//! filesystem operations to the physical paths resolved here.
//!
//! ## Example
//!
//! ```ignore
//! use branchfs_core::{PathResolver, Resolved, WorktreeProvisioner};
//!
//! let resolver = PathResolver::new(WorktreeProvisioner::new("/work/myrepo"));
//! match resolver.resolve("/main/src/lib.rs")? {
//!     Resolved::Inner { physical, .. } => println!("{}", physical.display()),
//!     _ => {}
//! }
//! ```

mod catalog;
mod error;
mod provision;
mod resolve;

pub use catalog::{Branch, BranchCatalog};
pub use error::{Error, Result};
pub use provision::{Checkout, GitCheckout, WorktreeProvisioner, SIDECAR_DIR};
pub use resolve::{PathResolver, Resolved};
