use crate::error::Result;
use crate::provision::{Checkout, GitCheckout, WorktreeProvisioner};
use log::trace;
use std::path::PathBuf;

/// Outcome of resolving a virtual path against the branch namespace.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolved {
    /// The namespace root: its listing is the branch catalog.
    NamespaceRoot,
    /// A depth-1 entry addressing a branch as a directory.
    ///
    /// Branch existence is not validated here; whatever next needs the
    /// worktree (enumeration, a deeper access) validates by
    /// provisioning.
    BranchDirectory { branch: String },
    /// A path inside a branch's worktree, provisioned and mapped to
    /// its physical location.
    Inner {
        branch: String,
        relative: PathBuf,
        physical: PathBuf,
    },
}

/// Maps virtual paths to physical ones, provisioning worktrees on
/// demand.
///
/// Every request addressing the inside of a branch goes through
/// [`WorktreeProvisioner::ensure_worktree`], so any operation (stat,
/// open, write, not just directory listing) can be the first touch of
/// a branch. Once provisioned the check is a single directory-existence
/// test.
pub struct PathResolver<C = GitCheckout> {
    provisioner: WorktreeProvisioner<C>,
}

impl<C: Checkout> PathResolver<C> {
    pub fn new(provisioner: WorktreeProvisioner<C>) -> Self {
        Self { provisioner }
    }

    /// Resolve a slash-separated virtual path.
    ///
    /// Zero components → namespace root; one component → branch
    /// directory; two or more → the first component is the branch and
    /// the rest is a path inside its worktree.
    pub fn resolve(&self, virtual_path: &str) -> Result<Resolved> {
        trace!("resolve({:?})", virtual_path);

        let mut components = virtual_path.split('/').filter(|c| !c.is_empty());

        let branch = match components.next() {
            None => return Ok(Resolved::NamespaceRoot),
            Some(first) => first.to_string(),
        };

        let relative: PathBuf = components.collect();
        if relative.as_os_str().is_empty() {
            return Ok(Resolved::BranchDirectory { branch });
        }

        let worktree_root = self.provisioner.ensure_worktree(&branch)?;
        let physical = worktree_root.join(&relative);

        Ok(Resolved::Inner {
            branch,
            relative,
            physical,
        })
    }

    /// Provision a depth-1 target and return its worktree root.
    ///
    /// Used by callers about to enumerate or otherwise touch a branch
    /// directory itself rather than a path inside it.
    pub fn resolve_branch_dir(&self, branch: &str) -> Result<PathBuf> {
        self.provisioner.ensure_worktree(branch)
    }

    /// The provisioner backing this resolver.
    pub fn provisioner(&self) -> &WorktreeProvisioner<C> {
        &self.provisioner
    }
}
