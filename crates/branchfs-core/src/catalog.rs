use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// A branch known to the repository, named after its ref file under
/// the heads directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Branch name, used verbatim as the virtual directory name.
    pub name: String,
}

/// Read-only view of the branches of one repository.
///
/// Enumerates `.git/refs/heads` directly. No caching: every call
/// reflects the current state of the backing repository, so branches
/// created or deleted after mount show up in the next listing.
#[derive(Debug, Clone)]
pub struct BranchCatalog {
    heads_dir: PathBuf,
}

impl BranchCatalog {
    /// Create a catalog for the repository rooted at `repo_root`.
    pub fn new<P: AsRef<Path>>(repo_root: P) -> Self {
        Self {
            heads_dir: repo_root.as_ref().join(".git").join("refs").join("heads"),
        }
    }

    /// List branches in directory enumeration order.
    ///
    /// A missing or unreadable heads directory yields an empty list
    /// rather than an error, so the mount stays up and the caller can
    /// diagnose via the empty namespace root.
    pub fn list_branches(&self) -> Vec<Branch> {
        let entries = match fs::read_dir(&self.heads_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "catalog: cannot read {}: {} (listing as empty)",
                    self.heads_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .map(|name| Branch { name })
            .collect()
    }

    /// The heads directory this catalog scans.
    pub fn heads_dir(&self) -> &Path {
        &self.heads_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_repo(branches: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let heads = dir.path().join(".git/refs/heads");
        fs::create_dir_all(&heads).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        for branch in branches {
            fs::write(heads.join(branch), "0000000000000000000000000000000000000000\n")
                .unwrap();
        }
        dir
    }

    #[test]
    fn lists_every_head_ref_exactly_once() {
        let repo = fake_repo(&["main", "feature-1"]);
        let catalog = BranchCatalog::new(repo.path());

        let mut names: Vec<String> = catalog
            .list_branches()
            .into_iter()
            .map(|b| b.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["feature-1", "main"]);
    }

    #[test]
    fn missing_heads_dir_lists_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = BranchCatalog::new(dir.path());
        assert!(catalog.list_branches().is_empty());
    }

    #[test]
    fn reflects_branch_creation_without_remount() {
        let repo = fake_repo(&["main"]);
        let catalog = BranchCatalog::new(repo.path());
        assert_eq!(catalog.list_branches().len(), 1);

        let heads = repo.path().join(".git/refs/heads");
        fs::write(heads.join("hotfix"), "").unwrap();
        assert_eq!(catalog.list_branches().len(), 2);
    }
}
