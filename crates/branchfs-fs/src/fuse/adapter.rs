//! FUSE adapter implementation for the branch namespace.
//!
//! This module implements the `fuser::Filesystem` trait for
//! [`BranchFuseFS`]: namespace decisions go through the core resolver,
//! everything after that is forwarded to the resolved physical path.

use branchfs_core::{BranchCatalog, Error as CoreError, PathResolver, Resolved, WorktreeProvisioner};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{EINVAL, EIO, ENOENT, EOPNOTSUPP};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time-to-live for cached attributes.
const TTL: Duration = Duration::from_secs(1);

/// Inode to virtual-path table.
///
/// Virtual paths are stored without a leading slash; the root is the
/// empty string at `FUSE_ROOT_ID`. Inodes are assigned on first sight
/// of a path and stay stable across renames.
struct InodeTable {
    paths: HashMap<u64, String>,
    ids: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        let mut ids = HashMap::new();
        paths.insert(FUSE_ROOT_ID, String::new());
        ids.insert(String::new(), FUSE_ROOT_ID);
        Self {
            paths,
            ids,
            next: FUSE_ROOT_ID + 1,
        }
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(|s| s.as_str())
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.ids.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_string());
        self.ids.insert(path.to_string(), ino);
        ino
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path(parent)?;
        let name = name.to_string_lossy();
        if parent_path.is_empty() {
            Some(name.into_owned())
        } else {
            Some(format!("{}/{}", parent_path, name))
        }
    }

    fn remove(&mut self, path: &str) {
        if let Some(ino) = self.ids.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Remap `old` and everything under it to `new`, keeping inode
    /// numbers stable.
    fn rename(&mut self, old: &str, new: &str) {
        let prefix = format!("{}/", old);
        let affected: Vec<(String, u64)> = self
            .ids
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, i)| (p.clone(), *i))
            .collect();

        for (path, ino) in affected {
            self.ids.remove(&path);
            let renamed = format!("{}{}", new, &path[old.len()..]);
            self.paths.insert(ino, renamed.clone());
            self.ids.insert(renamed, ino);
        }
    }
}

/// Open file handles, keyed by the handle value given to the kernel.
struct HandleTable {
    files: HashMap<u64, File>,
    next: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            next: 1,
        }
    }

    fn insert(&mut self, file: File) -> u64 {
        let fh = self.next;
        self.next += 1;
        self.files.insert(fh, file);
        fh
    }

    fn get(&self, fh: u64) -> Option<&File> {
        self.files.get(&fh)
    }

    fn remove(&mut self, fh: u64) -> Option<File> {
        self.files.remove(&fh)
    }
}

/// FUSE filesystem exposing the branches of one git repository.
///
/// The root directory lists branches (read fresh from the repository
/// on every listing); each branch directory is backed by a lazily
/// provisioned worktree; paths below a branch are plain passthrough to
/// the worktree's files.
pub struct BranchFuseFS {
    repo_root: PathBuf,
    catalog: BranchCatalog,
    resolver: PathResolver,
    inodes: InodeTable,
    handles: HandleTable,
    /// Attribute template for the root and for branch directories that
    /// have not been provisioned yet, taken from the repository root.
    dir_attr: FileAttr,
}

impl BranchFuseFS {
    /// Create a filesystem for the repository at `repo_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository root cannot be stat'ed.
    pub fn new<P: AsRef<Path>>(repo_root: P) -> io::Result<Self> {
        let repo_root = repo_root.as_ref().canonicalize()?;
        let meta = fs::metadata(&repo_root)?;
        let dir_attr = attr_from_metadata(FUSE_ROOT_ID, &meta);

        Ok(Self {
            catalog: BranchCatalog::new(&repo_root),
            resolver: PathResolver::new(WorktreeProvisioner::new(&repo_root)),
            repo_root,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            dir_attr,
        })
    }

    /// Number of branches currently visible at the namespace root.
    pub fn branch_count(&self) -> usize {
        self.catalog.list_branches().len()
    }

    /// Physical path for a virtual path, provisioning the branch's
    /// worktree when the target is at or below a branch directory.
    fn physical(&self, vpath: &str) -> Result<PathBuf, i32> {
        match self.resolver.resolve(vpath).map_err(|e| resolve_errno(&e))? {
            Resolved::NamespaceRoot => Err(EINVAL),
            Resolved::BranchDirectory { branch } => self
                .resolver
                .resolve_branch_dir(&branch)
                .map_err(|e| resolve_errno(&e)),
            Resolved::Inner { physical, .. } => Ok(physical),
        }
    }

    /// Attributes for an inode, lstat'ing the physical path.
    ///
    /// Depth-1 entries (branch directories) answer from the repository
    /// root's template while unprovisioned, so a mere stat of a branch
    /// name does not trigger a checkout.
    fn attr(&self, ino: u64) -> Result<FileAttr, i32> {
        let vpath = self.inodes.path(ino).ok_or(ENOENT)?;

        match self.resolver.resolve(vpath).map_err(|e| resolve_errno(&e))? {
            Resolved::NamespaceRoot => Ok(FileAttr {
                ino: FUSE_ROOT_ID,
                ..self.dir_attr
            }),
            Resolved::BranchDirectory { branch } => {
                let root = self.resolver.provisioner().worktree_root(&branch);
                if root.exists() {
                    let meta = fs::symlink_metadata(&root).map_err(|e| io_errno(&e))?;
                    Ok(attr_from_metadata(ino, &meta))
                } else {
                    Ok(FileAttr { ino, ..self.dir_attr })
                }
            }
            Resolved::Inner { physical, .. } => {
                let meta = fs::symlink_metadata(&physical).map_err(|e| io_errno(&e))?;
                Ok(attr_from_metadata(ino, &meta))
            }
        }
    }

    /// Physical path for the child `name` of directory `parent`.
    fn child_physical(&mut self, parent: u64, name: &OsStr) -> Result<(String, PathBuf), i32> {
        let vpath = self.inodes.child(parent, name).ok_or(ENOENT)?;
        let physical = self.physical(&vpath)?;
        Ok((vpath, physical))
    }

    /// Stat a freshly created or linked entry and answer the kernel.
    fn reply_entry(&mut self, vpath: &str, physical: &Path, reply: ReplyEntry) {
        match fs::symlink_metadata(physical) {
            Ok(meta) => {
                let ino = self.inodes.assign(vpath);
                reply.entry(&TTL, &attr_from_metadata(ino, &meta), 0);
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }
}

impl Filesystem for BranchFuseFS {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let vpath = match self.inodes.child(parent, name) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        trace!("lookup({:?})", vpath);

        let ino = self.inodes.assign(&vpath);
        match self.attr(ino) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => {
                self.inodes.remove(&vpath);
                reply.error(errno);
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={})", ino);
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let physical = match self.inodes.path(ino).ok_or(ENOENT).map(str::to_string) {
            Ok(vpath) => match self.physical(&vpath) {
                Ok(p) => p,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            },
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("setattr({})", physical.display());

        if let Some(mode) = mode {
            if let Err(e) = fs::set_permissions(&physical, fs::Permissions::from_mode(mode)) {
                reply.error(io_errno(&e));
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            let cpath = match cstring(&physical) {
                Ok(c) => c,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let res = unsafe {
                libc::chown(
                    cpath.as_ptr(),
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                )
            };
            if res != 0 {
                reply.error(last_errno());
                return;
            }
        }

        if let Some(size) = size {
            let truncate = OpenOptions::new()
                .write(true)
                .open(&physical)
                .and_then(|f| f.set_len(size));
            if let Err(e) = truncate {
                reply.error(io_errno(&e));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let cpath = match cstring(&physical) {
                Ok(c) => c,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let times = [timespec_from(atime), timespec_from(mtime)];
            let res = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
            if res != 0 {
                reply.error(last_errno());
                return;
            }
        }

        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let target = self
            .inodes
            .path(ino)
            .ok_or(ENOENT)
            .map(str::to_string)
            .and_then(|vpath| self.physical(&vpath))
            .and_then(|physical| fs::read_link(physical).map_err(|e| io_errno(&e)));

        match target {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let (vpath, physical) = match self.child_physical(parent, name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("mknod({})", physical.display());

        let cpath = match cstring(&physical) {
            Ok(c) => c,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let res = unsafe {
            libc::mknod(
                cpath.as_ptr(),
                (mode & !umask) as libc::mode_t,
                rdev as libc::dev_t,
            )
        };
        if res != 0 {
            reply.error(last_errno());
            return;
        }

        self.reply_entry(&vpath, &physical, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let (vpath, physical) = match self.child_physical(parent, name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("mkdir({})", physical.display());

        let cpath = match cstring(&physical) {
            Ok(c) => c,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let res = unsafe { libc::mkdir(cpath.as_ptr(), (mode & !umask) as libc::mode_t) };
        if res != 0 {
            reply.error(last_errno());
            return;
        }

        self.reply_entry(&vpath, &physical, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (vpath, physical) = match self.child_physical(parent, name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("unlink({})", physical.display());

        match fs::remove_file(&physical) {
            Ok(()) => {
                self.inodes.remove(&vpath);
                reply.ok();
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (vpath, physical) = match self.child_physical(parent, name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("rmdir({})", physical.display());

        match fs::remove_dir(&physical) {
            Ok(()) => {
                self.inodes.remove(&vpath);
                reply.ok();
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (vpath, physical) = match self.child_physical(parent, link_name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("symlink({} -> {})", physical.display(), target.display());

        if let Err(e) = std::os::unix::fs::symlink(target, &physical) {
            reply.error(io_errno(&e));
            return;
        }

        self.reply_entry(&vpath, &physical, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_vpath, old_physical) = match self.child_physical(parent, name) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let (new_vpath, new_physical) = match self.child_physical(newparent, newname) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!(
            "rename({} -> {})",
            old_physical.display(),
            new_physical.display()
        );

        match fs::rename(&old_physical, &new_physical) {
            Ok(()) => {
                self.inodes.remove(&new_vpath);
                self.inodes.rename(&old_vpath, &new_vpath);
                reply.ok();
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let source = self
            .inodes
            .path(ino)
            .ok_or(ENOENT)
            .map(str::to_string)
            .and_then(|vpath| self.physical(&vpath));
        let source = match source {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let (vpath, physical) = match self.child_physical(newparent, newname) {
            Ok(r) => r,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("link({} -> {})", source.display(), physical.display());

        if let Err(e) = fs::hard_link(&source, &physical) {
            reply.error(io_errno(&e));
            return;
        }

        self.reply_entry(&vpath, &physical, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let physical = self
            .inodes
            .path(ino)
            .ok_or(ENOENT)
            .map(str::to_string)
            .and_then(|vpath| self.physical(&vpath));
        let physical = match physical {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        trace!("open({}, flags={:#o})", physical.display(), flags);

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => options.read(true),
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        options.custom_flags(flags & !libc::O_ACCMODE);

        match options.open(&physical) {
            Ok(file) => {
                let fh = self.handles.insert(file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let mut buffer = vec![0u8; size as usize];
        match file.read_at(&mut buffer, offset as u64) {
            Ok(bytes_read) => reply.data(&buffer[..bytes_read]),
            Err(e) => {
                error!("read: I/O error: {}", e);
                reply.error(io_errno(&e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        match file.write_all_at(data, offset as u64) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                error!("write: I/O error: {}", e);
                reply.error(io_errno(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!("flush(fh={})", fh);

        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        // Passthrough flush: dup and close, so pending data reaches
        // the underlying file without invalidating the handle.
        let dup = unsafe { libc::dup(file.as_raw_fd()) };
        if dup < 0 {
            reply.error(last_errno());
            return;
        }
        unsafe { libc::close(dup) };
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(fh={})", fh);
        // Dropping the File closes the descriptor.
        self.handles.remove(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!("fsync(fh={}, datasync={})", fh, datasync);

        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={}, offset={})", ino, offset);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (FUSE_ROOT_ID, FileType::Directory, "..".to_string()),
        ];

        if ino == FUSE_ROOT_ID {
            // The catalog is read fresh on every listing, so branches
            // created or deleted after mount show up here.
            for branch in self.catalog.list_branches() {
                let ino = self.inodes.assign(&branch.name);
                entries.push((ino, FileType::Directory, branch.name));
            }
        } else {
            let vpath = match self.inodes.path(ino).map(str::to_string) {
                Some(p) => p,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            let physical = match self.physical(&vpath) {
                Ok(p) => p,
                Err(errno) => {
                    debug!("readdir: cannot resolve {:?}", vpath);
                    reply.error(errno);
                    return;
                }
            };
            let dir = match fs::read_dir(&physical) {
                Ok(d) => d,
                Err(e) => {
                    reply.error(io_errno(&e));
                    return;
                }
            };
            for entry in dir.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                let kind = entry
                    .file_type()
                    .map(file_type_of)
                    .unwrap_or(FileType::RegularFile);
                let child_vpath = if vpath.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", vpath, name)
                };
                let child_ino = self.inodes.assign(&child_vpath);
                entries.push((child_ino, kind, name));
            }
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // next offset = i + 1
            let full = reply.add(ino, (i + 1) as i64, kind, &name);
            if full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        trace!("statfs");

        let cpath = match cstring(&self.repo_root) {
            Ok(c) => c,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
        if res != 0 {
            reply.error(last_errno());
            return;
        }

        reply.statfs(
            stat.f_blocks as u64,
            stat.f_bfree as u64,
            stat.f_bavail as u64,
            stat.f_files as u64,
            stat.f_ffree as u64,
            stat.f_bsize as u32,
            stat.f_namemax as u32,
            stat.f_frsize as u32,
        );
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!("access(ino={}, mask={})", ino, mask);

        let vpath = match self.inodes.path(ino).map(str::to_string) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        // Root and unprovisioned branch directories are always
        // reachable; deeper paths ask the host filesystem.
        match self.resolver.resolve(&vpath) {
            Ok(Resolved::NamespaceRoot) | Ok(Resolved::BranchDirectory { .. }) => reply.ok(),
            Ok(Resolved::Inner { physical, .. }) => {
                let cpath = match cstring(&physical) {
                    Ok(c) => c,
                    Err(errno) => {
                        reply.error(errno);
                        return;
                    }
                };
                if unsafe { libc::access(cpath.as_ptr(), mask) } == 0 {
                    reply.ok();
                } else {
                    reply.error(last_errno());
                }
            }
            Err(e) => reply.error(resolve_errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        reply: fuser::ReplyLock,
    ) {
        // Lock-info queries are not supported, by contract.
        reply.error(EOPNOTSUPP);
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        trace!("setlk(ino={}, fh={}, typ={}, sleep={})", ino, fh, typ, sleep);

        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let mut op = match typ {
            libc::F_RDLCK => libc::LOCK_SH,
            libc::F_WRLCK => libc::LOCK_EX,
            libc::F_UNLCK => libc::LOCK_UN,
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        if !sleep && op != libc::LOCK_UN {
            op |= libc::LOCK_NB;
        }

        if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
            reply.ok();
        } else {
            reply.error(last_errno());
        }
    }
}

/// Map core resolution errors to FUSE error codes.
///
/// A failed provisioning makes the branch "unavailable": the entry is
/// reported as not found for this request, without affecting other
/// branches or the mount.
fn resolve_errno(err: &CoreError) -> i32 {
    match err {
        CoreError::ProvisioningFailed { branch, reason } => {
            warn!("branch '{}' unavailable: {}", branch, reason);
            ENOENT
        }
        CoreError::Unsupported(_) => EOPNOTSUPP,
        CoreError::Io(e) => e.raw_os_error().unwrap_or(EIO),
    }
}

fn io_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(EIO)
}

fn last_errno() -> i32 {
    io_errno(&io::Error::last_os_error())
}

fn cstring(path: &Path) -> Result<CString, i32> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| EINVAL)
}

fn file_type_of(ft: fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;

    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn kind_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn attr_from_metadata(ino: u64, meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: system_time(meta.ctime(), meta.ctime_nsec()),
        kind: kind_from_mode(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn timespec_from(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => {
            let since_epoch = t
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
            }
        }
    }
}

/// Mount the branch namespace of `repo_root` at `mount_point`.
///
/// This function blocks until the filesystem is unmounted.
///
/// # Errors
///
/// Returns an error if the repository root cannot be stat'ed, the
/// mount point is invalid, or FUSE mounting fails.
pub fn mount<P: AsRef<Path>>(repo_root: P, mount_point: P) -> io::Result<()> {
    let fs = BranchFuseFS::new(repo_root.as_ref())?;
    let mount_point = mount_point.as_ref();

    debug!(
        "mounting {} at {} with {} branches",
        repo_root.as_ref().display(),
        mount_point.display(),
        fs.branch_count()
    );

    fuser::mount2(fs, mount_point, &mount_options())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}

/// Mount in the background and return a session handle.
///
/// The filesystem stays mounted until the returned `BackgroundSession`
/// is dropped or `unmount()` is called on it.
pub fn mount_background<P: AsRef<Path>>(
    repo_root: P,
    mount_point: P,
) -> io::Result<fuser::BackgroundSession> {
    let fs = BranchFuseFS::new(repo_root.as_ref())?;
    let mount_point = mount_point.as_ref();

    debug!(
        "mounting {} at {} (background) with {} branches",
        repo_root.as_ref().display(),
        mount_point.display(),
        fs.branch_count()
    );

    fuser::spawn_mount2(fs, mount_point, &mount_options())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("branchfs".to_string()),
        MountOption::Subtype("branchfs".to_string()),
        MountOption::DefaultPermissions,
    ]
}
