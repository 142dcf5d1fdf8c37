//! Staged directory trees.
//!
//! Entries are registered first and written to disk by [`Manager::create`]
//! or [`Manager::update`]. Each sync only touches entries not written yet,
//! so a tree can be topped up as assembly goes on.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, chown, fchown, lchown, symlink};
use std::path::{Component, Path, PathBuf};

use carapace_common::{CarapaceError, CarapaceResult};

const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Dir,
    File(Vec<u8>),
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct Entry {
    kind: Kind,
    mode: u32,
    uid: u32,
    gid: u32,
    created: bool,
}

/// Lexically clean an absolute path, resolving `.` and `..`.
pub fn clean(path: impl AsRef<Path>) -> CarapaceResult<PathBuf> {
    let path = path.as_ref();
    if !path.is_absolute() {
        return Err(CarapaceError::layout(format!(
            "{} is not an absolute path",
            path.display()
        )));
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

/// A staged directory tree rooted at a host path.
#[derive(Debug)]
pub struct Manager {
    root: PathBuf,
    entries: HashMap<PathBuf, Entry>,
    dirs: Vec<PathBuf>,
    others: Vec<PathBuf>,
    uid: u32,
    gid: u32,
}

impl Manager {
    /// Stage a tree under the existing directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> CarapaceResult<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(CarapaceError::layout(format!(
                "layout root {} must be absolute",
                root.display()
            )));
        }
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let mut entries = HashMap::new();
        entries.insert(
            PathBuf::from("/"),
            Entry {
                kind: Kind::Dir,
                mode: DEFAULT_DIR_MODE,
                uid,
                gid,
                created: true,
            },
        );
        Ok(Self {
            root,
            entries,
            dirs: vec![PathBuf::from("/")],
            others: Vec::new(),
            uid,
            gid,
        })
    }

    /// Host directory the tree is materialized in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is staged.
    #[must_use]
    pub fn has(&self, path: impl AsRef<Path>) -> bool {
        clean(path).is_ok_and(|p| self.entries.contains_key(&p))
    }

    /// Host path of a staged entry.
    pub fn get_path(&self, path: impl AsRef<Path>) -> CarapaceResult<PathBuf> {
        let path = clean(path)?;
        if !self.entries.contains_key(&path) {
            return Err(CarapaceError::layout(format!(
                "{} is not staged",
                path.display()
            )));
        }
        Ok(self.host_path(&path))
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) if !rel.as_os_str().is_empty() => self.root.join(rel),
            _ => self.root.clone(),
        }
    }

    fn insert(&mut self, path: &Path, kind: Kind, mode: u32) -> CarapaceResult<()> {
        let path = clean(path)?;
        if self.entries.contains_key(&path) {
            return Err(CarapaceError::layout(format!(
                "{} is already staged",
                path.display()
            )));
        }

        let mut ancestor = PathBuf::from("/");
        let parents: Vec<_> = path.parent().into_iter().flat_map(Path::components).collect();
        for component in parents {
            if let Component::Normal(c) = component {
                ancestor.push(c);
            } else {
                continue;
            }
            match self.entries.get(&ancestor) {
                Some(e) if e.kind == Kind::Dir => {}
                Some(_) => {
                    return Err(CarapaceError::layout(format!(
                        "{} is not a directory",
                        ancestor.display()
                    )));
                }
                None => self.stage(ancestor.clone(), Kind::Dir, DEFAULT_DIR_MODE),
            }
        }

        self.stage(path, kind, mode);
        Ok(())
    }

    fn stage(&mut self, path: PathBuf, kind: Kind, mode: u32) {
        if kind == Kind::Dir {
            self.dirs.push(path.clone());
        } else {
            self.others.push(path.clone());
        }
        self.entries.insert(
            path,
            Entry {
                kind,
                mode,
                uid: self.uid,
                gid: self.gid,
                created: false,
            },
        );
    }

    /// Stage a directory with mode 0755.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) -> CarapaceResult<()> {
        self.insert(path.as_ref(), Kind::Dir, DEFAULT_DIR_MODE)
    }

    /// Stage a file with the given content and mode 0644.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) -> CarapaceResult<()> {
        self.insert(path.as_ref(), Kind::File(content.into()), 0o644)
    }

    /// Stage a symlink to `target`.
    pub fn add_symlink(
        &mut self,
        path: impl AsRef<Path>,
        target: impl Into<PathBuf>,
    ) -> CarapaceResult<()> {
        self.insert(path.as_ref(), Kind::Symlink(target.into()), 0o777)
    }

    fn entry_mut(&mut self, path: &Path) -> CarapaceResult<&mut Entry> {
        let path = clean(path)?;
        self.entries
            .get_mut(&path)
            .ok_or_else(|| CarapaceError::layout(format!("{} is not staged", path.display())))
    }

    /// Change the mode of a staged entry.
    pub fn chmod(&mut self, path: impl AsRef<Path>, mode: u32) -> CarapaceResult<()> {
        self.entry_mut(path.as_ref())?.mode = mode;
        Ok(())
    }

    /// Change the owner of a staged entry.
    pub fn chown(&mut self, path: impl AsRef<Path>, uid: u32, gid: u32) -> CarapaceResult<()> {
        let entry = self.entry_mut(path.as_ref())?;
        entry.uid = uid;
        entry.gid = gid;
        Ok(())
    }

    /// Write every staged entry to disk.
    pub fn create(&mut self) -> CarapaceResult<usize> {
        self.sync()
    }

    /// Write entries staged since the last sync.
    pub fn update(&mut self) -> CarapaceResult<usize> {
        self.sync()
    }

    fn owner_differs(&self, entry: &Entry) -> bool {
        entry.uid != self.uid || entry.gid != self.gid
    }

    fn sync(&mut self) -> CarapaceResult<usize> {
        let mut written = 0;

        for path in self.dirs.clone() {
            let Some(entry) = self.entries.get(&path).cloned() else {
                continue;
            };
            if entry.created {
                continue;
            }
            let host = self.host_path(&path);
            match fs::create_dir(&host) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && host.is_dir() => {}
                Err(e) => return Err(self.io_error(&host, &e)),
            }
            fs::set_permissions(&host, fs::Permissions::from_mode(entry.mode))
                .map_err(|e| self.io_error(&host, &e))?;
            if self.owner_differs(&entry) {
                chown(&host, Some(entry.uid), Some(entry.gid)).map_err(|e| self.io_error(&host, &e))?;
            }
            self.mark_created(&path);
            written += 1;
        }

        for path in self.others.clone() {
            let Some(entry) = self.entries.get(&path).cloned() else {
                continue;
            };
            if entry.created {
                continue;
            }
            let host = self.host_path(&path);
            match &entry.kind {
                Kind::File(content) => {
                    let mut file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(entry.mode)
                        .open(&host)
                        .map_err(|e| self.io_error(&host, &e))?;
                    file.write_all(content).map_err(|e| self.io_error(&host, &e))?;
                    file.set_permissions(fs::Permissions::from_mode(entry.mode))
                        .map_err(|e| self.io_error(&host, &e))?;
                    if self.owner_differs(&entry) {
                        fchown(&file, Some(entry.uid), Some(entry.gid))
                            .map_err(|e| self.io_error(&host, &e))?;
                    }
                }
                Kind::Symlink(target) => {
                    symlink(target, &host).map_err(|e| self.io_error(&host, &e))?;
                    if self.owner_differs(&entry) {
                        lchown(&host, Some(entry.uid), Some(entry.gid))
                            .map_err(|e| self.io_error(&host, &e))?;
                    }
                }
                Kind::Dir => {}
            }
            self.mark_created(&path);
            written += 1;
        }

        if written > 0 {
            tracing::debug!(root = %self.root.display(), written, "Synced layout");
        }
        Ok(written)
    }

    fn mark_created(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.created = true;
        }
    }

    fn io_error(&self, host: &Path, err: &io::Error) -> CarapaceError {
        CarapaceError::layout(format!(
            "can't create {} under {}: {err}",
            host.display(),
            self.root.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[test]
    fn clean_resolves_dots() {
        assert_eq!(clean("/a/./b/../c/").unwrap(), PathBuf::from("/a/c"));
        assert_eq!(clean("/../..").unwrap(), PathBuf::from("/"));
        assert!(clean("relative").is_err());
    }

    #[test]
    fn ancestors_are_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = Manager::new(dir.path()).unwrap();
        layout.add_file("/etc/ssl/certs/ca.pem", "pem").unwrap();
        assert!(layout.has("/etc"));
        assert!(layout.has("/etc/ssl/certs"));

        assert_eq!(layout.create().unwrap(), 4);
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/ssl/certs/ca.pem")).unwrap(),
            "pem"
        );
    }

    #[test]
    fn duplicates_and_file_parents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = Manager::new(dir.path()).unwrap();
        layout.add_dir("/a").unwrap();
        assert!(layout.add_dir("/a/").is_err());
        layout.add_file("/f", "").unwrap();
        assert!(layout.add_dir("/f/child").is_err());
    }

    #[test]
    fn update_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = Manager::new(dir.path()).unwrap();
        layout.add_dir("/run").unwrap();
        assert_eq!(layout.create().unwrap(), 1);
        assert_eq!(layout.update().unwrap(), 0);
        assert_eq!(layout.update().unwrap(), 0);

        layout.add_symlink("/run/lock", "/tmp").unwrap();
        assert_eq!(layout.update().unwrap(), 1);
        assert_eq!(
            fs::read_link(dir.path().join("run/lock")).unwrap(),
            PathBuf::from("/tmp")
        );
    }

    #[test]
    fn chmod_applies_at_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = Manager::new(dir.path()).unwrap();
        layout.add_file("/script", "#!/bin/sh\n").unwrap();
        layout.chmod("/script", 0o700).unwrap();
        assert!(layout.chmod("/missing", 0o700).is_err());
        layout.create().unwrap();

        let meta = fs::metadata(dir.path().join("script")).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o700);
        assert_eq!(
            layout.get_path("/script").unwrap(),
            dir.path().join("script")
        );
    }
}
