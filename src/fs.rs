//! File system access, behind a trait so builds can run against memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MTime {
    Missing,
    Stamp(SystemTime),
}

/// `rel` (a canonical relative path) under `root`.  A root of "." is
/// dropped, so paths stay in the same form callers of a FileSystem used.
pub fn under(root: &Path, rel: &str) -> PathBuf {
    if root.as_os_str().is_empty() || root == Path::new(".") {
        PathBuf::from(rel)
    } else {
        root.join(rel)
    }
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
    /// Write a file, creating parent directories as needed.
    fn write(&self, path: &Path, content: &[u8]) -> std::io::Result<()>;
    /// stat() a path, producing its MTime.
    fn stat(&self, path: &Path) -> std::io::Result<MTime>;
    /// Remove a directory tree; a missing directory is not an error.
    fn remove_dir(&self, path: &Path) -> std::io::Result<()>;
    /// Whether changes to these files show up as OS file notifications.
    fn is_on_disk(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct RealFileSystem {}
impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn stat(&self, path: &Path) -> std::io::Result<MTime> {
        Ok(match std::fs::metadata(path) {
            Ok(meta) => MTime::Stamp(meta.modified()?),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    MTime::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }

    fn is_on_disk(&self) -> bool {
        true
    }
}

struct File {
    content: Vec<u8>,
    mtime: SystemTime,
}

#[derive(Default)]
struct Files {
    files: BTreeMap<PathBuf, File>,
    /// Bumped on every write, so each write gets a distinct mtime.
    clock: u64,
}

/// Implementation of FileSystem that is memory-backed.
#[derive(Default)]
pub struct MemoryFileSystem {
    state: Mutex<Files>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        MemoryFileSystem::default()
    }

    fn files(&self) -> std::sync::MutexGuard<'_, Files> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut state = self.files();
        state.clock += 1;
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(state.clock);
        state.files.insert(
            path.as_ref().to_path_buf(),
            File {
                content: content.into(),
                mtime,
            },
        );
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.files().files.remove(path.as_ref());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files()
            .files
            .get(path.as_ref())
            .map(|f| f.content.clone())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files().files.keys().cloned().collect()
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        match self.files().files.get(path) {
            Some(file) => Ok(file.content.clone()),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }

    fn write(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
        self.add(path, content);
        Ok(())
    }

    fn stat(&self, path: &Path) -> std::io::Result<MTime> {
        Ok(match self.files().files.get(path) {
            Some(file) => MTime::Stamp(file.mtime),
            None => MTime::Missing,
        })
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        self.files().files.retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}
