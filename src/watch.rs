//! Change detection for watch mode.  Disk changes arrive through a `notify`
//! debouncer, and a development server can inject its own notifications
//! through `server::FileEvents`; both land on the same channel.

use crate::canon::canon_path;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// `path` relative to `root`, as a canonical source path.
fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.to_str()?;
    if rel.is_empty() {
        return None;
    }
    Some(canon_path(&rel.replace('\\', "/")))
}

pub struct ChangeFeed {
    root: PathBuf,
    /// Source paths (relative to root) that changes are reported for.
    watched: BTreeSet<String>,
    send: mpsc::Sender<String>,
    recv: mpsc::Receiver<String>,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
}

impl ChangeFeed {
    pub fn new(root: &Path) -> Self {
        let (send, recv) = mpsc::channel();
        ChangeFeed {
            root: root.to_path_buf(),
            watched: BTreeSet::new(),
            send,
            recv,
            debouncer: None,
        }
    }

    /// Also report the paths arriving on `events`.
    pub fn with_events(self, events: mpsc::Receiver<String>) -> Self {
        let send = self.send.clone();
        std::thread::spawn(move || {
            for path in events {
                if send.send(path).is_err() {
                    break;
                }
            }
        });
        self
    }

    /// Watch the root directory on disk.  Changes are reported once no
    /// further event arrived for `debounce`.
    pub fn watch_disk(&mut self, debounce: Duration) -> Result<(), notify::Error> {
        let root = std::fs::canonicalize(&self.root).map_err(notify::Error::io)?;
        let send = self.send.clone();
        let base = root.clone();
        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| {
            // Watch errors are dropped; later events still arrive.
            let events = match res {
                Ok(events) => events,
                Err(_) => return,
            };
            for event in events {
                if !matches!(event.kind, DebouncedEventKind::Any) {
                    continue;
                }
                if let Some(path) = relative(&base, &event.path) {
                    let _ = send.send(path);
                }
            }
        })?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
        self.debouncer = Some(debouncer);
        Ok(())
    }

    /// Replace the set of paths changes are reported for.
    pub fn set_watched(&mut self, paths: impl IntoIterator<Item = String>) {
        self.watched = paths.into_iter().collect();
    }

    /// Changes to watched paths reported so far.  Sorted and deduplicated.
    pub fn poll(&mut self) -> Vec<String> {
        let mut changed = BTreeSet::new();
        while let Ok(path) = self.recv.try_recv() {
            if self.watched.contains(&path) {
                changed.insert(path);
            }
        }
        changed.into_iter().collect()
    }

    /// Wait up to `timeout` for a change to a watched path, then return it
    /// along with anything else already reported.  Empty on timeout.
    pub fn wait(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let path = match self.recv.recv_timeout(left) {
                Ok(path) => path,
                Err(_) => return Vec::new(),
            };
            if self.watched.contains(&path) {
                let mut changed = self.poll();
                if let Err(idx) = changed.binary_search(&path) {
                    changed.insert(idx, path);
                }
                return changed;
            }
        }
    }
}
