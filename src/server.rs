//! The interface between the build core and a development server.
//!
//! The core calls `rebuild_complete` after every build round; a server feeds
//! changes back through `FileEvents`, e.g. for edits it makes itself or for
//! builds over a file system with no change notifications.

use crate::canon::canon_path;
use std::collections::BTreeMap;
use std::sync::mpsc;

/// What a build round produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Source path to emitted output paths, primary output first.  Covers
    /// every built node, not just this round's.
    pub outputs: BTreeMap<String, Vec<String>>,
    /// Sources rebuilt in this round.
    pub rebuilt: Vec<String>,
    /// Sources that failed in this round.
    pub failed: Vec<String>,
}

impl Manifest {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub trait DevServer {
    fn rebuild_complete(&mut self, manifest: &Manifest);
}

/// Handle for injecting change notifications into a watching orchestrator.
#[derive(Clone)]
pub struct FileEvents(mpsc::Sender<String>);

impl FileEvents {
    /// Report that the file at `path`, relative to the source root, changed.
    /// Returns false if the orchestrator is gone.
    pub fn file_changed(&self, path: &str) -> bool {
        self.0.send(canon_path(path)).is_ok()
    }
}

pub fn channel() -> (FileEvents, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    (FileEvents(tx), rx)
}
