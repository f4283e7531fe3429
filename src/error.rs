//! Build errors.
//!
//! Every report names the offending file, and stage failures also name the
//! stage, so a user can go straight from a message to the rule to fix.

use crate::cache::CacheKey;

/// No configured rule matches a path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: no rule matches")]
pub struct NoMatch {
    pub path: String,
}

/// A transform stage failed on a file.
#[derive(Debug, thiserror::Error)]
#[error("{path}: stage {stage}: {cause:#}")]
pub struct StageError {
    pub path: String,
    pub stage: String,
    pub cause: anyhow::Error,
}

/// An edge from `from` to `to` would close a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{from}: depending on {to} would create a dependency cycle")]
pub struct CycleError {
    pub from: String,
    pub to: String,
}

/// A cache entry failed verification on read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache entry {key:?} failed verification and was purged")]
pub struct CacheCorruption {
    pub key: CacheKey,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    NoMatch(#[from] NoMatch),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    CacheCorruption(#[from] CacheCorruption),
    #[error("entry {path}: file not found")]
    MissingEntry { path: String },
    #[error("{from}: reference {reference:?} not found")]
    MissingReference { from: String, reference: String },
    #[error("rule {rule}: unknown stage {stage:?}")]
    UnknownStage { rule: String, stage: String },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// The file the error is about.
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::NoMatch(e) => Some(&e.path),
            Error::Stage(e) => Some(&e.path),
            Error::Cycle(e) => Some(&e.from),
            Error::CacheCorruption(_) | Error::UnknownStage { .. } => None,
            Error::MissingEntry { path } | Error::Io { path, .. } => Some(path),
            Error::MissingReference { from, .. } => Some(from),
        }
    }
}
