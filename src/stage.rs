//! The stage plugin interface, the registry of known stages, and chains of
//! stages as resolved from the rule table.

use crate::hash::ChainId;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Build mode.  Threaded explicitly through rule resolution, chain execution
/// and cache keys; nothing reads it from the environment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Development,
    Production,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            _ => Err(format!(
                "unknown mode {:?}, expected development or production",
                s
            )),
        }
    }
}

/// A value that may differ between development and production.
#[derive(Debug, Clone, PartialEq)]
pub struct ByMode<T> {
    pub development: T,
    pub production: T,
}

impl<T: Clone> ByMode<T> {
    pub fn same(val: T) -> Self {
        ByMode {
            development: val.clone(),
            production: val,
        }
    }
}

impl<T> ByMode<T> {
    pub fn get(&self, mode: Mode) -> &T {
        match mode {
            Mode::Development => &self.development,
            Mode::Production => &self.production,
        }
    }
}

/// What a stage may know about the run it is part of.
/// Deliberately excludes the source path: stage output must depend only on
/// the input bytes and the mode, since cache keys carry nothing else.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub mode: Mode,
}

/// An artifact produced as a byproduct of a stage, e.g. an extracted style
/// sheet.  Named after the source file it came from, with extension `ext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideOutput {
    pub ext: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct StageOutput {
    pub content: Vec<u8>,
    pub side: Vec<SideOutput>,
}

impl StageOutput {
    pub fn new(content: Vec<u8>) -> Self {
        StageOutput {
            content,
            side: Vec::new(),
        }
    }

    pub fn with_side(mut self, ext: &str, content: Vec<u8>) -> Self {
        self.side.push(SideOutput {
            ext: ext.to_string(),
            content,
        });
        self
    }
}

/// A single transformation step.  Implementations must be pure: the same
/// input and context always produce the same output.
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;

    fn transform(&self, input: &[u8], ctx: &StageContext) -> anyhow::Result<StageOutput>;

    /// References to other source files found in `input`, as written there.
    /// Used to discover the static dependency closure before building.
    fn scan(&self, _input: &[u8]) -> Vec<String> {
        Vec::new()
    }

    /// Whether the references `scan` finds are URLs that should be rewritten
    /// to the emitted paths of their targets.
    fn rewrites(&self) -> bool {
        false
    }
}

/// The static table of stages, keyed by id.  Populated once at startup.
#[derive(Default)]
pub struct StageRegistry {
    stages: FxHashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        StageRegistry::default()
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) -> anyhow::Result<()> {
        let id = stage.id().to_string();
        if self.stages.contains_key(&id) {
            anyhow::bail!("stage {:?} registered twice", id);
        }
        self.stages.insert(id, stage);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.stages.keys().map(|id| id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

/// An ordered list of stages, run left to right.
#[derive(Clone)]
pub struct Chain {
    stages: Vec<Arc<dyn Stage>>,
    /// suffix_ids[i] identifies stages[i..].
    suffix_ids: Vec<ChainId>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        let suffix_ids = (0..stages.len())
            .map(|i| ChainId::of(stages[i..].iter().map(|s| s.id())))
            .collect();
        Chain { stages, suffix_ids }
    }

    /// The chain that passes content through untouched.
    pub fn empty() -> Self {
        Chain::new(Vec::new())
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Identity of the chain remaining from stage `i` on.
    pub fn identity(&self, i: usize) -> ChainId {
        self.suffix_ids[i]
    }

    pub fn ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id()).collect()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stages.is_empty() {
            return write!(f, "(copy)");
        }
        write!(f, "{}", self.ids().join(" -> "))
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain({})", self)
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.suffix_ids.first() == other.suffix_ids.first()
    }
}
