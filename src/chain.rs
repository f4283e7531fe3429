//! Running a chain of stages over a file, consulting the cache before every
//! stage.
//!
//! Each stage boundary is cached separately: the key for stage i is the hash
//! of its input plus the identity of stages[i..].  When an edit leaves an
//! intermediate result unchanged, the rest of the chain comes from the cache.

use crate::cache::{ArtifactCache, CacheKey, Transformed};
use crate::error::StageError;
use crate::hash::ContentHash;
use crate::stage::{Chain, Mode, StageContext};
use crate::trace;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct TransformChain {
    cache: Arc<ArtifactCache>,
    /// Number of stage transforms actually executed (i.e. cache misses).
    executions: AtomicUsize,
}

impl TransformChain {
    pub fn new(cache: Arc<ArtifactCache>) -> Self {
        TransformChain {
            cache,
            executions: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Run `chain` over `input`, the content of the source at `path`.
    /// `origin` is the hash of that source version, recorded on every entry
    /// so the entries can be invalidated when the source changes.
    pub fn run(
        &self,
        path: &str,
        origin: ContentHash,
        input: &[u8],
        chain: &Chain,
        mode: Mode,
    ) -> Result<Arc<Transformed>, StageError> {
        self.run_cancellable(path, origin, input, chain, mode, &AtomicBool::new(false))
    }

    /// Like `run`, but gives up before the next stage once `cancel` is set.
    pub fn run_cancellable(
        &self,
        path: &str,
        origin: ContentHash,
        input: &[u8],
        chain: &Chain,
        mode: Mode,
        cancel: &AtomicBool,
    ) -> Result<Arc<Transformed>, StageError> {
        if chain.is_empty() {
            return Ok(Arc::new(Transformed {
                content: input.to_vec(),
                side: Vec::new(),
            }));
        }
        let run = Run {
            path,
            origin,
            chain,
            ctx: StageContext { mode },
            cancel,
        };
        self.run_from(&run, input, 0)
    }

    fn run_from(&self, run: &Run, input: &[u8], i: usize) -> Result<Arc<Transformed>, StageError> {
        let stage = &run.chain.stages()[i];
        if run.cancel.load(Ordering::SeqCst) {
            return Err(run.error(stage.id(), anyhow::anyhow!("cancelled")));
        }
        let key = CacheKey {
            content: ContentHash::of(input),
            chain: run.chain.identity(i),
            mode: run.ctx.mode,
        };
        let (value, _hit) = self.cache.get_or_try_insert(key, run.origin, || {
            let out = trace::scope(stage.id(), || stage.transform(input, &run.ctx))
                .map_err(|cause| run.error(stage.id(), cause))?;
            self.executions.fetch_add(1, Ordering::SeqCst);
            if i + 1 == run.chain.len() {
                return Ok(Transformed {
                    content: out.content,
                    side: out.side,
                });
            }
            let rest = self.run_from(run, &out.content, i + 1)?;
            let mut side = out.side;
            side.extend(rest.side.iter().cloned());
            Ok(Transformed {
                content: rest.content.clone(),
                side,
            })
        })?;
        Ok(value)
    }
}

/// One pass of a chain over a source file.
struct Run<'a> {
    path: &'a str,
    origin: ContentHash,
    chain: &'a Chain,
    ctx: StageContext,
    cancel: &'a AtomicBool,
}

impl Run<'_> {
    fn error(&self, stage: &str, cause: anyhow::Error) -> StageError {
        StageError {
            path: self.path.to_string(),
            stage: stage.to_string(),
            cause,
        }
    }
}
