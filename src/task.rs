//! Runs chain tasks on worker threads.
//! Unaware of the build graph; just chain execution and completion reports.

use crate::cache::Transformed;
use crate::chain::TransformChain;
use crate::error::StageError;
use crate::graph::NodeId;
use crate::hash::ContentHash;
use crate::stage::{Chain, Mode};
use crate::trace;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// Everything a worker needs to build one node.
pub struct Job {
    pub node: NodeId,
    /// Scheduler generation the job was started in; results from older
    /// generations are stale.
    pub generation: u64,
    pub path: String,
    pub content: Vec<u8>,
    pub chain: Chain,
    pub mode: Mode,
}

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished tasks in
    /// different tracks in a performance trace.
    pub tid: usize,
    pub node: NodeId,
    pub generation: u64,
    /// Hash of the content the task ran over.
    pub origin: ContentHash,
    pub span: (Instant, Instant),
    pub result: Result<Arc<Transformed>, StageError>,
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}
impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_job(
    chain: &TransformChain,
    job: &Job,
    origin: ContentHash,
    cancel: &AtomicBool,
) -> Result<Arc<Transformed>, StageError> {
    let run = || {
        chain.run_cancellable(&job.path, origin, &job.content, &job.chain, job.mode, cancel)
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(payload) => Err(StageError {
            path: job.path.clone(),
            stage: job.chain.to_string(),
            cause: anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    /// Cancel flag of the latest job per node, with that job's generation.
    cancels: FxHashMap<NodeId, (u64, Arc<AtomicBool>)>,
    parallelism: usize,
    chain: Arc<TransformChain>,
}

impl Runner {
    pub fn new(parallelism: usize, chain: Arc<TransformChain>) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::default(),
            cancels: FxHashMap::default(),
            parallelism: parallelism.max(1),
            chain,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, job: Job) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        let chain = self.chain.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels.insert(job.node, (job.generation, cancel.clone()));
        std::thread::spawn(move || {
            let start = Instant::now();
            let origin = ContentHash::of(&job.content);
            let result = run_job(&chain, &job, origin, &cancel);
            let finish = Instant::now();
            trace::write_complete(&job.path, tid, start, finish);

            let task = FinishedTask {
                tid,
                node: job.node,
                generation: job.generation,
                origin,
                span: (start, finish),
                result,
            };
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Ask the running job for `node` to stop at its next stage boundary.
    /// A stage already executing runs to completion, and the job keeps its
    /// slot until it reports back.
    pub fn cancel(&mut self, node: NodeId) {
        if let Some((_, flag)) = self.cancels.remove(&node) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Wait for a task to complete, with a timeout.
    /// If the timeout elapses return None.
    pub fn wait(&mut self, dur: Duration) -> Option<FinishedTask> {
        // The runner holds a sender itself, so the channel never disconnects.
        let task = self.finished_recv.recv_timeout(dur).ok()?;
        self.tids.release(task.tid);
        self.running -= 1;
        if self.cancels.get(&task.node).map(|(gen, _)| *gen) == Some(task.generation) {
            self.cancels.remove(&task.node);
        }
        Some(task)
    }
}
