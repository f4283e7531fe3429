//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::error::Error;
use crate::graph::Artifact;
use crate::stage::Chain;
use crate::work::StateCounts;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as nodes progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a node's chain starts running.
    fn task_started(&mut self, path: &str, chain: &Chain);

    /// Called when a node completes, successfully or not.
    fn task_finished(&mut self, path: &str, result: Result<&Artifact, &Error>);

    /// Log a line of output.  For example, used when a task fails or when
    /// watch mode notices a change.
    fn log(&mut self, msg: &str);
}

/// Progress implementation for the console, printing one line per event
/// without any overprinting.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print the chain of each started task.
    verbose: bool,
    counts: StateCounts,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress {
            verbose,
            counts: StateCounts::default(),
        }
    }
}

/// "[done/total]" prefix for a status line.
fn status(counts: &StateCounts) -> String {
    format!("[{}/{}]", counts.finished(), counts.total())
}

impl Progress for ConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
    }

    fn task_started(&mut self, path: &str, chain: &Chain) {
        if self.verbose {
            self.log(&format!("{} {}: {}", status(&self.counts), path, chain));
        }
    }

    fn task_finished(&mut self, path: &str, result: Result<&Artifact, &Error>) {
        match result {
            Ok(artifact) => {
                let msg = match &artifact.output {
                    Some(output) => format!("{} {} -> {}", status(&self.counts), path, output),
                    None => format!("{} {}", status(&self.counts), path),
                };
                self.log(&msg);
            }
            Err(err) => self.log(&format!("failed: {}", err)),
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}
