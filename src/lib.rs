pub mod cache;
pub mod canon;
pub mod chain;
pub mod config;
pub mod error;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod orchestrate;
pub mod parse;
pub mod progress;
pub mod rules;
pub mod run;
pub mod scanner;
pub mod server;
mod signal;
pub mod stage;
pub mod stages;
mod task;
pub mod trace;
pub mod watch;
pub mod work;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
