//! Chrome trace output.
//!
//! Workers trace their stages from many threads, so events go through a
//! mutex; the enabled flag keeps the untraced path to a single atomic load.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"name\": {:?}, \"tid\": {}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }}",
            name,
            tid,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros()
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let (start, end) = (self.start, Instant::now());
        self.write_complete("main", 0, start, end)?;
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

fn with_trace(f: impl FnOnce(&mut Trace) -> std::io::Result<()>) -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_mut() {
        Some(trace) => f(trace),
        None => Ok(()),
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    ENABLED.store(true, Ordering::SeqCst);
    Ok(())
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Record a complete event that was timed elsewhere, e.g. a task on a
/// worker thread.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    if !enabled() {
        return;
    }
    // Tracing is best effort; a failed write must not fail the build.
    let _ = with_trace(|t| {
        t.write_complete(name, tid, start, end)?;
        writeln!(t.w, ",")
    });
}

#[inline]
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    write_complete(name, 0, start, Instant::now());
    result
}

pub fn close() -> std::io::Result<()> {
    ENABLED.store(false, Ordering::SeqCst);
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    match guard.take() {
        Some(mut trace) => trace.close(),
        None => Ok(()),
    }
}
