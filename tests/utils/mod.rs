// Helpers for driving recorder sessions across an in-process rank group

#![allow(dead_code)]

use iorecorder::comm::{Communicator, LocalGroup};
use iorecorder::config::RecorderConfig;
use iorecorder::functions::FunctionTable;
use iorecorder::record::CallEvent;
use iorecorder::session::{FinalizeReport, TraceSession};
use iorecorder::Result;
use std::path::Path;
use std::sync::Arc;
use std::thread;

pub const OPEN: i32 = 0;
pub const WRITE: i32 = 1;
pub const CLOSE: i32 = 2;

pub fn io_functions() -> FunctionTable {
    FunctionTable::new(["open", "write", "close"])
}

/// Enter and leave one call on thread 1
pub fn call(session: &TraceSession, func: i32, args: &[&str], t: f64) {
    session.on_call_enter(CallEvent::with_args(1, func, args.iter().copied(), t));
    session.on_call_exit(1, t + 1e-4, None);
}

/// open("a.dat"), write x `writes`, close
pub fn io_phase(session: &TraceSession, file: &str, writes: usize) {
    let mut t = session.rank() as f64;
    call(session, OPEN, &[file, "O_WRONLY"], t);
    for _ in 0..writes {
        t += 1e-3;
        call(session, WRITE, &["3", "4096"], t);
    }
    call(session, CLOSE, &["3"], t + 1e-3);
}

/// Run one session per rank on its own thread and finalize into `dir`
pub fn run_group<F>(size: usize, config: RecorderConfig, dir: &Path, workload: F) -> Vec<FinalizeReport>
where
    F: Fn(&TraceSession) + Send + Sync + 'static,
{
    run_group_with(size, config, dir, |_| 0.0, workload)
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

/// Like [`run_group`], with a per-rank clock origin and the raw finalize results
pub fn run_group_with<S, F>(
    size: usize,
    config: RecorderConfig,
    dir: &Path,
    start_ts: S,
    workload: F,
) -> Vec<Result<FinalizeReport>>
where
    S: Fn(usize) -> f64,
    F: Fn(&TraceSession) + Send + Sync + 'static,
{
    let workload = Arc::new(workload);
    let handles: Vec<_> = LocalGroup::new(size)
        .into_iter()
        .map(|ep| {
            let config = config.clone();
            let dir = dir.to_path_buf();
            let workload = Arc::clone(&workload);
            let start = start_ts(ep.rank());
            thread::spawn(move || {
                let session = TraceSession::new(config, ep.rank(), ep.size(), start)?;
                workload(&session);
                session.finalize(&ep, &dir, &io_functions())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
