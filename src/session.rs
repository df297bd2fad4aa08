//! Trace session: the per-process recorder context
//!
//! A session owns the call signature table, the grammar and the timestamp
//! store of one rank, plus the stitcher that turns enter/exit pairs into
//! completed calls. Nothing is global, so several sessions can run side by
//! side (one per simulated rank in tests).
//!
//! # Hot path
//!
//! ```text
//! on_call_exit ──► stitcher (thread-local FIFO)
//!                     │ outermost call returned
//!                     ▼
//!              ┌──────────── lock ────────────┐
//!              │ encode_key → intern → append │  per event, entry order
//!              │ timestamps.append            │
//!              └──────────────────────────────┘
//!                     │
//!                     ▼
//!              observers (outside the lock)
//! ```
//!
//! # Finalize
//!
//! flush timestamps → merge + remap → gather grammars and timestamps at
//! rank 0 (interprocess compression) → write files → rank 0 writes
//! `recorder.mt` and `VERSION`.
//!
//! A rank that fails locally still completes every collective step, sending
//! empty payloads in place of what it lost, and reports its error afterwards.

use crate::comm::Communicator;
use crate::config::{RecorderConfig, DEFAULT_TRACES_DIR};
use crate::cst::{CallSignature, CallSignatureTable};
use crate::error::{RecorderError, Result};
use crate::functions::FunctionTable;
use crate::grammar::Grammar;
use crate::merge;
use crate::persist::{self, TraceMetadata, UniqueGrammars};
use crate::record::CallEvent;
use crate::signature::{encode_key, KeyProjection};
use crate::stitcher::{CallStitcher, ExitOutcome};
use crate::timestamps::{self, TimestampStore};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives every completed call after it has been interned
///
/// Calls arrive in per-thread completion order. `recent` holds the most
/// recent terminal ids of the whole process, oldest first, ending with the
/// terminal of `signature`.
pub trait CallObserver: Send + Sync {
    fn on_call(&self, signature: &CallSignature, recent: &[i32]);
}

struct SessionState {
    cst: CallSignatureTable,
    grammar: Grammar,
    timestamps: TimestampStore,
    recent: VecDeque<i32>,
    records: u64,
}

/// Point-in-time copy of the compressed state
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub cst: CallSignatureTable,
    pub grammar: Grammar,
    pub records: u64,
}

/// What [`TraceSession::finalize`] wrote
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    pub rank: usize,
    pub dir: PathBuf,
    pub merged: bool,
    /// Signatures in the table this rank decodes with
    pub signatures: usize,
    pub rules: usize,
    pub records: u64,
    /// Distinct grammars across the group (rank 0, merged mode)
    pub distinct_grammars: Option<usize>,
}

/// Recorder context for one rank
pub struct TraceSession {
    config: RecorderConfig,
    projection: KeyProjection,
    rank: usize,
    nprocs: usize,
    start_ts: f64,
    stitcher: CallStitcher,
    state: Mutex<SessionState>,
    observers: RwLock<Vec<Arc<dyn CallObserver>>>,
}

impl TraceSession {
    /// # Example
    /// ```
    /// use iorecorder::config::RecorderConfig;
    /// use iorecorder::record::CallEvent;
    /// use iorecorder::session::TraceSession;
    ///
    /// let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
    /// for i in 0..10 {
    ///     let t = i as f64;
    ///     session.on_call_enter(CallEvent::with_args(1, 0, ["3", "4096"], t));
    ///     session.on_call_exit(1, t + 0.5, Some("4096".into()));
    /// }
    /// let snapshot = session.snapshot();
    /// assert_eq!(snapshot.cst.len(), 1);
    /// assert_eq!(snapshot.grammar.symbol_count(), 1);
    /// assert_eq!(snapshot.records, 10);
    /// ```
    ///
    /// `start_ts` is this rank's clock origin; each rank may use its own.
    /// Fails with [`RecorderError::Config`] when `config` does not validate.
    pub fn new(config: RecorderConfig, rank: usize, nprocs: usize, start_ts: f64) -> Result<Self> {
        config.validate()?;
        info!(
            "trace session started: rank {} of {}, resolution {}s",
            rank, nprocs, config.time_resolution
        );
        let state = SessionState {
            cst: CallSignatureTable::new(rank as i32),
            grammar: Grammar::new(),
            timestamps: TimestampStore::from_config(&config, start_ts),
            recent: VecDeque::with_capacity(config.recent_window),
            records: 0,
        };
        Ok(Self {
            projection: KeyProjection::from(&config),
            config,
            rank,
            nprocs,
            start_ts,
            stitcher: CallStitcher::new(),
            state: Mutex::new(state),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Output directory from the configuration, or [`DEFAULT_TRACES_DIR`]
    pub fn traces_dir(&self) -> PathBuf {
        self.config
            .traces_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TRACES_DIR))
    }

    /// Send timestamp spills to `path` instead of memory
    pub fn spill_timestamps_to(&self, path: impl AsRef<Path>) -> Result<()> {
        self.state.lock().timestamps.attach_scratch_file(path)
    }

    pub fn add_observer(&self, observer: Arc<dyn CallObserver>) {
        self.observers.write().push(observer);
    }

    /// A wrapped call has been entered; returns its depth
    pub fn on_call_enter(&self, event: CallEvent) -> u8 {
        self.stitcher.on_call_enter(event)
    }

    /// A wrapped call has returned on `thread_id`
    pub fn on_call_exit(&self, thread_id: u64, tend: f64, return_value: Option<String>) {
        if let ExitOutcome::Flush(events) = self.stitcher.on_call_exit(thread_id, tend, return_value) {
            self.write_batch(events);
        }
    }

    /// Record one completed call directly, bypassing the stitcher
    pub fn record(&self, event: CallEvent) {
        self.write_batch(vec![event]);
    }

    pub fn records(&self) -> u64 {
        self.state.lock().records
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            cst: state.cst.clone(),
            grammar: state.grammar.clone(),
            records: state.records,
        }
    }

    fn write_batch(&self, events: Vec<CallEvent>) {
        if events.len() > 1 {
            debug!("rank {}: flushing nested batch of {} calls", self.rank, events.len());
        }
        let notify = !self.observers.read().is_empty();
        let mut notifications = Vec::new();

        {
            let mut state = self.state.lock();
            let window = self.config.recent_window;
            for event in &events {
                let key = encode_key(event, self.projection);
                let terminal = state.cst.intern(&key);
                if let Err(e) = state.grammar.append(terminal) {
                    warn!("rank {}: call dropped from grammar: {}", self.rank, e);
                }
                state.timestamps.append(event.tstart, event.tend);
                state.records += 1;

                if window > 0 {
                    if state.recent.len() == window {
                        state.recent.pop_front();
                    }
                    state.recent.push_back(terminal);
                }
                if notify {
                    if let Some(signature) = state.cst.get(&key) {
                        let recent: Vec<i32> = state.recent.iter().copied().collect();
                        notifications.push((signature.clone(), recent));
                    }
                }
            }
        }

        if notifications.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for (signature, recent) in &notifications {
            for observer in &observers {
                observer.on_call(signature, recent);
            }
        }
    }

    /// [`finalize`](Self::finalize) into [`traces_dir`](Self::traces_dir)
    pub fn finalize_default(self, comm: &dyn Communicator, functions: &FunctionTable) -> Result<FinalizeReport> {
        let dir = self.traces_dir();
        self.finalize(comm, &dir, functions)
    }

    /// Flush, optionally merge across the group, and write the trace to `dir`
    ///
    /// Every rank of `comm` must call this. Collective steps run before any
    /// file is written and are completed even after a local failure, so one
    /// rank's error never stalls or empties the rest of the group.
    pub fn finalize(self, comm: &dyn Communicator, dir: &Path, functions: &FunctionTable) -> Result<FinalizeReport> {
        let in_flight = self.stitcher.in_flight();
        if in_flight > 0 {
            warn!("rank {}: {} calls still in flight at finalize are dropped", self.rank, in_flight);
        }

        let (cst, mut grammar, finished, records) = {
            let mut state = self.state.lock();
            let finished = state.timestamps.finish();
            let cst = std::mem::take(&mut state.cst);
            let grammar = std::mem::take(&mut state.grammar);
            (cst, grammar, finished, state.records)
        };

        let mut local_error: Option<RecorderError> = None;
        let raw_ts = match finished {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("rank {}: timestamps lost: {}", self.rank, e);
                local_error = Some(e);
                None
            }
        };

        if !self.config.interprocess_compression {
            return self.finish_local(dir, cst, grammar, raw_ts, records, functions, local_error);
        }

        // Collective phase: every step runs on every rank
        let global = merge::merge_tables(&cst, comm)?;
        let remapped = merge::translation_table(&cst, &global).and_then(|t| grammar.remap(&t));
        let grammar_bytes = match remapped {
            Ok(()) => grammar.to_bytes(),
            Err(e) => {
                warn!("rank {}: grammar not remapped: {}", self.rank, e);
                local_error.get_or_insert(e);
                Vec::new()
            }
        };
        let unique = merge::gather_unique_grammars(&grammar_bytes, comm)?;
        let ts_payload = raw_ts
            .map(|raw| timestamps::encode_payload(self.start_ts, &raw))
            .unwrap_or_default();
        let gathered_ts = comm.gather(0, &ts_payload)?;

        // Local phase: rank 0 owns every merged file
        let written = match (&unique, &gathered_ts) {
            (Some(unique), Some(payloads)) => self.write_merged(dir, &global, unique, payloads, functions),
            _ => Ok(()),
        };
        if let Err(e) = written {
            warn!("rank {}: trace not persisted: {}", self.rank, e);
            local_error.get_or_insert(e);
        }
        if let Some(e) = local_error {
            return Err(e);
        }

        if self.rank == 0 {
            info!("rank 0: merged trace written to {}", dir.display());
        }
        Ok(FinalizeReport {
            rank: self.rank,
            dir: dir.to_path_buf(),
            merged: true,
            signatures: global.len(),
            rules: grammar.rule_count(),
            records,
            distinct_grammars: unique.map(|u| u.grammars.len()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_local(
        &self,
        dir: &Path,
        cst: CallSignatureTable,
        grammar: Grammar,
        raw_ts: Option<Vec<u32>>,
        records: u64,
        functions: &FunctionTable,
        mut local_error: Option<RecorderError>,
    ) -> Result<FinalizeReport> {
        let written = self.write_local(dir, &cst, &grammar, raw_ts.as_deref(), functions);
        if let Err(e) = written {
            warn!("rank {}: trace not persisted: {}", self.rank, e);
            local_error.get_or_insert(e);
        }
        if let Some(e) = local_error {
            return Err(e);
        }

        info!("rank {}: trace written to {}", self.rank, dir.display());
        Ok(FinalizeReport {
            rank: self.rank,
            dir: dir.to_path_buf(),
            merged: false,
            signatures: cst.len(),
            rules: grammar.rule_count(),
            records,
            distinct_grammars: None,
        })
    }

    /// `<rank>.cst`, `<rank>.cfg` and, when captured, `<rank>.ts`
    fn write_local(
        &self,
        dir: &Path,
        cst: &CallSignatureTable,
        grammar: &Grammar,
        raw_ts: Option<&[u32]>,
        functions: &FunctionTable,
    ) -> Result<()> {
        fs::create_dir_all(dir)?;
        persist::write_cst(&persist::cst_path(dir, self.rank), cst)?;
        persist::write_grammar(&persist::cfg_path(dir, self.rank), grammar)?;
        if let Some(raw) = raw_ts {
            persist::write_timestamps(&persist::ts_path(dir, self.rank), self.start_ts, raw, self.config.ts_compression)?;
        }
        if self.rank == 0 {
            self.write_session_files(dir, functions)?;
        }
        Ok(())
    }

    fn write_merged(
        &self,
        dir: &Path,
        global: &CallSignatureTable,
        unique: &UniqueGrammars,
        payloads: &[Vec<u8>],
        functions: &FunctionTable,
    ) -> Result<()> {
        fs::create_dir_all(dir)?;
        persist::write_cst(&dir.join(persist::MERGED_CST_FILE), global)?;
        persist::write_unique_grammars(dir, unique)?;
        persist::write_merged_timestamps(dir, payloads, self.config.ts_compression)?;
        self.write_session_files(dir, functions)
    }

    fn write_session_files(&self, dir: &Path, functions: &FunctionTable) -> Result<()> {
        TraceMetadata::new(&self.config, self.nprocs, self.start_ts, functions).write(dir)?;
        persist::write_version(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;
    use crate::reader::TraceReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_config() -> RecorderConfig {
        RecorderConfig {
            interprocess_compression: false,
            ..Default::default()
        }
    }

    fn call(session: &TraceSession, tid: u64, func: i32, arg: &str, t: f64) {
        session.on_call_enter(CallEvent::with_args(tid, func, [arg], t));
        session.on_call_exit(tid, t + 0.25, None);
    }

    #[test]
    fn test_repeated_calls_share_a_signature() {
        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "a.dat", 0.0);
        for i in 0..100 {
            call(&session, 1, 1, "4096", 1.0 + i as f64);
        }
        call(&session, 1, 2, "3", 200.0);

        let snap = session.snapshot();
        assert_eq!(snap.cst.len(), 3);
        assert_eq!(snap.records, 102);
        assert_eq!(snap.grammar.symbol_count(), 3);
    }

    #[test]
    fn test_nested_calls_get_depths() {
        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        session.on_call_enter(CallEvent::with_args(1, 10, ["d"], 0.0));
        session.on_call_enter(CallEvent::with_args(1, 20, ["f"], 0.1));
        session.on_call_exit(1, 0.2, None);
        assert_eq!(session.records(), 0);
        session.on_call_exit(1, 0.3, None);

        let snap = session.snapshot();
        let depths: Vec<u8> = snap.cst.iter().map(|s| s.decode().unwrap().depth).collect();
        assert_eq!(depths, vec![0, 1]);
    }

    #[test]
    fn test_thread_id_projection() {
        let config = RecorderConfig {
            store_tid: true,
            ..Default::default()
        };
        let session = TraceSession::new(config, 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "x", 0.0);
        call(&session, 2, 0, "x", 1.0);
        assert_eq!(session.snapshot().cst.len(), 2);

        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "x", 0.0);
        call(&session, 2, 0, "x", 1.0);
        assert_eq!(session.snapshot().cst.len(), 1);
    }

    struct Counter {
        calls: AtomicUsize,
        last_window: parking_lot::Mutex<Vec<i32>>,
    }

    impl CallObserver for Counter {
        fn on_call(&self, signature: &CallSignature, recent: &[i32]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(recent.last(), Some(&signature.terminal_id));
            *self.last_window.lock() = recent.to_vec();
        }
    }

    #[test]
    fn test_observer_sees_recent_window() {
        let config = RecorderConfig {
            recent_window: 3,
            ..Default::default()
        };
        let session = TraceSession::new(config, 0, 1, 0.0).unwrap();
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            last_window: parking_lot::Mutex::new(Vec::new()),
        });
        session.add_observer(counter.clone());

        for (i, func) in [0, 1, 2, 3].into_iter().enumerate() {
            call(&session, 1, func, "x", i as f64);
        }
        assert_eq!(counter.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*counter.last_window.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_threads() {
        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        std::thread::scope(|scope| {
            for tid in 0..4u64 {
                let session = &session;
                scope.spawn(move || {
                    for i in 0..250 {
                        call(session, tid, (i % 3) as i32, "buf", i as f64);
                    }
                });
            }
        });

        let snap = session.snapshot();
        assert_eq!(snap.records, 1000);
        assert_eq!(snap.grammar.expanded_len(), 1000);
        assert_eq!(snap.cst.total_calls(), 1000);
        assert!(snap.grammar.check_invariants().is_ok());
    }

    #[test]
    fn test_finalize_local_mode() {
        let dir = tempfile::tempdir().unwrap();
        let session = TraceSession::new(local_config(), 0, 1, 5.0).unwrap();
        call(&session, 1, 0, "a.dat", 5.0);
        call(&session, 1, 1, "4096", 6.0);

        let functions = FunctionTable::new(["open", "write"]);
        let report = session.finalize(&SingleProcess, dir.path(), &functions).unwrap();
        assert!(!report.merged);
        assert_eq!(report.records, 2);
        for name in ["0.cst", "0.cfg", "0.ts", "recorder.mt", "VERSION"] {
            assert!(dir.path().join(name).exists(), "{} missing", name);
        }

        let records = TraceReader::open(dir.path()).unwrap().read_records(0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].call_text(), "write(4096)");
        assert!((records[1].tstart - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_finalize_merged_single_process() {
        let dir = tempfile::tempdir().unwrap();
        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "x", 0.0);

        let report = session
            .finalize(&SingleProcess, dir.path(), &FunctionTable::default())
            .unwrap();
        assert!(report.merged);
        assert_eq!(report.distinct_grammars, Some(1));
        for name in ["recorder.cst", "recorder.ts", "ug.cfg", "ug.idx"] {
            assert!(dir.path().join(name).exists(), "{} missing", name);
        }
        assert!(!dir.path().join("0.cst").exists());
        assert!(!dir.path().join("0.cfg").exists());
    }

    #[test]
    fn test_zero_resolution_is_rejected() {
        let config = RecorderConfig {
            time_resolution: 0.0,
            ..Default::default()
        };
        let result = TraceSession::new(config, 0, 1, 0.0);
        assert!(matches!(result, Err(RecorderError::Config(_))));
    }

    #[test]
    fn test_traces_dir_defaults() {
        let session = TraceSession::new(RecorderConfig::default(), 0, 1, 0.0).unwrap();
        assert_eq!(session.traces_dir(), PathBuf::from(DEFAULT_TRACES_DIR));
    }

    #[test]
    fn test_finalize_default_uses_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let traces = dir.path().join("traces");
        let config = RecorderConfig {
            traces_dir: Some(traces.clone()),
            ..local_config()
        };
        let session = TraceSession::new(config, 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "x", 0.0);

        let report = session.finalize_default(&SingleProcess, &FunctionTable::default()).unwrap();
        assert_eq!(report.dir, traces);
        assert!(traces.join("0.cfg").exists());
        assert!(traces.join("recorder.mt").exists());
    }

    #[test]
    fn test_finalize_unwritable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        let session = TraceSession::new(local_config(), 0, 1, 0.0).unwrap();
        call(&session, 1, 0, "x", 0.0);
        let result = session.finalize(&SingleProcess, &blocker.join("trace"), &FunctionTable::default());
        assert!(matches!(result, Err(RecorderError::Io(_))));
    }
}
