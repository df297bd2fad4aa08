//! Offline trace reader
//!
//! Loads one rank's signature table, grammar and timestamps, then replays
//! the grammar to rebuild every call in order. Decoding is lazy and can be
//! restarted by calling [`decode`] again on the same parts.

use crate::cst::CallSignatureTable;
use crate::error::{RecorderError, Result};
use crate::functions::FunctionTable;
use crate::grammar::{Expansion, Grammar};
use crate::persist::{self, TraceMetadata, UniqueGrammars};
use crate::record::CallRecord;
use crate::signature::{decode_key, DecodedKey};
use crate::timestamps::TimestampStream;
use fnv::FnvHashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything needed to decode one rank
#[derive(Debug, Clone)]
pub struct TraceParts {
    pub rank: usize,
    pub cst: CallSignatureTable,
    pub grammar: Grammar,
    pub timestamps: TimestampStream,
}

/// Handle on a finalized trace directory
#[derive(Debug)]
pub struct TraceReader {
    dir: PathBuf,
    metadata: TraceMetadata,
    functions: FunctionTable,
    merged: Option<MergedFiles>,
}

/// Rank-0 files of a merged trace, shared by every rank
#[derive(Debug)]
struct MergedFiles {
    cst: CallSignatureTable,
    grammars: UniqueGrammars,
    timestamps: Vec<Vec<u8>>,
}

impl TraceReader {
    /// Open a trace directory, refusing incompatible format versions
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        persist::check_version(&dir)?;
        let metadata = TraceMetadata::read(&dir)?;
        let functions = metadata.function_table();

        let merged = if metadata.merged() {
            Some(MergedFiles::read(&dir, &metadata)?)
        } else {
            None
        };

        debug!(
            "opened trace {} ({} ranks, merged: {})",
            dir.display(),
            metadata.total_ranks,
            metadata.merged()
        );
        Ok(Self {
            dir,
            metadata,
            functions,
            merged,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &TraceMetadata {
        &self.metadata
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn ranks(&self) -> usize {
        self.metadata.total_ranks as usize
    }

    /// Load the signature table, grammar and timestamps of `rank`
    pub fn read(&self, rank: usize) -> Result<TraceParts> {
        if rank >= self.ranks() {
            return Err(RecorderError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("rank {} not in a trace of {} ranks", rank, self.ranks()),
            )));
        }

        let (cst, grammar, ts_payload) = match &self.merged {
            Some(merged) => (
                merged.cst.clone(),
                Grammar::from_bytes(merged.grammars.for_rank(rank)?)?,
                merged.timestamps[rank].clone(),
            ),
            None => (
                persist::read_cst(&persist::cst_path(&self.dir, rank), rank as i32)?,
                persist::read_grammar(&persist::cfg_path(&self.dir, rank))?,
                persist::read_timestamps(&persist::ts_path(&self.dir, rank), self.metadata.ts_compression)?,
            ),
        };
        let timestamps = TimestampStream::from_payload(&ts_payload, self.metadata.time_resolution)?;

        Ok(TraceParts {
            rank,
            cst,
            grammar,
            timestamps,
        })
    }

    pub fn decode<'a>(&'a self, parts: &'a TraceParts) -> Records<'a> {
        decode(parts, &self.functions)
    }

    /// Decode a whole rank, failing on the first bad record
    pub fn read_records(&self, rank: usize) -> Result<Vec<CallRecord>> {
        let parts = self.read(rank)?;
        self.decode(&parts).collect()
    }
}

impl MergedFiles {
    fn read(dir: &Path, metadata: &TraceMetadata) -> Result<Self> {
        let ranks = metadata.total_ranks as usize;
        let cst = persist::read_cst(&dir.join(persist::MERGED_CST_FILE), 0)?;
        let grammars = persist::read_unique_grammars(dir)?;
        let timestamps = persist::read_merged_timestamps(dir, metadata.ts_compression)?;

        for (file, found) in [
            (persist::GRAMMAR_INDEX_FILE, grammars.index.len()),
            (persist::MERGED_TS_FILE, timestamps.len()),
        ] {
            if found != ranks {
                return Err(RecorderError::Corrupt(format!(
                    "{} holds {} ranks, metadata declares {}",
                    file, found, ranks
                )));
            }
        }
        Ok(Self {
            cst,
            grammars,
            timestamps,
        })
    }
}

/// Replay `parts` into call records
///
/// A terminal with no signature or a malformed key yields an error for that
/// record only; running out of timestamps ends the stream with an error.
pub fn decode<'a>(parts: &'a TraceParts, functions: &'a FunctionTable) -> Records<'a> {
    Records {
        parts,
        functions,
        terminals: parts.grammar.iter(),
        timestamps: parts.timestamps.restart(),
        keys: FnvHashMap::default(),
        done: false,
    }
}

/// Lazy stream of decoded calls
pub struct Records<'a> {
    parts: &'a TraceParts,
    functions: &'a FunctionTable,
    terminals: Expansion<'a>,
    timestamps: TimestampStream,
    keys: FnvHashMap<i32, DecodedKey>,
    done: bool,
}

impl Records<'_> {
    fn lookup(&mut self, terminal: i32) -> Result<&DecodedKey> {
        if !self.keys.contains_key(&terminal) {
            let signature = self
                .parts
                .cst
                .lookup_terminal(terminal)
                .ok_or(RecorderError::UnknownTerminal(terminal))?;
            let decoded = decode_key(&signature.key)?;
            self.keys.insert(terminal, decoded);
        }
        self.keys
            .get(&terminal)
            .ok_or(RecorderError::UnknownTerminal(terminal))
    }
}

impl Iterator for Records<'_> {
    type Item = Result<CallRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(terminal) = self.terminals.next() else {
            self.done = true;
            return None;
        };
        let Some((tstart, tend)) = self.timestamps.next() else {
            self.done = true;
            return Some(Err(RecorderError::Corrupt(format!(
                "rank {}: timestamps end before the call sequence",
                self.parts.rank
            ))));
        };

        let rank = self.parts.rank;
        let functions = self.functions;
        Some(self.lookup(terminal).map(|key| CallRecord {
            rank,
            thread_id: key.thread_id,
            func_id: key.func_id,
            func_name: functions.name(key.func_id).map(str::to_string),
            depth: key.depth,
            args: key.args.clone(),
            tstart,
            tend,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CallEvent;
    use crate::signature::{encode_key, KeyProjection};
    use crate::timestamps::TimestampStore;

    fn parts(calls: &[(i32, &str)]) -> TraceParts {
        let mut cst = CallSignatureTable::new(0);
        let mut grammar = Grammar::new();
        let mut ts = TimestampStore::new(0.0, 1e-3, 64, 64);
        for (i, (func, arg)) in calls.iter().enumerate() {
            let event = CallEvent::with_args(0, *func, [*arg], i as f64);
            grammar
                .append(cst.intern(&encode_key(&event, KeyProjection::default())))
                .unwrap();
            ts.append(i as f64, i as f64 + 0.5);
        }
        TraceParts {
            rank: 0,
            cst,
            grammar,
            timestamps: TimestampStream::new(ts.finish().unwrap(), 0.0, 1e-3),
        }
    }

    #[test]
    fn test_decode_in_order() {
        let p = parts(&[(0, "a.dat"), (1, "4096"), (1, "4096"), (2, "3")]);
        let functions = FunctionTable::new(["open", "write", "close"]);
        let records: Vec<CallRecord> = decode(&p, &functions).collect::<Result<_>>().unwrap();

        let text: Vec<String> = records.iter().map(CallRecord::call_text).collect();
        assert_eq!(text, vec!["open(a.dat)", "write(4096)", "write(4096)", "close(3)"]);
        assert!((records[3].tstart - 3.0).abs() < 1e-9);
        assert!((records[3].tend - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_is_restartable() {
        let p = parts(&[(0, "x"), (0, "y"), (0, "x"), (0, "y")]);
        let functions = FunctionTable::default();
        let first: Vec<_> = decode(&p, &functions).map(|r| r.unwrap()).collect();
        let second: Vec<_> = decode(&p, &functions).map(|r| r.unwrap()).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
        assert_eq!(first[0].func_name, None);
    }

    #[test]
    fn test_unknown_terminal_fails_one_record() {
        let mut p = parts(&[(0, "x"), (1, "y")]);
        p.cst = {
            let mut only_first = CallSignatureTable::new(0);
            let first = p.cst.lookup_terminal(0).unwrap();
            only_first.intern(&first.key);
            only_first
        };

        let results: Vec<_> = decode(&p, &FunctionTable::default()).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(RecorderError::UnknownTerminal(1))));
    }

    #[test]
    fn test_missing_timestamps() {
        let mut p = parts(&[(0, "x"), (1, "y")]);
        p.timestamps = TimestampStream::new(vec![0, 1], 0.0, 1e-3);

        let results: Vec<_> = decode(&p, &FunctionTable::default()).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(RecorderError::Corrupt(_))));
    }

    #[test]
    fn test_open_requires_version() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(TraceReader::open(dir.path()), Err(RecorderError::Io(_))));
    }
}
