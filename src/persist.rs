//! On-disk trace layout
//!
//! ```text
//! <trace dir>/
//! ├── VERSION          "major.minor.patch"
//! ├── recorder.mt      metadata header + function names
//! ├── recorder.cst     merged signature table      (merged mode)
//! ├── recorder.ts      all ranks' timestamps       (merged mode)
//! ├── ug.cfg           distinct grammars           (merged mode)
//! ├── ug.idx           rank -> grammar in ug.cfg   (merged mode)
//! ├── <rank>.cst       per-rank signature table    (local mode)
//! ├── <rank>.ts        per-rank timestamps         (local mode)
//! └── <rank>.cfg       per-rank grammar            (local mode)
//! ```
//!
//! Every timestamp payload starts with the origin its rank quantized against.
//!
//! Signature tables and grammars are always zlib framed; timestamp files are
//! framed when `ts_compression` is set. The metadata header and `VERSION` are
//! stored raw.

use crate::config::RecorderConfig;
use crate::cst::CallSignatureTable;
use crate::error::{RecorderError, Result};
use crate::functions::{CategoryFlags, FunctionTable};
use crate::grammar::Grammar;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Trace format version written by this crate
pub const FORMAT_VERSION: &str = "1.0.0";

pub const VERSION_FILE: &str = "VERSION";
pub const METADATA_FILE: &str = "recorder.mt";
pub const MERGED_CST_FILE: &str = "recorder.cst";
pub const MERGED_TS_FILE: &str = "recorder.ts";
pub const UNIQUE_GRAMMARS_FILE: &str = "ug.cfg";
pub const GRAMMAR_INDEX_FILE: &str = "ug.idx";

const METADATA_HEADER_LEN: usize = 4 + 6 + 2 + 8 + 8 + 4 + 4;

pub fn cst_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("{}.cst", rank))
}

pub fn cfg_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("{}.cfg", rank))
}

pub fn ts_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("{}.ts", rank))
}

// ----------------------------------------------------------------------------
// zlib framing
// ----------------------------------------------------------------------------

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| RecorderError::Corrupt(format!("zlib stream: {}", e)))?;
    Ok(out)
}

fn write_framed(path: &Path, bytes: &[u8], framed: bool) -> Result<()> {
    if framed {
        fs::write(path, compress(bytes)?)?;
    } else {
        fs::write(path, bytes)?;
    }
    Ok(())
}

fn read_framed(path: &Path, framed: bool) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    if framed {
        decompress(&raw)
    } else {
        Ok(raw)
    }
}

// ----------------------------------------------------------------------------
// Signature tables and grammars
// ----------------------------------------------------------------------------

pub fn write_cst(path: &Path, cst: &CallSignatureTable) -> Result<()> {
    write_framed(path, &cst.serialize(), true)
}

pub fn read_cst(path: &Path, rank: i32) -> Result<CallSignatureTable> {
    CallSignatureTable::deserialize(&read_framed(path, true)?, rank)
}

pub fn write_grammar(path: &Path, grammar: &Grammar) -> Result<()> {
    write_framed(path, &grammar.to_bytes(), true)
}

pub fn read_grammar(path: &Path) -> Result<Grammar> {
    Grammar::from_bytes(&read_framed(path, true)?)
}

/// Distinct serialized grammars of a group and which one each rank uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueGrammars {
    pub grammars: Vec<Vec<u8>>,
    /// Slot in `grammars` per rank; `None` for a rank that sent no grammar
    pub index: Vec<Option<usize>>,
}

impl UniqueGrammars {
    /// Serialized grammar of `rank`
    pub fn for_rank(&self, rank: usize) -> Result<&[u8]> {
        let slot = self
            .index
            .get(rank)
            .copied()
            .flatten()
            .ok_or_else(|| RecorderError::Corrupt(format!("rank {} has no grammar in {}", rank, GRAMMAR_INDEX_FILE)))?;
        self.grammars
            .get(slot)
            .map(Vec::as_slice)
            .ok_or_else(|| RecorderError::Corrupt(format!("rank {} points at missing grammar {}", rank, slot)))
    }
}

/// `ug.cfg`: `count: i32`, then `(len: i32, bytes)` per grammar.
/// `ug.idx`: `ranks: i32`, then one `i32` slot per rank, `-1` for none.
pub fn write_unique_grammars(dir: &Path, unique: &UniqueGrammars) -> Result<()> {
    let body: usize = unique.grammars.iter().map(|g| 4 + g.len()).sum();
    let mut grammars = Vec::with_capacity(4 + body);
    let _ = grammars.write_i32::<LittleEndian>(unique.grammars.len() as i32);
    for g in &unique.grammars {
        let _ = grammars.write_i32::<LittleEndian>(g.len() as i32);
        grammars.extend_from_slice(g);
    }

    let mut index = Vec::with_capacity(4 + 4 * unique.index.len());
    let _ = index.write_i32::<LittleEndian>(unique.index.len() as i32);
    for slot in &unique.index {
        let _ = index.write_i32::<LittleEndian>(slot.map_or(-1, |s| s as i32));
    }

    write_framed(&dir.join(UNIQUE_GRAMMARS_FILE), &grammars, true)?;
    write_framed(&dir.join(GRAMMAR_INDEX_FILE), &index, true)
}

pub fn read_unique_grammars(dir: &Path) -> Result<UniqueGrammars> {
    let corrupt = |detail: String| RecorderError::Corrupt(format!("unique grammars: {}", detail));

    let bytes = read_framed(&dir.join(UNIQUE_GRAMMARS_FILE), true)?;
    let mut cursor = Cursor::new(&bytes[..]);
    let count = cursor.read_i32::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
    if count < 0 {
        return Err(corrupt(format!("negative grammar count {}", count)));
    }
    let mut grammars = Vec::new();
    for i in 0..count {
        let len = cursor.read_i32::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
        let remaining = bytes.len() - cursor.position() as usize;
        if len < 0 || len as usize > remaining {
            return Err(corrupt(format!("grammar {} is {} bytes, {} left", i, len, remaining)));
        }
        let mut grammar = vec![0u8; len as usize];
        cursor.read_exact(&mut grammar).map_err(|e| corrupt(e.to_string()))?;
        grammars.push(grammar);
    }
    if cursor.position() as usize != bytes.len() {
        return Err(corrupt(format!("{} trailing bytes", bytes.len() - cursor.position() as usize)));
    }

    let bytes = read_framed(&dir.join(GRAMMAR_INDEX_FILE), true)?;
    let mut cursor = Cursor::new(&bytes[..]);
    let ranks = cursor.read_i32::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
    if ranks < 0 || 4 + 4 * ranks as usize != bytes.len() {
        return Err(corrupt(format!("index declares {} ranks in {} bytes", ranks, bytes.len())));
    }
    let mut index = Vec::with_capacity(ranks as usize);
    for rank in 0..ranks {
        let slot = cursor.read_i32::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
        index.push(match slot {
            -1 => None,
            s if s >= 0 && s < count => Some(s as usize),
            s => return Err(corrupt(format!("rank {} points at grammar {} of {}", rank, s, count))),
        });
    }
    Ok(UniqueGrammars { grammars, index })
}

// ----------------------------------------------------------------------------
// Timestamps
// ----------------------------------------------------------------------------

pub fn write_timestamps(path: &Path, origin: f64, raw: &[u32], framed: bool) -> Result<()> {
    write_framed(path, &crate::timestamps::encode_payload(origin, raw), framed)
}

/// Timestamp payload of one rank's `<rank>.ts`, origin included
pub fn read_timestamps(path: &Path, framed: bool) -> Result<Vec<u8>> {
    read_framed(path, framed)
}

/// Pack per-rank timestamp payloads into the `recorder.ts` body:
/// `ranks: u64`, then `(offset: u64, len: u64)` per rank (offsets relative to
/// the end of the table), then the payloads back to back
pub fn encode_merged_timestamps(payloads: &[Vec<u8>]) -> Vec<u8> {
    let body: usize = payloads.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(8 + 16 * payloads.len() + body);

    let _ = out.write_u64::<LittleEndian>(payloads.len() as u64);
    let mut offset = 0u64;
    for p in payloads {
        let _ = out.write_u64::<LittleEndian>(offset);
        let _ = out.write_u64::<LittleEndian>(p.len() as u64);
        offset += p.len() as u64;
    }
    for p in payloads {
        out.extend_from_slice(p);
    }
    out
}

/// Inverse of [`encode_merged_timestamps`]
pub fn decode_merged_timestamps(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let corrupt = |detail: String| RecorderError::Corrupt(format!("merged timestamps: {}", detail));
    let mut cursor = Cursor::new(bytes);

    let ranks = cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| corrupt(e.to_string()))?;
    let table_len = ranks
        .checked_mul(16)
        .and_then(|t| t.checked_add(8))
        .filter(|&t| t <= bytes.len() as u64)
        .ok_or_else(|| corrupt(format!("{} ranks do not fit in {} bytes", ranks, bytes.len())))?;
    let body = &bytes[table_len as usize..];

    let mut payloads = Vec::with_capacity(ranks as usize);
    for rank in 0..ranks {
        let offset = cursor.read_u64::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
        let len = cursor.read_u64::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= body.len() as u64 && len % 4 == 0)
            .ok_or_else(|| corrupt(format!("rank {} span {}+{} is invalid", rank, offset, len)))?;
        payloads.push(body[offset as usize..end as usize].to_vec());
    }
    Ok(payloads)
}

pub fn write_merged_timestamps(dir: &Path, payloads: &[Vec<u8>], framed: bool) -> Result<()> {
    write_framed(&dir.join(MERGED_TS_FILE), &encode_merged_timestamps(payloads), framed)
}

pub fn read_merged_timestamps(dir: &Path, framed: bool) -> Result<Vec<Vec<u8>>> {
    decode_merged_timestamps(&read_framed(&dir.join(MERGED_TS_FILE), framed)?)
}

// ----------------------------------------------------------------------------
// Metadata
// ----------------------------------------------------------------------------

/// Session-wide facts needed to decode any rank
#[derive(Debug, Clone, PartialEq)]
pub struct TraceMetadata {
    pub total_ranks: i32,
    pub categories: CategoryFlags,
    pub store_tid: bool,
    pub store_call_depth: bool,
    pub start_ts: f64,
    pub time_resolution: f64,
    pub ts_buffer_elements: i32,
    pub ts_compression: bool,
    pub interprocess_compression: bool,
    pub interprocess_pattern_recognition: bool,
    pub intraprocess_pattern_recognition: bool,
    pub function_names: Vec<String>,
}

impl TraceMetadata {
    pub fn new(config: &RecorderConfig, total_ranks: usize, start_ts: f64, functions: &FunctionTable) -> Self {
        Self {
            total_ranks: total_ranks as i32,
            categories: functions.categories(),
            store_tid: config.store_tid,
            store_call_depth: config.store_call_depth,
            start_ts,
            time_resolution: config.time_resolution,
            ts_buffer_elements: i32::try_from(config.ts_buffer_elements).unwrap_or(i32::MAX),
            ts_compression: config.ts_compression,
            interprocess_compression: config.interprocess_compression,
            interprocess_pattern_recognition: config.interprocess_pattern_recognition,
            intraprocess_pattern_recognition: config.intraprocess_pattern_recognition,
            function_names: functions.names().to_vec(),
        }
    }

    /// Whether the trace was written in merged mode
    pub fn merged(&self) -> bool {
        self.interprocess_compression
    }

    pub fn function_table(&self) -> FunctionTable {
        let mut table = FunctionTable::new(self.function_names.iter().cloned());
        table.set_categories(self.categories);
        table
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let names: usize = self.function_names.iter().map(|n| n.len() + 1).sum();
        let mut out = Vec::with_capacity(METADATA_HEADER_LEN + names);
        let c = &self.categories;

        let _ = out.write_i32::<LittleEndian>(self.total_ranks);
        for flag in [c.posix, c.mpi, c.mpiio, c.hdf5, c.pnetcdf, c.netcdf] {
            out.push(flag as u8);
        }
        out.push(self.store_tid as u8);
        out.push(self.store_call_depth as u8);
        let _ = out.write_f64::<LittleEndian>(self.start_ts);
        let _ = out.write_f64::<LittleEndian>(self.time_resolution);
        let _ = out.write_i32::<LittleEndian>(self.ts_buffer_elements);
        for flag in [
            self.ts_compression,
            self.interprocess_compression,
            self.interprocess_pattern_recognition,
            self.intraprocess_pattern_recognition,
        ] {
            out.push(flag as u8);
        }

        for name in &self.function_names {
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < METADATA_HEADER_LEN {
            return Err(RecorderError::Corrupt(format!(
                "metadata header is {} bytes, expected {}",
                bytes.len(),
                METADATA_HEADER_LEN
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let header = (|| -> std::io::Result<Self> {
            let total_ranks = cursor.read_i32::<LittleEndian>()?;
            let mut flags = [0u8; 8];
            cursor.read_exact(&mut flags)?;
            let start_ts = cursor.read_f64::<LittleEndian>()?;
            let time_resolution = cursor.read_f64::<LittleEndian>()?;
            let ts_buffer_elements = cursor.read_i32::<LittleEndian>()?;
            let mut tail = [0u8; 4];
            cursor.read_exact(&mut tail)?;

            Ok(Self {
                total_ranks,
                categories: CategoryFlags {
                    posix: flags[0] != 0,
                    mpi: flags[1] != 0,
                    mpiio: flags[2] != 0,
                    hdf5: flags[3] != 0,
                    pnetcdf: flags[4] != 0,
                    netcdf: flags[5] != 0,
                },
                store_tid: flags[6] != 0,
                store_call_depth: flags[7] != 0,
                start_ts,
                time_resolution,
                ts_buffer_elements,
                ts_compression: tail[0] != 0,
                interprocess_compression: tail[1] != 0,
                interprocess_pattern_recognition: tail[2] != 0,
                intraprocess_pattern_recognition: tail[3] != 0,
                function_names: Vec::new(),
            })
        })()
        .map_err(|e| RecorderError::Corrupt(format!("metadata header: {}", e)))?;

        if header.total_ranks < 1 {
            return Err(RecorderError::Corrupt(format!(
                "metadata declares {} ranks",
                header.total_ranks
            )));
        }
        if !(header.time_resolution.is_finite() && header.time_resolution > 0.0) {
            return Err(RecorderError::Corrupt(format!(
                "metadata time resolution {}",
                header.time_resolution
            )));
        }

        let names = std::str::from_utf8(&bytes[METADATA_HEADER_LEN..])
            .map_err(|e| RecorderError::Corrupt(format!("function names: {}", e)))?;
        Ok(Self {
            function_names: names.lines().map(str::to_string).collect(),
            ..header
        })
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(METADATA_FILE), self.to_bytes())?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(dir.join(METADATA_FILE))?)
    }
}

// ----------------------------------------------------------------------------
// VERSION
// ----------------------------------------------------------------------------

pub fn write_version(dir: &Path) -> Result<()> {
    fs::write(dir.join(VERSION_FILE), FORMAT_VERSION)?;
    Ok(())
}

fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Accept `found` when its major.minor equals ours
///
/// # Example
/// ```
/// use iorecorder::persist::check_version_string;
///
/// assert!(check_version_string("1.0.7").is_ok());
/// assert!(check_version_string("1.1.0").is_err());
/// ```
pub fn check_version_string(found: &str) -> Result<()> {
    let ours = major_minor(FORMAT_VERSION);
    let theirs = major_minor(found);
    if theirs.is_none() || theirs != ours {
        return Err(RecorderError::VersionMismatch {
            expected: FORMAT_VERSION.to_string(),
            found: found.trim().to_string(),
        });
    }
    Ok(())
}

pub fn check_version(dir: &Path) -> Result<()> {
    check_version_string(&fs::read_to_string(dir.join(VERSION_FILE))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::CallCategory;
    use tempfile::TempDir;

    fn metadata() -> TraceMetadata {
        let functions = FunctionTable::new(["open", "write", "MPI_File_open"])
            .with_categories(&[CallCategory::Posix, CallCategory::MpiIo]);
        TraceMetadata::new(&RecorderConfig::default(), 4, 12.5, &functions)
    }

    #[test]
    fn test_zlib_round_trip() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 17).to_le_bytes()).collect();
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_decompress_garbage() {
        assert!(matches!(decompress(b"not zlib"), Err(RecorderError::Corrupt(_))));
    }

    #[test]
    fn test_metadata_header_layout() {
        let bytes = metadata().to_bytes();
        assert_eq!(&bytes[0..4], &4i32.to_le_bytes());
        assert_eq!(&bytes[4..10], &[1, 0, 1, 0, 0, 0]); // posix, mpiio
        assert_eq!(&bytes[10..12], &[0, 1]); // store_tid, store_call_depth
        assert_eq!(&bytes[12..20], &12.5f64.to_le_bytes());
        assert_eq!(&bytes[METADATA_HEADER_LEN..], b"open\nwrite\nMPI_File_open\n");
    }

    #[test]
    fn test_metadata_round_trip() {
        let original = metadata();
        let restored = TraceMetadata::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.function_table().name(2), Some("MPI_File_open"));
        assert!(restored.function_table().categories().mpiio);
    }

    #[test]
    fn test_metadata_rejects_short_or_invalid() {
        assert!(TraceMetadata::from_bytes(&[0u8; 10]).is_err());

        let mut bad = metadata();
        bad.total_ranks = 0;
        assert!(TraceMetadata::from_bytes(&bad.to_bytes()).is_err());
    }

    #[test]
    fn test_merged_timestamps() {
        let payloads = vec![vec![1, 0, 0, 0, 2, 0, 0, 0], vec![], vec![9, 9, 9, 9]];
        let encoded = encode_merged_timestamps(&payloads);
        assert_eq!(decode_merged_timestamps(&encoded).unwrap(), payloads);

        assert!(decode_merged_timestamps(&encoded[..20]).is_err());
        assert!(decode_merged_timestamps(&u64::MAX.to_le_bytes()).is_err());
    }

    #[test]
    fn test_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut cst = CallSignatureTable::new(1);
        cst.intern(b"key");
        let mut grammar = Grammar::new();
        for t in [0, 0, 0] {
            grammar.append(t).unwrap();
        }

        write_cst(&cst_path(dir.path(), 1), &cst).unwrap();
        write_grammar(&cfg_path(dir.path(), 1), &grammar).unwrap();
        write_timestamps(&ts_path(dir.path(), 1), 2.5, &[5, 6], false).unwrap();

        assert_eq!(read_cst(&cst_path(dir.path(), 1), 1).unwrap().len(), 1);
        assert_eq!(read_grammar(&cfg_path(dir.path(), 1)).unwrap().decode(), vec![0, 0, 0]);
        let payload = read_timestamps(&ts_path(dir.path(), 1), false).unwrap();
        assert_eq!(&payload[..8], &2.5f64.to_le_bytes());
        assert_eq!(&payload[8..], &[5, 0, 0, 0, 6, 0, 0, 0]);
    }

    #[test]
    fn test_unique_grammars_round_trip() {
        let dir = TempDir::new().unwrap();
        let unique = UniqueGrammars {
            grammars: vec![vec![1, 2, 3, 4], vec![]],
            index: vec![Some(0), None, Some(1), Some(0)],
        };
        write_unique_grammars(dir.path(), &unique).unwrap();

        let restored = read_unique_grammars(dir.path()).unwrap();
        assert_eq!(restored, unique);
        assert_eq!(restored.for_rank(3).unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(restored.for_rank(1), Err(RecorderError::Corrupt(_))));
        assert!(restored.for_rank(9).is_err());
    }

    #[test]
    fn test_grammar_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        let unique = UniqueGrammars {
            grammars: vec![vec![0; 4]],
            index: vec![Some(0)],
        };
        write_unique_grammars(dir.path(), &unique).unwrap();

        let mut index = Vec::new();
        index.extend_from_slice(&1i32.to_le_bytes());
        index.extend_from_slice(&3i32.to_le_bytes());
        fs::write(dir.path().join(GRAMMAR_INDEX_FILE), compress(&index).unwrap()).unwrap();
        assert!(read_unique_grammars(dir.path()).is_err());
    }

    #[test]
    fn test_version_file() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path()).unwrap();
        assert!(check_version(dir.path()).is_ok());

        fs::write(dir.path().join(VERSION_FILE), "2.0.0\n").unwrap();
        match check_version(dir.path()) {
            Err(RecorderError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, "1.0.0");
                assert_eq!(found, "2.0.0");
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_version_garbage() {
        assert!(check_version_string("").is_err());
        assert!(check_version_string("one.two").is_err());
        assert!(check_version_string("1.0").is_ok());
    }
}
