//! Quantized delta timestamp store
//!
//! Each completed call contributes two `u32` values:
//!
//! ```text
//! delta_start = tick(start) - prev_start_tick
//! delta_end   = tick(end)   - prev_start_tick
//! ```
//!
//! where `tick(t) = round((t - origin) / resolution)` on an integer axis
//! anchored at the session start. `prev_start_tick` is the *reconstructed*
//! start tick of the previous call, so rounding never accumulates and a
//! sequential decode lands within one resolution unit of every input.
//!
//! Negative deltas (a call that completes after, but started before, the
//! previous completed call on another thread) clamp to 0. Deltas that do not
//! fit in 32 bits saturate.
//!
//! The in-memory buffer doubles when full until it reaches the spill size;
//! from then on a full buffer is appended to the scratch sink and reused.
//!
//! A persisted payload carries its own origin, since every rank quantizes
//! against the clock it started with:
//!
//! ```text
//! origin: f64 | (delta_start: u32, delta_end: u32)*     little-endian
//! ```

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum Scratch {
    Memory(Vec<u32>),
    File {
        path: PathBuf,
        writer: BufWriter<File>,
        elements: usize,
    },
}

impl Scratch {
    fn elements(&self) -> usize {
        match self {
            Scratch::Memory(v) => v.len(),
            Scratch::File { elements, .. } => *elements,
        }
    }
}

/// Per-process timestamp recorder
pub struct TimestampStore {
    origin: f64,
    resolution: f64,
    prev_start_tick: u64,
    buffer: Vec<u32>,
    capacity: usize,
    spill_elements: usize,
    scratch: Scratch,
    spill_failed: bool,
}

impl std::fmt::Debug for TimestampStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampStore")
            .field("origin", &self.origin)
            .field("resolution", &self.resolution)
            .field("buffered", &self.buffer.len())
            .field("capacity", &self.capacity)
            .field("spilled", &self.scratch.elements())
            .finish()
    }
}

impl TimestampStore {
    /// # Example
    /// ```
    /// use iorecorder::timestamps::{TimestampStore, TimestampStream};
    ///
    /// let mut store = TimestampStore::new(100.0, 1e-7, 1024, 4096);
    /// store.append(100.0, 100.0000005);
    /// let raw = store.finish().unwrap();
    /// assert_eq!(raw, vec![0, 5]);
    ///
    /// let (start, end) = TimestampStream::new(raw, 100.0, 1e-7).next().unwrap();
    /// assert!((end - start - 5e-7).abs() < 1e-7);
    /// ```
    pub fn new(origin: f64, resolution: f64, initial_elements: usize, spill_elements: usize) -> Self {
        let capacity = initial_elements.max(2);
        Self {
            origin,
            resolution,
            prev_start_tick: 0,
            buffer: Vec::with_capacity(capacity),
            capacity,
            spill_elements: spill_elements.max(capacity),
            scratch: Scratch::Memory(Vec::new()),
            spill_failed: false,
        }
    }

    pub fn from_config(config: &RecorderConfig, origin: f64) -> Self {
        Self::new(
            origin,
            config.time_resolution,
            config.ts_buffer_elements,
            config.ts_spill_elements,
        )
    }

    /// Spill to a file at `path` instead of memory. The file is removed by
    /// [`finish`](Self::finish).
    pub fn attach_scratch_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        // Anything already spilled to memory stays ahead of the file contents
        let mut writer = BufWriter::new(file);
        let elements = match &self.scratch {
            Scratch::Memory(existing) => {
                for v in existing {
                    writer.write_u32::<LittleEndian>(*v)?;
                }
                existing.len()
            }
            Scratch::File { path: current, .. } => {
                warn!("timestamp scratch already at {}", current.display());
                return Ok(());
            }
        };
        self.scratch = Scratch::File {
            path,
            writer,
            elements,
        };
        Ok(())
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Number of `u32` values recorded so far
    pub fn len(&self) -> usize {
        self.scratch.elements() + self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of calls recorded so far
    pub fn records(&self) -> usize {
        self.len() / 2
    }

    pub fn append(&mut self, start: f64, end: f64) {
        let start_tick = self.tick(start);
        let end_tick = self.tick(end);

        let delta_start = clamp_delta(start_tick, self.prev_start_tick);
        let delta_end = clamp_delta(end_tick, self.prev_start_tick);

        self.buffer.push(delta_start);
        self.buffer.push(delta_end);
        self.prev_start_tick += delta_start as u64;

        if self.buffer.len() >= self.capacity {
            self.grow_or_spill();
        }
    }

    /// Move buffered values to the scratch sink
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        match &mut self.scratch {
            Scratch::Memory(spilled) => spilled.extend_from_slice(&self.buffer),
            Scratch::File {
                writer, elements, ..
            } => {
                for v in &self.buffer {
                    writer.write_u32::<LittleEndian>(*v)?;
                }
                writer.flush()?;
                *elements += self.buffer.len();
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Flush and return the complete raw stream, oldest first
    pub fn finish(&mut self) -> Result<Vec<u32>> {
        self.flush()?;
        let scratch = std::mem::replace(&mut self.scratch, Scratch::Memory(Vec::new()));
        match scratch {
            Scratch::Memory(values) => Ok(values),
            Scratch::File {
                path,
                writer,
                elements,
            } => {
                drop(writer);
                let mut reader = BufReader::new(File::open(&path)?);
                let mut values = Vec::with_capacity(elements);
                for _ in 0..elements {
                    values.push(reader.read_u32::<LittleEndian>()?);
                }
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not remove timestamp scratch {}: {}", path.display(), e);
                }
                Ok(values)
            }
        }
    }

    fn tick(&self, t: f64) -> u64 {
        // `as` saturates: negative and NaN map to 0
        ((t - self.origin) / self.resolution).round() as u64
    }

    fn grow_or_spill(&mut self) {
        let doubled = self.capacity.saturating_mul(2);
        if doubled <= self.spill_elements || self.spill_failed {
            debug!("timestamp buffer grows {} -> {} slots", self.capacity, doubled);
            self.capacity = doubled;
            self.buffer.reserve(doubled - self.buffer.len());
            return;
        }

        debug!("timestamp buffer spills {} slots", self.buffer.len());
        if let Err(e) = self.flush() {
            // Keep capturing in memory; the sink is not retried
            warn!("timestamp spill failed, buffering in memory: {}", e);
            self.spill_failed = true;
            self.capacity = doubled;
        }
    }
}

fn clamp_delta(tick: u64, base: u64) -> u32 {
    let delta = tick.saturating_sub(base);
    u32::try_from(delta).unwrap_or(u32::MAX)
}

/// Sequential decoder for a raw timestamp stream
///
/// Yields `(start, end)` in seconds for every complete pair.
#[derive(Debug, Clone)]
pub struct TimestampStream {
    raw: Vec<u32>,
    pos: usize,
    origin: f64,
    resolution: f64,
    prev_start_tick: u64,
}

impl TimestampStream {
    pub fn new(raw: Vec<u32>, origin: f64, resolution: f64) -> Self {
        Self {
            raw,
            pos: 0,
            origin,
            resolution,
            prev_start_tick: 0,
        }
    }

    /// Decode a payload produced by [`encode_payload`]
    pub fn from_payload(bytes: &[u8], resolution: f64) -> Result<Self> {
        if bytes.len() < PAYLOAD_HEADER_LEN || (bytes.len() - PAYLOAD_HEADER_LEN) % 4 != 0 {
            return Err(RecorderError::Corrupt(format!(
                "timestamp payload of {} bytes",
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let origin = cursor
            .read_f64::<LittleEndian>()
            .map_err(|e| RecorderError::Corrupt(format!("timestamp origin: {}", e)))?;
        let raw = bytes[PAYLOAD_HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(raw, origin, resolution))
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    /// Number of calls in the stream
    pub fn records(&self) -> usize {
        self.raw.len() / 2
    }

    pub fn raw(&self) -> &[u32] {
        &self.raw
    }

    /// Fresh decoder positioned at the first call
    pub fn restart(&self) -> Self {
        Self::new(self.raw.clone(), self.origin, self.resolution)
    }

    fn seconds(&self, tick: u64) -> f64 {
        self.origin + tick as f64 * self.resolution
    }
}

impl Iterator for TimestampStream {
    type Item = (f64, f64);

    fn next(&mut self) -> Option<(f64, f64)> {
        let pair = self.raw.get(self.pos..self.pos + 2)?;
        let (delta_start, delta_end) = (pair[0] as u64, pair[1] as u64);
        self.pos += 2;

        let start_tick = self.prev_start_tick + delta_start;
        let end_tick = self.prev_start_tick + delta_end;
        self.prev_start_tick = start_tick;
        Some((self.seconds(start_tick), self.seconds(end_tick)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.raw.len().saturating_sub(self.pos)) / 2;
        (left, Some(left))
    }
}

/// Bytes before the delta pairs of a persisted payload
pub const PAYLOAD_HEADER_LEN: usize = 8;

/// Persisted form of one rank's stream: its origin, then the raw deltas
pub fn encode_payload(origin: f64, raw: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PAYLOAD_HEADER_LEN + 4 * raw.len());
    out.extend_from_slice(&origin.to_le_bytes());
    for v in raw {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
