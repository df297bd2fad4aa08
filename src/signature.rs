//! Call signature codec
//!
//! A call signature key is the canonical byte form of a call's *shape*: the
//! fields that decide whether two calls are "the same" for compression
//! purposes. Timestamps and return values never enter the key.
//!
//! # Layout
//!
//! ```text
//! ┌───────────┬─────────┬───────┬───────────┬──────────┬──────────────────────────┐
//! │ thread_id │ func_id │ depth │ arg_count │ args_len │ "arg0 arg1 ... argN-1 "  │
//! │ u64 LE    │ i32 LE  │ u8    │ u8        │ i32 LE   │ args_len bytes           │
//! └───────────┴─────────┴───────┴───────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Every argument is followed by exactly one space, internal spaces are
//! rewritten to `_`, and an argument that could not be captured is stored as
//! the sentinel `???`. The thread id and depth are zeroed when the session
//! does not track them, so the key stays a pure function of the projected
//! fields.

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::record::CallEvent;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::borrow::Cow;
use std::io::Cursor;
use tracing::warn;

/// Stored in place of an argument that was not available
pub const NULL_ARG: &str = "???";

/// Bytes before the argument string
pub const KEY_HEADER_LEN: usize = 8 + 4 + 1 + 1 + 4;

const MAX_ARGS: usize = u8::MAX as usize;

/// Which optional fields participate in the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyProjection {
    pub thread_id: bool,
    pub depth: bool,
}

impl Default for KeyProjection {
    fn default() -> Self {
        Self {
            thread_id: false,
            depth: true,
        }
    }
}

impl From<&RecorderConfig> for KeyProjection {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            thread_id: config.store_tid,
            depth: config.store_call_depth,
        }
    }
}

/// Fields recovered from a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub thread_id: u64,
    pub func_id: i32,
    pub depth: u8,
    pub args: Vec<String>,
}

/// Canonical form of one argument
///
/// # Example
/// ```
/// use iorecorder::signature::canonical_arg;
///
/// assert_eq!(canonical_arg(Some("my file.dat")), "my_file.dat");
/// assert_eq!(canonical_arg(None), "???");
/// ```
pub fn canonical_arg(arg: Option<&str>) -> Cow<'_, str> {
    match arg {
        None => Cow::Borrowed(NULL_ARG),
        Some(a) if a.contains(' ') => Cow::Owned(a.replace(' ', "_")),
        Some(a) => Cow::Borrowed(a),
    }
}

/// Encode the projected fields of `event` into a canonical key
///
/// Never fails: unavailable arguments become the sentinel, and argument lists
/// longer than 255 entries are truncated.
pub fn encode_key(event: &CallEvent, projection: KeyProjection) -> Vec<u8> {
    let args = if event.args.len() > MAX_ARGS {
        warn!(
            "func {} has {} arguments, keeping the first {}",
            event.func_id,
            event.args.len(),
            MAX_ARGS
        );
        &event.args[..MAX_ARGS]
    } else {
        &event.args[..]
    };

    let canonical: Vec<Cow<'_, str>> = args.iter().map(|a| canonical_arg(a.as_deref())).collect();
    let args_len: usize = canonical.iter().map(|a| a.len() + 1).sum();

    let mut key = Vec::with_capacity(KEY_HEADER_LEN + args_len);
    let thread_id = if projection.thread_id { event.thread_id } else { 0 };
    let depth = if projection.depth { event.depth } else { 0 };

    // Writes into a Vec cannot fail
    let _ = key.write_u64::<LittleEndian>(thread_id);
    let _ = key.write_i32::<LittleEndian>(event.func_id);
    key.push(depth);
    key.push(canonical.len() as u8);
    let _ = key.write_i32::<LittleEndian>(args_len as i32);
    for arg in &canonical {
        key.extend_from_slice(arg.as_bytes());
        key.push(b' ');
    }
    key
}

/// Decode a key produced by [`encode_key`]
///
/// Fails with [`RecorderError::MalformedKey`] when the header is truncated,
/// the argument section length disagrees with the key length, or the number
/// of space-terminated arguments differs from the declared count.
pub fn decode_key(key: &[u8]) -> Result<DecodedKey> {
    if key.len() < KEY_HEADER_LEN {
        return Err(RecorderError::MalformedKey(format!(
            "key is {} bytes, header needs {}",
            key.len(),
            KEY_HEADER_LEN
        )));
    }

    let mut cursor = Cursor::new(key);
    let header = (|| -> std::io::Result<(u64, i32, u8, u8, i32)> {
        Ok((
            cursor.read_u64::<LittleEndian>()?,
            cursor.read_i32::<LittleEndian>()?,
            cursor.read_u8()?,
            cursor.read_u8()?,
            cursor.read_i32::<LittleEndian>()?,
        ))
    })()
    .map_err(|e| RecorderError::MalformedKey(e.to_string()))?;
    let (thread_id, func_id, depth, arg_count, args_len) = header;

    let body = &key[KEY_HEADER_LEN..];
    if args_len < 0 || args_len as usize != body.len() {
        return Err(RecorderError::MalformedKey(format!(
            "argument section declares {} bytes, key holds {}",
            args_len,
            body.len()
        )));
    }

    let mut args = Vec::with_capacity(arg_count as usize);
    let mut start = 0;
    for (i, byte) in body.iter().enumerate() {
        if *byte == b' ' {
            let arg = std::str::from_utf8(&body[start..i])
                .map_err(|e| RecorderError::MalformedKey(format!("argument {}: {}", args.len(), e)))?;
            args.push(arg.to_string());
            start = i + 1;
        }
    }

    if start != body.len() || args.len() != arg_count as usize {
        return Err(RecorderError::MalformedKey(format!(
            "declares {} arguments, found {}",
            arg_count,
            args.len()
        )));
    }

    Ok(DecodedKey {
        thread_id,
        func_id,
        depth,
        args,
    })
}
