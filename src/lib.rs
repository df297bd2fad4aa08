//! iorecorder - always-on tracer core for parallel I/O
//!
//! Intercepted calls are stitched per thread, deduplicated into a call
//! signature table, and folded into an online grammar whose size follows the
//! number of distinct repeating patterns rather than the number of calls.
//! At shutdown the signature tables of all ranks are merged, grammars are
//! remapped to global ids, and the trace is written for offline decoding.

pub mod cli;
pub mod comm;
pub mod config;
pub mod cst;
pub mod error;
pub mod functions;
pub mod grammar;
pub mod merge;
pub mod persist;
pub mod reader;
pub mod record;
pub mod session;
pub mod signature;
pub mod stitcher;
pub mod timestamps;

pub use error::{RecorderError, Result};
