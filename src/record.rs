//! Call records: the live event captured around an intercepted call, and the
//! fully reconstructed record produced by offline decoding.

use serde::{Deserialize, Serialize};

/// One intercepted call, owned by the stitcher until it is folded into the
/// signature table and grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub thread_id: u64,
    pub func_id: i32,
    /// Nesting depth at capture time, assigned by the stitcher
    pub depth: u8,
    /// Arguments already stringified by the interception layer. `None` marks
    /// an argument that could not be captured.
    pub args: Vec<Option<String>>,
    pub tstart: f64,
    pub tend: f64,
    pub return_value: Option<String>,
}

impl CallEvent {
    /// Create an event for a call that has just been entered
    pub fn new(thread_id: u64, func_id: i32, args: Vec<Option<String>>, tstart: f64) -> Self {
        Self {
            thread_id,
            func_id,
            depth: 0,
            args,
            tstart,
            tend: tstart,
            return_value: None,
        }
    }

    /// Convenience constructor for fully captured string arguments
    pub fn with_args<I, S>(thread_id: u64, func_id: i32, args: I, tstart: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            thread_id,
            func_id,
            args.into_iter().map(|a| Some(a.into())).collect(),
            tstart,
        )
    }

    /// Mark the call as finished
    pub fn complete(mut self, tend: f64, return_value: Option<String>) -> Self {
        self.tend = tend;
        self.return_value = return_value;
        self
    }

    pub fn duration(&self) -> f64 {
        self.tend - self.tstart
    }
}

/// A call reconstructed from a persisted trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub rank: usize,
    /// Zero when thread ids were not stored
    pub thread_id: u64,
    pub func_id: i32,
    pub func_name: Option<String>,
    pub depth: u8,
    pub args: Vec<String>,
    pub tstart: f64,
    pub tend: f64,
}

impl CallRecord {
    /// `name(arg1, arg2, ...)`, falling back to the numeric id
    pub fn call_text(&self) -> String {
        let name = match &self.func_name {
            Some(n) => n.clone(),
            None => format!("func_{}", self.func_id),
        };
        format!("{}({})", name, self.args.join(", "))
    }
}
