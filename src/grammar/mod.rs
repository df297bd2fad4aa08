// Online grammar compression of the per-process call sequence
//
// Every completed call becomes one terminal (its call signature id). The
// grammar absorbs terminals one at a time and keeps two invariants after each
// append: no digram occurs twice, and every rule except the start rule is used
// at least twice. Repetitive I/O phases (open, write x N, close, repeated per
// timestep) collapse into a handful of rules whose size tracks the number of
// distinct patterns instead of the number of calls.
//
// Rule ids: the start rule is 0, created rules are -1, -2, ... and ids are
// never reused. Terminals are the non-negative signature ids.
//
// Flat integer form (also the payload of `<rank>.cfg`):
//
//   [rule_count, (rule_id, symbol_count, (value, exp) * symbol_count) * rule_count]

mod sequitur;

pub use sequitur::{Expansion, Symbol, START_RULE};

use crate::error::{RecorderError, Result};
use fnv::FnvHashMap;
use sequitur::Engine;
use thiserror::Error;

/// A broken grammar invariant, reported by [`Grammar::check_invariants`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("digram ({first:?}, {second:?}) occurs more than once")]
    DuplicateDigram { first: Symbol, second: Symbol },

    #[error("rule {rule} is used {uses} time(s)")]
    UnderusedRule { rule: i32, uses: u64 },
}

/// One rule and its right-hand side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleView {
    pub id: i32,
    pub body: Vec<Symbol>,
}

/// Grow-only grammar over call signature ids
///
/// # Example
/// ```
/// use iorecorder::grammar::Grammar;
///
/// let mut grammar = Grammar::new();
/// for t in [0, 1, 1, 1, 2, 0, 1, 1, 1, 2] {
///     grammar.append(t).unwrap();
/// }
/// assert_eq!(grammar.decode(), vec![0, 1, 1, 1, 2, 0, 1, 1, 1, 2]);
/// assert!(grammar.check_invariants().is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Grammar {
    engine: Engine,
    appended: u64,
}

impl Grammar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one terminal to the start rule and restore both invariants
    ///
    /// Terminal ids are non-negative; negative ids name rules and are
    /// rejected with [`RecorderError::UnknownTerminal`], leaving the grammar
    /// untouched.
    pub fn append(&mut self, terminal: i32) -> Result<()> {
        if terminal < 0 {
            return Err(RecorderError::UnknownTerminal(terminal));
        }
        self.engine.append(terminal);
        self.appended += 1;
        Ok(())
    }

    /// Lazily expand the start rule
    pub fn iter(&self) -> Expansion<'_> {
        self.engine.expand()
    }

    /// Full terminal sequence
    pub fn decode(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.engine.expanded_len().min(1 << 24) as usize);
        out.extend(self.iter());
        out
    }

    /// Length of the decoded sequence, computed without expanding
    pub fn expanded_len(&self) -> u64 {
        self.engine.expanded_len()
    }

    /// Terminals appended through this instance (0 for deserialized grammars)
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Rewrite every terminal through `translation` (old id -> new id)
    ///
    /// Either every terminal is rewritten or, on
    /// [`RecorderError::UnknownTerminal`], none is.
    pub fn remap(&mut self, translation: &FnvHashMap<i32, i32>) -> Result<()> {
        self.engine
            .remap_terminals(|old| translation.get(&old).copied())
            .map_err(RecorderError::UnknownTerminal)
    }

    pub fn rule_count(&self) -> usize {
        self.engine.rule_count()
    }

    pub fn symbol_count(&self) -> usize {
        self.engine.symbol_count()
    }

    /// All live rules, start rule first
    pub fn rules(&self) -> Vec<RuleView> {
        self.engine
            .rule_bodies()
            .into_iter()
            .map(|(id, body)| RuleView { id, body })
            .collect()
    }

    /// Verify digram uniqueness and rule utility
    pub fn check_invariants(&self) -> std::result::Result<(), InvariantViolation> {
        let (uses, duplicate) = self.engine.audit();
        if let Some((first, second)) = duplicate {
            return Err(InvariantViolation::DuplicateDigram { first, second });
        }

        // Earliest created offender first
        let mut underused: Vec<(i32, u64)> = uses.into_iter().filter(|(_, n)| *n < 2).collect();
        underused.sort_by_key(|(id, _)| std::cmp::Reverse(*id));
        match underused.first() {
            Some(&(rule, uses)) => Err(InvariantViolation::UnderusedRule { rule, uses }),
            None => Ok(()),
        }
    }

    pub fn serialize(&self) -> Vec<i32> {
        let rules = self.engine.rule_bodies();
        let symbols: usize = rules.iter().map(|(_, b)| b.len()).sum();
        let mut out = Vec::with_capacity(1 + 2 * rules.len() + 2 * symbols);

        out.push(rules.len() as i32);
        for (id, body) in rules {
            out.push(id);
            out.push(body.len() as i32);
            for symbol in body {
                out.push(symbol.value);
                out.push(symbol.exp as i32);
            }
        }
        out
    }

    /// Inverse of [`serialize`](Self::serialize)
    ///
    /// Rejects truncated input, trailing data, zero exponents, references to
    /// undefined rules and recursive rules with [`RecorderError::Corrupt`].
    pub fn deserialize(ints: &[i32]) -> Result<Self> {
        let mut reader = IntReader { ints, pos: 0 };

        let rule_count = reader.count("rule count")?;
        let mut rules = Vec::with_capacity(rule_count.min(ints.len()));
        for _ in 0..rule_count {
            let id = reader.next("rule id")?;
            let symbol_count = reader.count("symbol count")?;
            if symbol_count.saturating_mul(2) > reader.remaining() {
                return Err(corrupt(format!(
                    "rule {} declares {} symbols, {} ints left",
                    id,
                    symbol_count,
                    reader.remaining()
                )));
            }
            let mut body = Vec::with_capacity(symbol_count);
            for _ in 0..symbol_count {
                let value = reader.next("symbol")?;
                let exp = reader.next("exponent")? as u32;
                body.push(Symbol { value, exp });
            }
            rules.push((id, body));
        }

        if reader.remaining() != 0 {
            return Err(corrupt(format!("{} trailing ints", reader.remaining())));
        }

        let engine = Engine::from_rules(rules).map_err(corrupt)?;
        Ok(Self { engine, appended: 0 })
    }

    /// Little-endian byte form of [`serialize`](Self::serialize)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.serialize().iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(corrupt(format!("{} bytes is not a whole number of ints", bytes.len())));
        }
        let ints: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::deserialize(&ints)
    }
}

fn corrupt(detail: impl std::fmt::Display) -> RecorderError {
    RecorderError::Corrupt(format!("grammar: {}", detail))
}

struct IntReader<'a> {
    ints: &'a [i32],
    pos: usize,
}

impl IntReader<'_> {
    fn next(&mut self, what: &str) -> Result<i32> {
        let value = self
            .ints
            .get(self.pos)
            .copied()
            .ok_or_else(|| corrupt(format!("truncated before {}", what)))?;
        self.pos += 1;
        Ok(value)
    }

    fn count(&mut self, what: &str) -> Result<usize> {
        let value = self.next(what)?;
        usize::try_from(value).map_err(|_| corrupt(format!("negative {} {}", what, value)))
    }

    fn remaining(&self) -> usize {
        self.ints.len() - self.pos
    }
}
