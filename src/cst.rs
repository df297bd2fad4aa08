//! Call Signature Table (CST)
//!
//! Content-addressed set of unique call shapes. Each new key receives the next
//! dense terminal id, in first-seen order; the grammar only ever stores these
//! ids. Entries keep insertion order so iteration (and therefore
//! serialization and merged id assignment) is deterministic.

use crate::error::{RecorderError, Result};
use crate::signature::{decode_key, DecodedKey};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fnv::FnvHashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// One unique call shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignature {
    pub key: Arc<[u8]>,
    pub terminal_id: i32,
    /// Number of calls with this shape
    pub count: u32,
    /// Rank that first recorded the shape
    pub rank: i32,
}

impl CallSignature {
    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    pub fn decode(&self) -> Result<DecodedKey> {
        decode_key(&self.key)
    }
}

/// Per-process (or merged) signature table
#[derive(Debug, Clone, Default)]
pub struct CallSignatureTable {
    rank: i32,
    entries: Vec<CallSignature>,
    by_key: FnvHashMap<Arc<[u8]>, usize>,
    by_terminal: FnvHashMap<i32, usize>,
    next_terminal: i32,
}

impl CallSignatureTable {
    /// Empty table owned by `rank`
    pub fn new(rank: i32) -> Self {
        Self {
            rank,
            ..Default::default()
        }
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Return the terminal id for `key`, inserting it if unseen
    ///
    /// # Example
    /// ```
    /// use iorecorder::cst::CallSignatureTable;
    ///
    /// let mut cst = CallSignatureTable::new(0);
    /// assert_eq!(cst.intern(b"open"), 0);
    /// assert_eq!(cst.intern(b"write"), 1);
    /// assert_eq!(cst.intern(b"open"), 0);
    /// assert_eq!(cst.get(b"open").unwrap().count, 2);
    /// ```
    pub fn intern(&mut self, key: &[u8]) -> i32 {
        if let Some(&slot) = self.by_key.get(key) {
            let entry = &mut self.entries[slot];
            entry.count = entry.count.saturating_add(1);
            return entry.terminal_id;
        }

        let terminal_id = self.next_terminal;
        self.next_terminal += 1;
        self.insert(CallSignature {
            key: Arc::from(key),
            terminal_id,
            count: 1,
            rank: self.rank,
        });
        terminal_id
    }

    /// Fold a signature from another table into this one
    ///
    /// Known keys add their counts; unknown keys are appended with a
    /// provisional terminal id and keep their originating rank.
    pub fn absorb(&mut self, signature: CallSignature) {
        if let Some(&slot) = self.by_key.get(&signature.key[..]) {
            let entry = &mut self.entries[slot];
            entry.count = entry.count.saturating_add(signature.count);
            return;
        }

        let terminal_id = self.next_terminal;
        self.next_terminal += 1;
        self.insert(CallSignature {
            terminal_id,
            ..signature
        });
    }

    /// Renumber terminals densely in table order
    pub fn reassign_terminals(&mut self) {
        self.by_terminal.clear();
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            entry.terminal_id = slot as i32;
            self.by_terminal.insert(slot as i32, slot);
        }
        self.next_terminal = self.entries.len() as i32;
    }

    pub fn get(&self, key: &[u8]) -> Option<&CallSignature> {
        self.by_key.get(key).map(|&slot| &self.entries[slot])
    }

    pub fn lookup_terminal(&self, terminal_id: i32) -> Option<&CallSignature> {
        self.by_terminal
            .get(&terminal_id)
            .map(|&slot| &self.entries[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallSignature> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total calls represented by the table
    pub fn total_calls(&self) -> u64 {
        self.entries.iter().map(|e| e.count as u64).sum()
    }

    /// Binary form: `entries: i32`, then per entry
    /// `terminal_id: i32, rank: i32, key_len: i32, count: u32, key bytes`
    /// (all little-endian)
    pub fn serialize(&self) -> Vec<u8> {
        let payload: usize = self.entries.iter().map(|e| 16 + e.key.len()).sum();
        let mut out = Vec::with_capacity(4 + payload);

        let _ = out.write_i32::<LittleEndian>(self.entries.len() as i32);
        for entry in &self.entries {
            let _ = out.write_i32::<LittleEndian>(entry.terminal_id);
            let _ = out.write_i32::<LittleEndian>(entry.rank);
            let _ = out.write_i32::<LittleEndian>(entry.key.len() as i32);
            let _ = out.write_u32::<LittleEndian>(entry.count);
            out.extend_from_slice(&entry.key);
        }
        out
    }

    /// Inverse of [`serialize`](Self::serialize)
    pub fn deserialize(data: &[u8], rank: i32) -> Result<Self> {
        let corrupt = |e: std::io::Error| RecorderError::Corrupt(format!("call signature table: {}", e));
        let mut cursor = Cursor::new(data);

        let entries = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
        if entries < 0 {
            return Err(RecorderError::Corrupt(format!(
                "call signature table: negative entry count {}",
                entries
            )));
        }

        let mut table = Self::new(rank);
        for _ in 0..entries {
            let terminal_id = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
            let entry_rank = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
            let key_len = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
            let count = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;

            let remaining = data.len() - cursor.position() as usize;
            if key_len < 0 || key_len as usize > remaining {
                return Err(RecorderError::Corrupt(format!(
                    "call signature table: key length {} with {} bytes left",
                    key_len, remaining
                )));
            }
            let mut key = vec![0u8; key_len as usize];
            cursor.read_exact(&mut key).map_err(corrupt)?;

            if table.by_key.contains_key(&key[..]) {
                return Err(RecorderError::Corrupt(format!(
                    "call signature table: duplicate key for terminal {}",
                    terminal_id
                )));
            }
            if table.by_terminal.contains_key(&terminal_id) {
                return Err(RecorderError::Corrupt(format!(
                    "call signature table: duplicate terminal {}",
                    terminal_id
                )));
            }

            table.next_terminal = table.next_terminal.max(terminal_id.saturating_add(1));
            table.insert(CallSignature {
                key: Arc::from(key),
                terminal_id,
                count,
                rank: entry_rank,
            });
        }

        let trailing = data.len() - cursor.position() as usize;
        if trailing != 0 {
            return Err(RecorderError::Corrupt(format!(
                "call signature table: {} trailing bytes",
                trailing
            )));
        }
        Ok(table)
    }

    fn insert(&mut self, signature: CallSignature) {
        let slot = self.entries.len();
        self.by_key.insert(signature.key.clone(), slot);
        self.by_terminal.insert(signature.terminal_id, slot);
        self.entries.push(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_assigns_dense_ids() {
        let mut cst = CallSignatureTable::new(3);
        assert_eq!(cst.intern(b"a"), 0);
        assert_eq!(cst.intern(b"b"), 1);
        assert_eq!(cst.intern(b"c"), 2);
        assert_eq!(cst.len(), 3);
        assert!(cst.iter().all(|e| e.rank == 3));
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut cst = CallSignatureTable::new(0);
        let first = cst.intern(b"write");
        for _ in 0..9 {
            assert_eq!(cst.intern(b"write"), first);
        }
        assert_eq!(cst.get(b"write").unwrap().count, 10);
        assert_eq!(cst.len(), 1);
        assert_eq!(cst.total_calls(), 10);
    }

    #[test]
    fn test_lookup_by_terminal() {
        let mut cst = CallSignatureTable::new(0);
        cst.intern(b"x");
        let id = cst.intern(b"y");
        assert_eq!(&cst.lookup_terminal(id).unwrap().key[..], b"y");
        assert!(cst.lookup_terminal(99).is_none());
    }

    #[test]
    fn test_absorb_sums_and_preserves_rank() {
        let mut left = CallSignatureTable::new(0);
        left.intern(b"open");
        left.intern(b"write");

        let mut right = CallSignatureTable::new(1);
        right.intern(b"write");
        right.intern(b"write");
        right.intern(b"close");

        for sig in right.iter().cloned() {
            left.absorb(sig);
        }

        assert_eq!(left.len(), 3);
        assert_eq!(left.get(b"write").unwrap().count, 3);
        assert_eq!(left.get(b"write").unwrap().rank, 0);
        let close = left.get(b"close").unwrap();
        assert_eq!(close.rank, 1);
        assert_eq!(close.terminal_id, 2);
    }

    #[test]
    fn test_reassign_terminals() {
        let mut cst = CallSignatureTable::new(0);
        cst.absorb(CallSignature {
            key: Arc::from(&b"k1"[..]),
            terminal_id: 40,
            count: 1,
            rank: 2,
        });
        cst.absorb(CallSignature {
            key: Arc::from(&b"k0"[..]),
            terminal_id: 17,
            count: 1,
            rank: 5,
        });
        cst.reassign_terminals();

        let ids: Vec<i32> = cst.iter().map(|e| e.terminal_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(&cst.lookup_terminal(1).unwrap().key[..], b"k0");
    }

    #[test]
    fn test_serialize_layout() {
        let mut cst = CallSignatureTable::new(2);
        cst.intern(b"abc");
        let bytes = cst.serialize();

        assert_eq!(bytes.len(), 4 + 16 + 3);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0i32.to_le_bytes()); // terminal
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes()); // rank
        assert_eq!(&bytes[12..16], &3i32.to_le_bytes()); // key_len
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes()); // count
        assert_eq!(&bytes[20..], b"abc");
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut cst = CallSignatureTable::new(1);
        for key in [&b"open"[..], b"write", b"write", b"close"] {
            cst.intern(key);
        }

        let restored = CallSignatureTable::deserialize(&cst.serialize(), 1).unwrap();
        assert_eq!(restored.len(), 3);
        for (a, b) in cst.iter().zip(restored.iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(restored.get(b"write").unwrap().count, 2);
    }

    #[test]
    fn test_deserialize_truncated() {
        let mut cst = CallSignatureTable::new(0);
        cst.intern(b"payload");
        let bytes = cst.serialize();

        let result = CallSignatureTable::deserialize(&bytes[..bytes.len() - 2], 0);
        assert!(matches!(result, Err(RecorderError::Corrupt(_))));
        assert!(CallSignatureTable::deserialize(&[], 0).is_err());
    }

    #[test]
    fn test_deserialize_rejects_duplicates() {
        let mut cst = CallSignatureTable::new(0);
        cst.intern(b"dup");
        let mut bytes = cst.serialize();
        let entry = bytes[4..].to_vec();
        bytes.extend_from_slice(&entry);
        bytes[0..4].copy_from_slice(&2i32.to_le_bytes());

        assert!(matches!(
            CallSignatureTable::deserialize(&bytes, 0),
            Err(RecorderError::Corrupt(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut cst = CallSignatureTable::new(0);
        cst.intern(b"open");
        let mut bytes = cst.serialize();
        assert!(CallSignatureTable::deserialize(&bytes, 0).is_ok());

        bytes.push(0);
        assert!(matches!(
            CallSignatureTable::deserialize(&bytes, 0),
            Err(RecorderError::Corrupt(_))
        ));
    }
}
