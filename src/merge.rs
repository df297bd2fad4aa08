//! Cross-rank merge of call signature tables
//!
//! Hypercube reduction over `ceil(log2(P))` phases. In phase `k` a rank whose
//! bit `k` is set sends its table to `rank ^ 2^k` and leaves the reduction;
//! otherwise it absorbs the table from `rank | 2^k` when that rank exists.
//!
//! ```text
//! P = 6     phase 0          phase 1         phase 2
//!           1 -> 0           2 -> 0          4 -> 0
//!           3 -> 2
//!           5 -> 4
//! ```
//!
//! Rank 0 ends up with the union of all tables, renumbers it densely in its
//! insertion order and broadcasts it. Every rank then translates its local
//! terminal ids to global ones and remaps its grammar.

use crate::comm::{Communicator, TAG_CST_MERGE};
use crate::cst::CallSignatureTable;
use crate::error::{RecorderError, Result};
use crate::grammar::Grammar;
use crate::persist::UniqueGrammars;
use fnv::FnvHashMap;
use tracing::{debug, info, warn};

/// Reduce every rank's table into one at rank 0, renumber it and share it
///
/// Returns the global table on every rank.
pub fn merge_tables(local: &CallSignatureTable, comm: &dyn Communicator) -> Result<CallSignatureTable> {
    let rank = comm.rank();
    let size = comm.size();
    let mut merged = local.clone();

    let mut mask = 1usize;
    while mask < size {
        if rank & mask != 0 {
            let partner = rank ^ mask;
            debug!("merge phase {}: rank {} sends {} signatures to {}", mask.trailing_zeros(), rank, merged.len(), partner);
            comm.send(partner, TAG_CST_MERGE, &merged.serialize())?;
            break;
        }

        let partner = rank | mask;
        if partner < size {
            let bytes = comm.recv(partner, TAG_CST_MERGE)?;
            let received = CallSignatureTable::deserialize(&bytes, partner as i32)?;
            debug!(
                "merge phase {}: rank {} absorbs {} signatures from {}",
                mask.trailing_zeros(),
                rank,
                received.len(),
                partner
            );
            for signature in received.iter().cloned() {
                merged.absorb(signature);
            }
        }
        mask <<= 1;
    }

    let global = if rank == 0 {
        merged.reassign_terminals();
        info!(
            "merged call signatures of {} ranks: {} distinct, {} calls",
            size,
            merged.len(),
            merged.total_calls()
        );
        comm.broadcast(0, &merged.serialize())?;
        merged
    } else {
        let bytes = comm.broadcast(0, &[])?;
        CallSignatureTable::deserialize(&bytes, 0)?
    };

    Ok(global)
}

/// Local terminal id -> global terminal id
///
/// A local key missing from the global table means the merge lost a
/// signature; this is reported as [`RecorderError::UnknownTerminal`].
pub fn translation_table(
    local: &CallSignatureTable,
    global: &CallSignatureTable,
) -> Result<FnvHashMap<i32, i32>> {
    local
        .iter()
        .map(|signature| {
            global
                .get(&signature.key)
                .map(|g| (signature.terminal_id, g.terminal_id))
                .ok_or(RecorderError::UnknownTerminal(signature.terminal_id))
        })
        .collect()
}

/// Full merge step for one rank: reduce, translate, remap
pub fn merge_and_remap(
    local: &CallSignatureTable,
    grammar: &mut Grammar,
    comm: &dyn Communicator,
) -> Result<CallSignatureTable> {
    let global = merge_tables(local, comm)?;
    let translation = translation_table(local, &global)?;
    grammar.remap(&translation)?;
    Ok(global)
}

/// Gather every rank's serialized grammar at rank 0 and keep one copy of each
///
/// An empty `grammar` marks a rank that has nothing valid to contribute; it
/// still takes part so the collective completes. Returns `None` off rank 0.
pub fn gather_unique_grammars(grammar: &[u8], comm: &dyn Communicator) -> Result<Option<UniqueGrammars>> {
    let Some(all) = comm.gather(0, grammar)? else {
        return Ok(None);
    };

    let mut slot_of: FnvHashMap<&[u8], usize> = FnvHashMap::default();
    let mut first_seen = Vec::new();
    let mut index = Vec::with_capacity(all.len());
    for (rank, payload) in all.iter().enumerate() {
        if payload.is_empty() {
            warn!("rank {} sent no grammar", rank);
            index.push(None);
            continue;
        }
        let next = slot_of.len();
        let slot = *slot_of.entry(payload.as_slice()).or_insert_with(|| {
            first_seen.push(rank);
            next
        });
        index.push(Some(slot));
    }

    let grammars: Vec<Vec<u8>> = first_seen.iter().map(|&rank| all[rank].clone()).collect();
    info!("{} distinct grammars across {} ranks", grammars.len(), comm.size());
    Ok(Some(UniqueGrammars { grammars, index }))
}
