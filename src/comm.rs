//! Process group boundary
//!
//! The merge only needs blocking point-to-point messages plus three
//! collectives built on them. [`Communicator`] captures exactly that, so the
//! recorder runs unchanged over a real process group, a single process, or
//! the in-process [`LocalGroup`] used to simulate N ranks with N threads.
//!
//! ```text
//!          rank 0          rank 1          rank 2
//!            │◄── send ───────┤               │
//!            │◄────────────── send ───────────┤     gather(0)
//!            ├── send ───────►│               │
//!            ├────────────── send ───────────►│     broadcast(0)
//! ```
//!
//! Every call blocks until its peer participates. There are no timeouts: a
//! peer that never arrives stalls the group.

use crate::error::{RecorderError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

pub const TAG_CST_MERGE: u32 = 1;
pub const TAG_BROADCAST: u32 = 2;
pub const TAG_GATHER: u32 = 3;
pub const TAG_BARRIER: u32 = 4;

/// Blocking message passing between the ranks of one trace session
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, dest: usize, tag: u32, bytes: &[u8]) -> Result<()>;

    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>>;

    /// Root's `bytes` delivered to every rank; non-root input is ignored
    fn broadcast(&self, root: usize, bytes: &[u8]) -> Result<Vec<u8>> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send(dest, TAG_BROADCAST, bytes)?;
            }
            Ok(bytes.to_vec())
        } else {
            self.recv(root, TAG_BROADCAST)
        }
    }

    /// Every rank's `bytes`, in rank order, at `root` only
    fn gather(&self, root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() != root {
            self.send(root, TAG_GATHER, bytes)?;
            return Ok(None);
        }

        let mut all = Vec::with_capacity(self.size());
        for src in 0..self.size() {
            if src == root {
                all.push(bytes.to_vec());
            } else {
                all.push(self.recv(src, TAG_GATHER)?);
            }
        }
        Ok(Some(all))
    }

    fn barrier(&self) -> Result<()> {
        self.gather(0, &[]).map(|_| ())?;
        self.broadcast(0, &[]).map(|_| ())
    }
}

/// A group of one
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _tag: u32, _bytes: &[u8]) -> Result<()> {
        Err(RecorderError::Comm(format!("no rank {} in a single-process group", dest)))
    }

    fn recv(&self, src: usize, _tag: u32) -> Result<Vec<u8>> {
        Err(RecorderError::Comm(format!("no rank {} in a single-process group", src)))
    }
}

#[derive(Debug)]
struct Message {
    tag: u32,
    payload: Vec<u8>,
}

/// One rank of an in-process group
///
/// Every ordered pair of ranks has its own FIFO channel, so messages between
/// two ranks arrive in send order.
#[derive(Debug)]
pub struct LocalEndpoint {
    rank: usize,
    outbox: Vec<Sender<Message>>,
    inbox: Vec<Receiver<Message>>,
}

/// Factory for in-process groups
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected endpoints, indexed by rank
    ///
    /// # Example
    /// ```
    /// use iorecorder::comm::{Communicator, LocalGroup};
    ///
    /// let mut ranks = LocalGroup::new(2);
    /// let one = ranks.pop().unwrap();
    /// let zero = ranks.pop().unwrap();
    ///
    /// let peer = std::thread::spawn(move || one.broadcast(0, &[]).unwrap());
    /// zero.broadcast(0, b"hello").unwrap();
    /// assert_eq!(peer.join().unwrap(), b"hello");
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        let mut outboxes: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut inboxes: Vec<Vec<Option<Receiver<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();

        for (src, outbox) in outboxes.iter_mut().enumerate() {
            for inbox in inboxes.iter_mut() {
                let (tx, rx) = unbounded();
                outbox.push(tx);
                inbox[src] = Some(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outbox, inbox))| LocalEndpoint {
                rank,
                outbox,
                inbox: inbox.into_iter().flatten().collect(),
            })
            .collect()
    }
}

impl LocalEndpoint {
    fn peer<'a, T>(&self, list: &'a [T], peer: usize) -> Result<&'a T> {
        list.get(peer).ok_or_else(|| {
            RecorderError::Comm(format!(
                "rank {} addressed rank {} in a group of {}",
                self.rank,
                peer,
                list.len()
            ))
        })
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outbox.len()
    }

    fn send(&self, dest: usize, tag: u32, bytes: &[u8]) -> Result<()> {
        debug!("rank {} -> {} tag {} ({} bytes)", self.rank, dest, tag, bytes.len());
        self.peer(&self.outbox, dest)?
            .send(Message {
                tag,
                payload: bytes.to_vec(),
            })
            .map_err(|_| RecorderError::Comm(format!("rank {} has left the group", dest)))
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        let message = self
            .peer(&self.inbox, src)?
            .recv()
            .map_err(|_| RecorderError::Comm(format!("rank {} has left the group", src)))?;

        if message.tag != tag {
            return Err(RecorderError::Comm(format!(
                "rank {} expected tag {} from rank {}, got {}",
                self.rank, tag, src, message.tag
            )));
        }
        debug!("rank {} <- {} tag {} ({} bytes)", self.rank, src, tag, message.payload.len());
        Ok(message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalEndpoint) -> T + Send + Sync + Copy + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalGroup::new(size)
            .into_iter()
            .map(|ep| thread::spawn(move || f(ep)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_endpoints_know_their_rank() {
        let ranks = LocalGroup::new(4);
        for (i, ep) in ranks.iter().enumerate() {
            assert_eq!(ep.rank(), i);
            assert_eq!(ep.size(), 4);
        }
    }

    #[test]
    fn test_point_to_point_fifo() {
        let results = run_group(2, |ep| {
            if ep.rank() == 1 {
                for i in 0..10u8 {
                    ep.send(0, 7, &[i]).unwrap();
                }
                Vec::new()
            } else {
                (0..10).map(|_| ep.recv(1, 7).unwrap()[0]).collect()
            }
        });
        assert_eq!(results[0], (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_gather_in_rank_order() {
        let results = run_group(5, |ep| ep.gather(0, &[ep.rank() as u8; 2]).unwrap());
        let at_root = results[0].clone().unwrap();
        assert_eq!(at_root.len(), 5);
        for (r, payload) in at_root.iter().enumerate() {
            assert_eq!(payload, &vec![r as u8; 2]);
        }
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_broadcast_and_barrier() {
        let results = run_group(3, |ep| {
            ep.barrier().unwrap();
            let input: &[u8] = if ep.rank() == 2 { b"from two" } else { b"" };
            ep.broadcast(2, input).unwrap()
        });
        assert!(results.iter().all(|r| r == b"from two"));
    }

    #[test]
    fn test_tag_mismatch() {
        let results = run_group(2, |ep| {
            if ep.rank() == 0 {
                ep.send(1, TAG_GATHER, b"x").map(|_| ())
            } else {
                ep.recv(0, TAG_BROADCAST).map(|_| ())
            }
        });
        assert!(matches!(results[1], Err(RecorderError::Comm(_))));
    }

    #[test]
    fn test_peer_gone() {
        let mut ranks = LocalGroup::new(2);
        let one = ranks.pop().unwrap();
        drop(ranks);
        assert!(matches!(one.recv(0, TAG_GATHER), Err(RecorderError::Comm(_))));
        assert!(one.send(5, TAG_GATHER, b"").is_err());
    }

    #[test]
    fn test_single_process() {
        let solo = SingleProcess;
        assert_eq!(solo.broadcast(0, b"abc").unwrap(), b"abc");
        assert_eq!(solo.gather(0, b"x").unwrap(), Some(vec![b"x".to_vec()]));
        assert!(solo.barrier().is_ok());
        assert!(solo.send(1, TAG_GATHER, b"").is_err());
    }
}
