// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-process fabric: one rank per thread, mailboxes per rank pair.
//!
//! Collectives are built from point-to-point mailboxes (unbounded
//! channels), so no operation can deadlock against another rank that has
//! already posted its contribution. Split communicators materialise
//! mailboxes lazily from a registry shared by the whole fabric; every
//! member derives the same registry keys deterministically, so no extra
//! coordination round is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Communicator, TransportError};

/// How long a rank waits on a peer before declaring the fabric dead.
const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(60);

type Mailbox = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

#[derive(Default)]
struct Registry {
    mailboxes: Mutex<HashMap<(String, usize, usize), Mailbox>>,
}

impl Registry {
    fn mailbox(&self, comm: &str, from: usize, to: usize) -> Mailbox {
        let mut map = self.mailboxes.lock().unwrap();
        map.entry((comm.to_string(), from, to))
            .or_insert_with(unbounded)
            .clone()
    }
}

/// One rank's endpoint of an in-process communicator group.
pub struct LocalFabric {
    registry: Arc<Registry>,
    /// Registry namespace of this communicator; extended on every split.
    path: String,
    rank: usize,
    /// Parent ranks of the group members, in group-rank order.
    members: Vec<usize>,
    split_seq: AtomicU64,
}

impl LocalFabric {
    /// Create a world of `n` connected endpoints, index = rank.
    pub fn new_world(n: usize) -> Vec<Arc<dyn Communicator>> {
        assert!(n > 0);
        let registry = Arc::new(Registry::default());
        (0..n)
            .map(|rank| {
                Arc::new(LocalFabric {
                    registry: Arc::clone(&registry),
                    path: "world".to_string(),
                    rank,
                    members: (0..n).collect(),
                    split_seq: AtomicU64::new(0),
                }) as Arc<dyn Communicator>
            })
            .collect()
    }

    /// A single-rank world for serial runs.
    pub fn solo() -> Arc<dyn Communicator> {
        Self::new_world(1).pop().unwrap()
    }

    fn post(&self, to: usize, data: Vec<u8>) -> Result<(), TransportError> {
        let global_to = self.members[to];
        let global_from = self.members[self.rank];
        let (tx, _) = self.registry.mailbox(&self.path, global_from, global_to);
        tx.send(data).map_err(|_| TransportError::PeerLost(to))
    }

    fn take(&self, from: usize) -> Result<Vec<u8>, TransportError> {
        let global_from = self.members[from];
        let global_to = self.members[self.rank];
        let (_, rx) = self.registry.mailbox(&self.path, global_from, global_to);
        rx.recv_timeout(COLLECTIVE_TIMEOUT)
            .map_err(|_| TransportError::Timeout(COLLECTIVE_TIMEOUT))
    }
}

impl Communicator for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn split(&self, colour: u32, key: u32) -> Result<Arc<dyn Communicator>, TransportError> {
        let seq = self.split_seq.fetch_add(1, Ordering::SeqCst);
        let pairs = self.allgather(&[colour.to_le_bytes(), key.to_le_bytes()].concat())?;

        // Group members sorted by (key, parent rank), like a colour split.
        let mut group: Vec<(u32, usize)> = Vec::new();
        for (rank, bytes) in pairs.iter().enumerate() {
            if bytes.len() != 8 {
                return Err(TransportError::Malformed("split exchange".to_string()));
            }
            let c = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            let k = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            if c == colour {
                group.push((k, rank));
            }
        }
        group.sort_unstable();
        let members: Vec<usize> = group.iter().map(|&(_, r)| self.members[r]).collect();
        let rank = group
            .iter()
            .position(|&(_, r)| r == self.rank)
            .expect("own rank is always in its own colour group");

        Ok(Arc::new(LocalFabric {
            registry: Arc::clone(&self.registry),
            path: format!("{}/{}:{}", self.path, seq, colour),
            rank,
            members,
            split_seq: AtomicU64::new(0),
        }))
    }

    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        for to in 0..self.size() {
            if to != self.rank {
                self.post(to, data.to_vec())?;
            }
        }
        let mut out = Vec::with_capacity(self.size());
        for from in 0..self.size() {
            if from == self.rank {
                out.push(data.to_vec());
            } else {
                out.push(self.take(from)?);
            }
        }
        Ok(out)
    }

    fn allreduce_sum(&self, data: &[i64]) -> Result<Vec<i64>, TransportError> {
        let encoded: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let all = self.allgather(&encoded)?;
        let mut sums = vec![0i64; data.len()];
        for bytes in all {
            if bytes.len() != data.len() * 8 {
                return Err(TransportError::Malformed(
                    "allreduce length mismatch across ranks".to_string(),
                ));
            }
            for (i, chunk) in bytes.chunks_exact(8).enumerate() {
                sums[i] += i64::from_le_bytes(chunk.try_into().unwrap());
            }
        }
        Ok(sums)
    }

    fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if self.rank == root {
            let mut out = Vec::with_capacity(self.size());
            for from in 0..self.size() {
                if from == root {
                    out.push(data.to_vec());
                } else {
                    out.push(self.take(from)?);
                }
            }
            Ok(Some(out))
        } else {
            self.post(root, data.to_vec())?;
            Ok(None)
        }
    }

    fn scatterv(
        &self,
        root: usize,
        parts: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, TransportError> {
        if self.rank == root {
            let parts = parts.ok_or_else(|| {
                TransportError::Malformed("scatterv root supplied no parts".to_string())
            })?;
            if parts.len() != self.size() {
                return Err(TransportError::Malformed(format!(
                    "scatterv got {} parts for {} ranks",
                    parts.len(),
                    self.size()
                )));
            }
            let mut own = Vec::new();
            for (to, part) in parts.into_iter().enumerate() {
                if to == root {
                    own = part;
                } else {
                    self.post(to, part)?;
                }
            }
            Ok(own)
        } else {
            self.take(root)
        }
    }

    fn broadcast(&self, root: usize, data: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
        if self.rank == root {
            let data = data.ok_or_else(|| {
                TransportError::Malformed("broadcast root supplied no data".to_string())
            })?;
            for to in 0..self.size() {
                if to != root {
                    self.post(to, data.clone())?;
                }
            }
            Ok(data)
        } else {
            self.take(root)
        }
    }

    fn send(&self, to: usize, data: &[u8]) -> Result<(), TransportError> {
        self.post(to, data.to_vec())
    }

    fn recv(&self, from: usize) -> Result<Vec<u8>, TransportError> {
        self.take(from)
    }
}
