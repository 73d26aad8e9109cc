// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The collective-communication fabric coupling the ranks.
//!
//! The redistribution tasks need only a small set of operations:
//! communicators split by colour, gather/scatter of variable-sized
//! buffers, allgather/allreduce of small integer vectors, broadcast, and
//! point-to-point send/recv. [Communicator] captures exactly that set, so
//! the pipeline never depends on a particular fabric's semantics beyond
//! it. [LocalFabric] connects ranks running as threads of one process and
//! is what the tests and the single-process multi-rank mode use; an MPI
//! binding would be an alternative implementation.
//!
//! Failure at this layer is fatal: a lost peer stalls the whole pipeline,
//! so operations time out into [TransportError] rather than blocking
//! forever.

mod local;

pub use local::LocalFabric;

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer rank {0} is gone; collective cannot complete")]
    PeerLost(usize),

    #[error("Timed out after {0:?} waiting on a collective; peers did not arrive")]
    Timeout(std::time::Duration),

    #[error("Collective payload mismatch: {0}")]
    Malformed(String),
}

/// Group of peer ranks with collective operations. All collective methods
/// must be called by every rank of the group, in the same order.
pub trait Communicator: Send + Sync {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Partition the group: ranks passing the same `colour` end up in the
    /// same sub-group, ordered by `key` (ties broken by parent rank).
    fn split(&self, colour: u32, key: u32) -> Result<Arc<dyn Communicator>, TransportError>;

    /// Every rank contributes a buffer; every rank receives all buffers
    /// indexed by rank.
    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Element-wise sum of equal-length vectors across the group.
    fn allreduce_sum(&self, data: &[i64]) -> Result<Vec<i64>, TransportError>;

    /// Root receives every rank's buffer (indexed by rank); other ranks
    /// get `None`.
    fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>, TransportError>;

    /// Root supplies one buffer per rank; every rank receives its own.
    fn scatterv(
        &self,
        root: usize,
        parts: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Root's buffer is delivered to every rank.
    fn broadcast(&self, root: usize, data: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError>;

    /// Point-to-point send within the group.
    fn send(&self, to: usize, data: &[u8]) -> Result<(), TransportError>;

    /// Point-to-point receive within the group.
    fn recv(&self, from: usize) -> Result<Vec<u8>, TransportError>;
}

// Byte-level helpers for the typed payloads the collective tasks move.
// Everything on the fabric is little-endian.

pub fn encode_f64s(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_f64s(bytes: &[u8]) -> Result<Vec<f64>, TransportError> {
    if bytes.len() % 8 != 0 {
        return Err(TransportError::Malformed(format!(
            "f64 payload of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>, TransportError> {
    if bytes.len() % 4 != 0 {
        return Err(TransportError::Malformed(format!(
            "f32 payload of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn encode_u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_u32s(bytes: &[u8]) -> Result<Vec<u32>, TransportError> {
    if bytes.len() % 4 != 0 {
        return Err(TransportError::Malformed(format!(
            "u32 payload of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn encode_bools(values: &[bool]) -> Vec<u8> {
    values.iter().map(|&b| b as u8).collect()
}

pub fn decode_bools(bytes: &[u8]) -> Vec<bool> {
    bytes.iter().map(|&b| b != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_round_trip() {
        let values = [0.0, -1.5, 6.02e23];
        assert_eq!(decode_f64s(&encode_f64s(&values)).unwrap(), values);
        assert!(decode_f64s(&[0u8; 7]).is_err());
    }

    #[test]
    fn u32_round_trip() {
        let values = [0u32, 1, u32::MAX];
        assert_eq!(decode_u32s(&encode_u32s(&values)).unwrap(), values);
    }

    #[test]
    fn bool_round_trip() {
        let values = [true, false, true];
        assert_eq!(decode_bools(&encode_bools(&values)), values);
    }
}
