//! Connection identifiers and the self-routing encoding.
//!
//! Server-issued CIDs carry a host id, a process id, and a worker id in a
//! fixed prefix so that any host, process, or thread receiving a datagram can
//! route it to the owner without shared state.

use std::fmt;
use std::ops::Deref;

use rand::RngCore;
use thiserror::Error;

use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection: an opaque byte string of
/// length 0 to 20. Equality and hashing are over the bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Which of the two server processes sharing a port owns a connection.
///
/// A single bit: during a rollout exactly two instances coexist, the draining
/// one and its successor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ProcessId {
    #[default]
    Zero,
    One,
}

impl ProcessId {
    fn bit(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }

    fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Self::Zero
        } else {
            Self::One
        }
    }
}

/// The routing fields encoded into the prefix of every server-issued CID.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct ServerConnectionIdParams {
    /// Disambiguates machines behind one VIP.
    pub host_id: u16,
    /// Disambiguates the two processes coexisting during a rollout.
    pub process_id: ProcessId,
    /// Disambiguates worker threads within a process.
    pub worker_id: u8,
}

impl ServerConnectionIdParams {
    pub fn new(host_id: u16, process_id: ProcessId, worker_id: u8) -> Self {
        Self {
            host_id,
            process_id,
            worker_id,
        }
    }
}

/// The CID is not in a form this algorithm can interpret.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("connection id is not self-routable")]
pub struct ConnectionIdDecodeError;

/// The routing parameters cannot be represented in this algorithm's layout.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("routing parameters do not fit the connection id layout")]
pub struct ConnectionIdEncodeError;

/// Bidirectional mapping between routing parameters and server-issued CIDs.
pub trait ConnectionIdAlgo: Send + Sync {
    /// Issue a fresh CID carrying `params` in its routable prefix. Fails
    /// when a field is too wide for the algorithm's bit layout.
    fn encode(
        &self,
        params: ServerConnectionIdParams,
    ) -> Result<ConnectionId, ConnectionIdEncodeError>;
    /// Whether `cid` is in a form [`ConnectionIdAlgo::parse`] understands.
    fn can_parse(&self, cid: &ConnectionId) -> bool;
    /// Recover the routing parameters from a CID this server family issued.
    fn parse(&self, cid: &ConnectionId)
        -> Result<ServerConnectionIdParams, ConnectionIdDecodeError>;
}

/// Length of CIDs issued by [`RoutableConnectionIdAlgo`].
pub const ROUTABLE_CID_LEN: usize = 8;

const FORMAT_TAG: u8 = 0b01;
const FORMAT_TAG_SHIFT: u8 = 6;
const PROCESS_ID_BIT: u8 = 0x80;

/// Default CID algorithm.
///
/// Layout of the 8-byte CID: byte 0 holds the 2-bit format tag over random
/// filler, bytes 1-2 the big-endian host id, byte 3 the worker id, bit 7 of
/// byte 4 the process id. All remaining bits are random.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutableConnectionIdAlgo;

impl ConnectionIdAlgo for RoutableConnectionIdAlgo {
    fn encode(
        &self,
        params: ServerConnectionIdParams,
    ) -> Result<ConnectionId, ConnectionIdEncodeError> {
        // Full-width fields; every parameter combination fits this layout.
        let mut bytes = [0u8; ROUTABLE_CID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0b0011_1111) | (FORMAT_TAG << FORMAT_TAG_SHIFT);
        bytes[1..3].copy_from_slice(&params.host_id.to_be_bytes());
        bytes[3] = params.worker_id;
        bytes[4] = (bytes[4] & !PROCESS_ID_BIT) | (params.process_id.bit() << 7);
        Ok(ConnectionId::new(&bytes))
    }

    fn can_parse(&self, cid: &ConnectionId) -> bool {
        cid.len() >= ROUTABLE_CID_LEN && cid[0] >> FORMAT_TAG_SHIFT == FORMAT_TAG
    }

    fn parse(
        &self,
        cid: &ConnectionId,
    ) -> Result<ServerConnectionIdParams, ConnectionIdDecodeError> {
        if !self.can_parse(cid) {
            return Err(ConnectionIdDecodeError);
        }
        Ok(ServerConnectionIdParams {
            host_id: u16::from_be_bytes([cid[1], cid[2]]),
            worker_id: cid[3],
            process_id: ProcessId::from_bit(cid[4] >> 7),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_equality_over_bytes() {
        let a = ConnectionId::new(&[1, 2, 3, 4]);
        let b = ConnectionId::new(&[1, 2, 3, 4]);
        let c = ConnectionId::new(&[1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(ConnectionId::new(&[]).is_empty());
    }

    #[test]
    fn params_roundtrip() {
        let algo = RoutableConnectionIdAlgo;
        for host_id in [0u16, 49, u16::MAX] {
            for process_id in [ProcessId::Zero, ProcessId::One] {
                for worker_id in [0u8, 42, u8::MAX] {
                    let params = ServerConnectionIdParams::new(host_id, process_id, worker_id);
                    let cid = algo.encode(params).unwrap();
                    assert_eq!(cid.len(), ROUTABLE_CID_LEN);
                    assert!(algo.can_parse(&cid));
                    assert_eq!(algo.parse(&cid).unwrap(), params);
                }
            }
        }
    }

    #[test]
    fn foreign_cids_not_parsed() {
        let algo = RoutableConnectionIdAlgo;
        assert!(!algo.can_parse(&ConnectionId::new(&[0x40; 4])));
        // Right length, wrong format tag
        let cid = ConnectionId::new(&[0x00; 8]);
        assert!(!algo.can_parse(&cid));
        assert_eq!(algo.parse(&cid), Err(ConnectionIdDecodeError));
    }
}
