//! Point-to-point transport seam.
//!
//! The bootstrap allgather and the software collective library only need
//! non-blocking tagged send/receive plus a batch test. Real wire transports
//! implement [`PointToPoint`]; [`LocalMesh`] connects ranks in one process.

mod local;

pub use local::{LocalMesh, MeshStats};

use crate::error::Result;
use crate::types::{Rank, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pKind {
    Send,
    Recv,
}

/// One outstanding send or receive.
///
/// Sends own their payload from the moment they are posted. Receives carry
/// the delivered payload once a test reports them complete.
#[derive(Debug)]
pub struct P2pRequest {
    kind: P2pKind,
    peer: Rank,
    tag: Tag,
    len: usize,
    complete: bool,
    data: Option<Vec<u8>>,
}

impl P2pRequest {
    /// A send the transport has already handed off.
    pub fn sent(peer: Rank, tag: Tag, len: usize) -> Self {
        Self {
            kind: P2pKind::Send,
            peer,
            tag,
            len,
            complete: true,
            data: None,
        }
    }

    /// A receive waiting for `len` bytes from `peer`.
    pub fn pending_recv(peer: Rank, tag: Tag, len: usize) -> Self {
        Self {
            kind: P2pKind::Recv,
            peer,
            tag,
            len,
            complete: false,
            data: None,
        }
    }

    pub fn kind(&self) -> P2pKind {
        self.kind
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Mark a receive complete with its payload.
    pub fn complete_with(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.complete = true;
    }

    /// Take the delivered payload of a completed receive.
    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }
}

/// Non-blocking tagged point-to-point messaging between the ranks of a group.
pub trait PointToPoint: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> u32;

    /// Post a send. The payload is owned by the transport from here on.
    fn send_nb(&self, dst: Rank, data: Vec<u8>, tag: Tag) -> Result<P2pRequest>;

    /// Post a receive of exactly `len` bytes from `src` with `tag`.
    fn recv_nb(&self, src: Rank, len: usize, tag: Tag) -> Result<P2pRequest>;

    /// Test one request without blocking. Returns whether it is complete.
    fn test(&self, req: &mut P2pRequest) -> Result<bool>;

    /// Test a batch. Every request is tested; returns true once all are complete.
    fn test_all(&self, reqs: &mut [P2pRequest]) -> Result<bool> {
        let mut all = true;
        for req in reqs.iter_mut() {
            if !req.is_complete() && !self.test(req)? {
                all = false;
            }
        }
        Ok(all)
    }

    /// Drive any internal progress engine. No-op for eager transports.
    fn progress(&self) -> Result<()> {
        Ok(())
    }
}
