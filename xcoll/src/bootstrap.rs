//! Out-of-band ring allgather used to rendezvous ranks before a team exists.
//!
//! Every rank contributes one block of the same length. The ring runs
//! `size - 1` steps; at each step a rank forwards the block it most recently
//! received to its successor and receives the next one from its predecessor.
//! All state lives in [`OobAllgather`] so the exchange can be resumed by
//! repeated calls to [`OobAllgather::test`] without ever blocking.

use std::sync::Arc;

use crate::error::{Result, XcollError};
use crate::p2p::{P2pKind, P2pRequest, PointToPoint};
use crate::types::{Progress, Rank, Tag};

/// Tag reserved for bootstrap traffic. Collective traffic never sets the top bit.
pub const OOB_TAG: Tag = 1 << 63;

/// Which endpoints take part in an exchange and how ring positions map to
/// transport ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpRange {
    /// Every rank of the transport, positions equal transport ranks.
    Undefined,
    /// Position `i` is transport rank `start + i * stride`.
    Strided { start: Rank, stride: u32, ep_num: u32 },
    /// Position `i` is transport rank `map[i]`.
    Map(Vec<Rank>),
}

impl EpRange {
    pub fn strided(start: Rank, stride: u32, ep_num: u32) -> Self {
        EpRange::Strided {
            start,
            stride,
            ep_num,
        }
    }

    /// Number of endpoints, `None` when the range is undefined.
    pub fn ep_num(&self) -> Option<u32> {
        match self {
            EpRange::Undefined => None,
            EpRange::Strided { ep_num, .. } => Some(*ep_num),
            EpRange::Map(map) => Some(map.len() as u32),
        }
    }

    /// Ring position of transport rank `rank`, `None` when it is not part
    /// of the range.
    pub fn position_of(&self, rank: Rank) -> Option<u32> {
        match self {
            EpRange::Undefined => Some(rank),
            EpRange::Strided {
                start,
                stride,
                ep_num,
            } => {
                let delta = rank.checked_sub(*start)?;
                if *stride == 0 {
                    return (delta == 0 && *ep_num > 0).then_some(0);
                }
                let pos = delta / stride;
                (delta % stride == 0 && pos < *ep_num).then_some(pos)
            }
            EpRange::Map(map) => map.iter().position(|r| *r == rank).map(|p| p as u32),
        }
    }

    /// Translate a ring position into a transport rank.
    pub fn range_to_rank(&self, pos: u32) -> Result<Rank> {
        match self {
            EpRange::Undefined => Ok(pos),
            EpRange::Strided {
                start,
                stride,
                ep_num,
            } => {
                if pos >= *ep_num {
                    return Err(XcollError::InvalidRank {
                        rank: pos,
                        size: *ep_num,
                    });
                }
                Ok(start + pos * stride)
            }
            EpRange::Map(map) => map.get(pos as usize).copied().ok_or(XcollError::InvalidRank {
                rank: pos,
                size: map.len() as u32,
            }),
        }
    }
}

/// Direction blocks travel around the ring. The gathered output is the same
/// either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RingDirection {
    /// Send to `rank + 1`, receive from `rank - 1`.
    #[default]
    Forward,
    /// Send to `rank - 1`, receive from `rank + 1`.
    Reverse,
}

/// A rank's handle for starting bootstrap exchanges.
#[derive(Clone)]
pub struct OobEndpoint {
    p2p: Arc<dyn PointToPoint>,
    direction: RingDirection,
}

impl OobEndpoint {
    pub fn new(p2p: Arc<dyn PointToPoint>) -> Self {
        Self::with_direction(p2p, RingDirection::Forward)
    }

    pub fn with_direction(p2p: Arc<dyn PointToPoint>, direction: RingDirection) -> Self {
        Self { p2p, direction }
    }

    pub fn rank(&self) -> Rank {
        self.p2p.rank()
    }

    pub fn size(&self) -> u32 {
        self.p2p.size()
    }

    pub fn direction(&self) -> RingDirection {
        self.direction
    }

    pub fn transport(&self) -> &Arc<dyn PointToPoint> {
        &self.p2p
    }

    /// Start gathering `send` from every endpoint of `range`.
    ///
    /// With an undefined range the transport's own rank and size are used and
    /// `my_rank` is ignored; otherwise `my_rank` is this endpoint's position
    /// in the range. The first test runs before returning, so a single-rank
    /// exchange is already done.
    pub fn allgather(&self, send: &[u8], range: EpRange, my_rank: Rank) -> Result<OobAllgather> {
        let (rank, size) = match range.ep_num() {
            None => (self.p2p.rank(), self.p2p.size()),
            Some(n) => (my_rank, n),
        };
        if size == 0 || rank >= size {
            return Err(XcollError::InvalidRank { rank, size });
        }

        let (next, prev) = match self.direction {
            RingDirection::Forward => ((rank + 1) % size, (rank + size - 1) % size),
            RingDirection::Reverse => ((rank + size - 1) % size, (rank + 1) % size),
        };
        let send_to = range.range_to_rank(next)?;
        let recv_from = range.range_to_rank(prev)?;

        let msglen = send.len();
        let mut rbuf = vec![0u8; msglen * size as usize];
        rbuf[rank as usize * msglen..(rank as usize + 1) * msglen].copy_from_slice(send);

        let mut state = OobAllgather {
            p2p: Arc::clone(&self.p2p),
            direction: self.direction,
            rank,
            size,
            send_to,
            recv_from,
            msglen,
            rbuf,
            iter: 0,
            reqs: Vec::with_capacity(2),
            recv_block: None,
            done: false,
            failed: false,
        };
        state.test()?;
        Ok(state)
    }
}

/// Resumable state of one bootstrap allgather.
pub struct OobAllgather {
    p2p: Arc<dyn PointToPoint>,
    direction: RingDirection,
    rank: Rank,
    size: u32,
    send_to: Rank,
    recv_from: Rank,
    msglen: usize,
    rbuf: Vec<u8>,
    iter: u32,
    reqs: Vec<P2pRequest>,
    recv_block: Option<usize>,
    done: bool,
    failed: bool,
}

impl OobAllgather {
    /// Advance the ring as far as completed operations allow.
    ///
    /// Returns `InProgress` without issuing anything new while the current
    /// step's send or receive is outstanding. Once done, further calls
    /// return `Done` and touch nothing. After an error every later call
    /// fails without posting anything.
    pub fn test(&mut self) -> Result<Progress> {
        if self.done {
            return Ok(Progress::Done);
        }
        if self.failed {
            return Err(XcollError::Bootstrap(
                "allgather already failed on an earlier step".into(),
            ));
        }
        let progress = self.advance();
        if progress.is_err() {
            self.failed = true;
        }
        progress
    }

    fn advance(&mut self) -> Result<Progress> {
        loop {
            if !self.reqs.is_empty() {
                self.p2p.progress()?;
                if !self.p2p.test_all(&mut self.reqs)? {
                    return Ok(Progress::InProgress);
                }
                self.absorb()?;
            }
            if self.iter + 1 >= self.size {
                break;
            }
            self.post_step()?;
        }
        self.done = true;
        tracing::trace!(rank = self.rank, size = self.size, "bootstrap allgather done");
        Ok(Progress::Done)
    }

    fn block_index(&self, shift: u32) -> usize {
        let (rank, size) = (self.rank, self.size);
        let idx = match self.direction {
            RingDirection::Forward => (rank + size - shift % size) % size,
            RingDirection::Reverse => (rank + shift) % size,
        };
        idx as usize
    }

    fn post_step(&mut self) -> Result<()> {
        let send_block = self.block_index(self.iter);
        let recv_block = self.block_index(self.iter + 1);
        let off = send_block * self.msglen;
        let payload = self.rbuf[off..off + self.msglen].to_vec();

        tracing::trace!(
            rank = self.rank,
            step = self.iter,
            send_block,
            recv_block,
            to = self.send_to,
            from = self.recv_from,
            "bootstrap ring step"
        );
        let send = self.p2p.send_nb(self.send_to, payload, OOB_TAG)?;
        self.reqs.push(send);
        self.iter += 1;
        let recv = self.p2p.recv_nb(self.recv_from, self.msglen, OOB_TAG)?;
        self.reqs.push(recv);
        self.recv_block = Some(recv_block);
        Ok(())
    }

    fn absorb(&mut self) -> Result<()> {
        let block = self
            .recv_block
            .take()
            .ok_or_else(|| XcollError::Bootstrap("completed step has no receive slot".into()))?;
        for mut req in self.reqs.drain(..) {
            if req.kind() != P2pKind::Recv {
                continue;
            }
            let data = req
                .take_data()
                .ok_or_else(|| XcollError::Bootstrap("receive completed without data".into()))?;
            if data.len() != self.msglen {
                return Err(XcollError::BufferSizeMismatch {
                    expected: self.msglen,
                    actual: data.len(),
                });
            }
            let off = block * self.msglen;
            self.rbuf[off..off + self.msglen].copy_from_slice(&data);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Ring steps issued so far. Never decreases.
    pub fn iteration(&self) -> u32 {
        self.iter
    }

    pub fn msglen(&self) -> usize {
        self.msglen
    }

    /// The gathered buffer: block `i` came from ring position `i`. Only
    /// complete once the exchange is done.
    pub fn output(&self) -> &[u8] {
        &self.rbuf
    }

    pub fn into_output(self) -> Vec<u8> {
        self.rbuf
    }
}
