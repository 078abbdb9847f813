use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, XcollError};
use crate::p2p::{P2pRequest, PointToPoint};
use crate::types::{Rank, Tag};

type Mailbox = HashMap<(Rank, Tag), VecDeque<Vec<u8>>>;

struct Fabric {
    mailboxes: Vec<Mutex<Mailbox>>,
    connected: Vec<AtomicBool>,
}

impl Fabric {
    fn check_connected(&self, rank: Rank) -> Result<()> {
        if self.connected[rank as usize].load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(XcollError::PeerDisconnected { rank })
        }
    }
}

/// Counters of operations a rank has posted on the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub sends_posted: u64,
    pub recvs_posted: u64,
}

/// In-process point-to-point mesh.
///
/// Sends are eager: the payload lands in the destination's mailbox at post
/// time and the send completes immediately. Receives are matched by
/// `(source, tag)` in FIFO order when tested.
pub struct LocalMesh {
    rank: Rank,
    size: u32,
    fabric: Arc<Fabric>,
    sends_posted: AtomicU64,
    recvs_posted: AtomicU64,
}

impl LocalMesh {
    /// Build a fully connected mesh of `size` ranks. Element `r` is rank `r`.
    pub fn create(size: u32) -> Vec<Arc<LocalMesh>> {
        let fabric = Arc::new(Fabric {
            mailboxes: (0..size).map(|_| Mutex::new(HashMap::new())).collect(),
            connected: (0..size).map(|_| AtomicBool::new(true)).collect(),
        });
        (0..size)
            .map(|rank| {
                Arc::new(LocalMesh {
                    rank,
                    size,
                    fabric: Arc::clone(&fabric),
                    sends_posted: AtomicU64::new(0),
                    recvs_posted: AtomicU64::new(0),
                })
            })
            .collect()
    }

    /// Take this rank off the mesh. Peers waiting on it, and its own later
    /// posts, fail with `PeerDisconnected`.
    pub fn disconnect(&self) {
        self.fabric.connected[self.rank as usize].store(false, Ordering::Release);
        tracing::debug!(rank = self.rank, "local mesh endpoint disconnected");
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            recvs_posted: self.recvs_posted.load(Ordering::Relaxed),
        }
    }

    /// Messages delivered to this rank that no receive has matched yet.
    pub fn pending_messages(&self) -> Result<usize> {
        let mailbox = self.fabric.mailboxes[self.rank as usize]
            .lock()
            .map_err(|_| XcollError::LockPoisoned("local mesh mailbox"))?;
        Ok(mailbox.values().map(VecDeque::len).sum())
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer >= self.size {
            return Err(XcollError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl PointToPoint for LocalMesh {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send_nb(&self, dst: Rank, data: Vec<u8>, tag: Tag) -> Result<P2pRequest> {
        self.check_peer(dst)?;
        self.fabric.check_connected(self.rank)?;
        self.fabric.check_connected(dst)?;
        let len = data.len();
        {
            let mut mailbox = self.fabric.mailboxes[dst as usize]
                .lock()
                .map_err(|_| XcollError::LockPoisoned("local mesh mailbox"))?;
            mailbox.entry((self.rank, tag)).or_default().push_back(data);
        }
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
        Ok(P2pRequest::sent(dst, tag, len))
    }

    fn recv_nb(&self, src: Rank, len: usize, tag: Tag) -> Result<P2pRequest> {
        self.check_peer(src)?;
        self.fabric.check_connected(self.rank)?;
        self.recvs_posted.fetch_add(1, Ordering::Relaxed);
        Ok(P2pRequest::pending_recv(src, tag, len))
    }

    fn test(&self, req: &mut P2pRequest) -> Result<bool> {
        if req.is_complete() {
            return Ok(true);
        }
        let message = {
            let mut mailbox = self.fabric.mailboxes[self.rank as usize]
                .lock()
                .map_err(|_| XcollError::LockPoisoned("local mesh mailbox"))?;
            let key = (req.peer(), req.tag());
            let message = mailbox.get_mut(&key).and_then(VecDeque::pop_front);
            if mailbox.get(&key).is_some_and(VecDeque::is_empty) {
                mailbox.remove(&key);
            }
            message
        };
        match message {
            Some(data) if data.len() != req.len() => Err(XcollError::BufferSizeMismatch {
                expected: req.len(),
                actual: data.len(),
            }),
            Some(data) => {
                req.complete_with(data);
                Ok(true)
            }
            None => {
                self.fabric.check_connected(req.peer())?;
                Ok(false)
            }
        }
    }
}
