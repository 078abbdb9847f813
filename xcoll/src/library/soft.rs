//! Software collective library over a point-to-point transport.
//!
//! Team creation exchanges a small descriptor per rank through the bootstrap
//! allgather and adopts the nonce of ring position 0 as the team id. Every
//! collective is a linear all-pairs exchange whose messages are tagged with
//! the team id and a per-team sequence number taken at post time, so ranks
//! must post collectives on a team in the same order.
//!
//! Options read from the `ucx` section of the context configuration:
//! `BLOCK_STREAM_<COLL>` marks collectives that block the communication
//! stream, and `SERIALIZE_ALLTOALL(V)` makes each collective of that class
//! start only after the previous one on the team has completed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    AlgSelection, CollArgs, CollBuffers, CollectiveLibrary, ContextConfig, ContextParams, LibParams,
    TeamParams, TlMask, TransportLayer,
};
use crate::bootstrap::{EpRange, OobAllgather, OobEndpoint};
use crate::error::{Result, XcollError};
use crate::memory::Tensor;
use crate::p2p::{P2pRequest, PointToPoint};
use crate::reduce::{is_reducible, reduce_slice};
use crate::types::{CollectiveType, Progress, Rank, Tag};

static NEXT_TEAM_NONCE: AtomicU64 = AtomicU64::new(1);

const DESCRIPTOR_LEN: usize = 16;

const SERIALIZABLE: [CollectiveType; 2] = [CollectiveType::Alltoall, CollectiveType::Alltoallv];

#[derive(Default)]
struct Ledger {
    libs: AtomicUsize,
    contexts: AtomicUsize,
    teams: AtomicUsize,
    colls: AtomicUsize,
}

impl Ledger {
    fn up(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::AcqRel);
    }

    fn down(counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handles a [`SoftLibrary`] has issued and not yet released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub libs: usize,
    pub contexts: usize,
    pub teams: usize,
    pub colls: usize,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        *self == LiveResources::default()
    }
}

/// Clones share one resource ledger.
#[derive(Clone, Default)]
pub struct SoftLibrary {
    ledger: Arc<Ledger>,
}

impl SoftLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_resources(&self) -> LiveResources {
        LiveResources {
            libs: self.ledger.libs.load(Ordering::Acquire),
            contexts: self.ledger.contexts.load(Ordering::Acquire),
            teams: self.ledger.teams.load(Ordering::Acquire),
            colls: self.ledger.colls.load(Ordering::Acquire),
        }
    }
}

pub struct SoftLib {
    caps: Vec<CollectiveType>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SoftOptions {
    block_stream: [bool; CollectiveType::COUNT],
    serialize: [bool; CollectiveType::COUNT],
}

fn block_stream_key(ty: CollectiveType) -> String {
    format!("BLOCK_STREAM_{}", ty.config_suffix())
}

fn serialize_key(ty: CollectiveType) -> String {
    format!("SERIALIZE_{}", ty.config_suffix())
}

pub struct SoftContext {
    oob: OobEndpoint,
    tls: TlMask,
    options: SoftOptions,
}

impl SoftContext {
    pub fn tls(&self) -> TlMask {
        self.tls
    }
}

struct TeamOrder {
    next_seq: u64,
    last_done: [Option<Arc<AtomicBool>>; CollectiveType::COUNT],
}

struct TeamShared {
    id: u64,
    p2p: Arc<dyn PointToPoint>,
    pos: u32,
    size: u32,
    ranks: Vec<Rank>,
    options: SoftOptions,
    order: Mutex<TeamOrder>,
}

impl TeamShared {
    fn tag(&self, seq: u64) -> Tag {
        ((self.id & 0x7FFF_FFFF) << 32) | (seq & 0xFFFF_FFFF)
    }
}

pub struct SoftTeam {
    p2p: Arc<dyn PointToPoint>,
    range: EpRange,
    pos: u32,
    size: u32,
    options: SoftOptions,
    creating: Option<OobAllgather>,
    shared: Option<Arc<TeamShared>>,
}

impl SoftTeam {
    /// Agreed team id, once creation has completed.
    pub fn id(&self) -> Option<u64> {
        self.shared.as_ref().map(|s| s.id)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn finish_create(&mut self, gathered: &[u8]) -> Result<()> {
        let mut ranks = Vec::with_capacity(self.size as usize);
        for (pos, desc) in gathered.chunks_exact(DESCRIPTOR_LEN).enumerate() {
            let rank = u32::from_le_bytes([desc[8], desc[9], desc[10], desc[11]]);
            let size = u32::from_le_bytes([desc[12], desc[13], desc[14], desc[15]]);
            let expected = self.range.range_to_rank(pos as u32)?;
            if rank != expected || size != self.size {
                return Err(XcollError::Bootstrap(format!(
                    "descriptor at position {pos} claims rank {rank} of {size}, \
                     expected rank {expected} of {}",
                    self.size
                )));
            }
            ranks.push(rank);
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&gathered[..8]);
        let id = u64::from_le_bytes(nonce);
        tracing::debug!(pos = self.pos, size = self.size, team = id, "soft team created");
        self.shared = Some(Arc::new(TeamShared {
            id,
            p2p: Arc::clone(&self.p2p),
            pos: self.pos,
            size: self.size,
            ranks,
            options: self.options,
            order: Mutex::new(TeamOrder {
                next_seq: 0,
                last_done: Default::default(),
            }),
        }));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    None,
    /// Write into the destination buffer at this byte offset.
    Dst(usize),
    /// Allreduce contribution of this ring position.
    Contribution(usize),
}

#[derive(Default)]
struct Exchange {
    reqs: Vec<P2pRequest>,
    targets: Vec<Target>,
    local: Option<Vec<u8>>,
}

enum Stage {
    Init,
    /// Posted, waiting for the previous collective of its class.
    Queued,
    Running(Exchange),
    Done,
    Failed,
}

/// One collective on a [`SoftTeam`].
pub struct SoftColl {
    team: Arc<TeamShared>,
    args: CollArgs,
    seq: Option<u64>,
    after: Option<Arc<AtomicBool>>,
    done_flag: Arc<AtomicBool>,
    stage: Stage,
}

impl SoftColl {
    pub fn coll_type(&self) -> CollectiveType {
        self.args.coll_type
    }

    /// Sequence number assigned at post.
    pub fn sequence(&self) -> Option<u64> {
        self.seq
    }

    /// Whether this collective blocks the communication stream it was given.
    pub fn blocks_stream(&self) -> bool {
        self.args.stream.is_some() && self.team.options.block_stream[self.args.coll_type.index()]
    }

    /// Whether this collective waits for its predecessor of the same class.
    pub fn is_serialized(&self) -> bool {
        self.team.options.serialize[self.args.coll_type.index()]
    }

    /// Posted but not yet allowed to start because of serialization.
    pub fn is_queued(&self) -> bool {
        matches!(self.stage, Stage::Queued)
    }

    fn dst(&self) -> Option<&Tensor> {
        match &self.args.buffers {
            CollBuffers::InPlace(t) => Some(t),
            CollBuffers::Pair { dst, .. } | CollBuffers::Vector { dst, .. } => Some(dst),
            CollBuffers::None => None,
        }
    }

    fn advance(&mut self) -> Result<Progress> {
        if let Stage::Queued = self.stage {
            if let Some(prev) = &self.after
                && !prev.load(Ordering::Acquire)
            {
                return Ok(Progress::InProgress);
            }
            self.after = None;
            let exchange = self.start()?;
            self.stage = Stage::Running(exchange);
        }
        let Stage::Running(exchange) = &mut self.stage else {
            return Ok(Progress::Done);
        };
        self.team.p2p.progress()?;
        if !self.team.p2p.test_all(&mut exchange.reqs)? {
            return Ok(Progress::InProgress);
        }
        let Stage::Running(exchange) = std::mem::replace(&mut self.stage, Stage::Done) else {
            return Ok(Progress::Done);
        };
        self.finish(exchange)?;
        self.done_flag.store(true, Ordering::Release);
        Ok(Progress::Done)
    }

    fn start(&self) -> Result<Exchange> {
        let team = &self.team;
        let seq = self.seq.ok_or_else(|| {
            XcollError::InvalidArgument("collective started before post".into())
        })?;
        let tag = team.tag(seq);
        let me = team.pos as usize;
        let n = team.size as usize;
        let mut ex = Exchange::default();
        let send = |ex: &mut Exchange, peer: usize, data: Vec<u8>| -> Result<()> {
            let req = team.p2p.send_nb(team.ranks[peer], data, tag)?;
            ex.reqs.push(req);
            ex.targets.push(Target::None);
            Ok(())
        };
        let recv = |ex: &mut Exchange, peer: usize, len: usize, target: Target| -> Result<()> {
            let req = team.p2p.recv_nb(team.ranks[peer], len, tag)?;
            ex.reqs.push(req);
            ex.targets.push(target);
            Ok(())
        };

        match (self.args.coll_type, &self.args.buffers) {
            (CollectiveType::Barrier, _) => {
                for peer in (0..n).filter(|p| *p != me) {
                    send(&mut ex, peer, Vec::new())?;
                    recv(&mut ex, peer, 0, Target::None)?;
                }
            }
            (CollectiveType::Broadcast, CollBuffers::InPlace(buf)) => {
                let root = self.args.root as usize;
                if me == root {
                    let data = buf.to_bytes()?;
                    for peer in (0..n).filter(|p| *p != me) {
                        send(&mut ex, peer, data.clone())?;
                    }
                } else {
                    recv(&mut ex, root, buf.len_bytes()?, Target::Dst(0))?;
                }
            }
            (CollectiveType::Allreduce, CollBuffers::InPlace(buf)) => {
                let info = self.reduce_info()?;
                let len = info.count * info.dtype.size_in_bytes();
                let mine = buf.read_range(0, len)?;
                for peer in (0..n).filter(|p| *p != me) {
                    send(&mut ex, peer, mine.clone())?;
                    recv(&mut ex, peer, len, Target::Contribution(peer))?;
                }
                ex.local = Some(mine);
            }
            (CollectiveType::Alltoall, CollBuffers::Pair { src, dst, len }) => {
                for peer in 0..n {
                    let block = src.read_range(peer * len, *len)?;
                    if peer == me {
                        dst.write_at(me * len, &block)?;
                    } else {
                        send(&mut ex, peer, block)?;
                        recv(&mut ex, peer, *len, Target::Dst(peer * len))?;
                    }
                }
            }
            (
                CollectiveType::Alltoallv,
                CollBuffers::Vector {
                    src,
                    src_counts,
                    src_displs,
                    dst,
                    dst_counts,
                    dst_displs,
                },
            ) => {
                let (ses, des) = (src.element_size(), dst.element_size());
                for peer in 0..n {
                    let s_off = src_displs[peer] as usize * ses;
                    let s_len = src_counts[peer] as usize * ses;
                    let r_off = dst_displs[peer] as usize * des;
                    let r_len = dst_counts[peer] as usize * des;
                    let block = src.read_range(s_off, s_len)?;
                    if peer == me {
                        if s_len != r_len {
                            return Err(XcollError::BufferSizeMismatch {
                                expected: r_len,
                                actual: s_len,
                            });
                        }
                        dst.write_at(r_off, &block)?;
                    } else {
                        send(&mut ex, peer, block)?;
                        recv(&mut ex, peer, r_len, Target::Dst(r_off))?;
                    }
                }
            }
            (CollectiveType::Allgather, CollBuffers::Pair { src, dst, len }) => {
                let block = len / n;
                let mine = src.read_range(0, block)?;
                dst.write_at(me * block, &mine)?;
                for peer in (0..n).filter(|p| *p != me) {
                    send(&mut ex, peer, mine.clone())?;
                    recv(&mut ex, peer, block, Target::Dst(peer * block))?;
                }
            }
            (ty, _) => {
                return Err(XcollError::InvalidArgument(format!(
                    "{ty} does not take these buffers"
                )));
            }
        }
        Ok(ex)
    }

    fn finish(&self, mut ex: Exchange) -> Result<()> {
        if self.args.coll_type == CollectiveType::Allreduce {
            return self.finish_allreduce(ex);
        }
        let Some(dst) = self.dst() else {
            return Ok(());
        };
        for (req, target) in ex.reqs.iter_mut().zip(&ex.targets) {
            if let Target::Dst(off) = target
                && let Some(data) = req.take_data()
            {
                dst.write_at(*off, &data)?;
            }
        }
        Ok(())
    }

    fn finish_allreduce(&self, mut ex: Exchange) -> Result<()> {
        let info = self.reduce_info()?;
        let mut parts: Vec<Option<Vec<u8>>> = vec![None; self.team.size as usize];
        parts[self.team.pos as usize] = ex.local.take();
        for (req, target) in ex.reqs.iter_mut().zip(&ex.targets) {
            if let Target::Contribution(pos) = target {
                parts[*pos] = req.take_data();
            }
        }
        // Reduce in position order so every rank produces identical bits.
        let mut parts = parts.into_iter().enumerate().map(|(pos, p)| {
            p.ok_or_else(|| XcollError::InvalidArgument(format!("missing contribution {pos}")))
        });
        let mut acc = parts
            .next()
            .ok_or_else(|| XcollError::InvalidArgument("empty team".into()))??;
        for part in parts {
            reduce_slice(&mut acc, &part?, info.count, info.dtype, info.op)?;
        }
        match &self.args.buffers {
            CollBuffers::InPlace(buf) => buf.write_at(0, &acc),
            _ => Err(XcollError::InvalidArgument(
                "allreduce needs an in-place buffer".into(),
            )),
        }
    }

    fn reduce_info(&self) -> Result<super::ReduceInfo> {
        self.args
            .reduce
            .ok_or_else(|| XcollError::InvalidArgument("allreduce without reduce info".into()))
    }

    fn validate(&self) -> Result<()> {
        if let AlgSelection::ById(id) = self.args.alg {
            return Err(XcollError::InvalidArgument(format!(
                "{} algorithm {id} is not available, only the default runs",
                self.args.coll_type
            )));
        }
        let n = self.team.size as usize;
        match (self.args.coll_type, &self.args.buffers) {
            (CollectiveType::Barrier, CollBuffers::None) => Ok(()),
            (CollectiveType::Broadcast, CollBuffers::InPlace(_)) => {
                if self.args.root >= self.team.size {
                    return Err(XcollError::InvalidRank {
                        rank: self.args.root,
                        size: self.team.size,
                    });
                }
                Ok(())
            }
            (CollectiveType::Allreduce, CollBuffers::InPlace(buf)) => {
                let info = self.reduce_info()?;
                if !is_reducible(info.dtype) {
                    return Err(XcollError::UnsupportedDType {
                        dtype: info.dtype,
                        op: "allreduce",
                    });
                }
                check_len(buf, info.count * info.dtype.size_in_bytes())
            }
            (CollectiveType::Alltoall, CollBuffers::Pair { src, dst, len }) => {
                check_len(src, len * n)?;
                check_len(dst, len * n)
            }
            (
                CollectiveType::Alltoallv,
                CollBuffers::Vector {
                    src,
                    src_counts,
                    src_displs,
                    dst,
                    dst_counts,
                    dst_displs,
                },
            ) => {
                for (name, v) in [
                    ("send counts", src_counts),
                    ("send displacements", src_displs),
                    ("recv counts", dst_counts),
                    ("recv displacements", dst_displs),
                ] {
                    if v.len() != n {
                        return Err(XcollError::InvalidArgument(format!(
                            "{name} has {} entries for a team of {n}",
                            v.len()
                        )));
                    }
                }
                let extent = |counts: &[u32], displs: &[u32], esz: usize| {
                    counts
                        .iter()
                        .zip(displs)
                        .map(|(c, d)| (*c as usize + *d as usize) * esz)
                        .max()
                        .unwrap_or(0)
                };
                check_len(src, extent(src_counts, src_displs, src.element_size()))?;
                check_len(dst, extent(dst_counts, dst_displs, dst.element_size()))
            }
            (CollectiveType::Allgather, CollBuffers::Pair { src, dst, len }) => {
                if len % n != 0 {
                    return Err(XcollError::IndivisibleCount {
                        count: *len,
                        size: n,
                        operation: CollectiveType::Allgather,
                    });
                }
                check_len(src, len / n)?;
                check_len(dst, *len)
            }
            (ty, _) => Err(XcollError::InvalidArgument(format!(
                "{ty} does not take these buffers"
            ))),
        }
    }
}

fn check_len(t: &Tensor, needed: usize) -> Result<()> {
    let actual = t.len_bytes()?;
    if actual < needed {
        return Err(XcollError::BufferSizeMismatch {
            expected: needed,
            actual,
        });
    }
    Ok(())
}

impl CollectiveLibrary for SoftLibrary {
    type Lib = SoftLib;
    type Context = SoftContext;
    type Team = SoftTeam;
    type Coll = SoftColl;

    fn lib_init(&self, params: &LibParams) -> Result<SoftLib> {
        if !params.sw_collectives {
            return Err(XcollError::Configuration(
                "soft library only provides software collectives".into(),
            ));
        }
        Ledger::up(&self.ledger.libs);
        Ok(SoftLib {
            caps: params.coll_caps.clone(),
        })
    }

    fn lib_cleanup(&self, _lib: SoftLib) -> Result<()> {
        Ledger::down(&self.ledger.libs);
        Ok(())
    }

    fn context_config_read(&self, lib: &SoftLib, prefix: &str) -> Result<ContextConfig> {
        let mut config = ContextConfig::new(prefix);
        for ty in CollectiveType::ALL {
            config.declare(TransportLayer::Ucx, &block_stream_key(ty), "no");
        }
        for ty in SERIALIZABLE {
            config.declare(TransportLayer::Ucx, &serialize_key(ty), "no");
        }
        tracing::trace!(prefix, caps = ?lib.caps, "read soft context config");
        Ok(config)
    }

    fn context_create(
        &self,
        _lib: &SoftLib,
        params: ContextParams,
        config: &ContextConfig,
    ) -> Result<SoftContext> {
        if !params.tls.contains(TransportLayer::Ucx) {
            return Err(XcollError::Configuration(format!(
                "soft library runs on the ucx transport layer, selected: {}",
                params.tls
            )));
        }
        let mut options = SoftOptions::default();
        for ty in CollectiveType::ALL {
            options.block_stream[ty.index()] =
                config.get_bool(TransportLayer::Ucx, &block_stream_key(ty))?;
        }
        for ty in SERIALIZABLE {
            options.serialize[ty.index()] =
                config.get_bool(TransportLayer::Ucx, &serialize_key(ty))?;
        }
        Ledger::up(&self.ledger.contexts);
        Ok(SoftContext {
            oob: params.oob,
            tls: params.tls,
            options,
        })
    }

    fn context_progress(&self, ctx: &SoftContext) -> Result<()> {
        ctx.oob.transport().progress()
    }

    fn context_destroy(&self, _ctx: SoftContext) -> Result<()> {
        Ledger::down(&self.ledger.contexts);
        Ok(())
    }

    fn team_create_post(&self, ctx: &SoftContext, params: TeamParams) -> Result<SoftTeam> {
        let oob = params.oob;
        let size = params.range.ep_num().unwrap_or_else(|| oob.size());
        let pos = params
            .range
            .position_of(oob.rank())
            .ok_or(XcollError::InvalidRank {
                rank: oob.rank(),
                size,
            })?;
        let nonce = NEXT_TEAM_NONCE.fetch_add(1, Ordering::Relaxed);
        let mut desc = Vec::with_capacity(DESCRIPTOR_LEN);
        desc.extend_from_slice(&nonce.to_le_bytes());
        desc.extend_from_slice(&oob.rank().to_le_bytes());
        desc.extend_from_slice(&size.to_le_bytes());

        let creating = oob.allgather(&desc, params.range.clone(), pos)?;
        Ledger::up(&self.ledger.teams);
        Ok(SoftTeam {
            p2p: Arc::clone(oob.transport()),
            range: params.range,
            pos,
            size,
            options: ctx.options,
            creating: Some(creating),
            shared: None,
        })
    }

    fn team_create_test(&self, team: &mut SoftTeam) -> Result<Progress> {
        let Some(creating) = team.creating.as_mut() else {
            return Ok(Progress::Done);
        };
        if creating.test()? == Progress::InProgress {
            return Ok(Progress::InProgress);
        }
        let gathered = creating.output().to_vec();
        team.creating = None;
        team.finish_create(&gathered)?;
        Ok(Progress::Done)
    }

    fn team_destroy(&self, _team: SoftTeam) -> Result<()> {
        Ledger::down(&self.ledger.teams);
        Ok(())
    }

    fn collective_init(&self, args: CollArgs, team: &SoftTeam) -> Result<SoftColl> {
        let shared = team.shared.as_ref().ok_or_else(|| {
            XcollError::InvalidArgument("team creation has not completed".into())
        })?;
        let coll = SoftColl {
            team: Arc::clone(shared),
            args,
            seq: None,
            after: None,
            done_flag: Arc::new(AtomicBool::new(false)),
            stage: Stage::Init,
        };
        coll.validate()?;
        Ledger::up(&self.ledger.colls);
        Ok(coll)
    }

    fn collective_post(&self, coll: &mut SoftColl) -> Result<()> {
        if !matches!(coll.stage, Stage::Init) {
            return Err(XcollError::InvalidArgument(
                "collective posted twice".into(),
            ));
        }
        let idx = coll.args.coll_type.index();
        {
            let mut order = coll
                .team
                .order
                .lock()
                .map_err(|_| XcollError::LockPoisoned("team sequence"))?;
            coll.seq = Some(order.next_seq);
            order.next_seq += 1;
            if coll.team.options.serialize[idx] {
                coll.after = order.last_done[idx].replace(Arc::clone(&coll.done_flag));
            }
        }
        tracing::debug!(
            team = coll.team.id,
            seq = coll.seq,
            coll = %coll.args.coll_type,
            serialized = coll.after.is_some(),
            "soft collective posted"
        );
        coll.stage = Stage::Queued;
        if let Err(e) = coll.advance() {
            coll.stage = Stage::Failed;
            coll.done_flag.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn collective_test(&self, coll: &mut SoftColl) -> Result<Progress> {
        match coll.stage {
            Stage::Done => return Ok(Progress::Done),
            Stage::Init => {
                return Err(XcollError::InvalidArgument(
                    "collective tested before post".into(),
                ));
            }
            Stage::Failed => {
                return Err(XcollError::InvalidArgument(
                    "collective already failed".into(),
                ));
            }
            Stage::Queued | Stage::Running(_) => {}
        }
        coll.advance().inspect_err(|_| {
            coll.stage = Stage::Failed;
            coll.done_flag.store(true, Ordering::Release);
        })
    }

    fn collective_finalize(&self, coll: SoftColl) -> Result<()> {
        if matches!(coll.stage, Stage::Queued | Stage::Running(_)) {
            tracing::debug!(
                team = coll.team.id,
                seq = coll.seq,
                coll = %coll.args.coll_type,
                "finalizing unfinished collective"
            );
        }
        coll.done_flag.store(true, Ordering::Release);
        Ledger::down(&self.ledger.colls);
        Ok(())
    }
}
