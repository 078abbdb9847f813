//! Seam to the collective library that actually moves data.
//!
//! The library owns three nested handles (library, execution context, team)
//! plus one handle per collective. Every call is non-blocking: team creation
//! and collectives are posted and then tested until done.

pub mod soft;

pub use soft::{LiveResources, SoftColl, SoftLibrary};

use std::collections::BTreeMap;

use crate::bootstrap::{EpRange, OobEndpoint};
use crate::device::StreamId;
use crate::error::{Result, XcollError};
use crate::memory::Tensor;
use crate::types::{CollectiveType, DataType, MemoryKind, Progress, Rank, ReduceOp};

/// Transport layers a library context may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportLayer {
    Ucx,
    Sharp,
    Vmc,
    Hier,
    Mrail,
    Nccl,
}

impl TransportLayer {
    pub const ALL: [TransportLayer; 6] = [
        TransportLayer::Ucx,
        TransportLayer::Sharp,
        TransportLayer::Vmc,
        TransportLayer::Hier,
        TransportLayer::Mrail,
        TransportLayer::Nccl,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TransportLayer::Ucx => "ucx",
            TransportLayer::Sharp => "sharp",
            TransportLayer::Vmc => "vmc",
            TransportLayer::Hier => "hier",
            TransportLayer::Mrail => "mrail",
            TransportLayer::Nccl => "nccl",
        }
    }

    const fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

impl std::fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of selected transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlMask(u64);

impl TlMask {
    pub const NONE: TlMask = TlMask(0);

    pub fn all() -> Self {
        TransportLayer::ALL.into_iter().collect()
    }

    /// Parse a list of transport-layer names separated by commas or
    /// whitespace. Unknown names are skipped with a warning.
    pub fn from_names(list: &str) -> Self {
        let mut mask = TlMask::NONE;
        for name in list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            match TransportLayer::ALL
                .into_iter()
                .find(|tl| tl.name().eq_ignore_ascii_case(name))
            {
                Some(tl) => mask = mask.with(tl),
                None => tracing::warn!(name, "ignoring unknown transport layer"),
            }
        }
        mask
    }

    pub fn with(self, tl: TransportLayer) -> Self {
        TlMask(self.0 | tl.bit())
    }

    pub fn contains(self, tl: TransportLayer) -> bool {
        self.0 & tl.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn layers(self) -> impl Iterator<Item = TransportLayer> {
        TransportLayer::ALL
            .into_iter()
            .filter(move |tl| self.contains(*tl))
    }
}

impl Default for TlMask {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<TransportLayer> for TlMask {
    fn from_iter<I: IntoIterator<Item = TransportLayer>>(iter: I) -> Self {
        iter.into_iter().fold(TlMask::NONE, TlMask::with)
    }
}

impl std::fmt::Display for TlMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.layers().map(TransportLayer::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Parameters for `lib_init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibParams {
    pub sw_collectives: bool,
    pub hw_collectives: bool,
    /// Collectives the caller intends to run.
    pub coll_caps: Vec<CollectiveType>,
}

impl Default for LibParams {
    fn default() -> Self {
        Self {
            sw_collectives: true,
            hw_collectives: true,
            coll_caps: vec![
                CollectiveType::Broadcast,
                CollectiveType::Allreduce,
                CollectiveType::Alltoall,
                CollectiveType::Alltoallv,
            ],
        }
    }
}

/// Per-transport-layer key/value configuration of a library context.
///
/// Libraries declare the keys they understand with defaults; callers may
/// only modify declared keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextConfig {
    prefix: String,
    entries: BTreeMap<(TransportLayer, String), String>,
}

impl ContextConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn declare(&mut self, tl: TransportLayer, key: &str, default: &str) {
        self.entries
            .insert((tl, key.to_string()), default.to_string());
    }

    pub fn modify(&mut self, tl: TransportLayer, key: &str, value: &str) -> Result<()> {
        match self.entries.get_mut(&(tl, key.to_string())) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(XcollError::Configuration(format!(
                "{tl} has no context option {key}"
            ))),
        }
    }

    pub fn get(&self, tl: TransportLayer, key: &str) -> Option<&str> {
        self.entries.get(&(tl, key.to_string())).map(String::as_str)
    }

    /// Read a yes/no option. Missing keys read as `false`.
    pub fn get_bool(&self, tl: TransportLayer, key: &str) -> Result<bool> {
        match self.get(tl, key) {
            None => Ok(false),
            Some(v) => parse_yes_no(v).ok_or_else(|| {
                XcollError::Configuration(format!("{tl} option {key}: expected yes/no, got {v:?}"))
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransportLayer, &str, &str)> {
        self.entries
            .iter()
            .map(|((tl, k), v)| (*tl, k.as_str(), v.as_str()))
    }
}

pub(crate) fn parse_yes_no(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "true" | "on" => Some(true),
        "n" | "no" | "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadMode {
    Single,
    #[default]
    Multiple,
}

/// How team creation completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TeamCompletion {
    #[default]
    Blocking,
    NonBlocking,
}

pub struct ContextParams {
    pub thread_mode: ThreadMode,
    pub completion: TeamCompletion,
    pub tls: TlMask,
    pub oob: OobEndpoint,
}

pub struct TeamParams {
    pub range: EpRange,
    pub oob: OobEndpoint,
}

/// Buffers taking part in one collective.
#[derive(Debug, Clone)]
pub enum CollBuffers {
    /// Barrier.
    None,
    /// Broadcast and allreduce operate on one buffer in place.
    InPlace(Tensor),
    /// Fixed-size exchange. `len` is the per-peer block for alltoall and
    /// the whole destination for allgather, in bytes.
    Pair { src: Tensor, dst: Tensor, len: usize },
    /// Alltoallv. Counts and displacements are in elements, one per rank.
    Vector {
        src: Tensor,
        src_counts: Vec<u32>,
        src_displs: Vec<u32>,
        dst: Tensor,
        dst_counts: Vec<u32>,
        dst_displs: Vec<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceInfo {
    pub count: usize,
    pub dtype: DataType,
    pub op: ReduceOp,
}

/// Which algorithm the library should run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlgSelection {
    /// Let the library choose.
    #[default]
    Unset,
    ById(u32),
}

#[derive(Debug, Clone)]
pub struct CollArgs {
    pub coll_type: CollectiveType,
    pub buffers: CollBuffers,
    pub mem_kind: MemoryKind,
    pub root: Rank,
    pub reduce: Option<ReduceInfo>,
    pub alg: AlgSelection,
    /// Communication stream device work must be queued on.
    pub stream: Option<StreamId>,
}

impl CollArgs {
    pub fn new(coll_type: CollectiveType, buffers: CollBuffers, mem_kind: MemoryKind) -> Self {
        Self {
            coll_type,
            buffers,
            mem_kind,
            root: 0,
            reduce: None,
            alg: AlgSelection::Unset,
            stream: None,
        }
    }
}

/// A collective communication library.
///
/// Handles are owned values: destroy/cleanup/finalize consume them. The
/// caller guarantees teams are destroyed before their context and contexts
/// before their library.
pub trait CollectiveLibrary: Send + Sync + 'static {
    type Lib: Send + Sync;
    type Context: Send + Sync;
    type Team: Send + Sync;
    type Coll: Send;

    fn lib_init(&self, params: &LibParams) -> Result<Self::Lib>;

    fn lib_cleanup(&self, lib: Self::Lib) -> Result<()>;

    /// Read the default context configuration for this library.
    fn context_config_read(&self, lib: &Self::Lib, prefix: &str) -> Result<ContextConfig>;

    fn context_create(
        &self,
        lib: &Self::Lib,
        params: ContextParams,
        config: &ContextConfig,
    ) -> Result<Self::Context>;

    /// Drive the context's progress engine once.
    fn context_progress(&self, ctx: &Self::Context) -> Result<()>;

    fn context_destroy(&self, ctx: Self::Context) -> Result<()>;

    fn team_create_post(&self, ctx: &Self::Context, params: TeamParams) -> Result<Self::Team>;

    fn team_create_test(&self, team: &mut Self::Team) -> Result<Progress>;

    fn team_destroy(&self, team: Self::Team) -> Result<()>;

    fn collective_init(&self, args: CollArgs, team: &Self::Team) -> Result<Self::Coll>;

    fn collective_post(&self, coll: &mut Self::Coll) -> Result<()>;

    fn collective_test(&self, coll: &mut Self::Coll) -> Result<Progress>;

    /// Release a collective handle. Never cancels in-flight work.
    fn collective_finalize(&self, coll: Self::Coll) -> Result<()>;
}
