pub mod bootstrap;
pub mod collective;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod library;
pub mod memory;
pub mod ops;
pub mod p2p;
pub(crate) mod reduce;
pub mod request;
pub mod types;

pub use bootstrap::{EpRange, OOB_TAG, OobAllgather, OobEndpoint, RingDirection};
pub use config::CollPolicy;
pub use context::{TeamContext, TeamInit};
pub use device::{
    DeviceRuntime, DeviceSync, EventId, EventPool, PooledEvent, SimDevice, StreamBinding,
    StreamId, StreamOp, StreamPriority,
};
pub use error::{Result, XcollError};
pub use library::{CollectiveLibrary, LiveResources, SoftLibrary, TlMask, TransportLayer};
pub use memory::{Element, Tensor};
pub use ops::CollectiveOps;
pub use p2p::{LocalMesh, MeshStats, P2pRequest, PointToPoint};
pub use request::{CollRequest, RequestStatus};
pub use types::{CollectiveType, DataType, Device, MemoryKind, Progress, Rank, ReduceOp, Tag};
