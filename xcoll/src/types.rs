/// Rank of a participant in a team (0-indexed).
pub type Rank = u32;

/// Message tag used by the point-to-point transport.
pub type Tag = u64;

/// Outcome of a non-blocking test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Done,
}

impl Progress {
    pub fn is_done(self) -> bool {
        self == Progress::Done
    }
}

/// Data types supported for collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for allreduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// The collectives a team can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CollectiveType {
    Barrier = 0,
    Broadcast = 1,
    Allreduce = 2,
    Alltoall = 3,
    Alltoallv = 4,
    Allgather = 5,
}

impl CollectiveType {
    pub const COUNT: usize = 6;

    pub const ALL: [CollectiveType; Self::COUNT] = [
        CollectiveType::Barrier,
        CollectiveType::Broadcast,
        CollectiveType::Allreduce,
        CollectiveType::Alltoall,
        CollectiveType::Alltoallv,
        CollectiveType::Allgather,
    ];

    /// Position in per-collective policy tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            CollectiveType::Barrier => "barrier",
            CollectiveType::Broadcast => "broadcast",
            CollectiveType::Allreduce => "allreduce",
            CollectiveType::Alltoall => "alltoall",
            CollectiveType::Alltoallv => "alltoallv",
            CollectiveType::Allgather => "allgather",
        }
    }

    /// Suffix used by library configuration keys (`BLOCK_STREAM_<suffix>`).
    pub const fn config_suffix(self) -> &'static str {
        match self {
            CollectiveType::Barrier => "BARRIER",
            CollectiveType::Broadcast => "BCAST",
            CollectiveType::Allreduce => "ALLREDUCE",
            CollectiveType::Alltoall => "ALLTOALL",
            CollectiveType::Alltoallv => "ALLTOALLV",
            CollectiveType::Allgather => "ALLGATHER",
        }
    }

    /// Parse a collective name, accepting both `broadcast` and `bcast`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| {
            c.name() == name || c.config_suffix().eq_ignore_ascii_case(&name)
        })
    }
}

impl std::fmt::Display for CollectiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Host,
    Cuda(u32),
}

impl Device {
    pub fn is_device(self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Device ordinal, `None` for host memory.
    pub fn ordinal(self) -> Option<u32> {
        match self {
            Device::Host => None,
            Device::Cuda(i) => Some(i),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

/// Memory kind reported to the collective library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Cuda,
}

impl From<Device> for MemoryKind {
    fn from(d: Device) -> Self {
        match d {
            Device::Host => MemoryKind::Host,
            Device::Cuda(_) => MemoryKind::Cuda,
        }
    }
}
