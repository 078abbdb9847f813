//! Group-wide collective policy.
//!
//! All values default to off (non-blocking waits, normal-priority stream,
//! host barrier, no serialization, every transport layer). Override via
//! environment variables (prefixed `XCOLL_`) or by constructing a custom
//! `CollPolicy`.

use crate::bootstrap::RingDirection;
use crate::error::Result;
use crate::library::{ContextConfig, TlMask, TransportLayer, parse_yes_no};
use crate::types::CollectiveType;

/// Policy applied to every collective on a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollPolicy {
    /// Per-collective blocking wait, indexed by `CollectiveType::index`.
    /// A blocking-wait collective does not block the caller's device
    /// stream, so the caller waits on the host instead of fencing.
    pub blocking_wait: [bool; CollectiveType::COUNT],

    /// Run barriers through the device stream protocol.
    pub gpu_barrier: bool,

    /// Create the communication stream with high priority.
    pub high_priority_stream: bool,

    /// Start each alltoall/alltoallv only after the previous one completed.
    pub serialize: bool,

    /// Transport layers the library context may use.
    pub tls: TlMask,

    /// Direction of the bootstrap ring.
    pub oob_direction: RingDirection,

    /// Upper bound on team-creation polls in `TeamContext::init`.
    /// `None` polls until done.
    pub init_max_polls: Option<u64>,
}

impl Default for CollPolicy {
    fn default() -> Self {
        Self {
            blocking_wait: [false; CollectiveType::COUNT],
            gpu_barrier: false,
            high_priority_stream: false,
            serialize: false,
            tls: TlMask::all(),
            oob_direction: RingDirection::Forward,
            init_max_polls: None,
        }
    }
}

impl CollPolicy {
    /// Load the policy from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `XCOLL_BLOCKING_WAIT`: `all`, `none`, or a comma list of collectives
    /// - `XCOLL_GPU_BARRIER`
    /// - `XCOLL_HIGH_PRIORITY_STREAM`
    /// - `XCOLL_SERIALIZE`
    /// - `XCOLL_TLS`: comma list of transport layers
    /// - `XCOLL_OOB_REVERSE`
    /// - `XCOLL_INIT_MAX_POLLS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a policy from any key lookup. `from_env` uses the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut policy = Self::default();

        if let Some(v) = lookup("XCOLL_BLOCKING_WAIT") {
            policy.blocking_wait = parse_blocking_wait(&v);
        }
        if let Some(b) = lookup_bool(&lookup, "XCOLL_GPU_BARRIER") {
            policy.gpu_barrier = b;
        }
        if let Some(b) = lookup_bool(&lookup, "XCOLL_HIGH_PRIORITY_STREAM") {
            policy.high_priority_stream = b;
        }
        if let Some(b) = lookup_bool(&lookup, "XCOLL_SERIALIZE") {
            policy.serialize = b;
        }
        if let Some(v) = lookup("XCOLL_TLS") {
            policy.tls = TlMask::from_names(&v);
        }
        if let Some(true) = lookup_bool(&lookup, "XCOLL_OOB_REVERSE") {
            policy.oob_direction = RingDirection::Reverse;
        }
        if let Some(v) = lookup("XCOLL_INIT_MAX_POLLS") {
            match v.trim().parse::<u64>() {
                Ok(n) => policy.init_max_polls = Some(n),
                Err(_) => tracing::warn!(value = %v, "ignoring invalid XCOLL_INIT_MAX_POLLS"),
            }
        }

        policy
    }

    pub fn blocking_wait(&self, coll: CollectiveType) -> bool {
        self.blocking_wait[coll.index()]
    }

    pub fn set_blocking_wait(&mut self, coll: CollectiveType, on: bool) {
        self.blocking_wait[coll.index()] = on;
    }

    /// Write this policy into a library context configuration. Only the
    /// `ucx` layer understands these options, so nothing changes when it is
    /// not selected.
    pub fn apply_to(&self, config: &mut ContextConfig) -> Result<()> {
        if !self.tls.contains(TransportLayer::Ucx) {
            return Ok(());
        }
        for coll in CollectiveType::ALL {
            let value = if self.blocking_wait(coll) { "no" } else { "yes" };
            config.modify(
                TransportLayer::Ucx,
                &format!("BLOCK_STREAM_{}", coll.config_suffix()),
                value,
            )?;
        }
        if self.serialize {
            for coll in [CollectiveType::Alltoall, CollectiveType::Alltoallv] {
                let suffix = coll.config_suffix();
                config.modify(TransportLayer::Ucx, &format!("BLOCK_STREAM_{suffix}"), "yes")?;
                config.modify(TransportLayer::Ucx, &format!("SERIALIZE_{suffix}"), "yes")?;
            }
        }
        Ok(())
    }

    /// Emit the effective policy as one structured log event.
    pub(crate) fn log_report(&self, size: u32) {
        let waits: Vec<String> = CollectiveType::ALL
            .iter()
            .map(|c| format!("{}={}", c.config_suffix(), self.blocking_wait(*c)))
            .collect();
        tracing::info!(
            size,
            blocking_wait = %waits.join(" "),
            high_priority_stream = self.high_priority_stream,
            gpu_barrier = self.gpu_barrier,
            serialize = self.serialize,
            tls = %self.tls,
            oob_direction = ?self.oob_direction,
            "collective context initialized"
        );
    }
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let v = lookup(key)?;
    let parsed = parse_yes_no(&v);
    if parsed.is_none() {
        tracing::warn!(key, value = %v, "ignoring invalid boolean");
    }
    parsed
}

fn parse_blocking_wait(v: &str) -> [bool; CollectiveType::COUNT] {
    match v.trim().to_ascii_lowercase().as_str() {
        "all" => return [true; CollectiveType::COUNT],
        "none" | "" => return [false; CollectiveType::COUNT],
        _ => {}
    }
    let mut out = [false; CollectiveType::COUNT];
    for name in v.split(',').filter(|s| !s.trim().is_empty()) {
        match CollectiveType::from_name(name) {
            Some(c) => out[c.index()] = true,
            None => tracing::warn!(name, "ignoring unknown collective in XCOLL_BLOCKING_WAIT"),
        }
    }
    out
}
