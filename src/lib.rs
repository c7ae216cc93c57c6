//! Distributed concurrency coordination for a multi-instance repair
//! orchestrator.
//!
//! Several coordinator processes repair the same wide-column cluster at
//! once.  This crate keeps them cooperative using nothing but the
//! coordinated database itself: rows protected by linearizable conditional
//! writes (LWT) and bounded by per-row TTL.  It provides
//!
//! - a **segment-lead registry**: single-key leases that serialize one
//!   action across instances ([`Coordinator::take_lead`] and friends);
//! - a **node-lock registry**: batched multi-key locks that stop repairs
//!   overlapping on the same replica nodes, applied all-or-nothing
//!   ([`Coordinator::lock_running_repairs_for_nodes`] and friends);
//! - a **live-instance directory**: the set of heartbeating peers, used
//!   upstream to split the global concurrency budget
//!   ([`Coordinator::count_running_reapers`]).
//!
//! The store transport is the [`store::StoreSession`] trait; the crate
//! ships [`MemorySession`] for tests and single-process embeddings, and a
//! driver-backed session slots in behind the same trait.  There are no
//! internal retries and no background work besides the optional
//! [`heartbeat`] loop: condition losses surface as `false`, transport
//! failures as errors, and the TTL is the only liveness bound.

pub mod config;
pub mod coordination;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod store;

pub use config::CoordinationConfig;
pub use coordination::{Coordinator, Segment, StoreVersion};
pub use identity::InstanceIdentity;
pub use metrics::{Metrics, MetricsRegistry};
pub use store::memory::MemorySession;
pub use store::{StoreError, StoreSession};
