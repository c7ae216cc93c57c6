//! Per-process coordinator identity.
//!
//! Each coordinator instance is named by a UUID minted once at process
//! start plus a reachable address peers can display when reporting who
//! holds a lease.  The identity is passed into the registries by value at
//! construction (never read from a process global), so tests can run
//! several logical instances inside one process.

use uuid::Uuid;

/// Environment variable that overrides the derived instance address.
/// Deployment tooling sets it to the externally reachable endpoint.
const INSTANCE_ADDRESS_ENV: &str = "SCYTHE_INSTANCE_ADDRESS";

/// Stable identity of one coordinator process.  Immutable for the process
/// lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceIdentity {
    id: Uuid,
    address: String,
}

impl InstanceIdentity {
    pub fn new(id: Uuid, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Mint a fresh identity for this process: a v4 UUID, and an address
    /// from `SCYTHE_INSTANCE_ADDRESS` falling back to the hostname.
    pub fn generate() -> Self {
        let address = std::env::var(INSTANCE_ADDRESS_ENV)
            .unwrap_or_else(|_| gethostname::gethostname().to_string_lossy().into_owned());
        Self::new(Uuid::new_v4(), address)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
