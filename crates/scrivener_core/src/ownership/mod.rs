//! Document ownership: which node serves which document, and under which
//! fencing epoch.

mod coordinator;
mod directory;
mod membership;
mod ring;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_coordinator;

pub use coordinator::{Claim, Coordinator, MemoryCoordinator};
pub use directory::OwnershipDirectory;
pub use membership::{MembershipChange, NodeInfo, OwnershipRecord, RingSnapshot};
pub use ring::{DEFAULT_VNODES, HashRing, RingArc, hash_key};
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_coordinator::SqliteCoordinator;
