//! Transactional mode-set engine.
//!
//! A transaction runs Build, Solve and Validate over a [`Candidate`] copied
//! from the committed state, and only a commit transaction that passes all
//! three reaches the hardware. Readers see committed state only.
//!
//! [`Candidate`]: candidate::Candidate

pub mod backend;
mod builder;
mod candidate;
mod commit;
pub mod config;
mod device;
mod display_id;
pub mod error;
pub mod events;
pub mod ownership;
mod reply;
mod request;
mod scratch;
pub mod solver;
pub mod state;
pub mod topology;
mod validator;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

#[cfg(test)]
mod tests;

pub use backend::{
    BandwidthRejected, CapacityHead, CapacityOracle, CapacityRejection, CapacityVerdict,
    DisplayBackend, HardwareChannel, HwCommand, ModeValidationError, ModeValidator,
    PendingUpdate, ResourceManager, ScratchKind, ScratchPool, UpdateSignal,
};
pub use commit::CommitPhase;
pub use config::{ConfigError, ModesetConfig};
pub use device::Device;
pub use display_id::DisplayIdError;
pub use error::ModesetError;
pub use events::{HeadChange, ModesetEvent};
pub use ownership::{ModesetPermissions, OwnerId, OwnershipError};
pub use state::{ApiHeadState, BandwidthLedger, CommittedState, DispState, HwHeadState, MergeRole, SyncObject};
pub use topology::{DeviceTopology, DispTopology, PhysicalHeadCaps, ScalerCaps, TapConfig};
