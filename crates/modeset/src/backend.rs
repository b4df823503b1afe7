//! Interfaces the engine consumes. A device driver implements all of them
//! on one type and hands it to [`Device::new`](crate::Device::new).

use modeset_model::{
    Connector, DpyId, DpyIdList, FlipState, HdrStaticMetadata, HeadMask, LutState, ModeRequest,
    ModeValidationParams, PixelDepth, ResolvedColor, Timings, ViewPort,
};
use smallvec::SmallVec;

use crate::state::BandwidthLedger;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mode rejected on {dpy}: {reason}")]
pub struct ModeValidationError {
    pub dpy: DpyId,
    pub reason: String,
}

pub trait ModeValidator {
    fn validate_mode(
        &self,
        disp: usize,
        connector: &Connector,
        dpy: DpyId,
        params: &ModeValidationParams,
        mode: &ModeRequest,
    ) -> Result<Timings, ModeValidationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("resource manager rejected bandwidth {ledger:?} on disp {disp}")]
pub struct BandwidthRejected {
    pub disp: usize,
    pub ledger: BandwidthLedger,
}

/// Firmware / resource-manager side of the device.
pub trait ResourceManager {
    fn begin_modeset(&self, disp: usize, dpys: DpyIdList);
    fn end_modeset(&self, disp: usize, dpys: DpyIdList);
    /// Whether the connectors in `connectors` can be driven at the same time.
    fn is_possible_to_activate(&self, disp: usize, connectors: DpyIdList) -> bool;
    fn program_bandwidth(&self, disp: usize, ledger: BandwidthLedger)
    -> Result<(), BandwidthRejected>;
    fn set_low_power_allowed(&self, allowed: bool);
}

/// One physical head as seen by the aggregate capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityHead {
    pub hw_head: usize,
    pub api_head: usize,
    pub timings: Timings,
    pub color: ResolvedColor,
    pub layers: usize,
    pub merged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapacityVerdict {
    /// Steady-state bandwidth to program once the commit lands.
    pub ledger: BandwidthLedger,
    /// Pixel depths the hardware settled on, by physical head.
    pub finalized_depths: SmallVec<[(usize, PixelDepth); 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("capacity exceeded on physical heads {hw_heads:?}")]
pub struct CapacityRejection {
    pub hw_heads: HeadMask,
}

pub trait CapacityOracle {
    fn check_capacity(
        &self,
        disp: usize,
        heads: &[CapacityHead],
        require_boot_clocks: bool,
    ) -> Result<CapacityVerdict, CapacityRejection>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum HwCommand {
    ShutDownHead {
        hw_head: usize,
    },
    DisarmSyncObject {
        hw_head: usize,
        slot: u8,
    },
    DetachSerializer {
        serializer: u8,
        connector: DpyId,
    },
    AttachSerializer {
        serializer: u8,
        connector: DpyId,
        hw_heads: HeadMask,
    },
    SetTimings {
        hw_head: usize,
        timings: Timings,
    },
    SetMerge {
        primary: usize,
        secondary: usize,
    },
    SetColor {
        hw_head: usize,
        color: ResolvedColor,
        dithering: bool,
    },
    SetViewPort {
        hw_head: usize,
        viewport: ViewPort,
    },
    SetLut {
        hw_head: usize,
        lut: LutState,
    },
    SetHdrMetadata {
        hw_head: usize,
        metadata: Option<HdrStaticMetadata>,
    },
    Flip {
        hw_head: usize,
        flip: FlipState,
    },
    ArmSyncObject {
        hw_head: usize,
        slot: u8,
        raster_line: u16,
    },
}

/// Commands latched together by one hardware update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PendingUpdate {
    pub commands: Vec<HwCommand>,
}

impl PendingUpdate {
    pub fn push(&mut self, command: HwCommand) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateSignal(pub u64);

pub trait HardwareChannel {
    fn channels_idle(&self, disp: usize) -> bool;
    /// Kicks off `update`. Completion is observed through `poll_update`.
    fn update(&self, disp: usize, update: PendingUpdate) -> UpdateSignal;
    fn poll_update(&self, disp: usize, signal: UpdateSignal) -> bool;
    fn enable_head_events(&self, disp: usize, hw_head: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchKind {
    ProposedState,
    ValidationWorkArea,
    CommitWorkArea,
}

pub trait ScratchPool {
    /// Returns `false` when the buffer is already handed out.
    fn acquire(&self, kind: ScratchKind) -> bool;
    fn release(&self, kind: ScratchKind);
}

pub trait DisplayBackend:
    ModeValidator + ResourceManager + CapacityOracle + HardwareChannel + ScratchPool + Send + Sync
{
}

impl<T> DisplayBackend for T where
    T: ModeValidator + ResourceManager + CapacityOracle + HardwareChannel + ScratchPool + Send + Sync
{
}
