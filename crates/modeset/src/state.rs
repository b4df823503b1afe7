//! Committed device state, the software mirror of what the hardware runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use modeset_model::{
    ConnectorKey, DisplayId, Dithering, DpyIdList, FlipState, HdrStaticMetadata, HeadMask,
    LutState, ModeValidationParams, ResolvedColor, Timings,
};
use smallvec::SmallVec;

use crate::topology::DeviceTopology;

/// Role of a physical head inside a dual-pipeline merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeRole {
    #[default]
    Single,
    Primary,
    Secondary,
}

/// Start-of-frame sync object armed on a head's raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncObject {
    pub slot: u8,
    pub raster_line: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApiHeadState {
    pub hw_heads: HeadMask,
    pub dpy_ids: DpyIdList,
    pub connector: Option<ConnectorKey>,
    pub display_id: Option<DisplayId>,
    pub timings: Timings,
    pub color: ResolvedColor,
    pub dithering: Dithering,
    pub lut: LutState,
    pub hdr: Option<HdrStaticMetadata>,
    pub mode_validation: ModeValidationParams,
    pub stream_index: Option<u8>,
    pub flip_lock_group: u8,
    pub vrr_enabled: bool,
    /// Survives shutdown so the objects can be re-armed on the next mode.
    pub sync_objects: SmallVec<[SyncObject; 2]>,
}

impl ApiHeadState {
    pub fn is_active(&self) -> bool {
        !self.dpy_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HwHeadState {
    pub owner: Option<usize>,
    pub merge_role: MergeRole,
    pub connector: Option<ConnectorKey>,
    pub timings: Timings,
    pub serializer: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthLedger {
    pub iso_kbps: u64,
    pub dram_floor_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispState {
    pub api_heads: Vec<Arc<ApiHeadState>>,
    pub hw_heads: Vec<HwHeadState>,
    /// One entry per physical head.
    pub flips: Vec<FlipState>,
    pub serializer_bindings: BTreeMap<ConnectorKey, u8>,
}

impl DispState {
    pub fn active_connectors(&self) -> impl Iterator<Item = ConnectorKey> + '_ {
        self.api_heads
            .iter()
            .filter(|head| head.is_active())
            .filter_map(|head| head.connector)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommittedState {
    /// Bumped by every committed transaction.
    pub revision: u64,
    pub disps: Vec<DispState>,
}

impl CommittedState {
    /// Everything off.
    pub fn empty(topology: &DeviceTopology) -> Self {
        let disps = topology
            .disps
            .iter()
            .map(|disp| DispState {
                api_heads: (0..disp.api_heads())
                    .map(|_| Arc::new(ApiHeadState::default()))
                    .collect(),
                hw_heads: vec![HwHeadState::default(); disp.physical_heads().len()],
                flips: vec![FlipState::default(); disp.physical_heads().len()],
                serializer_bindings: BTreeMap::new(),
            })
            .collect();
        Self { revision: 0, disps }
    }

    pub fn api_head(&self, disp: usize, api_head: usize) -> Option<&ApiHeadState> {
        self.disps
            .get(disp)?
            .api_heads
            .get(api_head)
            .map(|head| head.as_ref())
    }

    pub fn any_active(&self) -> bool {
        self.disps
            .iter()
            .any(|disp| disp.api_heads.iter().any(|head| head.is_active()))
    }
}
