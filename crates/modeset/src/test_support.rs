//! Recording backend and topology helpers for engine tests.

use std::collections::HashMap;

use modeset_model::{
    Connector, Dpy, DpyId, DpyIdList, HeadMask, ModeRequest, ModeValidationParams, PixelDepth,
    SignalFormat, Size, Timings, UsageBounds, ViewPort,
};
use modeset_protocol::HeadRequest;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::{
    BandwidthRejected, CapacityHead, CapacityOracle, CapacityRejection, CapacityVerdict,
    HardwareChannel, HwCommand, ModeValidationError, ModeValidator, PendingUpdate,
    ResourceManager, ScratchKind, ScratchPool, UpdateSignal,
};
use crate::state::BandwidthLedger;
use crate::topology::{DeviceTopology, DispTopology, PhysicalHeadCaps};

/// Every collaborator call the engine made, in order per kind.
#[derive(Debug, Clone, Default)]
pub struct BackendLog {
    pub begun: Vec<(usize, DpyIdList)>,
    pub ended: Vec<(usize, DpyIdList)>,
    pub updates: Vec<(usize, PendingUpdate)>,
    pub bandwidth: Vec<(usize, BandwidthLedger)>,
    pub low_power: Vec<bool>,
    pub head_events: Vec<(usize, usize)>,
    pub capacity_checks: Vec<(usize, SmallVec<[CapacityHead; 4]>)>,
    pub scratch_acquired: usize,
    pub scratch_released: usize,
}

impl BackendLog {
    pub fn touched_hardware(&self) -> bool {
        !self.begun.is_empty() || !self.updates.is_empty() || !self.bandwidth.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &HwCommand> + '_ {
        self.updates
            .iter()
            .flat_map(|(_, update)| update.commands.iter())
    }
}

/// Behavior switches. Defaults accept everything.
#[derive(Debug, Clone)]
pub struct Knobs {
    pub rejected_dpys: DpyIdList,
    /// Outputs whose modes come back 4:2:0 only.
    pub yuv420_dpys: DpyIdList,
    /// Modes wider than this need two physical heads.
    pub merge_above_width: Option<u16>,
    pub fixed_rate_link: bool,
    pub vrr_capable: bool,
    pub possible_to_activate: bool,
    pub capacity_rejection: Option<HeadMask>,
    pub finalized_depths: SmallVec<[(usize, PixelDepth); 4]>,
    pub channels_idle: bool,
    pub updates_complete: bool,
    pub reject_bandwidth: bool,
    pub unavailable_scratch: Option<ScratchKind>,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            rejected_dpys: DpyIdList::empty(),
            yuv420_dpys: DpyIdList::empty(),
            merge_above_width: None,
            fixed_rate_link: false,
            vrr_capable: true,
            possible_to_activate: true,
            capacity_rejection: None,
            finalized_depths: SmallVec::new(),
            channels_idle: true,
            updates_complete: true,
            reject_bandwidth: false,
            unavailable_scratch: None,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    log: BackendLog,
    knobs: Knobs,
    held: HashMap<ScratchKind, bool>,
    next_signal: u64,
}

/// Backend that answers from [`Knobs`] and records every call.
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_knobs(knobs: Knobs) -> Self {
        let backend = Self::default();
        backend.state.lock().knobs = knobs;
        backend
    }

    pub fn set_knobs(&self, update: impl FnOnce(&mut Knobs)) {
        update(&mut self.state.lock().knobs);
    }

    pub fn log(&self) -> BackendLog {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log = BackendLog::default();
    }

    /// Scratch buffers currently handed out.
    pub fn scratch_outstanding(&self) -> usize {
        self.state.lock().held.values().filter(|held| **held).count()
    }
}

impl ModeValidator for FakeBackend {
    fn validate_mode(
        &self,
        _disp: usize,
        connector: &Connector,
        dpy: DpyId,
        _params: &ModeValidationParams,
        mode: &ModeRequest,
    ) -> Result<Timings, ModeValidationError> {
        let state = self.state.lock();
        let knobs = &state.knobs;
        if knobs.rejected_dpys.contains(dpy) || mode.pixel_clock_khz == 0 {
            return Err(ModeValidationError {
                dpy,
                reason: format!("no such mode on {}", connector.name),
            });
        }
        let visible = Size::new(mode.h_visible, mode.v_visible);
        let usage = UsageBounds {
            layers: 8,
            scaling: true,
        };
        Ok(Timings {
            pixel_clock_khz: mode.pixel_clock_khz,
            h_visible: mode.h_visible,
            h_total: mode.h_total,
            v_visible: mode.v_visible,
            v_total: mode.v_total,
            v_blank_start: mode.v_visible,
            viewport: ViewPort {
                input: mode.viewport_in.unwrap_or(visible),
                output: mode.viewport_out.unwrap_or(visible),
                possible_usage: usage,
                guaranteed_usage: UsageBounds {
                    layers: 1,
                    scaling: false,
                },
            },
            pixel_depth: PixelDepth::default(),
            yuv420_only: knobs.yuv420_dpys.contains(dpy),
            vrr_capable: knobs.vrr_capable,
            fixed_rate_link: knobs.fixed_rate_link,
            dsc: None,
            merge: knobs
                .merge_above_width
                .is_some_and(|width| mode.h_visible > width),
        })
    }
}

impl ResourceManager for FakeBackend {
    fn begin_modeset(&self, disp: usize, dpys: DpyIdList) {
        self.state.lock().log.begun.push((disp, dpys));
    }

    fn end_modeset(&self, disp: usize, dpys: DpyIdList) {
        self.state.lock().log.ended.push((disp, dpys));
    }

    fn is_possible_to_activate(&self, _disp: usize, _connectors: DpyIdList) -> bool {
        self.state.lock().knobs.possible_to_activate
    }

    fn program_bandwidth(
        &self,
        disp: usize,
        ledger: BandwidthLedger,
    ) -> Result<(), BandwidthRejected> {
        let mut state = self.state.lock();
        state.log.bandwidth.push((disp, ledger));
        if state.knobs.reject_bandwidth {
            return Err(BandwidthRejected { disp, ledger });
        }
        Ok(())
    }

    fn set_low_power_allowed(&self, allowed: bool) {
        self.state.lock().log.low_power.push(allowed);
    }
}

impl CapacityOracle for FakeBackend {
    fn check_capacity(
        &self,
        disp: usize,
        heads: &[CapacityHead],
        _require_boot_clocks: bool,
    ) -> Result<CapacityVerdict, CapacityRejection> {
        let mut state = self.state.lock();
        state
            .log
            .capacity_checks
            .push((disp, heads.iter().copied().collect()));
        if let Some(hw_heads) = state.knobs.capacity_rejection {
            return Err(CapacityRejection { hw_heads });
        }
        let iso_kbps = heads
            .iter()
            .map(|head| head.timings.link_bandwidth_kbps(head.color.space))
            .sum();
        Ok(CapacityVerdict {
            ledger: BandwidthLedger {
                iso_kbps,
                dram_floor_kbps: 1_000 * heads.len() as u32,
            },
            finalized_depths: state.knobs.finalized_depths.clone(),
        })
    }
}

impl HardwareChannel for FakeBackend {
    fn channels_idle(&self, _disp: usize) -> bool {
        self.state.lock().knobs.channels_idle
    }

    fn update(&self, disp: usize, update: PendingUpdate) -> UpdateSignal {
        let mut state = self.state.lock();
        state.log.updates.push((disp, update));
        state.next_signal += 1;
        UpdateSignal(state.next_signal)
    }

    fn poll_update(&self, _disp: usize, _signal: UpdateSignal) -> bool {
        self.state.lock().knobs.updates_complete
    }

    fn enable_head_events(&self, disp: usize, hw_head: usize) {
        self.state.lock().log.head_events.push((disp, hw_head));
    }
}

impl ScratchPool for FakeBackend {
    fn acquire(&self, kind: ScratchKind) -> bool {
        let mut state = self.state.lock();
        if state.knobs.unavailable_scratch == Some(kind) {
            return false;
        }
        let held = state.held.entry(kind).or_default();
        if *held {
            return false;
        }
        *held = true;
        state.log.scratch_acquired += 1;
        true
    }

    fn release(&self, kind: ScratchKind) {
        let mut state = self.state.lock();
        state.held.insert(kind, false);
        state.log.scratch_released += 1;
    }
}

/// Builds a one-disp topology with one connector per output.
#[derive(Debug)]
pub struct TopologyBuilder {
    disp: DispTopology,
}

impl TopologyBuilder {
    /// `layers` lists the layer count of every physical head.
    pub fn new(api_heads: usize, layers: &[u8]) -> Self {
        Self {
            disp: DispTopology::new(api_heads, layers.iter().copied().map(PhysicalHeadCaps::new)),
        }
    }

    pub fn with_physical_heads(
        api_heads: usize,
        heads: impl IntoIterator<Item = PhysicalHeadCaps>,
    ) -> Self {
        Self {
            disp: DispTopology::new(api_heads, heads),
        }
    }

    pub fn merge_pair(mut self, primary: usize, secondary: usize) -> Self {
        self.disp = self.disp.with_merge_pair(primary, secondary);
        self
    }

    pub fn link_serializers(mut self, count: u8) -> Self {
        self.disp = self.disp.with_link_serializers(count);
        self
    }

    pub fn output(self, dpy: u8, signal_format: SignalFormat) -> Self {
        self.output_with(dpy, signal_format, |_, _| {})
    }

    pub fn output_with(
        mut self,
        dpy: u8,
        signal_format: SignalFormat,
        configure: impl FnOnce(&mut Connector, &mut Dpy),
    ) -> Self {
        let id = DpyId::new(dpy);
        let mut connector = Connector::new(id, format!("out-{dpy}"), signal_format);
        let mut output = Dpy::new(id, Default::default());
        configure(&mut connector, &mut output);
        output.connector = self.disp.add_connector(connector);
        self.disp.add_dpy(output);
        self
    }

    /// Adds `dpy` behind the connector that already carries `sharing`.
    pub fn shared_output(mut self, dpy: u8, sharing: u8, configure: impl FnOnce(&mut Dpy)) -> Self {
        let connector = self
            .disp
            .dpy(DpyId::new(sharing))
            .map(|existing| existing.connector)
            .unwrap_or_else(|| panic!("dpy {sharing} has no connector to share"));
        let mut output = Dpy::new(DpyId::new(dpy), connector);
        configure(&mut output);
        self.disp.add_dpy(output);
        self
    }

    pub fn build(self) -> DispTopology {
        self.disp
    }

    pub fn device(self) -> DeviceTopology {
        DeviceTopology::new(vec![self.disp])
    }
}

/// A 60 Hz style mode with blanking proportional to the visible area.
pub fn mode(width: u16, height: u16, pixel_clock_khz: u32) -> ModeRequest {
    ModeRequest {
        pixel_clock_khz,
        h_visible: width,
        h_total: width + width / 8,
        v_visible: height,
        v_total: height + height / 20,
        viewport_in: None,
        viewport_out: None,
    }
}

pub fn head(dpy: u8, mode: ModeRequest) -> HeadRequest {
    HeadRequest {
        dpy_ids: DpyIdList::single(DpyId::new(dpy)),
        mode,
        ..HeadRequest::default()
    }
}
