use std::collections::BTreeMap;

use modeset_model::{
    Connector, ConnectorKey, Dpy, DpyId, DpyIdList, MAX_DPYS_PER_DISP, MAX_HEADS_PER_DISP, Size,
};
use slotmap::SlotMap;
use smallvec::SmallVec;

/// One scaler filter configuration. Downscale factors are in quarters, so
/// `max_downscale_x4 == 8` allows a 2:1 reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapConfig {
    pub taps: u8,
    pub max_downscale_x4: u16,
    pub max_input_width: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScalerCaps {
    pub taps: SmallVec<[TapConfig; 3]>,
}

impl ScalerCaps {
    pub fn supports(&self, input: Size, output: Size) -> bool {
        if input == output {
            return true;
        }
        if input.is_empty() || output.is_empty() {
            return false;
        }
        self.taps.iter().any(|config| {
            input.width <= config.max_input_width
                && input.width as u32 * 4 <= output.width as u32 * config.max_downscale_x4 as u32
                && input.height as u32 * 4 <= output.height as u32 * config.max_downscale_x4 as u32
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalHeadCaps {
    pub layers: u8,
    pub scaler: ScalerCaps,
}

impl PhysicalHeadCaps {
    pub fn new(layers: u8) -> Self {
        Self {
            layers,
            scaler: ScalerCaps::default(),
        }
    }
}

/// Fixed resources of one display controller, known from device attach on.
#[derive(Debug, Clone)]
pub struct DispTopology {
    api_heads: usize,
    physical_heads: SmallVec<[PhysicalHeadCaps; 4]>,
    merge_pairs: SmallVec<[(usize, usize); 2]>,
    link_serializers: u8,
    connectors: SlotMap<ConnectorKey, Connector>,
    dpys: BTreeMap<DpyId, Dpy>,
}

impl DispTopology {
    pub fn new(api_heads: usize, physical_heads: impl IntoIterator<Item = PhysicalHeadCaps>) -> Self {
        let physical_heads: SmallVec<[PhysicalHeadCaps; 4]> = physical_heads.into_iter().collect();
        assert!(
            api_heads <= MAX_HEADS_PER_DISP && physical_heads.len() <= MAX_HEADS_PER_DISP,
            "disp topology exceeds {MAX_HEADS_PER_DISP} heads"
        );
        Self {
            api_heads,
            link_serializers: physical_heads.len() as u8,
            physical_heads,
            merge_pairs: SmallVec::new(),
            connectors: SlotMap::with_key(),
            dpys: BTreeMap::new(),
        }
    }

    pub fn with_merge_pair(mut self, primary: usize, secondary: usize) -> Self {
        assert!(
            primary < secondary && secondary < self.physical_heads.len(),
            "merge pair ({primary}, {secondary}) out of range"
        );
        self.merge_pairs.push((primary, secondary));
        self
    }

    pub fn with_link_serializers(mut self, count: u8) -> Self {
        self.link_serializers = count;
        self
    }

    pub fn add_connector(&mut self, connector: Connector) -> ConnectorKey {
        self.connectors.insert(connector)
    }

    /// Registers an output. Panics when the dpy names an unknown connector.
    pub fn add_dpy(&mut self, dpy: Dpy) {
        assert!(
            self.connectors.contains_key(dpy.connector),
            "dpy {} references an unknown connector",
            dpy.id
        );
        assert!(dpy.id.index() < MAX_DPYS_PER_DISP);
        self.dpys.insert(dpy.id, dpy);
    }

    pub fn api_heads(&self) -> usize {
        self.api_heads
    }

    pub fn physical_heads(&self) -> &[PhysicalHeadCaps] {
        &self.physical_heads
    }

    pub fn merge_pairs(&self) -> &[(usize, usize)] {
        &self.merge_pairs
    }

    pub fn link_serializers(&self) -> u8 {
        self.link_serializers
    }

    pub fn connector(&self, key: ConnectorKey) -> Option<&Connector> {
        self.connectors.get(key)
    }

    pub fn dpy(&self, id: DpyId) -> Option<&Dpy> {
        self.dpys.get(&id)
    }

    pub fn valid_dpys(&self) -> DpyIdList {
        self.dpys.keys().copied().collect()
    }

    /// Lowest dpy of `list` known to this disp, with its connector.
    pub fn resolve(&self, list: DpyIdList) -> Option<(&Dpy, ConnectorKey, &Connector)> {
        list.iter().find_map(|id| {
            let dpy = self.dpys.get(&id)?;
            let connector = self.connectors.get(dpy.connector)?;
            Some((dpy, dpy.connector, connector))
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTopology {
    pub disps: Vec<DispTopology>,
}

impl DeviceTopology {
    pub fn new(disps: Vec<DispTopology>) -> Self {
        Self { disps }
    }

    pub fn disp(&self, index: usize) -> Option<&DispTopology> {
        self.disps.get(index)
    }
}
