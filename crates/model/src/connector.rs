use slotmap::new_key_type;

use crate::color::{ColorBpc, ColorPreference, Dithering};
use crate::ids::{DpyId, DpyIdList, HeadMask};

new_key_type! {
    pub struct ConnectorKey;
}

/// Placement class of a connector, deciding how the solver may bind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalFormat {
    /// Serial panel wired to physical head 0.
    FixedPanel,
    /// Serializer streams are hard-wired to the physical head of the same index.
    LinkSerializer,
    /// Multi-stream link; several heads may share its bandwidth.
    MultiStream,
    Generic,
}

impl SignalFormat {
    /// Connectors driven through the link-training library cannot be
    /// reprogrammed glitchlessly.
    pub const fn is_link_managed(self) -> bool {
        matches!(self, SignalFormat::LinkSerializer | SignalFormat::MultiStream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkCaps {
    pub capacity_kbps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub dpy_id: DpyId,
    pub name: String,
    pub signal_format: SignalFormat,
    /// Virtual heads allowed to drive this connector.
    pub valid_heads: HeadMask,
    pub link: Option<LinkCaps>,
    /// Connectors that cannot be active at the same time as this one.
    pub exclusive_with: DpyIdList,
    pub max_bpc: ColorBpc,
    pub ycbcr422: bool,
}

impl Connector {
    pub fn new(dpy_id: DpyId, name: impl Into<String>, signal_format: SignalFormat) -> Self {
        Self {
            dpy_id,
            name: name.into(),
            signal_format,
            valid_heads: HeadMask::from_raw(u8::MAX),
            link: None,
            exclusive_with: DpyIdList::empty(),
            max_bpc: ColorBpc::Ten,
            ycbcr422: false,
        }
    }
}

/// A display output reachable through a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dpy {
    pub id: DpyId,
    pub connector: ConnectorKey,
    /// Serializer stream this output is wired to on link-serializer connectors.
    pub stream_index: Option<u8>,
    pub preference: ColorPreference,
    pub dithering: Dithering,
}

impl Dpy {
    pub fn new(id: DpyId, connector: ConnectorKey) -> Self {
        Self {
            id,
            connector,
            stream_index: None,
            preference: ColorPreference::default(),
            dithering: Dithering::default(),
        }
    }
}
