//! Request and reply types of a modeset transaction.

use modeset_model::{
    ColorBpc, ColorRange, ColorSpace, DisplayId, DpyIdList, FlipState, HdrStaticMetadata,
    HeadMask, InputLut, ModeRequest, ModeValidationParams, ResolvedColor, UsageBounds,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Outcome reported at request, disp, and head level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Success,
    InvalidRequestShape,
    NotModesetOwner,
    InvalidPermissions,
    InvalidDisplay,
    InvalidMode,
    InvalidLut,
    InvalidFlip,
    FailedToAssignHardwareHeads,
    FailedExtendedCapabilityCheck,
    IncompatibleDisplays,
    DuplicateDisplays,
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LutUpdate<T> {
    /// Keep what the head has now; disabled after an ownership change.
    #[default]
    Keep,
    Disable,
    Set(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LutRequest {
    pub input: LutUpdate<InputLut>,
    pub output: LutUpdate<()>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadRequest {
    /// Empty list shuts the head down.
    pub dpy_ids: DpyIdList,
    pub mode: ModeRequest,
    pub mode_validation: ModeValidationParams,
    pub flip: FlipState,
    pub lut: LutRequest,
    pub color_space: Option<ColorSpace>,
    pub color_range: Option<ColorRange>,
    pub color_bpc: Option<ColorBpc>,
    pub hdr: Option<HdrStaticMetadata>,
    pub allow_flip_lock: bool,
    pub allow_vrr: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispRequest {
    pub requested_heads: HeadMask,
    /// Indexed by virtual head. Requested heads past the end are shut down.
    pub heads: SmallVec<[HeadRequest; 4]>,
}

impl DispRequest {
    pub fn head(&self, api_head: usize) -> Option<&HeadRequest> {
        self.heads.get(api_head)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModesetRequest {
    /// `false` builds and validates without touching hardware.
    pub commit: bool,
    pub requested_disps: u32,
    /// Indexed by disp.
    pub disps: SmallVec<[DispRequest; 2]>,
}

impl ModesetRequest {
    pub fn check() -> Self {
        Self::default()
    }

    pub fn commit() -> Self {
        Self {
            commit: true,
            ..Self::default()
        }
    }

    pub fn with_head(mut self, disp: usize, api_head: usize, head: HeadRequest) -> Self {
        self.set_head(disp, api_head, head);
        self
    }

    pub fn set_head(&mut self, disp: usize, api_head: usize, head: HeadRequest) {
        self.requested_disps |= 1 << disp;
        if self.disps.len() <= disp {
            self.disps.resize_with(disp + 1, DispRequest::default);
        }
        let disp_request = &mut self.disps[disp];
        disp_request.requested_heads.insert(api_head);
        if disp_request.heads.len() <= api_head {
            disp_request
                .heads
                .resize_with(api_head + 1, HeadRequest::default);
        }
        disp_request.heads[api_head] = head;
    }

    pub fn is_disp_requested(&self, disp: usize) -> bool {
        disp < u32::BITS as usize && self.requested_disps & (1 << disp) != 0
    }

    pub fn disp(&self, disp: usize) -> Option<&DispRequest> {
        if !self.is_disp_requested(disp) {
            return None;
        }
        self.disps.get(disp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeadReply {
    pub status: Status,
    pub hw_heads: HeadMask,
    pub display_id: Option<DisplayId>,
    pub possible_usage: UsageBounds,
    pub guaranteed_usage: UsageBounds,
    pub color: Option<ResolvedColor>,
    pub vrr_enabled: bool,
    pub flip_lock_group: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispReply {
    pub status: Status,
    pub heads: SmallVec<[HeadReply; 4]>,
}

/// Problems after the point of no return. The transaction still succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModesetWarning {
    UpdateTimedOut { disp: usize },
    BandwidthPinRejected { disp: usize },
    BandwidthReprogramRejected { disp: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModesetReply {
    pub status: Status,
    pub disps: SmallVec<[DispReply; 2]>,
    pub warnings: Vec<ModesetWarning>,
}

impl ModesetReply {
    /// Success at every level. Anything else means nothing changed.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
            && self.disps.iter().all(|disp| {
                disp.status.is_success() && disp.heads.iter().all(|head| head.status.is_success())
            })
    }

    pub fn head(&self, disp: usize, api_head: usize) -> Option<&HeadReply> {
        self.disps.get(disp)?.heads.get(api_head)
    }

    /// First failing status in disp then head order.
    pub fn first_failure(&self) -> Option<Status> {
        if !self.status.is_success() {
            return Some(self.status);
        }
        self.disps.iter().find_map(|disp| {
            if !disp.status.is_success() {
                return Some(disp.status);
            }
            disp.heads
                .iter()
                .map(|head| head.status)
                .find(|status| !status.is_success())
        })
    }
}

#[cfg(test)]
mod tests {
    use modeset_model::DpyId;

    use super::*;

    #[test]
    fn with_head_sets_touched_bits_and_pads_entries() {
        let request = ModesetRequest::commit().with_head(
            1,
            2,
            HeadRequest {
                dpy_ids: DpyIdList::single(DpyId::new(4)),
                ..HeadRequest::default()
            },
        );

        assert!(request.commit);
        assert_eq!(request.requested_disps, 0b10);
        assert!(request.disp(0).is_none());
        let disp = request.disp(1).expect("disp 1 requested");
        assert_eq!(disp.requested_heads.raw(), 0b100);
        assert_eq!(disp.heads.len(), 3);
        assert!(disp.head(0).expect("padded").dpy_ids.is_empty());
        assert!(disp.head(2).expect("set").dpy_ids.contains(DpyId::new(4)));
    }

    #[test]
    fn first_failure_prefers_disp_status_over_heads() {
        let mut reply = ModesetReply::default();
        reply.disps.push(DispReply {
            status: Status::Success,
            heads: smallvec::smallvec![HeadReply::default(), HeadReply {
                status: Status::InvalidMode,
                ..HeadReply::default()
            }],
        });
        assert!(!reply.is_success());
        assert_eq!(reply.first_failure(), Some(Status::InvalidMode));

        reply.disps[0].status = Status::FailedToAssignHardwareHeads;
        assert_eq!(reply.first_failure(), Some(Status::FailedToAssignHardwareHeads));
    }

    #[test]
    fn request_parses_from_json() {
        let json = r#"{
            "commit": true,
            "requested_disps": 1,
            "disps": [{
                "requested_heads": 1,
                "heads": [{
                    "dpy_ids": 2,
                    "mode": {
                        "pixel_clock_khz": 148500,
                        "h_visible": 1920, "h_total": 2200,
                        "v_visible": 1080, "v_total": 1125,
                        "viewport_in": null, "viewport_out": null
                    },
                    "mode_validation": { "overrides": "", "stereo": false },
                    "flip": { "layers": [], "transfer_function": "Sdr", "dirty": false },
                    "lut": { "input": "Keep", "output": "Keep" },
                    "color_space": null, "color_range": null, "color_bpc": "Ten",
                    "hdr": null, "allow_flip_lock": false, "allow_vrr": true
                }]
            }]
        }"#;
        let request: ModesetRequest = serde_json::from_str(json).expect("valid request json");
        let head = request
            .disp(0)
            .and_then(|disp| disp.head(0))
            .expect("head 0 of disp 0");
        assert!(head.dpy_ids.contains(DpyId::new(1)));
        assert_eq!(head.color_bpc, Some(ColorBpc::Ten));
        assert!(head.allow_vrr);
    }
}
