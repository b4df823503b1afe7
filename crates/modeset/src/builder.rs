//! Proposed-State Builder: merges a request into a copy of the committed state.

use std::sync::Arc;

use modeset_model::{
    ColorBpc, ColorPins, ColorRange, ColorSpace, Connector, Dpy, FlipState, HeadMask, LutState,
    PixelDepth, ResolvedColor, Timings,
};
use modeset_protocol::{HeadRequest, LutRequest, LutUpdate, ModesetRequest, Status};
use smallvec::SmallVec;

use crate::backend::ModeValidator;
use crate::candidate::{Candidate, ProposedApiHead};
use crate::display_id::DisplayIdReservation;
use crate::reply::{Rejection, Rejections};
use crate::state::{ApiHeadState, CommittedState};
use crate::topology::{DeviceTopology, DispTopology};

pub(crate) struct BuildContext<'a, V: ModeValidator + ?Sized> {
    pub(crate) topology: &'a DeviceTopology,
    pub(crate) validator: &'a V,
    /// Ownership was not inherited: every head is rebuilt from scratch.
    pub(crate) rebuild: bool,
    pub(crate) commit: bool,
}

pub(crate) fn build<V: ModeValidator + ?Sized>(
    ctx: &BuildContext<'_, V>,
    committed: &CommittedState,
    request: &ModesetRequest,
    ids: &mut DisplayIdReservation<'_>,
) -> Result<Candidate, Rejections> {
    let mut candidate = Candidate::from_committed(committed);
    let mut rejections = Rejections::new();
    let mut flip_lock_heads: SmallVec<[(usize, usize); 4]> = SmallVec::new();
    let shutdown = HeadRequest::default();

    for (disp_index, (disp_topology, disp)) in ctx
        .topology
        .disps
        .iter()
        .zip(candidate.disps.iter_mut())
        .enumerate()
    {
        let disp_request = request.disp(disp_index);
        for (api_head, proposed) in disp.api_heads.iter_mut().enumerate() {
            let head_request = match disp_request {
                Some(disp_request) if disp_request.requested_heads.contains(api_head) => {
                    disp_request.head(api_head).unwrap_or(&shutdown)
                }
                _ if ctx.rebuild => &shutdown,
                _ => continue,
            };
            let built = build_head(
                ctx,
                disp_index,
                disp_topology,
                api_head,
                proposed,
                head_request,
                ids,
            );
            match built {
                Ok(()) if head_request.allow_flip_lock && proposed.is_active() => {
                    flip_lock_heads.push((disp_index, api_head));
                }
                Ok(()) => {}
                Err(status) => {
                    tracing::debug!(disp = disp_index, api_head, ?status, "head rejected by builder");
                    rejections.push(Rejection::head(disp_index, api_head, status));
                }
            }
        }
    }

    if !rejections.is_empty() {
        return Err(rejections);
    }
    assign_flip_lock_group(&mut candidate, &flip_lock_heads);
    Ok(candidate)
}

fn build_head<V: ModeValidator + ?Sized>(
    ctx: &BuildContext<'_, V>,
    disp_index: usize,
    disp: &DispTopology,
    api_head: usize,
    proposed: &mut ProposedApiHead,
    request: &HeadRequest,
    ids: &mut DisplayIdReservation<'_>,
) -> Result<(), Status> {
    let previous = Arc::clone(&proposed.state);
    proposed.changed = true;
    proposed.pins = ColorPins::default();

    if request.dpy_ids.is_empty() {
        proposed.state = Arc::new(ApiHeadState {
            sync_objects: previous.sync_objects.clone(),
            ..ApiHeadState::default()
        });
        proposed.flip = FlipState::default();
        return Ok(());
    }

    let Some((dpy, connector_key, connector)) = disp.resolve(request.dpy_ids) else {
        return Err(Status::InvalidDisplay);
    };
    if !connector.valid_heads.contains(api_head) {
        return Err(Status::InvalidDisplay);
    }

    let mut timings = ctx
        .validator
        .validate_mode(
            disp_index,
            connector,
            dpy.id,
            &request.mode_validation,
            &request.mode,
        )
        .map_err(|error| {
            tracing::debug!(disp = disp_index, api_head, %error, "mode validation failed");
            Status::InvalidMode
        })?;

    let (color, pins) = resolve_color(connector, dpy, &timings, request).map_err(|conflict| {
        tracing::debug!(disp = disp_index, api_head, %conflict, "color request conflicts");
        Status::InvalidMode
    })?;
    timings.pixel_depth = color.pixel_depth;

    request.flip.check_structure().map_err(|error| {
        tracing::debug!(disp = disp_index, api_head, %error, "flip request rejected");
        Status::InvalidFlip
    })?;

    let display_id = ids.alloc().map_err(|error| {
        tracing::warn!(disp = disp_index, api_head, %error, "no display identifier left");
        Status::InvalidDisplay
    })?;

    proposed.state = Arc::new(ApiHeadState {
        hw_heads: if ctx.rebuild {
            HeadMask::empty()
        } else {
            previous.hw_heads
        },
        dpy_ids: request.dpy_ids,
        connector: Some(connector_key),
        display_id: Some(display_id),
        timings,
        color,
        dithering: dpy.dithering,
        lut: resolve_lut(previous.lut, request.lut, ctx.rebuild),
        hdr: request.hdr,
        mode_validation: request.mode_validation,
        stream_index: dpy.stream_index,
        flip_lock_group: 0,
        vrr_enabled: request.allow_vrr && timings.vrr_capable,
        sync_objects: previous.sync_objects.clone(),
    });
    proposed.pins = pins;
    proposed.flip = FlipState {
        dirty: ctx.commit,
        ..request.flip.clone()
    };
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ColorConflict {
    #[error("requested {requested:?} but the output can only carry {resolved:?}")]
    Space {
        requested: ColorSpace,
        resolved: ColorSpace,
    },
    #[error("requested {requested:?} range but {resolved:?} is required")]
    Range {
        requested: ColorRange,
        resolved: ColorRange,
    },
    #[error("requested {requested:?} per component but the connector tops out at {resolved:?}")]
    Bpc {
        requested: ColorBpc,
        resolved: ColorBpc,
    },
}

/// Explicit overrides win, then the output's last preference. An explicit
/// value that cannot be honored is a conflict, and pins that axis.
pub(crate) fn resolve_color(
    connector: &Connector,
    dpy: &Dpy,
    timings: &Timings,
    request: &HeadRequest,
) -> Result<(ResolvedColor, ColorPins), ColorConflict> {
    let preference = dpy.preference;

    let wanted_space = request.color_space.unwrap_or(preference.space);
    let space = match wanted_space {
        _ if timings.yuv420_only => ColorSpace::YCbCr420,
        ColorSpace::YCbCr420 => ColorSpace::Rgb,
        ColorSpace::YCbCr422 if !connector.ycbcr422 => ColorSpace::Rgb,
        space => space,
    };

    let wanted_range = request.color_range.unwrap_or(preference.range);
    let range = if space == ColorSpace::Rgb {
        wanted_range
    } else {
        ColorRange::Limited
    };

    let wanted_bpc = request.color_bpc.unwrap_or(preference.bpc);
    let bpc = wanted_bpc.min(connector.max_bpc);

    if let Some(requested) = request.color_space
        && requested != space
    {
        return Err(ColorConflict::Space {
            requested,
            resolved: space,
        });
    }
    if let Some(requested) = request.color_range
        && requested != range
    {
        return Err(ColorConflict::Range {
            requested,
            resolved: range,
        });
    }
    if let Some(requested) = request.color_bpc
        && requested != bpc
    {
        return Err(ColorConflict::Bpc {
            requested,
            resolved: bpc,
        });
    }

    let color = ResolvedColor {
        space,
        range,
        pixel_depth: PixelDepth::for_color(space, bpc),
    };
    let pins = ColorPins {
        space: request.color_space.is_some(),
        range: request.color_range.is_some(),
        bpc: request.color_bpc.is_some(),
    };
    Ok((color, pins))
}

fn resolve_lut(previous: LutState, request: LutRequest, rebuild: bool) -> LutState {
    let input = match request.input {
        LutUpdate::Keep if rebuild => None,
        LutUpdate::Keep => previous.input,
        LutUpdate::Disable => None,
        LutUpdate::Set(lut) => Some(lut),
    };
    let output_enabled = match request.output {
        LutUpdate::Keep => !rebuild && previous.output_enabled,
        LutUpdate::Disable => false,
        LutUpdate::Set(()) => true,
    };
    LutState {
        input,
        output_enabled,
    }
}

/// Gives every flip-lock head of this request the lowest group value not
/// already used by a proposed head. Group values are 1-based, 0 means none.
fn assign_flip_lock_group(candidate: &mut Candidate, heads: &[(usize, usize)]) {
    if heads.is_empty() {
        return;
    }
    let mut used = [false; 256];
    for disp in &candidate.disps {
        for head in &disp.api_heads {
            used[head.state().flip_lock_group as usize] = true;
        }
    }
    let Some(group) = (1..=u8::MAX).find(|group| !used[*group as usize]) else {
        tracing::warn!("no free flip-lock group value");
        return;
    };
    for &(disp, api_head) in heads {
        candidate.disps[disp].api_heads[api_head]
            .state_mut()
            .flip_lock_group = group;
    }
}

#[cfg(test)]
mod tests {
    use modeset_model::{ColorPreference, ConnectorKey, DpyId, SignalFormat};

    use super::*;

    fn connector(max_bpc: ColorBpc, ycbcr422: bool) -> Connector {
        Connector {
            max_bpc,
            ycbcr422,
            ..Connector::new(DpyId::new(0), "HDMI-0", SignalFormat::Generic)
        }
    }

    fn dpy(preference: ColorPreference) -> Dpy {
        Dpy {
            preference,
            ..Dpy::new(DpyId::new(0), ConnectorKey::default())
        }
    }

    #[test]
    fn preference_is_used_without_overrides() {
        let preference = ColorPreference {
            space: ColorSpace::Rgb,
            range: ColorRange::Limited,
            bpc: ColorBpc::Ten,
        };
        let (color, pins) = resolve_color(
            &connector(ColorBpc::Ten, false),
            &dpy(preference),
            &Timings::default(),
            &HeadRequest::default(),
        )
        .expect("preference resolves");
        assert_eq!(color.pixel_depth, PixelDepth::Bpp30Rgb444);
        assert_eq!(color.range, ColorRange::Limited);
        assert_eq!(pins, ColorPins::default());
    }

    #[test]
    fn preference_bpc_is_clamped_but_explicit_bpc_conflicts() {
        let preference = ColorPreference {
            bpc: ColorBpc::Ten,
            ..ColorPreference::default()
        };
        let narrow = connector(ColorBpc::Eight, false);
        let (color, _) = resolve_color(
            &narrow,
            &dpy(preference),
            &Timings::default(),
            &HeadRequest::default(),
        )
        .expect("clamped");
        assert_eq!(color.pixel_depth, PixelDepth::Bpp24Rgb444);

        let request = HeadRequest {
            color_bpc: Some(ColorBpc::Ten),
            ..HeadRequest::default()
        };
        assert_eq!(
            resolve_color(&narrow, &dpy(preference), &Timings::default(), &request),
            Err(ColorConflict::Bpc {
                requested: ColorBpc::Ten,
                resolved: ColorBpc::Eight
            })
        );
    }

    #[test]
    fn yuv420_timings_force_sampling_and_limited_range() {
        let timings = Timings {
            yuv420_only: true,
            ..Timings::default()
        };
        let (color, _) = resolve_color(
            &connector(ColorBpc::Ten, false),
            &dpy(ColorPreference::default()),
            &timings,
            &HeadRequest::default(),
        )
        .expect("420 resolves");
        assert_eq!(color.space, ColorSpace::YCbCr420);
        assert_eq!(color.range, ColorRange::Limited);

        let request = HeadRequest {
            color_range: Some(ColorRange::Full),
            ..HeadRequest::default()
        };
        assert!(matches!(
            resolve_color(
                &connector(ColorBpc::Ten, false),
                &dpy(ColorPreference::default()),
                &timings,
                &request
            ),
            Err(ColorConflict::Range { .. })
        ));
    }

    #[test]
    fn explicit_ycbcr422_needs_connector_support() {
        let request = HeadRequest {
            color_space: Some(ColorSpace::YCbCr422),
            ..HeadRequest::default()
        };
        assert!(matches!(
            resolve_color(
                &connector(ColorBpc::Ten, false),
                &dpy(ColorPreference::default()),
                &Timings::default(),
                &request
            ),
            Err(ColorConflict::Space { .. })
        ));
        let (color, pins) = resolve_color(
            &connector(ColorBpc::Ten, true),
            &dpy(ColorPreference::default()),
            &Timings::default(),
            &request,
        )
        .expect("422 supported");
        assert_eq!(color.pixel_depth, PixelDepth::Bpp16Ycbcr422);
        assert!(pins.space && !pins.bpc);
    }

    #[test]
    fn lut_keep_is_dropped_on_rebuild() {
        let previous = LutState {
            input: Some(modeset_model::InputLut {
                depth: 8,
                start: 0,
                end: 255,
            }),
            output_enabled: true,
        };
        assert_eq!(resolve_lut(previous, LutRequest::default(), false), previous);
        assert_eq!(
            resolve_lut(previous, LutRequest::default(), true),
            LutState::default()
        );
    }
}
