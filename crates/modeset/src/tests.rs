use std::sync::Arc;

use modeset_model::{
    ColorBpc, ColorSpace, DpyId, DpyIdList, FlipState, HeadMask, LayerFlip, LinkCaps,
    ModeValidationOverrides, ModeValidationParams, PixelDepth, SignalFormat, Size, SurfaceDesc,
    SurfaceFormat, TransferFunction,
};
use modeset_protocol::{DispRequest, HeadRequest, ModesetRequest, ModesetWarning, Status};
use smallvec::{SmallVec, smallvec};

use crate::test_support::{FakeBackend, Knobs, TopologyBuilder, head, mode};
use crate::{
    BandwidthLedger, Device, DeviceTopology, HeadChange, HwCommand, ModesetConfig, ModesetError,
    ModesetPermissions, OwnerId, PhysicalHeadCaps, ScalerCaps, ScratchKind, TapConfig,
};

const OWNER: OwnerId = OwnerId::new(1);

fn device_with(topology: DeviceTopology, knobs: Knobs, config: ModesetConfig) -> Device<FakeBackend> {
    let device = Device::new(topology, FakeBackend::with_knobs(knobs), config);
    device.grab_ownership(OWNER).expect("device starts unowned");
    device
}

fn device(topology: DeviceTopology) -> Device<FakeBackend> {
    device_with(topology, Knobs::default(), ModesetConfig::default())
}

fn two_generic_outputs() -> DeviceTopology {
    TopologyBuilder::new(2, &[1, 1])
        .output(0, SignalFormat::Generic)
        .output(1, SignalFormat::Generic)
        .device()
}

fn fhd() -> modeset_model::ModeRequest {
    mode(1920, 1080, 148_500)
}

fn commit_one(device: &Device<FakeBackend>, api_head: usize, dpy: u8) {
    let request = ModesetRequest::commit().with_head(0, api_head, head(dpy, fhd()));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");
}

#[test]
fn single_output_lands_on_physical_head_zero() {
    let device = device(two_generic_outputs());
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert!(reply.is_success());
    let head_reply = reply.head(0, 0).expect("head 0 replied");
    assert_eq!(head_reply.hw_heads, HeadMask::single(0));
    assert!(head_reply.display_id.is_some());

    let committed = device.committed();
    assert_eq!(committed.revision, 1);
    let state = committed.api_head(0, 0).expect("head 0 exists");
    assert_eq!(state.hw_heads, HeadMask::single(0));
    assert_eq!(committed.disps[0].hw_heads[0].owner, Some(0));

    let log = device.backend().log();
    assert_eq!(log.begun.len(), 1);
    assert_eq!(log.ended.len(), 1);
    assert_eq!(log.updates.len(), 1);
    assert_eq!(log.head_events, vec![(0, 0)]);
    assert_eq!(device.backend().scratch_outstanding(), 0);
}

#[test]
fn two_fixed_panels_fail_assignment_and_change_nothing() {
    let topology = TopologyBuilder::new(2, &[1, 1])
        .output(0, SignalFormat::FixedPanel)
        .output(1, SignalFormat::FixedPanel)
        .device();
    let device = device(topology);
    let before = device.committed();

    let request = ModesetRequest::commit()
        .with_head(0, 0, head(0, fhd()))
        .with_head(0, 1, head(1, fhd()));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert!(!reply.is_success());
    assert_eq!(reply.disps[0].status, Status::FailedToAssignHardwareHeads);
    assert_eq!(reply.disps[0].heads[1].status, Status::FailedToAssignHardwareHeads);
    assert_eq!(reply.disps[0].heads[0].status, Status::Success);
    assert!(Arc::ptr_eq(&before, &device.committed()));
    assert!(!device.backend().log().touched_hardware());
    assert_eq!(device.backend().scratch_outstanding(), 0);
}

fn narrow_link_topology(capacity_kbps: u64) -> DeviceTopology {
    TopologyBuilder::new(1, &[1])
        .output_with(0, SignalFormat::Generic, |connector, dpy| {
            connector.link = Some(LinkCaps { capacity_kbps });
            dpy.preference.bpc = ColorBpc::Ten;
        })
        .device()
}

#[test]
fn link_overflow_is_fixed_by_one_downgrade() {
    // 100 MHz at 30 bpp needs 3.0 Gbps, at 24 bpp 2.4 Gbps.
    let device = device(narrow_link_topology(2_500_000));
    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 100_000)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert!(reply.is_success(), "{reply:?}");
    let color = reply.head(0, 0).and_then(|head| head.color).expect("color reported");
    assert_eq!(color.pixel_depth, PixelDepth::Bpp24Rgb444);
    let committed = device.committed();
    let state = committed.api_head(0, 0).expect("head exists");
    assert_eq!(state.timings.pixel_depth, PixelDepth::Bpp24Rgb444);
}

#[test]
fn pinned_depth_is_never_downgraded() {
    let device = device(narrow_link_topology(2_500_000));
    let mut request_head = head(0, mode(1280, 720, 100_000));
    request_head.color_bpc = Some(ColorBpc::Ten);
    let request = ModesetRequest::commit().with_head(0, 0, request_head);
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert_eq!(reply.disps[0].status, Status::FailedExtendedCapabilityCheck);
    assert_eq!(reply.disps[0].heads[0].status, Status::FailedExtendedCapabilityCheck);
    assert_eq!(device.committed().revision, 0);
}

#[test]
fn downgrade_stops_at_the_configured_bound() {
    // Only 18 bpp (1.8 Gbps) fits, which is two steps away.
    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 100_000)));

    let strict = device(narrow_link_topology(2_000_000));
    let reply = strict.perform_modeset(OWNER, &request).expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::FailedExtendedCapabilityCheck);

    let config = ModesetConfig {
        link_downgrade_retries: 2,
        ..ModesetConfig::default()
    };
    let relaxed = device_with(narrow_link_topology(2_000_000), Knobs::default(), config);
    let reply = relaxed.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success());
    let color = reply.head(0, 0).and_then(|head| head.color).expect("color reported");
    assert_eq!(color.pixel_depth, PixelDepth::Bpp18Rgb444);
}

#[test]
fn link_check_can_be_skipped_per_head() {
    let device = device(narrow_link_topology(1_000));
    let mut request_head = head(0, mode(1280, 720, 100_000));
    request_head.mode_validation = ModeValidationParams {
        overrides: ModeValidationOverrides::NO_LINK_BANDWIDTH_CHECK,
        stereo: false,
    };
    let request = ModesetRequest::commit().with_head(0, 0, request_head);
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success());
    let color = reply.head(0, 0).and_then(|head| head.color).expect("color reported");
    assert_eq!(color.pixel_depth, PixelDepth::Bpp30Rgb444);
}

/// Two outputs behind one multi-stream connector.
fn shared_link_topology(capacity_kbps: u64) -> DeviceTopology {
    TopologyBuilder::new(2, &[1, 1])
        .output_with(0, SignalFormat::MultiStream, |connector, dpy| {
            connector.link = Some(LinkCaps { capacity_kbps });
            dpy.preference.bpc = ColorBpc::Ten;
        })
        .shared_output(1, 0, |dpy| dpy.preference.bpc = ColorBpc::Ten)
        .device()
}

#[test]
fn shared_link_downgrades_every_head_and_binds_one_serializer() {
    // Two heads at 30 bpp need 6.0 Gbps together, at 24 bpp 4.8 Gbps.
    let device = device(shared_link_topology(5_000_000));
    let request = ModesetRequest::commit()
        .with_head(0, 0, head(0, mode(1280, 720, 100_000)))
        .with_head(0, 1, head(1, mode(1280, 720, 100_000)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert!(reply.is_success(), "{reply:?}");
    for api_head in 0..2 {
        let color = reply.head(0, api_head).and_then(|head| head.color).expect("color reported");
        assert_eq!(color.pixel_depth, PixelDepth::Bpp24Rgb444);
    }

    let log = device.backend().log();
    let attached: Vec<(u8, DpyId)> = log
        .commands()
        .filter_map(|command| match command {
            HwCommand::AttachSerializer {
                serializer,
                connector,
                ..
            } => Some((*serializer, *connector)),
            _ => None,
        })
        .collect();
    assert_eq!(attached, vec![(0, DpyId::new(0)), (0, DpyId::new(0))]);
}

#[test]
fn skipping_the_link_check_on_one_head_still_checks_the_others() {
    let device = device(shared_link_topology(1_000));
    let mut skipped = head(0, mode(1280, 720, 100_000));
    skipped.mode_validation = ModeValidationParams {
        overrides: ModeValidationOverrides::NO_LINK_BANDWIDTH_CHECK,
        stereo: false,
    };
    let request = ModesetRequest::commit()
        .with_head(0, 0, skipped)
        .with_head(0, 1, head(1, mode(1280, 720, 100_000)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert_eq!(reply.disps[0].status, Status::FailedExtendedCapabilityCheck);
    assert_eq!(reply.disps[0].heads[1].status, Status::FailedExtendedCapabilityCheck);
    assert_eq!(reply.disps[0].heads[0].status, Status::Success);
    assert_eq!(device.committed().revision, 0);
}

#[test]
fn check_only_reports_without_touching_hardware() {
    let device = device(two_generic_outputs());
    let request = ModesetRequest::check().with_head(0, 0, head(0, fhd()));
    let events = device.subscribe();
    let reply = device.perform_modeset(OWNER, &request).expect("check runs");

    assert!(reply.is_success());
    let head_reply = reply.head(0, 0).expect("head replied");
    assert_eq!(head_reply.hw_heads, HeadMask::single(0));
    assert_eq!(head_reply.display_id, None);
    assert_eq!(device.committed().revision, 0);
    assert!(!device.committed().any_active());

    let log = device.backend().log();
    assert!(!log.touched_hardware());
    assert_eq!(log.capacity_checks.len(), 1);
    assert!(events.try_recv().is_err());
}

#[test]
fn empty_request_is_a_no_op() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    device.backend().clear_log();
    let before = device.committed();

    for request in [ModesetRequest::commit(), ModesetRequest::check()] {
        let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
        assert!(reply.is_success());
        assert!(Arc::ptr_eq(&before, &device.committed()));
    }
    assert!(!device.backend().log().touched_hardware());
}

#[test]
fn failed_transaction_leaves_state_untouched() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    device.backend().clear_log();
    device.backend().set_knobs(|knobs| knobs.rejected_dpys = DpyIdList::single(DpyId::new(1)));
    let before = device.committed();

    let request = ModesetRequest::commit()
        .with_head(0, 0, head(0, mode(1280, 720, 74_250)))
        .with_head(0, 1, head(1, fhd()));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert_eq!(reply.disps[0].heads[1].status, Status::InvalidMode);
    assert_eq!(reply.disps[0].heads[0].status, Status::Success);
    assert_eq!(*before, *device.committed());
    assert!(Arc::ptr_eq(&before, &device.committed()));
    assert!(!device.backend().log().touched_hardware());
}

fn merge_capable_topology() -> DeviceTopology {
    TopologyBuilder::new(3, &[2, 2, 4, 4])
        .merge_pair(0, 1)
        .merge_pair(2, 3)
        .output(0, SignalFormat::Generic)
        .output(1, SignalFormat::Generic)
        .output(2, SignalFormat::Generic)
        .device()
}

fn three_heads_one_merged() -> ModesetRequest {
    ModesetRequest::commit()
        .with_head(0, 0, head(0, mode(5120, 1440, 400_000)))
        .with_head(0, 1, head(1, fhd()))
        .with_head(0, 2, head(2, fhd()))
}

#[test]
fn assignment_is_injective_and_deterministic() {
    let knobs = Knobs {
        merge_above_width: Some(3840),
        ..Knobs::default()
    };
    let run = || {
        let device = device_with(merge_capable_topology(), knobs.clone(), ModesetConfig::default());
        let reply = device
            .perform_modeset(OWNER, &three_heads_one_merged())
            .expect("modeset runs");
        assert!(reply.is_success(), "{reply:?}");
        device.committed()
    };
    let first = run();
    let second = run();

    let masks: Vec<HeadMask> = first.disps[0].api_heads.iter().map(|head| head.hw_heads).collect();
    assert_eq!(masks[0], HeadMask::from_raw(0b0011));
    assert_eq!(masks[1], HeadMask::single(2));
    assert_eq!(masks[2], HeadMask::single(3));
    let mut claimed = HeadMask::empty();
    for mask in &masks {
        assert!(!mask.intersects(&claimed));
        claimed = claimed.union(*mask);
    }
    assert_eq!(first.disps[0].hw_heads[1].merge_role, crate::MergeRole::Secondary);

    let second_masks: Vec<HeadMask> =
        second.disps[0].api_heads.iter().map(|head| head.hw_heads).collect();
    assert_eq!(masks, second_masks);
}

#[test]
fn serializer_stream_binds_matching_physical_head() {
    let topology = TopologyBuilder::new(2, &[1, 1])
        .output_with(0, SignalFormat::LinkSerializer, |_, dpy| dpy.stream_index = Some(1))
        .device();
    let device = device(topology);
    commit_one(&device, 0, 0);
    let committed = device.committed();
    assert_eq!(
        committed.api_head(0, 0).map(|head| head.hw_heads),
        Some(HeadMask::single(1))
    );
}

#[test]
fn commit_needs_ownership_or_permissions() {
    let device = device(two_generic_outputs());
    let guest = OwnerId::new(2);
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));

    let reply = device.perform_modeset(guest, &request).expect("modeset runs");
    assert_eq!(reply.status, Status::NotModesetOwner);

    let mut permissions = ModesetPermissions::none(device.topology());
    permissions.grant(0, 1, DpyIdList::single(DpyId::new(1)));
    device.grant_permissions(guest, permissions);

    let reply = device.perform_modeset(guest, &request).expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidPermissions);

    let allowed = ModesetRequest::commit().with_head(0, 1, head(1, fhd()));
    let reply = device.perform_modeset(guest, &allowed).expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");

    device.revoke_permissions(guest);
    let reply = device.perform_modeset(guest, &allowed).expect("modeset runs");
    assert_eq!(reply.status, Status::NotModesetOwner);

    let check = ModesetRequest::check().with_head(0, 0, head(0, fhd()));
    let reply = device.perform_modeset(guest, &check).expect("check runs");
    assert!(reply.is_success());
}

#[test]
fn granted_client_cannot_shut_down_heads_it_was_not_given() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    let guest = OwnerId::new(2);
    let mut permissions = ModesetPermissions::none(device.topology());
    permissions.grant(0, 1, DpyIdList::single(DpyId::new(1)));
    device.grant_permissions(guest, permissions);
    let before = device.committed();

    let empty_list = ModesetRequest::commit().with_head(0, 0, HeadRequest::default());
    let reply = device.perform_modeset(guest, &empty_list).expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidPermissions);

    let mut missing_entry = ModesetRequest::commit();
    missing_entry.requested_disps = 1;
    missing_entry.disps.push(DispRequest {
        requested_heads: HeadMask::single(0),
        heads: SmallVec::new(),
    });
    let reply = device.perform_modeset(guest, &missing_entry).expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidPermissions);
    assert!(Arc::ptr_eq(&before, &device.committed()));

    let granted = ModesetRequest::commit().with_head(0, 1, head(1, fhd()));
    let reply = device.perform_modeset(guest, &granted).expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");
    let after = device.committed();
    assert!(Arc::ptr_eq(&before.disps[0].api_heads[0], &after.disps[0].api_heads[0]));
}

#[test]
fn malformed_requests_are_rejected_by_shape() {
    let device = device(two_generic_outputs());

    let unknown_disp = ModesetRequest::commit().with_head(1, 0, head(0, fhd()));
    let reply = device.perform_modeset(OWNER, &unknown_disp).expect("modeset runs");
    assert_eq!(reply.status, Status::InvalidRequestShape);

    let unknown_head = ModesetRequest::commit().with_head(0, 3, head(0, fhd()));
    let reply = device.perform_modeset(OWNER, &unknown_head).expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::InvalidRequestShape);

    let unknown_dpy = ModesetRequest::commit().with_head(0, 0, head(9, fhd()));
    let reply = device.perform_modeset(OWNER, &unknown_dpy).expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidDisplay);

    let mut bad_lut = head(0, fhd());
    bad_lut.lut.input = modeset_protocol::LutUpdate::Set(modeset_model::InputLut {
        depth: 8,
        start: 10,
        end: 5,
    });
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, bad_lut))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidLut);
    assert_eq!(device.committed().revision, 0);
}

#[test]
fn connector_restricted_to_other_heads_is_invalid_display() {
    let topology = TopologyBuilder::new(2, &[1, 1])
        .output_with(0, SignalFormat::Generic, |connector, _| {
            connector.valid_heads = HeadMask::single(1);
        })
        .device();
    let device = device(topology);
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, head(0, fhd())))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidDisplay);
}

#[test]
fn duplicate_and_exclusive_outputs_are_rejected() {
    let device = device(two_generic_outputs());
    let duplicate = ModesetRequest::commit()
        .with_head(0, 0, head(0, fhd()))
        .with_head(0, 1, head(0, fhd()));
    let reply = device.perform_modeset(OWNER, &duplicate).expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::DuplicateDisplays);
    assert_eq!(reply.disps[0].heads[1].status, Status::DuplicateDisplays);

    let topology = TopologyBuilder::new(2, &[1, 1])
        .output_with(0, SignalFormat::Generic, |connector, _| {
            connector.exclusive_with = DpyIdList::single(DpyId::new(1));
        })
        .output(1, SignalFormat::Generic)
        .device();
    let device = self::device(topology);
    let both = ModesetRequest::commit()
        .with_head(0, 0, head(0, fhd()))
        .with_head(0, 1, head(1, fhd()));
    let reply = device.perform_modeset(OWNER, &both).expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::IncompatibleDisplays);

    let device = device_with(
        two_generic_outputs(),
        Knobs {
            possible_to_activate: false,
            ..Knobs::default()
        },
        ModesetConfig::default(),
    );
    let reply = device.perform_modeset(OWNER, &both).expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::IncompatibleDisplays);
}

#[test]
fn flips_are_checked_against_the_resolved_mode() {
    let device = device(two_generic_outputs());
    let mut oversized = head(0, fhd());
    oversized.flip = FlipState {
        layers: smallvec![LayerFlip {
            surface: Some(SurfaceDesc {
                size: Size::new(4096, 4096),
                format: SurfaceFormat::X8R8G8B8,
            }),
            tearing: false,
        }],
        ..FlipState::default()
    };
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, oversized))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidFlip);

    let topology = TopologyBuilder::new(1, &[1])
        .output_with(0, SignalFormat::Generic, |connector, _| connector.ycbcr422 = true)
        .device();
    let device = self::device(topology);
    let mut hdr_422 = head(0, fhd());
    hdr_422.color_space = Some(ColorSpace::YCbCr422);
    hdr_422.flip.transfer_function = TransferFunction::Pq;
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, hdr_422))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidFlip);
}

#[test]
fn viewport_scaling_needs_a_tap_configuration() {
    let mut downscale = head(0, fhd());
    downscale.mode.viewport_in = Some(Size::new(3840, 2160));

    let device = device(two_generic_outputs());
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, downscale.clone()))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].heads[0].status, Status::InvalidMode);

    let scaler = ScalerCaps {
        taps: smallvec![TapConfig {
            taps: 5,
            max_downscale_x4: 8,
            max_input_width: 4096,
        }],
    };
    let topology = TopologyBuilder::with_physical_heads(
        1,
        [PhysicalHeadCaps {
            layers: 1,
            scaler,
        }],
    )
    .output(0, SignalFormat::Generic)
    .device();
    let device = self::device(topology);
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, downscale))
        .expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");
}

#[test]
fn capacity_rejection_is_terminal_unless_overridden() {
    let knobs = Knobs {
        capacity_rejection: Some(HeadMask::single(0)),
        ..Knobs::default()
    };
    let device = device_with(two_generic_outputs(), knobs, ModesetConfig::default());
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, head(0, fhd())))
        .expect("modeset runs");
    assert_eq!(reply.disps[0].status, Status::FailedExtendedCapabilityCheck);
    assert_eq!(reply.disps[0].heads[0].status, Status::FailedExtendedCapabilityCheck);

    device.backend().clear_log();
    let mut skipped = head(0, fhd());
    skipped.mode_validation.overrides = ModeValidationOverrides::NO_EXTENDED_CAPABILITY_CHECK;
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 0, skipped))
        .expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");
    assert!(device.backend().log().capacity_checks.is_empty());
}

#[test]
fn finalized_depth_only_lowers_precision() {
    let lower = Knobs {
        finalized_depths: smallvec![(0, PixelDepth::Bpp18Rgb444)],
        ..Knobs::default()
    };
    let device = device_with(two_generic_outputs(), lower, ModesetConfig::default());
    commit_one(&device, 0, 0);
    let committed = device.committed();
    assert_eq!(
        committed.api_head(0, 0).map(|head| head.color.pixel_depth),
        Some(PixelDepth::Bpp18Rgb444)
    );

    let higher = Knobs {
        finalized_depths: smallvec![(0, PixelDepth::Bpp30Rgb444)],
        ..Knobs::default()
    };
    let device = device_with(two_generic_outputs(), higher, ModesetConfig::default());
    commit_one(&device, 0, 0);
    let committed = device.committed();
    assert_eq!(
        committed.api_head(0, 0).map(|head| head.color.pixel_depth),
        Some(PixelDepth::Bpp24Rgb444)
    );
}

#[test]
fn incompatible_head_is_shut_down_in_its_own_update() {
    let knobs = Knobs {
        merge_above_width: Some(3840),
        ..Knobs::default()
    };
    let topology = TopologyBuilder::new(1, &[1, 1, 1, 1])
        .merge_pair(0, 1)
        .merge_pair(2, 3)
        .output(0, SignalFormat::Generic)
        .device();
    let device = device_with(topology, knobs, ModesetConfig::default());
    commit_one(&device, 0, 0);
    device.backend().clear_log();

    let wide = ModesetRequest::commit().with_head(0, 0, head(0, mode(5120, 1440, 400_000)));
    let reply = device.perform_modeset(OWNER, &wide).expect("modeset runs");
    assert!(reply.is_success(), "{reply:?}");

    let log = device.backend().log();
    assert_eq!(log.updates.len(), 2);
    let (_, shutdown) = &log.updates[0];
    assert!(shutdown.commands.contains(&HwCommand::ShutDownHead { hw_head: 0 }));
    assert!(shutdown
        .commands
        .iter()
        .all(|command| !matches!(command, HwCommand::SetTimings { .. })));

    let (_, programming) = &log.updates[1];
    assert!(programming.commands.contains(&HwCommand::SetMerge {
        primary: 0,
        secondary: 1
    }));
    assert!(!programming
        .commands
        .contains(&HwCommand::ShutDownHead { hw_head: 0 }));
}

#[test]
fn compatible_change_reprograms_in_place() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    device.backend().clear_log();

    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 74_250)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success());

    let log = device.backend().log();
    assert_eq!(log.updates.len(), 1);
    assert!(log
        .commands()
        .all(|command| !matches!(command, HwCommand::ShutDownHead { .. })));
    assert!(log.commands().any(|command| matches!(
        command,
        HwCommand::AttachSerializer { serializer: 0, .. }
    )));
}

#[test]
fn sync_objects_are_rearmed_at_the_new_blank_start() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    assert!(device.register_sync_object(0, 0, 3));
    assert!(!device.register_sync_object(0, 1, 3));
    device.backend().clear_log();

    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 74_250)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success());
    let log = device.backend().log();
    assert!(log.commands().any(|command| *command
        == HwCommand::ArmSyncObject {
            hw_head: 0,
            slot: 3,
            raster_line: 720,
        }));
}

#[test]
fn replaced_display_ids_are_retired() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    let first = device.committed().api_head(0, 0).and_then(|head| head.display_id);

    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 74_250)));
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    let second = reply.head(0, 0).and_then(|head| head.display_id);

    assert!(first.is_some() && second.is_some());
    assert_ne!(first, second);
}

#[test]
fn timed_out_update_wedges_the_device() {
    let knobs = Knobs {
        updates_complete: false,
        ..Knobs::default()
    };
    let config = ModesetConfig {
        update_poll_budget: 3,
        ..ModesetConfig::default()
    };
    let device = device_with(two_generic_outputs(), knobs, config);
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));
    let reply = device.perform_modeset(OWNER, &request).expect("flush still succeeds");

    assert!(reply.is_success());
    assert!(reply
        .warnings
        .contains(&ModesetWarning::UpdateTimedOut { disp: 0 }));
    assert!(device.is_wedged());
    assert_eq!(device.committed().revision, 1);
    assert!(matches!(
        device.perform_modeset(OWNER, &request),
        Err(ModesetError::DeviceWedged { disp: 0 })
    ));
}

#[test]
fn busy_channels_abort_before_any_hardware_write() {
    let knobs = Knobs {
        channels_idle: false,
        ..Knobs::default()
    };
    let config = ModesetConfig {
        idle_poll_budget: 3,
        ..ModesetConfig::default()
    };
    let device = device_with(two_generic_outputs(), knobs, config);
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));
    let result = device.perform_modeset(OWNER, &request);

    assert!(matches!(
        result,
        Err(ModesetError::ChannelsNotIdle { disp: 0, budget: 3 })
    ));
    assert_eq!(device.committed().revision, 0);
    assert!(!device.backend().log().touched_hardware());
    assert_eq!(device.backend().scratch_outstanding(), 0);

    device.backend().set_knobs(|knobs| knobs.channels_idle = true);
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");
    assert!(reply.is_success());
}

#[test]
fn missing_scratch_buffer_is_an_error() {
    let knobs = Knobs {
        unavailable_scratch: Some(ScratchKind::ValidationWorkArea),
        ..Knobs::default()
    };
    let device = device_with(two_generic_outputs(), knobs, ModesetConfig::default());
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));
    assert!(matches!(
        device.perform_modeset(OWNER, &request),
        Err(ModesetError::ScratchUnavailable {
            kind: ScratchKind::ValidationWorkArea
        })
    ));
    assert_eq!(device.backend().scratch_outstanding(), 0);
}

#[test]
fn bandwidth_is_pinned_then_settled() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);

    let log = device.backend().log();
    assert_eq!(log.bandwidth.len(), 2);
    assert_eq!(log.bandwidth[0].1.dram_floor_kbps, u32::MAX);
    let steady = BandwidthLedger {
        iso_kbps: 148_500 * 24,
        dram_floor_kbps: 1_000,
    };
    assert_eq!(log.bandwidth[1], (0, steady));
    assert_eq!(device.bandwidth(0), Some(steady));
    assert_eq!(log.low_power, vec![false, false]);

    device.backend().set_knobs(|knobs| knobs.reject_bandwidth = true);
    let reply = device
        .perform_modeset(OWNER, &ModesetRequest::commit().with_head(0, 1, head(1, fhd())))
        .expect("modeset runs");
    assert!(reply.is_success());
    assert!(reply
        .warnings
        .contains(&ModesetWarning::BandwidthPinRejected { disp: 0 }));
    assert!(reply
        .warnings
        .contains(&ModesetWarning::BandwidthReprogramRejected { disp: 0 }));
}

#[test]
fn new_owner_rebuilds_while_inheriting_owner_keeps_heads() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    let kept = device.committed();
    commit_one(&device, 1, 1);
    let after = device.committed();
    assert!(Arc::ptr_eq(&kept.disps[0].api_heads[0], &after.disps[0].api_heads[0]));

    device.release_ownership(OWNER).expect("owner releases");
    let successor = OwnerId::new(5);
    device.grab_ownership(successor).expect("device is free");
    let request = ModesetRequest::commit().with_head(0, 0, head(0, fhd()));
    let reply = device.perform_modeset(successor, &request).expect("modeset runs");
    assert!(reply.is_success());

    let committed = device.committed();
    assert!(committed.api_head(0, 0).is_some_and(|head| head.is_active()));
    assert!(committed.api_head(0, 1).is_some_and(|head| !head.is_active()));
}

#[test]
fn shut_down_heads_only_touches_matching_heads() {
    let device = device(two_generic_outputs());
    commit_one(&device, 0, 0);
    commit_one(&device, 1, 1);
    let before = device.committed();
    let events = device.subscribe();

    let reply = device
        .shut_down_heads(|_, api_head, _| api_head == 1)
        .expect("shutdown runs");
    assert!(reply.is_success());

    let after = device.committed();
    assert!(Arc::ptr_eq(&before.disps[0].api_heads[0], &after.disps[0].api_heads[0]));
    assert!(after.api_head(0, 1).is_some_and(|head| !head.is_active()));
    let event = events.try_recv().expect("disable event");
    assert_eq!((event.api_head, event.change), (1, HeadChange::Disabled));
    assert!(events.try_recv().is_err());

    device.backend().clear_log();
    let reply = device.shut_down_heads(|_, _, _| true).expect("shutdown runs");
    assert!(reply.is_success());
    assert!(!device.committed().any_active());
    assert_eq!(device.backend().log().low_power.last(), Some(&true));

    device.backend().clear_log();
    device.shut_down_heads(|_, _, _| true).expect("nothing to do");
    assert!(!device.backend().log().touched_hardware());
}

#[test]
fn committed_changes_are_published() {
    let device = device(two_generic_outputs());
    let events = device.subscribe();
    commit_one(&device, 0, 0);

    let event = events.try_recv().expect("enable event");
    assert_eq!(event.change, HeadChange::Enabled);
    assert_eq!(event.hw_heads, HeadMask::single(0));
    assert_eq!(event.revision, 1);
    assert!(events.try_recv().is_err());

    let request = ModesetRequest::commit().with_head(0, 0, head(0, mode(1280, 720, 74_250)));
    device.perform_modeset(OWNER, &request).expect("modeset runs");
    let event = events.try_recv().expect("reconfigure event");
    assert_eq!(event.change, HeadChange::Reconfigured);
}

#[test]
fn flip_lock_and_vrr_are_reported() {
    let device = device(two_generic_outputs());
    let mut first = head(0, fhd());
    first.allow_flip_lock = true;
    first.allow_vrr = true;
    let mut second = head(1, fhd());
    second.allow_flip_lock = true;
    let request = ModesetRequest::commit()
        .with_head(0, 0, first)
        .with_head(0, 1, second);
    let reply = device.perform_modeset(OWNER, &request).expect("modeset runs");

    assert!(reply.is_success());
    let (first, second) = (&reply.disps[0].heads[0], &reply.disps[0].heads[1]);
    assert_eq!(first.flip_lock_group, 1);
    assert_eq!(second.flip_lock_group, 1);
    assert!(first.vrr_enabled);
    assert!(!second.vrr_enabled);
}
