//! Capacity/Bandwidth Validator.
//!
//! Runs over an assigned candidate, disp by disp, and stops at the first
//! disp that fails. The only mutation it makes is lowering pixel depth.

use std::collections::{BTreeMap, BTreeSet};

use modeset_model::{
    ColorSpace, ConnectorKey, DpyIdList, HeadMask, ModeValidationOverrides, PixelDepth,
};
use modeset_protocol::Status;
use smallvec::SmallVec;

use crate::backend::{CapacityHead, CapacityOracle, ResourceManager};
use crate::candidate::{Candidate, CandidateDisp, ProposedApiHead};
use crate::config::ModesetConfig;
use crate::reply::{Rejection, Rejections};
use crate::state::BandwidthLedger;
use crate::topology::{DeviceTopology, DispTopology};

pub(crate) struct ValidateContext<'a, B: ResourceManager + CapacityOracle + ?Sized> {
    pub(crate) topology: &'a DeviceTopology,
    pub(crate) backend: &'a B,
    pub(crate) config: &'a ModesetConfig,
}

pub(crate) fn validate<B: ResourceManager + CapacityOracle + ?Sized>(
    ctx: &ValidateContext<'_, B>,
    candidate: &mut Candidate,
) -> Result<(), Rejections> {
    for (disp_index, (topology, disp)) in ctx
        .topology
        .disps
        .iter()
        .zip(candidate.disps.iter_mut())
        .enumerate()
    {
        if !disp.any_changed() {
            continue;
        }
        let check = DispCheck {
            ctx,
            disp_index,
            topology,
        };
        check.compatibility(disp)?;
        check.flips(disp)?;
        check.scaling(disp)?;
        check.link_bandwidth(disp)?;
        check.capacity(disp)?;
        check.link_bandwidth(disp)?;
        disp.sync_hw_heads();
    }
    Ok(())
}

fn failure(rejection: Rejection) -> Rejections {
    let mut rejections = Rejections::new();
    rejections.push(rejection);
    rejections
}

struct DispCheck<'a, 'c, B: ResourceManager + CapacityOracle + ?Sized> {
    ctx: &'a ValidateContext<'c, B>,
    disp_index: usize,
    topology: &'a DispTopology,
}

impl<B: ResourceManager + CapacityOracle + ?Sized> DispCheck<'_, '_, B> {
    fn reject_disp(&self, status: Status, heads: impl IntoIterator<Item = usize>) -> Rejections {
        let mut rejections = failure(Rejection::disp(self.disp_index, status));
        rejections.extend(
            heads
                .into_iter()
                .map(|api_head| Rejection::head(self.disp_index, api_head, status)),
        );
        rejections
    }

    fn compatibility(&self, disp: &CandidateDisp) -> Result<(), Rejections> {
        let mut claimed = DpyIdList::empty();
        let mut connectors = BTreeSet::new();
        for (api_head, proposed) in disp.api_heads.iter().enumerate() {
            let state = proposed.state();
            if !state.is_active() {
                continue;
            }
            if state.dpy_ids.intersects(&claimed) {
                tracing::debug!(disp = self.disp_index, api_head, "output claimed by two heads");
                return Err(self.reject_disp(Status::DuplicateDisplays, [api_head]));
            }
            claimed = claimed.union(state.dpy_ids);
            connectors.extend(state.connector);
        }

        let connector_dpys: DpyIdList = connectors
            .iter()
            .filter_map(|key| self.topology.connector(*key))
            .map(|connector| connector.dpy_id)
            .collect();
        let exclusive = connectors
            .iter()
            .filter_map(|key| self.topology.connector(*key))
            .any(|connector| connector.exclusive_with.intersects(&connector_dpys));
        let too_many = connectors.len() > self.topology.link_serializers() as usize;

        if exclusive
            || too_many
            || !self
                .ctx
                .backend
                .is_possible_to_activate(self.disp_index, connector_dpys)
        {
            tracing::debug!(
                disp = self.disp_index,
                exclusive,
                too_many,
                "outputs cannot be driven together"
            );
            return Err(failure(Rejection::disp(
                self.disp_index,
                Status::IncompatibleDisplays,
            )));
        }
        Ok(())
    }

    fn flips(&self, disp: &CandidateDisp) -> Result<(), Rejections> {
        let physical = self.topology.physical_heads();
        let mut rejections = Rejections::new();
        for (api_head, proposed) in disp.api_heads.iter().enumerate() {
            let state = proposed.state();
            if !proposed.changed || !state.is_active() {
                continue;
            }
            let available = state
                .hw_heads
                .iter()
                .filter_map(|hw_head| physical.get(hw_head))
                .map(|caps| caps.layers as usize)
                .min()
                .unwrap_or(0);
            let valid = proposed.flip.layer_count() <= available
                && proposed
                    .flip
                    .check_against_viewport(state.timings.viewport.input)
                    .is_ok()
                && !(proposed.flip.transfer_function.is_hdr()
                    && state.color.space == ColorSpace::YCbCr422);
            if !valid {
                tracing::debug!(disp = self.disp_index, api_head, "flip invalid for assignment");
                rejections.push(Rejection::head(self.disp_index, api_head, Status::InvalidFlip));
            }
        }
        if rejections.is_empty() {
            Ok(())
        } else {
            Err(rejections)
        }
    }

    fn scaling(&self, disp: &CandidateDisp) -> Result<(), Rejections> {
        let physical = self.topology.physical_heads();
        let mut rejections = Rejections::new();
        for (api_head, proposed) in disp.api_heads.iter().enumerate() {
            let state = proposed.state();
            if !proposed.changed || !state.is_active() {
                continue;
            }
            let timings = &state.timings;
            let viewport = timings.viewport;
            let fits_raster = viewport.output.width <= timings.h_visible
                && viewport.output.height <= timings.v_visible;
            let scalable = state.hw_heads.iter().all(|hw_head| {
                physical
                    .get(hw_head)
                    .is_some_and(|caps| caps.scaler.supports(viewport.input, viewport.output))
            });
            if !fits_raster || !scalable {
                tracing::debug!(
                    disp = self.disp_index,
                    api_head,
                    ?viewport,
                    "no scaler configuration for viewport"
                );
                rejections.push(Rejection::head(self.disp_index, api_head, Status::InvalidMode));
            }
        }
        if rejections.is_empty() {
            Ok(())
        } else {
            Err(rejections)
        }
    }

    /// Sums link bandwidth per connector and walks changed, unpinned heads
    /// down the depth ladder until the link fits or the retry bound is hit.
    /// Heads carrying `NO_LINK_BANDWIDTH_CHECK` are left out of both.
    fn link_bandwidth(&self, disp: &mut CandidateDisp) -> Result<(), Rejections> {
        let mut links: BTreeMap<ConnectorKey, SmallVec<[usize; 4]>> = BTreeMap::new();
        for (api_head, proposed) in disp.api_heads.iter().enumerate() {
            let state = proposed.state();
            if let Some(connector) = state.connector
                && proposed.is_active()
                && !state
                    .mode_validation
                    .overrides
                    .contains(ModeValidationOverrides::NO_LINK_BANDWIDTH_CHECK)
            {
                links.entry(connector).or_default().push(api_head);
            }
        }

        for (key, heads) in links {
            let Some(connector) = self.topology.connector(key) else {
                continue;
            };
            let Some(link) = connector.link else {
                continue;
            };
            let mut retries = 0;
            loop {
                let required: u64 = heads
                    .iter()
                    .map(|&api_head| {
                        let state = disp.api_heads[api_head].state();
                        state.timings.link_bandwidth_kbps(state.color.space)
                    })
                    .sum();
                if required <= link.capacity_kbps {
                    break;
                }
                if retries >= self.ctx.config.link_downgrade_retries
                    || !downgrade_link(disp, &heads)
                {
                    tracing::debug!(
                        disp = self.disp_index,
                        connector = %connector.name,
                        required,
                        capacity = link.capacity_kbps,
                        "link bandwidth exceeded"
                    );
                    return Err(self.reject_disp(
                        Status::FailedExtendedCapabilityCheck,
                        heads.iter().copied(),
                    ));
                }
                retries += 1;
                tracing::info!(
                    disp = self.disp_index,
                    connector = %connector.name,
                    required,
                    capacity = link.capacity_kbps,
                    retries,
                    "lowered pixel depth to fit link"
                );
            }
        }
        Ok(())
    }

    fn capacity(&self, disp: &mut CandidateDisp) -> Result<(), Rejections> {
        let active: SmallVec<[usize; 4]> = disp
            .api_heads
            .iter()
            .enumerate()
            .filter(|(_, head)| head.is_active())
            .map(|(api_head, _)| api_head)
            .collect();
        if active.is_empty() {
            disp.post_commit_bandwidth = Some(BandwidthLedger::default());
            return Ok(());
        }

        let has_override = |api_head: usize, flag| {
            disp.api_heads[api_head]
                .state()
                .mode_validation
                .overrides
                .contains(flag)
        };
        if active
            .iter()
            .all(|&api_head| has_override(api_head, ModeValidationOverrides::NO_EXTENDED_CAPABILITY_CHECK))
        {
            tracing::debug!(disp = self.disp_index, "capacity check skipped by override");
            disp.post_commit_bandwidth = None;
            return Ok(());
        }
        let require_boot_clocks = active
            .iter()
            .any(|&api_head| has_override(api_head, ModeValidationOverrides::REQUIRE_BOOT_CLOCKS));

        let mut heads: SmallVec<[CapacityHead; 4]> = SmallVec::new();
        for &api_head in &active {
            let proposed = &disp.api_heads[api_head];
            let state = proposed.state();
            let merged = state.hw_heads.count() > 1;
            heads.extend(state.hw_heads.iter().map(|hw_head| CapacityHead {
                hw_head,
                api_head,
                timings: state.timings,
                color: state.color,
                layers: proposed.layer_requirement(),
                merged,
            }));
        }

        let verdict = self
            .ctx
            .backend
            .check_capacity(self.disp_index, &heads, require_boot_clocks)
            .map_err(|rejection| {
                tracing::debug!(disp = self.disp_index, %rejection, "capacity check failed");
                let owners: HeadMask = heads
                    .iter()
                    .filter(|head| rejection.hw_heads.contains(head.hw_head))
                    .map(|head| head.api_head)
                    .collect();
                self.reject_disp(Status::FailedExtendedCapabilityCheck, owners.iter())
            })?;

        for (hw_head, depth) in verdict.finalized_depths {
            let Some(owner) = heads.iter().find(|head| head.hw_head == hw_head) else {
                continue;
            };
            let proposed = &mut disp.api_heads[owner.api_head];
            if !proposed.changed || proposed.pins.bpc {
                continue;
            }
            if is_below(proposed.state().color.pixel_depth, depth) {
                set_depth(proposed, depth);
            }
        }
        disp.post_commit_bandwidth = Some(verdict.ledger);
        Ok(())
    }
}

/// One ladder step for every changed, unpinned head of a link. Returns
/// `false` when none of them can go lower.
fn downgrade_link(disp: &mut CandidateDisp, heads: &[usize]) -> bool {
    let mut lowered = false;
    for &api_head in heads {
        let proposed = &mut disp.api_heads[api_head];
        if !proposed.changed || proposed.pins.bpc {
            continue;
        }
        if let Some(next) = proposed.state().color.pixel_depth.downgraded() {
            set_depth(proposed, next);
            lowered = true;
        }
    }
    lowered
}

fn set_depth(proposed: &mut ProposedApiHead, depth: PixelDepth) {
    let state = proposed.state_mut();
    state.color.pixel_depth = depth;
    state.timings.pixel_depth = depth;
}

/// Whether `depth` is reachable from `current` by walking down the ladder.
fn is_below(current: PixelDepth, depth: PixelDepth) -> bool {
    let mut step = current.downgraded();
    while let Some(lower) = step {
        if lower == depth {
            return true;
        }
        step = lower.downgraded();
    }
    false
}
