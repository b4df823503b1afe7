//! Physical-Pipeline Assignment Solver.
//!
//! [`assign_hw_heads`] is a pure function over per-head requirements. The
//! engine calls it with [`Preference::Stable`] first and falls back to
//! [`Preference::Fresh`] once.

use modeset_model::{HeadMask, SignalFormat};
use modeset_protocol::Status;
use smallvec::SmallVec;

use crate::candidate::{Candidate, CandidateDisp};
use crate::reply::{Rejection, Rejections};
use crate::topology::{DeviceTopology, DispTopology};

/// Where a virtual head may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Physical head 0 only.
    FixedPanel,
    /// The physical head wired to this serializer stream.
    SerializerStream(u8),
    Generic,
}

impl Placement {
    pub fn for_connector(signal_format: SignalFormat, stream_index: Option<u8>) -> Self {
        match (signal_format, stream_index) {
            (SignalFormat::FixedPanel, _) => Placement::FixedPanel,
            (SignalFormat::LinkSerializer, Some(stream)) => Placement::SerializerStream(stream),
            _ => Placement::Generic,
        }
    }

    const fn class_order(self, hw_heads: usize) -> u8 {
        match self {
            Placement::FixedPanel => 0,
            Placement::SerializerStream(_) => 1,
            Placement::Generic if hw_heads > 1 => 2,
            Placement::Generic => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadRequirement {
    pub api_head: usize,
    pub active: bool,
    pub changed: bool,
    /// 1, or 2 for a dual-pipeline merge.
    pub hw_heads: usize,
    pub layers: usize,
    pub placement: Placement,
    /// Assignment the head holds now, used as a hint.
    pub current: HeadMask,
}

/// Physical head resources of one disp.
#[derive(Debug, Clone, Copy)]
pub struct HeadLayout<'a> {
    pub layers: &'a [u8],
    pub merge_pairs: &'a [(usize, usize)],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    /// Keep every still-valid current assignment.
    Stable,
    /// Only unchanged heads keep their assignment.
    Fresh,
}

/// Assignment per virtual head, indexed like the requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub masks: SmallVec<[HeadMask; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no physical heads left for virtual heads {unassigned:?}")]
pub struct AssignConflict {
    pub unassigned: HeadMask,
}

pub fn assign_hw_heads(
    requirements: &[HeadRequirement],
    layout: HeadLayout<'_>,
    preference: Preference,
) -> Result<Assignment, AssignConflict> {
    let mut masks: SmallVec<[HeadMask; 4]> =
        requirements.iter().map(|_| HeadMask::empty()).collect();
    let mut claimed = HeadMask::empty();

    let mut order: SmallVec<[usize; 8]> = (0..requirements.len())
        .filter(|index| requirements[*index].active)
        .collect();
    order.sort_by_key(|index| {
        let requirement = &requirements[*index];
        (
            requirement.changed,
            requirement.placement.class_order(requirement.hw_heads),
            requirement.api_head,
        )
    });

    // Running heads first, then hints of changed heads in class order.
    for &index in &order {
        let requirement = &requirements[index];
        let keep = match preference {
            Preference::Stable => true,
            Preference::Fresh => !requirement.changed,
        };
        if keep && hint_fits(requirement, layout, claimed) {
            masks[index] = requirement.current;
            claimed = claimed.union(requirement.current);
        }
    }

    order.sort_by_key(|index| {
        let requirement = &requirements[*index];
        (
            requirement.placement.class_order(requirement.hw_heads),
            requirement.api_head,
        )
    });

    let mut unassigned = HeadMask::empty();
    for &index in &order {
        if !masks[index].is_empty() {
            continue;
        }
        let requirement = &requirements[index];
        match pick(requirement, layout, claimed) {
            Some(mask) => {
                masks[index] = mask;
                claimed = claimed.union(mask);
            }
            None => unassigned.insert(requirement.api_head),
        }
    }

    if !unassigned.is_empty() {
        return Err(AssignConflict { unassigned });
    }
    let assignment = Assignment { masks };
    check_assignment(requirements, &assignment)?;
    Ok(assignment)
}

fn placement_allows(requirement: &HeadRequirement, mask: HeadMask) -> bool {
    match requirement.placement {
        Placement::FixedPanel => mask == HeadMask::single(0),
        Placement::SerializerStream(stream) => mask == HeadMask::single(stream as usize),
        Placement::Generic => true,
    }
}

fn hint_fits(requirement: &HeadRequirement, layout: HeadLayout<'_>, claimed: HeadMask) -> bool {
    let hint = requirement.current;
    if hint.is_empty() || hint.count() != requirement.hw_heads || hint.intersects(&claimed) {
        return false;
    }
    if hint.iter().any(|hw_head| hw_head >= layout.layers.len()) {
        return false;
    }
    if !placement_allows(requirement, hint) {
        return false;
    }
    if requirement.hw_heads > 1 {
        let mut heads = hint.iter();
        let pair = (heads.next(), heads.next());
        let is_valid_pair = layout
            .merge_pairs
            .iter()
            .any(|&(primary, secondary)| pair == (Some(primary), Some(secondary)));
        if !is_valid_pair {
            return false;
        }
    }
    !requirement.changed
        || hint
            .iter()
            .all(|hw_head| layout.layers[hw_head] as usize >= requirement.layers)
}

fn is_free(layout: HeadLayout<'_>, claimed: HeadMask, hw_head: usize) -> bool {
    hw_head < layout.layers.len() && !claimed.contains(hw_head)
}

fn pick(
    requirement: &HeadRequirement,
    layout: HeadLayout<'_>,
    claimed: HeadMask,
) -> Option<HeadMask> {
    let fits = |hw_head: usize| {
        is_free(layout, claimed, hw_head) && layout.layers[hw_head] as usize >= requirement.layers
    };
    match (requirement.placement, requirement.hw_heads) {
        (Placement::FixedPanel, 1) => fits(0).then(|| HeadMask::single(0)),
        (Placement::SerializerStream(stream), 1) => {
            let stream = stream as usize;
            fits(stream).then(|| HeadMask::single(stream))
        }
        (Placement::Generic, 1) => (0..layout.layers.len())
            .filter(|&hw_head| fits(hw_head))
            .min_by_key(|&hw_head| (layout.layers[hw_head], hw_head))
            .map(HeadMask::single),
        (Placement::Generic, 2) => layout
            .merge_pairs
            .iter()
            .copied()
            .filter(|&(primary, secondary)| fits(primary) && fits(secondary))
            .min_by_key(|&(primary, secondary)| {
                (
                    layout.layers[primary] as u16 + layout.layers[secondary] as u16,
                    primary,
                )
            })
            .map(|(primary, secondary)| [primary, secondary].into_iter().collect()),
        _ => None,
    }
}

/// No physical head claimed twice, every active head fully assigned.
pub fn check_assignment(
    requirements: &[HeadRequirement],
    assignment: &Assignment,
) -> Result<(), AssignConflict> {
    let mut claimed = HeadMask::empty();
    let mut unassigned = HeadMask::empty();
    for (requirement, mask) in requirements.iter().zip(&assignment.masks) {
        if !requirement.active {
            continue;
        }
        if mask.count() != requirement.hw_heads || mask.intersects(&claimed) {
            unassigned.insert(requirement.api_head);
        }
        claimed = claimed.union(*mask);
    }
    if unassigned.is_empty() {
        Ok(())
    } else {
        Err(AssignConflict { unassigned })
    }
}

fn requirements(disp: &DispTopology, candidate: &CandidateDisp) -> SmallVec<[HeadRequirement; 4]> {
    candidate
        .api_heads
        .iter()
        .enumerate()
        .map(|(api_head, proposed)| {
            let state = proposed.state();
            let placement = state
                .connector
                .and_then(|key| disp.connector(key))
                .map_or(Placement::Generic, |connector| {
                    Placement::for_connector(connector.signal_format, state.stream_index)
                });
            HeadRequirement {
                api_head,
                active: state.is_active(),
                changed: proposed.changed,
                hw_heads: state.timings.required_hw_heads(),
                layers: proposed.layer_requirement(),
                placement,
                current: state.hw_heads,
            }
        })
        .collect()
}

/// Runs both passes over every disp with a changed head and writes the
/// result into the candidate.
pub(crate) fn solve(topology: &DeviceTopology, candidate: &mut Candidate) -> Result<(), Rejections> {
    let mut rejections = Rejections::new();
    for (disp_index, (disp, proposed)) in topology
        .disps
        .iter()
        .zip(candidate.disps.iter_mut())
        .enumerate()
    {
        if !proposed.any_changed() {
            continue;
        }
        let layers: SmallVec<[u8; 8]> = disp.physical_heads().iter().map(|caps| caps.layers).collect();
        let layout = HeadLayout {
            layers: &layers,
            merge_pairs: disp.merge_pairs(),
        };
        let requirements = requirements(disp, proposed);

        let assignment = match assign_hw_heads(&requirements, layout, Preference::Stable) {
            Ok(assignment) => assignment,
            Err(conflict) => {
                tracing::debug!(disp = disp_index, %conflict, "stable assignment failed, retrying fresh");
                match assign_hw_heads(&requirements, layout, Preference::Fresh) {
                    Ok(assignment) => assignment,
                    Err(conflict) => {
                        tracing::debug!(disp = disp_index, %conflict, "fresh assignment failed");
                        rejections.push(Rejection::disp(
                            disp_index,
                            Status::FailedToAssignHardwareHeads,
                        ));
                        rejections.extend(conflict.unassigned.iter().map(|api_head| {
                            Rejection::head(disp_index, api_head, Status::FailedToAssignHardwareHeads)
                        }));
                        continue;
                    }
                }
            }
        };

        for (head, mask) in proposed.api_heads.iter_mut().zip(assignment.masks) {
            if head.changed && head.state().hw_heads != mask {
                head.state_mut().hw_heads = mask;
            }
        }
    }

    if rejections.is_empty() {
        Ok(())
    } else {
        Err(rejections)
    }
}
