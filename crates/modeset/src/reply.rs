use modeset_protocol::{DispReply, HeadReply, ModesetReply, ModesetRequest, Status};
use smallvec::SmallVec;

use crate::candidate::Candidate;
use crate::state::{ApiHeadState, CommittedState};
use crate::topology::DeviceTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Request,
    Disp(usize),
    Head { disp: usize, api_head: usize },
}

/// A failure recorded by one of the transaction stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub(crate) scope: Scope,
    pub(crate) status: Status,
}

impl Rejection {
    pub(crate) const fn request(status: Status) -> Self {
        Self {
            scope: Scope::Request,
            status,
        }
    }

    pub(crate) const fn disp(disp: usize, status: Status) -> Self {
        Self {
            scope: Scope::Disp(disp),
            status,
        }
    }

    pub(crate) const fn head(disp: usize, api_head: usize, status: Status) -> Self {
        Self {
            scope: Scope::Head { disp, api_head },
            status,
        }
    }
}

pub(crate) type Rejections = SmallVec<[Rejection; 4]>;

/// Reply with every status at success, shaped like the device.
pub(crate) fn initialize(topology: &DeviceTopology) -> ModesetReply {
    ModesetReply {
        status: Status::Success,
        disps: topology
            .disps
            .iter()
            .map(|disp| DispReply {
                status: Status::Success,
                heads: (0..disp.api_heads()).map(|_| HeadReply::default()).collect(),
            })
            .collect(),
        warnings: Vec::new(),
    }
}

/// Records rejections. A slot that already holds a failure keeps the first one.
pub(crate) fn apply_rejections(reply: &mut ModesetReply, rejections: &[Rejection]) {
    for rejection in rejections {
        let slot = match rejection.scope {
            Scope::Request => Some(&mut reply.status),
            Scope::Disp(disp) => reply.disps.get_mut(disp).map(|disp| &mut disp.status),
            Scope::Head { disp, api_head } => reply
                .disps
                .get_mut(disp)
                .and_then(|disp| disp.heads.get_mut(api_head))
                .map(|head| &mut head.status),
        };
        if let Some(slot) = slot
            && slot.is_success()
        {
            *slot = rejection.status;
        }
    }
}

fn fill_head(reply: &mut HeadReply, state: &ApiHeadState, with_display_id: bool) {
    if !state.is_active() {
        *reply = HeadReply {
            status: reply.status,
            ..HeadReply::default()
        };
        return;
    }
    reply.hw_heads = state.hw_heads;
    reply.display_id = if with_display_id {
        state.display_id
    } else {
        None
    };
    reply.possible_usage = state.timings.viewport.possible_usage;
    reply.guaranteed_usage = state.timings.viewport.guaranteed_usage;
    reply.color = Some(state.color);
    reply.vrr_enabled = state.vrr_enabled;
    reply.flip_lock_group = state.flip_lock_group;
}

fn requested_heads(request: &ModesetRequest, disp: usize) -> impl Iterator<Item = usize> + '_ {
    request
        .disp(disp)
        .into_iter()
        .flat_map(|disp| disp.requested_heads.iter())
}

/// Resolved facts of a check transaction. Display identifiers are not
/// reported because the check released them again.
pub(crate) fn assign_checked(
    reply: &mut ModesetReply,
    request: &ModesetRequest,
    candidate: &Candidate,
) {
    for (disp_index, disp) in candidate.disps.iter().enumerate() {
        for api_head in requested_heads(request, disp_index) {
            let (Some(head_reply), Some(proposed)) = (
                reply.disps[disp_index].heads.get_mut(api_head),
                disp.api_heads.get(api_head),
            ) else {
                continue;
            };
            fill_head(head_reply, proposed.state(), false);
        }
    }
}

pub(crate) fn assign_committed(
    reply: &mut ModesetReply,
    request: &ModesetRequest,
    state: &CommittedState,
) {
    for (disp_index, disp) in state.disps.iter().enumerate() {
        for api_head in requested_heads(request, disp_index) {
            let (Some(head_reply), Some(head_state)) = (
                reply.disps[disp_index].heads.get_mut(api_head),
                disp.api_heads.get(api_head),
            ) else {
                continue;
            };
            fill_head(head_reply, head_state, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use modeset_protocol::ModesetReply;

    use super::*;
    use crate::topology::{DispTopology, PhysicalHeadCaps};

    fn reply() -> ModesetReply {
        let topology = DeviceTopology::new(vec![DispTopology::new(
            2,
            [PhysicalHeadCaps::new(1), PhysicalHeadCaps::new(1)],
        )]);
        initialize(&topology)
    }

    #[test]
    fn initialized_reply_is_all_success() {
        let reply = reply();
        assert!(reply.is_success());
        assert_eq!(reply.disps.len(), 1);
        assert_eq!(reply.disps[0].heads.len(), 2);
    }

    #[test]
    fn first_rejection_per_slot_wins() {
        let mut reply = reply();
        apply_rejections(&mut reply, &[
            Rejection::head(0, 1, Status::InvalidMode),
            Rejection::head(0, 1, Status::InvalidFlip),
            Rejection::disp(0, Status::FailedToAssignHardwareHeads),
        ]);
        assert_eq!(reply.disps[0].heads[1].status, Status::InvalidMode);
        assert_eq!(reply.disps[0].heads[0].status, Status::Success);
        assert_eq!(reply.disps[0].status, Status::FailedToAssignHardwareHeads);
        assert_eq!(reply.status, Status::Success);
    }

    #[test]
    fn out_of_range_scopes_are_ignored() {
        let mut reply = reply();
        apply_rejections(&mut reply, &[
            Rejection::disp(5, Status::InvalidRequestShape),
            Rejection::head(0, 7, Status::InvalidDisplay),
        ]);
        assert!(reply.is_success());
    }
}
