use modeset_protocol::{LutUpdate, ModesetRequest, Status};

use crate::ownership::{OwnerId, Ownership};
use crate::reply::{Rejection, Rejections};
use crate::topology::DeviceTopology;

/// Shape, ownership and per-head sanity checks that need no state.
pub(crate) fn validate(
    topology: &DeviceTopology,
    ownership: &Ownership,
    requester: OwnerId,
    request: &ModesetRequest,
) -> Result<(), Rejections> {
    let mut rejections = Rejections::new();

    let disp_count = topology.disps.len();
    if disp_count < u32::BITS as usize && request.requested_disps >> disp_count != 0 {
        tracing::debug!(
            requested_disps = request.requested_disps,
            disp_count,
            "request touches unknown disps"
        );
        rejections.push(Rejection::request(Status::InvalidRequestShape));
        return Err(rejections);
    }

    if request.commit && !ownership.may_commit(requester) {
        tracing::debug!(?requester, "commit from a client without modeset rights");
        rejections.push(Rejection::request(Status::NotModesetOwner));
        return Err(rejections);
    }

    for (disp_index, disp) in topology.disps.iter().enumerate() {
        let Some(disp_request) = request.disp(disp_index) else {
            continue;
        };
        let head_count = disp.api_heads();
        if disp_request.requested_heads.iter().any(|head| head >= head_count) {
            rejections.push(Rejection::disp(disp_index, Status::InvalidRequestShape));
            continue;
        }

        let valid_dpys = disp.valid_dpys();
        for api_head in disp_request.requested_heads.iter() {
            // A missing entry or an empty list shuts the head down, which
            // needs rights on the head as much as driving it does.
            if request.commit && !ownership.may_touch(requester, disp_index, api_head) {
                tracing::debug!(disp = disp_index, api_head, "head not granted to requester");
                rejections.push(Rejection::head(disp_index, api_head, Status::InvalidPermissions));
                continue;
            }
            let Some(head_request) = disp_request.head(api_head) else {
                continue;
            };
            let dpys = head_request.dpy_ids;
            let status = if request.commit
                && !ownership.allows(requester, disp_index, api_head, dpys)
            {
                Status::InvalidPermissions
            } else if !dpys.is_subset_of(&valid_dpys) {
                Status::InvalidDisplay
            } else if matches!(head_request.lut.input, LutUpdate::Set(lut) if !lut.is_valid()) {
                Status::InvalidLut
            } else {
                continue;
            };
            tracing::debug!(disp = disp_index, api_head, ?status, "request rejected");
            rejections.push(Rejection::head(disp_index, api_head, status));
        }
    }

    if rejections.is_empty() {
        Ok(())
    } else {
        Err(rejections)
    }
}
