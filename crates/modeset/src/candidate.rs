use std::collections::BTreeMap;
use std::sync::Arc;

use modeset_model::{ColorPins, ConnectorKey, FlipState, HeadMask};

use crate::state::{
    ApiHeadState, BandwidthLedger, CommittedState, DispState, HwHeadState, MergeRole,
};

#[derive(Debug, Clone)]
pub(crate) struct ProposedApiHead {
    /// Shared with the committed state until first written.
    pub(crate) state: Arc<ApiHeadState>,
    pub(crate) changed: bool,
    pub(crate) pins: ColorPins,
    /// Scanout state for every physical head this head ends up on.
    pub(crate) flip: FlipState,
}

impl ProposedApiHead {
    pub(crate) fn state(&self) -> &ApiHeadState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ApiHeadState {
        Arc::make_mut(&mut self.state)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Layers the flip needs from each physical head; at least one.
    pub(crate) fn layer_requirement(&self) -> usize {
        self.flip.layer_count().max(1)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CandidateDisp {
    pub(crate) api_heads: Vec<ProposedApiHead>,
    pub(crate) hw_heads: Vec<HwHeadState>,
    pub(crate) flips: Vec<FlipState>,
    pub(crate) serializer_bindings: BTreeMap<ConnectorKey, u8>,
    /// Filled by the capacity check.
    pub(crate) post_commit_bandwidth: Option<BandwidthLedger>,
}

impl CandidateDisp {
    fn from_committed(disp: &DispState) -> Self {
        let api_heads = disp
            .api_heads
            .iter()
            .map(|state| ProposedApiHead {
                flip: state
                    .hw_heads
                    .first()
                    .and_then(|hw_head| disp.flips.get(hw_head))
                    .cloned()
                    .unwrap_or_default(),
                state: Arc::clone(state),
                changed: false,
                pins: ColorPins::default(),
            })
            .collect();
        Self {
            api_heads,
            hw_heads: disp.hw_heads.clone(),
            flips: disp.flips.clone(),
            serializer_bindings: disp.serializer_bindings.clone(),
            post_commit_bandwidth: None,
        }
    }

    pub(crate) fn any_changed(&self) -> bool {
        self.api_heads.iter().any(|head| head.changed)
    }

    /// Re-derives the physical head entries touched by changed virtual heads.
    /// Entries of unchanged heads are left as they are.
    pub(crate) fn sync_hw_heads(&mut self) {
        let changed: HeadMask = self
            .api_heads
            .iter()
            .enumerate()
            .filter(|(_, head)| head.changed)
            .map(|(index, _)| index)
            .collect();

        for (hw_head, entry) in self.hw_heads.iter_mut().enumerate() {
            if entry.owner.is_some_and(|owner| changed.contains(owner)) {
                *entry = HwHeadState::default();
                self.flips[hw_head] = FlipState::default();
            }
        }

        for api_head in changed.iter() {
            let proposed = &self.api_heads[api_head];
            let state = proposed.state();
            if !state.is_active() {
                continue;
            }
            let merged = state.hw_heads.count() > 1;
            for (position, hw_head) in state.hw_heads.iter().enumerate() {
                let Some(entry) = self.hw_heads.get_mut(hw_head) else {
                    continue;
                };
                *entry = HwHeadState {
                    owner: Some(api_head),
                    merge_role: match (merged, position) {
                        (false, _) => MergeRole::Single,
                        (true, 0) => MergeRole::Primary,
                        (true, _) => MergeRole::Secondary,
                    },
                    connector: state.connector,
                    timings: state.timings,
                    serializer: None,
                };
                self.flips[hw_head] = proposed.flip.clone();
            }
        }
    }

    fn into_committed(self) -> DispState {
        DispState {
            api_heads: self.api_heads.into_iter().map(|head| head.state).collect(),
            hw_heads: self.hw_heads,
            flips: self.flips,
            serializer_bindings: self.serializer_bindings,
        }
    }
}

/// Proposed configuration of a whole device for one transaction.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) disps: Vec<CandidateDisp>,
}

impl Candidate {
    pub(crate) fn from_committed(state: &CommittedState) -> Self {
        Self {
            disps: state.disps.iter().map(CandidateDisp::from_committed).collect(),
        }
    }

    pub(crate) fn into_committed(self, revision: u64) -> CommittedState {
        CommittedState {
            revision,
            disps: self
                .disps
                .into_iter()
                .map(CandidateDisp::into_committed)
                .collect(),
        }
    }
}
