use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use modeset_protocol::{HeadRequest, ModesetReply, ModesetRequest};
use parking_lot::Mutex;

use crate::backend::{DisplayBackend, ScratchKind};
use crate::builder::{self, BuildContext};
use crate::commit::{self, CommitContext};
use crate::config::ModesetConfig;
use crate::display_id::{DisplayIdAllocator, DisplayIdReservation};
use crate::error::ModesetError;
use crate::events::{self, EventHub, ModesetEvent};
use crate::ownership::{ModesetPermissions, OwnerId, Ownership, OwnershipError};
use crate::reply;
use crate::request;
use crate::scratch::ScratchLease;
use crate::solver;
use crate::state::{ApiHeadState, BandwidthLedger, CommittedState, SyncObject};
use crate::topology::DeviceTopology;
use crate::validator::{self, ValidateContext};

/// State only a running transaction may touch.
struct TransactionState {
    display_ids: DisplayIdAllocator,
    bandwidth: Vec<BandwidthLedger>,
    ownership: Ownership,
    wedged: Option<usize>,
}

/// How a transaction was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client(OwnerId),
    /// Issued by the engine itself: no permission checks, ownership inherited.
    Internal,
}

/// One display device: its fixed topology, the committed state, and the
/// transaction lock.
pub struct Device<B: DisplayBackend> {
    topology: DeviceTopology,
    backend: B,
    config: ModesetConfig,
    committed: ArcSwap<CommittedState>,
    transaction: Mutex<TransactionState>,
    events: EventHub,
}

impl<B: DisplayBackend> Device<B> {
    pub fn new(topology: DeviceTopology, backend: B, config: ModesetConfig) -> Self {
        let committed = CommittedState::empty(&topology);
        let transaction = TransactionState {
            display_ids: DisplayIdAllocator::new(config.display_id_slots),
            bandwidth: vec![BandwidthLedger::default(); topology.disps.len()],
            ownership: Ownership::default(),
            wedged: None,
        };
        Self {
            committed: ArcSwap::from_pointee(committed),
            transaction: Mutex::new(transaction),
            events: EventHub::new(config.event_queue_capacity),
            topology,
            backend,
            config,
        }
    }

    /// Latest committed state. Never shows a transaction in flight.
    pub fn committed(&self) -> Arc<CommittedState> {
        self.committed.load_full()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn topology(&self) -> &DeviceTopology {
        &self.topology
    }

    pub fn config(&self) -> &ModesetConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<ModesetEvent> {
        self.events.subscribe()
    }

    pub fn grab_ownership(&self, owner: OwnerId) -> Result<(), OwnershipError> {
        self.transaction.lock().ownership.grab(owner)
    }

    pub fn release_ownership(&self, owner: OwnerId) -> Result<(), OwnershipError> {
        self.transaction.lock().ownership.release(owner)
    }

    pub fn grant_permissions(&self, grantee: OwnerId, permissions: ModesetPermissions) {
        self.transaction.lock().ownership.grant(grantee, permissions);
    }

    pub fn revoke_permissions(&self, grantee: OwnerId) {
        self.transaction.lock().ownership.revoke(grantee);
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.transaction.lock().ownership.owner()
    }

    pub fn is_wedged(&self) -> bool {
        self.transaction.lock().wedged.is_some()
    }

    /// Bandwidth currently programmed for `disp`.
    pub fn bandwidth(&self, disp: usize) -> Option<BandwidthLedger> {
        self.transaction.lock().bandwidth.get(disp).copied()
    }

    /// Records a start-of-frame sync object on an active head. It is armed
    /// the next time the head is programmed and re-armed on every modeset
    /// after that.
    pub fn register_sync_object(&self, disp: usize, api_head: usize, slot: u8) -> bool {
        let _transaction = self.transaction.lock();
        let mut state = CommittedState::clone(&self.committed.load());
        let Some(head) = state
            .disps
            .get_mut(disp)
            .and_then(|disp| disp.api_heads.get_mut(api_head))
        else {
            return false;
        };
        if !head.is_active() || head.sync_objects.iter().any(|sync| sync.slot == slot) {
            return false;
        }
        let head = Arc::make_mut(head);
        head.sync_objects.push(SyncObject {
            slot,
            raster_line: head.timings.v_blank_start,
        });
        self.committed.store(Arc::new(state));
        true
    }

    /// Runs one transaction. Blocks while another transaction holds the
    /// device. A non-success reply means nothing changed.
    #[tracing::instrument(skip(self, request), fields(commit = request.commit))]
    pub fn perform_modeset(
        &self,
        requester: OwnerId,
        request: &ModesetRequest,
    ) -> Result<ModesetReply, ModesetError> {
        let mut transaction = self.transaction.lock();
        if let Some(disp) = transaction.wedged {
            return Err(ModesetError::DeviceWedged { disp });
        }
        self.run(&mut transaction, Origin::Client(requester), request)
    }

    /// Commits an empty configuration to every active head matching
    /// `predicate`. Heads that do not match keep running untouched.
    #[tracing::instrument(skip_all)]
    pub fn shut_down_heads(
        &self,
        predicate: impl Fn(usize, usize, &ApiHeadState) -> bool,
    ) -> Result<ModesetReply, ModesetError> {
        let mut transaction = self.transaction.lock();
        if let Some(disp) = transaction.wedged {
            return Err(ModesetError::DeviceWedged { disp });
        }

        let committed = self.committed.load();
        let mut request = ModesetRequest::commit();
        for (disp, state) in committed.disps.iter().enumerate() {
            for (api_head, head) in state.api_heads.iter().enumerate() {
                if head.is_active() && predicate(disp, api_head, head) {
                    request.set_head(disp, api_head, HeadRequest::default());
                }
            }
        }
        if request.requested_disps == 0 {
            return Ok(reply::initialize(&self.topology));
        }
        tracing::info!(disps = request.requested_disps, "shutting down heads");
        self.run(&mut transaction, Origin::Internal, &request)
    }

    fn run(
        &self,
        transaction: &mut TransactionState,
        origin: Origin,
        request: &ModesetRequest,
    ) -> Result<ModesetReply, ModesetError> {
        let mut reply = reply::initialize(&self.topology);
        let TransactionState {
            display_ids,
            bandwidth,
            ownership,
            wedged,
        } = transaction;

        let rebuild = match origin {
            Origin::Client(requester) => {
                if let Err(rejections) =
                    request::validate(&self.topology, ownership, requester, request)
                {
                    reply::apply_rejections(&mut reply, &rejections);
                    return Ok(reply);
                }
                ownership.rebuild_required(requester)
            }
            Origin::Internal => false,
        };

        let _proposed = ScratchLease::acquire(&self.backend, ScratchKind::ProposedState)?;
        let _validation = ScratchLease::acquire(&self.backend, ScratchKind::ValidationWorkArea)?;

        let committed = self.committed.load_full();
        let mut ids = DisplayIdReservation::new(display_ids);
        let build_ctx = BuildContext {
            topology: &self.topology,
            validator: &self.backend,
            rebuild,
            commit: request.commit,
        };

        let mut candidate = match builder::build(&build_ctx, &committed, request, &mut ids) {
            Ok(candidate) => candidate,
            Err(rejections) => {
                reply::apply_rejections(&mut reply, &rejections);
                return Ok(reply);
            }
        };
        if let Err(rejections) = solver::solve(&self.topology, &mut candidate) {
            reply::apply_rejections(&mut reply, &rejections);
            return Ok(reply);
        }
        let validate_ctx = ValidateContext {
            topology: &self.topology,
            backend: &self.backend,
            config: &self.config,
        };
        if let Err(rejections) = validator::validate(&validate_ctx, &mut candidate) {
            reply::apply_rejections(&mut reply, &rejections);
            return Ok(reply);
        }

        if !request.commit {
            reply::assign_checked(&mut reply, request, &candidate);
            return Ok(reply);
        }

        if !candidate.disps.iter().any(|disp| disp.any_changed()) {
            tracing::debug!("nothing changed, skipping hardware");
            ids.commit(std::iter::empty());
            if let Origin::Client(requester) = origin {
                ownership.note_committed(requester);
            }
            reply::assign_committed(&mut reply, request, &committed);
            return Ok(reply);
        }

        let commit_ctx = CommitContext {
            topology: &self.topology,
            backend: &self.backend,
            config: &self.config,
            committed: &self.committed,
        };
        let outcome = commit::commit(&commit_ctx, &committed, candidate, bandwidth)?;

        if let Some(disp) = outcome.wedged {
            wedged.get_or_insert(disp);
        }
        ids.commit(outcome.retired.iter().copied());
        if let Origin::Client(requester) = origin {
            ownership.note_committed(requester);
        }
        reply.warnings = outcome.warnings;
        reply::assign_committed(&mut reply, request, &outcome.state);

        let events = events::diff(&committed, &outcome.state);
        tracing::debug!(
            revision = outcome.state.revision,
            events = events.len(),
            "modeset committed"
        );
        self.events.publish(&events);
        Ok(reply)
    }
}
