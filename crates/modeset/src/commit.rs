//! Commit/Kickoff Engine.
//!
//! Drives a validated candidate onto the hardware. Everything before the
//! first hardware write can still abort; everything after it is best effort
//! and ends with the candidate published as the committed state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use modeset_model::{ConnectorKey, DisplayId, DpyIdList, HeadMask};
use modeset_protocol::ModesetWarning;
use smallvec::SmallVec;

use crate::backend::{DisplayBackend, HwCommand, PendingUpdate, ScratchKind};
use crate::candidate::{Candidate, CandidateDisp};
use crate::config::ModesetConfig;
use crate::error::ModesetError;
use crate::scratch::ScratchLease;
use crate::state::{ApiHeadState, BandwidthLedger, CommittedState, DispState};
use crate::topology::{DeviceTopology, DispTopology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Begun,
    ShuttingDownIncompatible,
    Programming,
    Flushed,
    PostFixup,
    Committed,
    AbortUncommitted,
}

impl CommitPhase {
    pub fn can_advance_to(self, next: CommitPhase) -> bool {
        use CommitPhase::*;
        matches!(
            (self, next),
            (Idle, Begun)
                | (Idle | Begun, AbortUncommitted)
                | (Begun, ShuttingDownIncompatible)
                | (ShuttingDownIncompatible, Programming)
                | (Programming, Flushed)
                | (Flushed, PostFixup)
                | (PostFixup, Committed)
        )
    }

    /// Whether the hardware may already hold part of the new configuration.
    pub fn has_written_hardware(self) -> bool {
        matches!(
            self,
            CommitPhase::ShuttingDownIncompatible
                | CommitPhase::Programming
                | CommitPhase::Flushed
                | CommitPhase::PostFixup
                | CommitPhase::Committed
        )
    }
}

pub(crate) struct CommitContext<'a, B: DisplayBackend + ?Sized> {
    pub(crate) topology: &'a DeviceTopology,
    pub(crate) backend: &'a B,
    pub(crate) config: &'a ModesetConfig,
    pub(crate) committed: &'a ArcSwap<CommittedState>,
}

#[derive(Debug)]
pub(crate) struct CommitOutcome {
    pub(crate) state: Arc<CommittedState>,
    /// Display identifiers of the configuration that was replaced.
    pub(crate) retired: SmallVec<[DisplayId; 8]>,
    pub(crate) warnings: Vec<ModesetWarning>,
    pub(crate) wedged: Option<usize>,
}

/// Per-disp bookkeeping carried from `Begun` to `PostFixup`.
struct DispCommit {
    disp: usize,
    dpys: DpyIdList,
    steady: BandwidthLedger,
    update: PendingUpdate,
    shut_down: HeadMask,
}

struct CommitEngine<'a, 'c, B: DisplayBackend + ?Sized> {
    ctx: &'a CommitContext<'c, B>,
    phase: CommitPhase,
    warnings: Vec<ModesetWarning>,
    wedged: Option<usize>,
}

pub(crate) fn commit<B: DisplayBackend + ?Sized>(
    ctx: &CommitContext<'_, B>,
    current: &CommittedState,
    mut candidate: Candidate,
    ledgers: &mut [BandwidthLedger],
) -> Result<CommitOutcome, ModesetError> {
    let mut engine = CommitEngine {
        ctx,
        phase: CommitPhase::Idle,
        warnings: Vec::new(),
        wedged: None,
    };
    let _work_area = ScratchLease::acquire(ctx.backend, ScratchKind::CommitWorkArea)?;

    let changed: SmallVec<[usize; 4]> = candidate
        .disps
        .iter()
        .enumerate()
        .filter(|(_, disp)| disp.any_changed())
        .map(|(index, _)| index)
        .collect();

    for &disp in &changed {
        if let Err(error) = engine.wait_idle(disp) {
            engine.advance(CommitPhase::AbortUncommitted);
            return Err(error);
        }
    }

    engine.advance(CommitPhase::Begun);
    ctx.backend.set_low_power_allowed(false);
    let mut disps: SmallVec<[DispCommit; 4]> = SmallVec::new();
    for &disp in &changed {
        disps.push(engine.begin(disp, &current.disps[disp], &candidate.disps[disp], ledgers));
    }

    engine.advance(CommitPhase::ShuttingDownIncompatible);
    for commit in disps.iter_mut() {
        let disp = commit.disp;
        engine.shut_down_incompatible(
            commit,
            &ctx.topology.disps[disp],
            &current.disps[disp],
            &mut candidate.disps[disp],
        );
    }

    engine.advance(CommitPhase::Programming);
    for commit in disps.iter_mut() {
        let disp = commit.disp;
        engine.program(
            commit,
            &ctx.topology.disps[disp],
            &current.disps[disp],
            &mut candidate.disps[disp],
        );
    }

    for commit in disps.iter_mut() {
        let update = std::mem::take(&mut commit.update);
        engine.flush(commit.disp, update);
    }
    engine.advance(CommitPhase::Flushed);

    let steady: SmallVec<[Option<BandwidthLedger>; 4]> = changed
        .iter()
        .map(|&disp| candidate.disps[disp].post_commit_bandwidth)
        .collect();
    let state = Arc::new(candidate.into_committed(current.revision + 1));
    ctx.committed.store(Arc::clone(&state));
    tracing::debug!(revision = state.revision, "committed state published");

    engine.advance(CommitPhase::PostFixup);
    let mut retired = SmallVec::new();
    for (commit, post_commit) in disps.iter().zip(steady) {
        retired.extend(engine.post_fixup(
            commit,
            &current.disps[commit.disp],
            &state.disps[commit.disp],
            post_commit,
            ledgers,
        ));
    }
    ctx.backend.set_low_power_allowed(!state.any_active());

    engine.advance(CommitPhase::Committed);
    Ok(CommitOutcome {
        state,
        retired,
        warnings: engine.warnings,
        wedged: engine.wedged,
    })
}

/// Polls `done` up to `budget` times.
fn poll_until(budget: u32, config: &ModesetConfig, mut done: impl FnMut() -> bool) -> bool {
    let interval = config.poll_interval();
    for _ in 0..budget {
        if done() {
            return true;
        }
        if interval.is_zero() {
            std::hint::spin_loop();
        } else {
            thread::sleep(interval);
        }
    }
    false
}

fn shut_down_commands(update: &mut PendingUpdate, hw_head: usize, state: &ApiHeadState) {
    for sync in &state.sync_objects {
        update.push(HwCommand::DisarmSyncObject {
            hw_head,
            slot: sync.slot,
        });
    }
    update.push(HwCommand::ShutDownHead { hw_head });
}

fn active_dpys(api_heads: &[Arc<ApiHeadState>]) -> DpyIdList {
    api_heads
        .iter()
        .fold(DpyIdList::empty(), |dpys, head| dpys.union(head.dpy_ids))
}

impl<B: DisplayBackend + ?Sized> CommitEngine<'_, '_, B> {
    fn advance(&mut self, next: CommitPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal commit transition {:?} -> {next:?}",
            self.phase
        );
        tracing::trace!(from = ?self.phase, to = ?next, "commit phase");
        self.phase = next;
    }

    fn wait_idle(&self, disp: usize) -> Result<(), ModesetError> {
        let budget = self.ctx.config.idle_poll_budget;
        if poll_until(budget, self.ctx.config, || self.ctx.backend.channels_idle(disp)) {
            return Ok(());
        }
        tracing::warn!(disp, budget, "satellite channels never idled, commit abandoned");
        Err(ModesetError::ChannelsNotIdle { disp, budget })
    }

    /// Announces the modeset and pins bandwidth to cover both configurations.
    fn begin(
        &mut self,
        disp: usize,
        current: &DispState,
        proposed: &CandidateDisp,
        ledgers: &mut [BandwidthLedger],
    ) -> DispCommit {
        let proposed_dpys = proposed
            .api_heads
            .iter()
            .fold(DpyIdList::empty(), |dpys, head| dpys.union(head.state().dpy_ids));
        let dpys = active_dpys(&current.api_heads).union(proposed_dpys);
        self.ctx.backend.begin_modeset(disp, dpys);

        let steady = ledgers[disp];
        let pinned = BandwidthLedger {
            iso_kbps: proposed
                .post_commit_bandwidth
                .map_or(steady.iso_kbps, |ledger| ledger.iso_kbps.max(steady.iso_kbps)),
            dram_floor_kbps: self.ctx.config.pinned_dram_floor_kbps,
        };
        match self.ctx.backend.program_bandwidth(disp, pinned) {
            Ok(()) => ledgers[disp] = pinned,
            Err(error) => {
                tracing::warn!(disp, %error, "bandwidth pin rejected");
                self.warnings.push(ModesetWarning::BandwidthPinRejected { disp });
            }
        }

        DispCommit {
            disp,
            dpys,
            steady,
            update: PendingUpdate::default(),
            shut_down: HeadMask::empty(),
        }
    }

    fn is_incompatible(
        &self,
        topology: &DispTopology,
        current: &DispState,
        proposed: &CandidateDisp,
        api_head: usize,
    ) -> bool {
        let old = &current.api_heads[api_head];
        let new = proposed.api_heads[api_head].state();
        let Some(key) = old.connector else {
            return true;
        };
        let Some(connector) = topology.connector(key) else {
            return true;
        };
        if connector.signal_format.is_link_managed()
            || old.hw_heads != new.hw_heads
            || old.timings.merge != new.timings.merge
            || old.timings.fixed_rate_link
            || (new.is_active() && new.timings.fixed_rate_link)
        {
            return true;
        }

        let proposed_connectors: SmallVec<[ConnectorKey; 4]> = proposed
            .api_heads
            .iter()
            .filter(|head| head.is_active())
            .filter_map(|head| head.state().connector)
            .collect();
        let proposed_dpys: DpyIdList = proposed_connectors
            .iter()
            .filter_map(|key| topology.connector(*key))
            .map(|connector| connector.dpy_id)
            .collect();
        if connector.exclusive_with.intersects(&proposed_dpys) {
            return true;
        }

        let mut union: SmallVec<[ConnectorKey; 8]> = current.active_connectors().collect();
        union.extend(proposed_connectors.iter().copied());
        union.sort();
        union.dedup();
        union.len() > topology.link_serializers() as usize && !proposed_connectors.contains(&key)
    }

    /// Shuts down, in a batch of its own, every running head that cannot be
    /// reprogrammed in place.
    fn shut_down_incompatible(
        &mut self,
        commit: &mut DispCommit,
        topology: &DispTopology,
        current: &DispState,
        proposed: &mut CandidateDisp,
    ) {
        let mut update = PendingUpdate::default();
        for (api_head, old) in current.api_heads.iter().enumerate() {
            if !old.is_active()
                || !proposed.api_heads[api_head].changed
                || !self.is_incompatible(topology, current, proposed, api_head)
            {
                continue;
            }
            tracing::debug!(disp = commit.disp, api_head, "shutting down incompatible head");
            for hw_head in old.hw_heads.iter() {
                shut_down_commands(&mut update, hw_head, old);
                commit.shut_down.insert(hw_head);
            }

            let Some(key) = old.connector else {
                continue;
            };
            let still_streaming = current.api_heads.iter().enumerate().any(|(other, head)| {
                other != api_head
                    && head.connector == Some(key)
                    && head.is_active()
                    && !proposed.api_heads[other].changed
            });
            if !still_streaming
                && let Some(serializer) = proposed.serializer_bindings.remove(&key)
                && let Some(connector) = topology.connector(key)
            {
                update.push(HwCommand::DetachSerializer {
                    serializer,
                    connector: connector.dpy_id,
                });
            }
        }
        if !update.is_empty() {
            self.flush(commit.disp, update);
        }
    }

    fn program(
        &mut self,
        commit: &mut DispCommit,
        topology: &DispTopology,
        current: &DispState,
        proposed: &mut CandidateDisp,
    ) {
        let update = &mut commit.update;

        // Remaining physical heads that lost their owner.
        for (hw_head, entry) in current.hw_heads.iter().enumerate() {
            let Some(owner) = entry.owner else {
                continue;
            };
            if commit.shut_down.contains(hw_head) || !proposed.api_heads[owner].changed {
                continue;
            }
            if proposed.hw_heads[hw_head].owner != Some(owner) {
                shut_down_commands(update, hw_head, &current.api_heads[owner]);
                commit.shut_down.insert(hw_head);
            }
        }

        let in_use: SmallVec<[ConnectorKey; 4]> = proposed
            .api_heads
            .iter()
            .filter(|head| head.is_active())
            .filter_map(|head| head.state().connector)
            .collect();
        let stale: SmallVec<[ConnectorKey; 4]> = proposed
            .serializer_bindings
            .keys()
            .filter(|key| !in_use.contains(key))
            .copied()
            .collect();
        for key in stale {
            if let Some(serializer) = proposed.serializer_bindings.remove(&key)
                && let Some(connector) = topology.connector(key)
            {
                update.push(HwCommand::DetachSerializer {
                    serializer,
                    connector: connector.dpy_id,
                });
            }
        }

        for api_head in 0..proposed.api_heads.len() {
            let head = &proposed.api_heads[api_head];
            if !head.changed || !head.is_active() {
                continue;
            }
            let serializer = head.state().connector.and_then(|key| {
                let connector = topology.connector(key)?;
                let serializer =
                    bind_serializer(&mut proposed.serializer_bindings, key, topology.link_serializers());
                match serializer {
                    Some(serializer) => update.push(HwCommand::AttachSerializer {
                        serializer,
                        connector: connector.dpy_id,
                        hw_heads: head.state().hw_heads,
                    }),
                    None => tracing::error!(
                        disp = commit.disp,
                        api_head,
                        connector = %connector.name,
                        "no link serializer left to bind"
                    ),
                }
                serializer
            });

            let head = &mut proposed.api_heads[api_head];
            let state = head.state_mut();
            for sync in state.sync_objects.iter_mut() {
                sync.raster_line = state.timings.v_blank_start;
            }
            let state = head.state();
            let dithering = state.dithering.is_enabled_for(state.color.pixel_depth);
            for hw_head in state.hw_heads.iter() {
                update.push(HwCommand::SetTimings {
                    hw_head,
                    timings: state.timings,
                });
                update.push(HwCommand::SetColor {
                    hw_head,
                    color: state.color,
                    dithering,
                });
                update.push(HwCommand::SetViewPort {
                    hw_head,
                    viewport: state.timings.viewport,
                });
                update.push(HwCommand::SetLut {
                    hw_head,
                    lut: state.lut,
                });
                update.push(HwCommand::SetHdrMetadata {
                    hw_head,
                    metadata: state.hdr,
                });
                update.push(HwCommand::Flip {
                    hw_head,
                    flip: head.flip.clone(),
                });
                for sync in &state.sync_objects {
                    update.push(HwCommand::ArmSyncObject {
                        hw_head,
                        slot: sync.slot,
                        raster_line: sync.raster_line,
                    });
                }
            }
            let hw_heads = state.hw_heads;
            let mut pair = hw_heads.iter();
            if let (Some(primary), Some(secondary)) = (pair.next(), pair.next()) {
                update.push(HwCommand::SetMerge { primary, secondary });
            }

            head.flip.dirty = false;
            for hw_head in hw_heads.iter() {
                if let Some(entry) = proposed.hw_heads.get_mut(hw_head) {
                    entry.serializer = serializer;
                }
                if let Some(flip) = proposed.flips.get_mut(hw_head) {
                    flip.dirty = false;
                }
            }
        }
    }

    /// Kicks off `update` and waits for its completion signal. Exhausting
    /// the wait wedges the device; the caller carries on regardless.
    fn flush(&mut self, disp: usize, update: PendingUpdate) {
        if update.is_empty() {
            return;
        }
        let commands = update.commands.len();
        let signal = self.ctx.backend.update(disp, update);
        let budget = self.ctx.config.update_poll_budget;
        if poll_until(budget, self.ctx.config, || {
            self.ctx.backend.poll_update(disp, signal)
        }) {
            tracing::debug!(disp, commands, "hardware update completed");
            return;
        }
        tracing::error!(disp, budget, "hardware update never completed, device wedged");
        self.warnings.push(ModesetWarning::UpdateTimedOut { disp });
        self.wedged.get_or_insert(disp);
    }

    /// Returns the display identifiers the replaced heads held.
    fn post_fixup(
        &mut self,
        commit: &DispCommit,
        before: &DispState,
        after: &DispState,
        post_commit: Option<BandwidthLedger>,
        ledgers: &mut [BandwidthLedger],
    ) -> SmallVec<[DisplayId; 4]> {
        let disp = commit.disp;
        for (hw_head, entry) in after.hw_heads.iter().enumerate() {
            if entry.owner.is_some() {
                self.ctx.backend.enable_head_events(disp, hw_head);
            }
        }

        let steady = post_commit.unwrap_or(commit.steady);
        match self.ctx.backend.program_bandwidth(disp, steady) {
            Ok(()) => ledgers[disp] = steady,
            Err(error) => {
                tracing::error!(disp, %error, "steady-state bandwidth rejected");
                self.warnings
                    .push(ModesetWarning::BandwidthReprogramRejected { disp });
            }
        }

        let retired = before
            .api_heads
            .iter()
            .zip(&after.api_heads)
            .filter(|(old, new)| !Arc::ptr_eq(old, new))
            .filter_map(|(old, _)| old.display_id)
            .collect();

        self.ctx.backend.end_modeset(disp, commit.dpys);
        retired
    }
}

/// Reuses the connector's serializer, else takes the lowest free index.
fn bind_serializer(
    bindings: &mut BTreeMap<ConnectorKey, u8>,
    key: ConnectorKey,
    available: u8,
) -> Option<u8> {
    if let Some(serializer) = bindings.get(&key) {
        return Some(*serializer);
    }
    let serializer = (0..available).find(|index| !bindings.values().any(|bound| bound == index))?;
    bindings.insert(key, serializer);
    Some(serializer)
}
