use std::collections::HashMap;

use modeset_model::DpyIdList;

use crate::topology::DeviceTopology;

/// Client identity as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// The in-kernel console. Its transactions always rebuild every head.
    pub const CONSOLE: OwnerId = OwnerId(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    #[error("modeset ownership is held by {holder:?}")]
    HeldByOther { holder: OwnerId },
    #[error("{requester:?} does not own the device")]
    NotOwner { requester: OwnerId },
}

/// Outputs a non-owner may drive, by disp and virtual head.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModesetPermissions {
    disps: Vec<Vec<DpyIdList>>,
}

impl ModesetPermissions {
    pub fn none(topology: &DeviceTopology) -> Self {
        Self {
            disps: topology
                .disps
                .iter()
                .map(|disp| vec![DpyIdList::empty(); disp.api_heads()])
                .collect(),
        }
    }

    pub fn full(topology: &DeviceTopology) -> Self {
        Self {
            disps: topology
                .disps
                .iter()
                .map(|disp| vec![disp.valid_dpys(); disp.api_heads()])
                .collect(),
        }
    }

    pub fn grant(&mut self, disp: usize, api_head: usize, dpys: DpyIdList) {
        if let Some(head) = self
            .disps
            .get_mut(disp)
            .and_then(|heads| heads.get_mut(api_head))
        {
            *head = head.union(dpys);
        }
    }

    /// Outputs granted on one virtual head. Empty means the head may not be
    /// touched at all, not even to shut it down.
    pub fn granted(&self, disp: usize, api_head: usize) -> DpyIdList {
        self.disps
            .get(disp)
            .and_then(|heads| heads.get(api_head))
            .copied()
            .unwrap_or_else(DpyIdList::empty)
    }

    pub fn allows(&self, disp: usize, api_head: usize, dpys: DpyIdList) -> bool {
        self.disps
            .get(disp)
            .and_then(|heads| heads.get(api_head))
            .is_some_and(|allowed| dpys.is_subset_of(allowed))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Ownership {
    owner: Option<OwnerId>,
    owner_changed: bool,
    granted: HashMap<OwnerId, ModesetPermissions>,
}

impl Ownership {
    pub(crate) fn grab(&mut self, requester: OwnerId) -> Result<(), OwnershipError> {
        match self.owner {
            Some(holder) if holder != requester => Err(OwnershipError::HeldByOther { holder }),
            Some(_) => Ok(()),
            None => {
                self.owner = Some(requester);
                self.owner_changed = true;
                Ok(())
            }
        }
    }

    pub(crate) fn release(&mut self, requester: OwnerId) -> Result<(), OwnershipError> {
        if self.owner != Some(requester) {
            return Err(OwnershipError::NotOwner { requester });
        }
        self.owner = None;
        self.owner_changed = true;
        self.granted.clear();
        Ok(())
    }

    pub(crate) fn grant(&mut self, grantee: OwnerId, permissions: ModesetPermissions) {
        self.granted.insert(grantee, permissions);
    }

    pub(crate) fn revoke(&mut self, grantee: OwnerId) {
        self.granted.remove(&grantee);
    }

    pub(crate) fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    /// Whether the next transaction must rebuild every head instead of
    /// inheriting the prior owner's configuration.
    /// Clients acting on granted permissions always inherit.
    pub(crate) fn rebuild_required(&self, requester: OwnerId) -> bool {
        requester == OwnerId::CONSOLE || (self.owner_changed && self.owner == Some(requester))
    }

    pub(crate) fn note_committed(&mut self, requester: OwnerId) {
        if requester == OwnerId::CONSOLE {
            self.owner_changed = true;
        } else if self.owner == Some(requester) {
            self.owner_changed = false;
        }
    }

    fn is_privileged(&self, requester: OwnerId) -> bool {
        requester == OwnerId::CONSOLE || self.owner == Some(requester)
    }

    pub(crate) fn may_commit(&self, requester: OwnerId) -> bool {
        self.is_privileged(requester) || self.granted.contains_key(&requester)
    }

    /// Whether `requester` may touch the head at all.
    pub(crate) fn may_touch(&self, requester: OwnerId, disp: usize, api_head: usize) -> bool {
        if self.is_privileged(requester) {
            return true;
        }
        self.granted
            .get(&requester)
            .is_some_and(|permissions| !permissions.granted(disp, api_head).is_empty())
    }

    pub(crate) fn allows(
        &self,
        requester: OwnerId,
        disp: usize,
        api_head: usize,
        dpys: DpyIdList,
    ) -> bool {
        if self.is_privileged(requester) {
            return true;
        }
        self.granted
            .get(&requester)
            .is_some_and(|permissions| permissions.allows(disp, api_head, dpys))
    }
}

#[cfg(test)]
mod tests {
    use modeset_model::DpyId;

    use super::*;
    use crate::topology::{DispTopology, PhysicalHeadCaps};

    fn topology() -> DeviceTopology {
        DeviceTopology::new(vec![DispTopology::new(2, [PhysicalHeadCaps::new(1)])])
    }

    #[test]
    fn grab_marks_owner_changed_until_a_commit() {
        let owner = OwnerId::new(7);
        let mut ownership = Ownership::default();
        ownership.grab(owner).expect("free device");
        assert!(ownership.rebuild_required(owner));

        let guest = OwnerId::new(8);
        assert!(!ownership.rebuild_required(guest));
        ownership.note_committed(guest);
        assert!(ownership.rebuild_required(owner));

        ownership.note_committed(owner);
        assert!(!ownership.rebuild_required(owner));
        assert!(ownership.rebuild_required(OwnerId::CONSOLE));
    }

    #[test]
    fn second_owner_is_refused() {
        let mut ownership = Ownership::default();
        ownership.grab(OwnerId::new(1)).expect("free device");
        assert_eq!(
            ownership.grab(OwnerId::new(2)),
            Err(OwnershipError::HeldByOther {
                holder: OwnerId::new(1)
            })
        );
        assert_eq!(
            ownership.release(OwnerId::new(2)),
            Err(OwnershipError::NotOwner {
                requester: OwnerId::new(2)
            })
        );
    }

    #[test]
    fn granted_permissions_limit_outputs() {
        let topology = topology();
        let guest = OwnerId::new(9);
        let mut permissions = ModesetPermissions::none(&topology);
        permissions.grant(0, 1, DpyIdList::single(DpyId::new(2)));

        let mut ownership = Ownership::default();
        assert!(!ownership.may_commit(guest));
        ownership.grant(guest, permissions);
        assert!(ownership.may_commit(guest));
        assert!(ownership.allows(guest, 0, 1, DpyIdList::single(DpyId::new(2))));
        assert!(!ownership.allows(guest, 0, 0, DpyIdList::single(DpyId::new(2))));
        assert!(!ownership.allows(guest, 0, 1, DpyIdList::single(DpyId::new(3))));
        assert!(ownership.may_touch(guest, 0, 1));
        assert!(!ownership.may_touch(guest, 0, 0));
        assert!(ownership.may_touch(OwnerId::CONSOLE, 0, 0));

        ownership.revoke(guest);
        assert!(!ownership.may_commit(guest));
    }
}
