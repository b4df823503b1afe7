use modeset_model::{DisplayId, GenerationId, SlotId};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DisplayIdError {
    #[error("display identifier slots exhausted")]
    Exhausted,
    #[error("display identifier {0:?} names no slot")]
    InvalidSlot(DisplayId),
    #[error("display identifier {0:?} was already released")]
    GenerationMismatch(DisplayId),
}

/// Device-wide display identifier free-list. Only touched under the
/// transaction lock.
#[derive(Debug)]
pub(crate) struct DisplayIdAllocator {
    pool: FreeSlotPool,
    generations: Box<[GenerationId]>,
}

impl DisplayIdAllocator {
    pub(crate) fn new(total_slots: u16) -> Self {
        Self {
            pool: FreeSlotPool::new(total_slots),
            generations: vec![GenerationId::new(0); total_slots as usize].into_boxed_slice(),
        }
    }

    pub(crate) fn alloc(&mut self) -> Result<DisplayId, DisplayIdError> {
        let slot = self.pool.alloc().ok_or(DisplayIdError::Exhausted)?;
        let generation = self.generations[slot.raw() as usize];
        Ok(DisplayId::new(generation, slot))
    }

    pub(crate) fn free(&mut self, id: DisplayId) -> Result<(), DisplayIdError> {
        let slot = id.slot();
        let index = slot.raw() as usize;
        let Some(current_generation) = self.generations.get(index).copied() else {
            return Err(DisplayIdError::InvalidSlot(id));
        };
        if current_generation != id.generation() {
            return Err(DisplayIdError::GenerationMismatch(id));
        }

        let generation = current_generation.raw().wrapping_add(1);
        self.generations[index] = GenerationId::new(generation);
        self.pool.free(slot);
        Ok(())
    }

    pub(crate) fn allocated(&self) -> u16 {
        self.pool.allocated()
    }
}

#[derive(Debug, Default)]
struct FreeSlotPool {
    total_slots: u16,
    next_slot: u16,
    freelist: Vec<SlotId>,
}

impl FreeSlotPool {
    const fn new(total_slots: u16) -> Self {
        Self {
            total_slots,
            next_slot: 0,
            freelist: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<SlotId> {
        if let Some(slot) = self.freelist.pop() {
            return Some(slot);
        }
        if self.next_slot >= self.total_slots {
            return None;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Some(SlotId::new(slot))
    }

    fn free(&mut self, slot: SlotId) {
        self.freelist.push(slot);
    }

    fn allocated(&self) -> u16 {
        self.next_slot - self.freelist.len() as u16
    }
}

/// Identifiers allocated by one transaction. Dropping the reservation
/// without [`commit`](Self::commit) hands every one of them back.
pub(crate) struct DisplayIdReservation<'a> {
    allocator: &'a mut DisplayIdAllocator,
    reserved: SmallVec<[DisplayId; 4]>,
    committed: bool,
}

impl<'a> DisplayIdReservation<'a> {
    pub(crate) fn new(allocator: &'a mut DisplayIdAllocator) -> Self {
        Self {
            allocator,
            reserved: SmallVec::new(),
            committed: false,
        }
    }

    pub(crate) fn alloc(&mut self) -> Result<DisplayId, DisplayIdError> {
        let id = self.allocator.alloc()?;
        self.reserved.push(id);
        Ok(id)
    }

    /// Keeps the reserved identifiers and releases the ones the committed
    /// configuration replaced.
    pub(crate) fn commit(mut self, retired: impl IntoIterator<Item = DisplayId>) {
        self.committed = true;
        for id in retired {
            if let Err(error) = self.allocator.free(id) {
                tracing::error!(%error, "failed to release retired display identifier");
            }
        }
    }
}

impl Drop for DisplayIdReservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for id in self.reserved.drain(..) {
            if let Err(error) = self.allocator.free(id) {
                tracing::error!(%error, "failed to roll back display identifier");
            }
        }
    }
}
