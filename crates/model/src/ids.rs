use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use bitvec::prelude::{BitArray, Lsb0};
use serde::{Deserialize, Serialize};

pub const MAX_DPYS_PER_DISP: usize = 32;
pub const MAX_HEADS_PER_DISP: usize = 8;

const SLOT_BITS: u32 = 16;
const GEN_BITS: u32 = 16;

const SLOT_SHIFT: u32 = 0;
const GEN_SHIFT: u32 = SLOT_BITS;

const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const GEN_MASK: u32 = (1 << GEN_BITS) - 1;

#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Id<Tag, Repr> {
    raw: Repr,
    _marker: PhantomData<Tag>,
}

impl<Tag, Repr: Copy> Copy for Id<Tag, Repr> {}

impl<Tag, Repr: Copy> Clone for Id<Tag, Repr> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tag, Repr> Id<Tag, Repr> {
    pub const fn new(raw: Repr) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> Repr
    where
        Repr: Copy,
    {
        self.raw
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum GenerationTag {}
pub type GenerationId = Id<GenerationTag, u16>;

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum SlotTag {}
pub type SlotId = Id<SlotTag, u16>;

/// Opaque hardware display-identifier handle handed to a newly active head.
///
/// | generation (16) | slot (16) |
/// 31             16 15        0
///
/// The generation is bumped every time a slot is released, so a stale
/// handle never aliases the slot's next owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(u32);

impl DisplayId {
    pub fn new(generation: GenerationId, slot: SlotId) -> Self {
        let generation = generation.raw() as u32;
        let slot = slot.raw() as u32;
        DisplayId((generation & GEN_MASK) << GEN_SHIFT | (slot & SLOT_MASK) << SLOT_SHIFT)
    }

    pub fn generation(&self) -> GenerationId {
        GenerationId::new(((self.0 >> GEN_SHIFT) & GEN_MASK) as u16)
    }

    pub fn slot(&self) -> SlotId {
        SlotId::new(((self.0 >> SLOT_SHIFT) & SLOT_MASK) as u16)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Index of a display output within its disp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DpyId(u8);

impl DpyId {
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < MAX_DPYS_PER_DISP, "dpy index out of range");
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DpyId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "dpy-{}", self.0)
    }
}

/// Set of display outputs of one disp.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct DpyIdList(BitArray<[u32; 1], Lsb0>);

impl DpyIdList {
    pub fn empty() -> Self {
        Self(BitArray::new([0]))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(BitArray::new([raw]))
    }

    pub fn single(dpy: DpyId) -> Self {
        let mut list = Self::empty();
        list.insert(dpy);
        list
    }

    pub fn raw(&self) -> u32 {
        self.0.into_inner()[0]
    }

    pub fn insert(&mut self, dpy: DpyId) {
        self.0.set(dpy.index(), true);
    }

    pub fn remove(&mut self, dpy: DpyId) {
        self.0.set(dpy.index(), false);
    }

    pub fn contains(&self, dpy: DpyId) -> bool {
        self.0[dpy.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    pub fn len(&self) -> usize {
        self.0.count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = DpyId> + '_ {
        self.0.iter_ones().map(|index| DpyId(index as u8))
    }

    pub fn first(&self) -> Option<DpyId> {
        self.0.first_one().map(|index| DpyId(index as u8))
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_raw(self.raw() | other.raw())
    }

    pub fn intersection(self, other: Self) -> Self {
        Self::from_raw(self.raw() & other.raw())
    }

    pub fn difference(self, other: Self) -> Self {
        Self::from_raw(self.raw() & !other.raw())
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.raw() & other.raw() != 0
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.raw() & !other.raw() == 0
    }
}

impl Default for DpyIdList {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for DpyIdList {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for DpyIdList {}

impl Hash for DpyIdList {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl fmt::Debug for DpyIdList {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_set().entries(self.iter().map(DpyId::index)).finish()
    }
}

impl From<u32> for DpyIdList {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<DpyIdList> for u32 {
    fn from(list: DpyIdList) -> Self {
        list.raw()
    }
}

impl FromIterator<DpyId> for DpyIdList {
    fn from_iter<I: IntoIterator<Item = DpyId>>(iter: I) -> Self {
        let mut list = Self::empty();
        for dpy in iter {
            list.insert(dpy);
        }
        list
    }
}

/// Set of head indices within one disp. Used for both virtual and physical heads.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct HeadMask(BitArray<[u8; 1], Lsb0>);

impl HeadMask {
    pub fn empty() -> Self {
        Self(BitArray::new([0]))
    }

    pub fn from_raw(raw: u8) -> Self {
        Self(BitArray::new([raw]))
    }

    pub fn single(head: usize) -> Self {
        let mut mask = Self::empty();
        mask.insert(head);
        mask
    }

    /// Mask with the low `count` bits set.
    pub fn first_n(count: usize) -> Self {
        (0..count.min(MAX_HEADS_PER_DISP)).collect()
    }

    pub fn raw(&self) -> u8 {
        self.0.into_inner()[0]
    }

    pub fn insert(&mut self, head: usize) {
        self.0.set(head, true);
    }

    pub fn remove(&mut self, head: usize) {
        self.0.set(head, false);
    }

    pub fn contains(&self, head: usize) -> bool {
        head < MAX_HEADS_PER_DISP && self.0[head]
    }

    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    pub fn count(&self) -> usize {
        self.0.count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    pub fn first(&self) -> Option<usize> {
        self.0.first_one()
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_raw(self.raw() | other.raw())
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.raw() & other.raw() != 0
    }
}

impl Default for HeadMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for HeadMask {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for HeadMask {}

impl Hash for HeadMask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl fmt::Debug for HeadMask {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_set().entries(self.iter()).finish()
    }
}

impl From<u8> for HeadMask {
    fn from(raw: u8) -> Self {
        Self::from_raw(raw)
    }
}

impl From<HeadMask> for u8 {
    fn from(mask: HeadMask) -> Self {
        mask.raw()
    }
}

impl FromIterator<usize> for HeadMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for head in iter {
            mask.insert(head);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_id_round_trip() {
        let id = DisplayId::new(GenerationId::new(0x1234), SlotId::new(0xBEEF));
        assert_eq!(id.generation().raw(), 0x1234);
        assert_eq!(id.slot().raw(), 0xBEEF);
    }

    #[test]
    fn dpy_list_set_operations() {
        let a: DpyIdList = [DpyId::new(0), DpyId::new(3)].into_iter().collect();
        let b = DpyIdList::single(DpyId::new(3));

        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
        assert_eq!(a.intersection(b), b);
        assert_eq!(a.difference(b), DpyIdList::single(DpyId::new(0)));
        assert_eq!(a.first(), Some(DpyId::new(0)));
        assert_eq!(a.len(), 2);
        assert_eq!(a.raw(), 0b1001);
    }

    #[test]
    fn head_mask_iterates_in_index_order() {
        let mask = HeadMask::from_raw(0b1010_0100);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![2, 5, 7]);
        assert_eq!(mask.first(), Some(2));
        assert!(!mask.contains(9));
        assert_eq!(HeadMask::first_n(3).raw(), 0b111);
    }

    #[test]
    #[should_panic(expected = "dpy index out of range")]
    fn dpy_id_rejects_out_of_range_index() {
        let _ = DpyId::new(40);
    }
}
