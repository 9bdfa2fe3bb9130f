//! # Generational Slab
//!
//! Index-based storage for regions and contexts. A key is a slot index plus
//! the generation the slot had when the value went in; once the value is
//! removed the slot's generation moves on, so a stale key never resolves to
//! the slot's next occupant.

use alloc::vec::Vec;
use core::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlabKey {
    index: u32,
    generation: u32,
}

impl SlabKey {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

/// The slab could not grow.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlabFull;

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value`, reusing the most recently vacated slot.
    ///
    /// # Errors
    /// [`SlabFull`] if the backing vector cannot grow; `value` is dropped.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&mut self, value: T) -> Result<SlabKey, SlabFull> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let Slot::Vacant {
                generation,
                next_free,
            } = *slot
            else {
                unreachable!("free list points at an occupied slot");
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            self.len += 1;
            return Ok(SlabKey { index, generation });
        }

        if self.slots.len() >= u32::MAX as usize {
            return Err(SlabFull);
        }
        self.slots.try_reserve(1).map_err(|_| SlabFull)?;
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(SlabKey {
            index,
            generation: 0,
        })
    }

    #[must_use]
    pub fn get(&self, key: SlabKey) -> Option<&T> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, key: SlabKey) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Borrow two distinct entries, the first shared and the second mutably.
    #[must_use]
    pub fn get_pair(&mut self, a: SlabKey, b: SlabKey) -> Option<(&T, &mut T)> {
        if a.index == b.index {
            return None;
        }
        let (lo, hi) = if a.index < b.index { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi.index as usize);
        let lo_slot = left.get_mut(lo.index as usize)?;
        let hi_slot = right.first_mut()?;

        let lo_value = match lo_slot {
            Slot::Occupied { generation, value } if *generation == lo.generation => value,
            _ => return None,
        };
        let hi_value = match hi_slot {
            Slot::Occupied { generation, value } if *generation == hi.generation => value,
            _ => return None,
        };

        if a.index < b.index {
            Some((lo_value, hi_value))
        } else {
            Some((hi_value, lo_value))
        }
    }

    #[must_use]
    pub fn contains(&self, key: SlabKey) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: SlabKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: key.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = core::mem::replace(slot, vacant) else {
            unreachable!();
        };
        self.free_head = Some(key.index);
        self.len -= 1;
        Some(value)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (SlabKey, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    SlabKey {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}
