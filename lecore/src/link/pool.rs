//! Fixed-capacity arena with an in-use bitmap.
//!
//! Tasks and connections live in slots indexed by small integers instead of being linked through
//! pointers. A slot index stays valid until the slot is freed.

/// An arena of up to `N` (at most 32) values of type `T`.
pub struct Pool<T, const N: usize> {
    slots: [Option<T>; N],
    in_use: u32,
}

impl<T, const N: usize> Pool<T, N> {
    pub fn new() -> Self {
        assert!(N <= 32, "pool capacity exceeds bitmap");
        Self {
            slots: [(); N].map(|_| None),
            in_use: 0,
        }
    }

    /// Stores `value` in the first free slot at or after `from`, returning its index.
    ///
    /// Returns the value back if no slot in `from..N` is free.
    pub fn alloc_from(&mut self, from: usize, value: T) -> Result<usize, T> {
        match (from..N).find(|&i| self.in_use & (1 << i) == 0) {
            Some(index) => {
                self.in_use |= 1 << index;
                self.slots[index] = Some(value);
                Ok(index)
            }
            None => Err(value),
        }
    }

    /// Stores `value` in the first free slot.
    pub fn alloc(&mut self, value: T) -> Result<usize, T> {
        self.alloc_from(0, value)
    }

    /// Frees the slot at `index` and returns its value.
    pub fn free(&mut self, index: usize) -> Option<T> {
        if index >= N {
            return None;
        }
        self.in_use &= !(1 << index);
        self.slots[index].take()
    }

    pub fn is_used(&self, index: usize) -> bool {
        index < N && self.in_use & (1 << index) != 0
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Returns the number of used slots.
    pub fn len(&self) -> usize {
        self.in_use.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Returns the in-use bitmap (bit `i` set means slot `i` is occupied).
    pub fn bitmap(&self) -> u32 {
        self.in_use
    }

    /// Iterates over all occupied slots and their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|value| (i, value)))
    }
}

impl<T, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let mut pool = Pool::<u32, 3>::new();
        assert_eq!(pool.alloc(10), Ok(0));
        assert_eq!(pool.alloc(11), Ok(1));
        assert_eq!(pool.alloc(12), Ok(2));
        assert_eq!(pool.alloc(13), Err(13));
        assert_eq!(pool.bitmap(), 0b111);

        assert_eq!(pool.free(1), Some(11));
        assert!(!pool.is_used(1));
        assert_eq!(pool.get(1), None);
        assert_eq!(pool.alloc(14), Ok(1));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.free(7), None);
    }

    #[test]
    fn partitioned_allocation() {
        let mut pool = Pool::<u8, 4>::new();
        assert_eq!(pool.alloc_from(2, 1), Ok(2));
        assert_eq!(pool.alloc_from(2, 2), Ok(3));
        assert_eq!(pool.alloc_from(2, 3), Err(3));
        assert_eq!(pool.alloc(4), Ok(0));
        let values: Vec<_> = pool.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(values, vec![(0, 4), (2, 1), (3, 2)]);
    }
}
