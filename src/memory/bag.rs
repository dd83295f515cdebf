//! Bags: unordered, resizable collections
//!
//! Capacity doubles when an add finds the bag full and halves when a
//! removal leaves it less than a quarter occupied. Removal swaps the
//! last item into the hole so it is O(1) but does not preserve order.
//!
//! Growing or shrinking may move the backing store, so callers never
//! hold references into a bag across a mutating call (the borrow
//! checker enforces this).

use std::fmt::Debug;

pub struct Bag<T> {
    /// Logical capacity
    size: usize,
    items: Vec<T>,
}

impl<T> Bag<T> {
    /// Create an empty bag sized for `size` items
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Bag {
            size,
            items: Vec::with_capacity(size),
        }
    }

    /// Append an item, doubling capacity if full
    pub fn add(&mut self, item: T) {
        if self.items.len() >= self.size {
            self.grow();
        }
        self.items.push(item);
    }

    /// Remove the item at `index` by swapping in the last item.
    ///
    /// Caller guarantees `index < len()`.
    pub fn remove_index(&mut self, index: usize) -> T {
        debug_assert!(index < self.items.len());
        let item = self.items.swap_remove(index);
        if self.items.len() < self.size / 4 {
            self.shrink();
        }
        item
    }

    /// Remove and return the last item
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.remove_index(self.items.len() - 1))
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current logical capacity
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Remove every item for which `keep` returns false
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut index = self.items.len();
        while index > 0 {
            index -= 1;
            if !keep(&self.items[index]) {
                self.remove_index(index);
            }
        }
    }

    fn grow(&mut self) {
        self.items.reserve_exact(self.size);
        self.size *= 2;
    }

    fn shrink(&mut self) {
        if self.size > 1 {
            self.size /= 2;
            self.items.shrink_to(self.size);
        }
    }
}

impl<T> Default for Bag<T> {
    fn default() -> Self {
        Bag::new(1)
    }
}

impl<T: Debug> Debug for Bag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] ", self.items.len(), self.size)?;
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a Bag<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
