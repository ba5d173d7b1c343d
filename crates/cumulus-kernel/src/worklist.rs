//! Lock-in work lists.
//!
//! A [`WorkList`] collects items up front, then is locked before any
//! processing starts. Items can still be edited (marked invalid, annotated)
//! after lock-in, but the set of items can only shrink through
//! [`WorkList::clear_invalid`].

use cumulus_types::{CoreError, CoreResult};

/// Items that can drop out of a work list.
pub trait WorkItem {
    fn is_invalid(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct WorkList<T> {
    items: Vec<T>,
    locked: bool,
}

impl<T> Default for WorkList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            locked: false,
        }
    }

    /// Append an item. Fails once the list is locked in.
    pub fn push(&mut self, item: T) -> CoreResult<()> {
        if self.locked {
            return Err(CoreError::Internal(
                "work list is locked in; push after lockin()".to_string(),
            ));
        }
        self.items.push(item);
        Ok(())
    }

    /// Freeze the item set.
    pub fn lockin(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Shallow copy of the current items.
    pub fn list(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.clone()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Edit items in place. The item count cannot change through this.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: WorkItem> WorkList<T> {
    /// Drop every item marked invalid.
    pub fn clear_invalid(&mut self) {
        self.items.retain(|item| !item.is_invalid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        i: usize,
        invalid: bool,
    }

    impl WorkItem for Item {
        fn is_invalid(&self) -> bool {
            self.invalid
        }
    }

    #[test]
    fn push_after_lockin_fails() {
        let mut list = WorkList::new();
        list.push(1).unwrap();
        list.lockin();
        let err = list.push(2).unwrap_err();
        assert_eq!(err.code(), "internal");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn list_is_a_copy() {
        let mut list = WorkList::new();
        list.push(vec![1]).unwrap();

        let mut before = list.list();
        before.push(vec![2]);
        before[0].push(9);

        list.lockin();
        let mut after = list.list();
        after.clear();

        assert_eq!(list.list(), vec![vec![1]]);
    }

    #[test]
    fn clear_invalid_drops_marked_items() {
        let mut list = WorkList::new();
        for i in 0..3 {
            list.push(Item { i, invalid: false }).unwrap();
        }
        list.lockin();
        for item in list.iter_mut() {
            item.invalid = item.i == 1;
        }
        list.clear_invalid();
        let remaining: Vec<usize> = list.iter().map(|it| it.i).collect();
        assert_eq!(remaining, vec![0, 2]);
    }
}
