// platform/table.rs — handle table shared by the platform implementations.
//
// Issues monotonically increasing ids. An id below the next one to issue
// that is no longer live has been released: looking it up is a
// use-after-release and removing it again is a double release. Ids are never
// reused, so a stale handle can never alias a newer object and no per-id
// tombstone needs to be kept.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub(crate) struct HandleTable<T> {
    kind: &'static str,
    next: u64,
    live: HashMap<u64, T>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        HandleTable {
            kind,
            next: 1,
            live: HashMap::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> u64 {
        let id = self.next;
        self.next += 1;
        self.live.insert(id, value);
        id
    }

    pub fn get(&self, id: u64) -> Result<&T> {
        match self.live.get(&id) {
            Some(v) => Ok(v),
            None => Err(self.missing(id)),
        }
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut T> {
        let err = self.missing(id);
        self.live.get_mut(&id).ok_or(err)
    }

    /// Succeeds if `remove(id)` would.
    pub fn releasable(&self, id: u64) -> Result<()> {
        if self.live.contains_key(&id) {
            Ok(())
        } else if self.was_released(id) {
            Err(Error::DoubleRelease { kind: self.kind, id })
        } else {
            Err(Error::UnknownHandle { kind: self.kind, id })
        }
    }

    pub fn remove(&mut self, id: u64) -> Result<T> {
        self.releasable(id)?;
        self.live
            .remove(&id)
            .ok_or(Error::UnknownHandle { kind: self.kind, id })
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.live.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.live.iter().map(|(&id, v)| (id, v))
    }

    fn was_released(&self, id: u64) -> bool {
        id > 0 && id < self.next && !self.live.contains_key(&id)
    }

    fn missing(&self, id: u64) -> Error {
        if self.was_released(id) {
            Error::UseAfterRelease { kind: self.kind, id }
        } else {
            Error::UnknownHandle { kind: self.kind, id }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_not_reused() {
        let mut t = HandleTable::new("mem");
        let a = t.insert(1);
        t.remove(a).unwrap();
        let b = t.insert(2);
        assert_ne!(a, b);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_tombstones() {
        let mut t = HandleTable::new("queue");
        let id = t.insert("q");
        assert_eq!(*t.get(id).unwrap(), "q");
        t.remove(id).unwrap();

        assert!(matches!(t.get(id), Err(Error::UseAfterRelease { kind: "queue", .. })));
        assert!(matches!(t.get_mut(id), Err(Error::UseAfterRelease { .. })));
        assert!(matches!(t.remove(id), Err(Error::DoubleRelease { kind: "queue", .. })));
        assert!(matches!(t.get(99), Err(Error::UnknownHandle { id: 99, .. })));
        assert!(matches!(t.remove(0), Err(Error::UnknownHandle { id: 0, .. })));
    }

    #[test]
    fn test_churn_keeps_no_per_id_state() {
        let mut t = HandleTable::new("mem");
        for i in 0..100_000u32 {
            let id = t.insert(i);
            t.remove(id).unwrap();
        }
        let last = t.next - 1;
        assert_eq!(t.len(), 0);
        assert!(t.live.capacity() < 16);
        assert!(matches!(t.get(1), Err(Error::UseAfterRelease { id: 1, .. })));
        assert!(matches!(t.remove(last), Err(Error::DoubleRelease { .. })));
        assert!(matches!(t.get(last + 1), Err(Error::UnknownHandle { .. })));
    }
}
