// ledger.rs — bookkeeping of every resource a worker hands out.
//
// Each acquisition gets a `ResourceId` from a monotonically increasing
// counter, and is recorded in the live set until released. With the journal
// enabled, every acquire/release is also appended in order, which is how
// the release-order guarantees of states and steps are checked.

use std::collections::BTreeMap;
use std::fmt;

/// Identity of one acquisition within a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Queue,
    Buffer,
    Image,
    /// Host staging memory.
    Stage,
    Program,
    Kernel,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Context => "context",
            ResourceKind::Queue => "queue",
            ResourceKind::Buffer => "buffer",
            ResourceKind::Image => "image",
            ResourceKind::Stage => "stage",
            ResourceKind::Program => "program",
            ResourceKind::Kernel => "kernel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Acquire,
    Release,
}

/// One journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEvent {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub action: Action,
}

/// A live resource as reported by [`Ledger::live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Bytes held, zero for objects without storage.
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct Ledger {
    next: u64,
    live: BTreeMap<ResourceId, (ResourceKind, usize)>,
    journal: Option<Vec<LedgerEvent>>,
}

impl Ledger {
    pub fn new(journal: bool) -> Self {
        Ledger {
            next: 0,
            live: BTreeMap::new(),
            journal: journal.then(Vec::new),
        }
    }

    pub fn acquire(&mut self, kind: ResourceKind, bytes: usize) -> ResourceId {
        self.next += 1;
        let id = ResourceId(self.next);
        self.live.insert(id, (kind, bytes));
        self.record(id, kind, Action::Acquire);
        id
    }

    /// Forget `id`. Returns `false` when it was not live.
    pub fn release(&mut self, id: ResourceId) -> bool {
        match self.live.remove(&id) {
            Some((kind, _)) => {
                self.record(id, kind, Action::Release);
                true
            }
            None => false,
        }
    }

    /// Live resources in acquisition order.
    pub fn live(&self) -> Vec<LiveResource> {
        self.live
            .iter()
            .map(|(&id, &(kind, bytes))| LiveResource { id, kind, bytes })
            .collect()
    }

    pub fn live_bytes(&self) -> usize {
        self.live.values().map(|&(_, bytes)| bytes).sum()
    }

    /// Journal so far; empty when journaling is off.
    pub fn journal(&self) -> &[LedgerEvent] {
        self.journal.as_deref().unwrap_or(&[])
    }

    fn record(&mut self, id: ResourceId, kind: ResourceKind, action: Action) {
        if let Some(j) = &mut self.journal {
            j.push(LedgerEvent { id, kind, action });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let mut l = Ledger::new(true);
        let a = l.acquire(ResourceKind::Buffer, 64);
        let b = l.acquire(ResourceKind::Stage, 64);
        assert_eq!(l.live_bytes(), 128);
        assert!(l.release(b));
        assert!(!l.release(b));
        assert_eq!(l.live().len(), 1);
        assert_eq!(l.live()[0].id, a);

        let actions: Vec<_> = l.journal().iter().map(|e| (e.id, e.action)).collect();
        assert_eq!(
            actions,
            vec![(a, Action::Acquire), (b, Action::Acquire), (b, Action::Release)]
        );
    }

    #[test]
    fn test_journal_off() {
        let mut l = Ledger::new(false);
        let a = l.acquire(ResourceKind::Queue, 0);
        l.release(a);
        assert!(l.journal().is_empty());
    }
}
