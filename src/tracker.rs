//! Live-resource accounting.
//!
//! wgpu releases its objects when the owning handle is dropped, which makes
//! release on every exit path automatic but invisible. Every object this
//! crate creates on the device holds a [`ResourceGuard`] next to its handle,
//! so a caller can confirm that nothing is left allocated after a run,
//! whether the run succeeded or failed.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The kinds of device-side objects a run acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Logical device (the compute context).
    Context,
    /// Command queue of the context.
    Queue,
    /// Compiled shader module.
    Program,
    /// Compute pipeline for one entry point.
    Kernel,
    /// Device buffer, including staging buffers used for read-back.
    Buffer,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Context,
        ResourceKind::Queue,
        ResourceKind::Program,
        ResourceKind::Kernel,
        ResourceKind::Buffer,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Context => "context",
            ResourceKind::Queue => "queue",
            ResourceKind::Program => "program",
            ResourceKind::Kernel => "kernel",
            ResourceKind::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

/// Shared counters of live resources. Cloning is cheap and every clone
/// observes the same counters.
#[derive(Clone, Default)]
pub struct ResourceTracker {
    counts: Arc<[AtomicUsize; 5]>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a resource of `kind` now exists. The count is released
    /// when the returned guard is dropped.
    #[must_use = "dropping the guard immediately releases the resource count"]
    pub fn acquire(&self, kind: ResourceKind) -> ResourceGuard {
        let live = self.counts[kind.index()].fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("acquired {kind} ({live} live)");
        ResourceGuard {
            tracker: self.clone(),
            kind,
        }
    }

    /// Number of live resources of `kind`.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counts[kind.index()].load(Ordering::SeqCst)
    }

    /// Number of live resources across all kinds.
    pub fn total_live(&self) -> usize {
        ResourceKind::ALL.iter().map(|&k| self.live(k)).sum()
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in ResourceKind::ALL {
            map.entry(&kind, &self.live(kind));
        }
        map.finish()
    }
}

/// Keeps one resource counted while it is alive.
pub struct ResourceGuard {
    tracker: ResourceTracker,
    kind: ResourceKind,
}

impl ResourceGuard {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard").field("kind", &self.kind).finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let previous = self.tracker.counts[self.kind.index()].fetch_sub(1, Ordering::SeqCst);
        log::trace!("released {} ({} live)", self.kind, previous - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_while_alive() {
        let tracker = ResourceTracker::new();
        let a = tracker.acquire(ResourceKind::Buffer);
        let b = tracker.acquire(ResourceKind::Buffer);
        let k = tracker.acquire(ResourceKind::Kernel);
        assert_eq!(tracker.live(ResourceKind::Buffer), 2);
        assert_eq!(tracker.live(ResourceKind::Kernel), 1);
        assert_eq!(tracker.total_live(), 3);

        drop(a);
        assert_eq!(tracker.live(ResourceKind::Buffer), 1);
        drop((b, k));
        assert_eq!(tracker.total_live(), 0);
    }

    #[test]
    fn clones_share_counters() {
        let tracker = ResourceTracker::new();
        let other = tracker.clone();
        let _g = other.acquire(ResourceKind::Context);
        assert_eq!(tracker.live(ResourceKind::Context), 1);
    }

    #[test]
    fn guards_release_on_early_return() {
        fn failing_step(tracker: &ResourceTracker) -> Result<(), &'static str> {
            let _buffer = tracker.acquire(ResourceKind::Buffer);
            let _program = tracker.acquire(ResourceKind::Program);
            Err("compile error")
        }

        let tracker = ResourceTracker::new();
        assert!(failing_step(&tracker).is_err());
        assert_eq!(tracker.total_live(), 0);
    }
}
