use std::sync::{
    atomic::{AtomicUsize, Ordering::SeqCst},
    Arc,
};

/// Suppresses buffer refreshes while a multi-step action runs.
///
/// Clones share the same depth counter.
#[derive(Clone, Debug, Default)]
pub struct BusyGate {
    depth: Arc<AtomicUsize>,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.depth.fetch_add(1, SeqCst);
    }

    /// Leaves one level. Leaving more often than entering is a bug; the depth
    /// stays at zero and the mismatch is logged.
    pub fn exit(&self) {
        let result = self
            .depth
            .fetch_update(SeqCst, SeqCst, |depth| depth.checked_sub(1));
        if result.is_err() {
            log::error!("busy gate exited more often than entered");
        }
    }

    /// Enters the gate until the returned guard is dropped.
    pub fn guard(&self) -> BusyGuard {
        self.enter();
        BusyGuard { gate: self.clone() }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(SeqCst)
    }

    pub fn is_engaged(&self) -> bool {
        self.depth() > 0
    }
}

#[must_use]
pub struct BusyGuard {
    gate: BusyGate,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_never_goes_negative() {
        let gate = BusyGate::new();
        gate.exit();
        assert_eq!(gate.depth(), 0);

        gate.enter();
        gate.enter();
        gate.exit();
        gate.exit();
        gate.exit();
        assert_eq!(gate.depth(), 0);
        assert!(!gate.is_engaged());

        gate.enter();
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let gate = BusyGate::new();
        {
            let _outer = gate.guard();
            let clone = gate.clone();
            let _inner = clone.guard();
            assert_eq!(gate.depth(), 2);
        }
        assert_eq!(gate.depth(), 0);

        let result = std::panic::catch_unwind(|| {
            let _guard = gate.guard();
            panic!("action failed");
        });
        assert!(result.is_err());
        assert!(!gate.is_engaged());
    }
}
