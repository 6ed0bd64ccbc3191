//! `ResizableGate` (spec §4.E): a counting admission mechanism whose permit
//! ceiling can change at runtime, with `in_flight` tracked separately from
//! `available`.
//!
//! Grounded in `R2-bench/common/resizable_semaphore.py`'s
//! `threading.Condition`-guarded semaphore; this is its async analogue using
//! a plain `std::sync::Mutex` (the critical section never holds the lock
//! across an `.await`, so the heavier `tokio::sync::Mutex` buys nothing) +
//! `tokio::sync::Notify`. A blocking `std::sync::Mutex` also means `release`
//! can take a reliable lock instead of a `try_lock` that could silently
//! drop a release under contention — `ShardCoordinator::total_in_flight`
//! reads the same gate `Arc` from the coordinator's multi-thread runtime
//! while shard threads are concurrently acquiring/releasing it, so this
//! gate is not actually single-thread-per-shard in practice.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

struct GateState {
    max: u32,
    available: u32,
    in_flight: u32,
}

pub struct ResizableGate {
    state: Mutex<GateState>,
    notify: Notify,
}

/// RAII guard returned by a successful `acquire`. Releasing happens on
/// drop so a worker's every exit path (including `?`-propagated errors and
/// panics) gives the permit back, matching spec §4.F step 9's "guaranteed
/// on all exit paths" requirement. Call `release()` to mirror the
/// `release()` method with a guard-free signature when one is needed.
pub struct Permit<'a> {
    gate: &'a ResizableGate,
    released: bool,
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release_sync();
        }
    }
}

impl ResizableGate {
    pub fn new(initial_max: u32) -> Self {
        Self {
            state: Mutex::new(GateState {
                max: initial_max,
                available: initial_max,
                in_flight: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Block for up to `wait` for a permit. Returns `None` on timeout so
    /// callers can re-check a stop flag, per spec §4.F step 1 and §5's
    /// cancellation model.
    pub async fn acquire(&self, wait: Duration) -> Option<Permit<'_>> {
        loop {
            {
                let mut guard = self.state.lock().expect("gate state mutex poisoned");
                if guard.available > 0 {
                    guard.available -= 1;
                    guard.in_flight += 1;
                    return Some(Permit {
                        gate: self,
                        released: false,
                    });
                }
            }
            // Wait for a release or resize-up notification, bounded by `wait`
            // so the caller gets a chance to observe a stop signal.
            if timeout(wait, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    fn release_sync(&self) {
        // A reliable blocking lock, not `try_lock`: the gate is shared
        // across the coordinator's multi-thread runtime and every shard
        // thread, so a release under contention must never be silently
        // dropped (a dropped release permanently under-counts `available`
        // and starves the shard). The critical section is a few field
        // writes, so the lock is held for a negligible duration.
        let mut guard = self.state.lock().expect("gate state mutex poisoned");
        if guard.in_flight > 0 {
            guard.in_flight -= 1;
        }
        if guard.available < guard.max {
            guard.available += 1;
        }
        drop(guard);
        self.notify.notify_one();
    }

    /// Explicit release, consuming the guard (equivalent to dropping it).
    pub fn release(mut permit: Permit<'_>) {
        permit.released = true;
        permit.gate.release_sync();
    }

    /// Raise or lower `max`. Raising adds the delta to `available` and wakes
    /// every waiter; lowering reduces `available` clamped at zero and lets
    /// in-flight requests above the new cap finish uninterrupted (spec §4.E).
    pub async fn resize(&self, new_max: u32) {
        let mut guard = self.state.lock().expect("gate state mutex poisoned");
        let old_max = guard.max;
        guard.max = new_max;
        if new_max > old_max {
            guard.available += new_max - old_max;
            drop(guard);
            self.notify.notify_waiters();
        } else if new_max < old_max {
            let delta = old_max - new_max;
            guard.available = guard.available.saturating_sub(delta);
        }
    }

    pub async fn in_flight(&self) -> u32 {
        self.state.lock().expect("gate state mutex poisoned").in_flight
    }

    pub async fn available(&self) -> u32 {
        self.state.lock().expect("gate state mutex poisoned").available
    }

    pub async fn max(&self) -> u32 {
        self.state.lock().expect("gate state mutex poisoned").max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let gate = ResizableGate::new(2);
        let p1 = gate.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(gate.in_flight().await, 1);
        drop(p1);
        assert_eq!(gate.in_flight().await, 0);
        assert_eq!(gate.available().await, 2);
    }

    #[tokio::test]
    async fn acquire_blocks_past_capacity_then_times_out() {
        let gate = ResizableGate::new(1);
        let _p1 = gate.acquire(Duration::from_millis(50)).await.unwrap();
        let second = gate.acquire(Duration::from_millis(20)).await;
        assert!(second.is_none());
    }

    // S7: Gate(2), acquire x2 succeed, third non-blocking fails;
    // resize(5); third now succeeds.
    #[tokio::test]
    async fn s7_resize_up_unblocks_pending_acquire() {
        let gate = ResizableGate::new(2);
        let _p1 = gate.acquire(Duration::from_millis(10)).await.unwrap();
        let _p2 = gate.acquire(Duration::from_millis(10)).await.unwrap();

        let third = gate.acquire(Duration::from_millis(10)).await;
        assert!(third.is_none(), "third acquire should fail before resize");

        gate.resize(5).await;

        let third = gate.acquire(Duration::from_millis(50)).await;
        assert!(third.is_some(), "third acquire should succeed after resize");
    }

    #[tokio::test]
    async fn resize_down_then_up_restores_max() {
        let gate = ResizableGate::new(10);
        gate.resize(4).await;
        assert_eq!(gate.max().await, 4);
        gate.resize(10).await;
        assert_eq!(gate.max().await, 10);
        assert_eq!(gate.available().await, 10);
    }

    #[tokio::test]
    async fn resize_down_does_not_interrupt_in_flight() {
        let gate = ResizableGate::new(4);
        let p1 = gate.acquire(Duration::from_millis(10)).await.unwrap();
        let p2 = gate.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(gate.in_flight().await, 2);

        gate.resize(1).await;
        // Both in-flight permits still outstanding; shrink doesn't revoke them.
        assert_eq!(gate.in_flight().await, 2);

        drop(p1);
        drop(p2);
        assert_eq!(gate.in_flight().await, 0);
        // available should not exceed new max of 1.
        assert!(gate.available().await <= 1);
    }
}
