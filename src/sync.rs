use parking_lot::{Condvar, Mutex};

/// Binary gate: a one-permit semaphore whose acquire and release may happen
/// on different threads.
///
/// Recovery-point serialization callbacks acquire on the store's persistor
/// thread while the matching release runs on the slice's coordinator, so a
/// held `MutexGuard` cannot model this.
pub struct Gate {
    held: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the permit is free, then takes it.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cond.wait(&mut held);
        }
        *held = true;
    }

    /// Returns the permit. Panics if the gate is not held.
    pub fn release(&self) {
        let mut held = self.held.lock();
        assert!(*held, "gate released while not held");
        *held = false;
        self.cond.notify_one();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn gate_serializes_holders() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let inside = inside.clone();
            joins.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    gate.acquire();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    gate.release();
                }
            }));
        }
        for join in joins {
            join.join().expect("gate thread");
        }
    }

    #[test]
    fn release_crosses_threads() {
        let gate = Arc::new(Gate::new());
        gate.acquire();

        let remote = gate.clone();
        let join = std::thread::spawn(move || remote.release());
        join.join().expect("release thread");

        gate.acquire();
        gate.release();
    }
}
