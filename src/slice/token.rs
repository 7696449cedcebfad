//! Process-wide writer quota, accounted per index instance.
//!
//! Every slice of an instance shares one counter holding the writers the
//! instance may still activate. The registry is passed into slice
//! construction explicitly rather than living in a global.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// One instance's writer allowance.
#[derive(Debug)]
pub struct Token {
    value: AtomicI64,
}

impl Token {
    pub fn num(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn increment(&self, by: usize) {
        self.value.fetch_add(by as i64, Ordering::SeqCst);
    }

    /// Takes up to `by` tokens without blocking; returns how many were
    /// taken. `force` takes the full amount even when it drives the
    /// counter negative.
    pub fn decrement(&self, by: usize, force: bool) -> usize {
        loop {
            let count = self.value.load(Ordering::SeqCst);
            if count <= 0 && !force {
                return 0;
            }
            let take = if force {
                by as i64
            } else {
                (by as i64).min(count)
            };
            if self
                .value
                .compare_exchange(count, count - take, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return take as usize;
            }
        }
    }
}

/// Registry of writer tokens keyed by index instance id.
#[derive(Debug, Default)]
pub struct WriterTokens {
    tokens: RwLock<FxHashMap<u64, Arc<Token>>>,
}

impl WriterTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `count` free writers for `inst_id`, returning the existing
    /// counter when the instance is already known.
    pub fn register(&self, inst_id: u64, count: usize) -> Arc<Token> {
        let mut map = self.tokens.write();
        map.entry(inst_id)
            .or_insert_with(|| {
                Arc::new(Token {
                    value: AtomicI64::new(count as i64),
                })
            })
            .clone()
    }

    pub fn remove(&self, inst_id: u64) {
        self.tokens.write().remove(&inst_id);
    }

    /// Remaining tokens for an instance, `None` when unregistered.
    pub fn available(&self, inst_id: u64) -> Option<i64> {
        self.tokens.read().get(&inst_id).map(|t| t.num())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let tokens = WriterTokens::new();
        let a = tokens.register(1, 8);
        let b = tokens.register(1, 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tokens.available(1), Some(8));
    }

    #[test]
    fn decrement_does_not_overdraw_without_force() {
        let tokens = WriterTokens::new();
        let t = tokens.register(7, 2);
        assert_eq!(t.decrement(1, false), 1);
        assert_eq!(t.decrement(5, false), 1);
        assert_eq!(t.decrement(1, false), 0);
        assert_eq!(t.num(), 0);
    }

    #[test]
    fn forced_decrement_goes_negative_and_refunds() {
        let tokens = WriterTokens::new();
        let t = tokens.register(7, 1);
        assert_eq!(t.decrement(3, true), 3);
        assert_eq!(t.num(), -2);
        t.increment(3);
        assert_eq!(t.num(), 1);
        tokens.remove(7);
        assert_eq!(tokens.available(7), None);
    }
}
