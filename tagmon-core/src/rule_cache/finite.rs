//! Bounded rule cache with ring replacement.

use super::RuleCache;
use crate::policy::{Operands, RuleResults};
use log::warn;
use std::collections::HashMap;

/// Fixed-capacity rule cache.
///
/// Lookup is the same map as the ideal cache; installed keys are also kept in
/// a ring of `capacity` slots, and once the ring is full each install evicts
/// the key in the slot it overwrites.
#[derive(Debug)]
pub struct FiniteRuleCache {
    table: HashMap<Operands, RuleResults>,
    entries: Vec<Option<Operands>>,
    next_entry: usize,
    cache_full: bool,
}

impl FiniteRuleCache {
    /// Creates a cache holding at most `capacity` rules.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            table: HashMap::with_capacity(capacity),
            entries: vec![None; capacity],
            next_entry: 0,
            cache_full: false,
        }
    }
}

impl RuleCache for FiniteRuleCache {
    fn allow(&mut self, ops: &Operands) -> Option<RuleResults> {
        self.table.get(ops).copied()
    }

    fn install_rule(&mut self, ops: &Operands, res: &RuleResults) {
        if self.cache_full {
            match self.entries[self.next_entry] {
                Some(victim) => {
                    if self.table.remove(&victim).is_none() {
                        warn!("rule cache ring out of sync with table");
                    }
                }
                None => warn!("rule cache ring out of sync with table"),
            }
        }
        self.table.insert(*ops, *res);
        self.entries[self.next_entry] = Some(*ops);

        self.next_entry += 1;
        if self.next_entry >= self.entries.len() {
            self.cache_full = true;
            self.next_entry = 0;
        }
    }

    fn flush(&mut self) {
        self.table.clear();
        self.entries.fill(None);
        self.next_entry = 0;
        self.cache_full = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_cache::MetaSetCache;

    struct Fixture {
        ms_cache: MetaSetCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ms_cache: MetaSetCache::new(),
            }
        }

        fn ops(&mut self, i: u32) -> Operands {
            let pc = self.ms_cache.canonize_labels([1]);
            let ci = self.ms_cache.canonize_labels([2]);
            let mut ops = Operands::new(pc, ci);
            ops.op1 = Some(self.ms_cache.canonize_labels([i % 64, 64 + i / 64]));
            ops
        }

        fn res(&mut self, i: u32) -> RuleResults {
            let tag = self.ms_cache.canonize_labels([i % 64, 64 + i / 64]);
            RuleResults {
                pc: tag,
                rd: tag,
                csr: tag,
                pc_result: true,
                rd_result: true,
                csr_result: false,
            }
        }
    }

    #[test]
    fn test_ring_eviction_is_fifo() {
        let mut fx = Fixture::new();
        let mut cache = FiniteRuleCache::new(4);
        for i in 0..4 {
            let (ops, res) = (fx.ops(i), fx.res(i));
            cache.install_rule(&ops, &res);
        }
        for i in 0..4 {
            assert_eq!(Some(fx.res(i)), cache.allow(&fx.ops(i)));
        }
        // A fifth install overwrites the oldest slot.
        cache.install_rule(&fx.ops(4), &fx.res(4));
        assert!(cache.allow(&fx.ops(0)).is_none());
        for i in 1..5 {
            assert_eq!(Some(fx.res(i)), cache.allow(&fx.ops(i)));
        }
    }

    #[test]
    fn test_no_stale_results_after_eviction() {
        let mut fx = Fixture::new();
        let mut cache = FiniteRuleCache::new(2);
        for i in 0..100 {
            let (ops, res) = (fx.ops(i), fx.res(i));
            cache.install_rule(&ops, &res);
            // An install is immediately visible.
            assert_eq!(Some(res), cache.allow(&ops));
        }
        // Only the last two survive; every hit is exact.
        for i in 0..100 {
            match cache.allow(&fx.ops(i)) {
                Some(res) => assert_eq!(fx.res(i), res),
                None => assert!(i < 98),
            }
        }
    }

    #[test]
    fn test_flush() {
        let mut fx = Fixture::new();
        let mut cache = FiniteRuleCache::new(2);
        let (ops, res) = (fx.ops(0), fx.res(0));
        cache.install_rule(&ops, &res);
        cache.flush();
        assert!(cache.allow(&ops).is_none());
        // The ring restarts cleanly after a flush.
        cache.install_rule(&ops, &res);
        assert_eq!(Some(res), cache.allow(&ops));
    }
}
