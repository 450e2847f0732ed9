//! The unbounded reference rule cache.

use super::RuleCache;
use crate::policy::{Operands, RuleResults};
use std::collections::HashMap;

/// Unbounded map from operands to results. Never evicts, never falsely
/// misses; used as ground truth for the bounded implementations.
#[derive(Debug, Default)]
pub struct IdealRuleCache {
    table: HashMap<Operands, RuleResults>,
}

impl IdealRuleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleCache for IdealRuleCache {
    fn allow(&mut self, ops: &Operands) -> Option<RuleResults> {
        self.table.get(ops).copied()
    }

    fn install_rule(&mut self, ops: &Operands, res: &RuleResults) {
        self.table.insert(*ops, *res);
    }

    fn flush(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_cache::MetaSetCache;

    fn rule(cache: &mut MetaSetCache, label: u32) -> RuleResults {
        let tag = cache.canonize_labels([label]);
        RuleResults {
            pc: tag,
            rd: tag,
            csr: tag,
            pc_result: true,
            rd_result: false,
            csr_result: false,
        }
    }

    #[test]
    fn test_never_misses_after_install() {
        let mut ms_cache = MetaSetCache::new();
        let mut cache = IdealRuleCache::new();
        let pc = ms_cache.canonize_labels([1]);
        let ci = ms_cache.canonize_labels([2]);
        let ops = Operands::new(pc, ci);
        assert!(cache.allow(&ops).is_none());
        let res = rule(&mut ms_cache, 3);
        cache.install_rule(&ops, &res);
        assert_eq!(Some(res), cache.allow(&ops));
        // A different operand tuple still misses.
        let mut other = ops;
        other.op1 = Some(pc);
        assert!(cache.allow(&other).is_none());
        cache.flush();
        assert!(cache.allow(&ops).is_none());
    }
}
