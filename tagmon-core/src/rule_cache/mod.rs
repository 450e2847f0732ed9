//! Memoization of `(Operands -> Results)` pairs from prior policy
//! evaluations.
//!
//! Three implementations share one contract: an unbounded ideal map used as
//! ground truth, a bounded ring-replacement map, and an approximate d-left
//! multi-hash cache modelling the hardware structure. All of them are pure
//! memoizations: a lookup either misses or returns exactly the results that
//! were installed for equal operands.

mod dmhc;
mod finite;
mod ideal;

pub use dmhc::{DmhcRuleCache, DmhcStats, DMHC_RULE_CACHE_IWIDTH, DMHC_RULE_CACHE_K};
pub use finite::FiniteRuleCache;
pub use ideal::IdealRuleCache;

use crate::config::{ConfigError, RuleCacheConfig};
use crate::policy::{Operands, RuleResults};

/// Common contract of all rule cache implementations.
pub trait RuleCache {
    /// Looks up the rule for `ops`, returning its results on a hit.
    fn allow(&mut self, ops: &Operands) -> Option<RuleResults>;

    /// Records a rule, evicting if needed.
    fn install_rule(&mut self, ops: &Operands, res: &RuleResults);

    /// Drops all entries.
    fn flush(&mut self);
}

/// Builds a rule cache from its configuration; the name is matched
/// case-insensitively against `ideal`, `finite`, and `dmhc`.
pub fn build(config: &RuleCacheConfig) -> Result<Box<dyn RuleCache>, ConfigError> {
    match config.name.to_lowercase().as_str() {
        "ideal" => Ok(Box::new(IdealRuleCache::new())),
        "finite" => {
            if config.capacity == 0 {
                return Err(ConfigError::Schema(
                    "finite rule cache requires a nonzero capacity".into(),
                ));
            }
            Ok(Box::new(FiniteRuleCache::new(config.capacity)))
        }
        "dmhc" => {
            if config.capacity < 2 {
                return Err(ConfigError::Schema(
                    "dmhc rule cache requires a capacity of at least 2".into(),
                ));
            }
            Ok(Box::new(DmhcRuleCache::new(
                config.capacity,
                DMHC_RULE_CACHE_K,
                false,
            )))
        }
        other => Err(ConfigError::Schema(format!(
            "invalid rule cache name `{other}`"
        ))),
    }
}
