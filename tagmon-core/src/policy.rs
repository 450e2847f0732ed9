//! Types crossing the boundary between the validator and the policy oracle.

use crate::meta_cache::{MetaSetCache, Tag};
use crate::meta_set::MetaSet;
use crate::Address;

/// Classification returned by a policy evaluation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PolicyResult {
    /// The step is authorized.
    Success,
    /// A rule explicitly denied the step.
    ExpFailure,
    /// No rule matched the step.
    ImpFailure,
    /// The policy code itself failed.
    ErrorFailure,
}

impl PolicyResult {
    pub fn is_success(self) -> bool {
        self == PolicyResult::Success
    }

    /// Human-readable classification, as used in violation reports.
    pub fn describe(self) -> &'static str {
        match self {
            PolicyResult::Success => "Success",
            PolicyResult::ExpFailure => "Explicit Failure",
            PolicyResult::ImpFailure => "Implicit Failure",
            PolicyResult::ErrorFailure => "Internal Policy Error",
        }
    }
}

/// Evaluation context handed to the policy alongside the operands.
///
/// `epc` and `bad_addr` are filled in by the validator; the policy may attach
/// `fail_msg` / `rule_str` and may clear `cached` to veto memoization of the
/// produced rule.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// PC of the instruction being validated.
    pub epc: Address,
    /// Effective memory address, if the instruction touches memory.
    pub bad_addr: Option<Address>,
    /// Classification of the last evaluation.
    pub policy_result: Option<PolicyResult>,
    /// Failure description attached by the policy.
    pub fail_msg: Option<String>,
    /// Identification of the rule that fired, for diagnostics.
    pub rule_str: Option<String>,
    /// Whether the produced rule is safe to memoize in the rule cache.
    pub cached: bool,
}

impl Context {
    pub(crate) fn reset(&mut self, epc: Address) {
        *self = Context {
            epc,
            cached: true,
            ..Context::default()
        };
    }
}

/// Input operand tags for one instruction.
///
/// `pc` (environment) and `ci` (current instruction) are always present;
/// the rest are present per the decoded instruction's operand roles. Since
/// tags are canonical, comparing two `Operands` by tag identity is exactly
/// comparing the underlying metadata sets; absent fields only equal absent
/// fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Operands {
    pub pc: Tag,
    pub ci: Tag,
    pub op1: Option<Tag>,
    pub op2: Option<Tag>,
    pub op3: Option<Tag>,
    pub mem: Option<Tag>,
}

impl Operands {
    pub fn new(pc: Tag, ci: Tag) -> Self {
        Self {
            pc,
            ci,
            op1: None,
            op2: None,
            op3: None,
            mem: None,
        }
    }
}

/// Output metadata written by a policy evaluation.
///
/// The three sets are only meaningful when the matching flag is raised; the
/// validator zeroes both between instructions.
#[derive(Debug, Clone, Default)]
pub struct Results {
    pub pc: MetaSet,
    pub rd: MetaSet,
    pub csr: MetaSet,
    pub pc_result: bool,
    pub rd_result: bool,
    pub csr_result: bool,
}

impl Results {
    pub(crate) fn reset(&mut self) {
        if self.pc_result {
            self.pc = MetaSet::new();
            self.pc_result = false;
        }
        if self.rd_result {
            self.rd = MetaSet::new();
            self.rd_result = false;
        }
        if self.csr_result {
            self.csr = MetaSet::new();
            self.csr_result = false;
        }
    }
}

/// Canonized form of [`Results`], as stored in the rule caches.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RuleResults {
    pub pc: Tag,
    pub rd: Tag,
    pub csr: Tag,
    pub pc_result: bool,
    pub rd_result: bool,
    pub csr_result: bool,
}

impl RuleResults {
    /// Canonizes `results` into tag form.
    pub fn canonize(results: &Results, cache: &mut MetaSetCache) -> Self {
        Self {
            pc: cache.canonize(&results.pc),
            rd: cache.canonize(&results.rd),
            csr: cache.canonize(&results.csr),
            pc_result: results.pc_result,
            rd_result: results.rd_result,
            csr_result: results.csr_result,
        }
    }

    /// Expands this rule back into set form, overwriting `results`.
    pub fn apply_to(&self, results: &mut Results, cache: &MetaSetCache) {
        results.pc = cache.deref(self.pc).clone();
        results.rd = cache.deref(self.rd).clone();
        results.csr = cache.deref(self.csr).clone();
        results.pc_result = self.pc_result;
        results.rd_result = self.rd_result;
        results.csr_result = self.csr_result;
    }
}

/// The policy oracle evaluated once per instruction (unless the rule cache
/// hits).
///
/// The oracle receives the gathered operand tags plus the cache needed to
/// dereference them, and writes its output metadata into `res`. It must not
/// retain tags or references beyond the call.
pub trait PolicyOracle {
    fn eval_policy(
        &mut self,
        ctx: &mut Context,
        ops: &Operands,
        sets: &MetaSetCache,
        res: &mut Results,
    ) -> PolicyResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operands_identity() {
        let mut cache = MetaSetCache::new();
        let a = cache.canonize_labels([1]);
        let b = cache.canonize_labels([2]);
        let mut x = Operands::new(a, b);
        let mut y = Operands::new(a, b);
        assert_eq!(x, y);
        x.op1 = Some(a);
        assert_ne!(x, y);
        y.op1 = Some(a);
        assert_eq!(x, y);
        // An absent field only equals another absent field.
        x.mem = Some(b);
        assert_ne!(x, y);
    }

    #[test]
    fn test_results_reset_only_clears_flagged_slots() {
        let mut res = Results::default();
        res.rd = [3].into_iter().collect();
        res.rd_result = true;
        res.pc = [4].into_iter().collect();
        // pc_result not raised: the stale set stays but is meaningless.
        res.reset();
        assert!(res.rd.is_empty());
        assert!(!res.rd_result);
        assert!(!res.pc_result);
    }

    #[test]
    fn test_rule_results_round_trip() {
        let mut cache = MetaSetCache::new();
        let mut res = Results::default();
        res.pc = [1, 2].into_iter().collect();
        res.pc_result = true;
        res.rd = [7].into_iter().collect();
        res.rd_result = true;
        let rule = RuleResults::canonize(&res, &mut cache);
        let mut out = Results::default();
        rule.apply_to(&mut out, &cache);
        assert_eq!(res.pc, out.pc);
        assert_eq!(res.rd, out.rd);
        assert_eq!(res.csr, out.csr);
        assert!(out.pc_result && out.rd_result && !out.csr_result);
    }
}
