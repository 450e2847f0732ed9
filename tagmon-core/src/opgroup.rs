//! Operand-pattern refinement rules over opcode groups.

use crate::decoder::InsnFlags;
use crate::meta_set::MetaSet;

/// Matcher for a single operand field.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OperandMatcher {
    /// Matches any value.
    Any,
    /// Matches any of the listed values.
    Equal(Vec<i64>),
    /// Matches everything but the listed values.
    NotEqual(Vec<i64>),
    /// Matches values in the inclusive range.
    Range(i64, i64),
    /// Matches values outside the inclusive range.
    NotRange(i64, i64),
}

impl OperandMatcher {
    pub fn matches(&self, value: i64) -> bool {
        match self {
            OperandMatcher::Any => true,
            OperandMatcher::Equal(values) => values.contains(&value),
            OperandMatcher::NotEqual(values) => !values.contains(&value),
            OperandMatcher::Range(lo, hi) => *lo <= value && value <= *hi,
            OperandMatcher::NotRange(lo, hi) => !(*lo <= value && value <= *hi),
        }
    }
}

/// One refinement rule of an opcode group: per-field matchers in the fixed
/// order rd, rs1, rs2, rs3, imm, plus the metadata selected on match.
///
/// A rule matches iff every operand field the instruction actually has passes
/// its matcher; a present field without a matcher fails the rule. Fields the
/// instruction does not have are ignored.
#[derive(Debug, Clone)]
pub struct OpgroupRule {
    matchers: Vec<OperandMatcher>,
    metadata: MetaSet,
}

impl OpgroupRule {
    pub fn new(matchers: Vec<OperandMatcher>, metadata: MetaSet) -> Self {
        Self { matchers, metadata }
    }

    pub fn metadata(&self) -> &MetaSet {
        &self.metadata
    }

    /// Evaluates this rule against a decoded instruction's fields, returning
    /// the rule's metadata on match.
    pub fn matches(
        &self,
        flags: InsnFlags,
        rs1: u32,
        rs2: u32,
        rs3: u32,
        rd: u32,
        imm: i32,
    ) -> Option<&MetaSet> {
        let fields = [
            (InsnFlags::RD, rd as i64),
            (InsnFlags::RS1, rs1 as i64),
            (InsnFlags::RS2, rs2 as i64),
            (InsnFlags::RS3, rs3 as i64),
            (InsnFlags::IMM, imm as i64),
        ];
        for (i, (flag, value)) in fields.iter().enumerate() {
            if flags.contains(*flag) {
                match self.matchers.get(i) {
                    Some(matcher) if matcher.matches(*value) => {}
                    _ => return None,
                }
            }
        }
        Some(&self.metadata)
    }
}
