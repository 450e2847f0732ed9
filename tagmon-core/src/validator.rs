//! The per-instruction validation pipeline: operand gather, policy
//! evaluation, and commit.

use crate::config::{ConfigError, RuleCacheConfig};
use crate::decoder::{decode, InsnFlags};
use crate::factory::MetadataFactory;
use crate::meta_cache::{MetaSetCache, Tag};
use crate::policy::{Context, Operands, PolicyOracle, PolicyResult, Results, RuleResults};
use crate::rule_cache::{self, RuleCache};
use crate::soc_config::SocConfig;
use crate::taginfo::MetadataMemoryMap;
use crate::{csr, Address, InsnBits, RegValue, Xlen, CSR_COUNT, MIN_TAG_GRANULARITY, REG_COUNT};
use log::{debug, error, warn};
use std::path::Path;

/// Host callback reading the current value of a general purpose register.
pub type RegReader = Box<dyn Fn(u8) -> RegValue>;

/// Host callback translating a virtual address to the physical address the
/// tag bus is keyed by.
pub type AddrFixer = Box<dyn Fn(Address) -> Address>;

/// The tag-based reference monitor for one hart.
///
/// The host calls [`validate`](Self::validate) with the pre-execution state
/// of each instruction, performs the architectural update if allowed, and
/// then calls [`commit`](Self::commit) to land the produced output tags.
/// Reentrancy is not supported; every call runs to completion.
pub struct Validator<P: PolicyOracle> {
    xlen: Xlen,
    oracle: P,
    ms_cache: MetaSetCache,
    factory: MetadataFactory,
    tag_bus: crate::tag_bus::TagBus,

    pc_tag: Tag,
    ireg_tags: [Tag; REG_COUNT],
    csr_tags: Vec<Tag>,

    reg_reader: RegReader,
    addr_fixer: AddrFixer,

    rule_cache: Option<Box<dyn RuleCache>>,
    rule_cache_hits: u64,
    rule_cache_misses: u64,
    rule_cache_hit: bool,

    // Scratch state of the instruction currently between validate and commit.
    ctx: Context,
    ops: Operands,
    res: Results,
    pending_rd: Option<u8>,
    pending_csr: Option<u16>,
    has_pending_mem: bool,
    mem_addr: Address,
    // Effective address supplied up front by validate_cached.
    insn_mem_addr: Option<Address>,

    watch_pc: bool,
    watch_regs: Vec<u8>,
    watch_csrs: Vec<u16>,
    watch_addrs: Vec<Address>,

    failed: bool,
    failed_ctx: Context,
    failed_ops: Option<Operands>,
    doa: bool,
}

impl<P: PolicyOracle> Validator<P> {
    /// Initializes a validator from a policy directory and SoC configuration,
    /// wiring in the host callbacks.
    ///
    /// Register and CSR tag files are seeded from the `ISA.RISCV.Reg.Default`
    /// and `ISA.RISCV.CSR.Default` entities, register 0 from
    /// `ISA.RISCV.Reg.RZero`, the PC from `ISA.RISCV.Reg.Env`, and the
    /// architectural CSRs `mepc`/`mtval`/`mtvec` from their own entities.
    pub fn new(
        xlen: Xlen,
        policy_dir: &Path,
        soc_cfg: &Path,
        oracle: P,
        reg_reader: RegReader,
        addr_fixer: AddrFixer,
    ) -> Result<Self, ConfigError> {
        let mut factory = MetadataFactory::new(policy_dir)?;
        let mut ms_cache = MetaSetCache::new();

        fn entity_tag(
            factory: &mut MetadataFactory,
            ms_cache: &mut MetaSetCache,
            path: &str,
        ) -> Tag {
            match factory.lookup_metadata(path) {
                Some(set) => {
                    let set = set.clone();
                    ms_cache.canonize(&set)
                }
                None => {
                    warn!("policy defines no entity {path}; seeding empty");
                    ms_cache.canonize(&crate::meta_set::MetaSet::new())
                }
            }
        }

        let reg_default = entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.Reg.Default");
        let reg_zero = entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.Reg.RZero");
        let csr_default = entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.CSR.Default");
        let pc_tag = entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.Reg.Env");

        let mut ireg_tags = [reg_default; REG_COUNT];
        ireg_tags[0] = reg_zero;
        let mut csr_tags = vec![csr_default; CSR_COUNT];
        csr_tags[csr::MEPC as usize] = entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.CSR.MEPC");
        csr_tags[csr::MTVAL as usize] =
            entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.CSR.MTVal");
        csr_tags[csr::MTVEC as usize] =
            entity_tag(&mut factory, &mut ms_cache, "ISA.RISCV.CSR.MTVec");

        let mut tag_bus = crate::tag_bus::TagBus::new();
        let soc = SocConfig::from_file(soc_cfg)?;
        soc.apply(&mut tag_bus, &mut factory, &mut ms_cache)?;

        let ops = Operands::new(pc_tag, pc_tag);
        Ok(Self {
            xlen,
            oracle,
            ms_cache,
            factory,
            tag_bus,
            pc_tag,
            ireg_tags,
            csr_tags,
            reg_reader,
            addr_fixer,
            rule_cache: None,
            rule_cache_hits: 0,
            rule_cache_misses: 0,
            rule_cache_hit: false,
            ctx: Context::default(),
            ops,
            res: Results::default(),
            pending_rd: None,
            pending_csr: None,
            has_pending_mem: false,
            mem_addr: 0,
            insn_mem_addr: None,
            watch_pc: false,
            watch_regs: Vec::new(),
            watch_csrs: Vec::new(),
            watch_addrs: Vec::new(),
            failed: false,
            failed_ctx: Context::default(),
            failed_ops: None,
            doa: false,
        })
    }

    /// Selects a rule cache implementation by name.
    pub fn config_rule_cache(&mut self, config: &RuleCacheConfig) -> Result<(), ConfigError> {
        debug!("{} rule cache with capacity {}", config.name, config.capacity);
        self.rule_cache = Some(rule_cache::build(config)?);
        Ok(())
    }

    /// Seeds instruction tags from a loaded metadata memory map.
    pub fn apply_metadata(&mut self, map: &MetadataMemoryMap) -> Result<(), ConfigError> {
        for (range, set) in map.iter() {
            let tag = self.ms_cache.canonize(&set);
            let mut addr = range.start;
            while addr < range.end {
                self.tag_bus.set_insn_tag_at(addr, tag).map_err(|e| {
                    ConfigError::Schema(format!("unable to apply metadata: {e}"))
                })?;
                addr += MIN_TAG_GRANULARITY;
            }
        }
        Ok(())
    }

    /// Unions one label into the data tag of every word of `[start, end)`.
    pub fn load_tag_range(
        &mut self,
        start: Address,
        end: Address,
        label: u32,
    ) -> Result<(), ConfigError> {
        let mut addr = start;
        while addr < end {
            let old = self.tag_bus.data_tag_at(addr).map_err(|e| {
                ConfigError::Schema(format!("load_tag_range at {addr:#x}: {e}"))
            })?;
            let mut set = self.ms_cache.deref(old).clone();
            set.insert(label);
            let tag = self.ms_cache.canonize(&set);
            self.tag_bus.set_data_tag_at(addr, tag).map_err(|e| {
                ConfigError::Schema(format!("load_tag_range at {addr:#x}: {e}"))
            })?;
            addr += MIN_TAG_GRANULARITY;
        }
        Ok(())
    }

    /// Validates one instruction; `true` means the policy authorizes it.
    ///
    /// A denied or undecodable step returns `false`. Fatal internal errors
    /// (an effective address outside the tag bus) additionally mark the
    /// validator dead-on-arrival: every later call returns `false` until
    /// re-initialization.
    pub fn validate(&mut self, pc: Address, insn: InsnBits) -> bool {
        if self.doa {
            return false;
        }
        self.setup_validation(pc);
        if !self.prepare_eval(pc, insn) {
            return false;
        }

        if self.rule_cache.is_some() {
            if let Some(rule) = self
                .rule_cache
                .as_mut()
                .and_then(|cache| cache.allow(&self.ops))
            {
                self.rule_cache_hits += 1;
                self.rule_cache_hit = true;
                rule.apply_to(&mut self.res, &self.ms_cache);
                return true;
            }
            self.rule_cache_misses += 1;
        }

        let result =
            self.oracle
                .eval_policy(&mut self.ctx, &self.ops, &self.ms_cache, &mut self.res);
        self.ctx.policy_result = Some(result);
        if result.is_success() {
            true
        } else {
            error!("policy violation at {pc:#x}: {}", result.describe());
            self.handle_violation();
            false
        }
    }

    /// Like [`validate`](Self::validate), but with the effective memory
    /// address supplied by the host. Also returns whether the rule cache hit.
    pub fn validate_cached(
        &mut self,
        pc: Address,
        insn: InsnBits,
        mem_addr: Address,
    ) -> (bool, bool) {
        if self.doa {
            return (false, false);
        }
        self.insn_mem_addr = Some(mem_addr);
        let allowed = self.validate(pc, insn);
        (allowed, self.rule_cache_hit)
    }

    /// Lands the output tags of the last validated instruction.
    ///
    /// Returns `true` when a watched location changed its tag. Calling commit
    /// again without an intervening validate leaves all state unchanged.
    pub fn commit(&mut self) -> bool {
        if self.doa {
            return false;
        }
        let mut hit_watch = false;

        if self.res.pc_result {
            let new_tag = self.ms_cache.canonize(&self.res.pc);
            if self.watch_pc && self.pc_tag != new_tag {
                debug!("watch tag pc");
                hit_watch = true;
            }
            self.pc_tag = new_tag;
        }

        if let (Some(rd), true) = (self.pending_rd, self.res.rd_result) {
            let new_tag = self.ms_cache.canonize(&self.res.rd);
            if self.watch_regs.contains(&rd) && self.ireg_tags[rd as usize] != new_tag {
                debug!("watch tag reg x{rd}");
                hit_watch = true;
            }
            // Register zero keeps its init tag forever.
            if rd != 0 {
                self.ireg_tags[rd as usize] = new_tag;
            }
        }

        if self.has_pending_mem && self.res.rd_result {
            let new_tag = self.ms_cache.canonize(&self.res.rd);
            let mem_paddr = (self.addr_fixer)(self.mem_addr);
            match self.tag_bus.data_tag_at(mem_paddr) {
                Ok(old_tag) => {
                    if self.watch_addrs.contains(&self.mem_addr) && old_tag != new_tag {
                        debug!("watch tag mem at pc {:#x}", self.ctx.epc);
                        hit_watch = true;
                    }
                }
                Err(e) => {
                    error!(
                        "failed to load tag @ {:#x} ({mem_paddr:#x}): {e}",
                        self.mem_addr
                    );
                    hit_watch = true;
                }
            }
            if let Err(e) = self.tag_bus.set_data_tag_at(mem_paddr, new_tag) {
                error!(
                    "failed to store tag @ {:#x} ({mem_paddr:#x}): {e}",
                    self.mem_addr
                );
                hit_watch = true;
            }
        }

        if let (Some(csr), true) = (self.pending_csr, self.res.csr_result) {
            let new_tag = self.ms_cache.canonize(&self.res.csr);
            if self.watch_csrs.contains(&csr) && self.csr_tags[csr as usize] != new_tag {
                debug!("watch tag csr {csr:#x}");
                hit_watch = true;
            }
            self.csr_tags[csr as usize] = new_tag;
        }

        if self.ctx.cached {
            if let Some(cache) = &mut self.rule_cache {
                // Install only if a lookup would still miss, so a re-commit
                // cannot double-install.
                if cache.allow(&self.ops).is_none() {
                    let rule = RuleResults::canonize(&self.res, &mut self.ms_cache);
                    cache.install_rule(&self.ops, &rule);
                }
            }
        }

        hit_watch
    }

    fn setup_validation(&mut self, pc: Address) {
        self.ctx.reset(pc);
        self.res.reset();
        self.rule_cache_hit = false;
        self.pending_rd = None;
        self.pending_csr = None;
        self.has_pending_mem = false;
    }

    /// Decodes and gathers operand tags. Returns `false` when the step must
    /// be denied without policy evaluation.
    fn prepare_eval(&mut self, pc: Address, insn: InsnBits) -> bool {
        let pc_paddr = (self.addr_fixer)(pc);
        let inst = decode(insn, self.xlen);
        if !inst.is_valid() {
            warn!("couldn't decode instruction at {pc:#x} ({pc_paddr:#x}): {insn:#010x}");
            self.insn_mem_addr = None;
            return false;
        }

        let ci_tag = match self.tag_bus.insn_tag_at(pc_paddr) {
            Ok(tag) => tag,
            Err(e) => {
                error!("failed to load CI tag for PC {pc:#x} ({pc_paddr:#x}): {e}");
                self.doa = true;
                return false;
            }
        };
        self.ops = Operands::new(self.pc_tag, ci_tag);

        if inst.flags.contains(InsnFlags::RS1) {
            self.ops.op1 = Some(self.ireg_tags[inst.rs1.unwrap_or(0) as usize]);
        }
        if inst
            .flags
            .intersects(InsnFlags::CSR_LOAD | InsnFlags::CSR_STORE)
        {
            let csr = inst.imm.unwrap_or(0) as usize & (CSR_COUNT - 1);
            self.ops.op2 = Some(self.csr_tags[csr]);
        }
        if inst.flags.contains(InsnFlags::RS2) {
            self.ops.op2 = Some(self.ireg_tags[inst.rs2.unwrap_or(0) as usize]);
        }
        if inst.flags.contains(InsnFlags::RS3) {
            self.ops.op3 = Some(self.ireg_tags[inst.rs3.unwrap_or(0) as usize]);
        }

        self.pending_rd = inst.rd;
        self.pending_csr = inst
            .flags
            .contains(InsnFlags::CSR_STORE)
            .then(|| (inst.imm.unwrap_or(0) as usize & (CSR_COUNT - 1)) as u16);
        self.has_pending_mem = inst.flags.contains(InsnFlags::STORE);

        if inst.flags.intersects(InsnFlags::LOAD | InsnFlags::STORE) {
            self.mem_addr = match self.insn_mem_addr.take() {
                Some(addr) => addr,
                None => {
                    let base = (self.reg_reader)(inst.rs1.unwrap_or(0));
                    let offset = inst.imm.unwrap_or(0) as i64 as u64;
                    base.wrapping_add(offset) & self.xlen.address_max()
                }
            };
            let mem_paddr = (self.addr_fixer)(self.mem_addr);
            self.ctx.bad_addr = Some(self.mem_addr);
            match self.tag_bus.data_tag_at(mem_paddr) {
                Ok(tag) => self.ops.mem = Some(tag),
                Err(e) => {
                    error!(
                        "failed to load tag -- pc: {pc:#x} ({pc_paddr:#x}) addr: {:#x} ({mem_paddr:#x}): {e}",
                        self.mem_addr
                    );
                    self.doa = true;
                    return false;
                }
            }
        } else {
            self.insn_mem_addr = None;
        }

        true
    }

    /// Records the first policy violation; later ones keep the capture.
    fn handle_violation(&mut self) {
        if !self.failed {
            self.failed = true;
            self.failed_ctx = self.ctx.clone();
            self.failed_ops = Some(self.ops);
        }
    }

    /// `true` once any policy violation has been captured.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// `true` once an unrecoverable internal error was hit.
    pub fn is_doa(&self) -> bool {
        self.doa
    }

    pub fn set_pc_watch(&mut self, watching: bool) {
        self.watch_pc = watching;
    }

    pub fn set_reg_watch(&mut self, reg: u8) {
        self.watch_regs.push(reg);
    }

    pub fn set_csr_watch(&mut self, csr: u16) {
        self.watch_csrs.push(csr);
    }

    pub fn set_mem_watch(&mut self, addr: Address) {
        self.watch_addrs.push(addr);
    }

    pub fn flush_rule_cache(&mut self) {
        if let Some(cache) = &mut self.rule_cache {
            cache.flush();
        }
    }

    /// Hit/miss summary of the configured rule cache, if any.
    pub fn rule_cache_stats(&self) -> Option<String> {
        self.rule_cache.as_ref()?;
        let total = self.rule_cache_hits + self.rule_cache_misses;
        let rate = if total == 0 {
            0.0
        } else {
            self.rule_cache_hits as f64 / total as f64 * 100.0
        };
        Some(format!(
            "rule cache: hits {} misses {} total {total} ({rate:.1}% hit rate)",
            self.rule_cache_hits, self.rule_cache_misses
        ))
    }

    /// Rendered tag of the PC, for host debugging.
    pub fn pc_tag_string(&self) -> String {
        self.factory.render(self.ms_cache.deref(self.pc_tag), false)
    }

    /// Rendered tag of a general purpose register.
    pub fn reg_tag_string(&self, reg: u8) -> Option<String> {
        let tag = *self.ireg_tags.get(reg as usize)?;
        Some(self.factory.render(self.ms_cache.deref(tag), false))
    }

    /// Rendered tag of a CSR.
    pub fn csr_tag_string(&self, csr: u16) -> Option<String> {
        let tag = *self.csr_tags.get(csr as usize)?;
        Some(self.factory.render(self.ms_cache.deref(tag), false))
    }

    /// Rendered data tag of a memory address.
    pub fn mem_tag_string(&self, addr: Address) -> Option<String> {
        let tag = self.tag_bus.data_tag_at(addr).ok()?;
        Some(self.factory.render(self.ms_cache.deref(tag), false))
    }

    /// Multi-line report of the first captured violation.
    pub fn violation_msg(&self) -> String {
        if !self.failed {
            return "No Policy Violation".to_owned();
        }
        let ops = self.failed_ops.as_ref();
        let render = |tag: Option<Tag>| match tag {
            Some(tag) => self.factory.render(self.ms_cache.deref(tag), false),
            None => "-".to_owned(),
        };
        let mut msg = format!("Policy Violation:\n    PC = {:x}", self.failed_ctx.epc);
        if let Some(bad_addr) = self.failed_ctx.bad_addr {
            msg.push_str(&format!("    MEM = {bad_addr:x}"));
        }
        msg.push_str("\nMetadata:\n");
        msg.push_str(&format!("    Env   : {}\n", render(ops.map(|o| o.pc))));
        msg.push_str(&format!("    Code  : {}\n", render(ops.map(|o| o.ci))));
        msg.push_str(&format!("    Op1   : {}\n", render(ops.and_then(|o| o.op1))));
        msg.push_str(&format!("    Op2   : {}\n", render(ops.and_then(|o| o.op2))));
        msg.push_str(&format!("    Op3   : {}\n", render(ops.and_then(|o| o.op3))));
        msg.push_str(&format!("    Mem   : {}\n", render(ops.and_then(|o| o.mem))));
        if let Some(result) = self.failed_ctx.policy_result {
            msg.push_str(result.describe());
            msg.push('\n');
        }
        if let Some(fail_msg) = &self.failed_ctx.fail_msg {
            msg.push_str(fail_msg);
            msg.push('\n');
        }
        msg
    }

    /// The metadata factory, for rendering and entity queries.
    pub fn factory(&self) -> &MetadataFactory {
        &self.factory
    }

    /// The meta-set cache backing this validator's tags.
    pub fn meta_set_cache(&self) -> &MetaSetCache {
        &self.ms_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::tests::write_policy_dir;
    use crate::policy::PolicyResult;
    use std::cell::Cell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    const CODE_LABEL: u32 = 5;

    /// Allows everything except stores into memory carrying the code label;
    /// propagates the environment tag and writes a fixed rd set.
    struct TestOracle {
        evals: Rc<Cell<u32>>,
        rd_labels: Vec<u32>,
    }

    impl TestOracle {
        fn new(evals: Rc<Cell<u32>>) -> Self {
            Self {
                evals,
                rd_labels: vec![1],
            }
        }
    }

    impl PolicyOracle for TestOracle {
        fn eval_policy(
            &mut self,
            ctx: &mut Context,
            ops: &Operands,
            sets: &MetaSetCache,
            res: &mut Results,
        ) -> PolicyResult {
            self.evals.set(self.evals.get() + 1);
            if let Some(mem) = ops.mem {
                if sets.deref(mem).contains(CODE_LABEL) {
                    ctx.fail_msg = Some("store into code region".to_owned());
                    return PolicyResult::ExpFailure;
                }
            }
            res.pc = sets.deref(ops.pc).clone();
            res.pc_result = true;
            res.rd = self.rd_labels.iter().copied().collect();
            res.rd_result = true;
            PolicyResult::Success
        }
    }

    const SOC_YML: &str = "\
SOC:
  code:
    name: ISA.RISCV.Code.ElfSection.SHF_EXECINSTR
    start: 0x80000000
    end: 0x80100000
  ram:
    name: SOC.RAM
    start: 0x90000000
    end: 0x90001000
    heterogeneous: true
";

    struct Harness {
        validator: Validator<TestOracle>,
        evals: Rc<Cell<u32>>,
        _dirs: (TempDir, TempDir),
    }

    fn harness() -> Harness {
        let policy = write_policy_dir();
        let soc_dir = TempDir::new().unwrap();
        let soc_path = soc_dir.path().join("soc.yml");
        fs::write(&soc_path, SOC_YML).unwrap();
        let evals = Rc::new(Cell::new(0));
        let oracle = TestOracle::new(evals.clone());
        // x2 holds the address of a word inside the code region.
        let reg_reader: RegReader = Box::new(|reg| match reg {
            2 => 0x8000_0200,
            3 => 0x9000_0100,
            _ => 0,
        });
        let addr_fixer: AddrFixer = Box::new(|addr| addr);
        let validator = Validator::new(
            Xlen::Rv32,
            policy.path(),
            &soc_path,
            oracle,
            reg_reader,
            addr_fixer,
        )
        .unwrap();
        Harness {
            validator,
            evals,
            _dirs: (policy, soc_dir),
        }
    }

    const ADDI_X2: InsnBits = 0x2000_0113; // addi x2, x0, 512
    const SW_X5_X2: InsnBits = 0x0051_2023; // sw x5, 0(x2)
    const SW_X5_X3: InsnBits = 0x0051_A023; // sw x5, 0(x3)

    #[test]
    fn test_denied_store_to_code() {
        let mut h = harness();
        assert!(h.validator.validate(0x8000_0200, ADDI_X2));
        h.validator.commit();

        assert!(!h.validator.validate(0x8000_0204, SW_X5_X2));
        assert!(h.validator.failed());
        assert_eq!(0x8000_0204, h.validator.failed_ctx.epc);
        assert_eq!(Some(0x8000_0200), h.validator.failed_ctx.bad_addr);
        let report = h.validator.violation_msg();
        assert!(report.contains("Policy Violation"));
        assert!(report.contains("store into code region"));
        assert!(report.contains("Explicit Failure"));
    }

    #[test]
    fn test_first_violation_capture_is_sticky() {
        let mut h = harness();
        assert!(!h.validator.validate(0x8000_0204, SW_X5_X2));
        let first_epc = h.validator.failed_ctx.epc;
        assert!(!h.validator.validate(0x8000_0208, SW_X5_X2));
        assert_eq!(first_epc, h.validator.failed_ctx.epc);
    }

    #[test]
    fn test_allowed_store_to_ram_commits_mem_tag() {
        let mut h = harness();
        // sw x5, 0(x3) with x3 -> RAM
        assert!(h.validator.validate(0x8000_0204, SW_X5_X3));
        h.validator.commit();
        // rd set {1} landed on the stored word.
        let rendered = h.validator.mem_tag_string(0x9000_0100).unwrap();
        assert_eq!("requires.test.Reg.Default", rendered);
        // Neighbouring words keep the region's init tag.
        let neighbour = h.validator.mem_tag_string(0x9000_0104).unwrap();
        assert_eq!("requires.test.RAM", neighbour);
    }

    #[test]
    fn test_mem_watchpoint_trips_on_change() {
        let mut h = harness();
        h.validator.set_mem_watch(0x9000_0100);
        assert!(h.validator.validate(0x8000_0204, SW_X5_X3));
        assert!(h.validator.commit());
        // Same store again: tag no longer changes, no trip.
        assert!(h.validator.validate(0x8000_0204, SW_X5_X3));
        assert!(!h.validator.commit());
    }

    #[test]
    fn test_register_zero_is_immutable() {
        let mut h = harness();
        let before = h.validator.reg_tag_string(0).unwrap();
        // addi x0, x0, 0 (a nop writing x0)
        assert!(h.validator.validate(0x8000_0200, 0x0000_0013));
        h.validator.commit();
        assert_eq!(before, h.validator.reg_tag_string(0).unwrap());
        assert_eq!("requires.test.Reg.RZero", before);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut h = harness();
        assert!(h.validator.validate(0x8000_0200, ADDI_X2));
        h.validator.commit();
        let reg = h.validator.reg_tag_string(2).unwrap();
        let pc = h.validator.pc_tag_string();
        assert!(!h.validator.commit());
        assert_eq!(reg, h.validator.reg_tag_string(2).unwrap());
        assert_eq!(pc, h.validator.pc_tag_string());
    }

    #[test]
    fn test_unmapped_effective_address_is_doa() {
        let mut h = harness();
        // x0 + 0 = address 0, outside every region.
        assert!(!h.validator.validate(0x8000_0200, 0x0000_2023)); // sw x0, 0(x0)
        assert!(h.validator.is_doa());
        // Everything afterwards is a no-op returning false.
        assert!(!h.validator.validate(0x8000_0200, ADDI_X2));
        assert!(!h.validator.commit());
    }

    #[test]
    fn test_invalid_decode_denies_without_eval() {
        let mut h = harness();
        assert!(!h.validator.validate(0x8000_0200, 0xFFFF_FFFF));
        assert_eq!(0, h.evals.get());
        assert!(!h.validator.failed());
        assert!(!h.validator.is_doa());
    }

    #[test]
    fn test_rule_cache_short_circuits_eval() {
        let mut h = harness();
        h.validator
            .config_rule_cache(&RuleCacheConfig {
                name: "ideal".into(),
                capacity: 0,
            })
            .unwrap();
        assert!(h.validator.validate(0x8000_0200, ADDI_X2));
        h.validator.commit();
        assert_eq!(1, h.evals.get());

        // Same operands again: served from the cache.
        let (allowed, hit) = h.validator.validate_cached(0x8000_0200, ADDI_X2, 0);
        assert!(allowed);
        assert!(hit);
        assert_eq!(1, h.evals.get());
        h.validator.commit();

        // The committed state matches a fresh evaluation's.
        assert_eq!(
            "requires.test.Reg.Default",
            h.validator.reg_tag_string(2).unwrap()
        );
        let stats = h.validator.rule_cache_stats().unwrap();
        assert!(stats.contains("hits 1"), "{stats}");
    }

    #[test]
    fn test_validate_cached_supplies_effective_address() {
        let mut h = harness();
        // Host-provided address pointing into RAM although x2 points at code.
        let (allowed, _) = h.validator.validate_cached(0x8000_0204, SW_X5_X2, 0x9000_0200);
        assert!(allowed);
        h.validator.commit();
        assert_eq!(
            "requires.test.Reg.Default",
            h.validator.mem_tag_string(0x9000_0200).unwrap()
        );
    }

    #[test]
    fn test_load_tag_range() {
        let mut h = harness();
        h.validator.load_tag_range(0x9000_0000, 0x9000_0010, 2).unwrap();
        let rendered = h.validator.mem_tag_string(0x9000_0008).unwrap();
        assert!(rendered.contains("RZero"));
        assert!(rendered.contains("RAM"));
        // Past the end of the range the init tag is untouched.
        assert_eq!(
            "requires.test.RAM",
            h.validator.mem_tag_string(0x9000_0010).unwrap()
        );
    }
}
