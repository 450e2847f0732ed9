//! Approximate d-left multi-hash rule cache (dMHC).
//!
//! Models the hardware structure: a content table (`mtable`) holding operand
//! and result tuples, and `k` guide tables (`gtable`) of address slots. Each
//! slot holds an xor-share of a content address, a saturating use count, and
//! the last inserter. A lookup computes `k` permutation hashes over the
//! present operand bits, XORs the addressed slots into a candidate content
//! address, and verifies the candidate against the stored operands. False
//! misses are allowed; verified hits always return the installed results.

use super::RuleCache;
use crate::policy::{Operands, RuleResults};
use log::warn;

/// Bits of each operand field that participate in hashing.
pub const DMHC_RULE_CACHE_IWIDTH: usize = 32;

/// Default number of hash functions.
pub const DMHC_RULE_CACHE_K: usize = 4;

/// Guide-table associativity (`c`): slots per content entry.
const DMHC_ASSOCIATIVITY: usize = 2;

/// Use counts saturate here; saturated slots can no longer be proven free.
const GTABLE_MAX_COUNT: u8 = 3;

/// Bound on victim reinsertion chains.
const HOP_LIMIT: u32 = 1;

/// Content address 0 is reserved as the "no last inserter" marker.
const INVALID_LAST_USER: usize = 0;

const OPS_LEN: usize = 6;
const OP_PC: usize = 0;
const OP_CI: usize = 1;
const OP_OP1: usize = 2;
const OP_OP2: usize = 3;
const OP_OP3: usize = 4;
const OP_MEM: usize = 5;

const TOTAL_OPS_BITS: usize = OPS_LEN * DMHC_RULE_CACHE_IWIDTH;

// Seeds of the four bit permutations, one per hash function.
const PERM_SEEDS: [u64; 4] = [4, 5172, 6_237_886, 7_128_386];

type OpsTuple = [u32; OPS_LEN];
type Consider = [bool; OPS_LEN];

enum Probe {
    Hit(RuleResults),
    Miss,
    FalseHit,
}

#[derive(Debug, Clone, Copy, Default)]
struct GtableSlot {
    xor: usize,
    count: u8,
    last_inserter: usize,
}

#[derive(Debug, Clone, Default)]
struct MtableEntry {
    in_use: bool,
    ops: OpsTuple,
    consider: Consider,
    res: Option<RuleResults>,
}

/// Hit/miss accounting of a [`DmhcRuleCache`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct DmhcStats {
    pub hits: u64,
    pub misses: u64,
    pub false_hits: u64,
    pub inserts: u64,
}

/// The d-left multi-hash rule cache.
pub struct DmhcRuleCache {
    capacity: usize,
    k: usize,
    no_evict: bool,
    /// Output bit position of every input operand bit, per hash function.
    positions: Vec<[u16; TOTAL_OPS_BITS]>,
    /// `k` tables of `2^width` slots each.
    gtable: Vec<Vec<GtableSlot>>,
    mtable: Vec<MtableEntry>,
    next_entry: usize,
    stats: DmhcStats,
}

impl DmhcRuleCache {
    /// Creates a cache of `capacity` content entries with `k` hash functions.
    ///
    /// With `no_evict` set, installs that would displace an existing rule are
    /// dropped instead.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2` (entry 0 is the reserved invalid-inserter
    /// marker) or `k` is not in `1..=4`.
    pub fn new(capacity: usize, k: usize, no_evict: bool) -> Self {
        assert!(capacity > 1, "dmhc capacity must be at least 2");
        assert!((1..=PERM_SEEDS.len()).contains(&k));
        let slots = (DMHC_ASSOCIATIVITY * capacity).next_power_of_two();
        let width = slots.trailing_zeros();
        let positions = (0..k)
            .map(|which| bit_positions(PERM_SEEDS[which], width))
            .collect();
        Self {
            capacity,
            k,
            no_evict,
            positions,
            gtable: vec![vec![GtableSlot::default(); slots]; k],
            mtable: vec![MtableEntry::default(); capacity],
            next_entry: 1,
            stats: DmhcStats::default(),
        }
    }

    pub fn stats(&self) -> DmhcStats {
        self.stats
    }

    fn compute_hashes(&self, ops: &OpsTuple) -> [usize; DMHC_RULE_CACHE_K] {
        let mut hashes = [0usize; DMHC_RULE_CACHE_K];
        for (which, hash) in hashes.iter_mut().enumerate().take(self.k) {
            let positions = &self.positions[which];
            for (field, &value) in ops.iter().enumerate() {
                let mut bits = value;
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    *hash ^= 1 << positions[field * DMHC_RULE_CACHE_IWIDTH + bit];
                    bits &= bits - 1;
                }
            }
        }
        hashes
    }

    /// Verifies a candidate content address against the query operands.
    fn is_hit(&self, ops: &OpsTuple, consider: &Consider, address: usize) -> bool {
        if address == INVALID_LAST_USER || address >= self.capacity {
            return false;
        }
        let entry = &self.mtable[address];
        if !entry.in_use {
            return false;
        }
        consider
            .iter()
            .zip(ops)
            .zip(&entry.ops)
            .all(|((&considered, &query), &stored)| !considered || query == stored)
    }

    fn classify(&self, ops: &OpsTuple, consider: &Consider) -> Probe {
        let hashes = self.compute_hashes(ops);
        // A zero use count on any guide slot proves no entry hashes here.
        for which in 0..self.k {
            if self.gtable[which][hashes[which]].count == 0 {
                return Probe::Miss;
            }
        }
        let mut address = 0;
        for which in 0..self.k {
            address ^= self.gtable[which][hashes[which]].xor;
        }
        if self.is_hit(ops, consider, address) {
            match self.mtable[address].res {
                Some(res) => Probe::Hit(res),
                None => Probe::FalseHit,
            }
        } else {
            Probe::FalseHit
        }
    }

    fn probe(&self, ops: &OpsTuple, consider: &Consider) -> Option<RuleResults> {
        match self.classify(ops, consider) {
            Probe::Hit(res) => Some(res),
            _ => None,
        }
    }

    /// Removes the entry at `address`, decrementing its guide slots.
    ///
    /// Slots on the `do_not_victimize` list keep a count of at least 1 so the
    /// rule being protected is not orphaned. Returns the victim's tuple for
    /// reinsertion.
    fn evict_mtable_entry(
        &mut self,
        address: usize,
        do_not_victimize: Option<&[usize; DMHC_RULE_CACHE_K]>,
    ) -> (OpsTuple, Consider, Option<RuleResults>) {
        let entry = std::mem::take(&mut self.mtable[address]);
        let victim_hashes = self.compute_hashes(&entry.ops);
        for which in 0..self.k {
            let hash = victim_hashes[which];
            let protected = do_not_victimize.map_or(false, |dnv| dnv[which] == hash);
            let slot = &mut self.gtable[which][hash];
            // An orphaned entry's slot may already have counted down to zero.
            if slot.count > 0 && (!protected || slot.count > 1) {
                slot.count -= 1;
            }
            if slot.count == 0 {
                slot.xor = 0;
                slot.last_inserter = INVALID_LAST_USER;
            } else if slot.last_inserter == address {
                slot.last_inserter = INVALID_LAST_USER;
            }
        }
        (entry.ops, entry.consider, entry.res)
    }

    fn real_insert(
        &mut self,
        address: usize,
        ops: &OpsTuple,
        consider: &Consider,
        res: Option<RuleResults>,
        hashes: &[usize; DMHC_RULE_CACHE_K],
        free_slot: usize,
    ) {
        let entry = &mut self.mtable[address];
        entry.in_use = true;
        entry.consider = *consider;
        for field in 0..OPS_LEN {
            entry.ops[field] = if consider[field] { ops[field] } else { 0 };
        }
        entry.res = res;

        // In the bash fallback the chosen slot may still be in use; its other
        // users become unreachable, which only costs false misses.
        let mut current = 0;
        for which in 0..self.k {
            current ^= self.gtable[which][hashes[which]].xor;
        }
        // XOR with current to bring the k-way sum to zero, then with the
        // address so the sum resolves to it.
        self.gtable[free_slot][hashes[free_slot]].xor ^= current ^ address;
        for which in 0..self.k {
            let slot = &mut self.gtable[which][hashes[which]];
            if slot.count != GTABLE_MAX_COUNT {
                slot.count += 1;
            }
            slot.last_inserter = address;
        }
    }

    fn insert_at(
        &mut self,
        address: usize,
        ops: &OpsTuple,
        consider: &Consider,
        res: Option<RuleResults>,
        hops: u32,
        do_not_victimize: &[usize; DMHC_RULE_CACHE_K],
    ) {
        let hashes = self.compute_hashes(ops);

        // Take the lowest hash function with an unused slot.
        let mut free_slot = (0..self.k)
            .find(|&which| self.gtable[which][hashes[which]].count == 0);

        let mut victim = None;
        if free_slot.is_none() {
            if self.no_evict {
                self.mtable[address].in_use = false;
                return;
            }
            let minuse = self.min_count_slot(&hashes, hops, do_not_victimize);
            let Some(minuse) = minuse else {
                // Every slot is on the protected list; give up on reinserting
                // rather than victimize the rule that started the miss.
                self.mtable[address].in_use = false;
                return;
            };
            let last = self.gtable[minuse][hashes[minuse]].last_inserter;
            if last != INVALID_LAST_USER {
                let dnv = (hops > 0).then_some(do_not_victimize);
                victim = Some((last, self.evict_mtable_entry(last, dnv)));
            }
            // Counts changed; a freed slot may now exist. If eviction did not
            // free one (orphan bookkeeping), bash the least-used slot anyway.
            free_slot = (0..self.k)
                .find(|&which| self.gtable[which][hashes[which]].count == 0)
                .or_else(|| self.min_count_slot(&hashes, hops, do_not_victimize));
        }

        let Some(free_slot) = free_slot else {
            self.mtable[address].in_use = false;
            return;
        };
        self.real_insert(address, ops, consider, res, &hashes, free_slot);

        if let Some((victim_address, (victim_ops, victim_consider, victim_res))) = victim {
            if hops < HOP_LIMIT {
                self.insert_at(
                    victim_address,
                    &victim_ops,
                    &victim_consider,
                    victim_res,
                    hops + 1,
                    do_not_victimize,
                );
            }
        }
    }

    fn min_count_slot(
        &self,
        hashes: &[usize; DMHC_RULE_CACHE_K],
        hops: u32,
        do_not_victimize: &[usize; DMHC_RULE_CACHE_K],
    ) -> Option<usize> {
        (0..self.k)
            .filter(|&which| hops == 0 || hashes[which] != do_not_victimize[which])
            .min_by_key(|&which| self.gtable[which][hashes[which]].count)
    }

    fn tuple_of(ops: &Operands) -> (OpsTuple, Consider) {
        let mut tuple = [0u32; OPS_LEN];
        let mut consider = [false; OPS_LEN];
        tuple[OP_PC] = ops.pc.index();
        consider[OP_PC] = true;
        tuple[OP_CI] = ops.ci.index();
        consider[OP_CI] = true;
        for (field, tag) in [
            (OP_OP1, ops.op1),
            (OP_OP2, ops.op2),
            (OP_OP3, ops.op3),
            (OP_MEM, ops.mem),
        ] {
            if let Some(tag) = tag {
                tuple[field] = tag.index();
                consider[field] = true;
            }
        }
        (tuple, consider)
    }
}

impl RuleCache for DmhcRuleCache {
    fn allow(&mut self, ops: &Operands) -> Option<RuleResults> {
        let (tuple, consider) = Self::tuple_of(ops);
        match self.classify(&tuple, &consider) {
            Probe::Hit(res) => {
                self.stats.hits += 1;
                Some(res)
            }
            Probe::Miss => {
                self.stats.misses += 1;
                None
            }
            Probe::FalseHit => {
                self.stats.misses += 1;
                self.stats.false_hits += 1;
                None
            }
        }
    }

    fn install_rule(&mut self, ops: &Operands, res: &RuleResults) {
        self.stats.inserts += 1;
        let (tuple, consider) = Self::tuple_of(ops);

        let entry = self.next_entry;
        self.next_entry += 1;
        if self.next_entry >= self.capacity {
            // Entry 0 stays reserved as the invalid-inserter marker.
            self.next_entry = 1;
        }

        if self.mtable[entry].in_use {
            if self.no_evict {
                warn!("dmhc full; dropping rule install");
                return;
            }
            // Capacity eviction; the displaced rule cannot be saved.
            self.evict_mtable_entry(entry, None);
        }

        let do_not_victimize = self.compute_hashes(&tuple);
        self.insert_at(entry, &tuple, &consider, Some(*res), 0, &do_not_victimize);

        debug_assert!(
            self.no_evict || self.probe(&tuple, &consider) == Some(*res),
            "freshly installed rule must be immediately visible"
        );
    }

    fn flush(&mut self) {
        self.next_entry = 1;
        for table in &mut self.gtable {
            table.fill(GtableSlot::default());
        }
        self.mtable.fill(MtableEntry::default());
        self.stats = DmhcStats::default();
    }
}

impl std::fmt::Debug for DmhcRuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmhcRuleCache")
            .field("capacity", &self.capacity)
            .field("k", &self.k)
            .field("no_evict", &self.no_evict)
            .field("next_entry", &self.next_entry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Maps every input operand bit to its folded output position for one hash
/// function: the input bits are permuted by a seeded Fisher-Yates shuffle,
/// then the permuted stream folds into `width` bits by XOR.
fn bit_positions(seed: u64, width: u32) -> [u16; TOTAL_OPS_BITS] {
    let mut perm: [u16; TOTAL_OPS_BITS] = std::array::from_fn(|i| i as u16);
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut next = || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for i in (1..TOTAL_OPS_BITS).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        perm.swap(i, j);
    }
    let mut positions = [0u16; TOTAL_OPS_BITS];
    for (stream_index, &input_bit) in perm.iter().enumerate() {
        positions[input_bit as usize] = (stream_index % width as usize) as u16;
    }
    positions
}
