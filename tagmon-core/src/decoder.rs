//! RISC-V instruction decoder producing operand roles for policy evaluation.
//!
//! This is not an executing decoder: it only recovers the fields a reference
//! monitor needs to gather operand tags (which registers are read, whether
//! the destination is written, whether memory or a CSR is touched) and the
//! immediate for effective-address and CSR-number computation.

use crate::Xlen;
use bitflags::bitflags;
use log::trace;

bitflags! {
    /// Operand-role flags of a decoded instruction.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct InsnFlags: u16 {
        const RS1 = 1;
        const RS2 = 2;
        const RS3 = 4;
        const RD = 8;
        const IMM = 16;
        const LOAD = 32;
        const STORE = 64;
        const CSR_LOAD = 128;
        const CSR_STORE = 256;
    }
}

/// A decoded instruction: mnemonic id, operand fields, and role flags.
///
/// Fields are `Some` exactly when the corresponding [`InsnFlags`] bit is set,
/// except for the shift-immediate forms, which carry their shift amount in
/// the encoding but expose no immediate operand to the policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodedInsn {
    pub op: Op,
    pub rd: Option<u8>,
    pub rs1: Option<u8>,
    pub rs2: Option<u8>,
    pub rs3: Option<u8>,
    pub imm: Option<i32>,
    pub flags: InsnFlags,
}

impl DecodedInsn {
    /// Returns `false` for the sentinel produced by unknown encodings.
    pub fn is_valid(&self) -> bool {
        self.op != Op::Invalid
    }

    /// The instruction's mnemonic, or the empty string for the sentinel.
    pub fn name(&self) -> &'static str {
        self.op.mnemonic()
    }

    fn invalid() -> Self {
        Self {
            op: Op::Invalid,
            rd: None,
            rs1: None,
            rs2: None,
            rs3: None,
            imm: None,
            flags: InsnFlags::empty(),
        }
    }
}

/// Decodes a 32-bit instruction word.
///
/// Pure function of `(bits, xlen)`. Unknown encodings decode to a sentinel
/// with [`Op::Invalid`] and no operand fields; callers must skip policy
/// evaluation for such steps. Encodings that only exist at RV64 (`ld`, `lwu`,
/// `sd`, the `*w` arithmetic forms, and the doubleword atomics) also decode
/// to the sentinel when `xlen` is [`Xlen::Rv32`].
pub fn decode(bits: u32, xlen: Xlen) -> DecodedInsn {
    trace!("decoding instruction {bits:#010x} at xlen {xlen}");
    let rv64 = xlen == Xlen::Rv64;
    match bits & 0x7F {
        0b000_0011 => decode_load(bits, rv64),
        0b000_0111 => decode_load_fp(bits),
        0b000_1111 => decode_misc_mem(bits),
        0b001_0011 => decode_op_imm(bits, rv64),
        0b001_0111 => i_type(Op::Auipc, rd(bits), 0, u_imm(bits), InsnFlags::RD | InsnFlags::IMM),
        0b001_1011 if rv64 => decode_op_imm_32(bits),
        0b010_0011 => decode_store(bits, rv64),
        0b010_0111 => decode_store_fp(bits),
        0b010_1111 => decode_amo(bits, rv64),
        0b011_0011 => decode_op(bits),
        0b011_0111 => i_type(Op::Lui, rd(bits), 0, u_imm(bits), InsnFlags::RD | InsnFlags::IMM),
        0b011_1011 if rv64 => decode_op_32(bits),
        0b100_0011 | 0b100_0111 | 0b100_1011 | 0b100_1111 => decode_fused_fp(bits),
        0b101_0011 => decode_op_fp(bits),
        0b110_0011 => decode_branch(bits),
        0b110_0111 => match funct3(bits) {
            0b000 => i_type(
                Op::Jalr,
                rd(bits),
                rs1(bits),
                i_imm(bits),
                InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM,
            ),
            _ => DecodedInsn::invalid(),
        },
        0b110_1111 => i_type(Op::Jal, rd(bits), 0, j_imm(bits), InsnFlags::RD | InsnFlags::IMM),
        0b111_0011 => decode_system(bits),
        _ => DecodedInsn::invalid(),
    }
}

fn decode_load(bits: u32, rv64: bool) -> DecodedInsn {
    let op = match funct3(bits) {
        0b000 => Op::Lb,
        0b001 => Op::Lh,
        0b010 => Op::Lw,
        0b011 if rv64 => Op::Ld,
        0b100 => Op::Lbu,
        0b101 => Op::Lhu,
        0b110 if rv64 => Op::Lwu,
        _ => return DecodedInsn::invalid(),
    };
    i_type(
        op,
        rd(bits),
        rs1(bits),
        i_imm(bits),
        InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM | InsnFlags::LOAD,
    )
}

fn decode_load_fp(bits: u32) -> DecodedInsn {
    let op = match funct3(bits) {
        0b010 => Op::Flw,
        0b011 => Op::Fld,
        0b100 => Op::Flq,
        _ => return DecodedInsn::invalid(),
    };
    i_type(
        op,
        rd(bits),
        rs1(bits),
        i_imm(bits),
        InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM | InsnFlags::LOAD,
    )
}

fn decode_misc_mem(bits: u32) -> DecodedInsn {
    match funct3(bits) {
        0b000 => bare(Op::Fence),
        0b001 => bare(Op::FenceI),
        _ => DecodedInsn::invalid(),
    }
}

fn decode_op_imm(bits: u32, rv64: bool) -> DecodedInsn {
    let flags = InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM;
    match funct3(bits) {
        0b000 => i_type(Op::Addi, rd(bits), rs1(bits), i_imm(bits), flags),
        0b010 => i_type(Op::Slti, rd(bits), rs1(bits), i_imm(bits), flags),
        0b011 => i_type(Op::Sltiu, rd(bits), rs1(bits), i_imm(bits), flags),
        0b100 => i_type(Op::Xori, rd(bits), rs1(bits), i_imm(bits), flags),
        0b110 => i_type(Op::Ori, rd(bits), rs1(bits), i_imm(bits), flags),
        0b111 => i_type(Op::Andi, rd(bits), rs1(bits), i_imm(bits), flags),
        // The shift-immediate forms carry their shift amount in the encoding
        // but expose no immediate operand.
        0b001 | 0b101 => decode_shift_imm(bits, rv64),
        _ => unreachable!(),
    }
}

fn decode_shift_imm(bits: u32, rv64: bool) -> DecodedInsn {
    // funct6 dispatch; at RV32 the shamt high bit (bit 25) must be zero.
    if !rv64 && (bits >> 25) & 1 == 1 {
        return DecodedInsn::invalid();
    }
    let op = match ((bits >> 26) & 0x3F, funct3(bits)) {
        (0b000000, 0b001) => Op::Slli,
        (0b000000, 0b101) => Op::Srli,
        (0b010000, 0b101) => Op::Srai,
        _ => return DecodedInsn::invalid(),
    };
    rd_rs1(op, rd(bits), rs1(bits), InsnFlags::RD | InsnFlags::RS1)
}

fn decode_op_imm_32(bits: u32) -> DecodedInsn {
    match funct3(bits) {
        0b000 => i_type(
            Op::Addiw,
            rd(bits),
            rs1(bits),
            i_imm(bits),
            InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM,
        ),
        0b001 if funct7(bits) == 0 => {
            rd_rs1(Op::Slliw, rd(bits), rs1(bits), InsnFlags::RD | InsnFlags::RS1)
        }
        0b101 => match funct7(bits) {
            0b0000000 => rd_rs1(Op::Srliw, rd(bits), rs1(bits), InsnFlags::RD | InsnFlags::RS1),
            0b0100000 => rd_rs1(Op::Sraiw, rd(bits), rs1(bits), InsnFlags::RD | InsnFlags::RS1),
            _ => DecodedInsn::invalid(),
        },
        _ => DecodedInsn::invalid(),
    }
}

fn decode_store(bits: u32, rv64: bool) -> DecodedInsn {
    let op = match funct3(bits) {
        0b000 => Op::Sb,
        0b001 => Op::Sh,
        0b010 => Op::Sw,
        0b011 if rv64 => Op::Sd,
        _ => return DecodedInsn::invalid(),
    };
    s_type(op, rs1(bits), rs2(bits), s_imm(bits))
}

fn decode_store_fp(bits: u32) -> DecodedInsn {
    let op = match funct3(bits) {
        0b010 => Op::Fsw,
        0b011 => Op::Fsd,
        0b100 => Op::Fsq,
        _ => return DecodedInsn::invalid(),
    };
    s_type(op, rs1(bits), rs2(bits), s_imm(bits))
}

fn decode_amo(bits: u32, rv64: bool) -> DecodedInsn {
    if funct3(bits) != 0b010 && !(rv64 && funct3(bits) == 0b011) {
        return DecodedInsn::invalid();
    }
    let doubleword = funct3(bits) == 0b011;
    let f5 = funct7(bits) >> 2;
    let op = match (f5, doubleword) {
        (0b00010, false) => {
            // lr has no rs2 operand.
            if rs2(bits) != 0 {
                return DecodedInsn::invalid();
            }
            return rd_rs1(
                Op::LrW,
                rd(bits),
                rs1(bits),
                InsnFlags::RD | InsnFlags::RS1 | InsnFlags::LOAD,
            );
        }
        (0b00010, true) => {
            if rs2(bits) != 0 {
                return DecodedInsn::invalid();
            }
            return rd_rs1(
                Op::LrD,
                rd(bits),
                rs1(bits),
                InsnFlags::RD | InsnFlags::RS1 | InsnFlags::LOAD,
            );
        }
        (0b00011, false) => Op::ScW,
        (0b00011, true) => Op::ScD,
        (0b00001, false) => Op::AmoswapW,
        (0b00001, true) => Op::AmoswapD,
        (0b00000, false) => Op::AmoaddW,
        (0b00000, true) => Op::AmoaddD,
        (0b00100, false) => Op::AmoxorW,
        (0b00100, true) => Op::AmoxorD,
        (0b01100, false) => Op::AmoandW,
        (0b01100, true) => Op::AmoandD,
        (0b01000, false) => Op::AmoorW,
        (0b01000, true) => Op::AmoorD,
        (0b10000, false) => Op::AmominW,
        (0b10000, true) => Op::AmominD,
        (0b10100, false) => Op::AmomaxW,
        (0b10100, true) => Op::AmomaxD,
        (0b11000, false) => Op::AmominuW,
        (0b11000, true) => Op::AmominuD,
        (0b11100, false) => Op::AmomaxuW,
        (0b11100, true) => Op::AmomaxuD,
        _ => return DecodedInsn::invalid(),
    };
    r_type(op, rd(bits), rs1(bits), rs2(bits))
}

fn decode_op(bits: u32) -> DecodedInsn {
    let op = match (funct7(bits), funct3(bits)) {
        (0b0000000, 0b000) => Op::Add,
        (0b0000000, 0b001) => Op::Sll,
        (0b0000000, 0b010) => Op::Slt,
        (0b0000000, 0b011) => Op::Sltu,
        (0b0000000, 0b100) => Op::Xor,
        (0b0000000, 0b101) => Op::Srl,
        (0b0000000, 0b110) => Op::Or,
        (0b0000000, 0b111) => Op::And,
        (0b0100000, 0b000) => Op::Sub,
        (0b0100000, 0b101) => Op::Sra,
        // funct7 == MULDIV
        (0b0000001, 0b000) => Op::Mul,
        (0b0000001, 0b001) => Op::Mulh,
        (0b0000001, 0b010) => Op::Mulhsu,
        (0b0000001, 0b011) => Op::Mulhu,
        (0b0000001, 0b100) => Op::Div,
        (0b0000001, 0b101) => Op::Divu,
        (0b0000001, 0b110) => Op::Rem,
        (0b0000001, 0b111) => Op::Remu,
        _ => return DecodedInsn::invalid(),
    };
    r_type(op, rd(bits), rs1(bits), rs2(bits))
}

fn decode_op_32(bits: u32) -> DecodedInsn {
    let op = match (funct7(bits), funct3(bits)) {
        (0b0000000, 0b000) => Op::Addw,
        (0b0100000, 0b000) => Op::Subw,
        (0b0000000, 0b001) => Op::Sllw,
        (0b0000000, 0b101) => Op::Srlw,
        (0b0100000, 0b101) => Op::Sraw,
        (0b0000001, 0b000) => Op::Mulw,
        (0b0000001, 0b100) => Op::Divw,
        (0b0000001, 0b101) => Op::Divuw,
        (0b0000001, 0b110) => Op::Remw,
        (0b0000001, 0b111) => Op::Remuw,
        _ => return DecodedInsn::invalid(),
    };
    r_type(op, rd(bits), rs1(bits), rs2(bits))
}

fn decode_fused_fp(bits: u32) -> DecodedInsn {
    let op = match (bits & 0x7F, (bits >> 25) & 0b11) {
        (0b100_0011, 0b00) => Op::FmaddS,
        (0b100_0011, 0b01) => Op::FmaddD,
        (0b100_0011, 0b11) => Op::FmaddQ,
        (0b100_0111, 0b00) => Op::FmsubS,
        (0b100_0111, 0b01) => Op::FmsubD,
        (0b100_0111, 0b11) => Op::FmsubQ,
        (0b100_1011, 0b00) => Op::FnmsubS,
        (0b100_1011, 0b01) => Op::FnmsubD,
        (0b100_1011, 0b11) => Op::FnmsubQ,
        (0b100_1111, 0b00) => Op::FnmaddS,
        (0b100_1111, 0b01) => Op::FnmaddD,
        (0b100_1111, 0b11) => Op::FnmaddQ,
        _ => return DecodedInsn::invalid(),
    };
    DecodedInsn {
        op,
        rd: Some(rd(bits)),
        rs1: Some(rs1(bits)),
        rs2: Some(rs2(bits)),
        rs3: Some(rs3(bits)),
        imm: None,
        flags: InsnFlags::RD | InsnFlags::RS1 | InsnFlags::RS2 | InsnFlags::RS3,
    }
}

fn decode_op_fp(bits: u32) -> DecodedInsn {
    let f3 = funct3(bits);
    let two_source = |op| r_type(op, rd(bits), rs1(bits), rs2(bits));
    let one_source = |op| rd_rs1(op, rd(bits), rs1(bits), InsnFlags::RD | InsnFlags::RS1);
    match funct7(bits) {
        0b0000000 => two_source(Op::FaddS),
        0b0000001 => two_source(Op::FaddD),
        0b0000011 => two_source(Op::FaddQ),
        0b0000100 => two_source(Op::FsubS),
        0b0000101 => two_source(Op::FsubD),
        0b0000111 => two_source(Op::FsubQ),
        0b0001000 => two_source(Op::FmulS),
        0b0001001 => two_source(Op::FmulD),
        0b0001011 => two_source(Op::FmulQ),
        0b0001100 => two_source(Op::FdivS),
        0b0001101 => two_source(Op::FdivD),
        0b0001111 => two_source(Op::FdivQ),
        0b0010000 => match f3 {
            0b000 => two_source(Op::FsgnjS),
            0b001 => two_source(Op::FsgnjnS),
            0b010 => two_source(Op::FsgnjxS),
            _ => DecodedInsn::invalid(),
        },
        0b0010001 => match f3 {
            0b000 => two_source(Op::FsgnjD),
            0b001 => two_source(Op::FsgnjnD),
            0b010 => two_source(Op::FsgnjxD),
            _ => DecodedInsn::invalid(),
        },
        0b0010011 => match f3 {
            0b000 => two_source(Op::FsgnjQ),
            0b001 => two_source(Op::FsgnjnQ),
            0b010 => two_source(Op::FsgnjxQ),
            _ => DecodedInsn::invalid(),
        },
        0b0010100 => match f3 {
            0b000 => two_source(Op::FminS),
            0b001 => two_source(Op::FmaxS),
            _ => DecodedInsn::invalid(),
        },
        0b0010101 => match f3 {
            0b000 => two_source(Op::FminD),
            0b001 => two_source(Op::FmaxD),
            _ => DecodedInsn::invalid(),
        },
        0b0010111 => match f3 {
            0b000 => two_source(Op::FminQ),
            0b001 => two_source(Op::FmaxQ),
            _ => DecodedInsn::invalid(),
        },
        0b0100000 => match rs2(bits) {
            0b00001 => one_source(Op::FcvtSD),
            0b00011 => one_source(Op::FcvtSQ),
            _ => DecodedInsn::invalid(),
        },
        0b0100001 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtDS),
            0b00011 => one_source(Op::FcvtDQ),
            _ => DecodedInsn::invalid(),
        },
        0b0100011 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtQS),
            0b00001 => one_source(Op::FcvtQD),
            _ => DecodedInsn::invalid(),
        },
        0b0101100 if rs2(bits) == 0 => one_source(Op::FsqrtS),
        0b0101101 if rs2(bits) == 0 => one_source(Op::FsqrtD),
        0b0101111 if rs2(bits) == 0 => one_source(Op::FsqrtQ),
        0b1010000 => match f3 {
            0b000 => two_source(Op::FleS),
            0b001 => two_source(Op::FltS),
            0b010 => two_source(Op::FeqS),
            _ => DecodedInsn::invalid(),
        },
        0b1010001 => match f3 {
            0b000 => two_source(Op::FleD),
            0b001 => two_source(Op::FltD),
            0b010 => two_source(Op::FeqD),
            _ => DecodedInsn::invalid(),
        },
        0b1010011 => match f3 {
            0b000 => two_source(Op::FleQ),
            0b001 => two_source(Op::FltQ),
            0b010 => two_source(Op::FeqQ),
            _ => DecodedInsn::invalid(),
        },
        0b1100000 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtWS),
            0b00001 => one_source(Op::FcvtWuS),
            0b00010 => one_source(Op::FcvtLS),
            0b00011 => one_source(Op::FcvtLuS),
            _ => DecodedInsn::invalid(),
        },
        0b1100001 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtWD),
            0b00001 => one_source(Op::FcvtWuD),
            0b00010 => one_source(Op::FcvtLD),
            0b00011 => one_source(Op::FcvtLuD),
            _ => DecodedInsn::invalid(),
        },
        0b1100011 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtWQ),
            0b00001 => one_source(Op::FcvtWuQ),
            0b00010 => one_source(Op::FcvtLQ),
            0b00011 => one_source(Op::FcvtLuQ),
            _ => DecodedInsn::invalid(),
        },
        0b1101000 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtSW),
            0b00001 => one_source(Op::FcvtSWu),
            0b00010 => one_source(Op::FcvtSL),
            0b00011 => one_source(Op::FcvtSLu),
            _ => DecodedInsn::invalid(),
        },
        0b1101001 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtDW),
            0b00001 => one_source(Op::FcvtDWu),
            0b00010 => one_source(Op::FcvtDL),
            0b00011 => one_source(Op::FcvtDLu),
            _ => DecodedInsn::invalid(),
        },
        0b1101011 => match rs2(bits) {
            0b00000 => one_source(Op::FcvtQW),
            0b00001 => one_source(Op::FcvtQWu),
            0b00010 => one_source(Op::FcvtQL),
            0b00011 => one_source(Op::FcvtQLu),
            _ => DecodedInsn::invalid(),
        },
        0b1110000 if rs2(bits) == 0 => match f3 {
            0b000 => one_source(Op::FmvXW),
            0b001 => one_source(Op::FclassS),
            _ => DecodedInsn::invalid(),
        },
        0b1110001 if rs2(bits) == 0 => match f3 {
            0b000 => one_source(Op::FmvXD),
            0b001 => one_source(Op::FclassD),
            _ => DecodedInsn::invalid(),
        },
        0b1110011 if rs2(bits) == 0 => match f3 {
            0b000 => one_source(Op::FmvXQ),
            0b001 => one_source(Op::FclassQ),
            _ => DecodedInsn::invalid(),
        },
        0b1111000 if rs2(bits) == 0 && f3 == 0 => one_source(Op::FmvWX),
        0b1111001 if rs2(bits) == 0 && f3 == 0 => one_source(Op::FmvDX),
        0b1111011 if rs2(bits) == 0 && f3 == 0 => one_source(Op::FmvQX),
        _ => DecodedInsn::invalid(),
    }
}

fn decode_branch(bits: u32) -> DecodedInsn {
    let op = match funct3(bits) {
        0b000 => Op::Beq,
        0b001 => Op::Bne,
        0b100 => Op::Blt,
        0b101 => Op::Bge,
        0b110 => Op::Bltu,
        0b111 => Op::Bgeu,
        _ => return DecodedInsn::invalid(),
    };
    DecodedInsn {
        op,
        rd: None,
        rs1: Some(rs1(bits)),
        rs2: Some(rs2(bits)),
        rs3: None,
        imm: Some(b_imm(bits)),
        flags: InsnFlags::RS1 | InsnFlags::RS2 | InsnFlags::IMM,
    }
}

fn decode_system(bits: u32) -> DecodedInsn {
    let csr = ((bits >> 20) & 0xFFF) as i32;
    match funct3(bits) {
        0b000 => decode_priv(bits),
        0b001 => csr_insn(Op::Csrrw, bits, csr, csrrw_flags(bits)),
        0b010 => csr_insn(Op::Csrrs, bits, csr, csrrs_flags(bits)),
        0b011 => csr_insn(Op::Csrrc, bits, csr, csrrs_flags(bits)),
        0b101 => csr_insn(Op::Csrrwi, bits, csr, csrrw_flags(bits)),
        0b110 => csr_insn(Op::Csrrsi, bits, csr, csrrs_flags(bits)),
        0b111 => csr_insn(Op::Csrrci, bits, csr, csrrs_flags(bits)),
        _ => DecodedInsn::invalid(),
    }
}

/// A CSR write (`csrrw`/`csrrwi`) with `rd == x0` reads nothing: store-only.
fn csrrw_flags(bits: u32) -> InsnFlags {
    let base = InsnFlags::RS1 | InsnFlags::IMM;
    if rd(bits) != 0 {
        base | InsnFlags::RD | InsnFlags::CSR_LOAD | InsnFlags::CSR_STORE
    } else {
        base | InsnFlags::CSR_STORE
    }
}

/// A CSR set/clear (`csrrs`/`csrrc` and immediate forms) with `rs1 == x0`
/// (or a zero immediate field) writes nothing back: load-only.
fn csrrs_flags(bits: u32) -> InsnFlags {
    let base = InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM;
    if rs1(bits) != 0 {
        base | InsnFlags::CSR_LOAD | InsnFlags::CSR_STORE
    } else {
        base | InsnFlags::CSR_LOAD
    }
}

fn csr_insn(op: Op, bits: u32, csr: i32, flags: InsnFlags) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: flags.contains(InsnFlags::RD).then(|| rd(bits)),
        rs1: Some(rs1(bits)),
        rs2: None,
        rs3: None,
        imm: Some(csr),
        flags,
    }
}

fn decode_priv(bits: u32) -> DecodedInsn {
    if funct7(bits) == 0b0001001 && rd(bits) == 0 {
        return DecodedInsn {
            op: Op::SfenceVma,
            rd: None,
            rs1: Some(rs1(bits)),
            rs2: Some(rs2(bits)),
            rs3: None,
            imm: None,
            flags: InsnFlags::RS1 | InsnFlags::RS2,
        };
    }
    if rd(bits) != 0 || rs1(bits) != 0 {
        return DecodedInsn::invalid();
    }
    match bits >> 20 {
        0b0000_0000_0000 => bare(Op::Ecall),
        0b0000_0000_0001 => bare(Op::Ebreak),
        0b0000_0000_0010 => bare(Op::Uret),
        0b0001_0000_0010 => bare(Op::Sret),
        0b0011_0000_0010 => bare(Op::Mret),
        0b0111_1011_0010 => bare(Op::Dret),
        0b0001_0000_0101 => bare(Op::Wfi),
        _ => DecodedInsn::invalid(),
    }
}

fn bare(op: Op) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: None,
        rs1: None,
        rs2: None,
        rs3: None,
        imm: None,
        flags: InsnFlags::empty(),
    }
}

fn rd_rs1(op: Op, rd: u8, rs1: u8, flags: InsnFlags) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: Some(rd),
        rs1: Some(rs1),
        rs2: None,
        rs3: None,
        imm: None,
        flags,
    }
}

fn r_type(op: Op, rd: u8, rs1: u8, rs2: u8) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: Some(rd),
        rs1: Some(rs1),
        rs2: Some(rs2),
        rs3: None,
        imm: None,
        flags: InsnFlags::RD | InsnFlags::RS1 | InsnFlags::RS2,
    }
}

fn i_type(op: Op, rd: u8, rs1: u8, imm: i32, flags: InsnFlags) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: flags.contains(InsnFlags::RD).then_some(rd),
        rs1: flags.contains(InsnFlags::RS1).then_some(rs1),
        rs2: None,
        rs3: None,
        imm: Some(imm),
        flags,
    }
}

fn s_type(op: Op, rs1: u8, rs2: u8, imm: i32) -> DecodedInsn {
    DecodedInsn {
        op,
        rd: None,
        rs1: Some(rs1),
        rs2: Some(rs2),
        rs3: None,
        imm: Some(imm),
        flags: InsnFlags::RS1 | InsnFlags::RS2 | InsnFlags::IMM | InsnFlags::STORE,
    }
}

/// Returns the 5-bit *rd* field.
fn rd(bits: u32) -> u8 {
    ((bits >> 7) & 0x1F) as u8
}

/// Returns the 5-bit *rs1* field.
fn rs1(bits: u32) -> u8 {
    ((bits >> 15) & 0x1F) as u8
}

/// Returns the 5-bit *rs2* field.
fn rs2(bits: u32) -> u8 {
    ((bits >> 20) & 0x1F) as u8
}

/// Returns the 5-bit *rs3* field (fused multiply-add forms only).
fn rs3(bits: u32) -> u8 {
    (bits >> 27) as u8
}

/// Returns the 3-bit *funct3* field.
fn funct3(bits: u32) -> u8 {
    ((bits >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* field.
fn funct7(bits: u32) -> u8 {
    (bits >> 25) as u8
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(bits: u32) -> i32 {
    bits as i32 >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(bits: u32) -> i32 {
    let imm_11_5 = bits & 0xFE00_0000;
    let imm_4_0 = bits & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(bits: u32) -> i32 {
    let imm_12 = bits & 0x8000_0000;
    let imm_10_5 = bits & 0x7E00_0000;
    let imm_4_1 = bits & 0x0000_0F00;
    let imm_11 = bits & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(bits: u32) -> i32 {
    (bits & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(bits: u32) -> i32 {
    let imm_20 = bits & 0x8000_0000;
    let imm_10_1 = bits & 0x7FE0_0000;
    let imm_11 = bits & 0x0010_0000;
    let imm_19_12 = bits & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

/// Every recognized mnemonic, plus the [`Op::Invalid`] sentinel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    Invalid,
    // RV32I / RV64I
    Lui, Auipc, Jal, Jalr,
    Beq, Bne, Blt, Bge, Bltu, Bgeu,
    Lb, Lh, Lw, Lbu, Lhu, Lwu, Ld,
    Sb, Sh, Sw, Sd,
    Addi, Slti, Sltiu, Xori, Ori, Andi, Slli, Srli, Srai,
    Add, Sub, Sll, Slt, Sltu, Xor, Srl, Sra, Or, And,
    Addiw, Slliw, Srliw, Sraiw,
    Addw, Subw, Sllw, Srlw, Sraw,
    Fence, FenceI,
    Ecall, Ebreak, Uret, Sret, Mret, Dret, Wfi, SfenceVma,
    // Zicsr
    Csrrw, Csrrs, Csrrc, Csrrwi, Csrrsi, Csrrci,
    // M
    Mul, Mulh, Mulhsu, Mulhu, Div, Divu, Rem, Remu,
    Mulw, Divw, Divuw, Remw, Remuw,
    // A
    LrW, ScW, AmoswapW, AmoaddW, AmoxorW, AmoandW, AmoorW,
    AmominW, AmomaxW, AmominuW, AmomaxuW,
    LrD, ScD, AmoswapD, AmoaddD, AmoxorD, AmoandD, AmoorD,
    AmominD, AmomaxD, AmominuD, AmomaxuD,
    // F/D/Q
    Flw, Fld, Flq, Fsw, Fsd, Fsq,
    FmaddS, FmsubS, FnmsubS, FnmaddS,
    FmaddD, FmsubD, FnmsubD, FnmaddD,
    FmaddQ, FmsubQ, FnmsubQ, FnmaddQ,
    FaddS, FsubS, FmulS, FdivS, FsqrtS,
    FsgnjS, FsgnjnS, FsgnjxS, FminS, FmaxS,
    FaddD, FsubD, FmulD, FdivD, FsqrtD,
    FsgnjD, FsgnjnD, FsgnjxD, FminD, FmaxD,
    FaddQ, FsubQ, FmulQ, FdivQ, FsqrtQ,
    FsgnjQ, FsgnjnQ, FsgnjxQ, FminQ, FmaxQ,
    FcvtSD, FcvtDS, FcvtSQ, FcvtQS, FcvtDQ, FcvtQD,
    FleS, FltS, FeqS, FleD, FltD, FeqD, FleQ, FltQ, FeqQ,
    FcvtWS, FcvtWuS, FcvtLS, FcvtLuS,
    FcvtWD, FcvtWuD, FcvtLD, FcvtLuD,
    FcvtWQ, FcvtWuQ, FcvtLQ, FcvtLuQ,
    FcvtSW, FcvtSWu, FcvtSL, FcvtSLu,
    FcvtDW, FcvtDWu, FcvtDL, FcvtDLu,
    FcvtQW, FcvtQWu, FcvtQL, FcvtQLu,
    FmvXW, FmvWX, FmvXD, FmvDX, FmvXQ, FmvQX,
    FclassS, FclassD, FclassQ,
}

impl Op {
    /// The assembler mnemonic, or `""` for [`Op::Invalid`].
    pub fn mnemonic(self) -> &'static str {
        use Op::*;
        match self {
            Invalid => "",
            Lui => "lui", Auipc => "auipc", Jal => "jal", Jalr => "jalr",
            Beq => "beq", Bne => "bne", Blt => "blt", Bge => "bge",
            Bltu => "bltu", Bgeu => "bgeu",
            Lb => "lb", Lh => "lh", Lw => "lw", Lbu => "lbu", Lhu => "lhu",
            Lwu => "lwu", Ld => "ld",
            Sb => "sb", Sh => "sh", Sw => "sw", Sd => "sd",
            Addi => "addi", Slti => "slti", Sltiu => "sltiu", Xori => "xori",
            Ori => "ori", Andi => "andi", Slli => "slli", Srli => "srli",
            Srai => "srai",
            Add => "add", Sub => "sub", Sll => "sll", Slt => "slt",
            Sltu => "sltu", Xor => "xor", Srl => "srl", Sra => "sra",
            Or => "or", And => "and",
            Addiw => "addiw", Slliw => "slliw", Srliw => "srliw", Sraiw => "sraiw",
            Addw => "addw", Subw => "subw", Sllw => "sllw", Srlw => "srlw",
            Sraw => "sraw",
            Fence => "fence", FenceI => "fence.i",
            Ecall => "ecall", Ebreak => "ebreak", Uret => "uret", Sret => "sret",
            Mret => "mret", Dret => "dret", Wfi => "wfi", SfenceVma => "sfence.vma",
            Csrrw => "csrrw", Csrrs => "csrrs", Csrrc => "csrrc",
            Csrrwi => "csrrwi", Csrrsi => "csrrsi", Csrrci => "csrrci",
            Mul => "mul", Mulh => "mulh", Mulhsu => "mulhsu", Mulhu => "mulhu",
            Div => "div", Divu => "divu", Rem => "rem", Remu => "remu",
            Mulw => "mulw", Divw => "divw", Divuw => "divuw", Remw => "remw",
            Remuw => "remuw",
            LrW => "lr.w", ScW => "sc.w", AmoswapW => "amoswap.w",
            AmoaddW => "amoadd.w", AmoxorW => "amoxor.w", AmoandW => "amoand.w",
            AmoorW => "amoor.w", AmominW => "amomin.w", AmomaxW => "amomax.w",
            AmominuW => "amominu.w", AmomaxuW => "amomaxu.w",
            LrD => "lr.d", ScD => "sc.d", AmoswapD => "amoswap.d",
            AmoaddD => "amoadd.d", AmoxorD => "amoxor.d", AmoandD => "amoand.d",
            AmoorD => "amoor.d", AmominD => "amomin.d", AmomaxD => "amomax.d",
            AmominuD => "amominu.d", AmomaxuD => "amomaxu.d",
            Flw => "flw", Fld => "fld", Flq => "flq",
            Fsw => "fsw", Fsd => "fsd", Fsq => "fsq",
            FmaddS => "fmadd.s", FmsubS => "fmsub.s", FnmsubS => "fnmsub.s",
            FnmaddS => "fnmadd.s",
            FmaddD => "fmadd.d", FmsubD => "fmsub.d", FnmsubD => "fnmsub.d",
            FnmaddD => "fnmadd.d",
            FmaddQ => "fmadd.q", FmsubQ => "fmsub.q", FnmsubQ => "fnmsub.q",
            FnmaddQ => "fnmadd.q",
            FaddS => "fadd.s", FsubS => "fsub.s", FmulS => "fmul.s",
            FdivS => "fdiv.s", FsqrtS => "fsqrt.s",
            FsgnjS => "fsgnj.s", FsgnjnS => "fsgnjn.s", FsgnjxS => "fsgnjx.s",
            FminS => "fmin.s", FmaxS => "fmax.s",
            FaddD => "fadd.d", FsubD => "fsub.d", FmulD => "fmul.d",
            FdivD => "fdiv.d", FsqrtD => "fsqrt.d",
            FsgnjD => "fsgnj.d", FsgnjnD => "fsgnjn.d", FsgnjxD => "fsgnjx.d",
            FminD => "fmin.d", FmaxD => "fmax.d",
            FaddQ => "fadd.q", FsubQ => "fsub.q", FmulQ => "fmul.q",
            FdivQ => "fdiv.q", FsqrtQ => "fsqrt.q",
            FsgnjQ => "fsgnj.q", FsgnjnQ => "fsgnjn.q", FsgnjxQ => "fsgnjx.q",
            FminQ => "fmin.q", FmaxQ => "fmax.q",
            FcvtSD => "fcvt.s.d", FcvtDS => "fcvt.d.s", FcvtSQ => "fcvt.s.q",
            FcvtQS => "fcvt.q.s", FcvtDQ => "fcvt.d.q", FcvtQD => "fcvt.q.d",
            FleS => "fle.s", FltS => "flt.s", FeqS => "feq.s",
            FleD => "fle.d", FltD => "flt.d", FeqD => "feq.d",
            FleQ => "fle.q", FltQ => "flt.q", FeqQ => "feq.q",
            FcvtWS => "fcvt.w.s", FcvtWuS => "fcvt.wu.s", FcvtLS => "fcvt.l.s",
            FcvtLuS => "fcvt.lu.s",
            FcvtWD => "fcvt.w.d", FcvtWuD => "fcvt.wu.d", FcvtLD => "fcvt.l.d",
            FcvtLuD => "fcvt.lu.d",
            FcvtWQ => "fcvt.w.q", FcvtWuQ => "fcvt.wu.q", FcvtLQ => "fcvt.l.q",
            FcvtLuQ => "fcvt.lu.q",
            FcvtSW => "fcvt.s.w", FcvtSWu => "fcvt.s.wu", FcvtSL => "fcvt.s.l",
            FcvtSLu => "fcvt.s.lu",
            FcvtDW => "fcvt.d.w", FcvtDWu => "fcvt.d.wu", FcvtDL => "fcvt.d.l",
            FcvtDLu => "fcvt.d.lu",
            FcvtQW => "fcvt.q.w", FcvtQWu => "fcvt.q.wu", FcvtQL => "fcvt.q.l",
            FcvtQLu => "fcvt.q.lu",
            FmvXW => "fmv.x.w", FmvWX => "fmv.w.x", FmvXD => "fmv.x.d",
            FmvDX => "fmv.d.x", FmvXQ => "fmv.x.q", FmvQX => "fmv.q.x",
            FclassS => "fclass.s", FclassD => "fclass.d", FclassQ => "fclass.q",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i_imm() {
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        // Check other bits are ignored
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF1_2345));
    }

    #[test]
    fn test_addi() {
        // addi x2, x0, 512
        let inst = decode(0x2000_0113, Xlen::Rv32);
        assert_eq!(Op::Addi, inst.op);
        assert_eq!(Some(2), inst.rd);
        assert_eq!(Some(0), inst.rs1);
        assert_eq!(Some(512), inst.imm);
        assert_eq!(InsnFlags::RD | InsnFlags::RS1 | InsnFlags::IMM, inst.flags);
    }

    #[test]
    fn test_sw() {
        // sw x5, 0(x2)
        let inst = decode(0x0051_2023, Xlen::Rv32);
        assert_eq!(Op::Sw, inst.op);
        assert_eq!(Some(2), inst.rs1);
        assert_eq!(Some(5), inst.rs2);
        assert_eq!(Some(0), inst.imm);
        assert!(inst.flags.contains(InsnFlags::STORE));
        assert!(!inst.flags.contains(InsnFlags::RD));
    }

    #[test]
    fn test_csrrw_with_rd_zero_is_store_only() {
        // csrrw x0, mstatus, x5
        let inst = decode(0x3052_9073, Xlen::Rv32);
        assert_eq!(Op::Csrrw, inst.op);
        assert_eq!(
            InsnFlags::RS1 | InsnFlags::IMM | InsnFlags::CSR_STORE,
            inst.flags
        );
        assert_eq!(Some(0x305), inst.imm);
        assert_eq!(None, inst.rd);
    }

    #[test]
    fn test_csrrw_with_rd_is_load_and_store() {
        // csrrw x3, mstatus, x5
        let inst = decode(0x3052_91F3, Xlen::Rv32);
        assert_eq!(Op::Csrrw, inst.op);
        assert!(inst.flags.contains(InsnFlags::RD));
        assert!(inst.flags.contains(InsnFlags::CSR_LOAD));
        assert!(inst.flags.contains(InsnFlags::CSR_STORE));
    }

    #[test]
    fn test_csrrs_with_rs1_zero_is_load_only() {
        // csrrs x7, mepc, x0
        let inst = decode(0x3410_23F3, Xlen::Rv32);
        assert_eq!(Op::Csrrs, inst.op);
        assert!(inst.flags.contains(InsnFlags::CSR_LOAD));
        assert!(!inst.flags.contains(InsnFlags::CSR_STORE));
        assert_eq!(Some(0x341), inst.imm);
    }

    #[test]
    fn test_rv64_only_encodings_invalid_at_rv32() {
        // ld x1, 0(x2)
        let ld = 0x0001_3083;
        assert_eq!(Op::Ld, decode(ld, Xlen::Rv64).op);
        assert_eq!(Op::Invalid, decode(ld, Xlen::Rv32).op);
        // addw x1, x2, x3
        let addw = 0x0031_00BB;
        assert_eq!(Op::Addw, decode(addw, Xlen::Rv64).op);
        assert_eq!(Op::Invalid, decode(addw, Xlen::Rv32).op);
        // amoadd.d x1, x2, (x3)
        let amoadd_d = 0x0021_B0AF;
        assert_eq!(Op::AmoaddD, decode(amoadd_d, Xlen::Rv64).op);
        assert_eq!(Op::Invalid, decode(amoadd_d, Xlen::Rv32).op);
    }

    #[test]
    fn test_amo_flags() {
        // amoadd.w x10, x12, (x11)
        let inst = decode(0x00C5_A52F, Xlen::Rv32);
        assert_eq!(Op::AmoaddW, inst.op);
        assert_eq!(InsnFlags::RD | InsnFlags::RS1 | InsnFlags::RS2, inst.flags);
        // lr.w x10, (x11)
        let inst = decode(0x1005_A52F, Xlen::Rv32);
        assert_eq!(Op::LrW, inst.op);
        assert_eq!(
            InsnFlags::RD | InsnFlags::RS1 | InsnFlags::LOAD,
            inst.flags
        );
    }

    #[test]
    fn test_fmadd_has_rs3() {
        // fmadd.s f1, f2, f3, f4
        let inst = decode(0x2031_00C3, Xlen::Rv32);
        assert_eq!(Op::FmaddS, inst.op);
        assert_eq!(Some(4), inst.rs3);
        assert!(inst.flags.contains(InsnFlags::RS3));
    }

    #[test]
    fn test_branch_immediate() {
        // beq x1, x2, -4 (backwards branch)
        let inst = decode(0xFE20_8EE3, Xlen::Rv32);
        assert_eq!(Op::Beq, inst.op);
        assert_eq!(Some(-4), inst.imm);
    }

    #[test]
    fn test_jal_immediate_sign() {
        // jal x0, -16
        let inst = decode(0xFF1F_F06F, Xlen::Rv32);
        assert_eq!(Op::Jal, inst.op);
        assert_eq!(Some(-16), inst.imm);
    }

    #[test]
    fn test_unknown_encoding_is_sentinel() {
        let inst = decode(0xFFFF_FFFF, Xlen::Rv64);
        assert_eq!(Op::Invalid, inst.op);
        assert_eq!("", inst.name());
        assert!(!inst.is_valid());
        assert_eq!(InsnFlags::empty(), inst.flags);
    }

    #[test]
    fn test_decode_is_pure() {
        let words = [0x2000_0113, 0x0051_2023, 0x3052_9073, 0xFFFF_FFFF];
        for &w in &words {
            assert_eq!(decode(w, Xlen::Rv32), decode(w, Xlen::Rv32));
        }
    }

    #[test]
    fn test_shift_imm_has_no_imm_operand() {
        // slli x1, x2, 3
        let inst = decode(0x0031_1093, Xlen::Rv32);
        assert_eq!(Op::Slli, inst.op);
        assert_eq!(InsnFlags::RD | InsnFlags::RS1, inst.flags);
        assert_eq!(None, inst.imm);
        // shamt bit 25 set is only legal at RV64
        let slli_shamt_32 = 0x0201_1093;
        assert_eq!(Op::Invalid, decode(slli_shamt_32, Xlen::Rv32).op);
        assert_eq!(Op::Slli, decode(slli_shamt_32, Xlen::Rv64).op);
    }

    #[test]
    fn test_ecall_mret() {
        assert_eq!(Op::Ecall, decode(0x0000_0073, Xlen::Rv32).op);
        assert_eq!(Op::Mret, decode(0x3020_0073, Xlen::Rv32).op);
        assert_eq!(Op::Wfi, decode(0x1050_0073, Xlen::Rv32).op);
    }
}
