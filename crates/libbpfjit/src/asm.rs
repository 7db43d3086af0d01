//! Minimal RV64 instruction encoder.
//!
//! This is not a general purpose assembler. It covers exactly the subset the
//! BPF translator emits and produces the same byte stream the recompiler's
//! code buffer expects: little endian words, 4 byte aligned, with labels
//! resolved before the code leaves the assembler.

use std::fmt;

/// A RISC-V general purpose register, x0 through x31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

pub const ZERO: Reg = Reg(0);
pub const RA: Reg = Reg(1);
pub const SP: Reg = Reg(2);
pub const T0: Reg = Reg(5);
pub const T1: Reg = Reg(6);
pub const T2: Reg = Reg(7);
pub const S0: Reg = Reg(8);
pub const S1: Reg = Reg(9);
pub const A0: Reg = Reg(10);
pub const A1: Reg = Reg(11);
pub const A2: Reg = Reg(12);
pub const A6: Reg = Reg(16);
pub const A7: Reg = Reg(17);
pub const S2: Reg = Reg(18);
pub const S3: Reg = Reg(19);
pub const S4: Reg = Reg(20);
pub const S5: Reg = Reg(21);
pub const S6: Reg = Reg(22);
pub const S7: Reg = Reg(23);
pub const S8: Reg = Reg(24);
pub const S9: Reg = Reg(25);
pub const S10: Reg = Reg(26);
pub const S11: Reg = Reg(27);
pub const T3: Reg = Reg(28);
pub const T4: Reg = Reg(29);
pub const T5: Reg = Reg(30);
pub const T6: Reg = Reg(31);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Handle to a position in the emitted code. Created unbound, may be used as
/// a branch target before it is bound, and must be bound exactly once before
/// the code is taken out of the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum PatchKind {
    /// B-type, 13 bit signed offset.
    Branch,
    /// J-type, 21 bit signed offset.
    Jump,
}

#[derive(Debug, Default)]
struct LabelState {
    offset: Option<usize>,
    patches: Vec<(usize, PatchKind)>,
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<LabelState>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the current position and resolves every branch that
    /// already targets it.
    pub fn bind(&mut self, label: Label) {
        let here = self.code.len();
        let state = &mut self.labels[label.0];
        assert!(state.offset.is_none(), "label bound twice");
        state.offset = Some(here);

        let patches = std::mem::take(&mut state.patches);
        for (at, kind) in patches {
            let offset = here as i64 - at as i64;
            let word = self.read32(at);
            let patched = match kind {
                PatchKind::Branch => word | encode_branch_offset(offset),
                PatchKind::Jump => word | encode_jump_offset(offset),
            };
            self.write32(at, patched);
        }
    }

    /// Hands out the finished code. Panics if a label was used as a branch
    /// target but never bound, which would leave a zero offset in the stream.
    pub fn into_code(self) -> Vec<u8> {
        for state in &self.labels {
            assert!(
                state.offset.is_some() || state.patches.is_empty(),
                "unbound label with pending branches"
            );
        }
        self.code
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn emit32(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn read32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.code[at..at + 4].try_into().unwrap())
    }

    fn write32(&mut self, at: usize, word: u32) {
        self.code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn branch_to(&mut self, base: u32, label: Label) {
        let at = self.code.len();
        match self.labels[label.0].offset {
            Some(target) => {
                let offset = target as i64 - at as i64;
                self.emit32(base | encode_branch_offset(offset));
            }
            None => {
                self.labels[label.0].patches.push((at, PatchKind::Branch));
                self.emit32(base);
            }
        }
    }

    fn jump_to(&mut self, base: u32, label: Label) {
        let at = self.code.len();
        match self.labels[label.0].offset {
            Some(target) => {
                let offset = target as i64 - at as i64;
                self.emit32(base | encode_jump_offset(offset));
            }
            None => {
                self.labels[label.0].patches.push((at, PatchKind::Jump));
                self.emit32(base);
            }
        }
    }

    // Base integer instructions.

    pub fn lui(&mut self, rd: Reg, imm20: u32) {
        assert!(imm20 < (1 << 20));
        self.emit32(imm20 << 12 | (rd.0 as u32) << 7 | 0x37);
    }

    pub fn addi(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        self.emit32(itype(imm, rs1, 0b000, rd, 0x13));
    }

    pub fn addiw(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        self.emit32(itype(imm, rs1, 0b000, rd, 0x1b));
    }

    pub fn slli(&mut self, rd: Reg, rs1: Reg, shamt: u32) {
        assert!(shamt < 64);
        self.emit32(itype(shamt as i32, rs1, 0b001, rd, 0x13));
    }

    pub fn mv(&mut self, rd: Reg, rs: Reg) {
        self.addi(rd, rs, 0);
    }

    pub fn lw(&mut self, rd: Reg, imm: i32, rs1: Reg) {
        self.emit32(itype(imm, rs1, 0b010, rd, 0x03));
    }

    pub fn sw(&mut self, rs2: Reg, imm: i32, rs1: Reg) {
        self.emit32(stype(imm, rs2, rs1, 0b010));
    }

    pub fn sd(&mut self, rs2: Reg, imm: i32, rs1: Reg) {
        self.emit32(stype(imm, rs2, rs1, 0b011));
    }

    pub fn and_(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b111, rd, 0x33));
    }

    pub fn or_(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b110, rd, 0x33));
    }

    pub fn xor_(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b100, rd, 0x33));
    }

    // 32 bit arithmetic. Results are sign extended to 64 bits, which the BPF
    // translator relies on for its comparison invariant.

    pub fn addw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b000, rd, 0x3b));
    }

    pub fn subw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0100000, rs2, rs1, 0b000, rd, 0x3b));
    }

    pub fn negw(&mut self, rd: Reg, rs: Reg) {
        self.subw(rd, ZERO, rs);
    }

    pub fn mulw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000001, rs2, rs1, 0b000, rd, 0x3b));
    }

    pub fn divw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000001, rs2, rs1, 0b100, rd, 0x3b));
    }

    pub fn sllw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b001, rd, 0x3b));
    }

    pub fn srlw(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(rtype(0b0000000, rs2, rs1, 0b101, rd, 0x3b));
    }

    // Control transfer.

    pub fn beq(&mut self, rs1: Reg, rs2: Reg, label: Label) {
        self.branch_to(btype_base(rs2, rs1, 0b000), label);
    }

    pub fn bne(&mut self, rs1: Reg, rs2: Reg, label: Label) {
        self.branch_to(btype_base(rs2, rs1, 0b001), label);
    }

    pub fn bltu(&mut self, rs1: Reg, rs2: Reg, label: Label) {
        self.branch_to(btype_base(rs2, rs1, 0b110), label);
    }

    pub fn bgeu(&mut self, rs1: Reg, rs2: Reg, label: Label) {
        self.branch_to(btype_base(rs2, rs1, 0b111), label);
    }

    pub fn beqz(&mut self, rs: Reg, label: Label) {
        self.beq(rs, ZERO, label);
    }

    pub fn bnez(&mut self, rs: Reg, label: Label) {
        self.bne(rs, ZERO, label);
    }

    /// Unconditional jump, `jal x0`.
    pub fn j(&mut self, label: Label) {
        self.jump_to((ZERO.0 as u32) << 7 | 0x6f, label);
    }

    pub fn jalr(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        self.emit32(itype(imm, rs1, 0b000, rd, 0x67));
    }

    pub fn ecall(&mut self) {
        self.emit32(0x0000_0073);
    }

    /// A guaranteed illegal instruction word. Executing it raises SIGILL.
    pub fn unimp(&mut self) {
        self.emit32(0x0000_0000);
    }

    /// Materializes a 64 bit immediate, using the shortest of the usual
    /// `lui`/`addiw` and shift-accumulate sequences.
    pub fn li(&mut self, rd: Reg, imm: i64) {
        if imm as i32 as i64 == imm {
            let lo12 = ((imm << 52) >> 52) as i32;
            let hi20 = ((imm.wrapping_add(0x800) >> 12) & 0xfffff) as u32;
            if hi20 != 0 {
                self.lui(rd, hi20);
                if lo12 != 0 {
                    self.addiw(rd, rd, lo12);
                }
            } else {
                self.addi(rd, ZERO, lo12);
            }
            return;
        }

        let lo12 = (imm << 52) >> 52;
        let rest = imm.wrapping_sub(lo12) >> 12;
        self.li(rd, rest);
        self.slli(rd, rd, 12);
        if lo12 != 0 {
            self.addi(rd, rd, lo12 as i32);
        }
    }
}

fn itype(imm: i32, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> u32 {
    assert!((-2048..2048).contains(&imm) || (funct3 == 0b001 && (0..64).contains(&imm)));
    ((imm as u32) & 0xfff) << 20
        | (rs1.0 as u32) << 15
        | funct3 << 12
        | (rd.0 as u32) << 7
        | opcode
}

fn stype(imm: i32, rs2: Reg, rs1: Reg, funct3: u32) -> u32 {
    assert!((-2048..2048).contains(&imm));
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25
        | (rs2.0 as u32) << 20
        | (rs1.0 as u32) << 15
        | funct3 << 12
        | (imm & 0x1f) << 7
        | 0x23
}

fn rtype(funct7: u32, rs2: Reg, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> u32 {
    funct7 << 25
        | (rs2.0 as u32) << 20
        | (rs1.0 as u32) << 15
        | funct3 << 12
        | (rd.0 as u32) << 7
        | opcode
}

fn btype_base(rs2: Reg, rs1: Reg, funct3: u32) -> u32 {
    (rs2.0 as u32) << 20 | (rs1.0 as u32) << 15 | funct3 << 12 | 0x63
}

fn encode_branch_offset(offset: i64) -> u32 {
    assert!(offset % 2 == 0, "misaligned branch target");
    assert!(
        (-4096..4096).contains(&offset),
        "branch target out of range: {offset}"
    );
    let imm = offset as u32;
    (imm >> 12 & 1) << 31 | (imm >> 5 & 0x3f) << 25 | (imm >> 1 & 0xf) << 8 | (imm >> 11 & 1) << 7
}

fn encode_jump_offset(offset: i64) -> u32 {
    assert!(offset % 2 == 0, "misaligned jump target");
    assert!(
        (-(1 << 20)..(1 << 20)).contains(&offset),
        "jump target out of range: {offset}"
    );
    let imm = offset as u32;
    (imm >> 20 & 1) << 31 | (imm >> 1 & 0x3ff) << 21 | (imm >> 11 & 1) << 20 | (imm >> 12 & 0xff) << 12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_stack_adjustment() {
        // addi sp, sp, -64
        let mut asm = Assembler::new();
        asm.addi(SP, SP, -64);
        assert_eq!(asm.code(), 0xfc010113u32.to_le_bytes());
    }

    #[test]
    fn encodes_loads_and_stores() {
        let mut asm = Assembler::new();
        asm.lw(T4, 8, T6);
        asm.sw(T4, 12, SP);
        asm.sd(S2, 16, T6);
        let words: Vec<u32> = asm
            .code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // lw x29, 8(x31)
        assert_eq!(words[0], 0x008f_ae83);
        // sw x29, 12(x2)
        assert_eq!(words[1], 0x01d1_2623);
        // sd x18, 16(x31)
        assert_eq!(words[2], 0x012f_b823);
    }

    #[test]
    fn li_small_immediates() {
        let mut asm = Assembler::new();
        asm.li(A0, 9);
        // addi a0, x0, 9
        assert_eq!(asm.code(), 0x0090_0513u32.to_le_bytes());

        let mut asm = Assembler::new();
        asm.li(A0, -1);
        // addi a0, x0, -1
        assert_eq!(asm.code(), 0xfff0_0513u32.to_le_bytes());
    }

    #[test]
    fn li_lui_pairs() {
        // 0x12345678 = lui 0x12345; addiw 0x678
        let mut asm = Assembler::new();
        asm.li(A0, 0x1234_5678);
        let words: Vec<u32> = asm
            .code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![0x1234_5537, 0x6785_051b]);
    }

    #[test]
    fn li_round_trips_wide_values() {
        // Decode the emitted sequence with a tiny evaluator to make sure the
        // materialization algorithm lands on the requested constant.
        for value in [
            0i64,
            1,
            -1,
            0x7ff,
            -0x800,
            0x1234_5678,
            -0x1234_5678,
            0x8000_0000,
            0xdead_beef_cafe_babeu64 as i64,
            i64::MAX,
            i64::MIN,
            (crate::jit::filter_abort_address()) as i64,
        ] {
            let mut asm = Assembler::new();
            asm.li(A0, value);
            assert_eq!(evaluate_li(asm.code()), value, "value {value:#x}");
        }
    }

    fn evaluate_li(code: &[u8]) -> i64 {
        let mut acc: i64 = 0;
        for chunk in code.chunks(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            match word & 0x7f {
                0x37 => acc = ((word & 0xffff_f000) as i32) as i64,
                0x13 if word >> 12 & 0x7 == 0b001 => acc <<= word >> 20 & 0x3f,
                0x13 | 0x1b => {
                    let imm = ((word as i32) >> 20) as i64;
                    acc = acc.wrapping_add(imm);
                    if word & 0x7f == 0x1b {
                        acc = acc as i32 as i64;
                    }
                }
                other => panic!("unexpected opcode {other:#x} in li sequence"),
            }
        }
        acc
    }

    #[test]
    fn forward_branches_are_patched() {
        let mut asm = Assembler::new();
        let target = asm.new_label();
        asm.beq(A0, A1, target);
        asm.addi(A0, A0, 1);
        asm.bind(target);
        asm.addi(A0, A0, 2);
        let words: Vec<u32> = asm
            .into_code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // beq a0, a1, +8
        assert_eq!(words[0], 0x00b5_0463);
    }

    #[test]
    fn backward_jumps_encode_directly() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        asm.bind(top);
        asm.addi(A0, A0, -1);
        asm.j(top);
        let words: Vec<u32> = asm
            .into_code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // jal x0, -4
        assert_eq!(words[1], 0xffdf_f06f);
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn unbound_label_is_rejected() {
        let mut asm = Assembler::new();
        let label = asm.new_label();
        asm.j(label);
        let _ = asm.into_code();
    }
}
