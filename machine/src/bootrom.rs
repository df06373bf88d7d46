//! Recovery ROM synthesis.
//!
//! A checkpoint taken away from the reset vector cannot simply reuse
//! the original boot ROM: the low RAM image is replaced by a short
//! instruction sequence that rematerializes every architectural
//! register and CSR, repairs the CLINT, and finishes with DRET into the
//! checkpointed PC and privilege.
//!
//! The ROM occupies the 64 KiB low RAM: code from the reset vector at
//! 0x1000 upward, 64-bit literal data from 0x8000 upward. Each 64-bit
//! restore is an auipc/addi/ld triple against the data cursor.

use core::fmt;

use byteorder::{LittleEndian, WriteBytesExt};
use margay_cpu::{ArchState, Priv};

use crate::{BOOT_BASE_ADDR, CLINT_BASE_ADDR, LOW_RAM_SIZE, ROM_BASE_ADDR, RTC_FREQ_DIV};

const ROM_WORDS: usize = (LOW_RAM_SIZE / 4) as usize;
const CODE_START: usize = ((BOOT_BASE_ADDR - ROM_BASE_ADDR) / 4) as usize;
const DATA_START: usize = ROM_WORDS / 2;

/// The synthesized sequence outgrew the ROM region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomOverflow {
    pub code_pos: usize,
    pub data_pos: usize,
}

impl fmt::Display for RomOverflow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "recovery ROM overflow: code_pos={} data_pos={} (rom {} words)",
            self.code_pos, self.data_pos, ROM_WORDS
        )
    }
}

// Instruction constructors. Only the handful of shapes the recovery
// sequence needs.

fn create_csrrw(rs: usize, csrn: u32) -> u32 {
    0x1073 | ((csrn & 0xfff) << 20) | ((rs as u32 & 0x1f) << 15)
}

fn create_csrrs(rd: usize, csrn: u32) -> u32 {
    0x2073 | ((csrn & 0xfff) << 20) | ((rd as u32 & 0x1f) << 7)
}

fn create_auipc(rd: usize, addr: u32) -> u32 {
    // Compensate for the sign extension of the paired addi.
    let addr = if addr & 0x800 != 0 { addr + 0x800 } else { addr };
    0x17 | ((rd as u32 & 0x1f) << 7) | ((addr >> 12) << 12)
}

fn create_addi(rd: usize, addr: u32) -> u32 {
    0x13 | ((rd as u32 & 0x1f) << 7) | ((rd as u32 & 0x1f) << 15) | ((addr & 0xfff) << 20)
}

fn create_seti(rd: usize, data: u32) -> u32 {
    0x13 | ((rd as u32 & 0x1f) << 7) | ((data & 0xfff) << 20)
}

fn create_ld(rd: usize, rs1: usize) -> u32 {
    0x3 | ((rd as u32 & 0x1f) << 7) | (3 << 12) | ((rs1 as u32 & 0x1f) << 15)
}

fn create_sd(rs1: usize, rs2: usize) -> u32 {
    0x23 | ((rs2 as u32 & 0x1f) << 20) | (3 << 12) | ((rs1 as u32 & 0x1f) << 15)
}

fn create_fld(rd: usize, rs1: usize) -> u32 {
    0x7 | ((rd as u32 & 0x1f) << 7) | (3 << 12) | ((rs1 as u32 & 0x1f) << 15)
}

const DRET: u32 = 0x7b20_0073;

pub struct RomBuilder {
    rom: Vec<u32>,
    code_pos: usize,
    data_pos: usize,
}

impl RomBuilder {
    pub fn new() -> RomBuilder {
        RomBuilder { rom: vec![0; ROM_WORDS], code_pos: CODE_START, data_pos: DATA_START }
    }

    fn code(&mut self, w: u32) {
        if self.code_pos < self.rom.len() {
            self.rom[self.code_pos] = w;
        }
        self.code_pos += 1;
    }

    fn data64(&mut self, v: u64) -> u32 {
        // Byte offset from the *next* code word (the auipc) to the data.
        let off = 4 * (self.data_pos as i64 - self.code_pos as i64) as u32;
        if self.data_pos + 1 < self.rom.len() {
            self.rom[self.data_pos] = v as u32;
            self.rom[self.data_pos + 1] = (v >> 32) as u32;
        }
        self.data_pos += 2;
        off
    }

    /// Restore a small CSR through x1 with a 12-bit immediate.
    pub fn csr12(&mut self, csrn: u32, val: u16) {
        self.code(create_seti(1, val as u32 & 0xfff));
        self.code(create_csrrw(1, csrn));
    }

    /// Restore a full-width CSR through x1 and a ROM data word.
    pub fn csr64(&mut self, csrn: u32, val: u64) {
        let off = self.data64(val);
        self.code(create_auipc(1, off));
        self.code(create_addi(1, off));
        self.code(create_ld(1, 1));
        self.code(create_csrrw(1, csrn));
    }

    /// Load a 64-bit literal into an integer register.
    pub fn reg64(&mut self, rn: usize, val: u64) {
        let off = self.data64(val);
        self.code(create_auipc(rn, off));
        self.code(create_addi(rn, off));
        self.code(create_ld(rn, rn));
    }

    /// Load a 64-bit literal into an FP register (through x1).
    pub fn fpreg64(&mut self, rn: usize, val: u64) {
        let off = self.data64(val);
        self.code(create_auipc(1, off));
        self.code(create_addi(1, off));
        self.code(create_fld(rn, 1));
    }

    /// Emit a 64-bit store to a physical address (device repair),
    /// clobbering x1 (address) and x2 (value).
    pub fn io64(&mut self, addr: u64, val: u64) {
        let off = self.data64(addr);
        self.code(create_auipc(1, off));
        self.code(create_addi(1, off));
        self.code(create_ld(1, 1));

        let off = self.data64(val);
        self.code(create_auipc(2, off));
        self.code(create_addi(2, off));
        self.code(create_ld(2, 2));

        self.code(create_sd(1, 2));
    }

    pub fn raw(&mut self, w: u32) { self.code(w); }

    /// Finish: bounds-check the cursors and serialize little-endian.
    pub fn build(self) -> Result<Vec<u8>, RomOverflow> {
        if self.data_pos > ROM_WORDS || self.code_pos > DATA_START {
            return Err(RomOverflow { code_pos: self.code_pos, data_pos: self.data_pos });
        }
        let mut out = Vec::with_capacity(ROM_WORDS * 4);
        for w in &self.rom {
            // Vec<u8> writes cannot fail.
            out.write_u32::<LittleEndian>(*w).unwrap();
        }
        Ok(out)
    }
}

impl Default for RomBuilder {
    fn default() -> Self { RomBuilder::new() }
}

/// Emit the full recovery sequence for a checkpointed hart.
///
/// Ordering constraints, inherited from the consumer:
/// - dpc and dcsr first, so a failure mid-ROM still lands in debug
///   state;
/// - mstatus and misa early: restoring fflags with the FPU off would
///   trap;
/// - satp last, bracketed by a dscratch save/restore of x1, because it
///   changes the address space the ROM itself runs in;
/// - counters late so the ROM's own execution does not skew them
///   (dcsr.stopcount parks them until the final DRET).
pub fn build_recovery_rom(state: &ArchState, timecmp: u64) -> Result<Vec<u8>, RomOverflow> {
    let mut b = RomBuilder::new();

    b.csr64(0x7b1, state.pc); // dpc

    let prv = match state.privilege {
        Priv::User => 0,
        Priv::Supervisor => 1,
        Priv::Machine => 3,
    };
    // stopcount | stoptime | return privilege
    b.csr12(0x7b0, 0x600 | prv);

    // mstatus and misa before anything whose legality they control.
    b.csr64(0x300, state.mstatus);
    b.csr64(0x301, state.misa as u64 | (2 << 62));

    if state.fs != 0 {
        // With the FPU down these would raise illegal instruction.
        b.csr12(0x001, state.fflags as u16);
        b.csr12(0x002, state.frm as u16);
        b.csr12(0x003, (state.fflags | ((state.frm as u32) << 5)) as u16);
        for i in 0..32 {
            b.fpreg64(i, state.fp_reg[i]);
        }
    }

    for i in 3..32 {
        b.csr12(0xb00 + i as u32, 0); // reset mhpmcounter3..31
        b.csr64(0x320 + i as u32, state.mhpmevent[i]);
    }
    b.csr64(0x7a0, state.tselect as u64);

    b.csr64(0x302, state.medeleg as u64);
    b.csr64(0x303, state.mideleg as u64);
    b.csr64(0x304, state.mie as u64); // mie & sie
    b.csr64(0x305, state.mtvec);
    b.csr64(0x105, state.stvec);
    b.csr12(0x306, state.mcounteren as u16);
    b.csr12(0x106, state.scounteren as u16);

    b.csr64(0x340, state.mscratch);
    b.csr64(0x341, state.mepc);
    b.csr64(0x342, state.mcause);
    b.csr64(0x343, state.mtval);

    b.csr64(0x140, state.sscratch);
    b.csr64(0x141, state.sepc);
    b.csr64(0x142, state.scause);
    b.csr64(0x143, state.stval);

    b.csr64(0x344, state.mip as u64); // mip & sip

    for i in 3..32 {
        b.reg64(i, state.reg[i]);
    }

    // CLINT repair near the end to keep the skew small.
    log::debug!("recovery rom: timecmp={} rtc={}", timecmp, state.mcycle / RTC_FREQ_DIV);
    b.io64(CLINT_BASE_ADDR + 0x4000, timecmp);

    b.csr64(0xb02, state.minstret);
    b.csr64(0xb00, state.mcycle);

    for i in 1..3 {
        b.reg64(i, state.reg[i]);
    }

    // satp moves the address space out from under the ROM; keep x1 in
    // dscratch across it.
    b.raw(create_csrrw(1, 0x7b2));
    b.csr64(0x180, state.satp);
    b.raw(create_csrrs(1, 0x7b2));

    b.raw(DRET);

    b.build()
}
