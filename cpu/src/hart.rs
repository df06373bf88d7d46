// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hart state.
//!
//! One [`Hart`] holds the full architectural state plus the
//! simulator-internal bookkeeping: TLBs, the physical memory map,
//! co-simulation provenance and the control-flow hint of the last
//! retired control transfer. It is created once at reset and mutated
//! only by the interpreter, the trap unit, CSR writes and the external
//! MIP setters.

use core::fmt;

use crate::csr::{self, MSTATUS_MPP_SHIFT, MSTATUS_SXL_SHIFT, MSTATUS_UXL_SHIFT};
use crate::mem::{ConsoleSink, MemoryMap, StdoutConsole};
use crate::tlb::Tlb;
use crate::{interp, CtfInfo, Priv};

pub const MAX_TRIGGERS: usize = 1;

/// Runtime knobs. The original made these compile-time switches; they
/// are per-hart configuration here so the test suite can exercise both
/// sides.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Emulate misaligned loads/stores instead of trapping.
    pub allow_misaligned: bool,
    /// Set PTE A/D bits during the walk and write them back, instead of
    /// faulting on A=0 (or D=0 for stores).
    pub hw_managed_ad: bool,
    /// Name of a validation event that terminates the simulation when a
    /// guest write to the validation CSR matches it.
    pub terminating_event: Option<String>,
}

pub struct Hart {
    pub(crate) pc: u64,
    pub(crate) reg: [u64; 32],
    // Co-simulation needs the value of a register prior to the
    // instruction that last wrote it, and the retire timestamp of that
    // write.
    pub(crate) reg_prior: [u64; 32],
    pub(crate) reg_ts: [u64; 32],
    pub(crate) most_recently_written_reg: Option<usize>,

    pub(crate) fp_reg: [u64; 32],
    pub(crate) fp_reg_ts: [u64; 32],
    pub(crate) most_recently_written_fp_reg: Option<usize>,
    pub(crate) fflags: u32,
    pub(crate) frm: u8,

    pub(crate) cur_xlen: u32,
    pub(crate) privilege: Priv,
    /// mstatus.FS, held apart from the mstatus word.
    pub(crate) fs: u8,
    /// MXL field of misa.
    pub(crate) mxl: u8,

    pub(crate) insn_counter: u64,
    pub(crate) minstret: u64,
    pub(crate) mcycle: u64,
    /// Debug mode parks the counters between checkpoint restore and DRET.
    pub(crate) stop_the_counter: bool,

    /// Core is idle in WFI awaiting an interrupt. Does not mean the
    /// simulation should end.
    pub(crate) power_down: bool,
    pub(crate) terminate: bool,

    pub(crate) mstatus: u64,
    pub(crate) mtvec: u64,
    pub(crate) mscratch: u64,
    pub(crate) mepc: u64,
    pub(crate) mcause: u64,
    pub(crate) mtval: u64,
    pub(crate) mvendorid: u64,
    pub(crate) marchid: u64,
    pub(crate) mimpid: u64,
    pub(crate) mhartid: u64,
    pub(crate) misa: u32,
    pub(crate) mie: u32,
    pub(crate) mip: u32,
    pub(crate) medeleg: u32,
    pub(crate) mideleg: u32,
    pub(crate) mcounteren: u32,
    pub(crate) tselect: u32,
    pub(crate) tdata1: [u64; MAX_TRIGGERS],
    pub(crate) tdata2: [u64; MAX_TRIGGERS],
    pub(crate) tdata3: [u64; MAX_TRIGGERS],
    pub(crate) mhpmevent: [u64; 32],

    pub(crate) stvec: u64,
    pub(crate) sscratch: u64,
    pub(crate) sepc: u64,
    pub(crate) scause: u64,
    pub(crate) stval: u64,
    pub(crate) satp: u64,
    pub(crate) scounteren: u32,

    pub(crate) dcsr: u64,
    pub(crate) dpc: u64,
    pub(crate) dscratch: u64,

    /// LR reservation address, if one is live.
    pub(crate) load_res: Option<u64>,

    pub(crate) mem_map: MemoryMap,
    pub(crate) tlb: Tlb,

    /// Classification of the last retired control transfer, for trace
    /// consumers. Only meaningful when the instruction was one.
    pub(crate) ctf_info: CtfInfo,
    pub(crate) next_addr: u64,

    /// Where validation-register console bytes go.
    pub(crate) console: Box<dyn ConsoleSink>,

    pub(crate) config: CoreConfig,
}

impl Hart {
    /// Create a hart at reset: M-mode, XLEN 64, PC at the ROM entry the
    /// machine passes in, misa = RV64IMAFDC + S + U.
    pub fn new(mem_map: MemoryMap, reset_pc: u64, config: CoreConfig) -> Hart {
        let mxl = 2u8; // RV64
        let misa = csr::MISA_I
            | csr::MISA_M
            | csr::MISA_A
            | csr::MISA_F
            | csr::MISA_D
            | csr::MISA_C
            | csr::MISA_S
            | csr::MISA_U;
        Hart {
            pc: reset_pc,
            reg: [0; 32],
            reg_prior: [0; 32],
            reg_ts: [0; 32],
            most_recently_written_reg: None,
            fp_reg: [0; 32],
            fp_reg_ts: [0; 32],
            most_recently_written_fp_reg: None,
            fflags: 0,
            frm: 0,
            cur_xlen: 64,
            privilege: Priv::Machine,
            fs: 0,
            mxl,
            insn_counter: 0,
            minstret: 0,
            mcycle: 0,
            stop_the_counter: false,
            power_down: false,
            terminate: false,
            mstatus: ((mxl as u64) << MSTATUS_UXL_SHIFT)
                | ((mxl as u64) << MSTATUS_SXL_SHIFT)
                | (3 << MSTATUS_MPP_SHIFT),
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            // JEDEC-style vendor id and architecture id of the modeled
            // core; impid 1, single hart 0.
            mvendorid: 11 * 128 + 101,
            marchid: (1 << 63) | 2,
            mimpid: 1,
            mhartid: 0,
            misa,
            mie: 0,
            mip: 0,
            medeleg: 0,
            mideleg: 0,
            mcounteren: 0,
            tselect: 0,
            tdata1: [!0; MAX_TRIGGERS],
            tdata2: [!0; MAX_TRIGGERS],
            tdata3: [0; MAX_TRIGGERS],
            mhpmevent: [0; 32],
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            satp: 0,
            scounteren: 0,
            dcsr: 0,
            dpc: 0,
            dscratch: 0,
            load_res: None,
            mem_map,
            tlb: Tlb::new(),
            ctf_info: CtfInfo::None,
            next_addr: 0,
            console: Box::new(StdoutConsole),
            config,
        }
    }

    /// Execute up to `budget` instructions; returns the number retired.
    pub fn run(&mut self, budget: u64) -> u64 { interp::run(self, budget) }

    #[inline]
    pub(crate) fn write_reg(&mut self, rd: usize, val: u64) {
        // x0 is hard-wired zero; discarded writes leave no provenance.
        if rd != 0 {
            self.most_recently_written_reg = Some(rd);
            self.reg_ts[rd] = self.insn_counter;
            self.reg_prior[rd] = self.reg[rd];
            self.reg[rd] = val;
        }
    }

    #[inline]
    pub(crate) fn read_reg(&self, r: usize) -> u64 { self.reg[r] }

    #[inline]
    pub(crate) fn write_fp_reg(&mut self, rd: usize, val: u64) {
        self.most_recently_written_fp_reg = Some(rd);
        self.fp_reg_ts[rd] = self.insn_counter;
        self.fp_reg[rd] = val;
        self.fs = 3;
    }

    #[inline]
    pub(crate) fn read_fp_reg(&self, r: usize) -> u64 { self.fp_reg[r] }

    // --- External interface used by the machine and the co-simulation
    // --- driver.

    pub fn pc(&self) -> u64 { self.pc }

    /// PC writes mask the low bit (low two bits without C).
    pub fn set_pc(&mut self, val: u64) {
        self.pc = val & if self.misa & csr::MISA_C != 0 { !1 } else { !3 };
    }

    pub fn reg(&self, rn: usize) -> u64 { self.reg[rn] }

    pub fn reg_previous(&self, rn: usize) -> u64 { self.reg_prior[rn] }

    pub fn set_reg(&mut self, rn: usize, val: u64) {
        assert!(rn > 0 && rn < 32);
        self.reg[rn] = val;
    }

    pub fn fp_reg(&self, rn: usize) -> u64 { self.fp_reg[rn] }

    pub fn set_fp_reg(&mut self, rn: usize, val: u64) { self.fp_reg[rn] = val; }

    pub fn privilege(&self) -> Priv { self.privilege }

    pub fn misa(&self) -> u32 { self.misa }

    pub fn insn_counter(&self) -> u64 { self.insn_counter }

    pub fn cycles(&self) -> u64 { self.mcycle }

    pub fn set_mip(&mut self, mask: u32) {
        self.mip |= mask;
        // Wake from WFI once something becomes pending.
        if self.power_down && self.mip & self.mie != 0 {
            self.power_down = false;
        }
    }

    pub fn reset_mip(&mut self, mask: u32) { self.mip &= !mask; }

    pub fn mip(&self) -> u32 { self.mip }

    pub fn mie(&self) -> u32 { self.mie }

    pub fn power_down(&self) -> bool { self.power_down }

    pub fn terminated(&self) -> bool { self.terminate }

    pub fn set_terminate(&mut self) { self.terminate = true; }

    pub fn mem_map(&self) -> &MemoryMap { &self.mem_map }

    pub fn mem_map_mut(&mut self) -> &mut MemoryMap { &mut self.mem_map }

    /// Redirect the validation-register console channel.
    pub fn set_console(&mut self, console: Box<dyn ConsoleSink>) { self.console = console; }

    pub fn config(&self) -> &CoreConfig { &self.config }

    /// Most recently written integer register and the retire timestamp
    /// of that write.
    pub fn most_recently_written_reg(&self) -> Option<(usize, u64)> {
        self.most_recently_written_reg.map(|r| (r, self.reg_ts[r]))
    }

    pub fn most_recently_written_fp_reg(&self) -> Option<(usize, u64)> {
        self.most_recently_written_fp_reg.map(|r| (r, self.fp_reg_ts[r]))
    }

    /// Control-flow hint of the last retired instruction, with the
    /// transfer target. Only valid when the instruction was a control
    /// transfer.
    pub fn ctf_info(&self) -> (CtfInfo, u64) { (self.ctf_info, self.next_addr) }

    /// Sync the shadow register state after the co-simulation checker
    /// accepted an instruction.
    pub fn sync_cosim_regs(&mut self) {
        for i in 1..32 {
            self.reg_prior[i] = self.reg[i];
        }
    }

    /// Repair a counter CSR (and the destination register of the read
    /// that observed it) from the co-simulation master.
    pub fn repair_csr(&mut self, reg_num: usize, csr_num: u32, csr_val: u64) {
        match csr_num & 0xfff {
            0xb00 | 0xc00 => {
                self.mcycle = csr_val;
                self.reg[reg_num] = csr_val;
            }
            0xb02 | 0xc02 => {
                self.minstret = csr_val;
                self.reg[reg_num] = csr_val;
            }
            _ => {
                log::warn!("repair_csr: unsupported CSR {:#x}", csr_num);
            }
        }
    }

    /// Host observer rewrote RAM: drop any write TLB entry pointing into
    /// the range so the next store retranslates.
    pub fn flush_tlb_write_range_ram(&mut self, ram_ptr: *const u8, ram_size: usize) {
        self.tlb.flush_write_range(ram_ptr, ram_size);
    }

    /// Snapshot the architectural state for serialization.
    pub fn arch_state(&self) -> ArchState {
        ArchState {
            pc: self.pc,
            reg: self.reg,
            fp_reg: self.fp_reg,
            fflags: self.fflags,
            frm: self.frm,
            privilege: self.privilege,
            fs: self.fs,
            insn_counter: self.insn_counter,
            minstret: self.minstret,
            mcycle: self.mcycle,
            mstatus: self.mstatus_read(!0u64),
            mtvec: self.mtvec,
            mscratch: self.mscratch,
            mepc: self.mepc,
            mcause: self.mcause,
            mtval: self.mtval,
            misa: self.misa,
            mie: self.mie,
            mip: self.mip,
            medeleg: self.medeleg,
            mideleg: self.mideleg,
            mcounteren: self.mcounteren,
            tselect: self.tselect,
            tdata1: self.tdata1[0],
            tdata2: self.tdata2[0],
            tdata3: self.tdata3[0],
            mhpmevent: self.mhpmevent,
            stvec: self.stvec,
            sscratch: self.sscratch,
            sepc: self.sepc,
            scause: self.scause,
            stval: self.stval,
            satp: self.satp,
            scounteren: self.scounteren,
            dcsr: self.dcsr,
            dpc: self.dpc,
            dscratch: self.dscratch,
        }
    }

    /// Re-apply a snapshot to a fresh hart. Translation caches and any
    /// live reservation are discarded; the current XLEN is re-derived.
    pub fn restore_arch_state(&mut self, s: &ArchState) {
        self.pc = s.pc;
        self.reg = s.reg;
        self.fp_reg = s.fp_reg;
        self.fflags = s.fflags & 0x1f;
        self.frm = s.frm & 7;
        self.insn_counter = s.insn_counter;
        self.minstret = s.minstret;
        self.mcycle = s.mcycle;
        // mstatus_write pulls FS apart and repins UXL/SXL.
        self.mstatus_write(s.mstatus);
        self.fs = s.fs;
        self.mtvec = s.mtvec;
        self.mscratch = s.mscratch;
        self.mepc = s.mepc;
        self.mcause = s.mcause;
        self.mtval = s.mtval;
        self.misa = s.misa;
        self.mie = s.mie;
        self.mip = s.mip;
        self.medeleg = s.medeleg;
        self.mideleg = s.mideleg;
        self.mcounteren = s.mcounteren;
        self.tselect = s.tselect;
        self.tdata1[0] = s.tdata1;
        self.tdata2[0] = s.tdata2;
        self.tdata3[0] = s.tdata3;
        self.mhpmevent = s.mhpmevent;
        self.stvec = s.stvec;
        self.sscratch = s.sscratch;
        self.sepc = s.sepc;
        self.scause = s.scause;
        self.stval = s.stval;
        self.satp = s.satp;
        self.scounteren = s.scounteren;
        self.dcsr = s.dcsr;
        self.dpc = s.dpc;
        self.dscratch = s.dscratch;
        self.privilege = s.privilege;
        self.cur_xlen = 64;
        self.load_res = None;
        self.power_down = false;
        self.tlb.flush_all();
    }
}

/// Everything a checkpoint has to carry for the hart itself. The
/// memory images travel separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchState {
    pub pc: u64,
    pub reg: [u64; 32],
    pub fp_reg: [u64; 32],
    pub fflags: u32,
    pub frm: u8,
    pub privilege: Priv,
    pub fs: u8,
    pub insn_counter: u64,
    pub minstret: u64,
    pub mcycle: u64,
    pub mstatus: u64,
    pub mtvec: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub misa: u32,
    pub mie: u32,
    pub mip: u32,
    pub medeleg: u32,
    pub mideleg: u32,
    pub mcounteren: u32,
    pub tselect: u32,
    pub tdata1: u64,
    pub tdata2: u64,
    pub tdata3: u64,
    pub mhpmevent: [u64; 32],
    pub stvec: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub satp: u64,
    pub scounteren: u32,
    pub dcsr: u64,
    pub dpc: u64,
    pub dscratch: u64,
}

pub(crate) const REG_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

impl fmt::Display for Hart {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pc ={:016x} ", self.pc)?;
        for i in 1..32 {
            write!(f, "{:<3}={:016x}", REG_NAMES[i], self.reg[i])?;
            if i % 4 == 3 {
                writeln!(f)?;
            } else {
                write!(f, " ")?;
            }
        }
        writeln!(
            f,
            "priv={} mstatus={:016x} insn_counter={} minstret={} mcycle={}",
            self.privilege.letter(),
            self.mstatus_read(!0u64),
            self.insn_counter,
            self.minstret,
            self.mcycle
        )?;
        writeln!(
            f,
            "mideleg={:016x} mie={:016x} mip={:016x}",
            self.mideleg, self.mie, self.mip
        )
    }
}
