// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control and status register file.
//!
//! CSR numbers encode their minimum privilege in bits 9:8 and
//! read-only-ness in bits 11:10 (`11` = read-only). mstatus is stored
//! with the FS field held apart and the SD bit computed on read.

use crate::hart::{Hart, MAX_TRIGGERS};
use crate::{Priv, irq::*};

// misa extension letters.
pub const MISA_A: u32 = 1 << 0;
pub const MISA_C: u32 = 1 << 2;
pub const MISA_D: u32 = 1 << 3;
pub const MISA_F: u32 = 1 << 5;
pub const MISA_I: u32 = 1 << 8;
pub const MISA_M: u32 = 1 << 12;
pub const MISA_Q: u32 = 1 << 16;
pub const MISA_S: u32 = 1 << 18;
pub const MISA_U: u32 = 1 << 20;

// mstatus fields.
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE_SHIFT: u32 = 5;
pub const MSTATUS_MPIE_SHIFT: u32 = 7;
pub const MSTATUS_SPP_SHIFT: u32 = 8;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_FS_SHIFT: u32 = 13;
pub const MSTATUS_UXL_SHIFT: u32 = 32;
pub const MSTATUS_SXL_SHIFT: u32 = 34;
pub const MSTATUS_SPIE: u64 = 1 << MSTATUS_SPIE_SHIFT;
pub const MSTATUS_MPIE: u64 = 1 << MSTATUS_MPIE_SHIFT;
pub const MSTATUS_SPP: u64 = 1 << MSTATUS_SPP_SHIFT;
pub const MSTATUS_MPP: u64 = 3 << MSTATUS_MPP_SHIFT;
pub const MSTATUS_FS: u64 = 3 << MSTATUS_FS_SHIFT;
pub const MSTATUS_XS: u64 = 3 << 15;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;
pub const MSTATUS_TVM: u64 = 1 << 20;
pub const MSTATUS_TW: u64 = 1 << 21;
pub const MSTATUS_TSR: u64 = 1 << 22;
pub const MSTATUS_UXL_MASK: u64 = 3 << MSTATUS_UXL_SHIFT;
pub const MSTATUS_SXL_MASK: u64 = 3 << MSTATUS_SXL_SHIFT;

pub const SSTATUS_MASK: u64 = MSTATUS_SIE
    | MSTATUS_SPIE
    | MSTATUS_SPP
    | MSTATUS_FS
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_UXL_MASK;

pub const MSTATUS_MASK: u64 = MSTATUS_SIE
    | MSTATUS_MIE
    | MSTATUS_SPIE
    | MSTATUS_MPIE
    | MSTATUS_SPP
    | MSTATUS_MPP
    | MSTATUS_FS
    | MSTATUS_MPRV
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_TVM
    | MSTATUS_TW
    | MSTATUS_TSR
    | MSTATUS_UXL_MASK
    | MSTATUS_SXL_MASK;

/// Cause-register write mask, not including the interrupt MSB.
pub const CAUSE_MASK: u64 = 0x1f;

/// cycle and instret enables only.
const COUNTEREN_MASK: u32 = (1 << 0) | (1 << 2);

/// No ASID bits implemented.
const SATP_MASK: u64 = (15 << 60) | ((1 << 44) - 1);

// Debug trigger match-control bits (subset).
const MCONTROL_M: u64 = 1 << 6;
const MCONTROL_EXECUTE: u64 = 1 << 2;

/// Outcome of a successful CSR write, telling the interpreter whether
/// translation state changed under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrEffect {
    None,
    /// TLBs were flushed (satp or MMU-relevant mstatus change); restart
    /// the fetch.
    TlbFlushed,
    /// The register base (XLEN) changed; the interpreter must re-enter.
    Restart,
}

// Validation CSR command encoding (vendor validation registers).
const VALIDATION_CMD_OFFSET: u32 = 56;
const VALIDATION_PAYLOAD_MASK: u64 = (1 << VALIDATION_CMD_OFFSET) - 1;
const VALIDATION_CMD_LINUX: u64 = 0x81;
const VALIDATION_CMD_BENCH: u64 = 0x82;

struct EventInfo {
    value: u64,
    name: &'static str,
    terminate: bool,
}

const VALIDATION_EVENTS: [EventInfo; 4] = [
    EventInfo { value: (VALIDATION_CMD_LINUX << 56) | 1, name: "linux-boot", terminate: true },
    EventInfo { value: (VALIDATION_CMD_LINUX << 56) | 2, name: "linux-terminate", terminate: true },
    EventInfo { value: (VALIDATION_CMD_BENCH << 56) | 1, name: "benchmark-start", terminate: true },
    EventInfo { value: (VALIDATION_CMD_BENCH << 56) | 2, name: "benchmark-end", terminate: true },
];

impl Hart {
    /// Compose the full mstatus value: stored bits, the live FS field,
    /// and the computed SD bit at the top of the current XLEN.
    pub(crate) fn mstatus_read(&self, mask: u64) -> u64 {
        let mut val = (self.mstatus | ((self.fs as u64) << MSTATUS_FS_SHIFT)) & mask;
        let sd = (val & MSTATUS_FS) == MSTATUS_FS || (val & MSTATUS_XS) == MSTATUS_XS;
        if sd {
            val |= 1 << (self.cur_xlen - 1);
        }
        val
    }

    pub(crate) fn mstatus_write(&mut self, val: u64) {
        // Flush the TLBs on any change of MMU-relevant configuration.
        let modified = self.mstatus ^ val;
        if modified & (MSTATUS_MPRV | MSTATUS_SUM | MSTATUS_MXR) != 0
            || (self.mstatus & MSTATUS_MPRV != 0 && modified & MSTATUS_MPP != 0)
        {
            self.tlb.flush_all();
        }
        self.fs = ((val >> MSTATUS_FS_SHIFT) & 3) as u8;

        let mask = MSTATUS_MASK & !MSTATUS_FS;
        self.mstatus = self.mstatus & !mask | val & mask;

        // UXL and SXL never change after reset.
        self.mstatus &= !(MSTATUS_UXL_MASK | MSTATUS_SXL_MASK);
        self.mstatus |= (2 << MSTATUS_UXL_SHIFT) | (2 << MSTATUS_SXL_SHIFT);
    }

    fn counter_access_ok(&self, csr: u32) -> bool {
        let counteren = match self.privilege {
            Priv::User => self.mcounteren & self.scounteren,
            Priv::Supervisor => self.mcounteren,
            Priv::Machine => !0,
        };
        (counteren >> (csr & 31)) & 1 != 0
    }

    /// Read a CSR. `will_write` marks accesses that will be followed by
    /// a write, so read-only registers can be rejected up front.
    /// Reads have no side effects.
    pub fn csr_read(&self, csr: u32, will_write: bool) -> Result<u64, ()> {
        if (csr & 0xc00) == 0xc00 && will_write {
            return Err(()); // read-only CSR
        }
        if (self.privilege.bits() as u32) < ((csr >> 8) & 3) {
            return Err(()); // not enough privilege
        }

        let val = match csr {
            0x001 => {
                // fflags
                if self.fs == 0 {
                    return Err(());
                }
                self.fflags as u64
            }
            0x002 => {
                if self.fs == 0 {
                    return Err(());
                }
                self.frm as u64
            }
            0x003 => {
                if self.fs == 0 {
                    return Err(());
                }
                (self.fflags | ((self.frm as u32) << 5)) as u64
            }
            0x100 => self.mstatus_read(SSTATUS_MASK),
            0x104 => (self.mie & self.mideleg) as u64, // sie
            0x105 => self.stvec,
            0x106 => self.scounteren as u64,
            0x140 => self.sscratch,
            0x141 => self.sepc,
            0x142 => self.scause,
            0x143 => self.stval,
            0x144 => (self.mip & self.mideleg) as u64, // sip
            0x180 => {
                if self.privilege == Priv::Supervisor && self.mstatus & MSTATUS_TVM != 0 {
                    return Err(());
                }
                self.satp
            }
            0x300 => self.mstatus_read(!0u64),
            0x301 => self.misa as u64 | ((self.mxl as u64) << (self.cur_xlen - 2)),
            0x302 => self.medeleg as u64,
            0x303 => self.mideleg as u64,
            0x304 => self.mie as u64,
            0x305 => self.mtvec,
            0x306 => self.mcounteren as u64,
            0x340 => self.mscratch,
            0x341 => self.mepc,
            0x342 => self.mcause,
            0x343 => self.mtval,
            0x344 => self.mip as u64,
            0x323..=0x33f => self.mhpmevent[(csr & 0x1f) as usize],
            0x7a0 => self.tselect as u64,
            0x7a1 => self.tdata1[self.tselect as usize],
            0x7a2 => self.tdata2[self.tselect as usize],
            0x7a3 => self.tdata3[self.tselect as usize],
            0x7b0 => self.dcsr,
            0x7b1 => self.dpc,
            0x7b2 => self.dscratch,
            0xb00 | 0xc00 => {
                if !self.counter_access_ok(csr) {
                    return Err(());
                }
                self.mcycle
            }
            0xb02 | 0xc02 => {
                if !self.counter_access_ok(csr) {
                    return Err(());
                }
                self.minstret
            }
            0xb03..=0xb1f | 0xc03..=0xc1f => {
                if !self.counter_access_ok(csr) {
                    return Err(());
                }
                0 // mhpmcounter3..31 stubs
            }
            0xb80 | 0xc80 => {
                if self.cur_xlen != 32 || !self.counter_access_ok(csr) {
                    return Err(());
                }
                self.mcycle >> 32
            }
            0xb82 | 0xc82 => {
                if self.cur_xlen != 32 || !self.counter_access_ok(csr) {
                    return Err(());
                }
                self.minstret >> 32
            }
            0xf11 => self.mvendorid,
            0xf12 => self.marchid,
            0xf13 => self.mimpid,
            0xf14 => self.mhartid,
            0x81f | 0x8d0 | 0x8d1 => 0, // vendor cache-flush / validation
            _ => {
                // The 'time' counter is emulated by the machine, so its
                // absence here is expected and not worth a diagnostic.
                if csr != 0xc01 && csr != 0xc81 {
                    log::debug!("csr_read: invalid CSR={:#05x}", csr);
                }
                return Err(());
            }
        };
        Ok(val)
    }

    /// Write a CSR. Illegal targets return `Err`; legal writes report
    /// whether translation state or the register base changed.
    pub fn csr_write(&mut self, csr: u32, val: u64) -> Result<CsrEffect, ()> {
        log::trace!("csr_write: csr={:#05x} val={:#018x}", csr, val);
        match csr {
            0x001 => {
                self.fflags = (val & 0x1f) as u32;
                self.fs = 3;
            }
            0x002 => {
                self.frm = (val & 7) as u8;
                self.fs = 3;
            }
            0x003 => {
                self.frm = ((val >> 5) & 7) as u8;
                self.fflags = (val & 0x1f) as u32;
                self.fs = 3;
            }
            0x100 => {
                // sstatus is a restricted view of mstatus
                let merged = self.mstatus & !SSTATUS_MASK | val & SSTATUS_MASK;
                self.mstatus_write(merged);
            }
            0x104 => {
                // sie touches only delegated bits
                let mask = self.mideleg;
                self.mie = self.mie & !mask | (val as u32) & mask;
            }
            0x105 => {
                // Vectored-mode bases are forced to 64-byte alignment,
                // matching the modeled core; bit 1 is reserved and
                // always cleared.
                let mut val = val;
                if val & 1 != 0 {
                    val &= !63 | 1;
                }
                self.stvec = val & !2;
            }
            0x106 => self.scounteren = (val as u32) & COUNTEREN_MASK,
            0x140 => self.sscratch = val,
            0x141 => self.sepc = val & self.epc_mask(),
            0x142 => self.scause = val & (CAUSE_MASK | 1 << (self.cur_xlen - 1)),
            0x143 => self.stval = val,
            0x144 => {
                let mask = self.mideleg;
                self.mip = self.mip & !mask | (val as u32) & mask;
            }
            0x180 => {
                if self.privilege == Priv::Supervisor && self.mstatus & MSTATUS_TVM != 0 {
                    return Err(());
                }
                let mode = (val >> 60) & 15;
                if mode == 0 || mode == 8 || mode == 9 {
                    self.satp = val & SATP_MASK;
                }
                // No ASID support: any satp write flushes everything.
                self.tlb.flush_all();
                return Ok(CsrEffect::TlbFlushed);
            }
            0x300 => self.mstatus_write(val),
            0x301 => {
                // Only the MXL field is honored; extensions are fixed.
                let new_mxl = ((val >> (self.cur_xlen - 2)) & 3) as u8;
                if (1..=2).contains(&new_mxl) && new_mxl != self.mxl {
                    // misa is only writable in M-mode, so cur_xlen
                    // follows mxl directly.
                    self.mxl = new_mxl;
                    self.cur_xlen = 1 << (new_mxl + 4);
                    return Ok(CsrEffect::Restart);
                }
            }
            0x302 => {
                let mask = 0xb109u32; // matching the reference cores
                self.medeleg = self.medeleg & !mask | (val as u32) & mask;
            }
            0x303 => {
                let mask = MIP_SSIP | MIP_STIP | MIP_SEIP;
                self.mideleg = self.mideleg & !mask | (val as u32) & mask;
            }
            0x304 => {
                let mask = MIP_MEIP | MIP_SEIP | MIP_MTIP | MIP_STIP | MIP_MSIP | MIP_SSIP;
                self.mie = self.mie & !mask | (val as u32) & mask;
            }
            0x305 => {
                let mut val = val;
                if val & 1 != 0 {
                    val &= !63 | 1;
                }
                self.mtvec = val & !2;
            }
            0x306 => self.mcounteren = (val as u32) & COUNTEREN_MASK,
            0x340 => self.mscratch = val,
            0x341 => self.mepc = val & self.epc_mask(),
            0x342 => self.mcause = val & (CAUSE_MASK | 1 << (self.cur_xlen - 1)),
            0x343 => self.mtval = val,
            0x344 => {
                // Only the supervisor bits are writable by software.
                let mask = MIP_SEIP | MIP_STIP | MIP_SSIP;
                self.mip = self.mip & !mask | (val as u32) & mask;
            }
            0x323..=0x33f => self.mhpmevent[(csr & 0x1f) as usize] = val,
            0x7a0 => self.tselect = (val % MAX_TRIGGERS as u64) as u32,
            0x7a1 => {
                // Only "no trigger" and mcontrol types are supported,
                // and software may only set the type field plus the M
                // and EXECUTE match-control bits.
                let ty = val >> (self.cur_xlen - 4);
                if ty == 0 || ty == 2 {
                    let mask = (15 << (self.cur_xlen - 4)) | MCONTROL_M | MCONTROL_EXECUTE;
                    let t = self.tselect as usize;
                    self.tdata1[t] = self.tdata1[t] & !mask | val & mask;
                }
            }
            0x7a2 => self.tdata2[self.tselect as usize] = val,
            0x7a3 => self.tdata3[self.tselect as usize] = val,
            0x7b0 => {
                // Just enough of debug mode to restore a snapshot and
                // park the counters: stopcount/stoptime and the return
                // privilege.
                let mask = 0x603;
                self.dcsr = self.dcsr & !mask | val & mask;
                self.stop_the_counter = self.dcsr & 0x600 != 0;
            }
            0x7b1 => self.dpc = val & self.epc_mask(),
            0x7b2 => self.dscratch = val,
            0x81f => {} // vendor cache-flush: accepted, ignored
            0x8d0 => self.write_validation0(val),
            0x8d1 => self.write_validation1(val),
            0xb00 => self.mcycle = val,
            0xb02 => self.minstret = val,
            0xb03..=0xb1f => {} // mhpmcounter writes accepted, ignored
            0xb80 => {
                if self.cur_xlen != 32 {
                    return Err(());
                }
                self.mcycle = self.mcycle as u32 as u64 | val << 32;
            }
            0xb82 => {
                if self.cur_xlen != 32 {
                    return Err(());
                }
                self.minstret = self.minstret as u32 as u64 | val << 32;
            }
            _ => {
                log::debug!("csr_write: invalid CSR={:#05x}", csr);
                return Err(());
            }
        }
        Ok(CsrEffect::None)
    }

    /// xepc/dpc alignment: bit 0 is always forced clear; bits 1:0
    /// without the C extension.
    fn epc_mask(&self) -> u64 {
        if self.misa & MISA_C != 0 {
            !1
        } else {
            !3
        }
    }

    fn write_validation0(&mut self, val: u64) {
        match val >> 12 {
            0xdead0 => log::info!("validation begin code={:#x}", val & 0xfff),
            0x1feed => {
                log::info!("validation PASS code={:#x}", val & 0xfff);
                self.terminate = true;
            }
            0x50bad => {
                log::info!("validation FAIL code={:#x}", val & 0xfff);
                self.terminate = true;
            }
            cmd => log::warn!("validation0: unknown command={:#x} code={:#x}", cmd, val & 0xfff),
        }
    }

    fn write_validation1(&mut self, val: u64) {
        if val < 256 {
            // Bare byte: console output through the injected sink.
            self.console.put_char(val as u8);
            return;
        }

        let payload = val & VALIDATION_PAYLOAD_MASK;
        match val >> VALIDATION_CMD_OFFSET {
            VALIDATION_CMD_LINUX => {
                if payload == 0 || payload > 2 {
                    log::warn!("unknown linux validation command={:#x}", payload);
                }
            }
            VALIDATION_CMD_BENCH => {
                if payload == 0 || payload > 2 {
                    log::warn!("unknown benchmark validation command={:#x}", payload);
                }
            }
            cmd => log::warn!("unknown validation1 command={:#x}", cmd),
        }

        for ev in &VALIDATION_EVENTS {
            if val == ev.value
                && ev.terminate
                && self.config.terminating_event.as_deref() == Some(ev.name)
            {
                self.terminate = true;
                log::info!(
                    "terminating validation event {} encountered; instructions committed: {}",
                    ev.name,
                    self.minstret
                );
                break;
            }
        }
    }
}
