// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trap and interrupt delivery.
//!
//! Exceptions and interrupts funnel through [`Hart::trap_entry`]:
//! delegation is decided against medeleg/mideleg, the prior state is
//! snapshotted into xPIE/xPP, and the PC is redirected through xtvec.
//! The xRET family undoes the same bookkeeping.

use core::fmt;

use crate::csr::{
    CAUSE_MASK, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPIE_SHIFT, MSTATUS_MPP, MSTATUS_MPP_SHIFT,
    MSTATUS_SIE, MSTATUS_SPIE, MSTATUS_SPIE_SHIFT, MSTATUS_SPP, MSTATUS_SPP_SHIFT,
    MSTATUS_SXL_SHIFT, MSTATUS_UXL_SHIFT,
};
use crate::hart::Hart;
use crate::Priv;

/// Synchronous exception causes, numbered per the privileged spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    MisalignedFetch = 0,
    FaultFetch = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    MisalignedLoad = 4,
    FaultLoad = 5,
    MisalignedStore = 6,
    FaultStore = 7,
    UserEcall = 8,
    SupervisorEcall = 9,
    MachineEcall = 11,
    FetchPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl Exception {
    pub fn code(self) -> u32 { self as u32 }

    /// The ecall cause for the given privilege (8 + level).
    pub fn ecall_from(privilege: Priv) -> Exception {
        match privilege {
            Priv::User => Exception::UserEcall,
            Priv::Supervisor => Exception::SupervisorEcall,
            Priv::Machine => Exception::MachineEcall,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Exception::MisalignedFetch => "misaligned fetch",
            Exception::FaultFetch => "fetch fault",
            Exception::IllegalInstruction => "illegal instruction",
            Exception::Breakpoint => "breakpoint",
            Exception::MisalignedLoad => "misaligned load",
            Exception::FaultLoad => "load fault",
            Exception::MisalignedStore => "misaligned store",
            Exception::FaultStore => "store fault",
            Exception::UserEcall => "ecall from U-mode",
            Exception::SupervisorEcall => "ecall from S-mode",
            Exception::MachineEcall => "ecall from M-mode",
            Exception::FetchPageFault => "fetch page fault",
            Exception::LoadPageFault => "load page fault",
            Exception::StorePageFault => "store page fault",
        };
        write!(f, "{}", s)
    }
}

/// A raised-but-not-yet-delivered exception: the compact result the
/// memory and translation helpers hand back to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub cause: Exception,
    pub tval: u64,
}

impl Trap {
    pub fn new(cause: Exception, tval: u64) -> Trap { Trap { cause, tval } }
}

impl Hart {
    /// Change the privilege level. Any actual transition flushes the
    /// TLBs and re-derives the current XLEN from mstatus.
    pub(crate) fn set_priv(&mut self, new: Priv) {
        if self.privilege != new {
            self.tlb.flush_all();
            // A context switch also tears down any LR reservation.
            self.load_res = None;
            let mxl = match new {
                Priv::Supervisor => (self.mstatus >> MSTATUS_SXL_SHIFT) & 3,
                Priv::User => (self.mstatus >> MSTATUS_UXL_SHIFT) & 3,
                Priv::Machine => self.mxl as u64,
            };
            self.cur_xlen = 1 << (4 + mxl);
            self.privilege = new;
        }
    }

    /// Common trap entry for exceptions and interrupts. `cause` is the
    /// cause number without the interrupt MSB.
    pub(crate) fn trap_entry(&mut self, cause: u32, is_interrupt: bool, tval: u64) {
        // A trap tears down any live LR reservation.
        self.load_res = None;

        let deleg = if self.privilege <= Priv::Supervisor {
            if is_interrupt {
                (self.mideleg >> (cause & 31)) & 1 != 0
            } else {
                (self.medeleg >> cause) & 1 != 0
            }
        } else {
            false
        };

        let mut causel = cause as u64 & CAUSE_MASK;
        if is_interrupt {
            causel |= 1 << (self.cur_xlen - 1);
        }

        let prev = self.privilege;
        if deleg {
            self.scause = causel;
            self.sepc = self.pc;
            self.stval = tval;
            self.mstatus = (self.mstatus & !MSTATUS_SPIE)
                | (((self.mstatus & MSTATUS_SIE != 0) as u64) << MSTATUS_SPIE_SHIFT);
            self.mstatus = (self.mstatus & !MSTATUS_SPP) | (prev.bits() << MSTATUS_SPP_SHIFT);
            self.mstatus &= !MSTATUS_SIE;
            self.set_priv(Priv::Supervisor);
            self.pc = if self.stvec & 1 != 0 && is_interrupt {
                (self.stvec & !3) + 4 * (cause as u64 & CAUSE_MASK)
            } else {
                self.stvec & !3
            };
        } else {
            self.mcause = causel;
            self.mepc = self.pc;
            self.mtval = tval;
            // Trap from privilege y into x: xPIE = xIE, xIE = 0,
            // xPP = y. Here x = M.
            self.mstatus = (self.mstatus & !MSTATUS_MPIE)
                | (((self.mstatus & MSTATUS_MIE != 0) as u64) << MSTATUS_MPIE_SHIFT);
            self.mstatus = (self.mstatus & !MSTATUS_MPP) | (prev.bits() << MSTATUS_MPP_SHIFT);
            self.mstatus &= !MSTATUS_MIE;
            self.set_priv(Priv::Machine);
            self.pc = if self.mtvec & 1 != 0 && is_interrupt {
                (self.mtvec & !3) + 4 * (cause as u64 & CAUSE_MASK)
            } else {
                self.mtvec & !3
            };
        }
    }

    pub(crate) fn raise_exception(&mut self, trap: Trap) {
        log::trace!("exception {} epc={:#018x} tval={:#018x}", trap.cause, self.pc, trap.tval);
        self.trap_entry(trap.cause.code(), false, trap.tval);
    }

    /// Interrupts the current privilege is willing to take right now.
    pub(crate) fn pending_interrupt_mask(&self) -> u32 {
        let pending = self.mip & self.mie;
        if pending == 0 {
            return 0;
        }
        let enabled = match self.privilege {
            Priv::Machine => {
                if self.mstatus & MSTATUS_MIE != 0 {
                    !self.mideleg
                } else {
                    0
                }
            }
            Priv::Supervisor => {
                let mut e = !self.mideleg;
                if self.mstatus & MSTATUS_SIE != 0 {
                    e |= self.mideleg;
                }
                e
            }
            Priv::User => !0,
        };
        pending & enabled
    }

    /// Take the lowest-numbered allowed interrupt, if any.
    pub(crate) fn raise_interrupt(&mut self) -> bool {
        let mask = self.pending_interrupt_mask();
        if mask == 0 {
            return false;
        }
        let irq = mask.trailing_zeros();
        log::trace!("interrupt irq={} priv={:?} pc={:#018x}", irq, self.privilege, self.pc);
        self.trap_entry(irq, true, 0);
        true
    }

    pub(crate) fn handle_sret(&mut self) {
        // Copy SPIE down into SIE and set SPIE.
        self.mstatus &= !MSTATUS_SIE;
        self.mstatus |= (self.mstatus >> 4) & MSTATUS_SIE;
        self.mstatus |= MSTATUS_SPIE;

        let spp = (self.mstatus & MSTATUS_SPP) >> MSTATUS_SPP_SHIFT;
        self.mstatus &= !MSTATUS_SPP;

        // SPP is one bit: only U or S.
        self.set_priv(Priv::from_bits(spp).unwrap_or(Priv::User));
        self.pc = self.sepc;
    }

    pub(crate) fn handle_mret(&mut self) {
        self.mstatus &= !MSTATUS_MIE;
        self.mstatus |= (self.mstatus >> 4) & MSTATUS_MIE;
        self.mstatus |= MSTATUS_MPIE;

        let mpp = (self.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT;
        self.mstatus &= !MSTATUS_MPP;

        let target = Priv::from_bits(mpp).unwrap_or_else(|| {
            log::warn!("mret with reserved MPP={}", mpp);
            Priv::User
        });
        self.set_priv(target);
        self.pc = self.mepc;
    }

    pub(crate) fn handle_dret(&mut self) {
        // Leaving debug mode restarts the counters.
        self.stop_the_counter = false;
        let prv = self.dcsr & 3;
        let target = Priv::from_bits(prv).unwrap_or_else(|| {
            log::warn!("dret with reserved dcsr.prv={}", prv);
            Priv::User
        });
        self.set_priv(target);
        self.pc = self.dpc;
    }
}
