// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RV64GC hart model.
//!
//! This crate is the CPU core of the margay full-system simulator: the
//! fetch-decode-execute loop, the Sv39/Sv48 address translator with its
//! TLBs, the CSR file and the trap/interrupt delivery logic. The
//! surrounding machine (device complex, checkpointing) lives in
//! `margay-machine` and talks to the core through [`MemoryMap`] device
//! registration and the MIP setter interface on [`Hart`].

#[macro_use]
extern crate bitflags;

pub mod csr;
mod fpu;
pub mod hart;
mod interp;
pub mod mem;
pub mod mmu;
pub mod tlb;
pub mod trap;

pub use csr::CsrEffect;
pub use hart::{ArchState, CoreConfig, Hart};
pub use mem::{ConsoleSink, IoContext, MemoryMap, MmioDevice, StdoutConsole, WidthMask};
pub use trap::{Exception, Trap};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Privilege levels. Hypervisor (2) is reserved and never entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priv {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl Priv {
    pub fn from_bits(bits: u64) -> Option<Priv> {
        match bits & 3 {
            0 => Some(Priv::User),
            1 => Some(Priv::Supervisor),
            3 => Some(Priv::Machine),
            _ => None,
        }
    }

    pub fn bits(self) -> u64 { self as u64 }

    /// Single-letter form used in register dumps and checkpoint files.
    pub fn letter(self) -> char {
        match self {
            Priv::User => 'U',
            Priv::Supervisor => 'S',
            Priv::Machine => 'M',
        }
    }
}

/// Machine-level interrupt bits (positions in mip/mie).
pub mod irq {
    pub const MIP_SSIP: u32 = 1 << 1;
    pub const MIP_MSIP: u32 = 1 << 3;
    pub const MIP_STIP: u32 = 1 << 5;
    pub const MIP_MTIP: u32 = 1 << 7;
    pub const MIP_SEIP: u32 = 1 << 9;
    pub const MIP_MEIP: u32 = 1 << 11;
}

/// Control-transfer classification for trace consumers, computed for
/// every taken branch, jump and JALR using the standard rd/rs1 link
/// register heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtfInfo {
    None,
    TakenBranch,
    TakenJump,
    TakenJal,
    TakenJalr,
    TakenJalrPop,
    TakenJalrPush,
    TakenJalrPopPush,
}

impl core::fmt::Display for CtfInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let s = match self {
            CtfInfo::None => "none",
            CtfInfo::TakenBranch => "taken branch",
            CtfInfo::TakenJump => "taken jump",
            CtfInfo::TakenJal => "direct call",
            CtfInfo::TakenJalr => "indirect jump",
            CtfInfo::TakenJalrPop => "indirect return",
            CtfInfo::TakenJalrPush => "indirect call",
            CtfInfo::TakenJalrPopPush => "return-and-call",
        };
        write!(f, "{}", s)
    }
}

/// Classify a taken JALR. `rd`/`rs1` link-ness selects between plain
/// jump, call, return and the combined pop-push form; the pop-push form
/// with `rs1 == rd` is promoted to a plain push.
pub(crate) fn ctf_compute_hint(rd: usize, rs1: usize) -> CtfInfo {
    let rd_link = rd == 1 || rd == 5;
    let rs1_link = rs1 == 1 || rs1 == 5;
    match (rd_link, rs1_link) {
        (false, false) => CtfInfo::TakenJalr,
        (false, true) => CtfInfo::TakenJalrPop,
        (true, false) => CtfInfo::TakenJalrPush,
        (true, true) => {
            if rs1 == rd {
                CtfInfo::TakenJalrPush
            } else {
                CtfInfo::TakenJalrPopPush
            }
        }
    }
}
