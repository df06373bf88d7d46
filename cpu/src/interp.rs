// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fetch-decode-execute loop.
//!
//! Each iteration checks for a pending interrupt, fetches a 16-bit
//! parcel, widens it to 32 bits (compressed instructions expand to
//! their canonical encodings first, keeping the real length for PC
//! arithmetic), dispatches, and advances the counters. An instruction
//! that traps never retires; the trap unit rewrites the PC and the next
//! iteration fetches from the handler.

use crate::csr::{MISA_C, MSTATUS_TSR, MSTATUS_TVM, MSTATUS_TW};
use crate::fpu;
use crate::hart::Hart;
use crate::trap::{Exception, Trap};
use crate::{ctf_compute_hint, CtfInfo, Priv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Advance,
    Jump(u64),
}

pub(crate) fn run(hart: &mut Hart, budget: u64) -> u64 {
    let start = hart.insn_counter;
    // The budget bounds loop iterations, not retired instructions: a
    // trap consumes budget without retiring, so a faulting handler
    // cannot wedge the loop.
    let mut n = budget;

    while !hart.terminate && n > 0 {
        n -= 1;
        // A decoder for other register widths was never wired up; the
        // base can only be changed through misa and must not be acted
        // on here.
        assert!(hart.cur_xlen == 64, "unsupported XLEN {}", hart.cur_xlen);

        hart.raise_interrupt();
        if hart.power_down {
            if hart.mip & hart.mie != 0 {
                hart.power_down = false;
            } else {
                break;
            }
        }

        let pc = hart.pc;
        let lo = match hart.fetch_u16(pc) {
            Ok(v) => v,
            Err(t) => {
                hart.raise_exception(t);
                continue;
            }
        };
        let (insn, ilen) = if lo & 3 == 3 {
            match hart.fetch_insn32(pc) {
                Ok(i) => (i, 4u64),
                Err(t) => {
                    hart.raise_exception(t);
                    continue;
                }
            }
        } else {
            match expand_compressed(lo) {
                Some(i) => (i, 2u64),
                None => {
                    hart.raise_exception(Trap::new(Exception::IllegalInstruction, lo as u64));
                    continue;
                }
            }
        };

        hart.ctf_info = CtfInfo::None;
        match execute(hart, insn, ilen) {
            Ok(Next::Advance) => hart.pc = pc.wrapping_add(ilen),
            Ok(Next::Jump(target)) => hart.pc = target,
            Err(t) => {
                hart.raise_exception(t);
                continue;
            }
        }

        hart.insn_counter += 1;
        if !hart.stop_the_counter {
            hart.minstret += 1;
            hart.mcycle += 1;
        }
    }

    hart.insn_counter - start
}

#[inline]
fn illegal(insn: u32) -> Trap {
    Trap::new(Exception::IllegalInstruction, insn as u64)
}

#[inline]
fn sext32(v: u32) -> u64 { v as i32 as i64 as u64 }

#[inline]
fn imm_i(insn: u32) -> u64 { ((insn as i32) >> 20) as i64 as u64 }

#[inline]
fn imm_s(insn: u32) -> u64 {
    ((((insn as i32) >> 25) << 5) | ((insn >> 7) & 0x1f) as i32) as i64 as u64
}

#[inline]
fn imm_b(insn: u32) -> u64 {
    let imm = (((insn as i32) >> 31) << 12)
        | ((((insn >> 25) & 0x3f) << 5) as i32)
        | ((((insn >> 8) & 0xf) << 1) as i32)
        | ((((insn >> 7) & 1) << 11) as i32);
    imm as i64 as u64
}

#[inline]
fn imm_j(insn: u32) -> u64 {
    let imm = (((insn as i32) >> 31) << 20)
        | ((((insn >> 21) & 0x3ff) << 1) as i32)
        | ((((insn >> 20) & 1) << 11) as i32)
        | (((insn >> 12) & 0xff) << 12) as i32;
    imm as i64 as u64
}

/// Branch and jump targets must be fetchable: 2-byte aligned with the C
/// extension, 4-byte without.
#[inline]
fn check_target(hart: &Hart, target: u64) -> Result<u64, Trap> {
    let mask = if hart.misa & MISA_C != 0 { 1 } else { 3 };
    if target & mask != 0 {
        Err(Trap::new(Exception::MisalignedFetch, target))
    } else {
        Ok(target)
    }
}

fn execute(hart: &mut Hart, insn: u32, ilen: u64) -> Result<Next, Trap> {
    let opcode = insn & 0x7f;
    let rd = ((insn >> 7) & 0x1f) as usize;
    let rs1 = ((insn >> 15) & 0x1f) as usize;
    let rs2 = ((insn >> 20) & 0x1f) as usize;
    let funct3 = (insn >> 12) & 7;
    let funct7 = insn >> 25;

    match opcode {
        0x37 => {
            // LUI
            hart.write_reg(rd, sext32(insn & 0xffff_f000));
            Ok(Next::Advance)
        }
        0x17 => {
            // AUIPC
            hart.write_reg(rd, hart.pc.wrapping_add(sext32(insn & 0xffff_f000)));
            Ok(Next::Advance)
        }
        0x6f => {
            // JAL
            let target = check_target(hart, hart.pc.wrapping_add(imm_j(insn)))?;
            hart.write_reg(rd, hart.pc.wrapping_add(ilen));
            hart.ctf_info =
                if rd == 1 || rd == 5 { CtfInfo::TakenJal } else { CtfInfo::TakenJump };
            hart.next_addr = target;
            Ok(Next::Jump(target))
        }
        0x67 => {
            // JALR
            if funct3 != 0 {
                return Err(illegal(insn));
            }
            let target =
                check_target(hart, hart.read_reg(rs1).wrapping_add(imm_i(insn)) & !1)?;
            hart.write_reg(rd, hart.pc.wrapping_add(ilen));
            hart.ctf_info = ctf_compute_hint(rd, rs1);
            hart.next_addr = target;
            Ok(Next::Jump(target))
        }
        0x63 => {
            // branches
            let a = hart.read_reg(rs1);
            let b = hart.read_reg(rs2);
            let taken = match funct3 {
                0 => a == b,
                1 => a != b,
                4 => (a as i64) < (b as i64),
                5 => (a as i64) >= (b as i64),
                6 => a < b,
                7 => a >= b,
                _ => return Err(illegal(insn)),
            };
            if taken {
                let target = check_target(hart, hart.pc.wrapping_add(imm_b(insn)))?;
                hart.ctf_info = CtfInfo::TakenBranch;
                hart.next_addr = target;
                Ok(Next::Jump(target))
            } else {
                Ok(Next::Advance)
            }
        }
        0x03 => {
            // loads
            let addr = hart.read_reg(rs1).wrapping_add(imm_i(insn));
            let val = match funct3 {
                0 => hart.read_u8(addr)? as i8 as i64 as u64,
                1 => hart.read_u16(addr)? as i16 as i64 as u64,
                2 => hart.read_u32(addr)? as i32 as i64 as u64,
                3 => hart.read_u64(addr)?,
                4 => hart.read_u8(addr)? as u64,
                5 => hart.read_u16(addr)? as u64,
                6 => hart.read_u32(addr)? as u64,
                _ => return Err(illegal(insn)),
            };
            hart.write_reg(rd, val);
            Ok(Next::Advance)
        }
        0x23 => {
            // stores
            let addr = hart.read_reg(rs1).wrapping_add(imm_s(insn));
            let val = hart.read_reg(rs2);
            match funct3 {
                0 => hart.write_u8(addr, val as u8)?,
                1 => hart.write_u16(addr, val as u16)?,
                2 => hart.write_u32(addr, val as u32)?,
                3 => hart.write_u64(addr, val)?,
                _ => return Err(illegal(insn)),
            }
            Ok(Next::Advance)
        }
        0x13 => {
            // OP-IMM
            let a = hart.read_reg(rs1);
            let imm = imm_i(insn);
            let val = match funct3 {
                0 => a.wrapping_add(imm),
                1 => {
                    if funct7 >> 1 != 0 {
                        return Err(illegal(insn));
                    }
                    a << (imm & 0x3f)
                }
                2 => ((a as i64) < (imm as i64)) as u64,
                3 => (a < imm) as u64,
                4 => a ^ imm,
                5 => {
                    let shamt = (imm & 0x3f) as u32;
                    match funct7 >> 1 {
                        0x00 => a >> shamt,
                        0x10 => ((a as i64) >> shamt) as u64,
                        _ => return Err(illegal(insn)),
                    }
                }
                6 => a | imm,
                7 => a & imm,
                _ => unreachable!(),
            };
            hart.write_reg(rd, val);
            Ok(Next::Advance)
        }
        0x1b => {
            // OP-IMM-32
            let a = hart.read_reg(rs1) as u32;
            let val = match funct3 {
                0 => sext32(a.wrapping_add(imm_i(insn) as u32)),
                1 => {
                    if funct7 != 0 {
                        return Err(illegal(insn));
                    }
                    sext32(a << (rs2 as u32))
                }
                5 => match funct7 {
                    0x00 => sext32(a >> (rs2 as u32)),
                    0x20 => sext32(((a as i32) >> (rs2 as u32)) as u32),
                    _ => return Err(illegal(insn)),
                },
                _ => return Err(illegal(insn)),
            };
            hart.write_reg(rd, val);
            Ok(Next::Advance)
        }
        0x33 => {
            // OP (including M)
            let a = hart.read_reg(rs1);
            let b = hart.read_reg(rs2);
            let val = match (funct7, funct3) {
                (0x00, 0) => a.wrapping_add(b),
                (0x20, 0) => a.wrapping_sub(b),
                (0x00, 1) => a << (b & 0x3f),
                (0x00, 2) => ((a as i64) < (b as i64)) as u64,
                (0x00, 3) => (a < b) as u64,
                (0x00, 4) => a ^ b,
                (0x00, 5) => a >> (b & 0x3f),
                (0x20, 5) => ((a as i64) >> (b & 0x3f)) as u64,
                (0x00, 6) => a | b,
                (0x00, 7) => a & b,
                (0x01, 0) => a.wrapping_mul(b),
                (0x01, 1) => (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64,
                (0x01, 2) => (((a as i64 as i128) * (b as i128)) >> 64) as u64,
                (0x01, 3) => (((a as u128) * (b as u128)) >> 64) as u64,
                (0x01, 4) => div64(a as i64, b as i64) as u64,
                (0x01, 5) => divu64(a, b),
                (0x01, 6) => rem64(a as i64, b as i64) as u64,
                (0x01, 7) => remu64(a, b),
                _ => return Err(illegal(insn)),
            };
            hart.write_reg(rd, val);
            Ok(Next::Advance)
        }
        0x3b => {
            // OP-32 (including M)
            let a = hart.read_reg(rs1) as u32;
            let b = hart.read_reg(rs2) as u32;
            let val = match (funct7, funct3) {
                (0x00, 0) => sext32(a.wrapping_add(b)),
                (0x20, 0) => sext32(a.wrapping_sub(b)),
                (0x00, 1) => sext32(a << (b & 0x1f)),
                (0x00, 5) => sext32(a >> (b & 0x1f)),
                (0x20, 5) => sext32(((a as i32) >> (b & 0x1f)) as u32),
                (0x01, 0) => sext32(a.wrapping_mul(b)),
                (0x01, 4) => div32(a as i32, b as i32) as i64 as u64,
                (0x01, 5) => sext32(divu32(a, b)),
                (0x01, 6) => rem32(a as i32, b as i32) as i64 as u64,
                (0x01, 7) => sext32(remu32(a, b)),
                _ => return Err(illegal(insn)),
            };
            hart.write_reg(rd, val);
            Ok(Next::Advance)
        }
        0x0f => {
            // FENCE (0) / FENCE.I (1): ordering is already program
            // order from the single hart's viewpoint.
            match funct3 {
                0 | 1 => Ok(Next::Advance),
                _ => Err(illegal(insn)),
            }
        }
        0x2f => execute_amo(hart, insn),
        0x73 => execute_system(hart, insn),
        0x07 | 0x27 | 0x43 | 0x47 | 0x4b | 0x4f | 0x53 => {
            fpu::execute_fp(hart, insn)?;
            Ok(Next::Advance)
        }
        _ => Err(illegal(insn)),
    }
}

fn div64(a: i64, b: i64) -> i64 {
    if b == 0 {
        -1
    } else if a == i64::MIN && b == -1 {
        a
    } else {
        a / b
    }
}

fn divu64(a: u64, b: u64) -> u64 {
    if b == 0 {
        !0
    } else {
        a / b
    }
}

fn rem64(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else if a == i64::MIN && b == -1 {
        0
    } else {
        a % b
    }
}

fn remu64(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn div32(a: i32, b: i32) -> i32 {
    if b == 0 {
        -1
    } else if a == i32::MIN && b == -1 {
        a
    } else {
        a / b
    }
}

fn divu32(a: u32, b: u32) -> u32 {
    if b == 0 {
        !0
    } else {
        a / b
    }
}

fn rem32(a: i32, b: i32) -> i32 {
    if b == 0 {
        a
    } else if a == i32::MIN && b == -1 {
        0
    } else {
        a % b
    }
}

fn remu32(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn execute_amo(hart: &mut Hart, insn: u32) -> Result<Next, Trap> {
    let rd = ((insn >> 7) & 0x1f) as usize;
    let rs1 = ((insn >> 15) & 0x1f) as usize;
    let rs2 = ((insn >> 20) & 0x1f) as usize;
    let funct3 = (insn >> 12) & 7;
    let funct5 = insn >> 27;
    let addr = hart.read_reg(rs1);
    let src = hart.read_reg(rs2);

    // Atomics never tolerate misalignment, even when emulation of
    // misaligned plain accesses is enabled.
    let size = match funct3 {
        2 => 4u64,
        3 => 8u64,
        _ => return Err(illegal(insn)),
    };
    if addr & (size - 1) != 0 {
        let cause = if funct5 == 0x02 {
            Exception::MisalignedLoad
        } else {
            Exception::MisalignedStore
        };
        return Err(Trap::new(cause, addr));
    }

    match funct5 {
        0x02 => {
            // LR
            if rs2 != 0 {
                return Err(illegal(insn));
            }
            let val = if size == 4 {
                hart.read_u32(addr)? as i32 as i64 as u64
            } else {
                hart.read_u64(addr)?
            };
            hart.load_res = Some(addr);
            hart.write_reg(rd, val);
        }
        0x03 => {
            // SC: succeeds only against a matching live reservation.
            if hart.load_res == Some(addr) {
                if size == 4 {
                    hart.write_u32(addr, src as u32)?;
                } else {
                    hart.write_u64(addr, src)?;
                }
                hart.write_reg(rd, 0);
            } else {
                hart.write_reg(rd, 1);
            }
            hart.load_res = None;
        }
        _ => {
            // AMO read-modify-write, atomic from the single hart's view.
            let old = if size == 4 {
                hart.read_u32(addr)? as i32 as i64 as u64
            } else {
                hart.read_u64(addr)?
            };
            let new = match funct5 {
                0x01 => src,                                     // amoswap
                0x00 => old.wrapping_add(src),                   // amoadd
                0x04 => old ^ src,                               // amoxor
                0x0c => old & src,                               // amoand
                0x08 => old | src,                               // amoor
                0x10 => {
                    // amomin
                    if size == 4 {
                        ((old as i32).min(src as i32)) as u32 as u64
                    } else {
                        ((old as i64).min(src as i64)) as u64
                    }
                }
                0x14 => {
                    if size == 4 {
                        ((old as i32).max(src as i32)) as u32 as u64
                    } else {
                        ((old as i64).max(src as i64)) as u64
                    }
                }
                0x18 => {
                    if size == 4 {
                        ((old as u32).min(src as u32)) as u64
                    } else {
                        old.min(src)
                    }
                }
                0x1c => {
                    if size == 4 {
                        ((old as u32).max(src as u32)) as u64
                    } else {
                        old.max(src)
                    }
                }
                _ => return Err(illegal(insn)),
            };
            if size == 4 {
                hart.write_u32(addr, new as u32)?;
            } else {
                hart.write_u64(addr, new)?;
            }
            hart.write_reg(rd, old);
        }
    }
    Ok(Next::Advance)
}

fn execute_system(hart: &mut Hart, insn: u32) -> Result<Next, Trap> {
    let rd = ((insn >> 7) & 0x1f) as usize;
    let rs1 = ((insn >> 15) & 0x1f) as usize;
    let funct3 = (insn >> 12) & 7;

    if funct3 == 0 {
        return match insn {
            0x0000_0073 => {
                // ECALL raises by current privilege; never retires.
                Err(Trap::new(Exception::ecall_from(hart.privilege), 0))
            }
            0x0010_0073 => Err(Trap::new(Exception::Breakpoint, 0)),
            0x1020_0073 => {
                // SRET
                if hart.privilege < Priv::Supervisor
                    || (hart.privilege == Priv::Supervisor && hart.mstatus & MSTATUS_TSR != 0)
                {
                    return Err(illegal(insn));
                }
                hart.handle_sret();
                Ok(Next::Jump(hart.pc))
            }
            0x3020_0073 => {
                // MRET
                if hart.privilege != Priv::Machine {
                    return Err(illegal(insn));
                }
                hart.handle_mret();
                Ok(Next::Jump(hart.pc))
            }
            0x7b20_0073 => {
                // DRET: only the checkpoint recovery path issues this.
                if hart.privilege != Priv::Machine {
                    return Err(illegal(insn));
                }
                hart.handle_dret();
                Ok(Next::Jump(hart.pc))
            }
            0x1050_0073 => {
                // WFI
                if hart.privilege == Priv::User
                    || (hart.privilege == Priv::Supervisor && hart.mstatus & MSTATUS_TW != 0)
                {
                    return Err(illegal(insn));
                }
                if hart.mip & hart.mie == 0 {
                    hart.power_down = true;
                }
                Ok(Next::Advance)
            }
            _ => {
                if insn >> 25 == 0x09 {
                    // SFENCE.VMA (no ASID support: flush everything)
                    if hart.privilege < Priv::Supervisor
                        || (hart.privilege == Priv::Supervisor
                            && hart.mstatus & MSTATUS_TVM != 0)
                    {
                        return Err(illegal(insn));
                    }
                    hart.tlb.flush_all();
                    hart.load_res = None;
                    return Ok(Next::Advance);
                }
                Err(illegal(insn))
            }
        };
    }

    // Zicsr
    let csr = (insn >> 20) & 0xfff;
    let src = if funct3 & 4 != 0 { rs1 as u64 } else { hart.read_reg(rs1) };
    let op = funct3 & 3;
    if op == 0 {
        return Err(illegal(insn));
    }
    let will_write = op == 1 || rs1 != 0;
    let old = hart.csr_read(csr, will_write).map_err(|_| illegal(insn))?;
    if will_write {
        let new = match op {
            1 => src,
            2 => old | src,
            3 => old & !src,
            _ => unreachable!(),
        };
        // TlbFlushed/Restart effects just mean the loop refetches; that
        // happens on its own, and a base change is caught by the XLEN
        // assertion at the loop head.
        hart.csr_write(csr, new).map_err(|_| illegal(insn))?;
    }
    hart.write_reg(rd, old);
    Ok(Next::Advance)
}

/// Expand a 16-bit compressed instruction into its 32-bit canonical
/// form (RV64C). Returns `None` for reserved encodings.
fn expand_compressed(c: u16) -> Option<u32> {
    let c = c as u32;
    let funct3 = (c >> 13) & 7;
    let quadrant = c & 3;

    // The common 3-bit register fields map to x8..x15.
    let r_rd = 8 + ((c >> 2) & 7) as usize; // rd'/rs2'
    let r_rs1 = 8 + ((c >> 7) & 7) as usize;

    match (quadrant, funct3) {
        (0, 0) => {
            // C.ADDI4SPN -> addi rd', x2, nzuimm
            let imm = ((c >> 7) & 0x30) | ((c >> 1) & 0x3c0) | ((c >> 4) & 4) | ((c >> 2) & 8);
            if imm == 0 {
                return None; // includes the all-zero illegal encoding
            }
            Some(enc_i(0x13, r_rd, 0, 2, imm))
        }
        (0, 1) => {
            // C.FLD
            let imm = ((c >> 7) & 0x38) | ((c << 1) & 0xc0);
            Some(enc_i(0x07, r_rd, 3, r_rs1, imm))
        }
        (0, 2) => {
            // C.LW
            let imm = ((c >> 7) & 0x38) | ((c >> 4) & 4) | ((c << 1) & 0x40);
            Some(enc_i(0x03, r_rd, 2, r_rs1, imm))
        }
        (0, 3) => {
            // C.LD
            let imm = ((c >> 7) & 0x38) | ((c << 1) & 0xc0);
            Some(enc_i(0x03, r_rd, 3, r_rs1, imm))
        }
        (0, 5) => {
            // C.FSD
            let imm = ((c >> 7) & 0x38) | ((c << 1) & 0xc0);
            Some(enc_s(0x27, 3, r_rs1, r_rd, imm))
        }
        (0, 6) => {
            // C.SW
            let imm = ((c >> 7) & 0x38) | ((c >> 4) & 4) | ((c << 1) & 0x40);
            Some(enc_s(0x23, 2, r_rs1, r_rd, imm))
        }
        (0, 7) => {
            // C.SD
            let imm = ((c >> 7) & 0x38) | ((c << 1) & 0xc0);
            Some(enc_s(0x23, 3, r_rs1, r_rd, imm))
        }
        (1, 0) => {
            // C.ADDI (rd = 0 encodes NOP, same expansion)
            let rd = ((c >> 7) & 0x1f) as usize;
            let imm = c_imm6(c);
            Some(enc_i(0x13, rd, 0, rd, imm & 0xfff))
        }
        (1, 1) => {
            // C.ADDIW (RV64)
            let rd = ((c >> 7) & 0x1f) as usize;
            if rd == 0 {
                return None;
            }
            let imm = c_imm6(c);
            Some(enc_i(0x1b, rd, 0, rd, imm & 0xfff))
        }
        (1, 2) => {
            // C.LI -> addi rd, x0, imm
            let rd = ((c >> 7) & 0x1f) as usize;
            Some(enc_i(0x13, rd, 0, 0, c_imm6(c) & 0xfff))
        }
        (1, 3) => {
            let rd = ((c >> 7) & 0x1f) as usize;
            if rd == 2 {
                // C.ADDI16SP
                let imm = (((c >> 12) & 1) * 0xfe00)
                    | ((c >> 2) & 0x10)
                    | ((c << 1) & 0x40)
                    | ((c << 4) & 0x180)
                    | ((c << 3) & 0x20);
                if imm == 0 {
                    return None;
                }
                Some(enc_i(0x13, 2, 0, 2, imm & 0xfff))
            } else {
                // C.LUI
                let imm17 = ((c >> 12) & 1) << 17 | ((c >> 2) & 0x1f) << 12;
                if imm17 == 0 {
                    return None;
                }
                // sign-extend imm[17] through the U-type immediate
                let imm = if imm17 & (1 << 17) != 0 { imm17 | 0xfffc_0000 } else { imm17 };
                Some((imm & 0xffff_f000) | ((rd as u32) << 7) | 0x37)
            }
        }
        (1, 4) => {
            let sub = (c >> 10) & 3;
            match sub {
                0 | 1 => {
                    // C.SRLI / C.SRAI (funct7 lands in imm[11:5])
                    let shamt = ((c >> 7) & 0x20) | ((c >> 2) & 0x1f);
                    let imm = shamt | if sub == 0 { 0 } else { 0x400 };
                    Some(enc_i(0x13, r_rs1, 5, r_rs1, imm))
                }
                2 => {
                    // C.ANDI
                    Some(enc_i(0x13, r_rs1, 7, r_rs1, c_imm6(c) & 0xfff))
                }
                _ => {
                    let op = (c >> 5) & 3;
                    if c & (1 << 12) == 0 {
                        // sub/xor/or/and
                        let (f7, f3) = match op {
                            0 => (0x20, 0),
                            1 => (0, 4),
                            2 => (0, 6),
                            _ => (0, 7),
                        };
                        Some(enc_r(0x33, r_rs1, f3, r_rs1, r_rd, f7))
                    } else {
                        // subw/addw
                        match op {
                            0 => Some(enc_r(0x3b, r_rs1, 0, r_rs1, r_rd, 0x20)),
                            1 => Some(enc_r(0x3b, r_rs1, 0, r_rs1, r_rd, 0)),
                            _ => None,
                        }
                    }
                }
            }
        }
        (1, 5) => {
            // C.J
            let imm = c_j_imm(c);
            Some(enc_j(0x6f, 0, imm))
        }
        (1, 6) => {
            // C.BEQZ
            Some(enc_b(0x63, 0, r_rs1, 0, c_b_imm(c)))
        }
        (1, 7) => {
            // C.BNEZ
            Some(enc_b(0x63, 1, r_rs1, 0, c_b_imm(c)))
        }
        (2, 0) => {
            // C.SLLI
            let rd = ((c >> 7) & 0x1f) as usize;
            let shamt = ((c >> 7) & 0x20) | ((c >> 2) & 0x1f);
            Some(enc_i(0x13, rd, 1, rd, shamt))
        }
        (2, 1) => {
            // C.FLDSP
            let rd = ((c >> 7) & 0x1f) as usize;
            let imm = ((c >> 7) & 0x20) | ((c >> 2) & 0x18) | ((c << 4) & 0x1c0);
            Some(enc_i(0x07, rd, 3, 2, imm))
        }
        (2, 2) => {
            // C.LWSP
            let rd = ((c >> 7) & 0x1f) as usize;
            if rd == 0 {
                return None;
            }
            let imm = ((c >> 7) & 0x20) | ((c >> 2) & 0x1c) | ((c << 4) & 0xc0);
            Some(enc_i(0x03, rd, 2, 2, imm))
        }
        (2, 3) => {
            // C.LDSP
            let rd = ((c >> 7) & 0x1f) as usize;
            if rd == 0 {
                return None;
            }
            let imm = ((c >> 7) & 0x20) | ((c >> 2) & 0x18) | ((c << 4) & 0x1c0);
            Some(enc_i(0x03, rd, 3, 2, imm))
        }
        (2, 4) => {
            let rd = ((c >> 7) & 0x1f) as usize;
            let rs2 = ((c >> 2) & 0x1f) as usize;
            if c & (1 << 12) == 0 {
                if rs2 == 0 {
                    // C.JR
                    if rd == 0 {
                        return None;
                    }
                    Some(enc_i(0x67, 0, 0, rd, 0))
                } else {
                    // C.MV -> add rd, x0, rs2
                    Some(enc_r(0x33, rd, 0, 0, rs2, 0))
                }
            } else if rs2 == 0 {
                if rd == 0 {
                    // C.EBREAK
                    Some(0x0010_0073)
                } else {
                    // C.JALR
                    Some(enc_i(0x67, 1, 0, rd, 0))
                }
            } else {
                // C.ADD
                Some(enc_r(0x33, rd, 0, rd, rs2, 0))
            }
        }
        (2, 5) => {
            // C.FSDSP
            let rs2 = ((c >> 2) & 0x1f) as usize;
            let imm = ((c >> 7) & 0x38) | ((c >> 1) & 0x1c0);
            Some(enc_s(0x27, 3, 2, rs2, imm))
        }
        (2, 6) => {
            // C.SWSP
            let rs2 = ((c >> 2) & 0x1f) as usize;
            let imm = ((c >> 7) & 0x3c) | ((c >> 1) & 0xc0);
            Some(enc_s(0x23, 2, 2, rs2, imm))
        }
        (2, 7) => {
            // C.SDSP
            let rs2 = ((c >> 2) & 0x1f) as usize;
            let imm = ((c >> 7) & 0x38) | ((c >> 1) & 0x1c0);
            Some(enc_s(0x23, 3, 2, rs2, imm))
        }
        _ => None,
    }
}

/// Sign-extended 6-bit immediate common to C.ADDI/C.LI/C.ANDI/C.ADDIW.
fn c_imm6(c: u32) -> u32 {
    let imm = ((c >> 7) & 0x20) | ((c >> 2) & 0x1f);
    if imm & 0x20 != 0 {
        imm | 0xffff_ffc0
    } else {
        imm
    }
}

fn c_j_imm(c: u32) -> u32 {
    let imm = ((c >> 1) & 0x800)
        | ((c >> 7) & 0x10)
        | ((c >> 1) & 0x300)
        | ((c << 2) & 0x400)
        | ((c >> 1) & 0x40)
        | ((c << 1) & 0x80)
        | ((c >> 2) & 0xe)
        | ((c << 3) & 0x20);
    if imm & 0x800 != 0 {
        imm | 0xffff_f000
    } else {
        imm
    }
}

fn c_b_imm(c: u32) -> u32 {
    let imm = ((c >> 4) & 0x100)
        | ((c >> 7) & 0x18)
        | ((c << 1) & 0xc0)
        | ((c >> 2) & 6)
        | ((c << 3) & 0x20);
    if imm & 0x100 != 0 {
        imm | 0xffff_fe00
    } else {
        imm
    }
}

// 32-bit encoders, shared with the recovery-ROM builder's approach:
// build the canonical encoding from fields.

pub(crate) fn enc_r(op: u32, rd: usize, f3: u32, rs1: usize, rs2: usize, f7: u32) -> u32 {
    op | ((rd as u32) << 7) | (f3 << 12) | ((rs1 as u32) << 15) | ((rs2 as u32) << 20) | (f7 << 25)
}

pub(crate) fn enc_i(op: u32, rd: usize, f3: u32, rs1: usize, imm: u32) -> u32 {
    op | ((rd as u32) << 7) | (f3 << 12) | ((rs1 as u32) << 15) | ((imm & 0xfff) << 20)
}

pub(crate) fn enc_s(op: u32, f3: u32, rs1: usize, rs2: usize, imm: u32) -> u32 {
    op | (((imm & 0x1f) as u32) << 7)
        | (f3 << 12)
        | ((rs1 as u32) << 15)
        | ((rs2 as u32) << 20)
        | (((imm >> 5) & 0x7f) << 25)
}

pub(crate) fn enc_b(op: u32, f3: u32, rs1: usize, rs2: usize, imm: u32) -> u32 {
    op | (((imm >> 11) & 1) << 7)
        | (((imm >> 1) & 0xf) << 8)
        | (f3 << 12)
        | ((rs1 as u32) << 15)
        | ((rs2 as u32) << 20)
        | (((imm >> 5) & 0x3f) << 25)
        | (((imm >> 12) & 1) << 31)
}

pub(crate) fn enc_j(op: u32, rd: usize, imm: u32) -> u32 {
    op | ((rd as u32) << 7)
        | (((imm >> 12) & 0xff) << 12)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 1) & 0x3ff) << 21)
        | (((imm >> 20) & 1) << 31)
}
