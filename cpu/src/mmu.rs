// SPDX-FileCopyrightText: 2024 margay developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Address translation and the memory access primitives.
//!
//! The fast path indexes one of the three TLBs and dereferences host
//! memory directly; misses walk the page tables through the physical
//! memory map. Fault results carry the cause and tval back to the
//! interpreter, which hands them to the trap unit.

use crate::csr::{MSTATUS_MPP_SHIFT, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM};
use crate::hart::Hart;
use crate::mem::IoContext;
use crate::tlb::{tlb_index, Tlb};
use crate::trap::{Exception, Trap};
use crate::{Priv, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read = 0,
    Write = 1,
    Code = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TranslateError {
    /// Invalid PTE, permission failure, canonical violation.
    PageFault,
    /// No translation applies: illegal physical address.
    AccessFault,
}

impl TranslateError {
    fn to_trap(self, access: Access, addr: u64) -> Trap {
        let cause = match (self, access) {
            (TranslateError::PageFault, Access::Read) => Exception::LoadPageFault,
            (TranslateError::PageFault, Access::Write) => Exception::StorePageFault,
            (TranslateError::PageFault, Access::Code) => Exception::FetchPageFault,
            (TranslateError::AccessFault, Access::Read) => Exception::FaultLoad,
            (TranslateError::AccessFault, Access::Write) => Exception::FaultStore,
            (TranslateError::AccessFault, Access::Code) => Exception::FaultFetch,
        };
        Trap::new(cause, addr)
    }
}

impl Hart {
    /// Translate a virtual address for the given access kind.
    pub(crate) fn translate(&mut self, vaddr: u64, access: Access) -> Result<u64, TranslateError> {
        let privilege = if self.mstatus & MSTATUS_MPRV != 0 && access != Access::Code {
            // Loads and stores run at the previous privilege under MPRV.
            Priv::from_bits((self.mstatus >> MSTATUS_MPP_SHIFT) & 3).unwrap_or(Priv::User)
        } else {
            self.privilege
        };

        if privilege == Priv::Machine {
            // Physical addresses are 56 bits; anything above faults.
            if self.cur_xlen > 32 && vaddr >> 56 != 0 {
                return Err(TranslateError::AccessFault);
            }
            return Ok(if self.cur_xlen < 64 {
                vaddr & ((1u64 << self.cur_xlen) - 1)
            } else {
                vaddr
            });
        }

        let mode = (self.satp >> 60) & 0xf;
        if mode == 0 {
            // bare: no translation
            return Ok(vaddr);
        }
        // sv39 (mode 8) walks 3 levels, sv48 (mode 9) walks 4.
        let levels = (mode - 8 + 3) as u32;

        // The unused top bits must replicate the top used bit.
        let vaddr_shift = 64 - (PAGE_SHIFT + levels * 9);
        if ((vaddr as i64) << vaddr_shift) >> vaddr_shift != vaddr as i64 {
            return Err(TranslateError::PageFault);
        }

        let mut pte_addr = (self.satp & ((1u64 << 44) - 1)) << PAGE_SHIFT;
        for i in 0..levels {
            let shift = PAGE_SHIFT + 9 * (levels - 1 - i);
            let pte_idx = (vaddr >> shift) & 0x1ff;
            pte_addr += pte_idx << 3;
            let mut pte = self.mem_map.phys_read_u64(pte_addr);
            if pte & PteFlags::V.bits() == 0 {
                return Err(TranslateError::PageFault);
            }
            let paddr = (pte >> 10) << PAGE_SHIFT;
            let mut xwr = ((pte >> 1) & 7) as u32;
            if xwr != 0 {
                // leaf; W without R is reserved
                if xwr == 2 || xwr == 6 {
                    return Err(TranslateError::PageFault);
                }

                if privilege == Priv::Supervisor {
                    // S touches U pages only through SUM, and never
                    // executes them.
                    if pte & PteFlags::U.bits() != 0
                        && (self.mstatus & MSTATUS_SUM == 0 || access == Access::Code)
                    {
                        return Err(TranslateError::PageFault);
                    }
                } else if pte & PteFlags::U.bits() == 0 {
                    return Err(TranslateError::PageFault);
                }

                // MXR lets loads through execute-only pages.
                if self.mstatus & MSTATUS_MXR != 0 {
                    xwr |= xwr >> 2;
                }
                if (xwr >> access as u32) & 1 == 0 {
                    return Err(TranslateError::PageFault);
                }

                // Misaligned superpage: the low 9*j PPN bits must be 0.
                let ppn = pte >> 10;
                let j = levels - 1 - i;
                if ((1u64 << (9 * j)) - 1) & ppn != 0 {
                    return Err(TranslateError::PageFault);
                }

                if self.config.hw_managed_ad {
                    let need_write = pte & PteFlags::A.bits() == 0
                        || (pte & PteFlags::D.bits() == 0 && access == Access::Write);
                    pte |= PteFlags::A.bits();
                    if access == Access::Write {
                        pte |= PteFlags::D.bits();
                    }
                    if need_write {
                        self.mem_map.phys_write_u64(pte_addr, pte);
                    }
                } else {
                    // Software-managed A/D: missing A (or D on write)
                    // is the OS's page fault to take.
                    if pte & PteFlags::A.bits() == 0 {
                        return Err(TranslateError::PageFault);
                    }
                    if access == Access::Write && pte & PteFlags::D.bits() == 0 {
                        return Err(TranslateError::PageFault);
                    }
                }

                let vaddr_mask = (1u64 << shift) - 1;
                return Ok(paddr & !vaddr_mask | vaddr & vaddr_mask);
            }
            pte_addr = paddr;
        }
        Err(TranslateError::PageFault)
    }

    fn apply_io(&mut self, ctx: IoContext) {
        if ctx.mip_clear != 0 {
            self.reset_mip(ctx.mip_clear);
        }
        if ctx.mip_set != 0 {
            self.set_mip(ctx.mip_set);
        }
        if ctx.shutdown {
            self.terminate = true;
        }
    }

    /// TLB-missing (or misaligned) read. Returns the value zero-extended.
    fn read_slow(&mut self, addr: u64, size_log2: u32) -> Result<u64, Trap> {
        let size = 1u64 << size_log2;
        let al = addr & (size - 1);
        if al != 0 {
            if !self.config.allow_misaligned {
                return Err(Trap::new(Exception::MisalignedLoad, addr));
            }
            // Emulate with two aligned accesses and splice.
            return match size_log2 {
                1 => {
                    let v0 = self.read_u8(addr)? as u64;
                    let v1 = self.read_u8(addr + 1)? as u64;
                    Ok(v0 | v1 << 8)
                }
                2 => {
                    let base = addr - al;
                    let v0 = self.read_u32(base)?;
                    let v1 = self.read_u32(base + 4)?;
                    Ok(((v0 >> (al * 8)) | v1.wrapping_shl(32 - al as u32 * 8)) as u64)
                }
                3 => {
                    let base = addr - al;
                    let v0 = self.read_u64(base)?;
                    let v1 = self.read_u64(base + 8)?;
                    Ok((v0 >> (al * 8)) | v1.wrapping_shl(64 - al as u32 * 8))
                }
                _ => unreachable!("unsupported misaligned width"),
            };
        }

        let paddr =
            self.translate(addr, Access::Read).map_err(|e| e.to_trap(Access::Read, addr))?;
        let (is_ram, range_addr, ram_ptr) = match self.mem_map.lookup(paddr) {
            None => {
                log::warn!("read: invalid physical address {:#018x}", paddr);
                return Ok(0);
            }
            Some(r) => (r.is_ram(), r.addr, r.ram_ptr()),
        };
        if is_ram {
            let ptr = unsafe { ram_ptr.unwrap().add((paddr - range_addr) as usize) };
            Tlb::fill(&mut self.tlb.read, addr, ptr);
            let val = unsafe {
                match size_log2 {
                    0 => *ptr as u64,
                    1 => (ptr as *const u16).read_unaligned() as u64,
                    2 => (ptr as *const u32).read_unaligned() as u64,
                    3 => (ptr as *const u64).read_unaligned(),
                    _ => unreachable!("unsupported read width"),
                }
            };
            Ok(val)
        } else {
            let mut ctx = IoContext::new(self.mcycle);
            let val = self.mem_map.device_read(&mut ctx, paddr, size_log2);
            self.apply_io(ctx);
            Ok(val)
        }
    }

    /// TLB-missing (or misaligned) write.
    fn write_slow(&mut self, addr: u64, val: u64, size_log2: u32) -> Result<(), Trap> {
        let size = 1u64 << size_log2;
        if addr & (size - 1) != 0 {
            if !self.config.allow_misaligned {
                return Err(Trap::new(Exception::MisalignedStore, addr));
            }
            // Validate both containing words up front so a fault from
            // either sub-access leaves memory untouched.
            self.translate(addr, Access::Write).map_err(|e| e.to_trap(Access::Write, addr))?;
            self.translate(addr + size - 1, Access::Write)
                .map_err(|e| e.to_trap(Access::Write, addr))?;
            for i in 0..size {
                self.write_u8(addr + i, (val >> (8 * i)) as u8)?;
            }
            return Ok(());
        }

        let paddr =
            self.translate(addr, Access::Write).map_err(|e| e.to_trap(Access::Write, addr))?;
        let (is_ram, range_addr, ram_ptr) = match self.mem_map.lookup(paddr) {
            None => {
                log::warn!("write: invalid physical address {:#018x}", paddr);
                return Ok(());
            }
            Some(r) => (r.is_ram(), r.addr, r.ram_ptr()),
        };
        if is_ram {
            let offset = paddr - range_addr;
            self.mem_map.lookup_mut(paddr).unwrap().set_dirty(offset);
            let ptr = unsafe { (ram_ptr.unwrap() as *mut u8).add(offset as usize) };
            Tlb::fill(&mut self.tlb.write, addr, ptr);
            unsafe {
                match size_log2 {
                    0 => *ptr = val as u8,
                    1 => (ptr as *mut u16).write_unaligned(val as u16),
                    2 => (ptr as *mut u32).write_unaligned(val as u32),
                    3 => (ptr as *mut u64).write_unaligned(val),
                    _ => unreachable!("unsupported write width"),
                }
            }
        } else {
            let mut ctx = IoContext::new(self.mcycle);
            self.mem_map.device_write(&mut ctx, paddr, val, size_log2);
            self.apply_io(ctx);
        }
        Ok(())
    }

    /// A store near the live LR reservation kills it.
    #[inline]
    fn clobber_reservation(&mut self, addr: u64, size: u64) {
        if let Some(res) = self.load_res {
            let res_base = res & !7;
            if addr + size > res_base && addr < res_base + 8 {
                self.load_res = None;
            }
        }
    }
}

macro_rules! target_read {
    ($name:ident, $ty:ty, $size_log2:expr) => {
        impl Hart {
            pub fn $name(&mut self, addr: u64) -> Result<$ty, Trap> {
                let size: u64 = 1 << $size_log2;
                if !self.config.allow_misaligned && addr & (size - 1) != 0 {
                    return Err(Trap::new(Exception::MisalignedLoad, addr));
                }
                let idx = tlb_index(addr);
                // The tag keeps the sub-word bits, so a misaligned
                // access never false-hits an aligned fill.
                if self.tlb.read[idx].vaddr == addr & !(PAGE_MASK & !(size - 1)) {
                    let ptr =
                        self.tlb.read[idx].mem_addend.wrapping_add(addr as usize) as *const $ty;
                    Ok(unsafe { ptr.read_unaligned() })
                } else {
                    Ok(self.read_slow(addr, $size_log2)? as $ty)
                }
            }
        }
    };
}

macro_rules! target_write {
    ($name:ident, $ty:ty, $size_log2:expr) => {
        impl Hart {
            pub fn $name(&mut self, addr: u64, val: $ty) -> Result<(), Trap> {
                let size: u64 = 1 << $size_log2;
                if !self.config.allow_misaligned && addr & (size - 1) != 0 {
                    return Err(Trap::new(Exception::MisalignedStore, addr));
                }
                self.clobber_reservation(addr, size);
                let idx = tlb_index(addr);
                if self.tlb.write[idx].vaddr == addr & !(PAGE_MASK & !(size - 1)) {
                    let ptr =
                        self.tlb.write[idx].mem_addend.wrapping_add(addr as usize) as *mut $ty;
                    unsafe { ptr.write_unaligned(val) };
                    Ok(())
                } else {
                    self.write_slow(addr, val as u64, $size_log2)
                }
            }
        }
    };
}

target_read!(read_u8, u8, 0);
target_read!(read_u16, u16, 1);
target_read!(read_u32, u32, 2);
target_read!(read_u64, u64, 3);
target_write!(write_u8, u8, 0);
target_write!(write_u16, u16, 1);
target_write!(write_u32, u32, 2);
target_write!(write_u64, u64, 3);

impl Hart {
    /// Fetch miss: translate, require RAM backing, refill the code TLB.
    /// `bits` is 16 or 32; a 32-bit fetch that straddles a page fetches
    /// each half with its own translation.
    fn fetch_slow(&mut self, addr: u64, bits: u32) -> Result<u32, Trap> {
        let paddr =
            self.translate(addr, Access::Code).map_err(|e| e.to_trap(Access::Code, addr))?;
        let (range_addr, ram_ptr) = match self.mem_map.lookup(paddr) {
            Some(r) if r.is_ram() => (r.addr, r.ram_ptr().unwrap()),
            // Only RAM holds code; a device fetch is an access fault.
            _ => return Err(Trap::new(Exception::FaultFetch, addr)),
        };
        let ptr = unsafe { ram_ptr.add((paddr - range_addr) as usize) };
        Tlb::fill(&mut self.tlb.code, addr, ptr);

        if bits == 32 && (addr & PAGE_MASK) > PAGE_SIZE - 4 {
            // Straddling fetch: the second parcel lives on another page.
            let paddr2 = self
                .translate(addr + 2, Access::Code)
                .map_err(|e| e.to_trap(Access::Code, addr))?;
            let (range2_addr, ram2_ptr) = match self.mem_map.lookup(paddr2) {
                Some(r) if r.is_ram() => (r.addr, r.ram_ptr().unwrap()),
                _ => return Err(Trap::new(Exception::FaultFetch, addr)),
            };
            let ptr2 = unsafe { ram2_ptr.add((paddr2 - range2_addr) as usize) };
            let lo = unsafe { (ptr as *const u16).read_unaligned() } as u32;
            let hi = unsafe { (ptr2 as *const u16).read_unaligned() } as u32;
            return Ok(lo | hi << 16);
        }

        let val = unsafe {
            if bits == 32 {
                (ptr as *const u32).read_unaligned()
            } else {
                (ptr as *const u16).read_unaligned() as u32
            }
        };
        Ok(val)
    }

    /// Fetch the 16-bit parcel at `addr` (always 2-byte aligned).
    pub(crate) fn fetch_u16(&mut self, addr: u64) -> Result<u16, Trap> {
        let idx = tlb_index(addr);
        if self.tlb.code[idx].vaddr == addr & !PAGE_MASK {
            let ptr = self.tlb.code[idx].mem_addend.wrapping_add(addr as usize) as *const u16;
            Ok(unsafe { ptr.read_unaligned() })
        } else {
            Ok(self.fetch_slow(addr, 16)? as u16)
        }
    }

    /// Fetch a full 32-bit instruction, handling the 4 KiB straddle.
    pub(crate) fn fetch_insn32(&mut self, addr: u64) -> Result<u32, Trap> {
        if (addr & PAGE_MASK) <= PAGE_SIZE - 4 {
            let idx = tlb_index(addr);
            if self.tlb.code[idx].vaddr == addr & !PAGE_MASK {
                let ptr = self.tlb.code[idx].mem_addend.wrapping_add(addr as usize) as *const u32;
                return Ok(unsafe { ptr.read_unaligned() });
            }
            return self.fetch_slow(addr, 32);
        }
        self.fetch_slow(addr, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::CoreConfig;
    use crate::mem::MemoryMap;

    const RAM_BASE: u64 = 0x8000_0000;

    fn fresh(config: CoreConfig) -> Hart {
        let mut map = MemoryMap::new();
        map.register_ram(RAM_BASE, 0x10_0000);
        Hart::new(map, 0x1000, config)
    }

    // Build a 3-level Sv39 table in RAM mapping `va` -> `pa` with the
    // given leaf flags. Tables live at RAM_BASE + 0x1000 * (1 + level).
    fn map_sv39(h: &mut Hart, va: u64, pa: u64, flags: u64) {
        let root = RAM_BASE + 0x1000;
        let l1 = RAM_BASE + 0x2000;
        let l0 = RAM_BASE + 0x3000;
        let vpn2 = (va >> 30) & 0x1ff;
        let vpn1 = (va >> 21) & 0x1ff;
        let vpn0 = (va >> 12) & 0x1ff;
        h.mem_map.phys_write_u64(root + vpn2 * 8, ((l1 >> 12) << 10) | PteFlags::V.bits());
        h.mem_map.phys_write_u64(l1 + vpn1 * 8, ((l0 >> 12) << 10) | PteFlags::V.bits());
        h.mem_map.phys_write_u64(l0 + vpn0 * 8, ((pa >> 12) << 10) | flags | PteFlags::V.bits());
        h.satp = (8 << 60) | (root >> 12);
    }

    fn rwxuad() -> u64 {
        (PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U | PteFlags::A | PteFlags::D).bits()
    }

    #[test]
    fn machine_mode_is_identity() {
        let mut h = fresh(CoreConfig::default());
        assert_eq!(h.translate(0x8000_1234, Access::Read), Ok(0x8000_1234));
        // Illegal physical address: bits above 56.
        assert_eq!(
            h.translate(0x0100_0000_0000_0000, Access::Read),
            Err(TranslateError::AccessFault)
        );
    }

    #[test]
    fn sv39_walk_translates_and_fills_tlb() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(&mut h, va, RAM_BASE + 0x8000, rwxuad());
        h.set_priv(Priv::User);
        h.mem_map.phys_write_u64(RAM_BASE + 0x8000, 0xfeed_face_dead_beef);

        assert_eq!(h.read_u64(va).unwrap(), 0xfeed_face_dead_beef);
        // read slot must now be populated, with the addend invariant
        // host_ptr = mem_addend + vaddr pointing at the backing bytes
        let e = &h.tlb.read[tlb_index(va)];
        assert_eq!(e.vaddr, va);
        let backing =
            h.mem_map.lookup(RAM_BASE + 0x8000).unwrap().ram_ptr().unwrap() as usize + 0x8000;
        assert_eq!(e.mem_addend.wrapping_add(va as usize), backing);
        assert_eq!(h.read_u8(va).unwrap(), 0xef);
    }

    #[test]
    fn canonical_violation_faults() {
        let mut h = fresh(CoreConfig::default());
        map_sv39(&mut h, 0x10_0000_0000, RAM_BASE, rwxuad());
        h.set_priv(Priv::User);
        // Bit 38 clear but bit 63 set: non-canonical for Sv39.
        assert_eq!(
            h.translate(0x8000_0000_0000_0000, Access::Read),
            Err(TranslateError::PageFault)
        );
    }

    #[test]
    fn invalid_and_reserved_ptes_fault() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        // W set without R is a reserved encoding.
        map_sv39(
            &mut h,
            va,
            RAM_BASE,
            (PteFlags::W | PteFlags::U | PteFlags::A | PteFlags::D).bits(),
        );
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));
        // Unmapped neighbour: invalid PTE.
        assert_eq!(h.translate(va + 0x20_0000, Access::Read), Err(TranslateError::PageFault));
    }

    #[test]
    fn permission_bits_checked_per_access() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(&mut h, va, RAM_BASE, (PteFlags::R | PteFlags::U | PteFlags::A).bits());
        h.set_priv(Priv::User);
        assert!(h.translate(va, Access::Read).is_ok());
        assert_eq!(h.translate(va, Access::Write), Err(TranslateError::PageFault));
        assert_eq!(h.translate(va, Access::Code), Err(TranslateError::PageFault));
    }

    #[test]
    fn user_pages_need_sum_from_supervisor() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(&mut h, va, RAM_BASE, rwxuad());
        h.set_priv(Priv::Supervisor);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));
        h.mstatus |= MSTATUS_SUM;
        assert!(h.translate(va, Access::Read).is_ok());
        // but never execute from U pages
        assert_eq!(h.translate(va, Access::Code), Err(TranslateError::PageFault));
    }

    #[test]
    fn supervisor_pages_closed_to_user() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(
            &mut h,
            va,
            RAM_BASE,
            (PteFlags::R | PteFlags::W | PteFlags::A | PteFlags::D).bits(),
        );
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));
    }

    #[test]
    fn mxr_grants_read_on_execute_only() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(&mut h, va, RAM_BASE, (PteFlags::X | PteFlags::U | PteFlags::A).bits());
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));
        h.mstatus |= MSTATUS_MXR;
        h.tlb.flush_all();
        assert!(h.translate(va, Access::Read).is_ok());
    }

    #[test]
    fn software_managed_a_d_faults() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        let flags = (PteFlags::R | PteFlags::W | PteFlags::U | PteFlags::D).bits();
        map_sv39(&mut h, va, RAM_BASE, flags); // A clear
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));

        let flags = (PteFlags::R | PteFlags::W | PteFlags::U | PteFlags::A).bits();
        map_sv39(&mut h, va, RAM_BASE, flags); // D clear
        assert!(h.translate(va, Access::Read).is_ok());
        assert_eq!(h.translate(va, Access::Write), Err(TranslateError::PageFault));
    }

    #[test]
    fn hardware_managed_a_d_writes_back() {
        let mut h = fresh(CoreConfig { hw_managed_ad: true, ..Default::default() });
        let va = 0x10_0000_0000u64;
        let flags = (PteFlags::R | PteFlags::W | PteFlags::U).bits();
        map_sv39(&mut h, va, RAM_BASE, flags);
        h.set_priv(Priv::User);
        assert!(h.translate(va, Access::Write).is_ok());
        let l0 = RAM_BASE + 0x3000;
        let vpn0 = (va >> 12) & 0x1ff;
        let pte = h.mem_map.phys_read_u64(l0 + vpn0 * 8);
        assert_ne!(pte & PteFlags::A.bits(), 0);
        assert_ne!(pte & PteFlags::D.bits(), 0);
    }

    #[test]
    fn superpage_misalignment_faults() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x4000_0000u64; // 1 GiB aligned
        let root = RAM_BASE + 0x1000;
        let vpn2 = (va >> 30) & 0x1ff;
        // Leaf at level 2 whose PPN has low bits set: misaligned.
        h.mem_map
            .phys_write_u64(root + vpn2 * 8, ((RAM_BASE >> 12) << 10) | rwxuad() | 1);
        h.satp = (8 << 60) | (root >> 12);
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Err(TranslateError::PageFault));
    }

    #[test]
    fn sv48_walk() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x1000_0000_0000u64; // needs the 4th level
        let root = RAM_BASE + 0x1000;
        let l2 = RAM_BASE + 0x2000;
        let l1 = RAM_BASE + 0x4000;
        let l0 = RAM_BASE + 0x5000;
        let vpn3 = (va >> 39) & 0x1ff;
        let vpn2 = (va >> 30) & 0x1ff;
        let vpn1 = (va >> 21) & 0x1ff;
        let vpn0 = (va >> 12) & 0x1ff;
        h.mem_map.phys_write_u64(root + vpn3 * 8, ((l2 >> 12) << 10) | 1);
        h.mem_map.phys_write_u64(l2 + vpn2 * 8, ((l1 >> 12) << 10) | 1);
        h.mem_map.phys_write_u64(l1 + vpn1 * 8, ((l0 >> 12) << 10) | 1);
        h.mem_map.phys_write_u64(l0 + vpn0 * 8, ((RAM_BASE >> 12) << 10) | rwxuad());
        h.satp = (9 << 60) | (root >> 12);
        h.set_priv(Priv::User);
        assert_eq!(h.translate(va, Access::Read), Ok(RAM_BASE));
    }

    #[test]
    fn mprv_uses_previous_privilege_for_data() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        map_sv39(&mut h, va, RAM_BASE + 0x8000, rwxuad());
        // M-mode with MPRV set and MPP = U: data accesses walk as U.
        h.mstatus |= MSTATUS_MPRV; // MPP already 3 from reset; set to 0
        h.mstatus &= !(3 << MSTATUS_MPP_SHIFT);
        assert_eq!(h.translate(va, Access::Read), Ok(RAM_BASE + 0x8000));
        // Fetches ignore MPRV: still machine-mode identity.
        assert_eq!(h.translate(va, Access::Code), Ok(va));
    }

    #[test]
    fn misaligned_disabled_traps() {
        let mut h = fresh(CoreConfig::default());
        let err = h.read_u32(RAM_BASE + 3).unwrap_err();
        assert_eq!(err.cause, Exception::MisalignedLoad);
        assert_eq!(err.tval, RAM_BASE + 3);
        let err = h.write_u32(RAM_BASE + 3, 0).unwrap_err();
        assert_eq!(err.cause, Exception::MisalignedStore);
    }

    #[test]
    fn misaligned_enabled_matches_byte_stream() {
        let mut h = fresh(CoreConfig { allow_misaligned: true, ..Default::default() });
        for (i, b) in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09].iter().enumerate() {
            h.write_u8(RAM_BASE + i as u64, *b).unwrap();
        }
        assert_eq!(h.read_u32(RAM_BASE + 3).unwrap(), u32::from_le_bytes([4, 5, 6, 7]));
        assert_eq!(h.read_u16(RAM_BASE + 1).unwrap(), u16::from_le_bytes([2, 3]));
        assert_eq!(
            h.read_u64(RAM_BASE + 1).unwrap(),
            u64::from_le_bytes([2, 3, 4, 5, 6, 7, 8, 9])
        );
        // misaligned store, then verify bytes
        h.write_u32(RAM_BASE + 0x103, 0xaabbccdd).unwrap();
        assert_eq!(h.read_u8(RAM_BASE + 0x103).unwrap(), 0xdd);
        assert_eq!(h.read_u8(RAM_BASE + 0x106).unwrap(), 0xaa);
    }

    #[test]
    fn random_misaligned_traffic_matches_byte_stream() {
        use rand::{Rng, SeedableRng};
        let _ = env_logger::builder().is_test(true).try_init();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x4d41_5247);
        let mut h = fresh(CoreConfig { allow_misaligned: true, ..Default::default() });
        let mut mirror = vec![0u8; 0x1000];

        for _ in 0..2000 {
            let off = rng.gen_range(0..0xff0) as u64;
            let addr = RAM_BASE + off;
            match rng.gen_range(0..6) {
                0 => {
                    let v: u16 = rng.gen();
                    h.write_u16(addr, v).unwrap();
                    mirror[off as usize..off as usize + 2].copy_from_slice(&v.to_le_bytes());
                }
                1 => {
                    let v: u32 = rng.gen();
                    h.write_u32(addr, v).unwrap();
                    mirror[off as usize..off as usize + 4].copy_from_slice(&v.to_le_bytes());
                }
                2 => {
                    let v: u64 = rng.gen();
                    h.write_u64(addr, v).unwrap();
                    mirror[off as usize..off as usize + 8].copy_from_slice(&v.to_le_bytes());
                }
                3 => {
                    let e = u16::from_le_bytes(
                        mirror[off as usize..off as usize + 2].try_into().unwrap(),
                    );
                    assert_eq!(h.read_u16(addr).unwrap(), e);
                }
                4 => {
                    let e = u32::from_le_bytes(
                        mirror[off as usize..off as usize + 4].try_into().unwrap(),
                    );
                    assert_eq!(h.read_u32(addr).unwrap(), e);
                }
                _ => {
                    let e = u64::from_le_bytes(
                        mirror[off as usize..off as usize + 8].try_into().unwrap(),
                    );
                    assert_eq!(h.read_u64(addr).unwrap(), e);
                }
            }
        }
        // final sweep: every byte agrees
        for (i, b) in mirror.iter().enumerate() {
            assert_eq!(h.read_u8(RAM_BASE + i as u64).unwrap(), *b);
        }
    }

    #[test]
    fn fetch_requires_ram_backing() {
        use crate::mem::{MmioDevice, WidthMask};
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Nothing;
        impl MmioDevice for Nothing {
            fn read(&mut self, _: &mut IoContext, _: u32, _: u32) -> u32 { 0 }
            fn write(&mut self, _: &mut IoContext, _: u32, _: u32, _: u32) {}
        }

        let mut map = MemoryMap::new();
        map.register_ram(RAM_BASE, 0x1_0000);
        map.register_device(0x4000_0000, 0x1000, Rc::new(RefCell::new(Nothing)), WidthMask::W32);
        let mut h = Hart::new(map, 0x1000, CoreConfig::default());
        let err = h.fetch_u16(0x4000_0000).unwrap_err();
        assert_eq!(err.cause, Exception::FaultFetch);
    }

    #[test]
    fn straddling_fetch_joins_pages() {
        let mut h = fresh(CoreConfig::default());
        // Place a 32-bit instruction across a page boundary.
        h.mem_map.write_ram(RAM_BASE + 0xffe, &0xdeadbeefu32.to_le_bytes());
        assert_eq!(h.fetch_insn32(RAM_BASE + 0xffe).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn straddling_fetch_faults_on_unmapped_second_page() {
        let mut h = fresh(CoreConfig::default());
        let va = 0x10_0000_0000u64;
        // Map only the first page executable.
        map_sv39(&mut h, va, RAM_BASE + 0x8000, rwxuad());
        h.set_priv(Priv::User);
        let err = h.fetch_insn32(va + 0xffe).unwrap_err();
        assert_eq!(err.cause, Exception::FetchPageFault);
        assert_eq!(err.tval, va + 0xffe);
    }

    #[test]
    fn store_then_load_same_address_via_tlb() {
        let mut h = fresh(CoreConfig::default());
        h.write_u64(RAM_BASE + 0x40, 0x1111_2222_3333_4444).unwrap();
        // fast path on second access
        h.write_u64(RAM_BASE + 0x40, 0x5555_6666_7777_8888).unwrap();
        assert_eq!(h.read_u64(RAM_BASE + 0x40).unwrap(), 0x5555_6666_7777_8888);
    }

    #[test]
    fn reservation_clobbered_by_store() {
        let mut h = fresh(CoreConfig::default());
        h.load_res = Some(RAM_BASE + 0x100);
        h.write_u8(RAM_BASE + 0x104, 1).unwrap();
        assert_eq!(h.load_res, None);
        h.load_res = Some(RAM_BASE + 0x100);
        h.write_u8(RAM_BASE + 0x200, 1).unwrap();
        assert_eq!(h.load_res, Some(RAM_BASE + 0x100));
    }
}
