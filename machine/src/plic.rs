//! Platform-level interrupt controller, claim/complete subset.
//!
//! Only the per-hart claim/complete register pair is modeled. A claim
//! returns the lowest pending, not-yet-served source (1..31) and marks
//! it served; completing (writing source number) clears the served bit.
//! The pending-minus-served mask drives MEIP and SEIP together.

use margay_cpu::irq::{MIP_MEIP, MIP_SEIP};
use margay_cpu::{IoContext, MmioDevice};

const PLIC_HART_BASE: u32 = 0x20_0000;

pub struct Plic {
    pending: u32,
    served: u32,
}

impl Plic {
    pub fn new() -> Plic { Plic { pending: 0, served: 0 } }

    /// External interrupt line update. Returns whether the external
    /// interrupt output is now asserted.
    pub fn set_irq(&mut self, irq: u32, level: bool) -> bool {
        debug_assert!((1..32).contains(&irq), "PLIC source 0 is reserved");
        let mask = 1 << (irq - 1);
        if level {
            self.pending |= mask;
        } else {
            self.pending &= !mask;
        }
        self.pending & !self.served != 0
    }

    pub fn asserted(&self) -> bool { self.pending & !self.served != 0 }

    fn update_mip(&self, ctx: &mut IoContext) {
        if self.asserted() {
            ctx.mip_set |= MIP_MEIP | MIP_SEIP;
            ctx.mip_clear &= !(MIP_MEIP | MIP_SEIP);
        } else {
            ctx.mip_clear |= MIP_MEIP | MIP_SEIP;
        }
    }
}

impl Default for Plic {
    fn default() -> Self { Plic::new() }
}

impl MmioDevice for Plic {
    fn read(&mut self, ctx: &mut IoContext, offset: u32, _size_log2: u32) -> u32 {
        match offset {
            PLIC_HART_BASE => 0, // threshold, unimplemented
            o if o == PLIC_HART_BASE + 4 => {
                let mask = self.pending & !self.served;
                if mask != 0 {
                    let i = mask.trailing_zeros();
                    self.served |= 1 << i;
                    self.update_mip(ctx);
                    i + 1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn write(&mut self, ctx: &mut IoContext, offset: u32, val: u32, _size_log2: u32) {
        if offset == PLIC_HART_BASE + 4 {
            let irq = val.wrapping_sub(1);
            if irq < 32 {
                self.served &= !(1 << irq);
                self.update_mip(ctx);
            }
        }
    }
}
