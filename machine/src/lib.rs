//! The machine around the hart: default physical memory map, the
//! CLINT/PLIC/HTIF device complex, timer polling for the outer
//! scheduler, and checkpoint save/restore.
//!
//! Devices never hold references back into the machine; MMIO side
//! effects (interrupt lines, shutdown) travel through the access
//! context and are applied by the hart, so ownership stays a tree.

pub mod bootrom;
pub mod checkpoint;
mod clint;
mod htif;
mod plic;

use std::cell::RefCell;
use std::rc::Rc;

pub use clint::{Clint, RtcMode};
pub use htif::Htif;
pub use margay_cpu::{ConsoleSink, StdoutConsole};
pub use plic::Plic;

use margay_cpu::irq::{MIP_MEIP, MIP_MTIP, MIP_SEIP};
use margay_cpu::{CoreConfig, Hart, MemoryMap, WidthMask};

pub const LOW_RAM_SIZE: u64 = 0x1_0000; // 64 KiB
pub const ROM_BASE_ADDR: u64 = 0x0000_0000;
/// Reset vector; also where the recovery ROM's code region begins.
pub const BOOT_BASE_ADDR: u64 = 0x0000_1000;
pub const RAM_BASE_ADDR: u64 = 0x8000_0000;
pub const CLINT_BASE_ADDR: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x000c_0000;
pub const HTIF_BASE_ADDR: u64 = 0x4000_8000;
pub const PLIC_BASE_ADDR: u64 = 0x4010_0000;
pub const PLIC_SIZE: u64 = 0x0040_0000;

/// Nominal RTC frequency in Hz.
pub const RTC_FREQ: u64 = 10_000_000;
/// CPU cycles per RTC tick in virtual-time mode.
pub const RTC_FREQ_DIV: u64 = 16;

pub struct MachineConfig {
    pub ram_size: u64,
    pub rtc_real_time: bool,
    pub core: CoreConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig { ram_size: 0x800_0000, rtc_real_time: false, core: CoreConfig::default() }
    }
}

pub struct Machine {
    hart: Hart,
    clint: Rc<RefCell<Clint>>,
    plic: Rc<RefCell<Plic>>,
    htif: Rc<RefCell<Htif>>,
    ram_size: u64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Machine {
        let mut map = MemoryMap::new();
        map.register_ram(RAM_BASE_ADDR, config.ram_size);
        map.register_ram(ROM_BASE_ADDR, LOW_RAM_SIZE);

        let clint = Rc::new(RefCell::new(Clint::new(config.rtc_real_time)));
        map.register_device(CLINT_BASE_ADDR, CLINT_SIZE, clint.clone(), WidthMask::W32);

        let plic = Rc::new(RefCell::new(Plic::new()));
        map.register_device(PLIC_BASE_ADDR, PLIC_SIZE, plic.clone(), WidthMask::W32);

        let htif = Rc::new(RefCell::new(Htif::new(Box::new(StdoutConsole))));
        map.register_device(HTIF_BASE_ADDR, 16, htif.clone(), WidthMask::W32);

        let hart = Hart::new(map, BOOT_BASE_ADDR, config.core);
        Machine { hart, clint, plic, htif, ram_size: config.ram_size }
    }

    pub fn hart(&self) -> &Hart { &self.hart }

    pub fn hart_mut(&mut self) -> &mut Hart { &mut self.hart }

    pub fn ram_size(&self) -> u64 { self.ram_size }

    /// Advance the hart by up to `budget` instructions, raising the
    /// timer interrupt first if the RTC has passed mtimecmp.
    pub fn run(&mut self, budget: u64) -> u64 {
        self.poll_timer();
        self.hart.run(budget)
    }

    pub fn terminated(&self) -> bool { self.hart.terminated() }

    /// Current RTC value.
    pub fn rtc_time(&self) -> u64 { self.clint.borrow().time(self.hart.cycles()) }

    /// Raise MTIP when the timer has expired. Called between run
    /// slices; the guest retracts MTIP by writing mtimecmp.
    pub fn poll_timer(&mut self) {
        if self.hart.mip() & MIP_MTIP == 0 {
            let timecmp = self.clint.borrow().timecmp();
            if self.rtc_time() >= timecmp {
                self.hart.set_mip(MIP_MTIP);
            }
        }
    }

    /// How long the outer loop may sleep, in milliseconds, before the
    /// machine needs attention again. Zero when the hart is runnable.
    pub fn sleep_duration(&mut self, max_delay_ms: u64) -> u64 {
        let mut delay = max_delay_ms;
        if self.hart.mip() & MIP_MTIP == 0 {
            let timecmp = self.clint.borrow().timecmp();
            let now = self.rtc_time();
            if timecmp <= now {
                self.hart.set_mip(MIP_MTIP);
                delay = 0;
            } else {
                let ticks = timecmp - now;
                delay = delay.min(ticks / (RTC_FREQ / 1000));
            }
        }
        if !self.hart.power_down() {
            delay = 0;
        }
        delay
    }

    /// Drive an external interrupt line into the PLIC (sources 1..31).
    pub fn set_plic_irq(&mut self, irq: u32, level: bool) {
        let asserted = self.plic.borrow_mut().set_irq(irq, level);
        if asserted {
            self.hart.set_mip(MIP_MEIP | MIP_SEIP);
        } else {
            self.hart.reset_mip(MIP_MEIP | MIP_SEIP);
        }
    }

    /// Redirect HTIF console output. The hart's validation-register
    /// byte channel has its own sink, set through
    /// [`Hart::set_console`].
    pub fn set_console(&mut self, sink: Box<dyn ConsoleSink>) {
        self.htif.borrow_mut().set_console(sink);
    }

    pub fn htif_tohost(&self) -> u64 { self.htif.borrow().tohost() }

    pub fn htif_fromhost(&self) -> u64 { self.htif.borrow().fromhost() }

    pub fn clint(&self) -> &Rc<RefCell<Clint>> { &self.clint }

    /// Copy a flat image (kernel, initrd, boot blob) into RAM.
    pub fn load_image(&mut self, paddr: u64, data: &[u8]) -> bool {
        let ok = self.hart.mem_map_mut().write_ram(paddr, data);
        if ok {
            self.mark_ram_rewritten(paddr, data.len());
        }
        ok
    }

    /// Tell the hart a host-side writer touched guest RAM, so stale
    /// write-TLB entries cannot alias the old bytes.
    pub fn mark_ram_rewritten(&mut self, paddr: u64, len: usize) {
        let ptr = match self.hart.mem_map().lookup(paddr) {
            Some(r) if r.is_ram() => {
                let base = r.ram_ptr().unwrap();
                unsafe { base.add((paddr - r.addr) as usize) }
            }
            _ => return,
        };
        self.hart.flush_tlb_write_range_ram(ptr, len);
    }
}
