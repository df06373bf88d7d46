//! End-to-end scenarios driving the machine through its public
//! surface: guest programs in RAM, privilege transitions via MRET, and
//! the documented device contracts.

use std::cell::RefCell;
use std::rc::Rc;

use margay_cpu::{CoreConfig, Priv};
use margay_machine::{
    checkpoint, ConsoleSink, Machine, MachineConfig, BOOT_BASE_ADDR, HTIF_BASE_ADDR,
    RAM_BASE_ADDR,
};

const MRET: u32 = 0x3020_0073;
const ECALL: u32 = 0x0000_0073;
const EBREAK: u32 = 0x0010_0073;
const NOP: u32 = 0x0000_0013;

const MSTATUS_MIE: u64 = 1 << 3;
const MSTATUS_MPP: u64 = 3 << 11;
const MIP_MTIP: u64 = 1 << 7;

fn enc_i(op: u32, rd: u32, f3: u32, rs1: u32, imm: u32) -> u32 {
    op | (rd << 7) | (f3 << 12) | (rs1 << 15) | ((imm & 0xfff) << 20)
}

fn enc_s(op: u32, f3: u32, rs1: u32, rs2: u32, imm: u32) -> u32 {
    op | ((imm & 0x1f) << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | (((imm >> 5) & 0x7f) << 25)
}

fn enc_amo(funct5: u32, f3: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    0x2f | (rd << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | ((funct5 << 2) << 25)
}

fn machine() -> Machine {
    let _ = env_logger::builder().is_test(true).try_init();
    Machine::new(MachineConfig { ram_size: 0x10_0000, ..Default::default() })
}

fn load_prog(m: &mut Machine, addr: u64, prog: &[u32]) {
    let mut bytes = Vec::new();
    for w in prog {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    assert!(m.load_image(addr, &bytes));
}

/// Drop to the given privilege at `target` by staging MPP/mepc and
/// executing an MRET from the reset vector.
fn enter_via_mret(m: &mut Machine, privilege: u64, target: u64) {
    let hart = m.hart_mut();
    let mstatus = hart.csr_read(0x300, false).unwrap();
    hart.csr_write(0x300, (mstatus & !MSTATUS_MPP) | (privilege << 11)).unwrap();
    hart.csr_write(0x341, target).unwrap();
    load_prog(m, BOOT_BASE_ADDR, &[MRET]);
    assert_eq!(m.run(1), 1);
}

#[test]
fn ecall_from_user_mode() {
    let mut m = machine();
    m.hart_mut().csr_write(0x305, RAM_BASE_ADDR + 0x100).unwrap(); // mtvec
    load_prog(&mut m, RAM_BASE_ADDR, &[ECALL]);
    enter_via_mret(&mut m, 0, RAM_BASE_ADDR);
    assert_eq!(m.hart().privilege(), Priv::User);

    m.run(1);
    let hart = m.hart();
    assert_eq!(hart.csr_read(0x342, false).unwrap(), 8); // mcause: U ecall
    assert_eq!(hart.csr_read(0x341, false).unwrap(), RAM_BASE_ADDR);
    assert_eq!(hart.privilege(), Priv::Machine);
    assert_eq!(hart.pc(), RAM_BASE_ADDR + 0x100);
}

#[test]
fn delegated_breakpoint_lands_in_supervisor() {
    let mut m = machine();
    {
        let hart = m.hart_mut();
        hart.csr_write(0x302, 1 << 3).unwrap(); // medeleg: breakpoint
        hart.csr_write(0x105, RAM_BASE_ADDR + 0x200).unwrap(); // stvec
    }
    load_prog(&mut m, RAM_BASE_ADDR, &[EBREAK]);
    enter_via_mret(&mut m, 1, RAM_BASE_ADDR);
    assert_eq!(m.hart().privilege(), Priv::Supervisor);

    m.run(1);
    let hart = m.hart();
    assert_eq!(hart.csr_read(0x142, false).unwrap(), 3); // scause
    assert_eq!(hart.csr_read(0x141, false).unwrap(), RAM_BASE_ADDR); // sepc
    assert_eq!(hart.privilege(), Priv::Supervisor);
    assert_eq!(hart.pc(), RAM_BASE_ADDR + 0x200);
}

#[test]
fn sv39_walk_from_user_mode() {
    let mut m = machine();
    let va: u64 = 0x10_0000_0000;
    let root = RAM_BASE_ADDR + 0x1_0000;
    let l1 = RAM_BASE_ADDR + 0x1_1000;
    let l0 = RAM_BASE_ADDR + 0x1_2000;
    {
        let map = m.hart_mut().mem_map_mut();
        // three-level walk: vpn2=64, vpn1=0, vpn0=0
        map.phys_write_u64(root + 64 * 8, ((l1 >> 12) << 10) | 1);
        map.phys_write_u64(l1, ((l0 >> 12) << 10) | 1);
        // leaf: V|R|W|X|U|A|D
        map.phys_write_u64(l0, ((RAM_BASE_ADDR >> 12) << 10) | 0xdf);
    }
    m.hart_mut().csr_write(0x180, (8 << 60) | (root >> 12)).unwrap(); // satp: Sv39

    // At the mapped physical page: lb x5, 16(x6), with the payload byte
    // 16 bytes in.
    load_prog(&mut m, RAM_BASE_ADDR, &[enc_i(0x03, 5, 0, 6, 16)]);
    m.load_image(RAM_BASE_ADDR + 16, &[0x7f]);
    m.hart_mut().set_reg(6, va);

    enter_via_mret(&mut m, 0, va);
    assert_eq!(m.run(1), 1); // the load retires without faulting
    assert_eq!(m.hart().reg(5), 0x7f);
    assert_eq!(m.hart().privilege(), Priv::User);
    assert_eq!(m.hart().pc(), va + 4);

    // The read slot is now cached: clearing the leaf PTE must not
    // affect a second load from the same page.
    m.hart_mut().mem_map_mut().phys_write_u64(l0, 0);
    assert_eq!(m.hart_mut().read_u8(va + 16).unwrap(), 0x7f);
}

#[test]
fn lr_sc_contention_fails_sc() {
    let mut m = machine();
    let addr = RAM_BASE_ADDR + 0x800;
    {
        let hart = m.hart_mut();
        hart.set_reg(5, addr);
        hart.set_reg(6, 0x1111);
        hart.mem_map_mut().phys_write_u64(addr, 0xaaaa);
    }
    load_prog(
        &mut m,
        RAM_BASE_ADDR,
        &[
            enc_amo(0x02, 3, 7, 5, 0), // lr.d x7, (x5)
            enc_s(0x23, 3, 5, 6, 0),   // sd x6, 0(x5)
            enc_amo(0x03, 3, 8, 5, 6), // sc.d x8, x6, (x5)
        ],
    );
    m.hart_mut().set_pc(RAM_BASE_ADDR);
    m.run(3);

    let hart = m.hart();
    assert_eq!(hart.reg(7), 0xaaaa);
    assert_eq!(hart.reg(8), 1); // SC failed
    // memory holds the intervening store, untouched by the SC
    assert_eq!(hart.mem_map().phys_read_u64(addr), 0x1111);
}

#[test]
fn misaligned_load_emulation() {
    let mut m = Machine::new(MachineConfig {
        ram_size: 0x10_0000,
        core: CoreConfig { allow_misaligned: true, ..Default::default() },
        ..Default::default()
    });
    // bytes 0x01..0x05 so that 0x8000_0003..7 hold 02 03 04 05
    m.load_image(RAM_BASE_ADDR + 2, &[0x01, 0x02, 0x03, 0x04, 0x05]);
    load_prog(&mut m, RAM_BASE_ADDR + 0x100, &[enc_i(0x03, 1, 2, 6, 3)]); // lw x1, 3(x6)
    m.hart_mut().set_reg(6, RAM_BASE_ADDR);
    m.hart_mut().set_pc(RAM_BASE_ADDR + 0x100);
    assert_eq!(m.run(1), 1);
    assert_eq!(m.hart().reg(1), 0x0504_0302);
}

#[test]
fn timer_interrupt_after_nop() {
    let mut m = machine();
    {
        let hart = m.hart_mut();
        hart.csr_write(0x305, RAM_BASE_ADDR + 0x300).unwrap(); // mtvec
        hart.csr_write(0x304, MIP_MTIP).unwrap(); // mie.MTIE
        let mstatus = hart.csr_read(0x300, false).unwrap();
        hart.csr_write(0x300, mstatus | MSTATUS_MIE).unwrap();
    }
    // Push the timer out, run the NOP, then arm it at "now".
    m.clint().borrow_mut().set_timecmp(u64::MAX);
    load_prog(&mut m, RAM_BASE_ADDR, &[NOP, NOP]);
    load_prog(&mut m, RAM_BASE_ADDR + 0x300, &[NOP]); // handler
    m.hart_mut().set_pc(RAM_BASE_ADDR);
    assert_eq!(m.run(1), 1);
    assert_eq!(m.hart().pc(), RAM_BASE_ADDR + 4);

    let now = m.rtc_time();
    m.clint().borrow_mut().set_timecmp(now);
    m.run(1);
    let hart = m.hart();
    assert_eq!(hart.csr_read(0x342, false).unwrap(), (1 << 63) | 7);
    assert_eq!(hart.csr_read(0x341, false).unwrap(), RAM_BASE_ADDR + 4); // after the NOP
    assert_eq!(hart.pc(), RAM_BASE_ADDR + 0x304); // handler retired one insn
}

#[test]
fn guest_writes_mtimecmp_clear_mtip() {
    let mut m = machine();
    // MTIP starts raised (timecmp = 0 is already expired)
    m.poll_timer();
    assert_ne!(m.hart().mip() & MIP_MTIP as u32, 0);

    // Guest: sd x6, 0x4000(x5) with x5 = CLINT base; the 64-bit store
    // is emulated as two 32-bit device accesses.
    let prog = [enc_s(0x23, 3, 5, 6, 0), NOP];
    load_prog(&mut m, RAM_BASE_ADDR, &prog);
    {
        let hart = m.hart_mut();
        hart.set_reg(5, 0x0200_0000 + 0x4000);
        hart.set_reg(6, u64::MAX);
        hart.set_pc(RAM_BASE_ADDR);
    }
    m.hart_mut().run(1); // bypass poll_timer so MTIP stays as the store leaves it
    assert_eq!(m.hart().mip() & MIP_MTIP as u32, 0);
    assert_eq!(m.clint().borrow().timecmp(), u64::MAX);
}

struct Capture(Rc<RefCell<Vec<u8>>>);

impl ConsoleSink for Capture {
    fn put_char(&mut self, b: u8) { self.0.borrow_mut().push(b); }
}

#[test]
fn htif_putchar_and_shutdown_from_guest() {
    let mut m = machine();
    let buf = Rc::new(RefCell::new(Vec::new()));
    m.set_console(Box::new(Capture(buf.clone())));

    // sd of the putchar command, then sd of the shutdown word
    let putchar = (1u64 << 56) | (1 << 48) | b'X' as u64;
    let prog = [
        enc_s(0x23, 3, 5, 6, 0), // sd x6, 0(x5)
        enc_s(0x23, 3, 5, 7, 0), // sd x7, 0(x5)
        NOP,
    ];
    load_prog(&mut m, RAM_BASE_ADDR, &prog);
    {
        let hart = m.hart_mut();
        hart.set_reg(5, HTIF_BASE_ADDR);
        hart.set_reg(6, putchar);
        hart.set_reg(7, 1);
        hart.set_pc(RAM_BASE_ADDR);
    }
    let retired = m.run(10);
    assert_eq!(buf.borrow().as_slice(), b"X");
    assert_eq!(m.htif_fromhost(), (1 << 56) | (1 << 48));
    assert!(m.terminated());
    // the shutdown store retires before the loop observes termination
    assert_eq!(retired, 2);
}

#[test]
fn checkpoint_round_trip_preserves_state() {
    let mut m = machine();
    // Build up some state: scratch CSRs, registers, dirty FP, S-mode.
    {
        let hart = m.hart_mut();
        hart.csr_write(0x340, 0x1234_5678_9abc_def0).unwrap();
        hart.csr_write(0x140, 0x0fed_cba9_8765_4321).unwrap();
        hart.csr_write(0x105, RAM_BASE_ADDR + 0x400).unwrap();
        hart.csr_write(0x003, 0x25).unwrap(); // fcsr: dirties fs
        hart.set_reg(10, 0xdead_beef);
        hart.set_fp_reg(4, 0x4010_0000_0000_0000);
    }
    assert!(m.load_image(RAM_BASE_ADDR + 0x1000, b"checkpoint payload"));
    load_prog(&mut m, RAM_BASE_ADDR, &[NOP, NOP, NOP]);
    enter_via_mret(&mut m, 1, RAM_BASE_ADDR);
    m.run(2);

    let prefix = {
        let mut p = std::env::temp_dir();
        p.push(format!("margay-scenario-{}", std::process::id()));
        p.to_str().unwrap().to_string()
    };
    checkpoint::save(&m, &prefix).unwrap();

    let mut fresh = machine();
    checkpoint::restore(&mut fresh, &prefix).unwrap();

    assert_eq!(fresh.hart().arch_state(), m.hart().arch_state());
    let mut payload = [0u8; 18];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = fresh.hart_mut().read_u8(RAM_BASE_ADDR + 0x1000 + i as u64).unwrap();
    }
    assert_eq!(&payload, b"checkpoint payload");

    // the restored machine keeps executing from the same spot
    let pc = fresh.hart().pc();
    assert_eq!(pc, m.hart().pc());
    fresh.run(1);
    assert_eq!(fresh.hart().pc(), pc + 4);

    for ext in ["re_regs", "mainram", "bootram"] {
        let _ = std::fs::remove_file(format!("{}.{}", prefix, ext));
    }
}

#[test]
fn counters_consistent_across_run_slices() {
    let mut m = machine();
    load_prog(&mut m, RAM_BASE_ADDR, &[NOP, NOP, NOP, NOP]);
    m.hart_mut().set_pc(RAM_BASE_ADDR);
    m.clint().borrow_mut().set_timecmp(u64::MAX);
    m.run(2);
    m.run(2);
    let hart = m.hart();
    assert_eq!(hart.csr_read(0xb02, false).unwrap(), 4); // minstret
    assert_eq!(hart.csr_read(0xb00, false).unwrap(), 4); // mcycle
}
