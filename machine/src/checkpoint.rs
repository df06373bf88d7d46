//! Checkpoint save/restore.
//!
//! A dump is three files sharing a prefix: `<prefix>.re_regs` (textual
//! key:value lines for the architectural state and the memory-range
//! descriptors), `<prefix>.mainram` (raw main RAM bytes) and
//! `<prefix>.bootram` (raw low RAM bytes -- the original image when the
//! hart sits at the reset vector in M-mode, a synthesized recovery ROM
//! otherwise).
//!
//! Restore reloads both RAM images and re-applies the `.re_regs` state
//! directly, so a restored machine resumes without executing the
//! recovery ROM; the ROM is still written for consumers that boot the
//! image elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};

use margay_cpu::{ArchState, Priv};

use crate::bootrom::{self, RomOverflow};
use crate::{Machine, BOOT_BASE_ADDR, LOW_RAM_SIZE, RAM_BASE_ADDR, ROM_BASE_ADDR};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Format(String),
    RomOverflow(RomOverflow),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "checkpoint I/O error: {}", e),
            Error::Format(s) => write!(f, "checkpoint format error: {}", s),
            Error::RomOverflow(o) => write!(f, "{}", o),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error { Error::Io(e) }
}

impl From<RomOverflow> for Error {
    fn from(e: RomOverflow) -> Error { Error::RomOverflow(e) }
}

pub fn save(machine: &Machine, prefix: &str) -> Result<(), Error> {
    let state = machine.hart().arch_state();

    write_re_regs(machine, &state, &format!("{}.re_regs", prefix))?;

    let main = ram_bytes(machine, RAM_BASE_ADDR)?;
    fs::write(format!("{}.mainram", prefix), main)?;

    let boot_path = format!("{}.bootram", prefix);
    if state.privilege != Priv::Machine || state.pc > ROM_BASE_ADDR + LOW_RAM_SIZE {
        // Running guest code: synthesize a ROM that rebuilds the state.
        log::info!("checkpoint: synthesizing a recovery boot ROM");
        let timecmp = machine.clint().borrow().timecmp();
        let rom = bootrom::build_recovery_rom(&state, timecmp)?;
        fs::write(boot_path, rom)?;
    } else if state.pc == BOOT_BASE_ADDR {
        log::info!("checkpoint: reusing the resident boot ROM");
        fs::write(boot_path, ram_bytes(machine, ROM_BASE_ADDR)?)?;
    } else {
        return Err(Error::Format(format!(
            "cannot checkpoint while executing inside the ROM (pc={:#x})",
            state.pc
        )));
    }
    Ok(())
}

pub fn restore(machine: &mut Machine, prefix: &str) -> Result<(), Error> {
    let mut state = machine.hart().arch_state();
    parse_re_regs(&fs::read_to_string(format!("{}.re_regs", prefix))?, &mut state)?;

    let main = fs::read(format!("{}.mainram", prefix))?;
    if main.len() as u64 != machine.ram_size() {
        return Err(Error::Format(format!(
            "mainram image is {} bytes, machine has {}",
            main.len(),
            machine.ram_size()
        )));
    }
    let boot = fs::read(format!("{}.bootram", prefix))?;
    if boot.len() as u64 != LOW_RAM_SIZE {
        return Err(Error::Format(format!(
            "bootram image is {} bytes, low RAM is {}",
            boot.len(),
            LOW_RAM_SIZE
        )));
    }

    machine.hart_mut().mem_map_mut().write_ram(RAM_BASE_ADDR, &main);
    machine.hart_mut().mem_map_mut().write_ram(ROM_BASE_ADDR, &boot);
    machine.mark_ram_rewritten(RAM_BASE_ADDR, main.len());
    machine.mark_ram_rewritten(ROM_BASE_ADDR, boot.len());

    machine.hart_mut().restore_arch_state(&state);
    Ok(())
}

fn ram_bytes(machine: &Machine, base: u64) -> Result<Vec<u8>, Error> {
    machine
        .hart()
        .mem_map()
        .lookup(base)
        .and_then(|r| r.ram_slice())
        .map(|s| s.to_vec())
        .ok_or_else(|| Error::Format(format!("no RAM range at {:#x}", base)))
}

fn write_re_regs(machine: &Machine, s: &ArchState, path: &str) -> Result<(), Error> {
    let mut f = BufWriter::new(fs::File::create(path)?);

    writeln!(f, "# margay serialization file")?;
    writeln!(f, "pc:0x{:x}", s.pc)?;
    for i in 1..32 {
        writeln!(f, "reg_x{}:0x{:x}", i, s.reg[i])?;
    }
    if s.fs != 0 {
        for i in 0..32 {
            writeln!(f, "reg_f{}:0x{:x}", i, s.fp_reg[i])?;
        }
        writeln!(f, "fflags:0x{:x}", s.fflags)?;
        writeln!(f, "frm:0x{:x}", s.frm)?;
    }
    writeln!(f, "priv:{}", s.privilege.letter())?;
    writeln!(f, "fs:0x{:x}", s.fs)?;
    writeln!(f, "insn_counter:{}", s.insn_counter)?;
    writeln!(f, "minstret:{}", s.minstret)?;
    writeln!(f, "mcycle:{}", s.mcycle)?;

    writeln!(f, "mstatus:0x{:x}", s.mstatus)?;
    writeln!(f, "mtvec:0x{:x}", s.mtvec)?;
    writeln!(f, "mscratch:0x{:x}", s.mscratch)?;
    writeln!(f, "mepc:0x{:x}", s.mepc)?;
    writeln!(f, "mcause:0x{:x}", s.mcause)?;
    writeln!(f, "mtval:0x{:x}", s.mtval)?;

    writeln!(f, "misa:0x{:x}", s.misa)?;
    writeln!(f, "mie:0x{:x}", s.mie)?;
    writeln!(f, "mip:0x{:x}", s.mip)?;
    writeln!(f, "medeleg:0x{:x}", s.medeleg)?;
    writeln!(f, "mideleg:0x{:x}", s.mideleg)?;
    writeln!(f, "mcounteren:0x{:x}", s.mcounteren)?;
    writeln!(f, "tselect:0x{:x}", s.tselect)?;
    writeln!(f, "tdata1:0x{:x}", s.tdata1)?;
    writeln!(f, "tdata2:0x{:x}", s.tdata2)?;
    writeln!(f, "tdata3:0x{:x}", s.tdata3)?;
    for i in 3..32 {
        writeln!(f, "mhpmevent{}:0x{:x}", i, s.mhpmevent[i])?;
    }

    writeln!(f, "stvec:0x{:x}", s.stvec)?;
    writeln!(f, "sscratch:0x{:x}", s.sscratch)?;
    writeln!(f, "sepc:0x{:x}", s.sepc)?;
    writeln!(f, "scause:0x{:x}", s.scause)?;
    writeln!(f, "stval:0x{:x}", s.stval)?;
    writeln!(f, "satp:0x{:x}", s.satp)?;
    writeln!(f, "scounteren:0x{:x}", s.scounteren)?;

    writeln!(f, "dcsr:0x{:x}", s.dcsr)?;
    writeln!(f, "dpc:0x{:x}", s.dpc)?;
    writeln!(f, "dscratch:0x{:x}", s.dscratch)?;

    for (i, r) in machine.hart().mem_map().ranges().iter().enumerate().rev() {
        writeln!(
            f,
            "mrange{}:0x{:x} 0x{:x} {}",
            i,
            r.addr,
            r.size,
            if r.is_ram() { "ram" } else { "io" }
        )?;
    }
    f.flush()?;
    Ok(())
}

fn parse_u64(v: &str) -> Result<u64, Error> {
    let r = if let Some(hex) = v.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        v.parse::<u64>()
    };
    r.map_err(|_| Error::Format(format!("bad numeric value '{}'", v)))
}

/// Apply `.re_regs` lines over `state`. Unknown keys are tolerated so
/// the format can grow; `mrange` descriptors are informational.
fn parse_re_regs(text: &str, state: &mut ArchState) -> Result<(), Error> {
    let mut kv = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Format(format!("malformed line '{}'", line)))?;
        kv.insert(key.to_string(), value.to_string());
    }

    let take = |key: &str, slot: &mut u64| -> Result<(), Error> {
        if let Some(v) = kv.get(key) {
            *slot = parse_u64(v)?;
        }
        Ok(())
    };

    take("pc", &mut state.pc)?;
    for i in 1..32 {
        take(&format!("reg_x{}", i), &mut state.reg[i])?;
    }
    for i in 0..32 {
        take(&format!("reg_f{}", i), &mut state.fp_reg[i])?;
    }
    take("insn_counter", &mut state.insn_counter)?;
    take("minstret", &mut state.minstret)?;
    take("mcycle", &mut state.mcycle)?;
    take("mstatus", &mut state.mstatus)?;
    take("mtvec", &mut state.mtvec)?;
    take("mscratch", &mut state.mscratch)?;
    take("mepc", &mut state.mepc)?;
    take("mcause", &mut state.mcause)?;
    take("mtval", &mut state.mtval)?;
    take("tdata1", &mut state.tdata1)?;
    take("tdata2", &mut state.tdata2)?;
    take("tdata3", &mut state.tdata3)?;
    for i in 3..32 {
        take(&format!("mhpmevent{}", i), &mut state.mhpmevent[i])?;
    }
    take("stvec", &mut state.stvec)?;
    take("sscratch", &mut state.sscratch)?;
    take("sepc", &mut state.sepc)?;
    take("scause", &mut state.scause)?;
    take("stval", &mut state.stval)?;
    take("satp", &mut state.satp)?;
    take("dcsr", &mut state.dcsr)?;
    take("dpc", &mut state.dpc)?;
    take("dscratch", &mut state.dscratch)?;

    let take32 = |key: &str, slot: &mut u32| -> Result<(), Error> {
        if let Some(v) = kv.get(key) {
            *slot = parse_u64(v)? as u32;
        }
        Ok(())
    };
    take32("fflags", &mut state.fflags)?;
    take32("misa", &mut state.misa)?;
    take32("mie", &mut state.mie)?;
    take32("mip", &mut state.mip)?;
    take32("medeleg", &mut state.medeleg)?;
    take32("mideleg", &mut state.mideleg)?;
    take32("mcounteren", &mut state.mcounteren)?;
    take32("tselect", &mut state.tselect)?;
    take32("scounteren", &mut state.scounteren)?;

    if let Some(v) = kv.get("frm") {
        state.frm = parse_u64(v)? as u8;
    }
    if let Some(v) = kv.get("fs") {
        state.fs = parse_u64(v)? as u8;
    }
    if let Some(v) = kv.get("priv") {
        state.privilege = match v.as_str() {
            "U" => Priv::User,
            "S" => Priv::Supervisor,
            "M" => Priv::Machine,
            other => return Err(Error::Format(format!("unknown privilege '{}'", other))),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_prefix(tag: &str) -> String {
        let mut p = PathBuf::from(std::env::temp_dir());
        p.push(format!(
            "margay-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        p.to_str().unwrap().to_string()
    }

    fn cleanup(prefix: &str) {
        for ext in ["re_regs", "mainram", "bootram"] {
            let _ = fs::remove_file(format!("{}.{}", prefix, ext));
        }
    }

    #[test]
    fn re_regs_round_trip() {
        let machine = Machine::new(MachineConfig { ram_size: 0x2_0000, ..Default::default() });
        let mut state = machine.hart().arch_state();
        state.pc = 0x8000_1234;
        state.reg[10] = 0xdead_beef;
        state.fs = 3;
        state.fp_reg[2] = 0x4000_0000_0000_0000;
        state.fflags = 0x11;
        state.privilege = Priv::Supervisor;
        state.satp = (8 << 60) | 0x80001;
        state.minstret = 123456;

        let prefix = temp_prefix("reregs");
        write_re_regs(&machine, &state, &format!("{}.re_regs", prefix)).unwrap();

        let mut parsed = machine.hart().arch_state();
        parse_re_regs(&fs::read_to_string(format!("{}.re_regs", prefix)).unwrap(), &mut parsed)
            .unwrap();
        assert_eq!(parsed, state);
        cleanup(&prefix);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let mut state = Machine::new(MachineConfig::default()).hart().arch_state();
        assert!(parse_re_regs("pc=0x1000", &mut state).is_err());
        assert!(parse_re_regs("pc:zz", &mut state).is_err());
        assert!(parse_re_regs("priv:X", &mut state).is_err());
        // comments and unknown keys are fine
        parse_re_regs("# hello\nfuture_key:1\npc:0x1000", &mut state).unwrap();
        assert_eq!(state.pc, 0x1000);
    }

    #[test]
    fn save_at_reset_vector_reuses_rom() {
        let mut machine = Machine::new(MachineConfig { ram_size: 0x2_0000, ..Default::default() });
        machine.load_image(ROM_BASE_ADDR + 0x1000, &[0x13, 0, 0, 0]);
        let prefix = temp_prefix("reset");
        save(&machine, &prefix).unwrap();
        let boot = fs::read(format!("{}.bootram", prefix)).unwrap();
        assert_eq!(boot.len() as u64, LOW_RAM_SIZE);
        assert_eq!(&boot[0x1000..0x1004], &[0x13, 0, 0, 0]);
        cleanup(&prefix);
    }

    #[test]
    fn restore_rejects_wrong_ram_size() {
        let machine = Machine::new(MachineConfig { ram_size: 0x2_0000, ..Default::default() });
        let prefix = temp_prefix("badsize");
        save(&machine, &prefix).unwrap();
        let mut other = Machine::new(MachineConfig { ram_size: 0x4_0000, ..Default::default() });
        assert!(matches!(restore(&mut other, &prefix), Err(Error::Format(_))));
        cleanup(&prefix);
    }
}
