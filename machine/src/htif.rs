//! Host-target interface mailbox.
//!
//! Two 64-bit words, tohost and fromhost, each accessed as two 32-bit
//! halves. A write to the high half of tohost triggers command
//! processing: value 1 powers the machine off, device 1 command 1 emits
//! a character to the console sink, device 1 command 0 acknowledges a
//! read request, anything else is logged and dropped.

use margay_cpu::{ConsoleSink, IoContext, MmioDevice};

pub struct Htif {
    tohost: u64,
    fromhost: u64,
    console: Box<dyn ConsoleSink>,
}

impl Htif {
    pub fn new(console: Box<dyn ConsoleSink>) -> Htif {
        Htif { tohost: 0, fromhost: 0, console }
    }

    pub fn tohost(&self) -> u64 { self.tohost }

    pub fn set_tohost(&mut self, val: u64) { self.tohost = val; }

    pub fn fromhost(&self) -> u64 { self.fromhost }

    pub fn set_fromhost(&mut self, val: u64) { self.fromhost = val; }

    pub fn set_console(&mut self, console: Box<dyn ConsoleSink>) { self.console = console; }

    fn handle_cmd(&mut self, ctx: &mut IoContext) {
        let device = self.tohost >> 56;
        let cmd = (self.tohost >> 48) & 0xff;
        if self.tohost == 1 {
            log::info!("htif: power off");
            ctx.shutdown = true;
        } else if device == 1 && cmd == 1 {
            self.console.put_char(self.tohost as u8);
            self.tohost = 0;
            self.fromhost = (device << 56) | (cmd << 48);
        } else if device == 1 && cmd == 0 {
            // console read request; input arrives via fromhost later
            self.tohost = 0;
        } else if self.tohost != 0 {
            log::warn!("htif: unsupported tohost={:#018x}", self.tohost);
        }
    }
}

impl MmioDevice for Htif {
    fn read(&mut self, _ctx: &mut IoContext, offset: u32, _size_log2: u32) -> u32 {
        match offset {
            0 => self.tohost as u32,
            4 => (self.tohost >> 32) as u32,
            8 => self.fromhost as u32,
            12 => (self.fromhost >> 32) as u32,
            _ => 0,
        }
    }

    fn write(&mut self, ctx: &mut IoContext, offset: u32, val: u32, _size_log2: u32) {
        match offset {
            0 => self.tohost = (self.tohost & !0xffff_ffff) | val as u64,
            4 => {
                self.tohost = (self.tohost & 0xffff_ffff) | ((val as u64) << 32);
                self.handle_cmd(ctx);
            }
            8 => self.fromhost = (self.fromhost & !0xffff_ffff) | val as u64,
            12 => self.fromhost = (self.fromhost & 0xffff_ffff) | ((val as u64) << 32),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl ConsoleSink for Capture {
        fn put_char(&mut self, b: u8) { self.0.borrow_mut().push(b); }
    }

    fn with_capture() -> (Htif, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        (Htif::new(Box::new(Capture(buf.clone()))), buf)
    }

    #[test]
    fn putchar_emits_and_echoes_fromhost() {
        let (mut htif, buf) = with_capture();
        let mut ctx = IoContext::new(0);
        let tohost = (1u64 << 56) | (1 << 48) | b'A' as u64;
        htif.write(&mut ctx, 0, tohost as u32, 2);
        htif.write(&mut ctx, 4, (tohost >> 32) as u32, 2);
        assert_eq!(buf.borrow().as_slice(), b"A");
        assert_eq!(htif.tohost(), 0);
        assert_eq!(htif.fromhost(), (1 << 56) | (1 << 48));
        assert!(!ctx.shutdown);
    }

    #[test]
    fn tohost_one_requests_shutdown() {
        let (mut htif, _) = with_capture();
        let mut ctx = IoContext::new(0);
        htif.write(&mut ctx, 0, 1, 2);
        // processing waits for the high-half write
        assert!(!ctx.shutdown);
        htif.write(&mut ctx, 4, 0, 2);
        assert!(ctx.shutdown);
    }

    #[test]
    fn read_request_clears_tohost() {
        let (mut htif, buf) = with_capture();
        let mut ctx = IoContext::new(0);
        let tohost = 1u64 << 56; // device 1, cmd 0
        htif.write(&mut ctx, 0, tohost as u32, 2);
        htif.write(&mut ctx, 4, (tohost >> 32) as u32, 2);
        assert_eq!(htif.tohost(), 0);
        assert!(buf.borrow().is_empty());
    }

    #[test]
    fn halves_reassemble() {
        let (mut htif, _) = with_capture();
        let mut ctx = IoContext::new(0);
        htif.write(&mut ctx, 8, 0x1111_2222, 2);
        htif.write(&mut ctx, 12, 0x3333_4444, 2);
        assert_eq!(htif.fromhost(), 0x3333_4444_1111_2222);
        assert_eq!(htif.read(&mut ctx, 8, 2), 0x1111_2222);
        assert_eq!(htif.read(&mut ctx, 12, 2), 0x3333_4444);
    }
}
