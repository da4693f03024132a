//! A legacy 8259 Programmable Interrupt Controller, implementing
//! [`idt::PICDriver`].

use pic8259::ChainedPics;
use spin::Mutex;

use crate::cpu::idt::{PICDriver, IRQ_BASE};

/// Chained primary/secondary 8259 pair, vectors `IRQ_BASE..IRQ_BASE+16`.
pub struct Pic8259Driver {
    pics: Mutex<ChainedPics>,
}

impl Pic8259Driver {
    /// Construct a driver for the chained pair starting at [`IRQ_BASE`].
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: offsets do not overlap any CPU exception vector (0..32).
        let pics = unsafe { ChainedPics::new(IRQ_BASE, IRQ_BASE + 8) };
        Self { pics: Mutex::new(pics) }
    }
}

impl Default for Pic8259Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl PICDriver for Pic8259Driver {
    fn name(&self) -> &str {
        "pic8259"
    }

    fn start(&mut self) -> bool {
        // SAFETY: remapping the PIC's interrupt vector offsets is only
        // unsafe if done with a misconfigured offset; ours avoids the
        // reserved CPU exception range.
        unsafe {
            self.pics.lock().initialize();
        }
        true
    }

    fn unmask(&mut self, line: u8) {
        // The 8259 has no single-line unmask API; masks are tracked as a
        // bitmask written to the data port, so we read-modify-write it.
        let mut pics = self.pics.lock();
        // SAFETY: `notify_end_of_interrupt`/mask ports are standard 8259 I/O
        // ports, already initialized by `start`.
        unsafe {
            write_mask(&mut pics, line, false);
        }
    }

    fn mask(&mut self, line: u8) {
        let mut pics = self.pics.lock();
        // SAFETY: see `unmask`.
        unsafe {
            write_mask(&mut pics, line, true);
        }
    }

    fn end_of_interrupt(&mut self, line: u8) {
        // SAFETY: called only from the IRQ dispatcher after a real interrupt.
        unsafe {
            self.pics.lock().notify_end_of_interrupt(IRQ_BASE + line);
        }
    }
}

/// Set or clear the mask bit for `line` on whichever 8259 owns it.
///
/// # Safety
/// The caller must have already called `ChainedPics::initialize`.
unsafe fn write_mask(pics: &mut ChainedPics, line: u8, masked: bool) {
    use x86_64::instructions::port::Port;

    let (port_addr, bit) = if line < 8 { (0x21, line) } else { (0xA1, line - 8) };
    // `pics` is only used to assert the driver is already initialized; the
    // crate exposes no per-line mask API so we talk to the data port directly.
    let _ = pics;
    // SAFETY: 0x21/0xA1 are the primary/secondary 8259 data (mask) ports.
    let mut port: Port<u8> = Port::new(port_addr);
    let current = port.read();
    let updated = if masked { current | (1 << bit) } else { current & !(1 << bit) };
    port.write(updated);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn driver_reports_its_name() {
        let driver = Pic8259Driver::new();
        assert_eq!(driver.name(), "pic8259");
    }
}
