//! I/O port space decoder.
//!
//! The Z80's 256 ports fan out by number:
//!
//! - `0x00-0x06`: Game Gear system ports (start button, serial latches,
//!   PSG stereo)
//! - `0x3E`: memory control (BIOS overlay enable)
//! - `0x40-0x7F`: V counter on even ports, H counter on odd; writes go to
//!   the PSG
//! - `0x80-0xBF`: VDP data on even ports, control/status on odd
//! - `0xDC`/`0xCD`: joypad buttons, active-low
//! - `0xC1`/`0xDD`: miscellaneous, always 0xFF
//!
//! Unassigned reads return 0xFF and unassigned writes are dropped, which
//! matches the floating bus on hardware.

use crate::mmu::Mmu;
use crate::psg::Psg;
use crate::vdp::Vdp;
use std::cell::RefCell;
use std::rc::Rc;

/// I/O state: system port latches and button bits.
pub struct Io {
    vdp: Rc<RefCell<Vdp>>,
    psg: Rc<RefCell<Psg>>,
    ports: [u8; 6],
    /// Joypad bits, active-low (1 = released)
    buttons: u8,
    /// Start button latch, active-low
    start: bool,
}

impl Io {
    pub fn new(vdp: Rc<RefCell<Vdp>>, psg: Rc<RefCell<Psg>>) -> Self {
        Self {
            vdp,
            psg,
            ports: [0; 6],
            buttons: 0xFF,
            start: true,
        }
    }

    pub fn power(&mut self) {
        self.ports[0x00] = 0xC0; // Overseas mode, NTSC
        self.ports[0x01] = 0x7F;
        self.ports[0x02] = 0xFF;
        self.ports[0x03] = 0x00;
        self.ports[0x04] = 0xFF;
        self.ports[0x05] = 0x00;

        self.buttons = 0xFF;
        self.start = true;
    }

    /// Whether the IRQ line into the CPU is active.
    pub fn check_irq(&self) -> bool {
        self.vdp.borrow().assert_irq()
    }

    /// Set the state of one joypad button (bit number 0-5).
    pub fn set_button(&mut self, button: u8, pressed: bool) {
        self.buttons = (self.buttons & !(1 << button)) | ((!pressed as u8) << button);
    }

    /// Set the state of the start button.
    pub fn set_start(&mut self, pressed: bool) {
        self.start = !pressed;
    }

    fn read_system_port(&self, port: u8) -> u8 {
        match port {
            0x00 => (self.ports[0] & 0x7F) | (self.start as u8) << 7,
            0x01..=0x05 => self.ports[port as usize],
            _ => 0xFF,
        }
    }

    fn write_system_port(&mut self, port: u8, value: u8) {
        match port {
            0x01..=0x03 => self.ports[port as usize] = value,
            0x05 => self.ports[5] = value & 0xF8,
            0x06 => self.psg.borrow_mut().stereo(value),
            _ => {}
        }
    }

    /// Read a byte from the given port.
    pub fn port_read(&mut self, port: u8) -> u8 {
        if port <= 0x06 {
            self.read_system_port(port)
        } else if port <= 0x3F {
            0xFF
        } else if port <= 0x7F && port % 2 == 0 {
            self.vdp.borrow().v_counter
        } else if port <= 0x7F {
            self.vdp.borrow().h_counter
        } else if port <= 0xBF && port % 2 == 0 {
            self.vdp.borrow_mut().read_data()
        } else if port <= 0xBF {
            self.vdp.borrow_mut().read_control()
        } else if port == 0xCD || port == 0xDC {
            self.buttons
        } else {
            // Includes 0xC1/0xDD: always set outside SMS mode
            0xFF
        }
    }

    /// Write a byte to the given port.
    pub fn port_write(&mut self, mmu: &mut Mmu, port: u8, value: u8) {
        if port <= 0x06 {
            self.write_system_port(port, value);
        } else if port <= 0x3F && port % 2 == 0 {
            // Memory control: bit 3 clear overlays the BIOS
            mmu.bios_enabled = value & 0x08 == 0;
        } else if port <= 0x3F {
            // I/O control register: unhandled
        } else if port <= 0x7F {
            self.psg.borrow_mut().write(value);
        } else if port <= 0xBF && port % 2 == 0 {
            self.vdp.borrow_mut().write_data(value);
        } else if port <= 0xBF {
            self.vdp.borrow_mut().write_control(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Io, Mmu) {
        let vdp = Rc::new(RefCell::new(Vdp::new()));
        let psg = Rc::new(RefCell::new(Psg::new()));
        vdp.borrow_mut().power();
        let mut io = Io::new(vdp, psg);
        io.power();
        (io, Mmu::new())
    }

    #[test]
    fn test_start_button_on_port_0() {
        let (mut io, _) = fixture();
        assert_eq!(io.port_read(0x00) & 0x80, 0x80);
        io.set_start(true);
        assert_eq!(io.port_read(0x00) & 0x80, 0x00);
        io.set_start(false);
        assert_eq!(io.port_read(0x00) & 0x80, 0x80);
    }

    #[test]
    fn test_buttons_active_low() {
        let (mut io, _) = fixture();
        assert_eq!(io.port_read(0xDC), 0xFF);
        io.set_button(2, true);
        assert_eq!(io.port_read(0xDC), 0xFB);
        assert_eq!(io.port_read(0xCD), 0xFB);
        io.set_button(2, false);
        assert_eq!(io.port_read(0xDC), 0xFF);
    }

    #[test]
    fn test_port_5_masked() {
        let (mut io, mut mmu) = fixture();
        io.port_write(&mut mmu, 0x05, 0xFF);
        assert_eq!(io.port_read(0x05), 0xF8);
    }

    #[test]
    fn test_stereo_byte_routed_to_psg() {
        let (mut io, mut mmu) = fixture();
        io.port_write(&mut mmu, 0x06, 0x41);
        assert_eq!(io.psg.borrow().stereo_mask(), 0x41);
    }

    #[test]
    fn test_memory_control_toggles_bios() {
        let (mut io, mut mmu) = fixture();
        io.port_write(&mut mmu, 0x3E, 0x00);
        assert!(mmu.bios_enabled);
        io.port_write(&mut mmu, 0x3E, 0x08);
        assert!(!mmu.bios_enabled);
    }

    #[test]
    fn test_vdp_ports_reachable() {
        let (mut io, mut mmu) = fixture();
        // Set up a VRAM write through the control port, then write data
        io.port_write(&mut mmu, 0xBF, 0x00);
        io.port_write(&mut mmu, 0xBF, 0x40);
        io.port_write(&mut mmu, 0xBE, 0x5A);
        // Read it back through a VRAM-read sequence
        io.port_write(&mut mmu, 0xBF, 0x00);
        io.port_write(&mut mmu, 0xBF, 0x00);
        assert_eq!(io.port_read(0xBE), 0x5A);
    }

    #[test]
    fn test_v_counter_on_even_ports() {
        let (mut io, _) = fixture();
        io.vdp.borrow_mut().v_counter = 0x42;
        assert_eq!(io.port_read(0x7E), 0x42);
        assert_eq!(io.port_read(0x40), 0x42);
        assert_eq!(io.port_read(0x7F), 0x00); // H counter
    }

    #[test]
    fn test_default_ports() {
        let (mut io, _) = fixture();
        assert_eq!(io.port_read(0x10), 0xFF);
        assert_eq!(io.port_read(0xC1), 0xFF);
        assert_eq!(io.port_read(0xDD), 0xFF);
        assert_eq!(io.port_read(0xF0), 0xFF);
    }

    #[test]
    fn test_psg_write_range() {
        let (mut io, mut mmu) = fixture();
        io.port_write(&mut mmu, 0x7F, 0x95); // channel 0 volume 5
        assert_eq!(io.psg.borrow().volume(0), 0x05);
    }
}
