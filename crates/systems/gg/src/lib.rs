//! Sega Game Gear machine.
//!
//! The machine is five cooperating parts: the Z80 interpreter from
//! `crater_core`, the MMU, the VDP, the PSG, and the I/O port decoder.
//! [`GameGear`] owns them all and drives the whole lot one scanline at a
//! time: the VDP renders a line, then the CPU consumes that line's share
//! of the 3.58 MHz clock, with fractional cycles carried forward so a
//! frame always comes out to the same cycle count.
//!
//! # Timing
//!
//! - CPU clock: 3.579545 MHz
//! - 262 scanlines per frame (NTSC), 60 frames per second
//! - ~227.7 CPU cycles per scanline, ~59,659 per frame
//!
//! # Usage
//!
//! ```no_run
//! use crater_gg::{Button, GameGear, Rom};
//!
//! let rom = Rom::open("game.gg").unwrap();
//! let mut gg = GameGear::new();
//! gg.load_rom(&rom);
//! gg.simulate(|gg| {
//!     // runs once per frame at 60 Hz; read gg.frame(), feed input
//!     gg.set_button(Button::Start, false);
//! });
//! if let Some(message) = gg.exception_message() {
//!     eprintln!("caught exception: {}", message);
//! }
//! ```

pub mod io;
pub mod mmu;
pub mod psg;
pub mod rom;
pub mod save;
pub mod vdp;

pub use rom::{Rom, RomError, RomInfo};
pub use save::{Save, SaveError};

use crater_core::cpu_z80::{BusZ80, CpuZ80, IoFault};
use crater_core::log;
use crater_core::logging::{LogCategory, LogLevel};
use crater_core::types::Frame;
use io::Io;
use mmu::Mmu;
use psg::Psg;
use serde::Serialize;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vdp::{Vdp, LINES_PER_FRAME};

pub const SCREEN_WIDTH: u32 = vdp::SCREEN_WIDTH;
pub const SCREEN_HEIGHT: u32 = vdp::SCREEN_HEIGHT;
pub const FPS: u32 = 60;

// Clock speed in Hz, from the official documentation
const CPU_CLOCK_SPEED: f64 = 3_579_545.0;
const CYCLES_PER_LINE: f64 = CPU_CLOCK_SPEED / (FPS as f64 * LINES_PER_FRAME as f64);
const NS_PER_FRAME: u64 = 1_000_000_000 / FPS as u64;

/// Game Gear joypad buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    Trigger1,
    Trigger2,
    Start,
}

impl Button {
    /// Bit position in the joypad byte; `None` for the start button,
    /// which lives on system port 0 instead.
    fn joypad_bit(self) -> Option<u8> {
        match self {
            Button::Up => Some(0),
            Button::Down => Some(1),
            Button::Left => Some(2),
            Button::Right => Some(3),
            Button::Trigger1 => Some(4),
            Button::Trigger2 => Some(5),
            Button::Start => None,
        }
    }
}

/// The CPU's view of the machine: MMU for memory, I/O decoder for ports.
pub struct GgBus {
    pub mmu: Mmu,
    pub io: Io,
}

impl BusZ80 for GgBus {
    fn read(&self, addr: u16) -> u8 {
        self.mmu.read_byte(addr)
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.mmu.write_byte(addr, val);
    }

    fn io_read(&mut self, port: u8) -> Result<u8, IoFault> {
        Ok(self.io.port_read(port))
    }

    fn io_write(&mut self, port: u8, val: u8) -> Result<(), IoFault> {
        self.io.port_write(&mut self.mmu, port, val);
        Ok(())
    }

    fn irq_pending(&self) -> bool {
        self.io.check_irq()
    }
}

/// The whole machine.
pub struct GameGear {
    pub cpu: CpuZ80<GgBus>,
    vdp: Rc<RefCell<Vdp>>,
    psg: Rc<RefCell<Psg>>,
    powered: Arc<AtomicBool>,
}

impl GameGear {
    pub fn new() -> Self {
        let vdp = Rc::new(RefCell::new(Vdp::new()));
        let psg = Rc::new(RefCell::new(Psg::new()));
        let bus = GgBus {
            mmu: Mmu::new(),
            io: Io::new(Rc::clone(&vdp), Rc::clone(&psg)),
        };
        Self {
            cpu: CpuZ80::new(bus),
            vdp,
            psg,
            powered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Map a ROM image. Has no effect while the machine is powered.
    pub fn load_rom(&mut self, rom: &Rom) {
        if self.powered.load(Ordering::SeqCst) {
            return;
        }
        self.cpu.bus.mmu.load_rom(rom);
    }

    /// Attach a save for persistent cartridge RAM.
    pub fn load_save(&mut self, save: Save) {
        self.cpu.bus.mmu.load_save(save);
    }

    /// Handle used to power the machine off from outside the simulation
    /// loop. A SIGINT hook should store `false` here and nothing else.
    pub fn power_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.powered)
    }

    /// Request a cooperative power-off at the next frame boundary.
    pub fn power_off(&self) {
        self.powered.store(false, Ordering::SeqCst);
    }

    fn power_on(&mut self) {
        log!(LogCategory::Bus, LogLevel::Debug, "GameGear: powering on");
        self.powered.store(true, Ordering::SeqCst);
        self.cpu.bus.mmu.power();
        self.vdp.borrow_mut().power();
        self.psg.borrow_mut().power();
        self.cpu.bus.io.power();
        self.cpu.power();
    }

    /// Simulate a single frame: 262 scanlines, each one VDP line plus the
    /// CPU's cycle share. Returns whether the CPU raised an exception.
    pub fn run_frame(&mut self) -> bool {
        for _ in 0..LINES_PER_FRAME {
            self.vdp.borrow_mut().simulate_line();
            if self.cpu.run_cycles(CYCLES_PER_LINE) {
                return true;
            }
        }
        false
    }

    /// Power on and simulate until an exception or power-off.
    ///
    /// The callback runs after every frame (sixty times per second); it
    /// may inspect the frame, feed input, or power the machine off. The
    /// loop sleeps out the remainder of each 1/60 s slot; if a frame ran
    /// long, it just carries on late.
    pub fn simulate<F: FnMut(&mut GameGear)>(&mut self, mut callback: F) {
        if self.powered.load(Ordering::SeqCst) {
            return;
        }
        self.power_on();

        let frame_duration = Duration::from_nanos(NS_PER_FRAME);
        while self.powered.load(Ordering::SeqCst) {
            let start = Instant::now();

            if self.run_frame() || !self.powered.load(Ordering::SeqCst) {
                break;
            }
            callback(self);

            let elapsed = start.elapsed();
            if elapsed < frame_duration {
                std::thread::sleep(frame_duration - elapsed);
            }
        }

        log!(LogCategory::Bus, LogLevel::Debug, "GameGear: powering off");
        self.power_off();
        self.cpu.bus.mmu.flush_save();
    }

    /// Set the state of a joypad or start button.
    pub fn set_button(&mut self, button: Button, pressed: bool) {
        match button.joypad_bit() {
            Some(bit) => self.cpu.bus.io.set_button(bit, pressed),
            None => self.cpu.bus.io.set_start(pressed),
        }
    }

    /// The most recently rendered frame.
    pub fn frame(&self) -> Ref<'_, Frame> {
        Ref::map(self.vdp.borrow(), Vdp::frame)
    }

    /// Human-readable description of the machine exception, if one is set.
    pub fn exception_message(&self) -> Option<String> {
        self.cpu.exception.map(|exc| exc.to_string())
    }

    /// JSON snapshot of CPU and VDP state for frontend debug dumps.
    pub fn debug_state(&self) -> serde_json::Value {
        let cpu = &self.cpu;
        let vdp = self.vdp.borrow();
        serde_json::json!({
            "cpu": {
                "af": format!("{:04X}", cpu.af()),
                "bc": format!("{:04X}", cpu.bc()),
                "de": format!("{:04X}", cpu.de()),
                "hl": format!("{:04X}", cpu.hl()),
                "ix": format!("{:04X}", cpu.ix),
                "iy": format!("{:04X}", cpu.iy),
                "sp": format!("{:04X}", cpu.sp),
                "pc": format!("{:04X}", cpu.pc),
                "i": cpu.i,
                "r": cpu.r,
                "im": cpu.im,
                "iff1": cpu.iff1,
                "iff2": cpu.iff2,
            },
            "vdp": {
                "v_counter": vdp.v_counter,
                "h_counter": vdp.h_counter,
            },
            "exception": self.exception_message(),
        })
    }

    /// Write cart RAM back to the save file immediately.
    pub fn flush_save(&mut self) {
        self.cpu.bus.mmu.flush_save();
    }
}

impl Default for GameGear {
    fn default() -> Self {
        Self::new()
    }
}
