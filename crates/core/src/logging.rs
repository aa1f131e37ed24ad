//! Runtime logging configuration.
//!
//! Log output is gated by a process-global [`LogConfig`] with one level per
//! emulator subsystem, so tracing can be turned on for (say) the CPU alone
//! without recompiling. The check is a relaxed atomic load, cheap enough to
//! sit inside the instruction loop.

use std::sync::atomic::{AtomicU8, Ordering};

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse a log level from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category, one per emulator subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// CPU execution (instruction tracing, register dumps)
    Cpu,
    /// Memory bus and bank mapping
    Bus,
    /// Video display processor
    Vdp,
    /// Programmable sound generator
    Psg,
    /// Interrupt assertion and acceptance
    Interrupts,
    /// Assembler and disassembler
    Asm,
}

/// Global logging configuration.
///
/// A category whose level is `Off` falls back to the global level.
pub struct LogConfig {
    global_level: AtomicU8,
    cpu_level: AtomicU8,
    bus_level: AtomicU8,
    vdp_level: AtomicU8,
    psg_level: AtomicU8,
    interrupt_level: AtomicU8,
    asm_level: AtomicU8,
}

impl LogConfig {
    const fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            cpu_level: AtomicU8::new(LogLevel::Off as u8),
            bus_level: AtomicU8::new(LogLevel::Off as u8),
            vdp_level: AtomicU8::new(LogLevel::Off as u8),
            psg_level: AtomicU8::new(LogLevel::Off as u8),
            interrupt_level: AtomicU8::new(LogLevel::Off as u8),
            asm_level: AtomicU8::new(LogLevel::Off as u8),
        }
    }

    /// Get the global singleton instance.
    pub fn global() -> &'static Self {
        static INSTANCE: LogConfig = LogConfig::new();
        &INSTANCE
    }

    /// Set the fallback level used by categories without their own.
    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    fn slot(&self, category: LogCategory) -> &AtomicU8 {
        match category {
            LogCategory::Cpu => &self.cpu_level,
            LogCategory::Bus => &self.bus_level,
            LogCategory::Vdp => &self.vdp_level,
            LogCategory::Psg => &self.psg_level,
            LogCategory::Interrupts => &self.interrupt_level,
            LogCategory::Asm => &self.asm_level,
        }
    }

    /// Set the level for a specific category.
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.slot(category).store(level as u8, Ordering::Relaxed);
    }

    /// Get the level for a specific category.
    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.slot(category).load(Ordering::Relaxed))
    }

    /// Return whether a message at `level` should be emitted for `category`.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all levels to `Off`.
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for cat in [
            LogCategory::Cpu,
            LogCategory::Bus,
            LogCategory::Vdp,
            LogCategory::Psg,
            LogCategory::Interrupts,
            LogCategory::Asm,
        ] {
            self.set_level(cat, LogLevel::Off);
        }
    }
}

/// Emit a log line if the category/level combination is enabled.
#[macro_export]
macro_rules! log {
    ($category:expr, $level:expr, $($arg:tt)*) => {
        if $crate::logging::LogConfig::global().should_log($category, $level) {
            eprintln!($($arg)*);
        }
    };
}
