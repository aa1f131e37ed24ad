//! Operand vocabulary shared by the encoder and decoder.
//!
//! Operand positions are fixed properties of the instruction encoding:
//! an 8-bit register lives in bits 5..3 or 2..0, a register pair in bits
//! 5..4, a condition in bits 5..3.

pub const REG8: [&str; 8] = ["b", "c", "d", "e", "h", "l", "(hl)", "a"];
pub const PAIR: [&str; 4] = ["bc", "de", "hl", "sp"];
pub const PAIR_QQ: [&str; 4] = ["bc", "de", "hl", "af"];
pub const COND: [&str; 8] = ["nz", "z", "nc", "c", "po", "pe", "p", "m"];
pub const ALU: [&str; 8] = ["add", "adc", "sub", "sbc", "and", "xor", "or", "cp"];
pub const SHIFT: [&str; 8] = ["rlc", "rrc", "rl", "rr", "sla", "sra", "sll", "srl"];

pub fn reg8_code(name: &str) -> Option<u8> {
    REG8.iter().position(|&r| r == name).map(|i| i as u8)
}

pub fn pair_code(name: &str) -> Option<u8> {
    PAIR.iter().position(|&r| r == name).map(|i| i as u8)
}

pub fn pair_qq_code(name: &str) -> Option<u8> {
    PAIR_QQ.iter().position(|&r| r == name).map(|i| i as u8)
}

pub fn cond_code(name: &str) -> Option<u8> {
    COND.iter().position(|&c| c == name).map(|i| i as u8)
}
