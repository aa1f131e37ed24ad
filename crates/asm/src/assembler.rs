//! Two-pass Z80 assembler producing Game Gear ROM images.
//!
//! The first pass walks the source to size instructions and collect label
//! addresses; the second encodes for real and lays bytes into the image.
//! Header directives configure the 16-byte TMR SEGA header, which is
//! written last, after the checksum band can be summed.
//!
//! Errors carry the offending line's number and text.

use crate::operands::{cond_code, pair_code, pair_qq_code, reg8_code, ALU, SHIFT};
use crater_gg::rom::{
    bcd_encode, compute_checksum, region_string_to_code, size_bytes_to_code, size_code_to_bytes,
};
use std::collections::HashMap;
use thiserror::Error;

const ROM_BANK_SIZE: usize = 16 * 1024;
const MAX_ROM_SIZE: usize = 1 << 20;
const HEADER_LOCATIONS: [usize; 3] = [0x7FF0, 0x3FF0, 0x1FF0];

/// An assembly failure, pinned to a source line.
#[derive(Debug, Error)]
#[error("line {line}: {message}\n    {text}")]
pub struct AsmError {
    pub line: usize,
    pub text: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumMode {
    Computed,
    Off,
    Fixed(u16),
}

/// Parsed operand. Registers, conditions, and labels all start life as
/// names; the encoder decides which reading a position allows.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Name(String),
    Num(i64),
    /// Signed offset written with an explicit sign: a relative target
    Rel(i64),
    /// (hl), (bc), (de), (sp), (c)
    IndName(String),
    /// ($1234) or (label)
    IndNum(u16),
    /// (ix+d) / (iy-d); plain (ix) carries d = 0
    IndIdx(String, i8),
}

struct Assembler {
    symbols: HashMap<String, u16>,
    writes: Vec<(usize, u8)>,
    cursor: usize,
    high_water: usize,
    pass: u8,

    rom_size: Option<usize>,
    header_location: Option<usize>,
    checksum: ChecksumMode,
    product_code: u32,
    version: u8,
    region_code: u8,
    declared_size: Option<u8>,
}

/// Assemble source text into a ROM image.
pub fn assemble(source: &str) -> Result<Vec<u8>, AsmError> {
    let mut asm = Assembler {
        symbols: HashMap::new(),
        writes: Vec::new(),
        cursor: 0,
        high_water: 0,
        pass: 1,
        rom_size: None,
        header_location: None,
        checksum: ChecksumMode::Computed,
        product_code: 0,
        version: 0,
        region_code: 6, // GG Export
        declared_size: None,
    };
    asm.run_pass(source, 1)?;
    asm.cursor = 0;
    asm.run_pass(source, 2)?;
    asm.finish(source)
}

impl Assembler {
    fn run_pass(&mut self, source: &str, pass: u8) -> Result<(), AsmError> {
        self.pass = pass;
        for (index, raw) in source.lines().enumerate() {
            let number = index + 1;
            let line = strip_comment(raw).trim().to_owned();
            if line.is_empty() {
                continue;
            }

            self.process_line(&line, pass).map_err(|message| AsmError {
                line: number,
                text: raw.trim().to_owned(),
                message,
            })?;
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str, pass: u8) -> Result<(), String> {
        // Label definitions may share a line with an instruction
        let mut rest = line;
        if let Some((label, tail)) = line.split_once(':') {
            if is_label_name(label) {
                if pass == 1 {
                    if self
                        .symbols
                        .insert(label.to_owned(), self.cursor as u16)
                        .is_some()
                    {
                        return Err(format!("duplicate label '{}'", label));
                    }
                }
                rest = tail.trim_start();
                if rest.is_empty() {
                    return Ok(());
                }
            }
        }

        if rest.starts_with('.') {
            self.process_directive(rest, pass)
        } else {
            self.process_instruction(rest, pass)
        }
    }

    fn process_directive(&mut self, line: &str, pass: u8) -> Result<(), String> {
        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (line, ""),
        };

        match name {
            ".org" => {
                let value = self.parse_value(arg, pass)? as usize;
                if value >= MAX_ROM_SIZE {
                    return Err("origin beyond the largest supported ROM".into());
                }
                self.cursor = value;
            }
            ".block" => {
                let bank = self.parse_value(arg, pass)? as usize;
                if bank >= MAX_ROM_SIZE / ROM_BANK_SIZE {
                    return Err("bank number out of range".into());
                }
                self.cursor = bank * ROM_BANK_SIZE;
            }
            ".byte" => {
                for tok in split_operands(arg) {
                    let value = self.parse_value(&tok, pass)?;
                    if !(-128..=255).contains(&value) {
                        return Err(format!("byte value out of range: {}", value));
                    }
                    self.emit(&[value as u8], pass);
                }
            }
            ".space" => {
                let mut parts = split_operands(arg).into_iter();
                let count = parts
                    .next()
                    .ok_or("missing length for .space")
                    .and_then(|t| self.parse_value(&t, pass).map_err(|_| "bad length"))?
                    as usize;
                let fill = match parts.next() {
                    Some(tok) => self.parse_value(&tok, pass)? as u8,
                    None => 0,
                };
                for _ in 0..count {
                    self.emit(&[fill], pass);
                }
            }
            ".ascii" | ".asciz" | ".asciiz" => {
                let bytes = parse_string(arg)?;
                self.emit(&bytes, pass);
                if name != ".ascii" {
                    self.emit(&[0], pass);
                }
            }
            ".rom_size" => {
                let size = parse_size(arg).ok_or("unrecognized ROM size")?;
                size_bytes_to_code(size).ok_or("size does not map to a size code")?;
                self.rom_size = Some(size);
            }
            ".rom_header" => {
                if arg == "auto" {
                    self.header_location = None;
                } else {
                    let location = self.parse_value(arg, pass)? as usize;
                    if !HEADER_LOCATIONS.contains(&location) {
                        return Err("header must sit at $1FF0, $3FF0, or $7FF0".into());
                    }
                    self.header_location = Some(location);
                }
            }
            ".rom_checksum" => {
                self.checksum = match arg {
                    "on" | "auto" => ChecksumMode::Computed,
                    "off" => ChecksumMode::Off,
                    _ => ChecksumMode::Fixed(self.parse_value(arg, pass)? as u16),
                };
            }
            ".rom_product" => {
                let code = self.parse_value(arg, pass)?;
                if !(0..=159999).contains(&code) {
                    return Err("product code out of range".into());
                }
                self.product_code = code as u32;
            }
            ".rom_version" => {
                let version = self.parse_value(arg, pass)?;
                if !(0..=15).contains(&version) {
                    return Err("version must fit in a nibble".into());
                }
                self.version = version as u8;
            }
            ".rom_region" => {
                self.region_code = if let Ok(text) = parse_string(arg) {
                    let text = String::from_utf8(text).map_err(|_| "bad region name")?;
                    region_string_to_code(&text).ok_or("unknown region name")?
                } else {
                    let code = self.parse_value(arg, pass)?;
                    if !(0..=15).contains(&code) {
                        return Err("region code must fit in a nibble".into());
                    }
                    code as u8
                };
            }
            ".rom_declsize" => {
                if arg == "auto" {
                    self.declared_size = None;
                } else {
                    let code = self.parse_value(arg, pass)? as u8;
                    size_code_to_bytes(code).ok_or("invalid size code")?;
                    self.declared_size = Some(code);
                }
            }
            ".cross_blocks" => {} // accepted for compatibility
            ".include" => return Err("the .include directive is not supported".into()),
            _ => return Err(format!("unknown directive '{}'", name)),
        }
        Ok(())
    }

    fn process_instruction(&mut self, line: &str, pass: u8) -> Result<(), String> {
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) => (m.to_lowercase(), rest.trim()),
            None => (line.to_lowercase(), ""),
        };
        let operands = split_operands(rest)
            .iter()
            .map(|tok| self.parse_operand(tok, pass))
            .collect::<Result<Vec<_>, _>>()?;

        let bytes = self.encode(&mnemonic, &operands)?;
        self.emit(&bytes, pass);
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8], pass: u8) {
        for &byte in bytes {
            if pass == 2 {
                self.writes.push((self.cursor, byte));
            }
            self.cursor += 1;
        }
        self.high_water = self.high_water.max(self.cursor);
    }

    // Operand and value parsing

    fn parse_value(&self, tok: &str, pass: u8) -> Result<i64, String> {
        if let Some(value) = parse_number(tok) {
            return Ok(value);
        }
        if is_label_name(tok) {
            return match self.symbols.get(tok) {
                Some(&value) => Ok(value as i64),
                None if pass == 1 => Ok(0),
                None => Err(format!("undefined symbol '{}'", tok)),
            };
        }
        Err(format!("unparseable value '{}'", tok))
    }

    fn parse_operand(&self, tok: &str, pass: u8) -> Result<Operand, String> {
        if let Some(inner) = tok.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            let inner = inner.trim();
            match inner {
                "hl" | "bc" | "de" | "sp" | "c" => return Ok(Operand::IndName(inner.into())),
                "ix" | "iy" => return Ok(Operand::IndIdx(inner.into(), 0)),
                _ => {}
            }
            for reg in ["ix", "iy"] {
                if let Some(offset) = inner.strip_prefix(reg) {
                    let offset = offset.trim();
                    let disp = match offset.as_bytes().first() {
                        Some(b'+') => self.parse_value(offset[1..].trim(), pass)?,
                        Some(b'-') => -self.parse_value(offset[1..].trim(), pass)?,
                        _ => return Err(format!("bad index operand '{}'", tok)),
                    };
                    if !(-128..=127).contains(&disp) {
                        return Err("index displacement out of range".into());
                    }
                    return Ok(Operand::IndIdx(reg.into(), disp as i8));
                }
            }
            return Ok(Operand::IndNum(self.parse_value(inner, pass)? as u16));
        }

        if tok.starts_with('+') || (tok.starts_with('-') && parse_number(tok).is_some()) {
            return Ok(Operand::Rel(self.parse_value(tok, pass)?));
        }
        if let Some(value) = parse_number(tok) {
            return Ok(Operand::Num(value));
        }
        // Register and condition names are lowercase; anything else is a
        // label and keeps its case.
        Ok(Operand::Name(tok.to_owned()))
    }

    /// Resolve an operand to a numeric value (immediate or label).
    fn value_of(&self, op: &Operand) -> Result<i64, String> {
        match op {
            Operand::Num(value) | Operand::Rel(value) => Ok(*value),
            Operand::Name(name) => match self.symbols.get(name) {
                Some(&value) => Ok(value as i64),
                // Sizing pass: forward references resolve later
                None if self.pass == 1 => Ok(0),
                None => Err(format!("undefined symbol '{}'", name)),
            },
            _ => Err("expected a value".into()),
        }
    }

    fn is_value(&self, op: &Operand) -> bool {
        match op {
            Operand::Num(_) | Operand::Rel(_) => true,
            Operand::Name(name) => {
                self.symbols.contains_key(name)
                    || (reg8_code(name).is_none()
                        && pair_qq_code(name).is_none()
                        && !matches!(name.as_str(), "sp" | "ix" | "iy" | "i" | "r"))
            }
            _ => false,
        }
    }

    // Instruction encoding

    fn encode(&self, mnemonic: &str, ops: &[Operand]) -> Result<Vec<u8>, String> {
        use Operand::*;

        let simple = |bytes: &[u8]| -> Result<Vec<u8>, String> { Ok(bytes.to_vec()) };

        match mnemonic {
            "nop" => simple(&[0x00]),
            "halt" => simple(&[0x76]),
            "di" => simple(&[0xF3]),
            "ei" => simple(&[0xFB]),
            "daa" => simple(&[0x27]),
            "cpl" => simple(&[0x2F]),
            "scf" => simple(&[0x37]),
            "ccf" => simple(&[0x3F]),
            "rlca" => simple(&[0x07]),
            "rla" => simple(&[0x17]),
            "rrca" => simple(&[0x0F]),
            "rra" => simple(&[0x1F]),
            "exx" => simple(&[0xD9]),
            "neg" => simple(&[0xED, 0x44]),
            "reti" => simple(&[0xED, 0x4D]),
            "retn" => simple(&[0xED, 0x45]),
            "rrd" => simple(&[0xED, 0x67]),
            "rld" => simple(&[0xED, 0x6F]),
            "ldi" => simple(&[0xED, 0xA0]),
            "ldd" => simple(&[0xED, 0xA8]),
            "ldir" => simple(&[0xED, 0xB0]),
            "lddr" => simple(&[0xED, 0xB8]),
            "cpi" => simple(&[0xED, 0xA1]),
            "cpd" => simple(&[0xED, 0xA9]),
            "cpir" => simple(&[0xED, 0xB1]),
            "cpdr" => simple(&[0xED, 0xB9]),
            "ini" => simple(&[0xED, 0xA2]),
            "ind" => simple(&[0xED, 0xAA]),
            "inir" => simple(&[0xED, 0xB2]),
            "indr" => simple(&[0xED, 0xBA]),
            "outi" => simple(&[0xED, 0xA3]),
            "outd" => simple(&[0xED, 0xAB]),
            "otir" => simple(&[0xED, 0xB3]),
            "otdr" => simple(&[0xED, 0xBB]),

            "im" => match ops {
                [op] => match self.value_of(op)? {
                    0 => simple(&[0xED, 0x46]),
                    1 => simple(&[0xED, 0x56]),
                    2 => simple(&[0xED, 0x5E]),
                    _ => Err("interrupt mode must be 0, 1, or 2".into()),
                },
                _ => Err("im takes one operand".into()),
            },

            "ld" => self.encode_ld(ops),
            "add" | "adc" | "sub" | "sbc" | "and" | "xor" | "or" | "cp" => {
                self.encode_alu(mnemonic, ops)
            }
            "inc" => self.encode_incdec(ops, true),
            "dec" => self.encode_incdec(ops, false),

            "push" | "pop" => {
                let is_push = mnemonic == "push";
                match ops {
                    [Name(name)] => {
                        if let Some(prefix) = index_prefix(name) {
                            simple(&[prefix, if is_push { 0xE5 } else { 0xE1 }])
                        } else if let Some(code) = pair_qq_code(name) {
                            simple(&[if is_push { 0xC5 } else { 0xC1 } | code << 4])
                        } else {
                            Err(format!("cannot {} '{}'", mnemonic, name))
                        }
                    }
                    _ => Err(format!("{} takes one register pair", mnemonic)),
                }
            }

            "ex" => match ops {
                [Name(a), Name(b)] if a == "af" && b == "af'" => simple(&[0x08]),
                [Name(a), Name(b)] if a == "de" && b == "hl" => simple(&[0xEB]),
                [IndName(a), Name(b)] if a == "sp" && b == "hl" => simple(&[0xE3]),
                [IndName(a), Name(b)] if a == "sp" => match index_prefix(b) {
                    Some(prefix) => simple(&[prefix, 0xE3]),
                    None => Err("bad ex operands".into()),
                },
                _ => Err("bad ex operands".into()),
            },

            "jp" => match ops {
                [IndName(name)] if name == "hl" => simple(&[0xE9]),
                [IndIdx(reg, 0)] => simple(&[index_prefix(reg).unwrap(), 0xE9]),
                [op] if self.is_value(op) => {
                    let target = self.value_of(op)? as u16;
                    simple(&[0xC3, target as u8, (target >> 8) as u8])
                }
                [Name(cond), op] => {
                    let code = cond_code(cond).ok_or("bad jump condition")?;
                    let target = self.value_of(op)? as u16;
                    simple(&[0xC2 | code << 3, target as u8, (target >> 8) as u8])
                }
                _ => Err("bad jp operands".into()),
            },
            "jr" => match ops {
                [op] if self.is_value(op) => {
                    let disp = self.relative_disp(op, 2)?;
                    simple(&[0x18, disp as u8])
                }
                [Name(cond), op] => {
                    let code = cond_code(cond).filter(|&c| c < 4).ok_or("bad jr condition")?;
                    let disp = self.relative_disp(op, 2)?;
                    simple(&[0x20 | code << 3, disp as u8])
                }
                _ => Err("bad jr operands".into()),
            },
            "djnz" => match ops {
                [op] => {
                    let disp = self.relative_disp(op, 2)?;
                    simple(&[0x10, disp as u8])
                }
                _ => Err("djnz takes one operand".into()),
            },
            "call" => match ops {
                [op] if self.is_value(op) => {
                    let target = self.value_of(op)? as u16;
                    simple(&[0xCD, target as u8, (target >> 8) as u8])
                }
                [Name(cond), op] => {
                    let code = cond_code(cond).ok_or("bad call condition")?;
                    let target = self.value_of(op)? as u16;
                    simple(&[0xC4 | code << 3, target as u8, (target >> 8) as u8])
                }
                _ => Err("bad call operands".into()),
            },
            "ret" => match ops {
                [] => simple(&[0xC9]),
                [Name(cond)] => {
                    let code = cond_code(cond).ok_or("bad ret condition")?;
                    simple(&[0xC0 | code << 3])
                }
                _ => Err("bad ret operands".into()),
            },
            "rst" => match ops {
                [op] => {
                    let target = self.value_of(op)?;
                    if target % 8 != 0 || !(0..=0x38).contains(&target) {
                        return Err("rst target must be a multiple of 8 below $40".into());
                    }
                    simple(&[0xC7 | target as u8])
                }
                _ => Err("rst takes one operand".into()),
            },

            "in" => match ops {
                [Name(a), IndNum(port)] if a == "a" => simple(&[0xDB, *port as u8]),
                [Name(reg), IndName(c)] if c == "c" => {
                    let code = reg8_code(reg).ok_or("bad in register")?;
                    simple(&[0xED, 0x40 | code << 3])
                }
                [IndName(c)] if c == "c" => simple(&[0xED, 0x70]),
                _ => Err("bad in operands".into()),
            },
            "out" => match ops {
                [IndNum(port), Name(a)] if a == "a" => simple(&[0xD3, *port as u8]),
                [IndName(c), Name(reg)] if c == "c" => {
                    let code = reg8_code(reg).ok_or("bad out register")?;
                    simple(&[0xED, 0x41 | code << 3])
                }
                [IndName(c), Num(0)] if c == "c" => simple(&[0xED, 0x71]),
                _ => Err("bad out operands".into()),
            },

            "rlc" | "rrc" | "rl" | "rr" | "sla" | "sra" | "sll" | "srl" => {
                let shift = SHIFT.iter().position(|&m| m == mnemonic).unwrap() as u8;
                match ops {
                    [Name(reg)] => {
                        let code = reg8_code(reg).ok_or("bad shift register")?;
                        simple(&[0xCB, shift << 3 | code])
                    }
                    [IndName(hl)] if hl == "hl" => simple(&[0xCB, shift << 3 | 6]),
                    [IndIdx(reg, d)] => simple(&[
                        index_prefix(reg).unwrap(),
                        0xCB,
                        *d as u8,
                        shift << 3 | 6,
                    ]),
                    _ => Err("bad shift operand".into()),
                }
            }
            "bit" | "res" | "set" => {
                let base: u8 = match mnemonic {
                    "bit" => 0x40,
                    "res" => 0x80,
                    _ => 0xC0,
                };
                match ops {
                    [bit, target] => {
                        let bit = self.value_of(bit)?;
                        if !(0..=7).contains(&bit) {
                            return Err("bit number must be 0-7".into());
                        }
                        let bit = bit as u8;
                        match target {
                            Name(reg) => {
                                let code = reg8_code(reg).ok_or("bad bit register")?;
                                simple(&[0xCB, base | bit << 3 | code])
                            }
                            IndName(hl) if hl == "hl" => simple(&[0xCB, base | bit << 3 | 6]),
                            IndIdx(reg, d) => simple(&[
                                index_prefix(reg).unwrap(),
                                0xCB,
                                *d as u8,
                                base | bit << 3 | 6,
                            ]),
                            _ => Err("bad bit operand".into()),
                        }
                    }
                    _ => Err(format!("{} takes two operands", mnemonic)),
                }
            }

            _ => Err(format!("unknown mnemonic '{}'", mnemonic)),
        }
    }

    fn relative_disp(&self, op: &Operand, instr_len: i64) -> Result<i8, String> {
        let disp = match op {
            Operand::Rel(disp) => *disp,
            // Sizing pass: the target may not be defined yet
            _ if self.pass == 1 => return Ok(0),
            _ => self.value_of(op)? - (self.cursor as i64 + instr_len),
        };
        i8::try_from(disp).map_err(|_| "relative jump out of range".into())
    }

    fn encode_ld(&self, ops: &[Operand]) -> Result<Vec<u8>, String> {
        use Operand::*;

        match ops {
            // Special registers first: they shadow the plain names
            [Name(dst), Name(src)] if dst == "i" && src == "a" => Ok(vec![0xED, 0x47]),
            [Name(dst), Name(src)] if dst == "r" && src == "a" => Ok(vec![0xED, 0x4F]),
            [Name(dst), Name(src)] if dst == "a" && src == "i" => Ok(vec![0xED, 0x57]),
            [Name(dst), Name(src)] if dst == "a" && src == "r" => Ok(vec![0xED, 0x5F]),
            [Name(sp), Name(src)] if sp == "sp" && src == "hl" => Ok(vec![0xF9]),
            [Name(sp), Name(src)] if sp == "sp" && index_prefix(src).is_some() => {
                Ok(vec![index_prefix(src).unwrap(), 0xF9])
            }

            // Index half registers
            [Name(dst), src] if index_half_code(dst).is_some() => {
                let (prefix, code) = index_half_code(dst).unwrap();
                match src {
                    Num(value) => Ok(vec![prefix, 0x06 | code << 3, *value as u8]),
                    Name(name) => {
                        if let Some((src_prefix, src_code)) = index_half_code(name) {
                            if src_prefix != prefix {
                                return Err("cannot mix ix and iy halves".into());
                            }
                            Ok(vec![prefix, 0x40 | code << 3 | src_code])
                        } else {
                            let src_code = reg8_code(name)
                                .filter(|&c| c != 4 && c != 5 && c != 6)
                                .ok_or("bad source for an index half")?;
                            Ok(vec![prefix, 0x40 | code << 3 | src_code])
                        }
                    }
                    _ => Err("bad source for an index half".into()),
                }
            }
            [Name(dst), Name(src)]
                if index_half_code(src).is_some() && reg8_code(dst).is_some() =>
            {
                let (prefix, src_code) = index_half_code(src).unwrap();
                let dst_code = reg8_code(dst)
                    .filter(|&c| c != 4 && c != 5 && c != 6)
                    .ok_or("bad destination for an index half")?;
                Ok(vec![prefix, 0x40 | dst_code << 3 | src_code])
            }

            // 8-bit register destinations
            [Name(dst), src] if reg8_code(dst).is_some() && reg8_code(dst) != Some(6) => {
                let dst_code = reg8_code(dst).unwrap();
                match src {
                    Name(name) if reg8_code(name).is_some() && reg8_code(name) != Some(6) => {
                        Ok(vec![0x40 | dst_code << 3 | reg8_code(name).unwrap()])
                    }
                    IndName(name) if name == "hl" => Ok(vec![0x46 | dst_code << 3]),
                    IndName(name) if name == "bc" && dst == "a" => Ok(vec![0x0A]),
                    IndName(name) if name == "de" && dst == "a" => Ok(vec![0x1A]),
                    IndNum(addr) if dst == "a" => Ok(vec![0x3A, *addr as u8, (addr >> 8) as u8]),
                    IndIdx(reg, d) => Ok(vec![
                        index_prefix(reg).unwrap(),
                        0x46 | dst_code << 3,
                        *d as u8,
                    ]),
                    _ => {
                        let value = self.value_of(src)?;
                        Ok(vec![0x06 | dst_code << 3, value as u8])
                    }
                }
            }

            // 16-bit destinations
            [Name(dst), src] if pair_code(dst).is_some() || index_prefix(dst).is_some() => {
                let prefix = index_prefix(dst);
                match src {
                    IndNum(addr) => {
                        let (lo, hi) = (*addr as u8, (addr >> 8) as u8);
                        if let Some(prefix) = prefix {
                            Ok(vec![prefix, 0x2A, lo, hi])
                        } else if dst == "hl" {
                            Ok(vec![0x2A, lo, hi])
                        } else {
                            Ok(vec![0xED, 0x4B | pair_code(dst).unwrap() << 4, lo, hi])
                        }
                    }
                    _ => {
                        let value = self.value_of(src)? as u16;
                        let (lo, hi) = (value as u8, (value >> 8) as u8);
                        match prefix {
                            Some(prefix) => Ok(vec![prefix, 0x21, lo, hi]),
                            None => Ok(vec![0x01 | pair_code(dst).unwrap() << 4, lo, hi]),
                        }
                    }
                }
            }

            // Memory destinations
            [IndName(dst), src] if dst == "hl" => match src {
                Name(name) if reg8_code(name).is_some() && reg8_code(name) != Some(6) => {
                    Ok(vec![0x70 | reg8_code(name).unwrap()])
                }
                _ => {
                    let value = self.value_of(src)?;
                    Ok(vec![0x36, value as u8])
                }
            },
            [IndName(dst), Name(src)] if dst == "bc" && src == "a" => Ok(vec![0x02]),
            [IndName(dst), Name(src)] if dst == "de" && src == "a" => Ok(vec![0x12]),
            [IndIdx(reg, d), src] => {
                let prefix = index_prefix(reg).unwrap();
                match src {
                    Name(name) if reg8_code(name).is_some() && reg8_code(name) != Some(6) => {
                        Ok(vec![prefix, 0x70 | reg8_code(name).unwrap(), *d as u8])
                    }
                    _ => {
                        let value = self.value_of(src)?;
                        Ok(vec![prefix, 0x36, *d as u8, value as u8])
                    }
                }
            }
            [IndNum(addr), Name(src)] => {
                let (lo, hi) = (*addr as u8, (addr >> 8) as u8);
                if src == "a" {
                    Ok(vec![0x32, lo, hi])
                } else if src == "hl" {
                    Ok(vec![0x22, lo, hi])
                } else if let Some(prefix) = index_prefix(src) {
                    Ok(vec![prefix, 0x22, lo, hi])
                } else if let Some(code) = pair_code(src) {
                    Ok(vec![0xED, 0x43 | code << 4, lo, hi])
                } else {
                    Err(format!("cannot store '{}' to memory", src))
                }
            }

            _ => Err("bad ld operands".into()),
        }
    }

    fn encode_alu(&self, mnemonic: &str, ops: &[Operand]) -> Result<Vec<u8>, String> {
        use Operand::*;
        let op_index = ALU.iter().position(|&m| m == mnemonic).unwrap() as u8;

        // 16-bit forms
        if let [Name(dst), Name(src)] = ops {
            if dst == "hl" {
                if let Some(code) = pair_code(src) {
                    return match mnemonic {
                        "add" => Ok(vec![0x09 | code << 4]),
                        "adc" => Ok(vec![0xED, 0x4A | code << 4]),
                        "sbc" => Ok(vec![0xED, 0x42 | code << 4]),
                        _ => Err(format!("no 16-bit form of '{}'", mnemonic)),
                    };
                }
            }
            if let Some(prefix) = index_prefix(dst) {
                if mnemonic == "add" {
                    let code = if src == dst {
                        2
                    } else {
                        pair_code(src)
                            .filter(|&c| c != 2)
                            .ok_or("bad add operand for an index register")?
                    };
                    return Ok(vec![prefix, 0x09 | code << 4]);
                }
            }
        }

        // Normalize the optional accumulator operand
        let operand = match ops {
            [Name(a), operand] if a == "a" => operand,
            [operand] => operand,
            _ => return Err(format!("bad {} operands", mnemonic)),
        };

        match operand {
            Name(name) if reg8_code(name).is_some() && reg8_code(name) != Some(6) => {
                Ok(vec![0x80 | op_index << 3 | reg8_code(name).unwrap()])
            }
            Name(name) if index_half_code(name).is_some() => {
                let (prefix, code) = index_half_code(name).unwrap();
                Ok(vec![prefix, 0x80 | op_index << 3 | code])
            }
            IndName(name) if name == "hl" => Ok(vec![0x86 | op_index << 3]),
            IndIdx(reg, d) => Ok(vec![
                index_prefix(reg).unwrap(),
                0x86 | op_index << 3,
                *d as u8,
            ]),
            _ => {
                let value = self.value_of(operand)?;
                Ok(vec![0xC6 | op_index << 3, value as u8])
            }
        }
    }

    fn encode_incdec(&self, ops: &[Operand], inc: bool) -> Result<Vec<u8>, String> {
        use Operand::*;
        let (reg_op, hl_op, pair_op, idx_op): (u8, u8, u8, u8) = if inc {
            (0x04, 0x34, 0x03, 0x23)
        } else {
            (0x05, 0x35, 0x0B, 0x2B)
        };

        match ops {
            [Name(name)] => {
                if let Some((prefix, code)) = index_half_code(name) {
                    Ok(vec![prefix, reg_op | code << 3])
                } else if let Some(prefix) = index_prefix(name) {
                    Ok(vec![prefix, idx_op])
                } else if let Some(code) = reg8_code(name).filter(|&c| c != 6) {
                    Ok(vec![reg_op | code << 3])
                } else if let Some(code) = pair_code(name) {
                    Ok(vec![pair_op | code << 4])
                } else {
                    Err(format!("cannot inc/dec '{}'", name))
                }
            }
            [IndName(name)] if name == "hl" => Ok(vec![hl_op]),
            [IndIdx(reg, d)] => Ok(vec![index_prefix(reg).unwrap(), hl_op, *d as u8]),
            _ => Err("bad inc/dec operand".into()),
        }
    }

    /// Lay out the final image: sized, 0xFF-filled, bytes applied, header
    /// written, checksum computed last.
    fn finish(self, _source: &str) -> Result<Vec<u8>, AsmError> {
        let whole_file = |message: String| AsmError {
            line: 0,
            text: String::new(),
            message,
        };

        let size = match self.rom_size {
            Some(size) => size,
            None => {
                // Smallest size code that holds everything written
                let needed = self.high_water.max(8 * 1024);
                [
                    8 << 10,
                    16 << 10,
                    32 << 10,
                    48 << 10,
                    64 << 10,
                    128 << 10,
                    256 << 10,
                    512 << 10,
                    1 << 20,
                ]
                .into_iter()
                .find(|&s| s >= needed)
                .ok_or_else(|| whole_file("assembled output exceeds 1 MB".into()))?
            }
        };
        if self.high_water > size {
            return Err(whole_file(format!(
                "assembled output ({} bytes) exceeds the ROM size ({} bytes)",
                self.high_water, size
            )));
        }

        let header_location = match self.header_location {
            Some(location) => location,
            None => *HEADER_LOCATIONS
                .iter()
                .find(|&&loc| loc + 16 <= size)
                .expect("smallest ROM still fits a header"),
        };
        if header_location + 16 > size {
            return Err(whole_file("header does not fit in the ROM".into()));
        }

        let mut image = vec![0xFF; size];
        for (offset, byte) in &self.writes {
            if *offset >= size {
                return Err(whole_file(format!(
                    "write at ${:X} is outside the ROM",
                    offset
                )));
            }
            image[*offset] = *byte;
        }

        // Header: magic, checksum placeholder, BCD product code, version,
        // region and size nibbles
        let declared_size = match self.declared_size {
            Some(code) => code,
            None => size_bytes_to_code(size).expect("size was validated"),
        };
        let header = &mut image[header_location..header_location + 16];
        header[..8].copy_from_slice(b"TMR SEGA");
        header[0x8] = 0;
        header[0x9] = 0;
        header[0xA] = 0;
        header[0xB] = 0;
        header[0xC] = bcd_encode((self.product_code % 100) as u8);
        header[0xD] = bcd_encode((self.product_code / 100 % 100) as u8);
        header[0xE] = ((self.product_code / 10000) as u8) << 4 | self.version;
        header[0xF] = self.region_code << 4 | declared_size;

        let checksum = match self.checksum {
            ChecksumMode::Computed => compute_checksum(&image, declared_size),
            ChecksumMode::Off => 0,
            ChecksumMode::Fixed(value) => value,
        };
        image[header_location + 0xA] = checksum as u8;
        image[header_location + 0xB] = (checksum >> 8) as u8;

        Ok(image)
    }
}

fn index_prefix(name: &str) -> Option<u8> {
    match name {
        "ix" => Some(0xDD),
        "iy" => Some(0xFD),
        _ => None,
    }
}

fn index_half_code(name: &str) -> Option<(u8, u8)> {
    match name {
        "ixh" => Some((0xDD, 4)),
        "ixl" => Some((0xDD, 5)),
        "iyh" => Some((0xFD, 4)),
        "iyl" => Some((0xFD, 5)),
        _ => None,
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn is_label_name(tok: &str) -> bool {
    !tok.is_empty()
        && tok
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && tok.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_number(tok: &str) -> Option<i64> {
    let (negative, tok) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok.strip_prefix('+').unwrap_or(tok)),
    };
    let value = if let Some(hex) = tok.strip_prefix('$') {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = tok.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        tok.parse().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Split an operand list on top-level commas.
fn split_operands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '"' => {
                in_string = !in_string;
                current.push(ch);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 && !in_string => {
                out.push(current.trim().to_owned());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_owned());
    }
    out
}

fn parse_string(arg: &str) -> Result<Vec<u8>, String> {
    let inner = arg
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or("expected a quoted string")?;
    let mut out = Vec::new();
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('0') => out.push(0),
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                _ => return Err("bad escape in string".into()),
            }
        } else {
            out.push(ch as u8);
        }
    }
    Ok(out)
}

fn parse_size(arg: &str) -> Option<usize> {
    if let Ok(bytes) = parse_string(arg) {
        let text = String::from_utf8(bytes).ok()?;
        let text = text.trim();
        let (number, shift) = if let Some(kb) = text.strip_suffix("KB") {
            (kb.trim(), 10)
        } else if let Some(mb) = text.strip_suffix("MB") {
            (mb.trim(), 20)
        } else {
            return None;
        };
        let number: usize = number.parse().ok()?;
        Some(number << shift)
    } else {
        parse_number(arg).map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_body(body: &str) -> Vec<u8> {
        assemble(body).expect("assembly should succeed")
    }

    fn code_at(image: &[u8], offset: usize, expect: &[u8]) {
        assert_eq!(&image[offset..offset + expect.len()], expect);
    }

    #[test]
    fn test_assemble_basic_program() {
        let image = assemble_body(
            "; boot stub\n\
             ld\tsp, $DFF0\n\
             ld\ta, $05\n\
             add\ta, $03\n\
             halt\n",
        );
        assert_eq!(image.len(), 8 * 1024);
        code_at(&image, 0, &[0x31, 0xF0, 0xDF, 0x3E, 0x05, 0xC6, 0x03, 0x76]);
    }

    #[test]
    fn test_header_is_generated() {
        let image = assemble_body(".rom_size \"32 KB\"\n.rom_product 1234\n.rom_version 3\n");
        assert_eq!(image.len(), 32 * 1024);
        assert_eq!(&image[0x7FF0..0x7FF8], b"TMR SEGA");
        assert_eq!(image[0x7FFC], 0x34);
        assert_eq!(image[0x7FFD], 0x12);
        assert_eq!(image[0x7FFE], 0x03);
        assert_eq!(image[0x7FFF], 0x6C);
        // Checksum is computed and valid
        let sum = compute_checksum(&image, 0xC);
        assert_eq!(image[0x7FFA] as u16 | (image[0x7FFB] as u16) << 8, sum);
    }

    #[test]
    fn test_rom_loader_accepts_output() {
        let image = assemble_body("ld\ta, $01\n.rom_size \"32 KB\"\n.rom_region 6\n");
        let rom = crater_gg::Rom::from_bytes("assembled".into(), image).expect("loadable");
        assert_eq!(rom.region_code(), 6);
        assert_eq!(rom.reported_checksum(), rom.expected_checksum());
    }

    #[test]
    fn test_labels_and_jumps() {
        let image = assemble_body(
            "start:\n\
             \tld\tb, $03\n\
             loop:\n\
             \tdjnz\tloop\n\
             \tjp\tstart\n",
        );
        // djnz loop: target 2, cursor after = 4 -> disp -2
        code_at(&image, 0, &[0x06, 0x03, 0x10, 0xFE, 0xC3, 0x00, 0x00]);
    }

    #[test]
    fn test_relative_operands() {
        let image = assemble_body("jr\t-2\njr\tnz, +5\n");
        code_at(&image, 0, &[0x18, 0xFE, 0x20, 0x05]);
    }

    #[test]
    fn test_org_and_byte() {
        let image = assemble_body(".org $0100\n.byte $AA, $BB\n.byte $CC\n");
        code_at(&image, 0x100, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(image[0x103], 0xFF); // unwritten space
    }

    #[test]
    fn test_block_sets_bank_origin() {
        let image = assemble_body(".rom_size \"32 KB\"\n.block $01\n.byte $77\n");
        assert_eq!(image[0x4000], 0x77);
    }

    #[test]
    fn test_space_and_ascii() {
        let image = assemble_body(".space 4, $11\n.asciz \"HI\"\n");
        code_at(&image, 0, &[0x11, 0x11, 0x11, 0x11, b'H', b'I', 0x00]);
    }

    #[test]
    fn test_index_instructions() {
        let image = assemble_body(
            "ld\tix, $4000\n\
             ld\t(ix+$05), $AB\n\
             ld\tb, (ix+$05)\n\
             ld\ta, (iy-$02)\n\
             inc\tixh\n\
             set\t0, (ix+$02)\n",
        );
        code_at(
            &image,
            0,
            &[
                0xDD, 0x21, 0x00, 0x40, //
                0xDD, 0x36, 0x05, 0xAB, //
                0xDD, 0x46, 0x05, //
                0xFD, 0x7E, 0xFE, //
                0xDD, 0x24, //
                0xDD, 0xCB, 0x02, 0xC6,
            ],
        );
    }

    #[test]
    fn test_ed_instructions() {
        let image = assemble_body(
            "im\t1\n\
             neg\n\
             ldir\n\
             in\td, (c)\n\
             out\t(c), a\n\
             sbc\thl, de\n\
             ld\t($C000), bc\n",
        );
        code_at(
            &image,
            0,
            &[
                0xED, 0x56, 0xED, 0x44, 0xED, 0xB0, 0xED, 0x50, 0xED, 0x79, 0xED, 0x52, 0xED,
                0x43, 0x00, 0xC0,
            ],
        );
    }

    #[test]
    fn test_cb_instructions() {
        let image = assemble_body("rlc\tb\nsrl\ta\nbit\t7, (hl)\nres\t3, c\nsll\t(hl)\n");
        code_at(
            &image,
            0,
            &[0xCB, 0x00, 0xCB, 0x3F, 0xCB, 0x7E, 0xCB, 0x99, 0xCB, 0x36],
        );
    }

    #[test]
    fn test_alu_optional_accumulator() {
        let a = assemble_body("add\ta, b\nsub\tc\nand\t$0F\ncp\ta, $10\n");
        code_at(&a, 0, &[0x80, 0x91, 0xE6, 0x0F, 0xFE, 0x10]);
    }

    #[test]
    fn test_error_carries_line_context() {
        let err = assemble("nop\nbogus_op a, b\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.text, "bogus_op a, b");
        assert!(err.message.contains("bogus_op"));
    }

    #[test]
    fn test_undefined_symbol_is_an_error() {
        let err = assemble("jp nowhere\n").unwrap_err();
        assert!(err.message.contains("nowhere"));
    }

    #[test]
    fn test_duplicate_label_is_an_error() {
        let err = assemble("here:\nhere:\n").unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_rom_region_by_name() {
        let image = assemble_body(".rom_region \"GG Japan\"\n");
        assert_eq!(image[0x1FFF] >> 4, 5);
    }

    #[test]
    fn test_checksum_off_writes_zero() {
        let image = assemble_body(".rom_checksum off\n");
        assert_eq!(image[0x1FFA], 0);
        assert_eq!(image[0x1FFB], 0);
    }

    #[test]
    fn test_checksum_fixed_value() {
        let image = assemble_body(".rom_checksum $BEEF\n");
        assert_eq!(image[0x1FFA], 0xEF);
        assert_eq!(image[0x1FFB], 0xBE);
    }
}
