//! Z80 instruction decoder and ROM disassembler.
//!
//! [`decode_instruction`] turns a byte slice into one line of assembly
//! text plus its size; anything it cannot name comes back as a `.byte`
//! line, so every byte sequence decodes to something reassemblable.
//!
//! [`disassemble`] walks a ROM bank by bank and emits a complete source
//! file: header directives first, then `.block`/`.byte` sections. The 16
//! header bytes are skipped (the directives carry their content), with an
//! `.org` re-synchronizing the cursor after the gap.

use crate::operands::{ALU, COND, PAIR, PAIR_QQ, REG8, SHIFT};
use crater_gg::rom::size_code_to_bytes;
use crater_gg::Rom;
use std::fmt::Write as _;

const ROM_BANK_SIZE: usize = 16 * 1024;
const HEADER_SIZE: usize = 16;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub size: usize,
    pub text: String,
}

/// Decode the instruction starting at `bytes[0]`.
///
/// Falls back to a one-byte `.byte` line for truncated input and for
/// encodings outside the recognized set.
pub fn decode_instruction(bytes: &[u8]) -> DecodedInstr {
    match decode(bytes) {
        Some((size, text)) => DecodedInstr { size, text },
        None => DecodedInstr {
            size: 1,
            text: format!(".byte\t${:02X}", bytes.first().copied().unwrap_or(0)),
        },
    }
}

/// Hex string of the instruction's bytes, for trace output.
pub fn byte_string(bytes: &[u8], size: usize) -> String {
    bytes[..size.min(bytes.len())]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode(bytes: &[u8]) -> Option<(usize, String)> {
    match *bytes.first()? {
        0xCB => decode_cb(*bytes.get(1)?).map(|text| (2, text)),
        0xED => decode_ed(bytes),
        0xDD => decode_index(bytes, "ix"),
        0xFD => decode_index(bytes, "iy"),
        _ => decode_base(bytes),
    }
}

fn imm8(bytes: &[u8], at: usize) -> Option<String> {
    Some(format!("${:02X}", bytes.get(at)?))
}

fn imm16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(*bytes.get(at)? as u16 | (*bytes.get(at + 1)? as u16) << 8)
}

fn rel8(bytes: &[u8], at: usize) -> Option<String> {
    Some(format!("{:+}", *bytes.get(at)? as i8))
}

/// ALU spelling: `add`/`adc`/`sbc` name the accumulator, the rest don't.
fn alu_text(op: u8, operand: &str) -> String {
    let mnemonic = ALU[(op & 0x07) as usize];
    match op & 0x07 {
        0 | 1 | 3 => format!("{}\ta, {}", mnemonic, operand),
        _ => format!("{}\t{}", mnemonic, operand),
    }
}

fn decode_base(bytes: &[u8]) -> Option<(usize, String)> {
    let op = bytes[0];
    let reg_dst = REG8[((op >> 3) & 0x07) as usize];
    let reg_src = REG8[(op & 0x07) as usize];
    let pair = PAIR[((op >> 4) & 0x03) as usize];
    let pair_qq = PAIR_QQ[((op >> 4) & 0x03) as usize];
    let cond = COND[((op >> 3) & 0x07) as usize];

    Some(match op {
        0x00 => (1, "nop".into()),
        0x07 => (1, "rlca".into()),
        0x0F => (1, "rrca".into()),
        0x17 => (1, "rla".into()),
        0x1F => (1, "rra".into()),
        0x27 => (1, "daa".into()),
        0x2F => (1, "cpl".into()),
        0x37 => (1, "scf".into()),
        0x3F => (1, "ccf".into()),
        0x76 => (1, "halt".into()),
        0xF3 => (1, "di".into()),
        0xFB => (1, "ei".into()),
        0xC9 => (1, "ret".into()),
        0xD9 => (1, "exx".into()),
        0x08 => (1, "ex\taf, af'".into()),
        0xEB => (1, "ex\tde, hl".into()),
        0xE3 => (1, "ex\t(sp), hl".into()),
        0xE9 => (1, "jp\t(hl)".into()),
        0xF9 => (1, "ld\tsp, hl".into()),

        0x01 | 0x11 | 0x21 | 0x31 => (3, format!("ld\t{}, ${:04X}", pair, imm16(bytes, 1)?)),
        0x03 | 0x13 | 0x23 | 0x33 => (1, format!("inc\t{}", pair)),
        0x0B | 0x1B | 0x2B | 0x3B => (1, format!("dec\t{}", pair)),
        0x09 | 0x19 | 0x29 | 0x39 => (1, format!("add\thl, {}", pair)),

        0x02 => (1, "ld\t(bc), a".into()),
        0x12 => (1, "ld\t(de), a".into()),
        0x0A => (1, "ld\ta, (bc)".into()),
        0x1A => (1, "ld\ta, (de)".into()),
        0x22 => (3, format!("ld\t(${:04X}), hl", imm16(bytes, 1)?)),
        0x2A => (3, format!("ld\thl, (${:04X})", imm16(bytes, 1)?)),
        0x32 => (3, format!("ld\t(${:04X}), a", imm16(bytes, 1)?)),
        0x3A => (3, format!("ld\ta, (${:04X})", imm16(bytes, 1)?)),

        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
            (1, format!("inc\t{}", reg_dst))
        }
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
            (1, format!("dec\t{}", reg_dst))
        }
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
            (2, format!("ld\t{}, {}", reg_dst, imm8(bytes, 1)?))
        }

        0x10 => (2, format!("djnz\t{}", rel8(bytes, 1)?)),
        0x18 => (2, format!("jr\t{}", rel8(bytes, 1)?)),
        0x20 | 0x28 | 0x30 | 0x38 => (
            2,
            format!("jr\t{}, {}", COND[(((op - 0x20) >> 3) & 0x07) as usize], rel8(bytes, 1)?),
        ),

        0x40..=0x7F => (1, format!("ld\t{}, {}", reg_dst, reg_src)),
        0x80..=0xBF => (1, alu_text(op >> 3, reg_src)),

        0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => (1, format!("ret\t{}", cond)),
        0xC1 | 0xD1 | 0xE1 | 0xF1 => (1, format!("pop\t{}", pair_qq)),
        0xC5 | 0xD5 | 0xE5 | 0xF5 => (1, format!("push\t{}", pair_qq)),
        0xC3 => (3, format!("jp\t${:04X}", imm16(bytes, 1)?)),
        0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
            (3, format!("jp\t{}, ${:04X}", cond, imm16(bytes, 1)?))
        }
        0xCD => (3, format!("call\t${:04X}", imm16(bytes, 1)?)),
        0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
            (3, format!("call\t{}, ${:04X}", cond, imm16(bytes, 1)?))
        }
        0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
            (2, alu_text(op >> 3, &imm8(bytes, 1)?))
        }
        0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
            (1, format!("rst\t${:02X}", op & 0x38))
        }

        0xD3 => (2, format!("out\t({}), a", imm8(bytes, 1)?)),
        0xDB => (2, format!("in\ta, ({})", imm8(bytes, 1)?)),

        0xCB | 0xED | 0xDD | 0xFD => return None, // handled by the caller
    })
}

fn decode_cb(op: u8) -> Option<String> {
    let reg = REG8[(op & 0x07) as usize];
    let bit = (op >> 3) & 0x07;
    Some(match op {
        0x00..=0x3F => format!("{}\t{}", SHIFT[bit as usize], reg),
        0x40..=0x7F => format!("bit\t{}, {}", bit, reg),
        0x80..=0xBF => format!("res\t{}, {}", bit, reg),
        0xC0..=0xFF => format!("set\t{}, {}", bit, reg),
    })
}

fn decode_ed(bytes: &[u8]) -> Option<(usize, String)> {
    let op = *bytes.get(1)?;
    let reg = REG8[((op >> 3) & 0x07) as usize];
    let pair = PAIR[((op >> 4) & 0x03) as usize];

    Some(match op {
        0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x78 => (2, format!("in\t{}, (c)", reg)),
        0x70 => (2, "in\t(c)".into()),
        0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x79 => (2, format!("out\t(c), {}", reg)),
        0x71 => (2, "out\t(c), 0".into()),
        0x42 | 0x52 | 0x62 | 0x72 => (2, format!("sbc\thl, {}", pair)),
        0x4A | 0x5A | 0x6A | 0x7A => (2, format!("adc\thl, {}", pair)),
        0x43 | 0x53 | 0x63 | 0x73 => (4, format!("ld\t(${:04X}), {}", imm16(bytes, 2)?, pair)),
        0x4B | 0x5B | 0x6B | 0x7B => (4, format!("ld\t{}, (${:04X})", pair, imm16(bytes, 2)?)),
        0x44 | 0x4C | 0x54 | 0x5C | 0x64 | 0x6C | 0x74 | 0x7C => (2, "neg".into()),
        0x4D => (2, "reti".into()),
        0x45 | 0x55 | 0x5D | 0x65 | 0x6D | 0x75 | 0x7D => (2, "retn".into()),
        0x46 | 0x4E | 0x66 | 0x6E => (2, "im\t0".into()),
        0x56 | 0x76 => (2, "im\t1".into()),
        0x5E | 0x7E => (2, "im\t2".into()),
        0x47 => (2, "ld\ti, a".into()),
        0x4F => (2, "ld\tr, a".into()),
        0x57 => (2, "ld\ta, i".into()),
        0x5F => (2, "ld\ta, r".into()),
        0x67 => (2, "rrd".into()),
        0x6F => (2, "rld".into()),
        0xA0 => (2, "ldi".into()),
        0xA1 => (2, "cpi".into()),
        0xA2 => (2, "ini".into()),
        0xA3 => (2, "outi".into()),
        0xA8 => (2, "ldd".into()),
        0xA9 => (2, "cpd".into()),
        0xAA => (2, "ind".into()),
        0xAB => (2, "outd".into()),
        0xB0 => (2, "ldir".into()),
        0xB1 => (2, "cpir".into()),
        0xB2 => (2, "inir".into()),
        0xB3 => (2, "otir".into()),
        0xB8 => (2, "lddr".into()),
        0xB9 => (2, "cpdr".into()),
        0xBA => (2, "indr".into()),
        0xBB => (2, "otdr".into()),
        _ => return None,
    })
}

fn idx_half(name: &'static str, code: u8) -> String {
    match code & 0x07 {
        4 => format!("{}h", name),
        5 => format!("{}l", name),
        other => REG8[other as usize].to_owned(),
    }
}

fn idx_disp(name: &str, d: i8) -> String {
    if d < 0 {
        format!("({}-${:02X})", name, -(d as i16))
    } else {
        format!("({}+${:02X})", name, d)
    }
}

fn decode_index(bytes: &[u8], name: &'static str) -> Option<(usize, String)> {
    let op = *bytes.get(1)?;

    if op == 0xCB {
        let d = *bytes.get(2)? as i8;
        let sub = *bytes.get(3)?;
        if sub & 0x07 != 6 {
            return None;
        }
        let place = idx_disp(name, d);
        let bit = (sub >> 3) & 0x07;
        let text = match sub {
            0x00..=0x3F => format!("{}\t{}", SHIFT[bit as usize], place),
            0x40..=0x7F => format!("bit\t{}, {}", bit, place),
            0x80..=0xBF => format!("res\t{}, {}", bit, place),
            0xC0..=0xFF => format!("set\t{}, {}", bit, place),
        };
        return Some((4, text));
    }

    Some(match op {
        0x21 => (4, format!("ld\t{}, ${:04X}", name, imm16(bytes, 2)?)),
        0x22 => (4, format!("ld\t(${:04X}), {}", imm16(bytes, 2)?, name)),
        0x2A => (4, format!("ld\t{}, (${:04X})", name, imm16(bytes, 2)?)),
        0x23 => (2, format!("inc\t{}", name)),
        0x2B => (2, format!("dec\t{}", name)),
        0x09 | 0x19 | 0x39 => (
            2,
            format!("add\t{}, {}", name, PAIR[((op >> 4) & 0x03) as usize]),
        ),
        0x29 => (2, format!("add\t{}, {}", name, name)),
        0xE1 => (2, format!("pop\t{}", name)),
        0xE5 => (2, format!("push\t{}", name)),
        0xE3 => (2, format!("ex\t(sp), {}", name)),
        0xE9 => (2, format!("jp\t({})", name)),
        0xF9 => (2, format!("ld\tsp, {}", name)),

        0x34 => (3, format!("inc\t{}", idx_disp(name, *bytes.get(2)? as i8))),
        0x35 => (3, format!("dec\t{}", idx_disp(name, *bytes.get(2)? as i8))),
        0x36 => (
            4,
            format!(
                "ld\t{}, {}",
                idx_disp(name, *bytes.get(2)? as i8),
                imm8(bytes, 3)?
            ),
        ),
        0x26 | 0x2E => (
            3,
            format!("ld\t{}, {}", idx_half(name, op >> 3), imm8(bytes, 2)?),
        ),
        0x24 | 0x25 | 0x2C | 0x2D => (
            2,
            format!(
                "{}\t{}",
                if op & 1 == 0 { "inc" } else { "dec" },
                idx_half(name, op >> 3)
            ),
        ),

        0x40..=0x7F if op != 0x76 => {
            let dst = (op >> 3) & 0x07;
            let src = op & 0x07;
            if src == 6 {
                let place = idx_disp(name, *bytes.get(2)? as i8);
                (3, format!("ld\t{}, {}", REG8[dst as usize], place))
            } else if dst == 6 {
                let place = idx_disp(name, *bytes.get(2)? as i8);
                (3, format!("ld\t{}, {}", place, REG8[src as usize]))
            } else {
                (2, format!("ld\t{}, {}", idx_half(name, dst), idx_half(name, src)))
            }
        }
        0x80..=0xBF => {
            let src = op & 0x07;
            if src == 6 {
                let place = idx_disp(name, *bytes.get(2)? as i8);
                (3, alu_text(op >> 3, &place))
            } else {
                (2, alu_text(op >> 3, &idx_half(name, src)))
            }
        }

        _ => return None,
    })
}

/// Disassemble a ROM into a complete, reassemblable source file.
pub fn disassemble(rom: &Rom) -> String {
    let data = rom.data();
    let header_loc = rom.header_location();
    let mut out = String::new();

    let _ = writeln!(out, ";; GAME GEAR ROM DISASSEMBLY");
    let _ = writeln!(out, ";; File: {}", rom.name());
    let _ = writeln!(out, ";; Generated by crater {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, ";; {}", "-".repeat(76));
    out.push('\n');

    let checksum_valid = rom.reported_checksum() == rom.expected_checksum();
    let _ = writeln!(
        out,
        ".rom_size\t\"{}\"\t\t; ${:X} bytes in {} banks",
        size_to_string(data.len()),
        data.len(),
        data.len().div_ceil(ROM_BANK_SIZE)
    );
    let _ = writeln!(out, ".rom_header\t${:04X}", header_loc);
    if checksum_valid {
        let _ = writeln!(out, ".rom_checksum\ton");
    } else {
        let _ = writeln!(
            out,
            ".rom_checksum\t${:04X}\t\t; invalid, expected ${:04X}",
            rom.reported_checksum(),
            rom.expected_checksum()
        );
    }
    let _ = writeln!(
        out,
        ".rom_product\t{}\t\t; {}",
        rom.product_code(),
        rom.product().unwrap_or_else(|| "(unknown)".into())
    );
    let _ = writeln!(out, ".rom_version\t{}", rom.version());
    let _ = writeln!(
        out,
        ".rom_region\t{}\t\t; {}",
        rom.region_code(),
        rom.region().unwrap_or("(unknown)")
    );
    let _ = writeln!(
        out,
        ".rom_declsize\t${:X}\t\t; {}",
        rom.declared_size(),
        size_code_to_bytes(rom.declared_size())
            .map(size_to_string)
            .unwrap_or_else(|| "unknown".into())
    );

    let banks = data.len().div_ceil(ROM_BANK_SIZE);
    for bank in 0..banks {
        out.push('\n');
        let _ = writeln!(out, ";; {}", "-".repeat(76));
        out.push('\n');
        let _ = writeln!(out, ".block\t${:02X}", bank);

        let start = bank * ROM_BANK_SIZE;
        let end = (start + ROM_BANK_SIZE).min(data.len());
        let mut offset = start;
        while offset < end {
            if offset == header_loc {
                // The header regenerates from the directives above
                offset += HEADER_SIZE;
                if offset < end {
                    let _ = writeln!(out, ".org\t${:04X}", offset);
                }
                continue;
            }
            let _ = writeln!(out, ".byte\t${:02X}", data[offset]);
            offset += 1;
        }
    }

    out
}

fn size_to_string(size: usize) -> String {
    if size >= 1 << 20 {
        format!("{} MB", size >> 20)
    } else {
        format!("{} KB", size >> 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: &[u8]) -> String {
        decode_instruction(bytes).text
    }

    fn size(bytes: &[u8]) -> usize {
        decode_instruction(bytes).size
    }

    #[test]
    fn test_decode_basic_loads() {
        assert_eq!(text(&[0x00]), "nop");
        assert_eq!(text(&[0x31, 0xF0, 0xDF]), "ld\tsp, $DFF0");
        assert_eq!(text(&[0x3E, 0x05]), "ld\ta, $05");
        assert_eq!(text(&[0x7E]), "ld\ta, (hl)");
        assert_eq!(text(&[0x70]), "ld\t(hl), b");
        assert_eq!(text(&[0x36, 0x42]), "ld\t(hl), $42");
        assert_eq!(text(&[0x32, 0x00, 0xC0]), "ld\t($C000), a");
    }

    #[test]
    fn test_decode_arithmetic() {
        assert_eq!(text(&[0xC6, 0x03]), "add\ta, $03");
        assert_eq!(text(&[0x91]), "sub\tc");
        assert_eq!(text(&[0x9C]), "sbc\ta, h");
        assert_eq!(text(&[0xFE, 0x10]), "cp\t$10");
        assert_eq!(text(&[0x09]), "add\thl, bc");
        assert_eq!(text(&[0x3C]), "inc\ta");
        assert_eq!(text(&[0x35]), "dec\t(hl)");
    }

    #[test]
    fn test_decode_jumps() {
        assert_eq!(text(&[0xC3, 0x00, 0x10]), "jp\t$1000");
        assert_eq!(text(&[0xCA, 0x34, 0x12]), "jp\tz, $1234");
        assert_eq!(text(&[0x18, 0xFE]), "jr\t-2");
        assert_eq!(text(&[0x20, 0x05]), "jr\tnz, +5");
        assert_eq!(text(&[0x10, 0xFC]), "djnz\t-4");
        assert_eq!(text(&[0xE9]), "jp\t(hl)");
        assert_eq!(text(&[0xC7]), "rst\t$00");
        assert_eq!(text(&[0xFF]), "rst\t$38");
    }

    #[test]
    fn test_decode_stack_and_exchange() {
        assert_eq!(text(&[0xF5]), "push\taf");
        assert_eq!(text(&[0xC1]), "pop\tbc");
        assert_eq!(text(&[0x08]), "ex\taf, af'");
        assert_eq!(text(&[0xE3]), "ex\t(sp), hl");
    }

    #[test]
    fn test_decode_cb_page() {
        assert_eq!(text(&[0xCB, 0x00]), "rlc\tb");
        assert_eq!(text(&[0xCB, 0x3F]), "srl\ta");
        assert_eq!(text(&[0xCB, 0x36]), "sll\t(hl)");
        assert_eq!(text(&[0xCB, 0x7E]), "bit\t7, (hl)");
        assert_eq!(text(&[0xCB, 0xD9]), "set\t3, c");
        assert_eq!(size(&[0xCB, 0x00]), 2);
    }

    #[test]
    fn test_decode_ed_page() {
        assert_eq!(text(&[0xED, 0xB0]), "ldir");
        assert_eq!(text(&[0xED, 0x44]), "neg");
        assert_eq!(text(&[0xED, 0x56]), "im\t1");
        assert_eq!(text(&[0xED, 0x78]), "in\ta, (c)");
        assert_eq!(text(&[0xED, 0x52]), "sbc\thl, de");
        assert_eq!(text(&[0xED, 0x43, 0x00, 0xC0]), "ld\t($C000), bc");
        assert_eq!(size(&[0xED, 0x43, 0x00, 0xC0]), 4);
        // Unassigned ED decodes as data
        assert_eq!(text(&[0xED, 0x00]), ".byte\t$ED");
    }

    #[test]
    fn test_decode_index_forms() {
        assert_eq!(text(&[0xDD, 0x21, 0x34, 0x12]), "ld\tix, $1234");
        assert_eq!(text(&[0xDD, 0x7E, 0x05]), "ld\ta, (ix+$05)");
        assert_eq!(text(&[0xFD, 0x70, 0xFE]), "ld\t(iy-$02), b");
        assert_eq!(text(&[0xDD, 0x36, 0x01, 0x99]), "ld\t(ix+$01), $99");
        assert_eq!(text(&[0xDD, 0x86, 0x00]), "add\ta, (ix+$00)");
        assert_eq!(text(&[0xDD, 0x24]), "inc\tixh");
        assert_eq!(text(&[0xFD, 0x2E, 0x07]), "ld\tiyl, $07");
        assert_eq!(text(&[0xDD, 0xE9]), "jp\t(ix)");
        assert_eq!(size(&[0xDD, 0x7E, 0x05]), 3);
    }

    #[test]
    fn test_decode_index_bit_forms() {
        assert_eq!(text(&[0xDD, 0xCB, 0x02, 0xC6]), "set\t0, (ix+$02)");
        assert_eq!(text(&[0xFD, 0xCB, 0xFF, 0x46]), "bit\t0, (iy-$01)");
        assert_eq!(size(&[0xDD, 0xCB, 0x02, 0xC6]), 4);
        // Register-copy variants fall back to data
        assert_eq!(text(&[0xDD, 0xCB, 0x02, 0xC0]), ".byte\t$DD");
    }

    #[test]
    fn test_decode_io() {
        assert_eq!(text(&[0xD3, 0xBF]), "out\t($BF), a");
        assert_eq!(text(&[0xDB, 0x7E]), "in\ta, ($7E)");
        assert_eq!(text(&[0xED, 0x79]), "out\t(c), a");
    }

    #[test]
    fn test_truncated_input_is_data() {
        assert_eq!(text(&[0x31]), ".byte\t$31");
        assert_eq!(text(&[0xCB]), ".byte\t$CB");
        assert_eq!(size(&[0xCB]), 1);
    }

    #[test]
    fn test_byte_string() {
        assert_eq!(byte_string(&[0x31, 0xF0, 0xDF, 0x00], 3), "31 F0 DF");
    }
}
