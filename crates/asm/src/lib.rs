//! Z80 assembler and disassembler for Game Gear ROM images.
//!
//! Both directions speak the same dialect: lowercase mnemonics, `$`
//! prefixes for hexadecimal, `;` comments, and a directive family for the
//! ROM header (`.rom_size`, `.rom_header`, `.rom_checksum`,
//! `.rom_product`, `.rom_version`, `.rom_region`, `.rom_declsize`) plus
//! data layout (`.org`, `.block`, `.byte`, `.space`, `.ascii`, `.asciz`).
//!
//! Assembling a disassembly reproduces the ROM image byte for byte, as
//! long as the header is well formed (the 16 header bytes are regenerated
//! from the directives rather than copied).

pub mod assembler;
pub mod disassembler;

mod operands;

pub use assembler::{assemble, AsmError};
pub use disassembler::{decode_instruction, disassemble, DecodedInstr};
