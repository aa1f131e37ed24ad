//! Disassemble-then-assemble fidelity.

use crater_asm::{assemble, decode_instruction, disassemble};
use crater_gg::rom::compute_checksum;
use crater_gg::Rom;

/// A 32 KiB ROM with a valid header, a program, and patterned data.
fn sample_rom() -> Rom {
    let mut data = vec![0u8; 32 * 1024];
    let program: &[u8] = &[
        0x31, 0xF0, 0xDF, // ld sp, $DFF0
        0x3E, 0x05, // ld a, $05
        0xC6, 0x03, // add a, $03
        0xED, 0x56, // im 1
        0xFB, // ei
        0x18, 0xFE, // jr -2
    ];
    data[..program.len()].copy_from_slice(program);
    for (i, byte) in data.iter_mut().enumerate().take(0x4000).skip(0x100) {
        *byte = (i * 7) as u8;
    }

    data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
    data[0x7FFC] = 0x21; // product 4321, version 2
    data[0x7FFD] = 0x43;
    data[0x7FFE] = 0x02;
    data[0x7FFF] = 0x6C; // GG Export, 32 KiB
    let checksum = compute_checksum(&data, 0xC);
    data[0x7FFA] = checksum as u8;
    data[0x7FFB] = (checksum >> 8) as u8;

    Rom::from_bytes("sample.gg".into(), data).unwrap()
}

#[test]
fn test_assemble_disassemble_roundtrip() {
    let rom = sample_rom();
    let source = disassemble(&rom);
    let rebuilt = assemble(&source).expect("disassembly must reassemble");

    let original = rom.data();
    assert_eq!(rebuilt.len(), original.len());
    for (offset, (a, b)) in original.iter().zip(rebuilt.iter()).enumerate() {
        assert_eq!(a, b, "byte mismatch at offset ${:X}", offset);
    }
}

#[test]
fn test_roundtrip_smallest_rom() {
    let mut data = vec![0u8; 8 * 1024];
    data[0] = 0x00; // nop
    data[1] = 0x76; // halt
    data[0x1FF0..0x1FF8].copy_from_slice(b"TMR SEGA");
    data[0x1FFF] = 0x5A; // GG Japan, 8 KiB
    let checksum = compute_checksum(&data, 0xA);
    data[0x1FFA] = checksum as u8;
    data[0x1FFB] = (checksum >> 8) as u8;
    let rom = Rom::from_bytes("tiny.gg".into(), data).unwrap();

    let rebuilt = assemble(&disassemble(&rom)).expect("reassembles");
    assert_eq!(&*rom.data(), &rebuilt[..]);
}

#[test]
fn test_disassembly_mentions_header_fields() {
    let rom = sample_rom();
    let source = disassemble(&rom);
    assert!(source.contains(".rom_size\t\"32 KB\""));
    assert!(source.contains(".rom_header\t$7FF0"));
    assert!(source.contains(".rom_checksum\ton"));
    assert!(source.contains(".rom_product\t4321"));
    assert!(source.contains(".rom_version\t2"));
    assert!(source.contains(".rom_region\t6"));
    assert!(source.contains(".block\t$00"));
    assert!(source.contains(".block\t$01"));
}

#[test]
fn test_decoded_program_reassembles_to_same_bytes() {
    // Every line the decoder emits must encode back to the bytes it came
    // from. Walk the sample program instruction by instruction.
    let program: &[u8] = &[
        0x31, 0xF0, 0xDF, 0x3E, 0x05, 0xC6, 0x03, 0xED, 0x56, 0xFB, 0x18, 0xFE, 0xDD, 0x21,
        0x00, 0x40, 0xDD, 0x7E, 0x05, 0xCB, 0x7E, 0xC3, 0x00, 0x10,
    ];
    let mut offset = 0;
    let mut source = String::new();
    while offset < program.len() {
        let decoded = decode_instruction(&program[offset..]);
        source.push_str(&decoded.text);
        source.push('\n');
        offset += decoded.size;
    }

    let image = assemble(&source).expect("decoded text reassembles");
    assert_eq!(&image[..program.len()], program);
}
