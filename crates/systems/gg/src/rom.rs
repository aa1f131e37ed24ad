//! Game Gear ROM images.
//!
//! A ROM is an immutable byte blob with a 16-byte header at one of three
//! fixed offsets:
//!
//! ```text
//! byte 0-7:           magic "TMR SEGA"
//! byte 8-9:           unused
//! byte A-B:           checksum, little-endian
//! byte C-E (hi):      product code (BCD digits)
//! byte E (lo nibble): version
//! byte F (hi nibble): region code
//! byte F (lo nibble): declared ROM size code
//! ```
//!
//! Header layout and region/size tables follow the SMS Power documentation
//! (<http://www.smspower.org/Development/ROMHeader>).

use crater_core::log;
use crater_core::logging::{LogCategory, LogLevel};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

pub const HEADER_SIZE: usize = 16;
const HEADER_MAGIC: &[u8; 8] = b"TMR SEGA";

// Most dumps put the header at the top of the first 32 KiB, so that
// location is tried first.
const HEADER_LOCATIONS: [usize; 3] = [0x7FF0, 0x3FF0, 0x1FF0];

#[derive(Debug, Error)]
pub enum RomError {
    #[error("couldn't read ROM image: {0}")]
    Io(#[from] std::io::Error),
    #[error("ROM image is not a regular file")]
    NotAFile,
    #[error("ROM image has an invalid size")]
    BadSize,
    #[error("ROM image header is missing or invalid")]
    BadHeader,
    #[error("ROM image appears to be for the Master System, which is unsupported")]
    MasterSystemRom,
}

/// A loaded and validated ROM image.
#[derive(Debug, Clone)]
pub struct Rom {
    name: String,
    data: Rc<[u8]>,
    header_location: usize,
    reported_checksum: u16,
    expected_checksum: u16,
    product_code: u32,
    version: u8,
    region_code: u8,
    declared_size: u8,
}

/// Serializable header summary for frontend display.
#[derive(Debug, Clone, Serialize)]
pub struct RomInfo {
    pub name: String,
    pub size: usize,
    pub reported_checksum: u16,
    pub expected_checksum: u16,
    pub checksum_valid: bool,
    pub product_code: u32,
    pub product: Option<String>,
    pub version: u8,
    pub region_code: u8,
    pub region: Option<&'static str>,
    pub declared_size_code: u8,
}

impl Rom {
    /// Load a ROM image from a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RomError> {
        let path = path.as_ref();
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(RomError::NotAFile);
        }
        let data = fs::read(path)?;
        Self::from_bytes(path.display().to_string(), data)
    }

    /// Validate an in-memory ROM image.
    pub fn from_bytes(name: String, data: Vec<u8>) -> Result<Self, RomError> {
        if size_bytes_to_code(data.len()).is_none() {
            return Err(RomError::BadSize);
        }

        let (header_location, header) = find_header(&data).ok_or(RomError::BadHeader)?;

        let reported_checksum = header[0xA] as u16 | (header[0xB] as u16) << 8;
        let expected_checksum = compute_checksum(&data, header[0xF]);
        let product_code = bcd_decode(header[0xC]) as u32
            + bcd_decode(header[0xD]) as u32 * 100
            + (header[0xE] >> 4) as u32 * 10000;
        let version = header[0xE] & 0x0F;
        let region_code = header[0xF] >> 4;
        let declared_size = header[0xF] & 0x0F;

        if region_code == 3 || region_code == 4 {
            return Err(RomError::MasterSystemRom);
        }

        log!(
            LogCategory::Bus,
            LogLevel::Info,
            "ROM {}: {} bytes, product {}, region {}, checksum 0x{:04X} (expected 0x{:04X})",
            name,
            data.len(),
            product_code,
            region_code_to_string(region_code).unwrap_or("unknown"),
            reported_checksum,
            expected_checksum
        );

        Ok(Self {
            name,
            data: data.into(),
            header_location,
            reported_checksum,
            expected_checksum,
            product_code,
            version,
            region_code,
            declared_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the ROM bytes, cloned into the MMU's bank table.
    pub fn data(&self) -> Rc<[u8]> {
        Rc::clone(&self.data)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn header_location(&self) -> usize {
        self.header_location
    }

    pub fn reported_checksum(&self) -> u16 {
        self.reported_checksum
    }

    pub fn expected_checksum(&self) -> u16 {
        self.expected_checksum
    }

    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn region_code(&self) -> u8 {
        self.region_code
    }

    pub fn declared_size(&self) -> u8 {
        self.declared_size
    }

    /// Developer name derived from the product code, if known.
    ///
    /// Sega first-party images use prefixes 2 and 3; licensed third
    /// parties carry their Sega licensee ("T-series") number.
    pub fn product(&self) -> Option<String> {
        match self.product_code / 1000 {
            2 => Some("Sega of America".to_owned()),
            3 => Some("Sega of Japan".to_owned()),
            developer @ 11..=159 => third_party_developer(developer).map(str::to_owned),
            _ => None,
        }
    }

    /// Region name from the header, if the code is valid.
    pub fn region(&self) -> Option<&'static str> {
        region_code_to_string(self.region_code)
    }

    pub fn info(&self) -> RomInfo {
        RomInfo {
            name: self.name.clone(),
            size: self.data.len(),
            reported_checksum: self.reported_checksum,
            expected_checksum: self.expected_checksum,
            checksum_valid: self.reported_checksum == self.expected_checksum,
            product_code: self.product_code,
            product: self.product(),
            version: self.version,
            region_code: self.region_code,
            region: self.region(),
            declared_size_code: self.declared_size,
        }
    }
}

/// Third-party licensee names by product-code prefix.
///
/// Information from: <http://www.smspower.org/Development/ProductCodes>
fn third_party_developer(code: u32) -> Option<&'static str> {
    match code {
        11 => Some("Taito"),
        12 => Some("Capcom"),
        13 => Some("Data East"),
        14 => Some("Namco"),
        15 => Some("Sunsoft"),
        23 => Some("Vic Tokai"),
        48 => Some("Tengen"),
        50 => Some("Absolute Entertainment"),
        51 => Some("Acclaim Entertainment"),
        52 => Some("Activision"),
        70 => Some("Virgin Interactive"),
        93 => Some("Sony Imagesoft"),
        95 => Some("Konami"),
        _ => None,
    }
}

fn find_header(data: &[u8]) -> Option<(usize, &[u8])> {
    for &location in &HEADER_LOCATIONS {
        if location + HEADER_SIZE > data.len() {
            continue;
        }
        let header = &data[location..location + HEADER_SIZE];
        if &header[..HEADER_MAGIC.len()] == HEADER_MAGIC {
            return Some((location, header));
        }
    }
    None
}

/// Convert a decimal integer (0-99) to BCD-encoded form.
pub fn bcd_encode(num: u8) -> u8 {
    ((num / 10) << 4) | (num % 10)
}

/// Convert a BCD-encoded integer to decimal.
pub fn bcd_decode(num: u8) -> u8 {
    (num >> 4) * 10 + (num & 0x0F)
}

/// Region name for a header region code.
pub fn region_code_to_string(code: u8) -> Option<&'static str> {
    match code {
        3 => Some("SMS Japan"),
        4 => Some("SMS Export"),
        5 => Some("GG Japan"),
        6 => Some("GG Export"),
        7 => Some("GG International"),
        _ => None,
    }
}

/// Region code for a region name; `None` if the name is unknown.
pub fn region_string_to_code(name: &str) -> Option<u8> {
    match name {
        "SMS Japan" => Some(3),
        "SMS Export" => Some(4),
        "GG Japan" => Some(5),
        "GG Export" => Some(6),
        "GG International" => Some(7),
        _ => None,
    }
}

/// ROM size in bytes for a header size code.
pub fn size_code_to_bytes(code: u8) -> Option<usize> {
    match code {
        0xA => Some(8 << 10),
        0xB => Some(16 << 10),
        0xC => Some(32 << 10),
        0xD => Some(48 << 10),
        0xE => Some(64 << 10),
        0xF => Some(128 << 10),
        0x0 => Some(256 << 10),
        0x1 => Some(512 << 10),
        0x2 => Some(1 << 20),
        _ => None,
    }
}

/// Header size code for a ROM size in bytes.
pub fn size_bytes_to_code(bytes: usize) -> Option<u8> {
    if bytes & ((1 << 10) - 1) != 0 {
        return None; // Not a whole number of KiB
    }
    match bytes >> 10 {
        8 => Some(0xA),
        16 => Some(0xB),
        32 => Some(0xC),
        48 => Some(0xD),
        64 => Some(0xE),
        128 => Some(0xF),
        256 => Some(0x0),
        512 => Some(0x1),
        1024 => Some(0x2),
        _ => None,
    }
}

/// Compute a ROM checksum over the region selected by the size code.
///
/// Codes 0xA-0xD sum a single low band; 0xE and up also sum a high band
/// starting at 0x8000 (the 16 header-adjacent bytes at the top of the low
/// band are never included). If the image is shorter than the declared
/// band, the band shrinks to what exists.
pub fn compute_checksum(data: &[u8], size_code: u8) -> u16 {
    if data.is_empty() {
        return 0;
    }
    let (mut low_end, mut high_end): (usize, usize) = match size_code & 0x0F {
        0xA => (0x1FEF, 0),
        0xB => (0x3FEF, 0),
        0xC => (0x7FEF, 0),
        0xD => (0xBFEF, 0),
        0xE => (0x7FEF, 0x0FFFF),
        0xF => (0x7FEF, 0x1FFFF),
        0x0 => (0x7FEF, 0x3FFFF),
        0x1 => (0x7FEF, 0x7FFFF),
        0x2 => (0x7FEF, 0xFFFFF),
        _ => (0x7FEF, 0),
    };

    if low_end >= data.len() {
        low_end = if data.len() >= 0x4000 { 0x3FEF } else { 0x1FEF };
    }
    if high_end >= data.len() {
        high_end = 0;
    }

    let mut sum: u16 = 0;
    for &byte in &data[..=low_end.min(data.len() - 1)] {
        sum = sum.wrapping_add(byte as u16);
    }
    if high_end != 0 {
        for &byte in &data[0x8000..=high_end] {
            sum = sum.wrapping_add(byte as u16);
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a 32 KiB image with a valid header at 0x7FF0.
    pub(crate) fn build_rom(fill: impl Fn(&mut Vec<u8>)) -> Vec<u8> {
        let mut data = vec![0u8; 32 * 1024];
        fill(&mut data);
        data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
        data[0x7FFE] = 0x10; // product nibble 1, version 0
        data[0x7FFF] = 0x6C; // GG Export, 32 KiB
        let checksum = compute_checksum(&data, 0xC);
        data[0x7FFA] = checksum as u8;
        data[0x7FFB] = (checksum >> 8) as u8;
        data
    }

    #[test]
    fn test_header_parse() {
        let mut data = vec![0u8; 32 * 1024];
        data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
        data[0x7FFA] = 0x34;
        data[0x7FFB] = 0x12;
        data[0x7FFC] = bcd_encode(97); // product 2697 -> developer "Sega of America"
        data[0x7FFD] = bcd_encode(26);
        data[0x7FFE] = 0x03; // version 3
        data[0x7FFF] = 0x6C; // region 6 (GG Export), size code C

        let rom = Rom::from_bytes("test".into(), data).expect("valid rom");
        assert_eq!(rom.header_location(), 0x7FF0);
        assert_eq!(rom.reported_checksum(), 0x1234);
        assert_eq!(rom.product_code(), 2697);
        assert_eq!(rom.version(), 3);
        assert_eq!(rom.region_code(), 6);
        assert_eq!(rom.region(), Some("GG Export"));
        assert_eq!(rom.product().as_deref(), Some("Sega of America"));
        assert_eq!(rom.declared_size(), 0xC);
    }

    #[test]
    fn test_third_party_developer_from_product_code() {
        let mut data = vec![0u8; 32 * 1024];
        data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
        data[0x7FFC] = bcd_encode(42); // product 11042 -> licensee 11
        data[0x7FFD] = bcd_encode(10);
        data[0x7FFE] = 0x10;
        data[0x7FFF] = 0x6C;

        let rom = Rom::from_bytes("taito".into(), data).expect("valid rom");
        assert_eq!(rom.product_code(), 11042);
        assert_eq!(rom.product().as_deref(), Some("Taito"));

        // Prefixes outside the licensee table stay unknown
        let mut data = vec![0u8; 32 * 1024];
        data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
        data[0x7FFD] = bcd_encode(99); // product 9900 -> prefix 9
        data[0x7FFF] = 0x6C;
        let rom = Rom::from_bytes("unknown".into(), data).expect("valid rom");
        assert_eq!(rom.product(), None);
    }

    #[test]
    fn test_smallest_rom_header_at_1ff0() {
        let mut data = vec![0u8; 8 * 1024];
        data[0x1FF0..0x1FF8].copy_from_slice(b"TMR SEGA");
        data[0x1FFF] = 0x5A; // GG Japan, 8 KiB

        let rom = Rom::from_bytes("tiny".into(), data).expect("valid rom");
        assert_eq!(rom.header_location(), 0x1FF0);
        assert_eq!(rom.region(), Some("GG Japan"));
    }

    #[test]
    fn test_rejects_bad_size() {
        let data = vec![0u8; 12 * 1024];
        assert!(matches!(
            Rom::from_bytes("bad".into(), data),
            Err(RomError::BadSize)
        ));
    }

    #[test]
    fn test_rejects_missing_header() {
        let data = vec![0u8; 32 * 1024];
        assert!(matches!(
            Rom::from_bytes("blank".into(), data),
            Err(RomError::BadHeader)
        ));
    }

    #[test]
    fn test_rejects_master_system_region() {
        let mut data = vec![0u8; 32 * 1024];
        data[0x7FF0..0x7FF8].copy_from_slice(b"TMR SEGA");
        data[0x7FFF] = 0x4C; // SMS Export
        assert!(matches!(
            Rom::from_bytes("sms".into(), data),
            Err(RomError::MasterSystemRom)
        ));
    }

    #[test]
    fn test_checksum_valid_rom() {
        let data = build_rom(|_| {});
        let rom = Rom::from_bytes("ok".into(), data).expect("valid rom");
        assert_eq!(rom.reported_checksum(), rom.expected_checksum());
        assert!(rom.info().checksum_valid);
    }

    #[test]
    fn test_checksum_skips_header_bytes() {
        // Bytes inside 0x7FF0..0x8000 must not affect a size-C checksum.
        let base = build_rom(|_| {});
        let baseline = compute_checksum(&base, 0xC);
        let mut tweaked = base;
        tweaked[0x7FF5] = tweaked[0x7FF5].wrapping_add(7);
        assert_eq!(compute_checksum(&tweaked, 0xC), baseline);
    }

    #[test]
    fn test_checksum_high_band() {
        let mut data = vec![0u8; 64 * 1024];
        data[0x0000] = 2;
        data[0x9000] = 3;
        // Size code E: [0, 0x7FEF] plus [0x8000, 0xFFFF]
        assert_eq!(compute_checksum(&data, 0xE), 5);
        // Size code C ignores the high bank entirely
        assert_eq!(compute_checksum(&data, 0xC), 2);
    }

    #[test]
    fn test_checksum_truncates_short_band() {
        let mut data = vec![0u8; 8 * 1024];
        data[0x1000] = 9;
        // Declared C (0x7FEF band) but only 8 KiB on disk: falls back to 0x1FEF
        assert_eq!(compute_checksum(&data, 0xC), 9);
    }

    #[test]
    fn test_bcd_roundtrip() {
        for n in 0..=99 {
            assert_eq!(bcd_decode(bcd_encode(n)), n);
        }
    }

    #[test]
    fn test_size_code_tables() {
        for code in [0xA, 0xB, 0xC, 0xD, 0xE, 0xF, 0x0, 0x1, 0x2] {
            let bytes = size_code_to_bytes(code).unwrap();
            assert_eq!(size_bytes_to_code(bytes), Some(code));
        }
        assert_eq!(size_code_to_bytes(0x5), None);
        assert_eq!(size_bytes_to_code(24 << 10), None);
    }

    #[test]
    fn test_region_tables() {
        for code in 3..=7 {
            let name = region_code_to_string(code).unwrap();
            assert_eq!(region_string_to_code(name), Some(code));
        }
        assert_eq!(region_code_to_string(9), None);
    }
}
