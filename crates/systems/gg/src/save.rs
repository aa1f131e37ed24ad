//! Persistent cartridge RAM ("battery saves").
//!
//! A save file is a 64-byte ASCII header followed by exactly 32 KiB of
//! cartridge RAM:
//!
//! ```text
//! CRATER GAMEGEAR SAVE FILE\n
//! <version>:<product_code>:0x<checksum>\n
//! ```
//!
//! zero-padded to 64 bytes. The product code and checksum tie the save to
//! one specific ROM, so stale saves from a different game are rejected at
//! load time rather than corrupting the emulated program.
//!
//! Save files are created lazily: a game that never maps cartridge RAM
//! never touches the filesystem. The cart RAM buffer itself lives in the
//! MMU; this type owns the path, the validation state, and the write-back.

use crate::mmu::CART_RAM_SIZE;
use crate::rom::Rom;
use crater_core::log;
use crater_core::logging::{LogCategory, LogLevel};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &str = "CRATER GAMEGEAR SAVE FILE\n";
const HEADER_LEN: usize = 64;
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("couldn't access save file: {0}")]
    Io(#[from] std::io::Error),
    #[error("save file is too short")]
    TooShort,
    #[error("save file has an invalid header (was it created by crater?)")]
    BadHeader,
    #[error("unknown or unsupported save file version")]
    UnsupportedVersion,
    #[error("save file was created for a different ROM")]
    RomMismatch,
    #[error("save file cart RAM size is wrong; the file may be corrupt")]
    BadSize,
}

/// Handle to a save file, open or yet to be created.
#[derive(Debug)]
pub struct Save {
    path: PathBuf,
    product_code: u32,
    checksum: u16,
    /// Cart RAM loaded from an existing file, waiting for the MMU to take it.
    loaded_cart_ram: Option<Vec<u8>>,
    /// Whether the backing file exists and has passed validation.
    has_cart_ram: bool,
}

impl Save {
    /// Open a save location for the given ROM.
    ///
    /// If a file already exists at `path` it is loaded and validated here;
    /// otherwise creation is deferred until the emulated program first
    /// maps cartridge RAM.
    pub fn init<P: AsRef<Path>>(path: P, rom: &Rom) -> Result<Self, SaveError> {
        let path = path.as_ref().to_path_buf();
        let mut save = Self {
            path,
            product_code: rom.product_code(),
            checksum: rom.expected_checksum(),
            loaded_cart_ram: None,
            has_cart_ram: false,
        };

        let mut file = match File::open(&save.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(save),
            Err(err) => return Err(err.into()),
        };

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        save.parse(&contents)?;
        Ok(save)
    }

    fn parse(&mut self, contents: &[u8]) -> Result<(), SaveError> {
        if contents.len() < HEADER_LEN {
            return Err(SaveError::TooShort);
        }
        if &contents[..MAGIC.len()] != MAGIC.as_bytes() {
            return Err(SaveError::BadHeader);
        }

        let line = &contents[MAGIC.len()..HEADER_LEN];
        let line = std::str::from_utf8(line).map_err(|_| SaveError::BadHeader)?;
        let line = line.trim_end_matches('\0');
        let line = line.strip_suffix('\n').ok_or(SaveError::BadHeader)?;

        let mut fields = line.splitn(3, ':');
        let version: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(SaveError::BadHeader)?;
        let product_code: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(SaveError::BadHeader)?;
        let checksum = fields
            .next()
            .and_then(|s| s.strip_prefix("0x"))
            .and_then(|s| u16::from_str_radix(s, 16).ok())
            .ok_or(SaveError::BadHeader)?;

        if version != VERSION {
            return Err(SaveError::UnsupportedVersion);
        }
        if product_code != self.product_code || checksum != self.checksum {
            return Err(SaveError::RomMismatch);
        }
        if contents.len() != HEADER_LEN + CART_RAM_SIZE {
            return Err(SaveError::BadSize);
        }

        log!(
            LogCategory::Bus,
            LogLevel::Debug,
            "loaded cartridge RAM from {}",
            self.path.display()
        );
        self.loaded_cart_ram = Some(contents[HEADER_LEN..].to_vec());
        self.has_cart_ram = true;
        Ok(())
    }

    /// Whether a validated backing file exists.
    pub fn has_cart_ram(&self) -> bool {
        self.has_cart_ram
    }

    /// Hand the cart RAM loaded from an existing file to the MMU.
    pub fn take_cart_ram(&mut self) -> Option<Vec<u8>> {
        self.loaded_cart_ram.take()
    }

    /// Create the backing file with a header and zeroed cart RAM.
    ///
    /// Called when the emulated program first enables cartridge RAM and no
    /// file exists yet. A no-op if the file is already set up.
    pub fn init_cart_ram(&mut self) -> Result<(), SaveError> {
        if self.has_cart_ram {
            return Ok(());
        }

        log!(
            LogCategory::Bus,
            LogLevel::Debug,
            "creating new save file at {}",
            self.path.display()
        );

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) => return Err(err.into()),
        };

        let result = (|| {
            file.write_all(&self.header())?;
            file.write_all(&vec![0u8; CART_RAM_SIZE])?;
            file.flush()
        })();
        if let Err(err) = result {
            drop(file);
            let _ = std::fs::remove_file(&self.path);
            return Err(err.into());
        }

        self.has_cart_ram = true;
        Ok(())
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        let text = format!(
            "{}{}:{:06}:0x{:04X}\n",
            MAGIC, VERSION, self.product_code, self.checksum
        );
        header[..text.len()].copy_from_slice(text.as_bytes());
        header
    }

    /// Write the cart RAM region back to the file.
    pub fn write_cart_ram(&mut self, cart_ram: &[u8]) -> Result<(), SaveError> {
        debug_assert_eq!(cart_ram.len(), CART_RAM_SIZE);
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        file.write_all(cart_ram)?;
        file.flush()?;
        Ok(())
    }
}
