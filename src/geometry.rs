//! Supported DataFlash parts and the geometry derived from their ID.

use crate::utils::HexSlice;
use core::fmt;

/// JEDEC manufacturer code shared by all Atmel/Adesto DataFlash parts.
const MFR_ATMEL: u8 = 0x1F;

/// Family code found in bits 7..5 of the first device ID byte.
const FAMILY_DATAFLASH: u8 = 0b001;

/// Number of pages in an erase block, for every part in [`PARTS`].
const PAGES_PER_BLOCK: u32 = 8;

/// Manufacturer and device identification, as returned by opcode `9Fh`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    /// - First byte is the JEDEC manufacturer code (`1Fh` for DataFlash).
    /// - Second byte holds the family code and the density code.
    /// - Third byte holds sub-code and product variant.
    /// - Fourth byte is the length of the extended device information.
    bytes: [u8; 4],
}

impl Identification {
    /// Builds an `Identification` from the bytes clocked out after the
    /// opcode. Missing bytes read as zero.
    pub fn from_bytes(buf: &[u8]) -> Identification {
        let mut bytes = [0; 4];
        let len = buf.len().min(bytes.len());
        bytes[..len].copy_from_slice(&buf[..len]);
        Self { bytes }
    }

    /// The JEDEC manufacturer code for this chip.
    pub fn mfr_code(&self) -> u8 {
        self.bytes[0]
    }

    /// The manufacturer-specific device ID for this chip.
    pub fn device_id(&self) -> &[u8] {
        &self.bytes[1..3]
    }

    /// Family code. `0b001` for DataFlash.
    pub fn family(&self) -> u8 {
        self.bytes[1] >> 5
    }

    /// Density code. Nominal capacity is `32 KiB << density`.
    pub fn density(&self) -> u8 {
        self.bytes[1] & 0x1F
    }

    /// Length of the extended device information string. Zero on parts that
    /// predate the E revision.
    pub fn extended_info_len(&self) -> u8 {
        self.bytes[3]
    }

    /// Whether the status register has a second byte with the
    /// erase/program error bit.
    pub fn has_extended_status(&self) -> bool {
        self.extended_info_len() != 0
    }
}

impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identification")
            .field(&HexSlice(self.bytes))
            .finish()
    }
}

struct Part {
    density: u8,
    name: &'static str,
    binary_page: u32,
    dataflash_page: u32,
}

const PARTS: &[Part] = &[
    Part { density: 0x03, name: "AT45DB021", binary_page: 256, dataflash_page: 264 },
    Part { density: 0x04, name: "AT45DB041", binary_page: 256, dataflash_page: 264 },
    Part { density: 0x05, name: "AT45DB081", binary_page: 256, dataflash_page: 264 },
    Part { density: 0x06, name: "AT45DB161", binary_page: 512, dataflash_page: 528 },
    Part { density: 0x07, name: "AT45DB321", binary_page: 512, dataflash_page: 528 },
    Part { density: 0x08, name: "AT45DB641", binary_page: 256, dataflash_page: 264 },
];

/// Physical layout of a probed chip.
///
/// `total_size` counts physical bytes: in DataFlash page mode a 4 Mbit part
/// exposes 2048 pages of 264 bytes, not 512 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    name: &'static str,
    total_size: u32,
    page_size: u32,
    block_size: u32,
    page_address_bits: u8,
    binary: bool,
}

impl Geometry {
    /// Looks up the part identified by `id`.
    ///
    /// `binary` selects between the power-of-two page layout and the native
    /// DataFlash one. Returns `None` for chips that are not in the table.
    pub fn from_identification(id: &Identification, binary: bool) -> Option<Geometry> {
        if id.mfr_code() != MFR_ATMEL || id.family() != FAMILY_DATAFLASH {
            return None;
        }
        let part = PARTS.iter().find(|part| part.density == id.density())?;

        let nominal = 0x8000u32 << part.density;
        let (page_size, total_size) = if binary {
            (part.binary_page, nominal)
        } else {
            let pages = nominal / part.binary_page;
            (part.dataflash_page, pages * part.dataflash_page)
        };

        Some(Geometry {
            name: part.name,
            total_size,
            page_size,
            block_size: page_size * PAGES_PER_BLOCK,
            // Non-binary pages still occupy a power-of-two wide offset field.
            page_address_bits: page_size.next_power_of_two().trailing_zeros() as u8,
            binary,
        })
    }

    /// Part name, without the revision suffix.
    pub fn part_name(&self) -> &'static str {
        self.name
    }

    /// Device capacity in bytes.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Physical page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Erase block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Width of the page offset field in the chip's address encoding.
    pub fn page_address_bits(&self) -> u8 {
        self.page_address_bits
    }

    /// Number of physical pages.
    pub fn pages(&self) -> u32 {
        self.total_size / self.page_size
    }

    /// Whether the chip is in power-of-two page mode.
    pub fn is_binary(&self) -> bool {
        self.binary
    }
}
