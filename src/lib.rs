//! An [`embedded-hal`]-based driver for AT45-series SPI DataFlash chips.
//!
//! DataFlash parts organize their storage in pages that are frequently not a
//! power of two in size (264 or 528 bytes), and every command addresses the
//! array by a `(page, offset)` pair. This crate hides that behind a
//! [`BlockDevice`]: callers use linear byte addresses, and the driver takes
//! care of translating them, splitting requests at page boundaries and
//! sequencing the chip's protect/command/busy-wait protocol.
//!
//! ```ignore
//! use dataflash_memory::prelude::*;
//! use dataflash_memory::DataFlash;
//!
//! let mut flash = DataFlash::new(spi, cs);
//! flash.init()?;
//! let erase_size = flash.erase_size();
//! flash.erase(0, erase_size)?;
//! flash.program(0, &page)?;
//! flash.read(0, &mut buf)?;
//! flash.deinit()?;
//! ```
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/

#![doc(html_root_url = "https://docs.rs/dataflash-memory/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
mod address;
pub mod command;
mod dataflash;
mod error;
pub mod geometry;
pub mod prelude;
mod utils;

#[cfg(test)]
mod mock;

pub use crate::address::{PhysicalAddress, Segment, Segments};
pub use crate::dataflash::{Config, DataFlash, DeviceState, EraseGranularity, PageSizeMode};
pub use crate::error::{
    Error, BD_ERROR_DEVICE_ERROR, BD_ERROR_INVALID_ADDRESS, BD_ERROR_INVALID_STATE, BD_ERROR_OK,
    BD_ERROR_UNSUPPORTED_DEVICE,
};
pub use crate::geometry::{Geometry, Identification};

/// A block device with separate read, program and erase granularities.
///
/// All addresses and sizes are in bytes. Every mutating or reading operation
/// requires `addr` and the request size to be multiples of the respective
/// granularity, and the whole range to lie inside the device.
pub trait BlockDevice {
    /// The error type returned by all fallible operations.
    type Error;

    /// Initializes the device.
    ///
    /// Calls may be nested; only the first one touches the hardware.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Balances one earlier call to [`init`](BlockDevice::init).
    fn deinit(&mut self) -> Result<(), Self::Error>;

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `addr`.
    ///
    /// The target region must have been erased beforehand. Programming over
    /// data that was not erased leaves the region in an undefined state.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases `size` bytes starting at `addr`.
    ///
    /// The contents of an erased region are undefined until programmed.
    fn erase(&mut self, addr: u32, size: u32) -> Result<(), Self::Error>;

    /// Size of a readable block in bytes.
    fn read_size(&self) -> u32;

    /// Size of a programmable block in bytes. A multiple of the read size.
    fn program_size(&self) -> u32;

    /// Size of an erasable block in bytes. A multiple of the program size.
    fn erase_size(&self) -> u32;

    /// Size of the erasable block containing `addr`.
    ///
    /// Devices with a uniform erase map return [`erase_size`](BlockDevice::erase_size).
    fn erase_size_at(&self, addr: u32) -> u32 {
        let _ = addr;
        self.erase_size()
    }

    /// Total size of the device in bytes.
    fn size(&self) -> u32;

    /// Returns whether `read(addr, ..)` of `size` bytes would be accepted.
    fn is_valid_read(&self, addr: u32, size: u32) -> bool {
        is_valid(addr, size, self.read_size(), self.size())
    }

    /// Returns whether `program(addr, ..)` of `size` bytes would be accepted.
    fn is_valid_program(&self, addr: u32, size: u32) -> bool {
        is_valid(addr, size, self.program_size(), self.size())
    }

    /// Returns whether `erase(addr, size)` would be accepted.
    fn is_valid_erase(&self, addr: u32, size: u32) -> bool {
        is_valid(addr, size, self.erase_size_at(addr), self.size())
    }
}

fn is_valid(addr: u32, size: u32, granularity: u32, total: u32) -> bool {
    granularity != 0
        && total != 0
        && addr % granularity == 0
        && size % granularity == 0
        && addr.checked_add(size).map_or(false, |end| end <= total)
}
