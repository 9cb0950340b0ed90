//! Linear address to `(page, offset)` translation.

use crate::geometry::Geometry;
use crate::utils::address_bytes;
use core::ops::Range;

/// A location in the chip's physical page layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress {
    /// Physical page index.
    pub page: u32,
    /// Byte offset inside the page. Always less than the page size.
    pub offset: u32,
}

impl PhysicalAddress {
    /// Packs the address into the chip's address field: the page index
    /// occupies the bits above the `page_address_bits` wide offset.
    pub fn encode(&self, page_address_bits: u8) -> u32 {
        (self.page << page_address_bits) | self.offset
    }

    /// The 3 address bytes sent after an opcode, MSB first.
    pub fn to_bytes(&self, page_address_bits: u8) -> [u8; 3] {
        address_bytes(self.encode(page_address_bits))
    }
}

/// The part of a request that falls into a single physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Where the segment starts on the chip.
    pub address: PhysicalAddress,
    /// Offset of the segment within the caller's buffer.
    pub start: usize,
    /// Length of the segment in bytes.
    pub len: usize,
}

impl Segment {
    /// The caller buffer range covered by this segment.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// Iterator over the per-page [`Segment`]s of a request.
///
/// Created by [`Geometry::segments`].
#[derive(Debug, Clone)]
pub struct Segments {
    page_size: u32,
    addr: u32,
    start: usize,
    remaining: u32,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }

        let address = PhysicalAddress {
            page: self.addr / self.page_size,
            offset: self.addr % self.page_size,
        };
        let len = (self.page_size - address.offset).min(self.remaining);
        let segment = Segment {
            address,
            start: self.start,
            len: len as usize,
        };

        self.addr += len;
        self.start += len as usize;
        self.remaining -= len;
        Some(segment)
    }
}

impl Geometry {
    /// Translates a linear address into its physical coordinate.
    ///
    /// Returns `None` if `addr` lies beyond the end of the device.
    pub fn translate(&self, addr: u32) -> Option<PhysicalAddress> {
        if addr >= self.total_size() {
            return None;
        }
        Some(PhysicalAddress {
            page: addr / self.page_size(),
            offset: addr % self.page_size(),
        })
    }

    /// Splits the `len` bytes starting at `addr` at physical page boundaries.
    ///
    /// Bounds are not checked; callers validate the request first.
    pub fn segments(&self, addr: u32, len: u32) -> Segments {
        Segments {
            page_size: self.page_size(),
            addr,
            start: 0,
            remaining: len,
        }
    }
}
