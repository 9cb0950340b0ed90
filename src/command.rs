//! Primitive DataFlash commands.
//!
//! [`Sequencer`] speaks the chip's wire protocol: one opcode byte, three
//! address bytes and an optional payload per chip-select frame. It knows
//! nothing about geometry; callers pass addresses that are already encoded
//! with [`PhysicalAddress::encode`](crate::PhysicalAddress::encode).

use crate::geometry::Identification;
use crate::utils::address_bytes;
use crate::Error;
use bitflags::bitflags;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

enum Opcode {
    /// Read the 16-bit status register.
    ReadStatus = 0xD7,
    /// Read manufacturer and device ID.
    ReadId = 0x9F,
    /// Continuous array read, up to 33 MHz on most parts.
    Read = 0x03,
    /// Write into SRAM buffer 1.
    BufferWrite = 0x84,
    /// Program buffer 1 into a main memory page, without built-in erase.
    BufferToPage = 0x88,
    /// Load buffer 1, erase the page and program it in one command.
    ErasePageProgram = 0x82,
    /// Compare a main memory page against buffer 1.
    ComparePage = 0x60,
    PageErase = 0x81,
    BlockErase = 0x50,
}

/// Disable sector protection.
const WRITE_ENABLE: [u8; 4] = [0x3D, 0x2A, 0x7F, 0x9A];
/// Enable sector protection.
const WRITE_DISABLE: [u8; 4] = [0x3D, 0x2A, 0x7F, 0xA9];
/// Reconfigure to power-of-two page size.
const BINARY_PAGE_SIZE: [u8; 4] = [0x3D, 0x2A, 0x80, 0xA6];
/// Reconfigure to native DataFlash page size.
const DATAFLASH_PAGE_SIZE: [u8; 4] = [0x3D, 0x2A, 0x80, 0xA7];
const CHIP_ERASE: [u8; 4] = [0xC7, 0x94, 0x80, 0x9A];

bitflags! {
    /// Status register bits. The first byte clocked out is the high byte.
    pub struct Status: u16 {
        /// Device is ready. Cleared while an erase or program is in progress.
        const READY = 1 << 15;
        /// The last page compare found a difference.
        const COMPARE_MISMATCH = 1 << 14;
        /// The 4 density bits.
        const DENSITY = 0b0011_1100 << 8;
        /// Sector protection is enabled.
        const PROTECT = 1 << 9;
        /// The chip is configured for power-of-two page sizes.
        const BINARY_PAGE_SIZE = 1 << 8;
        /// The last erase or program operation failed.
        const ERASE_PROGRAM_ERROR = 1 << 5;
        /// Sector lockdown is enabled.
        const SECTOR_LOCKDOWN = 1 << 3;
    }
}

/// Issues DataFlash commands over a SPI bus.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS` pin of the
///   flash chip.
#[derive(Debug)]
pub struct Sequencer<SPI, CS> {
    spi: SPI,
    cs: CS,
    busy_poll_limit: Option<u32>,
    erase_program_errors: bool,
}

impl<SPI, CS> Sequencer<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    CS: OutputPin,
{
    /// Creates a sequencer. No bus traffic happens until the first command.
    ///
    /// `busy_poll_limit` bounds the number of busy status reads
    /// [`wait_ready`](Sequencer::wait_ready) tolerates. `None` polls forever.
    pub fn new(spi: SPI, cs: CS, busy_poll_limit: Option<u32>) -> Self {
        Self {
            spi,
            cs,
            busy_poll_limit,
            erase_program_errors: false,
        }
    }

    /// Enables checking [`Status::ERASE_PROGRAM_ERROR`] after each operation.
    ///
    /// Only parts with a second status byte report this bit. Older parts
    /// repeat the first byte, where bit 5 is a density bit.
    pub fn check_erase_program_errors(&mut self, enabled: bool) {
        self.erase_program_errors = enabled;
    }

    /// Returns the SPI and chip select objects so they can be used elsewhere.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn command(&mut self, bytes: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        // If the SPI transfer fails, make sure to disable CS anyways
        self.cs.set_low().map_err(Error::Gpio)?;
        let spi_result = self.spi.transfer(bytes).map_err(Error::Spi);
        self.cs.set_high().map_err(Error::Gpio)?;
        spi_result?;
        Ok(())
    }

    fn write_frame(&mut self, header: &[u8], data: &[u8]) -> Result<(), Error<SPI, CS>> {
        self.cs.set_low().map_err(Error::Gpio)?;
        let mut spi_result = self.spi.write(header);
        if spi_result.is_ok() {
            spi_result = self.spi.write(data);
        }
        self.cs.set_high().map_err(Error::Gpio)?;
        spi_result.map_err(Error::Spi)
    }

    fn read_frame(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        self.cs.set_low().map_err(Error::Gpio)?;
        let mut spi_result = self.spi.write(header);
        if spi_result.is_ok() {
            spi_result = self.spi.transfer(buf).map(|_| ());
        }
        self.cs.set_high().map_err(Error::Gpio)?;
        spi_result.map_err(Error::Spi)
    }

    fn addressed(opcode: Opcode, addr: u32) -> [u8; 4] {
        let [a2, a1, a0] = address_bytes(addr);
        [opcode as u8, a2, a1, a0]
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<Status, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadStatus as u8, 0, 0];
        self.command(&mut buf)?;

        Ok(Status::from_bits_truncate(u16::from_be_bytes([buf[1], buf[2]])))
    }

    /// Reads the manufacturer/device identification.
    pub fn read_id(&mut self) -> Result<Identification, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadId as u8, 0, 0, 0, 0];
        self.command(&mut buf)?;

        // Skip buf[0] (SPI read response byte)
        Ok(Identification::from_bytes(&buf[1..]))
    }

    /// Turns sector protection off (`enable`) or back on.
    pub fn write_enable(&mut self, enable: bool) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = if enable { WRITE_ENABLE } else { WRITE_DISABLE };
        self.command(&mut cmd_buf)
    }

    /// Blocks until the chip reports ready, and returns the final status.
    ///
    /// Fails with [`Error::BusyTimeout`] once the configured poll limit is
    /// exhausted, and with [`Error::UnexpectedStatus`] if the finished
    /// operation reports an erase/program error while
    /// [`check_erase_program_errors`](Sequencer::check_erase_program_errors)
    /// is enabled.
    pub fn wait_ready(&mut self) -> Result<Status, Error<SPI, CS>> {
        let mut polls = 0u32;
        loop {
            let status = self.read_status()?;
            if status.contains(Status::READY) {
                if self.erase_program_errors && status.contains(Status::ERASE_PROGRAM_ERROR) {
                    warn!("wait_ready: erase/program error, status = {:?}", status);
                    return Err(Error::UnexpectedStatus);
                }
                return Ok(status);
            }

            polls = polls.saturating_add(1);
            if let Some(limit) = self.busy_poll_limit {
                if polls >= limit {
                    return Err(Error::BusyTimeout);
                }
            }
        }
    }

    /// Reads `buf.len()` bytes from the array starting at `addr`.
    pub fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        let cmd_buf = Self::addressed(Opcode::Read, addr);
        self.read_frame(&cmd_buf, buf)
    }

    /// Loads `data` into the SRAM buffer at byte `offset`.
    pub fn write_buffer(&mut self, offset: u32, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        let cmd_buf = Self::addressed(Opcode::BufferWrite, offset);
        self.write_frame(&cmd_buf, data)
    }

    /// Programs the SRAM buffer into the page at `page_addr` and waits for
    /// completion. The page must have been erased.
    pub fn commit_buffer(&mut self, page_addr: u32) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = Self::addressed(Opcode::BufferToPage, page_addr);
        self.command(&mut cmd_buf)?;
        self.wait_ready()?;
        Ok(())
    }

    /// Buffered page program: [`write_buffer`](Sequencer::write_buffer)
    /// followed by [`commit_buffer`](Sequencer::commit_buffer).
    ///
    /// `addr` carries the page in its upper bits and the buffer offset in
    /// its lower `page_address_bits` bits.
    pub fn program_page(
        &mut self,
        addr: u32,
        page_address_bits: u8,
        data: &[u8],
    ) -> Result<(), Error<SPI, CS>> {
        let offset_mask: u32 = (1 << page_address_bits) - 1;
        self.write_buffer(addr & offset_mask, data)?;
        self.commit_buffer(addr & !offset_mask)
    }

    /// Erases and programs a page in one command, then waits for completion.
    pub fn erase_program_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        let cmd_buf = Self::addressed(Opcode::ErasePageProgram, addr);
        self.write_frame(&cmd_buf, data)?;
        self.wait_ready()?;
        Ok(())
    }

    /// Compares the page at `page_addr` against the SRAM buffer.
    ///
    /// Returns `true` if they are equal.
    pub fn compare_page(&mut self, page_addr: u32) -> Result<bool, Error<SPI, CS>> {
        let mut cmd_buf = Self::addressed(Opcode::ComparePage, page_addr);
        self.command(&mut cmd_buf)?;
        let status = self.wait_ready()?;
        Ok(!status.contains(Status::COMPARE_MISMATCH))
    }

    /// Erases the page at `page_addr` and waits for completion.
    pub fn erase_page(&mut self, page_addr: u32) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = Self::addressed(Opcode::PageErase, page_addr);
        self.command(&mut cmd_buf)?;
        self.wait_ready()?;
        Ok(())
    }

    /// Erases the 8-page block starting at `page_addr` and waits for
    /// completion.
    pub fn erase_block(&mut self, page_addr: u32) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = Self::addressed(Opcode::BlockErase, page_addr);
        self.command(&mut cmd_buf)?;
        self.wait_ready()?;
        Ok(())
    }

    /// Erases the whole array and waits for completion.
    ///
    /// Warning: this can take tens of seconds. Check the datasheet.
    pub fn erase_chip(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = CHIP_ERASE;
        self.command(&mut cmd_buf)?;
        self.wait_ready()?;
        Ok(())
    }

    /// Reconfigures the page size and waits for completion.
    ///
    /// The setting is non-volatile. Parts with a single status byte only use
    /// the new page size after a power cycle, so check
    /// [`Status::BINARY_PAGE_SIZE`] afterwards.
    pub fn set_page_size(&mut self, binary: bool) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = if binary {
            BINARY_PAGE_SIZE
        } else {
            DATAFLASH_PAGE_SIZE
        };
        self.command(&mut cmd_buf)?;
        self.wait_ready()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, MockPin, MockSpi};

    fn sequencer(bus: &MockBus, limit: Option<u32>) -> Sequencer<MockSpi, MockPin> {
        Sequencer::new(bus.spi(), bus.cs(), limit)
    }

    #[test]
    fn decode_status() {
        let bus = MockBus::at45db021();
        let mut seq = sequencer(&bus, None);
        let status = seq.read_status().unwrap();
        assert!(status.contains(Status::READY));
        assert!(status.contains(Status::PROTECT));
        assert!(!status.contains(Status::BINARY_PAGE_SIZE));
        assert_eq!(bus.chip().frames, vec![vec![0xD7, 0, 0]]);
    }

    #[test]
    fn read_id() {
        let bus = MockBus::at45db021();
        let mut seq = sequencer(&bus, None);
        let id = seq.read_id().unwrap();
        assert_eq!(id.mfr_code(), 0x1F);
        assert_eq!(id.density(), 0x03);
        assert!(id.has_extended_status());
    }

    #[test]
    fn wait_ready_polls_until_ready() {
        let bus = MockBus::at45db021();
        bus.chip().busy_polls = 3;
        let mut seq = sequencer(&bus, None);
        seq.write_enable(true).unwrap();
        seq.erase_page(0).unwrap();
        // 3 busy reads and the final ready one
        assert_eq!(bus.chip().count_frames(&[0xD7]), 4);
    }

    #[test]
    fn wait_ready_gives_up_after_limit() {
        let bus = MockBus::at45db021();
        bus.chip().stuck_busy = true;
        let mut seq = sequencer(&bus, Some(5));
        match seq.wait_ready() {
            Err(Error::BusyTimeout) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(bus.chip().count_frames(&[0xD7]), 5);
    }

    #[test]
    fn erase_program_error_is_reported() {
        let bus = MockBus::at45db021();
        bus.chip().erase_program_error = true;
        let mut seq = sequencer(&bus, None);
        seq.check_erase_program_errors(true);
        match seq.erase_page(0) {
            Err(Error::UnexpectedStatus) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn repeated_status_byte_is_not_an_error() {
        // AT45DB081D: one status byte, clocked out again while selected.
        // Density 0b1001 puts a 1 in bit 5 of the repeat.
        let bus = MockBus::at45db021();
        {
            let mut chip = bus.chip();
            chip.single_byte_status = true;
            chip.status_density = 0b1001;
        }
        let mut seq = sequencer(&bus, None);
        seq.write_enable(true).unwrap();
        let status = seq.wait_ready().unwrap();
        assert!(status.contains(Status::ERASE_PROGRAM_ERROR));
        seq.erase_page(0).unwrap();
        assert!(bus.chip().page(0).iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn program_page_uses_buffer() {
        let bus = MockBus::at45db021();
        let mut seq = sequencer(&bus, None);
        seq.write_enable(true).unwrap();
        seq.erase_page(2 << 9).unwrap();
        seq.program_page((2 << 9) | 4, 9, &[1, 2, 3]).unwrap();

        let chip = bus.chip();
        assert_eq!(chip.count_frames(&[0x84, 0x00, 0x00, 0x04]), 1);
        assert_eq!(chip.count_frames(&[0x88, 0x00, 0x04, 0x00]), 1);
        assert_eq!(&chip.page(2)[4..7], &[1, 2, 3]);
    }

    #[test]
    fn compare_reports_mismatch() {
        let bus = MockBus::at45db021();
        let mut seq = sequencer(&bus, None);
        seq.write_enable(true).unwrap();
        seq.erase_page(0).unwrap();
        seq.program_page(0, 9, &[0x55; 264]).unwrap();
        assert!(seq.compare_page(0).unwrap());

        bus.chip().page_mut(0)[10] = 0;
        assert!(!seq.compare_page(0).unwrap());
    }

    #[test]
    fn chip_select_released_on_spi_failure() {
        let bus = MockBus::at45db021();
        bus.chip().fail_after_frames = Some(0);
        let mut seq = sequencer(&bus, None);
        match seq.read_page(0, &mut [0; 4]) {
            Err(Error::Spi(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!bus.chip().selected);
    }
}
