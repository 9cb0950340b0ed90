//! The DataFlash block device.

use crate::command::{Sequencer, Status};
use crate::geometry::{Geometry, Identification};
use crate::{BlockDevice, Error};
use core::convert::TryFrom;
use core::sync::atomic::{AtomicU32, Ordering};
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

/// Which page layout to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSizeMode {
    /// Use whatever the chip currently reports.
    AsConfigured,
    /// Power-of-two pages (256 or 512 bytes). Reconfigures the chip if needed.
    Binary,
    /// Native pages (264 or 528 bytes). Reconfigures the chip if needed.
    DataFlash,
}

/// The unit [`BlockDevice::erase`] works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseGranularity {
    /// 8-page blocks.
    Block,
    /// Single pages.
    Page,
}

/// Construction-time driver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Page layout to use. Defaults to [`PageSizeMode::AsConfigured`].
    pub page_size_mode: PageSizeMode,
    /// Unit of [`BlockDevice::erase`]. Defaults to 8-page blocks.
    pub erase_granularity: EraseGranularity,
    /// Maximum number of busy status reads per operation. `None` waits
    /// forever.
    pub busy_poll_limit: Option<u32>,
    /// Compare every programmed page against the chip's buffer.
    pub verify_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size_mode: PageSizeMode::AsConfigured,
            erase_granularity: EraseGranularity::Block,
            busy_poll_limit: None,
            verify_writes: false,
        }
    }
}

/// Lifecycle state of a [`DataFlash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not probed yet, or every `init` has been matched by a `deinit`.
    Uninitialized,
    /// Probed; the geometry is known and all operations are available.
    Ready,
}

/// Block device driver for AT45-series DataFlash chips.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS` pin of the
///   flash chip. Will be driven low when accessing the device.
/// * **`WP`**: The optional `\WP` line. Driven high while a program or erase
///   call is running and low otherwise.
///
/// `init` and `deinit` are reference counted so that nested users of one
/// device neither probe it twice nor tear it down early. Every operation
/// takes `&mut self`; to share a device between threads or tasks, wrap it in
/// a mutex. The counter keeps `init`/`deinit` pairs balanced, it does not
/// serialize bus access.
#[derive(Debug)]
pub struct DataFlash<SPI, CS, WP> {
    seq: Sequencer<SPI, CS>,
    wp: Option<WP>,
    config: Config,
    id: Option<Identification>,
    geometry: Option<Geometry>,
    init_ref_count: AtomicU32,
}

impl<SPI, CS> DataFlash<SPI, CS, CS>
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    CS: OutputPin,
{
    /// Creates a driver for a chip without a wired write-protect line.
    ///
    /// # Parameters
    ///
    /// * **`spi`**: An SPI master. Must be configured to operate in the correct
    ///   mode for the device.
    /// * **`cs`**: The **C**hip-**S**elect Pin connected to the `\CS` pin
    ///   of the flash chip.
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self::with_config(spi, cs, None, Config::default())
    }
}

impl<SPI, CS, WP> DataFlash<SPI, CS, WP>
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin<Error = CS::Error>,
{
    /// Creates a driver that also controls the chip's `\WP` pin.
    pub fn with_write_protect(spi: SPI, cs: CS, wp: WP) -> Self {
        Self::with_config(spi, cs, Some(wp), Config::default())
    }

    /// Creates a driver with explicit settings.
    pub fn with_config(spi: SPI, cs: CS, wp: Option<WP>, config: Config) -> Self {
        DataFlash {
            seq: Sequencer::new(spi, cs, config.busy_poll_limit),
            wp,
            config,
            id: None,
            geometry: None,
            init_ref_count: AtomicU32::new(0),
        }
    }

    /// Returns the bus, chip select and write-protect objects.
    pub fn release(self) -> (SPI, CS, Option<WP>) {
        let (spi, cs) = self.seq.free();
        (spi, cs, self.wp)
    }

    /// The settings this driver was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the device has been probed by [`BlockDevice::init`].
    pub fn state(&self) -> DeviceState {
        match self.geometry {
            Some(_) => DeviceState::Ready,
            None => DeviceState::Uninitialized,
        }
    }

    /// The identification read by the last successful probe.
    pub fn identification(&self) -> Option<Identification> {
        self.id
    }

    /// The geometry of the probed chip, if initialized.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn ready(&self) -> Result<Geometry, Error<SPI, CS>> {
        self.geometry.ok_or(Error::InvalidState)
    }

    fn probe(&mut self) -> Result<Geometry, Error<SPI, CS>> {
        let id = self.seq.read_id()?;
        self.seq.check_erase_program_errors(id.has_extended_status());
        let mut status = self.seq.read_status()?;
        if !status.contains(Status::READY) {
            status = self.seq.wait_ready()?;
        }
        debug!("DataFlash::probe: id = {:?}, status = {:?}", id, status);

        let reported_binary = status.contains(Status::BINARY_PAGE_SIZE);
        let binary = match self.config.page_size_mode {
            PageSizeMode::AsConfigured => reported_binary,
            PageSizeMode::Binary => true,
            PageSizeMode::DataFlash => false,
        };
        let mut geometry =
            Geometry::from_identification(&id, binary).ok_or(Error::UnsupportedDevice(id))?;

        if binary != reported_binary {
            warn!(
                "DataFlash::probe: switching page size mode (binary = {})",
                binary
            );
            self.seq.set_page_size(binary)?;

            // Older parts keep the old layout until the next power cycle.
            let status = self.seq.wait_ready()?;
            let now_binary = status.contains(Status::BINARY_PAGE_SIZE);
            if now_binary != binary {
                warn!("DataFlash::probe: page size applies after a power cycle");
                geometry = Geometry::from_identification(&id, now_binary)
                    .ok_or(Error::UnsupportedDevice(id))?;
            }
        }

        self.id = Some(id);
        Ok(geometry)
    }

    /// Drops write protection. If that fails partway, protection is put
    /// back before returning.
    fn unprotect(&mut self) -> Result<(), Error<SPI, CS>> {
        if let Some(wp) = &mut self.wp {
            wp.set_high().map_err(Error::Gpio)?;
        }
        if let Err(e) = self.seq.write_enable(true) {
            if self.protect().is_err() {
                error!("DataFlash: write protection not restored");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Restores write protection. The `\WP` pin is driven low even if the
    /// write-disable command fails; the first error is returned.
    fn protect(&mut self) -> Result<(), Error<SPI, CS>> {
        let disable = self.seq.write_enable(false);
        let pin = match &mut self.wp {
            Some(wp) => wp.set_low().map_err(Error::Gpio),
            None => Ok(()),
        };
        disable.and(pin)
    }

    /// Runs `op` with write protection lifted, restoring it even if `op`
    /// fails. The first error wins.
    fn unprotected<F>(&mut self, op: F) -> Result<(), Error<SPI, CS>>
    where
        F: FnOnce(&mut Self) -> Result<(), Error<SPI, CS>>,
    {
        self.unprotect()?;
        let result = op(self);
        let protect = self.protect();
        if result.is_err() && protect.is_err() {
            error!("DataFlash: write protection not restored");
        }
        result?;
        protect
    }

    fn write_pages(
        &mut self,
        geometry: &Geometry,
        addr: u32,
        data: &[u8],
        erase: bool,
    ) -> Result<(), Error<SPI, CS>> {
        let bits = geometry.page_address_bits();
        for segment in geometry.segments(addr, data.len() as u32) {
            let chunk = &data[segment.range()];
            let encoded = segment.address.encode(bits);
            trace!(
                "DataFlash: program page {} (+{}, {} bytes)",
                segment.address.page,
                segment.address.offset,
                segment.len
            );

            if erase {
                self.seq.erase_program_page(encoded, chunk)?;
            } else {
                self.seq.program_page(encoded, bits, chunk)?;
            }

            if self.config.verify_writes && !self.seq.compare_page(segment.address.page << bits)? {
                return Err(Error::VerifyFailed {
                    page: segment.address.page,
                });
            }
        }
        Ok(())
    }

    fn checked_program(&self, addr: u32, len: usize) -> Result<Geometry, Error<SPI, CS>> {
        let geometry = self.ready()?;
        let size = u32::try_from(len).map_err(|_| Error::InvalidAddress)?;
        if !self.is_valid_program(addr, size) {
            return Err(Error::InvalidAddress);
        }
        Ok(geometry)
    }

    /// Programs `data` at `addr` using the chip's built-in erase, so the
    /// target does not have to be erased first.
    ///
    /// Same alignment rules as [`BlockDevice::program`].
    pub fn erase_and_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        let geometry = self.checked_program(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.unprotected(|this| this.write_pages(&geometry, addr, data, true))
    }

    /// Erases the whole chip.
    pub fn erase_all(&mut self) -> Result<(), Error<SPI, CS>> {
        self.ready()?;
        info!("DataFlash: chip erase");
        self.unprotected(|this| this.seq.erase_chip())
    }
}

impl<SPI, CS, WP> BlockDevice for DataFlash<SPI, CS, WP>
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin<Error = CS::Error>,
{
    type Error = Error<SPI, CS>;

    fn init(&mut self) -> Result<(), Self::Error> {
        let count = self.init_ref_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count != 1 {
            return Ok(());
        }

        match self.probe() {
            Ok(geometry) => {
                info!(
                    "DataFlash::init: {} with {} pages of {} bytes",
                    geometry.part_name(),
                    geometry.pages(),
                    geometry.page_size()
                );
                self.geometry = Some(geometry);
                Ok(())
            }
            Err(e) => {
                // Let the next caller probe again.
                self.init_ref_count.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        let previous = self
            .init_ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| Error::InvalidState)?;

        if previous == 1 {
            debug!("DataFlash::deinit: released");
            self.geometry = None;
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let geometry = self.ready()?;
        let size = u32::try_from(buf.len()).map_err(|_| Error::InvalidAddress)?;
        if !self.is_valid_read(addr, size) {
            return Err(Error::InvalidAddress);
        }

        let bits = geometry.page_address_bits();
        for segment in geometry.segments(addr, size) {
            let encoded = segment.address.encode(bits);
            self.seq.read_page(encoded, &mut buf[segment.range()])?;
        }
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        let geometry = self.checked_program(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.unprotected(|this| this.write_pages(&geometry, addr, data, false))
    }

    fn erase(&mut self, addr: u32, size: u32) -> Result<(), Self::Error> {
        let geometry = self.ready()?;
        if !self.is_valid_erase(addr, size) {
            return Err(Error::InvalidAddress);
        }
        if size == 0 {
            return Ok(());
        }

        let unit = self.erase_size_at(addr);
        let granularity = self.config.erase_granularity;
        let bits = geometry.page_address_bits();
        self.unprotected(|this| {
            for start in (addr..addr + size).step_by(unit as usize) {
                let page = start / geometry.page_size();
                trace!("DataFlash: erase page {} ({:?})", page, granularity);
                match granularity {
                    EraseGranularity::Block => this.seq.erase_block(page << bits)?,
                    EraseGranularity::Page => this.seq.erase_page(page << bits)?,
                }
            }
            Ok(())
        })
    }

    fn read_size(&self) -> u32 {
        self.geometry.map_or(0, |_| 1)
    }

    fn program_size(&self) -> u32 {
        self.geometry.map_or(0, |g| g.page_size())
    }

    fn erase_size(&self) -> u32 {
        self.geometry.map_or(0, |g| match self.config.erase_granularity {
            EraseGranularity::Block => g.block_size(),
            EraseGranularity::Page => g.page_size(),
        })
    }

    fn size(&self) -> u32 {
        self.geometry.map_or(0, |g| g.total_size())
    }
}
