use crate::geometry::Identification;
use core::fmt::{self, Debug, Display};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// No error.
pub const BD_ERROR_OK: i32 = 0;
/// The bus or the chip failed, or the chip reported an unexpected status.
pub const BD_ERROR_DEVICE_ERROR: i32 = -4001;
/// Misaligned or out-of-bounds request.
pub const BD_ERROR_INVALID_ADDRESS: i32 = -4002;
/// The probed chip is not a supported DataFlash part.
pub const BD_ERROR_UNSUPPORTED_DEVICE: i32 = -4003;
/// Operation attempted while the device is not initialized, or unbalanced
/// `deinit`.
pub const BD_ERROR_INVALID_STATE: i32 = -4004;

mod private {
    #[derive(Debug)]
    pub enum Private {}
}

/// The error type used by this library.
///
/// This can encapsulate an SPI or GPIO error, and adds its own protocol and
/// block device errors on top of that.
pub enum Error<SPI: Transfer<u8>, GPIO: OutputPin> {
    /// An SPI transfer failed.
    Spi(SPI::Error),

    /// A GPIO could not be set.
    Gpio(GPIO::Error),

    /// Status register contained unexpected flags.
    ///
    /// This is reported when the chip flags a failed erase or program
    /// operation.
    UnexpectedStatus,

    /// The chip did not become ready within the configured number of status
    /// polls.
    BusyTimeout,

    /// A programmed page did not match the data sent to the chip.
    VerifyFailed {
        /// Physical index of the mismatching page.
        page: u32,
    },

    /// The request is misaligned or does not fit into the device.
    ///
    /// Returned before any bus traffic happens.
    InvalidAddress,

    /// The chip identification does not match any supported part.
    UnsupportedDevice(Identification),

    /// The device is not initialized, or `deinit` was called more often than
    /// `init`.
    InvalidState,

    #[doc(hidden)]
    __NonExhaustive(private::Private),
}

impl<SPI: Transfer<u8>, GPIO: OutputPin> Error<SPI, GPIO> {
    /// Returns the block device error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::Spi(_)
            | Error::Gpio(_)
            | Error::UnexpectedStatus
            | Error::BusyTimeout
            | Error::VerifyFailed { .. } => BD_ERROR_DEVICE_ERROR,
            Error::InvalidAddress => BD_ERROR_INVALID_ADDRESS,
            Error::UnsupportedDevice(_) => BD_ERROR_UNSUPPORTED_DEVICE,
            Error::InvalidState => BD_ERROR_INVALID_STATE,
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl<SPI: Transfer<u8>, GPIO: OutputPin> Debug for Error<SPI, GPIO>
where
    SPI::Error: Debug,
    GPIO::Error: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi) => write!(f, "Error::Spi({:?})", spi),
            Error::Gpio(gpio) => write!(f, "Error::Gpio({:?})", gpio),
            Error::UnexpectedStatus => f.write_str("Error::UnexpectedStatus"),
            Error::BusyTimeout => f.write_str("Error::BusyTimeout"),
            Error::VerifyFailed { page } => write!(f, "Error::VerifyFailed {{ page: {} }}", page),
            Error::InvalidAddress => f.write_str("Error::InvalidAddress"),
            Error::UnsupportedDevice(id) => write!(f, "Error::UnsupportedDevice({:?})", id),
            Error::InvalidState => f.write_str("Error::InvalidState"),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl<SPI: Transfer<u8>, GPIO: OutputPin> Display for Error<SPI, GPIO>
where
    SPI::Error: Display,
    GPIO::Error: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi) => write!(f, "SPI error: {}", spi),
            Error::Gpio(gpio) => write!(f, "GPIO error: {}", gpio),
            Error::UnexpectedStatus => f.write_str("unexpected value in status register"),
            Error::BusyTimeout => f.write_str("device stayed busy"),
            Error::VerifyFailed { page } => write!(f, "page {} does not match written data", page),
            Error::InvalidAddress => f.write_str("misaligned or out-of-bounds address"),
            Error::UnsupportedDevice(id) => write!(f, "unsupported device {:?}", id),
            Error::InvalidState => f.write_str("device not initialized"),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}
