//! Logging shims that forward to the `log` crate when the `log` feature is on.

macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::trace!($($arg)+);
    };
}

macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::debug!($($arg)+);
    };
}

macro_rules! info {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::info!($($arg)+);
    };
}

macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::warn!($($arg)+);
    };
}

macro_rules! error {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::error!($($arg)+);
    };
}
