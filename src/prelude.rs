//! Reexports the traits needed to drive a block device.

pub use crate::BlockDevice as _dataflash_memory_BlockDevice;
