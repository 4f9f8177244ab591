//! Micronucleus USB bootloader protocol implementation.
//!
//! The host side lives in [`flashing`] and [`transport`]; [`firmware`] is a
//! hosted model of the device-resident bootloader.

pub mod constants;
pub mod device;
pub mod error;
pub mod firmware;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod transport;

pub use self::device::DeviceInfo;
pub use self::error::{Error, Result};
pub use self::flashing::{EraseStatus, Flashing};
pub use self::protocol::{Capabilities, Command, ControlRequest, Version};
pub use self::transport::Transport;
