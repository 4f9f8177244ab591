//! Error types for talking to a Micronucleus bootloader

use thiserror::Error;

use crate::constants::{MAX_MAJOR_VERSION, PRODUCT_ID, VENDOR_ID};
use crate::protocol::Version;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No Micronucleus device found ({vid:04x}:{pid:04x})", vid = VENDOR_ID, pid = PRODUCT_ID)]
    NoDevice,

    /// The device speaks a newer protocol than this tool understands.
    /// Nothing beyond device discovery has been sent to it.
    #[error(
        "Unsupported device version {0}, this tool understands up to {max}.x. Updates may be available",
        max = MAX_MAJOR_VERSION
    )]
    UnsupportedVersion(Version),

    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Device info reply too short: expected 4 bytes, got {0}")]
    ShortInfoReply(usize),

    /// A command expected a zero-length acknowledgement.
    #[error("Unexpected {len}-byte reply to {command} request")]
    UnexpectedReply { command: &'static str, len: usize },

    #[error("Invalid device geometry: flash size {flash_size}, page size {page_size}")]
    InvalidGeometry { flash_size: u16, page_size: u8 },

    #[error("Program of {size} bytes is {excess} bytes too big for {flash_size} bytes of flash", excess = .size - .flash_size)]
    ImageTooLarge { size: usize, flash_size: usize },

    #[error("Device handle is closed, reconnect first")]
    Disconnected,

    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),
}

impl Error {
    /// Transport errors seen when the device drops off the bus while erasing.
    ///
    /// libusb reports these as `EIO` (-5), `EPIPE` on macOS (-34) and
    /// `EILSEQ` on Linux (-84).
    pub fn is_erase_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Usb(rusb::Error::Io | rusb::Error::Pipe | rusb::Error::NoDevice)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
