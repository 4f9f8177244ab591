//! Device descriptor reported by the bootloader at connect time
use std::fmt;

use scroll::{Pread, BE};

use crate::constants::INFO_REPLY_LEN;
use crate::error::{Error, Result};
use crate::protocol::{Capabilities, Version};

/// Geometry and timing of the attached bootloader.
///
/// Read once when connecting, only valid while the USB handle stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: Version,
    /// Bytes of flash available to the user program
    pub flash_size: u16,
    pub page_size: u8,
    pub pages: u16,
    /// How long the device is busy after committing a page
    pub write_sleep_ms: u8,
    /// `write_sleep_ms * pages`
    pub erase_sleep_ms: u16,
}

impl DeviceInfo {
    pub fn new(version: Version, flash_size: u16, page_size: u8, write_sleep_ms: u8) -> Result<Self> {
        // fill requests carry two words, so pages must hold whole pairs
        if flash_size == 0 || page_size == 0 || page_size % 4 != 0 {
            return Err(Error::InvalidGeometry {
                flash_size,
                page_size,
            });
        }
        let pages = flash_size.div_ceil(page_size as u16);
        // page addresses travel in a 16-bit wIndex
        if pages as u32 * page_size as u32 > 0x1_0000 {
            return Err(Error::InvalidGeometry {
                flash_size,
                page_size,
            });
        }
        Ok(DeviceInfo {
            version,
            flash_size,
            page_size,
            pages,
            write_sleep_ms,
            erase_sleep_ms: (write_sleep_ms as u16).saturating_mul(pages),
        })
    }

    /// Parse the reply to the info request: `[size_hi, size_lo, page_size, write_sleep]`.
    pub fn from_reply(version: Version, reply: &[u8]) -> Result<Self> {
        if reply.len() < INFO_REPLY_LEN {
            return Err(Error::ShortInfoReply(reply.len()));
        }
        let flash_size = reply
            .pread_with::<u16>(0, BE)
            .map_err(|_| Error::ShortInfoReply(reply.len()))?;
        Self::new(version, flash_size, reply[2], reply[3])
    }

    pub fn capabilities(&self) -> Capabilities {
        self.version.capabilities()
    }

    pub fn last_page_address(&self) -> u32 {
        (self.pages as u32 - 1) * self.page_size as u32
    }

    /// Address of the relocated user reset vector: the trailing word of the final page.
    pub fn user_reset_addr(&self) -> u32 {
        self.pages as u32 * self.page_size as u32 - 2
    }

    pub fn is_last_page(&self, address: u32) -> bool {
        address >= self.last_page_address()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Micronucleus v{} (Flash: {} bytes, {} pages of {} bytes, write sleep {}ms, erase sleep {}ms)",
            self.version,
            self.flash_size,
            self.pages,
            self.page_size,
            self.write_sleep_ms,
            self.erase_sleep_ms,
        )
    }
}
