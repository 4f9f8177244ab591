use std::time::Duration;

pub const VENDOR_ID: u16 = 0x16d0;
pub const PRODUCT_ID: u16 = 0x0753;

/// Highest protocol major version this tool knows how to upload to.
pub const MAX_MAJOR_VERSION: u8 = 2;

pub const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Vendor request, device recipient, device-to-host. Used for every request.
pub const REQUEST_TYPE: u8 = 0xc0;

pub const INFO_REPLY_LEN: usize = 4;

pub const RESET_VECTOR_ADDR: u16 = 0;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xff;

pub const ERASE_PROGRESS_STEPS: u32 = 100;

/// Milliseconds the host waits after each page commit. The AVR freezes for
/// about 4.5ms while writing a page.
pub const DEFAULT_WRITE_SLEEP_MS: u8 = 8;

pub mod requests {
    pub const INFO: u8 = 0;
    pub const WRITE_PAGE: u8 = 1;
    pub const ERASE: u8 = 2;
    pub const FILL: u8 = 3;
    pub const EXIT: u8 = 4;
}
