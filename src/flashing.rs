//! Host-side upload sequencing.

use std::thread::sleep;
use std::time::Duration;

use crate::constants::{ERASED_BYTE, ERASE_PROGRESS_STEPS, INFO_REPLY_LEN};
use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::protocol::{relocate_reset_vector, Command};
use crate::transport::{Transport, UsbTransport};

/// Result of an erase that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStatus {
    Complete,
    /// The device dropped off the bus while erasing and the handle was
    /// closed. Call [`Flashing::reconnect`] before continuing.
    Disconnected,
}

/// One page worth of flash content, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    pub address: u32,
    pub buffer: Vec<u8>,
    /// Nothing to program: skip the page entirely.
    pub unused: bool,
}

/// Build the buffer for the page at `address`.
///
/// Bytes past the end of `image` are padded with the erased value. Page 0
/// and the final page are always sent, since the bootloader patches the
/// reset vector into them.
pub fn build_page(info: &DeviceInfo, image: &[u8], address: u32, user_reset: u16) -> PagePlan {
    let page_size = info.page_size as usize;
    let start = address as usize;
    let mut buffer = vec![ERASED_BYTE; page_size];
    if start < image.len() {
        let end = (start + page_size).min(image.len());
        buffer[..end - start].copy_from_slice(&image[start..end]);
    }

    let last_page = info.is_last_page(address);
    if last_page && info.capabilities().host_patches_reset_vector {
        let user_reset_addr = info.user_reset_addr();
        let vector = relocate_reset_vector(user_reset, user_reset_addr as u16);
        let offset = (user_reset_addr - address) as usize;
        buffer[offset..offset + 2].copy_from_slice(&vector.to_le_bytes());
    }

    let unused = address != 0 && !last_page && buffer.iter().all(|&b| b == ERASED_BYTE);
    PagePlan {
        address,
        buffer,
        unused,
    }
}

/// The application's reset vector, as found in the first word of the image.
pub fn user_reset_vector(image: &[u8]) -> u16 {
    let byte = |i: usize| image.get(i).copied().unwrap_or(ERASED_BYTE);
    u16::from_le_bytes([byte(0), byte(1)])
}

pub struct Flashing<T: Transport> {
    transport: T,
    info: DeviceInfo,
}

impl Flashing<UsbTransport> {
    pub fn new_from_usb(timeout: Option<Duration>) -> Result<Self> {
        let transport = UsbTransport::open_with_timeout(timeout)?;
        Self::connect(transport)
    }
}

impl<T: Transport> Flashing<T> {
    /// Check the protocol version, then read the device descriptor.
    pub fn connect(mut transport: T) -> Result<Self> {
        let version = transport.version();
        if !version.is_supported() {
            log::warn!("Device with unknown new version of Micronucleus detected: {}", version);
            return Err(Error::UnsupportedVersion(version));
        }
        let info = read_info(&mut transport)?;
        log::debug!("found device: {}", info);
        Ok(Flashing { transport, info })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn dump_info(&self) -> Result<()> {
        log::info!("Device: {}", self.info);
        log::info!(
            "Available space for user application: {} bytes",
            self.info.flash_size
        );
        log::info!(
            "Reset vector patching: {}",
            if self.info.capabilities().host_patches_reset_vector {
                "host and device"
            } else {
                "device"
            }
        );
        Ok(())
    }

    /// Erase the user region, waiting out the time the device is busy.
    ///
    /// `progress` goes from 0.0 to 1.0 across the wait.
    pub fn erase_flash(&mut self, mut progress: impl FnMut(f32)) -> Result<EraseStatus> {
        let result = self.transport.transfer(Command::Erase, &mut []);

        // give the device time to erase all pages and come back online
        let step = Duration::from_micros(
            self.info.erase_sleep_ms as u64 * 1000 / ERASE_PROGRESS_STEPS as u64,
        );
        for i in 0..ERASE_PROGRESS_STEPS {
            progress(i as f32 / ERASE_PROGRESS_STEPS as f32);
            sleep(step);
        }
        progress(1.0);

        match result {
            Ok(0) => {
                log::info!("Flash erased");
                Ok(EraseStatus::Complete)
            }
            Ok(len) => Err(Error::UnexpectedReply {
                command: Command::Erase.name(),
                len,
            }),
            Err(e) if e.is_erase_disconnect() => {
                // every recoverable code drops the handle
                log::warn!("Device disconnected while erasing ({}), reconnect needed", e);
                self.transport.close();
                Ok(EraseStatus::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    /// Reopen the device after it re-enumerated and refresh its descriptor.
    pub fn reconnect(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport.reopen(timeout)?;
        let version = self.transport.version();
        if !version.is_supported() {
            return Err(Error::UnsupportedVersion(version));
        }
        let info = read_info(&mut self.transport)?;
        if info != self.info {
            log::warn!("Device descriptor changed after reconnect: {}", info);
        }
        self.info = info;
        log::debug!("reconnected: {}", self.info);
        Ok(())
    }

    /// Program `image` page by page from address 0.
    ///
    /// Pages already written are not rolled back on failure, erase before retrying.
    pub fn write_flash(&mut self, image: &[u8], mut progress: impl FnMut(f32)) -> Result<()> {
        let info = self.info;
        let flash_size = info.flash_size as u32;
        if image.len() > flash_size as usize {
            return Err(Error::ImageTooLarge {
                size: image.len(),
                flash_size: flash_size as usize,
            });
        }
        if info.capabilities().host_patches_reset_vector
            && image.len() > info.user_reset_addr() as usize
        {
            log::warn!(
                "Program overlaps the relocated reset vector at 0x{:04x}",
                info.user_reset_addr()
            );
        }

        let user_reset = user_reset_vector(image);
        let mut written = 0;
        let mut address = 0;
        while address < flash_size {
            let page = build_page(&info, image, address, user_reset);
            if page.unused {
                log::trace!("skipping unused page 0x{:04x}", address);
            } else {
                self.write_page(&page)?;
                written += 1;
            }

            progress(address as f32 / flash_size as f32);

            if !page.unused {
                // the device is frozen while committing the page
                sleep(Duration::from_millis(info.write_sleep_ms as u64));
            }
            address += info.page_size as u32;
        }
        progress(1.0);

        log::info!("Wrote {} of {} pages", written, info.pages);
        Ok(())
    }

    fn write_page(&mut self, page: &PagePlan) -> Result<()> {
        self.expect_ack(Command::write_page(page.address as u16))?;
        for chunk in page.buffer.chunks_exact(4) {
            let word0 = u16::from_le_bytes([chunk[0], chunk[1]]);
            let word1 = u16::from_le_bytes([chunk[2], chunk[3]]);
            self.expect_ack(Command::fill(word0, word1))?;
        }
        Ok(())
    }

    /// Leave the bootloader and run the uploaded program.
    pub fn start_app(&mut self) -> Result<()> {
        self.expect_ack(Command::Exit)?;
        log::info!("Starting user application");
        Ok(())
    }

    fn expect_ack(&mut self, cmd: Command) -> Result<()> {
        let len = self.transport.transfer(cmd, &mut [])?;
        if len != 0 {
            return Err(Error::UnexpectedReply {
                command: cmd.name(),
                len,
            });
        }
        Ok(())
    }
}

fn read_info<T: Transport>(transport: &mut T) -> Result<DeviceInfo> {
    let mut buf = [0u8; INFO_REPLY_LEN];
    let n = transport.transfer(Command::Info, &mut buf)?;
    DeviceInfo::from_reply(transport.version(), &buf[..n])
}
