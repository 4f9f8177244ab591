//! Abstract device transport interface.
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{Command, ControlRequest, Version};

pub use self::loopback::{Fault, LoopbackTransport};
pub use self::usb::UsbTransport;

mod loopback;
mod usb;

/// Abstraction of the control endpoint of the bootloader.
/// Might be a real USB device or an in-process device model.
pub trait Transport {
    /// Protocol version from `bcdDevice`, known without any transfer.
    fn version(&self) -> Version;

    /// Issue a vendor control-in transfer and return the number of bytes the
    /// device sent back into `buf`.
    fn control_in(&mut self, req: ControlRequest, buf: &mut [u8]) -> Result<usize>;

    /// Drop the device handle. Transfers fail until [`reopen`](Self::reopen).
    fn close(&mut self);

    /// Find the device again after it re-enumerated. `None` waits forever.
    fn reopen(&mut self, timeout: Option<Duration>) -> Result<()>;

    fn transfer(&mut self, cmd: Command, buf: &mut [u8]) -> Result<usize> {
        let req = cmd.into_request();
        match cmd {
            Command::Fill { .. } => log::trace!("=> {}", req),
            _ => log::debug!("=> {:?} [{}]", cmd, req),
        }
        let n = self.control_in(req, buf)?;
        if n > 0 {
            log::debug!("<= {}", hex::encode(&buf[..n]));
        }
        Ok(n)
    }
}
