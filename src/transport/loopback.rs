//! In-process transport wired straight into the firmware model.
use std::collections::HashMap;
use std::time::Duration;

use super::Transport;
use crate::error::{Error, Result};
use crate::firmware::{
    Bootloader, BootloaderConfig, LoopControl, MemoryFlash, NullWatchdog, Reply,
};
use crate::protocol::{Command, ControlRequest, Version};

/// Size of the bootloader region appended above the user flash.
const BOOTLOADER_REGION: usize = 0x800;

/// What goes wrong with an injected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The transfer fails and the device never sees it.
    Error(rusb::Error),
    /// The device acts on the request but answers with these bytes. The
    /// full length is reported, even past the end of the caller's buffer.
    Reply(Vec<u8>),
}

pub struct LoopbackTransport {
    bootloader: Bootloader<MemoryFlash, NullWatchdog>,
    open: bool,
    exited: bool,
    erase_error: Option<rusb::Error>,
    faults: HashMap<usize, Fault>,
    requests: Vec<ControlRequest>,
}

impl LoopbackTransport {
    pub fn new(config: BootloaderConfig) -> Result<Self> {
        let memory = MemoryFlash::new(
            config.bootloader_address as usize + BOOTLOADER_REGION,
            config.page_size as u16,
        );
        Self::with_memory(config, memory)
    }

    pub fn with_memory(config: BootloaderConfig, memory: MemoryFlash) -> Result<Self> {
        Ok(LoopbackTransport {
            bootloader: Bootloader::new(config, memory, NullWatchdog)?,
            open: true,
            exited: false,
            erase_error: None,
            faults: HashMap::new(),
            requests: Vec::new(),
        })
    }

    /// Make the next erase report `error` after the device has erased,
    /// like a device that dropped off the bus meanwhile.
    pub fn fail_next_erase(&mut self, error: rusb::Error) {
        self.erase_error = Some(error);
    }

    /// Apply `fault` to the request at index `nth` of [`requests`](Self::requests).
    pub fn fail_request(&mut self, nth: usize, fault: Fault) {
        self.faults.insert(nth, fault);
    }

    pub fn bootloader(&self) -> &Bootloader<MemoryFlash, NullWatchdog> {
        &self.bootloader
    }

    pub fn flash(&self) -> &MemoryFlash {
        self.bootloader.memory()
    }

    /// Every request sent to the device, in order, including failed ones.
    pub fn requests(&self) -> &[ControlRequest] {
        &self.requests
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The device left the bootloader and started the application.
    pub fn is_exited(&self) -> bool {
        self.exited
    }
}

impl Transport for LoopbackTransport {
    fn version(&self) -> Version {
        self.bootloader.config().version
    }

    fn control_in(&mut self, req: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::Disconnected);
        }
        if self.exited {
            return Err(Error::Usb(rusb::Error::NoDevice));
        }
        let fault = self.faults.remove(&self.requests.len());
        self.requests.push(req);
        if let Some(Fault::Error(e)) = fault {
            log::debug!("injected {} on {}", e, req);
            return Err(Error::Usb(e));
        }

        let mut reply = self.bootloader.handle_control_request(&req, &[]);
        if reply == Reply::Stall {
            return Err(Error::Usb(rusb::Error::Pipe));
        }
        let mut n = reply.data().len().min(buf.len());
        if let Some(Fault::Reply(data)) = fault {
            n = data.len();
            reply = Reply::Data(data);
        }
        let data = reply.data();
        let copied = data.len().min(buf.len());
        buf[..copied].copy_from_slice(&data[..copied]);
        if self.bootloader.complete_transaction() == LoopControl::Exit {
            self.exited = true;
        }

        if Command::from_request(&req) == Some(Command::Erase) {
            if let Some(e) = self.erase_error.take() {
                return Err(Error::Usb(e));
            }
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn reopen(&mut self, _timeout: Option<Duration>) -> Result<()> {
        if self.exited {
            return Err(Error::NoDevice);
        }
        self.open = true;
        Ok(())
    }
}
