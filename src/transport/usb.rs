//! USB Transportation.
use std::thread::sleep;
use std::time::{Duration, Instant};

use rusb::{
    Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType, UsbContext,
};
use scroll::{Pread, LE};

use super::Transport;
use crate::constants::{PRODUCT_ID, REQUEST_TYPE, USB_TIMEOUT, VENDOR_ID};
use crate::error::{Error, Result};
use crate::protocol::{ControlRequest, Version};

const SCAN_INTERVAL: Duration = Duration::from_millis(100);

const GET_DESCRIPTOR: u8 = 0x06;
const DEVICE_DESCRIPTOR: u16 = 0x0100;
const DEVICE_DESCRIPTOR_LEN: usize = 18;
const BCD_DEVICE_OFFSET: usize = 12;

pub struct UsbTransport {
    device_handle: Option<DeviceHandle<Context>>,
    version: Version,
}

fn is_micronucleus(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID
}

/// `bcdDevice` out of a raw device descriptor.
fn parse_bcd_device(raw: &[u8]) -> Option<u16> {
    if raw.len() < DEVICE_DESCRIPTOR_LEN {
        return None;
    }
    raw.pread_with::<u16>(BCD_DEVICE_OFFSET, LE).ok()
}

/// Fetch the device descriptor again to get `bcdDevice` untouched.
///
/// rusb only hands it out split into decimal digits, which loses major
/// bytes with a nibble above 9.
fn read_bcd_device(handle: &DeviceHandle<Context>) -> Result<u16> {
    let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
    let n = handle.read_control(
        rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device),
        GET_DESCRIPTOR,
        DEVICE_DESCRIPTOR,
        0,
        &mut raw,
        USB_TIMEOUT,
    )?;
    parse_bcd_device(&raw[..n]).ok_or(Error::Usb(rusb::Error::Other))
}

/// Best effort from rusb's decoded version, exact while every nibble is a digit.
fn bcd_from_descriptor(desc: &DeviceDescriptor) -> u16 {
    let v = desc.device_version();
    let major = v.major() as u16;
    (major / 10) << 12 | (major % 10) << 8 | (v.minor() as u16) << 4 | v.sub_minor() as u16
}

fn find_device(context: &Context) -> Result<Option<(Device<Context>, DeviceDescriptor)>> {
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if is_micronucleus(&desc) {
            log::debug!("Found Micronucleus USB device: [{:?}]", device);
            return Ok(Some((device, desc)));
        }
    }
    Ok(None)
}

impl UsbTransport {
    /// Open the first Micronucleus device on the bus.
    pub fn open_any() -> Result<UsbTransport> {
        let context = Context::new()?;
        let (device, desc) = find_device(&context)?.ok_or(Error::NoDevice)?;
        let device_handle = device.open()?;
        let bcd = read_bcd_device(&device_handle).unwrap_or_else(|e| {
            log::debug!("reading device descriptor failed: {}", e);
            bcd_from_descriptor(&desc)
        });
        let version = Version::from_bcd(bcd);
        log::debug!("Micronucleus v{} (bcdDevice 0x{:04x})", version, bcd);
        Ok(UsbTransport {
            device_handle: Some(device_handle),
            version,
        })
    }

    /// Poll the bus until a device is plugged in. `None` waits forever.
    pub fn open_with_timeout(timeout: Option<Duration>) -> Result<UsbTransport> {
        let started = Instant::now();
        let mut announced = false;
        loop {
            match Self::open_any() {
                Ok(transport) => return Ok(transport),
                Err(Error::NoDevice) => {
                    if !announced {
                        log::info!("Please plug in the device...");
                        announced = true;
                    }
                    if timeout.is_some_and(|t| started.elapsed() >= t) {
                        return Err(Error::NoDevice);
                    }
                    sleep(SCAN_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for UsbTransport {
    fn version(&self) -> Version {
        self.version
    }

    fn control_in(&mut self, req: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        let handle = self.device_handle.as_ref().ok_or(Error::Disconnected)?;
        let n = handle.read_control(
            REQUEST_TYPE,
            req.request,
            req.value,
            req.index,
            buf,
            USB_TIMEOUT,
        )?;
        Ok(n)
    }

    fn close(&mut self) {
        self.device_handle = None;
    }

    fn reopen(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.device_handle = None;
        let reopened = Self::open_with_timeout(timeout)?;
        *self = reopened;
        Ok(())
    }
}
