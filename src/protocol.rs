//! The control-request protocol spoken by the Micronucleus bootloader

use std::fmt;

use crate::constants::{requests, MAX_MAJOR_VERSION};

/// Bootloader protocol version, as reported in `bcdDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Version { major, minor }
    }

    /// `bcdDevice` encodes the version as `(major << 8) | minor`.
    pub const fn from_bcd(bcd: u16) -> Self {
        Version {
            major: (bcd >> 8) as u8,
            minor: (bcd & 0xff) as u8,
        }
    }

    pub const fn is_supported(self) -> bool {
        self.major <= MAX_MAJOR_VERSION
    }

    pub const fn capabilities(self) -> Capabilities {
        Capabilities::for_version(self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("expected MAJOR.MINOR, got {:?}", s))?;
        let major = major.parse().map_err(|e| format!("bad major {:?}: {}", major, e))?;
        let minor = minor.parse().map_err(|e| format!("bad minor {:?}: {}", minor, e))?;
        Ok(Version { major, minor })
    }
}

/// Where the device applies the relocated user reset vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRelocation {
    /// Rewritten while the word at `USER_RESET_ADDR` is filled.
    InFill,
    /// Patched into the page cache right before the page holding
    /// `USER_RESET_ADDR` is committed.
    AtCommit,
}

/// Version-dependent behavior shared by the host sequencer and the device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Host writes the relocated reset vector into the final page.
    pub host_patches_reset_vector: bool,
    pub device_relocation: DeviceRelocation,
}

impl Capabilities {
    pub const fn for_version(version: Version) -> Self {
        if version.major >= 2 {
            Capabilities {
                host_patches_reset_vector: true,
                device_relocation: DeviceRelocation::InFill,
            }
        } else {
            Capabilities {
                host_patches_reset_vector: false,
                device_relocation: DeviceRelocation::AtCommit,
            }
        }
    }
}

/// Micronucleus bootloader command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read the 4-byte device descriptor.
    Info,
    /// Begin a page at `address`. Older firmware also accepts the page
    /// contents in the data stage of this request.
    WritePage { address: u16 },
    /// Erase the whole user region.
    ///
    /// The device stops responding while erasing, some hosts see it drop off the bus.
    Erase,
    /// Append two words at the current page address.
    Fill { word0: u16, word1: u16 },
    /// Leave the bootloader and start the user program.
    ///
    /// Connection will be lost after the request completes.
    Exit,
}

/// The `(bRequest, wValue, wIndex)` triple of a vendor control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl Command {
    pub fn write_page(address: u16) -> Self {
        Command::WritePage { address }
    }

    pub fn fill(word0: u16, word1: u16) -> Self {
        Command::Fill { word0, word1 }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::WritePage { .. } => "write-page",
            Command::Erase => "erase",
            Command::Fill { .. } => "fill",
            Command::Exit => "exit",
        }
    }

    pub fn into_request(self) -> ControlRequest {
        let (request, value, index) = match self {
            Command::Info => (requests::INFO, 0, 0),
            Command::WritePage { address } => (requests::WRITE_PAGE, 0, address),
            Command::Erase => (requests::ERASE, 0, 0),
            Command::Fill { word0, word1 } => (requests::FILL, word0, word1),
            Command::Exit => (requests::EXIT, 0, 0),
        };
        ControlRequest {
            request,
            value,
            index,
        }
    }

    /// Decode a request on the device side. Unknown requests yield `None`.
    pub fn from_request(req: &ControlRequest) -> Option<Self> {
        match req.request {
            requests::INFO => Some(Command::Info),
            requests::WRITE_PAGE => Some(Command::WritePage { address: req.index }),
            requests::ERASE => Some(Command::Erase),
            requests::FILL => Some(Command::Fill {
                word0: req.value,
                word1: req.index,
            }),
            requests::EXIT => Some(Command::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rq={} value=0x{:04x} index=0x{:04x}",
            self.request, self.value, self.index
        )
    }
}

/// Rewrite the `rjmp` originally at the reset vector so it reaches the same
/// target from address `a`.
///
/// The offset field of `rjmp` is 12 bits and wraps around the flash, so the
/// arithmetic wraps at 16 bits and the carry into bit 12 is masked off.
pub const fn relocate_reset_vector(v: u16, a: u16) -> u16 {
    v.wrapping_add(0x1000).wrapping_sub(a / 2) & !0x1000
}

/// `rjmp` from address 0 to the bootloader entry.
pub const fn bootloader_jump(bootloader_address: u16) -> u16 {
    (bootloader_address / 2).wrapping_sub(1).wrapping_add(0xc000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocate_reset_vector() {
        // 16-bit offset example: the displacement is recomputed from 0x1ffe.
        assert_eq!(relocate_reset_vector(0x0000, 0x1ffe), 0x0001);
        // rjmp .+28 at 0x0000 (target word 0x000f) moved to 0x1ffe
        assert_eq!(relocate_reset_vector(0xc00e, 0x1ffe), 0xc00f);
        // ATtiny85 bootloader at 0x1800, user vector at 0x17fe
        assert_eq!(relocate_reset_vector(0xc00e, 0x17fe), 0xc40f);
        // wraparound near the top of the word range
        assert_eq!(relocate_reset_vector(0xffff, 0x0002), 0x0ffe);
        assert_eq!(
            relocate_reset_vector(0xc00e, 0x1ffe),
            relocate_reset_vector(0xc00e, 0x1ffe)
        );
    }

    #[test]
    fn test_bootloader_jump() {
        assert_eq!(bootloader_jump(0x1800), 0xcbff);
        assert_eq!(bootloader_jump(0x1a00), 0xccff);
    }

    #[test]
    fn test_command_encoding() {
        let req = Command::fill(0x0201, 0x0403).into_request();
        assert_eq!(
            req,
            ControlRequest {
                request: 3,
                value: 0x0201,
                index: 0x0403
            }
        );
        assert_eq!(Command::from_request(&req), Some(Command::fill(0x0201, 0x0403)));

        let req = Command::write_page(0x40).into_request();
        assert_eq!((req.request, req.value, req.index), (1, 0, 0x40));
        assert_eq!(Command::Info.into_request().request, 0);
        assert_eq!(Command::Erase.into_request().request, 2);
        assert_eq!(Command::Exit.into_request().request, 4);

        let unknown = ControlRequest {
            request: 9,
            value: 0,
            index: 0,
        };
        assert_eq!(Command::from_request(&unknown), None);
    }

    #[test]
    fn test_version() {
        let v = Version::from_bcd(0x0102);
        assert_eq!(v, Version::new(1, 2));
        // bcdDevice bytes are binary, not decimal digits
        let v = Version::from_bcd(0x0a00);
        assert_eq!(v.to_string(), "10.0");
        assert!(!v.is_supported());
        let v = Version::from_bcd(0x0102);
        assert_eq!(v.to_string(), "1.2");
        assert!(v.is_supported());
        assert!(!Version::new(3, 0).is_supported());
        assert_eq!("2.1".parse::<Version>(), Ok(Version::new(2, 1)));
        assert!("2".parse::<Version>().is_err());
    }

    #[test]
    fn test_capabilities() {
        let old = Version::new(1, 11).capabilities();
        assert!(!old.host_patches_reset_vector);
        assert_eq!(old.device_relocation, DeviceRelocation::AtCommit);

        let new = Version::new(2, 0).capabilities();
        assert!(new.host_patches_reset_vector);
        assert_eq!(new.device_relocation, DeviceRelocation::InFill);
    }
}
