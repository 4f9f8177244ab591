//! Device-resident side of the protocol.
//!
//! A hosted model of the bootloader firmware: the command state machine that
//! runs once per control transfer, on top of a [`FlashProgrammer`] driving a
//! [`NonVolatileMemory`]. Real hardware plugs in its own memory and watchdog,
//! tests and the simulator use [`MemoryFlash`].

use crate::constants::{DEFAULT_WRITE_SLEEP_MS, RESET_VECTOR_ADDR};
use crate::error::{Error, Result};
use crate::protocol::{
    bootloader_jump, relocate_reset_vector, Capabilities, Command, ControlRequest,
    DeviceRelocation, Version,
};

pub use self::memory::{MemoryFlash, NonVolatileMemory, NullWatchdog, Watchdog};
pub use self::programmer::FlashProgrammer;

mod memory;
mod programmer;

/// Build-time parameters of a bootloader image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderConfig {
    pub version: Version,
    /// Start of the bootloader region. Reported to the host as the flash size.
    pub bootloader_address: u16,
    pub page_size: u8,
    pub write_sleep_ms: u8,
}

impl Default for BootloaderConfig {
    /// ATtiny85 layout
    fn default() -> Self {
        BootloaderConfig {
            version: Version::new(2, 0),
            bootloader_address: 0x1800,
            page_size: 64,
            write_sleep_ms: DEFAULT_WRITE_SLEEP_MS,
        }
    }
}

impl BootloaderConfig {
    pub fn new(
        version: Version,
        bootloader_address: u16,
        page_size: u8,
        write_sleep_ms: u8,
    ) -> Result<Self> {
        let config = BootloaderConfig {
            version,
            bootloader_address,
            page_size,
            write_sleep_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// The bootloader must start on a page boundary above at least one
    /// user page, and pages must hold whole fill requests.
    pub fn validate(&self) -> Result<()> {
        let page_size = self.page_size as u16;
        if page_size == 0
            || page_size % 4 != 0
            || self.bootloader_address < page_size
            || self.bootloader_address % page_size != 0
        {
            return Err(Error::InvalidGeometry {
                flash_size: self.bootloader_address,
                page_size: self.page_size,
            });
        }
        Ok(())
    }

    /// Where the application's relocated reset `rjmp` lives.
    pub const fn user_reset_addr(&self) -> u16 {
        self.bootloader_address.saturating_sub(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// A page is open and accepting words.
    Filling,
    /// The last word of the page arrived, commit runs once the transfer completes.
    Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub current_address: u16,
    pub phase: Phase,
    /// Last command that touched the session. Info leaves it alone.
    pub previous_command: Option<Command>,
    /// The previous command closed a page and it was committed.
    pub write_completed: bool,
}

/// Answer to one control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Zero-length acknowledgement
    Ack,
    Data(Vec<u8>),
    /// Request refused
    Stall,
}

impl Reply {
    pub fn data(&self) -> &[u8] {
        match self {
            Reply::Data(data) => data,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit was requested. `entry` is the word address of the relocated reset vector.
    StartApplication { entry: u16 },
    /// The endpoint stopped delivering requests.
    EndpointClosed,
}

/// Source of control transfers, one at a time.
pub trait ControlEndpoint {
    /// Block until the next request has fully arrived, with its data stage.
    fn next_request(&mut self) -> Option<(ControlRequest, Vec<u8>)>;
    fn respond(&mut self, reply: Reply);
}

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    erase: bool,
    write: bool,
    run: bool,
}

pub struct Bootloader<M, W> {
    programmer: FlashProgrammer<M, W>,
    config: BootloaderConfig,
    capabilities: Capabilities,
    state: SessionState,
    /// The application's original reset vector, captured when address 0 is filled.
    user_reset: Option<u16>,
    pending: Pending,
}

impl<M: NonVolatileMemory, W: Watchdog> Bootloader<M, W> {
    pub fn new(config: BootloaderConfig, memory: M, watchdog: W) -> Result<Self> {
        config.validate()?;
        if memory.page_size() != config.page_size as u16 {
            return Err(Error::InvalidGeometry {
                flash_size: config.bootloader_address,
                page_size: config.page_size,
            });
        }
        let mut programmer = FlashProgrammer::new(memory, watchdog, config.bootloader_address);
        // user code may have jumped here with the page buffer half filled
        programmer.clear_page_buffer();
        Ok(Bootloader {
            programmer,
            config,
            capabilities: config.version.capabilities(),
            state: SessionState::default(),
            user_reset: None,
            pending: Pending::default(),
        })
    }

    pub fn config(&self) -> &BootloaderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_reset(&self) -> Option<u16> {
        self.user_reset
    }

    pub fn memory(&self) -> &M {
        self.programmer.memory()
    }

    pub fn into_memory(self) -> M {
        self.programmer.into_memory()
    }

    /// Decode and act on one control transfer.
    ///
    /// Erase, page commit and exit are only flagged here; they run in
    /// [`complete_transaction`](Self::complete_transaction).
    pub fn handle_control_request(&mut self, req: &ControlRequest, data: &[u8]) -> Reply {
        let Some(command) = Command::from_request(req) else {
            log::warn!("unknown request {}", req);
            return Reply::Stall;
        };
        log::trace!("{:?} state={:?}", command, self.state);

        let reply = match command {
            Command::Info => {
                return Reply::Data(
                    self.programmer
                        .info_reply(self.config.write_sleep_ms)
                        .to_vec(),
                );
            }
            Command::WritePage { address } => {
                if self.begin_page(address, self.state.write_completed) {
                    let words: Vec<u16> = data
                        .chunks_exact(2)
                        .map(|w| u16::from_le_bytes([w[0], w[1]]))
                        .collect();
                    self.fill_words(&words);
                    Reply::Ack
                } else {
                    Reply::Stall
                }
            }
            Command::Fill { word0, word1 } => {
                if self.state.phase == Phase::Filling {
                    self.fill_words(&[word0, word1]);
                } else {
                    log::debug!("fill with no open page ignored");
                }
                Reply::Ack
            }
            Command::Erase => {
                self.discard_partial_page();
                self.pending.erase = true;
                Reply::Ack
            }
            Command::Exit => {
                self.discard_partial_page();
                self.pending.run = true;
                Reply::Ack
            }
        };
        // set again by the commit, if this request closed a page
        self.state.write_completed = false;
        self.state.previous_command = Some(command);
        reply
    }

    /// Run the work deferred until the transfer is fully acknowledged.
    pub fn complete_transaction(&mut self) -> LoopControl {
        let pending = std::mem::take(&mut self.pending);
        if pending.erase {
            self.programmer.erase_all();
            self.state = SessionState::default();
        }
        if pending.write {
            self.commit();
        }
        if pending.run {
            LoopControl::Exit
        } else {
            LoopControl::Continue
        }
    }

    /// Serve requests until the host asks to start the application.
    pub fn run<E: ControlEndpoint>(&mut self, endpoint: &mut E) -> RunOutcome {
        while let Some((req, data)) = endpoint.next_request() {
            let reply = self.handle_control_request(&req, &data);
            endpoint.respond(reply);
            if self.complete_transaction() == LoopControl::Exit {
                return RunOutcome::StartApplication {
                    entry: self.config.user_reset_addr() / 2,
                };
            }
        }
        RunOutcome::EndpointClosed
    }

    /// Open the page holding `address`, or page 0 unless the previous
    /// command completed a page write.
    fn begin_page(&mut self, address: u16, write_completed: bool) -> bool {
        let page_size = self.config.page_size as u16;
        let mut start = address - address % page_size;
        if self.state.phase == Phase::Filling {
            // never resume a page from an interrupted session
            log::warn!(
                "write-page 0x{:04x} while page at 0x{:04x} is open, restarting at 0",
                address,
                self.state.current_address
            );
            start = 0;
        } else if !write_completed && start != 0 {
            log::debug!(
                "write-page 0x{:04x} after {:?}, restarting at 0",
                address,
                self.state.previous_command
            );
            start = 0;
        }
        self.programmer.clear_page_buffer();
        if start >= self.config.bootloader_address {
            log::warn!("write-page 0x{:04x} targets the bootloader region", address);
            self.state.current_address = 0;
            self.state.phase = Phase::Idle;
            return false;
        }
        self.state.current_address = start;
        self.state.phase = Phase::Filling;
        true
    }

    fn fill_words(&mut self, words: &[u16]) {
        let page_size = self.config.page_size as u16;
        let user_reset_addr = self.config.user_reset_addr();

        for &word in words {
            let address = self.state.current_address;
            if self.state.phase != Phase::Filling || address >= self.config.bootloader_address {
                break;
            }

            let mut data = word;
            if address == RESET_VECTOR_ADDR {
                self.user_reset = Some(word);
                data = bootloader_jump(self.config.bootloader_address);
            }
            if address == user_reset_addr
                && self.capabilities.device_relocation == DeviceRelocation::InFill
            {
                if let Some(vector) = self.user_reset {
                    data = relocate_reset_vector(vector, address);
                }
            }

            self.programmer.fill_word(address, data);
            self.state.current_address = address + 2;
            if self.state.current_address % page_size == 0 {
                self.state.phase = Phase::Filled;
                self.pending.write = true;
            }
        }
    }

    fn commit(&mut self) {
        let end = self.state.current_address;
        let start = end - self.config.page_size as u16;
        let user_reset_addr = self.config.user_reset_addr();
        if self.capabilities.device_relocation == DeviceRelocation::AtCommit
            && (start..end).contains(&user_reset_addr)
        {
            if let Some(vector) = self.user_reset {
                self.programmer
                    .fill_word(user_reset_addr, relocate_reset_vector(vector, user_reset_addr));
            }
        }
        self.programmer.commit_page(end - 2);
        self.state.phase = Phase::Idle;
        self.state.write_completed = true;
    }

    fn discard_partial_page(&mut self) {
        if self.state.phase == Phase::Filling {
            log::warn!(
                "discarding partial page at 0x{:04x}",
                self.state.current_address
            );
            self.programmer.clear_page_buffer();
            self.state.current_address = 0;
            self.state.phase = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT: u16 = 0x0200;

    fn bootloader(version: Version) -> Bootloader<MemoryFlash, NullWatchdog> {
        let config = BootloaderConfig::new(version, BOOT, 64, 8).unwrap();
        Bootloader::new(config, MemoryFlash::new(0x400, 64), NullWatchdog).unwrap()
    }

    fn send(bl: &mut Bootloader<MemoryFlash, NullWatchdog>, cmd: Command) -> Reply {
        let reply = bl.handle_control_request(&cmd.into_request(), &[]);
        bl.complete_transaction();
        reply
    }

    fn write_page(bl: &mut Bootloader<MemoryFlash, NullWatchdog>, address: u16, page: &[u8]) {
        assert_eq!(send(bl, Command::write_page(address)), Reply::Ack);
        for chunk in page.chunks(4) {
            let w0 = u16::from_le_bytes([chunk[0], chunk[1]]);
            let w1 = u16::from_le_bytes([chunk[2], chunk[3]]);
            assert_eq!(send(bl, Command::fill(w0, w1)), Reply::Ack);
        }
    }

    #[test]
    fn test_config_validation() {
        let v = Version::new(2, 0);
        assert!(BootloaderConfig::new(v, 0x1800, 64, 8).is_ok());
        for (address, page_size) in [(0, 64), (1, 64), (0x1820, 64), (0x1800, 0), (0x1800, 62)] {
            assert!(
                matches!(
                    BootloaderConfig::new(v, address, page_size, 8),
                    Err(Error::InvalidGeometry { .. })
                ),
                "0x{:04x} {}",
                address,
                page_size
            );
        }

        let config = BootloaderConfig {
            bootloader_address: 1,
            ..Default::default()
        };
        assert!(Bootloader::new(config, MemoryFlash::new(0x400, 64), NullWatchdog).is_err());
        let config = BootloaderConfig::new(v, BOOT, 64, 8).unwrap();
        assert!(Bootloader::new(config, MemoryFlash::new(0x400, 128), NullWatchdog).is_err());
    }

    #[test]
    fn test_info() {
        let mut bl = bootloader(Version::new(2, 0));
        assert_eq!(send(&mut bl, Command::Info), Reply::Data(vec![0x02, 0x00, 64, 8]));
        assert_eq!(bl.state(), SessionState::default());
    }

    #[test]
    fn test_page_write_patches_reset_vector() {
        let mut bl = bootloader(Version::new(2, 0));
        let mut page = vec![0u8; 64];
        page[0..2].copy_from_slice(&0xc00eu16.to_le_bytes());
        page[2] = 0x11;
        write_page(&mut bl, 0, &page);

        assert_eq!(bl.state().phase, Phase::Idle);
        assert_eq!(bl.user_reset(), Some(0xc00e));
        let flash = bl.memory();
        assert_eq!(flash.read_word(0), bootloader_jump(BOOT));
        assert_eq!(flash.contents()[2], 0x11);
        assert_eq!(flash.page_writes(), 1);
    }

    #[test]
    fn test_relocation_in_fill() {
        let mut bl = bootloader(Version::new(2, 0));
        let mut page0 = vec![0xffu8; 64];
        page0[0..2].copy_from_slice(&0xc00eu16.to_le_bytes());
        write_page(&mut bl, 0, &page0);

        // host sends junk in the vector slot, device still writes the relocated jump
        let last = vec![0u8; 64];
        write_page(&mut bl, BOOT - 64, &last);
        let expected = relocate_reset_vector(0xc00e, BOOT - 2);
        assert_eq!(bl.memory().read_word(BOOT - 2), expected);
    }

    #[test]
    fn test_relocation_at_commit() {
        let mut bl = bootloader(Version::new(1, 11));
        let mut page0 = vec![0xffu8; 64];
        page0[0..2].copy_from_slice(&0xc00eu16.to_le_bytes());
        write_page(&mut bl, 0, &page0);

        let last = vec![0xffu8; 64];
        assert_eq!(send(&mut bl, Command::write_page(BOOT - 64)), Reply::Ack);
        for _ in 0..15 {
            send(&mut bl, Command::fill(0xffff, 0xffff));
        }
        // cache still holds the host word until commit
        bl.handle_control_request(&Command::fill(0xffff, 0xffff).into_request(), &[]);
        assert_eq!(bl.state().phase, Phase::Filled);
        assert_eq!(bl.memory().read_word(BOOT - 2), 0xffff);
        bl.complete_transaction();

        let expected = relocate_reset_vector(0xc00e, BOOT - 2);
        assert_eq!(bl.memory().read_word(BOOT - 2), expected);
        assert_eq!(&bl.memory().contents()[(BOOT - 64) as usize..(BOOT - 2) as usize], &last[..62]);
    }

    #[test]
    fn test_payload_write_page() {
        let mut bl = bootloader(Version::new(1, 6));
        let page: Vec<u8> = (0..64).collect();
        for address in [0, 0x40] {
            let reply = bl.handle_control_request(&Command::write_page(address).into_request(), &page);
            assert_eq!(reply, Reply::Ack);
            assert_eq!(bl.complete_transaction(), LoopControl::Continue);
            assert!(bl.state().write_completed);
        }
        assert_eq!(&bl.memory().contents()[2..0x40], &page[2..]);
        assert_eq!(&bl.memory().contents()[0x40..0x80], &page[..]);
    }

    #[test]
    fn test_address_rounded_to_page() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0x11; 64]);
        write_page(&mut bl, 0x4a, &[0x22; 64]);
        assert!(bl.memory().contents()[0x40..0x80].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_write_start_after_power_up_restarts_at_zero() {
        let mut bl = bootloader(Version::new(2, 0));
        assert_eq!(send(&mut bl, Command::write_page(0x80)), Reply::Ack);
        assert_eq!(bl.state().current_address, 0);
        assert_eq!(bl.state().phase, Phase::Filling);
        send(&mut bl, Command::fill(0x1111, 0x2222));
        assert_eq!(bl.state().current_address, 4);
        // address 0 still gets the bootloader jump
        assert_eq!(bl.user_reset(), Some(0x1111));
    }

    #[test]
    fn test_write_start_after_erase_restarts_at_zero() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        send(&mut bl, Command::Erase);
        assert_eq!(bl.state(), SessionState::default());

        send(&mut bl, Command::write_page(0x80));
        assert_eq!(bl.state().current_address, 0);
        send(&mut bl, Command::fill(0, 0));
        assert_eq!(bl.state().current_address, 4);
    }

    #[test]
    fn test_write_start_after_info() {
        // from power-up, info is not a completed write
        let mut bl = bootloader(Version::new(2, 0));
        send(&mut bl, Command::Info);
        send(&mut bl, Command::write_page(0x80));
        assert_eq!(bl.state().current_address, 0);

        // info between pages leaves the session alone
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        send(&mut bl, Command::Info);
        assert!(bl.state().write_completed);
        send(&mut bl, Command::write_page(0x80));
        assert_eq!(bl.state().current_address, 0x80);
    }

    #[test]
    fn test_write_start_after_ignored_fill_restarts_at_zero() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        assert!(bl.state().write_completed);
        send(&mut bl, Command::fill(0, 0));
        assert!(!bl.state().write_completed);

        send(&mut bl, Command::write_page(0x80));
        assert_eq!(bl.state().current_address, 0);
    }

    #[test]
    fn test_skipped_pages_keep_their_address() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0x11; 64]);
        write_page(&mut bl, BOOT - 64, &[0x22; 64]);
        let flash = bl.memory();
        assert!(flash.contents()[0x40..(BOOT - 64) as usize].iter().all(|&b| b == 0xff));
        assert!(flash.contents()[(BOOT - 64) as usize..(BOOT - 2) as usize]
            .iter()
            .all(|&b| b == 0x22));
        assert_eq!(flash.page_writes(), 2);
    }

    #[test]
    fn test_interrupted_page_restarts_at_zero() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        send(&mut bl, Command::write_page(0x80));
        send(&mut bl, Command::fill(0x1111, 0x1111));
        assert_eq!(bl.state().phase, Phase::Filling);
        assert_eq!(bl.state().current_address, 0x84);

        send(&mut bl, Command::write_page(0xc0));
        assert_eq!(bl.state().current_address, 0);
        assert_eq!(bl.state().phase, Phase::Filling);
        // the stale words never reach flash
        assert!(bl.memory().page_buffer().iter().all(|&b| b == 0xff));

        // after a completed page the requested address is honored
        for _ in 0..16 {
            send(&mut bl, Command::fill(0x3333, 0x3333));
        }
        send(&mut bl, Command::write_page(0xc0));
        assert_eq!(bl.state().current_address, 0xc0);
    }

    #[test]
    fn test_fill_without_page_ignored() {
        let mut bl = bootloader(Version::new(2, 0));
        assert_eq!(send(&mut bl, Command::fill(0, 0)), Reply::Ack);
        assert_eq!(bl.state().phase, Phase::Idle);
        assert_eq!(bl.state().current_address, 0);
        assert!(bl.memory().page_buffer().iter().all(|&b| b == 0xff));
        assert_eq!(bl.memory().page_writes(), 0);
    }

    #[test]
    fn test_bootloader_region_refused() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        assert_eq!(send(&mut bl, Command::write_page(BOOT)), Reply::Stall);
        assert_eq!(bl.state().phase, Phase::Idle);
        assert_eq!(send(&mut bl, Command::fill(0, 0)), Reply::Ack);
        assert_eq!(bl.memory().page_writes(), 1);
    }

    #[test]
    fn test_erase_mid_page_discards_it() {
        let mut bl = bootloader(Version::new(2, 0));
        write_page(&mut bl, 0, &[0u8; 64]);
        send(&mut bl, Command::write_page(0x80));
        send(&mut bl, Command::fill(0, 0));

        assert_eq!(send(&mut bl, Command::Erase), Reply::Ack);
        assert_eq!(bl.state(), SessionState::default());
        let flash = bl.memory();
        assert!(flash.contents()[..BOOT as usize].iter().all(|&b| b == 0xff));
        assert_eq!(flash.page_erases(), (BOOT / 64) as usize);
        assert_eq!(flash.page_writes(), 1);
    }

    #[test]
    fn test_exit_mid_page_discards_it() {
        let mut bl = bootloader(Version::new(2, 0));
        send(&mut bl, Command::write_page(0x40));
        send(&mut bl, Command::fill(0, 0));
        let reply = bl.handle_control_request(&Command::Exit.into_request(), &[]);
        assert_eq!(reply, Reply::Ack);
        assert_eq!(bl.complete_transaction(), LoopControl::Exit);
        assert_eq!(bl.memory().page_writes(), 0);
        assert!(bl.memory().page_buffer().iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_unknown_request_stalls() {
        let mut bl = bootloader(Version::new(2, 0));
        let req = ControlRequest {
            request: 0x42,
            value: 0,
            index: 0,
        };
        assert_eq!(bl.handle_control_request(&req, &[]), Reply::Stall);
        assert_eq!(bl.complete_transaction(), LoopControl::Continue);
    }

    struct Script {
        requests: std::collections::VecDeque<Command>,
        replies: Vec<Reply>,
    }

    impl ControlEndpoint for Script {
        fn next_request(&mut self) -> Option<(ControlRequest, Vec<u8>)> {
            self.requests
                .pop_front()
                .map(|cmd| (cmd.into_request(), Vec::new()))
        }

        fn respond(&mut self, reply: Reply) {
            self.replies.push(reply);
        }
    }

    #[test]
    fn test_run_until_exit() {
        let mut bl = bootloader(Version::new(2, 0));
        let mut script = Script {
            requests: [Command::Info, Command::Erase, Command::Exit, Command::Info]
                .into_iter()
                .collect(),
            replies: vec![],
        };
        let outcome = bl.run(&mut script);
        assert_eq!(outcome, RunOutcome::StartApplication { entry: (BOOT - 2) / 2 });
        assert_eq!(script.replies.len(), 3);
        assert_eq!(script.replies[0].data(), &[0x02, 0x00, 64, 8]);
        assert_eq!(script.requests.len(), 1);

        let mut empty = Script {
            requests: Default::default(),
            replies: vec![],
        };
        assert_eq!(bl.run(&mut empty), RunOutcome::EndpointClosed);
    }
}
