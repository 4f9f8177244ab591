//! Flash programming primitives used by the bootloader state machine.

use super::memory::{NonVolatileMemory, Watchdog};

pub struct FlashProgrammer<M, W> {
    memory: M,
    watchdog: W,
    /// First byte of the bootloader region, page aligned.
    bootloader_address: u16,
}

impl<M: NonVolatileMemory, W: Watchdog> FlashProgrammer<M, W> {
    pub fn new(memory: M, watchdog: W, bootloader_address: u16) -> Self {
        FlashProgrammer {
            memory,
            watchdog,
            bootloader_address,
        }
    }

    pub fn page_size(&self) -> u16 {
        self.memory.page_size()
    }

    pub fn fill_word(&mut self, address: u16, data: u16) {
        self.memory.fill_word(address, data);
    }

    /// Blocks for the physical write time on real hardware.
    pub fn commit_page(&mut self, address: u16) {
        let page = address - address % self.page_size();
        log::trace!("commit page 0x{:04x}", page);
        self.memory.commit_page(page);
    }

    pub fn clear_page_buffer(&mut self) {
        self.memory.clear_page_buffer();
    }

    /// Erase from the top of the user region down to address 0.
    pub fn erase_all(&mut self) {
        let page_size = self.page_size();
        let mut address = self.bootloader_address;
        while address != 0 {
            address -= page_size;
            self.memory.erase_page(address);
            self.watchdog.feed();
        }
    }

    /// Info reply: `[flash_size_hi, flash_size_lo, page_size, write_sleep_ms]`.
    pub fn info_reply(&self, write_sleep_ms: u8) -> [u8; 4] {
        let [hi, lo] = self.bootloader_address.to_be_bytes();
        [hi, lo, self.page_size() as u8, write_sleep_ms]
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn into_memory(self) -> M {
        self.memory
    }
}
