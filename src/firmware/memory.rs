//! Non-volatile memory seam of the bootloader.

use crate::constants::ERASED_BYTE;

/// Page-oriented program memory with a single page-fill cache.
///
/// Mirrors the self-programming interface of the AVR: words are filled into
/// a temporary page buffer, then the whole page is committed at once.
pub trait NonVolatileMemory {
    fn page_size(&self) -> u16;
    /// Set every byte of the page holding `address` to the erased value.
    fn erase_page(&mut self, address: u16);
    /// Place one little-endian word into the page cache.
    fn fill_word(&mut self, address: u16, data: u16);
    /// Write the page cache to the page holding `address`.
    fn commit_page(&mut self, address: u16);
    /// Discard anything left in the page cache.
    fn clear_page_buffer(&mut self);
}

/// Serviced once per page during long blocking operations.
pub trait Watchdog {
    fn feed(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn feed(&mut self) {}
}

/// In-memory flash, for tests and the simulator.
///
/// Programming can only clear bits, so writing a page that was not erased
/// first yields the AND of old and new contents.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    contents: Vec<u8>,
    page_buffer: Vec<u8>,
    page_size: u16,
    page_erases: usize,
    page_writes: usize,
}

impl MemoryFlash {
    /// `size` covers the whole program memory, including the bootloader region.
    pub fn new(size: usize, page_size: u16) -> Self {
        MemoryFlash {
            contents: vec![ERASED_BYTE; size],
            page_buffer: vec![ERASED_BYTE; page_size as usize],
            page_size,
            page_erases: 0,
            page_writes: 0,
        }
    }

    /// Start from existing contents, as if programmed by an external programmer.
    pub fn with_contents(contents: Vec<u8>, page_size: u16) -> Self {
        MemoryFlash {
            contents,
            page_buffer: vec![ERASED_BYTE; page_size as usize],
            page_size,
            page_erases: 0,
            page_writes: 0,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn read_word(&self, address: u16) -> u16 {
        let a = address as usize;
        u16::from_le_bytes([self.contents[a], self.contents[a + 1]])
    }

    pub fn page_buffer(&self) -> &[u8] {
        &self.page_buffer
    }

    pub fn page_erases(&self) -> usize {
        self.page_erases
    }

    pub fn page_writes(&self) -> usize {
        self.page_writes
    }

    fn page_range(&self, address: u16) -> std::ops::Range<usize> {
        let start = (address - address % self.page_size) as usize;
        let end = (start + self.page_size as usize).min(self.contents.len());
        start..end
    }
}

impl NonVolatileMemory for MemoryFlash {
    fn page_size(&self) -> u16 {
        self.page_size
    }

    fn erase_page(&mut self, address: u16) {
        let range = self.page_range(address);
        self.contents[range].fill(ERASED_BYTE);
        self.page_erases += 1;
    }

    fn fill_word(&mut self, address: u16, data: u16) {
        let offset = (address % self.page_size) as usize & !1;
        self.page_buffer[offset..offset + 2].copy_from_slice(&data.to_le_bytes());
    }

    fn commit_page(&mut self, address: u16) {
        let range = self.page_range(address);
        for (cell, &buffered) in self.contents[range].iter_mut().zip(&self.page_buffer) {
            *cell &= buffered;
        }
        self.page_writes += 1;
        self.clear_page_buffer();
    }

    fn clear_page_buffer(&mut self) {
        self.page_buffer.fill(ERASED_BYTE);
    }
}
