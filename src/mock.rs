//! A simulated AT45DB021 behind `embedded-hal` traits.
//!
//! The chip records every chip-select frame, answers status/ID/read
//! commands byte by byte and applies mutating commands when chip-select is
//! released. Programming ANDs into the array like real NOR cells do.

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use std::cell::{RefCell, RefMut};
use std::rc::Rc;

const BINARY_PAGE: usize = 256;
const DATAFLASH_PAGE: usize = 264;
const PAGES: usize = 1024;
const PAGES_PER_BLOCK: usize = 8;

#[derive(Debug)]
pub struct MockError;

#[derive(Debug)]
pub struct Chip {
    pub id: [u8; 4],
    pub binary: bool,
    pub memory: Vec<u8>,
    pub buffer: Vec<u8>,
    /// Software sector protection, on after power-up.
    pub protected: bool,
    /// Whether the `\WP` pin is wired, and its level.
    pub wp_wired: bool,
    pub wp_high: bool,
    /// Busy status reads reported after every mutating command.
    pub busy_polls: u32,
    busy_remaining: u32,
    pub stuck_busy: bool,
    pub erase_program_error: bool,
    /// Older parts clock out one status byte and repeat it.
    pub single_byte_status: bool,
    /// Density code reported in status bits 13..10.
    pub status_density: u8,
    /// Defer page size changes until [`Chip::power_cycle`].
    pub deferred_page_size: bool,
    pending_binary: Option<bool>,
    compare_mismatch: bool,
    /// Bus transfers fail once this many frames have completed.
    pub fail_after_frames: Option<usize>,
    pub frames: Vec<Vec<u8>>,
    frame: Vec<u8>,
    status_low: u8,
    pub selected: bool,
}

impl Chip {
    fn new() -> Self {
        Chip {
            id: [0x1F, 0x23, 0x00, 0x01],
            binary: false,
            memory: vec![0xFF; PAGES * DATAFLASH_PAGE],
            buffer: vec![0xFF; DATAFLASH_PAGE],
            protected: true,
            wp_wired: false,
            wp_high: false,
            busy_polls: 0,
            busy_remaining: 0,
            stuck_busy: false,
            erase_program_error: false,
            single_byte_status: false,
            status_density: 0b0101,
            deferred_page_size: false,
            pending_binary: None,
            compare_mismatch: false,
            fail_after_frames: None,
            frames: Vec::new(),
            frame: Vec::new(),
            status_low: 0,
            selected: false,
        }
    }

    pub fn page_size(&self) -> usize {
        if self.binary {
            BINARY_PAGE
        } else {
            DATAFLASH_PAGE
        }
    }

    fn page_bits(&self) -> u32 {
        if self.binary {
            8
        } else {
            9
        }
    }

    pub fn page(&self, page: usize) -> &[u8] {
        let size = self.page_size();
        &self.memory[page * size..(page + 1) * size]
    }

    pub fn page_mut(&mut self, page: usize) -> &mut [u8] {
        let size = self.page_size();
        &mut self.memory[page * size..(page + 1) * size]
    }

    /// Number of recorded frames starting with `prefix`.
    pub fn count_frames(&self, prefix: &[u8]) -> usize {
        self.frames.iter().filter(|f| f.starts_with(prefix)).count()
    }

    fn status(&mut self) -> u16 {
        let busy = self.stuck_busy || self.busy_remaining > 0;
        self.busy_remaining = self.busy_remaining.saturating_sub(1);

        let mut status = 0u16;
        if !busy {
            status |= 0x8080;
        }
        if self.compare_mismatch {
            status |= 0x4000;
        }
        status |= u16::from(self.status_density & 0x0F) << 10;
        if self.protected {
            status |= 0x0200;
        }
        if self.binary {
            status |= 0x0100;
        }
        if self.single_byte_status {
            let high = status & 0xFF00;
            return high | (high >> 8);
        }
        if self.erase_program_error {
            status |= 0x0020;
        }
        status
    }

    fn frame_address(&self) -> (usize, usize) {
        let addr = (usize::from(self.frame[1]) << 16)
            | (usize::from(self.frame[2]) << 8)
            | usize::from(self.frame[3]);
        let bits = self.page_bits();
        (addr >> bits, addr & ((1 << bits) - 1))
    }

    fn clock(&mut self, mosi: u8) -> u8 {
        assert!(self.selected, "bus traffic without chip select");
        self.frame.push(mosi);
        let index = self.frame.len() - 1;
        if index == 0 {
            return 0xFF;
        }

        match self.frame[0] {
            0xD7 if index == 1 => {
                let status = self.status();
                self.status_low = status as u8;
                (status >> 8) as u8
            }
            0xD7 => self.status_low,
            0x9F => self.id.get(index - 1).copied().unwrap_or(0),
            0x03 if index >= 4 => {
                let (page, offset) = self.frame_address();
                let linear = page * self.page_size() + offset + (index - 4);
                self.memory[linear % self.memory.len()]
            }
            _ => 0xFF,
        }
    }

    fn protected_now(&self) -> bool {
        self.protected || (self.wp_wired && !self.wp_high)
    }

    fn start_busy(&mut self) {
        self.busy_remaining = self.busy_polls;
    }

    fn erase_pages(&mut self, first: usize, count: usize) {
        if self.protected_now() {
            return;
        }
        for page in first..first + count {
            for byte in self.page_mut(page) {
                *byte = 0xFF;
            }
        }
    }

    fn load_buffer(&mut self, offset: usize, data: &[u8]) {
        let size = self.page_size();
        for (i, &byte) in data.iter().enumerate() {
            self.buffer[(offset + i) % size] = byte;
        }
    }

    fn program_from_buffer(&mut self, page: usize) {
        if self.protected_now() {
            return;
        }
        let size = self.page_size();
        let buffer = self.buffer[..size].to_vec();
        for (cell, byte) in self.page_mut(page).iter_mut().zip(buffer) {
            *cell &= byte;
        }
    }

    fn relayout(&mut self, binary: bool) {
        self.binary = binary;
        let size = self.page_size();
        self.memory = vec![0xFF; PAGES * size];
    }

    fn configure_page_size(&mut self, binary: bool) {
        if self.deferred_page_size {
            self.pending_binary = Some(binary);
        } else {
            self.relayout(binary);
        }
        self.start_busy();
    }

    /// Applies a deferred page size change.
    pub fn power_cycle(&mut self) {
        if let Some(binary) = self.pending_binary.take() {
            self.relayout(binary);
        }
        self.protected = true;
    }

    fn end_frame(&mut self) {
        if self.frame.is_empty() {
            return;
        }
        let frame = self.frame.clone();

        match frame.as_slice() {
            [0x3D, 0x2A, 0x7F, 0x9A] => self.protected = false,
            [0x3D, 0x2A, 0x7F, 0xA9] => self.protected = true,
            [0x3D, 0x2A, 0x80, 0xA6] => self.configure_page_size(true),
            [0x3D, 0x2A, 0x80, 0xA7] => self.configure_page_size(false),
            [0xC7, 0x94, 0x80, 0x9A] => {
                self.erase_pages(0, PAGES);
                self.start_busy();
            }
            [0x84, _, _, _, data @ ..] => {
                let (_, offset) = self.frame_address();
                self.load_buffer(offset, data);
            }
            [0x88, _, _, _] => {
                let (page, _) = self.frame_address();
                self.program_from_buffer(page);
                self.start_busy();
            }
            [0x82, _, _, _, data @ ..] => {
                let (page, offset) = self.frame_address();
                self.load_buffer(offset, data);
                self.erase_pages(page, 1);
                self.program_from_buffer(page);
                self.start_busy();
            }
            [0x81, _, _, _] => {
                let (page, _) = self.frame_address();
                self.erase_pages(page, 1);
                self.start_busy();
            }
            [0x50, _, _, _] => {
                let (page, _) = self.frame_address();
                let first = page - page % PAGES_PER_BLOCK;
                self.erase_pages(first, PAGES_PER_BLOCK);
                self.start_busy();
            }
            [0x60, _, _, _] => {
                let (page, _) = self.frame_address();
                let size = self.page_size();
                self.compare_mismatch = self.page(page) != &self.buffer[..size];
                self.start_busy();
            }
            _ => {}
        }

        self.frame.clear();
        self.frames.push(frame);
    }

    fn check_failure(&self) -> Result<(), MockError> {
        match self.fail_after_frames {
            Some(limit) if self.frames.len() >= limit => Err(MockError),
            _ => Ok(()),
        }
    }
}

/// Shared handle to a simulated chip.
#[derive(Debug, Clone)]
pub struct MockBus(Rc<RefCell<Chip>>);

impl MockBus {
    pub fn at45db021() -> Self {
        MockBus(Rc::new(RefCell::new(Chip::new())))
    }

    pub fn chip(&self) -> RefMut<'_, Chip> {
        self.0.borrow_mut()
    }

    pub fn spi(&self) -> MockSpi {
        MockSpi(self.clone())
    }

    pub fn cs(&self) -> MockPin {
        MockPin {
            bus: self.clone(),
            kind: PinKind::ChipSelect,
        }
    }

    pub fn wp(&self) -> MockPin {
        self.chip().wp_wired = true;
        MockPin {
            bus: self.clone(),
            kind: PinKind::WriteProtect,
        }
    }
}

#[derive(Debug)]
pub struct MockSpi(MockBus);

impl Transfer<u8> for MockSpi {
    type Error = MockError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], MockError> {
        let mut chip = self.0.chip();
        chip.check_failure()?;
        for word in words.iter_mut() {
            *word = chip.clock(*word);
        }
        Ok(words)
    }
}

impl Write<u8> for MockSpi {
    type Error = MockError;

    fn write(&mut self, words: &[u8]) -> Result<(), MockError> {
        let mut chip = self.0.chip();
        chip.check_failure()?;
        for &word in words {
            chip.clock(word);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum PinKind {
    ChipSelect,
    WriteProtect,
}

#[derive(Debug)]
pub struct MockPin {
    bus: MockBus,
    kind: PinKind,
}

impl OutputPin for MockPin {
    type Error = MockError;

    fn set_low(&mut self) -> Result<(), MockError> {
        let mut chip = self.bus.chip();
        match self.kind {
            PinKind::ChipSelect => {
                chip.frame.clear();
                chip.selected = true;
            }
            PinKind::WriteProtect => chip.wp_high = false,
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), MockError> {
        let mut chip = self.bus.chip();
        match self.kind {
            PinKind::ChipSelect => {
                chip.end_frame();
                chip.selected = false;
            }
            PinKind::WriteProtect => chip.wp_high = true,
        }
        Ok(())
    }
}
