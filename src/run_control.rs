#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use super::error::HardwareError;

const REGISTER_BYTES: usize = 4;

/// # RunControl
/// The run control register bank of the front-end board. Registers are addressed by index and hold
/// 32-bit values.
pub trait RunControl {
    fn write(&mut self, address: u16, value: u32) -> Result<(), HardwareError>;
    fn read(&mut self, address: u16) -> Result<u32, HardwareError>;
}

/// # MmapRunControl
/// Run control bank exposed by the FPGA as a memory window (e.g. through /dev/mem or a uio device).
/// Register n is the 32-bit word at byte offset 4n from the start of the window.
#[derive(Debug)]
pub struct MmapRunControl {
    map: MmapMut,
    registers: usize,
}

impl MmapRunControl {
    pub fn open(device: &Path, base: u64, span: usize) -> Result<Self, HardwareError> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        // SAFETY: the mapping is owned by this struct and the window is only accessed with volatile
        // word reads/writes that are bounds checked against span.
        let map = unsafe { MmapOptions::new().offset(base).len(span).map_mut(&file)? };
        log::info!("Run control mapped from {} at {:#x} ({} registers)", device.display(), base, span / REGISTER_BYTES);
        Ok(Self { map, registers: span / REGISTER_BYTES })
    }

    fn offset(&self, address: u16) -> Result<usize, HardwareError> {
        if (address as usize) < self.registers {
            Ok(address as usize * REGISTER_BYTES)
        } else {
            Err(HardwareError::RegisterOutOfRange(address))
        }
    }
}

impl RunControl for MmapRunControl {
    fn write(&mut self, address: u16, value: u32) -> Result<(), HardwareError> {
        let offset = self.offset(address)?;
        // SAFETY: offset + 4 <= span, the window is page aligned so the word is aligned
        unsafe {
            let word = self.map.as_mut_ptr().add(offset) as *mut u32;
            std::ptr::write_volatile(word, value);
        }
        log::debug!("RC write {} <- {}", address, value);
        Ok(())
    }

    fn read(&mut self, address: u16) -> Result<u32, HardwareError> {
        let offset = self.offset(address)?;
        // SAFETY: see write
        let value = unsafe {
            let word = self.map.as_ptr().add(offset) as *const u32;
            std::ptr::read_volatile(word)
        };
        Ok(value)
    }
}
