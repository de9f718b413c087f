//! The CPU's view of memory and port I/O.
//!
//! Handlers never touch physical memory directly: every access goes through
//! [`CpuBus`], which takes *linear* addresses. The embedding decides what a
//! linear address means (identity over guest RAM for the flat test bus,
//! A20/MMIO-aware routing for the PC platform bus).

use crate::exceptions::Exception;

/// Maximum encoded length of one instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Linear-address memory + port I/O interface consumed by the engine.
///
/// Multi-byte accessors are little-endian. Implementations may fail any
/// access with an [`Exception`], which the execution loop routes into the
/// exception pipeline.
pub trait CpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Exception>;
    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Exception>;

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Exception> {
        Ok(u16::from(self.read_u8(vaddr)?)
            | (u16::from(self.read_u8(vaddr.wrapping_add(1))?) << 8))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Exception> {
        Ok(u32::from(self.read_u16(vaddr)?)
            | (u32::from(self.read_u16(vaddr.wrapping_add(2))?) << 16))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Exception> {
        Ok(u64::from(self.read_u32(vaddr)?)
            | (u64::from(self.read_u32(vaddr.wrapping_add(4))?) << 32))
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Exception> {
        self.write_u8(vaddr, val as u8)?;
        self.write_u8(vaddr.wrapping_add(1), (val >> 8) as u8)
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Exception> {
        self.write_u16(vaddr, val as u16)?;
        self.write_u16(vaddr.wrapping_add(2), (val >> 16) as u16)
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Exception> {
        self.write_u32(vaddr, val as u32)?;
        self.write_u32(vaddr.wrapping_add(4), (val >> 32) as u32)
    }

    /// Width-parameterised read: `width` is 1, 2, 4 or 8 bytes.
    fn read_wide(&mut self, vaddr: u64, width: u32) -> Result<u64, Exception> {
        match width {
            1 => Ok(self.read_u8(vaddr)? as u64),
            2 => Ok(self.read_u16(vaddr)? as u64),
            4 => Ok(self.read_u32(vaddr)? as u64),
            8 => self.read_u64(vaddr),
            _ => Err(Exception::InvalidOpcode),
        }
    }

    fn write_wide(&mut self, vaddr: u64, width: u32, val: u64) -> Result<(), Exception> {
        match width {
            1 => self.write_u8(vaddr, val as u8),
            2 => self.write_u16(vaddr, val as u16),
            4 => self.write_u32(vaddr, val as u32),
            8 => self.write_u64(vaddr, val),
            _ => Err(Exception::InvalidOpcode),
        }
    }

    fn read_bytes(&mut self, vaddr: u64, out: &mut [u8]) -> Result<(), Exception> {
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_u8(vaddr.wrapping_add(i as u64))?;
        }
        Ok(())
    }

    fn write_bytes(&mut self, vaddr: u64, data: &[u8]) -> Result<(), Exception> {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(vaddr.wrapping_add(i as u64), *b)?;
        }
        Ok(())
    }

    /// Fetch up to `max_len` instruction bytes starting at `vaddr`.
    ///
    /// Always returns a full 15-byte buffer; bytes past `max_len` are
    /// unspecified. Used only by the decoder.
    fn fetch(&mut self, vaddr: u64, max_len: usize) -> Result<[u8; MAX_INSN_LEN], Exception> {
        let mut buf = [0u8; MAX_INSN_LEN];
        let len = max_len.min(MAX_INSN_LEN);
        for (i, b) in buf.iter_mut().take(len).enumerate() {
            *b = self.read_u8(vaddr.wrapping_add(i as u64))?;
        }
        Ok(buf)
    }

    /// Port input; `size` is 1, 2 or 4 bytes.
    fn io_read(&mut self, port: u16, size: u32) -> Result<u64, Exception>;

    /// Port output; `size` is 1, 2 or 4 bytes.
    fn io_write(&mut self, port: u16, size: u32, val: u64) -> Result<(), Exception>;
}

/// Flat identity-mapped RAM bus for tests: linear address == offset into one
/// byte vector, port I/O reads as zero.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn mem(&self) -> &[u8] {
        &self.mem
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Exception> {
        self.mem
            .get(vaddr as usize)
            .copied()
            .ok_or(Exception::MemoryFault)
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Exception> {
        *self
            .mem
            .get_mut(vaddr as usize)
            .ok_or(Exception::MemoryFault)? = val;
        Ok(())
    }

    fn io_read(&mut self, _port: u16, _size: u32) -> Result<u64, Exception> {
        Ok(0)
    }

    fn io_write(&mut self, _port: u16, _size: u32, _val: u64) -> Result<(), Exception> {
        Ok(())
    }
}
