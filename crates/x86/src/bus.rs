//! Host collaborator interface
//!
//! The engine computes linear addresses (segment base + offset) and hands
//! them to the host. Paging, A20 and limit checks are the host's business.
//! I/O ports and descriptor lookup go through the same trait so a system
//! only has to implement one object.

use std::collections::HashMap;

use crate::operand::OperandSize;
use crate::protected::{selector, SegmentDescriptor};
use crate::registers::{SegmentRegister, TableRegister};

/// Memory, I/O and descriptor-table interface for the CPU
///
/// Systems using the engine must implement this trait to provide memory
/// access. Multi-byte values are little-endian.
pub trait Bus {
    /// Read `size` bytes at a linear address
    fn read_linear(&self, addr: u32, size: OperandSize) -> u32;

    /// Write the low `size` bytes of `value` at a linear address
    fn write_linear(&mut self, addr: u32, value: u32, size: OperandSize);

    /// Read from an I/O port (stub implementation - returns all ones)
    fn io_read(&mut self, _port: u16, size: OperandSize) -> u32 {
        size.mask()
    }

    /// Write to an I/O port (stub implementation - does nothing)
    fn io_write(&mut self, _port: u16, _value: u32, _size: OperandSize) {}

    /// Read the 8 raw bytes of a descriptor-table entry
    fn read_descriptor_bytes(&self, addr: u32) -> [u8; 8] {
        let low = self.read_linear(addr, OperandSize::Dword).to_le_bytes();
        let high = self
            .read_linear(addr.wrapping_add(4), OperandSize::Dword)
            .to_le_bytes();
        [
            low[0], low[1], low[2], low[3], high[0], high[1], high[2], high[3],
        ]
    }

    /// Resolve a selector to its descriptor
    ///
    /// The default walks the GDT or LDT through `read_linear`. Returns
    /// `None` for null GDT selectors and for entries past the table limit.
    fn resolve_selector(
        &self,
        sel: u16,
        gdtr: &TableRegister,
        ldtr: &SegmentRegister,
    ) -> Option<SegmentDescriptor> {
        let (base, limit) = if sel & selector::TI != 0 {
            (ldtr.cache.base, ldtr.cache.limit)
        } else {
            if selector::is_null(sel) {
                return None;
            }
            (gdtr.base, gdtr.limit as u32)
        };
        let offset = selector::table_offset(sel);
        if offset + 7 > limit {
            return None;
        }
        let bytes = self.read_descriptor_bytes(base.wrapping_add(offset));
        Some(SegmentDescriptor::from_bytes(&bytes))
    }
}

/// Flat little-endian RAM with port latches, for tests and benchmarks
#[derive(Debug, Clone)]
pub struct ArrayBus {
    data: Vec<u8>,
    /// Last value written to each port; reads return it
    ports: HashMap<u16, u32>,
    /// Every OUT in order, for assertions
    port_writes: Vec<(u16, u32, OperandSize)>,
}

impl ArrayBus {
    /// 1 MiB plus the HMA, enough for real-mode programs
    pub fn new() -> Self {
        Self::with_size(0x11_0000)
    }

    pub fn with_size(bytes: usize) -> Self {
        Self {
            data: vec![0; bytes],
            ports: HashMap::new(),
            port_writes: Vec::new(),
        }
    }

    /// Copy bytes to a linear address
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        let end = start + bytes.len();
        if end <= self.data.len() {
            self.data[start..end].copy_from_slice(bytes);
        }
    }

    /// Borrow a slice of memory
    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let start = (addr as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0xFF)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(cell) = self.data.get_mut(addr as usize) {
            *cell = value;
        }
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        self.read_linear(addr, OperandSize::Word) as u16
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) {
        self.write_linear(addr, value as u32, OperandSize::Word);
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.read_linear(addr, OperandSize::Dword)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_linear(addr, value, OperandSize::Dword);
    }

    /// Preset the value an IN from `port` returns
    pub fn set_port(&mut self, port: u16, value: u32) {
        self.ports.insert(port, value);
    }

    /// OUT writes recorded since the last `take_port_writes`
    pub fn port_writes(&self) -> &[(u16, u32, OperandSize)] {
        &self.port_writes
    }

    /// Hand back the recorded OUT writes and start a fresh log
    pub fn take_port_writes(&mut self) -> Vec<(u16, u32, OperandSize)> {
        std::mem::take(&mut self.port_writes)
    }
}

impl Default for ArrayBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for ArrayBus {
    fn read_linear(&self, addr: u32, size: OperandSize) -> u32 {
        (0..size.bytes()).fold(0, |acc, i| {
            acc | ((self.read_u8(addr.wrapping_add(i)) as u32) << (i * 8))
        })
    }

    fn write_linear(&mut self, addr: u32, value: u32, size: OperandSize) {
        for i in 0..size.bytes() {
            self.write_u8(addr.wrapping_add(i), (value >> (i * 8)) as u8);
        }
    }

    fn io_read(&mut self, port: u16, size: OperandSize) -> u32 {
        self.ports
            .get(&port)
            .map_or(size.mask(), |value| value & size.mask())
    }

    fn io_write(&mut self, port: u16, value: u32, size: OperandSize) {
        let value = value & size.mask();
        self.ports.insert(port, value);
        self.port_writes.push((port, value, size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protected::access_rights;

    #[test]
    fn test_little_endian_access() {
        let mut bus = ArrayBus::new();
        bus.write_linear(0x100, 0x1234_5678, OperandSize::Dword);
        assert_eq!(bus.read_u8(0x100), 0x78);
        assert_eq!(bus.read_u8(0x103), 0x12);
        assert_eq!(bus.read_linear(0x101, OperandSize::Word), 0x3456);
    }

    #[test]
    fn test_partial_write_keeps_neighbours() {
        let mut bus = ArrayBus::new();
        bus.write_u32(0x200, 0xFFFF_FFFF);
        bus.write_linear(0x200, 0xABCD, OperandSize::Byte);
        assert_eq!(bus.read_u32(0x200), 0xFFFF_FFCD);
    }

    #[test]
    fn test_out_of_range_reads_float_high() {
        let bus = ArrayBus::with_size(16);
        assert_eq!(bus.read_linear(15, OperandSize::Word), 0xFF00);
        assert_eq!(bus.read_u8(0x1000), 0xFF);
    }

    #[test]
    fn test_port_latches() {
        let mut bus = ArrayBus::new();
        assert_eq!(bus.io_read(0x60, OperandSize::Byte), 0xFF);
        bus.set_port(0x60, 0x1C);
        assert_eq!(bus.io_read(0x60, OperandSize::Byte), 0x1C);
        bus.io_write(0x80, 0x1_0042, OperandSize::Word);
        assert_eq!(bus.port_writes(), &[(0x80, 0x0042, OperandSize::Word)]);
    }

    #[test]
    fn test_take_port_writes_drains_log() {
        let mut bus = ArrayBus::new();
        bus.io_write(0x80, 0x11, OperandSize::Byte);
        bus.io_write(0x80, 0x22, OperandSize::Byte);

        let writes = bus.take_port_writes();
        assert_eq!(
            writes,
            vec![(0x80, 0x11, OperandSize::Byte), (0x80, 0x22, OperandSize::Byte)]
        );
        assert!(bus.port_writes().is_empty());

        // The latch keeps the last value and logging carries on
        assert_eq!(bus.io_read(0x80, OperandSize::Byte), 0x22);
        bus.io_write(0x81, 0x33, OperandSize::Byte);
        assert_eq!(bus.port_writes(), &[(0x81, 0x33, OperandSize::Byte)]);
    }

    #[test]
    fn test_resolve_selector_from_gdt() {
        let mut bus = ArrayBus::new();
        let gdtr = TableRegister {
            base: 0x1000,
            limit: 0x17,
        };
        // Entry 1: flat data segment
        bus.load(0x1008, &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00]);
        let ldtr = SegmentRegister::real_mode(0);

        let desc = bus.resolve_selector(0x0008, &gdtr, &ldtr).expect("descriptor");
        assert_eq!(desc.access, 0x92);
        assert!(desc.access & access_rights::PRESENT != 0);
        assert_eq!(desc.byte_limit(), 0xFFFF_FFFF);

        // Null selector and entries past the limit do not resolve
        assert!(bus.resolve_selector(0x0000, &gdtr, &ldtr).is_none());
        assert!(bus.resolve_selector(0x0018, &gdtr, &ldtr).is_none());
    }
}
