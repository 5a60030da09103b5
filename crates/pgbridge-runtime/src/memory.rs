//! Guest memory addressing and binary marshaling.
//!
//! Guest addresses are 32-bit offsets into one instance's linear memory,
//! never host pointers. Every read and write goes through the
//! bounds-checked accessors here; a rejected access means the allocator or
//! a record contract is already broken and surfaces as an unrecoverable
//! [`Fault`]. All multi-byte integers are little-endian, matching the
//! guest's native layout.

use pgbridge_core::{Fault, Result};

use crate::instance::GuestInstance;

/// An offset into a specific guest instance's linear memory.
///
/// Meaningless without the owning instance; never compared with or
/// dereferenced as a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestAddr(u32);

impl GuestAddr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The address as a call-convention word.
    pub fn word(self) -> u64 {
        self.0 as u64
    }

    /// Saturates at the top of the 32-bit address space; a saturated
    /// address fails the accessors' bounds checks instead of wrapping
    /// back into live memory.
    pub fn offset(self, bytes: u32) -> Self {
        Self(self.0.saturating_add(bytes))
    }
}

/// A null-terminated buffer in guest memory; `len` does not count the
/// trailing NUL.
#[derive(Debug, Clone, Copy)]
pub struct GuestString {
    pub(crate) addr: GuestAddr,
    pub(crate) len: u32,
}

impl GuestString {
    pub fn addr(&self) -> GuestAddr {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl GuestInstance {
    pub fn read_bytes(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.memory
            .read(&self.store, addr.get() as usize, &mut buf)
            .map_err(|_| Fault::MemoryAccess {
                addr: addr.get(),
                what: "reading bytes",
            })?;
        Ok(buf)
    }

    pub fn write_bytes(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<()> {
        self.memory
            .write(&mut self.store, addr.get() as usize, bytes)
            .map_err(|_| Fault::MemoryAccess {
                addr: addr.get(),
                what: "writing bytes",
            })?;
        Ok(())
    }

    pub fn read_u32(&self, addr: GuestAddr) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.memory
            .read(&self.store, addr.get() as usize, &mut buf)
            .map_err(|_| Fault::MemoryAccess {
                addr: addr.get(),
                what: "reading u32 field",
            })?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: GuestAddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.memory
            .read(&self.store, addr.get() as usize, &mut buf)
            .map_err(|_| Fault::MemoryAccess {
                addr: addr.get(),
                what: "reading u64 field",
            })?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, addr: GuestAddr, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: GuestAddr, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Copy `bytes` into guest memory as a NUL-terminated C string.
    ///
    /// Embedded NUL bytes are written verbatim; guest-side consumers stop
    /// at the first NUL, which is C-string contract behavior, not a bug.
    /// The returned string is guest heap memory and must be released with
    /// [`GuestInstance::free`] on every exit path.
    pub fn write_c_string(&mut self, bytes: &[u8]) -> Result<GuestString> {
        let len = bytes.len() as u32;
        let addr = self.malloc(len + 1)?;
        self.write_bytes(addr, bytes)?;
        self.write_bytes(addr.offset(len), &[0])?;
        Ok(GuestString { addr, len })
    }

    /// Dereference the 4-byte little-endian pointer stored at `ptr_field`
    /// and copy out the NUL-terminated string it points at.
    ///
    /// A null pointer means "absent" by guest convention and yields an
    /// empty string.
    pub fn read_c_string_at(&self, ptr_field: GuestAddr) -> Result<String> {
        let ptr = self.read_u32(ptr_field)?;
        if ptr == 0 {
            return Ok(String::new());
        }
        let data = self.memory.data(&self.store);
        let tail = data.get(ptr as usize..).ok_or(Fault::MemoryAccess {
            addr: ptr,
            what: "dereferencing string pointer",
        })?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Fault::MemoryAccess {
                addr: ptr,
                what: "scanning for string terminator",
            })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}
