//! Guest memory slots and their host backing.

use std::fmt;
use std::ptr::{self, NonNull};

use nix::errno::Errno;

use crate::error::{KvmError, Result};
use crate::kvm::MemorySlotFlags;

/// Anonymous host mapping backing one guest memory slot.
///
/// The mapping never moves and is only unmapped on drop, so its address can
/// be handed to KVM for as long as the owner keeps it alive.
pub struct GuestMapping {
    ptr: NonNull<u8>,
    size: usize,
}

// Safety: the mapping is plain anonymous memory owned by this value; access
// goes through bounds-checked copies.
unsafe impl Send for GuestMapping {}
unsafe impl Sync for GuestMapping {}

impl GuestMapping {
    /// Maps `size` bytes of zeroed anonymous memory.
    pub fn new(size: u64) -> Result<Self> {
        let len = match usize::try_from(size) {
            Ok(len) if len > 0 => len,
            _ => return Err(KvmError::InvalidMemorySize(size)),
        };

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(KvmError::Allocation(Errno::last()));
        }

        let ptr = NonNull::new(addr.cast::<u8>()).ok_or(KvmError::Allocation(Errno::ENOMEM))?;

        Ok(Self { ptr, size: len })
    }

    /// Host virtual address of the mapping.
    pub fn host_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false: zero-length mappings are refused by [`GuestMapping::new`].
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check_range(&self, offset: u64, len: usize) -> Option<usize> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.size).then_some(start)
    }

    /// Copies bytes out of the mapping starting at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len()).ok_or(KvmError::OutOfBounds {
            addr: offset,
            len: buf.len(),
        })?;

        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies bytes into the mapping starting at `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len()).ok_or(KvmError::OutOfBounds {
            addr: offset,
            len: buf.len(),
        })?;

        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.as_ptr().add(start), buf.len());
        }
        Ok(())
    }
}

impl fmt::Debug for GuestMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMapping")
            .field("host_addr", &format_args!("{:#x}", self.host_addr()))
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for GuestMapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) };
        if ret != 0 {
            tracing::warn!(
                "Failed to unmap guest memory at {:#x}: {}",
                self.host_addr(),
                Errno::last()
            );
        }
    }
}

/// A guest physical memory slot registered with KVM.
///
/// The slot owns its host backing; `userspace_addr` always equals the
/// backing's host address.
#[derive(Debug)]
pub struct MemorySlot {
    pub(crate) slot: u32,
    pub(crate) flags: MemorySlotFlags,
    pub(crate) guest_phys_addr: u64,
    pub(crate) memory_size: u64,
    pub(crate) userspace_addr: u64,
    pub(crate) mapping: GuestMapping,
}

impl MemorySlot {
    /// Slot index.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Flags the slot was registered with.
    pub fn flags(&self) -> MemorySlotFlags {
        self.flags
    }

    /// Guest physical base address.
    pub fn guest_phys_addr(&self) -> u64 {
        self.guest_phys_addr
    }

    /// Size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Host virtual address of the backing memory.
    pub fn userspace_addr(&self) -> u64 {
        self.userspace_addr
    }

    /// Guest physical address one past the end of the slot.
    pub fn guest_end(&self) -> u64 {
        self.guest_phys_addr + self.memory_size
    }

    /// Checks if the slot contains the given guest physical address.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_phys_addr && addr < self.guest_end()
    }

    /// Reads from the slot at `offset` bytes from its base.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mapping.read(offset, buf).map_err(|e| self.rebase(e))
    }

    /// Writes to the slot at `offset` bytes from its base.
    ///
    /// Host writes to read-only slots are refused.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.flags.contains(MemorySlotFlags::READONLY) {
            return Err(KvmError::ReadOnlySlot(self.slot));
        }
        self.mapping.write(offset, buf).map_err(|e| self.rebase(e))
    }

    // Report out-of-bounds accesses with guest physical addresses.
    fn rebase(&self, err: KvmError) -> KvmError {
        match err {
            KvmError::OutOfBounds { addr, len } => KvmError::OutOfBounds {
                addr: self.guest_phys_addr.saturating_add(addr),
                len,
            },
            other => other,
        }
    }
}
