//! Error types for the KVM crate.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::kvm::IoctlRequest;

/// Result type alias for KVM operations.
pub type Result<T> = std::result::Result<T, KvmError>;

/// Errors that can occur while talking to KVM.
#[derive(Debug, Error)]
pub enum KvmError {
    /// The KVM device could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An ioctl failed in the kernel.
    #[error("ioctl {request:#x} failed: {errno}")]
    Syscall { request: IoctlRequest, errno: Errno },

    /// KVM reported an API version other than the one this crate speaks.
    #[error("incorrect KVM API version: expected {expected}, got {actual}")]
    IncorrectVersion { expected: i32, actual: i32 },

    /// A descriptor-returning ioctl returned a negative value without errno.
    #[error("ioctl {request:#x} returned invalid descriptor {result}")]
    InvalidDescriptor { request: IoctlRequest, result: i32 },

    /// The requested vCPU id is above the supported maximum.
    #[error("a maximum of {max} vCPUs are supported, requested {requested}")]
    TooManyVcpus { requested: u32, max: u32 },

    /// A vCPU with this id was already created on the VM.
    #[error("vCPU {0} already created")]
    VcpuExists(u32),

    /// Memory slots must have a non-zero size representable on the host.
    #[error("invalid memory slot size: {0}")]
    InvalidMemorySize(u64),

    /// The slot would extend past the end of the guest physical address space.
    #[error("guest physical address space exhausted: {size} bytes at {base:#x}")]
    AddressSpaceExhausted { base: u64, size: u64 },

    /// No more slot indices are available.
    #[error("memory slot index space exhausted")]
    TooManySlots,

    /// KVM_SET_USER_MEMORY_REGION returned a non-zero result.
    #[error("failed to add memory slot {slot}: ioctl returned {result}")]
    MemorySlotRejected { slot: u32, result: i32 },

    /// Host backing memory could not be mapped.
    #[error("failed to allocate guest memory: {0}")]
    Allocation(Errno),

    /// Guest memory access outside the slot it targets.
    #[error("access of {len} bytes at {addr:#x} is outside guest memory")]
    OutOfBounds { addr: u64, len: usize },

    /// Host write to a slot registered read-only.
    #[error("memory slot {0} is read-only")]
    ReadOnlySlot(u32),

    /// Closing a descriptor failed.
    #[error("failed to close descriptor: {0}")]
    Close(Errno),
}

impl KvmError {
    /// Returns the kernel error code, if this error came from a syscall.
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Syscall { errno, .. } | Self::Allocation(errno) | Self::Close(errno) => {
                Some(*errno)
            }
            _ => None,
        }
    }

    /// Returns true if KVM reported an unsupported API version.
    #[must_use]
    pub const fn is_incorrect_version(&self) -> bool {
        matches!(self, Self::IncorrectVersion { .. })
    }
}
