//! KVM ABI definitions.
//!
//! Request codes, constants and wire structures taken from `<linux/kvm.h>`.
//! Everything here must match the kernel's layout bit for bit.

use bitflags::bitflags;

/// Type of an ioctl request number on this target.
pub type IoctlRequest = nix::sys::ioctl::ioctl_num_type;

/// The KVM API version this crate speaks.
///
/// Applications should refuse to run if `KVM_GET_API_VERSION` returns a
/// value other than 12.
pub const KVM_API_VERSION: i32 = 12;

/// Default path of the KVM device.
pub const KVM_DEVICE_PATH: &str = "/dev/kvm";

/// Highest vCPU id accepted by [`Vm::add_vcpu`](crate::Vm::add_vcpu).
pub const KVM_MAX_VCPUS: u32 = 9;

// ============================================================================
// KVM ioctl Numbers
// ============================================================================

/// KVM magic number for ioctl encoding.
const KVMIO: u8 = 0xAE;

macro_rules! kvm_io {
    ($nr:expr) => {
        nix::request_code_none!(KVMIO, $nr)
    };
}

macro_rules! kvm_iow {
    ($nr:expr, $ty:ty) => {
        nix::request_code_write!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

// System ioctls
pub const KVM_GET_API_VERSION: IoctlRequest = kvm_io!(0x00);
pub const KVM_CREATE_VM: IoctlRequest = kvm_io!(0x01);

// VM ioctls
pub const KVM_CREATE_VCPU: IoctlRequest = kvm_io!(0x41);
pub const KVM_SET_USER_MEMORY_REGION: IoctlRequest = kvm_iow!(0x46, KvmUserspaceMemoryRegion);

// ============================================================================
// Data Structures
// ============================================================================

/// Userspace memory region descriptor, `struct kvm_userspace_memory_region`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

const _: () = assert!(std::mem::size_of::<KvmUserspaceMemoryRegion>() == 32);
const _: () = assert!(std::mem::align_of::<KvmUserspaceMemoryRegion>() == 8);

bitflags! {
    /// Flags for a guest memory slot.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct MemorySlotFlags: u32 {
        /// Track writes to the slot in the dirty log.
        const LOG_DIRTY_PAGES = 1 << 0;
        /// Guest writes to the slot exit to userspace as MMIO.
        const READONLY = 1 << 1;
    }
}

/// Machine type passed to `KVM_CREATE_VM`.
///
/// You most certainly want [`MachineType::DEFAULT`]; the other values select
/// architecture-specific VM variants and are passed through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MachineType(pub u64);

impl MachineType {
    pub const DEFAULT: Self = Self(0);
    pub const S390_UCONTROL: Self = Self(1);
    pub const PPC_HV: Self = Self(1);
    pub const PPC_PR: Self = Self(2);

    /// Returns the raw ioctl argument.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_request_codes_match_kernel_headers() {
        assert_eq!(KVM_GET_API_VERSION as u64, 44544);
        assert_eq!(KVM_CREATE_VM as u64, 44545);
        assert_eq!(KVM_CREATE_VCPU as u64, 44609);
        assert_eq!(KVM_SET_USER_MEMORY_REGION as u64, 1_075_883_590);
    }

    #[test]
    fn test_region_layout() {
        assert_eq!(
            std::mem::offset_of!(KvmUserspaceMemoryRegion, guest_phys_addr),
            8
        );
        assert_eq!(
            std::mem::offset_of!(KvmUserspaceMemoryRegion, userspace_addr),
            24
        );
    }

    #[test]
    fn test_flags_combine() {
        let flags = MemorySlotFlags::LOG_DIRTY_PAGES | MemorySlotFlags::READONLY;
        assert_eq!(flags.bits(), 3);
        assert_eq!(MemorySlotFlags::empty().bits(), 0);
    }
}
