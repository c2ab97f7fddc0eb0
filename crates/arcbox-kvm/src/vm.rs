//! Virtual machine handle.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::c_ulong;

use crate::error::{KvmError, Result};
use crate::ioctl::KvmFd;
use crate::kvm::{
    KvmUserspaceMemoryRegion, MemorySlotFlags, KVM_CREATE_VCPU, KVM_MAX_VCPUS,
    KVM_SET_USER_MEMORY_REGION,
};
use crate::memory::{GuestMapping, MemorySlot};

/// A KVM guest, created by [`Client::create_vm`](crate::Client::create_vm).
///
/// Guest physical memory is built up one slot at a time with
/// [`Vm::add_memory_slot`]; slots are packed back to back starting at guest
/// address 0 and are never removed or resized.
///
/// Mutating calls take `&mut self`. Sharing a VM between threads requires
/// wrapping it in a lock.
#[derive(Debug)]
pub struct Vm {
    // Drop order matters: vCPU descriptors, then the VM descriptor, then the
    // memory KVM may still reference through them.
    vcpus: BTreeMap<u32, KvmFd>,
    fd: KvmFd,
    memory: Vec<MemorySlot>,
}

impl Vm {
    pub(crate) fn new(fd: KvmFd) -> Self {
        Self {
            vcpus: BTreeMap::new(),
            fd,
            memory: Vec::new(),
        }
    }

    /// Returns the raw VM file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Registered memory slots, in slot order.
    pub fn memory_slots(&self) -> &[MemorySlot] {
        &self.memory
    }

    /// Total guest memory in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory.iter().map(MemorySlot::memory_size).sum()
    }

    /// Guest physical address where the next slot will start.
    pub fn guest_memory_end(&self) -> u64 {
        self.memory.last().map_or(0, MemorySlot::guest_end)
    }

    /// Finds the slot containing a guest physical address.
    pub fn slot_for_address(&self, addr: u64) -> Option<&MemorySlot> {
        // Slots are sorted by base address.
        let idx = self
            .memory
            .partition_point(|slot| slot.guest_phys_addr <= addr)
            .checked_sub(1)?;
        let slot = &self.memory[idx];
        slot.contains(addr).then_some(slot)
    }

    /// Reads guest memory at a guest physical address.
    ///
    /// The access must fall within a single slot.
    pub fn read_guest(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let slot = self
            .slot_for_address(addr)
            .ok_or(KvmError::OutOfBounds { addr, len: buf.len() })?;
        slot.read(addr - slot.guest_phys_addr, buf)
    }

    /// Writes guest memory at a guest physical address.
    ///
    /// The access must fall within a single writable slot.
    pub fn write_guest(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let slot = self
            .slot_for_address(addr)
            .ok_or(KvmError::OutOfBounds { addr, len: buf.len() })?;
        slot.write(addr - slot.guest_phys_addr, buf)
    }

    /// Allocates `size` bytes of host memory and registers it as the next
    /// guest memory slot.
    ///
    /// The slot index is the number of slots already registered and its
    /// guest physical base is the end of the previous slot. If KVM rejects
    /// the region the backing memory is released and the VM is left
    /// unchanged.
    pub fn add_memory_slot(&mut self, size: u64, flags: MemorySlotFlags) -> Result<&MemorySlot> {
        if size == 0 {
            return Err(KvmError::InvalidMemorySize(size));
        }

        let slot = u32::try_from(self.memory.len()).map_err(|_| KvmError::TooManySlots)?;
        let guest_phys_addr = self.guest_memory_end();
        if guest_phys_addr.checked_add(size).is_none() {
            return Err(KvmError::AddressSpaceExhausted {
                base: guest_phys_addr,
                size,
            });
        }

        // TODO: align the host mapping so its low 21 bits match guest_phys_addr,
        // letting guest huge pages be backed by host huge pages.
        let mapping = GuestMapping::new(size)?;
        let userspace_addr = mapping.host_addr();

        let region = KvmUserspaceMemoryRegion {
            slot,
            flags: flags.bits(),
            guest_phys_addr,
            memory_size: size,
            userspace_addr,
        };

        let ret = self
            .fd
            .ioctl(KVM_SET_USER_MEMORY_REGION, &region as *const _ as c_ulong)?;
        if ret != 0 {
            return Err(KvmError::MemorySlotRejected { slot, result: ret });
        }

        tracing::debug!(
            "Added memory slot {} at {:#x}: {} bytes, flags={:?}",
            slot,
            guest_phys_addr,
            size,
            flags
        );

        self.memory.push(MemorySlot {
            slot,
            flags,
            guest_phys_addr,
            memory_size: size,
            userspace_addr,
            mapping,
        });

        Ok(&self.memory[slot as usize])
    }

    /// Creates the vCPU with the given id.
    ///
    /// Ids above [`KVM_MAX_VCPUS`] are refused without contacting KVM.
    pub fn add_vcpu(&mut self, id: u32) -> Result<()> {
        if id > KVM_MAX_VCPUS {
            return Err(KvmError::TooManyVcpus {
                requested: id,
                max: KVM_MAX_VCPUS,
            });
        }

        if self.vcpus.contains_key(&id) {
            return Err(KvmError::VcpuExists(id));
        }

        let ret = self.fd.ioctl(KVM_CREATE_VCPU, c_ulong::from(id))?;
        let vcpu = KvmFd::from_result(ret, KVM_CREATE_VCPU, Arc::clone(self.fd.backend()))?;

        tracing::debug!("Created vCPU {} (fd {})", id, vcpu.as_raw_fd());

        self.vcpus.insert(id, vcpu);
        Ok(())
    }

    /// Number of vCPUs created.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Ids of the created vCPUs, in ascending order.
    pub fn vcpu_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.vcpus.keys().copied()
    }

    /// Raw descriptor of a created vCPU.
    pub fn vcpu_fd(&self, id: u32) -> Option<RawFd> {
        self.vcpus.get(&id).map(KvmFd::as_raw_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use libc::c_int;
    use nix::errno::Errno;

    use crate::ioctl::Ioctl;
    use crate::kvm::IoctlRequest;

    type Calls = Arc<Mutex<Vec<(RawFd, IoctlRequest)>>>;

    /// Builds a VM on descriptor 3 whose primitive records every call and
    /// answers with `respond`.
    fn vm_with<F>(respond: F) -> (Vm, Calls)
    where
        F: Fn(IoctlRequest, c_ulong) -> Result<c_int> + Send + Sync + 'static,
    {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&calls);
        let ioctl: Arc<dyn Ioctl> =
            Arc::new(move |fd: RawFd, request: IoctlRequest, arg: c_ulong| -> Result<c_int> {
                log.lock().unwrap().push((fd, request));
                respond(request, arg)
            });
        let fd = KvmFd::from_result(3, crate::kvm::KVM_CREATE_VM, ioctl).unwrap();
        (Vm::new(fd), calls)
    }

    fn region(arg: c_ulong) -> KvmUserspaceMemoryRegion {
        unsafe { *(arg as *const KvmUserspaceMemoryRegion) }
    }

    #[test]
    fn test_add_memory_slot() {
        let n = 1024;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let regions = Arc::clone(&seen);
        let (mut vm, calls) = vm_with(move |request, arg| {
            assert_eq!(request, KVM_SET_USER_MEMORY_REGION);
            regions.lock().unwrap().push(region(arg));
            Ok(0)
        });

        for _ in 0..2 {
            vm.add_memory_slot(n, MemorySlotFlags::READONLY).unwrap();
        }

        let seen = seen.lock().unwrap();
        for (i, region) in seen.iter().enumerate() {
            assert_eq!(region.slot, i as u32);
            assert_eq!(region.guest_phys_addr, i as u64 * n);
            assert_eq!(region.memory_size, n);
            assert_eq!(region.flags, MemorySlotFlags::READONLY.bits());
            assert_eq!(region.userspace_addr, vm.memory_slots()[i].userspace_addr());
        }
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(calls.lock().unwrap().iter().all(|&(fd, _)| fd == 3));
    }

    #[test]
    fn test_address_packing() {
        let (mut vm, _) = vm_with(|_, _| Ok(0));
        for size in [1024, 2048, 512] {
            vm.add_memory_slot(size, MemorySlotFlags::empty()).unwrap();
        }

        let bases: Vec<u64> = vm.memory_slots().iter().map(|s| s.guest_phys_addr()).collect();
        let slots: Vec<u32> = vm.memory_slots().iter().map(|s| s.slot()).collect();
        assert_eq!(bases, vec![0, 1024, 3072]);
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(vm.memory_size(), 3584);
        assert_eq!(vm.guest_memory_end(), 3584);
    }

    #[test]
    fn test_rejected_slot_leaves_no_trace() {
        let (mut vm, calls) = vm_with(|_, arg| {
            if region(arg).slot == 1 {
                Ok(1)
            } else {
                Ok(0)
            }
        });

        vm.add_memory_slot(4096, MemorySlotFlags::empty()).unwrap();
        let err = vm
            .add_memory_slot(4096, MemorySlotFlags::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            KvmError::MemorySlotRejected { slot: 1, result: 1 }
        ));
        assert_eq!(vm.memory_slots().len(), 1);
        assert_eq!(vm.guest_memory_end(), 4096);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_syscall_failure_leaves_no_trace() {
        let (mut vm, _) = vm_with(|request, _| {
            Err(KvmError::Syscall {
                request,
                errno: Errno::EINVAL,
            })
        });

        let err = vm
            .add_memory_slot(4096, MemorySlotFlags::empty())
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EINVAL));
        assert!(vm.memory_slots().is_empty());
    }

    #[test]
    fn test_zero_size_slot_not_issued() {
        let (mut vm, calls) = vm_with(|_, _| Ok(0));
        assert!(matches!(
            vm.add_memory_slot(0, MemorySlotFlags::empty()),
            Err(KvmError::InvalidMemorySize(0))
        ));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_allocation_failure_not_issued() {
        let (mut vm, calls) = vm_with(|_, _| Ok(0));
        let err = vm.add_memory_slot(1 << 62, MemorySlotFlags::empty()).unwrap_err();
        assert!(matches!(err, KvmError::Allocation(Errno::ENOMEM)));
        assert!(calls.lock().unwrap().is_empty());
        assert!(vm.memory_slots().is_empty());
    }

    #[test]
    fn test_address_space_exhausted() {
        let (mut vm, calls) = vm_with(|_, _| Ok(0));
        vm.add_memory_slot(4096, MemorySlotFlags::empty()).unwrap();

        let err = vm.add_memory_slot(u64::MAX, MemorySlotFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            KvmError::AddressSpaceExhausted {
                base: 4096,
                size: u64::MAX
            }
        ));
        assert_eq!(vm.memory_slots().len(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_guest_read_write() {
        let (mut vm, _) = vm_with(|_, _| Ok(0));
        vm.add_memory_slot(4096, MemorySlotFlags::empty()).unwrap();
        vm.add_memory_slot(4096, MemorySlotFlags::READONLY).unwrap();

        vm.write_guest(0x0ff0, &[0xAA; 16]).unwrap();
        let mut buf = [0u8; 16];
        vm.read_guest(0x0ff0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 16]);

        // Crossing into the next slot is refused.
        assert!(vm.write_guest(0x0ff8, &[0u8; 16]).is_err());
        assert!(matches!(
            vm.write_guest(0x1000, &[1]),
            Err(KvmError::ReadOnlySlot(1))
        ));
        assert!(vm.read_guest(0x2000, &mut buf).is_err());
    }

    #[test]
    fn test_slot_for_address() {
        let (mut vm, _) = vm_with(|_, _| Ok(0));
        assert!(vm.slot_for_address(0).is_none());
        for size in [0x1000, 0x2000] {
            vm.add_memory_slot(size, MemorySlotFlags::empty()).unwrap();
        }
        assert_eq!(vm.slot_for_address(0).map(MemorySlot::slot), Some(0));
        assert_eq!(vm.slot_for_address(0xfff).map(MemorySlot::slot), Some(0));
        assert_eq!(vm.slot_for_address(0x1000).map(MemorySlot::slot), Some(1));
        assert_eq!(vm.slot_for_address(0x2fff).map(MemorySlot::slot), Some(1));
        assert!(vm.slot_for_address(0x3000).is_none());
    }

    #[test]
    fn test_add_vcpu() {
        let next_fd = Arc::new(Mutex::new(10));
        let fds = Arc::clone(&next_fd);
        let (mut vm, calls) = vm_with(move |request, arg| {
            assert_eq!(request, KVM_CREATE_VCPU);
            assert!(arg <= c_ulong::from(KVM_MAX_VCPUS));
            let mut fd = fds.lock().unwrap();
            *fd += 1;
            Ok(*fd)
        });

        vm.add_vcpu(0).unwrap();
        vm.add_vcpu(1).unwrap();

        assert_eq!(vm.vcpu_count(), 2);
        assert_eq!(vm.vcpu_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(vm.vcpu_fd(0), Some(11));
        assert_eq!(vm.vcpu_fd(1), Some(12));
        assert_eq!(vm.vcpu_fd(2), None);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_too_many_vcpus() {
        let (mut vm, calls) = vm_with(|_, _| Ok(4));
        let err = vm.add_vcpu(KVM_MAX_VCPUS + 1).unwrap_err();
        assert!(matches!(
            err,
            KvmError::TooManyVcpus {
                requested: 10,
                max: 9
            }
        ));
        assert!(calls.lock().unwrap().is_empty());

        vm.add_vcpu(KVM_MAX_VCPUS).unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_vcpu() {
        let (mut vm, calls) = vm_with(|_, _| Ok(4));
        vm.add_vcpu(0).unwrap();
        assert!(matches!(vm.add_vcpu(0), Err(KvmError::VcpuExists(0))));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_vcpu_failure_not_tracked() {
        let (mut vm, _) = vm_with(|request, _| {
            Err(KvmError::Syscall {
                request,
                errno: Errno::EEXIST,
            })
        });
        assert!(vm.add_vcpu(0).is_err());
        assert_eq!(vm.vcpu_count(), 0);
    }
}
