//! KVM client.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use libc::c_ulong;

use crate::config::KvmConfig;
use crate::device::DeviceHandle;
use crate::error::{KvmError, Result};
use crate::ioctl::{Ioctl, KvmFd, SystemIoctl};
use crate::kvm::{MachineType, KVM_API_VERSION, KVM_CREATE_VM, KVM_GET_API_VERSION};
use crate::vm::Vm;

/// A KVM client. It holds the open KVM device and is the only way to create
/// virtual machines.
///
/// # Example
///
/// ```ignore
/// use arcbox_kvm::{Client, MachineType, MemorySlotFlags};
///
/// let client = Client::new()?;
/// let mut vm = client.create_vm(MachineType::DEFAULT)?;
/// vm.add_memory_slot(128 << 20, MemorySlotFlags::empty())?;
/// vm.add_vcpu(0)?;
/// ```
pub struct Client {
    device: DeviceHandle,
    ioctl: Arc<dyn Ioctl>,
    config: KvmConfig,
}

impl Client {
    /// Opens `/dev/kvm` (or `ARCBOX_KVM_DEVICE`) and checks the API version.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the device cannot be opened
    /// - the API version cannot be read
    /// - KVM reports a version other than [`KVM_API_VERSION`]
    pub fn new() -> Result<Self> {
        Self::with_config(KvmConfig::from_env())
    }

    /// Creates a client from an explicit configuration.
    pub fn with_config(config: KvmConfig) -> Result<Self> {
        Self::with_ioctl(config, SystemIoctl)
    }

    /// Creates a client that issues requests through `ioctl`.
    ///
    /// The device is still opened from `config.device_path`; only the
    /// requests are routed through the given primitive. No client is
    /// returned unless the version check passes, and the device is closed
    /// again on every failure.
    pub fn with_ioctl<I>(config: KvmConfig, ioctl: I) -> Result<Self>
    where
        I: Ioctl + 'static,
    {
        let device = DeviceHandle::open(&config.device_path)?;
        let client = Self {
            device,
            ioctl: Arc::new(ioctl),
            config,
        };

        let version = match client.api_version() {
            Ok(version) => version,
            Err(e) => {
                client.discard();
                return Err(e);
            }
        };

        if version != KVM_API_VERSION {
            client.discard();
            return Err(KvmError::IncorrectVersion {
                expected: KVM_API_VERSION,
                actual: version,
            });
        }

        tracing::info!(
            "KVM client opened {}: api_version={}",
            client.config.device_path.display(),
            version
        );

        Ok(client)
    }

    // Closes the device on a failed construction path.
    fn discard(self) {
        let path = self.config.device_path;
        if let Err(e) = self.device.close() {
            tracing::warn!("Failed to close {}: {}", path.display(), e);
        }
    }

    /// Returns the KVM API version reported by the device.
    pub fn api_version(&self) -> Result<i32> {
        self.ioctl
            .ioctl(self.device.as_raw_fd(), KVM_GET_API_VERSION, 0)
    }

    /// Creates a virtual machine of the given machine type.
    pub fn create_vm(&self, machine_type: MachineType) -> Result<Vm> {
        let ret = self.ioctl.ioctl(
            self.device.as_raw_fd(),
            KVM_CREATE_VM,
            machine_type.raw() as c_ulong,
        )?;
        let fd = KvmFd::from_result(ret, KVM_CREATE_VM, Arc::clone(&self.ioctl))?;

        tracing::info!(
            "Created KVM VM (fd {}, machine type {})",
            fd.as_raw_fd(),
            machine_type.raw()
        );

        Ok(Vm::new(fd))
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &KvmConfig {
        &self.config
    }

    /// Closes the KVM device.
    ///
    /// VMs created by this client keep their own descriptors and remain
    /// usable.
    pub fn close(self) -> Result<()> {
        self.device.close()
    }
}

impl AsRawFd for Client {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.device.as_raw_fd()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
