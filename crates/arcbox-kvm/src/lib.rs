//! # arcbox-kvm
//!
//! Host-side KVM control plane for ArcBox.
//!
//! This crate talks to `/dev/kvm` directly:
//! - [`Client`]: opens the device, checks the API version, creates VMs
//! - [`Vm`]: registers guest memory slots and creates vCPUs
//! - [`Ioctl`]: the request primitive every call goes through, replaceable
//!   in tests
//!
//! ## Example
//!
//! ```ignore
//! use arcbox_kvm::{Client, MachineType, MemorySlotFlags};
//!
//! let client = Client::new()?;
//! println!("KVM API version: {}", client.api_version()?);
//!
//! let mut vm = client.create_vm(MachineType::DEFAULT)?;
//! for _ in 0..4 {
//!     vm.add_memory_slot(128 << 20, MemorySlotFlags::empty())?;
//! }
//! vm.add_vcpu(0)?;
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// FFI bindings require pointer casts.
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::borrow_as_ptr)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unnecessary_cast)]
#![allow(clippy::uninlined_format_args)]

#[cfg(not(target_os = "linux"))]
compile_error!("arcbox-kvm requires Linux");

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod ioctl;
pub mod kvm;
pub mod memory;
pub mod vm;

pub use client::Client;
pub use config::{KvmConfig, KvmConfigBuilder, KVM_DEVICE_ENV};
pub use device::DeviceHandle;
pub use error::{KvmError, Result};
pub use ioctl::{Ioctl, KvmFd, SystemIoctl};
pub use kvm::{
    IoctlRequest, KvmUserspaceMemoryRegion, MachineType, MemorySlotFlags, KVM_API_VERSION,
    KVM_MAX_VCPUS,
};
pub use memory::{GuestMapping, MemorySlot};
pub use vm::Vm;
