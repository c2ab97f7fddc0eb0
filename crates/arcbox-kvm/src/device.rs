//! Handle to the KVM device.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{KvmError, Result};

/// An open connection to the KVM device (normally `/dev/kvm`).
///
/// The descriptor is closed by [`DeviceHandle::close`], or on drop if the
/// handle is never closed explicitly.
#[derive(Debug)]
pub struct DeviceHandle {
    fd: OwnedFd,
    path: PathBuf,
}

impl DeviceHandle {
    /// Opens the device read-write with close-on-exec.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| KvmError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            fd: OwnedFd::from(file),
            path: path.to_path_buf(),
        })
    }

    /// Returns the path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the descriptor, reporting any error from the kernel.
    pub fn close(self) -> Result<()> {
        let fd = self.fd.into_raw_fd();
        nix::unistd::close(fd).map_err(KvmError::Close)
    }
}

impl AsRawFd for DeviceHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for DeviceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
