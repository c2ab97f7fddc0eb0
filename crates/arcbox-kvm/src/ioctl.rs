//! The ioctl request primitive.
//!
//! Every request to KVM goes through an [`Ioctl`] implementation. The
//! production implementation is [`SystemIoctl`]; tests swap in closures that
//! check request numbers and synthesize results, so the client and VM logic
//! never needs `/dev/kvm`.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::{c_int, c_ulong};
use nix::errno::Errno;

use crate::error::{KvmError, Result};
use crate::kvm::IoctlRequest;

/// Performs ioctl requests on KVM descriptors.
pub trait Ioctl: Send + Sync {
    /// Issues `request` on `fd` with `arg`, which is either a scalar or the
    /// address of a `#[repr(C)]` structure.
    ///
    /// Kernel failures are returned as [`KvmError::Syscall`]. Any other
    /// result, including negative ones, is handed back for the caller to
    /// interpret according to the request's own convention.
    fn ioctl(&self, fd: RawFd, request: IoctlRequest, arg: c_ulong) -> Result<c_int>;

    /// Releases a descriptor previously returned by [`Ioctl::ioctl`].
    fn release(&self, fd: RawFd) -> Result<()>;
}

/// Issues real ioctl syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIoctl;

impl Ioctl for SystemIoctl {
    fn ioctl(&self, fd: RawFd, request: IoctlRequest, arg: c_ulong) -> Result<c_int> {
        let ret = unsafe { libc::ioctl(fd, request, arg) };
        Errno::result(ret).map_err(|errno| KvmError::Syscall { request, errno })
    }

    fn release(&self, fd: RawFd) -> Result<()> {
        nix::unistd::close(fd).map_err(KvmError::Close)
    }
}

/// Closures act as stand-in primitives.
///
/// Descriptors returned by a closure are synthetic, so releasing them is a
/// no-op.
impl<F> Ioctl for F
where
    F: Fn(RawFd, IoctlRequest, c_ulong) -> Result<c_int> + Send + Sync,
{
    fn ioctl(&self, fd: RawFd, request: IoctlRequest, arg: c_ulong) -> Result<c_int> {
        self(fd, request, arg)
    }

    fn release(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }
}

/// A descriptor minted by a KVM request (VM or vCPU).
///
/// Requests issued through it are scoped to its own descriptor. The
/// descriptor is released through the primitive that created it on drop.
pub struct KvmFd {
    fd: RawFd,
    ioctl: Arc<dyn Ioctl>,
}

impl KvmFd {
    /// Wraps the result of a descriptor-returning request.
    pub(crate) fn from_result(
        result: c_int,
        request: IoctlRequest,
        ioctl: Arc<dyn Ioctl>,
    ) -> Result<Self> {
        if result < 0 {
            return Err(KvmError::InvalidDescriptor { request, result });
        }
        Ok(Self { fd: result, ioctl })
    }

    /// Issues `request` on this descriptor.
    pub(crate) fn ioctl(&self, request: IoctlRequest, arg: c_ulong) -> Result<c_int> {
        self.ioctl.ioctl(self.fd, request, arg)
    }

    /// Returns the primitive this descriptor was created with.
    pub(crate) fn backend(&self) -> &Arc<dyn Ioctl> {
        &self.ioctl
    }

    /// Returns the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for KvmFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvmFd").field("fd", &self.fd).finish()
    }
}

impl Drop for KvmFd {
    fn drop(&mut self) {
        if let Err(e) = self.ioctl.release(self.fd) {
            tracing::warn!("Failed to release KVM descriptor {}: {}", self.fd, e);
        }
    }
}
