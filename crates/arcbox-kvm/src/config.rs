//! Client configuration.

use std::path::PathBuf;

use crate::kvm::KVM_DEVICE_PATH;

/// Environment variable overriding the KVM device path.
pub const KVM_DEVICE_ENV: &str = "ARCBOX_KVM_DEVICE";

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvmConfig {
    /// Path of the KVM device.
    pub device_path: PathBuf,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(KVM_DEVICE_PATH),
        }
    }
}

impl KvmConfig {
    /// Creates a new builder for KVM configuration.
    #[must_use]
    pub fn builder() -> KvmConfigBuilder {
        KvmConfigBuilder::default()
    }

    /// Default configuration, with the device path taken from
    /// `ARCBOX_KVM_DEVICE` when it is set and non-empty.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var_os(KVM_DEVICE_ENV) {
            Some(path) if !path.is_empty() => Self {
                device_path: PathBuf::from(path),
            },
            _ => Self::default(),
        }
    }
}

/// Builder for [`KvmConfig`].
#[derive(Debug, Default)]
pub struct KvmConfigBuilder {
    config: KvmConfig,
}

impl KvmConfigBuilder {
    /// Sets the KVM device path.
    #[must_use]
    pub fn device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device_path = path.into();
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> KvmConfig {
        self.config
    }
}
