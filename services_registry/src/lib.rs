//! # Service Registry
//!
//! This crate implements kernel discovery.
//!
//! ## Philosophy
//!
//! Components start independently and find the kernel in two steps:
//! 1. Poll a well-known handle (a small file) for the kernel's identity
//! 2. Resolve that identity to an inbox through the registry
//!
//! The handle only carries an identity. Authority to talk to the kernel
//! comes from the registry, which hands out [`KernelHandle`]s.

pub mod discovery;

pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryHandle};

use core_types::KernelId;
use kernel_api::KernelHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Error types for registry operations
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Kernel already registered
    AlreadyRegistered(KernelId),
    /// Kernel not found
    NotFound(KernelId),
}

/// Kernel registry
///
/// Maps published kernel identities to their inbox handles.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    kernels: HashMap<KernelId, KernelHandle>,
}

/// Registry shared between the orchestrator and the components it starts
pub type SharedRegistry = Arc<Mutex<ServiceRegistry>>;

impl ServiceRegistry {
    /// Creates a new registry
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// Creates a new registry wrapped for sharing across threads
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers a kernel
    pub fn register(&mut self, id: KernelId, handle: KernelHandle) -> Result<(), RegistryError> {
        if self.kernels.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.kernels.insert(id, handle);
        Ok(())
    }

    /// Looks up a kernel
    pub fn lookup(&self, id: KernelId) -> Result<KernelHandle, RegistryError> {
        self.kernels
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Unregisters a kernel
    pub fn unregister(&mut self, id: KernelId) -> Result<(), RegistryError> {
        self.kernels
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Returns the number of registered kernels
    pub fn count(&self) -> usize {
        self.kernels.len()
    }
}

/// Finds the kernel the way every independently started component does:
/// wait for the discovery handle, then resolve it through the registry.
///
/// The registry lookup shares the handle's retry budget, so a component
/// that reads the handle a moment before registration completes still
/// connects.
pub fn locate_kernel(
    discovery: &DiscoveryHandle,
    registry: &SharedRegistry,
) -> Result<KernelHandle, DiscoveryError> {
    let config = discovery.config();
    for _ in 0..config.max_attempts {
        if let Some(id) = discovery.try_read()? {
            let found = registry
                .lock()
                .map_err(|_| DiscoveryError::RegistryUnavailable)?
                .lookup(id);
            if let Ok(handle) = found {
                return Ok(handle);
            }
        }
        std::thread::sleep(config.poll_interval());
    }
    Err(DiscoveryError::Timeout {
        path: discovery.path().display().to_string(),
        attempts: config.max_attempts,
    })
}
