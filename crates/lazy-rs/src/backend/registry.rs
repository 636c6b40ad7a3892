//! Runtime backend registry for device resolution.
//!
//! Devices are named `backend[:ordinal]`. The part before `:` selects a backend registered here;
//! the ordinal is passed to the backend as device arguments. Backend crates register themselves
//! (see `lazy_rs_backend_ref_cpu::register_cpu_backend`), and tests may register wrappers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;

use super::spec::{Backend, DeviceArgs};
use crate::error::LazyError;

/// Global backend registry mapping backend names to shared instances.
struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, backend: Arc<dyn Backend>) {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(name, backend);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .get(name)
            .cloned()
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

static GLOBAL_REGISTRY: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::new);

/// Register `backend` under `name`, replacing any previous registration.
///
/// # Example
/// ```ignore
/// use lazy_rs::backend::registry::register_backend;
///
/// pub fn register() {
///     register_backend("my_backend", Arc::new(MyBackend::new()));
/// }
/// ```
pub fn register_backend(name: impl Into<String>, backend: Arc<dyn Backend>) {
    GLOBAL_REGISTRY.register(name.into(), backend);
}

/// Register a concrete backend value.
pub fn register_backend_instance<B: Backend + 'static>(name: impl Into<String>, backend: B) {
    register_backend(name, Arc::new(backend));
}

/// List all registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    GLOBAL_REGISTRY.list_backends()
}

/// Check if a backend with the given name is registered.
pub fn has_backend(name: &str) -> bool {
    GLOBAL_REGISTRY.get(name).is_some()
}

/// Name of the backend selected by `device` (the part before `:`).
pub fn backend_name(device: &str) -> &str {
    device.split_once(':').map(|(name, _)| name).unwrap_or(device)
}

/// Extra arguments carried by `device`: `{"device": ordinal}` when an ordinal is present.
pub fn device_args(device: &str) -> DeviceArgs {
    let mut args = DeviceArgs::new();
    if let Some((_, ordinal)) = device.split_once(':') {
        args.insert("device".to_string(), ordinal.to_string());
    }
    args
}

/// Resolve the backend serving `device`.
pub fn backend_for_device(device: &str) -> Result<Arc<dyn Backend>> {
    GLOBAL_REGISTRY
        .get(backend_name(device))
        .ok_or_else(|| LazyError::UnknownDevice(device.to_string()).into())
}
