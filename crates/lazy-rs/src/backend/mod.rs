pub mod registry;
pub mod spec;

pub use registry::{
    backend_for_device, device_args, has_backend, list_backends, register_backend,
    register_backend_instance,
};
pub use spec::{
    Backend, BackendCapabilities, BackendError, BackendResult, DeviceArgs, DeviceStorage,
    HostBuffer, RawBuffer, RawStorage,
};
