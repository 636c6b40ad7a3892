pub mod cpu;

pub use cpu::{CpuBackend, CpuKernelInterceptor, GenericCpuBackend, NoopInterceptor};

/// Register the CPU backend with the global backend registry under `"cpu"`.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
pub fn register_cpu_backend() {
    lazy_rs::backend::registry::register_backend_instance("cpu", CpuBackend::new());
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
