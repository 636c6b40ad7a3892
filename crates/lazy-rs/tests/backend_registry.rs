use lazy_rs::backend::registry::{
    backend_for_device, backend_name, device_args, has_backend, list_backends,
};
use lazy_rs::LazyError;

#[test]
fn test_backend_registry() {
    // Ensure backends are registered (auto-registration via .init_array)
    lazy_rs_backend_ref_cpu::register_cpu_backend();

    let backends = list_backends();
    println!("Available backends: {:?}", backends);

    assert!(has_backend("cpu"), "cpu backend not registered");
    assert!(backends.contains(&"cpu".to_string()));
    let mut sorted = backends.clone();
    sorted.sort();
    assert_eq!(backends, sorted);

    let cpu = backend_for_device("cpu").expect("failed to resolve cpu backend");
    assert_eq!(cpu.backend_name(), "cpu");
    assert!(cpu.capabilities().folds_constants());

    assert!(!has_backend("nonexistent"));
}

#[test]
fn device_ordinals_select_the_backend_and_become_args() {
    lazy_rs_backend_ref_cpu::register_cpu_backend();

    assert_eq!(backend_name("cpu:1"), "cpu");
    assert_eq!(backend_name("cpu"), "cpu");
    assert!(device_args("cpu").is_empty());
    assert_eq!(
        device_args("cpu:1").get("device").map(String::as_str),
        Some("1")
    );
    assert!(backend_for_device("cpu:3").is_ok());

    if std::env::var_os("LAZYRS_DEVICE").is_none() {
        assert_eq!(lazy_rs::default_device(), "cpu");
    }
}

#[test]
fn unknown_devices_are_reported() {
    let err = match backend_for_device("warp-drive:0") {
        Ok(_) => panic!("resolved a backend that was never registered"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<LazyError>(),
        Some(LazyError::UnknownDevice(device)) if device == "warp-drive:0"
    ));
}
