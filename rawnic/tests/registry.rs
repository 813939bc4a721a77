//! Driver registry and dummy device scenarios.

use rawnic::{
    Device, DeviceConfig, DeviceStats, DriverError, PacketBuffer, get_device,
    get_device_with_config, register_driver,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
}

#[test]
fn dummy_device_is_inert() {
    init_tracing();

    let mut dev = get_device("0000:00:00.0", "dummy").unwrap();
    assert_eq!(dev.driver_name(), "dummy");
    assert_eq!(dev.pci_addr(), "0000:00:00.0");
    assert!(!dev.is_supported());

    let mut bufs = vec![PacketBuffer::empty(); 32];
    assert_eq!(dev.rx_batch(0, &mut bufs), 0);
    assert_eq!(dev.tx_batch(0, &bufs), 0);
    assert_eq!(dev.link_speed_mbit(), 0);

    let mut stats = DeviceStats::default();
    dev.read_stats(&mut stats);
    assert_eq!(stats, DeviceStats::default());
}

#[test]
fn unknown_driver_is_rejected() {
    let res = get_device("0000:00:00.0", "e1000");
    match res {
        Err(DriverError::UnknownDriver(name)) => assert_eq!(name, "e1000"),
        _ => panic!("expected UnknownDriver"),
    }
}

#[test]
fn registered_factories_are_dispatchable() {
    fn factory(pci_addr: &str, _config: &DeviceConfig) -> rawnic::Result<Box<dyn Device>> {
        Ok(Box::new(rawnic::DummyDevice::new(pci_addr)))
    }

    register_driver("loopback", factory);
    let dev = get_device("0000:00:01.0", "loopback").unwrap();
    assert_eq!(dev.pci_addr(), "0000:00:01.0");
}

#[test]
fn config_json_drives_device_construction() {
    let config = DeviceConfig::from_json(r#"{"num_rx_queues": 2, "ring_size": 256}"#).unwrap();
    assert_eq!(config.num_rx_queues, 2);
    assert_eq!(config.ring_size, 256);

    // The dummy driver ignores sizing but goes through the same dispatch.
    let dev = get_device_with_config("0000:00:00.0", "dummy", &config).unwrap();
    assert!(!dev.is_supported());
}

#[test]
fn promiscuous_toggling_roundtrips() {
    let mut dev = get_device("0000:00:00.0", "dummy").unwrap();
    assert!(!dev.is_promiscuous());
    dev.enable_promiscuous();
    assert!(dev.is_promiscuous());
    dev.disable_promiscuous();
    assert!(!dev.is_promiscuous());
}

#[test]
fn ixgbe_on_missing_device_fails_cleanly() {
    // No such PCI function exists; opening must error rather than panic.
    // Unprivileged runs are rejected before the sysfs lookup.
    let res = get_device("ffff:ff:1f.7", "ixgbe");
    assert!(matches!(
        res,
        Err(DriverError::DeviceNotFound(_)) | Err(DriverError::NotPrivileged)
    ));
}
