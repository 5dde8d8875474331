//! Shared fixtures for unit tests

use std::sync::Arc;

use crate::channel::Channel;
use crate::device::Device;
use crate::interface::Interface;
use crate::mock::MockTransport;
use crate::usb::UsbDeviceEntry;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn entry(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> UsbDeviceEntry {
    UsbDeviceEntry {
        bus,
        address,
        vendor_id,
        product_id,
    }
}

/// Interface 0 of a scripted adapter
pub(crate) fn open_interface(
    channels: u8,
    feature: u32,
) -> (Arc<MockTransport>, Device, Interface) {
    init_logger();
    let transport = Arc::new(MockTransport::with_channels(channels, feature));
    let device = Device::open(entry(1, 4, 0x1D50, 0x606F), transport.clone()).unwrap();
    let interface = device.interface(0).unwrap();
    (transport, device, interface)
}

/// Channel `index` on interface 0 of a scripted adapter
pub(crate) fn open_channel(
    channels: u8,
    feature: u32,
    index: u8,
) -> (Arc<MockTransport>, Device, Interface, Channel) {
    let (transport, device, interface) = open_interface(channels, feature);
    let channel = interface.channel(index).unwrap();
    (transport, device, interface, channel)
}
