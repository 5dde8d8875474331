//! USB transport seam
//!
//! The driver talks to adapters through `UsbTransport` (one opened
//! device) and finds them through `UsbBackend` (enumeration). The
//! `rusb` implementations below are what `DeviceRegistry::new` uses;
//! tests plug in `crate::mock` instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rusb::{DeviceDescriptor, DeviceHandle, GlobalContext};

use crate::constants::{GS_USB_REQ_TYPE_IN, GS_USB_REQ_TYPE_OUT};

/// Bus position and identity of an enumerated USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDeviceEntry {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Transfer primitives on one opened USB device
///
/// Control requests are always vendor requests to the interface recipient.
pub trait UsbTransport: Send + Sync {
    fn write_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    /// `Err(NotSupported)` on platforms without kernel driver binding
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()>;

    fn claim_interface(&self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&self, interface: u8) -> rusb::Result<()>;

    /// Interfaces in the active configuration
    fn interface_count(&self) -> rusb::Result<u8>;

    /// Endpoint addresses of one interface alternate setting, in descriptor order
    fn endpoint_addresses(&self, interface: u8, alternate_setting: u8) -> rusb::Result<Vec<u8>>;

    fn manufacturer(&self) -> rusb::Result<Option<String>>;

    fn product(&self) -> rusb::Result<Option<String>>;

    fn serial_number(&self) -> rusb::Result<Option<String>>;
}

/// Device enumeration
pub trait UsbBackend: Send + Sync {
    /// Every USB device currently attached
    fn devices(&self) -> rusb::Result<Vec<UsbDeviceEntry>>;

    /// Open one enumerated device
    fn open(&self, entry: &UsbDeviceEntry) -> rusb::Result<Arc<dyn UsbTransport>>;
}

/// `UsbTransport` over a libusb handle
///
/// Interface claim/detach need exclusive access to the handle; transfers
/// share it.
pub struct RusbTransport {
    handle: RwLock<DeviceHandle<GlobalContext>>,
    descriptor: DeviceDescriptor,
}

impl RusbTransport {
    pub fn new(handle: DeviceHandle<GlobalContext>) -> rusb::Result<Self> {
        let descriptor = handle.device().device_descriptor()?;
        Ok(Self {
            handle: RwLock::new(handle),
            descriptor,
        })
    }

    fn read_string(&self, index: Option<u8>) -> rusb::Result<Option<String>> {
        match index {
            Some(idx) if idx != 0 => self
                .handle
                .read()
                .read_string_descriptor_ascii(idx)
                .map(Some),
            _ => Ok(None),
        }
    }
}

impl UsbTransport for RusbTransport {
    fn write_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read()
            .write_control(GS_USB_REQ_TYPE_OUT, request, value, index, data, timeout)
    }

    fn read_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read()
            .read_control(GS_USB_REQ_TYPE_IN, request, value, index, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read().write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read().read_bulk(endpoint, buf, timeout)
    }

    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        self.handle.read().kernel_driver_active(interface)
    }

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        self.handle.write().detach_kernel_driver(interface)
    }

    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        self.handle.write().claim_interface(interface)
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        self.handle.write().release_interface(interface)
    }

    fn interface_count(&self) -> rusb::Result<u8> {
        let config = self.handle.read().device().active_config_descriptor()?;
        Ok(config.num_interfaces())
    }

    fn endpoint_addresses(&self, interface: u8, alternate_setting: u8) -> rusb::Result<Vec<u8>> {
        let config = self.handle.read().device().active_config_descriptor()?;
        let setting = config
            .interfaces()
            .find(|iface| iface.number() == interface)
            .and_then(|iface| {
                iface
                    .descriptors()
                    .find(|desc| desc.setting_number() == alternate_setting)
            })
            .ok_or(rusb::Error::NotFound)?;
        Ok(setting
            .endpoint_descriptors()
            .map(|endpoint| endpoint.address())
            .collect())
    }

    fn manufacturer(&self) -> rusb::Result<Option<String>> {
        self.read_string(self.descriptor.manufacturer_string_index())
    }

    fn product(&self) -> rusb::Result<Option<String>> {
        self.read_string(self.descriptor.product_string_index())
    }

    fn serial_number(&self) -> rusb::Result<Option<String>> {
        self.read_string(self.descriptor.serial_number_string_index())
    }
}

/// `UsbBackend` over the libusb global context
#[derive(Debug, Default, Clone, Copy)]
pub struct RusbBackend;

impl UsbBackend for RusbBackend {
    fn devices(&self) -> rusb::Result<Vec<UsbDeviceEntry>> {
        let mut entries = Vec::new();
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            entries.push(UsbDeviceEntry {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
        Ok(entries)
    }

    fn open(&self, entry: &UsbDeviceEntry) -> rusb::Result<Arc<dyn UsbTransport>> {
        for device in rusb::devices()?.iter() {
            if device.bus_number() != entry.bus || device.address() != entry.address {
                continue;
            }
            let handle = device.open()?;
            return Ok(Arc::new(RusbTransport::new(handle)?));
        }
        Err(rusb::Error::NoDevice)
    }
}
