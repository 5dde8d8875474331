//! Adapter discovery and device handles
//!
//! `DeviceRegistry` scans the bus for known gs_usb adapters and hands out
//! `Device` handles. A device that is still held somewhere is returned
//! again by later scans instead of being reopened.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::constants::{DeviceIdentifier, DEVICE_IDENTIFIERS};
use crate::error::{CandleError, Result};
use crate::interface::{Interface, InterfaceInner};
use crate::usb::{RusbBackend, UsbBackend, UsbDeviceEntry, UsbTransport};

const ENDPOINT_DIR_IN: u8 = 0x80;

pub(crate) struct DeviceInner {
    transport: Arc<dyn UsbTransport>,
    entry: UsbDeviceEntry,
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
    interfaces: Mutex<HashMap<u8, Weak<InterfaceInner>>>,
    /// Serializes interface claiming; `interfaces` is only held for lookups
    opening: Mutex<()>,
}

impl DeviceInner {
    pub(crate) fn transport(&self) -> &dyn UsbTransport {
        self.transport.as_ref()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        debug!(
            "closing {:04x}:{:04x} (bus {}, addr {})",
            self.entry.vendor_id, self.entry.product_id, self.entry.bus, self.entry.address
        );
    }
}

/// An opened gs_usb adapter
///
/// Cloning yields another handle to the same device. The USB handle is
/// closed when the last `Device`, `Interface` or `Channel` referring to
/// it is dropped.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Wrap an opened transport, reading the identifying strings
    pub fn open(entry: UsbDeviceEntry, transport: Arc<dyn UsbTransport>) -> Result<Self> {
        let manufacturer = transport.manufacturer()?;
        let product = transport.product()?;
        let serial_number = transport.serial_number()?;

        Ok(Self {
            inner: Arc::new(DeviceInner {
                transport,
                entry,
                manufacturer,
                product,
                serial_number,
                interfaces: Mutex::new(HashMap::new()),
                opening: Mutex::new(()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Self { inner }
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.entry.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.entry.product_id
    }

    pub fn bus(&self) -> u8 {
        self.inner.entry.bus
    }

    pub fn address(&self) -> u8 {
        self.inner.entry.address
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.inner.manufacturer.as_deref()
    }

    pub fn product(&self) -> Option<&str> {
        self.inner.product.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.inner.serial_number.as_deref()
    }

    /// Interfaces in the active configuration
    pub fn interface_count(&self) -> Result<u8> {
        Ok(self.inner.transport.interface_count()?)
    }

    /// Both handles refer to the same opened device
    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open interface `number` (alternate setting 0) with discovered endpoints
    pub fn interface(&self, number: u8) -> Result<Interface> {
        self.interface_with(number, 0, None, None)
    }

    /// Open an interface, creating it on first use
    ///
    /// An active kernel driver is detached before the interface is
    /// claimed. Endpoints left as `None` are taken from the interface
    /// descriptor: the first IN and the first OUT endpoint. While a handle
    /// to the interface is alive the same interface is returned and the
    /// other arguments are ignored.
    ///
    /// # Arguments
    /// * `number` - Interface number
    /// * `alternate_setting` - Alternate setting used for endpoint discovery
    /// * `endpoint_in` - Bulk IN endpoint address, or `None` to discover
    /// * `endpoint_out` - Bulk OUT endpoint address, or `None` to discover
    pub fn interface_with(
        &self,
        number: u8,
        alternate_setting: u8,
        endpoint_in: Option<u8>,
        endpoint_out: Option<u8>,
    ) -> Result<Interface> {
        let _opening = self.inner.opening.lock();
        if let Some(inner) = self.live_interface(number) {
            return Ok(Interface::from_inner(inner));
        }

        let transport = self.inner.transport();
        match transport.kernel_driver_active(number) {
            Ok(true) => {
                transport
                    .detach_kernel_driver(number)
                    .map_err(|source| CandleError::DetachKernelDriver {
                        interface: number,
                        source,
                    })?;
                debug!("interface {}: kernel driver detached", number);
            }
            Ok(false) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }

        let (endpoint_in, endpoint_out) = match (endpoint_in, endpoint_out) {
            (Some(ep_in), Some(ep_out)) => (ep_in, ep_out),
            (ep_in, ep_out) => {
                let addresses = transport.endpoint_addresses(number, alternate_setting)?;
                let find = |want_in: bool, direction: &'static str| {
                    addresses
                        .iter()
                        .copied()
                        .find(|addr| ((addr & ENDPOINT_DIR_IN) != 0) == want_in)
                        .ok_or(CandleError::EndpointNotFound {
                            interface: number,
                            direction,
                        })
                };
                let ep_in = match ep_in {
                    Some(ep) => ep,
                    None => find(true, "IN")?,
                };
                let ep_out = match ep_out {
                    Some(ep) => ep,
                    None => find(false, "OUT")?,
                };
                (ep_in, ep_out)
            }
        };

        let inner = Arc::new(InterfaceInner::open(
            self.inner.clone(),
            number,
            endpoint_in,
            endpoint_out,
        )?);
        let mut interfaces = self.inner.interfaces.lock();
        interfaces.retain(|_, interface| interface.strong_count() > 0);
        interfaces.insert(number, Arc::downgrade(&inner));
        Ok(Interface::from_inner(inner))
    }

    fn live_interface(&self, number: u8) -> Option<Arc<InterfaceInner>> {
        self.inner
            .interfaces
            .lock()
            .get(&number)
            .and_then(Weak::upgrade)
    }

    /// Poll every live interface of this device once
    pub fn polling(&self, timeout: Option<Duration>) -> Result<()> {
        let interfaces: Vec<Interface> = self
            .inner
            .interfaces
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .map(Interface::from_inner)
            .collect();

        for interface in interfaces {
            interface.polling(timeout)?;
        }
        Ok(())
    }

    fn position(&self) -> (u8, u8) {
        (self.bus(), self.address())
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} - {} - {} - {}",
            self.vendor_id(),
            self.product_id(),
            self.manufacturer().unwrap_or("?"),
            self.product().unwrap_or("?"),
            self.serial_number().unwrap_or("?")
        )
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus", &self.bus())
            .field("address", &self.address())
            .field("vendor_id", &format_args!("0x{:04x}", self.vendor_id()))
            .field("product_id", &format_args!("0x{:04x}", self.product_id()))
            .field("serial_number", &self.serial_number())
            .finish()
    }
}

/// Criteria for `DeviceRegistry::scan`; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.map_or(true, |vid| vid == vendor_id)
            && self.product_id.map_or(true, |pid| pid == product_id)
    }

    fn matches_strings(&self, device: &Device) -> bool {
        fn field(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |want| have == Some(want))
        }
        field(&self.manufacturer, device.manufacturer())
            && field(&self.product, device.product())
            && field(&self.serial_number, device.serial_number())
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.matches_ids(device.vendor_id(), device.product_id()) && self.matches_strings(device)
    }
}

/// Finds gs_usb adapters and keeps track of the ones in use
pub struct DeviceRegistry {
    backend: Arc<dyn UsbBackend>,
    identifiers: Vec<DeviceIdentifier>,
    active: Mutex<Vec<Weak<DeviceInner>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Registry over libusb with the built-in adapter list
    pub fn new() -> Self {
        Self::with_backend(Arc::new(RusbBackend))
    }

    pub fn with_backend(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            identifiers: DEVICE_IDENTIFIERS.to_vec(),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Replace the vendor/product ids considered during enumeration
    pub fn with_identifiers(mut self, identifiers: Vec<DeviceIdentifier>) -> Self {
        self.identifiers = identifiers;
        self
    }

    pub fn identifiers(&self) -> &[DeviceIdentifier] {
        &self.identifiers
    }

    /// Devices handed out earlier that are still held somewhere
    pub fn active_devices(&self) -> Vec<Device> {
        let mut active = self.active.lock();
        active.retain(|device| device.strong_count() > 0);
        active
            .iter()
            .filter_map(Weak::upgrade)
            .map(Device::from_inner)
            .collect()
    }

    /// Find adapters matching `filter`
    ///
    /// Matching devices already in use come first. The bus is then
    /// enumerated for known adapters; devices that cannot be opened or
    /// identified (e.g. claimed by another process) are skipped.
    ///
    /// # Example
    /// ```no_run
    /// use candle_usb::{DeviceRegistry, ScanFilter};
    ///
    /// let registry = DeviceRegistry::new();
    /// for device in registry.scan(&ScanFilter::new())? {
    ///     println!("{}", device);
    /// }
    /// # Ok::<(), candle_usb::CandleError>(())
    /// ```
    pub fn scan(&self, filter: &ScanFilter) -> Result<Vec<Device>> {
        let mut active = self.active.lock();
        active.retain(|device| device.strong_count() > 0);
        let mut live: Vec<Device> = active
            .iter()
            .filter_map(Weak::upgrade)
            .map(Device::from_inner)
            .collect();

        let mut found: Vec<Device> = live
            .iter()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect();

        let entries = self.backend.devices()?;
        for identifier in &self.identifiers {
            for entry in &entries {
                if !identifier.matches(entry.vendor_id, entry.product_id)
                    || !filter.matches_ids(entry.vendor_id, entry.product_id)
                {
                    continue;
                }
                if live
                    .iter()
                    .any(|device| device.position() == (entry.bus, entry.address))
                {
                    continue;
                }

                let device = match self
                    .backend
                    .open(entry)
                    .map_err(CandleError::from)
                    .and_then(|transport| Device::open(*entry, transport))
                {
                    Ok(device) => device,
                    Err(e) => {
                        debug!(
                            "skipping {} on bus {} addr {}: {}",
                            identifier, entry.bus, entry.address, e
                        );
                        continue;
                    }
                };

                if !filter.matches_strings(&device) {
                    continue;
                }

                debug!("found {}", device);
                active.push(Arc::downgrade(&device.inner));
                live.push(device.clone());
                found.push(device);
            }
        }

        Ok(found)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("identifiers", &self.identifiers)
            .field("active", &self.active.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GS_CAN_FEATURE_HW_TIMESTAMP;
    use crate::frame::HostFrame;
    use crate::mock::{MockBackend, MockTransport};
    use crate::testing::{entry, init_logger, open_interface};

    fn registry_with(devices: &[(UsbDeviceEntry, Arc<MockTransport>)]) -> (Arc<MockBackend>, DeviceRegistry) {
        init_logger();
        let backend = Arc::new(MockBackend::new());
        for (entry, transport) in devices {
            backend.add_device(*entry, transport.clone());
        }
        let registry = DeviceRegistry::with_backend(backend.clone());
        (backend, registry)
    }

    #[test]
    fn test_scan_finds_known_adapter() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        let (_backend, registry) = registry_with(&[
            (entry(1, 4, 0x1D50, 0x606F), transport),
            (entry(1, 5, 0x046D, 0xC52B), Arc::new(MockTransport::new())),
        ]);

        let devices = registry.scan(&ScanFilter::new()).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!((device.vendor_id(), device.product_id()), (0x1D50, 0x606F));
        assert_eq!((device.bus(), device.address()), (1, 4));
        assert_eq!(device.manufacturer(), Some("candle"));
        assert_eq!(
            device.to_string(),
            "1D50:606F - candle - candleLight USB to CAN adapter - 0042"
        );
    }

    #[test]
    fn test_scan_returns_held_device_again() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        let (backend, registry) = registry_with(&[(entry(1, 4, 0x1D50, 0x606F), transport)]);
        let filter = ScanFilter::new().vendor_id(0x1D50).product_id(0x606F);

        let first = registry.scan(&filter).unwrap();
        let second = registry.scan(&filter).unwrap();
        assert_eq!(second.len(), 1);
        assert!(first[0].ptr_eq(&second[0]));
        assert_eq!(backend.opened().len(), 1);

        drop(first);
        drop(second);
        assert!(registry.active_devices().is_empty());
        let third = registry.scan(&filter).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(backend.opened().len(), 2);
    }

    #[test]
    fn test_scan_skips_inaccessible_device() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        let (backend, registry) = registry_with(&[(entry(1, 4, 0x1209, 0x2323), transport)]);
        backend.add_inaccessible(entry(2, 7, 0x1D50, 0x606F), rusb::Error::Busy);

        let devices = registry.scan(&ScanFilter::new()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id(), 0x1209);
        assert_eq!(backend.opened().len(), 2);
    }

    #[test]
    fn test_scan_filters() {
        let first = Arc::new(MockTransport::with_channels(1, 0));
        let second = Arc::new(MockTransport::with_channels(1, 0));
        second.set_strings(Some("other"), Some("CANable"), Some("0099"));
        let (_backend, registry) = registry_with(&[
            (entry(1, 4, 0x1D50, 0x606F), first),
            (entry(1, 6, 0x1D50, 0x606F), second),
        ]);

        let by_serial = registry
            .scan(&ScanFilter::new().serial_number("0099"))
            .unwrap();
        assert_eq!(by_serial.len(), 1);
        assert_eq!(by_serial[0].address(), 6);

        let by_manufacturer = registry
            .scan(&ScanFilter::new().manufacturer("candle"))
            .unwrap();
        assert_eq!(by_manufacturer.len(), 1);
        assert_eq!(by_manufacturer[0].address(), 4);

        assert!(registry
            .scan(&ScanFilter::new().vendor_id(0x1209))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_custom_identifiers() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        let (_backend, registry) = registry_with(&[(entry(3, 2, 0x1234, 0x5678), transport)]);
        assert!(registry.scan(&ScanFilter::new()).unwrap().is_empty());

        let registry = registry.with_identifiers(vec![DeviceIdentifier::new(0x1234, 0x5678)]);
        assert_eq!(registry.scan(&ScanFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_interface_detaches_kernel_driver() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        transport.set_kernel_driver_active(Some(true));
        let device = Device::open(entry(1, 4, 0x1D50, 0x606F), transport.clone()).unwrap();

        let _interface = device.interface(0).unwrap();
        assert_eq!(transport.detached_interfaces(), vec![0]);
        assert!(transport.is_claimed(0));
    }

    #[test]
    fn test_interface_without_kernel_driver_support() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        transport.set_kernel_driver_active(None);
        let device = Device::open(entry(1, 4, 0x1D50, 0x606F), transport.clone()).unwrap();

        assert!(device.interface(0).is_ok());
        assert!(transport.detached_interfaces().is_empty());
    }

    #[test]
    fn test_interface_is_cached_while_held() {
        let (transport, device, interface) = open_interface(1, 0);
        let again = device.interface(0).unwrap();
        assert_eq!(again.interface_number(), interface.interface_number());
        assert_eq!(transport.control_out_log().len(), 1);
    }

    #[test]
    fn test_endpoint_discovery() {
        let transport = Arc::new(MockTransport::with_channels(1, 0));
        transport.set_endpoints(vec![0x01, 0x83, 0x82]);
        let device = Device::open(entry(1, 4, 0x1D50, 0x606F), transport.clone()).unwrap();
        let interface = device.interface(0).unwrap();
        assert_eq!(interface.endpoint_in(), 0x83);
        assert_eq!(interface.endpoint_out(), 0x01);

        let other = Arc::new(MockTransport::with_channels(1, 0));
        other.set_endpoints(vec![0x81]);
        let device = Device::open(entry(1, 5, 0x1D50, 0x606F), other.clone()).unwrap();
        assert!(matches!(
            device.interface(0),
            Err(CandleError::EndpointNotFound {
                interface: 0,
                direction: "OUT"
            })
        ));
        assert!(!other.is_claimed(0));

        let interface = device.interface_with(0, 0, None, Some(0x05)).unwrap();
        assert_eq!(interface.endpoint_out(), 0x05);
    }

    #[test]
    fn test_interface_claim_undone_on_config_failure() {
        let transport = Arc::new(MockTransport::new());
        let device = Device::open(entry(1, 4, 0x1D50, 0x606F), transport.clone()).unwrap();
        assert!(device.interface(0).is_err());
        assert!(!transport.is_claimed(0));
        assert_eq!(transport.released_interfaces(), vec![0]);
    }

    #[test]
    fn test_device_polling_not_blocked_by_interface_claim() {
        let (transport, device, interface) = open_interface(1, 0);
        transport.set_interface_count(2);
        let channel = interface.channel(0).unwrap();
        transport.set_control_in_delay(Duration::from_millis(500));

        let opener = {
            let device = device.clone();
            std::thread::spawn(move || device.interface(1).map(|iface| iface.interface_number()))
        };
        std::thread::sleep(Duration::from_millis(50));

        let raw = HostFrame::classic(0, 0x42, &[1])
            .with_echo_id(crate::constants::GS_USB_RX_ECHO_ID)
            .pack(false);
        transport.push_bulk_in(raw);
        let start = std::time::Instant::now();
        device.polling(Some(Duration::from_millis(10))).unwrap();
        assert!(start.elapsed() < Duration::from_millis(250), "{:?}", start.elapsed());
        assert_eq!(channel.pending(), 1);

        assert_eq!(opener.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_device_polling_fans_out() {
        let (transport, device, interface) = open_interface(1, GS_CAN_FEATURE_HW_TIMESTAMP);
        let channel = interface.channel(0).unwrap();

        let mut raw = HostFrame::classic(0, 0x7FF, &[1])
            .with_echo_id(crate::constants::GS_USB_RX_ECHO_ID)
            .pack(false);
        raw.extend_from_slice(&7u32.to_le_bytes());
        transport.push_bulk_in(raw);

        device.polling(Some(Duration::from_millis(1))).unwrap();
        let frame = channel.read(None).unwrap().unwrap();
        assert_eq!(frame.header.can_id, 0x7FF);
        assert_eq!(frame.timestamp_us, 7);
    }
}
