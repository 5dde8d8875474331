//! In-memory USB backend for tests
//!
//! `MockTransport` records every control and bulk transfer and answers
//! from scripted responses; `MockBackend` enumerates a scripted set of
//! devices. Always compiled, hidden from the public docs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::{
    GS_CAN_FEATURE_FD, GS_USB_BREQ_BT_CONST, GS_USB_BREQ_BT_CONST_EXT, GS_USB_BREQ_DEVICE_CONFIG,
    GS_USB_BREQ_GET_STATE, GS_USB_BREQ_GET_TERMINATION,
};
use crate::structures::{
    BitTimingConstants, CanState, DataBitTimingConstants, DeviceConfig, DeviceState,
    TerminationState,
};
use crate::usb::{UsbBackend, UsbDeviceEntry, UsbTransport};

/// One recorded control OUT transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// One recorded bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRecord {
    pub endpoint: u8,
    /// Bytes written (OUT) or buffer size offered (IN)
    pub data: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Default)]
struct MockState {
    control_in: HashMap<(u8, Option<u16>), Vec<u8>>,
    control_in_log: Vec<(u8, u16, u16)>,
    control_out_log: Vec<ControlRecord>,
    control_out_errors: HashMap<u8, rusb::Error>,
    control_in_delay: Duration,
    bulk_in: VecDeque<rusb::Result<Vec<u8>>>,
    bulk_in_log: Vec<BulkRecord>,
    bulk_out_log: Vec<BulkRecord>,
    bulk_out_errors: VecDeque<rusb::Error>,
    kernel_driver: Option<bool>,
    detached: Vec<u8>,
    claimed: HashSet<u8>,
    released: Vec<u8>,
    interface_count: u8,
    endpoints: Vec<u8>,
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
}

/// Scripted `UsbTransport`
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport with no scripted responses; every control IN stalls
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                kernel_driver: Some(false),
                interface_count: 1,
                endpoints: vec![0x81, 0x02],
                ..MockState::default()
            }),
        }
    }

    /// gs_usb adapter with `channels` channels sharing one feature set
    ///
    /// 48 MHz clock for classic channels, 80 MHz when `feature` has FD.
    pub fn with_channels(channels: u8, feature: u32) -> Self {
        let transport = Self::new();
        let config = DeviceConfig {
            icount: channels.saturating_sub(1),
            sw_version: 2,
            hw_version: 1,
        };
        transport.set_control_in_response(GS_USB_BREQ_DEVICE_CONFIG, config.pack().to_vec());

        let fd = (feature & GS_CAN_FEATURE_FD) != 0;
        let constants = BitTimingConstants {
            feature,
            fclk_can: if fd { 80_000_000 } else { 48_000_000 },
            tseg1_min: 1,
            tseg1_max: 16,
            tseg2_min: 1,
            tseg2_max: 8,
            sjw_max: 4,
            brp_min: 1,
            brp_max: 1024,
            brp_inc: 1,
            data: fd.then_some(DataBitTimingConstants {
                dtseg1_min: 1,
                dtseg1_max: 16,
                dtseg2_min: 1,
                dtseg2_max: 8,
                dsjw_max: 4,
                dbrp_min: 1,
                dbrp_max: 32,
                dbrp_inc: 1,
            }),
        };
        transport.set_control_in_response(GS_USB_BREQ_BT_CONST, constants.pack().to_vec());
        if fd {
            transport.set_control_in_response(
                GS_USB_BREQ_BT_CONST_EXT,
                constants.pack_extended().to_vec(),
            );
        }

        transport.set_control_in_response(
            GS_USB_BREQ_GET_TERMINATION,
            TerminationState::new(false).pack().to_vec(),
        );
        let state = DeviceState {
            state: CanState::ErrorActive,
            rxerr: 0,
            txerr: 0,
        };
        transport.set_control_in_response(GS_USB_BREQ_GET_STATE, state.pack().to_vec());
        transport.set_strings(Some("candle"), Some("candleLight USB to CAN adapter"), Some("0042"));
        transport
    }

    /// Answer `request` with `data` for any wValue
    pub fn set_control_in_response(&self, request: u8, data: Vec<u8>) {
        self.state.lock().control_in.insert((request, None), data);
    }

    /// Answer `request` with `data` only for this wValue (channel)
    pub fn set_channel_response(&self, request: u8, value: u16, data: Vec<u8>) {
        self.state
            .lock()
            .control_in
            .insert((request, Some(value)), data);
    }

    /// Stall every control IN for `delay`, as a slow device would
    pub fn set_control_in_delay(&self, delay: Duration) {
        self.state.lock().control_in_delay = delay;
    }

    /// Make every control OUT with `request` fail
    pub fn fail_control_out(&self, request: u8, error: rusb::Error) {
        self.state.lock().control_out_errors.insert(request, error);
    }

    pub fn control_out_log(&self) -> Vec<ControlRecord> {
        self.state.lock().control_out_log.clone()
    }

    /// Control OUT transfers recorded for one request code
    pub fn control_out_for(&self, request: u8) -> Vec<ControlRecord> {
        self.state
            .lock()
            .control_out_log
            .iter()
            .filter(|record| record.request == request)
            .cloned()
            .collect()
    }

    pub fn control_in_count(&self, request: u8) -> usize {
        self.state
            .lock()
            .control_in_log
            .iter()
            .filter(|(req, _, _)| *req == request)
            .count()
    }

    /// Queue one bulk IN transfer result
    pub fn push_bulk_in(&self, data: Vec<u8>) {
        self.state.lock().bulk_in.push_back(Ok(data));
    }

    pub fn push_bulk_in_error(&self, error: rusb::Error) {
        self.state.lock().bulk_in.push_back(Err(error));
    }

    pub fn bulk_in_log(&self) -> Vec<BulkRecord> {
        self.state.lock().bulk_in_log.clone()
    }

    pub fn bulk_out_log(&self) -> Vec<BulkRecord> {
        self.state.lock().bulk_out_log.clone()
    }

    /// Fail the next bulk OUT transfer
    pub fn fail_next_bulk_out(&self, error: rusb::Error) {
        self.state.lock().bulk_out_errors.push_back(error);
    }

    /// `None` behaves like a platform without kernel driver binding
    pub fn set_kernel_driver_active(&self, active: Option<bool>) {
        self.state.lock().kernel_driver = active;
    }

    pub fn detached_interfaces(&self) -> Vec<u8> {
        self.state.lock().detached.clone()
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.state.lock().claimed.contains(&interface)
    }

    pub fn released_interfaces(&self) -> Vec<u8> {
        self.state.lock().released.clone()
    }

    pub fn set_interface_count(&self, count: u8) {
        self.state.lock().interface_count = count;
    }

    pub fn set_endpoints(&self, endpoints: Vec<u8>) {
        self.state.lock().endpoints = endpoints;
    }

    pub fn set_strings(
        &self,
        manufacturer: Option<&str>,
        product: Option<&str>,
        serial_number: Option<&str>,
    ) {
        let mut state = self.state.lock();
        state.manufacturer = manufacturer.map(str::to_string);
        state.product = product.map(str::to_string);
        state.serial_number = serial_number.map(str::to_string);
    }
}

impl UsbTransport for MockTransport {
    fn write_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.state.lock();
        state.control_out_log.push(ControlRecord {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        match state.control_out_errors.get(&request) {
            Some(error) => Err(*error),
            None => Ok(data.len()),
        }
    }

    fn read_control(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let delay = self.state.lock().control_in_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.control_in_log.push((request, value, index));
        let response = state
            .control_in
            .get(&(request, Some(value)))
            .or_else(|| state.control_in.get(&(request, None)))
            .ok_or(rusb::Error::Pipe)?;
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state.lock();
        if let Some(error) = state.bulk_out_errors.pop_front() {
            return Err(error);
        }
        state.bulk_out_log.push(BulkRecord {
            endpoint,
            data: data.to_vec(),
            timeout,
        });
        Ok(data.len())
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state.lock();
        state.bulk_in_log.push(BulkRecord {
            endpoint,
            data: vec![0; buf.len()],
            timeout,
        });
        match state.bulk_in.pop_front() {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(error)) => Err(error),
            None => Err(rusb::Error::Timeout),
        }
    }

    fn kernel_driver_active(&self, _interface: u8) -> rusb::Result<bool> {
        self.state.lock().kernel_driver.ok_or(rusb::Error::NotSupported)
    }

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        let mut state = self.state.lock();
        state.detached.push(interface);
        state.kernel_driver = Some(false);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        self.state.lock().claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        let mut state = self.state.lock();
        state.claimed.remove(&interface);
        state.released.push(interface);
        Ok(())
    }

    fn interface_count(&self) -> rusb::Result<u8> {
        Ok(self.state.lock().interface_count)
    }

    fn endpoint_addresses(&self, interface: u8, _alternate_setting: u8) -> rusb::Result<Vec<u8>> {
        let state = self.state.lock();
        if interface >= state.interface_count {
            return Err(rusb::Error::NotFound);
        }
        Ok(state.endpoints.clone())
    }

    fn manufacturer(&self) -> rusb::Result<Option<String>> {
        Ok(self.state.lock().manufacturer.clone())
    }

    fn product(&self) -> rusb::Result<Option<String>> {
        Ok(self.state.lock().product.clone())
    }

    fn serial_number(&self) -> rusb::Result<Option<String>> {
        Ok(self.state.lock().serial_number.clone())
    }
}

enum MockEntry {
    Available(Arc<MockTransport>),
    Inaccessible(rusb::Error),
}

/// Scripted `UsbBackend`
#[derive(Default)]
pub struct MockBackend {
    entries: Mutex<Vec<(UsbDeviceEntry, MockEntry)>>,
    opens: Mutex<Vec<UsbDeviceEntry>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device that opens into `transport`
    pub fn add_device(&self, entry: UsbDeviceEntry, transport: Arc<MockTransport>) {
        self.entries
            .lock()
            .push((entry, MockEntry::Available(transport)));
    }

    /// Attach a device whose open fails (e.g. held by another process)
    pub fn add_inaccessible(&self, entry: UsbDeviceEntry, error: rusb::Error) {
        self.entries
            .lock()
            .push((entry, MockEntry::Inaccessible(error)));
    }

    /// Detach every device at this bus position
    pub fn remove_device(&self, bus: u8, address: u8) {
        self.entries
            .lock()
            .retain(|(entry, _)| entry.bus != bus || entry.address != address);
    }

    /// Entries opened so far, in order
    pub fn opened(&self) -> Vec<UsbDeviceEntry> {
        self.opens.lock().clone()
    }
}

impl UsbBackend for MockBackend {
    fn devices(&self) -> rusb::Result<Vec<UsbDeviceEntry>> {
        Ok(self.entries.lock().iter().map(|(entry, _)| *entry).collect())
    }

    fn open(&self, entry: &UsbDeviceEntry) -> rusb::Result<Arc<dyn UsbTransport>> {
        self.opens.lock().push(*entry);
        let entries = self.entries.lock();
        let (_, found) = entries
            .iter()
            .find(|(candidate, _)| candidate == entry)
            .ok_or(rusb::Error::NoDevice)?;
        match found {
            MockEntry::Available(transport) => {
                let transport: Arc<dyn UsbTransport> = transport.clone();
                Ok(transport)
            }
            MockEntry::Inaccessible(error) => Err(*error),
        }
    }
}
