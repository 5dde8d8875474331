//! USB interface of a gs_usb adapter
//!
//! An interface owns the bulk endpoint pair shared by all of its
//! channels. `polling` reads one host frame from the IN endpoint and
//! routes it to the channel named in the frame header.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelInner};
use crate::constants::{
    CANFD_MAX_DLEN, CAN_MAX_DLEN, DEFAULT_CONTROL_TIMEOUT, FD_TAIL_TIMEOUT, GS_CAN_FEATURE_FD,
    GS_CAN_FEATURE_HW_TIMESTAMP, GS_USB_FRAME_HEADER_SIZE, GS_USB_TIMESTAMP_SIZE,
    USB_FS_MAX_PACKET_SIZE,
};
use crate::control::{read_device_config, send_host_format};
use crate::device::{Device, DeviceInner};
use crate::error::{CandleError, Result};
use crate::frame::HostFrame;
use crate::structures::{BitTimingConstants, DeviceConfig};
use crate::usb::UsbTransport;

/// Bulk IN transfer shape, grown as channels are created
#[derive(Debug, Default, Clone, Copy)]
struct RxLayout {
    size: usize,
    hw_timestamp: bool,
}

impl RxLayout {
    fn account(&mut self, constants: &BitTimingConstants) {
        let hw_timestamp = constants.has_feature(GS_CAN_FEATURE_HW_TIMESTAMP);
        let payload = if constants.has_feature(GS_CAN_FEATURE_FD) {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        let mut size = GS_USB_FRAME_HEADER_SIZE + payload;
        if hw_timestamp {
            size += GS_USB_TIMESTAMP_SIZE;
        }
        self.size = self.size.max(size);
        self.hw_timestamp |= hw_timestamp;
    }
}

pub(crate) struct InterfaceInner {
    device: Arc<DeviceInner>,
    number: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    config: DeviceConfig,
    rx: Mutex<RxLayout>,
    channels: Mutex<HashMap<u8, Weak<ChannelInner>>>,
}

impl InterfaceInner {
    /// Claim the interface and read its configuration
    ///
    /// The claim is undone if configuration fails.
    pub(crate) fn open(
        device: Arc<DeviceInner>,
        number: u8,
        endpoint_in: u8,
        endpoint_out: u8,
    ) -> Result<Self> {
        let transport = device.transport();
        transport
            .claim_interface(number)
            .map_err(|source| CandleError::ClaimInterface {
                interface: number,
                source,
            })?;

        let config = match Self::configure(transport, number) {
            Ok(config) => config,
            Err(e) => {
                if let Err(release) = transport.release_interface(number) {
                    warn!("failed to release interface {}: {}", number, release);
                }
                return Err(e);
            }
        };

        debug!(
            "interface {}: {}, endpoints in 0x{:02x} out 0x{:02x}",
            number, config, endpoint_in, endpoint_out
        );

        Ok(Self {
            device,
            number,
            endpoint_in,
            endpoint_out,
            config,
            rx: Mutex::new(RxLayout::default()),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn configure(transport: &dyn UsbTransport, number: u8) -> Result<DeviceConfig> {
        send_host_format(transport, number)?;
        read_device_config(transport, number)
    }

    pub(crate) fn transport(&self) -> &dyn UsbTransport {
        self.device.transport()
    }

    pub(crate) fn number(&self) -> u8 {
        self.number
    }

    pub(crate) fn endpoint_out(&self) -> u8 {
        self.endpoint_out
    }

    /// Receive at most one frame and hand it to its channel
    pub(crate) fn polling(&self, timeout: Option<Duration>) -> Result<()> {
        let layout = *self.rx.lock();
        if layout.size == 0 {
            // no channel yet, nothing could be routed
            return Ok(());
        }

        let transport = self.transport();
        let mut buf = vec![0u8; layout.size];
        let mut len = match transport.read_bulk(
            self.endpoint_in,
            &mut buf,
            timeout.unwrap_or(DEFAULT_CONTROL_TIMEOUT),
        ) {
            Ok(len) => len,
            Err(rusb::Error::Timeout) => return Ok(()),
            Err(e) => return Err(CandleError::BulkTransfer(e)),
        };

        // Some full-speed firmware splits FD frames at the packet boundary
        if layout.size > USB_FS_MAX_PACKET_SIZE && len == USB_FS_MAX_PACKET_SIZE {
            trace!("interface {}: reading FD frame tail", self.number);
            match transport.read_bulk(self.endpoint_in, &mut buf[len..], FD_TAIL_TIMEOUT) {
                Ok(tail) => len += tail,
                Err(rusb::Error::Timeout) => {
                    trace!(
                        "interface {}: FD frame tail missing, dropping {} bytes",
                        self.number,
                        len
                    );
                    return Ok(());
                }
                Err(e) => return Err(CandleError::BulkTransfer(e)),
            }
        }

        let frame = match HostFrame::unpack(&buf[..len], layout.hw_timestamp) {
            Some(frame) => frame,
            None => {
                trace!(
                    "interface {}: dropping malformed transfer of {} bytes",
                    self.number,
                    len
                );
                return Ok(());
            }
        };

        let channel = self
            .channels
            .lock()
            .get(&frame.header.channel)
            .and_then(Weak::upgrade);
        match channel {
            Some(channel) => channel.enqueue(frame),
            None => trace!(
                "interface {}: dropping frame for closed channel {}",
                self.number,
                frame.header.channel
            ),
        }
        Ok(())
    }
}

impl Drop for InterfaceInner {
    fn drop(&mut self) {
        if let Err(e) = self.transport().release_interface(self.number) {
            warn!("failed to release interface {}: {}", self.number, e);
        } else {
            debug!("interface {} released", self.number);
        }
    }
}

/// A claimed gs_usb interface
///
/// Cloning yields another handle to the same interface. The interface
/// stays claimed while any handle, or any of its channels, is alive.
#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    pub(crate) fn from_inner(inner: Arc<InterfaceInner>) -> Self {
        Self { inner }
    }

    /// Device this interface belongs to
    pub fn device(&self) -> Device {
        Device::from_inner(self.inner.device.clone())
    }

    pub fn interface_number(&self) -> u8 {
        self.inner.number
    }

    pub fn endpoint_in(&self) -> u8 {
        self.inner.endpoint_in
    }

    pub fn endpoint_out(&self) -> u8 {
        self.inner.endpoint_out
    }

    /// DEVICE_CONFIG as read when the interface was opened
    pub fn device_config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn channel_count(&self) -> u16 {
        self.inner.config.channel_count()
    }

    pub fn software_version(&self) -> u32 {
        self.inner.config.sw_version
    }

    pub fn hardware_version(&self) -> u32 {
        self.inner.config.hw_version
    }

    /// Get a channel, creating it on first use
    ///
    /// While a handle to the channel is alive the same channel is returned
    /// and frames for it are queued; once every handle is dropped, frames
    /// for that index are discarded until it is requested again.
    pub fn channel(&self, index: u8) -> Result<Channel> {
        let channel_count = self.channel_count();
        if u16::from(index) >= channel_count {
            return Err(CandleError::ChannelOutOfRange {
                channel: index,
                channel_count,
            });
        }

        if let Some(inner) = self.live_channel(index) {
            return Ok(Channel::from_inner(inner));
        }

        // BT_CONST reads happen unlocked so polling keeps routing meanwhile
        let created = Arc::new(ChannelInner::new(self.inner.clone(), index)?);

        let mut channels = self.inner.channels.lock();
        if let Some(inner) = channels.get(&index).and_then(Weak::upgrade) {
            return Ok(Channel::from_inner(inner));
        }
        self.inner.rx.lock().account(created.bit_timing_constants());
        channels.retain(|_, channel| channel.strong_count() > 0);
        channels.insert(index, Arc::downgrade(&created));
        drop(channels);

        debug!(
            "interface {}: channel {} created, {}",
            self.inner.number,
            index,
            created.bit_timing_constants()
        );
        Ok(Channel::from_inner(created))
    }

    fn live_channel(&self, index: u8) -> Option<Arc<ChannelInner>> {
        self.inner
            .channels
            .lock()
            .get(&index)
            .and_then(Weak::upgrade)
    }

    /// Receive at most one frame and queue it on its channel
    ///
    /// A bulk timeout is not an error; malformed transfers and frames for
    /// channels nobody holds are discarded.
    ///
    /// # Arguments
    /// * `timeout` - Bulk read timeout, `None` for the 1 s default
    pub fn polling(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.polling(timeout)
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("number", &self.inner.number)
            .field("endpoint_in", &format_args!("0x{:02x}", self.inner.endpoint_in))
            .field("endpoint_out", &format_args!("0x{:02x}", self.inner.endpoint_out))
            .field("config", &self.inner.config)
            .finish()
    }
}
