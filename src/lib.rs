//! Multi-channel driver for candle / gs_usb USB-CAN adapters
//!
//! This crate talks the gs_usb vendor protocol used by candleLight,
//! CANable and compatible CAN and CAN FD adapters. One physical device
//! may expose several interfaces, each with several CAN channels.
//!
//! # Features
//!
//! - Classic CAN and CAN FD with bitrate switching
//! - Hardware timestamps, negotiated automatically
//! - Loopback, listen-only, triple-sample, one-shot and bus error reporting modes
//! - Termination control and bus state / error counter queries
//! - Several channels per interface, several interfaces per device
//!
//! # Model
//!
//! `DeviceRegistry::scan` yields `Device`s. A device hands out
//! `Interface`s, an interface hands out `Channel`s. Handles keep their
//! parents alive; a parent only caches weak references to its children.
//! Received frames are queued per channel by `Interface::polling` (or
//! `Device::polling`), which the application drives.
//!
//! # Example
//!
//! ```no_run
//! use candle_usb::{ChannelOptions, DeviceRegistry, HostFrame, ScanFilter};
//! use std::time::Duration;
//!
//! fn main() -> candle_usb::Result<()> {
//!     let registry = DeviceRegistry::new();
//!     let devices = registry.scan(&ScanFilter::new())?;
//!     let Some(device) = devices.into_iter().next() else {
//!         println!("No gs_usb device found");
//!         return Ok(());
//!     };
//!
//!     let interface = device.interface(0)?;
//!     let channel = interface.channel(0)?;
//!     channel.set_bitrate(250_000)?;
//!     channel.open(&ChannelOptions::new())?;
//!
//!     let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
//!     channel.write(&HostFrame::classic(0, 0x7FF, &data), None)?;
//!
//!     loop {
//!         interface.polling(Some(Duration::from_millis(100)))?;
//!         while let Some(frame) = channel.read(None)? {
//!             println!("RX  {}", frame);
//!         }
//!     }
//! }
//! ```
//!
//! # Supported Devices
//!
//! - gs_usb / CANable (VID: 0x1D50, PID: 0x606F)
//! - candleLight (VID: 0x1209, PID: 0x2323)
//! - CES CANext FD (VID: 0x1CD2, PID: 0x606F)
//! - ABE CANdebugger FD (VID: 0x16D0, PID: 0x10B8)
//! - 0x16D0:0x0F30 adapters
//!
//! Other ids can be scanned with `DeviceRegistry::with_identifiers`.

pub mod channel;
pub mod constants;
mod control;
pub mod device;
pub mod error;
pub mod frame;
pub mod interface;
#[doc(hidden)]
pub mod mock;
pub mod structures;
pub mod timing;
pub mod usb;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use constants::{
    // CAN ID flags
    CAN_EFF_FLAG,
    // CAN ID masks
    CAN_EFF_MASK,
    CAN_ERR_FLAG,
    CAN_ERR_MASK,
    CAN_RTR_FLAG,
    CAN_SFF_MASK,
    // Frame flags
    GS_CAN_FLAG_BRS,
    GS_CAN_FLAG_ESI,
    GS_CAN_FLAG_FD,
    GS_CAN_FLAG_OVERFLOW,
    // Mode flags
    GS_CAN_MODE_BERR_REPORTING,
    GS_CAN_MODE_FD,
    GS_CAN_MODE_HW_TIMESTAMP,
    GS_CAN_MODE_LISTEN_ONLY,
    GS_CAN_MODE_LOOP_BACK,
    GS_CAN_MODE_NORMAL,
    GS_CAN_MODE_ONE_SHOT,
    GS_CAN_MODE_TRIPLE_SAMPLE,
    DEVICE_IDENTIFIERS,
    DeviceIdentifier,
};

pub use channel::{Capability, Channel, ChannelOptions};
pub use control::{read_bit_timing_constants, read_device_config, send_host_format};
pub use device::{Device, DeviceRegistry, ScanFilter};
pub use error::{CandleError, Result};
pub use frame::{dlc_to_len, len_to_dlc, HostFrame, HostFrameHeader};
pub use interface::Interface;
pub use structures::{
    BitTiming, BitTimingConstants, CanState, DataBitTimingConstants, DeviceConfig, DeviceMode,
    DeviceState, HostConfig, TerminationState,
};
pub use usb::{RusbBackend, RusbTransport, UsbBackend, UsbDeviceEntry, UsbTransport};
