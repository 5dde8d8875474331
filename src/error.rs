//! Error types for the candle driver
//!
//! Capability mismatches and USB failures are returned as values; the
//! silent-drop paths (malformed or foreign frames) never reach this type.

use thiserror::Error;

use crate::channel::Capability;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, CandleError>;

/// Error types for driver operations
#[derive(Error, Debug)]
pub enum CandleError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Failed to claim interface
    #[error("Failed to claim USB interface {interface}: {source}")]
    ClaimInterface { interface: u8, source: rusb::Error },

    /// Failed to detach kernel driver
    #[error("Failed to detach kernel driver from interface {interface}: {source}")]
    DetachKernelDriver { interface: u8, source: rusb::Error },

    /// Control transfer failed
    #[error("Control transfer {request} failed: {source}")]
    ControlTransfer { request: u8, source: rusb::Error },

    /// Bulk transfer failed
    #[error("Bulk transfer failed: {0}")]
    BulkTransfer(rusb::Error),

    /// The channel does not advertise the requested capability
    #[error("Channel does not support {0}")]
    UnsupportedCapability(Capability),

    /// No bit timing entry for this bitrate and clock
    #[error("Unsupported bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedBitrate { bitrate: u32, clock_hz: u32 },

    /// No data phase bit timing entry for this bitrate and clock
    #[error("Unsupported data bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedDataBitrate { bitrate: u32, clock_hz: u32 },

    /// No frame arrived in the receive queue before the deadline
    #[error("Read timeout")]
    ReadTimeout,

    /// Bulk OUT transfer did not complete before the deadline
    #[error("Write timeout")]
    WriteTimeout,

    /// Control IN response shorter than the structure it carries
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// Channel index beyond the interface's channel count
    #[error("Invalid channel number: {channel} (interface has {channel_count} channels)")]
    ChannelOutOfRange { channel: u8, channel_count: u16 },

    /// Interface descriptor has no endpoint in the given direction
    #[error("No {direction} endpoint on interface {interface}, specify it manually")]
    EndpointNotFound {
        interface: u8,
        direction: &'static str,
    },

    /// Payload length that no DLC code maps to
    #[error("No DLC encodes a payload of {0} bytes")]
    InvalidDataLength(usize),
}

impl CandleError {
    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CandleError::ReadTimeout
                | CandleError::WriteTimeout
                | CandleError::Usb(rusb::Error::Timeout)
                | CandleError::BulkTransfer(rusb::Error::Timeout)
                | CandleError::ControlTransfer {
                    source: rusb::Error::Timeout,
                    ..
                }
        )
    }

    /// Check if this error is a USB error
    pub fn is_usb_error(&self) -> bool {
        matches!(
            self,
            CandleError::Usb(_)
                | CandleError::ClaimInterface { .. }
                | CandleError::DetachKernelDriver { .. }
                | CandleError::ControlTransfer { .. }
                | CandleError::BulkTransfer(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(CandleError::ReadTimeout.is_timeout());
        assert!(CandleError::WriteTimeout.is_timeout());
        assert!(CandleError::ControlTransfer {
            request: 2,
            source: rusb::Error::Timeout
        }
        .is_timeout());
        assert!(!CandleError::BulkTransfer(rusb::Error::Pipe).is_timeout());
        assert!(!CandleError::UnsupportedCapability(Capability::Fd).is_timeout());
    }

    #[test]
    fn test_usb_error_classification() {
        assert!(CandleError::BulkTransfer(rusb::Error::Io).is_usb_error());
        assert!(!CandleError::ReadTimeout.is_usb_error());
    }

    #[test]
    fn test_unsupported_capability_message() {
        let err = CandleError::UnsupportedCapability(Capability::ListenOnly);
        assert_eq!(err.to_string(), "Channel does not support listen-only mode");
    }
}
