//! Vendor control requests
//!
//! Interface-scoped requests (HOST_FORMAT, DEVICE_CONFIG) carry
//! `wValue = 1` and the interface number in `wIndex`. Channel-scoped
//! requests carry the channel in `wValue` and `wIndex = 0`, as the gs_usb
//! firmware and the Linux host driver expect.

use log::debug;

use crate::constants::{
    DEFAULT_CONTROL_TIMEOUT, GS_CAN_FEATURE_FD, GS_USB_BREQ_BT_CONST, GS_USB_BREQ_BT_CONST_EXT,
    GS_USB_BREQ_DEVICE_CONFIG, GS_USB_BREQ_HOST_FORMAT,
};
use crate::error::{CandleError, Result};
use crate::structures::{BitTimingConstants, DeviceConfig, HostConfig};
use crate::usb::UsbTransport;

/// Perform a control OUT transfer
pub(crate) fn control_out(
    transport: &dyn UsbTransport,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
) -> Result<()> {
    transport
        .write_control(request, value, index, data, DEFAULT_CONTROL_TIMEOUT)
        .map_err(|source| CandleError::ControlTransfer { request, source })?;
    Ok(())
}

/// Perform a control IN transfer, rejecting short responses
pub(crate) fn control_in(
    transport: &dyn UsbTransport,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; length];
    let len = transport
        .read_control(request, value, index, &mut buf, DEFAULT_CONTROL_TIMEOUT)
        .map_err(|source| CandleError::ControlTransfer { request, source })?;

    if len < length {
        return Err(CandleError::InvalidResponse {
            expected: length,
            actual: len,
        });
    }

    Ok(buf)
}

/// Declare host byte order on an interface
///
/// Modern firmware ignores this request and some reject it, so a failure
/// is logged and otherwise ignored.
pub fn send_host_format(transport: &dyn UsbTransport, interface_number: u8) -> Result<()> {
    let host_config = HostConfig::default();
    if let Err(e) = control_out(
        transport,
        GS_USB_BREQ_HOST_FORMAT,
        1,
        interface_number as u16,
        &host_config.pack(),
    ) {
        debug!("HOST_FORMAT on interface {} ignored: {}", interface_number, e);
    }
    Ok(())
}

/// Read channel count and firmware/hardware versions of an interface
pub fn read_device_config(
    transport: &dyn UsbTransport,
    interface_number: u8,
) -> Result<DeviceConfig> {
    let data = control_in(
        transport,
        GS_USB_BREQ_DEVICE_CONFIG,
        1,
        interface_number as u16,
        DeviceConfig::SIZE,
    )?;
    DeviceConfig::unpack(&data).ok_or(CandleError::InvalidResponse {
        expected: DeviceConfig::SIZE,
        actual: data.len(),
    })
}

/// Read a channel's capability constants
///
/// FD channels are re-read through BT_CONST_EXT to pick up the data
/// phase limits.
pub fn read_bit_timing_constants(
    transport: &dyn UsbTransport,
    channel: u8,
) -> Result<BitTimingConstants> {
    let data = control_in(
        transport,
        GS_USB_BREQ_BT_CONST,
        channel as u16,
        0,
        BitTimingConstants::SIZE,
    )?;
    let constants = BitTimingConstants::unpack(&data).ok_or(CandleError::InvalidResponse {
        expected: BitTimingConstants::SIZE,
        actual: data.len(),
    })?;

    if !constants.has_feature(GS_CAN_FEATURE_FD) {
        return Ok(constants);
    }

    let data = control_in(
        transport,
        GS_USB_BREQ_BT_CONST_EXT,
        channel as u16,
        0,
        BitTimingConstants::EXTENDED_SIZE,
    )?;
    BitTimingConstants::unpack_extended(&data).ok_or(CandleError::InvalidResponse {
        expected: BitTimingConstants::EXTENDED_SIZE,
        actual: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{GS_CAN_FEATURE_HW_TIMESTAMP, GS_USB_BREQ_GET_STATE};
    use crate::mock::MockTransport;

    #[test]
    fn test_host_format_addresses_interface() {
        let transport = MockTransport::new();
        send_host_format(&transport, 2).unwrap();

        let sent = transport.control_out_log();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request, GS_USB_BREQ_HOST_FORMAT);
        assert_eq!(sent[0].value, 1);
        assert_eq!(sent[0].index, 2);
        assert_eq!(sent[0].data, vec![0xEF, 0xBE, 0, 0]);
    }

    #[test]
    fn test_host_format_failure_ignored() {
        let transport = MockTransport::new();
        transport.fail_control_out(GS_USB_BREQ_HOST_FORMAT, rusb::Error::Pipe);
        assert!(send_host_format(&transport, 0).is_ok());
    }

    #[test]
    fn test_device_config_read() {
        let transport = MockTransport::with_channels(3, GS_CAN_FEATURE_HW_TIMESTAMP);
        let config = read_device_config(&transport, 0).unwrap();
        assert_eq!(config.channel_count(), 3);
    }

    #[test]
    fn test_classic_channel_skips_extended_constants() {
        let transport = MockTransport::with_channels(1, GS_CAN_FEATURE_HW_TIMESTAMP);
        let constants = read_bit_timing_constants(&transport, 0).unwrap();
        assert!(!constants.has_fd_timing());
        assert_eq!(transport.control_in_count(GS_USB_BREQ_BT_CONST_EXT), 0);
    }

    #[test]
    fn test_fd_channel_reads_extended_constants() {
        let transport = MockTransport::with_channels(2, GS_CAN_FEATURE_FD);
        let constants = read_bit_timing_constants(&transport, 1).unwrap();
        assert!(constants.has_fd_timing());
        assert_eq!(transport.control_in_count(GS_USB_BREQ_BT_CONST_EXT), 1);
    }

    #[test]
    fn test_short_response_rejected() {
        let transport = MockTransport::new();
        transport.set_control_in_response(GS_USB_BREQ_GET_STATE, vec![0; 4]);
        let result = control_in(&transport, GS_USB_BREQ_GET_STATE, 0, 0, 12);
        assert!(matches!(
            result,
            Err(CandleError::InvalidResponse {
                expected: 12,
                actual: 4
            })
        ));
    }
}
