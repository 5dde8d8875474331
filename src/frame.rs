//! Host frame wire format
//!
//! A host frame is the 12-byte `HostFrameHeader` followed by the payload
//! zero-padded to 8 (classic) or 64 (FD) bytes, an optional 4-byte
//! hardware timestamp on IN frames, and one pad byte on OUT frames for
//! firmware with the LPC546xx USB quirk.

use crate::constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLC, CANFD_MAX_DLEN, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_ERR_FLAG,
    CAN_MAX_DLC, CAN_MAX_DLEN, CAN_RTR_FLAG, CAN_SFF_MASK, GS_CAN_FLAG_BRS, GS_CAN_FLAG_ESI,
    GS_CAN_FLAG_FD, GS_CAN_FLAG_OVERFLOW, GS_USB_ECHO_ID, GS_USB_FRAME_HEADER_SIZE,
    GS_USB_RX_ECHO_ID, GS_USB_TIMESTAMP_SIZE,
};
use crate::error::{CandleError, Result};

/// Convert a DLC code to its payload length
pub fn dlc_to_len(dlc: u8) -> Option<usize> {
    CANFD_DLC_TO_LEN.get(dlc as usize).copied()
}

/// Convert a payload length to its DLC code; only exact table lengths map
pub fn len_to_dlc(length: usize) -> Option<u8> {
    CANFD_DLC_TO_LEN
        .iter()
        .position(|&dlen| dlen == length)
        .map(|dlc| dlc as u8)
}

/// Smallest FD payload length that holds `length` bytes
fn fd_padded_len(length: usize) -> usize {
    CANFD_DLC_TO_LEN
        .iter()
        .copied()
        .find(|&dlen| dlen >= length)
        .unwrap_or(CANFD_MAX_DLEN)
}

fn set_bit_u8(field: &mut u8, bit: u8, value: bool) {
    if value {
        *field |= bit;
    } else {
        *field &= !bit;
    }
}

fn set_bit_u32(field: &mut u32, bit: u32, value: bool) {
    if value {
        *field |= bit;
    } else {
        *field &= !bit;
    }
}

/// Fixed 12-byte host frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFrameHeader {
    /// `GS_USB_RX_ECHO_ID` for bus frames, otherwise a host-chosen TX correlation id
    pub echo_id: u32,
    /// Arbitration id plus EFF/RTR/ERR flags in the top 3 bits
    pub can_id: u32,
    /// DLC code, not a byte count
    pub can_dlc: u8,
    pub channel: u8,
    /// Combination of GS_CAN_FLAG_* bits
    pub flags: u8,
}

impl HostFrameHeader {
    pub const SIZE: usize = GS_USB_FRAME_HEADER_SIZE;

    pub fn new(echo_id: u32, can_id: u32, can_dlc: u8, channel: u8, flags: u8) -> Self {
        Self {
            echo_id,
            can_id,
            can_dlc,
            channel,
            flags,
        }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.echo_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.can_id.to_le_bytes());
        buf[8] = self.can_dlc;
        buf[9] = self.channel;
        buf[10] = self.flags;
        buf
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            echo_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            can_id: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            can_dlc: data[8],
            channel: data[9],
            flags: data[10],
        })
    }

    /// DLC range fits the frame kind; error frames carry 8 bytes, remote frames none
    pub fn valid(&self) -> bool {
        if self.is_fd() && self.can_dlc > CANFD_MAX_DLC {
            return false;
        }
        if !self.is_fd() && self.can_dlc > CAN_MAX_DLC {
            return false;
        }
        if self.is_error_frame() && self.data_length() != CAN_MAX_DLEN {
            return false;
        }
        if self.is_remote_frame() && self.data_length() != 0 {
            return false;
        }
        true
    }

    /// Arbitration id without flag bits (29 bits if extended, else 11)
    pub fn arbitration_id(&self) -> u32 {
        if self.is_extended_id() {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        }
    }

    /// Payload length for the DLC; out-of-table codes read as the FD maximum
    pub fn data_length(&self) -> usize {
        dlc_to_len(self.can_dlc).unwrap_or(CANFD_MAX_DLEN)
    }

    pub fn set_data_length(&mut self, length: usize) -> Result<()> {
        self.can_dlc = len_to_dlc(length).ok_or(CandleError::InvalidDataLength(length))?;
        Ok(())
    }

    pub fn is_rx(&self) -> bool {
        self.echo_id == GS_USB_RX_ECHO_ID
    }

    pub fn is_overflow(&self) -> bool {
        (self.flags & GS_CAN_FLAG_OVERFLOW) != 0
    }

    pub fn is_fd(&self) -> bool {
        (self.flags & GS_CAN_FLAG_FD) != 0
    }

    pub fn set_fd(&mut self, value: bool) {
        set_bit_u8(&mut self.flags, GS_CAN_FLAG_FD, value);
    }

    pub fn is_bitrate_switch(&self) -> bool {
        (self.flags & GS_CAN_FLAG_BRS) != 0
    }

    pub fn set_bitrate_switch(&mut self, value: bool) {
        set_bit_u8(&mut self.flags, GS_CAN_FLAG_BRS, value);
    }

    pub fn is_error_state_indicator(&self) -> bool {
        (self.flags & GS_CAN_FLAG_ESI) != 0
    }

    pub fn set_error_state_indicator(&mut self, value: bool) {
        set_bit_u8(&mut self.flags, GS_CAN_FLAG_ESI, value);
    }

    pub fn is_extended_id(&self) -> bool {
        (self.can_id & CAN_EFF_FLAG) != 0
    }

    pub fn set_extended_id(&mut self, value: bool) {
        set_bit_u32(&mut self.can_id, CAN_EFF_FLAG, value);
    }

    pub fn is_remote_frame(&self) -> bool {
        (self.can_id & CAN_RTR_FLAG) != 0
    }

    pub fn set_remote_frame(&mut self, value: bool) {
        set_bit_u32(&mut self.can_id, CAN_RTR_FLAG, value);
    }

    pub fn is_error_frame(&self) -> bool {
        (self.can_id & CAN_ERR_FLAG) != 0
    }

    pub fn set_error_frame(&mut self, value: bool) {
        set_bit_u32(&mut self.can_id, CAN_ERR_FLAG, value);
    }
}

/// One CAN or CAN FD frame exchanged with the adapter
#[derive(Clone, PartialEq, Eq)]
pub struct HostFrame {
    pub header: HostFrameHeader,
    /// Payload bytes (empty for remote frames)
    pub data: Vec<u8>,
    /// Hardware timestamp in microseconds (0 when not negotiated)
    pub timestamp_us: u32,
}

impl HostFrame {
    pub fn new(header: HostFrameHeader, data: Vec<u8>) -> Self {
        Self {
            header,
            data,
            timestamp_us: 0,
        }
    }

    /// Classic CAN frame; data beyond 8 bytes is cut off
    ///
    /// # Arguments
    /// * `channel` - Target channel index
    /// * `can_id` - CAN identifier (with flags like CAN_EFF_FLAG if needed)
    /// * `data` - Payload, up to 8 bytes
    pub fn classic(channel: u8, can_id: u32, data: &[u8]) -> Self {
        let len = data.len().min(CAN_MAX_DLEN);
        let header = HostFrameHeader::new(GS_USB_ECHO_ID, can_id, len as u8, channel, 0);
        Self::new(header, data[..len].to_vec())
    }

    /// CAN FD frame; data is zero-padded up to the next DLC length
    ///
    /// # Arguments
    /// * `channel` - Target channel index
    /// * `can_id` - CAN identifier (with flags like CAN_EFF_FLAG if needed)
    /// * `data` - Payload, up to 64 bytes
    /// * `brs` - Transmit the data phase at the data bitrate
    pub fn fd(channel: u8, can_id: u32, data: &[u8], brs: bool) -> Self {
        let len = data.len().min(CANFD_MAX_DLEN);
        let padded_len = fd_padded_len(len);
        let mut payload = data[..len].to_vec();
        payload.resize(padded_len, 0);

        let mut header = HostFrameHeader::new(GS_USB_ECHO_ID, can_id, 0, channel, GS_CAN_FLAG_FD);
        header.set_bitrate_switch(brs);
        header.can_dlc = len_to_dlc(padded_len).unwrap_or(CANFD_MAX_DLC);
        Self::new(header, payload)
    }

    /// Set the echo id used to match the device's TX echo
    pub fn with_echo_id(mut self, echo_id: u32) -> Self {
        self.header.echo_id = echo_id;
        self
    }

    /// Header is valid and, unless remote, the payload covers the DLC length
    pub fn valid(&self) -> bool {
        if !self.header.valid() {
            return false;
        }
        if !self.header.is_remote_frame() && self.data.len() < self.header.data_length() {
            return false;
        }
        true
    }

    /// Payload as a slice of the DLC length
    pub fn payload(&self) -> &[u8] {
        let len = self.header.data_length().min(self.data.len());
        &self.data[..len]
    }

    /// Timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp_us as f64 / 1_000_000.0
    }

    /// Encode for a bulk OUT transfer
    ///
    /// # Arguments
    /// * `is_quirk_device` - Append the pad byte LPC546xx firmware expects
    pub fn pack(&self, is_quirk_device: bool) -> Vec<u8> {
        let width = if self.header.is_fd() {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        let mut buf = Vec::with_capacity(HostFrameHeader::SIZE + width + 1);
        buf.extend_from_slice(&self.header.pack());

        let mut payload = [0u8; CANFD_MAX_DLEN];
        let copy_len = self.data.len().min(width);
        payload[..copy_len].copy_from_slice(&self.data[..copy_len]);
        buf.extend_from_slice(&payload[..width]);

        if is_quirk_device {
            buf.push(0);
        }
        buf
    }

    /// Decode a bulk IN transfer
    ///
    /// Returns `None` for truncated or invalid frames.
    ///
    /// # Arguments
    /// * `raw` - Bytes received from the device
    /// * `hw_timestamp` - The transfer ends with a 4-byte timestamp
    pub fn unpack(raw: &[u8], hw_timestamp: bool) -> Option<Self> {
        let header = HostFrameHeader::unpack(raw)?;
        if !header.valid() {
            return None;
        }

        let data = if header.is_remote_frame() {
            Vec::new()
        } else {
            let start = HostFrameHeader::SIZE;
            let end = (start + header.data_length()).min(raw.len());
            raw[start..end].to_vec()
        };

        let mut frame = Self::new(header, data);
        if !frame.valid() {
            return None;
        }

        if hw_timestamp && raw.len() >= HostFrameHeader::SIZE + GS_USB_TIMESTAMP_SIZE {
            let ts = &raw[raw.len() - GS_USB_TIMESTAMP_SIZE..];
            frame.timestamp_us = u32::from_le_bytes([ts[0], ts[1], ts[2], ts[3]]);
        }
        Some(frame)
    }
}

impl std::fmt::Display for HostFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fd_indicator = if self.header.is_fd() { " FD" } else { "" };
        let brs_indicator = if self.header.is_bitrate_switch() {
            " BRS"
        } else {
            ""
        };

        let data_str = if self.header.is_remote_frame() {
            "remote request".to_string()
        } else {
            self.payload()
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };

        write!(
            f,
            "ch{} {:>8X}{}{}   [{}]  {}",
            self.header.channel,
            self.header.arbitration_id(),
            fd_indicator,
            brs_indicator,
            self.header.data_length(),
            data_str
        )
    }
}

impl std::fmt::Debug for HostFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFrame")
            .field("echo_id", &format_args!("0x{:08X}", self.header.echo_id))
            .field("can_id", &format_args!("0x{:08X}", self.header.can_id))
            .field("can_dlc", &self.header.can_dlc)
            .field("channel", &self.header.channel)
            .field("flags", &format_args!("0x{:02X}", self.header.flags))
            .field("data_length", &self.header.data_length())
            .field("is_rx", &self.header.is_rx())
            .field("timestamp_us", &self.timestamp_us)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlc_round_trip() {
        for dlc in 0..=15u8 {
            let len = dlc_to_len(dlc).unwrap();
            assert_eq!(len_to_dlc(len), Some(dlc));
        }
        assert_eq!(dlc_to_len(16), None);
    }

    #[test]
    fn test_len_to_dlc_requires_exact_length() {
        assert_eq!(len_to_dlc(12), Some(9));
        assert_eq!(len_to_dlc(64), Some(15));
        assert_eq!(len_to_dlc(10), None);
        assert_eq!(len_to_dlc(65), None);
    }

    #[test]
    fn test_header_pack_unpack() {
        let header = HostFrameHeader::new(0x1234_5678, CAN_EFF_FLAG | 0x1ABCDE, 15, 3, 0x0E);
        let packed = header.pack();
        assert_eq!(packed[11], 0);
        assert_eq!(HostFrameHeader::unpack(&packed), Some(header));
        assert_eq!(HostFrameHeader::unpack(&packed[..11]), None);
    }

    #[test]
    fn test_rx_standard_frame() {
        let header = HostFrameHeader::new(GS_USB_RX_ECHO_ID, 0x123, 8, 0, 0);
        let frame = HostFrame::new(header, vec![0; 8]);
        assert!(frame.valid());
        assert!(frame.header.is_rx());
        assert!(!frame.header.is_extended_id());
        assert_eq!(frame.header.arbitration_id(), 0x123);
        assert_eq!(frame.header.data_length(), 8);
    }

    #[test]
    fn test_extended_id_masked() {
        let header = HostFrameHeader::new(GS_USB_RX_ECHO_ID, 0x1ABCDE | CAN_EFF_FLAG, 8, 0, 0);
        assert!(header.is_extended_id());
        assert_eq!(header.arbitration_id(), 0x1ABCDE);

        // standard ids drop everything above 11 bits
        let header = HostFrameHeader::new(GS_USB_RX_ECHO_ID, 0x1ABCDE, 8, 0, 0);
        assert_eq!(header.arbitration_id(), 0x4DE);
    }

    #[test]
    fn test_classic_dlc_above_8_invalid() {
        for dlc in 9..=15u8 {
            let header = HostFrameHeader::new(0, 0x100, dlc, 0, 0);
            assert!(!header.valid());
            let mut fd = header;
            fd.set_fd(true);
            assert!(fd.valid());
        }
        let mut fd = HostFrameHeader::new(0, 0x100, 16, 0, 0);
        fd.set_fd(true);
        assert!(!fd.valid());
    }

    #[test]
    fn test_error_frame_needs_8_bytes() {
        for dlc in 0..=8u8 {
            let header = HostFrameHeader::new(GS_USB_RX_ECHO_ID, CAN_ERR_FLAG | 0x4, dlc, 0, 0);
            assert_eq!(header.valid(), dlc == 8);
        }
    }

    #[test]
    fn test_remote_frame_needs_zero_length() {
        for dlc in 0..=8u8 {
            let header = HostFrameHeader::new(0, CAN_RTR_FLAG | 0x7FF, dlc, 0, 0);
            assert_eq!(header.valid(), dlc == 0);
        }
    }

    #[test]
    fn test_short_payload_invalid() {
        let header = HostFrameHeader::new(0, 0x100, 8, 0, 0);
        assert!(!HostFrame::new(header, vec![1, 2, 3]).valid());
    }

    #[test]
    fn test_header_flag_setters() {
        let mut header = HostFrameHeader::new(0, 0x100, 0, 0, 0);
        header.set_extended_id(true);
        header.set_remote_frame(true);
        header.set_bitrate_switch(true);
        header.set_error_state_indicator(true);
        assert_eq!(header.can_id, 0x100 | CAN_EFF_FLAG | CAN_RTR_FLAG);
        assert_eq!(header.flags, GS_CAN_FLAG_BRS | GS_CAN_FLAG_ESI);
        header.set_remote_frame(false);
        assert!(!header.is_remote_frame());

        header.set_data_length(48).unwrap();
        assert_eq!(header.can_dlc, 14);
        assert!(matches!(
            header.set_data_length(49),
            Err(CandleError::InvalidDataLength(49))
        ));
    }

    #[test]
    fn test_fd_constructor_pads_to_dlc_length() {
        let frame = HostFrame::fd(1, 0x321, &[0xAA; 10], true);
        assert_eq!(frame.header.can_dlc, 9);
        assert_eq!(frame.data.len(), 12);
        assert!(frame.header.is_fd());
        assert!(frame.header.is_bitrate_switch());
        assert!(frame.valid());
    }

    #[test]
    fn test_pack_classic_and_quirk() {
        let frame = HostFrame::classic(0, 0x7FF, &[0x12, 0x34]).with_echo_id(7);
        let packed = frame.pack(false);
        assert_eq!(packed.len(), 20);
        assert_eq!(&packed[0..4], &[7, 0, 0, 0]);
        assert_eq!(packed[8], 2);
        assert_eq!(&packed[12..16], &[0x12, 0x34, 0, 0]);

        assert_eq!(frame.pack(true).len(), 21);
        assert_eq!(HostFrame::fd(0, 0x1, &[0; 64], false).pack(false).len(), 76);
    }

    #[test]
    fn test_unpack_with_timestamp() {
        let mut raw = HostFrame::classic(0, 0x123, &[1, 2, 3, 4, 5, 6, 7, 8])
            .with_echo_id(GS_USB_RX_ECHO_ID)
            .pack(false);
        raw.extend_from_slice(&1_500_000u32.to_le_bytes());

        let frame = HostFrame::unpack(&raw, true).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.timestamp_us, 1_500_000);
        assert_eq!(frame.timestamp(), 1.5);

        let frame = HostFrame::unpack(&raw, false).unwrap();
        assert_eq!(frame.timestamp_us, 0);
    }

    #[test]
    fn test_unpack_rejects_malformed() {
        assert!(HostFrame::unpack(&[0u8; 11], false).is_none());

        // header claims 8 bytes, only 4 arrived
        let raw = HostFrame::classic(0, 0x123, &[0; 8]).pack(false);
        assert!(HostFrame::unpack(&raw[..16], false).is_none());

        // classic frame with an FD-only DLC
        let mut raw = raw.clone();
        raw[8] = 12;
        assert!(HostFrame::unpack(&raw, false).is_none());
    }

    #[test]
    fn test_unpack_remote_frame_has_no_payload() {
        let header = HostFrameHeader::new(GS_USB_RX_ECHO_ID, CAN_RTR_FLAG | 0x55, 0, 0, 0);
        let raw = HostFrame::new(header, Vec::new()).pack(false);
        let frame = HostFrame::unpack(&raw, false).unwrap();
        assert!(frame.data.is_empty());
        assert_eq!(frame.to_string(), "ch0       55   [0]  remote request");
    }
}
