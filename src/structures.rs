//! gs_usb control structures
//!
//! Fixed little-endian layouts exchanged over vendor control requests:
//! host format, device config, bit timing constants, mode, bit timing,
//! termination and state. Every `unpack` rejects truncated input with
//! `None` and never decodes a partial structure.

use crate::constants::{
    GS_CAN_STATE_BUS_OFF, GS_CAN_STATE_ERROR_ACTIVE, GS_CAN_STATE_ERROR_PASSIVE,
    GS_CAN_STATE_ERROR_WARNING, GS_CAN_STATE_SLEEPING, GS_CAN_STATE_STOPPED,
    GS_CAN_TERMINATION_ENABLED_OHMS, GS_CAN_TERMINATION_STATE_OFF, GS_CAN_TERMINATION_STATE_ON,
    GS_USB_HOST_FORMAT_MAGIC,
};

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Host byte order declaration sent once per interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub byte_order: u32,
}

impl HostConfig {
    pub const SIZE: usize = 4;

    pub fn pack(&self) -> [u8; Self::SIZE] {
        self.byte_order.to_le_bytes()
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            byte_order: read_u32(data, 0),
        })
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            byte_order: GS_USB_HOST_FORMAT_MAGIC,
        }
    }
}

/// Interface configuration from DEVICE_CONFIG
///
/// Wire layout is three reserved bytes, `icount`, then two u32 versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Highest channel index (channel count - 1)
    pub icount: u8,
    /// Firmware version (multiply by 0.1 for actual version)
    pub sw_version: u32,
    /// Hardware version (multiply by 0.1 for actual version)
    pub hw_version: u32,
}

impl DeviceConfig {
    pub const SIZE: usize = 12;

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            icount: data[3],
            sw_version: read_u32(data, 4),
            hw_version: read_u32(data, 8),
        })
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[3] = self.icount;
        write_u32(&mut buf, 4, self.sw_version);
        write_u32(&mut buf, 8, self.hw_version);
        buf
    }

    /// Number of CAN channels on the interface (`icount` is the highest index)
    pub fn channel_count(&self) -> u16 {
        u16::from(self.icount) + 1
    }

    pub fn firmware_version(&self) -> f32 {
        self.sw_version as f32 / 10.0
    }

    pub fn hardware_version(&self) -> f32 {
        self.hw_version as f32 / 10.0
    }
}

impl std::fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "iCount: {}\nFW Version: {:.1}\nHW Version: {:.1}",
            self.icount,
            self.firmware_version(),
            self.hardware_version()
        )
    }
}

/// Data phase limits carried by BT_CONST_EXT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBitTimingConstants {
    pub dtseg1_min: u32,
    pub dtseg1_max: u32,
    pub dtseg2_min: u32,
    pub dtseg2_max: u32,
    pub dsjw_max: u32,
    pub dbrp_min: u32,
    pub dbrp_max: u32,
    pub dbrp_inc: u32,
}

/// Channel capability and bit timing limits
///
/// Built from BT_CONST (40 bytes). FD channels replace it with
/// BT_CONST_EXT (72 bytes), which fills `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimingConstants {
    /// Feature bitfield (combination of GS_CAN_FEATURE_* constants)
    pub feature: u32,
    /// CAN clock frequency in Hz
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
    /// Data phase limits, present only when read via BT_CONST_EXT
    pub data: Option<DataBitTimingConstants>,
}

impl BitTimingConstants {
    pub const SIZE: usize = 40;
    pub const EXTENDED_SIZE: usize = 72;

    /// Unpack from a BT_CONST response
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            feature: read_u32(data, 0),
            fclk_can: read_u32(data, 4),
            tseg1_min: read_u32(data, 8),
            tseg1_max: read_u32(data, 12),
            tseg2_min: read_u32(data, 16),
            tseg2_max: read_u32(data, 20),
            sjw_max: read_u32(data, 24),
            brp_min: read_u32(data, 28),
            brp_max: read_u32(data, 32),
            brp_inc: read_u32(data, 36),
            data: None,
        })
    }

    /// Unpack from a BT_CONST_EXT response
    pub fn unpack_extended(data: &[u8]) -> Option<Self> {
        if data.len() < Self::EXTENDED_SIZE {
            return None;
        }
        let mut constants = Self::unpack(data)?;
        constants.data = Some(DataBitTimingConstants {
            dtseg1_min: read_u32(data, 40),
            dtseg1_max: read_u32(data, 44),
            dtseg2_min: read_u32(data, 48),
            dtseg2_max: read_u32(data, 52),
            dsjw_max: read_u32(data, 56),
            dbrp_min: read_u32(data, 60),
            dbrp_max: read_u32(data, 64),
            dbrp_inc: read_u32(data, 68),
        });
        Some(constants)
    }

    /// Pack the nominal part (BT_CONST layout)
    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let fields = [
            self.feature,
            self.fclk_can,
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc,
        ];
        for (i, value) in fields.iter().enumerate() {
            write_u32(&mut buf, i * 4, *value);
        }
        buf
    }

    /// Pack into the BT_CONST_EXT layout; absent data limits are zero
    pub fn pack_extended(&self) -> [u8; Self::EXTENDED_SIZE] {
        let mut buf = [0u8; Self::EXTENDED_SIZE];
        buf[..Self::SIZE].copy_from_slice(&self.pack());
        if let Some(d) = self.data {
            let fields = [
                d.dtseg1_min,
                d.dtseg1_max,
                d.dtseg2_min,
                d.dtseg2_max,
                d.dsjw_max,
                d.dbrp_min,
                d.dbrp_max,
                d.dbrp_inc,
            ];
            for (i, value) in fields.iter().enumerate() {
                write_u32(&mut buf, Self::SIZE + i * 4, *value);
            }
        }
        buf
    }

    pub fn has_feature(&self, feature: u32) -> bool {
        (self.feature & feature) != 0
    }

    /// Check if CAN FD data phase timing is available
    pub fn has_fd_timing(&self) -> bool {
        self.data.is_some()
    }

    pub fn clock_mhz(&self) -> f32 {
        self.fclk_can as f32 / 1_000_000.0
    }
}

impl std::fmt::Display for BitTimingConstants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Feature bitfield: 0x{:08x}\n\
             Clock: {} Hz ({:.1} MHz)\n\
             TSEG1: {} - {}\n\
             TSEG2: {} - {}\n\
             SJW (max): {}\n\
             BRP: {} - {} (inc: {})",
            self.feature,
            self.fclk_can,
            self.clock_mhz(),
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc
        )?;

        if let Some(d) = self.data {
            write!(
                f,
                "\nData Phase (CAN FD):\n\
                   DTSEG1: {} - {}\n\
                   DTSEG2: {} - {}\n\
                   DSJW (max): {}\n\
                   DBRP: {} - {} (inc: {})",
                d.dtseg1_min,
                d.dtseg1_max,
                d.dtseg2_min,
                d.dtseg2_max,
                d.dsjw_max,
                d.dbrp_min,
                d.dbrp_max,
                d.dbrp_inc
            )?;
        }

        Ok(())
    }
}

/// Start/reset request for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode {
    /// GS_CAN_MODE_RESET or GS_CAN_MODE_START
    pub mode: u32,
    /// Combination of GS_CAN_MODE_* flags
    pub flags: u32,
}

impl DeviceMode {
    pub const SIZE: usize = 8;

    pub fn new(mode: u32, flags: u32) -> Self {
        Self { mode, flags }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_u32(&mut buf, 0, self.mode);
        write_u32(&mut buf, 4, self.flags);
        buf
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self::new(read_u32(data, 0), read_u32(data, 4)))
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mode: {}\nFlags: 0x{:08x}", self.mode, self.flags)
    }
}

/// CAN bit timing, used for both nominal and data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Propagation segment (typically 1)
    pub prop_seg: u32,
    /// Phase segment 1
    pub phase_seg1: u32,
    /// Phase segment 2
    pub phase_seg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
    /// Baud rate prescaler
    pub brp: u32,
}

impl BitTiming {
    pub const SIZE: usize = 20;

    pub fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_u32(&mut buf, 0, self.prop_seg);
        write_u32(&mut buf, 4, self.phase_seg1);
        write_u32(&mut buf, 8, self.phase_seg2);
        write_u32(&mut buf, 12, self.sjw);
        write_u32(&mut buf, 16, self.brp);
        buf
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self::new(
            read_u32(data, 0),
            read_u32(data, 4),
            read_u32(data, 8),
            read_u32(data, 12),
            read_u32(data, 16),
        ))
    }

    /// Bitrate this timing produces for the given CAN clock
    ///
    /// Raw timings are not validated, so `None` is returned when the
    /// fields do not describe a usable bit (zero prescaler or overflow).
    pub fn bitrate(&self, clock_hz: u32) -> Option<u32> {
        let tq_per_bit = 1u64
            .checked_add(u64::from(self.prop_seg))?
            .checked_add(u64::from(self.phase_seg1))?
            .checked_add(u64::from(self.phase_seg2))?;
        let divisor = u64::from(self.brp).checked_mul(tq_per_bit)?;
        if divisor == 0 {
            return None;
        }
        u32::try_from(u64::from(clock_hz) / divisor).ok()
    }
}

impl std::fmt::Display for BitTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Prop Seg: {}\nPhase Seg 1: {}\nPhase Seg 2: {}\nSJW: {}\nBRP: {}",
            self.prop_seg, self.phase_seg1, self.phase_seg2, self.sjw, self.brp
        )
    }
}

/// Termination resistor setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationState {
    pub state: u32,
}

impl TerminationState {
    pub const SIZE: usize = 4;

    pub fn new(enabled: bool) -> Self {
        let state = if enabled {
            GS_CAN_TERMINATION_STATE_ON
        } else {
            GS_CAN_TERMINATION_STATE_OFF
        };
        Self { state }
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        self.state.to_le_bytes()
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            state: read_u32(data, 0),
        })
    }

    /// Some firmware reports the resistance in ohms instead of ON
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.state,
            GS_CAN_TERMINATION_STATE_ON | GS_CAN_TERMINATION_ENABLED_OHMS
        )
    }
}

/// Bus state reported by GET_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanState {
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
    Stopped,
    Sleeping,
    Unknown(u32),
}

impl CanState {
    pub fn name(&self) -> &'static str {
        match self {
            CanState::ErrorActive => "ERROR_ACTIVE",
            CanState::ErrorWarning => "ERROR_WARNING",
            CanState::ErrorPassive => "ERROR_PASSIVE",
            CanState::BusOff => "BUS_OFF",
            CanState::Stopped => "STOPPED",
            CanState::Sleeping => "SLEEPING",
            CanState::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u32> for CanState {
    fn from(value: u32) -> Self {
        match value {
            GS_CAN_STATE_ERROR_ACTIVE => CanState::ErrorActive,
            GS_CAN_STATE_ERROR_WARNING => CanState::ErrorWarning,
            GS_CAN_STATE_ERROR_PASSIVE => CanState::ErrorPassive,
            GS_CAN_STATE_BUS_OFF => CanState::BusOff,
            GS_CAN_STATE_STOPPED => CanState::Stopped,
            GS_CAN_STATE_SLEEPING => CanState::Sleeping,
            other => CanState::Unknown(other),
        }
    }
}

impl From<CanState> for u32 {
    fn from(state: CanState) -> Self {
        match state {
            CanState::ErrorActive => GS_CAN_STATE_ERROR_ACTIVE,
            CanState::ErrorWarning => GS_CAN_STATE_ERROR_WARNING,
            CanState::ErrorPassive => GS_CAN_STATE_ERROR_PASSIVE,
            CanState::BusOff => GS_CAN_STATE_BUS_OFF,
            CanState::Stopped => GS_CAN_STATE_STOPPED,
            CanState::Sleeping => GS_CAN_STATE_SLEEPING,
            CanState::Unknown(raw) => raw,
        }
    }
}

impl std::fmt::Display for CanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Bus state and error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub state: CanState,
    /// RX error counter
    pub rxerr: u32,
    /// TX error counter
    pub txerr: u32,
}

impl DeviceState {
    pub const SIZE: usize = 12;

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            state: CanState::from(read_u32(data, 0)),
            rxerr: read_u32(data, 4),
            txerr: read_u32(data, 8),
        })
    }

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_u32(&mut buf, 0, self.state.into());
        write_u32(&mut buf, 4, self.rxerr);
        write_u32(&mut buf, 8, self.txerr);
        buf
    }

    pub fn is_error_active(&self) -> bool {
        self.state == CanState::ErrorActive
    }

    pub fn is_bus_off(&self) -> bool {
        self.state == CanState::BusOff
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "State: {}\nRX Error Counter: {}\nTX Error Counter: {}",
            self.state, self.rxerr, self.txerr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_magic() {
        assert_eq!(HostConfig::default().pack(), [0xEF, 0xBE, 0, 0]);
    }

    #[test]
    fn test_device_mode_pack() {
        let mode = DeviceMode::new(1, 0x100);
        let packed = mode.pack();
        assert_eq!(packed[0..4], [1, 0, 0, 0]);
        assert_eq!(packed[4..8], [0, 1, 0, 0]);
    }

    #[test]
    fn test_bit_timing_pack() {
        let timing = BitTiming::new(1, 12, 2, 1, 6);
        let packed = timing.pack();
        assert_eq!(packed[0..4], [1, 0, 0, 0]); // prop_seg
        assert_eq!(packed[4..8], [12, 0, 0, 0]); // phase_seg1
        assert_eq!(packed[8..12], [2, 0, 0, 0]); // phase_seg2
        assert_eq!(packed[12..16], [1, 0, 0, 0]); // sjw
        assert_eq!(packed[16..20], [6, 0, 0, 0]); // brp
        assert_eq!(timing.bitrate(48_000_000), Some(500_000));
    }

    #[test]
    fn test_bit_timing_bitrate_extreme_fields() {
        assert_eq!(BitTiming::new(u32::MAX, 1, 1, 1, 1).bitrate(48_000_000), Some(0));
        assert_eq!(
            BitTiming::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX, u32::MAX).bitrate(u32::MAX),
            None
        );
        assert_eq!(BitTiming::new(1, 12, 2, 1, 0).bitrate(48_000_000), None);
    }

    #[test]
    fn test_device_config_max_channels() {
        let config = DeviceConfig {
            icount: 255,
            sw_version: 0,
            hw_version: 0,
        };
        assert_eq!(config.channel_count(), 256);
    }

    #[test]
    fn test_device_config_unpack() {
        let data = [0, 0, 0, 1, 20, 0, 0, 0, 10, 0, 0, 0];
        let config = DeviceConfig::unpack(&data).unwrap();
        assert_eq!(config.icount, 1);
        assert_eq!(config.channel_count(), 2);
        assert_eq!(config.sw_version, 20);
        assert_eq!(config.firmware_version(), 2.0);
        assert_eq!(config.hardware_version(), 1.0);
        assert_eq!(config.pack(), data);
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(DeviceConfig::unpack(&[0; 11]).is_none());
        assert!(BitTimingConstants::unpack(&[0; 39]).is_none());
        assert!(BitTimingConstants::unpack_extended(&[0; 40]).is_none());
        assert!(DeviceState::unpack(&[0; 8]).is_none());
        assert!(TerminationState::unpack(&[0; 3]).is_none());
        assert!(HostConfig::unpack(&[]).is_none());
    }

    #[test]
    fn test_bt_const_extended_unpack() {
        let mut data = [0u8; 72];
        for i in 0..18u32 {
            data[i as usize * 4] = i as u8 + 1;
        }
        let constants = BitTimingConstants::unpack_extended(&data).unwrap();
        assert_eq!(constants.feature, 1);
        assert_eq!(constants.brp_inc, 10);
        let d = constants.data.unwrap();
        assert_eq!(d.dtseg1_min, 11);
        assert_eq!(d.dbrp_inc, 18);
        assert_eq!(constants.pack_extended(), data);

        let nominal = BitTimingConstants::unpack(&data).unwrap();
        assert!(!nominal.has_fd_timing());
    }

    #[test]
    fn test_device_state_unpack() {
        let data = [1, 0, 0, 0, 50, 0, 0, 0, 25, 0, 0, 0];
        let state = DeviceState::unpack(&data).unwrap();
        assert_eq!(state.state, CanState::ErrorWarning);
        assert_eq!(state.rxerr, 50);
        assert_eq!(state.txerr, 25);
        assert_eq!(state.state.name(), "ERROR_WARNING");

        let odd = DeviceState::unpack(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(odd.state, CanState::Unknown(9));
        assert_eq!(odd.pack()[0], 9);
    }

    #[test]
    fn test_termination_state() {
        assert_eq!(TerminationState::new(true).pack(), [1, 0, 0, 0]);
        assert_eq!(TerminationState::new(false).pack(), [0, 0, 0, 0]);
        assert!(TerminationState::unpack(&[120, 0, 0, 0]).unwrap().is_enabled());
        assert!(!TerminationState::unpack(&[0, 0, 0, 0]).unwrap().is_enabled());
    }
}
