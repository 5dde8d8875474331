//! gs_usb protocol constants
//!
//! Request codes, mode/feature/frame flags, CAN identifier bits, frame
//! sizes and the allowlist of adapters this driver talks to.

use std::time::Duration;

// ============================================================================
// Control Request Codes (bRequest)
// ============================================================================

/// Declare host byte order
pub const GS_USB_BREQ_HOST_FORMAT: u8 = 0;
/// Set nominal bit timing
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
/// Start/reset a channel
pub const GS_USB_BREQ_MODE: u8 = 2;
/// Get bus errors
pub const GS_USB_BREQ_BERR: u8 = 3;
/// Get bit timing constants
pub const GS_USB_BREQ_BT_CONST: u8 = 4;
/// Get device configuration
pub const GS_USB_BREQ_DEVICE_CONFIG: u8 = 5;
/// Get timestamp
pub const GS_USB_BREQ_TIMESTAMP: u8 = 6;
/// Identify device (blink LED)
pub const GS_USB_BREQ_IDENTIFY: u8 = 7;
/// Get user ID. CANtact Pro firmware answers data bit timing here.
pub const GS_USB_BREQ_GET_USER_ID: u8 = 8;
/// Set user ID
pub const GS_USB_BREQ_SET_USER_ID: u8 = 9;
/// Set data phase bit timing (CAN FD)
pub const GS_USB_BREQ_DATA_BITTIMING: u8 = 10;
/// Get extended bit timing constants (CAN FD)
pub const GS_USB_BREQ_BT_CONST_EXT: u8 = 11;
/// Set termination
pub const GS_USB_BREQ_SET_TERMINATION: u8 = 12;
/// Get termination
pub const GS_USB_BREQ_GET_TERMINATION: u8 = 13;
/// Get CAN state
pub const GS_USB_BREQ_GET_STATE: u8 = 14;

/// bmRequestType: vendor, host-to-device, interface recipient
pub const GS_USB_REQ_TYPE_OUT: u8 = 0x41;
/// bmRequestType: vendor, device-to-host, interface recipient
pub const GS_USB_REQ_TYPE_IN: u8 = 0xC1;

// ============================================================================
// Mode Control (DeviceMode.mode)
// ============================================================================

/// Reset/stop the channel
pub const GS_CAN_MODE_RESET: u32 = 0;
/// Start the channel
pub const GS_CAN_MODE_START: u32 = 1;

// ============================================================================
// Mode Flags (DeviceMode.flags)
// ============================================================================

/// Normal operation mode
pub const GS_CAN_MODE_NORMAL: u32 = 0;
/// Listen-only mode (no ACKs sent)
pub const GS_CAN_MODE_LISTEN_ONLY: u32 = 1 << 0;
/// Loopback mode
pub const GS_CAN_MODE_LOOP_BACK: u32 = 1 << 1;
/// Triple sample mode
pub const GS_CAN_MODE_TRIPLE_SAMPLE: u32 = 1 << 2;
/// One-shot mode (no retransmission)
pub const GS_CAN_MODE_ONE_SHOT: u32 = 1 << 3;
/// Hardware timestamp mode
pub const GS_CAN_MODE_HW_TIMESTAMP: u32 = 1 << 4;
/// Pad packets to max packet size
pub const GS_CAN_MODE_PAD_PKTS_TO_MAX_PKT_SIZE: u32 = 1 << 7;
/// CAN FD mode
pub const GS_CAN_MODE_FD: u32 = 1 << 8;
/// Bus error reporting
pub const GS_CAN_MODE_BERR_REPORTING: u32 = 1 << 12;

// ============================================================================
// Feature Flags (BitTimingConstants.feature)
// ============================================================================

/// Channel supports listen-only mode
pub const GS_CAN_FEATURE_LISTEN_ONLY: u32 = 1 << 0;
/// Channel supports loopback mode
pub const GS_CAN_FEATURE_LOOP_BACK: u32 = 1 << 1;
/// Channel supports triple sample mode
pub const GS_CAN_FEATURE_TRIPLE_SAMPLE: u32 = 1 << 2;
/// Channel supports one-shot mode
pub const GS_CAN_FEATURE_ONE_SHOT: u32 = 1 << 3;
/// Channel supports hardware timestamps
pub const GS_CAN_FEATURE_HW_TIMESTAMP: u32 = 1 << 4;
/// Channel supports identify (LED blink)
pub const GS_CAN_FEATURE_IDENTIFY: u32 = 1 << 5;
/// Channel supports user ID
pub const GS_CAN_FEATURE_USER_ID: u32 = 1 << 6;
/// Channel supports packet padding
pub const GS_CAN_FEATURE_PAD_PKTS_TO_MAX_PKT_SIZE: u32 = 1 << 7;
/// Channel supports CAN FD
pub const GS_CAN_FEATURE_FD: u32 = 1 << 8;
/// Firmware needs one trailing pad byte on OUT frames (LPC546xx USB bug)
pub const GS_CAN_FEATURE_REQ_USB_QUIRK_LPC546XX: u32 = 1 << 9;
/// Channel supports extended bit timing constants
pub const GS_CAN_FEATURE_BT_CONST_EXT: u32 = 1 << 10;
/// Channel supports termination control
pub const GS_CAN_FEATURE_TERMINATION: u32 = 1 << 11;
/// Channel supports bus error reporting
pub const GS_CAN_FEATURE_BERR_REPORTING: u32 = 1 << 12;
/// Channel supports GET_STATE request
pub const GS_CAN_FEATURE_GET_STATE: u32 = 1 << 13;
/// CANtact Pro firmware: DATA_BITTIMING collides with GET_USER_ID
pub const GS_CAN_FEATURE_QUIRK_BREQ_CANTACT_PRO: u32 = 1 << 31;

// ============================================================================
// Frame Flags (HostFrameHeader.flags)
// ============================================================================

/// RX overflow occurred
pub const GS_CAN_FLAG_OVERFLOW: u8 = 1 << 0;
/// CAN FD frame
pub const GS_CAN_FLAG_FD: u8 = 1 << 1;
/// Bit rate switch (FD data phase at data bitrate)
pub const GS_CAN_FLAG_BRS: u8 = 1 << 2;
/// Error state indicator
pub const GS_CAN_FLAG_ESI: u8 = 1 << 3;

// ============================================================================
// CAN ID Flags and Masks
// ============================================================================

/// Extended frame format flag (29-bit ID)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Standard frame format mask (11-bit ID)
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask (29-bit ID)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Error class mask (omit EFF, RTR, ERR flags)
pub const CAN_ERR_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// Payload Definitions
// ============================================================================

/// Maximum DLC for classic CAN
pub const CAN_MAX_DLC: u8 = 8;
/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum DLC for CAN FD
pub const CANFD_MAX_DLC: u8 = 15;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;

/// DLC to data length table (identity up to 8, FD steps above)
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// ============================================================================
// Host Frame Layout
// ============================================================================

/// Echo ID marking a frame received from the bus
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;
/// Default echo ID for frames built by the host
pub const GS_USB_ECHO_ID: u32 = 0;

/// echo_id(4) + can_id(4) + can_dlc(1) + channel(1) + flags(1) + reserved(1)
pub const GS_USB_FRAME_HEADER_SIZE: usize = 12;
/// Hardware timestamp trailer size
pub const GS_USB_TIMESTAMP_SIZE: usize = 4;
/// Full-speed bulk packet size; longer FD frames may arrive split at this boundary
pub const USB_FS_MAX_PACKET_SIZE: usize = 64;

/// HostConfig.byte_order magic
pub const GS_USB_HOST_FORMAT_MAGIC: u32 = 0x0000_BEEF;

// ============================================================================
// CAN State (DeviceState.state)
// ============================================================================

/// Normal operation
pub const GS_CAN_STATE_ERROR_ACTIVE: u32 = 0;
/// TEC/REC > 96
pub const GS_CAN_STATE_ERROR_WARNING: u32 = 1;
/// TEC/REC > 127
pub const GS_CAN_STATE_ERROR_PASSIVE: u32 = 2;
/// TEC > 255
pub const GS_CAN_STATE_BUS_OFF: u32 = 3;
/// Channel stopped
pub const GS_CAN_STATE_STOPPED: u32 = 4;
/// Channel sleeping
pub const GS_CAN_STATE_SLEEPING: u32 = 5;

// ============================================================================
// Termination (TerminationState.state)
// ============================================================================

/// Termination resistor off
pub const GS_CAN_TERMINATION_STATE_OFF: u32 = 0;
/// Termination resistor on
pub const GS_CAN_TERMINATION_STATE_ON: u32 = 1;
/// Resistance reported for a disabled terminator, in ohms
pub const GS_CAN_TERMINATION_DISABLED_OHMS: u32 = 0;
/// Resistance reported for an enabled terminator, in ohms
pub const GS_CAN_TERMINATION_ENABLED_OHMS: u32 = 120;

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout for every control request and for bulk transfers given no timeout
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Timeout for the second read that fetches the tail of a split FD frame
pub const FD_TAIL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Supported Adapters
// ============================================================================

/// USB vendor/product pair of a candle-compatible adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentifier {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentifier {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl std::fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Adapters recognised by default during a scan
pub const DEVICE_IDENTIFIERS: [DeviceIdentifier; 5] = [
    // gs_usb / CANable
    DeviceIdentifier::new(0x1D50, 0x606F),
    // candleLight
    DeviceIdentifier::new(0x1209, 0x2323),
    // CES CANext FD
    DeviceIdentifier::new(0x1CD2, 0x606F),
    // ABE CANdebugger FD
    DeviceIdentifier::new(0x16D0, 0x10B8),
    DeviceIdentifier::new(0x16D0, 0x0F30),
];
