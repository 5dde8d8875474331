//! CAN channel
//!
//! A `Channel` is one CAN controller behind an interface. It owns the
//! channel's capability constants and its receive queue; the owning
//! `Interface` fills the queue from `polling`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};

use crate::constants::*;
use crate::control::{control_in, control_out, read_bit_timing_constants};
use crate::error::{CandleError, Result};
use crate::frame::HostFrame;
use crate::interface::{Interface, InterfaceInner};
use crate::structures::{BitTiming, BitTimingConstants, DeviceMode, DeviceState, TerminationState};
use crate::timing::{data_bit_timing, nominal_bit_timing};

/// Optional channel feature, advertised in the BT_CONST feature bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Fd,
    LoopBack,
    ListenOnly,
    TripleSample,
    OneShot,
    HardwareTimestamp,
    BitErrorReporting,
    Termination,
    GetState,
}

impl Capability {
    /// GS_CAN_FEATURE_* bit advertising this capability
    pub fn feature(&self) -> u32 {
        match self {
            Capability::Fd => GS_CAN_FEATURE_FD,
            Capability::LoopBack => GS_CAN_FEATURE_LOOP_BACK,
            Capability::ListenOnly => GS_CAN_FEATURE_LISTEN_ONLY,
            Capability::TripleSample => GS_CAN_FEATURE_TRIPLE_SAMPLE,
            Capability::OneShot => GS_CAN_FEATURE_ONE_SHOT,
            Capability::HardwareTimestamp => GS_CAN_FEATURE_HW_TIMESTAMP,
            Capability::BitErrorReporting => GS_CAN_FEATURE_BERR_REPORTING,
            Capability::Termination => GS_CAN_FEATURE_TERMINATION,
            Capability::GetState => GS_CAN_FEATURE_GET_STATE,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Fd => "CAN FD",
            Capability::LoopBack => "loopback mode",
            Capability::ListenOnly => "listen-only mode",
            Capability::TripleSample => "triple sampling",
            Capability::OneShot => "one-shot mode",
            Capability::HardwareTimestamp => "hardware timestamps",
            Capability::BitErrorReporting => "bus error reporting",
            Capability::Termination => "termination control",
            Capability::GetState => "state query",
        };
        f.write_str(name)
    }
}

/// Mode requested when opening a channel
///
/// Hardware timestamps are not listed: they are enabled whenever the
/// channel supports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub fd: bool,
    pub loopback: bool,
    pub listen_only: bool,
    pub triple_sample: bool,
    pub one_shot: bool,
    pub bit_error_reporting: bool,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fd(mut self, enabled: bool) -> Self {
        self.fd = enabled;
        self
    }

    pub fn loopback(mut self, enabled: bool) -> Self {
        self.loopback = enabled;
        self
    }

    pub fn listen_only(mut self, enabled: bool) -> Self {
        self.listen_only = enabled;
        self
    }

    pub fn triple_sample(mut self, enabled: bool) -> Self {
        self.triple_sample = enabled;
        self
    }

    pub fn one_shot(mut self, enabled: bool) -> Self {
        self.one_shot = enabled;
        self
    }

    pub fn bit_error_reporting(mut self, enabled: bool) -> Self {
        self.bit_error_reporting = enabled;
        self
    }

    /// Requested capabilities with their mode flags, in check order
    fn requested(&self) -> impl Iterator<Item = (Capability, u32)> {
        [
            (self.loopback, Capability::LoopBack, GS_CAN_MODE_LOOP_BACK),
            (self.listen_only, Capability::ListenOnly, GS_CAN_MODE_LISTEN_ONLY),
            (self.triple_sample, Capability::TripleSample, GS_CAN_MODE_TRIPLE_SAMPLE),
            (self.one_shot, Capability::OneShot, GS_CAN_MODE_ONE_SHOT),
            (
                self.bit_error_reporting,
                Capability::BitErrorReporting,
                GS_CAN_MODE_BERR_REPORTING,
            ),
            (self.fd, Capability::Fd, GS_CAN_MODE_FD),
        ]
        .into_iter()
        .filter(|(requested, _, _)| *requested)
        .map(|(_, capability, flag)| (capability, flag))
    }
}

pub(crate) struct ChannelInner {
    interface: Arc<InterfaceInner>,
    index: u8,
    bt_const: BitTimingConstants,
    /// Flags of the last MODE request
    flags: AtomicU32,
    tx: Sender<HostFrame>,
    rx: Receiver<HostFrame>,
}

impl ChannelInner {
    pub(crate) fn new(interface: Arc<InterfaceInner>, index: u8) -> Result<Self> {
        let bt_const = read_bit_timing_constants(interface.transport(), index)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(Self {
            interface,
            index,
            bt_const,
            flags: AtomicU32::new(GS_CAN_MODE_NORMAL),
            tx,
            rx,
        })
    }

    pub(crate) fn bit_timing_constants(&self) -> &BitTimingConstants {
        &self.bt_const
    }

    pub(crate) fn enqueue(&self, frame: HostFrame) {
        // rx lives as long as self, so the send cannot fail
        let _ = self.tx.send(frame);
    }
}

/// One CAN channel of an interface
///
/// Cloning yields another handle to the same channel. The channel stays
/// registered with its interface (and keeps receiving frames) while any
/// handle is alive.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// Channel number within the interface
    pub fn index(&self) -> u8 {
        self.inner.index
    }

    /// Interface this channel belongs to
    pub fn interface(&self) -> Interface {
        Interface::from_inner(self.inner.interface.clone())
    }

    /// Capability and timing limits read at construction
    pub fn bit_timing_constants(&self) -> &BitTimingConstants {
        &self.inner.bt_const
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.inner.bt_const.has_feature(capability.feature())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(CandleError::UnsupportedCapability(capability))
        }
    }

    pub fn is_fd_supported(&self) -> bool {
        self.supports(Capability::Fd)
    }

    pub fn is_loop_back_supported(&self) -> bool {
        self.supports(Capability::LoopBack)
    }

    pub fn is_listen_only_supported(&self) -> bool {
        self.supports(Capability::ListenOnly)
    }

    pub fn is_triple_sample_supported(&self) -> bool {
        self.supports(Capability::TripleSample)
    }

    pub fn is_one_shot_supported(&self) -> bool {
        self.supports(Capability::OneShot)
    }

    pub fn is_hardware_timestamp_supported(&self) -> bool {
        self.supports(Capability::HardwareTimestamp)
    }

    pub fn is_bit_error_reporting_supported(&self) -> bool {
        self.supports(Capability::BitErrorReporting)
    }

    pub fn is_termination_supported(&self) -> bool {
        self.supports(Capability::Termination)
    }

    pub fn is_get_state_supported(&self) -> bool {
        self.supports(Capability::GetState)
    }

    /// Firmware needs a pad byte after every OUT frame
    pub fn is_quirk(&self) -> bool {
        self.inner
            .bt_const
            .has_feature(GS_CAN_FEATURE_REQ_USB_QUIRK_LPC546XX)
    }

    /// CAN clock frequency in Hz
    pub fn clock_frequency(&self) -> u32 {
        self.inner.bt_const.fclk_can
    }

    /// Mode flags of the last open/close
    pub fn mode_flags(&self) -> u32 {
        self.inner.flags.load(Ordering::Acquire)
    }

    pub fn is_fd_enabled(&self) -> bool {
        (self.mode_flags() & GS_CAN_MODE_FD) != 0
    }

    /// Start the channel
    ///
    /// Fails with `UnsupportedCapability` before touching the device if
    /// any requested mode is not advertised. Hardware timestamps are
    /// switched on whenever supported.
    ///
    /// # Example
    /// ```no_run
    /// # use candle_usb::{Channel, ChannelOptions};
    /// # let channel: Channel = todo!();
    /// channel.set_bitrate(500_000)?;
    /// channel.open(&ChannelOptions::new().loopback(true))?;
    /// # Ok::<(), candle_usb::CandleError>(())
    /// ```
    pub fn open(&self, options: &ChannelOptions) -> Result<()> {
        let mut flags = GS_CAN_MODE_NORMAL;
        for (capability, flag) in options.requested() {
            self.require(capability)?;
            flags |= flag;
        }

        if self.is_hardware_timestamp_supported() {
            flags |= GS_CAN_MODE_HW_TIMESTAMP;
        }

        let mode = DeviceMode::new(GS_CAN_MODE_START, flags);
        self.control_out(GS_USB_BREQ_MODE, &mode.pack())?;
        self.inner.flags.store(flags, Ordering::Release);
        debug!("channel {} started, flags 0x{:08x}", self.index(), flags);
        Ok(())
    }

    /// Stop the channel; repeated resets are accepted by the firmware
    pub fn close(&self) -> Result<()> {
        let mode = DeviceMode::new(GS_CAN_MODE_RESET, GS_CAN_MODE_NORMAL);
        self.control_out(GS_USB_BREQ_MODE, &mode.pack())?;
        self.inner.flags.store(GS_CAN_MODE_NORMAL, Ordering::Release);
        debug!("channel {} reset", self.index());
        Ok(())
    }

    /// Close then open with new options; bus traffic is interrupted in between
    pub fn reconfigure(&self, options: &ChannelOptions) -> Result<()> {
        self.close()?;
        self.open(options)
    }

    /// Set raw nominal bit timing
    ///
    /// Values are passed to the firmware unchecked; compare them with
    /// `bit_timing_constants()` first.
    ///
    /// # Arguments
    /// * `prop_seg` - Propagation segment (typically 1)
    /// * `phase_seg1` - Phase segment 1
    /// * `phase_seg2` - Phase segment 2
    /// * `sjw` - Synchronization jump width
    /// * `brp` - Baud rate prescaler
    pub fn set_bit_timing(
        &self,
        prop_seg: u32,
        phase_seg1: u32,
        phase_seg2: u32,
        sjw: u32,
        brp: u32,
    ) -> Result<()> {
        let timing = BitTiming::new(prop_seg, phase_seg1, phase_seg2, sjw, brp);
        self.control_out(GS_USB_BREQ_BITTIMING, &timing.pack())
    }

    /// Set raw data phase (CAN FD) bit timing, unchecked like `set_bit_timing`
    pub fn set_data_bit_timing(
        &self,
        prop_seg: u32,
        phase_seg1: u32,
        phase_seg2: u32,
        sjw: u32,
        brp: u32,
    ) -> Result<()> {
        let timing = BitTiming::new(prop_seg, phase_seg1, phase_seg2, sjw, brp);
        let request = if self
            .inner
            .bt_const
            .has_feature(GS_CAN_FEATURE_QUIRK_BREQ_CANTACT_PRO)
        {
            GS_USB_BREQ_GET_USER_ID
        } else {
            GS_USB_BREQ_DATA_BITTIMING
        };
        self.control_out(request, &timing.pack())
    }

    /// Set the nominal bitrate from the built-in timing tables (87.5% sample point)
    pub fn set_bitrate(&self, bitrate: u32) -> Result<()> {
        let clock_hz = self.clock_frequency();
        let timing = nominal_bit_timing(clock_hz, bitrate)
            .ok_or(CandleError::UnsupportedBitrate { bitrate, clock_hz })?;
        self.set_bit_timing(
            timing.prop_seg,
            timing.phase_seg1,
            timing.phase_seg2,
            timing.sjw,
            timing.brp,
        )
    }

    /// Set the data phase bitrate from the built-in timing tables (75% sample point)
    pub fn set_data_bitrate(&self, bitrate: u32) -> Result<()> {
        self.require(Capability::Fd)?;
        let clock_hz = self.clock_frequency();
        let timing = data_bit_timing(clock_hz, bitrate)
            .ok_or(CandleError::UnsupportedDataBitrate { bitrate, clock_hz })?;
        self.set_data_bit_timing(
            timing.prop_seg,
            timing.phase_seg1,
            timing.phase_seg2,
            timing.sjw,
            timing.brp,
        )
    }

    /// Read the termination resistor setting
    pub fn termination(&self) -> Result<bool> {
        self.require(Capability::Termination)?;
        let data = self.control_in(GS_USB_BREQ_GET_TERMINATION, TerminationState::SIZE)?;
        let state = TerminationState::unpack(&data).ok_or(CandleError::InvalidResponse {
            expected: TerminationState::SIZE,
            actual: data.len(),
        })?;
        Ok(state.is_enabled())
    }

    pub fn set_termination(&self, enabled: bool) -> Result<()> {
        self.require(Capability::Termination)?;
        let state = TerminationState::new(enabled);
        self.control_out(GS_USB_BREQ_SET_TERMINATION, &state.pack())
    }

    /// Bus state and error counters, fetched now
    pub fn state(&self) -> Result<DeviceState> {
        self.require(Capability::GetState)?;
        let data = self.control_in(GS_USB_BREQ_GET_STATE, DeviceState::SIZE)?;
        DeviceState::unpack(&data).ok_or(CandleError::InvalidResponse {
            expected: DeviceState::SIZE,
            actual: data.len(),
        })
    }

    /// Pop one received frame
    ///
    /// With `None` this never blocks and returns `Ok(None)` on an empty
    /// queue. With a timeout it waits and returns `ReadTimeout` if nothing
    /// arrived. Frames only arrive while something drives `polling`.
    pub fn read(&self, timeout: Option<Duration>) -> Result<Option<HostFrame>> {
        match timeout {
            None => Ok(self.inner.rx.try_recv().ok()),
            Some(timeout) => self
                .inner
                .rx
                .recv_timeout(timeout)
                .map(Some)
                .map_err(|_| CandleError::ReadTimeout),
        }
    }

    /// Frames waiting in the receive queue
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// Send one frame
    ///
    /// Frames addressed to another channel, FD frames while FD mode is
    /// off, and invalid frames are dropped without error.
    ///
    /// # Arguments
    /// * `frame` - Frame to send; `frame.header.channel` must be this channel
    /// * `timeout` - Bulk transfer timeout, `None` for the 1 s default
    pub fn write(&self, frame: &HostFrame, timeout: Option<Duration>) -> Result<()> {
        if frame.header.channel != self.index() {
            trace!(
                "channel {}: dropping frame addressed to channel {}",
                self.index(),
                frame.header.channel
            );
            return Ok(());
        }
        if frame.header.is_fd() && !self.is_fd_enabled() {
            trace!("channel {}: dropping FD frame, FD mode off", self.index());
            return Ok(());
        }
        if !frame.valid() {
            trace!("channel {}: dropping invalid frame {:?}", self.index(), frame);
            return Ok(());
        }

        let data = frame.pack(self.is_quirk());
        let interface = &self.inner.interface;
        match interface.transport().write_bulk(
            interface.endpoint_out(),
            &data,
            timeout.unwrap_or(DEFAULT_CONTROL_TIMEOUT),
        ) {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => Err(CandleError::WriteTimeout),
            Err(e) => Err(CandleError::BulkTransfer(e)),
        }
    }

    fn control_out(&self, request: u8, data: &[u8]) -> Result<()> {
        control_out(
            self.inner.interface.transport(),
            request,
            self.index() as u16,
            0,
            data,
        )
    }

    fn control_in(&self, request: u8, length: usize) -> Result<Vec<u8>> {
        control_in(
            self.inner.interface.transport(),
            request,
            self.index() as u16,
            0,
            length,
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("interface", &self.inner.interface.number())
            .field("index", &self.index())
            .field("feature", &format_args!("0x{:08x}", self.inner.bt_const.feature))
            .field("flags", &format_args!("0x{:08x}", self.mode_flags()))
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HostFrameHeader;
    use crate::mock::MockTransport;
    use crate::structures::CanState;
    use crate::testing::open_channel;
    use std::time::Instant;

    const CLASSIC: u32 = GS_CAN_FEATURE_LOOP_BACK
        | GS_CAN_FEATURE_LISTEN_ONLY
        | GS_CAN_FEATURE_HW_TIMESTAMP
        | GS_CAN_FEATURE_GET_STATE;

    fn mode_requests(transport: &MockTransport) -> Vec<DeviceMode> {
        transport
            .control_out_for(GS_USB_BREQ_MODE)
            .iter()
            .filter_map(|record| DeviceMode::unpack(&record.data))
            .collect()
    }

    #[test]
    fn test_open_sets_requested_flags_and_timestamp() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        channel
            .open(&ChannelOptions::new().loopback(true).listen_only(true))
            .unwrap();

        let modes = mode_requests(&transport);
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].mode, GS_CAN_MODE_START);
        assert_eq!(
            modes[0].flags,
            GS_CAN_MODE_LOOP_BACK | GS_CAN_MODE_LISTEN_ONLY | GS_CAN_MODE_HW_TIMESTAMP
        );
        assert_eq!(channel.mode_flags(), modes[0].flags);
    }

    #[test]
    fn test_open_rejects_unsupported_capability() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        let err = channel
            .open(&ChannelOptions::new().fd(true))
            .unwrap_err();
        assert!(matches!(
            err,
            CandleError::UnsupportedCapability(Capability::Fd)
        ));

        let err = channel
            .open(&ChannelOptions::new().one_shot(true))
            .unwrap_err();
        assert!(matches!(
            err,
            CandleError::UnsupportedCapability(Capability::OneShot)
        ));
        assert!(mode_requests(&transport).is_empty());
    }

    #[test]
    fn test_channel_requests_use_channel_as_value() {
        let (transport, _device, _interface, channel) = open_channel(2, CLASSIC, 1);
        channel.set_bit_timing(1, 12, 2, 1, 6).unwrap();
        let records = transport.control_out_for(GS_USB_BREQ_BITTIMING);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 1);
        assert_eq!(records[0].index, 0);
        assert_eq!(
            BitTiming::unpack(&records[0].data),
            Some(BitTiming::new(1, 12, 2, 1, 6))
        );
    }

    #[test]
    fn test_close_and_reconfigure() {
        let feature = CLASSIC | GS_CAN_FEATURE_FD;
        let (transport, _device, _interface, channel) = open_channel(1, feature, 0);
        channel.open(&ChannelOptions::new().fd(true)).unwrap();
        assert!(channel.is_fd_enabled());

        channel
            .reconfigure(&ChannelOptions::new().loopback(true))
            .unwrap();
        let modes = mode_requests(&transport);
        assert_eq!(modes.len(), 3);
        assert_eq!(modes[1], DeviceMode::new(GS_CAN_MODE_RESET, GS_CAN_MODE_NORMAL));
        assert_eq!(modes[2].mode, GS_CAN_MODE_START);
        assert!(!channel.is_fd_enabled());

        channel.close().unwrap();
        channel.close().unwrap();
        assert_eq!(channel.mode_flags(), GS_CAN_MODE_NORMAL);
    }

    #[test]
    fn test_data_bit_timing_request_code() {
        let (transport, _device, _interface, channel) =
            open_channel(1, GS_CAN_FEATURE_FD, 0);
        channel.set_data_bit_timing(1, 4, 2, 1, 5).unwrap();
        assert_eq!(transport.control_out_for(GS_USB_BREQ_DATA_BITTIMING).len(), 1);

        let quirky = GS_CAN_FEATURE_FD | GS_CAN_FEATURE_QUIRK_BREQ_CANTACT_PRO;
        let (transport, _device, _interface, channel) = open_channel(1, quirky, 0);
        channel.set_data_bit_timing(1, 4, 2, 1, 5).unwrap();
        assert!(transport
            .control_out_for(GS_USB_BREQ_DATA_BITTIMING)
            .is_empty());
        assert_eq!(transport.control_out_for(GS_USB_BREQ_GET_USER_ID).len(), 1);
    }

    #[test]
    fn test_set_bitrate_uses_clock_table() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        channel.set_bitrate(500_000).unwrap();
        let records = transport.control_out_for(GS_USB_BREQ_BITTIMING);
        assert_eq!(
            BitTiming::unpack(&records[0].data),
            Some(BitTiming::new(1, 12, 2, 1, 6))
        );

        assert!(matches!(
            channel.set_bitrate(333_333),
            Err(CandleError::UnsupportedBitrate {
                bitrate: 333_333,
                clock_hz: 48_000_000
            })
        ));
        assert!(matches!(
            channel.set_data_bitrate(2_000_000),
            Err(CandleError::UnsupportedCapability(Capability::Fd))
        ));
    }

    #[test]
    fn test_termination_round_trip() {
        let (transport, _device, _interface, channel) =
            open_channel(1, GS_CAN_FEATURE_TERMINATION, 0);
        assert!(!channel.termination().unwrap());

        channel.set_termination(true).unwrap();
        let records = transport.control_out_for(GS_USB_BREQ_SET_TERMINATION);
        assert_eq!(records[0].data, vec![1, 0, 0, 0]);

        transport.set_control_in_response(GS_USB_BREQ_GET_TERMINATION, vec![1, 0, 0, 0]);
        assert!(channel.termination().unwrap());
    }

    #[test]
    fn test_gated_requests_need_capability() {
        let (transport, _device, _interface, channel) =
            open_channel(1, GS_CAN_FEATURE_LOOP_BACK, 0);
        assert!(matches!(
            channel.termination(),
            Err(CandleError::UnsupportedCapability(Capability::Termination))
        ));
        assert!(matches!(
            channel.state(),
            Err(CandleError::UnsupportedCapability(Capability::GetState))
        ));
        assert_eq!(transport.control_in_count(GS_USB_BREQ_GET_STATE), 0);
    }

    #[test]
    fn test_state_query() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        assert!(channel.state().unwrap().is_error_active());

        let state = DeviceState {
            state: CanState::BusOff,
            rxerr: 0,
            txerr: 255,
        };
        transport.set_control_in_response(GS_USB_BREQ_GET_STATE, state.pack().to_vec());
        assert_eq!(channel.state().unwrap(), state);
    }

    #[test]
    fn test_write_sends_bulk_out() {
        let (transport, _device, interface, channel) = open_channel(1, CLASSIC, 0);
        channel.open(&ChannelOptions::new()).unwrap();

        let frame = HostFrame::classic(0, 0x123, &[1, 2, 3]);
        channel.write(&frame, Some(Duration::from_millis(20))).unwrap();

        let sent = transport.bulk_out_log();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, interface.endpoint_out());
        assert_eq!(sent[0].data, frame.pack(false));
        assert_eq!(sent[0].timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_write_to_other_channel_dropped() {
        let (transport, _device, _interface, channel) = open_channel(2, CLASSIC, 0);
        channel.open(&ChannelOptions::new()).unwrap();

        let frame = HostFrame::classic(1, 0x123, &[1, 2, 3]);
        assert!(channel.write(&frame, None).is_ok());
        assert!(transport.bulk_out_log().is_empty());
    }

    #[test]
    fn test_write_fd_without_fd_mode_dropped() {
        let (transport, _device, _interface, channel) =
            open_channel(1, CLASSIC | GS_CAN_FEATURE_FD, 0);
        channel.open(&ChannelOptions::new()).unwrap();

        let frame = HostFrame::fd(0, 0x123, &[0; 12], true);
        assert!(channel.write(&frame, None).is_ok());
        assert!(transport.bulk_out_log().is_empty());

        channel.reconfigure(&ChannelOptions::new().fd(true)).unwrap();
        channel.write(&frame, None).unwrap();
        assert_eq!(transport.bulk_out_log()[0].data.len(), 76);
    }

    #[test]
    fn test_write_invalid_frame_dropped() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        channel.open(&ChannelOptions::new()).unwrap();

        let header = HostFrameHeader::new(0, CAN_ERR_FLAG | 0x1, 4, 0, 0);
        assert!(channel.write(&HostFrame::new(header, vec![0; 4]), None).is_ok());
        assert!(transport.bulk_out_log().is_empty());
    }

    #[test]
    fn test_write_quirk_pad_byte() {
        let (transport, _device, _interface, channel) =
            open_channel(1, CLASSIC | GS_CAN_FEATURE_REQ_USB_QUIRK_LPC546XX, 0);
        channel.open(&ChannelOptions::new()).unwrap();
        channel
            .write(&HostFrame::classic(0, 0x1, &[0xFF; 8]), None)
            .unwrap();
        assert_eq!(transport.bulk_out_log()[0].data.len(), 21);
    }

    #[test]
    fn test_write_timeout_is_typed() {
        let (transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        transport.fail_next_bulk_out(rusb::Error::Timeout);
        let err = channel
            .write(&HostFrame::classic(0, 0x1, &[]), None)
            .unwrap_err();
        assert!(matches!(err, CandleError::WriteTimeout));
        assert!(err.is_timeout());

        transport.fail_next_bulk_out(rusb::Error::NoDevice);
        let err = channel
            .write(&HostFrame::classic(0, 0x1, &[]), None)
            .unwrap_err();
        assert!(matches!(err, CandleError::BulkTransfer(rusb::Error::NoDevice)));
    }

    #[test]
    fn test_read_empty_without_timeout() {
        let (_transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        let start = Instant::now();
        assert!(channel.read(None).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_read_times_out() {
        let (_transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        let start = Instant::now();
        let err = channel.read(Some(Duration::from_millis(50))).unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, CandleError::ReadTimeout));
        assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    }

    #[test]
    fn test_read_preserves_order() {
        let (_transport, _device, _interface, channel) = open_channel(1, CLASSIC, 0);
        for id in 1..=3u32 {
            channel.inner.enqueue(HostFrame::classic(0, id, &[]));
        }
        assert_eq!(channel.pending(), 3);
        for id in 1..=3u32 {
            let frame = channel.read(Some(Duration::from_millis(10))).unwrap().unwrap();
            assert_eq!(frame.header.can_id, id);
        }
        assert!(channel.read(None).unwrap().is_none());
    }
}
