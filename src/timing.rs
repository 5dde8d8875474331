//! Bitrate to bit timing lookup
//!
//! Precomputed timings for the CAN clocks common on gs_usb firmware.
//! Nominal entries use an 87.5% sample point, data phase entries 75%.

use crate::structures::BitTiming;

const PROP_SEG: u32 = 1;
const SJW: u32 = 1;

/// Nominal (arbitration phase) timing for `bitrate` on a `clock_hz` CAN clock
pub fn nominal_bit_timing(clock_hz: u32, bitrate: u32) -> Option<BitTiming> {
    let (phase_seg1, phase_seg2, brp) = match clock_hz {
        48_000_000 => match bitrate {
            10_000 => (12, 2, 300),
            20_000 => (12, 2, 150),
            50_000 => (12, 2, 60),
            100_000 => (12, 2, 30),
            125_000 => (12, 2, 24),
            250_000 => (12, 2, 12),
            500_000 => (12, 2, 6),
            800_000 => (11, 2, 4),
            1_000_000 => (12, 2, 3),
            _ => return None,
        },
        80_000_000 => match bitrate {
            10_000 => (12, 2, 500),
            20_000 => (12, 2, 250),
            50_000 => (12, 2, 100),
            100_000 => (12, 2, 50),
            125_000 => (12, 2, 40),
            250_000 => (12, 2, 20),
            500_000 => (12, 2, 10),
            800_000 => (7, 1, 10),
            1_000_000 => (12, 2, 5),
            _ => return None,
        },
        40_000_000 => match bitrate {
            10_000 => (12, 2, 250),
            20_000 => (12, 2, 125),
            50_000 => (12, 2, 50),
            100_000 => (12, 2, 25),
            125_000 => (12, 2, 20),
            250_000 => (12, 2, 10),
            500_000 => (12, 2, 5),
            800_000 => (7, 1, 5),
            1_000_000 => (5, 1, 5),
            _ => return None,
        },
        _ => return None,
    };
    Some(BitTiming::new(PROP_SEG, phase_seg1, phase_seg2, SJW, brp))
}

/// Data phase (CAN FD) timing for `bitrate` on a `clock_hz` CAN clock
pub fn data_bit_timing(clock_hz: u32, bitrate: u32) -> Option<BitTiming> {
    let (phase_seg1, phase_seg2, brp) = match clock_hz {
        80_000_000 => match bitrate {
            2_000_000 => (4, 2, 5),
            4_000_000 => (1, 1, 5),
            5_000_000 => (4, 2, 2),
            8_000_000 => (2, 1, 2),
            _ => return None,
        },
        40_000_000 => match bitrate {
            2_000_000 => (6, 2, 2),
            4_000_000 => (2, 1, 2),
            5_000_000 => (4, 2, 1),
            8_000_000 => (2, 1, 1),
            10_000_000 => (1, 1, 1),
            _ => return None,
        },
        _ => return None,
    };
    Some(BitTiming::new(PROP_SEG, phase_seg1, phase_seg2, SJW, brp))
}
