//! Channel Loopback Example
//!
//! Opens channel 0 of the first adapter in loopback mode, sends a few
//! classic frames (and FD frames when supported) and prints what comes
//! back through polling.
//!
//! This example configures:
//! - Nominal bitrate: 500 kbps
//! - Data bitrate: 2 Mbps (FD adapters only)

use std::time::{Duration, Instant};

use candle_usb::{CandleError, ChannelOptions, DeviceRegistry, HostFrame, ScanFilter, CAN_EFF_FLAG};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candle_usb::Result<()> {
    let registry = DeviceRegistry::new();
    let Some(device) = registry.scan(&ScanFilter::new())?.into_iter().next() else {
        println!("Can not find gs_usb device");
        return Ok(());
    };
    println!("Found device: {}", device);

    let interface = device.interface(0)?;
    let channel = interface.channel(0)?;
    println!("Clock: {} Hz", channel.clock_frequency());

    if !channel.is_loop_back_supported() {
        println!("Channel 0 does not support loopback mode");
        return Ok(());
    }

    let fd = channel.is_fd_supported();
    channel.set_bitrate(500_000)?;
    if fd {
        channel.set_data_bitrate(2_000_000)?;
    }
    channel.open(&ChannelOptions::new().loopback(true).fd(fd))?;
    println!("Channel 0 started, flags 0x{:08x}", channel.mode_flags());

    let mut frames = vec![
        HostFrame::classic(0, 0x123, &[0x11, 0x22, 0x33]),
        HostFrame::classic(0, 0x1ABCDE | CAN_EFF_FLAG, &[0xDE, 0xAD, 0xBE, 0xEF]),
    ];
    if fd {
        let payload: Vec<u8> = (0..48).collect();
        frames.push(HostFrame::fd(0, 0x456, &payload, true));
    }

    for frame in &frames {
        channel.write(frame, None)?;
        println!("TX  {}", frame);
    }

    let mut received = 0;
    let deadline = Instant::now() + Duration::from_secs(2);
    while received < frames.len() && Instant::now() < deadline {
        interface.polling(Some(Duration::from_millis(100)))?;
        match channel.read(Some(Duration::from_millis(10))) {
            Ok(Some(frame)) => {
                received += 1;
                println!("RX  {}  @ {:.6}s", frame, frame.timestamp());
            }
            Ok(None) | Err(CandleError::ReadTimeout) => continue,
            Err(e) => return Err(e),
        }
    }

    println!("{} of {} frames echoed", received, frames.len());
    channel.close()?;
    Ok(())
}
