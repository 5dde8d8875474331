//! Channel State Example
//!
//! Prints the bus state and error counters of every channel on
//! interface 0 once per second, along with the termination setting.
//!
//! Usage: cargo run --example channel_state [seconds]

use std::thread;
use std::time::Duration;

use candle_usb::{ChannelOptions, DeviceRegistry, ScanFilter};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candle_usb::Result<()> {
    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(5);

    let registry = DeviceRegistry::new();
    let Some(device) = registry.scan(&ScanFilter::new())?.into_iter().next() else {
        println!("Can not find gs_usb device");
        return Ok(());
    };
    println!("Found device: {}", device);

    let interface = device.interface(0)?;
    let mut channels = Vec::new();
    for index in 0..=interface.device_config().icount {
        let channel = interface.channel(index)?;
        if !channel.is_get_state_supported() {
            println!("Channel {}: state query not supported", index);
            continue;
        }
        if channel.is_termination_supported() {
            println!(
                "Channel {}: termination {}",
                index,
                if channel.termination()? { "on" } else { "off" }
            );
        }
        channel.set_bitrate(500_000)?;
        channel.open(&ChannelOptions::new())?;
        channels.push(channel);
    }

    for _ in 0..seconds {
        for channel in &channels {
            let state = channel.state()?;
            println!("Channel {}: {}", channel.index(), state);
        }
        thread::sleep(Duration::from_secs(1));
    }

    for channel in &channels {
        channel.close()?;
    }
    Ok(())
}
