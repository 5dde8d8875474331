//! Device Scan Example
//!
//! Lists every connected gs_usb adapter with its interfaces and the
//! capabilities of each channel.
//!
//! Usage: cargo run --example scan [serial_number]

use candle_usb::{DeviceRegistry, ScanFilter};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candle_usb::Result<()> {
    let mut filter = ScanFilter::new();
    if let Some(serial) = std::env::args().nth(1) {
        filter = filter.serial_number(serial);
    }

    let registry = DeviceRegistry::new();
    let devices = registry.scan(&filter)?;
    if devices.is_empty() {
        println!("Can not find gs_usb device");
        return Ok(());
    }

    for device in &devices {
        println!("{}", device);
        println!("  bus {}, address {}", device.bus(), device.address());

        for number in 0..device.interface_count()? {
            let interface = match device.interface(number) {
                Ok(interface) => interface,
                Err(e) => {
                    println!("  interface {}: {}", number, e);
                    continue;
                }
            };
            println!(
                "  interface {}: {} channel(s), {}",
                number,
                interface.channel_count(),
                interface.device_config()
            );

            for index in 0..=interface.device_config().icount {
                let channel = interface.channel(index)?;
                println!("    channel {}:", index);
                for line in channel.bit_timing_constants().to_string().lines() {
                    println!("      {}", line);
                }
            }
        }
    }

    Ok(())
}
