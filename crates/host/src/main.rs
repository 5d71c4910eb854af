//! ftdi-sio-host
//!
//! Terminal bridge to an FTDI USB-to-serial chip. Opens the configured
//! interface, applies the line settings, then copies stdin to the chip and
//! received bytes to stdout until Ctrl+C or the device is unplugged.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use host::config::{HostConfig, load_config};
use host::usb::{DeviceEvent, DeviceHandle, DriverRegistry, RusbHost};
use protocol::{FTDI_VID, classify_chip};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long one `transmit` waits for the OUT buffer
const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Parser, Debug)]
#[command(name = "ftdi-sio-host")]
#[command(author, version, about = "Serial terminal for FTDI USB-to-serial chips")]
#[command(long_about = "
Opens an FTDI USB-to-serial chip through libusb and bridges it to the
terminal: lines typed on stdin are transmitted, received bytes are written
to stdout.

EXAMPLES:
    # Open the first FTDI device with the configured settings
    ftdi-sio-host

    # Override the baud rate
    ftdi-sio-host --baudrate 9600

    # List attached FTDI devices and exit
    ftdi-sio-host --list-devices

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ftdi-sio-host/host.toml
    3. /etc/ftdi-sio-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List FTDI devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Baud rate, overriding the configuration file
    #[arg(short, long, value_name = "BAUD")]
    baudrate: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        load_config(path).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };
    if let Some(baudrate) = args.baudrate {
        config.serial.baudrate = baudrate;
        config.validate()?;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ftdi-sio-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let platform = Arc::new(RusbHost::new().context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices_mode(&platform);
    }

    let driver = Arc::new(DriverRegistry::new(platform));
    let driver_config = config
        .driver_config()?
        .with_new_device_callback(|vid, pid| {
            info!("FTDI device attached: {:04x}:{:04x}", vid, pid);
        });
    driver
        .install(driver_config)
        .context("Failed to install FTDI driver")?;

    let result = run_bridge(&config, driver.clone()).await;

    if let Err(e) = driver.uninstall() {
        error!("Failed to uninstall driver: {}", e);
    }
    result
}

/// List FTDI devices and exit
fn list_devices_mode(platform: &RusbHost) -> Result<()> {
    let devices: Vec<_> = platform
        .list_devices()
        .context("Failed to enumerate USB devices")?
        .into_iter()
        .filter(|(_, descriptor)| descriptor.vendor_id == FTDI_VID)
        .collect();

    if devices.is_empty() {
        println!("No FTDI devices found.");
    } else {
        println!("Found {} FTDI device(s):\n", devices.len());
        for (address, descriptor) in devices {
            println!(
                "  {}  {:04x}:{:04x}  {:?}",
                address,
                descriptor.vendor_id,
                descriptor.product_id,
                classify_chip(descriptor.product_id)
            );
        }
    }
    Ok(())
}

enum Notice {
    Data(Vec<u8>),
    Disconnected,
}

async fn run_bridge(config: &HostConfig, driver: Arc<DriverRegistry>) -> Result<()> {
    let (vid, pid, interface, device_config) = config.device_target()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let data_tx = tx.clone();
    let device_config = device_config
        .with_data_callback(move |bytes| {
            let _ = data_tx.send(Notice::Data(bytes.to_vec()));
        })
        .with_event_callback(move |handle, event| match event {
            DeviceEvent::ModemStatusChanged(status) => {
                info!(
                    "Modem status: cts={} dsr={} ri={} rlsd={}",
                    status.cts, status.dsr, status.ri, status.rlsd
                );
                if status.overrun || status.parity_error || status.framing_error {
                    warn!("Line error on {}: {:?}", handle.id(), status);
                }
            }
            DeviceEvent::Error(status) => warn!("Receive error on {}: {:?}", handle.id(), status),
            DeviceEvent::Disconnected => {
                let _ = tx.send(Notice::Disconnected);
            }
        });

    info!(
        "Waiting for device {:04x}:{:04x} interface {}",
        vid, pid, interface
    );
    let opener = driver.clone();
    let port = tokio::task::spawn_blocking(move || opener.open(vid, pid, interface, device_config))
        .await
        .context("Open task failed")?
        .context("Failed to open FTDI device")?;
    info!(
        "Opened {:?} at {} ({:04x}:{:04x})",
        port.chip_type(),
        port.address(),
        port.vendor_id(),
        port.product_id()
    );

    let result = match apply_serial_settings(config, &port) {
        Ok(()) => bridge(&port, &mut rx).await,
        Err(e) => Err(e),
    };

    if let Err(e) = port.close() {
        error!("Failed to close device: {}", e);
    }
    result
}

fn apply_serial_settings(config: &HostConfig, port: &DeviceHandle) -> Result<()> {
    let serial = &config.serial;
    port.set_baudrate(serial.baudrate)
        .with_context(|| format!("Failed to set baud rate {}", serial.baudrate))?;
    port.set_line_property(serial.data_bits, serial.stop_bits, serial.parity)
        .context("Failed to set line properties")?;
    port.set_latency_timer(serial.latency_ms)
        .context("Failed to set latency timer")?;
    port.set_modem_control(serial.dtr, serial.rts)
        .context("Failed to set modem control lines")?;

    info!(
        "Line settings: {} baud, {:?}/{:?}/{:?}",
        serial.baudrate, serial.data_bits, serial.parity, serial.stop_bits
    );
    Ok(())
}

async fn bridge(port: &DeviceHandle, rx: &mut mpsc::UnboundedReceiver<Notice>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                return Ok(());
            }
            notice = rx.recv() => match notice {
                Some(Notice::Data(bytes)) => {
                    stdout.write_all(&bytes).await.context("Failed to write stdout")?;
                    stdout.flush().await.context("Failed to flush stdout")?;
                }
                Some(Notice::Disconnected) => {
                    warn!("Device disconnected");
                    return Err(anyhow!("device disconnected"));
                }
                None => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(mut line) => {
                    line.push_str("\r\n");
                    transmit(port, line.into_bytes()).await?;
                }
                None => {
                    debug!("stdin closed; receive only");
                    stdin_open = false;
                }
            },
        }
    }
}

/// Transmit `data` in chunks that fit the OUT buffer
async fn transmit(port: &DeviceHandle, data: Vec<u8>) -> Result<()> {
    let port = port.clone();
    tokio::task::spawn_blocking(move || {
        let chunk = port.out_buffer_size();
        for piece in data.chunks(chunk) {
            port.transmit(piece, TRANSMIT_TIMEOUT)?;
        }
        Ok::<_, common::Error>(())
    })
    .await
    .context("Transmit task failed")?
    .context("Transmit failed")
}
