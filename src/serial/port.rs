//! Serial port configuration and discovery
//!
//! Opens the USB-gadget serial link on the Pi side (`/dev/ttyGS0`) or the
//! host side (`/dev/ttyACM*`, `COM*`) and wraps it in a [`Link`].

use super::Link;
use anyhow::{Context, Result};
use colored::Colorize;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::time::Duration;

/// Gadget serial device on the Raspberry Pi
pub const GADGET_PORT: &str = "/dev/ttyGS0";

/// Default baud rate on both ends of the link
pub const DEFAULT_BAUD: u32 = 115200;

/// Linux USB gadget framework (g_serial / CDC ACM)
const LINUX_GADGET_VID: u16 = 0x0525;
const LINUX_GADGET_PIDS: &[u16] = &[0xa4a7, 0xa4a6];

/// Configuration for serial port connection
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Serial port path (e.g., /dev/ttyGS0, /dev/ttyACM0, COM7)
    pub port_path: String,
    /// Baud rate (default: 115200)
    pub baud_rate: u32,
    /// Data bits (default: 8)
    pub data_bits: DataBits,
    /// Parity (default: None)
    pub parity: Parity,
    /// Stop bits (default: 1)
    pub stop_bits: StopBits,
    /// Flow control (default: None)
    pub flow_control: FlowControl,
    /// Read timeout
    pub timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_path: String::from(GADGET_PORT),
            baud_rate: DEFAULT_BAUD,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: Duration::from_millis(500),
        }
    }
}

impl PortConfig {
    /// Create a new 8N1 configuration for the given port
    pub fn new(port_path: &str) -> Self {
        Self {
            port_path: port_path.to_string(),
            ..Default::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Open a serial port and wrap it in a link.
///
/// With `clear` set, stale bytes in both directions are discarded first.
pub fn open(config: &PortConfig, clear: bool) -> Result<Link<Box<dyn SerialPort>>> {
    let port = serialport::new(&config.port_path, config.baud_rate)
        .data_bits(config.data_bits)
        .parity(config.parity)
        .stop_bits(config.stop_bits)
        .flow_control(config.flow_control)
        .timeout(config.timeout)
        .open()
        .with_context(|| format!("Failed to open serial port: {}", config.port_path))?;

    if clear {
        port.clear(serialport::ClearBuffer::All)
            .with_context(|| "Failed to clear serial buffers")?;
    }

    Ok(Link::new(port))
}

/// A serial port found on this machine
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub path: String,
    /// Transport as reported by the OS ("USB", "PCI", ...)
    pub transport: &'static str,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// USB vendor and product id
    pub usb_id: Option<(u16, u16)>,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            path: port.port_name,
            transport: "Unknown",
            product: None,
            serial_number: None,
            usb_id: None,
        };

        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.transport = "USB";
                info.product = usb.product.or(usb.manufacturer);
                info.serial_number = usb.serial_number;
                info.usb_id = Some((usb.vid, usb.pid));
            }
            serialport::SerialPortType::PciPort => info.transport = "PCI",
            serialport::SerialPortType::BluetoothPort => info.transport = "Bluetooth",
            serialport::SerialPortType::Unknown => {}
        }

        info
    }
}

impl PortInfo {
    /// Whether this port looks like one end of a USB-gadget serial link
    pub fn is_gadget_link(&self) -> bool {
        let name = self.path.to_lowercase();
        if name.contains("ttygs") || name.contains("ttyacm") {
            return true;
        }

        if let Some((vid, pid)) = self.usb_id {
            if vid == LINUX_GADGET_VID && LINUX_GADGET_PIDS.contains(&pid) {
                return true;
            }
        }

        self.product.as_deref().is_some_and(|p| {
            let p = p.to_lowercase();
            p.contains("gadget") || p.contains("cdc") || p.contains("acm")
        })
    }

    /// Pi side of the link (`/dev/ttyGS*`)
    pub fn is_device_side(&self) -> bool {
        self.path.contains("ttyGS")
    }
}

/// List all available serial ports
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().with_context(|| "Failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

fn print_port(port: &PortInfo) {
    println!("\n  {} ({})", port.path.white().bold(), port.transport);
    if let Some(ref product) = port.product {
        println!("    Product: {}", product);
    }
    if let Some(ref sn) = port.serial_number {
        println!("    Serial: {}", sn);
    }
    if let Some((vid, pid)) = port.usb_id {
        println!("    VID:PID: {:04x}:{:04x}", vid, pid);
    }
}

/// Print serial ports, gadget links first, with the command to use on each
pub fn print_ports() -> Result<()> {
    let (gadget, other): (Vec<PortInfo>, Vec<PortInfo>) =
        list_ports()?.into_iter().partition(PortInfo::is_gadget_link);

    if gadget.is_empty() {
        println!("{}", "No gadget serial link found".yellow());
        println!("\n{}", "Troubleshooting tips:".cyan().bold());
        println!("  1. On the Pi, load the gadget driver: sudo modprobe g_serial");
        println!("  2. Use the Pi's USB-C/OTG port, not a host-only port");
        println!("  3. On the host, check the device: ls -la /dev/ttyACM*");
        println!("  4. Add your user to the 'dialout' group: sudo usermod -aG dialout $USER");
    } else {
        println!("{}", "Gadget serial links:".green().bold());
        for port in &gadget {
            print_port(port);
            let hint = if port.is_device_side() {
                format!("serial-upload receive -p {}", port.path)
            } else {
                format!("serial-upload send <PROJECT_DIR> -p {}", port.path)
            };
            println!("    Use: {}", hint.cyan());
        }
    }

    if !other.is_empty() {
        println!("\n{}", "Other serial ports:".white().bold());
        for port in &other {
            print_port(port);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(path: &str) -> PortInfo {
        PortInfo {
            path: path.to_string(),
            transport: "Unknown",
            product: None,
            serial_number: None,
            usb_id: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = PortConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.port_path, "/dev/ttyGS0");
    }

    #[test]
    fn test_config_builder() {
        let config = PortConfig::new("/dev/ttyACM0")
            .with_baud_rate(9600)
            .with_timeout(Duration::from_secs(1));

        assert_eq!(config.port_path, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_gadget_detection() {
        assert!(port("/dev/ttyGS0").is_gadget_link());
        assert!(port("/dev/ttyACM1").is_gadget_link());
        assert!(!port("/dev/ttyS0").is_gadget_link());

        let mut usb = port("COM7");
        usb.usb_id = Some((0x0525, 0xa4a7));
        assert!(usb.is_gadget_link());
        assert!(!usb.is_device_side());
        assert!(port("/dev/ttyGS0").is_device_side());

        let mut ftdi = port("COM3");
        ftdi.product = Some("FT232R USB UART".to_string());
        assert!(!ftdi.is_gadget_link());
    }
}
