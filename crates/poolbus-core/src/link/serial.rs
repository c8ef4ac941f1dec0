//! Serial port handling
//!
//! Port enumeration and opening of RS-485 adapters.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;

use serialport::{SerialPortInfo, SerialPortType};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::LinkError;
use crate::config::{FlowControl, Parity, PortSettings};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn named(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// Sort key putting USB RS-485 adapters first:
///  - ttyUSB* (numerically by suffix)
///  - then ttyACM*
///  - then on-board UARTs (ttyAMA*, ttyS*)
///  - then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let prefixes = ["ttyUSB", "ttyACM", "ttyAMA", "ttyS"];
    for (rank, prefix) in prefixes.iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank.min(2) as u8, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // Adapters can be missing from the enumeration API on some kernels
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a serial device with the given line settings
pub fn open_serial(path: &str, settings: &PortSettings) -> Result<SerialStream, LinkError> {
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let flow_control = match settings.flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    };

    tokio_serial::new(path, settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .open_native_async()
        .map_err(|e| LinkError::Serial(format!("{}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyS0",
            "/dev/ttyACM0",
            "/dev/ttyUSB1",
            "/dev/someport",
            "/dev/ttyUSB0",
            "/dev/ttyUSB10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo::named(n.to_string()))
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyUSB10",
                "/dev/ttyACM0",
                "/dev/ttyS0",
                "/dev/someport",
            ]
        );
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let err = open_serial("/dev/does-not-exist-poolbus", &PortSettings::default());
        assert!(matches!(err, Err(LinkError::Serial(_))));
    }
}
