use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use miette::{IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::{config::Config, ConnectArgs};
use crate::{cli::config::UsbDevice, error::Error};

/// USB UART adapters which are known to be on common dev boards
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    }, // Silicon Labs CP210x UART Bridge
    UsbDevice {
        vid: 0x1a86,
        pid: 0x7523,
    }, // QinHeng Electronics CH340 serial converter
];

/// Resolve the serial port to use for this invocation.
///
/// A port named on the command line takes precedence over one in the
/// configuration file; with neither, the user is prompted to pick from
/// the detected ports.
pub fn get_serial_port_info(matches: &ConnectArgs, config: &Config) -> Result<SerialPortInfo> {
    let ports = detect_usb_serial_ports().unwrap_or_default();

    if let Some(serial) = &matches.port {
        find_serial_port(&ports, serial)
    } else if let Some(serial) = &config.connection.serial {
        find_serial_port(&ports, serial)
    } else {
        let (port, known) = select_serial_port(ports, config)?;

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if !known {
                let remember = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Remember this serial port for future use?")
                    .interact_opt()
                    .into_diagnostic()?
                    .unwrap_or_default();

                if remember {
                    // A failure to save must not abort the session.
                    if let Err(e) = config.save_with(|config| {
                        config.usb_device.push(UsbDevice {
                            vid: usb_info.vid,
                            pid: usb_info.pid,
                        })
                    }) {
                        eprintln!("Failed to save config {e:#}");
                    }
                }
            }
        }

        Ok(port)
    }
}

/// Find the port whose name matches `name`, case-insensitively.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo> {
    let port_info = ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name));

    match port_info {
        Some(port) => Ok(port.to_owned()),
        None => Err(Error::SerialNotFound(name.to_owned()).into()),
    }
}

/// All serial ports plausibly backed by a USB device.
pub fn detect_usb_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = available_ports().into_diagnostic()?;
    let ports = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

fn device_matches(config: &Config, info: &UsbPortInfo) -> bool {
    config
        .usb_device
        .iter()
        .chain(KNOWN_DEVICES.iter())
        .any(|dev| dev.matches(info))
}

/// Pick a port, prompting when more than one is present. The second
/// element reports whether the chosen port matched a known device.
fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool)> {
    if ports.len() > 1 {
        println!(
            "Detected {} serial ports. Ports which match a known common dev board are highlighted.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let formatted = if device_matches(config, info) {
                        port_info.port_name.as_str().bold()
                    } else {
                        port_info.port_name.as_str().reset()
                    };

                    if let Some(product) = &info.product {
                        format!("{formatted} - {product}")
                    } else {
                        formatted.to_string()
                    }
                }
                _ => port_info.port_name.clone(),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()
            .into_diagnostic()?
            .ok_or(Error::Cancelled)?;

        match ports.get(index) {
            Some(port_info) => {
                let known = match &port_info.port_type {
                    SerialPortType::UsbPort(usb_info) => device_matches(config, usb_info),
                    _ => false,
                };

                Ok((port_info.to_owned(), known))
            }
            None => Err(Error::NoSerial.into()),
        }
    } else if let [port] = ports.as_slice() {
        let known = match &port.port_type {
            SerialPortType::UsbPort(info) => device_matches(config, info),
            _ => false,
        };

        Ok((port.to_owned(), known))
    } else {
        Err(Error::NoSerial.into())
    }
}
