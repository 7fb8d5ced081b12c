//! Serial-device discovery.
//!
//! The instrument enumerates as a USB CDC serial device with a known vendor
//! ID, so discovery is a scan of the system port list. It lives here as a
//! standalone utility: callers resolve an address once and inject it into
//! the link's transport factory, rather than the link scanning ambiently on
//! every connect.

use crate::error::AppResult;
use log::debug;
use serialport::{SerialPortInfo, SerialPortType};

/// Vendor ID of the trace controller (Teensy 4.1, Teensyduino USB serial).
pub const TRACE_CONTROLLER_VID: u16 = 0x16c0;

/// Vendor ID of the auxiliary ADC data logger (Seeeduino XIAO).
pub const DATA_LOGGER_VID: u16 = 0x2886;

/// Pick the first port whose USB vendor ID matches.
pub fn match_port(ports: &[SerialPortInfo], vid: u16) -> Option<&SerialPortInfo> {
    ports.iter().find(|port| match &port.port_type {
        SerialPortType::UsbPort(usb) => usb.vid == vid,
        _ => false,
    })
}

/// Scan system ports for a device with the given vendor ID.
pub fn find_port(vid: u16) -> AppResult<Option<String>> {
    let ports = list_ports()?;
    let found = match_port(&ports, vid).map(|p| p.port_name.clone());
    match &found {
        Some(name) => debug!("found vid {vid:#06x} at {name}"),
        None => debug!("no port with vid {vid:#06x} among {} ports", ports.len()),
    }
    Ok(found)
}

/// All serial ports the OS knows about.
pub fn list_ports() -> AppResult<Vec<SerialPortInfo>> {
    serialport::available_ports()
        .map_err(|e| crate::error::PispecError::Transport(e.to_string()))
}
