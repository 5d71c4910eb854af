//! FTDI SIO protocol library
//!
//! Pure, I/O-free pieces of the FTDI serial-bridge protocol: the vendor
//! control request builders, the bulk-IN status byte decoder, chip
//! classification and configuration descriptor scanning.
//!
//! # Example
//!
//! ```
//! use protocol::{ChipType, DataBits, Parity, StopBits};
//! use protocol::{build_set_baudrate, build_set_line_property, parse_modem_status};
//!
//! // 115200 8N1 on an FT232R
//! let baud = build_set_baudrate(115_200, ChipType::Variant232R).unwrap();
//! assert_eq!(baud.value, 26);
//!
//! let line = build_set_line_property(DataBits::Eight, StopBits::One, Parity::None);
//! assert_eq!(line.value, 0x0008);
//!
//! // Status bytes at the head of a bulk-IN packet
//! let status = parse_modem_status([0x60, 0x10]);
//! assert!(status.tx_empty && status.cts);
//! ```

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod types;

pub use codec::{
    MAX_DIVISOR, MIN_BAUDRATE, baudrate_divisor, build_reset, build_set_baudrate,
    build_set_latency_timer, build_set_line_property, build_set_line_property_raw,
    build_set_modem_control, divisor_from_encoded, effective_baudrate, parse_modem_status,
};
pub use descriptor::{build_config_descriptor, classify_chip, resolve_interface};
pub use error::{ProtocolError, Result};
pub use types::{
    ANY_PID, ANY_VID, ChipType, ControlRequest, DataBits, FTDI_VID, InterfaceInfo, ModemStatus,
    Parity, REQUEST_TYPE_VENDOR_OUT, ResetKind, STATUS_LEN, StopBits, pid, request,
};
