//! SIO wire types
//!
//! Plain value types shared by the codec, the descriptor resolver and the
//! host driver: chip variants, fully-built control requests, line settings
//! and the decoded modem status carried in every bulk-IN packet.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// FTDI vendor ID
pub const FTDI_VID: u16 = 0x0403;

/// Wildcard vendor ID for device matching
pub const ANY_VID: u16 = 0;

/// Wildcard product ID for device matching
pub const ANY_PID: u16 = 0;

/// Known FTDI product IDs
pub mod pid {
    /// FT232R and FT245R
    pub const FT232R: u16 = 0x6001;
    /// FT232H
    pub const FT232H: u16 = 0x6014;
    /// FT2232D/H/C
    pub const FT2232D: u16 = 0x6010;
    /// FT4232H
    pub const FT4232H: u16 = 0x6011;
    /// FT230X
    pub const FT230X: u16 = 0x6015;
}

/// SIO vendor request codes (`bRequest`)
pub mod request {
    /// Reset the port or purge one of its buffers
    pub const RESET: u8 = 0;
    /// Set DTR/RTS
    pub const SET_MODEM_CTRL: u8 = 1;
    /// Set the baud rate divisor
    pub const SET_BAUDRATE: u8 = 3;
    /// Set data bits, parity and stop bits
    pub const SET_DATA: u8 = 4;
    /// Set the latency timer
    pub const SET_LATENCY_TIMER: u8 = 9;
}

/// `bmRequestType` for every driver-issued request: vendor | host-to-device | device
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Number of status bytes prefixed to each bulk-IN packet
pub const STATUS_LEN: usize = 2;

/// FTDI chip variant
///
/// Decides the base clock used for baud rate divisors. Detected once from the
/// product ID when a device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChipType {
    #[default]
    Unknown,
    Variant232R,
    Variant232H,
    Variant2232D,
    Variant4232H,
    Variant230X,
}

impl ChipType {
    /// Base clock in Hz used by the baud rate generator
    pub fn base_clock(self) -> u32 {
        match self {
            ChipType::Variant232R | ChipType::Variant230X => 3_000_000,
            ChipType::Variant232H => 12_000_000,
            ChipType::Variant2232D | ChipType::Variant4232H => 6_000_000,
            ChipType::Unknown => 3_000_000,
        }
    }
}

/// A wire-ready vendor control request
///
/// Only the codec builds these, so a value always carries a complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Reset variants for the RESET request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetKind {
    /// Full SIO reset
    Sio,
    /// Purge the receive buffer
    PurgeRx,
    /// Purge the transmit buffer
    PurgeTx,
}

impl ResetKind {
    pub fn code(self) -> u16 {
        match self {
            ResetKind::Sio => 0,
            ResetKind::PurgeRx => 1,
            ResetKind::PurgeTx => 2,
        }
    }
}

/// Character size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Seven,
    Eight,
}

impl DataBits {
    pub fn code(self) -> u16 {
        match self {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = ProtocolError;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ProtocolError::InvalidArgument(format!(
                "unsupported data bits: {}",
                other
            ))),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        match bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Stop bit length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl StopBits {
    pub fn code(self) -> u16 {
        match self {
            StopBits::One => 0,
            StopBits::OnePointFive => 1,
            StopBits::Two => 2,
        }
    }
}

impl std::str::FromStr for StopBits {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(ProtocolError::InvalidArgument(format!(
                "unsupported stop bits: {}",
                other
            ))),
        }
    }
}

/// Parity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn code(self) -> u16 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            "mark" | "m" => Ok(Parity::Mark),
            "space" | "s" => Ok(Parity::Space),
            other => Err(ProtocolError::InvalidArgument(format!(
                "unsupported parity: {}",
                other
            ))),
        }
    }
}

/// Modem and line status decoded from the two status bytes of a bulk-IN packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModemStatus {
    /// More data is pending in the chip
    pub data_pending: bool,
    pub overrun: bool,
    pub parity_error: bool,
    pub framing_error: bool,
    pub break_received: bool,
    /// Transmit holding register empty
    pub tx_holding_empty: bool,
    /// Transmitter empty
    pub tx_empty: bool,
    /// Clear To Send
    pub cts: bool,
    /// Data Set Ready
    pub dsr: bool,
    /// Ring Indicator
    pub ri: bool,
    /// Receive Line Signal Detect (carrier detect)
    pub rlsd: bool,
}

/// Bulk endpoints of the vendor interface selected for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub bulk_in_endpoint: u8,
    pub bulk_in_max_packet_size: u16,
    pub bulk_out_endpoint: u8,
    pub bulk_out_max_packet_size: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_clock_per_chip() {
        assert_eq!(ChipType::Variant232R.base_clock(), 3_000_000);
        assert_eq!(ChipType::Variant230X.base_clock(), 3_000_000);
        assert_eq!(ChipType::Variant232H.base_clock(), 12_000_000);
        assert_eq!(ChipType::Variant2232D.base_clock(), 6_000_000);
        assert_eq!(ChipType::Variant4232H.base_clock(), 6_000_000);
        assert_eq!(ChipType::Unknown.base_clock(), 3_000_000);
    }

    #[test]
    fn test_data_bits_from_u8() {
        assert_eq!(DataBits::try_from(7).unwrap(), DataBits::Seven);
        assert_eq!(DataBits::try_from(8).unwrap(), DataBits::Eight);
        assert!(matches!(
            DataBits::try_from(5),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stop_bits_and_parity_parse() {
        assert_eq!("1.5".parse::<StopBits>().unwrap(), StopBits::OnePointFive);
        assert!("3".parse::<StopBits>().is_err());
        assert_eq!("E".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("space".parse::<Parity>().unwrap(), Parity::Space);
        assert!("bogus".parse::<Parity>().is_err());
    }

    #[test]
    fn test_modem_status_default_is_clear() {
        let status = ModemStatus::default();
        assert!(!status.cts && !status.dsr && !status.ri && !status.rlsd);
        assert!(!status.overrun && !status.tx_empty);
    }
}
