//! SIO control request codec
//!
//! Pure builders for the vendor control requests understood by FTDI chips and
//! the decoder for the two status bytes that prefix every bulk-IN packet.
//!
//! # Baud Rate Divisor
//!
//! The chip divides its base clock by a fixed-point divisor with a 3-bit
//! fraction. The fraction is not sent as-is: the hardware expects it remapped
//! through a fixed table and placed at bit 14 of the encoded divisor.
//! ```text
//! encoded = integral | (FRACTION_CODE[fractional] << 14)
//! wValue  = encoded & 0xFFFF
//! wIndex  = (encoded >> 16) & 0xFFFF
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{
    ChipType, ControlRequest, DataBits, ModemStatus, Parity, ResetKind, StopBits, request,
};

/// Lowest supported baud rate
pub const MIN_BAUDRATE: u32 = 300;

/// Largest divisor the chip accepts (in eighths)
pub const MAX_DIVISOR: u32 = 0x1F_FFF8;

/// Fraction (in eighths) to hardware sub-integer code
const FRACTION_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

/// Hardware sub-integer code back to eighths
const FRACTION_EIGHTHS: [u32; 8] = [0, 4, 2, 1, 3, 5, 6, 7];

/// Build a RESET request
///
/// # Example
/// ```
/// use protocol::{build_reset, ResetKind};
///
/// let req = build_reset(ResetKind::PurgeRx);
/// assert_eq!(req.request, 0);
/// assert_eq!(req.value, 1);
/// ```
pub fn build_reset(kind: ResetKind) -> ControlRequest {
    ControlRequest {
        request: request::RESET,
        value: kind.code(),
        index: 0,
    }
}

/// Build a SET_BAUDRATE request for the given chip
///
/// Fails if the baud rate is below 300 or above half the chip's base clock.
///
/// # Example
/// ```
/// use protocol::{build_set_baudrate, ChipType};
///
/// // 3 MHz * 8 / 9600 = 2500 eighths = 312 + 4/8, fraction code 1
/// let req = build_set_baudrate(9600, ChipType::Variant232R).unwrap();
/// assert_eq!((req.value, req.index), (0x4138, 0));
/// ```
pub fn build_set_baudrate(baud: u32, chip: ChipType) -> Result<ControlRequest> {
    let (value, index) = baudrate_divisor(baud, chip)?;
    Ok(ControlRequest {
        request: request::SET_BAUDRATE,
        value,
        index,
    })
}

/// Compute the `(wValue, wIndex)` pair encoding `baud` for `chip`
pub fn baudrate_divisor(baud: u32, chip: ChipType) -> Result<(u16, u16)> {
    let base_clock = chip.base_clock();
    let max = base_clock / 2;
    if !(MIN_BAUDRATE..=max).contains(&baud) {
        return Err(ProtocolError::BaudRateOutOfRange {
            baud,
            min: MIN_BAUDRATE,
            max,
        });
    }

    let mut divisor = (base_clock * 8) / baud;
    if divisor == 8 {
        divisor = 1;
    } else if divisor < 8 {
        divisor = 0;
    } else if divisor > MAX_DIVISOR {
        divisor = MAX_DIVISOR;
    }

    let integral = divisor >> 3;
    let fractional = (divisor & 0x07) as usize;
    let encoded = integral | (FRACTION_CODE[fractional] << 14);

    let (value, index) = match divisor {
        0 => (0, 0),
        1 => (1, 0),
        _ => ((encoded & 0xFFFF) as u16, ((encoded >> 16) & 0xFFFF) as u16),
    };
    Ok((value, index))
}

/// Recover the divisor (in eighths) from an encoded `(wValue, wIndex)` pair
///
/// Inverse of [`baudrate_divisor`] for divisors whose integral part fits in
/// 14 bits. The two sub-integer special values decode to themselves.
pub fn divisor_from_encoded(value: u16, index: u16) -> u32 {
    let encoded = u32::from(value) | (u32::from(index) << 16);
    if index == 0 && value <= 1 {
        return encoded;
    }
    let integral = encoded & 0x3FFF;
    let code = ((encoded >> 14) & 0x07) as usize;
    (integral << 3) | FRACTION_EIGHTHS[code]
}

/// Baud rate the chip actually runs at for an encoded divisor
///
/// Returns `None` for the sub-integer special values, which select the
/// chip's fixed top speeds rather than a divided clock.
pub fn effective_baudrate(value: u16, index: u16, chip: ChipType) -> Option<u32> {
    let divisor = divisor_from_encoded(value, index);
    if divisor < 8 {
        return None;
    }
    Some(chip.base_clock() * 8 / divisor)
}

/// Build a SET_DATA request (character size, parity, stop bits)
///
/// # Example
/// ```
/// use protocol::{build_set_line_property, DataBits, Parity, StopBits};
///
/// let req = build_set_line_property(DataBits::Seven, StopBits::One, Parity::Even);
/// assert_eq!(req.value, 0x0207);
/// ```
pub fn build_set_line_property(
    data_bits: DataBits,
    stop_bits: StopBits,
    parity: Parity,
) -> ControlRequest {
    ControlRequest {
        request: request::SET_DATA,
        value: data_bits.code() | (parity.code() << 8) | (stop_bits.code() << 11),
        index: 0,
    }
}

/// Build a SET_DATA request from raw numbers
///
/// `stop_bits_tenths` is the stop bit length times ten (10, 15 or 20).
pub fn build_set_line_property_raw(
    data_bits: u8,
    stop_bits_tenths: u8,
    parity: Parity,
) -> Result<ControlRequest> {
    let data_bits = DataBits::try_from(data_bits)?;
    let stop_bits = match stop_bits_tenths {
        10 => StopBits::One,
        15 => StopBits::OnePointFive,
        20 => StopBits::Two,
        other => {
            return Err(ProtocolError::InvalidArgument(format!(
                "unsupported stop bits: {}.{}",
                other / 10,
                other % 10
            )));
        }
    };
    Ok(build_set_line_property(data_bits, stop_bits, parity))
}

/// Build a SET_MODEM_CTRL request
///
/// Both lines are always placed under host control (high byte mask 0x03);
/// the low byte carries their levels.
pub fn build_set_modem_control(dtr: bool, rts: bool) -> ControlRequest {
    let mut value: u16 = 0x0300;
    if dtr {
        value |= 0x01;
    }
    if rts {
        value |= 0x02;
    }
    ControlRequest {
        request: request::SET_MODEM_CTRL,
        value,
        index: 0,
    }
}

/// Build a SET_LATENCY_TIMER request (1..=255 ms)
pub fn build_set_latency_timer(latency_ms: u8) -> Result<ControlRequest> {
    if latency_ms == 0 {
        return Err(ProtocolError::InvalidArgument(
            "latency timer must be at least 1 ms".to_string(),
        ));
    }
    Ok(ControlRequest {
        request: request::SET_LATENCY_TIMER,
        value: u16::from(latency_ms),
        index: 0,
    })
}

/// Decode the two status bytes at the start of a bulk-IN packet
///
/// # Example
/// ```
/// use protocol::parse_modem_status;
///
/// let status = parse_modem_status([0x00, 0xF0]);
/// assert!(status.cts && status.dsr && status.ri && status.rlsd);
/// ```
pub fn parse_modem_status(status: [u8; 2]) -> ModemStatus {
    let [b0, b1] = status;
    let bit = |byte: u8, n: u8| (byte >> n) & 0x01 != 0;

    ModemStatus {
        data_pending: bit(b0, 0),
        overrun: bit(b0, 1),
        parity_error: bit(b0, 2),
        framing_error: bit(b0, 3),
        break_received: bit(b0, 4),
        tx_holding_empty: bit(b0, 5),
        tx_empty: bit(b0, 6),
        cts: bit(b1, 4),
        dsr: bit(b1, 5),
        ri: bit(b1, 6),
        rlsd: bit(b1, 7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_values() {
        assert_eq!(build_reset(ResetKind::Sio).value, 0);
        assert_eq!(build_reset(ResetKind::PurgeRx).value, 1);
        assert_eq!(build_reset(ResetKind::PurgeTx).value, 2);
        assert_eq!(build_reset(ResetKind::PurgeTx).index, 0);
        assert_eq!(build_reset(ResetKind::Sio).request, request::RESET);
    }

    #[test]
    fn test_fraction_tables_are_inverse() {
        for eighths in 0..8 {
            assert_eq!(FRACTION_EIGHTHS[FRACTION_CODE[eighths] as usize] as usize, eighths);
        }
    }

    #[test]
    fn test_divisor_clamps() {
        // 3 MHz / 1.5 Mbaud: divisor 16, integral 2
        assert_eq!(
            baudrate_divisor(1_500_000, ChipType::Variant232R).unwrap(),
            (2, 0)
        );
        // 12 MHz / 6 Mbaud on 232H
        assert_eq!(
            baudrate_divisor(6_000_000, ChipType::Variant232H).unwrap(),
            (2, 0)
        );
    }

    #[test]
    fn test_fractional_encoding() {
        // 3 MHz * 8 / 115200 = 208 -> 26 + 0/8
        assert_eq!(
            baudrate_divisor(115_200, ChipType::Variant232R).unwrap(),
            (26, 0)
        );
        // 3 MHz * 8 / 921600 = 26 -> 3 + 2/8 -> code 2
        assert_eq!(
            baudrate_divisor(921_600, ChipType::Variant232R).unwrap(),
            (3 | (2 << 14), 0)
        );
        // 3 MHz * 8 / 57600 = 416 -> 52 + 0/8
        assert_eq!(
            baudrate_divisor(57_600, ChipType::Variant232R).unwrap(),
            (52, 0)
        );
        // 3 MHz * 8 / 38400 = 625 -> 78 + 1/8 -> code 3
        assert_eq!(
            baudrate_divisor(38_400, ChipType::Variant232R).unwrap(),
            (78 | (3 << 14), 0)
        );
    }

    #[test]
    fn test_fraction_code_reaching_index() {
        // 3 MHz * 8 / 460800 = 52 -> 6 + 4/8 -> code 1 (bit 14 only)
        assert_eq!(
            baudrate_divisor(460_800, ChipType::Variant232R).unwrap(),
            (6 | (1 << 14), 0)
        );
        // 3 MHz * 8 / 230400 = 104 -> 13 + 0/8
        assert_eq!(
            baudrate_divisor(230_400, ChipType::Variant232R).unwrap(),
            (13, 0)
        );
        // 6 MHz * 8 / 2_000_000 = 24 -> 3 + 0/8
        assert_eq!(
            baudrate_divisor(2_000_000, ChipType::Variant2232D).unwrap(),
            (3, 0)
        );
        // 3 MHz * 8 / 1_200_000 = 20 -> 2 + 4/8 -> code 1
        assert_eq!(
            baudrate_divisor(1_200_000, ChipType::Variant232R).unwrap(),
            (2 | (1 << 14), 0)
        );
        // 3 MHz * 8 / 1_100_000 = 21 -> 2 + 5/8 -> code 5 -> bits 14 and 16
        assert_eq!(
            baudrate_divisor(1_100_000, ChipType::Variant232R).unwrap(),
            (2 | (1 << 14), 1)
        );
    }

    #[test]
    fn test_latency_timer() {
        let req = build_set_latency_timer(16).unwrap();
        assert_eq!(req.request, request::SET_LATENCY_TIMER);
        assert_eq!(req.value, 16);
        assert!(build_set_latency_timer(255).is_ok());
        assert!(matches!(
            build_set_latency_timer(0),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_line_property_raw() {
        assert_eq!(
            build_set_line_property_raw(8, 15, Parity::Odd).unwrap().value,
            8 | (1 << 8) | (1 << 11)
        );
        assert!(build_set_line_property_raw(9, 10, Parity::None).is_err());
        assert!(build_set_line_property_raw(8, 30, Parity::None).is_err());
    }

    #[test]
    fn test_parse_ignores_reserved_bits() {
        let status = parse_modem_status([0x80, 0x0F]);
        assert_eq!(status, ModemStatus::default());
    }

    #[test]
    fn test_effective_baudrate() {
        let (value, index) = baudrate_divisor(9600, ChipType::Variant232R).unwrap();
        assert_eq!(effective_baudrate(value, index, ChipType::Variant232R), Some(9600));
        assert_eq!(effective_baudrate(0, 0, ChipType::Variant232R), None);
        assert_eq!(effective_baudrate(1, 0, ChipType::Variant232R), None);
    }
}
