//! Chip classification and configuration descriptor scanning
//!
//! The configuration descriptor is taken as the raw byte blob returned by the
//! host stack. It is walked as a chain of `bLength`/`bDescriptorType` records,
//! bounded by `wTotalLength` and by the slice itself.

use crate::error::{ProtocolError, Result};
use crate::types::{ChipType, InterfaceInfo, pid};

/// Standard descriptor type codes
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;

/// Vendor-specific interface class
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

const ENDPOINT_DIR_IN: u8 = 0x80;
const TRANSFER_TYPE_MASK: u8 = 0x03;
const TRANSFER_TYPE_BULK: u8 = 0x02;

const INTERFACE_DESC_LEN: usize = 9;
const ENDPOINT_DESC_LEN: usize = 7;

/// Classify the chip from its USB product ID
pub fn classify_chip(product_id: u16) -> ChipType {
    match product_id {
        pid::FT232R => ChipType::Variant232R,
        pid::FT232H => ChipType::Variant232H,
        pid::FT2232D => ChipType::Variant2232D,
        pid::FT4232H => ChipType::Variant4232H,
        pid::FT230X => ChipType::Variant230X,
        _ => ChipType::Unknown,
    }
}

/// Iterator over `(descriptor_type, bytes)` records of a descriptor blob
struct Descriptors<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = usize::from(*self.data.first()?);
        // A zero or truncated length ends the walk rather than looping forever
        if len < 2 || len > self.data.len() {
            return None;
        }
        let (record, rest) = self.data.split_at(len);
        self.data = rest;
        Some((record[1], record))
    }
}

fn descriptors(config: &[u8]) -> Descriptors<'_> {
    let total = if config.len() >= 4 && config[1] == DESC_TYPE_CONFIGURATION {
        usize::from(u16::from_le_bytes([config[2], config[3]])).min(config.len())
    } else {
        config.len()
    };
    Descriptors {
        data: &config[..total],
    }
}

fn not_found(index: u8, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InterfaceNotFound {
        index,
        reason: reason.into(),
    }
}

/// Locate the vendor interface `interface_index` and its bulk endpoint pair
///
/// Only alternate setting 0 is considered. The interface must be
/// vendor-specific, declare at least two endpoints and expose exactly one
/// bulk-IN and one bulk-OUT endpoint.
pub fn resolve_interface(config: &[u8], interface_index: u8) -> Result<InterfaceInfo> {
    let mut records = descriptors(config);

    let intf = records
        .by_ref()
        .find(|(kind, bytes)| {
            *kind == DESC_TYPE_INTERFACE
                && bytes.len() >= INTERFACE_DESC_LEN
                && bytes[2] == interface_index
                && bytes[3] == 0
        })
        .map(|(_, bytes)| bytes)
        .ok_or_else(|| not_found(interface_index, "no such interface"))?;

    let interface_class = intf[5];
    if interface_class != CLASS_VENDOR_SPECIFIC {
        return Err(not_found(
            interface_index,
            format!("interface class {:#04x} is not vendor-specific", interface_class),
        ));
    }

    let num_endpoints = usize::from(intf[4]);
    if num_endpoints < 2 {
        return Err(not_found(
            interface_index,
            format!("only {} endpoint(s)", num_endpoints),
        ));
    }

    let mut bulk_in: Option<(u8, u16)> = None;
    let mut bulk_out: Option<(u8, u16)> = None;

    let endpoints = records
        .take_while(|(kind, _)| *kind != DESC_TYPE_INTERFACE)
        .filter(|(kind, bytes)| *kind == DESC_TYPE_ENDPOINT && bytes.len() >= ENDPOINT_DESC_LEN)
        .take(num_endpoints);

    for (_, ep) in endpoints {
        let address = ep[2];
        let attributes = ep[3];
        let max_packet_size = u16::from_le_bytes([ep[4], ep[5]]);

        if attributes & TRANSFER_TYPE_MASK != TRANSFER_TYPE_BULK {
            continue;
        }

        let slot = if address & ENDPOINT_DIR_IN != 0 {
            &mut bulk_in
        } else {
            &mut bulk_out
        };
        if slot.is_some() {
            return Err(not_found(
                interface_index,
                format!("duplicate bulk endpoint {:#04x}", address),
            ));
        }
        *slot = Some((address, max_packet_size));
    }

    match (bulk_in, bulk_out) {
        (Some((in_ep, in_mps)), Some((out_ep, out_mps))) => Ok(InterfaceInfo {
            interface_number: intf[2],
            alternate_setting: intf[3],
            bulk_in_endpoint: in_ep,
            bulk_in_max_packet_size: in_mps,
            bulk_out_endpoint: out_ep,
            bulk_out_max_packet_size: out_mps,
        }),
        _ => Err(not_found(
            interface_index,
            "missing bulk IN or bulk OUT endpoint",
        )),
    }
}

/// Build a configuration descriptor describing FTDI-style vendor interfaces
///
/// Each entry is `(bulk_in_endpoint, bulk_out_endpoint, max_packet_size)` and
/// becomes interface number `i`. Used by tests and the mock host.
pub fn build_config_descriptor(interfaces: &[(u8, u8, u16)]) -> Vec<u8> {
    let mut out = vec![
        9,
        DESC_TYPE_CONFIGURATION,
        0,
        0,
        interfaces.len() as u8,
        1,
        0,
        0x80,
        0x2D,
    ];
    for (number, (in_ep, out_ep, mps)) in interfaces.iter().enumerate() {
        out.extend_from_slice(&[
            9,
            DESC_TYPE_INTERFACE,
            number as u8,
            0,
            2,
            CLASS_VENDOR_SPECIFIC,
            CLASS_VENDOR_SPECIFIC,
            CLASS_VENDOR_SPECIFIC,
            2,
        ]);
        for ep in [*in_ep, *out_ep] {
            let [lo, hi] = mps.to_le_bytes();
            out.extend_from_slice(&[7, DESC_TYPE_ENDPOINT, ep, TRANSFER_TYPE_BULK, lo, hi, 0]);
        }
    }
    let [lo, hi] = (out.len() as u16).to_le_bytes();
    out[2] = lo;
    out[3] = hi;
    out
}
