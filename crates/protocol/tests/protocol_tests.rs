//! Integration tests for the SIO codec and descriptor resolver
//!
//! Covers the documented wire values for every request builder, the status
//! byte decoder, and property checks on the baud rate divisor encoding.
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use proptest::prelude::*;
use protocol::{
    ChipType, DataBits, ModemStatus, Parity, ProtocolError, ResetKind, StopBits,
    baudrate_divisor, build_config_descriptor, build_reset, build_set_baudrate,
    build_set_latency_timer, build_set_line_property, build_set_modem_control, classify_chip,
    divisor_from_encoded, parse_modem_status, pid, request, resolve_interface,
};

const ALL_CHIPS: [ChipType; 6] = [
    ChipType::Unknown,
    ChipType::Variant232R,
    ChipType::Variant232H,
    ChipType::Variant2232D,
    ChipType::Variant4232H,
    ChipType::Variant230X,
];

mod baudrate {
    use super::*;

    #[test]
    fn test_9600_on_232r() {
        let req = build_set_baudrate(9600, ChipType::Variant232R).unwrap();
        assert_eq!(req.request, request::SET_BAUDRATE);
        // divisor 2500 = 312 * 8 + 4 -> fraction code 1 at bit 14
        assert_eq!(req.value, 312 | (1 << 14));
        assert_eq!(req.index, 0);
        assert_eq!(divisor_from_encoded(req.value, req.index), 2500);
    }

    #[test]
    fn test_19200_on_232r() {
        let req = build_set_baudrate(19200, ChipType::Variant232R).unwrap();
        // divisor 1250 = 156 * 8 + 2 -> fraction code 2 at bit 14
        assert_eq!(req.value, 156 | (2 << 14));
        assert_eq!(req.index, 0);
        assert_eq!(divisor_from_encoded(req.value, req.index), 1250);
    }

    #[test]
    fn test_115200_on_232r() {
        let req = build_set_baudrate(115_200, ChipType::Variant232R).unwrap();
        assert_eq!((req.value, req.index), (26, 0));
    }

    #[test]
    fn test_minimum_baud_has_large_divisor() {
        let req = build_set_baudrate(300, ChipType::Variant232R).unwrap();
        // 24_000_000 / 300 = 80000 eighths = 10000 + 0/8
        assert_eq!((req.value, req.index), (10000, 0));
    }

    #[test]
    fn test_out_of_range_rejected_for_every_chip() {
        for chip in ALL_CHIPS {
            for baud in [0, 100, 299, 10_000_000] {
                let err = build_set_baudrate(baud, chip).unwrap_err();
                assert!(
                    matches!(err, ProtocolError::BaudRateOutOfRange { .. }),
                    "{:?} @ {} should be rejected",
                    chip,
                    baud
                );
                assert!(err.is_invalid_argument());
            }
        }
    }

    #[test]
    fn test_upper_bound_is_half_base_clock() {
        assert!(build_set_baudrate(1_500_000, ChipType::Variant232R).is_ok());
        assert!(build_set_baudrate(1_500_001, ChipType::Variant232R).is_err());
        assert!(build_set_baudrate(3_000_000, ChipType::Variant4232H).is_ok());
        assert!(build_set_baudrate(6_000_000, ChipType::Variant232H).is_ok());
        assert!(build_set_baudrate(6_000_001, ChipType::Variant232H).is_err());
    }

    fn chip_strategy() -> impl Strategy<Value = ChipType> {
        prop::sample::select(ALL_CHIPS.to_vec())
    }

    proptest! {
        #[test]
        fn prop_divisor_is_deterministic(chip in chip_strategy(), baud in 300u32..=6_000_000) {
            let first = baudrate_divisor(baud, chip);
            let second = baudrate_divisor(baud, chip);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_encoding_round_trips(chip in chip_strategy(), baud in 300u32..=6_000_000) {
            let base = chip.base_clock();
            prop_assume!(baud <= base / 2);
            let divisor = base * 8 / baud;
            // The integral part shares bits 14.. with the fraction code
            prop_assume!(divisor >> 3 < 0x4000);

            let (value, index) = baudrate_divisor(baud, chip).unwrap();
            prop_assert_eq!(divisor_from_encoded(value, index), divisor);

            // Re-derived rate is within one eighth-step of the request
            let actual = u64::from(base) * 8 / u64::from(divisor);
            let next = u64::from(base) * 8 / u64::from(divisor + 1);
            prop_assert!(u64::from(baud) <= actual);
            prop_assert!(u64::from(baud) > next);
        }
    }
}

mod line_property {
    use super::*;

    #[test]
    fn test_8n1() {
        let req = build_set_line_property(DataBits::Eight, StopBits::One, Parity::None);
        assert_eq!(req.request, request::SET_DATA);
        assert_eq!(req.value, 0x0008);
        assert_eq!(req.index, 0);
    }

    #[test]
    fn test_7e1() {
        let req = build_set_line_property(DataBits::Seven, StopBits::One, Parity::Even);
        assert_eq!(req.value, 0x0207);
    }

    #[test]
    fn test_8n2() {
        let req = build_set_line_property(DataBits::Eight, StopBits::Two, Parity::None);
        assert_eq!(req.value, 0x1008);
    }

    #[test]
    fn test_space_parity_one_and_a_half_stop() {
        let req = build_set_line_property(DataBits::Seven, StopBits::OnePointFive, Parity::Space);
        assert_eq!(req.value, 7 | (4 << 8) | (1 << 11));
    }
}

mod modem_control {
    use super::*;

    #[test]
    fn test_all_line_combinations() {
        assert_eq!(build_set_modem_control(true, true).value, 0x0303);
        assert_eq!(build_set_modem_control(false, false).value, 0x0300);
        assert_eq!(build_set_modem_control(true, false).value, 0x0301);
        assert_eq!(build_set_modem_control(false, true).value, 0x0302);
        assert_eq!(
            build_set_modem_control(true, true).request,
            request::SET_MODEM_CTRL
        );
    }

    #[test]
    fn test_reset_and_latency() {
        let reset = build_reset(ResetKind::Sio);
        assert_eq!((reset.request, reset.value, reset.index), (0, 0, 0));

        let latency = build_set_latency_timer(16).unwrap();
        assert_eq!((latency.request, latency.value), (9, 16));
        assert!(build_set_latency_timer(0).is_err());
    }
}

mod status {
    use super::*;

    #[test]
    fn test_modem_lines_all_set() {
        let status = parse_modem_status([0x00, 0xF0]);
        assert!(status.cts && status.dsr && status.ri && status.rlsd);
        assert!(!status.data_pending);
        assert!(!status.overrun);
        assert!(!status.parity_error);
        assert!(!status.framing_error);
        assert!(!status.break_received);
        assert!(!status.tx_holding_empty);
        assert!(!status.tx_empty);
    }

    #[test]
    fn test_line_errors() {
        let status = parse_modem_status([0x0E, 0x00]);
        assert!(status.overrun);
        assert!(status.parity_error);
        assert!(status.framing_error);
        assert!(!status.data_pending);
        assert!(!status.break_received);
        assert!(!status.cts);
    }

    #[test]
    fn test_each_byte0_bit() {
        let expected: [fn(&ModemStatus) -> bool; 7] = [
            |s| s.data_pending,
            |s| s.overrun,
            |s| s.parity_error,
            |s| s.framing_error,
            |s| s.break_received,
            |s| s.tx_holding_empty,
            |s| s.tx_empty,
        ];
        for (bit, get) in expected.iter().enumerate() {
            let status = parse_modem_status([1 << bit, 0]);
            assert!(get(&status), "bit {} not decoded", bit);
        }
    }

    #[test]
    fn test_equality_drives_change_detection() {
        assert_eq!(parse_modem_status([0x60, 0x10]), parse_modem_status([0xE0, 0x1F]));
        assert_ne!(parse_modem_status([0x60, 0x10]), parse_modem_status([0x60, 0x30]));
    }
}

mod descriptor {
    use super::*;

    #[test]
    fn test_known_product_ids() {
        assert_eq!(classify_chip(pid::FT232R), ChipType::Variant232R);
        assert_eq!(classify_chip(pid::FT232H), ChipType::Variant232H);
        assert_eq!(classify_chip(pid::FT2232D), ChipType::Variant2232D);
        assert_eq!(classify_chip(pid::FT4232H), ChipType::Variant4232H);
        assert_eq!(classify_chip(pid::FT230X), ChipType::Variant230X);
        assert_eq!(classify_chip(0), ChipType::Unknown);
    }

    #[test]
    fn test_quad_chip_interfaces() {
        let config = build_config_descriptor(&[
            (0x81, 0x02, 512),
            (0x83, 0x04, 512),
            (0x85, 0x06, 512),
            (0x87, 0x08, 512),
        ]);
        for index in 0..4u8 {
            let info = resolve_interface(&config, index).unwrap();
            assert_eq!(info.bulk_in_endpoint, 0x81 + index * 2);
            assert_eq!(info.bulk_out_endpoint, 0x02 + index * 2);
        }
        assert!(resolve_interface(&config, 4).is_err());
    }

    #[test]
    fn test_line_settings_from_toml() {
        #[derive(serde::Deserialize)]
        struct Line {
            data_bits: DataBits,
            stop_bits: StopBits,
            parity: Parity,
        }

        let line: Line = toml::from_str(
            r#"
            data_bits = 7
            stop_bits = "1.5"
            parity = "mark"
            "#,
        )
        .unwrap();
        assert_eq!(line.data_bits, DataBits::Seven);
        assert_eq!(line.stop_bits, StopBits::OnePointFive);
        assert_eq!(line.parity, Parity::Mark);

        let bad: Result<Line, _> = toml::from_str("data_bits = 5\nstop_bits = \"1\"\nparity = \"none\"");
        assert!(bad.is_err());
    }
}
