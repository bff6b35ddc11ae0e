//! Property-based tests for bitstream patching, hex decoding and frame
//! sequencing.

use gpdevboard::part::PartLayout;
use gpdevboard::{
    bitstream_from_hex, classify_bitstream, tweak_bitstream, BitstreamKind, Frame, PacketType,
    Part,
};
use proptest::prelude::*;

/// Generate a supported part together with a programmed image for it.
fn programmed_bitstream() -> impl Strategy<Value = (Part, Vec<u8>)> {
    prop_oneof![
        Just(Part::Slg46140v),
        Just(Part::Slg46620v),
        Just(Part::Slg46621v),
    ]
    .prop_flat_map(|part| {
        let layout = part.layout().unwrap();
        (
            Just(part),
            prop::collection::vec(any::<u8>(), layout.len).prop_map(move |mut bs| {
                bs[layout.marker_offset] = layout.marker;
                bs
            }),
        )
    })
}

fn is_patched_bit(layout: &PartLayout, bit: usize) -> bool {
    (layout.trim_bit..layout.trim_bit + 8).contains(&bit)
        || (layout.pattern_id_bit..layout.pattern_id_bit + 8).contains(&bit)
        || bit == layout.read_protect_bit
}

proptest! {
    /// Patching keeps the image programmed, exposes the new pattern id and
    /// leaves every other bit alone.
    #[test]
    fn tweak_only_touches_its_fields(
        (part, original) in programmed_bitstream(),
        trim in any::<u8>(),
        pattern_id in any::<u8>(),
        read_protect in any::<bool>(),
    ) {
        let layout = part.layout().unwrap();
        let mut bs = original.clone();
        tweak_bitstream(&mut bs, part, trim, pattern_id, read_protect).unwrap();

        prop_assert_eq!(
            classify_bitstream(part, &bs),
            BitstreamKind::Programmed { pattern_id }
        );
        for bit in 0..layout.len * 8 {
            if is_patched_bit(layout, bit) {
                continue;
            }
            let before = original[bit / 8] >> (bit % 8) & 1;
            let after = bs[bit / 8] >> (bit % 8) & 1;
            prop_assert_eq!(before, after, "bit {} changed", bit);
        }

        // idempotent
        let once = bs.clone();
        tweak_bitstream(&mut bs, part, trim, pattern_id, read_protect).unwrap();
        prop_assert_eq!(once, bs);
    }

    /// Any length other than the part's own never classifies.
    #[test]
    fn wrong_length_is_unrecognized(len in 0usize..512) {
        for part in [Part::Slg46140v, Part::Slg46620v] {
            let bs = vec![0u8; len];
            let kind = classify_bitstream(part, &bs);
            if len == part.bitstream_len() {
                prop_assert_eq!(kind, BitstreamKind::Empty);
            } else {
                prop_assert_eq!(kind, BitstreamKind::Unrecognized);
            }
        }
    }

    /// Hex encoding then decoding reproduces the bytes.
    #[test]
    fn hex_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..300), upper in any::<bool>()) {
        let hex: String = bytes
            .iter()
            .map(|b| if upper { format!("{:02X}", b) } else { format!("{:02x}", b) })
            .collect();
        prop_assert_eq!(bitstream_from_hex(&hex).unwrap(), bytes);
    }

    #[test]
    fn odd_length_hex_fails(hex in "[0-9a-f]{0,40}") {
        let odd = format!("{}0", hex);
        let odd = if odd.len() % 2 == 0 { format!("{}f", odd) } else { odd };
        prop_assert!(bitstream_from_hex(&odd).is_err());
    }

    #[test]
    fn non_hex_character_fails(prefix in "([0-9a-f]{2}){0,10}", bad in "[g-zG-Z :x]") {
        let hex = format!("{}{}0", prefix, bad);
        prop_assert!(bitstream_from_hex(&hex).is_err());
    }

    /// Each successor advances the forward index and steps back the reverse one.
    #[test]
    fn frame_sequence(n in 0u8..=254) {
        let mut frame = Frame::new(PacketType::WriteBitstreamNvram);
        let mut seen = vec![frame.forward_index()];
        for _ in 0..n {
            frame = frame.next();
            prop_assert!(!seen.contains(&frame.forward_index()));
            seen.push(frame.forward_index());
        }
        prop_assert_eq!(frame.forward_index(), 1u8.wrapping_add(n));
        prop_assert_eq!(frame.reverse_index(), 0u8.wrapping_sub(n));
        prop_assert_eq!(frame.packet_type(), PacketType::WriteBitstreamNvram);
    }
}
