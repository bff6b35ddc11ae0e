use std::fmt;

use crate::cmd::DevboardError;

/// Supported parts. The high 8 bits of the code are the bitstream coding,
/// the low 4 bits are specific to the development board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Part {
    Slg46140v = 0x140,
    Slg46620v = 0x620,
    Slg46621v = 0x621,
    /// Either SLG46620V or SLG46621V; both share one bitstream coding.
    Slg4662xv = 0x62f,
    Unrecognized = 0xfff,
}
impl Part {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Part::Slg46140v => "SLG46140V",
            Part::Slg46620v => "SLG46620V",
            Part::Slg46621v => "SLG46621V",
            Part::Slg4662xv => "SLG4662xV",
            Part::Unrecognized => "<unrecognized>",
        }
    }

    /// Bitstream length in bytes; 0 for [`Part::Unrecognized`].
    pub fn bitstream_len(self) -> usize {
        self.layout().map_or(0, |l| l.len)
    }

    pub fn layout(self) -> Option<&'static PartLayout> {
        let family = match self {
            Part::Slg46140v => 0x14,
            Part::Slg46620v | Part::Slg46621v | Part::Slg4662xv => 0x62,
            Part::Unrecognized => return None,
        };
        LAYOUTS.iter().find(|l| l.family == family)
    }
}
impl TryFrom<u16> for Part {
    type Error = DevboardError;

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            0x140 => Ok(Part::Slg46140v),
            0x620 => Ok(Part::Slg46620v),
            0x621 => Ok(Part::Slg46621v),
            0x62f => Ok(Part::Slg4662xv),
            0xfff => Ok(Part::Unrecognized),
            _ => Err(DevboardError::UnrecognizedPart),
        }
    }
}
impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Location of the patchable fields in one family's bitstream.
///
/// Bit `n` of a bitstream lives in byte `n / 8`, bit `n % 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLayout {
    /// Bitstream coding, the high byte of the part code.
    pub family: u8,
    /// Image size in bytes.
    pub len: usize,
    /// Value every byte of a blank part reads back as.
    pub blank: u8,
    /// Byte holding the programmed marker.
    pub marker_offset: usize,
    /// Marker value of an image that has been programmed.
    pub marker: u8,
    /// First bit of the 8-bit oscillator trim.
    pub trim_bit: usize,
    /// First bit of the 8-bit pattern id.
    pub pattern_id_bit: usize,
    pub read_protect_bit: usize,
}

pub const LAYOUTS: [PartLayout; 2] = [
    PartLayout {
        family: 0x14,
        len: 128,
        blank: 0x00,
        marker_offset: 127,
        marker: 0xa5,
        trim_bit: 999,
        pattern_id_bit: 1007,
        read_protect_bit: 1015,
    },
    PartLayout {
        family: 0x62,
        len: 256,
        blank: 0x00,
        marker_offset: 255,
        marker: 0xa5,
        trim_bit: 2023,
        pattern_id_bit: 2031,
        read_protect_bit: 2039,
    },
];

/// Bitstream length in bytes for `part`.
pub fn bitstream_length(part: Part) -> usize {
    part.bitstream_len()
}

/// What a bitstream read back from a part turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamKind {
    Unrecognized,
    Empty,
    Programmed { pattern_id: u8 },
}

/// Classifies `bitstream` as read from `part`.
///
/// Anything that is neither blank nor carries the programmed marker,
/// including images of the wrong length, is [`BitstreamKind::Unrecognized`].
pub fn classify_bitstream(part: Part, bitstream: &[u8]) -> BitstreamKind {
    let layout = match part.layout() {
        Some(l) if l.len == bitstream.len() => l,
        _ => return BitstreamKind::Unrecognized,
    };

    if bitstream.iter().all(|&b| b == layout.blank) {
        return BitstreamKind::Empty;
    }
    if bitstream[layout.marker_offset] == layout.marker {
        return BitstreamKind::Programmed {
            pattern_id: read_bits(bitstream, layout.pattern_id_bit, 8),
        };
    }
    BitstreamKind::Unrecognized
}

/// Patches oscillator trim, pattern id and read protection into `bitstream`.
/// No other bit is modified.
pub fn tweak_bitstream(
    bitstream: &mut [u8],
    part: Part,
    osc_trim: u8,
    pattern_id: u8,
    read_protect: bool,
) -> Result<(), DevboardError> {
    let layout = part.layout().ok_or(DevboardError::UnrecognizedPart)?;
    if bitstream.len() != layout.len {
        return Err(DevboardError::BitstreamLengthMismatch {
            part,
            expected: layout.len,
            actual: bitstream.len(),
        });
    }

    write_bits(bitstream, layout.trim_bit, 8, osc_trim);
    write_bits(bitstream, layout.pattern_id_bit, 8, pattern_id);
    write_bits(bitstream, layout.read_protect_bit, 1, read_protect as u8);
    Ok(())
}

/// Reads back the oscillator trim stored in `bitstream`.
pub fn bitstream_osc_trim(part: Part, bitstream: &[u8]) -> Option<u8> {
    let layout = part.layout().filter(|l| l.len == bitstream.len())?;
    Some(read_bits(bitstream, layout.trim_bit, 8))
}

/// Reads back the read-protect bit stored in `bitstream`.
pub fn bitstream_read_protected(part: Part, bitstream: &[u8]) -> Option<bool> {
    let layout = part.layout().filter(|l| l.len == bitstream.len())?;
    Some(read_bits(bitstream, layout.read_protect_bit, 1) != 0)
}

fn read_bits(bitstream: &[u8], first: usize, width: usize) -> u8 {
    (0..width).fold(0u8, |acc, i| {
        let bit = first + i;
        let set = bitstream[bit / 8] >> (bit % 8) & 1;
        acc | (set << i)
    })
}

fn write_bits(bitstream: &mut [u8], first: usize, width: usize, value: u8) {
    for i in 0..width {
        let bit = first + i;
        let mask = 1u8 << (bit % 8);
        if value >> i & 1 != 0 {
            bitstream[bit / 8] |= mask;
        } else {
            bitstream[bit / 8] &= !mask;
        }
    }
}

/// Strict hex decode: even length, hex digits only, no separators.
pub fn bitstream_from_hex(hex: &str) -> Result<Vec<u8>, DevboardError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DevboardError::InvalidHex("odd number of digits"));
    }

    hex.chunks(2)
        .map(|pair| -> Result<u8, DevboardError> {
            let digit = |c: u8| {
                (c as char)
                    .to_digit(16)
                    .ok_or(DevboardError::InvalidHex("non-hex character"))
            };
            Ok((digit(pair[0])? << 4 | digit(pair[1])?) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed(part: Part) -> Vec<u8> {
        let layout = part.layout().unwrap();
        let mut bs: Vec<u8> = (0..layout.len).map(|i| (i * 7) as u8).collect();
        bs[layout.marker_offset] = layout.marker;
        bs
    }

    #[test]
    fn lengths() {
        assert_eq!(bitstream_length(Part::Slg46140v), 128);
        assert_eq!(bitstream_length(Part::Slg46620v), 256);
        assert_eq!(bitstream_length(Part::Slg46621v), 256);
        assert_eq!(bitstream_length(Part::Slg4662xv), 256);
        assert_eq!(bitstream_length(Part::Unrecognized), 0);
    }

    #[test]
    fn part_codes() {
        assert_eq!(Part::Slg4662xv.code(), 0x62f);
        assert_eq!(Part::try_from(0x621).unwrap(), Part::Slg46621v);
        assert!(Part::try_from(0x123).is_err());
        assert_eq!(Part::Slg46140v.to_string(), "SLG46140V");
    }

    #[test]
    fn classify_blank_and_wrong_length() {
        assert_eq!(
            classify_bitstream(Part::Slg46620v, &[0; 256]),
            BitstreamKind::Empty
        );
        assert_eq!(
            classify_bitstream(Part::Slg46140v, &[0; 256]),
            BitstreamKind::Unrecognized
        );
        assert_eq!(
            classify_bitstream(Part::Unrecognized, &[]),
            BitstreamKind::Unrecognized
        );
        assert_eq!(
            classify_bitstream(Part::Slg46620v, &[0xff; 256]),
            BitstreamKind::Unrecognized
        );
    }

    #[test]
    fn tweak_then_classify() {
        for part in [Part::Slg46140v, Part::Slg46620v] {
            let original = programmed(part);
            let mut bs = original.clone();
            tweak_bitstream(&mut bs, part, 0x5c, 0x3e, true).unwrap();

            assert_eq!(
                classify_bitstream(part, &bs),
                BitstreamKind::Programmed { pattern_id: 0x3e }
            );
            assert_eq!(bitstream_osc_trim(part, &bs), Some(0x5c));
            assert_eq!(bitstream_read_protected(part, &bs), Some(true));

            tweak_bitstream(&mut bs, part, 0, 0, false).unwrap();
            assert_eq!(bitstream_read_protected(part, &bs), Some(false));
        }
    }

    #[test]
    fn tweak_checks_length() {
        let mut bs = vec![0; 100];
        assert!(matches!(
            tweak_bitstream(&mut bs, Part::Slg46620v, 0, 0, false),
            Err(DevboardError::BitstreamLengthMismatch { expected: 256, actual: 100, .. })
        ));
        assert!(matches!(
            tweak_bitstream(&mut bs, Part::Unrecognized, 0, 0, false),
            Err(DevboardError::UnrecognizedPart)
        ));
    }

    #[test]
    fn hex() {
        assert_eq!(bitstream_from_hex("00a5FF").unwrap(), vec![0x00, 0xa5, 0xff]);
        assert_eq!(bitstream_from_hex("").unwrap(), Vec::<u8>::new());
        assert!(bitstream_from_hex("abc").is_err());
        assert!(bitstream_from_hex("0g").is_err());
        assert!(bitstream_from_hex("+1").is_err());
    }
}
