use serde::Deserialize;

use crate::cmd::DevboardError;

/// Number of slots in the test point table. Slots 0, 1 and 11 are not test
/// points; slot 1 doubles as the socket Vdd on the expansion connector.
pub const TEST_POINT_SLOTS: usize = 21;

/// Indexes of the test points wired to the socket.
pub const TEST_POINTS: [u8; 18] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 13, 14, 15, 16, 17, 18, 19, 20,
];

/// Signal generator channel feeding the socket supply.
pub const VDD_CHANNEL: u8 = 1;

/// Returns true for slots the board actually drives.
pub fn is_test_point(index: u8) -> bool {
    matches!(index, 2..=10 | 12..=20)
}

/// Logic level a test point driver produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
    /// Follows the signal generator channel of the same index.
    Siggen,
}

/// Output stage used by a test point driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// Push-pull, strong.
    Strong,
    /// Push-pull, weak.
    Weak,
    /// Push-pull, very weak.
    VeryWeak,
    /// Open drain NMOS with an opposing pull-up.
    OpenDrainPullUp,
    /// Open drain PMOS with an opposing pull-down.
    OpenDrainPullDown,
    /// Bare open drain PMOS.
    OpenDrainPmos,
    /// Bare open drain NMOS.
    OpenDrainNmos,
}

/// Configuration of one test point driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Drive {
    /// Driver disconnected.
    #[default]
    Float,
    Driven { level: Level, strength: Strength },
}
impl Drive {
    pub const VDD: Drive = Drive::Driven {
        level: Level::High,
        strength: Strength::Strong,
    };
    pub const GND: Drive = Drive::Driven {
        level: Level::Low,
        strength: Strength::Strong,
    };
    pub const PULLUP: Drive = Drive::Driven {
        level: Level::High,
        strength: Strength::Weak,
    };
    pub const PULLDOWN: Drive = Drive::Driven {
        level: Level::Low,
        strength: Strength::Weak,
    };
    pub const LOGIC_PUSH_PULL: Drive = Drive::Driven {
        level: Level::Siggen,
        strength: Strength::Strong,
    };
    /// Releases pins that stay stuck after an SRAM upload.
    pub const RESET: Drive = Drive::Driven {
        level: Level::High,
        strength: Strength::VeryWeak,
    };

    /// Board coding of the driver: strength in bits 9..11, level in bits 0..1.
    pub fn code(self) -> u16 {
        match self {
            Drive::Float => 0x0200,
            Drive::Driven { level, strength } => {
                let strength = match strength {
                    Strength::Strong => 0x0c00,
                    Strength::Weak => 0x0e00,
                    Strength::VeryWeak => 0x0000,
                    Strength::OpenDrainPullUp => 0x0400,
                    Strength::OpenDrainPullDown => 0x0600,
                    Strength::OpenDrainPmos => 0x0a00,
                    Strength::OpenDrainNmos => 0x0800,
                };
                let level = match level {
                    Level::Low => 0x0000,
                    Level::High => 0x0001,
                    Level::Siggen => 0x0003,
                };
                strength | level
            }
        }
    }
}

/// Settings of one slot in the test point table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestPoint {
    pub drive: Drive,
    pub led_enabled: bool,
    pub led_inverted: bool,
    pub expansion_enabled: bool,
}

/// Full test point table, indexed the same way the board numbers its pins.
///
/// Every slot is always sent, including the ones the board ignores.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoConfig {
    pub slots: [TestPoint; TEST_POINT_SLOTS],
}
impl IoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the driver of one test point.
    pub fn drive(&mut self, index: u8, drive: Drive) -> Result<&mut Self, DevboardError> {
        if !is_test_point(index) {
            return Err(DevboardError::InvalidArgument("not a test point"));
        }
        self.slots[index as usize].drive = drive;
        Ok(self)
    }

    /// Serializes the table: 21 little-endian driver codes followed by three
    /// 21-bit masks (LED enabled, LED inverted, expansion enabled).
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TEST_POINT_SLOTS * 2 + 9);
        for slot in &self.slots {
            out.extend_from_slice(&slot.drive.code().to_le_bytes());
        }

        let mask = |pick: fn(&TestPoint) -> bool| -> [u8; 3] {
            let bits = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| pick(slot))
                .fold(0u32, |acc, (i, _)| acc | (1 << i));
            let bytes = bits.to_le_bytes();
            [bytes[0], bytes[1], bytes[2]]
        };
        out.extend_from_slice(&mask(|s| s.led_enabled));
        out.extend_from_slice(&mask(|s| s.led_inverted));
        out.extend_from_slice(&mask(|s| s.expansion_enabled));
        out
    }
}

#[derive(Deserialize, Debug, Clone)]
#[repr(C, packed)]
struct StatusReply {
    flags: u8,
    voltage_a_mv: u16,
    voltage_b_mv: u16,
}

/// Snapshot of the board's health monitors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoardStatus {
    pub internal_overcurrent: bool,
    pub external_overcurrent: bool,
    pub internal_undervoltage: bool,
    pub voltage_a: f64,
    pub voltage_b: f64,
}
impl BoardStatus {
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, DevboardError> {
        let reply: StatusReply =
            bincode::deserialize(payload).map_err(|e| DevboardError::CmdDeserializeFailure(e))?;
        let flags = reply.flags;
        let voltage_a_mv = reply.voltage_a_mv;
        let voltage_b_mv = reply.voltage_b_mv;
        Ok(BoardStatus {
            internal_overcurrent: flags & 0x01 != 0,
            external_overcurrent: flags & 0x02 != 0,
            internal_undervoltage: flags & 0x04 != 0,
            voltage_a: f64::from(voltage_a_mv) / 1000.0,
            voltage_b: f64::from(voltage_b_mv) / 1000.0,
        })
    }

    pub fn is_fault(&self) -> bool {
        self.internal_overcurrent || self.external_overcurrent || self.internal_undervoltage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_floats_everything() {
        let cfg = IoConfig::new();
        let bytes = cfg.encode();
        assert_eq!(bytes.len(), 51);
        for slot in 0..TEST_POINT_SLOTS {
            assert_eq!(&bytes[slot * 2..slot * 2 + 2], &[0x00, 0x02]);
        }
        assert!(bytes[42..].iter().all(|&b| b == 0));
    }

    #[test]
    fn drive_codes_match_board() {
        assert_eq!(Drive::VDD.code(), 0x0c01);
        assert_eq!(Drive::GND.code(), 0x0c00);
        assert_eq!(Drive::PULLUP.code(), 0x0e01);
        assert_eq!(Drive::RESET.code(), 0x0001);
        assert_eq!(Drive::LOGIC_PUSH_PULL.code(), 0x0c03);
        let od = Drive::Driven {
            level: Level::Siggen,
            strength: Strength::OpenDrainNmos,
        };
        assert_eq!(od.code(), 0x0803);
    }

    #[test]
    fn masks_and_slot_checks() {
        let mut cfg = IoConfig::new();
        cfg.drive(20, Drive::GND).unwrap();
        cfg.slots[3].led_enabled = true;
        cfg.slots[20].expansion_enabled = true;
        assert!(cfg.drive(11, Drive::GND).is_err());
        assert!(cfg.drive(1, Drive::GND).is_err());

        let bytes = cfg.encode();
        assert_eq!(&bytes[40..42], &[0x00, 0x0c]);
        assert_eq!(&bytes[42..45], &[0x08, 0x00, 0x00]);
        assert_eq!(&bytes[48..51], &[0x00, 0x00, 0x10]);
    }

    #[test]
    fn status_flags() {
        let status = BoardStatus::decode(&[0x05, 0xe4, 0x0c, 0x88, 0x13]).unwrap();
        assert!(status.internal_overcurrent);
        assert!(!status.external_overcurrent);
        assert!(status.internal_undervoltage);
        assert!((status.voltage_a - 3.3).abs() < 1e-9);
        assert!((status.voltage_b - 5.0).abs() < 1e-9);
        assert!(status.is_fault());

        assert!(BoardStatus::decode(&[0x00, 0x01]).is_err());
    }
}
