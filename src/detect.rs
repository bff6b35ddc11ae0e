use crate::board::DevBoard;
use crate::cmd::{DevboardError, DownloadMode};
use crate::io::{Drive, IoConfig};
use crate::part::{classify_bitstream, BitstreamKind, Part};
use crate::usb::Transport;

type Result<T> = ::std::result::Result<T, DevboardError>;

/// Socket supply used while probing.
pub const DETECT_VOLTAGE: f64 = 3.3;

/// Probe order. A part of another family reads back as all ones, which never
/// classifies, so the order only matters for speed.
const CANDIDATES: [Part; 2] = [Part::Slg4662xv, Part::Slg46140v];

/// Pin 14 is a GPIO on the SLG46620V and the second supply on the SLG46621V.
const VDD2_PIN: u8 = 14;

/// Outcome of [`detect_part`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub part: Part,
    /// NVRAM contents as read back during detection.
    pub bitstream: Vec<u8>,
    pub kind: BitstreamKind,
}

/// Figures out which part sits in the socket by reading back its NVRAM with
/// each candidate coding. Leaves the board set to the detected part with the
/// socket powered.
pub fn detect_part<T: Transport>(board: &mut DevBoard<T>) -> Result<Detection> {
    for candidate in CANDIDATES {
        board.set_part(candidate)?;
        board.set_io_config(&IoConfig::new())?;
        board.power_socket(DETECT_VOLTAGE)?;

        let bitstream = board.download_bitstream(DownloadMode::Programming)?;
        let kind = classify_bitstream(candidate, &bitstream);
        log::debug!("probing as {}: {:?}", candidate, kind);
        if kind == BitstreamKind::Unrecognized {
            continue;
        }

        let part = match candidate {
            Part::Slg4662xv => distinguish_slg4662x(board)?,
            part => part,
        };
        board.set_part(part)?;
        log::info!("detected {} ({:?})", part, kind);
        return Ok(Detection {
            part,
            bitstream,
            kind,
        });
    }

    Err(DevboardError::NoPartDetected)
}

/// Tells an SLG46620V from an SLG46621V. The socket must be powered.
///
/// A weak pull-up on pin 14 holds a floating GPIO near the supply, but the
/// SLG46621V's second supply pin loads it well below half of it.
pub fn distinguish_slg4662x<T: Transport>(board: &mut DevBoard<T>) -> Result<Part> {
    let mut io = IoConfig::new();
    io.drive(VDD2_PIN, Drive::PULLUP)?;
    board.set_io_config(&io)?;
    let voltage = board.single_read_adc(VDD2_PIN)?;
    board.set_io_config(&IoConfig::new())?;

    log::debug!("pin {} reads {:.3} V under pull-up", VDD2_PIN, voltage);
    if voltage < DETECT_VOLTAGE / 2.0 {
        Ok(Part::Slg46621v)
    } else {
        Ok(Part::Slg46620v)
    }
}

/// Fails unless exactly `expected` is in the socket.
pub fn verify_device_present<T: Transport>(
    board: &mut DevBoard<T>,
    expected: Part,
) -> Result<Detection> {
    let detection = detect_part(board)?;
    if detection.part != expected {
        log::error!("expected {} but found {}", expected, detection.part);
        return Err(DevboardError::WrongPart {
            expected,
            detected: detection.part,
        });
    }
    Ok(detection)
}
