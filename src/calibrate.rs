use crate::board::DevBoard;
use crate::cmd::DevboardError;
use crate::part::Part;
use crate::usb::Transport;

type Result<T> = ::std::result::Result<T, DevboardError>;

/// Word the search starts from.
pub const INITIAL_FTW: u8 = 0x80;

/// Bounds of the trim search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimSettings {
    /// Accepted distance from the target, in Hz.
    pub tolerance_hz: u32,
    pub max_iterations: u32,
}
impl Default for TrimSettings {
    fn default() -> Self {
        TrimSettings {
            tolerance_hz: 50,
            max_iterations: 16,
        }
    }
}

/// Searches the trim word that brings the oscillator of `part` to
/// `target_hz` with the socket at `voltage`, and returns it.
///
/// The board is left with the returned word applied.
pub fn trim_oscillator<T: Transport>(
    board: &mut DevBoard<T>,
    part: Part,
    voltage: f64,
    target_hz: u32,
    settings: &TrimSettings,
) -> Result<u8> {
    if target_hz == 0 {
        return Err(DevboardError::InvalidArgument("target frequency must be nonzero"));
    }
    if settings.max_iterations == 0 {
        return Err(DevboardError::InvalidArgument("trim needs at least one iteration"));
    }
    board.set_part(part)?;
    board.power_socket(voltage)?;

    let mut lo: i32 = 0;
    let mut hi: i32 = 255;
    let mut ftw = INITIAL_FTW;
    let mut best: Option<(u8, u32)> = None;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;
        board.trim_oscillator(ftw)?;
        let hz = board.measure_oscillator_frequency()?;
        let error = hz.abs_diff(target_hz);
        log::debug!("trim {:#04x}: {} Hz (off by {})", ftw, hz, error);

        if best.map_or(true, |(_, b)| error < b.abs_diff(target_hz)) {
            best = Some((ftw, hz));
        }
        if error <= settings.tolerance_hz {
            log::info!("oscillator trimmed to {:#04x} ({} Hz)", ftw, hz);
            return Ok(ftw);
        }

        if hz < target_hz {
            lo = i32::from(ftw) + 1;
        } else {
            hi = i32::from(ftw) - 1;
        }
        if lo > hi {
            break;
        }
        ftw = ((lo + hi) / 2) as u8;
    }

    let (best_ftw, best_hz) = best.unwrap_or((ftw, 0));
    if let Err(e) = board.trim_oscillator(best_ftw) {
        log::warn!("could not restore best trim word: {}", e);
    }
    log::error!(
        "oscillator did not converge on {} Hz, best {:#04x} gave {} Hz",
        target_hz,
        best_ftw,
        best_hz
    );
    Err(DevboardError::CalibrationDidNotConverge {
        target_hz,
        best_ftw,
        best_hz,
        iterations,
    })
}
