use std::fmt;

use rusb::UsbContext;

use crate::board::DevBoard;
use crate::calibrate::{trim_oscillator, TrimSettings};
use crate::cmd::{BitstreamTarget, DevboardError};
use crate::config::BoardConfig;
use crate::detect::{verify_device_present, Detection};
use crate::part::{
    bitstream_read_protected, classify_bitstream, tweak_bitstream, BitstreamKind, Part,
};
use crate::usb::{Transport, UsbTransport};

type Result<T> = ::std::result::Result<T, DevboardError>;

/// Steps of a board bring-up, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Open,
    Reset,
    SetPart,
    Upload,
    Verify,
    Status,
    Trim,
    Patch,
}
impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Open => "open",
            SetupStage::Reset => "reset",
            SetupStage::SetPart => "set part",
            SetupStage::Upload => "bitstream upload",
            SetupStage::Verify => "device verification",
            SetupStage::Status => "status check",
            SetupStage::Trim => "oscillator trim",
            SetupStage::Patch => "trim patch",
        };
        f.write_str(name)
    }
}

/// What to bring the board up with.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupOptions {
    pub part: Part,
    pub supply_voltage: f64,
    /// Trim the RC oscillator to this frequency and patch the result into
    /// the bitstream.
    pub rc_osc_freq: Option<u32>,
    pub trim: TrimSettings,
}
impl SetupOptions {
    pub fn from_config(part: Part, rc_osc_freq: Option<u32>, config: &BoardConfig) -> Self {
        SetupOptions {
            part,
            supply_voltage: config.supply_voltage,
            rc_osc_freq,
            trim: config.trim_settings(),
        }
    }
}

/// Which physical board a multi-board setup should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardSelector {
    /// Position among all boards of the vendor, bootloader-mode ones included.
    Index(usize),
    /// USB serial number string.
    Serial(String),
}

/// A board that made it through [`test_setup`].
#[derive(Debug)]
pub struct SetupOutcome<T: Transport> {
    pub board: DevBoard<T>,
    pub detection: Detection,
    /// Trim word found, if trimming was requested.
    pub osc_trim: Option<u8>,
    /// Image left in SRAM, including the trim patch.
    pub bitstream: Vec<u8>,
}

fn stage<R>(stage: SetupStage, res: Result<R>) -> Result<R> {
    res.map_err(|e| {
        log::error!("test setup failed during {}: {}", stage, e);
        DevboardError::SetupFailed {
            stage,
            source: Box::new(e),
        }
    })
}

/// Resets the board, loads `bitstream` into the part's SRAM, checks the
/// expected part is present and healthy, and optionally trims the oscillator.
///
/// The board is consumed: on any failure it is dropped, which closes it, and
/// the error names the stage that failed.
pub fn test_setup<T: Transport>(
    mut board: DevBoard<T>,
    mut bitstream: Vec<u8>,
    opts: &SetupOptions,
) -> Result<SetupOutcome<T>> {
    let part = opts.part;
    log::info!("bringing up board for {}", part);

    stage(SetupStage::Reset, board.reset())?;
    stage(SetupStage::SetPart, board.set_part(part))?;
    if bitstream.len() != part.bitstream_len() {
        return stage(
            SetupStage::Upload,
            Err(DevboardError::BitstreamLengthMismatch {
                part,
                expected: part.bitstream_len(),
                actual: bitstream.len(),
            }),
        );
    }
    stage(
        SetupStage::Upload,
        board.upload_bitstream(&bitstream, BitstreamTarget::Sram),
    )?;
    let detection = stage(SetupStage::Verify, verify_device_present(&mut board, part))?;
    stage(SetupStage::Status, board.check_status())?;

    let osc_trim = match opts.rc_osc_freq {
        Some(freq) => {
            let ftw = stage(
                SetupStage::Trim,
                trim_oscillator(&mut board, part, opts.supply_voltage, freq, &opts.trim),
            )?;

            let pattern_id = match classify_bitstream(part, &bitstream) {
                BitstreamKind::Programmed { pattern_id } => pattern_id,
                _ => 0,
            };
            let read_protect = bitstream_read_protected(part, &bitstream).unwrap_or(false);
            stage(
                SetupStage::Patch,
                tweak_bitstream(&mut bitstream, part, ftw, pattern_id, read_protect),
            )?;
            stage(
                SetupStage::Patch,
                board.upload_bitstream(&bitstream, BitstreamTarget::Sram),
            )?;
            Some(ftw)
        }
        None => None,
    };

    log::info!("board ready with {}", part);
    Ok(SetupOutcome {
        board,
        detection,
        osc_trim,
        bitstream,
    })
}

/// Picks one of several boards on the bus and runs [`test_setup`] on it.
pub fn multi_board_test_setup<C: UsbContext>(
    ctx: C,
    selector: &BoardSelector,
    config: &BoardConfig,
    bitstream: Vec<u8>,
    opts: &SetupOptions,
) -> Result<SetupOutcome<UsbTransport<C>>> {
    let index = match selector {
        BoardSelector::Index(index) => *index,
        BoardSelector::Serial(serial) => stage(
            SetupStage::Open,
            UsbTransport::find_board_by_serial(&ctx, config.vendor_id, serial),
        )?,
    };
    log::info!("opening board {}", index);

    let transport = stage(
        SetupStage::Open,
        UsbTransport::open(
            ctx,
            config.vendor_id,
            config.product_id,
            index,
            &config.busy_retry(),
        ),
    )?;
    test_setup(DevBoard::new(transport), bitstream, opts)
}
