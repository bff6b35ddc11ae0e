//! Driving the Silego GreenPAK development board over USB.
//!
//! <br>
//!
//! The development board is a socketed test fixture for the GreenPAK family
//! of small configurable mixed-signal parts. It speaks a framed command
//! protocol over a pair of USB interrupt endpoints: configuration bitstreams
//! go in and out of the socketed part, test points are driven by on-board
//! signal generators and read back through an ADC, and the part's RC
//! oscillator can be trimmed against the board's frequency counter.
//!
//! This crate covers the protocol and everything built on it: framing,
//! the typed command set ([`DevBoard`]), part detection and bitstream
//! classification, patching of trim/pattern-id/read-protect fields, the
//! oscillator trim loop, and full bring-up sequences.
//!
//! # Example
//!
//! Load a bitstream into the SRAM of an SLG46620V and trim it to 25 kHz.
//!
//! ```no_run
//! use gpdevboard::{
//!     bitstream_from_hex, test_setup, BusyRetry, DevBoard, Part, SetupOptions, TrimSettings,
//!     UsbTransport,
//! };
//!
//! use rusb::Context;
//!
//! fn main() -> Result<(), gpdevboard::DevboardError> {
//!     let ctx = Context::new().expect("could not initialize libusb");
//!     let transport = UsbTransport::open_board(ctx, 0, &BusyRetry::default())?;
//!
//!     let bitstream = bitstream_from_hex(&std::fs::read_to_string("design.hex").unwrap())?;
//!     let opts = SetupOptions {
//!         part: Part::Slg46620v,
//!         supply_voltage: 3.3,
//!         rc_osc_freq: Some(25_000),
//!         trim: TrimSettings::default(),
//!     };
//!
//!     let mut ready = test_setup(DevBoard::new(transport), bitstream, &opts)?;
//!     println!("trimmed to {:?}", ready.osc_trim);
//!     println!("rail A at {:.2} V", ready.board.get_status()?.voltage_a);
//!     Ok(())
//! }
//! ```

/// Silego USB Vendor ID
pub const DEVBOARD_VID: u16 = 0x0f0f;
/// Development board USB Product ID when running its application firmware
pub const DEVBOARD_PID: u16 = 0x0006;
/// Development board USB Product ID when in bootloader mode
pub const DEVBOARD_BOOTLOADER_PID: u16 = 0x8006;

/// Command Module
pub mod cmd;
pub use cmd::{
    BitstreamTarget, DevboardError, DownloadMode, Frame, PacketType, SiggenCommand,
    FRAME_PAYLOAD_MAX, MAX_TRANSFER_FRAMES, PACKET_SIZE,
};

/// USB Connection Module
pub mod usb;
pub use usb::{select_device, BusyRetry, Transport, UsbTransport, TRANSFER_TIMEOUT};

/// Test Point Configuration Module
pub mod io;
pub use io::{BoardStatus, Drive, IoConfig, Level, Strength, TestPoint};

/// Board Command Module
pub mod board;
pub use board::DevBoard;

/// Part and Bitstream Module
///
/// Bitstreams are opaque apart from the oscillator trim, the pattern id and
/// the read-protect bit, all located through [`part::PartLayout`].
pub mod part;
pub use part::{
    bitstream_from_hex, bitstream_length, classify_bitstream, tweak_bitstream, BitstreamKind,
    Part,
};

/// Part Detection Module
pub mod detect;
pub use detect::{detect_part, distinguish_slg4662x, verify_device_present, Detection};

/// Oscillator Calibration Module
///
/// The RC oscillator frequency rises monotonically with the 8-bit trim word,
/// so the search bisects over the word starting from its midpoint.
pub mod calibrate;
pub use calibrate::{trim_oscillator, TrimSettings};

/// Bring-up Module
pub mod setup;
pub use setup::{
    multi_board_test_setup, test_setup, BoardSelector, SetupOptions, SetupOutcome, SetupStage,
};

/// Board Configuration Module
pub mod config;
pub use config::BoardConfig;

/// Firmware Simulator Module
///
/// [`sim::SimBoard`] decodes each packet it is sent and queues the packets the
/// real firmware would answer with. It models the socketed part's NVRAM and
/// SRAM, the socket supply, the ADC and a linearly trimmed RC oscillator.
pub mod sim;
