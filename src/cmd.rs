use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::BoardStatus;
use crate::part::Part;
use crate::setup::SetupStage;

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum DevboardError {
    /// USB device not found.
    #[error("usb device not found")]
    UsbDeviceNotFound,
    /// Failed to list USB devices.
    #[error("failed to list usb devices: {0}")]
    UsbDeviceListFailure(rusb::Error),
    /// Device found but could not be opened.
    #[error("failed to open usb device: {0}")]
    UsbOpenFailure(rusb::Error),
    /// Failed to detach USB kernel driver.
    #[error("failed to detach usb kernel driver: {0}")]
    UsbDetachKernelDriverFailure(rusb::Error),
    /// Failed to select USB configuration 1.
    #[error("failed to select usb configuration: {0}")]
    UsbSetConfigurationFailure(rusb::Error),
    /// The device stayed busy for every attempt the retry policy allowed.
    #[error("usb device still busy after {attempts} attempts")]
    UsbBusyRetriesExhausted { attempts: u32 },
    /// Failed to claim USB interface.
    #[error("failed to claim usb interface: {0}")]
    UsbClaimInterfaceFailure(rusb::Error),
    /// Failed to read a USB string descriptor.
    #[error("failed to read string descriptor: {0}")]
    UsbStringDescriptorFailure(rusb::Error),
    /// An interrupt transfer did not complete within the transport timeout.
    #[error("usb transfer timed out")]
    UsbTimeout,
    /// Failed to write to the USB interrupt endpoint.
    #[error("failed to write interrupt: {0}")]
    UsbWriteFailure(rusb::Error),
    /// Written data to USB does not match expected size.
    #[error("write did not match expected size")]
    UsbWriteMismatch,
    /// Failed to read from the USB interrupt endpoint.
    #[error("failed to read interrupt: {0}")]
    UsbReadFailure(rusb::Error),

    /// Failed to serialize a packet for the board.
    #[error("cmd failed to binary serialize: {0}")]
    CmdSerializeFailure(bincode::Error),
    /// Failed to deserialize a reply from the board.
    #[error("cmd failed to binary deserialize: {0}")]
    CmdDeserializeFailure(bincode::Error),
    /// A packet from the board is truncated or internally inconsistent.
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    /// A packet from the board carries a type code outside the command set.
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    /// The board acknowledged with a different packet type than expected.
    #[error("unexpected ack: expected {expected:?}, got {actual:?}")]
    UnexpectedAck {
        expected: PacketType,
        actual: PacketType,
    },
    /// A frame payload would exceed the 60 byte packet limit.
    #[error("frame payload of {0} bytes does not fit in a packet")]
    PayloadTooLarge(usize),

    /// The unrecognized part sentinel was passed where a real part is needed.
    #[error("part is not recognized")]
    UnrecognizedPart,
    /// Bitstream length does not match the part's image size.
    #[error("bitstream for {part} must be {expected} bytes, got {actual}")]
    BitstreamLengthMismatch {
        part: Part,
        expected: usize,
        actual: usize,
    },
    /// Hex text could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(&'static str),
    /// Invalid argument(s) were provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No supported part answered in the socket.
    #[error("no supported part detected")]
    NoPartDetected,
    /// A different part than the expected one is in the socket.
    #[error("expected {expected} but detected {detected}")]
    WrongPart { expected: Part, detected: Part },

    /// The board reported an overcurrent or undervoltage condition.
    #[error("board fault: {0:?}")]
    BoardFault(BoardStatus),

    /// The oscillator search ran out of iterations.
    #[error("oscillator trim did not converge on {target_hz} Hz (best ftw {best_ftw:#04x} gave {best_hz} Hz after {iterations} iterations)")]
    CalibrationDidNotConverge {
        target_hz: u32,
        best_ftw: u8,
        best_hz: u32,
        iterations: u32,
    },

    /// A bring-up stage failed; the board handle has been closed.
    #[error("test setup failed during {stage}: {source}")]
    SetupFailed {
        stage: SetupStage,
        source: Box<DevboardError>,
    },

    /// Failed to parse a board configuration file.
    #[error("failed to parse board config: {0}")]
    Config(#[from] toml::de::Error),
}

/// Packet type codes understood by the board firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    WriteBitstreamNvram = 0x01,
    ReadBitstreamStart = 0x02,
    WriteBitstreamSram = 0x03,
    ConfigIo = 0x04,
    Reset = 0x05,
    // 0x06 so far unobserved
    /// Doubles as the first acknowledgment of both bitstream writes.
    ReadBitstreamCont = 0x07,
    ConfigSiggen = 0x08,
    EnableSiggen = 0x09,
    GetStatus = 0x0a,
    WriteBitstreamNvramAck2 = 0x11,
    ReadBitstreamAck = 0x13,
    WriteBitstreamSramAck2 = 0x1a,
    SetStatusLed = 0x21,
    SetPart = 0x25,
    ConfigAdcMux = 0x33,
    GetOscFreq = 0x42,
    ReadAdc = 0x47,
    TrimOsc = 0x49,
}
impl PacketType {
    /// Receipt acknowledgment for a chunk of an SRAM or NVRAM write.
    pub const WRITE_BITSTREAM_ACK1: PacketType = PacketType::ReadBitstreamCont;
}
impl TryFrom<u8> for PacketType {
    type Error = DevboardError;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            x if x == Self::WriteBitstreamNvram as u8 => Ok(Self::WriteBitstreamNvram),
            x if x == Self::ReadBitstreamStart as u8 => Ok(Self::ReadBitstreamStart),
            x if x == Self::WriteBitstreamSram as u8 => Ok(Self::WriteBitstreamSram),
            x if x == Self::ConfigIo as u8 => Ok(Self::ConfigIo),
            x if x == Self::Reset as u8 => Ok(Self::Reset),
            x if x == Self::ReadBitstreamCont as u8 => Ok(Self::ReadBitstreamCont),
            x if x == Self::ConfigSiggen as u8 => Ok(Self::ConfigSiggen),
            x if x == Self::EnableSiggen as u8 => Ok(Self::EnableSiggen),
            x if x == Self::GetStatus as u8 => Ok(Self::GetStatus),
            x if x == Self::WriteBitstreamNvramAck2 as u8 => Ok(Self::WriteBitstreamNvramAck2),
            x if x == Self::ReadBitstreamAck as u8 => Ok(Self::ReadBitstreamAck),
            x if x == Self::WriteBitstreamSramAck2 as u8 => Ok(Self::WriteBitstreamSramAck2),
            x if x == Self::SetStatusLed as u8 => Ok(Self::SetStatusLed),
            x if x == Self::SetPart as u8 => Ok(Self::SetPart),
            x if x == Self::ConfigAdcMux as u8 => Ok(Self::ConfigAdcMux),
            x if x == Self::GetOscFreq as u8 => Ok(Self::GetOscFreq),
            x if x == Self::ReadAdc as u8 => Ok(Self::ReadAdc),
            x if x == Self::TrimOsc as u8 => Ok(Self::TrimOsc),
            _ => Err(DevboardError::UnknownPacketType(x)),
        }
    }
}

/// Signal generator channel commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SiggenCommand {
    Pause = 0x00,
    Start = 0x01,
    Stop = 0x02,
    Nop = 0x03,
    Reset = 0x07,
}

/// Which of the part's memories a bitstream readback comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownloadMode {
    /// SRAM contents, as loaded for emulation.
    Emulation = 0,
    /// SRAM contents while the oscillator trim is being searched.
    Trimming = 1,
    /// Non-volatile contents.
    Programming = 2,
}

/// Destination memory of a bitstream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamTarget {
    /// Volatile configuration, lost on power cycle.
    Sram,
    /// One-time programmable memory.
    Nvram,
}
impl BitstreamTarget {
    pub fn packet_type(self) -> PacketType {
        match self {
            BitstreamTarget::Sram => PacketType::WriteBitstreamSram,
            BitstreamTarget::Nvram => PacketType::WriteBitstreamNvram,
        }
    }

    /// Acknowledgment the board sends once the final frame is committed.
    pub fn commit_ack(self) -> PacketType {
        match self {
            BitstreamTarget::Sram => PacketType::WriteBitstreamSramAck2,
            BitstreamTarget::Nvram => PacketType::WriteBitstreamNvramAck2,
        }
    }
}

/// Size of one physical interrupt packet.
pub const PACKET_SIZE: usize = 64;
/// Maximum payload carried by one frame.
pub const FRAME_PAYLOAD_MAX: usize = 60;
/// Most frames one transfer may take before its forward index wraps around.
pub const MAX_TRANSFER_FRAMES: usize = 255;

const HEADER_SIZE: usize = PACKET_SIZE - FRAME_PAYLOAD_MAX;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[repr(C, packed)]
struct FrameHeader {
    forward: u8,
    reverse: u8,
    packet_type: u8,
    len: u8,
}

/// Logical view of one packet exchanged with the board.
///
/// The field order here does not follow the wire layout; [`Frame::encode`] and
/// [`Frame::decode`] are the only places that know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    packet_type: PacketType,
    forward: u8,
    reverse: u8,
    payload: Vec<u8>,
}
impl Frame {
    /// Creates the first frame of a transfer, with sequence (1, 0).
    pub fn new(packet_type: PacketType) -> Self {
        Frame {
            packet_type,
            forward: 1,
            reverse: 0,
            payload: Vec::with_capacity(FRAME_PAYLOAD_MAX),
        }
    }

    /// Creates a single frame carrying `payload`.
    pub fn with_payload(packet_type: PacketType, payload: &[u8]) -> Result<Self, DevboardError> {
        let mut frame = Frame::new(packet_type);
        frame.extend_from_slice(payload)?;
        Ok(frame)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn forward_index(&self) -> u8 {
        self.forward
    }

    pub fn reverse_index(&self) -> u8 {
        self.reverse
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.payload.len() == FRAME_PAYLOAD_MAX
    }

    pub fn push(&mut self, b: u8) -> Result<(), DevboardError> {
        if self.is_full() {
            return Err(DevboardError::PayloadTooLarge(FRAME_PAYLOAD_MAX + 1));
        }
        self.payload.push(b);
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), DevboardError> {
        let len = self.payload.len() + bytes.len();
        if len > FRAME_PAYLOAD_MAX {
            return Err(DevboardError::PayloadTooLarge(len));
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Successor frame of a multi-frame transfer: same type, empty payload,
    /// forward index advanced and reverse index stepped back.
    pub fn next(&self) -> Self {
        Frame {
            packet_type: self.packet_type,
            forward: self.forward.wrapping_add(1),
            reverse: self.reverse.wrapping_sub(1),
            payload: Vec::with_capacity(FRAME_PAYLOAD_MAX),
        }
    }

    /// Answer to this frame, carrying the same sequence indices.
    pub(crate) fn reply(&self, packet_type: PacketType) -> Self {
        Frame {
            packet_type,
            forward: self.forward,
            reverse: self.reverse,
            payload: Vec::with_capacity(FRAME_PAYLOAD_MAX),
        }
    }

    pub(crate) fn retyped(mut self, packet_type: PacketType) -> Self {
        self.packet_type = packet_type;
        self
    }

    pub(crate) fn encode(&self) -> Result<[u8; PACKET_SIZE], DevboardError> {
        let header = FrameHeader {
            forward: self.forward,
            reverse: self.reverse,
            packet_type: self.packet_type as u8,
            len: self.payload.len() as u8,
        };
        let header =
            bincode::serialize(&header).map_err(|e| DevboardError::CmdSerializeFailure(e))?;

        let mut packet = [0u8; PACKET_SIZE];
        packet[..HEADER_SIZE].copy_from_slice(&header);
        packet[HEADER_SIZE..HEADER_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        Ok(packet)
    }

    pub(crate) fn decode(packet: &[u8]) -> Result<Self, DevboardError> {
        if packet.len() < HEADER_SIZE {
            return Err(DevboardError::MalformedResponse("packet shorter than header"));
        }
        let header: FrameHeader = bincode::deserialize(&packet[..HEADER_SIZE])
            .map_err(|e| DevboardError::CmdDeserializeFailure(e))?;

        let len = header.len as usize;
        if len > FRAME_PAYLOAD_MAX {
            return Err(DevboardError::MalformedResponse("payload length exceeds 60"));
        }
        if packet.len() < HEADER_SIZE + len {
            return Err(DevboardError::MalformedResponse("payload truncated"));
        }

        Ok(Frame {
            packet_type: header.packet_type.try_into()?,
            forward: header.forward,
            reverse: header.reverse,
            payload: packet[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }
}

/// Parses a hex dump of one physical packet, as captured off the wire.
impl std::str::FromStr for Frame {
    type Err = DevboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = crate::part::bitstream_from_hex(s)?;
        Frame::decode(&bytes)
    }
}
