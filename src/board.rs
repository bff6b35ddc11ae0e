use crate::cmd::{
    BitstreamTarget, DevboardError, DownloadMode, Frame, PacketType, SiggenCommand,
    FRAME_PAYLOAD_MAX, MAX_TRANSFER_FRAMES, PACKET_SIZE,
};
use crate::io::{is_test_point, BoardStatus, IoConfig, TEST_POINTS, VDD_CHANNEL};
use crate::part::Part;
use crate::usb::Transport;

type Result<T> = ::std::result::Result<T, DevboardError>;

/// Highest voltage the signal generators can source.
pub const SIGGEN_MAX_VOLTAGE: f64 = 5.5;

/// Command interface of one development board.
///
/// The board owns its transport exclusively and every operation borrows it
/// mutably, so a request is always answered before the next one is sent.
#[derive(Debug)]
pub struct DevBoard<T: Transport> {
    transport: T,
    part: Option<Part>,
}

impl<T: Transport> DevBoard<T> {
    pub fn new(transport: T) -> Self {
        DevBoard {
            transport,
            part: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Part chosen by the last successful [`DevBoard::set_part`].
    pub fn part(&self) -> Option<Part> {
        self.part
    }

    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        let packet = frame.encode()?;
        log::trace!(
            "send {:?} seq=({}, {}) len={}",
            frame.packet_type(),
            frame.forward_index(),
            frame.reverse_index(),
            frame.payload().len()
        );
        self.transport.send(&packet)
    }

    pub fn receive(&mut self) -> Result<Frame> {
        let mut packet = [0u8; PACKET_SIZE];
        let len = self.transport.receive(&mut packet)?;
        let frame = Frame::decode(&packet[..len])?;
        log::trace!(
            "recv {:?} seq=({}, {}) len={}",
            frame.packet_type(),
            frame.forward_index(),
            frame.reverse_index(),
            frame.payload().len()
        );
        Ok(frame)
    }

    /// Sends `frame` and returns whatever the board answers.
    pub fn roundtrip(&mut self, frame: &Frame) -> Result<Frame> {
        self.send(frame)?;
        self.receive()
    }

    /// Like [`DevBoard::roundtrip`], but the answer must be of type `ack`.
    pub fn roundtrip_ack(&mut self, frame: &Frame, ack: PacketType) -> Result<Frame> {
        self.send(frame)?;
        self.expect(ack)
    }

    fn expect(&mut self, ack: PacketType) -> Result<Frame> {
        let reply = self.receive()?;
        if reply.packet_type() != ack {
            return Err(DevboardError::UnexpectedAck {
                expected: ack,
                actual: reply.packet_type(),
            });
        }
        Ok(reply)
    }

    fn command(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<Frame> {
        self.roundtrip(&Frame::with_payload(packet_type, payload)?)
    }

    fn query(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<Frame> {
        self.roundtrip_ack(&Frame::with_payload(packet_type, payload)?, packet_type)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.command(PacketType::Reset, &[]).map(|_| ())
    }

    pub fn set_part(&mut self, part: Part) -> Result<()> {
        if part == Part::Unrecognized {
            return Err(DevboardError::UnrecognizedPart);
        }
        self.command(PacketType::SetPart, &part.code().to_le_bytes())?;
        self.part = Some(part);
        Ok(())
    }

    pub fn set_io_config(&mut self, config: &IoConfig) -> Result<()> {
        self.command(PacketType::ConfigIo, &config.encode()).map(|_| ())
    }

    pub fn set_status_led(&mut self, on: bool) -> Result<()> {
        self.command(PacketType::SetStatusLed, &[on as u8]).map(|_| ())
    }

    /// Sets the output voltage of a signal generator channel.
    ///
    /// Channel [`VDD_CHANNEL`] powers the socket; the others follow the test
    /// point numbering.
    pub fn configure_siggen(&mut self, channel: u8, voltage: f64) -> Result<()> {
        check_siggen_channel(channel)?;
        if !(0.0..=SIGGEN_MAX_VOLTAGE).contains(&voltage) {
            return Err(DevboardError::InvalidArgument("siggen voltage out of range"));
        }
        let mv = (voltage * 1000.0).round() as u16;
        let mut payload = vec![channel];
        payload.extend_from_slice(&mv.to_le_bytes());
        self.command(PacketType::ConfigSiggen, &payload).map(|_| ())
    }

    pub fn control_siggen(&mut self, channel: u8, cmd: SiggenCommand) -> Result<()> {
        check_siggen_channel(channel)?;
        self.command(PacketType::EnableSiggen, &[channel, cmd as u8]).map(|_| ())
    }

    /// Resets the supply channel and every test point channel in one frame.
    pub fn reset_all_siggens(&mut self) -> Result<()> {
        let payload: Vec<u8> = std::iter::once(VDD_CHANNEL)
            .chain(TEST_POINTS)
            .flat_map(|ch| [ch, SiggenCommand::Reset as u8])
            .collect();
        self.command(PacketType::EnableSiggen, &payload).map(|_| ())
    }

    /// Brings the socket supply up to `voltage`.
    pub fn power_socket(&mut self, voltage: f64) -> Result<()> {
        self.configure_siggen(VDD_CHANNEL, voltage)?;
        self.control_siggen(VDD_CHANNEL, SiggenCommand::Start)
    }

    pub fn select_adc_channel(&mut self, channel: u8) -> Result<()> {
        if !is_test_point(channel) {
            return Err(DevboardError::InvalidArgument("adc channel is not a test point"));
        }
        self.command(PacketType::ConfigAdcMux, &[channel]).map(|_| ())
    }

    /// Reads the selected ADC channel, in volts.
    pub fn read_adc(&mut self) -> Result<f64> {
        let reply = self.query(PacketType::ReadAdc, &[])?;
        let mv: u16 = bincode::deserialize(reply.payload())
            .map_err(|e| DevboardError::CmdDeserializeFailure(e))?;
        Ok(f64::from(mv) / 1000.0)
    }

    pub fn single_read_adc(&mut self, channel: u8) -> Result<f64> {
        self.select_adc_channel(channel)?;
        self.read_adc()
    }

    pub fn get_status(&mut self) -> Result<BoardStatus> {
        let reply = self.query(PacketType::GetStatus, &[])?;
        BoardStatus::decode(reply.payload())
    }

    /// Fails with [`DevboardError::BoardFault`] if any monitor tripped.
    pub fn check_status(&mut self) -> Result<BoardStatus> {
        let status = self.get_status()?;
        if status.is_fault() {
            log::error!("board fault: {:?}", status);
            return Err(DevboardError::BoardFault(status));
        }
        Ok(status)
    }

    pub fn trim_oscillator(&mut self, ftw: u8) -> Result<()> {
        self.command(PacketType::TrimOsc, &[ftw]).map(|_| ())
    }

    /// Frequency of the part's RC oscillator, in Hz.
    pub fn measure_oscillator_frequency(&mut self) -> Result<u32> {
        let reply = self.query(PacketType::GetOscFreq, &[])?;
        bincode::deserialize(reply.payload()).map_err(|e| DevboardError::CmdDeserializeFailure(e))
    }

    /// Writes `bitstream` into the part's SRAM or NVRAM.
    ///
    /// Each full chunk is acknowledged on receipt. The final frame, the first
    /// one shorter than a full chunk (possibly empty), is acknowledged on
    /// receipt and then again on commit. Any failure aborts the transfer;
    /// it has to be restarted from the beginning.
    ///
    /// Images that do not match the selected part, or that would need more
    /// than [`MAX_TRANSFER_FRAMES`] frames, are rejected before anything is sent.
    pub fn upload_bitstream(&mut self, bitstream: &[u8], target: BitstreamTarget) -> Result<()> {
        if bitstream.is_empty() {
            return Err(DevboardError::InvalidArgument("empty bitstream"));
        }
        if let Some(part) = self.part {
            if bitstream.len() != part.bitstream_len() {
                return Err(DevboardError::BitstreamLengthMismatch {
                    part,
                    expected: part.bitstream_len(),
                    actual: bitstream.len(),
                });
            }
        }
        check_transfer_len(bitstream.len())?;
        log::debug!("uploading {} bytes to {:?}", bitstream.len(), target);

        let mut frame = Frame::new(target.packet_type());
        for chunk in bitstream.chunks(FRAME_PAYLOAD_MAX) {
            frame.extend_from_slice(chunk)?;
            if !frame.is_full() {
                break;
            }
            self.roundtrip_ack(&frame, PacketType::WRITE_BITSTREAM_ACK1)?;
            frame = frame.next();
        }

        self.roundtrip_ack(&frame, PacketType::WRITE_BITSTREAM_ACK1)?;
        self.expect(target.commit_ack())?;
        Ok(())
    }

    /// Reads back the bitstream of the currently selected part.
    pub fn download_bitstream(&mut self, mode: DownloadMode) -> Result<Vec<u8>> {
        let part = self.part.ok_or(DevboardError::InvalidArgument("no part selected"))?;
        self.download_bitstream_len(part.bitstream_len(), mode)
    }

    /// Reads back `octets` bytes of bitstream.
    pub fn download_bitstream_len(&mut self, octets: usize, mode: DownloadMode) -> Result<Vec<u8>> {
        check_transfer_len(octets)?;
        log::debug!("reading {} bytes in {:?} mode", octets, mode);

        let mut bitstream = Vec::with_capacity(octets);
        let start = Frame::with_payload(PacketType::ReadBitstreamStart, &[mode as u8])?;
        let mut reply = self.roundtrip_ack(&start, PacketType::ReadBitstreamAck)?;
        let mut cont = Frame::new(PacketType::ReadBitstreamCont);
        loop {
            if reply.is_empty() && bitstream.len() < octets {
                return Err(DevboardError::MalformedResponse("bitstream readback ended early"));
            }
            bitstream.extend_from_slice(reply.payload());
            if bitstream.len() > octets {
                return Err(DevboardError::MalformedResponse("bitstream readback too long"));
            }
            if bitstream.len() == octets {
                return Ok(bitstream);
            }

            reply = self.roundtrip_ack(&cont, PacketType::ReadBitstreamAck)?;
            cont = cont.next();
        }
    }
}

/// A transfer must fit in one run of forward indices without repeating one.
fn check_transfer_len(octets: usize) -> Result<()> {
    if octets / FRAME_PAYLOAD_MAX + 1 > MAX_TRANSFER_FRAMES {
        return Err(DevboardError::InvalidArgument("transfer exceeds 255 frames"));
    }
    Ok(())
}

fn check_siggen_channel(channel: u8) -> Result<()> {
    if channel == VDD_CHANNEL || is_test_point(channel) {
        Ok(())
    } else {
        Err(DevboardError::InvalidArgument("no signal generator on this channel"))
    }
}
