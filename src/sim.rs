use std::collections::VecDeque;

use crate::cmd::{DevboardError, DownloadMode, Frame, PacketType, FRAME_PAYLOAD_MAX, PACKET_SIZE};
use crate::io::{Drive, TEST_POINT_SLOTS, VDD_CHANNEL};
use crate::part::Part;
use crate::usb::Transport;

/// Voltage a dual-supply part's second Vdd pin pulls a weak pull-up down to.
const VDD2_LOADED_MV: u16 = 400;

#[derive(Debug)]
pub struct SimBoard {
    installed: Option<Part>,
    nvram: Vec<u8>,
    sram: Vec<u8>,
    selected: Option<Part>,

    drives: [u16; TEST_POINT_SLOTS],
    led: bool,
    adc_channel: u8,
    vdd_mv: u16,
    vdd_on: bool,
    fault_flags: u8,

    ftw: u8,
    osc_base_hz: u32,
    osc_hz_per_step: u32,

    write_target: Option<PacketType>,
    write_buf: Vec<u8>,
    readback: Vec<u8>,
    read_pos: usize,

    pending: VecDeque<Frame>,
    sent: Vec<Frame>,
    sends: usize,
    receives: usize,
    fail_send_at: Option<usize>,
    ack_override: Option<PacketType>,
}

impl SimBoard {
    /// A board with an empty socket.
    pub fn new() -> Self {
        SimBoard {
            installed: None,
            nvram: vec![],
            sram: vec![],
            selected: None,
            drives: [Drive::Float.code(); TEST_POINT_SLOTS],
            led: false,
            adc_channel: 0,
            vdd_mv: 0,
            vdd_on: false,
            fault_flags: 0,
            ftw: 0x80,
            osc_base_hz: 15_000,
            osc_hz_per_step: 80,
            write_target: None,
            write_buf: vec![],
            readback: vec![],
            read_pos: 0,
            pending: VecDeque::new(),
            sent: vec![],
            sends: 0,
            receives: 0,
            fail_send_at: None,
            ack_override: None,
        }
    }

    /// A board with `part` in the socket holding `nvram`.
    pub fn with_part(part: Part, nvram: Vec<u8>) -> Self {
        let mut sim = SimBoard::new();
        sim.sram = vec![0; part.bitstream_len()];
        sim.nvram = nvram;
        sim.installed = Some(part);
        sim
    }

    /// Oscillator model: `base_hz + ftw * hz_per_step`.
    pub fn set_oscillator(&mut self, base_hz: u32, hz_per_step: u32) {
        self.osc_base_hz = base_hz;
        self.osc_hz_per_step = hz_per_step;
    }

    /// Status flag bits reported by GET_STATUS.
    pub fn set_fault_flags(&mut self, flags: u8) {
        self.fault_flags = flags;
    }

    /// Makes the `n`-th send (counting from 0) time out.
    pub fn fail_send_at(&mut self, n: usize) {
        self.fail_send_at = Some(n);
    }

    /// Answers the next command with `ack` instead of the proper type.
    pub fn override_next_ack(&mut self, ack: PacketType) {
        self.ack_override = Some(ack);
    }

    pub fn sent_frames(&self) -> &[Frame] {
        &self.sent
    }

    pub fn sends(&self) -> usize {
        self.sends
    }

    pub fn receives(&self) -> usize {
        self.receives
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    pub fn nvram(&self) -> &[u8] {
        &self.nvram
    }

    pub fn selected_part(&self) -> Option<Part> {
        self.selected
    }

    pub fn trim(&self) -> u8 {
        self.ftw
    }

    pub fn status_led(&self) -> bool {
        self.led
    }

    pub fn drive_code(&self, slot: usize) -> u16 {
        self.drives[slot]
    }

    pub fn oscillator_hz(&self) -> u32 {
        if self.vdd_on {
            self.osc_base_hz + u32::from(self.ftw) * self.osc_hz_per_step
        } else {
            0
        }
    }

    fn family_matches(&self) -> bool {
        match (self.installed, self.selected) {
            (Some(a), Some(b)) => a.layout() == b.layout(),
            _ => false,
        }
    }

    fn adc_mv(&self) -> u16 {
        if !self.vdd_on {
            return 0;
        }
        let code = self
            .drives
            .get(self.adc_channel as usize)
            .copied()
            .unwrap_or(Drive::Float.code());
        if self.adc_channel == 14
            && self.installed == Some(Part::Slg46621v)
            && code == Drive::PULLUP.code()
        {
            return VDD2_LOADED_MV;
        }
        if code != Drive::Float.code() && code & 0x3 == 0x1 {
            self.vdd_mv
        } else {
            0
        }
    }

    fn queue(&mut self, mut frame: Frame) {
        if let Some(ack) = self.ack_override.take() {
            frame = frame.retyped(ack);
        }
        self.pending.push_back(frame);
    }

    fn ack(&mut self, request: &Frame) {
        self.queue(request.reply(request.packet_type()));
    }

    fn answer(&mut self, request: &Frame, payload: &[u8]) -> Result<(), DevboardError> {
        let mut reply = request.reply(request.packet_type());
        reply.extend_from_slice(payload)?;
        self.queue(reply);
        Ok(())
    }

    fn next_readback_chunk(&mut self, request: &Frame) -> Result<(), DevboardError> {
        let end = (self.read_pos + FRAME_PAYLOAD_MAX).min(self.readback.len());
        let mut reply = request.reply(PacketType::ReadBitstreamAck);
        reply.extend_from_slice(&self.readback[self.read_pos..end])?;
        self.read_pos = end;
        self.queue(reply);
        Ok(())
    }

    fn handle(&mut self, request: &Frame) -> Result<(), DevboardError> {
        let payload = request.payload().to_vec();
        if payload.len() < min_payload(request.packet_type()) {
            log::warn!("sim: ignoring short {:?}", request.packet_type());
            return Ok(());
        }
        match request.packet_type() {
            PacketType::Reset => {
                self.drives = [Drive::Float.code(); TEST_POINT_SLOTS];
                self.vdd_on = false;
                self.ack(request);
            }
            PacketType::SetPart => {
                let code = u16::from_le_bytes([payload[0], payload[1]]);
                self.selected = Part::try_from(code).ok();
                self.ack(request);
            }
            PacketType::ConfigIo => {
                for (slot, code) in payload.chunks_exact(2).take(TEST_POINT_SLOTS).enumerate() {
                    self.drives[slot] = u16::from_le_bytes([code[0], code[1]]);
                }
                self.ack(request);
            }
            PacketType::SetStatusLed => {
                self.led = payload[0] != 0;
                self.ack(request);
            }
            PacketType::ConfigSiggen => {
                if payload[0] == VDD_CHANNEL {
                    self.vdd_mv = u16::from_le_bytes([payload[1], payload[2]]);
                }
                self.ack(request);
            }
            PacketType::EnableSiggen => {
                for pair in payload.chunks_exact(2) {
                    if pair[0] == VDD_CHANNEL {
                        self.vdd_on = pair[1] == 0x01;
                    }
                }
                self.ack(request);
            }
            PacketType::ConfigAdcMux => {
                self.adc_channel = payload[0];
                self.ack(request);
            }
            PacketType::ReadAdc => {
                let mv = self.adc_mv();
                self.answer(request, &mv.to_le_bytes())?;
            }
            PacketType::GetStatus => {
                let va = if self.vdd_on { self.vdd_mv } else { 0 };
                let mut status = vec![self.fault_flags];
                status.extend_from_slice(&va.to_le_bytes());
                status.extend_from_slice(&5000u16.to_le_bytes());
                self.answer(request, &status)?;
            }
            PacketType::TrimOsc => {
                self.ftw = payload[0];
                self.ack(request);
            }
            PacketType::GetOscFreq => {
                let hz = self.oscillator_hz();
                self.answer(request, &hz.to_le_bytes())?;
            }
            target @ (PacketType::WriteBitstreamSram | PacketType::WriteBitstreamNvram) => {
                if request.forward_index() == 1 || self.write_target != Some(target) {
                    self.write_buf.clear();
                    self.write_target = Some(target);
                }
                self.write_buf.extend_from_slice(&payload);
                self.queue(request.reply(PacketType::WRITE_BITSTREAM_ACK1));

                if !request.is_full() {
                    let image = std::mem::take(&mut self.write_buf);
                    let commit = if target == PacketType::WriteBitstreamSram {
                        self.sram = image;
                        PacketType::WriteBitstreamSramAck2
                    } else {
                        self.nvram = image;
                        PacketType::WriteBitstreamNvramAck2
                    };
                    self.write_target = None;
                    self.queue(request.reply(commit));
                }
            }
            PacketType::ReadBitstreamStart => {
                let len = self.selected.map_or(0, |p| p.bitstream_len());
                self.readback = if !self.family_matches() {
                    // nobody drives the bus
                    vec![0xff; len]
                } else if payload[0] == DownloadMode::Programming as u8 {
                    self.nvram.clone()
                } else {
                    self.sram.clone()
                };
                self.read_pos = 0;
                self.next_readback_chunk(request)?;
            }
            PacketType::ReadBitstreamCont => self.next_readback_chunk(request)?,
            // acks only ever travel board to host
            PacketType::WriteBitstreamNvramAck2
            | PacketType::ReadBitstreamAck
            | PacketType::WriteBitstreamSramAck2 => {}
        }
        Ok(())
    }
}

fn min_payload(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::SetPart => 2,
        PacketType::ConfigSiggen => 3,
        PacketType::SetStatusLed
        | PacketType::ConfigAdcMux
        | PacketType::TrimOsc
        | PacketType::ReadBitstreamStart => 1,
        _ => 0,
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimBoard {
    fn send(&mut self, packet: &[u8]) -> Result<(), DevboardError> {
        let n = self.sends;
        self.sends += 1;
        if self.fail_send_at == Some(n) {
            return Err(DevboardError::UsbTimeout);
        }

        let request = match Frame::decode(packet) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("sim: dropping undecodable packet: {}", e);
                return Ok(());
            }
        };
        self.handle(&request)?;
        self.sent.push(request);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, DevboardError> {
        self.receives += 1;
        let frame = self.pending.pop_front().ok_or(DevboardError::UsbTimeout)?;
        let packet = frame.encode()?;
        let len = PACKET_SIZE.min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }
}
