// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-facing half: USB setup packets, and the one vendor request the
//! game uses to talk to us.
//!
//! The USB transport owns the wire. It calls into a [`ControlHandler`] once per
//! vendor SETUP packet and, if we ask for it, once per chunk of the OUT data
//! stage that follows. [`HostProtocol`] is the handler that speaks PIUIO.
//!
//! # The lamp write
//!
//! The lamp write is the only interesting part. The host sends 8 bytes (in
//! practice, though it's free to say otherwise in `wLength`), and the
//! transport may hand them to us in several pieces. We stage them in
//! [`PendingWrite`] and, when the last expected byte arrives, copy bytes 0 and
//! 2 into the live lamp state. The other six bytes are padding: the game
//! stores each latch byte in a 16-bit word and the high halves ride along.
//!
//! A SETUP for a new write throws away any half-finished one. There's no
//! timeout; a write the host abandons just sits there until the next one.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

use crate::state::{IoState, PendingWrite};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits 6:5 of `bmRequestType`: who defines the meaning of `bRequest`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbRequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction, kind and recipient, packed. See [`SetupPacket::direction`]
    /// and [`SetupPacket::kind`].
    pub request_type: u8,
    /// Request. Standard requests are in `UsbSetupRequest` in the firmware;
    /// ours is in [`VendorRequest`].
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Not used in the requests we support.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::from_bytes(value.to_le_bytes()),
            index: U16::from_bytes(index.to_le_bytes()),
            length: U16::from_bytes(length.to_le_bytes()),
        }
    }

    /// Reinterprets the 8 bytes the controller captured. `None` if there
    /// aren't exactly 8 of them.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> UsbRequestKind {
        match UsbRequestKind::from_u8((self.request_type >> 5) & 0b11) {
            Some(k) => k,
            None => UsbRequestKind::Reserved,
        }
    }
}

/// The vendor request codes we answer to. There is exactly one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VendorRequest {
    /// Read sensors or write lamps, depending on direction.
    AccessGameIo = 0xAE,
}

/// The full `bmRequestType` values the game sends with
/// [`VendorRequest::AccessGameIo`]: vendor request, device recipient.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GameIoRequestType {
    /// Host-to-device: lamp data follows.
    WriteOutputs = 0x40,
    /// Device-to-host: send the sensor report.
    ReadInputs = 0xC0,
}

/// What the transport should do with a SETUP packet after the handler has seen
/// it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Disposition<'a> {
    /// Done. For an IN request, send these bytes (trimmed to `wLength`); for
    /// an OUT request the slice is empty and the transport just completes the
    /// status stage.
    Reply(&'a [u8]),
    /// Receive the OUT data stage and pass each chunk to
    /// [`ControlHandler::on_data_chunk`].
    Defer,
    /// Not ours. The transport answers with an empty transfer, receiving and
    /// dropping any OUT data stage first.
    Reject,
}

/// Inbound contract between the USB transport and the request handling logic.
///
/// The transport calls these synchronously from its service routine. Neither
/// may block.
pub trait ControlHandler {
    /// One vendor SETUP packet has arrived on EP0.
    fn on_setup(&mut self, setup: &SetupPacket) -> Disposition<'_>;

    /// One chunk of a deferred OUT data stage has arrived. Returns `true` when
    /// this chunk finished the transaction.
    fn on_data_chunk(&mut self, chunk: &[u8]) -> bool;
}

/// PIUIO request handling over the shared I/O state.
pub struct HostProtocol<'a> {
    state: &'a mut IoState,
}

impl<'a> HostProtocol<'a> {
    pub fn new(state: &'a mut IoState) -> Self {
        Self { state }
    }

    /// Classifies a SETUP by its raw fields and gets ready for what follows.
    ///
    /// `declared_length` only matters for writes.
    pub fn on_control_setup(
        &mut self,
        request: u8,
        request_type: u8,
        declared_length: u16,
    ) -> Disposition<'_> {
        let req = VendorRequest::from_u8(request);
        let reqty = GameIoRequestType::from_u8(request_type);
        match (req, reqty) {
            (Some(VendorRequest::AccessGameIo), Some(GameIoRequestType::WriteOutputs)) => {
                self.state.pending.begin(declared_length);
                if self.state.pending.is_open() {
                    Disposition::Defer
                } else {
                    // Nothing to wait for. The lamps keep their last value.
                    Disposition::Reply(&[])
                }
            }
            (Some(VendorRequest::AccessGameIo), Some(GameIoRequestType::ReadInputs)) => {
                Disposition::Reply(self.state.input.as_bytes())
            }
            _ => Disposition::Reject,
        }
    }

    /// Stages `chunk`. When it completes the transaction, the lamp bytes are
    /// published to the scan side.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> bool {
        let done = self.state.pending.accept(chunk);
        if done {
            self.state.output.0 = latch_bytes(&self.state.pending);
        }
        done
    }

    pub fn state(&self) -> &IoState {
        &*self.state
    }
}

impl ControlHandler for HostProtocol<'_> {
    fn on_setup(&mut self, setup: &SetupPacket) -> Disposition<'_> {
        self.on_control_setup(setup.request, setup.request_type, setup.length.get())
    }

    fn on_data_chunk(&mut self, chunk: &[u8]) -> bool {
        self.on_chunk(chunk)
    }
}

/// The transport's count of an EP0 OUT data stage.
///
/// The host sends every byte it declared in `wLength` whether or not we want
/// them, and won't move on to the status stage until it has. So a request we
/// reject still has its data stage received; the packets just never reach the
/// handler.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutDataStage {
    remaining: u16,
    forward: bool,
}

/// What to do with one packet of an OUT data stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutPacket {
    /// Pass it to [`ControlHandler::on_data_chunk`].
    pub forward: bool,
    /// The data stage is over and the status stage is due.
    pub finished: bool,
}

impl OutDataStage {
    /// No data stage in progress.
    pub const IDLE: Self = Self { remaining: 0, forward: false };

    /// Expects `length` bytes for the handler.
    pub const fn forward(length: u16) -> Self {
        Self { remaining: length, forward: true }
    }

    /// Expects `length` bytes that nobody wants.
    pub const fn discard(length: u16) -> Self {
        Self { remaining: length, forward: false }
    }

    pub const fn is_active(&self) -> bool {
        self.remaining != 0
    }

    /// Accounts for an OUT packet of `len` bytes. A packet shorter than
    /// `max_packet` ends the stage early. `None` if no stage is in progress,
    /// which makes the packet the status stage of an IN transfer.
    pub fn receive(&mut self, len: usize, max_packet: usize) -> Option<OutPacket> {
        if !self.is_active() {
            return None;
        }
        let len16 = u16::try_from(len).unwrap_or(u16::MAX);
        self.remaining = self.remaining.saturating_sub(len16);
        if len < max_packet {
            self.remaining = 0;
        }
        Some(OutPacket { forward: self.forward, finished: !self.is_active() })
    }
}

/// Picks the two meaningful bytes out of a staged lamp write.
pub fn latch_bytes(pending: &PendingWrite) -> [u8; 2] {
    let staged = pending.staged();
    [staged[0], staged[2]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InputSnapshot, OutputLatches};

    const WRITE: u8 = GameIoRequestType::WriteOutputs as u8;
    const READ: u8 = GameIoRequestType::ReadInputs as u8;
    const GAME_IO: u8 = VendorRequest::AccessGameIo as u8;

    #[test]
    fn single_chunk_write() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        assert_eq!(proto.on_control_setup(GAME_IO, WRITE, 8), Disposition::Defer);
        assert!(proto.on_chunk(&[0x01, 0xFF, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]));
        assert_eq!(state.output, OutputLatches([0x01, 0x02]));
    }

    #[test]
    fn two_chunk_write() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        assert_eq!(proto.on_control_setup(GAME_IO, WRITE, 4), Disposition::Defer);
        assert!(!proto.on_chunk(&[0xAA, 0x00]));
        assert_eq!(proto.state().output, OutputLatches([0, 0]));
        assert!(proto.on_chunk(&[0xBB, 0x00]));
        assert_eq!(state.output, OutputLatches([0xAA, 0xBB]));
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let stream = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

        for len in 3..=stream.len() {
            let msg = &stream[..len];
            for first in 0..=len {
                for second in first..=len {
                    let mut state = IoState::default();
                    let mut proto = HostProtocol::new(&mut state);
                    proto.on_control_setup(GAME_IO, WRITE, len as u16);

                    let pieces = [&msg[..first], &msg[first..second], &msg[second..]];
                    let completions: Vec<bool> = pieces.iter().map(|p| proto.on_chunk(p)).collect();

                    assert_eq!(completions.iter().filter(|&&c| c).count(), 1);
                    assert_eq!(state.output, OutputLatches([msg[0], msg[2]]));
                }
            }
        }
    }

    #[test]
    fn single_byte_chunks_complete_on_the_last_expected_byte() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 10);

        let bytes = [9, 0, 7, 0, 0, 0, 0, 0, 0xEE, 0xEE];
        let completions: Vec<bool> = bytes.iter().map(|b| proto.on_chunk(&[*b])).collect();

        let mut expected = [false; 10];
        expected[7] = true;
        assert_eq!(completions, expected);
        assert_eq!(state.output, OutputLatches([9, 7]));
    }

    #[test]
    fn short_write_uses_stale_padding() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 8);
        proto.on_chunk(&[1, 2, 3, 4, 5, 6, 7, 8]);

        proto.on_control_setup(GAME_IO, WRITE, 1);
        assert!(proto.on_chunk(&[0x9F]));
        assert_eq!(state.output, OutputLatches([0x9F, 3]));
    }

    #[test]
    fn zero_length_write_completes_at_setup() {
        let mut state = IoState::default();
        state.output = OutputLatches([0x12, 0x34]);
        let mut proto = HostProtocol::new(&mut state);
        assert_eq!(proto.on_control_setup(GAME_IO, WRITE, 0), Disposition::Reply(&[]));
        assert!(!proto.on_chunk(&[]));
        assert!(!proto.on_chunk(&[0xFF; 8]));
        assert_eq!(state.output, OutputLatches([0x12, 0x34]));
    }

    #[test]
    fn empty_chunks_are_no_ops() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 2);
        assert!(!proto.on_chunk(&[]));
        assert!(!proto.on_chunk(&[]));
        assert_eq!(proto.state().pending.received(), 0);
        assert!(proto.on_chunk(&[0x07, 0x00]));
    }

    #[test]
    fn overrun_is_truncated_and_completes_once() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        // Declared beyond the staging buffer: clamped to 8.
        proto.on_control_setup(GAME_IO, WRITE, 12);
        assert!(!proto.on_chunk(&[0x01, 0x00, 0x02, 0x00, 0x00]));
        assert!(proto.on_chunk(&[0x00, 0x00, 0x00, 0xEE, 0xEE]));
        assert!(!proto.on_chunk(&[0xEE, 0xEE]));
        assert_eq!(proto.state().pending.received(), 8);
        assert_eq!(state.output, OutputLatches([0x01, 0x02]));
    }

    #[test]
    fn completion_fires_at_expected_length_not_buffer_size() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 3);
        assert!(proto.on_chunk(&[0x0A, 0x0B, 0x0C, 0x0D, 0x0E]));
        assert!(!proto.on_chunk(&[0x0F]));
        assert_eq!(proto.state().pending.received(), 3);
        assert_eq!(state.output, OutputLatches([0x0A, 0x0C]));
    }

    #[test]
    fn new_setup_abandons_write_in_progress() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 8);
        assert!(!proto.on_chunk(&[0xDE, 0xAD, 0xBE]));

        proto.on_control_setup(GAME_IO, WRITE, 4);
        assert_eq!(proto.state().pending.received(), 0);
        assert!(!proto.on_chunk(&[0x05, 0x06]));
        assert!(proto.on_chunk(&[0x07, 0x08]));
        assert_eq!(state.output, OutputLatches([0x05, 0x07]));
    }

    #[test]
    fn chunk_without_setup_is_ignored() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        assert!(!proto.on_chunk(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(state.output, OutputLatches::default());
    }

    #[test]
    fn read_returns_the_snapshot() {
        let mut state = IoState::default();
        state.input = InputSnapshot([0xE0, 0xFF, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let mut proto = HostProtocol::new(&mut state);
        match proto.on_control_setup(GAME_IO, READ, 8) {
            Disposition::Reply(bytes) => {
                assert_eq!(bytes.len(), 8);
                assert_eq!(bytes[0], 0xE0);
                assert_eq!(bytes[2], 0x7F);
                assert!([1, 3, 4, 5, 6, 7].iter().all(|&i| bytes[i] == 0xFF));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn read_ignores_declared_length() {
        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        assert_eq!(
            proto.on_control_setup(GAME_IO, READ, 2),
            Disposition::Reply(&[0xFF; 8][..])
        );
    }

    #[test]
    fn unknown_requests_are_rejected_without_side_effects() {
        let mut state = IoState::default();
        state.output = OutputLatches([0x55, 0xAA]);
        state.input = InputSnapshot([0x01; 8]);
        let mut proto = HostProtocol::new(&mut state);
        proto.on_control_setup(GAME_IO, WRITE, 8);
        proto.on_chunk(&[0x10, 0x00]);

        assert_eq!(proto.on_control_setup(0xAF, WRITE, 8), Disposition::Reject);
        assert_eq!(proto.on_control_setup(GAME_IO, 0x41, 8), Disposition::Reject);
        assert_eq!(proto.on_control_setup(GAME_IO, 0x00, 8), Disposition::Reject);
        assert_eq!(proto.on_control_setup(0x06, 0x80, 18), Disposition::Reject);

        // the write in progress survives
        assert_eq!(proto.state().pending.received(), 2);
        assert_eq!(state.output, OutputLatches([0x55, 0xAA]));
        assert_eq!(state.input, InputSnapshot([0x01; 8]));
    }

    #[test]
    fn handler_trait_reads_fields_from_the_packet() {
        let raw = [0x40, 0xAE, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00];
        let setup = SetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.direction(), UsbDir::Out);
        assert_eq!(setup.kind(), UsbRequestKind::Vendor);
        assert_eq!(setup.length.get(), 8);

        let mut state = IoState::default();
        let mut proto = HostProtocol::new(&mut state);
        assert_eq!(proto.on_setup(&setup), Disposition::Defer);
        assert!(proto.on_data_chunk(&[0x03, 0x00, 0x0C, 0, 0, 0, 0, 0]));
        assert_eq!(state.output, OutputLatches([0x03, 0x0C]));
    }

    #[test]
    fn discarded_data_stage_runs_to_the_declared_length() {
        let mut stage = OutDataStage::discard(8);
        assert!(stage.is_active());
        assert_eq!(
            stage.receive(8, 64),
            Some(OutPacket { forward: false, finished: true })
        );
        assert!(!stage.is_active());
        // the status OUT of a later IN transfer isn't data
        assert_eq!(stage.receive(0, 64), None);
    }

    #[test]
    fn rejected_write_never_reaches_the_staging_buffer() {
        let mut state = IoState::default();
        state.output = OutputLatches([0x21, 0x43]);
        let mut proto = HostProtocol::new(&mut state);

        let setup = SetupPacket::new(0x40, 0x01, 0, 0, 8);
        let mut stage = match proto.on_setup(&setup) {
            Disposition::Reject => OutDataStage::discard(setup.length.get()),
            other => panic!("unexpected {:?}", other),
        };
        let packet = stage.receive(8, 64).unwrap();
        if packet.forward {
            proto.on_data_chunk(&[0xFF; 8]);
        }

        assert!(packet.finished);
        assert_eq!(proto.state().pending.received(), 0);
        assert_eq!(state.output, OutputLatches([0x21, 0x43]));
    }

    #[test]
    fn forwarded_data_stage_spans_full_packets() {
        let mut stage = OutDataStage::forward(130);
        assert_eq!(stage.receive(64, 64), Some(OutPacket { forward: true, finished: false }));
        assert_eq!(stage.receive(64, 64), Some(OutPacket { forward: true, finished: false }));
        assert_eq!(stage.receive(2, 64), Some(OutPacket { forward: true, finished: true }));
        assert!(!stage.is_active());
    }

    #[test]
    fn short_packet_ends_data_stage_early() {
        let mut stage = OutDataStage::forward(100);
        assert_eq!(stage.receive(10, 64), Some(OutPacket { forward: true, finished: true }));
        assert!(!stage.is_active());
    }

    #[test]
    fn setup_packet_layout() {
        let setup = SetupPacket::new(0xC0, 0xAE, 0x1234, 0x0001, 8);
        assert_eq!(setup.as_bytes(), &[0xC0, 0xAE, 0x34, 0x12, 0x01, 0x00, 0x08, 0x00]);
        assert_eq!(setup.direction(), UsbDir::In);
        assert_eq!(SetupPacket::new(0x00, 0x05, 7, 0, 0).kind(), UsbRequestKind::Standard);
        assert!(SetupPacket::parse(&[0; 7]).is_none());
    }
}
