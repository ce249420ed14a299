// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffers shared between the protocol handler and the scan engine.

use zerocopy::AsBytes;

/// Size of the sensor report the host reads, and of the lamp report it writes.
pub const REPORT_LEN: usize = 8;

/// Value of a report byte with nothing asserted.
pub const NO_SIGNAL: u8 = 0xFF;

/// The 8-byte sensor report returned to the host.
///
/// Bytes 0 and 2 hold the two sensor groups; every other byte is
/// [`NO_SIGNAL`]. Rebuilt from scratch by every scan cycle.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InputSnapshot(pub [u8; REPORT_LEN]);

impl InputSnapshot {
    /// A report with no sensor asserted.
    pub const IDLE: Self = Self([NO_SIGNAL; REPORT_LEN]);
}

impl Default for InputSnapshot {
    fn default() -> Self {
        Self::IDLE
    }
}

/// Lamp state, one bit per output line, non-inverted. Byte 0 goes to the
/// first output latch, byte 1 to the second.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutputLatches(pub [u8; 2]);

/// Staging area for a lamp write that arrives in pieces.
///
/// `received <= expected <= REPORT_LEN` always holds.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingWrite {
    buffer: [u8; REPORT_LEN],
    received: usize,
    expected: usize,
    open: bool,
}

impl PendingWrite {
    /// Starts a new transaction expecting `declared` bytes, dropping whatever
    /// was in flight. Lengths beyond the staging buffer are clamped.
    ///
    /// The staging bytes themselves are not cleared.
    pub fn begin(&mut self, declared: u16) {
        self.received = 0;
        self.expected = usize::from(declared).min(REPORT_LEN);
        self.open = self.expected != 0;
    }

    /// Appends `chunk` to the staging buffer. Returns `true` if this chunk
    /// completed the transaction, which closes it.
    ///
    /// Bytes beyond the expected length are dropped, as are chunks arriving
    /// with no transaction open.
    pub fn accept(&mut self, chunk: &[u8]) -> bool {
        if !self.open {
            return false;
        }
        let room = self.expected - self.received;
        let n = chunk.len().min(room);
        self.buffer[self.received..self.received + n].copy_from_slice(&chunk[..n]);
        self.received += n;

        if self.received == self.expected {
            self.open = false;
            true
        } else {
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// The staging buffer, including stale bytes from earlier transactions.
    pub fn staged(&self) -> &[u8; REPORT_LEN] {
        &self.buffer
    }
}

/// Everything the cooperative loop hands back and forth between the USB side
/// and the scan side.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IoState {
    /// Latest sensor report, written by the scan engine.
    pub input: InputSnapshot,
    /// Latest lamp state, written by the protocol handler.
    pub output: OutputLatches,
    /// Lamp write being assembled, if any.
    pub pending: PendingWrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_state() {
        let s = IoState::default();
        assert_eq!(s.input.as_bytes(), &[0xFF; 8]);
        assert_eq!(s.output, OutputLatches([0, 0]));
        assert!(!s.pending.is_open());
        assert_eq!(s.pending.received(), 0);
    }

    #[test]
    fn begin_clamps_declared_length() {
        let mut p = PendingWrite::default();
        p.begin(300);
        assert_eq!(p.expected(), REPORT_LEN);
        assert!(p.is_open());
    }

    #[test]
    fn zero_length_transaction_is_never_open() {
        let mut p = PendingWrite::default();
        p.begin(0);
        assert!(!p.is_open());
        assert!(!p.accept(&[1, 2, 3]));
        assert_eq!(p.received(), 0);
    }

    #[test]
    fn accept_stops_at_expected_length() {
        let mut p = PendingWrite::default();
        p.begin(3);
        assert!(p.accept(&[9, 8, 7, 6, 5]));
        assert_eq!(p.received(), 3);
        assert_eq!(&p.staged()[..4], &[9, 8, 7, 0]);
        assert!(!p.is_open());
    }

    #[test]
    fn begin_keeps_stale_staging_bytes() {
        let mut p = PendingWrite::default();
        p.begin(8);
        p.accept(&[1, 2, 3, 4, 5, 6, 7, 8]);
        p.begin(1);
        p.accept(&[0x55]);
        assert_eq!(p.staged(), &[0x55, 2, 3, 4, 5, 6, 7, 8]);
    }
}
