// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO primitive access used by the scan engine.
//!
//! The scan engine thinks in terms of *logical* lines (address bit 2 of the
//! sensor mux, lamp data line 1, ...). Mapping those onto physical pins, and
//! dealing with any inverted polarity on the way, is the board's problem.

/// Number of address lines on the sensor multiplexer.
pub const MUX_ADDRESS_LINES: u8 = 4;

/// Number of address lines shared by the two output latches.
pub const LATCH_ADDRESS_LINES: u8 = 3;

/// Every output line the scan engine drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutputLine {
    /// Sensor multiplexer address bit `n`, `0..MUX_ADDRESS_LINES`.
    MuxAddress(u8),
    /// Output latch address bit `n`, `0..LATCH_ADDRESS_LINES`.
    LatchAddress(u8),
    /// Data input of the first output latch (OutputLatches byte 0).
    LatchData1,
    /// Data input of the second output latch (OutputLatches byte 1).
    LatchData2,
    /// Latch input enable. Logical high means the latches are listening to
    /// their data lines, whatever the electrical polarity on the board.
    LatchEnable,
}

/// The pins the scan engine needs.
pub trait ScanLines {
    /// Drives `line` to logical level `high`.
    fn set(&mut self, line: OutputLine, high: bool);

    /// Samples the shared sensor sense line. `true` is electrically high.
    fn sense(&mut self) -> bool;

    /// Called after the address bus changes and before the result is used,
    /// giving the mux or latch time to follow. Boards with fast enough glue
    /// logic can leave this empty.
    fn settle(&mut self) {}
}

/// Puts `value` on an address bus `width` lines wide, LSB on line 0.
///
/// Bits of `value` above `width` are ignored.
pub fn drive_address<L: ScanLines>(
    lines: &mut L,
    line: fn(u8) -> OutputLine,
    width: u8,
    value: u8,
) {
    for bit in 0..width {
        lines.set(line(bit), value & (1 << bit) != 0);
    }
}
