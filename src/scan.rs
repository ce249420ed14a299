// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sensor scan / lamp latch cycle.
//!
//! One cycle is two phases, always in this order:
//!
//! **Read.** Close the lamp latches so nothing we do to the shared address bus
//! can leak into them. Then walk the sensor mux through all 16 addresses,
//! sampling the sense line at each, and build the sensor report from the
//! samples. Sensors pull the line low when pressed, and the protocol reports
//! pressed as a 1 bit, so each report byte is the complement of what we
//! sampled.
//!
//! **Write.** Open the latches, walk all 8 latch addresses putting bit `a` of
//! each lamp byte on the matching data line, then close the latches again. The
//! two latches share the address bus and are loaded in parallel.
//!
//! There's no error path. A stuck address line shows up as the wrong sensor
//! lighting up, and that's all you get.

use crate::gpio::{drive_address, OutputLine, ScanLines, LATCH_ADDRESS_LINES, MUX_ADDRESS_LINES};
use crate::state::{InputSnapshot, OutputLatches, NO_SIGNAL, REPORT_LEN};

/// Number of sensor mux addresses visited per cycle.
pub const SENSOR_ADDRESSES: u8 = 16;

/// Number of latch addresses visited per cycle.
pub const LATCH_ADDRESSES: u8 = 8;

/// Where the sample taken at mux address `address` lands in the report:
/// `(byte index, bit index)`.
///
/// Each sensor group is a little-endian 16-bit word, so group `n` starts at
/// byte `2 * n`. Eight sensors per group means only the low byte of each
/// word is ever populated.
pub const fn sensor_slot(address: u8) -> (usize, u8) {
    let group = (address / 8) as usize;
    (group * 2, address % 8)
}

/// Converts sampled line levels into the value the host sees.
pub const fn expose(raw: u8) -> u8 {
    !raw
}

/// Levels of data lines 1 and 2 at latch address `address`.
pub const fn latch_levels(outputs: &OutputLatches, address: u8) -> (bool, bool) {
    let mask = 1 << address;
    (outputs.0[0] & mask != 0, outputs.0[1] & mask != 0)
}

/// Drives the mux and latches through `L`.
pub struct ScanEngine<L> {
    lines: L,
}

impl<L: ScanLines> ScanEngine<L> {
    pub fn new(lines: L) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    /// Runs one full cycle: samples every sensor, then loads `outputs` into the
    /// lamp latches. Returns the new sensor report.
    pub fn run_cycle(&mut self, outputs: &OutputLatches) -> InputSnapshot {
        let snapshot = self.read_phase();
        self.write_phase(outputs);
        snapshot
    }

    /// Samples all 16 sensors.
    pub fn read_phase(&mut self) -> InputSnapshot {
        self.lines.set(OutputLine::LatchEnable, false);

        let mut raw = [0u8; REPORT_LEN];
        for address in 0..SENSOR_ADDRESSES {
            drive_address(&mut self.lines, OutputLine::MuxAddress, MUX_ADDRESS_LINES, address);
            self.lines.settle();

            let (byte, bit) = sensor_slot(address);
            if self.lines.sense() {
                raw[byte] |= 1 << bit;
            } else {
                raw[byte] &= !(1 << bit);
            }
        }

        let mut report = [NO_SIGNAL; REPORT_LEN];
        for address in (0..SENSOR_ADDRESSES).step_by(8) {
            let (byte, _) = sensor_slot(address);
            report[byte] = expose(raw[byte]);
        }
        InputSnapshot(report)
    }

    /// Loads `outputs` into the two lamp latches.
    pub fn write_phase(&mut self, outputs: &OutputLatches) {
        self.lines.set(OutputLine::LatchEnable, true);

        for address in 0..LATCH_ADDRESSES {
            drive_address(&mut self.lines, OutputLine::LatchAddress, LATCH_ADDRESS_LINES, address);
            let (d1, d2) = latch_levels(outputs, address);
            self.lines.set(OutputLine::LatchData1, d1);
            self.lines.set(OutputLine::LatchData2, d2);
            self.lines.settle();
        }

        self.lines.set(OutputLine::LatchEnable, false);
    }
}
