// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of a PIUIO-compatible game I/O board.
//!
//! The PIUIO is the USB I/O board used by a family of dance cabinets. The host
//! game talks to it using exactly one vendor control request, `0xAE`, in two
//! directions:
//!
//! - OUT (`bmRequestType = 0x40`): here are 8 bytes of lamp state. Only bytes 0
//!   and 2 mean anything.
//! - IN (`bmRequestType = 0xC0`): give me 8 bytes of sensor state. Bytes 0 and
//!   2 carry one player's sensors each, active-high; the rest are `0xFF`.
//!
//! On our side of the cable, sensors sit behind a 16-way multiplexer feeding a
//! single sense line, and lamps sit behind a pair of 8-bit addressable latches
//! sharing an address bus and a latch-enable line.
//!
//! Everything runs in one cooperative loop, in this order, forever:
//!
//! 1. Feed the watchdog.
//! 2. Let the USB transport process whatever the host sent. This may call into
//!    [`protocol::HostProtocol`] zero or more times.
//! 3. Run one [`scan::ScanEngine`] cycle: sample all sensors, drive all lamps.
//!
//! There are no interrupts and no locks. The buffers the two halves share live
//! in [`state::IoState`], and the borrow checker hands that to exactly one of
//! them at a time (see [`device::Controller::poll`]).
//!
//! Nothing in this crate touches hardware directly. The firmware binary plugs
//! in RP2040 implementations of [`gpio::ScanLines`], [`device::Transport`] and
//! [`device::Watchdog`]; the tests plug in simulated ones.

#![cfg_attr(not(test), no_std)]

pub mod device;
pub mod gpio;
pub mod protocol;
pub mod scan;
pub mod state;

pub use device::{Controller, Transport, Watchdog};
pub use gpio::{OutputLine, ScanLines};
pub use protocol::{ControlHandler, Disposition, HostProtocol, OutDataStage, SetupPacket};
pub use scan::ScanEngine;
pub use state::{InputSnapshot, IoState, OutputLatches, PendingWrite};
