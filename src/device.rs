// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cooperative loop that ties the USB side and the scan side together.

use crate::gpio::ScanLines;
use crate::protocol::{ControlHandler, HostProtocol};
use crate::scan::ScanEngine;
use crate::state::IoState;

/// [`Controller::bring_up`] stays off the bus for this many steps of
/// [`REENUMERATE_STEP_MS`] each, feeding the watchdog every step. 500 ms.
pub const REENUMERATE_STEPS: u32 = 250;
pub const REENUMERATE_STEP_MS: u32 = 2;

/// A USB device controller, as far as the loop is concerned.
pub trait Transport {
    /// Processes whatever the host has sent since the last call, invoking
    /// `handler` synchronously for vendor requests. Must return promptly.
    fn service<H: ControlHandler>(&mut self, handler: &mut H);

    /// Drops off the bus so the host forgets about us.
    fn disconnect(&mut self);

    /// Presents the device to the host, starting enumeration.
    fn connect(&mut self);
}

/// Something that resets the chip if it isn't fed often enough.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Owns every piece of device state and runs the loop.
pub struct Controller<T, W, L> {
    transport: T,
    watchdog: W,
    scanner: ScanEngine<L>,
    state: IoState,
}

impl<T, W, L> Controller<T, W, L>
where
    T: Transport,
    W: Watchdog,
    L: ScanLines,
{
    pub fn new(transport: T, watchdog: W, lines: L) -> Self {
        Self {
            transport,
            watchdog,
            scanner: ScanEngine::new(lines),
            state: IoState::default(),
        }
    }

    /// Forces the host to enumerate us from scratch: disconnect, wait long
    /// enough for the host to notice, reconnect. `wait_ms` should busy-wait;
    /// the watchdog is fed between waits.
    pub fn bring_up(&mut self, mut wait_ms: impl FnMut(u32)) {
        self.transport.disconnect();
        for _ in 0..REENUMERATE_STEPS {
            self.watchdog.feed();
            wait_ms(REENUMERATE_STEP_MS);
        }
        self.transport.connect();
    }

    /// One iteration: watchdog, host traffic, scan cycle.
    ///
    /// `state` is lent to the protocol handler for the duration of the
    /// transport service and only then to the scan engine, so a host read
    /// always sees a complete report from an earlier cycle and a lamp write
    /// lands in the latches whole.
    pub fn poll(&mut self) {
        self.watchdog.feed();

        self.transport.service(&mut HostProtocol::new(&mut self.state));

        self.state.input = self.scanner.run_cycle(&self.state.output);
    }

    /// Runs the loop forever.
    pub fn run(mut self) -> ! {
        loop {
            self.poll();
        }
    }

    pub fn state(&self) -> &IoState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn lines(&self) -> &L {
        self.scanner.lines()
    }

    pub fn lines_mut(&mut self) -> &mut L {
        self.scanner.lines_mut()
    }
}
