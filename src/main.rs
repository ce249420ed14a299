// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PIUIO-compatible I/O board firmware for RP2040.
//!
//! This is the hardware half. Everything interesting about the PIUIO protocol
//! and the sensor/lamp scan lives in the `piuio` library; this file's job is to
//! get an RP2040 from reset to the point where that library can run, and to
//! give it three things:
//!
//! - A USB transport: EP0 only, enough standard requests to enumerate, and a
//!   pass-through of vendor requests to the library's `ControlHandler`.
//! - A watchdog.
//! - SIO-backed GPIO for the sensor mux and lamp latches.
//!
//! Like the rest of this firmware, it's written to be read top to bottom:
//! `main` does the bring-up linearly, and the pieces it hands to the library
//! are defined after it.
//!
//! There's no HAL. Register access goes through `rp2040_pac`, and the `unsafe`
//! you see inside register `write` and `modify` closures is there because the
//! PAC marks raw `bits` writes unsafe, not because anything tricky is going on.
//! The one bit of genuinely unsafe code is the access to the EP0 buffer in USB
//! DPRAM, and it's commented where it happens.
//!
//! # Diagnostic pins
//!
//! The firmware has no logging. Instead it raises a few GPIOs while it's busy
//! with particular events, so that you can watch the event flow on a logic
//! analyzer:
//!
//! - `LED_PIN`: any USB activity.
//! - `SETUP_PIN`: a SETUP request is being handled.
//! - `BUFF_PIN`: an EP0 buffer completed.
//! - `RESET_PIN`: bus reset.
//!
//! When in doubt, insert a `raise_pin(sio, LED_PIN);` somewhere and see if the
//! light comes on.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, U16};
use byteorder::LittleEndian;

use panic_halt as _;

use piuio::protocol::{OutDataStage, UsbDir, UsbRequestKind};
use piuio::{
    ControlHandler, Controller, Disposition, OutputLine, ScanLines, SetupPacket, Transport,
    Watchdog,
};

// Pin assignments. The scan pins are logical-to-physical maps for the
// `OutputLine`s the library drives; see `SioLines`.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-pico")] {
        const LED_PIN: u8 = 25; // any activity
        const SETUP_PIN: u8 = 0; // SETUP request being handled
        const BUFF_PIN: u8 = 1; // activity on a buffer
        const RESET_PIN: u8 = 2; // bus reset!

        const MUX_ADDRESS_PINS: [u8; 4] = [3, 4, 5, 6];
        const SENSE_PIN: u8 = 7;
        const LATCH_ADDRESS_PINS: [u8; 3] = [8, 9, 10];
        const LATCH_DATA_PINS: [u8; 2] = [11, 12];
        const LATCH_ENABLE_PIN: u8 = 13;

        #[link_section = ".boot2"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    } else if #[cfg(feature = "target-feather")] {
        const LED_PIN: u8 = 13; // any activity
        const SETUP_PIN: u8 = 0; // SETUP request being handled
        const BUFF_PIN: u8 = 1; // activity on a buffer
        const RESET_PIN: u8 = 2; // bus reset!

        const MUX_ADDRESS_PINS: [u8; 4] = [6, 7, 8, 9];
        const SENSE_PIN: u8 = 10;
        const LATCH_ADDRESS_PINS: [u8; 3] = [11, 12, 24];
        const LATCH_DATA_PINS: [u8; 2] = [25, 26];
        const LATCH_ENABLE_PIN: u8 = 27;

        // The Adafruit board uses a GigaDevices flash chip that needs its own
        // second-stage bootloader.
        #[link_section = ".boot2"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GD25Q64CS;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// The latch enable input on the '259-style latches we use is active low.
const LATCH_ENABLE_ACTIVE_LOW: bool = true;

/// System clock after bring-up.
const SYS_CLK_HZ: u32 = 132_000_000;
const CYCLES_PER_MS: u32 = SYS_CLK_HZ / 1000;

/// Time given to the mux or latch address decoder after the address changes.
/// About half a microsecond at 132 MHz.
const SETTLE_CYCLES: u32 = 64;

/// Watchdog timeout. The counter runs at twice the tick rate (RP2040-E1), and
/// we tick at 1 MHz, so this is 1 second.
const WATCHDOG_LOAD: u32 = 2 * 1_000_000;

/// Largest packet on EP0.
const EP0_MAX_PACKET: usize = 64;

/// EP0 has a single buffer, shared by both directions, at a fixed offset in USB
/// DPRAM.
const EP0_BUFFER_OFFSET: usize = 0x100;

#[entry]
fn main() -> ! {
    // Fresh out of reset, running from the ring oscillator, all pins tristated.
    let p = rp2040_pac::Peripherals::take().unwrap();

    //////////////////////////////////////////////////////////////////////////
    // I/O pins.

    p.RESETS.reset.modify(|_, w| w.io_bank0().clear_bit().pads_bank0().clear_bit());
    while !p.RESETS.reset_done.read().io_bank0().bit() {}
    while !p.RESETS.reset_done.read().pads_bank0().bit() {}

    let outputs = [LED_PIN, SETUP_PIN, BUFF_PIN, RESET_PIN, LATCH_ENABLE_PIN]
        .into_iter()
        .chain(MUX_ADDRESS_PINS)
        .chain(LATCH_ADDRESS_PINS)
        .chain(LATCH_DATA_PINS);
    for pin in outputs.clone() {
        p.IO_BANK0.gpio[pin as usize].gpio_ctrl.write(|w| w.funcsel().sio());
    }
    // Keep the latches shut until the first cycle has put sane data on the
    // data lines.
    SioLines { sio: &p.SIO }.set(OutputLine::LatchEnable, false);
    for pin in outputs {
        p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << pin) });
    }

    // The sense line idles high; sensors pull it down.
    p.IO_BANK0.gpio[SENSE_PIN as usize].gpio_ctrl.write(|w| w.funcsel().sio());
    p.PADS_BANK0.gpio[SENSE_PIN as usize].write(|w| w
        .ie().set_bit()
        .pue().set_bit()
        .pde().clear_bit()
    );
    p.SIO.gpio_oe_clr.write(|w| unsafe { w.bits(1 << SENSE_PIN) });

    //////////////////////////////////////////////////////////////////////////
    // Clocks: crystal, then a 132 MHz system PLL and the 48 MHz USB PLL.

    p.XOSC.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
    while !p.XOSC.status.read().stable().bit() {}
    // clk_ref from XOSC. clk_sys follows it by default.
    p.CLOCKS.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
    while p.CLOCKS.clk_ref_selected.read().bits() != (1 << 2) {}
    p.ROSC.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

    // PLL_SYS: 12 MHz * 132 = 1584 MHz VCO, / 6 / 2 = 132 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_sys().clear_bit());
    while !p.RESETS.reset_done.read().pll_sys().bit() {}
    p.PLL_SYS.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_SYS.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(132) });
    p.PLL_SYS.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_SYS.cs.read().lock().bit() {}
    p.PLL_SYS.prim.write(|w| unsafe { w.postdiv1().bits(6).postdiv2().bits(2) });
    p.PLL_SYS.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
    p.CLOCKS.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
    while p.CLOCKS.clk_sys_selected.read().bits() != (1 << 1) {}

    // PLL_USB: 12 MHz * 100 = 1200 MHz VCO, / 5 / 5 = 48 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_usb().clear_bit());
    while !p.RESETS.reset_done.read().pll_usb().bit() {}
    p.PLL_USB.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_USB.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(100) });
    p.PLL_USB.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_USB.cs.read().lock().bit() {}
    p.PLL_USB.prim.write(|w| unsafe { w.postdiv1().bits(5).postdiv2().bits(5) });
    p.PLL_USB.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_usb_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());

    //////////////////////////////////////////////////////////////////////////
    // Watchdog. From here on the loop has one second per iteration before the
    // chip resets itself.

    // Reset everything but the oscillators when it bites.
    p.PSM.wdsel.write(|w| unsafe { w.bits(0x0001_fffc) });
    // 1 us ticks from the 12 MHz clk_ref.
    p.WATCHDOG.tick.write(|w| unsafe { w.cycles().bits(12).enable().set_bit() });
    let mut watchdog = Rp2040Watchdog { regs: &p.WATCHDOG };
    watchdog.feed();
    p.WATCHDOG.ctrl.write(|w| w
        .pause_dbg0().set_bit()
        .pause_dbg1().set_bit()
        .pause_jtag().set_bit()
        .enable().set_bit()
    );

    //////////////////////////////////////////////////////////////////////////
    // USB controller, device mode, EP0 only.

    p.RESETS.reset.modify(|_, w| w.usbctrl().set_bit());
    p.RESETS.reset.modify(|_, w| w.usbctrl().clear_bit());
    while !p.RESETS.reset_done.read().usbctrl().bit() {}

    // Clear the control portion of DPRAM. The datasheet doesn't say we have
    // to; the SDK does it anyway.
    p.USBCTRL_DPRAM.setup_packet_low.write(|w| unsafe { w.bits(0) });
    p.USBCTRL_DPRAM.setup_packet_high.write(|w| unsafe { w.bits(0) });
    for epc in &p.USBCTRL_DPRAM.ep_control {
        epc.write(|w| unsafe { w.bits(0) });
    }
    for epb in &p.USBCTRL_DPRAM.ep_buffer_control {
        epb.write(|w| unsafe { w.bits(0) });
    }

    p.USBCTRL_REGS.usb_muxing.write(|w| w.to_phy().set_bit().softcon().set_bit());
    // Not every board wires up VBUS detect. Pretend it's always there.
    p.USBCTRL_REGS.usb_pwr.write(|w| w.vbus_detect().set_bit()
        .vbus_detect_override_en().set_bit()
    );
    p.USBCTRL_REGS.main_ctrl.write(|w| w
        .controller_en().set_bit()
        .host_ndevice().clear_bit()
    );
    // Flag every EP0 buffer in buff_status.
    p.USBCTRL_REGS.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());
    p.USBCTRL_REGS.inte.write(|w| w
        .buff_status().set_bit()
        .bus_reset().set_bit()
        .setup_req().set_bit()
    );

    let transport = UsbTransport::new(&p.USBCTRL_REGS, &p.USBCTRL_DPRAM, &p.SIO);

    //////////////////////////////////////////////////////////////////////////
    // Hand over to the library. `bring_up` drops us off the bus for half a
    // second so the host re-enumerates us after a watchdog reset, then pulls
    // D+ up.

    let mut controller = Controller::new(transport, watchdog, SioLines { sio: &p.SIO });
    controller.bring_up(|ms| cortex_m::asm::delay(ms * CYCLES_PER_MS));
    controller.run()
}

////////////////////////////////////////////////////////////////////////////
// USB transport.

/// EP0 state, plus the bits of device state that only the transport cares
/// about.
struct UsbTransport<'a> {
    regs: &'a rp2040_pac::USBCTRL_REGS,
    dpram: &'a rp2040_pac::USBCTRL_DPRAM,
    sio: &'a rp2040_pac::SIO,

    /// When the host gives us a new address, we can't just slap it into
    /// registers right away, because we have to do an acknowledgement step
    /// using our _old_ address. Instead, we'll store `Some(the_address)` here
    /// and apply it when the status stage completes.
    new_address: Option<u8>,
    /// Set when we've sent an IN data stage and owe the host a receive for
    /// its zero-length status OUT.
    status_out_pending: bool,
    /// The OUT data stage the host is part way through, if any.
    out_stage: OutDataStage,
    /// DATA PID expected next on EP0 IN and OUT; `true` means DATA1.
    in_pid_1: bool,
    out_pid_1: bool,
}

impl<'a> UsbTransport<'a> {
    fn new(
        regs: &'a rp2040_pac::USBCTRL_REGS,
        dpram: &'a rp2040_pac::USBCTRL_DPRAM,
        sio: &'a rp2040_pac::SIO,
    ) -> Self {
        Self {
            regs,
            dpram,
            sio,
            new_address: None,
            status_out_pending: false,
            out_stage: OutDataStage::IDLE,
            in_pid_1: true,
            out_pid_1: true,
        }
    }

    fn handle_standard(&mut self, setup: &SetupPacket) {
        match (setup.direction(), UsbSetupRequest::from_u8(setup.request)) {
            (UsbDir::Out, Some(UsbSetupRequest::SetAddress)) => {
                // The address is in the bottom 8 bits of `value`. It takes
                // effect once this request's status stage is done.
                self.new_address = Some(setup.value.get() as u8);
                self.acknowledge_out_request();
            }
            (UsbDir::Out, _) => {
                // SetConfiguration included: we have one configuration and it
                // doesn't change anything. Anything else we don't understand
                // gets the same empty status stage, which keeps the host from
                // spinning while we NAK.
                self.ignore_out_request(setup);
            }
            (UsbDir::In, Some(UsbSetupRequest::GetDescriptor)) => {
                self.send_descriptor(setup);
            }
            (UsbDir::In, _) => {
                // Other IN request. Ignore.
            }
        }
    }

    fn send_descriptor(&mut self, setup: &SetupPacket) {
        let max = setup.length.get();
        let mut tmp = [0u8; EP0_MAX_PACKET];

        // Descriptor type is in the _top_ 8 bits of value, index in the
        // bottom 8.
        match UsbDescType::from_u16(setup.value.get() >> 8) {
            Some(UsbDescType::Device) => {
                self.send_data(DEVICE_DESCRIPTOR.as_bytes(), max);
            }
            Some(UsbDescType::Config) => {
                // The host asks for the bare config descriptor first to learn
                // `total_length`, then again for the whole lot. The whole lot
                // is just the interface descriptor, since EP0 doesn't get one.
                let mut used = 0;
                for part in [CONFIG_DESCRIPTOR.as_bytes(), INTERFACE_DESCRIPTOR.as_bytes()] {
                    tmp[used..used + part.len()].copy_from_slice(part);
                    used += part.len();
                }
                self.send_data(&tmp[..used], max);
            }
            Some(UsbDescType::String) => {
                let i = usize::from(setup.value.get() & 0xFF);
                if i == 0 {
                    // Special index 0 requests the language descriptor.
                    self.send_data(LANG_DESCRIPTOR, max);
                } else if let Some(s) = DESCRIPTOR_STRINGS.get(i - 1) {
                    let len = 2 + s.len();
                    tmp[0] = len as u8;
                    tmp[1] = UsbDescType::String as u8;
                    tmp[2..len].copy_from_slice(s);
                    self.send_data(&tmp[..len], max);
                }
            }
            _ => {
                // Interface and endpoint descriptors went out with the config
                // descriptor, and there's nothing else to ask for.
            }
        }
    }

    /// Routes a vendor SETUP through the protocol handler and sets up EP0 for
    /// whatever it decided.
    fn handle_vendor<H: ControlHandler>(&mut self, setup: &SetupPacket, handler: &mut H) {
        let dir = setup.direction();
        match (handler.on_setup(setup), dir) {
            (Disposition::Reply(bytes), UsbDir::In) => {
                self.send_data(bytes, setup.length.get());
            }
            (Disposition::Defer, UsbDir::Out) if setup.length.get() > 0 => {
                self.out_stage = OutDataStage::forward(setup.length.get());
                self.start_rx(EP0_MAX_PACKET);
            }
            (Disposition::Reply(_), UsbDir::Out) => self.acknowledge_out_request(),
            (_, UsbDir::In) => self.send_data(&[], 0),
            (_, UsbDir::Out) => self.ignore_out_request(setup),
        }
    }

    /// Handles one completed EP0 buffer. `data` is only meaningful for OUT.
    fn buffer_done<H: ControlHandler>(&mut self, ep_addr: u8, data: &[u8], handler: &mut H) {
        match ep_addr {
            EP0_IN_ADDR => {
                if let Some(a) = self.new_address.take() {
                    self.regs.addr_endp.write(|w| unsafe { w.address().bits(a) });
                } else if self.status_out_pending {
                    self.status_out_pending = false;
                    self.start_rx(0);
                }
            }
            EP0_OUT_ADDR => {
                let packet = match self.out_stage.receive(data.len(), EP0_MAX_PACKET) {
                    Some(p) => p,
                    // The status stage of an IN transfer. Nothing to do.
                    None => return,
                };
                if packet.forward {
                    // Whether the handler considers its write complete doesn't
                    // matter here: the status stage follows our own count of
                    // `wLength`, so an overrunning host still gets one.
                    let _ = handler.on_data_chunk(data);
                }
                if packet.finished {
                    self.acknowledge_out_request();
                } else {
                    self.start_rx(EP0_MAX_PACKET);
                }
            }
            _ => {}
        }
    }

    /// Completes an OUT request nobody wants. If the host declared a data
    /// stage, it's received and dropped first; the host won't look for the
    /// status stage until it has sent every byte.
    fn ignore_out_request(&mut self, setup: &SetupPacket) {
        let length = setup.length.get();
        if length > 0 {
            self.out_stage = OutDataStage::discard(length);
            self.start_rx(EP0_MAX_PACKET);
        } else {
            self.acknowledge_out_request();
        }
    }

    /// Configure the next IN on EP0 to deliver a successful-but-empty payload.
    /// This is the status stage of an OUT control transfer.
    fn acknowledge_out_request(&mut self) {
        self.start_tx(&[]);
    }

    /// Sends an IN data stage of at most `max` bytes, and arranges to receive
    /// the host's status OUT afterwards.
    fn send_data(&mut self, bytes: &[u8], max: u16) {
        let n = bytes.len().min(usize::from(max));
        self.start_tx(&bytes[..n]);
        self.status_out_pending = true;
    }

    fn ep0_buffer(&self) -> *mut u8 {
        (rp2040_pac::USBCTRL_DPRAM::ptr() as usize + EP0_BUFFER_OFFSET) as *mut u8
    }

    /// Configures EP0 to send data (device-to-host, IN) when the host next
    /// asks for it.
    ///
    /// The contents of `buffer` are _copied_ into USB SRAM, so it can be
    /// reused immediately.
    fn start_tx(&mut self, buffer: &[u8]) {
        // Multi-packet IN transfers aren't supported; nothing we send needs
        // them.
        let len = buffer.len().min(EP0_MAX_PACKET);

        // Safety: the EP0 buffer is 64 bytes of DPRAM that only EP0 uses,
        // and the hardware isn't looking at it, because EP0 is idle whenever
        // we get here (we only start a transfer in response to the previous
        // one finishing or a new SETUP cancelling it). We never hold a
        // reference into it across this write.
        unsafe {
            self.ep0_buffer().copy_from_nonoverlapping(buffer.as_ptr(), len);
        }

        let np = self.in_pid_1;
        self.dpram.ep_buffer_control[0].write(|w| unsafe {
            w
                // DATA0/1, depending
                .pid_0().bit(np)
                // We have put data in.
                .full_0().set_bit()
                // The data is for the computer to use now.
                .available_0().set_bit()
                // There are this many bytes.
                .length_0().bits(len as u16)
        });
        self.in_pid_1 = !np;
    }

    fn start_rx(&mut self, len: usize) {
        let np = self.out_pid_1;
        self.dpram.ep_buffer_control[1].write(|w| unsafe {
            w
                .pid_0().bit(np)
                // Buffer is NOT full, we want the computer to fill it plz.
                .full_0().clear_bit()
                // It is, however, available to be filled.
                .available_0().set_bit()
                // Up to this many bytes.
                .length_0().bits(len.min(EP0_MAX_PACKET) as u16)
        });
        self.out_pid_1 = !np;
    }
}

impl Transport for UsbTransport<'_> {
    fn service<H: ControlHandler>(&mut self, handler: &mut H) {
        let ints = self.regs.ints.read();

        // Setup request received?
        if ints.setup_req().bit() {
            raise_pin(self.sio, LED_PIN);
            raise_pin(self.sio, SETUP_PIN);
            self.regs.sie_status.write(|w| w.setup_rec().set_bit());

            // The PAC models the setup packet as two 32-bit registers. Copy it
            // out to bytes so zerocopy can reinterpret it.
            let mut raw = [0; 8];
            raw[..4].copy_from_slice(&self.dpram.setup_packet_low.read().bits().to_le_bytes());
            raw[4..].copy_from_slice(&self.dpram.setup_packet_high.read().bits().to_le_bytes());

            // A SETUP cancels whatever EP0 was in the middle of, and both
            // directions restart at DATA1.
            self.status_out_pending = false;
            self.out_stage = OutDataStage::IDLE;
            self.in_pid_1 = true;
            self.out_pid_1 = true;

            if let Some(setup) = SetupPacket::parse(&raw) {
                match setup.kind() {
                    UsbRequestKind::Standard => self.handle_standard(&setup),
                    UsbRequestKind::Vendor => self.handle_vendor(&setup, handler),
                    // No class requests here; answer with an empty transfer,
                    // same as an unknown vendor request.
                    _ => match setup.direction() {
                        UsbDir::In => self.send_data(&[], 0),
                        UsbDir::Out => self.ignore_out_request(&setup),
                    },
                }
            }
            lower_pin(self.sio, SETUP_PIN);
        }

        // Events on one or more buffers?
        if ints.buff_status().bit() {
            raise_pin(self.sio, LED_PIN);
            raise_pin(self.sio, BUFF_PIN);

            let orig_bufbits = self.regs.buff_status.read().bits();
            let mut bufbits = orig_bufbits;
            while bufbits != 0 {
                let lowbit_index = bufbits.trailing_zeros();
                bufbits ^= 1 << lowbit_index;

                // Buffer status bits come in IN/OUT pairs per endpoint.
                let epnum = (lowbit_index >> 1) as u8;
                let dir = if lowbit_index & 1 == 0 { UsbDir::In } else { UsbDir::Out };
                let ep_addr = dir.endpoint(epnum);
                if epnum != 0 {
                    continue;
                }

                let bc = self.dpram.ep_buffer_control[lowbit_index as usize].read();
                if bc.available_0().bit() {
                    // Still the hardware's. Shouldn't happen.
                    continue;
                }
                let len = (bc.length_0().bits() as usize).min(EP0_MAX_PACKET);

                // Safety: the AVAILABLE bit is clear, so the controller has
                // handed the buffer back and won't touch it until we arm EP0
                // again. `buffer_done` consumes the slice before arming it.
                let data = unsafe { core::slice::from_raw_parts(self.ep0_buffer() as *const u8, len) };
                self.buffer_done(ep_addr, data, handler);
            }
            // Acknowledge all buffers, since we handled them all above.
            self.regs.buff_status.write(|w| unsafe { w.bits(orig_bufbits) });

            lower_pin(self.sio, BUFF_PIN);
        }

        // Has the host signaled a bus reset?
        if ints.bus_reset().bit() {
            raise_pin(self.sio, LED_PIN);
            raise_pin(self.sio, RESET_PIN);
            self.regs.sie_status.write(|w| w.bus_reset().set_bit());

            self.new_address = None;
            self.status_out_pending = false;
            self.out_stage = OutDataStage::IDLE;
            self.regs.addr_endp.write(|w| unsafe { w.address().bits(0) });

            lower_pin(self.sio, RESET_PIN);
        }

        lower_pin(self.sio, LED_PIN);
    }

    fn disconnect(&mut self) {
        self.regs.sie_ctrl.modify(|_, w| w.pullup_en().clear_bit());
    }

    /// Present full-speed device by enabling pullup on DP. This is the point
    /// where the host will notice our presence.
    fn connect(&mut self) {
        self.regs.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());
    }
}

////////////////////////////////////////////////////////////////////////////
// Watchdog and scan pins.

struct Rp2040Watchdog<'a> {
    regs: &'a rp2040_pac::WATCHDOG,
}

impl Watchdog for Rp2040Watchdog<'_> {
    fn feed(&mut self) {
        self.regs.load.write(|w| unsafe { w.load().bits(WATCHDOG_LOAD) });
    }
}

/// The scan lines, on SIO. The pins must already be configured.
struct SioLines<'a> {
    sio: &'a rp2040_pac::SIO,
}

impl ScanLines for SioLines<'_> {
    fn set(&mut self, line: OutputLine, high: bool) {
        let (pin, level) = match line {
            OutputLine::MuxAddress(n) => (MUX_ADDRESS_PINS[usize::from(n)], high),
            OutputLine::LatchAddress(n) => (LATCH_ADDRESS_PINS[usize::from(n)], high),
            OutputLine::LatchData1 => (LATCH_DATA_PINS[0], high),
            OutputLine::LatchData2 => (LATCH_DATA_PINS[1], high),
            OutputLine::LatchEnable => (LATCH_ENABLE_PIN, high != LATCH_ENABLE_ACTIVE_LOW),
        };
        if level {
            raise_pin(self.sio, pin);
        } else {
            lower_pin(self.sio, pin);
        }
    }

    fn sense(&mut self) -> bool {
        self.sio.gpio_in.read().bits() & (1 << SENSE_PIN) != 0
    }

    fn settle(&mut self) {
        cortex_m::asm::delay(SETTLE_CYCLES);
    }
}

////////////////////////////////////////////////////////////////////////////
// USB structure and constant definitions.

const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);
const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);

/// Vendor and product ID of the board we're imitating. The game looks for
/// these.
const PIUIO_VENDOR: u16 = 0x0547;
const PIUIO_PRODUCT: u16 = 0x1002;

static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: U16::from_bytes(u16::to_le_bytes(0x0110)),
    device_class: 0xFF,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET as u8,
    vendor: U16::from_bytes(u16::to_le_bytes(PIUIO_VENDOR)),
    product: U16::from_bytes(u16::to_le_bytes(PIUIO_PRODUCT)),
    bcd_device: U16::from_bytes(u16::to_le_bytes(0x0100)),
    manufacturer_s: 1,
    product_s: 2,
    serial_s: 0,
    num_configurations: 1,
};

static CONFIG_DESCRIPTOR: UsbConfigurationDescriptor = UsbConfigurationDescriptor {
    length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
    descriptor_type: UsbDescType::Config,
    total_length: U16::from_bytes(u16::to_le_bytes(
        core::mem::size_of::<UsbConfigurationDescriptor>() as u16
        + core::mem::size_of::<UsbInterfaceDescriptor>() as u16
    )),
    num_interfaces: 1,
    configuration_value: 1,
    configuration_s: 0,
    // Bus powered.
    attributes: 0x80,
    // 500 mA, in 2 mA units.
    max_power: 250,
};

static INTERFACE_DESCRIPTOR: UsbInterfaceDescriptor = UsbInterfaceDescriptor {
    length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
    descriptor_type: UsbDescType::Interface,
    interface_number: 0,
    alternate_setting: 0,
    // Everything goes over EP0.
    num_endpoints: 0,
    interface_class: 0,
    interface_subclass: 0,
    interface_protocol: 0,
    interface_s: 0,
};

static LANG_DESCRIPTOR: &[u8] = &[4, 0x03, 0x09, 0x04];

static DESCRIPTOR_STRINGS: &[&[u8]] = &[
    b"H\0A\0C\0K\0I\0T\0U\0P\0",
    b"P\0I\0U\0I\0O\0",
];

/// The types of standard USB SETUP requests that we understand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum UsbSetupRequest {
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT.
    SetAddress = 0x05,
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    length: u8,
    /// Type of this descriptor, must be `Device`.
    descriptor_type: UsbDescType,
    /// USB version in binary-coded decimal.
    bcd_usb: U16<LittleEndian>,
    /// `0xFF`: vendor specific, which is what the original board reports.
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    /// Maximum packet size on EP0.
    max_packet_size0: u8,
    vendor: U16<LittleEndian>,
    product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    bcd_device: U16<LittleEndian>,
    /// Indices into the string descriptor table, 0 for none.
    manufacturer_s: u8,
    product_s: u8,
    serial_s: u8,
    num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    length: u8,
    /// Type of this descriptor, must be `Config`.
    descriptor_type: UsbDescType,
    /// Total length of this descriptor plus the interface and endpoint
    /// descriptors that follow it.
    total_length: U16<LittleEndian>,
    num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    configuration_value: u8,
    configuration_s: u8,
    /// Bit 7 must be set; bit 6 is self-powered; bit 5 is remote wakeup.
    attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    length: u8,
    /// Type of this descriptor, must be `Interface`.
    descriptor_type: UsbDescType,
    interface_number: u8,
    alternate_setting: u8,
    /// Number of endpoint descriptors in this interface, not counting EP0.
    num_endpoints: u8,
    interface_class: u8,
    interface_subclass: u8,
    interface_protocol: u8,
    interface_s: u8,
}

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
}

////////////////////////////////////////////////////////////////////////////
// Assorted RP2040 support stuff.

/// Raise the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
}

/// Lower the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
}
