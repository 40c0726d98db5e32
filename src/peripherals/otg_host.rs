//! Polling host driver for the Synopsys OTG FS core of the STM32F407.
//!
//! embassy-stm32 only ships a device-mode driver for this core, so the host side
//! is driven here through its registers in slave (non-DMA) mode. Every transfer
//! is split into single packets: channel 0 carries OUT and SETUP packets, channel
//! 1 carries IN packets, and the data toggles are tracked in software.

use embassy_stm32::{
    gpio::{Level, Output, Speed},
    pac::{
        self,
        gpio::vals::{Moder, Ospeedr},
        otg::{regs, Otg},
    },
    peripherals::{PA11, PA12, PC0, USB_OTG_FS},
    rcc, Peri,
};
use embassy_time::{block_for, Duration, Instant};

use acc_logger::usb_host::descriptor::SetupPacket;
use acc_logger::usb_host::driver::{BulkPipe, ControlTarget, DataToggle, DeviceSpeed, HostDriver, PortEvent, TransferError};

/// Peripheral collection for the USB OTG FS host port
pub struct OtgPeripherals<'d> {
    pub otg: Peri<'d, USB_OTG_FS>,
    pub dm: Peri<'d, PA11>,   // D-
    pub dp: Peri<'d, PA12>,   // D+
    pub vbus: Peri<'d, PC0>,  // VBUS switch enable, active low
}

/// Macro to claim peripherals for the OTG FS host port
#[macro_export]
macro_rules! claim_otg {
    ($peripherals:expr) => {{
        $crate::peripherals::otg_host::OtgPeripherals {
            otg: $peripherals.USB_OTG_FS,
            dm: $peripherals.PA11,
            dp: $peripherals.PA12,
            vbus: $peripherals.PC0,
        }
    }};
}

/// Core register block, typed by the device PAC
const OTG: Otg = pac::USB_OTG_FS;

/// PA11 (D-) and PA12 (D+) pin numbers in GPIOA
const DM_PIN: usize = 11;
const DP_PIN: usize = 12;
/// OTG_FS alternate function on PA11/PA12
const AF_OTG_FS: u8 = 10;

/// HCFG.FSLSPCS and HFIR.FRIVL for a 48 MHz PHY clock (full speed) or 6 MHz (low speed)
const HCFG_FSLSPCS_48MHZ: u32 = 1;
const HCFG_FSLSPCS_6MHZ: u32 = 2;
const HFIR_FULL_SPEED: u32 = 48_000;
const HFIR_LOW_SPEED: u32 = 6_000;

/// HPRT.PSPD value reported for a low-speed device
const PSPD_LOW: u32 = 2;

const HCINT_ALL: u32 = 0x7FF;

/// GRXSTSP.PKTSTS: IN data packet received
const PKTSTS_IN_DATA: u32 = 0b0010;

/// FIFO sizes in 32-bit words, 320 in total
const RX_FIFO_WORDS: u16 = 128;
const NPTX_FIFO_WORDS: u16 = 96;
const PTX_FIFO_WORDS: u16 = 64;

const CH_OUT: usize = 0;
const CH_IN: usize = 1;

/// Largest packet on a full-speed control or bulk endpoint
const MAX_PACKET: usize = 64;

const TRANSFER_TIMEOUT: Duration = Duration::from_millis(3000);
const HALT_TIMEOUT: Duration = Duration::from_millis(5);
const RESET_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy)]
enum EndpointType {
    Control = 0,
    Bulk = 2,
}

/// HCTSIZ.DPID
#[derive(Clone, Copy)]
enum Pid {
    Data0 = 0,
    Data1 = 2,
    Setup = 3,
}

impl From<DataToggle> for Pid {
    fn from(toggle: DataToggle) -> Self {
        match toggle {
            DataToggle::Data0 => Pid::Data0,
            DataToggle::Data1 => Pid::Data1,
        }
    }
}

/// The endpoint a packet is addressed to
#[derive(Clone, Copy)]
struct Endpoint {
    address: u8,
    number: u8,
    kind: EndpointType,
    max_packet_size: u16,
    speed: DeviceSpeed,
}

impl Endpoint {
    fn control(target: ControlTarget) -> Self {
        Self {
            address: target.address,
            number: 0,
            kind: EndpointType::Control,
            max_packet_size: target.max_packet_size,
            speed: target.speed,
        }
    }

    fn bulk(pipe: &BulkPipe) -> Self {
        Self {
            address: pipe.address,
            number: pipe.endpoint,
            kind: EndpointType::Bulk,
            max_packet_size: pipe.max_packet_size,
            speed: pipe.speed,
        }
    }

    fn packet_size(&self) -> usize {
        usize::from(self.max_packet_size).clamp(8, MAX_PACKET)
    }
}

/// How a packet ended when it did not fail
enum Handshake {
    Ack,
    Nak,
}

/// HPRT value for a read-modify-write: the write-1-to-clear bits are masked so
/// nothing is cleared by accident.
fn hprt_preserved() -> regs::Hprt {
    let mut hprt = OTG.hprt().read();
    hprt.set_pcdet(false);
    hprt.set_pena(false);
    hprt.set_penchng(false);
    hprt.set_pocchng(false);
    hprt
}

/// Spin until `done` holds or the deadline passes.
fn spin_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
    }
    true
}

/// Host driver for the OTG FS port of the STM32F4-Discovery.
pub struct OtgFsHost<'d> {
    _otg: Peri<'d, USB_OTG_FS>,
    _dm: Peri<'d, PA11>,
    _dp: Peri<'d, PA12>,
    vbus: Output<'d>,
    connected: bool,
}

impl<'d> OtgFsHost<'d> {
    /// Bring the OTG FS core up in host mode and power the port
    ///
    /// # Arguments
    /// * `peripherals` - OtgPeripherals struct with the core, data pins and VBUS switch
    ///
    /// # Returns
    /// A powered root port with no device connected yet
    pub fn new(peripherals: OtgPeripherals<'d>) -> Self {
        // VBUS stays off until the core is in host mode
        let vbus = Output::new(peripherals.vbus, Level::High, Speed::Low);

        rcc::enable_and_reset::<USB_OTG_FS>();

        // PA11/PA12 to the OTG_FS alternate function, very high speed
        let gpioa = pac::GPIOA;
        for pin in [DM_PIN, DP_PIN] {
            gpioa.afr(pin / 8).modify(|w| w.set_afr(pin % 8, AF_OTG_FS));
            gpioa.ospeedr().modify(|w| w.set_ospeedr(pin, Ospeedr::VERY_HIGH_SPEED));
            gpioa.moder().modify(|w| w.set_moder(pin, Moder::ALTERNATE));
        }

        let mut host = Self {
            _otg: peripherals.otg,
            _dm: peripherals.dm,
            _dp: peripherals.dp,
            vbus,
            connected: false,
        };
        host.init_core();
        host
    }

    fn init_core(&mut self) {
        OTG.gusbcfg().modify(|w| w.set_physel(true));
        self.core_reset();

        // Embedded PHY on, VBUS is driven by the board rather than sensed
        OTG.gccfg_v1().write(|w| {
            w.set_pwrdwn(true);
            w.set_novbussens(true);
        });
        OTG.gusbcfg().modify(|w| w.set_fhmod(true));
        block_for(Duration::from_millis(50));

        OTG.pcgcctl().write(|_| {});
        self.set_frame_timing(DeviceSpeed::Full);

        OTG.grxfsiz().write(|w| w.set_rxfd(RX_FIFO_WORDS));
        OTG.hnptxfsiz().write(|w| {
            w.set_sa(RX_FIFO_WORDS);
            w.set_fd(NPTX_FIFO_WORDS);
        });
        OTG.hptxfsiz().write(|w| {
            w.set_sa(RX_FIFO_WORDS + NPTX_FIFO_WORDS);
            w.set_fd(PTX_FIFO_WORDS);
        });
        self.flush_fifos();

        // Everything is polled from the status registers
        OTG.gintmsk().write(|_| {});
        OTG.gahbcfg().write(|w| w.set_gint(false));
        OTG.gintsts().write_value(regs::Gintsts(0xFFFF_FFFF));
        for ch in [CH_OUT, CH_IN] {
            OTG.hcint(ch).write_value(regs::Hcint(HCINT_ALL));
        }

        let mut hprt = hprt_preserved();
        hprt.set_ppwr(true);
        OTG.hprt().write_value(hprt);
        self.vbus.set_low();
        info!("OTG FS: host mode, port powered");
    }

    fn core_reset(&mut self) {
        let deadline = Instant::now() + RESET_TIMEOUT;
        if !spin_until(deadline, || OTG.grstctl().read().ahbidl()) {
            warn!("OTG FS: AHB not idle before core reset");
        }
        OTG.grstctl().write(|w| w.set_csrst(true));
        if !spin_until(deadline, || !OTG.grstctl().read().csrst()) {
            warn!("OTG FS: core reset did not complete");
        }
        block_for(Duration::from_micros(3));
    }

    fn flush_fifos(&mut self) {
        let deadline = Instant::now() + RESET_TIMEOUT;
        OTG.grstctl().write(|w| {
            w.set_txfflsh(true);
            w.set_txfnum(0x10);
        });
        spin_until(deadline, || !OTG.grstctl().read().txfflsh());
        OTG.grstctl().write(|w| w.set_rxfflsh(true));
        spin_until(deadline, || !OTG.grstctl().read().rxfflsh());
    }

    /// PHY clock select and frame interval for the attached device's speed.
    fn set_frame_timing(&mut self, speed: DeviceSpeed) {
        let (fslspcs, frame_interval) = match speed {
            DeviceSpeed::Low => (HCFG_FSLSPCS_6MHZ, HFIR_LOW_SPEED),
            DeviceSpeed::Full => (HCFG_FSLSPCS_48MHZ, HFIR_FULL_SPEED),
        };
        OTG.hcfg().write_value(regs::Hcfg(fslspcs));
        OTG.hfir().write_value(regs::Hfir(frame_interval));
    }

    fn port_connected(&self) -> bool {
        OTG.hprt().read().pcsts()
    }

    /// Program and enable a channel for one packet.
    fn start_channel(&mut self, ch: usize, endpoint: &Endpoint, is_in: bool, pid: Pid, size: usize) {
        OTG.hcint(ch).write_value(regs::Hcint(HCINT_ALL));
        // XFRSIZ[18:0], PKTCNT[28:19] = 1, DPID[30:29]
        OTG.hctsiz(ch)
            .write_value(regs::Hctsiz((size as u32 & 0x7_FFFF) | (1 << 19) | ((pid as u32) << 29)));

        // MPSIZ[10:0], EPNUM[14:11], EPTYP[19:18], MCNT[21:20] = 1, DAD[28:22]
        let mut hcchar = regs::Hcchar(
            u32::from(endpoint.max_packet_size & 0x7FF)
                | (u32::from(endpoint.number & 0x0F) << 11)
                | ((endpoint.kind as u32) << 18)
                | (1 << 20)
                | (u32::from(endpoint.address & 0x7F) << 22),
        );
        hcchar.set_epdir(is_in);
        hcchar.set_lsdev(endpoint.speed == DeviceSpeed::Low);
        hcchar.set_chena(true);
        OTG.hcchar(ch).write_value(hcchar);
    }

    /// Pop receive FIFO entries, copying IN data for `ch` into `buf`.
    /// Returns false if a packet did not fit.
    fn drain_rx(&mut self, ch: usize, buf: &mut [u8], received: &mut usize) -> bool {
        let mut fits = true;
        while OTG.gintsts().read().rxflvl() {
            // CHNUM[3:0], BCNT[14:4], PKTSTS[20:17]
            let status = OTG.grxstsp().read().0;
            let chnum = (status & 0x0F) as usize;
            let count = ((status >> 4) & 0x7FF) as usize;
            let pktsts = (status >> 17) & 0x0F;
            if pktsts != PKTSTS_IN_DATA || count == 0 {
                continue;
            }
            for offset in (0..count).step_by(4) {
                let word = OTG.fifo(0).read().data().to_le_bytes();
                if chnum != ch {
                    continue;
                }
                for (i, byte) in word.iter().enumerate().take(count - offset) {
                    match buf.get_mut(*received + offset + i) {
                        Some(slot) => *slot = *byte,
                        None => fits = false,
                    }
                }
            }
            if chnum == ch {
                *received += count;
            }
        }
        fits
    }

    /// Disable a channel that is still active and wait for it to halt.
    fn halt_channel(&mut self, ch: usize) {
        if OTG.hcchar(ch).read().chena() {
            OTG.hcchar(ch).modify(|w| {
                w.set_chdis(true);
                w.set_chena(true);
            });
            let deadline = Instant::now() + HALT_TIMEOUT;
            let mut discarded = 0;
            let halted = spin_until(deadline, || {
                self.drain_rx(ch, &mut [], &mut discarded);
                OTG.hcint(ch).read().chh()
            });
            if !halted {
                warn!("OTG FS: channel {} did not halt", ch);
            }
        }
        OTG.hcint(ch).write_value(regs::Hcint(HCINT_ALL));
    }

    /// Wait for the handshake of the packet in flight on `ch`.
    fn wait_packet(
        &mut self,
        ch: usize,
        deadline: Instant,
        buf: &mut [u8],
        received: &mut usize,
    ) -> Result<Handshake, TransferError> {
        loop {
            if !self.port_connected() {
                self.halt_channel(ch);
                return Err(TransferError::Disconnected);
            }
            let fits = self.drain_rx(ch, buf, received);
            let hcint = OTG.hcint(ch).read();
            let outcome = if !fits || hcint.bberr() {
                Some(Err(TransferError::DataOverrun))
            } else if hcint.xfrc() {
                Some(Ok(Handshake::Ack))
            } else if hcint.stall() {
                Some(Err(TransferError::Stall))
            } else if hcint.nak() {
                Some(Ok(Handshake::Nak))
            } else if hcint.txerr() || hcint.dterr() || hcint.frmor() {
                Some(Err(TransferError::Transaction))
            } else if Instant::now() > deadline {
                Some(Err(TransferError::Timeout))
            } else {
                None
            };
            if let Some(outcome) = outcome {
                self.halt_channel(ch);
                return outcome;
            }
        }
    }

    /// Send one OUT or SETUP packet, retrying while the device NAKs.
    fn out_packet(&mut self, endpoint: &Endpoint, pid: Pid, data: &[u8]) -> Result<(), TransferError> {
        let deadline = Instant::now() + TRANSFER_TIMEOUT;
        let words = data.len().div_ceil(4) as u32;
        loop {
            self.start_channel(CH_OUT, endpoint, false, pid, data.len());
            // NPTXFSAV[15:0], free words in the non-periodic TX FIFO
            if !spin_until(deadline, || OTG.hnptxsts().read().0 & 0xFFFF >= words) {
                self.halt_channel(CH_OUT);
                return Err(TransferError::Timeout);
            }
            for chunk in data.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                OTG.fifo(CH_OUT).write_value(regs::Fifo(u32::from_le_bytes(word)));
            }
            match self.wait_packet(CH_OUT, deadline, &mut [], &mut 0)? {
                Handshake::Ack => return Ok(()),
                Handshake::Nak => continue,
            }
        }
    }

    /// Receive one IN packet into `buf`, retrying while the device NAKs.
    fn in_packet(&mut self, endpoint: &Endpoint, pid: Pid, buf: &mut [u8]) -> Result<usize, TransferError> {
        let deadline = Instant::now() + TRANSFER_TIMEOUT;
        loop {
            let mut received = 0;
            self.start_channel(CH_IN, endpoint, true, pid, endpoint.packet_size());
            match self.wait_packet(CH_IN, deadline, buf, &mut received)? {
                Handshake::Ack => return Ok(received),
                Handshake::Nak => continue,
            }
        }
    }

    /// IN data stage of any length, packet by packet. Stops at a short packet.
    fn read_stage(&mut self, endpoint: &Endpoint, toggle: &mut DataToggle, buf: &mut [u8]) -> Result<usize, TransferError> {
        let size = endpoint.packet_size();
        let mut packet = [0u8; MAX_PACKET];
        let mut total = 0;
        loop {
            let len = self.in_packet(endpoint, Pid::from(*toggle), &mut packet[..size])?;
            toggle.flip();
            let dest = buf.get_mut(total..total + len).ok_or(TransferError::DataOverrun)?;
            dest.copy_from_slice(&packet[..len]);
            total += len;
            if len < size || total == buf.len() {
                return Ok(total);
            }
        }
    }

    /// OUT data stage, packet by packet.
    fn write_stage(&mut self, endpoint: &Endpoint, toggle: &mut DataToggle, data: &[u8]) -> Result<(), TransferError> {
        for chunk in data.chunks(endpoint.packet_size()) {
            self.out_packet(endpoint, Pid::from(*toggle), chunk)?;
            toggle.flip();
        }
        Ok(())
    }
}

impl HostDriver for OtgFsHost<'_> {
    fn poll_port(&mut self) -> PortEvent {
        let hprt = OTG.hprt().read();
        if hprt.pcdet() || hprt.penchng() || hprt.pocchng() {
            // Writing the change bits back clears them; PENA would disable the port
            let mut clear = hprt;
            clear.set_pena(false);
            OTG.hprt().write_value(clear);
        }
        if hprt.pocchng() {
            warn!("OTG FS: port overcurrent change");
        }
        if OTG.gintsts().read().discint() {
            OTG.gintsts().write(|w| w.set_discint(true));
        }

        match (hprt.pcsts(), self.connected) {
            (true, false) => {
                self.connected = true;
                PortEvent::Connected
            }
            (false, true) => {
                self.connected = false;
                self.flush_fifos();
                PortEvent::Disconnected
            }
            _ => PortEvent::None,
        }
    }

    fn reset_port(&mut self) -> Result<DeviceSpeed, TransferError> {
        if !self.port_connected() {
            return Err(TransferError::Disconnected);
        }
        let mut hprt = hprt_preserved();
        hprt.set_prst(true);
        OTG.hprt().write_value(hprt);
        block_for(Duration::from_millis(12));
        hprt.set_prst(false);
        OTG.hprt().write_value(hprt);

        let deadline = Instant::now() + RESET_TIMEOUT;
        if !spin_until(deadline, || OTG.hprt().read().pena()) {
            return Err(if self.port_connected() {
                TransferError::Timeout
            } else {
                TransferError::Disconnected
            });
        }

        // PSPD[18:17]
        let speed = match (OTG.hprt().read().0 >> 17) & 0b11 {
            PSPD_LOW => DeviceSpeed::Low,
            _ => DeviceSpeed::Full,
        };
        self.set_frame_timing(speed);
        // Reset recovery
        block_for(Duration::from_millis(20));
        Ok(speed)
    }

    fn control_in(&mut self, target: ControlTarget, setup: &SetupPacket, buf: &mut [u8]) -> Result<usize, TransferError> {
        let endpoint = Endpoint::control(target);
        self.out_packet(&endpoint, Pid::Setup, &setup.to_bytes())?;
        let mut toggle = DataToggle::Data1;
        let len = if buf.is_empty() {
            0
        } else {
            self.read_stage(&endpoint, &mut toggle, buf)?
        };
        // Status stage: zero-length OUT, always DATA1
        self.out_packet(&endpoint, Pid::Data1, &[])?;
        Ok(len)
    }

    fn control_out(&mut self, target: ControlTarget, setup: &SetupPacket, data: &[u8]) -> Result<(), TransferError> {
        let endpoint = Endpoint::control(target);
        self.out_packet(&endpoint, Pid::Setup, &setup.to_bytes())?;
        let mut toggle = DataToggle::Data1;
        self.write_stage(&endpoint, &mut toggle, data)?;
        // Status stage: zero-length IN, always DATA1
        let mut status = [0u8; MAX_PACKET];
        self.in_packet(&endpoint, Pid::Data1, &mut status[..endpoint.packet_size()])?;
        Ok(())
    }

    fn bulk_in(&mut self, pipe: &mut BulkPipe, buf: &mut [u8]) -> Result<usize, TransferError> {
        let endpoint = Endpoint::bulk(pipe);
        self.read_stage(&endpoint, &mut pipe.toggle, buf)
    }

    fn bulk_out(&mut self, pipe: &mut BulkPipe, data: &[u8]) -> Result<(), TransferError> {
        let endpoint = Endpoint::bulk(pipe);
        if data.is_empty() {
            self.out_packet(&endpoint, Pid::from(pipe.toggle), &[])?;
            pipe.toggle.flip();
            return Ok(());
        }
        self.write_stage(&endpoint, &mut pipe.toggle, data)
    }

    fn wait_ms(&mut self, ms: u32) {
        block_for(Duration::from_millis(u64::from(ms)));
    }
}
