//! Scriptable bus peripheral
//!
//! [`SimBus`] models a two-wire bus with a handful of target devices.
//! Each device can be loaded with reply bytes for reads and scheduled
//! to NACK a specific write byte; every micro-operation is appended to
//! a bounded event log so tests can assert the exact wire sequence.

use dyad_hal::twi::{BusConfig, Direction, TwiBus, TwiStatus};
use heapless::Vec;

/// Maximum simulated target devices on one bus
pub const MAX_DEVICES: usize = 4;

/// Maximum logged bus events (older events are kept, overflow dropped)
pub const MAX_EVENTS: usize = 64;

/// Per-device payload capacity (replies and captured writes)
const MAX_BYTES: usize = 32;

/// One logged bus micro-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// Peripheral enabled
    Begin,
    /// Peripheral disabled
    End,
    /// START condition
    Start,
    /// Repeated START condition
    RepeatStart,
    /// Address byte with direction and the device's answer
    Sla {
        target: u8,
        direction: Direction,
        ack: bool,
    },
    /// Data byte written to the target and its answer
    Write { byte: u8, ack: bool },
    /// Data byte read from the target, with the controller's ack bit
    Read { byte: u8, last: bool },
    /// STOP condition
    Stop,
}

#[derive(Debug)]
struct Device {
    addr: u8,
    replies: Vec<u8, MAX_BYTES>,
    reply_pos: usize,
    writes: Vec<u8, MAX_BYTES>,
    nack_write_at: Option<usize>,
}

impl Device {
    fn new(addr: u8) -> Self {
        Self {
            addr,
            replies: Vec::new(),
            reply_pos: 0,
            writes: Vec::new(),
            nack_write_at: None,
        }
    }

    fn next_reply(&mut self) -> u8 {
        // A target with nothing to say leaves SDA released: all ones.
        let byte = self.replies.get(self.reply_pos).copied().unwrap_or(0xFF);
        self.reply_pos += 1;
        byte
    }
}

/// Simulated two-wire bus peripheral.
#[derive(Debug)]
pub struct SimBus {
    devices: Vec<Device, MAX_DEVICES>,
    events: Vec<BusEvent, MAX_EVENTS>,
    status: TwiStatus,
    data: u8,
    stall_reads: bool,
    current: Option<usize>,
    config: BusConfig,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            events: Vec::new(),
            status: TwiStatus::Idle,
            data: 0,
            stall_reads: false,
            current: None,
            config: BusConfig::STANDARD,
        }
    }

    /// Attach a target device at `addr`. Unknown addresses NACK.
    pub fn add_device(&mut self, addr: u8) {
        if self.find(addr).is_none() {
            let _ = self.devices.push(Device::new(addr));
        }
    }

    /// Queue bytes the device at `addr` will return to reads.
    pub fn load_replies(&mut self, addr: u8, bytes: &[u8]) {
        if let Some(i) = self.find(addr) {
            for &b in bytes {
                let _ = self.devices[i].replies.push(b);
            }
        }
    }

    /// Make the device at `addr` NACK its `index`-th data byte (0-based).
    pub fn nack_write_at(&mut self, addr: u8, index: usize) {
        if let Some(i) = self.find(addr) {
            self.devices[i].nack_write_at = Some(index);
        }
    }

    /// Stall all reads: `receive_byte` reports [`TwiStatus::Busy`]
    /// forever. Used to exercise timeout paths.
    pub fn stall_reads(&mut self, on: bool) {
        self.stall_reads = on;
    }

    /// Data bytes the device at `addr` has received so far.
    pub fn written(&self, addr: u8) -> &[u8] {
        match self.find(addr) {
            Some(i) => &self.devices[i].writes,
            None => &[],
        }
    }

    /// The logged wire sequence.
    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// The bus configuration the engine enabled the peripheral with.
    pub fn config(&self) -> BusConfig {
        self.config
    }

    fn find(&self, addr: u8) -> Option<usize> {
        self.devices.iter().position(|d| d.addr == addr)
    }

    fn log(&mut self, event: BusEvent) {
        let _ = self.events.push(event);
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TwiBus for SimBus {
    fn begin(&mut self, config: BusConfig) {
        self.config = config;
        self.status = TwiStatus::Idle;
        self.log(BusEvent::Begin);
    }

    fn end(&mut self) {
        self.status = TwiStatus::Idle;
        self.current = None;
        self.log(BusEvent::End);
    }

    fn raise_start(&mut self) {
        self.log(BusEvent::Start);
        self.status = TwiStatus::Start;
    }

    fn raise_repeat_start(&mut self) {
        self.log(BusEvent::RepeatStart);
        self.status = TwiStatus::RepeatStart;
    }

    fn send_address(&mut self, target: u8, direction: Direction) {
        let found = self.find(target);
        let ack = found.is_some();
        self.current = found;
        self.log(BusEvent::Sla {
            target,
            direction,
            ack,
        });
        self.status = if ack {
            TwiStatus::SlaAck
        } else {
            TwiStatus::SlaNack
        };
    }

    fn send_byte(&mut self, byte: u8) {
        let Some(i) = self.current else {
            self.log(BusEvent::Write { byte, ack: false });
            self.status = TwiStatus::BusError;
            return;
        };
        let device = &mut self.devices[i];
        let index = device.writes.len();
        let _ = device.writes.push(byte);
        let ack = device.nack_write_at != Some(index);
        self.log(BusEvent::Write { byte, ack });
        self.status = if ack {
            TwiStatus::DataAck
        } else {
            TwiStatus::DataNack
        };
    }

    fn receive_byte(&mut self, last: bool) {
        if self.stall_reads {
            self.status = TwiStatus::Busy;
            return;
        }
        let byte = match self.current {
            Some(i) => self.devices[i].next_reply(),
            None => 0xFF,
        };
        self.data = byte;
        self.log(BusEvent::Read { byte, last });
        // Reception completes together with the controller's ack bit:
        // ACK for intermediate bytes, NACK for the final one.
        self.status = if last {
            TwiStatus::DataNack
        } else {
            TwiStatus::DataAck
        };
    }

    fn raise_stop(&mut self) {
        self.log(BusEvent::Stop);
        self.status = TwiStatus::Idle;
        self.current = None;
    }

    fn status(&self) -> TwiStatus {
        self.status
    }

    fn data(&self) -> u8 {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address_nacks() {
        let mut bus = SimBus::new();
        bus.raise_start();
        bus.send_address(0x50, Direction::Write);
        assert_eq!(bus.status(), TwiStatus::SlaNack);
    }

    #[test]
    fn device_captures_writes_and_serves_replies() {
        let mut bus = SimBus::new();
        bus.add_device(0x50);
        bus.load_replies(0x50, &[0xAA, 0xBB]);

        bus.raise_start();
        bus.send_address(0x50, Direction::Write);
        assert_eq!(bus.status(), TwiStatus::SlaAck);
        bus.send_byte(0x10);
        assert_eq!(bus.status(), TwiStatus::DataAck);

        bus.receive_byte(false);
        assert_eq!(bus.data(), 0xAA);
        assert_eq!(bus.status(), TwiStatus::DataAck);
        bus.receive_byte(true);
        assert_eq!(bus.data(), 0xBB);
        assert_eq!(bus.status(), TwiStatus::DataNack);

        bus.raise_stop();
        assert_eq!(bus.written(0x50), &[0x10]);
        assert_eq!(
            bus.events().last(),
            Some(&BusEvent::Stop),
        );
    }

    #[test]
    fn scheduled_write_nack_fires_once() {
        let mut bus = SimBus::new();
        bus.add_device(0x21);
        bus.nack_write_at(0x21, 1);

        bus.raise_start();
        bus.send_address(0x21, Direction::Write);
        bus.send_byte(1);
        assert_eq!(bus.status(), TwiStatus::DataAck);
        bus.send_byte(2);
        assert_eq!(bus.status(), TwiStatus::DataNack);
    }
}
