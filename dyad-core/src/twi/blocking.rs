//! Blocking (polling) driver
//!
//! Runs the shared transition table in a tight loop until the command
//! completes. No queue, no interrupts, no futures: payloads are plain
//! slices, and results come back as `Result` values. The timed
//! single-receive path is the one place a clock enters the engine.

use core::cell::{Cell, RefCell};

use dyad_hal::clock::Clock;
use dyad_hal::twi::{BusConfig, Direction, TwiBus};
use embedded_hal::i2c::{ErrorType, I2c, Operation};

use crate::error::Error;
use crate::future::Payload;
use crate::twi::machine::{Machine, OpState, StepResult};
use crate::twi::TwiConfig;

/// Slice-backed payload for the blocking convenience API.
struct SlicePayload<'a> {
    tx: Cell<&'a [u8]>,
    rx: RefCell<(&'a mut [u8], usize)>,
}

impl<'a> SlicePayload<'a> {
    fn sending(bytes: &'a [u8]) -> Self {
        Self {
            tx: Cell::new(bytes),
            rx: RefCell::new((&mut [], 0)),
        }
    }

    fn receiving(buf: &'a mut [u8]) -> Self {
        Self {
            tx: Cell::new(&[]),
            rx: RefCell::new((buf, 0)),
        }
    }
}

impl Payload for SlicePayload<'_> {
    fn push(&self, byte: u8) -> bool {
        let mut rx = self.rx.borrow_mut();
        let (buf, pos) = &mut *rx;
        if *pos < buf.len() {
            buf[*pos] = byte;
            *pos += 1;
            true
        } else {
            false
        }
    }

    fn push_all(&self, bytes: &[u8]) -> bool {
        let mut rx = self.rx.borrow_mut();
        let (buf, pos) = &mut *rx;
        if *pos + bytes.len() > buf.len() {
            return false;
        }
        buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
        *pos += bytes.len();
        true
    }

    fn pull(&self) -> Option<u8> {
        let bytes = self.tx.get();
        let (&first, rest) = bytes.split_first()?;
        self.tx.set(rest);
        Some(first)
    }

    fn pull_into(&self, buf: &mut [u8]) -> bool {
        let bytes = self.tx.get();
        if bytes.len() < buf.len() {
            return false;
        }
        let (head, rest) = bytes.split_at(buf.len());
        buf.copy_from_slice(head);
        self.tx.set(rest);
        true
    }

    fn fail(&self, _error: Error) -> bool {
        // The blocking driver reports errors through its Result.
        false
    }

    fn finish(&self) -> bool {
        true
    }
}

/// Blocking two-wire driver.
pub struct BlockingTwi<B> {
    bus: B,
    machine: Machine,
    bus_config: BusConfig,
}

impl<B: TwiBus> BlockingTwi<B> {
    pub const fn new(bus: B, config: TwiConfig) -> Self {
        Self {
            bus,
            machine: Machine::new(config.debug_hook, config.status_hook),
            bus_config: config.bus,
        }
    }

    /// Enable the peripheral.
    pub fn begin(&mut self) {
        self.bus.begin(self.bus_config);
    }

    /// Disable the peripheral.
    pub fn end(&mut self) {
        self.bus.end();
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn run(
        &mut self,
        op: &mut OpState,
        payload: &dyn Payload,
        more: bool,
        deadline: Option<(&dyn Clock, u64)>,
    ) -> Result<(), Error> {
        self.machine.begin_op(&mut self.bus, op);
        loop {
            match self.machine.step(&mut self.bus, op, payload, more) {
                StepResult::Pending => {
                    if let Some((clock, limit)) = deadline {
                        if clock.now_ms() >= limit {
                            self.machine.release(&mut self.bus);
                            return Err(Error::Protocol);
                        }
                    }
                    core::hint::spin_loop();
                }
                StepResult::Done => return Ok(()),
                StepResult::Failed(error) => return Err(error),
            }
        }
    }

    /// Write `bytes` to `target`, then STOP.
    pub fn write(&mut self, target: u8, bytes: &[u8]) -> Result<(), Error> {
        let payload = SlicePayload::sending(bytes);
        let mut op = OpState {
            direction: Direction::Write,
            target,
            remaining: bytes.len(),
            stop: true,
            finish: false,
            end_of_chain: false,
        };
        self.run(&mut op, &payload, false, None)
    }

    /// Fill `buf` from `target`, then STOP.
    pub fn read(&mut self, target: u8, buf: &mut [u8]) -> Result<(), Error> {
        let remaining = buf.len();
        let payload = SlicePayload::receiving(buf);
        let mut op = OpState {
            direction: Direction::Read,
            target,
            remaining,
            stop: true,
            finish: false,
            end_of_chain: false,
        };
        self.run(&mut op, &payload, false, None)
    }

    /// Write then read in one transaction: the read repeat-starts, the
    /// bus is never released in between.
    pub fn write_read(&mut self, target: u8, bytes: &[u8], buf: &mut [u8]) -> Result<(), Error> {
        let tx = SlicePayload::sending(bytes);
        let mut write_op = OpState {
            direction: Direction::Write,
            target,
            remaining: bytes.len(),
            stop: false,
            finish: false,
            end_of_chain: false,
        };
        self.run(&mut write_op, &tx, true, None)?;

        let remaining = buf.len();
        let rx = SlicePayload::receiving(buf);
        let mut read_op = OpState {
            direction: Direction::Read,
            target,
            remaining,
            stop: true,
            finish: false,
            end_of_chain: false,
        };
        self.run(&mut read_op, &rx, false, None)
    }

    /// Address-only write: true if a target acknowledges `target`.
    pub fn probe(&mut self, target: u8) -> bool {
        self.write(target, &[]).is_ok()
    }

    /// Probe the whole 7-bit address range, calling `visit` for every
    /// responding target.
    pub fn scan(&mut self, mut visit: impl FnMut(u8)) {
        for target in 0x08..=0x77 {
            if self.probe(target) {
                visit(target);
            }
        }
    }

    /// Receive a single byte, optionally bounded by `timeout_ms` on
    /// `clock`. An expired timeout forces a STOP and reports
    /// `Error::Protocol`.
    pub fn recv_one(
        &mut self,
        target: u8,
        timeout_ms: Option<u64>,
        clock: &dyn Clock,
    ) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        let limit = timeout_ms.map(|t| clock.now_ms().saturating_add(t));
        {
            let payload = SlicePayload::receiving(&mut byte);
            let mut op = OpState {
                direction: Direction::Read,
                target,
                remaining: 1,
                stop: true,
                finish: false,
                end_of_chain: false,
            };
            self.run(&mut op, &payload, false, limit.map(|l| (clock, l)))?;
        }
        Ok(byte[0])
    }
}

impl<B: TwiBus> ErrorType for BlockingTwi<B> {
    type Error = Error;
}

impl<B: TwiBus> I2c for BlockingTwi<B> {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let count = operations.len();
        for (i, operation) in operations.iter_mut().enumerate() {
            let more = i + 1 < count;
            match operation {
                Operation::Write(bytes) => {
                    let mut op = OpState {
                        direction: Direction::Write,
                        target: address,
                        remaining: bytes.len(),
                        stop: !more,
                        finish: false,
                        end_of_chain: false,
                    };
                    let payload = SlicePayload::sending(bytes);
                    self.run(&mut op, &payload, more, None)?;
                }
                Operation::Read(buf) => {
                    let mut op = OpState {
                        direction: Direction::Read,
                        target: address,
                        remaining: buf.len(),
                        stop: !more,
                        finish: false,
                        end_of_chain: false,
                    };
                    let payload = SlicePayload::receiving(buf);
                    self.run(&mut op, &payload, more, None)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twi::DebugStep;
    use dyad_hal::twi::TwiStatus;
    use dyad_hal_sim::{BusEvent, SimBus, SimClock};

    fn engine_with(setup: impl FnOnce(&mut SimBus)) -> BlockingTwi<SimBus> {
        let mut bus = SimBus::new();
        setup(&mut bus);
        let mut twi = BlockingTwi::new(bus, TwiConfig::new());
        twi.begin();
        twi
    }

    #[test]
    fn write_produces_the_exact_wire_sequence() {
        let mut twi = engine_with(|bus| bus.add_device(0x50));
        twi.write(0x50, &[0x10, 0x20]).unwrap();

        assert_eq!(
            twi.bus().events(),
            &[
                BusEvent::Begin,
                BusEvent::Start,
                BusEvent::Sla {
                    target: 0x50,
                    direction: Direction::Write,
                    ack: true
                },
                BusEvent::Write {
                    byte: 0x10,
                    ack: true
                },
                BusEvent::Write {
                    byte: 0x20,
                    ack: true
                },
                BusEvent::Stop,
            ]
        );
        assert_eq!(twi.bus().written(0x50), &[0x10, 0x20]);
    }

    #[test]
    fn read_nacks_only_the_final_byte() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x3C);
            bus.load_replies(0x3C, &[0xDE, 0xAD]);
        });
        let mut buf = [0u8; 2];
        twi.read(0x3C, &mut buf).unwrap();

        assert_eq!(buf, [0xDE, 0xAD]);
        let events = twi.bus().events();
        assert!(events.contains(&BusEvent::Read {
            byte: 0xDE,
            last: false
        }));
        assert!(events.contains(&BusEvent::Read {
            byte: 0xAD,
            last: true
        }));
    }

    #[test]
    fn write_read_never_releases_the_bus_in_between() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x68);
            bus.load_replies(0x68, &[0x7F]);
        });
        let mut buf = [0u8; 1];
        twi.write_read(0x68, &[0x75], &mut buf).unwrap();
        assert_eq!(buf, [0x7F]);

        let events = twi.bus().events();
        let repeat = events
            .iter()
            .position(|e| *e == BusEvent::RepeatStart)
            .expect("read must repeat-start");
        assert!(
            !events[..repeat].contains(&BusEvent::Stop),
            "bus released before the chained read"
        );
        assert_eq!(events.last(), Some(&BusEvent::Stop));
    }

    #[test]
    fn missing_target_reports_protocol_error() {
        let mut twi = engine_with(|_| {});
        assert_eq!(twi.write(0x29, &[1]), Err(Error::Protocol));
        // The failed command must still have released the bus.
        assert_eq!(twi.bus().events().last(), Some(&BusEvent::Stop));
    }

    #[test]
    fn early_write_nack_aborts_late_write_nack_is_tolerated() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x50);
            bus.nack_write_at(0x50, 0);
        });
        assert_eq!(twi.write(0x50, &[1, 2]), Err(Error::Protocol));

        let mut twi = engine_with(|bus| {
            bus.add_device(0x50);
            bus.nack_write_at(0x50, 1);
        });
        assert_eq!(twi.write(0x50, &[1, 2]), Ok(()));
    }

    #[test]
    fn probe_and_scan_find_only_present_targets() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x21);
            bus.add_device(0x48);
        });
        assert!(twi.probe(0x21));
        assert!(!twi.probe(0x22));

        let mut found = heapless::Vec::<u8, 8>::new();
        twi.scan(|addr| {
            let _ = found.push(addr);
        });
        assert_eq!(&found[..], &[0x21, 0x48]);
    }

    #[test]
    fn recv_one_returns_the_byte() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x17);
            bus.load_replies(0x17, &[0x99]);
        });
        let clock = SimClock::new();
        assert_eq!(twi.recv_one(0x17, None, &clock), Ok(0x99));
    }

    #[test]
    fn recv_one_times_out_on_a_stalled_bus() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x17);
            bus.stall_reads(true);
        });
        let clock = SimClock::advancing(10);
        assert_eq!(twi.recv_one(0x17, Some(50), &clock), Err(Error::Protocol));
        // The timeout path must force a STOP.
        assert_eq!(twi.bus().events().last(), Some(&BusEvent::Stop));
    }

    #[test]
    fn ecosystem_trait_write_read_works() {
        let mut twi = engine_with(|bus| {
            bus.add_device(0x76);
            bus.load_replies(0x76, &[0x58]);
        });
        let mut id = [0u8; 1];
        I2c::write_read(&mut twi, 0x76, &[0xD0], &mut id).unwrap();
        assert_eq!(id, [0x58]);
        assert_eq!(twi.bus().written(0x76), &[0xD0]);
    }

    mod hooks {
        use super::*;
        use std::sync::Mutex;

        static STEPS: Mutex<Vec<(DebugStep, u8)>> = Mutex::new(Vec::new());
        static CHECKS: Mutex<Vec<(TwiStatus, TwiStatus)>> = Mutex::new(Vec::new());

        fn debug_hook(step: DebugStep, byte: u8) {
            STEPS.lock().unwrap().push((step, byte));
        }

        fn status_hook(expected: TwiStatus, actual: TwiStatus) {
            CHECKS.lock().unwrap().push((expected, actual));
        }

        #[test]
        fn hooks_observe_every_micro_step() {
            let mut bus = SimBus::new();
            bus.add_device(0x50);
            let config = TwiConfig {
                debug_hook: Some(debug_hook),
                status_hook: Some(status_hook),
                ..TwiConfig::new()
            };
            let mut twi = BlockingTwi::new(bus, config);
            twi.begin();
            twi.write(0x50, &[0xAB]).unwrap();

            let steps: Vec<(DebugStep, u8)> = STEPS.lock().unwrap().clone();
            assert_eq!(
                steps,
                vec![
                    (DebugStep::Start, 0),
                    (DebugStep::SlaW, 0x50 << 1),
                    (DebugStep::Send, 0xAB),
                    (DebugStep::SendOk, 0),
                    (DebugStep::Stop, 0),
                ]
            );

            let checks = CHECKS.lock().unwrap().clone();
            assert!(checks
                .iter()
                .all(|(expected, actual)| expected == actual));
        }
    }
}
