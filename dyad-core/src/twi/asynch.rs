//! Asynchronous (interrupt-stepped) driver
//!
//! Commands are staged and committed from ordinary code; the hardware
//! completion interrupt drives [`AsyncTwi::on_interrupt`], which
//! advances the shared transition table one micro-step per event.
//! Futures are addressed exclusively through their registry ids - the
//! engine never caches a future address across interrupts, so futures
//! may relocate (via `adopt`) while their commands are queued or even
//! in flight.
//!
//! All engine state (bus, queue, machine, active command) lives behind
//! one critical-section mutex: `on_interrupt` and the main-line
//! stage/commit calls serialize against each other, and each protected
//! region initiates at most one bus micro-operation.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use dyad_hal::twi::{BusConfig, TwiBus};

use crate::error::Error;
use crate::future::manager::FutureRegistry;
use crate::future::Payload;
use crate::lifecycle::SlotId;
use crate::twi::command::Command;
use crate::twi::machine::{Machine, OpState, StepResult};
use crate::twi::queue::CommandQueue;
use crate::twi::{RecoveryPolicy, TwiConfig};

/// Payload adapter that resolves its future on every access.
struct Bound<'r> {
    futures: &'r dyn FutureRegistry,
    id: SlotId,
}

impl Payload for Bound<'_> {
    fn push(&self, byte: u8) -> bool {
        let mut ok = false;
        self.futures.resolve(self.id, &mut |p| ok = p.push(byte));
        ok
    }

    fn push_all(&self, bytes: &[u8]) -> bool {
        let mut ok = false;
        self.futures.resolve(self.id, &mut |p| ok = p.push_all(bytes));
        ok
    }

    fn pull(&self) -> Option<u8> {
        let mut byte = None;
        self.futures.resolve(self.id, &mut |p| byte = p.pull());
        byte
    }

    fn pull_into(&self, buf: &mut [u8]) -> bool {
        let mut ok = false;
        self.futures
            .resolve(self.id, &mut |p| ok = p.pull_into(buf));
        ok
    }

    fn fail(&self, error: Error) -> bool {
        let mut ok = false;
        self.futures.resolve(self.id, &mut |p| ok = p.fail(error));
        ok
    }

    fn finish(&self) -> bool {
        let mut ok = false;
        self.futures.resolve(self.id, &mut |p| ok = p.finish());
        ok
    }
}

struct Inner<B, const N: usize> {
    bus: B,
    queue: CommandQueue<N>,
    machine: Machine,
    active: Option<(OpState, SlotId)>,
}

/// Asynchronous two-wire driver with an `N`-command queue.
pub struct AsyncTwi<B, const N: usize> {
    futures: &'static dyn FutureRegistry,
    recovery: RecoveryPolicy,
    bus_config: BusConfig,
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<B, N>>>,
}

impl<B: TwiBus, const N: usize> AsyncTwi<B, N> {
    pub const fn new(
        bus: B,
        futures: &'static dyn FutureRegistry,
        config: TwiConfig,
    ) -> Self {
        Self {
            futures,
            recovery: config.recovery,
            bus_config: config.bus,
            inner: Mutex::new(RefCell::new(Inner {
                bus,
                queue: CommandQueue::new(),
                machine: Machine::new(config.debug_hook, config.status_hook),
                active: None,
            })),
        }
    }

    /// Enable the peripheral.
    pub fn begin(&self) {
        let config = self.bus_config;
        self.inner.lock(|cell| cell.borrow_mut().bus.begin(config));
    }

    /// Disable the peripheral.
    pub fn end(&self) {
        self.inner.lock(|cell| cell.borrow_mut().bus.end());
    }

    /// Stage one command for the next commit. Staged commands are
    /// invisible to the engine until [`AsyncTwi::commit`] publishes
    /// them.
    pub fn push(&self, command: Command) -> Result<(), Error> {
        self.inner
            .lock(|cell| cell.borrow_mut().queue.stage(command))
    }

    /// Discard all staged commands.
    pub fn rollback(&self) -> usize {
        self.inner.lock(|cell| cell.borrow_mut().queue.rollback())
    }

    /// Publish the staged commands as one transaction and start the
    /// engine if it is idle. Returns how many commands became visible.
    pub fn commit(&self) -> usize {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let committed = inner.queue.commit();
            if committed > 0 && inner.active.is_none() {
                Self::launch(&mut inner);
            }
            committed
        })
    }

    /// Advance the engine by one micro-step. Call from the bus
    /// peripheral's completion interrupt handler.
    pub fn on_interrupt(&self) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            self.step_locked(&mut inner);
        });
    }

    /// True when nothing is in flight and nothing is committed.
    pub fn is_idle(&self) -> bool {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            inner.active.is_none() && inner.queue.is_empty()
        })
    }

    /// Committed commands still waiting behind the active one.
    pub fn pending(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().queue.len())
    }

    /// Run `f` on the bus peripheral, inside the critical section.
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut().bus))
    }

    fn step_locked(&self, inner: &mut Inner<B, N>) {
        let (result, failed) = {
            let Inner {
                bus,
                queue,
                machine,
                active,
            } = inner;
            let Some((op, id)) = active.as_mut() else {
                return;
            };
            let payload = Bound {
                futures: self.futures,
                id: *id,
            };
            let more = !queue.is_empty();
            (machine.step(bus, op, &payload, more), *id)
        };
        match result {
            StepResult::Pending => {}
            StepResult::Done => {
                inner.active = None;
                Self::launch(inner);
            }
            StepResult::Failed(_) => {
                match self.recovery {
                    RecoveryPolicy::ClearAll => inner.queue.clear(),
                    RecoveryPolicy::ClearTransaction => {
                        inner.queue.purge(failed);
                    }
                }
                inner.active = None;
                Self::launch(inner);
            }
        }
    }

    fn launch(inner: &mut Inner<B, N>) {
        if let Some(command) = inner.queue.pop() {
            let op = OpState::of(&command);
            inner.machine.begin_op(&mut inner.bus, &op);
            inner.active = Some((op, command.future));
        } else if inner.machine.bus_open() {
            // A drained queue must never leave the bus held.
            inner.machine.release(&mut inner.bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::manager::FutureManager;
    use crate::future::{Future, Status};
    use dyad_hal_sim::{BusEvent, SimBus};

    fn sim_with(setup: impl FnOnce(&mut SimBus)) -> SimBus {
        let mut bus = SimBus::new();
        setup(&mut bus);
        bus
    }

    fn run_to_idle<const N: usize>(twi: &AsyncTwi<SimBus, N>) {
        for _ in 0..100 {
            if twi.is_idle() {
                return;
            }
            twi.on_interrupt();
        }
        panic!("engine did not go idle");
    }

    #[test]
    fn nothing_runs_before_commit() {
        static MGR: FutureManager<4> = FutureManager::new();
        let fut = Future::<0, 1>::with_input([0x42]);
        fut.register(&MGR).unwrap();

        let bus = sim_with(|bus| bus.add_device(0x50));
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::write(0x50, 1, fut.id().unwrap()).with_finish())
            .unwrap();
        assert!(twi.is_idle());
        twi.on_interrupt();
        assert!(twi.with_bus(|bus| bus.written(0x50).is_empty()));

        assert_eq!(twi.commit(), 1);
        run_to_idle(&twi);
        assert_eq!(fut.status(), Status::Ready);
        assert!(twi.with_bus(|bus| bus.written(0x50) == &[0x42]));
    }

    #[test]
    fn chained_commands_run_in_order_and_ready_arrives_with_the_last_byte() {
        static MGR: FutureManager<4> = FutureManager::new();
        let fa = Future::<0, 1>::with_input([0x11]);
        let fb = Future::<0, 1>::with_input([0x22]);
        let fr = Future::<2>::new();
        fa.register(&MGR).unwrap();
        fb.register(&MGR).unwrap();
        fr.register(&MGR).unwrap();

        let bus = sim_with(|bus| {
            bus.add_device(0x50);
            bus.load_replies(0x50, &[0xAA, 0xBB]);
        });
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::write(0x50, 1, fa.id().unwrap()).with_finish())
            .unwrap();
        twi.push(Command::write(0x50, 1, fb.id().unwrap()).with_finish())
            .unwrap();
        twi.push(Command::read(0x50, 2, fr.id().unwrap())).unwrap();
        assert_eq!(twi.commit(), 3);

        for _ in 0..100 {
            if twi.is_idle() {
                break;
            }
            twi.on_interrupt();
            // The read future may only become Ready once the final
            // byte is on the wire.
            if fr.status() == Status::Ready {
                let has_last = twi.with_bus(|bus| {
                    bus.events().contains(&BusEvent::Read {
                        byte: 0xBB,
                        last: true,
                    })
                });
                assert!(has_last);
            }
        }
        assert!(twi.is_idle());

        assert_eq!(fa.status(), Status::Ready);
        assert_eq!(fb.status(), Status::Ready);
        let mut out = [0u8; 2];
        assert!(fr.get(&mut out));
        assert_eq!(out, [0xAA, 0xBB]);

        // Program order on the wire, one transaction, one STOP at the
        // very end - chained commands never release the bus between
        // each other.
        twi.with_bus(|bus| {
            let events = bus.events();
            assert_eq!(bus.written(0x50), &[0x11, 0x22]);
            let stops: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| **e == BusEvent::Stop)
                .map(|(i, _)| i)
                .collect();
            assert_eq!(stops, vec![events.len() - 1]);
            let repeats = events
                .iter()
                .filter(|e| **e == BusEvent::RepeatStart)
                .count();
            assert_eq!(repeats, 2);
        });
    }

    #[test]
    fn clear_all_policy_empties_the_queue_on_failure() {
        static MGR: FutureManager<4> = FutureManager::new();
        let fa = Future::<0, 2>::with_input([1, 2]);
        let fb = Future::<0, 1>::with_input([9]);
        fa.register(&MGR).unwrap();
        fb.register(&MGR).unwrap();

        let bus = sim_with(|bus| {
            bus.add_device(0x50);
            bus.add_device(0x51);
            // NACK the first data byte: non-last, so the write aborts.
            bus.nack_write_at(0x50, 0);
        });
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::write(0x50, 2, fa.id().unwrap())).unwrap();
        twi.push(Command::write(0x51, 1, fb.id().unwrap()).with_finish())
            .unwrap();
        twi.commit();
        run_to_idle(&twi);

        assert_eq!(fa.status(), Status::Error);
        assert_eq!(fa.error(), Some(Error::Protocol));
        // The unrelated command was swept away with everything else.
        assert_eq!(fb.status(), Status::NotReady);
        assert_eq!(twi.pending(), 0);
        assert!(twi.with_bus(|bus| bus.written(0x51).is_empty()));
    }

    #[test]
    fn clear_transaction_policy_keeps_unrelated_commands() {
        static MGR: FutureManager<4> = FutureManager::new();
        let fa = Future::<0, 2>::with_input([1, 2]);
        let fb = Future::<0, 1>::with_input([9]);
        fa.register(&MGR).unwrap();
        fb.register(&MGR).unwrap();

        let bus = sim_with(|bus| {
            bus.add_device(0x50);
            bus.add_device(0x51);
            bus.nack_write_at(0x50, 0);
        });
        let config = TwiConfig {
            recovery: RecoveryPolicy::ClearTransaction,
            ..TwiConfig::new()
        };
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, config);
        twi.begin();

        twi.push(Command::write(0x50, 2, fa.id().unwrap())).unwrap();
        twi.push(Command::write(0x51, 1, fb.id().unwrap()).with_finish())
            .unwrap();
        twi.commit();
        run_to_idle(&twi);

        assert_eq!(fa.error(), Some(Error::Protocol));
        // The command on the other future survived and ran.
        assert_eq!(fb.status(), Status::Ready);
        assert!(twi.with_bus(|bus| bus.written(0x51) == &[9]));
    }

    #[test]
    fn desync_when_the_input_runs_dry() {
        static MGR: FutureManager<4> = FutureManager::new();
        // One input byte, but the command promises two.
        let fut = Future::<0, 1>::with_input([0x42]);
        fut.register(&MGR).unwrap();

        let bus = sim_with(|bus| bus.add_device(0x50));
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::write(0x50, 2, fut.id().unwrap())).unwrap();
        twi.commit();
        run_to_idle(&twi);

        assert_eq!(fut.status(), Status::Error);
        assert_eq!(fut.error(), Some(Error::Desync));
    }

    #[test]
    fn relocated_future_keeps_receiving_mid_command() {
        static MGR: FutureManager<4> = FutureManager::new();
        let first = Future::<2>::new();
        first.register(&MGR).unwrap();
        let id = first.id().unwrap();

        let bus = sim_with(|bus| {
            bus.add_device(0x50);
            bus.load_replies(0x50, &[0xAA, 0xBB]);
        });
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::read(0x50, 2, id)).unwrap();
        twi.commit();

        // commit launched the command; three interrupts land the first
        // byte: address ack, first reception, first byte pushed.
        twi.on_interrupt();
        twi.on_interrupt();
        twi.on_interrupt();

        // Relocate the future while its command is in flight.
        let second = Future::<2>::new();
        assert!(second.adopt(&first));
        assert_eq!(first.status(), Status::Invalid);

        run_to_idle(&twi);

        let mut out = [0u8; 2];
        assert!(second.get(&mut out));
        assert_eq!(out, [0xAA, 0xBB]);
    }

    #[test]
    fn dead_future_fails_its_command_without_corruption() {
        static MGR: FutureManager<4> = FutureManager::new();
        let fut = Future::<0, 2>::with_input([1, 2]);
        fut.register(&MGR).unwrap();
        let id = fut.id().unwrap();

        let bus = sim_with(|bus| bus.add_device(0x50));
        let twi: AsyncTwi<SimBus, 4> = AsyncTwi::new(bus, &MGR, TwiConfig::new());
        twi.begin();

        twi.push(Command::write(0x50, 2, id)).unwrap();
        // The future dies before the transaction is committed.
        drop(fut);
        twi.commit();
        run_to_idle(&twi);

        // The engine aborted cleanly and released the bus.
        assert!(twi.is_idle());
        assert!(twi.with_bus(|bus| bus.events().last() == Some(&BusEvent::Stop)));
    }
}
