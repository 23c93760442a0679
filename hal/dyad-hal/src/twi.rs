//! Two-wire bus abstractions
//!
//! The [`TwiBus`] trait is the capability set of a two-wire (TWI/I2C)
//! controller peripheral, expressed as split-phase micro-operations:
//! each call initiates one bus action, and [`TwiBus::status`] reports
//! the outcome of the most recently initiated action. On an
//! interrupt-driven target the completion interrupt fires between the
//! two; a blocking implementation may simply complete the action before
//! returning.

/// Data direction for the R/W bit of the address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Controller reads from the target (SLA+R).
    Read,
    /// Controller writes to the target (SLA+W).
    Write,
}

/// Outcome of the most recently initiated bus micro-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TwiStatus {
    /// No operation has completed; the bus is released.
    Idle,
    /// The initiated operation is still in flight.
    Busy,
    /// A START condition was transmitted.
    Start,
    /// A repeated START condition was transmitted.
    RepeatStart,
    /// The address byte was acknowledged by the target.
    SlaAck,
    /// The address byte was not acknowledged.
    SlaNack,
    /// A data byte was transferred and acknowledged.
    DataAck,
    /// A data byte was transferred and not acknowledged.
    DataNack,
    /// Bus arbitration was lost to another controller.
    ArbLost,
    /// Illegal START/STOP condition detected on the wire.
    BusError,
}

/// Two-wire bus controller peripheral.
///
/// All operations target 7-bit addresses; the implementation places the
/// direction bit on the wire. Implementations must keep every call
/// short and non-blocking on interrupt-driven targets: the engine calls
/// them from interrupt context.
pub trait TwiBus {
    /// Enable the peripheral with the given bus configuration.
    fn begin(&mut self, config: BusConfig);

    /// Disable the peripheral and release the lines.
    fn end(&mut self);

    /// Initiate a START condition.
    fn raise_start(&mut self);

    /// Initiate a repeated START condition on an open bus.
    fn raise_repeat_start(&mut self);

    /// Send the address byte for `target` with the given direction bit.
    fn send_address(&mut self, target: u8, direction: Direction);

    /// Clock one data byte out to the target.
    fn send_byte(&mut self, byte: u8);

    /// Clock one data byte in from the target.
    ///
    /// `last` selects the acknowledge bit returned to the target: the
    /// final byte of a read is answered with NACK per bus convention,
    /// all earlier bytes with ACK.
    fn receive_byte(&mut self, last: bool);

    /// Initiate a STOP condition, releasing the bus.
    fn raise_stop(&mut self);

    /// Outcome of the most recently initiated operation.
    fn status(&self) -> TwiStatus;

    /// The data byte captured by the last completed reception.
    fn data(&self) -> u8;
}

/// Bus clock configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// SCL frequency in Hz
    pub frequency: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frequency: 100_000, // 100kHz standard mode
        }
    }
}

impl BusConfig {
    /// Standard mode (100 kHz)
    pub const STANDARD: Self = Self { frequency: 100_000 };

    /// Fast mode (400 kHz)
    pub const FAST: Self = Self { frequency: 400_000 };

    /// Fast mode plus (1 MHz)
    pub const FAST_PLUS: Self = Self {
        frequency: 1_000_000,
    };
}
