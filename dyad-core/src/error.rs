//! Error taxonomy
//!
//! Four codes cover the whole core. Nothing panics; failures surface
//! through return values and future status only.

/// Error codes reported by futures, queues and engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Operation on an unregistered or already-consumed future.
    Invalid,
    /// A fixed capacity was exceeded: a producer wrote past the
    /// declared output size, or a slot table / queue was full.
    Overflow,
    /// Bus-level failure: unexpected NACK, arbitration loss, bus
    /// error, or an expired blocking timeout.
    Protocol,
    /// Internal consistency violation, e.g. the engine found a
    /// future's input exhausted in the middle of a write command.
    Desync,
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::ErrorKind;

        match self {
            Error::Protocol => ErrorKind::Bus,
            Error::Overflow => ErrorKind::Overrun,
            Error::Invalid | Error::Desync => ErrorKind::Other,
        }
    }
}
