pub mod clock;

pub use clock::{Clock, MonotonicClock, TimeBase};

/// One attached motor/GPIO controller channel.
///
/// The link is write-only at the trait level: received bytes are delivered
/// out-of-band by the backend (reader thread posting into the engine's event
/// queue), keyed by `handle()`.
pub trait ControllerLink {
    /// Queue one request frame (already `\n`-terminated) to the device.
    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stable identity of the underlying port (e.g. the device path).
    /// Used to route received data and detach notifications back to a slot.
    fn handle(&self) -> &str;

    /// Release the device. Idempotent; called on detach and on shutdown.
    fn release(&mut self);
}

/// Transport to the 8-channel Modbus-TCP ADC.
///
/// Response frames arrive out-of-band through the backend's reader thread;
/// the engine only drives connect/send/close from its own context.
pub trait AdcTransport {
    /// (Re-)establish the connection. Returns Ok(true) when connected after
    /// the call, Ok(false) when the attempt failed without a hard error.
    fn connect(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;

    fn is_connected(&self) -> bool;

    /// Write one request frame on the established connection.
    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Destroy the socket. Idempotent.
    fn close(&mut self);
}
