//! Bridging asynchronous delivery into synchronous test assertions.
//!
//! A [`CorrelationSignal`] lets a test block, with a bound, until callbacks
//! on a session's delivery task have fired. A [`DeliveryCollector`] pairs a
//! signal with a result slot so assertions run on the test task, not inside
//! the callback.

pub mod collector;
pub mod signal;

pub use collector::DeliveryCollector;
pub use signal::{CorrelationSignal, WaitOutcome};
