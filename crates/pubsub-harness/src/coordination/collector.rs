//! Delivery capture for assertions on the test task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapter::{Delivery, DeliveryHandler};
use crate::error::{HarnessError, Result};

use super::signal::{CorrelationSignal, WaitOutcome};

#[derive(Debug)]
struct Slot {
    deliveries: Mutex<Vec<Delivery>>,
    errors: Mutex<Vec<String>>,
    signal: CorrelationSignal,
}

/// A [`DeliveryHandler`] that stores every delivery and counts a signal down.
///
/// Clones share the same slot, so one clone can be handed to `subscribe`
/// while the test keeps another to wait on.
#[derive(Debug, Clone)]
pub struct DeliveryCollector {
    slot: Arc<Slot>,
}

impl DeliveryCollector {
    /// Collector released after `expected` deliveries.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            slot: Arc::new(Slot {
                deliveries: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                signal: CorrelationSignal::new(expected),
            }),
        }
    }

    /// The signal counted down per delivery.
    #[must_use]
    pub fn signal(&self) -> &CorrelationSignal {
        &self.slot.signal
    }

    /// Deliveries captured so far, in arrival order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.slot.deliveries.lock().clone()
    }

    /// Session errors reported to this handler.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.slot.errors.lock().clone()
    }

    /// Wait until the expected number of deliveries arrived.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Timeout`] if they do not arrive within
    /// `timeout`; the message names how many did and any session errors.
    pub async fn wait_for(&self, timeout: Duration) -> Result<Vec<Delivery>> {
        match self.slot.signal.wait(timeout).await {
            WaitOutcome::Signaled => Ok(self.deliveries()),
            WaitOutcome::TimedOut => {
                let received = self.slot.deliveries.lock().len();
                let errors = self.errors();
                let mut what = format!(
                    "deliveries ({received} received, {} outstanding)",
                    self.slot.signal.remaining()
                );
                if !errors.is_empty() {
                    what.push_str(&format!("; session errors: {}", errors.join(", ")));
                }
                Err(HarnessError::Timeout {
                    what,
                    elapsed: timeout,
                })
            }
        }
    }
}

impl DeliveryHandler for DeliveryCollector {
    fn on_message(&self, delivery: &Delivery) {
        self.slot.deliveries.lock().push(delivery.clone());
        self.slot.signal.signal();
    }

    fn on_error(&self, cause: &str) {
        self.slot.errors.lock().push(cause.to_string());
    }
}
