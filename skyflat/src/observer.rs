//! Notification hook fired after every flat
//!
//! Subscribers are called synchronously, in registration order. A failing or
//! panicking subscriber is logged and skipped; it never reaches the
//! acquisition loop.

use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// One completed flat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatTaken {
    pub filter: String,
    /// Running index within the sequence, starting at 1
    pub index: u32,
    pub exposure_time: f64,
    pub sky_level: f64,
}

/// Subscriber callback
pub type FlatCallback = Arc<dyn Fn(&FlatTaken) -> Result<(), String> + Send + Sync>;

/// Registered subscribers
#[derive(Default)]
pub struct FlatObservers {
    subscribers: RwLock<Vec<FlatCallback>>,
}

impl FlatObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&FlatTaken) -> Result<(), String> + Send + Sync + 'static,
    {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(Arc::new(callback)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(callback)),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscriber
    pub fn notify(&self, event: &FlatTaken) {
        // Call outside the lock so a subscriber may register another one
        for (i, callback) in self.snapshot().iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Flat subscriber {} failed on flat #{}: {}", i, event.index, e);
                }
                Err(payload) => {
                    tracing::error!(
                        "Flat subscriber {} panicked on flat #{}: {}",
                        i,
                        event.index,
                        panic_message(&*payload)
                    );
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<FlatCallback> {
        match self.subscribers.read() {
            Ok(subscribers) => subscribers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
