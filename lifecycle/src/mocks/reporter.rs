use crate::{Event, Reporter as Z};
use std::sync::{Arc, Mutex};

/// A [crate::Reporter] that records every [Event] it receives.
#[derive(Clone, Default)]
pub struct Reporter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of received events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl Z for Reporter {
    async fn report(&mut self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
