//! Event bus that remembers every notification.

use std::sync::Mutex;
use std::time::Instant;

use kiln_protocol::KeepAlive;

use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Listening,
    Received,
    Completed { count: usize },
    CompilationCompleted,
    RudelyEnded,
    KeepAliveUpdated(KeepAlive),
    KeepAliveReached,
    BadConnection,
}

#[derive(Debug, Default)]
pub(crate) struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
    completed_at: Mutex<Vec<Instant>>,
}

impl RecordingEventBus {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    pub(crate) fn count(&self, wanted: Event) -> usize {
        self.events().into_iter().filter(|event| *event == wanted).count()
    }

    /// Running totals reported with each completed connection.
    pub(crate) fn completion_counts(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Completed { count } => Some(count),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn completion_times(&self) -> Vec<Instant> {
        self.completed_at.lock().expect("times lock").clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl EventBus for RecordingEventBus {
    fn connection_listening(&self) {
        self.record(Event::Listening);
    }

    fn connection_received(&self) {
        self.record(Event::Received);
    }

    fn connection_completed(&self, count: usize, at: Instant) {
        self.completed_at.lock().expect("times lock").push(at);
        self.record(Event::Completed { count });
    }

    fn compilation_completed(&self) {
        self.record(Event::CompilationCompleted);
    }

    fn connection_rudely_ended(&self) {
        self.record(Event::RudelyEnded);
    }

    fn keep_alive_updated(&self, keep_alive: KeepAlive) {
        self.record(Event::KeepAliveUpdated(keep_alive));
    }

    fn keep_alive_reached(&self) {
        self.record(Event::KeepAliveReached);
    }

    fn bad_connection(&self) {
        self.record(Event::BadConnection);
    }
}
