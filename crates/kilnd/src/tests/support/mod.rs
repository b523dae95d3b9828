//! In-memory collaborators for dispatcher tests.

mod connections;
mod events;
mod hosts;

use std::time::{Duration, Instant};

pub(crate) use self::connections::{
    ClientEnd, ConnectionQueue, FakeConnection, FakeSource, connection_pair, failing_watch_pair,
};
pub(crate) use self::events::{Event, RecordingEventBus};
pub(crate) use self::hosts::{GatedHost, MockCompiler, completed_output};

/// Upper bound for anything a test waits on.
pub(crate) const TEST_DEADLINE: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds or the deadline passes.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
