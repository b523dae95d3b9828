//! Behavioural tests for the request dispatcher's accept loop and shutdown.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use kiln_protocol::{BuildRequest, BuildResponse, KeepAlive};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::support::{
    ClientEnd, ConnectionQueue, Event, FakeSource, GatedHost, RecordingEventBus, TEST_DEADLINE,
    eventually,
};
use crate::dispatcher::{RequestDispatcher, ShutdownReason};

const SERVER_PID: u32 = 31_337;

struct DispatcherWorld {
    runtime: Option<Runtime>,
    queue: Option<ConnectionQueue>,
    host: Arc<GatedHost>,
    events: Arc<RecordingEventBus>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<ShutdownReason>>,
    clients: Vec<ClientEnd>,
    responses: Vec<BuildResponse>,
    last_response: Option<BuildResponse>,
    next_client: usize,
}

impl DispatcherWorld {
    fn new() -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("test runtime");
        Self {
            runtime: Some(runtime),
            queue: None,
            host: Arc::new(GatedHost::open()),
            events: Arc::new(RecordingEventBus::default()),
            cancel: CancellationToken::new(),
            handle: None,
            clients: Vec::new(),
            responses: Vec::new(),
            last_response: None,
            next_client: 0,
        }
    }

    fn runtime(&self) -> &Runtime {
        self.runtime.as_ref().expect("runtime is alive")
    }

    fn start(&mut self, host: GatedHost, keep_alive: KeepAlive) {
        assert!(self.handle.is_none(), "dispatcher already started");
        self.host = Arc::new(host);
        let (source, queue) = FakeSource::new();
        let dispatcher = RequestDispatcher::new(
            source,
            Arc::clone(&self.host),
            Arc::clone(&self.events),
            keep_alive,
        )
        .with_server_process_id(SERVER_PID);
        self.handle = Some(self.runtime().spawn(dispatcher.run(self.cancel.clone())));
        self.queue = Some(queue);
    }

    fn queue(&self) -> &ConnectionQueue {
        self.queue.as_ref().expect("dispatcher started")
    }

    fn connect(&mut self) -> ClientEnd {
        self.next_client += 1;
        let identifier = format!("client-{}", self.next_client);
        self.queue().connect(&identifier)
    }

    fn send(&self, client: &mut ClientEnd, request: &BuildRequest) {
        self.runtime().block_on(client.send(request));
    }

    fn read(&self, client: &mut ClientEnd) -> BuildResponse {
        self.runtime()
            .block_on(async { tokio::time::timeout(TEST_DEADLINE, client.response()).await })
            .expect("response arrives before the deadline")
            .expect("server wrote a response")
    }

    /// Sends `request` on a fresh connection and waits for the answer.
    fn round_trip(&mut self, request: &BuildRequest) -> BuildResponse {
        let mut client = self.connect();
        self.send(&mut client, request);
        self.read(&mut client)
    }

    fn wait_for(&self, condition: impl FnMut() -> bool) -> bool {
        self.runtime().block_on(eventually(condition))
    }

    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stopped_with(&mut self) -> ShutdownReason {
        let handle = self.handle.take().expect("dispatcher started");
        self.runtime()
            .block_on(async { tokio::time::timeout(TEST_DEADLINE, handle).await })
            .expect("dispatcher stops before the deadline")
            .expect("dispatcher task")
    }
}

impl Drop for DispatcherWorld {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.host.release();
        if let Some(handle) = self.handle.take()
            && let Some(runtime) = self.runtime.as_ref()
        {
            drop(runtime.block_on(async { tokio::time::timeout(TEST_DEADLINE, handle).await }));
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(TEST_DEADLINE);
        }
    }
}

fn build_request() -> BuildRequest {
    BuildRequest::from_command_line("/work", ["--emit", "main.o"])
}

#[fixture]
fn world() -> RefCell<DispatcherWorld> {
    RefCell::new(DispatcherWorld::new())
}

#[given("a dispatcher whose compiler finishes immediately")]
fn given_open_compiler(world: &RefCell<DispatcherWorld>) {
    world
        .borrow_mut()
        .start(GatedHost::open(), KeepAlive::Disabled);
}

#[given("a dispatcher whose compiler blocks until released")]
fn given_blocking_compiler(world: &RefCell<DispatcherWorld>) {
    world
        .borrow_mut()
        .start(GatedHost::closed(), KeepAlive::Disabled);
}

#[given("a dispatcher with a keep-alive of {millis} milliseconds")]
fn given_keep_alive(world: &RefCell<DispatcherWorld>, millis: u64) {
    world.borrow_mut().start(
        GatedHost::open(),
        KeepAlive::After(Duration::from_millis(millis)),
    );
}

#[given("a dispatcher whose compiler finishes immediately with a keep-alive of {millis} milliseconds")]
fn given_open_compiler_with_keep_alive(world: &RefCell<DispatcherWorld>, millis: u64) {
    world.borrow_mut().start(
        GatedHost::open(),
        KeepAlive::After(Duration::from_millis(millis)),
    );
}

#[given("a dispatcher whose compiler blocks until released with a keep-alive of {millis} milliseconds")]
fn given_blocking_compiler_with_keep_alive(world: &RefCell<DispatcherWorld>, millis: u64) {
    world.borrow_mut().start(
        GatedHost::closed(),
        KeepAlive::After(Duration::from_millis(millis)),
    );
}

#[when("{count} sequential builds are requested")]
fn when_sequential_builds(world: &RefCell<DispatcherWorld>, count: usize) {
    let mut world = world.borrow_mut();
    for _ in 0..count {
        let response = world.round_trip(&build_request());
        world.responses.push(response);
    }
}

#[when("{count} clients send build requests")]
fn when_clients_send(world: &RefCell<DispatcherWorld>, count: usize) {
    let mut world = world.borrow_mut();
    for _ in 0..count {
        let mut client = world.connect();
        world.send(&mut client, &build_request());
        world.clients.push(client);
    }
}

#[when("every build has started")]
fn when_builds_started(world: &RefCell<DispatcherWorld>) {
    let world = world.borrow();
    let expected = world.clients.len();
    let host = Arc::clone(&world.host);
    assert!(
        world.wait_for(|| host.started() == expected),
        "expected {expected} builds to start, saw {}",
        host.started()
    );
}

#[when("every build client disconnects")]
fn when_clients_disconnect(world: &RefCell<DispatcherWorld>) {
    for client in world.borrow_mut().clients.drain(..) {
        client.disconnect();
    }
}

#[when("a client requests shutdown")]
fn when_shutdown_requested(world: &RefCell<DispatcherWorld>) {
    let mut world = world.borrow_mut();
    let response = world.round_trip(&BuildRequest::shutdown());
    world.last_response = Some(response);
}

#[when("a client whose disconnect watch fails sends a build request")]
fn when_failing_client(world: &RefCell<DispatcherWorld>) {
    let mut world = world.borrow_mut();
    let mut client = world.queue().connect_with_failing_watch("doomed");
    world.send(&mut client, &build_request());
    world.clients.push(client);
}

#[when("a client sends a malformed request")]
fn when_malformed_request(world: &RefCell<DispatcherWorld>) {
    let mut world = world.borrow_mut();
    let mut client = world.connect();
    world.runtime().block_on(client.send_garbage());
    let response = world.read(&mut client);
    world.last_response = Some(response);
}

#[when("a client sends a request with protocol version {version}")]
fn when_version_request(world: &RefCell<DispatcherWorld>, version: u32) {
    let mut world = world.borrow_mut();
    let response = world.round_trip(&build_request().with_protocol_version(version));
    world.last_response = Some(response);
}

#[when("a client builds with a keep-alive of {secs} seconds")]
fn when_keep_alive_build(world: &RefCell<DispatcherWorld>, secs: u64) {
    let mut world = world.borrow_mut();
    let request = build_request().with_keep_alive(KeepAlive::from_secs(Some(secs)));
    let response = world.round_trip(&request);
    world.responses.push(response);
}

#[when("{millis} milliseconds pass")]
fn when_time_passes(world: &RefCell<DispatcherWorld>, millis: u64) {
    world
        .borrow()
        .runtime()
        .block_on(async { tokio::time::sleep(Duration::from_millis(millis)).await });
}

#[when("the compiler is released")]
fn when_compiler_released(world: &RefCell<DispatcherWorld>) {
    world.borrow().host.release();
}

#[when("the dispatcher is cancelled")]
fn when_cancelled(world: &RefCell<DispatcherWorld>) {
    world.borrow().cancel.cancel();
}

#[when("the next accept fails")]
fn when_accept_fails(world: &RefCell<DispatcherWorld>) {
    world.borrow().queue().fail_accept();
}

#[then("every build client receives a completed response")]
fn then_completed_responses(world: &RefCell<DispatcherWorld>) {
    let mut world = world.borrow_mut();
    let mut clients = std::mem::take(&mut world.clients);
    for client in &mut clients {
        let response = world.read(client);
        world.responses.push(response);
    }
    assert!(!world.responses.is_empty(), "no builds were requested");
    for response in &world.responses {
        assert_eq!(response, &BuildResponse::completed(0, true, "--emit main.o"));
    }
}

#[then("the completion counts run from 1 to {last}")]
fn then_completion_counts(world: &RefCell<DispatcherWorld>, last: usize) {
    let world = world.borrow();
    let events = Arc::clone(&world.events);
    assert!(
        world.wait_for(|| events.completion_counts().len() == last),
        "expected {last} completions"
    );
    assert_eq!(events.completion_counts(), (1..=last).collect::<Vec<_>>());
    let times = events.completion_times();
    assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[then("{count} connections ended rudely")]
fn then_rudely_ended(world: &RefCell<DispatcherWorld>, count: usize) {
    let world = world.borrow();
    let events = Arc::clone(&world.events);
    assert!(
        world.wait_for(|| events.count(Event::RudelyEnded) == count),
        "expected {count} rude endings, saw {}",
        events.count(Event::RudelyEnded)
    );
}

#[then("every build was cancelled")]
fn then_builds_cancelled(world: &RefCell<DispatcherWorld>) {
    let world = world.borrow();
    let host = Arc::clone(&world.host);
    assert!(
        world.wait_for(|| host.started() > 0 && host.cancelled() == host.started()),
        "{} of {} builds observed cancellation",
        host.cancelled(),
        host.started()
    );
    assert_eq!(host.finished(), 0);
}

#[then("the dispatcher is still running")]
fn then_still_running(world: &RefCell<DispatcherWorld>) {
    assert!(world.borrow().is_running(), "dispatcher stopped early");
}

#[then("the dispatcher stops with reason \"{reason}\"")]
fn then_stops_with(world: &RefCell<DispatcherWorld>, reason: String) {
    let stopped = world.borrow_mut().stopped_with();
    assert_eq!(stopped.as_str(), reason);
}

#[then("the keep-alive was reached once")]
fn then_keep_alive_reached(world: &RefCell<DispatcherWorld>) {
    assert_eq!(world.borrow().events.count(Event::KeepAliveReached), 1);
}

#[then("the keep-alive was never reached")]
fn then_keep_alive_not_reached(world: &RefCell<DispatcherWorld>) {
    assert_eq!(world.borrow().events.count(Event::KeepAliveReached), 0);
}

#[then("the keep-alive was updated to {secs} seconds")]
fn then_keep_alive_updated(world: &RefCell<DispatcherWorld>, secs: u64) {
    let world = world.borrow();
    let events = Arc::clone(&world.events);
    let expected = Event::KeepAliveUpdated(KeepAlive::from_secs(Some(secs)));
    assert!(
        world.wait_for(|| events.count(expected) == 1),
        "keep-alive was never updated"
    );
}

#[then("the response acknowledges shutdown by this server")]
fn then_shutdown_acknowledged(world: &RefCell<DispatcherWorld>) {
    assert_eq!(
        world.borrow().last_response,
        Some(BuildResponse::shutdown(SERVER_PID))
    );
}

#[then("the response is rejected with reason \"{reason}\"")]
fn then_rejected(world: &RefCell<DispatcherWorld>, reason: String) {
    assert_eq!(
        world.borrow().last_response,
        Some(BuildResponse::rejected(reason))
    );
}

#[then("the response reports a version mismatch")]
fn then_version_mismatch(world: &RefCell<DispatcherWorld>) {
    assert_eq!(
        world.borrow().last_response,
        Some(BuildResponse::MismatchedVersion)
    );
}

#[then("no accept was issued after the bad connection")]
fn then_no_accept_after_bad_connection(world: &RefCell<DispatcherWorld>) {
    let events = world.borrow().events.events();
    let bad = events
        .iter()
        .position(|event| *event == Event::BadConnection)
        .expect("bad connection was reported");
    assert!(
        !events
            .iter()
            .skip(bad)
            .any(|event| *event == Event::Listening),
        "accept issued after bad connection: {events:?}"
    );
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "Sequential builds are each answered"
)]
fn sequential_builds(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "Clients that disconnect mid-build are counted as rude"
)]
fn simultaneous_disconnects(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "An idle dispatcher stops when the keep-alive elapses"
)]
fn idle_keep_alive(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A shutdown request lets in-flight builds finish"
)]
fn shutdown_request_drains(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "An unexpected connection failure stops the dispatcher"
)]
fn bad_connection_stops(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A malformed request is rejected and serving continues"
)]
fn malformed_request(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A client speaking another protocol version is told so"
)]
fn version_mismatch(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A build can shorten the keep-alive"
)]
fn keep_alive_override(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "Cancelling the dispatcher abandons in-flight builds"
)]
fn cancellation(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A failed accept is retried"
)]
fn accept_retry(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "Sequential builds are answered before the keep-alive stops the dispatcher"
)]
fn sequential_builds_then_keep_alive(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "The keep-alive elapses once every rude client has gone"
)]
fn simultaneous_disconnects_then_keep_alive(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/request_dispatcher.feature",
    name = "A build in progress holds off the keep-alive"
)]
fn build_holds_off_keep_alive(#[from(world)] world: RefCell<DispatcherWorld>) {
    drop(world);
}
