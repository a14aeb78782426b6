//! The Asterisk Manager Interface client core.
//!
//! A [`Manager`] owns one TCP connection to the manager and three background
//! concerns: a reader task that parses and routes inbound messages, a dispatcher
//! task that drives aggregates and invokes registered callbacks, and the caller
//! threads blocked inside [`Manager::send_action`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use asterisk_client::manager::{actions, Event, Manager};
//!
//! # fn main() -> Result<(), asterisk_client::manager::ManagerError> {
//! let manager = Manager::new();
//! manager.register_callback("Newchannel", Arc::new(|event: &Event, _: &Manager| {
//!     println!("channel up: {:?}", event.message().and_then(|m| m.get("Channel")));
//! }));
//! manager.connect("127.0.0.1", asterisk_client::manager::DEFAULT_PORT)?;
//! manager.send_action(&actions::Login::new("admin", "secret"))?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod actions;
pub mod aggregate;
pub mod callbacks;
pub mod events;
mod reader;
pub mod socket;

use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use thiserror::Error;

pub use action::{ActionOutcome, EventsMap, HeaderValue, ManagerAction, DEFAULT_ACTION_TIMEOUT};
pub use aggregate::{Aggregate, AggregateSpec};
use aggregate::Evaluation;
use callbacks::CallbackRegistry;
pub use callbacks::{Event, EventCallback, EventKey};
pub use events::EventSpec;
use reader::MessageReader;
pub use socket::{SocketError, SynchronisedSocket, DEFAULT_PORT};

use crate::message::Message;

/// How often `send_action` polls for its response and completion state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long the dispatcher sleeps when both queues are empty.
const DISPATCH_IDLE: Duration = Duration::from_millis(20);
/// Idle cycles between sweeps of expired aggregates, roughly one second.
const REAP_CYCLES: u32 = 50;

/// Default liveness interval for [`Manager::monitor_connection`].
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(2500);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An error servicing a manager request.
///
/// Timeouts are not errors: a request that received no response yields `Ok(None)`
/// from [`Manager::send_action`], and a synchronous request that collected only part
/// of its events comes back with `events_timeout` set.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("not connected to an Asterisk manager")]
    NotConnected,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

/// Tunables for a [`Manager`]. The defaults match stock Asterisk deployments.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Socket read timeout; bounds how long the reader task blocks.
    pub read_timeout: Duration,
    /// How long an aggregate may wait for its finalisers.
    pub aggregate_timeout: Duration,
    /// How long an uncollected response is held before being demoted to an orphan.
    pub orphaned_response_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            aggregate_timeout: Duration::from_secs(5),
            orphaned_response_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    socket: Option<Arc<SynchronisedSocket>>,
    reader: Option<Arc<MessageReader>>,
    outstanding: HashMap<String, Option<SyncRequestState>>,
}

/// Collection state for one in-flight synchronous request.
struct SyncRequestState {
    events: EventsMap,
    pending_finalisers: HashSet<&'static str>,
}

struct ManagerCore {
    alive: AtomicBool,
    config: ManagerConfig,
    connection: Mutex<ConnectionState>,
    aggregates: Mutex<Vec<Aggregate>>,
    callbacks: Mutex<CallbackRegistry>,
    action_ids: action::ActionIdGenerator,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to the manager core. Clones share the same connection, callbacks, and
/// background tasks.
#[derive(Clone)]
pub struct Manager {
    core: Arc<ManagerCore>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let core = Arc::new(ManagerCore {
            alive: AtomicBool::new(true),
            config,
            connection: Mutex::new(ConnectionState::default()),
            aggregates: Mutex::new(Vec::new()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            action_ids: action::ActionIdGenerator::default(),
            dispatcher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        let handle = thread::spawn(move || dispatch_loop(weak));
        *lock(&core.dispatcher) = Some(handle);

        Self { core }
    }

    /// Connects to the manager, closing any existing connection first.
    ///
    /// Register callbacks before connecting, then authenticate with the core
    /// `Login` or `Challenge` action.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), ManagerError> {
        self.disconnect();

        let socket = Arc::new(SynchronisedSocket::connect(
            host,
            port,
            self.core.config.read_timeout,
        )?);
        let reader = MessageReader::new(
            Arc::clone(&socket),
            self.core.config.orphaned_response_timeout,
        );
        reader.spawn();

        let mut state = lock(&self.core.connection);
        state.socket = Some(socket);
        state.reader = Some(reader);
        Ok(())
    }

    /// Gracefully closes the connection. A no-op when not connected.
    pub fn disconnect(&self) {
        let mut state = lock(&self.core.connection);
        if let Some(socket) = state.socket.take() {
            socket.close();
        }
        state.outstanding.clear();
        // The reader is stopped but kept in place: it may still hold unprocessed
        // messages the dispatcher should drain.
        if let Some(reader) = state.reader.as_ref() {
            reader.kill();
        }
    }

    /// Releases the core: disconnects and stops the dispatcher task. Idempotent.
    pub fn close(&self) {
        self.disconnect();
        self.core.alive.store(false, Ordering::Relaxed);
        let handle = lock(&self.core.dispatcher).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        let state = lock(&self.core.connection);
        state
            .socket
            .as_ref()
            .is_some_and(|socket| socket.is_connected())
    }

    /// The name and version of the connected Asterisk server.
    pub fn server_info(&self) -> Option<(String, String)> {
        let state = lock(&self.core.connection);
        state
            .socket
            .as_ref()
            .filter(|socket| socket.is_connected())
            .map(|socket| {
                let (name, version) = socket.server_info();
                (name.to_owned(), version.to_owned())
            })
    }

    /// Registers `callback` for the messages selected by `key`.
    ///
    /// `key` may be an event name, an event or aggregate spec, the empty string for
    /// every event, or [`EventKey::Orphans`] for responses that matched no request.
    /// Re-registering an identical binding moves it to the end of the order.
    pub fn register_callback(&self, key: impl Into<EventKey>, callback: EventCallback) {
        lock(&self.core.callbacks).register(key.into(), callback);
    }

    /// Removes a previously registered binding, reporting whether one was found.
    pub fn unregister_callback(&self, key: impl Into<EventKey>, callback: &EventCallback) -> bool {
        lock(&self.core.callbacks).remove(&key.into(), callback)
    }

    /// Spawns a task that pings the manager every `interval` until the connection
    /// drops or the core is released.
    pub fn monitor_connection(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.core);
        thread::spawn(move || loop {
            let Some(core) = weak.upgrade() else { break };
            let manager = Manager { core };
            if !manager.is_connected() {
                break;
            }
            if manager.send_action(&actions::Ping::new()).is_err() {
                break;
            }
            drop(manager);
            thread::sleep(interval);
        });
    }

    /// Sends `action` and blocks until it has been serviced.
    ///
    /// Returns the serviced outcome, or `None` if the manager never answered within
    /// the action's timeout. For synchronous actions the call additionally waits,
    /// within the same timeout, for every declared finaliser event; the collected
    /// events ride along on the outcome.
    pub fn send_action<A>(&self, action: &A) -> Result<Option<ActionOutcome>, ManagerError>
    where
        A: ManagerAction + ?Sized,
    {
        self.send_action_with(action, None, &[])
    }

    /// [`Manager::send_action`] with an explicit correlation token and extra headers
    /// merged into the wire form.
    pub fn send_action_with<A>(
        &self,
        action: &A,
        action_id: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<Option<ActionOutcome>, ManagerError>
    where
        A: ManagerAction + ?Sized,
    {
        let (socket, reader) = {
            let state = lock(&self.core.connection);
            let socket = state
                .socket
                .clone()
                .filter(|socket| socket.is_connected())
                .ok_or(ManagerError::NotConnected)?;
            let reader = state.reader.clone().ok_or(ManagerError::NotConnected)?;
            (socket, reader)
        };

        let action_id = match action_id {
            Some(id) => id.to_owned(),
            None => self.core.action_ids.next_host_id(),
        };

        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, value) in action.headers() {
            match value {
                HeaderValue::Value(value) => pairs.push((name, value)),
                HeaderValue::List(values) => {
                    for value in values {
                        pairs.push((name.clone(), value));
                    }
                }
            }
        }
        for (name, value) in extra_headers {
            pairs.push(((*name).to_owned(), (*value).to_owned()));
        }
        let bytes = crate::codec::encode::encode_action(
            action.name(),
            pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())),
            &action_id,
        );

        self.register_outstanding(action, &action_id);

        action.note_transmission();
        if let Err(error) = socket.send(&bytes) {
            self.deregister(&action_id);
            return Err(error.into());
        }

        if !action.synchronous() && !action.aggregates().is_empty() {
            let deadline = Instant::now() + self.core.config.aggregate_timeout;
            let mut aggregates = lock(&self.core.aggregates);
            for spec in action.aggregates() {
                debug!(
                    "started building aggregate-event '{}' for action-ID '{}'",
                    spec.name, action_id
                );
                aggregates.push(Aggregate::new(*spec, action_id.clone(), deadline));
            }
        }

        let start = Instant::now();
        let deadline = start + action.timeout();
        let mut response: Option<Message> = None;
        let mut success = false;
        let mut events_timeout = false;

        loop {
            if Instant::now() >= deadline {
                if action.synchronous() && response.is_some() {
                    events_timeout = true;
                    warn!(
                        "timed out while collecting events for synchronised action-ID '{action_id}'"
                    );
                }
                break;
            }

            if response.is_none() {
                if let Some(mut arrived) = reader.get_response(&action_id) {
                    match action.process_response(&mut arrived) {
                        Ok(processed) => {
                            success = processed;
                            response = Some(arrived);
                            if !action.synchronous() || !success {
                                break;
                            }
                        }
                        Err(error) => {
                            self.deregister(&action_id);
                            return Err(error);
                        }
                    }
                }
            } else if self.request_complete(&action_id) {
                break;
            }

            thread::sleep(POLL_INTERVAL);
        }

        // Whether or not events completed, the token leaves circulation here; a
        // response arriving from now on is routed to the orphan queue.
        let sync_state = self.deregister(&action_id);

        match response {
            Some(response) => Ok(Some(ActionOutcome {
                response,
                action_id,
                success,
                time: start.elapsed(),
                events: sync_state.map(|state| state.events),
                events_timeout,
            })),
            None => {
                warn!("timed out while waiting for response for action-ID '{action_id}'");
                Ok(None)
            }
        }
    }

    fn register_outstanding<A>(&self, action: &A, action_id: &str)
    where
        A: ManagerAction + ?Sized,
    {
        let entry = if action.synchronous() {
            Some(SyncRequestState {
                events: EventsMap::allocate(
                    action.unique_events(),
                    action.list_events(),
                    action.finaliser_events(),
                ),
                pending_finalisers: action
                    .finaliser_events()
                    .iter()
                    .map(|spec| spec.name)
                    .collect(),
            })
        } else {
            None
        };
        lock(&self.core.connection)
            .outstanding
            .insert(action_id.to_owned(), entry);
    }

    fn deregister(&self, action_id: &str) -> Option<SyncRequestState> {
        lock(&self.core.connection)
            .outstanding
            .remove(action_id)
            .flatten()
    }

    /// Whether a synchronous request has received every declared finaliser. Unknown
    /// or asynchronous tokens count as complete.
    fn request_complete(&self, action_id: &str) -> bool {
        let state = lock(&self.core.connection);
        match state.outstanding.get(action_id) {
            Some(Some(sync)) => sync.pending_finalisers.is_empty(),
            _ => true,
        }
    }
}

impl Drop for ManagerCore {
    fn drop(&mut self) {
        let state = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = state.socket.take() {
            socket.close();
        }
        if let Some(reader) = state.reader.take() {
            reader.kill();
        }
    }
}

enum EventBinding {
    /// The event was written into a synchronous request's events map.
    Consumed,
    /// The event belongs to a request that is already complete.
    Orphaned(Message),
    /// The event is not tied to any synchronous request.
    Unbound(Message),
}

enum AggregateOffer {
    Consumed,
    Finalised(Aggregate),
    Unrelated(Message),
}

impl ManagerCore {
    /// Binds an event to an outstanding synchronous request, if one claims it.
    ///
    /// Events for a request whose finalisers are all in are handed back for orphan
    /// handling rather than being filed late.
    fn bind_request_event(&self, event: Message) -> EventBinding {
        let Some(action_id) = event.action_id().map(str::to_owned) else {
            return EventBinding::Unbound(event);
        };
        let mut state = lock(&self.connection);
        match state.outstanding.get_mut(&action_id) {
            Some(Some(sync)) => {
                if sync.pending_finalisers.is_empty() {
                    return EventBinding::Orphaned(event);
                }
                sync.pending_finalisers.remove(event.name());
                sync.events.store(event);
                EventBinding::Consumed
            }
            _ => EventBinding::Unbound(event),
        }
    }

    /// Offers an event to each pending aggregate in order until one consumes it.
    fn offer_to_aggregates(&self, mut event: Message) -> AggregateOffer {
        let mut aggregates = lock(&self.aggregates);
        for index in 0..aggregates.len() {
            match aggregates[index].evaluate_event(event) {
                Evaluation::Unrelated(returned) => event = returned,
                Evaluation::Absorbed => return AggregateOffer::Consumed,
                Evaluation::Finalised => {
                    let aggregate = aggregates.remove(index);
                    return AggregateOffer::Finalised(aggregate);
                }
            }
        }
        AggregateOffer::Unrelated(event)
    }

    fn reap_aggregates(&self) {
        let now = Instant::now();
        lock(&self.aggregates).retain(|aggregate| {
            if aggregate.expired(now) {
                warn!(
                    "aggregate '{}' for action-ID '{}' timed out before all events were gathered",
                    aggregate.name(),
                    aggregate.action_id()
                );
                false
            } else {
                true
            }
        });
    }
}

/// The dispatcher task: completes aggregates, binds synchronous follow-ups, and
/// invokes callbacks, one message per cycle, until the core is released.
fn dispatch_loop(core: Weak<ManagerCore>) {
    let mut completed: VecDeque<Aggregate> = VecDeque::new();
    let mut reap_cycle = 0u32;

    loop {
        let Some(core) = core.upgrade() else { break };
        if !core.alive.load(Ordering::Relaxed) {
            break;
        }
        let manager = Manager { core };

        let reader = lock(&manager.core.connection).reader.clone();
        let Some(reader) = reader else {
            thread::sleep(DISPATCH_IDLE);
            continue;
        };

        let mut worked = dispatch_event(&manager, &reader, &mut completed);
        worked |= dispatch_orphan(&manager, &reader);

        if !worked {
            thread::sleep(DISPATCH_IDLE);
            if reap_cycle == 0 {
                reap_cycle = REAP_CYCLES;
                manager.core.reap_aggregates();
            } else {
                reap_cycle -= 1;
            }
        }
    }
}

fn dispatch_event(
    manager: &Manager,
    reader: &MessageReader,
    completed: &mut VecDeque<Aggregate>,
) -> bool {
    // Finalised aggregates go out ahead of raw events observed in the same cycle.
    if let Some(aggregate) = completed.pop_front() {
        fan_out(manager, Event::Aggregate(aggregate));
        return true;
    }

    let Some(event) = reader.pop_event() else {
        return false;
    };

    let event = match manager.core.bind_request_event(event) {
        EventBinding::Consumed => return true,
        EventBinding::Orphaned(message) => {
            reader.push_orphan(message);
            return true;
        }
        EventBinding::Unbound(message) => message,
    };

    let event = match manager.core.offer_to_aggregates(event) {
        AggregateOffer::Consumed => return true,
        AggregateOffer::Finalised(aggregate) => {
            completed.push_back(aggregate);
            return true;
        }
        AggregateOffer::Unrelated(message) => message,
    };

    fan_out(manager, Event::Message(event));
    true
}

fn dispatch_orphan(manager: &Manager, reader: &MessageReader) -> bool {
    let Some(response) = reader.pop_orphan() else {
        return false;
    };
    let handlers = lock(&manager.core.callbacks).orphan_handlers();
    debug!(
        "received orphaned response '{}' with {} handlers",
        response.name(),
        handlers.len()
    );
    let wrapped = Event::Message(response);
    for handler in handlers {
        invoke(manager, &handler, &wrapped, "orphaned-response handler");
    }
    true
}

fn fan_out(manager: &Manager, event: Event) {
    let callbacks = lock(&manager.core.callbacks).matching(event.name());
    debug!(
        "received event '{}' with {} callbacks",
        event.name(),
        callbacks.len()
    );
    for callback in callbacks {
        invoke(manager, &callback, &event, "event callback");
    }
}

/// Runs one callback, containing any panic so the dispatcher survives user code.
fn invoke(manager: &Manager, callback: &EventCallback, event: &Event, what: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| (callback.as_ref())(event, manager)));
    if let Err(payload) = result {
        error!(
            "{what} for '{}' panicked: {}",
            event.name(),
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<opaque panic payload>"
    }
}
