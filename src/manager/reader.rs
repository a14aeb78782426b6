//! The background task that drains the socket and routes inbound messages.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    manager::{events, lock, socket::SynchronisedSocket},
    message::Message,
};

struct ServedResponse {
    message: Message,
    deadline: Instant,
}

/// Pulls messages off the socket and sorts them three ways: events into the events
/// queue, responses into the served-requests table keyed by `ActionID`, and anything
/// unmatched into the orphan queue.
///
/// Served responses that nobody collects within the orphaned-response timeout are
/// demoted to the orphan queue so the table can never silt up.
pub(crate) struct MessageReader {
    socket: Arc<SynchronisedSocket>,
    alive: AtomicBool,
    event_queue: Mutex<VecDeque<Message>>,
    orphan_queue: Mutex<VecDeque<Message>>,
    served: Mutex<HashMap<String, ServedResponse>>,
    orphan_timeout: Duration,
}

impl MessageReader {
    pub fn new(socket: Arc<SynchronisedSocket>, orphan_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            socket,
            alive: AtomicBool::new(true),
            event_queue: Mutex::new(VecDeque::new()),
            orphan_queue: Mutex::new(VecDeque::new()),
            served: Mutex::new(HashMap::new()),
            orphan_timeout,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let reader = Arc::clone(self);
        thread::spawn(move || reader.run())
    }

    fn run(&self) {
        while self.alive.load(Ordering::Relaxed) {
            match self.socket.read_message() {
                Ok(Some(message)) => self.route(message),
                // A read timeout is not a broken socket.
                Ok(None) => continue,
                Err(error) => {
                    debug!("manager message reader stopping: {error}");
                    break;
                }
            }
        }
    }

    fn route(&self, message: Message) {
        if message.is_event() {
            if events::lookup(message.name()).is_none() {
                debug!("unknown event received: {}", message.name());
            }
            lock(&self.event_queue).push_back(message);
        } else if let Some(action_id) = message.action_id() {
            let action_id = action_id.to_owned();
            self.reap_stale();
            let mut served = lock(&self.served);
            if served.contains_key(&action_id) {
                // A response is already waiting under this token; treat the newcomer
                // as orphaned to avoid data loss.
                drop(served);
                lock(&self.orphan_queue).push_back(message);
            } else {
                served.insert(
                    action_id,
                    ServedResponse {
                        message,
                        deadline: Instant::now() + self.orphan_timeout,
                    },
                );
            }
        } else {
            lock(&self.orphan_queue).push_back(message);
        }
    }

    /// Moves expired served responses to the orphan queue.
    fn reap_stale(&self) {
        let now = Instant::now();
        let mut served = lock(&self.served);
        let expired: Vec<String> = served
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(action_id, _)| action_id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut orphans = lock(&self.orphan_queue);
        for action_id in expired {
            if let Some(entry) = served.remove(&action_id) {
                orphans.push_back(entry.message);
            }
        }
    }

    /// Collects the response waiting under `action_id`, removing it from the table.
    pub fn get_response(&self, action_id: &str) -> Option<Message> {
        lock(&self.served)
            .remove(action_id)
            .map(|entry| entry.message)
    }

    pub fn pop_event(&self) -> Option<Message> {
        lock(&self.event_queue).pop_front()
    }

    pub fn pop_orphan(&self) -> Option<Message> {
        lock(&self.orphan_queue).pop_front()
    }

    pub fn push_orphan(&self, message: Message) {
        lock(&self.orphan_queue).push_back(message);
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}
