//! In-memory publish/subscribe fan-out of session output lines.
//!
//! One [`Hub`] lives for the process lifetime. Each session gets its own
//! bounded replay buffer and a set of subscriber channels; slow
//! subscribers are dropped rather than allowed to block the publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

const DEFAULT_REPLAY_CAPACITY: usize = 512;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum HubMessage {
    Line(String),
    Done,
}

struct SessionChannel {
    replay: VecDeque<String>,
    subscribers: Vec<mpsc::Sender<HubMessage>>,
    finished: bool,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            replay: VecDeque::with_capacity(DEFAULT_REPLAY_CAPACITY),
            subscribers: Vec::new(),
            finished: false,
        }
    }
}

pub struct Hub {
    sessions: Mutex<HashMap<i64, SessionChannel>>,
    replay_capacity: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl Hub {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            replay_capacity,
        }
    }

    /// Publishes a line to every live subscriber of `session_id` and
    /// appends it to the replay buffer. A full subscriber channel drops
    /// that subscriber instead of blocking.
    pub async fn publish(&self, session_id: i64, line: String) {
        let mut sessions = self.sessions.lock().await;
        let channel = sessions.entry(session_id).or_insert_with(SessionChannel::new);

        if channel.replay.len() >= self.replay_capacity {
            channel.replay.pop_front();
        }
        channel.replay.push_back(line.clone());

        channel
            .subscribers
            .retain(|tx| tx.try_send(HubMessage::Line(line.clone())).is_ok());
    }

    /// Marks a session finished: sends the `Done` sentinel to every
    /// subscriber and drops the subscriber list. The replay buffer is
    /// kept so a late subscriber still sees catch-up followed by `Done`.
    pub async fn finish(&self, session_id: i64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(channel) = sessions.get_mut(&session_id) {
            channel.finished = true;
            for tx in channel.subscribers.drain(..) {
                let _ = tx.try_send(HubMessage::Done);
            }
        }
    }

    /// Subscribes to a session: returns the current replay buffer plus a
    /// receiver for subsequent live messages. If the session already
    /// finished, the receiver is immediately closed after replay.
    pub async fn subscribe(&self, session_id: i64) -> (Vec<String>, mpsc::Receiver<HubMessage>) {
        let mut sessions = self.sessions.lock().await;
        let channel = sessions.entry(session_id).or_insert_with(SessionChannel::new);

        let replay: Vec<String> = channel.replay.iter().cloned().collect();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        if channel.finished {
            let _ = tx.try_send(HubMessage::Done);
        } else {
            channel.subscribers.push(tx);
        }

        (replay, rx)
    }

    /// Drops all bookkeeping for a session once its results are no
    /// longer needed (e.g. after the dashboard has shown the final state
    /// for a while). Not called automatically; operators may wire this
    /// to a periodic sweep if memory pressure ever warrants it.
    pub async fn evict(&self, session_id: i64) {
        self.sessions.lock().await.remove(&session_id);
    }
}

pub type SharedHub = Arc<Hub>;
