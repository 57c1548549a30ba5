//! A single topic's log

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use roomsync_core::transport::{DeliverPolicy, Headers};
use roomsync_core::{Entry, Subscription, TransportError};
use std::collections::VecDeque;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone)]
enum LiveEvent {
    Entry(Entry),
    Severed,
}

struct TopicState {
    entries: VecDeque<Entry>,
    next_sequence: u64,
    payload_bytes: usize,
}

/// Outcome of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Appended {
    pub sequence: u64,
    /// Entries dropped by rollup or retention
    pub purged: usize,
}

pub(crate) struct TopicLog {
    state: Mutex<TopicState>,
    live: broadcast::Sender<LiveEvent>,
}

impl TopicLog {
    pub fn new(live_buffer: usize) -> Self {
        let (live, _) = broadcast::channel(live_buffer.max(1));
        Self {
            state: Mutex::new(TopicState {
                entries: VecDeque::new(),
                next_sequence: 1,
                payload_bytes: 0,
            }),
            live,
        }
    }

    /// Append an entry; with `rollup` every earlier entry is purged
    pub fn append(&self, payload: Bytes, headers: Headers, rollup: bool, max_entries: Option<usize>) -> Appended {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let mut purged = 0;
        if rollup {
            purged = state.entries.len();
            state.entries.clear();
            state.payload_bytes = 0;
        }

        let entry = Entry {
            sequence,
            payload,
            headers,
        };
        state.payload_bytes += entry.payload.len();
        state.entries.push_back(entry.clone());

        if let Some(max) = max_entries {
            while state.entries.len() > max.max(1) {
                if let Some(oldest) = state.entries.pop_front() {
                    state.payload_bytes -= oldest.payload.len();
                    purged += 1;
                }
            }
        }

        // Sent under the state lock so `open` never sees an entry twice
        let _ = self.live.send(LiveEvent::Entry(entry));

        Appended { sequence, purged }
    }

    /// Replay retained entries matching `policy`, then follow live appends
    pub fn open(&self, policy: DeliverPolicy) -> Subscription {
        let from = match policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::FromSequence(sequence) => sequence,
        };

        let (backlog, receiver) = {
            let state = self.state.lock();
            let backlog: Vec<Entry> = state
                .entries
                .iter()
                .filter(|entry| entry.sequence >= from)
                .cloned()
                .collect();
            (backlog, self.live.subscribe())
        };

        let live = stream::unfold(Some(receiver), move |receiver| async move {
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok(LiveEvent::Entry(entry)) if entry.sequence < from => continue,
                    Ok(LiveEvent::Entry(entry)) => return Some((Ok(entry), Some(receiver))),
                    Ok(LiveEvent::Severed) => {
                        return Some((Err(TransportError::ConnectionLost("log severed".into())), None));
                    }
                    Err(RecvError::Lagged(missed)) => return Some((Err(TransportError::Lagged(missed)), None)),
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed()
    }

    /// Newest retained entry carrying `header`
    pub fn last_marked(&self, header: &str) -> Option<u64> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .rev()
            .find(|entry| entry.headers.contains(header))
            .map(|entry| entry.sequence)
    }

    /// End every live subscription with `ConnectionLost`
    pub fn sever(&self) -> usize {
        self.live.send(LiveEvent::Severed).unwrap_or(0)
    }

    /// (retained entries, retained payload bytes)
    pub fn usage(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.entries.len(), state.payload_bytes)
    }
}
