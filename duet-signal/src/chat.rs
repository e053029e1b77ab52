//! Bounded in-memory chat history.
//!
//! Each chat envelope is kept under its sender and its recipients, so an
//! endpoint rejoining after a reconnect gets back the conversation it took
//! part in and nothing else.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

use crate::protocol::{Envelope, Identity};

pub struct ChatHistory {
    capacity: usize,
    entries: Mutex<HashMap<Identity, VecDeque<Envelope>>>,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Remember `envelope` for its sender and every identity in `recipients`.
    pub async fn record(&self, envelope: &Envelope, recipients: &[Identity]) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        let parties = std::iter::once(&envelope.from).chain(recipients.iter());
        for party in parties {
            let log = entries.entry(party.clone()).or_default();
            if log.len() == self.capacity {
                log.pop_front();
            }
            log.push_back(envelope.clone());
        }
    }

    /// Oldest first.
    pub async fn recent(&self, identity: &Identity) -> Vec<Envelope> {
        let entries = self.entries.lock().await;
        entries
            .get(identity)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }
}
