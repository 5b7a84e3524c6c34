// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use crate::domain::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::types::{ConnectionId, JobId, JobState};
use alloy::primitives::B256;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    Unhealthy,
    Idle,
    Shutdown,
}

/// Lifecycle notifications. Delivery order across subscribers is not guaranteed.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    ConnectionCreated {
        network: String,
        id: ConnectionId,
        endpoint: String,
    },
    ConnectionUnhealthy {
        network: String,
        id: ConnectionId,
        error: String,
    },
    ConnectionRemoved {
        network: String,
        id: ConnectionId,
        reason: RemovalReason,
    },
    GasFallback {
        network: String,
        reason: String,
    },
    JobStateChanged {
        job: JobId,
        network: String,
        from: JobState,
        to: JobState,
    },
    AttemptStarted {
        job: JobId,
        attempt: u32,
    },
    ReplacementSent {
        job: JobId,
        nonce: u64,
        previous_hash: B256,
        hash: B256,
        previous_fee: u128,
        fee: u128,
    },
    RetryScheduled {
        job: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    JobTerminal {
        job: JobId,
        network: String,
        state: JobState,
        attempts: u32,
        hash: Option<B256>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
