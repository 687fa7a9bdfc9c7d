// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session detach/resume registry.
//!
//! Sessions that arrived with a `sessionId` survive their WebSocket: on
//! disconnect they move from `active` to `detached` with a grace timer,
//! and a reconnect with the same id moves them back and swaps the bound
//! socket. At any instant an id is in at most one of the two maps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::session::{SessionControl, SessionHandle};

struct ActiveEntry {
    handle: SessionHandle,
    connection_id: u64,
}

struct DetachedEntry {
    handle: SessionHandle,
    grace_timer: JoinHandle<()>,
}

pub struct SessionRegistry {
    active: HashMap<String, ActiveEntry>,
    detached: HashMap<String, DetachedEntry>,
    resume_enabled: bool,
    grace_period: Duration,
    metrics: ProxyMetrics,
}

impl SessionRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            active: HashMap::new(),
            detached: HashMap::new(),
            resume_enabled: config.session_resume_enabled,
            grace_period: Duration::from_secs(config.session_resume_grace_period),
            metrics: ProxyMetrics::shared(),
        }
    }

    pub fn has_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn has_detached(&self, id: &str) -> bool {
        self.detached.contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.active.len() + self.detached.len()
    }

    pub fn register(&mut self, id: String, handle: SessionHandle, connection_id: u64) {
        debug_assert!(!self.detached.contains_key(&id));
        self.active.insert(id, ActiveEntry { handle, connection_id });
        self.record_gauge();
    }

    fn record_gauge(&self) {
        self.metrics.sessions_active.record(self.session_count() as u64, &[]);
    }
}

/// Binds a connection to the session for `id`, enforcing the
/// duplicate-connection policy and the resume path:
///
/// - id already active: the existing session is taken over; attaching the
///   new socket force-closes the previous client.
/// - id detached: the grace timer is cancelled and the session resumed.
/// - otherwise: the caller's `create` closure provides a fresh session.
pub async fn bind_session<F>(
    registry: &Arc<Mutex<SessionRegistry>>,
    id: &str,
    connection_id: u64,
    create: F,
) -> SessionHandle
where
    F: FnOnce() -> SessionHandle,
{
    let mut guard = registry.lock().await;

    if let Some(entry) = guard.active.get_mut(id) {
        warn!(session_id = id, "duplicate connection, taking over existing session");
        entry.connection_id = connection_id;
        return entry.handle.clone();
    }

    if let Some(entry) = guard.detached.remove(id) {
        info!(session_id = id, "resuming detached session");
        entry.grace_timer.abort();
        let handle = entry.handle.clone();
        guard
            .active
            .insert(id.to_string(), ActiveEntry { handle: handle.clone(), connection_id });
        guard.metrics.sessions_resumed.add(1, &[]);
        guard.record_gauge();
        return handle;
    }

    let handle = create();
    guard.register(id.to_string(), handle.clone(), connection_id);
    handle
}

/// Handles a client disconnect for a registered session. Stale
/// disconnects (the id was already taken over by a newer connection) are
/// ignored. With resume enabled the session detaches under a grace
/// timer; otherwise it shuts down immediately.
pub async fn handle_disconnect(
    registry: &Arc<Mutex<SessionRegistry>>,
    id: &str,
    connection_id: u64,
) {
    let (handle_to_close, armed) = {
        let mut guard = registry.lock().await;

        let current = guard.active.get(id).map(|entry| entry.connection_id);
        if current != Some(connection_id) {
            debug!(session_id = id, connection_id, "stale disconnect, session already rebound");
            return;
        }

        let entry = match guard.active.remove(id) {
            Some(entry) => entry,
            None => return,
        };

        if guard.resume_enabled {
            let timer = spawn_grace_timer(registry.clone(), id.to_string(), guard.grace_period);
            guard
                .detached
                .insert(id.to_string(), DetachedEntry { handle: entry.handle, grace_timer: timer });
            guard.record_gauge();
            info!(session_id = id, "session detached, awaiting resume");
            (None, true)
        } else {
            guard.record_gauge();
            (Some(entry.handle), false)
        }
    };

    if !armed {
        if let Some(handle) = handle_to_close {
            info!(session_id = id, "closing non-resumable session");
            let _ = handle.control_tx.send(SessionControl::Shutdown).await;
        }
    }
}

fn spawn_grace_timer(
    registry: Arc<Mutex<SessionRegistry>>,
    id: String,
    grace_period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace_period).await;
        let handle = {
            let mut guard = registry.lock().await;
            let entry = guard.detached.remove(&id);
            guard.record_gauge();
            entry.map(|e| e.handle)
        };
        if let Some(handle) = handle {
            info!(session_id = %id, "resume grace period expired, closing session");
            let _ = handle.control_tx.send(SessionControl::Shutdown).await;
        }
    })
}

/// Closes every session, cancelling all grace timers. Used on process
/// shutdown.
pub async fn shutdown(registry: &Arc<Mutex<SessionRegistry>>) {
    let handles = {
        let mut guard = registry.lock().await;
        let mut handles = Vec::new();
        for (_, entry) in guard.active.drain() {
            handles.push(entry.handle);
        }
        for (_, entry) in guard.detached.drain() {
            entry.grace_timer.abort();
            handles.push(entry.handle);
        }
        guard.record_gauge();
        handles
    };
    info!(sessions = handles.len(), "closing all sessions");
    for handle in handles {
        let _ = handle.control_tx.send(SessionControl::Shutdown).await;
    }
}
