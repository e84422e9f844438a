//! Bounded arbiter for one scarce hardware block.
//!
//! Clients first request a handle (non-blocking, at most `max_clients`
//! outstanding), then acquire the resource with that handle. Acquisition
//! waits at most the configured timeout. At any instant the resource is held
//! by at most one handle, and handles that are not currently issued can never
//! acquire it.
//!
//! Protocol violations (unknown handles, releasing without holding,
//! returning while holding) are logged and reported as typed errors; they
//! never corrupt the handle table.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default number of concurrently issued client handles
pub const DEFAULT_MAX_CLIENTS: usize = 2;

/// Default bound on `acquire_resource`
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Opaque token issued by [`ResourceArbiter::request_client`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClientHandle(pub u32);

impl ClientHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("{0} is not an issued client handle")]
    UnknownClient(ClientHandle),

    #[error("[{name}] {client} timed out after {waited:?} waiting for the resource")]
    Timeout {
        name: String,
        client: ClientHandle,
        waited: Duration,
    },

    #[error("{client} does not hold the resource (holder: {holder:?})")]
    NotHolder {
        client: ClientHandle,
        holder: Option<ClientHandle>,
    },

    #[error("[{name}] all {max_clients} client handles are in use")]
    NoClientAvailable { name: String, max_clients: usize },
}

pub type ArbiterResult<T> = std::result::Result<T, ArbiterError>;

struct ArbiterState {
    issued: Vec<bool>,
    holder: Option<ClientHandle>,
}

impl ArbiterState {
    fn is_issued(&self, client: ClientHandle) -> bool {
        self.issued.get(client.index()).copied().unwrap_or(false)
    }
}

/// Hands out a fixed number of client handles and gates exclusive use of the
/// resource between them.
pub struct ResourceArbiter {
    name: String,
    timeout: Duration,
    state: Mutex<ArbiterState>,
    released: Condvar,
}

impl ResourceArbiter {
    /// Arbiter with [`DEFAULT_MAX_CLIENTS`] handles. `name` is only used in logs.
    pub fn create(name: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Self::with_capacity(name, timeout, DEFAULT_MAX_CLIENTS)
    }

    pub fn with_capacity(name: impl Into<String>, timeout: Duration, max_clients: usize) -> Arc<Self> {
        let name = name.into();
        let max_clients = max_clients.max(1);
        tracing::debug!(
            "[ResCon][{}] created: {} clients, timeout {:?}",
            name,
            max_clients,
            timeout
        );
        Arc::new(Self {
            name,
            timeout,
            state: Mutex::new(ArbiterState {
                issued: vec![false; max_clients],
                holder: None,
            }),
            released: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_clients(&self) -> usize {
        self.lock().issued.len()
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue the lowest free handle, or `None` once all are out. Never blocks.
    pub fn request_client(&self) -> Option<ClientHandle> {
        let mut state = self.lock();
        let slot = state.issued.iter().position(|issued| !issued)?;
        state.issued[slot] = true;
        let client = ClientHandle(slot as u32);
        tracing::debug!("[ResCon][{}] {} requested", self.name, client);
        Some(client)
    }

    /// Invalidate a handle. Returning a handle that still holds the resource
    /// releases the resource first.
    pub fn return_client(&self, client: ClientHandle) -> ArbiterResult<()> {
        let mut state = self.lock();
        if !state.is_issued(client) {
            tracing::warn!("[ResCon][{}] cannot return {}: not issued", self.name, client);
            return Err(ArbiterError::UnknownClient(client));
        }

        if state.holder == Some(client) {
            tracing::warn!(
                "[ResCon][{}] {} returned while holding the resource, releasing it",
                self.name,
                client
            );
            state.holder = None;
        }
        state.issued[client.index()] = false;
        drop(state);

        // Waiters re-check both the holder and whether their handle is still issued.
        self.released.notify_all();
        tracing::debug!("[ResCon][{}] {} returned", self.name, client);
        Ok(())
    }

    /// Wait up to the configured timeout for exclusive use of the resource.
    pub fn acquire_resource(&self, client: ClientHandle) -> ArbiterResult<()> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut state = self.lock();

        if !state.is_issued(client) {
            tracing::warn!("[ResCon][{}] cannot acquire with {}: not issued", self.name, client);
            return Err(ArbiterError::UnknownClient(client));
        }
        if state.holder == Some(client) {
            tracing::debug!("[ResCon][{}] {} already holds the resource", self.name, client);
            return Ok(());
        }

        while state.holder.is_some() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "[ResCon][{}] {} cannot acquire: held by {:?} for longer than {:?}",
                    self.name,
                    client,
                    state.holder,
                    self.timeout
                );
                return Err(ArbiterError::Timeout {
                    name: self.name.clone(),
                    client,
                    waited: now - start,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if !state.is_issued(client) {
                tracing::warn!(
                    "[ResCon][{}] {} was returned while waiting to acquire",
                    self.name,
                    client
                );
                return Err(ArbiterError::UnknownClient(client));
            }
        }

        state.holder = Some(client);
        tracing::debug!(
            "[ResCon][{}] {} acquired after {:?}",
            self.name,
            client,
            start.elapsed()
        );
        Ok(())
    }

    /// Release the resource. Only the current holder may do so.
    pub fn release_resource(&self, client: ClientHandle) -> ArbiterResult<()> {
        let mut state = self.lock();
        if state.holder != Some(client) {
            tracing::warn!(
                "[ResCon][{}] {} cannot release: holder is {:?}",
                self.name,
                client,
                state.holder
            );
            return Err(ArbiterError::NotHolder {
                client,
                holder: state.holder,
            });
        }
        state.holder = None;
        drop(state);

        self.released.notify_all();
        tracing::debug!("[ResCon][{}] {} released", self.name, client);
        Ok(())
    }

    /// Request a handle and acquire the resource with it. The returned lease
    /// releases the resource and returns the handle when dropped.
    pub fn lease(self: &Arc<Self>) -> ArbiterResult<ResourceLease> {
        let client = self
            .request_client()
            .ok_or_else(|| ArbiterError::NoClientAvailable {
                name: self.name.clone(),
                max_clients: self.max_clients(),
            })?;

        if let Err(e) = self.acquire_resource(client) {
            if let Err(returned) = self.return_client(client) {
                tracing::warn!("Lease failed: {}", returned);
            }
            return Err(e);
        }

        Ok(ResourceLease {
            arbiter: Arc::clone(self),
            client,
        })
    }

    pub fn holder(&self) -> Option<ClientHandle> {
        self.lock().holder
    }

    pub fn issued_count(&self) -> usize {
        self.lock().issued.iter().filter(|issued| **issued).count()
    }
}

/// Held resource plus its client handle; both are given back on drop.
pub struct ResourceLease {
    arbiter: Arc<ResourceArbiter>,
    client: ClientHandle,
}

impl ResourceLease {
    pub fn client(&self) -> ClientHandle {
        self.client
    }
}

impl fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("arbiter", &self.arbiter.name)
            .field("client", &self.client)
            .finish()
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Err(e) = self.arbiter.release_resource(self.client) {
            tracing::warn!("Lease drop: {}", e);
        }
        if let Err(e) = self.arbiter.return_client(self.client) {
            tracing::warn!("Lease drop: {}", e);
        }
    }
}
