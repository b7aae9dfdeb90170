//! Per-server cache of validated bridges.
//!
//! Each server uuid owns a bucket of idle bridges and an in-use counter. A bucket
//! never holds more than `max_conn_per_server` bridges in total (idle + in use);
//! callers that hit the limit get [`CairnError::MaxConnectionsExceeded`] right away
//! and are expected to try another server.

use crate::bridge::{Bridge, BridgeOptions};
use crate::buffer::BufferPool;
use crate::member::ServerDescriptor;
use crate::{CairnError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Bucket {
    idle: Vec<Bridge>,
    in_use: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
}

pub struct ConnectionPool {
    max_conn_per_server: usize,
    options: Arc<BridgeOptions>,
    buffers: Arc<BufferPool>,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl ConnectionPool {
    pub fn new(
        max_conn_per_server: usize,
        options: BridgeOptions,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            max_conn_per_server: max_conn_per_server.max(1),
            options: Arc::new(options),
            buffers,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_conn_per_server(&self) -> usize {
        self.max_conn_per_server
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Check out a validated bridge to `server`, reusing an idle one when possible.
    /// Idle bridges whose peer has hung up are destroyed on the way.
    pub async fn get(&self, server: &ServerDescriptor) -> Result<Bridge> {
        let bucket = self.bucket(&server.uuid);
        {
            let mut guard = lock(&bucket);
            while let Some(bridge) = guard.idle.pop() {
                if bridge.is_reusable() && bridge.is_peer_alive() {
                    guard.in_use += 1;
                    tracing::debug!("reusing idle bridge to {}", server.uuid);
                    return Ok(bridge);
                }
                tracing::debug!("idle bridge to {} went stale, dropping it", server.uuid);
                bridge.destroy();
            }

            if guard.in_use + guard.idle.len() >= self.max_conn_per_server {
                tracing::warn!(
                    "connection limit {} reached for {} ({})",
                    self.max_conn_per_server,
                    server.access_addr(),
                    server.uuid
                );
                return Err(CairnError::MaxConnectionsExceeded {
                    server: server.uuid.clone(),
                });
            }
            guard.in_use += 1;
        }

        // Released on every exit path unless the new bridge is handed out.
        let reservation = Reservation {
            bucket: Arc::clone(&bucket),
            armed: true,
        };

        let mut bridge = Bridge::new(
            server.clone(),
            Arc::clone(&self.options),
            Arc::clone(&self.buffers),
        );
        let established = async {
            bridge.connect().await?;
            bridge.validate().await?;
            Ok::<(), CairnError>(())
        }
        .await;

        match established {
            Ok(()) => {
                reservation.disarm();
                Ok(bridge)
            }
            Err(error) => {
                tracing::warn!(
                    "failed to establish bridge to {} ({}): {}",
                    server.access_addr(),
                    server.uuid,
                    error
                );
                bridge.destroy();
                Err(error)
            }
        }
    }

    /// Give a bridge back after a clean exchange. Bridges that are not actually
    /// reusable are destroyed instead.
    pub fn return_healthy(&self, server: &ServerDescriptor, bridge: Bridge) {
        let bucket = self.bucket(&server.uuid);
        let mut guard = lock(&bucket);
        guard.in_use = guard.in_use.saturating_sub(1);

        if bridge.is_reusable() && guard.in_use + guard.idle.len() < self.max_conn_per_server {
            guard.idle.push(bridge);
        } else {
            tracing::debug!("bridge to {} is not reusable, destroying", server.uuid);
            bridge.destroy();
        }
    }

    pub fn return_broken(&self, server: &ServerDescriptor, bridge: Bridge) {
        let bucket = self.bucket(&server.uuid);
        let mut guard = lock(&bucket);
        guard.in_use = guard.in_use.saturating_sub(1);
        drop(guard);

        tracing::debug!("returning broken bridge to {}", server.uuid);
        bridge.destroy();
    }

    pub fn stats(&self, uuid: &str) -> PoolStats {
        let buckets = lock(&self.buckets);
        match buckets.get(uuid) {
            Some(bucket) => {
                let guard = lock(bucket);
                PoolStats {
                    in_use: guard.in_use,
                    idle: guard.idle.len(),
                }
            }
            None => PoolStats::default(),
        }
    }

    /// Drop every idle bridge. Checked-out bridges are unaffected.
    pub fn clear_idle(&self) {
        let buckets: Vec<_> = lock(&self.buckets).values().cloned().collect();
        for bucket in buckets {
            let idle = std::mem::take(&mut lock(&bucket).idle);
            idle.into_iter().for_each(Bridge::destroy);
        }
    }

    fn bucket(&self, uuid: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = lock(&self.buckets);
        Arc::clone(buckets.entry(uuid.to_string()).or_default())
    }
}

struct Reservation {
    bucket: Arc<Mutex<Bucket>>,
    armed: bool,
}

impl Reservation {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut guard = lock(&self.bucket);
            guard.in_use = guard.in_use.saturating_sub(1);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
