//! In-memory transport
//!
//! Single-process stream log with consumer-group semantics: each entry is
//! assigned to one consumer of a group, stays pending until acknowledged, and
//! can be re-read by that consumer via `ReadCursor::Pending`. Used for tests
//! and for running producers and consumers inside one process.
//!
//! Fault injection (`set_reachable`, `fail_next_connects`, `set_status`) lets
//! tests drive the connection-failure paths without a real server.

use super::{ConnectionStatus, GroupRead, Transport};
use crate::error::{BusError, Result};
use crate::retry::RetryStrategy;
use crate::types::{GroupStart, RawEntry, ReadCursor};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Configuration for the in-memory transport
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of the error event channel
    pub error_channel_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            error_channel_capacity: 64,
        }
    }
}

struct StoredEntry {
    id: String,
    body: Bytes,
}

struct PendingInfo {
    consumer: String,
    deliveries: u64,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    next: usize,
    /// Delivered but unacknowledged entries, by index
    pending: BTreeMap<usize, PendingInfo>,
    acked: Vec<String>,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<StoredEntry>,
    index_of: HashMap<String, usize>,
    groups: HashMap<String, GroupState>,
}

struct State {
    streams: HashMap<String, StreamLog>,
    status: ConnectionStatus,
    reachable: bool,
    closed: bool,
    failing_connects: u32,
    next_id: u64,
}

/// In-memory stream transport
pub struct MemoryTransport {
    state: Mutex<State>,
    notify: Notify,
    errors: broadcast::Sender<String>,
    retry: Option<RetryStrategy>,
    append_calls: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryTransport {
    pub fn new(config: MemoryConfig) -> Self {
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        Self {
            state: Mutex::new(State {
                streams: HashMap::new(),
                status: ConnectionStatus::Disconnected,
                reachable: true,
                closed: false,
                failing_connects: 0,
                next_id: 1,
            }),
            notify: Notify::new(),
            errors,
            retry: None,
            append_calls: AtomicU64::new(0),
        }
    }

    /// Use `retry` to pace reconnect attempts in `connect`
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Simulate losing (or regaining) the server
    ///
    /// The self-reported status is left untouched, as a real client's status
    /// lags behind reachability.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        drop(state);
        if !reachable {
            self.emit_error("connection lost: server unreachable");
        }
        self.notify.notify_waiters();
    }

    /// Override the self-reported status
    pub fn set_status(&self, status: ConnectionStatus) {
        self.lock().status = status;
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Number of `append` calls received, successful or not
    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::Relaxed)
    }

    /// Ids acknowledged in `group`, in acknowledgement order
    pub fn acked(&self, key: &str, group: &str) -> Vec<String> {
        let state = self.lock();
        state
            .streams
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    /// Ids delivered in `group` but not yet acknowledged
    pub fn pending(&self, key: &str, group: &str) -> Vec<String> {
        let state = self.lock();
        state
            .streams
            .get(key)
            .and_then(|s| s.groups.get(group).map(|g| (s, g)))
            .map(|(s, g)| g.pending.keys().map(|i| s.entries[*i].id.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_error(&self, message: &str) {
        // No receivers is fine
        let _ = self.errors.send(message.to_string());
    }

    fn usable(state: &State) -> Result<()> {
        if state.closed {
            return Err(BusError::Connection("transport closed".to_string()));
        }
        if !state.reachable {
            return Err(BusError::Connection("server unreachable".to_string()));
        }
        Ok(())
    }

    fn take_batch(state: &mut State, read: &GroupRead<'_>) -> Result<Vec<RawEntry>> {
        Self::usable(state)?;

        let log = state.streams.get_mut(read.key).ok_or_else(|| {
            BusError::Consumer(format!("NOGROUP no such key '{}'", read.key))
        })?;
        let group = log.groups.get_mut(read.group).ok_or_else(|| {
            BusError::Consumer(format!(
                "NOGROUP no such consumer group '{}' for key '{}'",
                read.group, read.key
            ))
        })?;

        let mut batch = Vec::new();
        match read.cursor {
            ReadCursor::Pending => {
                for (index, info) in group.pending.iter_mut() {
                    if batch.len() >= read.count {
                        break;
                    }
                    if info.consumer != read.consumer {
                        continue;
                    }
                    info.deliveries += 1;
                    let entry = &log.entries[*index];
                    batch.push(RawEntry {
                        id: entry.id.clone(),
                        body: entry.body.clone(),
                        delivery_count: info.deliveries,
                    });
                }
            }
            ReadCursor::New => {
                while group.next < log.entries.len() && batch.len() < read.count {
                    let index = group.next;
                    group.next += 1;
                    group.pending.insert(
                        index,
                        PendingInfo {
                            consumer: read.consumer.to_string(),
                            deliveries: 1,
                        },
                    );
                    let entry = &log.entries[index];
                    batch.push(RawEntry {
                        id: entry.id.clone(),
                        body: entry.body.clone(),
                        delivery_count: 1,
                    });
                }
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BusError::Connection("transport closed".to_string()));
            }
            if state.status == ConnectionStatus::Disconnected {
                state.status = ConnectionStatus::Connecting;
            }
        }

        loop {
            let failed = {
                let mut state = self.lock();
                if state.closed {
                    return Err(BusError::Connection("transport closed".to_string()));
                }
                if state.failing_connects > 0 {
                    state.failing_connects -= 1;
                    state.status = ConnectionStatus::Reconnecting;
                    true
                } else {
                    state.status = ConnectionStatus::Ready;
                    state.reachable = true;
                    false
                }
            };

            if !failed {
                if let Some(retry) = &self.retry {
                    retry.on_connected();
                }
                tracing::info!(attempts = attempt + 1, "Connected to in-memory transport");
                return Ok(());
            }

            attempt += 1;
            self.emit_error("connect failed: connection refused");
            let delay = self
                .retry
                .as_ref()
                .map(|r| r.delay_for(attempt))
                .unwrap_or(Duration::ZERO);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Connect failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn append(&self, key: &str, body: Bytes) -> Result<String> {
        self.append_calls.fetch_add(1, Ordering::Relaxed);

        let id = {
            let mut state = self.lock();
            Self::usable(&state).map_err(|e| BusError::Publish {
                stream: key.to_string(),
                reason: e.to_string(),
            })?;

            let id = format!("{}-0", state.next_id);
            state.next_id += 1;

            let log = state.streams.entry(key.to_string()).or_default();
            log.index_of.insert(id.clone(), log.entries.len());
            log.entries.push(StoredEntry {
                id: id.clone(),
                body,
            });
            id
        };

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, key: &str, group: &str, start: GroupStart) -> Result<()> {
        let mut state = self.lock();
        Self::usable(&state)?;

        let log = state.streams.entry(key.to_string()).or_default();
        if log.groups.contains_key(group) {
            tracing::debug!(stream = key, group, "Consumer group already exists");
            return Ok(());
        }

        let next = match start {
            GroupStart::Beginning => 0,
            GroupStart::New => log.entries.len(),
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                next,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<RawEntry>> {
        let deadline = tokio::time::Instant::now() + read.block;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let batch = Self::take_batch(&mut state, read)?;
                if !batch.is_empty() || read.cursor == ReadCursor::Pending {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut state = self.lock();
        Self::usable(&state).map_err(|e| BusError::Ack(e.to_string()))?;

        let Some(log) = state.streams.get_mut(key) else {
            return Ok(0);
        };
        let Some(group_state) = log.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if let Some(index) = log.index_of.get(id) {
                if group_state.pending.remove(index).is_some() {
                    group_state.acked.push(id.clone());
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn stream_len(&self, key: &str) -> Result<u64> {
        let state = self.lock();
        Self::usable(&state)?;
        Ok(state
            .streams
            .get(key)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let state = self.lock();
        Self::usable(&state)
    }

    fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.force_close();
        Ok(())
    }

    fn force_close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.status = ConnectionStatus::Closed;
        }
        self.notify.notify_waiters();
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerTier};
    use std::sync::Arc;

    fn read<'a>(group: &'a str, consumer: &'a str, cursor: ReadCursor, block_ms: u64) -> GroupRead<'a> {
        GroupRead {
            key: "test:stream",
            group,
            consumer,
            cursor,
            count: 10,
            block: Duration::from_millis(block_ms),
        }
    }

    async fn connected() -> MemoryTransport {
        let t = MemoryTransport::default();
        t.connect().await.unwrap();
        t
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let t = connected().await;
        let a = t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        let b = t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(a, "1-0");
        assert_eq!(b, "2-0");
        assert_eq!(t.stream_len("test:stream").await.unwrap(), 2);
        assert_eq!(t.append_calls(), 2);
    }

    #[tokio::test]
    async fn test_group_delivers_each_entry_once() {
        let t = connected().await;
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();
        for _ in 0..3 {
            t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        }

        let first = t.read_group(&GroupRead { count: 2, ..read("g", "c1", ReadCursor::New, 0) }).await.unwrap();
        let second = t.read_group(&read("g", "c2", ReadCursor::New, 0)).await.unwrap();

        assert_eq!(first.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["1-0", "2-0"]);
        assert_eq!(second.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["3-0"]);
        assert_eq!(t.pending("test:stream", "g").len(), 3);
    }

    #[tokio::test]
    async fn test_group_start_new_skips_history() {
        let t = connected().await;
        t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        t.ensure_group("test:stream", "g", GroupStart::New).await.unwrap();

        assert!(t.read_group(&read("g", "c", ReadCursor::New, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_and_pending_redelivery() {
        let t = connected().await;
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();
        let id1 = t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        let id2 = t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        t.read_group(&read("g", "c1", ReadCursor::New, 0)).await.unwrap();

        assert_eq!(t.ack("test:stream", "g", &[id1.clone()]).await.unwrap(), 1);
        assert_eq!(t.ack("test:stream", "g", &[id1.clone()]).await.unwrap(), 0);
        assert_eq!(t.acked("test:stream", "g"), vec![id1]);

        let other = t.read_group(&read("g", "c2", ReadCursor::Pending, 0)).await.unwrap();
        assert!(other.is_empty());

        let replay = t.read_group(&read("g", "c1", ReadCursor::Pending, 0)).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, id2);
        assert_eq!(replay[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let t = connected().await;
        t.append("test:stream", Bytes::from_static(b"{}")).await.unwrap();
        let err = t.read_group(&read("missing", "c", ReadCursor::New, 0)).await.unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let t = connected().await;
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();

        let start = tokio::time::Instant::now();
        let batch = t.read_group(&read("g", "c", ReadCursor::New, 500)).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let t = Arc::new(connected().await);
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();

        let reader = {
            let t = t.clone();
            tokio::spawn(async move { t.read_group(&read("g", "c", ReadCursor::New, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.append("test:stream", Bytes::from_static(b"{\"x\":1}")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_force_close_interrupts_blocked_read() {
        let t = Arc::new(connected().await);
        t.ensure_group("test:stream", "g", GroupStart::Beginning).await.unwrap();

        let reader = {
            let t = t.clone();
            tokio::spawn(async move { t.read_group(&read("g", "c", ReadCursor::New, 60_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.force_close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(t.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_fails_ops_and_emits_error() {
        let t = connected().await;
        let mut errors = t.subscribe_errors();

        t.set_reachable(false);
        assert!(t.ping().await.is_err());
        assert!(t.append("test:stream", Bytes::new()).await.is_err());
        assert_eq!(t.status(), ConnectionStatus::Ready);
        assert!(errors.recv().await.unwrap().contains("unreachable"));

        t.set_reachable(true);
        assert!(t.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_through_breaker() {
        let breakers = Arc::new(BreakerRegistry::new());
        let retry = RetryStrategy::new(breakers.clone(), "memory://test", BreakerConfig::default());
        let t = MemoryTransport::default().with_retry(retry);
        t.fail_next_connects(7);

        let start = tokio::time::Instant::now();
        t.connect().await.unwrap();

        // 200+400+800+1600+3200 ms short tier, then two Open-tier waits
        assert!(start.elapsed() >= Duration::from_millis(6_200 + 120_000));
        assert_eq!(t.status(), ConnectionStatus::Ready);

        let breaker = breakers.get("memory://test").unwrap();
        assert_eq!(breaker.tier(), BreakerTier::Closed);
        assert_eq!(breaker.state().consecutive_failures, 0);
    }
}
