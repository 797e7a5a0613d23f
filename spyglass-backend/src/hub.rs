//! Fan-out broadcaster for push subscribers.
//!
//! Producers (probe engine, session tracker) enqueue typed events onto a
//! bounded broadcast channel without ever blocking; a dispatcher task fans
//! each event out to every attached subscriber queue. A full queue drops
//! that subscriber's copy of the message and bumps a counter - slow readers
//! are never allowed to stall the probe loop.

use crate::helpers;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat cadence; must stay comfortably under the read deadline.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const MAX_INBOUND_FRAME: usize = 512;
const CONTROL_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServerStatus,
    PlayerJoin,
    PlayerLeave,
    StatsUpdate,
}

/// One push-channel frame.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "server_id", skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<i64>,
    pub data: Value,
    pub timestamp: String,
}

impl Event {
    pub fn new(event_type: EventType, endpoint_id: Option<i64>, data: Value) -> Self {
        Self {
            event_type,
            endpoint_id,
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Default)]
struct HubCounters {
    attached_total: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Aggregate hub metrics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub attached_total: u64,
    pub active: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

struct SubscriberHandle {
    queue: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

type Registry = Arc<RwLock<HashMap<String, SubscriberHandle>>>;

enum Control {
    Attach {
        id: String,
        queue: mpsc::Sender<Event>,
        dropped: Arc<AtomicU64>,
    },
    Detach {
        id: String,
    },
    Shutdown,
}

/// Cloneable handle to the push hub. The hub is passed explicitly to the
/// probe engine and session tracker; there is no ambient global.
#[derive(Clone)]
pub struct Hub {
    broadcast_tx: mpsc::Sender<Event>,
    control_tx: mpsc::Sender<Control>,
    registry: Registry,
    counters: Arc<HubCounters>,
    client_buffer: usize,
}

impl Hub {
    /// Start the dispatcher and return a handle to it.
    pub fn start(broadcast_buffer: usize, client_buffer: usize) -> Hub {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_buffer.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let registry: Registry = Arc::default();
        let counters = Arc::new(HubCounters::default());

        tokio::spawn(dispatch(
            broadcast_rx,
            control_rx,
            Arc::clone(&registry),
            Arc::clone(&counters),
        ));

        Hub {
            broadcast_tx,
            control_tx,
            registry,
            counters,
            client_buffer: client_buffer.max(1),
        }
    }

    /// A hub with no dispatcher behind it; every broadcast is counted as
    /// dropped. Keeps unit tests free of background tasks.
    pub fn null() -> Hub {
        let (broadcast_tx, _) = mpsc::channel(1);
        let (control_tx, _) = mpsc::channel(1);
        Hub {
            broadcast_tx,
            control_tx,
            registry: Arc::default(),
            counters: Arc::default(),
            client_buffer: 1,
        }
    }

    /// Non-blocking enqueue onto the broadcast channel; overflow drops the
    /// event and bumps the counter.
    pub fn broadcast(&self, event: Event) {
        if self.broadcast_tx.try_send(event).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("broadcast queue full, event dropped");
        }
    }

    pub fn server_status(&self, endpoint_id: i64, data: Value) {
        self.broadcast(Event::new(EventType::ServerStatus, Some(endpoint_id), data));
    }

    pub fn player_join(&self, endpoint_id: i64, data: Value) {
        self.broadcast(Event::new(EventType::PlayerJoin, Some(endpoint_id), data));
    }

    pub fn player_leave(&self, endpoint_id: i64, data: Value) {
        self.broadcast(Event::new(EventType::PlayerLeave, Some(endpoint_id), data));
    }

    pub fn stats_update(&self, data: Value) {
        self.broadcast(Event::new(EventType::StatsUpdate, None, data));
    }

    /// Hand a freshly upgraded socket to the hub. Spawns the subscriber's
    /// reader and writer loops; the subscriber lives until either loop hits
    /// an I/O error or the hub shuts down.
    pub async fn attach(&self, socket: WebSocket) {
        let id = helpers::generate_subscriber_id();
        let (queue_tx, queue_rx) = mpsc::channel(self.client_buffer);
        let dropped = Arc::new(AtomicU64::new(0));

        let registration = Control::Attach {
            id: id.clone(),
            queue: queue_tx,
            dropped,
        };
        if self.control_tx.send(registration).await.is_err() {
            // hub already shut down; the socket closes on drop
            return;
        }
        self.counters.attached_total.fetch_add(1, Ordering::Relaxed);

        let (sink, stream) = socket.split();
        tokio::spawn(write_loop(id.clone(), sink, queue_rx, self.control_tx.clone()));
        tokio::spawn(read_loop(id, stream, self.control_tx.clone()));
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            attached_total: self.counters.attached_total.load(Ordering::Relaxed),
            active: self.registry.read().await.len(),
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Detach every subscriber and stop the dispatcher. Subscriber queues
    /// close, writer loops drain and exit.
    pub async fn close(&self) {
        let _ = self.control_tx.send(Control::Shutdown).await;
    }
}

async fn dispatch(
    mut broadcast_rx: mpsc::Receiver<Event>,
    mut control_rx: mpsc::Receiver<Control>,
    registry: Registry,
    counters: Arc<HubCounters>,
) {
    loop {
        tokio::select! {
            Some(control) = control_rx.recv() => match control {
                Control::Attach { id, queue, dropped } => {
                    registry
                        .write()
                        .await
                        .insert(id.clone(), SubscriberHandle { queue, dropped });
                    info!(subscriber = %id, "subscriber attached");
                }
                Control::Detach { id } => {
                    if registry.write().await.remove(&id).is_some() {
                        info!(subscriber = %id, "subscriber detached");
                    }
                }
                Control::Shutdown => break,
            },
            maybe = broadcast_rx.recv() => match maybe {
                Some(event) => fan_out(&registry, &counters, event).await,
                None => break,
            },
        }
    }

    // dropping the queues closes them; writer loops drain and exit
    registry.write().await.clear();
    info!("push hub stopped");
}

/// Deliver one event to every subscriber. The registry is snapshotted under
/// the read lock; enqueues happen outside it and never block.
async fn fan_out(registry: &Registry, counters: &HubCounters, event: Event) {
    let subscribers: Vec<(mpsc::Sender<Event>, Arc<AtomicU64>)> = registry
        .read()
        .await
        .values()
        .map(|sub| (sub.queue.clone(), Arc::clone(&sub.dropped)))
        .collect();

    for (queue, dropped) in subscribers {
        match queue.try_send(event.clone()) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // queue full (or subscriber mid-detach): drop this copy,
                // keep the subscriber
                dropped.fetch_add(1, Ordering::Relaxed);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Drain the outbound queue onto the socket, interleaving heartbeat pings.
async fn write_loop(
    id: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Event>,
    control_tx: mpsc::Sender<Control>,
) {
    let mut heartbeat = interval(PING_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            maybe = queue.recv() => match maybe {
                Some(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(subscriber = %id, "failed to serialize event: {e}");
                            continue;
                        }
                    };
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(frame.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    // queue closed by the dispatcher: polite goodbye
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    let _ = control_tx.send(Control::Detach { id }).await;
}

/// Consume inbound frames. Clients are not expected to send anything
/// meaningful; frames are logged and discarded. Each received frame
/// (heartbeat pongs included) restarts the read deadline.
async fn read_loop(id: String, mut stream: SplitStream<WebSocket>, control_tx: mpsc::Sender<Control>) {
    loop {
        let frame = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(subscriber = %id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Pong(_) => {}
            Message::Ping(_) => {} // answered automatically by the transport
            Message::Close(_) => break,
            Message::Text(text) => {
                if text.len() > MAX_INBOUND_FRAME {
                    warn!(subscriber = %id, len = text.len(), "oversized inbound frame");
                    break;
                }
                debug!(subscriber = %id, "discarding inbound frame");
            }
            Message::Binary(data) => {
                if data.len() > MAX_INBOUND_FRAME {
                    warn!(subscriber = %id, len = data.len(), "oversized inbound frame");
                    break;
                }
                debug!(subscriber = %id, "discarding inbound binary frame");
            }
        }
    }

    let _ = control_tx.send(Control::Detach { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: i64) -> Event {
        Event::new(EventType::PlayerJoin, Some(1), json!({ "seq": n }))
    }

    async fn registry_with_subscriber(
        depth: usize,
    ) -> (Registry, mpsc::Receiver<Event>, Arc<AtomicU64>) {
        let registry: Registry = Arc::default();
        let (tx, rx) = mpsc::channel(depth);
        let dropped = Arc::new(AtomicU64::new(0));
        registry.write().await.insert(
            "sub-test".to_string(),
            SubscriberHandle {
                queue: tx,
                dropped: Arc::clone(&dropped),
            },
        );
        (registry, rx, dropped)
    }

    #[test]
    fn test_event_wire_shape() {
        let frame = serde_json::to_value(Event::new(
            EventType::ServerStatus,
            Some(7),
            json!({"status": "online"}),
        ))
        .unwrap();

        assert_eq!(frame["type"], "server_status");
        assert_eq!(frame["server_id"], 7);
        assert_eq!(frame["data"]["status"], "online");
        assert!(frame["timestamp"].as_str().unwrap().contains('T'));

        // events without an endpoint omit server_id entirely
        let stats = serde_json::to_value(Event::new(EventType::StatsUpdate, None, json!({})))
            .unwrap();
        assert!(stats.get("server_id").is_none());
        assert_eq!(stats["type"], "stats_update");
    }

    #[tokio::test]
    async fn test_backpressure_drops_without_eviction() {
        let counters = HubCounters::default();
        let (registry, mut rx, dropped) = registry_with_subscriber(256).await;

        // fill the queue to its fixed depth
        for n in 0..256 {
            fan_out(&registry, &counters, event(n)).await;
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 0);

        // the 257th message is dropped for this subscriber, which stays attached
        fan_out(&registry, &counters, event(256)).await;
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(registry.read().await.len(), 1);

        // drain two, then a later message that finds space arrives in order
        assert_eq!(rx.recv().await.unwrap().data["seq"], 0);
        assert_eq!(rx.recv().await.unwrap().data["seq"], 1);
        fan_out(&registry, &counters, event(999)).await;

        let mut last = 0;
        while let Ok(ev) = rx.try_recv() {
            last = ev.data["seq"].as_i64().unwrap();
        }
        assert_eq!(last, 999);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(counters.sent.load(Ordering::Relaxed), 257);
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let counters = HubCounters::default();
        let (registry, mut rx, _) = registry_with_subscriber(16).await;

        for n in 0..10 {
            fan_out(&registry, &counters, event(n)).await;
        }
        for n in 0..10 {
            assert_eq!(rx.recv().await.unwrap().data["seq"], n);
        }
    }

    #[tokio::test]
    async fn test_dispatcher_attach_broadcast_shutdown() {
        let hub = Hub::start(1000, 8);
        let (tx, mut rx) = mpsc::channel(8);
        let dropped = Arc::new(AtomicU64::new(0));
        hub.control_tx
            .send(Control::Attach {
                id: "sub-a".to_string(),
                queue: tx,
                dropped,
            })
            .await
            .unwrap();

        hub.player_join(3, json!({"username": "alice"}));
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.event_type, EventType::PlayerJoin);
        assert_eq!(delivered.endpoint_id, Some(3));

        let stats = hub.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.messages_sent, 1);

        hub.close().await;
        // queue closes once the dispatcher clears the registry
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_null_hub_counts_drops() {
        let hub = Hub::null();
        hub.stats_update(json!({}));
        hub.stats_update(json!({}));
        assert_eq!(hub.stats().await.messages_dropped, 2);
    }
}
