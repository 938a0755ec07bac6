mod message;
mod writer;

pub use message::{sse_frame, ws_frame, AckStatus, ChangePayload, ClientMessage, ServerMessage};
pub use writer::{BufferWriter, SubscriptionWriter};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::event::{Event, EventOp};
use crate::filter::matches_filter;
use crate::types::{CancelToken, EntityRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOp {
    Create,
    Update,
    Delete,
    All,
}

impl SubOp {
    fn matches(self, op: EventOp) -> bool {
        match self {
            Self::All => true,
            Self::Create => op == EventOp::Create,
            Self::Update => op == EventOp::Update,
            Self::Delete => op == EventOp::Delete,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeRequest {
    pub ns: String,
    pub filter: Option<JsonValue>,
    /// Empty means all operations.
    pub ops: Vec<SubOp>,
    pub include_state: bool,
    pub resume_after: Option<String>,
    pub max_events_per_second: Option<u32>,
    /// On resume: the subscription id this request replaces, used to look
    /// up the client's cursor in `ResumeRequest::last_event_ids`.
    pub prior_subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Subscription {
    connection_id: String,
    ns: String,
    filter: Option<JsonValue>,
    ops: Vec<SubOp>,
    include_state: bool,
    last_event_id: Option<String>,
    max_events_per_second: Option<u32>,
    rate_window: i64,
    rate_count: u32,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        let op_match = self.ops.is_empty() || self.ops.iter().any(|op| op.matches(event.op));
        if !op_match {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => {
                let state = event.filter_state().cloned().unwrap_or(JsonValue::Null);
                matches_filter(&state, filter)
            }
        }
    }

    /// Per-second admission for rate-limited subscriptions.
    fn admit(&mut self, ts: DateTime<Utc>) -> bool {
        let Some(limit) = self.max_events_per_second else {
            return true;
        };
        let window = ts.timestamp();
        if window != self.rate_window {
            self.rate_window = window;
            self.rate_count = 0;
        }
        if self.rate_count >= limit {
            return false;
        }
        self.rate_count += 1;
        true
    }
}

struct Connection {
    writer: Arc<dyn SubscriptionWriter>,
    last_activity: DateTime<Utc>,
    subscriptions: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionManagerOptions {
    pub max_subscriptions_per_connection: usize,
    pub heartbeat_timeout: Duration,
    /// Retained events for resume replay.
    pub event_retention: usize,
}

impl Default for SubscriptionManagerOptions {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            heartbeat_timeout: Duration::from_secs(30),
            event_retention: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub active_connections: usize,
    pub total_subscriptions: usize,
    pub events_processed: u64,
    pub events_delivered: u64,
    pub events_filtered: u64,
    pub queue_depth: usize,
    pub subscriptions_by_ns: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    pub connection_id: String,
    pub last_event_ids: HashMap<String, String>,
    pub subscriptions: Vec<SubscribeRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeResult {
    pub success: bool,
    pub connection_id: String,
    pub resumed_subscriptions: Vec<String>,
    pub failed_subscriptions: Vec<String>,
    pub missed_events: Vec<String>,
}

#[derive(Default)]
struct ManagerInner {
    connections: HashMap<String, Connection>,
    subscriptions: HashMap<String, Subscription>,
    by_ns: HashMap<String, HashSet<String>>,
    recent_events: VecDeque<Event>,
    events_processed: u64,
    events_delivered: u64,
    events_filtered: u64,
}

/// Registers subscribers, filters events, and fans them out over
/// long-lived writers. Filter evaluation never suspends; sends happen
/// outside the table lock.
pub struct SubscriptionManager {
    options: SubscriptionManagerOptions,
    inner: Mutex<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(options: SubscriptionManagerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    pub async fn add_connection(&self, writer: Arc<dyn SubscriptionWriter>) -> String {
        let connection_id = uuid::Uuid::now_v7().to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connections.insert(
                connection_id.clone(),
                Connection {
                    writer: Arc::clone(&writer),
                    last_activity: Utc::now(),
                    subscriptions: HashSet::new(),
                },
            );
        }
        let _ = writer
            .send(&ServerMessage::Connected {
                connection_id: connection_id.clone(),
            })
            .await;
        connection_id
    }

    pub async fn remove_connection(&self, connection_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(connection) = inner.connections.remove(connection_id) else {
                return;
            };
            for sub_id in &connection.subscriptions {
                if let Some(subscription) = inner.subscriptions.remove(sub_id) {
                    if let Some(ns_subs) = inner.by_ns.get_mut(&subscription.ns) {
                        ns_subs.remove(sub_id);
                        if ns_subs.is_empty() {
                            inner.by_ns.remove(&subscription.ns);
                        }
                    }
                }
            }
            connection.writer
        };
        removed.close().await;
    }

    /// Registers a subscription; None when the connection is at its cap
    /// (an error message is sent to the connection instead).
    pub async fn subscribe(
        &self,
        connection_id: &str,
        request: SubscribeRequest,
    ) -> Option<String> {
        let (writer, at_cap) = {
            let inner = self.inner.lock().unwrap();
            let connection = inner.connections.get(connection_id)?;
            (
                Arc::clone(&connection.writer),
                connection.subscriptions.len() >= self.options.max_subscriptions_per_connection,
            )
        };

        if at_cap {
            let _ = writer
                .send(&ServerMessage::Error {
                    error: "subscription limit reached".to_string(),
                    code: Some("MAX_SUBSCRIPTIONS".to_string()),
                })
                .await;
            return None;
        }

        let subscription_id = uuid::Uuid::now_v7().to_string();
        let ns = request.ns.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            let connection = inner.connections.get_mut(connection_id)?;
            connection.subscriptions.insert(subscription_id.clone());
            inner.subscriptions.insert(
                subscription_id.clone(),
                Subscription {
                    connection_id: connection_id.to_string(),
                    ns: ns.clone(),
                    filter: request.filter,
                    ops: request.ops,
                    include_state: request.include_state,
                    last_event_id: request.resume_after,
                    max_events_per_second: request.max_events_per_second,
                    rate_window: 0,
                    rate_count: 0,
                },
            );
            inner
                .by_ns
                .entry(ns.clone())
                .or_default()
                .insert(subscription_id.clone());
        }

        let _ = writer
            .send(&ServerMessage::Subscribed {
                subscription_id: subscription_id.clone(),
                ns,
            })
            .await;
        Some(subscription_id)
    }

    /// Removes one subscription; unknown ids are a no-op.
    pub async fn unsubscribe(&self, connection_id: &str, subscription_id: &str) {
        let writer = {
            let mut inner = self.inner.lock().unwrap();
            let Some(subscription) = inner.subscriptions.get(subscription_id) else {
                return;
            };
            if subscription.connection_id != connection_id {
                return;
            }
            let ns = subscription.ns.clone();
            inner.subscriptions.remove(subscription_id);
            if let Some(ns_subs) = inner.by_ns.get_mut(&ns) {
                ns_subs.remove(subscription_id);
                if ns_subs.is_empty() {
                    inner.by_ns.remove(&ns);
                }
            }
            match inner.connections.get_mut(connection_id) {
                Some(connection) => {
                    connection.subscriptions.remove(subscription_id);
                    Some(Arc::clone(&connection.writer))
                }
                None => None,
            }
        };
        if let Some(writer) = writer {
            let _ = writer
                .send(&ServerMessage::Unsubscribed {
                    subscription_id: subscription_id.to_string(),
                })
                .await;
        }
    }

    /// Fans one event out to every matching subscription on its
    /// namespace. Writers that fail get their connection removed.
    pub async fn dispatch(&self, event: &Event) {
        let deliveries = {
            let mut inner = self.inner.lock().unwrap();
            inner.events_processed += 1;

            let entity = match EntityRef::parse(&event.target) {
                Ok(entity) => entity,
                Err(_) => {
                    debug!(event_target = event.target.as_str(), "dropping malformed event target");
                    return;
                }
            };

            inner.recent_events.push_back(event.clone());
            while inner.recent_events.len() > self.options.event_retention {
                inner.recent_events.pop_front();
            }

            let sub_ids: Vec<String> = inner
                .by_ns
                .get(&entity.ns)
                .map(|subs| subs.iter().cloned().collect())
                .unwrap_or_default();

            let mut deliveries = Vec::new();
            for sub_id in sub_ids {
                let decision = match inner.subscriptions.get_mut(&sub_id) {
                    None => continue,
                    Some(subscription) => {
                        if subscription.accepts(event) && subscription.admit(event.ts) {
                            Some((
                                subscription.connection_id.clone(),
                                subscription.include_state,
                            ))
                        } else {
                            None
                        }
                    }
                };
                let Some((connection_id, include_state)) = decision else {
                    inner.events_filtered += 1;
                    continue;
                };
                let message = change_message(event, &entity, include_state);
                let Some(connection) = inner.connections.get(&connection_id) else {
                    continue;
                };
                deliveries.push((
                    sub_id.clone(),
                    connection_id,
                    Arc::clone(&connection.writer),
                    message,
                ));
            }
            deliveries
        };

        for (sub_id, connection_id, writer, message) in deliveries {
            match writer.send(&message).await {
                Ok(()) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.events_delivered += 1;
                    if let Some(subscription) = inner.subscriptions.get_mut(&sub_id) {
                        subscription.last_event_id = Some(event.id.clone());
                    }
                }
                Err(_) => {
                    self.remove_connection(&connection_id).await;
                }
            }
        }
    }

    /// Marks a connection as alive (client ping or message received).
    pub fn record_activity(&self, connection_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(connection) = inner.connections.get_mut(connection_id) {
            connection.last_activity = Utc::now();
        }
    }

    /// One heartbeat cycle: ping every live connection, remove stale
    /// ones.
    pub async fn heartbeat_tick(&self, now: DateTime<Utc>) {
        let timeout = chrono::Duration::from_std(self.options.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let (live, stale): (Vec<(String, Arc<dyn SubscriptionWriter>)>, Vec<String>) = {
            let inner = self.inner.lock().unwrap();
            let mut live = Vec::new();
            let mut stale = Vec::new();
            for (id, connection) in &inner.connections {
                if now - connection.last_activity > timeout {
                    stale.push(id.clone());
                } else {
                    live.push((id.clone(), Arc::clone(&connection.writer)));
                }
            }
            (live, stale)
        };

        for id in stale {
            self.remove_connection(&id).await;
        }
        let pong = ServerMessage::Pong {
            ts: now.timestamp_millis(),
        };
        for (id, writer) in live {
            if writer.send(&pong).await.is_err() {
                self.remove_connection(&id).await;
            }
        }
    }

    /// Heartbeat loop; run until cancelled.
    pub async fn run_heartbeat(&self, interval: Duration, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            futures_timer::Delay::new(interval).await;
            self.heartbeat_tick(Utc::now()).await;
        }
    }

    /// Rebuilds a dropped connection: new id, replayed subscriptions, and
    /// retained missed events delivered before new live events.
    pub async fn resume_connection(
        &self,
        writer: Arc<dyn SubscriptionWriter>,
        request: ResumeRequest,
    ) -> ResumeResult {
        let connection_id = self.add_connection(writer).await;
        let mut result = ResumeResult {
            success: true,
            connection_id: connection_id.clone(),
            ..ResumeResult::default()
        };

        for subscription in request.subscriptions {
            let prior_id = subscription.prior_subscription_id.clone();
            let resume_after = subscription.resume_after.clone();
            match self.subscribe(&connection_id, subscription.clone()).await {
                Some(sub_id) => {
                    // `last_event_ids` is keyed by the client's prior
                    // subscription ids; the freshly minted id can never
                    // appear in it.
                    let last_seen = prior_id
                        .as_ref()
                        .and_then(|prior| request.last_event_ids.get(prior))
                        .cloned()
                        .or(resume_after);
                    let missed = self.missed_events(&subscription, last_seen.as_deref());
                    for event in missed {
                        result.missed_events.push(event.id.clone());
                        self.redeliver(&connection_id, &sub_id, &event).await;
                    }
                    result.resumed_subscriptions.push(sub_id);
                }
                None => {
                    result.success = false;
                    result.failed_subscriptions.push(subscription.ns);
                }
            }
        }
        result
    }

    fn missed_events(
        &self,
        subscription: &SubscribeRequest,
        last_seen: Option<&str>,
    ) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        let start = match last_seen {
            None => 0,
            Some(last_id) => inner
                .recent_events
                .iter()
                .position(|event| event.id == last_id)
                .map(|index| index + 1)
                .unwrap_or(0),
        };

        let probe = Subscription {
            connection_id: String::new(),
            ns: subscription.ns.clone(),
            filter: subscription.filter.clone(),
            ops: subscription.ops.clone(),
            include_state: subscription.include_state,
            last_event_id: None,
            max_events_per_second: None,
            rate_window: 0,
            rate_count: 0,
        };

        inner
            .recent_events
            .iter()
            .skip(start)
            .filter(|event| {
                EntityRef::parse(&event.target)
                    .map(|entity| entity.ns == subscription.ns)
                    .unwrap_or(false)
                    && probe.accepts(event)
            })
            .cloned()
            .collect()
    }

    async fn redeliver(&self, connection_id: &str, sub_id: &str, event: &Event) {
        let payload = {
            let inner = self.inner.lock().unwrap();
            let Some(subscription) = inner.subscriptions.get(sub_id) else {
                return;
            };
            let Ok(entity) = EntityRef::parse(&event.target) else {
                return;
            };
            let Some(connection) = inner.connections.get(connection_id) else {
                return;
            };
            Some((
                Arc::clone(&connection.writer),
                change_message(event, &entity, subscription.include_state),
            ))
        };
        if let Some((writer, message)) = payload {
            if writer.send(&message).await.is_ok() {
                let mut inner = self.inner.lock().unwrap();
                inner.events_delivered += 1;
                if let Some(subscription) = inner.subscriptions.get_mut(sub_id) {
                    subscription.last_event_id = Some(event.id.clone());
                }
            }
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        let inner = self.inner.lock().unwrap();
        SubscriptionStats {
            active_connections: inner.connections.len(),
            total_subscriptions: inner.subscriptions.len(),
            events_processed: inner.events_processed,
            events_delivered: inner.events_delivered,
            events_filtered: inner.events_filtered,
            queue_depth: inner.recent_events.len(),
            subscriptions_by_ns: inner
                .by_ns
                .iter()
                .map(|(ns, subs)| (ns.clone(), subs.len()))
                .collect(),
        }
    }
}

fn change_message(event: &Event, entity: &EntityRef, include_state: bool) -> ServerMessage {
    ServerMessage::Change {
        data: Box::new(ChangePayload {
            id: event.id.clone(),
            ts: event.ts,
            op: event.op,
            ns: entity.ns.clone(),
            entity_id: entity.id.clone(),
            full_id: entity.full_id(),
            before: if include_state {
                event.before.clone()
            } else {
                None
            },
            after: if include_state {
                event.after.clone()
            } else {
                None
            },
            actor: Some(event.actor.clone()),
            metadata: event.metadata.clone(),
        }),
    }
}

