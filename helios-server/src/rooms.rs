//! Room broker: declarations, subscriptions, and broadcast fan-out.
//!
//! Rooms are declared up front: an exact public topic, or a protected
//! pattern guarded by a validator. Subscription state lives in a strictly
//! paired set of indexes (connection to topics, topic to connections)
//! mutated under one mutex so readers never observe them out of step.
//! Undeclared topics are denied by default.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use helios_protocol::{match_topic, specificity};

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::dispatch::HandlerContext;
use crate::error::{DeclareError, HandlerError, SubscribeError};
use crate::events::{ServerEvent, ServerEvents};

/// Room access kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Exact topic, open to every connection.
    Public,
    /// Pattern over the topic namespace, gated by a validator.
    Protected,
}

/// Decides whether a connection may join a protected room. `captures`
/// holds the wildcard captures of the matched pattern, in order; `data`
/// is whatever the subscriber attached to the request.
#[async_trait]
pub trait RoomValidator: Send + Sync {
    async fn validate(
        &self,
        ctx: &HandlerContext,
        captures: &[String],
        data: Option<&Value>,
    ) -> Result<bool, HandlerError>;
}

struct FnRoomValidator<F>(F);

#[async_trait]
impl<F, Fut> RoomValidator for FnRoomValidator<F>
where
    F: Fn(HandlerContext, Vec<String>, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    async fn validate(
        &self,
        ctx: &HandlerContext,
        captures: &[String],
        data: Option<&Value>,
    ) -> Result<bool, HandlerError> {
        (self.0)(ctx.clone(), captures.to_vec(), data.cloned()).await
    }
}

/// Wraps an async closure as a [`RoomValidator`].
pub fn validator_fn<F, Fut>(f: F) -> Arc<dyn RoomValidator>
where
    F: Fn(HandlerContext, Vec<String>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    Arc::new(FnRoomValidator(f))
}

struct ProtectedRoom {
    pattern: String,
    validator: Arc<dyn RoomValidator>,
    specificity: u32,
}

#[derive(Default)]
struct Declarations {
    public: HashSet<String>,
    /// Sorted by specificity descending; stable sort keeps declaration
    /// order for ties.
    protected: Vec<ProtectedRoom>,
}

struct Membership {
    conn: Weak<Connection>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct SubscriptionIndexes {
    by_connection: HashMap<ConnectionId, Membership>,
    by_topic: HashMap<String, HashSet<ConnectionId>>,
}

/// Counts from one broadcast: every subscriber the topic resolved to,
/// and how many were actually written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub targets: usize,
    pub sent: usize,
}

struct ResolvedRoom {
    validator: Option<Arc<dyn RoomValidator>>,
    captures: Vec<String>,
}

/// Declared rooms plus the paired subscription indexes.
pub struct RoomBroker {
    declarations: Mutex<Declarations>,
    indexes: Mutex<SubscriptionIndexes>,
    events: ServerEvents,
}

impl RoomBroker {
    pub(crate) fn new(events: ServerEvents) -> Self {
        Self {
            declarations: Mutex::new(Declarations::default()),
            indexes: Mutex::new(SubscriptionIndexes::default()),
            events,
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Declarations
    // ────────────────────────────────────────────────────────────────

    /// Declares a room. Raises synchronously on malformed input: empty
    /// patterns, wildcards in public rooms, protected rooms without a
    /// validator.
    pub fn declare(
        &self,
        pattern: &str,
        kind: RoomKind,
        validator: Option<Arc<dyn RoomValidator>>,
    ) -> Result<&Self, DeclareError> {
        if pattern.is_empty() {
            return Err(DeclareError::EmptyPattern);
        }
        match kind {
            RoomKind::Public => {
                if pattern.contains('*') || pattern.contains('+') {
                    return Err(DeclareError::WildcardInPublicRoom(pattern.to_string()));
                }
                self.declarations
                    .lock()
                    .unwrap()
                    .public
                    .insert(pattern.to_string());
            }
            RoomKind::Protected => {
                let validator =
                    validator.ok_or_else(|| DeclareError::MissingValidator(pattern.to_string()))?;
                let mut declarations = self.declarations.lock().unwrap();
                declarations.protected.push(ProtectedRoom {
                    pattern: pattern.to_string(),
                    validator,
                    specificity: specificity(pattern),
                });
                declarations
                    .protected
                    .sort_by(|a, b| b.specificity.cmp(&a.specificity));
            }
        }
        Ok(self)
    }

    /// Declares an exact public room.
    pub fn declare_public(&self, pattern: &str) -> Result<&Self, DeclareError> {
        self.declare(pattern, RoomKind::Public, None)
    }

    /// Declares a protected room over a pattern.
    pub fn declare_protected(
        &self,
        pattern: &str,
        validator: Arc<dyn RoomValidator>,
    ) -> Result<&Self, DeclareError> {
        self.declare(pattern, RoomKind::Protected, Some(validator))
    }

    /// Exact public match wins; otherwise the most specific matching
    /// protected pattern (declaration order breaks ties).
    fn find_room_config(&self, topic: &str) -> Option<ResolvedRoom> {
        let declarations = self.declarations.lock().unwrap();
        if declarations.public.contains(topic) {
            return Some(ResolvedRoom {
                validator: None,
                captures: Vec::new(),
            });
        }
        declarations.protected.iter().find_map(|room| {
            match_topic(topic, &room.pattern).map(|captures| ResolvedRoom {
                validator: Some(room.validator.clone()),
                captures,
            })
        })
    }

    // ────────────────────────────────────────────────────────────────
    // Subscriptions
    // ────────────────────────────────────────────────────────────────

    /// Subscribes a connection to a concrete topic. Denied outcomes come
    /// back as structured errors, never panics or raises.
    pub async fn subscribe(
        &self,
        conn: &Arc<Connection>,
        topic: &str,
        data: Option<&Value>,
    ) -> Result<(), SubscribeError> {
        let resolved = self
            .find_room_config(topic)
            .ok_or(SubscribeError::RoomUndeclared)?;

        if let Some(validator) = resolved.validator {
            let ctx = HandlerContext {
                connection: conn.clone(),
            };
            match validator.validate(&ctx, &resolved.captures, data).await {
                Ok(true) => {}
                Ok(false) => return Err(SubscribeError::PermissionDenied),
                Err(err) => {
                    warn!(connection = %conn.id(), topic, "room validator failed: {err}");
                    return Err(SubscribeError::ValidatorError);
                }
            }
        }

        {
            let mut indexes = self.indexes.lock().unwrap();
            let membership = indexes
                .by_connection
                .entry(conn.id())
                .or_insert_with(|| Membership {
                    conn: Arc::downgrade(conn),
                    topics: HashSet::new(),
                });
            membership.topics.insert(topic.to_string());
            indexes
                .by_topic
                .entry(topic.to_string())
                .or_default()
                .insert(conn.id());
        }
        conn.add_subscription(topic);

        debug!(connection = %conn.id(), topic, "subscribed");
        self.events.publish(ServerEvent::RoomSubscribed {
            connection: conn.clone(),
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Removes the pair from both indexes. Returns whether anything was
    /// removed; empty sets are deleted.
    pub fn unsubscribe(&self, conn: &Arc<Connection>, topic: &str) -> bool {
        let removed = {
            let mut indexes = self.indexes.lock().unwrap();
            let mut removed = false;
            if let Some(membership) = indexes.by_connection.get_mut(&conn.id()) {
                removed = membership.topics.remove(topic);
                if membership.topics.is_empty() {
                    indexes.by_connection.remove(&conn.id());
                }
            }
            if let Some(subscribers) = indexes.by_topic.get_mut(topic) {
                subscribers.remove(&conn.id());
                if subscribers.is_empty() {
                    indexes.by_topic.remove(topic);
                }
            }
            removed
        };
        conn.remove_subscription(topic);

        if removed {
            self.events.publish(ServerEvent::RoomUnsubscribed {
                connection: conn.clone(),
                topic: topic.to_string(),
            });
        }
        removed
    }

    /// Removes every pair referencing the connection.
    pub(crate) fn cleanup(&self, conn: &Arc<Connection>) {
        let mut indexes = self.indexes.lock().unwrap();
        if let Some(membership) = indexes.by_connection.remove(&conn.id()) {
            for topic in membership.topics {
                if let Some(subscribers) = indexes.by_topic.get_mut(&topic) {
                    subscribers.remove(&conn.id());
                    if subscribers.is_empty() {
                        indexes.by_topic.remove(&topic);
                    }
                }
            }
        }
        drop(indexes);
        conn.clear_subscriptions();
    }

    // ────────────────────────────────────────────────────────────────
    // Broadcast
    // ────────────────────────────────────────────────────────────────

    /// Fans `data` out to every subscriber of `topic_or_pattern`: the
    /// exact-topic set, plus every connection with a subscribed topic the
    /// pattern matches, deduplicated. The event's topic is the broadcast
    /// argument verbatim. Only open connections are written to.
    pub fn broadcast(&self, topic_or_pattern: &str, data: Option<Value>) -> BroadcastOutcome {
        let targets: Vec<Arc<Connection>> = {
            let indexes = self.indexes.lock().unwrap();
            let mut ids: HashSet<ConnectionId> = indexes
                .by_topic
                .get(topic_or_pattern)
                .map(|subscribers| subscribers.iter().copied().collect())
                .unwrap_or_default();

            for (id, membership) in &indexes.by_connection {
                if ids.contains(id) {
                    continue;
                }
                let matched = membership
                    .topics
                    .iter()
                    .any(|topic| match_topic(topic, topic_or_pattern).is_some());
                if matched {
                    ids.insert(*id);
                }
            }

            ids.iter()
                .filter_map(|id| indexes.by_connection.get(id))
                .filter_map(|membership| membership.conn.upgrade())
                .collect()
        };

        let mut sent = 0;
        for conn in &targets {
            if conn.state() == ConnectionState::Open
                && conn.emit(topic_or_pattern, data.clone()).is_ok()
            {
                sent += 1;
            }
        }

        BroadcastOutcome {
            targets: targets.len(),
            sent,
        }
    }

    /// Subscriber count for one concrete topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.indexes
            .lock()
            .unwrap()
            .by_topic
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Index-pairing invariant: (c, t) is in both directions or neither.
    #[cfg(test)]
    pub(crate) fn indexes_consistent(&self) -> bool {
        let indexes = self.indexes.lock().unwrap();
        let forward_ok = indexes.by_connection.iter().all(|(id, membership)| {
            membership
                .topics
                .iter()
                .all(|topic| indexes.by_topic.get(topic).is_some_and(|s| s.contains(id)))
        });
        let backward_ok = indexes.by_topic.iter().all(|(topic, subscribers)| {
            subscribers.iter().all(|id| {
                indexes
                    .by_connection
                    .get(id)
                    .is_some_and(|m| m.topics.contains(topic))
            })
        });
        forward_ok && backward_ok
    }
}
