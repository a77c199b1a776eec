//! Topic membership and broadcast fan-out.
//!
//! A topic exists only while it has members. It is created lazily by the
//! first [`GroupRegistry::join`] and deleted the moment its last member
//! leaves, at which point the topic's "emptied" callback (if any) fires once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use rally_core::{Codec, ConnectionId, Frame, Message};
use serde_json::Value;
use tracing::{debug, trace};

use crate::metrics::BROADCAST_FRAMES_TOTAL;

/// A connection that can be placed in a topic.
pub trait GroupMember: Clone + Send + Sync + 'static {
    /// Stable identifier of the underlying connection.
    fn member_id(&self) -> &ConnectionId;

    /// Enqueue an already-encoded frame. Returns `false` if it was dropped.
    fn deliver(&self, frame: Frame) -> bool;
}

/// Callback fired with the topic name when its last member leaves.
pub type EmptiedCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Topics<M> {
    members: HashMap<String, HashMap<ConnectionId, M>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Registry of topics and their member connections.
pub struct GroupRegistry<M> {
    topics: RwLock<Topics<M>>,
    emptied: RwLock<HashMap<String, EmptiedCallback>>,
    codec: Arc<dyn Codec>,
}

impl<M: GroupMember> GroupRegistry<M> {
    /// Create an empty registry that encodes broadcasts with `codec`.
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            topics: RwLock::new(Topics {
                members: HashMap::new(),
                memberships: HashMap::new(),
            }),
            emptied: RwLock::new(HashMap::new()),
            codec,
        }
    }

    /// Add `member` to `topic`. Returns `false` if it was already a member.
    pub fn join(&self, member: &M, topic: &str) -> bool {
        let id = member.member_id().clone();
        let mut topics = self.topics.write();
        let added = topics
            .members
            .entry(topic.to_owned())
            .or_default()
            .insert(id.clone(), member.clone())
            .is_none();
        if added {
            let _ = topics
                .memberships
                .entry(id.clone())
                .or_default()
                .insert(topic.to_owned());
            debug!(conn_id = %id, topic, "joined topic");
        }
        added
    }

    /// Remove the connection `id` from `topic`. Returns `false` if it was not
    /// a member.
    pub fn leave(&self, id: &ConnectionId, topic: &str) -> bool {
        let emptied = {
            let mut topics = self.topics.write();
            let Some(removed) = remove_member(&mut topics, id, topic) else {
                return false;
            };
            if let Some(topic_set) = topics.memberships.get_mut(id) {
                let _ = topic_set.remove(topic);
                if topic_set.is_empty() {
                    let _ = topics.memberships.remove(id);
                }
            }
            removed
        };
        debug!(conn_id = %id, topic, "left topic");
        if emptied {
            self.fire_emptied(topic);
        }
        true
    }

    /// Remove the connection `id` from every topic it belongs to.
    ///
    /// Returns the topics it left, sorted.
    pub fn leave_all(&self, id: &ConnectionId) -> Vec<String> {
        let (mut left, emptied) = {
            let mut topics = self.topics.write();
            let joined = topics.memberships.remove(id).unwrap_or_default();
            let mut left = Vec::with_capacity(joined.len());
            let mut emptied = Vec::new();
            for topic in joined {
                if let Some(now_empty) = remove_member(&mut topics, id, &topic) {
                    if now_empty {
                        emptied.push(topic.clone());
                    }
                    left.push(topic);
                }
            }
            (left, emptied)
        };
        for topic in &emptied {
            self.fire_emptied(topic);
        }
        left.sort();
        left
    }

    /// Send an `Event` to every current member of `topic`.
    ///
    /// The message is encoded once. Returns the number of members the frame
    /// was queued for; an absent topic is a no-op.
    pub fn broadcast(&self, topic: &str, method: &str, params: Vec<Value>) -> usize {
        let members = self.members(topic);
        if members.is_empty() {
            trace!(topic, method, "broadcast to empty topic");
            return 0;
        }
        let frame = match self.codec.encode(&Message::event(method, params)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(topic, method, error = %e, "failed to encode broadcast");
                return 0;
            }
        };
        let delivered = members
            .iter()
            .filter(|m| m.deliver(frame.clone()))
            .count();
        counter!(BROADCAST_FRAMES_TOTAL).increment(delivered as u64);
        debug!(topic, method, members = members.len(), delivered, "broadcast");
        delivered
    }

    /// Invoke `f` with each member of `topic`.
    ///
    /// Iterates a snapshot, so `f` may join or leave topics itself.
    pub fn for_each_member(&self, topic: &str, mut f: impl FnMut(&M)) {
        for member in &self.members(topic) {
            f(member);
        }
    }

    /// Snapshot of the members of `topic`.
    pub fn members(&self, topic: &str) -> Vec<M> {
        self.topics
            .read()
            .members
            .get(topic)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members in `topic`; zero if the topic does not exist.
    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.read().members.get(topic).map_or(0, HashMap::len)
    }

    /// Whether `id` is a member of `topic`.
    pub fn is_member(&self, id: &ConnectionId, topic: &str) -> bool {
        self.topics
            .read()
            .memberships
            .get(id)
            .is_some_and(|t| t.contains(topic))
    }

    /// Topics `id` currently belongs to, sorted.
    pub fn topics_of(&self, id: &ConnectionId) -> Vec<String> {
        let mut joined: Vec<String> = self
            .topics
            .read()
            .memberships
            .get(id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        joined.sort();
        joined
    }

    /// Number of topics that currently exist.
    pub fn topic_count(&self) -> usize {
        self.topics.read().members.len()
    }

    /// Register the callback fired when `topic` becomes empty.
    ///
    /// One callback per topic name; a later registration replaces the
    /// earlier one. The registration outlives the topic itself.
    pub fn on_emptied<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let _ = self
            .emptied
            .write()
            .insert(topic.to_owned(), Arc::new(callback));
    }

    /// Remove the emptied callback for `topic`. Returns `true` if one existed.
    pub fn remove_emptied(&self, topic: &str) -> bool {
        self.emptied.write().remove(topic).is_some()
    }

    fn fire_emptied(&self, topic: &str) {
        debug!(topic, "topic emptied");
        let callback = self.emptied.read().get(topic).cloned();
        if let Some(callback) = callback {
            callback(topic);
        }
    }
}

/// Remove `id` from the member set of `topic`, deleting the topic when it
/// empties. Returns `None` if `id` was not a member, otherwise whether the
/// topic was deleted.
fn remove_member<M>(topics: &mut Topics<M>, id: &ConnectionId, topic: &str) -> Option<bool> {
    let members = topics.members.get_mut(topic)?;
    let _ = members.remove(id)?;
    let now_empty = members.is_empty();
    if now_empty {
        let _ = topics.members.remove(topic);
    }
    Some(now_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rally_core::JsonCodec;
    use serde_json::json;

    #[derive(Clone)]
    struct TestMember {
        id: ConnectionId,
        inbox: Arc<Mutex<Vec<Frame>>>,
    }

    impl TestMember {
        fn new(id: &str) -> Self {
            Self {
                id: ConnectionId::from(id),
                inbox: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn received(&self) -> Vec<Message> {
            self.inbox
                .lock()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }
    }

    impl GroupMember for TestMember {
        fn member_id(&self) -> &ConnectionId {
            &self.id
        }

        fn deliver(&self, frame: Frame) -> bool {
            self.inbox.lock().push(frame);
            true
        }
    }

    fn registry() -> GroupRegistry<TestMember> {
        GroupRegistry::new(Arc::new(JsonCodec))
    }

    fn counter_hook(reg: &GroupRegistry<TestMember>, topic: &str) -> Arc<Mutex<Vec<String>>> {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        reg.on_emptied(topic, move |t| sink.lock().push(t.to_owned()));
        fired
    }

    #[test]
    fn join_is_idempotent() {
        let reg = registry();
        let a = TestMember::new("a");
        assert!(reg.join(&a, "room1"));
        assert!(!reg.join(&a, "room1"));
        assert_eq!(reg.member_count("room1"), 1);
        assert_eq!(reg.topics_of(a.member_id()), vec!["room1"]);
    }

    #[test]
    fn broadcast_reaches_members_only() {
        let reg = registry();
        let (a, b) = (TestMember::new("a"), TestMember::new("b"));
        let _ = reg.join(&a, "room1");
        let _ = reg.join(&b, "room2");

        let delivered = reg.broadcast("room1", "onMessage", vec![json!("room1"), json!("hello")]);
        assert_eq!(delivered, 1);
        assert_eq!(
            a.received(),
            vec![Message::event("onMessage", vec![json!("room1"), json!("hello")])]
        );
        assert!(b.received().is_empty());
    }

    #[test]
    fn broadcast_to_missing_topic_is_noop() {
        let reg = registry();
        assert_eq!(reg.broadcast("nowhere", "x", vec![]), 0);
    }

    #[test]
    fn last_leave_deletes_topic_and_fires_once() {
        let reg = registry();
        let fired = counter_hook(&reg, "room1");
        let (a, b) = (TestMember::new("a"), TestMember::new("b"));
        let _ = reg.join(&a, "room1");
        let _ = reg.join(&b, "room1");

        assert!(reg.leave(a.member_id(), "room1"));
        assert!(fired.lock().is_empty());
        assert!(reg.leave(b.member_id(), "room1"));
        assert!(!reg.leave(b.member_id(), "room1"));

        assert_eq!(*fired.lock(), vec!["room1"]);
        assert_eq!(reg.member_count("room1"), 0);
        assert_eq!(reg.topic_count(), 0);
    }

    #[test]
    fn emptied_fires_per_emptying_event() {
        let reg = registry();
        let fired = counter_hook(&reg, "room1");
        let a = TestMember::new("a");
        for _ in 0..2 {
            let _ = reg.join(&a, "room1");
            let _ = reg.leave(a.member_id(), "room1");
        }
        assert_eq!(fired.lock().len(), 2);
    }

    #[test]
    fn leave_all_empties_every_topic() {
        let reg = registry();
        let f1 = counter_hook(&reg, "room1");
        let f2 = counter_hook(&reg, "room2");
        let (a, b) = (TestMember::new("a"), TestMember::new("b"));
        let _ = reg.join(&a, "room1");
        let _ = reg.join(&a, "room2");
        let _ = reg.join(&b, "room2");

        assert_eq!(reg.leave_all(a.member_id()), vec!["room1", "room2"]);
        assert_eq!(f1.lock().len(), 1);
        assert!(f2.lock().is_empty());
        assert_eq!(reg.member_count("room2"), 1);
        assert!(reg.topics_of(a.member_id()).is_empty());
        assert!(reg.leave_all(a.member_id()).is_empty());
    }

    #[test]
    fn last_registered_emptied_callback_wins() {
        let reg = registry();
        let first = counter_hook(&reg, "room1");
        let second = counter_hook(&reg, "room1");
        let a = TestMember::new("a");
        let _ = reg.join(&a, "room1");
        let _ = reg.leave(a.member_id(), "room1");
        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn removed_emptied_callback_does_not_fire() {
        let reg = registry();
        let fired = counter_hook(&reg, "room1");
        assert!(reg.remove_emptied("room1"));
        let a = TestMember::new("a");
        let _ = reg.join(&a, "room1");
        let _ = reg.leave(a.member_id(), "room1");
        assert!(fired.lock().is_empty());
    }

    #[test]
    fn for_each_member_allows_mutation() {
        let reg = registry();
        let (a, b) = (TestMember::new("a"), TestMember::new("b"));
        let _ = reg.join(&a, "room1");
        let _ = reg.join(&b, "room1");

        let mut visited = 0;
        reg.for_each_member("room1", |m| {
            visited += 1;
            let _ = reg.leave(m.member_id(), "room1");
        });
        assert_eq!(visited, 2);
        assert_eq!(reg.member_count("room1"), 0);
    }

    #[test]
    fn for_each_member_missing_topic() {
        let reg = registry();
        let mut visited = 0;
        reg.for_each_member("nowhere", |_| visited += 1);
        assert_eq!(visited, 0);
    }

    #[test]
    fn is_member_tracks_both_sides() {
        let reg = registry();
        let a = TestMember::new("a");
        let _ = reg.join(&a, "room1");
        assert!(reg.is_member(a.member_id(), "room1"));
        let _ = reg.leave(a.member_id(), "room1");
        assert!(!reg.is_member(a.member_id(), "room1"));
    }
}
