//! Distance-gated chat fan-out.
//!
//! Only the public and debug channels are relayed to avatars. Every other
//! channel belongs to scripts and never reaches this module's listeners.

use std::sync::Arc;

use cablebeach_contracts::{
    ChatDelivery, ChatEvent, ChatSource, ChatType, RegionLocation, Vector3,
    BROADCAST_TRIM_THRESHOLD, DEBUG_CHANNEL, MAX_MESSAGE_CHARS, PUBLIC_CHANNEL,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Synthetic speaker position used for broadcast chat.
pub const BROADCAST_POSITION: Vector3 = Vector3::new(128.0, 128.0, 30.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatConfig {
    pub whisper_distance: u32,
    pub say_distance: u32,
    pub shout_distance: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            whisper_distance: 10,
            say_distance: 30,
            shout_distance: 100,
        }
    }
}

/// A presence that can hear chat.
pub trait ChatListener: Send + Sync {
    fn agent_id(&self) -> Uuid;
    /// Region-local position.
    fn position(&self) -> Vector3;
    fn is_child_agent(&self) -> bool;
    /// Fire-and-forget; a listener that has gone away simply drops it.
    fn deliver(&self, delivery: ChatDelivery);
}

pub trait ChatRegion {
    fn location(&self) -> RegionLocation;
    /// Snapshot of the listeners present right now.
    fn listeners(&self) -> Vec<Arc<dyn ChatListener>>;
}

pub fn is_relayed_channel(channel: i32) -> bool {
    channel == PUBLIC_CHANNEL || channel == DEBUG_CHANNEL
}

pub fn effective_chat_type(channel: i32, requested: ChatType) -> ChatType {
    if channel == DEBUG_CHANNEL {
        ChatType::Debug
    } else {
        requested
    }
}

pub fn truncate_chars(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Broadcast chat keeps anything up to the trim threshold untouched.
pub fn broadcast_message(message: &str) -> String {
    if message.chars().count() > BROADCAST_TRIM_THRESHOLD {
        truncate_chars(message, MAX_MESSAGE_CHARS)
    } else {
        message.to_string()
    }
}

/// Object chat addressed to its owner only reaches that owner.
pub fn owner_allows(event: &ChatEvent, listener_id: Uuid) -> bool {
    if event.chat_type != ChatType::Owner || event.source != ChatSource::Object {
        return true;
    }
    event.owner_id == Some(listener_id)
}

impl ChatConfig {
    /// `distance` is whole meters; the range check is inclusive.
    pub fn in_range(&self, chat_type: ChatType, distance: u64) -> bool {
        match chat_type {
            ChatType::Whisper => distance <= self.whisper_distance as u64,
            ChatType::Say => distance <= self.say_distance as u64,
            ChatType::Shout => distance <= self.shout_distance as u64,
            ChatType::Broadcast | ChatType::Owner | ChatType::Debug => true,
        }
    }
}

fn grid_distance(
    from: Vector3,
    from_region: RegionLocation,
    to: Vector3,
    to_region: RegionLocation,
) -> u64 {
    let from_abs = from + from_region.origin();
    let to_abs = to + to_region.origin();
    // Whole meters, fractional part dropped.
    from_abs.distance(&to_abs).trunc().abs() as u64
}

#[derive(Debug, Clone, Default)]
pub struct ChatEngine {
    cfg: ChatConfig,
}

impl ChatEngine {
    pub fn new(cfg: ChatConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.cfg
    }

    /// Delivers direct chat to every listener in range across `regions`.
    /// Returns how many listeners it was handed to.
    pub fn deliver<R: ChatRegion>(&self, event: &ChatEvent, regions: &[R]) -> usize {
        if !is_relayed_channel(event.channel) {
            return 0;
        }
        let Some(from_id) = event.sender_id else {
            error!(
                sender_name = %event.sender_name,
                source = ?event.source,
                "chat has no sender id, dropping"
            );
            return 0;
        };

        let chat_type = effective_chat_type(event.channel, event.chat_type);
        let message = truncate_chars(&event.message, MAX_MESSAGE_CHARS);

        let mut delivered = 0;
        for region in regions {
            let location = region.location();
            for listener in region.listeners() {
                if listener.is_child_agent() {
                    continue;
                }
                if !owner_allows(event, listener.agent_id()) {
                    continue;
                }
                let distance =
                    grid_distance(event.position, event.origin, listener.position(), location);
                if !self.cfg.in_range(chat_type, distance) {
                    continue;
                }
                listener.deliver(ChatDelivery {
                    message: message.clone(),
                    chat_type,
                    position: event.position,
                    from_name: event.sender_name.clone(),
                    from_id,
                    source: event.source,
                });
                delivered += 1;
            }
        }
        debug!(
            channel = event.channel,
            chat_type = ?chat_type,
            delivered,
            "chat delivered"
        );
        delivered
    }

    /// Relays chat to every full agent regardless of distance.
    pub fn broadcast<R: ChatRegion>(&self, event: &ChatEvent, regions: &[R]) -> usize {
        if !is_relayed_channel(event.channel) {
            return 0;
        }

        let chat_type = effective_chat_type(event.channel, event.chat_type);
        let message = broadcast_message(&event.message);

        let mut delivered = 0;
        for region in regions {
            for listener in region.listeners() {
                if listener.is_child_agent() {
                    continue;
                }
                if !owner_allows(event, listener.agent_id()) {
                    continue;
                }
                listener.deliver(ChatDelivery {
                    message: message.clone(),
                    chat_type,
                    position: BROADCAST_POSITION,
                    from_name: event.sender_name.clone(),
                    from_id: Uuid::nil(),
                    source: event.source,
                });
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestListener {
        id: Uuid,
        position: Vector3,
        child: bool,
        inbox: Mutex<Vec<ChatDelivery>>,
    }

    impl TestListener {
        fn new(position: Vector3) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                position,
                child: false,
                inbox: Mutex::new(Vec::new()),
            })
        }

        fn child(position: Vector3) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                position,
                child: true,
                inbox: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<ChatDelivery> {
            self.inbox.lock().unwrap().clone()
        }
    }

    impl ChatListener for TestListener {
        fn agent_id(&self) -> Uuid {
            self.id
        }

        fn position(&self) -> Vector3 {
            self.position
        }

        fn is_child_agent(&self) -> bool {
            self.child
        }

        fn deliver(&self, delivery: ChatDelivery) {
            self.inbox.lock().unwrap().push(delivery);
        }
    }

    struct TestRegion {
        location: RegionLocation,
        listeners: Vec<Arc<TestListener>>,
    }

    impl ChatRegion for TestRegion {
        fn location(&self) -> RegionLocation {
            self.location
        }

        fn listeners(&self) -> Vec<Arc<dyn ChatListener>> {
            self.listeners
                .iter()
                .map(|l| l.clone() as Arc<dyn ChatListener>)
                .collect()
        }
    }

    fn region(grid_x: u32, listeners: Vec<Arc<TestListener>>) -> TestRegion {
        TestRegion {
            location: RegionLocation {
                grid_x,
                grid_y: 1000,
            },
            listeners,
        }
    }

    fn event(chat_type: ChatType, message: &str) -> ChatEvent {
        ChatEvent {
            channel: PUBLIC_CHANNEL,
            message: message.to_string(),
            chat_type,
            source: ChatSource::Agent,
            sender_id: Some(Uuid::new_v4()),
            sender_name: "Jane Doe".to_string(),
            position: Vector3::new(100.0, 100.0, 20.0),
            origin: RegionLocation {
                grid_x: 1000,
                grid_y: 1000,
            },
            owner_id: None,
        }
    }

    #[test]
    fn range_threshold_is_inclusive_for_every_distance_type() {
        let engine = ChatEngine::default();
        for (chat_type, limit) in [
            (ChatType::Whisper, 10.0),
            (ChatType::Say, 30.0),
            (ChatType::Shout, 100.0),
        ] {
            let at_limit = TestListener::new(Vector3::new(100.0 + limit, 100.0, 20.0));
            let past_limit = TestListener::new(Vector3::new(100.0 + limit + 1.0, 100.0, 20.0));
            let regions = vec![region(1000, vec![at_limit.clone(), past_limit.clone()])];

            assert_eq!(engine.deliver(&event(chat_type, "hello"), &regions), 1);
            assert_eq!(at_limit.received().len(), 1, "{chat_type:?} at limit");
            assert!(past_limit.received().is_empty(), "{chat_type:?} past limit");
        }
    }

    #[test]
    fn whisper_reaches_ten_meters_but_not_eleven() {
        let engine = ChatEngine::default();
        let ten = TestListener::new(Vector3::new(100.0, 110.0, 20.0));
        let eleven = TestListener::new(Vector3::new(100.0, 89.0, 20.0));
        let regions = vec![region(1000, vec![ten.clone(), eleven.clone()])];

        engine.deliver(&event(ChatType::Whisper, "psst"), &regions);
        assert_eq!(ten.received()[0].message, "psst");
        assert!(eleven.received().is_empty());
    }

    #[test]
    fn fractional_distance_is_truncated_before_comparison() {
        let engine = ChatEngine::default();
        let listener = TestListener::new(Vector3::new(110.5, 100.0, 20.0));
        let regions = vec![region(1000, vec![listener.clone()])];

        engine.deliver(&event(ChatType::Whisper, "psst"), &regions);
        assert_eq!(listener.received().len(), 1);
    }

    #[test]
    fn distance_accounts_for_region_offsets() {
        let engine = ChatEngine::default();
        // Speaker at x=250 in region 1000, listener at x=5 in region 1001: 11m apart.
        let mut speech = event(ChatType::Whisper, "over the border");
        speech.position = Vector3::new(250.0, 100.0, 20.0);
        let near = TestListener::new(Vector3::new(4.0, 100.0, 20.0));
        let far = TestListener::new(Vector3::new(5.0, 100.0, 20.0));
        let regions = vec![region(1001, vec![near.clone(), far.clone()])];

        engine.deliver(&speech, &regions);
        assert_eq!(near.received().len(), 1);
        assert!(far.received().is_empty());
    }

    #[test]
    fn child_agents_never_hear_chat() {
        let engine = ChatEngine::default();
        let child = TestListener::child(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![child.clone()])];

        for chat_type in [
            ChatType::Whisper,
            ChatType::Say,
            ChatType::Shout,
            ChatType::Broadcast,
        ] {
            engine.deliver(&event(chat_type, "hi"), &regions);
            engine.broadcast(&event(chat_type, "hi"), &regions);
        }
        assert!(child.received().is_empty());
    }

    #[test]
    fn owner_chat_only_reaches_the_owner() {
        let engine = ChatEngine::default();
        let owner = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let stranger = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![owner.clone(), stranger.clone()])];

        let mut speech = event(ChatType::Owner, "your object says hi");
        speech.source = ChatSource::Object;
        speech.owner_id = Some(owner.id);

        assert_eq!(engine.deliver(&speech, &regions), 1);
        assert_eq!(engine.broadcast(&speech, &regions), 1);
        assert_eq!(owner.received().len(), 2);
        assert!(stranger.received().is_empty());
    }

    #[test]
    fn chat_without_sender_is_dropped_for_every_source() {
        let engine = ChatEngine::default();
        let listener = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![listener.clone()])];

        for source in [ChatSource::Agent, ChatSource::Object] {
            let mut speech = event(ChatType::Say, "who said that");
            speech.source = source;
            speech.sender_id = None;
            assert_eq!(engine.deliver(&speech, &regions), 0);
        }
        assert!(listener.received().is_empty());
    }

    #[test]
    fn non_public_channels_are_ignored() {
        let engine = ChatEngine::default();
        let listener = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![listener.clone()])];

        let mut speech = event(ChatType::Say, "/42 hidden");
        speech.channel = 42;
        assert_eq!(engine.deliver(&speech, &regions), 0);
        assert_eq!(engine.broadcast(&speech, &regions), 0);
        assert!(listener.received().is_empty());
    }

    #[test]
    fn debug_channel_forces_debug_type_and_skips_distance() {
        let engine = ChatEngine::default();
        let far = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1010, vec![far.clone()])];

        let mut speech = event(ChatType::Whisper, "script error");
        speech.channel = DEBUG_CHANNEL;
        assert_eq!(engine.deliver(&speech, &regions), 1);
        assert_eq!(far.received()[0].chat_type, ChatType::Debug);
    }

    #[test]
    fn direct_chat_truncates_to_one_thousand_chars() {
        let engine = ChatEngine::default();
        let listener = TestListener::new(Vector3::new(100.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![listener.clone()])];

        engine.deliver(&event(ChatType::Say, &"a".repeat(1050)), &regions);
        assert_eq!(listener.received()[0].message.chars().count(), 1000);
    }

    #[test]
    fn broadcast_trims_only_past_eleven_hundred_chars() {
        let engine = ChatEngine::default();
        let listener = TestListener::new(Vector3::new(3.0, 3.0, 3.0));
        let regions = vec![region(1005, vec![listener.clone()])];

        engine.broadcast(&event(ChatType::Broadcast, &"b".repeat(1100)), &regions);
        engine.broadcast(&event(ChatType::Broadcast, &"c".repeat(1101)), &regions);

        let received = listener.received();
        assert_eq!(received[0].message.chars().count(), 1100);
        assert_eq!(received[1].message.chars().count(), 1000);
        assert_eq!(received[0].position, BROADCAST_POSITION);
        assert_eq!(received[0].from_id, Uuid::nil());
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let text = "é".repeat(1001);
        assert_eq!(truncate_chars(&text, 1000).chars().count(), 1000);
    }

    #[test]
    fn custom_distances_are_honored() {
        let engine = ChatEngine::new(ChatConfig {
            whisper_distance: 2,
            say_distance: 5,
            shout_distance: 8,
        });
        let listener = TestListener::new(Vector3::new(106.0, 100.0, 20.0));
        let regions = vec![region(1000, vec![listener.clone()])];

        assert_eq!(engine.deliver(&event(ChatType::Say, "hi"), &regions), 0);
        assert_eq!(engine.deliver(&event(ChatType::Shout, "HI"), &regions), 1);
    }
}
