//! Chat and instant messaging.
//!
//! Inbound chat runs filter -> history -> bubble -> spatial audio.
//! History is a bounded ring; bubbles are ephemeral entities whose
//! lifetime is capped by a display timer and distance culling. Instant
//! messages are conversation-scoped; persistence is an external
//! concern.

use crate::networking::messages::{ChatSourceType, ChatType, Message, IM_DIALOG_MESSAGE, IM_DIALOG_TYPING_START, IM_DIALOG_TYPING_STOP};
use crate::world::components::{ChatBubble, Position};
use crate::world::render::RenderBridge;
use crate::world::store::{EntityId, EntityStore};
use glam::Vec3;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// External spatial-audio sink. Volume is already attenuated.
pub trait AudioSink: Send {
    fn chat_audio(&mut self, position: Option<Vec3>, volume: f32);
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub history_cap: usize,
    pub bubble_display: Duration,
    pub bubble_fade: Duration,
    pub bubble_max_distance: f32,
    pub bubble_height: f32,
    pub chat_max_distance: f32,
    pub bubbles_enabled: bool,
    pub spatial_audio_enabled: bool,
    pub typing_auto_stop: Duration,
    pub typing_evict: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_cap: 1000,
            bubble_display: Duration::from_secs(10),
            bubble_fade: Duration::from_secs(2),
            bubble_max_distance: 50.0,
            bubble_height: 0.5,
            chat_max_distance: 100.0,
            bubbles_enabled: true,
            spatial_audio_enabled: false,
            typing_auto_stop: Duration::from_secs(10),
            typing_evict: Duration::from_secs(30),
        }
    }
}

/// One line of chat kept in history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: ChatSourceType,
    pub chat_type: ChatType,
    pub position: Option<Vec3>,
    pub message: String,
    pub outbound: bool,
    pub received_at: Instant,
}

/// An instant-message conversation.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub participants: HashSet<Uuid>,
    pub messages: Vec<ImRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImRecord {
    pub from_agent: Uuid,
    pub from_name: String,
    pub message: String,
    pub timestamp: u32,
    pub received_at: Instant,
}

pub struct ChatSystem {
    config: ChatConfig,
    history: VecDeque<ChatRecord>,
    blocked_sources: HashSet<Uuid>,
    disabled_types: HashSet<ChatType>,
    conversations: HashMap<Uuid, Conversation>,
    /// (conversation, agent) -> typing start time.
    typing: HashMap<(Uuid, Uuid), Instant>,
    audio: Option<Box<dyn AudioSink>>,
}

impl ChatSystem {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            blocked_sources: HashSet::new(),
            disabled_types: HashSet::new(),
            conversations: HashMap::new(),
            typing: HashMap::new(),
            audio: None,
        }
    }

    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.audio = Some(sink);
    }

    pub fn set_bubbles_enabled(&mut self, enabled: bool) {
        self.config.bubbles_enabled = enabled;
    }

    pub fn block_source(&mut self, source: Uuid) {
        self.blocked_sources.insert(source);
    }

    pub fn set_type_enabled(&mut self, chat_type: ChatType, enabled: bool) {
        if enabled {
            self.disabled_types.remove(&chat_type);
        } else {
            self.disabled_types.insert(chat_type);
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatRecord> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn conversation(&self, im_session_id: Uuid) -> Option<&Conversation> {
        self.conversations.get(&im_session_id)
    }

    pub fn typing_agents(&self, im_session_id: Uuid) -> Vec<Uuid> {
        self.typing
            .keys()
            .filter(|(session, _)| *session == im_session_id)
            .map(|(_, agent)| *agent)
            .collect()
    }

    /// Process inbound chat. Returns the bubble entity if one was made.
    pub fn handle_chat(
        &mut self,
        store: &mut EntityStore,
        bridge: &mut RenderBridge,
        message: &Message,
        avatar_position: Vec3,
        now: Instant,
    ) -> Option<EntityId> {
        let Message::ChatFromSimulator {
            from_name,
            source_id,
            owner_id,
            source_type,
            chat_type,
            audible,
            position,
            message,
        } = message
        else {
            return None;
        };

        // Filter stage.
        if !audible || *chat_type == ChatType::Debug {
            return None;
        }
        if self.disabled_types.contains(chat_type) {
            trace!(?chat_type, "chat type disabled");
            return None;
        }
        if self.blocked_sources.contains(source_id) {
            trace!(%source_id, "blocked source");
            return None;
        }
        let distance = position.map(|p| p.distance(avatar_position));
        if let Some(distance) = distance {
            if distance > self.config.chat_max_distance {
                return None;
            }
            if let Some(radius) = chat_type.radius() {
                if distance > radius {
                    trace!(distance, radius, "outside audibility radius");
                    return None;
                }
            }
        }

        self.append_history(ChatRecord {
            from_name: from_name.clone(),
            source_id: *source_id,
            owner_id: *owner_id,
            source_type: *source_type,
            chat_type: *chat_type,
            position: *position,
            message: message.clone(),
            outbound: false,
            received_at: now,
        });

        if self.config.spatial_audio_enabled {
            if let Some(audio) = self.audio.as_mut() {
                let volume = match (distance, chat_type.radius()) {
                    (Some(d), Some(radius)) => (1.0 - d / radius).clamp(0.0, 1.0),
                    _ => 1.0,
                };
                audio.chat_audio(*position, volume);
            }
        }

        // Bubble stage: needs a position and the feature on.
        let bubble_position = (*position)?;
        if !self.config.bubbles_enabled {
            return None;
        }
        if bubble_position.distance(avatar_position) > self.config.bubble_max_distance {
            return None;
        }

        let lift = Vec3::Y * self.config.bubble_height;
        let entity = store.create();
        let anchor = bridge.sink_mut().add_anchor(bubble_position + lift);
        store.set_position(entity, Position(bubble_position + lift));
        store.set_chat_bubble(
            entity,
            ChatBubble {
                text: message.clone(),
                created_at: now,
                expires_at: now + self.config.bubble_display,
                anchor: Some(anchor),
            },
        );
        debug!(from = %from_name, "chat bubble created");
        Some(entity)
    }

    fn append_history(&mut self, record: ChatRecord) {
        self.history.push_back(record);
        while self.history.len() > self.config.history_cap {
            self.history.pop_front();
        }
    }

    /// Build outbound chat and mirror it into local history.
    pub fn send_chat(
        &mut self,
        agent_id: Uuid,
        session_id: Uuid,
        display_name: &str,
        text: &str,
        chat_type: ChatType,
        channel: i32,
        position: Vec3,
        now: Instant,
    ) -> Message {
        self.append_history(ChatRecord {
            from_name: display_name.to_string(),
            source_id: agent_id,
            owner_id: agent_id,
            source_type: ChatSourceType::Agent,
            chat_type,
            position: Some(position),
            message: text.to_string(),
            outbound: true,
            received_at: now,
        });

        Message::ChatFromViewer {
            agent_id,
            session_id,
            message: text.to_string(),
            chat_type,
            channel,
        }
    }

    /// Process an inbound instant message or typing signal.
    pub fn handle_instant_message(&mut self, message: &Message, now: Instant) {
        let Message::InstantMessage {
            agent_id,
            im_session_id,
            to_agent_id,
            from_name,
            message,
            dialog,
            timestamp,
            ..
        } = message
        else {
            return;
        };

        match *dialog {
            IM_DIALOG_TYPING_START => {
                self.typing.insert((*im_session_id, *agent_id), now);
            }
            IM_DIALOG_TYPING_STOP => {
                self.typing.remove(&(*im_session_id, *agent_id));
            }
            IM_DIALOG_MESSAGE => {
                self.typing.remove(&(*im_session_id, *agent_id));
                let conversation = self.conversations.entry(*im_session_id).or_default();
                conversation.participants.insert(*agent_id);
                conversation.participants.insert(*to_agent_id);
                conversation.messages.push(ImRecord {
                    from_agent: *agent_id,
                    from_name: from_name.clone(),
                    message: message.clone(),
                    timestamp: *timestamp,
                    received_at: now,
                });
            }
            other => trace!(dialog = other, "unhandled IM dialog"),
        }
    }

    /// Build an outbound IM and mirror it into the conversation.
    pub fn send_instant_message(
        &mut self,
        agent_id: Uuid,
        session_id: Uuid,
        im_session_id: Uuid,
        to_agent_id: Uuid,
        from_name: &str,
        text: &str,
        timestamp: u32,
        now: Instant,
    ) -> Message {
        let conversation = self.conversations.entry(im_session_id).or_default();
        conversation.participants.insert(agent_id);
        conversation.participants.insert(to_agent_id);
        conversation.messages.push(ImRecord {
            from_agent: agent_id,
            from_name: from_name.to_string(),
            message: text.to_string(),
            timestamp,
            received_at: now,
        });

        Message::InstantMessage {
            agent_id,
            session_id,
            im_session_id,
            to_agent_id,
            from_name: from_name.to_string(),
            message: text.to_string(),
            dialog: IM_DIALOG_MESSAGE,
            timestamp,
        }
    }

    /// Periodic sweep: expire and cull bubbles, stop stale typing.
    pub fn tick(
        &mut self,
        store: &mut EntityStore,
        bridge: &mut RenderBridge,
        avatar_position: Vec3,
        now: Instant,
    ) {
        let mut to_remove: Vec<(EntityId, Option<u64>)> = Vec::new();
        for (entity, bubble) in store.iter_chat_bubbles() {
            let expired = now >= bubble.expires_at;
            let culled = store
                .position(entity)
                .map(|p| p.0.distance(avatar_position) > self.config.bubble_max_distance)
                .unwrap_or(true);
            if expired || culled {
                to_remove.push((entity, bubble.anchor));
            }
        }
        for (entity, anchor) in to_remove {
            if let Some(anchor) = anchor {
                bridge.sink_mut().remove_anchor(anchor);
            }
            store.destroy(entity);
        }

        // Typing: auto-stop after 10 s; evict anything older than 30 s.
        self.typing.retain(|_, started| {
            now.duration_since(*started) < self.config.typing_auto_stop
                && now.duration_since(*started) < self.config.typing_evict
        });
    }

    /// Drop all bubbles immediately (memory pressure degraded mode).
    pub fn clear_bubbles(&mut self, store: &mut EntityStore, bridge: &mut RenderBridge) {
        let bubbles: Vec<(EntityId, Option<u64>)> = store
            .iter_chat_bubbles()
            .map(|(e, b)| (e, b.anchor))
            .collect();
        for (entity, anchor) in bubbles {
            if let Some(anchor) = anchor {
                bridge.sink_mut().remove_anchor(anchor);
            }
            store.destroy(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::render::NullSink;

    fn chat_message(chat_type: ChatType, position: Option<Vec3>, text: &str) -> Message {
        Message::ChatFromSimulator {
            from_name: "Bob".to_string(),
            source_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            source_type: ChatSourceType::Agent,
            chat_type,
            audible: true,
            position,
            message: text.to_string(),
        }
    }

    fn system() -> (ChatSystem, EntityStore, RenderBridge) {
        (
            ChatSystem::new(ChatConfig::default()),
            EntityStore::new(),
            RenderBridge::new(Box::new(NullSink::default())),
        )
    }

    const AVATAR: Vec3 = Vec3::new(128.0, 25.0, 128.0);

    #[test]
    fn test_bubble_lifecycle() {
        let (mut chat, mut store, mut bridge) = system();
        let now = Instant::now();
        let message = chat_message(ChatType::Say, Some(Vec3::new(130.0, 25.0, 128.0)), "hello");

        let bubble = chat.handle_chat(&mut store, &mut bridge, &message, AVATAR, now).unwrap();
        assert_eq!(chat.history_len(), 1);
        let expected = Vec3::new(130.0, 25.5, 128.0);
        assert_eq!(store.position(bubble).unwrap().0, expected);

        // Before the display timer: still alive.
        chat.tick(&mut store, &mut bridge, AVATAR, now + Duration::from_secs(9));
        assert!(store.contains(bubble));

        // After: gone, history persists.
        chat.tick(&mut store, &mut bridge, AVATAR, now + Duration::from_secs(10));
        assert!(!store.contains(bubble));
        assert_eq!(chat.history_len(), 1);
    }

    #[test]
    fn test_shout_radius_boundary() {
        let (mut chat, mut store, mut bridge) = system();
        let now = Instant::now();

        // Exactly 100 m: audible.
        let at_edge = chat_message(ChatType::Shout, Some(AVATAR + Vec3::new(100.0, 0.0, 0.0)), "edge");
        chat.handle_chat(&mut store, &mut bridge, &at_edge, AVATAR, now);
        assert_eq!(chat.history_len(), 1);

        // Just beyond: filtered.
        let beyond = chat_message(ChatType::Shout, Some(AVATAR + Vec3::new(100.001, 0.0, 0.0)), "far");
        chat.handle_chat(&mut store, &mut bridge, &beyond, AVATAR, now);
        assert_eq!(chat.history_len(), 1);
    }

    #[test]
    fn test_say_radius() {
        let (mut chat, mut store, mut bridge) = system();
        let now = Instant::now();
        let too_far = chat_message(ChatType::Say, Some(AVATAR + Vec3::new(25.0, 0.0, 0.0)), "x");
        chat.handle_chat(&mut store, &mut bridge, &too_far, AVATAR, now);
        assert_eq!(chat.history_len(), 0);
    }

    #[test]
    fn test_blocked_source_filtered() {
        let (mut chat, mut store, mut bridge) = system();
        let source = Uuid::new_v4();
        chat.block_source(source);
        let message = Message::ChatFromSimulator {
            from_name: "Spam".to_string(),
            source_id: source,
            owner_id: Uuid::nil(),
            source_type: ChatSourceType::Object,
            chat_type: ChatType::Say,
            audible: true,
            position: Some(AVATAR),
            message: "buy now".to_string(),
        };
        chat.handle_chat(&mut store, &mut bridge, &message, AVATAR, Instant::now());
        assert_eq!(chat.history_len(), 0);
    }

    #[test]
    fn test_debug_chat_unrendered() {
        let (mut chat, mut store, mut bridge) = system();
        let message = chat_message(ChatType::Debug, Some(AVATAR), "trace");
        chat.handle_chat(&mut store, &mut bridge, &message, AVATAR, Instant::now());
        assert_eq!(chat.history_len(), 0);
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let (mut chat, mut store, mut bridge) = system();
        let mut config = ChatConfig::default();
        config.history_cap = 3;
        chat.config = config;
        let now = Instant::now();
        for i in 0..5 {
            let message = chat_message(ChatType::Region, None, &format!("m{i}"));
            chat.handle_chat(&mut store, &mut bridge, &message, AVATAR, now);
        }
        assert_eq!(chat.history_len(), 3);
        assert_eq!(chat.history().next().unwrap().message, "m2");
    }

    #[test]
    fn test_outbound_mirrored() {
        let (mut chat, _store, _bridge) = system();
        let message = chat.send_chat(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Me",
            "hi",
            ChatType::Say,
            0,
            AVATAR,
            Instant::now(),
        );
        assert!(matches!(message, Message::ChatFromViewer { .. }));
        assert_eq!(chat.history_len(), 1);
        assert!(chat.history().next().unwrap().outbound);
    }

    #[test]
    fn test_im_conversations() {
        let (mut chat, _store, _bridge) = system();
        let session = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let me = Uuid::new_v4();
        let now = Instant::now();

        chat.handle_instant_message(
            &Message::InstantMessage {
                agent_id: alice,
                session_id: Uuid::nil(),
                im_session_id: session,
                to_agent_id: me,
                from_name: "Alice".to_string(),
                message: "hey".to_string(),
                dialog: IM_DIALOG_MESSAGE,
                timestamp: 1,
            },
            now,
        );

        let conversation = chat.conversation(session).unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert!(conversation.participants.contains(&alice));
        assert!(conversation.participants.contains(&me));
    }

    #[test]
    fn test_typing_auto_stop() {
        let (mut chat, mut store, mut bridge) = system();
        let session = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let now = Instant::now();

        chat.handle_instant_message(
            &Message::InstantMessage {
                agent_id: alice,
                session_id: Uuid::nil(),
                im_session_id: session,
                to_agent_id: Uuid::nil(),
                from_name: "Alice".to_string(),
                message: String::new(),
                dialog: IM_DIALOG_TYPING_START,
                timestamp: 0,
            },
            now,
        );
        assert_eq!(chat.typing_agents(session), vec![alice]);

        chat.tick(&mut store, &mut bridge, AVATAR, now + Duration::from_secs(11));
        assert!(chat.typing_agents(session).is_empty());
    }
}
