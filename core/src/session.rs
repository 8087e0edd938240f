//! In-memory session, message and part store.
//!
//! A session owns its messages; an assistant message owns an ordered list of
//! parts. Parts are appended strictly in emission order and carry monotone
//! ids, which the trajectory aggregator and the part-ordering invariant rely
//! on. Nothing here persists: archival is a separate concern.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use redcell_protocol::protocol::EventMsg;
use redcell_protocol::protocol::Message;
use redcell_protocol::protocol::MessageTime;
use redcell_protocol::protocol::Part;
use redcell_protocol::protocol::PartKind;
use redcell_protocol::protocol::PermissionRule;
use redcell_protocol::protocol::Role;
use redcell_protocol::protocol::Session;
use redcell_protocol::protocol::TextPart;

use crate::error::RedcellErr;
use crate::error::Result;
use crate::ids::IdGenerator;
use crate::ids::IdKind;
use crate::redcell::EventBus;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Messages per session, in append order.
    messages: HashMap<String, Vec<Message>>,
    /// Parts per message, in emission order.
    parts: HashMap<String, Vec<Part>>,
    /// Reverse index so part updates only need the message id.
    message_session: HashMap<String, String>,
}

pub struct SessionStore {
    ids: Arc<IdGenerator>,
    bus: EventBus,
    inner: Mutex<Inner>,
}

impl SessionStore {
    pub fn new(ids: Arc<IdGenerator>, bus: EventBus) -> Self {
        Self {
            ids,
            bus,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn create_session(
        &self,
        title: impl Into<String>,
        parent_id: Option<String>,
        permission: Vec<PermissionRule>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: self.ids.next(IdKind::Session),
            parent_id,
            title: title.into(),
            permission,
            created_at: now,
            updated_at: now,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.insert(session.id.clone(), session.clone());
        }
        debug!(session = session.id, "session created");
        self.bus.publish(EventMsg::SessionUpdated {
            session: session.clone(),
        });
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn update_session(
        &self,
        id: &str,
        update: impl FnOnce(&mut Session),
    ) -> Result<Session> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| RedcellErr::SessionNotFound(id.to_string()))?;
            update(session);
            session.updated_at = Utc::now();
            session.clone()
        };
        self.bus.publish(EventMsg::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Drop the session and everything it owns. Hierarchy registrations and
    /// pending permissions are released by the caller.
    pub fn delete_session(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(id);
        if let Some(messages) = inner.messages.remove(id) {
            for message in &messages {
                inner.parts.remove(&message.id);
                inner.message_session.remove(&message.id);
            }
        }
    }

    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        model_id: Option<String>,
        provider_id: Option<String>,
    ) -> Result<Message> {
        let message = Message {
            id: self.ids.next(IdKind::Message),
            session_id: session_id.to_string(),
            role,
            model_id,
            provider_id,
            tokens: Default::default(),
            cost: 0.0,
            time: MessageTime {
                created: Utc::now(),
                completed: None,
            },
            error: None,
        };
        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(session_id) {
            return Err(RedcellErr::SessionNotFound(session_id.to_string()));
        }
        inner
            .message_session
            .insert(message.id.clone(), session_id.to_string());
        inner
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        inner.parts.insert(message.id.clone(), Vec::new());
        Ok(message)
    }

    /// Convenience for seeding a turn: a user message holding one text part.
    pub fn push_user_message(&self, session_id: &str, text: &str) -> Result<Message> {
        let message = self.append_message(session_id, Role::User, None, None)?;
        self.add_part(
            session_id,
            &message.id,
            PartKind::Text(TextPart {
                text: text.to_string(),
                end: None,
            }),
        )?;
        Ok(message)
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_message(
        &self,
        message_id: &str,
        update: impl FnOnce(&mut Message),
    ) -> Result<Message> {
        let mut inner = self.inner.lock().unwrap();
        let session_id = inner
            .message_session
            .get(message_id)
            .cloned()
            .ok_or_else(|| RedcellErr::MessageNotFound(message_id.to_string()))?;
        let messages = inner
            .messages
            .get_mut(&session_id)
            .ok_or_else(|| RedcellErr::MessageNotFound(message_id.to_string()))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| RedcellErr::MessageNotFound(message_id.to_string()))?;
        update(message);
        Ok(message.clone())
    }

    pub fn add_part(
        &self,
        session_id: &str,
        message_id: &str,
        kind: PartKind,
    ) -> Result<Part> {
        let part = Part {
            id: self.ids.next(IdKind::Part),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            time: Utc::now(),
            kind,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            let parts = inner
                .parts
                .get_mut(message_id)
                .ok_or_else(|| RedcellErr::MessageNotFound(message_id.to_string()))?;
            parts.push(part.clone());
        }
        self.bus
            .publish(EventMsg::PartUpdated { part: part.clone() });
        Ok(part)
    }

    pub fn update_part(
        &self,
        message_id: &str,
        part_id: &str,
        update: impl FnOnce(&mut Part),
    ) -> Result<Part> {
        let part = {
            let mut inner = self.inner.lock().unwrap();
            let parts = inner
                .parts
                .get_mut(message_id)
                .ok_or_else(|| RedcellErr::MessageNotFound(message_id.to_string()))?;
            let part = parts
                .iter_mut()
                .find(|p| p.id == part_id)
                .ok_or_else(|| RedcellErr::MessageNotFound(part_id.to_string()))?;
            update(part);
            part.clone()
        };
        self.bus
            .publish(EventMsg::PartUpdated { part: part.clone() });
        Ok(part)
    }

    pub fn parts(&self, message_id: &str) -> Vec<Part> {
        self.inner
            .lock()
            .unwrap()
            .parts
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The text of the last `text` part of the last assistant message, if
    /// any. This is what a `task` dispatch returns to its caller.
    pub fn last_assistant_text(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let messages = inner.messages.get(session_id)?;
        messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|message| {
                inner.parts.get(&message.id).and_then(|parts| {
                    parts.iter().rev().find_map(|part| match &part.kind {
                        PartKind::Text(text) if !text.text.is_empty() => {
                            Some(text.text.clone())
                        }
                        _ => None,
                    })
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redcell_protocol::protocol::ReasoningPart;

    fn store() -> SessionStore {
        let ids = Arc::new(IdGenerator::new());
        let (bus, _rx) = EventBus::standalone(Arc::clone(&ids), 64);
        SessionStore::new(ids, bus)
    }

    #[test]
    fn parts_keep_emission_order_and_monotone_ids() {
        let store = store();
        let session = store.create_session("root", None, Vec::new());
        let message = store
            .append_message(&session.id, Role::Assistant, None, None)
            .unwrap();
        for i in 0..4 {
            store
                .add_part(
                    &session.id,
                    &message.id,
                    PartKind::Reasoning(ReasoningPart {
                        text: format!("step {i}"),
                        end: None,
                    }),
                )
                .unwrap();
        }
        let parts = store.parts(&message.id);
        for pair in parts.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[test]
    fn delete_session_drops_messages_and_parts() {
        let store = store();
        let session = store.create_session("root", None, Vec::new());
        let message = store.push_user_message(&session.id, "hello").unwrap();
        store.delete_session(&session.id);
        assert!(store.get_session(&session.id).is_none());
        assert!(store.parts(&message.id).is_empty());
        assert!(store.messages(&session.id).is_empty());
    }

    #[test]
    fn last_assistant_text_skips_user_turns() {
        let store = store();
        let session = store.create_session("root", None, Vec::new());
        store.push_user_message(&session.id, "go").unwrap();
        let message = store
            .append_message(&session.id, Role::Assistant, None, None)
            .unwrap();
        store
            .add_part(
                &session.id,
                &message.id,
                PartKind::Text(TextPart {
                    text: "done".to_string(),
                    end: None,
                }),
            )
            .unwrap();
        assert_eq!(store.last_assistant_text(&session.id).as_deref(), Some("done"));
    }
}
