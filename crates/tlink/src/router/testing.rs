//! In-memory doubles for router unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tlink_core::{
    ConversationId, IpcEndpoint, RoutingKey, SessionId, SessionMode, SessionRecord, SessionRegistration,
    SessionStatus, SessionUpdate,
};
use tlink_protocol::ErrorCode;

use super::chat::{ChatClient, ChatError, MessageRef};
use super::SessionGateway;
use crate::error::ClientError;

#[derive(Default)]
pub struct RecordingChat {
    counter: AtomicU64,
    post_delay: Option<Duration>,
    fail: bool,
    posts: Mutex<Vec<(MessageRef, String)>>,
    updates: Mutex<Vec<(MessageRef, String)>>,
    reactions: Mutex<Vec<(MessageRef, String)>>,
}

impl RecordingChat {
    pub fn with_post_delay(delay: Duration) -> Self {
        Self {
            post_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn posts(&self) -> Vec<(MessageRef, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn posted_texts_in(&self, channel: &str) -> Vec<String> {
        self.posts()
            .into_iter()
            .filter(|(m, _)| m.channel == channel)
            .map(|(_, text)| text)
            .collect()
    }

    pub fn updates(&self) -> Vec<(MessageRef, String)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<(MessageRef, String)> {
        self.reactions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn post_message(
        &self,
        channel: &str,
        thread: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, ChatError> {
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ChatError::Api("channel_not_found".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let message = MessageRef::new(channel, thread.map(str::to_string), format!("900.{n}"));
        self.posts
            .lock()
            .unwrap()
            .push((message.clone(), text.to_string()));
        Ok(message)
    }

    async fn update_message(&self, message: &MessageRef, text: &str) -> Result<(), ChatError> {
        self.updates
            .lock()
            .unwrap()
            .push((message.clone(), text.to_string()));
        Ok(())
    }

    async fn add_reaction(&self, message: &MessageRef, emoji: &str) -> Result<(), ChatError> {
        self.reactions
            .lock()
            .unwrap()
            .push((message.clone(), emoji.to_string()));
        Ok(())
    }
}

/// Registry stand-in: sessions by routing key, deliveries recorded.
#[derive(Default)]
pub struct FakeGateway {
    sessions: Mutex<HashMap<RoutingKey, SessionRecord>>,
    unreachable: Mutex<Vec<SessionId>>,
    delivered: Mutex<Vec<(SessionId, String)>>,
    updates: Mutex<Vec<(SessionId, SessionUpdate)>>,
}

impl FakeGateway {
    pub fn add_session(&self, id: &str, routing: RoutingKey, status: SessionStatus) -> SessionRecord {
        let mode = if routing.thread.is_some() {
            SessionMode::Thread
        } else {
            SessionMode::Channel
        };
        let reg = SessionRegistration::new(
            "/work/app",
            mode,
            routing.clone(),
            IpcEndpoint::new(format!("/tmp/{id}.sock")),
        )
        .with_session_id(SessionId::new(id));
        let mut record = SessionRecord::from_registration(reg, Utc::now()).unwrap();
        record.status = status;
        self.sessions
            .lock()
            .unwrap()
            .insert(routing, record.clone());
        record
    }

    pub fn set_conversation(&self, id: &str, conversation: ConversationId) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(record) = sessions.values_mut().find(|r| r.session_id.as_str() == id) {
            record.conversation_id = Some(conversation);
        }
    }

    pub fn set_unreachable(&self, id: &str) {
        self.unreachable.lock().unwrap().push(SessionId::new(id));
    }

    pub fn delivered(&self) -> Vec<(SessionId, String)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(SessionId, SessionUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionGateway for FakeGateway {
    async fn lookup(&self, routing: &RoutingKey) -> Result<SessionRecord, ClientError> {
        self.sessions
            .lock()
            .unwrap()
            .get(routing)
            .cloned()
            .ok_or(ClientError::Daemon {
                code: ErrorCode::NotFound,
                message: format!("no session for {routing}"),
            })
    }

    async fn lookup_id(&self, session_id: &SessionId) -> Result<SessionRecord, ClientError> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|r| &r.session_id == session_id)
            .cloned()
            .ok_or(ClientError::Daemon {
                code: ErrorCode::NotFound,
                message: session_id.to_string(),
            })
    }

    async fn list_live(&self) -> Result<Vec<SessionRecord>, ClientError> {
        let mut live: Vec<SessionRecord> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status.is_live())
            .cloned()
            .collect();
        live.sort_by(|a, b| a.session_id.as_str().cmp(b.session_id.as_str()));
        Ok(live)
    }

    async fn send(&self, session_id: &SessionId, payload: &str) -> Result<(), ClientError> {
        if self.unreachable.lock().unwrap().contains(session_id) {
            return Err(ClientError::Daemon {
                code: ErrorCode::ProcessUnreachable,
                message: "connection refused".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((session_id.clone(), payload.to_string()));
        Ok(())
    }

    async fn update(
        &self,
        session_id: &SessionId,
        changes: SessionUpdate,
    ) -> Result<SessionRecord, ClientError> {
        self.updates
            .lock()
            .unwrap()
            .push((session_id.clone(), changes.clone()));
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .values_mut()
            .find(|r| &r.session_id == session_id)
            .ok_or(ClientError::Daemon {
                code: ErrorCode::NotFound,
                message: session_id.to_string(),
            })?;
        record.apply(&changes, Utc::now()).unwrap();
        Ok(record.clone())
    }
}
