//! Chat controller: one instance per conversation context.

use std::sync::Arc;

use eddy_api::{ChatApi, ChatRequest, Conversation, Message, MessageId, Rating};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::{
    error::{Error, Result},
    events::{ChatEvent, Outcome},
    session::{GenerationSession, SessionHandle, SessionReport, SessionUpdate},
    store::MessageStore,
};

/// The session currently allowed to flip `generating` back off
struct ActiveSession {
    seq: u64,
    handle: SessionHandle,
}

struct State {
    store: MessageStore,
    conversation_id: Option<String>,
    generating: bool,
    active: Option<ActiveSession>,
    next_seq: u64,
    /// Bumped whenever the store is replaced by another conversation
    epoch: u64,
}

struct Inner {
    api: Arc<dyn ChatApi>,
    user: String,
    state: Mutex<State>,
    event_tx: broadcast::Sender<ChatEvent>,
    /// Stream consumers and cancel requests still running
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Orchestrates generation sessions and the message store.
///
/// Cloning is cheap; all clones drive the same conversation.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

impl ChatController {
    /// Create a controller for `user`, starting with an empty conversation
    pub fn new(api: Arc<dyn ChatApi>, user: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                api,
                user: user.into(),
                state: Mutex::new(State {
                    store: MessageStore::new(),
                    conversation_id: None,
                    generating: false,
                    active: None,
                    next_seq: 0,
                    epoch: 0,
                }),
                event_tx,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to chat events
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Whether a generation is in flight
    pub fn is_generating(&self) -> bool {
        self.inner.state.lock().generating
    }

    /// Server id of the current conversation, if one exists yet
    pub fn conversation_id(&self) -> Option<String> {
        self.inner.state.lock().conversation_id.clone()
    }

    /// Snapshot of all messages in chronological order
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().store.messages().to_vec()
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.state.lock().store.get(id).cloned()
    }

    /// Submit a query and start streaming its answer.
    ///
    /// Returns the id of the placeholder message once the response stream
    /// is open. Rejected with [`Error::Busy`] while generating and with
    /// [`Error::EmptyQuery`] for blank input, without changing any state.
    pub async fn submit(&self, query: &str) -> Result<MessageId> {
        let (session, seq, epoch) = {
            let mut state = self.inner.state.lock();
            if state.generating {
                return Err(Error::Busy);
            }
            if query.trim().is_empty() {
                return Err(Error::EmptyQuery);
            }

            let request =
                ChatRequest::streaming(&self.inner.user, state.conversation_id.as_deref(), query);
            let session = GenerationSession::new(Arc::clone(&self.inner.api), request);
            state.store.append(session.placeholder())?;

            state.next_seq += 1;
            let seq = state.next_seq;
            state.generating = true;
            state.active = Some(ActiveSession {
                seq,
                handle: session.handle(),
            });
            (session, seq, state.epoch)
        };

        let message_id = session.message_id().clone();
        self.inner.emit(ChatEvent::Submitted {
            message_id: message_id.clone(),
            query: query.to_string(),
        });

        let body = match session.open().await {
            Ok(body) => body,
            Err(eddy_api::Error::Aborted) => {
                self.inner.finish(seq, message_id.clone(), Outcome::Stopped);
                return Ok(message_id);
            }
            Err(e) => {
                tracing::warn!("Failed to start generation: {}", e);
                self.inner.finish(
                    seq,
                    message_id,
                    Outcome::Failed {
                        error: e.to_string(),
                    },
                );
                return Err(e.into());
            }
        };

        let inner = Arc::clone(&self.inner);
        let consumer = tokio::spawn(async move {
            let updates = Arc::clone(&inner);
            let id = session.message_id().clone();
            let report = session
                .consume(body, move |update| updates.apply_update(&id, update))
                .await;
            inner.complete(seq, epoch, report);
        });
        self.inner.track(consumer);

        Ok(message_id)
    }

    /// Stop the running generation. Returns `false` when nothing was
    /// running.
    ///
    /// `generating` is cleared immediately; the server is asked to stop in
    /// the background and its answer does not matter.
    pub fn stop(&self) -> bool {
        let active = {
            let mut state = self.inner.state.lock();
            let active = state.active.take();
            if active.is_some() {
                state.generating = false;
            }
            active
        };

        let Some(active) = active else {
            return false;
        };
        if let Some(request) = active.handle.stop() {
            self.inner.track(request);
        }
        true
    }

    /// Submit the query of the most recent message again as a new turn
    pub async fn resend(&self) -> Result<MessageId> {
        let query = {
            let state = self.inner.state.lock();
            if state.generating {
                return Err(Error::Busy);
            }
            state
                .store
                .last()
                .map(|m| m.query.clone())
                .ok_or(Error::NoHistory)?
        };
        self.submit(&query).await
    }

    /// Toggle a rating on a message.
    ///
    /// Giving the rating the message already has clears it. The new value is
    /// persisted first and applied locally only once the write succeeded.
    /// Returns the rating now in effect. Messages the server has not
    /// persisted yet are rejected with [`Error::NotPersisted`].
    pub async fn set_feedback(&self, id: &MessageId, rating: Rating) -> Result<Option<Rating>> {
        let current = {
            let state = self.inner.state.lock();
            state
                .store
                .get(id)
                .ok_or_else(|| Error::UnknownMessage(id.clone()))?
                .rating()
        };
        if id.is_local() {
            return Err(Error::NotPersisted(id.clone()));
        }
        let next = if current == Some(rating) {
            None
        } else {
            Some(rating)
        };

        self.inner
            .api
            .set_feedback(id, next, &self.inner.user)
            .await?;

        let applied = self.inner.state.lock().store.update_feedback(id, next);
        if applied {
            self.inner.emit(ChatEvent::FeedbackChanged {
                message_id: id.clone(),
                rating: next,
            });
        } else {
            tracing::debug!("Message {} left the store before feedback landed", id);
        }
        Ok(next)
    }

    /// Conversations of this controller's user
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.inner.api.list_conversations(&self.inner.user).await?)
    }

    /// Load a conversation's history and make it the current conversation.
    ///
    /// A generation still running for the previous conversation keeps
    /// going, but its updates no longer reach the store.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<usize> {
        let mut messages = self
            .inner
            .api
            .list_messages(conversation_id, &self.inner.user)
            .await?;
        messages.reverse();
        let count = messages.len();

        {
            let mut state = self.inner.state.lock();
            state.store.replace_all(messages)?;
            state.conversation_id = Some(conversation_id.to_string());
            state.epoch += 1;
        }

        self.inner.emit(ChatEvent::HistoryLoaded {
            conversation_id: Some(conversation_id.to_string()),
            count,
        });
        Ok(count)
    }

    /// Start over with an empty conversation
    pub fn new_conversation(&self) {
        {
            let mut state = self.inner.state.lock();
            state.store = MessageStore::new();
            state.conversation_id = None;
            state.epoch += 1;
        }
        self.inner.emit(ChatEvent::HistoryLoaded {
            conversation_id: None,
            count: 0,
        });
    }

    /// Wait for stream consumers and cancel requests to finish
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.inner.background.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Background task failed: {}", e);
                }
            }
        }
    }
}

impl Inner {
    /// Keep a background task for `wait_idle`, dropping finished ones
    fn track(&self, task: JoinHandle<()>) {
        let mut background = self.background.lock();
        background.retain(|t| !t.is_finished());
        background.push(task);
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn apply_update(&self, message_id: &MessageId, update: SessionUpdate) {
        match update {
            SessionUpdate::TaskId(task_id) => self.emit(ChatEvent::TaskStarted {
                message_id: message_id.clone(),
                task_id,
            }),
            SessionUpdate::Answer(answer) => {
                let applied = self.state.lock().store.update_answer(message_id, &answer);
                if applied {
                    self.emit(ChatEvent::AnswerUpdated {
                        message_id: message_id.clone(),
                        answer,
                    });
                }
            }
        }
    }

    /// Release `generating` if `seq` is still the active session
    fn release(state: &mut State, seq: u64) {
        if state.active.as_ref().is_some_and(|a| a.seq == seq) {
            state.active = None;
            state.generating = false;
        }
    }

    fn finish(&self, seq: u64, message_id: MessageId, outcome: Outcome) {
        Self::release(&mut self.state.lock(), seq);
        self.emit(ChatEvent::Finished {
            message_id,
            outcome,
        });
    }

    /// Reconcile a terminal session with the store
    fn complete(&self, seq: u64, epoch: u64, report: SessionReport) {
        let mut final_id = report.message_id.clone();
        {
            let mut state = self.state.lock();
            Self::release(&mut state, seq);

            if state.epoch == epoch {
                if state.conversation_id.is_none() {
                    state.conversation_id = report.conversation_id.clone();
                }
                if let Some(server_id) = report.server_message_id.clone() {
                    match state.store.rekey(&report.message_id, server_id.clone()) {
                        Ok(()) => final_id = server_id,
                        Err(e) => {
                            tracing::warn!("Keeping local id {}: {}", report.message_id, e)
                        }
                    }
                }
            }
        }

        self.emit(ChatEvent::Finished {
            message_id: final_id,
            outcome: report.end.outcome(),
        });
    }
}
