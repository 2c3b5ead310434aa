//! Scripted `ChatApi` used by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use eddy_api::{
    ByteStream, ChatApi, ChatRequest, Conversation, Error, Message, MessageId, Rating, Result,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Format one event line as the server sends it
pub(crate) fn data_line(json: &str) -> String {
    format!("data: {}\n", json)
}

enum ScriptedBody {
    Chunks(Vec<Vec<u8>>),
    Channel(mpsc::Receiver<Result<Vec<u8>>>),
    Status(u16),
    /// Response headers never arrive
    Stalled,
}

#[derive(Default)]
pub(crate) struct MockApi {
    bodies: Mutex<VecDeque<ScriptedBody>>,
    requests: Mutex<Vec<ChatRequest>>,
    cancelled: Mutex<Vec<String>>,
    feedback: Mutex<Vec<(MessageId, Option<Rating>)>>,
    history: Mutex<Vec<Message>>,
    conversations: Mutex<Vec<Conversation>>,
    fail_cancel: AtomicBool,
    fail_feedback: AtomicBool,
}

impl MockApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next response body: one chunk per line
    pub(crate) fn push_lines(&self, lines: &[&str]) {
        let chunks = lines
            .iter()
            .map(|line| {
                let mut line = line.to_string();
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                line.into_bytes()
            })
            .collect();
        self.bodies.lock().push_back(ScriptedBody::Chunks(chunks));
    }

    /// Next response body is fed by the returned sender
    pub(crate) fn push_channel(&self) -> mpsc::Sender<Result<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(16);
        self.bodies.lock().push_back(ScriptedBody::Channel(rx));
        tx
    }

    /// Next request is answered with a non-success status
    pub(crate) fn push_failure(&self, status: u16) {
        self.bodies.lock().push_back(ScriptedBody::Status(status));
    }

    /// Next request never gets a response
    pub(crate) fn push_stalled(&self) {
        self.bodies.lock().push_back(ScriptedBody::Stalled);
    }

    pub(crate) fn set_history(&self, newest_first: Vec<Message>) {
        *self.history.lock() = newest_first;
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock() = conversations;
    }

    pub(crate) fn fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_feedback(&self, fail: bool) {
        self.fail_feedback.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn cancelled_tasks(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub(crate) fn feedback_writes(&self) -> Vec<(MessageId, Option<Rating>)> {
        self.feedback.lock().clone()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn list_conversations(&self, _user: &str) -> Result<Vec<Conversation>> {
        Ok(self.conversations.lock().clone())
    }

    async fn list_messages(&self, _conversation_id: &str, _user: &str) -> Result<Vec<Message>> {
        Ok(self.history.lock().clone())
    }

    async fn send_query(&self, request: &ChatRequest) -> Result<ByteStream> {
        self.requests.lock().push(request.clone());
        let body = self.bodies.lock().pop_front();
        match body {
            Some(ScriptedBody::Chunks(chunks)) => {
                Ok(Box::pin(futures::stream::iter(
                    chunks.into_iter().map(Ok::<_, Error>),
                )))
            }
            Some(ScriptedBody::Channel(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
            Some(ScriptedBody::Status(status)) => Err(Error::api(status, "scripted failure")),
            Some(ScriptedBody::Stalled) => std::future::pending().await,
            None => Err(Error::api(500, "no scripted response")),
        }
    }

    async fn cancel_task(&self, task_id: &str, _user: &str) -> Result<()> {
        self.cancelled.lock().push(task_id.to_string());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(Error::api(502, "unreachable"));
        }
        Ok(())
    }

    async fn set_feedback(
        &self,
        message_id: &MessageId,
        rating: Option<Rating>,
        _user: &str,
    ) -> Result<()> {
        if self.fail_feedback.load(Ordering::SeqCst) {
            return Err(Error::api(500, "feedback store down"));
        }
        self.feedback.lock().push((message_id.clone(), rating));
        Ok(())
    }
}
