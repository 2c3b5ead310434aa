//! A single in-flight generation: request, answer accumulation and
//! cancellation.

use std::sync::Arc;

use eddy_api::{
    ByteStream, ChatApi, ChatRequest, Message, MessageId, ServerEvent, decode_events,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::Outcome;

/// Lifecycle of a session. `Terminal` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Request not yet sent
    Pending,
    /// Response body is being consumed
    Streaming,
    /// No further fragments will be applied
    Terminal,
}

/// Progress reported while consuming the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The server's task id became known
    TaskId(String),
    /// Full answer accumulated so far
    Answer(String),
}

/// Why the session ended
#[derive(Debug)]
pub enum SessionEnd {
    Completed,
    Stopped,
    Failed(eddy_api::Error),
}

impl SessionEnd {
    pub fn outcome(&self) -> Outcome {
        match self {
            SessionEnd::Completed => Outcome::Completed,
            SessionEnd::Stopped => Outcome::Stopped,
            SessionEnd::Failed(e) => Outcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// Final state of a consumed session
#[derive(Debug)]
pub struct SessionReport {
    /// Local id of the message the session wrote to
    pub message_id: MessageId,
    pub end: SessionEnd,
    pub answer: String,
    pub task_id: Option<String>,
    /// Id under which the server persisted the message
    pub server_message_id: Option<MessageId>,
    /// Conversation the server filed the message under
    pub conversation_id: Option<String>,
}

#[derive(Debug)]
struct Shared {
    state: SessionState,
    task_id: Option<String>,
    cancelled: bool,
}

/// A cloneable handle for stopping a session from outside its consumer.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    api: Arc<dyn ChatApi>,
    user: String,
}

impl SessionHandle {
    /// Stop the generation.
    ///
    /// The first call marks the session terminal and detaches the consumer
    /// from the body. When the task id is already known a best-effort
    /// cancel request is spawned and its handle returned; its failure is
    /// only logged. Later calls, and calls after the session ended on its
    /// own, do nothing.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let task_id = {
            let mut shared = self.shared.lock();
            if shared.cancelled || shared.state == SessionState::Terminal {
                return None;
            }
            shared.cancelled = true;
            shared.state = SessionState::Terminal;
            shared.task_id.clone()
        };
        self.cancel.cancel();

        let Some(task_id) = task_id else {
            tracing::debug!("Stopped before a task id was known; cancelling locally only");
            return None;
        };

        let api = Arc::clone(&self.api);
        let user = self.user.clone();
        Some(tokio::spawn(async move {
            match api.cancel_task(&task_id, &user).await {
                Ok(()) => tracing::debug!("Server acknowledged stop of task {}", task_id),
                Err(e) => tracing::warn!("Failed to stop task {} on the server: {}", task_id, e),
            }
        }))
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == SessionState::Terminal
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    pub fn task_id(&self) -> Option<String> {
        self.shared.lock().task_id.clone()
    }
}

/// One query in flight.
///
/// Created `Pending`; [`open`](Self::open) sends the request and
/// [`consume`](Self::consume) reads the body until a terminal state.
pub struct GenerationSession {
    message_id: MessageId,
    request: ChatRequest,
    answer: String,
    server_message_id: Option<MessageId>,
    conversation_id: Option<String>,
    handle: SessionHandle,
}

impl GenerationSession {
    /// Create a session for `request` with a fresh local message id
    pub fn new(api: Arc<dyn ChatApi>, request: ChatRequest) -> Self {
        let handle = SessionHandle {
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Pending,
                task_id: None,
                cancelled: false,
            })),
            cancel: CancellationToken::new(),
            user: request.user.clone(),
            api,
        };

        Self {
            message_id: MessageId::local(),
            request,
            answer: String::new(),
            server_message_id: None,
            conversation_id: None,
            handle,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// The message to insert into the store before streaming starts
    pub fn placeholder(&self) -> Message {
        let mut message = Message::pending(self.message_id.clone(), self.request.query.clone());
        if !self.request.conversation_id.is_empty() {
            message.conversation_id = Some(self.request.conversation_id.clone());
        }
        message
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn stop(&self) -> Option<JoinHandle<()>> {
        self.handle.stop()
    }

    /// Send the request and return the response body.
    ///
    /// Moves the session to `Streaming`. A transport failure ends the
    /// session; so does a `stop` while the request is in flight, which
    /// yields [`eddy_api::Error::Aborted`].
    pub async fn open(&self) -> eddy_api::Result<ByteStream> {
        let result = tokio::select! {
            biased;
            _ = self.handle.cancel.cancelled() => Err(eddy_api::Error::Aborted),
            result = self.handle.api.send_query(&self.request) => result,
        };

        let mut shared = self.handle.shared.lock();
        match result {
            Ok(body) if shared.state == SessionState::Pending => {
                shared.state = SessionState::Streaming;
                Ok(body)
            }
            Ok(_) => Err(eddy_api::Error::Aborted),
            Err(e) => {
                shared.state = SessionState::Terminal;
                Err(e)
            }
        }
    }

    /// Consume the response body until it ends, fails or is stopped.
    ///
    /// `on_update` sees every fragment in wire order as the full answer so
    /// far, plus the task id once it is known. The stop token is checked
    /// between events.
    pub async fn consume<F>(mut self, body: ByteStream, mut on_update: F) -> SessionReport
    where
        F: FnMut(SessionUpdate) + Send,
    {
        let cancel = self.handle.cancel.clone();
        let mut events = decode_events(body);
        let mut fragments = 0usize;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Stopped,
                next = events.next() => next,
            };

            match next {
                None => break SessionEnd::Completed,
                Some(Err(e)) => break SessionEnd::Failed(e),
                Some(Ok(event)) => {
                    if let Some(end) = self.apply(&event, &mut fragments, &mut on_update) {
                        break end;
                    }
                }
            }
        };
        drop(events);

        let task_id = {
            let mut shared = self.handle.shared.lock();
            shared.state = SessionState::Terminal;
            shared.task_id.clone()
        };

        match &end {
            SessionEnd::Failed(e) => tracing::warn!(
                "Generation for {} failed after {} fragments: {}",
                self.message_id,
                fragments,
                e
            ),
            other => tracing::info!(
                "Generation for {} ended ({:?}) after {} fragments, {} chars",
                self.message_id,
                other.outcome(),
                fragments,
                self.answer.chars().count()
            ),
        }

        SessionReport {
            message_id: self.message_id,
            end,
            answer: self.answer,
            task_id,
            server_message_id: self.server_message_id,
            conversation_id: self.conversation_id,
        }
    }

    /// Apply one event. Returns the end of the session when the event
    /// terminates it.
    fn apply<F>(
        &mut self,
        event: &ServerEvent,
        fragments: &mut usize,
        on_update: &mut F,
    ) -> Option<SessionEnd>
    where
        F: FnMut(SessionUpdate),
    {
        if let Some(task_id) = event.task_id() {
            let recorded = {
                let mut shared = self.handle.shared.lock();
                if shared.task_id.is_none() && shared.state == SessionState::Streaming {
                    shared.task_id = Some(task_id.to_string());
                    true
                } else {
                    false
                }
            };
            if recorded {
                tracing::debug!("Task {} started for {}", task_id, self.message_id);
                on_update(SessionUpdate::TaskId(task_id.to_string()));
            }
        }

        if self.server_message_id.is_none() {
            self.server_message_id = event.message_id().map(MessageId::from);
        }
        if self.conversation_id.is_none() {
            self.conversation_id = event.conversation_id().map(str::to_string);
        }

        if event.is_error() {
            return Some(SessionEnd::Failed(eddy_api::Error::Server {
                code: event.code.clone().unwrap_or_else(|| "unknown".to_string()),
                message: event.message.clone().unwrap_or_default(),
            }));
        }

        if let Some(fragment) = event.answer_fragment() {
            self.answer.push_str(fragment);
            *fragments += 1;
            on_update(SessionUpdate::Answer(self.answer.clone()));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockApi, data_line};

    fn session(api: &Arc<MockApi>, query: &str) -> GenerationSession {
        let api: Arc<dyn ChatApi> = api.clone();
        GenerationSession::new(api, ChatRequest::streaming("user123", None, query))
    }

    #[test]
    fn test_placeholder_is_empty_and_local() {
        let api = Arc::new(MockApi::new());
        let s = session(&api, "hello");
        let placeholder = s.placeholder();
        assert_eq!(placeholder.query, "hello");
        assert_eq!(placeholder.answer, "");
        assert!(placeholder.id.is_local());
        assert_eq!(&placeholder.id, s.message_id());
        assert_eq!(s.handle().state(), SessionState::Pending);
    }

    #[tokio::test]
    async fn test_fragments_accumulate_in_order() {
        let api = Arc::new(MockApi::new());
        api.push_lines(&[
            &data_line(r#"{"task_id":"t1","answer":"A"}"#),
            &data_line(r#"{"task_id":"t1","answer":"B"}"#),
            &data_line(r#"{"task_id":"t1","answer":"C","message_id":"m9","conversation_id":"c1"}"#),
        ]);

        let s = session(&api, "q");
        let handle = s.handle();
        let body = s.open().await.unwrap();
        assert_eq!(handle.state(), SessionState::Streaming);

        let mut updates = Vec::new();
        let report = s.consume(body, |u| updates.push(u)).await;

        assert!(matches!(report.end, SessionEnd::Completed));
        assert_eq!(report.answer, "ABC");
        assert_eq!(report.task_id.as_deref(), Some("t1"));
        assert_eq!(report.server_message_id, Some(MessageId::from("m9")));
        assert_eq!(report.conversation_id.as_deref(), Some("c1"));
        assert_eq!(
            updates,
            vec![
                SessionUpdate::TaskId("t1".into()),
                SessionUpdate::Answer("A".into()),
                SessionUpdate::Answer("AB".into()),
                SessionUpdate::Answer("ABC".into()),
            ]
        );
        assert!(handle.is_terminal());
    }

    #[tokio::test]
    async fn test_every_update_extends_the_previous_one() {
        let api = Arc::new(MockApi::new());
        let lines: Vec<String> = ["Hel", "lo, ", "wör", "ld", "!"]
            .iter()
            .map(|f| data_line(&serde_json::json!({ "answer": f }).to_string()))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        api.push_lines(&refs);

        let s = session(&api, "q");
        let body = s.open().await.unwrap();
        let mut answers: Vec<String> = Vec::new();
        let report = s
            .consume(body, |u| {
                if let SessionUpdate::Answer(a) = u {
                    answers.push(a);
                }
            })
            .await;

        assert_eq!(report.answer, "Hello, wörld!");
        for pair in answers.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_on_open() {
        let api = Arc::new(MockApi::new());
        api.push_failure(503);

        let s = session(&api, "q");
        let handle = s.handle();
        let err = s.open().await.err().unwrap();
        assert!(err.is_transport());
        assert!(handle.is_terminal());
        assert!(handle.stop().is_none());
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_partial_answer() {
        let api = Arc::new(MockApi::new());
        api.push_lines(&[
            &data_line(r#"{"answer":"partial"}"#),
            "data: {broken",
            &data_line(r#"{"answer":" never"}"#),
        ]);

        let s = session(&api, "q");
        let body = s.open().await.unwrap();
        let report = s.consume(body, |_| {}).await;

        assert!(matches!(&report.end, SessionEnd::Failed(e) if e.is_protocol()));
        assert_eq!(report.answer, "partial");
    }

    #[tokio::test]
    async fn test_server_error_event_ends_session() {
        let api = Arc::new(MockApi::new());
        api.push_lines(&[
            &data_line(r#"{"event":"message","answer":"so far"}"#),
            &data_line(r#"{"event":"error","code":"quota_exceeded","message":"out of credits"}"#),
        ]);

        let s = session(&api, "q");
        let body = s.open().await.unwrap();
        let report = s.consume(body, |_| {}).await;

        match report.end {
            SessionEnd::Failed(eddy_api::Error::Server { code, message }) => {
                assert_eq!(code, "quota_exceeded");
                assert_eq!(message, "out of credits");
            }
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(report.answer, "so far");
    }

    #[tokio::test]
    async fn test_task_id_recorded_once() {
        let api = Arc::new(MockApi::new());
        api.push_lines(&[
            &data_line(r#"{"answer":"a"}"#),
            &data_line(r#"{"task_id":"t1","answer":"b"}"#),
            &data_line(r#"{"task_id":"t2","answer":"c"}"#),
        ]);

        let s = session(&api, "q");
        let body = s.open().await.unwrap();
        let mut task_ids = Vec::new();
        let report = s
            .consume(body, |u| {
                if let SessionUpdate::TaskId(t) = u {
                    task_ids.push(t);
                }
            })
            .await;

        assert_eq!(task_ids, vec!["t1".to_string()]);
        assert_eq!(report.task_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_stop_before_open_aborts_locally() {
        let api = Arc::new(MockApi::new());
        api.push_lines(&[&data_line(r#"{"answer":"x"}"#)]);

        let s = session(&api, "q");
        assert!(s.stop().is_none());
        let err = s.open().await.err().unwrap();
        assert!(matches!(err, eddy_api::Error::Aborted));
        assert!(api.cancelled_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_cancels_once() {
        let api = Arc::new(MockApi::new());
        let tx = api.push_channel();

        let s = session(&api, "q");
        let handle = s.handle();
        let body = s.open().await.unwrap();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = tokio::spawn(s.consume(body, move |u| {
            let _ = seen_tx.send(u);
        }));

        tx.send(Ok(data_line(r#"{"task_id":"t1","answer":"Hi"}"#).into_bytes()))
            .await
            .unwrap();
        assert_eq!(seen_rx.recv().await, Some(SessionUpdate::TaskId("t1".into())));
        assert_eq!(seen_rx.recv().await, Some(SessionUpdate::Answer("Hi".into())));

        let request = handle.stop().expect("cancel request");
        assert!(handle.stop().is_none());
        request.await.unwrap();

        let _ = tx
            .send(Ok(data_line(r#"{"answer":" late"}"#).into_bytes()))
            .await;
        let report = consumer.await.unwrap();

        assert!(matches!(report.end, SessionEnd::Stopped));
        assert_eq!(report.answer, "Hi");
        assert_eq!(api.cancelled_tasks(), vec!["t1".to_string()]);
        assert!(handle.is_cancelled());
        assert!(handle.is_terminal());
    }

    #[tokio::test]
    async fn test_failed_cancel_request_does_not_affect_stop() {
        let api = Arc::new(MockApi::new());
        api.fail_cancel(true);
        let tx = api.push_channel();

        let s = session(&api, "q");
        let handle = s.handle();
        let body = s.open().await.unwrap();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = tokio::spawn(s.consume(body, move |u| {
            let _ = seen_tx.send(u);
        }));
        tx.send(Ok(data_line(r#"{"task_id":"t1"}"#).into_bytes()))
            .await
            .unwrap();
        assert_eq!(seen_rx.recv().await, Some(SessionUpdate::TaskId("t1".into())));

        handle.stop().unwrap().await.unwrap();
        let report = consumer.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Stopped));
        assert!(handle.is_terminal());
    }
}
