//! Channel sub-protocol
//!
//! A [`Channel`] opens a bidirectional request/response stream inside one
//! invocable task. Both ends route by the coroutine id of that task and match
//! replies by a per-channel message id.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{CallResult, ErrorInfo, ErrorKind, ThreadMessage};
use crate::transport::MessageSink;

/// Handler invoked for each incoming channel message
pub type ChannelHandler =
    Arc<dyn Fn(String, Vec<JsonValue>) -> BoxFuture<'static, CallResult> + Send + Sync>;

#[derive(Clone)]
struct Binding {
    coroutine_id: u64,
    sink: Arc<dyn MessageSink>,
}

#[derive(Default)]
struct ChannelState {
    binding: Option<Binding>,
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    next_message_id: u64,
    handler: Option<ChannelHandler>,
    closed: bool,
}

/// Nested message stream bound to exactly one coroutine
#[derive(Clone, Default)]
pub struct Channel {
    state: Arc<Mutex<ChannelState>>,
}

impl Channel {
    /// Create an unbound channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel already bound to a coroutine
    pub fn bound(coroutine_id: u64, sink: Arc<dyn MessageSink>) -> Self {
        let channel = Self::new();
        channel.state.lock().binding = Some(Binding { coroutine_id, sink });
        channel
    }

    /// Bind this channel to the coroutine that is about to carry it
    pub fn bind(&self, coroutine_id: u64, sink: Arc<dyn MessageSink>) -> Result<(), ErrorInfo> {
        let mut state = self.state.lock();
        if let Some(binding) = &state.binding {
            return Err(ErrorInfo::new(
                ErrorKind::UsedChannelProvided,
                format!(
                    "Channel is already bound to coroutine '{}'",
                    binding.coroutine_id
                ),
            ));
        }
        state.binding = Some(Binding { coroutine_id, sink });
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().binding.is_some()
    }

    pub fn coroutine_id(&self) -> Option<u64> {
        self.state.lock().binding.as_ref().map(|b| b.coroutine_id)
    }

    /// Number of posted messages still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Install the handler for messages posted by the other end.
    ///
    /// Without a handler every incoming message is answered with `null`.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Vec<JsonValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let handler: ChannelHandler = Arc::new(move |name, data| handler(name, data).boxed());
        self.state.lock().handler = Some(handler);
    }

    /// Send a named message to the other end and wait for its reply
    pub async fn post_message(
        &self,
        name: impl Into<String>,
        data: Vec<JsonValue>,
    ) -> CallResult {
        let (binding, message_id, reply) = {
            let mut state = self.state.lock();
            let binding = match (&state.binding, state.closed) {
                (Some(binding), false) => binding.clone(),
                (Some(binding), true) => {
                    return Err(ErrorInfo::channel_not_found(binding.coroutine_id))
                }
                (None, _) => {
                    return Err(ErrorInfo::new(
                        ErrorKind::ChannelNotFound,
                        "Channel is not bound to a call",
                    ))
                }
            };
            state.next_message_id += 1;
            let message_id = state.next_message_id;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(message_id, tx);
            (binding, message_id, rx)
        };

        let message = ThreadMessage::DirectMessage {
            coroutine_id: binding.coroutine_id,
            message_id,
            name: name.into(),
            data,
        };
        if let Err(e) = binding.sink.send(message) {
            self.state.lock().pending.remove(&message_id);
            return Err(e.into());
        }

        reply
            .await
            .unwrap_or_else(|_| Err(ErrorInfo::channel_not_found(binding.coroutine_id)))
    }

    /// Run the local handler for an incoming message and send the reply
    pub async fn handle_message(&self, message_id: u64, name: String, data: Vec<JsonValue>) {
        let (handler, binding) = {
            let state = self.state.lock();
            (state.handler.clone(), state.binding.clone())
        };

        let result = match handler {
            Some(handler) => AssertUnwindSafe(handler(name, data))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ErrorInfo::internal("Channel handler panicked"))),
            None => Ok(JsonValue::Null),
        };

        let Some(binding) = binding else {
            warn!("Dropping reply to channel message {}: channel is unbound", message_id);
            return;
        };
        let reply = ThreadMessage::DirectMessageReplied {
            coroutine_id: binding.coroutine_id,
            message_id,
            result,
        };
        if let Err(e) = binding.sink.send(reply) {
            warn!(
                "Failed to reply to channel message {} on coroutine {}: {}",
                message_id, binding.coroutine_id, e
            );
        }
    }

    /// Resolve a message this end posted earlier
    pub fn handle_reply(&self, message_id: u64, result: CallResult) -> Result<(), ErrorInfo> {
        let sender = self
            .state
            .lock()
            .pending
            .remove(&message_id)
            .ok_or_else(|| ErrorInfo::message_not_found(message_id))?;
        // The poster may have given up waiting
        let _ = sender.send(result);
        Ok(())
    }

    /// Close the channel once its call has completed.
    ///
    /// Pending posts fail with `ChannelNotFound`. The binding is kept so the
    /// channel can never be reused for another call.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            debug!("Closed channel with {} unanswered messages", dropped);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("coroutine_id", &state.binding.as_ref().map(|b| b.coroutine_id))
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpcError;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<ThreadMessage>>,
    }

    impl MessageSink for RecordingSink {
        fn send(&self, message: ThreadMessage) -> Result<(), IpcError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn test_bind_twice_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::new();
        channel.bind(1, sink.clone()).unwrap();
        let err = channel.bind(2, sink).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UsedChannelProvided);
        assert_eq!(channel.coroutine_id(), Some(1));
    }

    #[tokio::test]
    async fn test_unbound_post_fails() {
        let err = Channel::new().post_message("next", vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelNotFound);
    }

    #[tokio::test]
    async fn test_post_and_reply() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::bound(9, sink.clone());

        let poster = channel.clone();
        let call = tokio::spawn(async move { poster.post_message("next", vec![json!(0)]).await });
        tokio::task::yield_now().await;
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            sink.sent.lock()[0],
            ThreadMessage::DirectMessage {
                coroutine_id: 9,
                message_id: 1,
                name: "next".to_string(),
                data: vec![json!(0)],
            }
        );

        channel.handle_reply(1, Ok(json!(1))).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(1));

        let err = channel.handle_reply(1, Ok(json!(1))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MessageNotFound);
    }

    #[tokio::test]
    async fn test_handle_message_replies_through_sink() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::bound(4, sink.clone());
        channel.on_message(|name, data| async move {
            assert_eq!(name, "double");
            Ok(json!(data[0].as_i64().unwrap_or_default() * 2))
        });

        channel.handle_message(7, "double".to_string(), vec![json!(21)]).await;

        assert_eq!(
            sink.sent.lock()[0],
            ThreadMessage::DirectMessageReplied {
                coroutine_id: 4,
                message_id: 7,
                result: Ok(json!(42)),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_handler_replies_null() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::bound(2, sink.clone());
        channel.handle_message(1, "ping".to_string(), vec![]).await;

        match &sink.sent.lock()[0] {
            ThreadMessage::DirectMessageReplied { result, .. } => {
                assert_eq!(result, &Ok(JsonValue::Null))
            }
            other => panic!("unexpected message: {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_close_fails_pending_posts() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::bound(3, sink);

        let poster = channel.clone();
        let call = tokio::spawn(async move { poster.post_message("next", vec![]).await });
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        channel.close();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelNotFound);
        assert!(channel.post_message("again", vec![]).await.is_err());
    }
}
