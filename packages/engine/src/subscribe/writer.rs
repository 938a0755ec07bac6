use async_trait::async_trait;

use super::message::ServerMessage;
use crate::ParqueError;

/// A long-lived transport the manager fans messages out over (an SSE
/// response, a WebSocket, a test sink). Send failures get the owning
/// connection removed.
#[async_trait]
pub trait SubscriptionWriter: Send + Sync {
    async fn send(&self, message: &ServerMessage) -> Result<(), ParqueError>;

    async fn close(&self);
}

/// Collecting writer for tests and in-process consumers.
#[derive(Default)]
pub struct BufferWriter {
    messages: std::sync::Mutex<Vec<ServerMessage>>,
    fail_sends: std::sync::atomic::AtomicBool,
    closed: std::sync::atomic::AtomicBool,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn fail_future_sends(&self) {
        self.fail_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionWriter for BufferWriter {
    async fn send(&self, message: &ServerMessage) -> Result<(), ParqueError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ParqueError::unavailable("writer send failed"));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
