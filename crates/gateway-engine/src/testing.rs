//! Scripted fakes shared by the engine tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{
    FileHandle, Ingress, MessageRef, UpstreamError, UpstreamEvent, UpstreamMessage,
    UpstreamTransport,
};

enum ReplyScript {
    Reply(Result<UpstreamMessage, UpstreamError>),
    /// Never answer; parks the worker inside the send.
    Hang,
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<ReplyScript>,
    click_results: VecDeque<Result<(), UpstreamError>>,
    subscription_batches: VecDeque<Vec<UpstreamEvent>>,
    sent: Vec<String>,
    clicks: Vec<(i64, usize, usize)>,
    subscribers: Vec<mpsc::UnboundedSender<UpstreamEvent>>,
}

/// Upstream fake driven by pre-queued replies and event batches.
///
/// Each `subscribe()` call consumes one queued batch and pre-loads it into
/// the returned channel, which keeps event delivery deterministic under
/// paused test time.
#[derive(Default)]
pub(crate) struct ScriptedUpstream {
    state: Mutex<ScriptState>,
}

impl ScriptedUpstream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn queue_reply(&self, reply: Result<UpstreamMessage, UpstreamError>) {
        self.state
            .lock()
            .unwrap()
            .replies
            .push_back(ReplyScript::Reply(reply));
    }

    pub(crate) fn queue_hanging_reply(&self) {
        self.state.lock().unwrap().replies.push_back(ReplyScript::Hang);
    }

    pub(crate) fn queue_click_result(&self, result: Result<(), UpstreamError>) {
        self.state.lock().unwrap().click_results.push_back(result);
    }

    pub(crate) fn queue_subscription_batch(&self, events: Vec<UpstreamEvent>) {
        self.state
            .lock()
            .unwrap()
            .subscription_batches
            .push_back(events);
    }

    /// Pushes an event to every live subscriber.
    pub(crate) fn emit(&self, event: UpstreamEvent) {
        let state = self.state.lock().unwrap();
        for tx in &state.subscribers {
            let _ = tx.send(event.clone());
        }
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn clicks(&self) -> Vec<(i64, usize, usize)> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub(crate) fn live_subscribers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedUpstream {
    async fn send_and_wait(
        &self,
        text: &str,
        _timeout: Duration,
    ) -> Result<UpstreamMessage, UpstreamError> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.sent.push(text.to_string());
            state.replies.pop_front()
        };
        match script {
            Some(ReplyScript::Reply(reply)) => reply,
            Some(ReplyScript::Hang) => std::future::pending().await,
            None => Err(UpstreamError::Timeout),
        }
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<UpstreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.subscription_batches.pop_front() {
            for event in batch {
                let _ = tx.send(event);
            }
        }
        state.subscribers.push(tx);
        rx
    }

    async fn click(&self, message_id: i64, row: usize, col: usize) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().unwrap();
        state.clicks.push((message_id, row, col));
        state.click_results.pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct IngressLog {
    texts: Vec<(i64, String)>,
    edits: Vec<(MessageRef, String)>,
    files: Vec<(i64, PathBuf, String)>,
}

/// Ingress fake that records outbound traffic and serves canned documents.
#[derive(Default)]
pub(crate) struct RecordingIngress {
    log: Mutex<IngressLog>,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    next_message_id: AtomicI64,
}

impl RecordingIngress {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put_document(&self, id: &str, bytes: Vec<u8>) {
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes);
    }

    pub(crate) fn texts(&self) -> Vec<(i64, String)> {
        self.log.lock().unwrap().texts.clone()
    }

    pub(crate) fn files(&self) -> Vec<(i64, PathBuf, String)> {
        self.log.lock().unwrap().files.clone()
    }

    pub(crate) fn edits(&self) -> Vec<(MessageRef, String)> {
        self.log.lock().unwrap().edits.clone()
    }
}

#[async_trait]
impl Ingress for RecordingIngress {
    async fn fetch_bytes(&self, file: &FileHandle) -> anyhow::Result<Vec<u8>> {
        self.documents
            .lock()
            .unwrap()
            .get(&file.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown document {}", file.id))
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<MessageRef> {
        let mut log = self.log.lock().unwrap();
        log.texts.push((chat_id, text.to_string()));
        Ok(MessageRef {
            chat_id,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_text(&self, message: &MessageRef, text: &str) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .edits
            .push((*message, text.to_string()));
        Ok(())
    }

    async fn send_file(&self, chat_id: i64, path: &Path, filename: &str) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .files
            .push((chat_id, path.to_path_buf(), filename.to_string()));
        Ok(())
    }
}

/// Lets spawned reply tails and event fan-out settle under paused time.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
