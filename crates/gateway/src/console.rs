//! Operator console: a stdin/stdout stand-in for the ingress front-end,
//! handy for driving the pipeline locally.

use std::io::{BufRead, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use inngate_engine::{FileHandle, Ingress, IngressPayload, IngressUpdate, MessageRef};

/// The console represents exactly one local operator.
pub const CONSOLE_USER_ID: i64 = 0;
pub const CONSOLE_CHAT_ID: i64 = 0;

pub struct ConsoleIngress {
    next_message_id: AtomicI64,
}

impl ConsoleIngress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_message_id: AtomicI64::new(1),
        })
    }
}

#[async_trait]
impl Ingress for ConsoleIngress {
    async fn fetch_bytes(&self, file: &FileHandle) -> anyhow::Result<Vec<u8>> {
        // Console "uploads" are local paths typed by the operator.
        let path = file.id.clone();
        tokio::task::spawn_blocking(move || Ok(std::fs::read(&path)?))
            .await
            .map_err(|err| anyhow::anyhow!("read task join error: {err:#}"))?
    }

    async fn send_text(&self, _chat_id: i64, text: &str) -> anyhow::Result<MessageRef> {
        println!("bot> {}", text.replace('\n', "\nbot> "));
        Ok(MessageRef {
            chat_id: CONSOLE_CHAT_ID,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_text(&self, _message: &MessageRef, text: &str) -> anyhow::Result<()> {
        println!("bot (upd)> {text}");
        Ok(())
    }

    async fn send_file(&self, _chat_id: i64, path: &Path, filename: &str) -> anyhow::Result<()> {
        println!("bot> файл {filename}: {}", path.display());
        Ok(())
    }
}

/// Reads stdin lines on a dedicated thread; the channel closes on EOF.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        loop {
            print!("you> ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

/// Maps a console line onto an ingress update; `/file <path>` plays the part
/// of a document upload.
pub fn update_from_line(line: &str) -> Option<IngressUpdate> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let payload = match line.strip_prefix("/file ") {
        Some(path) => {
            let path = path.trim();
            let filename = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            IngressPayload::Document(FileHandle {
                id: path.to_string(),
                filename,
            })
        }
        None => IngressPayload::Text(line.to_string()),
    };
    Some(IngressUpdate {
        user_id: CONSOLE_USER_ID,
        chat_id: CONSOLE_CHAT_ID,
        private_chat: true,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lines_become_document_updates() {
        let update = update_from_line("/file /tmp/список.xlsx").unwrap();
        match update.payload {
            IngressPayload::Document(file) => {
                assert_eq!(file.id, "/tmp/список.xlsx");
                assert_eq!(file.filename, "список.xlsx");
            }
            other => panic!("expected a document, got {other:?}"),
        }
    }

    #[test]
    fn plain_lines_become_text_updates() {
        let update = update_from_line("  2222058686; Маркова  ").unwrap();
        assert_eq!(
            update.payload,
            IngressPayload::Text("2222058686; Маркова".to_string())
        );
        assert!(update_from_line("   ").is_none());
    }
}
