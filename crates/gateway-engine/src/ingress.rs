use std::sync::Arc;

use inngate_core::cache::SqliteTtlCache;
use inngate_core::classify::cache_key;
use inngate_core::quota::PerUserQuota;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::api::{FileHandle, GatewayConfig, GatewayEvent, Ingress, IngressPayload, IngressUpdate};
use crate::batch;
use crate::engine::GatewayInner;
use crate::worker::Job;

const HELP_TEXT: &str = "Бот готов.\nВводи данные так:\nИНН; ФИО\n\nПример:\n2222058686; Маркова Ольга Викторовна";
const BAD_FORMAT: &str =
    "Неверный формат. Нужно: ИНН; ФИО\nПример: 2222058686; Маркова Ольга Викторовна";
const QUEUE_FULL: &str = "⚠️ Очередь перегружена. Попробуйте чуть позже.";
const STOPPING: &str = "⚠️ Сервис останавливается. Попробуйте позже.";
const NOT_XLSX: &str = "Пришлите файл .xlsx с колонками ИНН и ФИО.";
const EMPTY_FILE: &str = "В файле не нашлось ни одной строки с данными.";
const FETCH_FAILED: &str = "❌ Не удалось скачать файл. Попробуйте ещё раз.";

/// Message-handling half of the ingress: everything between a delivered
/// update and the job queue. Transport concerns stay behind the [`Ingress`]
/// trait.
pub(crate) struct IngressRouter {
    cfg: GatewayConfig,
    quota: PerUserQuota,
    cache: Arc<SqliteTtlCache>,
    jobs_tx: mpsc::Sender<Job>,
    ingress: Arc<dyn Ingress>,
    inner: Arc<GatewayInner>,
}

impl IngressRouter {
    pub(crate) fn new(
        cfg: GatewayConfig,
        cache: Arc<SqliteTtlCache>,
        ingress: Arc<dyn Ingress>,
        jobs_tx: mpsc::Sender<Job>,
        inner: Arc<GatewayInner>,
    ) -> Self {
        let quota = PerUserQuota::new(cfg.user_quota_per_hour);
        Self {
            cfg,
            quota,
            cache,
            jobs_tx,
            ingress,
            inner,
        }
    }

    pub(crate) async fn handle_update(&self, update: IngressUpdate) {
        if self.cfg.private_only && !update.private_chat {
            return;
        }
        match update.payload {
            IngressPayload::Text(text) => {
                self.handle_text(update.user_id, update.chat_id, &text).await;
            }
            IngressPayload::Document(file) => {
                self.handle_document(update.user_id, update.chat_id, file)
                    .await;
            }
        }
    }

    /// Best-effort reply; delivery failures are logged, never propagated.
    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.ingress.send_text(chat_id, text).await {
            warn!(chat_id, %err, "ingress send failed");
        }
    }

    async fn handle_text(&self, user_id: i64, chat_id: i64, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if text == "/start" || text == "/help" {
            self.reply(chat_id, HELP_TEXT).await;
            return;
        }
        let Some((inn, fio)) = parse_inn_fio(text) else {
            self.reply(chat_id, BAD_FORMAT).await;
            return;
        };

        if !self.charge_quota(user_id, chat_id).await {
            return;
        }

        match self.cache.get(&cache_key(&inn, &fio)).await {
            Ok(Some(entry)) => {
                self.reply(chat_id, &entry.value).await;
                return;
            }
            Ok(None) => {}
            // The worker re-checks the cache anyway; admit the job.
            Err(err) => warn!(%err, "cache read failed at admission"),
        }

        if self.inner.should_stop() {
            self.reply(chat_id, STOPPING).await;
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            inn,
            fio: fio.clone(),
            done: done_tx,
        };
        if let Err(err) = self.jobs_tx.try_send(job) {
            let text = match err {
                mpsc::error::TrySendError::Full(_) => QUEUE_FULL,
                mpsc::error::TrySendError::Closed(_) => STOPPING,
            };
            self.reply(chat_id, text).await;
            return;
        }
        self.reply(chat_id, &format!("Принято. Поставил в очередь: {fio}"))
            .await;

        // Status line already went out; deliver the result when it lands.
        let ingress = self.ingress.clone();
        tokio::spawn(async move {
            match done_rx.await {
                Ok(result) => {
                    if let Err(err) = ingress.send_text(chat_id, &result.safe_text).await {
                        warn!(chat_id, %err, "ingress send failed");
                    }
                }
                Err(_) => warn!(chat_id, "job completion handle dropped"),
            }
        });
    }

    async fn handle_document(&self, user_id: i64, chat_id: i64, file: FileHandle) {
        if !file.filename.to_lowercase().ends_with(".xlsx") {
            self.reply(chat_id, NOT_XLSX).await;
            return;
        }

        // One quota charge per file, regardless of how many rows it holds.
        if !self.charge_quota(user_id, chat_id).await {
            return;
        }

        let bytes = match self.ingress.fetch_bytes(&file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, filename = %file.filename, "document fetch failed");
                self.reply(chat_id, FETCH_FAILED).await;
                return;
            }
        };
        let rows = match batch::read_input_rows(&bytes) {
            Ok(rows) => rows,
            Err(err) => {
                self.reply(chat_id, &format!("❌ {err}")).await;
                return;
            }
        };
        if rows.is_empty() {
            self.reply(chat_id, EMPTY_FILE).await;
            return;
        }

        let total = rows.len();
        info!(total, filename = %file.filename, "batch admitted");
        let _ = self
            .inner
            .event_tx
            .send(GatewayEvent::BatchStarted { rows: total });

        let progress_ref = self
            .ingress
            .send_text(chat_id, &format!("Обрабатываю файл: 0/{total}"))
            .await
            .ok();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, usize)>();
        let progress_task = {
            let ingress = self.ingress.clone();
            let inner = self.inner.clone();
            tokio::spawn(async move {
                while let Some((done, total)) = progress_rx.recv().await {
                    let _ = inner
                        .event_tx
                        .send(GatewayEvent::BatchProgress { done, total });
                    if let Some(message) = &progress_ref {
                        let _ = ingress
                            .edit_text(message, &format!("Обрабатываю файл: {done}/{total}"))
                            .await;
                    }
                }
            })
        };

        let outcome = batch::run_batch(rows, &self.cache, &self.jobs_tx, progress_tx).await;
        let _ = progress_task.await;

        match batch::write_output_file(&outcome.results) {
            Ok((path, filename)) => {
                if let Err(err) = self.ingress.send_file(chat_id, &path, &filename).await {
                    warn!(chat_id, %err, "ingress file send failed");
                }
            }
            Err(err) => {
                warn!(%err, "output file assembly failed");
                let _ = self.inner.event_tx.send(GatewayEvent::Warning {
                    message: format!("output file assembly failed: {err:#}"),
                });
                self.reply(chat_id, "❌ Не удалось сформировать выходной файл.")
                    .await;
            }
        }

        if !outcome.pending.is_empty() {
            self.reply(
                chat_id,
                &format!(
                    "⚠️ Лимит запросов на день исчерпан. Необработанных строк: {} — они в файле pending.",
                    outcome.pending.len()
                ),
            )
            .await;
            match batch::write_pending_file(&outcome.pending) {
                Ok((path, filename)) => {
                    if let Err(err) = self.ingress.send_file(chat_id, &path, &filename).await {
                        warn!(chat_id, %err, "ingress file send failed");
                    }
                }
                Err(err) => {
                    warn!(%err, "pending file assembly failed");
                    self.reply(chat_id, "❌ Не удалось сформировать файл pending.")
                        .await;
                }
            }
        }

        let _ = self.inner.event_tx.send(GatewayEvent::BatchFinished {
            processed: outcome.results.len(),
            pending: outcome.pending.len(),
        });
    }

    async fn charge_quota(&self, user_id: i64, chat_id: i64) -> bool {
        let (allowed, retry_after) = self.quota.allow(user_id).await;
        if !allowed {
            let mins = retry_after.as_secs() / 60 + 1;
            self.reply(
                chat_id,
                &format!("⏳ Слишком много запросов. Попробуйте через ~{mins} мин."),
            )
            .await;
        }
        allowed
    }
}

fn parse_inn_fio(text: &str) -> Option<(String, String)> {
    let (inn, fio) = text.split_once(';')?;
    let inn = inn.trim();
    let fio = fio.trim();
    if inn.is_empty() || fio.is_empty() {
        return None;
    }
    Some((inn.to_string(), fio.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_semicolon_separated_queries() {
        assert_eq!(
            parse_inn_fio("2222058686; Маркова Ольга Викторовна"),
            Some((
                "2222058686".to_string(),
                "Маркова Ольга Викторовна".to_string()
            ))
        );
        assert_eq!(
            parse_inn_fio("1;Иванов; Иван"),
            Some(("1".to_string(), "Иванов; Иван".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_queries() {
        assert_eq!(parse_inn_fio("нет разделителя"), None);
        assert_eq!(parse_inn_fio("; Иванов"), None);
        assert_eq!(parse_inn_fio("123;   "), None);
    }
}
