use std::sync::Arc;

use inngate_core::cache::SqliteTtlCache;
use inngate_core::classify::{
    self, MaskPolicy, Outcome, SummaryFields, cache_key, extract_summary, is_not_found_message,
    parse_fields,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::api::{GatewayEvent, JobResult, Status, UpstreamError};
use crate::driver::UpstreamDriver;
use crate::engine::GatewayInner;

/// An admitted unit of work. Owned by the queue until the worker takes it;
/// its completion handle is resolved exactly once.
pub(crate) struct Job {
    pub(crate) inn: String,
    pub(crate) fio: String,
    pub(crate) done: oneshot::Sender<JobResult>,
}

pub(crate) struct WorkerContext {
    pub(crate) driver: UpstreamDriver,
    pub(crate) cache: Arc<SqliteTtlCache>,
    pub(crate) mask: Arc<dyn MaskPolicy>,
    pub(crate) inner: Arc<GatewayInner>,
}

/// The single worker serving the upstream. One instance only: a second
/// consumer would break the upstream's rate contract.
pub(crate) async fn run_worker(mut rx: mpsc::Receiver<Job>, ctx: WorkerContext) {
    loop {
        let job = tokio::select! {
            // Once a stop lands, no new job is drained even if one is ready.
            biased;
            _ = ctx.inner.stopped() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let _ = ctx.inner.event_tx.send(GatewayEvent::JobStarted {
            inn: job.inn.clone(),
            fio: job.fio.clone(),
        });
        let result = process_job(&ctx, &job.inn, &job.fio).await;
        let _ = ctx.inner.event_tx.send(GatewayEvent::JobFinished {
            result: result.clone(),
        });
        let _ = job.done.send(result);
    }

    // Fail whatever is still queued so no completion handle is abandoned.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.done.send(shutdown_result(&job.inn, &job.fio));
    }
    let _ = ctx.inner.event_tx.send(GatewayEvent::Stopped);
}

/// Runs one lookup end to end. Never panics and never loses the job: every
/// failure maps to a populated result.
async fn process_job(ctx: &WorkerContext, inn: &str, fio: &str) -> JobResult {
    let key = cache_key(inn, fio);

    // Re-check right before the upstream call; the entry may have appeared
    // while the job sat in the queue.
    match ctx.cache.get(&key).await {
        Ok(Some(entry)) => {
            let fields = parse_fields(&entry.value);
            return result_with_fields(inn, fio, Status::Ok, entry.value, &fields);
        }
        Ok(None) => {}
        Err(err) => {
            error!(%err, "cache read failed");
            let _ = ctx.inner.event_tx.send(GatewayEvent::Error {
                message: format!("cache read failed: {err:#}"),
            });
            return plain_result(inn, fio, Status::Error, CACHE_FAILED.to_string());
        }
    }

    match run_lookup(ctx, inn, fio, &key).await {
        Ok(result) => result,
        Err(err) => upstream_error_result(inn, fio, &err),
    }
}

async fn run_lookup(
    ctx: &WorkerContext,
    inn: &str,
    fio: &str,
    key: &str,
) -> Result<JobResult, UpstreamError> {
    let first = ctx.driver.send_query(&format!("/inn {inn}")).await?;

    if first.buttons_count() == 0 && is_not_found_message(&first.text) {
        return Ok(plain_result(inn, fio, Status::NotFound, NOT_FOUND.to_string()));
    }

    let with_buttons = ctx.driver.await_buttons(&first).await;

    let Some((row, col)) = with_buttons.find_button(fio) else {
        let available = with_buttons.buttons_flat();
        return Ok(plain_result(
            inn,
            fio,
            Status::NotFound,
            button_missing_text(&available),
        ));
    };

    let burst = ctx.driver.click_and_collect(&with_buttons, row, col).await?;

    match classify::classify_burst(Some(&first.text), &burst) {
        Outcome::Limit => Ok(plain_result(inn, fio, Status::Limit, LIMIT.to_string())),
        Outcome::Summary { raw } => {
            let fields = extract_summary(&raw, &*ctx.mask);
            let safe = fields.render();
            if let Err(err) = ctx.cache.set(key, &safe).await {
                error!(%err, "cache write failed");
                let _ = ctx.inner.event_tx.send(GatewayEvent::Error {
                    message: format!("cache write failed: {err:#}"),
                });
                return Ok(plain_result(inn, fio, Status::Error, CACHE_FAILED.to_string()));
            }
            Ok(result_with_fields(inn, fio, Status::Ok, safe, &fields))
        }
        Outcome::NotFound => Ok(plain_result(inn, fio, Status::NotFound, NOT_FOUND.to_string())),
        Outcome::Unrecognized => {
            let text = burst
                .iter()
                .rev()
                .map(|t| t.trim())
                .find(|t| !t.is_empty());
            let safe_text = match text {
                Some(last) => {
                    warn!("click burst carried no summary marker");
                    let fields = extract_summary(last, &*ctx.mask);
                    format!("{NO_SUMMARY}\n\n{}", fields.render())
                }
                None => NO_REPLIES.to_string(),
            };
            Ok(plain_result(inn, fio, Status::Error, safe_text))
        }
    }
}

const CACHE_FAILED: &str = "❌ Внутренняя ошибка кэша. Попробуйте позже.";
const NOT_FOUND: &str = "❌ По запросу ничего не найдено.";
const LIMIT: &str = "⚠️ Лимит запросов на день исчерпан. Попробуйте завтра.";
const NO_SUMMARY: &str = "Получены сообщения после клика, но '📄 Краткая сводка' не найдена.";
const NO_REPLIES: &str = "После клика не удалось получить текстовые сообщения.";

fn button_missing_text(available: &[String]) -> String {
    let mut text = String::from("❌ Не нашёл кнопку по ФИО.\nДоступные кнопки:");
    for label in available.iter().take(30) {
        text.push_str("\n• ");
        text.push_str(label);
    }
    text
}

fn plain_result(inn: &str, fio: &str, status: Status, safe_text: String) -> JobResult {
    JobResult {
        inn: inn.to_string(),
        fio: fio.to_string(),
        phone: String::new(),
        email: String::new(),
        status,
        safe_text,
    }
}

fn result_with_fields(
    inn: &str,
    fio: &str,
    status: Status,
    safe_text: String,
    fields: &SummaryFields,
) -> JobResult {
    JobResult {
        inn: inn.to_string(),
        fio: fio.to_string(),
        phone: fields.phone.clone().unwrap_or_default(),
        email: fields.email.clone().unwrap_or_default(),
        status,
        safe_text,
    }
}

pub(crate) fn shutdown_result(inn: &str, fio: &str) -> JobResult {
    plain_result(
        inn,
        fio,
        Status::Error,
        "⚠️ Сервис останавливается, запрос не выполнен.".to_string(),
    )
}

fn upstream_error_result(inn: &str, fio: &str, err: &UpstreamError) -> JobResult {
    let (status, safe_text) = match err {
        UpstreamError::FloodWait { seconds } => (
            Status::Flood,
            format!("⏳ Telegram попросил подождать ~{seconds} сек. Попробуйте позже."),
        ),
        UpstreamError::SlowMode { seconds } => (
            Status::Flood,
            format!("⏳ В чате slow-mode. Подождите ~{seconds} сек."),
        ),
        UpstreamError::PeerFlood => (
            Status::Flood,
            "⚠️ На аккаунт наложены антиспам-ограничения. Нужна длительная пауза (несколько часов)."
                .to_string(),
        ),
        UpstreamError::WriteForbidden => (
            Status::Forbidden,
            "⛔ Запрет: аккаунту нельзя писать в этот чат/бот (бан/ограничение доступа)."
                .to_string(),
        ),
        UpstreamError::Blocked => (
            Status::Forbidden,
            "⛔ Запрет: целевой бот/пользователь заблокировал аккаунт.".to_string(),
        ),
        UpstreamError::Timeout => (
            Status::Error,
            "❌ Не дождался ответа от бота. Попробуйте позже.".to_string(),
        ),
        UpstreamError::Rpc(name) => (Status::Error, format!("❌ Ошибка Telegram: {name}")),
    };
    plain_result(inn, fio, status, safe_text)
}
