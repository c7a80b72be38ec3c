//! Batch execution: spreadsheet row ingestion, sequential processing through
//! the job queue, carry-over partitioning when the upstream signals its day
//! limit, and output/pending file assembly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use inngate_core::cache::SqliteTtlCache;
use inngate_core::classify::{cache_key, parse_fields};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::api::Status;
use crate::worker::Job;
use crate::xlsx::{self, CellValue};

const INN_HEADERS: [&str; 4] = ["инн", "inn", "tax_id", "taxid"];
const FIO_HEADERS: [&str; 5] = ["фио", "fio", "full_name", "fullname", "name"];

/// One extracted input row; `row_index` is the 1-based sheet row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InputRow {
    pub(crate) row_index: u32,
    pub(crate) inn: String,
    pub(crate) fio: String,
}

/// One processed row, ready for the output workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowResult {
    pub(crate) inn: String,
    pub(crate) fio: String,
    pub(crate) phone: String,
    pub(crate) email: String,
    pub(crate) status: Status,
}

/// Processed rows plus whatever a day limit left unprocessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    pub(crate) results: Vec<RowResult>,
    pub(crate) pending: Vec<InputRow>,
}

/// Extracts `(ИНН, ФИО)` rows from an uploaded workbook.
///
/// The first row must carry recognizable headers; data rows where both
/// fields are empty are dropped.
pub(crate) fn read_input_rows(data: &[u8]) -> anyhow::Result<Vec<InputRow>> {
    let sheet = xlsx::read_sheet(data)?;
    let Some(header_cells) = sheet.first() else {
        anyhow::bail!("в файле нет строки заголовков");
    };
    let headers: Vec<String> = header_cells.iter().map(cell_to_text).collect();
    let (inn_col, fio_col) = find_columns(&headers)?;

    let mut rows = Vec::new();
    for (idx, cells) in sheet.iter().enumerate().skip(1) {
        let inn = normalize_inn(cells.get(inn_col).unwrap_or(&CellValue::Empty));
        let fio = cell_to_text(cells.get(fio_col).unwrap_or(&CellValue::Empty));
        if inn.is_empty() && fio.is_empty() {
            continue;
        }
        rows.push(InputRow {
            row_index: (idx + 1) as u32,
            inn,
            fio,
        });
    }
    Ok(rows)
}

fn norm_header(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves the INN/FIO column indices from the header row; the first header
/// matching each synonym set wins.
fn find_columns(headers: &[String]) -> anyhow::Result<(usize, usize)> {
    let mut inn_col = None;
    let mut fio_col = None;
    for (idx, header) in headers.iter().enumerate() {
        let h = norm_header(header);
        if inn_col.is_none() && INN_HEADERS.contains(&h.as_str()) {
            inn_col = Some(idx);
        }
        if fio_col.is_none() && FIO_HEADERS.contains(&h.as_str()) {
            fio_col = Some(idx);
        }
    }
    match (inn_col, fio_col) {
        (Some(inn), Some(fio)) => Ok((inn, fio)),
        _ => anyhow::bail!(
            "Не нашёл колонки. Нужны колонки с названиями ИНН/INN и ФИО/FIO (нашёл: {headers:?})."
        ),
    }
}

fn cell_to_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Empty => String::new(),
        CellValue::Text(s) => s.trim().to_string(),
        CellValue::Number(n) => n.to_string(),
    }
}

/// INN must survive numeric-typed cells losslessly: integral floats and
/// strings with a trailing `.0` both collapse to the plain digit string.
fn normalize_inn(cell: &CellValue) -> String {
    match cell {
        CellValue::Empty => String::new(),
        CellValue::Number(n) => {
            if n.fract() == 0.0 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        CellValue::Text(s) => {
            let s = s.trim();
            if s.ends_with(".0") {
                if let Ok(f) = s.parse::<f64>() {
                    if f.fract() == 0.0 {
                        return format!("{}", f as i64);
                    }
                }
            }
            s.to_string()
        }
    }
}

/// Funnels `rows` through the cache and the job queue in order.
///
/// A `LIMIT` result stops the batch: that row and everything after it is
/// returned as pending. Progress is reported every 10 processed rows and
/// once at the end.
pub(crate) async fn run_batch(
    rows: Vec<InputRow>,
    cache: &SqliteTtlCache,
    jobs_tx: &mpsc::Sender<Job>,
    progress: mpsc::UnboundedSender<(usize, usize)>,
) -> BatchOutcome {
    let total = rows.len();
    let mut rows = rows;
    let mut results: Vec<RowResult> = Vec::new();
    let mut pending: Vec<InputRow> = Vec::new();

    let mut i = 0;
    while i < rows.len() {
        match lookup_row(cache, jobs_tx, &rows[i]).await {
            RowLookup::Done(result) => {
                results.push(result);
                if results.len() % 10 == 0 {
                    let _ = progress.send((results.len(), total));
                }
                i += 1;
            }
            RowLookup::DayLimit | RowLookup::Unavailable => {
                // The row that hit the limit is carried over as well.
                pending = rows.split_off(i);
                break;
            }
        }
    }

    let _ = progress.send((results.len(), total));
    BatchOutcome { results, pending }
}

enum RowLookup {
    Done(RowResult),
    DayLimit,
    Unavailable,
}

async fn lookup_row(
    cache: &SqliteTtlCache,
    jobs_tx: &mpsc::Sender<Job>,
    row: &InputRow,
) -> RowLookup {
    match cache.get(&cache_key(&row.inn, &row.fio)).await {
        Ok(Some(entry)) => {
            let fields = parse_fields(&entry.value);
            return RowLookup::Done(RowResult {
                inn: row.inn.clone(),
                fio: row.fio.clone(),
                phone: fields.phone.unwrap_or_default(),
                email: fields.email.unwrap_or_default(),
                status: Status::Ok,
            });
        }
        Ok(None) => {}
        Err(err) => warn!(%err, row = row.row_index, "cache read failed in batch"),
    }

    let (done_tx, done_rx) = oneshot::channel();
    let job = Job {
        inn: row.inn.clone(),
        fio: row.fio.clone(),
        done: done_tx,
    };
    // Rows are flow-controlled by awaiting each completion, so a blocking
    // put here never piles more than one batch row into the queue.
    if jobs_tx.send(job).await.is_err() {
        return RowLookup::Unavailable;
    }
    match done_rx.await {
        Ok(result) if result.status == Status::Limit => RowLookup::DayLimit,
        Ok(result) => RowLookup::Done(RowResult {
            inn: row.inn.clone(),
            fio: row.fio.clone(),
            phone: result.phone,
            email: result.email,
            status: result.status,
        }),
        Err(_) => RowLookup::Unavailable,
    }
}

static FILE_SEQ: AtomicU64 = AtomicU64::new(0);

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M").to_string()
}

fn temp_path(filename: &str) -> PathBuf {
    let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("inngate_{}_{seq}_{filename}", std::process::id()))
}

/// Writes the results workbook; returns `(local path, user-facing filename)`.
pub(crate) fn write_output_file(results: &[RowResult]) -> anyhow::Result<(PathBuf, String)> {
    let filename = format!("output_{}.xlsx", timestamp());
    let path = temp_path(&filename);

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(results.len() + 1);
    rows.push(
        ["ИНН", "ФИО", "Телефон", "Email", "Статус"]
            .map(String::from)
            .to_vec(),
    );
    for r in results {
        rows.push(vec![
            r.inn.clone(),
            r.fio.clone(),
            r.phone.clone(),
            r.email.clone(),
            r.status.to_string(),
        ]);
    }
    xlsx::write_sheet(&path, "results", &rows)?;
    Ok((path, filename))
}

/// Writes the carry-over workbook for rows a day limit left unprocessed.
pub(crate) fn write_pending_file(pending: &[InputRow]) -> anyhow::Result<(PathBuf, String)> {
    let filename = format!("pending_{}.xlsx", timestamp());
    let path = temp_path(&filename);

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(pending.len() + 1);
    rows.push(["ИНН", "ФИО"].map(String::from).to_vec());
    for r in pending {
        rows.push(vec![r.inn.clone(), r.fio.clone()]);
    }
    xlsx::write_sheet(&path, "pending", &rows)?;
    Ok((path, filename))
}
