//! Classification of upstream replies and the safe projection rules.
//!
//! The upstream answers a lookup with a burst of new/edited messages; the
//! interesting one carries a summary block identified by [`SUMMARY_MARKER`].
//! Only three whitelisted fields ever leave this module: FIO, phone, email.
//! Phone and email pass through a [`MaskPolicy`] before projection.

use std::sync::LazyLock;

use regex::Regex;

/// Header line of the upstream's structured summary message.
pub const SUMMARY_MARKER: &str = "📄 Краткая сводка";

static FIO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ФИО:\s*(.+)$").expect("static regex"));
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Телефон:\s*(.+)$").expect("static regex"));
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Email:\s*(.+)$").expect("static regex"));

/// Collapses whitespace runs and casefolds, for label and name comparison.
pub fn normalize_label(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical cache key for a lookup query.
pub fn cache_key(inn: &str, fio: &str) -> String {
    format!("inn:{inn}|fio:{}", normalize_label(fio))
}

/// Whether `text` is the upstream's "daily limit exhausted" notice.
pub fn is_limit_message(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t.contains("лимит запросов") && (t.contains("исчерпан") || t.contains("временно исчерпан"))
}

/// Whether `text` is an explicit "nothing found" reply.
pub fn is_not_found_message(text: &str) -> bool {
    text.trim().to_lowercase().contains("не найдено")
}

/// Newest-first scan for a limit notice among collected texts.
pub fn find_limit_message(texts: &[String]) -> Option<&str> {
    texts
        .iter()
        .rev()
        .map(|t| t.trim())
        .find(|t| !t.is_empty() && is_limit_message(t))
}

/// Newest-first scan for a summary message among collected texts.
pub fn find_summary_message(texts: &[String]) -> Option<&str> {
    texts
        .iter()
        .rev()
        .map(|t| t.trim())
        .find(|t| t.contains(SUMMARY_MARKER))
}

/// Transform applied to phone and email values before projection.
pub trait MaskPolicy: Send + Sync {
    /// Masks a raw phone value.
    fn mask_phone(&self, raw: &str) -> String;
    /// Masks a raw email value.
    fn mask_email(&self, raw: &str) -> String;
}

/// Pass-through policy, in effect until a real masking rule is decided.
pub struct IdentityMask;

impl MaskPolicy for IdentityMask {
    fn mask_phone(&self, raw: &str) -> String {
        raw.to_string()
    }

    fn mask_email(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// The whitelisted fields of a summary. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryFields {
    /// Full name, verbatim.
    pub fio: Option<String>,
    /// Phone, already masked.
    pub phone: Option<String>,
    /// Email, already masked.
    pub email: Option<String>,
}

impl SummaryFields {
    /// Reassembles the canonical safe projection: the marker header followed
    /// by only the present fields, FIO first. Every other line of the raw
    /// message is discarded.
    pub fn render(&self) -> String {
        let mut lines = vec![SUMMARY_MARKER.to_string()];
        if let Some(fio) = &self.fio {
            lines.push(format!("ФИО: {fio}"));
        }
        if let Some(phone) = &self.phone {
            lines.push(format!("Телефон: {phone}"));
        }
        if let Some(email) = &self.email {
            lines.push(format!("Email: {email}"));
        }
        lines.join("\n")
    }
}

/// Pulls the three whitelisted fields out of `text` without masking.
///
/// Used to re-read projections that were already masked before caching.
pub fn parse_fields(text: &str) -> SummaryFields {
    let grab = |re: &Regex| {
        re.captures(text)
            .map(|c| c[1].trim().to_string())
            .filter(|v| !v.is_empty())
    };
    SummaryFields {
        fio: grab(&FIO_RE),
        phone: grab(&PHONE_RE),
        email: grab(&EMAIL_RE),
    }
}

/// Extracts the whitelisted fields from a raw summary and masks them.
pub fn extract_summary(text: &str, mask: &dyn MaskPolicy) -> SummaryFields {
    let mut fields = parse_fields(text);
    fields.phone = fields.phone.map(|p| mask.mask_phone(&p));
    fields.email = fields.email.map(|e| mask.mask_email(&e));
    fields
}

/// Raw outcome of one click-and-collect round, before status mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A summary message was collected; `raw` is its full text.
    Summary {
        /// Verbatim summary message text.
        raw: String,
    },
    /// The upstream reported its daily cap.
    Limit,
    /// The upstream explicitly found nothing.
    NotFound,
    /// Nothing recognizable was collected.
    Unrecognized,
}

/// Classifies a collected burst, first match wins: limit, summary,
/// explicit not-found (judged on the first reply, falling back to the last
/// collected text), otherwise unrecognized.
pub fn classify_burst(first_reply: Option<&str>, collected: &[String]) -> Outcome {
    if find_limit_message(collected).is_some() {
        return Outcome::Limit;
    }
    if let Some(raw) = find_summary_message(collected) {
        return Outcome::Summary {
            raw: raw.to_string(),
        };
    }

    let probe = first_reply
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            collected
                .iter()
                .rev()
                .map(|t| t.trim())
                .find(|t| !t.is_empty())
        });
    match probe {
        Some(text) if is_not_found_message(text) => Outcome::NotFound,
        _ => Outcome::Unrecognized,
    }
}
