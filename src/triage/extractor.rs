//! Field extraction from OCR text.
//!
//! Each document type has its own set of independent regex rules; unknown
//! types fall back to the generic extractor (date + amount). A rule that
//! finds nothing is simply left out of the result.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::triage::classifier::{DocumentType, Urgency};

/// Extracted key/value fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<DocumentType>,
    pub fields: BTreeMap<String, String>,
}

impl ExtractionResult {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// How a captured value is post-processed.
#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Date,
    Amount,
    Text,
}

/// A single extraction rule: first capture group of `regex` becomes `key`.
struct FieldRule {
    key: &'static str,
    regex: Regex,
    kind: ValueKind,
}

fn rule(key: &'static str, pattern: &str, kind: ValueKind) -> FieldRule {
    FieldRule {
        key,
        regex: Regex::new(pattern).expect("extraction pattern must compile"),
        kind,
    }
}

/// Date body shared by several rules: western year or Reiwa era.
const DATE: &str = r"((?:令和\s*(?:\d{1,2}|元)|\d{4})\s*[年/\-.]\s*\d{1,2}\s*[月/\-.]\s*\d{1,2}\s*日?)";
const AMOUNT: &str = r"[¥￥]?\s*([\d,]+)\s*円?";
const SEP: &str = r"\s*[:：]?\s*";

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(令和\s*(?:\d{1,2}|元)|\d{4})\s*[年/\-.]\s*(\d{1,2})\s*[月/\-.]\s*(\d{1,2})")
        .expect("date pattern must compile")
});

static GENERIC_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule("date", DATE, ValueKind::Date),
        rule("amount", r"([\d,]+)\s*円|[¥￥]\s*([\d,]+)", ValueKind::Amount),
    ]
});

static PROPERTY_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule("property_name", &format!(r"(?:物件名|建物名){SEP}([^\s　]+)"), ValueKind::Text),
        rule("room_number", r"(\d{1,4})\s*号室", ValueKind::Text),
    ]
});

static APPLICATION_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule("applicant_name", &format!(r"(?:申込者|契約者)(?:氏名)?{SEP}([^\s　]+(?:[ 　][^\s　:：]+)?)"), ValueKind::Text),
        rule("move_in_date", &format!(r"入居希望日{SEP}{DATE}"), ValueKind::Date),
        rule("rent", &format!(r"賃料{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("deposit", &format!(r"敷金{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("key_money", &format!(r"礼金{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("management_fee", &format!(r"(?:管理費|共益費){SEP}{AMOUNT}"), ValueKind::Amount),
    ]
});

static REPAIR_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule(
            "repair_description",
            &format!(r"(?:修繕内容|故障内容|不具合内容|症状){SEP}([^\n]+)"),
            ValueKind::Text,
        ),
        rule("visit_date", &format!(r"(?:訪問希望日|希望日){SEP}{DATE}"), ValueKind::Date),
    ]
});

static CANCELLATION_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![rule(
        "move_out_date",
        &format!(r"(?:解約日|退去日|明渡日|解約予定日|退去予定日){SEP}{DATE}"),
        ValueKind::Date,
    )]
});

static INVOICE_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule(
            "invoice_amount",
            &format!(r"(?:請求金額|合計金額|ご請求額|御請求額){SEP}{AMOUNT}"),
            ValueKind::Amount,
        ),
        rule("due_date", &format!(r"(?:支払期限|お支払期限|振込期限){SEP}{DATE}"), ValueKind::Date),
    ]
});

static CONTRACT_RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    vec![
        rule("contract_start", &format!(r"(?:契約開始日|契約期間){SEP}{DATE}"), ValueKind::Date),
        rule("rent", &format!(r"賃料{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("deposit", &format!(r"敷金{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("key_money", &format!(r"礼金{SEP}{AMOUNT}"), ValueKind::Amount),
        rule("management_fee", &format!(r"(?:管理費|共益費){SEP}{AMOUNT}"), ValueKind::Amount),
    ]
});

/// Extract fields from OCR text, using the document type when known.
pub fn extract_fields(text: &str, document_type: Option<DocumentType>) -> ExtractionResult {
    let text = normalize_width(text);
    let mut fields = BTreeMap::new();

    let typed: Option<&[FieldRule]> = match document_type {
        Some(DocumentType::ApplicationForm) => Some(APPLICATION_RULES.as_slice()),
        Some(DocumentType::RepairRequest) => Some(REPAIR_RULES.as_slice()),
        Some(DocumentType::CancellationNotice) => Some(CANCELLATION_RULES.as_slice()),
        Some(DocumentType::Invoice) => Some(INVOICE_RULES.as_slice()),
        Some(DocumentType::Contract) => Some(CONTRACT_RULES.as_slice()),
        Some(DocumentType::PropertyConfirmation) => Some(&[] as &[FieldRule]),
        Some(DocumentType::Other) | None => None,
    };

    match typed {
        Some(rules) => {
            apply_rules(rules, &text, &mut fields);
            apply_rules(PROPERTY_RULES.as_slice(), &text, &mut fields);
        }
        None => apply_rules(GENERIC_RULES.as_slice(), &text, &mut fields),
    }

    if document_type == Some(DocumentType::RepairRequest) {
        fields.insert("urgency".into(), Urgency::detect(&text).as_str().to_string());
    }

    ExtractionResult {
        document_type,
        fields,
    }
}

/// Property name and room number only, regardless of document type.
pub fn extract_location(text: &str) -> (Option<String>, Option<String>) {
    let text = normalize_width(text);
    let mut fields = BTreeMap::new();
    apply_rules(PROPERTY_RULES.as_slice(), &text, &mut fields);
    (fields.remove("property_name"), fields.remove("room_number"))
}

fn apply_rules(rules: &[FieldRule], text: &str, fields: &mut BTreeMap<String, String>) {
    for rule in rules {
        let Some(caps) = rule.regex.captures(text) else {
            continue;
        };
        // Alternations may put the value in any group; take the first that matched.
        let Some(raw) = caps.iter().skip(1).flatten().next() else {
            continue;
        };
        let value = match rule.kind {
            ValueKind::Date => normalize_date(raw.as_str()),
            ValueKind::Amount => normalize_amount(raw.as_str()),
            ValueKind::Text => Some(raw.as_str().trim().to_string()).filter(|s| !s.is_empty()),
        };
        if let Some(value) = value {
            fields.entry(rule.key.to_string()).or_insert(value);
        }
    }
}

/// Normalize a date like `2024年3月5日`, `2024/3/5` or `令和6年3月5日` to `2024-03-05`.
///
/// Returns `None` for impossible dates.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = normalize_width(raw);
    let caps = DATE_RE.captures(&raw)?;
    let year_part = caps.get(1)?.as_str();
    let year: i32 = if let Some(era) = year_part.strip_prefix("令和") {
        let era = era.trim();
        let n: i32 = if era == "元" { 1 } else { era.parse().ok()? };
        2018 + n
    } else {
        year_part.parse().ok()?
    };
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;

    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Strip thousands separators from an amount. Returns `None` if no digits remain.
pub fn normalize_amount(raw: &str) -> Option<String> {
    let digits: String = normalize_width(raw)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let trimmed = digits.trim_start_matches('0');
    match (digits.is_empty(), trimmed.is_empty()) {
        (true, _) => None,
        (false, true) => Some("0".to_string()),
        (false, false) => Some(trimmed.to_string()),
    }
}

/// Map full-width digits and punctuation common in OCR output to ASCII.
fn normalize_width(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '，' => ',',
            '／' => '/',
            '：' => ':',
            '－' => '-',
            '．' => '.',
            _ => c,
        })
        .collect()
}
