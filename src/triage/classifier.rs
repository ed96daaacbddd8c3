//! Keyword classifier for received faxes.
//!
//! Each pattern is a (document type, keyword set, base confidence) entry.
//! The pattern with the highest resulting confidence wins; ties keep the
//! earlier-declared pattern so the result is stable for identical input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on keyword-derived confidence.
const MAX_CONFIDENCE: f64 = 0.95;
/// Confidence added for each keyword hit.
const PER_MATCH_BONUS: f64 = 0.05;
/// Fallback when nothing matched.
const OTHER_CONFIDENCE: f64 = 0.5;
/// Fallback when nothing matched but property and room are known.
const PROPERTY_FALLBACK_CONFIDENCE: f64 = 0.7;

/// Document type assigned to a received fax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    ApplicationForm,
    RepairRequest,
    CancellationNotice,
    PropertyConfirmation,
    Invoice,
    Contract,
    Other,
}

impl DocumentType {
    /// Display label used on screen and in notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ApplicationForm => "入居申込書",
            Self::RepairRequest => "修繕依頼",
            Self::CancellationNotice => "解約通知",
            Self::PropertyConfirmation => "物件確認",
            Self::Invoice => "請求書",
            Self::Contract => "契約書",
            Self::Other => "その他",
        }
    }

    /// The string tag stored in the DB.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationForm => "application_form",
            Self::RepairRequest => "repair_request",
            Self::CancellationNotice => "cancellation_notice",
            Self::PropertyConfirmation => "property_confirmation",
            Self::Invoice => "invoice",
            Self::Contract => "contract",
            Self::Other => "other",
        }
    }

    /// Suggested follow-up for staff once the fax is triaged.
    pub fn next_action(&self) -> &'static str {
        match self {
            Self::ApplicationForm => "入居審査を開始し、保証会社へ連絡",
            Self::RepairRequest => "修繕業者を手配し、入居者へ日程を連絡",
            Self::CancellationNotice => "退去立会いの日程を調整",
            Self::PropertyConfirmation => "空室状況を確認して返信",
            Self::Invoice => "請求内容を確認し、支払処理へ回付",
            Self::Contract => "契約内容を確認し、原本を保管",
            Self::Other => "内容を確認して担当者へ回付",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    /// Accepts both the stored tag and the display label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Self::ApplicationForm,
            Self::RepairRequest,
            Self::CancellationNotice,
            Self::PropertyConfirmation,
            Self::Invoice,
            Self::Contract,
            Self::Other,
        ];
        all.into_iter()
            .find(|t| t.as_str() == s || t.label() == s)
            .ok_or_else(|| format!("unknown document type: {s}"))
    }
}

/// Urgency label derived from the fax text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    High,
    Normal,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Detect urgency from keywords. Defaults to `Normal`.
    pub fn detect(text: &str) -> Self {
        let normalized = normalize(text);
        const HIGH: &[&str] = &["大至急", "至急", "緊急", "本日中", "すぐに", "urgent", "asap"];
        const LOW: &[&str] = &["急ぎません", "ご都合の良い時", "お手すきの際"];

        if HIGH.iter().any(|k| normalized.contains(&normalize(k))) {
            Self::High
        } else if LOW.iter().any(|k| normalized.contains(&normalize(k))) {
            Self::Low
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown urgency: {other}")),
        }
    }
}

/// A single classification pattern.
#[derive(Debug, Clone)]
pub struct ClassificationPattern {
    pub document_type: DocumentType,
    pub keywords: Vec<String>,
    pub base_confidence: f64,
}

impl ClassificationPattern {
    pub fn new(document_type: DocumentType, keywords: &[&str], base_confidence: f64) -> Self {
        Self {
            document_type,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            base_confidence,
        }
    }
}

/// Optional metadata known about the fax before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifyMetadata {
    #[serde(default)]
    pub sender_company: Option<String>,
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub room_number: Option<String>,
}

impl ClassifyMetadata {
    fn has_property_and_room(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.property_name) && present(&self.room_number)
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub document_type: DocumentType,
    pub label: String,
    pub confidence: f64,
    /// Keywords that fired for the chosen pattern.
    pub matched_keywords: Vec<String>,
    pub explanation: String,
}

/// Keyword-based document classifier.
pub struct DocumentClassifier {
    patterns: Vec<ClassificationPattern>,
}

impl DocumentClassifier {
    /// Create a classifier with the default real-estate patterns.
    pub fn default_patterns() -> Self {
        let patterns = vec![
            ClassificationPattern::new(
                DocumentType::ApplicationForm,
                &["入居申込", "申込書", "申込者", "連帯保証人", "勤務先", "入居希望日"],
                0.7,
            ),
            ClassificationPattern::new(
                DocumentType::RepairRequest,
                &["修繕", "修理", "故障", "水漏れ", "不具合", "交換希望", "漏水"],
                0.7,
            ),
            ClassificationPattern::new(
                DocumentType::CancellationNotice,
                &["解約", "退去", "明渡", "退室", "解約予定日"],
                0.75,
            ),
            ClassificationPattern::new(
                DocumentType::PropertyConfirmation,
                &["空室", "物件確認", "募集状況", "空き状況", "内見"],
                0.7,
            ),
            ClassificationPattern::new(
                DocumentType::Invoice,
                &["請求書", "請求金額", "振込先", "お支払", "御請求", "支払期限"],
                0.7,
            ),
            ClassificationPattern::new(
                DocumentType::Contract,
                &["契約書", "賃貸借契約", "契約期間", "署名", "捺印", "更新契約"],
                0.7,
            ),
        ];
        Self { patterns }
    }

    /// Create a classifier with custom patterns (for testing).
    pub fn with_patterns(patterns: Vec<ClassificationPattern>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[ClassificationPattern] {
        &self.patterns
    }

    /// Classify OCR text plus optional metadata.
    pub fn classify(&self, text: &str, metadata: &ClassifyMetadata) -> Classification {
        let normalized = normalize(text);

        let mut best: Option<(&ClassificationPattern, f64, Vec<String>)> = None;

        if !normalized.is_empty() {
            for pattern in &self.patterns {
                let hits: Vec<String> = pattern
                    .keywords
                    .iter()
                    .filter(|k| normalized.contains(&normalize(k)))
                    .cloned()
                    .collect();
                if hits.is_empty() {
                    continue;
                }

                let confidence = (pattern.base_confidence + PER_MATCH_BONUS * hits.len() as f64)
                    .min(MAX_CONFIDENCE);

                // Strictly greater: ties keep the earlier pattern.
                if best.as_ref().is_none_or(|(_, c, _)| confidence > *c) {
                    best = Some((pattern, confidence, hits));
                }
            }
        }

        let result = match best {
            Some((pattern, confidence, hits)) => Classification {
                document_type: pattern.document_type,
                label: pattern.document_type.label().to_string(),
                confidence,
                explanation: format!(
                    "{}: キーワード {} 件一致 ({})",
                    pattern.document_type.label(),
                    hits.len(),
                    hits.join(", ")
                ),
                matched_keywords: hits,
            },
            None if metadata.has_property_and_room() => Classification {
                document_type: DocumentType::PropertyConfirmation,
                label: DocumentType::PropertyConfirmation.label().to_string(),
                confidence: PROPERTY_FALLBACK_CONFIDENCE,
                matched_keywords: Vec::new(),
                explanation: "キーワード一致なし。物件名と部屋番号があるため物件確認と推定".into(),
            },
            None => Classification {
                document_type: DocumentType::Other,
                label: DocumentType::Other.label().to_string(),
                confidence: OTHER_CONFIDENCE,
                matched_keywords: Vec::new(),
                explanation: "キーワード一致なし".into(),
            },
        };

        debug!(
            document_type = %result.document_type,
            confidence = result.confidence,
            "Fax classified"
        );
        result
    }
}

/// Lowercase and drop whitespace; OCR often splits Japanese words with spaces.
pub(crate) fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Classification {
        DocumentClassifier::default_patterns().classify(text, &ClassifyMetadata::default())
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn empty_text_falls_back_to_other() {
        let result = classify("");
        assert_eq!(result.document_type, DocumentType::Other);
        assert_eq!(result.label, "その他");
        assert_close(result.confidence, 0.5);
    }

    #[test]
    fn keyword_free_text_falls_back_to_other() {
        let result = classify("いつもお世話になっております。");
        assert_eq!(result.document_type, DocumentType::Other);
        assert_close(result.confidence, 0.5);
        assert!(result.matched_keywords.is_empty());
    }

    #[test]
    fn property_metadata_fallback() {
        let metadata = ClassifyMetadata {
            property_name: Some("サンハイツ".into()),
            room_number: Some("203".into()),
            ..Default::default()
        };
        let result = DocumentClassifier::default_patterns().classify("よろしくお願いします", &metadata);
        assert_eq!(result.document_type, DocumentType::PropertyConfirmation);
        assert_close(result.confidence, 0.7);
    }

    #[test]
    fn property_metadata_requires_both_fields() {
        let metadata = ClassifyMetadata {
            property_name: Some("サンハイツ".into()),
            room_number: Some("  ".into()),
            ..Default::default()
        };
        let result = DocumentClassifier::default_patterns().classify("", &metadata);
        assert_eq!(result.document_type, DocumentType::Other);
    }

    #[test]
    fn single_pattern_confidence_formula() {
        // Two repair keywords, none from other patterns: 0.7 + 0.05 * 2.
        let result = classify("浴室の蛇口が故障し、水漏れしています。");
        assert_eq!(result.document_type, DocumentType::RepairRequest);
        assert_close(result.confidence, 0.8);
        assert_eq!(result.matched_keywords, vec!["故障", "水漏れ"]);
        assert!(result.explanation.contains("故障"));
    }

    #[test]
    fn confidence_is_capped() {
        let result = classify("修繕 修理 故障 水漏れ 不具合 交換希望 漏水");
        assert_eq!(result.document_type, DocumentType::RepairRequest);
        assert_close(result.confidence, 0.95);
    }

    #[test]
    fn highest_confidence_wins() {
        // One invoice keyword (0.75) vs two cancellation keywords (0.85).
        let result = classify("請求書 解約 退去");
        assert_eq!(result.document_type, DocumentType::CancellationNotice);
        assert_close(result.confidence, 0.85);
    }

    #[test]
    fn ties_keep_first_declared_pattern() {
        let classifier = DocumentClassifier::with_patterns(vec![
            ClassificationPattern::new(DocumentType::Invoice, &["alpha"], 0.6),
            ClassificationPattern::new(DocumentType::Contract, &["beta"], 0.6),
        ]);
        let result = classifier.classify("beta alpha", &ClassifyMetadata::default());
        assert_eq!(result.document_type, DocumentType::Invoice);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = DocumentClassifier::with_patterns(vec![ClassificationPattern::new(
            DocumentType::Invoice,
            &["Invoice"],
            0.6,
        )]);
        let result = classifier.classify("PLEASE FIND THE INVOICE ATTACHED", &ClassifyMetadata::default());
        assert_eq!(result.document_type, DocumentType::Invoice);
        assert_close(result.confidence, 0.65);
    }

    #[test]
    fn whitespace_inside_keywords_is_ignored() {
        let result = classify("解 約 通 知");
        assert_eq!(result.document_type, DocumentType::CancellationNotice);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "入居申込書 申込者 山田太郎 勤務先 株式会社テスト";
        let first = classify(text);
        for _ in 0..5 {
            assert_eq!(classify(text), first);
        }
    }

    #[test]
    fn document_type_parses_tag_and_label() {
        assert_eq!("repair_request".parse::<DocumentType>().unwrap(), DocumentType::RepairRequest);
        assert_eq!("修繕依頼".parse::<DocumentType>().unwrap(), DocumentType::RepairRequest);
        assert!("memo".parse::<DocumentType>().is_err());
    }

    #[test]
    fn urgency_detection() {
        assert_eq!(Urgency::detect("大至急ご対応ください"), Urgency::High);
        assert_eq!(Urgency::detect("URGENT: leak"), Urgency::High);
        assert_eq!(Urgency::detect("急ぎませんのでご都合の良い時に"), Urgency::Low);
        assert_eq!(Urgency::detect("ご確認ください"), Urgency::Normal);
    }
}
