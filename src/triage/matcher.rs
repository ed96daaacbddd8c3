//! Property matcher — binds a received fax to a known property.
//!
//! Greedy, tiered search. The first tier that reaches a decision wins:
//! 1. property name + room number (0.95 with sender company, else 0.85)
//! 2. property name only (0.70 unique, 0.80 when disambiguated by company)
//! 3. no match (0.0)

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::directory::PropertyRecord;

/// What is known about the fax when matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchQuery {
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub room_number: Option<String>,
    #[serde(default)]
    pub sender_company: Option<String>,
}

/// Matcher output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub property_id: Option<Uuid>,
    pub property_name: Option<String>,
    pub confidence: f64,
    pub explanation: String,
}

impl MatchResult {
    fn matched(property: &PropertyRecord, confidence: f64, explanation: String) -> Self {
        Self {
            property_id: Some(property.id),
            property_name: Some(property.name.clone()),
            confidence,
            explanation,
        }
    }

    fn none(explanation: impl Into<String>) -> Self {
        Self {
            property_id: None,
            property_name: None,
            confidence: 0.0,
            explanation: explanation.into(),
        }
    }

    pub fn is_match(&self) -> bool {
        self.property_id.is_some()
    }
}

/// Match a query against candidate properties.
///
/// `candidates` may be a pre-filtered superset; every substring check is
/// repeated here.
pub fn match_property(query: &MatchQuery, candidates: &[PropertyRecord]) -> MatchResult {
    let name = non_empty(&query.property_name);
    let room = non_empty(&query.room_number);
    let sender = non_empty(&query.sender_company);

    let Some(name) = name else {
        return MatchResult::none("物件名が抽出されていないため照合不可");
    };

    // Tier 1: name + room number.
    if let Some(room) = room {
        let found: Vec<&PropertyRecord> = candidates
            .iter()
            .filter(|p| contains(&p.name, name))
            .filter(|p| p.room_number.as_deref().is_some_and(|r| contains(r, room)))
            .collect();

        if !found.is_empty() {
            if let Some(sender) = sender
                && let Some(p) = found.iter().find(|p| company_matches(p, sender))
            {
                debug!(property_id = %p.id, "Matched by name, room and company");
                return MatchResult::matched(
                    p,
                    0.95,
                    format!("物件名・部屋番号・管理会社が一致 ({} {})", p.name, room),
                );
            }
            let p = found[0];
            debug!(property_id = %p.id, candidates = found.len(), "Matched by name and room");
            return MatchResult::matched(
                p,
                0.85,
                format!("物件名・部屋番号が一致 ({} {})", p.name, room),
            );
        }
    }

    // Tier 2: name only.
    let by_name: Vec<&PropertyRecord> = candidates
        .iter()
        .filter(|p| contains(&p.name, name))
        .collect();

    match by_name.len() {
        0 => MatchResult::none(format!("物件名「{name}」に一致する物件なし")),
        1 => {
            let p = by_name[0];
            debug!(property_id = %p.id, "Matched uniquely by name");
            MatchResult::matched(p, 0.70, format!("物件名が一意に一致 ({})", p.name))
        }
        n => {
            if let Some(sender) = sender {
                let narrowed: Vec<&&PropertyRecord> = by_name
                    .iter()
                    .filter(|p| company_matches(p, sender))
                    .collect();
                if narrowed.len() == 1 {
                    let p = *narrowed[0];
                    debug!(property_id = %p.id, "Matched by name, disambiguated by company");
                    return MatchResult::matched(
                        p,
                        0.80,
                        format!("物件名候補 {n} 件を管理会社で絞り込み ({})", p.name),
                    );
                }
            }
            debug!(candidates = n, "Ambiguous property name");
            MatchResult::none(format!("物件名「{name}」の候補が {n} 件あり特定不可"))
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Sender headers often carry extra text ("株式会社○○ 御中"), so either side may contain the other.
fn company_matches(property: &PropertyRecord, sender: &str) -> bool {
    property
        .company_name
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .is_some_and(|company| contains(company, sender) || contains(sender, company))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property(name: &str, room: Option<&str>, company: Option<&str>) -> PropertyRecord {
        PropertyRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            room_number: room.map(String::from),
            company_id: company.map(|_| Uuid::new_v4()),
            company_name: company.map(String::from),
        }
    }

    fn query(name: Option<&str>, room: Option<&str>, sender: Option<&str>) -> MatchQuery {
        MatchQuery {
            property_name: name.map(String::from),
            room_number: room.map(String::from),
            sender_company: sender.map(String::from),
        }
    }

    #[test]
    fn name_room_and_company_gives_095() {
        let target = property("サンハイツ", Some("203"), Some("青空不動産"));
        let props = vec![target.clone(), property("グリーンコート", Some("101"), None)];
        let result = match_property(
            &query(Some("サンハイツ"), Some("203"), Some("青空不動産")),
            &props,
        );
        assert_eq!(result.property_id, Some(target.id));
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn name_and_room_without_company_gives_085() {
        let target = property("サンハイツ", Some("203"), Some("青空不動産"));
        let props = vec![target.clone()];
        let result = match_property(&query(Some("サンハイツ"), Some("203"), None), &props);
        assert_eq!(result.property_id, Some(target.id));
        assert_eq!(result.confidence, 0.85);

        let mismatched = match_property(
            &query(Some("サンハイツ"), Some("203"), Some("別会社")),
            &props,
        );
        assert_eq!(mismatched.confidence, 0.85);
    }

    #[test]
    fn sender_header_containing_company_still_matches() {
        let target = property("サンハイツ", Some("203"), Some("青空不動産"));
        let result = match_property(
            &query(Some("サンハイツ"), Some("203"), Some("株式会社青空不動産 御中")),
            &[target.clone()],
        );
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn room_match_picks_company_match_among_several() {
        let a = property("サンハイツ", Some("203"), Some("青空不動産"));
        let b = property("サンハイツ", Some("203"), Some("海辺管理"));
        let result = match_property(
            &query(Some("サンハイツ"), Some("203"), Some("海辺管理")),
            &[a, b.clone()],
        );
        assert_eq!(result.property_id, Some(b.id));
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn unique_name_gives_070() {
        let target = property("グリーンコート", None, None);
        let result = match_property(
            &query(Some("グリーン"), None, None),
            &[target.clone(), property("サンハイツ", None, None)],
        );
        assert_eq!(result.property_id, Some(target.id));
        assert_eq!(result.confidence, 0.70);
    }

    #[test]
    fn ambiguous_name_disambiguated_by_company_gives_080() {
        let a = property("サンハイツ", Some("101"), Some("青空不動産"));
        let b = property("サンハイツ", Some("102"), Some("海辺管理"));
        let result = match_property(&query(Some("サンハイツ"), None, Some("海辺管理")), &[a, b.clone()]);
        assert_eq!(result.property_id, Some(b.id));
        assert_eq!(result.confidence, 0.80);
    }

    #[test]
    fn ambiguous_name_without_disambiguator_is_no_match() {
        let a = property("サンハイツ", Some("101"), None);
        let b = property("サンハイツ", Some("102"), None);
        let result = match_property(&query(Some("サンハイツ"), None, None), &[a, b]);
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
        assert!(result.explanation.contains("2"));
    }

    #[test]
    fn unknown_room_falls_through_to_name_tier() {
        let target = property("サンハイツ", Some("101"), None);
        let result = match_property(&query(Some("サンハイツ"), Some("999"), None), &[target.clone()]);
        assert_eq!(result.property_id, Some(target.id));
        assert_eq!(result.confidence, 0.70);
    }

    #[test]
    fn missing_name_is_no_match() {
        let result = match_property(
            &query(None, Some("203"), Some("青空不動産")),
            &[property("サンハイツ", Some("203"), Some("青空不動産"))],
        );
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn no_candidates_is_no_match() {
        let result = match_property(&query(Some("サンハイツ"), None, None), &[]);
        assert!(!result.is_match());
    }
}
