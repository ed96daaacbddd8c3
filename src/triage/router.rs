//! Rule-based auto-router for received faxes.
//!
//! Rules are evaluated in priority order (highest first). A rule matches
//! only when every one of its conditions passes; a rule with no conditions
//! matches everything. The first matching rule wins and evaluation stops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::triage::classifier::{DocumentType, Urgency};

/// Confidence reported when a rule matched.
const RULE_CONFIDENCE: f64 = 0.9;
/// Confidence reported when no rule matched.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// A single predicate of a routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    DocumentType { value: DocumentType },
    Urgency { value: Urgency },
    SenderContains { value: String },
    PropertyContains { value: String },
}

impl RuleCondition {
    /// Check this predicate against the fax attributes.
    pub fn matches(&self, input: &RouteInput) -> bool {
        match self {
            Self::DocumentType { value } => input.document_type == Some(*value),
            Self::Urgency { value } => input.urgency == Some(*value),
            Self::SenderContains { value } => contains(input.sender_name.as_deref(), value),
            Self::PropertyContains { value } => contains(input.property_name.as_deref(), value),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::SenderContains { value } | Self::PropertyContains { value }
                if value.trim().is_empty() =>
            {
                Err("substring conditions need a non-empty value".into())
            }
            _ => Ok(()),
        }
    }
}

/// Who a matching rule assigns the fax to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

impl RouteTarget {
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        blank(&self.user_id) && blank(&self.department)
    }
}

/// A persisted routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub active: bool,
    pub conditions: Vec<RuleCondition>,
    pub target: RouteTarget,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingRule {
    pub fn new(
        name: impl Into<String>,
        priority: i64,
        conditions: Vec<RuleCondition>,
        target: RouteTarget,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            active: true,
            conditions,
            target,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate before writing, so stored rules always parse and make sense.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("rule name must not be empty".into());
        }
        if self.target.is_empty() {
            return Err("rule needs a user_id or department target".into());
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        Ok(())
    }

    pub fn matches(&self, input: &RouteInput) -> bool {
        self.conditions.iter().all(|c| c.matches(input))
    }
}

/// Fax attributes considered by the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteInput {
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub property_name: Option<String>,
}

/// Router output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub user_id: Option<String>,
    pub department: Option<String>,
    pub confidence: f64,
    pub explanation: String,
}

impl RoutingDecision {
    pub fn is_assigned(&self) -> bool {
        self.rule_id.is_some()
    }
}

/// Evaluate rules against a fax and return the first full match.
///
/// `rules` need not be sorted or filtered; inactive rules are ignored and the
/// rest are ordered by priority (desc) then name (asc).
pub fn route(rules: &[RoutingRule], input: &RouteInput) -> RoutingDecision {
    let mut ordered: Vec<&RoutingRule> = rules.iter().filter(|r| r.active).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

    for rule in ordered {
        if rule.matches(input) {
            debug!(rule = %rule.name, priority = rule.priority, "Routing rule matched");
            return RoutingDecision {
                rule_id: Some(rule.id),
                rule_name: Some(rule.name.clone()),
                user_id: rule.target.user_id.clone(),
                department: rule.target.department.clone(),
                confidence: RULE_CONFIDENCE,
                explanation: format!("ルール「{}」(優先度 {}) に一致", rule.name, rule.priority),
            };
        }
    }

    debug!("No routing rule matched");
    RoutingDecision {
        rule_id: None,
        rule_name: None,
        user_id: None,
        department: None,
        confidence: DEFAULT_CONFIDENCE,
        explanation: "一致するルールなし。未割当".into(),
    }
}

fn contains(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_user(user: &str) -> RouteTarget {
        RouteTarget {
            user_id: Some(user.into()),
            department: None,
        }
    }

    fn repair_input() -> RouteInput {
        RouteInput {
            document_type: Some(DocumentType::RepairRequest),
            urgency: Some(Urgency::High),
            sender_name: Some("青空不動産".into()),
            property_name: Some("サンハイツ".into()),
        }
    }

    #[test]
    fn higher_priority_rule_wins() {
        let a = RoutingRule::new(
            "repairs-urgent",
            10,
            vec![RuleCondition::DocumentType {
                value: DocumentType::RepairRequest,
            }],
            target_user("user-a"),
        );
        let b = RoutingRule::new(
            "everything-from-aozora",
            5,
            vec![RuleCondition::SenderContains {
                value: "青空".into(),
            }],
            target_user("user-b"),
        );
        // Declaration order must not matter.
        let decision = route(&[b, a.clone()], &repair_input());
        assert_eq!(decision.rule_id, Some(a.id));
        assert_eq!(decision.user_id.as_deref(), Some("user-a"));
        assert_eq!(decision.confidence, 0.9);
        assert!(decision.explanation.contains("repairs-urgent"));
    }

    #[test]
    fn equal_priority_breaks_ties_by_name() {
        let zeta = RoutingRule::new("zeta", 1, vec![], target_user("z"));
        let alpha = RoutingRule::new("alpha", 1, vec![], target_user("a"));
        let decision = route(&[zeta, alpha], &RouteInput::default());
        assert_eq!(decision.user_id.as_deref(), Some("a"));
    }

    #[test]
    fn every_condition_must_pass() {
        let rule = RoutingRule::new(
            "urgent-invoices",
            10,
            vec![
                RuleCondition::DocumentType {
                    value: DocumentType::Invoice,
                },
                RuleCondition::Urgency { value: Urgency::High },
            ],
            target_user("accounting"),
        );
        let decision = route(&[rule], &repair_input());
        assert!(!decision.is_assigned());
    }

    #[test]
    fn no_match_defaults_to_unassigned() {
        let rule = RoutingRule::new(
            "contracts",
            3,
            vec![RuleCondition::DocumentType {
                value: DocumentType::Contract,
            }],
            target_user("legal"),
        );
        let decision = route(&[rule], &repair_input());
        assert!(decision.rule_id.is_none());
        assert!(decision.user_id.is_none());
        assert!(decision.department.is_none());
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let mut rule = RoutingRule::new("all", 100, vec![], target_user("x"));
        rule.active = false;
        assert!(!route(&[rule], &repair_input()).is_assigned());
    }

    #[test]
    fn missing_attribute_fails_predicate() {
        let rule = RoutingRule::new(
            "by-property",
            1,
            vec![RuleCondition::PropertyContains {
                value: "サン".into(),
            }],
            RouteTarget {
                user_id: None,
                department: Some("管理部".into()),
            },
        );
        let input = RouteInput {
            property_name: None,
            ..repair_input()
        };
        assert!(!route(std::slice::from_ref(&rule), &input).is_assigned());
        let decision = route(&[rule], &repair_input());
        assert_eq!(decision.department.as_deref(), Some("管理部"));
    }

    #[test]
    fn validate_rejects_bad_rules() {
        let no_target = RoutingRule::new("r", 1, vec![], RouteTarget::default());
        assert!(no_target.validate().is_err());

        let blank_substring = RoutingRule::new(
            "r",
            1,
            vec![RuleCondition::SenderContains { value: " ".into() }],
            target_user("u"),
        );
        assert!(blank_substring.validate().is_err());

        let ok = RoutingRule::new("r", 1, vec![], target_user("u"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn condition_serialization_is_tagged() {
        let condition = RuleCondition::DocumentType {
            value: DocumentType::Invoice,
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "document_type");
        assert_eq!(json["value"], "invoice");

        let parsed: RuleCondition =
            serde_json::from_str(r#"{"type":"sender_contains","value":"青空"}"#).unwrap();
        assert_eq!(
            parsed,
            RuleCondition::SenderContains {
                value: "青空".into()
            }
        );
    }
}
