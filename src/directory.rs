//! Address book — management companies and the properties they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A management company (owner of properties, usual fax counterpart).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fax_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Company {
    pub fn new(name: impl Into<String>, fax_number: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            fax_number,
            created_at: Utc::now(),
        }
    }
}

/// A rentable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn new(name: impl Into<String>, room_number: Option<String>, company_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            room_number,
            company_id,
            created_at: Utc::now(),
        }
    }
}

/// A property joined with its owning company's name, as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: Uuid,
    pub name: String,
    pub room_number: Option<String>,
    pub company_id: Option<Uuid>,
    pub company_name: Option<String>,
}
