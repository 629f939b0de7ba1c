use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::table::Table;

/// Loosely typed row as exchanged with query callers and realtime subscribers.
pub type Row = Map<String, Value>;

/// Pipeline stage of a job application. Declaration order is the board column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Wishlist,
    Applied,
    PhoneScreen,
    Assessment,
    TakeHome,
    Interviewing,
    FinalRound,
    Offered,
    Accepted,
    Rejected,
    Withdrawn,
    Ghosted,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 12] = [
        Self::Wishlist,
        Self::Applied,
        Self::PhoneScreen,
        Self::Assessment,
        Self::TakeHome,
        Self::Interviewing,
        Self::FinalRound,
        Self::Offered,
        Self::Accepted,
        Self::Rejected,
        Self::Withdrawn,
        Self::Ghosted,
    ];

    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wishlist => "wishlist",
            Self::Applied => "applied",
            Self::PhoneScreen => "phone_screen",
            Self::Assessment => "assessment",
            Self::TakeHome => "take_home",
            Self::Interviewing => "interviewing",
            Self::FinalRound => "final_round",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
            Self::Ghosted => "ghosted",
        }
    }

    /// Returns `true` once the application can no longer progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected | Self::Withdrawn | Self::Ghosted
        )
    }
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self::Wishlist
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown application status '{value}'"))
    }
}

/// Kind of entry in an application's activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    StatusChange,
    NoteAdded,
    InterviewScheduled,
    DocumentUploaded,
    ReminderSet,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::NoteAdded => "note_added",
            Self::InterviewScheduled => "interview_scheduled",
            Self::DocumentUploaded => "document_uploaded",
            Self::ReminderSet => "reminder_set",
        }
    }
}

/// Row of the `users` table, mirroring an authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile attached one-to-one to an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked job application owned by a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub company_name: String,
    pub job_title: String,
    #[serde(default)]
    pub status: ApplicationStatus,
    #[serde(default)]
    pub date_applied: Option<NaiveDate>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub salary_range: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub job_url: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Company directory entry shared between all users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Event log entry for an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationActivity {
    pub id: String,
    pub application_id: String,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Job posting, independent of any application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub company_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Typed record stored in one of the tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    User(UserRow),
    Profile(UserProfile),
    Application(Application),
    Company(Company),
    Activity(ApplicationActivity),
    Job(Job),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Self::User(_) => Table::Users,
            Self::Profile(_) => Table::Profiles,
            Self::Application(_) => Table::Applications,
            Self::Company(_) => Table::Companies,
            Self::Activity(_) => Table::ApplicationActivities,
            Self::Job(_) => Table::Jobs,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(row) => &row.id,
            Self::Profile(row) => &row.id,
            Self::Application(row) => &row.id,
            Self::Company(row) => &row.id,
            Self::Activity(row) => &row.id,
            Self::Job(row) => &row.id,
        }
    }

    /// Returns the identity that owns this record, if the table is owner scoped.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::User(row) => Some(&row.id),
            Self::Profile(row) => Some(&row.user_id),
            Self::Application(row) => Some(&row.created_by),
            Self::Activity(row) => Some(&row.created_by),
            Self::Company(_) | Self::Job(_) => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::User(row) => row.created_at,
            Self::Profile(row) => row.created_at,
            Self::Application(row) => row.created_at,
            Self::Company(row) => row.created_at,
            Self::Activity(row) => row.created_at,
            Self::Job(row) => row.created_at,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::User(row) => row.updated_at,
            Self::Profile(row) => row.updated_at,
            Self::Application(row) => row.updated_at,
            Self::Company(row) => row.updated_at,
            Self::Activity(row) => row.updated_at,
            Self::Job(row) => row.updated_at,
        }
    }

    /// Serializes the record into a row.
    pub fn to_row(&self) -> Row {
        let value = match self {
            Self::User(row) => serde_json::to_value(row),
            Self::Profile(row) => serde_json::to_value(row),
            Self::Application(row) => serde_json::to_value(row),
            Self::Company(row) => serde_json::to_value(row),
            Self::Activity(row) => serde_json::to_value(row),
            Self::Job(row) => serde_json::to_value(row),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}

/// Caller identity used for row-level security checks.
///
/// Passed explicitly into every database operation; there is no ambient
/// "current user".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthContext {
    #[default]
    Anonymous,
    User(String),
    /// Privileged role that bypasses row-level security (seeding, triggers).
    Service,
}

impl AuthContext {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            _ => None,
        }
    }

    pub fn bypasses_rls(&self) -> bool {
        matches!(self, Self::Service)
    }

    /// Returns `true` when a row owned by `owner` is visible to this caller.
    pub fn can_access(&self, owner: Option<&str>) -> bool {
        match (self, owner) {
            (Self::Service, _) => true,
            (_, None) => true,
            (Self::User(id), Some(owner)) => id == owner,
            (Self::Anonymous, Some(_)) => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Anonymous => "anon",
            Self::User(_) => "authenticated",
            Self::Service => "service_role",
        }
    }
}

/// Insert payload for an application; required columns are not optional here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewApplication {
    pub company_name: String,
    pub job_title: String,
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_applied: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
}

impl NewApplication {
    pub fn new(company_name: impl Into<String>, job_title: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            job_title: job_title.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ApplicationStatus) -> Self {
        self.status = status;
        self
    }
}

/// Insert payload for an activity log entry.
#[derive(Debug, Clone, Serialize)]
pub struct NewActivity {
    pub application_id: String,
    pub activity_type: ActivityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: Value,
}

/// Insert payload for a company.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewCompany {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}
