use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use applytrack_core::{
    escape_like, ActivityType, Application, ApplicationActivity, ApplicationStatus, Filter,
    NewActivity, NewApplication, Operator, Table,
};
use applytrack_storage::{DbError, Query};

use crate::board::{Board, StatusCount};
use crate::client::MockClient;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("application {0} not found")]
    NotFound(String),
    #[error("note must not be empty")]
    EmptyNote,
    #[error("page must be at least 1")]
    InvalidPage,
    #[error("page size must be between 1 and 100 (got {0})")]
    InvalidPageSize(usize),
}

/// Sortable columns of the list view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    CreatedAt,
    #[default]
    UpdatedAt,
    DateApplied,
    CompanyName,
    JobTitle,
}

impl SortColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::DateApplied => "date_applied",
            Self::CompanyName => "company_name",
            Self::JobTitle => "job_title",
        }
    }
}

/// Filters, ordering and paging of the list view.
#[derive(Debug, Clone, PartialEq)]
pub struct ListParams {
    /// Empty means every status.
    pub statuses: Vec<ApplicationStatus>,
    /// Case-insensitive substring over company name and job title.
    pub search: Option<String>,
    pub applied_from: Option<NaiveDate>,
    pub applied_to: Option<NaiveDate>,
    pub sort: SortColumn,
    pub ascending: bool,
    /// One-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            search: None,
            applied_from: None,
            applied_to: None,
            sort: SortColumn::default(),
            ascending: false,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.page * self.page_size < self.total
    }
}

/// Application together with its activity log, newest entry first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDetail {
    #[serde(flatten)]
    pub application: Application,
    pub activities: Vec<ApplicationActivity>,
}

/// Data-side services behind the board and list views, run as the client's
/// current user.
#[derive(Clone)]
pub struct Tracker {
    client: MockClient,
}

impl Tracker {
    pub fn new(client: MockClient) -> Self {
        Self { client }
    }

    pub async fn create_application(
        &self,
        application: &NewApplication,
    ) -> Result<Application, TrackerError> {
        let created: Application = self
            .client
            .from(Table::Applications)
            .insert_record(application)
            .single()
            .execute()
            .await?
            .decode_one()?
            .ok_or(TrackerError::Db(DbError::NoRows))?;
        info!(stage = "tracker", application_id = %created.id, status = %created.status, "application created");
        Ok(created)
    }

    pub async fn board(&self) -> Result<Board, TrackerError> {
        let applications: Vec<Application> = self
            .client
            .from(Table::Applications)
            .select("*")
            .execute()
            .await?
            .decode()?;
        Ok(Board::group(applications))
    }

    /// Moves an application to `status` and records the transition.
    ///
    /// Moving to `applied` stamps `date_applied` with today's date unless one
    /// is already set. Moving to the current status is a no-op. If the activity
    /// cannot be logged the status change is undone and the error returned.
    pub async fn move_application(
        &self,
        id: &str,
        status: ApplicationStatus,
    ) -> Result<Application, TrackerError> {
        let current = self.fetch(id).await?;
        if current.status == status {
            return Ok(current);
        }

        let mut patch = json!({ "status": status });
        if status == ApplicationStatus::Applied && current.date_applied.is_none() {
            patch["date_applied"] = json!(self.client.now().date_naive());
        }
        let updated: Application = self
            .client
            .from(Table::Applications)
            .update(patch)
            .eq("id", id)
            .single()
            .execute()
            .await?
            .decode_one()?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;

        let logged = self
            .log_activity(NewActivity {
                application_id: id.to_string(),
                activity_type: ActivityType::StatusChange,
                description: Some(format!("Moved from {} to {}", current.status, status)),
                metadata: json!({ "from": current.status, "to": status }),
            })
            .await;
        if let Err(err) = logged {
            self.revert_move(&current).await;
            return Err(err);
        }
        info!(stage = "tracker", application_id = %id, from = %current.status, to = %status, "application moved");
        Ok(updated)
    }

    pub async fn list(&self, params: &ListParams) -> Result<Page<Application>, TrackerError> {
        if params.page == 0 {
            return Err(TrackerError::InvalidPage);
        }
        if params.page_size == 0 || params.page_size > MAX_PAGE_SIZE {
            return Err(TrackerError::InvalidPageSize(params.page_size));
        }

        let filtered = self.filtered(params);
        let total = filtered.clone().select("id").execute().await?.len();

        let from = (params.page - 1) * params.page_size;
        let rows: Vec<Application> = filtered
            .select("*")
            .order(params.sort.as_str(), params.ascending)
            .order("id", true)
            .range(from, from + params.page_size - 1)
            .execute()
            .await?
            .decode()?;

        Ok(Page {
            rows,
            page: params.page,
            page_size: params.page_size,
            total,
        })
    }

    pub async fn add_note(
        &self,
        application_id: &str,
        note: &str,
    ) -> Result<ApplicationActivity, TrackerError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(TrackerError::EmptyNote);
        }
        self.fetch(application_id).await?;
        self.log_activity(NewActivity {
            application_id: application_id.to_string(),
            activity_type: ActivityType::NoteAdded,
            description: Some(note.to_string()),
            metadata: Value::Object(Default::default()),
        })
        .await
    }

    pub async fn application_with_activities(
        &self,
        id: &str,
    ) -> Result<ApplicationDetail, TrackerError> {
        let mut detail: ApplicationDetail = self
            .client
            .from(Table::Applications)
            .select("*, activities:application_activities(*)")
            .eq("id", id)
            .maybe_single()
            .execute()
            .await?
            .decode_one()?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        detail
            .activities
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(detail)
    }

    /// Number of applications per status, every status included.
    pub async fn status_counts(&self) -> Result<Vec<StatusCount>, TrackerError> {
        let statuses: Vec<Value> = self
            .client
            .from(Table::Applications)
            .select("status")
            .execute()
            .await?
            .rows()
            .into_iter()
            .filter_map(|mut row| row.remove("status"))
            .collect();
        Ok(ApplicationStatus::ALL
            .into_iter()
            .map(|status| StatusCount {
                status,
                count: statuses
                    .iter()
                    .filter(|value| value.as_str() == Some(status.as_str()))
                    .count(),
            })
            .collect())
    }

    /// Deletes an application; its activities go with it.
    pub async fn delete_application(&self, id: &str) -> Result<(), TrackerError> {
        let deleted = self
            .client
            .from(Table::Applications)
            .delete()
            .eq("id", id)
            .execute()
            .await?;
        if deleted.is_empty() {
            return Err(TrackerError::NotFound(id.to_string()));
        }
        info!(stage = "tracker", application_id = %id, "application deleted");
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Application, TrackerError> {
        self.client
            .from(Table::Applications)
            .select("*")
            .eq("id", id)
            .maybe_single()
            .execute()
            .await?
            .decode_one()?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Restores the status fields of `previous` after a move could not be logged.
    /// Runs as the service role, pinned to the row's owner.
    async fn revert_move(&self, previous: &Application) {
        let reverted = self
            .client
            .service(Table::Applications)
            .update(json!({
                "status": previous.status,
                "date_applied": previous.date_applied,
            }))
            .eq("id", previous.id.as_str())
            .eq("created_by", previous.created_by.as_str())
            .execute()
            .await;
        match reverted {
            Ok(_) => warn!(stage = "tracker", application_id = %previous.id, "status move reverted after activity log failure"),
            Err(err) => warn!(stage = "tracker", application_id = %previous.id, error = %err, "failed to revert status move"),
        }
    }

    async fn log_activity(&self, activity: NewActivity) -> Result<ApplicationActivity, TrackerError> {
        let logged = self
            .client
            .from(Table::ApplicationActivities)
            .insert_record(&activity)
            .single()
            .execute()
            .await?
            .decode_one()?
            .ok_or(TrackerError::Db(DbError::NoRows))?;
        Ok(logged)
    }

    fn filtered(&self, params: &ListParams) -> Query {
        let mut query = self.client.from(Table::Applications);
        if !params.statuses.is_empty() {
            query = query.in_("status", params.statuses.iter().map(|status| status.as_str()));
        }
        if let Some(search) = params.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                let pattern = format!("%{}%", escape_like(search));
                query = query.filter(Filter::Or(vec![
                    Filter::compare("company_name", Operator::ILike, pattern.as_str()),
                    Filter::compare("job_title", Operator::ILike, pattern.as_str()),
                ]));
            }
        }
        if let Some(from) = params.applied_from {
            query = query.gte("date_applied", from.to_string());
        }
        if let Some(to) = params.applied_to {
            query = query.lte("date_applied", to.to_string());
        }
        query
    }
}
