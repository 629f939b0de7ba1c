use serde::Serialize;

use applytrack_core::{Application, ApplicationStatus};

/// Kanban view: one column per status, in pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Board {
    pub columns: Vec<BoardColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardColumn {
    pub status: ApplicationStatus,
    pub applications: Vec<Application>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: ApplicationStatus,
    pub count: usize,
}

impl Board {
    /// Groups applications by status. Every status gets a column, empty or not;
    /// cards within a column are most recently updated first.
    pub fn group(applications: Vec<Application>) -> Self {
        let mut columns: Vec<BoardColumn> = ApplicationStatus::ALL
            .iter()
            .map(|status| BoardColumn {
                status: *status,
                applications: Vec::new(),
            })
            .collect();
        for application in applications {
            if let Some(column) = columns
                .iter_mut()
                .find(|column| column.status == application.status)
            {
                column.applications.push(application);
            }
        }
        for column in &mut columns {
            column
                .applications
                .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
        Self { columns }
    }

    pub fn column(&self, status: ApplicationStatus) -> Option<&BoardColumn> {
        self.columns.iter().find(|column| column.status == status)
    }

    pub fn counts(&self) -> Vec<StatusCount> {
        self.columns
            .iter()
            .map(|column| StatusCount {
                status: column.status,
                count: column.applications.len(),
            })
            .collect()
    }

    /// Applications still in progress, i.e. outside terminal columns.
    pub fn active_count(&self) -> usize {
        self.columns
            .iter()
            .filter(|column| !column.status.is_terminal())
            .map(|column| column.applications.len())
            .sum()
    }

    pub fn total(&self) -> usize {
        self.columns
            .iter()
            .map(|column| column.applications.len())
            .sum()
    }
}
