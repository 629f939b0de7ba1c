use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    Application, ApplicationActivity, Company, Job, Record, Row, UserProfile, UserRow,
};

/// Logical tables served by the mock database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Users,
    Profiles,
    Applications,
    Companies,
    ApplicationActivities,
    Jobs,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Self::Users,
        Self::Profiles,
        Self::Applications,
        Self::Companies,
        Self::ApplicationActivities,
        Self::Jobs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Profiles => "profiles",
            Self::Applications => "applications",
            Self::Companies => "companies",
            Self::ApplicationActivities => "application_activities",
            Self::Jobs => "jobs",
        }
    }

    /// Column holding the owning identity, or `None` for shared tables.
    pub fn owner_column(self) -> Option<&'static str> {
        match self {
            Self::Users => Some("id"),
            Self::Profiles => Some("user_id"),
            Self::Applications | Self::ApplicationActivities => Some("created_by"),
            Self::Companies | Self::Jobs => None,
        }
    }

    /// Columns that must be present and non-null on insert.
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::Users => &["email"],
            Self::Profiles => &["user_id"],
            Self::Applications => &["company_name", "job_title", "created_by"],
            Self::Companies => &["name"],
            Self::ApplicationActivities => &["application_id", "activity_type", "created_by"],
            Self::Jobs => &["title"],
        }
    }

    /// Columns that an update may never change.
    pub fn immutable_columns(self) -> Vec<&'static str> {
        let mut columns = vec!["id", "created_at"];
        if let Some(owner) = self.owner_column() {
            if !columns.contains(&owner) {
                columns.push(owner);
            }
        }
        columns
    }

    /// Declared relations for embedding and referential actions.
    pub fn relations(self) -> &'static [Relation] {
        match self {
            Self::Users => &[Relation {
                name: "profiles",
                target: Table::Profiles,
                kind: RelationKind::HasMany,
                foreign_key: "user_id",
                on_delete: OnDelete::Cascade,
            }],
            Self::Profiles => &[Relation {
                name: "users",
                target: Table::Users,
                kind: RelationKind::BelongsTo,
                foreign_key: "user_id",
                on_delete: OnDelete::NoAction,
            }],
            Self::Applications => &[
                Relation {
                    name: "application_activities",
                    target: Table::ApplicationActivities,
                    kind: RelationKind::HasMany,
                    foreign_key: "application_id",
                    on_delete: OnDelete::Cascade,
                },
                Relation {
                    name: "companies",
                    target: Table::Companies,
                    kind: RelationKind::BelongsTo,
                    foreign_key: "company_id",
                    on_delete: OnDelete::NoAction,
                },
            ],
            Self::Companies => &[
                Relation {
                    name: "applications",
                    target: Table::Applications,
                    kind: RelationKind::HasMany,
                    foreign_key: "company_id",
                    on_delete: OnDelete::SetNull,
                },
                Relation {
                    name: "jobs",
                    target: Table::Jobs,
                    kind: RelationKind::HasMany,
                    foreign_key: "company_id",
                    on_delete: OnDelete::SetNull,
                },
            ],
            Self::ApplicationActivities => &[Relation {
                name: "applications",
                target: Table::Applications,
                kind: RelationKind::BelongsTo,
                foreign_key: "application_id",
                on_delete: OnDelete::NoAction,
            }],
            Self::Jobs => &[Relation {
                name: "companies",
                target: Table::Companies,
                kind: RelationKind::BelongsTo,
                foreign_key: "company_id",
                on_delete: OnDelete::NoAction,
            }],
        }
    }

    pub fn relation(self, name: &str) -> Option<&'static Relation> {
        self.relations().iter().find(|relation| relation.name == name)
    }

    /// Validates a complete row and converts it into the typed record.
    pub fn parse_row(self, row: &Row) -> Result<Record, ConstraintError> {
        for column in self.required_columns() {
            match row.get(*column) {
                None | Some(Value::Null) => {
                    return Err(ConstraintError::MissingColumn {
                        table: self,
                        column: column.to_string(),
                    })
                }
                Some(Value::String(value)) if value.trim().is_empty() => {
                    return Err(ConstraintError::MissingColumn {
                        table: self,
                        column: column.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let record = match self {
            Self::Users => Record::User(decode::<UserRow>(self, row)?),
            Self::Profiles => Record::Profile(decode::<UserProfile>(self, row)?),
            Self::Applications => Record::Application(decode::<Application>(self, row)?),
            Self::Companies => Record::Company(decode::<Company>(self, row)?),
            Self::ApplicationActivities => {
                Record::Activity(decode::<ApplicationActivity>(self, row)?)
            }
            Self::Jobs => Record::Job(decode::<Job>(self, row)?),
        };
        Ok(record)
    }
}

fn decode<T: DeserializeOwned>(table: Table, row: &Row) -> Result<T, ConstraintError> {
    serde_json::from_value(Value::Object(row.clone())).map_err(|err| {
        ConstraintError::InvalidValue {
            table,
            detail: err.to_string(),
        }
    })
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == value)
            .ok_or_else(|| format!("unknown table '{value}'"))
    }
}

/// Explicit foreign-key relation between two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Name used to embed the relation in a select, e.g. `application_activities(*)`.
    pub name: &'static str,
    pub target: Table,
    pub kind: RelationKind,
    /// For `HasMany` the column lives on `target`; for `BelongsTo` it lives on the source.
    pub foreign_key: &'static str,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasMany,
    BelongsTo,
}

/// Referential action applied to dependents when a parent row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    SetNull,
    NoAction,
}

/// Constraint violations detected while validating a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("null value in column \"{column}\" of relation \"{table}\" violates not-null constraint")]
    MissingColumn { table: Table, column: String },
    #[error("invalid value for relation \"{table}\": {detail}")]
    InvalidValue { table: Table, detail: String },
}
