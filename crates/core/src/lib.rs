//! Domain types shared by the mock backend crates: typed records, the table
//! catalogue with its relation map, row filters and change events.

pub mod clock;
pub mod event;
pub mod filter;
pub mod table;
pub mod types;

pub use clock::{system_clock, Clock};
pub use event::{ChangeEvent, ChangeKind, ChangeSink, DEFAULT_SCHEMA};
pub use filter::{escape_like, Filter, FilterParseError, Operator};
pub use table::{ConstraintError, OnDelete, Relation, RelationKind, Table};
pub use types::{
    ActivityType, Application, ApplicationActivity, ApplicationStatus, AuthContext, Company, Job,
    NewActivity, NewApplication, NewCompany, Record, Row, UserProfile, UserRow,
};
