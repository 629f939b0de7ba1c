use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of wall-clock time, injectable so tests can freeze or step it.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
