//! Client facade, realtime harness and tracker services of the mock backend.

pub mod board;
pub mod client;
pub mod realtime;
pub mod telemetry;
pub mod tracker;

pub use board::{Board, BoardColumn, StatusCount};
pub use client::{ClientAuth, ClientError, ClientOptions, MockClient};
pub use realtime::{
    DispatchReport, EventFilter, RealtimeError, RealtimeHub, ReconnectPolicy, SubscriptionId,
    SubscriptionSpec,
};
pub use tracker::{ApplicationDetail, ListParams, Page, SortColumn, Tracker, TrackerError};
