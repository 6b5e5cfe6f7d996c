//! Flow data model and store.

mod store;

pub use store::FlowStore;

use crate::codec::{Request, Response};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Pending,
    Completed,
    Failed,
}

/// One captured request/response pair plus metadata. `id` is assigned once
/// at construction and never changes; `duration` is set exactly once, when
/// the flow is finalized as `Completed` or `Failed`.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub client_addr: String,
    pub request: Request,
    pub response: Response,
    pub duration: Option<Duration>,
    pub status: FlowStatus,
    /// Short diagnostic reason when `status == Failed` (e.g. "dial: connection refused").
    pub failure_reason: Option<String>,
}

impl Flow {
    /// Start a new flow in `Pending` status at the moment the client
    /// connection is accepted and its request begins parsing.
    pub fn pending(client_addr: String, request: Request) -> Self {
        Flow {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            client_addr,
            request,
            response: Response::new(0, ""),
            duration: None,
            status: FlowStatus::Pending,
            failure_reason: None,
        }
    }

    /// Finalize as `Completed`, recording the response and elapsed duration.
    pub fn complete(&mut self, response: Response) {
        self.response = response;
        self.duration = Some(elapsed_since(self.timestamp));
        self.status = FlowStatus::Completed;
    }

    /// Finalize as `Failed`, recording a short diagnostic reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.duration = Some(elapsed_since(self.timestamp));
        self.status = FlowStatus::Failed;
        self.failure_reason = Some(reason.into());
    }
}

fn elapsed_since(timestamp: DateTime<Utc>) -> Duration {
    (Utc::now() - timestamp)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
