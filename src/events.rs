//! Monitor events published to subscribers.

use serde::Serialize;
use uuid::Uuid;

use crate::probe::{Reply, ReplyStatus};

/// Success/failure counts across all endpoints, keyed on each endpoint's latest reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub succeeded: usize,
    pub failed: usize,
    /// Endpoints with no reply yet.
    pub idle: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    EndpointAdded { endpoint_id: Uuid },
    EndpointRemoved { endpoint_id: Uuid },
    ReplyAppended { endpoint_id: Uuid, reply: Reply },
    EndpointStatusChanged { endpoint_id: Uuid, status: ReplyStatus },
    TotalsChanged(Totals),
}
