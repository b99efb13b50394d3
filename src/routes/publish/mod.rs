pub mod routes;

use serde::Serialize;
use uuid::Uuid;

use crate::distribution::{PublishReport, RoomStats};

// MODELS

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub environment_id: Uuid,
    pub version: u64,
    pub flags: usize,
    pub segments: usize,
}

#[derive(Debug, Serialize)]
pub struct ProjectPublishResponse {
    pub project_id: Uuid,
    pub environments: Vec<PublishReport>,
}

#[derive(Debug, Serialize)]
pub struct DistributionStatsResponse {
    pub rooms: Vec<RoomStats>,
    pub total_subscribers: usize,
}
