//! Request/response DTOs for the REST surface.
//!
//! Create/update requests are distinct from the domain types so clients
//! never supply server-assigned fields (`id`, timestamps, computed P&L).

use serde::{Deserialize, Serialize};

use crate::domain::*;

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub host_url: String,
    pub api_key: String,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    #[serde(default)]
    pub target_profit: Option<f64>,
    #[serde(default)]
    pub target_loss: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstanceRequest {
    pub name: Option<String>,
    pub host_url: Option<String>,
    pub api_key: Option<String>,
    pub strategy_tag: Option<String>,
    pub target_profit: Option<f64>,
    pub target_loss: Option<f64>,
    pub is_active: Option<bool>,
    pub order_placement_disabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleAnalyzerBody {
    pub mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    pub host_url: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct TestConnectionResponse {
    pub reachable: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWatchlistRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWatchlistRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CloneWatchlistRequest {
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct BindInstancesRequest {
    pub instance_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub status: Option<String>,
    pub instance_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelAllOrdersRequest {
    #[serde(rename = "instanceId")]
    pub instance_id: i64,
    pub strategy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// An `Instance` view stripped for outbound serialization. `api_key` is
/// already `#[serde(skip_serializing)]` on the domain type; this wrapper
/// exists so future instance-scoped fields can diverge from persistence
/// without touching every handler signature.
pub type InstanceView = Instance;
