//! Alert Sink.
//!
//! Every alert is persisted first (append-only, never mutated except to mark
//! resolved); CRITICAL-severity alerts are additionally forwarded to an
//! external notification gateway. The gateway is a trait so tests can
//! substitute a recording double, the same pattern as `BrokerClient`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, warn};

use crate::db::Store;
use crate::domain::{AlertSeverity, SystemAlert};

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, alert: &SystemAlert) -> Result<()>;
}

/// Default gateway: logs only. Wired in by operators who want email/Slack/etc.
pub struct LoggingGateway;

#[async_trait]
impl NotificationGateway for LoggingGateway {
    async fn notify(&self, alert: &SystemAlert) -> Result<()> {
        error!(
            alert_type = %alert.alert_type,
            title = %alert.title,
            message = %alert.message,
            "CRITICAL alert"
        );
        Ok(())
    }
}

pub struct AlertSink {
    store: Store,
    gateway: Arc<dyn NotificationGateway>,
}

impl AlertSink {
    pub fn new(store: Store, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { store, gateway }
    }

    pub fn with_logging_gateway(store: Store) -> Self {
        Self::new(store, Arc::new(LoggingGateway))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn raise(
        &self,
        alert_type: &str,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        details: Option<serde_json::Value>,
        instance_id: Option<i64>,
        watchlist_id: Option<i64>,
    ) -> Result<SystemAlert> {
        let alert = self.store.insert_alert(&SystemAlert {
            id: 0,
            alert_type: alert_type.to_string(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            details,
            instance_id,
            watchlist_id,
            is_resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        })?;

        if severity == AlertSeverity::Critical {
            if let Err(e) = self.gateway.notify(&alert).await {
                warn!(error = %e, alert_id = alert.id, "failed to forward critical alert");
            }
        }

        Ok(alert)
    }

    pub fn resolve(&self, id: i64, resolved_by: &str) -> Result<bool> {
        Ok(self.store.resolve_alert(id, resolved_by)?.rows_changed > 0)
    }

    pub fn resolve_all_of_type(&self, alert_type: &str, resolved_by: &str) -> Result<usize> {
        self.store.resolve_all_alerts_of_type(alert_type, resolved_by)
    }

    pub fn auto_resolve_stale(&self, days: i64) -> Result<usize> {
        self.store.auto_resolve_alerts_older_than_days(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingGateway {
        notified: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationGateway for RecordingGateway {
        async fn notify(&self, alert: &SystemAlert) -> Result<()> {
            self.notified.lock().push(alert.title.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn critical_alerts_are_forwarded_non_critical_are_not() {
        let store = Store::open_in_memory().unwrap();
        let gateway = Arc::new(RecordingGateway {
            notified: Mutex::new(Vec::new()),
        });
        let sink = AlertSink::new(store, gateway.clone());

        sink.raise(
            "INSTANCE_OFFLINE",
            AlertSeverity::Warning,
            "offline",
            "instance went offline",
            None,
            None,
            None,
        )
        .await
        .unwrap();

        sink.raise(
            "SAFE_SWITCH_FAILED",
            AlertSeverity::Critical,
            "safe-switch failed",
            "could not flatten position",
            None,
            None,
            None,
        )
        .await
        .unwrap();

        let notified = gateway.notified.lock();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0], "safe-switch failed");
    }
}
