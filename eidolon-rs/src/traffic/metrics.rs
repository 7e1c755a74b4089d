//! System-wide metrics refreshed in the background

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::monitor::ActiveConnections;
use crate::models::format_bytes;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub start_time: DateTime<Utc>,
    pub active_connections: usize,
    pub total_traffic: i64,
    pub last_update: Option<DateTime<Utc>>,
    /// Active connections seen per day (`YYYY-MM-DD`)
    pub connection_history: BTreeMap<String, usize>,
    /// Bytes transferred per day (`YYYY-MM-DD`)
    pub traffic_history: BTreeMap<String, i64>,
}

pub struct SystemMonitor {
    store: Arc<dyn Store>,
    connections: Arc<ActiveConnections>,
    interval: Duration,
    metrics: RwLock<SystemMetrics>,
}

impl SystemMonitor {
    pub fn new(store: Arc<dyn Store>, connections: Arc<ActiveConnections>, interval: Duration) -> Self {
        Self {
            store,
            connections,
            interval,
            metrics: RwLock::new(SystemMetrics {
                start_time: Utc::now(),
                active_connections: 0,
                total_traffic: 0,
                last_update: None,
                connection_history: BTreeMap::new(),
                traffic_history: BTreeMap::new(),
            }),
        }
    }

    pub async fn refresh(&self) {
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();
        let day_start = now.date_naive().and_hms_opt(0, 0, 0).map(|t| Utc.from_utc_datetime(&t));

        let active = self.connections.len().await;

        let total = match self.store.total_traffic(0, now.timestamp()).await {
            Ok(total) => Some(total),
            Err(e) => {
                error!("Failed to compute total traffic: {}", e);
                None
            }
        };

        let from = day_start.unwrap_or(now - ChronoDuration::days(1)).timestamp();
        let today_traffic = match self.store.total_traffic(from, now.timestamp()).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to compute today's traffic: {}", e);
                None
            }
        };

        let mut metrics = self.metrics.write().await;
        metrics.active_connections = active;
        if let Some(total) = total {
            metrics.total_traffic = total;
        }
        metrics.connection_history.insert(today.clone(), active);
        if let Some(bytes) = today_traffic {
            metrics.traffic_history.insert(today, bytes);
        }
        metrics.last_update = Some(now);

        debug!("System metrics refreshed");
    }

    pub async fn snapshot(&self) -> SystemMetrics {
        self.metrics.read().await.clone()
    }

    /// Multi-line human readable status
    pub async fn status_text(&self) -> String {
        let m = self.metrics.read().await;
        let uptime = Utc::now() - m.start_time;

        format!(
            "System status:\n\nUptime: {}\nActive connections: {}\nTotal traffic: {}\nLast update: {}",
            format_duration(uptime),
            m.active_connections,
            format_bytes(m.total_traffic),
            m.last_update
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string()),
        )
    }

    /// Refresh immediately, then every interval until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("System monitor started");
        self.refresh().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => self.refresh().await,
            }
        }

        info!("System monitor stopped");
    }
}

fn format_duration(d: ChronoDuration) -> String {
    let days = d.num_days();
    let hours = d.num_hours() % 24;
    let minutes = d.num_minutes() % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
