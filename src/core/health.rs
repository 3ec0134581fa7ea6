use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Pieces of the service whose state feeds the overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    Vault,
    Marketplace,
    Notifier,
}

impl Component {
    /// Without these nothing can be tracked at all.
    fn is_critical(self) -> bool {
        matches!(self, Component::Database | Component::Vault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// A critical component has not reported yet.
    Starting,
    Healthy,
    /// Polling or delivery is failing; the service itself is up.
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentState {
    pub up: bool,
    /// When `up` last flipped.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ServiceStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<Component, ComponentState>,
}

impl HealthStatus {
    pub fn is_up(&self, component: Component) -> Option<bool> {
        self.components.get(&component).map(|state| state.up)
    }
}

fn overall(components: &BTreeMap<Component, ComponentState>) -> ServiceStatus {
    let critical = [Component::Database, Component::Vault];
    if critical.iter().any(|c| !components.contains_key(c)) {
        return ServiceStatus::Starting;
    }

    let mut degraded = false;
    for (component, state) in components {
        if !state.up {
            if component.is_critical() {
                return ServiceStatus::Unavailable;
            }
            degraded = true;
        }
    }

    if degraded {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    }
}

/// Shared health board. Components report as they learn something; the
/// marketplace and notifier entries appear after the first tick touches them.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    components: Arc<RwLock<BTreeMap<Component, ComponentState>>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            components: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.components.read().await.clone();

        HealthStatus {
            status: overall(&components),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn report(&self, component: Component, up: bool) {
        let mut components = self.components.write().await;
        match components.get(&component) {
            Some(state) if state.up == up => {}
            _ => {
                if !up {
                    tracing::warn!("💔 {:?} reported down", component);
                }
                components.insert(component, ComponentState { up, since: Utc::now() });
            }
        }
    }
}
