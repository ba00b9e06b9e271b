//! Readiness-Prüfung nach dem Start eines Containers.

use std::time::Duration;

use podfleet_config::{HealthCheck, HealthConfig, HealthProbe};
use thiserror::Error;
use tracing::debug;

use crate::runtime::ContainerRuntime;

/// Untergrenze für das Probe-Intervall
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{container} not ready after {timeout:?} ({probe})")]
pub struct HealthTimeout {
    pub container: String,
    pub probe: HealthProbe,
    pub timeout: Duration,
}

/// Wiederholt die Probe bis sie erfolgreich ist oder das Timeout abläuft.
/// Fehler einer einzelnen Probe zählen als "noch nicht bereit".
pub async fn wait_until_ready(
    runtime: &dyn ContainerRuntime,
    container: &str,
    check: &HealthCheck,
    defaults: &HealthConfig,
) -> Result<(), HealthTimeout> {
    let timeout = check.timeout.unwrap_or_else(|| defaults.timeout());
    let interval = check.interval.unwrap_or_else(|| defaults.interval()).max(MIN_INTERVAL);

    let poll = async {
        let mut probes = 0u32;
        loop {
            probes += 1;
            match runtime.probe(container, &check.probe).await {
                Ok(true) => {
                    debug!(container, probes, "container ready");
                    return;
                }
                Ok(false) => {}
                Err(e) => debug!(container, error = %e, "probe failed"),
            }
            tokio::time::sleep(interval).await;
        }
    };

    tokio::time::timeout(timeout, poll).await.map_err(|_| HealthTimeout {
        container: container.to_string(),
        probe: check.probe.clone(),
        timeout,
    })
}
