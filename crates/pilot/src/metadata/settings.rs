//! Cluster-wide settings documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Balancer on/off switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerSettings {
    pub enabled: bool,
    /// Time of the last start/stop, `None` if never toggled
    pub last_toggled: Option<DateTime<Utc>>,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            last_toggled: None,
        }
    }
}

/// Counters reported by the registration beacon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconCounters {
    /// Acknowledged registrations
    pub registrations: u64,
    pub last_registered: Option<DateTime<Utc>>,
}
