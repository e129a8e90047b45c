//! Alert payload model and shared state enums.
//!
//! The inbound payload follows the Alertmanager webhook shape: a batch
//! (notification group) carrying common labels and a list of individual
//! alerts. Field names are camelCase on the wire.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Label or annotation set. Ordered so serialisation and hashing are stable.
pub type LabelSet = BTreeMap<String, String>;

/// Stable identity of one alert within its source.
pub type Fingerprint = String;

/// Firing state of a single alert or of a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Alert condition is active.
    #[default]
    Firing,
    /// Alert condition has cleared.
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// One alert inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Firing or resolved.
    #[serde(default)]
    pub status: AlertStatus,
    /// Identifying labels.
    #[serde(default)]
    pub labels: LabelSet,
    /// Descriptive annotations.
    #[serde(default)]
    pub annotations: LabelSet,
    /// When the alert started firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    /// When the alert resolved, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the rule that generated the alert.
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Source-assigned fingerprint. May be empty for hand-written payloads.
    #[serde(default)]
    pub fingerprint: String,
}

impl Alert {
    /// Returns the alert's fingerprint, deriving one from its labels when the
    /// source did not provide it.
    ///
    /// The derived value is the first 16 hex characters of the SHA-256 over
    /// the sorted `name=value` label pairs, so it is stable across requests.
    pub fn identity(&self) -> Fingerprint {
        if !self.fingerprint.is_empty() {
            return self.fingerprint.clone();
        }

        let mut hasher = Sha256::new();
        for (name, value) in &self.labels {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

/// A notification group as delivered by the monitoring source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertBatch {
    /// Payload schema version.
    #[serde(default)]
    pub version: String,
    /// Key identifying the alert group.
    #[serde(default)]
    pub group_key: String,
    /// Number of alerts dropped by the source due to size limits.
    #[serde(default)]
    pub truncated_alerts: u64,
    /// Aggregate status of the group.
    #[serde(default)]
    pub status: AlertStatus,
    /// Receiver name configured at the source.
    #[serde(default)]
    pub receiver: String,
    /// Labels the group was formed by.
    #[serde(default)]
    pub group_labels: LabelSet,
    /// Labels shared by every alert in the group.
    #[serde(default)]
    pub common_labels: LabelSet,
    /// Annotations shared by every alert in the group.
    #[serde(default)]
    pub common_annotations: LabelSet,
    /// Link back to the source.
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    /// The alerts themselves.
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl AlertBatch {
    /// Decodes and validates a batch from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPayload` for malformed JSON and
    /// `CoreError::InvalidInput` for a batch without alerts.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let batch: Self = serde_json::from_slice(body)?;
        batch.validate()?;
        Ok(batch)
    }

    /// Checks structural rules the dispatch engine relies on.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the batch carries no alerts.
    pub fn validate(&self) -> Result<()> {
        if self.alerts.is_empty() {
            return Err(CoreError::InvalidInput("alert batch contains no alerts".to_string()));
        }
        Ok(())
    }

    /// Number of alerts in the batch.
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// Whether the batch carries no alerts.
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Builds a batch with the same group metadata but a subset of alerts.
    ///
    /// The aggregate status is recomputed: firing if any alert in the subset
    /// is firing, resolved otherwise.
    pub fn with_alerts(&self, alerts: Vec<Alert>) -> Self {
        let status = if alerts.iter().any(|alert| alert.status == AlertStatus::Firing) {
            AlertStatus::Firing
        } else {
            AlertStatus::Resolved
        };

        Self {
            version: self.version.clone(),
            group_key: self.group_key.clone(),
            truncated_alerts: self.truncated_alerts,
            status,
            receiver: self.receiver.clone(),
            group_labels: self.group_labels.clone(),
            common_labels: self.common_labels.clone(),
            common_annotations: self.common_annotations.clone(),
            external_url: self.external_url.clone(),
            alerts,
        }
    }
}

/// Current state of a destination's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Destination unhealthy - calls fail immediately.
    Open,
    /// Probing recovery - calls pass through and are counted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}
