use serde::{Deserialize, Serialize};

/// Aggregated health of a service as reported by the registry agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    /// Parses the registry's status strings. Unknown values map to `Critical`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            "maintenance" => HealthStatus::Maintenance,
            _ => HealthStatus::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one instance of the looked-up service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub status: HealthStatus,
}

/// Result of a health lookup by service name.
///
/// An unknown service is reported as `Critical` with no instances rather
/// than as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub status: HealthStatus,
    pub instances: Vec<InstanceHealth>,
}

impl ServiceHealth {
    pub fn unknown(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            status: HealthStatus::Critical,
            instances: Vec::new(),
        }
    }
}
