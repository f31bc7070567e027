//! Connectivity probe: decides whether the real backend is usable.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::RoundtableError;
use crate::now_ms;
use crate::transport::{ApiRequest, Transport};
use crate::wire::{MODEL_LIST_PATH, PERSON_LIST_PATH};

/// Result of one bounded health check.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub reachable: bool,
    pub latency_ms: u64,
    pub detail: String,
    /// Why the backend was unreachable.
    pub failure: Option<RoundtableError>,
}

/// Outcome of checking a single endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointCheck {
    pub name: String,
    pub path: String,
    pub success: bool,
    /// HTTP status when known; 0 when the request never got a response.
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub response_time_ms: Option<u64>,
    pub timestamp_ms: u64,
    pub base_url: String,
    pub error: Option<String>,
}

/// Every check the application depends on, run back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticReport {
    pub timestamp_ms: u64,
    pub base_url: String,
    pub connection: ProbeReport,
    pub endpoints: Vec<EndpointCheck>,
    pub health: HealthStatus,
    /// True when the backend answered and every endpoint succeeded.
    pub passed: bool,
    pub summary: String,
}

impl DiagnosticReport {
    pub fn failed_endpoints(&self) -> impl Iterator<Item = &EndpointCheck> {
        self.endpoints.iter().filter(|c| !c.success)
    }
}

pub struct ConnectivityProbe<T> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> ConnectivityProbe<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One call to the model list, bounded by the probe timeout.
    pub async fn test_connection(&self) -> ProbeReport {
        let started = Instant::now();
        let outcome = self.bounded(ApiRequest::get(MODEL_LIST_PATH)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(_) => {
                debug!(endpoint = %self.transport.endpoint(), latency_ms, "backend reachable");
                ProbeReport {
                    reachable: true,
                    latency_ms,
                    detail: "backend API connected".to_string(),
                    failure: None,
                }
            }
            Err(e) => {
                warn!(error = %e, endpoint = %self.transport.endpoint(), "backend probe failed");
                ProbeReport { reachable: false, latency_ms, detail: describe(&e), failure: Some(e) }
            }
        }
    }

    /// Check every endpoint the application depends on.
    pub async fn test_all_endpoints(&self) -> Vec<EndpointCheck> {
        let endpoints = [("model list", MODEL_LIST_PATH), ("persona list", PERSON_LIST_PATH)];
        let mut results = Vec::with_capacity(endpoints.len());

        for (name, path) in endpoints {
            let check = match self.bounded(ApiRequest::get(path)).await {
                Ok(_) => EndpointCheck {
                    name: name.to_string(),
                    path: path.to_string(),
                    success: true,
                    status: 200,
                    message: "ok".to_string(),
                },
                Err(e) => EndpointCheck {
                    name: name.to_string(),
                    path: path.to_string(),
                    success: false,
                    status: match &e {
                        RoundtableError::Http { status, .. } => *status,
                        RoundtableError::Application { .. } | RoundtableError::Decode { .. } => 200,
                        _ => 0,
                    },
                    message: e.to_string(),
                },
            };
            results.push(check);
        }

        results
    }

    pub async fn health_status(&self) -> HealthStatus {
        let report = self.test_connection().await;
        self.health_from(&report)
    }

    /// Connection, endpoint and health checks in one report.
    ///
    /// Health is derived from the connection check rather than measured again.
    pub async fn diagnostic_report(&self) -> DiagnosticReport {
        let connection = self.test_connection().await;
        let endpoints = self.test_all_endpoints().await;
        let health = self.health_from(&connection);

        let failed: Vec<&str> = endpoints.iter().filter(|c| !c.success).map(|c| c.name.as_str()).collect();
        let passed = connection.reachable && failed.is_empty();
        let summary = if passed {
            format!("all checks passed, response time {}ms", connection.latency_ms)
        } else if !connection.reachable {
            format!("diagnostic failed: {}", connection.detail)
        } else {
            format!("diagnostic failed: {} unavailable", failed.join(", "))
        };
        info!(passed, endpoints = endpoints.len(), failed = failed.len(), "diagnostic finished");

        DiagnosticReport {
            timestamp_ms: health.timestamp_ms,
            base_url: health.base_url.clone(),
            connection,
            endpoints,
            health,
            passed,
            summary,
        }
    }

    fn health_from(&self, report: &ProbeReport) -> HealthStatus {
        HealthStatus {
            healthy: report.reachable,
            response_time_ms: report.reachable.then_some(report.latency_ms),
            timestamp_ms: now_ms(),
            base_url: self.transport.endpoint(),
            error: report.failure.as_ref().map(ToString::to_string),
        }
    }

    async fn bounded(&self, request: ApiRequest) -> Result<serde_json::Value, RoundtableError> {
        match tokio::time::timeout(self.timeout, self.transport.request(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(RoundtableError::Timeout {
                context: format!("{} {}", request.method, request.path),
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

fn describe(err: &RoundtableError) -> String {
    match err {
        RoundtableError::Timeout { .. } => "request timed out: backend took too long to respond".to_string(),
        RoundtableError::ConnectionRefused { .. } => "network connection failed: backend unreachable".to_string(),
        other => format!("connection failed: {other}"),
    }
}
