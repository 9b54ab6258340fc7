//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use batchflow_core::Parameter;
use batchflow_workflow::{BackoffStrategy, RetryPolicy, StepBudgets};

use crate::orchestrator::DEFAULT_JOB_RETENTION;

/// Largest accepted scheduler interval (one year).
pub const MAX_SCHEDULE_HOURS: u64 = 8760;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Orchestrator settings: what to run, how often, and within which budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub parameters: Vec<Parameter>,
    pub schedule_interval_hours: u64,
    pub sweep_interval: Duration,
    pub budgets: StepBudgets,
    pub retry: RetryPolicy,
    /// How long settled job entries answer redeliveries before being purged.
    pub job_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parameters: Parameter::new("pm25").into_iter().collect(),
            schedule_interval_hours: 24,
            sweep_interval: Duration::from_secs(30),
            budgets: StepBudgets::default(),
            retry: RetryPolicy::default(),
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

impl OrchestratorConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_hours * 3600)
    }
}

/// Endpoints of the HTTP collaborators; all three or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorUrls {
    pub query: String,
    pub inference: String,
    pub writer: String,
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub bind_addr: SocketAddr,
    /// Postgres URL when persistent stores are enabled.
    pub database_url: Option<String>,
    /// `None` selects the in-memory collaborators.
    pub collaborators: Option<CollaboratorUrls>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = OrchestratorConfig::default();

        let parameters = match get("BATCHFLOW_PARAMETERS") {
            Some(raw) => parse_parameters(&raw)?,
            None => defaults.parameters.clone(),
        };

        let schedule_interval_hours =
            parse_or(get("BATCHFLOW_SCHEDULE_INTERVAL_HOURS"), "BATCHFLOW_SCHEDULE_INTERVAL_HOURS", 24)?;
        validate_schedule_hours(schedule_interval_hours)
            .map_err(|reason| ConfigError::invalid("BATCHFLOW_SCHEDULE_INTERVAL_HOURS", reason))?;

        let d = &defaults.budgets;
        let budgets = StepBudgets {
            run: duration_secs(&get, "BATCHFLOW_RUN_BUDGET_SECS", d.run)?,
            querying_records: duration_secs(&get, "BATCHFLOW_QUERY_BUDGET_SECS", d.querying_records)?,
            launching_job: duration_secs(&get, "BATCHFLOW_LAUNCH_BUDGET_SECS", d.launching_job)?,
            awaiting_completion: duration_secs(
                &get,
                "BATCHFLOW_AWAIT_BUDGET_SECS",
                d.awaiting_completion,
            )?,
            writing_results: duration_secs(&get, "BATCHFLOW_WRITE_BUDGET_SECS", d.writing_results)?,
        };

        let r = &defaults.retry;
        let max_attempts = parse_or(
            get("BATCHFLOW_RETRY_MAX_ATTEMPTS"),
            "BATCHFLOW_RETRY_MAX_ATTEMPTS",
            u64::from(r.max_attempts),
        )?;
        let max_attempts = u32::try_from(max_attempts)
            .map_err(|_| ConfigError::invalid("BATCHFLOW_RETRY_MAX_ATTEMPTS", "too large"))?;
        let base_delay = Duration::from_millis(parse_or(
            get("BATCHFLOW_RETRY_BASE_DELAY_MS"),
            "BATCHFLOW_RETRY_BASE_DELAY_MS",
            r.base_delay.as_millis() as u64,
        )?);
        let max_delay = Duration::from_millis(parse_or(
            get("BATCHFLOW_RETRY_MAX_DELAY_MS"),
            "BATCHFLOW_RETRY_MAX_DELAY_MS",
            r.max_delay.as_millis() as u64,
        )?);
        if max_delay < base_delay {
            return Err(ConfigError::invalid(
                "BATCHFLOW_RETRY_MAX_DELAY_MS",
                "must not be smaller than BATCHFLOW_RETRY_BASE_DELAY_MS",
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: r.jitter,
        };

        let sweep_interval = duration_secs(&get, "BATCHFLOW_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?;
        let job_retention =
            duration_secs(&get, "BATCHFLOW_JOB_RETENTION_SECS", defaults.job_retention)?;

        let bind_addr = get("BATCHFLOW_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid("BATCHFLOW_BIND_ADDR", e.to_string()))?;

        let persistent = match get("USE_PERSISTENT_STORES").as_deref() {
            None | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "USE_PERSISTENT_STORES",
                    format!("expected true/false, got '{other}'"),
                ));
            }
        };
        let database_url = if persistent {
            Some(get("DATABASE_URL").ok_or(ConfigError::Missing { var: "DATABASE_URL" })?)
        } else {
            None
        };

        let collaborators = match (
            get("BATCHFLOW_QUERY_URL"),
            get("BATCHFLOW_INFERENCE_URL"),
            get("BATCHFLOW_WRITER_URL"),
        ) {
            (None, None, None) => None,
            (Some(query), Some(inference), Some(writer)) => Some(CollaboratorUrls {
                query,
                inference,
                writer,
            }),
            (query, inference, _) => {
                let var = if query.is_none() {
                    "BATCHFLOW_QUERY_URL"
                } else if inference.is_none() {
                    "BATCHFLOW_INFERENCE_URL"
                } else {
                    "BATCHFLOW_WRITER_URL"
                };
                return Err(ConfigError::Missing { var });
            }
        };

        Ok(Self {
            orchestrator: OrchestratorConfig {
                parameters,
                schedule_interval_hours,
                sweep_interval,
                budgets,
                retry,
                job_retention,
            },
            bind_addr,
            database_url,
            collaborators,
        })
    }
}

fn parse_parameters(raw: &str) -> Result<Vec<Parameter>, ConfigError> {
    let mut parameters: Vec<Parameter> = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let p = Parameter::new(part)
            .map_err(|e| ConfigError::invalid("BATCHFLOW_PARAMETERS", e.to_string()))?;
        if !parameters.contains(&p) {
            parameters.push(p);
        }
    }
    if parameters.is_empty() {
        return Err(ConfigError::invalid("BATCHFLOW_PARAMETERS", "no parameters given"));
    }
    Ok(parameters)
}

fn parse_or(value: Option<String>, var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(var, format!("'{v}': {e}"))),
    }
}

fn duration_secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = parse_or(get(var), var, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::invalid(var, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

/// Accept scheduler intervals between one hour and one year.
pub fn validate_schedule_hours(hours: u64) -> Result<u64, String> {
    if (1..=MAX_SCHEDULE_HOURS).contains(&hours) {
        Ok(hours)
    } else {
        Err(format!(
            "schedule interval must be between 1 and {MAX_SCHEDULE_HOURS} hours, got {hours}"
        ))
    }
}
