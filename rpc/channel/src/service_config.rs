//! Service config: the JSON document describing load-balancing policy and
//! per-method behavior, plus the TXT-record canary selection algorithm.

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Language tag used for `clientLanguage` canary matching.
pub const CLIENT_LANGUAGE: &str = "rust";

/// Service config validation or selection error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceConfigError {
    #[error("invalid service config JSON: {0}")]
    Json(String),
    #[error("duplicate method config name: service {service:?} method {method:?}")]
    DuplicateName {
        service: String,
        method: Option<String>,
    },
    #[error("method config name has a method but no service")]
    MethodWithoutService,
    #[error("invalid methodConfig timeout: {0:?}")]
    InvalidTimeout(String),
    #[error("load balancing config entry must have exactly one field")]
    MalformedLbConfig,
    #[error("no grpc_config record found")]
    NoConfigRecord,
    #[error("no matching service config choice")]
    NoMatchingChoice,
}

/// One `loadBalancingConfig` entry: a single-key object mapping policy name
/// to its typed config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct LbConfigEntry {
    entry: serde_json::Map<String, serde_json::Value>,
}

impl LbConfigEntry {
    pub fn new(policy: &str, config: serde_json::Value) -> Self {
        let mut entry = serde_json::Map::new();
        entry.insert(policy.to_owned(), config);
        Self { entry }
    }

    pub fn policy_name(&self) -> Option<&str> {
        if self.entry.len() == 1 {
            self.entry.keys().next().map(String::as_str)
        } else {
            None
        }
    }

    pub fn config(&self) -> &serde_json::Value {
        self.policy_name()
            .and_then(|name| self.entry.get(name))
            .unwrap_or(&serde_json::Value::Null)
    }
}

/// A method-config name entry: `{service, method?}`. An empty service is
/// the global wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodName {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// Per-method configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    pub name: Vec<MethodName>,
    #[serde(default)]
    pub wait_for_ready: Option<bool>,
    /// Decimal seconds matching `^\d+(\.\d{1,9})?s$`.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub max_request_bytes: Option<u64>,
    #[serde(default)]
    pub max_response_bytes: Option<u64>,
}

impl MethodConfig {
    /// The validated timeout as a duration.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_config_timeout)
    }
}

/// The service config document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub load_balancing_policy: Option<String>,
    #[serde(default)]
    pub load_balancing_config: Vec<LbConfigEntry>,
    #[serde(default)]
    pub method_config: Vec<MethodConfig>,
}

fn parse_config_timeout(value: &str) -> Option<Duration> {
    let seconds = value.strip_suffix('s')?;
    let (whole, frac) = match seconds.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (seconds, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut duration = Duration::from_secs(whole.parse().ok()?);
    if let Some(frac) = frac {
        if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let nanos: u64 = frac.parse().ok()?;
        let scale = 10u64.pow(9 - frac.len() as u32);
        duration += Duration::from_nanos(nanos * scale);
    }
    Some(duration)
}

impl ServiceConfig {
    /// Parse and validate a service config document.
    pub fn from_json(json: &str) -> Result<Self, ServiceConfigError> {
        let config: ServiceConfig =
            serde_json::from_str(json).map_err(|e| ServiceConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate name uniqueness, name shape, LB entry shape, and timeout
    /// format.
    pub fn validate(&self) -> Result<(), ServiceConfigError> {
        for entry in &self.load_balancing_config {
            if entry.policy_name().is_none() {
                return Err(ServiceConfigError::MalformedLbConfig);
            }
        }

        let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
        for method_config in &self.method_config {
            if let Some(timeout) = &method_config.timeout
                && parse_config_timeout(timeout).is_none()
            {
                return Err(ServiceConfigError::InvalidTimeout(timeout.clone()));
            }
            for name in &method_config.name {
                if name.service.is_empty() && name.method.is_some() {
                    return Err(ServiceConfigError::MethodWithoutService);
                }
                let key = (name.service.clone(), name.method.clone());
                if !seen.insert(key) {
                    return Err(ServiceConfigError::DuplicateName {
                        service: name.service.clone(),
                        method: name.method.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Find the method config for a call path, most specific name first:
    /// exact (service, method), then service-wide, then the global default.
    pub fn select_method_config(&self, path: &str) -> Option<&MethodConfig> {
        let mut parts = path.split('/');
        let _ = parts.next();
        let service = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();

        let matching = |want_service: &str, want_method: Option<&str>| {
            self.method_config.iter().find(|mc| {
                mc.name.iter().any(|n| {
                    n.service == want_service && n.method.as_deref() == want_method
                })
            })
        };
        matching(service, Some(method))
            .or_else(|| matching(service, None))
            .or_else(|| matching("", None))
    }
}

/// One canary choice in a `grpc_config=` TXT record. Unknown fields are
/// rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CanaryChoice {
    #[serde(default)]
    client_language: Option<Vec<String>>,
    #[serde(default)]
    percentage: Option<f64>,
    #[serde(default)]
    client_hostname: Option<Vec<String>>,
    service_config: ServiceConfig,
}

/// Select a service config from TXT-record data.
///
/// Finds the first record starting with `grpc_config=`, concatenates that
/// record's strings, parses the canary-choice array, and returns the first
/// choice not skipped by percentage, hostname, or client language.
pub fn select_service_config(
    records: &[Vec<String>],
    percentile: f64,
    hostname: &str,
) -> Result<ServiceConfig, ServiceConfigError> {
    let record = records
        .iter()
        .find(|record| {
            record
                .first()
                .is_some_and(|first| first.starts_with("grpc_config="))
        })
        .ok_or(ServiceConfigError::NoConfigRecord)?;

    let joined: String = record.concat();
    let json = joined
        .strip_prefix("grpc_config=")
        .ok_or(ServiceConfigError::NoConfigRecord)?;

    let choices: Vec<CanaryChoice> =
        serde_json::from_str(json).map_err(|e| ServiceConfigError::Json(e.to_string()))?;

    for choice in choices {
        if let Some(percentage) = choice.percentage
            && percentile > percentage
        {
            continue;
        }
        if let Some(hostnames) = &choice.client_hostname
            && !hostnames.iter().any(|h| h == hostname)
        {
            continue;
        }
        if let Some(languages) = &choice.client_language
            && !languages.iter().any(|l| l == CLIENT_LANGUAGE)
        {
            continue;
        }
        choice.service_config.validate()?;
        return Ok(choice.service_config);
    }
    Err(ServiceConfigError::NoMatchingChoice)
}
