//! Logging and metrics bootstrap for the `strata` binary.
//!
//! Library code only emits through `tracing` macros and the OpenTelemetry
//! global meter; nothing here is needed for tests.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "logfmt" => Ok(Self::Text),
            other => Err(Error::Config(format!(
                "STRATA_LOG_FORMAT must be one of [json, text], got '{other}'"
            ))),
        }
    }
}

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub instance_id: String,
    pub log_format: LogFormat,
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        Self::from_lookup(default_service_name, |name| std::env::var(name).ok())
    }

    fn from_lookup<F>(default_service_name: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "OTEL_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let log_format = match lookup("STRATA_LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw)?,
            None => LogFormat::Json,
        };

        let mut attr_map: BTreeMap<String, String> = BTreeMap::new();
        if let Some(attr_str) = lookup("OTEL_RESOURCE_ATTRIBUTES") {
            for (key, value) in parse_resource_attributes(&attr_str)? {
                attr_map.insert(key, value);
            }
        }

        attr_map.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
        attr_map
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "strata".to_string());
        let instance_id = attr_map
            .entry(ATTR_SERVICE_INSTANCE_ID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        let resource_attributes = attr_map
            .into_iter()
            .map(|(k, v)| KeyValue::new(k, v))
            .collect::<Vec<_>>();

        Ok(Self {
            service_name: service_name.to_string(),
            instance_id,
            log_format,
            resource_attributes,
        })
    }
}

/// Handle that keeps the meter provider alive for the process lifetime.
pub struct Telemetry {
    config: TelemetryConfig,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install the log subscriber and the global meter provider.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        let builder = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());

        info!(
            service_name = %config.service_name,
            instance_id = %config.instance_id,
            log_level = %level,
            "Telemetry bootstrap initialized"
        );

        Ok(Self {
            config,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| Error::Config(format!("invalid log level '{}'", raw.trim())))
}

/// `key=value` pairs separated by commas; blank entries are skipped.
fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            Some(_) => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' has an empty key"
            ))),
            None => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resource_attributes_rejects_invalid_pairs() {
        let err = parse_resource_attributes("broken").unwrap_err();
        assert!(format!("{err}").contains("key=value"));
    }

    #[test]
    fn config_keeps_explicit_instance_id() {
        let config = TelemetryConfig::from_lookup("strata", |name| match name {
            "OTEL_RESOURCE_ATTRIBUTES" => Some("service.instance.id=ing-1, zone = a".to_string()),
            "STRATA_LOG_FORMAT" => Some("text".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.service_name, "strata");
        assert_eq!(config.instance_id, "ing-1");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config
            .resource_attributes
            .iter()
            .any(|kv| kv.key.as_str() == "zone" && kv.value.as_str() == "a"));
    }

    #[test]
    fn empty_service_name_rejected() {
        let err = TelemetryConfig::from_lookup("strata", |name| {
            (name == "OTEL_SERVICE_NAME").then(|| "  ".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(parse_log_level("loud").is_err());
    }
}
