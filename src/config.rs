use dotenv::dotenv;
use std::env;
use tracing::info;

const SUBSCRIPTION_ID: &str = "FIREHOSE_SUBSCRIPTION_ID";
const LOG_ROUTE_ERRORS: &str = "NOZZLE_LOG_ROUTE_ERRORS";

const DEFAULT_SUBSCRIPTION_ID: &str = "firehose-nozzle";

/// Settings owned by the nozzle itself
///
/// Buffer sizes, filters and delivery settings belong to the event source
/// and event router, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Firehose subscription this nozzle consumes; tags every log line of a run
    pub subscription_id: String,
    /// Whether router failures are written to the error log
    pub log_route_errors: bool,
}

impl Config {
    pub fn from_env() -> Config {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> Result<Config, String> {
        // Load .env file
        dotenv().ok();

        let subscription_id = env::var(SUBSCRIPTION_ID)
            .map(|id| id.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_SUBSCRIPTION_ID.to_string());

        if subscription_id.is_empty() {
            return Err(format!("environment variable {} must not be empty", SUBSCRIPTION_ID));
        }

        let log_route_errors = match env::var(LOG_ROUTE_ERRORS) {
            Ok(value) => parse_bool(&value)
                .ok_or_else(|| format!("failed to parse {} as a boolean: {}", LOG_ROUTE_ERRORS, value))?,
            Err(_) => true,
        };

        info!("Loaded nozzle config for subscription {}", subscription_id);

        Ok(Config {
            subscription_id,
            log_route_errors,
        })
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Config {
        self.subscription_id = subscription_id.into();
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            subscription_id: DEFAULT_SUBSCRIPTION_ID.to_string(),
            log_route_errors: true,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
