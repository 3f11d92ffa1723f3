//! Processing options for one worker invocation.

use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Options a worker runs with. These map one-to-one onto the `listen`
/// command flags.
///
/// # Environment Variables
///
/// - `EVENTS_SERVICE`: service name, queue prefix (default: app)
/// - `EVENTS_CONNECTION`: broker connection name (default: rabbitmq)
/// - `EVENTS_MEMORY`: memory ceiling in MB (default: 128)
/// - `EVENTS_TRIES`: attempts before a message is failed, 0 for unlimited (default: 1)
/// - `EVENTS_SLEEP`: seconds before a released message is redelivered (default: 5)
/// - `EVENTS_TIMEOUT`: seconds one message may take, 0 for no limit (default: 60)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub service: String,
    pub connection_name: String,
    /// Memory ceiling in megabytes
    pub memory: u64,
    /// 0 means unlimited
    pub max_tries: u32,
    /// Redelivery delay for released messages
    pub sleep: Duration,
    pub timeout: Option<Duration>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            service: "app".to_string(),
            connection_name: "rabbitmq".to_string(),
            memory: 128,
            max_tries: 1,
            sleep: Duration::from_secs(5),
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ProcessingOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_memory(mut self, megabytes: u64) -> Self {
        self.memory = megabytes;
        self
    }

    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// `None` or a zero duration disables the per-message timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn has_unlimited_tries(&self) -> bool {
        self.max_tries == 0
    }
}

impl FromEnv for ProcessingOptions {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_secs: u64 = env_parse("EVENTS_TIMEOUT", 60)?;

        Ok(Self {
            service: env_or_default("EVENTS_SERVICE", &defaults.service),
            connection_name: env_or_default("EVENTS_CONNECTION", &defaults.connection_name),
            memory: env_parse("EVENTS_MEMORY", defaults.memory)?,
            max_tries: env_parse("EVENTS_TRIES", defaults.max_tries)?,
            sleep: Duration::from_secs(env_parse("EVENTS_SLEEP", 5)?),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }
}
