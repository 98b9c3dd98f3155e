//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub connection: ConnectionSettings,
    #[validate]
    pub privacy: PrivacySettings,
    #[validate]
    pub validation: ValidationSettings,
    #[validate]
    pub reputation: ReputationSettings,
    #[validate]
    pub aggregation: AggregationSettings,
    #[validate]
    pub model: ModelSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedcoord").separator("__"))?;
        config.try_into()
    }
}

/// The settings the coordinator state is built from.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub round: RoundSettings,
    pub connection: ConnectionSettings,
    pub privacy: PrivacySettings,
    pub validation: ValidationSettings,
    pub reputation: ReputationSettings,
    pub aggregation: AggregationSettings,
    pub model: ModelSettings,
}

impl From<&Settings> for CoordinatorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            round: settings.round,
            connection: settings.connection.clone(),
            privacy: settings.privacy,
            validation: settings.validation,
            reputation: settings.reputation,
            aggregation: settings.aggregation,
            model: settings.model,
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// REST and websocket API settings.
pub struct ApiSettings {
    /// The address to which the API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8081"
    /// # or
    /// bind_address = "127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: SocketAddr,

    /// The maximal size of a single client message in bytes. Larger messages are rejected before
    /// they are parsed.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// max_message_size = 4194304
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_API__MAX_MESSAGE_SIZE=4194304
    /// ```
    #[validate(range(min = 64))]
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_max_message_size() -> usize {
    4 * 1024 * 1024
}

/// The round scheduling settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_round"))]
pub struct RoundSettings {
    /// The minimal number of admitted contributions required before a round may aggregate.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// quorum = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_ROUND__QUORUM=3
    /// ```
    pub quorum: u64,

    /// The maximal number of contributions admitted in a round. Further submissions are
    /// discarded.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// max_contributions = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_ROUND__MAX_CONTRIBUTIONS=100
    /// ```
    pub max_contributions: u64,

    /// The amount of time spent in the open phase before collection starts, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// open_time = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_ROUND__OPEN_TIME=5
    /// ```
    pub open_time: u64,

    /// The collection deadline, in seconds after collection started. A round that has not
    /// reached its quorum when the deadline passes times out.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// collect_timeout = 600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_ROUND__COLLECT_TIMEOUT=600
    /// ```
    pub collect_timeout: u64,

    /// The last-call period between reaching the quorum and closing the collection, in seconds.
    /// `0` closes the collection as soon as the quorum is reached.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// grace_period = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_ROUND__GRACE_PERIOD=10
    /// ```
    #[serde(default)]
    pub grace_period: u64,
}

impl RoundSettings {
    /// Checks the round settings.
    fn validate_round(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals, therefore we check the invariants here
        if 1 <= self.quorum
            && self.quorum <= self.max_contributions
            && self.grace_period <= self.collect_timeout
            && 0 < self.collect_timeout
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid round count or time range(s)"))
        }
    }

    pub fn open_time(&self) -> Duration {
        Duration::from_secs(self.open_time)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

/// A wrapper for validate derive.
fn validate_round(s: &RoundSettings) -> Result<(), ValidationError> {
    s.validate_round()
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Client connection settings.
pub struct ConnectionSettings {
    /// The time after which a client that sent no heartbeat is disconnected, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [connection]
    /// heartbeat_timeout = 30
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_CONNECTION__HEARTBEAT_TIMEOUT=30
    /// ```
    #[validate(range(min = 1))]
    pub heartbeat_timeout: u64,

    /// The maximal number of simultaneously connected clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [connection]
    /// max_clients = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_CONNECTION__MAX_CLIENTS=1000
    /// ```
    #[validate(range(min = 1))]
    pub max_clients: usize,

    /// The length of the outbound message queue of each connection. Messages for a client whose
    /// queue is full are dropped.
    #[validate(range(min = 1))]
    pub outbound_capacity: usize,

    /// The client ids that are allowed to register. Any id is admitted if this is left out.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [connection]
    /// allow_list = ["hospital-a", "hospital-b"]
    /// ```
    #[serde(default)]
    pub allow_list: Option<Vec<String>>,
}

impl ConnectionSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }
}

/// Differential privacy settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_privacy"))]
pub struct PrivacySettings {
    /// The cumulative epsilon budget of every client.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// budget = 1.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_PRIVACY__BUDGET=1.0
    /// ```
    pub budget: f64,

    /// The epsilon charged for a contribution that does not request a specific amount.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// epsilon_per_round = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_PRIVACY__EPSILON_PER_ROUND=0.1
    /// ```
    pub epsilon_per_round: f64,

    /// The delta of the Gaussian mechanism. The value must be between `0` and `1`.
    pub delta: f64,

    /// Whether the coordinator noises contributions that do not carry client-side noise.
    #[serde(default = "default_server_noise")]
    pub server_noise: bool,
}

fn default_server_noise() -> bool {
    true
}

impl PrivacySettings {
    fn validate_privacy(&self) -> Result<(), ValidationError> {
        if 0. < self.epsilon_per_round
            && self.epsilon_per_round <= self.budget
            && self.budget.is_finite()
            && 0. < self.delta
            && self.delta < 1.
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid privacy budget or mechanism parameters"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    s.validate_privacy()
}

/// Contribution validation settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_validation"))]
pub struct ValidationSettings {
    /// The maximal euclidean norm of a contribution's model delta.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [validation]
    /// clip_norm = 10.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_VALIDATION__CLIP_NORM=10.0
    /// ```
    pub clip_norm: f64,

    /// The maximal magnitude of a self-reported accuracy delta.
    pub max_accuracy_delta: f64,
}

fn validate_validation(s: &ValidationSettings) -> Result<(), ValidationError> {
    if 0. < s.clip_norm
        && s.clip_norm.is_finite()
        && 0. < s.max_accuracy_delta
        && s.max_accuracy_delta.is_finite()
    {
        Ok(())
    } else {
        Err(ValidationError::new("clipping bounds must be positive"))
    }
}

/// Reputation engine settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_reputation"))]
pub struct ReputationSettings {
    /// The smoothing factor of the exponential moving average. The value must be in `(0, 1]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [reputation]
    /// alpha = 0.3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_REPUTATION__ALPHA=0.3
    /// ```
    pub alpha: f64,
    /// The score of a client that has not been observed yet.
    pub initial: f64,
    /// The lower bound of a score. Aggregation weights never drop below this value.
    pub floor: f64,
    /// The upper bound of a score.
    pub ceiling: f64,
    /// The fraction by which each consecutive missed round reduces the agreement of a client.
    pub absence_penalty: f64,
    /// The accuracy mismatch at which the accuracy agreement of a client halves.
    pub accuracy_tolerance: f64,
}

fn validate_reputation(s: &ReputationSettings) -> Result<(), ValidationError> {
    if 0. < s.alpha
        && s.alpha <= 1.
        && 0. <= s.floor
        && s.floor <= s.initial
        && s.initial <= s.ceiling
        && s.ceiling.is_finite()
        && 0. <= s.absence_penalty
        && s.absence_penalty <= 1.
        && 0. < s.accuracy_tolerance
    {
        Ok(())
    } else {
        Err(ValidationError::new("invalid reputation bounds"))
    }
}

/// Aggregation settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
pub struct AggregationSettings {
    /// The convergence score below which a round counts towards convergence.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// convergence_threshold = 0.001
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_AGGREGATION__CONVERGENCE_THRESHOLD=0.001
    /// ```
    #[validate(range(min = 0.0))]
    pub convergence_threshold: f64,

    /// The number of consecutive rounds below the threshold after which training is considered
    /// converged.
    #[validate(range(min = 1))]
    pub convergence_rounds: u32,
}

/// Model settings.
#[derive(Debug, Deserialize, Validate, Clone, Copy)]
pub struct ModelSettings {
    /// The expected length of the global state and of every model delta.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// length = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_MODEL__LENGTH=100
    /// ```
    #[validate(range(min = 1))]
    pub length: usize,
}

#[derive(Debug, Default, Deserialize, Clone)]
/// Round ledger settings.
pub struct LedgerSettings {
    /// The directory of the append-only ledger files. The ledger is kept in memory if this is left
    /// out.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [ledger]
    /// path = "/var/lib/fedcoord"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_LEDGER__PATH=/var/lib/fedcoord
    /// ```
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOORD_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
