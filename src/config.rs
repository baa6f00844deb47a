//! Configuration parameters and the strategies that size worker pools.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

pub const PARALLEL_ENABLED: &str = "kasane.parallel.enabled";
pub const PARALLEL_EXECUTOR: &str = "kasane.parallel.executor";
pub const ISOLATION_BOUNDARY: &str = "kasane.parallel.isolation.boundary";
pub const ISOLATION_GRACE_PERIOD: &str = "kasane.parallel.isolation.grace-period-ms";
pub const CONFIG_PREFIX: &str = "kasane.parallel.config.";

const STRATEGY: &str = "strategy";
const FIXED_PARALLELISM: &str = "fixed.parallelism";
const FIXED_MAX_POOL_SIZE: &str = "fixed.max-pool-size";
const FIXED_SATURATE: &str = "fixed.saturate";
const DYNAMIC_FACTOR: &str = "dynamic.factor";
const DYNAMIC_MAX_POOL_SIZE_FACTOR: &str = "dynamic.max-pool-size-factor";
const DYNAMIC_SATURATE: &str = "dynamic.saturate";
const CUSTOM_NAME: &str = "custom.name";

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DEFAULT_GRACE_PERIOD_MS: u64 = 5000;
const DEFAULT_MAX_POOL_SIZE_OFFSET: usize = 256;
const DEFAULT_MAX_POOL_SIZE_FACTOR: f64 = 256.0;

/// String key to optional string value lookup.
pub trait ConfigurationParameters: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ConfigError::invalid(key, &value, "expected 'true' or 'false'")),
            },
        }
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        parse(key, self.get(key), "expected a non-negative integer")
    }

    fn get_f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        parse(key, self.get(key), "expected a decimal number")
    }
}

fn parse<T: FromStr>(
    key: &str,
    value: Option<String>,
    reason: &str,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, &value, reason))
        })
        .transpose()
}

impl ConfigurationParameters for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigurationParameters for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// Looks every key up under a common prefix.
pub struct PrefixedConfigurationParameters<'a> {
    inner: &'a dyn ConfigurationParameters,
    prefix: String,
}

impl<'a> PrefixedConfigurationParameters<'a> {
    pub fn new(inner: &'a dyn ConfigurationParameters, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

impl ConfigurationParameters for PrefixedConfigurationParameters<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(&format!("{}{key}", self.prefix))
    }
}

/// Sizing of a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelExecutionConfiguration {
    parallelism: usize,
    minimum_runnable: usize,
    max_pool_size: usize,
    core_pool_size: usize,
    keep_alive: Duration,
    saturate: bool,
}

impl ParallelExecutionConfiguration {
    pub fn new(
        parallelism: usize,
        minimum_runnable: usize,
        max_pool_size: usize,
        core_pool_size: usize,
        keep_alive: Duration,
        saturate: bool,
    ) -> Result<Self, ConfigError> {
        if parallelism == 0 {
            return Err(ConfigError::invalid(
                "parallelism",
                "0",
                "must be at least 1",
            ));
        }
        if max_pool_size < parallelism {
            return Err(ConfigError::invalid(
                "max-pool-size",
                &max_pool_size.to_string(),
                format!("must be at least the parallelism of {parallelism}"),
            ));
        }
        if core_pool_size == 0 || core_pool_size > max_pool_size {
            return Err(ConfigError::invalid(
                "core-pool-size",
                &core_pool_size.to_string(),
                format!("must be between 1 and the maximum pool size of {max_pool_size}"),
            ));
        }

        Ok(Self {
            parallelism,
            minimum_runnable,
            max_pool_size,
            core_pool_size,
            keep_alive,
            saturate,
        })
    }

    /// A pool of `parallelism` threads which may grow up to `max_pool_size`.
    pub fn with_parallelism(
        parallelism: usize,
        max_pool_size: usize,
        saturate: bool,
    ) -> Result<Self, ConfigError> {
        Self::new(
            parallelism,
            parallelism,
            max_pool_size,
            parallelism,
            KEEP_ALIVE,
            saturate,
        )
    }

    /// The number of threads the pool tries to keep runnable.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn minimum_runnable(&self) -> usize {
        self.minimum_runnable
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn core_pool_size(&self) -> usize {
        self.core_pool_size
    }

    /// How long a surplus thread idles before it exits.
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Whether a thread may block without compensation once the pool has
    /// reached its maximum size, instead of failing.
    pub fn saturate(&self) -> bool {
        self.saturate
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Derives a pool configuration from parameters scoped under
/// `kasane.parallel.config.`.
pub trait ParallelExecutionConfigurationStrategy: Send + Sync {
    fn create_configuration(
        &self,
        parameters: &dyn ConfigurationParameters,
    ) -> Result<ParallelExecutionConfiguration, ConfigError>;
}

/// A fixed parallelism, `fixed.parallelism` is required.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedStrategy;

impl ParallelExecutionConfigurationStrategy for FixedStrategy {
    fn create_configuration(
        &self,
        parameters: &dyn ConfigurationParameters,
    ) -> Result<ParallelExecutionConfiguration, ConfigError> {
        let parallelism = parameters
            .get_usize(FIXED_PARALLELISM)?
            .ok_or_else(|| ConfigError::Missing {
                key: format!("{CONFIG_PREFIX}{FIXED_PARALLELISM}"),
            })?;
        if parallelism == 0 {
            return Err(ConfigError::invalid(
                FIXED_PARALLELISM,
                "0",
                "must be a positive integer",
            ));
        }

        let max_pool_size = match parameters.get_usize(FIXED_MAX_POOL_SIZE)? {
            Some(max_pool_size) => max_pool_size,
            None => parallelism
                .checked_add(DEFAULT_MAX_POOL_SIZE_OFFSET)
                .ok_or_else(|| {
                    ConfigError::invalid(
                        FIXED_PARALLELISM,
                        &parallelism.to_string(),
                        "is too large to derive a maximum pool size from",
                    )
                })?,
        };
        if max_pool_size < parallelism {
            return Err(ConfigError::invalid(
                FIXED_MAX_POOL_SIZE,
                &max_pool_size.to_string(),
                format!("must be greater than or equal to the parallelism of {parallelism}"),
            ));
        }

        let saturate = parameters.get_bool(FIXED_SATURATE)?.unwrap_or(true);
        ParallelExecutionConfiguration::with_parallelism(parallelism, max_pool_size, saturate)
    }
}

/// Parallelism relative to the number of available processors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicStrategy;

impl ParallelExecutionConfigurationStrategy for DynamicStrategy {
    fn create_configuration(
        &self,
        parameters: &dyn ConfigurationParameters,
    ) -> Result<ParallelExecutionConfiguration, ConfigError> {
        let factor = parameters.get_f64(DYNAMIC_FACTOR)?.unwrap_or(1.0);
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ConfigError::invalid(
                DYNAMIC_FACTOR,
                &factor.to_string(),
                "must be a positive decimal number",
            ));
        }

        let processors = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        let parallelism = scale(DYNAMIC_FACTOR, factor, processors)?.max(1);

        let max_factor = parameters
            .get_f64(DYNAMIC_MAX_POOL_SIZE_FACTOR)?
            .unwrap_or(DEFAULT_MAX_POOL_SIZE_FACTOR);
        if !max_factor.is_finite() || max_factor < 1.0 {
            return Err(ConfigError::invalid(
                DYNAMIC_MAX_POOL_SIZE_FACTOR,
                &max_factor.to_string(),
                "must be greater than or equal to 1",
            ));
        }
        let max_pool_size = scale(DYNAMIC_MAX_POOL_SIZE_FACTOR, max_factor, parallelism)?.max(parallelism);

        let saturate = parameters.get_bool(DYNAMIC_SATURATE)?.unwrap_or(true);
        ParallelExecutionConfiguration::with_parallelism(parallelism, max_pool_size, saturate)
    }
}

/// `factor * base`, rounded down. Products beyond `usize` are rejected
/// rather than saturated.
fn scale(key: &str, factor: f64, base: usize) -> Result<usize, ConfigError> {
    let scaled = factor * base as f64;
    if scaled >= usize::MAX as f64 {
        return Err(ConfigError::invalid(
            key,
            &factor.to_string(),
            format!("yields a pool size beyond {} for a base of {base}", usize::MAX),
        ));
    }
    Ok(scaled as usize)
}

/// Custom strategies by name, selected with `config.strategy = custom` and
/// `config.custom.name`.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    custom: HashMap<String, Arc<dyn ParallelExecutionConfigurationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        strategy: impl ParallelExecutionConfigurationStrategy + 'static,
    ) -> Self {
        self.custom.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Resolves `kasane.parallel.config.strategy` and runs the strategy.
    pub fn configuration(
        &self,
        parameters: &dyn ConfigurationParameters,
    ) -> Result<ParallelExecutionConfiguration, ConfigError> {
        let scoped = PrefixedConfigurationParameters::new(parameters, CONFIG_PREFIX);
        let name = scoped
            .get(STRATEGY)
            .unwrap_or_else(|| "dynamic".to_string());

        match name.trim().to_ascii_lowercase().as_str() {
            "dynamic" => DynamicStrategy.create_configuration(&scoped),
            "fixed" => FixedStrategy.create_configuration(&scoped),
            "custom" => {
                let custom = scoped.get(CUSTOM_NAME).ok_or_else(|| ConfigError::Missing {
                    key: format!("{CONFIG_PREFIX}{CUSTOM_NAME}"),
                })?;
                let strategy = self
                    .custom
                    .get(&custom)
                    .ok_or(ConfigError::UnregisteredStrategy(custom))?;
                strategy.create_configuration(&scoped)
            }
            _ => Err(ConfigError::UnknownStrategy(name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorKind {
    #[default]
    WorkStealing,
    FixedPool,
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "work-stealing" => Ok(ExecutorKind::WorkStealing),
            "fixed-pool" => Ok(ExecutorKind::FixedPool),
            _ => Err(ConfigError::UnknownExecutor(value.to_string())),
        }
    }
}

/// The top-level `kasane.parallel.*` switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelSettings {
    pub enabled: bool,
    pub executor: ExecutorKind,
    pub isolation_boundary: Option<String>,
    pub grace_period_ms: u64,
}

impl ParallelSettings {
    pub fn from_parameters(parameters: &dyn ConfigurationParameters) -> Result<Self, ConfigError> {
        let enabled = parameters.get_bool(PARALLEL_ENABLED)?.unwrap_or(false);
        let executor = match parameters.get(PARALLEL_EXECUTOR) {
            Some(value) => value.parse()?,
            None => ExecutorKind::default(),
        };
        let isolation_boundary = parameters
            .get(ISOLATION_BOUNDARY)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let grace_period_ms = parse(
            ISOLATION_GRACE_PERIOD,
            parameters.get(ISOLATION_GRACE_PERIOD),
            "expected a number of milliseconds",
        )?
        .unwrap_or(DEFAULT_GRACE_PERIOD_MS);

        Ok(Self {
            enabled,
            executor,
            isolation_boundary,
            grace_period_ms,
        })
    }
}
