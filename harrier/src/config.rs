use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};

use crate::precondition::UserId;
use crate::utils::read_file;
use crate::Context;

/// A view of one table in a [Config], remembering where it sits so errors
/// can name the full key
pub struct ConfigMap<'c> {
    path: &'c Path,
    name: Option<Cow<'c, str>>,
    table: &'c Table,
}

#[derive(Clone)]
pub struct Config {
    path: PathBuf,
    base: Table,
}

impl Config {
    pub fn parse(source: &Path) -> crate::Result<Self> {
        let as_str = read_file(source)?;
        Self::parse_str(source, &as_str)
    }

    pub fn parse_str(source: &Path, content: &str) -> crate::Result<Self> {
        let base: Table = match toml::from_str(content) {
            Ok(v) => v,
            Err(e) => return Err(crate::Error::new_cfg(source, &e)),
        };
        Ok(Self {
            base,
            path: PathBuf::from(source),
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_map(&self) -> ConfigMap {
        ConfigMap {
            name: None,
            path: &self.path,
            table: &self.base,
        }
    }
}

impl<'c> ConfigMap<'c> {
    fn key_path<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match &self.name {
            None => Cow::Borrowed(key),
            Some(v) => Cow::Owned(format!("{}.{}", v, key)),
        }
    }

    /// Helper to create a crate::Error for an invalid key
    pub fn invalid_key(&self, key: &str, expected: &str) -> crate::Error {
        let path = self.key_path(key);
        crate::Error::InvalidConfig(
            self.path.to_string_lossy().into_owned(),
            format!(
                "invalid value for key: {} (expected type: {})",
                path, expected
            ),
        )
    }

    /// Look up `key` and convert it with `f`, a present value `f` rejects is
    /// an invalid key
    fn typed<T>(
        &self,
        key: &str,
        expected: &str,
        f: impl FnOnce(&'c Value) -> Option<T>,
    ) -> crate::Result<Option<T>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(v) => f(v).map(Some).ok_or_else(|| self.invalid_key(key, expected)),
        }
    }

    pub fn maybe_get_int_typecheck(&self, key: &str) -> crate::Result<Option<i64>> {
        self.typed(key, "int", Value::as_integer)
    }

    /// Same as [ConfigMap::maybe_get_int_typecheck] but also requires the value to
    /// be non-negative
    pub fn maybe_get_u64_typecheck(&self, key: &str) -> crate::Result<Option<u64>> {
        match self.maybe_get_int_typecheck(key)? {
            Some(v) if v < 0 => Err(self.invalid_key(key, "non-negative int")),
            Some(v) => Ok(Some(v as u64)),
            None => Ok(None),
        }
    }

    pub fn maybe_get_str_typecheck(&self, key: &str) -> crate::Result<Option<&'c str>> {
        self.typed(key, "string", Value::as_str)
    }

    pub fn maybe_get_str_list_typecheck(&self, key: &str) -> crate::Result<Option<Vec<String>>> {
        self.typed(key, "array of strings", |v| {
            v.as_array()?
                .iter()
                .map(|it| it.as_str().map(String::from))
                .collect()
        })
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.table
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn maybe_get_map_typecheck(&self, key: &str) -> crate::Result<Option<ConfigMap<'c>>> {
        let name = self.key_path(key).into_owned();
        Ok(self.typed(key, "table", Value::as_table)?.map(|table| ConfigMap {
            name: Some(Cow::Owned(name)),
            path: self.path,
            table,
        }))
    }
}

/// The `[device]` section
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub serial: Option<String>,
    pub adb: Option<String>,
    pub command_timeout: Duration,
    /// User the test runs as, the device's current user if unset
    pub instrumented_user: Option<UserId>,
    pub can_adb: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: None,
            adb: None,
            command_timeout: Duration::from_secs(120),
            instrumented_user: None,
            can_adb: true,
        }
    }
}

impl DeviceConfig {
    fn from_map(map: &ConfigMap) -> crate::Result<Self> {
        let mut cfg = Self::default();
        cfg.serial = map.maybe_get_str_typecheck("serial")?.map(String::from);
        cfg.adb = map.maybe_get_str_typecheck("adb")?.map(String::from);
        if let Some(secs) = map.maybe_get_u64_typecheck("command-timeout-secs")? {
            if secs == 0 {
                return Err(map.invalid_key("command-timeout-secs", "positive int"));
            }
            cfg.command_timeout = Duration::from_secs(secs);
        }
        if let Some(user) = map.maybe_get_u64_typecheck("instrumented-user")? {
            cfg.instrumented_user = Some(
                UserId::try_from(user)
                    .map_err(|_| map.invalid_key("instrumented-user", "user id"))?,
            );
        }
        cfg.can_adb = map.get_bool_or("can-adb", true);
        Ok(cfg)
    }
}

/// Substrings of device output that mark a failure as worth retrying
pub const DEFAULT_TRANSIENT_MARKERS: &[&str] = &[
    "DeadObjectException",
    "Can't find service",
    "is being removed",
    "device offline",
    "device still authorizing",
    "Broken pipe",
    "Failure calling service",
];

/// The `[retry]` section, governs retries of transient provisioning failures
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub transient_markers: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            transient_markers: DEFAULT_TRANSIENT_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryConfig {
    /// No retries and no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1 based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    fn from_map(map: &ConfigMap) -> crate::Result<Self> {
        let mut cfg = Self::default();
        if let Some(n) = map.maybe_get_u64_typecheck("max-attempts")? {
            if n == 0 || n > u32::MAX as u64 {
                return Err(map.invalid_key("max-attempts", "positive int"));
            }
            cfg.max_attempts = n as u32;
        }
        if let Some(ms) = map.maybe_get_u64_typecheck("initial-backoff-ms")? {
            cfg.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = map.maybe_get_u64_typecheck("max-backoff-ms")? {
            cfg.max_backoff = Duration::from_millis(ms);
        }
        if let Some(markers) = map.maybe_get_str_list_typecheck("transient-markers")? {
            cfg.transient_markers = markers;
        }
        Ok(cfg)
    }
}

/// The `[catalog]` section, paths may be relative to the project directory
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogConfig {
    pub index: PathBuf,
    pub resources: Option<PathBuf>,
    pub apks: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index: PathBuf::from("testapps").join("index.pb"),
            resources: Some(PathBuf::from("testapps").join("resources")),
            apks: PathBuf::from("testapps").join("apks"),
        }
    }
}

impl CatalogConfig {
    fn from_map(map: &ConfigMap) -> crate::Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = map.maybe_get_str_typecheck("index")? {
            cfg.index = PathBuf::from(v);
        }
        if let Some(v) = map.maybe_get_str_typecheck("resources")? {
            cfg.resources = Some(PathBuf::from(v));
        }
        if let Some(v) = map.maybe_get_str_typecheck("apks")? {
            cfg.apks = PathBuf::from(v);
        }
        Ok(cfg)
    }
}

/// Everything read from the project's `harrier.toml`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HarnessConfig {
    pub device: DeviceConfig,
    pub retry: RetryConfig,
    pub catalog: CatalogConfig,
}

impl HarnessConfig {
    pub fn from_config(cfg: &Config) -> crate::Result<Self> {
        let map = cfg.get_map();
        let mut it = Self::default();
        if let Some(m) = map.maybe_get_map_typecheck("device")? {
            it.device = DeviceConfig::from_map(&m)?;
        }
        if let Some(m) = map.maybe_get_map_typecheck("retry")? {
            it.retry = RetryConfig::from_map(&m)?;
        }
        if let Some(m) = map.maybe_get_map_typecheck("catalog")? {
            it.catalog = CatalogConfig::from_map(&m)?;
        }
        Ok(it)
    }

    /// Load the configuration for the context's project, falling back to
    /// defaults when there is no configuration file.
    pub fn load(ctx: &dyn Context) -> crate::Result<Self> {
        match ctx.get_project_config()? {
            Some(cfg) => Self::from_config(cfg),
            None => Ok(Self::default()),
        }
    }
}
