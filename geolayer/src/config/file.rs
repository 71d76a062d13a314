//! INI configuration file.
//!
//! ```text
//! [general]        tileSize, maxHotCacheBytes, maxWarmCacheBytes,
//!                  warmCacheDirectory, minLevelSize
//! [concurrency]    decode, network
//! [prefetch]       enabled, maxCandidates
//! [resampling]     kernel, quality
//! [cache]          hotThreshold, warmThreshold
//! [network]        timeoutSecs, maxAttempts
//! [logging]        level, directory
//! ```
//!
//! Absent keys keep their defaults. A present key with an unusable value is
//! an error naming its section and key.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ini::{Ini, Properties};
use tracing::{debug, info};

use super::size::parse_size;
use super::ConfigError;
use crate::cache::{
    default_warm_directory, DEFAULT_HOT_CAPACITY_BYTES, DEFAULT_HOT_THRESHOLD,
    DEFAULT_MAX_PREFETCH_CANDIDATES, DEFAULT_WARM_CAPACITY_BYTES, DEFAULT_WARM_THRESHOLD,
};
use crate::executor::DEFAULT_NETWORK_CONCURRENCY;
use crate::pyramid::{Kernel, DEFAULT_MIN_LEVEL_SIZE};
use crate::store::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};

/// Default edge length of tiles written by the pyramid builder.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default log level when neither the file nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Path of the per-user config file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("geolayer")
        .join("config.ini")
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralSettings {
    pub tile_size: u32,
    pub max_hot_cache_bytes: u64,
    pub max_warm_cache_bytes: u64,
    pub warm_cache_directory: PathBuf,
    pub min_level_size: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            max_hot_cache_bytes: DEFAULT_HOT_CAPACITY_BYTES,
            max_warm_cache_bytes: DEFAULT_WARM_CAPACITY_BYTES,
            warm_cache_directory: default_warm_directory(),
            min_level_size: DEFAULT_MIN_LEVEL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencySettings {
    /// Decode and resample permits.
    pub decode: usize,
    /// Concurrent range requests.
    pub network: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            decode: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            network: DEFAULT_NETWORK_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchSettings {
    pub enabled: bool,
    pub max_candidates: usize,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_candidates: DEFAULT_MAX_PREFETCH_CANDIDATES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResamplingSettings {
    pub kernel: String,
    pub quality: String,
}

impl Default for ResamplingSettings {
    fn default() -> Self {
        Self {
            kernel: Kernel::default().to_string(),
            quality: "normal".to_string(),
        }
    }
}

impl ResamplingSettings {
    /// The kernel these settings select. Values are validated on load, so
    /// this only falls back to the default for hand-built settings.
    pub fn kernel(&self) -> Kernel {
        Kernel::from_config(&self.kernel, &self.quality).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub hot_threshold: f64,
    pub warm_threshold: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            warm_threshold: DEFAULT_WARM_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for daily log files; console only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
        }
    }
}

// =============================================================================
// ConfigFile
// =============================================================================

/// Parsed contents of `config.ini`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub general: GeneralSettings,
    pub concurrency: ConcurrencySettings,
    pub prefetch: PrefetchSettings,
    pub resampling: ResamplingSettings,
    pub cache: CacheSettings,
    pub network: NetworkSettings,
    pub logging: LoggingSettings,
}

impl ConfigFile {
    /// Loads the per-user config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_file_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parses INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = ConfigFile::default();

        if let Some(s) = ini.section(Some("general")) {
            let g = &mut config.general;
            if let Some(v) = parsed::<u32>(s, "general", "tileSize")? {
                if v < 16 || v % 16 != 0 {
                    return Err(ConfigError::invalid(
                        "general",
                        "tileSize",
                        v.to_string(),
                        "must be a positive multiple of 16",
                    ));
                }
                g.tile_size = v;
            }
            if let Some(v) = size(s, "general", "maxHotCacheBytes")? {
                g.max_hot_cache_bytes = v;
            }
            if let Some(v) = size(s, "general", "maxWarmCacheBytes")? {
                g.max_warm_cache_bytes = v;
            }
            if let Some(v) = s.get("warmCacheDirectory") {
                g.warm_cache_directory = expand_home(v.trim());
            }
            if let Some(v) = parsed::<u64>(s, "general", "minLevelSize")? {
                g.min_level_size = positive(v, "general", "minLevelSize")?;
            }
        }

        if let Some(s) = ini.section(Some("concurrency")) {
            if let Some(v) = parsed::<usize>(s, "concurrency", "decode")? {
                config.concurrency.decode = positive(v, "concurrency", "decode")?;
            }
            if let Some(v) = parsed::<usize>(s, "concurrency", "network")? {
                config.concurrency.network = positive(v, "concurrency", "network")?;
            }
        }

        if let Some(s) = ini.section(Some("prefetch")) {
            if let Some(v) = boolean(s, "prefetch", "enabled")? {
                config.prefetch.enabled = v;
            }
            if let Some(v) = parsed::<usize>(s, "prefetch", "maxCandidates")? {
                config.prefetch.max_candidates = v;
            }
        }

        if let Some(s) = ini.section(Some("resampling")) {
            if let Some(v) = s.get("kernel") {
                config.resampling.kernel = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = s.get("quality") {
                let quality = v.trim().to_ascii_lowercase();
                if quality != "normal" && quality != "high" {
                    return Err(ConfigError::invalid(
                        "resampling",
                        "quality",
                        v,
                        "expected normal or high",
                    ));
                }
                config.resampling.quality = quality;
            }
            if Kernel::from_config(&config.resampling.kernel, "normal").is_none() {
                return Err(ConfigError::invalid(
                    "resampling",
                    "kernel",
                    config.resampling.kernel.clone(),
                    "expected box, bilinear, lanczos2 or lanczos3",
                ));
            }
        }

        if let Some(s) = ini.section(Some("cache")) {
            if let Some(v) = parsed::<f64>(s, "cache", "hotThreshold")? {
                config.cache.hot_threshold = probability(v, "cache", "hotThreshold")?;
            }
            if let Some(v) = parsed::<f64>(s, "cache", "warmThreshold")? {
                config.cache.warm_threshold = probability(v, "cache", "warmThreshold")?;
            }
            if config.cache.warm_threshold > config.cache.hot_threshold {
                return Err(ConfigError::invalid(
                    "cache",
                    "warmThreshold",
                    config.cache.warm_threshold.to_string(),
                    "must not exceed hotThreshold",
                ));
            }
        }

        if let Some(s) = ini.section(Some("network")) {
            if let Some(v) = parsed::<u64>(s, "network", "timeoutSecs")? {
                config.network.timeout_secs = positive(v, "network", "timeoutSecs")?;
            }
            if let Some(v) = parsed::<u32>(s, "network", "maxAttempts")? {
                config.network.max_attempts = positive(v, "network", "maxAttempts")?;
            }
        }

        if let Some(s) = ini.section(Some("logging")) {
            if let Some(v) = s.get("level") {
                let level = v.trim().to_ascii_lowercase();
                if tracing::Level::from_str(&level).is_err() {
                    return Err(ConfigError::invalid(
                        "logging",
                        "level",
                        v,
                        "expected trace, debug, info, warn or error",
                    ));
                }
                config.logging.level = level;
            }
            if let Some(v) = s.get("directory") {
                let v = v.trim();
                config.logging.directory = (!v.is_empty()).then(|| expand_home(v));
            }
        }

        debug!(?config, "Parsed configuration");
        Ok(config)
    }

    /// Renders the configuration as INI text.
    pub fn to_ini_string(&self) -> String {
        let mut ini = Ini::new();
        ini.with_section(Some("general"))
            .set("tileSize", self.general.tile_size.to_string())
            .set("maxHotCacheBytes", self.general.max_hot_cache_bytes.to_string())
            .set("maxWarmCacheBytes", self.general.max_warm_cache_bytes.to_string())
            .set(
                "warmCacheDirectory",
                self.general.warm_cache_directory.display().to_string(),
            )
            .set("minLevelSize", self.general.min_level_size.to_string());
        ini.with_section(Some("concurrency"))
            .set("decode", self.concurrency.decode.to_string())
            .set("network", self.concurrency.network.to_string());
        ini.with_section(Some("prefetch"))
            .set("enabled", self.prefetch.enabled.to_string())
            .set("maxCandidates", self.prefetch.max_candidates.to_string());
        ini.with_section(Some("resampling"))
            .set("kernel", self.resampling.kernel.clone())
            .set("quality", self.resampling.quality.clone());
        ini.with_section(Some("cache"))
            .set("hotThreshold", self.cache.hot_threshold.to_string())
            .set("warmThreshold", self.cache.warm_threshold.to_string());
        ini.with_section(Some("network"))
            .set("timeoutSecs", self.network.timeout_secs.to_string())
            .set("maxAttempts", self.network.max_attempts.to_string());
        {
            let mut logging = ini.with_section(Some("logging"));
            logging.set("level", self.logging.level.clone());
            if let Some(dir) = &self.logging.directory {
                logging.set("directory", dir.display().to_string());
            }
        }

        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = ini.write_to(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Writes the per-user config file, creating its directory.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(config_file_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, self.to_ini_string()).map_err(write_err)
    }
}

// =============================================================================
// Value helpers
// =============================================================================

fn parsed<T: FromStr>(
    props: &Properties,
    section: &'static str,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(section, key, raw, "not a valid number")),
    }
}

fn size(
    props: &Properties,
    section: &'static str,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => parse_size(raw)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(section, key, raw, "not a valid size")),
    }
}

fn boolean(
    props: &Properties,
    section: &'static str,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match props.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(section, key, v, "expected true or false")),
        },
    }
}

fn positive<T: PartialOrd + Default + ToString>(
    value: T,
    section: &'static str,
    key: &'static str,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::invalid(
            section,
            key,
            value.to_string(),
            "must be greater than zero",
        ))
    }
}

fn probability(value: f64, section: &'static str, key: &'static str) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::invalid(
            section,
            key,
            value.to_string(),
            "must be between 0 and 1",
        ))
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[general]
tileSize = 512
maxHotCacheBytes = 64MB
maxWarmCacheBytes = 1073741824
warmCacheDirectory = /var/cache/geolayer
minLevelSize = 128

[concurrency]
decode = 6
network = 2

[prefetch]
enabled = false
maxCandidates = 4

[resampling]
kernel = lanczos3
quality = normal

[cache]
hotThreshold = 0.8
warmThreshold = 0.2

[network]
timeoutSecs = 10
maxAttempts = 2

[logging]
level = DEBUG
directory = /var/log/geolayer
";

    #[test]
    fn test_parse_full_file() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(config.general.tile_size, 512);
        assert_eq!(config.general.max_hot_cache_bytes, 64 << 20);
        assert_eq!(config.general.max_warm_cache_bytes, 1 << 30);
        assert_eq!(config.general.warm_cache_directory, PathBuf::from("/var/cache/geolayer"));
        assert_eq!(config.general.min_level_size, 128);
        assert_eq!(config.concurrency.decode, 6);
        assert!(!config.prefetch.enabled);
        assert_eq!(config.resampling.kernel(), Kernel::Lanczos(3));
        assert_eq!(config.cache.hot_threshold, 0.8);
        assert_eq!(config.network.max_attempts, 2);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.directory, Some(PathBuf::from("/var/log/geolayer")));
    }

    #[test]
    fn test_absent_keys_keep_defaults() {
        let config = ConfigFile::parse("[prefetch]\nmaxCandidates = 3\n").unwrap();
        assert_eq!(config.prefetch.max_candidates, 3);
        assert!(config.prefetch.enabled);
        assert_eq!(config.general, GeneralSettings::default());
        assert_eq!(config.cache, CacheSettings::default());
    }

    #[test]
    fn test_invalid_value_names_section_and_key() {
        let err = ConfigFile::parse("[concurrency]\nnetwork = many\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { section: "concurrency", key: "network", .. }
        ));
        assert!(err.to_string().contains("[concurrency] network"));

        let err = ConfigFile::parse("[cache]\nhotThreshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "hotThreshold", .. }));

        let err = ConfigFile::parse("[cache]\nhotThreshold = 0.2\nwarmThreshold = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "warmThreshold", .. }));

        let err = ConfigFile::parse("[general]\ntileSize = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "tileSize", .. }));

        let err = ConfigFile::parse("[resampling]\nkernel = cubic\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "kernel", .. }));

        let err = ConfigFile::parse("[logging]\nlevel = loud\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "level", .. }));
    }

    #[test]
    fn test_high_quality_selects_lanczos() {
        let config = ConfigFile::parse("[resampling]\nkernel = box\nquality = high\n").unwrap();
        assert_eq!(config.resampling.kernel(), Kernel::Lanczos(3));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.ini");
        let config = ConfigFile::parse(SAMPLE).unwrap();

        config.save_to(&path).unwrap();
        let reloaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigFile::load_from(dir.path().join("absent.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
