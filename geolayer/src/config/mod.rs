//! Configuration: the INI file and the settings derived from it.
//!
//! ```ignore
//! use geolayer::config::{ConfigFile, GeoLayerConfig};
//!
//! let file = ConfigFile::load().unwrap_or_default();
//! let config = GeoLayerConfig::from_config_file(&file).with_prefetch(false);
//! ```

mod error;
mod file;
mod settings;
mod size;

pub use error::ConfigError;
pub use file::{
    config_file_path, CacheSettings, ConcurrencySettings, ConfigFile, GeneralSettings,
    LoggingSettings, NetworkSettings, PrefetchSettings, ResamplingSettings, DEFAULT_LOG_LEVEL,
    DEFAULT_TILE_SIZE,
};
pub use settings::GeoLayerConfig;
pub use size::{format_size, parse_size};
