//! Application configuration for [`GeoLayerApp`](super::GeoLayerApp).

use crate::config::{ConfigFile, GeoLayerConfig};

/// Everything needed to bring up a dataset: where it lives and how the
/// components are tuned.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Local path or `http(s)://` URL of the container.
    pub source: String,

    /// Namespace for the warm tier. Defaults to the source description.
    pub dataset_id: Option<String>,

    pub settings: GeoLayerConfig,
}

impl AppConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dataset_id: None,
            settings: GeoLayerConfig::default(),
        }
    }

    /// Application config from a loaded configuration file.
    pub fn from_config_file(source: impl Into<String>, file: &ConfigFile) -> Self {
        Self::new(source).with_settings(GeoLayerConfig::from_config_file(file))
    }

    pub fn with_settings(mut self, settings: GeoLayerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_dataset_id(mut self, id: impl Into<String>) -> Self {
        self.dataset_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_from_file() {
        let file = ConfigFile::parse("[prefetch]\nenabled = false\n").unwrap();
        let config = AppConfig::from_config_file("/data/ortho.tif", &file).with_dataset_id("ortho");

        assert_eq!(config.source, "/data/ortho.tif");
        assert_eq!(config.dataset_id.as_deref(), Some("ortho"));
        assert!(!config.settings.cache.prefetch_enabled);
    }
}
