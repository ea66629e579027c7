use super::types::MusterConfig;
use crate::error::Result;
use config::{Config, Environment, File};

/// Builder-pattern configuration loader: `config.yaml` (or an explicit
/// path) under `MUSTER_`-prefixed environment overrides.
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: true,
        }
    }

    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    pub fn load_from_env(mut self, enabled: bool) -> Self {
        self.load_env = enabled;
        self
    }

    pub fn build(self) -> Result<MusterConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&MusterConfig::default())?);

        if let Some(path) = &self.config_file {
            builder = builder.add_source(File::with_name(path).required(false));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("MUSTER")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let config: MusterConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_config_with_no_file() {
        let config = ConfigLoader::new()
            .load_from_file(Some("/nonexistent/path.yaml"))
            .load_from_env(false)
            .build()
            .unwrap();
        assert_eq!(config.aggregator.port, 8090);
        assert_eq!(config.aggregator.prefix, "x");
    }
}
