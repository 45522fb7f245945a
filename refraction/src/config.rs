use config::{Config, ConfigError, Environment, File};
use heck::{ToLowerCamelCase, ToSnakeCase};
use serde::Deserialize;

use crate::executor::DialectCapabilities;

/// Mapping between in-memory property names and database column names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    /// Properties and columns share the same name.
    #[default]
    Preserve,
    /// `ownerId` in memory, `owner_id` in the database.
    SnakeCase,
}

impl ColumnNaming {
    pub fn to_column(&self, property: &str) -> String {
        match self {
            ColumnNaming::Preserve => property.to_string(),
            ColumnNaming::SnakeCase => property.to_snake_case(),
        }
    }

    pub fn to_property(&self, column: &str) -> String {
        match self {
            ColumnNaming::Preserve => column.to_string(),
            ColumnNaming::SnakeCase => column.to_lower_camel_case(),
        }
    }
}

/// Reserved property names recognised inside an insert graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GraphMarkers {
    #[serde(default = "default_id_marker")]
    pub id: String,
    #[serde(default = "default_ref_marker")]
    pub reference: String,
    #[serde(default = "default_db_ref_marker")]
    pub db_ref: String,
}

fn default_id_marker() -> String {
    "#id".to_string()
}

fn default_ref_marker() -> String {
    "#ref".to_string()
}

fn default_db_ref_marker() -> String {
    "#dbRef".to_string()
}

impl Default for GraphMarkers {
    fn default() -> Self {
        Self {
            id: default_id_marker(),
            reference: default_ref_marker(),
            db_ref: default_db_ref_marker(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub naming: ColumnNaming,
    #[serde(default)]
    pub markers: GraphMarkers,
    /// Overrides the capabilities derived from the connection backend.
    #[serde(default)]
    pub dialect: Option<DialectCapabilities>,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
}

fn default_max_recursion_depth() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            naming: ColumnNaming::default(),
            markers: GraphMarkers::default(),
            dialect: None,
            max_recursion_depth: default_max_recursion_depth(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional `refraction.toml` in the working directory, then
    /// `REFRACTION__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("refraction")
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("REFRACTION").separator("__"))
            .build()?;

        settings.try_deserialize::<EngineConfig>().map_err(|e| {
            ConfigError::Message(format!("engine configuration could not be loaded: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_naming_round_trips() {
        let naming = ColumnNaming::SnakeCase;
        assert_eq!(naming.to_column("ownerId"), "owner_id");
        assert_eq!(naming.to_property("owner_id"), "ownerId");
        assert_eq!(ColumnNaming::Preserve.to_column("ownerId"), "ownerId");
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r##"{"naming": "snake_case", "markers": {"id": "@id"}}"##)
                .unwrap();
        assert_eq!(config.naming, ColumnNaming::SnakeCase);
        assert_eq!(config.markers.id, "@id");
        assert_eq!(config.markers.reference, "#ref");
        assert_eq!(config.max_recursion_depth, 64);
        assert!(config.dialect.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load_from("does-not-exist/refraction").unwrap();
        assert_eq!(config.markers, GraphMarkers::default());
    }
}
