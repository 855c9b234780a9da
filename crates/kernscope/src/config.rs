//! Run configuration: cache and traversal limits plus the structure layouts
//! for the target OS.

use crate::layout::{ImageLayout, ProcessLayout, RegionLayout};
use crate::objects::list::DEFAULT_MAX_NODES;
use crate::objects::tree::DEFAULT_MAX_TREE_NODES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_cache_size() -> usize {
    4096
}

fn default_max_list_nodes() -> usize {
    DEFAULT_MAX_NODES
}

fn default_max_tree_nodes() -> usize {
    DEFAULT_MAX_TREE_NODES
}

fn default_chunk_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_dump_region() -> u64 {
    1 << 30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Entries kept in each page-table cache.
    #[serde(default = "default_cache_size")]
    pub translation_cache_size: usize,
    #[serde(default = "default_max_list_nodes")]
    pub max_list_nodes: usize,
    #[serde(default = "default_max_tree_nodes")]
    pub max_tree_nodes: usize,
    /// Read size when dumping a region.
    #[serde(default = "default_chunk_size")]
    pub dump_chunk_size: usize,
    /// Regions larger than this are not dumped.
    #[serde(default = "default_max_dump_region")]
    pub max_dump_region_size: u64,
    pub process: ProcessLayout,
    pub regions: RegionLayout,
    /// Image headers for process dumps; `None` disables them.
    #[serde(default)]
    pub image: Option<ImageLayout>,
}

impl Default for Config {
    fn default() -> Self {
        Self::windows()
    }
}

impl Config {
    pub fn windows() -> Self {
        Config {
            translation_cache_size: default_cache_size(),
            max_list_nodes: default_max_list_nodes(),
            max_tree_nodes: default_max_tree_nodes(),
            dump_chunk_size: default_chunk_size(),
            max_dump_region_size: default_max_dump_region(),
            process: ProcessLayout::windows(),
            regions: RegionLayout::windows(),
            image: Some(ImageLayout::pe64()),
        }
    }

    pub fn linux() -> Self {
        Config {
            process: ProcessLayout::linux(),
            regions: RegionLayout::linux(),
            image: None,
            ..Self::windows()
        }
    }

    /// Preset by OS name (`windows` or `linux`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "windows" => Some(Self::windows()),
            "linux" => Some(Self::linux()),
            _ => None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.translation_cache_size, 4096);
        assert_eq!(config.max_list_nodes, 65536);
        assert_eq!(config.max_tree_nodes, 4096);
        assert_eq!(config.max_dump_region_size, 1 << 30);
        assert_eq!(config.dump_chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.process.type_name, "_EPROCESS");
        assert!(config.image.is_some());
    }

    #[test]
    fn test_linux_preset() {
        let config = Config::preset("Linux").unwrap();
        assert_eq!(config.process.list_head, "init_task");
        assert!(config.process.dtb_is_virtual);
        assert!(config.image.is_none());
        assert!(Config::preset("plan9").is_none());
    }

    #[test]
    fn test_json_file_round_trip_with_defaults() {
        let mut json = serde_json::to_value(Config::linux()).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("max_tree_nodes");
        obj.insert("max_list_nodes".into(), 128.into());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.to_string().as_bytes()).unwrap();

        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_list_nodes, 128);
        assert_eq!(config.max_tree_nodes, 4096);
        assert_eq!(config.process, ProcessLayout::linux());
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Config::from_json_file("/nonexistent/kernscope.json"),
            Err(ConfigError::Io { .. })
        ));
        assert!(matches!(
            Config::from_json_str("{\"process\": 1}"),
            Err(ConfigError::Json(_))
        ));
    }
}
