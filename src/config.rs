//! 文档目录配置模块，负责加载JSON配置文件
//!
//! ```json
//! {
//!   "dataSources": [
//!     { "type": "View", "uuid": "0f6c...", "name": "Events", "fields": ["EventTime", "Feed"] }
//!   ],
//!   "documents": [
//!     { "type": "Dictionary", "uuid": "9b1e...", "name": "Approved Feeds" }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ast::DocRef;
use crate::error::ConfigError;

/// 可查询的数据源及其字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl DataSourceConfig {
    pub fn doc_ref(&self) -> DocRef {
        DocRef::new(&self.doc_type, &self.uuid, &self.name)
    }
}

/// 查询中可以按名称引用的全部文档
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocCatalog {
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub documents: Vec<DocRef>,
}

impl DocCatalog {
    /// 从JSON文件加载目录
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, "<inline>")
    }

    fn parse(content: &str, path: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Json {
            path: path.to_string(),
            source,
        })
    }

    pub fn data_source(&self, uuid: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|ds| ds.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"{
        "dataSources": [
            { "type": "View", "uuid": "v-1", "name": "Events", "fields": ["EventTime", "Feed"] }
        ],
        "documents": [
            { "type": "Dictionary", "uuid": "d-1", "name": "Approved Feeds" }
        ]
    }"#;

    #[test]
    fn test_load_valid_json_config() {
        let temp_file = std::env::temp_dir().join("searchql_test_catalog.json");
        let mut file = fs::File::create(&temp_file).unwrap();
        writeln!(file, "{CATALOG}").unwrap();

        let catalog = DocCatalog::from_json_file(&temp_file).unwrap();
        assert_eq!(catalog.data_sources.len(), 1);
        assert_eq!(catalog.data_sources[0].fields, vec!["EventTime", "Feed"]);
        assert_eq!(
            catalog.documents[0],
            DocRef::new("Dictionary", "d-1", "Approved Feeds")
        );
        assert_eq!(
            catalog.data_source("v-1").map(|ds| ds.doc_ref()),
            Some(DocRef::new("View", "v-1", "Events"))
        );

        fs::remove_file(&temp_file).ok();
    }

    #[test]
    fn test_invalid_json_config() {
        let result = DocCatalog::from_json_str("invalid json");
        assert!(matches!(result, Err(ConfigError::Json { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = DocCatalog::from_json_file("non_existent_catalog.json");
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_sections_default_to_empty() {
        let catalog = DocCatalog::from_json_str("{}").unwrap();
        assert_eq!(catalog, DocCatalog::default());
    }
}
