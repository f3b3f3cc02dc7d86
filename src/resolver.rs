//! Name resolution for data sources and documents, and field listing for data sources.

use regex::RegexBuilder;

use crate::ast::DocRef;
use crate::config::DocCatalog;
use crate::error::ResolveError;

pub const DATA_SOURCE_TYPE: &str = "DataSource";
pub const DICTIONARY_TYPE: &str = "Dictionary";

/// Resolves names typed in a query to canonical document references.
///
/// Implementations look up by uuid first, then by case-insensitive name, and must fail
/// rather than guess when a name matches no document or more than one.
pub trait DocResolver: Send + Sync {
    fn resolve_data_source_ref(&self, name: &str) -> Result<DocRef, ResolveError>;

    fn resolve_doc_ref(&self, doc_type: &str, name: &str) -> Result<DocRef, ResolveError>;
}

/// Lists the fields of a data source. `filter` is either `None` for every field or a
/// regular expression the field name must fully match.
pub trait QueryFieldProvider: Send + Sync {
    fn find_fields(&self, data_source: &DocRef, filter: Option<&str>) -> Vec<String>;
}

/// Both collaborators, backed by a [`DocCatalog`].
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    catalog: DocCatalog,
}

impl CatalogResolver {
    pub fn new(catalog: DocCatalog) -> Self {
        Self { catalog }
    }
}

fn resolve(
    candidates: impl Iterator<Item = DocRef> + Clone,
    doc_type: &str,
    name: &str,
) -> Result<DocRef, ResolveError> {
    if let Some(found) = candidates.clone().find(|doc| doc.uuid == name) {
        return Ok(found);
    }

    let mut matches = candidates.filter(|doc| doc.name.eq_ignore_ascii_case(name));
    match (matches.next(), matches.next()) {
        (Some(found), None) => Ok(found),
        (None, _) => Err(ResolveError::NotFound {
            doc_type: doc_type.to_string(),
            name: name.to_string(),
        }),
        (Some(_), Some(_)) => Err(ResolveError::Ambiguous {
            doc_type: doc_type.to_string(),
            name: name.to_string(),
        }),
    }
}

impl DocResolver for CatalogResolver {
    fn resolve_data_source_ref(&self, name: &str) -> Result<DocRef, ResolveError> {
        let candidates = self.catalog.data_sources.iter().map(|ds| ds.doc_ref());
        resolve(candidates, DATA_SOURCE_TYPE, name)
    }

    fn resolve_doc_ref(&self, doc_type: &str, name: &str) -> Result<DocRef, ResolveError> {
        let candidates = self
            .catalog
            .documents
            .iter()
            .filter(|doc| doc.doc_type == doc_type)
            .cloned();
        resolve(candidates, doc_type, name)
    }
}

impl QueryFieldProvider for CatalogResolver {
    fn find_fields(&self, data_source: &DocRef, filter: Option<&str>) -> Vec<String> {
        let Some(config) = self.catalog.data_source(&data_source.uuid) else {
            return Vec::new();
        };
        let pattern = match filter {
            None => None,
            Some(filter) => match RegexBuilder::new(&format!("^(?:{filter})$"))
                .case_insensitive(true)
                .build()
            {
                Ok(pattern) => Some(pattern),
                Err(_) => return Vec::new(),
            },
        };
        config
            .fields
            .iter()
            .filter(|field| pattern.as_ref().map_or(true, |p| p.is_match(field)))
            .cloned()
            .collect()
    }
}

/// Converts a `*`/`?` wildcard pattern into the regular expression form
/// [`QueryFieldProvider::find_fields`] expects. A lone `*` matches everything.
pub fn wildcard_filter(pattern: &str) -> Option<String> {
    if pattern == "*" {
        return None;
    }
    let mut out = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push_str(".?"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSourceConfig;

    fn resolver() -> CatalogResolver {
        CatalogResolver::new(DocCatalog {
            data_sources: vec![
                DataSourceConfig {
                    doc_type: "View".to_string(),
                    uuid: "v-1".to_string(),
                    name: "Events".to_string(),
                    fields: vec![
                        "EventTime".to_string(),
                        "Feed".to_string(),
                        "UserId".to_string(),
                        "UserName".to_string(),
                    ],
                },
                DataSourceConfig {
                    doc_type: "Index".to_string(),
                    uuid: "i-1".to_string(),
                    name: "Dup".to_string(),
                    fields: vec![],
                },
                DataSourceConfig {
                    doc_type: "Index".to_string(),
                    uuid: "i-2".to_string(),
                    name: "dup".to_string(),
                    fields: vec![],
                },
            ],
            documents: vec![
                DocRef::new("Dictionary", "d-1", "Approved Feeds"),
                DocRef::new("Pipeline", "p-1", "Approved Feeds"),
            ],
        })
    }

    #[test]
    fn test_resolve_by_name_ignores_case() {
        let doc = resolver().resolve_data_source_ref("events").unwrap();
        assert_eq!(doc, DocRef::new("View", "v-1", "Events"));
    }

    #[test]
    fn test_resolve_by_uuid_first() {
        let doc = resolver().resolve_data_source_ref("i-2").unwrap();
        assert_eq!(doc.name, "dup");
    }

    #[test]
    fn test_resolve_failures() {
        let resolver = resolver();
        assert!(matches!(
            resolver.resolve_data_source_ref("Missing"),
            Err(ResolveError::NotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve_data_source_ref("DUP"),
            Err(ResolveError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_resolve_doc_ref_filters_by_type() {
        let doc = resolver()
            .resolve_doc_ref(DICTIONARY_TYPE, "approved feeds")
            .unwrap();
        assert_eq!(doc.uuid, "d-1");
    }

    #[test]
    fn test_find_fields() {
        let resolver = resolver();
        let events = DocRef::new("View", "v-1", "Events");
        assert_eq!(resolver.find_fields(&events, None).len(), 4);

        let filter = wildcard_filter("User*");
        assert_eq!(
            resolver.find_fields(&events, filter.as_deref()),
            vec!["UserId", "UserName"]
        );
        assert!(resolver
            .find_fields(&DocRef::new("View", "nope", "Nope"), None)
            .is_empty());
    }

    #[test]
    fn test_wildcard_filter() {
        assert_eq!(wildcard_filter("*"), None);
        assert_eq!(wildcard_filter("a?b*").as_deref(), Some("a.?b.*"));
        assert_eq!(wildcard_filter("a.b").as_deref(), Some(r"a\.b"));
    }
}
