//! Visualisation settings for the `show` clause.
//!
//! ```text
//! show LineChart(x = EventTime, y = "Count")
//!      ^^^^^^^^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^
//!      vis type  parameter = column name, comma separated
//! ```

use std::collections::BTreeMap;

use crate::ast::{TableSettings, VisSettings};
use crate::error::{SyntaxError, SyntaxResult};
use crate::token::{GroupKind, Node, TokenGroup, TokenKind};

/// Derives visualisation table settings from a `show` clause group.
pub trait VisualisationTokenConsumer: Send + Sync {
    fn process_vis(&self, group: &TokenGroup<'_>, parent: &TableSettings) -> SyntaxResult<TableSettings>;
}

/// Maps each visualisation parameter onto a column of the parent table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicVisualisationConsumer;

impl VisualisationTokenConsumer for BasicVisualisationConsumer {
    fn process_vis(&self, group: &TokenGroup<'_>, parent: &TableSettings) -> SyntaxResult<TableSettings> {
        let children = group.children();
        let Some(first) = children.first() else {
            return Err(SyntaxError::at(group, "Expected visualisation type"));
        };
        if let Some(extra) = children.get(1) {
            return Err(SyntaxError::at(extra, "Unexpected token"));
        }

        let (vis_type, params) = match first {
            Node::Token(token) if token.kind.is_string() => (token.unescaped().to_string(), BTreeMap::new()),
            Node::Group(function) => match &function.kind {
                GroupKind::Function { name, .. } => {
                    (name.slice().to_string(), map_params(function, parent)?)
                }
                _ => return Err(SyntaxError::at(first, "Expected visualisation type")),
            },
            Node::Token(_) => return Err(SyntaxError::at(first, "Expected visualisation type")),
        };

        Ok(TableSettings {
            vis_settings: Some(VisSettings { vis_type, params }),
            ..parent.clone()
        })
    }
}

fn map_params(function: &TokenGroup<'_>, parent: &TableSettings) -> SyntaxResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let children = function.children();
    if children.is_empty() {
        return Ok(params);
    }

    for param in children.split(|node| node.kind() == TokenKind::Comma) {
        let [key, equals, column, rest @ ..] = param else {
            let at = param.first().map_or_else(
                || SyntaxError::at(function, "Expected parameter"),
                |node| SyntaxError::at(node, "Expected parameter = column"),
            );
            return Err(at);
        };
        if let Some(extra) = rest.first() {
            return Err(SyntaxError::at(extra, "Unexpected token"));
        }
        if !key.is_string() {
            return Err(SyntaxError::at(key, "Expected parameter name"));
        }
        if equals.kind() != TokenKind::Equals {
            return Err(SyntaxError::at(equals, "Expected equals"));
        }
        if !column.is_string() && column.kind() != TokenKind::FunctionGroup {
            return Err(SyntaxError::at(column, "Expected column name"));
        }

        let name = column.unescaped();
        let Some(found) = parent
            .columns
            .iter()
            .find(|c| c.name == name || c.id == name)
        else {
            return Err(SyntaxError::at(column, format!("Unknown column '{name}'")));
        };
        params.insert(key.unescaped().to_string(), found.id.clone());
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Column;
    use crate::lexer::Tokeniser;
    use crate::parser::StructureBuilder;

    fn parent() -> TableSettings {
        let column = |id: &str, name: &str| Column {
            id: id.to_string(),
            name: name.to_string(),
            expression: format!("${{{name}}}"),
            sort: None,
            group: None,
            filter: None,
            visible: true,
            special: false,
        };
        TableSettings {
            columns: vec![column("eventtime-1", "EventTime"), column("count-1", "Count")],
            ..TableSettings::default()
        }
    }

    fn vis(input: &str) -> SyntaxResult<TableSettings> {
        let tokens = Tokeniser::parse(input);
        let root = StructureBuilder::build(&tokens)?;
        let group = root.children()[0].as_group().unwrap();
        BasicVisualisationConsumer.process_vis(group, &parent())
    }

    #[test]
    fn test_params_map_to_column_ids() {
        let table = vis("show LineChart(x = EventTime, y = 'Count')").unwrap();
        let settings = table.vis_settings.unwrap();
        assert_eq!(settings.vis_type, "LineChart");
        assert_eq!(settings.params.get("x").map(String::as_str), Some("eventtime-1"));
        assert_eq!(settings.params.get("y").map(String::as_str), Some("count-1"));
        assert_eq!(table.columns, parent().columns);
    }

    #[test]
    fn test_type_without_params() {
        let table = vis("show Table").unwrap();
        let settings = table.vis_settings.unwrap();
        assert_eq!(settings.vis_type, "Table");
        assert!(settings.params.is_empty());
    }

    #[test]
    fn test_errors() {
        assert_eq!(vis("show").unwrap_err().message(), "Expected visualisation type");
        assert_eq!(
            vis("show LineChart(x = Missing)").unwrap_err().message(),
            "Unknown column 'Missing'"
        );
        assert_eq!(
            vis("show LineChart(x EventTime)").unwrap_err().message(),
            "Expected parameter = column"
        );
        assert_eq!(
            vis("show LineChart(x > EventTime)").unwrap_err().message(),
            "Expected equals"
        );
        assert_eq!(vis("show a b").unwrap_err().message(), "Unexpected token");
    }
}
