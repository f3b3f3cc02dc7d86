//! Boolean expression clauses: terms, value lists and logical operators.
//!
//! A clause body is split into terms at every `and`/`or`/`not`. Bracket groups at the start
//! of a term are sub-expressions. Operators bind `not` first, then `and`, then `or`, and
//! every combination goes through [`ExpressionOperator::merge`].

use crate::ast::{BaseRequest, Condition, ExpressionItem, ExpressionOperator, ExpressionTerm, Op};
use crate::error::{SyntaxError, SyntaxResult};
use crate::expression::{DateExpressionParser, DatePoint, DateTimeSettings};
use crate::resolver::{DocResolver, DICTIONARY_TYPE};
use crate::token::{GroupKind, Node, Token, TokenGroup, TokenKind};

/// An expression item or a logical operator still waiting for its operands.
#[derive(Debug, Clone)]
pub enum Part<'a> {
    Item(ExpressionItem),
    Logic(Op, Token<'a>),
}

pub struct TermParser<'r> {
    doc_resolver: &'r dyn DocResolver,
    date_parser: &'r dyn DateExpressionParser,
    date_time_settings: &'r DateTimeSettings,
    request: &'r BaseRequest,
    in_having: bool,
    having_fields: Vec<String>,
}

impl<'r> TermParser<'r> {
    pub fn new(
        doc_resolver: &'r dyn DocResolver,
        date_parser: &'r dyn DateExpressionParser,
        date_time_settings: &'r DateTimeSettings,
        request: &'r BaseRequest,
    ) -> Self {
        Self {
            doc_resolver,
            date_parser,
            date_time_settings,
            request,
            in_having: false,
            having_fields: Vec::new(),
        }
    }

    /// While set, fields referenced by terms are recorded for [`Self::having_fields`].
    pub fn set_in_having(&mut self, in_having: bool) {
        self.in_having = in_having;
    }

    /// Fields referenced from `having` terms, in the order they were seen.
    pub fn having_fields(&self) -> &[String] {
        &self.having_fields
    }

    /// Builds the expression for the body of one clause.
    pub fn process_logic<'a>(&mut self, nodes: &[Node<'a>]) -> SyntaxResult<ExpressionOperator> {
        let parts = self.gather(nodes)?;
        combine(parts)
    }

    fn gather<'a>(&mut self, nodes: &[Node<'a>]) -> SyntaxResult<Vec<Part<'a>>> {
        let mut parts = Vec::new();
        let mut term_start: Option<usize> = None;

        for (i, node) in nodes.iter().enumerate() {
            let after_in = i > 0 && term_start.is_some() && nodes[i - 1].kind() == TokenKind::In;
            if after_in {
                continue;
            }

            if let (None, Some(group)) = (term_start, bracket(node)) {
                let operator = self.process_logic(group.children())?;
                parts.push(Part::Item(ExpressionItem::Operator(operator)));
                continue;
            }

            match node {
                Node::Token(token) if token.kind.is_logic() => {
                    if let Some(start) = term_start.take() {
                        let term = self.create_term(&nodes[start..i])?;
                        parts.push(Part::Item(ExpressionItem::Term(term)));
                    }
                    let op = match token.kind {
                        TokenKind::And => Op::And,
                        TokenKind::Or => Op::Or,
                        _ => Op::Not,
                    };
                    parts.push(Part::Logic(op, token.clone()));
                }
                _ => {
                    term_start.get_or_insert(i);
                }
            }
        }

        if let Some(start) = term_start {
            let term = self.create_term(&nodes[start..])?;
            parts.push(Part::Item(ExpressionItem::Term(term)));
        }

        Ok(parts)
    }

    /// Builds one `field condition value` term.
    pub fn create_term(&mut self, nodes: &[Node<'_>]) -> SyntaxResult<ExpressionTerm> {
        let Some(field_node) = nodes.first() else {
            return Err(SyntaxError::new("Incomplete term"));
        };
        if !field_node.is_string() && field_node.kind() != TokenKind::Param {
            return Err(SyntaxError::at(field_node, "Expected field string"));
        }
        let Some(condition_node) = nodes.get(1) else {
            return Err(SyntaxError::at(field_node, "Incomplete term"));
        };
        let Some(condition) = condition_of(condition_node.kind()) else {
            return Err(SyntaxError::at(condition_node, "Expected condition token"));
        };
        let field = field_node.unescaped().to_string();

        let term = match condition {
            Condition::IsNull | Condition::IsNotNull => {
                if let Some(extra) = nodes.get(2) {
                    return Err(SyntaxError::at(extra, "Unexpected token"));
                }
                ExpressionTerm {
                    field,
                    condition,
                    value: None,
                    doc_ref: None,
                }
            }
            _ if nodes.len() < 3 => return Err(SyntaxError::at(field_node, "Incomplete term")),
            Condition::In => self.create_in_term(field, nodes)?,
            _ => {
                let (mut value, mut end) = self.add_value(nodes, 2)?;
                if condition == Condition::Between {
                    let Some(between_and) = nodes.get(end) else {
                        return Err(SyntaxError::at(&nodes[nodes.len() - 1], "Expected between and"));
                    };
                    let (upper, upper_end) = self.add_value(nodes, end + 1)?;
                    if upper.is_empty() && upper_end == end + 1 {
                        return Err(SyntaxError::at(between_and, "Expected value after between and"));
                    }
                    value = format!("{value}, {upper}");
                    end = upper_end;
                }

                if let Some(extra) = nodes.get(end) {
                    return Err(SyntaxError::at(extra, "Unexpected token"));
                }

                ExpressionTerm {
                    field,
                    condition,
                    value: Some(value.trim().to_string()),
                    doc_ref: None,
                }
            }
        };

        if self.in_having {
            self.having_fields.push(field_node.unescaped().to_string());
            if let Some(value_node) = nodes.get(2) {
                if matches!(value_node.kind(), TokenKind::String | TokenKind::Param) {
                    self.having_fields.push(value_node.unescaped().to_string());
                }
            }
        }

        Ok(term)
    }

    fn create_in_term(&mut self, field: String, nodes: &[Node<'_>]) -> SyntaxResult<ExpressionTerm> {
        let value_node = &nodes[2];

        if value_node.kind() == TokenKind::Dictionary {
            let Some(name_node) = nodes.get(3) else {
                return Err(SyntaxError::at(value_node, "Expected dictionary name"));
            };
            if let Some(extra) = nodes.get(4) {
                return Err(SyntaxError::at(extra, "Unexpected token"));
            }
            if !name_node.is_string() {
                return Err(SyntaxError::at(
                    name_node,
                    format!("Expected dictionary name not {} token", name_node.kind()),
                ));
            }
            let name = name_node.unescaped().trim();
            let doc_ref = self
                .doc_resolver
                .resolve_doc_ref(DICTIONARY_TYPE, name)
                .map_err(|e| SyntaxError::at(name_node, e.to_string()))?;
            return Ok(ExpressionTerm {
                field,
                condition: Condition::InDictionary,
                value: None,
                doc_ref: Some(doc_ref),
            });
        }

        let Some(group) = bracket(value_node) else {
            return Err(SyntaxError::at(value_node, "Expected parentheses after IN clause"));
        };
        if let Some(extra) = nodes.get(3) {
            return Err(SyntaxError::at(extra, "Unexpected token"));
        }

        let mut values: Vec<&str> = Vec::new();
        let mut last: Option<&Node<'_>> = None;
        for child in group.children() {
            match child.kind() {
                TokenKind::Comma => match last {
                    None => return Err(SyntaxError::at(child, "Unexpected leading comma")),
                    Some(previous) if previous.kind() == TokenKind::Comma => {
                        return Err(SyntaxError::at(child, "Unexpected comma"))
                    }
                    Some(_) => {}
                },
                TokenKind::SingleQuotedString
                | TokenKind::DoubleQuotedString
                | TokenKind::String
                | TokenKind::Number
                | TokenKind::DateTime => {
                    if last.is_some_and(|previous| previous.kind() != TokenKind::Comma) {
                        return Err(SyntaxError::at(child, "Expected comma delimited"));
                    }
                    values.push(child.unescaped());
                }
                _ => return Err(SyntaxError::at(child, "Unexpected token")),
            }
            last = Some(child);
        }
        if let Some(trailing) = last.filter(|node| node.kind() == TokenKind::Comma) {
            return Err(SyntaxError::at(trailing, "Unexpected trailing comma"));
        }

        Ok(ExpressionTerm {
            field,
            condition: Condition::In,
            value: Some(values.join(", ")),
            doc_ref: None,
        })
    }

    /// Reads a value from `start` up to the next `between ... and` separator. Returns the
    /// value and the index it stopped at.
    fn add_value(&self, nodes: &[Node<'_>], start: usize) -> SyntaxResult<(String, usize)> {
        let end = nodes[start.min(nodes.len())..]
            .iter()
            .position(|node| node.kind() == TokenKind::BetweenAnd)
            .map_or(nodes.len(), |offset| start + offset);
        let value = self.parse_value(&nodes[start.min(end)..end])?;
        Ok((value, end))
    }

    fn parse_value(&self, nodes: &[Node<'_>]) -> SyntaxResult<String> {
        if nodes.is_empty() {
            return Ok(String::new());
        }

        let mut date_expression = false;
        let mut numeric_expression = false;
        let mut text = String::new();

        for node in nodes {
            match node {
                Node::Group(group) if group.function_name().is_some() => {
                    if group
                        .function_name()
                        .is_some_and(|name| name.eq_ignore_ascii_case("param"))
                    {
                        if let Some(extra) = nodes.get(1) {
                            return Err(SyntaxError::at(extra, "Unexpected token"));
                        }
                        return self.resolve_param(group);
                    }
                    if DatePoint::from_function(group.text()).is_none() {
                        return Err(SyntaxError::at(node, "Unexpected function in value"));
                    }
                    date_expression = true;
                }
                _ => match node.kind() {
                    TokenKind::Duration | TokenKind::DateTime => date_expression = true,
                    TokenKind::Number => numeric_expression = true,
                    _ => {}
                },
            }
            text.push_str(node.unescaped());
        }

        if date_expression {
            self.date_parser
                .parse(nodes, self.date_time_settings)
                .map_err(|e| SyntaxError::at(&nodes[0], e.to_string()))?;
        } else if numeric_expression {
            let mut seen_sign = false;
            let mut seen_number = false;
            for node in nodes {
                match node.kind() {
                    TokenKind::Plus | TokenKind::Minus if !seen_sign && !seen_number => seen_sign = true,
                    TokenKind::Number if !seen_number => seen_number = true,
                    _ => return Err(SyntaxError::at(node, "Unexpected token")),
                }
            }
        } else if let Some(extra) = nodes.get(1) {
            return Err(SyntaxError::at(extra, "Unexpected token"));
        }

        Ok(text)
    }

    fn resolve_param(&self, group: &TokenGroup<'_>) -> SyntaxResult<String> {
        let children = group.children();
        let Some(child) = children.first() else {
            return Err(SyntaxError::at(group, "Expected param name"));
        };
        if let Some(extra) = children.get(1) {
            return Err(SyntaxError::at(extra, "Unexpected token"));
        }
        if child.kind() != TokenKind::String {
            return Err(SyntaxError::at(child, "Expected param name"));
        }
        Ok(self
            .request
            .param(child.unescaped())
            .unwrap_or_default()
            .to_string())
    }
}

fn bracket<'n, 'a>(node: &'n Node<'a>) -> Option<&'n TokenGroup<'a>> {
    node.as_group()
        .filter(|group| matches!(group.kind, GroupKind::Bracket { .. }))
}

pub fn condition_of(kind: TokenKind) -> Option<Condition> {
    Some(match kind {
        TokenKind::Equals => Condition::Equals,
        TokenKind::NotEquals => Condition::NotEquals,
        TokenKind::GreaterThan => Condition::GreaterThan,
        TokenKind::GreaterThanOrEqualTo => Condition::GreaterThanOrEqualTo,
        TokenKind::LessThan => Condition::LessThan,
        TokenKind::LessThanOrEqualTo => Condition::LessThanOrEqualTo,
        TokenKind::IsNull => Condition::IsNull,
        TokenKind::IsNotNull => Condition::IsNotNull,
        TokenKind::Between => Condition::Between,
        TokenKind::In => Condition::In,
        _ => return None,
    })
}

fn keyword(op: Op) -> &'static str {
    match op {
        Op::And => "and",
        Op::Or => "or",
        Op::Not => "not",
    }
}

/// Applies `not`, then `and`, then `or` to a sequence of items and operators. Adjacent
/// items without an operator between them are combined with `and`.
pub fn combine(parts: Vec<Part<'_>>) -> SyntaxResult<ExpressionOperator> {
    // not
    let mut negated: Vec<Part<'_>> = Vec::with_capacity(parts.len());
    let mut iter = parts.into_iter();
    while let Some(part) = iter.next() {
        match part {
            Part::Logic(Op::Not, token) => match iter.next() {
                Some(Part::Item(item)) => negated.push(Part::Item(ExpressionItem::Operator(
                    ExpressionOperator::with_children(Op::Not, vec![item]),
                ))),
                Some(Part::Logic(..)) => {
                    return Err(SyntaxError::at(&token, "Expected term after not"))
                }
                None => return Err(SyntaxError::at(&token, "Trailing not")),
            },
            other => negated.push(other),
        }
    }

    // and, split into runs at or
    let mut runs: Vec<Vec<ExpressionItem>> = vec![Vec::new()];
    let mut pending: Option<(Op, Token<'_>)> = None;
    let mut seen_item = false;
    for part in negated {
        match part {
            Part::Item(item) => {
                pending = None;
                seen_item = true;
                if let Some(run) = runs.last_mut() {
                    run.push(item);
                }
            }
            Part::Logic(op, token) => {
                if !seen_item {
                    return Err(SyntaxError::at(
                        &token,
                        format!("Expected term before {}", keyword(op)),
                    ));
                }
                if let Some((previous, _)) = &pending {
                    return Err(SyntaxError::at(
                        &token,
                        format!("Expected term after {}", keyword(*previous)),
                    ));
                }
                if op == Op::Or {
                    runs.push(Vec::new());
                }
                pending = Some((op, token));
            }
        }
    }
    if let Some((op, token)) = pending {
        return Err(SyntaxError::at(&token, format!("Trailing {}", keyword(op))));
    }

    // or
    let mut runs = runs
        .into_iter()
        .map(|run| ExpressionOperator::new(Op::And).merge(Op::And, run));
    let first = runs.next().unwrap_or_default();
    let combined = runs.fold(first, |acc, run| {
        acc.merge(Op::Or, vec![ExpressionItem::Operator(run)])
    });
    Ok(combined.simplify())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DocRef, Param};
    use crate::config::DocCatalog;
    use crate::expression::BasicDateExpressionParser;
    use crate::lexer::Tokeniser;
    use crate::parser::StructureBuilder;
    use crate::resolver::CatalogResolver;
    use chrono::{TimeZone, Utc};

    fn resolver() -> CatalogResolver {
        CatalogResolver::new(DocCatalog {
            data_sources: vec![],
            documents: vec![
                DocRef::new("Dictionary", "d-1", "Approved Feeds"),
                DocRef::new("Dictionary", "d-2", "Twice"),
                DocRef::new("Dictionary", "d-3", "twice"),
            ],
        })
    }

    fn settings() -> DateTimeSettings {
        DateTimeSettings::with_reference_time(Utc.with_ymd_and_hms(2024, 3, 13, 10, 30, 45).unwrap())
    }

    fn logic(input: &str) -> SyntaxResult<ExpressionOperator> {
        let request = BaseRequest {
            params: vec![Param::new("user", "jbloggs")],
            ..BaseRequest::default()
        };
        logic_with(input, &request)
    }

    fn logic_with(input: &str, request: &BaseRequest) -> SyntaxResult<ExpressionOperator> {
        let tokens = Tokeniser::parse(input);
        let root = StructureBuilder::build(&tokens)?;
        let resolver = resolver();
        let settings = settings();
        let mut parser = TermParser::new(&resolver, &BasicDateExpressionParser, &settings, request);
        parser.process_logic(root.children())
    }

    fn single_term(input: &str) -> ExpressionTerm {
        let expression = logic(input).unwrap();
        match expression.children.as_slice() {
            [ExpressionItem::Term(term)] => term.clone(),
            other => panic!("Expected a single term, got {:?}", other),
        }
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expression = logic("a = 1 and b = 2 or c = 3").unwrap();
        assert_eq!(expression.op, Op::Or);
        assert_eq!(expression.to_string(), "(a = 1 AND b = 2) OR c = 3");

        let expression = logic("a = 1 or b = 2 and c = 3").unwrap();
        assert_eq!(expression.to_string(), "a = 1 OR (b = 2 AND c = 3)");
    }

    #[test]
    fn test_same_operator_is_flat() {
        let expression = logic("a = 1 and b = 2 and c = 3").unwrap();
        assert_eq!(expression.op, Op::And);
        assert_eq!(expression.children.len(), 3);
    }

    #[test]
    fn test_not_and_brackets() {
        let expression = logic("not (a = 1 or b = 2) and c = 3").unwrap();
        assert_eq!(expression.to_string(), "NOT (a = 1 OR b = 2) AND c = 3");

        let expression = logic("not a = 1").unwrap();
        assert_eq!(expression.op, Op::Not);
    }

    #[test]
    fn test_operator_errors() {
        assert_eq!(logic("and a = 1").unwrap_err().message(), "Expected term before and");
        assert_eq!(logic("a = 1 or").unwrap_err().message(), "Trailing or");
        assert_eq!(logic("a = 1 and or b = 2").unwrap_err().message(), "Expected term after and");
        assert_eq!(logic("a = 1 and not").unwrap_err().message(), "Trailing not");
    }

    #[test]
    fn test_between() {
        let term = single_term("n between 1 and 10");
        assert_eq!(term.condition, Condition::Between);
        assert_eq!(term.value.as_deref(), Some("1, 10"));

        let err = logic("n between 1").unwrap_err();
        assert_eq!(err.message(), "Expected between and");
    }

    #[test]
    fn test_between_followed_by_and() {
        let expression = logic("n between 1 and 10 and x = y").unwrap();
        assert_eq!(expression.to_string(), "n between 1, 10 AND x = y");
    }

    #[test]
    fn test_in_list() {
        let term = single_term("feed in ('A','B', 3)");
        assert_eq!(term.condition, Condition::In);
        assert_eq!(term.value.as_deref(), Some("A, B, 3"));
    }

    #[test]
    fn test_in_list_errors() {
        assert_eq!(logic("f in (,'A')").unwrap_err().message(), "Unexpected leading comma");
        assert_eq!(logic("f in ('A',,'B')").unwrap_err().message(), "Unexpected comma");
        assert_eq!(logic("f in ('A',)").unwrap_err().message(), "Unexpected trailing comma");
        assert_eq!(logic("f in ('A' 'B')").unwrap_err().message(), "Expected comma delimited");
        assert_eq!(
            logic("f in 'A'").unwrap_err().message(),
            "Expected parentheses after IN clause"
        );
    }

    #[test]
    fn test_in_dictionary() {
        let term = single_term("feed in dictionary \"Approved Feeds\"");
        assert_eq!(term.condition, Condition::InDictionary);
        assert_eq!(term.doc_ref, Some(DocRef::new("Dictionary", "d-1", "Approved Feeds")));
        assert_eq!(term.value, None);
    }

    #[test]
    fn test_in_dictionary_must_resolve_once() {
        let err = logic("feed in dictionary Missing").unwrap_err();
        assert_eq!(err.message(), "Dictionary \"Missing\" not found");
        assert_eq!(err.text(), Some("Missing"));

        let err = logic("feed in dictionary twice").unwrap_err();
        assert_eq!(
            err.message(),
            "Multiple Dictionary documents found with name \"twice\""
        );
    }

    #[test]
    fn test_null_terms() {
        let term = single_term("a is null");
        assert_eq!(term.condition, Condition::IsNull);
        assert_eq!(term.value, None);

        let term = single_term("a is not null");
        assert_eq!(term.condition, Condition::IsNotNull);
    }

    #[test]
    fn test_value_forms() {
        assert_eq!(single_term("a = 'x y'").value.as_deref(), Some("x y"));
        assert_eq!(single_term("a > - 5").value.as_deref(), Some("-5"));
        assert_eq!(single_term("t > now() - 1d").value.as_deref(), Some("now()-1d"));
        assert_eq!(single_term("u = param(user)").value.as_deref(), Some("jbloggs"));
    }

    #[test]
    fn test_value_errors() {
        assert_eq!(logic("a = b c").unwrap_err().message(), "Unexpected token");
        assert_eq!(logic("a = 1 2").unwrap_err().message(), "Unexpected token");
        assert_eq!(
            logic("a = upper(b)").unwrap_err().message(),
            "Unexpected function in value"
        );
        assert_eq!(logic("a =").unwrap_err().message(), "Incomplete term");
        assert_eq!(logic("a b c").unwrap_err().message(), "Expected condition token");
        assert_eq!(
            logic("t > now() +").unwrap_err().message(),
            "Expected duration"
        );
    }

    #[test]
    fn test_having_fields_recorded() {
        let tokens = Tokeniser::parse("total > 5 and max >= limit_field");
        let root = StructureBuilder::build(&tokens).unwrap();
        let resolver = resolver();
        let settings = settings();
        let request = BaseRequest::default();
        let mut parser = TermParser::new(&resolver, &BasicDateExpressionParser, &settings, &request);
        parser.set_in_having(true);
        parser.process_logic(root.children()).unwrap();
        assert_eq!(parser.having_fields(), &["total", "max", "limit_field"]);
    }
}
