//! Builds a [`SearchRequest`] from query text.
//!
//! The root group of a query is a sequence of clause groups, either keyword groups
//! (`where a = 1`) or pipe groups (`| where a = 1`). Each clause is checked against the
//! clauses already consumed and then folded into the query or the table settings:
//!
//! ```text
//! from      -> Query.data_source
//! where     -> Query.expression
//! eval      -> named expressions, substituted into select
//! window    -> TableSettings.window
//! filter    -> TableSettings.value_filter
//! sort      -> Column.sort (by field name)
//! group     -> Column.group (by field name, one depth per group clause)
//! having    -> TableSettings.aggregate_filter
//! select    -> TableSettings.columns
//! limit     -> TableSettings.max_results
//! show      -> a second table for the visualisation
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::ast::{
    BaseRequest, Column, DocRef, ExpressionItem, ExpressionOperator, HoppingWindow, Op, Query, ResultRequest,
    ResultStyle, SearchRequest, Sort, SortDirection, TableSettings,
};
use crate::clause::{check_order, Clause};
use crate::error::{SyntaxError, SyntaxResult};
use crate::expression::{
    BasicDateExpressionParser, DateExpressionParser, EvalMap, Expression, ExpressionContext, ExpressionParser,
    FieldIndex, FunctionExpressionParser,
};
use crate::lexer::Tokeniser;
use crate::parser::StructureBuilder;
use crate::resolver::{wildcard_filter, DocResolver, QueryFieldProvider};
use crate::terms::{combine, Part, TermParser};
use crate::token::{GroupKind, Located, Node, PipeOperation, Span, Token, TokenGroup, TokenKind};
use crate::vis::{BasicVisualisationConsumer, VisualisationTokenConsumer};

pub const TABLE_COMPONENT_ID: &str = "table";
pub const VIS_COMPONENT_ID: &str = "vis";

/// Hidden columns added when a query has no grouping, so every row can be traced back
/// to its source event.
const FALLBACK_COLUMNS: [(&str, &str); 2] = [("__stream_id__", "StreamId"), ("__event_id__", "EventId")];

pub struct SearchRequestFactory {
    doc_resolver: Arc<dyn DocResolver>,
    field_provider: Arc<dyn QueryFieldProvider>,
    expression_parser: Arc<dyn ExpressionParser>,
    date_parser: Arc<dyn DateExpressionParser>,
    vis_consumer: Arc<dyn VisualisationTokenConsumer>,
}

impl SearchRequestFactory {
    /// A factory that resolves names and lists fields through `resolver` and uses the
    /// built-in expression, date and visualisation parsers.
    pub fn new<R>(resolver: Arc<R>) -> Self
    where
        R: DocResolver + QueryFieldProvider + 'static,
    {
        Self {
            doc_resolver: resolver.clone(),
            field_provider: resolver,
            expression_parser: Arc::new(FunctionExpressionParser),
            date_parser: Arc::new(BasicDateExpressionParser),
            vis_consumer: Arc::new(BasicVisualisationConsumer),
        }
    }

    pub fn with_field_provider(mut self, field_provider: Arc<dyn QueryFieldProvider>) -> Self {
        self.field_provider = field_provider;
        self
    }

    pub fn with_expression_parser(mut self, expression_parser: Arc<dyn ExpressionParser>) -> Self {
        self.expression_parser = expression_parser;
        self
    }

    pub fn with_date_expression_parser(mut self, date_parser: Arc<dyn DateExpressionParser>) -> Self {
        self.date_parser = date_parser;
        self
    }

    pub fn with_visualisation_consumer(mut self, vis_consumer: Arc<dyn VisualisationTokenConsumer>) -> Self {
        self.vis_consumer = vis_consumer;
        self
    }

    /// Compiles `text` into a search request. Parameters, time range and key are copied
    /// from `request`.
    pub fn create(
        &self,
        text: &str,
        request: &BaseRequest,
        context: &ExpressionContext,
    ) -> SyntaxResult<SearchRequest> {
        let result = Builder::new(self, request, context).create(text);
        match &result {
            Ok(_) => debug!(query = text, "Created search request"),
            Err(e) => debug!(query = text, error = %e, "Error creating search request"),
        }
        result
    }

    /// Resolves only the data source of a possibly incomplete query, e.g. while the
    /// user is still typing. Anything after the data source name is ignored.
    pub fn extract_data_source_only(&self, text: &str) -> SyntaxResult<DocRef> {
        let tokens = Tokeniser::parse(text);
        if tokens.is_empty() {
            return Err(SyntaxError::new("No tokens"));
        }
        let root = StructureBuilder::build(&tokens)?;
        let Some(first) = root.children().first() else {
            return Err(SyntaxError::new("No tokens"));
        };
        let Some(group) = first.as_group().filter(|g| g.token_kind() == TokenKind::From) else {
            return Err(SyntaxError::at(first, "Expected from"));
        };
        self.add_data_source(group, true)
    }

    fn add_data_source(&self, group: &TokenGroup<'_>, lenient: bool) -> SyntaxResult<DocRef> {
        let children = group.children();
        let Some(token) = children.first() else {
            return Err(SyntaxError::at(group, "Expected data source value"));
        };
        if children.len() > 1 && !lenient {
            let found: Vec<String> = children
                .iter()
                .map(|child| format!("{}:[{}]", child.kind(), child.text()))
                .collect();
            return Err(SyntaxError::at(
                &children[1],
                format!("Unexpected data source child tokens: {}", found.join(", ")),
            ));
        }
        if !token.is_string() {
            return Err(SyntaxError::at(token, "Expected a token of type string"));
        }

        self.doc_resolver
            .resolve_data_source_ref(token.unescaped())
            .map_err(|e| SyntaxError::at(token, e.to_string()))
    }
}

/// State for building a single request.
struct Builder<'f> {
    factory: &'f SearchRequestFactory,
    request: &'f BaseRequest,
    context: &'f ExpressionContext,
    field_index: FieldIndex,
    evals: EvalMap,
    consumed: Vec<Clause>,
    data_source: Option<DocRef>,
    expression: Option<ExpressionOperator>,
    table: TableSettings,
    vis_table: Option<TableSettings>,
    sorts: HashMap<String, Sort>,
    groups: HashMap<String, u32>,
    group_depth: u32,
    added_fields: HashSet<String>,
    having_fields: Vec<HavingField>,
}

impl<'f> Builder<'f> {
    fn new(factory: &'f SearchRequestFactory, request: &'f BaseRequest, context: &'f ExpressionContext) -> Self {
        Self {
            factory,
            request,
            context,
            field_index: FieldIndex::new(),
            evals: EvalMap::new(),
            consumed: Vec::new(),
            data_source: None,
            expression: None,
            table: TableSettings::default(),
            vis_table: None,
            sorts: HashMap::new(),
            groups: HashMap::new(),
            group_depth: 0,
            added_fields: HashSet::new(),
            having_fields: Vec::new(),
        }
    }

    fn create(mut self, text: &str) -> SyntaxResult<SearchRequest> {
        let tokens = Tokeniser::parse(text);
        if tokens.is_empty() {
            return Err(SyntaxError::new("No tokens"));
        }
        let root = StructureBuilder::build(&tokens)?;
        let children = root.children();

        let mut index = 0;
        while let Some(node) = children.get(index) {
            index += 1;
            let (group, clause, clause_token) = clause_of(node)?;
            check_order(clause_token, clause, &self.consumed)?;

            match clause {
                Clause::From => self.data_source = Some(self.factory.add_data_source(group, false)?),
                Clause::Where | Clause::Filter | Clause::Having => {
                    let extensions: Vec<(PipeOperation, &TokenGroup<'_>)> = children[index..]
                        .iter()
                        .map_while(logical_extension)
                        .collect();
                    index += extensions.len();
                    let expression = self.add_expression(clause, group, &extensions)?;
                    match clause {
                        Clause::Where => self.expression = Some(expression),
                        Clause::Filter => self.table.value_filter = Some(expression),
                        _ => self.table.aggregate_filter = Some(expression),
                    }
                }
                Clause::Eval => self.process_eval(group)?,
                Clause::Window => self.process_window(group)?,
                Clause::Sort => self.process_sort(group)?,
                Clause::Group => {
                    self.process_group(group)?;
                    self.group_depth += 1;
                }
                Clause::Select => self.process_select(group)?,
                Clause::Limit => self.process_limit(group)?,
                Clause::Show => {
                    self.vis_table = Some(self.factory.vis_consumer.process_vis(group, &self.table)?);
                }
            }
            self.consumed.push(clause);
        }

        let Some(data_source) = self.data_source.take() else {
            return Err(SyntaxError::new("No data source has been specified."));
        };

        if self.group_depth == 0 {
            for (id, field) in FALLBACK_COLUMNS {
                if self.added_fields.insert(id.to_string()) {
                    self.table.columns.push(Column {
                        id: id.to_string(),
                        name: id.to_string(),
                        expression: format!("${{{field}}}"),
                        sort: None,
                        group: None,
                        filter: None,
                        visible: false,
                        special: true,
                    });
                }
            }
        }

        for having in std::mem::take(&mut self.having_fields) {
            let field = &having.name;
            if self.added_fields.contains(field) {
                continue;
            }
            let id: String = field
                .chars()
                .map(|c| if c.is_whitespace() { '_' } else { c })
                .collect();
            let column = self.field_column(&having, format!("__{id}__"), field, field, false, true)?;
            self.table.columns.push(column);
        }

        self.table.extract_values = true;
        let mut result_requests = vec![ResultRequest {
            component_id: TABLE_COMPONENT_ID.to_string(),
            mappings: vec![self.table.clone()],
            result_style: ResultStyle::Table,
        }];
        if let Some(vis_table) = self.vis_table.take() {
            result_requests.push(ResultRequest {
                component_id: VIS_COMPONENT_ID.to_string(),
                mappings: vec![self.table.clone(), vis_table],
                result_style: ResultStyle::QlVis,
            });
        }

        Ok(SearchRequest {
            key: self.request.key.clone(),
            query: Query {
                data_source,
                expression: self.expression.take().unwrap_or_default(),
                params: self.request.params.clone(),
                time_range: self.request.time_range.clone(),
            },
            result_requests,
        })
    }

    /// Builds the expression of a `where`, `filter` or `having` clause, joined with any
    /// `| and`, `| or` and `| not` pipes that directly follow it.
    fn add_expression(
        &mut self,
        clause: Clause,
        group: &TokenGroup<'_>,
        extensions: &[(PipeOperation, &TokenGroup<'_>)],
    ) -> SyntaxResult<ExpressionOperator> {
        let mut terms = TermParser::new(
            &*self.factory.doc_resolver,
            &*self.factory.date_parser,
            &self.context.date_time_settings,
            self.request,
        );
        terms.set_in_having(clause == Clause::Having);

        let mut parts = vec![Part::Item(ExpressionItem::Operator(terms.process_logic(group.children())?))];
        for (operation, extension) in extensions {
            let body = terms.process_logic(extension.children())?;
            if body.is_empty() {
                return Err(SyntaxError::at(
                    *extension,
                    format!("Expected expression after {}", operation.name()),
                ));
            }
            let Some(command) = extension.clause_token().cloned() else {
                return Err(SyntaxError::at(*extension, "Expected pipe group"));
            };
            match operation {
                PipeOperation::Or => parts.push(Part::Logic(Op::Or, command)),
                PipeOperation::Not => {
                    parts.push(Part::Logic(Op::And, command.clone()));
                    parts.push(Part::Logic(Op::Not, command));
                }
                _ => parts.push(Part::Logic(Op::And, command)),
            }
            parts.push(Part::Item(ExpressionItem::Operator(body)));
        }

        let expression = combine(parts)?;
        self.having_fields
            .extend(terms.having_fields().iter().map(|name| HavingField::new(name, group)));
        Ok(expression)
    }

    fn process_eval(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        let children = group.children();
        let Some(variable) = children.first() else {
            return Err(SyntaxError::at(group, "Expected variable name following eval"));
        };
        if !variable.is_string() {
            return Err(SyntaxError::at(variable, "Expected variable name"));
        }
        let Some(equals) = children.get(1) else {
            return Err(SyntaxError::at(variable, "Expected equals"));
        };
        if equals.kind() != TokenKind::Equals {
            return Err(SyntaxError::at(equals, "Expected equals"));
        }
        if children.len() <= 2 {
            return Err(SyntaxError::at(equals, "Expected eval expression"));
        }

        let expression = self
            .factory
            .expression_parser
            .parse(self.context, &mut self.field_index, &self.evals, &children[2..])
            .map_err(|e| SyntaxError::at(group, e.to_string()))?;
        self.evals.insert(variable.unescaped().to_string(), expression);
        Ok(())
    }

    fn process_window(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        let mut children: Vec<&Node<'_>> = group.children().iter().collect();

        let Some(field) = children.first().copied() else {
            return Err(SyntaxError::at(group, "Expected field"));
        };
        if !field.is_string() {
            return Err(SyntaxError::at(field, "Syntax exception"));
        }
        children.remove(0);

        let Some(by) = children.iter().position(|node| node.kind() == TokenKind::By) else {
            return Err(SyntaxError::at(group, "Syntax exception, expected by"));
        };
        let window_size = take_duration(&mut children, by, "window")?;
        let advance_size = match position_of_word(&children, "advance") {
            Some(advance) => take_duration(&mut children, advance, "advance")?,
            None => window_size.clone(),
        };
        let function = match position_of_word(&children, "using") {
            Some(using) => {
                let Some(function) = children.get(using + 1) else {
                    return Err(SyntaxError::at(children[using], "Syntax exception, expected using function"));
                };
                let function = function.unescaped().to_string();
                children.drain(using..=using + 1);
                Some(function)
            }
            None => None,
        };
        if let Some(extra) = children.first() {
            return Err(SyntaxError::at(*extra, "Unexpected token"));
        }

        self.table.window = Some(HoppingWindow {
            time_field: field.unescaped().to_string(),
            window_size,
            advance_size,
            function,
        });
        Ok(())
    }

    fn process_sort(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        let mut field: Option<String> = None;
        let mut direction: Option<SortDirection> = None;

        for (i, node) in group.children().iter().enumerate() {
            if i == 0 && node.kind() == TokenKind::By {
                continue;
            }
            if node.is_string() {
                if field.is_none() {
                    field = Some(node.unescaped().to_string());
                } else if direction.is_none() {
                    direction = Some(SortDirection::parse(node.unescaped()).ok_or_else(|| {
                        SyntaxError::at(node, "Syntax exception, expected sort direction 'asc' or 'desc'")
                    })?);
                } else {
                    return Err(SyntaxError::at(node, "Syntax exception, expected comma"));
                }
            } else if node.kind() == TokenKind::Comma {
                let Some(name) = field.take() else {
                    return Err(SyntaxError::at(node, "Syntax exception, expected field name"));
                };
                self.add_sort(name, direction.take());
            } else {
                return Err(SyntaxError::at(node, "Syntax exception, expected string"));
            }
        }
        if let Some(name) = field {
            self.add_sort(name, direction);
        }
        Ok(())
    }

    fn add_sort(&mut self, field: String, direction: Option<SortDirection>) {
        let sort = Sort {
            order: self.sorts.len() as u32,
            direction: direction.unwrap_or(SortDirection::Ascending),
        };
        self.sorts.insert(field, sort);
    }

    fn process_group(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        let mut field: Option<String> = None;

        for (i, node) in group.children().iter().enumerate() {
            if i == 0 && node.kind() == TokenKind::By {
                continue;
            }
            if node.is_string() {
                if field.is_some() {
                    return Err(SyntaxError::at(node, "Syntax exception, expected comma"));
                }
                field = Some(node.unescaped().to_string());
            } else if node.kind() == TokenKind::Comma {
                let Some(name) = field.take() else {
                    return Err(SyntaxError::at(node, "Syntax exception, expected field name"));
                };
                self.groups.insert(name, self.group_depth);
            } else {
                return Err(SyntaxError::at(node, "Syntax exception, expected field name"));
            }
        }
        if let Some(name) = field {
            self.groups.insert(name, self.group_depth);
        }
        Ok(())
    }

    fn process_select(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        let mut pending = Selection::default();
        let mut counts: HashMap<String, u32> = HashMap::new();

        for node in group.children() {
            match node.kind() {
                TokenKind::FunctionGroup => {
                    if pending.field.is_some() || pending.expression.is_some() {
                        return Err(SyntaxError::at(node, "Unexpected expression"));
                    }
                    let expression = self
                        .factory
                        .expression_parser
                        .parse(
                            self.context,
                            &mut self.field_index,
                            &self.evals,
                            std::slice::from_ref(node),
                        )
                        .map_err(|e| SyntaxError::at(group, e.to_string()))?;
                    pending.name = Some(node.text().to_string());
                    pending.expression = Some(expression);
                }
                kind if kind.is_string() || kind == TokenKind::Multiplication || kind == TokenKind::Param => {
                    if pending.after_as {
                        if pending.done_as {
                            return Err(SyntaxError::at(node, "Syntax exception, unexpected column name"));
                        }
                        pending.name = Some(node.unescaped().to_string());
                        pending.done_as = true;
                    } else if pending.field.is_none() {
                        if pending.expression.is_some() {
                            return Err(SyntaxError::at(node, "Unexpected field"));
                        }
                        pending.field = Some(node);
                        pending.name = Some(node.unescaped().to_string());
                    } else {
                        return Err(SyntaxError::at(node, "Syntax exception, expected AS"));
                    }
                }
                TokenKind::As => {
                    if pending.field.is_none() && pending.expression.is_none() {
                        return Err(SyntaxError::at(
                            node,
                            "Syntax exception, expected field name or expression",
                        ));
                    }
                    if pending.after_as {
                        return Err(SyntaxError::at(node, "Unexpected AS"));
                    }
                    pending.after_as = true;
                }
                TokenKind::Comma => {
                    let selection = std::mem::take(&mut pending);
                    self.add_selection(node, selection, &mut counts)?;
                }
                _ => return Err(SyntaxError::at(node, "Unexpected token")),
            }
        }

        if pending.field.is_some() || pending.expression.is_some() {
            self.add_selection(group, pending, &mut counts)?;
        }
        Ok(())
    }

    fn add_selection(
        &mut self,
        at: &impl Located,
        selection: Selection<'_, '_>,
        counts: &mut HashMap<String, u32>,
    ) -> SyntaxResult<()> {
        let name = selection.name.unwrap_or_default();

        if let Some(field) = selection.field {
            let wildcard = name == "*" || (field.kind() == TokenKind::Param && name.contains('*'));
            if wildcard {
                return self.expand_wildcard(field, param_name(field.unescaped()), counts);
            }
            let id = column_id(counts, &name);
            let column = self.field_column(field, id, field.unescaped(), &name, true, false)?;
            self.table.columns.push(column);
            return Ok(());
        }

        let Some(expression) = selection.expression else {
            return Err(SyntaxError::at(at, "Syntax exception, expected field name"));
        };
        let id = column_id(counts, &name);
        self.added_fields.insert(name.clone());
        let column = self.column(id, &name, &expression, &name, true, false);
        self.table.columns.push(column);
        Ok(())
    }

    /// Adds a column for every field of the data source matching a `*`/`?` pattern.
    fn expand_wildcard(
        &mut self,
        at: &Node<'_>,
        pattern: &str,
        counts: &mut HashMap<String, u32>,
    ) -> SyntaxResult<()> {
        let Some(data_source) = self.data_source.clone() else {
            return Ok(());
        };
        let filter = wildcard_filter(pattern);
        let fields = self.factory.field_provider.find_fields(&data_source, filter.as_deref());
        debug!(pattern, matched = fields.len(), "Expanded wildcard selection");
        for field in fields {
            let id = column_id(counts, &field);
            let column = self.field_column(at, id, &field, &field, true, false)?;
            self.table.columns.push(column);
        }
        Ok(())
    }

    /// A column reading `field_name`, or the `eval` expression registered under it.
    /// Expression errors are reported on `at`.
    fn field_column(
        &mut self,
        at: &impl Located,
        id: String,
        field_name: &str,
        column_name: &str,
        visible: bool,
        special: bool,
    ) -> SyntaxResult<Column> {
        self.added_fields.insert(field_name.to_string());

        let expression = match self.evals.get(field_name) {
            Some(expression) => expression.clone(),
            None => {
                let kind = if field_name.starts_with("${") && field_name.ends_with('}') {
                    TokenKind::Param
                } else {
                    TokenKind::String
                };
                let node = Node::Token(Token::new(kind, field_name, Span::new(0, field_name.len())));
                self.factory
                    .expression_parser
                    .parse(
                        self.context,
                        &mut self.field_index,
                        &self.evals,
                        std::slice::from_ref(&node),
                    )
                    .map_err(|e| SyntaxError::at(at, e.to_string()))?
            }
        };

        Ok(self.column(id, column_name, &expression, field_name, visible, special))
    }

    fn column(
        &self,
        id: String,
        name: &str,
        expression: &Expression,
        key: &str,
        visible: bool,
        special: bool,
    ) -> Column {
        Column {
            id,
            name: name.to_string(),
            expression: expression.to_string(),
            sort: self.sorts.get(key).copied(),
            group: self.groups.get(key).copied(),
            filter: None,
            visible,
            special,
        }
    }

    fn process_limit(&mut self, group: &TokenGroup<'_>) -> SyntaxResult<()> {
        for node in group.children() {
            if node.is_string() || node.kind() == TokenKind::Number {
                let limit = node
                    .unescaped()
                    .parse::<u64>()
                    .map_err(|_| SyntaxError::at(node, "Syntax exception, expected number"))?;
                self.table.max_results.push(limit);
            } else if node.kind() != TokenKind::Comma {
                return Err(SyntaxError::at(node, "Syntax exception, expected number"));
            }
        }
        Ok(())
    }
}

/// A field referenced by a `having` clause, positioned on that clause so a hidden column
/// that fails to compile can still be reported against the query text.
struct HavingField {
    name: String,
    span: Span,
    clause: String,
}

impl HavingField {
    fn new(name: &str, clause: &TokenGroup<'_>) -> Self {
        let (span, text) = clause.location();
        Self {
            name: name.to_string(),
            span,
            clause: text.to_string(),
        }
    }
}

impl Located for HavingField {
    fn location(&self) -> (Span, &str) {
        (self.span, &self.clause)
    }
}

/// A select list entry being accumulated.
#[derive(Default)]
struct Selection<'n, 'a> {
    field: Option<&'n Node<'a>>,
    expression: Option<Expression>,
    name: Option<String>,
    after_as: bool,
    done_as: bool,
}

/// The clause a root child introduces, and the keyword or command token naming it.
fn clause_of<'n, 'a>(node: &'n Node<'a>) -> SyntaxResult<(&'n TokenGroup<'a>, Clause, &'n Token<'a>)> {
    let Some(group) = node.as_group() else {
        return Err(SyntaxError::at(node, "Unexpected token"));
    };
    match &group.kind {
        GroupKind::Keyword { keyword } => Clause::from_token_kind(keyword.kind)
            .map(|clause| (group, clause, keyword))
            .ok_or_else(|| SyntaxError::at(node, "Unexpected token")),
        GroupKind::Pipe { command, .. } => {
            let operation = group.pipe_operation()?;
            Clause::from_pipe(operation)
                .map(|clause| (group, clause, command))
                .ok_or_else(|| {
                    SyntaxError::at(
                        command,
                        format!("Unexpected {} outside where, filter or having", operation.name()),
                    )
                })
        }
        _ => Err(SyntaxError::at(node, "Unexpected token")),
    }
}

/// An `| and`, `| or` or `| not` pipe group.
fn logical_extension<'n, 'a>(node: &'n Node<'a>) -> Option<(PipeOperation, &'n TokenGroup<'a>)> {
    let group = node.as_group()?;
    if !matches!(group.kind, GroupKind::Pipe { .. }) {
        return None;
    }
    match group.pipe_operation().ok()? {
        operation @ (PipeOperation::And | PipeOperation::Or | PipeOperation::Not) => Some((operation, group)),
        _ => None,
    }
}

fn position_of_word(nodes: &[&Node<'_>], word: &str) -> Option<usize> {
    nodes
        .iter()
        .position(|node| node.is_string() && node.unescaped().eq_ignore_ascii_case(word))
}

/// Removes `nodes[at]` and the duration that follows it, returning the duration.
fn take_duration(nodes: &mut Vec<&Node<'_>>, at: usize, what: &str) -> SyntaxResult<String> {
    let Some(duration) = nodes.get(at + 1) else {
        return Err(SyntaxError::at(
            nodes[at],
            format!("Syntax exception, expected {what} duration"),
        ));
    };
    if duration.kind() != TokenKind::Duration {
        return Err(SyntaxError::at(
            *duration,
            format!("Syntax exception, expected valid {what} duration"),
        ));
    }
    let duration = duration.unescaped().to_string();
    nodes.drain(at..=at + 1);
    Ok(duration)
}

fn param_name(text: &str) -> &str {
    text.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(text)
}

/// Lower-cased name with runs of anything but `[a-z0-9]` replaced by `_`, suffixed with
/// a per-name counter.
fn column_id(counts: &mut HashMap<String, u32>, name: &str) -> String {
    let mut clean = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            clean.push(c);
        } else if !clean.ends_with('_') {
            clean.push('_');
        }
    }
    let count = counts.entry(clean.clone()).or_insert(0);
    *count += 1;
    format!("{clean}-{count}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Condition, ExpressionTerm, Param};
    use crate::config::{DataSourceConfig, DocCatalog};
    use crate::expression::DateTimeSettings;
    use crate::resolver::CatalogResolver;
    use chrono::{TimeZone, Utc};

    fn factory() -> SearchRequestFactory {
        let catalog = DocCatalog {
            data_sources: vec![
                DataSourceConfig {
                    doc_type: "View".to_string(),
                    uuid: "v-1".to_string(),
                    name: "MyView".to_string(),
                    fields: vec![
                        "EventTime".to_string(),
                        "UserId".to_string(),
                        "UserName".to_string(),
                    ],
                },
                DataSourceConfig {
                    doc_type: "View".to_string(),
                    uuid: "v-2".to_string(),
                    name: "Twin".to_string(),
                    fields: vec![],
                },
                DataSourceConfig {
                    doc_type: "Index".to_string(),
                    uuid: "i-2".to_string(),
                    name: "twin".to_string(),
                    fields: vec![],
                },
            ],
            documents: vec![crate::ast::DocRef::new("Dictionary", "d-1", "Feeds")],
        };
        SearchRequestFactory::new(Arc::new(CatalogResolver::new(catalog)))
    }

    fn context() -> ExpressionContext {
        ExpressionContext {
            date_time_settings: DateTimeSettings::with_reference_time(
                Utc.with_ymd_and_hms(2024, 3, 13, 10, 30, 45).unwrap(),
            ),
        }
    }

    fn create(text: &str) -> SyntaxResult<SearchRequest> {
        factory().create(text, &BaseRequest::default(), &context())
    }

    fn columns(request: &SearchRequest) -> Vec<(String, String, bool)> {
        request
            .table()
            .unwrap()
            .columns
            .iter()
            .map(|c| (c.id.clone(), c.expression.clone(), c.visible))
            .collect()
    }

    #[test]
    fn test_from_only() {
        let request = create("from MyView").unwrap();
        assert_eq!(request.query.data_source, DocRef::new("View", "v-1", "MyView"));
        assert_eq!(request.query.expression, ExpressionOperator::default());
        assert_eq!(request.result_requests.len(), 1);
        assert_eq!(request.result_requests[0].component_id, TABLE_COMPONENT_ID);
        assert_eq!(
            columns(&request),
            vec![
                ("__stream_id__".to_string(), "${StreamId}".to_string(), false),
                ("__event_id__".to_string(), "${EventId}".to_string(), false),
            ]
        );
        assert!(request.table().unwrap().extract_values);
    }

    #[test]
    fn test_data_source_errors() {
        let err = create("from Missing").unwrap_err();
        assert_eq!(err.message(), "DataSource \"Missing\" not found");
        assert_eq!(err.text(), Some("Missing"));

        let err = create("from twin").unwrap_err();
        assert_eq!(err.message(), "Multiple DataSource documents found with name \"twin\"");

        let err = create("from MyView extra").unwrap_err();
        assert!(err.message().starts_with("Unexpected data source child tokens"));

        assert_eq!(create("from").unwrap_err().message(), "Expected data source value");
        assert_eq!(create("").unwrap_err().message(), "No tokens");
        assert_eq!(
            create("where a = 1").unwrap_err().message(),
            "Required from before where"
        );
    }

    #[test]
    fn test_extract_data_source_only_is_lenient() {
        let doc = factory().extract_data_source_only("from MyView sel").unwrap();
        assert_eq!(doc.uuid, "v-1");

        let err = factory().extract_data_source_only("select a").unwrap_err();
        assert_eq!(err.message(), "Expected from");
    }

    #[test]
    fn test_clause_order() {
        let err = create("from MyView select a limit 10 where b = 1").unwrap_err();
        assert_eq!(err.message(), "Unexpected where after select, limit");
        assert_eq!(err.text(), Some("where"));

        let err = create("from MyView | limit 10 | sort by a").unwrap_err();
        assert_eq!(err.message(), "Unexpected sort after limit");
    }

    #[test]
    fn test_where_precedence() {
        let request = create("from MyView where a = 1 and b = 2 or c = 3").unwrap();
        let expression = request.query.expression;
        assert_eq!(expression.op, Op::Or);
        assert_eq!(expression.to_string(), "(a = 1 AND b = 2) OR c = 3");
    }

    #[test]
    fn test_logical_pipes_extend_expression() {
        let request = create("from MyView | where a = 1 | and b = 2 | or c = 3 | not d = 4").unwrap();
        assert_eq!(
            request.query.expression.to_string(),
            "(a = 1 AND b = 2) OR (c = 3 AND NOT d = 4)"
        );

        let err = create("from MyView | and b = 2").unwrap_err();
        assert_eq!(err.message(), "Unexpected and outside where, filter or having");
    }

    #[test]
    fn test_hyphenated_values_stay_single_terms() {
        let request =
            create("from MyView where host = web-5d and id = 1a2b3c4e-345d-4aaa-8bbb-ccccdddd0000").unwrap();
        assert_eq!(
            request.query.expression.children,
            vec![
                ExpressionItem::Term(ExpressionTerm::new("host", Condition::Equals, "web-5d")),
                ExpressionItem::Term(ExpressionTerm::new(
                    "id",
                    Condition::Equals,
                    "1a2b3c4e-345d-4aaa-8bbb-ccccdddd0000"
                )),
            ]
        );
    }

    #[test]
    fn test_between_and_in_terms() {
        let request = create("from MyView where n between 1 and 10 and f in ('A', 'B')").unwrap();
        assert_eq!(
            request.query.expression.children,
            vec![
                ExpressionItem::Term(ExpressionTerm::new("n", Condition::Between, "1, 10")),
                ExpressionItem::Term(ExpressionTerm::new("f", Condition::In, "A, B")),
            ]
        );
    }

    #[test]
    fn test_in_dictionary() {
        let request = create("from MyView where feed in dictionary Feeds").unwrap();
        let ExpressionItem::Term(term) = &request.query.expression.children[0] else {
            panic!("Expected term");
        };
        assert_eq!(term.condition, Condition::InDictionary);
        assert_eq!(term.doc_ref.as_ref().map(|d| d.uuid.as_str()), Some("d-1"));

        let err = create("from MyView where feed in dictionary Nope").unwrap_err();
        assert_eq!(err.message(), "Dictionary \"Nope\" not found");
    }

    #[test]
    fn test_select_columns() {
        let request = create("from MyView select UserId as 'User', count() as Total, UserId").unwrap();
        let table = request.table().unwrap();
        let visible: Vec<(&str, &str, &str)> = table
            .visible_columns()
            .map(|c| (c.id.as_str(), c.name.as_str(), c.expression.as_str()))
            .collect();
        assert_eq!(
            visible,
            vec![
                ("user-1", "User", "${UserId}"),
                ("total-1", "Total", "count()"),
                ("userid-1", "UserId", "${UserId}"),
            ]
        );
    }

    #[test]
    fn test_select_errors() {
        assert_eq!(
            create("from MyView select a b").unwrap_err().message(),
            "Syntax exception, expected AS"
        );
        assert_eq!(
            create("from MyView select as a").unwrap_err().message(),
            "Syntax exception, expected field name or expression"
        );
        assert_eq!(
            create("from MyView select a as b c").unwrap_err().message(),
            "Syntax exception, unexpected column name"
        );
        assert_eq!(
            create("from MyView select a, , b").unwrap_err().message(),
            "Syntax exception, expected field name"
        );
    }

    #[test]
    fn test_eval_is_substituted() {
        let request = create("from MyView eval total = count() + 1 select total").unwrap();
        let table = request.table().unwrap();
        assert_eq!(table.columns[0].expression, "count() + 1");

        assert_eq!(
            create("from MyView eval total").unwrap_err().message(),
            "Expected equals"
        );
        assert_eq!(
            create("from MyView eval total =").unwrap_err().message(),
            "Expected eval expression"
        );
    }

    #[test]
    fn test_select_star_expands_fields() {
        let request = create("from MyView select *").unwrap();
        let ids: Vec<&str> = request
            .table()
            .unwrap()
            .visible_columns()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["eventtime-1", "userid-1", "username-1"]);

        let request = create("from MyView select ${User*}").unwrap();
        assert_eq!(request.table().unwrap().visible_columns().count(), 2);
    }

    struct RejectingParser;

    impl ExpressionParser for RejectingParser {
        fn parse(
            &self,
            _context: &ExpressionContext,
            _field_index: &mut FieldIndex,
            _evals: &EvalMap,
            _nodes: &[Node<'_>],
        ) -> Result<Expression, crate::error::ExpressionError> {
            Err(crate::error::ExpressionError::new("Rejected"))
        }
    }

    fn create_rejecting(text: &str) -> SyntaxResult<SearchRequest> {
        factory()
            .with_expression_parser(Arc::new(RejectingParser))
            .create(text, &BaseRequest::default(), &context())
    }

    #[test]
    fn test_column_errors_are_positioned_on_the_query() {
        let err = create_rejecting("from MyView select UserName").unwrap_err();
        assert_eq!(err.message(), "Rejected");
        assert_eq!(err.span(), Some(Span::new(19, 27)));
        assert_eq!(err.text(), Some("UserName"));

        let err = create_rejecting("from MyView select \"User Name\" as U").unwrap_err();
        assert_eq!(err.span(), Some(Span::new(19, 30)));

        let err = create_rejecting("from MyView select ${User*}").unwrap_err();
        assert_eq!(err.text(), Some("${User*}"));

        let err = create_rejecting("from MyView group by UserId having total > 5").unwrap_err();
        assert_eq!(err.span().map(|span| span.start), Some(28));
        assert!(err.text().is_some_and(|text| text.starts_with("having")));
    }

    #[test]
    fn test_sort_and_group() {
        let request = create(
            "from MyView group by Feed sort by UserId desc, Feed group by UserId select Feed, UserId, EventTime",
        )
        .unwrap();
        let table = request.table().unwrap();
        let feed = table.column("Feed").unwrap();
        assert_eq!(feed.group, Some(0));
        assert_eq!(
            feed.sort,
            Some(Sort {
                order: 1,
                direction: SortDirection::Ascending
            })
        );
        let user = table.column("UserId").unwrap();
        assert_eq!(user.group, Some(1));
        assert_eq!(
            user.sort,
            Some(Sort {
                order: 0,
                direction: SortDirection::Descending
            })
        );
        assert_eq!(table.column("EventTime").unwrap().group, None);
        // grouped queries get no fallback columns
        assert_eq!(table.columns.len(), 3);

        let err = create("from MyView sort by a sideways").unwrap_err();
        assert_eq!(
            err.message(),
            "Syntax exception, expected sort direction 'asc' or 'desc'"
        );
    }

    #[test]
    fn test_having_injects_hidden_columns() {
        let err = create("from MyView group by UserId select UserId having total > 5").unwrap_err();
        assert_eq!(err.message(), "Unexpected having after select");

        let request =
            create("from MyView eval total = count() group by UserId having total > 5 select UserId").unwrap();
        let table = request.table().unwrap();
        assert_eq!(table.aggregate_filter.as_ref().map(|e| e.to_string()), Some("total > 5".to_string()));
        let hidden: Vec<(&str, &str, bool, bool)> = table
            .columns
            .iter()
            .filter(|c| !c.visible)
            .map(|c| (c.id.as_str(), c.expression.as_str(), c.visible, c.special))
            .collect();
        assert_eq!(hidden, vec![("__total__", "count()", false, true)]);
    }

    #[test]
    fn test_having_field_already_selected_is_not_added() {
        let request = create("from MyView group by UserId having UserId = x select UserId").unwrap();
        let table = request.table().unwrap();
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[1].id, "__x__");
    }

    #[test]
    fn test_window_limit_and_filter() {
        let request = create(
            "from MyView window EventTime by 1h advance 10m using count() filter UserId = jbloggs limit 10, 20",
        )
        .unwrap();
        let table = request.table().unwrap();
        assert_eq!(
            table.window,
            Some(HoppingWindow {
                time_field: "EventTime".to_string(),
                window_size: "1h".to_string(),
                advance_size: "10m".to_string(),
                function: Some("count()".to_string()),
            })
        );
        assert_eq!(table.max_results, vec![10, 20]);
        assert_eq!(
            table.value_filter.as_ref().map(|e| e.to_string()),
            Some("UserId = jbloggs".to_string())
        );

        assert_eq!(
            create("from MyView window EventTime 1h").unwrap_err().message(),
            "Syntax exception, expected by"
        );
        assert_eq!(
            create("from MyView window EventTime by 5").unwrap_err().message(),
            "Syntax exception, expected valid window duration"
        );
        assert_eq!(
            create("from MyView limit ten").unwrap_err().message(),
            "Syntax exception, expected number"
        );
    }

    #[test]
    fn test_show_adds_vis_request() {
        let request = create("from MyView select UserId, count() as Total show Bar(x = UserId, y = Total)").unwrap();
        assert_eq!(request.result_requests.len(), 2);
        let vis = &request.result_requests[1];
        assert_eq!(vis.component_id, VIS_COMPONENT_ID);
        assert_eq!(vis.result_style, ResultStyle::QlVis);
        assert_eq!(vis.mappings.len(), 2);
        let settings = vis.mappings[1].vis_settings.as_ref().unwrap();
        assert_eq!(settings.vis_type, "Bar");
        assert_eq!(settings.params.get("y").map(String::as_str), Some("total-1"));
    }

    struct FixedFields;

    impl QueryFieldProvider for FixedFields {
        fn find_fields(&self, _data_source: &DocRef, _filter: Option<&str>) -> Vec<String> {
            vec!["Only".to_string()]
        }
    }

    struct NoDates;

    impl DateExpressionParser for NoDates {
        fn parse(
            &self,
            _nodes: &[Node<'_>],
            _settings: &DateTimeSettings,
        ) -> Result<chrono::DateTime<Utc>, crate::error::ExpressionError> {
            Err(crate::error::ExpressionError::new("Dates are disabled"))
        }
    }

    struct TypeOnly;

    impl VisualisationTokenConsumer for TypeOnly {
        fn process_vis(&self, group: &TokenGroup<'_>, parent: &TableSettings) -> SyntaxResult<TableSettings> {
            let mut table = parent.clone();
            table.vis_settings = Some(crate::ast::VisSettings {
                vis_type: group.text().trim_start_matches("show").trim().to_string(),
                params: Default::default(),
            });
            Ok(table)
        }
    }

    #[test]
    fn test_collaborators_can_be_replaced() {
        let factory = factory()
            .with_field_provider(Arc::new(FixedFields))
            .with_date_expression_parser(Arc::new(NoDates))
            .with_visualisation_consumer(Arc::new(TypeOnly));

        let request = factory
            .create("from MyView select * show Anything(at all)", &BaseRequest::default(), &context())
            .unwrap();
        let ids: Vec<&str> = request
            .table()
            .unwrap()
            .visible_columns()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["only-1"]);
        let vis = request.result_requests[1].mappings[1].vis_settings.as_ref().unwrap();
        assert_eq!(vis.vis_type, "Anything(at all)");

        let err = factory
            .create("from MyView where EventTime > now()", &BaseRequest::default(), &context())
            .unwrap_err();
        assert_eq!(err.message(), "Dates are disabled");
    }

    #[test]
    fn test_params_and_time_range_are_copied() {
        let request = BaseRequest {
            key: Some("k-1".to_string()),
            params: vec![Param::new("user", "jbloggs")],
            time_range: None,
        };
        let created = factory()
            .create("from MyView where UserId = param(user)", &request, &context())
            .unwrap();
        assert_eq!(created.key.as_deref(), Some("k-1"));
        assert_eq!(created.query.params, request.params);
        assert_eq!(created.query.expression.to_string(), "UserId = jbloggs");
    }

    #[test]
    fn test_column_id() {
        let mut counts = HashMap::new();
        assert_eq!(column_id(&mut counts, "Event Time"), "event_time-1");
        assert_eq!(column_id(&mut counts, "event--time"), "event_time-2");
        assert_eq!(column_id(&mut counts, "count()"), "count_-1");
    }
}
