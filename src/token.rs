//! The token definitions for the query language.
//!
//! Tokens are spans over the query text plus a classification. Groups own an ordered
//! list of child nodes and are produced by the structure builder; the tokeniser only
//! ever produces flat tokens.

use std::borrow::Cow;
use std::fmt;

use crate::error::SyntaxError;

const ESCAPE_CHAR: char = '\\';

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset (exclusive).
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The smallest span covering both spans.
    pub fn join(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// The kind of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Unknown, // not yet classified by a tokeniser pass

    // Structure
    Pipe,          // |
    Command,       // the name following a pipe
    FunctionName,  // name directly followed by (
    OpenBracket,   // (
    CloseBracket,  // )
    PipeGroup,
    TokenGroup,
    FunctionGroup,

    // Literals
    Whitespace,
    Comment,      // // ...
    BlockComment, // /* ... */
    SingleQuotedString,
    DoubleQuotedString,
    String,
    Number,
    Duration,
    DateTime,
    Param, // ${name}

    // Punctuation and arithmetic
    Comma,
    Order,          // ^
    Division,       // /
    Multiplication, // *
    Modulus,        // %
    Plus,           // +
    Minus,          // -

    // Conditions
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    IsNull,
    IsNotNull,
    Between,
    BetweenAnd, // the `and` separating between bounds
    In,

    // Logic
    And,
    Or,
    Not,
    By,
    As,

    // Clause keywords
    From,
    Where,
    Eval,
    Window,
    Filter,
    Sort,
    Group,
    Having,
    Select,
    Limit,
    Show,
    Dictionary,
}

impl TokenKind {
    /// Any of the string literal kinds.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            TokenKind::String | TokenKind::SingleQuotedString | TokenKind::DoubleQuotedString
        )
    }

    pub fn is_quoted(self) -> bool {
        matches!(
            self,
            TokenKind::SingleQuotedString | TokenKind::DoubleQuotedString
        )
    }

    /// Tokens that carry no meaning for the structure of a query.
    pub fn is_ignorable(self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace | TokenKind::Comment | TokenKind::BlockComment
        )
    }

    pub fn is_logic(self) -> bool {
        matches!(self, TokenKind::And | TokenKind::Or | TokenKind::Not)
    }

    /// Keywords that introduce a clause at the top level of a query.
    pub fn is_clause_keyword(self) -> bool {
        matches!(
            self,
            TokenKind::From
                | TokenKind::Where
                | TokenKind::Eval
                | TokenKind::Window
                | TokenKind::Filter
                | TokenKind::Sort
                | TokenKind::Group
                | TokenKind::Having
                | TokenKind::Select
                | TokenKind::Limit
                | TokenKind::Show
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Unknown => "unknown",
            TokenKind::Pipe => "pipe",
            TokenKind::Command => "command",
            TokenKind::FunctionName => "function name",
            TokenKind::OpenBracket => "open bracket",
            TokenKind::CloseBracket => "close bracket",
            TokenKind::PipeGroup => "pipe group",
            TokenKind::TokenGroup => "token group",
            TokenKind::FunctionGroup => "function group",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::BlockComment => "block comment",
            TokenKind::SingleQuotedString => "single quoted string",
            TokenKind::DoubleQuotedString => "double quoted string",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Duration => "duration",
            TokenKind::DateTime => "date time",
            TokenKind::Param => "param",
            TokenKind::Comma => "comma",
            TokenKind::Order => "^",
            TokenKind::Division => "/",
            TokenKind::Multiplication => "*",
            TokenKind::Modulus => "%",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Equals => "=",
            TokenKind::NotEquals => "!=",
            TokenKind::GreaterThan => ">",
            TokenKind::GreaterThanOrEqualTo => ">=",
            TokenKind::LessThan => "<",
            TokenKind::LessThanOrEqualTo => "<=",
            TokenKind::IsNull => "is null",
            TokenKind::IsNotNull => "is not null",
            TokenKind::Between => "between",
            TokenKind::BetweenAnd => "between and",
            TokenKind::In => "in",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::By => "by",
            TokenKind::As => "as",
            TokenKind::From => "from",
            TokenKind::Where => "where",
            TokenKind::Eval => "eval",
            TokenKind::Window => "window",
            TokenKind::Filter => "filter",
            TokenKind::Sort => "sort",
            TokenKind::Group => "group",
            TokenKind::Having => "having",
            TokenKind::Select => "select",
            TokenKind::Limit => "limit",
            TokenKind::Show => "show",
            TokenKind::Dictionary => "dictionary",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Anything that can be pointed at in an error message.
pub trait Located {
    fn location(&self) -> (Span, &str);
}

/// A token is a classified span of the query text.
///
/// Quoted strings cache their unescaped value when the token is created; for every
/// other kind the unescaped value is the source slice itself.
#[derive(Clone)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub span: Span,
    source: &'a str,
    value: Cow<'a, str>,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind, source: &'a str, span: Span) -> Self {
        let slice = &source[span.start..span.end];
        let value = if kind.is_quoted() {
            unescape_quoted(slice)
        } else {
            Cow::Borrowed(slice)
        };
        Self {
            kind,
            span,
            source,
            value,
        }
    }

    /// The exact source text covered by this token.
    pub fn slice(&self) -> &'a str {
        &self.source[self.span.start..self.span.end]
    }

    /// The rendered text of the token. Whitespace renders as nothing.
    pub fn text(&self) -> &'a str {
        if self.kind == TokenKind::Whitespace {
            ""
        } else {
            self.slice()
        }
    }

    /// The text with quotes and escape characters removed.
    pub fn unescaped(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> &'a str {
        self.source
    }
}

impl PartialEq for Token<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.span == other.span && self.slice() == other.slice()
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{}..{}] {:?}",
            self.kind,
            self.span.start,
            self.span.end,
            self.slice()
        )
    }
}

impl Located for Token<'_> {
    fn location(&self) -> (Span, &str) {
        (self.span, self.slice())
    }
}

fn unescape_quoted(raw: &str) -> Cow<'_, str> {
    let mut chars = raw.char_indices();
    let Some((_, quote)) = chars.next() else {
        return Cow::Borrowed(raw);
    };
    let body_start = quote.len_utf8();

    let mut owned: Option<String> = None;
    let mut escape = false;
    for (i, c) in chars {
        if escape {
            escape = false;
            if let Some(out) = owned.as_mut() {
                out.push(c);
            }
        } else if c == ESCAPE_CHAR {
            escape = true;
            owned.get_or_insert_with(|| raw[body_start..i].to_string());
        } else if c == quote {
            return match owned {
                Some(out) => Cow::Owned(out),
                None => Cow::Borrowed(&raw[body_start..i]),
            };
        } else if let Some(out) = owned.as_mut() {
            out.push(c);
        }
    }

    // Unterminated literal.
    match owned {
        Some(out) => Cow::Owned(out),
        None => Cow::Borrowed(&raw[body_start..]),
    }
}

/// Commands that may follow a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeOperation {
    Where,
    Filter,
    And,
    Or,
    Not,
    Eval,
    Table,
    Limit,
    Sort,
    Group,
    Having,
}

impl PipeOperation {
    pub const ALL: [PipeOperation; 11] = [
        PipeOperation::Where,
        PipeOperation::Filter,
        PipeOperation::And,
        PipeOperation::Or,
        PipeOperation::Not,
        PipeOperation::Eval,
        PipeOperation::Table,
        PipeOperation::Limit,
        PipeOperation::Sort,
        PipeOperation::Group,
        PipeOperation::Having,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PipeOperation::Where => "where",
            PipeOperation::Filter => "filter",
            PipeOperation::And => "and",
            PipeOperation::Or => "or",
            PipeOperation::Not => "not",
            PipeOperation::Eval => "eval",
            PipeOperation::Table => "table",
            PipeOperation::Limit => "limit",
            PipeOperation::Sort => "sort",
            PipeOperation::Group => "group",
            PipeOperation::Having => "having",
        }
    }

    /// Case-insensitive lookup of a command name.
    pub fn from_name(name: &str) -> Option<Self> {
        PipeOperation::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }
}

/// What a group was built from. The structural tokens are kept so a group can be
/// flattened back into the token list it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKind<'a> {
    Root,
    Bracket { open: Token<'a>, close: Token<'a> },
    Function { name: Token<'a>, open: Token<'a>, close: Token<'a> },
    Pipe { pipe: Token<'a>, command: Token<'a> },
    Keyword { keyword: Token<'a> },
}

/// A token that owns an ordered list of children.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGroup<'a> {
    pub kind: GroupKind<'a>,
    pub span: Span,
    pub children: Vec<Node<'a>>,
    source: &'a str,
}

impl<'a> TokenGroup<'a> {
    /// The token kind this group presents as. Keyword groups take the kind of their keyword.
    pub fn token_kind(&self) -> TokenKind {
        match &self.kind {
            GroupKind::Root | GroupKind::Bracket { .. } => TokenKind::TokenGroup,
            GroupKind::Function { .. } => TokenKind::FunctionGroup,
            GroupKind::Pipe { .. } => TokenKind::PipeGroup,
            GroupKind::Keyword { keyword } => keyword.kind,
        }
    }

    pub fn text(&self) -> &'a str {
        &self.source[self.span.start..self.span.end]
    }

    pub fn children(&self) -> &[Node<'a>] {
        &self.children
    }

    /// Function name for function groups.
    pub fn function_name(&self) -> Option<&'a str> {
        match &self.kind {
            GroupKind::Function { name, .. } => Some(name.slice()),
            _ => None,
        }
    }

    /// The keyword or command token that introduced a clause group.
    pub fn clause_token(&self) -> Option<&Token<'a>> {
        match &self.kind {
            GroupKind::Pipe { command, .. } => Some(command),
            GroupKind::Keyword { keyword } => Some(keyword),
            _ => None,
        }
    }

    /// Validates the command of a pipe group against the known operations.
    pub fn pipe_operation(&self) -> Result<PipeOperation, SyntaxError> {
        match &self.kind {
            GroupKind::Pipe { command, .. } => PipeOperation::from_name(command.slice())
                .ok_or_else(|| {
                    SyntaxError::at(
                        command,
                        format!("Unknown pipe operation '{}'", command.slice()),
                    )
                }),
            _ => Err(SyntaxError::at(self, "Expected pipe group")),
        }
    }

    /// Re-emits the flat token list this group was built from, minus ignorable tokens.
    pub fn flatten(&self) -> Vec<Token<'a>> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<Token<'a>>) {
        let close = match &self.kind {
            GroupKind::Root => None,
            GroupKind::Bracket { open, close } => {
                out.push(open.clone());
                Some(close)
            }
            GroupKind::Function { name, open, close } => {
                out.push(name.clone());
                out.push(open.clone());
                Some(close)
            }
            GroupKind::Pipe { pipe, command } => {
                out.push(pipe.clone());
                out.push(command.clone());
                None
            }
            GroupKind::Keyword { keyword } => {
                out.push(keyword.clone());
                None
            }
        };
        for child in &self.children {
            match child {
                Node::Token(token) => out.push(token.clone()),
                Node::Group(group) => group.flatten_into(out),
            }
        }
        if let Some(close) = close {
            out.push(close.clone());
        }
    }
}

impl Located for TokenGroup<'_> {
    fn location(&self) -> (Span, &str) {
        (self.span, self.text())
    }
}

/// Accumulates children for a group and widens its span to cover them.
#[derive(Debug)]
pub struct GroupBuilder<'a> {
    kind: GroupKind<'a>,
    span: Span,
    children: Vec<Node<'a>>,
    source: &'a str,
}

impl<'a> GroupBuilder<'a> {
    pub fn new(kind: GroupKind<'a>, source: &'a str, span: Span) -> Self {
        Self {
            kind,
            span,
            children: Vec::new(),
            source,
        }
    }

    pub fn add(&mut self, node: Node<'a>) {
        self.span = self.span.join(node.span());
        self.children.push(node);
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn build(self) -> TokenGroup<'a> {
        TokenGroup {
            kind: self.kind,
            span: self.span,
            children: self.children,
            source: self.source,
        }
    }
}

/// A child of a group: either a plain token or a nested group.
#[derive(Debug, Clone, PartialEq)]
pub enum Node<'a> {
    Token(Token<'a>),
    Group(TokenGroup<'a>),
}

impl<'a> Node<'a> {
    pub fn kind(&self) -> TokenKind {
        match self {
            Node::Token(token) => token.kind,
            Node::Group(group) => group.token_kind(),
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Node::Token(token) => token.span,
            Node::Group(group) => group.span,
        }
    }

    pub fn text(&self) -> &'a str {
        match self {
            Node::Token(token) => token.text(),
            Node::Group(group) => group.text(),
        }
    }

    pub fn unescaped(&self) -> &str {
        match self {
            Node::Token(token) => token.unescaped(),
            Node::Group(group) => group.text(),
        }
    }

    pub fn is_string(&self) -> bool {
        self.kind().is_string()
    }

    pub fn as_group(&self) -> Option<&TokenGroup<'a>> {
        match self {
            Node::Group(group) => Some(group),
            Node::Token(_) => None,
        }
    }

    pub fn as_token(&self) -> Option<&Token<'a>> {
        match self {
            Node::Token(token) => Some(token),
            Node::Group(_) => None,
        }
    }
}

impl Located for Node<'_> {
    fn location(&self) -> (Span, &str) {
        match self {
            Node::Token(token) => token.location(),
            Node::Group(group) => group.location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_text_and_slice() {
        let source = "from  View";
        let ws = Token::new(TokenKind::Whitespace, source, Span::new(4, 6));
        assert_eq!(ws.slice(), "  ");
        assert_eq!(ws.text(), "");

        let word = Token::new(TokenKind::String, source, Span::new(6, 10));
        assert_eq!(word.text(), "View");
        assert_eq!(word.unescaped(), "View");
    }

    #[test]
    fn test_quoted_unescape() {
        let source = r#""Approved \"Feeds\"""#;
        let token = Token::new(
            TokenKind::DoubleQuotedString,
            source,
            Span::new(0, source.len()),
        );
        assert_eq!(token.unescaped(), r#"Approved "Feeds""#);

        let source = "'plain'";
        let token = Token::new(TokenKind::SingleQuotedString, source, Span::new(0, 7));
        assert_eq!(token.unescaped(), "plain");
        assert!(matches!(token.value, Cow::Borrowed(_)));
    }

    #[test]
    fn test_unterminated_quote_keeps_body() {
        let source = "'open";
        let token = Token::new(TokenKind::SingleQuotedString, source, Span::new(0, 5));
        assert_eq!(token.unescaped(), "open");
    }

    #[test]
    fn test_pipe_operation_lookup() {
        assert_eq!(PipeOperation::from_name("WHERE"), Some(PipeOperation::Where));
        assert_eq!(PipeOperation::from_name("table"), Some(PipeOperation::Table));
        assert_eq!(PipeOperation::from_name("select"), None);
    }

    #[test]
    fn test_group_builder_spans_children() {
        let source = "(a b)";
        let open = Token::new(TokenKind::OpenBracket, source, Span::new(0, 1));
        let close = Token::new(TokenKind::CloseBracket, source, Span::new(4, 5));
        let mut builder = GroupBuilder::new(
            GroupKind::Bracket {
                open: open.clone(),
                close: close.clone(),
            },
            source,
            Span::new(0, 5),
        );
        builder.add(Node::Token(Token::new(
            TokenKind::String,
            source,
            Span::new(1, 2),
        )));
        builder.add(Node::Token(Token::new(
            TokenKind::String,
            source,
            Span::new(3, 4),
        )));
        let group = builder.build();

        assert_eq!(group.token_kind(), TokenKind::TokenGroup);
        assert_eq!(group.text(), "(a b)");
        let flat: Vec<_> = group.flatten().iter().map(|t| t.kind).collect();
        assert_eq!(
            flat,
            vec![
                TokenKind::OpenBracket,
                TokenKind::String,
                TokenKind::String,
                TokenKind::CloseBracket
            ]
        );
    }
}
