//! 结构构建器：把扁平的 token 列表组装成分组树
//!
//! ## 结构
//!
//! ```text
//! build()
//!   ├─ 去掉空白和注释
//!   └─ parse_sequence(root)
//!        ├─ 子句关键字 (仅根层)  → 关键字分组, 收集后续 token
//!        ├─ "|" 命令             → 管道分组, 收集后续 token
//!        ├─ name "("             → 函数分组 (递归直到 ")")
//!        ├─ "("                  → 括号分组 (递归直到 ")")
//!        ├─ ")"                  → 结束当前递归层
//!        └─ 其他                 → 当前分组的叶子
//! ```
//!
//! 关键字分组和管道分组一直延续到同层的下一个关键字或管道, 或者外层分组结束。
//! 出错时不做恢复：括号不匹配、管道后没有命令、函数名后没有 `(` 都会让整个构建失败。

use tracing::trace;

use crate::error::{SyntaxError, SyntaxResult};
use crate::token::{GroupBuilder, GroupKind, Node, Span, Token, TokenGroup, TokenKind};

pub struct StructureBuilder<'a> {
    tokens: Vec<Token<'a>>,
    position: usize,
    source: &'a str,
}

impl<'a> StructureBuilder<'a> {
    /// 为分词后的查询构建根分组
    pub fn build(tokens: &[Token<'a>]) -> SyntaxResult<TokenGroup<'a>> {
        let source = tokens.first().map_or("", |t| t.source());
        let tokens: Vec<Token<'a>> = tokens
            .iter()
            .filter(|t| !t.kind.is_ignorable())
            .cloned()
            .collect();
        let span = match (tokens.first(), tokens.last()) {
            (Some(first), Some(last)) => first.span.join(last.span),
            _ => Span::default(),
        };

        let mut builder = StructureBuilder {
            tokens,
            position: 0,
            source,
        };
        let (children, _) = builder.parse_sequence(true, None)?;

        let mut root = GroupBuilder::new(GroupKind::Root, source, span);
        for child in children {
            root.add(child);
        }
        let root = root.build();
        trace!(?root, "built query structure");
        Ok(root)
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<Token<'a>> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// 消费一个指定类型的 token，否则在 `after` 上报告 `message`
    fn expect(&mut self, expected: TokenKind, after: &Token<'a>, message: &str) -> SyntaxResult<Token<'a>> {
        if self.peek().is_some_and(|token| token.kind == expected) {
            if let Some(token) = self.advance() {
                return Ok(token);
            }
        }
        Err(SyntaxError::at(after, message))
    }

    /// 解析子节点，直到输入结束 (根层) 或与 `open` 匹配的右括号
    fn parse_sequence(
        &mut self,
        root: bool,
        open: Option<&Token<'a>>,
    ) -> SyntaxResult<(Vec<Node<'a>>, Option<Token<'a>>)> {
        let mut out: Vec<Node<'a>> = Vec::new();
        let mut current: Option<GroupBuilder<'a>> = None;

        loop {
            let Some(token) = self.advance() else {
                if let Some(open) = open {
                    return Err(SyntaxError::at(open, "No matching close bracket"));
                }
                break;
            };

            match token.kind {
                TokenKind::CloseBracket => {
                    if open.is_none() {
                        return Err(SyntaxError::at(&token, "Close bracket without open"));
                    }
                    flush(&mut current, &mut out);
                    return Ok((out, Some(token)));
                }
                TokenKind::Pipe => {
                    let command = self.expect(TokenKind::Command, &token, "Expected command after pipe")?;
                    flush(&mut current, &mut out);
                    let span = token.span.join(command.span);
                    current = Some(GroupBuilder::new(
                        GroupKind::Pipe {
                            pipe: token,
                            command,
                        },
                        self.source,
                        span,
                    ));
                }
                kind if root && kind.is_clause_keyword() => {
                    flush(&mut current, &mut out);
                    let span = token.span;
                    current = Some(GroupBuilder::new(
                        GroupKind::Keyword { keyword: token },
                        self.source,
                        span,
                    ));
                }
                TokenKind::FunctionName => {
                    let bracket = self.expect(
                        TokenKind::OpenBracket,
                        &token,
                        "Expected open bracket after function name",
                    )?;
                    let (children, close) = self.parse_sequence(false, Some(&bracket))?;
                    let close = close.ok_or_else(|| SyntaxError::at(&bracket, "No matching close bracket"))?;
                    let span = token.span.join(close.span);
                    let group = group_of(
                        GroupKind::Function {
                            name: token,
                            open: bracket,
                            close,
                        },
                        self.source,
                        span,
                        children,
                    );
                    append(&mut current, &mut out, Node::Group(group));
                }
                TokenKind::OpenBracket => {
                    let (children, close) = self.parse_sequence(false, Some(&token))?;
                    let close = close.ok_or_else(|| SyntaxError::at(&token, "No matching close bracket"))?;
                    let span = token.span.join(close.span);
                    let group = group_of(
                        GroupKind::Bracket { open: token, close },
                        self.source,
                        span,
                        children,
                    );
                    append(&mut current, &mut out, Node::Group(group));
                }
                _ => append(&mut current, &mut out, Node::Token(token)),
            }
        }

        flush(&mut current, &mut out);
        Ok((out, None))
    }
}

fn group_of<'a>(kind: GroupKind<'a>, source: &'a str, span: Span, children: Vec<Node<'a>>) -> TokenGroup<'a> {
    let mut builder = GroupBuilder::new(kind, source, span);
    for child in children {
        builder.add(child);
    }
    builder.build()
}

fn append<'a>(current: &mut Option<GroupBuilder<'a>>, out: &mut Vec<Node<'a>>, node: Node<'a>) {
    match current.as_mut() {
        Some(group) => group.add(node),
        None => out.push(node),
    }
}

fn flush<'a>(current: &mut Option<GroupBuilder<'a>>, out: &mut Vec<Node<'a>>) {
    if let Some(group) = current.take() {
        out.push(Node::Group(group.build()));
    }
}
