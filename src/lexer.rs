//! 查询语言的词法分析器
//!
//! 分词从一个覆盖整个输入的 `Unknown` token 开始, 按顺序应用 [`PASSES`]。每一遍只切分仍为
//! `Unknown` 的 token, 前面已分类的 token 不会被后面的遍再次切分, 所以表的顺序就是语言的
//! 优先级。这里不会失败, 最后剩下的部分都成为 `String` token。

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::token::{Span, Token, TokenKind};

/// 这些词即使后面紧跟 `(` 也不是函数名
const KEYWORDS: &[(&str, TokenKind)] = &[
    ("and", TokenKind::And),
    ("or", TokenKind::Or),
    ("not", TokenKind::Not),
    ("by", TokenKind::By),
    ("as", TokenKind::As),
    ("between", TokenKind::Between),
    ("in", TokenKind::In),
    ("dictionary", TokenKind::Dictionary),
    ("from", TokenKind::From),
    ("where", TokenKind::Where),
    ("eval", TokenKind::Eval),
    ("window", TokenKind::Window),
    ("filter", TokenKind::Filter),
    ("sort", TokenKind::Sort),
    ("group", TokenKind::Group),
    ("having", TokenKind::Having),
    ("select", TokenKind::Select),
    ("limit", TokenKind::Limit),
    ("show", TokenKind::Show),
];

const ARITHMETIC: &[(&str, TokenKind)] = &[
    ("^", TokenKind::Order),
    ("/", TokenKind::Division),
    ("*", TokenKind::Multiplication),
    ("%", TokenKind::Modulus),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
];

// 长的在前, 保证 `<=` 优先于 `<`
const COMPARISONS: &[(&str, TokenKind)] = &[
    ("!=", TokenKind::NotEquals),
    ("<=", TokenKind::LessThanOrEqualTo),
    (">=", TokenKind::GreaterThanOrEqualTo),
    ("<", TokenKind::LessThan),
    (">", TokenKind::GreaterThan),
    ("=", TokenKind::Equals),
];

/// 分词器的一遍分类
#[derive(Debug, Clone, Copy)]
pub enum Pass {
    /// 引号字符串和注释, 从左到右一次扫描
    Literals,
    /// 把 `regex` 每次匹配的第 `group` 个捕获组标记为 `kind`
    Pattern {
        kind: TokenKind,
        regex: &'static str,
        group: usize,
    },
    /// `name(`, 且 `name` 不是关键字
    FunctionNames,
    /// 固定词表, 忽略大小写匹配。锚定的词两侧必须是空白或 token 边界
    Words {
        words: &'static [(&'static str, TokenKind)],
        anchored: bool,
    },
    /// `between` 之后的第一个 `and` 分隔上下界
    BetweenAnd,
    /// 剩余的未知部分都成为字符串
    Remainder,
}

/// 有序的分类表
pub const PASSES: &[Pass] = &[
    Pass::Literals,
    Pass::Pattern {
        kind: TokenKind::Param,
        regex: r"\$\{[^}]*\}",
        group: 0,
    },
    Pass::Pattern {
        kind: TokenKind::Command,
        regex: r"\|\s*([A-Za-z_][A-Za-z0-9_]*)",
        group: 1,
    },
    Pass::FunctionNames,
    Pass::Pattern {
        kind: TokenKind::OpenBracket,
        regex: r"\(",
        group: 0,
    },
    Pass::Pattern {
        kind: TokenKind::CloseBracket,
        regex: r"\)",
        group: 0,
    },
    Pass::Pattern {
        kind: TokenKind::IsNotNull,
        regex: r"(?i)(^|\s)(is\s+not\s+null)(\s|$)",
        group: 2,
    },
    Pass::Pattern {
        kind: TokenKind::IsNull,
        regex: r"(?i)(^|\s)(is\s+null)(\s|$)",
        group: 2,
    },
    Pass::Pattern {
        kind: TokenKind::Whitespace,
        regex: r"\s+",
        group: 0,
    },
    Pass::Pattern {
        kind: TokenKind::Pipe,
        regex: r"\|",
        group: 0,
    },
    Pass::Pattern {
        kind: TokenKind::Comma,
        regex: r",",
        group: 0,
    },
    Pass::Words {
        words: KEYWORDS,
        anchored: true,
    },
    Pass::Pattern {
        kind: TokenKind::DateTime,
        regex: r"(^|\s)(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?(Z|[+-]\d{2}:\d{2})?)(\s|$)",
        group: 2,
    },
    Pass::Pattern {
        kind: TokenKind::Duration,
        regex: r"(^|\s)(\d+(ns|ms|s|m|h|d|w|M|y))(\s|$)",
        group: 2,
    },
    Pass::Words {
        words: ARITHMETIC,
        anchored: true,
    },
    Pass::Words {
        words: COMPARISONS,
        anchored: false,
    },
    Pass::Pattern {
        kind: TokenKind::Number,
        regex: r"(^|\s)(-?\d+(\.\d+)?([eE][+-]?\d+)?)(\s|$)",
        group: 2,
    },
    Pass::BetweenAnd,
    Pass::Remainder,
];

impl Pass {
    fn pattern(&self) -> Option<(String, usize)> {
        match self {
            Pass::Pattern { regex, group, .. } => Some((regex.to_string(), *group)),
            Pass::FunctionNames => Some((r"([A-Za-z_][A-Za-z0-9_]*)\(".to_string(), 1)),
            Pass::Words { words, anchored } => {
                let alternatives = words
                    .iter()
                    .map(|(word, _)| regex::escape(word))
                    .collect::<Vec<_>>()
                    .join("|");
                if *anchored {
                    Some((format!(r"(?i)(^|\s)({alternatives})(\s|$)"), 2))
                } else {
                    Some((format!("({alternatives})"), 1))
                }
            }
            Pass::Literals | Pass::BetweenAnd | Pass::Remainder => None,
        }
    }
}

struct CompiledPass {
    regex: Regex,
    group: usize,
}

static COMPILED: Lazy<Vec<Option<CompiledPass>>> = Lazy::new(|| {
    PASSES
        .iter()
        .map(|pass| {
            let (pattern, group) = pass.pattern()?;
            let regex = Regex::new(&pattern).ok()?;
            Some(CompiledPass { regex, group })
        })
        .collect()
});

type Piece = (TokenKind, Span);

/// 把查询文本切分为已分类的 token
pub struct Tokeniser;

impl Tokeniser {
    /// 对 `text` 分词。结果的切片拼接起来总是等于 `text`
    pub fn parse(text: &str) -> Vec<Token<'_>> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut pieces: Vec<Piece> = vec![(TokenKind::Unknown, Span::new(0, text.len()))];
        for (pass, compiled) in PASSES.iter().zip(COMPILED.iter()) {
            pieces = apply(text, pass, compiled.as_ref(), pieces);
        }

        let tokens: Vec<Token<'_>> = pieces
            .into_iter()
            .map(|(kind, span)| Token::new(kind, text, span))
            .collect();
        trace!(count = tokens.len(), ?tokens, "tokenised query");
        tokens
    }
}

fn apply(text: &str, pass: &Pass, compiled: Option<&CompiledPass>, pieces: Vec<Piece>) -> Vec<Piece> {
    match pass {
        Pass::Literals => split_unknown(pieces, |span, out| split_literals(text, span, out)),
        Pass::BetweenAnd => reclassify_between_and(pieces),
        Pass::Remainder => pieces
            .into_iter()
            .map(|(kind, span)| match kind {
                TokenKind::Unknown => (TokenKind::String, span),
                _ => (kind, span),
            })
            .collect(),
        Pass::Pattern { kind, .. } => match compiled {
            Some(compiled) => split_unknown(pieces, |span, out| {
                split_matches(text, span, compiled, |_| Some(*kind), out)
            }),
            None => pieces,
        },
        Pass::FunctionNames => match compiled {
            Some(compiled) => split_unknown(pieces, |span, out| {
                split_matches(
                    text,
                    span,
                    compiled,
                    |name| match lookup(KEYWORDS, name) {
                        Some(_) => None,
                        None => Some(TokenKind::FunctionName),
                    },
                    out,
                )
            }),
            None => pieces,
        },
        Pass::Words { words, .. } => match compiled {
            Some(compiled) => split_unknown(pieces, |span, out| {
                split_matches(text, span, compiled, |word| lookup(words, word), out)
            }),
            None => pieces,
        },
    }
}

fn lookup(words: &[(&str, TokenKind)], word: &str) -> Option<TokenKind> {
    words
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(word))
        .map(|(_, kind)| *kind)
}

/// 对每个未知片段执行 `split`, 已分类的片段保持不变
fn split_unknown<F>(pieces: Vec<Piece>, mut split: F) -> Vec<Piece>
where
    F: FnMut(Span, &mut Vec<Piece>),
{
    let mut out = Vec::with_capacity(pieces.len());
    for (kind, span) in pieces {
        if kind == TokenKind::Unknown {
            split(span, &mut out);
        } else {
            out.push((kind, span));
        }
    }
    out
}

fn push_unknown(out: &mut Vec<Piece>, start: usize, end: usize) {
    if start < end {
        out.push((TokenKind::Unknown, Span::new(start, end)));
    }
}

/// 标记每次匹配的捕获组。`classify` 接收捕获的文本, 返回 `None` 表示放弃该匹配,
/// 文本保持未知
fn split_matches<F>(text: &str, span: Span, compiled: &CompiledPass, classify: F, out: &mut Vec<Piece>)
where
    F: Fn(&str) -> Option<TokenKind>,
{
    let haystack = &text[span.start..span.end];
    let mut emitted = 0;
    let mut pos = 0;

    while pos <= haystack.len() {
        let Some(caps) = compiled.regex.captures_at(haystack, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };
        let Some(found) = caps.get(compiled.group).filter(|m| !m.is_empty()) else {
            pos = next_boundary(haystack, whole.end().max(pos));
            continue;
        };

        // 从捕获组末尾继续搜索, 让结尾的分隔符可以作为下一次匹配的锚点
        pos = found.end();
        let Some(kind) = classify(found.as_str()) else {
            continue;
        };

        push_unknown(out, span.start + emitted, span.start + found.start());
        out.push((kind, Span::new(span.start + found.start(), span.start + found.end())));
        emitted = found.end();
    }

    push_unknown(out, span.start + emitted, span.end);
}

fn next_boundary(haystack: &str, pos: usize) -> usize {
    haystack[pos..]
        .chars()
        .next()
        .map_or(haystack.len() + 1, |c| pos + c.len_utf8())
}

/// 引号字符串和注释必须一起识别：注释里的引号不是字符串, 字符串里的注释标记也不是注释
fn split_literals(text: &str, span: Span, out: &mut Vec<Piece>) {
    let bytes = text.as_bytes();
    let mut emitted = span.start;
    let mut i = span.start;

    while i < span.end {
        let (kind, end) = match bytes[i] {
            quote @ (b'"' | b'\'') => {
                let kind = if quote == b'"' {
                    TokenKind::DoubleQuotedString
                } else {
                    TokenKind::SingleQuotedString
                };
                (kind, scan_quoted(bytes, i, span.end, quote))
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') && i + 1 < span.end => {
                let end = text[i..span.end]
                    .find('\n')
                    .map_or(span.end, |offset| i + offset);
                (TokenKind::Comment, end)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') && i + 1 < span.end => {
                let end = text[i + 2..span.end]
                    .find("*/")
                    .map_or(span.end, |offset| i + 2 + offset + 2);
                (TokenKind::BlockComment, end)
            }
            _ => {
                i += 1;
                continue;
            }
        };

        push_unknown(out, emitted, i);
        out.push((kind, Span::new(i, end)));
        emitted = end;
        i = end;
    }

    push_unknown(out, emitted, span.end);
}

/// 返回从 `start` 开始的引号字面量的结束位置。未闭合的字面量延伸到片段末尾
fn scan_quoted(bytes: &[u8], start: usize, limit: usize, quote: u8) -> usize {
    let mut escape = false;
    let mut i = start + 1;
    while i < limit {
        let b = bytes[i];
        if escape {
            escape = false;
        } else if b == b'\\' {
            escape = true;
        } else if b == quote {
            return i + 1;
        }
        i += 1;
    }
    limit
}

fn reclassify_between_and(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut in_between = false;
    pieces
        .into_iter()
        .map(|(kind, span)| match kind {
            TokenKind::Between => {
                in_between = true;
                (kind, span)
            }
            TokenKind::And if in_between => {
                in_between = false;
                (TokenKind::BetweenAnd, span)
            }
            TokenKind::Pipe | TokenKind::CloseBracket => {
                in_between = false;
                (kind, span)
            }
            _ => (kind, span),
        })
        .collect()
}
