//! Clause keywords and the rules for the order they may appear in.

use std::fmt;

use crate::error::{SyntaxError, SyntaxResult};
use crate::token::{Located, PipeOperation, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clause {
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
}

/// Which clauses may already have been consumed when a clause is reached.
struct Rule {
    clause: Clause,
    valid_after: &'static [Clause],
}

use Clause::*;

const RULES: &[Rule] = &[
    Rule {
        clause: From,
        valid_after: &[],
    },
    Rule {
        clause: Where,
        valid_after: &[From],
    },
    Rule {
        clause: Eval,
        valid_after: &[From, Where, Eval, Window],
    },
    Rule {
        clause: Window,
        valid_after: &[From, Where, Eval],
    },
    Rule {
        clause: Filter,
        valid_after: &[From, Where, Eval, Window],
    },
    Rule {
        clause: Sort,
        valid_after: &[From, Where, Eval, Window, Filter, Group, Having],
    },
    Rule {
        clause: Group,
        valid_after: &[From, Where, Eval, Window, Filter, Sort, Group, Having],
    },
    Rule {
        clause: Having,
        valid_after: &[From, Where, Eval, Window, Filter, Sort, Group],
    },
    Rule {
        clause: Select,
        valid_after: &[From, Where, Eval, Window, Filter, Sort, Group, Having],
    },
    Rule {
        clause: Limit,
        valid_after: &[From, Where, Eval, Window, Filter, Sort, Group, Having, Select],
    },
    Rule {
        clause: Show,
        valid_after: &[From, Where, Eval, Window, Filter, Sort, Group, Having, Select, Limit],
    },
];

impl Clause {
    pub fn from_token_kind(kind: TokenKind) -> Option<Clause> {
        match kind {
            TokenKind::From => Some(From),
            TokenKind::Where => Some(Where),
            TokenKind::Eval => Some(Eval),
            TokenKind::Window => Some(Window),
            TokenKind::Filter => Some(Filter),
            TokenKind::Sort => Some(Sort),
            TokenKind::Group => Some(Group),
            TokenKind::Having => Some(Having),
            TokenKind::Select => Some(Select),
            TokenKind::Limit => Some(Limit),
            TokenKind::Show => Some(Show),
            _ => None,
        }
    }

    /// Clause introduced by a pipe command. Logical commands extend the previous
    /// expression clause instead and have no clause of their own.
    pub fn from_pipe(operation: PipeOperation) -> Option<Clause> {
        match operation {
            PipeOperation::Where => Some(Where),
            PipeOperation::Filter => Some(Filter),
            PipeOperation::Eval => Some(Eval),
            PipeOperation::Table => Some(Select),
            PipeOperation::Limit => Some(Limit),
            PipeOperation::Sort => Some(Sort),
            PipeOperation::Group => Some(Group),
            PipeOperation::Having => Some(Having),
            PipeOperation::And | PipeOperation::Or | PipeOperation::Not => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            From => "from",
            Where => "where",
            Eval => "eval",
            Window => "window",
            Filter => "filter",
            Sort => "sort",
            Group => "group",
            Having => "having",
            Select => "select",
            Limit => "limit",
            Show => "show",
        }
    }

    fn valid_after(self) -> &'static [Clause] {
        RULES
            .iter()
            .find(|rule| rule.clause == self)
            .map_or(&[], |rule| rule.valid_after)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checks that `clause` may follow the clauses consumed so far. The error is positioned
/// on `token` and names every consumed clause that is not allowed before it.
pub fn check_order(token: &impl Located, clause: Clause, consumed: &[Clause]) -> SyntaxResult<()> {
    if clause != From && !consumed.contains(&From) {
        return Err(SyntaxError::at(
            token,
            format!("Required from before {clause}"),
        ));
    }

    let valid_after = clause.valid_after();
    let mut unexpected: Vec<Clause> = Vec::new();
    for seen in consumed {
        if !valid_after.contains(seen) && !unexpected.contains(seen) {
            unexpected.push(*seen);
        }
    }

    if unexpected.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = unexpected.iter().map(|c| c.name()).collect();
    Err(SyntaxError::at(
        token,
        format!("Unexpected {clause} after {}", names.join(", ")),
    ))
}
