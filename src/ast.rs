//! 由查询生成的搜索请求模型
//!
//! 这里都是纯数据：可序列化、可克隆, 工厂返回之后不再修改。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 文档的规范引用, 例如数据源或字典
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub uuid: String,
    pub name: String,
}

impl DocRef {
    pub fn new(doc_type: impl Into<String>, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            uuid: uuid.into(),
            name: name.into(),
        }
    }
}

/// 表达式节点的逻辑运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    And,
    Or,
    Not,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::And => "AND",
            Op::Or => "OR",
            Op::Not => "NOT",
        })
    }
}

/// 条件运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    IsNull,
    IsNotNull,
    Between,
    In,
    InDictionary,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Condition::Equals => "=",
            Condition::NotEquals => "!=",
            Condition::GreaterThan => ">",
            Condition::GreaterThanOrEqualTo => ">=",
            Condition::LessThan => "<",
            Condition::LessThanOrEqualTo => "<=",
            Condition::IsNull => "is null",
            Condition::IsNotNull => "is not null",
            Condition::Between => "between",
            Condition::In => "in",
            Condition::InDictionary => "in dictionary",
        })
    }
}

/// 表达式树的叶子节点, 例如：`field condition value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionTerm {
    pub field: String,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ref: Option<DocRef>,
}

impl ExpressionTerm {
    pub fn new(field: impl Into<String>, condition: Condition, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition,
            value: Some(value.into()),
            doc_ref: None,
        }
    }
}

impl fmt::Display for ExpressionTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.condition)?;
        if let Some(doc_ref) = &self.doc_ref {
            write!(f, " {}", doc_ref.name)?;
        } else if let Some(value) = self.value.as_deref().filter(|v| !v.is_empty()) {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExpressionItem {
    Term(ExpressionTerm),
    Operator(ExpressionOperator),
}

impl From<ExpressionTerm> for ExpressionItem {
    fn from(term: ExpressionTerm) -> Self {
        ExpressionItem::Term(term)
    }
}

impl From<ExpressionOperator> for ExpressionItem {
    fn from(operator: ExpressionOperator) -> Self {
        ExpressionItem::Operator(operator)
    }
}

impl fmt::Display for ExpressionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionItem::Term(term) => term.fmt(f),
            ExpressionItem::Operator(operator) => operator.fmt(f),
        }
    }
}

/// 表达式节点, 所有子节点使用同一个运算符组合
/// `NOT` 节点对其子节点的合取取反
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionOperator {
    pub op: Op,
    #[serde(default)]
    pub children: Vec<ExpressionItem>,
}

impl Default for ExpressionOperator {
    fn default() -> Self {
        Self::new(Op::And)
    }
}

impl ExpressionOperator {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            children: Vec::new(),
        }
    }

    pub fn with_children(op: Op, children: Vec<ExpressionItem>) -> Self {
        Self { op, children }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// 用 `op` 把当前节点和 `incoming` 组合起来
    ///
    /// 运算符相同时直接展开到当前节点；运算符不同时把当前节点包装为新节点的第一个子节点,
    /// 保证每个节点只有一种运算符。
    pub fn merge(self, op: Op, incoming: Vec<ExpressionItem>) -> ExpressionOperator {
        if self.is_empty() {
            let mut merged = ExpressionOperator::new(op);
            merged.push_flattened(incoming);
            return merged;
        }

        if self.op == op && op != Op::Not {
            let mut merged = self;
            merged.push_flattened(incoming);
            return merged;
        }

        let mut merged = ExpressionOperator::new(op);
        merged.children.push(ExpressionItem::Operator(self));
        merged.push_flattened(incoming);
        merged
    }

    fn push_flattened(&mut self, incoming: Vec<ExpressionItem>) {
        for item in incoming {
            match item {
                ExpressionItem::Operator(child) if child.op == self.op && self.op != Op::Not => {
                    self.children.extend(child.children)
                }
                other => self.children.push(other),
            }
        }
    }

    /// 删除空节点, 折叠只有一个子节点的 `AND`/`OR`, 并展开同运算符的嵌套。
    /// 根节点始终是运算符节点；如果根只有一个运算符子节点, 则用该子节点替换根。
    pub fn simplify(self) -> ExpressionOperator {
        let op = self.op;
        let mut children = Vec::with_capacity(self.children.len());
        for child in self.children {
            match simplify_item(child) {
                None => {}
                Some(ExpressionItem::Operator(inner)) if inner.op == op && op != Op::Not => {
                    children.extend(inner.children)
                }
                Some(item) => children.push(item),
            }
        }

        if op != Op::Not && children.len() == 1 {
            if let Some(ExpressionItem::Operator(_)) = children.first() {
                if let Some(ExpressionItem::Operator(inner)) = children.pop() {
                    return inner;
                }
            }
        }
        ExpressionOperator { op, children }
    }
}

fn simplify_item(item: ExpressionItem) -> Option<ExpressionItem> {
    match item {
        ExpressionItem::Term(term) => Some(ExpressionItem::Term(term)),
        ExpressionItem::Operator(operator) => {
            let simplified = operator.simplify();
            if simplified.is_empty() {
                return None;
            }
            if simplified.op != Op::Not && simplified.children.len() == 1 {
                return simplified.children.into_iter().next();
            }
            Some(ExpressionItem::Operator(simplified))
        }
    }
}

impl fmt::Display for ExpressionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op == Op::Not {
            f.write_str("NOT ")?;
        }
        let separator = match self.op {
            Op::Or => " OR ",
            Op::And | Op::Not => " AND ",
        };
        let parenthesise = self.op == Op::Not && self.children.len() > 1;
        if parenthesise {
            f.write_str("(")?;
        }
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                f.write_str(separator)?;
            }
            match child {
                ExpressionItem::Operator(inner) if inner.op != Op::Not && inner.children.len() > 1 => {
                    write!(f, "({inner})")?
                }
                other => write!(f, "{other}")?,
            }
        }
        if parenthesise {
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// 解析 `asc`、`desc` 或完整的方向名称, 忽略大小写
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(SortDirection::Ascending),
            "desc" | "descending" => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub order: u32,
    pub direction: SortDirection,
}

/// 列值过滤：必须匹配 `includes`, 不能匹配 `excludes` (正则表达式)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub name: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ColumnFilter>,
    pub visible: bool,
    pub special: bool,
}

/// 固定大小的时间窗口, 按 `advance_size` 滑动
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoppingWindow {
    pub time_field: String,
    pub window_size: String,
    pub advance_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// 可视化类型, 以及参数到列 id 的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisSettings {
    pub vis_type: String,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSettings {
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<HoppingWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_filter: Option<ExpressionOperator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_filter: Option<ExpressionOperator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub max_results: Vec<u64>,
    pub extract_values: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vis_settings: Option<VisSettings>,
}

impl TableSettings {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn visible_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.visible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStyle {
    Table,
    QlVis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRequest {
    pub component_id: String,
    pub mappings: Vec<TableSettings>,
    pub result_style: ResultStyle,
}

/// 命名的请求参数, 在查询中通过 `param(name)` 引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub data_source: DocRef,
    pub expression: ExpressionOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

/// 调用方提供的请求上下文
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl BaseRequest {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub query: Query,
    pub result_requests: Vec<ResultRequest>,
}

impl SearchRequest {
    /// 普通表格结果请求
    pub fn table(&self) -> Option<&TableSettings> {
        self.result_requests
            .iter()
            .find(|r| r.result_style == ResultStyle::Table)
            .and_then(|r| r.mappings.first())
    }
}
