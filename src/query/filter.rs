use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{Item, Value};
use crate::error::CriteriaError;
use crate::query::matcher::{create_matcher, Matcher};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    Contains,
    Glob,
    Regex,
    Fuzzy,
    Less,
    Greater,
    Exists,
}

/// 叶子条件：`attribute <op> value`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub attribute: String,
    pub op: Operator,
    pub value: Value,
}

/// 过滤条件（布尔树）。
///
/// 同一棵树既下推给各分区做本地查询，也可在内存中针对单个 Item 求值
/// （显式条目与 `contains()` 使用后者）。
/// - `Empty`：不匹配任何条目（`clear()` 之后的状态）
/// - `All`：匹配所有条目
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FilterCriteria {
    #[default]
    Empty,
    All,
    Clause(Clause),
    And(Vec<FilterCriteria>),
    Or(Vec<FilterCriteria>),
    Not(Box<FilterCriteria>),
}

impl FilterCriteria {
    pub fn clause(attribute: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        FilterCriteria::Clause(Clause {
            attribute: attribute.into(),
            op,
            value: value.into(),
        })
    }

    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::clause(attribute, Operator::Equals, value)
    }

    pub fn exists(attribute: impl Into<String>) -> Self {
        Self::clause(attribute, Operator::Exists, Value::Null)
    }

    /// 与 `other` 取交；已有 And 节点则就地追加
    pub fn and(self, other: FilterCriteria) -> Self {
        match self {
            FilterCriteria::And(mut v) => {
                v.push(other);
                FilterCriteria::And(v)
            }
            this => FilterCriteria::And(vec![this, other]),
        }
    }

    pub fn or(self, other: FilterCriteria) -> Self {
        match self {
            FilterCriteria::Or(mut v) => {
                v.push(other);
                FilterCriteria::Or(v)
            }
            this => FilterCriteria::Or(vec![this, other]),
        }
    }

    pub fn negate(self) -> Self {
        FilterCriteria::Not(Box::new(self))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FilterCriteria::Empty)
    }

    /// 编译：构建所有叶子匹配器。任一叶子非法即整体失败（调用方按“空结果”处理）。
    pub fn compile(&self) -> Result<CompiledFilter, CriteriaError> {
        Ok(match self {
            FilterCriteria::Empty => CompiledFilter::Nothing,
            FilterCriteria::All => CompiledFilter::Everything,
            FilterCriteria::Clause(c) => {
                if c.attribute.is_empty() {
                    return Err(CriteriaError::EmptyAttribute);
                }
                CompiledFilter::Leaf {
                    attribute: c.attribute.clone(),
                    matcher: create_matcher(c.op, &c.value)?,
                }
            }
            FilterCriteria::And(v) => {
                CompiledFilter::And(v.iter().map(|f| f.compile()).collect::<Result<_, _>>()?)
            }
            FilterCriteria::Or(v) => {
                CompiledFilter::Or(v.iter().map(|f| f.compile()).collect::<Result<_, _>>()?)
            }
            FilterCriteria::Not(f) => CompiledFilter::Not(Box::new(f.compile()?)),
        })
    }

    /// 单条目求值；非法条件 fail closed（返回 false）
    pub fn matches(&self, item: &Item) -> bool {
        match self.compile() {
            Ok(c) => c.matches(item),
            Err(e) => {
                tracing::debug!("filter rejected as invalid: {}", e);
                false
            }
        }
    }
}

impl fmt::Display for FilterCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, v: &[FilterCriteria], sep: &str) -> fmt::Result {
            f.write_str("(")?;
            for (i, c) in v.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{}", c)?;
            }
            f.write_str(")")
        }
        match self {
            FilterCriteria::Empty => f.write_str("<empty>"),
            FilterCriteria::All => f.write_str("*"),
            FilterCriteria::Clause(c) => write!(f, "{} {:?} {}", c.attribute, c.op, c.value),
            FilterCriteria::And(v) => join(f, v, " AND "),
            FilterCriteria::Or(v) => join(f, v, " OR "),
            FilterCriteria::Not(c) => write!(f, "NOT {}", c),
        }
    }
}

/// 编译后的过滤树：叶子持有已构建的匹配器，可跨线程共享
#[derive(Clone)]
pub enum CompiledFilter {
    Nothing,
    Everything,
    Leaf {
        attribute: String,
        matcher: Arc<dyn Matcher>,
    },
    And(Vec<CompiledFilter>),
    Or(Vec<CompiledFilter>),
    Not(Box<CompiledFilter>),
}

impl CompiledFilter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            CompiledFilter::Nothing => false,
            CompiledFilter::Everything => true,
            CompiledFilter::Leaf { attribute, matcher } => item
                .get(attribute)
                .is_some_and(|v| matcher.matches(v)),
            CompiledFilter::And(v) => v.iter().all(|c| c.matches(item)),
            CompiledFilter::Or(v) => v.iter().any(|c| c.matches(item)),
            CompiledFilter::Not(c) => !c.matches(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemId;

    fn song(title: &str, year: i64) -> Item {
        Item::new(ItemId::explicit(1))
            .with("title", title)
            .with("year", year)
    }

    #[test]
    fn boolean_tree_evaluates_in_memory() {
        let f = FilterCriteria::clause("title", Operator::Glob, "*love*")
            .and(FilterCriteria::clause("year", Operator::Greater, 1990i64).negate());

        assert!(f.matches(&song("all you need is love", 1967)));
        assert!(!f.matches(&song("love again", 2020)));
        assert!(!f.matches(&song("yesterday", 1965)));
    }

    #[test]
    fn empty_matches_nothing_and_all_matches_everything() {
        let s = song("x", 1);
        assert!(!FilterCriteria::Empty.matches(&s));
        assert!(FilterCriteria::All.matches(&s));
        assert!(FilterCriteria::Empty.negate().matches(&s));
    }

    #[test]
    fn invalid_filter_fails_closed() {
        let f = FilterCriteria::clause("title", Operator::Regex, "([")
            .or(FilterCriteria::All);
        assert!(f.compile().is_err());
        assert!(!f.matches(&song("anything", 1)));
    }

    #[test]
    fn missing_attribute_never_matches_leaf() {
        let f = FilterCriteria::exists("artist");
        assert!(!f.matches(&song("x", 1)));
        assert!(f.matches(&song("x", 1).with("artist", "someone")));
    }

    #[test]
    fn filter_round_trips_through_json() {
        let f = FilterCriteria::equals("kind", "audio")
            .or(FilterCriteria::clause("size", Operator::Less, 10i64).negate());
        let json = serde_json::to_string(&f).unwrap();
        let back: FilterCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
