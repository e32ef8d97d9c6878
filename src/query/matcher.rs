use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher as _;
use regex::Regex;
use std::sync::Arc;
use wildmatch::WildMatch;

use crate::core::Value;
use crate::error::CriteriaError;
use crate::query::filter::Operator;

/// 叶子匹配器：判断单个属性值是否满足条件
pub trait Matcher: Send + Sync {
    fn matches(&self, value: &Value) -> bool;
}

/// 相等匹配
pub struct ExactMatcher {
    expected: Value,
}

impl Matcher for ExactMatcher {
    fn matches(&self, value: &Value) -> bool {
        *value == self.expected
    }
}

/// 子串匹配（非文本值按其文本表示匹配）
pub struct ContainsMatcher {
    pattern: String,
}

impl Matcher for ContainsMatcher {
    fn matches(&self, value: &Value) -> bool {
        match value {
            Value::Text(s) => s.contains(&self.pattern),
            Value::Null => false,
            other => other.to_string().contains(&self.pattern),
        }
    }
}

/// 通配符匹配 (Glob)
pub struct GlobMatcher {
    wild: WildMatch,
}

impl Matcher for GlobMatcher {
    fn matches(&self, value: &Value) -> bool {
        match value {
            Value::Text(s) => self.wild.matches(s),
            Value::Null => false,
            other => self.wild.matches(&other.to_string()),
        }
    }
}

pub struct RegexMatcher {
    re: Regex,
}

impl Matcher for RegexMatcher {
    fn matches(&self, value: &Value) -> bool {
        match value {
            Value::Text(s) => self.re.is_match(s),
            Value::Null => false,
            other => self.re.is_match(&other.to_string()),
        }
    }
}

/// 模糊匹配（skim 评分，有分即命中）
pub struct FuzzyMatcher {
    matcher: SkimMatcherV2,
    pattern: String,
}

impl Matcher for FuzzyMatcher {
    fn matches(&self, value: &Value) -> bool {
        value
            .as_text()
            .and_then(|s| self.matcher.fuzzy_match(s, &self.pattern))
            .is_some()
    }
}

/// 有序比较：`value < bound` 或 `value > bound`
pub struct OrderMatcher {
    bound: Value,
    less: bool,
}

impl Matcher for OrderMatcher {
    fn matches(&self, value: &Value) -> bool {
        if self.less {
            *value < self.bound
        } else {
            *value > self.bound
        }
    }
}

/// 属性存在即命中（值本身不参与判断）
pub struct ExistsMatcher;

impl Matcher for ExistsMatcher {
    fn matches(&self, _value: &Value) -> bool {
        true
    }
}

fn pattern_text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 匹配器工厂：按运算符构建叶子匹配器（正则在此编译，失败即报错）
pub fn create_matcher(op: Operator, value: &Value) -> Result<Arc<dyn Matcher>, CriteriaError> {
    let m: Arc<dyn Matcher> = match op {
        Operator::Equals => Arc::new(ExactMatcher {
            expected: value.clone(),
        }),
        Operator::Contains => Arc::new(ContainsMatcher {
            pattern: pattern_text(value),
        }),
        Operator::Glob => Arc::new(GlobMatcher {
            wild: WildMatch::new(&pattern_text(value)),
        }),
        Operator::Regex => {
            let pattern = pattern_text(value);
            let re = Regex::new(&pattern).map_err(|e| CriteriaError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            Arc::new(RegexMatcher { re })
        }
        Operator::Fuzzy => Arc::new(FuzzyMatcher {
            matcher: SkimMatcherV2::default(),
            pattern: pattern_text(value),
        }),
        Operator::Less => Arc::new(OrderMatcher {
            bound: value.clone(),
            less: true,
        }),
        Operator::Greater => Arc::new(OrderMatcher {
            bound: value.clone(),
            less: false,
        }),
        Operator::Exists => Arc::new(ExistsMatcher),
    };
    Ok(m)
}
