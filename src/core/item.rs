use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::core::id::ItemId;

/// 属性值。
///
/// 全序：Null < Bool < 数值（Int/Float 统一按数值比较）< Text。
/// 文本在构造时统一 NFC，保证“同一字符串不同组合形式”比较相等；
/// 反序列化得到的文本同样经过 NFC。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "WireValue")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// 落盘形式：变体与 `Value` 一一对应，读入后经 `Value::text` 归一化
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<WireValue> for Value {
    fn from(w: WireValue) -> Self {
        match w {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(x) => Value::Float(x),
            WireValue::Text(s) => Value::text(s),
        }
    }
}

/// 整数与浮点的精确比较（不经 `as f64` 舍入）。
/// NaN 的位置与 `f64::total_cmp` 一致：正 NaN 最大，负 NaN 最小。
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63，i64 无法表示
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= BOUND {
        return Ordering::Less;
    }
    if f < -BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        ord => ord,
    }
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(s.as_ref().nfc().collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            // -0.0 与 0.0 相等，与 Int(0) 保持一致
            (Value::Float(a), Value::Float(b)) if a == b => Ordering::Equal,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// 按 id 取回的不透明记录：id + 属性表
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub attrs: BTreeMap<String, Value>,
}

impl Item {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            attrs: BTreeMap::new(),
        }
    }

    /// 尚无 id 的条目（用于 `insert_content`，由引擎分配显式 id）
    pub fn detached() -> Self {
        Self::new(ItemId::DETACHED)
    }

    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(attr.into(), value.into());
        self
    }

    pub fn set(&mut self, attr: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(attr.into(), value.into());
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    /// 内容相等（忽略 id），用于匹配游离条目
    pub fn same_content(&self, other: &Item) -> bool {
        self.attrs == other.attrs
    }
}
