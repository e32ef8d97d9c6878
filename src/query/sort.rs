use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::core::Item;
use crate::error::CriteriaError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// 单个排序键。`attribute` 可带作用域：`"property/Music"`，
/// 即条目属性表中的完整 key。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub attribute: String,
    pub direction: Direction,
}

impl SortKey {
    /// 作用域前的属性名
    pub fn name(&self) -> &str {
        self.attribute
            .split_once('/')
            .map(|(n, _)| n)
            .unwrap_or(&self.attribute)
    }

    pub fn scope(&self) -> Option<&str> {
        self.attribute.split_once('/').map(|(_, s)| s)
    }
}

/// 排序条件：有序的 (attribute, direction) 列表。
///
/// 前一个键相等时依次比较后续键；全部相等时顺序不作保证（合并时按分区顺序打破平局）。
/// 缺失属性排在存在属性之前（升序时）。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortCriteria {
    keys: Vec<SortKey>,
}

impl SortCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, attribute: impl Into<String>, direction: Direction) -> Self {
        self.keys.push(SortKey {
            attribute: attribute.into(),
            direction,
        });
        self
    }

    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self::new().then(attribute, Direction::Ascending)
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self::new().then(attribute, Direction::Descending)
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn compare(&self, a: &Item, b: &Item) -> Ordering {
        for key in &self.keys {
            let ord = a.get(&key.attribute).cmp(&b.get(&key.attribute));
            let ord = match key.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// 旧格式：每项 `"attribute[/scope] [asc|desc]"`，方向缺省为升序
    pub fn from_legacy<S: AsRef<str>>(list: &[S]) -> Result<Self, CriteriaError> {
        let mut keys = Vec::with_capacity(list.len());
        for raw in list {
            let raw = raw.as_ref().trim();
            let (attribute, direction) = match raw.rsplit_once(char::is_whitespace) {
                Some((attr, dir)) => match dir.to_ascii_lowercase().as_str() {
                    "asc" | "ascending" => (attr.trim_end(), Direction::Ascending),
                    "desc" | "descending" => (attr.trim_end(), Direction::Descending),
                    _ => (raw, Direction::Ascending),
                },
                None => (raw, Direction::Ascending),
            };
            if attribute.is_empty() || attribute.starts_with('/') {
                return Err(CriteriaError::InvalidLegacySort(raw.to_string()));
            }
            keys.push(SortKey {
                attribute: attribute.to_string(),
                direction,
            });
        }
        Ok(Self { keys })
    }

    pub fn to_legacy(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| match k.direction {
                Direction::Ascending => format!("{} asc", k.attribute),
                Direction::Descending => format!("{} desc", k.attribute),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemId;

    fn item(name: &str, rank: i64) -> Item {
        Item::new(ItemId::explicit(1))
            .with("name", name)
            .with("rank", rank)
    }

    #[test]
    fn ties_fall_through_to_next_key() {
        let s = SortCriteria::ascending("rank").then("name", Direction::Descending);
        assert_eq!(s.compare(&item("a", 1), &item("b", 2)), Ordering::Less);
        assert_eq!(s.compare(&item("a", 1), &item("b", 1)), Ordering::Greater);
        assert_eq!(s.compare(&item("a", 1), &item("a", 1)), Ordering::Equal);
    }

    #[test]
    fn missing_attribute_sorts_first_ascending() {
        let s = SortCriteria::ascending("album");
        let with = item("a", 1).with("album", "x");
        assert_eq!(s.compare(&item("a", 1), &with), Ordering::Less);
    }

    #[test]
    fn legacy_strings_parse_and_render() {
        let s = SortCriteria::from_legacy(&["name", "property/Music Artist desc", "rank ASC"])
            .unwrap();
        assert_eq!(s.keys().len(), 3);
        assert_eq!(s.keys()[1].name(), "property");
        assert_eq!(s.keys()[1].scope(), Some("Music Artist"));
        assert_eq!(s.keys()[1].direction, Direction::Descending);
        assert_eq!(
            s.to_legacy(),
            vec!["name asc", "property/Music Artist desc", "rank asc"]
        );
        assert_eq!(SortCriteria::from_legacy(&s.to_legacy()).unwrap(), s);
    }

    #[test]
    fn legacy_rejects_empty_attribute() {
        assert!(SortCriteria::from_legacy(&["  "]).is_err());
        assert!(SortCriteria::from_legacy(&["/scope desc"]).is_err());
    }
}
