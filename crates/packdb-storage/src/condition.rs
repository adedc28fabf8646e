//! Field predicates
//!
//! A [`Condition`] compares one column against an operand. Evaluation is
//! two-phase: [`Condition::maybe_match_pack`] decides from zone-map
//! statistics alone whether a pack can contain a match, and
//! [`Condition::match_pack`] computes the exact per-row bitmap.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use packdb_common::error::{QueryError, Result};
use packdb_common::types::{FieldType, Schema, Value};

use crate::bitset::Bitset;
use crate::block::Block;
use crate::info::{BlockInfo, PackInfo};
use crate::package::Package;

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Equal,
    NotEqual,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    In,
    NotIn,
    Regexp,
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterMode::Equal => "=",
            FilterMode::NotEqual => "!=",
            FilterMode::Gt => ">",
            FilterMode::Gte => ">=",
            FilterMode::Lt => "<",
            FilterMode::Lte => "<=",
            FilterMode::Range => "rg",
            FilterMode::In => "in",
            FilterMode::NotIn => "nin",
            FilterMode::Regexp => "re",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Single(Value),
    Range(Value, Value),
    List(Vec<Value>),
    Pattern(String),
}

/// A single predicate on one field
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub mode: FilterMode,
    operand: Operand,
    /// Fully answered by an index lookup; skipped during matching
    pub processed: bool,
    /// Index lookup proved that nothing matches
    pub nomatch: bool,
    index: usize,
    regex: Option<Regex>,
}

impl Condition {
    fn new(field: impl Into<String>, mode: FilterMode, operand: Operand) -> Self {
        Self {
            field: field.into(),
            mode,
            operand,
            processed: false,
            nomatch: false,
            index: usize::MAX,
            regex: None,
        }
    }

    pub fn equal(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Equal, Operand::Single(v.into()))
    }

    pub fn not_equal(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::NotEqual, Operand::Single(v.into()))
    }

    pub fn gt(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Gt, Operand::Single(v.into()))
    }

    pub fn gte(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Gte, Operand::Single(v.into()))
    }

    pub fn lt(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Lt, Operand::Single(v.into()))
    }

    pub fn lte(field: impl Into<String>, v: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Lte, Operand::Single(v.into()))
    }

    /// Inclusive range `from..=to`
    pub fn range(field: impl Into<String>, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self::new(field, FilterMode::Range, Operand::Range(from.into(), to.into()))
    }

    pub fn in_list<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        Self::new(field, FilterMode::In, Operand::List(list))
    }

    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        Self::new(field, FilterMode::NotIn, Operand::List(list))
    }

    pub fn regexp(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterMode::Regexp, Operand::Pattern(pattern.into()))
    }

    /// Schema position of the field, valid after [`Condition::compile`]
    #[must_use]
    pub fn field_index(&self) -> usize {
        self.index
    }

    /// The single comparison value for scalar modes
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match &self.operand {
            Operand::Single(v) => Some(v),
            _ => None,
        }
    }

    /// Sorted operand list for In / NotIn
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match &self.operand {
            Operand::List(v) => v,
            _ => &[],
        }
    }

    /// Resolve the field and validate operand types. Sorts and
    /// deduplicates IN lists and compiles regular expressions.
    pub fn compile(&mut self, schema: &Schema) -> Result<()> {
        self.index = schema.resolve(&self.field)?;
        let typ = schema.field(self.index).typ;

        let check = |v: &Value| -> Result<()> {
            if v.field_type() == typ {
                Ok(())
            } else {
                Err(QueryError::TypeMismatch {
                    expected: typ.to_string(),
                    actual: v.field_type().to_string(),
                }
                .into())
            }
        };

        match &mut self.operand {
            Operand::Single(v) => check(v)?,
            Operand::Range(from, to) => {
                check(from)?;
                check(to)?;
            }
            Operand::List(list) => {
                for v in list.iter() {
                    check(v)?;
                }
                list.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                list.dedup();
            }
            Operand::Pattern(p) => {
                if !matches!(typ, FieldType::String | FieldType::Bytes) {
                    return Err(QueryError::InvalidCondition(format!(
                        "regexp on non-string field {}",
                        self.field
                    ))
                    .into());
                }
                let re = Regex::new(p)
                    .map_err(|e| QueryError::InvalidCondition(format!("bad pattern {p:?}: {e}")))?;
                self.regex = Some(re);
            }
        }

        let valid = matches!(
            (self.mode, &self.operand),
            (FilterMode::Range, Operand::Range(..))
                | (FilterMode::In | FilterMode::NotIn, Operand::List(_))
                | (FilterMode::Regexp, Operand::Pattern(_))
                | (
                    FilterMode::Equal
                        | FilterMode::NotEqual
                        | FilterMode::Gt
                        | FilterMode::Gte
                        | FilterMode::Lt
                        | FilterMode::Lte,
                    Operand::Single(_)
                )
        );
        if !valid {
            return Err(QueryError::InvalidCondition(format!("operand does not fit mode {}", self.mode)).into());
        }
        Ok(())
    }

    // ========================================================================
    // Zone map evaluation
    // ========================================================================

    fn stats<'a>(&self, info: &'a PackInfo) -> Option<&'a BlockInfo> {
        info.blocks.get(self.index)
    }

    /// False only when the pack cannot contain a matching row.
    #[must_use]
    pub fn maybe_match_pack(&self, info: &PackInfo) -> bool {
        let Some(b) = self.stats(info) else {
            return true;
        };
        let (min, max) = (&b.min, &b.max);
        match (&self.operand, self.mode) {
            (Operand::Single(v), FilterMode::Equal) => le(min, v) && le(v, max),
            (Operand::Single(v), FilterMode::NotEqual) => !(eq(min, v) && eq(max, v)),
            (Operand::Single(v), FilterMode::Gt) => lt(v, max),
            (Operand::Single(v), FilterMode::Gte) => le(v, max),
            (Operand::Single(v), FilterMode::Lt) => lt(min, v),
            (Operand::Single(v), FilterMode::Lte) => le(min, v),
            (Operand::Range(from, to), _) => le(from, max) && le(min, to),
            (Operand::List(list), FilterMode::In) => any_in_range(list, min, max),
            (Operand::List(list), FilterMode::NotIn) => !(eq(min, max) && contains(list, min)),
            _ => true,
        }
    }

    /// True when the zone map proves every row of the pack matches.
    #[must_use]
    pub fn matches_all(&self, info: &PackInfo) -> bool {
        let Some(b) = self.stats(info) else {
            return false;
        };
        let (min, max) = (&b.min, &b.max);
        match (&self.operand, self.mode) {
            (Operand::Single(v), FilterMode::Equal) => eq(min, v) && eq(max, v),
            (Operand::Single(v), FilterMode::NotEqual) => lt(v, min) || lt(max, v),
            (Operand::Single(v), FilterMode::Gt) => lt(v, min),
            (Operand::Single(v), FilterMode::Gte) => le(v, min),
            (Operand::Single(v), FilterMode::Lt) => lt(max, v),
            (Operand::Single(v), FilterMode::Lte) => le(max, v),
            (Operand::Range(from, to), _) => le(from, min) && le(max, to),
            (Operand::List(list), FilterMode::In) => eq(min, max) && contains(list, min),
            (Operand::List(list), FilterMode::NotIn) => !any_in_range(list, min, max),
            _ => false,
        }
    }

    // ========================================================================
    // Row evaluation
    // ========================================================================

    /// Exact match of row `i` of `block`
    #[must_use]
    pub fn match_value(&self, block: &Block, i: usize) -> bool {
        match (&self.operand, self.mode) {
            (Operand::Single(v), mode) => match block.cmp_at(i, v) {
                Some(ord) => match mode {
                    FilterMode::Equal => ord == Ordering::Equal,
                    FilterMode::NotEqual => ord != Ordering::Equal,
                    FilterMode::Gt => ord == Ordering::Greater,
                    FilterMode::Gte => ord != Ordering::Less,
                    FilterMode::Lt => ord == Ordering::Less,
                    FilterMode::Lte => ord != Ordering::Greater,
                    _ => false,
                },
                None => false,
            },
            (Operand::Range(from, to), _) => {
                block.cmp_at(i, from).is_some_and(|o| o != Ordering::Less)
                    && block.cmp_at(i, to).is_some_and(|o| o != Ordering::Greater)
            }
            (Operand::List(list), mode) => {
                let found = list
                    .binary_search_by(|v| block.cmp_at(i, v).map_or(Ordering::Less, Ordering::reverse))
                    .is_ok();
                (mode == FilterMode::In) == found
            }
            (Operand::Pattern(_), _) => match (&self.regex, block.str_at(i)) {
                (Some(re), Some(s)) => re.is_match(s),
                _ => false,
            },
        }
    }

    /// Exact match of row `i` of a package
    #[must_use]
    pub fn match_at(&self, pkg: &Package, i: usize) -> bool {
        pkg.block(self.index).is_some_and(|b| self.match_value(b, i))
    }

    /// Bitmap of matching rows. When `mask` is given, only rows set in the
    /// mask are compared and all other bits stay clear.
    #[must_use]
    pub fn match_pack(&self, pkg: &Package, mask: Option<&Bitset>) -> Bitset {
        let mut bits = Bitset::new(pkg.len());
        let Some(block) = pkg.block(self.index) else {
            return bits;
        };
        match mask {
            Some(mask) => {
                for i in mask.iter() {
                    if self.match_value(block, i) {
                        bits.set(i);
                    }
                }
            }
            None => {
                for i in 0..pkg.len() {
                    if self.match_value(block, i) {
                        bits.set(i);
                    }
                }
            }
        }
        bits
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::Single(v) => write!(f, "{} {} {}", self.field, self.mode, v),
            Operand::Range(a, b) => write!(f, "{} {} [{}, {}]", self.field, self.mode, a, b),
            Operand::List(l) => write!(f, "{} {} [{} values]", self.field, self.mode, l.len()),
            Operand::Pattern(p) => write!(f, "{} {} {:?}", self.field, self.mode, p),
        }
    }
}

fn cmp(a: &Value, b: &Value) -> Ordering {
    a.compare(b).unwrap_or(Ordering::Equal)
}

fn eq(a: &Value, b: &Value) -> bool {
    cmp(a, b) == Ordering::Equal
}

fn lt(a: &Value, b: &Value) -> bool {
    cmp(a, b) == Ordering::Less
}

fn le(a: &Value, b: &Value) -> bool {
    cmp(a, b) != Ordering::Greater
}

fn contains(list: &[Value], v: &Value) -> bool {
    list.binary_search_by(|x| cmp(x, v)).is_ok()
}

/// Any value of the sorted list inside `[min, max]`
fn any_in_range(list: &[Value], min: &Value, max: &Value) -> bool {
    let i = list.partition_point(|x| lt(x, min));
    list.get(i).is_some_and(|x| le(x, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::Field;
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Field::primary("id"),
                Field::new("n", FieldType::Int64),
                Field::new("s", FieldType::String),
            ])
            .unwrap(),
        )
    }

    fn pack(ns: &[i64]) -> Package {
        let mut pkg = Package::new(schema(), 0, 64);
        for (i, &n) in ns.iter().enumerate() {
            pkg.push_row(&vec![Value::Uint64(i as u64 + 1), Value::Int64(n), format!("v{n}").into()])
                .unwrap();
        }
        pkg
    }

    fn compiled(mut c: Condition) -> Condition {
        c.compile(&schema()).unwrap();
        c
    }

    #[test]
    fn test_compile_checks_types() {
        let mut c = Condition::equal("n", 1u64);
        assert!(c.compile(&schema()).is_err());
        let mut c = Condition::equal("missing", 1i64);
        assert!(c.compile(&schema()).is_err());
        let mut c = Condition::regexp("n", "x");
        assert!(c.compile(&schema()).is_err());
        let mut c = Condition::regexp("s", "(");
        assert!(c.compile(&schema()).is_err());
    }

    #[test]
    fn test_row_modes() {
        let pkg = pack(&[1, 5, 9, 5]);
        let cases = vec![
            (Condition::equal("n", 5i64), vec![1, 3]),
            (Condition::not_equal("n", 5i64), vec![0, 2]),
            (Condition::gt("n", 5i64), vec![2]),
            (Condition::gte("n", 5i64), vec![1, 2, 3]),
            (Condition::lt("n", 5i64), vec![0]),
            (Condition::lte("n", 5i64), vec![0, 1, 3]),
            (Condition::range("n", 2i64, 9i64), vec![1, 2, 3]),
            (Condition::in_list("n", [9i64, 1]), vec![0, 2]),
            (Condition::not_in("n", [9i64, 1]), vec![1, 3]),
            (Condition::regexp("s", "^v[19]$"), vec![0, 2]),
        ];
        for (c, want) in cases {
            let c = compiled(c);
            assert_eq!(c.match_pack(&pkg, None).indexes(), want, "{c}");
        }
    }

    #[test]
    fn test_mask_limits_comparisons() {
        let pkg = pack(&[5, 5, 5]);
        let c = compiled(Condition::equal("n", 5i64));
        let mut mask = Bitset::new(3);
        mask.set(1);
        assert_eq!(c.match_pack(&pkg, Some(&mask)).indexes(), vec![1]);
    }

    #[test]
    fn test_zone_map() {
        let pkg = pack(&[3, 4, 7]);
        let info = PackInfo::from_package(&pkg);

        assert!(compiled(Condition::equal("n", 4i64)).maybe_match_pack(&info));
        assert!(!compiled(Condition::equal("n", 8i64)).maybe_match_pack(&info));
        assert!(!compiled(Condition::gt("n", 7i64)).maybe_match_pack(&info));
        assert!(compiled(Condition::gte("n", 7i64)).maybe_match_pack(&info));
        assert!(!compiled(Condition::lt("n", 3i64)).maybe_match_pack(&info));
        assert!(!compiled(Condition::range("n", 8i64, 10i64)).maybe_match_pack(&info));
        assert!(!compiled(Condition::in_list("n", [1i64, 2, 8])).maybe_match_pack(&info));
        assert!(compiled(Condition::in_list("n", [1i64, 5])).maybe_match_pack(&info));

        assert!(compiled(Condition::gte("n", 3i64)).matches_all(&info));
        assert!(compiled(Condition::range("n", 0i64, 7i64)).matches_all(&info));
        assert!(compiled(Condition::not_in("n", [1i64, 9])).matches_all(&info));
        assert!(!compiled(Condition::equal("n", 3i64)).matches_all(&info));

        let same = PackInfo::from_package(&pack(&[1, 1]));
        assert!(compiled(Condition::equal("n", 1i64)).matches_all(&same));
        assert!(!compiled(Condition::not_equal("n", 1i64)).maybe_match_pack(&same));
    }
}
