//! AND/OR condition trees
//!
//! The root of a [`ConditionTree`] is always a list of nodes combined with
//! AND, so a lone predicate is a one-element list and index planning can
//! prepend rewritten predicates without inspecting the root's shape.
//!
//! Matching has two phases. `maybe_match_pack` prunes packs from zone maps
//! and never rejects a pack that holds a match. `match_pack` computes the
//! exact row bitmap; when pack statistics are supplied, leaves that the zone
//! map proves true for the whole pack are skipped and leaves proven false
//! short-circuit. Journal data is matched without statistics.
//!
//! Leaves flagged `processed` were answered by an index lookup whose
//! equivalent pk IN-list sits in the same child list, so they are skipped
//! in both AND and OR context.

use packdb_common::error::Result;
use packdb_common::types::Schema;

use crate::bitset::Bitset;
use crate::condition::Condition;
use crate::info::PackInfo;
use crate::package::Package;

/// A node of the condition tree
#[derive(Debug, Clone)]
pub enum ConditionTreeNode {
    Leaf(Condition),
    And(Vec<ConditionTreeNode>),
    Or(Vec<ConditionTreeNode>),
}

impl From<Condition> for ConditionTreeNode {
    fn from(c: Condition) -> Self {
        ConditionTreeNode::Leaf(c)
    }
}

/// Root of a filter: children combined with AND
#[derive(Debug, Clone, Default)]
pub struct ConditionTree {
    pub children: Vec<ConditionTreeNode>,
}

impl ConditionTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// AND of the given nodes
    #[must_use]
    pub fn all(children: Vec<ConditionTreeNode>) -> Self {
        Self { children }
    }

    /// OR of the given nodes, wrapped into the AND root
    #[must_use]
    pub fn any(children: Vec<ConditionTreeNode>) -> Self {
        Self {
            children: vec![ConditionTreeNode::Or(children)],
        }
    }

    /// Add a node to the AND root
    #[must_use]
    pub fn and(mut self, node: impl Into<ConditionTreeNode>) -> Self {
        self.children.push(node.into());
        self
    }

    pub fn push(&mut self, node: impl Into<ConditionTreeNode>) {
        self.children.push(node.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of leaves
    #[must_use]
    pub fn size(&self) -> usize {
        self.children.iter().map(ConditionTreeNode::size).sum()
    }

    /// Resolve field names and validate operands of every leaf
    pub fn compile(&mut self, schema: &Schema) -> Result<()> {
        for child in &mut self.children {
            child.compile(schema)?;
        }
        Ok(())
    }

    /// Distinct field positions referenced by leaves, ascending
    #[must_use]
    pub fn fields(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_fields(&mut out);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// True when an AND-level leaf is known to match nothing
    #[must_use]
    pub fn no_match(&self) -> bool {
        self.children
            .iter()
            .any(|c| matches!(c, ConditionTreeNode::Leaf(c) if c.nomatch))
    }

    /// Zone-map pruning. Empty trees accept every non-empty pack.
    #[must_use]
    pub fn maybe_match_pack(&self, info: &PackInfo) -> bool {
        if info.n_values == 0 {
            return false;
        }
        maybe_match_and(&self.children, info)
    }

    /// Exact row bitmap of `pkg`; `info` enables zone-map shortcuts.
    #[must_use]
    pub fn match_pack(&self, pkg: &Package, info: Option<&PackInfo>) -> Bitset {
        match_and(&self.children, pkg, info, None)
    }

    /// Exact match of a single row
    #[must_use]
    pub fn match_at(&self, pkg: &Package, i: usize) -> bool {
        match_at_and(&self.children, pkg, i)
    }
}

impl ConditionTreeNode {
    #[must_use]
    pub fn and(children: Vec<ConditionTreeNode>) -> Self {
        ConditionTreeNode::And(children)
    }

    #[must_use]
    pub fn or(children: Vec<ConditionTreeNode>) -> Self {
        ConditionTreeNode::Or(children)
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, ConditionTreeNode::Leaf(_))
    }

    fn size(&self) -> usize {
        match self {
            ConditionTreeNode::Leaf(_) => 1,
            ConditionTreeNode::And(c) | ConditionTreeNode::Or(c) => c.iter().map(Self::size).sum(),
        }
    }

    fn compile(&mut self, schema: &Schema) -> Result<()> {
        match self {
            ConditionTreeNode::Leaf(c) => c.compile(schema),
            ConditionTreeNode::And(children) | ConditionTreeNode::Or(children) => {
                for child in children {
                    child.compile(schema)?;
                }
                Ok(())
            }
        }
    }

    fn collect_fields(&self, out: &mut Vec<usize>) {
        match self {
            ConditionTreeNode::Leaf(c) => out.push(c.field_index()),
            ConditionTreeNode::And(children) | ConditionTreeNode::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
        }
    }

    #[must_use]
    pub fn maybe_match_pack(&self, info: &PackInfo) -> bool {
        match self {
            ConditionTreeNode::Leaf(c) => c.processed || c.maybe_match_pack(info),
            ConditionTreeNode::And(children) => maybe_match_and(children, info),
            ConditionTreeNode::Or(children) => maybe_match_or(children, info),
        }
    }

    /// Row bitmap restricted to `mask` (all rows when `None`)
    #[must_use]
    pub fn match_pack(&self, pkg: &Package, info: Option<&PackInfo>, mask: Option<&Bitset>) -> Bitset {
        match self {
            ConditionTreeNode::Leaf(c) => c.match_pack(pkg, mask),
            ConditionTreeNode::And(children) => match_and(children, pkg, info, mask),
            ConditionTreeNode::Or(children) => match_or(children, pkg, info, mask),
        }
    }

    #[must_use]
    pub fn match_at(&self, pkg: &Package, i: usize) -> bool {
        match self {
            ConditionTreeNode::Leaf(c) => c.match_at(pkg, i),
            ConditionTreeNode::And(children) => match_at_and(children, pkg, i),
            ConditionTreeNode::Or(children) => match_at_or(children, pkg, i),
        }
    }
}

fn is_processed(node: &ConditionTreeNode) -> bool {
    matches!(node, ConditionTreeNode::Leaf(c) if c.processed)
}

fn maybe_match_and(children: &[ConditionTreeNode], info: &PackInfo) -> bool {
    children.iter().all(|c| c.maybe_match_pack(info))
}

fn maybe_match_or(children: &[ConditionTreeNode], info: &PackInfo) -> bool {
    let mut active = children.iter().filter(|c| !is_processed(c)).peekable();
    if active.peek().is_none() {
        return true;
    }
    active.any(|c| c.maybe_match_pack(info))
}

fn start_bits(pkg: &Package, mask: Option<&Bitset>) -> Bitset {
    mask.map_or_else(|| Bitset::ones(pkg.len()), Bitset::clone)
}

fn match_and(
    children: &[ConditionTreeNode],
    pkg: &Package,
    info: Option<&PackInfo>,
    mask: Option<&Bitset>,
) -> Bitset {
    let mut bits = start_bits(pkg, mask);
    for child in children {
        if bits.is_empty() {
            break;
        }
        if let ConditionTreeNode::Leaf(c) = child {
            if c.processed {
                continue;
            }
            if let Some(info) = info {
                if c.matches_all(info) {
                    continue;
                }
                if !c.maybe_match_pack(info) {
                    return Bitset::new(pkg.len());
                }
            }
        }
        let hits = child.match_pack(pkg, info, Some(&bits));
        bits.and(&hits);
    }
    bits
}

fn match_or(
    children: &[ConditionTreeNode],
    pkg: &Package,
    info: Option<&PackInfo>,
    mask: Option<&Bitset>,
) -> Bitset {
    let scope = start_bits(pkg, mask);
    if children.iter().all(is_processed) {
        return scope;
    }
    let mut bits = Bitset::new(pkg.len());
    for child in children {
        if let ConditionTreeNode::Leaf(c) = child {
            if c.processed {
                continue;
            }
            if let Some(info) = info {
                if c.matches_all(info) {
                    return scope;
                }
                if !c.maybe_match_pack(info) {
                    continue;
                }
            }
        }
        let mut rest = scope.clone();
        rest.and_not(&bits);
        let hits = child.match_pack(pkg, info, Some(&rest));
        bits.or(&hits);
        if bits.count() == scope.count() {
            break;
        }
    }
    bits
}

fn match_at_and(children: &[ConditionTreeNode], pkg: &Package, i: usize) -> bool {
    children
        .iter()
        .filter(|c| !is_processed(c))
        .all(|c| c.match_at(pkg, i))
}

fn match_at_or(children: &[ConditionTreeNode], pkg: &Package, i: usize) -> bool {
    let mut active = children.iter().filter(|c| !is_processed(c)).peekable();
    if active.peek().is_none() {
        return true;
    }
    active.any(|c| c.match_at(pkg, i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{Field, FieldType, Value};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Field::primary("id"),
                Field::new("a", FieldType::Int64),
                Field::new("b", FieldType::Int64),
                Field::new("c", FieldType::Int64),
            ])
            .unwrap(),
        )
    }

    fn pack(rows: &[(i64, i64, i64)]) -> Package {
        let mut pkg = Package::new(schema(), 0, 1024);
        for (i, &(a, b, c)) in rows.iter().enumerate() {
            pkg.push_row(&vec![
                Value::Uint64(i as u64 + 1),
                Value::Int64(a),
                Value::Int64(b),
                Value::Int64(c),
            ])
            .unwrap();
        }
        pkg
    }

    fn brute_force(tree: &ConditionTree, pkg: &Package) -> Vec<usize> {
        (0..pkg.len()).filter(|&i| tree.match_at(pkg, i)).collect()
    }

    #[test]
    fn test_empty_tree() {
        let pkg = pack(&[(1, 1, 1), (2, 2, 2)]);
        let info = PackInfo::from_package(&pkg);
        let tree = ConditionTree::new();
        assert!(tree.maybe_match_pack(&info));
        assert!(tree.match_pack(&pkg, Some(&info)).is_full());

        let empty = PackInfo::from_package(&pack(&[]));
        assert!(!tree.maybe_match_pack(&empty));
    }

    #[test]
    fn test_and_skips_leaf_proven_by_zone_map() {
        let rows = [(1, 1, 0), (1, 0, 1), (1, 0, 0), (1, 1, 1)];
        let full = pack(&rows);
        let info = PackInfo::from_package(&full);

        let mut tree = ConditionTree::new()
            .and(Condition::equal("a", 1i64))
            .and(ConditionTreeNode::or(vec![
                Condition::equal("b", 1i64).into(),
                Condition::equal("c", 1i64).into(),
            ]));
        tree.compile(&schema()).unwrap();

        let expected = tree.match_pack(&full, None);
        assert_eq!(expected.indexes(), vec![0, 1, 3]);

        // Without column `a` loaded, a per-row comparison on the A leaf
        // would match nothing; the zone map must short-cut it instead.
        let blocks = vec![
            full.block_arc(0).cloned(),
            None,
            full.block_arc(2).cloned(),
            full.block_arc(3).cloned(),
        ];
        let partial = Package::from_blocks(schema(), 0, 1024, full.len(), blocks).unwrap();
        assert_eq!(tree.match_pack(&partial, Some(&info)), expected);
    }

    #[test]
    fn test_or_always_true_leaf_returns_full() {
        let pkg = pack(&[(5, 0, 0), (5, 1, 0)]);
        let info = PackInfo::from_package(&pkg);
        let mut tree = ConditionTree::any(vec![
            Condition::equal("b", 7i64).into(),
            Condition::gte("a", 5i64).into(),
        ]);
        tree.compile(&schema()).unwrap();
        assert!(tree.match_pack(&pkg, Some(&info)).is_full());
    }

    #[test]
    fn test_processed_leaf_is_skipped() {
        let pkg = pack(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let mut leaf = Condition::equal("a", 9i64);
        leaf.processed = true;
        let mut tree = ConditionTree::new()
            .and(Condition::in_list("id", [1u64, 3]))
            .and(leaf);
        tree.compile(&schema()).unwrap();
        assert_eq!(tree.match_pack(&pkg, None).indexes(), vec![0, 2]);
        assert_eq!(brute_force(&tree, &pkg), vec![0, 2]);
    }

    #[test]
    fn test_fields_and_size() {
        let tree = ConditionTree::new()
            .and(Condition::equal("c", 1i64))
            .and(ConditionTreeNode::or(vec![
                Condition::equal("a", 1i64).into(),
                Condition::equal("c", 2i64).into(),
            ]));
        let mut tree = tree;
        tree.compile(&schema()).unwrap();
        assert_eq!(tree.fields(), vec![1, 3]);
        assert_eq!(tree.size(), 3);
    }

    fn leaf_strategy() -> impl Strategy<Value = Condition> {
        let field = prop_oneof![Just("a"), Just("b"), Just("c")];
        (field, 0i64..8, 0i64..8, 0usize..6).prop_map(|(f, x, y, mode)| match mode {
            0 => Condition::equal(f, x),
            1 => Condition::not_equal(f, x),
            2 => Condition::gt(f, x),
            3 => Condition::lte(f, x),
            4 => Condition::range(f, x.min(y), x.max(y)),
            _ => Condition::in_list(f, [x, y]),
        })
    }

    fn node_strategy() -> impl Strategy<Value = ConditionTreeNode> {
        let leaf = leaf_strategy().prop_map(ConditionTreeNode::Leaf);
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(ConditionTreeNode::And),
                prop::collection::vec(inner, 1..4).prop_map(ConditionTreeNode::Or),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_bitmap_matches_row_semantics(
            rows in prop::collection::vec((0i64..8, 0i64..8, 0i64..8), 1..40),
            nodes in prop::collection::vec(node_strategy(), 1..4),
        ) {
            let pkg = pack(&rows);
            let info = PackInfo::from_package(&pkg);
            let mut tree = ConditionTree::all(nodes);
            tree.compile(&schema()).unwrap();

            let expected = brute_force(&tree, &pkg);
            prop_assert_eq!(tree.match_pack(&pkg, None).indexes(), expected.clone());
            prop_assert_eq!(tree.match_pack(&pkg, Some(&info)).indexes(), expected.clone());

            // no false negatives from zone-map pruning
            if !expected.is_empty() {
                prop_assert!(tree.maybe_match_pack(&info));
            }
        }
    }
}
