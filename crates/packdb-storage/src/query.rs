//! Query description and planning

use std::sync::Arc;

use packdb_common::error::Result;
use packdb_common::types::Schema;

use crate::condition::Condition;
use crate::tree::{ConditionTree, ConditionTreeNode};

/// Result order by primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// A filtered scan over one table
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Label used in logs and metrics
    pub name: String,
    pub tree: ConditionTree,
    pub order: SortOrder,
    /// Maximum number of rows, 0 = unlimited
    pub limit: usize,
    /// Rows to skip before the first result
    pub offset: usize,
    /// Result columns; empty selects all
    pub fields: Vec<String>,
    /// Do not populate the block cache with loaded blocks
    pub no_cache: bool,
    /// Do not consult secondary indexes
    pub no_index: bool,
}

impl Query {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// AND another predicate or subtree onto the filter
    #[must_use]
    pub fn and(mut self, node: impl Into<ConditionTreeNode>) -> Self {
        self.tree.push(node);
        self
    }

    /// AND a disjunction of predicates onto the filter
    #[must_use]
    pub fn or(mut self, conds: Vec<Condition>) -> Self {
        let nodes = conds.into_iter().map(ConditionTreeNode::Leaf).collect();
        self.tree.push(ConditionTreeNode::Or(nodes));
        self
    }

    #[must_use]
    pub fn with_tree(mut self, tree: ConditionTree) -> Self {
        self.tree = tree;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn desc(self) -> Self {
        self.with_order(SortOrder::Desc)
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    #[must_use]
    pub fn with_no_index(mut self, no_index: bool) -> Self {
        self.no_index = no_index;
        self
    }

    /// Resolve names against `schema` and derive the column sets.
    pub(crate) fn compile(&self, schema: &Schema) -> Result<QueryPlan> {
        let mut tree = self.tree.clone();
        tree.compile(schema)?;

        let pk = schema.pk_index();
        let (result_fields, result_schema) = if self.fields.is_empty() {
            ((0..schema.len()).collect::<Vec<_>>(), schema.clone())
        } else {
            let mut positions = Vec::with_capacity(self.fields.len());
            for name in &self.fields {
                let p = schema.resolve(name)?;
                if !positions.contains(&p) {
                    positions.push(p);
                }
            }
            let projected = schema.select(&positions)?;
            if !positions.contains(&pk) {
                positions.insert(0, pk);
            }
            (positions, projected)
        };

        let mut load_fields = result_fields.clone();
        load_fields.extend(tree.fields());
        load_fields.sort_unstable();
        load_fields.dedup();

        Ok(QueryPlan {
            name: self.name.clone(),
            tree,
            order: self.order,
            limit: self.limit,
            offset: self.offset,
            no_cache: self.no_cache,
            no_index: self.no_index,
            result_fields,
            load_fields,
            result_schema: Arc::new(result_schema),
        })
    }
}

/// A query compiled against a table schema
#[derive(Debug, Clone)]
pub(crate) struct QueryPlan {
    pub name: String,
    pub tree: ConditionTree,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
    pub no_cache: bool,
    pub no_index: bool,
    /// Table positions of the result columns, in output order
    pub result_fields: Vec<usize>,
    /// Table positions loaded from packs, ascending
    pub load_fields: Vec<usize>,
    pub result_schema: Arc<Schema>,
}

impl QueryPlan {
    /// Narrow the plan to primary keys only (count and delete)
    pub fn pk_only(mut self, schema: &Schema) -> Result<Self> {
        let pk = schema.pk_index();
        self.result_fields = vec![pk];
        self.result_schema = Arc::new(schema.select(&[pk])?);
        self.load_fields = self.tree.fields();
        self.load_fields.push(pk);
        self.load_fields.sort_unstable();
        self.load_fields.dedup();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{Field, FieldType};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("name", FieldType::String),
            Field::primary("id"),
            Field::new("n", FieldType::Int64),
            Field::new("flag", FieldType::Boolean),
        ])
        .unwrap()
    }

    #[test]
    fn test_projection_keeps_pk() {
        let q = Query::new("q")
            .and(Condition::gt("n", 1i64))
            .with_fields(["flag"]);
        let plan = q.compile(&schema()).unwrap();
        assert_eq!(plan.result_fields, vec![1, 3]);
        assert_eq!(plan.result_schema.len(), 2);
        assert_eq!(plan.result_schema.pk_index(), 0);
        assert_eq!(plan.load_fields, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_field_fails() {
        let q = Query::new("q").with_fields(["nope"]);
        assert!(q.compile(&schema()).is_err());
        let q = Query::new("q").and(Condition::equal("nope", 1i64));
        assert!(q.compile(&schema()).is_err());
    }

    #[test]
    fn test_pk_only() {
        let q = Query::new("q").or(vec![
            Condition::equal("n", 1i64),
            Condition::equal("flag", true),
        ]);
        let plan = q.compile(&schema()).unwrap().pk_only(&schema()).unwrap();
        assert_eq!(plan.result_fields, vec![1]);
        assert_eq!(plan.load_fields, vec![1, 2, 3]);
        assert_eq!(plan.tree.size(), 2);
    }
}
