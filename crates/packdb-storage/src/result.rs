//! Query results

use std::sync::Arc;

use tracing::warn;

use packdb_common::types::{Record, Row, Schema, Value};

use crate::package::Package;

/// What a stream callback wants after seeing a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Continue,
    Stop,
}

/// Rows produced by a query, in result-schema order
#[derive(Debug, Clone)]
pub struct QueryResult {
    schema: Arc<Schema>,
    fields: Vec<usize>,
    rows: Vec<Row>,
}

impl QueryResult {
    /// Empty result whose rows take `fields` (table positions) from packs
    pub(crate) fn new(schema: Arc<Schema>, fields: Vec<usize>) -> Self {
        Self {
            schema,
            fields,
            rows: Vec::new(),
        }
    }

    /// Project row `i` of `pkg` onto the result columns
    pub(crate) fn project(fields: &[usize], pkg: &Package, i: usize) -> Row {
        fields
            .iter()
            .map(|&f| {
                pkg.value(f, i)
                    .unwrap_or_else(|| Value::zero(pkg.schema().field(f).typ))
            })
            .collect()
    }

    pub(crate) fn append(&mut self, pkg: &Package, i: usize) {
        self.rows.push(Self::project(&self.fields, pkg, i));
    }

    pub(crate) fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub(crate) fn sort_by_pk(&mut self) {
        let pk = self.schema.pk_index();
        self.rows
            .sort_by_key(|r| r.get(pk).and_then(Value::as_u64).unwrap_or(0));
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Primary keys in result order
    #[must_use]
    pub fn pks(&self) -> Vec<u64> {
        let pk = self.schema.pk_index();
        self.rows
            .iter()
            .filter_map(|r| r.get(pk).and_then(Value::as_u64))
            .collect()
    }

    /// All values of one result column, `None` for an unknown name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<Value>> {
        let i = self.schema.position(name)?;
        Some(self.rows.iter().map(|r| r[i].clone()).collect())
    }

    /// Decode rows into records. Rows that fail to decode are skipped.
    #[must_use]
    pub fn decode<R: Record>(&self) -> Vec<R> {
        self.rows
            .iter()
            .filter_map(|row| match R::from_row(row) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("Skipping undecodable row: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{get_i64, get_u64, Field, FieldType};
    use packdb_common::Result;

    struct Item {
        id: u64,
        n: i64,
    }

    impl Record for Item {
        fn schema() -> Schema {
            Schema::new(vec![Field::primary("id"), Field::new("n", FieldType::Int64)]).unwrap()
        }
        fn pk(&self) -> u64 {
            self.id
        }
        fn set_pk(&mut self, pk: u64) {
            self.id = pk;
        }
        fn to_row(&self) -> Row {
            vec![Value::Uint64(self.id), Value::Int64(self.n)]
        }
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: get_u64(row, 0)?,
                n: get_i64(row, 1)?,
            })
        }
    }

    #[test]
    fn test_decode_skips_bad_rows() {
        let schema = Arc::new(Item::schema());
        let mut res = QueryResult::new(schema, vec![0, 1]);
        res.push(vec![Value::Uint64(2), Value::Int64(20)]);
        res.push(vec![Value::Uint64(1), Value::String("bad".into())]);
        res.push(vec![Value::Uint64(3), Value::Int64(30)]);
        let items: Vec<Item> = res.decode();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].n, 30);
        assert_eq!(res.pks(), vec![2, 1, 3]);
        res.sort_by_pk();
        assert_eq!(res.pks(), vec![1, 2, 3]);
        assert_eq!(res.column("n").unwrap()[0], Value::String("bad".into()));
    }

    #[test]
    fn test_append_projects_columns() {
        let schema = Arc::new(Item::schema());
        let mut pkg = Package::new(Arc::clone(&schema), 0, 4);
        pkg.push_row(&vec![Value::Uint64(7), Value::Int64(-1)]).unwrap();
        let projected = Arc::new(schema.select(&[0]).unwrap());
        let mut res = QueryResult::new(projected, vec![0]);
        res.append(&pkg, 0);
        assert_eq!(res.rows(), &[vec![Value::Uint64(7)]]);
    }
}
