//! Insert, update and delete
//!
//! Mutations stage rows in the journal under the write lock. Batches are
//! cut to the journal's free room; whenever the journal crosses its size
//! threshold it is flushed before staging continues.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use packdb_common::error::{Error, Result};
use packdb_common::types::{Record, Row};

use crate::query::Query;
use crate::result::StreamAction;

use super::{check_cancelled, Table, TableState, TableStats};

impl Table {
    /// Stage new rows. Rows with pk 0 get the next sequence value; rows
    /// with an explicit pk replace any existing version. Returns the pks
    /// in input order.
    pub fn insert(&self, ctx: &CancellationToken, rows: Vec<Row>) -> Result<Vec<u64>> {
        check_cancelled(ctx)?;
        for row in &rows {
            self.schema.check_row(row)?;
        }
        let n = rows.len();
        let mut state = self.state.write();
        let mut pks = Vec::with_capacity(n);
        self.staged(ctx, &mut state, rows, |state, chunk| {
            pks.extend(state.journal.insert_batch(chunk)?);
            Ok(())
        })?;
        TableStats::add(&self.stats.inserted, n);
        debug!(table = %self.name, rows = n, "Inserted rows");
        Ok(pks)
    }

    /// Stage new versions of existing rows. Every row needs a non-zero pk.
    pub fn update(&self, ctx: &CancellationToken, rows: Vec<Row>) -> Result<usize> {
        check_cancelled(ctx)?;
        for row in &rows {
            self.schema.check_row(row)?;
        }
        let n = rows.len();
        let mut state = self.state.write();
        self.staged(ctx, &mut state, rows, |state, chunk| {
            state.journal.update_batch(chunk).map(|_| ())
        })?;
        TableStats::add(&self.stats.updated, n);
        debug!(table = %self.name, rows = n, "Updated rows");
        Ok(n)
    }

    /// Delete rows by primary key. Returns the number of pks affected.
    pub fn delete_pks(&self, ctx: &CancellationToken, pks: &[u64]) -> Result<usize> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        self.delete_locked(ctx, &mut state, pks)
    }

    /// Delete every row matching `query`.
    pub fn delete(&self, ctx: &CancellationToken, query: &Query) -> Result<usize> {
        check_cancelled(ctx)?;
        let plan = query.compile(&self.schema)?.pk_only(&self.schema)?;
        let mut state = self.state.write();
        let mut pks = Vec::new();
        self.scan_locked(ctx, &state, plan, |row| {
            if let Some(pk) = row.first().and_then(|v| v.as_u64()) {
                pks.push(pk);
            }
            Ok(StreamAction::Continue)
        })?;
        self.delete_locked(ctx, &mut state, &pks)
    }

    fn delete_locked(&self, ctx: &CancellationToken, state: &mut TableState, pks: &[u64]) -> Result<usize> {
        let mut count = 0;
        let mut rest = pks;
        while !rest.is_empty() {
            let take = state.journal.free().max(1).min(rest.len());
            let (chunk, tail) = rest.split_at(take);
            let (_, flushed_max) = state.packidx.global_min_max();
            count += state.journal.delete_batch(chunk, flushed_max)?;
            rest = tail;
            if state.journal.should_flush() {
                self.flush_locked(ctx, state)?;
            }
        }
        TableStats::add(&self.stats.deleted, count);
        debug!(table = %self.name, rows = count, "Deleted rows");
        Ok(count)
    }

    /// Feed `rows` to `apply` in chunks that fit the journal, flushing
    /// whenever it fills up.
    fn staged<F>(&self, ctx: &CancellationToken, state: &mut TableState, mut rows: Vec<Row>, mut apply: F) -> Result<()>
    where
        F: FnMut(&mut TableState, Vec<Row>) -> Result<()>,
    {
        while !rows.is_empty() {
            let take = state.journal.free().max(1).min(rows.len());
            let tail = rows.split_off(take);
            apply(state, rows)?;
            rows = tail;
            if state.journal.should_flush() {
                self.flush_locked(ctx, state)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Insert typed records, writing the assigned pks back.
    pub fn insert_records<R: Record>(&self, ctx: &CancellationToken, records: &mut [R]) -> Result<Vec<u64>> {
        self.check_record_schema::<R>()?;
        let rows = records.iter().map(Record::to_row).collect();
        let pks = self.insert(ctx, rows)?;
        for (r, &pk) in records.iter_mut().zip(&pks) {
            r.set_pk(pk);
        }
        Ok(pks)
    }

    /// Store new versions of typed records.
    pub fn update_records<R: Record>(&self, ctx: &CancellationToken, records: &[R]) -> Result<usize> {
        self.check_record_schema::<R>()?;
        self.update(ctx, records.iter().map(Record::to_row).collect())
    }

    pub(crate) fn check_record_schema<R: Record>(&self) -> Result<()> {
        let theirs = R::schema();
        let matches = theirs.len() == self.schema.len()
            && theirs
                .fields()
                .iter()
                .zip(self.schema.fields())
                .all(|(a, b)| a.name == b.name && a.typ == b.typ && a.primary == b.primary);
        if matches {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "table {}: record schema does not match table schema",
                self.name
            )))
        }
    }
}
