//! Queries with journal overlay
//!
//! Pack rows come from the forward or reverse iterator; journal rows are
//! merged into the same pk order. A pk that also has a journal entry takes
//! the journal version, so every row is delivered exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use packdb_common::error::Result;
use packdb_common::metrics;
use packdb_common::types::{Record, Row};

use crate::index::query_indexes;
use crate::iterator::{LookupIterator, ScanIterator};
use crate::package::Package;
use crate::query::{Query, QueryPlan, SortOrder};
use crate::result::{QueryResult, StreamAction};

use super::{check_cancelled, Table, TableState, TableStats};

/// Offset and limit bookkeeping
struct Window {
    offset: usize,
    limit: usize,
    delivered: usize,
}

impl Window {
    fn new(plan: &QueryPlan) -> Self {
        Self {
            offset: plan.offset,
            limit: plan.limit,
            delivered: 0,
        }
    }

    fn offer<F>(&mut self, row: Row, emit: &mut F) -> Result<StreamAction>
    where
        F: FnMut(Row) -> Result<StreamAction>,
    {
        if self.offset > 0 {
            self.offset -= 1;
            return Ok(StreamAction::Continue);
        }
        self.delivered += 1;
        let action = emit(row)?;
        if action == StreamAction::Stop || (self.limit > 0 && self.delivered >= self.limit) {
            return Ok(StreamAction::Stop);
        }
        Ok(StreamAction::Continue)
    }

    fn is_full(&self) -> bool {
        self.limit > 0 && self.delivered >= self.limit
    }
}

/// Sorted, deduplicated non-zero pks
fn normalize_pks(pks: &[u64]) -> Vec<u64> {
    let mut pks: Vec<u64> = pks.iter().copied().filter(|&pk| pk > 0).collect();
    pks.sort_unstable();
    pks.dedup();
    pks
}

impl Table {
    /// Run `plan` over packs and journal, handing each result row to `emit`
    /// in pk order. Returns the number of rows delivered.
    pub(crate) fn scan_locked<F>(
        &self,
        ctx: &CancellationToken,
        state: &TableState,
        mut plan: QueryPlan,
        mut emit: F,
    ) -> Result<usize>
    where
        F: FnMut(Row) -> Result<StreamAction>,
    {
        let journal = &state.journal;
        let jdata = journal.data();
        let mut window = Window::new(&plan);
        if window.is_full() {
            return Ok(0);
        }

        // journal rows are matched before index rewrites mark leaves processed
        let mut jbits = plan.tree.match_pack(jdata, None);
        jbits.and_not(journal.deleted());

        let tx = self.store.begin(false);
        if !plan.no_index {
            let n = query_indexes(&tx, &mut plan.tree, &state.indexes, &self.schema)?;
            if n > 0 {
                debug!(table = %self.name, query = %plan.name, rewritten = n, "Using secondary indexes");
            }
        }

        let desc = plan.order == SortOrder::Desc;
        let jlist = if desc {
            journal.sorted_indexes_reversed(&jbits)
        } else {
            journal.sorted_indexes(&jbits)
        };
        let fields = &plan.result_fields;
        let mut jpos = 0;
        let mut stopped = false;

        if !plan.tree.no_match() {
            let mut it = if desc {
                ScanIterator::reverse(self, &state.packidx, &plan.tree, &plan.load_fields, ctx, plan.no_cache)
            } else {
                ScanIterator::forward(self, &state.packidx, &plan.tree, &plan.load_fields, ctx, plan.no_cache)
            };
            let (mut thint, mut jhint) = (0, 0);
            let mut last_pk = 0;

            'packs: while let Some((pkg, hits)) = it.next(&tx)? {
                for &hit in hits {
                    let i = hit as usize;
                    let pk = pkg.pk_at(i);

                    while let Some(e) = jlist.get(jpos) {
                        let before = if desc { e.pk > pk } else { e.pk < pk };
                        if !before {
                            break;
                        }
                        jpos += 1;
                        if jbits.is_set(e.idx) {
                            let row = QueryResult::project(fields, jdata, e.idx);
                            if window.offer(row, &mut emit)? == StreamAction::Stop {
                                stopped = true;
                                break 'packs;
                            }
                        }
                    }

                    if desc || pk < last_pk {
                        thint = 0;
                        jhint = 0;
                    }
                    last_pk = pk;

                    let (dead, t) = journal.is_deleted(pk, thint);
                    thint = t;
                    if dead {
                        continue;
                    }

                    // a journal version supersedes the pack row
                    let (slot, j) = journal.pk_index(pk, jhint);
                    jhint = j;
                    let row = match slot {
                        Some(slot) if jbits.is_set(slot) => {
                            jbits.clear(slot);
                            QueryResult::project(fields, jdata, slot)
                        }
                        Some(_) => continue,
                        None => QueryResult::project(fields, pkg, i),
                    };
                    if window.offer(row, &mut emit)? == StreamAction::Stop {
                        stopped = true;
                        break 'packs;
                    }
                }
            }
            let stats = it.stats();
            it.close();
            metrics::record_rows_scanned(stats.rows_matched as u64);
            debug!(
                table = %self.name,
                query = %plan.name,
                packs_loaded = stats.packs_loaded,
                packs_skipped = stats.packs_skipped,
                rows = stats.rows_matched,
                "Scanned packs"
            );
        }

        if !stopped {
            for e in &jlist[jpos..] {
                if !jbits.is_set(e.idx) {
                    continue;
                }
                let row = QueryResult::project(fields, jdata, e.idx);
                if window.offer(row, &mut emit)? == StreamAction::Stop {
                    break;
                }
            }
        }

        TableStats::add(&self.stats.queries, 1);
        Ok(window.delivered)
    }

    fn run_query<F>(&self, ctx: &CancellationToken, kind: &str, plan: QueryPlan, emit: F) -> Result<usize>
    where
        F: FnMut(Row) -> Result<StreamAction>,
    {
        let state = self.state.read();
        let result = self.scan_locked(ctx, &state, plan, emit);
        metrics::record_query(kind, result.is_ok());
        result
    }

    /// Rows matching `query` in the query's pk order.
    pub fn query(&self, ctx: &CancellationToken, query: &Query) -> Result<QueryResult> {
        check_cancelled(ctx)?;
        let plan = query.compile(&self.schema)?;
        let mut res = QueryResult::new(Arc::clone(&plan.result_schema), plan.result_fields.clone());
        self.run_query(ctx, "query", plan, |row| {
            res.push(row);
            Ok(StreamAction::Continue)
        })?;
        Ok(res)
    }

    /// Like [`Table::query`] in descending pk order.
    pub fn query_desc(&self, ctx: &CancellationToken, query: &Query) -> Result<QueryResult> {
        self.query(ctx, &query.clone().desc())
    }

    /// Number of rows matching `query`, after offset and limit.
    pub fn count(&self, ctx: &CancellationToken, query: &Query) -> Result<usize> {
        check_cancelled(ctx)?;
        let plan = query.compile(&self.schema)?.pk_only(&self.schema)?;
        self.run_query(ctx, "count", plan, |_| Ok(StreamAction::Continue))
    }

    /// Hand each matching row to `callback` until it returns
    /// [`StreamAction::Stop`] or an error, which is returned as is.
    /// Returns the number of rows delivered.
    pub fn stream<F>(&self, ctx: &CancellationToken, query: &Query, mut callback: F) -> Result<usize>
    where
        F: FnMut(&Row) -> Result<StreamAction>,
    {
        check_cancelled(ctx)?;
        let plan = query.compile(&self.schema)?;
        self.run_query(ctx, "stream", plan, |row| callback(&row))
    }

    /// Walk the rows of sorted, deduplicated `pks` in pk order, handing
    /// each to `emit` as a (pack, row) pair. Journal versions win over pack
    /// rows. Returns the number of rows delivered.
    fn lookup_locked<F>(
        &self,
        ctx: &CancellationToken,
        state: &TableState,
        pks: &[u64],
        fields: &[usize],
        mut emit: F,
    ) -> Result<usize>
    where
        F: FnMut(&Package, usize) -> Result<StreamAction>,
    {
        let journal = &state.journal;
        let jdata = journal.data();

        let mut jrows = Vec::new();
        let mut rest = Vec::new();
        let mut hint = 0;
        for &pk in pks {
            let (slot, h) = journal.pk_index(pk, hint);
            hint = h;
            match slot {
                Some(slot) if !journal.deleted().is_set(slot) => jrows.push((pk, slot)),
                Some(_) => {}
                None => rest.push(pk),
            }
        }

        let mut delivered = 0;
        let mut jpos = 0;
        let mut stopped = false;
        if !rest.is_empty() {
            let tx = self.store.begin(false);
            let mut it = LookupIterator::new(self, &state.packidx, &rest, fields, ctx, false);
            let mut thint = 0;
            let mut last_pk = 0;

            'packs: while let Some((pkg, hits)) = it.next(&tx)? {
                for &hit in hits {
                    let i = hit as usize;
                    let pk = pkg.pk_at(i);

                    while let Some(&(jpk, slot)) = jrows.get(jpos) {
                        if jpk > pk {
                            break;
                        }
                        jpos += 1;
                        delivered += 1;
                        if emit(jdata, slot)? == StreamAction::Stop {
                            stopped = true;
                            break 'packs;
                        }
                    }

                    if pk < last_pk {
                        thint = 0;
                    }
                    last_pk = pk;
                    let (dead, t) = journal.is_deleted(pk, thint);
                    thint = t;
                    if dead {
                        continue;
                    }
                    delivered += 1;
                    if emit(pkg, i)? == StreamAction::Stop {
                        stopped = true;
                        break 'packs;
                    }
                }
            }
            let stats = it.stats();
            it.close();
            metrics::record_rows_scanned(stats.rows_matched as u64);
            debug!(
                table = %self.name,
                pks = pks.len(),
                packs_loaded = stats.packs_loaded,
                packs_skipped = stats.packs_skipped,
                rows = stats.rows_matched,
                "Looked up packs"
            );
        }

        if !stopped {
            for &(_, slot) in &jrows[jpos..] {
                delivered += 1;
                if emit(jdata, slot)? == StreamAction::Stop {
                    break;
                }
            }
        }
        TableStats::add(&self.stats.lookups, pks.len());
        Ok(delivered)
    }

    /// Rows with the given primary keys, ascending. Unknown pks are ignored.
    pub fn lookup(&self, ctx: &CancellationToken, pks: &[u64]) -> Result<QueryResult> {
        check_cancelled(ctx)?;
        let pks = normalize_pks(pks);
        let fields: Vec<usize> = (0..self.schema.len()).collect();
        let mut res = QueryResult::new(Arc::clone(&self.schema), fields.clone());

        let state = self.state.read();
        let result = self.lookup_locked(ctx, &state, &pks, &fields, |pkg, i| {
            res.append(pkg, i);
            Ok(StreamAction::Continue)
        });
        metrics::record_query("lookup", result.is_ok());
        result?;

        res.sort_by_pk();
        Ok(res)
    }

    /// Hand the rows of [`Table::lookup`] to `callback` as packs are read,
    /// until it returns [`StreamAction::Stop`] or an error. Returns the
    /// number of rows delivered.
    pub fn stream_lookup<F>(&self, ctx: &CancellationToken, pks: &[u64], mut callback: F) -> Result<usize>
    where
        F: FnMut(&Row) -> Result<StreamAction>,
    {
        check_cancelled(ctx)?;
        let pks = normalize_pks(pks);
        let fields: Vec<usize> = (0..self.schema.len()).collect();

        let state = self.state.read();
        let result = self.lookup_locked(ctx, &state, &pks, &fields, |pkg, i| {
            callback(&QueryResult::project(&fields, pkg, i))
        });
        metrics::record_query("stream_lookup", result.is_ok());
        result
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Query typed records. Rows that fail to decode are skipped.
    pub fn query_records<R: Record>(&self, ctx: &CancellationToken, query: &Query) -> Result<Vec<R>> {
        self.check_record_schema::<R>()?;
        let query = Query {
            fields: Vec::new(),
            ..query.clone()
        };
        Ok(self.query(ctx, &query)?.decode())
    }

    /// Stream typed records. Rows that fail to decode are skipped.
    pub fn stream_records<R, F>(&self, ctx: &CancellationToken, query: &Query, mut callback: F) -> Result<usize>
    where
        R: Record,
        F: FnMut(R) -> Result<StreamAction>,
    {
        self.check_record_schema::<R>()?;
        let query = Query {
            fields: Vec::new(),
            ..query.clone()
        };
        let mut delivered = 0;
        self.stream(ctx, &query, |row| match R::from_row(row) {
            Ok(rec) => {
                delivered += 1;
                callback(rec)
            }
            Err(e) => {
                warn!(table = %self.name, error = %e, "Skipping undecodable row");
                Ok(StreamAction::Continue)
            }
        })?;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::store::Store;
    use packdb_common::config::TableOptions;
    use packdb_common::error::Error;
    use packdb_common::types::{Field, FieldType, IndexKind, Schema, Value};

    fn table() -> Table {
        let schema = Schema::new(vec![
            Field::primary("id"),
            Field::new("n", FieldType::Int64).with_index(IndexKind::Integer),
            Field::new("tag", FieldType::String).with_index(IndexKind::Hash),
        ])
        .unwrap();
        let opts = TableOptions::default().with_pack_size(4);
        Table::create(Store::temporary().unwrap(), "q", schema, opts).unwrap()
    }

    fn row(pk: u64, n: i64, tag: &str) -> Row {
        vec![Value::Uint64(pk), Value::Int64(n), tag.into()]
    }

    /// pks 1..=8 flushed into two packs, then 2 updated, 3 deleted and 9 added
    fn populated() -> Table {
        let t = table();
        let ctx = CancellationToken::new();
        let rows = (1..=8u64)
            .map(|pk| row(pk, i64::try_from(pk).unwrap(), if pk % 2 == 0 { "even" } else { "odd" }))
            .collect();
        t.insert(&ctx, rows).unwrap();
        t.flush(&ctx).unwrap();
        t.update(&ctx, vec![row(2, 20, "even")]).unwrap();
        t.delete_pks(&ctx, &[3]).unwrap();
        t.insert(&ctx, vec![row(9, 9, "odd")]).unwrap();
        t
    }

    #[test]
    fn test_overlay_delivers_each_pk_once() {
        let t = populated();
        let ctx = CancellationToken::new();
        let res = t.query(&ctx, &Query::new("all")).unwrap();
        assert_eq!(res.pks(), vec![1, 2, 4, 5, 6, 7, 8, 9]);
        assert_eq!(res.rows()[1][1], Value::Int64(20));

        let res = t.query_desc(&ctx, &Query::new("all")).unwrap();
        assert_eq!(res.pks(), vec![9, 8, 7, 6, 5, 4, 2, 1]);
    }

    #[test]
    fn test_journal_version_decides_match() {
        let t = populated();
        let ctx = CancellationToken::new();
        // pack row of pk 2 has n = 2 but the journal says 20
        let q = Query::new("small").and(Condition::lt("n", 3i64));
        assert_eq!(t.query(&ctx, &q).unwrap().pks(), vec![1]);
        let q = Query::new("big").and(Condition::gte("n", 9i64));
        assert_eq!(t.query(&ctx, &q).unwrap().pks(), vec![2, 9]);
    }

    #[test]
    fn test_offset_limit_and_projection() {
        let t = populated();
        let ctx = CancellationToken::new();
        let q = Query::new("page")
            .with_offset(2)
            .with_limit(3)
            .with_fields(["tag"]);
        let res = t.query(&ctx, &q).unwrap();
        assert_eq!(res.len(), 3);
        assert_eq!(res.schema().len(), 2);
        assert_eq!(res.column("tag").unwrap()[0], Value::String("even".into()));

        let q = Query::new("page").desc().with_offset(1).with_limit(2);
        assert_eq!(t.query(&ctx, &q).unwrap().pks(), vec![8, 7]);
        assert_eq!(t.count(&ctx, &q).unwrap(), 2);
    }

    #[test]
    fn test_index_queries_match_full_scan() {
        let t = populated();
        let ctx = CancellationToken::new();
        t.flush(&ctx).unwrap();
        for q in [
            Query::new("int").and(Condition::equal("n", 20i64)),
            Query::new("hash").and(Condition::equal("tag", "odd")),
            Query::new("in").and(Condition::in_list("n", [1i64, 5, 7])),
            Query::new("miss").and(Condition::equal("n", 1000i64)),
            Query::new("or").or(vec![Condition::equal("n", 4i64), Condition::equal("tag", "even")]),
        ] {
            let indexed = t.query(&ctx, &q).unwrap().pks();
            let scanned = t.query(&ctx, &q.clone().with_no_index(true)).unwrap().pks();
            assert_eq!(indexed, scanned, "query {}", q.name);
        }
        let q = Query::new("hash").and(Condition::equal("tag", "odd"));
        assert_eq!(t.query(&ctx, &q).unwrap().pks(), vec![1, 5, 7, 9]);
    }

    #[test]
    fn test_stream_stop_and_error() {
        let t = populated();
        let ctx = CancellationToken::new();
        let mut seen = Vec::new();
        let n = t
            .stream(&ctx, &Query::new("all"), |row| {
                seen.push(row[0].clone());
                Ok(if seen.len() == 3 {
                    StreamAction::Stop
                } else {
                    StreamAction::Continue
                })
            })
            .unwrap();
        assert_eq!(n, 3);

        let err = t
            .stream(&ctx, &Query::new("all"), |_| Err(Error::Internal("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_lookup_overlays_journal() {
        let t = populated();
        let ctx = CancellationToken::new();
        let res = t.lookup(&ctx, &[9, 3, 2, 1, 42, 2]).unwrap();
        assert_eq!(res.pks(), vec![1, 2, 9]);
        assert_eq!(res.rows()[1][1], Value::Int64(20));

        let mut n = 0;
        t.stream_lookup(&ctx, &[1, 2, 9], |_| {
            n += 1;
            Ok(StreamAction::Stop)
        })
        .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_stream_lookup_merges_journal_in_pk_order() {
        let t = populated();
        let ctx = CancellationToken::new();
        let mut seen = Vec::new();
        let n = t
            .stream_lookup(&ctx, &[9, 5, 3, 2, 1], |row| {
                seen.push((row[0].clone(), row[1].clone()));
                Ok(StreamAction::Continue)
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            seen,
            vec![
                (Value::Uint64(1), Value::Int64(1)),
                (Value::Uint64(2), Value::Int64(20)),
                (Value::Uint64(5), Value::Int64(5)),
                (Value::Uint64(9), Value::Int64(9)),
            ]
        );
        assert_eq!(t.stats().lookups, 5);
    }

    #[test]
    fn test_stream_lookup_checks_cancellation_per_pack() {
        let t = populated();
        let ctx = CancellationToken::new();
        let mut seen = 0;
        let err = t
            .stream_lookup(&ctx, &[1, 5], |_| {
                seen += 1;
                ctx.cancel();
                Ok(StreamAction::Continue)
            })
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_cancelled_scan() {
        let t = populated();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(t.query(&ctx, &Query::new("all")).unwrap_err().is_cancelled());
    }
}
