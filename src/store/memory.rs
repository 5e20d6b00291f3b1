use super::filter::{compare, field_of, SortOrder};
use super::{Filter, FindResult, Page, PersistenceGateway, StoreFuture, Transaction};
use anyhow::{bail, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

type Rows = BTreeMap<String, Value>;
type Tables = BTreeMap<String, Rows>;

/// In-process gateway with snapshot isolation.
///
/// `begin` copies the committed tables; `commit` publishes only the tables the
/// transaction wrote to. Dropping a transaction without committing discards it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Arc<Mutex<Tables>>,
    failing_tables: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of every table.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.committed.lock().await.clone()
    }

    pub async fn committed_rows(&self, table: &str) -> Rows {
        self.committed
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes every later upsert into `table` fail until [`MemoryStore::clear_failures`].
    pub async fn fail_writes_to(&self, table: &str) {
        self.failing_tables.lock().await.insert(table.to_owned());
    }

    pub async fn clear_failures(&self) {
        self.failing_tables.lock().await.clear();
    }
}

impl PersistenceGateway for MemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(async move {
            let working = self.committed.lock().await.clone();
            let tx: Box<dyn Transaction> = Box::new(MemoryTransaction {
                committed: Arc::clone(&self.committed),
                failing_tables: Arc::clone(&self.failing_tables),
                state: Mutex::new(WorkingSet {
                    tables: working,
                    dirty: BTreeSet::new(),
                }),
            });
            Ok(tx)
        })
    }
}

#[derive(Debug)]
struct WorkingSet {
    tables: Tables,
    dirty: BTreeSet<String>,
}

#[derive(Debug)]
struct MemoryTransaction {
    committed: Arc<Mutex<Tables>>,
    failing_tables: Arc<Mutex<BTreeSet<String>>>,
    state: Mutex<WorkingSet>,
}

impl Transaction for MemoryTransaction {
    fn upsert<'a>(
        &'a self,
        table: &'static str,
        rows: Vec<(String, Value)>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.failing_tables.lock().await.contains(table) {
                bail!("write to table {table} rejected");
            }
            let mut state = self.state.lock().await;
            let target = state.tables.entry(table.to_owned()).or_default();
            for (key, row) in rows {
                target.insert(key, row);
            }
            state.dirty.insert(table.to_owned());
            Ok(())
        })
    }

    fn get<'a>(&'a self, table: &'static str, key: &'a str) -> StoreFuture<'a, Option<Value>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.tables.get(table).and_then(|rows| rows.get(key)).cloned())
        })
    }

    fn find<'a>(
        &'a self,
        table: &'static str,
        filter: &'a Filter,
        page: &'a Page,
    ) -> StoreFuture<'a, FindResult> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut rows: Vec<Value> = state
                .tables
                .get(table)
                .map(|rows| {
                    rows.values()
                        .filter(|row| filter.matches(row))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            drop(state);

            if let Some((field, order)) = &page.order_by {
                rows.sort_by(|a, b| {
                    let ordering = sort_key_cmp(field_of(a, field), field_of(b, field));
                    match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
            }

            let total = rows.len();
            let rows = rows
                .into_iter()
                .skip(page.offset)
                .take(page.limit.unwrap_or(usize::MAX))
                .collect();
            Ok(FindResult { rows, total })
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let this = *self;
            let WorkingSet { mut tables, dirty } = this.state.into_inner();
            let mut committed = this.committed.lock().await;
            for name in dirty {
                if let Some(rows) = tables.remove(&name) {
                    committed.insert(name, rows);
                }
            }
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move { Ok(()) })
    }
}

fn sort_key_cmp(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
