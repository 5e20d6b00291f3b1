//! Persistence gateway: transaction-scoped upserts and filtered reads over
//! named tables of JSON rows keyed by string.
//!
//! Every write of a cycle goes through one [`Transaction`]; nothing becomes
//! visible to readers until [`Transaction::commit`] succeeds.

pub mod filter;
pub mod memory;

pub use filter::{Condition, Filter, Page, SortOrder};
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Raw rows returned by [`Transaction::find`]; `total` ignores paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindResult {
    pub rows: Vec<Value>,
    pub total: usize,
}

/// Opens transactions against the backing store.
pub trait PersistenceGateway: Send + Sync {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>>;
}

/// One unit of work. Methods take `&self` so concurrent units of a cycle can
/// share the same handle.
pub trait Transaction: Send + Sync {
    fn upsert<'a>(&'a self, table: &'static str, rows: Vec<(String, Value)>)
        -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, table: &'static str, key: &'a str) -> StoreFuture<'a, Option<Value>>;

    fn find<'a>(
        &'a self,
        table: &'static str,
        filter: &'a Filter,
        page: &'a Page,
    ) -> StoreFuture<'a, FindResult>;

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// A row type stored in a [`Table`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    fn key(&self) -> String;
}

/// Typed handle that maps a table name to its row type.
pub struct Table<T> {
    name: &'static str,
    _row: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Table<T> {}

impl<T> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Table").field(&self.name).finish()
    }
}

/// Typed page of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Found<T> {
    pub rows: Vec<T>,
    pub total: usize,
}

impl<T: Record> Table<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _row: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn upsert(&self, tx: &dyn Transaction, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let encoded = rows
            .iter()
            .map(|row| {
                serde_json::to_value(row)
                    .map(|value| (row.key(), value))
                    .with_context(|| format!("failed to encode {} row", self.name))
            })
            .collect::<Result<Vec<_>>>()?;
        tx.upsert(self.name, encoded).await
    }

    pub async fn get(&self, tx: &dyn Transaction, key: &str) -> Result<Option<T>> {
        tx.get(self.name, key)
            .await?
            .map(|value| self.decode(value))
            .transpose()
    }

    pub async fn find(&self, tx: &dyn Transaction, filter: &Filter, page: &Page) -> Result<Found<T>> {
        let FindResult { rows, total } = tx.find(self.name, filter, page).await?;
        let rows = rows
            .into_iter()
            .map(|value| self.decode(value))
            .collect::<Result<Vec<_>>>()?;
        Ok(Found { rows, total })
    }

    /// Every row matching `filter`, unpaged.
    pub async fn find_all(&self, tx: &dyn Transaction, filter: &Filter) -> Result<Vec<T>> {
        Ok(self.find(tx, filter, &Page::all()).await?.rows)
    }

    fn decode(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).with_context(|| format!("failed to decode {} row", self.name))
    }
}
