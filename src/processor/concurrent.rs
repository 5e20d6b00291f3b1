//! Tag-keyed bounded concurrency for the units of work of one cycle.
//!
//! Units are futures polled cooperatively by the task that owns the group, so
//! they may borrow cycle-scoped state such as the open transaction. A tag's
//! lane lives until it is drained.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;

/// Outcome of a tolerant drain.
#[derive(Debug)]
pub struct Drained<T> {
    pub outputs: Vec<T>,
    pub failures: Vec<anyhow::Error>,
}

struct Lane<'a, T> {
    in_flight: FuturesUnordered<BoxFuture<'a, Result<T>>>,
    outputs: Vec<T>,
    failures: Vec<anyhow::Error>,
    peak: usize,
}

impl<'a, T> Lane<'a, T> {
    fn new() -> Self {
        Self {
            in_flight: FuturesUnordered::new(),
            outputs: Vec::new(),
            failures: Vec::new(),
            peak: 0,
        }
    }

    fn settle(&mut self, result: Result<T>) {
        match result {
            Ok(value) => self.outputs.push(value),
            Err(err) => self.failures.push(err),
        }
    }

    async fn finish(mut self) -> Drained<T> {
        while let Some(result) = self.in_flight.next().await {
            self.settle(result);
        }
        Drained {
            outputs: self.outputs,
            failures: self.failures,
        }
    }
}

/// Registry of named lanes, each capping how many of its units are in flight.
pub struct ConcurrencyGroup<'a, T = ()> {
    lanes: HashMap<&'static str, Lane<'a, T>>,
}

impl<'a, T: Send + 'a> Default for ConcurrencyGroup<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Send + 'a> ConcurrencyGroup<'a, T> {
    pub fn new() -> Self {
        Self {
            lanes: HashMap::new(),
        }
    }

    /// Admits `work` under `tag`, first waiting (and driving the lane) until
    /// fewer than `limit` of its units are in flight.
    pub async fn run<F>(&mut self, tag: &'static str, limit: usize, work: F)
    where
        F: Future<Output = Result<T>> + Send + 'a,
    {
        let limit = limit.max(1);
        let lane = self.lanes.entry(tag).or_insert_with(Lane::new);
        while lane.in_flight.len() >= limit {
            match lane.in_flight.next().await {
                Some(result) => lane.settle(result),
                None => break,
            }
        }
        lane.in_flight.push(Box::pin(work));
        lane.peak = lane.peak.max(lane.in_flight.len());
    }

    /// Waits for every unit of `tag` and fails with the first recorded failure.
    pub async fn drain_propagating(&mut self, tag: &'static str) -> Result<Vec<T>> {
        let Some(lane) = self.lanes.remove(tag) else {
            return Ok(Vec::new());
        };
        let Drained { outputs, failures } = lane.finish().await;
        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    /// Waits for every unit of `tag`, keeping successes and failures apart.
    pub async fn drain_tolerant(&mut self, tag: &'static str) -> Drained<T> {
        match self.lanes.remove(tag) {
            Some(lane) => lane.finish().await,
            None => Drained {
                outputs: Vec::new(),
                failures: Vec::new(),
            },
        }
    }

    pub fn in_flight(&self, tag: &str) -> usize {
        self.lanes
            .get(tag)
            .map(|lane| lane.in_flight.len())
            .unwrap_or(0)
    }

    /// Highest number of simultaneously admitted units seen on `tag` since it was created.
    pub fn peak(&self, tag: &str) -> usize {
        self.lanes.get(tag).map(|lane| lane.peak).unwrap_or(0)
    }
}
