//! Cycle processing: the orchestrator itself, the tagged concurrency groups it
//! fans work out through, and the backoff used to retry failed cycles.

pub mod backoff;
pub mod concurrent;
pub mod orchestrator;
