//! Catch-up planning: turns the persisted watermark and the chain head into the
//! next block range to index.

use crate::events::EventSource;
use crate::model::TractorMeta;
use anyhow::{Context, Result};

/// Range limits applied by [`plan_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_blocks: u64,
    pub confirmation_buffer: u64,
    pub max_return_block: Option<u64>,
}

/// Result of one planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePlan {
    pub is_initialized: bool,
    pub last_update: Option<u64>,
    pub update_block: Option<u64>,
    pub is_caught_up: bool,
    pub meta: TractorMeta,
}

impl UpdatePlan {
    /// Inclusive block range still to process, if any.
    pub fn range(&self) -> Option<(u64, u64)> {
        let (last, update) = (self.last_update?, self.update_block?);
        (update > last).then(|| (last + 1, update))
    }
}

/// Computes the next update block against a known chain head.
pub fn plan_update(meta: TractorMeta, head: u64, limits: PlanLimits) -> UpdatePlan {
    let Some(last_update) = meta.last_update else {
        return UpdatePlan {
            is_initialized: false,
            last_update: None,
            update_block: None,
            is_caught_up: false,
            meta,
        };
    };

    let target = head.saturating_sub(limits.confirmation_buffer);
    let mut upper = last_update.saturating_add(limits.max_blocks).min(target);
    if let Some(max_return) = limits.max_return_block {
        upper = upper.min(max_return);
    }
    let update_block = upper.max(last_update);

    UpdatePlan {
        is_initialized: true,
        last_update: Some(last_update),
        update_block: Some(update_block),
        is_caught_up: update_block >= target,
        meta,
    }
}

/// Reads the chain head from `source` and plans against it.
pub async fn plan_from_source(
    meta: TractorMeta,
    source: &dyn EventSource,
    limits: PlanLimits,
) -> Result<UpdatePlan> {
    if meta.last_update.is_none() {
        return Ok(plan_update(meta, 0, limits));
    }
    let head = source
        .chain_head()
        .await
        .context("failed to read chain head")?;
    Ok(plan_update(meta, head, limits))
}
