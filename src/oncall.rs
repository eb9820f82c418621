//! On-call resolution over rotation layers and overrides.
//!
//! Everything here is a pure function of the schedule and an instant; the
//! engine wrappers at the bottom only load the schedule.

use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::schema::{OnCallSchedule, ScheduleLayer, ScheduleOverride};
use crate::storage::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Upper bound on the blocks generated for a single layer in one preview.
pub const MAX_BLOCKS_PER_LAYER: usize = 10_000;

/// Where an on-call block comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum BlockSource {
    Rotation,
    Override,
}

/// A contiguous stretch of time during which one user is on call for one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct OnCallBlock {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user_id: String,
    pub layer_id: String,
    pub layer_name: String,
    pub source: BlockSource,
}

fn rotation_millis(layer: &ScheduleLayer) -> Option<i64> {
    if layer.user_ids.is_empty() || layer.rotation_length_hours <= 0 {
        return None;
    }
    Some(Duration::hours(i64::from(layer.rotation_length_hours)).num_milliseconds())
}

fn user_for_index(layer: &ScheduleLayer, index: i64) -> Option<&str> {
    let len = i64::try_from(layer.user_ids.len()).ok()?;
    let position = usize::try_from(index.rem_euclid(len)).ok()?;
    layer.user_ids.get(position).map(String::as_str)
}

/// The rotation user of `layer` at `at`, ignoring overrides.
fn layer_user_at(layer: &ScheduleLayer, at: DateTime<Utc>) -> Option<&str> {
    let rotation_ms = rotation_millis(layer)?;
    if at < layer.start || layer.end.is_some_and(|end| at >= end) {
        return None;
    }

    let elapsed_ms = (at - layer.start).num_milliseconds();
    user_for_index(layer, elapsed_ms.div_euclid(rotation_ms))
}

fn sorted_overrides(overrides: &[ScheduleOverride]) -> Vec<&ScheduleOverride> {
    let mut sorted: Vec<_> = overrides.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    sorted
}

/// Users on call at `at`, in layer order without duplicates.
///
/// Each active layer contributes its rotation user. Overrides covering `at`
/// are applied in order of their start, so the latest one wins; an override
/// with `replaces_user_id` only applies to layers currently on that user.
pub fn resolve_on_call(schedule: &OnCallSchedule, at: DateTime<Utc>) -> Vec<String> {
    let overrides: Vec<_> = sorted_overrides(&schedule.overrides)
        .into_iter()
        .filter(|o| o.start <= at && at < o.end)
        .collect();

    let mut on_call: Vec<String> = Vec::new();
    for layer in &schedule.layers {
        let Some(mut user_id) = layer_user_at(layer, at) else {
            continue;
        };

        for o in &overrides {
            if o.replaces_user_id.as_deref().is_none_or(|replaced| replaced == user_id) {
                user_id = o.user_id.as_str();
            }
        }

        if !on_call.iter().any(|existing| existing == user_id) {
            on_call.push(user_id.to_string());
        }
    }
    on_call
}

fn layer_blocks(
    layer: &ScheduleLayer,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<OnCallBlock> {
    let Some(rotation_ms) = rotation_millis(layer) else {
        return Vec::new();
    };
    let rotation = Duration::milliseconds(rotation_ms);

    let effective_start = window_start.max(layer.start);
    if layer.end.is_some_and(|end| effective_start >= end) {
        return Vec::new();
    }

    let offset_ms = (effective_start - layer.start).num_milliseconds();
    let mut index = offset_ms.div_euclid(rotation_ms);
    let mut block_start = layer.start + Duration::milliseconds(index.saturating_mul(rotation_ms));

    let mut blocks = Vec::new();
    for _ in 0..MAX_BLOCKS_PER_LAYER {
        if block_start >= window_end {
            break;
        }

        let raw_end = block_start + rotation;
        let block_end = layer.end.map_or(raw_end, |end| raw_end.min(end));

        if let Some(user_id) = user_for_index(layer, index) {
            let start = block_start.max(window_start);
            let end = block_end.min(window_end);
            if start < end {
                blocks.push(OnCallBlock {
                    id: format!("{}-{index}", layer.id),
                    start,
                    end,
                    user_id: user_id.to_string(),
                    layer_id: layer.id.clone(),
                    layer_name: layer.name.clone(),
                    source: BlockSource::Rotation,
                });
            }
        }

        if block_end >= window_end || layer.end.is_some_and(|end| block_end >= end) {
            break;
        }

        block_start = block_end;
        index += 1;
    }

    blocks
}

fn apply_override(blocks: Vec<OnCallBlock>, o: &ScheduleOverride) -> Vec<OnCallBlock> {
    let mut next = Vec::with_capacity(blocks.len());
    for block in blocks {
        let disjoint = o.end <= block.start || o.start >= block.end;
        let other_user = o
            .replaces_user_id
            .as_deref()
            .is_some_and(|replaced| replaced != block.user_id);
        if disjoint || other_user {
            next.push(block);
            continue;
        }

        let override_start = o.start.max(block.start);
        let override_end = o.end.min(block.end);

        if block.start < override_start {
            next.push(OnCallBlock {
                end: override_start,
                ..block.clone()
            });
        }

        next.push(OnCallBlock {
            id: format!("{}-override-{}", block.id, o.id),
            start: override_start,
            end: override_end,
            user_id: o.user_id.clone(),
            source: BlockSource::Override,
            ..block.clone()
        });

        if override_end < block.end {
            next.push(OnCallBlock {
                start: override_end,
                ..block
            });
        }
    }
    next
}

/// Contiguous on-call blocks of every layer within `[window_start, window_end)`,
/// with overrides spliced in, sorted by start.
///
/// Each layer yields at most [`MAX_BLOCKS_PER_LAYER`] rotation blocks.
pub fn build_schedule_blocks(
    schedule: &OnCallSchedule,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<OnCallBlock> {
    let mut blocks: Vec<_> = schedule
        .layers
        .iter()
        .flat_map(|layer| layer_blocks(layer, window_start, window_end))
        .collect();

    for o in sorted_overrides(&schedule.overrides) {
        blocks = apply_override(blocks, o);
    }

    blocks.sort_by_key(|block| block.start);
    blocks
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Users on call for a stored schedule at `at`; empty if the schedule is unknown.
    pub async fn resolve_on_call(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, EngineError> {
        let schedule = self.store().schedule(schedule_id).await?;
        Ok(schedule.map(|s| resolve_on_call(&s, at)).unwrap_or_default())
    }

    /// Preview blocks of a stored schedule; empty if the schedule is unknown.
    pub async fn schedule_blocks(
        &self,
        schedule_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<OnCallBlock>, EngineError> {
        let schedule = self.store().schedule(schedule_id).await?;
        Ok(schedule
            .map(|s| build_schedule_blocks(&s, window_start, window_end))
            .unwrap_or_default())
    }
}
