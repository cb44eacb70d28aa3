//! Archive briefs and event compaction.
//!
//! Committed briefs record a version/time range together with a full
//! snapshot taken at commit. Once enough briefs pile up, the oldest one
//! whose range every observer has consumed gets its events deleted (or
//! moved), and only the newest cleared brief is retained.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::config::{ArchiveOptions, EventArchiveType};
use crate::error::GrainError;
use crate::event::EventBase;
use crate::grain::Grain;

/// Metadata for one archived range of an aggregate's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveBrief {
    pub id: String,
    pub start_version: i64,
    pub end_version: i64,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub index: i64,
    pub event_is_cleared: bool,
}

impl ArchiveBrief {
    /// Open a brief covering the single event `base`.
    pub fn open(index: i64, base: &EventBase) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start_version: base.version,
            end_version: base.version,
            start_timestamp: base.timestamp,
            end_timestamp: base.timestamp,
            index,
            event_is_cleared: false,
        }
    }

    /// Widen the brief to include `base`.
    pub fn extend(&mut self, base: &EventBase) {
        self.start_version = self.start_version.min(base.version);
        self.end_version = self.end_version.max(base.version);
        self.start_timestamp = self.start_timestamp.min(base.timestamp);
        self.end_timestamp = self.end_timestamp.max(base.timestamp);
    }

    /// Absorb another brief's range, keeping the smaller index.
    pub fn merge(&mut self, other: &ArchiveBrief) {
        self.start_version = self.start_version.min(other.start_version);
        self.end_version = self.end_version.max(other.end_version);
        self.start_timestamp = self.start_timestamp.min(other.start_timestamp);
        self.end_timestamp = self.end_timestamp.max(other.end_timestamp);
        self.index = self.index.min(other.index);
    }

    /// Whether the brief covers enough to be committed.
    ///
    /// Elapsed time is measured from the previous brief's end when there is
    /// one, otherwise across the brief itself. Both minimum thresholds must
    /// be met, or either maximum exceeded.
    pub fn is_completed(&self, options: &ArchiveOptions, previous: Option<&ArchiveBrief>) -> bool {
        let elapsed_ms = match previous {
            Some(prev) => self.end_timestamp - prev.end_timestamp,
            None => self.end_timestamp - self.start_timestamp,
        };
        let span = self.end_version - self.start_version + 1;
        let interval_ms = duration_millis(options.interval);
        let max_interval_ms = duration_millis(options.max_interval);

        (elapsed_ms >= interval_ms && span >= options.interval_version)
            || elapsed_ms >= max_interval_ms
            || span >= options.max_interval_version
    }
}

fn duration_millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Archive bookkeeping embedded in a grain.
#[derive(Debug, Clone, Default)]
pub(crate) struct ArchiveState {
    /// Committed briefs, ascending by index.
    pub briefs: Vec<ArchiveBrief>,
    /// In-progress brief, not yet persisted.
    pub new: Option<ArchiveBrief>,
}

impl ArchiveState {
    pub fn last(&self) -> Option<&ArchiveBrief> {
        self.briefs.last()
    }

    /// Most recent brief whose events were removed.
    pub fn cleared(&self) -> Option<&ArchiveBrief> {
        self.briefs.iter().rev().find(|b| b.event_is_cleared)
    }

    fn next_index(&self) -> i64 {
        self.last().map_or(0, |b| b.index + 1)
    }

    fn merge_into_new(&mut self, brief: &ArchiveBrief) {
        match &mut self.new {
            Some(new) => new.merge(brief),
            None => self.new = Some(brief.clone()),
        }
    }
}

impl<A: Aggregate> Grain<A> {
    fn archive_enabled(&self) -> bool {
        self.options.archive.enabled
    }

    /// Load briefs and reopen an interrupted tail brief.
    pub(crate) async fn load_archive_briefs(&mut self) -> Result<(), GrainError> {
        if !self.archive_enabled() {
            return Ok(());
        }
        let mut briefs = self
            .ports
            .archives
            .get_brief_list(&self.state_id)
            .await?;
        briefs.sort_by_key(|b| b.index);
        self.archive.briefs = briefs;

        let count = self.archive.briefs.len();
        let Some(tail) = self.archive.briefs.last().cloned() else {
            return Ok(());
        };
        let previous = count
            .checked_sub(2)
            .and_then(|i| self.archive.briefs.get(i));
        if !tail.event_is_cleared && !tail.is_completed(&self.options.archive, previous) {
            self.ports
                .archives
                .delete(&self.state_id, &tail.id)
                .await?;
            self.archive.briefs.pop();
            self.archive.merge_into_new(&tail);
            tracing::info!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                brief_index = tail.index,
                "reopened incomplete archive brief"
            );
        }
        Ok(())
    }

    /// Extend the in-progress brief over events applied but not yet
    /// covered by any brief, e.g. after recovery replay.
    pub(crate) async fn rebuild_pending_archive(&mut self) -> Result<(), GrainError> {
        if !self.archive_enabled() {
            return Ok(());
        }
        let covered = self
            .archive
            .new
            .as_ref()
            .or(self.archive.last())
            .map_or(0, |b| b.end_version);
        let version = self.snapshot.base.version;
        let page = self.options.snapshot.events_per_read.max(1);

        let mut from = covered + 1;
        while from <= version {
            let to = from.saturating_add(page - 1).min(version);
            let records = self
                .ports
                .events
                .get_range(&self.state_id, 0, from, to)
                .await?;
            if records.is_empty() {
                break;
            }
            for record in &records {
                self.extend_archive(&record.base);
            }
            from = to + 1;
        }
        Ok(())
    }

    /// Widen (or open) the in-progress brief without committing it.
    pub(crate) fn extend_archive(&mut self, base: &EventBase) {
        if !self.archive_enabled() {
            return;
        }
        let index = self.archive.next_index();
        match &mut self.archive.new {
            Some(new) => new.extend(base),
            None => self.archive.new = Some(ArchiveBrief::open(index, base)),
        }
    }

    /// Post-raise archive bookkeeping.
    pub(crate) async fn event_archive(&mut self, base: &EventBase) -> Result<(), GrainError> {
        if !self.archive_enabled() {
            return Ok(());
        }
        self.extend_archive(base);
        self.archive(false).await
    }

    /// Commit the in-progress brief when forced or complete.
    pub(crate) async fn archive(&mut self, force: bool) -> Result<(), GrainError> {
        if !self.archive_enabled() {
            return Ok(());
        }
        self.snapshot.base.ensure_quiescent()?;
        let Some(brief) = self.archive.new.clone() else {
            return Ok(());
        };
        if !force && !brief.is_completed(&self.options.archive, self.archive.last()) {
            return Ok(());
        }

        if let Err(e) = self.ports.archives.insert(&brief, &self.snapshot).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                brief_index = brief.index,
                error = %e,
                "archive insert failed"
            );
            return Err(e.into());
        }
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            brief_index = brief.index,
            start_version = brief.start_version,
            end_version = brief.end_version,
            "archive brief committed"
        );
        self.archive.briefs.push(brief);
        self.archive.new = None;
        self.on_archive_completed().await
    }

    /// Compact the oldest uncleared brief once retention is exceeded and
    /// every observer has consumed its range.
    pub(crate) async fn on_archive_completed(&mut self) -> Result<(), GrainError> {
        let uncleared = self
            .archive
            .briefs
            .iter()
            .filter(|b| !b.event_is_cleared)
            .count();
        if uncleared < self.options.archive.max_snapshot_archive_records {
            return Ok(());
        }
        let Some(oldest) = self
            .archive
            .briefs
            .iter()
            .find(|b| !b.event_is_cleared)
            .cloned()
        else {
            return Ok(());
        };

        let versions = self
            .follow
            .get_and_save_versions(&self.state_id, self.snapshot.base.version)
            .await?;
        if let Some(min) = versions.iter().min()
            && *min < oldest.end_version
        {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                brief_end_version = oldest.end_version,
                observer_version = *min,
                "compaction deferred until observers catch up"
            );
            return Ok(());
        }

        self.ports
            .archives
            .event_is_clear(&self.state_id, &oldest.id)
            .await?;
        if let Some(brief) = self.archive.briefs.iter_mut().find(|b| b.id == oldest.id) {
            brief.event_is_cleared = true;
        }
        if self.saved_version < oldest.end_version {
            self.save_snapshot(true, false).await?;
        }

        let start_timestamp = self.snapshot.base.start_timestamp;
        match self.options.archive.event_archive_type {
            EventArchiveType::Delete => {
                self.ports
                    .events
                    .delete_range(&self.state_id, oldest.end_version, start_timestamp)
                    .await?
            }
            EventArchiveType::Move => {
                self.ports
                    .events
                    .archive_range(&self.state_id, oldest.end_version, start_timestamp)
                    .await?
            }
        }

        let cleared: Vec<ArchiveBrief> = self
            .archive
            .briefs
            .iter()
            .filter(|b| b.event_is_cleared)
            .cloned()
            .collect();
        for stale in cleared.iter().take(cleared.len().saturating_sub(1)) {
            self.ports
                .archives
                .delete(&self.state_id, &stale.id)
                .await?;
            self.archive.briefs.retain(|b| b.id != stale.id);
        }

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            cleared_to_version = oldest.end_version,
            "archived events cleared"
        );
        Ok(())
    }

    /// Pre-raise archive checks for an event stamped `timestamp`.
    ///
    /// Rejects events older than the cleared range and folds uncleared
    /// briefs that start at or after `timestamp` back into the
    /// in-progress brief.
    pub(crate) async fn archive_before_raise(&mut self, timestamp: i64) -> Result<(), GrainError> {
        if !self.archive_enabled() {
            return Ok(());
        }
        if let Some(cleared) = self.archive.cleared()
            && timestamp < cleared.start_timestamp
        {
            return Err(GrainError::EventIsCleared {
                state_id: self.state_id.to_string(),
                timestamp,
            });
        }
        let Some(last) = self.archive.last() else {
            return Ok(());
        };
        if timestamp >= last.end_timestamp {
            return Ok(());
        }

        let invalidated: Vec<ArchiveBrief> = self
            .archive
            .briefs
            .iter()
            .filter(|b| !b.event_is_cleared && b.start_timestamp >= timestamp)
            .cloned()
            .collect();
        for brief in &invalidated {
            self.ports
                .archives
                .delete(&self.state_id, &brief.id)
                .await?;
            self.archive.briefs.retain(|b| b.id != brief.id);
            self.archive.merge_into_new(brief);
        }
        if !invalidated.is_empty() {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                count = invalidated.len(),
                "archive briefs reopened by out-of-order timestamp"
            );
        }
        Ok(())
    }

    /// Remove every brief of this aggregate.
    pub(crate) async fn delete_all_archives(&mut self) -> Result<(), GrainError> {
        self.ports.archives.delete_all(&self.state_id).await?;
        self.archive = ArchiveState::default();
        Ok(())
    }

    /// Committed briefs, ascending by index.
    pub fn archive_briefs(&self) -> &[ArchiveBrief] {
        &self.archive.briefs
    }

    /// The in-progress brief, if any.
    pub fn pending_archive(&self) -> Option<&ArchiveBrief> {
        self.archive.new.as_ref()
    }
}
