// 🔀 Merge Executor - fold duplicate records into their keeper
//
// Per (keeper, to_delete), inside one savepoint:
//   1. for every reference table, drop to_delete rows the keeper already has
//      (same unique columns), then re-point the rest at the keeper
//   2. append a merge-log row with per-table counts
//   3. delete the to_delete entity
// A failure rolls back that savepoint only; the batch moves on.
//
// Re-running is a no-op: merged ids are in the merge log and no longer exist.

use crate::config::{check_sql_identifier, MergeConfig, ReferenceTable};
use crate::db::{self, MergeLogEntry};
use crate::error::{LinkageError, Result};
use crate::keeper::MergeGroup;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// SAVEPOINT GUARD
// ============================================================================

/// Named savepoint that rolls back unless released
struct SavepointGuard<'c> {
    conn: &'c Connection,
    name: &'static str,
    released: bool,
}

impl<'c> SavepointGuard<'c> {
    fn begin(conn: &'c Connection, name: &'static str) -> Result<Self> {
        conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(SavepointGuard {
            conn,
            name,
            released: false,
        })
    }

    fn release(mut self) -> Result<()> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.released = true;
        Ok(())
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let sql = format!("ROLLBACK TO {name}; RELEASE {name}", name = self.name);
            if let Err(e) = self.conn.execute_batch(&sql) {
                warn!(savepoint = self.name, error = %e, "savepoint rollback failed");
            }
        }
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeFailure {
    pub kept_id: String,
    pub deleted_id: String,
    pub reason: String,
}

impl From<&MergeFailure> for LinkageError {
    fn from(f: &MergeFailure) -> Self {
        LinkageError::PartialMergeFailure {
            kept_id: f.kept_id.clone(),
            deleted_id: f.deleted_id.clone(),
            reason: f.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub run_id: String,
    pub groups: usize,
    pub waves: usize,
    pub merged: usize,

    /// Already in the merge log from an earlier (possibly interrupted) run
    pub skipped_logged: usize,

    /// To-delete entity no longer present
    pub skipped_absent: usize,

    pub retries: usize,
    pub updated: BTreeMap<String, usize>,
    pub conflicts: BTreeMap<String, usize>,
    pub failures: Vec<MergeFailure>,

    /// "table.column" → rows pointing at missing entities after the run
    pub orphans: BTreeMap<String, i64>,

    #[serde(skip)]
    pub entries: Vec<MergeLogEntry>,
}

impl MergeOutcome {
    pub fn total_updated(&self) -> usize {
        self.updated.values().sum()
    }

    pub fn total_conflicts(&self) -> usize {
        self.conflicts.values().sum()
    }

    pub fn total_orphans(&self) -> i64 {
        self.orphans.values().sum()
    }

    fn record(&mut self, entry: MergeLogEntry) {
        for (label, n) in &entry.updated {
            *self.updated.entry(label.clone()).or_insert(0) += n;
        }
        for (label, n) in &entry.conflicts {
            *self.conflicts.entry(label.clone()).or_insert(0) += n;
        }
        self.merged += 1;
        self.entries.push(entry);
    }
}

enum Step {
    Merged(MergeLogEntry),
    Absent,
}

// ============================================================================
// EXECUTOR
// ============================================================================

pub struct MergeExecutor<'a> {
    conn: &'a Connection,
    tables: Vec<ReferenceTable>,
    max_retries: u32,
    run_id: String,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(conn: &'a Connection, config: &MergeConfig, run_id: &str) -> Result<Self> {
        let tables = config.all_reference_tables();
        for table in &tables {
            check_sql_identifier(&table.table)?;
            check_sql_identifier(&table.column)?;
            for column in &table.unique_columns {
                check_sql_identifier(column)?;
            }
        }
        Ok(MergeExecutor {
            conn,
            tables,
            max_retries: config.max_retries,
            run_id: run_id.to_string(),
        })
    }

    pub fn reference_tables(&self) -> &[ReferenceTable] {
        &self.tables
    }

    /// Apply every group, wave by wave
    pub fn execute(&self, groups: &[MergeGroup]) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome {
            run_id: self.run_id.clone(),
            groups: groups.len(),
            ..MergeOutcome::default()
        };

        let already_merged = db::logged_deleted_ids(self.conn)?;
        let waves = self.plan_waves(groups)?;
        outcome.waves = waves.len();

        for (wave_no, wave) in waves.iter().enumerate() {
            debug!(wave = wave_no, groups = wave.len(), "merge wave");
            for &index in wave {
                let group = &groups[index];
                for deleted in &group.to_delete {
                    if already_merged.contains(deleted) {
                        outcome.skipped_logged += 1;
                        continue;
                    }
                    self.merge_with_retry(&group.keeper, deleted, &mut outcome)?;
                }
            }
        }

        outcome.orphans = db::orphan_counts(self.conn, &self.tables)?;
        if outcome.total_orphans() > 0 {
            warn!(orphans = ?outcome.orphans, "rows reference missing entities after merge");
        }

        info!(
            run_id = %self.run_id,
            merged = outcome.merged,
            failures = outcome.failures.len(),
            conflicts = outcome.total_conflicts(),
            "merge batch done"
        );
        Ok(outcome)
    }

    /// Run the whole batch and roll it back: exact impact, nothing written
    pub fn preview(&self, groups: &[MergeGroup]) -> Result<MergeOutcome> {
        let _dry_run = SavepointGuard::begin(self.conn, "linkage_dry_run")?;
        self.execute(groups)
    }

    fn merge_with_retry(&self, keeper: &str, deleted: &str, outcome: &mut MergeOutcome) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.merge_one(keeper, deleted) {
                Ok(Step::Merged(entry)) => {
                    outcome.record(entry);
                    return Ok(());
                }
                Ok(Step::Absent) => {
                    outcome.skipped_absent += 1;
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    outcome.retries += 1;
                    warn!(keeper, deleted, attempt, error = %e, "merge hit lock contention, retrying");
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let failure = MergeFailure {
                        kept_id: keeper.to_string(),
                        deleted_id: deleted.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(error = %LinkageError::from(&failure), "merge rolled back");
                    outcome.failures.push(failure);
                    return Ok(());
                }
            }
        }
    }

    /// One merge inside its own savepoint
    fn merge_one(&self, keeper: &str, deleted: &str) -> Result<Step> {
        let savepoint = SavepointGuard::begin(self.conn, "linkage_merge")?;

        if !db::entity_exists(self.conn, deleted)? {
            savepoint.release()?;
            return Ok(Step::Absent);
        }
        if !db::entity_exists(self.conn, keeper)? {
            return Err(LinkageError::MissingField {
                entity_id: keeper.to_string(),
                field: "entity_id",
            });
        }

        let mut entry = MergeLogEntry {
            run_id: self.run_id.clone(),
            kept_id: keeper.to_string(),
            deleted_id: deleted.to_string(),
            updated: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            merged_at: Utc::now(),
        };

        for table in &self.tables {
            let conflicts = self.delete_conflicting_rows(table, keeper, deleted)?;
            if conflicts > 0 {
                let note = LinkageError::ReferenceConflict {
                    table: table.table.clone(),
                    column: table.column.clone(),
                    keeper: keeper.to_string(),
                    count: conflicts,
                };
                debug!(%note, deleted, "dropping duplicate reference rows");
            }
            let updated = self.conn.execute(
                &format!("UPDATE {} SET {c} = ?1 WHERE {c} = ?2", table.table, c = table.column),
                params![keeper, deleted],
            )?;
            entry.updated.insert(table.label(), updated);
            entry.conflicts.insert(table.label(), conflicts);
        }

        let (rewritten, dropped) = db::repoint_crosswalk(self.conn, keeper, deleted)?;
        entry.updated.insert("crosswalk.entity_id".to_string(), rewritten);
        entry.conflicts.insert("crosswalk.entity_id".to_string(), dropped);

        db::insert_merge_log(self.conn, &entry)?;
        self.conn
            .execute("DELETE FROM entities WHERE entity_id = ?1", params![deleted])?;

        savepoint.release()?;
        Ok(Step::Merged(entry))
    }

    /// Delete to_delete rows whose unique columns match a keeper row
    fn delete_conflicting_rows(&self, table: &ReferenceTable, keeper: &str, deleted: &str) -> Result<usize> {
        if table.unique_columns.is_empty() {
            return Ok(0);
        }
        let matches: Vec<String> = table
            .unique_columns
            .iter()
            .map(|u| format!("keep.{u} IS {t}.{u}", t = table.table))
            .collect();
        let sql = format!(
            "DELETE FROM {t} WHERE {c} = ?1
               AND EXISTS (SELECT 1 FROM {t} AS keep WHERE keep.{c} = ?2 AND {m})",
            t = table.table,
            c = table.column,
            m = matches.join(" AND ")
        );
        Ok(self.conn.execute(&sql, params![deleted, keeper])?)
    }

    /// Split groups so that no two groups in one wave touch the same row
    ///
    /// A row can be touched by two groups when a table has two configured
    /// reference columns (e.g. child and parent). Waves run in order, so the
    /// later group sees the earlier group's committed rewrite.
    pub fn plan_waves(&self, groups: &[MergeGroup]) -> Result<Vec<Vec<usize>>> {
        let mut waves: Vec<(Vec<usize>, HashSet<(String, i64)>)> = Vec::new();

        for (index, group) in groups.iter().enumerate() {
            let touched = self.touched_rows(group)?;
            match waves.iter_mut().find(|(_, rows)| rows.is_disjoint(&touched)) {
                Some((members, rows)) => {
                    members.push(index);
                    rows.extend(touched);
                }
                None => waves.push((vec![index], touched)),
            }
        }

        Ok(waves.into_iter().map(|(members, _)| members).collect())
    }

    fn touched_rows(&self, group: &MergeGroup) -> Result<HashSet<(String, i64)>> {
        let mut rows = HashSet::new();
        for table in &self.tables {
            let sql = format!("SELECT rowid FROM {} WHERE {} = ?1", table.table, table.column);
            let mut stmt = self.conn.prepare(&sql)?;
            for deleted in &group.to_delete {
                let ids = stmt
                    .query_map(params![deleted], |row| row.get::<_, i64>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.extend(ids.into_iter().map(|id| (table.table.clone(), id)));
            }
        }
        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================
