// 🚦 Pipeline - one dedup run end to end
//
// load → block → score → classify → cluster → keeper → merge → location groups
//
// Blocking and scoring work on an in-memory snapshot with no transaction
// open; only the merge phase writes. Dry-run executes the merges inside a
// rolled-back savepoint so the reported impact is exact.

use crate::blocking::{BlockingIndex, BlockingStats};
use crate::classify::{Classifier, Label};
use crate::cluster::{location_components, merge_components, LocationGroup};
use crate::config::LinkageConfig;
use crate::crosswalk::{build_crosswalk, CrosswalkStats};
use crate::db::{self, ImportStats};
use crate::entities::EntityRecord;
use crate::error::{LinkageError, Result};
use crate::export::export_pairs_csv;
use crate::hierarchy::{resolve, HierarchyStats};
use crate::ingest::{load_entities_csv, load_ownership_links_csv, IngestReport, LinkIngestReport};
use crate::keeper::{select_keeper, KeeperCandidate, MergeGroup};
use crate::merge::{MergeExecutor, MergeOutcome};
use crate::normalize::Normalizer;
use crate::scoring::Scorer;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// RUN MODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Execute and roll back; report exact impact
    DryRun,
    Apply,
    /// Score and classify only
    ExportOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::DryRun => "dry-run",
            RunMode::Apply => "apply",
            RunMode::ExportOnly => "export-only",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dry-run" | "dry_run" => Ok(RunMode::DryRun),
            "apply" => Ok(RunMode::Apply),
            "export" | "export-only" => Ok(RunMode::ExportOnly),
            other => Err(LinkageError::Config(format!("unknown run mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupOptions {
    pub mode: RunMode,
    /// Restrict the run to one source
    pub source: Option<String>,
    /// Candidate-pair CSV destination
    pub export: Option<PathBuf>,
}

impl DedupOptions {
    pub fn new(mode: RunMode) -> Self {
        DedupOptions {
            mode,
            source: None,
            export: None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_export(mut self, path: &Path) -> Self {
        self.export = Some(path.to_path_buf());
        self
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub blocking: BlockingStats,
    pub candidate_pairs: usize,
    pub em_iterations: usize,
    pub labels: BTreeMap<Label, usize>,
    pub non_matches: usize,
    pub merge_groups: usize,
    pub merge: Option<MergeOutcome>,
    pub location_groups: Vec<LocationGroup>,
    pub exported_pairs: Option<usize>,
}

impl RunSummary {
    pub fn label_count(&self, label: Label) -> usize {
        self.labels.get(&label).copied().unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "🔗 Linkage run {} ({})", self.run_id, self.mode)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "Entities:          {}", self.entities)?;
        writeln!(
            f,
            "Candidate pairs:   {} (oversized blocks skipped: {})",
            self.candidate_pairs, self.blocking.oversized_blocks_skipped
        )?;
        writeln!(f, "EM iterations:     {}", self.em_iterations)?;
        writeln!(f, "\n📊 Labels")?;
        for label in Label::ALL {
            writeln!(f, "  {:<16} {}", label.as_str(), self.label_count(label))?;
        }
        writeln!(f, "  {:<16} {}", "NON_MATCH", self.non_matches)?;

        writeln!(f, "\n🧬 Merge groups:   {}", self.merge_groups)?;
        if let Some(merge) = &self.merge {
            writeln!(f, "  merged:          {}", merge.merged)?;
            writeln!(f, "  already merged:  {}", merge.skipped_logged)?;
            writeln!(f, "  absent:          {}", merge.skipped_absent)?;
            writeln!(f, "  waves:           {}", merge.waves)?;
            for (table, updated) in &merge.updated {
                let conflicts = merge.conflicts.get(table).copied().unwrap_or(0);
                writeln!(f, "  {table}: {updated} updated, {conflicts} conflicts dropped")?;
            }
            if !merge.failures.is_empty() {
                writeln!(f, "  ❌ failures:     {}", merge.failures.len())?;
                for failure in &merge.failures {
                    writeln!(f, "     {} ← {}: {}", failure.kept_id, failure.deleted_id, failure.reason)?;
                }
            }
            if merge.total_orphans() > 0 {
                writeln!(f, "  ⚠️  orphaned rows: {}", merge.total_orphans())?;
            }
        }
        writeln!(f, "📍 Location groups: {}", self.location_groups.len())?;
        if let Some(exported) = self.exported_pairs {
            writeln!(f, "📤 Exported pairs:  {exported}")?;
        }
        if self.mode == RunMode::DryRun {
            writeln!(f, "\n(dry run: nothing was written)")?;
        }
        Ok(())
    }
}

// ============================================================================
// DEDUP
// ============================================================================

pub fn run_dedup(conn: &Connection, config: &LinkageConfig, options: &DedupOptions) -> Result<RunSummary> {
    if options.mode == RunMode::ExportOnly && options.export.is_none() {
        return Err(LinkageError::Config("export-only mode needs an export path".to_string()));
    }

    let started_at = Utc::now();
    let run_id = Uuid::new_v4().to_string();
    info!(%run_id, mode = %options.mode, "dedup run started");

    let entities = db::load_entities(conn, options.source.as_deref())?;

    let candidates = BlockingIndex::new(&config.blocking).candidate_pairs(&entities);
    info!(pairs = candidates.len(), "blocking done");

    let mut scorer = Scorer::new(&config.probabilistic);
    let em_iterations = scorer.fit(&entities, &candidates);
    let scored = scorer.score_all(&entities, &candidates);

    let classification = Classifier::new(&config.thresholds).classify_all(scored);
    info!(retained = classification.retained.len(), non_matches = classification.non_matches, "classification done");

    let exported_pairs = match &options.export {
        Some(path) => Some(export_pairs_csv(path, &classification.retained)?),
        None => None,
    };

    let mut summary = RunSummary {
        run_id: run_id.clone(),
        mode: options.mode,
        source: options.source.clone(),
        started_at,
        finished_at: started_at,
        entities: entities.len(),
        blocking: candidates.stats.clone(),
        candidate_pairs: candidates.len(),
        em_iterations,
        labels: classification.counts.clone(),
        non_matches: classification.non_matches,
        merge_groups: 0,
        merge: None,
        location_groups: Vec::new(),
        exported_pairs,
    };

    if options.mode == RunMode::ExportOnly {
        summary.finished_at = Utc::now();
        return Ok(summary);
    }

    let executor = MergeExecutor::new(conn, &config.merge, &run_id)?;
    let by_id: HashMap<&str, &EntityRecord> = entities.iter().map(|e| (e.entity_id.as_str(), e)).collect();

    let mut groups = Vec::new();
    for component in merge_components(&classification.retained) {
        let candidates = keeper_candidates(conn, &executor, &by_id, &component)?;
        if let Some(group) = MergeGroup::from_candidates(&candidates) {
            groups.push(group);
        }
    }
    summary.merge_groups = groups.len();

    let outcome = match options.mode {
        RunMode::Apply => executor.execute(&groups)?,
        _ => executor.preview(&groups)?,
    };

    let remap: HashMap<String, String> = outcome
        .entries
        .iter()
        .map(|e| (e.deleted_id.clone(), e.kept_id.clone()))
        .collect();

    let mut location_groups = Vec::new();
    for members in location_components(&classification.retained, &remap) {
        let candidates = keeper_candidates(conn, &executor, &by_id, &members)?;
        if let Some(representative) = select_keeper(&candidates) {
            location_groups.push(LocationGroup::new(members.clone(), representative.entity_id.clone()));
        }
    }

    if options.mode == RunMode::Apply {
        db::save_location_groups(conn, &location_groups, &run_id)?;
    }

    summary.merge = Some(outcome);
    summary.location_groups = location_groups;
    summary.finished_at = Utc::now();
    info!(%run_id, merge_groups = summary.merge_groups, location_groups = summary.location_groups.len(), "dedup run finished");

    Ok(summary)
}

/// Keeper inputs for a set of ids; ids missing from the snapshot are skipped
fn keeper_candidates(
    conn: &Connection,
    executor: &MergeExecutor<'_>,
    by_id: &HashMap<&str, &EntityRecord>,
    ids: &[String],
) -> Result<Vec<KeeperCandidate>> {
    ids.iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .map(|entity| -> Result<KeeperCandidate> {
            Ok(KeeperCandidate {
                entity_id: entity.entity_id.clone(),
                name: entity.name.clone(),
                weight: entity.weight,
                reference_count: db::reference_count(conn, executor.reference_tables(), &entity.entity_id)?,
            })
        })
        .collect()
}

// ============================================================================
// IMPORT / CROSSWALK / HIERARCHY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source: String,
    pub ingest: IngestReport,
    pub stored: ImportStats,
}

pub fn import_entities(conn: &Connection, config: &LinkageConfig, source: &str, path: &Path) -> Result<ImportSummary> {
    let normalizer = Normalizer::from_config(&config.normalizer);
    let mapping = config.mapping_for(source);

    let ingest = load_entities_csv(path, source, &mapping, &normalizer)?;
    let stored = db::insert_entities(conn, &ingest.records)?;
    info!(source, rows = ingest.rows, inserted = stored.inserted, "entities imported");

    Ok(ImportSummary {
        source: source.to_string(),
        ingest,
        stored,
    })
}

pub fn import_links(conn: &Connection, path: &Path) -> Result<(LinkIngestReport, ImportStats)> {
    let ingest = load_ownership_links_csv(path)?;
    let stored = db::insert_ownership_links(conn, &ingest.links)?;
    info!(rows = ingest.rows, inserted = stored.inserted, "ownership links imported");
    Ok((ingest, stored))
}

pub fn run_crosswalk(conn: &Connection, config: &LinkageConfig) -> Result<CrosswalkStats> {
    let entities = db::load_entities(conn, None)?;
    let crosswalk = build_crosswalk(&entities, &config.crosswalk);
    db::save_crosswalk(conn, &crosswalk.records)?;
    info!(linked = crosswalk.records.len(), "crosswalk saved");
    Ok(crosswalk.stats)
}

/// Resolve ultimate parents; uses the stored crosswalk or builds one in memory
pub fn run_hierarchy(conn: &Connection, config: &LinkageConfig) -> Result<HierarchyStats> {
    let entities = db::load_entities(conn, None)?;
    let links = db::load_ownership_links(conn)?;

    let mut crosswalk = db::load_crosswalk(conn)?;
    if crosswalk.is_empty() {
        crosswalk = build_crosswalk(&entities, &config.crosswalk).records;
    }

    let hierarchy = resolve(&entities, &links, &crosswalk, &config.hierarchy);
    db::save_hierarchy(conn, &hierarchy.edges, &hierarchy.parents)?;
    info!(edges = hierarchy.edges.len(), parents = hierarchy.parents.len(), "hierarchy saved");
    Ok(hierarchy.stats)
}

// ============================================================================
// TESTS
// ============================================================================
