use crate::config::{check_sql_identifier, ReferenceTable};
use crate::crosswalk::{CrosswalkRecord, JoinMethod};
use crate::entities::{EntityRecord, Identifier, IdentifierKind, OwnershipLink};
use crate::error::{LinkageError, Result};
use crate::hierarchy::{HierarchyEdge, UltimateParent};
use crate::cluster::LocationGroup;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Append-only audit row for one executed merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub run_id: String,
    pub kept_id: String,
    pub deleted_id: String,

    /// "table.column" → rows re-pointed at the keeper
    pub updated: BTreeMap<String, usize>,

    /// "table.column" → rows deleted because the keeper already had them
    pub conflicts: BTreeMap<String, usize>,

    pub merged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub inserted: usize,
    /// Already present (same entity_id)
    pub duplicates: usize,
}

/// Open (or create) the store and make sure every table exists
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    // ==========================================================================
    // Entities + identifiers
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            entity_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            name_normalized TEXT NOT NULL,
            state TEXT,
            city TEXT,
            street TEXT,
            zip TEXT,
            industry_code TEXT,
            weight INTEGER,
            parent_kind TEXT,
            parent_value TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_identifiers (
            entity_id TEXT NOT NULL REFERENCES entities(entity_id),
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(entity_id, kind, value)
        )",
        [],
    )?;

    // ==========================================================================
    // Registry-native ownership assertions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ownership_links (
            child_kind TEXT NOT NULL,
            child_value TEXT NOT NULL,
            parent_kind TEXT NOT NULL,
            parent_value TEXT NOT NULL,
            source TEXT NOT NULL,
            relationship TEXT NOT NULL,
            UNIQUE(child_kind, child_value, parent_kind, parent_value, source)
        )",
        [],
    )?;

    // ==========================================================================
    // Merge audit trail (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            kept_id TEXT NOT NULL,
            deleted_id TEXT NOT NULL,
            updated_counts TEXT NOT NULL,
            conflict_counts TEXT NOT NULL,
            merged_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Outputs
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS location_groups (
            group_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            representative TEXT NOT NULL,
            run_id TEXT NOT NULL,
            PRIMARY KEY (group_id, entity_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hierarchy_edges (
            space TEXT NOT NULL,
            child TEXT NOT NULL,
            parent TEXT NOT NULL,
            source TEXT NOT NULL,
            relationship TEXT NOT NULL,
            tier TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ultimate_parents (
            entity_id TEXT NOT NULL,
            space TEXT NOT NULL,
            ultimate_parent TEXT NOT NULL,
            ultimate_parent_entity TEXT,
            depth INTEGER NOT NULL,
            source TEXT NOT NULL,
            cycle_truncated INTEGER NOT NULL,
            hop_capped INTEGER NOT NULL,
            PRIMARY KEY (entity_id, space)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS crosswalk (
            entity_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            tax_id TEXT,
            registry_number TEXT,
            lei TEXT,
            ticker TEXT,
            linked_ids TEXT NOT NULL,
            join_method TEXT NOT NULL,
            confidence TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_source ON entities(source)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_identifiers_value ON entity_identifiers(kind, value)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_identifiers_entity ON entity_identifiers(entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_log_deleted ON merge_log(deleted_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_location_groups_entity ON location_groups(entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ENTITIES
// ============================================================================

pub fn insert_entities(conn: &Connection, entities: &[EntityRecord]) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    let tx = conn.unchecked_transaction()?;

    for entity in entities {
        let result = tx.execute(
            "INSERT INTO entities (
                entity_id, source, name, name_normalized, state, city, street, zip,
                industry_code, weight, parent_kind, parent_value
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entity.entity_id,
                entity.source,
                entity.name,
                entity.name_normalized,
                entity.state,
                entity.city,
                entity.street,
                entity.zip,
                entity.industry_code,
                entity.weight,
                entity.parent_identifier.as_ref().map(|p| p.kind.as_str()),
                entity.parent_identifier.as_ref().map(|p| p.value.as_str()),
            ],
        );

        match result {
            Ok(_) => {
                stats.inserted += 1;
                for id in &entity.identifiers {
                    tx.execute(
                        "INSERT OR IGNORE INTO entity_identifiers (entity_id, kind, value)
                         VALUES (?1, ?2, ?3)",
                        params![entity.entity_id, id.kind.as_str(), id.value],
                    )?;
                }
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                stats.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit()?;
    info!(inserted = stats.inserted, duplicates = stats.duplicates, "entities imported");
    Ok(stats)
}

/// Every entity (optionally one source), ordered by entity_id
pub fn load_entities(conn: &Connection, source: Option<&str>) -> Result<Vec<EntityRecord>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, source, name, name_normalized, state, city, street, zip,
                industry_code, weight, parent_kind, parent_value
         FROM entities
         WHERE ?1 IS NULL OR source = ?1
         ORDER BY entity_id",
    )?;

    let rows = stmt
        .query_map(params![source], |row| {
            let parent_kind: Option<String> = row.get(10)?;
            let parent_value: Option<String> = row.get(11)?;
            Ok((
                EntityRecord {
                    entity_id: row.get(0)?,
                    source: row.get(1)?,
                    name: row.get(2)?,
                    name_normalized: row.get(3)?,
                    state: row.get(4)?,
                    city: row.get(5)?,
                    street: row.get(6)?,
                    zip: row.get(7)?,
                    industry_code: row.get(8)?,
                    identifiers: Vec::new(),
                    weight: row.get(9)?,
                    parent_identifier: None,
                },
                parent_kind.zip(parent_value),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut identifiers = load_identifiers(conn)?;
    let mut entities = Vec::with_capacity(rows.len());
    for (mut entity, parent) in rows {
        if let Some((kind, value)) = parent {
            entity.parent_identifier = Some(Identifier {
                kind: kind.parse()?,
                value,
            });
        }
        entity.identifiers = identifiers.remove(&entity.entity_id).unwrap_or_default();
        entities.push(entity);
    }

    debug!(count = entities.len(), source = ?source, "entities loaded");
    Ok(entities)
}

/// entity_id → identifiers, sorted
fn load_identifiers(conn: &Connection) -> Result<HashMap<String, Vec<Identifier>>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, kind, value FROM entity_identifiers ORDER BY entity_id, kind, value",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut map: HashMap<String, Vec<Identifier>> = HashMap::new();
    for (entity_id, kind, value) in rows {
        let kind: IdentifierKind = kind.parse()?;
        map.entry(entity_id).or_default().push(Identifier { kind, value });
    }
    for ids in map.values_mut() {
        ids.sort();
    }
    Ok(map)
}

pub fn entity_exists(conn: &Connection, entity_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM entities WHERE entity_id = ?1",
            params![entity_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn entity_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// OWNERSHIP LINKS
// ============================================================================

pub fn insert_ownership_links(conn: &Connection, links: &[OwnershipLink]) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    let tx = conn.unchecked_transaction()?;
    for link in links {
        let changed = tx.execute(
            "INSERT OR IGNORE INTO ownership_links (
                child_kind, child_value, parent_kind, parent_value, source, relationship
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                link.child.kind.as_str(),
                link.child.value,
                link.parent.kind.as_str(),
                link.parent.value,
                link.source,
                link.relationship.as_str(),
            ],
        )?;
        if changed == 0 {
            stats.duplicates += 1;
        } else {
            stats.inserted += 1;
        }
    }
    tx.commit()?;
    Ok(stats)
}

pub fn load_ownership_links(conn: &Connection) -> Result<Vec<OwnershipLink>> {
    let mut stmt = conn.prepare(
        "SELECT child_kind, child_value, parent_kind, parent_value, source, relationship
         FROM ownership_links
         ORDER BY child_kind, child_value, parent_value, source",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(ck, cv, pk, pv, source, relationship)| -> Result<OwnershipLink> {
            Ok(OwnershipLink {
                child: Identifier { kind: ck.parse()?, value: cv },
                parent: Identifier { kind: pk.parse()?, value: pv },
                source,
                relationship: relationship.parse()?,
            })
        })
        .collect()
}

// ============================================================================
// REFERENCE TABLES
// ============================================================================

/// Rows across the reference tables pointing at one entity
pub fn reference_count(conn: &Connection, tables: &[ReferenceTable], entity_id: &str) -> Result<i64> {
    let mut total = 0i64;
    for table in tables {
        check_sql_identifier(&table.table)?;
        check_sql_identifier(&table.column)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            table.table, table.column
        );
        let count: i64 = conn.query_row(&sql, params![entity_id], |row| row.get(0))?;
        total += count;
    }
    Ok(total)
}

/// "table.column" → rows referencing an entity that no longer exists
pub fn orphan_counts(conn: &Connection, tables: &[ReferenceTable]) -> Result<BTreeMap<String, i64>> {
    let mut counts = BTreeMap::new();
    for table in tables {
        check_sql_identifier(&table.table)?;
        check_sql_identifier(&table.column)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE {c} IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM entities e WHERE e.entity_id = {t}.{c})",
            t = table.table,
            c = table.column
        );
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        counts.insert(table.label(), count);
    }

    let crosswalk_rows: i64 = conn.query_row(
        "SELECT COUNT(*) FROM crosswalk c
         WHERE NOT EXISTS (SELECT 1 FROM entities e WHERE e.entity_id = c.entity_id)",
        [],
        |row| row.get(0),
    )?;
    counts.insert("crosswalk.entity_id".to_string(), crosswalk_rows);

    let crosswalk_links: i64 = conn.query_row(
        "SELECT COUNT(*) FROM crosswalk c, json_each(c.linked_ids) j
         WHERE NOT EXISTS (SELECT 1 FROM entities e WHERE e.entity_id = j.value)",
        [],
        |row| row.get(0),
    )?;
    counts.insert("crosswalk.linked_ids".to_string(), crosswalk_links);

    Ok(counts)
}

/// Fold a merged-away entity into its keeper inside the crosswalk
///
/// The deleted entity's row moves to the keeper, or is dropped when the keeper
/// already has one (its links are folded in). Every link list naming the
/// deleted id is rewritten; a row left with no links is removed.
/// Returns (rows rewritten, rows dropped).
pub fn repoint_crosswalk(conn: &Connection, keeper: &str, deleted: &str) -> Result<(usize, usize)> {
    let deleted_links: Option<Vec<String>> = conn
        .query_row(
            "SELECT linked_ids FROM crosswalk WHERE entity_id = ?1",
            params![deleted],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|json| serde_json::from_str(&json))
        .transpose()?;
    let keeper_has_row: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM crosswalk WHERE entity_id = ?1)",
        params![keeper],
        |row| row.get(0),
    )?;

    let mut rewritten = 0;
    let mut dropped = 0;
    if deleted_links.is_some() {
        if keeper_has_row {
            dropped += conn.execute("DELETE FROM crosswalk WHERE entity_id = ?1", params![deleted])?;
        } else {
            rewritten += conn.execute(
                "UPDATE crosswalk
                 SET entity_id = ?1, source = (SELECT source FROM entities WHERE entity_id = ?1)
                 WHERE entity_id = ?2",
                params![keeper, deleted],
            )?;
        }
    }

    let mut stmt = conn.prepare(
        "SELECT c.entity_id, c.linked_ids FROM crosswalk c
         WHERE c.entity_id = ?1
            OR EXISTS (SELECT 1 FROM json_each(c.linked_ids) j WHERE j.value = ?2)",
    )?;
    let rows = stmt
        .query_map(params![keeper, deleted], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (entity_id, json) in rows {
        let current: Vec<String> = serde_json::from_str(&json)?;
        let mut links: Vec<String> = current
            .iter()
            .map(|id| if id == deleted { keeper.to_string() } else { id.clone() })
            .collect();
        if entity_id == keeper {
            if let Some(extra) = &deleted_links {
                links.extend(extra.iter().cloned());
            }
        }
        links.retain(|id| id != &entity_id && id != deleted);
        links.sort();
        links.dedup();

        if links == current {
            continue;
        }
        if links.is_empty() {
            dropped += conn.execute("DELETE FROM crosswalk WHERE entity_id = ?1", params![entity_id])?;
        } else {
            rewritten += conn.execute(
                "UPDATE crosswalk SET linked_ids = ?1 WHERE entity_id = ?2",
                params![serde_json::to_string(&links)?, entity_id],
            )?;
        }
    }

    Ok((rewritten, dropped))
}

// ============================================================================
// MERGE LOG
// ============================================================================

pub fn insert_merge_log(conn: &Connection, entry: &MergeLogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO merge_log (
            run_id, kept_id, deleted_id, updated_counts, conflict_counts, merged_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.run_id,
            entry.kept_id,
            entry.deleted_id,
            serde_json::to_string(&entry.updated)?,
            serde_json::to_string(&entry.conflicts)?,
            entry.merged_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Ids already merged away by any earlier run
pub fn logged_deleted_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT deleted_id FROM merge_log")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(ids)
}

pub fn load_merge_log(conn: &Connection, run_id: Option<&str>) -> Result<Vec<MergeLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, kept_id, deleted_id, updated_counts, conflict_counts, merged_at
         FROM merge_log
         WHERE ?1 IS NULL OR run_id = ?1
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(run_id, kept_id, deleted_id, updated, conflicts, merged_at)| -> Result<MergeLogEntry> {
            let merged_at = DateTime::parse_from_rfc3339(&merged_at)
                .map_err(|e| LinkageError::Config(format!("bad merge_log timestamp: {e}")))?
                .with_timezone(&Utc);
            Ok(MergeLogEntry {
                run_id,
                kept_id,
                deleted_id,
                updated: serde_json::from_str(&updated)?,
                conflicts: serde_json::from_str(&conflicts)?,
                merged_at,
            })
        })
        .collect()
}

// ============================================================================
// OUTPUT TABLES
// ============================================================================

/// Upsert location groups; the stable group id makes this idempotent
///
/// An earlier group sharing any member is replaced, so an entity belongs to
/// at most one group.
pub fn save_location_groups(conn: &Connection, groups: &[LocationGroup], run_id: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    for member in groups.iter().flat_map(|g| g.members.iter()) {
        tx.execute(
            "DELETE FROM location_groups
             WHERE group_id IN (SELECT group_id FROM location_groups WHERE entity_id = ?1)",
            params![member],
        )?;
    }

    let mut rows = 0;
    for group in groups {
        for member in &group.members {
            rows += tx.execute(
                "INSERT OR REPLACE INTO location_groups (group_id, entity_id, representative, run_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group.group_id, member, group.representative, run_id],
            )?;
        }
    }
    tx.commit()?;
    Ok(rows)
}

/// group_id → members
pub fn load_location_groups(conn: &Connection) -> Result<BTreeMap<String, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT group_id, entity_id FROM location_groups ORDER BY group_id, entity_id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (group_id, entity_id) in rows {
        groups.entry(group_id).or_default().push(entity_id);
    }
    Ok(groups)
}

/// Replace the hierarchy outputs with a fresh resolution
pub fn save_hierarchy(conn: &Connection, edges: &[HierarchyEdge], parents: &[UltimateParent]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM hierarchy_edges", [])?;
    tx.execute("DELETE FROM ultimate_parents", [])?;

    for edge in edges {
        tx.execute(
            "INSERT INTO hierarchy_edges (space, child, parent, source, relationship, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.space.as_str(),
                edge.child,
                edge.parent,
                edge.source,
                edge.relationship.as_str(),
                edge.tier.as_str(),
            ],
        )?;
    }

    for up in parents {
        tx.execute(
            "INSERT INTO ultimate_parents (
                entity_id, space, ultimate_parent, ultimate_parent_entity, depth, source,
                cycle_truncated, hop_capped
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                up.entity_id,
                up.space.as_str(),
                up.ultimate_parent,
                up.ultimate_parent_entity,
                up.depth as i64,
                up.source,
                up.cycle_truncated,
                up.hop_capped,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn load_ultimate_parents(conn: &Connection) -> Result<Vec<UltimateParent>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, space, ultimate_parent, ultimate_parent_entity, depth, source,
                cycle_truncated, hop_capped
         FROM ultimate_parents
         ORDER BY entity_id, space",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(entity_id, space, ultimate_parent, ultimate_parent_entity, depth, source, cycle_truncated, hop_capped)| -> Result<UltimateParent> {
            Ok(UltimateParent {
                entity_id,
                space: space.parse()?,
                ultimate_parent,
                ultimate_parent_entity,
                depth: depth.max(0) as usize,
                source,
                cycle_truncated,
                hop_capped,
            })
        })
        .collect()
}

/// Replace the crosswalk with a fresh build
pub fn save_crosswalk(conn: &Connection, records: &[CrosswalkRecord]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM crosswalk", [])?;
    for r in records {
        tx.execute(
            "INSERT INTO crosswalk (
                entity_id, source, tax_id, registry_number, lei, ticker, linked_ids,
                join_method, confidence
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                r.entity_id,
                r.source,
                r.tax_id,
                r.registry_number,
                r.lei,
                r.ticker,
                serde_json::to_string(&r.linked_ids)?,
                r.join_method.as_str(),
                r.confidence.as_str(),
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn load_crosswalk(conn: &Connection) -> Result<Vec<CrosswalkRecord>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, source, tax_id, registry_number, lei, ticker, linked_ids,
                join_method, confidence
         FROM crosswalk
         ORDER BY entity_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                (
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ),
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|((entity_id, source), (tax_id, registry_number, lei, ticker), linked, method, confidence)| -> Result<CrosswalkRecord> {
            Ok(CrosswalkRecord {
                entity_id,
                source,
                tax_id,
                registry_number,
                lei,
                ticker,
                linked_ids: serde_json::from_str(&linked)?,
                join_method: method.parse::<JoinMethod>()?,
                confidence: confidence.parse()?,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ConfidenceTier, RelationshipKind};
    use crate::normalize::Normalizer;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn create_test_entity(id: &str, source: &str, name: &str) -> EntityRecord {
        let n = Normalizer::default();
        EntityRecord::new(id, source, name, &n)
            .with_state("NY", &n)
            .with_city("Buffalo", &n)
            .with_identifier(IdentifierKind::TaxId, "12-3456789")
            .with_weight(40)
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = create_test_db();
        setup_database(&conn).unwrap();
        assert_eq!(entity_count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_import_twice_skips_duplicates() {
        let conn = create_test_db();
        let entities = vec![
            create_test_entity("f7:1", "f7", "Acme Foods, Inc."),
            create_test_entity("f7:2", "f7", "Zenith Steel"),
        ];

        let first = insert_entities(&conn, &entities).unwrap();
        assert_eq!(first.inserted, 2);

        let second = insert_entities(&conn, &entities).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(entity_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_entities_round_trip() {
        let conn = create_test_db();
        let n = Normalizer::default();
        let original = create_test_entity("sec:9", "sec", "Acme Holdings Corp")
            .with_identifier(IdentifierKind::Lei, "549300ABCDEFGHIJK123")
            .with_parent(IdentifierKind::Lei, "549300ZZZZZZZZZZZZ99")
            .with_zip("14201-1234")
            .with_street("1 Main Street", &n);
        insert_entities(&conn, &[original.clone()]).unwrap();

        let loaded = load_entities(&conn, Some("sec")).unwrap();
        assert_eq!(loaded.len(), 1);
        let mut expected = original;
        expected.identifiers.sort();
        assert_eq!(loaded[0], expected);

        assert!(load_entities(&conn, Some("osha")).unwrap().is_empty());
        assert_eq!(load_entities(&conn, None).unwrap().len(), 1);
    }

    #[test]
    fn test_ownership_links_round_trip() {
        let conn = create_test_db();
        let link = OwnershipLink {
            child: Identifier::parse(IdentifierKind::Lei, "549300AAAAAAAAAAAA01").unwrap(),
            parent: Identifier::parse(IdentifierKind::Lei, "549300BBBBBBBBBBBB02").unwrap(),
            source: "gleif".to_string(),
            relationship: RelationshipKind::Direct,
        };
        let stats = insert_ownership_links(&conn, &[link.clone(), link.clone()]).unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(load_ownership_links(&conn).unwrap(), vec![link]);
    }

    #[test]
    fn test_reference_count_and_orphans() {
        let conn = create_test_db();
        insert_entities(&conn, &[create_test_entity("f7:1", "f7", "Acme")]).unwrap();
        conn.execute("CREATE TABLE filings (id INTEGER PRIMARY KEY, employer_id TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO filings (employer_id) VALUES ('f7:1'), ('f7:1'), ('gone')", [])
            .unwrap();

        let tables = vec![
            ReferenceTable::new("entity_identifiers", "entity_id", &["kind", "value"]),
            ReferenceTable::new("filings", "employer_id", &[]),
        ];
        assert_eq!(reference_count(&conn, &tables, "f7:1").unwrap(), 3);

        let orphans = orphan_counts(&conn, &tables).unwrap();
        assert_eq!(orphans["filings.employer_id"], 1);
        assert_eq!(orphans["entity_identifiers.entity_id"], 0);
    }

    #[test]
    fn test_merge_log_round_trip() {
        let conn = create_test_db();
        let entry = MergeLogEntry {
            run_id: "run-1".to_string(),
            kept_id: "a".to_string(),
            deleted_id: "b".to_string(),
            updated: BTreeMap::from([("filings.employer_id".to_string(), 3)]),
            conflicts: BTreeMap::from([("entity_identifiers.entity_id".to_string(), 1)]),
            merged_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        insert_merge_log(&conn, &entry).unwrap();

        assert!(logged_deleted_ids(&conn).unwrap().contains("b"));
        assert_eq!(load_merge_log(&conn, Some("run-1")).unwrap(), vec![entry]);
        assert!(load_merge_log(&conn, Some("run-2")).unwrap().is_empty());
    }

    #[test]
    fn test_location_groups_upsert_is_idempotent() {
        let conn = create_test_db();
        let group = LocationGroup::new(vec!["a".into(), "b".into()], "a".into());
        save_location_groups(&conn, &[group.clone()], "run-1").unwrap();
        save_location_groups(&conn, &[group.clone()], "run-2").unwrap();

        let groups = load_location_groups(&conn).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&group.group_id], vec!["a", "b"]);
    }

    #[test]
    fn test_location_groups_replace_stale_membership() {
        let conn = create_test_db();
        let first = LocationGroup::new(vec!["a".into(), "b".into()], "a".into());
        let second = LocationGroup::new(vec!["a".into(), "c".into()], "a".into());
        save_location_groups(&conn, &[first.clone()], "run-1").unwrap();
        save_location_groups(&conn, &[second.clone()], "run-2").unwrap();

        let groups = load_location_groups(&conn).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(!groups.contains_key(&first.group_id));
        assert_eq!(groups[&second.group_id], vec!["a", "c"]);
    }

    fn create_test_crosswalk_row(id: &str, source: &str, linked: &[&str]) -> CrosswalkRecord {
        CrosswalkRecord {
            entity_id: id.to_string(),
            source: source.to_string(),
            tax_id: Some("123456789".to_string()),
            registry_number: None,
            lei: None,
            ticker: None,
            linked_ids: linked.iter().map(|s| s.to_string()).collect(),
            join_method: JoinMethod::ExactIdentifier,
            confidence: ConfidenceTier::High,
        }
    }

    #[test]
    fn test_crosswalk_orphans_counted() {
        let conn = create_test_db();
        insert_entities(&conn, &[create_test_entity("f7:1", "f7", "Acme")]).unwrap();
        save_crosswalk(
            &conn,
            &[
                create_test_crosswalk_row("f7:1", "f7", &["gone:1"]),
                create_test_crosswalk_row("gone:1", "sec", &["f7:1"]),
            ],
        )
        .unwrap();

        let orphans = orphan_counts(&conn, &[]).unwrap();
        assert_eq!(orphans["crosswalk.entity_id"], 1);
        assert_eq!(orphans["crosswalk.linked_ids"], 1);
    }

    #[test]
    fn test_repoint_crosswalk_folds_into_keeper_row() {
        let conn = create_test_db();
        save_crosswalk(
            &conn,
            &[
                create_test_crosswalk_row("f7:1", "f7", &["osha:7", "sec:3"]),
                create_test_crosswalk_row("osha:7", "osha", &["f7:1", "sec:3"]),
                create_test_crosswalk_row("sec:3", "sec", &["f7:1", "osha:7"]),
            ],
        )
        .unwrap();

        let (rewritten, dropped) = repoint_crosswalk(&conn, "f7:1", "osha:7").unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(rewritten, 2);

        let rows = load_crosswalk(&conn).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_id, "f7:1");
        assert_eq!(rows[0].linked_ids, vec!["sec:3"]);
        assert_eq!(rows[1].entity_id, "sec:3");
        assert_eq!(rows[1].linked_ids, vec!["f7:1"]);
    }

    #[test]
    fn test_repoint_crosswalk_moves_row_and_drops_self_link() {
        let conn = create_test_db();
        insert_entities(&conn, &[create_test_entity("f7:1", "f7", "Acme")]).unwrap();
        save_crosswalk(
            &conn,
            &[
                create_test_crosswalk_row("osha:7", "osha", &["sec:3"]),
                create_test_crosswalk_row("sec:3", "sec", &["osha:7"]),
            ],
        )
        .unwrap();

        repoint_crosswalk(&conn, "f7:1", "osha:7").unwrap();
        let rows = load_crosswalk(&conn).unwrap();
        assert_eq!(rows[0].entity_id, "f7:1");
        assert_eq!(rows[0].source, "f7");
        assert_eq!(rows[0].linked_ids, vec!["sec:3"]);
        assert_eq!(rows[1].linked_ids, vec!["f7:1"]);

        // A pair collapsing into one entity leaves nothing to link
        repoint_crosswalk(&conn, "f7:1", "sec:3").unwrap();
        assert!(load_crosswalk(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_crosswalk_round_trip() {
        let conn = create_test_db();
        let record = CrosswalkRecord {
            entity_id: "f7:1".to_string(),
            source: "f7".to_string(),
            tax_id: Some("123456789".to_string()),
            registry_number: None,
            lei: None,
            ticker: None,
            linked_ids: vec!["sec:9".to_string()],
            join_method: JoinMethod::ExactIdentifier,
            confidence: ConfidenceTier::High,
        };
        save_crosswalk(&conn, &[record.clone()]).unwrap();
        save_crosswalk(&conn, &[record.clone()]).unwrap();
        assert_eq!(load_crosswalk(&conn).unwrap(), vec![record]);
    }

    #[test]
    fn test_hierarchy_save_replaces_previous() {
        let conn = create_test_db();
        let edge = HierarchyEdge {
            space: IdentifierKind::Lei,
            child: "C".to_string(),
            parent: "P".to_string(),
            source: "gleif".to_string(),
            relationship: RelationshipKind::Direct,
            tier: ConfidenceTier::High,
        };
        let up = UltimateParent {
            entity_id: "sec:1".to_string(),
            space: IdentifierKind::Lei,
            ultimate_parent: "P".to_string(),
            ultimate_parent_entity: None,
            depth: 1,
            source: "gleif".to_string(),
            cycle_truncated: false,
            hop_capped: false,
        };
        save_hierarchy(&conn, &[edge.clone()], &[up.clone()]).unwrap();
        save_hierarchy(&conn, &[edge], &[up.clone()]).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM hierarchy_edges", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(load_ultimate_parents(&conn).unwrap(), vec![up]);
    }
}
