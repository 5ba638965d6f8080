#![forbid(unsafe_code)]

//! Out-of-band auditing of the denormalized `tags` field and the closure table
//! against the primary chunk rows.

use super::support::*;
use super::{SqliteStore, StoreError, canonical_id};
use chunkdb_core::chunk::{ChunkReference, same_tag_set};
use rusqlite::{Transaction, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchType {
    TagFieldMismatch,
    OrphanedTagRelation,
    MissingParent,
    ParentCycle,
    HierarchyTooDeep,
    MissingClosureRow,
    UnexpectedClosureRow,
    ClosureDepthMismatch,
    ClosurePathMismatch,
    OrphanedClosureRow,
    MissingPage,
    MissingReference,
}

impl MismatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TagFieldMismatch => "tag_field_mismatch",
            Self::OrphanedTagRelation => "orphaned_tag_relation",
            Self::MissingParent => "missing_parent",
            Self::ParentCycle => "parent_cycle",
            Self::HierarchyTooDeep => "hierarchy_too_deep",
            Self::MissingClosureRow => "missing_closure_row",
            Self::UnexpectedClosureRow => "unexpected_closure_row",
            Self::ClosureDepthMismatch => "closure_depth_mismatch",
            Self::ClosurePathMismatch => "closure_path_mismatch",
            Self::OrphanedClosureRow => "orphaned_closure_row",
            Self::MissingPage => "missing_page",
            Self::MissingReference => "missing_reference",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::ParentCycle => Severity::Critical,
            Self::MissingParent
            | Self::HierarchyTooDeep
            | Self::MissingClosureRow
            | Self::UnexpectedClosureRow => Severity::High,
            Self::TagFieldMismatch
            | Self::ClosureDepthMismatch
            | Self::ClosurePathMismatch
            | Self::OrphanedClosureRow
            | Self::MissingPage => Severity::Medium,
            Self::OrphanedTagRelation | Self::MissingReference => Severity::Low,
        }
    }
}

/// A chunk whose `tags` field disagrees, as a set, with its relation rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMismatch {
    pub chunk_id: String,
    pub primary_tags: Vec<String>,
    pub index_tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedTagRelation {
    pub source_chunk_id: String,
    pub tag_chunk_id: String,
    pub missing_source: bool,
    pub missing_tag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConsistencyReport {
    pub mismatches: Vec<TagMismatch>,
    pub orphaned_relations: Vec<OrphanedTagRelation>,
}

impl TagConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.orphaned_relations.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyIssue {
    pub chunk_id: String,
    pub mismatch_type: MismatchType,
    pub details: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRepair {
    pub chunk_id: String,
    /// Field value after the repair; the relation rows now match it.
    pub tags: Vec<String>,
    /// Ids dropped because they no longer name a usable tag chunk.
    pub dropped_tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRepairSummary {
    pub repaired: Vec<TagRepair>,
    pub failed: Vec<String>,
    pub orphaned_relations_removed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub chunk_id: String,
    pub mismatch_type: MismatchType,
    pub severity: Severity,
    pub details: String,
}

impl Finding {
    fn new(chunk_id: impl Into<String>, mismatch_type: MismatchType, details: String) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            mismatch_type,
            severity: mismatch_type.severity(),
            details,
        }
    }
}

impl From<TagMismatch> for Finding {
    fn from(value: TagMismatch) -> Self {
        let details = format!(
            "tags field {:?} differs from relation rows {:?}",
            value.primary_tags, value.index_tags
        );
        Self::new(value.chunk_id, MismatchType::TagFieldMismatch, details)
    }
}

impl From<OrphanedTagRelation> for Finding {
    fn from(value: OrphanedTagRelation) -> Self {
        let details = format!(
            "relation to tag {} (missing_source={}, missing_tag={})",
            value.tag_chunk_id, value.missing_source, value.missing_tag
        );
        Self::new(value.source_chunk_id, MismatchType::OrphanedTagRelation, details)
    }
}

impl From<HierarchyIssue> for Finding {
    fn from(value: HierarchyIssue) -> Self {
        Self::new(value.chunk_id, value.mismatch_type, value.details)
    }
}

/// The serializable result of a full audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// RFC 3339, UTC.
    pub checked_at: String,
    pub chunks_scanned: usize,
    pub cancelled: bool,
    pub findings: Vec<Finding>,
    pub counts_by_type: BTreeMap<String, usize>,
    pub counts_by_severity: BTreeMap<String, usize>,
}

impl ConsistencyReport {
    fn new(chunks_scanned: usize, cancelled: bool, findings: Vec<Finding>) -> Self {
        let mut counts_by_type = BTreeMap::new();
        let mut counts_by_severity = BTreeMap::new();
        for finding in &findings {
            *counts_by_type
                .entry(finding.mismatch_type.as_str().to_string())
                .or_insert(0) += 1;
            *counts_by_severity
                .entry(finding.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        Self {
            checked_at: rfc3339_now(),
            chunks_scanned,
            cancelled,
            findings,
            counts_by_type,
            counts_by_severity,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub(super) struct ScanScope {
    pub(super) tags: bool,
    pub(super) hierarchy: bool,
}

#[derive(Debug, Default)]
pub(super) struct ScanOutcome {
    pub(super) tag_mismatches: Vec<TagMismatch>,
    pub(super) orphaned_relations: Vec<OrphanedTagRelation>,
    pub(super) hierarchy_issues: Vec<HierarchyIssue>,
    pub(super) chunks_scanned: usize,
    pub(super) cancelled: bool,
}

struct AuditRow {
    chunk_id: String,
    parent_id: Option<String>,
    page_id: Option<String>,
    reference: Option<String>,
    tags_json: String,
}

fn audit_batch_tx(
    tx: &Transaction<'_>,
    after: Option<&str>,
    batch_size: usize,
) -> Result<Vec<AuditRow>, StoreError> {
    let limit = to_sqlite_i64("audit", batch_size)?;
    let mut stmt = tx.prepare_cached(
        "SELECT chunk_id, parent_id, page_id, ref, tags_json FROM chunks \
         WHERE ?1 IS NULL OR chunk_id > ?1 ORDER BY chunk_id ASC LIMIT ?2",
    )?;
    let mut rows = stmt.query(params![after, limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(AuditRow {
            chunk_id: row.get(0)?,
            parent_id: row.get(1)?,
            page_id: row.get(2)?,
            reference: row.get(3)?,
            tags_json: row.get(4)?,
        });
    }
    Ok(out)
}

fn tag_mismatch_tx(
    tx: &Transaction<'_>,
    row: &AuditRow,
) -> Result<Option<TagMismatch>, StoreError> {
    let Ok(primary_tags) = serde_json::from_str::<Vec<String>>(&row.tags_json) else {
        return Err(StoreError::Consistency {
            chunk_id: row.chunk_id.clone(),
            mismatch_type: "corrupt_tags_field",
        });
    };
    let index_tags = relation_tag_ids_tx(tx, &row.chunk_id)?;
    if same_tag_set(&primary_tags, &index_tags) {
        return Ok(None);
    }
    Ok(Some(TagMismatch {
        chunk_id: row.chunk_id.clone(),
        primary_tags,
        index_tags,
    }))
}

fn hierarchy_issues_tx(
    tx: &Transaction<'_>,
    row: &AuditRow,
    max_depth: usize,
) -> Result<Vec<HierarchyIssue>, StoreError> {
    let mut issues = Vec::new();
    let issue = |mismatch_type, details: String| HierarchyIssue {
        chunk_id: row.chunk_id.clone(),
        mismatch_type,
        details,
    };

    if let Some(page) = row.page_id.as_deref() {
        if page != row.chunk_id && !chunk_exists_tx(tx, page)? {
            issues.push(issue(MismatchType::MissingPage, format!("page {page} does not exist")));
        }
    }
    if let Some(raw) = row.reference.as_deref() {
        if let Ok(reference) = ChunkReference::parse(raw) {
            if let Some(target) = reference.internal_id() {
                if !chunk_exists_tx(tx, target.as_str())? {
                    issues.push(issue(
                        MismatchType::MissingReference,
                        format!("ref {raw} does not resolve"),
                    ));
                }
            }
        }
    }

    // Walk the parent pointers to derive the closure rows this chunk should have.
    let mut chain = vec![row.chunk_id.clone()];
    let mut seen: BTreeSet<String> = chain.iter().cloned().collect();
    let mut cursor = row.parent_id.clone();
    let mut chain_complete = true;
    while let Some(parent) = cursor {
        if seen.contains(&parent) {
            issues.push(issue(
                MismatchType::ParentCycle,
                format!("parent chain loops back to {parent}"),
            ));
            return Ok(issues);
        }
        if chain.len() > max_depth {
            issues.push(issue(
                MismatchType::HierarchyTooDeep,
                format!("parent chain exceeds max depth {max_depth}"),
            ));
            return Ok(issues);
        }
        match parent_of_tx(tx, &parent)? {
            Some(next) => {
                seen.insert(parent.clone());
                chain.push(parent);
                cursor = next;
            }
            None => {
                // A break further up is reported by the chunk that owns the pointer.
                if chain.len() == 1 {
                    issues.push(issue(
                        MismatchType::MissingParent,
                        format!("parent {parent} does not exist"),
                    ));
                }
                chain_complete = false;
                cursor = None;
            }
        }
    }

    let actual: BTreeMap<String, ClosureRow> = ancestor_rows_tx(tx, &row.chunk_id)?
        .into_iter()
        .map(|closure| (closure.ancestor_id.clone(), closure))
        .collect();

    for (depth, ancestor_id) in chain.iter().enumerate() {
        let mut expected_path: Vec<String> = chain[..=depth].to_vec();
        expected_path.reverse();
        match actual.get(ancestor_id) {
            None => issues.push(issue(
                MismatchType::MissingClosureRow,
                format!("no closure row from ancestor {ancestor_id} at depth {depth}"),
            )),
            Some(found) if found.depth != depth => issues.push(issue(
                MismatchType::ClosureDepthMismatch,
                format!(
                    "ancestor {ancestor_id}: depth {} recorded, {depth} expected",
                    found.depth
                ),
            )),
            Some(found) if found.path != expected_path => issues.push(issue(
                MismatchType::ClosurePathMismatch,
                format!(
                    "ancestor {ancestor_id}: path {:?} recorded, {expected_path:?} expected",
                    found.path
                ),
            )),
            Some(_) => {}
        }
    }

    let expected: BTreeSet<&str> = chain.iter().map(String::as_str).collect();
    for ancestor_id in actual.keys() {
        if expected.contains(ancestor_id.as_str()) {
            continue;
        }
        if chunk_exists_tx(tx, ancestor_id)? {
            // Rows above a broken link are not derivable, so only flag them on a complete chain.
            if chain_complete {
                issues.push(issue(
                    MismatchType::UnexpectedClosureRow,
                    format!("closure row from {ancestor_id} is not on the parent chain"),
                ));
            }
        } else {
            issues.push(issue(
                MismatchType::OrphanedClosureRow,
                format!("closure row from missing ancestor {ancestor_id}"),
            ));
        }
    }

    Ok(issues)
}

fn orphaned_tag_relations_tx(tx: &Transaction<'_>) -> Result<Vec<OrphanedTagRelation>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT ct.source_chunk_id, ct.tag_chunk_id, \
                NOT EXISTS (SELECT 1 FROM chunks s WHERE s.chunk_id = ct.source_chunk_id), \
                NOT EXISTS (SELECT 1 FROM chunks t WHERE t.chunk_id = ct.tag_chunk_id) \
         FROM chunk_tags ct \
         WHERE NOT EXISTS (SELECT 1 FROM chunks s WHERE s.chunk_id = ct.source_chunk_id) \
            OR NOT EXISTS (SELECT 1 FROM chunks t WHERE t.chunk_id = ct.tag_chunk_id) \
         ORDER BY ct.source_chunk_id, ct.tag_chunk_id",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(OrphanedTagRelation {
            source_chunk_id: row.get(0)?,
            tag_chunk_id: row.get(1)?,
            missing_source: row.get(2)?,
            missing_tag: row.get(3)?,
        });
    }
    Ok(out)
}

/// Closure rows whose descendant no longer exists; rows with a missing ancestor are
/// reported per descendant by the chunk scan.
fn orphaned_closure_rows_tx(tx: &Transaction<'_>) -> Result<Vec<HierarchyIssue>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT h.descendant_id, h.ancestor_id FROM chunk_hierarchy h \
         WHERE NOT EXISTS (SELECT 1 FROM chunks c WHERE c.chunk_id = h.descendant_id) \
         ORDER BY h.descendant_id, h.ancestor_id",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let descendant_id: String = row.get(0)?;
        let ancestor_id: String = row.get(1)?;
        out.push(HierarchyIssue {
            chunk_id: descendant_id.clone(),
            mismatch_type: MismatchType::OrphanedClosureRow,
            details: format!("closure row ({ancestor_id} -> {descendant_id}) for a missing chunk"),
        });
    }
    Ok(out)
}

impl SqliteStore {
    /// Walks every chunk in keyset-paginated batches, each in its own read snapshot.
    /// A chunk that fails to check is logged and skipped.
    pub(super) fn scan_consistency(
        &self,
        scope: ScanScope,
        batch_size: usize,
        pause: Duration,
        cancel: &AtomicBool,
    ) -> Result<ScanOutcome, StoreError> {
        const OP: &str = "consistency_scan";
        let max_depth = self.config.max_hierarchy_depth;
        let mut outcome = ScanOutcome::default();
        let mut cursor: Option<String> = None;

        loop {
            if cancel.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let (scanned, last, tag_mismatches, hierarchy_issues) = self.read_tx(OP, |tx| {
                let batch = audit_batch_tx(tx, cursor.as_deref(), batch_size.max(1))?;
                let mut tag_mismatches = Vec::new();
                let mut hierarchy_issues = Vec::new();
                for row in &batch {
                    if scope.tags {
                        match tag_mismatch_tx(tx, row) {
                            Ok(Some(mismatch)) => tag_mismatches.push(mismatch),
                            Ok(None) => {}
                            Err(err) => {
                                warn!(chunk_id = %row.chunk_id, error = %err, "skipping chunk in tag audit");
                            }
                        }
                    }
                    if scope.hierarchy {
                        match hierarchy_issues_tx(tx, row, max_depth) {
                            Ok(mut issues) => hierarchy_issues.append(&mut issues),
                            Err(err) => {
                                warn!(chunk_id = %row.chunk_id, error = %err, "skipping chunk in hierarchy audit");
                            }
                        }
                    }
                }
                let last = batch.last().map(|row| row.chunk_id.clone());
                Ok((batch.len(), last, tag_mismatches, hierarchy_issues))
            })?;

            outcome.chunks_scanned += scanned;
            outcome.tag_mismatches.extend(tag_mismatches);
            outcome.hierarchy_issues.extend(hierarchy_issues);

            match last {
                Some(last) if scanned >= batch_size.max(1) => cursor = Some(last),
                _ => break,
            }
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }

        let (orphaned_relations, orphaned_closure_rows) = self.read_tx(OP, |tx| {
            let relations = if scope.tags {
                orphaned_tag_relations_tx(tx)?
            } else {
                Vec::new()
            };
            let closure_rows = if scope.hierarchy {
                orphaned_closure_rows_tx(tx)?
            } else {
                Vec::new()
            };
            Ok((relations, closure_rows))
        })?;
        outcome.orphaned_relations = orphaned_relations;
        outcome.hierarchy_issues.extend(orphaned_closure_rows);
        Ok(outcome)
    }

    /// Read-only comparison of every chunk's `tags` field with its relation rows.
    pub fn check_tag_consistency(&self) -> Result<TagConsistencyReport, StoreError> {
        let outcome = self.scan_consistency(
            ScanScope {
                tags: true,
                hierarchy: false,
            },
            self.config.audit.batch_size,
            Duration::ZERO,
            &AtomicBool::new(false),
        )?;
        Ok(TagConsistencyReport {
            mismatches: outcome.tag_mismatches,
            orphaned_relations: outcome.orphaned_relations,
        })
    }

    /// Read-only verification of parent pointers, closure rows, pages and internal refs.
    pub fn check_hierarchy_integrity(&self) -> Result<Vec<HierarchyIssue>, StoreError> {
        let outcome = self.scan_consistency(
            ScanScope {
                tags: false,
                hierarchy: true,
            },
            self.config.audit.batch_size,
            Duration::ZERO,
            &AtomicBool::new(false),
        )?;
        Ok(outcome.hierarchy_issues)
    }

    pub fn check_all(&self) -> Result<ConsistencyReport, StoreError> {
        self.audit_report(Duration::ZERO, &AtomicBool::new(false))
    }

    pub(super) fn audit_report(
        &self,
        pause: Duration,
        cancel: &AtomicBool,
    ) -> Result<ConsistencyReport, StoreError> {
        let outcome = self.scan_consistency(
            ScanScope {
                tags: true,
                hierarchy: true,
            },
            self.config.audit.batch_size,
            pause,
            cancel,
        )?;

        let mut findings: Vec<Finding> = Vec::new();
        findings.extend(outcome.tag_mismatches.into_iter().map(Finding::from));
        findings.extend(outcome.orphaned_relations.into_iter().map(Finding::from));
        findings.extend(outcome.hierarchy_issues.into_iter().map(Finding::from));
        let report = ConsistencyReport::new(outcome.chunks_scanned, outcome.cancelled, findings);
        info!(
            chunks_scanned = report.chunks_scanned,
            findings = report.findings.len(),
            cancelled = report.cancelled,
            "consistency audit finished"
        );
        Ok(report)
    }

    /// Rebuilds the relation rows of one chunk from its `tags` field.
    pub fn repair_tag_consistency(&mut self, chunk_id: &str) -> Result<TagRepair, StoreError> {
        const OP: &str = "repair_tag_consistency";
        let chunk_id = canonical_id(OP, "chunk_id", chunk_id)?;

        let repair = self.write_tx(OP, |tx, ctx| {
            let chunk = require_chunk_tx(tx, OP, "chunk", &chunk_id)?;
            let mut kept: Vec<String> = Vec::new();
            let mut dropped: Vec<String> = Vec::new();
            for tag_id in &chunk.tags {
                let usable = tag_id != &chunk_id
                    && !kept.contains(tag_id)
                    && is_tag_chunk_tx(tx, tag_id)? == Some(true);
                if usable {
                    kept.push(tag_id.clone());
                } else if !kept.contains(tag_id) {
                    dropped.push(tag_id.clone());
                }
            }

            let now_ms = ctx.next_ts();
            let previous = clear_tag_relations_tx(tx, &chunk_id)?;
            insert_tag_relations_tx(tx, &chunk_id, &kept, now_ms)?;
            if kept != chunk.tags {
                set_tags_field_tx(tx, &chunk_id, &kept, now_ms)?;
            }

            ctx.invalidation.tags(&previous);
            ctx.invalidation.tags(&kept);
            ctx.invalidation.chunk_tags(&chunk_id);
            Ok(TagRepair {
                chunk_id: chunk_id.clone(),
                tags: kept,
                dropped_tags: dropped,
            })
        })?;

        if !repair.dropped_tags.is_empty() {
            warn!(
                chunk_id = %repair.chunk_id,
                dropped = ?repair.dropped_tags,
                "dropped tag ids that no longer name a tag chunk"
            );
        }
        info!(chunk_id = %repair.chunk_id, tags = repair.tags.len(), "tag relations rebuilt");
        Ok(repair)
    }

    /// Repairs every mismatching chunk, each in its own transaction, then drops
    /// relation rows whose endpoints are gone.
    pub fn repair_all_tag_consistency(&mut self) -> Result<TagRepairSummary, StoreError> {
        const OP: &str = "repair_all_tag_consistency";
        let report = self.check_tag_consistency()?;
        let mut summary = TagRepairSummary::default();

        for mismatch in &report.mismatches {
            match self.repair_tag_consistency(&mismatch.chunk_id) {
                Ok(repair) => summary.repaired.push(repair),
                Err(err) => {
                    warn!(chunk_id = %mismatch.chunk_id, error = %err, "tag repair failed");
                    summary.failed.push(mismatch.chunk_id.clone());
                }
            }
        }

        if !report.orphaned_relations.is_empty() {
            let orphans = report.orphaned_relations.clone();
            summary.orphaned_relations_removed = self.write_tx(OP, |tx, ctx| {
                let mut removed = 0;
                for orphan in &orphans {
                    removed += tx.execute(
                        "DELETE FROM chunk_tags WHERE source_chunk_id=?1 AND tag_chunk_id=?2",
                        params![orphan.source_chunk_id, orphan.tag_chunk_id],
                    )?;
                    ctx.invalidation.tag(&orphan.tag_chunk_id);
                    ctx.invalidation.chunk_tags(&orphan.source_chunk_id);
                }
                Ok(removed)
            })?;
        }

        info!(
            repaired = summary.repaired.len(),
            failed = summary.failed.len(),
            orphaned_relations_removed = summary.orphaned_relations_removed,
            "tag consistency repair finished"
        );
        Ok(summary)
    }
}
