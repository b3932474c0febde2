//! Row-level pruning inside one table.
//!
//! A table prune removes the rows belonging to missing headings: each heading's span runs from
//! its own row to the row before the next expected heading. A checklist filter keeps only rows
//! whose first cell names a selected item and fills in the kept rows.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::docx::table::{select_table, TableLayout, TableSelector};
use crate::docx::xml::{XmlEvent, XmlPart};
use crate::error::{AssemblyError, Result};
use crate::fields::{HeadingTaxonomy, PresenceSet};
use crate::rows::{rebuild_cell, RunFont};

#[derive(Clone, Debug, Deserialize)]
pub struct TablePruneSpec {
    pub table: TableSelector,
    /// Every heading row label in the order the table lays them out.
    pub headings: Vec<String>,
    /// Headings whose rows go regardless of field data.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Heading label → owning field code. Headings not listed here fall back to the field of
    /// the taxonomy entry with the same title.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl TablePruneSpec {
    /// Owning field code of `heading`, if any.
    pub fn field_of<'a>(&'a self, heading: &str, taxonomy: &'a HeadingTaxonomy) -> Option<&'a str> {
        self.fields.get(heading).map(String::as_str).or_else(|| {
            taxonomy
                .entries
                .iter()
                .find(|e| e.title.trim() == heading.trim())
                .and_then(|e| e.field.as_deref())
        })
    }

    /// Copy whose `missing` also holds every heading with an owning field that has no data,
    /// in table order.
    pub fn with_presence(&self, presence: &PresenceSet, taxonomy: &HeadingTaxonomy) -> Self {
        let mut resolved = self.clone();
        for heading in &self.headings {
            let absent = self
                .field_of(heading, taxonomy)
                .is_some_and(|field| !presence.contains(field.trim()));
            if absent && !resolved.missing.contains(heading) {
                resolved.missing.push(heading.clone());
            }
        }
        resolved
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TablePruneReport {
    pub table: String,
    pub original_rows: usize,
    pub removed_rows: usize,
    pub retained_rows: usize,
    pub pruned: Vec<String>,
    pub not_found: Vec<String>,
}

/// Inclusive row span of `headings[pos]`.
///
/// `None` when the heading row is absent, or when the next heading's row does not come after
/// it (the span would be empty).
pub fn compute_span(
    layout: &TableLayout,
    headings: &[String],
    pos: usize,
) -> Option<(usize, usize)> {
    let start = layout.locate(headings.get(pos)?)?;
    let last = layout.rows.len().checked_sub(1)?;
    let end = match headings.get(pos + 1).and_then(|next| layout.locate(next)) {
        Some(next) if next > start => next - 1,
        Some(_) => return None,
        None => last,
    };
    Some((start, end))
}

pub fn prune_table(part: &mut XmlPart, spec: &TablePruneSpec) -> Result<TablePruneReport> {
    let layout = select_table(part, &spec.table)?;
    let mut report = TablePruneReport {
        table: spec.table.to_string(),
        original_rows: layout.rows.len(),
        ..TablePruneReport::default()
    };

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for heading in &spec.missing {
        let Some(pos) = spec.headings.iter().position(|h| h == heading) else {
            warn!(
                table = %report.table,
                %heading,
                "missing heading is not part of the heading list; skipped"
            );
            report.not_found.push(heading.clone());
            continue;
        };
        match compute_span(&layout, &spec.headings, pos) {
            Some(span) => {
                debug!(table = %report.table, %heading, start = span.0, end = span.1, "row span");
                spans.push(span);
                report.pruned.push(heading.clone());
            }
            None => {
                debug!(table = %report.table, %heading, "no rows in scope for heading");
                report.not_found.push(heading.clone());
            }
        }
    }

    // Descending start; overlapping spans collapse into one row set.
    spans.sort_by(|a, b| b.0.cmp(&a.0));
    let doomed: BTreeSet<usize> = spans.iter().flat_map(|&(s, e)| s..=e).collect();
    let mut ranges: Vec<(usize, usize)> = doomed
        .iter()
        .rev()
        .map(|&r| (layout.rows[r].start, layout.rows[r].end))
        .collect();
    part.remove_ranges(&mut ranges);

    report.removed_rows = doomed.len();
    report.retained_rows =
        verify_row_count(part, &spec.table, report.original_rows, doomed.len())?;
    Ok(report)
}

fn verify_row_count(
    part: &XmlPart,
    table: &TableSelector,
    original: usize,
    removed: usize,
) -> Result<usize> {
    let retained = select_table(part, table)?.rows.len();
    if retained + removed != original {
        return Err(AssemblyError::xml(
            &part.name,
            anyhow::anyhow!(
                "table {table}: {removed} removed + {retained} retained != {original} original rows"
            ),
        ));
    }
    Ok(retained)
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChecklistItem {
    pub name: String,
    /// Texts for columns 1.. of the item's row.
    #[serde(default)]
    pub values: Vec<String>,
}

fn default_header_rows() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChecklistSpec {
    pub table: TableSelector,
    pub items: Vec<ChecklistItem>,
    #[serde(default = "default_header_rows")]
    pub header_rows: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ChecklistReport {
    pub table: String,
    pub kept: Vec<String>,
    /// First-cell labels of removed rows.
    pub removed: Vec<String>,
    /// Body section titles belonging to removed rows, after alias mapping.
    pub sections: Vec<String>,
}

/// Keep the rows of selected items and rewrite their cells; drop every other data row.
pub fn filter_checklist(
    part: &mut XmlPart,
    spec: &ChecklistSpec,
    font: &RunFont,
    aliases: &BTreeMap<String, String>,
) -> Result<ChecklistReport> {
    let layout = select_table(part, &spec.table)?;
    let by_name: BTreeMap<&str, &ChecklistItem> =
        spec.items.iter().map(|i| (i.name.trim(), i)).collect();
    let mut report = ChecklistReport {
        table: spec.table.to_string(),
        ..ChecklistReport::default()
    };

    let mut edits: Vec<(usize, usize, Vec<XmlEvent>)> = Vec::new();
    for row in layout.rows.iter().skip(spec.header_rows) {
        let label = row.first_cell_text();
        let Some(item) = by_name.get(label) else {
            edits.push((row.start, row.end, Vec::new()));
            report.removed.push(label.to_string());
            let title = aliases.get(label).map(String::as_str).unwrap_or(label);
            report.sections.push(title.to_string());
            continue;
        };
        for (col, cell) in row.cells.iter().enumerate().take(item.values.len() + 1) {
            let text = if col == 0 { label } else { item.values[col - 1].as_str() };
            let events = rebuild_cell(part, cell, text, font)
                .map_err(|e| AssemblyError::xml(&part.name, e))?;
            edits.push((cell.start, cell.end, events));
        }
        report.kept.push(label.to_string());
    }

    for name in by_name.keys() {
        if !report.kept.iter().any(|k| k.as_str() == *name) {
            warn!(table = %report.table, item = %name, "selected checklist item has no row");
        }
    }

    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end, events) in edits {
        part.events.splice(start..=end, events);
    }
    debug!(
        table = %report.table,
        kept = report.kept.len(),
        removed = report.removed.len(),
        "filtered checklist"
    );
    Ok(report)
}
