//! One assembly run: template in, finished document out.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::automation::{AutomationGate, AutomationOp};
use crate::docx::body::DOCUMENT_PART;
use crate::docx::media::{replace_images, ImageReport, MEDIA_DIR};
use crate::docx::package::{self, read_entries, WorkingTree};
use crate::docx::placeholder::{substitute_tree, PlaceholderMap, SubstitutionStats};
use crate::docx::settings::{mark_fields_dirty, SETTINGS_PART};
use crate::docx::styles::{StyleMap, STYLES_PART};
use crate::docx::table::TableSelector;
use crate::docx::xml::{parse_xml_part, write_xml_part, XmlPart};
use crate::error::{AssemblyError, Result};
use crate::fields::{HeadingTaxonomy, PresenceSet};
use crate::prune::heading::{
    prune_sections, HeadingLevel, HeadingStyles, PruneReport, SectionTarget, SpanContent,
};
use crate::prune::table::{
    filter_checklist, prune_table, ChecklistReport, ChecklistSpec, TablePruneReport, TablePruneSpec,
};
use crate::rows::{append_rows, RowStyle, RunFont};
use crate::textutil::scan_tokens;

#[derive(Clone, Debug)]
pub struct AssemblyOptions {
    pub heading_styles: HeadingStyles,
    /// What a missing taxonomy section takes with it.
    pub span_content: SpanContent,
    pub row_style: RowStyle,
    pub checklist_font: RunFont,
    /// Body section titles for checklist rows whose label differs from the heading.
    pub section_aliases: BTreeMap<String, String>,
    /// Unknown tables fail the run instead of being reported.
    pub strict_tables: bool,
    pub recalculate_toc: bool,
    /// Write a PDF next to the output after recalculation.
    pub export_pdf: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            heading_styles: HeadingStyles::default(),
            span_content: SpanContent::default(),
            row_style: RowStyle::default(),
            checklist_font: RunFont::new("Times New Roman", 12.0),
            section_aliases: BTreeMap::new(),
            strict_tables: false,
            recalculate_toc: true,
            export_pdf: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RowAppend {
    pub table: TableSelector,
    pub rows: Vec<Vec<String>>,
}

#[derive(Clone, Debug, Default)]
pub struct AssemblyRequest {
    pub template: PathBuf,
    pub output: PathBuf,
    pub placeholders: PlaceholderMap,
    pub presence: PresenceSet,
    pub taxonomy: HeadingTaxonomy,
    /// Body sections removed regardless of presence.
    pub sections: Vec<SectionTarget>,
    /// Media slot name → replacement image.
    pub images: Vec<(String, PathBuf)>,
    pub table_prunes: Vec<TablePruneSpec>,
    pub checklists: Vec<ChecklistSpec>,
    pub row_appends: Vec<RowAppend>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub substitutions: Vec<SubstitutionStats>,
    pub images: ImageReport,
    pub sections: PruneReport,
    pub tables: Vec<TablePruneReport>,
    pub checklists: Vec<ChecklistReport>,
    /// Serials written per row append, in request order.
    pub rows: Vec<Vec<String>>,
    pub missing_tables: Vec<String>,
    /// `w:updateFields` is set, so fields refresh when the document is next opened.
    pub fields_marked_dirty: bool,
    /// An office recalculation pass ran on the packed output.
    pub toc_recalculated: bool,
    pub pdf: Option<PathBuf>,
    pub elapsed_ms: u128,
}

/// Working directory of a run writing `output`: `<stem>_temp` beside it.
pub fn work_dir_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{stem}_temp"))
}

pub struct Assembler {
    options: AssemblyOptions,
    automation: Option<Arc<AutomationGate>>,
}

impl Assembler {
    pub fn new(options: AssemblyOptions, automation: Option<Arc<AutomationGate>>) -> Self {
        Self { options, automation }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    pub fn assemble(&self, req: &AssemblyRequest) -> Result<AssemblyReport> {
        let started = Instant::now();
        info!(
            template = %req.template.display(),
            output = %req.output.display(),
            "assembly started"
        );
        req.taxonomy.check_required(&req.presence)?;

        let mut report = self.build(req)?;
        if let Err(e) = self.post_process(req, &mut report) {
            remove_output(&req.output);
            return Err(e);
        }
        report.elapsed_ms = started.elapsed().as_millis();
        info!(output = %req.output.display(), elapsed_ms = report.elapsed_ms, "assembly finished");
        Ok(report)
    }

    /// Steps up to and including pack. The working tree is gone when this returns.
    fn build(&self, req: &AssemblyRequest) -> Result<AssemblyReport> {
        let tree = package::unpack(&req.template, &work_dir_for(&req.output))?;
        info!(entries = tree.entries().len(), "unpacked template");

        let mut report = AssemblyReport {
            output: req.output.clone(),
            ..AssemblyReport::default()
        };
        report.substitutions = substitute_tree(&tree, &req.placeholders)?;
        let replaced: usize = report.substitutions.iter().map(|s| s.replaced).sum();
        info!(parts = report.substitutions.len(), replaced, "substituted placeholders");

        report.images = replace_images(&tree.part_path(MEDIA_DIR), &req.images);

        let mut doc = load_part(&tree, DOCUMENT_PART)?;
        let styles = if tree.has_part(STYLES_PART) {
            StyleMap::from_part(&load_part(&tree, STYLES_PART)?)
        } else {
            StyleMap::default()
        };
        let dirty = self.edit_body(req, &mut doc, &styles, &mut report)?;
        if dirty {
            let bytes = write_xml_part(&doc).map_err(|e| AssemblyError::xml(DOCUMENT_PART, e))?;
            tree.write_part(DOCUMENT_PART, &bytes)?;
        }

        if self.options.recalculate_toc {
            report.fields_marked_dirty = self.mark_settings(&tree)?;
        }

        if let Err(e) = package::pack(&tree, &req.output) {
            remove_output(&req.output);
            return Err(e);
        }
        info!(output = %req.output.display(), "packed document");
        Ok(report)
    }

    fn mark_settings(&self, tree: &WorkingTree) -> Result<bool> {
        if !tree.has_part(SETTINGS_PART) {
            warn!("template has no settings part; fields are not flagged for refresh");
            return Ok(false);
        }
        let mut settings = load_part(tree, SETTINGS_PART)?;
        let changed =
            mark_fields_dirty(&mut settings).map_err(|e| AssemblyError::xml(SETTINGS_PART, e))?;
        if changed {
            let bytes =
                write_xml_part(&settings).map_err(|e| AssemblyError::xml(SETTINGS_PART, e))?;
            tree.write_part(SETTINGS_PART, &bytes)?;
        }
        debug!(changed, "fields flagged for refresh on open");
        Ok(true)
    }

    /// Body, table, checklist and row edits on the parsed body part. Returns whether the
    /// part changed.
    fn edit_body(
        &self,
        req: &AssemblyRequest,
        doc: &mut XmlPart,
        styles: &StyleMap,
        report: &mut AssemblyReport,
    ) -> Result<bool> {
        let opts = &self.options;
        let mut targets = req.taxonomy.prune_targets(&req.presence, opts.span_content);
        targets.extend(req.sections.iter().cloned());
        report.sections = prune_sections(doc, styles, &opts.heading_styles, &targets)?;
        info!(
            removed = report.sections.removed.len(),
            not_found = report.sections.not_found.len(),
            "pruned body sections"
        );
        let mut dirty = report.sections.blocks_removed > 0;

        for spec in &req.table_prunes {
            let spec = spec.with_presence(&req.presence, &req.taxonomy);
            if let Some(r) = self.lenient(prune_table(doc, &spec), &mut report.missing_tables)? {
                dirty |= r.removed_rows > 0;
                info!(
                    table = %r.table,
                    removed = r.removed_rows,
                    retained = r.retained_rows,
                    "pruned table rows"
                );
                report.tables.push(r);
            }
        }

        for spec in &req.checklists {
            let filtered = filter_checklist(doc, spec, &opts.checklist_font, &opts.section_aliases);
            let Some(r) = self.lenient(filtered, &mut report.missing_tables)? else {
                continue;
            };
            dirty = true;
            let follow_up: Vec<SectionTarget> = r
                .sections
                .iter()
                .map(|title| {
                    SectionTarget::new(title.as_str(), HeadingLevel::Secondary)
                        .with_content(SpanContent::ParagraphsAndTables)
                })
                .collect();
            let pruned = prune_sections(doc, styles, &opts.heading_styles, &follow_up)?;
            info!(
                table = %r.table,
                kept = r.kept.len(),
                sections = pruned.removed.len(),
                "filtered checklist"
            );
            report.sections.removed.extend(pruned.removed);
            report.sections.not_found.extend(pruned.not_found);
            report.sections.blocks_removed += pruned.blocks_removed;
            report.checklists.push(r);
        }

        for append in &req.row_appends {
            let appended = append_rows(doc, &append.table, &append.rows, &opts.row_style);
            if let Some(serials) = self.lenient(appended, &mut report.missing_tables)? {
                dirty |= !serials.is_empty();
                info!(table = %append.table, rows = serials.len(), "appended rows");
                report.rows.push(serials);
            }
        }
        Ok(dirty)
    }

    /// `TableNotFound` is recorded instead of failing unless tables are strict.
    fn lenient<T>(&self, result: Result<T>, missing: &mut Vec<String>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(AssemblyError::TableNotFound(table)) if !self.options.strict_tables => {
                warn!(%table, "table not found; step skipped");
                missing.push(table);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn post_process(&self, req: &AssemblyRequest, report: &mut AssemblyReport) -> Result<()> {
        let Some(gate) = self.automation.as_ref() else {
            if self.options.export_pdf {
                warn!("no office automation configured; pdf export skipped");
            }
            return Ok(());
        };
        if self.options.recalculate_toc {
            if gate.supports(&AutomationOp::RecalculateFields) {
                gate.run(&AutomationOp::RecalculateFields, &req.output)?;
                report.toc_recalculated = true;
            } else {
                info!("no recalculation command configured; fields refresh on open");
            }
        }
        if self.options.export_pdf {
            let out_dir = req
                .output
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf();
            report.pdf = Some(gate.run(&AutomationOp::ExportPdf { out_dir }, &req.output)?);
        }
        Ok(())
    }
}

fn load_part(tree: &WorkingTree, name: &str) -> Result<XmlPart> {
    let bytes = tree.read_part(name)?;
    parse_xml_part(name, &bytes).map_err(|e| AssemblyError::xml(name, e))
}

fn remove_output(output: &Path) {
    if output.exists() {
        match fs::remove_file(output) {
            Ok(()) => info!(output = %output.display(), "removed partial output"),
            Err(e) => {
                warn!(output = %output.display(), error = %e, "could not remove partial output")
            }
        }
    }
}

/// Unpack and repack `template` into `output` without edits.
pub fn roundtrip(template: &Path, output: &Path) -> Result<()> {
    let tree = package::unpack(template, &work_dir_for(output))?;
    package::pack(&tree, output)
}

/// `{{ code }}` tokens per substitutable part of `template`, read without unpacking.
pub fn list_placeholders(template: &Path) -> Result<BTreeMap<String, BTreeSet<String>>> {
    if !template.is_file() {
        return Err(AssemblyError::TemplateMissing(template.to_path_buf()));
    }
    let mut out = BTreeMap::new();
    for (name, data) in read_entries(template)? {
        let Some(file) = name.strip_prefix("word/").filter(|f| !f.contains('/')) else {
            continue;
        };
        let header_or_footer = file.starts_with("header") || file.starts_with("footer");
        let wanted = name == DOCUMENT_PART || (header_or_footer && file.ends_with(".xml"));
        if !wanted {
            continue;
        }
        let tokens = scan_tokens(&String::from_utf8_lossy(&data));
        if !tokens.is_empty() {
            out.insert(name, tokens);
        }
    }
    Ok(out)
}
