//! JSON job files: the business data for one assembly run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;

use crate::assembly::{AssemblyRequest, RowAppend};
use crate::config::LoadedConfig;
use crate::docx::placeholder::PlaceholderMap;
use crate::docx::table::TableSelector;
use crate::fields::{
    build_field_map, build_metric_map, build_project_map, render_value, FieldRecord,
    HeadingTaxonomy, MetricRecord, PresenceSet,
};
use crate::prune::heading::{Boundary, HeadingLevel, SectionTarget, SpanContent};
use crate::prune::table::{ChecklistItem, ChecklistSpec, TablePruneSpec};

#[derive(Clone, Debug, Deserialize)]
pub struct SectionSpec {
    pub title: String,
    pub level: HeadingLevel,
    #[serde(default)]
    pub boundary: Option<Boundary>,
    #[serde(default)]
    pub content: SpanContent,
    #[serde(default)]
    pub required: bool,
}

impl SectionSpec {
    fn into_target(self) -> SectionTarget {
        let mut target = SectionTarget::new(self.title, self.level).with_content(self.content);
        if let Some(b) = self.boundary {
            target = target.with_boundary(b);
        }
        target.required = self.required;
        target
    }
}

/// Replacement for one media slot, given directly or through a field holding the file name.
#[derive(Clone, Debug, Deserialize)]
pub struct ImageSpec {
    pub slot: String,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Flag(bool),
    Text(String),
}

impl CellValue {
    fn into_text(self) -> String {
        match self {
            Self::Flag(true) => "√".to_string(),
            Self::Flag(false) => String::new(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChecklistItemSpec {
    pub name: String,
    #[serde(default)]
    pub values: Vec<CellValue>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChecklistJob {
    pub table: TableSelector,
    pub items: Vec<ChecklistItemSpec>,
    #[serde(default)]
    pub header_rows: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JobSpec {
    pub template: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub project: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: Vec<FieldRecord>,
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
    /// Raw token → value pairs applied last.
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,
    /// Codes counted as present even without a field record.
    #[serde(default)]
    pub present: Vec<String>,
    #[serde(default)]
    pub taxonomy: HeadingTaxonomy,
    #[serde(default)]
    pub sections: Vec<SectionSpec>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    #[serde(default)]
    pub table_prunes: Vec<TablePruneSpec>,
    #[serde(default)]
    pub checklists: Vec<ChecklistJob>,
    #[serde(default)]
    pub rows: Vec<RowAppend>,
}

impl JobSpec {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read job: {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse job json: {}", path.display()))
    }

    /// Resolve paths and build the request. Relative paths go through the configured
    /// directories first and fall back to `job_dir`.
    pub fn into_request(
        self,
        job_dir: &Path,
        cfg: &LoadedConfig,
        output_override: Option<PathBuf>,
    ) -> anyhow::Result<AssemblyRequest> {
        let text = &cfg.config.text;
        let paths = &cfg.config.paths;
        let in_dir = |p: &Path, dir: Option<PathBuf>| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                dir.unwrap_or_else(|| job_dir.to_path_buf()).join(p)
            }
        };

        let template = in_dir(self.template.as_path(), cfg.dir_of(paths.templates_dir.as_ref()));
        let output = match output_override.or(self.output) {
            Some(p) => in_dir(p.as_path(), cfg.dir_of(paths.output_dir.as_ref())),
            None => {
                let stem = template
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| anyhow!("template has no file name: {}", template.display()))?;
                in_dir(
                    Path::new(&format!("{stem}_out.docx")),
                    cfg.dir_of(paths.output_dir.as_ref()),
                )
            }
        };
        if output == template {
            return Err(anyhow!("output would overwrite the template: {}", output.display()));
        }

        let mut placeholders =
            build_project_map(&self.project, &text.project_attributes, &text.options);
        placeholders.extend(build_field_map(&self.fields, &text.options));
        placeholders.extend(build_metric_map(&self.metrics, &text.options));
        let mut raw = PlaceholderMap::new();
        for (k, v) in self.placeholders {
            raw.insert(k, v);
        }
        placeholders.extend(raw);

        let mut presence =
            PresenceSet::from_records(&self.fields, &self.metrics, &text.options.list_separator);
        for code in &self.present {
            presence.insert(code.trim());
        }

        let images_dir = cfg.dir_of(paths.images_dir.as_ref());
        let mut images = Vec::new();
        for img in &self.images {
            let source = match (&img.source, &img.field) {
                (Some(src), _) => Some(in_dir(src.as_path(), images_dir.clone())),
                (None, Some(code)) => {
                    image_from_field(&self.fields, code, &text.options.list_separator)
                        .map(|name| in_dir(name.as_path(), images_dir.clone()))
                }
                (None, None) => None,
            };
            match source {
                Some(src) => images.push((img.slot.clone(), src)),
                None => warn!(slot = %img.slot, "image slot has no source; left as-is"),
            }
        }

        let checklists = self
            .checklists
            .into_iter()
            .map(|c| ChecklistSpec {
                table: c.table,
                items: c
                    .items
                    .into_iter()
                    .map(|i| ChecklistItem {
                        name: i.name,
                        values: i.values.into_iter().map(CellValue::into_text).collect(),
                    })
                    .collect(),
                header_rows: c.header_rows.unwrap_or(1),
            })
            .collect();

        Ok(AssemblyRequest {
            template,
            output,
            placeholders,
            presence,
            taxonomy: self.taxonomy,
            sections: self.sections.into_iter().map(SectionSpec::into_target).collect(),
            images,
            table_prunes: self.table_prunes,
            checklists,
            row_appends: self.rows,
        })
    }
}

/// File name stored in `code`'s value; only the last path component is used.
fn image_from_field(fields: &[FieldRecord], code: &str, sep: &str) -> Option<PathBuf> {
    let value = fields
        .iter()
        .find(|f| f.code.trim() == code)
        .and_then(|f| render_value(&f.value, sep))?;
    let name = value.rsplit(['/', '\\']).next().unwrap_or(&value).trim();
    (!name.is_empty()).then(|| PathBuf::from(name))
}
