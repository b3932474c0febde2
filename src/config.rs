use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::assembly::AssemblyOptions;
use crate::automation::soffice::{SofficeClient, SofficeSettings};
use crate::automation::AutomationGate;
use crate::fields::TextOptions;
use crate::prune::heading::{HeadingStyles, SpanContent};
use crate::rows::{RowStyle, RunFont};

pub const CONFIG_FILE_NAME: &str = "report-assembler.toml";
pub const CONFIG_ENV: &str = "REPORT_ASSEMBLER_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub styles: StylesSection,
    #[serde(default)]
    pub rows: RowsSection,
    #[serde(default)]
    pub text: TextSection,
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Directories used to resolve relative paths in job files. Relative entries are taken
/// relative to the config file directory.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct PathsSection {
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StylesSection {
    pub primary: String,
    pub secondary: String,
    pub span_content: SpanContent,
    pub strict_tables: bool,
}

impl Default for StylesSection {
    fn default() -> Self {
        let h = HeadingStyles::default();
        Self {
            primary: h.primary,
            secondary: h.secondary,
            span_content: SpanContent::default(),
            strict_tables: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RowsSection {
    #[serde(flatten)]
    pub style: RowStyle,
    pub checklist_font: RunFont,
}

impl Default for RowsSection {
    fn default() -> Self {
        Self {
            style: RowStyle::default(),
            checklist_font: RunFont::new("Times New Roman", 12.0),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TextSection {
    #[serde(flatten)]
    pub options: TextOptions,
    /// Project attributes that always get a placeholder, blank or not.
    pub project_attributes: Vec<String>,
}

impl Default for TextSection {
    fn default() -> Self {
        Self {
            options: TextOptions::default(),
            project_attributes: [
                "project_model",
                "project_name",
                "project_type",
                "file_number",
                "product_number",
                "project_level",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    pub enabled: bool,
    pub recalculate_toc: bool,
    pub export_pdf: bool,
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub soffice: SofficeSettings,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            recalculate_toc: true,
            export_pdf: false,
            timeout_secs: 120,
            soffice: SofficeSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn assembly_options(&self) -> AssemblyOptions {
        AssemblyOptions {
            heading_styles: HeadingStyles {
                primary: self.styles.primary.clone(),
                secondary: self.styles.secondary.clone(),
            },
            span_content: self.styles.span_content,
            row_style: self.rows.style.clone(),
            checklist_font: self.rows.checklist_font.clone(),
            section_aliases: self.text.options.section_aliases.clone(),
            strict_tables: self.styles.strict_tables,
            recalculate_toc: self.automation.recalculate_toc,
            export_pdf: self.automation.export_pdf,
        }
    }

    /// The shared automation session, or `None` when automation is switched off.
    pub fn automation_gate(&self) -> Option<Arc<AutomationGate>> {
        if !self.automation.enabled {
            return None;
        }
        let settings = self.automation.soffice.clone();
        Some(Arc::new(AutomationGate::with_factory(
            move || Box::new(SofficeClient::new(settings.clone())),
            Duration::from_secs(self.automation.timeout_secs.max(1)),
        )))
    }
}

/// Config file plus the directory relative paths are resolved against.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub dir: PathBuf,
    pub config: AppConfig,
}

impl LoadedConfig {
    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(p)
        }
    }

    pub fn dir_of(&self, entry: Option<&PathBuf>) -> Option<PathBuf> {
        entry.map(|p| self.resolve(p))
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

/// `explicit`, then `$REPORT_ASSEMBLER_CONFIG`, then an upward search from `workdir`. Without
/// a file the defaults apply and paths resolve against `workdir`.
pub fn locate_and_load(explicit: Option<PathBuf>, workdir: &Path) -> anyhow::Result<LoadedConfig> {
    let cfg_file = explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| find_default_config(workdir, CONFIG_FILE_NAME));
    match cfg_file {
        Some(p) if p.exists() => {
            let config = load_config(&p)?;
            let dir = p
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Ok(LoadedConfig {
                path: Some(p),
                dir,
                config,
            })
        }
        Some(p) => Err(anyhow::anyhow!("config file not found: {}", p.display())),
        None => Ok(LoadedConfig {
            path: None,
            dir: workdir.to_path_buf(),
            config: AppConfig::default(),
        }),
    }
}

const DEFAULT_CONFIG_TOML: &str = r#"# report-assembler configuration

[paths]
# Relative paths in job files are looked up here (relative to this file).
# templates_dir = "templates"
# images_dir = "images"
# output_dir = "out"

[styles]
primary = "Heading 1"
secondary = "Heading 2"
# "paragraphs" or "paragraphs_and_tables"
span_content = "paragraphs"
# Fail when a job names a table the template does not have.
strict_tables = false

[rows]
header_rows = 1
centered = true
serial = { family = "Calibri", size_pt = 10.0 }
data = { family = "宋体", size_pt = 12.0 }
checklist_font = { family = "Times New Roman", size_pt = 12.0 }

[text]
list_separator = "、"
missing_value = "N/A"
metric_placeholder = "--"
skip_codes = ["fuse", "conductive_pad", "factory_test_report", "test_report"]
project_attributes = [
    "project_model",
    "project_name",
    "project_type",
    "file_number",
    "product_number",
    "project_level",
]

[text.section_aliases]
"外形尺寸" = "外形尺寸（单位：mm）"

[automation]
enabled = true
recalculate_toc = true
export_pdf = false
timeout_secs = 120
program = "soffice"
# A plain conversion does not refresh the table of contents, so no recalculation command runs
# by default; the document is flagged to refresh its fields when opened instead. To refresh
# during assembly, point this at a macro that updates all indexes and saves in place, e.g.
# recalculate_args = ["--headless", "--norestore", "macro:///Standard.Report.UpdateAll({input})"]
recalculate_args = []
pdf_args = ["--headless", "--norestore", "--convert-to", "pdf", "--outdir", "{outdir}", "{input}"]
poll_ms = 100

[logging]
# error | warn | info | debug | trace (RUST_LOG overrides)
level = "info"
"#;

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILE_NAME);
    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}
