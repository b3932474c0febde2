//! Deletion of heading-scoped body sections.
//!
//! Works in two passes: an immutable [`BodyIndex`] is classified into scan items, a
//! [`SectionScanner`] decides the span of each target on that snapshot, and only then are
//! the collected blocks removed from the event stream, highest index first.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::docx::body::{BlockKind, BodyIndex};
use crate::docx::styles::StyleMap;
use crate::docx::xml::XmlPart;
use crate::error::{AssemblyError, Result};

/// Structural rank of a heading paragraph. `Primary` ranks above `Secondary`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingLevel {
    Primary,
    Secondary,
}

/// Where a deletion span stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// At the next heading of the target level with a different title, or at any higher heading.
    ///
    /// A repeat of the target title at the target level inside the span does not end it; the
    /// repeated section is removed together with the first.
    SameLevel,
    /// At the next heading of the target level or higher, whatever its title.
    SameOrHigher,
}

impl Boundary {
    pub fn default_for(level: HeadingLevel) -> Self {
        match level {
            HeadingLevel::Primary => Self::SameLevel,
            HeadingLevel::Secondary => Self::SameOrHigher,
        }
    }
}

/// Which body blocks inside a span are removed. Section properties, content controls and
/// other body children always stay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanContent {
    #[default]
    Paragraphs,
    ParagraphsAndTables,
}

/// Style labels identifying the two heading levels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeadingStyles {
    pub primary: String,
    pub secondary: String,
}

impl Default for HeadingStyles {
    fn default() -> Self {
        Self {
            primary: "Heading 1".to_string(),
            secondary: "Heading 2".to_string(),
        }
    }
}

impl HeadingStyles {
    pub fn classify(&self, styles: &StyleMap, style_id: Option<&str>) -> Option<HeadingLevel> {
        let id = style_id?;
        if styles.matches(id, &self.primary) {
            Some(HeadingLevel::Primary)
        } else if styles.matches(id, &self.secondary) {
            Some(HeadingLevel::Secondary)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionTarget {
    pub title: String,
    pub level: HeadingLevel,
    pub boundary: Boundary,
    pub content: SpanContent,
    /// Fail with `HeadingNotFound` instead of reporting the miss.
    pub required: bool,
}

impl SectionTarget {
    pub fn new(title: impl Into<String>, level: HeadingLevel) -> Self {
        Self {
            title: title.into(),
            level,
            boundary: Boundary::default_for(level),
            content: SpanContent::default(),
            required: false,
        }
    }

    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_content(mut self, content: SpanContent) -> Self {
        self.content = content;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanItem<'a> {
    pub level: Option<HeadingLevel>,
    pub text: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    Deleting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Keep,
    Delete,
    /// The span ended before this item; the item itself is kept.
    Finished,
}

pub struct SectionScanner<'t> {
    target: &'t SectionTarget,
    title: &'t str,
    state: ScanState,
}

impl<'t> SectionScanner<'t> {
    pub fn new(target: &'t SectionTarget) -> Self {
        Self {
            target,
            title: target.title.trim(),
            state: ScanState::Scanning,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn step(&mut self, item: ScanItem<'_>) -> Step {
        let same_title = item.text.trim() == self.title;
        match self.state {
            ScanState::Scanning => {
                if item.level == Some(self.target.level) && same_title {
                    self.state = ScanState::Deleting;
                    Step::Delete
                } else {
                    Step::Keep
                }
            }
            ScanState::Deleting => match item.level {
                Some(level) if level < self.target.level => self.finish(),
                Some(level) if level == self.target.level => match self.target.boundary {
                    Boundary::SameLevel if same_title => Step::Delete,
                    Boundary::SameLevel | Boundary::SameOrHigher => self.finish(),
                },
                _ => Step::Delete,
            },
        }
    }

    fn finish(&mut self) -> Step {
        self.state = ScanState::Scanning;
        Step::Finished
    }
}

/// Inclusive item range of the first section matching `target`.
pub fn find_span(items: &[ScanItem<'_>], target: &SectionTarget) -> Option<(usize, usize)> {
    let mut scanner = SectionScanner::new(target);
    let mut start = None;
    for (i, item) in items.iter().enumerate() {
        match scanner.step(*item) {
            Step::Delete if start.is_none() => start = Some(i),
            Step::Finished => return start.map(|s| (s, i - 1)),
            _ => {}
        }
    }
    start.map(|s| (s, items.len() - 1))
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
    pub blocks_removed: usize,
}

/// Delete the section of every target from the body of `part`.
pub fn prune_sections(
    part: &mut XmlPart,
    styles: &StyleMap,
    heading_styles: &HeadingStyles,
    targets: &[SectionTarget],
) -> Result<PruneReport> {
    let index = BodyIndex::build(part).map_err(|e| AssemblyError::xml(&part.name, e))?;
    let items: Vec<ScanItem<'_>> = index
        .blocks
        .iter()
        .map(|b| ScanItem {
            level: match b.kind {
                BlockKind::Paragraph => heading_styles.classify(styles, b.style_id.as_deref()),
                _ => None,
            },
            text: &b.text,
        })
        .collect();

    let mut report = PruneReport::default();
    let mut doomed: BTreeSet<usize> = BTreeSet::new();
    for target in targets {
        let Some((first, last)) = find_span(&items, target) else {
            if target.required {
                return Err(AssemblyError::HeadingNotFound(target.title.clone()));
            }
            report.not_found.push(target.title.clone());
            continue;
        };
        debug!(title = %target.title, first, last, "section span");
        for (i, block) in index.blocks.iter().enumerate().take(last + 1).skip(first) {
            let removable = match block.kind {
                BlockKind::Paragraph => true,
                BlockKind::Table => target.content == SpanContent::ParagraphsAndTables,
                BlockKind::Other => false,
            };
            if removable {
                doomed.insert(i);
            }
        }
        report.removed.push(target.title.clone());
    }

    let mut ranges: Vec<(usize, usize)> = doomed
        .iter()
        .map(|&i| (index.blocks[i].start, index.blocks[i].end))
        .collect();
    report.blocks_removed = ranges.len();
    part.remove_ranges(&mut ranges);
    Ok(report)
}
