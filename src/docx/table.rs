use std::fmt;

use serde::Deserialize;

use crate::docx::body::{paragraph_text, BodyIndex};
use crate::docx::xml::{find_attr, XmlEvent, XmlPart};
use crate::error::{AssemblyError, Result};

/// How a caller addresses one body-level table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSelector {
    /// Zero-based position among body-level tables.
    Index(usize),
    /// Trimmed text of the first cell of the first row.
    Header(String),
}

impl fmt::Display for TableSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "index {i}"),
            Self::Header(h) => write!(f, "header \"{h}\""),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CellLoc {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct RowLoc {
    pub start: usize,
    pub end: usize,
    pub cells: Vec<CellLoc>,
}

impl RowLoc {
    /// Cell texts concatenated without separator.
    pub fn text(&self) -> String {
        self.cells.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn first_cell_text(&self) -> &str {
        self.cells.first().map(|c| c.text.trim()).unwrap_or("")
    }
}

/// Event-level layout of one table, valid until the part is mutated.
#[derive(Clone, Debug)]
pub struct TableLayout {
    pub start: usize,
    pub end: usize,
    /// `w:gridCol/@w:w` per grid column.
    pub grid: Vec<Option<String>>,
    pub rows: Vec<RowLoc>,
}

impl TableLayout {
    pub fn read(part: &XmlPart, start: usize) -> anyhow::Result<Self> {
        let end = part.element_end(start)?;
        let mut grid = Vec::new();
        let mut rows = Vec::new();
        for (cs, ce) in part.child_elements(start)? {
            match part.events[cs].name() {
                Some("w:tblGrid") => {
                    for ev in &part.events[cs..=ce] {
                        if let XmlEvent::Empty { name, attrs } = ev {
                            if name == "w:gridCol" {
                                grid.push(find_attr(attrs, "w:w").map(str::to_string));
                            }
                        }
                    }
                }
                Some("w:tr") => rows.push(read_row(part, cs, ce)?),
                _ => {}
            }
        }
        Ok(Self {
            start,
            end,
            grid,
            rows,
        })
    }

    /// First row whose concatenated cell text contains `needle`.
    pub fn locate(&self, needle: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.text().contains(needle))
    }

    /// Number of columns new rows should get.
    pub fn column_count(&self) -> usize {
        if !self.grid.is_empty() {
            return self.grid.len();
        }
        self.rows.last().map(|r| r.cells.len()).unwrap_or(0)
    }
}

fn read_row(part: &XmlPart, start: usize, end: usize) -> anyhow::Result<RowLoc> {
    let mut cells = Vec::new();
    for (cs, ce) in part.child_elements(start)? {
        if part.events[cs].name() != Some("w:tc") {
            continue;
        }
        let mut paras = Vec::new();
        for (ps, pe) in part.child_elements(cs)? {
            if part.events[ps].name() == Some("w:p") {
                paras.push(paragraph_text(&part.events[ps..=pe]));
            }
        }
        cells.push(CellLoc {
            start: cs,
            end: ce,
            text: paras.join("\n"),
        });
    }
    Ok(RowLoc { start, end, cells })
}

/// Resolve `selector` against the current state of `part`.
pub fn select_table(part: &XmlPart, selector: &TableSelector) -> Result<TableLayout> {
    let index = BodyIndex::build(part).map_err(|e| AssemblyError::xml(&part.name, e))?;
    let mut tables = index.tables();
    let found = match selector {
        TableSelector::Index(i) => tables.nth(*i).map(|b| b.start),
        TableSelector::Header(header) => {
            let mut hit = None;
            for block in tables {
                let layout = TableLayout::read(part, block.start)
                    .map_err(|e| AssemblyError::xml(&part.name, e))?;
                if layout.rows.first().map(RowLoc::first_cell_text) == Some(header.trim()) {
                    hit = Some(block.start);
                    break;
                }
            }
            hit
        }
    };
    let start = found.ok_or_else(|| AssemblyError::TableNotFound(selector.to_string()))?;
    TableLayout::read(part, start).map_err(|e| AssemblyError::xml(&part.name, e))
}
