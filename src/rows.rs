use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::docx::table::{select_table, CellLoc, TableSelector};
use crate::docx::xml::{XmlEvent, XmlPart};
use crate::error::{AssemblyError, Result};
use crate::textutil::escape_xml;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunFont {
    pub family: String,
    pub size_pt: f32,
}

impl RunFont {
    pub fn new(family: &str, size_pt: f32) -> Self {
        Self {
            family: family.to_string(),
            size_pt,
        }
    }

    fn half_points(&self) -> String {
        ((self.size_pt * 2.0).round().max(1.0) as u32).to_string()
    }
}

/// Text style of synthesized rows. Column 0 (the serial) and the data columns are styled
/// independently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowStyle {
    pub serial: RunFont,
    pub data: RunFont,
    pub header_rows: usize,
    pub centered: bool,
}

impl Default for RowStyle {
    fn default() -> Self {
        Self {
            serial: RunFont::new("Calibri", 10.0),
            data: RunFont::new("宋体", 12.0),
            header_rows: 1,
            centered: true,
        }
    }
}

pub fn run_events(text: &str, font: &RunFont) -> Vec<XmlEvent> {
    let family = escape_xml(&font.family);
    let hp = font.half_points();
    vec![
        XmlEvent::start("w:r", &[]),
        XmlEvent::start("w:rPr", &[]),
        XmlEvent::empty(
            "w:rFonts",
            &[
                ("w:ascii", &family),
                ("w:hAnsi", &family),
                ("w:eastAsia", &family),
                ("w:cs", &family),
            ],
        ),
        XmlEvent::empty("w:sz", &[("w:val", &hp)]),
        XmlEvent::empty("w:szCs", &[("w:val", &hp)]),
        XmlEvent::end("w:rPr"),
        XmlEvent::start("w:t", &[("xml:space", "preserve")]),
        XmlEvent::text(text),
        XmlEvent::end("w:t"),
        XmlEvent::end("w:r"),
    ]
}

fn paragraph_events(
    text: &str,
    font: &RunFont,
    ppr: Option<&[XmlEvent]>,
    centered: bool,
) -> Vec<XmlEvent> {
    let mut out = vec![XmlEvent::start("w:p", &[])];
    match ppr {
        Some(ppr) => out.extend_from_slice(ppr),
        None if centered => {
            out.push(XmlEvent::start("w:pPr", &[]));
            out.push(XmlEvent::empty("w:jc", &[("w:val", "center")]));
            out.push(XmlEvent::end("w:pPr"));
        }
        None => {}
    }
    if !text.is_empty() {
        out.extend(run_events(text, font));
    }
    out.push(XmlEvent::end("w:p"));
    out
}

fn new_cell_events(
    width: Option<&str>,
    text: &str,
    font: &RunFont,
    centered: bool,
) -> Vec<XmlEvent> {
    let mut out = vec![XmlEvent::start("w:tc", &[])];
    if let Some(w) = width {
        out.push(XmlEvent::start("w:tcPr", &[]));
        out.push(XmlEvent::empty("w:tcW", &[("w:w", w), ("w:type", "dxa")]));
        out.push(XmlEvent::end("w:tcPr"));
    }
    out.extend(paragraph_events(text, font, None, centered));
    out.push(XmlEvent::end("w:tc"));
    out
}

/// New events for an existing cell: its `w:tcPr` and first paragraph's `w:pPr` are kept, the
/// content becomes a single run of `text`.
pub fn rebuild_cell(
    part: &XmlPart,
    cell: &CellLoc,
    text: &str,
    font: &RunFont,
) -> anyhow::Result<Vec<XmlEvent>> {
    let mut tc_pr: Option<&[XmlEvent]> = None;
    let mut p_pr: Option<&[XmlEvent]> = None;
    for (cs, ce) in part.child_elements(cell.start)? {
        match part.events[cs].name() {
            Some("w:tcPr") => tc_pr = Some(&part.events[cs..=ce]),
            Some("w:p") if p_pr.is_none() => {
                if let Some(&(ps, pe)) = part.child_elements(cs)?.first() {
                    if part.events[ps].name() == Some("w:pPr") {
                        p_pr = Some(&part.events[ps..=pe]);
                    }
                }
            }
            _ => {}
        }
    }
    let mut out = vec![part.events[cell.start].clone()];
    if let Some(tc_pr) = tc_pr {
        out.extend_from_slice(tc_pr);
    }
    out.extend(paragraph_events(text, font, p_pr, false));
    out.push(XmlEvent::end("w:tc"));
    Ok(out)
}

/// Append one row to the selected table and return the serial written into column 0.
pub fn append_row(
    part: &mut XmlPart,
    table: &TableSelector,
    values: &[String],
    style: &RowStyle,
) -> Result<String> {
    let layout = select_table(part, table)?;
    let columns = layout.column_count();
    if columns == 0 {
        return Err(AssemblyError::xml(
            &part.name,
            anyhow::anyhow!("table {table} has no columns"),
        ));
    }
    if values.len() + 1 > columns {
        warn!(
            %table,
            columns,
            values = values.len(),
            "row has more values than columns; extra values dropped"
        );
    }

    let serial_no = (layout.rows.len() + 1).saturating_sub(style.header_rows);
    let serial = format!("{serial_no}.");

    let mut row = vec![XmlEvent::start("w:tr", &[])];
    for col in 0..columns {
        let width = layout.grid.get(col).and_then(|w| w.as_deref());
        let (text, font) = if col == 0 {
            (serial.as_str(), &style.serial)
        } else {
            (values.get(col - 1).map(String::as_str).unwrap_or(""), &style.data)
        };
        row.extend(new_cell_events(width, text, font, style.centered));
    }
    row.push(XmlEvent::end("w:tr"));

    // Before the table's closing tag.
    part.events.splice(layout.end..layout.end, row);
    debug!(%table, %serial, "appended row");
    Ok(serial)
}

pub fn append_rows(
    part: &mut XmlPart,
    table: &TableSelector,
    rows: &[Vec<String>],
    style: &RowStyle,
) -> Result<Vec<String>> {
    rows.iter()
        .map(|values| append_row(part, table, values, style))
        .collect()
}
