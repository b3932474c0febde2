use anyhow::{anyhow, Context};

use crate::docx::xml::{find_attr, XmlEvent, XmlPart};

pub const DOCUMENT_PART: &str = "word/document.xml";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Table,
    /// `w:sectPr`, `w:sdt` (tables of contents), bookmarks and anything else at body level.
    Other,
}

/// A direct child of `w:body`, with its inclusive event range.
#[derive(Clone, Debug)]
pub struct BodyBlock {
    pub kind: BlockKind,
    pub start: usize,
    pub end: usize,
    pub style_id: Option<String>,
    pub text: String,
}

/// Immutable snapshot of the body, taken before any mutation.
#[derive(Clone, Debug, Default)]
pub struct BodyIndex {
    pub blocks: Vec<BodyBlock>,
}

impl BodyIndex {
    pub fn build(part: &XmlPart) -> anyhow::Result<Self> {
        let body_start = part
            .events
            .iter()
            .position(|ev| matches!(ev, XmlEvent::Start { name, .. } if name == "w:body"))
            .ok_or_else(|| anyhow!("{} has no w:body", part.name))?;
        let body_end = part.element_end(body_start).context("locate end of w:body")?;

        let mut blocks = Vec::new();
        let mut idx = body_start + 1;
        while idx < body_end {
            let (name, end) = match &part.events[idx] {
                XmlEvent::Start { name, .. } => (name.as_str(), part.element_end(idx)?),
                XmlEvent::Empty { name, .. } => (name.as_str(), idx),
                _ => {
                    idx += 1;
                    continue;
                }
            };
            let kind = match name {
                "w:p" => BlockKind::Paragraph,
                "w:tbl" => BlockKind::Table,
                _ => BlockKind::Other,
            };
            let span = &part.events[idx..=end];
            let (style_id, text) = if kind == BlockKind::Paragraph {
                (paragraph_style(span), paragraph_text(span))
            } else {
                (None, String::new())
            };
            blocks.push(BodyBlock {
                kind,
                start: idx,
                end,
                style_id,
                text,
            });
            idx = end + 1;
        }
        Ok(Self { blocks })
    }

    /// Body-level tables in document order; nested tables are not counted.
    pub fn tables(&self) -> impl Iterator<Item = &BodyBlock> {
        self.blocks.iter().filter(|b| b.kind == BlockKind::Table)
    }
}

/// `w:pStyle` of the paragraph whose events are `span` (first event is the `w:p`).
pub fn paragraph_style(span: &[XmlEvent]) -> Option<String> {
    let mut stack: Vec<&str> = Vec::new();
    for ev in span {
        match ev {
            XmlEvent::Start { name, .. } => stack.push(name),
            XmlEvent::End { .. } => {
                stack.pop();
            }
            XmlEvent::Empty { name, attrs } if name == "w:pStyle" => {
                if stack.len() == 2 && stack[1] == "w:pPr" {
                    return find_attr(attrs, "w:val")
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string);
                }
            }
            _ => {}
        }
        if stack.len() == 2 && stack[1] != "w:pPr" {
            // pPr is always the first child; past it there is no style to find.
            return None;
        }
    }
    None
}

/// Visible text of one paragraph. Text of paragraphs nested in text boxes is excluded.
pub fn paragraph_text(span: &[XmlEvent]) -> String {
    let mut out = String::new();
    let mut p_depth = 0usize;
    let mut stack: Vec<&str> = Vec::new();
    for ev in span {
        match ev {
            XmlEvent::Start { name, .. } => {
                if name == "w:p" {
                    p_depth += 1;
                }
                stack.push(name);
            }
            XmlEvent::End { name } => {
                if name == "w:p" {
                    p_depth = p_depth.saturating_sub(1);
                }
                stack.pop();
            }
            XmlEvent::Text { text } => {
                if p_depth == 1 && stack.last() == Some(&"w:t") {
                    out.push_str(text);
                }
            }
            XmlEvent::Empty { name, attrs } => {
                if p_depth == 1 && stack.last() == Some(&"w:r") {
                    control_append(&mut out, name, attrs);
                }
            }
            _ => {}
        }
    }
    out
}

fn control_append(buf: &mut String, name: &str, attrs: &[(String, String)]) {
    match name {
        "w:tab" | "w:ptab" => buf.push('\t'),
        "w:cr" => buf.push('\n'),
        "w:br" => {
            if find_attr(attrs, "w:type").unwrap_or("textWrapping") == "textWrapping" {
                buf.push('\n');
            }
        }
        "w:noBreakHyphen" => buf.push('-'),
        _ => {}
    }
}
