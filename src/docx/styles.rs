use std::collections::HashMap;

use crate::docx::xml::{find_attr, XmlEvent, XmlPart};
use crate::textutil::normalize_label;

pub const STYLES_PART: &str = "word/styles.xml";

/// Paragraph style ids mapped to their display names (`w:styleId` → `w:name`).
#[derive(Clone, Debug, Default)]
pub struct StyleMap {
    names: HashMap<String, String>,
}

impl StyleMap {
    pub fn from_part(part: &XmlPart) -> Self {
        let mut names = HashMap::new();
        let mut current: Option<String> = None;
        for ev in &part.events {
            match ev {
                XmlEvent::Start { name, attrs } if name == "w:style" => {
                    let is_paragraph =
                        find_attr(attrs, "w:type").unwrap_or("paragraph") == "paragraph";
                    current = find_attr(attrs, "w:styleId")
                        .filter(|_| is_paragraph)
                        .map(str::to_string);
                }
                XmlEvent::End { name } if name == "w:style" => current = None,
                XmlEvent::Empty { name, attrs } if name == "w:name" => {
                    if let (Some(id), Some(val)) = (current.as_ref(), find_attr(attrs, "w:val")) {
                        names.insert(id.clone(), val.to_string());
                    }
                }
                _ => {}
            }
        }
        Self { names }
    }

    pub fn name_of<'a>(&'a self, style_id: &'a str) -> &'a str {
        self.names.get(style_id).map(String::as_str).unwrap_or(style_id)
    }

    /// Whether a paragraph with `style_id` carries the style labelled `label`.
    ///
    /// Both the id and the display name are tried, ignoring case and whitespace, so
    /// `Heading 1`, `heading 1` and `Heading1` all address the same style.
    pub fn matches(&self, style_id: &str, label: &str) -> bool {
        let want = normalize_label(label);
        normalize_label(style_id) == want || normalize_label(self.name_of(style_id)) == want
    }
}
