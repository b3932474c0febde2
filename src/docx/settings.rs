//! Document settings part: the `w:updateFields` flag that makes a word processor refresh every
//! field (table of contents included) the next time the document is opened.

use anyhow::anyhow;

use crate::docx::xml::{find_attr, XmlEvent, XmlPart};

pub const SETTINGS_PART: &str = "word/settings.xml";

/// Children of `w:settings` that follow `w:updateFields` in schema order.
const AFTER_UPDATE_FIELDS: &[&str] = &[
    "w:hdrShapeDefaults",
    "w:footnotePr",
    "w:endnotePr",
    "w:compat",
    "w:docVars",
    "w:rsids",
    "m:mathPr",
    "w:attachedSchema",
    "w:themeFontLang",
    "w:clrSchemeMapping",
    "w:doNotIncludeSubdocsInStats",
    "w:doNotAutoCompressPictures",
    "w:forceUpgrade",
    "w:captions",
    "w:readModeInkLockDown",
    "w:smartTagType",
    "sl:schemaLibrary",
    "w:shapeDefaults",
    "w:doNotEmbedSmartTags",
    "w:decimalSymbol",
    "w:listSeparator",
];

/// Set `w:updateFields` to true. Returns whether the part changed.
pub fn mark_fields_dirty(part: &mut XmlPart) -> anyhow::Result<bool> {
    let root = part
        .events
        .iter()
        .position(|ev| matches!(ev, XmlEvent::Start { name, .. } if name == "w:settings"))
        .ok_or_else(|| anyhow!("{} has no w:settings element", part.name))?;
    let children = part.child_elements(root)?;

    for &(start, _) in &children {
        if part.events[start].name() != Some("w:updateFields") {
            continue;
        }
        let (XmlEvent::Empty { attrs, .. } | XmlEvent::Start { attrs, .. }) = &mut part.events[start]
        else {
            continue;
        };
        if find_attr(attrs, "w:val").is_some_and(|v| v == "true" || v == "1") {
            return Ok(false);
        }
        attrs.retain(|(k, _)| k != "w:val");
        attrs.push(("w:val".to_string(), "true".to_string()));
        return Ok(true);
    }

    let at = children
        .iter()
        .find(|&&(start, _)| {
            part.events[start]
                .name()
                .is_some_and(|n| AFTER_UPDATE_FIELDS.contains(&n))
        })
        .map(|&(start, _)| start)
        .unwrap_or_else(|| children.last().map(|&(_, end)| end + 1).unwrap_or(root + 1));
    part.events
        .insert(at, XmlEvent::empty("w:updateFields", &[("w:val", "true")]));
    Ok(true)
}
