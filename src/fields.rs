//! Upstream business data: field records in, placeholder map and presence set out.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::docx::placeholder::PlaceholderMap;
use crate::error::{AssemblyError, Result};
use crate::prune::heading::{Boundary, HeadingLevel, SectionTarget, SpanContent};

/// One business field as the persistence layer hands it over.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldRecord {
    pub code: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// A min/typ/max measurement row; expands to `{{CODE1}}`..`{{CODE5}}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MetricRecord {
    pub code: String,
    #[serde(default)]
    pub min_value: Option<String>,
    #[serde(default)]
    pub typical_value: Option<String>,
    #[serde(default)]
    pub max_value: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TextOptions {
    pub list_separator: String,
    pub missing_value: String,
    pub metric_placeholder: String,
    /// Codes never turned into placeholders (attachments and the like).
    pub skip_codes: BTreeSet<String>,
    /// Body section titles for checklist rows whose label differs from the heading.
    pub section_aliases: BTreeMap<String, String>,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            list_separator: "、".to_string(),
            missing_value: "N/A".to_string(),
            metric_placeholder: "--".to_string(),
            skip_codes: BTreeSet::new(),
            section_aliases: BTreeMap::from([(
                "外形尺寸".to_string(),
                "外形尺寸（单位：mm）".to_string(),
            )]),
        }
    }
}

/// Display text of a field value. Arrays (also JSON-encoded ones inside a string) are joined
/// with `sep`; null, empty strings and empty arrays have no text.
pub fn render_value(value: &Value, sep: &str) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => {
            let s = s.trim();
            if s.starts_with('[') {
                if let Ok(items) = serde_json::from_str::<Vec<Value>>(s) {
                    return render_list(&items, sep);
                }
            }
            s.to_string()
        }
        Value::Array(items) => return render_list(items, sep),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(_) => value.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn render_list(items: &[Value], sep: &str) -> Option<String> {
    let parts: Vec<String> = items.iter().filter_map(|v| render_value(v, sep)).collect();
    (!parts.is_empty()).then(|| parts.join(sep))
}

pub fn build_field_map(records: &[FieldRecord], opts: &TextOptions) -> PlaceholderMap {
    let mut map = PlaceholderMap::new();
    for rec in records {
        let code = rec.code.trim();
        if code.is_empty() || opts.skip_codes.contains(code) {
            continue;
        }
        let text = render_value(&rec.value, &opts.list_separator)
            .unwrap_or_else(|| opts.missing_value.clone());
        map.insert_code(code, text);
    }
    map
}

pub fn build_metric_map(records: &[MetricRecord], opts: &TextOptions) -> PlaceholderMap {
    let mut map = PlaceholderMap::new();
    for rec in records {
        let code = rec.code.trim();
        if code.is_empty() {
            continue;
        }
        let columns = [
            &rec.min_value,
            &rec.typical_value,
            &rec.max_value,
            &rec.unit,
            &rec.description,
        ];
        for (i, v) in columns.into_iter().enumerate() {
            let text = v
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(&opts.metric_placeholder);
            map.insert_code(&format!("{code}{}", i + 1), text);
        }
    }
    map
}

/// `{{name}}` for every expected project attribute; absent or blank ones get the missing text.
pub fn build_project_map(
    attributes: &BTreeMap<String, String>,
    expected: &[String],
    opts: &TextOptions,
) -> PlaceholderMap {
    let mut map = PlaceholderMap::new();
    let names: BTreeSet<&str> = expected
        .iter()
        .map(String::as_str)
        .chain(attributes.keys().map(String::as_str))
        .collect();
    for name in names {
        let value = attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or(&opts.missing_value);
        map.insert_code(name, value);
    }
    map
}

/// Field codes that carry data in this run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSet {
    codes: HashSet<String>,
}

impl PresenceSet {
    pub fn from_records(fields: &[FieldRecord], metrics: &[MetricRecord], sep: &str) -> Self {
        let mut set = Self::default();
        for rec in fields {
            if render_value(&rec.value, sep).is_some() {
                set.insert(rec.code.trim());
            }
        }
        for rec in metrics {
            set.insert(rec.code.trim());
        }
        set
    }

    pub fn insert(&mut self, code: &str) {
        if !code.is_empty() {
            self.codes.insert(code.to_string());
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

fn prunable_default() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HeadingEntry {
    pub title: String,
    pub level: HeadingLevel,
    /// Owning field code; entries without one are never missing.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default = "prunable_default")]
    pub prunable: bool,
    #[serde(default)]
    pub boundary: Option<Boundary>,
}

/// Ordered section titles of a template.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct HeadingTaxonomy {
    pub entries: Vec<HeadingEntry>,
}

impl HeadingTaxonomy {
    pub fn is_missing(entry: &HeadingEntry, presence: &PresenceSet) -> bool {
        entry
            .field
            .as_deref()
            .is_some_and(|f| !presence.contains(f.trim()))
    }

    /// Missing entries, taxonomy order.
    pub fn missing<'a>(
        &'a self,
        presence: &'a PresenceSet,
    ) -> impl Iterator<Item = &'a HeadingEntry> + 'a {
        self.entries.iter().filter(move |e| Self::is_missing(e, presence))
    }

    /// First missing entry that may not be pruned.
    pub fn check_required(&self, presence: &PresenceSet) -> Result<()> {
        match self.missing(presence).find(|e| !e.prunable) {
            Some(e) => Err(AssemblyError::PartialDataError {
                field: e.field.clone().unwrap_or_default(),
                heading: e.title.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Body prune targets for every missing entry.
    pub fn prune_targets(
        &self,
        presence: &PresenceSet,
        content: SpanContent,
    ) -> Vec<SectionTarget> {
        self.missing(presence)
            .filter(|e| e.prunable)
            .map(|e| {
                let target = SectionTarget::new(e.title.trim(), e.level).with_content(content);
                match e.boundary {
                    Some(b) => target.with_boundary(b),
                    None => target,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn field(code: &str, value: Value) -> FieldRecord {
        FieldRecord {
            code: code.to_string(),
            value,
            parent_id: None,
            remarks: None,
        }
    }

    #[test]
    fn values_render_lists_and_blanks() {
        assert_eq!(render_value(&json!(["SMT", "波峰焊"]), "、").as_deref(), Some("SMT、波峰焊"));
        assert_eq!(
            render_value(&json!("[\"灌封\",\"喷涂\"]"), "、").as_deref(),
            Some("灌封、喷涂")
        );
        assert_eq!(render_value(&json!(" 1.2kg "), "、").as_deref(), Some("1.2kg"));
        assert_eq!(render_value(&json!(12.5), "、").as_deref(), Some("12.5"));
        assert_eq!(render_value(&json!(""), "、"), None);
        assert_eq!(render_value(&json!([]), "、"), None);
        assert_eq!(render_value(&Value::Null, "、"), None);
    }

    #[test]
    fn field_map_uses_missing_text_and_skips_codes() {
        let mut opts = TextOptions::default();
        opts.skip_codes.insert("test_report".into());
        let map = build_field_map(
            &[
                field("weight", json!("1.2kg")),
                field("storage_temp", Value::Null),
                field("test_report", json!("a.pdf")),
            ],
            &opts,
        );
        assert_eq!(map.get("{{weight}}"), Some("1.2kg"));
        assert_eq!(map.get("{{storage_temp}}"), Some("N/A"));
        assert_eq!(map.get("{{test_report}}"), None);
    }

    #[test]
    fn metrics_expand_to_five_tokens() {
        let map = build_metric_map(
            &[MetricRecord {
                code: "PCV".into(),
                min_value: Some("1".into()),
                typical_value: Some("1".into()),
                max_value: Some("1".into()),
                unit: None,
                description: Some("11".into()),
            }],
            &TextOptions::default(),
        );
        let got: Vec<(&str, &str)> = map.iter().collect();
        assert_eq!(
            got,
            [
                ("{{PCV1}}", "1"),
                ("{{PCV2}}", "1"),
                ("{{PCV3}}", "1"),
                ("{{PCV4}}", "--"),
                ("{{PCV5}}", "11"),
            ]
        );
    }

    #[test]
    fn project_attributes_default_to_missing_text() {
        let attrs = BTreeMap::from([("project_model".to_string(), "MTLB32B".to_string())]);
        let expected = vec!["project_model".to_string(), "file_number".to_string()];
        let map = build_project_map(&attrs, &expected, &TextOptions::default());
        assert_eq!(map.get("{{project_model}}"), Some("MTLB32B"));
        assert_eq!(map.get("{{file_number}}"), Some("N/A"));
    }

    fn taxonomy() -> HeadingTaxonomy {
        serde_json::from_value(json!([
            {"title": "概述", "level": "primary"},
            {"title": "重量", "level": "secondary", "field": "weight"},
            {"title": "电路图", "level": "secondary", "field": "circuit_diagram"},
            {"title": "安全标准", "level": "primary", "field": "safety", "prunable": false}
        ]))
        .unwrap()
    }

    #[test]
    fn missing_headings_follow_presence() {
        let presence = PresenceSet::from_records(
            &[field("weight", json!("1kg")), field("circuit_diagram", json!(""))],
            &[],
            "、",
        );
        let tax = taxonomy();
        let missing: Vec<&str> = tax.missing(&presence).map(|e| e.title.as_str()).collect();
        assert_eq!(missing, ["电路图", "安全标准"]);

        let targets = tax.prune_targets(&presence, SpanContent::Paragraphs);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].title, "电路图");
        assert_eq!(targets[0].boundary, Boundary::SameOrHigher);
    }

    #[test]
    fn non_prunable_missing_field_is_partial_data() {
        let tax = taxonomy();
        let err = tax.check_required(&PresenceSet::default()).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::PartialDataError { ref field, ref heading }
                if field == "safety" && heading == "安全标准"
        ));

        let mut presence = PresenceSet::default();
        presence.insert("safety");
        assert!(tax.check_required(&presence).is_ok());
    }
}
