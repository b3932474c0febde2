use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::docx::body::DOCUMENT_PART;
use crate::docx::package::WorkingTree;
use crate::docx::xml::{markup_hash, parse_xml_part};
use crate::error::{AssemblyError, Result};
use crate::textutil::{escape_xml, placeholder_token, scan_tokens};

/// Token (`{{code}}`, braces included) → final display text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaceholderMap {
    entries: BTreeMap<String, String>,
}

impl PlaceholderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the raw token text.
    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(token.into(), value.into());
    }

    /// Insert under `{{code}}`.
    pub fn insert_code(&mut self, code: &str, value: impl Into<String>) {
        self.entries.insert(placeholder_token(code), value.into());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(String::as_str)
    }

    pub fn extend(&mut self, other: PlaceholderMap) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Single-pass literal replacer built once per map.
///
/// All tokens are matched by one alternation, longest token first, so a value that happens
/// to contain another token is never substituted again.
pub struct Substituter {
    matcher: Option<Regex>,
    values: BTreeMap<String, String>,
}

impl Substituter {
    pub fn new(map: &PlaceholderMap) -> Result<Self> {
        let mut keys: Vec<&str> = map
            .entries
            .keys()
            .map(String::as_str)
            .filter(|k| !k.is_empty())
            .collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let matcher = if keys.is_empty() {
            None
        } else {
            let pattern = keys
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&pattern)
                .map_err(|e| AssemblyError::xml("placeholder map", anyhow::Error::new(e)))?;
            Some(re)
        };
        let values = map
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), escape_xml(v)))
            .collect();
        Ok(Self { matcher, values })
    }

    /// Replace every token occurrence in `text`; returns the new text and per-token counts.
    pub fn apply(&self, text: &str) -> (String, BTreeMap<String, usize>) {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let Some(re) = self.matcher.as_ref() else {
            return (text.to_string(), counts);
        };
        let out = re.replace_all(text, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            *counts.entry(token.to_string()).or_default() += 1;
            self.values.get(token).cloned().unwrap_or_else(|| token.to_string())
        });
        (out.into_owned(), counts)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SubstitutionStats {
    pub part: String,
    pub replaced: usize,
    pub per_token: BTreeMap<String, usize>,
    /// Codes of `{{ code }}` tokens still present after substitution.
    pub unresolved: BTreeSet<String>,
}

/// Substitute one XML part in place.
pub fn substitute(part_path: &Path, map: &PlaceholderMap) -> Result<SubstitutionStats> {
    substitute_with(part_path, &Substituter::new(map)?)
}

pub fn substitute_with(part_path: &Path, subst: &Substituter) -> Result<SubstitutionStats> {
    let part_name = part_path.display().to_string();
    let bytes = fs::read(part_path)
        .map_err(|e| AssemblyError::io(format!("read part: {part_name}"), e))?;
    let text = String::from_utf8(bytes).map_err(|e| {
        AssemblyError::io(
            format!("part is not utf-8: {part_name}"),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;

    let (out, per_token) = subst.apply(&text);
    let replaced = per_token.values().sum();
    if replaced > 0 {
        ensure_markup_unchanged(&part_name, &text, &out)?;
        fs::write(part_path, out.as_bytes())
            .map_err(|e| AssemblyError::io(format!("write part: {part_name}"), e))?;
    }
    Ok(SubstitutionStats {
        part: part_name,
        replaced,
        per_token,
        unresolved: scan_tokens(&out),
    })
}

fn ensure_markup_unchanged(part_name: &str, before: &str, after: &str) -> Result<()> {
    let parse = |xml: &str| {
        parse_xml_part(part_name, xml.as_bytes()).map_err(|e| AssemblyError::xml(part_name, e))
    };
    let a = parse(before)?;
    let b = parse(after)?;
    if markup_hash(&a.events) != markup_hash(&b.events) {
        return Err(AssemblyError::xml(
            part_name,
            anyhow::anyhow!("substitution changed element structure"),
        ));
    }
    Ok(())
}

/// Body part plus every header/footer part directly under `word/`.
pub fn substitutable_parts(tree: &WorkingTree) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    if tree.has_part(DOCUMENT_PART) {
        parts.push(DOCUMENT_PART.to_string());
    }
    let mut extra: Vec<String> = tree
        .part_names_in("word")
        .into_iter()
        .filter(|name| {
            let file = name.trim_start_matches("word/");
            (file.starts_with("header") || file.starts_with("footer")) && file.ends_with(".xml")
        })
        .collect();
    extra.sort();
    parts.extend(extra);
    parts
}

pub fn substitute_tree(tree: &WorkingTree, map: &PlaceholderMap) -> Result<Vec<SubstitutionStats>> {
    let subst = Substituter::new(map)?;
    let mut all = Vec::new();
    for name in substitutable_parts(tree) {
        let mut stats = substitute_with(&tree.part_path(&name), &subst)?;
        stats.part = name;
        debug!(part = %stats.part, replaced = stats.replaced, "substituted placeholders");
        if !stats.unresolved.is_empty() {
            warn!(
                part = %stats.part,
                tokens = ?stats.unresolved,
                "placeholders left without a value"
            );
        }
        all.push(stats);
    }
    Ok(all)
}
