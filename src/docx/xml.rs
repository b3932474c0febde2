use anyhow::{anyhow, Context};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

impl XmlEvent {
    pub fn start(name: &str, attrs: &[(&str, &str)]) -> Self {
        Self::Start {
            name: name.to_string(),
            attrs: own_attrs(attrs),
        }
    }

    pub fn empty(name: &str, attrs: &[(&str, &str)]) -> Self {
        Self::Empty {
            name: name.to_string(),
            attrs: own_attrs(attrs),
        }
    }

    pub fn end(name: &str) -> Self {
        Self::End {
            name: name.to_string(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
        }
    }

    /// Element name for Start/Empty/End events.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Start { name, .. } | Self::Empty { name, .. } | Self::End { name } => {
                Some(name.as_str())
            }
            _ => None,
        }
    }
}

fn own_attrs(attrs: &[(&str, &str)]) -> Vec<(String, String)> {
    attrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Clone, Debug)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
}

impl XmlPart {
    /// Index of the event closing the element opened at `start`.
    ///
    /// For an `Empty` event this is `start` itself.
    pub fn element_end(&self, start: usize) -> anyhow::Result<usize> {
        match self.events.get(start) {
            Some(XmlEvent::Empty { .. }) => return Ok(start),
            Some(XmlEvent::Start { .. }) => {}
            _ => return Err(anyhow!("no element starts at event {start} in {}", self.name)),
        }
        let mut depth = 0usize;
        for (idx, ev) in self.events.iter().enumerate().skip(start) {
            match ev {
                XmlEvent::Start { .. } => depth += 1,
                XmlEvent::End { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(idx);
                    }
                }
                _ => {}
            }
        }
        Err(anyhow!("unclosed element at event {start} in {}", self.name))
    }

    /// Inclusive ranges of the direct child elements of the element opened at `start`.
    pub fn child_elements(&self, start: usize) -> anyhow::Result<Vec<(usize, usize)>> {
        let end = self.element_end(start)?;
        let mut out = Vec::new();
        let mut idx = start + 1;
        while idx < end {
            match self.events[idx] {
                XmlEvent::Start { .. } => {
                    let child_end = self.element_end(idx)?;
                    out.push((idx, child_end));
                    idx = child_end + 1;
                }
                XmlEvent::Empty { .. } => {
                    out.push((idx, idx));
                    idx += 1;
                }
                _ => idx += 1,
            }
        }
        Ok(out)
    }

    /// Remove inclusive event ranges. Ranges must not overlap; order does not matter.
    pub fn remove_ranges(&mut self, ranges: &mut [(usize, usize)]) {
        ranges.sort_by(|a, b| b.0.cmp(&a.0));
        for &(start, end) in ranges.iter() {
            self.events.drain(start..=end);
        }
    }
}

pub fn find_attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn parse_xml_part(name: &str, xml_bytes: &[u8]) -> anyhow::Result<XmlPart> {
    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader.read_event_into(&mut buf).context("read xml event")?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().context("unescape text")?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                events.push(XmlEvent::CData {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::Comment(t) => {
                events.push(XmlEvent::Comment {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                events.push(XmlEvent::DocType {
                    text: bytes_to_string(t.into_inner()),
                });
            }
        }
    }

    Ok(XmlPart {
        name: name.to_string(),
        events,
    })
}

fn collect_attrs(s: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.context("attr")?;
        // Raw (still escaped) bytes: VML attributes such as `o:gfxdata` carry `&#13;&#10;`
        // references that must survive a write unchanged.
        attrs.push((
            bytes_to_string(a.key.as_ref()),
            bytes_to_string(a.value.as_ref()),
        ));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

pub fn write_xml_part(part: &XmlPart) -> anyhow::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();

    fn escape_text_into(out: &mut Vec<u8>, text: &str) {
        for ch in text.chars() {
            match ch {
                '&' => out.extend_from_slice(b"&amp;"),
                '<' => out.extend_from_slice(b"&lt;"),
                '>' => out.extend_from_slice(b"&gt;"),
                _ => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn write_start_like(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], empty: bool) {
        out.extend_from_slice(b"<");
        out.extend_from_slice(name.as_bytes());
        // Attribute values are already escaped.
        for (k, v) in attrs {
            out.extend_from_slice(b" ");
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b"=\"");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\"");
        }
        if empty {
            out.extend_from_slice(b"/>");
        } else {
            out.extend_from_slice(b">");
        }
    }

    for ev in &part.events {
        match ev {
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                let d =
                    BytesDecl::new(version.as_str(), encoding.as_deref(), standalone.as_deref());
                let mut writer = quick_xml::Writer::new(Vec::new());
                writer.write_event(Event::Decl(d)).context("write decl")?;
                out.extend_from_slice(&writer.into_inner());
            }
            XmlEvent::Start { name, attrs } => write_start_like(&mut out, name, attrs, false),
            XmlEvent::End { name } => {
                out.extend_from_slice(b"</");
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b">");
            }
            XmlEvent::Empty { name, attrs } => write_start_like(&mut out, name, attrs, true),
            XmlEvent::Text { text } => escape_text_into(&mut out, text),
            XmlEvent::CData { text } => {
                out.extend_from_slice(b"<![CDATA[");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"]]>");
            }
            XmlEvent::Comment { text } => {
                out.extend_from_slice(b"<!--");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"-->");
            }
            XmlEvent::PI { content } => {
                out.extend_from_slice(b"<?");
                out.extend_from_slice(content.as_bytes());
                out.extend_from_slice(b"?>");
            }
            XmlEvent::DocType { text } => {
                out.extend_from_slice(b"<!DOCTYPE");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b">");
            }
        }
    }

    Ok(out)
}

/// Hash of the element skeleton: element names and attribute keys in document order.
///
/// Text and attribute values are left out, so two parts hash equal iff they differ only in
/// content.
pub fn markup_hash(events: &[XmlEvent]) -> String {
    let mut hasher = Sha256::new();
    for ev in events {
        match ev {
            XmlEvent::Start { name, attrs } | XmlEvent::Empty { name, attrs } => {
                hasher.update(b"S:");
                hasher.update(name.as_bytes());
                for (k, _) in attrs {
                    hasher.update(b"|");
                    hasher.update(k.as_bytes());
                }
                hasher.update(b"\n");
                if matches!(ev, XmlEvent::Empty { .. }) {
                    hash_end(&mut hasher, name);
                }
            }
            XmlEvent::End { name } => hash_end(&mut hasher, name),
            XmlEvent::CData { .. } => hasher.update(b"C\n"),
            XmlEvent::Comment { .. } => hasher.update(b"M\n"),
            XmlEvent::PI { .. } => hasher.update(b"P\n"),
            XmlEvent::DocType { .. } => hasher.update(b"Y\n"),
            XmlEvent::Decl { .. } => hasher.update(b"D\n"),
            XmlEvent::Text { .. } => {}
        }
    }
    hex::encode(hasher.finalize())
}

fn hash_end(hasher: &mut Sha256, name: &str) {
    hasher.update(b"E:");
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
}
