//! Streaming token source over `quick-xml`.
//!
//! The passes only see three callbacks (`start_element`, `end_element`,
//! `character_data`). External entities declared in the DOCTYPE
//! (`<!ENTITY name SYSTEM "file">`) are sub-parsed in place when `&name;`
//! appears in character data, through the same sink.

use crate::error::{LoadError, LoadResult};
use ahash::AHashMap;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ============================================================================
// Sources
// ============================================================================

/// A re-openable XML document; pass 2 reads it a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlSource {
    File(PathBuf),
    Text { name: String, body: String },
}

impl XmlSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        XmlSource::File(path.into())
    }

    pub fn text(name: impl Into<String>, body: impl Into<String>) -> Self {
        XmlSource::Text {
            name: name.into(),
            body: body.into(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            XmlSource::File(path) => path.display().to_string(),
            XmlSource::Text { name, .. } => name.clone(),
        }
    }

    fn read(&self) -> LoadResult<String> {
        match self {
            XmlSource::File(path) => Ok(std::fs::read_to_string(path)?),
            XmlSource::Text { body, .. } => Ok(body.clone()),
        }
    }

    /// Directory that relative entity paths resolve against.
    fn base_dir(&self) -> PathBuf {
        match self {
            XmlSource::File(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            XmlSource::Text { .. } => PathBuf::from("."),
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Attributes of one start tag, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, treating an empty string as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Attributes {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// ============================================================================
// Sink + driver
// ============================================================================

pub trait TokenSink {
    fn start_element(&mut self, name: &str, attrs: &Attributes) -> LoadResult<()>;
    fn end_element(&mut self, name: &str) -> LoadResult<()>;
    fn character_data(&mut self, text: &str) -> LoadResult<()>;
}

/// Stream `source` into `sink`.
pub fn drive(source: &XmlSource, sink: &mut dyn TokenSink) -> LoadResult<()> {
    let mut driver = Driver::default();
    let body = source.read()?;
    driver.run(&source.name(), &body, &source.base_dir(), sink)
}

#[derive(Default)]
struct Driver {
    entities: AHashMap<String, PathBuf>,
    active: Vec<PathBuf>,
}

fn entity_decl() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<!ENTITY\s+([A-Za-z_][\w.\-]*)\s+SYSTEM\s+["']([^"']+)["']\s*>"#)
            .expect("entity declaration pattern")
    })
}

impl Driver {
    fn run(
        &mut self,
        document: &str,
        body: &str,
        base_dir: &Path,
        sink: &mut dyn TokenSink,
    ) -> LoadResult<()> {
        let mut reader = Reader::from_str(body);
        reader.trim_text(false);
        let mut buf = Vec::new();
        let mut open: Vec<String> = Vec::new();

        let xml_err = |position: usize, message: String| LoadError::Xml {
            document: document.to_string(),
            position,
            message,
        };

        loop {
            let position = reader.buffer_position();
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| xml_err(position, e.to_string()))?;
            match event {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let attrs = read_attributes(&e).map_err(|m| xml_err(position, m))?;
                    sink.start_element(&name, &attrs)?;
                    open.push(name);
                }
                Event::Empty(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let attrs = read_attributes(&e).map_err(|m| xml_err(position, m))?;
                    sink.start_element(&name, &attrs)?;
                    sink.end_element(&name)?;
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    match open.pop() {
                        Some(expected) if expected == name => sink.end_element(&name)?,
                        Some(expected) => {
                            return Err(LoadError::UnbalancedTag {
                                expected,
                                found: name,
                            })
                        }
                        None => {
                            return Err(LoadError::UnbalancedTag {
                                expected: String::new(),
                                found: name,
                            })
                        }
                    }
                }
                Event::Text(e) => {
                    let raw = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    self.text_with_entities(&raw, sink)
                        .map_err(|err| match err {
                            LoadError::Format(m) => xml_err(position, m),
                            other => other,
                        })?;
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    sink.character_data(&text)?;
                }
                Event::DocType(e) => {
                    let decl = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    for cap in entity_decl().captures_iter(&decl) {
                        let path = base_dir.join(&cap[2]);
                        self.entities.insert(cap[1].to_string(), path);
                    }
                }
                Event::Eof => break,
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) => {}
            }
            buf.clear();
        }

        if let Some(expected) = open.pop() {
            return Err(LoadError::UnbalancedTag {
                expected,
                found: "end of document".to_string(),
            });
        }
        Ok(())
    }

    /// Split raw text on external entity references; everything between is
    /// ordinary escaped text.
    fn text_with_entities(
        &mut self,
        raw: &str,
        sink: &mut dyn TokenSink,
    ) -> LoadResult<()> {
        let mut plain = String::new();
        let mut rest = raw;
        while let Some(amp) = rest.find('&') {
            let Some(semi) = rest[amp..].find(';') else {
                break;
            };
            let name = &rest[amp + 1..amp + semi];
            match self.entities.get(name).cloned() {
                Some(path) => {
                    plain.push_str(&rest[..amp]);
                    emit_unescaped(&plain, sink)?;
                    plain.clear();
                    self.include(path, sink)?;
                }
                // Not external: leave it for the unescaper.
                None => plain.push_str(&rest[..amp + semi + 1]),
            }
            rest = &rest[amp + semi + 1..];
        }
        plain.push_str(rest);
        emit_unescaped(&plain, sink)
    }

    fn include(&mut self, path: PathBuf, sink: &mut dyn TokenSink) -> LoadResult<()> {
        if self.active.contains(&path) {
            return Err(LoadError::EntityCycle(path.display().to_string()));
        }
        tracing::debug!(entity = %path.display(), "including external entity");
        let body = std::fs::read_to_string(&path)?;
        let nested_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.active.push(path.clone());
        let result = self.run(&path.display().to_string(), &body, &nested_dir, sink);
        self.active.pop();
        result
    }
}

fn emit_unescaped(raw: &str, sink: &mut dyn TokenSink) -> LoadResult<()> {
    if raw.is_empty() {
        return Ok(());
    }
    let text = quick_xml::escape::unescape(raw).map_err(|e| LoadError::Format(e.to_string()))?;
    sink.character_data(&text)
}

fn read_attributes(e: &quick_xml::events::BytesStart<'_>) -> Result<Attributes, String> {
    let mut pairs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        pairs.push((key, value));
    }
    Ok(Attributes::new(pairs))
}
