//! Persistent feed document storage for BOFA: a small owned XML tree, its canonical
//! serializer, the tree-to-map transformer used by the JSON/YAML exporters, and the
//! file-backed feed store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bofa-storage";

pub const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";

const INDENT_WIDTH: usize = 2;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("invalid xml attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("xml is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("xml is not valid utf-8: {0}")]
    OwnedUtf8(#[from] std::string::FromUtf8Error),
    #[error("writing xml: {0}")]
    Io(#[from] std::io::Error),
    #[error("document has no root element")]
    MissingRoot,
    #[error("document has more than one root element")]
    MultipleRoots,
    #[error("text outside the root element")]
    TextOutsideRoot,
    #[error("element <{0}> is never closed")]
    Unclosed(String),
    #[error("closing tag without a matching opening tag")]
    UnexpectedClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// Owned element with ordered attributes and mixed element/text children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut element = Self::new(name);
        element.set_text(text);
        element
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Direct text content, ignoring nested elements.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                XmlNode::Text(text) => Some(text.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    /// Text content of this element and every descendant, in document order.
    pub fn all_text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.children.clear();
        if !text.is_empty() {
            self.children.push(XmlNode::Text(text));
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.elements().filter(move |el| el.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|el| el.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.elements_mut().find(|el| el.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(XmlElement::text)
    }

    /// Index into `children` of the first element called `name`.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, XmlNode::Element(el) if el.name == name))
    }

    pub fn insert_element(&mut self, index: usize, element: XmlElement) {
        let index = index.min(self.children.len());
        self.children.insert(index, XmlNode::Element(element));
    }

    pub fn push_element(&mut self, element: XmlElement) {
        self.children.push(XmlNode::Element(element));
    }

    /// Keep the first element called `name`, drop any later ones. Returns how many were dropped.
    pub fn retain_first(&mut self, name: &str) -> usize {
        let before = self.children.len();
        let mut seen = false;
        self.children.retain(|node| match node {
            XmlNode::Element(el) if el.name == name => !std::mem::replace(&mut seen, true),
            _ => true,
        });
        before - self.children.len()
    }
}

fn collect_text(element: &XmlElement, out: &mut String) {
    for node in &element.children {
        match node {
            XmlNode::Text(text) => out.push_str(text),
            XmlNode::Element(child) => collect_text(child, out),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    pub root: XmlElement,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    /// Parse a complete document. Comments, processing instructions and whitespace-only
    /// text between elements are dropped; a leading BOM is tolerated.
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        let input = input.trim_start_matches('\u{feff}');
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach_element(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let mut element = stack.pop().ok_or(XmlError::UnexpectedClose)?;
                    drop_indentation(&mut element);
                    attach_element(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    attach_text(&mut stack, &text)?;
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    attach_text(&mut stack, std::str::from_utf8(&bytes)?)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(XmlError::Unclosed(open.name.clone()));
        }
        root.map(Self::new).ok_or(XmlError::MissingRoot)
    }

    /// Canonical serialization: XML declaration, two-space indentation, trailing newline.
    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT_WIDTH);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write_element(&mut writer, &self.root)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(String::from_utf8(bytes)?)
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let name = std::str::from_utf8(start.name().as_ref())?.to_string();
    let mut element = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach_element(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.push_element(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError::MultipleRoots);
    }
    *root = Some(element);
    Ok(())
}

fn attach_text(stack: &mut [XmlElement], text: &str) -> Result<(), XmlError> {
    let Some(parent) = stack.last_mut() else {
        return if text.trim().is_empty() {
            Ok(())
        } else {
            Err(XmlError::TextOutsideRoot)
        };
    };
    match parent.children.last_mut() {
        Some(XmlNode::Text(existing)) => existing.push_str(text),
        _ => parent.children.push(XmlNode::Text(text.to_string())),
    }
    Ok(())
}

fn is_blank(node: &XmlNode) -> bool {
    matches!(node, XmlNode::Text(text) if text.trim().is_empty())
}

fn has_text(element: &XmlElement) -> bool {
    element
        .children
        .iter()
        .any(|node| matches!(node, XmlNode::Text(_)) && !is_blank(node))
}

/// Whitespace-only text is layout unless the element also carries real text (mixed content).
fn drop_indentation(element: &mut XmlElement) {
    if !has_text(element) {
        element.children.retain(|node| !is_blank(node));
    }
}

fn write_node<W: Write>(writer: &mut Writer<W>, node: &XmlNode) -> Result<(), XmlError> {
    match node {
        XmlNode::Element(child) => write_element(writer, child),
        XmlNode::Text(text) => {
            writer.write_event(Event::Text(BytesText::new(text)))?;
            Ok(())
        }
    }
}

fn write_element<W: Write>(writer: &mut Writer<W>, element: &XmlElement) -> Result<(), XmlError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if has_text(element) {
        // Text-bearing content is written inline so indentation never leaks into it.
        let mut inline = Writer::new(Vec::new());
        for node in &element.children {
            write_node(&mut inline, node)?;
        }
        let raw = String::from_utf8(inline.into_inner())?;
        writer.write_event(Event::Text(BytesText::from_escaped(raw)))?;
    } else {
        for node in &element.children {
            write_node(writer, node)?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

/// Convert an element into an ordered JSON value. Leaves become their text (or null),
/// repeated child names collapse into arrays, attributes are not carried.
pub fn element_to_value(element: &XmlElement) -> Value {
    if element.elements().next().is_none() {
        return if element.children.is_empty() {
            Value::Null
        } else {
            Value::String(element.text())
        };
    }

    let mut map = Map::new();
    for child in element.elements() {
        let value = element_to_value(child);
        match map.get_mut(&child.name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(child.name.clone(), value);
            }
        }
    }
    Value::Object(map)
}

pub fn document_to_value(document: &XmlDocument) -> Value {
    element_to_value(&document.root)
}

pub fn export_json(document: &XmlDocument, path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    let mut bytes = serde_json::to_vec_pretty(&document_to_value(document))
        .with_context(|| format!("serializing {} as json", path.display()))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path.to_path_buf())
}

pub fn export_yaml(document: &XmlDocument, path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    let text = serde_yaml::to_string(&document_to_value(document))
        .with_context(|| format!("serializing {} as yaml", path.display()))?;
    write_atomic(path, text.as_bytes()).with_context(|| format!("writing {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// Sibling `.json` and `.yaml` paths for an XML file.
pub fn snapshot_paths(xml_path: &Path) -> (PathBuf, PathBuf) {
    (xml_path.with_extension("json"), xml_path.with_extension("yaml"))
}

/// Minimal well-formed feed: an `rss` root holding one empty `channel`.
pub fn empty_feed_document() -> XmlDocument {
    XmlDocument::new(
        XmlElement::new("rss")
            .with_attribute("version", "2.0")
            .with_attribute("xmlns:atom", ATOM_NAMESPACE)
            .with_child(XmlElement::new("channel")),
    )
}

#[derive(Debug, Error)]
pub enum FeedStoreError {
    #[error("malformed feed document {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: XmlError,
    },
    #[error("serializing feed document {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: XmlError,
    },
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FeedStoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFeed {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub changed: bool,
}

/// File-backed store for per-browser feed documents. Relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FeedStore {
    root: PathBuf,
}

impl FeedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write the empty feed skeleton when the file is missing or empty. Returns whether it wrote.
    pub fn ensure(&self, path: impl AsRef<Path>) -> Result<bool, FeedStoreError> {
        let requested = path.as_ref();
        let path = self.resolve(requested);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(FeedStoreError::io("inspecting", &path, err)),
        }
        self.save(&empty_feed_document(), requested)?;
        debug!(path = %path.display(), "created empty feed document");
        Ok(true)
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<XmlDocument, FeedStoreError> {
        let path = self.resolve(path);
        let bytes = fs::read(&path).map_err(|err| FeedStoreError::io("reading", &path, err))?;
        let text = String::from_utf8(bytes).map_err(|err| FeedStoreError::Malformed {
            path: path.clone(),
            source: XmlError::from(err),
        })?;
        XmlDocument::parse(&text).map_err(|source| FeedStoreError::Malformed { path, source })
    }

    /// Serialize and replace the whole file through a temp file + rename.
    pub fn save(
        &self,
        document: &XmlDocument,
        path: impl AsRef<Path>,
    ) -> Result<StoredFeed, FeedStoreError> {
        let path = self.resolve(path);
        let xml = document
            .to_xml_string()
            .map_err(|source| FeedStoreError::Serialize {
                path: path.clone(),
                source,
            })?;
        let bytes = xml.into_bytes();
        let content_hash = Self::sha256_hex(&bytes);

        let previous_hash = match fs::read(&path) {
            Ok(existing) => Some(Self::sha256_hex(&existing)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(FeedStoreError::io("reading", &path, err)),
        };

        write_atomic(&path, &bytes).map_err(|err| FeedStoreError::io("writing", &path, err))?;

        Ok(StoredFeed {
            changed: previous_hash.as_deref() != Some(content_hash.as_str()),
            path,
            content_hash,
            byte_size: bytes.len(),
        })
    }
}

/// Write `bytes` to a hidden temp sibling, then rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.flush()
        });

    match written.and_then(|()| fs::rename(&temp_path, path)) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(err)
        }
    }
}
