//! XML export and import
//!
//! Images are written as `imgdir` documents. Directories are written either as one document
//! per image laid out like the archive, or as a single `xmldump` document of `wzdir` and
//! `wzimg` elements. Canvas and sound payloads travel as base64 attributes.
//!
//! | Element    | Attributes                                              |
//! | ---------- | ------------------------------------------------------- |
//! | `imgdir`   | `name`                                                  |
//! | `null`     | `name`                                                  |
//! | `short`    | `name`, `value`                                         |
//! | `int`      | `name`, `value`                                         |
//! | `long`     | `name`, `value`                                         |
//! | `float`    | `name`, `value`                                         |
//! | `double`   | `name`, `value`                                         |
//! | `string`   | `name`, `value`                                         |
//! | `vector`   | `name`, `x`, `y`                                        |
//! | `extended` | `name`                                                  |
//! | `canvas`   | `name`, `width`, `height`, `format`, `format2`, `basedata` |
//! | `sound`    | `name`, `length`, `basehead`, `basedata`                |
//! | `uol`      | `name`, `value`                                         |

use base64::prelude::{Engine as _, BASE64_STANDARD};
use bon::Builder;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::Path;
use tracing::{debug, instrument};

use crate::archive::WzArchive;
use crate::error::{Error, Result};
use crate::tree::{CanvasData, NodeId, NodeKind, Payload, SoundData, WzTree, WzValue};

/// Canvas format assumed when an imported `canvas` carries none
const DEFAULT_CANVAS_FORMAT: i32 = 1;

/// Line terminator placed between elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineBreak {
    #[default]
    Lf,
    CrLf,
    /// Elements follow each other on a single line
    None,
}

impl LineBreak {
    fn as_str(self) -> &'static str {
        match self {
            LineBreak::Lf => "\n",
            LineBreak::CrLf => "\r\n",
            LineBreak::None => "",
        }
    }
}

/// Layout and content of exported documents
#[derive(Debug, Clone, Builder)]
pub struct XmlOptions {
    /// Spaces per nesting level
    #[builder(default = 2)]
    pub indent: usize,
    #[builder(default)]
    pub line_break: LineBreak,
    /// Embed canvas and sound payloads
    #[builder(default)]
    pub include_base64: bool,
}

impl Default for XmlOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Writes one image as an `imgdir` document
#[instrument(skip(archive, options, out), err)]
pub fn export_image<R: Read + Seek, W: Write>(
    archive: &mut WzArchive<R>,
    image: NodeId,
    options: &XmlOptions,
    out: W,
) -> Result<W> {
    expect_kind(archive.tree(), image, NodeKind::Image)?;
    let mut guard = archive.acquire(image)?;
    let mut exporter = XmlExporter::new(&mut *guard, options, out);
    exporter.declaration()?;
    exporter.write_image(image, "imgdir")?;
    Ok(exporter.finish())
}

/// Writes a single property and its descendants, without a declaration
pub fn export_property<R: Read + Seek, W: Write>(
    archive: &mut WzArchive<R>,
    property: NodeId,
    options: &XmlOptions,
    out: W,
) -> Result<W> {
    if !archive.tree().kind(property)?.is_property() {
        return Err(Error::UnexpectedKind {
            id: property,
            expected: NodeKind::SubProperty,
        });
    }
    let mut exporter = XmlExporter::new(archive, options, out);
    exporter.write_property(property)?;
    Ok(exporter.finish())
}

/// Writes a directory and everything below it as one `xmldump` document
#[instrument(skip(archive, options, out), err)]
pub fn export_dump<R: Read + Seek, W: Write>(
    archive: &mut WzArchive<R>,
    directory: NodeId,
    options: &XmlOptions,
    out: W,
) -> Result<W> {
    expect_kind(archive.tree(), directory, NodeKind::Directory)?;
    let mut exporter = XmlExporter::new(archive, options, out);
    exporter.declaration()?;
    exporter.open("xmldump", Vec::new())?;
    exporter.write_directory(directory)?;
    exporter.close("xmldump")?;
    Ok(exporter.finish())
}

/// Writes every image below `directory` into `out_dir` as `<image>.xml`, mirroring the
/// directory layout. Returns the number of documents written.
#[instrument(skip(archive, options, out_dir), err)]
pub fn export_directory<R: Read + Seek>(
    archive: &mut WzArchive<R>,
    directory: NodeId,
    options: &XmlOptions,
    out_dir: &Path,
) -> Result<usize> {
    expect_kind(archive.tree(), directory, NodeKind::Directory)?;
    fs::create_dir_all(out_dir)?;

    let mut written = 0;
    for child in archive.tree().children(directory)?.to_vec() {
        let name = archive.tree().name(child)?.to_string();
        match archive.tree().kind(child)? {
            NodeKind::Directory => {
                written += export_directory(archive, child, options, &out_dir.join(&name))?;
            }
            _ => {
                let file = File::create(out_dir.join(format!("{name}.xml")))?;
                let mut writer = export_image(archive, child, options, BufWriter::new(file))?;
                writer.flush()?;
                written += 1;
            }
        }
    }
    debug!(written, "exported directory");
    Ok(written)
}

fn expect_kind(tree: &WzTree, id: NodeId, expected: NodeKind) -> Result<()> {
    if tree.kind(id)? != expected {
        return Err(Error::UnexpectedKind { id, expected });
    }
    Ok(())
}

type Attributes = Vec<(&'static str, String)>;

struct XmlExporter<'a, R, W: Write> {
    archive: &'a mut WzArchive<R>,
    options: &'a XmlOptions,
    writer: Writer<W>,
    depth: usize,
    started: bool,
}

impl<'a, R: Read + Seek, W: Write> XmlExporter<'a, R, W> {
    fn new(archive: &'a mut WzArchive<R>, options: &'a XmlOptions, out: W) -> Self {
        Self {
            archive,
            options,
            writer: Writer::new(out),
            depth: 0,
            started: false,
        }
    }

    fn finish(self) -> W {
        self.writer.into_inner()
    }

    fn emit(&mut self, event: Event<'_>) -> Result<()> {
        self.writer.write_event(event)?;
        Ok(())
    }

    fn declaration(&mut self) -> Result<()> {
        self.emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.started = true;
        Ok(())
    }

    /// Starts a new line, except before the first element of a fragment
    fn line(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            return Ok(());
        }
        let text = format!(
            "{}{}",
            self.options.line_break.as_str(),
            " ".repeat(self.options.indent * self.depth)
        );
        if !text.is_empty() {
            self.emit(Event::Text(BytesText::from_escaped(text)))?;
        }
        Ok(())
    }

    fn start(tag: &str, attributes: &Attributes) -> BytesStart<'static> {
        let mut start = BytesStart::new(tag.to_string());
        for (key, value) in attributes {
            start.push_attribute((*key, value.as_str()));
        }
        start
    }

    fn empty(&mut self, tag: &str, attributes: Attributes) -> Result<()> {
        self.line()?;
        self.emit(Event::Empty(Self::start(tag, &attributes)))
    }

    fn open(&mut self, tag: &str, attributes: Attributes) -> Result<()> {
        self.line()?;
        self.emit(Event::Start(Self::start(tag, &attributes)))?;
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self, tag: &str) -> Result<()> {
        self.depth -= 1;
        self.line()?;
        self.emit(Event::End(BytesEnd::new(tag.to_string())))
    }

    /// Writes `tag` around the children of `id`, collapsing to an empty element when there
    /// are none
    fn container(&mut self, id: NodeId, tag: &str, attributes: Attributes) -> Result<()> {
        let children = self.archive.tree().children(id)?.to_vec();
        if children.is_empty() {
            return self.empty(tag, attributes);
        }
        self.open(tag, attributes)?;
        for child in children {
            self.write_property(child)?;
        }
        self.close(tag)
    }

    fn write_directory(&mut self, directory: NodeId) -> Result<()> {
        let name = self.archive.tree().name(directory)?.to_string();
        let children = self.archive.tree().children(directory)?.to_vec();
        if children.is_empty() {
            return self.empty("wzdir", vec![("name", name)]);
        }
        self.open("wzdir", vec![("name", name)])?;
        for child in children {
            match self.archive.tree().kind(child)? {
                NodeKind::Directory => self.write_directory(child)?,
                _ => self.write_image(child, "wzimg")?,
            }
        }
        self.close("wzdir")
    }

    /// Writes an image, loading it for the duration of the write when needed
    fn write_image(&mut self, image: NodeId, tag: &str) -> Result<()> {
        let release = !self.archive.is_parsed(image)?;
        let result = self.write_loaded_image(image, tag);
        if release {
            self.archive.release(image)?;
        }
        result
    }

    fn write_loaded_image(&mut self, image: NodeId, tag: &str) -> Result<()> {
        self.archive.materialize(image)?;
        let name = self.archive.tree().name(image)?.to_string();
        self.container(image, tag, vec![("name", name)])
    }

    fn write_property(&mut self, id: NodeId) -> Result<()> {
        let tree = self.archive.tree();
        let name = tree.name(id)?.to_string();
        let value = tree.value(id)?.clone();
        match value {
            WzValue::Null => self.empty("null", vec![("name", name)]),
            WzValue::Short(value) => self.scalar("short", name, value),
            WzValue::Int(value) => self.scalar("int", name, value),
            WzValue::Long(value) => self.scalar("long", name, value),
            WzValue::Float(value) => self.scalar("float", name, decimal(value)),
            WzValue::Double(value) => self.scalar("double", name, decimal(value)),
            WzValue::String(value) => self.scalar("string", name, value),
            WzValue::Uol(value) => self.scalar("uol", name, value),
            WzValue::Vector => {
                let Some((x, y)) = tree.vector(id) else {
                    return Err(Error::InvalidOperation(format!(
                        "vector {} lacks X or Y",
                        tree.full_path(id)?
                    )));
                };
                self.empty(
                    "vector",
                    vec![("name", name), ("x", x.to_string()), ("y", y.to_string())],
                )
            }
            WzValue::SubProperty => self.container(id, "imgdir", vec![("name", name)]),
            WzValue::Convex => self.container(id, "extended", vec![("name", name)]),
            WzValue::Canvas(canvas) => {
                let mut attributes = vec![
                    ("name", name),
                    ("width", canvas.width.to_string()),
                    ("height", canvas.height.to_string()),
                    ("format", canvas.format.to_string()),
                    ("format2", canvas.format2.to_string()),
                ];
                if self.options.include_base64 {
                    attributes.push(("basedata", self.encoded_payload(id)?));
                }
                self.container(id, "canvas", attributes)
            }
            WzValue::Sound(sound) => {
                let mut attributes = vec![("name", name), ("length", sound.duration_ms.to_string())];
                if self.options.include_base64 {
                    if sound.header.is_empty() {
                        return Err(Error::NoEmbeddedData(self.archive.tree().full_path(id)?));
                    }
                    attributes.push(("basehead", BASE64_STANDARD.encode(&sound.header)));
                    attributes.push(("basedata", self.encoded_payload(id)?));
                }
                self.empty("sound", attributes)
            }
            WzValue::Directory(_) | WzValue::Image(_) => Err(Error::UnexpectedKind {
                id,
                expected: NodeKind::SubProperty,
            }),
        }
    }

    fn scalar(&mut self, tag: &str, name: String, value: impl Display) -> Result<()> {
        self.empty(tag, vec![("name", name), ("value", value.to_string())])
    }

    fn encoded_payload(&mut self, id: NodeId) -> Result<String> {
        let encoded = BASE64_STANDARD.encode(self.archive.payload(id)?);
        if encoded.is_empty() {
            return Err(Error::NoEmbeddedData(self.archive.tree().full_path(id)?));
        }
        Ok(encoded)
    }
}

/// Floating point text that always carries a decimal point
fn decimal(value: impl Display) -> String {
    let text = value.to_string();
    if text.chars().all(|c| c.is_ascii_digit() || c == '-') {
        format!("{text}.0")
    } else {
        text
    }
}

fn malformed(error: impl Display) -> Error {
    Error::MalformedXml(error.to_string())
}

/// Parsed element, kept whole so that attributes can be looked up by name
#[derive(Debug, Default)]
struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let tag = std::str::from_utf8(start.name().as_ref())
            .map_err(malformed)?
            .to_string();
        let attributes = start
            .attributes()
            .map(|attribute| -> Result<(String, String)> {
                let attribute = attribute.map_err(malformed)?;
                let key = std::str::from_utf8(attribute.key.as_ref())
                    .map_err(malformed)?
                    .to_string();
                let value = attribute.unescape_value().map_err(malformed)?.into_owned();
                Ok((key, value))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tag,
            attributes,
            children: Vec::new(),
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.attribute(key).ok_or_else(|| {
            Error::MalformedXml(format!("<{}> is missing the {key} attribute", self.tag))
        })
    }

    /// Attribute holding binary content, reported as missing embedded data
    fn embedded(&self, key: &str) -> Result<&str> {
        self.attribute(key).ok_or_else(|| {
            Error::NoEmbeddedData(format!(
                "{} {}",
                self.tag,
                self.attribute("name").unwrap_or_default()
            ))
        })
    }
}

fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        let finished = match reader.read_event().map_err(malformed)? {
            Event::Start(start) => {
                stack.push(Element::from_start(&start)?);
                None
            }
            Event::Empty(start) => Some(Element::from_start(&start)?),
            Event::End(_) => Some(stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?),
            Event::Eof => break,
            _ => None,
        };
        let Some(element) = finished else {
            continue;
        };
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => root = Some(element),
            None => return Err(malformed("document has more than one root element")),
        }
    }

    if !stack.is_empty() {
        return Err(malformed("document ends inside an element"));
    }
    root.ok_or_else(|| malformed("document has no root element"))
}

/// Adds the content of an `imgdir` or `xmldump` document below `parent`, which must be a
/// directory. Returns the nodes created directly below `parent`.
#[instrument(skip(tree, xml), fields(len = xml.len()), err)]
pub fn import(tree: &mut WzTree, parent: NodeId, xml: &str) -> Result<Vec<NodeId>> {
    expect_kind(tree, parent, NodeKind::Directory)?;
    let document = parse_document(xml)?;
    let elements = match document.tag.as_str() {
        "imgdir" => vec![&document],
        "xmldump" => document.children.iter().collect(),
        other => return Err(malformed(format!("unexpected root element <{other}>"))),
    };

    let mut created = Vec::new();
    for element in elements {
        let result = match element.tag.as_str() {
            "imgdir" | "wzimg" => import_image(tree, parent, element),
            "wzdir" => import_directory(tree, parent, element),
            other => Err(malformed(format!("unexpected element <{other}> in a directory"))),
        };
        match result {
            Ok(id) => created.push(id),
            Err(error) => {
                for id in created {
                    tree.remove(id)?;
                }
                return Err(error);
            }
        }
    }
    debug!(count = created.len(), "imported xml");
    Ok(created)
}

/// Reads a document from disk and imports it with [`import`]
pub fn import_path(tree: &mut WzTree, parent: NodeId, path: impl AsRef<Path>) -> Result<Vec<NodeId>> {
    let xml = fs::read_to_string(path)?;
    import(tree, parent, &xml)
}

fn import_directory(tree: &mut WzTree, parent: NodeId, element: &Element) -> Result<NodeId> {
    let directory = tree.add_directory(parent, element.required("name")?)?;
    let result = element.children.iter().try_for_each(|child| {
        match child.tag.as_str() {
            "wzdir" => import_directory(tree, directory, child),
            "wzimg" | "imgdir" => import_image(tree, directory, child),
            other => Err(malformed(format!("unexpected element <{other}> in a directory"))),
        }
        .map(|_| ())
    });
    discard_on_error(tree, directory, result)
}

fn import_image(tree: &mut WzTree, parent: NodeId, element: &Element) -> Result<NodeId> {
    let image = tree.add_image(parent, element.required("name")?)?;
    let result = element
        .children
        .iter()
        .try_for_each(|child| import_property(tree, image, child).map(|_| ()));
    discard_on_error(tree, image, result)
}

fn discard_on_error(tree: &mut WzTree, id: NodeId, result: Result<()>) -> Result<NodeId> {
    match result {
        Ok(()) => Ok(id),
        Err(error) => {
            tree.remove(id)?;
            Err(error)
        }
    }
}

fn import_property(tree: &mut WzTree, parent: NodeId, element: &Element) -> Result<NodeId> {
    let name = element.required("name")?;
    let value = match element.tag.as_str() {
        "imgdir" => WzValue::SubProperty,
        "extended" => WzValue::Convex,
        "null" => WzValue::Null,
        "short" => WzValue::Short(element.required("value")?.parse()?),
        "int" => WzValue::Int(element.required("value")?.parse()?),
        "long" => WzValue::Long(element.required("value")?.parse()?),
        "float" => WzValue::Float(element.required("value")?.parse()?),
        "double" => WzValue::Double(element.required("value")?.parse()?),
        "string" => WzValue::String(element.required("value")?.to_string()),
        "uol" => WzValue::Uol(element.required("value")?.to_string()),
        "vector" => {
            return tree.add_vector(
                parent,
                name,
                element.required("x")?.parse()?,
                element.required("y")?.parse()?,
            )
        }
        "canvas" => WzValue::Canvas(CanvasData {
            width: element.required("width")?.parse()?,
            height: element.required("height")?.parse()?,
            format: match element.attribute("format") {
                Some(format) => format.parse()?,
                None => DEFAULT_CANVAS_FORMAT,
            },
            format2: match element.attribute("format2") {
                Some(format2) => format2.parse()?,
                None => 0,
            },
            payload: Payload::Loaded(BASE64_STANDARD.decode(element.embedded("basedata")?)?),
        }),
        "sound" => WzValue::Sound(SoundData {
            duration_ms: element.embedded("length")?.parse()?,
            header: BASE64_STANDARD.decode(element.embedded("basehead")?)?,
            payload: Payload::Loaded(BASE64_STANDARD.decode(element.embedded("basedata")?)?),
        }),
        other => return Err(malformed(format!("unknown element <{other}>"))),
    };

    let id = tree.add_property(parent, name, value)?;
    for child in &element.children {
        import_property(tree, id, child)?;
    }
    Ok(id)
}
