//! Arena backed node tree holding directories, images and properties
//!
//! Every node lives in a single [`WzTree`] and is addressed by a [`NodeId`]. Ids carry a
//! generation, so an id kept across a [`WzTree::remove`] or an image release stops resolving
//! instead of aliasing a newer node.

use derive_more::derive::Display;
use std::fmt::Debug;

use crate::error::{Error, NodeNotFoundError, Result};
use crate::types::SOUND_HEADER_GUIDS;

/// Handle to a node inside a [`WzTree`]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{index}.{generation}")]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Binary payload of a canvas or sound
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Bytes held in memory
    Loaded(Vec<u8>),
    /// Bytes left in the source archive, read again on demand
    Deferred { offset: u64, len: u32 },
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Loaded(Vec::new())
    }
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Loaded(bytes) => bytes.len(),
            Payload::Deferred { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of the payload when they are held in memory
    pub fn loaded(&self) -> Option<&[u8]> {
        match self {
            Payload::Loaded(bytes) => Some(bytes),
            Payload::Deferred { .. } => None,
        }
    }
}

/// Table metadata of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryData {
    pub size: i32,
    pub checksum: i32,
    pub offset: u32,
}

/// Parse state of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageState {
    /// Only the directory entry is known, properties are still in the source
    #[default]
    Unparsed,
    /// Properties are loaded as child nodes
    Parsed,
}

/// Table metadata and lifecycle of an image
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageData {
    pub size: i32,
    pub checksum: i32,
    pub offset: u32,
    pub(crate) state: ImageState,
    pub(crate) changed: bool,
}

impl ImageData {
    /// Image backed by a region of the source archive
    pub(crate) fn sourced(size: i32, checksum: i32, offset: u32) -> Self {
        Self {
            size,
            checksum,
            offset,
            state: ImageState::Unparsed,
            changed: false,
        }
    }

    /// Image created in memory, with no source to fall back on
    pub(crate) fn detached() -> Self {
        Self {
            state: ImageState::Parsed,
            changed: true,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn is_parsed(&self) -> bool {
        self.state == ImageState::Parsed
    }

    /// Changed images stay loaded until the archive is saved
    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

/// Bitmap property. Pixel data is kept in its stored, compressed form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanvasData {
    pub width: i32,
    pub height: i32,
    pub format: i32,
    pub format2: u8,
    pub payload: Payload,
}

/// Audio property
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SoundData {
    pub duration_ms: i32,
    /// GUID block, wave format length and wave format bytes
    pub header: Vec<u8>,
    pub payload: Payload,
}

impl SoundData {
    /// Builds the stored header for a wave format blob
    pub fn header_for(wave_format: &[u8]) -> Vec<u8> {
        let mut header = SOUND_HEADER_GUIDS.to_vec();
        header.push(wave_format.len() as u8);
        header.extend_from_slice(wave_format);
        header
    }
}

/// Value carried by a node
#[derive(Debug, Clone, PartialEq)]
pub enum WzValue {
    Directory(DirectoryData),
    Image(ImageData),
    Null,
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// Point, with `X` and `Y` int children
    Vector,
    SubProperty,
    /// Ordered list of extended properties
    Convex,
    Canvas(CanvasData),
    Sound(SoundData),
    /// Relative path to another node
    Uol(String),
}

/// Kind of a node, without its payload
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum NodeKind {
    Directory,
    Image,
    Null,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Vector,
    SubProperty,
    Convex,
    Canvas,
    Sound,
    Uol,
}

impl WzValue {
    pub fn kind(&self) -> NodeKind {
        match self {
            WzValue::Directory(_) => NodeKind::Directory,
            WzValue::Image(_) => NodeKind::Image,
            WzValue::Null => NodeKind::Null,
            WzValue::Short(_) => NodeKind::Short,
            WzValue::Int(_) => NodeKind::Int,
            WzValue::Long(_) => NodeKind::Long,
            WzValue::Float(_) => NodeKind::Float,
            WzValue::Double(_) => NodeKind::Double,
            WzValue::String(_) => NodeKind::String,
            WzValue::Vector => NodeKind::Vector,
            WzValue::SubProperty => NodeKind::SubProperty,
            WzValue::Convex => NodeKind::Convex,
            WzValue::Canvas(_) => NodeKind::Canvas,
            WzValue::Sound(_) => NodeKind::Sound,
            WzValue::Uol(_) => NodeKind::Uol,
        }
    }
}

impl NodeKind {
    /// Properties live inside images, everything except directories and images
    pub fn is_property(self) -> bool {
        !matches!(self, NodeKind::Directory | NodeKind::Image)
    }

    /// Properties stored inside a length-prefixed extended block
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            NodeKind::Vector
                | NodeKind::SubProperty
                | NodeKind::Convex
                | NodeKind::Canvas
                | NodeKind::Sound
                | NodeKind::Uol
        )
    }

    /// Kinds that take arbitrary property children
    pub fn holds_properties(self) -> bool {
        matches!(
            self,
            NodeKind::Image | NodeKind::SubProperty | NodeKind::Convex | NodeKind::Canvas
        )
    }
}

/// Single node of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct WzNode {
    name: Box<str>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    value: WzValue,
}

impl WzNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn value(&self) -> &WzValue {
        &self.value
    }

    pub fn kind(&self) -> NodeKind {
        self.value.kind()
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    node: Option<WzNode>,
}

/// Arena holding every node of an archive
#[derive(Debug, Clone, Default)]
pub struct WzTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Detached copy of a subtree, ready to be grafted into any tree
#[derive(Debug, Clone)]
pub struct WzFragment {
    tree: WzTree,
    root: NodeId,
}

impl WzFragment {
    /// Starts a fragment whose root is a single property
    pub fn property(name: &str, value: WzValue) -> Result<Self> {
        let mut tree = WzTree::new();
        if !value.kind().is_property() {
            return Err(Error::InvalidOperation(format!(
                "{} is not a property kind",
                value.kind()
            )));
        }
        let root = tree.insert(None, name, value);
        tree.seed_vector(root);
        Ok(Self { tree, root })
    }

    pub fn tree(&self) -> &WzTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut WzTree {
        &mut self.tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }
}

impl WzTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: NodeId) -> Option<&WzNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut WzNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Node behind `id`, failing when it no longer exists
    pub fn node(&self, id: NodeId) -> Result<&WzNode> {
        self.get(id).ok_or(NodeNotFoundError::Id(id).into())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut WzNode> {
        self.get_mut(id).ok_or(NodeNotFoundError::Id(id).into())
    }

    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(self.node(id)?.name())
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(self.node(id)?.children())
    }

    pub fn value(&self, id: NodeId) -> Result<&WzValue> {
        Ok(self.node(id)?.value())
    }

    pub fn kind(&self, id: NodeId) -> Result<NodeKind> {
        Ok(self.node(id)?.kind())
    }

    /// First direct child named `name`
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.get(id)?
            .children
            .iter()
            .copied()
            .find(|child| self.get(*child).is_some_and(|node| &*node.name == name))
    }

    /// Direct children that are directories
    pub fn directories(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, NodeKind::Directory)
    }

    /// Direct children that are images
    pub fn images(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, NodeKind::Image)
    }

    fn children_of_kind(&self, id: NodeId, kind: NodeKind) -> impl Iterator<Item = NodeId> + '_ {
        self.get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(move |child| self.get(*child).is_some_and(|node| node.kind() == kind))
    }

    pub fn directory_data(&self, id: NodeId) -> Result<&DirectoryData> {
        match self.value(id)? {
            WzValue::Directory(data) => Ok(data),
            _ => Err(Error::UnexpectedKind {
                id,
                expected: NodeKind::Directory,
            }),
        }
    }

    pub fn image_data(&self, id: NodeId) -> Result<&ImageData> {
        match self.value(id)? {
            WzValue::Image(data) => Ok(data),
            _ => Err(Error::UnexpectedKind {
                id,
                expected: NodeKind::Image,
            }),
        }
    }

    pub(crate) fn image_data_mut(&mut self, id: NodeId) -> Result<&mut ImageData> {
        match &mut self.node_mut(id)?.value {
            WzValue::Image(data) => Ok(data),
            _ => Err(Error::UnexpectedKind {
                id,
                expected: NodeKind::Image,
            }),
        }
    }

    /// Swaps the value of a node without validation or change tracking
    pub(crate) fn replace_value(&mut self, id: NodeId, value: WzValue) -> Result<()> {
        self.node_mut(id)?.value = value;
        Ok(())
    }

    /// Allocates a node and links it below `parent` without any validation
    pub(crate) fn insert(&mut self, parent: Option<NodeId>, name: &str, value: WzValue) -> NodeId {
        let node = WzNode {
            name: name.into(),
            parent,
            children: Vec::new(),
            value,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        if let Some(parent) = parent.and_then(|parent| self.get_mut(parent)) {
            parent.children.push(id);
        }
        id
    }

    fn seed_vector(&mut self, id: NodeId) {
        if matches!(self.value(id), Ok(WzValue::Vector)) && self.children(id).is_ok_and(|c| c.is_empty()) {
            self.insert(Some(id), "X", WzValue::Int(0));
            self.insert(Some(id), "Y", WzValue::Int(0));
        }
    }

    /// Creates a parentless directory, the root of an archive
    pub fn add_root_directory(&mut self, name: &str) -> NodeId {
        self.insert(None, name, WzValue::Directory(DirectoryData::default()))
    }

    pub fn add_directory(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.expect_directory(parent)?;
        Ok(self.insert(
            Some(parent),
            name,
            WzValue::Directory(DirectoryData::default()),
        ))
    }

    /// Creates an empty image that only exists in memory
    pub fn add_image(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.expect_directory(parent)?;
        Ok(self.insert(Some(parent), name, WzValue::Image(ImageData::detached())))
    }

    /// Adds a property below an image or container property.
    ///
    /// A `Vector` value receives `X` and `Y` children set to zero. The owning image is marked
    /// as changed.
    pub fn add_property(&mut self, parent: NodeId, name: &str, value: WzValue) -> Result<NodeId> {
        self.check_attach(parent, value.kind())?;
        let id = self.insert(Some(parent), name, value);
        self.seed_vector(id);
        self.touch(parent);
        Ok(id)
    }

    /// Adds a vector property with the given coordinates
    pub fn add_vector(&mut self, parent: NodeId, name: &str, x: i32, y: i32) -> Result<NodeId> {
        let id = self.add_property(parent, name, WzValue::Vector)?;
        let children = self.children(id)?.to_vec();
        self.node_mut(children[0])?.value = WzValue::Int(x);
        self.node_mut(children[1])?.value = WzValue::Int(y);
        Ok(id)
    }

    fn expect_directory(&self, id: NodeId) -> Result<()> {
        match self.kind(id)? {
            NodeKind::Directory => Ok(()),
            _ => Err(Error::UnexpectedKind {
                id,
                expected: NodeKind::Directory,
            }),
        }
    }

    fn check_attach(&self, parent: NodeId, kind: NodeKind) -> Result<()> {
        let parent_kind = self.kind(parent)?;
        let allowed = match parent_kind {
            NodeKind::Directory => matches!(kind, NodeKind::Directory | NodeKind::Image),
            NodeKind::Convex => kind.is_extended(),
            other => other.holds_properties() && kind.is_property(),
        };
        if !allowed {
            return Err(Error::InvalidOperation(format!(
                "a {kind} cannot be placed in a {parent_kind}"
            )));
        }
        if let Some(image) = self.owning_image(parent) {
            if !self.image_data(image)?.is_parsed() {
                return Err(Error::InvalidOperation(
                    "image must be materialized before it is edited".into(),
                ));
            }
        }
        Ok(())
    }

    /// Closest image at or above `id`
    pub fn owning_image(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.get(id)?;
            if node.kind() == NodeKind::Image {
                return Some(id);
            }
            current = node.parent;
        }
        None
    }

    /// Marks the image owning `id` as changed, if it is loaded
    pub(crate) fn touch(&mut self, id: NodeId) {
        if let Some(image) = self.owning_image(id) {
            if let Ok(data) = self.image_data_mut(image) {
                if data.state == ImageState::Parsed {
                    data.changed = true;
                }
            }
        }
    }

    /// Replaces the value of a node with one of the same kind
    pub fn set_value(&mut self, id: NodeId, value: WzValue) -> Result<()> {
        let current = self.kind(id)?;
        if current != value.kind() {
            return Err(Error::InvalidOperation(format!(
                "cannot replace a {current} with a {}",
                value.kind()
            )));
        }
        self.node_mut(id)?.value = value;
        self.touch(id);
        Ok(())
    }

    /// Mutable access to a value, marking the owning image as changed up front.
    ///
    /// The kind of the value must be kept, use [`WzTree::set_value`] to have that checked.
    pub fn value_mut(&mut self, id: NodeId) -> Result<&mut WzValue> {
        self.touch(id);
        Ok(&mut self.node_mut(id)?.value)
    }

    pub fn rename(&mut self, id: NodeId, name: &str) -> Result<()> {
        self.node_mut(id)?.name = name.into();
        if let Some(parent) = self.parent(id)? {
            self.touch(parent);
        }
        Ok(())
    }

    /// Unlinks a node from its parent, keeping the subtree alive
    pub fn detach(&mut self, id: NodeId) -> Result<()> {
        let Some(parent) = self.node(id)?.parent else {
            return Ok(());
        };
        self.touch(parent);
        self.node_mut(parent)?.children.retain(|child| *child != id);
        self.node_mut(id)?.parent = None;
        Ok(())
    }

    /// Links a detached node below `parent`
    pub fn attach(&mut self, parent: NodeId, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if node.parent.is_some() {
            return Err(Error::InvalidOperation(format!("{id} is still attached")));
        }
        self.check_attach(parent, node.kind())?;
        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            if current == id {
                return Err(Error::InvalidOperation(format!(
                    "{id} cannot be attached below itself"
                )));
            }
            ancestor = self.parent(current)?;
        }
        self.node_mut(parent)?.children.push(id);
        self.node_mut(id)?.parent = Some(parent);
        self.touch(parent);
        Ok(())
    }

    /// Removes a node and all of its descendants
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        self.detach(id)?;
        self.free_subtree(id);
        Ok(())
    }

    /// Drops every descendant of `id`
    pub(crate) fn clear_children(&mut self, id: NodeId) -> Result<()> {
        let children = std::mem::take(&mut self.node_mut(id)?.children);
        for child in children {
            self.free_subtree(child);
        }
        Ok(())
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(slot) = self
                .slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation)
            else {
                continue;
            };
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                stack.extend(node.children);
            }
        }
    }

    /// Slash separated names from the root down to `id`
    pub fn full_path(&self, id: NodeId) -> Result<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id)?;
            names.push(node.name());
            current = node.parent;
        }
        names.reverse();
        Ok(names.join("/"))
    }

    /// Follows a relative path from `from`. `..` steps to the parent, empty segments and `.`
    /// are ignored.
    pub fn find(&self, from: NodeId, path: &str) -> Option<NodeId> {
        let mut current = from;
        for segment in path.split('/') {
            current = match segment {
                "" | "." => continue,
                ".." => self.get(current)?.parent?,
                name => self.child(current, name)?,
            };
        }
        Some(current)
    }

    /// Depth first, pre-order walk starting with `id` itself
    pub fn walk(&self, id: NodeId) -> Walk<'_> {
        Walk {
            tree: self,
            stack: if self.contains(id) { vec![id] } else { vec![] },
        }
    }

    /// Copies a subtree into a standalone fragment.
    ///
    /// Deferred payloads and unloaded images in the copy still refer to the source this tree
    /// was read from. Use [`WzArchive::clone_subtree`](crate::WzArchive::clone_subtree) to
    /// copy between archives.
    pub fn clone_subtree(&self, id: NodeId) -> Result<WzFragment> {
        let mut tree = WzTree::new();
        let root = self.copy_into(id, &mut tree, None)?;
        Ok(WzFragment { tree, root })
    }

    /// Copies a fragment into this tree, below `parent` or detached when `None`
    pub fn graft(&mut self, parent: Option<NodeId>, fragment: &WzFragment) -> Result<NodeId> {
        if let Some(parent) = parent {
            self.check_attach(parent, fragment.tree.kind(fragment.root)?)?;
        }
        let id = fragment.tree.copy_into(fragment.root, self, None)?;
        if let Some(parent) = parent {
            self.attach(parent, id)?;
        }
        Ok(id)
    }

    /// Duplicates a subtree inside this tree. The copy is detached.
    pub fn deep_clone(&mut self, id: NodeId) -> Result<NodeId> {
        let fragment = self.clone_subtree(id)?;
        self.graft(None, &fragment)
    }

    fn copy_into(&self, id: NodeId, target: &mut WzTree, parent: Option<NodeId>) -> Result<NodeId> {
        let node = self.node(id)?;
        let mut value = node.value.clone();
        if let WzValue::Image(data) = &mut value {
            if data.state == ImageState::Parsed {
                data.changed = true;
            }
        }
        let copy = target.insert(parent, node.name(), value);
        for child in &node.children {
            self.copy_into(*child, target, Some(copy))?;
        }
        Ok(copy)
    }

    /// Compares names, values and children of two subtrees.
    ///
    /// Directory and image metadata is ignored, payloads are compared by length when either
    /// side is still deferred.
    pub fn structurally_eq(&self, id: NodeId, other: &WzTree, other_id: NodeId) -> bool {
        let (Some(left), Some(right)) = (self.get(id), other.get(other_id)) else {
            return false;
        };
        if left.name != right.name || left.children.len() != right.children.len() {
            return false;
        }
        let values_match = match (&left.value, &right.value) {
            (WzValue::Directory(_), WzValue::Directory(_)) => true,
            (WzValue::Image(_), WzValue::Image(_)) => true,
            (WzValue::Canvas(a), WzValue::Canvas(b)) => {
                a.width == b.width
                    && a.height == b.height
                    && a.format == b.format
                    && a.format2 == b.format2
                    && payload_eq(&a.payload, &b.payload)
            }
            (WzValue::Sound(a), WzValue::Sound(b)) => {
                a.duration_ms == b.duration_ms
                    && a.header == b.header
                    && payload_eq(&a.payload, &b.payload)
            }
            (a, b) => a == b,
        };
        values_match
            && left
                .children
                .iter()
                .zip(&right.children)
                .all(|(a, b)| self.structurally_eq(*a, other, *b))
    }

    pub fn short(&self, id: NodeId) -> Option<i16> {
        match self.get(id)?.value {
            WzValue::Short(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric value of a node, converted to an int
    pub fn int(&self, id: NodeId) -> Option<i32> {
        match self.get(id)?.value {
            WzValue::Short(v) => Some(v as i32),
            WzValue::Int(v) => Some(v),
            WzValue::Long(v) => Some(v as i32),
            WzValue::Float(v) => Some(v as i32),
            WzValue::Double(v) => Some(v as i32),
            _ => None,
        }
    }

    pub fn long(&self, id: NodeId) -> Option<i64> {
        match self.get(id)?.value {
            WzValue::Short(v) => Some(v as i64),
            WzValue::Int(v) => Some(v as i64),
            WzValue::Long(v) => Some(v),
            WzValue::Float(v) => Some(v as i64),
            WzValue::Double(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn float(&self, id: NodeId) -> Option<f32> {
        match self.get(id)?.value {
            WzValue::Short(v) => Some(v as f32),
            WzValue::Int(v) => Some(v as f32),
            WzValue::Long(v) => Some(v as f32),
            WzValue::Float(v) => Some(v),
            WzValue::Double(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn double(&self, id: NodeId) -> Option<f64> {
        match self.get(id)?.value {
            WzValue::Short(v) => Some(v as f64),
            WzValue::Int(v) => Some(v as f64),
            WzValue::Long(v) => Some(v as f64),
            WzValue::Float(v) => Some(v as f64),
            WzValue::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Text of a string or UOL node
    pub fn string(&self, id: NodeId) -> Option<&str> {
        match &self.get(id)?.value {
            WzValue::String(s) | WzValue::Uol(s) => Some(s),
            _ => None,
        }
    }

    /// Coordinates of a vector node
    pub fn vector(&self, id: NodeId) -> Option<(i32, i32)> {
        if !matches!(self.get(id)?.value, WzValue::Vector) {
            return None;
        }
        Some((self.int(self.child(id, "X")?)?, self.int(self.child(id, "Y")?)?))
    }
}

fn payload_eq(a: &Payload, b: &Payload) -> bool {
    match (a.loaded(), b.loaded()) {
        (Some(a), Some(b)) => a == b,
        _ => a.len() == b.len(),
    }
}

/// Iterator returned by [`WzTree::walk`]
pub struct Walk<'a> {
    tree: &'a WzTree,
    stack: Vec<NodeId>,
}

impl Iterator for Walk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        if let Some(node) = self.tree.get(id) {
            self.stack.extend(node.children.iter().rev());
        }
        Some(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    fn sample() -> Result<(WzTree, NodeId, NodeId)> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Character.wz");
        let image = tree.add_image(root, "00002000.img")?;
        let info = tree.add_property(image, "info", WzValue::SubProperty)?;
        tree.add_property(info, "islot", WzValue::String("Bd".into()))?;
        tree.add_vector(info, "origin", 12, -30)?;
        tree.add_property(image, "link", WzValue::Uol("info/origin".into()))?;
        Ok((tree, root, image))
    }

    #[traced_test]
    #[test]
    fn navigation() -> Result<()> {
        let (tree, root, image) = sample()?;
        let origin = tree.find(image, "info/origin").ok_or(Error::InvalidArchive)?;
        assert_eq!(tree.vector(origin), Some((12, -30)));
        assert_eq!(tree.full_path(origin)?, "Character.wz/00002000.img/info/origin");
        assert_eq!(tree.find(origin, "../islot").and_then(|id| tree.string(id)), Some("Bd"));
        assert_eq!(tree.find(origin, "../../.."), Some(root));
        assert_eq!(tree.find(root, "../x"), None);
        assert_eq!(tree.images(root).collect::<Vec<_>>(), vec![image]);
        assert_eq!(tree.directories(root).count(), 0);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn walk_is_pre_order() -> Result<()> {
        let (tree, _, image) = sample()?;
        let names = tree
            .walk(image)
            .map(|id| tree.name(id).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            names,
            vec!["00002000.img", "info", "islot", "origin", "X", "Y", "link"]
        );
        Ok(())
    }

    #[traced_test]
    #[test]
    fn removed_ids_stop_resolving() -> Result<()> {
        let (mut tree, _, image) = sample()?;
        let before = tree.len();
        let info = tree.child(image, "info").ok_or(Error::InvalidArchive)?;
        let islot = tree.child(info, "islot").ok_or(Error::InvalidArchive)?;
        tree.remove(info)?;
        assert_eq!(tree.len(), before - 5);
        assert!(!tree.contains(islot));
        assert!(matches!(tree.node(info), Err(Error::NodeNotFound(_))));

        let reused = tree.add_property(image, "fresh", WzValue::Null)?;
        assert_ne!(reused, info);
        assert!(!tree.contains(info));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn deep_clone_is_independent() -> Result<()> {
        let (mut tree, _, image) = sample()?;
        let info = tree.child(image, "info").ok_or(Error::InvalidArchive)?;
        let copy = tree.deep_clone(info)?;
        assert_eq!(tree.parent(copy)?, None);
        assert!(tree.structurally_eq(info, &tree, copy));

        let islot = tree.child(copy, "islot").ok_or(Error::InvalidArchive)?;
        tree.set_value(islot, WzValue::String("Ma".into()))?;
        assert!(!tree.structurally_eq(info, &tree, copy));

        tree.rename(copy, "info2")?;
        tree.attach(image, copy)?;
        assert_eq!(tree.children(image)?.len(), 3);
        assert_eq!(
            tree.find(image, "info2/islot").and_then(|id| tree.string(id)),
            Some("Ma")
        );
        Ok(())
    }

    #[traced_test]
    #[test]
    fn placement_rules() -> Result<()> {
        let (mut tree, root, image) = sample()?;
        assert!(matches!(
            tree.add_property(root, "x", WzValue::Int(1)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.add_directory(image, "sub"),
            Err(Error::UnexpectedKind { .. })
        ));
        let convex = tree.add_property(image, "shape", WzValue::Convex)?;
        assert!(matches!(
            tree.add_property(convex, "0", WzValue::Int(1)),
            Err(Error::InvalidOperation(_))
        ));
        tree.add_vector(convex, "0", 1, 2)?;

        let link = tree.child(image, "link").ok_or(Error::InvalidArchive)?;
        assert!(matches!(
            tree.add_property(link, "x", WzValue::Null),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.set_value(link, WzValue::Int(3)),
            Err(Error::InvalidOperation(_))
        ));

        let info = tree.child(image, "info").ok_or(Error::InvalidArchive)?;
        tree.detach(info)?;
        let islot = tree.child(info, "islot").ok_or(Error::InvalidArchive)?;
        assert!(matches!(
            tree.attach(islot, info),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn edits_mark_loaded_images_changed() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let sourced = tree.insert(
            Some(root),
            "a.img",
            WzValue::Image(ImageData::sourced(10, 0, 100)),
        );
        assert!(matches!(
            tree.add_property(sourced, "x", WzValue::Null),
            Err(Error::InvalidOperation(_))
        ));

        tree.image_data_mut(sourced)?.state = ImageState::Parsed;
        assert!(!tree.image_data(sourced)?.is_changed());
        tree.add_property(sourced, "x", WzValue::Null)?;
        assert!(tree.image_data(sourced)?.is_changed());
        Ok(())
    }

    #[traced_test]
    #[test]
    fn typed_getters() -> Result<()> {
        let fragment = WzFragment::property("speed", WzValue::Short(-4))?;
        let tree = fragment.tree();
        let root = fragment.root();
        assert_eq!(tree.short(root), Some(-4));
        assert_eq!(tree.int(root), Some(-4));
        assert_eq!(tree.double(root), Some(-4.0));
        assert_eq!(tree.string(root), None);
        assert!(WzFragment::property("x", WzValue::Image(ImageData::detached())).is_err());
        Ok(())
    }
}
