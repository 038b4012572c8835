//! JSON rendering of any subtree
//!
//! Meant for inspecting archives. The layout follows the node tree and may change between
//! releases, payload bytes are summarized by their length.

use serde::{
    ser::{Error as _, SerializeMap},
    Serialize,
};
use std::io::Write;

use crate::error::Result;
use crate::tree::{NodeId, WzTree, WzValue};

/// Serializable view of a node and its descendants
#[derive(Debug, Clone, Copy)]
pub struct JsonNode<'a> {
    tree: &'a WzTree,
    id: NodeId,
}

impl<'a> JsonNode<'a> {
    pub fn new(tree: &'a WzTree, id: NodeId) -> Self {
        Self { tree, id }
    }
}

impl Serialize for JsonNode<'_> {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let node = self.tree.node(self.id).map_err(S::Error::custom)?;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", node.name())?;
        map.serialize_entry("type", &node.kind())?;

        match node.value() {
            WzValue::Directory(data) => {
                map.serialize_entry("size", &data.size)?;
                map.serialize_entry("checksum", &data.checksum)?;
                map.serialize_entry("offset", &data.offset)?;
            }
            WzValue::Image(data) => {
                map.serialize_entry("size", &data.size)?;
                map.serialize_entry("checksum", &data.checksum)?;
                map.serialize_entry("offset", &data.offset)?;
                map.serialize_entry("parsed", &data.is_parsed())?;
                map.serialize_entry("changed", &data.is_changed())?;
            }
            WzValue::Null | WzValue::SubProperty | WzValue::Convex => {}
            WzValue::Short(value) => map.serialize_entry("value", value)?,
            WzValue::Int(value) => map.serialize_entry("value", value)?,
            WzValue::Long(value) => map.serialize_entry("value", value)?,
            WzValue::Float(value) => map.serialize_entry("value", value)?,
            WzValue::Double(value) => map.serialize_entry("value", value)?,
            WzValue::String(value) | WzValue::Uol(value) => map.serialize_entry("value", value)?,
            WzValue::Vector => {
                let (x, y) = self.tree.vector(self.id).ok_or_else(|| {
                    S::Error::custom(format!("vector {} lacks X or Y", self.id))
                })?;
                map.serialize_entry("x", &x)?;
                map.serialize_entry("y", &y)?;
            }
            WzValue::Canvas(canvas) => {
                map.serialize_entry("width", &canvas.width)?;
                map.serialize_entry("height", &canvas.height)?;
                map.serialize_entry("format", &canvas.format)?;
                map.serialize_entry("format2", &canvas.format2)?;
                map.serialize_entry("payload", &canvas.payload.len())?;
            }
            WzValue::Sound(sound) => {
                map.serialize_entry("duration", &sound.duration_ms)?;
                map.serialize_entry("header", &sound.header.len())?;
                map.serialize_entry("payload", &sound.payload.len())?;
            }
        }

        // vector coordinates are already inlined
        let children = node.children();
        if !children.is_empty() && !matches!(node.value(), WzValue::Vector) {
            let children = children
                .iter()
                .map(|child| JsonNode::new(self.tree, *child))
                .collect::<Vec<_>>();
            map.serialize_entry("children", &children)?;
        }
        map.end()
    }
}

/// Writes the subtree below `id` as JSON
pub fn to_writer<W: Write>(tree: &WzTree, id: NodeId, out: W, pretty: bool) -> Result<()> {
    let node = JsonNode::new(tree, id);
    if pretty {
        serde_json::to_writer_pretty(out, &node)?;
    } else {
        serde_json::to_writer(out, &node)?;
    }
    Ok(())
}

/// Renders the subtree below `id` as a JSON value
pub fn to_value(tree: &WzTree, id: NodeId) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(JsonNode::new(tree, id))?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::{CanvasData, Payload};
    use pretty_assertions::{assert_eq, assert_str_eq};
    use serde_json::json;

    #[test]
    fn property_graph() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Mob.wz");
        let image = tree.add_image(root, "a.img")?;
        tree.add_property(image, "hp", WzValue::Int(100))?;
        tree.add_vector(image, "pos", 3, -4)?;
        tree.add_property(
            image,
            "icon",
            WzValue::Canvas(CanvasData {
                width: 1,
                height: 2,
                format: 2,
                format2: 0,
                payload: Payload::Loaded(vec![0; 5]),
            }),
        )?;

        assert_eq!(
            to_value(&tree, image)?,
            json!({
                "name": "a.img",
                "type": "image",
                "size": 0,
                "checksum": 0,
                "offset": 0,
                "parsed": true,
                "changed": true,
                "children": [
                    { "name": "hp", "type": "int", "value": 100 },
                    { "name": "pos", "type": "vector", "x": 3, "y": -4 },
                    {
                        "name": "icon",
                        "type": "canvas",
                        "width": 1,
                        "height": 2,
                        "format": 2,
                        "format2": 0,
                        "payload": 5
                    }
                ]
            })
        );
        Ok(())
    }

    #[test]
    fn compact_writer() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Mob.wz");
        tree.add_directory(root, "sub")?;

        let mut out = Vec::new();
        to_writer(&tree, root, &mut out, false)?;
        assert_str_eq!(
            String::from_utf8_lossy(&out),
            r#"{"name":"Mob.wz","type":"directory","size":0,"checksum":0,"offset":0,"children":[{"name":"sub","type":"directory","size":0,"checksum":0,"offset":0}]}"#
        );
        Ok(())
    }

    #[test]
    fn stale_ids_fail() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Mob.wz");
        let sub = tree.add_directory(root, "sub")?;
        tree.remove(sub)?;
        assert!(to_value(&tree, sub).is_err());
        Ok(())
    }

    #[test]
    fn incomplete_vectors_fail() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Mob.wz");
        let image = tree.add_image(root, "a.img")?;
        let pos = tree.add_vector(image, "pos", 3, -4)?;
        let x = tree.child(pos, "X").ok_or(crate::error::Error::InvalidArchive)?;
        tree.rename(x, "Z")?;
        assert!(matches!(
            to_value(&tree, image),
            Err(crate::error::Error::JsonError(_))
        ));
        Ok(())
    }
}
