//! Path based lookups across an archive
//!
//! Paths are slash separated and start with the archive name, with or without its `.wz`
//! extension. Images met along the way are loaded on demand and stay loaded.

use regex::Regex;
use std::io::{Read, Seek};
use tracing::{debug, instrument};

use crate::archive::WzArchive;
use crate::error::Result;
use crate::tree::{NodeId, NodeKind, WzValue};

impl<R: Read + Seek> WzArchive<R> {
    /// Resolves an absolute path such as `Mob.wz/0100100.img/info/maxHP`
    #[instrument(skip(self), err)]
    pub fn get(&mut self, path: &str) -> Result<Option<NodeId>> {
        let mut segments = path.split('/').filter(|segment| !segment.is_empty());
        let Some(first) = segments.next() else {
            return Ok(None);
        };
        if !self.names_root(first) {
            return Ok(None);
        }

        let mut current = self.root();
        for segment in segments {
            if self.tree().kind(current)? == NodeKind::Image {
                self.materialize(current)?;
            }
            match self.tree().child(current, segment) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn names_root(&self, segment: &str) -> bool {
        let name = self.name();
        segment.eq_ignore_ascii_case(name)
            || name
                .strip_suffix(".wz")
                .is_some_and(|stem| segment.eq_ignore_ascii_case(stem))
    }

    /// Every node below the root together with its full path, loading all images
    pub fn paths(&mut self) -> Result<Vec<(String, NodeId)>> {
        let images = self
            .tree()
            .walk(self.root())
            .filter(|id| self.tree().kind(*id).is_ok_and(|kind| kind == NodeKind::Image))
            .collect::<Vec<_>>();
        for image in images {
            self.materialize(image)?;
        }

        let tree = self.tree();
        tree.walk(self.root())
            .map(|id| tree.full_path(id).map(|path| (path, id)))
            .collect()
    }

    /// Nodes whose full path matches a pattern where `*` stands for any run of characters,
    /// slashes included
    #[instrument(skip(self), err)]
    pub fn query_wildcard(&mut self, pattern: &str) -> Result<Vec<NodeId>> {
        let translated = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        self.query_regex(&format!("^{translated}$"))
    }

    /// Nodes whose full path matches a regular expression
    #[instrument(skip(self), err)]
    pub fn query_regex(&mut self, pattern: &str) -> Result<Vec<NodeId>> {
        let regex = Regex::new(pattern)?;
        let matches = self
            .paths()?
            .into_iter()
            .filter(|(path, _)| regex.is_match(path))
            .map(|(_, id)| id)
            .collect::<Vec<_>>();
        debug!(count = matches.len(), "query matched");
        Ok(matches)
    }

    /// Follows a UOL starting from its parent. Returns `None` when the target is missing or
    /// the node is not a UOL.
    pub fn resolve_uol(&mut self, uol: NodeId) -> Result<Option<NodeId>> {
        let WzValue::Uol(target) = self.tree().value(uol)? else {
            return Ok(None);
        };
        let target = target.clone();
        let Some(mut current) = self.tree().parent(uol)? else {
            return Ok(None);
        };

        for segment in target.split('/') {
            let next = match segment {
                "" | "." => continue,
                ".." => self.tree().parent(current)?,
                name => {
                    if self.tree().kind(current)? == NodeKind::Image {
                        self.materialize(current)?;
                    }
                    self.tree().child(current, name)
                }
            };
            match next {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}
