//! Query graph builder
//!
//! A [`Node`] tree describes which related objects a request touches. Retrieval
//! trees are expanded eagerly down to the requested depth; query trees (used by
//! the RQL translator) are expanded one hop at a time through [`Node::child`].
//! Generic nodes have no target meta until a concrete record is known, see
//! [`Node::instantiate_generic`].

use crate::error::{QueryError, Result};
use crate::meta::{FieldDescription, FieldMode, FieldType, LinkType, Meta, MetaStore};
use crate::retrieve_policy::RetrievePolicy;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Generic,
}

/// Field selection of a node
#[derive(Debug, Clone, PartialEq)]
pub enum SelectFields {
    Full,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl SelectFields {
    pub fn include(&mut self, name: &str) -> std::result::Result<(), QueryError> {
        match self {
            SelectFields::Full => {
                *self = SelectFields::Include(vec![name.to_string()]);
                Ok(())
            }
            SelectFields::Include(names) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                Ok(())
            }
            SelectFields::Exclude(_) => Err(QueryError::select_mode_conflict(format!(
                "Field '{}' cannot be included, the selection is exclusive",
                name
            ))),
        }
    }

    pub fn exclude(&mut self, name: &str) -> std::result::Result<(), QueryError> {
        match self {
            SelectFields::Full => {
                *self = SelectFields::Exclude(vec![name.to_string()]);
                Ok(())
            }
            SelectFields::Exclude(names) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                Ok(())
            }
            SelectFields::Include(_) => Err(QueryError::select_mode_conflict(format!(
                "Field '{}' cannot be excluded, the selection is inclusive",
                name
            ))),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            SelectFields::Full => true,
            SelectFields::Include(names) => names.iter().any(|n| n == name),
            SelectFields::Exclude(names) => !names.iter().any(|n| n == name),
        }
    }
}

/// Parameters shared by every node of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    pub depth_limit: usize,
    pub mode: FieldMode,
    /// Skip outer and many-to-many fields entirely
    pub omit_outers: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Field that produced this node, `None` at the root
    pub link_field: Option<FieldDescription>,
    /// Field on the target side matched against the parent value
    pub key_field: Option<FieldDescription>,
    /// Target meta, `None` for generic inner nodes
    pub meta: Option<Arc<Meta>>,
    pub parent_meta: Option<Arc<Meta>>,
    pub children: Vec<Node>,
    pub depth: usize,
    pub only_link: bool,
    pub plural: bool,
    pub kind: NodeKind,
    pub select: SelectFields,
    pub policy: RetrievePolicy,
    pub options: TreeOptions,
    visited: Vec<String>,
}

impl Node {
    /// Retrieval tree expanded down to `depth`
    pub fn root(
        meta: Arc<Meta>,
        depth: usize,
        policy: RetrievePolicy,
        omit_outers: bool,
        metas: &dyn MetaStore,
    ) -> Result<Node> {
        let options = TreeOptions {
            depth_limit: depth.max(1),
            mode: FieldMode::Retrieve,
            omit_outers,
        };
        let mut node = Node::bare(meta, options, policy);
        node.fill_children(metas)?;
        Ok(node)
    }

    /// Query tree root; children are built on demand
    pub fn query_root(meta: Arc<Meta>) -> Node {
        let options = TreeOptions {
            depth_limit: usize::MAX,
            mode: FieldMode::Query,
            omit_outers: false,
        };
        Node::bare(meta, options, RetrievePolicy::empty())
    }

    fn bare(meta: Arc<Meta>, options: TreeOptions, policy: RetrievePolicy) -> Node {
        Node {
            link_field: None,
            key_field: Some(meta.key_field().clone()),
            visited: vec![meta.name.clone()],
            meta: Some(meta),
            parent_meta: None,
            children: Vec::new(),
            depth: 1,
            only_link: false,
            plural: false,
            kind: NodeKind::Regular,
            select: SelectFields::Full,
            policy,
            options,
        }
    }

    pub fn find_child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|c| c.link_field.as_ref().map(|f| f.name.as_str()) == Some(name))
    }

    /// Name of the producing field, empty at the root
    pub fn name(&self) -> &str {
        self.link_field.as_ref().map(|f| f.name.as_str()).unwrap_or_default()
    }

    /// Expand every relational field of this node, recursively
    pub fn fill_children(&mut self, metas: &dyn MetaStore) -> Result<()> {
        if self.only_link || self.kind == NodeKind::Generic && self.meta.is_none() {
            return Ok(());
        }
        let Some(meta) = self.meta.clone() else {
            return Ok(());
        };
        for name in self.policy.names() {
            if meta.find_field(name).is_none() {
                return Err(QueryError::field_not_found(format!(
                    "Field '{}' not found in '{}'",
                    name, meta.name
                ))
                .into());
            }
        }

        let mut children = Vec::new();
        for field in &meta.fields {
            if self.policy.excludes(&field.name) {
                self.select.exclude(&field.name)?;
                continue;
            }
            if let Some(mut child) = self.child_for(field, metas)? {
                child.fill_children(metas)?;
                children.push(child);
            }
        }
        self.children = children;
        Ok(())
    }

    /// Build the node for one field without expanding it further
    pub fn child(&self, name: &str, metas: &dyn MetaStore) -> Result<Option<Node>> {
        let Some(meta) = &self.meta else {
            return Ok(None);
        };
        match meta.find_field(name) {
            Some(field) => self.child_for(field, metas),
            None => Ok(None),
        }
    }

    fn child_for(&self, field: &FieldDescription, metas: &dyn MetaStore) -> Result<Option<Node>> {
        if field.field_type.is_scalar() || field.link_type == LinkType::None {
            return Ok(None);
        }
        let relation_is_outer = field.is_outer() || field.field_type == FieldType::Objects;
        let forced = self.policy.forces(&field.name);
        if self.options.mode == FieldMode::Retrieve && relation_is_outer {
            if self.options.omit_outers || (!field.retrieve_mode && !forced) {
                return Ok(None);
            }
        }

        let (target, key_field, plural, kind) = match (field.field_type, field.link_type) {
            (FieldType::Object, LinkType::Inner) => {
                if self.options.mode == FieldMode::Retrieve {
                    if let Some(parent) = &self.parent_meta {
                        if parent.is_back_link(field) {
                            return Ok(None);
                        }
                    }
                }
                let target = require_link_meta(field, metas)?;
                let key = target.key_field().clone();
                (Some(target), Some(key), false, NodeKind::Regular)
            }
            (FieldType::Array, LinkType::Outer) => {
                let target = require_link_meta(field, metas)?;
                let key = outer_key_field(field, &target)?;
                (Some(target), Some(key), true, NodeKind::Regular)
            }
            (FieldType::Objects, _) => {
                let target = require_link_meta(field, metas)?;
                let through_name = field.link_through.as_deref().unwrap_or_default();
                let through = metas.require_meta(through_name)?;
                let key = through.find_field(&target.name).cloned().ok_or_else(|| {
                    QueryError::field_not_found(format!("Field '{}' not found in '{}'", target.name, through.name))
                })?;
                (Some(target), Some(key), true, NodeKind::Regular)
            }
            (FieldType::Generic, LinkType::Inner) => (None, None, false, NodeKind::Generic),
            (FieldType::Generic, LinkType::Outer) => {
                let target = require_link_meta(field, metas)?;
                let key = outer_key_field(field, &target)?;
                (Some(target), Some(key), true, NodeKind::Generic)
            }
            _ => return Ok(None),
        };

        let revisit = target
            .as_ref()
            .map(|t| self.visited.iter().any(|v| *v == t.name))
            .unwrap_or(false);
        let only_link = match self.options.mode {
            FieldMode::Query => false,
            FieldMode::Retrieve => !forced && (self.depth >= self.options.depth_limit || revisit),
        };

        let mut visited = self.visited.clone();
        if let Some(t) = &target {
            visited.push(t.name.clone());
        }
        let mut select = SelectFields::Full;
        if only_link {
            if let Some(t) = &target {
                select.include(&t.key)?;
            }
        }

        Ok(Some(Node {
            link_field: Some(field.clone()),
            key_field,
            meta: target,
            parent_meta: self.meta.clone(),
            children: Vec::new(),
            depth: self.depth + 1,
            only_link,
            plural,
            kind,
            select,
            policy: self.policy.scoped(&field.name),
            options: self.options,
            visited,
        }))
    }

    /// Concrete node for one target object of a generic inner node
    pub fn instantiate_generic(&self, object: &str, metas: &dyn MetaStore) -> Result<Node> {
        let meta = metas.require_meta(object)?;
        let allowed = self
            .link_field
            .as_ref()
            .map(|f| f.link_meta_list.iter().any(|m| m == object))
            .unwrap_or(false);
        if !allowed {
            return Err(QueryError::field_not_found(format!(
                "Object '{}' is not a target of generic field '{}'",
                object,
                self.name()
            ))
            .into());
        }
        let forced = self.policy.forces(object);
        let revisit = self.visited.iter().any(|v| *v == meta.name);
        let only_link = !forced && (self.only_link || revisit);
        let mut visited = self.visited.clone();
        visited.push(meta.name.clone());
        let mut select = SelectFields::Full;
        if only_link {
            select.include(&meta.key)?;
        }
        let mut node = Node {
            link_field: self.link_field.clone(),
            key_field: Some(meta.key_field().clone()),
            meta: Some(meta),
            parent_meta: self.parent_meta.clone(),
            children: Vec::new(),
            depth: self.depth,
            only_link,
            plural: false,
            kind: NodeKind::Regular,
            select,
            policy: self.policy.scoped(object),
            options: self.options,
            visited,
        };
        if node.options.mode == FieldMode::Retrieve {
            node.fill_children(metas)?;
        }
        Ok(node)
    }

    /// Table columns fetched for this node
    pub fn columns(&self) -> Vec<String> {
        let Some(meta) = &self.meta else {
            return Vec::new();
        };
        meta.table_fields()
            .into_iter()
            .filter(|f| f.name == meta.key || self.select.allows(&f.name))
            .map(|f| f.name.clone())
            .collect()
    }
}

fn require_link_meta(field: &FieldDescription, metas: &dyn MetaStore) -> Result<Arc<Meta>> {
    let name = field.link_meta.as_deref().unwrap_or_default();
    metas.require_meta(name)
}

fn outer_key_field(field: &FieldDescription, target: &Meta) -> Result<FieldDescription> {
    let name = field.outer_link_field.as_deref().unwrap_or_default();
    target.find_field(name).cloned().ok_or_else(|| {
        QueryError::field_not_found(format!("Field '{}' not found in '{}'", name, target.name)).into()
    })
}
