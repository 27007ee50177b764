//! The context node model.
//!
//! A context is an arbitrary nested, JSON-like value. It is modelled as a
//! tagged variant rather than a raw `serde_json::Value` so that
//! materialized references ([`Node::Ref`]) can live inside the tree without
//! aliasing the caller's data.
//!
//! # References
//!
//! A `Ref(id)` points at the branch in the same tree whose `id` field equals
//! `id`. Serialization follows the reference and writes the target inline,
//! exactly like serializing an object graph. A reference back into a branch
//! that is still being written is a cycle and makes the tree
//! non-serializable. A reference whose id does not resolve is written as the
//! bare id string.

use crate::error::NodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Maximum nesting depth accepted by serialization and salvage walks.
pub const MAX_DEPTH: usize = 256;

// ── Types ─────────────────────────────────────────────────────────────────

/// A scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

/// A node in a context tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Scalar),
    List(Vec<Node>),
    Branch(BTreeMap<String, Node>),
    /// Materialized reference to the branch whose `id` equals this string.
    Ref(String),
}

/// One step of a structural path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Structural location of a node inside a tree, e.g. `session.turns[2].meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<PathSegment>);

// ── Paths ─────────────────────────────────────────────────────────────────

impl NodePath {
    /// The path of the tree root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of a keyed child.
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        Self(segments)
    }

    /// Path of a list element.
    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// The last keyed segment, if the path ends in one.
    pub fn last_key(&self) -> Option<&str> {
        match self.0.last() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{k}")?,
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl Serialize for NodePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Construction ──────────────────────────────────────────────────────────

impl Node {
    pub fn null() -> Self {
        Node::Leaf(Scalar::Null)
    }

    pub fn empty_branch() -> Self {
        Node::Branch(BTreeMap::new())
    }

    /// Insert a child into a branch. Returns `false` (and drops the value)
    /// when `self` is not a branch.
    pub fn insert(&mut self, key: impl Into<String>, value: Node) -> bool {
        match self {
            Node::Branch(map) => {
                map.insert(key.into(), value);
                true
            }
            _ => false,
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::Leaf(Scalar::Null),
            Value::Bool(b) => Node::Leaf(Scalar::Bool(b)),
            Value::Number(n) => Node::Leaf(Scalar::Number(n)),
            Value::String(s) => Node::Leaf(Scalar::String(s)),
            Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            Value::Object(map) => {
                Node::Branch(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::Leaf(Scalar::String(s.to_string()))
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::Leaf(Scalar::String(s))
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::Leaf(Scalar::Bool(b))
    }
}

impl From<i64> for Node {
    fn from(n: i64) -> Self {
        Node::Leaf(Scalar::Number(n.into()))
    }
}

impl From<u64> for Node {
    fn from(n: u64) -> Self {
        Node::Leaf(Scalar::Number(n.into()))
    }
}

impl From<f64> for Node {
    /// Non-finite floats have no JSON form and become null.
    fn from(n: f64) -> Self {
        Number::from_f64(n)
            .map(|n| Node::Leaf(Scalar::Number(n)))
            .unwrap_or(Node::Leaf(Scalar::Null))
    }
}

impl From<BTreeMap<String, Node>> for Node {
    fn from(map: BTreeMap<String, Node>) -> Self {
        Node::Branch(map)
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────

impl Node {
    pub fn is_null(&self) -> bool {
        matches!(self, Node::Leaf(Scalar::Null))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Node::Branch(_))
    }

    pub fn as_branch(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Branch(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match self {
            Node::Branch(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Leaf(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Leaf(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Node::Leaf(Scalar::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    /// Child of a branch by key.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_branch().and_then(|map| map.get(key))
    }

    /// Descendant at a structural path.
    pub fn get_path(&self, path: &NodePath) -> Option<&Node> {
        let mut current = self;
        for segment in path.segments() {
            current = match (segment, current) {
                (PathSegment::Key(k), Node::Branch(map)) => map.get(k)?,
                (PathSegment::Index(i), Node::List(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// `true` only when the field exists and is boolean `true`.
    pub fn flag(&self, field: &str) -> bool {
        self.get(field).and_then(Node::as_bool).unwrap_or(false)
    }

    /// Numeric field value.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Node::as_f64)
    }

    /// The identifier a branch carries in its `id` field (string or number).
    pub fn id(&self) -> Option<String> {
        match self.get("id")? {
            Node::Leaf(Scalar::String(s)) => Some(s.clone()),
            Node::Leaf(Scalar::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// String entries of the `tags` list.
    pub fn tags(&self) -> Vec<&str> {
        self.get("tags")
            .and_then(Node::as_list)
            .map(|items| items.iter().filter_map(Node::as_str).collect())
            .unwrap_or_default()
    }

    /// Identifiers listed in `dependencies`, including already materialized
    /// references.
    pub fn dependencies(&self) -> Vec<String> {
        self.get("dependencies")
            .and_then(Node::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Node::Leaf(Scalar::String(s)) => Some(s.clone()),
                        Node::Leaf(Scalar::Number(n)) => Some(n.to_string()),
                        Node::Ref(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// An instant stored as RFC 3339 text or epoch milliseconds.
    pub fn instant(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.get(field)? {
            Node::Leaf(Scalar::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            Node::Leaf(Scalar::Number(n)) => {
                let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
                DateTime::from_timestamp_millis(millis)
            }
            _ => None,
        }
    }

    /// Every key of every nested branch, including branches inside lists.
    pub fn count_keys(&self) -> usize {
        match self {
            Node::Branch(map) => map.len() + map.values().map(Node::count_keys).sum::<usize>(),
            Node::List(items) => items.iter().map(Node::count_keys).sum(),
            Node::Leaf(_) | Node::Ref(_) => 0,
        }
    }

    /// Visit every branch (root included) in pre-order.
    pub fn visit_branches<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(&NodePath, &'a Node),
    {
        self.visit_branches_at(&NodePath::root(), visit);
    }

    fn visit_branches_at<'a, F>(&'a self, path: &NodePath, visit: &mut F)
    where
        F: FnMut(&NodePath, &'a Node),
    {
        match self {
            Node::Branch(map) => {
                visit(path, self);
                for (key, child) in map {
                    child.visit_branches_at(&path.child(key), visit);
                }
            }
            Node::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    child.visit_branches_at(&path.index(i), visit);
                }
            }
            Node::Leaf(_) | Node::Ref(_) => {}
        }
    }

    /// Map of identifier → path. The first branch carrying an id (pre-order) wins.
    pub fn id_table(&self) -> HashMap<String, NodePath> {
        let mut table = HashMap::new();
        self.visit_branches(&mut |path, node| {
            if let Some(id) = node.id() {
                table.entry(id).or_insert_with(|| path.clone());
            }
        });
        table
    }
}

// ── Serialization ─────────────────────────────────────────────────────────

impl Scalar {
    fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Number(n) => Value::Number(n.clone()),
            Scalar::String(s) => Value::String(s.clone()),
        }
    }
}

struct Expander<'a> {
    root: &'a Node,
    ids: HashMap<String, NodePath>,
    active: Vec<String>,
}

impl<'a> Expander<'a> {
    fn expand(&mut self, node: &'a Node, depth: usize) -> Result<Value, NodeError> {
        if depth > MAX_DEPTH {
            return Err(NodeError::DepthExceeded { limit: MAX_DEPTH });
        }
        match node {
            Node::Leaf(scalar) => Ok(scalar.to_json()),
            Node::List(items) => items
                .iter()
                .map(|item| self.expand(item, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Node::Branch(map) => {
                let own_id = node.id();
                if let Some(id) = &own_id {
                    self.active.push(id.clone());
                }
                let mut out = Map::new();
                for (key, child) in map {
                    out.insert(key.clone(), self.expand(child, depth + 1)?);
                }
                if own_id.is_some() {
                    self.active.pop();
                }
                Ok(Value::Object(out))
            }
            Node::Ref(id) => {
                if self.active.iter().any(|active| active == id) {
                    return Err(NodeError::CircularReference { id: id.clone() });
                }
                let root = self.root;
                match self.ids.get(id).and_then(|path| root.get_path(path)) {
                    Some(target) => self.expand(target, depth + 1),
                    None => Ok(Value::String(id.clone())),
                }
            }
        }
    }
}

impl Node {
    /// Convert to a plain JSON value, expanding references inline.
    pub fn to_json(&self) -> Result<Value, NodeError> {
        let mut expander = Expander {
            root: self,
            ids: self.id_table(),
            active: Vec::new(),
        };
        expander.expand(self, 0)
    }

    /// Compact JSON text of the tree.
    pub fn to_json_string(&self) -> Result<String, NodeError> {
        let value = self.to_json()?;
        serde_json::to_string(&value).map_err(|e| NodeError::Encoding(e.to_string()))
    }

    /// Serialized byte length.
    pub fn serialized_len(&self) -> Result<usize, NodeError> {
        self.to_json_string().map(|s| s.len())
    }

    /// Lowercase hex SHA-256 of the serialized tree.
    pub fn checksum(&self) -> Result<String, NodeError> {
        let text = self.to_json_string()?;
        Ok(digest_hex(text.as_bytes()))
    }
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Node::from)
    }
}
