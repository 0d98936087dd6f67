//! In-memory tree model for persisted state.
//!
//! A [`StateNode`] is the cached, decoded form of one subtree of a named
//! state.  Nodes themselves carry no persistence information; the store
//! derives each node's [`NodeLocation`] from the state name and the path
//! used to reach it, so a detached node can be freely cloned and inspected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Container kinds
// ---------------------------------------------------------------------------

/// The kind recorded by a container's type marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Dict,
    List,
}

impl ContainerKind {
    /// The marker spelling (`"dict"` / `"list"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dict => "dict",
            Self::List => "list",
        }
    }

    /// JSON body of the type marker for this kind.
    pub fn marker_json(&self) -> String {
        serde_json::json!({ "type": self.as_str() }).to_string()
    }

    /// Parse a raw marker body.  Returns `None` for malformed JSON or an
    /// unknown kind.
    pub fn parse_marker(raw: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Marker {
            #[serde(rename = "type")]
            kind: ContainerKind,
        }

        serde_json::from_str::<Marker>(raw).ok().map(|m| m.kind)
    }
}

// ---------------------------------------------------------------------------
// State nodes
// ---------------------------------------------------------------------------

/// One node of a state tree.
#[derive(Debug, Clone, PartialEq)]
pub enum StateNode {
    /// Any JSON value that is neither an object nor an array.
    Scalar(Value),
    /// Mapping of key to child node.  Key order is not significant.
    Dict(BTreeMap<String, StateNode>),
    /// Ordered children addressed by index.
    List(Vec<StateNode>),
}

impl StateNode {
    /// An empty dict node.
    pub fn empty_dict() -> Self {
        Self::Dict(BTreeMap::new())
    }

    /// Container kind, or `None` for scalars.
    pub fn kind(&self) -> Option<ContainerKind> {
        match self {
            Self::Scalar(_) => None,
            Self::Dict(_) => Some(ContainerKind::Dict),
            Self::List(_) => Some(ContainerKind::List),
        }
    }

    /// Number of direct children (always 0 for scalars).
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Dict(children) => children.len(),
            Self::List(items) => items.len(),
        }
    }

    /// `true` for empty containers and for a `null` scalar.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar(value) => value.is_null(),
            Self::Dict(children) => children.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    /// Look up a direct child by dict key or list index.
    pub fn child(&self, segment: &str) -> Option<&StateNode> {
        match self {
            Self::Scalar(_) => None,
            Self::Dict(children) => children.get(segment),
            Self::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        }
    }

    /// Follow a path of segments from this node.
    pub fn descend<S: AsRef<str>>(&self, path: &[S]) -> Option<&StateNode> {
        path.iter()
            .try_fold(self, |node, segment| node.child(segment.as_ref()))
    }

    /// Convert the subtree back into plain JSON.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Scalar(value) => value.clone(),
            Self::Dict(children) => Value::Object(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect::<Map<String, Value>>(),
            ),
            Self::List(items) => Value::Array(items.iter().map(StateNode::to_value).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Characters that are unsafe in file paths.
const UNSAFE_SEGMENT_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Make a key safe to use as a single path component.
///
/// Characters that are unsafe in file paths are replaced by `_`, and the
/// special names `""`, `.` and `..` are replaced so a key can never alias
/// its parent or escape the state root.
pub fn sanitize_segment(segment: &str) -> String {
    match segment {
        "" => "_".to_string(),
        "." => "_".to_string(),
        ".." => "__".to_string(),
        other => other.replace(UNSAFE_SEGMENT_CHARS, "_"),
    }
}

/// Address of a node: the state name plus the raw key path below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeLocation {
    state: String,
    segments: Vec<String>,
}

impl NodeLocation {
    /// Location of a named state's root.
    pub fn root(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            segments: Vec::new(),
        }
    }

    /// Location of a child of this node.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self {
            state: self.state.clone(),
            segments,
        }
    }

    /// Location of a node reached by following `path` from this node.
    #[must_use]
    pub fn join<S: AsRef<str>>(&self, path: &[S]) -> Self {
        path.iter()
            .fold(self.clone(), |loc, segment| loc.child(segment.as_ref()))
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sanitized components, state name first.
    pub fn components(&self) -> Vec<String> {
        std::iter::once(self.state.as_str())
            .chain(self.segments.iter().map(String::as_str))
            .map(sanitize_segment)
            .collect()
    }

    /// Sanitized components joined with `/`.  Unique per node because
    /// sanitizing removes `/` from every component.
    pub fn key(&self) -> String {
        self.components().join("/")
    }

    /// Key of the parent node, or `None` at a state root.
    pub fn parent_key(&self) -> Option<String> {
        let components = self.components();
        let (_, parent) = components.split_last()?;
        if parent.is_empty() {
            None
        } else {
            Some(parent.join("/"))
        }
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
