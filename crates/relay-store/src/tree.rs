//! Loading, materializing and merging state trees against a backend.
//!
//! These functions keep a cached [`StateNode`] and its persisted records in
//! step.  Every mutation writes through to the backend before the cached
//! node changes, so a crash never leaves the cache ahead of storage.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::backend::StateBackend;
use crate::error::{StoreError, StoreResult};
use crate::node::{ContainerKind, NodeLocation, StateNode};

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Rebuild the node stored at `location`.
///
/// Degraded reads never fail: a malformed scalar becomes `null`, and a
/// missing or malformed marker becomes an empty dict.  A list whose stored
/// indices have gaps is compacted and re-persisted in its compacted form.
pub(crate) fn load(backend: &dyn StateBackend, location: &NodeLocation) -> StoreResult<StateNode> {
    let record = backend.read(location)?;

    if let Some(raw) = record.scalar {
        let value = serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(node = %location, error = %e, "malformed scalar, reading as null");
            Value::Null
        });
        return Ok(StateNode::Scalar(value));
    }

    let Some(raw_marker) = record.marker else {
        return Ok(StateNode::empty_dict());
    };

    match ContainerKind::parse_marker(&raw_marker) {
        Some(ContainerKind::Dict) => {
            let mut children = BTreeMap::new();
            for name in backend.children(location)? {
                let child = load(backend, &location.child(name.as_str()))?;
                children.insert(name, child);
            }
            Ok(StateNode::Dict(children))
        }
        Some(ContainerKind::List) => load_list(backend, location),
        None => {
            warn!(node = %location, "malformed container marker, reading as empty dict");
            Ok(StateNode::empty_dict())
        }
    }
}

fn load_list(backend: &dyn StateBackend, location: &NodeLocation) -> StoreResult<StateNode> {
    let mut indices: Vec<(usize, String)> = backend
        .children(location)?
        .into_iter()
        .filter_map(|name| name.parse::<usize>().ok().map(|i| (i, name)))
        .collect();
    indices.sort_by_key(|(i, _)| *i);

    let mut items = Vec::with_capacity(indices.len());
    for (_, name) in &indices {
        items.push(load(backend, &location.child(name.as_str()))?);
    }

    let contiguous = indices
        .iter()
        .enumerate()
        .all(|(position, (index, name))| position == *index && *name == index.to_string());
    let node = StateNode::List(items);
    if !contiguous {
        warn!(node = %location, len = node.len(), "compacting list with index gaps");
        backend.remove(location)?;
        rewrite(backend, location, &node)?;
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Persist `value` at `location` and return the matching cached node.
///
/// Objects become dicts and arrays become lists, recursively, with every
/// container marker written before its children.
pub(crate) fn materialize(
    backend: &dyn StateBackend,
    location: &NodeLocation,
    value: Value,
) -> StoreResult<StateNode> {
    match value {
        Value::Object(entries) => {
            backend.write_marker(location, ContainerKind::Dict)?;
            let mut children = BTreeMap::new();
            for (key, entry) in entries {
                let child = materialize(backend, &location.child(key.as_str()), entry)?;
                children.insert(key, child);
            }
            Ok(StateNode::Dict(children))
        }
        Value::Array(entries) => {
            backend.write_marker(location, ContainerKind::List)?;
            let mut items = Vec::with_capacity(entries.len());
            for (index, entry) in entries.into_iter().enumerate() {
                items.push(materialize(
                    backend,
                    &location.child(index.to_string()),
                    entry,
                )?);
            }
            Ok(StateNode::List(items))
        }
        scalar => {
            backend.write_scalar(location, &scalar)?;
            Ok(StateNode::Scalar(scalar))
        }
    }
}

/// Write an already-cached node back out (used after renumbering).
pub(crate) fn rewrite(
    backend: &dyn StateBackend,
    location: &NodeLocation,
    node: &StateNode,
) -> StoreResult<()> {
    match node {
        StateNode::Scalar(value) => backend.write_scalar(location, value),
        StateNode::Dict(children) => {
            backend.write_marker(location, ContainerKind::Dict)?;
            for (key, child) in children {
                rewrite(backend, &location.child(key.as_str()), child)?;
            }
            Ok(())
        }
        StateNode::List(items) => {
            backend.write_marker(location, ContainerKind::List)?;
            for (index, item) in items.iter().enumerate() {
                rewrite(backend, &location.child(index.to_string()), item)?;
            }
            Ok(())
        }
    }
}

/// Assign `value` onto an existing node.
///
/// A dict assigned onto a dict merges key by key, recursing into existing
/// children; every other combination replaces the node, removing the old
/// subtree first unless both old and new values are scalars.
pub(crate) fn assign(
    backend: &dyn StateBackend,
    slot: &mut StateNode,
    location: &NodeLocation,
    value: Value,
) -> StoreResult<()> {
    match (&mut *slot, value) {
        (StateNode::Dict(children), Value::Object(entries)) => {
            for (key, entry) in entries {
                let child_location = location.child(key.as_str());
                match children.get_mut(&key) {
                    Some(existing) => assign(backend, existing, &child_location, entry)?,
                    None => {
                        let child = materialize(backend, &child_location, entry)?;
                        children.insert(key, child);
                    }
                }
            }
            Ok(())
        }
        (existing, value) => {
            let scalar_over_scalar =
                existing.kind().is_none() && !value.is_object() && !value.is_array();
            if !scalar_over_scalar {
                backend.remove(location)?;
            }
            *existing = materialize(backend, location, value)?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

fn parse_index(location: &NodeLocation, segment: &str) -> StoreResult<usize> {
    segment
        .parse::<usize>()
        .map_err(|_| StoreError::InvalidIndex {
            path: location.to_string(),
            segment: segment.to_string(),
        })
}

/// Walk `path` below `node`, creating missing dicts on the way.
///
/// Returns the node at the end of the path and its location.
pub(crate) fn descend_or_create<'a>(
    backend: &dyn StateBackend,
    node: &'a mut StateNode,
    root: &NodeLocation,
    path: &[String],
) -> StoreResult<(&'a mut StateNode, NodeLocation)> {
    let mut current = node;
    let mut location = root.clone();

    for segment in path {
        let parent_location = location.clone();
        location = location.child(segment.as_str());
        current = match current {
            StateNode::Dict(children) => {
                if !children.contains_key(segment) {
                    let created = materialize(backend, &location, Value::Object(Default::default()))?;
                    children.insert(segment.clone(), created);
                }
                match children.get_mut(segment) {
                    Some(child) => child,
                    None => {
                        return Err(StoreError::NotAContainer {
                            path: parent_location.to_string(),
                        });
                    }
                }
            }
            StateNode::List(items) => {
                let index = parse_index(&parent_location, segment)?;
                let len = items.len();
                match items.get_mut(index) {
                    Some(item) => item,
                    None => {
                        return Err(StoreError::IndexOutOfRange {
                            path: parent_location.to_string(),
                            index,
                            len,
                        });
                    }
                }
            }
            StateNode::Scalar(_) => {
                return Err(StoreError::NotAContainer {
                    path: parent_location.to_string(),
                });
            }
        };
    }

    Ok((current, location))
}

/// Assign `value` at `path` below `node`, creating parent dicts as needed.
///
/// A list index equal to the list length appends.
pub(crate) fn assign_at(
    backend: &dyn StateBackend,
    node: &mut StateNode,
    root: &NodeLocation,
    path: &[String],
    value: Value,
) -> StoreResult<()> {
    let Some((last, parents)) = path.split_last() else {
        return assign(backend, node, root, value);
    };

    let (parent, parent_location) = descend_or_create(backend, node, root, parents)?;
    let location = parent_location.child(last.as_str());
    match parent {
        StateNode::Dict(children) => match children.get_mut(last) {
            Some(existing) => assign(backend, existing, &location, value),
            None => {
                let child = materialize(backend, &location, value)?;
                children.insert(last.clone(), child);
                Ok(())
            }
        },
        StateNode::List(items) => {
            let index = parse_index(&parent_location, last)?;
            let len = items.len();
            if index < len {
                assign(backend, &mut items[index], &location, value)
            } else if index == len {
                let item = materialize(backend, &location, value)?;
                items.push(item);
                Ok(())
            } else {
                Err(StoreError::IndexOutOfRange {
                    path: parent_location.to_string(),
                    index,
                    len,
                })
            }
        }
        StateNode::Scalar(_) => Err(StoreError::NotAContainer {
            path: parent_location.to_string(),
        }),
    }
}

/// Append `value` to the list at `path`, creating the list if missing.
pub(crate) fn append_at(
    backend: &dyn StateBackend,
    node: &mut StateNode,
    root: &NodeLocation,
    path: &[String],
    value: Value,
) -> StoreResult<()> {
    if let Some((last, parents)) = path.split_last() {
        let (parent, _) = descend_or_create(backend, node, root, parents)?;
        if parent.child(last).is_none() {
            return assign_at(backend, node, root, path, Value::Array(vec![value]));
        }
    }

    let (target, location) = descend_or_create(backend, node, root, path)?;
    match target {
        StateNode::List(items) => {
            let item = materialize(backend, &location.child(items.len().to_string()), value)?;
            items.push(item);
            Ok(())
        }
        _ => Err(StoreError::NotAList {
            path: location.to_string(),
        }),
    }
}

/// Remove the child `key` of the container at `path`.
///
/// Removing a list element shifts later elements down and rewrites the
/// list so stored indices stay contiguous.  Returns `false` if nothing was
/// there.
pub(crate) fn remove_at(
    backend: &dyn StateBackend,
    node: &mut StateNode,
    root: &NodeLocation,
    path: &[String],
    key: &str,
) -> StoreResult<bool> {
    if node.descend(path).is_none() {
        return Ok(false);
    }
    let (target, location) = descend_or_create(backend, node, root, path)?;
    match target {
        StateNode::Dict(children) => {
            if children.remove(key).is_none() {
                return Ok(false);
            }
            backend.remove(&location.child(key))?;
            Ok(true)
        }
        StateNode::List(items) => match key.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                backend.remove(&location)?;
                backend.write_marker(&location, ContainerKind::List)?;
                for (position, item) in items.iter().enumerate() {
                    rewrite(backend, &location.child(position.to_string()), item)?;
                }
                Ok(true)
            }
            _ => Ok(false),
        },
        StateNode::Scalar(_) => Ok(false),
    }
}
