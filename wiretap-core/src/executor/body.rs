//! Body Surgery
//!
//! JSON pointer patching and urlencoded form-field edits applied to the
//! running body during action execution.

use serde_json::Value;
use thiserror::Error;
use url::form_urlencoded;

use wiretap_rules::{JsonPatchOp, PatchOp};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("body is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("path {0:?} not found")]
    NotFound(String),
    #[error("path {0:?} does not address a container")]
    NotContainer(String),
    #[error("invalid array index in {0:?}")]
    BadIndex(String),
}

/// Apply a patch sequence to a JSON body. The first failing op aborts the
/// whole sequence; callers keep the pre-patch body in that case.
pub fn apply_json_patches(body: &str, patches: &[JsonPatchOp]) -> Result<String, PatchError> {
    if body.is_empty() || patches.is_empty() {
        return Ok(body.to_string());
    }
    let mut doc: Value = serde_json::from_str(body)?;
    for patch in patches {
        apply_one(&mut doc, patch)?;
    }
    Ok(doc.to_string())
}

fn apply_one(doc: &mut Value, patch: &JsonPatchOp) -> Result<(), PatchError> {
    match patch.op {
        PatchOp::Replace => {
            let target = doc
                .pointer_mut(&patch.path)
                .ok_or_else(|| PatchError::NotFound(patch.path.clone()))?;
            *target = patch.value.clone();
            Ok(())
        }
        PatchOp::Add => {
            if patch.path.is_empty() {
                *doc = patch.value.clone();
                return Ok(());
            }
            let (parent_path, key) = split_pointer(&patch.path);
            let parent = doc
                .pointer_mut(parent_path)
                .ok_or_else(|| PatchError::NotFound(patch.path.clone()))?;
            match parent {
                Value::Object(map) => {
                    map.insert(unescape(key), patch.value.clone());
                    Ok(())
                }
                Value::Array(items) => {
                    if key == "-" {
                        items.push(patch.value.clone());
                        return Ok(());
                    }
                    let index: usize = key
                        .parse()
                        .map_err(|_| PatchError::BadIndex(patch.path.clone()))?;
                    if index > items.len() {
                        return Err(PatchError::BadIndex(patch.path.clone()));
                    }
                    items.insert(index, patch.value.clone());
                    Ok(())
                }
                _ => Err(PatchError::NotContainer(patch.path.clone())),
            }
        }
        PatchOp::Remove => {
            let (parent_path, key) = split_pointer(&patch.path);
            let parent = doc
                .pointer_mut(parent_path)
                .ok_or_else(|| PatchError::NotFound(patch.path.clone()))?;
            match parent {
                Value::Object(map) => {
                    map.remove(&unescape(key))
                        .ok_or_else(|| PatchError::NotFound(patch.path.clone()))?;
                    Ok(())
                }
                Value::Array(items) => {
                    let index: usize = key
                        .parse()
                        .map_err(|_| PatchError::BadIndex(patch.path.clone()))?;
                    if index >= items.len() {
                        return Err(PatchError::BadIndex(patch.path.clone()));
                    }
                    items.remove(index);
                    Ok(())
                }
                _ => Err(PatchError::NotContainer(patch.path.clone())),
            }
        }
    }
}

fn split_pointer(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Set a field in an `application/x-www-form-urlencoded` body, replacing
/// every previous occurrence.
pub fn set_form_field(body: &str, name: &str, value: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .filter(|(k, _)| k != name)
        .collect();
    pairs.push((name.to_string(), value.to_string()));
    encode_form(&pairs)
}

/// Remove a field from an urlencoded body.
pub fn remove_form_field(body: &str, name: &str) -> String {
    let pairs: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .filter(|(k, _)| k != name)
        .collect();
    encode_form(&pairs)
}

fn encode_form(pairs: &[(String, String)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}
