//! RFC 6901 JSON Pointer helpers and the primitive edits JSON Patch is built from.

use serde_json::{Map, Value as Json};

use crate::PatchError;

pub fn escape_token(t: &str) -> String { t.replace('~', "~0").replace('/', "~1") }

pub fn parse_pointer(p: &str) -> Result<Vec<String>, PatchError> {
    if p.is_empty() { return Ok(Vec::new()); }
    let rest = p.strip_prefix('/').ok_or_else(|| PatchError::InvalidPointer(p.to_string()))?;
    Ok(rest.split('/').map(|t| t.replace("~1", "/").replace("~0", "~")).collect())
}

fn parse_index(tok: &str, len: usize, path: &str, allow_end: bool) -> Result<usize, PatchError> {
    if allow_end && tok == "-" { return Ok(len); }
    if tok.is_empty() || (tok.len() > 1 && tok.starts_with('0')) || !tok.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PatchError::InvalidIndex(path.to_string()));
    }
    let idx: usize = tok.parse().map_err(|_| PatchError::InvalidIndex(path.to_string()))?;
    let bound = if allow_end { len } else { len.saturating_sub(1) };
    if (allow_end && idx > bound) || (!allow_end && (len == 0 || idx > bound)) {
        return Err(PatchError::InvalidIndex(path.to_string()));
    }
    Ok(idx)
}

pub fn get<'a>(doc: &'a Json, tokens: &[String]) -> Option<&'a Json> {
    let mut cur = doc;
    for tok in tokens {
        cur = match cur {
            Json::Object(m) => m.get(tok)?,
            Json::Array(a) => a.get(tok.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn get_mut<'a>(doc: &'a mut Json, tokens: &[String]) -> Option<&'a mut Json> {
    let mut cur = doc;
    for tok in tokens {
        cur = match cur {
            Json::Object(m) => m.get_mut(tok)?,
            Json::Array(a) => a.get_mut(tok.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn parent_mut<'a>(doc: &'a mut Json, tokens: &[String], path: &str) -> Result<&'a mut Json, PatchError> {
    get_mut(doc, &tokens[..tokens.len() - 1]).ok_or_else(|| PatchError::PathNotFound(path.to_string()))
}

pub fn add(doc: &mut Json, tokens: &[String], value: Json, path: &str) -> Result<(), PatchError> {
    let Some(last) = tokens.last() else {
        *doc = value;
        return Ok(());
    };
    match parent_mut(doc, tokens, path)? {
        Json::Object(m) => { m.insert(last.clone(), value); }
        Json::Array(a) => {
            let idx = parse_index(last, a.len(), path, true)?;
            a.insert(idx, value);
        }
        _ => return Err(PatchError::InvalidTarget(path.to_string())),
    }
    Ok(())
}

pub fn remove(doc: &mut Json, tokens: &[String], path: &str) -> Result<Json, PatchError> {
    let Some(last) = tokens.last() else {
        return Err(PatchError::InvalidPointer(path.to_string()));
    };
    match parent_mut(doc, tokens, path)? {
        Json::Object(m) => m.remove(last).ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Json::Array(a) => {
            let idx = parse_index(last, a.len(), path, false)?;
            Ok(a.remove(idx))
        }
        _ => Err(PatchError::InvalidTarget(path.to_string())),
    }
}

pub fn replace(doc: &mut Json, tokens: &[String], value: Json, path: &str) -> Result<(), PatchError> {
    let slot = get_mut(doc, tokens).ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
    *slot = value;
    Ok(())
}

/// Ensure `doc` is an object, replacing any other value.
pub fn ensure_object(doc: &mut Json) -> &mut Map<String, Json> {
    if !doc.is_object() { *doc = Json::Object(Map::new()); }
    match doc {
        Json::Object(m) => m,
        _ => unreachable!("value was just set to an object"),
    }
}
