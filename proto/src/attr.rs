use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// Attribute name that marks which collection an entity belongs to. A `Null`
/// winning value at this leaf tombstones the entity.
pub const COLLECTION_ATTR: &str = "_collection";

/// Ordered attribute path: `["address", "city"]`, or for set members the
/// member rendering as the final segment: `["tags", "rust"]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrPath(Vec<String>);

impl AttrPath {
    pub fn new(segments: Vec<String>) -> Self { AttrPath(segments) }

    /// Parse a dotted path: `"address.city"`.
    pub fn parse(path: &str) -> Result<Self, DecodeError> {
        if path.is_empty() {
            return Err(DecodeError::EmptyAttrPath);
        }
        Ok(AttrPath(path.split('.').map(str::to_string).collect()))
    }

    pub fn collection() -> Self { AttrPath(vec![COLLECTION_ATTR.to_string()]) }

    pub fn segments(&self) -> &[String] { &self.0 }

    pub fn first(&self) -> &str { &self.0[0] }

    pub fn last(&self) -> &str { &self.0[self.0.len() - 1] }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn is_collection_attr(&self) -> bool { self.0.len() == 1 && self.0[0] == COLLECTION_ATTR }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        AttrPath(segments)
    }

    pub fn starts_with(&self, prefix: &AttrPath) -> bool { self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..] }

    /// Path segments after the given prefix, if this path extends it.
    pub fn strip_prefix(&self, prefix: &AttrPath) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }
}

impl std::fmt::Display for AttrPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0.join(".")) }
}

impl From<&str> for AttrPath {
    fn from(path: &str) -> Self { AttrPath(path.split('.').map(str::to_string).collect()) }
}

impl From<Vec<&str>> for AttrPath {
    fn from(segments: Vec<&str>) -> Self { AttrPath(segments.into_iter().map(str::to_string).collect()) }
}
