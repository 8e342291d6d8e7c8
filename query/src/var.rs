use serde::{Deserialize, Serialize};

use trellis_proto::AttrPath;

/// Where a variable's value comes from.
///
/// `Ancestor(1)` is the immediate parent frame on the execution stack; larger
/// numbers walk outward. Frame 0 is reserved and never valid. `Unscoped`
/// names fall back to the flattened merge of all scopes (legacy form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarScope {
    Global,
    Session,
    Query,
    Role,
    Ancestor(u32),
    Unscoped,
}

/// A textual variable reference: `"$<scope>.<path>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub scope: VarScope,
    pub path: AttrPath,
}

impl VarRef {
    pub fn new(scope: VarScope, path: impl Into<AttrPath>) -> Self { Self { scope, path: path.into() } }

    pub fn ancestor(frames_up: u32, path: impl Into<AttrPath>) -> Self { Self::new(VarScope::Ancestor(frames_up), path) }

    /// Parse a `$scope.path` reference. Returns `None` if the string is not a
    /// variable (no `$` sigil).
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('$')?;
        match body.split_once('.') {
            None => Some(Self::new(VarScope::Unscoped, AttrPath::from(body))),
            Some((scope, rest)) => {
                let scope = match scope {
                    "global" => VarScope::Global,
                    "session" => VarScope::Session,
                    "query" => VarScope::Query,
                    "role" => VarScope::Role,
                    _ => match scope.parse::<u32>() {
                        Ok(n) => VarScope::Ancestor(n),
                        // not a recognized scope token: the whole body is an unscoped path
                        Err(_) => return Some(Self::new(VarScope::Unscoped, AttrPath::from(body))),
                    },
                };
                Some(Self::new(scope, AttrPath::from(rest)))
            }
        }
    }
}

impl std::fmt::Display for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            VarScope::Global => write!(f, "$global.{}", self.path),
            VarScope::Session => write!(f, "$session.{}", self.path),
            VarScope::Query => write!(f, "$query.{}", self.path),
            VarScope::Role => write!(f, "$role.{}", self.path),
            VarScope::Ancestor(n) => write!(f, "${}.{}", n, self.path),
            VarScope::Unscoped => write!(f, "${}", self.path),
        }
    }
}
