//! Entity keys.
//!
//! A [`Key`] is an ordered path of `(kind, id)` tokens under an application
//! and namespace context. Keys order by context, then by path token by
//! token, so an ancestor sorts directly before all of its descendants and
//! the descendants of one ancestor are contiguous.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application and namespace a key lives in.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyContext {
    /// Application identifier.
    pub app_id: String,
    /// Namespace inside the application.
    pub namespace: String,
}

impl KeyContext {
    /// Creates a new key context.
    #[must_use]
    pub fn new(app_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates a root key of `kind` with `id` in this context.
    #[must_use]
    pub fn key(&self, kind: impl Into<String>, id: impl Into<KeyId>) -> Key {
        Key::new(self.clone(), kind, id)
    }
}

/// The identifier part of a key token.
///
/// Variant order is significant: incomplete ids sort first, then integer
/// ids numerically, then string ids lexically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyId {
    /// Pending assignment by the backend.
    Incomplete,
    /// Integer id.
    Int(i64),
    /// String id.
    Name(String),
}

impl KeyId {
    /// Returns true if this id is complete and well formed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Incomplete => false,
            Self::Int(id) => *id != 0,
            Self::Name(name) => !name.is_empty(),
        }
    }
}

impl From<i64> for KeyId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for KeyId {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for KeyId {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "0"),
            Self::Int(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// One element of a key path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyToken {
    /// Entity kind.
    pub kind: String,
    /// Identifier inside the parent.
    pub id: KeyId,
}

/// An immutable entity key. The path is never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeyParts")]
pub struct Key {
    context: KeyContext,
    path: Vec<KeyToken>,
}

/// Serialized form of a [`Key`], checked before it becomes one.
#[derive(Deserialize)]
struct KeyParts {
    context: KeyContext,
    path: Vec<KeyToken>,
}

impl TryFrom<KeyParts> for Key {
    type Error = ModelError;

    fn try_from(parts: KeyParts) -> ModelResult<Self> {
        Self::from_path(parts.context, parts.path)
    }
}

impl Key {
    /// Creates a root key.
    #[must_use]
    pub fn new(context: KeyContext, kind: impl Into<String>, id: impl Into<KeyId>) -> Self {
        Self {
            context,
            path: vec![KeyToken {
                kind: kind.into(),
                id: id.into(),
            }],
        }
    }

    /// Creates an incomplete root key of `kind`.
    #[must_use]
    pub fn incomplete(context: KeyContext, kind: impl Into<String>) -> Self {
        Self::new(context, kind, KeyId::Incomplete)
    }

    /// Creates a key from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty.
    pub fn from_path(context: KeyContext, path: Vec<KeyToken>) -> ModelResult<Self> {
        if path.is_empty() {
            return Err(ModelError::invalid_key("empty key path"));
        }
        Ok(Self { context, path })
    }

    /// Creates a child key of this key.
    #[must_use]
    pub fn child(&self, kind: impl Into<String>, id: impl Into<KeyId>) -> Self {
        let mut path = self.path.clone();
        path.push(KeyToken {
            kind: kind.into(),
            id: id.into(),
        });
        Self {
            context: self.context.clone(),
            path,
        }
    }

    /// Creates an incomplete child key of this key.
    #[must_use]
    pub fn incomplete_child(&self, kind: impl Into<String>) -> Self {
        self.child(kind, KeyId::Incomplete)
    }

    /// Returns the key context.
    #[must_use]
    pub fn context(&self) -> &KeyContext {
        &self.context
    }

    /// Returns the key path.
    #[must_use]
    pub fn path(&self) -> &[KeyToken] {
        &self.path
    }

    fn last(&self) -> &KeyToken {
        // Every constructor, deserialization included, rejects empty paths.
        &self.path[self.path.len() - 1]
    }

    /// Returns the kind of the last token.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.last().kind
    }

    /// Returns the id of the last token.
    #[must_use]
    pub fn id(&self) -> &KeyId {
        &self.last().id
    }

    /// Returns the parent key, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Self {
            context: self.context.clone(),
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// Returns the entity group root of this key.
    #[must_use]
    pub fn root(&self) -> Self {
        Self {
            context: self.context.clone(),
            path: self.path[..1].to_vec(),
        }
    }

    /// Returns all ancestors of this key from the root down, including itself.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        (1..=self.path.len())
            .map(|len| Self {
                context: self.context.clone(),
                path: self.path[..len].to_vec(),
            })
            .collect()
    }

    /// Returns true if `ancestor` is this key or one of its ancestors.
    #[must_use]
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        self.context == ancestor.context
            && self.path.len() >= ancestor.path.len()
            && self.path[..ancestor.path.len()] == ancestor.path[..]
    }

    /// Returns true if the last token has no id yet.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.last().id == KeyId::Incomplete
    }

    /// Returns true if the key is well formed.
    ///
    /// Every kind must be non-empty and every id complete, except that the
    /// last id may be incomplete when `allow_incomplete` is set.
    #[must_use]
    pub fn is_valid(&self, allow_incomplete: bool) -> bool {
        let last = self.path.len() - 1;
        self.path.iter().enumerate().all(|(i, tok)| {
            if tok.kind.is_empty() {
                return false;
            }
            if i == last && allow_incomplete && tok.id == KeyId::Incomplete {
                return true;
            }
            tok.id.is_complete()
        })
    }

    /// Returns a copy of this key with the last id replaced.
    #[must_use]
    pub fn with_id(&self, id: impl Into<KeyId>) -> Self {
        let mut key = self.clone();
        let last = key.path.len() - 1;
        key.path[last].id = id.into();
        key
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.context.app_id, self.context.namespace)?;
        for tok in &self.path {
            write!(f, "/{},{}", tok.kind, tok.id)?;
        }
        Ok(())
    }
}
