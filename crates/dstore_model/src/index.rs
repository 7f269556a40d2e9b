//! Index metadata.
//!
//! Every kind implicitly has a kind index and, for each indexed property,
//! an ascending and a descending single-property index. Anything else is a
//! composite [`IndexDefinition`] that must be declared.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A property and direction, used both as an index column and a sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Property name.
    pub property: String,
    /// True for descending order.
    pub descending: bool,
}

impl IndexColumn {
    /// Creates an ascending column.
    #[must_use]
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: false,
        }
    }

    /// Creates a descending column.
    #[must_use]
    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: true,
        }
    }

    /// Returns the same property in the opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            property: self.property.clone(),
            descending: !self.descending,
        }
    }
}

/// Parses `prop` as ascending and `-prop` as descending.
impl FromStr for IndexColumn {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        let s = s.trim();
        let (property, descending) = match s.strip_prefix('-') {
            Some(rest) => (rest.trim(), true),
            None => (s, false),
        };
        if property.is_empty() {
            return Err(ModelError::invalid_index(format!("empty column in {s:?}")));
        }
        Ok(Self {
            property: property.to_string(),
            descending,
        })
    }
}

impl fmt::Display for IndexColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-")?;
        }
        write!(f, "{}", self.property)
    }
}

/// A kind index, single-property index or declared composite index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// The kind this index covers.
    pub kind: String,
    /// Whether rows are prefixed by each ancestor of the entity.
    pub ancestor: bool,
    /// Ordered columns.
    pub columns: Vec<IndexColumn>,
}

impl IndexDefinition {
    /// Creates a composite definition.
    #[must_use]
    pub fn new(kind: impl Into<String>, ancestor: bool, columns: Vec<IndexColumn>) -> Self {
        Self {
            kind: kind.into(),
            ancestor,
            columns,
        }
    }

    /// The built-in kind index.
    #[must_use]
    pub fn kind_only(kind: impl Into<String>) -> Self {
        Self::new(kind, false, Vec::new())
    }

    /// A built-in single-property index.
    #[must_use]
    pub fn single(kind: impl Into<String>, column: IndexColumn) -> Self {
        Self::new(kind, false, vec![column])
    }

    /// Returns true if this index always exists without being declared.
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        !self.ancestor && self.columns.len() <= 1
    }

    /// Returns true if this is the kind index.
    #[must_use]
    pub fn is_kind_only(&self) -> bool {
        !self.ancestor && self.columns.is_empty()
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is empty, a column repeats, or a
    /// composite definition has no columns.
    pub fn validate(&self) -> ModelResult<()> {
        if self.kind.is_empty() {
            return Err(ModelError::invalid_index("index has no kind"));
        }
        if self.ancestor && self.columns.is_empty() {
            return Err(ModelError::invalid_index("ancestor index needs columns"));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.property == col.property) {
                return Err(ModelError::invalid_index(format!(
                    "column {:?} repeated",
                    col.property
                )));
            }
        }
        Ok(())
    }

    /// Renders the definition as an `index.yaml` entry.
    #[must_use]
    pub fn to_yaml(&self) -> String {
        let mut out = format!("- kind: {}\n", self.kind);
        if self.ancestor {
            out.push_str("  ancestor: yes\n");
        }
        if !self.columns.is_empty() {
            out.push_str("  properties:\n");
            for col in &self.columns {
                out.push_str(&format!("  - name: {}\n", col.property));
                if col.descending {
                    out.push_str("    direction: desc\n");
                }
            }
        }
        out
    }
}

/// Parses `Kind:a,-b` or `Kind/ancestor:a,-b`.
impl FromStr for IndexDefinition {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        let (head, cols) = match s.split_once(':') {
            Some((head, cols)) => (head.trim(), cols.trim()),
            None => (s.trim(), ""),
        };
        let (kind, ancestor) = match head.split_once('/') {
            Some((kind, "ancestor")) => (kind, true),
            Some((_, other)) => {
                return Err(ModelError::invalid_index(format!(
                    "unknown index modifier {other:?}"
                )))
            }
            None => (head, false),
        };
        let columns = if cols.is_empty() {
            Vec::new()
        } else {
            cols.split(',')
                .map(str::parse)
                .collect::<ModelResult<Vec<IndexColumn>>>()?
        };
        let def = Self::new(kind, ancestor, columns);
        def.validate()?;
        Ok(def)
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.ancestor {
            write!(f, "/ancestor")?;
        }
        write!(f, ":")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{col}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let def: IndexDefinition = "Item/ancestor:a,-b".parse().unwrap();
        assert_eq!(def.kind, "Item");
        assert!(def.ancestor);
        assert_eq!(def.columns, vec![IndexColumn::asc("a"), IndexColumn::desc("b")]);
        assert_eq!(def.to_string(), "Item/ancestor:a,-b");
        assert!(!def.is_builtin());
    }

    #[test]
    fn builtin_detection() {
        assert!(IndexDefinition::kind_only("K").is_builtin());
        assert!(IndexDefinition::single("K", IndexColumn::desc("x")).is_builtin());
        let kind: IndexDefinition = "K".parse().unwrap();
        assert!(kind.is_kind_only());
    }

    #[test]
    fn rejects_bad_definitions() {
        assert!("K/sideways:a".parse::<IndexDefinition>().is_err());
        assert!("K:a,-a".parse::<IndexDefinition>().is_err());
        assert!(":a".parse::<IndexDefinition>().is_err());
        assert!("K:a,,b".parse::<IndexDefinition>().is_err());
    }

    #[test]
    fn yaml_rendering() {
        let def: IndexDefinition = "Item:a,-c".parse().unwrap();
        assert_eq!(
            def.to_yaml(),
            "- kind: Item\n  properties:\n  - name: a\n  - name: c\n    direction: desc\n"
        );
    }
}
