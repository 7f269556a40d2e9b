//! Query cursors.

use crate::error::{ModelError, ModelResult};
use crate::index::IndexColumn;
use crate::property::PropertyValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Fingerprint of a finalized query shape.
pub type Fingerprint = [u8; 32];

/// An opaque position inside the results of one query shape.
///
/// The position is the sort tuple of the last delivered record: the values
/// of every final sort order, ending with the entity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    fingerprint: Fingerprint,
    position: Vec<PropertyValue>,
}

impl Cursor {
    /// Creates a cursor for a query fingerprint at `position`.
    #[must_use]
    pub fn new(fingerprint: Fingerprint, position: Vec<PropertyValue>) -> Self {
        Self {
            fingerprint,
            position,
        }
    }

    /// Returns the fingerprint of the query this cursor belongs to.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Returns the sort tuple of the position.
    #[must_use]
    pub fn position(&self) -> &[PropertyValue] {
        &self.position
    }

    /// Encodes the cursor as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> ModelResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ModelError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a cursor from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a cursor.
    pub fn from_bytes(bytes: &[u8]) -> ModelResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ModelError::InvalidCursor(e.to_string()))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes().map_err(|_| fmt::Error)?;
        for b in bytes {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Cursor {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(ModelError::InvalidCursor("malformed hex".to_string()));
        }
        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| ModelError::InvalidCursor(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Compares two sort tuples under `orders`.
///
/// Tuples shorter than `orders` compare on their common prefix.
#[must_use]
pub fn compare_tuples(orders: &[IndexColumn], a: &[PropertyValue], b: &[PropertyValue]) -> Ordering {
    for ((order, x), y) in orders.iter().zip(a).zip(b) {
        let ord = x.cmp(y);
        let ord = if order.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
