//! Paths into a response document.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// One step of a [`Path`]: an object key or a list index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    Index(usize),
    Key(String),
}

/// A path into the result document, as rendered in the `path` member of a
/// GraphQL error: a list of field names and list indices.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Vec::new())
    }

    pub fn from_slice<T: AsRef<str>>(segments: &[T]) -> Path {
        Path(
            segments
                .iter()
                .map(|s| {
                    let s = s.as_ref();
                    s.parse::<usize>()
                        .map(PathElement::Index)
                        .unwrap_or_else(|_| PathElement::Key(s.to_string()))
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self, key: impl Into<String>) -> Path {
        let mut next = self.clone();
        next.0.push(PathElement::Key(key.into()));
        next
    }

    pub fn index(&self, index: usize) -> Path {
        let mut next = self.clone();
        next.0.push(PathElement::Index(index));
        next
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}
