use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const KEY_FIELD_NAME: &str = "__name__";

/// Dot-separated path to a (possibly nested) document field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(invalid_argument(
                "Invalid field path. Provide at least one non-empty segment.",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("Invalid field path. Field paths cannot be empty."));
        }
        FieldPath::new(path.split('.'))
    }

    /// Parses the server format, where segments that are not plain identifiers
    /// are wrapped in backticks and may contain `\`-escapes.
    pub fn from_server_format(path: &str) -> FirestoreResult<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = path.chars();
        let mut in_backticks = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(invalid_argument(format!("Trailing escape in field path {path}"))),
                },
                '`' => in_backticks = !in_backticks,
                '.' if !in_backticks => segments.push(std::mem::take(&mut current)),
                other => current.push(other),
            }
        }
        if in_backticks {
            return Err(invalid_argument(format!("Unterminated ` in field path {path}")));
        }
        segments.push(current);
        FieldPath::new(segments)
    }

    /// The special `__name__` path that orders by document key.
    pub fn key_field() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last_segment(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Parent path, or `None` for a single-segment path.
    pub fn parent(&self) -> Option<Self> {
        (self.segments.len() > 1).then(|| Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(l, r)| l == r)
    }

    /// Server-format rendering; inverse of [`FieldPath::from_server_format`].
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|segment| escape_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_simple_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn escape_segment(segment: &str) -> String {
    if is_simple_identifier(segment) {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl IntoFieldPath for &FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl IntoFieldPath for &str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("foo.bar").unwrap();
        assert_eq!(field.segments(), &["foo", "bar"]);
        assert_eq!(field.parent().unwrap().canonical_string(), "foo");
    }

    #[test]
    fn rejects_empty() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }

    #[test]
    fn escapes_non_identifier_segments() {
        let field = FieldPath::new(["a", "b.c", "1x", "we`ird"]).unwrap();
        let rendered = field.canonical_string();
        assert_eq!(rendered, "a.`b.c`.`1x`.`we\\`ird`");
        assert_eq!(FieldPath::from_server_format(&rendered).unwrap(), field);
    }

    #[test]
    fn key_field_is_special() {
        assert!(FieldPath::key_field().is_key_field());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_field());
    }
}
