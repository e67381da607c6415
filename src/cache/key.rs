//! Structural query keys.

use std::fmt;

/// One primitive segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
  Str(String),
  Int(i64),
  Bool(bool),
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<i64> for Segment {
  fn from(n: i64) -> Self {
    Segment::Int(n)
  }
}

impl From<u64> for Segment {
  fn from(n: u64) -> Self {
    // Ids above i64::MAX do not occur in the API; keep them distinct anyway.
    i64::try_from(n)
      .map(Segment::Int)
      .unwrap_or_else(|_| Segment::Str(n.to_string()))
  }
}

impl From<bool> for Segment {
  fn from(b: bool) -> Self {
    Segment::Bool(b)
  }
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Str(s) => write!(f, "{:?}", s),
      Segment::Int(n) => write!(f, "{}", n),
      Segment::Bool(b) => write!(f, "{}", b),
    }
  }
}

/// Identity of a logical resource in the cache, e.g. `["plan","today"]`.
///
/// Keys compare by value, so two keys built independently from the same
/// segments address the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<Segment>);

impl QueryKey {
  pub fn new(segments: Vec<Segment>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  /// Extend this key with one more segment.
  pub fn child(&self, segment: impl Into<Segment>) -> Self {
    let mut segments = self.0.clone();
    segments.push(segment.into());
    Self(segments)
  }

  /// True if `self` is a leading subsequence of `other`. The empty key
  /// prefixes everything.
  pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
    other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}", segment)?;
    }
    write!(f, "]")
  }
}

/// Build a [`QueryKey`] from a list of segment-convertible values.
///
/// ```ignore
/// let key = query_key!["rituals", "detail", 42i64];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:expr),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::Segment::from($segment)),*])
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_equal_segments_hash_equal() {
    let a = query_key!["progress", "history", "30d"];
    let b = QueryKey::new(vec!["progress".into(), "history".into(), "30d".into()]);

    assert_eq!(a, b);
    let set: HashSet<QueryKey> = [a, b].into_iter().collect();
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn test_segment_types_are_distinct() {
    assert_ne!(query_key!["rituals", 42i64], query_key!["rituals", "42"]);
  }

  #[test]
  fn test_prefix_matching() {
    let progress = query_key!["progress"];
    let history = query_key!["progress", "history", "30d"];
    let plan = query_key!["plan", "today"];

    assert!(progress.is_prefix_of(&history));
    assert!(history.is_prefix_of(&history));
    assert!(!history.is_prefix_of(&progress));
    assert!(!progress.is_prefix_of(&plan));
    assert!(QueryKey::default().is_prefix_of(&plan));
  }

  #[test]
  fn test_display() {
    assert_eq!(
      query_key!["rituals", "detail", 7i64].to_string(),
      r#"["rituals","detail",7]"#
    );
  }
}
