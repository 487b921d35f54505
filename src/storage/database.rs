use async_trait::async_trait;
use serde_json::Value;

use crate::error::DatabaseError;

const FORBIDDEN_KEY_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

/// Hierarchical JSON key-value store addressed by slash-delimited paths,
/// e.g. `fine-tune/{owner}/{model}`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Value stored at `path`, `None` when nothing is there.
    async fn get(&self, path: &str) -> Result<Option<Value>, DatabaseError>;

    /// Replace whatever is stored at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<(), DatabaseError>;

    /// Set each child of the `partial` object under `path`, leaving other
    /// children alone.
    async fn update(&self, path: &str, partial: Value) -> Result<(), DatabaseError>;

    async fn remove(&self, path: &str) -> Result<(), DatabaseError>;
}

/// Splits a database path into its keys, rejecting empty keys and characters
/// that are not allowed in realtime-database keys.
pub fn split_path(path: &str) -> Result<Vec<&str>, DatabaseError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(DatabaseError::InvalidPath(path.to_string()));
    }
    trimmed
        .split('/')
        .map(|segment| {
            if segment.is_empty()
                || segment.contains(FORBIDDEN_KEY_CHARS)
                || segment.chars().any(char::is_control)
            {
                Err(DatabaseError::InvalidPath(path.to_string()))
            } else {
                Ok(segment)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_slash_delimited_paths() {
        assert_eq!(
            split_path("/fine-tune/0xA/my model/").unwrap(),
            vec!["fine-tune", "0xA", "my model"]
        );
    }

    #[test]
    fn rejects_bad_keys() {
        for path in ["", "/", "a//b", "images/v1.2", "users/$me", "a/[0]", "a/b#c"] {
            assert!(
                matches!(split_path(path), Err(DatabaseError::InvalidPath(_))),
                "{path:?} should be rejected"
            );
        }
    }
}
