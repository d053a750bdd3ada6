use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Identifier triple for one conversation. Each component becomes a path
/// segment under the sessions root, so every component must be path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSessionId {
    #[error("session component `{0}` is empty")]
    Empty(&'static str),

    #[error("session component `{0}` contains a path separator or dot: {1:?}")]
    Unsafe(&'static str, String),
}

impl SessionId {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, InvalidSessionId> {
        let app_name = app_name.into();
        let user_id = user_id.into();
        let id = id.into();
        validate_component("app_name", &app_name)?;
        validate_component("user_id", &user_id)?;
        validate_component("id", &id)?;
        Ok(Self {
            app_name,
            user_id,
            id,
        })
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.id)
    }
}

/// Rejects anything that could escape the per-session directory: empty
/// components, separators, and any `.` (which also covers `.` and `..`).
fn validate_component(name: &'static str, value: &str) -> Result<(), InvalidSessionId> {
    if value.is_empty() {
        return Err(InvalidSessionId::Empty(name));
    }
    if value.contains(['/', '\\', '.']) || value.contains('\0') {
        return Err(InvalidSessionId::Unsafe(name, value.to_string()));
    }
    Ok(())
}

/// Derive the directory key for a workspace path. Separators and drive
/// punctuation are flattened to `-` so the key is a single path segment.
pub fn workspace_key(workspace: &Path) -> String {
    let raw = workspace.to_string_lossy();
    let key: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '.' => '-',
            c => c,
        })
        .collect();
    key.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn accepts_plain_components() {
        let session = SessionId::new("sable", "local", "abc123").unwrap();
        assert_eq!("sable/local/abc123", session.to_string());
    }

    #[test]
    fn rejects_traversal_components() {
        for bad in ["..", ".", "a/b", "a\\b", "a.b", ""] {
            assert!(
                SessionId::new("sable", "local", bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn workspace_key_is_a_single_segment() {
        let key = workspace_key(&PathBuf::from("/home/dev/my.project"));
        assert!(!key.contains('/'));
        assert!(!key.contains('.'));
        assert_eq!("home-dev-my-project", key);
    }
}
