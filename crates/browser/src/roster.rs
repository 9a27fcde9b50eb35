//! Identity roster loading (§3): scans `auth_dir` for `auth-<i>.json` files and builds the
//! ordered [`Identity`] list the Switcher rotates and the CLI's `list-identities` subcommand
//! prints.

use std::path::Path;

use relaygate_config::IdentityState;
use tracing::warn;

use crate::{error::BrowserError, types::Identity};

const AUTH_FILE_PREFIX: &str = "auth-";
const AUTH_FILE_SUFFIX: &str = ".json";

/// Reads every `auth-<i>.json` in `auth_dir`, sorted by `<i>`. A file that fails to parse is
/// logged and skipped rather than aborting the whole load — one corrupt identity shouldn't
/// take the fleet down at startup.
pub async fn load_roster(auth_dir: &Path) -> Result<Vec<Identity>, BrowserError> {
    let mut entries = match tokio::fs::read_dir(auth_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BrowserError::Io(err)),
    };

    let mut indices = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(BrowserError::Io)? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(auth_index) = parse_auth_index(name) {
            indices.push(auth_index);
        }
    }
    indices.sort_unstable();

    let mut roster = Vec::with_capacity(indices.len());
    for auth_index in indices {
        match load_identity(auth_dir, auth_index).await {
            Ok(identity) => roster.push(identity),
            Err(err) => warn!(auth_index, error = %err, "skipping unreadable identity state"),
        }
    }
    Ok(roster)
}

/// Loads a single identity's state file, creating an empty default if absent (a fresh,
/// never-yet-activated identity).
pub async fn load_identity(auth_dir: &Path, auth_index: u32) -> Result<Identity, BrowserError> {
    let path = auth_file_path(auth_dir, auth_index);
    let state = match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice::<IdentityState>(&bytes)
            .map_err(|err| BrowserError::Other { source: Box::new(err) })?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => IdentityState {
            cookies: Vec::new(),
            origins: Vec::new(),
            account_name: None,
            app_url: None,
        },
        Err(err) => return Err(BrowserError::Io(err)),
    };

    let email = state.account_name.clone();
    Ok(Identity {
        auth_index,
        email,
        state,
    })
}

pub fn auth_file_path(auth_dir: &Path, auth_index: u32) -> std::path::PathBuf {
    auth_dir.join(format!("{AUTH_FILE_PREFIX}{auth_index}{AUTH_FILE_SUFFIX}"))
}

fn parse_auth_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(AUTH_FILE_PREFIX)?
        .strip_suffix(AUTH_FILE_SUFFIX)?
        .parse()
        .ok()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_auth_file_names() {
        assert_eq!(parse_auth_index("auth-0.json"), Some(0));
        assert_eq!(parse_auth_index("auth-17.json"), Some(17));
    }

    #[test]
    fn rejects_non_matching_names() {
        assert_eq!(parse_auth_index("auth-0.txt"), None);
        assert_eq!(parse_auth_index("models.json"), None);
        assert_eq!(parse_auth_index("auth-abc.json"), None);
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_roster() {
        let dir = std::env::temp_dir().join(format!("relaygate-roster-test-missing-{}", std::process::id()));
        let roster = load_roster(&dir).await.unwrap();
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn loads_and_sorts_identities_by_index() {
        let dir = std::env::temp_dir().join(format!(
            "relaygate-roster-test-{}-{}",
            std::process::id(),
            "load-sort"
        ));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        tokio::fs::write(
            auth_file_path(&dir, 2),
            serde_json::to_vec(&IdentityState {
                cookies: vec![],
                origins: vec![],
                account_name: Some("second@example.com".into()),
                app_url: None,
            })
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            auth_file_path(&dir, 0),
            serde_json::to_vec(&IdentityState {
                cookies: vec![],
                origins: vec![],
                account_name: Some("first@example.com".into()),
                app_url: None,
            })
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(&dir.join("not-an-identity.json"), b"{}").await.unwrap();

        let roster = load_roster(&dir).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].auth_index, 0);
        assert_eq!(roster[0].email.as_deref(), Some("first@example.com"));
        assert_eq!(roster[1].auth_index, 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
