//! Durable credential persistence with crash-safe overwrite semantics.
//!
//! The store is the single authoritative owner of the process-wide
//! [`Session`]. All mutation goes through whole-session operations guarded by
//! one lock, so concurrent retrieval operations racing to refresh cookies
//! each observe a consistent snapshot and merges are applied atomically per
//! call.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::session::{Session, parse_credential_document};

/// File-backed store for the authoritative [`Session`].
pub struct CredentialStore {
    path: PathBuf,
    session: Mutex<Option<Session>>,
}

impl CredentialStore {
    /// A store over the given credential file. Nothing is read until the
    /// first [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted session, normalising whichever on-disk form is
    /// found to the flat cookie map.
    ///
    /// Returns `Ok(None)` for every "no usable session" condition: missing
    /// file, empty or unparseable document, or a cookie set lacking the
    /// required identity cookies. Only I/O failures on an existing file are
    /// surfaced as errors.
    pub fn load(&self) -> Result<Option<Session>, StoreError> {
        let mut guard = self.session.lock().expect("credential store lock poisoned");
        if let Some(session) = guard.as_ref() {
            return Ok(Some(session.clone()));
        }

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("credential file not found: {}", self.path.display());
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        let cookies = match parse_credential_document(&content) {
            Ok(cookies) => cookies,
            Err(err) => {
                log::warn!(
                    "credential file {} unusable ({err}); treating as no session",
                    self.path.display()
                );
                return Ok(None);
            }
        };

        let session = Session::from_cookies(cookies);
        if !session.has_required_keys() {
            log::warn!(
                "credential file missing identity cookies {:?}; login required",
                session.missing_required_keys()
            );
            return Ok(None);
        }

        log::info!(
            "loaded session with {} cookies from {}",
            session.len(),
            self.path.display()
        );
        *guard = Some(session.clone());
        Ok(Some(session))
    }

    /// Atomic overwrite of the persisted session (temp file + rename).
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut guard = self.session.lock().expect("credential store lock poisoned");
        self.persist(session)?;
        *guard = Some(session.clone());
        Ok(())
    }

    /// Union `cookies` into the current session and persist the result.
    /// New values win on conflict. Returns the merged snapshot.
    pub fn merge<I, K, V>(&self, cookies: I) -> Result<Session, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut guard = self.session.lock().expect("credential store lock poisoned");
        let mut session = guard.clone().unwrap_or_default();
        let changed = session.merge(cookies);
        if changed > 0 {
            self.persist(&session)?;
            log::debug!("merged {changed} cookie(s) into session");
        }
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop the session entirely (forced re-login path).
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.session.lock().expect("credential store lock poisoned");
        self.persist(&Session::new())?;
        *guard = None;
        log::info!("cleared persisted session");
        Ok(())
    }

    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let cookies: std::collections::BTreeMap<&str, &str> = session.cookies().collect();
        let body = serde_json::to_string_pretty(&cookies)?;

        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(directory)?;
        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        temp.write_all(body.as_bytes())?;
        temp.flush()?;
        temp.persist(&self.path)
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

/// Failures of the persistence layer itself. Absent or unusable documents
/// are not errors; they surface as `Ok(None)` from [`CredentialStore::load`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("cookies.json"))
    }

    fn full_session() -> Session {
        Session::from_cookies([
            ("UserToken", "tok"),
            ("UserInfo", "info"),
            ("UserName", "alice"),
        ])
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let session = full_session();

        store.save(&session).unwrap();

        // Force a disk read through a second store over the same file.
        let reloaded = store_in(&dir).load().unwrap().expect("session expected");
        assert_eq!(reloaded.cookie_header(), session.cookie_header());
    }

    #[test]
    fn persisted_form_is_a_flat_string_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut session = full_session();
        session.mark_verified();
        store.save(&session).unwrap();

        // On disk the document stays interchangeable with a raw browser
        // export: cookie names to values, nothing else.
        let raw = std::fs::read_to_string(dir.path().join("cookies.json")).unwrap();
        let parsed: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), session.len());
        assert_eq!(parsed.get("UserToken").map(String::as_str), Some("tok"));
    }

    #[test]
    fn missing_file_is_no_session() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(&dir).load().unwrap().is_none());
    }

    #[test]
    fn missing_identity_cookie_is_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, r#"{"UserToken": "tok", "UserName": "alice"}"#).unwrap();

        assert!(CredentialStore::new(&path).load().unwrap().is_none());
    }

    #[test]
    fn garbage_document_is_no_session_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "<<< definitely not json or cookies >>>").unwrap();

        assert!(CredentialStore::new(&path).load().unwrap().is_none());
    }

    #[test]
    fn loads_browser_export_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "UserToken", "value": "tok"},
                {"name": "UserInfo", "value": "info"},
                {"name": "UserName", "value": "alice"}
            ]"#,
        )
        .unwrap();

        let session = CredentialStore::new(&path).load().unwrap().unwrap();
        assert!(session.has_required_keys());
    }

    #[test]
    fn merge_persists_and_new_values_win() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&full_session()).unwrap();

        let merged = store
            .merge([("UserName", "bob"), ("waf_clearance", "xyz")])
            .unwrap();
        assert_eq!(merged.get("UserName"), Some("bob"));

        let reloaded = store_in(&dir).load().unwrap().unwrap();
        assert_eq!(reloaded.get("waf_clearance"), Some("xyz"));
    }

    #[test]
    fn clear_drops_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&full_session()).unwrap();

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
