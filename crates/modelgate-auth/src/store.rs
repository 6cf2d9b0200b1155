use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::record::Auth;

/// Persistence for credential records.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn save(&self, auth: &Auth) -> io::Result<()>;
    async fn delete(&self, provider: &str, id: &str) -> io::Result<()>;
    async fn load_all(&self) -> io::Result<Vec<Auth>>;
}

/// One JSON file per credential at `<dir>/<provider>/<id>.json`.
///
/// Writes go to `<path>.tmp` first and are renamed into place, so readers
/// never observe a torn file.
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    dir: PathBuf,
}

impl FileAuthStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, provider: &str, id: &str) -> PathBuf {
        self.dir
            .join(sanitize(provider))
            .join(format!("{}.json", sanitize(id)))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn save(&self, auth: &Auth) -> io::Result<()> {
        let path = self.path_for(&auth.provider, &auth.id);
        let parent = path.parent().expect("store paths have a parent");
        tokio::fs::create_dir_all(parent).await?;

        let body = serde_json::to_vec_pretty(auth)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn delete(&self, provider: &str, id: &str) -> io::Result<()> {
        let path = self.path_for(provider, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn load_all(&self) -> io::Result<Vec<Auth>> {
        let mut out = Vec::new();
        let mut providers = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err),
        };
        while let Some(entry) = providers.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(file.path()).await?;
                match serde_json::from_slice::<Auth>(&bytes) {
                    Ok(auth) => out.push(auth),
                    Err(err) => {
                        tracing::warn!(path = %file.path().display(), %err, "skipping unreadable auth file");
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn save_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());

        let mut auth = Auth::new("gemini-apikey-abc", "gemini", datetime!(2025-06-01 00:00:00 UTC));
        auth.label = "gemini-apikey".to_string();
        auth.attributes
            .insert("api_key".to_string(), "AIza".to_string());
        store.save(&auth).await.unwrap();

        // No stray tmp file remains after the rename.
        let path = dir.path().join("gemini").join("gemini-apikey-abc.json");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], auth);

        store.delete("gemini", "gemini-apikey-abc").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        // Deleting a missing file is not an error.
        store.delete("gemini", "gemini-apikey-abc").await.unwrap();
    }
}
