#![forbid(unsafe_code)]

// Media attachment gatekeeper - validation rules and the on-disk store for
// uploaded binary attachments. Stored files are named by the server; the
// client-supplied name is never used for storage, which is what strips any
// metadata the original name carried.

use crate::error::{ChatError, ChatResult};
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard cap on a single attachment, checked against the declared size and
/// re-checked against the decoded payload.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Sanity floor: anything smaller than this is not a real media file.
pub const MIN_UPLOAD_BYTES: usize = 16;

/// Client filenames are echoed back as display text only, truncated here.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Allow-list of declared MIME types, each mapped to one fixed extension.
pub fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "audio/wav" => Some("wav"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

/// Decodes a base64 upload payload, tolerating an optional data-URL prefix.
pub fn decode_payload(data: &str) -> ChatResult<Vec<u8>> {
    let raw = if data.starts_with("data:") {
        match data.split_once("base64,") {
            Some((_, rest)) => rest,
            None => return Err(ChatError::Corrupt),
        }
    } else {
        data
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|_| ChatError::Corrupt)?;

    if bytes.len() < MIN_UPLOAD_BYTES {
        return Err(ChatError::Corrupt);
    }
    Ok(bytes)
}

/// Collision-resistant stored name: time-based prefix, random suffix, and
/// the extension mapped from the declared type.
pub fn generate_name(ext: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{millis}-{}.{ext}", Uuid::new_v4().simple())
}

/// Truncates a client filename for display, on a char boundary.
pub fn truncate_display_name(name: &str) -> String {
    name.chars().take(MAX_DISPLAY_NAME_LEN).collect()
}

/// On-disk attachment store rooted at a single upload directory.
#[derive(Clone)]
pub struct AttachmentStore {
    dir: Arc<PathBuf>,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.dir.as_path()).await
    }

    /// Writes the decoded payload under the generated name.
    pub async fn persist(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(self.dir.join(name), bytes).await
    }

    /// Public fetch path for a stored name.
    pub fn public_path(name: &str) -> String {
        format!("/uploads/{name}")
    }

    /// Deletes every name in a room's manifest, best-effort: individual
    /// failures are logged and the purge continues.
    pub async fn purge(&self, names: &[String]) {
        for name in names {
            let path = self.dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Purged attachment {}", name),
                Err(e) => warn!("Failed to purge attachment {}: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn allow_list_maps_fixed_extensions() {
        assert_eq!(extension_for("image/png"), Some("png"));
        assert_eq!(extension_for("audio/mpeg"), Some("mp3"));
        assert_eq!(extension_for("application/x-msdownload"), None);
        assert_eq!(extension_for("text/html"), None);
    }

    #[test]
    fn decode_accepts_raw_and_data_url() {
        let bytes = b"0123456789abcdef-payload";
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert_eq!(decode_payload(&encoded).unwrap(), bytes);

        let with_prefix = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_payload(&with_prefix).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_garbage_and_tiny_payloads() {
        assert!(matches!(
            decode_payload("!!!not-base64!!!"),
            Err(ChatError::Corrupt)
        ));
        let tiny = base64::engine::general_purpose::STANDARD.encode(b"tiny");
        assert!(matches!(decode_payload(&tiny), Err(ChatError::Corrupt)));
        assert!(matches!(
            decode_payload("data:image/png;nothing"),
            Err(ChatError::Corrupt)
        ));
    }

    #[test]
    fn generated_names_never_reuse_client_input() {
        let a = generate_name("png");
        let b = generate_name("png");
        assert!(a.ends_with(".png"));
        assert_ne!(a, b);
    }

    #[test]
    fn display_name_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_DISPLAY_NAME_LEN + 10);
        let shown = truncate_display_name(&long);
        assert_eq!(shown.chars().count(), MAX_DISPLAY_NAME_LEN);
    }

    #[tokio::test]
    async fn persist_and_purge_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(tmp.path());
        store.ensure_dir().await.unwrap();

        let name = generate_name("png");
        store.persist(&name, b"0123456789abcdef").await.unwrap();
        assert!(tmp.path().join(&name).exists());

        store.purge(&[name.clone()]).await;
        assert!(!tmp.path().join(&name).exists());
    }

    #[tokio::test]
    async fn purge_continues_past_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(tmp.path());
        store.ensure_dir().await.unwrap();

        let kept = generate_name("jpg");
        store.persist(&kept, b"0123456789abcdef").await.unwrap();

        store.purge(&["missing.png".to_string(), kept.clone()]).await;
        assert!(!tmp.path().join(&kept).exists());
    }
}
