//! Shared key generation for blob storage backends.

use uuid::Uuid;

/// Logical area a blob is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobArea {
    Accepted,
    Quarantine,
}

impl BlobArea {
    pub fn prefix(&self) -> &'static str {
        match self {
            BlobArea::Accepted => "accepted",
            BlobArea::Quarantine => "quarantine",
        }
    }
}

/// File extension for a declared media type. Unknown types get `bin`.
pub fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Generate the content-addressed key for a blob.
///
/// All backends must use this format so that identical bytes from one tenant
/// land on the same key.
pub fn blob_key(area: BlobArea, tenant_id: Uuid, content_hash: &str, media_type: &str) -> String {
    let shard = content_hash.get(..2).unwrap_or("00");
    format!(
        "{}/{}/{}/{}.{}",
        area.prefix(),
        tenant_id,
        shard,
        content_hash,
        extension_for(media_type)
    )
}

/// Rewrite a key from one area into another, keeping the rest of the path.
pub fn rebase_key(storage_key: &str, area: BlobArea) -> Option<String> {
    let (_, rest) = storage_key.split_once('/')?;
    Some(format!("{}/{}", area.prefix(), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key_layout() {
        let tenant = Uuid::nil();
        let key = blob_key(BlobArea::Accepted, tenant, "abcdef", "image/png");
        assert_eq!(key, format!("accepted/{}/ab/abcdef.png", tenant));
    }

    #[test]
    fn test_rebase_into_quarantine() {
        let key = blob_key(BlobArea::Accepted, Uuid::nil(), "abcdef", "image/jpeg");
        let moved = rebase_key(&key, BlobArea::Quarantine).unwrap();
        assert!(moved.starts_with("quarantine/"));
        assert!(moved.ends_with("/ab/abcdef.jpg"));
    }
}
