//! Dedup hashes for clip items
//!
//! Two copies with equal content produce the same SHA-256 hex digest, so the
//! history store can collapse them into one row.

use crate::interface::ContentType;
use sha2::{Digest, Sha256};

/// Separator between file paths before hashing
const FILE_PATH_SEPARATOR: &str = "|";

/// Lowercase hex SHA-256 of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{:x}", digest)
}

/// Compute the dedup hash for a classified copy.
///
/// Images without bytes hash a random value and therefore never deduplicate.
/// File hashes depend on path order.
pub fn content_hash(
    content_type: ContentType,
    text: Option<&str>,
    image_data: Option<&[u8]>,
    file_paths: Option<&[String]>,
) -> String {
    match content_type {
        ContentType::Text | ContentType::RichText | ContentType::Url | ContentType::Color => {
            sha256_hex(text.unwrap_or_default().as_bytes())
        }
        ContentType::Image => match image_data {
            Some(bytes) => sha256_hex(bytes),
            None => {
                let nonce: [u8; 32] = rand::random();
                sha256_hex(&nonce)
            }
        },
        ContentType::File => {
            let joined = file_paths.unwrap_or_default().join(FILE_PATH_SEPARATOR);
            sha256_hex(joined.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            content_hash(ContentType::Text, None, None, None),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_text_hash_is_deterministic() {
        let a = content_hash(ContentType::Text, Some("Hello"), None, None);
        let b = content_hash(ContentType::Text, Some("Hello"), None, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_textual_types_share_digest() {
        let text = content_hash(ContentType::Text, Some("#fff"), None, None);
        let color = content_hash(ContentType::Color, Some("#fff"), None, None);
        assert_eq!(text, color);
    }

    #[test]
    fn test_image_hash_uses_bytes() {
        let bytes = vec![0x89, b'P', b'N', b'G'];
        let a = content_hash(ContentType::Image, None, Some(bytes.as_slice()), None);
        assert_eq!(a, sha256_hex(&bytes));
    }

    #[test]
    fn test_image_without_bytes_never_collides() {
        let a = content_hash(ContentType::Image, None, None, None);
        let b = content_hash(ContentType::Image, None, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_hash_is_order_sensitive() {
        let ab = vec!["/a".to_string(), "/b".to_string()];
        let ba = vec!["/b".to_string(), "/a".to_string()];
        let h_ab = content_hash(ContentType::File, None, None, Some(ab.as_slice()));
        let h_ba = content_hash(ContentType::File, None, None, Some(ba.as_slice()));
        assert_ne!(h_ab, h_ba);
        assert_eq!(h_ab, sha256_hex(b"/a|/b"));
    }
}
