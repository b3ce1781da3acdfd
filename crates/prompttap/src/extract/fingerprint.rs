//! Content fingerprints
//!
//! A fingerprint is a pure function of the normalized text, the cascade id
//! and the time bucket of the capture, so the same prompt seen on both
//! capture paths collapses to one record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const SEPARATOR: &[u8] = b"\x1f";
const DIGEST_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(normalized_text: &str, cascade_id: &str, bucket: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized_text.as_bytes());
        hasher.update(SEPARATOR);
        hasher.update(cascade_id.as_bytes());
        hasher.update(SEPARATOR);
        hasher.update(bucket.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..DIGEST_BYTES]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Trim and collapse whitespace runs to a single space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn time_bucket(timestamp: DateTime<Utc>, bucket_secs: u64) -> i64 {
    let width = bucket_secs.max(1) as i64;
    timestamp.timestamp().div_euclid(width)
}

/// Inputs of a fingerprint, kept so neighbouring buckets can be derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintKey {
    text: String,
    cascade_id: String,
    bucket: i64,
}

impl FingerprintKey {
    pub fn new(
        text: &str,
        cascade_id: Option<&str>,
        timestamp: DateTime<Utc>,
        bucket_secs: u64,
    ) -> Self {
        Self {
            text: normalize_text(text),
            cascade_id: cascade_id.unwrap_or_default().to_string(),
            bucket: time_bucket(timestamp, bucket_secs),
        }
    }

    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.text, &self.cascade_id, self.bucket)
    }

    /// Digest of the text and cascade id alone, shared by every bucket
    pub fn content_digest(&self) -> ContentDigest {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hasher.update(SEPARATOR);
        hasher.update(self.cascade_id.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; DIGEST_BYTES];
        out.copy_from_slice(&digest[..DIGEST_BYTES]);
        ContentDigest(out)
    }
}

/// Bucket-independent identity of a prompt's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; DIGEST_BYTES]);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_fingerprint_is_pure() {
        // ...010 opens a 30s bucket and ...020 falls inside it
        let a = FingerprintKey::new("hello world", Some("abc"), at(1_700_000_010), 30);
        let b = FingerprintKey::new("  hello \n\t world ", Some("abc"), at(1_700_000_020), 30);
        assert_eq!(a.bucket(), b.bucket());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 32);
        assert!(a.fingerprint().as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let base = FingerprintKey::new("hello", Some("abc"), at(1_700_000_000), 30).fingerprint();
        let other_cascade = FingerprintKey::new("hello", Some("xyz"), at(1_700_000_000), 30).fingerprint();
        let other_bucket = FingerprintKey::new("hello", Some("abc"), at(1_700_000_090), 30).fingerprint();
        let other_text = FingerprintKey::new("hello!", Some("abc"), at(1_700_000_000), 30).fingerprint();

        assert_ne!(base, other_cascade);
        assert_ne!(base, other_bucket);
        assert_ne!(base, other_text);
    }

    #[test]
    fn test_empty_text_still_fingerprints() {
        let fp = FingerprintKey::new("   ", None, at(0), 30).fingerprint();
        assert_eq!(fp.as_str().len(), 32);
    }

    #[test]
    fn test_bucket_edge_changes_fingerprint() {
        let before = FingerprintKey::new("hello", Some("abc"), at(1_700_000_009), 30);
        let after = FingerprintKey::new("hello", Some("abc"), at(1_700_000_010), 30);
        assert_eq!(after.bucket(), before.bucket() + 1);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_content_digest_ignores_bucket() {
        let key = FingerprintKey::new("hi", None, at(60), 30);
        let later = FingerprintKey::new(" hi ", None, at(95), 30);
        let other = FingerprintKey::new("hi", Some("c1"), at(60), 30);
        assert_eq!(key.content_digest(), later.content_digest());
        assert_ne!(key.content_digest(), other.content_digest());
    }

    #[test]
    fn test_time_bucket_handles_negative_time() {
        assert_eq!(time_bucket(at(-1), 30), -1);
        assert_eq!(time_bucket(at(29), 30), 0);
        assert_eq!(time_bucket(at(30), 0), 30);
    }
}
