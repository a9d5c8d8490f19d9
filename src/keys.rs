//! Store key derivation.
//!
//! Both record kinds are keyed by a namespaced digest of their identity:
//! descriptors over the submitted query body, series over name + tag set.
//! serde_json serializes object keys in sorted order, so the digest is stable
//! regardless of the order fields arrived in.

use serde_json::Value;

/// Namespace for query descriptor records.
pub const KQUERY_NAMESPACE: &str = "kquery";

/// Namespace for series records.
pub const MTS_NAMESPACE: &str = "mts";

/// Derive the store key for an identity value under a namespace.
pub fn create_key(identity: &Value, namespace: &str) -> String {
    let canonical =
        serde_json::to_string(identity).expect("JSON values always serialize");
    let digest = blake3::hash(canonical.as_bytes());
    format!("tscached:{namespace}:{}", digest.to_hex())
}
