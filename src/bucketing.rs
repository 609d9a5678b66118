//! Bucketing primitive.
//!
//! Maps `(user, scope key, attribute, salt)` to a bucket in `[0,1)`. The
//! exact formula is wire-interop critical: it must bit-match peer SDK
//! implementations of the same protocol, and the golden values in the tests
//! below pin it.
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::user::User;

/// Denominator for the 15-hex-digit (60-bit) hash prefix.
const LONG_SCALE: f64 = 0xFFFF_FFFF_FFFF_FFF_u64 as f64;

/// Compute the user's bucket for a flag or segment rollout.
///
/// `scope_key` is the key of the flag or segment the rollout belongs to;
/// `bucket_by` names the user attribute supplying the identity (usually
/// `"key"`). Users with no bucketable value for the attribute land in
/// bucket `0`.
pub fn bucket_user(user: &User, scope_key: &str, bucket_by: &str, salt: &str) -> f64 {
    let Some(mut id) = bucketable_value(user.attribute(bucket_by)) else {
        return 0.0;
    };

    if let Some(secondary) = &user.secondary {
        id.push('.');
        id.push_str(secondary);
    }

    let digest = Sha1::digest(format!("{scope_key}.{salt}.{id}").as_bytes());
    let prefix = &hex::encode(digest)[..15];
    // 15 hex digits always parse into a u64.
    let n = u64::from_str_radix(prefix, 16).expect("15 hex digits fit in u64");

    n as f64 / LONG_SCALE
}

/// Strings pass through and integers are rendered in base-10. Floats and
/// all other types have no bucketable form.
fn bucketable_value(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}
