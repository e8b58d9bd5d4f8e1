/// Hash functions for nodemesh.
///
/// FNV-1a gives stable, platform independent values for anything that must
/// agree across every node in the cluster (job minute offsets), and SHA-1
/// provides the keyed peer password.

use sha1::{Digest, Sha1};

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a string with the standard FNV-1a basis.
#[inline]
pub fn fnv_64a_str(s: &str) -> u64 {
    fnv_64a_buf(s.as_bytes(), FNV1A_64_INIT)
}

/// Minute-of-hour at which a job with the given identity runs.
///
/// Every node derives the same value, and different jobs spread out over
/// the hour instead of all firing at :00.
pub fn job_minute_of_hour(job_name: &str) -> u32 {
    (fnv_64a_str(job_name) % 60) as u32
}

/// Password a peer presents when logging on as `node_name`.
///
/// Lowercase hex SHA-1 of the node name keyed with the shared secret.
pub fn peer_password(node_name: &str, shared_secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(node_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(shared_secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
