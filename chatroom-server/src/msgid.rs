//! ULID-based message ID generation.
//!
//! Each message gets a unique, creation-ordered identifier: a 26-character
//! Crockford base32 string (48 bits ms timestamp + 80 bits entropy).
//! IDs generated within the same millisecond increment the entropy part,
//! so lexicographic order always matches creation order in this process.

use parking_lot::{const_mutex, Mutex};
use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENTROPY_MASK: u128 = (1 << 80) - 1;

/// Last (timestamp, entropy) pair handed out.
static LAST: Mutex<(u64, u128)> = const_mutex((0, 0));

/// Generate a new ULID string, strictly greater than the previous one.
pub fn generate() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let (ts, entropy) = {
        let mut last = LAST.lock();
        let next = if now_ms > last.0 {
            let mut rng = rand::thread_rng();
            let hi: u16 = rng.r#gen();
            let lo: u64 = rng.r#gen();
            // Keep headroom so increments within the millisecond never overflow.
            (now_ms, ((hi as u128) << 64 | lo as u128) >> 1)
        } else if last.1 < ENTROPY_MASK {
            (last.0, last.1 + 1)
        } else {
            (last.0 + 1, 0)
        };
        *last = next;
        next
    };

    encode(ts, entropy)
}

fn encode(ts: u64, entropy: u128) -> String {
    let mut buf = [0u8; 26];

    let mut t = ts;
    for i in (0..10).rev() {
        buf[i] = CROCKFORD[(t & 0x1F) as usize];
        t >>= 5;
    }

    let mut r = entropy & ENTROPY_MASK;
    for i in (10..26).rev() {
        buf[i] = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    buf.iter().map(|&b| b as char).collect()
}
