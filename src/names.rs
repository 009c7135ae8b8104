// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming of the OS objects backing a channel. Each ring needs three names:
// the shared-memory location plus the two sync objects. POSIX additionally
// restricts shm names in length and form, so overlong names are shortened
// to a hash-suffixed form.

use rand::Rng;

use crate::descriptor::{Direction, RegionSpec};

/// FNV-1a 64-bit hash used for name shortening.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Maximum length for POSIX shm names. 0 disables truncation.
///
/// macOS caps names at `PSHMNAMLEN` (31); Linux allows 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce an OS-safe object name (POSIX form carries a leading '/').
///
/// Names longer than [`SHM_NAME_MAX`] become `/<prefix>_<16-hex-hash>`,
/// keeping a readable prefix for debugging.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if SHM_NAME_MAX > HASH_SUFFIX_LEN + 1 {
        SHM_NAME_MAX - HASH_SUFFIX_LEN - 1
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let hex = to_hex(hash);
    let hex_str = std::str::from_utf8(&hex).unwrap();

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        let original_body = &result[1..];
        let take = prefix_len.min(original_body.len());
        shortened.push_str(&original_body[..take]);
    }
    shortened.push('_');
    shortened.push_str(hex_str);
    shortened
}

/// Random base name for a channel whose configuration names none.
pub fn random_channel_name() -> String {
    let tag: u64 = rand::rng().random();
    format!("CHAN_{tag:016x}")
}

/// Derive the three OS object names for one ring of a channel.
///
/// The server's transmit ring is the `response` ring, its receive ring the
/// `request` ring; the accessing side opens them with directions swapped.
pub fn region_spec(base: &str, direction: Direction) -> RegionSpec {
    let dir = match direction {
        Direction::Request => "REQUEST",
        Direction::Response => "RESPONSE",
    };
    RegionSpec {
        location: format!("SHMC_SHARED_{dir}_{base}"),
        sync_tx: format!("SHMC_TX_SYNC_{dir}_{base}"),
        sync_rx: format!("SHMC_RX_SYNC_{dir}_{base}"),
        direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn make_shm_name_prepends_slash() {
        let name = make_shm_name("foo");
        assert!(name.starts_with('/'));
        assert!(name.contains("foo"));
    }

    #[test]
    fn make_shm_name_keeps_existing_slash() {
        let name = make_shm_name("/bar");
        assert_eq!(&name[..4], "/bar");
    }

    #[test]
    fn random_names_differ() {
        assert_ne!(random_channel_name(), random_channel_name());
    }

    #[test]
    fn region_spec_embeds_direction() {
        let spec = region_spec("X1", Direction::Request);
        assert!(spec.location.contains("REQUEST"));
        assert!(spec.sync_tx.contains("TX_SYNC_REQUEST"));
        assert!(spec.sync_rx.contains("RX_SYNC_REQUEST"));
    }
}
