//! Murmur-based short content ids.

const SEED: u32 = 0;

/// Returns the low 64 bits of the Murmur3 x64_128 digest of `bytes` as
/// 16 lowercase hex characters.
pub fn content_id(bytes: &[u8]) -> String {
    let (low, _high) = mur3::murmurhash3_x64_128(bytes, SEED);
    format!("{low:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_deterministic() {
        let first = content_id(b"{\"tool\":{}}");
        let second = content_id(b"{\"tool\":{}}");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_id_differs_for_different_input() {
        assert_ne!(content_id(b"stamp-a"), content_id(b"stamp-b"));
    }

    #[test]
    fn content_id_of_empty_input() {
        assert_eq!(content_id(b"").len(), 16);
    }
}
