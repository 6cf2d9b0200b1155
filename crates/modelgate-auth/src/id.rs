use sha2::{Digest, Sha256};

/// Deterministic credential IDs.
///
/// The same `(kind, secret, base_url)` triple always yields the same ID,
/// so re-synthesizing a config produces stable identities and the watcher
/// can diff by ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableIdGenerator;

impl StableIdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Returns `(id, token)` where `token` is the short form embedded in
    /// `source` attributes.
    pub fn next(&self, kind: &str, secret: &str, base_url: &str) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b"|");
        hasher.update(secret.as_bytes());
        hasher.update(b"|");
        hasher.update(base_url.as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            hex.push_str(&format!("{byte:02x}"));
        }
        let token = hex[..8].to_string();
        let id = format!("{}-{}", kind.replace(':', "-"), &hex[..16]);
        (id, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic() {
        let generator = StableIdGenerator::new();
        let (id1, token1) = generator.next("gemini:apikey", "AIza-x", "");
        let (id2, token2) = generator.next("gemini:apikey", "AIza-x", "");
        assert_eq!(id1, id2);
        assert_eq!(token1, token2);
        assert!(id1.starts_with("gemini-apikey-"));
    }

    #[test]
    fn inputs_change_the_id() {
        let generator = StableIdGenerator::new();
        let (a, _) = generator.next("gemini:apikey", "AIza-x", "");
        let (b, _) = generator.next("gemini:apikey", "AIza-y", "");
        let (c, _) = generator.next("gemini:apikey", "AIza-x", "https://alt.example");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
