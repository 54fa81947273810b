//! Subscription keys and publish tokens

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Separator between token parts; form-urlencoding always escapes it.
const TOKEN_SEPARATOR: char = '~';

/// Identifies one logical feedback stream on a device
///
/// A key is the triple of a target (block or instance tag), an attribute name
/// and the attribute's indices. Indices are positional (channel, output, ...)
/// so their order is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub target: String,
    pub attribute: String,
    pub indices: Vec<u32>,
}

impl SubscriptionKey {
    pub fn new(
        target: impl Into<String>,
        attribute: impl Into<String>,
        indices: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
            indices: indices.into_iter().collect(),
        }
    }

    /// The publish token the device echoes in feedback for this key
    ///
    /// Target and attribute are form-urlencoded before joining, so the
    /// separator can only appear between parts and two different keys never
    /// produce the same token.
    pub fn token(&self) -> String {
        let mut token = String::new();
        token.extend(form_urlencoded::byte_serialize(self.target.as_bytes()));
        token.push(TOKEN_SEPARATOR);
        token.extend(form_urlencoded::byte_serialize(self.attribute.as_bytes()));
        for index in &self.indices {
            token.push(TOKEN_SEPARATOR);
            token.push_str(&index.to_string());
        }
        token
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)?;
        for index in &self.indices {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_token_is_deterministic() {
        let a = SubscriptionKey::new("Level1", "level", [1, 2]);
        let b = SubscriptionKey::new("Level1".to_string(), "level", vec![1, 2]);

        assert_eq!(a, b);
        assert_eq!(a.token(), b.token());
        assert_eq!(a.token(), "Level1~level~1~2");
    }

    #[test]
    fn test_index_order_is_significant() {
        let a = SubscriptionKey::new("Router", "input", [1, 2]);
        let b = SubscriptionKey::new("Router", "input", [2, 1]);
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_separator_in_names_does_not_collide() {
        let a = SubscriptionKey::new("a~b", "c", []);
        let b = SubscriptionKey::new("a", "b~c", []);
        assert_ne!(a.token(), b.token());
        assert!(a.token().starts_with("a%7Eb~"));
    }

    #[test]
    fn test_display() {
        let key = SubscriptionKey::new("Mute2", "mute", [3]);
        assert_eq!(key.to_string(), "Mute2.mute[3]");
    }

    proptest! {
        #[test]
        fn distinct_keys_have_distinct_tokens(
            t1 in ".{0,8}", a1 in ".{0,8}", i1 in proptest::collection::vec(0u32..64, 0..3),
            t2 in ".{0,8}", a2 in ".{0,8}", i2 in proptest::collection::vec(0u32..64, 0..3),
        ) {
            let k1 = SubscriptionKey::new(t1, a1, i1);
            let k2 = SubscriptionKey::new(t2, a2, i2);
            prop_assert_eq!(k1 == k2, k1.token() == k2.token());
        }
    }
}
