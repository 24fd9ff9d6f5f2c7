//! Identifier generation for dialogs and transactions.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// RFC 3261 §8.1.1.7: every Via branch starts with the magic cookie.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

pub const USER_AGENT: &str = concat!("gblink/", env!("CARGO_PKG_VERSION"));

/// A lowercase alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// A fresh Via branch.
pub fn branch() -> String {
    format!("{BRANCH_MAGIC}{}", random_token(9))
}

/// A From/To tag.
pub fn tag() -> String {
    format!("gblink{}", random_token(8))
}

/// A Call-ID, stable for the lifetime of one dialog.
pub fn call_id() -> String {
    random_token(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_carries_the_magic_cookie() {
        let b = branch();
        assert!(b.starts_with(BRANCH_MAGIC));
        assert!(b.len() > BRANCH_MAGIC.len());
    }

    #[test]
    fn tokens_are_lowercase_alphanumeric() {
        let t = random_token(32);
        assert_eq!(t.len(), 32);
        assert!(t.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn call_ids_differ() {
        assert_ne!(call_id(), call_id());
    }
}
