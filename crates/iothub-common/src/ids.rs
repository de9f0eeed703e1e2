//! Identifier validation shared by certificate issuance and MQTT topics.
//!
//! Device and user identifiers end up in certificate subjects, DNS SANs, and
//! topic paths. A single character set keeps all three safe: no topic
//! separators or wildcards, and nothing an `Ia5String` SAN would reject.

use thiserror::Error;

/// Longest identifier accepted anywhere in the system
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Why an identifier was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Identifier was empty
    #[error("{kind} must not be empty")]
    Empty {
        /// What kind of identifier (e.g. "device id")
        kind: &'static str,
    },

    /// Identifier exceeded [`MAX_IDENTIFIER_LEN`]
    #[error("{kind} is {len} bytes, limit is {MAX_IDENTIFIER_LEN}")]
    TooLong {
        /// What kind of identifier
        kind: &'static str,
        /// Actual length in bytes
        len: usize,
    },

    /// Identifier contained a forbidden character
    #[error("{kind} contains invalid character {ch:?}")]
    InvalidCharacter {
        /// What kind of identifier
        kind: &'static str,
        /// The first offending character
        ch: char,
    },
}

/// Check that `value` is a usable identifier.
///
/// Allowed: ASCII letters, digits, `-`, `_`, `.`, `:`.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty { kind });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong {
            kind,
            len: value.len(),
        });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(IdentifierError::InvalidCharacter { kind, ch });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dev-1")]
    #[case("u1")]
    #[case("sensor_07.greenhouse")]
    #[case("urn:dev:42")]
    fn accepts_plain_identifiers(#[case] id: &str) {
        assert!(validate_identifier("device id", id).is_ok());
    }

    #[rstest]
    #[case("dev/1", '/')]
    #[case("dev+", '+')]
    #[case("#", '#')]
    #[case("dev 1", ' ')]
    #[case("dév", 'é')]
    fn rejects_topic_metacharacters_and_non_ascii(#[case] id: &str, #[case] bad: char) {
        assert_eq!(
            validate_identifier("device id", id),
            Err(IdentifierError::InvalidCharacter {
                kind: "device id",
                ch: bad
            })
        );
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert_eq!(
            validate_identifier("user id", ""),
            Err(IdentifierError::Empty { kind: "user id" })
        );

        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            validate_identifier("user id", &long),
            Err(IdentifierError::TooLong { len, .. }) if len == MAX_IDENTIFIER_LEN + 1
        ));
    }
}
