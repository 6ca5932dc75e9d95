//! Connection codes.
//!
//! A code is 16 symbols from the Crockford base32 alphabet, shown as
//! `XXXX-XXXX-XXXX-XXXX`. Input is case-insensitive and tolerant of the
//! usual look-alikes (`O`/`0`, `I`/`L`/`1`).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Crockford base32: digits plus uppercase letters without I, L, O, U.
pub const CODE_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of symbols in a code
pub const CODE_LENGTH: usize = 16;

/// Symbols per display group
pub const CODE_GROUP_SIZE: usize = 4;

/// Minimum entropy a code must carry
pub const MIN_ENTROPY_BITS: f64 = 71.0;

/// Consecutive collisions tolerated before giving up
const MAX_COLLISION_RETRIES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("code must have {expected} symbols, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid character '{0}' in code")]
    InvalidCharacter(char),
    #[error("code space exhausted after {0} attempts")]
    Exhausted(usize),
}

/// Entropy in bits of a uniformly drawn code.
pub fn entropy_bits(alphabet_len: usize, length: usize) -> f64 {
    length as f64 * (alphabet_len as f64).log2()
}

/// A validated connection code, stored in canonical form (uppercase, no separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Code(String);

impl Code {
    /// Canonical form without separators
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Grouped form for display, e.g. `7K3M-Q9XZ-0PA4-HT2C`
    pub fn display_form(&self) -> String {
        self.0
            .as_bytes()
            .chunks(CODE_GROUP_SIZE)
            .map(|group| String::from_utf8_lossy(group).into_owned())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Parse user input into a code.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let mut canonical = String::with_capacity(CODE_LENGTH);
        for c in input.chars() {
            if c == '-' || c.is_whitespace() {
                continue;
            }
            let folded = match c.to_ascii_uppercase() {
                'O' => '0',
                'I' | 'L' => '1',
                other => other,
            };
            if !folded.is_ascii() || !CODE_ALPHABET.contains(&(folded as u8)) {
                return Err(CodeError::InvalidCharacter(c));
            }
            canonical.push(folded);
        }

        if canonical.len() != CODE_LENGTH {
            return Err(CodeError::InvalidLength {
                expected: CODE_LENGTH,
                actual: canonical.len(),
            });
        }

        Ok(Self(canonical))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_form())
    }
}

impl FromStr for Code {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Code {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Code> for String {
    fn from(code: Code) -> Self {
        code.display_form()
    }
}

/// Draws codes from the operating system seeded CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeGenerator;

impl CodeGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Draw one uniformly random code.
    pub fn draw(&self) -> Code {
        // ThreadRng is a ChaCha12 CSPRNG reseeded from the OS
        let mut rng = rand::rng();
        let code = (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Code(code)
    }

    /// Draw a code not rejected by `is_taken`, re-rolling on collision.
    pub fn generate<F>(&self, mut is_taken: F) -> Result<Code, CodeError>
    where
        F: FnMut(&Code) -> bool,
    {
        for _ in 0..MAX_COLLISION_RETRIES {
            let candidate = self.draw();
            if !is_taken(&candidate) {
                return Ok(candidate);
            }
            tracing::warn!("Code collision, re-rolling");
        }
        Err(CodeError::Exhausted(MAX_COLLISION_RETRIES))
    }
}
