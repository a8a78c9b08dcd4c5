//! Node identity: RSA keypair and its fixed-width peer-id encoding.
//!
//! Each node generates a keypair at start and is addressed by its
//! [`PeerId`], a 32-character rendering of the public key: the decimal
//! modulus `n` right-padded with `'#'` to 16 characters, then the decimal
//! exponent `e` padded the same way.
//!
//! The keys are deliberately tiny — payload confidentiality is out of
//! scope, so they serve purely as addressable identity material. The one
//! hard requirement is that both decimal components fit the 16-character
//! encoding budget, which the generator guarantees by drawing 16-bit
//! primes.

use std::fmt;

use rand::Rng;
use thiserror::Error;

/// Exact length of an encoded peer id.
pub const PEER_ID_LEN: usize = 32;

/// Width of each padded decimal component inside a peer id.
const COMPONENT_LEN: usize = 16;

/// Padding character filling each component up to [`COMPONENT_LEN`].
const PAD: char = '#';

/// Public RSA exponent. Re-drawn keypairs guarantee it is coprime with φ(n).
const PUBLIC_EXPONENT: u64 = 65_537;

/// Errors from peer-id encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("peer id must be exactly {PEER_ID_LEN} characters, got {0}")]
    BadLength(usize),

    #[error("peer id component {0:?} is not a decimal number")]
    BadComponent(String),

    #[error("key component {0} exceeds the {COMPONENT_LEN}-character encoding budget")]
    TooLarge(u64),
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An RSA public key: modulus and public exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    pub n: u64,
    pub e: u64,
}

/// An RSA private key: modulus and private exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateKey {
    pub n: u64,
    pub d: u64,
}

/// A generated keypair. The private half is held in node state for the
/// node's lifetime; only the public half ever leaves the process.
#[derive(Debug, Clone, Copy)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generates a fresh keypair from two random 16-bit primes.
    ///
    /// `e` is fixed at 65537; prime pairs whose totient shares a factor
    /// with it are re-drawn. The resulting modulus is below 2^32, so both
    /// decimal components always fit the peer-id encoding budget.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> KeyPair {
        loop {
            let p = random_prime(rng);
            let q = loop {
                let q = random_prime(rng);
                if q != p {
                    break q;
                }
            };
            let n = p * q;
            let phi = (p - 1) * (q - 1);
            if gcd(PUBLIC_EXPONENT, phi) != 1 {
                continue;
            }
            let Some(d) = mod_inverse(PUBLIC_EXPONENT, phi) else {
                continue;
            };
            return KeyPair {
                public: PublicKey {
                    n,
                    e: PUBLIC_EXPONENT,
                },
                private: PrivateKey { n, d },
            };
        }
    }
}

/// Draws a random prime in `[2^15, 2^16)`.
fn random_prime<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    loop {
        let candidate = rng.gen_range(1u64 << 15..1u64 << 16) | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

/// Trial-division primality check, sufficient for 16-bit candidates.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut div = 3;
    while div * div <= n {
        if n % div == 0 {
            return false;
        }
        div += 2;
    }
    true
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Modular inverse of `a` modulo `m` via the extended Euclidean algorithm.
fn mod_inverse(a: u64, m: u64) -> Option<u64> {
    let (mut old_r, mut r) = (a as i128, m as i128);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let quotient = old_r / r;
        (old_r, r) = (r, old_r - quotient * r);
        (old_s, s) = (s, old_s - quotient * s);
    }
    if old_r != 1 {
        return None;
    }
    Some(old_s.rem_euclid(m as i128) as u64)
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// The 32-character textual identity derived from a public key.
///
/// Construction always validates, so any held `PeerId` decodes cleanly.
/// Ids are compared and hashed as plain strings — two nodes with the same
/// public key are the same addressable identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Encodes a public key into its padded 32-character form.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::TooLarge` when a component's decimal rendering
    /// exceeds 16 characters.
    pub fn from_public_key(key: &PublicKey) -> Result<Self, KeyError> {
        let n = key.n.to_string();
        let e = key.e.to_string();
        if n.len() > COMPONENT_LEN {
            return Err(KeyError::TooLarge(key.n));
        }
        if e.len() > COMPONENT_LEN {
            return Err(KeyError::TooLarge(key.e));
        }
        Ok(PeerId(format!("{n:#<16}{e:#<16}")))
    }

    /// Parses and validates a peer id from text (e.g. a QUERY payload or
    /// a prompt argument).
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.len() != PEER_ID_LEN {
            return Err(KeyError::BadLength(s.len()));
        }
        decode_component(&s[..COMPONENT_LEN])?;
        decode_component(&s[COMPONENT_LEN..])?;
        Ok(PeerId(s.to_string()))
    }

    /// Decodes the peer id back into the public key it encodes.
    pub fn to_public_key(&self) -> Result<PublicKey, KeyError> {
        let n = decode_component(&self.0[..COMPONENT_LEN])?;
        let e = decode_component(&self.0[COMPONENT_LEN..])?;
        Ok(PublicKey { n, e })
    }

    /// The id as its 32-character string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips the padding from one 16-character component and parses the
/// decimal number in front of it.
fn decode_component(component: &str) -> Result<u64, KeyError> {
    let digits = component.trim_end_matches(PAD);
    digits
        .parse::<u64>()
        .map_err(|_| KeyError::BadComponent(component.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// m^exp mod n, used to exercise the RSA invariant.
    fn pow_mod(mut base: u128, mut exp: u64, modulus: u128) -> u128 {
        let mut acc = 1u128;
        base %= modulus;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc * base % modulus;
            }
            base = base * base % modulus;
            exp >>= 1;
        }
        acc
    }

    #[test]
    fn generated_keys_satisfy_rsa_roundtrip() {
        let mut rng = rand::thread_rng();
        let keys = KeyPair::generate(&mut rng);
        for m in [2u128, 42, 65_000, 999_983] {
            let m = m % keys.public.n as u128;
            let c = pow_mod(m, keys.public.e, keys.public.n as u128);
            let back = pow_mod(c, keys.private.d, keys.private.n as u128);
            assert_eq!(back, m);
        }
    }

    #[test]
    fn peer_id_encoding_is_padded_to_32() {
        let key = PublicKey { n: 123_457, e: 65_537 };
        let id = PeerId::from_public_key(&key).unwrap();
        assert_eq!(id.as_str().len(), PEER_ID_LEN);
        assert_eq!(id.as_str(), "123457##########65537###########");
    }

    #[test]
    fn peer_id_key_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let keys = KeyPair::generate(&mut rng);
            let id = PeerId::from_public_key(&keys.public).unwrap();
            assert_eq!(id.to_public_key().unwrap(), keys.public);
        }
    }

    #[test]
    fn peer_id_text_roundtrip() {
        let id = PeerId::parse("9999999999999999123#############").unwrap();
        let reencoded = PeerId::from_public_key(&id.to_public_key().unwrap()).unwrap();
        assert_eq!(reencoded, id);
    }

    #[test]
    fn oversized_component_rejected() {
        let key = PublicKey {
            n: 12_345_678_901_234_567,
            e: 65_537,
        };
        assert_eq!(
            PeerId::from_public_key(&key),
            Err(KeyError::TooLarge(12_345_678_901_234_567))
        );
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!(matches!(
            PeerId::parse("too-short"),
            Err(KeyError::BadLength(9))
        ));
        assert!(matches!(
            PeerId::parse("x###############65537###########"),
            Err(KeyError::BadComponent(_))
        ));
        // All-padding component has no digits to parse.
        assert!(PeerId::parse("################65537###########").is_err());
    }
}
