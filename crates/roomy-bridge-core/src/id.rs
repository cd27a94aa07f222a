use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use snafu::Snafu;

use crate::Timestamp;

/// Crockford base32 alphabet used by ULIDs (no I, L, O, U).
const ULID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_STR_LEN: usize = 26;
const ULID_RAND_BITS: u32 = 80;

const fn build_ulid_decode_table() -> [u8; 256] {
    let mut table = [0xffu8; 256];
    let mut i = 0;
    while i < ULID_ALPHABET.len() {
        table[ULID_ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
}

const ULID_DECODE: [u8; 256] = build_ulid_decode_table();

/// A 128-bit time-ordered unique id, as used for every Roomy event.
///
/// Stored big-endian so that byte order (and therefore database key order)
/// matches time order. Displayed as the canonical 26-character Crockford
/// base32 string; the leading character can only carry 3 bits, so it must be
/// `0`-`7`.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid([u8; 16]);

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum UlidParseError {
    #[snafu(display("Invalid length {len}, expected 26"))]
    InvalidLength { len: usize },
    #[snafu(display("Invalid character `{char}`"))]
    InvalidChar { char: char },
    #[snafu(display("Leading character out of range"))]
    Overflow,
}

impl Ulid {
    pub const ZERO: Self = Self([0; 16]);

    /// Length of the nonce prefix used as a Discord idempotency token.
    pub const NONCE_LEN: usize = 25;

    pub fn generate() -> Self {
        let rand: u128 = rand::random::<u128>() & ((1u128 << ULID_RAND_BITS) - 1);
        Self::from_parts(Timestamp::now(), rand)
    }

    pub fn from_parts(ts: Timestamp, rand: u128) -> Self {
        let value = (u128::from(ts.as_millis()) << ULID_RAND_BITS)
            | (rand & ((1u128 << ULID_RAND_BITS) - 1));
        Self(value.to_be_bytes())
    }

    pub fn timestamp(self) -> Timestamp {
        Timestamp::from_millis((self.as_u128() >> ULID_RAND_BITS) as u64)
    }

    pub fn as_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// First [`Self::NONCE_LEN`] characters of the canonical encoding.
    pub fn nonce(self) -> String {
        let mut s = self.to_string();
        s.truncate(Self::NONCE_LEN);
        s
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; ULID_STR_LEN];
        let mut value = self.as_u128();
        for slot in buf.iter_mut().rev() {
            *slot = ULID_ALPHABET[(value & 0x1f) as usize];
            value >>= 5;
        }
        f.write_str(std::str::from_utf8(&buf).expect("Alphabet is ASCII"))
    }
}

impl fmt::Debug for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ulid").field(&self.to_string()).finish()
    }
}

impl FromStr for Ulid {
    type Err = UlidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ULID_STR_LEN {
            return InvalidLengthSnafu { len: s.len() }.fail();
        }
        let mut value: u128 = 0;
        for (i, byte) in s.bytes().enumerate() {
            let bits = ULID_DECODE[byte as usize];
            if bits == 0xff {
                return InvalidCharSnafu { char: byte as char }.fail();
            }
            // 26 chars hold 130 bits; the leading character must fit in the
            // 3 bits left over from 128.
            if i == 0 && 8 <= bits {
                return OverflowSnafu.fail();
            }
            value = (value << 5) | u128::from(bits);
        }
        Ok(Self(value.to_be_bytes()))
    }
}

impl serde::Serialize for Ulid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Ulid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A Discord 64-bit id (user, channel, message, guild, webhook).
///
/// Discord's JSON always carries these as decimal strings, so serde goes
/// through the string form; bincode keeps the raw integer for key encoding.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(u64);

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Invalid snowflake"))]
pub struct SnowflakeParseError;

impl Snowflake {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snowflake").field(&self.0).finish()
    }
}

impl FromStr for Snowflake {
    type Err = SnowflakeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self).map_err(|_| SnowflakeParseError)
    }
}

impl serde::Serialize for Snowflake {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Snowflake {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Missing `did:` prefix"))]
pub struct DidParseError;

/// The DID a Roomy space is addressed by.
#[derive(
    Encode, Decode, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct SpaceDid(String);

impl SpaceDid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceDid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SpaceDid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpaceDid").field(&self.0).finish()
    }
}

impl FromStr for SpaceDid {
    type Err = DidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("did:") {
            return Err(DidParseError);
        }
        Ok(Self(s.to_owned()))
    }
}

/// A user DID: either a real AT Protocol DID, or the synthetic
/// `did:discord:<snowflake>` form the bridge stamps on mirrored authors.
#[derive(
    Encode, Decode, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Did(String);

const DISCORD_DID_PREFIX: &str = "did:discord:";

impl Did {
    pub fn discord(user: Snowflake) -> Self {
        Self(format!("{DISCORD_DID_PREFIX}{user}"))
    }

    /// The Discord user id, when this is a bridge-synthesized Discord DID.
    pub fn as_discord_user(&self) -> Option<Snowflake> {
        self.0
            .strip_prefix(DISCORD_DID_PREFIX)
            .and_then(|rest| rest.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Did").field(&self.0).finish()
    }
}

impl FromStr for Did {
    type Err = DidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("did:") {
            return Err(DidParseError);
        }
        Ok(Self(s.to_owned()))
    }
}

/// A registered guild <-> space pair; leads every per-binding database key.
#[derive(Debug, Encode, Decode, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingId {
    pub guild: Snowflake,
    pub space: SpaceDid,
}

impl BindingId {
    pub fn new(guild: Snowflake, space: SpaceDid) -> Self {
        Self { guild, space }
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.guild, self.space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_roundtrip() {
        let ulid = Ulid::generate();
        let s = ulid.to_string();
        assert_eq!(s.len(), 26);
        assert_eq!(Ulid::from_str(&s).expect("valid"), ulid);
    }

    #[test]
    fn ulid_rejects_excluded_letters() {
        for c in ['I', 'L', 'O', 'U'] {
            let s = format!("01HZ5KJVM7X6YM8QPE7YV4Q0Z{c}");
            assert!(matches!(
                Ulid::from_str(&s),
                Err(UlidParseError::InvalidChar { .. })
            ));
        }
    }

    #[test]
    fn ulid_rejects_bad_length_and_overflow() {
        assert!(matches!(
            Ulid::from_str("01HZ5"),
            Err(UlidParseError::InvalidLength { len: 5 })
        ));
        // '8' in the leading slot would need a 131st bit
        assert!(matches!(
            Ulid::from_str("81HZ5KJVM7X6YM8QPE7YV4Q0ZY"),
            Err(UlidParseError::Overflow)
        ));
    }

    #[test]
    fn ulid_orders_by_timestamp() {
        let a = Ulid::from_parts(Timestamp::from_millis(1), u128::MAX);
        let b = Ulid::from_parts(Timestamp::from_millis(2), 0);
        assert!(a < b);
    }

    #[test]
    fn ulid_nonce_is_prefix() {
        let ulid = Ulid::from_str("01HZ5KJVM7X6YM8QPE7YV4Q0ZY").expect("valid");
        assert_eq!(ulid.nonce(), "01HZ5KJVM7X6YM8QPE7YV4Q0Z");
    }

    #[test]
    fn snowflake_serde_is_stringly() {
        let id = Snowflake::new(2000);
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"2000\"");
        let back: Snowflake = serde_json::from_str("\"2000\"").expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn discord_did_roundtrip() {
        let did = Did::discord(Snowflake::new(400));
        assert_eq!(did.as_str(), "did:discord:400");
        assert_eq!(did.as_discord_user(), Some(Snowflake::new(400)));

        let plc: Did = "did:plc:abc".parse().expect("valid");
        assert_eq!(plc.as_discord_user(), None);
    }
}
