//! Node identity model
//!
//! Three explicit value types:
//!
//! - [`InstanceNodeId`]: stable id of a node installation, survives restarts
//! - [`InstanceNodeSessionId`]: instance id plus a random suffix created at
//!   every process start; the key for live routing and channels
//! - [`LogicalNodeId`]: session id plus a logical part, so one process can
//!   expose several independently addressable endpoints
//!
//! All ids are lowercase hex strings separated by `:` and compare, hash and
//! serialize by their full string form.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};

/// Length of the hex instance part
pub const INSTANCE_PART_LENGTH: usize = 32;

/// Length of the hex session part
pub const SESSION_PART_LENGTH: usize = 10;

/// Maximum length of the hex logical part
pub const MAX_LOGICAL_PART_LENGTH: usize = 32;

/// Logical part of the default logical node of every session
pub const DEFAULT_LOGICAL_PART: &str = "0";

const SEPARATOR: char = ':';
const SHORT_ID_LENGTH: usize = 8;

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hex string from the thread-local CSPRNG
fn random_hex(byte_len: usize) -> String {
    let mut buf = vec![0u8; byte_len];
    rand::rng().fill(&mut buf[..]);
    hex::encode(buf)
}

fn malformed(kind: &'static str, input: &str) -> IdentityError {
    IdentityError::MalformedId {
        kind,
        input: input.to_string(),
    }
}

fn validate_logical_part(part: &str) -> IdentityResult<()> {
    if part.len() > MAX_LOGICAL_PART_LENGTH || !is_lower_hex(part) {
        return Err(malformed("logical part", part));
    }
    Ok(())
}

/// Behaviour shared by every node identifier
pub trait NodeIdentifier:
    Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static
{
    /// Human readable name of the id type, used in errors and logs
    const KIND: &'static str;

    /// The full string form
    fn as_str(&self) -> &str;

    /// The persistent installation this id belongs to
    fn instance_node_id(&self) -> InstanceNodeId;

    /// Abbreviated form for log fields
    fn short_id(&self) -> String {
        self.as_str().chars().take(SHORT_ID_LENGTH).collect()
    }
}

/// Stable identifier of a node installation
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct InstanceNodeId(String);

impl InstanceNodeId {
    /// Generate a new random instance id
    ///
    /// Callers persist the result; this crate never stores it.
    pub fn generate() -> Self {
        Self(random_hex(INSTANCE_PART_LENGTH / 2))
    }

    /// Parse an instance id from its string form
    pub fn parse(input: &str) -> IdentityResult<Self> {
        if input.len() != INSTANCE_PART_LENGTH || !is_lower_hex(input) {
            return Err(malformed(Self::KIND, input));
        }
        Ok(Self(input.to_string()))
    }

    /// Derive a fresh session id for a new process of this installation
    pub fn new_session(&self) -> InstanceNodeSessionId {
        InstanceNodeSessionId {
            full: format!(
                "{}{SEPARATOR}{SEPARATOR}{}",
                self.0,
                random_hex(SESSION_PART_LENGTH / 2)
            ),
        }
    }
}

impl NodeIdentifier for InstanceNodeId {
    const KIND: &'static str = "instance node";

    fn as_str(&self) -> &str {
        &self.0
    }

    fn instance_node_id(&self) -> InstanceNodeId {
        self.clone()
    }
}

impl Debug for InstanceNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceNodeId({})", self.0)
    }
}

/// Identifier of one running process of a node installation
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize)]
#[display("{full}")]
#[serde(try_from = "String", into = "String")]
pub struct InstanceNodeSessionId {
    full: String,
}

impl InstanceNodeSessionId {
    const SESSION_OFFSET: usize = INSTANCE_PART_LENGTH + 2;

    /// Parse a session id from its `<instance>::<session>` form
    pub fn parse(input: &str) -> IdentityResult<Self> {
        let err = || malformed(Self::KIND, input);
        let (instance, session) = input.split_once("::").ok_or_else(err)?;
        if instance.len() != INSTANCE_PART_LENGTH
            || !is_lower_hex(instance)
            || session.len() != SESSION_PART_LENGTH
            || !is_lower_hex(session)
        {
            return Err(err());
        }
        Ok(Self {
            full: input.to_string(),
        })
    }

    /// The random session suffix
    pub fn session_part(&self) -> &str {
        &self.full[Self::SESSION_OFFSET..]
    }

    /// Whether both ids belong to the same installation, regardless of session
    pub fn is_same_instance_node_as(&self, other: &InstanceNodeSessionId) -> bool {
        self.full[..INSTANCE_PART_LENGTH] == other.full[..INSTANCE_PART_LENGTH]
    }

    /// The default logical node of this session
    pub fn default_logical_node_id(&self) -> LogicalNodeId {
        LogicalNodeId::compose(self, DEFAULT_LOGICAL_PART)
    }

    /// A named logical node of this session
    pub fn logical_node_id(&self, logical_part: &str) -> IdentityResult<LogicalNodeId> {
        validate_logical_part(logical_part)?;
        Ok(LogicalNodeId::compose(self, logical_part))
    }
}

impl NodeIdentifier for InstanceNodeSessionId {
    const KIND: &'static str = "instance node session";

    fn as_str(&self) -> &str {
        &self.full
    }

    fn instance_node_id(&self) -> InstanceNodeId {
        InstanceNodeId(self.full[..INSTANCE_PART_LENGTH].to_string())
    }
}

impl Debug for InstanceNodeSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceNodeSessionId({})", self.full)
    }
}

/// Addressable sub-identity of a running session
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize)]
#[display("{full}")]
#[serde(try_from = "String", into = "String")]
pub struct LogicalNodeId {
    full: String,
}

impl LogicalNodeId {
    fn compose(session: &InstanceNodeSessionId, logical_part: &str) -> Self {
        Self {
            full: format!(
                "{}{SEPARATOR}{logical_part}{SEPARATOR}{}",
                &session.full[..INSTANCE_PART_LENGTH],
                session.session_part()
            ),
        }
    }

    /// Parse a logical node id from its `<instance>:<logical>:<session>` form
    pub fn parse(input: &str) -> IdentityResult<Self> {
        let err = || malformed(Self::KIND, input);
        let mut parts = input.split(SEPARATOR);
        let (Some(instance), Some(logical), Some(session), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };
        if instance.len() != INSTANCE_PART_LENGTH
            || !is_lower_hex(instance)
            || session.len() != SESSION_PART_LENGTH
            || !is_lower_hex(session)
        {
            return Err(err());
        }
        validate_logical_part(logical).map_err(|_| err())?;
        Ok(Self {
            full: input.to_string(),
        })
    }

    /// The logical part between instance and session
    pub fn logical_part(&self) -> &str {
        let end = self.full.len() - SESSION_PART_LENGTH - 1;
        &self.full[INSTANCE_PART_LENGTH + 1..end]
    }

    /// The session this logical node lives in
    pub fn session_id(&self) -> InstanceNodeSessionId {
        let session = &self.full[self.full.len() - SESSION_PART_LENGTH..];
        InstanceNodeSessionId {
            full: format!(
                "{}{SEPARATOR}{SEPARATOR}{session}",
                &self.full[..INSTANCE_PART_LENGTH]
            ),
        }
    }

    pub fn is_default_logical_node(&self) -> bool {
        self.logical_part() == DEFAULT_LOGICAL_PART
    }
}

impl NodeIdentifier for LogicalNodeId {
    const KIND: &'static str = "logical node";

    fn as_str(&self) -> &str {
        &self.full
    }

    fn instance_node_id(&self) -> InstanceNodeId {
        InstanceNodeId(self.full[..INSTANCE_PART_LENGTH].to_string())
    }
}

impl Debug for LogicalNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalNodeId({})", self.full)
    }
}

macro_rules! string_conversions {
    ($ty:ty) => {
        impl FromStr for $ty {
            type Err = IdentityError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = IdentityError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.as_str().to_string()
            }
        }
    };
}

string_conversions!(InstanceNodeId);
string_conversions!(InstanceNodeSessionId);
string_conversions!(LogicalNodeId);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const INSTANCE: &str = "0123456789abcdef0123456789abcdef";
    const SESSION: &str = "0123456789abcdef0123456789abcdef::0123456789";

    #[test]
    fn test_generate_instance_id() {
        let id = InstanceNodeId::generate();
        assert_eq!(id.as_str().len(), INSTANCE_PART_LENGTH);
        assert!(InstanceNodeId::parse(id.as_str()).is_ok());
        assert_ne!(id, InstanceNodeId::generate());
    }

    #[test]
    fn test_parse_instance_id() {
        assert!(InstanceNodeId::parse(INSTANCE).is_ok());
        assert!(InstanceNodeId::parse("0123456789ABCDEF0123456789abcdef").is_err());
        assert!(InstanceNodeId::parse("0123").is_err());
        assert!(InstanceNodeId::parse("").is_err());
        assert!(InstanceNodeId::parse("0123456789abcdef0123456789abcdeg").is_err());
    }

    #[test]
    fn test_new_session_is_fresh() {
        let instance = InstanceNodeId::parse(INSTANCE).unwrap();
        let a = instance.new_session();
        let b = instance.new_session();
        assert_ne!(a, b);
        assert!(a.is_same_instance_node_as(&b));
        assert_eq!(a.instance_node_id(), instance);
        assert_eq!(a.session_part().len(), SESSION_PART_LENGTH);
        assert_eq!(InstanceNodeSessionId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn test_parse_session_id() {
        let id = InstanceNodeSessionId::parse(SESSION).unwrap();
        assert_eq!(id.session_part(), "0123456789");
        assert_eq!(id.instance_node_id().as_str(), INSTANCE);

        let err = InstanceNodeSessionId::parse("0123456789abcdef0123456789abcdef:0123456789")
            .unwrap_err();
        assert!(matches!(err, IdentityError::MalformedId { .. }));
        assert!(InstanceNodeSessionId::parse(INSTANCE).is_err());
        assert!(InstanceNodeSessionId::parse(&format!("{INSTANCE}::012345678")).is_err());
    }

    #[test]
    fn test_logical_node_ids() {
        let session = InstanceNodeSessionId::parse(SESSION).unwrap();

        let default = session.default_logical_node_id();
        assert_eq!(default.as_str(), format!("{INSTANCE}:0:0123456789"));
        assert!(default.is_default_logical_node());
        assert_eq!(default.session_id(), session);

        let custom = session.logical_node_id("000000000000000000000000ffffffff").unwrap();
        assert_eq!(custom.logical_part(), "000000000000000000000000ffffffff");
        assert!(!custom.is_default_logical_node());
        assert_eq!(custom.session_id(), session);
        assert_eq!(LogicalNodeId::parse(custom.as_str()).unwrap(), custom);

        assert!(session.logical_node_id("").is_err());
        assert!(session.logical_node_id("XYZ").is_err());
        assert!(session.logical_node_id(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_parse_logical_node_id_rejects_bad_forms() {
        assert!(LogicalNodeId::parse(SESSION).is_err());
        assert!(LogicalNodeId::parse(&format!("{INSTANCE}:1")).is_err());
        assert!(LogicalNodeId::parse(&format!("{INSTANCE}:1:0123456789:00")).is_err());
        assert!(LogicalNodeId::parse(&format!("{INSTANCE}:1:0123456789")).is_ok());
    }

    #[test]
    fn test_equality_by_string() {
        let a = InstanceNodeSessionId::parse(SESSION).unwrap();
        let b: InstanceNodeSessionId = SESSION.parse().unwrap();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let session = InstanceNodeSessionId::parse(SESSION).unwrap();
        let logical = session.logical_node_id("1").unwrap();

        let bytes = postcard::to_allocvec(&logical).unwrap();
        let decoded: LogicalNodeId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, logical);

        let as_string = postcard::to_allocvec(&logical.to_string()).unwrap();
        assert_eq!(bytes, as_string);

        let bad = postcard::to_allocvec(&"not-an-id".to_string()).unwrap();
        assert!(postcard::from_bytes::<LogicalNodeId>(&bad).is_err());
    }

    #[test]
    fn test_short_id() {
        let session = InstanceNodeSessionId::parse(SESSION).unwrap();
        assert_eq!(session.short_id(), "01234567");
    }
}
