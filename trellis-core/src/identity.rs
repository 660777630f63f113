// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers for entities, edges and tenants.
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of edge identifiers in bytes.
pub const EDGE_ID_LEN: usize = 16;

/// Monotonic version assigned to every mutation of a tenant. `0` denotes the empty log.
pub type Version = u64;

#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("entity identifier is missing a kind prefix: {0}")]
    MissingKind(String),

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("entity identifier must not be empty")]
    EmptyEntityId,

    #[error("invalid edge id length, expected {EDGE_ID_LEN} bytes, got {0}")]
    InvalidEdgeIdLength(usize),

    #[error("invalid hex encoding in edge id: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("tenant identifier must not be empty")]
    EmptyTenantId,
}

/// The three kinds of entities taking part in the permission graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Group,
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Resource => "resource",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(EntityKind::User),
            "group" => Ok(EntityKind::Group),
            "resource" => Ok(EntityKind::Resource),
            other => Err(IdentityError::UnknownKind(other.to_string())),
        }
    }
}

/// Opaque, type-tagged identifier of a user, group or resource.
///
/// The canonical string form is `<kind>:<id>`, for example `user:alice` or `resource:doc1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    kind: EntityKind,
    id: String,
}

impl EntityId {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::EmptyEntityId);
        }
        Ok(Self { kind, id })
    }

    /// Identifier of a user. Panics on an empty id, use `EntityId::new` for untrusted input.
    pub fn user(id: &str) -> Self {
        Self::new(EntityKind::User, id).expect("non-empty user id")
    }

    /// Identifier of a group. Panics on an empty id, use `EntityId::new` for untrusted input.
    pub fn group(id: &str) -> Self {
        Self::new(EntityKind::Group, id).expect("non-empty group id")
    }

    /// Identifier of a resource. Panics on an empty id, use `EntityId::new` for untrusted input.
    pub fn resource(id: &str) -> Self {
        Self::new(EntityKind::Resource, id).expect("non-empty resource id")
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The identifier without its kind prefix.
    pub fn local_id(&self) -> &str {
        &self.id
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, EntityKind::User)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, EntityKind::Group)
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.kind, EntityKind::Resource)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityId {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((kind, id)) = value.split_once(':') else {
            return Err(IdentityError::MissingKind(value.to_string()));
        };
        EntityId::new(kind.parse()?, id)
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// 128-bit random edge identifier.
///
/// Edge ids are only ever minted by the `EdgeStore` owning them. Parsing an id from untrusted
/// input does not make it valid, it still has to be present in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId([u8; EDGE_ID_LEN]);

impl EdgeId {
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; EDGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; EDGE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short representation for log output.
    pub fn fmt_short(&self) -> String {
        self.to_hex()[0..8].to_string()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EdgeId").field(&self.to_hex()).finish()
    }
}

impl FromStr for EdgeId {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)?;
        let bytes: [u8; EDGE_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidEdgeIdLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for EdgeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EdgeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of the isolation unit owning one edge store, mutation log and version counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityError::EmptyTenantId);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since the UNIX epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(micros: u64) -> Self {
        Self(micros)
    }

    /// Current system time. Clocks set before the UNIX epoch yield `0`.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_micros() as u64)
            .unwrap_or_default();
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(value.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{EdgeId, EntityId, EntityKind, IdentityError, TenantId};

    #[test]
    fn entity_id_string_form() {
        let alice: EntityId = "user:alice".parse().unwrap();
        assert_eq!(alice.kind(), EntityKind::User);
        assert_eq!(alice.local_id(), "alice");
        assert_eq!(alice.to_string(), "user:alice");

        // Only the first colon separates the kind.
        let nested: EntityId = "resource:folder:a".parse().unwrap();
        assert_eq!(nested.local_id(), "folder:a");

        assert_matches!(
            "robot:r2".parse::<EntityId>(),
            Err(IdentityError::UnknownKind(kind)) if kind == "robot"
        );
        assert_matches!("alice".parse::<EntityId>(), Err(IdentityError::MissingKind(_)));
        assert_matches!("group:".parse::<EntityId>(), Err(IdentityError::EmptyEntityId));
    }

    #[test]
    fn edge_id_hex() {
        let id = EdgeId::random();
        let parsed: EdgeId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);

        assert_matches!("e1x".parse::<EdgeId>(), Err(IdentityError::InvalidHex(_)));
        assert_matches!(
            "abcd".parse::<EdgeId>(),
            Err(IdentityError::InvalidEdgeIdLength(2))
        );
    }

    #[test]
    fn serde_string_forms() {
        let json = serde_json::to_string(&EntityId::group("eng")).unwrap();
        assert_eq!(json, "\"group:eng\"");

        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
        let tenant: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(tenant.as_str(), "acme");
    }
}
