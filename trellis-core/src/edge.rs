// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed, directed relationships between entities.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{EdgeId, EntityId, EntityKind, Timestamp};

/// The three relationship types of the permission graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    /// User → Group.
    MemberOf,

    /// Group → Group, the source group inherits everything granted to the target group.
    InheritsFrom,

    /// User or Group → Resource, carries a capability.
    HasPermission,
}

impl EdgeType {
    pub const ALL: [EdgeType; 3] = [
        EdgeType::MemberOf,
        EdgeType::InheritsFrom,
        EdgeType::HasPermission,
    ];

    /// Name of the relation, as used in snapshot file names.
    pub fn relation_name(&self) -> &'static str {
        match self {
            EdgeType::MemberOf => "member_of",
            EdgeType::InheritsFrom => "inherits_from",
            EdgeType::HasPermission => "has_permission",
        }
    }

    /// Returns `true` for edges which are followed when computing group closures.
    pub fn is_structural(&self) -> bool {
        matches!(self, EdgeType::MemberOf | EdgeType::InheritsFrom)
    }

    /// Returns `true` if an edge of this type may connect the given endpoint kinds.
    pub fn accepts(&self, source: EntityKind, target: EntityKind) -> bool {
        match self {
            EdgeType::MemberOf => source == EntityKind::User && target == EntityKind::Group,
            EdgeType::InheritsFrom => source == EntityKind::Group && target == EntityKind::Group,
            EdgeType::HasPermission => {
                matches!(source, EntityKind::User | EntityKind::Group)
                    && target == EntityKind::Resource
            }
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeType::MemberOf => "MEMBER_OF",
            EdgeType::InheritsFrom => "INHERITS_FROM",
            EdgeType::HasPermission => "HAS_PERMISSION",
        };

        write!(f, "{}", s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid capability: {0:?}")]
pub struct InvalidCapability(pub String);

/// An action which can be granted on a resource.
///
/// The four CRUD capabilities are built in, further capabilities can be expressed with `Custom`
/// as long as they are lowercase ASCII words.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
    Custom(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Create => "create",
            Capability::Read => "read",
            Capability::Update => "update",
            Capability::Delete => "delete",
            Capability::Custom(name) => name,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = InvalidCapability;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(Capability::Create),
            "read" => Ok(Capability::Read),
            "update" => Ok(Capability::Update),
            "delete" => Ok(Capability::Delete),
            custom => {
                let well_formed = !custom.is_empty()
                    && custom
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
                if well_formed {
                    Ok(Capability::Custom(custom.to_string()))
                } else {
                    Err(InvalidCapability(custom.to_string()))
                }
            }
        }
    }
}

impl Serialize for Capability {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EdgeShapeError {
    #[error("{edge_type} edge can not connect {source_kind} to {target_kind}")]
    InvalidEndpoints {
        edge_type: EdgeType,
        source_kind: EntityKind,
        target_kind: EntityKind,
    },

    #[error("HAS_PERMISSION edge is missing a capability")]
    MissingCapability,

    #[error("{0} edge must not carry a capability")]
    UnexpectedCapability(EdgeType),
}

/// The unit of authorization state.
///
/// Edges are never deleted, revocation sets `revoked_at` and leaves the edge in place for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<Timestamp>,
}

impl Edge {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// Returns `true` if this is an unrevoked permission edge granting the given capability.
    pub fn grants(&self, capability: &Capability) -> bool {
        self.is_active()
            && self.edge_type == EdgeType::HasPermission
            && self.capability.as_ref() == Some(capability)
    }

    /// Check that endpoint kinds and capability match the edge type.
    pub fn validate_shape(&self) -> Result<(), EdgeShapeError> {
        let source_kind = self.source_id.kind();
        let target_kind = self.target_id.kind();
        if !self.edge_type.accepts(source_kind, target_kind) {
            return Err(EdgeShapeError::InvalidEndpoints {
                edge_type: self.edge_type,
                source_kind,
                target_kind,
            });
        }

        match (self.edge_type, &self.capability) {
            (EdgeType::HasPermission, None) => Err(EdgeShapeError::MissingCapability),
            (EdgeType::HasPermission, Some(_)) => Ok(()),
            (edge_type, Some(_)) => Err(EdgeShapeError::UnexpectedCapability(edge_type)),
            (_, None) => Ok(()),
        }
    }
}
