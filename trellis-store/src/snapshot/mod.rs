// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical flat-file representation of an edge store.
//!
//! A snapshot consists of one table per relation plus a table of all known entities:
//!
//! - `entities.csv`: `id,type`
//! - `member_of.csv`: `id,user_id,group_id,created_at,revoked_at`
//! - `inherits_from.csv`: `id,child_group_id,parent_group_id,created_at,revoked_at`
//! - `has_permission.csv`: `id,subject_id,resource_id,capability,created_at,revoked_at`
//!
//! Timestamps are microseconds since the UNIX epoch, an empty `revoked_at` field marks an active
//! edge. Rows are sorted by id, entities by kind first, so the same store always yields the same
//! files.
mod csv;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use trellis_core::{
    Capability, Edge, EdgeId, EdgeStore, EdgeType, EntityId, EntityKind, TenantId, Timestamp,
    Version,
};

pub use csv::CsvError;

pub const ENTITIES_FILE: &str = "entities.csv";

const ENTITIES_HEADER: [&str; 2] = ["id", "type"];
const MEMBER_OF_HEADER: [&str; 5] = ["id", "user_id", "group_id", "created_at", "revoked_at"];
const INHERITS_FROM_HEADER: [&str; 5] = [
    "id",
    "child_group_id",
    "parent_group_id",
    "created_at",
    "revoked_at",
];
const HAS_PERMISSION_HEADER: [&str; 6] = [
    "id",
    "subject_id",
    "resource_id",
    "capability",
    "created_at",
    "revoked_at",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("{file} line {line}: {reason}")]
    Malformed {
        file: String,
        line: usize,
        reason: String,
    },
}

impl SnapshotError {
    fn malformed(file: &str, line: usize, reason: impl ToString) -> Self {
        SnapshotError::Malformed {
            file: file.to_string(),
            line,
            reason: reason.to_string(),
        }
    }
}

/// File name of the table holding edges of the given type.
pub fn relation_file(edge_type: EdgeType) -> String {
    format!("{}.csv", edge_type.relation_name())
}

fn relation_header(edge_type: EdgeType) -> &'static [&'static str] {
    match edge_type {
        EdgeType::MemberOf => &MEMBER_OF_HEADER,
        EdgeType::InheritsFrom => &INHERITS_FROM_HEADER,
        EdgeType::HasPermission => &HAS_PERMISSION_HEADER,
    }
}

/// Contents of the four snapshot files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFiles {
    pub entities: String,
    pub member_of: String,
    pub inherits_from: String,
    pub has_permission: String,
}

impl SnapshotFiles {
    pub fn relation(&self, edge_type: EdgeType) -> &str {
        match edge_type {
            EdgeType::MemberOf => &self.member_of,
            EdgeType::InheritsFrom => &self.inherits_from,
            EdgeType::HasPermission => &self.has_permission,
        }
    }

    fn relation_mut(&mut self, edge_type: EdgeType) -> &mut String {
        match edge_type {
            EdgeType::MemberOf => &mut self.member_of,
            EdgeType::InheritsFrom => &mut self.inherits_from,
            EdgeType::HasPermission => &mut self.has_permission,
        }
    }

    /// File names and contents, in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &str)> {
        std::iter::once((ENTITIES_FILE.to_string(), self.entities.as_str())).chain(
            EdgeType::ALL
                .into_iter()
                .map(|edge_type| (relation_file(edge_type), self.relation(edge_type))),
        )
    }
}

/// A snapshot of one tenant taken right after the mutation with `version` was applied.
///
/// Replaying the mutation log from `version + 1` on top of it yields the current state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenant: TenantId,
    pub version: Version,
    pub files: SnapshotFiles,
}

impl Snapshot {
    pub fn new(tenant: TenantId, version: Version, store: &EdgeStore) -> Self {
        Self {
            tenant,
            version,
            files: export(store),
        }
    }

    pub fn to_store(&self) -> Result<EdgeStore, SnapshotError> {
        import(&self.files)
    }
}

/// Serialize the whole store, revoked edges included.
pub fn export(store: &EdgeStore) -> SnapshotFiles {
    let mut files = SnapshotFiles::default();

    let mut entities: Vec<&EntityId> = store.entities().collect();
    entities.sort();
    csv::write_row(&mut files.entities, &ENTITIES_HEADER);
    for entity in entities {
        csv::write_row(
            &mut files.entities,
            &[entity.to_string(), entity.kind().to_string()],
        );
    }

    for edge_type in EdgeType::ALL {
        let mut edges: Vec<&Edge> = store.edges_of_type(edge_type).collect();
        edges.sort_by_key(|edge| edge.id);

        let out = files.relation_mut(edge_type);
        csv::write_row(out, relation_header(edge_type));
        for edge in edges {
            csv::write_row(out, edge_row(edge).as_slice());
        }
    }

    debug!(
        edges = store.len(),
        entities = store.entities().count(),
        "exported snapshot"
    );
    files
}

fn edge_row(edge: &Edge) -> Vec<String> {
    let mut row = vec![
        edge.id.to_hex(),
        edge.source_id.to_string(),
        edge.target_id.to_string(),
    ];
    if let Some(capability) = &edge.capability {
        row.push(capability.to_string());
    }
    row.push(edge.created_at.to_string());
    row.push(
        edge.revoked_at
            .map(|revoked_at| revoked_at.to_string())
            .unwrap_or_default(),
    );
    row
}

/// Rebuild a store from all snapshot files.
pub fn import(files: &SnapshotFiles) -> Result<EdgeStore, SnapshotError> {
    import_selective(files, &EdgeType::ALL)
}

/// Rebuild a store from the entity table and the tables of the given relations only.
pub fn import_selective(
    files: &SnapshotFiles,
    edge_types: &[EdgeType],
) -> Result<EdgeStore, SnapshotError> {
    let mut store = EdgeStore::new();

    for row in table(ENTITIES_FILE, &files.entities, &ENTITIES_HEADER)? {
        let entity: EntityId = parse_field(ENTITIES_FILE, row.line, &row.fields[0])?;
        let kind: EntityKind = parse_field(ENTITIES_FILE, row.line, &row.fields[1])?;
        if entity.kind() != kind {
            return Err(SnapshotError::malformed(
                ENTITIES_FILE,
                row.line,
                format!("entity {entity} listed with type {kind}"),
            ));
        }
        store.ensure_entity(entity);
    }

    for edge_type in EdgeType::ALL {
        if !edge_types.contains(&edge_type) {
            continue;
        }

        let file = relation_file(edge_type);
        for row in table(&file, files.relation(edge_type), relation_header(edge_type))? {
            let (edge, line) = parse_edge(&file, edge_type, row)?;
            store
                .insert(edge)
                .map_err(|err| SnapshotError::malformed(&file, line, err))?;
        }
    }

    debug!(
        edges = store.len(),
        relations = edge_types.len(),
        "imported snapshot"
    );
    Ok(store)
}

/// Parse a table, check its header and the field count of every row.
fn table(file: &str, text: &str, header: &[&str]) -> Result<Vec<csv::Row>, SnapshotError> {
    let mut rows = csv::parse(text)
        .map_err(|err| SnapshotError::malformed(file, err.line(), err))?
        .into_iter();

    let Some(first) = rows.next() else {
        return Err(SnapshotError::malformed(file, 1, "missing header row"));
    };
    if first.fields != header {
        return Err(SnapshotError::malformed(
            file,
            first.line,
            format!("expected header {}", header.join(",")),
        ));
    }

    rows.map(|row| {
        if row.fields.len() != header.len() {
            return Err(SnapshotError::malformed(
                file,
                row.line,
                format!(
                    "expected {} fields, found {}",
                    header.len(),
                    row.fields.len()
                ),
            ));
        }
        Ok(row)
    })
    .collect()
}

fn parse_field<T>(file: &str, line: usize, value: &str) -> Result<T, SnapshotError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| SnapshotError::malformed(file, line, format!("{value:?}: {err}")))
}

fn parse_edge(
    file: &str,
    edge_type: EdgeType,
    row: csv::Row,
) -> Result<(Edge, usize), SnapshotError> {
    let line = row.line;
    let fields = row.fields;
    let id: EdgeId = parse_field(file, line, &fields[0])?;
    let source_id: EntityId = parse_field(file, line, &fields[1])?;
    let target_id: EntityId = parse_field(file, line, &fields[2])?;

    let (capability, rest) = match edge_type {
        EdgeType::HasPermission => {
            let capability: Capability = parse_field(file, line, &fields[3])?;
            (Some(capability), &fields[4..])
        }
        _ => (None, &fields[3..]),
    };

    let created_at: Timestamp = parse_field(file, line, &rest[0])?;
    let revoked_at = match rest[1].as_str() {
        "" => None,
        value => Some(parse_field::<Timestamp>(file, line, value)?),
    };

    let edge = Edge {
        id,
        edge_type,
        source_id,
        target_id,
        capability,
        created_at,
        revoked_at,
    };
    Ok((edge, line))
}
