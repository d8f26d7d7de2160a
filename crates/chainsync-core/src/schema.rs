//! Schema store: the live Definition/FieldDefinition model, built by
//! replaying the chain in order.
//!
//! A definition's id is its 1-based position among all definitions ever
//! appended; replay enforces this and rejects streams that disagree. Schema
//! changes are always new records, never in-place edits, so the store only
//! ever grows.

use std::collections::HashMap;

use crate::chain::record::{ChainRecord, FieldType};
use crate::error::{ChainError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub id: u64,
    /// 0 when the definition inherits nothing.
    pub inherited_id: u64,
    pub name: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub id: u64,
    pub definition_id: u64,
    pub name: String,
    pub data_type: FieldType,
    pub unsigned: bool,
    pub private: bool,
}

#[derive(Debug, Default)]
pub struct SchemaStore {
    defs: Vec<Definition>,
    by_name: HashMap<String, u64>,
    fields: HashMap<u64, Vec<FieldDefinition>>,
    next_field_id: u64,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition_count(&self) -> u64 {
        self.defs.len() as u64
    }

    /// Replay one record into the store.
    pub fn apply(&mut self, record: &ChainRecord) -> Result<()> {
        match record {
            ChainRecord::CreateDefinition {
                definition_id,
                inherited_id,
                timestamp_ms,
                name,
            } => {
                let expected = self.defs.len() as u64 + 1;
                if *definition_id != expected {
                    return Err(ChainError::CorruptChain(format!(
                        "definition '{name}' carries id {definition_id}, expected ordinal {expected}"
                    )));
                }
                if *inherited_id >= expected {
                    return Err(ChainError::CorruptChain(format!(
                        "definition '{name}' inherits {inherited_id}, which is not earlier than {expected}"
                    )));
                }
                self.defs.push(Definition {
                    id: expected,
                    inherited_id: *inherited_id,
                    name: name.clone(),
                    timestamp_ms: *timestamp_ms,
                });
                // Last writer wins on name collisions; resolve-by-name is a
                // convenience, ordinals are the identity.
                self.by_name.insert(name.clone(), expected);
                Ok(())
            }
            ChainRecord::DefineField {
                definition_id,
                name,
                data_type,
                unsigned,
                private,
            } => {
                self.define_field(*definition_id, name, *data_type, *unsigned, *private)
                    .map(|_| ())
            }
            ChainRecord::SetFields {
                definition_id,
                fields,
            } => {
                self.resolve(*definition_id)?;
                for f in fields {
                    if f.field_id == 0 || f.field_id > self.next_field_id {
                        return Err(ChainError::CorruptChain(format!(
                            "write to unknown field {}",
                            f.field_id
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// O(1) ordinal lookup.
    pub fn resolve(&self, id: u64) -> Result<&Definition> {
        if id == 0 || id > self.defs.len() as u64 {
            return Err(ChainError::UnknownDefinition(id));
        }
        Ok(&self.defs[(id - 1) as usize])
    }

    pub fn resolve_name(&self, name: &str) -> Result<&Definition> {
        let id = *self
            .by_name
            .get(name)
            .ok_or(ChainError::UnknownDefinition(0))?;
        self.resolve(id)
    }

    /// Register a field under an existing definition, returning its id.
    /// Field ids are a single monotone sequence across all definitions.
    pub fn define_field(
        &mut self,
        definition_id: u64,
        name: &str,
        data_type: FieldType,
        unsigned: bool,
        private: bool,
    ) -> Result<u64> {
        self.resolve(definition_id)?;
        self.next_field_id += 1;
        let id = self.next_field_id;
        self.fields
            .entry(definition_id)
            .or_default()
            .push(FieldDefinition {
                id,
                definition_id,
                name: name.to_string(),
                data_type,
                unsigned,
                private,
            });
        Ok(id)
    }

    /// Fields declared directly on `id` (no inheritance).
    pub fn own_fields(&self, id: u64) -> Result<&[FieldDefinition]> {
        self.resolve(id)?;
        Ok(self.fields.get(&id).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// The full field set of a definition: every ancestor's fields plus its
    /// own, with a child field overriding a same-named parent field.
    ///
    /// The parent walk is bounded by the definition count; a cycle in the
    /// parent chain (only possible on a corrupt store) errors instead of
    /// spinning.
    pub fn effective_fields(&self, id: u64) -> Result<Vec<FieldDefinition>> {
        let mut lineage = Vec::new();
        let mut cursor = id;
        let mut hops = 0u64;
        while cursor != 0 {
            if hops > self.defs.len() as u64 {
                return Err(ChainError::CorruptChain(format!(
                    "inheritance cycle reached from definition {id}"
                )));
            }
            lineage.push(cursor);
            cursor = self.resolve(cursor)?.inherited_id;
            hops += 1;
        }

        // Root first so children override parents.
        let mut merged: Vec<FieldDefinition> = Vec::new();
        for def_id in lineage.into_iter().rev() {
            for field in self.fields.get(&def_id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(existing) = merged.iter_mut().find(|f| f.name == field.name) {
                    *existing = field.clone();
                } else {
                    merged.push(field.clone());
                }
            }
        }
        Ok(merged)
    }

    /// Ids of private fields visible from `id`, for stripping before
    /// external replication.
    pub fn private_field_ids(&self, id: u64) -> Result<Vec<u64>> {
        Ok(self
            .effective_fields(id)?
            .into_iter()
            .filter(|f| f.private)
            .map(|f| f.id)
            .collect())
    }
}
