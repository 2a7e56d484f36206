//! OVSDB values: atoms, sets, and maps, plus the column-keyed `Row`.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as Json, json};

use crate::atom::Atom;
use crate::error::{OvsdbError, Result};

/// A column value: an atom, an unordered multiset of atoms, or a map of
/// atom pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Atom(Atom),
    Set(Vec<Atom>),
    Map(BTreeMap<Atom, Atom>),
}

impl Value {
    /// Empty set, the wire form of an absent optional column.
    #[must_use]
    pub fn empty_set() -> Self {
        Self::Set(Vec::new())
    }

    /// Encode into the RFC 7047 wire form. Sets are emitted sorted by their
    /// element order so equal values encode to identical JSON.
    #[must_use]
    pub fn to_wire(&self) -> Json {
        match self {
            Self::Atom(atom) => atom.to_wire(),
            Self::Set(atoms) => {
                let mut sorted = atoms.clone();
                sorted.sort();
                json!(["set", sorted.iter().map(Atom::to_wire).collect::<Vec<_>>()])
            }
            Self::Map(pairs) => json!([
                "map",
                pairs
                    .iter()
                    .map(|(k, v)| json!([k.to_wire(), v.to_wire()]))
                    .collect::<Vec<_>>()
            ]),
        }
    }

    /// Decode from the RFC 7047 wire form. Accepts bare atoms, tagged
    /// `["set", ...]` / `["map", ...]` pairs, and the atom UUID tags.
    pub fn from_wire(wire: &Json) -> Result<Self> {
        let Json::Array(pair) = wire else {
            return Atom::from_wire(wire).map(Self::Atom);
        };
        if pair.len() != 2 {
            return Err(invalid(format!("malformed value: {wire}")));
        }
        match pair[0].as_str() {
            Some("set") => {
                let Json::Array(elements) = &pair[1] else {
                    return Err(invalid("set body is not an array".to_string()));
                };
                let atoms = elements
                    .iter()
                    .map(Atom::from_wire)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Set(atoms))
            }
            Some("map") => {
                let Json::Array(entries) = &pair[1] else {
                    return Err(invalid("map body is not an array".to_string()));
                };
                let mut pairs = BTreeMap::new();
                for entry in entries {
                    let Json::Array(kv) = entry else {
                        return Err(invalid(format!("malformed map entry: {entry}")));
                    };
                    if kv.len() != 2 {
                        return Err(invalid(format!("malformed map entry: {entry}")));
                    }
                    let key = Atom::from_wire(&kv[0])?;
                    let value = Atom::from_wire(&kv[1])?;
                    if pairs.insert(key, value).is_some() {
                        return Err(invalid(format!("duplicate map key in {wire}")));
                    }
                }
                Ok(Self::Map(pairs))
            }
            _ => Atom::from_wire(wire).map(Self::Atom),
        }
    }

    /// The atoms referenced by this value, flattened. Map values yield both
    /// keys and values.
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Self::Atom(atom) => vec![atom],
            Self::Set(atoms) => atoms.iter().collect(),
            Self::Map(pairs) => pairs.iter().flat_map(|(k, v)| [k, v]).collect(),
        }
    }

    /// UUIDs referenced by this value, whatever its shape.
    pub fn referenced_uuids(&self) -> Vec<uuid::Uuid> {
        self.atoms()
            .into_iter()
            .filter_map(|atom| match atom {
                Atom::Uuid(uuid) => Some(*uuid),
                _ => None,
            })
            .collect()
    }
}

impl From<Atom> for Value {
    fn from(atom: Atom) -> Self {
        Self::Atom(atom)
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let wire = Json::deserialize(deserializer)?;
        Self::from_wire(&wire).map_err(serde::de::Error::custom)
    }
}

fn invalid(reason: String) -> OvsdbError {
    OvsdbError::InvalidValue {
        context: "value".to_string(),
        reason,
    }
}

/// A column-name-keyed map of values. The row's UUID, when assigned, is
/// tracked by the owner (cache entry or `_uuid` record field), not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.columns.insert(column.into(), value)
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.columns.remove(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Encode as a wire row object.
    #[must_use]
    pub fn to_wire(&self) -> Json {
        let mut object = JsonMap::new();
        for (column, value) in &self.columns {
            object.insert(column.clone(), value.to_wire());
        }
        Json::Object(object)
    }

    /// Decode a wire row object.
    pub fn from_wire(wire: &Json) -> Result<Self> {
        let Json::Object(object) = wire else {
            return Err(invalid(format!("row is not an object: {wire}")));
        };
        let mut row = Self::new();
        for (column, value) in object {
            row.insert(
                column.clone(),
                Value::from_wire(value).map_err(|err| err.for_column(column))?,
            );
        }
        Ok(row)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
