//! Record types: user aggregates whose fields carry column tags.
//!
//! A `Record` describes itself through a static table of `FieldBinding`s,
//! one per tagged field, and copies values in and out by `FieldToken`. The
//! token is the field selector: an opaque identity that the mapper resolves
//! to a column name in O(1). Code generation over a schema would normally
//! emit these impls; hand-written ones are a dozen lines per table.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::atom::Atom;
use crate::native::{NativeKind, NativeValue};

/// Opaque identity of a tagged field within a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldToken(usize);

impl FieldToken {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One tagged field: the OVSDB column it maps to and its native shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBinding {
    pub column: &'static str,
    pub kind: NativeKind,
}

/// An aggregate whose tagged fields mirror columns of one table.
pub trait Record: Clone + Default {
    /// Table this record type is declared against.
    fn table_name() -> &'static str;

    /// Static bindings, indexed by `FieldToken`. Untagged fields simply do
    /// not appear here.
    fn bindings() -> &'static [FieldBinding];

    /// Copy a field out. `None` when the token is out of range.
    fn field(&self, token: FieldToken) -> Option<NativeValue>;

    /// Copy a value in. `false` when the token is out of range or the value
    /// shape does not fit the field.
    fn set_field(&mut self, token: FieldToken, value: NativeValue) -> bool;

    /// Token of the field bound to a column, if any.
    fn token_of(column: &str) -> Option<FieldToken> {
        Self::bindings()
            .iter()
            .position(|binding| binding.column == column)
            .map(FieldToken::new)
    }
}

/// Conversion from an atom into a field scalar.
pub trait FromAtom: Sized {
    fn from_atom(atom: Atom) -> Option<Self>;
}

impl FromAtom for i64 {
    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::Integer(n) => Some(n),
            _ => None,
        }
    }
}

impl FromAtom for f64 {
    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::Real(r) => Some(r),
            Atom::Integer(n) => Some(n as f64),
            _ => None,
        }
    }
}

impl FromAtom for bool {
    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::Boolean(b) => Some(b),
            _ => None,
        }
    }
}

impl FromAtom for String {
    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }
}

impl FromAtom for Uuid {
    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::Uuid(uuid) => Some(uuid),
            _ => None,
        }
    }
}

/// Conversion from a native value into a field shape.
pub trait FromNative: Sized {
    fn from_native(value: NativeValue) -> Option<Self>;
}

impl<T: FromAtom> FromNative for Option<T> {
    fn from_native(value: NativeValue) -> Option<Self> {
        match value {
            NativeValue::Optional(None) => Some(None),
            NativeValue::Optional(Some(atom)) => T::from_atom(atom).map(Some),
            _ => None,
        }
    }
}

impl<T: FromAtom> FromNative for Vec<T> {
    fn from_native(value: NativeValue) -> Option<Self> {
        match value {
            NativeValue::Set(atoms) => atoms.into_iter().map(T::from_atom).collect(),
            _ => None,
        }
    }
}

impl<K: FromAtom + Ord, V: FromAtom> FromNative for BTreeMap<K, V> {
    fn from_native(value: NativeValue) -> Option<Self> {
        match value {
            NativeValue::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| Some((K::from_atom(k)?, V::from_atom(v)?)))
                .collect(),
            _ => None,
        }
    }
}

macro_rules! scalar_from_native {
    ($($ty:ty),*) => {
        $(impl FromNative for $ty {
            fn from_native(value: NativeValue) -> Option<Self> {
                match value {
                    NativeValue::Scalar(atom) => <$ty>::from_atom(atom),
                    _ => None,
                }
            }
        })*
    };
}

scalar_from_native!(i64, f64, bool, String, Uuid);

/// Conversion from a field shape into a native value.
pub trait IntoNative {
    fn into_native(self) -> NativeValue;
}

impl<T: Into<Atom>> IntoNative for Option<T> {
    fn into_native(self) -> NativeValue {
        NativeValue::Optional(self.map(Into::into))
    }
}

impl<T: Into<Atom>> IntoNative for Vec<T> {
    fn into_native(self) -> NativeValue {
        NativeValue::Set(self.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<Atom>, V: Into<Atom>> IntoNative for BTreeMap<K, V> {
    fn into_native(self) -> NativeValue {
        NativeValue::Map(
            self.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

macro_rules! scalar_into_native {
    ($($ty:ty),*) => {
        $(impl IntoNative for $ty {
            fn into_native(self) -> NativeValue {
                NativeValue::Scalar(self.into())
            }
        })*
    };
}

scalar_into_native!(i64, f64, bool, String, Uuid);

/// Assign a native value into a typed field slot. The building block for
/// `Record::set_field` impls.
pub fn assign<T: FromNative>(slot: &mut T, value: NativeValue) -> bool {
    match T::from_native(value) {
        Some(converted) => {
            *slot = converted;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldBinding, FieldToken, IntoNative, Record, assign};
    use crate::atom::{Atom, AtomKind};
    use crate::native::{NativeKind, NativeValue};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Port {
        uuid: Uuid,
        name: String,
        tag: Option<i64>,
        addresses: Vec<String>,
        external_ids: BTreeMap<String, String>,
    }

    impl Record for Port {
        fn table_name() -> &'static str {
            "Logical_Switch_Port"
        }

        fn bindings() -> &'static [FieldBinding] {
            &[
                FieldBinding {
                    column: "_uuid",
                    kind: NativeKind::Scalar(AtomKind::Uuid),
                },
                FieldBinding {
                    column: "name",
                    kind: NativeKind::Scalar(AtomKind::String),
                },
                FieldBinding {
                    column: "tag",
                    kind: NativeKind::Optional(AtomKind::Integer),
                },
                FieldBinding {
                    column: "addresses",
                    kind: NativeKind::Set(AtomKind::String),
                },
                FieldBinding {
                    column: "external_ids",
                    kind: NativeKind::Map(AtomKind::String, AtomKind::String),
                },
            ]
        }

        fn field(&self, token: FieldToken) -> Option<NativeValue> {
            match token.index() {
                0 => Some(self.uuid.into_native()),
                1 => Some(self.name.clone().into_native()),
                2 => Some(self.tag.into_native()),
                3 => Some(self.addresses.clone().into_native()),
                4 => Some(self.external_ids.clone().into_native()),
                _ => None,
            }
        }

        fn set_field(&mut self, token: FieldToken, value: NativeValue) -> bool {
            match token.index() {
                0 => assign(&mut self.uuid, value),
                1 => assign(&mut self.name, value),
                2 => assign(&mut self.tag, value),
                3 => assign(&mut self.addresses, value),
                4 => assign(&mut self.external_ids, value),
                _ => false,
            }
        }
    }

    #[test]
    fn tokens_resolve_by_column_name() {
        let token = Port::token_of("tag").expect("token");
        assert_eq!(token, FieldToken::new(2));
        assert!(Port::token_of("nope").is_none());
    }

    #[test]
    fn fields_copy_out_and_in() {
        let mut port = Port {
            name: "lsp1".to_string(),
            tag: Some(7),
            ..Port::default()
        };
        assert_eq!(
            port.field(FieldToken::new(1)),
            Some(NativeValue::Scalar(Atom::String("lsp1".to_string())))
        );

        assert!(port.set_field(
            FieldToken::new(2),
            NativeValue::Optional(Some(Atom::Integer(9)))
        ));
        assert_eq!(port.tag, Some(9));
    }

    #[test]
    fn shape_mismatch_leaves_field_untouched() {
        let mut port = Port::default();
        assert!(!port.set_field(
            FieldToken::new(1),
            NativeValue::Optional(Some(Atom::Integer(9)))
        ));
        assert_eq!(port.name, "");
    }
}
