//! Schema-driven translation between wire values and native record shapes.

use std::collections::BTreeMap;
use std::fmt;

use crate::atom::{Atom, AtomKind};
use crate::error::{OvsdbError, Result};
use crate::schema::{BaseType, ColumnType};
use crate::value::Value;

/// The native shape a column projects to on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Scalar(AtomKind),
    Optional(AtomKind),
    Set(AtomKind),
    Map(AtomKind, AtomKind),
}

impl NativeKind {
    /// Native shape of a column type.
    #[must_use]
    pub fn of_column(column: &ColumnType) -> Self {
        if let Some(value) = &column.value {
            Self::Map(column.key.kind, value.kind)
        } else if column.is_scalar() {
            if column.min == 0 {
                Self::Optional(column.key.kind)
            } else {
                Self::Scalar(column.key.kind)
            }
        } else {
            Self::Set(column.key.kind)
        }
    }
}

impl fmt::Display for NativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(kind) => write!(f, "{kind}"),
            Self::Optional(kind) => write!(f, "optional {kind}"),
            Self::Set(kind) => write!(f, "set of {kind}"),
            Self::Map(key, value) => write!(f, "map of {key} to {value}"),
        }
    }
}

/// A column value in its native shape.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Scalar(Atom),
    Optional(Option<Atom>),
    Set(Vec<Atom>),
    Map(BTreeMap<Atom, Atom>),
}

impl NativeValue {
    /// Whether this value has the shape (and element kinds) of `kind`.
    /// An absent optional matches any element kind.
    #[must_use]
    pub fn matches_kind(&self, kind: &NativeKind) -> bool {
        match (self, kind) {
            (Self::Scalar(atom), NativeKind::Scalar(want)) => atom.kind() == *want,
            (Self::Optional(None), NativeKind::Optional(_)) => true,
            (Self::Optional(Some(atom)), NativeKind::Optional(want)) => atom.kind() == *want,
            (Self::Set(atoms), NativeKind::Set(want)) => {
                atoms.iter().all(|atom| atom.kind() == *want)
            }
            (Self::Map(pairs), NativeKind::Map(want_key, want_value)) => {
                pairs.iter().all(|(key, value)| {
                    key.kind() == *want_key && value.kind() == *want_value
                })
            }
            _ => false,
        }
    }
}

/// A scalar-or-absent wire value: bare atom, one-element set, or empty set.
/// Every `max = 1` column routes through this one helper.
fn optional_from_wire(column: &ColumnType, wire: &Value) -> Result<Option<Atom>> {
    match wire {
        Value::Atom(atom) => Ok(Some(coerce_atom(&column.key, atom)?)),
        Value::Set(atoms) => match atoms.as_slice() {
            [] => Ok(None),
            [atom] => Ok(Some(coerce_atom(&column.key, atom)?)),
            _ => Err(OvsdbError::ArityViolation {
                column: String::new(),
                reason: format!("{} elements in a max-1 column", atoms.len()),
            }),
        },
        Value::Map(_) => Err(OvsdbError::InvalidValue {
            context: "value".to_string(),
            reason: "map value in a scalar column".to_string(),
        }),
    }
}

/// The canonical wire form of a scalar-or-absent value: bare atom when
/// present, empty set when absent.
fn optional_to_wire(atom: Option<&Atom>) -> Value {
    match atom {
        Some(atom) => Value::Atom(atom.clone()),
        None => Value::empty_set(),
    }
}

/// JSON numbers without a fraction decode as integers; lift them into
/// reals when the column calls for reals.
fn coerce_atom(base: &BaseType, atom: &Atom) -> Result<Atom> {
    match (base.kind, atom) {
        (AtomKind::Real, Atom::Integer(n)) => Ok(Atom::Real(*n as f64)),
        _ if atom.kind() == base.kind => Ok(atom.clone()),
        _ => Err(OvsdbError::InvalidValue {
            context: "value".to_string(),
            reason: format!("expected {} atom, got {atom:?}", base.kind),
        }),
    }
}

/// Convert a wire value into its native shape under a column schema.
pub fn ovs_to_native(column: &ColumnType, wire: &Value) -> Result<NativeValue> {
    match NativeKind::of_column(column) {
        NativeKind::Scalar(kind) => Ok(NativeValue::Scalar(
            optional_from_wire(column, wire)?.unwrap_or_else(|| Atom::zero(kind)),
        )),
        NativeKind::Optional(_) => Ok(NativeValue::Optional(optional_from_wire(column, wire)?)),
        NativeKind::Set(_) => match wire {
            Value::Atom(atom) => Ok(NativeValue::Set(vec![coerce_atom(&column.key, atom)?])),
            Value::Set(atoms) => Ok(NativeValue::Set(
                atoms
                    .iter()
                    .map(|atom| coerce_atom(&column.key, atom))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Map(_) => Err(OvsdbError::InvalidValue {
                context: "value".to_string(),
                reason: "map value in a set column".to_string(),
            }),
        },
        NativeKind::Map(_, _) => match wire {
            Value::Map(pairs) => {
                let value_base = column.value.as_ref().unwrap_or(&column.key);
                let mut native = BTreeMap::new();
                for (key, value) in pairs {
                    native.insert(
                        coerce_atom(&column.key, key)?,
                        coerce_atom(value_base, value)?,
                    );
                }
                Ok(NativeValue::Map(native))
            }
            Value::Set(atoms) if atoms.is_empty() => Ok(NativeValue::Map(BTreeMap::new())),
            other => Err(OvsdbError::InvalidValue {
                context: "value".to_string(),
                reason: format!("non-map value in a map column: {other:?}"),
            }),
        },
    }
}

/// Convert a native value into its canonical wire form under a column
/// schema, validating on the way out.
pub fn native_to_ovs(column: &ColumnType, native: &NativeValue) -> Result<Value> {
    validate(column, native)?;
    match native {
        NativeValue::Scalar(atom) => Ok(optional_to_wire(Some(atom))),
        NativeValue::Optional(atom) => Ok(optional_to_wire(atom.as_ref())),
        NativeValue::Set(atoms) => {
            let mut sorted = atoms
                .iter()
                .map(|atom| coerce_atom(&column.key, atom))
                .collect::<Result<Vec<_>>>()?;
            sorted.sort();
            Ok(Value::Set(sorted))
        }
        NativeValue::Map(pairs) => {
            let value_base = column.value.as_ref().unwrap_or(&column.key);
            let mut wire = BTreeMap::new();
            for (key, value) in pairs {
                wire.insert(
                    coerce_atom(&column.key, key)?,
                    coerce_atom(value_base, value)?,
                );
            }
            Ok(Value::Map(wire))
        }
    }
}

/// Whether a native value is the default of its column: the zero of the
/// atomic type, an empty set or map, or an absent optional.
#[must_use]
pub fn is_default(_column: &ColumnType, native: &NativeValue) -> bool {
    match native {
        NativeValue::Scalar(atom) => atom.is_zero(),
        NativeValue::Optional(atom) => atom.is_none(),
        NativeValue::Set(atoms) => atoms.is_empty(),
        NativeValue::Map(pairs) => pairs.is_empty(),
    }
}

/// Schema-aware equality: sets compare as multisets, reals compare after
/// integer lifting.
#[must_use]
pub fn equal(column: &ColumnType, a: &NativeValue, b: &NativeValue) -> bool {
    match (native_to_ovs(column, a), native_to_ovs(column, b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Check a native value against a column schema: shape, element kinds,
/// enum membership, numeric and length constraints, arity.
pub fn validate(column: &ColumnType, native: &NativeValue) -> Result<()> {
    let kind = NativeKind::of_column(column);
    let shape_error = || OvsdbError::InvalidValue {
        context: "value".to_string(),
        reason: format!("value {native:?} does not fit a {kind} column"),
    };
    match (native, &kind) {
        (NativeValue::Scalar(atom), NativeKind::Scalar(_)) => {
            check_atom(&column.key, atom)?;
        }
        (NativeValue::Optional(None), NativeKind::Optional(_)) => {}
        (NativeValue::Optional(Some(atom)), NativeKind::Optional(_)) => {
            check_atom(&column.key, atom)?;
        }
        (NativeValue::Set(atoms), NativeKind::Set(_)) => {
            if atoms.len() < column.min {
                return Err(OvsdbError::ArityViolation {
                    column: String::new(),
                    reason: format!("{} elements, minimum {}", atoms.len(), column.min),
                });
            }
            if !column.max.admits(atoms.len()) {
                return Err(OvsdbError::ArityViolation {
                    column: String::new(),
                    reason: format!("{} elements over maximum", atoms.len()),
                });
            }
            for atom in atoms {
                check_atom(&column.key, atom)?;
            }
        }
        (NativeValue::Map(pairs), NativeKind::Map(_, _)) => {
            if pairs.len() < column.min {
                return Err(OvsdbError::ArityViolation {
                    column: String::new(),
                    reason: format!("{} entries, minimum {}", pairs.len(), column.min),
                });
            }
            if !column.max.admits(pairs.len()) {
                return Err(OvsdbError::ArityViolation {
                    column: String::new(),
                    reason: format!("{} entries over maximum", pairs.len()),
                });
            }
            let value_base = column.value.as_ref().unwrap_or(&column.key);
            for (key, value) in pairs {
                check_atom(&column.key, key)?;
                check_atom(value_base, value)?;
            }
        }
        _ => return Err(shape_error()),
    }
    Ok(())
}

fn check_atom(base: &BaseType, atom: &Atom) -> Result<()> {
    let atom = coerce_atom(base, atom)?;
    if let Some(members) = &base.enum_members {
        if !members.contains(&atom) {
            return Err(OvsdbError::EnumOutOfRange {
                column: String::new(),
                value: format!("{atom:?}"),
            });
        }
    }
    let constraint = |reason: String| OvsdbError::InvalidValue {
        context: "value".to_string(),
        reason,
    };
    match &atom {
        Atom::Integer(n) => {
            if base.min_integer.is_some_and(|min| *n < min)
                || base.max_integer.is_some_and(|max| *n > max)
            {
                return Err(constraint(format!("integer {n} out of declared range")));
            }
        }
        Atom::Real(r) => {
            if base.min_real.is_some_and(|min| *r < min)
                || base.max_real.is_some_and(|max| *r > max)
            {
                return Err(constraint(format!("real {r} out of declared range")));
            }
        }
        Atom::String(s) => {
            if base.min_length.is_some_and(|min| s.chars().count() < min)
                || base.max_length.is_some_and(|max| s.chars().count() > max)
            {
                return Err(constraint(format!("string length {} out of declared range", s.len())));
            }
        }
        Atom::Boolean(_) | Atom::Uuid(_) | Atom::NamedUuid(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NativeKind, NativeValue, equal, is_default, native_to_ovs, ovs_to_native, validate};
    use crate::atom::{Atom, AtomKind};
    use crate::schema::{Arity, ColumnType};
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn enum_column(members: &[&str]) -> ColumnType {
        let mut column = ColumnType::scalar(AtomKind::String);
        column.key.enum_members =
            Some(members.iter().map(|m| Atom::String((*m).to_string())).collect());
        column
    }

    #[test]
    fn scalar_accepts_bare_atom_and_single_set() {
        let column = ColumnType::scalar(AtomKind::String);
        let bare = Value::Atom(Atom::String("ls1".to_string()));
        let single = Value::Set(vec![Atom::String("ls1".to_string())]);
        let expect = NativeValue::Scalar(Atom::String("ls1".to_string()));
        assert_eq!(ovs_to_native(&column, &bare).expect("bare"), expect);
        assert_eq!(ovs_to_native(&column, &single).expect("single"), expect);
    }

    #[test]
    fn absent_optional_decodes_none_and_reencodes_empty_set() {
        let column = ColumnType::optional(AtomKind::Integer);
        let native = ovs_to_native(&column, &Value::empty_set()).expect("decode");
        assert_eq!(native, NativeValue::Optional(None));
        let wire = native_to_ovs(&column, &native).expect("encode");
        assert_eq!(wire, Value::empty_set());
    }

    #[test]
    fn present_optional_encodes_as_bare_atom() {
        let column = ColumnType::optional(AtomKind::Integer);
        let native = NativeValue::Optional(Some(Atom::Integer(7)));
        assert_eq!(
            native_to_ovs(&column, &native).expect("encode"),
            Value::Atom(Atom::Integer(7))
        );
    }

    #[test]
    fn round_trip_preserves_sets_up_to_order() {
        let column = ColumnType::set(AtomKind::String);
        let native = NativeValue::Set(vec![
            Atom::String("b".to_string()),
            Atom::String("a".to_string()),
        ]);
        let wire = native_to_ovs(&column, &native).expect("encode");
        let back = ovs_to_native(&column, &wire).expect("decode");
        assert!(equal(&column, &native, &back));
    }

    #[test]
    fn enum_membership_is_enforced() {
        let column = enum_column(&["router", "localnet"]);
        let ok = NativeValue::Scalar(Atom::String("router".to_string()));
        let bad = NativeValue::Scalar(Atom::String("bridge".to_string()));
        assert!(validate(&column, &ok).is_ok());
        assert!(matches!(
            validate(&column, &bad),
            Err(crate::error::OvsdbError::EnumOutOfRange { .. })
        ));
    }

    #[test]
    fn set_arity_bounds_are_enforced() {
        let mut column = ColumnType::set(AtomKind::Integer);
        column.min = 1;
        column.max = Arity::Finite(2);
        assert!(validate(&column, &NativeValue::Set(vec![])).is_err());
        assert!(validate(&column, &NativeValue::Set(vec![Atom::Integer(1)])).is_ok());
        assert!(
            validate(
                &column,
                &NativeValue::Set(vec![Atom::Integer(1), Atom::Integer(2), Atom::Integer(3)])
            )
            .is_err()
        );
    }

    #[test]
    fn integer_atoms_lift_into_real_columns() {
        let column = ColumnType::scalar(AtomKind::Real);
        let native = ovs_to_native(&column, &Value::Atom(Atom::Integer(3))).expect("decode");
        assert_eq!(native, NativeValue::Scalar(Atom::Real(3.0)));
    }

    #[test]
    fn integer_range_constraints_apply() {
        let mut column = ColumnType::scalar(AtomKind::Integer);
        column.key.min_integer = Some(0);
        column.key.max_integer = Some(4095);
        assert!(validate(&column, &NativeValue::Scalar(Atom::Integer(7))).is_ok());
        assert!(validate(&column, &NativeValue::Scalar(Atom::Integer(9000))).is_err());
    }

    #[test]
    fn defaults_cover_all_shapes() {
        let scalar = ColumnType::scalar(AtomKind::Integer);
        assert!(is_default(&scalar, &NativeValue::Scalar(Atom::Integer(0))));
        assert!(!is_default(&scalar, &NativeValue::Scalar(Atom::Integer(1))));

        let optional = ColumnType::optional(AtomKind::String);
        assert!(is_default(&optional, &NativeValue::Optional(None)));
        assert!(!is_default(
            &optional,
            &NativeValue::Optional(Some(Atom::String(String::new())))
        ));

        let map = ColumnType::map(AtomKind::String, AtomKind::String);
        assert!(is_default(&map, &NativeValue::Map(BTreeMap::new())));
    }

    #[test]
    fn map_values_type_check_key_and_value() {
        let column = ColumnType::map(AtomKind::String, AtomKind::Integer);
        assert_eq!(
            NativeKind::of_column(&column),
            NativeKind::Map(AtomKind::String, AtomKind::Integer)
        );
        let mut good = BTreeMap::new();
        good.insert(Atom::String("vlan".to_string()), Atom::Integer(7));
        assert!(validate(&column, &NativeValue::Map(good)).is_ok());

        let mut bad = BTreeMap::new();
        bad.insert(Atom::Integer(7), Atom::Integer(7));
        assert!(validate(&column, &NativeValue::Map(bad)).is_err());
    }
}
