//! Argument and exports schemas, value binding and validation.
//!
//! The controller has no structural reflection over component argument types,
//! so each component type describes the shape of its arguments with an
//! [`ArgumentsSpec`]: a flat list of fields, each with a kind, an optional
//! default, and a required flag. Nested blocks are expressed as fields of
//! kind [`FieldKind::Object`] carrying their own spec.
//!
//! The loader evaluates a block's attribute expressions and binds the results
//! onto the spec, yielding the opaque [`Arguments`] value that
//! [`Component::update`](super::Component::update) consumes.
//!
//! Component types that publish exports declare their shape the same way
//! with an [`ExportsSpec`]. The controller validates every published value
//! against it and rejects configurations that reference fields a component
//! does not export.

use thiserror::Error;

use crate::config::Value;

/// The declared shape of a component's arguments.
#[derive(Debug, Clone, Default)]
pub struct ArgumentsSpec {
    fields: Vec<FieldSpec>,
}

/// One declared argument field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
}

/// The kind of value a field accepts.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Bool,
    Int,
    /// Accepts floats and ints (ints are widened).
    Float,
    String,
    Array,
    /// A nested block with its own shape.
    Object(ArgumentsSpec),
    /// Accepts any value, including whole export objects.
    Any,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::String => "string",
            FieldKind::Array => "array",
            FieldKind::Object(_) => "object",
            FieldKind::Any => "any",
        }
    }
}

impl ArgumentsSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a required field.
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
            default: None,
        });
        self
    }

    /// Declares an optional field, filled with `default` when absent.
    pub fn optional(mut self, name: &'static str, kind: FieldKind, default: Option<Value>) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
            default,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn find(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Binds evaluated attribute values onto this spec.
    ///
    /// Unknown attributes, missing required fields and kind mismatches are
    /// rejected; optional fields absent from `attrs` take their default.
    pub fn bind(&self, attrs: &[(String, Value)]) -> Result<Arguments, BindError> {
        let mut out = std::collections::BTreeMap::new();
        for (name, value) in attrs {
            let field = self.find(name).ok_or_else(|| BindError {
                attribute: name.clone(),
                message: format!("unsupported attribute \"{name}\""),
            })?;
            let value = check_kind(field, value)?;
            if out.insert(name.clone(), value).is_some() {
                return Err(BindError {
                    attribute: name.clone(),
                    message: format!("attribute \"{name}\" set more than once"),
                });
            }
        }
        for field in &self.fields {
            if out.contains_key(field.name) {
                continue;
            }
            if let Some(default) = &field.default {
                out.insert(field.name.to_owned(), default.clone());
            } else if field.required {
                return Err(BindError {
                    attribute: field.name.to_owned(),
                    message: format!("missing required attribute \"{}\"", field.name),
                });
            }
        }
        Ok(Arguments(Value::Object(out)))
    }
}

fn check_kind(field: &FieldSpec, value: &Value) -> Result<Value, BindError> {
    let mismatch = || BindError {
        attribute: field.name.to_owned(),
        message: format!(
            "attribute \"{}\" expects a {} value, got {}",
            field.name,
            field.kind.name(),
            value.kind()
        ),
    };
    match (&field.kind, value) {
        (FieldKind::Any, v) => Ok(v.clone()),
        (FieldKind::Bool, v @ Value::Bool(_)) => Ok(v.clone()),
        (FieldKind::Int, v @ Value::Int(_)) => Ok(v.clone()),
        (FieldKind::Float, v @ Value::Float(_)) => Ok(v.clone()),
        (FieldKind::Float, Value::Int(n)) => Ok(Value::Float(*n as f64)),
        (FieldKind::String, v @ Value::String(_)) => Ok(v.clone()),
        (FieldKind::Array, v @ Value::Array(_)) => Ok(v.clone()),
        (FieldKind::Object(nested), Value::Object(entries)) => {
            let attrs: Vec<(String, Value)> =
                entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let bound = nested.bind(&attrs).map_err(|e| BindError {
                attribute: format!("{}.{}", field.name, e.attribute),
                message: e.message,
            })?;
            Ok(bound.into_value())
        }
        _ => Err(mismatch()),
    }
}

/// The declared shape of a component's exports.
///
/// Mirrors [`ArgumentsSpec`]: a flat list of named fields with kinds.
/// Required fields must be present in every published value; optional fields
/// may be absent.
#[derive(Debug, Clone, Default)]
pub struct ExportsSpec {
    fields: Vec<FieldSpec>,
}

impl ExportsSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field present in every published exports value.
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
            default: None,
        });
        self
    }

    /// Declares a field that may be absent from a published value.
    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
            default: None,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks a published exports value against this spec.
    ///
    /// The value must be an object; unknown fields, missing required fields
    /// and kind mismatches are rejected.
    pub fn validate(&self, value: &Value) -> Result<(), BindError> {
        let Some(entries) = value.as_object() else {
            return Err(BindError {
                attribute: String::new(),
                message: format!("exports must be an object, got {}", value.kind()),
            });
        };
        for (name, field_value) in entries {
            let field = self.get(name).ok_or_else(|| BindError {
                attribute: name.clone(),
                message: format!("unknown exported field \"{name}\""),
            })?;
            check_shape(field.name, &field.kind, field_value)?;
        }
        for field in &self.fields {
            if field.required && !entries.contains_key(field.name) {
                return Err(BindError {
                    attribute: field.name.to_owned(),
                    message: format!("missing exported field \"{}\"", field.name),
                });
            }
        }
        Ok(())
    }
}

/// Non-coercing kind check used for exports validation.
fn check_shape(name: &str, kind: &FieldKind, value: &Value) -> Result<(), BindError> {
    let mismatch = || BindError {
        attribute: name.to_owned(),
        message: format!(
            "field \"{}\" expects a {} value, got {}",
            name,
            kind.name(),
            value.kind()
        ),
    };
    match (kind, value) {
        (FieldKind::Any, _)
        | (FieldKind::Bool, Value::Bool(_))
        | (FieldKind::Int, Value::Int(_))
        | (FieldKind::Float, Value::Float(_))
        | (FieldKind::Float, Value::Int(_))
        | (FieldKind::String, Value::String(_))
        | (FieldKind::Array, Value::Array(_)) => Ok(()),
        (FieldKind::Object(nested), Value::Object(entries)) => {
            for (key, nested_value) in entries {
                let field = nested.find(key).ok_or_else(|| BindError {
                    attribute: format!("{name}.{key}"),
                    message: format!("unknown field \"{name}.{key}\""),
                })?;
                check_shape(&format!("{name}.{key}"), &field.kind, nested_value)?;
            }
            for field in nested.fields() {
                if field.required && field.default.is_none() && !entries.contains_key(field.name) {
                    return Err(BindError {
                        attribute: format!("{name}.{}", field.name),
                        message: format!("missing field \"{name}.{}\"", field.name),
                    });
                }
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

/// Typed, validated arguments for one component instance.
///
/// Always an object value whose keys follow the component's
/// [`ArgumentsSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct Arguments(Value);

impl Arguments {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Looks up a top-level argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.as_object()?.get(name)
    }
}

/// An attribute that failed to bind onto a component's argument schema.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BindError {
    pub attribute: String,
    pub message: String,
}
