//! Schema compiler for GraphDefinition user-facing schemas
//!
//! Turns the `type | default=literal` field-type grammar into validated field
//! descriptors and the OpenAPI v3 structural schema of the generated API.
//! Primitives are `string | integer | boolean | object | array`; nested
//! objects are declared either structurally (a map of fields) or with dotted
//! keys (`db.host: string`).

use std::collections::BTreeMap;

use crate::crd::SchemaSpec;
use crate::expr::Expr;
use crate::Error;

/// Primitive field types of the schema grammar
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Integer
    Integer,
    /// Boolean
    Boolean,
    /// Free-form object
    Object,
    /// Free-form array
    Array,
}

impl FieldType {
    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            "object" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            other => Err(Error::schema(format!(
                "unknown field type '{}' (expected string, integer, boolean, object, or array)",
                other
            ))),
        }
    }

    /// OpenAPI type name
    pub fn openapi_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// True if the JSON value conforms to this type
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// A compiled spec field
#[derive(Clone, Debug, PartialEq)]
pub enum FieldDescriptor {
    /// A leaf field with a primitive type and optional default
    Leaf {
        /// Declared type
        type_: FieldType,
        /// Default applied when the instance omits the field
        default: Option<serde_json::Value>,
    },
    /// A nested object with its own declared fields
    Nested(BTreeMap<String, FieldDescriptor>),
}

/// A compiled status field: a name bound to a projection expression
#[derive(Clone, Debug)]
pub struct StatusField {
    /// Field name in `status`
    pub name: String,
    /// Parsed projection expression
    pub expr: Expr,
    /// Original source text, kept for error messages
    pub source: String,
}

/// A compiled instance validation rule
#[derive(Clone, Debug)]
pub struct CompiledRule {
    /// Parsed boolean expression over `schema`
    pub expr: Expr,
    /// Message surfaced when the rule evaluates to false
    pub message: String,
}

/// The compiled user-facing schema of one GraphDefinition
#[derive(Clone, Debug)]
pub struct CompiledSchema {
    /// Generated API group/version (e.g. `trellis.dev/v1alpha1`)
    pub api_version: String,
    /// Generated kind
    pub kind: String,
    /// Spec field descriptors
    pub spec: BTreeMap<String, FieldDescriptor>,
    /// Expression-valued status fields
    pub status: Vec<StatusField>,
    /// Instance validation rules
    pub validation: Vec<CompiledRule>,
}

impl CompiledSchema {
    /// Compile a user-facing schema declaration
    ///
    /// An ill-typed declaration (unknown type, default not matching its
    /// declared type, malformed status expression) is rejected here, at
    /// definition-registration time.
    pub fn compile(schema: &SchemaSpec) -> Result<Self, Error> {
        let spec_value = serde_json::Value::Object(schema.spec.clone().into_iter().collect());
        let spec = compile_fields(&spec_value, "spec")?;

        let mut status = Vec::new();
        for (name, source) in &schema.status {
            let expr = parse_status_expression(source).map_err(|e| {
                Error::schema(format!("status field '{}': {}", name, e))
            })?;
            status.push(StatusField {
                name: name.clone(),
                expr,
                source: source.clone(),
            });
        }

        let mut validation = Vec::new();
        for rule in &schema.validation {
            let expr = parse_status_expression(&rule.expression).map_err(|e| {
                Error::schema(format!("validation rule '{}': {}", rule.expression, e))
            })?;
            validation.push(CompiledRule {
                expr,
                message: rule.message.clone(),
            });
        }

        Ok(Self {
            api_version: schema.api_version.clone(),
            kind: schema.kind.clone(),
            spec,
            status,
            validation,
        })
    }

    /// Merge declared defaults into an instance spec
    ///
    /// User-supplied values win; defaults fill the gaps. Returns an error
    /// when a supplied value does not match its declared type.
    pub fn apply_defaults(&self, spec: &serde_json::Value) -> Result<serde_json::Value, Error> {
        let mut out = spec.clone();
        if out.is_null() {
            out = serde_json::json!({});
        }
        let map = out
            .as_object_mut()
            .ok_or_else(|| Error::validation("instance spec must be an object"))?;
        merge_defaults(map, &self.spec, "spec")?;
        Ok(out)
    }

    /// OpenAPI v3 structural schema for the generated CRD
    pub fn openapi_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "spec": fields_schema(&self.spec),
                "status": {
                    "type": "object",
                    "x-kubernetes-preserve-unknown-fields": true
                }
            }
        })
    }
}

/// Status and validation expressions must be a single standalone `${...}`
fn parse_status_expression(source: &str) -> Result<Expr, Error> {
    Ok(crate::expr::parse_standalone(source)?)
}

fn compile_fields(
    value: &serde_json::Value,
    path: &str,
) -> Result<BTreeMap<String, FieldDescriptor>, Error> {
    let map = value.as_object().ok_or_else(|| {
        Error::schema(format!("'{}' must be an object of field declarations", path))
    })?;

    let mut out: BTreeMap<String, FieldDescriptor> = BTreeMap::new();
    for (key, decl) in map {
        let field_path = format!("{}.{}", path, key);

        // dotted declaration: "db.host": "string" nests under "db"
        if let Some((head, rest)) = key.split_once('.') {
            let nested = serde_json::json!({ rest: decl });
            let compiled = compile_fields(&nested, &format!("{}.{}", path, head))?;
            match out
                .entry(head.to_string())
                .or_insert_with(|| FieldDescriptor::Nested(BTreeMap::new()))
            {
                FieldDescriptor::Nested(children) => children.extend(compiled),
                FieldDescriptor::Leaf { .. } => {
                    return Err(Error::schema(format!(
                        "field '{}' declared both as leaf and as object",
                        head
                    )));
                }
            }
            continue;
        }

        let descriptor = match decl {
            serde_json::Value::String(decl) => compile_leaf(decl, &field_path)?,
            serde_json::Value::Object(_) => {
                FieldDescriptor::Nested(compile_fields(decl, &field_path)?)
            }
            other => {
                return Err(Error::schema(format!(
                    "field '{}': declaration must be a type string or nested object, got {}",
                    field_path, other
                )));
            }
        };

        if out.contains_key(key) {
            return Err(Error::schema(format!(
                "field '{}' declared both as leaf and as object",
                key
            )));
        }
        out.insert(key.clone(), descriptor);
    }
    Ok(out)
}

/// Parse `type` or `type | default=literal`
fn compile_leaf(decl: &str, path: &str) -> Result<FieldDescriptor, Error> {
    let mut parts = decl.splitn(2, '|');
    let type_ = FieldType::parse(parts.next().unwrap_or("").trim())
        .map_err(|e| Error::schema(format!("field '{}': {}", path, e)))?;

    let default = match parts.next() {
        None => None,
        Some(modifier) => {
            let modifier = modifier.trim();
            let literal = modifier.strip_prefix("default=").ok_or_else(|| {
                Error::schema(format!(
                    "field '{}': unknown modifier '{}' (expected default=literal)",
                    path, modifier
                ))
            })?;
            let value = parse_default_literal(literal, &type_);
            if !type_.matches(&value) {
                return Err(Error::schema(format!(
                    "field '{}': default '{}' does not match declared type {}",
                    path,
                    literal,
                    type_.openapi_type()
                )));
            }
            Some(value)
        }
    };

    Ok(FieldDescriptor::Leaf { type_, default })
}

/// Defaults for string fields are taken verbatim; other types parse as JSON
fn parse_default_literal(literal: &str, type_: &FieldType) -> serde_json::Value {
    let literal = literal.trim();
    if *type_ == FieldType::String {
        let unquoted = literal
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(literal);
        return serde_json::Value::String(unquoted.to_string());
    }
    serde_json::from_str(literal).unwrap_or(serde_json::Value::String(literal.to_string()))
}

fn merge_defaults(
    target: &mut serde_json::Map<String, serde_json::Value>,
    fields: &BTreeMap<String, FieldDescriptor>,
    path: &str,
) -> Result<(), Error> {
    for (name, descriptor) in fields {
        let field_path = format!("{}.{}", path, name);
        match descriptor {
            FieldDescriptor::Leaf { type_, default } => match target.get(name) {
                Some(value) => {
                    if !type_.matches(value) {
                        return Err(Error::validation(format!(
                            "field '{}': expected {}, got {}",
                            field_path,
                            type_.openapi_type(),
                            json_type_name(value)
                        )));
                    }
                }
                None => {
                    if let Some(default) = default {
                        target.insert(name.clone(), default.clone());
                    }
                }
            },
            FieldDescriptor::Nested(children) => {
                let entry = target
                    .entry(name.clone())
                    .or_insert_with(|| serde_json::json!({}));
                let child_map = entry.as_object_mut().ok_or_else(|| {
                    Error::validation(format!("field '{}': expected object", field_path))
                })?;
                merge_defaults(child_map, children, &field_path)?;
            }
        }
    }
    Ok(())
}

fn fields_schema(fields: &BTreeMap<String, FieldDescriptor>) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, descriptor) in fields {
        let schema = match descriptor {
            FieldDescriptor::Leaf { type_, default } => {
                let mut schema = serde_json::Map::new();
                schema.insert(
                    "type".to_string(),
                    serde_json::Value::String(type_.openapi_type().to_string()),
                );
                match type_ {
                    FieldType::Object => {
                        schema.insert(
                            "x-kubernetes-preserve-unknown-fields".to_string(),
                            serde_json::Value::Bool(true),
                        );
                    }
                    FieldType::Array => {
                        schema.insert(
                            "items".to_string(),
                            serde_json::json!({"x-kubernetes-preserve-unknown-fields": true}),
                        );
                    }
                    _ => {}
                }
                if let Some(default) = default {
                    schema.insert("default".to_string(), default.clone());
                }
                serde_json::Value::Object(schema)
            }
            FieldDescriptor::Nested(children) => fields_schema(children),
        };
        properties.insert(name.clone(), schema);
    }
    serde_json::json!({"type": "object", "properties": properties})
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
