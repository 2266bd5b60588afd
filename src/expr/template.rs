//! `${...}` placeholder scanning and document rendering
//!
//! Expressions appear two ways in a resource template: as a standalone field
//! value (`replicas: "${schema.spec.replicas}"`, which keeps the evaluated
//! type) or embedded in a string template
//! (`url: "http://${db.status.host}:5432"`, which splices the rendered text).
//! `$${...}` escapes to a literal `${...}`.

use std::collections::BTreeSet;

use super::env::Environment;
use super::error::ExprError;
use super::eval::evaluate;
use super::parser::Expr;
use super::value::Value;

/// One segment of a scanned string template
#[derive(Clone, Debug, PartialEq)]
pub enum Part {
    /// Literal text, emitted as-is
    Literal(String),
    /// A parsed `${...}` expression
    Expr(Expr),
}

/// Scan a string into literal and expression parts
pub fn scan(src: &str) -> Result<Vec<Part>, ExprError> {
    let bytes = src.as_bytes();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'$') && bytes.get(i + 2) == Some(&b'{') {
            // $${...} renders as literal ${...}
            literal.push_str("${");
            i += 3;
            match src[i..].find('}') {
                Some(end) => {
                    literal.push_str(&src[i..i + end]);
                    literal.push('}');
                    i += end + 1;
                }
                None => {
                    literal.push_str(&src[i..]);
                    i = bytes.len();
                }
            }
        } else if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            let (body, next) = expression_body(src, i + 2)?;
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Expr(Expr::parse(body)?));
            i = next;
        } else {
            let Some(c) = src[i..].chars().next() else {
                break;
            };
            literal.push(c);
            i += c.len_utf8();
        }
    }

    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    Ok(parts)
}

/// Find the closing `}` of an expression starting at `start`, respecting
/// quoted strings inside the expression body
fn expression_body(src: &str, start: usize) -> Result<(&str, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'}' {
                    return Ok((&src[start..i], i + 1));
                }
            }
        }
        i += 1;
    }

    Err(ExprError::parse(format!(
        "unterminated '${{' in template '{}'",
        src
    )))
}

/// Parse a string that must be exactly one `${...}` expression
///
/// Predicates (`readyWhen`, `includeWhen`), status projections, and
/// validation rules all take this form; embedded text would make their
/// boolean/typed results ambiguous.
pub fn parse_standalone(src: &str) -> Result<Expr, ExprError> {
    let body = src
        .trim()
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| {
            ExprError::parse(format!(
                "expected a standalone '${{...}}' expression, got '{src}'"
            ))
        })?;
    Expr::parse(body)
}

/// True if the string contains at least one (unescaped) `${...}` placeholder
pub fn has_expressions(src: &str) -> bool {
    scan(src)
        .map(|parts| parts.iter().any(|p| matches!(p, Part::Expr(_))))
        .unwrap_or(false)
}

/// Evaluate a scanned string
///
/// A string that is exactly one expression keeps the evaluated type; mixed
/// literal/expression strings render each part through Display.
pub fn render_string(src: &str, env: &Environment) -> Result<Value, ExprError> {
    let parts = scan(src)?;

    if let [Part::Expr(expr)] = parts.as_slice() {
        return evaluate(expr, env);
    }

    let mut out = String::new();
    for part in &parts {
        match part {
            Part::Literal(text) => out.push_str(text),
            Part::Expr(expr) => {
                let value = evaluate(expr, env)?;
                out.push_str(&value.to_string());
            }
        }
    }
    Ok(Value::String(out))
}

/// Render every embedded expression in a JSON document
pub fn render_document(
    template: &serde_json::Value,
    env: &Environment,
) -> Result<serde_json::Value, ExprError> {
    match template {
        serde_json::Value::String(s) => Ok(render_string(s, env)?.into()),
        serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|item| render_document(item, env))
                .collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                out.insert(key.clone(), render_document(value, env)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Collect the root identifiers referenced by every expression in a document
///
/// Used by the dependency graph builder; a parse failure anywhere in the
/// document is surfaced so registration can reject the definition.
pub fn document_references(template: &serde_json::Value) -> Result<BTreeSet<String>, ExprError> {
    let mut roots = BTreeSet::new();
    collect(template, &mut roots)?;
    Ok(roots)
}

fn collect(value: &serde_json::Value, roots: &mut BTreeSet<String>) -> Result<(), ExprError> {
    match value {
        serde_json::Value::String(s) => {
            for part in scan(s)? {
                if let Part::Expr(expr) = part {
                    roots.extend(expr.roots());
                }
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect(item, roots)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for value in map.values() {
                collect(value, roots)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(json: serde_json::Value) -> Environment {
        let mut env = Environment::new();
        if let serde_json::Value::Object(map) = json {
            for (k, v) in map {
                env.bind(k, Value::from(v));
            }
        }
        env
    }

    // =========================================================================
    // Story: Standalone vs Embedded Expressions
    // =========================================================================

    /// Story: a field whose value is exactly one expression keeps the
    /// evaluated type, so `replicas: "${schema.spec.replicas}"` stays an
    /// integer in the rendered manifest.
    #[test]
    fn story_standalone_expression_keeps_type() {
        let env = env_with(serde_json::json!({"schema": {"spec": {"replicas": 3}}}));
        let rendered = render_string("${schema.spec.replicas}", &env).unwrap();
        assert_eq!(rendered, Value::Int(3));
    }

    /// Story: expressions embedded in a connection string splice their
    /// rendered text.
    #[test]
    fn story_embedded_expressions_splice_text() {
        let env = env_with(serde_json::json!({
            "db": {"status": {"host": "pg.svc", "port": 5432}}
        }));
        let rendered =
            render_string("postgres://${db.status.host}:${db.status.port}/app", &env).unwrap();
        assert_eq!(rendered, Value::String("postgres://pg.svc:5432/app".into()));
    }

    #[test]
    fn test_escape_produces_literal() {
        let env = Environment::new();
        assert_eq!(
            render_string("$${literal}", &env).unwrap(),
            Value::String("${literal}".into())
        );
        assert_eq!(
            render_string("cost: $100", &env).unwrap(),
            Value::String("cost: $100".into())
        );
    }

    #[test]
    fn test_literal_text_keeps_utf8() {
        let parts = scan("café ${x}").unwrap();
        assert_eq!(parts[0], Part::Literal("café ".into()));

        let env = env_with(serde_json::json!({"x": "ø"}));
        assert_eq!(
            render_string("café ${x}", &env).unwrap(),
            Value::String("café ø".into())
        );
    }

    #[test]
    fn test_unterminated_placeholder_errors() {
        assert!(scan("${a.b").is_err());
    }

    #[test]
    fn test_brace_inside_string_literal() {
        // a '}' inside a quoted string does not close the placeholder
        let env = Environment::new();
        assert_eq!(
            render_string("${'}' + 'x'}", &env).unwrap(),
            Value::String("}x".into())
        );
    }

    // =========================================================================
    // Story: Document Rendering
    // =========================================================================

    #[test]
    fn story_document_rendering_walks_nested_values() {
        let env = env_with(serde_json::json!({
            "schema": {"spec": {"name": "web", "replicas": 2}}
        }));
        let template = serde_json::json!({
            "metadata": {"name": "${schema.spec.name}-deploy"},
            "spec": {
                "replicas": "${schema.spec.replicas}",
                "ports": [{"port": 80}]
            }
        });
        let rendered = render_document(&template, &env).unwrap();
        assert_eq!(rendered["metadata"]["name"], "web-deploy");
        assert_eq!(rendered["spec"]["replicas"], 2);
        assert_eq!(rendered["spec"]["ports"][0]["port"], 80);
    }

    #[test]
    fn test_document_references() {
        let template = serde_json::json!({
            "host": "${db.status.host}",
            "name": "${schema.spec.name}",
            "flags": ["${config.data.mode}"]
        });
        let roots = document_references(&template).unwrap();
        assert_eq!(
            roots,
            BTreeSet::from(["db".to_string(), "schema".to_string(), "config".to_string()])
        );
    }

    #[test]
    fn test_document_references_surfaces_parse_errors() {
        let template = serde_json::json!({"bad": "${a +}"});
        assert!(document_references(&template).is_err());
    }

    #[test]
    fn test_has_expressions() {
        assert!(has_expressions("${a}"));
        assert!(has_expressions("x-${a.b}-y"));
        assert!(!has_expressions("plain"));
        assert!(!has_expressions("$${escaped}"));
    }
}
