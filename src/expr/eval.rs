//! Tree-walking evaluator for parsed expressions

use super::env::Environment;
use super::error::ExprError;
use super::parser::{BinaryOp, Expr, MacroName, UnaryOp};
use super::value::Value;

/// Evaluate an expression against an environment
pub fn evaluate(expr: &Expr, env: &Environment) -> Result<Value, ExprError> {
    let mut scope = Scope::new(env);
    eval(expr, &mut scope)
}

/// Environment plus macro-bound locals
struct Scope<'a> {
    env: &'a Environment,
    locals: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    fn new(env: &'a Environment) -> Self {
        Self {
            env,
            locals: Vec::new(),
        }
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        // innermost macro binding shadows outer names
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .or_else(|| self.env.resolve(name).cloned())
    }
}

fn eval(expr: &Expr, scope: &mut Scope<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        Expr::Ident(name) => scope.resolve(name).ok_or_else(|| {
            ExprError::unresolved(format!("unknown identifier '{}'", name))
        }),

        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),

        Expr::Member {
            base,
            name,
            optional,
        } => {
            let base_value = eval(base, scope)?;
            match base_value {
                Value::Null if *optional => Ok(Value::Null),
                Value::Null => Err(ExprError::unresolved(format!(
                    "cannot access field '{}' of null",
                    name
                ))),
                Value::Object(map) => match map.get(name) {
                    Some(v) => Ok(v.clone()),
                    None if *optional => Ok(Value::Null),
                    None => Err(ExprError::unresolved(format!(
                        "field '{}' not found",
                        name
                    ))),
                },
                other => Err(ExprError::type_mismatch(format!(
                    "cannot access field '{}' of {}",
                    name,
                    other.type_name()
                ))),
            }
        }

        Expr::Index { base, index } => {
            let base_value = eval(base, scope)?;
            let index_value = eval(index, scope)?;
            match (&base_value, &index_value) {
                (Value::List(items), Value::Int(i)) => {
                    let idx = usize::try_from(*i).map_err(|_| {
                        ExprError::eval(format!("negative index {}", i))
                    })?;
                    items.get(idx).cloned().ok_or_else(|| {
                        ExprError::unresolved(format!(
                            "index {} out of bounds (len {})",
                            i,
                            items.len()
                        ))
                    })
                }
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().ok_or_else(|| {
                        ExprError::unresolved(format!("key '{}' not found", key))
                    })
                }
                (base, index) => Err(ExprError::type_mismatch(format!(
                    "cannot index {} with {}",
                    base.type_name(),
                    index.type_name()
                ))),
            }
        }

        Expr::Unary { op, expr } => {
            let value = eval(expr, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.as_condition()?)),
                UnaryOp::Neg => match value {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| ExprError::eval("integer overflow in negation")),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(ExprError::type_mismatch(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
            }
        }

        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope),

        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if eval(cond, scope)?.as_condition()? {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }

        Expr::Call { name, args } => eval_call(name, args, scope),

        Expr::Macro {
            base,
            name,
            var,
            body,
        } => eval_macro(base, *name, var, body, scope),
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &mut Scope<'_>,
) -> Result<Value, ExprError> {
    // short-circuit forms first
    match op {
        BinaryOp::Coalesce => {
            let left = eval(lhs, scope)?;
            return if left.is_null() { eval(rhs, scope) } else { Ok(left) };
        }
        BinaryOp::And => {
            if !eval(lhs, scope)?.as_condition()? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval(rhs, scope)?.as_condition()?));
        }
        BinaryOp::Or => {
            if eval(lhs, scope)?.as_condition()? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval(rhs, scope)?.as_condition()?));
        }
        _ => {}
    }

    let left = eval(lhs, scope)?;
    let right = eval(rhs, scope)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(&right))),
        BinaryOp::Ne => Ok(Value::Bool(!left.loose_eq(&right))),
        BinaryOp::Lt => Ok(Value::Bool(left.compare(&right)?.is_lt())),
        BinaryOp::Le => Ok(Value::Bool(left.compare(&right)?.is_le())),
        BinaryOp::Gt => Ok(Value::Bool(left.compare(&right)?.is_gt())),
        BinaryOp::Ge => Ok(Value::Bool(left.compare(&right)?.is_ge())),
        BinaryOp::Add => left.add(&right),
        BinaryOp::Sub => left.sub(&right),
        BinaryOp::Mul => left.mul(&right),
        BinaryOp::Div => left.div(&right),
        BinaryOp::Rem => left.rem(&right),
        BinaryOp::Coalesce | BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(name: &str, args: &[Expr], scope: &mut Scope<'_>) -> Result<Value, ExprError> {
    if args.len() != 1 {
        return Err(ExprError::eval(format!(
            "{}() takes exactly one argument, got {}",
            name,
            args.len()
        )));
    }
    let arg = eval(&args[0], scope)?;
    match name {
        "size" => arg.size(),
        "string" => Ok(Value::String(arg.to_string())),
        "int" => match &arg {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                ExprError::eval(format!("cannot convert '{}' to int", s))
            }),
            other => Err(ExprError::type_mismatch(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        },
        "float" => match &arg {
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                ExprError::eval(format!("cannot convert '{}' to float", s))
            }),
            other => Err(ExprError::type_mismatch(format!(
                "cannot convert {} to float",
                other.type_name()
            ))),
        },
        "bool" => match &arg {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ExprError::eval(format!("cannot convert '{}' to bool", s))),
            },
            other => Err(ExprError::type_mismatch(format!(
                "cannot convert {} to bool",
                other.type_name()
            ))),
        },
        other => Err(ExprError::eval(format!("unknown function '{}'", other))),
    }
}

fn eval_macro(
    base: &Expr,
    name: MacroName,
    var: &str,
    body: &Expr,
    scope: &mut Scope<'_>,
) -> Result<Value, ExprError> {
    let items = match eval(base, scope)? {
        Value::List(items) => items,
        other => {
            return Err(ExprError::type_mismatch(format!(
                "list predicate requires an array, got {}",
                other.type_name()
            )));
        }
    };

    let mut matched = 0usize;
    let mut filtered = Vec::new();
    let mut mapped = Vec::new();

    for item in items {
        scope.locals.push((var.to_string(), item.clone()));
        let result = eval(body, scope);
        scope.locals.pop();
        let result = result?;

        match name {
            MacroName::Map => mapped.push(result),
            MacroName::Filter => {
                if result.as_condition()? {
                    filtered.push(item);
                }
            }
            MacroName::All => {
                if !result.as_condition()? {
                    return Ok(Value::Bool(false));
                }
            }
            MacroName::Exists => {
                if result.as_condition()? {
                    return Ok(Value::Bool(true));
                }
            }
            MacroName::ExistsOne => {
                if result.as_condition()? {
                    matched += 1;
                }
            }
        }
    }

    Ok(match name {
        MacroName::All => Value::Bool(true),
        MacroName::Exists => Value::Bool(false),
        MacroName::ExistsOne => Value::Bool(matched == 1),
        MacroName::Filter => Value::List(filtered),
        MacroName::Map => Value::List(mapped),
    })
}
