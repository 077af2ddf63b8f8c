//! The action protocol: turning one planner line into a validated call.
//!
//! Wire format, one line each:
//!
//! ```text
//! FUNCTION_CALL: {"name": "add", "args": {"a": 2, "b": 3}}
//! FINAL_ANSWER: 42 meters
//! ```
//!
//! Everything here is pure. [`normalize_quasi_json`] repairs the
//! Python-flavoured payloads models like to emit before a strict JSON parse;
//! [`parse_and_validate`] resolves the capability and matches and coerces its
//! arguments against the declared schema.

use serde_json::{Map, Value};
use stepwise_core::capability::{CapabilityRegistry, ParamSpec, ParamType, integral_f64_to_i64};
use stepwise_core::error::ProtocolError;
use stepwise_core::plan::{FINAL_ANSWER_MARKER, FUNCTION_CALL_MARKER, PlanDecision};

/// Rewrite single-quoted strings and bare `None`/`True`/`False` so the text
/// parses as JSON. Content inside string literals is left alone.
pub fn normalize_quasi_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    match inner {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '\'' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(escaped) => {
                                out.push('\\');
                                out.push(escaped);
                            }
                            None => out.push('\\'),
                        },
                        '"' => out.push_str("\\\""),
                        '\'' => break,
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "None" => "null",
                    "True" => "true",
                    "False" => "false",
                    _ => &word,
                });
            }
            other => out.push(other),
        }
    }
    out
}

/// Parse the JSON payload that follows a `FUNCTION_CALL:` marker into its
/// name and raw arguments.
fn parse_call_payload(payload: &str) -> Result<(String, Map<String, Value>), ProtocolError> {
    let payload = payload.trim();
    let value: Value = serde_json::from_str(&normalize_quasi_json(payload)).map_err(|e| {
        ProtocolError::MalformedJson {
            text: payload.to_string(),
            reason: e.to_string(),
        }
    })?;

    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidPayload(format!(
            "expected an object, got: {payload}"
        )));
    };
    let name = match object.remove("name") {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(ProtocolError::InvalidPayload(format!(
                "'name' must be a string, got {other}"
            )));
        }
        None => return Err(ProtocolError::InvalidPayload("missing 'name'".into())),
    };
    let args = match object.remove("args") {
        Some(Value::Object(args)) => args,
        Some(other) => {
            return Err(ProtocolError::InvalidPayload(format!(
                "'args' must be an object, got {other}"
            )));
        }
        None => return Err(ProtocolError::InvalidPayload("missing 'args'".into())),
    };
    if let Some(extra) = object.keys().next() {
        return Err(ProtocolError::InvalidPayload(format!(
            "unexpected key '{extra}' beside 'name' and 'args'"
        )));
    }
    Ok((name, args))
}

/// Classify one planner line. Does not consult a registry.
pub fn decide(line: &str) -> Result<PlanDecision, ProtocolError> {
    let line = line.trim();
    if let Some(text) = line.strip_prefix(FINAL_ANSWER_MARKER) {
        return Ok(PlanDecision::FinalAnswer {
            text: text.trim().to_string(),
        });
    }
    if let Some(payload) = line.strip_prefix(FUNCTION_CALL_MARKER) {
        let (name, args) = parse_call_payload(payload)?;
        return Ok(PlanDecision::FunctionCall { name, args });
    }
    Err(ProtocolError::MissingMarker {
        text: line.to_string(),
    })
}

/// Validate a `FUNCTION_CALL:` line against the registry and return the
/// capability name with its coerced arguments, in declaration order.
pub fn parse_and_validate(
    raw: &str,
    registry: &CapabilityRegistry,
) -> Result<(String, Map<String, Value>), ProtocolError> {
    let raw = raw.trim();
    let payload = raw
        .strip_prefix(FUNCTION_CALL_MARKER)
        .ok_or_else(|| ProtocolError::MissingMarker {
            text: raw.to_string(),
        })?;
    let (name, args) = parse_call_payload(payload)?;

    let descriptor = registry
        .get(&name)
        .ok_or_else(|| ProtocolError::UnknownCapability {
            name: name.clone(),
            known: registry.names().into_iter().map(String::from).collect(),
        })?;

    let supplied = unwrap_type_name(args, &descriptor.parameters);
    let coerced = match_parameters(&descriptor.name, &descriptor.parameters, supplied)?;
    Ok((name, coerced))
}

/// A payload whose only key is an undeclared name holding an object is the
/// nested type-name convention; its object is the real argument set.
fn unwrap_type_name(args: Map<String, Value>, params: &[ParamSpec]) -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = args.into_iter().collect();
    if let [(key, Value::Object(_))] = entries.as_slice()
        && !params.iter().any(|p| &p.name == key)
        && let Some((_, Value::Object(inner))) = entries.pop()
    {
        return inner.into_iter().collect();
    }
    entries
}

fn take_by_key(supplied: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let position = supplied.iter().position(|(k, _)| k == key)?;
    Some(supplied.remove(position).1)
}

/// Match declared parameters to supplied values: by key, then by position
/// among values whose keys no parameter claims, then by default.
fn match_parameters(
    capability: &str,
    params: &[ParamSpec],
    mut supplied: Vec<(String, Value)>,
) -> Result<Map<String, Value>, ProtocolError> {
    let mut matched = Map::new();

    // keyed values first, so positional fallback only sees the leftovers
    let mut keyed: Vec<Option<Value>> = params
        .iter()
        .map(|p| take_by_key(&mut supplied, &p.name))
        .collect();
    let mut leftovers = supplied.into_iter();

    for (param, keyed_value) in params.iter().zip(keyed.iter_mut()) {
        if param.is_wrapper() {
            let source = match keyed_value.take() {
                Some(Value::Object(fields)) => fields.into_iter().collect(),
                Some(other) => vec![(param.name.clone(), other)],
                None => leftovers.by_ref().collect(),
            };
            let inner = match_parameters(capability, &param.fields, source)?;
            matched.insert(param.name.clone(), Value::Object(inner));
            continue;
        }

        let value = keyed_value
            .take()
            .or_else(|| leftovers.next().map(|(_, v)| v))
            .or_else(|| param.default.clone());
        match value {
            Some(value) => {
                matched.insert(param.name.clone(), coerce(param, value)?);
            }
            None if param.required => {
                return Err(ProtocolError::MissingArgument {
                    capability: capability.to_string(),
                    parameter: param.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(matched)
}

fn invalid(param: &ParamSpec, value: &Value) -> ProtocolError {
    ProtocolError::InvalidArgument {
        parameter: param.name.clone(),
        expected: param.param_type.to_string(),
        value: value.to_string(),
    }
}

/// Coerce a value to the parameter's declared type.
pub fn coerce(param: &ParamSpec, value: Value) -> Result<Value, ProtocolError> {
    if value.is_null() && !param.required {
        return Ok(value);
    }
    match param.param_type {
        ParamType::Integer => {
            let integer = match &value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral_f64_to_i64)),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().and_then(integral_f64_to_i64))
                }
                _ => None,
            };
            integer.map(Value::from).ok_or_else(|| invalid(param, &value))
        }
        ParamType::Number => {
            let number = match &value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            number
                .filter(|f| f.is_finite())
                .map(Value::from)
                .ok_or_else(|| invalid(param, &value))
        }
        ParamType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            _ => Err(invalid(param, &value)),
        },
        ParamType::Array => match value {
            Value::Array(_) => Ok(value),
            Value::String(ref s) => match serde_json::from_str::<Value>(&normalize_quasi_json(s)) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Err(invalid(param, &value)),
            },
            other => Err(invalid(param, &other)),
        },
        ParamType::Object => match value {
            Value::Object(_) => Ok(value),
            other => Err(invalid(param, &other)),
        },
        ParamType::String => Ok(match value {
            Value::String(_) => value,
            other => Value::String(other.to_string()),
        }),
    }
}
