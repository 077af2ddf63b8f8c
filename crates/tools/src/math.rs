//! Built-in math capabilities.
//!
//! Each tool is a plain function plus its schema; [`builtin_capabilities`]
//! collects them (and the expression calculator) into one provider.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::calculator::CalculatorTool;
use crate::local::{
    LocalCapabilities, LocalTool, ToolFailure, arg, int_arg, number_arg, number_value, string_arg,
};

type Operation = fn(&Map<String, Value>) -> Result<Value, ToolFailure>;

/// A math function exposed as a capability.
pub struct MathTool {
    name: &'static str,
    description: &'static str,
    schema: Value,
    operation: Operation,
}

impl MathTool {
    fn new(name: &'static str, description: &'static str, schema: Value, operation: Operation) -> Self {
        Self {
            name,
            description,
            schema,
            operation,
        }
    }
}

#[async_trait]
impl LocalTool for MathTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolFailure> {
        (self.operation)(args)
    }
}

fn schema(params: &[(&str, &str)]) -> Value {
    let mut properties = Map::new();
    for (name, kind) in params {
        let property = if *kind == "array" {
            json!({ "type": "array", "items": { "type": "integer" } })
        } else {
            json!({ "type": kind })
        };
        properties.insert((*name).to_string(), property);
    }
    let required: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
    json!({ "type": "object", "properties": properties, "required": required })
}

fn overflow(op: &str) -> ToolFailure {
    ToolFailure::Execution(format!("{op} overflowed"))
}

fn add(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(args, "a")?, int_arg(args, "b")?);
    a.checked_add(b).map(Value::from).ok_or_else(|| overflow("add"))
}

fn subtract(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(args, "a")?, int_arg(args, "b")?);
    a.checked_sub(b).map(Value::from).ok_or_else(|| overflow("subtract"))
}

fn multiply(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(args, "a")?, int_arg(args, "b")?);
    a.checked_mul(b).map(Value::from).ok_or_else(|| overflow("multiply"))
}

fn divide(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (number_arg(args, "a")?, number_arg(args, "b")?);
    if b == 0.0 {
        return Err(ToolFailure::Execution("division by zero".into()));
    }
    Ok(json!(a / b))
}

fn power(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(args, "a")?, int_arg(args, "b")?);
    let exponent = u32::try_from(b)
        .map_err(|_| ToolFailure::InvalidArguments(format!("exponent must be non-negative, got {b}")))?;
    a.checked_pow(exponent).map(Value::from).ok_or_else(|| overflow("power"))
}

fn remainder(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let (a, b) = (int_arg(args, "a")?, int_arg(args, "b")?);
    if b == 0 {
        return Err(ToolFailure::Execution("division by zero".into()));
    }
    // floored, so the sign follows the divisor
    let r = a.checked_rem_euclid(b).ok_or_else(|| overflow("remainder"))?;
    Ok(json!(if b < 0 && r != 0 { r + b } else { r }))
}

fn sqrt(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let a = number_arg(args, "a")?;
    if a < 0.0 {
        return Err(ToolFailure::Execution(format!("square root of negative number {a}")));
    }
    Ok(json!(a.sqrt()))
}

fn cbrt(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    Ok(json!(number_arg(args, "a")?.cbrt()))
}

fn factorial(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let a = int_arg(args, "a")?;
    if a < 0 {
        return Err(ToolFailure::InvalidArguments(format!("factorial of negative number {a}")));
    }
    (1..=a as u64)
        .try_fold(1u64, |acc, k| acc.checked_mul(k))
        .map(Value::from)
        .ok_or_else(|| overflow("factorial"))
}

fn log(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let a = number_arg(args, "a")?;
    if a <= 0.0 {
        return Err(ToolFailure::Execution(format!("logarithm of non-positive number {a}")));
    }
    Ok(json!(a.ln()))
}

fn fibonacci_numbers(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let n = int_arg(args, "n")?;
    if n <= 0 {
        return Ok(json!([]));
    }
    // u64 runs out after 94 terms, so never reserve more than that
    let mut sequence: Vec<u64> = Vec::with_capacity(n.min(94) as usize);
    let (mut current, mut next) = (0u64, 1u64);
    for _ in 0..n {
        sequence.push(current);
        let sum = current.checked_add(next).ok_or_else(|| overflow("fibonacci_numbers"))?;
        current = next;
        next = sum;
    }
    Ok(json!(sequence))
}

fn strings_to_chars_to_int(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let text = string_arg(args, "string")?;
    Ok(json!(text.chars().map(|c| c as u32).collect::<Vec<_>>()))
}

fn int_list_to_exponential_sum(args: &Map<String, Value>) -> Result<Value, ToolFailure> {
    let values = arg(args, "int_list")?
        .as_array()
        .ok_or_else(|| ToolFailure::InvalidArguments("'int_list' must be an array".into()))?;
    let mut sum = 0.0;
    for value in values {
        let exponent = value
            .as_f64()
            .ok_or_else(|| ToolFailure::InvalidArguments(format!("not a number: {value}")))?;
        sum += exponent.exp();
    }
    Ok(number_value(sum))
}

/// The math tools, in catalogue order.
pub fn math_tools() -> Vec<MathTool> {
    let ab_int = || schema(&[("a", "integer"), ("b", "integer")]);
    let ab_num = || schema(&[("a", "number"), ("b", "number")]);
    let a_num = || schema(&[("a", "number")]);
    vec![
        MathTool::new("add", "Add two numbers", ab_int(), add),
        MathTool::new("subtract", "Subtract b from a", ab_int(), subtract),
        MathTool::new("multiply", "Multiply two numbers", ab_int(), multiply),
        MathTool::new("divide", "Divide a by b", ab_num(), divide),
        MathTool::new("power", "Raise a to the power of b", ab_int(), power),
        MathTool::new("remainder", "Remainder of a divided by b", ab_int(), remainder),
        MathTool::new("sqrt", "Square root of a number", a_num(), sqrt),
        MathTool::new("cbrt", "Cube root of a number", a_num(), cbrt),
        MathTool::new("factorial", "Factorial of a non-negative integer", schema(&[("a", "integer")]), factorial),
        MathTool::new("log", "Natural logarithm of a number", a_num(), log),
        MathTool::new(
            "fibonacci_numbers",
            "Return the first n Fibonacci numbers",
            schema(&[("n", "integer")]),
            fibonacci_numbers,
        ),
        MathTool::new(
            "strings_to_chars_to_int",
            "Return the ASCII values of the characters in a word",
            schema(&[("string", "string")]),
            strings_to_chars_to_int,
        ),
        MathTool::new(
            "int_list_to_exponential_sum",
            "Return the sum of exponentials of numbers in a list",
            schema(&[("int_list", "array")]),
            int_list_to_exponential_sum,
        ),
    ]
}

/// All built-in capabilities as one provider named `builtin`.
pub fn builtin_capabilities() -> LocalCapabilities {
    let mut local = LocalCapabilities::new("builtin");
    for tool in math_tools() {
        local.register(Box::new(tool));
    }
    local.register(Box::new(CalculatorTool));
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::capability::{CapabilityProvider, CapabilityRegistry};

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(add(&args(&[("a", json!(2)), ("b", json!(3))])).unwrap(), json!(5));
        assert_eq!(subtract(&args(&[("a", json!(2)), ("b", json!(3))])).unwrap(), json!(-1));
        assert_eq!(multiply(&args(&[("a", json!(4)), ("b", json!(6))])).unwrap(), json!(24));
        assert_eq!(power(&args(&[("a", json!(2)), ("b", json!(10))])).unwrap(), json!(1024));
    }

    #[test]
    fn overflow_is_an_error() {
        let err = multiply(&args(&[("a", json!(i64::MAX)), ("b", json!(2))])).unwrap_err();
        assert!(err.to_string().contains("overflowed"));
    }

    #[test]
    fn divide_by_zero_fails() {
        assert!(divide(&args(&[("a", json!(1)), ("b", json!(0))])).is_err());
        assert_eq!(divide(&args(&[("a", json!(10)), ("b", json!(4))])).unwrap(), json!(2.5));
    }

    #[test]
    fn remainder_follows_divisor_sign() {
        assert_eq!(remainder(&args(&[("a", json!(7)), ("b", json!(3))])).unwrap(), json!(1));
        assert_eq!(remainder(&args(&[("a", json!(-7)), ("b", json!(3))])).unwrap(), json!(2));
        assert_eq!(remainder(&args(&[("a", json!(7)), ("b", json!(-3))])).unwrap(), json!(-2));
    }

    #[test]
    fn remainder_of_min_by_minus_one_is_an_error() {
        let err = remainder(&args(&[("a", json!(i64::MIN)), ("b", json!(-1))])).unwrap_err();
        assert!(err.to_string().contains("remainder overflowed"));
    }

    #[test]
    fn roots_and_logs() {
        assert_eq!(sqrt(&args(&[("a", json!(16))])).unwrap(), json!(4.0));
        assert!(sqrt(&args(&[("a", json!(-1))])).is_err());
        let cube = cbrt(&args(&[("a", json!(27))])).unwrap().as_f64().unwrap();
        assert!((cube - 3.0).abs() < 1e-12);
        assert!(log(&args(&[("a", json!(0))])).is_err());
    }

    #[test]
    fn factorial_values() {
        assert_eq!(factorial(&args(&[("a", json!(0))])).unwrap(), json!(1));
        assert_eq!(factorial(&args(&[("a", json!(5))])).unwrap(), json!(120));
        assert!(factorial(&args(&[("a", json!(25))])).is_err());
    }

    #[test]
    fn fibonacci_sequence() {
        assert_eq!(fibonacci_numbers(&args(&[("n", json!(6))])).unwrap(), json!([0, 1, 1, 2, 3, 5]));
        assert_eq!(fibonacci_numbers(&args(&[("n", json!(0))])).unwrap(), json!([]));
    }

    #[test]
    fn huge_fibonacci_count_overflows_without_reserving() {
        let err = fibonacci_numbers(&args(&[("n", json!(1_000_000_000_000_000i64))])).unwrap_err();
        assert!(err.to_string().contains("fibonacci_numbers overflowed"));
    }

    #[test]
    fn ascii_values() {
        let values = strings_to_chars_to_int(&args(&[("string", json!("INDIA"))])).unwrap();
        assert_eq!(values, json!([73, 78, 68, 73, 65]));
    }

    #[test]
    fn exponential_sum() {
        let sum = int_list_to_exponential_sum(&args(&[("int_list", json!([0, 0]))])).unwrap();
        assert_eq!(sum, json!(2));
        assert!(int_list_to_exponential_sum(&args(&[("int_list", json!("x"))])).is_err());
    }

    #[tokio::test]
    async fn builtin_catalogue_is_a_valid_registry() {
        let builtins = builtin_capabilities();
        let registry = CapabilityRegistry::fetch(&builtins).await.unwrap();
        assert_eq!(registry.names()[0], "add");
        assert!(registry.contains("int_list_to_exponential_sum"));
        assert!(registry.contains("calculate"));
        assert_eq!(
            registry.get("int_list_to_exponential_sum").unwrap().signature(),
            "int_list_to_exponential_sum(int_list: array)"
        );
    }

    #[tokio::test]
    async fn list_results_use_content_items() {
        let builtins = builtin_capabilities();
        let raw = builtins
            .invoke("strings_to_chars_to_int", args(&[("string", json!("AB"))]))
            .await
            .unwrap();
        let texts: Vec<&str> = raw["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["65", "66"]);
    }
}
