//! `calculate`: evaluates an arithmetic expression in one call.
//!
//! Grammar: `+ - * / %`, right-associative `^`, parentheses, unary minus
//! and decimal literals. Useful when the planner would otherwise chain
//! several single-operation calls.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::local::{LocalTool, ToolFailure, number_value, string_arg};

pub struct CalculatorTool;

#[async_trait]
impl LocalTool for CalculatorTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression with + - * / % ^ and parentheses"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. '(2 + 3) ^ 2'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolFailure> {
        let expression = string_arg(args, "expression")?;
        evaluate(expression)
            .map(number_value)
            .map_err(ToolFailure::Execution)
    }
}

/// Evaluate an expression string.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let value = parser.expr()?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(format!("Unexpected {token:?} at position {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("Result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_digit() || d == '.') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let literal = &input[start..end];
                let number = literal
                    .parse()
                    .map_err(|_| format!("Invalid number: {literal}"))?;
                tokens.push(Token::Number(number));
            }
            other => return Err(format!("Unexpected character: '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    // expr = term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut left = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek_op() {
            self.pos += 1;
            let right = self.term()?;
            left = if op == '+' { left + right } else { left - right };
        }
        Ok(left)
    }

    // term = unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, String> {
        let mut left = self.unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek_op() {
            self.pos += 1;
            let right = self.unary()?;
            left = match op {
                '*' => left * right,
                _ if right == 0.0 => return Err("Division by zero".into()),
                '/' => left / right,
                _ => left - right * (left / right).floor(),
            };
        }
        Ok(left)
    }

    // unary = '-' unary | power
    fn unary(&mut self) -> Result<f64, String> {
        if self.peek_op() == Some('-') {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.power()
    }

    // power = primary ('^' unary)?
    fn power(&mut self) -> Result<f64, String> {
        let base = self.primary()?;
        if self.peek_op() == Some('^') {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // primary = NUMBER | '(' expr ')'
    fn primary(&mut self) -> Result<f64, String> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        match token {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("Expected closing parenthesis".into()),
                }
            }
            Some(other) => Err(format!("Unexpected token: {other:?}")),
            None => Err("Unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("((1 + 2) * (3 + 4))").unwrap(), 21.0);
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ^ -1").unwrap(), 0.5);
    }

    #[test]
    fn modulo_is_floored() {
        assert_eq!(evaluate("7 % 3").unwrap(), 1.0);
        assert_eq!(evaluate("-7 % 3").unwrap(), 2.0);
    }

    #[test]
    fn division() {
        assert_eq!(evaluate("10 / 4").unwrap(), 2.5);
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("1 % 0").is_err());
    }

    #[test]
    fn malformed_input() {
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("2 $ 3").is_err());
        assert!(evaluate("1.2.3").is_err());
    }

    #[tokio::test]
    async fn tool_formats_integral_results() {
        let mut args = Map::new();
        args.insert("expression".into(), json!("10 / 2"));
        assert_eq!(CalculatorTool.execute(&args).await.unwrap(), json!(5));

        args.insert("expression".into(), json!("10 / 4"));
        assert_eq!(CalculatorTool.execute(&args).await.unwrap(), json!(2.5));
    }

    #[tokio::test]
    async fn tool_requires_expression() {
        let err = CalculatorTool.execute(&Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolFailure::InvalidArguments(_)));
    }

    #[test]
    fn descriptor_has_one_string_parameter() {
        assert_eq!(CalculatorTool.to_descriptor().signature(), "calculate(expression: string)");
    }
}
