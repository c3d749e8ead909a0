//! Row filter expressions.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr    := and ( ("or" | "||") and )*
//! and     := unary ( ("and" | "&&") unary )*
//! unary   := ("not" | "!") unary | "(" expr ")" | compare
//! compare := operand ( ("==" | "!=" | "<" | "<=" | ">" | ">=") operand )?
//! operand := column | `quoted column` | 'text' | "text" | number | true | false | null
//! ```
//!
//! A bare operand is truthy when it is `true` or a non-zero number. Comparisons against
//! `null` only hold for `==`/`!=`; ordering a null is always false.

use std::cmp::Ordering;

use crate::error::{IngestError, IngestResult};
use crate::types::{DataSet, Schema, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64, bool),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(usize),
    Literal(Value),
}

/// A filter expression bound to a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

fn tokenize(input: &str) -> IngestResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' | '`' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(IngestError::transform(format!("unterminated {quote} in filter '{input}'"))),
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                text.push(next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(if quote == '`' { Token::Ident(text) } else { Token::Str(text) });
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CmpOp::Eq), 2),
                    ('=', _) => (Token::Op(CmpOp::Eq), 1),
                    ('!', Some('=')) => (Token::Op(CmpOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('<', Some('=')) => (Token::Op(CmpOp::Le), 2),
                    ('<', Some('>')) => (Token::Op(CmpOp::Ne), 2),
                    ('<', _) => (Token::Op(CmpOp::Lt), 1),
                    ('>', Some('=')) => (Token::Op(CmpOp::Ge), 2),
                    ('>', _) => (Token::Op(CmpOp::Gt), 1),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    _ => return Err(IngestError::transform(format!("unexpected '{c}' in filter '{input}'"))),
                };
                tokens.push(token);
                i += width;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || matches!(chars[i], '.' | '_')
                        || (matches!(chars[i], '-' | '+') && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| IngestError::transform(format!("invalid number '{text}' in filter '{input}'")))?;
                let integral = text.parse::<i64>().is_ok();
                tokens.push(Token::Num(n, integral));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(IngestError::transform(format!("unexpected '{other}' in filter '{input}'"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    schema: &'a Schema,
    input: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> IngestResult<Expr> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> IngestResult<Expr> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> IngestResult<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => self.compare(),
        }
    }

    fn compare(&mut self) -> IngestResult<Expr> {
        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.operand()?;
            return Ok(Expr::Compare(lhs, op, rhs));
        }
        Ok(Expr::Truthy(lhs))
    }

    fn operand(&mut self) -> IngestResult<Operand> {
        let operand = match self.bump() {
            Some(Token::Ident(name)) => match self.schema.index_of(&name) {
                Some(idx) => Operand::Column(idx),
                None => return Err(self.error(&format!("unknown column '{name}'"))),
            },
            Some(Token::Str(s)) => Operand::Literal(Value::Utf8(s)),
            Some(Token::Num(n, true)) => Operand::Literal(Value::Int64(n as i64)),
            Some(Token::Num(n, false)) => Operand::Literal(Value::Float64(n)),
            Some(Token::True) => Operand::Literal(Value::Bool(true)),
            Some(Token::False) => Operand::Literal(Value::Bool(false)),
            Some(Token::Null) => Operand::Literal(Value::Null),
            _ => return Err(self.error("expected a column or literal")),
        };
        Ok(operand)
    }

    fn error(&self, message: &str) -> IngestError {
        IngestError::transform(format!("{message} in filter '{}'", self.input))
    }
}

impl Expr {
    /// Parse `input` and bind its column names against `schema`.
    pub fn parse(input: &str, schema: &Schema) -> IngestResult<Self> {
        let mut parser = Parser {
            tokens: tokenize(input)?,
            pos: 0,
            schema,
            input,
        };
        if parser.tokens.is_empty() {
            return Err(IngestError::transform("empty filter expression"));
        }
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    pub fn eval(&self, row: &[Value]) -> bool {
        match self {
            Self::Or(a, b) => a.eval(row) || b.eval(row),
            Self::And(a, b) => a.eval(row) && b.eval(row),
            Self::Not(e) => !e.eval(row),
            Self::Truthy(o) => match resolve(o, row) {
                Value::Bool(b) => *b,
                v => v.as_f64().is_some_and(|n| n != 0.0),
            },
            Self::Compare(a, op, b) => compare(resolve(a, row), *op, resolve(b, row)),
        }
    }
}

fn resolve<'a>(operand: &'a Operand, row: &'a [Value]) -> &'a Value {
    match operand {
        Operand::Column(idx) => row.get(*idx).unwrap_or(&Value::Null),
        Operand::Literal(v) => v,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Utf8(x), Value::Utf8(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        let both = a.is_null() && b.is_null();
        return match op {
            CmpOp::Eq => both,
            CmpOp::Ne => !both,
            _ => false,
        };
    }
    let ord = order(a, b);
    match op {
        CmpOp::Eq => ord == Some(Ordering::Equal),
        CmpOp::Ne => ord != Some(Ordering::Equal),
        CmpOp::Lt => ord == Some(Ordering::Less),
        CmpOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ord == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Keep the rows of `dataset` matching `expr`.
pub fn filter(dataset: &DataSet, expr: &str) -> IngestResult<DataSet> {
    let expr = Expr::parse(expr, &dataset.schema)?;
    Ok(dataset.filter_rows(|row| expr.eval(row)))
}

/// Expression selecting rows whose `column` equals `value`.
pub fn equals(column: &str, value: &Value) -> String {
    let column = format!("`{}`", column.replace('\\', "\\\\").replace('`', "\\`"));
    let literal = match value {
        Value::Null => "null".to_string(),
        Value::Utf8(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Float64(f) => format!("{f:?}"),
        other => other.to_string(),
    };
    format!("{column} == {literal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field};

    fn sample() -> DataSet {
        DataSet::new(
            Schema::new(vec![
                Field::new("id", DataType::Int64),
                Field::new("name", DataType::Utf8),
                Field::new("score", DataType::Float64),
                Field::new("active", DataType::Bool),
            ]),
            vec![
                vec![Value::Int64(1), Value::Utf8("a".into()), Value::Float64(1.5), Value::Bool(true)],
                vec![Value::Int64(2), Value::Utf8("b".into()), Value::Null, Value::Bool(false)],
                vec![Value::Int64(3), Value::Utf8("it's".into()), Value::Float64(3.0), Value::Bool(true)],
            ],
        )
    }

    #[test]
    fn numeric_and_boolean_logic() {
        let ds = sample();
        assert_eq!(filter(&ds, "id > 1 and active").unwrap().row_count(), 1);
        assert_eq!(filter(&ds, "id == 1 or name == 'b'").unwrap().row_count(), 2);
        assert_eq!(filter(&ds, "not (id >= 2)").unwrap().row_count(), 1);
        assert_eq!(filter(&ds, "score > 1").unwrap().row_count(), 2);
    }

    #[test]
    fn null_comparisons() {
        let ds = sample();
        assert_eq!(filter(&ds, "score == null").unwrap().row_count(), 1);
        assert_eq!(filter(&ds, "score != null").unwrap().row_count(), 2);
        assert_eq!(filter(&ds, "score < 100").unwrap().row_count(), 2);
    }

    #[test]
    fn equals_round_trips_through_the_parser() {
        let ds = sample();
        let out = filter(&ds, &equals("name", &Value::Utf8("it's".into()))).unwrap();
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.rows[0][0], Value::Int64(3));
        let out = filter(&ds, &equals("score", &Value::Float64(3.0))).unwrap();
        assert_eq!(out.row_count(), 1);
    }

    #[test]
    fn unknown_columns_and_bad_syntax_are_errors() {
        let ds = sample();
        assert!(filter(&ds, "missing == 1").is_err());
        assert!(filter(&ds, "id ==").is_err());
        assert!(filter(&ds, "(id == 1").is_err());
        assert!(filter(&ds, "").is_err());
    }
}
