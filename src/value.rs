use crate::ast::Literal;
use crate::callable::Callable;
use std::fmt;
use std::fmt::Formatter;

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Callable(Callable),
}

impl Value {
    /// `nil` and `false` are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Boolean(x) => *x,
            Value::Number(_) | Value::String(_) | Value::Callable(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(l), Value::Boolean(r)) => l == r,
            (Value::Number(l), Value::Number(r)) => l == r,
            (Value::String(l), Value::String(r)) => l == r,
            (Value::Callable(l), Value::Callable(r)) => l.equals(r),
            _ => false,
        }
    }
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Value {
        match literal {
            Literal::Nil => Value::Nil,
            Literal::Boolean(x) => Value::Boolean(*x),
            Literal::Number(x) => Value::Number(*x),
            Literal::String(x) => Value::String(x.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(x) => write!(f, "{}", x),
            Value::Number(x) => write!(f, "{}", x),
            Value::String(x) => write!(f, "{}", x),
            Value::Callable(x) => write!(f, "{}", x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::String(String::new()).is_truthy());
    }

    #[test]
    fn equality_never_crosses_kinds() {
        assert_eq!(Value::Nil, Value::Nil);
        assert!(Value::Nil != Value::Boolean(false));
        assert!(Value::Number(1.0) != Value::String("1".to_string()));
        assert_eq!(Value::String("a".to_string()), Value::String("a".to_string()));
        assert!(Value::Number(f64::NAN) != Value::Number(f64::NAN));
    }

    #[test]
    fn rendering() {
        assert_eq!(Value::Number(7.0).to_string(), "7");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Number(-0.5).to_string(), "-0.5");
        assert_eq!(Value::Boolean(true).to_string(), "true");
        assert_eq!(Value::Nil.to_string(), "nil");
    }
}
