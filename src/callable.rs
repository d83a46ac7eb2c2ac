use crate::ast::FunctionDecl;
use crate::environment::Environment;
use crate::interpreter::{Flow, Interpreter, RuntimeError};
use crate::value::Value;
use std::fmt;
use std::fmt::Debug;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Anything that can appear on the left of a call: a user function or a
/// host-provided native.
#[derive(Clone, Debug)]
pub enum Callable {
    Function(LoxFunction),
    Native(NativeFunction),
}

impl Callable {
    pub fn arity(&self) -> usize {
        match self {
            Callable::Function(f) => f.arity(),
            Callable::Native(f) => f.arity,
        }
    }
    pub fn name(&self) -> &str {
        match self {
            Callable::Function(f) => f.name(),
            Callable::Native(f) => f.name,
        }
    }
    /// Invokes the callable. Arity has already been checked by the caller.
    pub fn call(
        &self,
        interpreter: &mut Interpreter,
        arguments: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        match self {
            Callable::Function(f) => f.call(interpreter, arguments),
            Callable::Native(f) => Ok((f.call)(&arguments)),
        }
    }
    pub fn equals(&self, other: &Callable) -> bool {
        match (self, other) {
            (Callable::Function(l), Callable::Function(r)) => l.equals(r),
            (Callable::Native(l), Callable::Native(r)) => l.name == r.name,
            _ => false,
        }
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Function(x) => write!(f, "{}", x),
            Callable::Native(x) => write!(f, "{}", x),
        }
    }
}

#[derive(Clone)]
pub struct LoxFunction {
    declaration: Rc<FunctionDecl>,
    closure: Environment,
}

impl fmt::Display for LoxFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.name())
    }
}

impl Debug for LoxFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}/{}>", self.name(), self.arity())
    }
}

impl LoxFunction {
    pub fn new(declaration: Rc<FunctionDecl>, closure: Environment) -> LoxFunction {
        LoxFunction {
            declaration,
            closure,
        }
    }
    pub fn call(
        &self,
        interpreter: &mut Interpreter,
        arguments: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        trace!(function = self.name(), args = arguments.len(), "call");
        let environment = self.closure.new_child();
        for (param, value) in self.declaration.params.iter().zip(arguments.into_iter()) {
            environment.define(param, value)?;
        }
        match interpreter.execute_block(&self.declaration.body, environment)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Nil),
        }
    }
    pub fn arity(&self) -> usize {
        self.declaration.params.len()
    }
    pub fn name(&self) -> &str {
        &self.declaration.name.lexeme
    }
    pub fn equals(&self, other: &LoxFunction) -> bool {
        Rc::ptr_eq(&self.declaration, &other.declaration) && self.closure.ptr_eq(&other.closure)
    }
}

#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub arity: usize,
    pub call: fn(&[Value]) -> Value,
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}/{}>", self.name, self.arity)
    }
}

impl fmt::Display for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// Natives seeded into every fresh global scope.
pub fn natives() -> Vec<NativeFunction> {
    vec![NativeFunction {
        name: "clock",
        arity: 0,
        call: clock,
    }]
}

fn clock(_arguments: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
