use crate::ast::{Expression, Statement, Visitor};
use crate::callable::{natives, Callable, LoxFunction};
use crate::environment::Environment;
use crate::stack::ensure_sufficient_stack;
use crate::token::{Token, TokenType};
use crate::value::Value;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, trace};

/// Language-level call depth at which a program is reported as overflowing.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{message}\n[line {line}]")]
    TypeMismatch {
        line: i32,
        operator: String,
        message: String,
    },
    #[error("Undefined variable '{name}'.\n[line {line}]")]
    UndefinedVariable { line: i32, name: String },
    #[error("Can only call functions.\n[line {line}]")]
    NotCallable { line: i32 },
    #[error("Expected {expected} arguments but got {got}.\n[line {line}]")]
    ArityMismatch {
        line: i32,
        expected: usize,
        got: usize,
    },
    #[error("Variable '{name}' is already declared in this scope.\n[line {line}]")]
    AlreadyDeclared { line: i32, name: String },
    #[error("Stack overflow.\n[line {line}]")]
    StackOverflow { line: i32 },
    #[error("Can't return from top-level code.\n[line {line}]")]
    TopLevelReturn { line: i32 },
    #[error("Unknown operator '{operator}'.\n[line {line}]")]
    UnknownOperator { line: i32, operator: String },
    #[error("Failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl RuntimeError {
    pub fn line(&self) -> Option<i32> {
        match self {
            RuntimeError::TypeMismatch { line, .. }
            | RuntimeError::UndefinedVariable { line, .. }
            | RuntimeError::NotCallable { line }
            | RuntimeError::ArityMismatch { line, .. }
            | RuntimeError::AlreadyDeclared { line, .. }
            | RuntimeError::StackOverflow { line }
            | RuntimeError::TopLevelReturn { line }
            | RuntimeError::UnknownOperator { line, .. } => Some(*line),
            RuntimeError::Output(_) => None,
        }
    }
}

/// How a statement finished: by running off its end, or by a `return` that
/// is still unwinding towards the nearest call.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Normal,
    Return(Value),
}

pub struct Interpreter {
    globals: Environment,
    environment: Environment,
    output: Box<dyn Write>,
    call_depth: usize,
    max_call_depth: usize,
}

impl Visitor<Expression, Result<Value, RuntimeError>> for Interpreter {
    fn visit(&mut self, expr: &Expression) -> Result<Value, RuntimeError> {
        match expr {
            Expression::Literal(x) => Ok(Value::from(x)),
            Expression::Grouping(x) => self.evaluate(x),
            Expression::Unary { operator, right } => {
                let rv = self.evaluate(right)?;
                match operator.tokentype {
                    TokenType::Minus => match rv {
                        Value::Number(r) => Ok(Value::Number(-r)),
                        _ => Err(type_mismatch(
                            operator,
                            format!("Operand of '{}' must be a number.", operator.lexeme),
                        )),
                    },
                    TokenType::Bang => Ok(Value::Boolean(!rv.is_truthy())),
                    _ => Err(unknown_operator(operator)),
                }
            }
            // Operands are evaluated left to right.
            Expression::Binary {
                left,
                operator,
                right,
            } => {
                let lv = self.evaluate(left)?;
                let rv = self.evaluate(right)?;
                binary(operator, lv, rv)
            }
            Expression::Variable(token) => self.environment.get(token),
            Expression::Assign { name, value } => {
                let value = self.evaluate(value)?;
                self.environment.assign(name, value.clone())?;
                Ok(value)
            }
            Expression::Logical {
                left,
                operator,
                right,
            } => {
                let left = self.evaluate(left)?;
                match operator.tokentype {
                    TokenType::Or if left.is_truthy() => Ok(left),
                    TokenType::And if !left.is_truthy() => Ok(left),
                    _ => self.evaluate(right),
                }
            }
            Expression::Call {
                callee,
                paren,
                arguments,
            } => {
                let function = match self.evaluate(callee)? {
                    Value::Callable(function) => function,
                    _ => return Err(RuntimeError::NotCallable { line: paren.line }),
                };
                let mut evaluated_arguments: Vec<Value> = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    evaluated_arguments.push(self.evaluate(argument)?);
                }
                if function.arity() != evaluated_arguments.len() {
                    return Err(RuntimeError::ArityMismatch {
                        line: paren.line,
                        expected: function.arity(),
                        got: evaluated_arguments.len(),
                    });
                }
                self.call(&function, paren, evaluated_arguments)
            }
            Expression::Function(declaration) => Ok(Value::Callable(Callable::Function(
                LoxFunction::new(declaration.clone(), self.environment.clone()),
            ))),
        }
    }
}

impl Visitor<Statement, Result<Flow, RuntimeError>> for Interpreter {
    fn visit(&mut self, stmt: &Statement) -> Result<Flow, RuntimeError> {
        match stmt {
            Statement::Print(e) => {
                let val = self.evaluate(e)?;
                writeln!(self.output, "{}", val)?;
                Ok(Flow::Normal)
            }
            Statement::Expression(e) => {
                self.evaluate(e)?;
                Ok(Flow::Normal)
            }
            Statement::Var { name, initializer } => {
                let val = match initializer {
                    Some(e) => self.evaluate(e)?,
                    None => Value::Nil,
                };
                self.environment.define(name, val)?;
                Ok(Flow::Normal)
            }
            Statement::Block(stmts) => {
                let environment = self.environment.new_child();
                self.execute_block(stmts, environment)
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.evaluate(condition)?.is_truthy() {
                    self.execute(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.execute(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Statement::While { condition, body } => {
                while self.evaluate(condition)?.is_truthy() {
                    if let Flow::Return(value) = self.execute(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Statement::Function(declaration) => {
                let function = LoxFunction::new(declaration.clone(), self.environment.clone());
                self.environment
                    .define(&declaration.name, Value::Callable(Callable::Function(function)))?;
                Ok(Flow::Normal)
            }
            Statement::Return { keyword, value } => {
                if self.call_depth == 0 {
                    return Err(RuntimeError::TopLevelReturn { line: keyword.line });
                }
                let val = match value {
                    Some(e) => self.evaluate(e)?,
                    None => Value::Nil,
                };
                Ok(Flow::Return(val))
            }
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Global functions capture the global frame; emptying it breaks the cycle.
        self.globals.clear();
    }
}

impl Interpreter {
    /// An interpreter printing to standard output.
    pub fn new() -> Interpreter {
        Interpreter::with_output(Box::new(io::stdout()))
    }
    pub fn with_output(output: Box<dyn Write>) -> Interpreter {
        let globals = Environment::new();
        for native in natives() {
            globals.define_native(native.name, Value::Callable(Callable::Native(native)));
        }
        Interpreter {
            environment: globals.clone(),
            globals,
            output,
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Interpreter {
        self.max_call_depth = max_call_depth;
        self
    }
    #[cfg(test)]
    pub(crate) fn globals(&self) -> &Environment {
        &self.globals
    }

    /// Runs `statements` in order, stopping at the first runtime error.
    /// Effects of statements that already ran are kept.
    pub fn interpret(&mut self, statements: &[Statement]) -> Result<(), RuntimeError> {
        debug!(statements = statements.len(), "interpreting");
        let mut result = Ok(());
        for stmt in statements {
            if let Err(e) = self.execute(stmt) {
                debug!(error = %e, "runtime error");
                self.reset();
                result = Err(e);
                break;
            }
        }
        self.output.flush()?;
        result
    }
    pub fn evaluate(&mut self, expr: &Expression) -> Result<Value, RuntimeError> {
        ensure_sufficient_stack(|| expr.accept::<Result<Value, RuntimeError>>(self))
    }
    pub fn execute(&mut self, stmt: &Statement) -> Result<Flow, RuntimeError> {
        ensure_sufficient_stack(|| stmt.accept::<Result<Flow, RuntimeError>>(self))
    }

    /// Runs `statements` with `environment` as the current scope, restoring
    /// the previous scope however the block exits.
    pub fn execute_block(
        &mut self,
        statements: &[Statement],
        environment: Environment,
    ) -> Result<Flow, RuntimeError> {
        trace!(statements = statements.len(), "enter scope");
        let previous = std::mem::replace(&mut self.environment, environment);
        let result = self.execute_all(statements);
        self.environment = previous;
        result
    }
    fn execute_all(&mut self, statements: &[Statement]) -> Result<Flow, RuntimeError> {
        for stmt in statements {
            if let Flow::Return(value) = self.execute(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }
    fn call(
        &mut self,
        function: &Callable,
        paren: &Token,
        arguments: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        if self.call_depth >= self.max_call_depth {
            return Err(RuntimeError::StackOverflow { line: paren.line });
        }
        self.call_depth += 1;
        let result = function.call(self, arguments);
        self.call_depth -= 1;
        result
    }
    // A fault can unwind from anywhere; later statements start from globals.
    fn reset(&mut self) {
        self.environment = self.globals.clone();
        self.call_depth = 0;
    }
}

fn type_mismatch(operator: &Token, message: String) -> RuntimeError {
    RuntimeError::TypeMismatch {
        line: operator.line,
        operator: operator.lexeme.clone(),
        message,
    }
}

// The parser only builds operators the evaluator knows; this guards hand-built
// trees.
fn unknown_operator(operator: &Token) -> RuntimeError {
    RuntimeError::UnknownOperator {
        line: operator.line,
        operator: operator.lexeme.clone(),
    }
}

fn binary(operator: &Token, lv: Value, rv: Value) -> Result<Value, RuntimeError> {
    match operator.tokentype {
        TokenType::EqualEqual => return Ok(Value::Boolean(lv == rv)),
        TokenType::BangEqual => return Ok(Value::Boolean(lv != rv)),
        TokenType::Plus => {
            return match (lv, rv) {
                (Value::Number(l), Value::Number(r)) => Ok(Value::Number(l + r)),
                (Value::String(mut l), Value::String(r)) => {
                    l.push_str(&r);
                    Ok(Value::String(l))
                }
                (Value::String(l), r @ Value::Number(_)) => Ok(Value::String(format!("{}{}", l, r))),
                (l @ Value::Number(_), Value::String(r)) => Ok(Value::String(format!("{}{}", l, r))),
                _ => Err(type_mismatch(
                    operator,
                    String::from("Operands of '+' must be two numbers or strings."),
                )),
            };
        }
        _ => (),
    }
    let (l, r) = match (lv, rv) {
        (Value::Number(l), Value::Number(r)) => (l, r),
        _ => {
            return Err(type_mismatch(
                operator,
                format!("Operands of '{}' must be numbers.", operator.lexeme),
            ))
        }
    };
    match operator.tokentype {
        TokenType::Minus => Ok(Value::Number(l - r)),
        TokenType::Slash => Ok(Value::Number(l / r)),
        TokenType::Star => Ok(Value::Number(l * r)),
        TokenType::Greater => Ok(Value::Boolean(l > r)),
        TokenType::GreaterEqual => Ok(Value::Boolean(l >= r)),
        TokenType::Less => Ok(Value::Boolean(l < r)),
        TokenType::LessEqual => Ok(Value::Boolean(l <= r)),
        _ => Err(unknown_operator(operator)),
    }
}

#[cfg(test)]
mod tests {
    use super::{Interpreter, RuntimeError};
    use crate::ast::{Expression, Literal};
    use crate::token::{Token, TokenType};
    use crate::lox::SharedBuffer;
    use crate::parser::parse;
    use crate::scanner::scan_tokens;
    use pretty_assertions::assert_eq;

    fn run_with(interpreter: &mut Interpreter, source: &str) -> Result<(), RuntimeError> {
        let (tokens, errors) = scan_tokens(source);
        assert!(errors.is_empty(), "scan errors: {:?}", errors);
        let statements = match parse(&tokens) {
            Ok(statements) => statements,
            Err(e) => panic!("parse failed: {}", e),
        };
        interpreter.interpret(&statements)
    }

    fn run(source: &str) -> (String, Result<(), RuntimeError>) {
        let buffer = SharedBuffer::new();
        let mut interpreter = Interpreter::with_output(Box::new(buffer.clone()));
        let result = run_with(&mut interpreter, source);
        (buffer.contents(), result)
    }

    fn output(source: &str) -> String {
        let (out, result) = run(source);
        if let Err(e) = result {
            panic!("runtime error: {}", e);
        }
        out
    }

    #[test]
    fn arithmetic_precedence_and_associativity() {
        assert_eq!(output("print 1 + 2 * 3;"), "7\n");
        assert_eq!(output("print (1 + 2) * 3;"), "9\n");
        assert_eq!(output("print 10 - 3 - 2;"), "5\n");
        assert_eq!(output("print 7 / 2;"), "3.5\n");
        assert_eq!(output("print -(2 + 1);"), "-3\n");
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(
            output("print 1 < 2; print 2 <= 1; print nil == nil; print nil == false; print \"a\" == \"a\"; print 1 != 1;"),
            "true\nfalse\ntrue\nfalse\ntrue\nfalse\n"
        );
    }

    #[test]
    fn truthiness() {
        assert_eq!(
            output("print !nil; print !0; print !\"\"; if (0) print \"zero\";"),
            "true\nfalse\nfalse\nzero\n"
        );
    }

    #[test]
    fn string_concatenation_and_coercion() {
        assert_eq!(output("print \"a\" + \"b\";"), "ab\n");
        assert_eq!(output("print \"n = \" + 4;"), "n = 4\n");
        assert_eq!(output("print 2.5 + \"x\";"), "2.5x\n");
    }

    #[test]
    fn type_mismatch_names_operator() {
        let (_, result) = run("print 1 - \"a\";");
        match result {
            Err(RuntimeError::TypeMismatch { operator, line, .. }) => {
                assert_eq!(operator, "-");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let (_, result) = run("print true + nil;");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Operands of '+' must be two numbers or strings.\n[line 1]"
        );
        let (_, result) = run("print -\"x\";");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Operand of '-' must be a number.\n[line 1]"
        );
    }

    #[test]
    fn logical_operators_return_operands() {
        assert_eq!(
            output("print nil or \"yes\"; print 1 and 2; print false and undefined; print 1 or undefined;"),
            "yes\n2\nfalse\n1\n"
        );
    }

    #[test]
    fn binary_operands_evaluate_left_to_right() {
        let source = "
            fun f() { print \"f\"; return 1; }
            fun g() { print \"g\"; return 2; }
            print f() + g();
            print f() < g();
        ";
        assert_eq!(output(source), "f\ng\n3\nf\ng\ntrue\n");
    }

    #[test]
    fn shadowing() {
        assert_eq!(
            output("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
            "local\nglobal\n"
        );
    }

    #[test]
    fn blocks_assign_outer_variables() {
        assert_eq!(output("var a = 1; { a = 2; } print a;"), "2\n");
    }

    #[test]
    fn uninitialized_variables_are_nil() {
        assert_eq!(output("var a; print a;"), "nil\n");
    }

    #[test]
    fn assignment_yields_value() {
        assert_eq!(output("var a; var b; a = b = 3; print a; print b;"), "3\n3\n");
    }

    #[test]
    fn undefined_variable_read_and_assign() {
        let (_, result) = run("print nope;");
        match result {
            Err(RuntimeError::UndefinedVariable { name, .. }) => assert_eq!(name, "nope"),
            other => panic!("unexpected result: {:?}", other),
        }
        let (_, result) = run("{\n  nope = 1;\n}");
        assert_eq!(
            result.unwrap_err().to_string(),
            "Undefined variable 'nope'.\n[line 2]"
        );
    }

    #[test]
    fn local_redeclaration_is_a_fault() {
        let (_, result) = run("{ var a = 1; var a = 2; }");
        assert!(matches!(result, Err(RuntimeError::AlreadyDeclared { .. })));
        assert_eq!(output("var a = 1; var a = 2; print a;"), "2\n");
    }

    #[test]
    fn for_loop() {
        assert_eq!(
            output("for (var i = 0; i < 3; i = i + 1) print i;"),
            "0\n1\n2\n"
        );
        let (out, result) = run("for (var i = 0; i < 1; i = i + 1) {} print i;");
        assert_eq!(out, "");
        assert!(matches!(
            result,
            Err(RuntimeError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn while_loop() {
        assert_eq!(
            output("var i = 3; while (i > 0) { print i; i = i - 1; }"),
            "3\n2\n1\n"
        );
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!(
            output("fun add(a, b) { return a + b; } print add(1, 2);"),
            "3\n"
        );
        assert_eq!(output("fun f() {} print f();"), "nil\n");
        assert_eq!(output("fun f() { return; } print f();"), "nil\n");
        assert_eq!(
            output("fun f(n) { while (true) { if (n > 2) return n; n = n + 1; } } print f(0);"),
            "3\n"
        );
        assert_eq!(output("fun f() {} print f; print clock;"), "<fn f>\n<native fn clock>\n");
    }

    #[test]
    fn recursion() {
        assert_eq!(
            output("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(15);"),
            "610\n"
        );
    }

    #[test]
    fn closures_share_state() {
        let source = "
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            print counter();
            print counter();
            var other = makeCounter();
            print other();
        ";
        assert_eq!(output(source), "1\n2\n1\n");
    }

    #[test]
    fn closures_see_later_mutation() {
        let source = "
            var show;
            {
                var a = \"before\";
                fun f() { print a; }
                show = f;
                a = \"after\";
            }
            show();
        ";
        assert_eq!(output(source), "after\n");
    }

    #[test]
    fn anonymous_functions() {
        assert_eq!(
            output("var twice = fun (f, x) { return f(f(x)); }; print twice(fun (n) { return n * 2; }, 3);"),
            "12\n"
        );
        assert_eq!(
            output("fun adder(a) { return fun (b) { return a + b; }; } print adder(1)(2);"),
            "3\n"
        );
    }

    #[test]
    fn arity_mismatch() {
        for call in &["f(1);", "f(1, 2, 3);"] {
            let (_, result) = run(&format!("fun f(a, b) {{}} {}", call));
            let err = result.unwrap_err();
            assert!(err.to_string().starts_with("Expected 2 arguments"), "{}", err);
        }
    }

    #[test]
    fn duplicate_parameters_are_a_fault() {
        let (_, result) = run("fun f(a, a) {} f(1, 2);");
        match result {
            Err(RuntimeError::AlreadyDeclared { name, line }) => {
                assert_eq!(name, "a");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn operators_outside_the_grammar_are_rejected() {
        let mut interpreter = Interpreter::with_output(Box::new(SharedBuffer::new()));
        let expr = Expression::Unary {
            operator: Token::new(TokenType::Plus, "+", 4),
            right: Box::new(Expression::Literal(Literal::Number(1.0))),
        };
        let err = interpreter.evaluate(&expr).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::UnknownOperator { line: 4, .. }
        ));
        assert_eq!(err.to_string(), "Unknown operator '+'.\n[line 4]");
    }

    #[test]
    fn calling_non_callable() {
        let (_, result) = run("\"text\"();");
        assert!(matches!(result, Err(RuntimeError::NotCallable { line: 1 })));
    }

    #[test]
    fn callable_identity() {
        assert_eq!(
            output("fun f() {} var g = f; print f == g; print clock == clock; print f == clock;"),
            "true\ntrue\nfalse\n"
        );
    }

    #[test]
    fn side_effects_before_fault_are_kept() {
        let (out, result) = run("print 1; print nope; print 2;");
        assert_eq!(out, "1\n");
        assert!(result.is_err());
    }

    #[test]
    fn stack_overflow_is_reported_and_recoverable() {
        let buffer = SharedBuffer::new();
        let mut interpreter =
            Interpreter::with_output(Box::new(buffer.clone())).with_max_call_depth(200);
        let result = run_with(&mut interpreter, "fun f() { f(); } f();");
        assert!(matches!(result, Err(RuntimeError::StackOverflow { .. })));
        run_with(&mut interpreter, "{ var x = 1; } print \"still here\";").unwrap();
        assert_eq!(buffer.contents(), "still here\n");
    }

    #[test]
    fn faults_restore_global_scope() {
        let buffer = SharedBuffer::new();
        let mut interpreter = Interpreter::with_output(Box::new(buffer.clone()));
        assert!(run_with(&mut interpreter, "var a = 1; { var a = 2; nope; }").is_err());
        run_with(&mut interpreter, "print a;").unwrap();
        assert_eq!(buffer.contents(), "1\n");
        assert!(interpreter.globals().is_global());
    }

    #[test]
    fn deep_recursion_within_limit() {
        assert_eq!(
            output("fun down(n) { if (n == 0) return 0; return down(n - 1) + 1; } print down(5000);"),
            "5000\n"
        );
    }
}
