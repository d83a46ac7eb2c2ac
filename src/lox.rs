use crate::ast::{AstPrinter, Expression, Literal, Statement};
use crate::interpreter::Interpreter;
use crate::parser::Parser;
use crate::scanner::scan_tokens;
use num_enum::IntoPrimitive;
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::mem;
use std::path::Path;
use std::rc::Rc;
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Outcome of running a piece of source. The discriminants double as
/// process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, Display)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Usage = 64,
    DataError = 65,
    Software = 70,
    IoError = 74,
}

impl Status {
    pub fn exit_code(self) -> i32 {
        i32::from(u8::from(self))
    }
}

/// A `Write` sink whose contents can be read back while the writer is owned
/// by an interpreter.
#[derive(Clone, Default, Debug)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> SharedBuffer {
        SharedBuffer::default()
    }
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One interpreter session. Globals persist across calls to [`Lox::run`] and
/// [`Lox::run_line`]; separate sessions never share state.
pub struct Lox {
    interpreter: Interpreter,
    errors: Box<dyn Write>,
    print_ast: bool,
}

impl Default for Lox {
    fn default() -> Self {
        Lox::new()
    }
}

impl Lox {
    pub fn new() -> Lox {
        Lox::with_channels(Box::new(io::stdout()), Box::new(io::stderr()))
    }
    /// Program output goes to `output`, diagnostics to `errors`.
    pub fn with_channels(output: Box<dyn Write>, errors: Box<dyn Write>) -> Lox {
        Lox {
            interpreter: Interpreter::with_output(output),
            errors,
            print_ast: false,
        }
    }
    pub fn print_ast(mut self, print_ast: bool) -> Lox {
        self.print_ast = print_ast;
        self
    }
    pub fn max_call_depth(mut self, depth: usize) -> Lox {
        self.interpreter = self.interpreter.with_max_call_depth(depth);
        self
    }

    /// Runs a whole script. Nothing executes if it fails to scan or parse,
    /// and execution stops at the first runtime error.
    pub fn run(&mut self, source: &str) -> Status {
        self.run_source(source, false)
    }

    /// Runs one REPL line. A line holding a single expression statement also
    /// prints that expression's value.
    pub fn run_line(&mut self, line: &str) -> Status {
        self.run_source(line, true)
    }

    pub fn run_file(&mut self, path: &Path) -> Status {
        info!(path = %path.display(), "running script");
        match fs::read_to_string(path) {
            Ok(contents) => self.run(&contents),
            Err(e) => {
                self.report(&format!("Could not read '{}': {}", path.display(), e));
                Status::IoError
            }
        }
    }

    /// Reads lines from `input` until it is exhausted, reporting errors and
    /// carrying on after each one.
    pub fn run_prompt(
        &mut self,
        input: &mut dyn BufRead,
        prompt: &mut dyn Write,
    ) -> io::Result<()> {
        loop {
            write!(prompt, "> ")?;
            prompt.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(prompt)?;
                return Ok(());
            }
            let status = self.run_line(&line);
            debug!(%status, "line finished");
        }
    }

    fn run_source(&mut self, source: &str, echo: bool) -> Status {
        let (tokens, scan_errors) = scan_tokens(source);
        for e in &scan_errors {
            self.report(e);
        }
        let mut parser = Parser::new(&tokens);
        let mut statements = parser.parse();
        for e in parser.errors() {
            self.report(e);
        }
        if !scan_errors.is_empty() || parser.had_error() {
            return Status::DataError;
        }

        if self.print_ast {
            let ast = AstPrinter::print(&statements);
            self.report(&ast);
        }

        if echo {
            if let [Statement::Expression(expr)] = statements.as_mut_slice() {
                let expr = mem::replace(expr, Expression::Literal(Literal::Nil));
                statements = vec![Statement::Print(expr)];
            }
        }

        match self.interpreter.interpret(&statements) {
            Ok(()) => Status::Success,
            Err(e) => {
                self.report(&e);
                Status::Software
            }
        }
    }

    fn report(&mut self, diagnostic: &dyn fmt::Display) {
        if let Err(e) = writeln!(self.errors, "{}", diagnostic) {
            warn!(error = %e, "failed to write diagnostic");
        }
    }
}
