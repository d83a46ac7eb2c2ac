use crate::stack::ensure_sufficient_stack;
use crate::token::Token;
use std::fmt;
use std::fmt::Formatter;
use std::mem;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::Boolean(x) => write!(f, "{}", x),
            Literal::Number(x) => write!(f, "{}", x),
            Literal::String(x) => write!(f, "{}", x),
        }
    }
}

#[derive(Debug)]
pub enum Expression {
    Binary {
        left: Box<Expression>,
        operator: Token,
        right: Box<Expression>,
    },
    Grouping(Box<Expression>),
    Literal(Literal),
    Logical {
        left: Box<Expression>,
        operator: Token,
        right: Box<Expression>,
    },
    Unary {
        operator: Token,
        right: Box<Expression>,
    },
    Variable(Token),
    Assign {
        name: Token,
        value: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        paren: Token,
        arguments: Vec<Expression>,
    },
    Function(Rc<FunctionDecl>),
}

/// A function body shared between the statement that declares it and every
/// function value created from it.
#[derive(Debug)]
pub struct FunctionDecl {
    pub name: Token,
    pub params: Vec<Token>,
    pub body: Vec<Statement>,
}

#[derive(Debug)]
pub enum Statement {
    Print(Expression),
    Expression(Expression),
    Var {
        name: Token,
        initializer: Option<Expression>,
    },
    Block(Vec<Statement>),
    If {
        condition: Expression,
        then_branch: Box<Statement>,
        else_branch: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
    },
    Function(Rc<FunctionDecl>),
    Return {
        keyword: Token,
        value: Option<Expression>,
    },
}

pub trait Visitor<T, Output> {
    fn visit(&mut self, n: &T) -> Output;
}

impl Expression {
    pub fn accept<T>(&self, v: &mut dyn Visitor<Expression, T>) -> T {
        v.visit(self)
    }
}

impl Statement {
    pub fn accept<T>(&self, v: &mut dyn Visitor<Statement, T>) -> T {
        v.visit(self)
    }
}

// Nodes are freed from a heap worklist. Dropping children recursively would
// exhaust the native stack on deeply nested programs.
enum Node {
    Expression(Expression),
    Statement(Statement),
}

impl Drop for Expression {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        dismantle(pending);
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        dismantle(pending);
    }
}

fn dismantle(mut pending: Vec<Node>) {
    while let Some(mut node) = pending.pop() {
        match &mut node {
            Node::Expression(e) => e.detach_children(&mut pending),
            Node::Statement(s) => s.detach_children(&mut pending),
        }
    }
}

fn take_expression(slot: &mut Expression) -> Node {
    Node::Expression(mem::replace(slot, Expression::Literal(Literal::Nil)))
}

fn take_statement(slot: &mut Statement) -> Node {
    Node::Statement(mem::replace(slot, Statement::Block(Vec::new())))
}

// A body still shared with a live function value is left to that value.
fn detach_body(decl: &mut Rc<FunctionDecl>, pending: &mut Vec<Node>) {
    if let Some(decl) = Rc::get_mut(decl) {
        pending.extend(decl.body.drain(..).map(Node::Statement));
    }
}

impl Expression {
    fn detach_children(&mut self, pending: &mut Vec<Node>) {
        match self {
            Expression::Binary { left, right, .. } | Expression::Logical { left, right, .. } => {
                pending.push(take_expression(left));
                pending.push(take_expression(right));
            }
            Expression::Grouping(inner)
            | Expression::Unary { right: inner, .. }
            | Expression::Assign { value: inner, .. } => pending.push(take_expression(inner)),
            Expression::Call {
                callee, arguments, ..
            } => {
                pending.push(take_expression(callee));
                pending.extend(arguments.drain(..).map(Node::Expression));
            }
            Expression::Function(decl) => detach_body(decl, pending),
            Expression::Literal(_) | Expression::Variable(_) => (),
        }
    }
}

impl Statement {
    fn detach_children(&mut self, pending: &mut Vec<Node>) {
        match self {
            Statement::Print(e) | Statement::Expression(e) => pending.push(take_expression(e)),
            Statement::Var {
                initializer: value, ..
            }
            | Statement::Return { value, .. } => {
                if let Some(e) = value.take() {
                    pending.push(Node::Expression(e));
                }
            }
            Statement::Block(statements) => {
                pending.extend(statements.drain(..).map(Node::Statement));
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                pending.push(take_expression(condition));
                pending.push(take_statement(then_branch));
                if let Some(else_branch) = else_branch.take() {
                    pending.push(Node::Statement(*else_branch));
                }
            }
            Statement::While { condition, body } => {
                pending.push(take_expression(condition));
                pending.push(take_statement(body));
            }
            Statement::Function(decl) => detach_body(decl, pending),
        }
    }
}

/// Renders syntax trees in a parenthesized prefix form, e.g. `(+ 1 (* 2 3))`.
pub struct AstPrinter {}

impl AstPrinter {
    pub fn print(statements: &[Statement]) -> String {
        let mut printer = AstPrinter {};
        statements
            .iter()
            .map(|stmt| printer.stmt(stmt))
            .collect::<Vec<String>>()
            .join("\n")
    }
    fn expr(&mut self, expr: &Expression) -> String {
        ensure_sufficient_stack(|| expr.accept::<String>(self))
    }
    fn stmt(&mut self, stmt: &Statement) -> String {
        ensure_sufficient_stack(|| stmt.accept::<String>(self))
    }
    fn parenthesize(&mut self, name: &str, args: Vec<&Expression>) -> String {
        let mut x = String::from("(");
        x.push_str(name);
        for arg in args {
            x.push(' ');
            x.push_str(self.expr(arg).as_str());
        }
        x.push(')');
        x
    }
    fn function(&mut self, keyword: &str, decl: &FunctionDecl) -> String {
        let params: Vec<&str> = decl.params.iter().map(|p| p.lexeme.as_str()).collect();
        let mut x = format!("({} {} ({})", keyword, decl.name.lexeme, params.join(" "));
        for stmt in &decl.body {
            x.push(' ');
            x.push_str(self.stmt(stmt).as_str());
        }
        x.push(')');
        x
    }
}

impl Visitor<Expression, String> for AstPrinter {
    fn visit(&mut self, n: &Expression) -> String {
        match n {
            Expression::Binary {
                left,
                operator,
                right,
            } => self.parenthesize(&operator.lexeme, vec![&**left, &**right]),
            Expression::Grouping(x) => self.parenthesize("group", vec![&**x]),
            Expression::Literal(Literal::String(y)) => format!("{:?}", y),
            Expression::Literal(x) => x.to_string(),
            Expression::Unary { operator, right } => {
                self.parenthesize(&operator.lexeme, vec![&**right])
            }
            Expression::Variable(x) => x.lexeme.clone(),
            Expression::Assign { name, value } => {
                format!("(assign {} {})", name.lexeme, self.expr(value))
            }
            Expression::Logical {
                left,
                operator,
                right,
            } => self.parenthesize(&operator.lexeme, vec![&**left, &**right]),
            Expression::Call {
                callee, arguments, ..
            } => {
                let mut args: Vec<&Expression> = vec![&**callee];
                args.extend(arguments.iter());
                self.parenthesize("call", args)
            }
            Expression::Function(decl) => self.function("lambda", decl),
        }
    }
}

impl Visitor<Statement, String> for AstPrinter {
    fn visit(&mut self, n: &Statement) -> String {
        match n {
            Statement::Print(e) => self.parenthesize("print", vec![e]),
            Statement::Expression(e) => self.parenthesize(";", vec![e]),
            Statement::Var { name, initializer } => match initializer {
                Some(e) => format!("(var {} {})", name.lexeme, self.expr(e)),
                None => format!("(var {})", name.lexeme),
            },
            Statement::Block(stmts) => {
                let mut x = String::from("(block");
                for stmt in stmts {
                    x.push(' ');
                    x.push_str(self.stmt(stmt).as_str());
                }
                x.push(')');
                x
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let mut x = format!("(if {} {}", self.expr(condition), self.stmt(then_branch));
                if let Some(else_branch) = else_branch {
                    x.push(' ');
                    x.push_str(self.stmt(else_branch).as_str());
                }
                x.push(')');
                x
            }
            Statement::While { condition, body } => {
                format!("(while {} {})", self.expr(condition), self.stmt(body))
            }
            Statement::Function(decl) => self.function("fun", decl),
            Statement::Return { value, .. } => match value {
                Some(e) => self.parenthesize("return", vec![e]),
                None => String::from("(return)"),
            },
        }
    }
}
