use crate::ast::{Expression, FunctionDecl, Literal, Statement};
use crate::stack::ensure_sufficient_stack;
use crate::token::{Token, TokenType};
use std::fmt;
use std::fmt::Formatter;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

const MAX_ARGUMENTS: usize = 255;

static END: Token = Token {
    tokentype: TokenType::EOF,
    lexeme: String::new(),
    line: 0,
};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("[line {line}] Error{location}: {message}")]
pub struct ParseError {
    pub line: i32,
    pub location: String,
    pub message: String,
}

/// Every error reported while parsing one source text.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct ParseErrors(pub Vec<ParseError>);

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

macro_rules! consume {
    ($self:expr, $token_type:pat, $message:expr) => {
        match $self.peek().tokentype {
            $token_type => Ok($self.advance()),
            _ => Err($self.error($self.peek(), $message)),
        }
    };
}

/// Parses a whole token stream, failing if anything at all was malformed.
pub fn parse(tokens: &[Token]) -> Result<Vec<Statement>, ParseErrors> {
    let mut parser = Parser::new(tokens);
    let statements = parser.parse();
    if parser.errors.is_empty() {
        Ok(statements)
    } else {
        Err(ParseErrors(parser.errors))
    }
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    current: usize,
    function_depth: usize,
    errors: Vec<ParseError>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Parser<'a> {
        Parser {
            tokens,
            current: 0,
            function_depth: 0,
            errors: Vec::new(),
        }
    }

    /// Parses every declaration it can. Malformed statements are recorded in
    /// [`Parser::errors`] and left out of the result.
    pub fn parse(&mut self) -> Vec<Statement> {
        let mut statements: Vec<Statement> = Vec::new();
        while !self.is_at_end() {
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
        }
        debug!(
            statements = statements.len(),
            errors = self.errors.len(),
            "parsed tokens"
        );
        statements
    }
    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }
    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    fn declaration(&mut self) -> Option<Statement> {
        match ensure_sufficient_stack(|| self.try_declaration()) {
            Ok(stmt) => Some(stmt),
            Err(e) => {
                self.errors.push(e);
                self.synchronize();
                None
            }
        }
    }
    fn try_declaration(&mut self) -> Result<Statement, ParseError> {
        match self.peek().tokentype {
            TokenType::Var => {
                self.advance();
                self.var_declaration()
            }
            TokenType::Fun => {
                self.advance();
                Ok(Statement::Function(self.function("function")?))
            }
            _ => self.statement(),
        }
    }
    fn function(&mut self, kind: &str) -> Result<Rc<FunctionDecl>, ParseError> {
        let name = match self.peek().tokentype {
            TokenType::LeftParen => {
                let line = self.peek().line;
                let synthetic = format!("#lambda_{}_{}", line, self.current);
                Token::new(TokenType::Identifier(synthetic.clone()), &synthetic, line)
            }
            _ => consume!(
                self,
                TokenType::Identifier(_),
                &format!("Expect {} name.", kind)
            )?
            .clone(),
        };
        consume!(
            self,
            TokenType::LeftParen,
            &format!("Expect '(' after {} name.", kind)
        )?;
        let mut params: Vec<Token> = Vec::new();
        if !matches!(self.peek().tokentype, TokenType::RightParen) {
            loop {
                if params.len() >= MAX_ARGUMENTS {
                    self.report(self.peek(), "Can't have more than 255 parameters.");
                }
                params.push(consume!(self, TokenType::Identifier(_), "Expect parameter name.")?.clone());
                match self.peek().tokentype {
                    TokenType::Comma => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }
        consume!(self, TokenType::RightParen, "Expect ')' after parameters.")?;
        consume!(
            self,
            TokenType::LeftBrace,
            &format!("Expect '{{' before {} body.", kind)
        )?;

        self.function_depth += 1;
        let body = self.block();
        self.function_depth -= 1;

        Ok(Rc::new(FunctionDecl {
            name,
            params,
            body: body?,
        }))
    }
    fn var_declaration(&mut self) -> Result<Statement, ParseError> {
        let name = consume!(self, TokenType::Identifier(_), "Expect variable name.")?.clone();
        let initializer = match self.peek().tokentype {
            TokenType::Equal => {
                self.advance();
                Some(self.expression()?)
            }
            _ => None,
        };
        consume!(
            self,
            TokenType::Semicolon,
            "Expect ';' after variable declaration."
        )?;
        Ok(Statement::Var { name, initializer })
    }
    fn statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek().tokentype {
            TokenType::If => {
                self.advance();
                self.if_statement()
            }
            TokenType::Print => {
                self.advance();
                self.print_statement()
            }
            TokenType::Return => {
                self.advance();
                self.return_statement()
            }
            TokenType::LeftBrace => {
                self.advance();
                Ok(Statement::Block(self.block()?))
            }
            TokenType::While => {
                self.advance();
                self.while_statement()
            }
            TokenType::For => {
                self.advance();
                self.for_statement()
            }
            _ => self.expression_statement(),
        }
    }
    // for (init; cond; incr) body  =>  { init; while (cond) { body; incr; } }
    fn for_statement(&mut self) -> Result<Statement, ParseError> {
        consume!(self, TokenType::LeftParen, "Expect '(' after 'for'.")?;
        let initializer: Option<Statement> = match self.peek().tokentype {
            TokenType::Semicolon => {
                self.advance();
                None
            }
            TokenType::Var => {
                self.advance();
                Some(self.var_declaration()?)
            }
            _ => Some(self.expression_statement()?),
        };

        let condition = match self.peek().tokentype {
            TokenType::Semicolon => Expression::Literal(Literal::Boolean(true)),
            _ => self.expression()?,
        };
        consume!(self, TokenType::Semicolon, "Expect ';' after loop condition.")?;

        let increment: Option<Expression> = match self.peek().tokentype {
            TokenType::RightParen => None,
            _ => Some(self.expression()?),
        };
        consume!(self, TokenType::RightParen, "Expect ')' after for clauses.")?;

        let mut body = self.statement()?;

        if let Some(x) = increment {
            body = Statement::Block(vec![body, Statement::Expression(x)])
        }
        body = Statement::While {
            condition,
            body: Box::new(body),
        };
        match initializer {
            None => Ok(body),
            Some(x) => Ok(Statement::Block(vec![x, body])),
        }
    }
    fn while_statement(&mut self) -> Result<Statement, ParseError> {
        consume!(self, TokenType::LeftParen, "Expect '(' after 'while'.")?;
        let condition = self.expression()?;
        consume!(self, TokenType::RightParen, "Expect ')' after condition.")?;
        let body = self.statement()?;
        Ok(Statement::While {
            condition,
            body: Box::new(body),
        })
    }
    fn if_statement(&mut self) -> Result<Statement, ParseError> {
        consume!(self, TokenType::LeftParen, "Expect '(' after 'if'.")?;
        let condition = self.expression()?;
        consume!(self, TokenType::RightParen, "Expect ')' after if condition.")?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = match self.peek().tokentype {
            TokenType::Else => {
                self.advance();
                Some(Box::new(self.statement()?))
            }
            _ => None,
        };
        Ok(Statement::If {
            condition,
            then_branch,
            else_branch,
        })
    }
    fn return_statement(&mut self) -> Result<Statement, ParseError> {
        let keyword = self.previous().clone();
        if self.function_depth == 0 {
            self.report(&keyword, "Can't return from top-level code.");
        }
        let value = match self.peek().tokentype {
            TokenType::Semicolon => None,
            _ => Some(self.expression()?),
        };
        consume!(self, TokenType::Semicolon, "Expect ';' after return value.")?;
        Ok(Statement::Return { keyword, value })
    }
    // Statements inside a block recover individually, so one bad line does
    // not swallow the rest of the block.
    fn block(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut statements: Vec<Statement> = Vec::new();
        while !self.is_at_end() {
            if let TokenType::RightBrace = self.peek().tokentype {
                break;
            }
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
        }
        consume!(self, TokenType::RightBrace, "Expect '}' after block.")?;
        Ok(statements)
    }
    fn print_statement(&mut self) -> Result<Statement, ParseError> {
        let expr = self.expression()?;
        consume!(self, TokenType::Semicolon, "Expect ';' after value.")?;
        Ok(Statement::Print(expr))
    }
    fn expression_statement(&mut self) -> Result<Statement, ParseError> {
        let expr = self.expression()?;
        consume!(self, TokenType::Semicolon, "Expect ';' after expression.")?;
        Ok(Statement::Expression(expr))
    }
    fn expression(&mut self) -> Result<Expression, ParseError> {
        ensure_sufficient_stack(|| self.assignment())
    }
    fn assignment(&mut self) -> Result<Expression, ParseError> {
        let expr = self.or()?;
        if let TokenType::Equal = self.peek().tokentype {
            let equals = self.advance();
            let value = self.assignment()?;
            if let Expression::Variable(name) = &expr {
                return Ok(Expression::Assign {
                    name: name.clone(),
                    value: Box::new(value),
                });
            }
            self.report(equals, "Invalid assignment target.");
        }
        Ok(expr)
    }
    fn or(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.and()?;
        while let TokenType::Or = self.peek().tokentype {
            let operator = self.advance().clone();
            let right = self.and()?;
            expr = Expression::Logical {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }
    fn and(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.equality()?;
        while let TokenType::And = self.peek().tokentype {
            let operator = self.advance().clone();
            let right = self.equality()?;
            expr = Expression::Logical {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }
    fn equality(&mut self) -> Result<Expression, ParseError> {
        self.left_associative(
            Parser::comparison,
            &[TokenType::BangEqual, TokenType::EqualEqual],
        )
    }
    fn comparison(&mut self) -> Result<Expression, ParseError> {
        self.left_associative(
            Parser::addition,
            &[
                TokenType::Greater,
                TokenType::GreaterEqual,
                TokenType::Less,
                TokenType::LessEqual,
            ],
        )
    }
    fn addition(&mut self) -> Result<Expression, ParseError> {
        self.left_associative(
            Parser::multiplication,
            &[TokenType::Minus, TokenType::Plus],
        )
    }
    fn multiplication(&mut self) -> Result<Expression, ParseError> {
        self.left_associative(Parser::unary, &[TokenType::Slash, TokenType::Star])
    }
    // Parses one operand, then folds any run of `operators` to the left.
    fn left_associative(
        &mut self,
        operand: fn(&mut Parser<'a>) -> Result<Expression, ParseError>,
        operators: &[TokenType],
    ) -> Result<Expression, ParseError> {
        let mut expr = operand(self)?;
        while operators.contains(&self.peek().tokentype) {
            let operator = self.advance().clone();
            let right = operand(self)?;
            expr = Expression::Binary {
                left: Box::new(expr),
                operator,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }
    fn unary(&mut self) -> Result<Expression, ParseError> {
        match self.peek().tokentype {
            TokenType::Bang | TokenType::Minus => {
                let operator = self.advance().clone();
                let right = ensure_sufficient_stack(|| self.unary())?;
                Ok(Expression::Unary {
                    operator,
                    right: Box::new(right),
                })
            }
            _ => self.call(),
        }
    }
    fn call(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.primary()?;
        while let TokenType::LeftParen = self.peek().tokentype {
            self.advance();
            expr = self.finish_call(expr)?;
        }
        Ok(expr)
    }
    fn finish_call(&mut self, callee: Expression) -> Result<Expression, ParseError> {
        let mut arguments: Vec<Expression> = Vec::new();
        if !matches!(self.peek().tokentype, TokenType::RightParen) {
            loop {
                if arguments.len() >= MAX_ARGUMENTS {
                    self.report(self.peek(), "Can't have more than 255 arguments.");
                }
                arguments.push(self.expression()?);
                match self.peek().tokentype {
                    TokenType::Comma => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }
        let paren = consume!(self, TokenType::RightParen, "Expect ')' after arguments.")?.clone();
        Ok(Expression::Call {
            callee: Box::new(callee),
            paren,
            arguments,
        })
    }
    fn primary(&mut self) -> Result<Expression, ParseError> {
        let literal = match &self.peek().tokentype {
            TokenType::False => Some(Literal::Boolean(false)),
            TokenType::True => Some(Literal::Boolean(true)),
            TokenType::Nil => Some(Literal::Nil),
            TokenType::Number(x) => Some(Literal::Number(*x)),
            TokenType::String(x) => Some(Literal::String(x.clone())),
            _ => None,
        };
        if let Some(literal) = literal {
            self.advance();
            return Ok(Expression::Literal(literal));
        }
        match self.peek().tokentype {
            TokenType::Identifier(_) => Ok(Expression::Variable(self.advance().clone())),
            TokenType::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                consume!(self, TokenType::RightParen, "Expect ')' after expression.")?;
                Ok(Expression::Grouping(Box::new(expr)))
            }
            TokenType::Fun => {
                self.advance();
                if !matches!(self.peek().tokentype, TokenType::LeftParen) {
                    return Err(self.error(self.peek(), "Expect '(' after 'fun'."));
                }
                Ok(Expression::Function(self.function("function")?))
            }
            _ => Err(self.error(self.peek(), "Expect expression.")),
        }
    }

    // Skips to the next statement boundary. Always consumes at least one
    // token.
    fn synchronize(&mut self) {
        self.advance();
        while !self.is_at_end() {
            if let TokenType::Semicolon = self.previous().tokentype {
                return;
            }
            match self.peek().tokentype {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }
            self.advance();
        }
    }
    fn advance(&mut self) -> &'a Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }
    fn is_at_end(&self) -> bool {
        self.peek().is_eof()
    }
    fn peek(&self) -> &'a Token {
        self.tokens.get(self.current).unwrap_or(&END)
    }
    fn previous(&self) -> &'a Token {
        self.tokens
            .get(self.current.saturating_sub(1))
            .unwrap_or(&END)
    }
    fn error(&self, token: &Token, message: &str) -> ParseError {
        let location = if token.is_eof() {
            String::from(" at end")
        } else {
            format!(" at '{}'", token.lexeme)
        };
        ParseError {
            line: token.line,
            location,
            message: message.to_string(),
        }
    }
    // Records an error that does not need resynchronizing.
    fn report(&mut self, token: &Token, message: &str) {
        let error = self.error(token, message);
        self.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Parser};
    use crate::ast::{AstPrinter, Expression, Statement};
    use crate::scanner::scan_tokens;
    use pretty_assertions::assert_eq;

    fn print_ast(source: &str) -> String {
        let (tokens, errors) = scan_tokens(source);
        assert!(errors.is_empty());
        match parse(&tokens) {
            Ok(statements) => AstPrinter::print(&statements),
            Err(e) => panic!("parse failed: {}", e),
        }
    }

    fn parse_errors(source: &str) -> Vec<String> {
        let (tokens, _) = scan_tokens(source);
        let mut parser = Parser::new(&tokens);
        parser.parse();
        parser.errors().iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn precedence() {
        assert_eq!(print_ast("1 + 2 * 3;"), "(; (+ 1 (* 2 3)))");
        assert_eq!(print_ast("(1 + 2) * 3;"), "(; (* (group (+ 1 2)) 3))");
        assert_eq!(
            print_ast("a or b and c == d < e;"),
            "(; (or a (and b (== c (< d e)))))"
        );
        assert_eq!(print_ast("!-x;"), "(; (! (- x)))");
    }

    #[test]
    fn binary_operators_are_left_associative() {
        assert_eq!(print_ast("10 - 3 - 2;"), "(; (- (- 10 3) 2))");
        assert_eq!(print_ast("8 / 4 / 2;"), "(; (/ (/ 8 4) 2))");
        assert_eq!(print_ast("a == b != c;"), "(; (!= (== a b) c))");
    }

    #[test]
    fn assignment_is_right_associative() {
        assert_eq!(print_ast("a = b = 1;"), "(; (assign a (assign b 1)))");
    }

    #[test]
    fn calls_chain() {
        assert_eq!(print_ast("f(1)(2, 3)();"), "(; (call (call (call f 1) 2 3)))");
    }

    #[test]
    fn for_is_desugared() {
        assert_eq!(
            print_ast("for (var i = 0; i < 3; i = i + 1) print i;"),
            "(block (var i 0) (while (< i 3) (block (print i) (; (assign i (+ i 1))))))"
        );
        assert_eq!(print_ast("for (;;) print 1;"), "(while true (print 1))");
    }

    #[test]
    fn functions() {
        assert_eq!(
            print_ast("fun add(a, b) { return a + b; }"),
            "(fun add (a b) (return (+ a b)))"
        );
        assert_eq!(
            print_ast("var f = fun (x) { print x; };"),
            "(var f (lambda #lambda_1_4 (x) (print x)))"
        );
        assert_eq!(print_ast("fun () {}"), "(fun #lambda_1_1 ())");
    }

    #[test]
    fn if_else_and_while() {
        assert_eq!(
            print_ast("if (a) print 1; else { print 2; } while (b) b = false;"),
            "(if a (print 1) (block (print 2)))\n(while b (; (assign b false)))"
        );
    }

    #[test]
    fn one_bad_statement_is_isolated() {
        let (tokens, _) = scan_tokens("print 1;\nprint 2 +;\nprint 3;\nvar x = 4;");
        let mut parser = Parser::new(&tokens);
        let statements = parser.parse();
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(
            parser.errors()[0].to_string(),
            "[line 2] Error at ';': Expect expression."
        );
        assert_eq!(statements.len(), 3);
        assert_eq!(
            AstPrinter::print(&statements),
            "(print 1)\n(print 3)\n(var x 4)"
        );
        assert!(parse(&tokens).is_err());
    }

    #[test]
    fn recovery_inside_blocks() {
        let (tokens, _) = scan_tokens("{ print 1; var = 2; print 3; }");
        let mut parser = Parser::new(&tokens);
        let statements = parser.parse();
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(AstPrinter::print(&statements), "(block (print 1) (print 3))");
    }

    #[test]
    fn invalid_assignment_target_keeps_parsing() {
        let (tokens, _) = scan_tokens("a + b = c; print 1;");
        let mut parser = Parser::new(&tokens);
        let statements = parser.parse();
        assert_eq!(
            parser.errors()[0].to_string(),
            "[line 1] Error at '=': Invalid assignment target."
        );
        assert_eq!(statements.len(), 2);
        match &statements[0] {
            Statement::Expression(Expression::Binary { .. }) => (),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn error_at_end() {
        assert_eq!(
            parse_errors("print 1"),
            vec!["[line 1] Error at end: Expect ';' after value."]
        );
        assert_eq!(
            parse_errors("{ print 1;"),
            vec!["[line 1] Error at end: Expect '}' after block."]
        );
    }

    #[test]
    fn top_level_return_is_reported() {
        assert_eq!(
            parse_errors("return 1;"),
            vec!["[line 1] Error at 'return': Can't return from top-level code."]
        );
        assert!(parse_errors("fun f() { return 1; }").is_empty());
    }

    #[test]
    fn too_many_arguments_is_not_fatal() {
        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let source = format!("f({}); print 1;", args.join(", "));
        let (tokens, _) = scan_tokens(&source);
        let mut parser = Parser::new(&tokens);
        let statements = parser.parse();
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(
            parser.errors()[0].message,
            "Can't have more than 255 arguments."
        );
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn too_many_parameters_is_not_fatal() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}} print 1;", params.join(", "));
        let (tokens, _) = scan_tokens(&source);
        let mut parser = Parser::new(&tokens);
        let statements = parser.parse();
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(
            parser.errors()[0].to_string(),
            "[line 1] Error at 'p255': Can't have more than 255 parameters."
        );
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn deep_nesting_parses() {
        let source = format!("print {}1;", "-".repeat(200_000));
        let (tokens, _) = scan_tokens(&source);
        let statements = parse(&tokens).unwrap();
        assert_eq!(statements.len(), 1);
        drop(statements);
    }

    #[test]
    fn stray_tokens_make_progress() {
        assert_eq!(
            parse_errors("} ) print 1;"),
            vec!["[line 1] Error at '}': Expect expression."]
        );
    }
}
