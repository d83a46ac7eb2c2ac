pub mod ast;
pub mod callable;
pub mod environment;
pub mod interpreter;
pub mod lox;
pub mod parser;
pub mod scanner;
pub mod token;
pub mod value;

mod stack;

pub use crate::lox::{Lox, Status};
