use crate::interpreter::RuntimeError;
use crate::token::Token;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// A handle to one scope frame. Cloning the handle shares the frame, which is
/// how closures keep their defining scope alive after the block that created
/// it has finished.
#[derive(Clone)]
pub struct Environment {
    frame: Rc<RefCell<Frame>>,
}

struct Frame {
    values: BTreeMap<String, Value>,
    enclosing: Option<Environment>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values may hold closures over this very frame, so only names are shown.
        let frame = self.frame.borrow();
        f.debug_struct("Environment")
            .field("names", &frame.values.keys().collect::<Vec<&String>>())
            .field("global", &frame.enclosing.is_none())
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new()
    }
}

impl Environment {
    /// Creates a global frame with no enclosing scope.
    pub fn new() -> Environment {
        Environment::with_enclosing(None)
    }
    fn with_enclosing(enclosing: Option<Environment>) -> Environment {
        Environment {
            frame: Rc::new(RefCell::new(Frame {
                values: BTreeMap::new(),
                enclosing,
            })),
        }
    }
    pub fn new_child(&self) -> Environment {
        Environment::with_enclosing(Some(self.clone()))
    }
    #[cfg(test)]
    pub(crate) fn enclosing(&self) -> Option<Environment> {
        self.frame.borrow().enclosing.clone()
    }
    #[cfg(test)]
    pub(crate) fn is_global(&self) -> bool {
        self.frame.borrow().enclosing.is_none()
    }
    pub fn ptr_eq(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.frame, &other.frame)
    }

    /// Binds `name` in this frame. The global frame lets a name be declared
    /// again; local frames reject it.
    pub fn define(&self, name: &Token, value: Value) -> Result<(), RuntimeError> {
        let mut frame = self.frame.borrow_mut();
        if frame.enclosing.is_some() && frame.values.contains_key(&name.lexeme) {
            return Err(RuntimeError::AlreadyDeclared {
                line: name.line,
                name: name.lexeme.clone(),
            });
        }
        frame.values.insert(name.lexeme.clone(), value);
        Ok(())
    }

    /// Binds a host-provided value, bypassing redeclaration checks.
    pub fn define_native(&self, name: &str, value: Value) {
        self.frame
            .borrow_mut()
            .values
            .insert(name.to_string(), value);
    }

    pub fn get(&self, name: &Token) -> Result<Value, RuntimeError> {
        let mut current = self.clone();
        loop {
            let next = {
                let frame = current.frame.borrow();
                if let Some(x) = frame.values.get(&name.lexeme) {
                    return Ok(x.clone());
                }
                frame.enclosing.clone()
            };
            match next {
                Some(env) => current = env,
                None => return Err(undefined(name)),
            }
        }
    }

    /// Overwrites the nearest existing binding of `name`. Never creates one.
    pub fn assign(&self, name: &Token, value: Value) -> Result<(), RuntimeError> {
        let mut current = self.clone();
        loop {
            let next = {
                let mut frame = current.frame.borrow_mut();
                if let Some(x) = frame.values.get_mut(&name.lexeme) {
                    *x = value;
                    return Ok(());
                }
                frame.enclosing.clone()
            };
            match next {
                Some(env) => current = env,
                None => return Err(undefined(name)),
            }
        }
    }

    /// Drops every binding in this frame. Used when a session ends to release
    /// functions that captured the frame they are stored in.
    ///
    /// Only the global frame is cleared this way. A function declared inside
    /// a block or call captures the local frame that also stores it, and that
    /// frame is never reclaimed.
    pub fn clear(&self) {
        let values = std::mem::take(&mut self.frame.borrow_mut().values);
        drop(values);
    }
}

fn undefined(name: &Token) -> RuntimeError {
    RuntimeError::UndefinedVariable {
        line: name.line,
        name: name.lexeme.clone(),
    }
}
