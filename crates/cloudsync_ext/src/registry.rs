//! Named functions callable by the host.

use crate::error::{BridgeError, BridgeResult};
use crate::value::HostValue;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

type Handler = Box<dyn Fn(&[HostValue]) -> BridgeResult<HostValue> + Send + Sync>;

struct Function {
    arity: usize,
    handler: Handler,
}

/// Maps function names to handlers with a fixed arity.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Function>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register<F>(&mut self, name: impl Into<String>, arity: usize, handler: F)
    where
        F: Fn(&[HostValue]) -> BridgeResult<HostValue> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.into(),
            Function {
                arity,
                handler: Box::new(handler),
            },
        );
    }

    /// Calls `name` with `args`.
    ///
    /// A panicking handler is reported as [`BridgeError::Panicked`] and
    /// never unwinds into the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnknownFunction`] or [`BridgeError::Arity`]
    /// before the handler runs, otherwise whatever the handler returns.
    pub fn call(&self, name: &str, args: &[HostValue]) -> BridgeResult<HostValue> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| BridgeError::UnknownFunction(name.to_string()))?;

        if args.len() != function.arity {
            return Err(BridgeError::Arity {
                function: name.to_string(),
                expected: function.arity,
                got: args.len(),
            });
        }

        catch_unwind(AssertUnwindSafe(|| (function.handler)(args)))
            .unwrap_or_else(|_| Err(BridgeError::Panicked(name.to_string())))
    }

    /// Declared arity of `name`.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.functions.get(name).map(|f| f.arity)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.functions.iter().map(|(name, func)| (name, func.arity)))
            .finish()
    }
}
