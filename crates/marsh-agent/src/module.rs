//! Modules, functions and module resolution.
//!
//! A [`Module`] is a named collection of callable functions. Modules are
//! resolved from a module path by a [`ModuleLoader`]; the server caches the
//! result per path so each module is loaded once per worker.

use crate::error::{error_kinds, CallError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Copy)]
pub struct Arguments<'a> {
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

impl<'a> Arguments<'a> {
    /// Wrap raw arguments.
    pub fn new(args: &'a [Value], kwargs: &'a Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional arguments.
    pub fn positional(&self) -> &'a [Value] {
        self.args
    }

    /// Keyword arguments.
    pub fn keywords(&self) -> &'a Map<String, Value> {
        self.kwargs
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.args.get(index).ok_or_else(|| {
            CallError::new(
                error_kinds::INVALID_ARGUMENTS,
                format!("missing positional argument {index}"),
            )
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            CallError::new(
                error_kinds::INVALID_ARGUMENTS,
                format!("invalid positional argument {index}: {e}"),
            )
        })
    }

    /// Deserialize the keyword argument `name`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CallError::new(
                    error_kinds::INVALID_ARGUMENTS,
                    format!("invalid keyword argument {name}: {e}"),
                )
            }),
        }
    }

    /// Deserialize the keyword argument `name`, falling back to the
    /// positional argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, name: &str, index: usize) -> Result<T> {
        match self.kwarg(name)? {
            Some(value) => Ok(value),
            None => self.arg(index),
        }
    }
}

/// A collection of functions callable by name.
pub trait Module: Send + Sync {
    /// Invoke `function` with the given arguments.
    fn call(&self, function: &str, args: Arguments<'_>) -> Result<Value>;

    /// Names of the functions this module exports.
    fn functions(&self) -> Vec<String>;
}

type Function = Box<dyn Fn(Arguments<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// A module backed by in-process Rust closures.
///
/// ```
/// use marsh_agent::FunctionTable;
/// use serde_json::json;
///
/// let module = FunctionTable::new()
///     .function("double", |args| Ok(json!(args.arg::<i64>(0)? * 2)));
/// ```
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<String, Function>,
}

impl FunctionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function.
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arguments<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(f));
        self
    }
}

impl Module for FunctionTable {
    fn call(&self, function: &str, args: Arguments<'_>) -> Result<Value> {
        let f = self.functions.get(function).ok_or_else(|| {
            CallError::new(
                error_kinds::FUNCTION_NOT_FOUND,
                format!("module has no function {function}"),
            )
        })?;
        f(args).map_err(CallError::from_anyhow)
    }

    fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolves a module path to a module.
pub trait ModuleLoader: Send + Sync {
    /// Load the module at `path`.
    ///
    /// Return an error of kind [`error_kinds::MODULE_NOT_FOUND`] when this
    /// loader does not know the path, so that a [`LoaderChain`] can try the
    /// next loader.
    fn load(&self, path: &str) -> Result<Arc<dyn Module>>;
}

/// Loader for modules registered in-process under a fixed path.
#[derive(Default)]
pub struct Registry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `path`.
    pub fn register(mut self, path: impl Into<String>, module: impl Module + 'static) -> Self {
        self.modules.insert(path.into(), Arc::new(module));
        self
    }

    /// Registered paths.
    pub fn paths(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }
}

impl ModuleLoader for Registry {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>> {
        self.modules.get(path).cloned().ok_or_else(|| {
            CallError::new(
                error_kinds::MODULE_NOT_FOUND,
                format!("no module registered at {path}"),
            )
        })
    }
}

/// Tries several loaders in order.
#[derive(Default)]
pub struct LoaderChain {
    loaders: Vec<Box<dyn ModuleLoader>>,
}

impl LoaderChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a loader.
    pub fn with(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }
}

impl ModuleLoader for LoaderChain {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>> {
        for loader in &self.loaders {
            match loader.load(path) {
                Err(e) if e.kind() == error_kinds::MODULE_NOT_FOUND => continue,
                other => return other,
            }
        }
        Err(CallError::new(
            error_kinds::MODULE_NOT_FOUND,
            format!("module not found: {path}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> FunctionTable {
        FunctionTable::new()
            .function("double", |args| Ok(json!(args.arg::<i64>(0)? * 2)))
            .function("greet", |args| {
                let name: String = args.get("name", 0)?;
                Ok(json!(format!("hello {name}")))
            })
    }

    #[test]
    fn test_function_table_call() {
        let kwargs = Map::new();
        let result = table()
            .call("double", Arguments::new(&[json!(21)], &kwargs))
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_keyword_falls_back_to_positional() {
        let mut kwargs = Map::new();
        let module = table();
        assert_eq!(
            module
                .call("greet", Arguments::new(&[json!("ada")], &kwargs))
                .unwrap(),
            json!("hello ada")
        );

        kwargs.insert("name".into(), json!("bob"));
        assert_eq!(
            module.call("greet", Arguments::new(&[], &kwargs)).unwrap(),
            json!("hello bob")
        );
    }

    #[test]
    fn test_function_not_found() {
        let kwargs = Map::new();
        let err = table()
            .call("missing", Arguments::new(&[], &kwargs))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::FUNCTION_NOT_FOUND);
    }

    #[test]
    fn test_invalid_arguments() {
        let kwargs = Map::new();
        let err = table()
            .call("double", Arguments::new(&[json!("x")], &kwargs))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::INVALID_ARGUMENTS);

        let err = table()
            .call("double", Arguments::new(&[], &kwargs))
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::INVALID_ARGUMENTS);
    }

    #[test]
    fn test_functions_sorted() {
        assert_eq!(table().functions(), vec!["double", "greet"]);
    }

    #[test]
    fn test_loader_chain_falls_through() {
        let chain = LoaderChain::new()
            .with(Registry::new())
            .with(Registry::new().register("math", table()));

        assert!(chain.load("math").is_ok());
        let err = chain.load("nope").err().unwrap();
        assert_eq!(err.kind(), error_kinds::MODULE_NOT_FOUND);
    }
}
