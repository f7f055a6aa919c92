//! The `builtin` module shipped with the worker binary.
//!
//! Small, dependency-free functions that make a freshly provisioned
//! environment usable (and testable) before any user module is installed.

use crate::error::{error_kinds, CallError};
use crate::module::{Arguments, FunctionTable};
use serde_json::{json, Value};
use std::io::Write;
use std::time::Duration;

/// Path under which the builtin module is registered.
pub const BUILTIN_MODULE: &str = "builtin";

/// Build the builtin module.
///
/// | Function | Arguments | Returns |
/// |----------|-----------|---------|
/// | `add` | `a`, `b` | sum (integer when both are integers) |
/// | `echo` | `value` | `value` |
/// | `print` | lines..., `stream` = `stdout`/`stderr` | number of lines printed |
/// | `sleep` | `ms` | `ms` |
/// | `fail` | `message`, `kind` = `Error` | raises |
/// | `env` | `name` | variable value or `null` |
pub fn builtin_module() -> FunctionTable {
    FunctionTable::new()
        .function("add", add)
        .function("echo", |args| {
            Ok(args
                .kwarg::<Value>("value")?
                .or_else(|| args.positional().first().cloned())
                .unwrap_or(Value::Null))
        })
        .function("print", print)
        .function("sleep", |args| {
            let ms: u64 = args.get("ms", 0)?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .function("fail", |args| {
            let message: String = args.get("message", 0)?;
            let kind = args
                .kwarg::<String>("kind")?
                .unwrap_or_else(|| error_kinds::ERROR.to_string());
            Err(CallError::new(kind, message).into())
        })
        .function("env", |args| {
            let name: String = args.get("name", 0)?;
            Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
        })
}

fn add(args: Arguments<'_>) -> anyhow::Result<Value> {
    let a: Value = args.get("a", 0)?;
    let b: Value = args.get("b", 1)?;
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(json!(sum));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(CallError::new(error_kinds::INVALID_ARGUMENTS, "add expects two numbers").into()),
    }
}

fn print(args: Arguments<'_>) -> anyhow::Result<Value> {
    let stream = args
        .kwarg::<String>("stream")?
        .unwrap_or_else(|| "stdout".to_string());
    let lines: Vec<String> = args
        .positional()
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    match stream.as_str() {
        "stdout" => {
            let mut out = std::io::stdout().lock();
            for line in &lines {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        "stderr" => {
            let mut err = std::io::stderr().lock();
            for line in &lines {
                writeln!(err, "{line}")?;
            }
        }
        other => {
            return Err(CallError::new(
                error_kinds::INVALID_ARGUMENTS,
                format!("unknown stream {other}"),
            )
            .into())
        }
    }
    Ok(json!(lines.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use serde_json::Map;

    fn call(function: &str, args: &[Value]) -> crate::error::Result<Value> {
        let kwargs = Map::new();
        builtin_module().call(function, Arguments::new(args, &kwargs))
    }

    #[test]
    fn test_add() {
        assert_eq!(call("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(call("add", &[json!(1.5), json!(1)]).unwrap(), json!(2.5));
        let err = call("add", &[json!("a"), json!(1)]).unwrap_err();
        assert_eq!(err.kind(), error_kinds::INVALID_ARGUMENTS);
    }

    #[test]
    fn test_echo() {
        assert_eq!(call("echo", &[json!({"x": [1]})]).unwrap(), json!({"x": [1]}));
        assert_eq!(call("echo", &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_fail_with_kind() {
        let mut kwargs = Map::new();
        kwargs.insert("kind".into(), json!("ValueError"));
        let err = builtin_module()
            .call("fail", Arguments::new(&[json!("bad value")], &kwargs))
            .unwrap_err();
        assert_eq!(err.kind(), "ValueError");
        assert_eq!(err.message(), "bad value");
    }

    #[test]
    fn test_print_counts_lines() {
        assert_eq!(call("print", &[json!("a"), json!(1)]).unwrap(), json!(2));
    }

    #[test]
    fn test_sleep_returns_duration() {
        assert_eq!(call("sleep", &[json!(1)]).unwrap(), json!(1));
    }
}
