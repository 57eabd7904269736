//! Connector functions available to JMESPath expressions
//!
//! The library is a fixed list registered next to the JMESPath builtins:
//! arithmetic, Unix timestamp conversion and string helpers. Every function is pure.

use chrono::{DateTime, SecondsFormat, Utc};
use jmespath::functions::{ArgumentType, CustomFunction, Function, Signature};
use jmespath::{Context, ErrorReason, JmespathError, Rcvar, Runtime, ToJmespath};
use std::sync::OnceLock;

type NumberOp = fn(f64, f64) -> Result<f64, String>;

/// Returns the JMESPath runtime with the builtins and the connector functions.
///
/// Compiled JMESPath expressions borrow their runtime, so the runtime is built
/// once per process and never changes afterwards.
pub fn connector_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<&'static Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Box::leak(Box::new(build_runtime())))
}

fn build_runtime() -> Runtime {
    let mut runtime = Runtime::new();
    runtime.register_builtin_functions();
    for (name, function) in connector_functions() {
        runtime.register_function(name, function);
    }
    runtime
}

fn connector_functions() -> Vec<(&'static str, Box<dyn Function>)> {
    vec![
        ("add", number_function(|a, b| Ok(a + b))),
        ("subtract", number_function(|a, b| Ok(a - b))),
        ("multiply", number_function(|a, b| Ok(a * b))),
        ("divide", number_function(divide)),
        ("pow", number_function(|a, b| Ok(a.powf(b)))),
        ("fromUnixTimestamp", timestamp_function(1000)),
        ("fromUnixTimestampMs", timestamp_function(1)),
        ("insertString", insert_string_function()),
        ("append", append_function()),
    ]
}

fn divide(a: f64, b: f64) -> Result<f64, String> {
    if b == 0.0 {
        return Err("division by zero".to_string());
    }
    Ok(a / b)
}

fn number_function(op: NumberOp) -> Box<dyn Function> {
    Box::new(CustomFunction::new(
        Signature::new(vec![ArgumentType::Number, ArgumentType::Number], None),
        Box::new(move |args: &[Rcvar], ctx: &mut Context<'_>| {
            let ctx = &*ctx;
            let a = number_arg(args, 0, ctx)?;
            let b = number_arg(args, 1, ctx)?;
            let result = op(a, b).map_err(|message| runtime_error(ctx, message))?;
            if !result.is_finite() {
                return Err(runtime_error(ctx, format!("result {} is not a finite number", result)));
            }
            to_variable(result, ctx)
        }),
    ))
}

/// `multiplier` converts the argument to milliseconds.
fn timestamp_function(multiplier: i64) -> Box<dyn Function> {
    Box::new(CustomFunction::new(
        Signature::new(vec![ArgumentType::Number], None),
        Box::new(move |args: &[Rcvar], ctx: &mut Context<'_>| {
            let ctx = &*ctx;
            let value = number_arg(args, 0, ctx)?;
            let millis = (value * multiplier as f64).round() as i64;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| runtime_error(ctx, format!("timestamp {} is out of range", value)))?;
            to_variable(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true), ctx)
        }),
    ))
}

fn insert_string_function() -> Box<dyn Function> {
    Box::new(CustomFunction::new(
        Signature::new(
            vec![ArgumentType::String, ArgumentType::String, ArgumentType::Number],
            None,
        ),
        Box::new(|args: &[Rcvar], ctx: &mut Context<'_>| {
            let ctx = &*ctx;
            let original = string_arg(args, 0, ctx)?;
            let insert = string_arg(args, 1, ctx)?;
            let position = number_arg(args, 2, ctx)?;
            let length = original.chars().count();

            if position < 0.0 || position.fract() != 0.0 || position as usize > length {
                return Err(runtime_error(
                    ctx,
                    format!("position {} is outside of a string of length {}", position, length),
                ));
            }

            let split = position as usize;
            let mut result: String = original.chars().take(split).collect();
            result.push_str(&insert);
            result.extend(original.chars().skip(split));
            to_variable(result, ctx)
        }),
    ))
}

fn append_function() -> Box<dyn Function> {
    Box::new(CustomFunction::new(
        Signature::new(vec![ArgumentType::String], Some(ArgumentType::String)),
        Box::new(|args: &[Rcvar], ctx: &mut Context<'_>| {
            let ctx = &*ctx;
            let mut result = String::new();
            for index in 0..args.len() {
                result.push_str(&string_arg(args, index, ctx)?);
            }
            to_variable(result, ctx)
        }),
    ))
}

fn number_arg(args: &[Rcvar], index: usize, ctx: &Context<'_>) -> Result<f64, JmespathError> {
    args.get(index)
        .and_then(|arg| arg.as_number())
        .ok_or_else(|| runtime_error(ctx, format!("argument {} must be a number", index)))
}

fn string_arg(args: &[Rcvar], index: usize, ctx: &Context<'_>) -> Result<String, JmespathError> {
    args.get(index)
        .and_then(|arg| arg.as_string().cloned())
        .ok_or_else(|| runtime_error(ctx, format!("argument {} must be a string", index)))
}

fn to_variable<T: ToJmespath>(value: T, ctx: &Context<'_>) -> Result<Rcvar, JmespathError> {
    value
        .to_jmespath()
        .map_err(|e| runtime_error(ctx, e.to_string()))
}

fn runtime_error(ctx: &Context<'_>, message: impl Into<String>) -> JmespathError {
    JmespathError::from_ctx(ctx, ErrorReason::Parse(message.into()))
}
