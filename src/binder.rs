// Copyright 2020 Joyent, Inc.

//! Turns call parameters into the positional argument list a procedure
//! receives.  Named parameters are placed using the parameter names the
//! procedure declared when it was registered.

use serde_json::Value;
use thiserror::Error;

use crate::codec::Params;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("no such parameter: {0}")]
    UnknownParameter(String),
}

/// Bind `params` against the declared parameter names of a procedure.
///
/// Positional parameters pass through untouched; arity is the procedure's
/// concern.  For named parameters each value lands at the index of its
/// declared name, and positions nobody named are filled with `null` up to the
/// last one that was.
pub fn bind(declared: &[String], params: Params) -> Result<Vec<Value>, BindError> {
    let named = match params {
        Params::Positional(args) => return Ok(args),
        Params::Named(named) => named,
    };

    let mut slots: Vec<Option<Value>> = vec![None; declared.len()];
    for (name, value) in named {
        match declared.iter().position(|d| *d == name) {
            Some(idx) => slots[idx] = Some(value),
            None => return Err(BindError::UnknownParameter(name)),
        }
    }

    let filled = slots
        .iter()
        .rposition(Option::is_some)
        .map_or(0, |last| last + 1);
    slots.truncate(filled);

    Ok(slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Value::Null))
        .collect())
}
