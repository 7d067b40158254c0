//! Execution of work units.
//!
//! The ring never looks inside a unit's code. It hands each unit and the
//! round's [`ExecutionContext`] to an [`ExecutionEngine`] and records what
//! comes back.

use async_trait::async_trait;

use crate::{
    hex::HexExt,
    work::{ExecutionContext, WorkUnit},
};

/// Runs one unit against a context. `Err` carries the failure text recorded
/// as that unit's contribution.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, unit: &WorkUnit, context: &ExecutionContext) -> Result<String, String>;
}

/// A tiny line based interpreter for demos and tests.
///
/// ```text
/// # comment
/// emit hello from {node}
/// set greeted = {data.greeted},{address}
/// fail out of cheese
/// ```
///
/// `emit` appends a line to the result, `set` writes the shared bag, `fail`
/// aborts the unit. Templates expand `{node}`, `{address}`, `{origin}`,
/// `{round}`, `{counter}`, `{unit}` and `{data.KEY}`; an absent bag key
/// expands to nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectiveEngine;

impl DirectiveEngine {
    fn expand(template: &str, unit: &WorkUnit, context: &ExecutionContext) -> Result<String, String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in {:?}", template))?;
            let name = &after[..end];
            match name {
                "node" => out.push_str(&context.current.id.short_hex().to_string()),
                "address" => out.push_str(&context.current.address),
                "origin" => out.push_str(&context.origin.address),
                "round" => out.push_str(&context.round.to_string()),
                "counter" => out.push_str(&context.stats.counter.to_string()),
                "unit" => out.push_str(&unit.name),
                _ => match name.strip_prefix("data.") {
                    Some(key) => out.push_str(&context.data.get(key).unwrap_or_default()),
                    None => return Err(format!("unknown placeholder {{{}}}", name)),
                },
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[async_trait]
impl ExecutionEngine for DirectiveEngine {
    async fn execute(&self, unit: &WorkUnit, context: &ExecutionContext) -> Result<String, String> {
        let mut lines = Vec::new();
        for (number, line) in unit.code.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, argument) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let argument = argument.trim();
            match directive {
                "emit" => lines.push(Self::expand(argument, unit, context)?),
                "set" => {
                    let (key, template) = argument
                        .split_once('=')
                        .ok_or_else(|| format!("line {}: set needs `key = value`", number + 1))?;
                    let value = Self::expand(template.trim(), unit, context)?;
                    context.data.insert(key.trim(), value);
                }
                "fail" => return Err(Self::expand(argument, unit, context)?),
                other => return Err(format!("line {}: unknown directive {:?}", number + 1, other)),
            }
        }
        Ok(lines.join("\n"))
    }
}
