//! Human and JSON output.
//!
//! Human mode prints strings bare and everything else as pretty JSON. JSON
//! mode wraps the data as `{ "data": .. }`.

use anyhow::Result;
use serde_json::{Value, json};

use crate::opts::GlobalOpts;

pub fn print_success(opts: &GlobalOpts, data: Value) -> Result<()> {
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(&json!({ "data": data }))?);
    } else if opts.json {
        println!("{}", serde_json::to_string(&json!({ "data": data }))?);
    } else {
        match data {
            Value::String(s) => println!("{s}"),
            Value::Object(ref map) if map.is_empty() => {}
            other => println!("{}", serde_json::to_string_pretty(&other)?),
        }
    }
    Ok(())
}
