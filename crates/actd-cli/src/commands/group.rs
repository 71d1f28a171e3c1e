//! `actd group` commands.

use anyhow::{Context, Result};
use actd_host::control::{decode_b64_cbor, encode_b64_cbor};
use actd_kernel::{CommandEnvironment, GroupDescriptor};
use clap::{Args, Subcommand};
use serde_json::json;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::{call, parse_property};

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// Register a group and print its id
    Register(GroupDescArgs),
    /// Unregister a group together with all of its objects
    Unregister { group: String },
    /// Show a group's descriptor
    Show { group: String },
    /// Replace a group's descriptor (applies from the next process start)
    Set {
        group: String,
        #[command(flatten)]
        desc: GroupDescArgs,
    },
}

#[derive(Args, Debug)]
pub struct GroupDescArgs {
    /// Executable for the group process (default: the daemon's group command)
    #[arg(long)]
    pub command: Option<String>,

    /// Extra command-line option, repeatable
    #[arg(long = "option", allow_hyphen_values = true)]
    pub options: Vec<String>,

    /// Property override as NAME=VALUE, repeatable
    #[arg(long = "property", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,
}

impl GroupDescArgs {
    fn descriptor(&self) -> GroupDescriptor {
        let command = (self.command.is_some() || !self.options.is_empty()).then(|| {
            CommandEnvironment {
                path: self.command.clone(),
                options: self.options.clone(),
            }
        });
        GroupDescriptor {
            properties: self.properties.iter().cloned().collect(),
            command,
            ..GroupDescriptor::default()
        }
    }
}

fn encode(desc: &GroupDescriptor) -> Result<String> {
    encode_b64_cbor(desc).context("encode group descriptor")
}

pub async fn cmd_group(opts: &GlobalOpts, cmd: &GroupCommand) -> Result<()> {
    match cmd {
        GroupCommand::Register(args) => {
            let desc_b64 = encode(&args.descriptor())?;
            let result = call(opts, "register-group", json!({ "desc_b64": desc_b64 })).await?;
            print_success(opts, result["group"].clone())
        }
        GroupCommand::Unregister { group } => {
            call(opts, "unregister-group", json!({ "group": group })).await?;
            print_success(opts, json!({}))
        }
        GroupCommand::Show { group } => {
            let result = call(opts, "get-group-desc", json!({ "group": group })).await?;
            let desc: GroupDescriptor = decode_b64_cbor(result["desc_b64"].as_str().unwrap_or_default())
                .context("decode group descriptor")?;
            print_success(opts, serde_json::to_value(desc)?)
        }
        GroupCommand::Set { group, desc } => {
            let desc_b64 = encode(&desc.descriptor())?;
            let result = call(
                opts,
                "set-group-desc",
                json!({ "group": group, "desc_b64": desc_b64 }),
            )
            .await?;
            let old: GroupDescriptor =
                decode_b64_cbor(result["old_desc_b64"].as_str().unwrap_or_default())
                    .context("decode previous group descriptor")?;
            print_success(opts, json!({ "previous": old }))
        }
    }
}
