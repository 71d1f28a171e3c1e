//! `actd object` commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use actd_host::control::{decode_b64_cbor, encode_b64_cbor};
use actd_kernel::{GroupId, ObjectDescriptor};
use clap::{Args, Subcommand};
use serde_json::json;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::call;

#[derive(Subcommand, Debug)]
pub enum ObjectCommand {
    /// Register an object and print its id
    Register(ObjectDescArgs),
    /// Unregister an object
    Unregister { object: String },
    /// Show an object's descriptor
    Show { object: String },
    /// Replace an object's descriptor (the group must stay the same)
    Set {
        object: String,
        #[command(flatten)]
        desc: ObjectDescArgs,
    },
}

#[derive(Args, Debug)]
pub struct ObjectDescArgs {
    /// Owning group id
    #[arg(long)]
    pub group: GroupId,

    /// Class the group instantiates
    #[arg(long = "class")]
    pub class_name: String,

    /// Code location handed to the group
    #[arg(long)]
    pub location: Option<String>,

    /// File whose bytes become the object's construction data
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Reactivate the object whenever its group restarts
    #[arg(long)]
    pub restart: bool,
}

impl ObjectDescArgs {
    fn descriptor(&self) -> Result<ObjectDescriptor> {
        let mut desc = ObjectDescriptor::new(self.group, &self.class_name).with_restart(self.restart);
        desc.location = self.location.clone();
        if let Some(path) = &self.data_file {
            let data = std::fs::read(path)
                .with_context(|| format!("read construction data {}", path.display()))?;
            desc = desc.with_data(data);
        }
        Ok(desc)
    }
}

fn encode(desc: &ObjectDescriptor) -> Result<String> {
    encode_b64_cbor(desc).context("encode object descriptor")
}

pub async fn cmd_object(opts: &GlobalOpts, cmd: &ObjectCommand) -> Result<()> {
    match cmd {
        ObjectCommand::Register(args) => {
            let desc_b64 = encode(&args.descriptor()?)?;
            let result = call(opts, "register-object", json!({ "desc_b64": desc_b64 })).await?;
            print_success(opts, result["object"].clone())
        }
        ObjectCommand::Unregister { object } => {
            call(opts, "unregister-object", json!({ "object": object })).await?;
            print_success(opts, json!({}))
        }
        ObjectCommand::Show { object } => {
            let result = call(opts, "get-object-desc", json!({ "object": object })).await?;
            let desc: ObjectDescriptor =
                decode_b64_cbor(result["desc_b64"].as_str().unwrap_or_default())
                    .context("decode object descriptor")?;
            print_success(opts, serde_json::to_value(desc)?)
        }
        ObjectCommand::Set { object, desc } => {
            let desc_b64 = encode(&desc.descriptor()?)?;
            let result = call(
                opts,
                "set-object-desc",
                json!({ "object": object, "desc_b64": desc_b64 }),
            )
            .await?;
            let old: ObjectDescriptor =
                decode_b64_cbor(result["old_desc_b64"].as_str().unwrap_or_default())
                    .context("decode previous object descriptor")?;
            print_success(opts, json!({ "previous": old }))
        }
    }
}
