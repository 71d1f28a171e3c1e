use actd_kernel::GroupDescriptor;
use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PolicyDenied(pub String);

/// Decides whether a group may be launched with a given command line.
pub trait ExecPolicy: Send + Sync {
    fn check_exec(&self, desc: &GroupDescriptor, argv: &[String]) -> Result<(), PolicyDenied>;
}

/// Accepts every command line. Intended for tests and trusted setups.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPolicy;

impl ExecPolicy for AllowAllPolicy {
    fn check_exec(&self, _desc: &GroupDescriptor, _argv: &[String]) -> Result<(), PolicyDenied> {
        Ok(())
    }
}

/// Glob allow-lists for the command path and for every descriptor option and
/// property. Groups asking for a custom implementation are always rejected.
#[derive(Debug, Clone)]
pub struct GlobExecPolicy {
    commands: GlobSet,
    options: GlobSet,
}

impl GlobExecPolicy {
    pub fn new<S: AsRef<str>>(commands: &[S], options: &[S]) -> Result<Self, globset::Error> {
        Ok(Self {
            commands: build_set(commands)?,
            options: build_set(options)?,
        })
    }

    fn check_option(&self, option: &str) -> Result<(), PolicyDenied> {
        if self.options.is_match(option) {
            Ok(())
        } else {
            Err(PolicyDenied(format!("option '{option}' is not permitted")))
        }
    }

    fn check_property(&self, name: &str, value: &str) -> Result<(), PolicyDenied> {
        let assignment = format!("{name}={value}");
        if self.options.is_match(&assignment) || (value.is_empty() && self.options.is_match(name)) {
            Ok(())
        } else {
            Err(PolicyDenied(format!("property '{assignment}' is not permitted")))
        }
    }
}

fn build_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.as_ref())?);
    }
    builder.build()
}

impl ExecPolicy for GlobExecPolicy {
    fn check_exec(&self, desc: &GroupDescriptor, argv: &[String]) -> Result<(), PolicyDenied> {
        if desc.is_custom_implementation() {
            return Err(PolicyDenied(
                "custom group implementations (class, location or data) are not permitted".into(),
            ));
        }
        for (name, value) in &desc.properties {
            self.check_property(name, value)?;
        }
        if let Some(command) = &desc.command {
            for option in &command.options {
                self.check_option(option)?;
            }
        }
        let program = argv
            .first()
            .ok_or_else(|| PolicyDenied("empty command line".into()))?;
        if !self.commands.is_match(program) {
            return Err(PolicyDenied(format!("command '{program}' is not permitted")));
        }
        Ok(())
    }
}
