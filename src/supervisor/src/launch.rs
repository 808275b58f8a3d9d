//! Application command line built from the sealed launch plan.
use assembler::config::{
    PLACEHOLDER_HOST, PLACEHOLDER_PORT, PLACEHOLDER_SSL_CERTFILE, PLACEHOLDER_SSL_KEYFILE,
};
use assembler::{Identity, LaunchPlan};
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use crate::error::SupervisorError;
use crate::listener::ListenerDecision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Only variables the operator did not already set
    pub env: BTreeMap<String, String>,
    /// `(uid, gid)` to switch to before exec
    pub drop_to: Option<(u32, u32)>,
}

fn substitute(template: &str, decision: &ListenerDecision) -> String {
    let mut value = template
        .replace(PLACEHOLDER_HOST, decision.host())
        .replace(PLACEHOLDER_PORT, &decision.port().to_string());
    if let Some(tls) = decision.tls() {
        value = value
            .replace(
                PLACEHOLDER_SSL_KEYFILE,
                &tls.key_path.to_string_lossy(),
            )
            .replace(
                PLACEHOLDER_SSL_CERTFILE,
                &tls.cert_path.to_string_lossy(),
            );
    }
    value
}

impl LaunchCommand {
    /// `lookup` is the operator's environment, `current_uid` the supervisor's own uid.
    pub fn build<F>(
        plan: &LaunchPlan,
        decision: &ListenerDecision,
        identity: &Identity,
        lookup: F,
        current_uid: u32,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut args: Vec<String> = plan.args.iter().map(|a| substitute(a, decision)).collect();
        if decision.tls().is_some() {
            args.extend(plan.ssl_args.iter().map(|a| substitute(a, decision)));
        }

        let env = plan
            .env
            .iter()
            .filter(|(key, _)| lookup(key.as_str()).is_none())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let drop_to = if current_uid == 0 && !identity.is_root() {
            Some((identity.uid, identity.gid))
        } else {
            None
        };

        Self {
            program: plan.program.clone(),
            args,
            working_dir: plan.working_dir.clone(),
            env,
            drop_to,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        if let Some((uid, gid)) = self.drop_to {
            command.gid(gid).uid(uid);
        }
        command
    }

    /// Replace the current process with the application. Only returns on failure.
    pub fn exec(&self) -> SupervisorError {
        tracing::info!(
            "[supervisor] exec {} {}",
            self.program,
            self.args.join(" ")
        );
        let source = self.to_command().exec();
        SupervisorError::Launch {
            program: self.program.clone(),
            source,
        }
    }
}
