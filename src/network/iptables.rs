//! Linux iptables interface
//!
//! Every rule is installed behind an existence check (`-C`) so setup is
//! idempotent, and deletion treats an absent rule as success so teardown
//! is best effort.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::Getters;
use log::trace;
use std::{
    fmt::{self, Debug},
    path::PathBuf,
    process::Output,
};
use tokio::process::Command;

#[async_trait]
/// Iptables behavior trait.
pub trait Iptables: DynClone + Send + Sync {
    /// Append the rule unless an identical one exists.
    async fn ensure(&self, _rule: &Rule) -> Result<()> {
        Ok(())
    }

    /// Delete the rule. Absent rules are success.
    async fn delete(&self, _rule: &Rule) -> Result<()> {
        Ok(())
    }
}

clone_trait_object!(Iptables);

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// A single iptables rule in a built-in chain.
pub struct Rule {
    #[get = "pub"]
    #[builder(default = r#""filter".to_string()"#)]
    /// Target table of the rule.
    table: String,

    #[get = "pub"]
    /// Chain the rule lives in.
    chain: String,

    #[get = "pub"]
    /// The match and jump specification.
    spec: Vec<String>,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

#[derive(Builder, Clone, Getters)]
#[builder(pattern = "owned", setter(into))]
/// The main interface to the Linux iptables.
pub struct DefaultIptables {
    #[get]
    /// Path to the `iptables` binary.
    binary: PathBuf,

    #[getset(get)]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// Internal command executor to be used
    exec_command: Box<dyn ExecCommand>,
}

impl DefaultIptables {
    /// Create an instance using the `iptables` binary from `$PATH`. A
    /// missing binary is only an error once a rule is actually applied.
    pub fn from_path() -> Result<Self> {
        let binary = which::which("iptables").unwrap_or_else(|_| "iptables".into());
        DefaultIptablesBuilder::default()
            .binary(binary)
            .build()
            .context("build iptables instance")
    }
}

#[async_trait]
impl Iptables for DefaultIptables {
    async fn ensure(&self, rule: &Rule) -> Result<()> {
        self.rule_insert_unique(rule).await
    }

    async fn delete(&self, rule: &Rule) -> Result<()> {
        self.rule_delete(rule).await
    }
}

impl Debug for DefaultIptables {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DefaultIptables")
            .field("binary", self.binary())
            .finish()
    }
}

#[async_trait]
trait ExecCommand: DynClone + Send + Sync {
    async fn output(&self, command: &mut Command) -> Result<Output> {
        command.output().await.context("run command")
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Default)]
/// DefaultExecCommand is a wrapper which can be used to execute a command in a standard way.
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

impl DefaultIptables {
    /// Add a rule to its chain if it does not already exist.
    async fn rule_insert_unique(&self, rule: &Rule) -> Result<()> {
        trace!("Inserting unique rule: {}", rule);

        if !self.rule_exists(rule).await {
            self.rule_append(rule).await.context("append rule")?;
        }
        Ok(())
    }

    /// Append a rule.
    async fn rule_append(&self, rule: &Rule) -> Result<()> {
        trace!("Appending rule");
        self.run(&rule_args("-A", rule)).await?;
        Ok(())
    }

    /// Delete the rule. It does not error if the rule doesn't exist.
    async fn rule_delete(&self, rule: &Rule) -> Result<()> {
        trace!("Deleting rule: {}", rule);
        if self.rule_exists(rule).await {
            trace!("Rule exists, deleting now");
            self.run(&rule_args("-D", rule)).await?;
        } else {
            trace!("Rule does not seem to exist");
        }
        Ok(())
    }

    /// Checks if the provided rule exists.
    async fn rule_exists(&self, rule: &Rule) -> bool {
        trace!("Checking if rule exists");
        self.run(&rule_args("-C", rule)).await.is_ok()
    }

    /// Run an iptables command and retrieve its output.
    async fn run(&self, args: &[String]) -> Result<String> {
        trace!("Running: {} {}", self.binary().display(), args.join(" "));

        let output = self
            .exec_command()
            .output(Command::new(self.binary()).arg("--wait").args(args))
            .await
            .context("run iptables")?;

        if !output.status.success() {
            bail!(
                "command {} {} failed with error: {}",
                self.binary().display(),
                args.join(" "),
                String::from_utf8(output.stderr).context("convert stderr to string")?
            )
        }

        Ok(String::from_utf8(output.stdout)
            .context("convert stdout to string")?
            .trim()
            .into())
    }
}

fn rule_args(action: &str, rule: &Rule) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        rule.table().clone(),
        action.to_string(),
        rule.chain().clone(),
    ];
    args.extend(rule.spec().iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{os::unix::process::ExitStatusExt, process::ExitStatus, sync::Arc};
    use tokio::sync::RwLock;

    #[derive(Clone, Debug)]
    struct ExecCommandMock {
        output: Vec<Output>,
        call_index: Arc<RwLock<usize>>,
    }

    impl Default for ExecCommandMock {
        fn default() -> Self {
            Self {
                output: vec![],
                call_index: Arc::new(RwLock::new(0)),
            }
        }
    }

    #[async_trait]
    impl ExecCommand for ExecCommandMock {
        async fn output(&self, _: &mut Command) -> Result<Output> {
            let mut index = self.call_index.write().await;
            let output = self
                .output
                .get(*index)
                .with_context(|| format!("no call for index {}", *index))?;
            *index += 1;
            Ok(output.clone())
        }
    }

    impl ExecCommandMock {
        fn to_iptables(self) -> Result<DefaultIptables> {
            let mut iptables = DefaultIptablesBuilder::default().binary("").build()?;
            iptables.exec_command = Box::new(self);
            Ok(iptables)
        }

        fn add_call(&mut self, exit_code: i32) {
            self.output.push(Output {
                status: ExitStatus::from_raw(exit_code),
                stdout: vec![],
                stderr: vec![],
            });
        }

        fn add_any_success(&mut self) {
            self.add_call(0);
        }

        fn add_any_failure(&mut self) {
            self.add_call(1);
        }
    }

    fn rule() -> Result<Rule> {
        Ok(RuleBuilder::default()
            .table("nat")
            .chain("POSTROUTING")
            .spec(vec![
                "-s".to_string(),
                "172.17.0.0/16".to_string(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ])
            .build()?)
    }

    #[test]
    fn rule_args_shape() -> Result<()> {
        let args = rule_args("-A", &rule()?);
        assert_eq!(
            args,
            vec!["-t", "nat", "-A", "POSTROUTING", "-s", "172.17.0.0/16", "-j", "MASQUERADE"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn ensure_appends_when_missing() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_failure(); // rule_exists
        mock.add_any_success(); // rule_append

        let iptables = mock.to_iptables()?;
        iptables.ensure(&rule()?).await
    }

    #[tokio::test]
    async fn ensure_skips_when_present() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_success(); // rule_exists

        let iptables = mock.to_iptables()?;
        iptables.ensure(&rule()?).await
    }

    #[tokio::test]
    async fn ensure_failure_propagates() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_failure(); // rule_exists
        mock.add_any_failure(); // rule_append

        let iptables = mock.to_iptables()?;
        assert!(iptables.ensure(&rule()?).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn delete_success_exists() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_success(); // rule_exists
        mock.add_any_success(); // rule_delete

        let iptables = mock.to_iptables()?;
        iptables.delete(&rule()?).await
    }

    #[tokio::test]
    async fn delete_success_not_exists() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_failure(); // rule_exists

        let iptables = mock.to_iptables()?;
        iptables.delete(&rule()?).await
    }

    #[tokio::test]
    async fn delete_failure() -> Result<()> {
        let mut mock = ExecCommandMock::default();
        mock.add_any_success(); // rule_exists
        mock.add_any_failure(); // rule_delete

        let iptables = mock.to_iptables()?;
        assert!(iptables.delete(&rule()?).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn run_success_echo() -> Result<()> {
        let echo = which::which("echo")?;
        let iptables = DefaultIptablesBuilder::default().binary(&echo).build()?;

        let output = iptables.run(&["hello".to_string(), "world".to_string()]).await?;
        assert_eq!(output, "--wait hello world");
        Ok(())
    }

    #[tokio::test]
    async fn run_failure_invalid_binary() -> Result<()> {
        let iptables = DefaultIptablesBuilder::default().binary("wrong").build()?;
        assert!(iptables.run(&[]).await.is_err());
        Ok(())
    }
}
