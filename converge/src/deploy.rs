use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use converge_core::{
    plan::{plan_from_json, plan_to_json, Plan},
    step::OperationMode,
    urn::Urn,
};
use converge_engine::{options::ExecuteOptions, summary::ResourceChangeSummary, Execution};

use crate::{application::with_deployment, options::Options, program::Program};

/// Settings shared by every command that deploys.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct DeployArgs {
    /// Maximum number of provider operations to run at once. The default, 0,
    /// means no limit
    #[arg(short, long, default_value_t = 0)]
    pub(crate) parallel: usize,

    /// Only operate on this resource; may be repeated
    #[arg(short, long = "target", value_name = "URN")]
    pub(crate) targets: Vec<Urn>,

    /// Also operate on everything that depends on a target
    #[arg(long, requires = "targets")]
    pub(crate) target_dependents: bool,

    /// Do not start new operations after the first failure
    #[arg(long)]
    pub(crate) halt_on_error: bool,

    /// Timeout in seconds for provider operations that neither the resource
    /// nor its provider sets a timeout for
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,

    /// Replace this resource even if its inputs are unchanged; may be repeated
    #[arg(long, value_name = "URN")]
    pub(crate) replace: Vec<Urn>,

    /// Fail every step that would change a resource
    #[arg(long)]
    pub(crate) expect_no_changes: bool,
}

impl DeployArgs {
    pub(crate) fn to_execute_options(&self, mode: OperationMode) -> ExecuteOptions {
        ExecuteOptions {
            mode,
            parallelism: NonZeroUsize::new(self.parallel),
            targets: (!self.targets.is_empty())
                .then(|| self.targets.iter().cloned().collect::<BTreeSet<_>>()),
            target_dependents: self.target_dependents,
            halt_on_error: self.halt_on_error,
            default_timeout: self.timeout.map(Duration::from_secs),
            replace: self.replace.iter().cloned().collect(),
            expect_no_changes: self.expect_no_changes,
            ..ExecuteOptions::default()
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct UpArgs {
    #[command(flatten)]
    pub(crate) deploy: DeployArgs,

    /// Only carry out the changes that `preview --save-plan` recorded in this file
    #[arg(long, value_name = "FILE")]
    pub(crate) plan: Option<PathBuf>,

    /// Warn about deviations from the plan instead of failing
    #[arg(long, requires = "plan")]
    pub(crate) relax_plan: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct PreviewArgs {
    #[command(flatten)]
    pub(crate) deploy: DeployArgs,

    /// Write the plan to this file, for `up --plan`
    #[arg(long, value_name = "FILE")]
    pub(crate) save_plan: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct ModeArgs {
    #[command(flatten)]
    pub(crate) deploy: DeployArgs,

    /// Only show what would happen
    #[arg(long)]
    pub(crate) preview: bool,
}

/// Run the `up` command.
pub(crate) fn up(options: &Options, args: &UpArgs) -> Result<()> {
    let mut execute_options = args.deploy.to_execute_options(OperationMode::Update);
    if let Some(path) = &args.plan {
        execute_options.plan = Some(load_plan(path)?);
        execute_options.relax_plan_constraints = args.relax_plan;
    }
    deploy(options, execute_options).map(|_| ())
}

/// Run the `preview` command.
pub(crate) fn preview(options: &Options, args: &PreviewArgs) -> Result<()> {
    let mut execute_options = args.deploy.to_execute_options(OperationMode::Update);
    execute_options.dry_run = true;
    let execution = deploy(options, execute_options)?;
    if let Some(path) = &args.save_plan {
        let plan = execution
            .plan
            .context("The deployment did not produce a plan")?;
        save_plan(path, &plan)?;
        eprintln!("Plan saved to {}", path.display());
    }
    Ok(())
}

pub(crate) fn refresh(options: &Options, args: &ModeArgs) -> Result<()> {
    run_mode(options, args, OperationMode::Refresh)
}

pub(crate) fn destroy(options: &Options, args: &ModeArgs) -> Result<()> {
    run_mode(options, args, OperationMode::Destroy)
}

pub(crate) fn import(options: &Options, args: &ModeArgs) -> Result<()> {
    run_mode(options, args, OperationMode::Import)
}

fn run_mode(options: &Options, args: &ModeArgs, mode: OperationMode) -> Result<()> {
    let mut execute_options = args.deploy.to_execute_options(mode);
    execute_options.dry_run = args.preview;
    deploy(options, execute_options).map(|_| ())
}

fn deploy(options: &Options, execute_options: ExecuteOptions) -> Result<Execution> {
    // Destroying works from the state alone
    let program = match execute_options.mode {
        OperationMode::Destroy => Program::load_if_exists(&options.file)?,
        _ => Program::load(&options.file)?,
    };
    let declared = &program;
    let execution = with_deployment(options, &program, |deployment| async move {
        let execution = deployment
            .execute_stream(declared.registrations(), &execute_options)
            .await?;
        Ok(execution)
    })?;
    report(&execution.summary)?;
    Ok(execution)
}

/// Print the summary, and fail when the deployment did not complete.
fn report(summary: &ResourceChangeSummary) -> Result<()> {
    for operation in &summary.interrupted_operations {
        eprintln!(
            "warning: a previous run was interrupted while {:?} {}; it may exist without being tracked",
            operation.kind, operation.urn
        );
    }
    for warning in &summary.warnings {
        eprintln!("warning: {}", warning);
    }
    println!("{}", summary);

    let failures = summary.failures().count();
    if failures > 0 {
        bail!("{} step(s) failed", failures);
    }
    if summary.was_interrupted() {
        bail!("interrupted before all steps ran");
    }
    Ok(())
}

fn load_plan(path: &Path) -> Result<Plan> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read plan {}", path.display()))?;
    plan_from_json(&contents).with_context(|| format!("Could not parse plan {}", path.display()))
}

fn save_plan(path: &Path, plan: &Plan) -> Result<()> {
    let contents = plan_to_json(plan)?;
    std::fs::write(path, contents)
        .with_context(|| format!("Could not write plan {}", path.display()))
}
