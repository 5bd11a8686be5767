use crate::interrupt::set_up_process_interrupt_handler;
use crate::options::Options;
use crate::program::Program;
use crate::provider::Providers;
use anyhow::Result;
use converge_engine::backend::FileBackend;
use converge_engine::Deployment;
use std::future::Future;
use std::process::exit;
use std::sync::Arc;

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("converge error: {:?}", e);
            exit(1);
        }
    }
}

pub fn backend(options: &Options) -> Arc<FileBackend> {
    Arc::new(FileBackend::new(options.state_dir.clone()))
}

/// Run a command against the stack of `program`.
///
/// Sets up logging and the interrupt handler, starts the program's providers
/// and builds the [`Deployment`]. After `f` completes, the providers are shut
/// down.
pub fn with_deployment<F, Fut, R>(options: &Options, program: &Program, f: F) -> Result<R>
where
    F: FnOnce(Deployment) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut logger = crate::logging::set_up(options.logging())?;
    let interrupt_state = set_up_process_interrupt_handler()?;
    let stack = options.stack_ref(program.project.as_deref())?;

    let result = runtime()?.block_on(async {
        let providers = Providers::start(&program.providers)?;
        let deployment = Deployment::new(stack, backend(options), providers.registry())
            .with_interrupt(interrupt_state);

        // Consumes the deployment, so that nothing holds on to the providers
        let result = f(deployment).await;

        let cleanup_result = providers.close().await;
        and_cleanup(result, cleanup_result)
    });
    and_cleanup(result, logger.tear_down())
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}
