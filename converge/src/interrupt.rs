use anyhow::{Context, Result};
use converge_engine::interrupt::InterruptState;

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        eprintln!("converge: {}", interrupt_message(interrupted.is_interrupted()));
        interrupted.set_interrupted();
    })
    .context("Error setting interrupt handler")
}

fn interrupt_message(already_interrupted: bool) -> &'static str {
    if already_interrupted {
        "already stopping; waiting for cancelled operations to wind down"
    } else {
        "interrupted; no new operations will be started and running provider operations are being cancelled"
    }
}

/// The interrupt state that Ctrl-C sets for the rest of the process.
pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
