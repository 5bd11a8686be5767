use std::{io::IsTerminal as _, path::PathBuf};

use anyhow::{bail, Result};
use clap::{ColorChoice, Parser};
use converge_core::urn::StackRef;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The program file that declares the resources and their providers
    #[arg(short, long, global = true, default_value = "converge.json")]
    pub file: PathBuf,

    /// Name of the stack to operate on
    #[arg(short, long, global = true, default_value = "dev", env = "CONVERGE_STACK")]
    pub stack: String,

    /// Name of the project; defaults to the `project` of the program file
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Directory where the state of each stack is kept
    #[arg(long, global = true, default_value = ".converge", env = "CONVERGE_STATE_DIR")]
    pub state_dir: PathBuf,
}

impl Options {
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }

    /// The stack to operate on, with `program_project` as the fallback
    /// project name.
    pub fn stack_ref(&self, program_project: Option<&str>) -> Result<StackRef> {
        let project = match (&self.project, program_project) {
            (Some(project), _) => project.as_str(),
            (None, Some(project)) => project,
            (None, None) => bail!(
                "No project name; pass --project or set `project` in {}",
                self.file.display()
            ),
        };
        Ok(StackRef::new(project, &self.stack))
    }

    pub fn logging(&self) -> crate::logging::Options {
        crate::logging::Options {
            verbose: self.verbose,
            color: self.use_color(),
        }
    }
}
