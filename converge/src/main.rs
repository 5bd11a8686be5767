mod application;
mod deploy;
mod interrupt;
mod logging;
mod options;
mod program;
mod provider;
mod state;

use anyhow::Result;
use application::handle_result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Up(subargs) => deploy::up(&args.options, subargs),
        Commands::Preview(subargs) => deploy::preview(&args.options, subargs),
        Commands::Refresh(subargs) => deploy::refresh(&args.options, subargs),
        Commands::Destroy(subargs) => deploy::destroy(&args.options, subargs),
        Commands::Import(subargs) => deploy::import(&args.options, subargs),
        Commands::State(sub) => state::run(&args.options, sub),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "converge", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// converge: bring infrastructure in line with a declared set of resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, update and delete resources so that they match the program
    #[command()]
    Up(deploy::UpArgs),

    /// Show what `up` would do, without changing anything
    #[command()]
    Preview(deploy::PreviewArgs),

    /// Update the state with what the providers report about each resource
    #[command()]
    Refresh(deploy::ModeArgs),

    /// Delete every resource of the stack
    #[command()]
    Destroy(deploy::ModeArgs),

    /// Adopt existing resources that the program declares with an `importId`
    #[command()]
    Import(deploy::ModeArgs),

    /// Inspect and edit the recorded state of the stack
    #[command(subcommand)]
    State(state::StateCommand),

    /// Generate markdown documentation for converge
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for converge
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for converge
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
