use anyhow::{bail, Context, Result};
use clap::Subcommand;
use converge_core::{
    snapshot::Snapshot,
    urn::{StackRef, Urn},
};
use converge_engine::backend::SnapshotBackend;

use crate::{
    application::{backend, runtime},
    options::Options,
    program::Program,
};

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum StateCommand {
    /// List the resources recorded for the stack
    List {
        /// Print the resources as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget a resource without deleting it
    Delete {
        urn: Urn,
        /// Also forget protected resources
        #[arg(long)]
        force: bool,
    },

    /// Allow a protected resource to be replaced or deleted
    Unprotect { urn: Urn },
}

pub(crate) fn run(options: &Options, command: &StateCommand) -> Result<()> {
    let _logger = crate::logging::set_up(options.logging())?;
    let program = Program::load_if_exists(&options.file)?;
    let stack = options.stack_ref(program.project.as_deref())?;
    let backend = backend(options);
    runtime()?.block_on(async {
        match command {
            StateCommand::List { json } => {
                let snapshot = load(backend.as_ref(), &stack).await?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&snapshot.resources)?);
                } else {
                    print!("{}", list(&snapshot));
                }
                Ok(())
            }
            StateCommand::Delete { urn, force } => {
                let mut snapshot = load(backend.as_ref(), &stack).await?;
                delete(&mut snapshot, urn, *force)?;
                backend.save(&stack, &snapshot).await
            }
            StateCommand::Unprotect { urn } => {
                let mut snapshot = load(backend.as_ref(), &stack).await?;
                unprotect(&mut snapshot, urn)?;
                backend.save(&stack, &snapshot).await
            }
        }
    })
}

async fn load(backend: &dyn SnapshotBackend, stack: &StackRef) -> Result<Snapshot> {
    let snapshot = backend
        .load(stack)
        .await?
        .with_context(|| format!("Stack {} has not been deployed", stack))?;
    snapshot.verify()?;
    Ok(snapshot)
}

fn list(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for resource in &snapshot.resources {
        let mut flags = Vec::new();
        if resource.protect {
            flags.push("protected");
        }
        if resource.external {
            flags.push("external");
        }
        if resource.delete {
            flags.push("pending delete");
        }
        if resource.pending_replacement {
            flags.push("pending replacement");
        }
        out.push_str(&format!(
            "{}  {}",
            resource.urn,
            resource.id.as_deref().unwrap_or("-")
        ));
        if !flags.is_empty() {
            out.push_str(&format!("  ({})", flags.join(", ")));
        }
        out.push('\n');
    }
    for operation in &snapshot.pending_operations {
        out.push_str(&format!(
            "{}  interrupted while {:?}\n",
            operation.urn, operation.kind
        ));
    }
    out
}

fn delete(snapshot: &mut Snapshot, urn: &Urn, force: bool) -> Result<()> {
    let state = snapshot
        .find(urn)
        .with_context(|| format!("No resource {} in the state", urn))?;
    if state.protect && !force {
        bail!("Resource {} is protected; pass --force to forget it anyway", urn);
    }
    let dependents: Vec<&Urn> = snapshot
        .resources
        .iter()
        .filter(|r| &r.urn != urn && r.referenced_urns().contains(urn))
        .map(|r| &r.urn)
        .collect();
    if !dependents.is_empty() {
        bail!(
            "Resource {} can not be forgotten while these depend on it: {}",
            urn,
            dependents
                .iter()
                .map(|u| u.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    snapshot.remove(urn, false);
    snapshot.verify()?;
    Ok(())
}

fn unprotect(snapshot: &mut Snapshot, urn: &Urn) -> Result<()> {
    let state = snapshot
        .find_mut(urn)
        .with_context(|| format!("No resource {} in the state", urn))?;
    state.protect = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use converge_core::{
        resource::{ResourceRegistration, ResourceState},
        snapshot::Manifest,
    };
    use converge_engine::backend::FileBackend;

    use super::*;

    fn stack() -> StackRef {
        StackRef::new("app", "dev")
    }

    fn state(name: &str, dependencies: &[&ResourceState]) -> ResourceState {
        let mut registration = ResourceRegistration::new("file", name);
        registration.dependencies = dependencies.iter().map(|d| d.urn.clone()).collect();
        let mut state = ResourceState::from_registration(registration.urn(&stack()), &registration);
        state.id = Some(format!("{}-0", name));
        state
    }

    fn snapshot() -> Snapshot {
        let a = state("a", &[]);
        let b = state("b", &[&a]);
        let mut c = state("c", &[]);
        c.protect = true;
        let mut snapshot = Snapshot::new(Manifest::now("test"));
        snapshot.resources = vec![a, b, c];
        snapshot
    }

    fn urn(name: &str) -> Urn {
        Urn::new(&stack(), None, "file", name)
    }

    #[test]
    fn forgets_leaf_resources() {
        let mut snapshot = snapshot();
        delete(&mut snapshot, &urn("b"), false).unwrap();
        delete(&mut snapshot, &urn("a"), false).unwrap();
        assert_eq!(snapshot.resources.len(), 1);
    }

    #[test]
    fn keeps_resources_with_dependents() {
        let mut snapshot = snapshot();
        let e = delete(&mut snapshot, &urn("a"), false).unwrap_err();
        assert!(e.to_string().contains("::b"), "{}", e);
        assert_eq!(snapshot.resources.len(), 3);
        assert!(delete(&mut snapshot, &urn("z"), false).is_err());
    }

    #[test]
    fn protected_needs_force_or_unprotect() {
        let mut snapshot = snapshot();
        assert!(delete(&mut snapshot, &urn("c"), false).is_err());

        let mut forced = snapshot.clone();
        delete(&mut forced, &urn("c"), true).unwrap();
        assert!(forced.find(&urn("c")).is_none());

        unprotect(&mut snapshot, &urn("c")).unwrap();
        delete(&mut snapshot, &urn("c"), false).unwrap();
    }

    #[test]
    fn listing() {
        let text = list(&snapshot());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("::file::a  a-0"));
        assert!(lines[2].ends_with("c-0  (protected)"));
    }

    #[tokio::test]
    async fn load_needs_a_deployed_stack() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(load(&backend, &stack()).await.is_err());

        backend.save(&stack(), &snapshot()).await.unwrap();
        assert_eq!(load(&backend, &stack()).await.unwrap().resources.len(), 3);
    }
}
