//! Whole deployments against the mock provider.

use std::{collections::BTreeSet, num::NonZeroUsize, sync::Arc, time::Duration};

use converge_core::{
    resource::{PropertyMap, ResourceRegistration},
    snapshot::{PendingOperationKind, Snapshot},
    step::{OperationMode, StepKind},
    urn::{StackRef, Urn},
};
use converge_resource::client::ProviderCallError;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    backend::MemoryBackend,
    error::{EngineError, GraphError, StepError},
    options::ExecuteOptions,
    provider::ProviderRegistry,
    registration::RegistrationEvent,
    summary::{ResourceChangeSummary, SkipReason, StepStatus},
    test_support::{Method, MockProvider},
    Deployment, Execution,
};

const TYPE: &str = "mock:index:Thing";

fn stack() -> StackRef {
    StackRef::new("app", "dev")
}

fn urn(name: &str) -> Urn {
    Urn::new(&stack(), None, TYPE, name)
}

fn props(v: serde_json::Value) -> PropertyMap {
    match v {
        serde_json::Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

fn thing(name: &str, value: i64) -> ResourceRegistration {
    let mut r = ResourceRegistration::new(TYPE, name);
    r.inputs = props(json!({ "value": value }));
    r
}

fn after(mut r: ResourceRegistration, deps: &[&str]) -> ResourceRegistration {
    r.dependencies = deps.iter().map(|d| urn(d)).collect();
    r
}

fn update() -> ExecuteOptions {
    ExecuteOptions::new(OperationMode::Update)
}

struct Harness {
    provider: Arc<MockProvider>,
    backend: Arc<MemoryBackend>,
    deployment: Deployment,
}

impl Harness {
    fn new() -> Self {
        Self::with(MockProvider::new("mock"), MemoryBackend::new())
    }

    fn with(provider: MockProvider, backend: MemoryBackend) -> Self {
        let provider = Arc::new(provider);
        let backend = Arc::new(backend);
        let deployment = Deployment::new(
            stack(),
            backend.clone(),
            ProviderRegistry::new().with("mock", provider.clone()),
        );
        Harness {
            provider,
            backend,
            deployment,
        }
    }

    async fn run(&self, registrations: &[ResourceRegistration], options: ExecuteOptions) -> Execution {
        self.deployment
            .execute(registrations.to_vec(), &options)
            .await
            .unwrap()
    }

    async fn up(&self, registrations: &[ResourceRegistration]) -> ResourceChangeSummary {
        self.run(registrations, update()).await.summary
    }

    fn snapshot(&self) -> Snapshot {
        self.backend.current().unwrap_or_default()
    }

    /// Names of the live resources, in snapshot order.
    fn live(&self) -> Vec<String> {
        self.snapshot()
            .resources
            .iter()
            .filter(|r| !r.delete)
            .map(|r| r.urn.name().to_string())
            .collect()
    }
}

fn status(summary: &ResourceChangeSummary, name: &str, kind: StepKind) -> StepStatus {
    match summary.get(&urn(name), kind) {
        Some(status) => status.clone(),
        None => panic!("no {} step for {} in\n{}", kind, name, summary),
    }
}

#[tokio::test]
async fn creates_in_dependency_order_and_then_converges() {
    let h = Harness::new();
    let regs = [after(thing("b", 2), &["a"]), thing("a", 1)];

    let summary = h.up(&regs).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(h.provider.calls_of(Method::Create), vec!["a", "b"]);
    assert_eq!(summary.changes().get(&StepKind::Create), Some(&2));
    assert_eq!(h.live(), vec!["a", "b"]);
    let a = h.snapshot().find(&urn("a")).cloned().unwrap();
    assert_eq!(a.id.as_deref(), Some("a-0"));
    assert_eq!(a.outputs.get("id"), Some(&json!("a-0")));
    assert!(h.snapshot().pending_operations.is_empty());

    h.provider.clear_calls();
    let saves = h.backend.history().len();
    let summary = h.up(&regs).await;
    assert!(summary.changes().is_empty(), "{}", summary);
    assert_eq!(status(&summary, "a", StepKind::Same), StepStatus::Succeeded);
    assert!(h.provider.mutating_calls().is_empty());
    assert_eq!(h.backend.history().len(), saves);
}

#[tokio::test]
async fn updates_in_place() {
    let h = Harness::new();
    h.up(&[thing("a", 1)]).await;
    let summary = h.up(&[thing("a", 2)]).await;
    assert_eq!(status(&summary, "a", StepKind::Update), StepStatus::Succeeded);

    let a = h.snapshot().find(&urn("a")).cloned().unwrap();
    assert_eq!(a.id.as_deref(), Some("a-0"));
    assert_eq!(a.inputs, props(json!({"value": 2})));
    assert_eq!(a.outputs.get("value"), Some(&json!(2)));
    assert_eq!(h.provider.cloud()["a-0"].0, props(json!({"value": 2})));
}

#[tokio::test]
async fn replacement_creates_before_deleting() {
    let h = Harness::new();
    h.provider.replace_on("value");
    h.up(&[thing("a", 1), after(thing("b", 1), &["a"])]).await;
    h.provider.clear_calls();

    let summary = h.up(&[thing("a", 2), after(thing("b", 1), &["a"])]).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(status(&summary, "a", StepKind::CreateReplacement), StepStatus::Succeeded);
    assert_eq!(status(&summary, "a", StepKind::DeleteReplaced), StepStatus::Succeeded);

    let calls: Vec<(Method, Option<String>)> = h
        .provider
        .mutating_calls()
        .into_iter()
        .map(|c| (c.method, c.id))
        .collect();
    assert_eq!(
        calls,
        vec![(Method::Create, None), (Method::Delete, Some("a-0".to_string()))]
    );

    // Both copies were recorded while the old one awaited deletion
    assert!(h
        .backend
        .history()
        .iter()
        .any(|s| s.resources.iter().filter(|r| r.urn == urn("a")).count() == 2));
    assert_eq!(h.live(), vec!["a", "b"]);
    assert_eq!(h.snapshot().resources.len(), 2);
    assert_eq!(
        h.snapshot().find(&urn("a")).unwrap().id.as_deref(),
        Some("a-1")
    );
}

#[tokio::test]
async fn delete_before_replace() {
    let h = Harness::new();
    h.provider.replace_on("value");
    h.provider.ask_delete_before_replace();
    h.up(&[thing("a", 1)]).await;
    h.provider.clear_calls();

    let summary = h.up(&[thing("a", 2)]).await;
    assert!(summary.is_success(), "{}", summary);
    let kinds: Vec<StepKind> = summary.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StepKind::DeleteReplaced, StepKind::CreateReplacement]
    );
    let methods: Vec<Method> = h
        .provider
        .mutating_calls()
        .into_iter()
        .map(|c| c.method)
        .collect();
    assert_eq!(methods, vec![Method::Delete, Method::Create]);
    assert!(h
        .backend
        .history()
        .iter()
        .any(|s| s.find(&urn("a")).is_some_and(|a| a.pending_replacement)));
    let a = h.snapshot().find(&urn("a")).cloned().unwrap();
    assert!(!a.pending_replacement);
    assert_eq!(a.id.as_deref(), Some("a-1"));
}

#[tokio::test]
async fn deletes_dependents_first() {
    let h = Harness::new();
    h.up(&[
        thing("a", 1),
        after(thing("b", 1), &["a"]),
        after(thing("c", 1), &["b"]),
    ])
    .await;

    let summary = h.up(&[]).await;
    assert_eq!(summary.changes().get(&StepKind::Delete), Some(&3));
    assert_eq!(h.provider.calls_of(Method::Delete), vec!["c", "b", "a"]);
    assert!(h.snapshot().resources.is_empty());
    assert!(h.provider.cloud().is_empty());
}

#[tokio::test]
async fn failure_skips_dependents_but_not_siblings() {
    let h = Harness::new();
    h.provider.fail(Method::Create, "a");
    let summary = h
        .up(&[thing("a", 1), after(thing("b", 1), &["a"]), thing("c", 1)])
        .await;

    assert!(!summary.is_success());
    assert!(matches!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Failed(StepError::Provider(ProviderCallError::Failed(_)))
    ));
    assert_eq!(
        status(&summary, "b", StepKind::Create),
        StepStatus::Skipped(SkipReason::DependencyFailed(urn("a")))
    );
    assert_eq!(status(&summary, "c", StepKind::Create), StepStatus::Succeeded);
    assert_eq!(h.live(), vec!["c"]);
    assert!(h.snapshot().pending_operations.is_empty());
    assert!(!h.provider.calls_of(Method::Create).contains(&"b".to_string()));

    // The next run picks up where this one failed
    h.provider.heal();
    let summary = h
        .up(&[thing("a", 1), after(thing("b", 1), &["a"]), thing("c", 1)])
        .await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(h.live(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn halt_on_error_stops_new_steps() {
    let regs = [thing("a", 1), thing("x", 1), after(thing("y", 1), &["x"])];

    for halt in [false, true] {
        let h = Harness::new();
        h.provider.fail(Method::Create, "a");
        h.provider.slow("a", Duration::from_millis(30));
        h.provider.slow("x", Duration::from_millis(150));
        let mut options = update();
        options.halt_on_error = halt;
        let summary = h.run(&regs, options).await.summary;

        assert!(status(&summary, "a", StepKind::Create).is_failure());
        // Already running when the failure happened
        assert_eq!(status(&summary, "x", StepKind::Create), StepStatus::Succeeded);
        let expected = if halt {
            StepStatus::Skipped(SkipReason::Halted)
        } else {
            StepStatus::Succeeded
        };
        assert_eq!(status(&summary, "y", StepKind::Create), expected);
    }
}

#[tokio::test]
async fn parallelism_bounds_provider_operations() {
    let regs: Vec<ResourceRegistration> = (0..6).map(|i| thing(&format!("r{i}"), i)).collect();

    let h = Harness::with(
        MockProvider::new("mock").with_delay(Duration::from_millis(20)),
        MemoryBackend::new(),
    );
    let mut options = update();
    options.parallelism = NonZeroUsize::new(2);
    let summary = h.run(&regs, options).await.summary;
    assert!(summary.is_success(), "{}", summary);
    assert!(h.provider.max_in_flight() <= 2);
    assert_eq!(h.live().len(), 6);

    let h = Harness::with(
        MockProvider::new("mock").with_delay(Duration::from_millis(20)),
        MemoryBackend::new(),
    );
    h.up(&regs).await;
    assert!(h.provider.max_in_flight() > 2);
}

#[tokio::test]
async fn serial_and_parallel_runs_agree() {
    fn thing2(name: &str, value: i64, kind: &str) -> ResourceRegistration {
        let mut r = thing(name, value);
        r.inputs.insert("kind".to_string(), json!(kind));
        r
    }
    let first = vec![
        thing2("a", 1, "x"),
        after(thing2("b", 1, "x"), &["a"]),
        after(thing2("c", 1, "x"), &["a"]),
        after(thing2("d", 1, "x"), &["b", "c"]),
        thing2("e", 1, "x"),
    ];
    let second = vec![
        thing2("a", 2, "x"),
        after(thing2("b", 1, "x"), &["a"]),
        thing2("e", 1, "y"),
        after(thing2("f", 1, "x"), &["e"]),
    ];

    let mut results = Vec::new();
    for parallelism in [NonZeroUsize::new(1), None] {
        let h = Harness::with(
            MockProvider::new("mock").with_delay(Duration::from_millis(5)),
            MemoryBackend::new(),
        );
        h.provider.replace_on("kind");
        let mut options = update();
        options.parallelism = parallelism;
        let mut summaries = Vec::new();
        for regs in [&first, &second] {
            let summary = h.run(regs, options.clone()).await.summary;
            assert!(summary.is_success(), "{}", summary);
            summaries.push(summary.steps);
        }
        results.push((h.snapshot().resources, summaries));
    }
    assert_eq!(results[0], results[1]);
    let names: Vec<&str> = results[0].0.iter().map(|r| r.urn.name()).collect();
    assert_eq!(names, vec!["a", "b", "e", "f"]);
}

#[tokio::test]
async fn targets_restrict_changes() {
    let h = Harness::new();
    h.up(&[thing("a", 1), thing("b", 1)]).await;
    h.provider.clear_calls();

    let mut options = update();
    options.targets = Some(BTreeSet::from([urn("a")]));
    let summary = h.run(&[thing("a", 2), thing("b", 2)], options).await.summary;
    assert_eq!(status(&summary, "a", StepKind::Update), StepStatus::Succeeded);
    assert_eq!(
        status(&summary, "b", StepKind::Same),
        StepStatus::Skipped(SkipReason::NotTargeted)
    );
    assert_eq!(h.provider.calls_of(Method::Diff), vec!["a"]);
    let b = h.snapshot().find(&urn("b")).cloned().unwrap();
    assert_eq!(b.inputs, props(json!({"value": 1})));
}

#[tokio::test]
async fn untargeted_creation_leaves_dependents_waiting() {
    let h = Harness::new();
    let mut options = update();
    options.targets = Some(BTreeSet::from([urn("b")]));
    let summary = h
        .run(&[thing("a", 1), after(thing("b", 1), &["a"])], options)
        .await
        .summary;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Skipped(SkipReason::NotTargeted)
    );
    assert_eq!(
        status(&summary, "b", StepKind::Create),
        StepStatus::Skipped(SkipReason::DependencyFailed(urn("a")))
    );
    assert!(h.provider.mutating_calls().is_empty());
}

#[tokio::test]
async fn targeted_delete_keeps_untargeted_dependents_intact() {
    let h = Harness::new();
    h.up(&[thing("a", 1), after(thing("b", 1), &["a"])]).await;

    let mut options = ExecuteOptions::new(OperationMode::Destroy);
    options.targets = Some(BTreeSet::from([urn("a")]));
    let summary = h.run(&[], options.clone()).await.summary;
    assert_eq!(
        status(&summary, "a", StepKind::Delete),
        StepStatus::Failed(StepError::DependentsRemain {
            urn: urn("a"),
            dependents: vec![urn("b")]
        })
    );
    assert_eq!(h.live(), vec!["a", "b"]);

    options.target_dependents = true;
    let summary = h.run(&[], options).await.summary;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(h.provider.calls_of(Method::Delete), vec!["b", "a"]);
    assert!(h.live().is_empty());
}

#[tokio::test]
async fn protected_resources_are_not_deleted_or_replaced() {
    let h = Harness::new();
    h.provider.replace_on("value");
    let mut a = thing("a", 1);
    a.protect = true;
    h.up(&[a.clone()]).await;

    let summary = h.up(&[]).await;
    assert_eq!(
        status(&summary, "a", StepKind::Delete),
        StepStatus::Failed(StepError::Protected {
            urn: urn("a"),
            kind: StepKind::Delete
        })
    );
    assert_eq!(h.live(), vec!["a"]);

    let mut a2 = thing("a", 2);
    a2.protect = true;
    let summary = h.up(&[a2]).await;
    assert!(matches!(
        status(&summary, "a", StepKind::CreateReplacement),
        StepStatus::Failed(StepError::Protected { .. })
    ));
    assert!(h.provider.mutating_calls().len() == 1);

    // Lifting the protection is recorded without touching the resource
    let summary = h.up(&[thing("a", 1)]).await;
    assert_eq!(status(&summary, "a", StepKind::Same), StepStatus::Succeeded);
    assert!(!h.snapshot().find(&urn("a")).unwrap().protect);
    let summary = h.up(&[]).await;
    assert_eq!(status(&summary, "a", StepKind::Delete), StepStatus::Succeeded);
}

#[tokio::test]
async fn dry_run_changes_nothing_and_produces_a_plan() {
    let h = Harness::new();
    h.up(&[thing("a", 1)]).await;
    h.provider.clear_calls();
    let saves = h.backend.history().len();

    let regs = [thing("a", 2), thing("b", 1)];
    let mut options = update();
    options.dry_run = true;
    let execution = h.run(&regs, options).await;
    assert_eq!(status(&execution.summary, "a", StepKind::Update), StepStatus::Planned);
    assert_eq!(status(&execution.summary, "b", StepKind::Create), StepStatus::Planned);
    assert!(h.provider.mutating_calls().is_empty());
    assert_eq!(h.backend.history().len(), saves);

    let plan = execution.plan.unwrap();
    assert_eq!(plan.resources[&urn("a")].op, StepKind::Update);
    assert_eq!(plan.resources[&urn("b")].op, StepKind::Create);

    // Executing within the plan
    let mut options = update();
    options.plan = Some(plan.clone());
    let summary = h.run(&regs, options).await.summary;
    assert!(summary.is_success(), "{}", summary);

    // Deviating from it
    let mut options = update();
    options.plan = Some(plan.clone());
    let summary = h.run(&[thing("a", 3), thing("b", 1)], options.clone()).await.summary;
    assert!(matches!(
        status(&summary, "a", StepKind::Update),
        StepStatus::Failed(StepError::PlanConstraintViolation { .. })
    ));
    assert_eq!(
        h.snapshot().find(&urn("a")).unwrap().inputs,
        props(json!({"value": 2}))
    );

    options.relax_plan_constraints = true;
    let summary = h.run(&[thing("a", 3), thing("b", 1)], options).await.summary;
    assert!(summary.is_success(), "{}", summary);
    // b was planned as a creation and now stays the same
    assert_eq!(summary.warnings.len(), 2);
}

#[tokio::test]
async fn refresh_records_what_the_provider_reports() {
    let h = Harness::new();
    h.up(&[thing("a", 1), thing("b", 1)]).await;
    h.provider.clear_calls();

    h.provider.insert_cloud(
        "a-0",
        props(json!({"value": 1})),
        props(json!({"value": 1, "drifted": true})),
    );
    h.provider.remove_cloud("b-0");
    let summary = h
        .run(&[], ExecuteOptions::new(OperationMode::Refresh))
        .await
        .summary;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(status(&summary, "b", StepKind::Refresh), StepStatus::Succeeded);
    assert!(h.provider.mutating_calls().is_empty());

    assert_eq!(h.live(), vec!["a"]);
    let a = h.snapshot().find(&urn("a")).cloned().unwrap();
    assert_eq!(a.outputs.get("drifted"), Some(&json!(true)));
}

#[tokio::test]
async fn import_adopts_matching_resources() {
    let h = Harness::new();
    h.provider.insert_cloud(
        "existing",
        props(json!({"value": 1, "region": "eu"})),
        props(json!({"value": 1, "arn": "x"})),
    );
    let mut a = thing("a", 1);
    a.import_id = Some("existing".to_string());
    let mut b = thing("b", 2);
    b.import_id = Some("existing".to_string());

    let summary = h
        .run(&[a.clone(), b], ExecuteOptions::new(OperationMode::Import))
        .await
        .summary;
    assert_eq!(status(&summary, "a", StepKind::Import), StepStatus::Succeeded);
    assert_eq!(
        status(&summary, "b", StepKind::Import),
        StepStatus::Failed(StepError::ImportMismatch {
            urn: urn("b"),
            keys: vec!["value".to_string()]
        })
    );
    assert!(h.provider.calls_of(Method::Create).is_empty());
    assert_eq!(h.live(), vec!["a"]);
    let state = h.snapshot().find(&urn("a")).cloned().unwrap();
    assert_eq!(state.id.as_deref(), Some("existing"));
    assert_eq!(state.outputs.get("arn"), Some(&json!("x")));

    // Managed from now on
    let summary = h.up(&[a]).await;
    assert_eq!(status(&summary, "a", StepKind::Same), StepStatus::Succeeded);
}

#[tokio::test]
async fn external_resources_are_read_and_never_deleted() {
    let h = Harness::new();
    h.provider
        .insert_cloud("ext-1", props(json!({"size": 3})), props(json!({"size": 3})));
    let mut e = ResourceRegistration::new(TYPE, "e");
    e.read_id = Some("ext-1".to_string());
    let mut missing = ResourceRegistration::new(TYPE, "missing");
    missing.read_id = Some("nope".to_string());

    let summary = h.up(&[e, missing]).await;
    assert_eq!(status(&summary, "e", StepKind::Read), StepStatus::Succeeded);
    assert_eq!(
        status(&summary, "missing", StepKind::Read),
        StepStatus::Failed(StepError::NotFound(urn("missing")))
    );
    let state = h.snapshot().find(&urn("e")).cloned().unwrap();
    assert!(state.external);
    assert_eq!(state.id.as_deref(), Some("ext-1"));
    assert_eq!(state.outputs, props(json!({"size": 3})));

    let summary = h.up(&[]).await;
    assert_eq!(status(&summary, "e", StepKind::Delete), StepStatus::Succeeded);
    assert!(h.provider.calls_of(Method::Delete).is_empty());
    assert!(h.provider.cloud().contains_key("ext-1"));
    assert!(h.live().is_empty());
}

#[tokio::test]
async fn components_never_reach_the_provider() {
    let h = Harness::new();
    let mut group = ResourceRegistration::new("mock:index:Group", "group");
    group.custom = false;
    let group_urn = group.urn(&stack());
    let mut child = thing("child", 1);
    child.parent = Some(group_urn.clone());
    let child_urn = child.urn(&stack());

    let summary = h.up(&[child, group]).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(h.provider.calls_of(Method::Create), vec!["child"]);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.resources[0].urn, group_urn);
    assert_eq!(snapshot.resources[0].id, None);
    assert_eq!(snapshot.resources[1].urn, child_urn);

    h.up(&[]).await;
    assert_eq!(h.provider.calls_of(Method::Delete), vec!["child"]);
    assert!(h.live().is_empty());
}

#[tokio::test]
async fn retained_resources_are_only_forgotten() {
    let h = Harness::new();
    let mut a = thing("a", 1);
    a.retain_on_delete = true;
    h.up(&[a]).await;

    let summary = h.up(&[]).await;
    assert_eq!(status(&summary, "a", StepKind::Delete), StepStatus::Succeeded);
    assert!(h.provider.calls_of(Method::Delete).is_empty());
    assert!(h.live().is_empty());
    assert!(h.provider.cloud().contains_key("a-0"));
}

#[tokio::test]
async fn invalid_graphs_are_rejected_before_anything_happens() {
    let h = Harness::new();
    let r = h
        .deployment
        .execute(
            vec![after(thing("a", 1), &["b"]), after(thing("b", 1), &["a"])],
            &update(),
        )
        .await;
    assert!(matches!(r, Err(EngineError::Graph(GraphError::Cycle(_)))));

    let r = h
        .deployment
        .execute(vec![after(thing("a", 1), &["ghost"])], &update())
        .await;
    assert!(matches!(
        r,
        Err(EngineError::Graph(GraphError::UnknownDependency { .. }))
    ));

    let r = h
        .deployment
        .execute(vec![thing("a", 1), thing("", 1)], &update())
        .await;
    assert!(matches!(
        r,
        Err(EngineError::Graph(GraphError::InvalidUrn { .. }))
    ));
    assert!(h.backend.current().is_none());
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn failed_cleanup_is_retried_by_the_next_run() {
    let h = Harness::new();
    h.provider.replace_on("value");
    h.up(&[thing("a", 1)]).await;

    h.provider.fail(Method::Delete, "a");
    let summary = h.up(&[thing("a", 2)]).await;
    assert_eq!(status(&summary, "a", StepKind::CreateReplacement), StepStatus::Succeeded);
    assert!(status(&summary, "a", StepKind::DeleteReplaced).is_failure());
    assert_eq!(h.snapshot().resources.len(), 2);
    assert!(h.snapshot().resources[0].delete);

    h.provider.heal();
    h.provider.clear_calls();
    let summary = h.up(&[thing("a", 2)]).await;
    assert_eq!(status(&summary, "a", StepKind::Same), StepStatus::Succeeded);
    assert_eq!(status(&summary, "a", StepKind::DeleteReplaced), StepStatus::Succeeded);
    let deleted: Vec<Option<String>> = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| c.method == Method::Delete)
        .map(|c| c.id)
        .collect();
    assert_eq!(deleted, vec![Some("a-0".to_string())]);
    assert_eq!(h.snapshot().resources.len(), 1);
    assert!(!h.provider.cloud().contains_key("a-0"));
}

#[tokio::test]
async fn lost_snapshot_writes_leave_a_consistent_snapshot() {
    let h = Harness::new();
    let regs = [
        thing("a", 1),
        after(thing("b", 1), &["a"]),
        after(thing("c", 1), &["b"]),
    ];
    // Save the intent and result for a, then the intent for b
    h.backend.fail_after(3);
    let r = h.deployment.execute(regs.to_vec(), &update()).await;
    assert!(matches!(r, Err(EngineError::Persistence(_))));
    assert!(!h.provider.calls_of(Method::Create).contains(&"c".to_string()));

    let history = h.backend.history();
    assert_eq!(history.len(), 3);
    for snapshot in &history {
        snapshot.verify().unwrap();
    }
    let last = h.snapshot();
    assert_eq!(h.live(), vec!["a"]);
    assert_eq!(last.pending_operations.len(), 1);
    assert_eq!(last.pending_operations[0].urn, urn("b"));
    assert_eq!(last.pending_operations[0].kind, PendingOperationKind::Creating);

    h.backend.fail_after(usize::MAX);
    let summary = h.up(&regs).await;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(summary.interrupted_operations.len(), 1);
    assert_eq!(summary.interrupted_operations[0].urn, urn("b"));
    assert_eq!(h.live(), vec!["a", "b", "c"]);
    assert!(h.snapshot().pending_operations.is_empty());
}

#[tokio::test]
async fn interrupted_operations_are_reported_once() {
    let h = Harness::new();
    h.up(&[thing("a", 1)]).await;
    let mut snapshot = h.snapshot();
    snapshot.pending_operations.push(converge_core::snapshot::PendingOperation {
        urn: urn("a"),
        type_: TYPE.to_string(),
        kind: PendingOperationKind::Updating,
        id: Some("a-0".to_string()),
    });
    let h = Harness::with(MockProvider::new("mock"), MemoryBackend::with_snapshot(snapshot));

    let summary = h.up(&[thing("a", 1)]).await;
    assert_eq!(summary.interrupted_operations.len(), 1);
    assert!(h.snapshot().pending_operations.is_empty());
    let summary = h.up(&[thing("a", 1)]).await;
    assert!(summary.interrupted_operations.is_empty());
}

#[tokio::test]
async fn timeouts_fail_the_step() {
    let h = Harness::new();
    h.provider.hang(Method::Create, "a");
    let mut options = update();
    options.default_timeout = Some(Duration::from_millis(50));
    let summary = h
        .run(&[thing("a", 1), after(thing("b", 1), &["a"])], options.clone())
        .await
        .summary;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Failed(StepError::Provider(ProviderCallError::Timeout(
            Duration::from_millis(50)
        )))
    );
    assert_eq!(
        status(&summary, "b", StepKind::Create),
        StepStatus::Skipped(SkipReason::DependencyFailed(urn("a")))
    );
    assert!(h.snapshot().pending_operations.is_empty());

    // The provider's default comes before the engine's
    let h = Harness::with(
        MockProvider::new("mock").with_default_timeout(Duration::from_millis(30)),
        MemoryBackend::new(),
    );
    h.provider.hang(Method::Create, "a");
    let summary = h.run(&[thing("a", 1)], options.clone()).await.summary;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Failed(StepError::Provider(ProviderCallError::Timeout(
            Duration::from_millis(30)
        )))
    );

    // And the resource's own timeout before both
    let mut a = thing("a", 1);
    a.custom_timeouts.create = Some(1);
    let summary = h.run(&[a], options).await.summary;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Failed(StepError::Provider(ProviderCallError::Timeout(
            Duration::from_secs(1)
        )))
    );
}

#[tokio::test]
async fn interrupt_cancels_in_flight_calls() {
    let h = Harness::new();
    h.provider.hang(Method::Create, "a");
    let interrupt = h.deployment.interrupt().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt.set_interrupted();
    });
    let summary = h
        .up(&[thing("a", 1), after(thing("b", 1), &["a"])])
        .await;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Failed(StepError::Provider(ProviderCallError::Cancelled))
    );
    assert!(status(&summary, "b", StepKind::Create) != StepStatus::Succeeded);
    assert!(h.snapshot().pending_operations.is_empty());
}

#[tokio::test]
async fn interrupted_deployment_starts_nothing() {
    let h = Harness::new();
    h.deployment.interrupt().set_interrupted();
    let summary = h.up(&[thing("a", 1)]).await;
    assert_eq!(
        status(&summary, "a", StepKind::Create),
        StepStatus::Skipped(SkipReason::Interrupted)
    );
    assert!(summary.was_interrupted());
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn streamed_registrations() {
    let h = Harness::new();
    let (tx, rx) = mpsc::channel(8);
    tx.send(RegistrationEvent::Register(thing("a", 1))).await.unwrap();
    tx.send(RegistrationEvent::Complete).await.unwrap();
    let execution = h.deployment.execute_stream(rx, &update()).await.unwrap();
    assert!(execution.summary.is_success());
    assert_eq!(h.live(), vec!["a"]);

    // A program that stops early must not cause deletions
    let (tx, rx) = mpsc::channel(8);
    drop(tx);
    let r = h.deployment.execute_stream(rx, &update()).await;
    assert!(matches!(r, Err(EngineError::RegistrationIncomplete)));
    assert_eq!(h.live(), vec!["a"]);
}

#[tokio::test]
async fn failed_replacement_keeps_the_old_resource() {
    let h = Harness::new();
    h.provider.replace_on("value");
    h.up(&[thing("a", 1)]).await;
    h.provider.clear_calls();
    h.provider.fail(Method::Create, "a");

    let summary = h.up(&[thing("a", 2)]).await;
    assert!(status(&summary, "a", StepKind::CreateReplacement).is_failure());
    assert_ne!(
        status(&summary, "a", StepKind::DeleteReplaced),
        StepStatus::Succeeded
    );
    assert!(h.provider.calls_of(Method::Delete).is_empty());

    let snapshot = h.snapshot();
    assert_eq!(snapshot.resources.len(), 1);
    let a = snapshot.find(&urn("a")).cloned().unwrap();
    assert!(!a.delete);
    assert_eq!(a.id.as_deref(), Some("a-0"));
    assert_eq!(a.inputs, props(json!({"value": 1})));
    assert!(h.provider.cloud().contains_key("a-0"));
}

#[tokio::test]
async fn forced_replacement_of_unchanged_resources() {
    let h = Harness::new();
    let regs = [thing("a", 1), after(thing("b", 1), &["a"])];
    h.up(&regs).await;
    h.provider.clear_calls();

    let mut options = update();
    options.replace = BTreeSet::from([urn("a")]);
    let summary = h.run(&regs, options).await.summary;
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(status(&summary, "a", StepKind::CreateReplacement), StepStatus::Succeeded);
    assert_eq!(status(&summary, "a", StepKind::DeleteReplaced), StepStatus::Succeeded);
    assert_eq!(status(&summary, "b", StepKind::Same), StepStatus::Succeeded);
    assert_eq!(h.provider.calls_of(Method::Delete), vec!["a"]);
    assert_eq!(
        h.snapshot().find(&urn("a")).unwrap().id.as_deref(),
        Some("a-1")
    );
    assert!(h.provider.cloud().contains_key("b-0"));
}

#[tokio::test]
async fn expect_no_changes_fails_changing_steps() {
    let h = Harness::new();
    h.up(&[thing("a", 1), thing("b", 1)]).await;
    h.provider.clear_calls();

    let mut options = update();
    options.expect_no_changes = true;
    let summary = h.run(&[thing("a", 1), thing("b", 1)], options.clone()).await.summary;
    assert!(summary.is_success(), "{}", summary);

    let summary = h
        .run(&[thing("a", 2), thing("b", 1), thing("c", 1)], options.clone())
        .await
        .summary;
    assert_eq!(
        status(&summary, "a", StepKind::Update),
        StepStatus::Failed(StepError::UnexpectedChange {
            urn: urn("a"),
            kind: StepKind::Update
        })
    );
    assert!(status(&summary, "c", StepKind::Create).is_failure());
    assert_eq!(status(&summary, "b", StepKind::Same), StepStatus::Succeeded);
    assert!(h.provider.mutating_calls().is_empty());
    assert_eq!(
        h.snapshot().find(&urn("a")).unwrap().inputs,
        props(json!({"value": 1}))
    );

    // Dry runs report the same failures
    options.dry_run = true;
    let summary = h.run(&[thing("a", 2), thing("b", 1)], options).await.summary;
    assert!(status(&summary, "a", StepKind::Update).is_failure());
}
