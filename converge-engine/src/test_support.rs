//! An in-memory provider that records what the engine asks of it.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use converge_core::{resource::PropertyMap, snapshot::PluginInfo, urn::Urn};
use converge_resource::{
    client::{CallContext, ProviderCallError, ProviderClient},
    schema::v0::{
        CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DiffChanges, DiffRequest,
        DiffResponse, ReadRequest, ReadResource, ReadResponse, UpdateRequest, UpdateResponse,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Method {
    Diff,
    Create,
    Update,
    Delete,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: Method,
    /// Resource name, taken from the URN.
    pub name: String,
    pub id: Option<String>,
}

#[derive(Default)]
struct MockState {
    /// What exists "in the cloud": id to (inputs, outputs).
    cloud: BTreeMap<String, (PropertyMap, PropertyMap)>,
    calls: Vec<Call>,
    failures: BTreeSet<(Method, String)>,
    hangs: BTreeSet<(Method, String)>,
    replace_keys: BTreeSet<String>,
    delays: BTreeMap<String, Duration>,
    delete_before_replace: bool,
    /// Creations per resource name.
    created: BTreeMap<String, usize>,
}

pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
    delay: Option<Duration>,
    default_timeout: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);
impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        MockProvider {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            delay: None,
            default_timeout: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every mutating call takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, method: Method, name: &str) {
        self.lock().failures.insert((method, name.to_string()));
    }

    pub fn heal(&self) {
        self.lock().failures.clear();
    }

    /// Mutating calls for `name` take this long.
    pub fn slow(&self, name: &str, delay: Duration) {
        self.lock().delays.insert(name.to_string(), delay);
    }

    /// Calls of `method` for `name` never return.
    pub fn hang(&self, method: Method, name: &str) {
        self.lock().hangs.insert((method, name.to_string()));
    }

    /// Changes to `key` require replacement.
    pub fn replace_on(&self, key: &str) {
        self.lock().replace_keys.insert(key.to_string());
    }

    pub fn ask_delete_before_replace(&self) {
        self.lock().delete_before_replace = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Names of the resources `method` was called for, in call order.
    pub fn calls_of(&self, method: Method) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .map(|c| c.name)
            .collect()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.method, Method::Create | Method::Update | Method::Delete))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn cloud(&self) -> BTreeMap<String, (PropertyMap, PropertyMap)> {
        self.lock().cloud.clone()
    }

    /// Make a resource exist without the engine having created it.
    pub fn insert_cloud(&self, id: &str, inputs: PropertyMap, outputs: PropertyMap) {
        self.lock().cloud.insert(id.to_string(), (inputs, outputs));
    }

    pub fn remove_cloud(&self, id: &str) {
        self.lock().cloud.remove(id);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(
        &self,
        method: Method,
        urn: &Urn,
        id: Option<&str>,
    ) -> Result<(), ProviderCallError> {
        let name = urn.name().to_string();
        let (fails, hangs, delay) = {
            let mut state = self.lock();
            state.calls.push(Call {
                method,
                name: name.clone(),
                id: id.map(|s| s.to_string()),
            });
            let delay = state.delays.get(&name).copied().or(self.delay);
            let key = (method, name);
            (state.failures.contains(&key), state.hangs.contains(&key), delay)
        };
        let failure = || {
            ProviderCallError::Failed(format!("{:?} of {} failed", method, urn.name()))
        };
        if method == Method::Diff {
            return if fails { Err(failure()) } else { Ok(()) };
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hangs {
            std::future::pending::<()>().await;
        }
        if fails {
            return Err(failure());
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn diff(
        &self,
        _context: &CallContext,
        request: DiffRequest,
    ) -> Result<DiffResponse, ProviderCallError> {
        self.enter(Method::Diff, &request.urn, Some(&request.id))
            .await?;
        if request.old_inputs == request.new_inputs {
            return Ok(DiffResponse::no_changes());
        }
        let keys: BTreeSet<&String> = request
            .old_inputs
            .keys()
            .chain(request.new_inputs.keys())
            .collect();
        let changed_keys: Vec<String> = keys
            .into_iter()
            .filter(|k| request.old_inputs.get(*k) != request.new_inputs.get(*k))
            .cloned()
            .collect();
        let state = self.lock();
        let replace_keys = changed_keys
            .iter()
            .filter(|k| state.replace_keys.contains(*k))
            .cloned()
            .collect::<Vec<_>>();
        Ok(DiffResponse {
            changes: DiffChanges::Some,
            delete_before_replace: !replace_keys.is_empty() && state.delete_before_replace,
            replace_keys,
            changed_keys,
            ..Default::default()
        })
    }

    async fn create(
        &self,
        _context: &CallContext,
        request: CreateRequest,
    ) -> Result<CreateResponse, ProviderCallError> {
        self.enter(Method::Create, &request.urn, None).await?;
        let mut state = self.lock();
        // Numbered per resource, so that IDs do not depend on scheduling
        let name = request.urn.name().to_string();
        let n = state.created.entry(name.clone()).or_insert(0);
        let id = format!("{}-{}", name, n);
        *n += 1;
        let mut outputs = request.inputs.clone();
        outputs.insert("id".to_string(), id.clone().into());
        state
            .cloud
            .insert(id.clone(), (request.inputs, outputs.clone()));
        Ok(CreateResponse { id, outputs })
    }

    async fn update(
        &self,
        _context: &CallContext,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, ProviderCallError> {
        self.enter(Method::Update, &request.urn, Some(&request.id))
            .await?;
        let mut outputs = request.new_inputs.clone();
        outputs.insert("id".to_string(), request.id.clone().into());
        self.lock()
            .cloud
            .insert(request.id, (request.new_inputs, outputs.clone()));
        Ok(UpdateResponse { outputs })
    }

    async fn delete(
        &self,
        _context: &CallContext,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, ProviderCallError> {
        self.enter(Method::Delete, &request.urn, Some(&request.id))
            .await?;
        self.lock().cloud.remove(&request.id);
        Ok(DeleteResponse {})
    }

    async fn read(
        &self,
        _context: &CallContext,
        request: ReadRequest,
    ) -> Result<ReadResponse, ProviderCallError> {
        self.enter(Method::Read, &request.urn, Some(&request.id))
            .await?;
        let resource = self
            .lock()
            .cloud
            .get(&request.id)
            .map(|(inputs, outputs)| ReadResource {
                inputs: inputs.clone(),
                outputs: outputs.clone(),
            });
        Ok(ReadResponse { resource })
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: Some("0.0.1".to_string()),
        }
    }
}
