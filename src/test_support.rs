//! Templates and scripted services shared by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;

use crate::service::{Service, ServiceError, ServiceOutput, StepContext};
use crate::state_machine::Params;

pub(crate) const TEST_TEMPLATES: &str = r#"
    [[template]]
    id = "etl"
    name = "Extract, transform, load"

    [[template.steps]]
    id = "fetch"
    name = "Fetch"
    service = "fetcher"
    timeout_ms = 1000
    max_step_retries = 2
    backoff_ms = 5

    [[template.steps]]
    id = "transform"
    name = "Transform"
    service = "worker"
    timeout_ms = 1000
    inputs = ["fetch"]
    backoff_ms = 5

    [[template.steps]]
    id = "store"
    name = "Store"
    service = "worker"
    timeout_ms = 1000
    inputs = ["transform"]
    backoff_ms = 5

    [[template]]
    id = "slow"
    name = "Never answers in time"

    [[template.steps]]
    id = "wait"
    name = "Wait"
    service = "fetcher"
    timeout_ms = 50
    max_step_retries = 0

    [[template]]
    id = "patient"
    name = "Waits between attempts"

    [[template.steps]]
    id = "poll"
    name = "Poll"
    service = "fetcher"
    timeout_ms = 1000
    max_step_retries = 3
    backoff_ms = 300

    [[template]]
    id = "research"
    name = "Topic research"

    [template.default_config]
    language = "en"
    depth = 1

    [[template.steps]]
    id = "lookup"
    name = "Lookup"
    service = "fetcher"
    timeout_ms = 1000
    requires_external_call = true
    required_params = ["topic"]

    [[template]]
    id = "gated"
    name = "Held until released"

    [[template.steps]]
    id = "hold"
    name = "Hold"
    service = "gate"
    timeout_ms = 5000

    [[template.steps]]
    id = "finish"
    name = "Finish"
    service = "worker"
    timeout_ms = 1000

    [[template]]
    id = "labelled"
    name = "Records its label"

    [[template.steps]]
    id = "record"
    name = "Record"
    service = "recorder"
    timeout_ms = 1000
"#;

pub(crate) fn params(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

/// Fails its first `fail_first` calls, then answers
/// `{"step": <step name>, "call": <call number>}`.
pub(crate) struct ScriptedService {
    fail_first: usize,
    message: String,
    calls: AtomicUsize,
    contexts: Mutex<Vec<StepContext>>,
}

impl ScriptedService {
    fn new(fail_first: usize, message: &str) -> Self {
        Self {
            fail_first,
            message: message.to_string(),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always_ok() -> Self {
        Self::new(0, "")
    }

    pub(crate) fn always_err(message: &str) -> Self {
        Self::new(usize::MAX, message)
    }

    pub(crate) fn failing_then_ok(failures: usize) -> Self {
        Self::new(failures, "transient failure")
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts(&self) -> Vec<StepContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Service for ScriptedService {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.contexts.lock().unwrap().push(ctx.clone());
        if call <= self.fail_first {
            return Err(ServiceError::Failed(self.message.clone()));
        }
        Ok(ServiceOutput::new(json!({"step": step_name, "call": call})).with_cost(0.5))
    }
}

/// Never returns.
pub(crate) struct PendingService;

#[async_trait]
impl Service for PendingService {
    async fn invoke(
        &self,
        _step_name: &str,
        _ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        std::future::pending().await
    }
}

/// Blocks every call until a permit is released with [`GateService::open`].
pub(crate) struct GateService {
    permits: Semaphore,
    entered: watch::Sender<usize>,
}

impl GateService {
    pub(crate) fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            entered: watch::Sender::new(0),
        }
    }

    /// Lets `calls` blocked or future calls through.
    pub(crate) fn open(&self, calls: usize) {
        self.permits.add_permits(calls);
    }

    /// Resolves once `calls` invocations have started.
    pub(crate) async fn wait_entered(&self, calls: usize) {
        let mut rx = self.entered.subscribe();
        rx.wait_for(|entered| *entered >= calls).await.unwrap();
    }
}

#[async_trait]
impl Service for GateService {
    async fn invoke(
        &self,
        step_name: &str,
        _ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        self.entered.send_modify(|entered| *entered += 1);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ServiceError::Failed(e.to_string()))?;
        permit.forget();
        Ok(ServiceOutput::new(json!({"step": step_name})))
    }
}

/// Records the `label` param of every call, in call order.
pub(crate) struct RecordingService {
    labels: Mutex<Vec<String>>,
}

impl RecordingService {
    pub(crate) fn new() -> Self {
        Self {
            labels: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Service for RecordingService {
    async fn invoke(
        &self,
        _step_name: &str,
        ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        let label = ctx
            .params
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.labels.lock().unwrap().push(label.clone());
        Ok(ServiceOutput::new(json!({ "label": label })))
    }
}

/// Panics on every call.
pub(crate) struct PanickingService;

#[async_trait]
impl Service for PanickingService {
    async fn invoke(
        &self,
        step_name: &str,
        _ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        panic!("service for `{step_name}` blew up");
    }
}
