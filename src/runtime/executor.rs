//! The runtime executor: turns a plan plus context into a rendered node tree.
//!
//! Orchestration per call: validate → throttle → resolve capabilities →
//! resolve state and apply transitions → autopin → preflight → run author
//! source through the sandbox dispatcher, or walk the declared tree resolving
//! component nodes → persist state. Every violation along the way becomes a
//! diagnostic; the result always carries a usable root, falling back to the
//! plan's declared tree when execution fails. Only caller aborts rethrow.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::autopin::{autopin, AutopinOptions};
use super::interpolate::{interpolate_props, interpolate_text, InterpolationScope};
use super::loader::{materialize, LoaderOptions, ModuleContentType, ModuleLoader};
use super::preflight::{collect_probes, run_preflight};
use super::resolver::{ModuleResolver, NetworkPolicy};
use super::sandbox::{
    dispatch, DispatchError, DispatchOptions, HostCapabilities, SandboxEnvelope, SandboxKind,
};
use super::state::{apply_transition, deep_merge, StateStore};
use super::transpiler::SourceTranspiler;
use crate::error::{RenderifyError, Result};
use crate::http::SharedTransport;
use crate::plan::diagnostics as codes;
use crate::plan::{
    AppliedAction, Capabilities, Diagnostic, ExecutionContext, ExecutionResult, ManifestEntry,
    Node, PlanEvent, RuntimePlan, SPEC_VERSION_V1,
};
use crate::scope::{AbortCause, TimeoutScope};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub enforce_module_manifest: bool,
    pub network_policy: NetworkPolicy,
    pub cdn_base_url: String,
    pub fallback_cdn_urls: Vec<String>,
    pub hedge_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    pub module_cache_capacity: usize,
    pub transpile_cache_capacity: usize,
    /// Run the autopin pass before execution.
    pub autopin: bool,
    pub max_concurrent_resolutions: usize,
    pub max_failed_resolutions: u32,
    /// Run the dependency preflight before rendering.
    pub preflight: bool,
    pub fail_on_dependency_preflight_error: bool,
    pub default_sandbox: SandboxKind,
    pub browser_source_sandbox_fail_closed: bool,
    pub accepted_spec_versions: Vec<String>,
    pub default_max_execution_ms: u64,
    pub default_max_imports: u32,
    pub default_max_component_invocations: u32,
    pub max_executions_per_minute: Option<u32>,
    pub max_concurrent_executions: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            enforce_module_manifest: true,
            network_policy: NetworkPolicy::default(),
            cdn_base_url: "https://ga.jspm.io".to_string(),
            fallback_cdn_urls: Vec::new(),
            hedge_delay_ms: 200,
            fetch_timeout_ms: 10_000,
            fetch_retries: 2,
            module_cache_capacity: 64,
            transpile_cache_capacity: super::transpiler::DEFAULT_CACHE_CAPACITY,
            autopin: true,
            max_concurrent_resolutions: 4,
            max_failed_resolutions: 3,
            preflight: true,
            fail_on_dependency_preflight_error: false,
            default_sandbox: SandboxKind::None,
            browser_source_sandbox_fail_closed: false,
            accepted_spec_versions: vec![SPEC_VERSION_V1.to_string()],
            default_max_execution_ms: 10_000,
            default_max_imports: 32,
            default_max_component_invocations: 64,
            max_executions_per_minute: None,
            max_concurrent_executions: None,
        }
    }
}

/// One `execute` call.
#[derive(Default)]
pub struct ExecuteRequest<'a> {
    pub plan: Option<&'a RuntimePlan>,
    pub context: Option<&'a ExecutionContext>,
    pub event: Option<&'a PlanEvent>,
    pub state_override: Option<Value>,
    pub signal: Option<CancellationToken>,
}

impl<'a> ExecuteRequest<'a> {
    pub fn for_plan(plan: &'a RuntimePlan) -> Self {
        Self {
            plan: Some(plan),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: &'a ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_event(mut self, event: &'a PlanEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_state_override(mut self, state: Value) -> Self {
        self.state_override = Some(state);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Capability limits after merging plan capabilities with executor defaults.
#[derive(Debug, Clone)]
struct ResolvedCapabilities {
    max_execution_ms: u64,
    max_imports: u32,
    max_component_invocations: u32,
    allowed_modules: Option<Vec<String>>,
}

/// The capability-gated plan executor.
pub struct RuntimeExecutor {
    options: RuntimeOptions,
    transport: SharedTransport,
    hosts: HostCapabilities,
    loader: ModuleLoader,
    transpiler: SourceTranspiler,
    state: StateStore,
    window: Mutex<VecDeque<Instant>>,
    concurrency: Option<Arc<Semaphore>>,
    execution_counter: AtomicU64,
    initialized: std::sync::atomic::AtomicBool,
}

impl RuntimeExecutor {
    pub fn new(
        transport: SharedTransport,
        hosts: HostCapabilities,
        options: RuntimeOptions,
    ) -> Self {
        let loader = ModuleLoader::new(
            transport.clone(),
            LoaderOptions {
                policy: options.network_policy.clone(),
                fallback_cdn_urls: options.fallback_cdn_urls.clone(),
                hedge_delay_ms: options.hedge_delay_ms,
                fetch_timeout_ms: options.fetch_timeout_ms,
                fetch_retries: options.fetch_retries,
                cache_capacity: options.module_cache_capacity,
            },
        );
        let transpiler = SourceTranspiler::new(options.transpile_cache_capacity);
        let concurrency = options
            .max_concurrent_executions
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            options,
            transport,
            hosts,
            loader,
            transpiler,
            state: StateStore::new(),
            window: Mutex::new(VecDeque::new()),
            concurrency,
            execution_counter: AtomicU64::new(0),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Plan-state accessors (last-write-wins per plan id).
    pub fn get_plan_state(&self, plan_id: &str) -> Option<Value> {
        self.state.get_plan_state(plan_id)
    }

    pub fn set_plan_state(&self, plan_id: &str, state: Value) {
        self.state.set_plan_state(plan_id, state);
    }

    pub fn clear_plan_state(&self, plan_id: &str) {
        self.state.clear_plan_state(plan_id);
    }

    /// Lifecycle start. Idempotent; a second call is a no-op.
    pub fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::Relaxed) {
            debug!("runtime executor initialized");
        }
    }

    /// Lifecycle teardown: drain caches and reset counters. Plan state is
    /// kept; clear it per plan.
    pub fn terminate(&self) {
        self.loader.terminate();
        self.window.lock().clear();
        self.execution_counter.store(0, Ordering::Relaxed);
        self.initialized.store(false, Ordering::Relaxed);
    }

    fn resolver(&self) -> ModuleResolver {
        ModuleResolver::new(
            self.options.cdn_base_url.clone(),
            self.options.enforce_module_manifest,
        )
    }

    /// Run the autopin pass and return the plan's effective manifest.
    /// Existing entries always win; the pass only adds missing pins.
    pub async fn autopin_manifest(
        &self,
        plan: &RuntimePlan,
    ) -> (BTreeMap<String, ManifestEntry>, Vec<Diagnostic>) {
        let mut manifest = plan.module_manifest.clone().unwrap_or_default();
        if !self.options.autopin {
            return (manifest, Vec::new());
        }
        let specifiers: Vec<String> = collect_probes(plan)
            .into_iter()
            .map(|p| p.specifier)
            .collect();
        let outcome = autopin(
            &self.transport,
            &AutopinOptions {
                cdn_base_url: self.options.cdn_base_url.clone(),
                max_concurrent_resolutions: self.options.max_concurrent_resolutions,
                max_failed_resolutions: self.options.max_failed_resolutions,
                probe_timeout_ms: self.options.fetch_timeout_ms,
            },
            &specifiers,
            Some(&manifest),
        )
        .await;
        for (specifier, entry) in outcome.entries {
            manifest.entry(specifier).or_insert(entry);
        }
        (manifest, outcome.diagnostics)
    }

    /// Execute a plan. The plan is never mutated.
    pub async fn execute(&self, request: ExecuteRequest<'_>) -> Result<ExecutionResult> {
        let plan = request
            .plan
            .ok_or_else(|| RenderifyError::InvalidConfig("execute requires a plan".into()))?;

        if request
            .signal
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(RenderifyError::Aborted {
                message: "plan execution aborted by caller".into(),
            });
        }

        self.admit_rate()?;
        let _permit = match &self.concurrency {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| RenderifyError::Other("executor is shut down".into()))?,
            ),
            None => None,
        };

        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        if !self
            .options
            .accepted_spec_versions
            .iter()
            .any(|v| v == &plan.spec_version)
        {
            warn!(spec_version = %plan.spec_version, "rejected plan spec version");
            diagnostics.push(Diagnostic::error(
                codes::RUNTIME_MANIFEST_INVALID,
                format!(
                    "unsupported plan spec version \"{}\"",
                    plan.spec_version
                ),
            ));
            return Ok(fallback_result(plan, diagnostics, None, None));
        }

        let caps = self.resolve_capabilities(&plan.capabilities);
        let deadline = Instant::now() + Duration::from_millis(caps.max_execution_ms);
        let scope = TimeoutScope::new(
            "plan execution",
            Duration::from_millis(caps.max_execution_ms),
            request.signal.clone(),
        );

        let default_context = ExecutionContext::default();
        let context = request.context.unwrap_or(&default_context);

        // State: override, then persisted (with the declared initial as
        // defaults underneath), then initial, then empty.
        let initial = plan
            .state
            .as_ref()
            .map(|s| s.initial.clone())
            .unwrap_or(Value::Null);
        let mut snapshot = match request.state_override {
            Some(state) => state,
            None => match self.state.get_plan_state(&plan.id) {
                Some(persisted) if !initial.is_null() => deep_merge(&initial, &persisted),
                Some(persisted) => persisted,
                None if !initial.is_null() => initial.clone(),
                None => json!({}),
            },
        };

        // Transitions.
        let mut applied_actions: Option<Vec<AppliedAction>> = None;
        if let (Some(event), Some(plan_state)) = (request.event, plan.state.as_ref()) {
            if let Some(actions) = plan_state.transitions.get(&event.event_type) {
                let (next, applied) = apply_transition(&snapshot, actions, event, context);
                snapshot = next;
                applied_actions = Some(applied);
            }
        }

        // Autopin, then preflight over the effective manifest.
        let (manifest, autopin_diagnostics) = self.autopin_manifest(plan).await;
        diagnostics.extend(autopin_diagnostics);

        let resolver = self.resolver();
        if self.options.preflight {
            let probes = collect_probes(plan);
            let report = run_preflight(
                &probes,
                &resolver,
                Some(&manifest),
                Some(&self.loader),
                || scope.is_aborted(),
                || Instant::now() >= deadline,
            )
            .await;
            let preflight_ok = report.all_ok();
            diagnostics.extend(report.diagnostics);
            if !report.completed {
                if scope.cause() == Some(AbortCause::Caller) {
                    return Err(scope.abort_error());
                }
                self.persist(plan, &snapshot);
                return Ok(fallback_result(
                    plan,
                    diagnostics,
                    Some(snapshot),
                    applied_actions,
                ));
            }
            if !preflight_ok && self.options.fail_on_dependency_preflight_error {
                info!(plan = %plan.id, "preflight failed, short-circuiting execution");
                self.persist(plan, &snapshot);
                return Ok(fallback_result(
                    plan,
                    diagnostics,
                    Some(snapshot),
                    applied_actions,
                ));
            }
        }

        // Render: author source through the sandbox, or walk the tree.
        let root = if let Some(source) = &plan.source {
            match self
                .run_source(
                    plan,
                    source,
                    &snapshot,
                    context,
                    request.event,
                    &scope,
                    &mut diagnostics,
                )
                .await
            {
                Ok(node) => node,
                Err(e) => return Err(e),
            }
        } else {
            let mut pass = RenderPass {
                executor: self,
                resolver: &resolver,
                manifest: &manifest,
                scope: &scope,
                deadline,
                caps: &caps,
                snapshot: &snapshot,
                context,
                event: request.event,
                diagnostics: &mut diagnostics,
                imports_used: 0,
                invocations: 0,
                import_limit_reported: false,
            };
            match pass.render(&plan.root).await {
                Ok(Some(node)) => node,
                Ok(None) => {
                    diagnostics.push(Diagnostic::warning(
                        codes::RUNTIME_NODE_INVALID,
                        "root node was omitted during rendering, keeping the declared root",
                    ));
                    plan.root.clone()
                }
                Err(e) if e.is_cancellation() => {
                    if scope.cause() == Some(AbortCause::Caller) {
                        return Err(scope.abort_error());
                    }
                    diagnostics.push(Diagnostic::error(
                        codes::RUNTIME_TIMEOUT,
                        "execution budget exhausted while rendering",
                    ));
                    plan.root.clone()
                }
                Err(e) => return Err(e),
            }
        };

        scope.release();
        self.persist(plan, &snapshot);
        debug!(plan = %plan.id, diagnostics = diagnostics.len(), "execution complete");
        Ok(ExecutionResult {
            plan_id: plan.id.clone(),
            root,
            diagnostics,
            state: Some(snapshot),
            applied_actions,
            render_artifact: None,
        })
    }

    /// Sliding-window execution throttle.
    fn admit_rate(&self) -> Result<()> {
        let Some(limit) = self.options.max_executions_per_minute else {
            return Ok(());
        };
        let now = Instant::now();
        let mut window = self.window.lock();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
        {
            window.pop_front();
        }
        if window.len() as u32 >= limit {
            return Err(RenderifyError::Other(
                "execution rate limit exceeded".into(),
            ));
        }
        window.push_back(now);
        Ok(())
    }

    fn resolve_capabilities(&self, caps: &Capabilities) -> ResolvedCapabilities {
        ResolvedCapabilities {
            max_execution_ms: caps
                .max_execution_ms
                .unwrap_or(self.options.default_max_execution_ms)
                .max(1),
            max_imports: caps.max_imports.unwrap_or(self.options.default_max_imports),
            max_component_invocations: caps
                .max_component_invocations
                .unwrap_or(self.options.default_max_component_invocations),
            allowed_modules: caps.allowed_modules.clone(),
        }
    }

    fn persist(&self, plan: &RuntimePlan, snapshot: &Value) {
        if plan.state.is_some() || self.state.get_plan_state(&plan.id).is_some() {
            self.state.set_plan_state(&plan.id, snapshot.clone());
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_source(
        &self,
        plan: &RuntimePlan,
        source: &crate::plan::SourceModule,
        snapshot: &Value,
        context: &ExecutionContext,
        event: Option<&PlanEvent>,
        scope: &TimeoutScope,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Node> {
        let transpiled = match self.transpiler.transpile(source) {
            Ok(code) => code,
            Err(e) => {
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_EXEC_FAILED,
                    format!("transpile failed: {e}"),
                ));
                return Ok(plan.root.clone());
            }
        };
        let module_url = materialize(ModuleContentType::JavaScript, &transpiled);

        let envelope = SandboxEnvelope {
            id: format!(
                "exec-{}",
                self.execution_counter.fetch_add(1, Ordering::Relaxed) + 1
            ),
            module_url,
            export_name: String::new(),
            runtime_input: json!({
                "state": snapshot,
                "context": context,
                "event": event,
            }),
        };
        let dispatch_options = DispatchOptions {
            default_kind: self.options.default_sandbox,
            fail_closed: self.options.browser_source_sandbox_fail_closed,
        };

        let outcome = dispatch(
            &self.hosts,
            &dispatch_options,
            plan.capabilities.execution_profile,
            source.runtime,
            &envelope,
            scope.token(),
        )
        .await;

        match outcome {
            Ok(execution) => {
                if execution.kind != SandboxKind::None {
                    diagnostics.push(Diagnostic::warning(
                        codes::RUNTIME_SOURCE_SANDBOX_EXECUTED,
                        format!("source executed in {} sandbox", execution.kind.as_str()),
                    ));
                }
                if execution.export_fallback {
                    diagnostics.push(Diagnostic::warning(
                        codes::RUNTIME_SOURCE_EXPORT_FALLBACK_DEFAULT,
                        "named export missing, invoked the default export",
                    ));
                }
                match serde_json::from_value::<Node>(execution.output) {
                    Ok(node) => Ok(self.interpolate_node(node, snapshot, context, event)),
                    Err(e) => {
                        diagnostics.push(Diagnostic::error(
                            codes::RUNTIME_NODE_INVALID,
                            format!("source output is not a valid node: {e}"),
                        ));
                        Ok(plan.root.clone())
                    }
                }
            }
            Err(DispatchError::PreactSandbox) => Err(RenderifyError::InvalidConfig(
                "preact source cannot run in a sandbox".into(),
            )),
            Err(DispatchError::Aborted(e)) => {
                if scope.cause() == Some(AbortCause::Caller) {
                    Err(scope.abort_error())
                } else {
                    let _ = e;
                    diagnostics.push(Diagnostic::error(
                        codes::RUNTIME_TIMEOUT,
                        "source execution exceeded the execution budget",
                    ));
                    Ok(plan.root.clone())
                }
            }
            Err(DispatchError::NoSurface) => {
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_SANDBOX_FAILED,
                    "no sandbox surface available and direct execution is disabled",
                ));
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_EXEC_FAILED,
                    "author source was not executed",
                ));
                Ok(plan.root.clone())
            }
            Err(DispatchError::NoModuleHost) => {
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_LOADER_MISSING,
                    "no module host configured for direct execution",
                ));
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_EXEC_FAILED,
                    "author source was not executed",
                ));
                Ok(plan.root.clone())
            }
            Err(DispatchError::ExportMissing(name)) => {
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_EXPORT_MISSING,
                    format!("export \"{name}\" not found in source module"),
                ));
                Ok(plan.root.clone())
            }
            Err(DispatchError::Execution(message)) => {
                diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_SOURCE_EXEC_FAILED,
                    message,
                ));
                Ok(plan.root.clone())
            }
        }
    }

    /// Interpolate templates in a node tree without resolving components.
    fn interpolate_node(
        &self,
        node: Node,
        snapshot: &Value,
        context: &ExecutionContext,
        event: Option<&PlanEvent>,
    ) -> Node {
        let scope = InterpolationScope {
            state: snapshot,
            event,
            context,
        };
        interpolate_tree(node, &scope)
    }
}

fn interpolate_tree(node: Node, scope: &InterpolationScope<'_>) -> Node {
    match node {
        Node::Text { value } => Node::Text {
            value: interpolate_text(&value, scope),
        },
        Node::Element {
            tag,
            props,
            children,
        } => Node::Element {
            tag,
            props: props.map(|p| interpolate_props(&p, scope)),
            children: children
                .into_iter()
                .map(|child| interpolate_tree(child, scope))
                .collect(),
        },
        Node::Component {
            module,
            export_name,
            props,
        } => Node::Component {
            module,
            export_name,
            props: props.map(|p| interpolate_props(&p, scope)),
        },
    }
}

fn fallback_result(
    plan: &RuntimePlan,
    diagnostics: Vec<Diagnostic>,
    state: Option<Value>,
    applied_actions: Option<Vec<AppliedAction>>,
) -> ExecutionResult {
    ExecutionResult {
        plan_id: plan.id.clone(),
        root: plan.root.clone(),
        diagnostics,
        state,
        applied_actions,
        render_artifact: None,
    }
}

/// One tree-walking render pass.
struct RenderPass<'a> {
    executor: &'a RuntimeExecutor,
    resolver: &'a ModuleResolver,
    manifest: &'a BTreeMap<String, ManifestEntry>,
    scope: &'a TimeoutScope,
    deadline: Instant,
    caps: &'a ResolvedCapabilities,
    snapshot: &'a Value,
    context: &'a ExecutionContext,
    event: Option<&'a PlanEvent>,
    diagnostics: &'a mut Vec<Diagnostic>,
    imports_used: u32,
    invocations: u32,
    import_limit_reported: bool,
}

impl<'a> RenderPass<'a> {
    fn interpolation(&self) -> InterpolationScope<'_> {
        InterpolationScope {
            state: self.snapshot,
            event: self.event,
            context: self.context,
        }
    }

    fn check_budget(&self) -> Result<()> {
        if self.scope.is_aborted() {
            return Err(self.scope.abort_error());
        }
        if Instant::now() >= self.deadline {
            return Err(RenderifyError::TimedOut {
                message: "render: timed out".into(),
            });
        }
        Ok(())
    }

    fn render<'s>(&'s mut self, node: &'s Node) -> BoxFuture<'s, Result<Option<Node>>> {
        Box::pin(async move {
            self.check_budget()?;
            match node {
                Node::Text { value } => Ok(Some(Node::Text {
                    value: interpolate_text(value, &self.interpolation()),
                })),
                Node::Element {
                    tag,
                    props,
                    children,
                } => {
                    let rendered_props = props
                        .as_ref()
                        .map(|p| interpolate_props(p, &self.interpolation()));
                    let mut rendered_children = Vec::with_capacity(children.len());
                    for child in children {
                        if let Some(rendered) = self.render(child).await? {
                            rendered_children.push(rendered);
                        }
                    }
                    Ok(Some(Node::Element {
                        tag: tag.clone(),
                        props: rendered_props,
                        children: rendered_children,
                    }))
                }
                Node::Component {
                    module,
                    export_name,
                    props,
                } => self.render_component(module, export_name.as_deref(), props).await,
            }
        })
    }

    async fn render_component(
        &mut self,
        module: &str,
        export_name: Option<&str>,
        props: &Option<BTreeMap<String, Value>>,
    ) -> Result<Option<Node>> {
        if let Some(allowed) = &self.caps.allowed_modules {
            if !allowed.iter().any(|m| m == module) {
                self.diagnostics.push(Diagnostic::warning(
                    codes::RUNTIME_COMPONENT_SKIPPED,
                    format!("module \"{module}\" is not in the plan's allowed modules"),
                ));
                return Ok(None);
            }
        }

        if self.invocations >= self.caps.max_component_invocations {
            self.diagnostics.push(Diagnostic::warning(
                codes::RUNTIME_COMPONENT_SKIPPED,
                format!(
                    "component invocation limit ({}) reached, skipping \"{module}\"",
                    self.caps.max_component_invocations
                ),
            ));
            return Ok(None);
        }
        self.invocations += 1;

        let resolution = match self.resolver.resolve(module, Some(self.manifest)) {
            Ok(resolution) => resolution,
            Err(e) => {
                let code = if matches!(
                    super::resolver::classify(module),
                    Ok(super::resolver::SpecifierKind::Bare { .. })
                ) && !self.manifest.contains_key(module)
                {
                    codes::RUNTIME_MANIFEST_MISSING
                } else {
                    codes::RUNTIME_COMPONENT_SKIPPED
                };
                self.diagnostics
                    .push(Diagnostic::error(code, e.to_string()));
                return Ok(None);
            }
        };

        // Cache misses count toward the import budget.
        if self.executor.loader.cached(&resolution.url).is_none() {
            if self.imports_used >= self.caps.max_imports {
                if !self.import_limit_reported {
                    self.import_limit_reported = true;
                    self.diagnostics.push(Diagnostic::warning(
                        codes::RUNTIME_IMPORT_LIMIT_EXCEEDED,
                        format!("import limit ({}) reached", self.caps.max_imports),
                    ));
                }
                return Ok(None);
            }
            self.imports_used += 1;
        }

        let record = match self.executor.loader.load(&resolution).await {
            Ok(record) => record,
            Err(e) => {
                let code = match &e {
                    RenderifyError::IntegrityMismatch { .. } => codes::RUNTIME_INTEGRITY_MISMATCH,
                    RenderifyError::IntegrityCheckFailed { .. } => {
                        codes::RUNTIME_INTEGRITY_CHECK_FAILED
                    }
                    RenderifyError::Other(message)
                        if message.contains("network policy") =>
                    {
                        codes::RUNTIME_NETWORK_POLICY_BLOCKED
                    }
                    _ => codes::RUNTIME_COMPONENT_EXEC_FAILED,
                };
                self.diagnostics.push(Diagnostic::error(code, e.to_string()));
                return Ok(None);
            }
        };
        if record.used_fallback {
            self.diagnostics.push(Diagnostic::warning(
                codes::RUNTIME_SOURCE_IMPORT_FALLBACK_USED,
                format!("\"{module}\" was served by a fallback CDN"),
            ));
        }

        let Some(host) = self.executor.hosts.module_host() else {
            self.diagnostics.push(Diagnostic::error(
                codes::RUNTIME_LOADER_MISSING,
                format!("no module host configured to invoke \"{module}\""),
            ));
            return Ok(None);
        };

        let wanted = export_name.unwrap_or("default").to_string();
        let exports = match host.exports(&record.import_url).await {
            Ok(exports) => exports,
            Err(e) => {
                self.diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_COMPONENT_EXEC_FAILED,
                    format!("\"{module}\": {e}"),
                ));
                return Ok(None);
            }
        };
        let export = if exports.iter().any(|e| e == &wanted) {
            wanted
        } else if wanted != "default" && exports.iter().any(|e| e == "default") {
            self.diagnostics.push(Diagnostic::warning(
                codes::RUNTIME_SOURCE_EXPORT_FALLBACK_DEFAULT,
                format!("export \"{wanted}\" missing in \"{module}\", using default"),
            ));
            "default".to_string()
        } else {
            self.diagnostics.push(Diagnostic::error(
                codes::RUNTIME_SOURCE_EXPORT_MISSING,
                format!("export \"{wanted}\" not found in \"{module}\""),
            ));
            return Ok(None);
        };

        let rendered_props = props
            .as_ref()
            .map(|p| interpolate_props(p, &self.interpolation()))
            .unwrap_or_default();
        let input = json!({
            "props": rendered_props,
            "state": self.snapshot,
            "context": self.context,
            "event": self.event,
        });

        let invoke = host.invoke(&record.import_url, &export, &input);
        let output = tokio::select! {
            biased;
            _ = self.scope.token().cancelled() => return Err(self.scope.abort_error()),
            output = invoke => output,
        };
        match output {
            Ok(value) => match serde_json::from_value::<Node>(value) {
                Ok(node) => Ok(Some(interpolate_tree(node, &self.interpolation()))),
                Err(e) => {
                    self.diagnostics.push(Diagnostic::error(
                        codes::RUNTIME_NODE_INVALID,
                        format!("component \"{module}\" returned an invalid node: {e}"),
                    ));
                    Ok(None)
                }
            },
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.diagnostics.push(Diagnostic::error(
                    codes::RUNTIME_COMPONENT_EXEC_FAILED,
                    format!("\"{module}\": {e}"),
                ));
                Ok(None)
            }
        }
    }
}
