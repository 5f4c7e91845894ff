//! The interpreter: run-to-completion loop and executable content.
//!
//! A machine alternates between macrosteps and waiting for external
//! events. Within a macrostep, eventless transitions are exhausted before
//! each internal event is consumed, and the internal queue drains before
//! the loop returns to the external channel. Every microstep exits, runs
//! transition content, and enters in one atomic sequence, so observers of
//! [`Interpreter::configuration`] only ever see legal configurations.

use crate::config::Configuration;
use crate::error::CoreError;
use crate::event::{Event, EventOrigin, EventSender};
use crate::history::{record_history, HistoryStore};
use crate::sched::SendScheduler;
use crate::select::{
    compute_entry_set, compute_exit_set, select_transitions, EntrySet, Selection,
};
use crate::services::{ChildResolver, ServiceInvoker};
use scir_expr::{remove_key, set_path};
use scir_model::{Action, Chart, ChildMachine, InvokeSpec, SendSpec, StateId, Transition};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Interpreter tuning knobs.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Surface execution errors as a faulted outcome instead of raising
    /// `error.execution` / `error.communication` events.
    pub fail_fast: bool,
    /// Livelock guard: a macrostep exceeding this many microsteps aborts
    /// the run with a structural error.
    pub max_microsteps_per_macrostep: u32,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_microsteps_per_macrostep: 4096,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// A top-level final state was entered.
    Completed,
    /// Fail-fast mode surfaced an execution error.
    Faulted { error: String },
}

/// Terminal snapshot of a run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: RunStatus,
    /// Final data context; `_`-prefixed bookkeeping keys are stripped.
    pub data: Value,
    /// Active state ids at termination, in document order.
    pub configuration: Vec<String>,
}

struct ActionFailure {
    reason: String,
    /// `error.execution` or `error.communication`.
    event: &'static str,
}

impl ActionFailure {
    fn execution(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            event: "error.execution",
        }
    }

    fn communication(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            event: "error.communication",
        }
    }
}

impl From<scir_expr::ExprError> for ActionFailure {
    fn from(err: scir_expr::ExprError) -> Self {
        ActionFailure::execution(err.to_string())
    }
}

/// A running statechart instance.
pub struct Interpreter {
    chart: Arc<Chart>,
    options: InterpreterOptions,
    config: Configuration,
    ctx: Value,
    history: HistoryStore,
    internal: VecDeque<Event>,
    /// Self-sent external events, delivered behind whatever was already
    /// queued on the channel at send time.
    pending_external: VecDeque<Event>,
    external_rx: mpsc::UnboundedReceiver<Event>,
    external_closed: bool,
    /// Delayed deliveries come back through a dedicated channel so that
    /// dropping every [`EventSender`] still lets pending timers fire.
    timer_tx: mpsc::UnboundedSender<Event>,
    timer_rx: mpsc::UnboundedReceiver<Event>,
    invoker: Arc<dyn ServiceInvoker>,
    resolver: Arc<dyn ChildResolver>,
    scheduler: SendScheduler,
    /// States whose entry invocations have been dispatched.
    invoked: HashSet<StateId>,
    started: bool,
    done: bool,
}

impl Interpreter {
    /// Creates an instance over a chart. The returned [`EventSender`] is
    /// the only way to deliver external events; once every clone of it is
    /// dropped and no delayed send is pending, a stable machine stops
    /// with [`CoreError::EventSourceClosed`].
    pub fn new(
        chart: Arc<Chart>,
        input: Value,
        options: InterpreterOptions,
        invoker: Arc<dyn ServiceInvoker>,
        resolver: Arc<dyn ChildResolver>,
    ) -> (Self, EventSender) {
        let mut ctx = match chart.datamodel.clone() {
            Some(value @ Value::Object(_)) => value,
            Some(other) => {
                warn!(chart = %chart.name, "ignoring non-object datamodel: {}", other);
                json!({})
            }
            None => json!({}),
        };
        set_path(&mut ctx, "input", input);

        let (external_tx, external_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let interp = Self {
            chart,
            options,
            config: Configuration::new(),
            ctx,
            history: HistoryStore::new(),
            internal: VecDeque::new(),
            pending_external: VecDeque::new(),
            external_rx,
            external_closed: false,
            timer_tx,
            timer_rx,
            invoker,
            resolver,
            scheduler: SendScheduler::new(),
            invoked: HashSet::new(),
            started: false,
            done: false,
        };
        (interp, EventSender::new(external_tx))
    }

    /// Active state ids, document order.
    pub fn configuration(&self) -> Vec<String> {
        self.config.state_ids(&self.chart)
    }

    pub fn context(&self) -> &Value {
        &self.ctx
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Runs init content, enters the initial configuration and settles
    /// into the first stable state. Idempotent.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.initialize().await?;
        self.macrostep().await?;
        self.drain_self_sends().await
    }

    /// Processes one external event to quiescence, including any
    /// immediate self-sends its content produced. Events that match no
    /// transition are dropped.
    pub async fn handle(&mut self, event: Event) -> Result<(), CoreError> {
        if self.done {
            return Ok(());
        }
        self.process(event).await?;
        self.drain_self_sends().await
    }

    async fn process(&mut self, event: Event) -> Result<(), CoreError> {
        trace!(name = %event.name, "external event");
        self.bind_event(&event);
        self.fire_event(&event).await?;
        if !self.done {
            self.macrostep().await?;
        }
        Ok(())
    }

    /// Delivers queued self-sends before control returns to the caller,
    /// so machines driven through [`Self::handle`] alone still see them.
    async fn drain_self_sends(&mut self) -> Result<(), CoreError> {
        while !self.done {
            let Some(event) = self.pending_external.pop_front() else {
                break;
            };
            self.process(event).await?;
        }
        Ok(())
    }

    /// Drives the machine until it terminates, pulling external events
    /// from the channel while stable.
    pub async fn run(mut self) -> Result<Outcome, CoreError> {
        let result = self.drive().await;
        self.scheduler.shutdown();
        match result {
            Ok(()) => {
                info!(chart = %self.chart.name, "machine completed");
                Ok(self.outcome(RunStatus::Completed))
            }
            Err(CoreError::Execution { reason }) => {
                warn!(chart = %self.chart.name, %reason, "machine faulted");
                Ok(self.outcome(RunStatus::Faulted { error: reason }))
            }
            Err(other) => Err(other),
        }
    }

    async fn drive(&mut self) -> Result<(), CoreError> {
        self.start().await?;
        while !self.done {
            let event = self
                .next_external()
                .await
                .ok_or(CoreError::EventSourceClosed)?;
            self.handle(event).await?;
        }
        Ok(())
    }

    /// The next external event: self-sent first, then the channel, then
    /// pending timers. `None` means no event can ever arrive again.
    async fn next_external(&mut self) -> Option<Event> {
        if let Some(event) = self.pending_external.pop_front() {
            return Some(event);
        }
        loop {
            if self.external_closed {
                if let Ok(event) = self.timer_rx.try_recv() {
                    return Some(event);
                }
                if self.scheduler.pending_count() == 0 {
                    // a timer that fired between the two checks has
                    // already enqueued its event
                    return self.timer_rx.try_recv().ok();
                }
                // A pending delivery may produce an event, or settle
                // without one (a successful outbound send); re-check
                // either way.
                tokio::select! {
                    event = self.timer_rx.recv() => return event,
                    _ = self.scheduler.settled() => {}
                }
                continue;
            }
            tokio::select! {
                maybe = self.external_rx.recv() => match maybe {
                    Some(event) => return Some(event),
                    None => self.external_closed = true,
                },
                Some(event) = self.timer_rx.recv() => return Some(event),
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), CoreError> {
        let chart = Arc::clone(&self.chart);
        info!(chart = %chart.name, checksum = %chart.checksum, "starting machine");
        self.run_content(&chart, &chart.on_init).await?;

        let initial = chart
            .state(chart.root())
            .initial
            .as_ref()
            .ok_or_else(|| CoreError::structural("chart has no initial transition"))?;
        self.run_content(&chart, &initial.actions).await?;
        let entry = compute_entry_set(&chart, &self.history, &[initial]);
        self.enter_states(&chart, entry).await
    }

    /// Runs eventless transitions and the internal queue to quiescence.
    async fn macrostep(&mut self) -> Result<(), CoreError> {
        let mut steps: u32 = 0;
        while !self.done {
            if self.step_eventless().await? {
                steps += 1;
                self.check_step_bound(steps)?;
                continue;
            }
            let Some(event) = self.internal.pop_front() else {
                break;
            };
            steps += 1;
            self.check_step_bound(steps)?;
            trace!(name = %event.name, "internal event");
            self.bind_event(&event);
            self.fire_event(&event).await?;
        }
        Ok(())
    }

    fn check_step_bound(&self, steps: u32) -> Result<(), CoreError> {
        if steps > self.options.max_microsteps_per_macrostep {
            return Err(CoreError::structural(format!(
                "macrostep exceeded {} microsteps without stabilizing",
                self.options.max_microsteps_per_macrostep
            )));
        }
        Ok(())
    }

    /// Fires one eventless microstep if any eventless transition is
    /// enabled.
    async fn step_eventless(&mut self) -> Result<bool, CoreError> {
        let chart = Arc::clone(&self.chart);
        let Selection {
            transitions,
            eval_errors,
        } = select_transitions(&chart, &self.config, &self.history, None, &self.ctx);
        for reason in eval_errors {
            self.raise_error("error.execution", reason)?;
        }
        if transitions.is_empty() {
            return Ok(false);
        }
        self.microstep(&chart, &transitions).await?;
        Ok(true)
    }

    async fn fire_event(&mut self, event: &Event) -> Result<bool, CoreError> {
        let chart = Arc::clone(&self.chart);
        let Selection {
            transitions,
            eval_errors,
        } = select_transitions(&chart, &self.config, &self.history, Some(event), &self.ctx);
        for reason in eval_errors {
            self.raise_error("error.execution", reason)?;
        }
        if transitions.is_empty() {
            trace!(name = %event.name, "event matched no transition");
            return Ok(false);
        }
        self.microstep(&chart, &transitions).await?;
        Ok(true)
    }

    /// One microstep: exit, transition content, enter.
    async fn microstep(
        &mut self,
        chart: &Chart,
        transitions: &[&Transition],
    ) -> Result<(), CoreError> {
        let exit_set = compute_exit_set(chart, &self.config, &self.history, transitions);
        record_history(chart, &self.config, &exit_set, &mut self.history);
        for &state in &exit_set {
            trace!(state = %chart.state(state).id, "exit");
            self.run_content(chart, &chart.state(state).on_exit).await?;
            self.invoked.remove(&state);
            self.config.remove(state);
        }

        for transition in transitions {
            self.run_content(chart, &transition.actions).await?;
        }

        let entry = compute_entry_set(chart, &self.history, transitions);
        self.enter_states(chart, entry).await?;

        debug_assert!(
            self.config.is_legal(chart),
            "microstep produced an illegal configuration: {:?}",
            self.configuration()
        );
        Ok(())
    }

    /// Enters states in document order, running entry content and
    /// default-entry content, raising done events for finals, and
    /// dispatching invocations for the newly entered states.
    async fn enter_states(&mut self, chart: &Chart, entry: EntrySet<'_>) -> Result<(), CoreError> {
        let mut entered = Vec::new();
        for &state in &entry.states {
            if !self.config.insert(state) {
                continue;
            }
            entered.push(state);
            trace!(state = %chart.state(state).id, "enter");
            self.run_content(chart, &chart.state(state).on_entry).await?;
            if let Some(content) = entry.default_content.get(&state) {
                self.run_content(chart, content).await?;
            }
            if chart.state(state).is_final() {
                self.handle_final(chart, state);
            }
        }

        for state in entered {
            if self.done {
                break;
            }
            if chart.state(state).invokes.is_empty() || !self.invoked.insert(state) {
                continue;
            }
            for spec in &chart.state(state).invokes {
                if let Err(failure) = self.run_invoke(chart, spec).await {
                    self.raise_error(failure.event, failure.reason)?;
                }
            }
        }
        Ok(())
    }

    /// Entering a final child of the root terminates the run; elsewhere a
    /// `done.state.<parent>` event is raised, and when every region of an
    /// enclosing parallel has finished, `done.state.<parallel>` follows.
    fn handle_final(&mut self, chart: &Chart, state: StateId) {
        let Some(parent) = chart.state(state).parent else {
            return;
        };
        if parent == chart.root() {
            self.done = true;
            return;
        }
        let parent_id = &chart.state(parent).id;
        self.internal
            .push_back(Event::internal(format!("done.state.{parent_id}")));

        if let Some(grandparent) = chart.state(parent).parent {
            if chart.state(grandparent).is_parallel() && self.all_regions_final(chart, grandparent)
            {
                let grandparent_id = &chart.state(grandparent).id;
                self.internal
                    .push_back(Event::internal(format!("done.state.{grandparent_id}")));
            }
        }
    }

    fn all_regions_final(&self, chart: &Chart, parallel: StateId) -> bool {
        chart
            .state(parallel)
            .children
            .iter()
            .filter(|&&region| !chart.state(region).is_history())
            .all(|&region| {
                self.config.iter().any(|member| {
                    chart.state(member).is_final() && chart.state(member).parent == Some(region)
                })
            })
    }

    fn bind_event(&mut self, event: &Event) {
        let origin = match event.origin {
            EventOrigin::Internal => "internal",
            EventOrigin::External => "external",
        };
        let mut bound = json!({
            "name": event.name,
            "data": event.data,
            "origin": origin,
        });
        if let Some(invoke_id) = &event.invoke_id {
            bound["invokeid"] = Value::String(invoke_id.clone());
        }
        set_path(&mut self.ctx, "_event", bound);
    }

    /// Raises an error event, or propagates it in fail-fast mode.
    fn raise_error(&mut self, name: &'static str, reason: String) -> Result<(), CoreError> {
        if self.options.fail_fast {
            return Err(CoreError::Execution { reason });
        }
        debug!(event = name, %reason, "raising error event");
        self.internal
            .push_back(Event::internal_with(name, json!({ "message": reason })));
        Ok(())
    }

    /// Runs an action block at the error boundary: failures become error
    /// events rather than aborting the microstep.
    async fn run_content(&mut self, chart: &Chart, actions: &[Action]) -> Result<(), CoreError> {
        if let Err(failure) = self.run_block(chart, actions).await {
            self.raise_error(failure.event, failure.reason)?;
        }
        Ok(())
    }

    fn run_block<'a>(
        &'a mut self,
        chart: &'a Chart,
        actions: &'a [Action],
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionFailure>> + Send + 'a>> {
        Box::pin(async move {
            for action in actions {
                self.run_action(chart, action).await?;
            }
            Ok(())
        })
    }

    async fn run_action(&mut self, chart: &Chart, action: &Action) -> Result<(), ActionFailure> {
        match action {
            Action::Assign { location, value } => {
                let value = value.resolve(&self.ctx)?;
                set_path(&mut self.ctx, location, value);
                Ok(())
            }
            Action::Raise { event } => {
                self.internal.push_back(Event::internal(event.clone()));
                Ok(())
            }
            Action::Log {
                label,
                message,
                value,
            } => {
                let value = match value {
                    Some(source) => Some(source.resolve(&self.ctx)?),
                    None => None,
                };
                info!(
                    chart = %self.chart.name,
                    label = label.as_deref().unwrap_or("log"),
                    message = message.as_deref().unwrap_or(""),
                    ?value,
                    "machine log"
                );
                Ok(())
            }
            Action::If {
                branches,
                else_actions,
            } => {
                for branch in branches {
                    if branch.cond.eval_bool(&self.ctx)? {
                        return self.run_block(chart, &branch.actions).await;
                    }
                }
                self.run_block(chart, else_actions).await
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let items = array.eval_array(&self.ctx)?;
                let saved_item = self.ctx.get(item.as_str()).cloned();
                let saved_index = index
                    .as_ref()
                    .and_then(|key| self.ctx.get(key.as_str()).cloned());

                let mut result = Ok(());
                for (i, element) in items.into_iter().enumerate() {
                    set_path(&mut self.ctx, item, element);
                    if let Some(key) = index {
                        set_path(&mut self.ctx, key, json!(i));
                    }
                    result = self.run_block(chart, actions).await;
                    if result.is_err() {
                        break;
                    }
                }

                match saved_item {
                    Some(value) => set_path(&mut self.ctx, item, value),
                    None => {
                        remove_key(&mut self.ctx, item);
                    }
                }
                if let Some(key) = index {
                    match saved_index {
                        Some(value) => set_path(&mut self.ctx, key, value),
                        None => {
                            remove_key(&mut self.ctx, key);
                        }
                    }
                }
                result
            }
            Action::Send(spec) => self.run_send(spec).await,
            Action::Cancel { send_id } => {
                let id = send_id.resolve(&self.ctx)?;
                if !self.scheduler.cancel(&id) {
                    debug!(%id, "cancel matched no pending send");
                }
                Ok(())
            }
            Action::Query(spec) => {
                let activity = spec.activity.resolve(&self.ctx)?;
                let target = match &spec.target {
                    Some(attr) => Some(attr.resolve(&self.ctx)?),
                    None => None,
                };
                let params = match &spec.params {
                    Some(source) => source.resolve(&self.ctx)?,
                    None => json!({}),
                };
                let invoker = Arc::clone(&self.invoker);
                let result = invoker
                    .query(&activity, target.as_deref(), params)
                    .await
                    .map_err(|err| ActionFailure::communication(err.to_string()))?;
                set_path(&mut self.ctx, &spec.result_location, result);
                Ok(())
            }
            Action::Invoke(spec) => self.run_invoke(chart, spec).await,
        }
    }

    async fn run_send(&mut self, spec: &SendSpec) -> Result<(), ActionFailure> {
        let event_name = spec.event.resolve(&self.ctx)?;
        let target = match &spec.target {
            Some(attr) => Some(attr.resolve(&self.ctx)?),
            None => None,
        };
        let activity = match &spec.activity {
            Some(attr) => Some(attr.resolve(&self.ctx)?),
            None => None,
        };
        let delay = match &spec.delay {
            Some(attr) => Some(attr.resolve(&self.ctx)?),
            None => None,
        };
        let params = match &spec.params {
            Some(source) => source.resolve(&self.ctx)?,
            None => Value::Null,
        };
        let send_id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(location) = &spec.id_location {
            set_path(&mut self.ctx, location, Value::String(send_id.clone()));
        }
        let delay = delay.filter(|d| !d.is_zero());

        // no activity and no target: the machine sends to itself
        if activity.is_none() && target.is_none() {
            let message = Event::external(event_name, params);
            match delay {
                Some(delay) => {
                    let tx = self.timer_tx.clone();
                    self.scheduler.schedule(send_id, delay, async move {
                        let _ = tx.send(message);
                    });
                }
                None => self.enqueue_external(message),
            }
            return Ok(());
        }

        let activity = activity.unwrap_or_else(|| "default".to_string());
        match delay {
            Some(delay) => {
                let invoker = Arc::clone(&self.invoker);
                let tx = self.timer_tx.clone();
                let correlation_id = send_id.clone();
                self.scheduler.schedule(send_id, delay, async move {
                    let outcome = invoker
                        .invoke(
                            &activity,
                            target.as_deref(),
                            &event_name,
                            Some(&correlation_id),
                            params,
                        )
                        .await;
                    if let Err(err) = outcome {
                        let _ = tx.send(Event::external(
                            "error.communication",
                            json!({ "message": err.to_string() }),
                        ));
                    }
                });
                Ok(())
            }
            None => {
                let invoker = Arc::clone(&self.invoker);
                invoker
                    .invoke(
                        &activity,
                        target.as_deref(),
                        &event_name,
                        Some(&send_id),
                        params,
                    )
                    .await
                    .map_err(|err| ActionFailure::communication(err.to_string()))
            }
        }
    }

    /// Self-delivery without delay: behind everything already queued on
    /// the external channel, ahead of anything sent later.
    fn enqueue_external(&mut self, event: Event) {
        while let Ok(queued) = self.external_rx.try_recv() {
            self.pending_external.push_back(queued);
        }
        self.pending_external.push_back(event);
    }

    /// Runs a child machine to completion, executes finalize content with
    /// the completion event bound, and raises `done.invoke.<id>`.
    async fn run_invoke(&mut self, chart: &Chart, spec: &InvokeSpec) -> Result<(), ActionFailure> {
        let machine = match &spec.machine {
            ChildMachine::Inline(inline) => Arc::clone(inline),
            ChildMachine::Named(name) => self
                .resolver
                .resolve(name)
                .map_err(|err| ActionFailure::execution(err.to_string()))?,
        };
        let input = match &spec.input {
            Some(source) => source.resolve(&self.ctx)?,
            None => json!({}),
        };
        debug!(invoke_id = %spec.id, child = %machine.name, "invoking child machine");
        let resolver = Arc::clone(&self.resolver);
        let result = resolver
            .run_child(machine, input)
            .await
            .map_err(|err| ActionFailure::execution(err.to_string()))?;

        let done_name = format!("done.invoke.{}", spec.id);
        let saved_event = self.ctx.get("_event").cloned();
        set_path(
            &mut self.ctx,
            "_event",
            json!({
                "name": done_name.clone(),
                "data": result.clone(),
                "origin": "internal",
                "invokeid": spec.id.clone(),
            }),
        );
        let finalized = self.run_block(chart, &spec.finalize).await;
        match saved_event {
            Some(value) => set_path(&mut self.ctx, "_event", value),
            None => {
                remove_key(&mut self.ctx, "_event");
            }
        }
        finalized?;

        self.internal.push_back(
            Event::internal_with(done_name, result).with_invoke_id(spec.id.clone()),
        );
        Ok(())
    }

    fn outcome(&self, status: RunStatus) -> Outcome {
        let mut data = self.ctx.clone();
        if let Some(map) = data.as_object_mut() {
            map.retain(|key, _| !key.starts_with('_'));
        }
        Outcome {
            status,
            data,
            configuration: self.configuration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NullInvoker, StaticResolver};
    use proptest::prelude::*;
    use scir_expr::DefaultCompiler;

    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("scir_core=trace")
            .with_test_writer()
            .try_init();
    }

    fn chart(json: Value) -> Arc<Chart> {
        Arc::new(Chart::from_json("test", &json, &DefaultCompiler::new()).unwrap())
    }

    fn machine(chart: Arc<Chart>, input: Value) -> (Interpreter, EventSender) {
        Interpreter::new(
            chart,
            input,
            InterpreterOptions::default(),
            Arc::new(NullInvoker),
            Arc::new(StaticResolver::new()),
        )
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        init_logs();
        let chart = chart(json!({
            "initial": "boot",
            "states": [
                {"id": "boot",
                 "onEntry": [{"assign": {"location": "ready", "value": true}}],
                 "transitions": [{"target": "end"}]},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.configuration, vec!["end"]);
        assert_eq!(outcome.data["ready"], json!(true));
    }

    #[tokio::test]
    async fn test_external_event_drives_transition() {
        let chart = chart(json!({
            "initial": "idle",
            "states": [
                {"id": "idle", "transitions": [{"event": "go", "target": "work"}]},
                {"id": "work"}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        assert_eq!(interp.configuration(), vec!["idle"]);

        interp.handle(Event::external("go", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["work"]);
    }

    #[tokio::test]
    async fn test_unmatched_event_is_dropped() {
        let chart = chart(json!({
            "initial": "idle",
            "states": [
                {"id": "idle", "transitions": [{"event": "go", "target": "work"}]},
                {"id": "work"}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        interp.handle(Event::external("nothing", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["idle"]);
    }

    #[tokio::test]
    async fn test_guards_branch_on_input_data() {
        let definition = json!({
            "initial": "check",
            "states": [
                {"id": "check", "transitions": [
                    {"event": "submit", "cond": "ctx.input.amount >= 100", "target": "review"},
                    {"event": "submit", "target": "approved"}
                ]},
                {"id": "review"},
                {"id": "approved"}
            ]
        });

        let (mut interp, _sender) = machine(chart(definition.clone()), json!({"amount": 250}));
        interp.start().await.unwrap();
        interp.handle(Event::external("submit", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["review"]);

        let (mut interp, _sender) = machine(chart(definition), json!({"amount": 10}));
        interp.start().await.unwrap();
        interp.handle(Event::external("submit", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["approved"]);
    }

    #[tokio::test]
    async fn test_false_guard_leaves_configuration_unchanged() {
        let chart = chart(json!({
            "initial": "a",
            "datamodel": {"count": 3},
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "ctx.count > 5", "target": "b"}
                ]},
                {"id": "b"}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        interp.handle(Event::external("go", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_internal_events_outrank_queued_external_events() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b", "actions": [{"raise": {"event": "int"}}]}
                ]},
                {"id": "b", "transitions": [
                    {"event": "int", "target": "c"},
                    {"event": "ext", "target": "trap"}
                ]},
                {"id": "c", "transitions": [{"event": "ext", "target": "end"}]},
                {"id": "trap", "type": "final"},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        sender.send_named("go").unwrap();
        sender.send_named("ext").unwrap();
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.configuration, vec!["end"]);
    }

    #[tokio::test]
    async fn test_eventless_transitions_run_before_external_events() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "transitions": [
                    {"target": "c"},
                    {"event": "next", "target": "trap"}
                ]},
                {"id": "c", "transitions": [{"event": "next", "target": "end"}]},
                {"id": "trap", "type": "final"},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        sender.send_named("go").unwrap();
        sender.send_named("next").unwrap();
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.configuration, vec!["end"]);
    }

    #[tokio::test]
    async fn test_parallel_regions_finish_and_raise_done() {
        init_logs();
        let chart = chart(json!({
            "initial": "p",
            "states": [
                {"id": "p", "type": "parallel",
                 "transitions": [{"event": "done.state.p", "target": "end"}],
                 "states": [
                    {"id": "x", "initial": "x1", "states": [
                        {"id": "x1", "transitions": [{"event": "go", "target": "xf"}]},
                        {"id": "xf", "type": "final"}
                    ]},
                    {"id": "y", "initial": "y1", "states": [
                        {"id": "y1", "transitions": [{"event": "go", "target": "yf"}]},
                        {"id": "yf", "type": "final"}
                    ]}
                 ]},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        sender.send_named("go").unwrap();
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.configuration, vec!["end"]);
    }

    #[tokio::test]
    async fn test_shallow_history_restores_sibling() {
        let chart = chart(json!({
            "initial": "off",
            "states": [
                {"id": "off", "transitions": [{"event": "on", "target": "h"}]},
                {"id": "on", "initial": "low",
                 "transitions": [{"event": "off", "target": "off"}],
                 "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "low"}]},
                    {"id": "low", "transitions": [{"event": "up", "target": "high"}]},
                    {"id": "high"}
                 ]}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();

        // first entry falls back to the history default
        interp.handle(Event::external("on", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["on", "low"]);

        interp.handle(Event::external("up", json!(null))).await.unwrap();
        interp.handle(Event::external("off", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["off"]);

        interp.handle(Event::external("on", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["on", "high"]);
    }

    #[tokio::test]
    async fn test_deep_history_restores_nested_leaf() {
        let chart = chart(json!({
            "initial": "off",
            "states": [
                {"id": "off", "transitions": [{"event": "on", "target": "hd"}]},
                {"id": "on", "initial": "mid",
                 "transitions": [{"event": "off", "target": "off"}],
                 "states": [
                    {"id": "hd", "type": "deepHistory", "transitions": [{"target": "mid"}]},
                    {"id": "mid", "initial": "m1", "states": [
                        {"id": "m1", "transitions": [{"event": "next", "target": "m2"}]},
                        {"id": "m2"}
                    ]}
                 ]}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();

        interp.handle(Event::external("on", json!(null))).await.unwrap();
        interp.handle(Event::external("next", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["on", "mid", "m2"]);

        interp.handle(Event::external("off", json!(null))).await.unwrap();
        interp.handle(Event::external("on", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["on", "mid", "m2"]);
    }

    #[tokio::test]
    async fn test_foreach_iterates_snapshot_and_restores_bindings() {
        let chart = chart(json!({
            "initial": "end",
            "datamodel": {"items": [1, 2, 3]},
            "onInit": [{"foreach": {"array": "ctx.items", "item": "it", "index": "i",
                "actions": [
                    {"assign": {"location": "last", "expr": "ctx.it"}},
                    {"assign": {"location": "items", "value": []}}
                ]}}],
            "states": [{"id": "end", "type": "final"}]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        let outcome = interp.run().await.unwrap();
        // clearing ctx.items mid-loop does not affect the snapshot
        assert_eq!(outcome.data["last"], json!(3));
        assert_eq!(outcome.data["items"], json!([]));
        assert!(outcome.data.get("it").is_none());
        assert!(outcome.data.get("i").is_none());
    }

    #[tokio::test]
    async fn test_action_failure_raises_error_event() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "onEntry": [{"foreach": {"array": "ctx.missing", "item": "it", "actions": []}}],
                 "transitions": [{"event": "error.*", "target": "recovered"}]},
                {"id": "recovered", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.configuration, vec!["recovered"]);
    }

    #[tokio::test]
    async fn test_fail_fast_surfaces_fault() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "onEntry": [{"foreach": {"array": "ctx.missing", "item": "it", "actions": []}}],
                 "transitions": [{"event": "error.*", "target": "recovered"}]},
                {"id": "recovered", "type": "final"}
            ]
        }));
        let (interp, sender) = Interpreter::new(
            chart,
            json!({}),
            InterpreterOptions {
                fail_fast: true,
                ..Default::default()
            },
            Arc::new(NullInvoker),
            Arc::new(StaticResolver::new()),
        );
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert!(matches!(outcome.status, RunStatus::Faulted { .. }));
        assert_eq!(outcome.configuration, vec!["a"]);
    }

    #[tokio::test]
    async fn test_stay_transition_runs_actions_without_exit() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "onExit": [{"assign": {"location": "exited", "value": true}}],
                 "transitions": [{"event": "note",
                     "actions": [{"assign": {"location": "seen", "value": true}}]}]}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        interp.handle(Event::external("note", json!(null))).await.unwrap();

        assert_eq!(interp.configuration(), vec!["a"]);
        assert_eq!(interp.context()["seen"], json!(true));
        assert!(interp.context().get("exited").is_none());
    }

    #[tokio::test]
    async fn test_targeted_descendant_preempts_ancestor_stay_transition() {
        let chart = chart(json!({
            "initial": "outer",
            "states": [
                {"id": "outer", "initial": "p",
                 "transitions": [{"event": "go",
                     "actions": [{"assign": {"location": "ancestor_fired", "value": true}}]}],
                 "states": [
                    {"id": "p", "type": "parallel", "states": [
                        {"id": "x", "initial": "x1", "states": [
                            {"id": "x1", "transitions": [{"event": "go", "target": "x2"}]},
                            {"id": "x2"}
                        ]},
                        {"id": "y", "initial": "y1", "states": [{"id": "y1"}]}
                    ]}
                 ]}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        interp.handle(Event::external("go", json!(null))).await.unwrap();

        assert_eq!(
            interp.configuration(),
            vec!["outer", "p", "x", "x2", "y", "y1"]
        );
        assert!(interp.context().get("ancestor_fired").is_none());
    }

    #[tokio::test]
    async fn test_wildcard_event_patterns() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [{"event": "order.*", "target": "b"}]},
                {"id": "b", "transitions": [{"event": "*", "target": "c"}]},
                {"id": "c"}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();

        interp
            .handle(Event::external("order.created.eu", json!(null)))
            .await
            .unwrap();
        assert_eq!(interp.configuration(), vec!["b"]);

        interp.handle(Event::external("anything", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_immediate_self_send_is_delivered_within_handle() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b",
                    "actions": [{"send": {"event": "next"}}]}]},
                {"id": "b", "transitions": [{"event": "next", "target": "c"}]},
                {"id": "c"}
            ]
        }));
        let (mut interp, _sender) = machine(chart, json!({}));
        interp.start().await.unwrap();
        interp.handle(Event::external("go", json!(null))).await.unwrap();
        assert_eq!(interp.configuration(), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_self_send_fires_after_senders_drop() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "onEntry": [{"send": {"event": "timeout", "delayMs": 25}}],
                 "transitions": [{"event": "timeout", "target": "end"}]},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.configuration, vec!["end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_scheduled_send() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "onEntry": [
                    {"send": {"event": "timeout", "delayMs": 5000, "id": "t1"}},
                    {"cancel": {"sendId": "t1"}}
                 ],
                 "transitions": [{"event": "timeout", "target": "trap"}]},
                {"id": "trap", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        // with the timer cancelled and no senders left, the machine can
        // never progress again
        let err = interp.run().await.unwrap_err();
        assert!(matches!(err, CoreError::EventSourceClosed));
    }

    #[tokio::test]
    async fn test_invoke_runs_child_and_finalizes() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a",
                 "invoke": [{
                    "id": "worker",
                    "definition": {"initial": "w", "states": [
                        {"id": "w",
                         "onEntry": [{"assign": {"location": "result", "value": 7}}],
                         "transitions": [{"target": "f"}]},
                        {"id": "f", "type": "final"}
                    ]},
                    "finalize": [{"assign": {"location": "got", "expr": "ctx._event.data.result"}}]
                 }],
                 "transitions": [{"event": "done.invoke.worker", "target": "end"}]},
                {"id": "end", "type": "final"}
            ]
        }));
        let (interp, sender) = machine(chart, json!({}));
        drop(sender);

        let outcome = interp.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.configuration, vec!["end"]);
        assert_eq!(outcome.data["got"], json!(7));
    }

    #[tokio::test]
    async fn test_livelocked_machine_hits_microstep_bound() {
        let chart = chart(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [{"target": "b"}]},
                {"id": "b", "transitions": [{"target": "a"}]}
            ]
        }));
        let (interp, sender) = Interpreter::new(
            chart,
            json!({}),
            InterpreterOptions {
                max_microsteps_per_macrostep: 16,
                ..Default::default()
            },
            Arc::new(NullInvoker),
            Arc::new(StaticResolver::new()),
        );
        drop(sender);

        let err = interp.run().await.unwrap_err();
        assert!(matches!(err, CoreError::Structural { .. }));
    }

    fn hierarchy_chart() -> Arc<Chart> {
        chart(json!({
            "initial": "off",
            "states": [
                {"id": "off", "transitions": [{"event": "on", "target": "hd"}]},
                {"id": "running", "initial": "p",
                 "transitions": [
                    {"event": "off", "target": "off"},
                    {"event": "reset", "target": "p"}
                 ],
                 "states": [
                    {"id": "hd", "type": "deepHistory", "transitions": [{"target": "p"}]},
                    {"id": "p", "type": "parallel", "states": [
                        {"id": "mode", "initial": "low", "states": [
                            {"id": "low", "transitions": [{"event": "up", "target": "high"}]},
                            {"id": "high", "transitions": [{"event": "down", "target": "low"}]}
                        ]},
                        {"id": "gear", "initial": "g1", "states": [
                            {"id": "g1", "transitions": [{"event": "go", "target": "g2"}]},
                            {"id": "g2", "transitions": [{"event": "go", "target": "g1"}]}
                        ]}
                    ]}
                 ]}
            ]
        }))
    }

    proptest! {
        #[test]
        fn prop_configuration_stays_legal(events in proptest::collection::vec(
            proptest::sample::select(vec!["on", "off", "up", "down", "go", "reset", "noise"]),
            0..16,
        )) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let chart = hierarchy_chart();
                let (mut interp, _sender) = machine(Arc::clone(&chart), json!({}));
                interp.start().await.unwrap();
                assert!(interp.config.is_legal(&chart));
                for name in events {
                    interp.handle(Event::external(name, json!(null))).await.unwrap();
                    assert!(interp.config.is_legal(&chart));
                }
            });
        }
    }
}
