//! Dispatcher-side driver for one SVM node.
//!
//! Traces go out in the background: a batch is popped from the pool and
//! streamed by an [`AsyncTask`] that owns the node's connection until the
//! batch is through.

use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::exchange::{harvest_errors, request_tests, send_config};
use super::fsm::{SvmEvent, SvmMachine, SvmState};
use super::layout::NodeSummary;
use super::DispatchContext;
use crate::core::AsyncTask;
use crate::error::{DispatchError, DispatchResult};
use crate::node::{NodeHandle, poll};
use crate::protocol::{PacketType, send_directory};

/// Traces an SVM node may have queued before it gets more.
pub const VM_TRACE_MULTIPLIER: usize = 20;

pub struct SvmNode {
    handle: NodeHandle,
    machine: SvmMachine,
    /// Traces sent since the node last reported itself inactive.
    outstanding: usize,
    /// Test cases the node reported on its last poll.
    pending_tests: usize,
    /// Trace batch being streamed to the node; yields how many were sent.
    pending_send: Option<AsyncTask<usize>>,
    traces: u64,
    tests: u64,
    errors: u64,
}

impl SvmNode {
    pub fn new(handle: NodeHandle) -> Self {
        Self {
            handle,
            machine: SvmMachine::default(),
            outstanding: 0,
            pending_tests: 0,
            pending_send: None,
            traces: 0,
            tests: 0,
            errors: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn state(&self) -> SvmState {
        self.machine.state
    }

    pub fn is_errored(&self) -> bool {
        self.machine.errored
    }

    pub fn is_started(&self) -> bool {
        self.machine.state != SvmState::Idle
    }

    /// Receiving or analyzing traces, or holding test cases not yet harvested.
    pub fn is_in_flight(&self) -> bool {
        self.is_live()
            && (self.machine.state == SvmState::TestsReady
                || self.outstanding > 0
                || self.pending_send.is_some())
    }

    pub fn is_live(&self) -> bool {
        !self.machine.errored && !self.machine.terminated
    }

    fn fire(&mut self, event: SvmEvent) -> DispatchResult<()> {
        let prev = self.machine.state;
        let next = self.machine.fire(event)?;
        if next != prev {
            debug!("SVM node {}: {:?} -> {:?}", self.id(), prev, next);
        }
        Ok(())
    }

    /// Advance the node by one step. With `allow_work` unset no traces are
    /// handed out; test cases the node already has are still harvested.
    pub async fn step(&mut self, ctx: &DispatchContext, allow_work: bool) -> DispatchResult<()> {
        if !self.is_live() {
            return Ok(());
        }
        match self.machine.state {
            SvmState::Idle if allow_work => self.start(ctx).await,
            SvmState::Idle => Ok(()),
            SvmState::AwaitingTrace | SvmState::Analyzing => self.analyze(ctx, allow_work).await,
            SvmState::TestsReady => self.collect(ctx).await,
            SvmState::Terminated => Ok(()),
        }
    }

    /// Flag the node as errored after a failed step.
    pub fn fail(&mut self, err: &DispatchError) {
        warn!("SVM node {} failed: {}", self.id(), err);
        self.pending_send = None;
        self.machine.errored = true;
    }

    pub fn terminate(&mut self) {
        self.pending_send = None;
        if let Err(e) = self.fire(SvmEvent::Terminate) {
            debug!("SVM node {}: {}", self.id(), e);
        }
    }

    pub fn summary(&self) -> NodeSummary {
        let mut state = format!("{:?}", self.machine.state);
        if self.machine.errored {
            state.push_str("(errored)");
        }
        NodeSummary {
            id: self.id(),
            node_type: self.handle.node_type,
            state,
            traces: self.traces,
            tests: self.tests,
            errors: self.errors,
        }
    }

    async fn start(&mut self, ctx: &DispatchContext) -> DispatchResult<()> {
        let id = self.id();
        {
            let mut node = self.handle.node.acquire().await;
            let conn = node.connection();
            send_config(conn, id, &ctx.options).await?;
            conn.write_header(id, PacketType::Commence).await?;
        }
        info!("SVM node {} commenced", id);
        self.fire(SvmEvent::Start)
    }

    async fn analyze(&mut self, ctx: &DispatchContext, allow_work: bool) -> DispatchResult<()> {
        // The connection belongs to the send task until it is done.
        if let Some(task) = self.pending_send.as_mut() {
            let Some(outcome) = task.take() else {
                return Ok(());
            };
            self.pending_send = None;
            let sent = outcome?;
            self.outstanding += sent;
            self.traces += sent as u64;
            if sent > 0 {
                self.fire(SvmEvent::NextTrace)?;
            }
        }

        let status = poll(&self.handle).await?;
        self.fire(SvmEvent::Poll)?;

        if status.error_count > 0 {
            self.errors += harvest_errors(ctx, &self.handle).await? as u64;
        }
        if !status.active {
            self.outstanding = 0;
        }
        if status.test_case_count > 0 {
            self.pending_tests = status.test_case_count as usize;
            return self.fire(SvmEvent::TestsQueued);
        }
        if !allow_work || self.outstanding >= VM_TRACE_MULTIPLIER {
            return Ok(());
        }

        let room = VM_TRACE_MULTIPLIER - self.outstanding;
        let batch: Vec<PathBuf> = ctx
            .trace_pool
            .with(|p| std::iter::from_fn(|| p.next()).take(room).collect())
            .await;
        if !batch.is_empty() {
            self.pending_send = Some(self.send_traces(batch));
        }
        Ok(())
    }

    fn send_traces(&self, batch: Vec<PathBuf>) -> AsyncTask<usize> {
        let node = self.handle.node.clone();
        let id = self.id();
        AsyncTask::spawn(format!("traces-to-{}", id), async move {
            let mut node = node.acquire().await;
            for trace in &batch {
                send_directory(node.connection(), id, PacketType::Trace, Some(trace.as_path())).await?;
            }
            debug!("Sent {} traces to SVM node {}", batch.len(), id);
            Ok(batch.len())
        })
    }

    /// Harvest derived test cases. The last one of a harvest is the input
    /// the node analyzed; the rest are inserted as its children.
    async fn collect(&mut self, ctx: &DispatchContext) -> DispatchResult<()> {
        let mut tests = request_tests(&self.handle, self.pending_tests).await?;
        self.pending_tests = 0;

        if let Some(parent) = tests.pop() {
            self.tests += tests.len() as u64;
            let accepted = ctx
                .test_pool
                .with(|p| p.insert_with_parent(tests, &parent))
                .await;
            debug!("SVM node {} derived {} new test cases", self.id(), accepted);
        }
        self.fire(SvmEvent::TestsHarvested)
    }
}
