//! The dispatch loop.
//!
//! [`Dispatch`] owns the registrar, both pools and one state machine per
//! registered node. Each [`Dispatch::step`] advances the top-level state and,
//! while dispatching, every node machine once.

pub mod exchange;
pub mod fsm;
pub mod layout;
pub mod svm;
pub mod vm;


pub use fsm::{DispatchState, SvmEvent, SvmMachine, SvmState, VmEvent, VmState};
pub use layout::{DispatchRoot, NodeSummary, Stats};
pub use svm::{SvmNode, VM_TRACE_MULTIPLIER};
pub use vm::{VM_TEST_MULTIPLIER, VmNode};

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DispatchOptions;
use crate::core::{AsyncTask, AtomicGuard};
use crate::error::DispatchError;
use crate::guest::GuestData;
use crate::node::{NodeHandle, NodeRegistrar, NodeRegistrarDriver, NodeType, disconnect};
use crate::pool::{TestPool, TracePool};
use crate::test_case::TestCase;
use exchange::mark_inactive;

/// Pause between two steps of [`Dispatch::run`].
const STEP_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a node machine needs from the run.
#[derive(Clone)]
pub struct DispatchContext {
    pub options: Arc<DispatchOptions>,
    pub root: DispatchRoot,
    pub test_pool: AtomicGuard<TestPool>,
    pub trace_pool: AtomicGuard<TracePool>,
    /// Guest configuration, once the first VM node reported it.
    pub guest_data: AtomicGuard<Option<GuestData>>,
}

pub struct Dispatch {
    options: Arc<DispatchOptions>,
    state: DispatchState,
    ctx: Option<DispatchContext>,
    registrar: AtomicGuard<NodeRegistrar>,
    registrar_task: Option<AsyncTask<()>>,
    port: Option<u16>,
    arrivals_tx: mpsc::UnboundedSender<NodeHandle>,
    arrivals: mpsc::UnboundedReceiver<NodeHandle>,
    vm_nodes: Vec<VmNode>,
    svm_nodes: Vec<SvmNode>,
    started: Instant,
    phase_started: Instant,
    last_stats: Instant,
}

impl Dispatch {
    pub fn new(options: DispatchOptions) -> Self {
        let (arrivals_tx, arrivals) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            options: Arc::new(options),
            state: DispatchState::Initializing,
            ctx: None,
            registrar: AtomicGuard::new(NodeRegistrar::new()),
            registrar_task: None,
            port: None,
            arrivals_tx,
            arrivals,
            vm_nodes: Vec::new(),
            svm_nodes: Vec::new(),
            started: now,
            phase_started: now,
            last_stats: now,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Master port, once bound.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn context(&self) -> Option<&DispatchContext> {
        self.ctx.as_ref()
    }

    pub fn registrar(&self) -> &AtomicGuard<NodeRegistrar> {
        &self.registrar
    }

    /// Whether any node ever registered.
    pub fn has_nodes(&self) -> bool {
        !self.vm_nodes.is_empty() || !self.svm_nodes.is_empty()
    }

    pub fn vm_nodes(&self) -> &[VmNode] {
        &self.vm_nodes
    }

    pub fn svm_nodes(&self) -> &[SvmNode] {
        &self.svm_nodes
    }

    /// Step until finished or failed. Returns true when at least one node
    /// registered and the run drained.
    pub async fn run(&mut self) -> bool {
        while !self.state.is_terminal() {
            self.step().await;
            if !self.state.is_terminal() {
                tokio::time::sleep(STEP_INTERVAL).await;
            }
        }

        if !self.has_nodes() {
            warn!("No nodes registered");
        }
        self.state == DispatchState::Finished && self.has_nodes()
    }

    /// Advance the run once.
    pub async fn step(&mut self) -> DispatchState {
        let result = match self.state {
            DispatchState::Initializing => self.initialize().await,
            DispatchState::AwaitingRegistrations => self.await_registrations().await,
            DispatchState::Dispatching => self.dispatch().await,
            DispatchState::Draining => self.drain().await,
            DispatchState::Finished | DispatchState::Failed => Ok(()),
        };

        if let Err(e) = result {
            error!("Dispatch failed while {:?}: {:#}", self.state, e);
            self.shutdown_registrar().await;
            self.move_to(DispatchState::Failed);
        }
        self.state
    }

    fn move_to(&mut self, next: DispatchState) {
        if !self.state.can_move_to(next) {
            error!("Invalid dispatch transition {:?} -> {:?}", self.state, next);
            if !self.state.is_terminal() {
                self.state = DispatchState::Failed;
            }
            return;
        }
        info!("Dispatch {:?} -> {:?}", self.state, next);
        self.state = next;
        self.phase_started = Instant::now();
    }

    async fn initialize(&mut self) -> Result<()> {
        let options = self.options.clone();
        let root = DispatchRoot::create(Path::new(&options.root_dir))?;

        let mut test_pool = TestPool::new(options.test.strategy).with_output_dir(root.test_case_dir());
        if let Some(path) = &options.vm.initial_tc {
            let file = File::open(path).with_context(|| format!("Failed to open initial test case {}", path))?;
            let tc = TestCase::read_from(BufReader::new(file))?;
            test_pool.insert_initial_tc_from_config(tc)?;
            info!("Seeded test pool from {}", path);
        }
        let trace_pool = TracePool::new(options.trace.selection, options.trace.seed, options.trace.compress);

        let connect_timeout = Duration::from_secs(options.registration.connect_timeout_secs);
        let port = Some(options.master_port).filter(|p| *p != 0);
        let mut driver = NodeRegistrarDriver::bind(port, self.registrar.clone(), connect_timeout).await?;
        let arrivals = self.arrivals_tx.clone();
        driver.add_callback(Box::new(move |handle: &NodeHandle| {
            if arrivals.send(handle.clone()).is_err() {
                debug!("Dispatch is gone; node {} not picked up", handle.id);
            }
        }));
        self.port = Some(driver.port());
        self.registrar_task = Some(AsyncTask::spawn("registrar", async move {
            driver.run().await?;
            Ok(())
        }));

        info!(
            "Dispatch root {}; waiting for {} VM and {} SVM nodes on port {}",
            root.path().display(),
            options.registration.vm_nodes,
            options.registration.svm_nodes,
            self.port.unwrap_or_default()
        );
        self.ctx = Some(DispatchContext {
            options,
            root,
            test_pool: AtomicGuard::new(test_pool),
            trace_pool: AtomicGuard::new(trace_pool),
            guest_data: AtomicGuard::new(None),
        });
        self.move_to(DispatchState::AwaitingRegistrations);
        Ok(())
    }

    fn accept_arrivals(&mut self) {
        while let Ok(handle) = self.arrivals.try_recv() {
            info!("{} node {} joined", handle.node_type, handle.id);
            match handle.node_type {
                NodeType::Vm => self.vm_nodes.push(VmNode::new(handle)),
                NodeType::Svm => self.svm_nodes.push(SvmNode::new(handle)),
            }
        }
    }

    /// Whether the registrar loop has ended. A failed registrar fails the run.
    fn registrar_stopped(&mut self) -> Result<bool> {
        let Some(task) = self.registrar_task.as_mut() else {
            return Ok(true);
        };
        match task.take() {
            None => Ok(false),
            Some(outcome) => {
                self.registrar_task = None;
                outcome.context("Registrar failed")?;
                Ok(true)
            }
        }
    }

    async fn await_registrations(&mut self) -> Result<()> {
        self.accept_arrivals();
        if self.registrar_stopped()? {
            info!("Registrar shut down before dispatching started");
            self.move_to(DispatchState::Draining);
            return Ok(());
        }

        let wanted = &self.options.registration;
        if self.vm_nodes.len() >= wanted.vm_nodes && self.svm_nodes.len() >= wanted.svm_nodes {
            self.move_to(DispatchState::Dispatching);
        } else if self.phase_started.elapsed() >= Duration::from_secs(wanted.timeout_secs) {
            if self.has_nodes() {
                warn!(
                    "Registration timed out with {} VM and {} SVM nodes",
                    self.vm_nodes.len(),
                    self.svm_nodes.len()
                );
                self.move_to(DispatchState::Dispatching);
            } else {
                warn!("Registration timed out without any node");
                self.move_to(DispatchState::Draining);
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self) -> Result<()> {
        self.accept_arrivals();
        if self.registrar_stopped()? {
            info!("Shutdown requested");
            self.move_to(DispatchState::Draining);
            return Ok(());
        }

        self.step_nodes(true).await;
        self.report_stats(false).await?;

        if let Some(reason) = self.limit_reached().await {
            info!("{}; draining", reason);
            self.move_to(DispatchState::Draining);
        } else if self.is_exhausted().await {
            info!("No work left; draining");
            self.move_to(DispatchState::Draining);
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        self.accept_arrivals();
        self.registrar_stopped()?;
        self.step_nodes(false).await;

        let in_flight = self.in_flight();
        let timed_out = self.phase_started.elapsed() >= Duration::from_secs(self.options.drain_timeout_secs);
        if in_flight == 0 || timed_out {
            if in_flight > 0 {
                warn!("Drain timed out with {} nodes still busy", in_flight);
            }
            self.finish().await?;
            self.move_to(DispatchState::Finished);
        }
        Ok(())
    }

    async fn step_nodes(&mut self, allow_work: bool) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };

        for node in &mut self.vm_nodes {
            if let Err(e) = node.step(&ctx, allow_work).await {
                match e {
                    DispatchError::ProtocolViolation(_) => node.fail(&e),
                    _ if e.is_transport() => {
                        node.fail(&e);
                        mark_inactive(node.handle()).await;
                    }
                    _ => warn!("VM node {}: {}", node.id(), e),
                }
            }
        }

        for node in &mut self.svm_nodes {
            if let Err(e) = node.step(&ctx, allow_work).await {
                match e {
                    DispatchError::ProtocolViolation(_) => node.fail(&e),
                    _ if e.is_transport() => {
                        node.fail(&e);
                        mark_inactive(node.handle()).await;
                    }
                    _ => warn!("SVM node {}: {}", node.id(), e),
                }
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.vm_nodes.iter().filter(|n| n.is_in_flight()).count()
            + self.svm_nodes.iter().filter(|n| n.is_in_flight()).count()
    }

    /// Both pools empty and every live node started and idle.
    async fn is_exhausted(&self) -> bool {
        let live_vms: Vec<&VmNode> = self.vm_nodes.iter().filter(|n| n.is_live()).collect();
        let live_svms: Vec<&SvmNode> = self.svm_nodes.iter().filter(|n| n.is_live()).collect();
        if live_vms.is_empty() && live_svms.is_empty() {
            return true;
        }
        if live_vms.iter().any(|n| !n.is_started()) || live_svms.iter().any(|n| !n.is_started()) {
            return false;
        }
        if self.in_flight() > 0 {
            return false;
        }

        let Some(ctx) = &self.ctx else {
            return true;
        };
        let tests_left = ctx.test_pool.with(|p| p.count_next()).await;
        let traces_left = ctx.trace_pool.with(|p| p.count_next()).await;
        tests_left == 0 && traces_left == 0
    }

    async fn limit_reached(&self) -> Option<String> {
        let ctx = self.ctx.as_ref()?;
        let interval = &self.options.test.interval;

        if let Some(limit) = interval.trace {
            let traces = ctx.trace_pool.with(|p| p.count_all()).await;
            if traces >= limit {
                return Some(format!("Trace limit {} reached", limit));
            }
        }
        if let Some(limit) = interval.tc {
            let tests = ctx.test_pool.with(|p| p.count_all()).await as u64;
            if tests >= limit {
                return Some(format!("Test case limit {} reached", limit));
            }
        }
        if let Some(secs) = interval.time
            && self.started.elapsed() >= Duration::from_secs(secs)
        {
            return Some(format!("Time limit of {} s reached", secs));
        }
        None
    }

    async fn stats(&self, ctx: &DispatchContext) -> Stats {
        let (tc_left, tc_total) = ctx.test_pool.with(|p| (p.count_next(), p.count_all())).await;
        let (trace_left, trace_total) = ctx
            .trace_pool
            .with(|p| (p.count_next(), p.count_all_unique()))
            .await;
        Stats {
            elapsed_secs: self.started.elapsed().as_secs(),
            tc_left,
            tc_total,
            trace_left,
            trace_total,
        }
    }

    /// Append a statistics line every profile interval, or now with `force`.
    async fn report_stats(&mut self, force: bool) -> Result<Stats> {
        let Some(ctx) = self.ctx.clone() else {
            return Ok(Stats::default());
        };
        let stats = self.stats(&ctx).await;
        if !force && self.last_stats.elapsed() < Duration::from_secs(self.options.profile.interval) {
            return Ok(stats);
        }
        self.last_stats = Instant::now();

        ctx.root.append_stats(&stats)?;
        info!(
            "[{} s] test cases {}/{}, traces {}/{}, {} VM and {} SVM nodes",
            stats.elapsed_secs,
            stats.tc_left,
            stats.tc_total,
            stats.trace_left,
            stats.trace_total,
            self.vm_nodes.iter().filter(|n| n.is_live()).count(),
            self.svm_nodes.iter().filter(|n| n.is_live()).count()
        );
        Ok(stats)
    }

    async fn finish(&mut self) -> Result<()> {
        for node in &mut self.vm_nodes {
            node.terminate();
        }
        for node in &mut self.svm_nodes {
            node.terminate();
        }

        let stats = self.report_stats(true).await?;
        if let Some(ctx) = self.ctx.clone() {
            let summaries: Vec<NodeSummary> = self
                .vm_nodes
                .iter()
                .map(VmNode::summary)
                .chain(self.svm_nodes.iter().map(SvmNode::summary))
                .collect();
            ctx.root.write_finish_log(&summaries, &stats)?;
            ctx.test_pool.with(|p| ctx.root.write_tc_tree(p)).await?;

            let trace = &self.options.trace;
            if trace.print_graph {
                ctx.trace_pool
                    .with(|p| ctx.root.write_graph(p.graph(), trace.print_graph_only_branches))
                    .await?;
            }
            info!("Dispatch finished; results in {}", ctx.root.path().display());
        }

        self.shutdown_registrar().await;
        Ok(())
    }

    /// Tell every node to shut down and stop the registrar loop.
    async fn shutdown_registrar(&mut self) {
        disconnect(&self.registrar).await;

        let Some(task) = self.registrar_task.take() else {
            return;
        };
        let timeout = Duration::from_secs(self.options.registration.connect_timeout_secs);
        if !task.is_finished()
            && let Some(port) = self.port
            && let Err(e) = NodeRegistrarDriver::request_shutdown("127.0.0.1", port, timeout).await
        {
            warn!("Failed to stop the registrar: {}", e);
        }
        match tokio::time::timeout(timeout, task.join()).await {
            Ok(Ok(())) => debug!("Registrar stopped"),
            Ok(Err(e)) => warn!("Registrar ended with an error: {:#}", e),
            Err(_) => warn!("Registrar did not stop within {:?}", timeout),
        }
    }
}
