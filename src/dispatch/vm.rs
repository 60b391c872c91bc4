//! Dispatcher-side driver for one VM node.
//!
//! A VM node executes one test case at a time and answers with a trace. The
//! trace is pulled in the background so a slow transfer never holds up the
//! other nodes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::exchange::{harvest_errors, request_tests, send_config, sync_image};
use super::fsm::{VmEvent, VmState};
use super::layout::NodeSummary;
use super::DispatchContext;
use crate::core::AsyncTask;
use crate::error::{DispatchError, DispatchResult};
use crate::guest::GuestData;
use crate::node::{NodeHandle, NodeStatus, poll};
use crate::pool::{AddressRange, ElfEntry};
use crate::protocol::{PacketType, receive_directory};
use crate::test_case::TestCase;
use crate::trace::Trace;

/// Test cases handed to a VM node per round.
pub const VM_TEST_MULTIPLIER: usize = 1;

pub struct VmNode {
    handle: NodeHandle,
    state: VmState,
    pending_trace: Option<AsyncTask<Option<PathBuf>>>,
    traces: u64,
    tests: u64,
    errors: u64,
}

impl VmNode {
    pub fn new(handle: NodeHandle) -> Self {
        Self {
            handle,
            state: VmState::AwaitingGuestData,
            pending_trace: None,
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

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state != VmState::AwaitingGuestData
    }

    /// Executing a test case or delivering its trace.
    pub fn is_in_flight(&self) -> bool {
        self.is_live() && (self.state == VmState::Running || self.pending_trace.is_some())
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, VmState::Error | VmState::Terminated)
    }

    fn fire(&mut self, event: VmEvent) -> DispatchResult<()> {
        let next = self.state.transition(event)?;
        if next != self.state {
            debug!("VM node {}: {:?} -> {:?}", self.id(), self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Advance the node by one step. With `allow_work` unset no new work is
    /// handed out; results already on the way are still collected.
    pub async fn step(&mut self, ctx: &DispatchContext, allow_work: bool) -> DispatchResult<()> {
        match self.state {
            VmState::AwaitingGuestData if allow_work => self.start(ctx).await,
            VmState::AwaitingGuestData => Ok(()),
            VmState::Running => self.run(ctx).await,
            VmState::AwaitingNextTest => self.feed(ctx, allow_work).await,
            VmState::Error | VmState::Terminated => Ok(()),
        }
    }

    /// Move to `Error` after a failed step.
    pub fn fail(&mut self, err: &DispatchError) {
        warn!("VM node {} failed: {}", self.id(), err);
        self.pending_trace = None;
        if let Err(e) = self.fire(VmEvent::Fail) {
            debug!("VM node {}: {}", self.id(), e);
        }
    }

    /// Stop the node for good. A failed node stays in `Error` so the finish
    /// log still shows it.
    pub fn terminate(&mut self) {
        self.pending_trace = None;
        if self.state != VmState::Error {
            self.state = VmState::Terminated;
        }
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id(),
            node_type: self.handle.node_type,
            state: format!("{:?}", self.state),
            traces: self.traces,
            tests: self.tests,
            errors: self.errors,
        }
    }

    async fn start(&mut self, ctx: &DispatchContext) -> DispatchResult<()> {
        let id = self.id();
        let options = &ctx.options;
        let wants_guest = ctx.guest_data.with(|g| g.is_none()).await;
        let wants_elf = wants_guest && options.trace.print_elf_info;

        let (guest, elf) = {
            let mut node = self.handle.node.acquire().await;
            let conn = node.connection();
            send_config(conn, id, options).await?;
            if options.mode.distributed && options.vm.image.update {
                sync_image(conn, id, Path::new(&options.vm.image.path)).await?;
            }
            conn.write_header(id, PacketType::Commence).await?;

            let guest = if wants_guest {
                conn.write_header(id, PacketType::RequestGuestData).await?;
                let (_, guest): (_, GuestData) = conn.read_serialized(PacketType::TxGuestData).await?;
                Some(guest)
            } else {
                None
            };
            let elf = if wants_elf {
                conn.write_header(id, PacketType::ElfEntries).await?;
                let (_, entries): (_, BTreeMap<AddressRange, ElfEntry>) =
                    conn.read_serialized(PacketType::ElfEntries).await?;
                Some(entries)
            } else {
                None
            };
            (guest, elf)
        };

        if let Some(guest) = guest {
            self.accept_guest_data(ctx, guest).await?;
        }
        if let Some(entries) = elf {
            ctx.trace_pool.with(|p| p.set_elf_entries(entries)).await?;
        }
        info!("VM node {} commenced", id);
        self.fire(VmEvent::Start)
    }

    async fn accept_guest_data(&self, ctx: &DispatchContext, guest: GuestData) -> DispatchResult<()> {
        let path = ctx.root.write_guest_config(&guest)?;
        info!("Guest data for {} stored at {}", guest.executable, path.display());

        let seed = guest.extract_initial_test();
        ctx.guest_data.with(|g| *g = Some(guest)).await;
        ctx.test_pool
            .with(|p| {
                if p.is_seeded() {
                    Ok(())
                } else {
                    p.insert_initial_tc_from_config(seed)
                }
            })
            .await
    }

    async fn run(&mut self, ctx: &DispatchContext) -> DispatchResult<()> {
        if let Some(task) = self.pending_trace.as_mut() {
            let Some(outcome) = task.take() else {
                return Ok(());
            };
            self.pending_trace = None;
            if let Some(path) = outcome? {
                self.queue_trace(ctx, path).await?;
                return self.fire(VmEvent::TraceQueued);
            }
        }

        let status = poll(&self.handle).await?;
        self.fire(VmEvent::Poll)?;
        self.harvest(ctx, status).await?;

        if status.trace_count > 0 {
            self.pending_trace = Some(self.receive_trace(ctx));
        } else if !status.active {
            self.fire(VmEvent::Idle)?;
        }
        Ok(())
    }

    /// Pull the next trace in the background. The task owns the node's
    /// connection until the transfer is done.
    fn receive_trace(&self, ctx: &DispatchContext) -> AsyncTask<Option<PathBuf>> {
        let node = self.handle.node.clone();
        let id = self.id();
        let dest = ctx.root.trace_dir();
        AsyncTask::spawn(format!("trace-from-{}", id), async move {
            let mut node = node.acquire().await;
            let conn = node.connection();
            conn.write_header(id, PacketType::TraceRequest).await?;
            Ok(receive_directory(conn, PacketType::Trace, &dest).await?)
        })
    }

    async fn queue_trace(&mut self, ctx: &DispatchContext, path: PathBuf) -> DispatchResult<()> {
        self.traces += 1;
        let (compress, symbols) = ctx
            .trace_pool
            .with(|p| (p.compresses(), p.elf_symbols()))
            .await;

        let load_path = path.clone();
        let trace = tokio::task::spawn_blocking(move || Trace::load(&load_path, compress))
            .await
            .map_err(|e| DispatchError::Internal(format!("trace load task failed: {}", e)))??;
        let novel = ctx.trace_pool.with(|p| p.insert_trace(trace, path.clone())).await;

        if !novel {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!("Failed to remove redundant trace {}: {}", path.display(), e);
            }
            return Ok(());
        }
        debug!("Queued trace {}", path.display());

        if ctx.options.trace.print_elf_info {
            let info_path = path.clone();
            tokio::task::spawn_blocking(move || symbols.write_info(&info_path))
                .await
                .map_err(|e| DispatchError::Internal(format!("elf info task failed: {}", e)))??;
        }
        Ok(())
    }

    async fn harvest(&mut self, ctx: &DispatchContext, status: NodeStatus) -> DispatchResult<()> {
        if status.error_count > 0 {
            self.errors += harvest_errors(ctx, &self.handle).await? as u64;
        }
        if status.test_case_count > 0 {
            let tests = request_tests(&self.handle, status.test_case_count as usize).await?;
            let accepted = ctx.test_pool.with(|p| p.insert(tests)).await;
            debug!("VM node {} derived {} new test cases", self.id(), accepted);
        }
        Ok(())
    }

    async fn feed(&mut self, ctx: &DispatchContext, allow_work: bool) -> DispatchResult<()> {
        let status = poll(&self.handle).await?;
        self.fire(VmEvent::Poll)?;
        self.harvest(ctx, status).await?;
        if !allow_work {
            return Ok(());
        }

        let tests: Vec<TestCase> = ctx
            .test_pool
            .with(|p| std::iter::from_fn(|| p.next()).take(VM_TEST_MULTIPLIER).collect())
            .await;
        if tests.is_empty() {
            return Ok(());
        }

        {
            let mut node = self.handle.node.acquire().await;
            node.connection()
                .write_serialized(self.id(), PacketType::TestCase, &tests)
                .await?;
        }
        self.tests += tests.len() as u64;
        self.fire(VmEvent::NextTest)
    }
}
