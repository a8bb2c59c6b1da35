//! The server event loop.
//!
//! A single thread drives the whole lifecycle: create the server and
//! queue, bind, start, then loop accept → read → dispatch → respond until
//! a cooperative interrupt fires, the wall-clock duration elapses, or the
//! accept machinery fails. One call is handled at a time, which keeps
//! every buffer's lifetime bracketed by two queue events and makes
//! cleanup deterministic.

use crate::dispatch::DispatchTable;
use crate::error::ServerError;
use crate::hooks::{guarded, panic_message, ExitGuard, ServerHooks};

use bytes::Bytes;
use rpc_core::{
    slot, AcceptSlot, CancelSlot, CompletionQueue, Event, Metadata, MessageSlot, Runtime, Server,
    ServerCall, ServerOp, Status,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TAG_ACCEPT: u64 = 1;
const TAG_READ: u64 = 2;
const TAG_SEND: u64 = 3;
const TAG_SHUTDOWN: u64 = 99;

/// Knobs for one `run()` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this long; zero means run until interrupted.
    pub duration: Duration,
    /// Cooperative interrupt, checked once per loop iteration.
    pub interrupt: Option<Arc<AtomicBool>>,
    /// How long each queue wait blocks between checks. Zero picks the
    /// 1-second default.
    pub queue_poll: Duration,
    /// How long to wait for the shutdown notification. Zero picks the
    /// 5-second default.
    pub shutdown_grace: Duration,
}

impl RunOptions {
    fn queue_poll(&self) -> Duration {
        if self.queue_poll.is_zero() {
            Duration::from_secs(1)
        } else {
            self.queue_poll
        }
    }

    fn shutdown_grace(&self) -> Duration {
        if self.shutdown_grace.is_zero() {
            Duration::from_secs(5)
        } else {
            self.shutdown_grace
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// The call being handled, between its accept and send completions.
struct ActiveCall {
    call: ServerCall,
    payload: MessageSlot,
    close: CancelSlot,
}

/// Bind `bind_addr`, serve `dispatch` until an exit condition, and tear
/// everything down. Hooks fire at every lifecycle boundary; the bound
/// port (ephemeral included) is surfaced through `on_bind` before any
/// accept can complete.
pub fn run(
    dispatch: &DispatchTable,
    bind_addr: &str,
    hooks: &dyn ServerHooks,
    options: &RunOptions,
) -> Result<(), ServerError> {
    let _exit = ExitGuard::new(hooks);

    let runtime = Runtime::acquire()?;
    let mut server = Server::new(&runtime);
    guarded("server_create", || hooks.on_server_create());

    let mut cq = CompletionQueue::new();
    guarded("queue_create", || hooks.on_queue_create());
    server.register_queue(&cq);

    let port = match server.add_insecure_port(bind_addr) {
        Ok(port) => {
            guarded("bind", || hooks.on_bind(port));
            port
        }
        Err(source) => {
            guarded("bind", || hooks.on_bind(0));
            return Err(ServerError::Bind {
                addr: bind_addr.to_string(),
                source,
            });
        }
    };
    server.start()?;
    guarded("server_start", || hooks.on_server_start());
    tracing::info!(port, methods = dispatch.len(), "server serving");

    let mut accept_slot: AcceptSlot = slot();
    let mut active: Option<ActiveCall> = None;
    let mut done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();

    let run_deadline =
        (!options.duration.is_zero()).then(|| Instant::now() + options.duration);

    guarded("run", || hooks.on_run());
    while !done {
        if options.interrupted() {
            tracing::info!("interrupt detected, initiating shutdown");
            break;
        }
        if run_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::info!("run duration reached, initiating shutdown");
            break;
        }

        match cq.next(options.queue_poll()) {
            Event::Timeout => continue,
            Event::Shutdown => break,
            Event::Op { tag: TAG_ACCEPT, success } => {
                if !success {
                    tracing::debug!("accept failed, re-requesting");
                    accept_slot = slot();
                    done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();
                    continue;
                }
                let taken = accept_slot.lock().take();
                let call = match taken {
                    Some(call) => call,
                    None => {
                        accept_slot = slot();
                        done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();
                        continue;
                    }
                };
                tracing::trace!(method = %call.details().method, "call accepted");

                let payload: MessageSlot = slot();
                let read = call.start_batch(
                    vec![
                        ServerOp::SendInitialMetadata(Metadata::new()),
                        ServerOp::RecvMessage(payload.clone()),
                    ],
                    TAG_READ,
                );
                match read {
                    Ok(()) => {
                        active = Some(ActiveCall {
                            call,
                            payload,
                            close: slot(),
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to start read batch");
                        drop(call);
                        accept_slot = slot();
                        done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();
                    }
                }
            }
            Event::Op { tag: TAG_READ, success } => {
                let Some(current) = active.as_mut() else {
                    tracing::warn!("read completion without an active call");
                    continue;
                };
                let (status, response) = if success {
                    respond_to(dispatch, &current.call, current.payload.lock().take())
                } else {
                    (
                        Status::cancelled("failed to receive client message or client cancelled"),
                        None,
                    )
                };

                let close: CancelSlot = slot();
                let mut ops = vec![ServerOp::RecvCloseOnServer(close.clone())];
                if status.is_ok() {
                    if let Some(response) = response {
                        ops.push(ServerOp::SendMessage(response));
                    }
                }
                if !status.is_ok() {
                    tracing::debug!(
                        method = %current.call.details().method,
                        code = %status.code(),
                        details = status.details(),
                        "responding with error status"
                    );
                }
                ops.push(ServerOp::SendStatusFromServer(status));

                current.close = close;
                if let Err(error) = current.call.start_batch(ops, TAG_SEND) {
                    tracing::warn!(%error, "failed to start send batch");
                    active = None;
                    accept_slot = slot();
                    done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();
                }
            }
            Event::Op { tag: TAG_SEND, success } => {
                if let Some(finished) = active.take() {
                    let cancelled = finished.close.lock().take().unwrap_or(false);
                    tracing::trace!(
                        method = %finished.call.details().method,
                        success,
                        cancelled,
                        "call finished"
                    );
                }
                accept_slot = slot();
                done = server.request_call(&accept_slot, TAG_ACCEPT).is_err();
            }
            Event::Op { tag, .. } => {
                tracing::warn!(tag, "unexpected completion tag");
            }
        }
    }

    shutdown(&mut server, &mut cq, hooks, options.shutdown_grace());
    drop(active);
    drop(server);
    drain(&mut cq);
    drop(runtime);
    guarded("stopped", || hooks.on_stopped());
    Ok(())
}

/// Resolve the handler for an accepted call and produce the status and
/// optional response payload.
fn respond_to(
    dispatch: &DispatchTable,
    call: &ServerCall,
    payload: Option<Bytes>,
) -> (Status, Option<Bytes>) {
    let Some(payload) = payload else {
        return (
            Status::invalid_argument("client did not send a message payload for unary call"),
            None,
        );
    };
    let path = call.details().method.as_str();
    let Some(handler) = dispatch.lookup(path) else {
        return (
            Status::unimplemented(format!("Method not implemented or not found: {}", path)),
            None,
        );
    };
    tracing::trace!(method = %path, bytes = payload.len(), "dispatching to handler");
    match catch_unwind(AssertUnwindSafe(|| handler(&payload, call.metadata()))) {
        Ok(Ok(response)) => (Status::ok(), Some(response)),
        Ok(Err(error)) => (Status::internal(error.to_string()), None),
        Err(panic) => (Status::internal(panic_message(&panic)), None),
    }
}

fn shutdown(server: &mut Server, cq: &mut CompletionQueue, hooks: &dyn ServerHooks, grace: Duration) {
    guarded("shutdown", || hooks.on_shutdown());
    server.shutdown_and_notify(TAG_SHUTDOWN);

    let deadline = Instant::now() + grace;
    loop {
        match cq.next_before(deadline) {
            Event::Op { tag: TAG_SHUTDOWN, .. } => break,
            Event::Op { tag, .. } => {
                tracing::trace!(tag, "draining stale completion during shutdown");
            }
            Event::Timeout => {
                tracing::warn!("no shutdown notification within grace period");
                break;
            }
            Event::Shutdown => break,
        }
    }
    server.cancel_all_calls();
}

fn drain(cq: &mut CompletionQueue) {
    cq.shutdown();
    loop {
        match cq.next(Duration::ZERO) {
            Event::Shutdown => break,
            _ => {}
        }
    }
}

/// Bind and start a server without any dispatch, idle until interrupted
/// or `duration` elapses, then shut down cleanly. Returns the bound port.
///
/// Useful for validating an address and surfacing the ephemeral port
/// without installing handlers.
pub fn serve_probe(
    bind_addr: &str,
    duration: Duration,
    interrupt: Option<Arc<AtomicBool>>,
    hooks: &dyn ServerHooks,
) -> Result<u16, ServerError> {
    let _exit = ExitGuard::new(hooks);

    let runtime = Runtime::acquire()?;
    let mut server = Server::new(&runtime);
    guarded("server_create", || hooks.on_server_create());
    let mut cq = CompletionQueue::new();
    guarded("queue_create", || hooks.on_queue_create());
    server.register_queue(&cq);

    let port = match server.add_insecure_port(bind_addr) {
        Ok(port) => {
            guarded("bind", || hooks.on_bind(port));
            port
        }
        Err(source) => {
            guarded("bind", || hooks.on_bind(0));
            return Err(ServerError::Bind {
                addr: bind_addr.to_string(),
                source,
            });
        }
    };
    server.start()?;
    guarded("server_start", || hooks.on_server_start());
    tracing::info!(port, "probe server up");

    guarded("run", || hooks.on_run());
    let deadline = (!duration.is_zero()).then(|| Instant::now() + duration);
    loop {
        if interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    shutdown(&mut server, &mut cq, hooks, Duration::from_secs(5));
    drop(server);
    drain(&mut cq);
    drop(runtime);
    guarded("stopped", || hooks.on_stopped());
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = RunOptions::default();
        assert_eq!(options.queue_poll(), Duration::from_secs(1));
        assert_eq!(options.shutdown_grace(), Duration::from_secs(5));
        assert!(options.duration.is_zero());
        assert!(!options.interrupted());
    }

    #[test]
    fn interrupt_flag_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let options = RunOptions {
            interrupt: Some(flag.clone()),
            ..Default::default()
        };
        assert!(!options.interrupted());
        flag.store(true, Ordering::Relaxed);
        assert!(options.interrupted());
    }

    #[test]
    fn bind_failure_reports_port_zero_to_hook() {
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Recording {
            ports: Mutex<Vec<u16>>,
            exited: Mutex<bool>,
        }
        impl ServerHooks for Recording {
            fn on_bind(&self, port: u16) {
                self.ports.lock().push(port);
            }
            fn on_exit(&self) {
                *self.exited.lock() = true;
            }
        }

        // Hold the port so the bind fails.
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap().to_string();

        let hooks = Recording::default();
        let dispatch = DispatchTable::new();
        let err = run(&dispatch, &addr, &hooks, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(*hooks.ports.lock(), vec![0]);
        assert!(*hooks.exited.lock(), "exit hook fires on the error path");
    }

    #[test]
    fn probe_runs_for_duration_and_returns_port() {
        let port = serve_probe(
            "127.0.0.1:0",
            Duration::from_millis(100),
            None,
            &crate::hooks::NoopHooks,
        )
        .unwrap();
        assert!(port > 0);
    }
}
