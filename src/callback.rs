//! Result delivery to the dispatching caller.
//!
//! Callbacks never run on a pipeline worker. The publication stage hands
//! each report to the [`CallbackReporter`], a small pool of dedicated
//! threads, so a slow or panicking callback cannot stall publication.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::command::CommandMessage;
use crate::error::CommandError;

/// Receives the terminal outcome of a dispatched command.
///
/// # Type Parameters
///
/// * `C` - The command payload type.
/// * `R` - The success result type.
pub trait CommandCallback<C, R>: Send + 'static {
    /// The command completed; `result` is its final result.
    fn on_success(self: Box<Self>, command: &CommandMessage<C>, result: R);

    /// The command failed with `error`.
    fn on_failure(self: Box<Self>, command: &CommandMessage<C>, error: CommandError);

    /// Whether the caller wants to hear about successful completion.
    ///
    /// Fire-and-forget callbacks return `false`; they are still told about
    /// failures.
    fn expects_result(&self) -> bool {
        true
    }
}

/// Callback for fire-and-forget dispatch.
///
/// Successful outcomes are not reported at all; failures are logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCallback;

impl<C: Send + 'static, R: Send + 'static> CommandCallback<C, R> for NoOpCallback {
    fn on_success(self: Box<Self>, _command: &CommandMessage<C>, _result: R) {}

    fn on_failure(self: Box<Self>, command: &CommandMessage<C>, error: CommandError) {
        tracing::warn!(
            command = %command.name(),
            command_id = %command.id(),
            error = %error,
            "fire-and-forget command failed"
        );
    }

    fn expects_result(&self) -> bool {
        false
    }
}

/// Callback adapter for a closure receiving the outcome.
pub struct FnCallback<F>(F);

impl<F> FnCallback<F> {
    /// Wrap `f`, called exactly once with the outcome.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<C, R, F> CommandCallback<C, R> for FnCallback<F>
where
    C: 'static,
    R: 'static,
    F: FnOnce(Result<R, CommandError>) + Send + 'static,
{
    fn on_success(self: Box<Self>, _command: &CommandMessage<C>, result: R) {
        (self.0)(Ok(result))
    }

    fn on_failure(self: Box<Self>, _command: &CommandMessage<C>, error: CommandError) {
        (self.0)(Err(error))
    }
}

/// Callback that completes a `oneshot` channel.
///
/// Backs [`CommandPipeline::dispatch_and_wait`](crate::CommandPipeline::dispatch_and_wait).
#[derive(Debug)]
pub struct FutureCallback<R> {
    reply: oneshot::Sender<Result<R, CommandError>>,
}

impl<R> FutureCallback<R> {
    /// Create the callback and the receiver its outcome arrives on.
    pub fn new() -> (Self, oneshot::Receiver<Result<R, CommandError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }
}

impl<C, R> CommandCallback<C, R> for FutureCallback<R>
where
    C: 'static,
    R: Send + 'static,
{
    fn on_success(self: Box<Self>, _command: &CommandMessage<C>, result: R) {
        // If the receiver was dropped, the caller no longer cares.
        let _ = self.reply.send(Ok(result));
    }

    fn on_failure(self: Box<Self>, _command: &CommandMessage<C>, error: CommandError) {
        let _ = self.reply.send(Err(error));
    }
}

/// A queued callback invocation.
type Report = Box<dyn FnOnce() + Send>;

/// Cloneable handle used by the pipeline stages to schedule reports.
#[derive(Clone)]
pub(crate) struct ReportSender {
    tx: mpsc::UnboundedSender<Report>,
}

impl ReportSender {
    /// Schedule delivery of `outcome` to `callback`.
    pub(crate) fn report<C, R>(
        &self,
        command: CommandMessage<C>,
        callback: Box<dyn CommandCallback<C, R>>,
        outcome: Result<R, CommandError>,
    ) where
        C: Send + 'static,
        R: Send + 'static,
    {
        let job: Report = Box::new(move || match outcome {
            Ok(result) => callback.on_success(&command, result),
            Err(error) => callback.on_failure(&command, error),
        });
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            // Reporter pool already gone (shutdown race): deliver inline so
            // the outcome is not lost.
            tracing::debug!("callback reporter closed, delivering inline");
            run_report(job);
        }
    }
}

/// Pool of threads that run callbacks.
pub(crate) struct CallbackReporter {
    sender: ReportSender,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackReporter {
    /// Start `threads` reporter threads (at least one).
    pub(crate) fn start(threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Report>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let worker = std::thread::Builder::new()
                .name(format!("callback-reporter-{i}"))
                .spawn(move || run_reporter(i, rx))?;
            workers.push(worker);
        }
        Ok(Self {
            sender: ReportSender { tx },
            workers,
        })
    }

    /// A handle for scheduling reports.
    pub(crate) fn sender(&self) -> ReportSender {
        self.sender.clone()
    }

    /// Stop accepting reports once every sender is dropped, and wait for
    /// queued reports to be delivered.
    pub(crate) fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("callback reporter thread panicked");
            }
        }
    }
}

fn run_reporter(index: usize, rx: Arc<Mutex<mpsc::UnboundedReceiver<Report>>>) {
    tracing::debug!(worker = index, "callback reporter started");
    loop {
        let job = {
            let mut rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.blocking_recv()
        };
        match job {
            Some(job) => run_report(job),
            // Channel closed: every sender dropped.
            None => break,
        }
    }
    tracing::debug!(worker = index, "callback reporter stopped");
}

fn run_report(job: Report) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("command callback panicked");
    }
}
