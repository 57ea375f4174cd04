use crate::args::build_arguments;
use crate::process::spawn_subprocess;
use crate::relay::{Completion, Notification, Relay};
use chrono::Utc;
use flagrelay_core::{
    ArgumentList, Event, FlagrelayError, HandlerConfig, InvocationReport, Outcome, Result,
};
use flagrelay_parser::parse_body;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 8 * 1024;

/// Handles one event per call: builds the flags, launches the executable and
/// relays its output as a single outcome.
#[derive(Clone)]
pub struct RequestHandler {
    config: Arc<HandlerConfig>,
}

impl RequestHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// The argv the executable would receive for this event.
    pub fn prepare(&self, event: &Event) -> Result<ArgumentList> {
        let tokens = parse_body(&event.body)?;
        Ok(build_arguments(
            &self.config.json_flag,
            &tokens,
            self.config.flag_order,
        ))
    }

    /// Run the event and wait for its outcome.
    ///
    /// Returns as soon as the outcome is known; reaping the subprocess carries
    /// on in the background.
    pub async fn handle(&self, event: &Event) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let handler = self.clone();
        let event = event.clone();

        tokio::spawn(async move {
            handler.run(&event, tx).await;
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failure(FlagrelayError::Abandoned),
        }
    }

    /// Run the event, resolving `completion` exactly once, and return once the
    /// subprocess has exited or been killed.
    pub async fn run<C: Completion>(&self, event: &Event, completion: C) -> InvocationReport {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let start_instant = Instant::now();
        let mut relay = Relay::with_output_limit(completion, self.config.max_output_bytes);

        info!(invocation_id = %id, body = %event.body, "Received event");

        let (arguments, exit_code) = match self.prepare(event) {
            Ok(arguments) => {
                info!(invocation_id = %id, args = ?arguments.as_slice(), "Constructed argument list");
                let exit_code = self.execute(id, &arguments, &mut relay).await;
                (arguments, exit_code)
            }
            Err(e) => {
                warn!(invocation_id = %id, error = %e, "Rejecting malformed event");
                relay.reject(e);
                (ArgumentList::new(), None)
            }
        };

        let report = InvocationReport {
            id,
            arguments,
            resolution: relay.resolution(),
            exit_code,
            duration_ms: start_instant.elapsed().as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        };

        info!(
            invocation_id = %id,
            resolution = ?report.resolution,
            exit_code = ?report.exit_code,
            duration_ms = report.duration_ms,
            "Invocation completed"
        );

        report
    }

    async fn execute<C: Completion>(
        &self,
        id: Uuid,
        arguments: &ArgumentList,
        relay: &mut Relay<C>,
    ) -> Option<i32> {
        let mut child = match spawn_subprocess(&self.config, arguments) {
            Ok(child) => child,
            Err(e) => {
                warn!(invocation_id = %id, error = %e, "Subprocess failed to start");
                relay.reject(e);
                return None;
            }
        };

        match supervise(&mut child, relay, self.config.timeout()).await {
            Ok(code) => code,
            Err(e) => {
                warn!(invocation_id = %id, error = %e, "Lost track of subprocess");
                relay.reject(e);
                None
            }
        }
    }
}

/// Feed pipe and exit notifications to the relay until the child exits or
/// the deadline passes. Pipe output is always taken before the exit, and both
/// pipes are drained before the exit is reported.
async fn supervise<C: Completion>(
    child: &mut Child,
    relay: &mut Relay<C>,
    timeout: Duration,
) -> Result<Option<i32>> {
    let mut pipes = Pipes::new(child.stdout.take(), child.stderr.take());

    let deadline = tokio::time::Instant::now() + timeout;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            notification = pipes.next(), if pipes.is_open() => {
                if let Some(notification) = notification {
                    relay.notify(notification);
                }
            }

            status = child.wait() => {
                let status = status?;

                let drained = tokio::time::timeout_at(deadline, async {
                    while let Some(notification) = pipes.next().await {
                        relay.notify(notification);
                    }
                })
                .await;
                if drained.is_err() {
                    debug!("Output pipes still open after exit; not waiting for them");
                }

                let code = status.code();
                info!(exit_code = ?code, "exit");
                relay.notify(Notification::Exit(code));
                return Ok(code);
            }

            () = &mut sleep => {
                warn!(timeout = ?timeout, "Subprocess deadline reached; killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill subprocess");
                }
                relay.notify(Notification::Deadline(timeout));
                return Ok(None);
            }
        }
    }
}

/// The child's stdout and stderr. When both have data waiting, stderr is
/// read first: the two pipes carry no ordering between them, and a failure
/// written first must not lose to a result written after it.
struct Pipes {
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    out_buf: Vec<u8>,
    err_buf: Vec<u8>,
}

impl Pipes {
    fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout,
            stderr,
            out_buf: vec![0u8; READ_CHUNK],
            err_buf: vec![0u8; READ_CHUNK],
        }
    }

    fn is_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Next chunk from either pipe; `None` once both have closed.
    async fn next(&mut self) -> Option<Notification> {
        loop {
            tokio::select! {
                biased;

                chunk = read_chunk(&mut self.stderr, &mut self.err_buf), if self.stderr.is_some() => match chunk {
                    Some(chunk) => return Some(Notification::Stderr(chunk)),
                    None => self.stderr = None,
                },

                chunk = read_chunk(&mut self.stdout, &mut self.out_buf), if self.stdout.is_some() => match chunk {
                    Some(chunk) => return Some(Notification::Stdout(chunk)),
                    None => self.stdout = None,
                },

                else => return None,
            }
        }
    }
}

/// Read the next chunk from an optional pipe. `None` means end of stream
/// (or a broken pipe), after which the pipe is not polled again.
async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(e) => {
            debug!(error = %e, "Pipe read failed");
            None
        }
    }
}
