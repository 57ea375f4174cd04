//! Result relay: folds subprocess notifications into exactly one outcome.
//!
//! The relay starts out holding the host's [`Completion`]. The first terminal
//! notification takes it and resolves it; every notification after that is
//! logged and ignored. Since resolving consumes the completion, a second
//! resolution cannot be expressed.

use flagrelay_core::{FlagrelayError, Outcome, Resolution};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// The pair of completion callbacks the host provides for one invocation.
pub trait Completion: Send {
    fn succeed(self, value: Value);
    fn fail(self, error: FlagrelayError);
}

impl Completion for oneshot::Sender<Outcome> {
    fn succeed(self, value: Value) {
        if self.send(Outcome::Success(value)).is_err() {
            debug!("Outcome receiver dropped before success was delivered");
        }
    }

    fn fail(self, error: FlagrelayError) {
        if self.send(Outcome::Failure(error)).is_err() {
            debug!("Outcome receiver dropped before failure was delivered");
        }
    }
}

/// Completion built from two closures, mirroring a succeed/fail callback pair.
pub struct Callbacks<S, F> {
    on_success: S,
    on_failure: F,
}

impl<S, F> Callbacks<S, F>
where
    S: FnOnce(Value) + Send,
    F: FnOnce(FlagrelayError) + Send,
{
    pub fn new(on_success: S, on_failure: F) -> Self {
        Self {
            on_success,
            on_failure,
        }
    }
}

impl<S, F> Completion for Callbacks<S, F>
where
    S: FnOnce(Value) + Send,
    F: FnOnce(FlagrelayError) + Send,
{
    fn succeed(self, value: Value) {
        (self.on_success)(value)
    }

    fn fail(self, error: FlagrelayError) {
        (self.on_failure)(error)
    }
}

/// Signals observed from a running subprocess.
#[derive(Debug)]
pub enum Notification {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(Option<i32>),
    Deadline(Duration),
}

/// What a notification did to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Pending,
    Resolved(Resolution),
    Ignored,
}

/// Stdout kept before a result is found, unless configured otherwise.
pub const DEFAULT_OUTPUT_LIMIT: usize = flagrelay_core::DEFAULT_MAX_OUTPUT_BYTES;

pub struct Relay<C> {
    completion: Option<C>,
    resolution: Option<Resolution>,
    stdout: OutputBuffer,
    output_limit: usize,
}

impl<C: Completion> Relay<C> {
    pub fn new(completion: C) -> Self {
        Self::with_output_limit(completion, DEFAULT_OUTPUT_LIMIT)
    }

    pub fn with_output_limit(completion: C, output_limit: usize) -> Self {
        Self {
            completion: Some(completion),
            resolution: None,
            stdout: OutputBuffer::default(),
            output_limit,
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn notify(&mut self, notification: Notification) -> Transition {
        if self.is_resolved() {
            debug!(?notification, "Ignoring notification after resolution");
            return Transition::Ignored;
        }

        match notification {
            Notification::Stdout(chunk) => self.on_stdout(&chunk),
            Notification::Stderr(chunk) => {
                let message = String::from_utf8_lossy(&chunk).into_owned();
                warn!(message = %message.trim_end(), "stderr");
                self.fail(FlagrelayError::SubprocessReported(message))
            }
            Notification::Exit(code) => self.on_exit(code),
            Notification::Deadline(after) => self.fail(FlagrelayError::TimedOut(after)),
        }
    }

    /// Resolve with an error raised before any subprocess signal, e.g. bad
    /// input or a failed spawn.
    pub fn reject(&mut self, error: FlagrelayError) -> Transition {
        if self.is_resolved() {
            debug!(error = %error, "Ignoring rejection after resolution");
            return Transition::Ignored;
        }
        self.fail(error)
    }

    fn on_stdout(&mut self, chunk: &[u8]) -> Transition {
        if self.stdout.len() + chunk.len() > self.output_limit {
            return self.fail(FlagrelayError::OutputParseFailure(format!(
                "output exceeded {} bytes without a complete JSON value",
                self.output_limit
            )));
        }

        if !self.stdout.extend(chunk) {
            return Transition::Pending;
        }

        match scan_json(self.stdout.as_slice(), false) {
            Scan::Complete(value) => {
                info!(message = %value, "stdout");
                self.succeed(value)
            }
            Scan::Incomplete => Transition::Pending,
            Scan::Invalid(e) => self.fail(FlagrelayError::OutputParseFailure(e.to_string())),
        }
    }

    fn on_exit(&mut self, code: Option<i32>) -> Transition {
        match code {
            Some(0) if self.stdout.has_content() => {
                match scan_json(self.stdout.as_slice(), true) {
                    Scan::Complete(value) => {
                        info!(message = %value, "stdout");
                        self.succeed(value)
                    }
                    Scan::Incomplete => self.fail(FlagrelayError::OutputParseFailure(
                        "output ended before a complete JSON value".to_string(),
                    )),
                    Scan::Invalid(e) => {
                        self.fail(FlagrelayError::OutputParseFailure(e.to_string()))
                    }
                }
            }
            Some(0) => self.fail(FlagrelayError::NoResults),
            other => self.fail(FlagrelayError::SubprocessFailed { code: other }),
        }
    }

    fn succeed(&mut self, value: Value) -> Transition {
        match self.completion.take() {
            Some(completion) => {
                self.resolution = Some(Resolution::Success);
                completion.succeed(value);
                Transition::Resolved(Resolution::Success)
            }
            None => Transition::Ignored,
        }
    }

    fn fail(&mut self, error: FlagrelayError) -> Transition {
        match self.completion.take() {
            Some(completion) => {
                self.resolution = Some(Resolution::Failure);
                completion.fail(error);
                Transition::Resolved(Resolution::Failure)
            }
            None => Transition::Ignored,
        }
    }
}

/// Buffered stdout plus enough lexical state to tell when a top-level
/// object, array or string has closed, so the buffer is only parsed once
/// per candidate value instead of once per chunk.
#[derive(Debug, Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    first: Option<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    closed: bool,
}

impl OutputBuffer {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn has_content(&self) -> bool {
        self.first.is_some()
    }

    /// Append a chunk; returns whether the buffer is worth parsing now.
    fn extend(&mut self, chunk: &[u8]) -> bool {
        let was_closed = self.closed;
        self.bytes.extend_from_slice(chunk);

        for &byte in chunk {
            if self.closed {
                break;
            }
            match self.first {
                None if byte.is_ascii_whitespace() => {}
                None => {
                    self.first = Some(byte);
                    match byte {
                        b'{' | b'[' => self.depth = 1,
                        b'"' => self.in_string = true,
                        _ => {}
                    }
                }
                Some(b'{' | b'[' | b'"') => self.track(byte),
                Some(_) => {}
            }
        }

        match self.first {
            None => false,
            // Scalars are short; let the parser decide.
            Some(first) if !matches!(first, b'{' | b'[' | b'"') => true,
            Some(_) => self.closed && !was_closed,
        }
    }

    fn track(&mut self, byte: u8) {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                if self.depth == 0 {
                    self.closed = true;
                }
            }
            return;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    self.closed = true;
                }
            }
            _ => {}
        }
    }
}

enum Scan {
    Complete(Value),
    Incomplete,
    Invalid(serde_json::Error),
}

/// Look for the first complete JSON value in the buffered output. Anything
/// after it is ignored. Until `at_end`, a number touching the end of the
/// buffer may still grow, so it does not count as complete.
fn scan_json(buffer: &[u8], at_end: bool) -> Scan {
    let mut stream = serde_json::Deserializer::from_slice(buffer).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) if value.is_number() && !at_end && stream.byte_offset() == buffer.len() => {
            Scan::Incomplete
        }
        Some(Ok(value)) => Scan::Complete(value),
        Some(Err(e)) if e.is_eof() => Scan::Incomplete,
        Some(Err(e)) => Scan::Invalid(e),
        None => Scan::Incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Calls {
        successes: Vec<Value>,
        failures: Vec<String>,
    }

    fn recording_relay() -> (
        Relay<impl Completion>,
        Arc<Mutex<Calls>>,
    ) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let on_success = Arc::clone(&calls);
        let on_failure = Arc::clone(&calls);
        let relay = Relay::new(Callbacks::new(
            move |value| on_success.lock().unwrap().successes.push(value),
            move |error: FlagrelayError| on_failure.lock().unwrap().failures.push(error.to_string()),
        ));
        (relay, calls)
    }

    #[test]
    fn test_stdout_json_resolves_success_once() {
        let (mut relay, calls) = recording_relay();

        let transition = relay.notify(Notification::Stdout(br#"{"ok":true}"#.to_vec()));
        assert_eq!(transition, Transition::Resolved(Resolution::Success));

        assert_eq!(relay.notify(Notification::Exit(Some(0))), Transition::Ignored);
        assert_eq!(
            relay.notify(Notification::Stderr(b"late".to_vec())),
            Transition::Ignored
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.successes, vec![json!({"ok": true})]);
        assert!(calls.failures.is_empty());
    }

    #[test]
    fn test_stderr_first_resolves_failure() {
        let (mut relay, calls) = recording_relay();

        let transition = relay.notify(Notification::Stderr(b"bad flag\n".to_vec()));
        assert_eq!(transition, Transition::Resolved(Resolution::Failure));
        relay.notify(Notification::Stdout(br#"{"ok":true}"#.to_vec()));

        let calls = calls.lock().unwrap();
        assert!(calls.successes.is_empty());
        assert_eq!(calls.failures, vec!["bad flag\n".to_string()]);
    }

    #[test]
    fn test_exit_zero_without_output_is_no_results() {
        let (mut relay, calls) = recording_relay();

        relay.notify(Notification::Exit(Some(0)));

        assert_eq!(relay.resolution(), Some(Resolution::Failure));
        assert_eq!(calls.lock().unwrap().failures, vec!["No results".to_string()]);
    }

    #[test]
    fn test_nonzero_exit_carries_code() {
        let (tx, mut rx) = oneshot::channel();
        let mut relay = Relay::new(tx);

        relay.notify(Notification::Exit(Some(3)));

        match rx.try_recv().unwrap() {
            Outcome::Failure(FlagrelayError::SubprocessFailed { code }) => {
                assert_eq!(code, Some(3))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_json_split_across_chunks() {
        let (mut relay, calls) = recording_relay();

        assert_eq!(
            relay.notify(Notification::Stdout(br#"{"items":[1,"#.to_vec())),
            Transition::Pending
        );
        assert_eq!(
            relay.notify(Notification::Stdout(b"2]}\n".to_vec())),
            Transition::Resolved(Resolution::Success)
        );

        assert_eq!(calls.lock().unwrap().successes, vec![json!({"items": [1, 2]})]);
    }

    #[test]
    fn test_whitespace_only_stdout_stays_pending() {
        let (mut relay, _calls) = recording_relay();
        assert_eq!(
            relay.notify(Notification::Stdout(b"\n  ".to_vec())),
            Transition::Pending
        );
        assert!(!relay.is_resolved());
    }

    #[test]
    fn test_invalid_stdout_resolves_parse_failure() {
        let (tx, mut rx) = oneshot::channel();
        let mut relay = Relay::new(tx);

        relay.notify(Notification::Stdout(b"not json\n".to_vec()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Outcome::Failure(FlagrelayError::OutputParseFailure(_))
        ));
    }

    #[test]
    fn test_truncated_stdout_then_clean_exit() {
        let (tx, mut rx) = oneshot::channel();
        let mut relay = Relay::new(tx);

        relay.notify(Notification::Stdout(br#"{"ok":"#.to_vec()));
        relay.notify(Notification::Exit(Some(0)));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Outcome::Failure(FlagrelayError::OutputParseFailure(_))
        ));
    }

    #[test]
    fn test_deadline_resolves_timeout() {
        let (tx, mut rx) = oneshot::channel();
        let mut relay = Relay::new(tx);

        relay.notify(Notification::Deadline(Duration::from_secs(1)));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Outcome::Failure(FlagrelayError::TimedOut(_))
        ));
    }

    #[test]
    fn test_reject_after_resolution_is_ignored() {
        let (mut relay, calls) = recording_relay();

        relay.reject(FlagrelayError::MalformedInput("empty".to_string()));
        assert_eq!(
            relay.reject(FlagrelayError::NoResults),
            Transition::Ignored
        );

        assert_eq!(calls.lock().unwrap().failures.len(), 1);
    }

    #[test]
    fn test_number_split_across_chunks_waits_for_exit() {
        let (mut relay, calls) = recording_relay();

        assert_eq!(relay.notify(Notification::Stdout(b"12".to_vec())), Transition::Pending);
        assert_eq!(relay.notify(Notification::Stdout(b"3".to_vec())), Transition::Pending);
        assert_eq!(
            relay.notify(Notification::Exit(Some(0))),
            Transition::Resolved(Resolution::Success)
        );

        assert_eq!(calls.lock().unwrap().successes, vec![json!(123)]);
    }

    #[test]
    fn test_number_followed_by_newline_is_complete() {
        let (mut relay, calls) = recording_relay();

        assert_eq!(
            relay.notify(Notification::Stdout(b"42\n".to_vec())),
            Transition::Resolved(Resolution::Success)
        );
        assert_eq!(calls.lock().unwrap().successes, vec![json!(42)]);
    }

    #[test]
    fn test_output_over_limit_fails() {
        let (tx, mut rx) = oneshot::channel();
        let mut relay = Relay::with_output_limit(tx, 8);

        assert_eq!(relay.notify(Notification::Stdout(b"[1,2,".to_vec())), Transition::Pending);
        relay.notify(Notification::Stdout(b"3,4,5]".to_vec()));

        match rx.try_recv().unwrap() {
            Outcome::Failure(FlagrelayError::OutputParseFailure(message)) => {
                assert!(message.contains("exceeded 8 bytes"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_buffer_only_ready_when_top_level_closes() {
        let mut buffer = OutputBuffer::default();

        assert!(!buffer.extend(br#"  [{"a":1},"#));
        assert!(!buffer.extend(br#"{"b":"]}\"}"},"#));
        assert!(buffer.extend(br#"{"c":[2]}]"#));
        assert!(!buffer.extend(b"\ntrailing"));
    }

    #[test]
    fn test_large_output_in_many_chunks() {
        let (mut relay, calls) = recording_relay();
        let items: Vec<Value> = (0..20_000).map(|i| json!({"id": i, "tags": ["x", "y"]})).collect();
        let output = serde_json::to_vec(&json!({ "items": items })).unwrap();

        let mut chunks = output.chunks(8 * 1024).peekable();
        while let Some(chunk) = chunks.next() {
            let transition = relay.notify(Notification::Stdout(chunk.to_vec()));
            if chunks.peek().is_some() {
                assert_eq!(transition, Transition::Pending);
            } else {
                assert_eq!(transition, Transition::Resolved(Resolution::Success));
            }
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.successes[0]["items"].as_array().unwrap().len(), 20_000);
    }
}
