//! Subprocess execution for the external transcoder and separation tools.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::error::{KaraokeError, Result};

/// Run `program` to completion, killing it if `timeout` elapses first.
///
/// A non-zero exit status is reported as `CommandFailed` with the captured
/// stderr attached.
pub fn run_command(program: &str, args: &[String], timeout: Option<Duration>) -> Result<Output> {
    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| spawn_error(program, e))?;
    let started_at = Instant::now();

    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            return validate_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if let Some(limit) = timeout {
            if started_at.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                let stderr = stderr_rx
                    .recv_timeout(Duration::from_millis(100))
                    .unwrap_or_default();
                return Err(KaraokeError::from_command_timeout(
                    rendered,
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    &String::from_utf8_lossy(&stderr),
                ));
            }
        }

        thread::sleep(Duration::from_millis(20));
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn spawn_error(program: &str, e: std::io::Error) -> KaraokeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        KaraokeError::CommandMissing {
            command: program.to_owned(),
        }
    } else {
        KaraokeError::Io(e)
    }
}

fn validate_output(rendered: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    Err(KaraokeError::from_command_failure(
        rendered.to_owned(),
        output.status.code().unwrap_or(-1),
        &String::from_utf8_lossy(&output.stderr),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_owned(), script.to_owned()]
    }

    #[test]
    fn captures_stdout_on_success() {
        let out = run_command("sh", &sh("printf hello"), None).unwrap();
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let err = run_command("sh", &sh("echo boom >&2; exit 3"), None).unwrap_err();
        match err {
            KaraokeError::CommandFailed {
                status,
                stderr_suffix,
                ..
            } => {
                assert_eq!(status, 3);
                assert!(stderr_suffix.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slow_command_times_out() {
        let err =
            run_command("sh", &sh("sleep 5"), Some(Duration::from_millis(100))).unwrap_err();
        assert_eq!(err.code(), "KARAOKE-CMD-TIMEOUT");
    }

    #[test]
    fn missing_program_is_reported() {
        let err = run_command("definitely-not-a-real-binary-xyz", &[], None).unwrap_err();
        assert_eq!(err.code(), "KARAOKE-CMD-MISSING");
    }
}
