use anyhow::Context;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Build a shell invocation for `cmd`: PowerShell on Windows, sh on Unix.
pub fn shell(cmd: &str) -> Command {
    Command::from(blocking_shell(cmd))
}

/// Same as [`shell`], for callers that must stay on a blocking thread.
pub fn blocking_shell(cmd: &str) -> std::process::Command {
    if cfg!(windows) {
        let mut c = std::process::Command::new("powershell.exe");
        c.arg("-NoLogo").arg("-NoProfile").arg("-Command").arg(cmd);
        c
    } else {
        let mut c = std::process::Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
}

/// Pipe `input` through `cmd` and return its stdout.
///
/// Fails on spawn errors, non-zero exit (stderr is included in the message)
/// and, when `timeout_secs` is set, on timeout. A timed-out child is killed.
pub async fn pipe_through(
    cmd: &str,
    input: &str,
    envs: &[(String, String)],
    timeout_secs: Option<u64>,
) -> anyhow::Result<String> {
    let mut c = shell(cmd);
    c.envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = c
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", cmd))?;

    // Feed stdin from its own task so a chatty child can't deadlock us.
    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(input.as_bytes()).await;
        });
    }

    let output = match timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("`{}` timed out after {}s", cmd, secs))?,
        None => child.wait_with_output().await,
    }
    .with_context(|| format!("waiting for `{}` failed", cmd))?;

    finish(cmd, output)
}

/// Blocking counterpart of [`pipe_through`]; no timeout.
pub fn pipe_through_blocking(
    mut c: std::process::Command,
    label: &str,
    input: &str,
) -> anyhow::Result<String> {
    c.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = c
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", label))?;

    let writer = child.stdin.take().map(|mut stdin| {
        let input = input.to_string();
        std::thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        })
    });

    let output = child
        .wait_with_output()
        .with_context(|| format!("waiting for `{}` failed", label))?;
    if let Some(handle) = writer {
        let _ = handle.join();
    }

    finish(label, output)
}

fn finish(label: &str, output: std::process::Output) -> anyhow::Result<String> {
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "`{}` exited with {:?}: {}",
            label,
            output.status.code(),
            err.trim()
        );
    }
    let out = String::from_utf8_lossy(&output.stdout).to_string();
    Ok(trim_newline(out))
}

/// Strip one trailing line ending, as shell tools append one.
pub fn trim_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_single_line_ending() {
        assert_eq!(trim_newline("abc\n".into()), "abc");
        assert_eq!(trim_newline("abc\r\n".into()), "abc");
        assert_eq!(trim_newline("abc\n\n".into()), "abc\n");
        assert_eq!(trim_newline("abc".into()), "abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_text_through_shell() {
        let out = pipe_through("tr a-z A-Z", "hello", &[], Some(5)).await.unwrap();
        assert_eq!(out, "HELLO");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exports_envs_to_command() {
        let envs = vec![("GREETING".to_string(), "hey".to_string())];
        let out = pipe_through("printf '%s' \"$GREETING\"", "", &envs, None)
            .await
            .unwrap();
        assert_eq!(out, "hey");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = pipe_through("echo nope >&2; exit 3", "", &[], None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Some(3)"), "{msg}");
        assert!(msg.contains("nope"), "{msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_slow_commands() {
        let err = pipe_through("sleep 5", "", &[], Some(1)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn blocking_variant_pipes_text() {
        let out = pipe_through_blocking(blocking_shell("cat"), "cat", "same\n").unwrap();
        assert_eq!(out, "same");
    }
}
