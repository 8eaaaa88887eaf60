//! Remote-host plumbing: ssh file access and rsync directory
//! synchronization.
//!
//! Clusters reachable only through a login node tunnel every file operation
//! through ssh. When the configured input directory lives on shared storage
//! (or the target host is this host), operations short-circuit to local
//! filesystem calls.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::{BatchError, BatchResult};
use crate::system::{BatchConfig, run_command};

/// Exit code ssh itself returns when the connection fails.
const SSH_FAIL: i32 = 255;

/// Read a file, possibly on a remote host.
pub async fn read_file(
    config: &BatchConfig,
    host: Option<&str>,
    path: &Path,
) -> BatchResult<String> {
    match remote_host(config, host) {
        None => Ok(fs::read_to_string(path).await?),
        Some(host) => {
            let output = run_command(
                "ssh",
                &ssh_args(config, host, &format!("cat {}", path.display())),
                config.ssh_timeout,
            )
            .await?;
            check_ssh_output(host, "ssh", &output)?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
    }
}

/// Write a file, possibly on a remote host, overwriting any previous
/// contents.
pub async fn write_file(
    config: &BatchConfig,
    host: Option<&str>,
    path: &Path,
    content: &str,
) -> BatchResult<()> {
    match remote_host(config, host) {
        None => Ok(fs::write(path, content).await?),
        Some(host) => {
            // printf the content through the tunnel; job records are small
            let command = format!("printf '%s' {} > {}", shell_quote(content), path.display());
            let output = run_command(
                "ssh",
                &ssh_args(config, host, &command),
                config.ssh_timeout,
            )
            .await?;
            check_ssh_output(host, "ssh", &output)
        }
    }
}

/// Create a directory, possibly on a remote host. Succeeds if it already
/// exists.
pub async fn make_dir(config: &BatchConfig, host: Option<&str>, dir: &Path) -> BatchResult<()> {
    match remote_host(config, host) {
        None => Ok(fs::create_dir_all(dir).await?),
        Some(host) => {
            let command = format!("mkdir -p {}", dir.display());
            let output = run_command(
                "ssh",
                &ssh_args(config, host, &command),
                config.ssh_timeout,
            )
            .await?;
            check_ssh_output(host, "ssh", &output)
        }
    }
}

/// Recursively delete a directory, possibly on a remote host.
///
/// Idempotent: deleting a directory that is already gone succeeds.
pub async fn remove_dir_all(
    config: &BatchConfig,
    host: Option<&str>,
    dir: &Path,
) -> BatchResult<()> {
    match remote_host(config, host) {
        None => match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BatchError::Io(e)),
        },
        Some(host) => {
            let command = format!("rm -rf {}", dir.display());
            let output = run_command(
                "ssh",
                &ssh_args(config, host, &command),
                config.ssh_timeout,
            )
            .await?;
            check_ssh_output(host, "ssh", &output)
        }
    }
}

/// Synchronize the contents of `src_dir` into `dest_dir`, skipping the
/// given files. Files are never removed from the destination.
pub async fn sync_with_exclusions(
    config: &BatchConfig,
    src_dir: &Path,
    dest_dir: &Path,
    src_host: Option<&str>,
    dest_host: Option<&str>,
    exclude: &[PathBuf],
) -> BatchResult<()> {
    let (src_host, dest_host) = effective_hosts(config, src_host, dest_host)?;
    let relative = relative_to(exclude, src_dir);
    let args = rsync_exclude_args(src_dir, dest_dir, src_host, dest_host, &relative);
    run_rsync(config, src_host.or(dest_host), &args).await
}

/// Synchronize only the explicitly selected files from `src_dir` into
/// `dest_dir`. Files are never removed from the destination.
pub async fn sync_selected(
    config: &BatchConfig,
    src_dir: &Path,
    dest_dir: &Path,
    src_host: Option<&str>,
    dest_host: Option<&str>,
    include: &[PathBuf],
) -> BatchResult<()> {
    let (src_host, dest_host) = effective_hosts(config, src_host, dest_host)?;
    let relative = relative_to(include, src_dir);
    let args = rsync_include_args(src_dir, dest_dir, src_host, dest_host, &relative);
    run_rsync(config, src_host.or(dest_host), &args).await
}

/// The host to tunnel through, or `None` when the operation is local.
fn remote_host<'a>(config: &BatchConfig, host: Option<&'a str>) -> Option<&'a str> {
    match host {
        None => None,
        Some(_) if config.shared_storage => None,
        Some(host) if host == config.local_host => None,
        Some(host) => Some(host),
    }
}

/// Normalize the sync endpoints; source and destination must not both be
/// remote.
fn effective_hosts<'a>(
    config: &BatchConfig,
    src_host: Option<&'a str>,
    dest_host: Option<&'a str>,
) -> BatchResult<(Option<&'a str>, Option<&'a str>)> {
    let src = remote_host(config, src_host);
    let dest = remote_host(config, dest_host);
    if src.is_some() && dest.is_some() {
        return Err(BatchError::CommandFailed {
            command: "rsync".to_string(),
            message: format!(
                "source '{}' and destination '{}' cannot both be remote",
                src.unwrap_or_default(),
                dest.unwrap_or_default()
            ),
        });
    }
    Ok((src, dest))
}

/// Build rsync arguments copying everything except the excluded paths.
///
/// Not using `--checksum` or `--ignore-times`: a file modified on both
/// sides at the same time with the same size may be skipped, which is rare
/// enough to ignore.
fn rsync_exclude_args(
    src_dir: &Path,
    dest_dir: &Path,
    src_host: Option<&str>,
    dest_host: Option<&str>,
    exclude: &[PathBuf],
) -> Vec<String> {
    let mut args = vec!["-a".to_string()];
    for path in exclude {
        args.push("--exclude".to_string());
        args.push(path.display().to_string());
    }
    args.push(endpoint(src_host, src_dir, true));
    args.push(endpoint(dest_host, dest_dir, false));
    args
}

/// Build rsync arguments copying only the included paths.
fn rsync_include_args(
    src_dir: &Path,
    dest_dir: &Path,
    src_host: Option<&str>,
    dest_host: Option<&str>,
    include: &[PathBuf],
) -> Vec<String> {
    let mut args = vec!["-a".to_string()];
    for path in include {
        args.push("--include".to_string());
        args.push(path.display().to_string());
    }
    // everything not explicitly included stays behind
    args.push("--exclude".to_string());
    args.push("*".to_string());
    args.push(endpoint(src_host, src_dir, true));
    args.push(endpoint(dest_host, dest_dir, false));
    args
}

fn endpoint(host: Option<&str>, dir: &Path, trailing_slash: bool) -> String {
    let dir = if trailing_slash {
        format!("{}/", dir.display())
    } else {
        dir.display().to_string()
    };
    match host {
        Some(host) => format!("{host}:{dir}"),
        None => dir,
    }
}

async fn run_rsync(config: &BatchConfig, host: Option<&str>, args: &[String]) -> BatchResult<()> {
    debug!(?args, "rsync");
    let output = run_command("rsync", args, config.rsync_timeout).await?;
    if let Some(host) = host {
        check_ssh_output(host, "rsync", &output)
    } else if output.status.success() {
        Ok(())
    } else {
        Err(BatchError::CommandFailed {
            command: "rsync".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Build the ssh argument list for running `command` on `host`.
///
/// `BatchMode=yes` forbids password prompts: a cluster that rejects the key
/// fails fast with a distinct, retryable error instead of hanging.
fn ssh_args(config: &BatchConfig, host: &str, command: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.ssh_timeout.as_secs()),
        "-q".to_string(),
        host.to_string(),
        command.to_string(),
    ]
}

/// Classify a finished ssh/rsync invocation.
fn check_ssh_output(host: &str, command: &str, output: &std::process::Output) -> BatchResult<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let auth_failure = stderr.contains("Permission denied")
        || stderr.contains("Authentication failed")
        || stderr.contains("Host key verification failed");

    if auth_failure || output.status.code() == Some(SSH_FAIL) {
        return Err(BatchError::RemoteAuth {
            host: host.to_string(),
            message: if stderr.is_empty() {
                "connection failed".to_string()
            } else {
                stderr
            },
        });
    }

    Err(BatchError::CommandFailed {
        command: command.to_string(),
        message: stderr,
    })
}

/// Convert absolute paths into paths relative to `base`; paths already
/// relative (or outside `base`) pass through unchanged.
fn relative_to(paths: &[PathBuf], base: &Path) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| p.strip_prefix(base).unwrap_or(p).to_path_buf())
        .collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsync_exclude_args() {
        let args = rsync_exclude_args(
            Path::new("/scratch/job"),
            Path::new("/home/alice/project"),
            Some("node1"),
            None,
            &[PathBuf::from("md.sh.info.json")],
        );
        assert_eq!(
            args,
            vec![
                "-a",
                "--exclude",
                "md.sh.info.json",
                "node1:/scratch/job/",
                "/home/alice/project",
            ]
        );
    }

    #[test]
    fn test_rsync_include_args_exclude_rest() {
        let args = rsync_include_args(
            Path::new("/scratch/job"),
            Path::new("/home/alice/project"),
            None,
            None,
            &[PathBuf::from("md.sh.out"), PathBuf::from("md.sh.err")],
        );
        assert_eq!(
            args,
            vec![
                "-a",
                "--include",
                "md.sh.out",
                "--include",
                "md.sh.err",
                "--exclude",
                "*",
                "/scratch/job/",
                "/home/alice/project",
            ]
        );
    }

    #[test]
    fn test_both_remote_rejected() {
        let config = BatchConfig::default();
        let err = effective_hosts(&config, Some("node1"), Some("node2")).unwrap_err();
        assert!(matches!(err, BatchError::CommandFailed { .. }));
    }

    #[test]
    fn test_shared_storage_short_circuits() {
        let config = BatchConfig::default().with_shared_storage(true);
        assert_eq!(remote_host(&config, Some("node1")), None);

        let config = BatchConfig::default().with_local_host("login1");
        assert_eq!(remote_host(&config, Some("login1")), None);
        assert_eq!(remote_host(&config, Some("node1")), Some("node1"));
    }

    #[test]
    fn test_relative_to() {
        let paths = [
            PathBuf::from("/scratch/job/md.sh.out"),
            PathBuf::from("nested/file"),
        ];
        let relative = relative_to(&paths, Path::new("/scratch/job"));
        assert_eq!(relative[0], PathBuf::from("md.sh.out"));
        assert_eq!(relative[1], PathBuf::from("nested/file"));
    }

    #[test]
    fn test_ssh_args() {
        let config = BatchConfig::default();
        let args = ssh_args(&config, "node1", "cat /tmp/x");
        assert_eq!(args[1], "BatchMode=yes");
        assert!(args[3].starts_with("ConnectTimeout="));
        assert_eq!(args[5], "node1");
        assert_eq!(args[6], "cat /tmp/x");
    }

    #[tokio::test]
    async fn test_local_remove_dir_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("work");
        tokio::fs::create_dir(&target).await.unwrap();

        let config = BatchConfig::default();
        remove_dir_all(&config, None, &target).await.unwrap();
        assert!(!target.exists());
        // second removal of a directory that is already gone succeeds
        remove_dir_all(&config, None, &target).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("record.json");
        let config = BatchConfig::default();

        write_file(&config, None, &file, "{}").await.unwrap();
        let content = read_file(&config, None, &file).await.unwrap();
        assert_eq!(content, "{}");
    }
}
