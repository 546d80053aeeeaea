//! Workspace Gateway: file I/O against a session's `/workspace` directory
//! (SPEC_FULL.md §4.5). Listing shells out to `ls` inside the container;
//! reads/writes move data as tar archives through the driver's
//! download/upload primitives, following the archive-building pattern in the
//! teacher's `operator/space_builder.rs`.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::core::driver::{retry_transient, ContainerDriver};
use crate::core::registry::SessionHandle;
use crate::error::{CoreError, CoreResult};

const WORKSPACE_ROOT: &str = "/workspace";
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone)]
pub struct WorkspaceEntry {
    pub name: String,
    pub kind: EntryKind,
}

pub enum FileContents {
    Utf8(String),
    Base64(String),
}

pub struct WorkspaceFile {
    pub contents: FileContents,
    pub size: u64,
}

/// Joins `WORKSPACE_ROOT` with a caller-supplied relative path, rejecting any
/// path that would escape the workspace root. `..` components and absolute
/// paths pointing elsewhere are both refused outright, matching the
/// container's read-only-root-except-workspace security posture.
fn resolve_path(relative: &str) -> CoreResult<String> {
    if relative.contains('\0') {
        return Err(CoreError::PathInvalid("path contains a NUL byte".to_string()));
    }

    if relative.starts_with('/') {
        return Err(CoreError::PathInvalid(format!(
            "path '{relative}' must be relative to the workspace root"
        )));
    }

    let mut normalized_segments: Vec<&str> = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(CoreError::PathInvalid(format!(
                    "path '{relative}' escapes the workspace root"
                )));
            }
            other => normalized_segments.push(other),
        }
    }

    if normalized_segments.is_empty() {
        return Ok(WORKSPACE_ROOT.to_string());
    }

    Ok(format!("{WORKSPACE_ROOT}/{}", normalized_segments.join("/")))
}

pub struct WorkspaceGateway {
    driver: Arc<dyn ContainerDriver>,
    max_file_size: u64,
}

impl WorkspaceGateway {
    pub fn new(driver: Arc<dyn ContainerDriver>, max_file_size: u64) -> Self {
        Self { driver, max_file_size }
    }

    pub async fn list(&self, handle: &SessionHandle, path: &str) -> CoreResult<Vec<WorkspaceEntry>> {
        let target = resolve_path(path)?;
        let argv = vec!["ls".to_string(), "-1Ap".to_string(), target];
        let result = retry_transient(|| self.driver.exec(&handle.container_id, &argv, WORKSPACE_ROOT, LIST_TIMEOUT))
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;

        if result.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CoreError::PathInvalid(format!("listing failed: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&result.stdout);
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                if let Some(name) = line.strip_suffix('/') {
                    WorkspaceEntry {
                        name: name.to_string(),
                        kind: EntryKind::Directory,
                    }
                } else if line.ends_with('*') || line.ends_with('@') || line.ends_with('=') {
                    WorkspaceEntry {
                        name: line[..line.len() - 1].to_string(),
                        kind: EntryKind::Other,
                    }
                } else {
                    WorkspaceEntry {
                        name: line.to_string(),
                        kind: EntryKind::File,
                    }
                }
            })
            .collect())
    }

    pub async fn read(&self, handle: &SessionHandle, path: &str) -> CoreResult<WorkspaceFile> {
        let target = resolve_path(path)?;
        let tar_bytes = retry_transient(|| self.driver.download_file(&handle.container_id, &target))
            .await
            .map_err(|e| match e {
                crate::core::driver::DriverError::NotFound(m) => CoreError::PathInvalid(m),
                other => CoreError::EngineUnavailable(other.to_string()),
            })?;

        let contents = extract_single_file(&tar_bytes)?;
        let size = contents.len() as u64;
        if size > self.max_file_size {
            return Err(CoreError::SizeLimitExceeded {
                actual: size,
                limit: self.max_file_size,
            });
        }

        let contents = match String::from_utf8(contents) {
            Ok(text) => FileContents::Utf8(text),
            Err(err) => FileContents::Base64(BASE64.encode(err.as_bytes())),
        };

        Ok(WorkspaceFile { contents, size })
    }

    pub async fn write(&self, handle: &SessionHandle, path: &str, data: &[u8]) -> CoreResult<()> {
        let target = resolve_path(path)?;
        if data.len() as u64 > self.max_file_size {
            return Err(CoreError::SizeLimitExceeded {
                actual: data.len() as u64,
                limit: self.max_file_size,
            });
        }

        retry_transient(|| self.driver.upload_file(&handle.container_id, &target, data))
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))
    }

    pub async fn delete(&self, handle: &SessionHandle, path: &str) -> CoreResult<()> {
        let target = resolve_path(path)?;
        if target == WORKSPACE_ROOT {
            return Err(CoreError::PathInvalid(
                "refusing to delete the workspace root".to_string(),
            ));
        }

        let argv = vec![
            "rm".to_string(),
            "-rf".to_string(),
            "--one-file-system".to_string(),
            target,
        ];
        let result = retry_transient(|| self.driver.exec(&handle.container_id, &argv, WORKSPACE_ROOT, LIST_TIMEOUT))
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;

        if result.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CoreError::PathInvalid(format!("delete failed: {stderr}")));
        }
        Ok(())
    }
}

/// Pulls the first regular file's contents out of a tar archive. The driver
/// always downloads a single path, so the archive is expected to contain
/// exactly one file entry.
fn extract_single_file(tar_bytes: &[u8]) -> CoreResult<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let entries = archive
        .entries()
        .map_err(|e| CoreError::Internal(e.into()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::Internal(e.into()))?;
        if entry.header().entry_type().is_file() {
            use std::io::Read;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| CoreError::Internal(e.into()))?;
            return Ok(buf);
        }
    }

    Err(CoreError::PathInvalid("path does not reference a file".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths_under_workspace_root() {
        assert_eq!(resolve_path("foo/bar.txt").unwrap(), "/workspace/foo/bar.txt");
        assert_eq!(resolve_path("").unwrap(), "/workspace");
        assert_eq!(resolve_path(".").unwrap(), "/workspace");
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(resolve_path("../etc/passwd").is_err());
        assert!(resolve_path("foo/../../etc/passwd").is_err());
        assert!(resolve_path("./../").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(resolve_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_every_escape_attempt() {
        for path in ["../x", "a/../../b", "/etc/passwd", "./../"] {
            assert!(resolve_path(path).is_err(), "expected '{path}' to be rejected");
        }
    }

    #[test]
    fn rejects_nul_bytes() {
        assert!(resolve_path("foo\0bar").is_err());
    }

    #[test]
    fn extracts_a_single_file_from_tar_archive() {
        let mut tar_data = Vec::new();
        {
            let mut builder = tar::Builder::new(std::io::Cursor::new(&mut tar_data));
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_cksum();
            builder.append_data(&mut header, "hello.txt", &b"hello"[..]).unwrap();
            builder.finish().unwrap();
        }
        let content = extract_single_file(&tar_data).unwrap();
        assert_eq!(content, b"hello");
    }
}
