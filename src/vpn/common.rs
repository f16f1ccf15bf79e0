use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{PanelError, PanelResult};
use crate::protocol::ProtocolKind;
use super::service::{ReloadTarget, ServiceController};

/// Common file utilities shared by all adapters

/// A native configuration file owned by one adapter
///
/// Every mutation is a read-modify-write of the whole file followed by an
/// atomic rename, so readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct NativeFile {
    kind: ProtocolKind,
    path: PathBuf,
    mode: u32,
}

impl NativeFile {
    pub fn new(kind: ProtocolKind, path: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            kind,
            path: path.into(),
            mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content, or `None` when the file does not exist yet
    pub async fn read(&self) -> PanelResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PanelError::config_write(
                self.kind,
                format!("Failed to read {:?}: {}", self.path, e),
            )),
        }
    }

    /// Replace the file content atomically
    pub async fn write(&self, content: &str) -> PanelResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PanelError::config_write(self.kind, format!("Invalid path {:?}", self.path)))?;
        let tmp_path = self.path.with_file_name(format!(".{}.vpnpanel-tmp", file_name));

        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| PanelError::config_write(self.kind, format!("Failed to write {:?}: {}", tmp_path, e)))?;

        let perms = std::fs::Permissions::from_mode(self.mode);
        if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(PanelError::config_write(
                self.kind,
                format!("Failed to set permissions on {:?}: {}", tmp_path, e),
            ));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(PanelError::config_write(
                self.kind,
                format!("Failed to replace {:?}: {}", self.path, e),
            ));
        }

        debug!("Wrote {:?} with permissions {:o}", self.path, self.mode);
        Ok(())
    }

    /// Put back a snapshot taken with [`NativeFile::read`]
    pub async fn restore(&self, snapshot: Option<&str>) -> PanelResult<()> {
        match snapshot {
            Some(content) => self.write(content).await,
            None => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(PanelError::config_write(
                    self.kind,
                    format!("Failed to remove {:?}: {}", self.path, e),
                )),
            },
        }
    }

    /// Apply `edit` to the file and reload the service if anything changed
    ///
    /// If the reload fails the previous content is written back before the
    /// error is returned. Callers must hold the adapter lock.
    pub async fn edit<F, T>(
        &self,
        service: &ServiceController,
        reload: &ReloadTarget,
        edit: F,
    ) -> PanelResult<T>
    where
        F: FnOnce(&str) -> PanelResult<(String, T)>,
    {
        let snapshot = self.read().await?;
        let current = snapshot.as_deref().unwrap_or("");
        let (updated, value) = edit(current)?;

        if updated == current {
            debug!("{:?} already up to date", self.path);
            return Ok(value);
        }

        self.write(&updated).await?;

        if let Err(e) = service.reload(self.kind, reload).await {
            self.rollback(snapshot.as_deref()).await;
            return Err(e);
        }

        Ok(value)
    }

    /// Best-effort restore after a failed reload
    pub async fn rollback(&self, snapshot: Option<&str>) {
        match self.restore(snapshot).await {
            Ok(()) => info!("Restored {:?} after failed {} reload", self.path, self.kind),
            Err(e) => error!(
                "Could not restore {:?} after failed {} reload, entry left in place: {}",
                self.path, self.kind, e
            ),
        }
    }
}

/// Split a config line into whitespace-separated tokens, honouring
/// double-quoted fields (quotes are stripped)
pub fn split_quoted(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }

    tokens
}

/// Whether a line is blank or a comment in line-oriented secret files
pub fn is_comment_or_blank(line: &str) -> bool {
    let line = line.trim_start();
    line.is_empty() || line.starts_with('#')
}

/// Replace every line matching `owns` with `new_line`
///
/// The first match is replaced in place and later duplicates are dropped;
/// without a match the line is appended. Lines owned by other accounts are
/// left untouched.
pub fn upsert_line<F>(content: &str, owns: F, new_line: &str) -> String
where
    F: Fn(&str) -> bool,
{
    let mut out = Vec::new();
    let mut placed = false;

    for line in content.lines() {
        if owns(line) {
            if !placed {
                out.push(new_line.to_string());
                placed = true;
            }
        } else {
            out.push(line.to_string());
        }
    }

    if !placed {
        out.push(new_line.to_string());
    }

    join_lines(&out)
}

/// Remove every line matching `owns`; returns the new content and how many
/// lines were dropped
pub fn remove_lines<F>(content: &str, owns: F) -> (String, usize)
where
    F: Fn(&str) -> bool,
{
    let mut removed = 0;
    let kept: Vec<String> = content
        .lines()
        .filter(|line| {
            if owns(line) {
                removed += 1;
                false
            } else {
                true
            }
        })
        .map(str::to_string)
        .collect();

    if removed == 0 {
        return (content.to_string(), 0);
    }
    if removed > 1 {
        warn!("Removed {} duplicate entries", removed);
    }
    (join_lines(&kept), removed)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_quoted() {
        assert_eq!(
            split_quoted(r#""alice" l2tpd "p@ss word" *"#),
            vec!["alice", "l2tpd", "p@ss word", "*"]
        );
        assert_eq!(split_quoted("alice : PSK \"k\""), vec!["alice", ":", "PSK", "k"]);
        assert_eq!(split_quoted(r#""" x"#), vec!["", "x"]);
        assert!(split_quoted("   ").is_empty());
    }

    #[test]
    fn test_upsert_replaces_and_dedupes() {
        let content = "# header\nalice old\nbob keep\nalice stale\n";
        let updated = upsert_line(content, |l| l.starts_with("alice "), "alice new");
        assert_eq!(updated, "# header\nalice new\nbob keep\n");
    }

    #[test]
    fn test_upsert_appends_when_missing() {
        assert_eq!(upsert_line("", |_| false, "carol x"), "carol x\n");
        assert_eq!(upsert_line("bob y", |_| false, "carol x"), "bob y\ncarol x\n");
    }

    #[test]
    fn test_remove_lines() {
        let (out, removed) = remove_lines("alice 1\nbob 2\nalice 3\n", |l| l.starts_with("alice "));
        assert_eq!(out, "bob 2\n");
        assert_eq!(removed, 2);

        let (out, removed) = remove_lines("bob 2", |l| l.starts_with("alice "));
        assert_eq!(out, "bob 2");
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_native_file_write_restore() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = NativeFile::new(ProtocolKind::L2tpIpsec, dir.path().join("chap-secrets"), 0o600);

        assert_eq!(file.read().await.unwrap(), None);
        file.write("a\n").await.unwrap();
        assert_eq!(file.read().await.unwrap().as_deref(), Some("a\n"));

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        file.restore(None).await.unwrap();
        assert!(!file.path().exists());
        file.restore(Some("b\n")).await.unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "b\n");
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_is_config_error() {
        let file = NativeFile::new(ProtocolKind::WireGuard, "/nonexistent-dir/wg0.conf", 0o600);
        assert!(matches!(
            file.write("x").await,
            Err(PanelError::ConfigWrite { kind: ProtocolKind::WireGuard, .. })
        ));
    }
}
