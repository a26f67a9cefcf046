//! The execution environment consumed by the session and its tools.
//!
//! The session only sees the [`ExecutionEnv`] capability trait; [`LocalEnv`]
//! is the production implementation over the real filesystem and shell.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::EnvError;

/// Result of a shell command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// One content-search hit.
#[derive(Debug, Clone)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: u64,
    pub line: String,
}

/// Capability interface over the sandboxed environment.
#[async_trait]
pub trait ExecutionEnv: Send + Sync {
    fn working_directory(&self) -> String;
    fn platform(&self) -> String;
    fn os_version(&self) -> String;

    /// Read a file, optionally a line window (`offset` is 0-based).
    async fn read_file(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, EnvError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvError>;

    /// Replace `old` with `new`; returns the number of replacements made.
    async fn edit_file(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, EnvError>;

    async fn file_exists(&self, path: &str) -> bool;

    /// Glob match under `base`, gitignore-aware, newest first.
    async fn glob(&self, pattern: &str, base: &str) -> Result<Vec<String>, EnvError>;

    async fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob_filter: Option<&str>,
        case_insensitive: bool,
        max_results: usize,
    ) -> Result<Vec<GrepMatch>, EnvError>;

    async fn list_directory(&self, path: &str, depth: usize) -> Result<Vec<String>, EnvError>;

    async fn exec_command(
        &self,
        cancel: &CancellationToken,
        cmd: &str,
        timeout_ms: Option<u64>,
        working_dir: Option<&str>,
        env: &[(String, String)],
    ) -> Result<ExecResult, EnvError>;
}

/// Git state captured once at session creation.
#[derive(Debug, Clone, Default)]
pub struct GitInfo {
    pub branch: String,
    pub modified_files: usize,
    pub untracked_files: usize,
    pub recent_commits: Vec<String>,
}

/// Environment facts snapshotted at session creation.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub working_directory: String,
    pub platform: String,
    pub os_version: String,
    pub git: Option<GitInfo>,
}

impl EnvSnapshot {
    pub fn is_git_repo(&self) -> bool {
        self.git.is_some()
    }

    /// Snapshot static facts plus, when a `git` binary answers, the
    /// repository state.
    pub async fn capture(env: &dyn ExecutionEnv) -> Self {
        let mut snapshot = EnvSnapshot {
            working_directory: env.working_directory(),
            platform: env.platform(),
            os_version: env.os_version(),
            git: None,
        };

        let cancel = CancellationToken::new();

        let branch = match run_git(env, &cancel, "git rev-parse --abbrev-ref HEAD").await {
            Some(result) if result.exit_code == 0 => result.stdout.trim().to_string(),
            _ => return snapshot,
        };

        let mut info = GitInfo { branch, ..Default::default() };
        if let Some(result) = run_git(env, &cancel, "git status --porcelain").await {
            if result.exit_code == 0 {
                for line in result.stdout.lines() {
                    if line.starts_with("??") {
                        info.untracked_files += 1;
                    } else if !line.trim().is_empty() {
                        info.modified_files += 1;
                    }
                }
            }
        }
        if let Some(result) = run_git(env, &cancel, "git log -5 --pretty=%s").await {
            if result.exit_code == 0 {
                info.recent_commits =
                    result.stdout.lines().map(str::to_string).filter(|l| !l.is_empty()).collect();
            }
        }
        snapshot.git = Some(info);
        snapshot
    }
}

async fn run_git(
    env: &dyn ExecutionEnv,
    cancel: &CancellationToken,
    cmd: &str,
) -> Option<ExecResult> {
    env.exec_command(cancel, cmd, Some(5_000), None, &[]).await.ok()
}

/// Production environment rooted at a working directory.
pub struct LocalEnv {
    root: PathBuf,
    os_version: String,
}

impl LocalEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), os_version: detect_os_version() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, EnvError> {
        if path.is_empty() {
            return Err(EnvError::InvalidPath("empty path".into()));
        }
        let candidate = Path::new(path);
        Ok(if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        })
    }
}

fn detect_os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            return format!("Linux {}", release.trim());
        }
    }
    std::env::consts::OS.to_string()
}

#[async_trait]
impl ExecutionEnv for LocalEnv {
    fn working_directory(&self) -> String {
        self.root.display().to_string()
    }

    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn os_version(&self) -> String {
        self.os_version.clone()
    }

    async fn read_file(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, EnvError> {
        let path = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                EnvError::NotFound(path.display().to_string())
            } else {
                EnvError::Io(err)
            }
        })?;
        if offset.is_none() && limit.is_none() {
            return Ok(content);
        }
        let offset = offset.unwrap_or(0);
        let window: Vec<&str> = match limit {
            Some(limit) => content.lines().skip(offset).take(limit).collect(),
            None => content.lines().skip(offset).collect(),
        };
        Ok(window.join("\n"))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvError> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn edit_file(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<usize, EnvError> {
        let resolved = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                EnvError::NotFound(resolved.display().to_string())
            } else {
                EnvError::Io(err)
            }
        })?;

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return Err(EnvError::Other(format!("old string not found in {}", path)));
        }
        if occurrences > 1 && !replace_all {
            return Err(EnvError::Other(format!(
                "old string occurs {} times in {}; pass replace_all to replace every occurrence",
                occurrences, path
            )));
        }

        let (updated, replaced) = if replace_all {
            (content.replace(old, new), occurrences)
        } else {
            (content.replacen(old, new, 1), 1)
        };
        tokio::fs::write(&resolved, updated).await?;
        Ok(replaced)
    }

    async fn file_exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn glob(&self, pattern: &str, base: &str) -> Result<Vec<String>, EnvError> {
        let root = if base.is_empty() { self.root.clone() } else { self.resolve(base)? };
        let pattern = glob::Pattern::new(pattern)
            .map_err(|err| EnvError::Other(format!("invalid glob pattern: {}", err)))?;

        let matches = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<PathBuf> = Vec::new();
            let walker = ignore::WalkBuilder::new(&root)
                .hidden(false)
                .git_ignore(true)
                .git_global(true)
                .git_exclude(true)
                .build();
            for entry in walker.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&root) {
                    if pattern.matches_path(relative) {
                        matches.push(path.to_path_buf());
                    }
                }
            }
            // Most recently modified first.
            matches.sort_by(|a, b| {
                let a_time = std::fs::metadata(a).and_then(|m| m.modified()).ok();
                let b_time = std::fs::metadata(b).and_then(|m| m.modified()).ok();
                b_time.cmp(&a_time)
            });
            matches
        })
        .await
        .map_err(|err| EnvError::Other(format!("glob task failed: {}", err)))?;

        Ok(matches.into_iter().map(|p| p.display().to_string()).collect())
    }

    async fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob_filter: Option<&str>,
        case_insensitive: bool,
        max_results: usize,
    ) -> Result<Vec<GrepMatch>, EnvError> {
        use grep_regex::RegexMatcherBuilder;
        use grep_searcher::SearcherBuilder;
        use grep_searcher::sinks::UTF8;

        let root = if path.is_empty() { self.root.clone() } else { self.resolve(path)? };
        let matcher = RegexMatcherBuilder::new()
            .case_insensitive(case_insensitive)
            .build(pattern)
            .map_err(|err| EnvError::Other(format!("invalid regex: {}", err)))?;
        let filter = match glob_filter {
            Some(filter) => Some(
                glob::Pattern::new(filter)
                    .map_err(|err| EnvError::Other(format!("invalid glob filter: {}", err)))?,
            ),
            None => None,
        };

        let results = tokio::task::spawn_blocking(move || {
            let mut results: Vec<GrepMatch> = Vec::new();
            let mut searcher = SearcherBuilder::new().line_number(true).build();
            let walker = ignore::WalkBuilder::new(&root).hidden(false).build();

            for entry in walker.flatten() {
                if results.len() >= max_results {
                    break;
                }
                let file_path = entry.path();
                if file_path.is_dir() {
                    continue;
                }
                if let Some(filter) = &filter {
                    let relative = file_path.strip_prefix(&root).unwrap_or(file_path);
                    if !filter.matches_path(relative)
                        && !file_path
                            .file_name()
                            .is_some_and(|n| filter.matches(&n.to_string_lossy()))
                    {
                        continue;
                    }
                }

                let display = file_path.display().to_string();
                let remaining = max_results - results.len();
                let mut hits: Vec<GrepMatch> = Vec::new();
                let search = searcher.search_path(
                    &matcher,
                    file_path,
                    UTF8(|line_number, line| {
                        hits.push(GrepMatch {
                            path: display.clone(),
                            line_number,
                            line: line.trim_end().to_string(),
                        });
                        Ok(hits.len() < remaining)
                    }),
                );
                if search.is_ok() {
                    results.extend(hits);
                }
            }
            results
        })
        .await
        .map_err(|err| EnvError::Other(format!("grep task failed: {}", err)))?;

        Ok(results)
    }

    async fn list_directory(&self, path: &str, depth: usize) -> Result<Vec<String>, EnvError> {
        let root = if path.is_empty() { self.root.clone() } else { self.resolve(path)? };
        let depth = depth.max(1);

        let entries = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let walker = ignore::WalkBuilder::new(&root)
                .hidden(false)
                .max_depth(Some(depth))
                .build();
            for entry in walker.flatten() {
                let entry_path = entry.path();
                if entry_path == root {
                    continue;
                }
                let relative = entry_path.strip_prefix(&root).unwrap_or(entry_path);
                let mut display = relative.display().to_string();
                if entry_path.is_dir() {
                    display.push('/');
                }
                entries.push(display);
            }
            entries.sort();
            entries
        })
        .await
        .map_err(|err| EnvError::Other(format!("list task failed: {}", err)))?;

        Ok(entries)
    }

    async fn exec_command(
        &self,
        cancel: &CancellationToken,
        cmd: &str,
        timeout_ms: Option<u64>,
        working_dir: Option<&str>,
        env: &[(String, String)],
    ) -> Result<ExecResult, EnvError> {
        let cwd = match working_dir {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        debug!("exec: {:?} in {:?}", cmd, cwd);

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let started = Instant::now();
        let child = command.spawn()?;
        let wait = child.wait_with_output();

        let timeout = std::time::Duration::from_millis(timeout_ms.unwrap_or(120_000));
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(ExecResult {
                    stderr: "command cancelled".into(),
                    exit_code: -1,
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                });
            }
            _ = tokio::time::sleep(timeout) => {
                return Ok(ExecResult {
                    stderr: format!("command timed out after {} ms", timeout.as_millis()),
                    exit_code: -1,
                    timed_out: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                });
            }
            output = wait => output?,
        };

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn env() -> (TempDir, LocalEnv) {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new(dir.path());
        (dir, env)
    }

    #[tokio::test]
    async fn read_write_edit_round_trip() {
        let (_dir, env) = env();
        env.write_file("notes/todo.txt", "alpha\nbeta\ngamma\n").await.unwrap();
        assert!(env.file_exists("notes/todo.txt").await);

        let all = env.read_file("notes/todo.txt", None, None).await.unwrap();
        assert_eq!(all, "alpha\nbeta\ngamma\n");

        let window = env.read_file("notes/todo.txt", Some(1), Some(1)).await.unwrap();
        assert_eq!(window, "beta");

        let replaced = env.edit_file("notes/todo.txt", "beta", "BETA", false).await.unwrap();
        assert_eq!(replaced, 1);
        let all = env.read_file("notes/todo.txt", None, None).await.unwrap();
        assert!(all.contains("BETA"));
    }

    #[tokio::test]
    async fn edit_requires_unique_match_unless_replace_all() {
        let (_dir, env) = env();
        env.write_file("dup.txt", "x x x").await.unwrap();
        assert!(env.edit_file("dup.txt", "x", "y", false).await.is_err());
        let replaced = env.edit_file("dup.txt", "x", "y", true).await.unwrap();
        assert_eq!(replaced, 3);
        assert!(env.edit_file("dup.txt", "zzz", "y", true).await.is_err());
    }

    #[tokio::test]
    async fn glob_matches_relative_patterns() {
        let (dir, env) = env();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("readme.md"), "# hi").unwrap();

        let matches = env.glob("**/*.rs", "").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].ends_with("main.rs"));
    }

    #[tokio::test]
    async fn grep_finds_lines_with_numbers() {
        let (dir, env) = env();
        fs::write(dir.path().join("a.txt"), "one\ntwo needle\nthree\n").unwrap();
        fs::write(dir.path().join("b.log"), "needle again\n").unwrap();

        let hits = env.grep("needle", "", None, false, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let filtered = env.grep("needle", "", Some("*.log"), false, 10).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].line_number, 1);

        let capped = env.grep("needle", "", None, false, 1).await.unwrap();
        assert_eq!(capped.len(), 1);

        let ci = env.grep("NEEDLE", "", None, true, 10).await.unwrap();
        assert_eq!(ci.len(), 2);
    }

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let (_dir, env) = env();
        let cancel = CancellationToken::new();
        let result = env
            .exec_command(&cancel, "echo out; echo err >&2; exit 3", None, None, &[])
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn exec_times_out() {
        let (_dir, env) = env();
        let cancel = CancellationToken::new();
        let result = env
            .exec_command(&cancel, "sleep 5", Some(50), None, &[])
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn exec_observes_cancellation() {
        let (_dir, env) = env();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let result = env
            .exec_command(&cancel, "sleep 5", None, None, &[])
            .await
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("cancelled"));
    }

    #[tokio::test]
    async fn list_directory_marks_dirs() {
        let (dir, env) = env();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file.txt"), "x").unwrap();
        fs::write(dir.path().join("top.txt"), "x").unwrap();

        let shallow = env.list_directory("", 1).await.unwrap();
        assert!(shallow.contains(&"sub/".to_string()));
        assert!(shallow.contains(&"top.txt".to_string()));
        assert!(!shallow.iter().any(|e| e.contains("file.txt")));

        let deep = env.list_directory("", 2).await.unwrap();
        assert!(deep.iter().any(|e| e.ends_with("file.txt")));
    }
}
