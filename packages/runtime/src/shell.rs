// ABOUTME: Shell quoting and the command runner used by sandboxed adapters
// ABOUTME: Scripts run with a fixed locale and report failures through sentinel lines on stderr

use std::time::Duration;
use warden_sandbox::{ExecOutput, ExecSpec, SandboxError, SandboxManager};

pub const NOT_FOUND: &str = "__WARDEN_NOT_FOUND__";
pub const PERMISSION_DENIED: &str = "__WARDEN_PERMISSION_DENIED__";
pub const NOT_A_DIRECTORY: &str = "__WARDEN_NOT_A_DIRECTORY__";
pub const IS_A_DIRECTORY: &str = "__WARDEN_IS_A_DIRECTORY__";
pub const NOT_EMPTY: &str = "__WARDEN_NOT_EMPTY__";
pub const TOO_LARGE: &str = "__WARDEN_TOO_LARGE__";

/// Exit status scripts use after printing a sentinel
pub const SENTINEL_EXIT: i64 = 86;

/// Escape single quotes within a string for use inside a single-quoted shell argument.
pub fn shell_escape(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Quote a string for safe use as a shell argument.
///
/// Safe strings (alphanumeric, `-`, `_`, `.`, `/`) pass through unchanged.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", shell_escape(s))
    }
}

/// Shell fragment printing `sentinel` to stderr and exiting with [`SENTINEL_EXIT`]
pub fn fail_with(sentinel: &str) -> String {
    format!("{{ echo {} >&2; exit {}; }}", sentinel, SENTINEL_EXIT)
}

/// A sentinel reported by a script, with its optional argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub tag: &'static str,
    pub arg: Option<String>,
}

const ALL_SENTINELS: [&str; 6] = [
    NOT_FOUND,
    PERMISSION_DENIED,
    NOT_A_DIRECTORY,
    IS_A_DIRECTORY,
    NOT_EMPTY,
    TOO_LARGE,
];

/// First sentinel line in a script's stderr, if the script exited through one
pub fn sentinel(output: &ExecOutput) -> Option<Sentinel> {
    if output.exit_code != Some(SENTINEL_EXIT) {
        return None;
    }
    let stderr = output.stderr_lossy();
    stderr.lines().find_map(|line| {
        let line = line.trim();
        ALL_SENTINELS.iter().find_map(|tag| {
            let rest = line.strip_prefix(tag)?;
            let arg = rest.trim();
            Some(Sentinel {
                tag: *tag,
                arg: (!arg.is_empty()).then(|| arg.to_string()),
            })
        })
    })
}

/// Runs scripts inside one tenant's sandbox
#[derive(Clone)]
pub struct SandboxShell {
    manager: SandboxManager,
    tenant_id: String,
}

impl SandboxShell {
    pub fn new(manager: SandboxManager, tenant_id: impl Into<String>) -> Self {
        Self {
            manager,
            tenant_id: tenant_id.into(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    /// Run `script` with `sh -c` and collect its output
    pub async fn run(&self, script: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let spec = ExecSpec::shell(script)
            .with_env("LC_ALL", "C")
            .with_env("QUOTING_STYLE", "literal");
        self.manager
            .exec_collect(&self.tenant_id, spec, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/usr/bin/foo"), "/usr/bin/foo");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    fn output(stderr: &str, exit: i64) -> ExecOutput {
        ExecOutput {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: Some(exit),
        }
    }

    #[test]
    fn test_sentinel_requires_sentinel_exit() {
        let found = sentinel(&output("__WARDEN_TOO_LARGE__ 2048\n", SENTINEL_EXIT)).unwrap();
        assert_eq!(found.tag, TOO_LARGE);
        assert_eq!(found.arg.as_deref(), Some("2048"));

        assert_eq!(
            sentinel(&output("noise\n__WARDEN_NOT_FOUND__\n", SENTINEL_EXIT))
                .unwrap()
                .tag,
            NOT_FOUND
        );
        // A command that merely prints the text is not a sentinel
        assert!(sentinel(&output("__WARDEN_NOT_FOUND__\n", 1)).is_none());
    }
}
