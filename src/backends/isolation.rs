//! Namespace isolation for spawned commands.
//!
//! The local backend decides *whether* to isolate; the launcher decides *how*,
//! by rewriting the argument vector so the command runs with the workspace
//! root remapped to a fixed path inside a restricted namespace.

use super::boundary::{absolutize, join, relative_to};

/// Where the workspace root appears inside the sandbox.
pub const SANDBOX_WORKSPACE: &str = "/tmp/agentbe-workspace";

/// System directories exposed read-only inside the sandbox.
const READ_ONLY_BINDS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];

pub trait IsolationLauncher: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the launcher can run on this host.
    fn is_available(&self) -> bool;

    /// Translates a host directory inside `root` to its path in the sandbox.
    fn sandbox_path(&self, root: &str, host_dir: &str) -> String {
        match relative_to(&absolutize(host_dir), &absolutize(root)) {
            Some("") | None => SANDBOX_WORKSPACE.to_string(),
            Some(rest) => join(SANDBOX_WORKSPACE, rest),
        }
    }

    /// Wraps `argv` so it runs isolated with `root` remapped and `cwd`
    /// (a host directory inside `root`) as the working directory. The first
    /// element of the result is the program to spawn.
    fn wrap(&self, argv: Vec<String>, root: &str, cwd: &str) -> Vec<String>;
}

/// Bubblewrap (`bwrap`) launcher: everything unshared except the network.
#[derive(Debug, Clone)]
pub struct BubblewrapLauncher {
    program: String,
}

impl Default for BubblewrapLauncher {
    fn default() -> Self {
        Self {
            program: "bwrap".to_string(),
        }
    }
}

impl BubblewrapLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IsolationLauncher for BubblewrapLauncher {
    fn name(&self) -> &str {
        &self.program
    }

    fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn wrap(&self, argv: Vec<String>, root: &str, cwd: &str) -> Vec<String> {
        let mut args = vec![self.program.clone()];
        for dir in READ_ONLY_BINDS {
            args.extend(["--ro-bind".to_string(), dir.to_string(), dir.to_string()]);
        }
        args.extend([
            "--bind".to_string(),
            root.to_string(),
            SANDBOX_WORKSPACE.to_string(),
            "--chdir".to_string(),
            self.sandbox_path(root, cwd),
            "--unshare-all".to_string(),
            "--share-net".to_string(),
            "--die-with-parent".to_string(),
            "--dev".to_string(),
            "/dev".to_string(),
            "--proc".to_string(),
            "/proc".to_string(),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
            "--".to_string(),
        ]);
        args.extend(argv);
        args
    }
}
