use std::io::{self, Write};
use std::path::PathBuf;

use log::{debug, warn};

use crate::config::ServerConfig;
use crate::plugins::{self, Executor};

/// What the read loop should do after a line has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Version,
    Nodes,
    List,
    Config,
    Fetch,
    Alert,
    Cap,
    Spoolfetch,
    Quit,
}

/// The protocol's command set. `spoolfetch` is appended at construction time
/// only when a spool directory is configured, so the unknown-command listing
/// and `cap` never advertise more than the node actually supports.
const BASE_COMMANDS: &[(&str, Command)] = &[
    ("alert", Command::Alert),
    ("cap", Command::Cap),
    ("config", Command::Config),
    ("exit", Command::Quit),
    ("fetch", Command::Fetch),
    ("list", Command::List),
    ("nodes", Command::Nodes),
    ("quit", Command::Quit),
    ("version", Command::Version),
];

/// Protocol state for one session: parses a line into a command plus an
/// optional single argument and writes the response before returning control
/// to the read loop. Every plugin or filesystem failure is converted into a
/// `#` comment line here; only transport write errors surface as `Err`.
pub struct Dispatcher<'a, E: Executor> {
    config: &'a ServerConfig,
    executor: E,
    commands: Vec<(&'static str, Command)>,
    spool_helper: Option<PathBuf>,
}

impl<'a, E: Executor> Dispatcher<'a, E> {
    pub fn new(config: &'a ServerConfig, executor: E) -> Self {
        let mut commands = BASE_COMMANDS.to_vec();
        let spool_helper = config.spool_helper();
        if spool_helper.is_some() {
            commands.push(("spoolfetch", Command::Spoolfetch));
            commands.sort_by_key(|(name, _)| *name);
        }
        Dispatcher { config, executor, commands, spool_helper }
    }

    /// The unsolicited handshake line, sent once per session right after
    /// connect. `version` replies with the same line.
    pub fn banner(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "# munin node at {}", self.config.host)?;
        out.flush()
    }

    /// Handle one input line. A blank line is ignored without a response;
    /// three or more tokens are a parse error, not a dispatch.
    pub fn handle_line(&self, line: &str, out: &mut impl Write) -> io::Result<Flow> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Flow::Continue);
        }
        let tokens: Vec<&str> = trimmed.split(' ').collect();
        if tokens.len() > 2 {
            writeln!(out, "# Invalid input: {trimmed}")?;
            out.flush()?;
            return Ok(Flow::Continue);
        }
        let name = tokens[0];
        let arg = tokens.get(1).copied().unwrap_or("");
        debug!("command {name:?} with arg {arg:?}");

        let command = self.commands.iter().find(|(n, _)| *n == name).map(|(_, c)| *c);
        let flow = match command {
            Some(Command::Version) => {
                writeln!(out, "# munin node at {}", self.config.host)?;
                Flow::Continue
            }
            Some(Command::Nodes) => {
                writeln!(out, "{}", self.config.host)?;
                writeln!(out, ".")?;
                Flow::Continue
            }
            Some(Command::List) => {
                self.do_list(out)?;
                Flow::Continue
            }
            Some(Command::Config) | Some(Command::Fetch) | Some(Command::Alert) => {
                self.do_caf(name, arg, out)?;
                Flow::Continue
            }
            Some(Command::Cap) => {
                let spool = if self.spool_helper.is_some() { "spool" } else { "" };
                writeln!(out, "cap {spool}")?;
                Flow::Continue
            }
            Some(Command::Spoolfetch) => {
                self.do_spoolfetch(arg, out)?;
                Flow::Continue
            }
            Some(Command::Quit) => Flow::Quit,
            None => {
                self.write_unknown_command(out)?;
                Flow::Continue
            }
        };
        out.flush()?;
        Ok(flow)
    }

    fn do_list(&self, out: &mut impl Write) -> io::Result<()> {
        match plugins::scan(&self.config.plugin_dir) {
            Ok(found) => {
                let mut names = Vec::new();
                for plugin in &found {
                    if !plugin.executable {
                        warn!("non-executable plugin {} found", plugin.name);
                        continue;
                    }
                    names.push(plugin.name.as_str());
                }
                writeln!(out, "{}", names.join(" "))
            }
            Err(err) => writeln!(out, "# ERROR: {err}"),
        }
    }

    /// Shared handler for `config`, `alert` and `fetch`: resolves the plugin
    /// and relays its full stdout followed by the `.` terminator. `fetch`
    /// passes an empty argument; the other two pass the command name.
    fn do_caf(&self, cmd: &str, plugin: &str, out: &mut impl Write) -> io::Result<()> {
        let Some(desc) = plugins::resolve(&self.config.plugin_dir, plugin) else {
            warn!("unknown plugin [{plugin}] for {cmd}");
            return writeln!(out, "# Unknown plugin [{plugin}] for {cmd}");
        };
        let plugin_arg = if cmd == "fetch" { "" } else { cmd };
        self.relay(&desc.path, plugin_arg, out)
    }

    fn do_spoolfetch(&self, arg: &str, out: &mut impl Write) -> io::Result<()> {
        match &self.spool_helper {
            Some(helper) => self.relay(helper, arg, out),
            // Not reachable through the table, but the protocol answer for an
            // unconfigured capability is the same as for an unknown command.
            None => self.write_unknown_command(out),
        }
    }

    /// Run an executable and relay its captured stdout verbatim, terminated
    /// by a line containing only `.`. A spawn failure becomes a comment line;
    /// nothing has been written for the command at that point.
    fn relay(&self, path: &std::path::Path, arg: &str, out: &mut impl Write) -> io::Result<()> {
        match self.executor.run(path, arg) {
            Ok(output) => {
                out.write_all(&output)?;
                writeln!(out, ".")
            }
            Err(err) => {
                warn!("unable to execute {}: {err}", path.display());
                writeln!(out, "# ERROR: {err}")
            }
        }
    }

    fn write_unknown_command(&self, out: &mut impl Write) -> io::Result<()> {
        let names: Vec<&str> = self.commands.iter().map(|(name, _)| *name).collect();
        writeln!(out, "# Unknown command. Supported commands: {}", names.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;
    use std::time::Duration;

    use crate::config::Transport;

    /// Records every invocation instead of spawning anything.
    struct SpyExecutor {
        calls: RefCell<Vec<(PathBuf, String)>>,
        output: Vec<u8>,
    }

    impl SpyExecutor {
        fn new(output: &[u8]) -> Self {
            SpyExecutor { calls: RefCell::new(Vec::new()), output: output.to_vec() }
        }
    }

    impl Executor for SpyExecutor {
        fn run(&self, path: &Path, arg: &str) -> io::Result<Vec<u8>> {
            self.calls.borrow_mut().push((path.to_path_buf(), arg.to_string()));
            Ok(self.output.clone())
        }
    }

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn run(&self, _path: &Path, _arg: &str) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "exec format error"))
        }
    }

    fn test_config(plugin_dir: &Path, spool_dir: Option<PathBuf>) -> ServerConfig {
        ServerConfig {
            transport: Transport::Stream,
            plugin_dir: plugin_dir.to_path_buf(),
            host: "testhost".to_string(),
            spool_dir,
            idle_timeout: Duration::from_secs(10),
        }
    }

    fn run_line<E: Executor>(dispatcher: &Dispatcher<E>, line: &str) -> (String, Flow) {
        let mut out = Vec::new();
        let flow = dispatcher.handle_line(line, &mut out).unwrap();
        (String::from_utf8(out).unwrap(), flow)
    }

    #[cfg(unix)]
    fn make_plugin(dir: &Path, name: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho ok\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn version_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (first, _) = run_line(&dispatcher, "version\n");
        let (second, _) = run_line(&dispatcher, "version\n");
        assert_eq!(first, "# munin node at testhost\n");
        assert_eq!(first, second);
    }

    #[test]
    fn banner_matches_version_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let mut out = Vec::new();
        dispatcher.banner(&mut out).unwrap();
        let (version, _) = run_line(&dispatcher, "version");
        assert_eq!(String::from_utf8(out).unwrap(), version);
    }

    #[test]
    fn nodes_reports_host_then_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "nodes");
        assert_eq!(reply, "testhost\n.\n");
    }

    #[test]
    fn blank_line_is_ignored_silently() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, flow) = run_line(&dispatcher, "   \n");
        assert_eq!(reply, "");
        assert_eq!(flow, Flow::Continue);
    }

    #[test]
    fn three_tokens_are_a_parse_error_and_dispatch_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let spy = SpyExecutor::new(b"");
        let dispatcher = Dispatcher::new(&config, spy);
        let (reply, _) = run_line(&dispatcher, "fetch cpu extra\n");
        assert_eq!(reply, "# Invalid input: fetch cpu extra\n");
        assert!(dispatcher.executor.calls.borrow().is_empty());
    }

    #[test]
    fn unknown_command_lists_supported_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "bogus");
        assert_eq!(
            reply,
            "# Unknown command. Supported commands: alert cap config exit fetch list nodes quit version\n"
        );
    }

    #[test]
    fn spoolfetch_appears_in_command_list_only_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(tmp.path().to_path_buf()));
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "bogus");
        assert!(reply.contains(" spoolfetch "));
    }

    #[test]
    fn cap_advertises_spool_only_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "cap");
        assert_eq!(reply, "cap \n");

        let config = test_config(tmp.path(), Some(tmp.path().to_path_buf()));
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "cap");
        assert_eq!(reply, "cap spool\n");
    }

    #[test]
    fn unknown_plugin_yields_comment_and_no_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "config missing-plugin");
        assert_eq!(reply, "# Unknown plugin [missing-plugin] for config\n");
        assert!(dispatcher.executor.calls.borrow().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn fetch_relays_output_with_terminator() {
        let tmp = tempfile::tempdir().unwrap();
        make_plugin(tmp.path(), "load");
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b"load.value 0.25\n"));
        let (reply, _) = run_line(&dispatcher, "fetch load");
        assert_eq!(reply, "load.value 0.25\n.\n");
    }

    #[cfg(unix)]
    #[test]
    fn fetch_passes_empty_argument_config_passes_name() {
        let tmp = tempfile::tempdir().unwrap();
        make_plugin(tmp.path(), "load");
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        run_line(&dispatcher, "fetch load");
        run_line(&dispatcher, "config load");
        run_line(&dispatcher, "alert load");
        let calls = dispatcher.executor.calls.borrow();
        let args: Vec<&str> = calls.iter().map(|(_, a)| a.as_str()).collect();
        assert_eq!(args, vec!["", "config", "alert"]);
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_becomes_comment_line() {
        let tmp = tempfile::tempdir().unwrap();
        make_plugin(tmp.path(), "load");
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, FailingExecutor);
        let (reply, _) = run_line(&dispatcher, "fetch load");
        assert_eq!(reply, "# ERROR: exec format error\n");
    }

    #[test]
    fn list_failure_degrades_to_comment_line() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp.path().join("gone"), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "list");
        assert!(reply.starts_with("# ERROR: "));
    }

    #[cfg(unix)]
    #[test]
    fn list_names_only_executable_entries() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        make_plugin(tmp.path(), "cpu");
        make_plugin(tmp.path(), "load");
        let plain = tmp.path().join("readme");
        std::fs::write(&plain, "not a plugin").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, _) = run_line(&dispatcher, "list");
        let mut names: Vec<&str> = reply.trim_end().split(' ').collect();
        names.sort_unstable();
        assert_eq!(names, vec!["cpu", "load"]);
    }

    #[test]
    fn spoolfetch_forwards_argument_to_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), Some(tmp.path().to_path_buf()));
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b"backlog\n"));
        let (reply, _) = run_line(&dispatcher, "spoolfetch 1700000000");
        assert_eq!(reply, "backlog\n.\n");
        let calls = dispatcher.executor.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.ends_with("spoolfetch_testhost"));
        assert_eq!(calls[0].1, "1700000000");
    }

    #[test]
    fn quit_and_exit_end_the_session_without_output() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), None);
        let dispatcher = Dispatcher::new(&config, SpyExecutor::new(b""));
        let (reply, flow) = run_line(&dispatcher, "quit");
        assert_eq!(reply, "");
        assert_eq!(flow, Flow::Quit);
        let (_, flow) = run_line(&dispatcher, "exit");
        assert_eq!(flow, Flow::Quit);
    }
}
