//! Stats engine: registers invoked, internal and monitored stat scripts,
//! runs them with the host surface injected, and ships the resulting
//! line-protocol measurements to the time-series store.
//!
//! Scripts are recompiled in place whenever their source file's mtime
//! changes; a broken edit keeps the previous compilation running.

pub mod escape;
pub mod host;
pub mod influx;
pub mod webhooks;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use regex::Regex;
use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::config::InfluxConfig;
use crate::middleware::interval_due;
use crate::webrcon::{CommandSender, CountersSnapshot, MessageCallback, RconClient, Response, ResponseCallback};

use host::{AdvisoryLock, ScriptGlobals};
use influx::{InfluxWriter, DEFAULT_BUCKET};
use webhooks::WebhookSender;

struct LoadedScript {
    ast: Arc<AST>,
    mtime: SystemTime,
}

/// One script file plus its current compilation.
struct ScriptSlot {
    path: PathBuf,
    state: Mutex<LoadedScript>,
}

fn compile(engine: &Engine, path: &Path) -> anyhow::Result<(Arc<AST>, SystemTime)> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("error reading script {}", path.display()))?;
    let ast = engine
        .compile(&source)
        .map_err(|e| anyhow::anyhow!("parse error in {}: {}", path.display(), e))?;
    let mtime = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("error reading mtime of {}", path.display()))?;
    Ok((Arc::new(ast), mtime))
}

impl ScriptSlot {
    fn load(engine: &Engine, path: &Path) -> anyhow::Result<Self> {
        let (ast, mtime) = compile(engine, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LoadedScript { ast, mtime }),
        })
    }

    /// Returns the current compilation, recompiling first when the source
    /// file changed on disk. A failed recompile keeps the previous AST.
    fn fresh_ast(&self, engine: &Engine) -> Arc<AST> {
        let mut state = self.state.lock().expect("script state lock poisoned");

        match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(mtime) if mtime != state.mtime => match compile(engine, &self.path) {
                Ok((ast, mtime)) => {
                    log::info!("Reloaded script {}", self.path.display());
                    state.ast = ast;
                    state.mtime = mtime;
                }
                Err(e) => log::error!("Error reloading script: {}", e),
            },
            Ok(_) => {}
            // If we can't stat it we likely can't read it either; keep the
            // compilation we have.
            Err(e) => log::warn!(
                "Error checking {} for reload: {}",
                self.path.display(),
                e
            ),
        }

        state.ast.clone()
    }
}

/// Host values injected into a script run, one variant per binding. The set
/// is closed: the scope names live in exactly one place, and a new binding
/// cannot be added without extending the push match.
enum HostBinding {
    ScriptType(&'static str),
    Input(String),
    Response(Map),
    Matches(Array),
    RconStats(Map),
    RuntimeStats(Map),
}

impl HostBinding {
    fn push(self, scope: &mut Scope) {
        match self {
            HostBinding::ScriptType(kind) => scope.push("_SCRIPT_TYPE", kind.to_string()),
            HostBinding::Input(message) => scope.push("_INPUT", message),
            HostBinding::Response(response) => scope.push("_RESPONSE", response),
            HostBinding::Matches(matches) => scope.push("_MATCHES", matches),
            HostBinding::RconStats(counters) => scope.push("_RCON_STATS", counters),
            HostBinding::RuntimeStats(runtime) => scope.push("_RUNTIME_STATS", runtime),
        };
    }
}

struct InvokedStat {
    command: String,
    interval: i64,
    script: ScriptSlot,
}

struct InternalStat {
    interval: i64,
    script: ScriptSlot,
}

struct MonitoredStat {
    pattern: Regex,
    script: ScriptSlot,
}

pub struct StatsClient {
    tag: String,
    rcon: RconClient,
    engine: Engine,
    globals: ScriptGlobals,
    influx: InfluxWriter,
    invoked: Vec<Arc<InvokedStat>>,
    internal: Vec<Arc<InternalStat>>,
    monitored: Vec<Arc<MonitoredStat>>,
}

impl StatsClient {
    pub fn new(
        tag: &str,
        rcon: RconClient,
        influx: &InfluxConfig,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let globals = ScriptGlobals::new();
        let engine = host::build_engine(
            Arc::new(AdvisoryLock::new()),
            Arc::new(WebhookSender::new().context("error building webhook client")?),
        );
        let influx = InfluxWriter::new(
            &influx.hostname,
            influx.port,
            &influx.database,
            &influx.username,
            &influx.password,
            influx.ssl,
            dry_run,
        )
        .context("error building InfluxDB client")?;

        Ok(Self {
            tag: tag.to_string(),
            rcon,
            engine,
            globals,
            influx,
            invoked: Vec::new(),
            internal: Vec::new(),
            monitored: Vec::new(),
        })
    }

    /// Registers a stat fed by the response of an RCON command issued every
    /// `interval` ticks.
    pub fn register_invoked_stat(&mut self, command: &str, script_path: &str, interval: i64) {
        match ScriptSlot::load(&self.engine, Path::new(script_path)) {
            Ok(script) => {
                log::info!(
                    "Registered invoked stat, command = {}, interval = {}, script = {}",
                    command,
                    interval,
                    script_path
                );
                self.invoked.push(Arc::new(InvokedStat {
                    command: command.to_string(),
                    interval,
                    script,
                }));
            }
            Err(e) => log::warn!("Unable to add invoked stat: {}", e),
        }
    }

    /// Registers a stat that runs every `interval` ticks with host runtime
    /// metrics injected, no RCON command.
    pub fn register_internal_stat(&mut self, script_path: &str, interval: i64) {
        match ScriptSlot::load(&self.engine, Path::new(script_path)) {
            Ok(script) => {
                log::info!(
                    "Registered internal stat, interval = {}, script = {}",
                    interval,
                    script_path
                );
                self.internal
                    .push(Arc::new(InternalStat { interval, script }));
            }
            Err(e) => log::warn!("Unable to add internal stat: {}", e),
        }
    }

    /// Registers a stat run for every inbound message matching the pattern.
    pub fn register_monitored_stat(&mut self, pattern: &str, script_path: &str) {
        let pattern = match Regex::new(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                log::warn!("Unable to compile monitored pattern {:?}: {}", pattern, e);
                return;
            }
        };
        match ScriptSlot::load(&self.engine, Path::new(script_path)) {
            Ok(script) => {
                log::info!(
                    "Registered monitored stat, pattern = {}, script = {}",
                    pattern,
                    script_path
                );
                self.monitored
                    .push(Arc::new(MonitoredStat { pattern, script }));
            }
            Err(e) => log::warn!("Unable to add monitored stat: {}", e),
        }
    }

    /// Tick loop driving invoked and internal stats. Runs until the shutdown
    /// channel closes.
    pub async fn collect_stats(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        log::info!("Starting up stats collector");
        let mut ticks: i64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(Duration::from_secs(1)) => {}
            }

            ticks += 1;

            for stat in &self.invoked {
                if interval_due(ticks, stat.interval) {
                    self.clone().run_invoked(stat.clone());
                }
            }

            for stat in &self.internal {
                if interval_due(ticks, stat.interval) {
                    let stats = self.clone();
                    let stat = stat.clone();
                    tokio::task::spawn_blocking(move || stats.execute_internal(&stat));
                }
            }
        }

        log::info!("Shutting down stats collector");
    }

    fn run_invoked(self: Arc<Self>, stat: Arc<InvokedStat>) {
        log::debug!("Running invoked stat {}", stat.command);
        let command = stat.command.clone();
        let cache_for = (stat.interval - 1).max(0) as u64;
        let stats = self.clone();
        let callback: Arc<dyn ResponseCallback> = Arc::new(move |response: &Response| {
            let stats = stats.clone();
            let stat = stat.clone();
            let response = response.clone();
            tokio::task::spawn_blocking(move || stats.execute_invoked(&stat, &response));
        });
        self.rcon.send_with_callback(&command, cache_for, callback);
    }

    fn execute_invoked(&self, stat: &InvokedStat, response: &Response) {
        let ast = stat.script.fresh_ast(&self.engine);
        let output = self.run_script(
            &stat.script.path,
            &ast,
            vec![
                HostBinding::ScriptType("invoked"),
                HostBinding::Input(response.message.clone()),
                HostBinding::Response(response_map(response)),
            ],
        );
        self.ship(&stat.script.path, output);
    }

    fn execute_internal(&self, stat: &InternalStat) {
        let ast = stat.script.fresh_ast(&self.engine);
        let output = self.run_script(
            &stat.script.path,
            &ast,
            vec![
                HostBinding::ScriptType("internal"),
                HostBinding::RconStats(counters_map(self.rcon.counters_snapshot())),
                HostBinding::RuntimeStats(runtime_map()),
            ],
        );
        self.ship(&stat.script.path, output);
    }

    /// Runs every monitored stat whose pattern matches, in registration
    /// order. Called from a blocking task per inbound message.
    fn run_monitored(&self, response: &Response) {
        for stat in &self.monitored {
            let Some(captures) = stat.pattern.captures(&response.message) else {
                continue;
            };

            let ast = stat.script.fresh_ast(&self.engine);
            let output = self.run_script(
                &stat.script.path,
                &ast,
                vec![
                    HostBinding::ScriptType("monitored"),
                    HostBinding::Matches(matches_array(&captures)),
                    HostBinding::Response(response_map(response)),
                ],
            );
            self.ship(&stat.script.path, output);
        }
    }

    /// Executes one script with a fresh scope and the host values injected,
    /// returning the bucket and joined line-protocol records it produced.
    fn run_script(
        &self,
        path: &Path,
        ast: &AST,
        bindings: Vec<HostBinding>,
    ) -> Option<(String, String)> {
        let mut scope = Scope::new();
        scope.push("_TAG", self.tag.clone());
        scope.push("_GLOBALS", self.globals.handle());
        scope.push("_BUCKET", DEFAULT_BUCKET.to_string());
        scope.push("_MEASUREMENTS", Array::new());
        for binding in bindings {
            binding.push(&mut scope);
        }

        if let Err(e) = self.engine.run_ast_with_scope(&mut scope, ast) {
            log::error!("Error running script {}: {}", path.display(), e);
            return None;
        }

        let measurements = scope.get_value::<Array>("_MEASUREMENTS")?;
        if measurements.is_empty() {
            return None;
        }

        let bucket = scope
            .get_value::<String>("_BUCKET")
            .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let mut lines = String::new();
        for measurement in measurements {
            lines.push_str(&measurement.to_string());
            lines.push('\n');
        }
        Some((bucket, lines))
    }

    fn ship(&self, path: &Path, output: Option<(String, String)>) {
        let Some((bucket, lines)) = output else {
            return;
        };
        if let Err(e) = self.influx.write_record(&bucket, &lines) {
            log::error!(
                "Error writing measurements from {}: {}",
                path.display(),
                e
            );
        }
    }
}

/// Feeds inbound RCON messages to the monitored stats. Registered as an
/// on-message subscriber on the session.
pub struct MonitorFanout {
    stats: Arc<StatsClient>,
}

impl MonitorFanout {
    pub fn new(stats: Arc<StatsClient>) -> Self {
        Self { stats }
    }
}

impl MessageCallback for MonitorFanout {
    fn on_message(&self, raw: &[u8]) {
        let response: Response = match serde_json::from_slice(raw) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Error decoding RCON message for monitored stats: {}", e);
                return;
            }
        };

        let stats = self.stats.clone();
        tokio::task::spawn_blocking(move || stats.run_monitored(&response));
    }
}

fn response_map(response: &Response) -> Map {
    let mut map = Map::new();
    map.insert("Identifier".into(), Dynamic::from(response.identifier as i64));
    map.insert("Message".into(), Dynamic::from(response.message.clone()));
    map.insert("Type".into(), Dynamic::from(response.message_type.clone()));
    map.insert(
        "Stacktrace".into(),
        Dynamic::from(response.stacktrace.clone()),
    );
    map
}

/// Capture groups as script values; index 0 is the full match, unmatched
/// groups come through empty.
fn matches_array(captures: &regex::Captures<'_>) -> Array {
    captures
        .iter()
        .map(|group| {
            Dynamic::from(
                group
                    .map(|matched| matched.as_str().to_string())
                    .unwrap_or_default(),
            )
        })
        .collect()
}

fn counters_map(snapshot: CountersSnapshot) -> Map {
    let mut map = Map::new();
    map.insert(
        "commands_run".into(),
        Dynamic::from(snapshot.commands_run as i64),
    );
    map.insert(
        "command_timeouts".into(),
        Dynamic::from(snapshot.command_timeouts as i64),
    );
    map.insert(
        "disconnects".into(),
        Dynamic::from(snapshot.disconnects as i64),
    );
    map.insert("messages".into(), Dynamic::from(snapshot.messages as i64));
    map.insert(
        "cache_hits".into(),
        Dynamic::from(snapshot.cache_hits as i64),
    );
    map.insert(
        "cache_misses".into(),
        Dynamic::from(snapshot.cache_misses as i64),
    );
    map.insert(
        "on_connect_callbacks".into(),
        Dynamic::from(snapshot.on_connect_callbacks as i64),
    );
    map.insert(
        "on_message_callbacks".into(),
        Dynamic::from(snapshot.on_message_callbacks as i64),
    );
    map.insert(
        "on_invoke_callbacks".into(),
        Dynamic::from(snapshot.on_invoke_callbacks as i64),
    );
    map
}

/// Process-level runtime metrics injected into internal stats.
fn runtime_map() -> Map {
    use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

    let mut map = Map::new();
    let mut system = System::new();
    let pid = Pid::from_u32(std::process::id());
    system.refresh_process(pid);

    if let Some(process) = system.process(pid) {
        map.insert("memory".into(), Dynamic::from(process.memory() as i64));
        map.insert(
            "virtual_memory".into(),
            Dynamic::from(process.virtual_memory() as i64),
        );
        map.insert(
            "cpu_usage".into(),
            Dynamic::from(process.cpu_usage() as f64),
        );
        map.insert("run_time".into(), Dynamic::from(process.run_time() as i64));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrcon::RconOptions;
    use std::io::Write;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn test_stats() -> StatsClient {
        let rcon = RconClient::new("localhost", 28016, "pw", RconOptions::default());
        let influx = InfluxConfig {
            hostname: "tsdb".to_string(),
            port: 8086,
            username: "u".to_string(),
            password: "p".to_string(),
            database: "rust".to_string(),
            ssl: false,
        };
        StatsClient::new("testtag", rcon, &influx, true).unwrap()
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn invoked_script_sees_input_and_tag() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let path = write_script(
            &dir,
            "players.rhai",
            r#"_MEASUREMENTS = ["players,server=" + tagescape(_TAG) + ",kind=" + _SCRIPT_TYPE + " value=" + _INPUT];"#,
        );
        stats.register_invoked_stat("playercount", &path, 30);
        assert_eq!(stats.invoked.len(), 1);

        let stat = stats.invoked[0].clone();
        let response = Response {
            identifier: 1001,
            message: "42".to_string(),
            message_type: "Generic".to_string(),
            stacktrace: String::new(),
        };
        let ast = stat.script.fresh_ast(&stats.engine);
        let output = stats.run_script(
            &stat.script.path,
            &ast,
            vec![
                HostBinding::ScriptType("invoked"),
                HostBinding::Input(response.message.clone()),
                HostBinding::Response(response_map(&response)),
            ],
        );

        let (bucket, lines) = output.unwrap();
        assert_eq!(bucket, "autogen");
        assert_eq!(lines, "players,server=testtag,kind=invoked value=42\n");
    }

    #[test]
    fn bucket_override_is_honored() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let path = write_script(
            &dir,
            "raw.rhai",
            r#"_BUCKET = "raw"; _MEASUREMENTS = ["x value=1"];"#,
        );
        stats.register_internal_stat(&path, 60);

        let stat = stats.internal[0].clone();
        let ast = stat.script.fresh_ast(&stats.engine);
        let output = stats.run_script(&stat.script.path, &ast, Vec::new());

        let (bucket, lines) = output.unwrap();
        assert_eq!(bucket, "raw");
        assert_eq!(lines, "x value=1\n");
    }

    #[test]
    fn script_without_measurements_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let path = write_script(&dir, "quiet.rhai", r#"let unused = 1;"#);
        stats.register_internal_stat(&path, 60);

        let stat = stats.internal[0].clone();
        let ast = stat.script.fresh_ast(&stats.engine);
        assert!(stats.run_script(&stat.script.path, &ast, Vec::new()).is_none());
    }

    #[test]
    fn broken_script_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let path = write_script(&dir, "broken.rhai", "let ((((");
        stats.register_invoked_stat("fps", &path, 10);
        assert!(stats.invoked.is_empty());

        stats.register_monitored_stat("(unclosed", &write_script(&dir, "ok.rhai", "let x = 1;"));
        assert!(stats.monitored.is_empty());
    }

    #[test]
    fn hot_reload_recompiles_and_survives_broken_edits() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let path = write_script(&dir, "reload.rhai", r#"_MEASUREMENTS = ["v value=1"];"#);
        stats.register_internal_stat(&path, 60);
        let stat = stats.internal[0].clone();

        let ast = stat.script.fresh_ast(&stats.engine);
        let (_, lines) = stats.run_script(&stat.script.path, &ast, Vec::new()).unwrap();
        assert_eq!(lines, "v value=1\n");

        // New content; force the recorded mtime stale so the next run
        // recompiles regardless of filesystem timestamp granularity.
        fs::write(&path, r#"_MEASUREMENTS = ["v value=2"];"#).unwrap();
        stat.script.state.lock().unwrap().mtime = UNIX_EPOCH;
        let ast = stat.script.fresh_ast(&stats.engine);
        let (_, lines) = stats.run_script(&stat.script.path, &ast, Vec::new()).unwrap();
        assert_eq!(lines, "v value=2\n");

        // A broken edit keeps the previous compilation.
        fs::write(&path, "let ((((").unwrap();
        stat.script.state.lock().unwrap().mtime = UNIX_EPOCH;
        let ast = stat.script.fresh_ast(&stats.engine);
        let (_, lines) = stats.run_script(&stat.script.path, &ast, Vec::new()).unwrap();
        assert_eq!(lines, "v value=2\n");
    }

    #[test]
    fn monitored_match_injects_capture_groups() {
        let pattern = Regex::new(r"^Joined: (\S+)$").unwrap();
        let captures = pattern.captures("Joined: alice").unwrap();
        let matches = matches_array(&captures);

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].to_string(), "Joined: alice");
        assert_eq!(matches[1].to_string(), "alice");
    }

    #[test]
    fn monitored_scripts_run_in_registration_order() {
        let dir = TempDir::new().unwrap();
        let mut stats = test_stats();
        let first = write_script(
            &dir,
            "first.rhai",
            r#"_GLOBALS["order"] = _GLOBALS["order"] + "a";"#,
        );
        let second = write_script(
            &dir,
            "second.rhai",
            r#"_GLOBALS["order"] = _GLOBALS["order"] + "b";"#,
        );
        stats.register_monitored_stat("^Joined", &first);
        stats.register_monitored_stat("Joined: (\\S+)", &second);
        assert_eq!(stats.monitored.len(), 2);

        stats.globals.handle().set("order", Dynamic::from(String::new()));
        let response = Response {
            identifier: 0,
            message: "Joined: alice".to_string(),
            message_type: "Generic".to_string(),
            stacktrace: String::new(),
        };
        stats.run_monitored(&response);

        assert_eq!(
            stats.globals.handle().get("order").to_string(),
            "ab"
        );
    }

    #[test]
    fn response_map_mirrors_wire_fields() {
        let response = Response {
            identifier: 2000,
            message: "hello".to_string(),
            message_type: "Chat".to_string(),
            stacktrace: String::new(),
        };
        let map = response_map(&response);
        assert_eq!(map.get("Identifier").unwrap().as_int().unwrap(), 2000);
        assert_eq!(map.get("Message").unwrap().to_string(), "hello");
        assert_eq!(map.get("Type").unwrap().to_string(), "Chat");
    }
}
