//! Administrative command surface.
//!
//! Two entry points: the admin socket (string command + JSON argument
//! map, local and trusted) and monitor-routed commands (structured
//! requests gated on the session's `tell` capability, plus the legacy
//! vector-of-strings form).

use serde_json::{Map, Value, json};

use ferrofs_config::Config;
use ferrofs_proto::{
    CommandDescription, CommandRequest, CommandResult, DaemonState, EntityName, Message,
};
use ferrofs_types::{GlobalId, MdsCode, Rank, Result, make_error_msg};

use crate::config::MdsConfig;
use crate::daemon::{Mds, MdsCore, MdsInner};
use crate::subsystems::FragId;

/// Action to run after the command reply has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    Exit,
    Respawn,
}

fn missing_arg(name: &str) -> CommandResult {
    CommandResult::err(-libc::EINVAL, format!("missing {} argument", name))
}

fn result_of(r: Result<()>) -> CommandResult {
    match r {
        Ok(()) => CommandResult::ok(Value::Null),
        Err(status) => CommandResult::err(status.errno(), status.describe()),
    }
}

impl Mds {
    /// The admin-socket command catalog, with argument schemas.
    pub fn asok_command_descriptions() -> Vec<CommandDescription> {
        let cmd = |cmd: &str, help: &str| CommandDescription {
            cmd: cmd.into(),
            help: help.into(),
            module: "mds".into(),
            perm: "rw".into(),
            availability: "asok".into(),
        };
        vec![
            cmd("status", "high-level status of MDS"),
            cmd("ops", "show the ops currently in flight"),
            cmd("dump_ops_in_flight", "show the ops currently in flight"),
            cmd("dump_historic_ops", "show slowest recent ops"),
            cmd(
                "osdmap barrier name=target_epoch,type=int",
                "wait until the MDS has this OSD map epoch",
            ),
            cmd("session ls", "enumerate connected clients"),
            cmd(
                "session evict name=client_id,type=string",
                "evict a client session",
            ),
            cmd(
                "scrub_path name=path,type=string",
                "scrub an inode and output results",
            ),
            cmd(
                "flush_path name=path,type=string",
                "flush an inode (and its dirfrags)",
            ),
            cmd("flush journal", "flush the journal to the backing store"),
            cmd("get subtrees", "return the subtree map"),
            cmd(
                "export dir name=path,type=string name=rank,type=int",
                "migrate a subtree to named MDS",
            ),
            cmd(
                "dump cache name=path,type=string,req=false",
                "dump metadata cache (optionally to a file)",
            ),
            cmd("force_readonly", "force MDS to read-only mode"),
            cmd(
                "dirfrag split name=path,type=string,req=true \
                 name=frag,type=string,req=true name=bits,type=int,req=true",
                "fragment directory by path",
            ),
            cmd(
                "dirfrag merge name=path,type=string,req=true \
                 name=frag,type=string,req=true",
                "de-fragment directory by path",
            ),
            cmd(
                "dirfrag ls name=path,type=string,req=true",
                "list fragments in directory",
            ),
        ]
    }

    /// The monitor-routed command catalog.
    pub fn mon_command_descriptions() -> Vec<CommandDescription> {
        let cmd = |cmd: &str, help: &str| CommandDescription {
            cmd: cmd.into(),
            help: help.into(),
            module: "mds".into(),
            perm: "*".into(),
            availability: "cli,rest".into(),
        };
        vec![
            cmd(
                "injectargs name=injected_args,type=string,n=N",
                "inject configuration arguments into running MDS",
            ),
            cmd("exit", "terminate this MDS"),
            cmd("respawn", "restart this MDS"),
            cmd("session kill name=session_id,type=int", "end a client session"),
            cmd(
                "cpu_profiler name=arg,type=choices,strings=status|flush",
                "run cpu profiling on daemon",
            ),
            cmd(
                "heap name=heapcmd,type=choices,strings=dump|start_profiler|stop_profiler|release|stats",
                "show heap usage info (available only if compiled with profiler support)",
            ),
        ]
    }

    // -----------------------------------------------------------------------
    // Admin-socket entry point
    // -----------------------------------------------------------------------

    pub async fn asok_command(&self, command: &str, args: &Map<String, Value>) -> CommandResult {
        tracing::info!(command, "asok_command (starting...)");
        let op = self.inner.op_tracker.register_op(format!("asok: {}", command));
        let result = self.asok_command_inner(command, args).await;
        self.inner.op_tracker.finish_op(op);
        tracing::info!(command, "asok_command (complete)");
        result
    }

    async fn asok_command_inner(&self, command: &str, args: &Map<String, Value>) -> CommandResult {
        if command == "status" {
            return self.command_status().await;
        }

        if self.current_rank().await.is_none() {
            tracing::info!("can't run that command on an inactive MDS!");
            return CommandResult::err(-libc::EAGAIN, "mds_not_active");
        }

        match command {
            "ops" | "dump_ops_in_flight" => {
                if !self.inner.op_tracker.tracking_enabled {
                    return CommandResult::err(-libc::EINVAL, "op_tracker tracking is not enabled");
                }
                CommandResult::ok(self.inner.op_tracker.dump_ops_in_flight())
            }
            "dump_historic_ops" => {
                if !self.inner.op_tracker.tracking_enabled {
                    return CommandResult::err(-libc::EINVAL, "op_tracker tracking is not enabled");
                }
                CommandResult::ok(self.inner.op_tracker.dump_historic_ops())
            }
            "osdmap barrier" => self.command_osdmap_barrier(args).await,
            "session ls" => self.command_session_ls().await,
            "session evict" => self.command_session_evict(args).await,
            "scrub_path" => {
                let Some(path) = args.get("path").and_then(Value::as_str) else {
                    return missing_arg("path");
                };
                self.command_scrub_path(path).await
            }
            "flush_path" => {
                let Some(path) = args.get("path").and_then(Value::as_str) else {
                    return missing_arg("path");
                };
                self.command_flush_path(path).await
            }
            "flush journal" => match self.command_flush_journal().await {
                Ok(()) => CommandResult {
                    return_code: 0,
                    message: String::new(),
                    data: Value::Null,
                },
                Err(status) => {
                    CommandResult::err(status.errno(), status.message().unwrap_or_default())
                }
            },
            "get subtrees" => self.command_get_subtrees().await,
            "export dir" => {
                let Some(path) = args.get("path").and_then(Value::as_str) else {
                    return CommandResult::err(-libc::EINVAL, "malformed path");
                };
                let Some(rank) = args.get("rank").and_then(Value::as_i64) else {
                    return CommandResult::err(-libc::EINVAL, "malformed rank");
                };
                result_of(self.command_export_dir(path, Rank(rank as i32)).await)
            }
            "dump cache" => {
                let path = args.get("path").and_then(Value::as_str);
                let dump = self
                    .with_core(|core| core.subsystems.mdcache.dump(path))
                    .await;
                CommandResult::ok(dump)
            }
            "force_readonly" => {
                self.with_core(|core| core.subsystems.mdcache.force_readonly())
                    .await;
                CommandResult::ok(Value::Null)
            }
            "dirfrag split" => self.command_dirfrag_split(args).await,
            "dirfrag merge" => self.command_dirfrag_merge(args).await,
            "dirfrag ls" => self.command_dirfrag_ls(args).await,
            _ => CommandResult::err(-libc::EINVAL, format!("unrecognized command! {}", command)),
        }
    }

    async fn command_status(&self) -> CommandResult {
        let osd_epoch = self.inner.clients.objecter.get_osdmap_epoch();
        self.with_core(|core| {
            CommandResult::ok(json!({
                "whoami": *core.whoami,
                "state": core.state.name(),
                "want_state": core.want_state.name(),
                "mdsmap_epoch": *core.mdsmap.epoch,
                "osdmap_epoch": *osd_epoch,
                "osdmap_epoch_barrier": *core.osd_epoch_barrier,
            }))
        })
        .await
    }

    async fn command_osdmap_barrier(&self, args: &Map<String, Value>) -> CommandResult {
        let Some(target) = args.get("target_epoch").and_then(Value::as_i64) else {
            return CommandResult::err(-libc::EINVAL, "no target epoch given");
        };
        let target = ferrofs_types::Epoch(target as u64);

        self.with_core(|core| self.set_osd_epoch_barrier(core, target))
            .await;

        // Wait for the map without the daemon lock.
        tracing::debug!(epoch = *target, "waiting for OSD epoch");
        self.inner.clients.objecter.wait_for_map(target).await;
        CommandResult::ok(json!({ "epoch": *target }))
    }

    async fn command_session_ls(&self) -> CommandResult {
        self.heartbeat_reset();
        self.with_core(|core| {
            let in_clientreplay = core.state == DaemonState::ClientReplay;
            let sessions: Vec<Value> = core
                .sessions
                .client_sessions()
                .map(|s| {
                    let reconnecting = core.subsystems.server.waiting_for_reconnect(s.name);
                    s.dump(in_clientreplay, reconnecting)
                })
                .collect();
            CommandResult::ok(json!({ "sessions": sessions }))
        })
        .await
    }

    async fn command_session_evict(&self, args: &Map<String, Value>) -> CommandResult {
        let Some(client_id) = args.get("client_id").and_then(Value::as_str) else {
            return missing_arg("client_id");
        };
        let Ok(gid) = client_id.parse::<u64>() else {
            return CommandResult::err(-libc::EINVAL, format!("bad client_id '{}'", client_id));
        };
        let name = EntityName::client(GlobalId(gid));

        let rx = {
            let mut core = self.inner.lock.lock().await;
            if !self.kill_session_locked(&mut core, name) {
                return CommandResult::err(
                    -libc::ENOENT,
                    format!("session '{}' not found", client_id),
                );
            }
            // Eviction reports success only once the session close is
            // durable.
            let rx = core.mdlog.wait_for_safe();
            MdsInner::kick_journal_flush(&self.inner, &mut core);
            rx
        };
        let r = rx.await.unwrap_or(-libc::ECANCELED);
        if r != 0 {
            return CommandResult::err(r, "error waiting for session close to flush");
        }
        CommandResult::ok(Value::Null)
    }

    async fn command_scrub_path(&self, path: &str) -> CommandResult {
        let rx = {
            let mut core = self.inner.lock.lock().await;
            let (tx, rx) = tokio::sync::oneshot::channel();
            core.subsystems.mdcache.scrub_path(path, tx);
            rx
        };
        let r = rx.await.unwrap_or(-libc::ECANCELED);
        CommandResult {
            return_code: r,
            message: String::new(),
            data: Value::Null,
        }
    }

    async fn command_flush_path(&self, path: &str) -> CommandResult {
        let rx = {
            let mut core = self.inner.lock.lock().await;
            let (tx, rx) = tokio::sync::oneshot::channel();
            core.subsystems.mdcache.flush_path(path, tx);
            rx
        };
        let r = rx.await.unwrap_or(-libc::ECANCELED);
        CommandResult {
            return_code: r,
            message: String::new(),
            data: Value::Null,
        }
    }

    async fn command_get_subtrees(&self) -> CommandResult {
        self.with_core(|core| {
            let subtrees: Vec<Value> = core
                .subsystems
                .mdcache
                .list_subtrees()
                .iter()
                .map(|s| {
                    json!({
                        "is_auth": s.is_auth,
                        "auth_first": *s.auth_first,
                        "auth_second": *s.auth_second,
                        "dir": { "path": &s.path },
                    })
                })
                .collect();
            CommandResult::ok(json!({ "subtrees": subtrees }))
        })
        .await
    }

    pub(crate) async fn command_export_dir(&self, path: &str, target: Rank) -> Result<()> {
        let mut core = self.inner.lock.lock().await;
        if target == core.whoami || !core.mdsmap.is_up(target) || !core.mdsmap.is_in(target) {
            tracing::error!(target = *target, "bad MDS target");
            return make_error_msg(
                MdsCode::BAD_RANK_TARGET,
                format!("bad MDS target {}", target),
            );
        }
        if !core.subsystems.mdcache.path_in_cache(path) {
            tracing::error!(path, "bad export path");
            return make_error_msg(MdsCode::PATH_NOT_IN_CACHE, format!("bad path '{}'", path));
        }
        if core.subsystems.mdcache.dir_is_auth(path, FragId::ROOT) != Some(true) {
            tracing::error!(path, "export path root fragment missing or not auth");
            return make_error_msg(
                MdsCode::DIR_NOT_AUTH,
                format!("root fragment of '{}' missing or not auth", path),
            );
        }
        core.subsystems.migrator.export_dir(path, target)
    }

    /// Resolve and validate the (path, frag) pair common to the
    /// dirfrag commands.
    fn dirfrag_get(
        core: &MdsCore,
        args: &Map<String, Value>,
        require_auth: bool,
    ) -> std::result::Result<(String, FragId), CommandResult> {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return Err(missing_arg("path"));
        };
        let Some(frag_str) = args.get("frag").and_then(Value::as_str) else {
            return Err(missing_arg("frag"));
        };
        let Ok(frag) = frag_str.parse::<FragId>() else {
            return Err(CommandResult::err(
                -libc::EINVAL,
                format!("frag {} failed to parse", frag_str),
            ));
        };
        if !core.subsystems.mdcache.path_in_cache(path) {
            return Err(CommandResult::err(
                -libc::ENOENT,
                format!("directory '{}' inode not in cache", path),
            ));
        }
        if require_auth {
            match core.subsystems.mdcache.dir_is_auth(path, frag) {
                Some(true) => {}
                Some(false) => {
                    return Err(CommandResult::err(
                        -libc::EINVAL,
                        format!("frag {} not auth", frag),
                    ));
                }
                None => {
                    return Err(CommandResult::err(
                        -libc::ENOENT,
                        format!(
                            "frag {} not in cache (use `dirfrag ls` to see if it should exist)",
                            frag
                        ),
                    ));
                }
            }
        }
        Ok((path.to_string(), frag))
    }

    async fn command_dirfrag_split(&self, args: &Map<String, Value>) -> CommandResult {
        let Some(bits) = args.get("bits").and_then(Value::as_i64) else {
            return missing_arg("bits");
        };
        if bits <= 0 {
            return CommandResult::err(-libc::EINVAL, "must split by >0 bits");
        }
        self.with_core(|core| {
            let (path, frag) = match Self::dirfrag_get(core, args, true) {
                Ok(v) => v,
                Err(result) => return result,
            };
            result_of(core.subsystems.mdcache.split_dir(&path, frag, bits as i32))
        })
        .await
    }

    async fn command_dirfrag_merge(&self, args: &Map<String, Value>) -> CommandResult {
        self.with_core(|core| {
            let (path, frag) = match Self::dirfrag_get(core, args, false) {
                Ok(v) => v,
                Err(result) => return result,
            };
            result_of(core.subsystems.mdcache.merge_dir(&path, frag))
        })
        .await
    }

    async fn command_dirfrag_ls(&self, args: &Map<String, Value>) -> CommandResult {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return missing_arg("path");
        };
        self.with_core(|core| {
            let Some(frags) = core.subsystems.mdcache.dir_frags(path) else {
                return CommandResult::err(
                    -libc::ENOENT,
                    format!("directory '{}' inode not in cache", path),
                );
            };
            let frags: Vec<Value> = frags
                .iter()
                .map(|f| {
                    json!({
                        "value": f.value,
                        "bits": f.bits,
                        "str": f.to_string(),
                    })
                })
                .collect();
            CommandResult::ok(json!({ "frags": frags }))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Monitor-routed structured commands
    // -----------------------------------------------------------------------

    /// Handle an `MCommand`-style message: check the `tell` capability,
    /// run the command, reply on the session's connection, then run any
    /// deferred action.
    pub async fn handle_command_message(
        &self,
        source: EntityName,
        tid: u64,
        request: CommandRequest,
    ) {
        let allowed = self
            .with_core(|core| {
                core.sessions
                    .get(source)
                    .map(|s| s.caps.allow_all())
                    .unwrap_or(false)
            })
            .await;

        let (result, deferred) = if !allowed {
            tracing::info!(%source, "received command from client without `tell` capability");
            (CommandResult::err(-libc::EPERM, "permission denied"), None)
        } else if request.prefix.is_empty() {
            (CommandResult::err(-libc::EINVAL, "no command given"), None)
        } else {
            self.handle_structured_command(&request).await
        };

        self.with_core(|core| {
            if let Some(session) = core.sessions.get_mut(source) {
                session.send_message(Message::CommandReply { tid, result });
            }
        })
        .await;

        if let Some(action) = deferred {
            let mds = self.clone();
            tokio::spawn(async move {
                // Give the reply a chance to land before we vanish
                // from the map.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                let mut core = mds.inner.lock.lock().await;
                match action {
                    DeferredAction::Exit => mds.suicide(&mut core).await,
                    DeferredAction::Respawn => mds.respawn(&mut core),
                }
            });
        }
    }

    /// Run one structured command; the caller has already verified the
    /// sender's capability.
    pub async fn handle_structured_command(
        &self,
        request: &CommandRequest,
    ) -> (CommandResult, Option<DeferredAction>) {
        match request.prefix.as_str() {
            "get_command_descriptions" => {
                let descriptions = Self::mon_command_descriptions();
                (
                    CommandResult::ok(json!({ "command_descriptions": descriptions })),
                    None,
                )
            }
            "injectargs" => {
                let Some(injected) = request.get_str("injected_args") else {
                    return (
                        CommandResult::err(-libc::EINVAL, "ignoring empty injectargs"),
                        None,
                    );
                };
                (self.injectargs(injected), None)
            }
            "exit" => (
                CommandResult {
                    return_code: 0,
                    message: "Exiting...".into(),
                    data: Value::Null,
                },
                Some(DeferredAction::Exit),
            ),
            "respawn" => (
                CommandResult {
                    return_code: 0,
                    message: "Respawning...".into(),
                    data: Value::Null,
                },
                Some(DeferredAction::Respawn),
            ),
            "session kill" => {
                let Some(session_id) = request.get_i64("session_id") else {
                    return (missing_arg("session_id"), None);
                };
                let name = EntityName::client(GlobalId(session_id as u64));
                let killed = self
                    .with_core(|core| self.kill_session_locked(core, name))
                    .await;
                if killed {
                    (CommandResult::ok(Value::Null), None)
                } else {
                    (
                        CommandResult::err(
                            -libc::ENOENT,
                            format!("session '{}' not found", session_id),
                        ),
                        None,
                    )
                }
            }
            "heap" => (
                CommandResult::err(
                    -libc::EOPNOTSUPP,
                    "could not issue heap profiler command -- not compiled with profiler support",
                ),
                None,
            ),
            "cpu_profiler" => (
                CommandResult::err(-libc::EOPNOTSUPP, "cpu_profiler support not linked in"),
                None,
            ),
            other => (
                CommandResult::err(-libc::EINVAL, format!("unrecognized command! {}", other)),
                None,
            ),
        }
    }

    /// Apply runtime configuration overrides. Only hot-updatable fields
    /// change; everything else keeps its current value.
    pub fn injectargs(&self, injected: &str) -> CommandResult {
        let injected_doc: toml::Value = match injected.parse() {
            Ok(v) => v,
            Err(e) => {
                return CommandResult::err(
                    -libc::EINVAL,
                    format!("failed to parse injected args: {}", e),
                );
            }
        };

        // Overlay the injected keys on the current config so fields
        // not mentioned keep their values.
        let mut doc: toml::Value = self
            .inner
            .config
            .snapshot()
            .render()
            .parse()
            .expect("rendered config is valid TOML");
        if let (Some(table), Some(injected_table)) =
            (doc.as_table_mut(), injected_doc.as_table())
        {
            for (key, value) in injected_table {
                table.insert(key.clone(), value.clone());
            }
        }

        let merged = match MdsConfig::from_toml(&doc) {
            Ok(cfg) => cfg,
            Err(e) => {
                return CommandResult::err(-libc::EINVAL, format!("bad injected args: {}", e));
            }
        };
        if let Err(e) = self.inner.config.apply_hot(&merged) {
            return CommandResult::err(-libc::EINVAL, format!("failed to apply: {}", e));
        }
        self.apply_config();
        tracing::info!(injected, "injectargs applied");
        CommandResult::ok(Value::Null)
    }

    // -----------------------------------------------------------------------
    // Legacy vector-of-strings commands
    // -----------------------------------------------------------------------

    pub async fn handle_legacy_command(&self, args: Vec<String>) {
        tracing::debug!(?args, "handle_command args");
        let Some(cmd) = args.first() else {
            return;
        };
        match cmd.as_str() {
            "injectargs" => {
                if args.len() < 2 {
                    tracing::error!("ignoring empty injectargs!");
                } else {
                    let result = self.injectargs(&args[1]);
                    if !result.is_ok() {
                        tracing::error!(message = %result.message, "injectargs failed");
                    }
                }
            }
            "dumpcache" => {
                self.with_core(|core| core.subsystems.mdcache.dump(args.get(1).map(String::as_str)))
                    .await;
            }
            "exit" => {
                let mut core = self.inner.lock.lock().await;
                self.suicide(&mut core).await;
            }
            "respawn" => {
                let mut core = self.inner.lock.lock().await;
                self.respawn(&mut core);
            }
            "session" if args.get(1).map(String::as_str) == Some("kill") => {
                let gid = args.get(2).and_then(|s| s.parse::<u64>().ok());
                match gid {
                    Some(gid) => {
                        let name = EntityName::client(GlobalId(gid));
                        self.with_core(|core| self.kill_session_locked(core, name))
                            .await;
                    }
                    None => tracing::error!("bad session kill syntax"),
                }
            }
            "export_dir" => {
                if args.len() == 3 {
                    if let Ok(rank) = args[2].parse::<i32>() {
                        if let Err(e) = self.command_export_dir(&args[1], Rank(rank)).await {
                            tracing::error!(%e, "export_dir failed");
                        }
                    } else {
                        tracing::error!("bad export_dir target syntax");
                    }
                } else {
                    tracing::error!("bad export_dir syntax");
                }
            }
            "fragment_dir" => {
                if args.len() == 4 {
                    let mut cmd_args = Map::new();
                    cmd_args.insert("path".into(), args[1].clone().into());
                    cmd_args.insert("frag".into(), args[2].clone().into());
                    if let Ok(bits) = args[3].parse::<i64>() {
                        cmd_args.insert("bits".into(), bits.into());
                        let result = self.command_dirfrag_split(&cmd_args).await;
                        if !result.is_ok() {
                            tracing::error!(message = %result.message, "fragment_dir failed");
                        }
                    } else {
                        tracing::error!("bad fragment_dir bits");
                    }
                } else {
                    tracing::error!("bad fragment_dir syntax");
                }
            }
            "merge_dir" => {
                if args.len() == 3 {
                    let mut cmd_args = Map::new();
                    cmd_args.insert("path".into(), args[1].clone().into());
                    cmd_args.insert("frag".into(), args[2].clone().into());
                    let result = self.command_dirfrag_merge(&cmd_args).await;
                    if !result.is_ok() {
                        tracing::error!(message = %result.message, "merge_dir failed");
                    }
                } else {
                    tracing::error!("bad merge_dir syntax");
                }
            }
            "cpu_profiler" | "heap" => {
                self.inner
                    .clog
                    .info("profiler support not linked in, ignoring");
            }
            _ => tracing::warn!(?args, "unrecognized command!"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::Connection;
    use crate::testing::TestMds;
    use ferrofs_types::Epoch;
    use serde_json::Map;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_status_works_while_inactive() {
        let h = TestMds::new().await;
        let result = h.mds.asok_command("status", &Map::new()).await;
        assert!(result.is_ok());
        assert_eq!(result.data["whoami"], -1);
        assert_eq!(result.data["state"], "boot");
    }

    #[tokio::test]
    async fn test_non_status_rejected_while_inactive() {
        let h = TestMds::new().await;
        let result = h.mds.asok_command("session ls", &Map::new()).await;
        assert!(!result.is_ok());
        assert_eq!(result.message, "mds_not_active");
    }

    #[tokio::test]
    async fn test_unrecognized_command() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        let result = h.mds.asok_command("frobnicate", &Map::new()).await;
        assert_eq!(result.return_code, -libc::EINVAL);
        assert!(result.message.contains("unrecognized"));
    }

    #[tokio::test]
    async fn test_ops_dumps() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        let result = h.mds.asok_command("ops", &Map::new()).await;
        assert!(result.is_ok());
        // Our own asok op is in flight.
        assert_eq!(result.data["num_ops"], 1);
    }

    #[tokio::test]
    async fn test_osdmap_barrier() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.objecter.set_epoch(Epoch(20));

        let result = h
            .mds
            .asok_command("osdmap barrier", &args(&[("target_epoch", json!(15))]))
            .await;
        assert!(result.is_ok());
        assert_eq!(h.mds.osd_epoch_barrier().await, Epoch(15));

        let result = h.mds.asok_command("osdmap barrier", &Map::new()).await;
        assert_eq!(result.message, "no target epoch given");
    }

    #[tokio::test]
    async fn test_session_ls_and_evict() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;

        let name = EntityName::client(GlobalId(4100));
        h.mds
            .with_core(|core| {
                let session = core.sessions.get_or_create(
                    name,
                    ferrofs_proto::Address::from_octets(10, 0, 0, 9, 4000),
                );
                session.num_caps = 2;
            })
            .await;

        let result = h.mds.asok_command("session ls", &Map::new()).await;
        assert_eq!(result.data["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(result.data["sessions"][0]["id"], 4100);

        let result = h
            .mds
            .asok_command("session evict", &args(&[("client_id", json!("4100"))]))
            .await;
        assert!(result.is_ok(), "evict failed: {}", result.message);
        assert!(
            h.mds
                .with_core(|core| core.sessions.get(name).is_none())
                .await
        );

        // Evicting again: not found.
        let result = h
            .mds
            .asok_command("session evict", &args(&[("client_id", json!("4100"))]))
            .await;
        assert_eq!(result.return_code, -libc::ENOENT);
    }

    #[tokio::test]
    async fn test_export_dir_validation() {
        let h = TestMds::new().await;
        // Two-rank cluster, we are rank 0.
        h.accept_map(
            h.map_builder()
                .epoch(1)
                .up(h.gid, "mds-a", 0, DaemonState::Active)
                .up(GlobalId(5000), "mds-b", 1, DaemonState::Active)
                .build(),
        )
        .await;
        h.cache.add_dir("/exports", true);

        // Self target.
        let result = h
            .mds
            .asok_command(
                "export dir",
                &args(&[("path", json!("/exports")), ("rank", json!(0))]),
            )
            .await;
        assert_eq!(result.return_code, -libc::ENOENT);

        // Target not in the map.
        let result = h
            .mds
            .asok_command(
                "export dir",
                &args(&[("path", json!("/exports")), ("rank", json!(7))]),
            )
            .await;
        assert_eq!(result.return_code, -libc::ENOENT);

        // Path not cached.
        let result = h
            .mds
            .asok_command(
                "export dir",
                &args(&[("path", json!("/nope")), ("rank", json!(1))]),
            )
            .await;
        assert_eq!(result.return_code, -libc::ENOENT);

        // Good export.
        let result = h
            .mds
            .asok_command(
                "export dir",
                &args(&[("path", json!("/exports")), ("rank", json!(1))]),
            )
            .await;
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(
            h.migrator.state.lock().exports.as_slice(),
            [("/exports".to_string(), Rank(1))]
        );
    }

    #[tokio::test]
    async fn test_dirfrag_split_validation() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.cache.add_dir("/d", true);

        // bits must be positive.
        let result = h
            .mds
            .asok_command(
                "dirfrag split",
                &args(&[
                    ("path", json!("/d")),
                    ("frag", json!("0/0")),
                    ("bits", json!(0)),
                ]),
            )
            .await;
        assert_eq!(result.message, "must split by >0 bits");

        // Unparseable fragment.
        let result = h
            .mds
            .asok_command(
                "dirfrag split",
                &args(&[
                    ("path", json!("/d")),
                    ("frag", json!("bogus")),
                    ("bits", json!(1)),
                ]),
            )
            .await;
        assert!(result.message.contains("failed to parse"));

        // Success.
        let result = h
            .mds
            .asok_command(
                "dirfrag split",
                &args(&[
                    ("path", json!("/d")),
                    ("frag", json!("0/0")),
                    ("bits", json!(1)),
                ]),
            )
            .await;
        assert!(result.is_ok(), "{}", result.message);

        let result = h
            .mds
            .asok_command("dirfrag ls", &args(&[("path", json!("/d"))]))
            .await;
        assert_eq!(result.data["frags"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_structured_command_requires_tell_cap() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;

        let name = EntityName::client(GlobalId(4100));
        let con = h.client_connection();
        h.mds
            .with_core(|core| {
                let session = core.sessions.get_or_create(name, con.peer_addr());
                session.connection = Some(con.clone());
            })
            .await;

        // Without allow-all: EPERM.
        h.mds
            .handle_command_message(name, 1, CommandRequest::new("respawn"))
            .await;
        let sent = con.sent_messages();
        match &sent[0] {
            Message::CommandReply { tid, result } => {
                assert_eq!(*tid, 1);
                assert_eq!(result.return_code, -libc::EPERM);
            }
            other => panic!("unexpected reply {:?}", other.type_name()),
        }
        assert_eq!(h.process.respawn_count(), 0);

        // With allow-all the command runs.
        h.mds
            .with_core(|core| {
                core.sessions
                    .get_mut(name)
                    .unwrap()
                    .caps
                    .set_allow_all();
            })
            .await;
        h.mds
            .handle_command_message(name, 2, CommandRequest::new("get_command_descriptions"))
            .await;
        let sent = con.sent_messages();
        match &sent[1] {
            Message::CommandReply { tid, result } => {
                assert_eq!(*tid, 2);
                assert!(result.is_ok());
                assert!(
                    result.data["command_descriptions"]
                        .as_array()
                        .unwrap()
                        .len()
                        >= 6
                );
            }
            other => panic!("unexpected reply {:?}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_injectargs_hot_update_only() {
        let h = TestMds::new().await;
        let result = h.mds.injectargs("op_history_size = 5");
        assert!(result.is_ok(), "{}", result.message);
        assert_eq!(h.config.snapshot().op_history_size, 5);
        // Untouched hot fields keep their current values.
        assert_eq!(h.config.snapshot().op_complaint_time_ms, 30_000);

        // Cold fields are ignored by the hot update.
        let result = h.mds.injectargs("beacon_interval_ms = 1");
        assert!(result.is_ok());
        assert_eq!(h.config.snapshot().beacon_interval_ms, 4000);

        let result = h.mds.injectargs("not valid {{{");
        assert!(!result.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_session_kill() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        let name = EntityName::client(GlobalId(77));
        h.mds
            .with_core(|core| {
                core.sessions
                    .get_or_create(name, ferrofs_proto::Address::default());
            })
            .await;

        h.mds
            .handle_legacy_command(vec!["session".into(), "kill".into(), "77".into()])
            .await;
        assert!(
            h.mds
                .with_core(|core| core.sessions.get(name).is_none())
                .await
        );
    }

    #[tokio::test]
    async fn test_command_catalogs() {
        let asok = Mds::asok_command_descriptions();
        assert!(asok.iter().any(|c| c.cmd.starts_with("flush journal")));
        assert!(asok.iter().any(|c| c.cmd.starts_with("dirfrag split")));

        let mon = Mds::mon_command_descriptions();
        assert!(mon.iter().any(|c| c.cmd.starts_with("injectargs")));
        assert!(mon.iter().any(|c| c.cmd == "respawn"));
    }
}
