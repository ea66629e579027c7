//! Component B: one state machine per ServiceInstance, run as a long-lived
//! task per the concurrency model's "one task per ServiceInstance" rule.
//! State transitions for a single instance are therefore totally ordered
//! by construction — only this task ever calls `Registry::update_state`
//! for its own name.

use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::mcp::Tool;
use crate::registry::{Registry, RegistryEvent, RestartPolicy, ServiceState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

/// Polymorphism over kinds (§9): MCPServerInstance, ServiceClassInstance,
/// AggregatorInstance all implement this small interface instead of a
/// deep inheritance hierarchy.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn health_check(&self) -> Result<()>;
    /// Non-empty only for MCP kinds once `Running`.
    async fn exposed_tools(&self) -> Vec<Tool> {
        Vec::new()
    }
}

#[derive(Debug)]
pub enum Command {
    Stop,
    Remove,
}

pub struct StateMachineConfig {
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub health_failure_threshold: u32,
    pub unhealthy_failure_threshold: u32,
    pub restart_count_reset_after: Duration,
}

impl StateMachineConfig {
    pub fn from_health_config(cfg: &HealthConfig) -> Self {
        Self {
            start_timeout: Duration::from_secs(cfg.start_timeout_secs),
            stop_grace: Duration::from_secs(cfg.stop_grace_secs),
            health_interval: Duration::from_secs(cfg.default_interval_secs),
            health_timeout: Duration::from_secs(cfg.default_timeout_secs),
            health_failure_threshold: cfg.health_failure_threshold,
            unhealthy_failure_threshold: cfg.unhealthy_failure_threshold,
            restart_count_reset_after: Duration::from_secs(cfg.restart_count_reset_after_secs),
        }
    }
}

pub struct StateMachineHandle {
    pub commands: mpsc::Sender<Command>,
    pub state: watch::Receiver<ServiceState>,
    pub join: tokio::task::JoinHandle<()>,
}

/// 1,2,4,8,...,60s capped — shared by both the state machine's restart
/// schedule and the upstream client's reconnect loop.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(6)).unwrap_or(60).min(60);
    Duration::from_secs(secs)
}

pub fn spawn(
    name: String,
    registry: Arc<Registry>,
    runtime: Arc<dyn ServiceRuntime>,
    max_restart_attempts: Option<u32>,
    config: StateMachineConfig,
) -> StateMachineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let initial = registry.get(&name).map(|i| i.state).unwrap_or(ServiceState::Pending);
    let (state_tx, state_rx) = watch::channel(initial);

    let join = tokio::spawn(run(name, registry, runtime, max_restart_attempts, config, cmd_rx, state_tx));

    StateMachineHandle {
        commands: cmd_tx,
        state: state_rx,
        join,
    }
}

fn dependencies_ready(registry: &Registry, deps: &[String]) -> bool {
    deps.iter().all(|d| {
        registry
            .get(d)
            .map(|i| i.state == ServiceState::Running)
            .unwrap_or(false)
    })
}

fn dependencies_permanently_blocked(registry: &Registry, deps: &[String]) -> bool {
    deps.iter().any(|d| {
        registry
            .get(d)
            .map(|i| {
                i.state == ServiceState::Terminal
                    || i.state == ServiceState::Removed
                    || (i.state == ServiceState::Failed && i.restart_policy == RestartPolicy::Never)
            })
            .unwrap_or(true)
    })
}

async fn run(
    name: String,
    registry: Arc<Registry>,
    runtime: Arc<dyn ServiceRuntime>,
    max_restart_attempts: Option<u32>,
    config: StateMachineConfig,
    mut commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ServiceState>,
) {
    let mut pending_command: Option<Command> = None;

    loop {
        let current = match registry.get(&name) {
            Ok(i) => i,
            Err(_) => return,
        };
        let _ = state_tx.send(current.state);

        if let Some(cmd) = pending_command.take() {
            match (current.state, cmd) {
                (ServiceState::Running | ServiceState::Unhealthy, Command::Stop) => {
                    let _ = registry.update_state(&name, |i| i.state = ServiceState::Stopping).await;
                    continue;
                }
                (_, Command::Remove) if !current.state.is_terminal() => {
                    let _ = registry.update_state(&name, |i| i.state = ServiceState::Removing).await;
                    continue;
                }
                _ => {}
            }
        }

        match current.state {
            ServiceState::Pending => {
                if dependencies_permanently_blocked(&registry, &current.dependencies) {
                    let _ = registry
                        .update_state(&name, |i| {
                            i.state = ServiceState::Blocked;
                            i.last_error = Some("dependency will never become Running".to_string());
                        })
                        .await;
                    continue;
                }
                if dependencies_ready(&registry, &current.dependencies) {
                    let _ = registry.update_state(&name, |i| i.state = ServiceState::Starting).await;
                    continue;
                }
                pending_command = wait_for_event_or_command(&registry, &mut commands).await;
            }

            ServiceState::Blocked => {
                if !dependencies_permanently_blocked(&registry, &current.dependencies)
                    && dependencies_ready(&registry, &current.dependencies)
                {
                    let _ = registry.update_state(&name, |i| i.state = ServiceState::Starting).await;
                    continue;
                }
                pending_command = wait_for_event_or_command(&registry, &mut commands).await;
            }

            ServiceState::Starting => {
                let start_result = timeout(config.start_timeout, runtime.start()).await;
                let ok = match start_result {
                    Ok(Ok(())) => timeout(config.health_timeout, runtime.health_check())
                        .await
                        .map(|r| r.is_ok())
                        .unwrap_or(false),
                    _ => false,
                };

                if ok {
                    let tools = runtime.exposed_tools().await;
                    let _ = registry
                        .update_state(&name, |i| {
                            i.state = ServiceState::Running;
                            i.started_at = Some(chrono::Utc::now());
                            i.health_failure_count = 0;
                            i.exposed_tools = tools;
                            i.last_error = None;
                        })
                        .await;
                    info!(service = %name, "started");
                } else {
                    let _ = registry
                        .update_state(&name, |i| {
                            i.state = ServiceState::Failed;
                            i.last_error = Some("start failed or health check did not pass".to_string());
                        })
                        .await;
                    warn!(service = %name, "start failed");
                }
            }

            ServiceState::Running => {
                pending_command = run_health_loop(
                    &name,
                    &registry,
                    runtime.as_ref(),
                    &config,
                    &mut commands,
                    ServiceState::Running,
                )
                .await;
            }

            ServiceState::Unhealthy => {
                pending_command = run_health_loop(
                    &name,
                    &registry,
                    runtime.as_ref(),
                    &config,
                    &mut commands,
                    ServiceState::Unhealthy,
                )
                .await;
            }

            ServiceState::Failed => {
                let restart_count = current.restart_count;
                let should_restart = match current.restart_policy {
                    RestartPolicy::Always => true,
                    RestartPolicy::OnFailure => {
                        max_restart_attempts.map(|n| restart_count < n).unwrap_or(true)
                    }
                    RestartPolicy::Never => false,
                };

                if !should_restart {
                    let _ = registry.update_state(&name, |i| i.state = ServiceState::Terminal).await;
                    continue;
                }

                let delay = backoff_delay(restart_count);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = registry
                            .update_state(&name, |i| {
                                i.state = ServiceState::Starting;
                                i.restart_count += 1;
                            })
                            .await;
                    }
                    cmd = commands.recv() => {
                        pending_command = cmd;
                        if matches!(pending_command, Some(Command::Remove)) {
                            let _ = registry.update_state(&name, |i| i.state = ServiceState::Removing).await;
                        }
                    }
                }
            }

            ServiceState::Stopping => {
                let _ = timeout(config.stop_grace, runtime.stop()).await;
                let _ = registry.update_state(&name, |i| i.state = ServiceState::Stopped).await;
            }

            ServiceState::Stopped => {
                pending_command = commands.recv().await;
            }

            ServiceState::Removing => {
                let _ = timeout(config.stop_grace, runtime.stop()).await;
                match registry.deregister(&name).await {
                    Ok(()) => {
                        let _ = state_tx.send(ServiceState::Removed);
                        return;
                    }
                    Err(Error::HasDependents(_)) => {
                        // A dependent appeared mid-teardown; retry once it clears.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(_) => return,
                }
            }

            ServiceState::Terminal | ServiceState::Removed => return,
        }
    }
}

/// Polls health on `config.health_interval` while listening for a stop/
/// remove command, returning it to the caller for state-specific handling.
/// `restart_count` resets after a continuous span of `Running` that meets
/// `restart_count_reset_after`.
async fn run_health_loop(
    name: &str,
    registry: &Registry,
    runtime: &dyn ServiceRuntime,
    config: &StateMachineConfig,
    commands: &mut mpsc::Receiver<Command>,
    entered_as: ServiceState,
) -> Option<Command> {
    let mut interval = tokio::time::interval(config.health_interval);
    interval.tick().await; // first tick fires immediately; discard.
    let reset_deadline = tokio::time::sleep(config.restart_count_reset_after);
    tokio::pin!(reset_deadline);

    loop {
        tokio::select! {
            cmd = commands.recv() => return cmd,
            _ = &mut reset_deadline, if entered_as == ServiceState::Running => {
                let _ = registry.update_state(name, |i| i.restart_count = 0).await;
            }
            _ = interval.tick() => {
                let healthy = timeout(config.health_timeout, runtime.health_check())
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);

                let current = match registry.get(name) { Ok(i) => i, Err(_) => return None };
                if current.state != entered_as {
                    return None; // someone else moved us along; re-evaluate from the top.
                }

                if healthy {
                    if entered_as == ServiceState::Unhealthy {
                        let _ = registry
                            .update_state(name, |i| {
                                i.state = ServiceState::Running;
                                i.health_failure_count = 0;
                            })
                            .await;
                        return None;
                    }
                    continue;
                }

                let failure_count = current.health_failure_count + 1;
                let threshold = if entered_as == ServiceState::Running {
                    config.health_failure_threshold
                } else {
                    config.unhealthy_failure_threshold
                };

                if failure_count >= threshold {
                    if entered_as == ServiceState::Running {
                        let _ = registry
                            .update_state(name, |i| {
                                i.state = ServiceState::Unhealthy;
                                i.health_failure_count = 0;
                            })
                            .await;
                    } else {
                        let _ = registry
                            .update_state(name, |i| {
                                i.state = ServiceState::Failed;
                                i.last_error = Some("unhealthy threshold exceeded".to_string());
                            })
                            .await;
                    }
                    return None;
                } else {
                    let _ = registry.update_state(name, |i| i.health_failure_count = failure_count).await;
                }
            }
        }
    }
}

/// Blocks until either a command arrives or the registry reports a change
/// that could affect this instance's dependency readiness (a dependency's
/// state changed, or a lagged notice forces a re-check).
async fn wait_for_event_or_command(
    registry: &Registry,
    commands: &mut mpsc::Receiver<Command>,
) -> Option<Command> {
    let mut sub = registry.subscribe();
    tokio::select! {
        cmd = commands.recv() => cmd,
        _ = async {
            loop {
                match sub.recv().await {
                    RegistryEvent::StateChanged(_, _) | RegistryEvent::Lagged => return,
                    _ => continue,
                }
            }
        } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceDefinition, ServiceInstance};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRuntime {
        start_calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl ServiceRuntime for CountingRuntime {
        async fn start(&self) -> Result<()> {
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(Error::Transient("connect refused".into()))
            } else {
                Ok(())
            }
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn def(name: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
            kind: crate::registry::ServiceKind::McpServer,
            spec: serde_json::json!({}),
            dependencies: vec![],
            auto_start: true,
            restart_policy: RestartPolicy::OnFailure,
            max_restart_attempts: Some(5),
            health_check: None,
        }
    }

    #[tokio::test]
    async fn restarts_on_transient_failure_then_reaches_running() {
        let registry = Arc::new(Registry::new());
        registry.register(ServiceInstance::pending(&def("svc"), "h".into())).await.unwrap();

        let runtime: Arc<dyn ServiceRuntime> = Arc::new(CountingRuntime {
            start_calls: AtomicU32::new(0),
            fail_first_n: 2,
        });

        let mut config = StateMachineConfig::from_health_config(&crate::config::HealthConfig::default());
        config.start_timeout = Duration::from_millis(200);
        config.health_timeout = Duration::from_millis(200);

        let handle = spawn("svc".to_string(), registry.clone(), runtime, Some(5), config);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let state = registry.get("svc").unwrap().state;
            if state == ServiceState::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never reached Running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let inst = registry.get("svc").unwrap();
        assert_eq!(inst.restart_count, 2);
        drop(handle.commands);
    }
}
