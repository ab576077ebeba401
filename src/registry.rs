use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::OrchestratorError;
use crate::log_warn;
use crate::types::{parse_task_status, truncate_message, TaskStateEntry, TaskStatus};

/// Commands serviced by the Registry actor. Each carries the
/// `oneshot::Sender` its caller awaits on, mirroring the teacher's
/// `CoordinatorCommand` shape.
enum RegistryCommand {
    Initialize {
        names: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    EnsureEntry {
        name: String,
        reply: oneshot::Sender<()>,
    },
    UpdateStatus {
        name: String,
        status: String,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    UpdateStep {
        name: String,
        text: Option<String>,
        reply: oneshot::Sender<()>,
    },
    UpdateMessage {
        name: String,
        text: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<String, TaskStateEntry>>,
    },
    SetUiActive {
        active: bool,
        reply: oneshot::Sender<()>,
    },
    IsUiActive {
        reply: oneshot::Sender<bool>,
    },
}

/// Cheap, `Clone`-able handle to the Registry actor. All mutation goes through
/// the actor's single-threaded loop; readers get a point-in-time snapshot.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        let command = build(tx);
        if self.sender.send(command).await.is_err() {
            panic!("registry actor task has stopped");
        }
        rx.await.expect("registry actor dropped reply sender")
    }

    /// Reset all entries to `{status: pending, step: None, message: None}` and
    /// clear the UI-active flag.
    pub async fn initialize(&self, names: Vec<String>) {
        self.send_command(|reply| RegistryCommand::Initialize { names, reply })
            .await
    }

    /// Seed a `pending` entry for `name` if it isn't already tracked, without
    /// touching any existing entry. Used by the Graph Store's rebuild path
    /// to register tasks discovered mid-run (e.g. a split's subtasks)
    /// without resetting the rest of the Registry the way `initialize`
    /// would.
    pub async fn ensure_entry(&self, name: &str) {
        self.send_command(|reply| RegistryCommand::EnsureEntry {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Rejects with `InvalidStatus` if `status` is not one of the four values.
    /// An unknown `name` is a warn-and-no-op, never an error.
    pub async fn update_status(&self, name: &str, status: &str) -> Result<(), OrchestratorError> {
        self.send_command(|reply| RegistryCommand::UpdateStatus {
            name: name.to_string(),
            status: status.to_string(),
            reply,
        })
        .await
    }

    pub async fn update_step(&self, name: &str, text: Option<&str>) {
        self.send_command(|reply| RegistryCommand::UpdateStep {
            name: name.to_string(),
            text: text.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn update_message(&self, name: &str, text: Option<&str>) {
        self.send_command(|reply| RegistryCommand::UpdateMessage {
            name: name.to_string(),
            text: text.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> HashMap<String, TaskStateEntry> {
        self.send_command(|reply| RegistryCommand::Snapshot { reply })
            .await
    }

    pub async fn set_ui_active(&self, active: bool) {
        self.send_command(|reply| RegistryCommand::SetUiActive { active, reply })
            .await
    }

    pub async fn is_ui_active(&self) -> bool {
        self.send_command(|reply| RegistryCommand::IsUiActive { reply })
            .await
    }
}

struct RegistryState {
    entries: HashMap<String, TaskStateEntry>,
    ui_active: bool,
}

async fn run_registry(mut rx: mpsc::Receiver<RegistryCommand>) {
    let mut state = RegistryState {
        entries: HashMap::new(),
        ui_active: false,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCommand::Initialize { names, reply } => {
                state.entries = names
                    .into_iter()
                    .map(|name| (name, TaskStateEntry::default()))
                    .collect();
                state.ui_active = false;
                let _ = reply.send(());
            }
            RegistryCommand::EnsureEntry { name, reply } => {
                state.entries.entry(name).or_insert_with(TaskStateEntry::default);
                let _ = reply.send(());
            }
            RegistryCommand::UpdateStatus {
                name,
                status,
                reply,
            } => {
                let result = match parse_task_status(&status) {
                    Ok(parsed) => {
                        if let Some(entry) = state.entries.get_mut(&name) {
                            entry.status = parsed;
                        } else {
                            log_warn!("Registry.updateStatus: unknown task '{}', ignoring", name);
                        }
                        Ok(())
                    }
                    Err(_) => Err(OrchestratorError::InvalidStatus(status)),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::UpdateStep { name, text, reply } => {
                if let Some(entry) = state.entries.get_mut(&name) {
                    entry.step = text;
                } else {
                    log_warn!("Registry.updateStep: unknown task '{}', ignoring", name);
                }
                let _ = reply.send(());
            }
            RegistryCommand::UpdateMessage { name, text, reply } => {
                if let Some(entry) = state.entries.get_mut(&name) {
                    entry.message = text.as_deref().and_then(truncate_message);
                } else {
                    log_warn!("Registry.updateMessage: unknown task '{}', ignoring", name);
                }
                let _ = reply.send(());
            }
            RegistryCommand::Snapshot { reply } => {
                let _ = reply.send(state.entries.clone());
            }
            RegistryCommand::SetUiActive { active, reply } => {
                state.ui_active = active;
                let _ = reply.send(());
            }
            RegistryCommand::IsUiActive { reply } => {
                let _ = reply.send(state.ui_active);
            }
        }
    }
}

/// Spawn the Registry actor. Returns a cheap handle plus the actor's
/// join handle (awaited at shutdown to drain in-flight commands).
pub fn spawn_registry() -> (RegistryHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let join_handle = tokio::spawn(run_registry(rx));
    (RegistryHandle { sender: tx }, join_handle)
}
