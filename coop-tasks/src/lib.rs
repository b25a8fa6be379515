//! COOP Tasks - Delegated-Work Orchestration
//!
//! Tracks the lifecycle of delegated work: created tasks move through
//! assigned and started to completed, failed, or cancelled. The
//! orchestrator persists every transition through storage, flips the
//! assignee's registry status between busy and idle, and notifies the
//! parties over the bus with task request/response messages.

use chrono::Utc;
use coop_bus::MessageBus;
use coop_core::{
    AgentId, AgentStatus, CapabilityQuery, MessagePayload, Observers, Task, TaskCreateRequest,
    TaskId, TaskStatus,
};
use coop_registry::AgentRegistry;
use coop_storage::{Storage, StorageError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Events emitted on task transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreated {
        task: Task,
    },
    TaskAssigned {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
    TaskStarted {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    TaskCompleted {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        status: TaskStatus,
    },
    TaskCancelled {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
}

pub struct TaskOrchestrator {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    observers: Observers<TaskEvent>,
}

impl TaskOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            storage,
            registry,
            bus,
            observers: Observers::new(),
        }
    }

    pub fn observers(&self) -> &Observers<TaskEvent> {
        &self.observers
    }

    /// Create a task. When required capabilities are given, an idle agent
    /// matching all of them is auto-assigned immediately.
    pub async fn create_task(&self, request: TaskCreateRequest) -> Result<Task, TaskError> {
        let task = Task::from_request(request);
        self.storage.save_task(&task).await?;
        tracing::info!(task_id = %task.id, "task created");
        self.observers
            .emit(&TaskEvent::TaskCreated { task: task.clone() });

        if !task.required_capabilities.is_empty() {
            let candidates = self.registry.find_by_capabilities(&CapabilityQuery {
                capabilities: task.required_capabilities.clone(),
                match_all: true,
            });
            if let Some(agent) = candidates
                .into_iter()
                .find(|a| a.status == AgentStatus::Idle)
            {
                if self.assign_task(task.id, agent.id).await? {
                    if let Some(assigned) = self.storage.get_task(task.id).await? {
                        return Ok(assigned);
                    }
                }
            }
        }
        Ok(task)
    }

    /// Assign a pending task. Only the `Pending -> Assigned` transition is
    /// valid; anything else returns false. The assignee is marked busy and
    /// receives a task request message.
    pub async fn assign_task(&self, task_id: TaskId, agent_id: AgentId) -> Result<bool, TaskError> {
        let Some(mut task) = self.storage.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending || self.registry.get_agent(agent_id).is_none() {
            return Ok(false);
        }

        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent_id);
        task.updated_at = Utc::now();
        self.storage.save_task(&task).await?;

        self.registry.update_status(agent_id, AgentStatus::Busy);
        self.bus.send(
            task.created_by,
            Some(agent_id),
            "task_request",
            MessagePayload::TaskRequest {
                task_id,
                description: task.description.clone(),
            },
        );
        self.observers
            .emit(&TaskEvent::TaskAssigned { task_id, agent_id });
        Ok(true)
    }

    /// Mark an assigned task as in progress.
    pub async fn start_task(&self, task_id: TaskId) -> Result<bool, TaskError> {
        let Some(mut task) = self.storage.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Assigned {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        self.storage.save_task(&task).await?;
        self.observers.emit(&TaskEvent::TaskStarted { task_id });
        Ok(true)
    }

    /// Finish a task as completed or failed. Frees the assignee and sends
    /// a task response message back to the creator. Completing a task may
    /// cascade: an in-progress parent whose children are all terminal is
    /// finished too, failing when any child failed.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        result: Option<Value>,
        failed: bool,
    ) -> Result<bool, TaskError> {
        let Some(mut task) = self.storage.get_task(task_id).await? else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Ok(false);
        }

        let mut parent_id = self.finish_task(&mut task, result, failed).await?;
        while let Some(current) = parent_id {
            let Some(mut parent) = self.storage.get_task(current).await? else {
                break;
            };
            if parent.status != TaskStatus::InProgress {
                break;
            }
            let all_tasks = self.storage.get_all_tasks().await?;
            let children: Vec<&Task> = all_tasks
                .iter()
                .filter(|t| t.parent_task_id == Some(current))
                .collect();
            if children.is_empty() || !children.iter().all(|t| t.status.is_terminal()) {
                break;
            }
            let all_completed = children.iter().all(|t| t.status == TaskStatus::Completed);
            let summary = serde_json::json!({
                "subtaskResults": children
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "taskId": t.id,
                            "status": t.status,
                            "result": t.result,
                        })
                    })
                    .collect::<Vec<Value>>(),
            });
            parent_id = self
                .finish_task(&mut parent, Some(summary), !all_completed)
                .await?;
        }
        Ok(true)
    }

    /// Cancel a non-terminal task, freeing its assignee.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool, TaskError> {
        let Some(mut task) = self.storage.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        self.storage.save_task(&task).await?;
        if let Some(agent_id) = task.assigned_to {
            self.registry.update_status(agent_id, AgentStatus::Idle);
        }
        self.observers.emit(&TaskEvent::TaskCancelled { task_id });
        Ok(true)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, TaskError> {
        Ok(self.storage.get_task(task_id).await?)
    }

    /// All tasks, optionally filtered by status, oldest first.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
        let mut tasks = self.storage.get_all_tasks().await?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    /// Finish one task: record the terminal status, free the assignee,
    /// and notify the creator. Returns the parent id for cascading.
    async fn finish_task(
        &self,
        task: &mut Task,
        result: Option<Value>,
        failed: bool,
    ) -> Result<Option<TaskId>, TaskError> {
        let status = if failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        task.status = status;
        task.result = result.clone();
        let now = Utc::now();
        task.updated_at = now;
        task.completed_at = Some(now);
        self.storage.save_task(task).await?;

        if let Some(agent_id) = task.assigned_to {
            self.registry.update_status(agent_id, AgentStatus::Idle);
        }
        self.bus.send(
            task.assigned_to.unwrap_or(task.created_by),
            Some(task.created_by),
            "task_response",
            MessagePayload::TaskResponse {
                task_id: task.id,
                status,
                result,
            },
        );
        self.observers.emit(&TaskEvent::TaskCompleted {
            task_id: task.id,
            status,
        });
        Ok(task.parent_task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coop_core::{AgentRegistration, JsonMap};
    use coop_storage::MemoryStorage;

    fn harness() -> (Arc<MemoryStorage>, Arc<AgentRegistry>, Arc<MessageBus>, TaskOrchestrator) {
        let storage = Arc::new(MemoryStorage::default());
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(MessageBus::default());
        let orchestrator = TaskOrchestrator::new(
            storage.clone() as Arc<dyn Storage>,
            registry.clone(),
            bus.clone(),
        );
        (storage, registry, bus, orchestrator)
    }

    fn register(registry: &AgentRegistry, name: &str, capabilities: &[&str]) -> AgentId {
        registry
            .register(AgentRegistration {
                name: name.to_string(),
                description: String::new(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                metadata: JsonMap::new(),
            })
            .id
    }

    fn task_request(created_by: AgentId, capabilities: &[&str]) -> TaskCreateRequest {
        TaskCreateRequest {
            description: "do the thing".to_string(),
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            created_by,
            payload: serde_json::json!({}),
            parent_task_id: None,
        }
    }

    #[tokio::test]
    async fn create_auto_assigns_matching_idle_agent() {
        let (_, registry, bus, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &["search", "summarize"]);
        register(&registry, "mismatched", &["translate"]);

        let task = orchestrator
            .create_task(task_request(creator, &["search"]))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_to, Some(worker));
        assert_eq!(
            registry.get_agent(worker).unwrap().status,
            AgentStatus::Busy
        );
        // The assignee received a task request over the bus.
        let inbox = bus.get_messages_for_agent(worker);
        assert!(inbox
            .iter()
            .any(|m| m.message_type == "task_request" && m.to == Some(worker)));
    }

    #[tokio::test]
    async fn create_without_capabilities_stays_pending() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let task = orchestrator
            .create_task(task_request(creator, &[]))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn assign_rejects_non_pending_and_unknown_targets() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &[]);

        let task = orchestrator
            .create_task(task_request(creator, &[]))
            .await
            .unwrap();

        assert!(!orchestrator
            .assign_task(task.id, AgentId::new())
            .await
            .unwrap());
        assert!(orchestrator.assign_task(task.id, worker).await.unwrap());
        // Already assigned; a second assignment is refused.
        assert!(!orchestrator.assign_task(task.id, worker).await.unwrap());
        assert!(!orchestrator
            .assign_task(TaskId::new(), worker)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn full_lifecycle_frees_agent_and_notifies_creator() {
        let (_, registry, bus, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &["search"]);

        let task = orchestrator
            .create_task(task_request(creator, &["search"]))
            .await
            .unwrap();
        assert!(orchestrator.start_task(task.id).await.unwrap());
        // Starting twice is refused.
        assert!(!orchestrator.start_task(task.id).await.unwrap());

        assert!(orchestrator
            .complete_task(task.id, Some(serde_json::json!({"answer": 42})), false)
            .await
            .unwrap());

        let finished = orchestrator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert!(finished.completed_at.is_some());
        assert_eq!(
            registry.get_agent(worker).unwrap().status,
            AgentStatus::Idle
        );

        let responses = bus.get_messages_for_agent(creator);
        assert!(responses.iter().any(|m| m.message_type == "task_response"));

        // Terminal task cannot be completed or cancelled again.
        assert!(!orchestrator.complete_task(task.id, None, false).await.unwrap());
        assert!(!orchestrator.cancel_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_completion_records_failed_status() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &["x"]);
        let task = orchestrator
            .create_task(task_request(creator, &["x"]))
            .await
            .unwrap();

        assert!(orchestrator.complete_task(task.id, None, true).await.unwrap());
        let failed = orchestrator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            registry.get_agent(worker).unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn cancel_frees_assignee() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &["x"]);
        let task = orchestrator
            .create_task(task_request(creator, &["x"]))
            .await
            .unwrap();

        assert!(orchestrator.cancel_task(task.id).await.unwrap());
        let cancelled = orchestrator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(
            registry.get_agent(worker).unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn in_progress_parent_completes_when_all_children_terminal() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &[]);

        let parent = orchestrator
            .create_task(task_request(creator, &[]))
            .await
            .unwrap();
        assert!(orchestrator.assign_task(parent.id, worker).await.unwrap());
        assert!(orchestrator.start_task(parent.id).await.unwrap());

        let mut child_request = task_request(creator, &[]);
        child_request.parent_task_id = Some(parent.id);
        let child_a = orchestrator.create_task(child_request.clone()).await.unwrap();
        let child_b = orchestrator.create_task(child_request).await.unwrap();

        for child in [child_a.id, child_b.id] {
            assert!(orchestrator.assign_task(child, worker).await.unwrap());
            assert!(orchestrator.complete_task(child, None, false).await.unwrap());
        }

        let parent = orchestrator.get_task(parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Completed);
        // The cascade records a roll-up of the children's outcomes.
        let summary = parent.result.unwrap();
        assert_eq!(summary["subtaskResults"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_child_fails_in_progress_parent() {
        let (_, registry, bus, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &[]);

        let parent = orchestrator
            .create_task(task_request(creator, &[]))
            .await
            .unwrap();
        assert!(orchestrator.assign_task(parent.id, worker).await.unwrap());
        assert!(orchestrator.start_task(parent.id).await.unwrap());

        let mut child_request = task_request(creator, &[]);
        child_request.parent_task_id = Some(parent.id);
        let ok_child = orchestrator.create_task(child_request.clone()).await.unwrap();
        let bad_child = orchestrator.create_task(child_request).await.unwrap();

        assert!(orchestrator.assign_task(ok_child.id, worker).await.unwrap());
        assert!(orchestrator.complete_task(ok_child.id, None, false).await.unwrap());
        assert!(orchestrator.assign_task(bad_child.id, worker).await.unwrap());
        assert!(orchestrator.complete_task(bad_child.id, None, true).await.unwrap());

        let parent = orchestrator.get_task(parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Failed);
        // The creator was told about the parent's outcome too.
        let responses = bus.get_messages_for_agent(creator);
        assert!(responses.iter().any(|m| matches!(
            &m.payload,
            MessagePayload::TaskResponse { task_id, status, .. }
                if *task_id == parent.id && *status == TaskStatus::Failed
        )));
    }

    #[tokio::test]
    async fn pending_parent_is_left_alone_by_child_completion() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &[]);

        let parent = orchestrator
            .create_task(task_request(creator, &[]))
            .await
            .unwrap();
        let mut child_request = task_request(creator, &[]);
        child_request.parent_task_id = Some(parent.id);
        let child = orchestrator.create_task(child_request).await.unwrap();

        assert!(orchestrator.assign_task(child.id, worker).await.unwrap());
        assert!(orchestrator.start_task(child.id).await.unwrap());
        assert!(orchestrator.complete_task(child.id, None, true).await.unwrap());

        let parent = orchestrator.get_task(parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Pending);
        assert!(parent.completed_at.is_none());
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status() {
        let (_, registry, _, orchestrator) = harness();
        let creator = register(&registry, "creator", &[]);
        let worker = register(&registry, "worker", &[]);

        let a = orchestrator.create_task(task_request(creator, &[])).await.unwrap();
        orchestrator.create_task(task_request(creator, &[])).await.unwrap();
        orchestrator.assign_task(a.id, worker).await.unwrap();

        assert_eq!(orchestrator.list_tasks(None).await.unwrap().len(), 2);
        assert_eq!(
            orchestrator
                .list_tasks(Some(TaskStatus::Pending))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            orchestrator
                .list_tasks(Some(TaskStatus::Assigned))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
