//! Memory Migration Driver (component G): invokes the hypervisor-control
//! agent's `VM.migrate`, enveloped in source-side event suppression, with
//! the narrow retry policy for transient reboot-during-migration faults.

use crate::collaborators::{AgentFault, HypervisorAgent, MemoryMigrateRequest};
use crate::error::MigrateError;
use crate::model::TaskHandle;
use crate::Result;
use crate::{log_info, log_warn};

const MAX_ATTEMPTS: u32 = 3;

/// Runs the memory migration with up to [`MAX_ATTEMPTS`] attempts. Retry
/// fires only for `Cancelled { user_requested: false }` or `EndOfFile` —
/// both indicate the guest rebooted mid-migration. Every other fault, and
/// any user-requested cancel, aborts immediately.
pub async fn migrate_with_retry(
    agent: &dyn HypervisorAgent,
    dbg: &str,
    req: &MemoryMigrateRequest,
) -> Result<TaskHandle> {
    agent
        .suppress_events(&req.vm_uuid)
        .await
        .unwrap_or_else(|e| log_warn!("failed to suppress source events: {} (continuing)", e));

    let result = run_attempts(agent, dbg, req).await;

    if result.is_ok() {
        agent
            .resume_events(&req.vm_uuid)
            .await
            .unwrap_or_else(|e| log_warn!("failed to resume source events: {}", e));
        agent
            .forget_cached_metadata(&req.vm_uuid)
            .await
            .unwrap_or_else(|e| log_warn!("failed to forget cached metadata: {}", e));
    }
    // On failure, events stay suppressed: the finalizer's rollback path runs
    // with suppression still active and resumes them itself once the
    // post-migration state (suspend/shutdown) is settled.

    result
}

async fn run_attempts(
    agent: &dyn HypervisorAgent,
    dbg: &str,
    req: &MemoryMigrateRequest,
) -> Result<TaskHandle> {
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        log_info!("memory migration attempt {}/{} for {}", attempt, MAX_ATTEMPTS, req.vm_uuid);
        match agent.vm_migrate(dbg, req).await {
            Ok(task) => match agent.sync_with_task(dbg, &task).await {
                Ok(()) => return Ok(task),
                Err(fault) => {
                    if is_retryable(&fault) && attempt < MAX_ATTEMPTS {
                        log_warn!(
                            "memory migration attempt {} failed with a retryable fault, retrying",
                            attempt
                        );
                        last_err = Some(fault_to_error(fault));
                        continue;
                    }
                    return Err(fault_to_error(fault));
                }
            },
            Err(fault) => {
                if is_retryable(&fault) && attempt < MAX_ATTEMPTS {
                    log_warn!(
                        "memory migration attempt {} failed with a retryable fault, retrying",
                        attempt
                    );
                    last_err = Some(fault_to_error(fault));
                    continue;
                }
                return Err(fault_to_error(fault));
            }
        }
    }

    Err(last_err.unwrap_or(MigrateError::VmMigrateFailed(
        "exhausted retry attempts".to_string(),
    )))
}

fn is_retryable(fault: &AgentFault) -> bool {
    matches!(
        fault,
        AgentFault::Cancelled {
            user_requested: false
        } | AgentFault::EndOfFile
    )
}

fn fault_to_error(fault: AgentFault) -> MigrateError {
    match fault {
        AgentFault::Cancelled { .. } => MigrateError::Cancelled,
        AgentFault::EndOfFile => {
            MigrateError::VmMigrateFailed("guest rebooted mid-migration".to_string())
        }
        AgentFault::Other(err) => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeHypervisorAgent;
    use std::collections::HashMap;

    fn sample_req() -> MemoryMigrateRequest {
        MemoryMigrateRequest {
            vm_uuid: "vm-uuid-1".into(),
            vdi_locator_map: HashMap::new(),
            vif_map: HashMap::new(),
            vgpu_map: HashMap::new(),
            xenops_url: "https://10.0.0.5/xenops".into(),
            compress: false,
            verify_dest: true,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_no_fault() {
        let agent = FakeHypervisorAgent::new();
        let req = sample_req();
        let task = migrate_with_retry(&agent, "dbg", &req).await.unwrap();
        assert!(task.0.starts_with("memtask-"));
    }

    #[tokio::test]
    async fn retries_on_cancelled_then_succeeds() {
        let agent = FakeHypervisorAgent::new();
        agent.fail_next(AgentFault::Cancelled {
            user_requested: false,
        });
        let req = sample_req();
        let task = migrate_with_retry(&agent, "dbg", &req).await.unwrap();
        assert!(task.0.starts_with("memtask-"));
    }

    #[tokio::test]
    async fn does_not_retry_user_requested_cancel() {
        let agent = FakeHypervisorAgent::new();
        agent.fail_next(AgentFault::Cancelled {
            user_requested: true,
        });
        let req = sample_req();
        let err = migrate_with_retry(&agent, "dbg", &req).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
    }
}
