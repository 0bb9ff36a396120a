use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::code_execution::command_detection::{
    detect_run_command, detect_test_command, missing_files_command, test_probe_command,
};
use crate::configuration::types::TimeoutConfig;
use crate::error_handling::types::{SandboxError, SessionError};
use crate::notification::completion_queue::CompletionQueue;
use crate::notification::evaluation_sink::CompletionNotice;
use crate::sandbox::provider::Sandbox;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{EventType, NewEvent, SessionStatus};

/// Result of a candidate's run, as returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub command: String,
    pub test_output: String,
    pub tests_passed: bool,
    pub can_submit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub success: bool,
    pub tests_passed: bool,
}

/// How a test run that exceeds its bound is scored.
///
/// Runs before submission are lenient so infrastructure hiccups never block a
/// candidate; the submission run itself is strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestTimeoutPolicy {
    TreatAsPassed,
    TreatAsFailed,
}

#[derive(Debug, Clone, PartialEq)]
struct TestReport {
    output: String,
    passed: bool,
}

impl TestReport {
    fn no_suite() -> Self {
        Self {
            output: String::new(),
            passed: true,
        }
    }
}

/// Runs candidate code and the hidden test suite inside the session sandbox.
pub struct CommandRunner {
    storage: Arc<dyn Storage>,
    registry: Arc<SessionRegistry>,
    project_root: String,
    timeouts: TimeoutConfig,
    completions: CompletionQueue,
}

impl CommandRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<SessionRegistry>,
        project_root: String,
        timeouts: TimeoutConfig,
        completions: CompletionQueue,
    ) -> Self {
        Self {
            storage,
            registry,
            project_root,
            timeouts,
            completions,
        }
    }

    /// Runs `command` (or the detected one), then the hidden tests if any exist.
    pub async fn run(
        &self,
        session_id: Uuid,
        command: Option<String>,
    ) -> Result<RunOutcome, SessionError> {
        let files = self.stored_files(session_id).await?;
        let command = match command.filter(|c| !c.trim().is_empty()) {
            Some(command) => command,
            None => match &files {
                Some(files) => detect_run_command(files, &self.project_root),
                None => missing_files_command(&self.project_root),
            },
        };

        let handle = self
            .registry
            .get_or_reconnect(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(String::from("No active sandbox")))?;
        let sandbox = handle.sandbox();

        debug!("[{}] Running `{}`", session_id, command);
        let output = sandbox
            .run_command(&command, self.timeouts.run())
            .await
            .map_err(|e| match e {
                SandboxError::Timeout(_) => SessionError::Timeout(format!(
                    "`{}` did not finish within {:?}",
                    command,
                    self.timeouts.run()
                )),
                other => other.into(),
            })?;

        let combined = output.combined();
        let record = NewEvent::new(
            session_id,
            EventType::CodeRun,
            if combined.is_empty() {
                String::from("(no output)")
            } else {
                combined
            },
        )
        .with_metadata(serde_json::json!({
            "command": command,
            "exit_code": output.exit_code,
        }));
        if let Err(e) = self.storage.append_event(record).await {
            error!("[{}] Failed to record code run: {}", session_id, e);
        }

        let report = match &files {
            Some(files) => {
                self.run_tests(
                    session_id,
                    &**sandbox,
                    files,
                    self.timeouts.pre_submit_tests(),
                    TestTimeoutPolicy::TreatAsPassed,
                )
                .await
            }
            None => TestReport::no_suite(),
        };

        info!(
            "[{}] Run exited with {}, tests passed: {}",
            session_id, output.exit_code, report.passed
        );
        Ok(RunOutcome {
            can_submit: output.exit_code == 0 && report.passed,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            command,
            test_output: report.output,
            tests_passed: report.passed,
        })
    }

    /// Runs the hidden tests one last time, records the submission and
    /// completes the session. Teardown and evaluation happen off the request.
    pub async fn submit(&self, session_id: Uuid) -> Result<SubmitOutcome, SessionError> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(String::from("Session not found")))?;
        if session.is_completed() {
            return Err(SessionError::InvalidRequest(String::from(
                "Session already completed",
            )));
        }

        let report = match self.registry.get_or_reconnect(session_id).await? {
            Some(handle) => match self.stored_files(session_id).await? {
                Some(files) => {
                    self.run_tests(
                        session_id,
                        &**handle.sandbox(),
                        &files,
                        self.timeouts.submit_tests(),
                        TestTimeoutPolicy::TreatAsFailed,
                    )
                    .await
                }
                None => TestReport::no_suite(),
            },
            None => {
                warn!("[{}] Submitting without a reachable sandbox", session_id);
                TestReport::no_suite()
            }
        };

        let record = NewEvent::new(
            session_id,
            EventType::Submission,
            if report.output.is_empty() {
                String::from("Submitted")
            } else {
                report.output.clone()
            },
        )
        .with_metadata(serde_json::json!({"tests_passed": report.passed}));
        if let Err(e) = self.storage.append_event(record).await {
            error!("[{}] Failed to record submission: {}", session_id, e);
        }

        {
            let lock = self.registry.session_lock(session_id);
            let _guard = lock.lock().await;
            let mut session = self
                .storage
                .get_session(session_id)
                .await?
                .ok_or_else(|| SessionError::NotFound(String::from("Session not found")))?;
            if session.is_completed() {
                return Err(SessionError::InvalidRequest(String::from(
                    "Session already completed",
                )));
            }
            session.status = SessionStatus::Completed;
            session.ended_at = Some(Utc::now());
            self.storage.save_session(&session).await?;
            // The sandbox stays up until the completion worker kills it, but
            // nothing may reach it through the cache from here on.
            if let Some(handle) = self.registry.remove(session_id) {
                handle.detach();
            }
        }
        self.completions
            .enqueue(CompletionNotice::submitted(session_id, report.passed));

        info!("[{}] Submitted, tests passed: {}", session_id, report.passed);
        Ok(SubmitOutcome {
            success: true,
            tests_passed: report.passed,
        })
    }

    async fn run_tests(
        &self,
        session_id: Uuid,
        sandbox: &dyn Sandbox,
        files: &BTreeMap<String, String>,
        timeout: Duration,
        policy: TestTimeoutPolicy,
    ) -> TestReport {
        let Some(test_command) = detect_test_command(files, &self.project_root) else {
            return TestReport::no_suite();
        };

        match sandbox
            .run_command(&test_probe_command(&self.project_root), self.timeouts.probe())
            .await
        {
            Ok(probe) if probe.stdout.trim().is_empty() => {
                debug!("[{}] No hidden tests present", session_id);
                return TestReport::no_suite();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[{}] Could not inspect hidden tests: {}", session_id, e);
                return TestReport {
                    output: format!("Could not locate tests: {}", e),
                    passed: policy == TestTimeoutPolicy::TreatAsPassed,
                };
            }
        }

        match sandbox.run_command(&test_command, timeout).await {
            Ok(result) => TestReport {
                output: result.combined(),
                passed: result.exit_code == 0,
            },
            Err(SandboxError::Timeout(_)) => {
                warn!("[{}] Test run exceeded {:?} ({:?})", session_id, timeout, policy);
                match policy {
                    TestTimeoutPolicy::TreatAsPassed => TestReport {
                        output: String::from(
                            "Test execution timed out; this does not block submission",
                        ),
                        passed: true,
                    },
                    TestTimeoutPolicy::TreatAsFailed => TestReport {
                        output: String::from("Test execution timed out"),
                        passed: false,
                    },
                }
            }
            Err(e) => {
                error!("[{}] Test run failed: {}", session_id, e);
                TestReport {
                    output: format!("Test execution failed: {}", e),
                    passed: false,
                }
            }
        }
    }

    async fn stored_files(
        &self,
        session_id: Uuid,
    ) -> Result<Option<BTreeMap<String, String>>, SessionError> {
        let Some(challenge_id) = self
            .storage
            .get_session(session_id)
            .await?
            .and_then(|s| s.challenge_id)
        else {
            return Ok(None);
        };
        Ok(self
            .storage
            .get_challenge(challenge_id)
            .await?
            .map(|c| c.generated_files))
    }
}
