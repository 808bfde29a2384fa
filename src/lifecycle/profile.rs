use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::control::Profile;
use crate::error::Result;
use crate::heartbeat::now_ms;
use crate::services::AgentServices;
use crate::task::TaskStatus;
use crate::worker::{ExecutionResult, ShellRunner};

/// Profile id meaning "no startup profile".
pub const NO_PROFILE: &str = "NONE";

/// Last applied profile, persisted under the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProfile {
    pub profile_id: String,
    pub name: String,
    pub updated_at: i64,
    pub applied_at_ms: i64,
    pub failed: bool,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileCheck {
    /// A previous check is still running
    Skipped,
    Unchanged,
    Removed,
    Applied { failed: bool },
}

/// Periodically asks the control plane whether the startup profile changed and applies it.
pub struct ProfileChecker {
    services: AgentServices,
    shell: ShellRunner,
    path: PathBuf,
    run_timeout: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ProfileChecker {
    pub fn new(
        services: AgentServices,
        shell: ShellRunner,
        path: impl Into<PathBuf>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            services,
            shell,
            path: path.into(),
            run_timeout,
            running: AtomicBool::new(false),
        }
    }

    pub async fn stored(&self) -> Result<Option<StoredProfile>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, profile: &StoredProfile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(profile)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn check(&self) -> Result<ProfileCheck> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Profile check still running, skipping");
            return Ok(ProfileCheck::Skipped);
        }
        let _running = RunningGuard(&self.running);

        let stored = self.stored().await?;
        let (profile_id, updated_at) = stored
            .as_ref()
            .map(|p| (p.profile_id.clone(), p.updated_at))
            .unwrap_or_else(|| (NO_PROFILE.to_string(), 0));

        let services = &self.services;
        let changed = services
            .call(
                services
                    .control
                    .check_profile(&services.ctx, &profile_id, updated_at),
            )
            .await?;
        let Some(profile) = changed else {
            return Ok(ProfileCheck::Unchanged);
        };

        if profile.profile_id == NO_PROFILE {
            if stored.is_some() {
                tokio::fs::remove_file(&self.path).await?;
                tracing::info!(profile_id = %profile_id, "Startup profile removed");
            }
            return Ok(ProfileCheck::Removed);
        }

        let result = self.apply(&profile).await;
        let failed = result.status != TaskStatus::Success;
        let content = result
            .error
            .clone()
            .or_else(|| result.output.clone())
            .unwrap_or_default();

        self.store(&StoredProfile {
            profile_id: profile.profile_id.clone(),
            name: profile.name.clone(),
            updated_at: profile.updated_at,
            applied_at_ms: now_ms(),
            failed,
            result: content.clone(),
        })
        .await?;

        services
            .call(
                services
                    .control
                    .save_profile_result(&services.ctx, failed, &content),
            )
            .await?;

        tracing::info!(
            profile_id = %profile.profile_id,
            name = %profile.name,
            failed,
            "Startup profile applied"
        );
        Ok(ProfileCheck::Applied { failed })
    }

    async fn apply(&self, profile: &Profile) -> ExecutionResult {
        let cancel = CancellationToken::new();
        let task_id = format!("profile-{}", profile.profile_id);
        let env = BTreeMap::new();
        let run = self
            .shell
            .run_script(&task_id, &profile.script, &env, None, &cancel);
        match tokio::time::timeout(self.run_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(profile_id = %profile.profile_id, "Startup profile timed out");
                ExecutionResult::timed_out(self.run_timeout)
            }
        }
    }
}
