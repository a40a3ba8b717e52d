//! Drives a freshly provisioned instance to its desired state.

use keel_reconcile::{ConvergenceStatus, UpdateConfig, WatchTime, DEFAULT_WATCH_TIME};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::agent::GuardedAgentClient;
use crate::error::{RecoveryError, RecoveryResult};
use crate::model::{InstanceRecord, InstanceState};
use crate::plan::InstancePlan;
use crate::templates::RenderedJobTemplatesCleaner;

/// Convergence errors.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error("'{instance}' is not running after update, job state is '{job_state}'")]
    NotRunning { instance: String, job_state: String },
}

/// Applies an instance plan through the agent.
///
/// The agent always receives the plan's resolved spec, never the stored one.
///
/// Order: apply spec, drop stale templates, then for started instances
/// `pre-start`, `start`, optionally wait for `running`, and `post-start`.
pub struct StateApplier<'a> {
    plan: &'a InstancePlan,
    agent: &'a GuardedAgentClient,
    cleaner: &'a RenderedJobTemplatesCleaner,
}

impl<'a> StateApplier<'a> {
    pub fn new(
        plan: &'a InstancePlan,
        agent: &'a GuardedAgentClient,
        cleaner: &'a RenderedJobTemplatesCleaner,
    ) -> Self {
        Self {
            plan,
            agent,
            cleaner,
        }
    }

    #[instrument(skip(self, instance, update_config), fields(instance = %instance.name()))]
    pub async fn apply(
        &self,
        instance: &mut InstanceRecord,
        update_config: Option<&UpdateConfig>,
        wait_for_running: bool,
    ) -> RecoveryResult<()> {
        self.agent.apply(&self.plan.instance.spec).await?;

        let removed = self.cleaner.clean(instance).await?;
        debug!(removed, "Cleaned stale rendered templates");

        if self.plan.instance.state != InstanceState::Started {
            info!(state = ?self.plan.instance.state, "Instance not started, skipping job start");
            return Ok(());
        }

        self.agent.run_script("pre-start").await?;
        self.agent.start().await?;

        if wait_for_running {
            let watch_time = update_config
                .map(|config| config.watch_time(false))
                .unwrap_or(DEFAULT_WATCH_TIME);
            self.wait_until_running(&instance.name(), watch_time).await?;
        }

        self.agent.run_script("post-start").await?;
        info!("Instance converged");
        Ok(())
    }

    async fn wait_until_running(&self, instance: &str, watch_time: WatchTime) -> RecoveryResult<()> {
        let mut job_state = String::from("unknown");

        for delay in watch_time.schedule() {
            tokio::time::sleep(delay).await;

            let state = self.agent.get_state().await?;
            job_state = state.job_state;

            match ConvergenceStatus::from_job_state(&job_state) {
                ConvergenceStatus::Converged => return Ok(()),
                ConvergenceStatus::Diverged => {
                    warn!(job_state = %job_state, "Job failing, still watching");
                }
                _ => debug!(job_state = %job_state, "Waiting for job to run"),
            }
        }

        Err(RecoveryError::Convergence(ConvergenceError::NotRunning {
            instance: instance.to_string(),
            job_state,
        }))
    }
}
