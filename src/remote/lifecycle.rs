//! Acquiring and releasing the instance.

use tracing::{debug, info, warn};

use super::script;
use super::user_data;
use super::{CloudApi, CloudError, IMAGE_FAMILY, InstanceInfo, InstanceState, LaunchRequest};
use super::{RemoteBackend, advance};
use crate::backend::{CleanupError, ProvisioningError, RemoteTarget, TargetOrigin, TargetState};
use crate::config::RemoteConfig;
use crate::image::{self, ImageCandidate};
use crate::poll::{Poll, PollError, poll_until, retry_transient};

fn required<'c>(value: Option<&'c str>, key: &str) -> Result<&'c str, ProvisioningError> {
    match value.map(str::trim) {
        Some(present) if !present.is_empty() => Ok(present),
        _ => Err(ProvisioningError::MissingSetting {
            field: key.to_owned(),
            env_var: RemoteConfig::option(key)
                .map_or_else(|| key.to_ascii_uppercase(), |info| info.env_var.to_owned()),
        }),
    }
}

fn provider(action: &str) -> impl Fn(PollError<CloudError>) -> ProvisioningError + '_ {
    move |err| ProvisioningError::Provider {
        action: action.to_owned(),
        message: err.to_string(),
    }
}

fn cleanup_provider<'a>(
    target: &'a str,
    action: &'a str,
) -> impl Fn(PollError<CloudError>) -> CleanupError + 'a {
    move |err| CleanupError::Provider {
        target: target.to_owned(),
        action: action.to_owned(),
        message: err.to_string(),
    }
}

impl<A: CloudApi> RemoteBackend<A> {
    pub(super) async fn prepare_target(&mut self) -> Result<(), ProvisioningError> {
        if self.prepared {
            return Ok(());
        }
        required(self.config.s3_bucket_name.as_deref(), "s3_bucket_name")?;

        if let Some(failed) = self
            .target
            .as_ref()
            .filter(|target| target.state() == TargetState::Failed)
        {
            return Err(ProvisioningError::TargetUnavailable {
                target: failed.id().to_owned(),
                state: failed.state().to_string(),
            });
        }
        if self.target.is_none() {
            let acquired = self.acquire().await;
            if let Err(err) = acquired {
                if let Some(target) = self.target.as_mut() {
                    target.fail();
                }
                return Err(err);
            }
        }

        let id = self
            .target
            .as_ref()
            .map(|target| target.id().to_owned())
            .unwrap_or_default();
        if self.bootstrap_pending {
            info!(instance = %id, "setting up new instance");
            self.run_setup(&id, script::bootstrap(), "bootstrap").await?;
            self.bootstrap_pending = false;
        }
        info!(instance = %id, "resetting workspace");
        self.run_setup(&id, script::reset_workspace(), "workspace reset")
            .await?;
        self.prepared = true;
        Ok(())
    }

    /// Reuses a matching instance or creates one. Created instances still
    /// need their bootstrap, which may fail and be retried on its own.
    async fn acquire(&mut self) -> Result<(), ProvisioningError> {
        let Some(existing) = self.find_reusable().await? else {
            self.create().await?;
            self.bootstrap_pending = true;
            return Ok(());
        };
        self.adopt(existing).await
    }

    async fn run_setup(
        &self,
        id: &str,
        commands: Vec<String>,
        label: &str,
    ) -> Result<(), ProvisioningError> {
        let report = self
            .dispatch(id, commands, label)
            .await
            .map_err(provider(label))?;
        if report.is_success() {
            return Ok(());
        }
        Err(ProvisioningError::Bootstrap {
            target: id.to_owned(),
            status: report.status_text(),
            stderr: report.stderr.trim().to_owned(),
        })
    }

    async fn find_reusable(&self) -> Result<Option<InstanceInfo>, ProvisioningError> {
        let policy = self.ready_policy();

        if let Some(id) = self.config.instance_id.as_deref() {
            let described =
                retry_transient(&policy, "describe instance", || self.api.describe_instance(id))
                    .await;
            return match described {
                Ok(info) => Ok(Some(info)),
                Err(PollError::Fatal {
                    source: CloudError::NotFound { .. },
                    ..
                }) => Err(ProvisioningError::TargetUnavailable {
                    target: id.to_owned(),
                    state: String::from("not found"),
                }),
                Err(err) => Err(provider("ec2 describe-instances")(err)),
            };
        }

        let Some(name) = self.config.instance_name.as_deref() else {
            return Ok(None);
        };
        let mut matches =
            retry_transient(&policy, "find instance", || self.api.find_instances(name))
                .await
                .map_err(provider("ec2 describe-instances"))?;
        if matches.len() > 1 {
            warn!(
                name,
                count = matches.len(),
                "instance name is ambiguous; launching a new instance"
            );
            return Ok(None);
        }
        let found = matches.pop();
        if let Some(info) = &found {
            info!(name, instance = %info.id, "resolved instance name");
        }
        Ok(found)
    }

    async fn adopt(&mut self, existing: InstanceInfo) -> Result<(), ProvisioningError> {
        match existing.state {
            InstanceState::Running => {
                info!(instance = %existing.id, "reusing running instance");
                self.target = Some(RemoteTarget::reused(existing.id, false));
                Ok(())
            }
            InstanceState::Stopped => {
                info!(instance = %existing.id, "starting stopped instance");
                self.target = Some(RemoteTarget::reused(existing.id.clone(), true));
                let policy = self.ready_policy();
                retry_transient(&policy, "start instance", || {
                    self.api.start_instance(&existing.id)
                })
                .await
                .map_err(provider("ec2 start-instances"))?;
                self.wait_until_running(&existing.id).await
            }
            other => Err(ProvisioningError::TargetUnavailable {
                target: existing.id,
                state: other.to_string(),
            }),
        }
    }

    async fn create(&mut self) -> Result<(), ProvisioningError> {
        let request = self.launch_request().await?;
        let policy = self.ready_policy();
        let id = retry_transient(&policy, "launch instance", || {
            self.api.launch_instance(&request)
        })
        .await
        .map_err(provider("ec2 run-instances"))?;

        info!(instance = %id, name = %request.name, image = %request.image_id, "launched instance");
        let mut target = RemoteTarget::created(id.clone());
        target.transition(TargetState::Provisioning)?;
        self.target = Some(target);
        self.wait_until_running(&id).await
    }

    async fn launch_request(&self) -> Result<LaunchRequest, ProvisioningError> {
        let config = &self.config;
        let iam_profile = required(config.iam_profile.as_deref(), "iam_profile")?;
        let security_group_id = required(config.security_group_id.as_deref(), "security_group_id")?;
        let subnet_id = required(config.subnet_id.as_deref(), "subnet_id")?;
        let image_id = self.image_id().await?;
        let name = config
            .instance_name
            .clone()
            .unwrap_or_else(|| self.fallback_name.clone());
        let user_data = config.efs_dns_name.as_deref().map(|dns| {
            info!(efs = dns, packs_dir = %config.efs_packs_dir, "mounting shared packs");
            user_data::efs_packs(dns, &config.efs_packs_dir)
        });

        Ok(LaunchRequest {
            image_id,
            instance_type: config.instance_type.clone(),
            iam_profile: iam_profile.to_owned(),
            security_group_id: security_group_id.to_owned(),
            subnet_id: subnet_id.to_owned(),
            key_name: config.key_name.clone(),
            name,
            run_token: self.run_token.clone(),
            client_token: format!("{}-launch", self.run_token),
            user_data,
        })
    }

    async fn image_id(&self) -> Result<String, ProvisioningError> {
        if let Some(id) = self.config.ami_id.as_deref() {
            return Ok(id.to_owned());
        }
        let policy = self.ready_policy();
        let images = retry_transient(&policy, "list images", || {
            self.api.describe_images(IMAGE_FAMILY)
        })
        .await
        .map_err(provider("ec2 describe-images"))?;
        let candidates: Vec<ImageCandidate> = images
            .iter()
            .filter_map(|image| ImageCandidate::from_image_name(&image.id, &image.name))
            .collect();
        let chosen = image::resolve(&candidates, Some(&self.config.ami_version))?;
        info!(version = %chosen.version, image = %chosen.id, "selected image");
        Ok(chosen.id)
    }

    async fn wait_until_running(&mut self, id: &str) -> Result<(), ProvisioningError> {
        let policy = self.ready_policy();
        let api = &self.api;
        let outcome = poll_until(&policy, "instance readiness", || {
            api.describe_instance(id).map(|info| match info.state {
                InstanceState::Running => Poll::Ready(None),
                InstanceState::Pending | InstanceState::Stopping | InstanceState::Stopped => {
                    Poll::Pending
                }
                other => Poll::Ready(Some(other)),
            })
        })
        .await;

        match outcome {
            Ok(None) => {
                debug!(instance = id, "instance is running");
                self.target
                    .as_mut()
                    .map_or(Ok(()), |target| target.transition(TargetState::Ready))
            }
            Ok(Some(state)) => Err(ProvisioningError::TargetUnavailable {
                target: id.to_owned(),
                state: state.to_string(),
            }),
            Err(PollError::TimedOut { attempts, .. }) => {
                Err(ProvisioningError::ProvisioningTimeout {
                    target: id.to_owned(),
                    attempts,
                })
            }
            Err(err) => Err(provider("ec2 describe-instances")(err)),
        }
    }

    pub(super) async fn release_target(&mut self) -> Result<(), CleanupError> {
        self.prepared = false;
        self.bootstrap_pending = false;
        let Some(mut target) = self.target.take() else {
            debug!("no instance to release");
            return Ok(());
        };
        match (target.origin(), self.config.keep_ec2_instances) {
            (TargetOrigin::Reused { was_stopped: false }, _) => {
                info!(instance = target.id(), "leaving reused instance running");
                Ok(())
            }
            (TargetOrigin::Reused { was_stopped: true }, _) | (TargetOrigin::Created, true) => {
                self.stop(&mut target).await
            }
            (TargetOrigin::Created, false) => self.terminate(&mut target).await,
        }
    }

    async fn stop(&self, target: &mut RemoteTarget) -> Result<(), CleanupError> {
        let id = target.id().to_owned();
        info!(instance = %id, "stopping instance");
        let policy = self.ready_policy();
        retry_transient(&policy, "stop instance", || self.api.stop_instance(&id))
            .await
            .map_err(cleanup_provider(&id, "ec2 stop-instances"))?;
        self.await_state(&id, &InstanceState::Stopped, TargetState::Stopped)
            .await?;
        advance(target, TargetState::Stopped);
        Ok(())
    }

    async fn terminate(&self, target: &mut RemoteTarget) -> Result<(), CleanupError> {
        let id = target.id().to_owned();
        info!(instance = %id, "terminating instance");
        let policy = self.ready_policy();
        retry_transient(&policy, "terminate instance", || {
            self.api.terminate_instance(&id)
        })
        .await
        .map_err(cleanup_provider(&id, "ec2 terminate-instances"))?;
        advance(target, TargetState::Terminating);
        self.await_state(&id, &InstanceState::Terminated, TargetState::Terminated)
            .await?;
        advance(target, TargetState::Terminated);
        Ok(())
    }

    async fn await_state(
        &self,
        id: &str,
        wanted: &InstanceState,
        state: TargetState,
    ) -> Result<(), CleanupError> {
        let policy = self.ready_policy();
        let outcome = poll_until(&policy, "instance teardown", || {
            self.api.describe_instance(id).map(|info| {
                if &info.state == wanted {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
        })
        .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(PollError::TimedOut { attempts, .. }) => Err(CleanupError::Timeout {
                target: id.to_owned(),
                state,
                attempts,
            }),
            Err(err) => Err(cleanup_provider(id, "ec2 describe-instances")(err)),
        }
    }
}
