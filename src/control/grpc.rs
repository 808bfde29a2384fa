use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};

use super::{
    normalize_base_url, AgentStatus, ControlMessage, ControlPlane, HeartbeatAck, InboundStream,
    Profile, RegistrationOutcome, StreamFault, UpgradeScripts,
};
use crate::context::{AgentContext, AgentIdentity};
use crate::error::{AgentError, Result};
use crate::proto::{self, control_message, ControlPlaneClient};
use crate::task::{
    Capability, EncryptedRecord, EncryptionConfig, Owner, SecretBundle, SecretReference, Task,
    TaskEvent, TaskPackage, TaskParameters, TaskResponse, TaskStatus, ValidationResult,
};

/// [`ControlPlane`] over the `fleet.agent.v1.ControlPlane` gRPC service.
///
/// The channel connects lazily, so construction never blocks on the network.
/// Every request carries the agent token as a bearer credential.
pub struct GrpcControlPlane {
    channel: RwLock<Channel>,
    authorization: Option<MetadataValue<Ascii>>,
    tls: Option<ClientTlsConfig>,
    connect_timeout: Duration,
    default_task_timeout: Duration,
}

impl GrpcControlPlane {
    pub fn new(
        base_url: &str,
        token: Option<&SecretString>,
        tls: Option<ClientTlsConfig>,
        connect_timeout: Duration,
        default_task_timeout: Duration,
    ) -> Result<Self> {
        let authorization = token
            .map(|token| {
                format!("Bearer {}", token.expose_secret())
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|_| AgentError::Config("agent token is not valid ASCII".to_string()))
            })
            .transpose()?;
        let channel = Self::channel_for(base_url, tls.clone(), connect_timeout)?;

        Ok(Self {
            channel: RwLock::new(channel),
            authorization,
            tls,
            connect_timeout,
            default_task_timeout,
        })
    }

    fn channel_for(
        base_url: &str,
        tls: Option<ClientTlsConfig>,
        connect_timeout: Duration,
    ) -> Result<Channel> {
        let mut endpoint =
            Endpoint::from_shared(normalize_base_url(base_url))?.connect_timeout(connect_timeout);
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls)?;
        }
        Ok(endpoint.connect_lazy())
    }

    fn client(&self) -> ControlPlaneClient {
        let channel = self
            .channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        ControlPlaneClient::new(channel)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(value) = &self.authorization {
            request
                .metadata_mut()
                .insert("authorization", value.clone());
        }
        request
    }

    fn task_ref(ctx: &AgentContext, task_id: &str) -> proto::TaskRef {
        proto::TaskRef {
            agent_id: ctx.agent_id.clone(),
            task_id: task_id.to_string(),
            account_id: ctx.account_id.clone(),
        }
    }

    fn package_from_proto(&self, package: proto::TaskPackage) -> Result<TaskPackage> {
        package_from_proto(package, self.default_task_timeout)
    }
}

fn rpc_error(method: &'static str) -> impl FnOnce(Status) -> AgentError {
    move |status| {
        tracing::debug!(
            rpc = %proto::method_name(method),
            code = ?status.code(),
            message = %status.message(),
            "Control plane call failed"
        );
        AgentError::GrpcError(status)
    }
}

/// Split stream failures into reconnectable and fatal ones.
pub fn classify_fault(status: &Status) -> StreamFault {
    let message = status.message().to_ascii_lowercase();
    let transport = matches!(
        status.code(),
        Code::Unavailable | Code::Cancelled | Code::DeadlineExceeded
    ) || message.contains("tls")
        || message.contains("certificate")
        || message.contains("handshake");

    if transport {
        StreamFault::Transport(status.to_string())
    } else {
        StreamFault::Fatal(status.to_string())
    }
}

fn status_to_proto(status: &AgentStatus) -> proto::AgentStatus {
    proto::AgentStatus {
        agent_id: status.agent_id.clone(),
        account_id: status.account_id.clone(),
        connection_id: status.connection_id.clone(),
        hostname: status.hostname.clone(),
        version: status.version.clone(),
        sent_at_ms: status.sent_at_ms,
        executing_task_ids: status.executing_task_ids.clone(),
        polling_mode: status.polling_mode,
    }
}

fn event_from_proto(event: proto::TaskEvent) -> TaskEvent {
    TaskEvent {
        task_id: event.task_id,
        account_id: event.account_id,
        is_abort: event.is_abort,
        is_sync: event.is_sync,
        task_type: if event.task_type.is_empty() {
            None
        } else {
            Some(event.task_type)
        },
    }
}

fn message_from_proto(message: proto::ControlMessage) -> Option<ControlMessage> {
    Some(match message.kind? {
        control_message::Kind::Task(event) => ControlMessage::Task(event_from_proto(event)),
        control_message::Kind::HeartbeatAck(ack) => ControlMessage::HeartbeatAck {
            agent_id: ack.agent_id,
        },
        control_message::Kind::SelfDestruct(sd) => ControlMessage::SelfDestruct {
            agent_id: if sd.agent_id.is_empty() {
                None
            } else {
                Some(sd.agent_id)
            },
        },
        control_message::Kind::Migrate(m) => ControlMessage::Migrate { url: m.url },
        control_message::Kind::StopAcquiring(_) => ControlMessage::StopAcquiring,
    })
}

/// Convert a wire package. Failures carry the task id and owner so an
/// assigned task can still be failed.
pub fn package_from_proto(
    package: proto::TaskPackage,
    default_timeout: Duration,
) -> Result<TaskPackage> {
    let task_id = package.task_id.clone();
    let owner = if !package.assigned_agent_id.is_empty() {
        Owner::Assigned(package.assigned_agent_id.clone())
    } else if package.validating {
        Owner::Validating
    } else {
        Owner::Unassigned
    };
    decode_package(package, owner.clone(), default_timeout).map_err(|e| {
        AgentError::PackageDecode {
            task_id,
            owner,
            source: Box::new(e),
        }
    })
}

fn decode_package(
    package: proto::TaskPackage,
    owner: Owner,
    default_timeout: Duration,
) -> Result<TaskPackage> {
    let parameters = TaskParameters::decode(&package.task_type, &package.parameters)?;
    let capabilities = package
        .capabilities
        .iter()
        .map(|c| {
            Capability::parse(&c.kind, &c.target).ok_or_else(|| {
                AgentError::Config(format!("unrecognised capability {}:{}", c.kind, c.target))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let timeout = if package.timeout_ms > 0 {
        Duration::from_millis(package.timeout_ms as u64)
    } else {
        default_timeout
    };

    let mut details = HashMap::with_capacity(package.secret_details.len());
    for (secret_id, detail) in package.secret_details {
        let record = detail.record.ok_or_else(|| {
            AgentError::SecretDecryption(format!("secret {} has no encrypted record", secret_id))
        })?;
        details.insert(
            secret_id,
            SecretReference {
                config_id: detail.config_id,
                record: EncryptedRecord {
                    id: record.id,
                    name: record.name,
                    encrypted_value: record.encrypted_value,
                },
            },
        );
    }
    let configs = package
        .encryption_configs
        .into_iter()
        .map(|(id, c)| {
            (
                id,
                EncryptionConfig {
                    id: c.id,
                    name: c.name,
                    kind: c.kind,
                },
            )
        })
        .collect();

    Ok(TaskPackage {
        account_id: package.account_id,
        task: Task {
            id: package.task_id,
            task_type: package.task_type,
            parameters,
            capabilities,
            timeout,
            is_async: package.is_async,
            owner,
        },
        secrets: SecretBundle {
            details,
            configs,
            functor_token: package.functor_token,
            mask_values: package
                .mask_values
                .into_iter()
                .map(SecretString::from)
                .collect(),
        },
        capability_framework: package.capability_framework,
    })
}

fn response_to_proto(response: &TaskResponse) -> proto::TaskResponse {
    let status = match response.status {
        TaskStatus::Success => proto::TaskStatus::Success,
        TaskStatus::Failure => proto::TaskStatus::Failure,
        TaskStatus::TimedOut => proto::TaskStatus::TimedOut,
        TaskStatus::Aborted => proto::TaskStatus::Aborted,
    };
    proto::TaskResponse {
        status: status as i32,
        output: response.output.clone().unwrap_or_default(),
        error: response.error.clone().unwrap_or_default(),
        duration_ms: response.duration.as_millis() as i64,
        exit_code: response.exit_code,
    }
}

#[tonic::async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn register_agent(&self, identity: &AgentIdentity) -> Result<RegistrationOutcome> {
        let request = self.request(proto::AgentRegistration {
            account_id: identity.account_id.clone(),
            hostname: identity.hostname.clone(),
            agent_name: identity.agent_name.clone(),
            agent_type: identity.agent_type.clone(),
            version: identity.version.clone(),
            connection_id: identity.connection_id.clone(),
            supported_task_types: identity.supported_task_types.clone(),
            polling_mode: identity.polling_mode,
        });
        let response = self
            .client()
            .register_agent(request)
            .await
            .map_err(rpc_error("RegisterAgent"))?
            .into_inner();

        Ok(match response.action() {
            proto::RegisterAction::SelfDestruct => RegistrationOutcome::SelfDestruct,
            proto::RegisterAction::Migrate => RegistrationOutcome::Migrate {
                url: response.migrate_url,
            },
            proto::RegisterAction::Normal => RegistrationOutcome::Registered {
                agent_id: response.agent_id,
            },
        })
    }

    async fn heartbeat(&self, status: &AgentStatus) -> Result<HeartbeatAck> {
        let response = self
            .client()
            .heartbeat(self.request(status_to_proto(status)))
            .await
            .map_err(rpc_error("Heartbeat"))?
            .into_inner();
        Ok(HeartbeatAck {
            record_deleted: response.status() == proto::AgentRecordStatus::Deleted,
            agent_id: response.agent_id,
        })
    }

    async fn connection_heartbeat(&self, ctx: &AgentContext, alive: bool) -> Result<()> {
        self.client()
            .connection_heartbeat(self.request(proto::ConnectionHeartbeatRequest {
                agent_id: ctx.agent_id.clone(),
                account_id: ctx.account_id.clone(),
                connection_id: ctx.connection_id.clone(),
                version: ctx.version.clone(),
                alive,
            }))
            .await
            .map_err(rpc_error("ConnectionHeartbeat"))?;
        Ok(())
    }

    async fn poll_task_events(&self, ctx: &AgentContext) -> Result<Vec<TaskEvent>> {
        let response = self
            .client()
            .poll_task_events(self.request(proto::PollTaskEventsRequest {
                agent_id: ctx.agent_id.clone(),
                account_id: ctx.account_id.clone(),
            }))
            .await
            .map_err(rpc_error("PollTaskEvents"))?
            .into_inner();
        Ok(response.events.into_iter().map(event_from_proto).collect())
    }

    async fn acquire_task_package(
        &self,
        ctx: &AgentContext,
        task_id: &str,
    ) -> Result<Option<TaskPackage>> {
        let response = self
            .client()
            .acquire_task_package(self.request(Self::task_ref(ctx, task_id)))
            .await
            .map_err(rpc_error("AcquireTaskPackage"))?
            .into_inner();
        response
            .package
            .map(|p| self.package_from_proto(p))
            .transpose()
    }

    async fn report_validation_results(
        &self,
        ctx: &AgentContext,
        task_id: &str,
        results: &[ValidationResult],
    ) -> Result<Option<TaskPackage>> {
        let request = self.request(proto::ReportValidationRequest {
            task: Some(Self::task_ref(ctx, task_id)),
            results: results
                .iter()
                .map(|r| proto::ValidationResult {
                    criteria: r.criteria.clone(),
                    validated: r.validated,
                    duration_ms: r.duration.as_millis() as i64,
                })
                .collect(),
        });
        let response = self
            .client()
            .report_validation_results(request)
            .await
            .map_err(rpc_error("ReportValidationResults"))?
            .into_inner();
        response
            .package
            .map(|p| self.package_from_proto(p))
            .transpose()
    }

    async fn fail_if_all_agents_failed(&self, ctx: &AgentContext, task_id: &str) -> Result<()> {
        self.client()
            .fail_if_all_agents_failed(self.request(Self::task_ref(ctx, task_id)))
            .await
            .map_err(rpc_error("FailIfAllAgentsFailed"))?;
        Ok(())
    }

    async fn report_task_response(
        &self,
        ctx: &AgentContext,
        response: &TaskResponse,
    ) -> Result<bool> {
        let request = self.request(proto::ReportTaskResponseRequest {
            task: Some(Self::task_ref(ctx, &response.task_id)),
            response: Some(response_to_proto(response)),
        });
        let ack = self
            .client()
            .report_task_response(request)
            .await
            .map_err(rpc_error("ReportTaskResponse"))?
            .into_inner();
        if !ack.accepted {
            tracing::warn!(
                task_id = %response.task_id,
                message = %ack.message,
                "Control plane rejected task response"
            );
        }
        Ok(ack.accepted)
    }

    async fn get_upgrade_scripts(
        &self,
        account_id: &str,
        current_version: &str,
    ) -> Result<Option<UpgradeScripts>> {
        let response = self
            .client()
            .get_upgrade_scripts(self.request(proto::GetUpgradeScriptsRequest {
                account_id: account_id.to_string(),
                current_version: current_version.to_string(),
            }))
            .await
            .map_err(rpc_error("GetUpgradeScripts"))?
            .into_inner();
        Ok(response.scripts.map(|s| UpgradeScripts {
            version: s.version,
            scripts: s.scripts.into_iter().collect(),
        }))
    }

    async fn check_profile(
        &self,
        ctx: &AgentContext,
        profile_id: &str,
        last_updated_at: i64,
    ) -> Result<Option<Profile>> {
        let response = self
            .client()
            .check_profile(self.request(proto::CheckProfileRequest {
                agent_id: ctx.agent_id.clone(),
                account_id: ctx.account_id.clone(),
                profile_id: profile_id.to_string(),
                last_updated_at,
            }))
            .await
            .map_err(rpc_error("CheckProfile"))?
            .into_inner();
        Ok(response.profile.map(|p| Profile {
            profile_id: p.profile_id,
            name: p.name,
            script: p.script,
            updated_at: p.updated_at,
        }))
    }

    async fn save_profile_result(
        &self,
        ctx: &AgentContext,
        failed: bool,
        content: &str,
    ) -> Result<()> {
        self.client()
            .save_profile_result(self.request(proto::SaveProfileResultRequest {
                agent_id: ctx.agent_id.clone(),
                account_id: ctx.account_id.clone(),
                failed,
                content: content.to_string(),
            }))
            .await
            .map_err(rpc_error("SaveProfileResult"))?;
        Ok(())
    }

    async fn open_stream(&self, outbound: mpsc::Receiver<AgentStatus>) -> Result<InboundStream> {
        let outbound = ReceiverStream::new(outbound).map(|status| status_to_proto(&status));
        let response = self
            .client()
            .connect(self.request(outbound))
            .await
            .map_err(rpc_error("Connect"))?;

        let inbound = response.into_inner().filter_map(|item| match item {
            Ok(message) => message_from_proto(message).map(Ok),
            Err(status) => Some(Err(classify_fault(&status))),
        });
        Ok(Box::pin(inbound))
    }

    async fn migrate(&self, url: &str) -> Result<()> {
        let channel = Self::channel_for(url, self.tls.clone(), self.connect_timeout)?;
        *self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = channel;
        tracing::info!(url = %normalize_base_url(url), "Control plane endpoint migrated");
        Ok(())
    }
}
