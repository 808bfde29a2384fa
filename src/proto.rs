//! Wire types and client for the `fleet.agent.v1.ControlPlane` gRPC service.
//!
//! Messages are declared directly with `prost` derives so the crate builds
//! without a protobuf compiler. Field tags are part of the wire contract and
//! must never be renumbered.

use std::collections::HashMap;

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};

// ============================================================================
// Registration
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentRegistration {
    #[prost(string, tag = "1")]
    pub account_id: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "4")]
    pub agent_name: String,
    #[prost(string, tag = "5")]
    pub agent_type: String,
    #[prost(string, tag = "6")]
    pub version: String,
    #[prost(string, tag = "7")]
    pub connection_id: String,
    #[prost(string, repeated, tag = "8")]
    pub supported_task_types: Vec<String>,
    #[prost(bool, tag = "9")]
    pub polling_mode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RegisterAction {
    Normal = 0,
    SelfDestruct = 1,
    Migrate = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterAgentResponse {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(enumeration = "RegisterAction", tag = "2")]
    pub action: i32,
    #[prost(string, tag = "3")]
    pub migrate_url: String,
}

// ============================================================================
// Heartbeats
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentStatus {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(string, tag = "3")]
    pub connection_id: String,
    #[prost(string, tag = "4")]
    pub hostname: String,
    #[prost(string, tag = "5")]
    pub version: String,
    #[prost(int64, tag = "6")]
    pub sent_at_ms: i64,
    #[prost(string, repeated, tag = "7")]
    pub executing_task_ids: Vec<String>,
    #[prost(bool, tag = "8")]
    pub polling_mode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AgentRecordStatus {
    Enabled = 0,
    Disabled = 1,
    Deleted = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(enumeration = "AgentRecordStatus", tag = "2")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionHeartbeatRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(string, tag = "3")]
    pub connection_id: String,
    #[prost(string, tag = "4")]
    pub version: String,
    #[prost(bool, tag = "5")]
    pub alive: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

// ============================================================================
// Task events and packages
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskEvent {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(bool, tag = "3")]
    pub is_abort: bool,
    #[prost(bool, tag = "4")]
    pub is_sync: bool,
    #[prost(string, tag = "5")]
    pub task_type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollTaskEventsRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollTaskEventsResponse {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<TaskEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskRef {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub task_id: String,
    #[prost(string, tag = "3")]
    pub account_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Capability {
    /// `http`, `tcp` or `executable`
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub target: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedRecord {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SecretDetail {
    #[prost(string, tag = "1")]
    pub config_id: String,
    #[prost(message, optional, tag = "2")]
    pub record: Option<EncryptedRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptionConfig {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub kind: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskPackage {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(string, tag = "3")]
    pub task_type: String,
    /// JSON-encoded parameter object
    #[prost(bytes = "vec", tag = "4")]
    pub parameters: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    pub capabilities: Vec<Capability>,
    #[prost(int64, tag = "6")]
    pub timeout_ms: i64,
    #[prost(bool, tag = "7")]
    pub is_async: bool,
    #[prost(map = "string, message", tag = "8")]
    pub secret_details: HashMap<String, SecretDetail>,
    #[prost(map = "string, message", tag = "9")]
    pub encryption_configs: HashMap<String, EncryptionConfig>,
    /// Empty while the task is unassigned
    #[prost(string, tag = "10")]
    pub assigned_agent_id: String,
    #[prost(bool, tag = "11")]
    pub validating: bool,
    #[prost(bool, tag = "12")]
    pub capability_framework: bool,
    #[prost(int64, tag = "13")]
    pub functor_token: i64,
    #[prost(string, repeated, tag = "14")]
    pub mask_values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskPackageResponse {
    #[prost(message, optional, tag = "1")]
    pub package: Option<TaskPackage>,
}

// ============================================================================
// Validation and responses
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidationResult {
    #[prost(string, tag = "1")]
    pub criteria: String,
    #[prost(bool, tag = "2")]
    pub validated: bool,
    #[prost(int64, tag = "3")]
    pub duration_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportValidationRequest {
    #[prost(message, optional, tag = "1")]
    pub task: Option<TaskRef>,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<ValidationResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskStatus {
    Unspecified = 0,
    Success = 1,
    Failure = 2,
    TimedOut = 3,
    Aborted = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskResponse {
    #[prost(enumeration = "TaskStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub output: String,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(int64, tag = "4")]
    pub duration_ms: i64,
    #[prost(int32, optional, tag = "5")]
    pub exit_code: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportTaskResponseRequest {
    #[prost(message, optional, tag = "1")]
    pub task: Option<TaskRef>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<TaskResponse>,
}

// ============================================================================
// Upgrades and profiles
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpgradeScriptsRequest {
    #[prost(string, tag = "1")]
    pub account_id: String,
    #[prost(string, tag = "2")]
    pub current_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpgradeScripts {
    #[prost(string, tag = "1")]
    pub version: String,
    /// Script file name to contents
    #[prost(map = "string, string", tag = "2")]
    pub scripts: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpgradeScriptsResponse {
    #[prost(message, optional, tag = "1")]
    pub scripts: Option<UpgradeScripts>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckProfileRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(string, tag = "3")]
    pub profile_id: String,
    #[prost(int64, tag = "4")]
    pub last_updated_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Profile {
    #[prost(string, tag = "1")]
    pub profile_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub script: String,
    #[prost(int64, tag = "4")]
    pub updated_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileResponse {
    #[prost(message, optional, tag = "1")]
    pub profile: Option<Profile>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SaveProfileResultRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(bool, tag = "3")]
    pub failed: bool,
    #[prost(string, tag = "4")]
    pub content: String,
}

// ============================================================================
// Duplex stream payloads
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatAck {
    #[prost(string, tag = "1")]
    pub agent_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SelfDestruct {
    /// Empty for a broadcast to every agent of the account
    #[prost(string, tag = "1")]
    pub agent_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Migrate {
    #[prost(string, tag = "1")]
    pub url: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StopAcquiring {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlMessage {
    #[prost(oneof = "control_message::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<control_message::Kind>,
}

pub mod control_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Task(super::TaskEvent),
        #[prost(message, tag = "2")]
        HeartbeatAck(super::HeartbeatAck),
        #[prost(message, tag = "3")]
        SelfDestruct(super::SelfDestruct),
        #[prost(message, tag = "4")]
        Migrate(super::Migrate),
        #[prost(message, tag = "5")]
        StopAcquiring(super::StopAcquiring),
    }
}

// ============================================================================
// Client
// ============================================================================

const SERVICE: &str = "fleet.agent.v1.ControlPlane";

/// Client for the control-plane service over a tonic channel.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ControlPlaneClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn unary<Req, Resp>(
        &mut self,
        path: &'static str,
        request: Request<Req>,
    ) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = tonic::codec::ProstCodec::default();
        self.inner
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
    }

    pub async fn register_agent(
        &mut self,
        request: Request<AgentRegistration>,
    ) -> Result<Response<RegisterAgentResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/RegisterAgent", request)
            .await
    }

    pub async fn heartbeat(
        &mut self,
        request: Request<AgentStatus>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/Heartbeat", request)
            .await
    }

    pub async fn connection_heartbeat(
        &mut self,
        request: Request<ConnectionHeartbeatRequest>,
    ) -> Result<Response<Ack>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/ConnectionHeartbeat", request)
            .await
    }

    pub async fn poll_task_events(
        &mut self,
        request: Request<PollTaskEventsRequest>,
    ) -> Result<Response<PollTaskEventsResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/PollTaskEvents", request)
            .await
    }

    pub async fn acquire_task_package(
        &mut self,
        request: Request<TaskRef>,
    ) -> Result<Response<TaskPackageResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/AcquireTaskPackage", request)
            .await
    }

    pub async fn report_validation_results(
        &mut self,
        request: Request<ReportValidationRequest>,
    ) -> Result<Response<TaskPackageResponse>, Status> {
        self.unary(
            "/fleet.agent.v1.ControlPlane/ReportValidationResults",
            request,
        )
        .await
    }

    pub async fn fail_if_all_agents_failed(
        &mut self,
        request: Request<TaskRef>,
    ) -> Result<Response<Ack>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/FailIfAllAgentsFailed", request)
            .await
    }

    pub async fn report_task_response(
        &mut self,
        request: Request<ReportTaskResponseRequest>,
    ) -> Result<Response<Ack>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/ReportTaskResponse", request)
            .await
    }

    pub async fn get_upgrade_scripts(
        &mut self,
        request: Request<GetUpgradeScriptsRequest>,
    ) -> Result<Response<UpgradeScriptsResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/GetUpgradeScripts", request)
            .await
    }

    pub async fn check_profile(
        &mut self,
        request: Request<CheckProfileRequest>,
    ) -> Result<Response<ProfileResponse>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/CheckProfile", request)
            .await
    }

    pub async fn save_profile_result(
        &mut self,
        request: Request<SaveProfileResultRequest>,
    ) -> Result<Response<Ack>, Status> {
        self.unary("/fleet.agent.v1.ControlPlane/SaveProfileResult", request)
            .await
    }

    /// Opens the duplex stream: agent status out, control messages in.
    pub async fn connect(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = AgentStatus>,
    ) -> Result<Response<Streaming<ControlMessage>>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = tonic::codec::ProstCodec::default();
        self.inner
            .streaming(
                request.into_streaming_request(),
                PathAndQuery::from_static("/fleet.agent.v1.ControlPlane/Connect"),
                codec,
            )
            .await
    }
}

/// Fully qualified method name, used in log fields.
pub fn method_name(method: &str) -> String {
    format!("{}/{}", SERVICE, method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn control_message_oneof_survives_encoding() {
        let msg = ControlMessage {
            kind: Some(control_message::Kind::Migrate(Migrate {
                url: "https://new.example.com".into(),
            })),
        };
        let decoded = ControlMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_enum_value_falls_back_to_default() {
        let resp = RegisterAgentResponse {
            agent_id: "a1".into(),
            action: 42,
            migrate_url: String::new(),
        };
        assert_eq!(resp.action(), RegisterAction::Normal);
    }

    #[test]
    fn method_name_is_qualified() {
        assert_eq!(
            method_name("Heartbeat"),
            "fleet.agent.v1.ControlPlane/Heartbeat"
        );
    }
}
