//! CredentialService gRPC implementation.

use crate::grpc::proto::{
    credential_service_server::CredentialService, ActivateCredentialRequest,
    ActivateCredentialResponse, AddCredentialRequest, AddCredentialResponse,
    ClearSpendingCapRequest, ClearSpendingCapResponse, Credential as ProtoCredential,
    DeactivateCredentialRequest, DeactivateCredentialResponse, GetActiveCredentialRequest,
    GetActiveCredentialResponse, GetCapStatusRequest, GetCapStatusResponse, GetCredentialRequest,
    GetCredentialResponse, GetRotationScheduleRequest, GetRotationScheduleResponse,
    GetSpendingHistoryRequest, GetSpendingHistoryResponse, ListCredentialsRequest,
    ListCredentialsResponse, ListRotationLogsRequest, ListRotationLogsResponse,
    MonthlySpending as ProtoMonthlySpending, RecordSpendRequest, RecordSpendResponse,
    RevokeCredentialRequest, RevokeCredentialResponse, RotateCredentialRequest,
    RotateCredentialResponse, RotationLog as ProtoRotationLog,
    RotationSchedule as ProtoRotationSchedule, SelectTierRequest, SelectTierResponse,
    SetSpendingCapRequest, SetSpendingCapResponse, SpendingCap as ProtoSpendingCap,
    UpdateRotationScheduleRequest, UpdateRotationScheduleResponse,
};
use crate::models::{
    Credential, CredentialFilter, CredentialStatus, MonthlySpending, NewCredential, Provider,
    RotationFrequency, RotationLog, RotationSchedule, SpendCategory, SpendingCap, Tier,
    UpdateSchedule,
};
use crate::services::metrics::{GRPC_REQUESTS_TOTAL, GRPC_REQUEST_DURATION};
use crate::services::{CredentialServices, ServiceError};
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::error::AppError;
use std::str::FromStr;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// CredentialService implementation.
pub struct CredentialServiceImpl {
    services: CredentialServices,
}

impl CredentialServiceImpl {
    pub fn new(services: CredentialServices) -> Self {
        Self { services }
    }

    fn credential_to_proto(credential: &Credential) -> ProtoCredential {
        ProtoCredential {
            credential_id: credential.credential_id.to_string(),
            provider: credential.provider.to_proto(),
            tier: credential.tier.to_proto(),
            label: credential.label.clone(),
            secret_prefix: credential.secret_prefix.clone(),
            masked: credential.masked(),
            status: credential.status.to_proto(),
            usage_count: credential.usage_count,
            last_used_at: credential.last_used_utc.map(timestamp),
            activated_at: credential.activated_utc.map(timestamp),
            deactivated_at: credential.deactivated_utc.map(timestamp),
            added_at: Some(timestamp(credential.added_utc)),
            added_by: credential
                .added_by
                .map(|id| id.to_string())
                .unwrap_or_default(),
            notes: credential.notes.clone().unwrap_or_default(),
        }
    }

    fn schedule_to_proto(schedule: &RotationSchedule, now: DateTime<Utc>) -> ProtoRotationSchedule {
        ProtoRotationSchedule {
            schedule_id: schedule.schedule_id.to_string(),
            provider: schedule.provider.to_proto(),
            tier: schedule.tier.to_proto(),
            enabled: schedule.enabled,
            frequency: schedule.frequency.to_proto(),
            last_rotation_at: schedule.last_rotation_utc.map(timestamp),
            next_rotation_at: schedule.next_rotation_utc.map(timestamp),
            notify_before_days: schedule.notify_before_days,
            notify_emails: schedule.notify_emails.clone(),
            owner_id: schedule
                .owner_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            is_due: schedule.is_due(now),
        }
    }

    fn log_to_proto(log: &RotationLog) -> ProtoRotationLog {
        ProtoRotationLog {
            log_id: log.log_id.to_string(),
            provider: log.provider.to_proto(),
            tier: log.tier.map(Tier::to_proto).unwrap_or(0),
            old_credential_id: log
                .old_credential_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            new_credential_id: log
                .new_credential_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            old_masked: log.old_masked.clone().unwrap_or_default(),
            new_masked: log.new_masked.clone().unwrap_or_default(),
            status: log.status.to_proto(),
            rotation_type: log.rotation_type.to_proto(),
            rotated_by: log
                .rotated_by
                .map(|id| id.to_string())
                .unwrap_or_default(),
            error_message: log.error_message.clone().unwrap_or_default(),
            notes: log.notes.clone().unwrap_or_default(),
            rotated_at: Some(timestamp(log.rotated_utc)),
        }
    }

    fn cap_to_proto(cap: &SpendingCap) -> ProtoSpendingCap {
        ProtoSpendingCap {
            cap_id: cap.cap_id.to_string(),
            amount_usd: cap.amount_usd.to_string(),
            is_active: cap.is_active,
            created_by: cap
                .created_by
                .map(|id| id.to_string())
                .unwrap_or_default(),
            created_at: Some(timestamp(cap.created_utc)),
        }
    }

    fn month_to_proto(month: &MonthlySpending) -> ProtoMonthlySpending {
        ProtoMonthlySpending {
            year: month.year,
            month: month.month,
            total_cost: month.total_cost.to_string(),
            llm_cost: month.llm_cost.to_string(),
            tts_cost: month.tts_cost.to_string(),
            other_cost: month.other_cost.to_string(),
            premium_cost: month.premium_cost.to_string(),
            standard_cost: month.standard_cost.to_string(),
            fallback_cost: month.fallback_cost.to_string(),
            total_requests: month.total_requests,
            llm_requests: month.llm_requests,
            tts_requests: month.tts_requests,
            other_requests: month.other_requests,
            premium_requests: month.premium_requests,
            standard_requests: month.standard_requests,
            fallback_requests: month.fallback_requests,
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn count(method: &str, status: &str) {
    GRPC_REQUESTS_TOTAL
        .with_label_values(&[method, status])
        .inc();
}

fn invalid_argument(method: &str, message: impl Into<String>) -> Status {
    count(method, "invalid_argument");
    Status::invalid_argument(message)
}

/// Count and convert a service failure.
fn service_error(method: &str, err: ServiceError) -> Status {
    let label = match &err {
        ServiceError::NotFound(_) => "not_found",
        ServiceError::Validation(_) => "invalid_argument",
        ServiceError::InvalidTransition(_) | ServiceError::NoCredentialAvailable { .. } => {
            "failed_precondition"
        }
        ServiceError::StorageUnavailable(_) => "unavailable",
        _ => {
            warn!(method = method, error = %err, "Request failed");
            "error"
        }
    };
    count(method, label);
    AppError::from(err).into()
}

fn parse_uuid(method: &str, field: &str, value: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| invalid_argument(method, format!("Invalid {} format", field)))
}

/// Empty string means "not set".
fn parse_optional_uuid(method: &str, field: &str, value: &str) -> Result<Option<Uuid>, Status> {
    if value.is_empty() {
        Ok(None)
    } else {
        parse_uuid(method, field, value).map(Some)
    }
}

fn parse_provider(method: &str, value: i32) -> Result<Provider, Status> {
    Provider::from_proto(value).ok_or_else(|| invalid_argument(method, "Invalid provider"))
}

fn parse_tier(method: &str, value: i32) -> Result<Tier, Status> {
    Tier::from_proto(value).ok_or_else(|| invalid_argument(method, "Invalid tier"))
}

/// `0` (unspecified) means "not set"; any other unknown value is rejected.
fn parse_optional<T>(
    method: &str,
    field: &str,
    value: i32,
    from_proto: fn(i32) -> Option<T>,
) -> Result<Option<T>, Status> {
    if value == 0 {
        return Ok(None);
    }
    from_proto(value)
        .map(Some)
        .ok_or_else(|| invalid_argument(method, format!("Invalid {}", field)))
}

fn parse_amount(method: &str, field: &str, value: &str) -> Result<Decimal, Status> {
    Decimal::from_str(value.trim())
        .map_err(|_| invalid_argument(method, format!("{} must be a decimal amount", field)))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[tonic::async_trait]
impl CredentialService for CredentialServiceImpl {
    // -------------------------------------------------------------------------
    // Credential pool
    // -------------------------------------------------------------------------

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "AddCredential")
    )]
    async fn add_credential(
        &self,
        request: Request<AddCredentialRequest>,
    ) -> Result<Response<AddCredentialResponse>, Status> {
        const METHOD: &str = "AddCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_provider(METHOD, req.provider)?;
        let tier = parse_tier(METHOD, req.tier)?;
        let added_by = parse_optional_uuid(METHOD, "added_by", &req.added_by)?;

        if req.secret.trim().is_empty() {
            return Err(invalid_argument(METHOD, "secret is required"));
        }

        let input = NewCredential {
            provider,
            tier,
            label: req.label,
            secret: Secret::new(req.secret),
            added_by,
            notes: non_empty(req.notes),
        };

        let credential = self
            .services
            .pool
            .add(input)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        info!(
            credential_id = %credential.credential_id,
            provider = %credential.provider,
            tier = %credential.tier,
            "Credential added"
        );

        Ok(Response::new(AddCredentialResponse {
            credential: Some(Self::credential_to_proto(&credential)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "GetCredential")
    )]
    async fn get_credential(
        &self,
        request: Request<GetCredentialRequest>,
    ) -> Result<Response<GetCredentialResponse>, Status> {
        const METHOD: &str = "GetCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let id = parse_uuid(METHOD, "credential_id", &req.credential_id)?;

        let credential = self
            .services
            .pool
            .get(id)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(GetCredentialResponse {
            credential: Some(Self::credential_to_proto(&credential)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "ListCredentials")
    )]
    async fn list_credentials(
        &self,
        request: Request<ListCredentialsRequest>,
    ) -> Result<Response<ListCredentialsResponse>, Status> {
        const METHOD: &str = "ListCredentials";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let filter = CredentialFilter {
            provider: parse_optional(METHOD, "provider", req.provider, Provider::from_proto)?,
            tier: parse_optional(METHOD, "tier", req.tier, Tier::from_proto)?,
            status: parse_optional(METHOD, "status", req.status, CredentialStatus::from_proto)?,
        };

        let credentials = self
            .services
            .pool
            .list(filter)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(ListCredentialsResponse {
            credentials: credentials.iter().map(Self::credential_to_proto).collect(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "ActivateCredential")
    )]
    async fn activate_credential(
        &self,
        request: Request<ActivateCredentialRequest>,
    ) -> Result<Response<ActivateCredentialResponse>, Status> {
        const METHOD: &str = "ActivateCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let id = parse_uuid(METHOD, "credential_id", &req.credential_id)?;

        let activation = self
            .services
            .pool
            .activate(id)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(ActivateCredentialResponse {
            credential: Some(Self::credential_to_proto(&activation.credential)),
            deactivated_credential_ids: activation
                .deactivated
                .iter()
                .map(|id| id.to_string())
                .collect(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "DeactivateCredential")
    )]
    async fn deactivate_credential(
        &self,
        request: Request<DeactivateCredentialRequest>,
    ) -> Result<Response<DeactivateCredentialResponse>, Status> {
        const METHOD: &str = "DeactivateCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let id = parse_uuid(METHOD, "credential_id", &req.credential_id)?;

        let credential = self
            .services
            .pool
            .deactivate(id)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(DeactivateCredentialResponse {
            credential: Some(Self::credential_to_proto(&credential)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "RevokeCredential")
    )]
    async fn revoke_credential(
        &self,
        request: Request<RevokeCredentialRequest>,
    ) -> Result<Response<RevokeCredentialResponse>, Status> {
        const METHOD: &str = "RevokeCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let id = parse_uuid(METHOD, "credential_id", &req.credential_id)?;

        let credential = self
            .services
            .pool
            .revoke(id)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(RevokeCredentialResponse {
            credential: Some(Self::credential_to_proto(&credential)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "GetActiveCredential")
    )]
    async fn get_active_credential(
        &self,
        request: Request<GetActiveCredentialRequest>,
    ) -> Result<Response<GetActiveCredentialResponse>, Status> {
        const METHOD: &str = "GetActiveCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_provider(METHOD, req.provider)?;
        let tier = parse_tier(METHOD, req.tier)?;

        let credential = self
            .services
            .pool
            .get_active(provider, tier)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(GetActiveCredentialResponse {
            credential: credential.as_ref().map(Self::credential_to_proto),
        }))
    }

    // -------------------------------------------------------------------------
    // Rotation
    // -------------------------------------------------------------------------

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "RotateCredential")
    )]
    async fn rotate_credential(
        &self,
        request: Request<RotateCredentialRequest>,
    ) -> Result<Response<RotateCredentialResponse>, Status> {
        const METHOD: &str = "RotateCredential";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_provider(METHOD, req.provider)?;
        let tier = parse_tier(METHOD, req.tier)?;
        let rotated_by = parse_optional_uuid(METHOD, "rotated_by", &req.rotated_by)?;

        let log = self
            .services
            .engine
            .rotate_manual(provider, tier, rotated_by, non_empty(req.notes))
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(RotateCredentialResponse {
            rotation_log: Some(Self::log_to_proto(&log)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "GetRotationSchedule")
    )]
    async fn get_rotation_schedule(
        &self,
        request: Request<GetRotationScheduleRequest>,
    ) -> Result<Response<GetRotationScheduleResponse>, Status> {
        const METHOD: &str = "GetRotationSchedule";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_provider(METHOD, req.provider)?;
        let tier = parse_tier(METHOD, req.tier)?;

        let (schedule, created) = self
            .services
            .schedules
            .get_or_create(provider, tier)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(GetRotationScheduleResponse {
            schedule: Some(Self::schedule_to_proto(&schedule, Utc::now())),
            created,
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "UpdateRotationSchedule")
    )]
    async fn update_rotation_schedule(
        &self,
        request: Request<UpdateRotationScheduleRequest>,
    ) -> Result<Response<UpdateRotationScheduleResponse>, Status> {
        const METHOD: &str = "UpdateRotationSchedule";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_provider(METHOD, req.provider)?;
        let tier = parse_tier(METHOD, req.tier)?;
        let frequency =
            parse_optional(METHOD, "frequency", req.frequency, RotationFrequency::from_proto)?
                .unwrap_or_default();
        let owner_id = parse_optional_uuid(METHOD, "owner_id", &req.owner_id)?;

        let update = UpdateSchedule {
            enabled: req.enabled,
            frequency,
            notify_before_days: req.notify_before_days,
            notify_emails: req.notify_emails,
            owner_id,
        };

        let schedule = self
            .services
            .schedules
            .update(provider, tier, update)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(UpdateRotationScheduleResponse {
            schedule: Some(Self::schedule_to_proto(&schedule, Utc::now())),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "ListRotationLogs")
    )]
    async fn list_rotation_logs(
        &self,
        request: Request<ListRotationLogsRequest>,
    ) -> Result<Response<ListRotationLogsResponse>, Status> {
        const METHOD: &str = "ListRotationLogs";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let provider = parse_optional(METHOD, "provider", req.provider, Provider::from_proto)?;
        let limit = (req.limit > 0).then_some(i64::from(req.limit));

        let logs = self
            .services
            .audit
            .recent(provider, limit)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(ListRotationLogsResponse {
            logs: logs.iter().map(Self::log_to_proto).collect(),
        }))
    }

    // -------------------------------------------------------------------------
    // Spending
    // -------------------------------------------------------------------------

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "SetSpendingCap")
    )]
    async fn set_spending_cap(
        &self,
        request: Request<SetSpendingCapRequest>,
    ) -> Result<Response<SetSpendingCapResponse>, Status> {
        const METHOD: &str = "SetSpendingCap";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let amount = parse_amount(METHOD, "amount_usd", &req.amount_usd)?;
        let created_by = parse_optional_uuid(METHOD, "created_by", &req.created_by)?;

        let cap = self
            .services
            .ledger
            .set_cap(amount, created_by)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(SetSpendingCapResponse {
            cap: Some(Self::cap_to_proto(&cap)),
        }))
    }

    #[instrument(
        skip(self, _request),
        fields(service = "credential-service", method = "ClearSpendingCap")
    )]
    async fn clear_spending_cap(
        &self,
        _request: Request<ClearSpendingCapRequest>,
    ) -> Result<Response<ClearSpendingCapResponse>, Status> {
        const METHOD: &str = "ClearSpendingCap";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let cleared = self
            .services
            .ledger
            .clear_cap()
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(ClearSpendingCapResponse {
            deactivated: cleared as i64,
        }))
    }

    #[instrument(
        skip(self, _request),
        fields(service = "credential-service", method = "GetCapStatus")
    )]
    async fn get_cap_status(
        &self,
        _request: Request<GetCapStatusRequest>,
    ) -> Result<Response<GetCapStatusResponse>, Status> {
        const METHOD: &str = "GetCapStatus";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let status = self
            .services
            .ledger
            .cap_status()
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        let opt = |value: Option<Decimal>| value.map(|d| d.to_string()).unwrap_or_default();

        Ok(Response::new(GetCapStatusResponse {
            has_cap: status.has_cap,
            cap_amount: opt(status.cap_amount),
            spent: status.spent.to_string(),
            remaining: opt(status.remaining),
            percentage: opt(status.percentage),
            alert_level: status.alert_level.to_proto(),
            is_over_cap: status.is_over_cap,
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "RecordSpend")
    )]
    async fn record_spend(
        &self,
        request: Request<RecordSpendRequest>,
    ) -> Result<Response<RecordSpendResponse>, Status> {
        const METHOD: &str = "RecordSpend";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let amount = parse_amount(METHOD, "amount_usd", &req.amount_usd)?;
        let category = SpendCategory::from_proto(req.category)
            .ok_or_else(|| invalid_argument(METHOD, "Invalid category"))?;
        let tier = parse_optional(METHOD, "tier", req.tier, Tier::from_proto)?;

        let month = self
            .services
            .ledger
            .record_spend(amount, category, tier)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(RecordSpendResponse {
            month: Some(Self::month_to_proto(&month)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "GetSpendingHistory")
    )]
    async fn get_spending_history(
        &self,
        request: Request<GetSpendingHistoryRequest>,
    ) -> Result<Response<GetSpendingHistoryResponse>, Status> {
        const METHOD: &str = "GetSpendingHistory";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let months = (req.months > 0).then_some(i64::from(req.months));

        let history = self
            .services
            .ledger
            .history(months)
            .await
            .map_err(|e| service_error(METHOD, e))?;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(GetSpendingHistoryResponse {
            months: history.iter().map(Self::month_to_proto).collect(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "credential-service", method = "SelectTier")
    )]
    async fn select_tier(
        &self,
        request: Request<SelectTierRequest>,
    ) -> Result<Response<SelectTierResponse>, Status> {
        const METHOD: &str = "SelectTier";
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();

        let req = request.into_inner();
        let force = parse_optional(METHOD, "force_tier", req.force_tier, Tier::from_proto)?;

        let tier = self.services.tier_selector.select_tier(force).await;

        count(METHOD, "ok");
        timer.observe_duration();

        Ok(Response::new(SelectTierResponse {
            tier: tier.to_proto(),
        }))
    }
}
