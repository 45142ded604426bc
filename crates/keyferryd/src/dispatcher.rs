//! Per-frame pipeline: rate limit, decode, decrypt, replay check, route,
//! gate, inject. Each stage short-circuits.

use crate::capabilities::CapabilityError;
use crate::error::{AgentError, DenyReason};
use crate::metrics::{counters, histograms};
use crate::server::AgentState;
use keyferry_proto::envelope::Envelope;
use keyferry_proto::types::{reply_status, MsgType, KEY_LEN};
use keyferry_proto::{crypto, frame};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Bytes of a rejected frame shown in logs.
const PREVIEW_LEN: usize = 8;

/// One JSON reply line written after each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reply {
    /// One of the `reply_status` values.
    pub status: &'static str,
    /// Machine-readable detail, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl Reply {
    /// The request took effect.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: reply_status::OK,
            reason: None,
        }
    }

    /// A gate blocked injection and the secret went to the clipboard instead.
    #[must_use]
    pub const fn clipboard(reason: DenyReason) -> Self {
        Self {
            status: reply_status::CLIPBOARD,
            reason: Some(reason.as_str()),
        }
    }

    /// A gate blocked the request.
    #[must_use]
    pub const fn denied(reason: DenyReason) -> Self {
        Self {
            status: reply_status::DENIED,
            reason: Some(reason.as_str()),
        }
    }

    /// The origin is over its request budget.
    #[must_use]
    pub const fn rate_limited() -> Self {
        Self {
            status: reply_status::RATE_LIMITED,
            reason: None,
        }
    }

    /// The frame was refused without further detail.
    #[must_use]
    pub const fn rejected() -> Self {
        Self {
            status: reply_status::REJECTED,
            reason: None,
        }
    }

    /// Reply for an error, or `None` if the connection should be closed
    /// without one.
    #[must_use]
    pub const fn for_error(err: &AgentError) -> Option<Self> {
        match err {
            AgentError::RateLimited => Some(Self::rate_limited()),
            AgentError::PolicyDenied(reason) => Some(Self::denied(*reason)),
            AgentError::CryptoFailure
            | AgentError::NotPaired
            | AgentError::ReplayDetected
            | AgentError::InvalidPayload(_) => Some(Self::rejected()),
            AgentError::Capability(_) => Some(Self {
                status: reply_status::REJECTED,
                reason: Some("injection_failed"),
            }),
            _ => None,
        }
    }

    /// Newline-terminated JSON.
    #[must_use]
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"status":"rejected"}"#.to_vec());
        line.push(b'\n');
        line
    }
}

#[derive(Debug, Default, Deserialize)]
struct ControlBody {
    #[serde(default)]
    ttl_ms: Option<u64>,
}

/// Reads the optional `{"ttl_ms": N}` body of a control message, clamped to
/// `1..=max_ms`.
fn control_ttl(payload: &[u8], default_ms: u64, max_ms: u64) -> Result<u64, AgentError> {
    let body = if payload.iter().all(u8::is_ascii_whitespace) {
        ControlBody::default()
    } else {
        serde_json::from_slice::<ControlBody>(payload)
            .map_err(|_| AgentError::InvalidPayload("control body"))?
    };
    Ok(body.ttl_ms.unwrap_or(default_ms).clamp(1, max_ms))
}

fn preview(raw: &[u8]) -> String {
    format!(
        "{} bytes, head {}",
        raw.len(),
        hex::encode(&raw[..raw.len().min(PREVIEW_LEN)])
    )
}

/// Processes one frame received from `origin`.
///
/// # Errors
///
/// Every refusal is an [`AgentError`]; [`Reply::for_error`] maps it to the
/// reply the client sees.
pub async fn dispatch(state: &AgentState, origin: IpAddr, raw: &[u8]) -> Result<Reply, AgentError> {
    let started = Instant::now();
    let result = dispatch_inner(state, origin, raw).await;
    histograms::dispatch_seconds(started.elapsed().as_secs_f64());
    let outcome = match &result {
        Ok(reply) => reply.status,
        Err(e) => e.label(),
    };
    counters::messages_total(outcome);
    result
}

async fn dispatch_inner(
    state: &AgentState,
    origin: IpAddr,
    raw: &[u8],
) -> Result<Reply, AgentError> {
    let now = state.clock.now_ms();
    if !state.rate_limiter.check(origin, now) {
        debug!(origin = %origin, "rate limited");
        return Err(AgentError::RateLimited);
    }

    let frame = frame::decode(raw).map_err(|e| {
        warn!(origin = %origin, error = %e, frame = %preview(raw), "undecodable frame");
        AgentError::Protocol(e)
    })?;

    let Some(key) = state.registry.key_for(&frame.device_id) else {
        // Same AEAD cost as a known device with a bad tag.
        let throwaway = Zeroizing::new(crypto::random_bytes::<KEY_LEN>());
        let _ = crypto::open(&throwaway, &frame.nonce, &frame.ciphertext, &frame.aad());
        warn!(origin = %origin, frame = %preview(raw), "frame from unknown device");
        if state.registry.is_empty() {
            return Err(AgentError::NotPaired);
        }
        return Err(AgentError::CryptoFailure);
    };
    let plaintext = crypto::open(key.as_bytes(), &frame.nonce, &frame.ciphertext, &frame.aad())
        .map_err(|_| {
            warn!(origin = %origin, frame = %preview(raw), "frame failed authentication");
            AgentError::CryptoFailure
        })?;
    let envelope =
        Envelope::parse(&plaintext).map_err(|_| AgentError::InvalidPayload("envelope"))?;
    drop(plaintext);

    state
        .replay
        .check_and_record(
            &frame.device_id,
            &envelope.replay_nonce,
            envelope.timestamp_ms,
            now,
        )
        .map_err(|e| {
            warn!(device_id = %frame.device_id, reason = %e, "replay check failed");
            AgentError::ReplayDetected
        })?;

    let cfg = &state.config;
    match frame.msg_type {
        MsgType::Arm => {
            let ttl = control_ttl(&envelope.payload, cfg.arm_ttl_ms, cfg.max_arm_ttl_ms)?;
            let until = state.arm.arm(now, ttl);
            info!(device_id = %frame.device_id, until, "armed");
            Ok(Reply::ok())
        }
        MsgType::Disarm => {
            state.arm.disarm();
            info!(device_id = %frame.device_id, "disarmed");
            Ok(Reply::ok())
        }
        MsgType::Approve => {
            let ttl = control_ttl(
                &envelope.payload,
                cfg.approval_ttl_ms,
                cfg.max_approval_ttl_ms,
            )?;
            let until = state.approvals.approve(&frame.device_id, now, ttl);
            info!(device_id = %frame.device_id, until, "approval granted");
            Ok(Reply::ok())
        }
        MsgType::Inject => inject(state, &frame.device_id, envelope.payload, now).await,
    }
}

async fn inject(
    state: &AgentState,
    device_id: &str,
    secret: Zeroizing<Vec<u8>>,
    now: u64,
) -> Result<Reply, AgentError> {
    if secret.is_empty() {
        return Err(AgentError::InvalidPayload("empty secret"));
    }
    let cfg = &state.config;

    if cfg.require_approval && !state.approvals.is_approved(device_id, now) {
        return blocked(state, device_id, DenyReason::NeedsApproval, secret).await;
    }
    if cfg.require_arm && !state.arm.is_armed(now) {
        return blocked(state, device_id, DenyReason::NotArmed, secret).await;
    }
    if state.policy.is_configured() {
        let target = match state.capabilities.focus.clone() {
            Some(focus) => tokio::task::spawn_blocking(move || focus.current_target())
                .await
                .map_err(|e| CapabilityError::Failed(e.to_string()))
                .and_then(|r| r),
            None => Err(CapabilityError::Unavailable(
                "no focus inspector configured".into(),
            )),
        };
        if !state.policy.permits(&target) {
            match &target {
                Ok(t) => info!(device_id, process = %t.process, "target not allowed"),
                Err(e) => warn!(device_id, error = %e, "focus inspection failed, denying"),
            }
            return blocked(state, device_id, DenyReason::TargetNotAllowed, secret).await;
        }
    }

    let lock = Arc::clone(&state.inject_lock).lock_owned();
    let Ok(guard) = tokio::time::timeout(cfg.inject_timeout, lock).await else {
        warn!(device_id, "injection lock still held at deadline");
        return Err(CapabilityError::TimedOut(cfg.inject_timeout).into());
    };
    let now = state.clock.now_ms();

    let taken_arm = if cfg.require_arm && cfg.consume_arm {
        match state.arm.try_consume(now) {
            Some(until) => Some(until),
            None => {
                drop(guard);
                return blocked(state, device_id, DenyReason::NotArmed, secret).await;
            }
        }
    } else {
        None
    };
    if cfg.require_approval
        && cfg.consume_approval
        && state.approvals.try_consume(device_id, now).is_none()
    {
        if let Some(until) = taken_arm {
            state.arm.restore(until);
        }
        drop(guard);
        return blocked(state, device_id, DenyReason::NeedsApproval, secret).await;
    }

    let injector = state.capabilities.injector.clone();
    let len = secret.len();
    let task = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        injector.inject(&secret)
    });
    match tokio::time::timeout(cfg.inject_timeout, task).await {
        Ok(joined) => joined.map_err(|e| CapabilityError::Failed(e.to_string()))??,
        Err(_) => {
            warn!(device_id, "injector still running at deadline");
            return Err(CapabilityError::TimedOut(cfg.inject_timeout).into());
        }
    }
    info!(device_id, bytes = len, "secret injected");
    Ok(Reply::ok())
}

/// Applies the degraded clipboard path, if configured, for a blocked inject.
async fn blocked(
    state: &AgentState,
    device_id: &str,
    reason: DenyReason,
    secret: Zeroizing<Vec<u8>>,
) -> Result<Reply, AgentError> {
    info!(device_id, reason = %reason, "injection blocked");
    if !state.config.clipboard_on_block {
        return Err(AgentError::PolicyDenied(reason));
    }
    let Some(clipboard) = state.capabilities.clipboard.clone() else {
        return Err(AgentError::PolicyDenied(reason));
    };
    match tokio::task::spawn_blocking(move || clipboard.set(&secret)).await {
        Ok(Ok(())) => {
            info!(device_id, reason = %reason, "secret placed on clipboard");
            Ok(Reply::clipboard(reason))
        }
        Ok(Err(e)) => {
            warn!(device_id, error = %e, "clipboard fallback failed");
            Err(AgentError::PolicyDenied(reason))
        }
        Err(e) => {
            warn!(device_id, error = %e, "clipboard task failed");
            Err(AgentError::PolicyDenied(reason))
        }
    }
}
