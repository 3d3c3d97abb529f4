#![forbid(unsafe_code)]

// REST API - request/response signaling operations

use super::protocol::{
    ConnectTransportRequest, ConsumeRequest, CreateTransportRequest, ErrorResponse, ProduceRequest,
    ProduceResponse, RecordingRequest, RecordingResponse, ResumeConsumerRequest,
    RtpCapabilitiesResponse, SuccessResponse,
};
use super::{validate_id, SignalingServer};
use crate::media::types::{
    ConsumerInfo, Direction, ErrorKind, MediaError, MediaKind, MediaResult, TransportInfo,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;
use tracing::warn;

/// Error response: `{"error": message}` with a status derived from the error kind
#[derive(Debug)]
pub struct ApiError(MediaError);

impl From<MediaError> for ApiError {
    fn from(error: MediaError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
            ErrorKind::Engine => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Records latency and errors for one request
fn respond<T>(server: &SignalingServer, operation: &str, start: Instant, result: MediaResult<T>) -> ApiResult<T> {
    server.metrics.observe_request_handling(start.elapsed());
    result.map(Json).map_err(|e| {
        server.metrics.inc_errors();
        warn!("{} failed: {}", operation, e);
        ApiError(e)
    })
}

pub(super) async fn rtp_capabilities(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> ApiResult<RtpCapabilitiesResponse> {
    let start = Instant::now();
    let result = async {
        validate_id("roomId", &room_id)?;
        let rtp_capabilities = server.room_manager.rtp_capabilities(&room_id).await?;
        Ok::<_, MediaError>(RtpCapabilitiesResponse { rtp_capabilities })
    }
    .await;
    respond(&server, "rtp-capabilities", start, result)
}

pub(super) async fn create_transport(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<CreateTransportRequest>,
) -> ApiResult<TransportInfo> {
    let start = Instant::now();
    let result = async {
        let direction: Direction = req.direction.parse()?;
        let peer = server.room_manager.get_peer(&room_id, &req.peer_id)?;
        peer.create_transport(direction).await
    }
    .await;
    respond(&server, "create-transport", start, result)
}

pub(super) async fn connect_transport(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<ConnectTransportRequest>,
) -> ApiResult<SuccessResponse> {
    let start = Instant::now();
    let result = async {
        let peer = server.room_manager.get_peer(&room_id, &req.peer_id)?;
        peer.connect_transport(&req.transport_id, req.dtls_parameters).await?;
        Ok::<_, MediaError>(SuccessResponse { success: true })
    }
    .await;
    respond(&server, "connect-transport", start, result)
}

pub(super) async fn produce(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<ProduceRequest>,
) -> ApiResult<ProduceResponse> {
    let start = Instant::now();
    let result = async {
        let kind: MediaKind = req.kind.parse()?;
        let peer = server.room_manager.get_peer(&room_id, &req.peer_id)?;
        let producer_id = peer.produce(&req.transport_id, kind, req.rtp_parameters).await?;
        Ok::<_, MediaError>(ProduceResponse { producer_id })
    }
    .await;
    respond(&server, "produce", start, result)
}

pub(super) async fn consume(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<ConsumerInfo> {
    let start = Instant::now();
    let result = async {
        let peer = server.room_manager.get_peer(&room_id, &req.peer_id)?;
        peer.consume(&req.producer_id, req.rtp_capabilities).await
    }
    .await;
    respond(&server, "consume", start, result)
}

pub(super) async fn resume_consumer(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<ResumeConsumerRequest>,
) -> ApiResult<SuccessResponse> {
    let start = Instant::now();
    let result = async {
        let peer = server.room_manager.get_peer(&room_id, &req.peer_id)?;
        peer.resume_consumer(&req.consumer_id).await?;
        Ok::<_, MediaError>(SuccessResponse { success: true })
    }
    .await;
    respond(&server, "resume-consumer", start, result)
}

pub(super) async fn start_recording(
    State(server): State<SignalingServer>,
    Json(req): Json<RecordingRequest>,
) -> ApiResult<RecordingResponse> {
    let start = Instant::now();
    let result = server
        .room_manager
        .start_recording(&req.room_id, &req.recording_id)
        .map(|()| RecordingResponse { success: true, recording_id: req.recording_id.clone() });
    respond(&server, "start-recording", start, result)
}

pub(super) async fn stop_recording(
    State(server): State<SignalingServer>,
    Json(req): Json<RecordingRequest>,
) -> ApiResult<RecordingResponse> {
    let start = Instant::now();
    let result = server.room_manager.stop_recording(&req.room_id).map(|recording_id| {
        if recording_id != req.recording_id {
            warn!(
                "Stop for recording {} in room {} ended running recording {}",
                req.recording_id, req.room_id, recording_id
            );
        }
        RecordingResponse { success: true, recording_id }
    });
    respond(&server, "stop-recording", start, result)
}
