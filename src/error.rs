use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use tracing::{error, warn};

use crate::api::validation::ErrorResponse;

/// Errors produced by the job engine.
///
/// Everything here is a business-level outcome: handlers surface these to
/// the caller, the orchestrator converts the ones raised during background
/// execution into a `failed` job instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A job with this scan id already exists (and is not crashed).
    #[error("job {id} already exists with status {status}")]
    DuplicateJob { id: String, status: String },

    /// The requested state transition is not permitted from the job's
    /// current status.
    #[error("cannot {action} job {id} from status {status}")]
    InvalidTransition {
        action: &'static str,
        id: String,
        status: String,
    },

    /// Resume was requested but no checkpoint exists to resume from.
    #[error("no checkpoint found to resume job {id}")]
    NoCheckpoint { id: String },

    #[error("job {id} not found")]
    JobNotFound { id: String },

    /// A page fetch failed after the source adapter exhausted its own
    /// retries. Fatal to the current extraction attempt.
    #[error("upstream fetch failed on page {page}: {message}")]
    UpstreamFetch { page: i64, message: String },

    /// Job setup could not proceed (missing/corrupt config, credential
    /// decode failure, unhealthy store).
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl EngineError {
    /// Short stable tag recorded in `metadata.error_details.error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DuplicateJob { .. } => "DuplicateJob",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::NoCheckpoint { .. } => "NoCheckpoint",
            EngineError::JobNotFound { .. } => "JobNotFound",
            EngineError::UpstreamFetch { .. } => "UpstreamFetch",
            EngineError::Setup(_) => "Setup",
            EngineError::Persistence(_) => "Persistence",
        }
    }
}

impl ResponseError for EngineError {
    fn error_response(&self) -> HttpResponse {
        match self {
            EngineError::DuplicateJob { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::NoCheckpoint { .. } => {
                warn!("Request rejected: {}", self);
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Conflict".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::JobNotFound { .. } => {
                warn!("Request rejected: {}", self);
                HttpResponse::NotFound().json(ErrorResponse {
                    error: "Not found".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::UpstreamFetch { .. } => {
                error!("Upstream error: {}", self);
                HttpResponse::BadGateway().json(ErrorResponse {
                    error: "Upstream error".to_string(),
                    fields: serde_json::json!({"message": self.to_string()}),
                })
            }
            EngineError::Setup(message) => {
                error!("Setup error: {}", message);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "Setup failed".to_string(),
                    fields: serde_json::json!({"message": message}),
                })
            }
            EngineError::Persistence(e) => {
                // Log the full error for debugging, return a generic body.
                error!("Database error: {:?}", e);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "Failed to process request".to_string(),
                    fields: serde_json::json!({"message": "Database error occurred"}),
                })
            }
        }
    }
}
