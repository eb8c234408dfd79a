use actix_web::{
    delete, get, post,
    web::{Data, Path, Query, ServiceConfig, scope},
    HttpResponse,
};
use actix_web_validator::Json;
use serde_json::json;

use crate::api::scan::dto::{
    CleanupQuery, DetectCrashedQuery, JobView, ListQuery, ResultsQuery, ScanStatusResponse,
    StartScanRequest, StatisticsQuery,
};
use crate::api::scan::dto::CheckpointView;
use crate::error::EngineError;
use crate::extraction::service::{ExtractionService, ScanSpec};

#[post("/start")]
async fn start_scan(
    service: Data<ExtractionService>,
    request: Json<StartScanRequest>,
) -> Result<HttpResponse, EngineError> {
    let request = request.into_inner();
    let ack = service.start_scan(ScanSpec {
        scan_id: request.scan_id,
        organization_id: request.organization_id,
        source_types: request.source_types,
        auth: request.auth,
        filters: request.filters,
    });
    Ok(HttpResponse::Accepted().json(ack))
}

#[get("/{scan_id}/status")]
async fn scan_status(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let scan_id = path.into_inner();
    match service.get_scan_status(&scan_id).await? {
        Some(view) => Ok(HttpResponse::Ok().json(ScanStatusResponse::from(view))),
        None => Err(EngineError::JobNotFound { id: scan_id }),
    }
}

#[post("/{scan_id}/pause")]
async fn pause_scan(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let scan_id = path.into_inner();
    let view = service.pause_scan(&scan_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Scan {} has been paused successfully", scan_id),
        "data": ScanStatusResponse::from(view),
    })))
}

#[post("/{scan_id}/resume")]
async fn resume_scan(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let ack = service.resume_scan(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "data": ack,
    })))
}

#[post("/{scan_id}/cancel")]
async fn cancel_scan(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let scan_id = path.into_inner();
    let job = service.cancel_scan(&scan_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Scan {} cancelled successfully", scan_id),
        "data": JobView::from(job),
    })))
}

#[delete("/{scan_id}/remove")]
async fn remove_scan(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let outcome = service.remove_scan(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Scan {} successfully removed", outcome.scan_id),
        "data": outcome,
    })))
}

#[get("/list")]
async fn list_scans(
    service: Data<ExtractionService>,
    query: Query<ListQuery>,
) -> Result<HttpResponse, EngineError> {
    let jobs = service
        .list_scans(query.organization_id.as_deref(), query.limit, query.offset)
        .await?;
    let views: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Ok(HttpResponse::Ok().json(json!({
        "count": views.len(),
        "scans": views,
    })))
}

#[get("/statistics")]
async fn scan_statistics(
    service: Data<ExtractionService>,
    query: Query<StatisticsQuery>,
) -> Result<HttpResponse, EngineError> {
    let stats = service
        .get_scan_statistics(query.organization_id.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[get("/{scan_id}/checkpoint")]
async fn latest_checkpoint(
    service: Data<ExtractionService>,
    path: Path<String>,
) -> Result<HttpResponse, EngineError> {
    let scan_id = path.into_inner();
    match service.jobs().get_latest_checkpoint(&scan_id).await? {
        Some(checkpoint) => Ok(HttpResponse::Ok().json(CheckpointView::from(checkpoint))),
        None => Err(EngineError::NoCheckpoint { id: scan_id }),
    }
}

#[get("/{scan_id}/result")]
async fn scan_results(
    service: Data<ExtractionService>,
    path: Path<String>,
    query: Query<ResultsQuery>,
) -> Result<HttpResponse, EngineError> {
    let results = service
        .get_scan_results(&path.into_inner(), query.limit, query.offset)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "data": results,
    })))
}

#[post("/detect-crashed")]
async fn detect_crashed(
    service: Data<ExtractionService>,
    query: Query<DetectCrashedQuery>,
) -> Result<HttpResponse, EngineError> {
    let crashed = service.detect_crashed_jobs(query.timeout_minutes).await?;
    Ok(HttpResponse::Ok().json(json!({
        "crashedCount": crashed.len(),
        "crashedScans": crashed,
        "timeoutMinutes": query.timeout_minutes,
    })))
}

#[post("/cleanup")]
async fn cleanup(
    service: Data<ExtractionService>,
    query: Query<CleanupQuery>,
) -> Result<HttpResponse, EngineError> {
    let deleted = service.cleanup_old_scans(query.days_old).await?;
    Ok(HttpResponse::Ok().json(json!({
        "deletedScans": deleted,
        "daysOld": query.days_old,
    })))
}

pub fn scan_config(config: &mut ServiceConfig) {
    config
        .service(
            scope("/api/scans")
                .service(start_scan)
                .service(list_scans)
                .service(scan_statistics)
                .service(scan_status)
                .service(pause_scan)
                .service(resume_scan)
                .service(cancel_scan)
                .service(remove_scan)
                .service(latest_checkpoint),
        )
        .service(scope("/api/results").service(scan_results))
        .service(
            scope("/api/maintenance")
                .service(detect_crashed)
                .service(cleanup),
        );
}
