mod error;
mod state;
mod telemetry;
pub mod routes {
    pub mod explain;
    pub mod health;
    pub mod jobs;
    pub mod solve;
    pub mod validate;
}

use axum::{
    routing::{get, post},
    Router,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
        paths(
            routes::health::health,
            routes::solve::solve,
            routes::jobs::status,
            routes::jobs::result,
            routes::validate::validate_handler,
            routes::explain::explain,
        ),
        components(schemas(
            types::ScheduleInput, types::Subject, types::Teacher, types::Venue,
            types::VenueBinding, types::TeachingTask, types::WeekGrid, types::DaySection,
            types::TimeSlot, types::SlotRef, types::ClassSn, types::SubjectId, types::GradeId,
            types::ClassId, types::TeacherId, types::VenueId, types::SubjectGroupId,
            types::TeacherGroupId, types::RuleBook, types::ClassSlotRule,
            types::SubjectGroupSlotRule, types::TeacherGroupSlotRule, types::SubjectExclusionRule,
            types::SubjectOrderRule, types::DayRepeatRule, types::PeriodCapRule,
            types::TeacherLoadRule, types::TeacherExclusionRule, types::NoonBreakRule,
            types::SlotPolicy, types::LoadSection, types::RuleParams,
            types::GaParams, types::SolveRequest, types::SolveResult, types::Placement,
            types::GenerationStats,
            jobs::JobId, jobs::JobStatus,
            routes::validate::ValidationReport,
            routes::solve::JobCreated,
            routes::explain::ExplainIn,
            routes::explain::ExplainOut
        )),
        tags(
            (name = "ttable", description = "School timetable optimization API")
        )
    )]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let app_state = state::AppState::new_default();

    let app = Router::new()
        .route("/v1/health", get(routes::health::health))
        .route("/v1/solve", post(routes::solve::solve))
        .route("/v1/validate", post(routes::validate::validate_handler))
        .route("/v1/explain", post(routes::explain::explain))
        .route("/v1/jobs/:id", get(routes::jobs::status))
        .route("/v1/jobs/:id/result", get(routes::jobs::result))
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(telemetry::stack())
        .with_state(app_state);

    let port = std::env::var("TTABLE__SERVER__PORT").unwrap_or_else(|_| "8080".into());
    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .expect("invalid listen addr");
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
