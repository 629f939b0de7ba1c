use std::error::Error;

use serde_json::json;
use tracing::{info, warn};

use applytrack_app::{
    telemetry, EventFilter, ListParams, MockClient, SortColumn, SubscriptionSpec, Tracker,
};
use applytrack_core::{ApplicationStatus, NewApplication, NewCompany, Table};
use applytrack_storage::UploadOptions;
use applytrack_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let client = MockClient::from_config(&config);
    client.realtime().subscribe(
        SubscriptionSpec::new(EventFilter::All, Table::Applications),
        |event| info!(stage = "realtime", summary = %event.summary(), "application changed"),
    );

    let session = client
        .auth()
        .sign_up(
            "demo@applytrack.dev",
            "correct-horse",
            Some(json!({ "full_name": "Demo User" })),
        )
        .await?;
    info!(stage = "app", user_id = %session.user.id, env = %config.environment.as_str(), "demo user signed up");

    let company = client
        .service(Table::Companies)
        .insert_record(&NewCompany {
            name: "Acme".to_string(),
            industry: Some("Manufacturing".to_string()),
            ..NewCompany::default()
        })
        .single()
        .execute()
        .await?
        .into_value();

    let tracker = Tracker::new(client.clone());
    let mut acme = NewApplication::new("Acme", "Backend Engineer");
    acme.company_id = company["id"].as_str().map(str::to_string);
    let acme = tracker.create_application(&acme).await?;
    tracker
        .create_application(&NewApplication::new("Globex", "Platform Engineer"))
        .await?;
    tracker
        .create_application(
            &NewApplication::new("Initech", "Data Analyst").with_status(ApplicationStatus::Ghosted),
        )
        .await?;

    tracker
        .move_application(&acme.id, ApplicationStatus::Applied)
        .await?;
    tracker
        .add_note(&acme.id, "Referred by a former colleague")
        .await?;
    tracker
        .move_application(&acme.id, ApplicationStatus::PhoneScreen)
        .await?;

    client.storage("documents").upload(
        &format!("{}/resume.pdf", session.user.id),
        b"%PDF-1.7".to_vec(),
        UploadOptions {
            content_type: Some("application/pdf".to_string()),
            upsert: true,
        },
    )?;

    client.realtime().simulate_disconnection();
    tracker
        .move_application(&acme.id, ApplicationStatus::Interviewing)
        .await?;
    if let Err(err) = client.realtime().simulate_reconnection().await {
        warn!(stage = "realtime", error = %err, "realtime stayed offline");
    }

    let board = tracker.board().await?;
    let page = tracker
        .list(&ListParams {
            sort: SortColumn::CompanyName,
            ascending: true,
            ..ListParams::default()
        })
        .await?;
    let detail = tracker.application_with_activities(&acme.id).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "counts": board.counts(),
            "active": board.active_count(),
            "page": page,
            "timeline": detail.activities,
        }))?
    );
    print!("{}", telemetry::render_metrics(&metrics));
    Ok(())
}
