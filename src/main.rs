mod api;
mod config;
mod error;
mod history;
mod llm;
mod orchestrator;
mod types;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::llm::gemini::GeminiClient;
use crate::llm::{CandidateList, ProviderClient};
use crate::orchestrator::ChatOrchestrator;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,actix_web=info")),
        )
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;

    let gemini = Arc::new(GeminiClient::new(&config.provider));
    let candidates = CandidateList::from_identifiers(config.provider.models.clone());
    anyhow::ensure!(!candidates.is_empty(), "no model candidates configured");

    if config.provider.verify_models {
        verify_candidates(&gemini, &candidates).await;
    }

    let client: Arc<dyn ProviderClient> = gemini;
    let orchestrator = web::Data::new(ChatOrchestrator::new(client, candidates, &config.chat));

    tracing::info!(
        models = ?orchestrator.candidates().identifiers(),
        timeout_secs = config.chat.request_timeout_secs,
        "model candidates loaded"
    );

    let cors_origins = config.server.cors_origins.clone();
    let bind = (config.server.host.clone(), config.server.port);
    tracing::info!("Starting server at http://{}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(middleware::Logger::default())
            .app_data(orchestrator.clone())
            .configure(api::configure)
    })
    .bind(bind)
    .context("failed to bind server address")?
    .run()
    .await?;

    Ok(())
}

fn build_cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

    if origins.iter().any(|origin| origin == "*") {
        cors.allow_any_origin()
    } else {
        origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

async fn verify_candidates(client: &GeminiClient, candidates: &CandidateList) {
    match client.list_models().await {
        Ok(served) => {
            for model in candidates.missing_from(&served) {
                tracing::warn!(model, "configured model is not served by the provider");
            }
        }
        Err(err) => tracing::warn!("could not list provider models: {}", err),
    }
}
