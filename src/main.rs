// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Frontdesk server binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use frontdesk::config::OrchestratorConfig;
use frontdesk::engine::ConversationEngine;
use frontdesk::registry::SessionRegistry;
use frontdesk::server::{self, AppState};
use frontdesk::services::openai::OpenAILLMClient;
use frontdesk::sinks::LoggingSink;
use frontdesk::tenant::store::InMemoryTenantStore;
use frontdesk::tenant::{TenantResolver, ToolPolicy};
use frontdesk::tools::ToolRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the config reads the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(OrchestratorConfig::from_env());
    let address = config.address();

    // The tenant store is the seam to the real data layer; the in-memory
    // store serves development and single-node trials.
    let store = Arc::new(InMemoryTenantStore::new());
    let resolver = Arc::new(
        TenantResolver::new(store.clone(), config.tenant_cache_ttl).with_tool_policy(
            ToolPolicy {
                max_calls_per_turn: config.tool_budget_per_turn,
                call_timeout: config.tool_timeout,
                turn_deadline: config.tool_turn_deadline,
            },
        ),
    );
    let router = Arc::new(ToolRouter::new(store, config.tool_timeout));

    let llm = Arc::new(
        OpenAILLMClient::new(
            config.openai_api_key.clone().unwrap_or_default(),
            config.llm_model.clone(),
        )
        .with_base_url(config.openai_base_url.clone()),
    );
    let engine = Arc::new(ConversationEngine::new(llm, router));

    let registry = Arc::new(SessionRegistry::new());
    let sink = Arc::new(LoggingSink);

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        resolver,
        engine,
        booking_sink: sink.clone(),
        sms_sink: sink.clone(),
        call_log: sink,
    };

    let app = server::router(state);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(%address, "Frontdesk listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Give in-flight calls a bounded window to finish cleanly.
    registry.shutdown(config.shutdown_drain).await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    // A short grace so responses in flight on the HTTP side settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
