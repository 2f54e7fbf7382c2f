//! Standalone demo server: serves the sync API for a small demo profile,
//! with a root certificate minted at startup and a periodic stale-session
//! sweep.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use morango_core::certificates::Certificate;
use morango_core::scope::ScopeDefinition;
use morango_server::api;
use morango_server::sync::cleanup::{cleanup_syncs, CleanupOptions};
use morango_server::{EngineConfig, ForeignKeyDescriptor, ModelDescriptor, SyncEngine, SyncableModelRegistry};

const PROFILE: &str = "demodata";

#[derive(Parser, Debug)]
#[command(name = "demo-server", about = "Run a demo morango sync server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "MORANGO_LISTEN", default_value = "127.0.0.1:8000")]
    listen: String,
    /// Hours of inactivity before sessions are swept.
    #[arg(long, default_value_t = 6)]
    cleanup_expiration_hours: i64,
    /// Accept pushed client certificate chains.
    #[arg(long, default_value_t = false)]
    allow_certificate_pushing: bool,
}

fn demo_registry() -> SyncableModelRegistry {
    let mut registry = SyncableModelRegistry::new();
    registry.register(ModelDescriptor {
        model_name: "facility".into(),
        profile: PROFILE.into(),
        foreign_keys: vec![],
        self_ref_field: None,
        dependencies: vec![],
    });
    registry.register(ModelDescriptor {
        model_name: "person".into(),
        profile: PROFILE.into(),
        foreign_keys: vec![ForeignKeyDescriptor {
            field: "facility_id".into(),
            target_model: "facility".into(),
        }],
        self_ref_field: None,
        dependencies: vec![],
    });
    registry
}

fn demo_scope_definition() -> ScopeDefinition {
    ScopeDefinition {
        id: "full-facility".into(),
        profile: PROFILE.into(),
        version: 1,
        primary_scope_param_key: "dataset_id".into(),
        description: "Full access to facility ${dataset_id}".into(),
        read_filter_template: String::new(),
        write_filter_template: String::new(),
        read_write_filter_template: "${dataset_id}".into(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = EngineConfig {
        allow_certificate_pushing: args.allow_certificate_pushing,
        ..EngineConfig::default()
    };
    let engine = SyncEngine::new(config, demo_registry());

    let scope_def = demo_scope_definition();
    engine.db().save_scope_definition(scope_def.clone());
    let root = Certificate::generate_root(&scope_def, &serde_json::Map::new())?;
    info!(root_certificate = %root.id, "generated root certificate");
    engine.db().save_certificate(root);

    // hourly sweep of stale sessions
    let sweep_engine = Arc::clone(&engine);
    let expiration_hours = args.cleanup_expiration_hours;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            let (transfers, syncs) = cleanup_syncs(
                sweep_engine.db(),
                &CleanupOptions::with_expiration_hours(expiration_hours),
            );
            if transfers + syncs > 0 {
                info!(transfers, syncs, "cleaned up stale sessions");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "serving morango API");
    axum::serve(listener, api::router(engine)).await?;
    Ok(())
}
