//! Morango server: the replication engine with its storage backend, staged sync
//! controller, HTTP protocol layer, and network client.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod registry;
pub mod store;
pub mod sync;

pub use config::{EngineConfig, InstanceIdentity};
pub use engine::SyncEngine;
pub use errors::SyncError;
pub use registry::{ForeignKeyDescriptor, ModelDescriptor, SyncableModelRegistry};
pub use store::{AppRecord, Database, QueueSelection, StoreBackend};


/// Integration tests for the full sync flow: two engines, a real HTTP
/// server, certificate exchange, and bidirectional transfers.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use serde_json::{Map, Value};

    use morango_core::certificates::Certificate;
    use morango_core::filter::Filter;
    use morango_core::scope::ScopeDefinition;

    use crate::api;
    use crate::config::{EngineConfig, InstanceIdentity};
    use crate::engine::SyncEngine;
    use crate::registry::{ForeignKeyDescriptor, ModelDescriptor, SyncableModelRegistry};
    use crate::store::AppRecord;
    use crate::sync::client::NetworkSyncConnection;

    const PROFILE: &str = "facilitydata";

    fn scope_definition() -> ScopeDefinition {
        ScopeDefinition {
            id: "full-facility".into(),
            profile: PROFILE.into(),
            version: 1,
            primary_scope_param_key: "dataset_id".into(),
            description: "Full facility access".into(),
            read_filter_template: String::new(),
            write_filter_template: String::new(),
            read_write_filter_template: "${dataset_id}".into(),
        }
    }

    fn registry() -> SyncableModelRegistry {
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

    fn engine(hostname: &str) -> Arc<SyncEngine> {
        let config = EngineConfig {
            instance_identity: InstanceIdentity {
                hostname: hostname.to_string(),
                ..InstanceIdentity::default()
            },
            ..EngineConfig::default()
        };
        SyncEngine::new(config, registry())
    }

    async fn spawn_server(engine: Arc<SyncEngine>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, api::router(engine))
                .await
                .expect("test server");
        });
        format!("http://{addr}/")
    }

    fn person(dataset: &str, source_id: &str, name: &str) -> AppRecord {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(name.into()));
        AppRecord::new(PROFILE, "person", dataset, source_id, fields)
    }

    /// End to end: certificate signing, session handshake, push, pull, and
    /// the no-op second sync.
    #[tokio::test]
    async fn push_and_pull_between_two_engines() {
        let server_engine = engine("server-host");
        let client_engine = engine("client-host");
        server_engine.db().save_scope_definition(scope_definition());
        client_engine.db().save_scope_definition(scope_definition());

        // the server anchors the certificate tree
        let root = Certificate::generate_root(&scope_definition(), &serde_json::Map::new())
            .expect("root generation");
        server_engine.db().save_certificate(root.clone());

        let base_url = spawn_server(Arc::clone(&server_engine)).await;
        let connection = NetworkSyncConnection::connect(&base_url, client_engine.config())
            .await
            .expect("connect");
        assert_eq!(connection.server_info.instance_id.len(), 32);

        // discover the server's certificate and get a client cert signed
        let server_certs = connection
            .get_remote_certificates(&root.id, None)
            .await
            .expect("remote certificates");
        assert_eq!(server_certs.len(), 1);
        let scope_params = format!(r#"{{"dataset_id": "{}"}}"#, root.id);
        let client_cert = connection
            .certificate_signing_request(
                &client_engine,
                &server_certs[0],
                "full-facility",
                &scope_params,
                "admin",
                Some("password"),
            )
            .await
            .expect("csr");
        assert!(client_cert.has_private_key());

        let mut client = connection
            .create_sync_session(&client_engine, &client_cert, &server_certs[0])
            .await
            .expect("sync session");

        // client-side data under the root partition
        let record_a = person(&root.id, "p1", "Ada");
        let record_b = person(&root.id, "p2", "Grace");
        client_engine.db().save_app_record(record_a.clone(), None);
        client_engine.db().save_app_record(record_b.clone(), None);

        let filter = Filter::from(root.id.as_str());
        client.initiate_push(filter.clone()).await.expect("push");

        // the server has store rows, counters, and rehydrated app rows
        let server_store = server_engine
            .db()
            .get_store_record(&record_a.id)
            .expect("server store row");
        assert_eq!(server_store.partition, root.id);
        let client_instance = client_engine.db().get_or_create_current_instance();
        assert_eq!(
            server_engine.db().get_rmc(&record_a.id, &client_instance.id),
            Some(1)
        );
        let server_app = server_engine
            .db()
            .get_app_record(&record_a.id)
            .expect("server app row");
        assert_eq!(server_app.fields["name"], "Ada");

        // an immediate pull of the same filter moves zero records
        client.initiate_pull(filter.clone()).await.expect("pull");
        let pulls: Vec<_> = client_engine
            .db()
            .transfer_sessions_for_sync(&client.sync_session.id, false)
            .into_iter()
            .filter(|t| !t.push)
            .collect();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].records_total, Some(0));

        // server-side edit flows back on the next pull
        let record_c = person(&root.id, "p3", "Edsger");
        server_engine.db().save_app_record(record_c.clone(), None);
        client.initiate_pull(filter).await.expect("second pull");
        let pulled = client_engine
            .db()
            .get_app_record(&record_c.id)
            .expect("pulled app row");
        assert_eq!(pulled.fields["name"], "Edsger");

        // a filter outside both certificate scopes is refused
        let out_of_scope = connection
            .create_transfer_session(&morango_core::messages::CreateTransferSessionRequest {
                id: morango_core::random_uuid(),
                filter: "zzz:outside".into(),
                push: true,
                sync_session_id: client.sync_session.id.clone(),
                client_fsic: None,
                records_total: None,
            })
            .await;
        assert!(matches!(
            out_of_scope,
            Err(crate::SyncError::RemoteStatus { status: 403, .. })
        ));

        client.close_sync_session().await.expect("close");
        assert!(!client.sync_session.active);
        assert!(!server_engine
            .db()
            .get_sync_session(&client.sync_session.id)
            .expect("server session")
            .active);
    }

    /// Concurrent edits on both sides produce a merge conflict whose losing
    /// payload lands in the conflict log, after which both sides converge.
    #[tokio::test]
    async fn concurrent_edits_converge_with_conflict_log() {
        let server_engine = engine("server-host");
        let client_engine = engine("client-host");
        server_engine.db().save_scope_definition(scope_definition());
        client_engine.db().save_scope_definition(scope_definition());
        let root = Certificate::generate_root(&scope_definition(), &serde_json::Map::new())
            .expect("root generation");
        server_engine.db().save_certificate(root.clone());

        let base_url = spawn_server(Arc::clone(&server_engine)).await;
        let connection = NetworkSyncConnection::connect(&base_url, client_engine.config())
            .await
            .expect("connect");
        let server_certs = connection
            .get_remote_certificates(&root.id, None)
            .await
            .expect("remote certificates");
        let scope_params = format!(r#"{{"dataset_id": "{}"}}"#, root.id);
        let client_cert = connection
            .certificate_signing_request(
                &client_engine,
                &server_certs[0],
                "full-facility",
                &scope_params,
                "admin",
                None,
            )
            .await
            .expect("csr");
        let mut client = connection
            .create_sync_session(&client_engine, &client_cert, &server_certs[0])
            .await
            .expect("sync session");
        let filter = Filter::from(root.id.as_str());

        // seed one record and sync it to both sides
        let seed = person(&root.id, "shared", "v0");
        client_engine.db().save_app_record(seed.clone(), None);
        client.initiate_push(filter.clone()).await.expect("seed push");

        // both sides edit concurrently
        let mut client_edit = client_engine.db().get_app_record(&seed.id).unwrap();
        client_edit
            .fields
            .insert("name".into(), Value::String("client-edit".into()));
        client_edit.dirty_bit = true;
        client_engine.db().save_app_record(client_edit, None);

        let mut server_edit = server_engine.db().get_app_record(&seed.id).unwrap();
        server_edit
            .fields
            .insert("name".into(), Value::String("server-edit".into()));
        server_edit.dirty_bit = true;
        server_engine.db().save_app_record(server_edit, None);

        // push the client edit: the server keeps its own version and logs
        // the incoming one as conflicting
        client.initiate_push(filter.clone()).await.expect("conflict push");
        let server_store = server_engine.db().get_store_record(&seed.id).unwrap();
        assert!(server_store
            .conflicting_serialized_data
            .contains("client-edit"));

        // pulling brings the server's resolution back; both stores agree
        client.initiate_pull(filter).await.expect("conflict pull");
        let client_store = client_engine.db().get_store_record(&seed.id).unwrap();
        let server_store = server_engine.db().get_store_record(&seed.id).unwrap();
        assert_eq!(client_store.serialized, server_store.serialized);
        assert_eq!(
            client_store.last_saved_instance,
            server_store.last_saved_instance
        );
    }
}
