//! The in-memory reference database.
//!
//! All tables live behind one `RwLock`; each public method takes the lock
//! for its whole body, which is the in-memory analogue of running the
//! statement inside a transaction. Cross-method atomicity (e.g. the dequeue
//! step sequence) is provided by the per-session locks in the engine layer.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use std::collections::BTreeMap;

use morango_core::certificates::{Certificate, SerializedCertificate};
use morango_core::crypto::PrivateKey;
use morango_core::filter::Filter;
use morango_core::fsic::{FsicV2, InstanceCounters};
use morango_core::instance::{DatabaseId, InstanceId};
use morango_core::records::{
    BufferRecord, DatabaseMaxCounter, Nonce, RecordMaxCounter, RecordMaxCounterBuffer,
    StoreRecord,
};
use morango_core::scope::ScopeDefinition;
use morango_core::sessions::{SyncSession, TransferSession};
use morango_core::uuids::random_uuid;

use crate::config::InstanceIdentity;
use crate::errors::SyncError;
use crate::registry::SyncableModelRegistry;
use crate::store::app::AppRecord;
use crate::store::backend::{QueueSelection, StoreBackend};
use crate::store::now_millis;

#[derive(Default)]
struct Tables {
    database_ids: Vec<DatabaseId>,
    instances: Vec<InstanceId>,
    scope_definitions: HashMap<String, ScopeDefinition>,
    certificates: BTreeMap<String, Certificate>,
    nonces: HashMap<String, Nonce>,
    shared_key: Option<PrivateKey>,
    stores: BTreeMap<String, StoreRecord>,
    /// (store_id, instance_id) -> counter
    rmcs: BTreeMap<(String, String), i64>,
    /// (instance_id, partition) -> counter
    dmcs: BTreeMap<(String, String), i64>,
    /// id -> profile
    deleted_models: HashMap<String, String>,
    hard_deleted_models: HashMap<String, String>,
    app_records: BTreeMap<String, AppRecord>,
    sync_sessions: BTreeMap<String, SyncSession>,
    transfer_sessions: BTreeMap<String, TransferSession>,
    /// (transfer_session_id, model_uuid) -> buffer row
    buffers: BTreeMap<(String, String), BufferRecord>,
    /// (transfer_session_id, model_uuid, instance_id) -> counter
    rmcbs: BTreeMap<(String, String, String), i64>,
}

/// The in-memory database backing one engine instance.
pub struct Database {
    identity: InstanceIdentity,
    tables: RwLock<Tables>,
}

impl Database {
    #[must_use]
    pub fn new(identity: InstanceIdentity) -> Self {
        Self {
            identity,
            tables: RwLock::new(Tables::default()),
        }
    }

    // --- identity ---

    /// Fetch the current database id, minting one on first use. Creating a
    /// new current id demotes all others.
    pub fn get_or_create_current_database_id(&self) -> DatabaseId {
        let mut tables = self.tables.write();
        if let Some(current) = tables.database_ids.iter().find(|d| d.current) {
            return current.clone();
        }
        for row in &mut tables.database_ids {
            row.current = false;
        }
        let row = DatabaseId {
            id: random_uuid(),
            current: true,
            date_generated: now_millis(),
            initial_instance_id: String::new(),
        };
        tables.database_ids.push(row.clone());
        row
    }

    /// Fetch or create the instance row for this engine's identity tuple,
    /// demoting any other current instance.
    pub fn get_or_create_current_instance(&self) -> InstanceId {
        let database_id = self.get_or_create_current_database_id().id;
        let mut tables = self.tables.write();
        let mut candidate = InstanceId {
            id: String::new(),
            platform: self.identity.platform.clone(),
            hostname: self.identity.hostname.clone(),
            sysversion: self.identity.sysversion.clone(),
            node_id: self.identity.node_id.clone(),
            database_id,
            db_path: self.identity.db_path.clone(),
            system_id: self.identity.system_id.clone(),
            counter: 0,
            current: true,
        };
        candidate.id = candidate.calculate_id();

        for row in &mut tables.instances {
            row.current = row.id == candidate.id;
        }
        if let Some(existing) = tables.instances.iter().find(|i| i.id == candidate.id) {
            return existing.clone();
        }
        tables.instances.push(candidate.clone());
        candidate
    }

    /// Atomically increment and return the current instance. Every record
    /// serialized in one pass carries the returned (id, counter).
    pub fn current_instance_and_increment(&self) -> InstanceId {
        let current = self.get_or_create_current_instance();
        let mut tables = self.tables.write();
        let row = tables
            .instances
            .iter_mut()
            .find(|i| i.id == current.id)
            .expect("current instance row exists after get_or_create");
        row.counter += 1;
        row.clone()
    }

    // --- scope definitions and certificates ---

    pub fn save_scope_definition(&self, definition: ScopeDefinition) {
        self.tables
            .write()
            .scope_definitions
            .insert(definition.id.clone(), definition);
    }

    #[must_use]
    pub fn get_scope_definition(&self, id: &str) -> Option<ScopeDefinition> {
        self.tables.read().scope_definitions.get(id).cloned()
    }

    pub fn save_certificate(&self, certificate: Certificate) {
        let mut tables = self.tables.write();
        // keep a private key we already hold if the incoming copy lacks one
        let merged = match (
            certificate.private_key.is_none(),
            tables.certificates.get(&certificate.id),
        ) {
            (true, Some(existing)) if existing.private_key.is_some() => Certificate {
                private_key: existing.private_key.clone(),
                ..certificate
            },
            _ => certificate,
        };
        tables.certificates.insert(merged.id.clone(), merged);
    }

    #[must_use]
    pub fn get_certificate(&self, id: &str) -> Option<Certificate> {
        self.tables.read().certificates.get(id).cloned()
    }

    /// Walk up the tree from `id`, returning root-first ancestors.
    #[must_use]
    pub fn get_certificate_ancestors(&self, id: &str, include_self: bool) -> Vec<Certificate> {
        let tables = self.tables.read();
        let mut chain = Vec::new();
        let mut cursor = tables.certificates.get(id);
        while let Some(cert) = cursor {
            if include_self || cert.id != id {
                chain.push(cert.clone());
            }
            cursor = cert
                .parent_id
                .as_ref()
                .and_then(|pid| tables.certificates.get(pid));
        }
        chain.reverse();
        chain
    }

    /// Breadth-first descendants of `id`.
    #[must_use]
    pub fn get_certificate_descendants(&self, id: &str, include_self: bool) -> Vec<Certificate> {
        let tables = self.tables.read();
        let mut result = Vec::new();
        let mut frontier = vec![id.to_string()];
        if include_self {
            if let Some(cert) = tables.certificates.get(id) {
                result.push(cert.clone());
            }
        }
        while let Some(current) = frontier.pop() {
            for cert in tables.certificates.values() {
                if cert.parent_id.as_deref() == Some(current.as_str()) {
                    result.push(cert.clone());
                    frontier.push(cert.id.clone());
                }
            }
        }
        result
    }

    /// Certificates this peer owns (has the private key for), optionally
    /// narrowed by profile.
    #[must_use]
    pub fn owned_certificates(&self, profile: Option<&str>) -> Vec<Certificate> {
        self.tables
            .read()
            .certificates
            .values()
            .filter(|c| c.has_private_key())
            .filter(|c| profile.is_none_or(|p| c.profile == p))
            .cloned()
            .collect()
    }

    /// Validate and store one certificate whose parent (if any) is already
    /// saved.
    pub fn check_and_save_certificate(
        &self,
        certificate: Certificate,
    ) -> Result<Certificate, SyncError> {
        let parent = match certificate.parent_id.as_deref() {
            Some(parent_id) => Some(self.get_certificate(parent_id).ok_or_else(|| {
                SyncError::CertificateNotFound(parent_id.to_string())
            })?),
            None => None,
        };
        let scope_def = self
            .get_scope_definition(&certificate.scope_definition_id)
            .ok_or_else(|| {
                SyncError::ScopeDefinitionNotFound(certificate.scope_definition_id.clone())
            })?;
        let parent_def = match parent.as_ref() {
            Some(parent) => Some(
                self.get_scope_definition(&parent.scope_definition_id)
                    .ok_or_else(|| {
                        SyncError::ScopeDefinitionNotFound(parent.scope_definition_id.clone())
                    })?,
            ),
            None => None,
        };
        certificate.check_certificate(parent.as_ref(), &scope_def, parent_def.as_ref())?;
        self.save_certificate(certificate.clone());
        Ok(certificate)
    }

    /// Save a chain received from a peer: recurse up until hitting a cert we
    /// already hold (or the root), then validate and save downward.
    pub fn save_certificate_chain(
        &self,
        chain: &[SerializedCertificate],
        expected_last_id: Option<&str>,
    ) -> Result<Certificate, SyncError> {
        let last = chain
            .last()
            .ok_or_else(|| SyncError::Malformed("empty certificate chain".into()))?;
        let cert = Certificate::deserialize(&last.serialized, &last.signature)?;
        if cert.id != last.id {
            return Err(SyncError::Malformed(
                "chain entry id does not match its serialized data".into(),
            ));
        }
        if let Some(expected) = expected_last_id {
            if cert.id != expected {
                return Err(SyncError::Malformed(format!(
                    "expected chain to end at {expected}, got {}",
                    cert.id
                )));
            }
        }

        // already verified and saved, along with its ancestors
        if let Some(existing) = self.get_certificate(&cert.id) {
            return Ok(existing);
        }

        if chain.len() > 1 {
            self.save_certificate_chain(&chain[..chain.len() - 1], cert.parent_id.as_deref())?;
        } else if cert.parent_id.is_some() {
            return Err(SyncError::Malformed(
                "first cert in chain must be a root cert".into(),
            ));
        }

        self.check_and_save_certificate(cert)
    }

    // --- nonces and shared key ---

    /// Mint a single-use nonce.
    pub fn create_nonce(&self, ip: &str) -> Nonce {
        let nonce = Nonce {
            id: random_uuid(),
            timestamp: now_millis(),
            ip: ip.to_string(),
        };
        self.tables
            .write()
            .nonces
            .insert(nonce.id.clone(), nonce.clone());
        nonce
    }

    /// Consume a nonce: it must exist and be inside its TTL, and is deleted
    /// either way once looked at.
    pub fn use_nonce(&self, nonce_id: &str) -> Result<(), SyncError> {
        let mut tables = self.tables.write();
        let nonce = tables
            .nonces
            .remove(nonce_id)
            .ok_or(SyncError::NonceDoesNotExist)?;
        if nonce.is_expired(now_millis()) {
            return Err(SyncError::NonceExpired);
        }
        Ok(())
    }

    /// The server-wide key pair used for pushed client certificates.
    pub fn get_or_create_shared_key(&self) -> Result<PrivateKey, SyncError> {
        if let Some(key) = self.tables.read().shared_key.clone() {
            return Ok(key);
        }
        let key = PrivateKey::generate().map_err(morango_core::CertificateError::from)?;
        let mut tables = self.tables.write();
        Ok(tables.shared_key.get_or_insert(key).clone())
    }

    // --- store, rmc, dmc ---

    #[must_use]
    pub fn get_store_record(&self, id: &str) -> Option<StoreRecord> {
        self.tables.read().stores.get(id).cloned()
    }

    pub fn upsert_store_record(&self, record: StoreRecord) {
        self.tables
            .write()
            .stores
            .insert(record.id.clone(), record);
    }

    /// Store rows for a profile and model set, optionally partition-scoped.
    #[must_use]
    pub fn store_records_for_models(
        &self,
        profile: &str,
        model_names: &[&str],
        filter: Option<&Filter>,
    ) -> Vec<StoreRecord> {
        self.tables
            .read()
            .stores
            .values()
            .filter(|record| record.profile == profile)
            .filter(|record| model_names.contains(&record.model_name.as_str()))
            .filter(|record| filter.is_none_or(|f| f.contains_partition(&record.partition)))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_rmc(&self, store_id: &str, instance_id: &str) -> Option<i64> {
        self.tables
            .read()
            .rmcs
            .get(&(store_id.to_string(), instance_id.to_string()))
            .copied()
    }

    pub fn upsert_rmc(&self, store_id: &str, instance_id: &str, counter: i64) {
        self.tables
            .write()
            .rmcs
            .insert((store_id.to_string(), instance_id.to_string()), counter);
    }

    #[must_use]
    pub fn rmcs_for_store(&self, store_id: &str) -> Vec<RecordMaxCounter> {
        self.tables
            .read()
            .rmcs
            .range((store_id.to_string(), String::new())..)
            .take_while(|((sid, _), _)| sid == store_id)
            .map(|((sid, iid), counter)| RecordMaxCounter {
                store_id: sid.clone(),
                instance_id: iid.clone(),
                counter: *counter,
            })
            .collect()
    }

    /// Raise a database max counter; counters never decrease.
    pub fn raise_dmc(&self, instance_id: &str, partition: &str, counter: i64) {
        let mut tables = self.tables.write();
        let entry = tables
            .dmcs
            .entry((instance_id.to_string(), partition.to_string()))
            .or_insert(counter);
        if counter > *entry {
            *entry = counter;
        }
    }

    #[must_use]
    pub fn all_dmcs(&self) -> Vec<DatabaseMaxCounter> {
        self.tables
            .read()
            .dmcs
            .iter()
            .map(|((instance_id, partition), counter)| DatabaseMaxCounter {
                instance_id: instance_id.clone(),
                partition: partition.clone(),
                counter: *counter,
            })
            .collect()
    }

    /// The flat (v1) FSIC for a filter: for each instance, the minimum over
    /// filter partitions of the maximum counter among DMC rows whose
    /// partition prefixes that filter partition. Instances missing coverage
    /// for any filter partition are excluded.
    #[must_use]
    pub fn calculate_filter_max_counters(&self, filter: &Filter) -> InstanceCounters {
        let tables = self.tables.read();
        let mut per_instance: HashMap<String, Vec<i64>> = HashMap::new();
        for filter_partition in filter {
            let mut best: HashMap<&str, i64> = HashMap::new();
            for ((instance_id, partition), counter) in &tables.dmcs {
                if filter_partition.starts_with(partition.as_str()) {
                    let entry = best.entry(instance_id.as_str()).or_insert(*counter);
                    if *counter > *entry {
                        *entry = *counter;
                    }
                }
            }
            for (instance_id, counter) in best {
                per_instance
                    .entry(instance_id.to_string())
                    .or_default()
                    .push(counter);
            }
        }
        per_instance
            .into_iter()
            .filter(|(_, counters)| counters.len() == filter.len())
            .map(|(instance_id, counters)| {
                let minimum = counters.into_iter().min().unwrap_or(0);
                (instance_id, minimum)
            })
            .collect()
    }

    /// The nested (v2) FSIC for a filter: DMC rows at-or-below a filter
    /// partition land in `sub`, rows that are strict prefixes of one land in
    /// `super`, and redundant counters are pruned.
    #[must_use]
    pub fn calculate_fsic_v2(&self, filter: &Filter) -> FsicV2 {
        let tables = self.tables.read();
        let mut fsic = FsicV2::default();
        for ((instance_id, partition), counter) in &tables.dmcs {
            let below = filter.iter().any(|f| partition.starts_with(f.as_str()));
            let above = filter
                .iter()
                .any(|f| f.starts_with(partition.as_str()) && f != partition);
            if below {
                fsic.sub_partitions
                    .entry(partition.clone())
                    .or_default()
                    .insert(instance_id.clone(), *counter);
            } else if above {
                fsic.super_partitions
                    .entry(partition.clone())
                    .or_default()
                    .insert(instance_id.clone(), *counter);
            }
        }
        drop(tables);
        morango_core::fsic::remove_redundant_instance_counters(&mut fsic);
        fsic
    }

    // --- deleted model bookkeeping ---

    pub fn register_deleted(&self, id: &str, profile: &str) {
        self.tables
            .write()
            .deleted_models
            .insert(id.to_string(), profile.to_string());
    }

    pub fn register_hard_deleted(&self, id: &str, profile: &str) {
        self.tables
            .write()
            .hard_deleted_models
            .insert(id.to_string(), profile.to_string());
    }

    /// Drain the deleted-models set for a profile.
    pub fn take_deleted_ids(&self, profile: &str) -> Vec<String> {
        let mut tables = self.tables.write();
        let ids: Vec<String> = tables
            .deleted_models
            .iter()
            .filter(|(_, p)| p.as_str() == profile)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            tables.deleted_models.remove(id);
        }
        ids
    }

    /// Drain the hard-deleted-models set for a profile.
    pub fn take_hard_deleted_ids(&self, profile: &str) -> Vec<String> {
        let mut tables = self.tables.write();
        let ids: Vec<String> = tables
            .hard_deleted_models
            .iter()
            .filter(|(_, p)| p.as_str() == profile)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            tables.hard_deleted_models.remove(id);
        }
        ids
    }

    // --- app layer ---

    /// Save an app record. `dirty` overrides the record's dirty bit; `None`
    /// leaves it as provided.
    pub fn save_app_record(&self, mut record: AppRecord, dirty: Option<bool>) {
        if let Some(dirty) = dirty {
            record.dirty_bit = dirty;
        }
        self.tables
            .write()
            .app_records
            .insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn get_app_record(&self, id: &str) -> Option<AppRecord> {
        self.tables.read().app_records.get(id).cloned()
    }

    #[must_use]
    pub fn dirty_app_records(
        &self,
        profile: &str,
        model_name: &str,
        filter: Option<&Filter>,
    ) -> Vec<AppRecord> {
        self.tables
            .read()
            .app_records
            .values()
            .filter(|r| r.dirty_bit && r.profile == profile && r.model_name == model_name)
            .filter(|r| filter.is_none_or(|f| f.contains_partition(&r.partition)))
            .cloned()
            .collect()
    }

    pub fn clear_app_dirty_bits(&self, ids: &[String]) {
        let mut tables = self.tables.write();
        for id in ids {
            if let Some(record) = tables.app_records.get_mut(id) {
                record.dirty_bit = false;
            }
        }
    }

    /// Delete an app record, cascading to records that FK-reference it.
    /// Every removed id is registered as deleted; on a hard delete they are
    /// additionally registered as hard-deleted so payloads get purged.
    pub fn delete_app_record(
        &self,
        registry: &SyncableModelRegistry,
        id: &str,
        hard_delete: bool,
    ) {
        let mut to_delete = vec![id.to_string()];
        let mut collected: HashSet<String> = to_delete.iter().cloned().collect();
        // collect cascade closure over FK references
        while let Some(current) = to_delete.pop() {
            let tables = self.tables.read();
            let referencing: Vec<String> = tables
                .app_records
                .values()
                .filter(|record| {
                    registry
                        .get_model(&record.profile, &record.model_name)
                        .is_some_and(|descriptor| {
                            descriptor
                                .foreign_keys
                                .iter()
                                .any(|fk| record.fk_value(&fk.field) == Some(current.as_str()))
                        })
                })
                .map(|record| record.id.clone())
                .collect();
            drop(tables);
            for referencing_id in referencing {
                if collected.insert(referencing_id.clone()) {
                    to_delete.push(referencing_id);
                }
            }
        }

        let mut tables = self.tables.write();
        for delete_id in &collected {
            if let Some(record) = tables.app_records.remove(delete_id) {
                tables
                    .deleted_models
                    .insert(delete_id.clone(), record.profile.clone());
                if hard_delete {
                    tables
                        .hard_deleted_models
                        .insert(delete_id.clone(), record.profile);
                }
            }
        }
    }

    // --- sessions ---

    pub fn save_sync_session(&self, session: SyncSession) {
        self.tables
            .write()
            .sync_sessions
            .insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn get_sync_session(&self, id: &str) -> Option<SyncSession> {
        self.tables.read().sync_sessions.get(id).cloned()
    }

    #[must_use]
    pub fn active_sync_sessions(&self) -> Vec<SyncSession> {
        self.tables
            .read()
            .sync_sessions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    pub fn save_transfer_session(&self, session: TransferSession) {
        self.tables
            .write()
            .transfer_sessions
            .insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn get_transfer_session(&self, id: &str) -> Option<TransferSession> {
        self.tables.read().transfer_sessions.get(id).cloned()
    }

    #[must_use]
    pub fn transfer_sessions_for_sync(
        &self,
        sync_session_id: &str,
        active_only: bool,
    ) -> Vec<TransferSession> {
        self.tables
            .read()
            .transfer_sessions
            .values()
            .filter(|t| t.sync_session_id == sync_session_id)
            .filter(|t| !active_only || t.active)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn active_transfer_sessions(&self) -> Vec<TransferSession> {
        self.tables
            .read()
            .transfer_sessions
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    // --- buffers ---

    /// Insert buffer rows and their counters, replacing on the
    /// (transfer session, model uuid) uniqueness key.
    pub fn insert_buffers(
        &self,
        buffers: Vec<BufferRecord>,
        rmcbs: Vec<RecordMaxCounterBuffer>,
    ) {
        let mut tables = self.tables.write();
        for buffer in buffers {
            tables.buffers.insert(
                (buffer.transfer_session_id.clone(), buffer.model_uuid.clone()),
                buffer,
            );
        }
        for rmcb in rmcbs {
            tables.rmcbs.insert(
                (
                    rmcb.transfer_session_id.clone(),
                    rmcb.model_uuid.clone(),
                    rmcb.instance_id.clone(),
                ),
                rmcb.counter,
            );
        }
    }

    #[must_use]
    pub fn count_buffers(&self, transfer_session_id: &str) -> usize {
        self.tables
            .read()
            .buffers
            .keys()
            .filter(|(ts, _)| ts == transfer_session_id)
            .count()
    }

    /// A chunk of buffers in stable (model uuid) order, with their counters.
    #[must_use]
    pub fn buffers_chunk(
        &self,
        transfer_session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Vec<(BufferRecord, Vec<RecordMaxCounterBuffer>)> {
        let tables = self.tables.read();
        tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .skip(offset)
            .take(limit)
            .map(|((ts, model_uuid), buffer)| {
                let rmcbs = tables
                    .rmcbs
                    .iter()
                    .filter(|((rts, ruuid, _), _)| rts == ts && ruuid == model_uuid)
                    .map(|((rts, ruuid, instance), counter)| RecordMaxCounterBuffer {
                        instance_id: instance.clone(),
                        counter: *counter,
                        transfer_session_id: rts.clone(),
                        model_uuid: ruuid.clone(),
                    })
                    .collect();
                (buffer.clone(), rmcbs)
            })
            .collect()
    }

    /// Drop all buffer rows and counters for a transfer session.
    pub fn delete_buffers(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        tables.buffers.retain(|(ts, _), _| ts != transfer_session_id);
        tables.rmcbs.retain(|(ts, _, _), _| ts != transfer_session_id);
    }
}

/// True when the store row's latest save is covered by some RMCB of this
/// transfer session, i.e. the incoming version is a fast-forward.
fn is_fast_forward(tables: &Tables, transfer_session_id: &str, store: &StoreRecord) -> bool {
    tables
        .rmcbs
        .get(&(
            transfer_session_id.to_string(),
            store.id.clone(),
            store.last_saved_instance.clone(),
        ))
        .is_some_and(|counter| store.last_saved_counter <= *counter)
}

/// True when the store's RMC set dominates the buffered last-saved entry,
/// i.e. the local side already has everything the buffer carries.
fn is_reverse_fast_forward(tables: &Tables, buffer: &BufferRecord) -> bool {
    tables
        .rmcs
        .get(&(buffer.model_uuid.clone(), buffer.last_saved_instance.clone()))
        .is_some_and(|counter| buffer.last_saved_counter <= *counter)
}

impl StoreBackend for Database {
    fn queue_into_buffer(
        &self,
        session: &TransferSession,
        profile: &str,
        selection: &QueueSelection,
    ) -> usize {
        let filter = session.get_filter();
        let mut tables = self.tables.write();

        let queued: Vec<StoreRecord> = tables
            .stores
            .values()
            .filter(|record| record.profile == profile)
            .filter(|record| filter.contains_partition(&record.partition))
            .filter(|record| match selection {
                QueueSelection::V1(counters) => counters
                    .get(&record.last_saved_instance)
                    .is_some_and(|low| record.last_saved_counter > *low),
                QueueSelection::V2(partitions) => partitions.iter().any(|(part, counters)| {
                    record.partition.starts_with(part.as_str())
                        && counters
                            .get(&record.last_saved_instance)
                            .is_some_and(|low| record.last_saved_counter > *low)
                }),
            })
            .cloned()
            .collect();

        for record in &queued {
            tables.buffers.insert(
                (session.id.clone(), record.id.clone()),
                BufferRecord {
                    model_uuid: record.id.clone(),
                    profile: record.profile.clone(),
                    serialized: record.serialized.clone(),
                    deleted: record.deleted,
                    hard_deleted: record.hard_deleted,
                    last_saved_instance: record.last_saved_instance.clone(),
                    last_saved_counter: record.last_saved_counter,
                    partition: record.partition.clone(),
                    source_id: record.source_id.clone(),
                    model_name: record.model_name.clone(),
                    conflicting_serialized_data: record.conflicting_serialized_data.clone(),
                    self_ref_fk: record.self_ref_fk.clone(),
                    transfer_session_id: session.id.clone(),
                },
            );
            let counters: Vec<(String, i64)> = tables
                .rmcs
                .range((record.id.clone(), String::new())..)
                .take_while(|((sid, _), _)| *sid == record.id)
                .map(|((_, instance), counter)| (instance.clone(), *counter))
                .collect();
            for (instance, counter) in counters {
                tables
                    .rmcbs
                    .insert((session.id.clone(), record.id.clone(), instance), counter);
            }
        }

        queued.len()
    }

    fn dequeuing_delete_rmcb_records(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let dominated: HashSet<String> = tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .filter(|(_, buffer)| tables.stores.contains_key(&buffer.model_uuid))
            .filter(|(_, buffer)| is_reverse_fast_forward(&tables, buffer))
            .map(|(_, buffer)| buffer.model_uuid.clone())
            .collect();
        tables
            .rmcbs
            .retain(|(ts, model_uuid, _), _| {
                ts != transfer_session_id || !dominated.contains(model_uuid)
            });
    }

    fn dequeuing_delete_buffered_records(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let dominated: HashSet<String> = tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .filter(|(_, buffer)| tables.stores.contains_key(&buffer.model_uuid))
            .filter(|(_, buffer)| is_reverse_fast_forward(&tables, buffer))
            .map(|(_, buffer)| buffer.model_uuid.clone())
            .collect();
        tables
            .buffers
            .retain(|(ts, model_uuid), _| {
                ts != transfer_session_id || !dominated.contains(model_uuid)
            });
    }

    fn dequeuing_merge_conflict_buffer(&self, current: &InstanceId, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let conflicting: Vec<BufferRecord> = tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .filter_map(|(_, buffer)| {
                let store = tables.stores.get(&buffer.model_uuid)?;
                (!is_fast_forward(&tables, transfer_session_id, store)).then(|| buffer.clone())
            })
            .collect();

        for buffer in conflicting {
            let Some(store) = tables.stores.get_mut(&buffer.model_uuid) else {
                continue;
            };
            if buffer.hard_deleted {
                store.serialized = String::new();
                store.conflicting_serialized_data = String::new();
            } else {
                store.conflicting_serialized_data = format!(
                    "{}\n{}",
                    buffer.serialized, store.conflicting_serialized_data
                );
            }
            store.deleted = store.deleted || buffer.deleted;
            store.hard_deleted = store.hard_deleted || buffer.hard_deleted;
            store.last_saved_instance = current.id.clone();
            store.last_saved_counter = current.counter;
            store.dirty_bit = true;
            store.deserialization_error = String::new();
            store.last_transfer_session_id = Some(transfer_session_id.to_string());
        }
    }

    fn dequeuing_merge_conflict_rmcb(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let raises: Vec<(String, String, i64)> = tables
            .rmcbs
            .iter()
            .filter(|((ts, _, _), _)| ts == transfer_session_id)
            .filter_map(|((_, model_uuid, instance), counter)| {
                let store = tables.stores.get(model_uuid)?;
                tables
                    .buffers
                    .get(&(transfer_session_id.to_string(), model_uuid.clone()))?;
                let existing = tables
                    .rmcs
                    .get(&(model_uuid.clone(), instance.clone()))?;
                (*counter > *existing
                    && !is_fast_forward(&tables, transfer_session_id, store))
                .then(|| (model_uuid.clone(), instance.clone(), *counter))
            })
            .collect();
        for (model_uuid, instance, counter) in raises {
            tables.rmcs.insert((model_uuid, instance), counter);
        }
    }

    fn dequeuing_update_rmcs_last_saved_by(
        &self,
        current: &InstanceId,
        transfer_session_id: &str,
    ) {
        let mut tables = self.tables.write();
        let conflicting: Vec<String> = tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .filter_map(|(_, buffer)| {
                let store = tables.stores.get(&buffer.model_uuid)?;
                (!is_fast_forward(&tables, transfer_session_id, store))
                    .then(|| buffer.model_uuid.clone())
            })
            .collect();
        for model_uuid in conflicting {
            tables
                .rmcs
                .insert((model_uuid, current.id.clone()), current.counter);
        }
    }

    fn dequeuing_delete_mc_rmcb(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let absorbed: Vec<(String, String, String)> = tables
            .rmcbs
            .keys()
            .filter(|(ts, _, _)| ts == transfer_session_id)
            .filter(|(_, model_uuid, instance)| {
                let Some(store) = tables.stores.get(model_uuid) else {
                    return false;
                };
                tables
                    .rmcs
                    .contains_key(&(model_uuid.clone(), instance.clone()))
                    && !is_fast_forward(&tables, transfer_session_id, store)
            })
            .cloned()
            .collect();
        for key in absorbed {
            tables.rmcbs.remove(&key);
        }
    }

    fn dequeuing_delete_mc_buffer(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let absorbed: Vec<(String, String)> = tables
            .buffers
            .keys()
            .filter(|(ts, _)| ts == transfer_session_id)
            .filter(|(_, model_uuid)| {
                tables.stores.get(model_uuid).is_some_and(|store| {
                    !is_fast_forward(&tables, transfer_session_id, store)
                })
            })
            .cloned()
            .collect();
        for key in absorbed {
            tables.buffers.remove(&key);
        }
    }

    fn dequeuing_insert_remaining_buffer(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let remaining: Vec<BufferRecord> = tables
            .buffers
            .iter()
            .filter(|((ts, _), _)| ts == transfer_session_id)
            .map(|(_, buffer)| buffer.clone())
            .collect();
        for buffer in remaining {
            tables.stores.insert(
                buffer.model_uuid.clone(),
                StoreRecord {
                    id: buffer.model_uuid.clone(),
                    profile: buffer.profile,
                    serialized: buffer.serialized,
                    deleted: buffer.deleted,
                    hard_deleted: buffer.hard_deleted,
                    last_saved_instance: buffer.last_saved_instance,
                    last_saved_counter: buffer.last_saved_counter,
                    partition: buffer.partition,
                    source_id: buffer.source_id,
                    model_name: buffer.model_name,
                    conflicting_serialized_data: buffer.conflicting_serialized_data,
                    self_ref_fk: buffer.self_ref_fk,
                    dirty_bit: true,
                    deserialization_error: String::new(),
                    last_transfer_session_id: Some(transfer_session_id.to_string()),
                },
            );
        }
    }

    fn dequeuing_insert_remaining_rmcb(&self, transfer_session_id: &str) {
        let mut tables = self.tables.write();
        let remaining: Vec<(String, String, i64)> = tables
            .rmcbs
            .iter()
            .filter(|((ts, _, _), _)| ts == transfer_session_id)
            .map(|((_, model_uuid, instance), counter)| {
                (model_uuid.clone(), instance.clone(), *counter)
            })
            .collect();
        for (model_uuid, instance, counter) in remaining {
            tables.rmcs.insert((model_uuid, instance), counter);
        }
    }

    fn dequeuing_delete_remaining_rmcb(&self, transfer_session_id: &str) {
        self.tables
            .write()
            .rmcbs
            .retain(|(ts, _, _), _| ts != transfer_session_id);
    }

    fn dequeuing_delete_remaining_buffer(&self, transfer_session_id: &str) {
        self.tables
            .write()
            .buffers
            .retain(|(ts, _), _| ts != transfer_session_id);
    }

    fn bulk_insert_app_records(&self, records: Vec<AppRecord>) {
        let mut tables = self.tables.write();
        for record in records {
            tables.app_records.insert(record.id.clone(), record);
        }
    }

    fn lock_all_partitions(&self, _shared: bool) {
        // Single-writer table lock already serializes mutations.
    }

    fn lock_partition(&self, _partition: &str, _shared: bool) {
        // See lock_all_partitions.
    }
}
