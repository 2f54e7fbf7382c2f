//! The app <-> store projections.
//!
//! [`serialize_into_store`] drains dirty app rows into the store, stamping
//! them with the freshly incremented instance counter and folding concurrent
//! store-side edits into the conflict log. [`deserialize_from_store`] walks
//! the other way, rehydrating dirty store rows into app rows in foreign-key
//! dependency order, with a wave algorithm for self-referential models.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use morango_core::filter::Filter;
use morango_core::records::StoreRecord;

use crate::registry::{ModelDescriptor, SyncableModelRegistry};
use crate::store::{AppRecord, Database, StoreBackend};

/// Serialize dirty app rows into the store for one profile.
///
/// Runs as one pass under a single incremented instance counter: every row
/// touched carries the same `(instance, counter)`. Deleted and hard-deleted
/// model sets are drained into store flags, and the database max counters
/// are raised for each filter partition (or the empty partition when no
/// filter is given).
pub fn serialize_into_store(
    db: &Arc<Database>,
    registry: &SyncableModelRegistry,
    profile: &str,
    filter: Option<&Filter>,
) {
    let current = db.current_instance_and_increment();
    if let Some(filter) = filter {
        for partition in filter {
            db.lock_partition(partition, false);
        }
    } else {
        db.lock_all_partitions(false);
    }

    for descriptor in registry.get_models(profile) {
        let dirty = db.dirty_app_records(profile, &descriptor.model_name, filter);
        let mut processed: Vec<String> = Vec::with_capacity(dirty.len());
        for app_record in dirty {
            match db.get_store_record(&app_record.id) {
                Some(mut store) => {
                    // both sides dirty: the store's pending version becomes
                    // conflict history before the app fields overwrite it
                    if store.dirty_bit {
                        store.conflicting_serialized_data = format!(
                            "{}\n{}",
                            store.serialized, store.conflicting_serialized_data
                        );
                        store.dirty_bit = false;
                    }

                    // merge app fields into the store payload, preserving
                    // unknown keys written by peers with newer schemas
                    let mut merged: Map<String, Value> =
                        serde_json::from_str(&store.serialized).unwrap_or_default();
                    for (key, value) in &app_record.fields {
                        merged.insert(key.clone(), value.clone());
                    }
                    store.serialized = Value::Object(merged).to_string();

                    db.upsert_rmc(&store.id, &current.id, current.counter);
                    store.last_saved_instance = current.id.clone();
                    store.last_saved_counter = current.counter;
                    store.deleted = false;
                    store.hard_deleted = false;
                    store.last_transfer_session_id = None;
                    db.upsert_store_record(store);
                }
                None => {
                    let self_ref_fk = descriptor
                        .self_ref_field
                        .as_deref()
                        .and_then(|field| app_record.fk_value(field))
                        .unwrap_or_default()
                        .to_string();
                    db.upsert_store_record(StoreRecord {
                        id: app_record.id.clone(),
                        profile: app_record.profile.clone(),
                        serialized: Value::Object(app_record.fields.clone()).to_string(),
                        deleted: false,
                        hard_deleted: false,
                        last_saved_instance: current.id.clone(),
                        last_saved_counter: current.counter,
                        partition: app_record.partition.clone(),
                        source_id: app_record.source_id.clone(),
                        model_name: app_record.model_name.clone(),
                        conflicting_serialized_data: String::new(),
                        self_ref_fk,
                        dirty_bit: false,
                        deserialization_error: String::new(),
                        last_transfer_session_id: None,
                    });
                    db.upsert_rmc(&app_record.id, &current.id, current.counter);
                }
            }
            processed.push(app_record.id);
        }
        db.clear_app_dirty_bits(&processed);
    }

    // deleted models become store tombstones carrying this pass's counter
    for id in db.take_deleted_ids(profile) {
        if let Some(mut store) = db.get_store_record(&id) {
            store.dirty_bit = false;
            store.deleted = true;
            store.last_saved_instance = current.id.clone();
            store.last_saved_counter = current.counter;
            db.upsert_store_record(store);
            db.upsert_rmc(&id, &current.id, current.counter);
        }
    }

    // hard deletions additionally purge payloads
    for id in db.take_hard_deleted_ids(profile) {
        if let Some(mut store) = db.get_store_record(&id) {
            store.hard_deleted = true;
            store.serialized = "{}".to_string();
            store.conflicting_serialized_data = String::new();
            db.upsert_store_record(store);
        }
    }

    match filter {
        None => db.raise_dmc(&current.id, "", current.counter),
        Some(filter) => {
            for partition in filter {
                db.raise_dmc(&current.id, partition, current.counter);
            }
        }
    }
    debug!(profile, counter = current.counter, "serialized into store");
}

/// The outcome of rehydrating one store row.
enum Rehydrated {
    /// Row produced an app record to save.
    Saved(AppRecord),
    /// Row was a deletion (or became one through FK propagation).
    Deleted,
}

fn rehydrate_record(
    db: &Arc<Database>,
    registry: &SyncableModelRegistry,
    descriptor: &ModelDescriptor,
    store: &StoreRecord,
) -> Result<Rehydrated, String> {
    if store.deleted {
        db.delete_app_record(registry, &store.id, store.hard_deleted);
        return Ok(Rehydrated::Deleted);
    }

    let fields: Map<String, Value> = serde_json::from_str(&store.serialized)
        .map_err(|e| format!("invalid serialized payload: {e}"))?;
    let app_record = AppRecord {
        id: store.id.clone(),
        profile: store.profile.clone(),
        model_name: store.model_name.clone(),
        partition: store.partition.clone(),
        source_id: store.source_id.clone(),
        fields,
        dirty_bit: false,
    };

    // validate FK references against the app layer
    let mut missing: Vec<(String, String)> = Vec::new();
    for fk in &descriptor.foreign_keys {
        if let Some(target_id) = app_record.fk_value(&fk.field) {
            if !target_id.is_empty() && db.get_app_record(target_id).is_none() {
                missing.push((fk.field.clone(), target_id.to_string()));
            }
        }
    }

    if missing.is_empty() {
        return Ok(Rehydrated::Saved(app_record));
    }

    // probe the store for deleted FK targets to propagate the deletion
    for (_, target_id) in &missing {
        if let Some(target_store) = db.get_store_record(target_id) {
            if target_store.deleted {
                if target_store.hard_deleted {
                    db.register_hard_deleted(&store.id, &store.profile);
                }
                db.register_deleted(&store.id, &store.profile);
                return Ok(Rehydrated::Deleted);
            }
        }
    }

    let (field, target_id) = &missing[0];
    Err(format!(
        "related model {target_id} for field {field} does not exist"
    ))
}

fn mark_store_clean(db: &Arc<Database>, id: &str) {
    if let Some(mut store) = db.get_store_record(id) {
        store.dirty_bit = false;
        store.deserialization_error = String::new();
        db.upsert_store_record(store);
    }
}

fn mark_store_error(db: &Arc<Database>, id: &str, error: &str) {
    if let Some(mut store) = db.get_store_record(id) {
        store.deserialization_error = error.to_string();
        db.upsert_store_record(store);
    }
}

/// Deserialize dirty store rows into the app layer for one profile.
///
/// Models are visited in FK dependency order; a row that fails validation
/// keeps its dirty bit and records a human-readable error, without failing
/// the pass. Self-referential models are processed in waves so children are
/// only rehydrated once their parent row is clean.
pub fn deserialize_from_store(
    db: &Arc<Database>,
    registry: &SyncableModelRegistry,
    profile: &str,
    filter: Option<&Filter>,
) {
    for descriptor in registry.get_models(profile) {
        let model_names = [descriptor.model_name.as_str()];
        if descriptor.self_ref_field.is_some() {
            deserialize_self_referential(db, registry, descriptor, &model_names, profile, filter);
        } else {
            let mut to_insert = Vec::new();
            let records = db.store_records_for_models(profile, &model_names, filter);
            for store in records.iter().filter(|r| r.dirty_bit) {
                match rehydrate_record(db, registry, descriptor, store) {
                    Ok(Rehydrated::Saved(app_record)) => {
                        to_insert.push(app_record);
                        mark_store_clean(db, &store.id);
                    }
                    Ok(Rehydrated::Deleted) => mark_store_clean(db, &store.id),
                    Err(error) => {
                        warn!(model = %store.model_name, id = %store.id, %error,
                            "validation error during deserialization");
                        mark_store_error(db, &store.id, &error);
                    }
                }
            }
            db.bulk_insert_app_records(to_insert);
        }
    }
}

fn deserialize_self_referential(
    db: &Arc<Database>,
    registry: &SyncableModelRegistry,
    descriptor: &ModelDescriptor,
    model_names: &[&str],
    profile: &str,
    filter: Option<&Filter>,
) {
    let mut excluded: HashSet<String> = HashSet::new();
    let mut clean_parents: HashSet<String> = db
        .store_records_for_models(profile, model_names, filter)
        .into_iter()
        .filter(|r| !r.dirty_bit)
        .map(|r| r.id)
        .collect();

    // children whose parent is clean (or who have no parent) go first;
    // each wave unlocks the next layer of the tree
    loop {
        let wave: Vec<StoreRecord> = db
            .store_records_for_models(profile, model_names, filter)
            .into_iter()
            .filter(|r| r.dirty_bit && !excluded.contains(&r.id))
            .filter(|r| r.self_ref_fk.is_empty() || clean_parents.contains(&r.self_ref_fk))
            .collect();
        if wave.is_empty() {
            break;
        }
        for store in wave {
            match rehydrate_record(db, registry, descriptor, &store) {
                Ok(Rehydrated::Saved(app_record)) => {
                    db.save_app_record(app_record, Some(false));
                    mark_store_clean(db, &store.id);
                    clean_parents.insert(store.id.clone());
                }
                Ok(Rehydrated::Deleted) => {
                    mark_store_clean(db, &store.id);
                    clean_parents.insert(store.id.clone());
                }
                Err(error) => {
                    warn!(model = %store.model_name, id = %store.id, %error,
                        "validation error during deserialization");
                    mark_store_error(db, &store.id, &error);
                    excluded.insert(store.id.clone());
                }
            }
        }
    }

    // anything still dirty is blocked on its parent; say why
    let remaining = db.store_records_for_models(profile, model_names, filter);
    let all_ids: HashSet<&str> = remaining.iter().map(|r| r.id.as_str()).collect();
    let dirty_ids: HashSet<&str> = remaining
        .iter()
        .filter(|r| r.dirty_bit)
        .map(|r| r.id.as_str())
        .collect();
    for store in remaining
        .iter()
        .filter(|r| r.dirty_bit && !excluded.contains(&r.id) && !r.self_ref_fk.is_empty())
    {
        if dirty_ids.contains(store.self_ref_fk.as_str()) {
            mark_store_error(db, &store.id, "Parent is dirty; could not deserialize.");
        } else if !all_ids.contains(store.self_ref_fk.as_str()) {
            mark_store_error(
                db,
                &store.id,
                "Parent does not exist in Store; could not deserialize.",
            );
        }
    }
}
