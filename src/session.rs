//! Edit sessions
//!
//! A [`FormSession`] is the single owner of one entity's edit state. Callers
//! edit fields through [`FieldEdit`] and change item lists, identity and
//! submission through the session's methods; relation fetch results are
//! applied by the session itself. Store calls are the only suspension
//! points; failures come back as data.

use crate::config::{EngineConfig, ValidationMode};
use crate::relations::{
    differs, entity_label, RelationOption, RelationSynchronizer, SyncRequest, SyncResult,
};
use crate::schema::{AddPolicy, DeletePolicy, Schema, Section};
use crate::state::{
    self, add_blocked_message, first_error_summary, invalid_items, section_count_error,
    ErrorSummary, FieldPath, FieldValidation, FormMessage, FormState, Notice, NoticeKind,
    Notices, PredicateRegistry, StateUpdate,
};
use crate::stores::{Relation, RelationKey, Stores};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Field-level edits a renderer applies directly
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEdit {
    SetValue { path: String, value: Value },
    SetTouched { path: String, touched: bool },
}

impl FieldEdit {
    pub fn set_value(path: &str, value: Value) -> Self {
        FieldEdit::SetValue {
            path: path.to_string(),
            value,
        }
    }

    pub fn touch(path: &str) -> Self {
        FieldEdit::SetTouched {
            path: path.to_string(),
            touched: true,
        }
    }
}

impl From<FieldEdit> for FormMessage {
    fn from(edit: FieldEdit) -> Self {
        match edit {
            FieldEdit::SetValue { path, value } => FormMessage::SetValue { path, value },
            FieldEdit::SetTouched { path, touched } => FormMessage::SetTouched { path, touched },
        }
    }
}

/// An entity offered by a selection flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionCandidate {
    pub id: String,
    pub label: String,
}

/// Result of asking to add an item to a repeating section
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddItemOutcome {
    /// An inline item was appended at `index`
    Added { index: usize },
    /// The add was refused; nothing changed
    Blocked { message: String },
    /// The renderer should open a creation flow for the target type and
    /// report back through [`FormSession::complete_create_flow`]
    OpenCreateFlow { target_schema_id: String },
    /// The renderer should open a selection flow over existing targets and
    /// report back through [`FormSession::complete_selection`]
    OpenSelectFlow {
        target_schema_id: String,
        exclude_ids: Vec<String>,
        allow_create: bool,
    },
}

/// Outcome of a store-backed operation.
///
/// `success` with an `error` means the operation progressed but a
/// secondary step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// Outcome of linking several selected entities at once
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub created: Vec<Relation>,
    /// `(target entity id, reason)` per link that was not created
    pub failures: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Persisted identity after the submit, if any
    pub entity_id: Option<String>,
}

/// One entity's edit session
#[derive(Debug)]
pub struct FormSession {
    schema: Arc<Schema>,
    state: FormState,
    stores: Stores,
    predicates: PredicateRegistry,
    config: EngineConfig,
    entity_id: Option<String>,
    notices: Notices,
    /// Live relation counts fetched during this session
    relation_counts: HashMap<String, usize>,
    next_generation: u64,
    /// Results issued before this generation belong to an earlier entity
    generation_floor: u64,
    applied_generations: HashMap<String, u64>,
    refresh_counter: u64,
}

impl FormSession {
    /// Start a session for a new (`entity_id == None`) or persisted entity
    pub fn new(
        schema: Schema,
        initial_values: Map<String, Value>,
        entity_id: Option<String>,
        stores: Stores,
        config: EngineConfig,
    ) -> Self {
        let state = FormState::new(&schema, initial_values);
        let notices = Notices::new(config.notice_ttl());
        tracing::debug!(
            "Created session for schema {} (entity {:?})",
            schema.id,
            entity_id
        );
        Self {
            schema: Arc::new(schema),
            state,
            stores,
            predicates: PredicateRegistry::new(),
            config,
            entity_id,
            notices,
            relation_counts: HashMap::new(),
            next_generation: 0,
            generation_floor: 0,
            applied_generations: HashMap::new(),
            refresh_counter: 0,
        }
    }

    pub fn with_predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn state(&self) -> &FormState {
        &self.state
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    /// Whether the parent entity can own relations yet
    pub fn has_persisted_identity(&self) -> bool {
        self.entity_id.is_some()
    }

    pub fn refresh_counter(&self) -> u64 {
        self.refresh_counter
    }

    /// Notices still showing; transient ones disappear once their delay passes
    pub fn notices(&self) -> Vec<&Notice> {
        self.notices.active()
    }

    pub fn notices_at(&self, now: Instant) -> Vec<&Notice> {
        self.notices.active_at(now)
    }

    pub fn dismiss_notice(&mut self, id: u64) -> bool {
        self.notices.dismiss(id)
    }

    /// Clear notices whose delay has passed
    pub fn prune_notices(&mut self, now: Instant) {
        self.notices.prune(now);
    }

    pub fn first_error(&self) -> Option<ErrorSummary> {
        first_error_summary(&self.schema, &self.state)
    }

    fn apply(&mut self, update: impl Into<StateUpdate>) {
        let current = self.state.clone();
        self.state = state::apply_update(&self.schema, current, update.into());
    }

    /// Apply a field edit, then run single-field validation when the
    /// configured mode asks for it.
    ///
    /// Item lists go through [`add_item`](Self::add_item) and
    /// [`remove_item`](Self::remove_item), a fresh start through
    /// [`reset`](Self::reset).
    pub fn dispatch(&mut self, edit: FieldEdit) {
        let revalidate = match (&edit, self.config.validation_mode()) {
            (FieldEdit::SetValue { path, .. }, mode) => {
                let key = FieldPath::canonical(path);
                (mode == ValidationMode::OnChange || self.state.errors.contains_key(&key))
                    .then_some(key)
            }
            (FieldEdit::SetTouched { path, touched: true }, ValidationMode::OnBlur) => {
                Some(FieldPath::canonical(path))
            }
            _ => None,
        };

        self.apply(FormMessage::from(edit));

        if let Some(path) = revalidate {
            self.validate_field(&path);
        }
    }

    /// Validate one addressed field and record the result
    pub fn validate_field(&mut self, path: &str) -> Option<FieldValidation> {
        let (result, next) =
            state::validate_field(&self.schema, &self.predicates, self.state.clone(), path);
        self.state = next;
        result
    }

    /// Validate the whole form.
    ///
    /// Relation-backed sections are counted against the live relation list,
    /// fetched when this session has no count cached yet.
    pub async fn validate_all(&mut self) -> bool {
        self.load_relation_counts().await;
        let (is_valid, next) = state::validate_all(
            &self.schema,
            &self.predicates,
            self.state.clone(),
            self.has_persisted_identity(),
            &self.relation_counts,
        );
        self.state = next;
        tracing::debug!("validate_all: valid={is_valid}, errors={}", self.state.errors.len());
        is_valid
    }

    async fn load_relation_counts(&mut self) {
        let schema = Arc::clone(&self.schema);
        for section in schema.relation_sections() {
            if self.relation_counts.contains_key(&section.id) {
                continue;
            }
            let Some(key) = self.relation_key(section) else {
                continue;
            };
            match self.synchronizer().count(&key).await {
                Ok(count) => {
                    self.relation_counts.insert(section.id.clone(), count);
                }
                Err(e) => {
                    tracing::warn!(
                        "Could not count relations for {}, using displayed list: {e}",
                        section.id
                    );
                }
            }
        }
    }

    fn relation_key(&self, section: &Section) -> Option<RelationKey> {
        let relation = section.relation()?;
        let entity_id = self.entity_id.clone()?;
        Some(RelationKey {
            source_schema_id: self.schema.id.clone(),
            source_entity_id: entity_id,
            relation_type_id: relation.relation_type_id.clone(),
            target_schema_id: relation.target_schema_id.clone(),
        })
    }

    /// Best known item count of a section
    fn known_count(&self, section: &Section) -> usize {
        if section.is_relation_backed() {
            if let Some(count) = self.relation_counts.get(&section.id) {
                return *count;
            }
        }
        self.state.item_count(&section.id)
    }

    /// Recompute a section's count error if one is currently shown
    fn refresh_section_count(&mut self, section: &Section) {
        if !self.state.errors.contains_key(&section.id) {
            return;
        }
        let error = section_count_error(
            section,
            self.known_count(section),
            self.has_persisted_identity(),
        );
        self.apply(StateUpdate::SetError {
            path: section.id.clone(),
            error,
        });
    }

    fn block_add(&mut self, message: String) -> AddItemOutcome {
        tracing::info!("Add refused: {message}");
        self.notices.push(NoticeKind::AddBlocked, message.clone());
        AddItemOutcome::Blocked { message }
    }

    fn relation_failure(&mut self, message: String) -> OperationOutcome {
        tracing::warn!("{message}");
        self.notices.push(NoticeKind::RelationError, message.clone());
        OperationOutcome::failed(message)
    }

    fn max_items_message(section: &Section, max: usize) -> String {
        format!(
            "{} allows at most {max} item{}",
            section.display_label(),
            if max == 1 { "" } else { "s" }
        )
    }

    /// Add an item to a repeating section.
    ///
    /// Inline sections append directly once every existing item is valid
    /// and the upper bound leaves room. Relation-backed sections need a
    /// persisted parent and hand off to a creation or selection flow.
    pub async fn add_item(&mut self, section_id: &str) -> AddItemOutcome {
        let schema = Arc::clone(&self.schema);
        let Some(section) = schema.section(section_id).filter(|s| s.is_repeating) else {
            return self.block_add(format!("{section_id} is not a repeating section"));
        };

        if section.is_relation_backed() {
            self.begin_relation_add(section).await
        } else {
            self.add_inline_item(section)
        }
    }

    fn add_inline_item(&mut self, section: &Section) -> AddItemOutcome {
        let invalid = invalid_items(&self.schema, &self.predicates, &self.state.values, section);
        if !invalid.is_empty() {
            for item in &invalid {
                for (path, _, message) in &item.failures {
                    self.apply(StateUpdate::SetError {
                        path: path.clone(),
                        error: Some(message.clone()),
                    });
                }
            }
            let message =
                add_blocked_message(section, &invalid, self.config.max_reported_offenders());
            return self.block_add(message);
        }

        let count = self.state.item_count(&section.id);
        if let Some(max) = section.max_items() {
            if count >= max {
                return self.block_add(Self::max_items_message(section, max));
            }
        }

        self.apply(FormMessage::AddItem {
            section: section.id.clone(),
        });
        self.refresh_section_count(section);
        AddItemOutcome::Added { index: count }
    }

    async fn live_count(&mut self, section: &Section) -> usize {
        if let Some(count) = self.relation_counts.get(&section.id) {
            return *count;
        }
        if let Some(key) = self.relation_key(section) {
            match self.synchronizer().count(&key).await {
                Ok(count) => {
                    self.relation_counts.insert(section.id.clone(), count);
                    return count;
                }
                Err(e) => tracing::warn!("Could not count relations for {}: {e}", section.id),
            }
        }
        self.state.item_count(&section.id)
    }

    async fn begin_relation_add(&mut self, section: &Section) -> AddItemOutcome {
        let Some(relation) = section.relation() else {
            return self.block_add(format!("{} is not relation-backed", section.id));
        };
        let Some(key) = self.relation_key(section) else {
            let owner = self.schema.label.as_deref().unwrap_or("this record");
            return self.block_add(format!(
                "Save {owner} before adding {}",
                section.display_label()
            ));
        };

        if let Some(max) = section.max_items() {
            if self.live_count(section).await >= max {
                return self.block_add(Self::max_items_message(section, max));
            }
        }

        if !relation.add_policy.allows_selection() {
            return AddItemOutcome::OpenCreateFlow {
                target_schema_id: relation.target_schema_id.clone(),
            };
        }

        let exclude_ids = if relation.is_unique {
            self.linked_target_ids(section, &key).await
        } else {
            Vec::new()
        };
        AddItemOutcome::OpenSelectFlow {
            target_schema_id: relation.target_schema_id.clone(),
            exclude_ids,
            allow_create: relation.add_policy == AddPolicy::CanSelectExisting,
        }
    }

    /// Target ids currently linked, from the store when reachable
    async fn linked_target_ids(&self, section: &Section, key: &RelationKey) -> Vec<String> {
        match self.stores.relations.list(key).await {
            Ok(relations) => relations.into_iter().map(|r| r.target_entity_id).collect(),
            Err(e) => {
                tracing::warn!("Could not list relations for {}, using displayed list: {e}", section.id);
                self.state
                    .items(&section.id)
                    .iter()
                    .filter_map(|item| item.get("id")?.as_str().map(str::to_string))
                    .collect()
            }
        }
    }

    /// Entities a selection flow may offer for a relation-backed section.
    ///
    /// Already linked entities are left out when the relation is unique.
    pub async fn selection_candidates(
        &self,
        section_id: &str,
    ) -> anyhow::Result<Vec<SelectionCandidate>> {
        let section = self
            .relation_section(section_id)
            .ok_or_else(|| anyhow::anyhow!("{section_id} is not relation-backed"))?;
        let Some(relation) = section.relation() else {
            return Ok(Vec::new());
        };

        let excluded: HashSet<String> = match self.relation_key(&section) {
            Some(key) if relation.is_unique => self
                .linked_target_ids(&section, &key)
                .await
                .into_iter()
                .collect(),
            _ => HashSet::new(),
        };
        let target_schema = self
            .stores
            .schemas
            .get(&relation.target_schema_id)
            .await
            .ok();
        let entities = self
            .stores
            .entities
            .list(&relation.target_schema_id)
            .await?;

        Ok(entities
            .into_iter()
            .filter(|e| !excluded.contains(&e.id))
            .map(|e| SelectionCandidate {
                label: entity_label(&e, target_schema.as_ref()),
                id: e.id,
            })
            .collect())
    }

    /// Displayed relation entry at `index`, if that slot holds one
    fn displayed_option(&self, section_id: &str, index: usize) -> Option<RelationOption> {
        let item = self.state.items(section_id).get(index)?;
        serde_json::from_value(item.clone()).ok()
    }

    fn relation_section(&self, section_id: &str) -> Option<Section> {
        self.schema
            .section(section_id)
            .filter(|s| s.is_relation_backed())
            .cloned()
    }

    /// Link a freshly created target entity to the parent
    pub async fn complete_create_flow(
        &mut self,
        section_id: &str,
        target_entity_id: &str,
    ) -> OperationOutcome {
        let Some(section) = self.relation_section(section_id) else {
            return OperationOutcome::failed(format!("{section_id} is not relation-backed"));
        };
        let Some(key) = self.relation_key(&section) else {
            return self.relation_failure(format!(
                "Cannot link {}: the record has not been saved",
                section.display_label()
            ));
        };

        match self.stores.relations.create(&key, target_entity_id).await {
            Ok(relation) => {
                tracing::info!("Linked {} via relation {}", target_entity_id, relation.id);
                self.request_refresh();
                self.sync_section(section_id).await
            }
            Err(e) => self.relation_failure(format!(
                "Could not link {}: {e}",
                section.display_label()
            )),
        }
    }

    /// Create a target entity, then link it to the parent
    pub async fn create_related_entity(
        &mut self,
        section_id: &str,
        data: Map<String, Value>,
    ) -> OperationOutcome {
        let Some(section) = self.relation_section(section_id) else {
            return OperationOutcome::failed(format!("{section_id} is not relation-backed"));
        };
        let Some(relation) = section.relation() else {
            return OperationOutcome::failed(format!("{section_id} is not relation-backed"));
        };
        if !self.has_persisted_identity() {
            return self.relation_failure(format!(
                "Cannot add {}: the record has not been saved",
                section.display_label()
            ));
        }

        match self
            .stores
            .entities
            .create(&relation.target_schema_id, data)
            .await
        {
            Ok(entity) => self.complete_create_flow(section_id, &entity.id).await,
            Err(e) => self.relation_failure(format!(
                "Could not create {} entry: {e}",
                section.display_label()
            )),
        }
    }

    /// Link every selected entity in one batch.
    ///
    /// Links that fail are reported, links that succeed are kept. Selections
    /// beyond the section's upper bound are not linked.
    pub async fn complete_selection(
        &mut self,
        section_id: &str,
        target_ids: Vec<String>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let Some(section) = self.relation_section(section_id) else {
            outcome.failures = target_ids
                .into_iter()
                .map(|id| (id, format!("{section_id} is not relation-backed")))
                .collect();
            return outcome;
        };
        let Some(key) = self.relation_key(&section) else {
            let reason = "the record has not been saved".to_string();
            outcome.failures = target_ids.into_iter().map(|id| (id, reason.clone())).collect();
            return outcome;
        };
        let is_unique = section.relation().is_some_and(|r| r.is_unique);

        let mut seen: HashSet<String> = if is_unique {
            self.linked_target_ids(&section, &key).await.into_iter().collect()
        } else {
            HashSet::new()
        };
        let mut selected = Vec::new();
        for id in target_ids {
            if is_unique && !seen.insert(id.clone()) {
                outcome.failures.push((id, "already linked".to_string()));
            } else {
                selected.push(id);
            }
        }

        if let Some(max) = section.max_items() {
            let room = max.saturating_sub(self.live_count(&section).await);
            if selected.len() > room {
                let reason = Self::max_items_message(&section, max);
                for id in selected.split_off(room) {
                    outcome.failures.push((id, reason.clone()));
                }
            }
        }

        let creates = selected
            .iter()
            .map(|id| self.stores.relations.create(&key, id));
        let results = join_all(creates).await;

        for (id, result) in selected.into_iter().zip(results) {
            match result {
                Ok(relation) => outcome.created.push(relation),
                Err(e) => {
                    tracing::warn!("Could not link {id} to {}: {e}", section.id);
                    outcome.failures.push((id, e.to_string()));
                }
            }
        }

        if !outcome.failures.is_empty() {
            let message = format!(
                "{} of {} {} selections could not be linked",
                outcome.failures.len(),
                outcome.failures.len() + outcome.created.len(),
                section.display_label()
            );
            tracing::warn!("{message}");
            self.notices.push(NoticeKind::RelationError, message);
        }
        if !outcome.created.is_empty() {
            self.request_refresh();
            self.sync_section(section_id).await;
        }
        outcome
    }

    /// Remove an item from a repeating section.
    ///
    /// Inline items are spliced out. For relation-backed sections the
    /// relation record is deleted, and with `itemAndRelation` the target
    /// entity too; a failed entity delete after a successful relation
    /// delete still refreshes and is reported in the outcome.
    pub async fn remove_item(&mut self, section_id: &str, index: usize) -> OperationOutcome {
        let schema = Arc::clone(&self.schema);
        let Some(section) = schema.section(section_id).filter(|s| s.is_repeating) else {
            return OperationOutcome::failed(format!("{section_id} is not a repeating section"));
        };
        if index >= self.state.item_count(section_id) {
            return OperationOutcome::failed(format!("{section_id} has no item {index}"));
        }

        let Some(relation) = section.relation() else {
            self.apply(FormMessage::RemoveItem {
                section: section_id.to_string(),
                index,
            });
            self.refresh_section_count(section);
            return OperationOutcome::ok();
        };

        let Some(option) = self.displayed_option(section_id, index) else {
            return OperationOutcome::failed(format!(
                "{section_id} item {index} is not linked through a relation"
            ));
        };

        if let Err(e) = self.stores.relations.delete(&option.relation_id).await {
            return self.relation_failure(format!("Could not remove {}: {e}", option.label));
        }
        tracing::info!("Deleted relation {} from {}", option.relation_id, section_id);

        let mut outcome = OperationOutcome::ok();
        if relation.delete_policy == DeletePolicy::ItemAndRelation {
            if let Err(e) = self
                .stores
                .entities
                .delete(&relation.target_schema_id, &option.id)
                .await
            {
                let message = format!("{} was unlinked but could not be deleted: {e}", option.label);
                tracing::warn!("{message}");
                self.notices.push(NoticeKind::RelationError, message.clone());
                outcome.error = Some(message);
            }
        }

        self.request_refresh();
        let synced = self.sync_section(section_id).await;
        if outcome.error.is_none() {
            outcome.error = synced.error;
        }
        outcome
    }

    /// Signal that related items changed; cached counts are dropped
    pub fn request_refresh(&mut self) {
        self.refresh_counter += 1;
        self.relation_counts.clear();
    }

    pub fn synchronizer(&self) -> RelationSynchronizer {
        RelationSynchronizer::new(self.stores.clone())
    }

    /// Issue a fetch request for a relation-backed section.
    /// `None` until the parent entity has an identity.
    pub fn begin_sync(&mut self, section_id: &str) -> Option<SyncRequest> {
        let section = self.relation_section(section_id)?;
        let key = self.relation_key(&section)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        Some(SyncRequest {
            section_id: section_id.to_string(),
            key,
            generation,
        })
    }

    /// Apply a finished fetch. Returns true when the displayed list changed.
    ///
    /// Results older than the newest one applied for the section are
    /// dropped, as are results issued before the last reset.
    pub fn apply_sync(&mut self, result: SyncResult) -> bool {
        if result.generation < self.generation_floor {
            tracing::debug!("Dropping sync result from before reset for {}", result.section_id);
            return false;
        }
        if let Some(applied) = self.applied_generations.get(&result.section_id) {
            if *applied > result.generation {
                tracing::debug!(
                    "Dropping stale sync result {} for {} (applied {applied})",
                    result.generation,
                    result.section_id
                );
                return false;
            }
        }
        self.applied_generations
            .insert(result.section_id.clone(), result.generation);
        self.relation_counts
            .insert(result.section_id.clone(), result.live_count());

        let items = result.to_values();
        if !differs(self.state.values.get(&result.section_id), &items) {
            return false;
        }
        self.apply(StateUpdate::ApplyRelationSync {
            section: result.section_id.clone(),
            items,
        });
        if let Some(section) = self.relation_section(&result.section_id) {
            self.refresh_section_count(&section);
        }
        true
    }

    /// Fetch and apply one relation-backed section
    pub async fn sync_section(&mut self, section_id: &str) -> OperationOutcome {
        let Some(request) = self.begin_sync(section_id) else {
            tracing::debug!("Skipping sync of {section_id}: no relation or no identity yet");
            return OperationOutcome::ok();
        };
        match self.synchronizer().fetch(request).await {
            Ok(result) => {
                self.apply_sync(result);
                OperationOutcome::ok()
            }
            Err(e) => self.relation_failure(format!("Could not load {section_id}: {e}")),
        }
    }

    /// Fetch every relation-backed section concurrently, then apply each
    pub async fn sync_relations(&mut self) -> OperationOutcome {
        let section_ids: Vec<String> = self
            .schema
            .relation_sections()
            .map(|s| s.id.clone())
            .collect();
        let requests: Vec<SyncRequest> = section_ids
            .iter()
            .filter_map(|id| self.begin_sync(id))
            .collect();
        if requests.is_empty() {
            return OperationOutcome::ok();
        }

        let synchronizer = self.synchronizer();
        let fetches = requests.into_iter().map(|request| {
            let section_id = request.section_id.clone();
            let synchronizer = &synchronizer;
            async move { (section_id, synchronizer.fetch(request).await) }
        });
        let results = join_all(fetches).await;

        let mut outcome = OperationOutcome::ok();
        for (section_id, result) in results {
            match result {
                Ok(result) => {
                    self.apply_sync(result);
                }
                Err(e) => {
                    outcome = self.relation_failure(format!("Could not load {section_id}: {e}"));
                }
            }
        }
        outcome
    }

    /// The parent entity has been persisted; load its relations
    pub async fn set_entity_id(&mut self, entity_id: String) -> OperationOutcome {
        tracing::info!("Session entity identity is now {entity_id}");
        self.entity_id = Some(entity_id);
        self.relation_counts.clear();
        self.sync_relations().await
    }

    /// Replace the session's state, e.g. when switching entities
    pub fn reset(&mut self, values: Map<String, Value>, entity_id: Option<String>) {
        self.apply(FormMessage::Reset { values });
        self.entity_id = entity_id;
        self.relation_counts.clear();
        self.applied_generations.clear();
        self.generation_floor = self.next_generation;
        self.notices.clear();
    }

    /// Validate everything, then hand the values to `on_submit`.
    ///
    /// The callback may return the entity id assigned by a first save; the
    /// session adopts it and loads relations. A failing callback leaves the
    /// values in place and records the error at form level.
    pub async fn submit<F, Fut>(&mut self, on_submit: F) -> SubmitOutcome
    where
        F: FnOnce(Map<String, Value>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<String>>>,
    {
        if self.state.is_submitting {
            return SubmitOutcome {
                success: false,
                error: Some("A submission is already in progress".to_string()),
                entity_id: self.entity_id.clone(),
            };
        }
        self.apply(StateUpdate::SetSubmitting(true));
        self.apply(StateUpdate::SetSubmitError(None));

        if !self.validate_all().await {
            self.apply(StateUpdate::SetSubmitting(false));
            let error = self
                .first_error()
                .map(|e| format!("{}: {}", e.label, e.message))
                .unwrap_or_else(|| "The form has errors".to_string());
            return SubmitOutcome {
                success: false,
                error: Some(error),
                entity_id: self.entity_id.clone(),
            };
        }

        match on_submit(self.state.values.clone()).await {
            Ok(saved_id) => {
                let values = self.state.values.clone();
                self.apply(FormMessage::Reset { values });
                if let Some(id) = saved_id {
                    if self.entity_id.as_deref() != Some(id.as_str()) {
                        self.set_entity_id(id).await;
                    }
                }
                SubmitOutcome {
                    success: true,
                    error: None,
                    entity_id: self.entity_id.clone(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Submit failed: {message}");
                self.apply(StateUpdate::SetSubmitError(Some(message.clone())));
                self.apply(StateUpdate::SetSubmitting(false));
                SubmitOutcome {
                    success: false,
                    error: Some(message),
                    entity_id: self.entity_id.clone(),
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, RelationDescriptor, RepeatingConfig};
    use crate::stores::{
        Entity, MemoryStore, MockEntityStore, MockRelationStore, MockSchemaStore,
    };
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn contacts(add_policy: AddPolicy, delete_policy: DeletePolicy) -> RelationDescriptor {
        RelationDescriptor {
            target_schema_id: "contact".to_string(),
            relation_type_id: "vendor-contact".to_string(),
            add_policy,
            delete_policy,
            is_unique: true,
            min_items: Some(1),
            max_items: None,
        }
    }

    fn vendor_schema(relation: RelationDescriptor) -> Schema {
        let mut schema = Schema::new(
            "vendor",
            vec![
                Section::single("general", vec![Field::text("name").required()]),
                Section::repeating(
                    "lineItems",
                    vec![Field::text("sku").required().with_label("SKU")],
                    RepeatingConfig {
                        max_items: Some(3),
                        ..Default::default()
                    },
                )
                .with_label("Line items"),
                Section::related("contacts", relation).with_label("Contacts"),
            ],
        );
        schema.label = Some("Vendor".to_string());
        schema
    }

    fn schema() -> Schema {
        vendor_schema(contacts(AddPolicy::CanSelectExisting, DeletePolicy::RelationOnly))
    }

    fn key() -> RelationKey {
        RelationKey {
            source_schema_id: "vendor".to_string(),
            source_entity_id: "v1".to_string(),
            relation_type_id: "vendor-contact".to_string(),
            target_schema_id: "contact".to_string(),
        }
    }

    fn values(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn memory_session(
        schema: Schema,
        initial: Value,
        entity_id: Option<&str>,
        store: MemoryStore,
    ) -> FormSession {
        FormSession::new(
            schema,
            values(initial),
            entity_id.map(str::to_string),
            Stores::from_shared(Arc::new(store)),
            EngineConfig::default(),
        )
    }

    fn relation(id: &str, target: &str) -> Relation {
        Relation {
            id: id.to_string(),
            source_schema_id: "vendor".to_string(),
            source_entity_id: "v1".to_string(),
            target_schema_id: "contact".to_string(),
            target_entity_id: target.to_string(),
            relation_type_id: "vendor-contact".to_string(),
            created_at: None,
        }
    }

    fn contact(id: &str, name: &str) -> Entity {
        Entity {
            id: id.to_string(),
            schema_id: "contact".to_string(),
            data: values(json!({ "name": name })),
            updated_at: None,
        }
    }

    fn option_result(section: &str, generation: u64, options: &[(&str, &str)]) -> SyncResult {
        SyncResult {
            section_id: section.to_string(),
            generation,
            relations: options
                .iter()
                .map(|(id, _)| relation(&format!("r-{id}"), id))
                .collect(),
            options: options
                .iter()
                .map(|(id, label)| RelationOption {
                    id: id.to_string(),
                    label: label.to_string(),
                    relation_id: format!("r-{id}"),
                })
                .collect(),
        }
    }

    mod validation {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_relation_min_skipped_until_persisted() {
            let mut session = memory_session(
                schema(),
                json!({"name": "Acme"}),
                None,
                MemoryStore::new(),
            );
            assert!(session.validate_all().await);
            assert_eq!(session.state().error("contacts"), None);
        }

        #[tokio::test]
        async fn test_relation_min_enforced_for_saved_entity() {
            let mut session = memory_session(
                schema(),
                json!({"name": "Acme"}),
                Some("v1"),
                MemoryStore::new(),
            );
            assert!(!session.validate_all().await);
            assert_eq!(
                session.state().error("contacts"),
                Some("Contacts requires at least 1 item")
            );
        }

        #[tokio::test]
        async fn test_live_count_satisfies_min() {
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_relation(&key(), "c1");
            let mut session = memory_session(schema(), json!({"name": "Acme"}), Some("v1"), store);
            // Display list not yet synced; the live relation still counts
            assert!(session.validate_all().await);
        }

        #[tokio::test]
        async fn test_first_error_follows_schema_order() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": ""}]}),
                None,
                MemoryStore::new(),
            );
            assert!(!session.validate_all().await);
            let first = session.first_error().unwrap();
            assert_eq!(first.path, "name");
        }

        #[test]
        fn test_on_submit_mode_does_not_validate_on_change() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            session.dispatch(FieldEdit::SetValue {
                path: "name".to_string(),
                value: json!(""),
            });
            assert_eq!(session.state().error("name"), None);
            assert!(session.state().dirty);
        }

        #[test]
        fn test_existing_error_is_revalidated_on_change() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            session.validate_field("name");
            assert_eq!(session.state().error("name"), Some("name is required"));

            session.dispatch(FieldEdit::SetValue {
                path: "name".to_string(),
                value: json!("Acme"),
            });
            assert_eq!(session.state().error("name"), None);
            assert!(session.state().is_valid);
        }

        #[test]
        fn test_on_change_mode_validates_each_write() {
            let config = EngineConfig {
                validation_mode: Some(ValidationMode::OnChange),
                ..Default::default()
            };
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                None,
                Stores::from_shared(Arc::new(MemoryStore::new())),
                config,
            );
            session.dispatch(FieldEdit::SetValue {
                path: "lineItems[0].sku".to_string(),
                value: json!(""),
            });
            assert_eq!(session.state().error("lineItems[0].sku"), Some("SKU is required"));
        }

        #[test]
        fn test_padded_index_reports_under_normal_key() {
            let config = EngineConfig {
                validation_mode: Some(ValidationMode::OnChange),
                ..Default::default()
            };
            let mut session = FormSession::new(
                schema(),
                values(json!({"lineItems": [{"sku": "A"}]})),
                None,
                Stores::from_shared(Arc::new(MemoryStore::new())),
                config,
            );
            session.dispatch(FieldEdit::set_value("lineItems[00].sku", json!("")));
            assert_eq!(session.state().error("lineItems[0].sku"), Some("SKU is required"));
            assert!(session.state().errors.contains_key("lineItems[0].sku"));
            assert!(!session.state().errors.contains_key("lineItems[00].sku"));

            session.dispatch(FieldEdit::set_value("lineItems[0].sku", json!("B")));
            assert!(session.state().errors.is_empty());
        }

        #[test]
        fn test_on_blur_mode_validates_when_touched() {
            let config = EngineConfig {
                validation_mode: Some(ValidationMode::OnBlur),
                ..Default::default()
            };
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                None,
                Stores::from_shared(Arc::new(MemoryStore::new())),
                config,
            );
            session.dispatch(FieldEdit::SetValue {
                path: "name".to_string(),
                value: json!(""),
            });
            assert_eq!(session.state().error("name"), None);
            session.dispatch(FieldEdit::SetTouched {
                path: "name".to_string(),
                touched: true,
            });
            assert_eq!(session.state().error("name"), Some("name is required"));
        }
    }

    mod inline_items {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_add_appends_item_with_identity() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": "A-1"}]}),
                None,
                MemoryStore::new(),
            );
            let outcome = session.add_item("lineItems").await;
            assert_eq!(outcome, AddItemOutcome::Added { index: 1 });
            assert_eq!(session.state().item_count("lineItems"), 2);
            assert!(session.state().dirty);
            let added = &session.state().items("lineItems")[1];
            assert!(added.get("_id").is_some());
            assert_eq!(added.get("sku"), Some(&json!("")));
        }

        #[tokio::test]
        async fn test_add_blocked_by_invalid_item() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": "A-1"}, {"sku": ""}]}),
                None,
                MemoryStore::new(),
            );
            let outcome = session.add_item("lineItems").await;

            assert_eq!(
                outcome,
                AddItemOutcome::Blocked {
                    message: "Complete the existing Line items entries before adding another: item 2 (SKU)"
                        .to_string()
                }
            );
            assert_eq!(session.state().item_count("lineItems"), 2);
            assert!(!session.state().dirty);
            assert_eq!(session.state().error("lineItems[1].sku"), Some("SKU is required"));
            assert_eq!(session.notices().len(), 1);
            assert_eq!(session.notices()[0].kind, NoticeKind::AddBlocked);
        }

        #[tokio::test]
        async fn test_add_rejected_at_max_items() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": "A"}, {"sku": "B"}, {"sku": "C"}]}),
                None,
                MemoryStore::new(),
            );
            let outcome = session.add_item("lineItems").await;
            assert_eq!(
                outcome,
                AddItemOutcome::Blocked {
                    message: "Line items allows at most 3 items".to_string()
                }
            );
            assert_eq!(session.state().item_count("lineItems"), 3);
            assert!(!session.state().dirty);
        }

        #[tokio::test]
        async fn test_full_section_ignores_whole_list_write() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": "A"}, {"sku": "B"}, {"sku": "C"}]}),
                None,
                MemoryStore::new(),
            );
            session.dispatch(FieldEdit::set_value(
                "lineItems",
                json!([{"sku": "A"}, {"sku": "B"}, {"sku": "C"}, {"sku": "D"}]),
            ));
            assert_eq!(session.state().item_count("lineItems"), 3);
            assert!(!session.state().dirty);

            let outcome = session.add_item("lineItems").await;
            assert!(matches!(outcome, AddItemOutcome::Blocked { .. }));
            assert_eq!(session.state().item_count("lineItems"), 3);
        }

        #[tokio::test]
        async fn test_blocked_add_notice_expires_without_prune() {
            let config = EngineConfig {
                notice_ttl_ms: Some(60_000),
                ..Default::default()
            };
            let mut session = FormSession::new(
                schema(),
                values(json!({"lineItems": [{"sku": ""}]})),
                None,
                Stores::from_shared(Arc::new(MemoryStore::new())),
                config,
            );
            session.add_item("lineItems").await;

            assert_eq!(session.notices().len(), 1);
            let later = Instant::now() + Duration::from_secs(61);
            assert!(session.notices_at(later).is_empty());
            assert_eq!(session.notices().len(), 1);
        }

        #[tokio::test]
        async fn test_remove_shifts_errors() {
            let mut session = memory_session(
                schema(),
                json!({"lineItems": [{"sku": ""}, {"sku": "B"}, {"sku": ""}]}),
                None,
                MemoryStore::new(),
            );
            session.validate_all().await;
            assert!(session.state().error("lineItems[2].sku").is_some());

            let outcome = session.remove_item("lineItems", 0).await;
            assert_eq!(outcome, OperationOutcome::ok());
            assert_eq!(session.state().item_count("lineItems"), 2);
            assert_eq!(session.state().error("lineItems[0].sku"), None);
            assert_eq!(session.state().error("lineItems[1].sku"), Some("SKU is required"));
        }

        #[tokio::test]
        async fn test_remove_out_of_range_fails() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            let outcome = session.remove_item("lineItems", 0).await;
            assert!(!outcome.success);
            assert!(!session.state().dirty);
        }
    }

    mod relation_items {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_add_without_identity_is_blocked() {
            let mut session = memory_session(
                vendor_schema(contacts(AddPolicy::AddOnly, DeletePolicy::RelationOnly)),
                json!({}),
                None,
                MemoryStore::new(),
            );
            let outcome = session.add_item("contacts").await;
            assert_eq!(
                outcome,
                AddItemOutcome::Blocked {
                    message: "Save Vendor before adding Contacts".to_string()
                }
            );
            assert!(!session.state().dirty);
        }

        #[tokio::test]
        async fn test_add_only_opens_create_flow() {
            let mut session = memory_session(
                vendor_schema(contacts(AddPolicy::AddOnly, DeletePolicy::RelationOnly)),
                json!({}),
                Some("v1"),
                MemoryStore::new(),
            );
            assert_eq!(
                session.add_item("contacts").await,
                AddItemOutcome::OpenCreateFlow {
                    target_schema_id: "contact".to_string()
                }
            );
        }

        #[tokio::test]
        async fn test_unique_selection_excludes_linked() {
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_relation(&key(), "c1");
            let mut session = memory_session(
                vendor_schema(contacts(
                    AddPolicy::MustSelectExisting,
                    DeletePolicy::RelationOnly,
                )),
                json!({}),
                Some("v1"),
                store,
            );
            assert_eq!(
                session.add_item("contacts").await,
                AddItemOutcome::OpenSelectFlow {
                    target_schema_id: "contact".to_string(),
                    exclude_ids: vec!["c1".to_string()],
                    allow_create: false,
                }
            );
        }

        #[tokio::test]
        async fn test_max_items_checked_against_live_count() {
            let mut relation = contacts(AddPolicy::CanSelectExisting, DeletePolicy::RelationOnly);
            relation.max_items = Some(1);
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_relation(&key(), "c1");
            let mut session =
                memory_session(vendor_schema(relation), json!({}), Some("v1"), store);
            assert_eq!(
                session.add_item("contacts").await,
                AddItemOutcome::Blocked {
                    message: "Contacts allows at most 1 item".to_string()
                }
            );
        }

        #[tokio::test]
        async fn test_create_flow_links_and_syncs() {
            let store = Arc::new(
                MemoryStore::new().with_entity("contact", "c1", json!({"name": "Ann"})),
            );
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                Some("v1".to_string()),
                Stores::from_shared(store.clone()),
                EngineConfig::default(),
            );

            let outcome = session.complete_create_flow("contacts", "c1").await;
            assert_eq!(outcome, OperationOutcome::ok());
            assert_eq!(store.relation_count().await, 1);
            assert_eq!(session.refresh_counter(), 1);
            let items = session.state().items("contacts");
            assert_eq!(items.len(), 1);
            assert_eq!(items[0]["label"], json!("Ann"));
            assert!(!session.state().dirty);
        }

        #[tokio::test]
        async fn test_create_related_entity_persists_target() {
            let store = Arc::new(MemoryStore::new());
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                Some("v1".to_string()),
                Stores::from_shared(store.clone()),
                EngineConfig::default(),
            );
            let outcome = session
                .create_related_entity("contacts", values(json!({"name": "Bo"})))
                .await;
            assert!(outcome.success);
            assert_eq!(store.relation_count().await, 1);
            assert_eq!(session.state().items("contacts")[0]["label"], json!("Bo"));
        }

        #[tokio::test]
        async fn test_batch_links_survivors_and_reports_failures() {
            let mut relations = MockRelationStore::new();
            relations.expect_list().returning(|_| Ok(Vec::new()));
            relations.expect_create().returning(|_, target| {
                if target == "c2" {
                    Err(anyhow!("conflict"))
                } else {
                    Ok(relation(&format!("r-{target}"), target))
                }
            });
            let mut schemas = MockSchemaStore::new();
            schemas.expect_get().returning(|_| Err(anyhow!("offline")));
            let stores = Stores::new(
                Arc::new(relations),
                Arc::new(MockEntityStore::new()),
                Arc::new(schemas),
            );
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                Some("v1".to_string()),
                stores,
                EngineConfig::default(),
            );

            let outcome = session
                .complete_selection(
                    "contacts",
                    vec!["c1".to_string(), "c2".to_string(), "c3".to_string()],
                )
                .await;

            assert_eq!(outcome.created.len(), 2);
            assert_eq!(outcome.failures.len(), 1);
            assert_eq!(outcome.failures[0].0, "c2");
            assert!(!outcome.is_complete());
            assert_eq!(session.refresh_counter(), 1);
            assert_eq!(session.notices()[0].kind, NoticeKind::RelationError);
        }

        #[tokio::test]
        async fn test_batch_over_capacity_links_remaining_room() {
            let mut relation = contacts(AddPolicy::CanSelectExisting, DeletePolicy::RelationOnly);
            relation.max_items = Some(2);
            let store = Arc::new(
                MemoryStore::new()
                    .with_entity("contact", "c1", json!({"name": "Ann"}))
                    .with_entity("contact", "c2", json!({"name": "Bo"}))
                    .with_entity("contact", "c3", json!({"name": "Cy"}))
                    .with_relation(&key(), "c1"),
            );
            let mut session = FormSession::new(
                vendor_schema(relation),
                Map::new(),
                Some("v1".to_string()),
                Stores::from_shared(store.clone()),
                EngineConfig::default(),
            );

            let outcome = session
                .complete_selection("contacts", vec!["c2".to_string(), "c3".to_string()])
                .await;
            assert_eq!(outcome.created.len(), 1);
            assert_eq!(outcome.failures, vec![(
                "c3".to_string(),
                "Contacts allows at most 2 items".to_string()
            )]);
            assert_eq!(store.relation_count().await, 2);
        }

        #[tokio::test]
        async fn test_entity_delete_failure_still_refreshes() {
            let deleted = Arc::new(AtomicBool::new(false));

            let mut relations = MockRelationStore::new();
            let listed = deleted.clone();
            relations.expect_list().returning(move |_| {
                if listed.load(Ordering::SeqCst) {
                    Ok(Vec::new())
                } else {
                    Ok(vec![relation("r1", "c1")])
                }
            });
            let flag = deleted.clone();
            relations.expect_delete().times(1).returning(move |id| {
                assert_eq!(id, "r1");
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

            let mut entities = MockEntityStore::new();
            entities.expect_get().returning(|_, id| Ok(contact(id, "Ann")));
            entities
                .expect_delete()
                .times(1)
                .returning(|_, _| Err(anyhow!("permission denied")));

            let mut schemas = MockSchemaStore::new();
            schemas.expect_get().returning(|_| Err(anyhow!("offline")));

            let mut session = FormSession::new(
                vendor_schema(contacts(
                    AddPolicy::CanSelectExisting,
                    DeletePolicy::ItemAndRelation,
                )),
                Map::new(),
                Some("v1".to_string()),
                Stores::new(Arc::new(relations), Arc::new(entities), Arc::new(schemas)),
                EngineConfig::default(),
            );
            session.sync_relations().await;
            assert_eq!(session.state().item_count("contacts"), 1);

            let outcome = session.remove_item("contacts", 0).await;
            assert!(outcome.success);
            assert!(outcome
                .error
                .as_deref()
                .is_some_and(|e| e.contains("could not be deleted")));
            assert_eq!(session.refresh_counter(), 1);
            assert_eq!(session.state().item_count("contacts"), 0);
        }

        #[tokio::test]
        async fn test_relation_delete_failure_keeps_item() {
            let mut relations = MockRelationStore::new();
            relations
                .expect_list()
                .returning(|_| Ok(vec![relation("r1", "c1")]));
            relations
                .expect_delete()
                .returning(|_| Err(anyhow!("timeout")));
            let mut entities = MockEntityStore::new();
            entities.expect_get().returning(|_, id| Ok(contact(id, "Ann")));
            let mut schemas = MockSchemaStore::new();
            schemas.expect_get().returning(|_| Err(anyhow!("offline")));

            let mut session = FormSession::new(
                schema(),
                Map::new(),
                Some("v1".to_string()),
                Stores::new(Arc::new(relations), Arc::new(entities), Arc::new(schemas)),
                EngineConfig::default(),
            );
            session.sync_relations().await;

            let outcome = session.remove_item("contacts", 0).await;
            assert!(!outcome.success);
            assert_eq!(session.refresh_counter(), 0);
            assert_eq!(session.state().item_count("contacts"), 1);
            assert_eq!(session.notices()[0].kind, NoticeKind::RelationError);
        }

        #[tokio::test]
        async fn test_remove_refuses_slot_without_relation() {
            let store = Arc::new(
                MemoryStore::new()
                    .with_entity("contact", "c1", json!({"name": "Ann"}))
                    .with_relation(&key(), "c1"),
            );
            let mut session = FormSession::new(
                schema(),
                values(json!({"contacts": [
                    {"id": "c0", "label": "Old"},
                    {"id": "c1", "label": "Ann", "relationId": "r-unknown"}
                ]})),
                Some("v1".to_string()),
                Stores::from_shared(store.clone()),
                EngineConfig::default(),
            );

            let outcome = session.remove_item("contacts", 0).await;
            assert!(!outcome.success);
            assert_eq!(
                outcome.error.as_deref(),
                Some("contacts item 0 is not linked through a relation")
            );
            assert_eq!(store.relation_count().await, 1);
            assert_eq!(session.state().item_count("contacts"), 2);
        }

        #[tokio::test]
        async fn test_selection_candidates_skip_linked_for_unique() {
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_entity("contact", "c2", json!({"name": "Bob"}))
                .with_relation(&key(), "c1");
            let session = memory_session(schema(), json!({}), Some("v1"), store);

            let candidates = session.selection_candidates("contacts").await.unwrap();
            assert_eq!(
                candidates,
                vec![SelectionCandidate {
                    id: "c2".to_string(),
                    label: "Bob".to_string(),
                }]
            );
            assert!(session.selection_candidates("lineItems").await.is_err());
        }

        #[test]
        fn test_direct_writes_to_relation_section_are_ignored() {
            let mut session =
                memory_session(schema(), json!({}), Some("v1"), MemoryStore::new());
            session.dispatch(FieldEdit::SetValue {
                path: "contacts[0].label".to_string(),
                value: json!("x"),
            });
            assert_eq!(session.state().item_count("contacts"), 0);
            assert!(!session.state().dirty);
        }
    }

    mod sync {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_no_request_without_identity() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            assert_eq!(session.begin_sync("contacts"), None);
            assert_eq!(session.begin_sync("lineItems"), None);
        }

        #[test]
        fn test_stale_result_is_dropped() {
            let mut session =
                memory_session(schema(), json!({}), Some("v1"), MemoryStore::new());
            let older = session.begin_sync("contacts").unwrap();
            let newer = session.begin_sync("contacts").unwrap();
            assert!(newer.generation > older.generation);

            assert!(session.apply_sync(option_result("contacts", newer.generation, &[("c2", "Bo")])));
            assert!(!session.apply_sync(option_result("contacts", older.generation, &[("c1", "Ann")])));

            let items = session.state().items("contacts");
            assert_eq!(items.len(), 1);
            assert_eq!(items[0]["id"], json!("c2"));
        }

        #[test]
        fn test_result_from_before_reset_is_dropped() {
            let mut session =
                memory_session(schema(), json!({}), Some("v1"), MemoryStore::new());
            let request = session.begin_sync("contacts").unwrap();
            session.reset(Map::new(), Some("v2".to_string()));
            assert!(!session.apply_sync(option_result("contacts", request.generation, &[("c1", "Ann")])));
            assert_eq!(session.state().item_count("contacts"), 0);
        }

        #[test]
        fn test_unchanged_result_is_not_written() {
            let mut session =
                memory_session(schema(), json!({}), Some("v1"), MemoryStore::new());
            let first = session.begin_sync("contacts").unwrap();
            assert!(session.apply_sync(option_result("contacts", first.generation, &[("c1", "Ann")])));
            let second = session.begin_sync("contacts").unwrap();
            assert!(!session.apply_sync(option_result("contacts", second.generation, &[("c1", "Ann")])));
            assert!(!session.state().dirty);
        }

        #[tokio::test]
        async fn test_sync_is_idempotent_over_store() {
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_relation(&key(), "c1");
            let mut session = memory_session(schema(), json!({}), Some("v1"), store);

            let synchronizer = session.synchronizer();
            let request = session.begin_sync("contacts").unwrap();
            let result = synchronizer.fetch(request).await.unwrap();
            assert!(session.apply_sync(result));
            let snapshot = session.state().clone();

            let request = session.begin_sync("contacts").unwrap();
            let result = synchronizer.fetch(request).await.unwrap();
            assert!(!session.apply_sync(result));
            assert_eq!(session.state(), &snapshot);
        }

        #[tokio::test]
        async fn test_set_entity_id_loads_relations() {
            let store = MemoryStore::new()
                .with_entity("contact", "c1", json!({"name": "Ann"}))
                .with_relation(&key(), "c1");
            let mut session = memory_session(schema(), json!({}), None, store);
            assert_eq!(session.state().item_count("contacts"), 0);

            let outcome = session.set_entity_id("v1".to_string()).await;
            assert!(outcome.success);
            assert_eq!(session.entity_id(), Some("v1"));
            assert_eq!(session.state().item_count("contacts"), 1);
        }

        #[tokio::test]
        async fn test_listing_failure_becomes_notice() {
            let mut relations = MockRelationStore::new();
            relations
                .expect_list()
                .returning(|_| Err(anyhow!("connection refused")));
            let mut session = FormSession::new(
                schema(),
                Map::new(),
                Some("v1".to_string()),
                Stores::new(
                    Arc::new(relations),
                    Arc::new(MockEntityStore::new()),
                    Arc::new(MockSchemaStore::new()),
                ),
                EngineConfig::default(),
            );
            let outcome = session.sync_section("contacts").await;
            assert!(!outcome.success);
            assert_eq!(session.notices().len(), 1);

            let id = session.notices()[0].id;
            assert!(session.dismiss_notice(id));
            assert!(session.notices().is_empty());
        }
    }

    mod submitting {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn test_invalid_form_does_not_call_back() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            let called = AtomicBool::new(false);
            let outcome = session
                .submit(|_| async {
                    called.store(true, Ordering::SeqCst);
                    Ok(None)
                })
                .await;
            assert!(!outcome.success);
            assert_eq!(outcome.error.as_deref(), Some("name: name is required"));
            assert!(!called.load(Ordering::SeqCst));
            assert!(!session.state().is_submitting);
        }

        #[tokio::test]
        async fn test_first_save_adopts_new_identity() {
            let mut session =
                memory_session(schema(), json!({}), None, MemoryStore::new());
            session.dispatch(FieldEdit::SetValue {
                path: "name".to_string(),
                value: json!("Acme"),
            });
            assert!(session.state().dirty);

            let outcome = session
                .submit(|values| async move {
                    assert_eq!(values["name"], json!("Acme"));
                    Ok(Some("v9".to_string()))
                })
                .await;

            assert_eq!(
                outcome,
                SubmitOutcome {
                    success: true,
                    error: None,
                    entity_id: Some("v9".to_string()),
                }
            );
            assert_eq!(session.entity_id(), Some("v9"));
            assert!(!session.state().dirty);
            assert!(!session.state().is_submitting);
            assert_eq!(session.state().value("name"), Some(&json!("Acme")));
        }

        #[tokio::test]
        async fn test_failed_callback_keeps_values() {
            let mut session =
                memory_session(schema(), json!({"name": "Acme"}), None, MemoryStore::new());
            session.dispatch(FieldEdit::SetValue {
                path: "name".to_string(),
                value: json!("Acme Ltd"),
            });
            let outcome = session
                .submit(|_| async { Err(anyhow!("server unavailable")) })
                .await;

            assert!(!outcome.success);
            assert_eq!(
                session.state().submit_error.as_deref(),
                Some("server unavailable")
            );
            assert_eq!(session.state().value("name"), Some(&json!("Acme Ltd")));
            assert!(session.state().dirty);
            assert!(!session.state().is_submitting);
        }

        #[tokio::test]
        async fn test_second_submit_while_submitting_is_refused() {
            let mut session =
                memory_session(schema(), json!({"name": "Acme"}), None, MemoryStore::new());
            session.apply(StateUpdate::SetSubmitting(true));
            let outcome = session.submit(|_| async { Ok(None) }).await;
            assert!(!outcome.success);
            assert!(session.state().is_submitting);
        }
    }
}
