//! Sync sessions.

use crate::config::TransportConfig;
use crate::error::{RestCacheError, Result};
use crate::http::{HttpClient, ReqwestClient};
use crate::planner::{Filters, QueryEntry, QueryPlanner};
use crate::schema::{SchemaDiff, reconcile};
use crate::service::{FieldSpec, GeometryKind, ServiceModel};
use crate::store::{ColumnKind, LayerDefinition, RowWriter, SpatialStore};
use crate::transform::{GeometryError, RemoteRecord, transform};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

/// Geometry column of layers created by `create_destination`.
pub const DEFAULT_GEOMETRY_COLUMN: &str = "shape";

/// Progress of a sync run, logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    SchemaChecked,
    Syncing,
    Committed,
    Aborted,
}

/// Per-call sync settings.
#[derive(Clone, Debug, Default)]
pub struct SyncOptions {
    pub filters: Filters,
    /// Keep existing rows instead of replacing them.
    pub append: bool,
    /// Destination-only fields, ignored when comparing schemas. Only used when
    /// the session was built without user fields.
    pub user_fields: Vec<String>,
    /// Service fields that are not copied. Only used when the session was
    /// built without excluded fields; when empty too, the list the destination
    /// was created with applies.
    pub exclude_fields: Vec<String>,
    /// Checked before every page request.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filters(mut self, filters: impl Into<Filters>) -> Self {
        self.filters = filters.into();
        self
    }

    #[must_use]
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    #[must_use]
    pub fn with_user_fields(mut self, user_fields: Vec<String>) -> Self {
        self.user_fields = user_fields;
        self
    }

    #[must_use]
    pub fn with_exclude_fields(mut self, exclude_fields: Vec<String>) -> Self {
        self.exclude_fields = exclude_fields;
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// What a finished sync did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub filters: usize,
    /// Filters without any matching record.
    pub filters_skipped: usize,
    pub pages_fetched: usize,
    pub records_fetched: usize,
    pub rows_written: usize,
    pub skipped_null_geometry: usize,
    pub skipped_invalid_geometry: usize,
    /// Rows removed in replace mode; `None` when nothing was deleted.
    pub rows_deleted: Option<usize>,
}

/// Builder for `RestCache`.
#[derive(Debug, Clone)]
pub struct RestCacheBuilder {
    url: String,
    token: Option<String>,
    user_fields: Vec<String>,
    exclude_fields: Vec<String>,
    config: TransportConfig,
}

impl RestCacheBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            user_fields: Vec::new(),
            exclude_fields: Vec::new(),
            config: TransportConfig::default(),
        }
    }

    #[must_use]
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn user_fields(mut self, user_fields: Vec<String>) -> Self {
        self.user_fields = user_fields;
        self
    }

    #[must_use]
    pub fn exclude_fields(mut self, exclude_fields: Vec<String>) -> Self {
        self.exclude_fields = exclude_fields;
        self
    }

    #[must_use]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a session on top of the blocking `reqwest` client.
    pub fn build(self) -> Result<RestCache<ReqwestClient>> {
        let client = ReqwestClient::new(&self.config)?;
        self.build_with_client(client)
    }

    /// Build a session on top of `client`. Reads the service metadata.
    pub fn build_with_client<C: HttpClient>(self, client: C) -> Result<RestCache<C>> {
        let url = self.url.trim_end_matches('/').to_string();
        let transport = Transport::new(client, self.token, self.config);
        let model =
            ServiceModel::describe(&transport, &url, &self.user_fields, &self.exclude_fields)?;
        info!(
            url = %url,
            name = %model.display_name(),
            fields = model.fields().len() - 1,
            "Connected to feature service"
        );

        Ok(RestCache {
            url,
            transport,
            user_fields: self.user_fields,
            exclude_fields: self.exclude_fields,
            created_exclude_fields: Mutex::default(),
            model,
        })
    }
}

/// A session against one feature service layer.
///
/// The service metadata is read once, when the session is built.
pub struct RestCache<C = ReqwestClient> {
    url: String,
    transport: Transport<C>,
    user_fields: Vec<String>,
    exclude_fields: Vec<String>,
    // Set by `create_destination` when the session has no excluded fields.
    created_exclude_fields: Mutex<Vec<String>>,
    model: ServiceModel,
}

impl RestCache<ReqwestClient> {
    /// Connect to the layer at `url`, e.g.
    /// `https://host/arcgis/rest/services/Name/FeatureServer/0`.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self> {
        RestCacheBuilder::new(url).token(token).build()
    }

    pub fn builder(url: impl Into<String>) -> RestCacheBuilder {
        RestCacheBuilder::new(url)
    }
}

impl<C: HttpClient> RestCache<C> {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &ServiceModel {
        &self.model
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    /// Create a destination layer for the service's fields.
    ///
    /// The layer is named `name`, or after the service when `name` is `None`.
    /// Returns the layer name.
    ///
    /// Unless the session was built with excluded fields, `exclude_fields` is
    /// remembered and used by later syncs that do not pass their own list.
    #[instrument(skip_all, fields(url = %self.url))]
    pub fn create_destination<S: SpatialStore + ?Sized>(
        &self,
        store: &S,
        name: Option<&str>,
        exclude_fields: &[String],
    ) -> Result<String> {
        ensure_workspace(store)?;

        let exclude = effective(&self.exclude_fields, exclude_fields);
        let fields = self.model.update_fields(&self.user_fields, exclude);
        let definition = LayerDefinition {
            name: name.unwrap_or(self.model.display_name()).to_string(),
            geometry_column: DEFAULT_GEOMETRY_COLUMN.to_string(),
            geometry_kind: self.model.geometry_kind(),
            srs_id: self.model.spatial_reference_id(),
            columns: fields
                .iter()
                .filter(|f| !f.is_geometry())
                .map(FieldSpec::column_spec)
                .collect(),
        };
        store.create_layer(&definition)?;
        if self.exclude_fields.is_empty() {
            *self
                .created_exclude_fields
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = exclude_fields.to_vec();
        }

        info!(layer = %definition.name, columns = definition.columns.len(), "Created destination");
        Ok(definition.name)
    }

    /// Replace the columns of `layer` with the service's fields.
    ///
    /// User fields and columns whose names contain "shape", "objectid" or
    /// "oid" are kept.
    #[instrument(skip_all, fields(url = %self.url, layer = %layer))]
    pub fn recreate_destination<S: SpatialStore + ?Sized>(
        &self,
        store: &S,
        layer: &str,
        user_fields: &[String],
    ) -> Result<()> {
        ensure_workspace(store)?;
        let user_fields = effective(&self.user_fields, user_fields);

        let (obsolete, kept): (Vec<String>, Vec<String>) = store
            .columns_of(layer)?
            .into_iter()
            .filter(|c| matches!(c.kind, ColumnKind::Attribute(_)))
            .map(|c| c.name)
            .partition(|name| {
                let lower = name.to_ascii_lowercase();
                !(lower.contains("shape")
                    || lower.contains("objectid")
                    || lower.contains("oid")
                    || user_fields.iter().any(|u| u.eq_ignore_ascii_case(name)))
            });
        store.drop_columns(layer, &obsolete)?;

        let mut added = 0;
        let exclude_fields = self.exclude_fields_for(&[]);
        let fields = self.model.update_fields(user_fields, &exclude_fields);
        for field in fields.iter().filter(|f| !f.is_geometry()) {
            if kept.iter().any(|name| name.eq_ignore_ascii_case(&field.name)) {
                continue;
            }
            store.add_column(layer, &field.column_spec())?;
            added += 1;
        }

        info!(dropped = obsolete.len(), added, "Recreated destination columns");
        Ok(())
    }

    /// Copy the records matching `options.filters` into `layer`.
    ///
    /// In replace mode the existing rows are deleted right before the first
    /// page is written, so a service that is down leaves the layer untouched.
    /// Filters are planned one at a time; rows written for earlier filters
    /// stay in place when a later one fails.
    #[instrument(skip_all, fields(url = %self.url, layer = %layer, append = options.append))]
    pub fn sync<S: SpatialStore + ?Sized>(
        &self,
        store: &S,
        layer: &str,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        let mut state = SyncState::Uninitialized;
        debug!(state = ?state, "Sync state");

        ensure_workspace(store)?;
        let user_fields = effective(&self.user_fields, &options.user_fields);
        let exclude_fields = self.exclude_fields_for(&options.exclude_fields);
        let fields = self.model.update_fields(user_fields, &exclude_fields);

        let columns = store.columns_of(layer)?;
        if !reconcile(&fields, &columns, user_fields) {
            let diff = SchemaDiff::compare(&fields, &columns, user_fields);
            warn!(missing = ?diff.missing, unexpected = ?diff.unexpected, "Schema mismatch");
            return Err(RestCacheError::SchemaMismatch {
                layer: layer.to_string(),
                missing: diff.missing,
                unexpected: diff.unexpected,
            });
        }
        state = transition(state, SyncState::SchemaChecked);

        let mut run = SyncRun {
            store,
            layer,
            field_names: fields.iter().map(|f| f.name.clone()).collect(),
            geometry_kind: self.model.geometry_kind(),
            fields: &fields,
            append: options.append,
            writer: None,
            report: SyncReport::default(),
        };

        state = transition(state, SyncState::Syncing);
        let outcome = self.run_filters(&mut run, options);
        let closed = run.close();

        match outcome.and(closed) {
            Ok(()) => {
                transition(state, SyncState::Committed);
                info!(
                    rows_written = run.report.rows_written,
                    pages = run.report.pages_fetched,
                    skipped_null_geometry = run.report.skipped_null_geometry,
                    skipped_invalid_geometry = run.report.skipped_invalid_geometry,
                    "Sync finished"
                );
                Ok(run.report)
            }
            Err(err) => {
                transition(state, SyncState::Aborted);
                warn!(error = %err, rows_written = run.report.rows_written, "Sync aborted");
                Err(err)
            }
        }
    }

    fn run_filters<S: SpatialStore + ?Sized>(
        &self,
        run: &mut SyncRun<'_, S>,
        options: &SyncOptions,
    ) -> Result<()> {
        let planner = QueryPlanner::new(&self.model);

        for filter in options.filters.clone().into_vec() {
            if options.is_cancelled() {
                return Err(RestCacheError::Cancelled);
            }

            info!(filter = %filter, "Working on query");
            let count = self.count_records(&filter)?;
            let plan = planner.plan_filter(&filter, count)?;
            run.report.filters += 1;
            if plan.is_empty() {
                warn!(filter = %filter, "No records match the query, skipping");
                run.report.filters_skipped += 1;
                continue;
            }
            debug!(filter = %filter, plan = ?plan, "Planned query");

            // More than a page past the reported count means the service
            // ignores `resultOffset`.
            let last_offset = plan.expected_records() + u64::from(self.model.max_record_count());
            for entry in plan.entries() {
                if options.is_cancelled() {
                    return Err(RestCacheError::Cancelled);
                }
                if entry.offset.is_some_and(|offset| offset > last_offset) {
                    warn!(
                        filter = %filter,
                        count = plan.expected_records(),
                        offset = ?entry.offset,
                        "Service keeps returning records past the reported count, stopping"
                    );
                    break;
                }

                let features = self.fetch_page(&entry)?;
                if features.is_empty() {
                    debug!(filter = %filter, offset = ?entry.offset, "No more results");
                    break;
                }
                run.write_page(features)?;
            }
        }
        Ok(())
    }

    /// Excluded fields for one call: the session's list, else `call`, else the
    /// list the destination was created with.
    fn exclude_fields_for(&self, call: &[String]) -> Vec<String> {
        if !self.exclude_fields.is_empty() {
            return self.exclude_fields.clone();
        }
        if !call.is_empty() {
            return call.to_vec();
        }
        self.created_exclude_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn query_url(&self) -> String {
        format!("{}/query", self.url)
    }

    fn count_records(&self, filter: &str) -> Result<u64> {
        let url = self.query_url();
        let response = self.transport.fetch(
            &url,
            &[
                ("where", filter.to_string()),
                ("f", "json".to_string()),
                ("returnCountOnly", "true".to_string()),
            ],
        )?;

        response
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| RestCacheError::MapServiceError {
                url,
                message: format!("count query for `{filter}` returned no count"),
            })
    }

    fn fetch_page(&self, entry: &QueryEntry) -> Result<Vec<Value>> {
        let url = self.query_url();
        let mut params = vec![
            ("where", entry.filter.clone()),
            ("f", "json".to_string()),
            ("returnCountOnly", "false".to_string()),
            ("outFields", "*".to_string()),
            ("outSR", self.model.spatial_reference_id().to_string()),
        ];
        if let Some(offset) = entry.offset {
            params.push(("resultOffset", offset.to_string()));
        }

        debug!(filter = %entry.filter, offset = ?entry.offset, "Fetching page");
        match self.transport.fetch(&url, &params)? {
            Value::Array(features) => Ok(features),
            other => Err(RestCacheError::MapServiceError {
                url,
                message: format!("expected a list of features, got: {other}"),
            }),
        }
    }
}

/// State of one `sync` call: the lazily opened writer and the counters.
struct SyncRun<'s, S: SpatialStore + ?Sized> {
    store: &'s S,
    layer: &'s str,
    field_names: Vec<String>,
    geometry_kind: GeometryKind,
    fields: &'s [FieldSpec],
    append: bool,
    writer: Option<Box<dyn RowWriter + 's>>,
    report: SyncReport,
}

impl<S: SpatialStore + ?Sized> SyncRun<'_, S> {
    fn write_page(&mut self, features: Vec<Value>) -> Result<()> {
        self.report.pages_fetched += 1;
        self.report.records_fetched += features.len();

        if !self.append && self.report.rows_deleted.is_none() {
            let deleted = self.store.delete_all_rows(self.layer)?;
            info!(layer = %self.layer, rows = deleted, "Deleted existing rows");
            self.report.rows_deleted = Some(deleted);
        }

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.store.open_row_writer(self.layer, &self.field_names)?,
        };
        let writer = self.writer.insert(writer);

        for feature in features {
            let record: RemoteRecord = match serde_json::from_value(feature) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "Malformed record, skipping");
                    self.report.skipped_invalid_geometry += 1;
                    continue;
                }
            };

            match transform(&record, self.geometry_kind, self.fields) {
                Ok(row) => {
                    writer.write(&row)?;
                    self.report.rows_written += 1;
                }
                Err(GeometryError::Null) => {
                    warn!(attributes = ?record.attributes, "Null geometry, skipping record");
                    self.report.skipped_null_geometry += 1;
                }
                Err(err) => {
                    warn!(error = %err, attributes = ?record.attributes, "Could not build geometry, skipping record");
                    self.report.skipped_invalid_geometry += 1;
                }
            }
        }

        writer.flush()
    }

    fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }
}

fn transition(from: SyncState, to: SyncState) -> SyncState {
    debug!(from = ?from, to = ?to, "Sync state");
    to
}

fn ensure_workspace<S: SpatialStore + ?Sized>(store: &S) -> Result<()> {
    if store.validate_workspace() {
        Ok(())
    } else {
        Err(RestCacheError::IncorrectWorkspaceType {
            location: store.location(),
        })
    }
}

// Lists given when building the session win over per-call lists.
fn effective<'a>(session: &'a [String], call: &'a [String]) -> &'a [String] {
    if session.is_empty() { call } else { session }
}
