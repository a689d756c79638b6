use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::TourDeskAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct TourDeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TourDeskQueryParser>,
}

impl TourDeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TourDeskQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute one command and record its metrics.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::UpsertTour {
                id,
                base_price,
                min_participants,
                max_participants,
            } => {
                engine
                    .upsert_tour(id, base_price, min_participants, max_participants)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpsertResource {
                id,
                name,
                total_quantity,
                seats_per_unit,
            } => {
                engine
                    .upsert_resource(id, name, total_quantity, seats_per_unit)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SetRequirement {
                tour_id,
                resource_id,
                quantity_needed,
            } => {
                engine
                    .set_requirement(tour_id, resource_id, quantity_needed)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpsertTemplate { template } => {
                engine.upsert_template(template).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateTemplate { id, update } => {
                engine.update_template(id, update).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteTemplate { id } => {
                engine.delete_template(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertSlot {
                id,
                tour_id,
                date,
                start,
                end,
                capacity,
            } => {
                if end <= start {
                    return Err(engine_err(EngineError::Validation(
                        "end time must be after start time".into(),
                    )));
                }
                engine
                    .create_slot(id, tour_id, date, TimeWindow::new(start, end), capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateSlot { id, update } => {
                engine.update_slot(id, update).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelSlot { id } => {
                engine.cancel_slot(id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertBooking { booking } => {
                engine.create_booking(booking).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateBookingStatus { id, status, note } => {
                engine
                    .update_booking_status(id, status, note)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelBooking { id, reason } => {
                engine.cancel_booking(id, reason).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateBookingContact { id, update } => {
                engine.update_booking(id, update).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::Generate {
                template_id,
                start_date,
                end_date,
                overwrite,
                check_conflicts,
            } => {
                let report = engine
                    .generate_schedules(template_id, start_date, end_date, overwrite, check_conflicts)
                    .await
                    .map_err(engine_err)?;
                let conflicts = to_json(&report.conflicts)?;
                rows(generation_schema(), [report], |enc, r| {
                    enc.encode_field(&(r.slots_created as i32))?;
                    enc.encode_field(&(r.slots_skipped as i32))?;
                    enc.encode_field(&conflicts)
                })
            }
            Command::PreviewGeneration {
                template_id,
                start_date,
                end_date,
            } => {
                let preview = engine
                    .preview_generation(template_id, start_date, end_date)
                    .map_err(engine_err)?;
                let requirements = to_json(&preview.requirements)?;
                let total = preview.total_slots as i32;
                rows(preview_schema(), preview.days, |enc, day| {
                    enc.encode_field(&day.date.to_string())?;
                    enc.encode_field(&(day.weekday as i32))?;
                    enc.encode_field(&(day.slots as i32))?;
                    enc.encode_field(&clock(day.day_start))?;
                    enc.encode_field(&clock(day.day_end))?;
                    enc.encode_field(&total)?;
                    enc.encode_field(&requirements)
                })
            }
            Command::SelectQuote {
                tour_id,
                slot_id,
                participants,
            } => {
                let quote = match tour_id {
                    Some(tour_id) => engine.quote(tour_id, slot_id, participants).await,
                    None => engine.quote_slot(slot_id, participants).await,
                }
                .map_err(engine_err)?;
                let manifest = to_json(&quote.manifest)?;
                rows(quote_schema(), [quote], |enc, q| {
                    enc.encode_field(&q.total_price.to_string())?;
                    enc.encode_field(&q.available)?;
                    enc.encode_field(&(q.free_seats as i32))?;
                    enc.encode_field(&manifest)
                })
            }
            Command::SelectSlotStats { slot_id } => {
                let stats = engine.slot_stats(slot_id).await.map_err(engine_err)?;
                rows(slot_stats_schema(), [stats], |enc, s| {
                    enc.encode_field(&s.slot_id.to_string())?;
                    enc.encode_field(&(s.total_capacity as i32))?;
                    enc.encode_field(&(s.booked as i32))?;
                    enc.encode_field(&(s.free as i32))?;
                    enc.encode_field(&(s.pending_count as i32))?;
                    enc.encode_field(&(s.confirmed_count as i32))?;
                    enc.encode_field(&(s.bookings_count as i32))?;
                    enc.encode_field(&s.status.as_str().to_string())
                })
            }
            Command::SelectSlotAudit { slot_id } => {
                let audit = engine.audit_slot(slot_id).await.map_err(engine_err)?;
                rows(slot_audit_schema(), [audit], |enc, a| {
                    enc.encode_field(&a.slot_id.to_string())?;
                    enc.encode_field(&(a.counter as i32))?;
                    enc.encode_field(&(a.recomputed as i32))?;
                    enc.encode_field(&a.is_consistent())
                })
            }
            Command::SelectSlots { tour_id, from, to } => {
                let slots = engine.list_slots(tour_id, from, to).await;
                rows(slots_schema(), slots, encode_slot)
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Slot(slot_id) => {
                        engine.bookings_for_slot(slot_id).await.map_err(engine_err)?
                    }
                    BookingFilter::Id(id) => match engine.get_booking(id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    BookingFilter::Code(code) => {
                        engine.find_booking_by_code(&code).await.into_iter().collect()
                    }
                };
                rows(bookings_schema(), bookings, encode_booking)
            }
            Command::SelectBookingStats { from, to } => {
                let stats = engine.booking_stats(from, to).await;
                rows(booking_stats_schema(), [stats], |enc, s| {
                    enc.encode_field(&(s.total as i64))?;
                    enc.encode_field(&(s.pending as i64))?;
                    enc.encode_field(&(s.confirmed as i64))?;
                    enc.encode_field(&(s.paid as i64))?;
                    enc.encode_field(&(s.completed as i64))?;
                    enc.encode_field(&(s.cancelled as i64))?;
                    enc.encode_field(&s.revenue.to_string())?;
                    enc.encode_field(&(s.participants as i64))
                })
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

/// Encode `items` as rows of `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_slot(enc: &mut DataRowEncoder, slot: TimeSlot) -> PgWireResult<()> {
    enc.encode_field(&slot.id.to_string())?;
    enc.encode_field(&slot.tour_id.to_string())?;
    enc.encode_field(&slot.template_id.map(|t| t.to_string()))?;
    enc.encode_field(&slot.date.to_string())?;
    enc.encode_field(&clock(slot.window.start))?;
    enc.encode_field(&clock(slot.window.end))?;
    enc.encode_field(&(slot.total_capacity as i32))?;
    enc.encode_field(&(slot.booked_count as i32))?;
    enc.encode_field(&(slot.free_seats() as i32))?;
    enc.encode_field(&slot.status.as_str().to_string())?;
    enc.encode_field(&slot.notes)
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    let (customer_id, name, phone, email) = match b.customer {
        CustomerIdentity::Registered { user_id } => (Some(user_id), None, None, None),
        CustomerIdentity::Guest { name, phone, email } => (None, Some(name), Some(phone), email),
    };
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.code)?;
    enc.encode_field(&b.slot_id.to_string())?;
    enc.encode_field(&b.tour_id.to_string())?;
    enc.encode_field(&customer_id)?;
    enc.encode_field(&name)?;
    enc.encode_field(&phone)?;
    enc.encode_field(&email)?;
    enc.encode_field(&(b.participants as i32))?;
    enc.encode_field(&b.total_price.to_string())?;
    enc.encode_field(&b.status.as_str().to_string())?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.confirmed_at)?;
    enc.encode_field(&b.paid_at)?;
    enc.encode_field(&b.completed_at)?;
    enc.encode_field(&b.cancelled_at)?;
    enc.encode_field(&b.notes)
}

fn clock(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn generation_schema() -> Vec<FieldInfo> {
    vec![
        field("slots_created", Type::INT4),
        field("slots_skipped", Type::INT4),
        field("conflicts", Type::VARCHAR),
    ]
}

fn preview_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("weekday", Type::INT4),
        field("slots", Type::INT4),
        field("day_start", Type::VARCHAR),
        field("day_end", Type::VARCHAR),
        field("total_slots", Type::INT4),
        field("requirements", Type::VARCHAR),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("total_price", Type::VARCHAR),
        field("available", Type::BOOL),
        field("free_seats", Type::INT4),
        field("manifest", Type::VARCHAR),
    ]
}

fn slot_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("slot_id", Type::VARCHAR),
        field("total_capacity", Type::INT4),
        field("booked", Type::INT4),
        field("free", Type::INT4),
        field("pending_count", Type::INT4),
        field("confirmed_count", Type::INT4),
        field("bookings_count", Type::INT4),
        field("status", Type::VARCHAR),
    ]
}

fn slot_audit_schema() -> Vec<FieldInfo> {
    vec![
        field("slot_id", Type::VARCHAR),
        field("counter", Type::INT4),
        field("recomputed", Type::INT4),
        field("consistent", Type::BOOL),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tour_id", Type::VARCHAR),
        field("template_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("total_capacity", Type::INT4),
        field("booked_count", Type::INT4),
        field("free_seats", Type::INT4),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("code", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("tour_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("customer_phone", Type::VARCHAR),
        field("customer_email", Type::VARCHAR),
        field("participants", Type::INT4),
        field("total_price", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("confirmed_at", Type::INT8),
        field("paid_at", Type::INT8),
        field("completed_at", Type::INT8),
        field("cancelled_at", Type::INT8),
        field("notes", Type::VARCHAR),
    ]
}

fn booking_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("total", Type::INT8),
        field("pending", Type::INT8),
        field("confirmed", Type::INT8),
        field("paid", Type::INT8),
        field("completed", Type::INT8),
        field("cancelled", Type::INT8),
        field("revenue", Type::VARCHAR),
        field("participants", Type::INT8),
    ]
}

/// Result columns of a statement, decided by the table after FROM. Statements
/// without a result set describe as empty.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "generation" => generation_schema(),
        "generation_preview" => preview_schema(),
        "quote" => quote_schema(),
        "slot_stats" => slot_stats_schema(),
        "slot_audit" => slot_audit_schema(),
        "slots" => slots_schema(),
        "bookings" => bookings_schema(),
        "booking_stats" => booking_stats_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for TourDeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_script(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TourDeskQueryParser;

#[async_trait]
impl QueryParser for TourDeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TourDeskHandler {
    type Statement = String;
    type QueryParser = TourDeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(&substitute_params(portal)).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound text parameters as quoted literals.
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TourDeskFactory {
    handler: Arc<TourDeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TourDeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TourDeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TourDeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TourDeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TourDeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(TourDeskFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM slots WHERE tour_id = $1"), 1);
        assert_eq!(
            count_params("SELECT * FROM quote WHERE slot_id = $2 AND participants = $10"),
            10
        );
        assert_eq!(count_params("SELECT * FROM booking_stats"), 0);
        assert_eq!(count_params("SELECT '$' FROM slots"), 0);
    }

    #[test]
    fn schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("select * from quote where slot_id = $1")[0], "total_price");
        assert_eq!(names("SELECT * FROM \"slots\" WHERE tour_id = $1").len(), 11);
        assert_eq!(names("SELECT * FROM booking_stats;").len(), 8);
        assert!(names("INSERT INTO bookings VALUES ($1)").is_empty());
        assert!(names("SELECT * FROM nowhere").is_empty());
    }
}
