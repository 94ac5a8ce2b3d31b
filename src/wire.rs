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
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::ParkdAuthSource;
use crate::engine::{Engine, EngineError, NewBooking};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AvailabilityTarget, Command};

pub struct ParkdHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    /// The login user is the principal; the configured admin user gets the admin role.
    fn principal<C: ClientInfo>(&self, client: &C) -> Principal {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        if user == self.admin_user {
            Principal::admin(user)
        } else {
            Principal::user(user)
        }
    }

    async fn run(&self, principal: &Principal, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, principal: &Principal, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertPlace { id, name, hourly_rate, daily_rate } => {
                let pricing = Pricing { hourly_rate, daily_rate };
                engine
                    .create_place(principal, id, name, pricing)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::DeletePlace { id } => {
                engine.delete_place(principal, id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectPlaces => {
                let places = engine.list_places().await;
                Ok(rows(place_schema(), &places, encode_place))
            }
            Command::InsertSlot { id, place_id, label, pricing } => {
                engine
                    .add_slot(principal, id, place_id, label, pricing)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::UpdateSlotStatus { id, status } => {
                engine
                    .set_slot_status(principal, id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::DeleteSlot { id } => {
                engine.remove_slot(principal, id).await.map_err(engine_err)?;
                Ok(executed("DELETE"))
            }
            Command::SelectSlots { place_id } => {
                let slots = engine.list_slots(place_id).await.map_err(engine_err)?;
                Ok(rows(slot_schema(), &slots, encode_slot))
            }
            Command::InsertBooking { id, place_id, slot_id, start, end, vehicle } => {
                let span = span(start, end)?;
                let booked = match slot_id {
                    Some(slot_id) => {
                        let req = NewBooking { id, place_id, slot_id, span, vehicle };
                        engine.create_booking(principal, req).await
                    }
                    None => engine.quick_book(principal, id, place_id, span, vehicle).await,
                };
                booked.map_err(engine_err)?;
                Ok(executed("INSERT"))
            }
            Command::RescheduleBooking { id, start, end, plate } => {
                let current = engine.get_booking(principal, id).await.map_err(engine_err)?;
                let new_span = match (start, end) {
                    (None, None) => None,
                    (start, end) => Some(span(
                        start.unwrap_or(current.span.start),
                        end.unwrap_or(current.span.end),
                    )?),
                };
                let vehicle = plate.map(|plate| Vehicle { plate, kind: current.vehicle.kind });
                engine
                    .update_booking(principal, id, new_span, vehicle)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::ConfirmBooking { id, payment_method, transaction_id } => {
                engine
                    .confirm_payment(principal, id, payment_method, transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::CancelBooking { id, reason } => {
                engine
                    .cancel_booking(principal, id, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::CheckIn { id } => {
                engine.check_in(principal, id).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::CheckOut { id } => {
                engine.check_out(principal, id).await.map_err(engine_err)?;
                Ok(executed("UPDATE"))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(principal, id).await.map_err(engine_err)?;
                Ok(rows(booking_schema(), &[booking], encode_booking))
            }
            Command::SelectBookings { filter, page } => {
                let bookings = engine
                    .list_bookings(principal, filter, page)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(booking_schema(), &bookings, encode_booking))
            }
            Command::SelectAvailability { target, start, end, min_duration } => {
                let (target_id, windows) = match target {
                    AvailabilityTarget::Slot(id) => {
                        (id, engine.slot_availability(id, start, end, min_duration).await)
                    }
                    AvailabilityTarget::Place(id) => {
                        (id, engine.place_availability(id, start, end, min_duration).await)
                    }
                };
                let windows = windows.map_err(engine_err)?;
                let target_id = target_id.to_string();
                Ok(rows(availability_schema(), &windows, |encoder, window| {
                    encoder.encode_field(&target_id)?;
                    encoder.encode_field(&window.start)?;
                    encoder.encode_field(&window.end)
                }))
            }
            Command::SelectPrice { slot_id, start, end } => {
                let span = span(start, end)?;
                let amount = engine.calculate_price(slot_id, span).await.map_err(engine_err)?;
                let available = engine
                    .check_availability(slot_id, span)
                    .await
                    .map_err(engine_err)?;
                let slot_id = slot_id.to_string();
                Ok(rows(price_schema(), &[span], |encoder, span| {
                    encoder.encode_field(&slot_id)?;
                    encoder.encode_field(&span.start)?;
                    encoder.encode_field(&span.end)?;
                    encoder.encode_field(&span.duration_hours())?;
                    encoder.encode_field(&amount)?;
                    encoder.encode_field(&available)
                }))
            }
            Command::SelectReport { place_id } => {
                let report = engine
                    .place_report(principal, place_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(report_schema(), &[report], encode_report))
            }
            Command::Listen { channel } => {
                let place_id = channel.strip_prefix("place_").ok_or_else(|| {
                    user_error("42000", format!("invalid channel: {channel} (expected place_{{id}})"))
                })?;
                Ulid::from_string(place_id)
                    .map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))?;
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

fn executed(tag: &str) -> Response {
    Response::Execution(Tag::new(tag).with_rows(1))
}

fn span(start: Ms, end: Ms) -> PgWireResult<Span> {
    if start >= end {
        return Err(engine_err(EngineError::InvalidInterval("start must be before end")));
    }
    Ok(Span::new(start, end))
}

/// Encode `items` as a result set, one row each.
fn rows<T>(
    fields: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(fields);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_place(encoder: &mut DataRowEncoder, p: &PlaceInfo) -> PgWireResult<()> {
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.name)?;
    encoder.encode_field(&p.pricing.hourly_rate)?;
    encoder.encode_field(&p.pricing.daily_rate)?;
    encoder.encode_field(&(p.capacity.total as i64))?;
    encoder.encode_field(&(p.capacity.available as i64))?;
    encoder.encode_field(&(p.capacity.reserved as i64))?;
    encoder.encode_field(&(p.capacity.out_of_service as i64))?;
    encoder.encode_field(&(p.slot_count as i64))
}

fn encode_slot(encoder: &mut DataRowEncoder, s: &SlotInfo) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.place_id.to_string())?;
    encoder.encode_field(&s.label)?;
    encoder.encode_field(&s.status.as_str().to_owned())?;
    encoder.encode_field(&s.is_available)?;
    encoder.encode_field(&s.pricing.hourly_rate)?;
    encoder.encode_field(&s.pricing.daily_rate)?;
    encoder.encode_field(&(s.live_bookings as i64))
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.user_id)?;
    encoder.encode_field(&b.place_id.to_string())?;
    encoder.encode_field(&b.slot_id.to_string())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.status.as_str().to_owned())?;
    encoder.encode_field(&b.amount)?;
    encoder.encode_field(&b.vehicle.plate)?;
    encoder.encode_field(&b.vehicle.kind)?;
    encoder.encode_field(&b.payment.status.as_str().to_owned())?;
    encoder.encode_field(&b.payment.method)?;
    encoder.encode_field(&b.payment.transaction_id)?;
    encoder.encode_field(&b.check_in.as_ref().map(|s| s.time))?;
    encoder.encode_field(&b.check_out.as_ref().map(|s| s.time))?;
    encoder.encode_field(&b.cancellation.as_ref().map(|c| c.cancelled_at))?;
    encoder.encode_field(&b.cancellation.as_ref().map(|c| c.refund_amount))?;
    encoder.encode_field(&b.created_at)
}

fn encode_report(encoder: &mut DataRowEncoder, r: &PlaceReport) -> PgWireResult<()> {
    encoder.encode_field(&r.place_id.to_string())?;
    for n in [
        r.capacity.total,
        r.capacity.available,
        r.capacity.reserved,
        r.capacity.out_of_service,
        r.slots_occupied,
        r.bookings_pending,
        r.bookings_confirmed,
        r.bookings_completed,
        r.bookings_cancelled,
        r.bookings_expired,
    ] {
        encoder.encode_field(&(n as i64))?;
    }
    encoder.encode_field(&r.revenue)?;
    encoder.encode_field(&r.refunds)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn place_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("hourly_rate", Type::FLOAT8),
        field("daily_rate", Type::FLOAT8),
        field("total", Type::INT8),
        field("available", Type::INT8),
        field("reserved", Type::INT8),
        field("out_of_service", Type::INT8),
        field("slots", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("place_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("is_available", Type::BOOL),
        field("hourly_rate", Type::FLOAT8),
        field("daily_rate", Type::FLOAT8),
        field("live_bookings", Type::INT8),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("place_id", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("amount", Type::FLOAT8),
        field("plate", Type::VARCHAR),
        field("vehicle_kind", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("payment_method", Type::VARCHAR),
        field("transaction_id", Type::VARCHAR),
        field("checked_in_at", Type::INT8),
        field("checked_out_at", Type::INT8),
        field("cancelled_at", Type::INT8),
        field("refund_amount", Type::FLOAT8),
        field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn price_schema() -> Vec<FieldInfo> {
    vec![
        field("slot_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("hours", Type::FLOAT8),
        field("amount", Type::FLOAT8),
        field("available", Type::BOOL),
    ]
}

fn report_schema() -> Vec<FieldInfo> {
    vec![
        field("place_id", Type::VARCHAR),
        field("total", Type::INT8),
        field("available", Type::INT8),
        field("reserved", Type::INT8),
        field("out_of_service", Type::INT8),
        field("occupied", Type::INT8),
        field("pending", Type::INT8),
        field("confirmed", Type::INT8),
        field("completed", Type::INT8),
        field("cancelled", Type::INT8),
        field("expired", Type::INT8),
        field("revenue", Type::FLOAT8),
        field("refunds", Type::FLOAT8),
    ]
}

/// Result columns of a statement, judged from the table it selects from.
/// Parameters are still unbound here, so the statement is not parsed.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "places" => place_schema(),
        "slots" => slot_schema(),
        "bookings" => booking_schema(),
        "availability" => availability_schema(),
        "price" => price_schema(),
        "report" => report_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let principal = self.principal(client);
        Ok(vec![self.run(&principal, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let principal = self.principal(client);
        let sql = substitute_params(portal);
        self.run(&principal, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
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

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        let auth_source = ParkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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
    engine: Arc<Engine>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ParkdFactory::new(engine, password, admin_user));
    process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "02000",
        EngineError::Forbidden(_) => "42501",
        EngineError::BookingConflict(_) => "23P01",
        EngineError::SlotUnavailable(_) => "55000",
        EngineError::InvalidTransition { .. } => "55006",
        EngineError::InvalidInterval(_) | EngineError::Validation(_) => "22023",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasSlots(_) | EngineError::HasLiveBookings(_) => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
