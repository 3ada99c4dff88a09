use std::fmt::Debug;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::StaydAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::property::PropertyManager;
use crate::sql::{self, Command, PaymentOutcome};

pub struct StaydHandler {
    properties: Arc<PropertyManager>,
    query_parser: Arc<StaydQueryParser>,
}

impl StaydHandler {
    pub fn new(properties: Arc<PropertyManager>) -> Self {
        Self {
            properties,
            query_parser: Arc::new(StaydQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.properties.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("property error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectSettings => {
                let settings = engine.settings().await;
                Ok(vec![settings_response(&settings)?])
            }
            Command::UpdateSettings { changes } => {
                engine.update_settings(changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertSeason {
                id,
                name,
                range,
                nightly_rate,
                active,
            } => {
                engine
                    .add_season(id, name, range, nightly_rate, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSeason { id, patch } => {
                engine.update_season(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSeason { id } => {
                engine.remove_season(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSeasons => {
                let seasons = engine.list_seasons().await;
                seasons_response(seasons).map(|r| vec![r])
            }
            Command::SelectQuote {
                range,
                guests,
                pets,
            } => {
                let breakdown = engine
                    .quote(range, guests, pets.unwrap_or(false))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![quote_response(&range, &breakdown)?])
            }
            Command::InsertHold {
                id,
                range,
                guests,
                pets,
                contact,
            } => {
                engine
                    .try_hold(id, range, guests, pets, contact)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteHold { id } => {
                let released = engine.release_hold(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(released as usize),
                )])
            }
            Command::SelectHolds => {
                let holds = engine.list_holds().await;
                holds_response(holds).map(|r| vec![r])
            }
            Command::InsertPayment {
                booking_id,
                outcome,
            } => {
                // A failed payment releases the hold; a successful one
                // confirms the booking. Either way the report is recorded.
                match outcome {
                    PaymentOutcome::Confirmed => {
                        engine.confirm_booking(booking_id).await.map_err(engine_err)?;
                    }
                    PaymentOutcome::Failed => {
                        engine.release_hold(booking_id).await.map_err(engine_err)?;
                    }
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectBookings { id } => {
                let bookings = engine.list_bookings(id).await;
                bookings_response(bookings).map(|r| vec![r])
            }
            Command::UpdateBookingStatus { id, status } => {
                let changed = engine
                    .transition_booking(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("UPDATE").with_rows(changed as usize),
                )])
            }
            Command::DeleteBooking { id } => {
                let cancelled = engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(cancelled as usize),
                )])
            }
            Command::SelectCalendar { start, end } => {
                let entries = engine.calendar(start, end).await.map_err(engine_err)?;
                calendar_response(entries).map(|r| vec![r])
            }
            Command::InsertInvoice {
                id,
                booking_id,
                kind,
            } => {
                engine
                    .issue_invoice(id, booking_id, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateInvoiceStatus { id, status } => {
                engine
                    .set_invoice_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectInvoices { id, booking_id } => {
                let invoices = engine.list_invoices(id, booking_id).await;
                invoices_response(invoices).map(|r| vec![r])
            }
        }
    }
}

// ── Result schemas and row encoding ──────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn bool_text(b: bool) -> &'static str {
    if b { "t" } else { "f" }
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("default_nightly_rate"),
        text_field("cleaning_fee"),
        text_field("pet_cleaning_fee"),
        text_field("extra_guest_fee"),
        int8_field("extra_guest_threshold"),
        text_field("tourist_tax"),
        int8_field("tax_cap_nights"),
        int8_field("max_guests"),
    ]
}

fn settings_response(s: &PricingSettings) -> PgWireResult<Response> {
    let schema = Arc::new(settings_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.default_nightly_rate.to_string())?;
    encoder.encode_field(&s.cleaning_fee.to_string())?;
    encoder.encode_field(&s.pet_cleaning_fee.to_string())?;
    encoder.encode_field(&s.extra_guest_fee.to_string())?;
    encoder.encode_field(&(s.extra_guest_threshold as i64))?;
    encoder.encode_field(&s.tourist_tax.to_string())?;
    encoder.encode_field(&s.tax_cap_nights.map(i64::from))?;
    encoder.encode_field(&(s.max_guests as i64))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn seasons_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("start"),
        text_field("end"),
        text_field("nightly_rate"),
        bool_field("active"),
    ]
}

fn seasons_response(seasons: Vec<SeasonRule>) -> PgWireResult<Response> {
    let schema = Arc::new(seasons_schema());
    let rows: Vec<PgWireResult<_>> = seasons
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.name)?;
            encoder.encode_field(&s.range.start.to_string())?;
            encoder.encode_field(&s.range.end.to_string())?;
            encoder.encode_field(&s.nightly_rate.to_string())?;
            encoder.encode_field(&bool_text(s.active))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        text_field("check_in"),
        text_field("check_out"),
        int8_field("nights"),
        text_field("accommodation_total"),
        text_field("cleaning_fee"),
        text_field("extra_guest_fee"),
        text_field("tourist_tax"),
        text_field("total"),
    ]
}

fn quote_response(range: &DateRange, b: &PriceBreakdown) -> PgWireResult<Response> {
    let schema = Arc::new(quote_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&range.start.to_string())?;
    encoder.encode_field(&range.end.to_string())?;
    encoder.encode_field(&(b.nights as i64))?;
    encoder.encode_field(&b.accommodation_total.to_string())?;
    encoder.encode_field(&b.cleaning_fee.to_string())?;
    encoder.encode_field(&b.extra_guest_fee_total.to_string())?;
    encoder.encode_field(&b.tourist_tax_total.to_string())?;
    encoder.encode_field(&b.total.to_string())?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("check_in"),
        text_field("check_out"),
        int8_field("guests"),
        int8_field("expires_at"),
    ]
}

fn holds_response(holds: Vec<HoldInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(holds_schema());
    let rows: Vec<PgWireResult<_>> = holds
        .into_iter()
        .map(|h| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&h.id.to_string())?;
            encoder.encode_field(&h.range.start.to_string())?;
            encoder.encode_field(&h.range.end.to_string())?;
            encoder.encode_field(&(h.guests as i64))?;
            encoder.encode_field(&h.expires_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("status"),
        text_field("check_in"),
        text_field("check_out"),
        int8_field("guests"),
        bool_field("pets"),
        text_field("total"),
        int8_field("created_at"),
    ]
}

fn bookings_response(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.range.start.to_string())?;
            encoder.encode_field(&b.range.end.to_string())?;
            encoder.encode_field(&(b.guests as i64))?;
            encoder.encode_field(&bool_text(b.pets))?;
            encoder.encode_field(&b.breakdown.total.to_string())?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id"),
        text_field("kind"),
        text_field("start"),
        text_field("end"),
    ]
}

fn calendar_response(entries: Vec<CalendarEntry>) -> PgWireResult<Response> {
    let schema = Arc::new(calendar_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|e| {
            let kind = match e.kind {
                EntryKind::Hold { .. } => "hold",
                EntryKind::Booked => "booked",
            };
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.booking_id.to_string())?;
            encoder.encode_field(&kind)?;
            encoder.encode_field(&e.range.start.to_string())?;
            encoder.encode_field(&e.range.end.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn invoices_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("booking_id"),
        int8_field("number"),
        text_field("kind"),
        text_field("status"),
        text_field("total"),
        text_field("lines"),
        int8_field("issued_at"),
    ]
}

fn invoices_response(invoices: Vec<Invoice>) -> PgWireResult<Response> {
    let schema = Arc::new(invoices_schema());
    let rows: Vec<PgWireResult<_>> = invoices
        .into_iter()
        .map(|inv| {
            let lines = serde_json::to_string(&inv.lines)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&inv.id.to_string())?;
            encoder.encode_field(&inv.booking_id.to_string())?;
            encoder.encode_field(&(inv.number as i64))?;
            encoder.encode_field(&inv.kind.as_str())?;
            encoder.encode_field(&inv.status.as_str())?;
            encoder.encode_field(&inv.total_amount.to_string())?;
            encoder.encode_field(&lines)?;
            encoder.encode_field(&inv.issued_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

/// Pick the result schema for a statement by the table it reads. Used by
/// Describe before the statement runs.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("QUOTES") {
        quote_schema()
    } else if upper.contains("SEASONS") {
        seasons_schema()
    } else if upper.contains("INVOICES") {
        invoices_schema()
    } else if upper.contains("HOLDS") {
        holds_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("CALENDAR") {
        calendar_schema()
    } else if upper.contains("SETTINGS") {
        settings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for StaydHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaydQueryParser;

#[async_trait]
impl QueryParser for StaydQueryParser {
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
impl ExtendedQueryHandler for StaydHandler {
    type Statement = String;
    type QueryParser = StaydQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct StaydFactory {
    handler: Arc<StaydHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaydAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaydFactory {
    pub fn new(properties: Arc<PropertyManager>, password: String) -> Self {
        let auth_source = StaydAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaydHandler::new(properties)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaydFactory {
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

/// Serve one client connection until it closes or errors.
pub async fn process_connection(
    socket: TcpStream,
    properties: Arc<PropertyManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(StaydFactory::new(properties, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
