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
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;

use crate::auth::RoomBookAuthSource;
use crate::engine::{BookingRequest, CreatedRequest, Engine, EngineError, PolicyRejection};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

pub struct RoomBookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoomBookQueryParser>,
}

/// Who the session is acting as.
enum Session {
    /// Login name matches a registered user.
    User(Actor),
    /// Login name is not a registered user: the operator account.
    Operator(String),
}

impl RoomBookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}"), None))
    }

    fn resolve_session<C: ClientInfo>(&self, engine: &Engine, client: &C) -> Session {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        match engine.actor_for(&login) {
            Some(actor) => Session::User(actor),
            None => Session::Operator(login),
        }
    }

    async fn run(&self, engine: &Engine, session: &Session, cmd: Command) -> PgWireResult<Response> {
        let started = Instant::now();
        let label = command_label(&cmd);
        let result = self.execute_command(engine, session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, session: &Session, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRoom { id, name } => {
                require_manager(session)?;
                engine.create_room(id, &name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom { id, name } => {
                require_manager(session)?;
                engine.rename_room(id, &name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                require_manager(session)?;
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUser { id, name, email, role } => {
                require_manager(session)?;
                engine
                    .create_user(id, &name, &email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateUserRole { id, role } => {
                require_manager(session)?;
                engine.set_user_role(id, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdateSettings { patch } => {
                require_manager(session)?;
                engine.update_settings(&patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertBookings {
                room_id,
                dates,
                window,
                kind,
            } => {
                let actor = require_user(session)?;
                let created = engine
                    .create_booking_request(
                        &actor,
                        BookingRequest {
                            room_id,
                            dates,
                            window,
                            kind,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(created_response(&created))
            }
            Command::UpdateBookingStatus { id, status, reason } => {
                let actor = require_user(session)?;
                match status {
                    BookingStatus::Cancelled => {
                        engine
                            .cancel_booking(id, &actor, reason.as_deref().unwrap_or(""))
                            .await
                            .map_err(engine_err)?;
                    }
                    other => {
                        engine
                            .review_booking(id, other, &actor)
                            .await
                            .map_err(engine_err)?;
                    }
                }
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.name)?;
                        encoder.encode_field(&(room.booking_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectUsers => {
                let schema = Arc::new(users_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_users()
                    .into_iter()
                    .map(|user| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&user.id.to_string())?;
                        encoder.encode_field(&user.name)?;
                        encoder.encode_field(&user.email)?;
                        encoder.encode_field(&user.role.as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSettings => {
                let settings = engine.settings().await;
                let schema = Arc::new(settings_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&settings.maintenance_mode)?;
                encoder.encode_field(&settings.maintenance_message().to_string())?;
                encoder.encode_field(&settings.working_hours.map(|w| w.start.format("%H:%M").to_string()))?;
                encoder.encode_field(&settings.working_hours.map(|w| w.end.format("%H:%M").to_string()))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Room { room_id, date } => {
                        engine.get_bookings(room_id, date).await.map_err(engine_err)?
                    }
                    BookingFilter::User(user_id) => {
                        if let Session::User(actor) = session
                            && actor.user_id != user_id
                            && !actor.role.is_admin()
                        {
                            return Err(user_error(
                                "42501",
                                "only administrators may list another user's bookings".into(),
                                None,
                            ));
                        }
                        engine.bookings_for_user(user_id).await
                    }
                    BookingFilter::Id(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    BookingFilter::Mine => {
                        let actor = require_user(session)?;
                        engine.bookings_for_user(actor.user_id).await
                    }
                };
                Ok(bookings_response(&bookings))
            }
            Command::SelectConflicts { room_id, date, window } => {
                let bookings = engine
                    .find_conflicting(room_id, date, window)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(&bookings))
            }
            Command::SelectQueue { room_id, date, window } => {
                let queue = engine.get_queue(room_id, date, window).await.map_err(engine_err)?;
                let schema = Arc::new(queue_schema());
                let rows: Vec<PgWireResult<_>> = queue
                    .iter()
                    .enumerate()
                    .map(|(i, b)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&((i + 1) as i64))?;
                        encode_booking(&mut encoder, b)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn require_user(session: &Session) -> PgWireResult<Actor> {
    match session {
        Session::User(actor) => Ok(*actor),
        Session::Operator(login) => Err(user_error(
            "42501",
            format!("login {login:?} is not a registered user"),
            None,
        )),
    }
}

/// Catalog and settings writes: administrators and the operator login.
fn require_manager(session: &Session) -> PgWireResult<()> {
    match session {
        Session::User(actor) if !actor.role.is_admin() => Err(user_error(
            "42501",
            "administrator role required".into(),
            None,
        )),
        _ => Ok(()),
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), int_field("booking_count")]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("email"), text_field("role")]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("maintenance_mode".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("maintenance_message"),
        text_field("working_hours_start"),
        text_field("working_hours_end"),
    ]
}

fn booking_fields() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("user_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("type"),
        text_field("status"),
        text_field("cancellation_reason"),
        int_field("created_at"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    booking_fields()
}

/// Booking columns plus how many earlier pending requests share the slot.
fn created_schema() -> Vec<FieldInfo> {
    let mut fields = booking_fields();
    fields.push(int_field("queue_ahead"));
    fields
}

fn queue_schema() -> Vec<FieldInfo> {
    let mut fields = vec![int_field("position")];
    fields.extend(booking_fields());
    fields
}

/// Schema guess for Describe, from the statement text alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if lower.contains("insert") {
        return if lower.contains("bookings") { created_schema() } else { vec![] };
    }
    if !lower.contains("select") {
        return vec![];
    }
    if lower.contains("queue") {
        queue_schema()
    } else if lower.contains("bookings") || lower.contains("conflicts") {
        bookings_schema()
    } else if lower.contains("rooms") {
        rooms_schema()
    } else if lower.contains("users") {
        users_schema()
    } else if lower.contains("settings") {
        settings_schema()
    } else {
        vec![]
    }
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.room_id.to_string())?;
    encoder.encode_field(&b.user_id.to_string())?;
    encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
    encoder.encode_field(&b.window.start.format("%H:%M").to_string())?;
    encoder.encode_field(&b.window.end.format("%H:%M").to_string())?;
    encoder.encode_field(&b.kind.as_str().to_string())?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.cancellation_reason)?;
    encoder.encode_field(&b.created_at)?;
    Ok(())
}

fn bookings_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_booking(&mut encoder, b)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// A booking INSERT answers with the rows it created, like `RETURNING *`.
fn created_response(created: &CreatedRequest) -> Response {
    let schema = Arc::new(created_schema());
    let rows: Vec<PgWireResult<_>> = created
        .bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_booking(&mut encoder, b)?;
            let ahead = created.queue_positions.get(&b.date).map(|p| p.ahead as i64);
            encoder.encode_field(&ahead)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
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
        let session = self.resolve_session(&engine, client);
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(&engine, &session, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let session = self.resolve_session(&engine, client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, &session, cmd).await
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

/// Single left-to-right pass: each `$N` outside a quoted literal is replaced
/// once, and substituted text is never rescanned.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            b'$' if !in_quote => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match bound {
                    Some(param) => {
                        out.push_str(&sql[copied..i]);
                        out.push_str(&quote_param(*param));
                        copied = end;
                        i = end;
                    }
                    None => i = end.max(i + 1),
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

fn quote_param(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoomBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomBookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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
    let factory = RoomBookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String, detail: Option<serde_json::Value>) -> PgWireError {
    let mut info = ErrorInfo::new("ERROR".into(), code.into(), message);
    info.detail = detail.map(|d| d.to_string());
    PgWireError::UserError(Box::new(info))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::Policy(_) => "P0001",
        EngineError::State(_) => "55000",
        EngineError::TransactionFailed(_) => "40000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// Machine-readable context for errors that carry more than a message.
fn error_detail(e: &EngineError) -> Option<serde_json::Value> {
    match e {
        EngineError::Conflict { dates, bookings } => Some(json!({
            "code": "CONFLICT",
            "dates": dates,
            "bookings": bookings,
        })),
        EngineError::Policy(PolicyRejection::MaintenanceMode { .. }) => Some(json!({
            "code": "MAINTENANCE_MODE",
        })),
        EngineError::Policy(PolicyRejection::OutsideWorkingHours { start, end, .. }) => Some(json!({
            "code": "OUTSIDE_WORKING_HOURS",
            "working_hours": {
                "start": start.format("%H:%M").to_string(),
                "end": end.format("%H:%M").to_string(),
            },
        })),
        _ => None,
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = match &e {
        EngineError::Policy(p) => p.message().to_string(),
        other => other.to_string(),
    };
    user_error(sqlstate(&e), message, error_detail(&e))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    user_error(code, e.to_string(), None)
}
