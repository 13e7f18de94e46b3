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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Run one command, recording query metrics.
    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertItem { id, name } => {
                engine.create_item(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteItem { id } => {
                engine.delete_item(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectItems => {
                let items = engine.list_items();
                rows(ResultShape::Items, items, |enc, item| {
                    enc.encode_field(&item.id.to_string())?;
                    enc.encode_field(&item.name)
                })
            }
            Command::InsertUser {
                id,
                login,
                full_name,
                role,
                birth_date,
                gender,
            } => {
                engine
                    .create_user(id, login, full_name, birth_date, gender, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id, role } => {
                engine.delete_user(id, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers { role } => {
                let users = engine.list_users(role);
                rows(ResultShape::Users, users, |enc, user| {
                    enc.encode_field(&user.id.to_string())?;
                    enc.encode_field(&user.login)?;
                    enc.encode_field(&user.full_name)?;
                    enc.encode_field(&user.birth_date)?;
                    enc.encode_field(&user.gender)?;
                    enc.encode_field(&user.role.as_str())
                })
            }
            Command::InsertSlot {
                id,
                item_id,
                start,
                end,
            } => {
                engine
                    .create_slot(id, item_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSchedule { item_id, day } => {
                let created = engine.generate_slots(item_id, day).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SetSlotAvailable { id, available } => {
                let result = if available {
                    engine.unblock_slot(id).await
                } else {
                    engine.block_slot(id).await
                };
                result.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SetDayAvailable { day, available } => {
                let changed = engine
                    .set_day_availability(day, available)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(changed)))
            }
            Command::SelectSlots { item_id, day } => {
                let slots = engine.available_slots(item_id, day).await.map_err(engine_err)?;
                rows(ResultShape::Slots, slots, |enc, slot| {
                    enc.encode_field(&slot.id.to_string())?;
                    enc.encode_field(&slot.item_id.to_string())?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&slot.available)
                })
            }
            Command::SelectAvailableDays { from, to } => {
                let days = engine.available_days(from, to).await.map_err(engine_err)?;
                rows(ResultShape::AvailableDays, days, |enc, day| enc.encode_field(&day))
            }
            Command::InsertBooking {
                slot_id,
                user_id,
                returning,
            } => {
                let id = engine.book(slot_id, user_id).await.map_err(engine_err)?;
                if returning {
                    rows(ResultShape::BookingId, vec![id], |enc, id| {
                        enc.encode_field(&id.to_string())
                    })
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::DeleteBooking { id, user_id } => {
                engine.cancel(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { user_id } => {
                let bookings = engine.user_bookings(user_id).await.map_err(engine_err)?;
                rows(ResultShape::Bookings, bookings, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.user_id.to_string())?;
                    enc.encode_field(&b.slot_id.to_string())?;
                    enc.encode_field(&b.item_id.to_string())?;
                    enc.encode_field(&b.item_name)?;
                    enc.encode_field(&b.start)?;
                    enc.encode_field(&b.end)?;
                    enc.encode_field(&b.created_at)
                })
            }
        }
    }
}

/// Encode a result set with the schema of `shape`.
fn rows<T>(
    shape: ResultShape,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(shape));
    let data: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(data))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::None => vec![],
        ResultShape::Items => vec![field("id", Type::VARCHAR), field("name", Type::VARCHAR)],
        ResultShape::Users => vec![
            field("id", Type::VARCHAR),
            field("login", Type::VARCHAR),
            field("full_name", Type::VARCHAR),
            field("birth_date", Type::VARCHAR),
            field("gender", Type::VARCHAR),
            field("role", Type::VARCHAR),
        ],
        ResultShape::Slots => vec![
            field("id", Type::VARCHAR),
            field("item_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("available", Type::BOOL),
        ],
        ResultShape::AvailableDays => vec![field("day", Type::INT8)],
        ResultShape::Bookings => vec![
            field("id", Type::VARCHAR),
            field("user_id", Type::VARCHAR),
            field("slot_id", Type::VARCHAR),
            field("item_id", Type::VARCHAR),
            field("item_name", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("created_at", Type::INT8),
        ],
        ResultShape::BookingId => vec![field("id", Type::VARCHAR)],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(schema_for(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
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
        let schema = schema_for(sql::result_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = schema_for(sql::result_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(schema))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
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

/// Substitute `$1`, `$2`, ... with bound text-format parameters as SQL literals.
/// Goes highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_)
        | EngineError::DuplicateLogin(_)
        | EngineError::Conflict(_) => "23505",
        EngineError::QuotaExceeded(_) => "53400",
        EngineError::LimitExceeded(_) => "22023",
        EngineError::Internal(_) => "XX000",
    }
}

/// What the client is told. Internal details stay in the server log.
fn client_message(e: &EngineError) -> String {
    match e {
        EngineError::Internal(_) => "internal error".to_string(),
        other => other.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Internal(detail) = &e {
        tracing::error!("internal error: {detail}");
    }
    user_error(sqlstate(&e), client_message(&e))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM items"), 0);
        assert_eq!(count_params("DELETE FROM bookings WHERE id = $1 AND user_id = $2"), 2);
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn substitutes_and_quotes_params() {
        let params: Vec<Option<Vec<u8>>> = vec![Some(b"it's".to_vec()), None];
        let sql = substitute_params("INSERT INTO items VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO items VALUES ('it''s', NULL)");
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Conflict(id)), "23505");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&EngineError::QuotaExceeded(3)), "53400");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "22023");
        assert_eq!(sqlstate(&EngineError::Internal("disk".into())), "XX000");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let e = EngineError::Internal("WAL append failed: EIO".into());
        assert_eq!(client_message(&e), "internal error");
        let e = EngineError::QuotaExceeded(3);
        assert!(client_message(&e).contains('3'));
    }

    #[test]
    fn every_shape_has_a_schema() {
        assert!(schema_for(ResultShape::None).is_empty());
        assert_eq!(schema_for(ResultShape::Slots).len(), 5);
        assert_eq!(schema_for(ResultShape::Bookings).len(), 8);
        assert_eq!(schema_for(ResultShape::BookingId).len(), 1);
    }
}
