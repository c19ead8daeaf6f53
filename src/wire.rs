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
use pgwire::api::{
    ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::StaydeskAuthSource;
use crate::authz::AuthzError;
use crate::backoffice::{Backoffice, CreateUser, InviteUser};
use crate::error::BackofficeError;
use crate::model::*;
use crate::observability;
use crate::permission::PermissionCode;
use crate::sql::{self, Command};

pub struct StaydeskHandler {
    backoffice: Arc<Backoffice>,
    query_parser: Arc<StaydeskQueryParser>,
}

impl StaydeskHandler {
    pub fn new(backoffice: Arc<Backoffice>) -> Self {
        Self {
            backoffice,
            query_parser: Arc::new(StaydeskQueryParser),
        }
    }

    /// Parse, run and time one statement on behalf of the session's login.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let login = client.metadata().get(METADATA_USER).cloned();
        let result = self.execute_command(login.as_deref(), cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        result.map_err(backoffice_err)
    }

    async fn execute_command(
        &self,
        login: Option<&str>,
        cmd: Command,
    ) -> Result<Response, BackofficeError> {
        // Resolved per statement: a user blocked mid-session loses access at once.
        let actor = login.and_then(|l| self.backoffice.resolve(l));
        let actor = actor.as_ref();
        let bo = &self.backoffice;

        match cmd {
            Command::InsertUser {
                id,
                email,
                name,
                role,
                permissions,
                hotel_id,
            } => {
                let new = CreateUser {
                    id,
                    email,
                    name,
                    role,
                    permissions,
                    hotel_id,
                };
                bo.create_user(actor, new).await?;
                Ok(tag("INSERT", 1))
            }
            Command::UpdateUser { id, patch } => {
                bo.update_user(actor, id, patch).await?;
                Ok(tag("UPDATE", 1))
            }
            Command::DeleteUser { id } => {
                bo.delete_user(actor, id).await?;
                Ok(tag("DELETE", 1))
            }
            Command::InsertInvitation {
                id,
                email,
                role,
                hotel_id,
            } => {
                let invite = InviteUser {
                    id,
                    email,
                    role,
                    hotel_id,
                };
                bo.invite_user(actor, invite).await?;
                Ok(tag("INSERT", 1))
            }
            Command::DeleteInvitation { id } => {
                bo.revoke_invitation(actor, id).await?;
                Ok(tag("DELETE", 1))
            }
            Command::AcceptInvitation { id, name } => {
                let email = login.ok_or(AuthzError::Unauthenticated)?;
                bo.accept_invitation(email, id, name).await?;
                Ok(Response::Execution(Tag::new("ACCEPT")))
            }
            Command::InsertStay(new) => {
                bo.create_stay(actor, new).await?;
                Ok(tag("INSERT", 1))
            }
            Command::UpdateStay { id, update } => {
                bo.update_stay(actor, id, update).await?;
                Ok(tag("UPDATE", 1))
            }
            Command::DeleteStay { id } => {
                bo.delete_stay(actor, id).await?;
                Ok(tag("DELETE", 1))
            }
            Command::InsertPricePeriod(new) => {
                bo.create_price_period(actor, new).await?;
                Ok(tag("INSERT", 1))
            }
            Command::UpdatePricePeriod { id, update } => {
                bo.update_price_period(actor, id, update).await?;
                Ok(tag("UPDATE", 1))
            }
            Command::DeletePricePeriod { id } => {
                bo.delete_price_period(actor, id).await?;
                Ok(tag("DELETE", 1))
            }
            Command::DeleteAuditEntry { id } => {
                bo.delete_audit_entry(actor, id).await?;
                Ok(tag("DELETE", 1))
            }
            Command::SelectUsers => {
                let users = bo.list_users(actor).await?;
                Ok(rows(users_schema(), &users, |enc, u| {
                    enc.encode_field(&u.id.to_string())?;
                    enc.encode_field(&u.email)?;
                    enc.encode_field(&u.name)?;
                    enc.encode_field(&u.role)?;
                    enc.encode_field(&code_list(u.permissions.iter()))?;
                    enc.encode_field(&u.hotel_id.map(|h| h.to_string()))?;
                    enc.encode_field(&u.blocked)?;
                    enc.encode_field(&u.created_at)
                }))
            }
            Command::SelectInvitations => {
                let invitations = bo.list_invitations(actor).await?;
                Ok(rows(invitations_schema(), &invitations, |enc, i| {
                    enc.encode_field(&i.id.to_string())?;
                    enc.encode_field(&i.email)?;
                    enc.encode_field(&i.role.as_str())?;
                    enc.encode_field(&i.hotel_id.map(|h| h.to_string()))?;
                    enc.encode_field(&i.invited_by.to_string())?;
                    enc.encode_field(&i.expires_at)?;
                    enc.encode_field(&i.state_label())
                }))
            }
            Command::SelectRoles => {
                let roles = bo.list_roles(actor).await?;
                Ok(rows(roles_schema(), &roles, |enc, r| {
                    enc.encode_field(&r.as_str())?;
                    enc.encode_field(&i64::from(r.rank()))
                }))
            }
            Command::SelectPermissions => {
                let catalog = bo.list_permissions(actor).await?;
                Ok(rows(permissions_schema(), &catalog, |enc, (code, name, action)| {
                    enc.encode_field(&i64::from(*code))?;
                    enc.encode_field(name)?;
                    enc.encode_field(&action.as_str())
                }))
            }
            Command::SelectAuditLog => {
                let entries = bo.list_audit(actor).await?;
                Ok(rows(audit_schema(), &entries, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.at)?;
                    enc.encode_field(&e.user_id.to_string())?;
                    enc.encode_field(&e.method)?;
                    enc.encode_field(&e.route)?;
                    enc.encode_field(&e.outcome.as_str())?;
                    enc.encode_field(&code_list(e.required.iter()))?;
                    enc.encode_field(&code_list(e.actual.iter()))?;
                    enc.encode_field(&e.detail)
                }))
            }
            Command::SelectStays { room_id } => {
                let stays = bo.list_stays(actor, room_id).await?;
                Ok(rows(stays_schema(), &stays, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.client_id.to_string())?;
                    enc.encode_field(&s.room_id.to_string())?;
                    enc.encode_field(&s.span.start)?;
                    enc.encode_field(&s.span.end)?;
                    enc.encode_field(&s.status.as_str())?;
                    enc.encode_field(&s.notes)?;
                    enc.encode_field(&s.checked_in_at)?;
                    enc.encode_field(&s.checked_out_at)
                }))
            }
            Command::SelectPricePeriods { filter } => {
                let periods = bo.list_price_periods(actor, filter).await?;
                Ok(rows(price_periods_schema(), &periods, encode_price_period))
            }
            Command::SelectPrice {
                entity_type,
                entity_id,
                at,
            } => {
                let period = bo.effective_price(actor, entity_type, entity_id, at).await?;
                let periods: Vec<PricePeriod> = period.into_iter().collect();
                Ok(rows(price_periods_schema(), &periods, encode_price_period))
            }
            Command::SelectInvoices { stay_id } => {
                let invoices = bo.list_invoices(actor, stay_id).await?;
                Ok(rows(invoices_schema(), &invoices, |enc, i| {
                    enc.encode_field(&i.id.to_string())?;
                    enc.encode_field(&i.stay_id.to_string())?;
                    enc.encode_field(&i.amount)?;
                    enc.encode_field(&i.created_at)
                }))
            }
        }
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
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

fn encode_price_period(enc: &mut DataRowEncoder, p: &PricePeriod) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.entity_type.as_str())?;
    enc.encode_field(&p.entity_id.to_string())?;
    enc.encode_field(&p.span.start)?;
    enc.encode_field(&p.span.end)?;
    enc.encode_field(&p.new_price)
}

/// Postgres array literal text, e.g. `{8001,8004}`.
fn code_list<'a>(codes: impl Iterator<Item = &'a PermissionCode>) -> String {
    let joined: Vec<String> = codes.map(|c| c.to_string()).collect();
    format!("{{{}}}", joined.join(","))
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("permissions", Type::VARCHAR),
        field("hotel_id", Type::VARCHAR),
        field("blocked", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn invitations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("hotel_id", Type::VARCHAR),
        field("invited_by", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("state", Type::VARCHAR),
    ]
}

fn roles_schema() -> Vec<FieldInfo> {
    vec![field("name", Type::VARCHAR), field("rank", Type::INT8)]
}

fn permissions_schema() -> Vec<FieldInfo> {
    vec![
        field("code", Type::INT8),
        field("name", Type::VARCHAR),
        field("action", Type::VARCHAR),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("at", Type::INT8),
        field("user_id", Type::VARCHAR),
        field("method", Type::VARCHAR),
        field("route", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("required", Type::VARCHAR),
        field("actual", Type::VARCHAR),
        field("detail", Type::VARCHAR),
    ]
}

fn stays_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("checked_in_at", Type::INT8),
        field("checked_out_at", Type::INT8),
    ]
}

fn price_periods_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("entity_type", Type::VARCHAR),
        field("entity_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("new_price", Type::INT8),
    ]
}

fn invoices_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("stay_id", Type::VARCHAR),
        field("amount", Type::INT8),
        field("created_at", Type::INT8),
    ]
}

/// Result columns of a statement, from the table it selects from. Works on
/// unbound statements, where `$N` placeholders keep the full parser out.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    let Some(table) = words.skip_while(|w| *w != "from").nth(1) else {
        return vec![];
    };
    match table {
        "users" => users_schema(),
        "invitations" => invitations_schema(),
        "roles" => roles_schema(),
        "permissions" => permissions_schema(),
        "audit_log" => audit_schema(),
        "stays" => stays_schema(),
        "price_periods" | "prices" => price_periods_schema(),
        "invoices" => invoices_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaydeskHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaydeskQueryParser;

#[async_trait]
impl QueryParser for StaydeskQueryParser {
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
impl ExtendedQueryHandler for StaydeskHandler {
    type Statement = String;
    type QueryParser = StaydeskQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
/// Highest index first so `$1` never eats the prefix of `$10`.
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

pub struct StaydeskFactory {
    handler: Arc<StaydeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<StaydeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StaydeskFactory {
    pub fn new(backoffice: Arc<Backoffice>, password: String) -> Self {
        let auth_source = StaydeskAuthSource::new(backoffice.engine().clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaydeskHandler::new(backoffice)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaydeskFactory {
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
    backoffice: Arc<Backoffice>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = StaydeskFactory::new(backoffice, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn backoffice_err(e: BackofficeError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
