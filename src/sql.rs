use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::PricePeriodFilter;
use crate::model::*;
use crate::permission::PermissionCode;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        email: String,
        name: String,
        role: String,
        permissions: Vec<PermissionCode>,
        hotel_id: Option<Ulid>,
    },
    UpdateUser {
        id: Ulid,
        patch: UserPatch,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertInvitation {
        id: Ulid,
        email: String,
        role: String,
        hotel_id: Option<Ulid>,
    },
    /// Revokes a pending invitation.
    DeleteInvitation {
        id: Ulid,
    },
    AcceptInvitation {
        id: Ulid,
        name: String,
    },
    InsertStay(NewStay),
    UpdateStay {
        id: Ulid,
        update: StayUpdate,
    },
    DeleteStay {
        id: Ulid,
    },
    InsertPricePeriod(NewPricePeriod),
    UpdatePricePeriod {
        id: Ulid,
        update: PricePeriodUpdate,
    },
    DeletePricePeriod {
        id: Ulid,
    },
    /// Hides an activity entry.
    DeleteAuditEntry {
        id: Ulid,
    },
    SelectUsers,
    SelectInvitations,
    SelectRoles,
    SelectPermissions,
    SelectAuditLog,
    SelectStays {
        room_id: Option<Ulid>,
    },
    SelectPricePeriods {
        filter: PricePeriodFilter,
    },
    SelectPrice {
        entity_type: EntityType,
        entity_id: Ulid,
        at: Ms,
    },
    SelectInvoices {
        stay_id: Option<Ulid>,
    },
}

// ── Column allow-lists ────────────────────────────────────────

const USER_INSERT: &[&str] = &["id", "email", "name", "role", "permissions", "hotel_id"];
const USER_UPDATE: &[&str] = &["name", "email", "hotel_id", "role", "permissions", "blocked"];
const INVITATION_INSERT: &[&str] = &["id", "email", "role", "hotel_id"];
const STAY_INSERT: &[&str] = &["id", "client_id", "room_id", "start", "end", "status", "notes"];
const STAY_UPDATE: &[&str] = &["room_id", "client_id", "start", "end", "status", "notes"];
const PRICE_PERIOD_INSERT: &[&str] = &["id", "entity_type", "entity_id", "start", "end", "new_price"];
const PRICE_PERIOD_UPDATE: &[&str] = &["start", "end", "new_price"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = strip_prefix_ci(trimmed, "ACCEPT INVITATION ") {
        return parse_accept(rest);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `ACCEPT INVITATION '<id>' AS '<name>'`
fn parse_accept(rest: &str) -> Result<Command, SqlError> {
    let (id, rest) = take_quoted(rest.trim_start()).ok_or(SqlError::MissingColumn("invitation id"))?;
    let rest = strip_prefix_ci(rest.trim_start(), "AS ").ok_or(SqlError::MissingColumn("name"))?;
    let (name, rest) = take_quoted(rest.trim_start()).ok_or(SqlError::MissingColumn("name"))?;
    if !rest.trim().trim_end_matches(';').trim().is_empty() {
        return Err(SqlError::Parse(format!("unexpected trailing input: {}", rest.trim())));
    }
    let id = Ulid::from_string(&id).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
    Ok(Command::AcceptInvitation { id, name })
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Leading single-quoted literal, with `''` as an escaped quote.
fn take_quoted(s: &str) -> Option<(String, &str)> {
    let body = s.strip_prefix('\'')?;
    let mut out = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '\'' {
            out.push(c);
            continue;
        }
        if let Some((_, '\'')) = chars.peek() {
            out.push('\'');
            chars.next();
            continue;
        }
        return Some((out, &body[i + 1..]));
    }
    None
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT requires a column list".into()));
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            insert.columns.len(),
            values.len()
        )));
    }
    let row = Fields {
        table: table.clone(),
        cols: insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(values.iter())
            .collect(),
    };

    match table.as_str() {
        "users" => {
            row.allow(USER_INSERT)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                email: parse_string(row.require("email")?)?,
                name: parse_string(row.require("name")?)?,
                role: parse_string(row.require("role")?)?,
                permissions: row.get("permissions").map(parse_codes).transpose()?.unwrap_or_default(),
                hotel_id: row.get("hotel_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "invitations" => {
            row.allow(INVITATION_INSERT)?;
            Ok(Command::InsertInvitation {
                id: parse_ulid(row.require("id")?)?,
                email: parse_string(row.require("email")?)?,
                role: parse_string(row.require("role")?)?,
                hotel_id: row.get("hotel_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "stays" => {
            row.allow(STAY_INSERT)?;
            Ok(Command::InsertStay(NewStay {
                id: parse_ulid(row.require("id")?)?,
                client_id: parse_ulid(row.require("client_id")?)?,
                room_id: parse_ulid(row.require("room_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                status: row.get("status").map(parse_status).transpose()?.unwrap_or(StayStatus::Pending),
                notes: row.get("notes").map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        "price_periods" => {
            row.allow(PRICE_PERIOD_INSERT)?;
            Ok(Command::InsertPricePeriod(NewPricePeriod {
                id: parse_ulid(row.require("id")?)?,
                entity_type: parse_entity_type(row.require("entity_type")?)?,
                entity_id: parse_ulid(row.require("entity_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                new_price: parse_i64(row.require("new_price")?)?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let mut cols = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        cols.push((name, &assignment.value));
    }
    let set = Fields {
        table: table_name.clone(),
        cols,
    };

    match table_name.as_str() {
        "users" => {
            set.allow(USER_UPDATE)?;
            let patch = UserPatch {
                profile: UserUpdate {
                    name: set.get("name").map(parse_string).transpose()?,
                    email: set.get("email").map(parse_string).transpose()?,
                    hotel_id: set.get("hotel_id").map(parse_ulid_or_null).transpose()?,
                },
                role: set.get("role").map(parse_string).transpose()?,
                permissions: set.get("permissions").map(parse_codes).transpose()?,
                blocked: set.get("blocked").map(parse_bool).transpose()?,
            };
            Ok(Command::UpdateUser { id, patch })
        }
        "stays" => {
            set.allow(STAY_UPDATE)?;
            let update = StayUpdate {
                room_id: set.get("room_id").map(parse_ulid).transpose()?,
                client_id: set.get("client_id").map(parse_ulid).transpose()?,
                start: set.get("start").map(parse_i64).transpose()?,
                end: set.get("end").map(parse_i64).transpose()?,
                status: set.get("status").map(parse_status).transpose()?,
                notes: set.get("notes").map(parse_string_or_null).transpose()?,
            };
            Ok(Command::UpdateStay { id, update })
        }
        "price_periods" => {
            set.allow(PRICE_PERIOD_UPDATE)?;
            let update = PricePeriodUpdate {
                start: set.get("start").map(parse_i64).transpose()?,
                end: set.get("end").map(parse_i64).transpose()?,
                new_price: set.get("new_price").map(parse_i64).transpose()?,
            };
            Ok(Command::UpdatePricePeriod { id, update })
        }
        _ => Err(SqlError::UnknownTable(table_name)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "invitations" => Ok(Command::DeleteInvitation { id }),
        "stays" => Ok(Command::DeleteStay { id }),
        "price_periods" => Ok(Command::DeletePricePeriod { id }),
        "audit_log" => Ok(Command::DeleteAuditEntry { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut cols = Vec::new();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut cols)?;
    }
    let filters = Fields {
        table: table.clone(),
        cols,
    };

    match table.as_str() {
        "users" | "invitations" | "roles" | "permissions" | "audit_log" => {
            filters.allow(&[])?;
            Ok(match table.as_str() {
                "users" => Command::SelectUsers,
                "invitations" => Command::SelectInvitations,
                "roles" => Command::SelectRoles,
                "permissions" => Command::SelectPermissions,
                _ => Command::SelectAuditLog,
            })
        }
        "stays" => {
            filters.allow(&["room_id"])?;
            Ok(Command::SelectStays {
                room_id: filters.get("room_id").map(parse_ulid).transpose()?,
            })
        }
        "price_periods" => {
            filters.allow(&["entity_type", "entity_id"])?;
            Ok(Command::SelectPricePeriods {
                filter: PricePeriodFilter {
                    entity_type: filters.get("entity_type").map(parse_entity_type).transpose()?,
                    entity_id: filters.get("entity_id").map(parse_ulid).transpose()?,
                },
            })
        }
        "prices" => {
            filters.allow(&["entity_type", "entity_id", "at"])?;
            Ok(Command::SelectPrice {
                entity_type: parse_entity_type(
                    filters.get("entity_type").ok_or(SqlError::MissingFilter("entity_type"))?,
                )?,
                entity_id: parse_ulid(filters.get("entity_id").ok_or(SqlError::MissingFilter("entity_id"))?)?,
                at: parse_i64(filters.get("at").ok_or(SqlError::MissingFilter("at"))?)?,
            })
        }
        "invoices" => {
            filters.allow(&["stay_id"])?;
            Ok(Command::SelectInvoices {
                stay_id: filters.get("stay_id").map(parse_ulid).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` terms of an AND chain. Anything else is rejected
/// rather than silently ignored.
fn extract_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_eq_filters(left, out)?;
            extract_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => extract_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Named values of one INSERT row, SET list or WHERE clause.
struct Fields<'a> {
    table: String,
    cols: Vec<(String, &'a Expr)>,
}

impl<'a> Fields<'a> {
    /// Reject any column outside `allowed`, and duplicates.
    fn allow(&self, allowed: &[&str]) -> Result<(), SqlError> {
        for (i, (col, _)) in self.cols.iter().enumerate() {
            if !allowed.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(self.table.clone(), col.clone()));
            }
            if self.cols[..i].iter().any(|(c, _)| c == col) {
                return Err(SqlError::Parse(format!("column {col} given twice")));
            }
        }
        Ok(())
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cols.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<StayStatus, SqlError> {
    let s = parse_string(expr)?;
    StayStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown stay status: {s}")))
}

fn parse_entity_type(expr: &Expr) -> Result<EntityType, SqlError> {
    let s = parse_string(expr)?;
    EntityType::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown entity type: {s}")))
}

/// Permission codes as `'8001,8004'`, `'{8001,8004}'`, a single number, or
/// NULL / `''` for none.
fn parse_codes(expr: &Expr) -> Result<Vec<PermissionCode>, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Number(n, _)) => n.clone(),
        _ => parse_string(expr)?,
    };
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<PermissionCode>()
                .map_err(|e| SqlError::Parse(format!("bad permission code {s}: {e}")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// Column outside the table's allow-list.
    UnknownColumn(String, String),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(..) => "42703",
            SqlError::MissingColumn(_) => "23502",
            SqlError::MissingFilter(_) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "column {c} of {t} cannot be set or filtered"),
            SqlError::MissingColumn(col) => write!(f, "missing value: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
