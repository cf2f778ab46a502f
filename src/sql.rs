use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
    },
    UpdateRoom {
        id: Ulid,
        name: String,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    UpdateUserRole {
        id: Ulid,
        role: Role,
    },
    /// One request: every VALUES row is one date of the same slot.
    InsertBookings {
        room_id: Ulid,
        dates: Vec<NaiveDate>,
        window: TimeWindow,
        kind: BookingType,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
    UpdateSettings {
        patch: SettingsPatch,
    },
    SelectRooms,
    SelectUsers,
    SelectSettings,
    SelectBookings {
        filter: BookingFilter,
    },
    SelectConflicts {
        room_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    },
    SelectQueue {
        room_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Room { room_id: Ulid, date: Option<NaiveDate> },
    User(Ulid),
    Id(Ulid),
    /// No WHERE clause: the session user's own bookings.
    Mine,
}

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    parse_statement(&stmts[0])
}

/// Parse every `;`-separated statement of a simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const ROOM_COLUMNS: &[&str] = &["id", "name"];
const USER_COLUMNS: &[&str] = &["id", "name", "email", "role"];
const BOOKING_COLUMNS: &[&str] = &["room_id", "date", "start_time", "end_time", "type"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rooms" => {
            let row = single_row(named_rows(insert, ROOM_COLUMNS)?)?;
            Ok(Command::InsertRoom {
                id: optional_id(&row)?,
                name: parse_string_expr(required(&row, "name")?)?,
            })
        }
        "users" => {
            let row = single_row(named_rows(insert, USER_COLUMNS)?)?;
            let role = match row.get("role") {
                Some(expr) => parse_role_expr(expr)?,
                None => Role::User,
            };
            Ok(Command::InsertUser {
                id: optional_id(&row)?,
                name: parse_string_expr(required(&row, "name")?)?,
                email: parse_string_expr(required(&row, "email")?)?,
                role,
            })
        }
        "bookings" => parse_insert_bookings(named_rows(insert, BOOKING_COLUMNS)?),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_insert_bookings(rows: Vec<HashMap<String, Expr>>) -> Result<Command, SqlError> {
    let mut slot: Option<(Ulid, TimeWindow, BookingType)> = None;
    let mut dates = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let room_id = parse_ulid_expr(required(row, "room_id")?).map_err(at_row)?;
        let date = parse_date_expr(required(row, "date")?).map_err(at_row)?;
        let start = parse_time_expr(required(row, "start_time")?).map_err(at_row)?;
        let end = parse_time_expr(required(row, "end_time")?).map_err(at_row)?;
        let kind = match row.get("type") {
            Some(expr) => BookingType::parse_lenient(&parse_string_expr(expr).map_err(at_row)?),
            None => BookingType::Booking,
        };
        let window = TimeWindow::try_new(start, end).ok_or_else(|| {
            SqlError::Invalid(format!("row {i}: end_time must be after start_time"))
        })?;

        match slot {
            None => slot = Some((room_id, window, kind)),
            Some(first) if first != (room_id, window, kind) => {
                return Err(SqlError::Invalid(format!(
                    "row {i}: every row of one request must share room, times and type"
                )));
            }
            Some(_) => {}
        }
        dates.push(date);
    }

    let (room_id, window, kind) = slot.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::InsertBookings {
        room_id,
        dates,
        window,
        kind,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set: HashMap<String, &Expr> = HashMap::new();
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.insert(column, &a.value);
    }

    match table.as_str() {
        "rooms" => {
            let id = extract_where_id(selection)?;
            let name = set.get("name").ok_or(SqlError::MissingColumn("name"))?;
            Ok(Command::UpdateRoom {
                id,
                name: parse_string_expr(name)?,
            })
        }
        "users" => {
            let id = extract_where_id(selection)?;
            let role = set.get("role").ok_or(SqlError::MissingColumn("role"))?;
            Ok(Command::UpdateUserRole {
                id,
                role: parse_role_expr(role)?,
            })
        }
        "bookings" => {
            let id = extract_where_id(selection)?;
            let status = set.get("status").ok_or(SqlError::MissingColumn("status"))?;
            let raw = parse_string_expr(status)?;
            let status =
                BookingStatus::parse(&raw).ok_or_else(|| SqlError::Invalid(format!("unknown status: {raw}")))?;
            let reason = match set.get("cancellation_reason") {
                Some(expr) => parse_nullable_string_expr(expr)?,
                None => None,
            };
            Ok(Command::UpdateBookingStatus { id, status, reason })
        }
        "settings" => {
            let mut patch = SettingsPatch::default();
            for (column, expr) in &set {
                match column.as_str() {
                    "maintenance_mode" => patch.maintenance_mode = Some(parse_bool_expr(expr)?),
                    "maintenance_message" => {
                        patch.maintenance_message = Some(parse_nullable_string_expr(expr)?)
                    }
                    "working_hours_start" => patch.working_hours_start = Some(parse_time_expr(expr)?),
                    "working_hours_end" => patch.working_hours_end = Some(parse_time_expr(expr)?),
                    "working_hours_enabled" => patch.working_hours_enabled = Some(parse_bool_expr(expr)?),
                    other => return Err(SqlError::Invalid(format!("unknown setting: {other}"))),
                }
            }
            Ok(Command::UpdateSettings { patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom {
            id: extract_where_id(&delete.selection)?,
        }),
        // Bookings are never deleted; they are cancelled.
        "bookings" => Err(SqlError::Unsupported(
            "DELETE FROM bookings; use UPDATE bookings SET status = 'cancelled'".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "users" => Ok(Command::SelectUsers),
        "settings" => Ok(Command::SelectSettings),
        "bookings" => {
            let filter = if let Some(id) = filters.get("id") {
                BookingFilter::Id(parse_ulid_expr(id)?)
            } else if let Some(user_id) = filters.get("user_id") {
                BookingFilter::User(parse_ulid_expr(user_id)?)
            } else if let Some(room_id) = filters.get("room_id") {
                BookingFilter::Room {
                    room_id: parse_ulid_expr(room_id)?,
                    date: filters.get("date").map(parse_date_expr).transpose()?,
                }
            } else {
                BookingFilter::Mine
            };
            Ok(Command::SelectBookings { filter })
        }
        "conflicts" | "queue" => {
            let room_id = parse_ulid_expr(filters.get("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?;
            let date = parse_date_expr(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?;
            let start = parse_time_expr(filters.get("start_time").ok_or(SqlError::MissingFilter("start_time"))?)?;
            let end = parse_time_expr(filters.get("end_time").ok_or(SqlError::MissingFilter("end_time"))?)?;
            let window = TimeWindow::try_new(start, end)
                .ok_or_else(|| SqlError::Invalid("end_time must be after start_time".into()))?;
            if table == "conflicts" {
                Ok(Command::SelectConflicts { room_id, date, window })
            } else {
                Ok(Command::SelectQueue { room_id, date, window })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` pairs joined by AND.
fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref().clone());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// VALUES rows keyed by column. Without a column list, values are taken
/// positionally in `default_columns` order.
fn named_rows(insert: &ast::Insert, default_columns: &'static [&'static str]) -> Result<Vec<HashMap<String, Expr>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    for col in &columns {
        if !default_columns.contains(&col.as_str()) {
            return Err(SqlError::Invalid(format!("unknown column: {col}")));
        }
    }

    extract_all_insert_rows(insert)?
        .into_iter()
        .map(|row| {
            if row.len() > columns.len() {
                return Err(SqlError::WrongArity("VALUES row", columns.len(), row.len()));
            }
            Ok(columns.iter().cloned().zip(row).collect())
        })
        .collect()
}

fn single_row(mut rows: Vec<HashMap<String, Expr>>) -> Result<HashMap<String, Expr>, SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT for this table".into()));
    }
    Ok(rows.remove(0))
}

fn required<'a>(row: &'a HashMap<String, Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(column).ok_or(SqlError::MissingColumn(column))
}

/// Explicit `id` if given, otherwise a fresh one.
fn optional_id(row: &HashMap<String, Expr>) -> Result<Ulid, SqlError> {
    match row.get("id") {
        Some(expr) if !is_null(expr) => parse_ulid_expr(expr),
        _ => Ok(Ulid::new()),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_nullable_string_expr(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date (want YYYY-MM-DD): {s}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_time_of_day(&s).ok_or_else(|| SqlError::Parse(format!("bad time (want HH:MM): {s}")))
}

fn parse_role_expr(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string_expr(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Invalid(format!("unknown role: {s}")))
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    /// Well-formed SQL with values the booking model rejects.
    Invalid(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::Invalid(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
