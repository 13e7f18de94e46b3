use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertItem {
        id: Ulid,
        name: String,
    },
    DeleteItem {
        id: Ulid,
    },
    SelectItems,
    InsertUser {
        id: Ulid,
        login: String,
        full_name: String,
        role: Role,
        birth_date: Option<String>,
        gender: Option<String>,
    },
    DeleteUser {
        id: Ulid,
        role: Option<Role>,
    },
    SelectUsers {
        role: Role,
    },
    InsertSlot {
        id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// Generate a day's slots for an item from the configured schedule.
    InsertSchedule {
        item_id: Ulid,
        day: Ms,
    },
    DeleteSlot {
        id: Ulid,
    },
    SetSlotAvailable {
        id: Ulid,
        available: bool,
    },
    SetDayAvailable {
        day: Ms,
        available: bool,
    },
    SelectSlots {
        item_id: Ulid,
        day: Ms,
    },
    SelectAvailableDays {
        from: Ms,
        to: Ms,
    },
    InsertBooking {
        slot_id: Ulid,
        user_id: Ulid,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
        user_id: Ulid,
    },
    SelectBookings {
        user_id: Ulid,
    },
}

/// Which row shape a statement produces, decided without binding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Items,
    Users,
    Slots,
    AvailableDays,
    Bookings,
    BookingId,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_single(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape of a statement that may still contain `$N` placeholders.
pub fn result_shape(sql: &str) -> ResultShape {
    let Ok(stmt) = parse_single(sql) else {
        return ResultShape::None;
    };
    match &stmt {
        Statement::Insert(insert) if insert.returning.is_some() => ResultShape::BookingId,
        Statement::Query(query) => {
            let table = match query.body.as_ref() {
                SetExpr::Select(s) => s.from.first().and_then(|t| table_factor_name(&t.relation).ok()),
                _ => None,
            };
            match table.as_deref() {
                Some("items") => ResultShape::Items,
                Some("users") => ResultShape::Users,
                Some("slots") => ResultShape::Slots,
                Some("available_days") => ResultShape::AvailableDays,
                Some("bookings") => ResultShape::Bookings,
                _ => ResultShape::None,
            }
        }
        _ => ResultShape::None,
    }
}

fn parse_single(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

/// Column order used when an INSERT has no column list, and the number of
/// leading columns that must be given.
fn insert_columns(table: &str) -> Option<(&'static str, &'static [&'static str], usize)> {
    match table {
        "items" => Some(("items", &["id", "name"], 2)),
        "users" => Some((
            "users",
            &["id", "login", "full_name", "role", "birth_date", "gender"],
            3,
        )),
        "slots" => Some(("slots", &["id", "item_id", "start", "end"], 4)),
        "schedule" => Some(("schedule", &["item_id", "day"], 2)),
        "bookings" => Some(("bookings", &["slot_id", "user_id"], 2)),
        _ => None,
    }
}

/// One INSERT row with each value keyed by its column.
struct InsertRow(Vec<(String, Expr)>);

impl InsertRow {
    fn new(
        insert: &ast::Insert,
        table: &'static str,
        columns: &[&str],
        required: usize,
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        if values.len() < required {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        let names: Vec<String> = if insert.columns.is_empty() {
            if values.len() > columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
            return Err(SqlError::Unsupported(format!("column {table}.{unknown}")));
        }
        Ok(Self(names.into_iter().zip(values).collect()))
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let Some((label, columns, required)) = insert_columns(&table) else {
        return Err(SqlError::UnknownTable(table));
    };
    let row = InsertRow::new(insert, label, columns, required)?;

    match label {
        "items" => Ok(Command::InsertItem {
            id: parse_ulid_expr(row.require("id")?)?,
            name: parse_string_expr(row.require("name")?)?,
        }),
        "users" => {
            let role = match row.get("role") {
                Some(expr) => parse_role_expr(expr)?,
                None => Role::User,
            };
            Ok(Command::InsertUser {
                id: parse_ulid_expr(row.require("id")?)?,
                login: parse_string_expr(row.require("login")?)?,
                full_name: parse_string_expr(row.require("full_name")?)?,
                role,
                birth_date: row.get("birth_date").map(parse_string_or_null).transpose()?.flatten(),
                gender: row.get("gender").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "slots" => Ok(Command::InsertSlot {
            id: parse_ulid_expr(row.require("id")?)?,
            item_id: parse_ulid_expr(row.require("item_id")?)?,
            start: parse_i64_expr(row.require("start")?)?,
            end: parse_i64_expr(row.require("end")?)?,
        }),
        "schedule" => Ok(Command::InsertSchedule {
            item_id: parse_ulid_expr(row.require("item_id")?)?,
            day: parse_i64_expr(row.require("day")?)?,
        }),
        "bookings" => Ok(Command::InsertBooking {
            slot_id: parse_ulid_expr(row.require("slot_id")?)?,
            user_id: parse_ulid_expr(row.require("user_id")?)?,
            returning: insert.returning.is_some(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = parse_ulid_expr(filters.eq("id")?)?;

    match table.as_str() {
        "items" => Ok(Command::DeleteItem { id }),
        "users" => {
            let role = filters.eq_opt("role").map(parse_role_expr).transpose()?;
            Ok(Command::DeleteUser { id, role })
        }
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::DeleteBooking {
            id,
            user_id: parse_ulid_expr(filters.eq("user_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut available = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        match column.as_deref() {
            Some("available") => available = Some(parse_bool(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("SET {other}"))),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }
    let available = available.ok_or(SqlError::MissingFilter("available"))?;

    let filters = collect_filters(selection.as_ref())?;
    if let Some(id) = filters.eq_opt("id") {
        return Ok(Command::SetSlotAvailable {
            id: parse_ulid_expr(id)?,
            available,
        });
    }
    if let Some(day) = filters.eq_opt("day") {
        return Ok(Command::SetDayAvailable {
            day: parse_i64_expr(day)?,
            available,
        });
    }
    Err(SqlError::MissingFilter("id or day"))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&first.relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "items" => Ok(Command::SelectItems),
        "users" => Ok(Command::SelectUsers {
            role: parse_role_expr(filters.eq("role")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            item_id: parse_ulid_expr(filters.eq("item_id")?)?,
            day: parse_i64_expr(filters.eq("day")?)?,
        }),
        "available_days" => Ok(Command::SelectAvailableDays {
            from: parse_i64_expr(filters.get("day", ast::BinaryOperator::GtEq)?)?,
            to: parse_i64_expr(filters.get("day", ast::BinaryOperator::LtEq)?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            user_id: parse_ulid_expr(filters.eq("user_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `column <op> value` conjuncts of a WHERE clause.
struct Filters<'a>(Vec<(String, ast::BinaryOperator, &'a Expr)>);

impl<'a> Filters<'a> {
    fn get(&self, column: &'static str, op: ast::BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.0
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, v)| *v)
            .ok_or(SqlError::MissingFilter(column))
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column, ast::BinaryOperator::Eq)
    }

    fn eq_opt(&self, column: &'static str) -> Option<&'a Expr> {
        self.eq(column).ok()
    }
}

fn collect_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_conjuncts(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_conjuncts<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, out)?;
            collect_conjuncts(right, out)
        }
        Expr::BinaryOp { left, op, right } => match expr_column_name(left) {
            Some(column) => {
                out.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            None => Err(SqlError::Unsupported(format!("filter {expr}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_role_expr(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string_expr(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
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
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
