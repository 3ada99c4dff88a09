use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Reported payment result for a held booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    Failed,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSettings,
    UpdateSettings {
        changes: Vec<SettingsChange>,
    },
    InsertSeason {
        id: Ulid,
        name: Option<String>,
        range: DateRange,
        nightly_rate: Decimal,
        active: bool,
    },
    UpdateSeason {
        id: Ulid,
        patch: SeasonPatch,
    },
    DeleteSeason {
        id: Ulid,
    },
    SelectSeasons,
    SelectQuote {
        range: DateRange,
        guests: u32,
        pets: Option<bool>,
    },
    InsertHold {
        id: Ulid,
        range: DateRange,
        guests: u32,
        pets: bool,
        contact: GuestContact,
    },
    DeleteHold {
        id: Ulid,
    },
    SelectHolds,
    InsertPayment {
        booking_id: Ulid,
        outcome: PaymentOutcome,
    },
    SelectBookings {
        id: Option<Ulid>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectCalendar {
        start: NaiveDate,
        end: NaiveDate,
    },
    InsertInvoice {
        id: Ulid,
        booking_id: Ulid,
        kind: InvoiceKind,
    },
    UpdateInvoiceStatus {
        id: Ulid,
        status: InvoiceStatus,
    },
    SelectInvoices {
        id: Option<Ulid>,
        booking_id: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (id, name, start, "end", nightly_rate [, active])
        "seasons" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("seasons", 5, values.len()));
            }
            let (start, end) = (parse_date(&values[2])?, parse_date(&values[3])?);
            Ok(Command::InsertSeason {
                id: parse_ulid(&values[0])?,
                name: parse_string_or_null(&values[1])?,
                range: DateRange { start, end },
                nightly_rate: parse_decimal(&values[4])?,
                active: if values.len() >= 6 {
                    parse_bool(&values[5])?
                } else {
                    true
                },
            })
        }
        // (id, check_in, check_out, guests [, pets [, name [, email [, phone]]]])
        "holds" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("holds", 4, values.len()));
            }
            let (start, end) = (parse_date(&values[1])?, parse_date(&values[2])?);
            let contact = GuestContact {
                name: opt_field(&values, 5)?,
                email: opt_field(&values, 6)?,
                phone: opt_field(&values, 7)?,
            };
            Ok(Command::InsertHold {
                id: parse_ulid(&values[0])?,
                range: DateRange { start, end },
                guests: parse_u32(&values[3])?,
                pets: if values.len() >= 5 {
                    parse_bool(&values[4])?
                } else {
                    false
                },
                contact,
            })
        }
        // (booking_id, outcome)
        "payments" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("payments", 2, values.len()));
            }
            let outcome = match parse_string(&values[1])?.as_str() {
                "confirmed" => PaymentOutcome::Confirmed,
                "failed" => PaymentOutcome::Failed,
                other => return Err(SqlError::Parse(format!("bad payment outcome: {other}"))),
            };
            Ok(Command::InsertPayment {
                booking_id: parse_ulid(&values[0])?,
                outcome,
            })
        }
        // (id, booking_id [, kind])
        "invoices" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("invoices", 2, values.len()));
            }
            let kind = if values.len() >= 3 {
                let s = parse_string(&values[2])?;
                InvoiceKind::parse(&s)
                    .ok_or_else(|| SqlError::Parse(format!("bad invoice kind: {s}")))?
            } else {
                InvoiceKind::Invoice
            };
            Ok(Command::InsertInvoice {
                id: parse_ulid(&values[0])?,
                booking_id: parse_ulid(&values[1])?,
                kind,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "seasons" => Ok(Command::DeleteSeason { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    match table.as_str() {
        // The settings table is a single logical row; no WHERE needed.
        "settings" => {
            let mut changes = Vec::with_capacity(assignments.len());
            for a in assignments {
                let col = assignment_column(a)
                    .ok_or_else(|| SqlError::Parse("bad assignment target".into()))?;
                let change = match col.as_str() {
                    "default_nightly_rate" => {
                        SettingsChange::DefaultNightlyRate(parse_decimal(&a.value)?)
                    }
                    "cleaning_fee" => SettingsChange::CleaningFee(parse_decimal(&a.value)?),
                    "pet_cleaning_fee" => SettingsChange::PetCleaningFee(parse_decimal(&a.value)?),
                    "extra_guest_fee" => SettingsChange::ExtraGuestFee(parse_decimal(&a.value)?),
                    "extra_guest_threshold" => {
                        SettingsChange::ExtraGuestThreshold(parse_u32(&a.value)?)
                    }
                    "tourist_tax" => SettingsChange::TouristTax(parse_decimal(&a.value)?),
                    "tax_cap_nights" => SettingsChange::TaxCapNights(parse_u32_or_null(&a.value)?),
                    "max_guests" => SettingsChange::MaxGuests(parse_u32(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("unknown settings column: {other}")));
                    }
                };
                changes.push(change);
            }
            Ok(Command::UpdateSettings { changes })
        }
        "seasons" => {
            let id = extract_where_id(selection)?;
            let mut patch = SeasonPatch::default();
            for a in assignments {
                let col = assignment_column(a)
                    .ok_or_else(|| SqlError::Parse("bad assignment target".into()))?;
                match col.as_str() {
                    "name" => patch.name = Some(parse_string_or_null(&a.value)?),
                    "start" => patch.start = Some(parse_date(&a.value)?),
                    "end" => patch.end = Some(parse_date(&a.value)?),
                    "nightly_rate" => patch.nightly_rate = Some(parse_decimal(&a.value)?),
                    "active" => patch.active = Some(parse_bool(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("unknown seasons column: {other}")));
                    }
                }
            }
            Ok(Command::UpdateSeason { id, patch })
        }
        // Only the status column moves on bookings and invoices.
        "bookings" => {
            let id = extract_where_id(selection)?;
            let s = single_status_assignment(assignments, "bookings")?;
            let status = BookingStatus::parse(&s)
                .ok_or_else(|| SqlError::Parse(format!("bad booking status: {s}")))?;
            Ok(Command::UpdateBookingStatus { id, status })
        }
        "invoices" => {
            let id = extract_where_id(selection)?;
            let s = single_status_assignment(assignments, "invoices")?;
            let status = InvoiceStatus::parse(&s)
                .ok_or_else(|| SqlError::Parse(format!("bad invoice status: {s}")))?;
            Ok(Command::UpdateInvoiceStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_status_assignment(
    assignments: &[ast::Assignment],
    table: &'static str,
) -> Result<String, SqlError> {
    match assignments {
        [a] if assignment_column(a).as_deref() == Some("status") => parse_string(&a.value),
        _ => Err(SqlError::Unsupported(format!(
            "{table}: only status can be updated"
        ))),
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

    match table.as_str() {
        "settings" => Ok(Command::SelectSettings),
        "seasons" => Ok(Command::SelectSeasons),
        "holds" => Ok(Command::SelectHolds),
        "quotes" => {
            let mut f = QuoteFilters::default();
            if let Some(selection) = &select.selection {
                extract_quote_filters(selection, &mut f)?;
            }
            let start = f.check_in.ok_or(SqlError::MissingFilter("check_in"))?;
            let end = f.check_out.ok_or(SqlError::MissingFilter("check_out"))?;
            Ok(Command::SelectQuote {
                range: DateRange { start, end },
                guests: f.guests.ok_or(SqlError::MissingFilter("guests"))?,
                pets: f.pets,
            })
        }
        "bookings" => {
            let id = extract_optional_where_id(&select.selection, "id")?;
            Ok(Command::SelectBookings { id })
        }
        "calendar" => {
            let (mut start, mut end) = (None, None);
            if let Some(selection) = &select.selection {
                extract_calendar_filters(selection, &mut start, &mut end)?;
            }
            Ok(Command::SelectCalendar {
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "invoices" => {
            let id = extract_optional_where_id(&select.selection, "id")?;
            let booking_id = extract_optional_where_id(&select.selection, "booking_id")?;
            Ok(Command::SelectInvoices { id, booking_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct QuoteFilters {
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
    guests: Option<u32>,
    pets: Option<bool>,
}

fn extract_quote_filters(expr: &Expr, f: &mut QuoteFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_quote_filters(left, f)?;
                extract_quote_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("check_in") => f.check_in = Some(parse_date(right)?),
                Some("check_out") => f.check_out = Some(parse_date(right)?),
                Some("guests") => f.guests = Some(parse_u32(right)?),
                Some("pets") => f.pets = Some(parse_bool(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn extract_calendar_filters(
    expr: &Expr,
    start: &mut Option<NaiveDate>,
    end: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_calendar_filters(left, start, end)?;
                extract_calendar_filters(right, start, end)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_date(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Find `column = '<ulid>'` anywhere in an AND chain, if present.
fn extract_optional_where_id(
    selection: &Option<Expr>,
    column: &str,
) -> Result<Option<Ulid>, SqlError> {
    fn walk(expr: &Expr, column: &str, out: &mut Option<Ulid>) -> Result<(), SqlError> {
        if let Expr::BinaryOp { left, op, right } = expr {
            match op {
                ast::BinaryOperator::And => {
                    walk(left, column, out)?;
                    walk(right, column, out)?;
                }
                ast::BinaryOperator::Eq => {
                    if expr_column_name(left).as_deref() == Some(column) {
                        *out = Some(parse_ulid(right)?);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
    let mut out = None;
    if let Some(sel) = selection {
        walk(sel, column, &mut out)?;
    }
    Ok(out)
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

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Dates always arrive as 'YYYY-MM-DD' literals.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad date: {e}"))),
            _ => Err(SqlError::Parse(format!("expected date, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad decimal: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_decimal(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_u32(expr)?)),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        Ok(s.clone())
    } else {
        Err(SqlError::Parse(format!("expected string, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::Parse(format!(
            "expected string or NULL, got {expr:?}"
        ))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Optional trailing VALUES column: absent or NULL both mean none.
fn opt_field(values: &[Expr], idx: usize) -> Result<Option<String>, SqlError> {
    match values.get(idx) {
        Some(expr) => parse_string_or_null(expr),
        None => Ok(None),
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
        }
    }
}

impl std::error::Error for SqlError {}
