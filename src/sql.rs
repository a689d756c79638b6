use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertTour {
        id: Ulid,
        base_price: Decimal,
        min_participants: u32,
        max_participants: Option<u32>,
    },
    UpsertResource {
        id: Ulid,
        name: String,
        total_quantity: u32,
        seats_per_unit: u32,
    },
    SetRequirement {
        tour_id: Ulid,
        resource_id: Ulid,
        quantity_needed: u32,
    },
    UpsertTemplate {
        template: AvailabilityTemplate,
    },
    UpdateTemplate {
        id: Ulid,
        update: TemplateUpdate,
    },
    DeleteTemplate {
        id: Ulid,
    },
    InsertSlot {
        id: Ulid,
        tour_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: Option<u32>,
    },
    UpdateSlot {
        id: Ulid,
        update: SlotUpdate,
    },
    CancelSlot {
        id: Ulid,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertBooking {
        booking: NewBooking,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        note: Option<String>,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    UpdateBookingContact {
        id: Ulid,
        update: BookingUpdate,
    },
    DeleteBooking {
        id: Ulid,
    },
    Generate {
        template_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        overwrite: bool,
        check_conflicts: bool,
    },
    PreviewGeneration {
        template_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    SelectQuote {
        tour_id: Option<Ulid>,
        slot_id: Ulid,
        participants: u32,
    },
    SelectSlotStats {
        slot_id: Ulid,
    },
    SelectSlotAudit {
        slot_id: Ulid,
    },
    SelectSlots {
        tour_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectBookingStats {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Slot(Ulid),
    Id(Ulid),
    Code(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_script(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Every statement of a semicolon-separated script, in order. Nothing is
/// returned unless all of them parse.
pub fn parse_script(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// default column order applies.
struct Row {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.fields.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn req(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    /// A column that is absent or NULL.
    fn opt(&self, col: &str) -> Option<&Expr> {
        self.get(col).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns): (&'static str, &[&'static str]) = match table.as_str() {
        "tours" => ("tours", &["id", "base_price", "min_participants", "max_participants"]),
        "resources" => ("resources", &["id", "name", "total_quantity", "seats_per_unit"]),
        "requirements" => ("requirements", &["tour_id", "resource_id", "quantity_needed"]),
        "templates" => (
            "templates",
            &["id", "tour_id", "weekdays", "day_start", "day_end", "slot_minutes", "break_minutes", "active"],
        ),
        "template_updates" => (
            "template_updates",
            &["template_id", "weekdays", "day_start", "day_end", "slot_minutes", "break_minutes", "active"],
        ),
        "slots" => ("slots", &["id", "tour_id", "date", "start", "end", "capacity"]),
        "slot_updates" => ("slot_updates", &["slot_id", "capacity", "notes"]),
        "slot_cancellations" => ("slot_cancellations", &["slot_id"]),
        "bookings" => (
            "bookings",
            &[
                "id",
                "slot_id",
                "participants",
                "customer_id",
                "customer_name",
                "customer_phone",
                "customer_email",
                "notes",
                "status",
            ],
        ),
        "booking_status" => ("booking_status", &["booking_id", "status", "note"]),
        "cancellations" => ("cancellations", &["booking_id", "reason"]),
        "booking_contacts" => (
            "booking_contacts",
            &["booking_id", "customer_name", "customer_phone", "customer_email"],
        ),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, table, columns)?;

    match table {
        "tours" => Ok(Command::UpsertTour {
            id: parse_ulid(row.req("id")?)?,
            base_price: parse_decimal(row.req("base_price")?)?,
            min_participants: row.opt("min_participants").map(parse_u32).transpose()?.unwrap_or(1),
            max_participants: row.opt("max_participants").map(parse_u32).transpose()?,
        }),
        "resources" => Ok(Command::UpsertResource {
            id: parse_ulid(row.req("id")?)?,
            name: parse_text(row.req("name")?)?,
            total_quantity: parse_u32(row.req("total_quantity")?)?,
            seats_per_unit: row.opt("seats_per_unit").map(parse_u32).transpose()?.unwrap_or(1),
        }),
        "requirements" => Ok(Command::SetRequirement {
            tour_id: parse_ulid(row.req("tour_id")?)?,
            resource_id: parse_ulid(row.req("resource_id")?)?,
            quantity_needed: parse_u32(row.req("quantity_needed")?)?,
        }),
        "templates" => Ok(Command::UpsertTemplate {
            template: AvailabilityTemplate {
                id: parse_ulid(row.req("id")?)?,
                tour_id: parse_ulid(row.req("tour_id")?)?,
                weekdays: parse_weekdays(row.req("weekdays")?)?,
                day_start: parse_time(row.req("day_start")?)?,
                day_end: parse_time(row.req("day_end")?)?,
                slot_duration_minutes: parse_u32(row.req("slot_minutes")?)?,
                break_duration_minutes: row.opt("break_minutes").map(parse_u32).transpose()?.unwrap_or(0),
                active: row.opt("active").map(parse_bool).transpose()?.unwrap_or(true),
            },
        }),
        "template_updates" => Ok(Command::UpdateTemplate {
            id: parse_ulid(row.req("template_id")?)?,
            update: TemplateUpdate {
                weekdays: row.opt("weekdays").map(parse_weekdays).transpose()?,
                day_start: row.opt("day_start").map(parse_time).transpose()?,
                day_end: row.opt("day_end").map(parse_time).transpose()?,
                slot_duration_minutes: row.opt("slot_minutes").map(parse_u32).transpose()?,
                break_duration_minutes: row.opt("break_minutes").map(parse_u32).transpose()?,
                active: row.opt("active").map(parse_bool).transpose()?,
            },
        }),
        "slots" => Ok(Command::InsertSlot {
            id: parse_ulid(row.req("id")?)?,
            tour_id: parse_ulid(row.req("tour_id")?)?,
            date: parse_date(row.req("date")?)?,
            start: parse_time(row.req("start")?)?,
            end: parse_time(row.req("end")?)?,
            capacity: row.opt("capacity").map(parse_u32).transpose()?,
        }),
        "slot_updates" => Ok(Command::UpdateSlot {
            id: parse_ulid(row.req("slot_id")?)?,
            update: SlotUpdate {
                total_capacity: row.opt("capacity").map(parse_u32).transpose()?,
                notes: row.opt("notes").map(parse_text).transpose()?,
            },
        }),
        "slot_cancellations" => Ok(Command::CancelSlot {
            id: parse_ulid(row.req("slot_id")?)?,
        }),
        "bookings" => {
            let customer = match row.opt("customer_id") {
                Some(e) => CustomerIdentity::Registered {
                    user_id: parse_text(e)?,
                },
                None => CustomerIdentity::Guest {
                    name: parse_text(row.opt("customer_name").ok_or(SqlError::MissingColumn("bookings", "customer_name"))?)?,
                    phone: parse_text(row.opt("customer_phone").ok_or(SqlError::MissingColumn("bookings", "customer_phone"))?)?,
                    email: row.opt("customer_email").map(parse_text).transpose()?,
                },
            };
            Ok(Command::InsertBooking {
                booking: NewBooking {
                    id: parse_ulid(row.req("id")?)?,
                    slot_id: parse_ulid(row.req("slot_id")?)?,
                    participants: parse_u32(row.req("participants")?)?,
                    customer,
                    notes: row.opt("notes").map(parse_text).transpose()?,
                    initial_status: row.opt("status").map(parse_status).transpose()?,
                },
            })
        }
        "booking_status" => Ok(Command::UpdateBookingStatus {
            id: parse_ulid(row.req("booking_id")?)?,
            status: parse_status(row.req("status")?)?,
            note: row.opt("note").map(parse_text).transpose()?,
        }),
        "cancellations" => Ok(Command::CancelBooking {
            id: parse_ulid(row.req("booking_id")?)?,
            reason: row.opt("reason").map(parse_text).transpose()?,
        }),
        "booking_contacts" => Ok(Command::UpdateBookingContact {
            id: parse_ulid(row.req("booking_id")?)?,
            update: BookingUpdate {
                customer_name: row.opt("customer_name").map(parse_text).transpose()?,
                customer_phone: row.opt("customer_phone").map(parse_text).transpose()?,
                customer_email: row.opt("customer_email").map(parse_text).transpose()?,
            },
        }),
        _ => unreachable!("table names are matched above"),
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&'static str],
) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    Ok(Row {
        table,
        fields: columns.into_iter().zip(values).collect(),
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "templates" => Ok(Command::DeleteTemplate { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Column comparisons joined by AND.
struct Filters(Vec<(String, Op, Expr)>);

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn find(&self, col: &str, op: Op) -> Option<&Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| e)
    }

    fn eq(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.find(col, Op::Eq).ok_or(SqlError::MissingFilter(col))
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Op, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, op, (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let f = Filters::collect(select.selection.as_ref())?;
    let date_bound = |op| f.find("date", op).map(parse_date).transpose();

    match table.as_str() {
        "generation" => Ok(Command::Generate {
            template_id: parse_ulid(f.eq("template_id")?)?,
            start_date: parse_date(f.eq("start_date")?)?,
            end_date: parse_date(f.eq("end_date")?)?,
            overwrite: f.find("overwrite", Op::Eq).map(parse_bool).transpose()?.unwrap_or(false),
            check_conflicts: f
                .find("check_conflicts", Op::Eq)
                .map(parse_bool)
                .transpose()?
                .unwrap_or(true),
        }),
        "generation_preview" => Ok(Command::PreviewGeneration {
            template_id: parse_ulid(f.eq("template_id")?)?,
            start_date: parse_date(f.eq("start_date")?)?,
            end_date: parse_date(f.eq("end_date")?)?,
        }),
        "quote" => Ok(Command::SelectQuote {
            tour_id: f.find("tour_id", Op::Eq).map(parse_ulid).transpose()?,
            slot_id: parse_ulid(f.eq("slot_id")?)?,
            participants: parse_u32(f.eq("participants")?)?,
        }),
        "slot_stats" => Ok(Command::SelectSlotStats {
            slot_id: parse_ulid(f.eq("slot_id")?)?,
        }),
        "slot_audit" => Ok(Command::SelectSlotAudit {
            slot_id: parse_ulid(f.eq("slot_id")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            tour_id: parse_ulid(f.eq("tour_id")?)?,
            from: date_bound(Op::GtEq)?,
            to: date_bound(Op::LtEq)?,
        }),
        "bookings" => {
            let filter = if let Some(e) = f.find("slot_id", Op::Eq) {
                BookingFilter::Slot(parse_ulid(e)?)
            } else if let Some(e) = f.find("id", Op::Eq) {
                BookingFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = f.find("code", Op::Eq) {
                BookingFilter::Code(parse_text(e)?)
            } else {
                return Err(SqlError::MissingFilter("slot_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "booking_stats" => Ok(Command::SelectBookingStats {
            from: date_bound(Op::GtEq)?,
            to: date_bound(Op::LtEq)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let f = Filters::collect(selection.as_ref())?;
    parse_ulid(f.eq("id")?)
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

/// The literal text of a string or number value.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    literal_text(expr)?
        .trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}")))
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
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

/// Comma list of ISO weekdays, e.g. `'1,3,5'`.
fn parse_weekdays(expr: &Expr) -> Result<WeekdaySet, SqlError> {
    let s = literal_text(expr)?;
    let mut days = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let d: u8 = part
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad weekday: {part}")))?;
        days.push(d);
    }
    WeekdaySet::from_days(&days)
        .ok_or_else(|| SqlError::Parse(format!("weekdays must be between 1 and 7: {s}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    literal_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
