use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// What an availability query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityTarget {
    Slot(Ulid),
    Place(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPlace {
        id: Ulid,
        name: Option<String>,
        hourly_rate: f64,
        daily_rate: Option<f64>,
    },
    DeletePlace {
        id: Ulid,
    },
    SelectPlaces,
    InsertSlot {
        id: Ulid,
        place_id: Ulid,
        label: Option<String>,
        /// `None` inherits the place's pricing.
        pricing: Option<Pricing>,
    },
    UpdateSlotStatus {
        id: Ulid,
        status: OperatorStatus,
    },
    DeleteSlot {
        id: Ulid,
    },
    SelectSlots {
        place_id: Ulid,
    },
    /// `slot_id = None` books whichever slot is free.
    InsertBooking {
        id: Ulid,
        place_id: Ulid,
        slot_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        vehicle: Vehicle,
    },
    RescheduleBooking {
        id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
        plate: Option<String>,
    },
    ConfirmBooking {
        id: Ulid,
        payment_method: String,
        transaction_id: Option<String>,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
        page: Page,
    },
    SelectAvailability {
        target: AvailabilityTarget,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectPrice {
        slot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectReport {
        place_id: Ulid,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = trimmed
        .get(..7)
        .filter(|p| p.eq_ignore_ascii_case("LISTEN "))
        .and_then(|_| trimmed.get(7..))
    {
        let channel = rest.trim().trim_end_matches(';').trim().to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

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

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the
/// table's default column order applies.
struct Row {
    table: &'static str,
    values: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

const PLACE_COLUMNS: &[&str] = &["id", "name", "hourly_rate", "daily_rate"];
const SLOT_COLUMNS: &[&str] = &["id", "place_id", "label", "hourly_rate", "daily_rate"];
const BOOKING_COLUMNS: &[&str] = &["id", "place_id", "slot_id", "start", "end", "plate", "vehicle_kind"];

fn insert_row(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let exprs = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => row.clone(),
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|i| i.value.to_lowercase()).collect()
    };
    if exprs.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), exprs.len()));
    }
    Ok(Row {
        table,
        values: columns.into_iter().zip(exprs).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    match insert_table_name(insert)?.as_str() {
        "places" => {
            let row = insert_row(insert, "places", PLACE_COLUMNS)?;
            Ok(Command::InsertPlace {
                id: parse_ulid_expr(row.required("id")?)?,
                name: opt(&row, "name", parse_string_or_null)?,
                hourly_rate: parse_f64_expr(row.required("hourly_rate")?)?,
                daily_rate: opt(&row, "daily_rate", parse_f64_or_null)?,
            })
        }
        "slots" => {
            let row = insert_row(insert, "slots", SLOT_COLUMNS)?;
            let hourly = opt(&row, "hourly_rate", parse_f64_or_null)?;
            let daily = opt(&row, "daily_rate", parse_f64_or_null)?;
            let pricing = match (hourly, daily) {
                (Some(hourly_rate), daily_rate) => Some(Pricing { hourly_rate, daily_rate }),
                (None, None) => None,
                (None, Some(_)) => return Err(SqlError::MissingColumn("slots", "hourly_rate")),
            };
            Ok(Command::InsertSlot {
                id: parse_ulid_expr(row.required("id")?)?,
                place_id: parse_ulid_expr(row.required("place_id")?)?,
                label: opt(&row, "label", parse_string_or_null)?,
                pricing,
            })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            let plate = parse_string_or_null(row.required("plate")?)?
                .ok_or(SqlError::MissingColumn("bookings", "plate"))?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(row.required("id")?)?,
                place_id: parse_ulid_expr(row.required("place_id")?)?,
                slot_id: opt(&row, "slot_id", parse_ulid_or_null)?,
                start: parse_i64_expr(row.required("start")?)?,
                end: parse_i64_expr(row.required("end")?)?,
                vehicle: Vehicle {
                    plate,
                    kind: opt(&row, "vehicle_kind", parse_string_or_null)?,
                },
            })
        }
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// Optional nullable column: absent and NULL both give `None`.
fn opt<T>(
    row: &Row,
    col: &str,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    row.get(col).map_or(Ok(None), parse)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((col, &a.value));
    }
    let get = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "slots" => {
            let value = get("status").ok_or(SqlError::MissingColumn("slots", "status"))?;
            let text = parse_string_expr(value)?;
            let status = OperatorStatus::parse(&text)
                .ok_or_else(|| SqlError::Parse(format!("unknown slot status: {text}")))?;
            Ok(Command::UpdateSlotStatus { id, status })
        }
        "bookings" => {
            if let Some(value) = get("status") {
                let text = parse_string_expr(value)?;
                return match BookingStatus::parse(&text) {
                    Some(BookingStatus::Confirmed) => Ok(Command::ConfirmBooking {
                        id,
                        payment_method: get("payment_method")
                            .map(parse_string_expr)
                            .transpose()?
                            .ok_or(SqlError::MissingColumn("bookings", "payment_method"))?,
                        transaction_id: get("transaction_id")
                            .map_or(Ok(None), parse_string_or_null)?,
                    }),
                    Some(BookingStatus::Cancelled) => Ok(Command::CancelBooking {
                        id,
                        reason: get("reason").map_or(Ok(None), parse_string_or_null)?,
                    }),
                    Some(BookingStatus::Completed) => Ok(Command::CheckOut { id }),
                    _ => Err(SqlError::Unsupported(format!("status = '{text}'"))),
                };
            }
            if let Some(value) = get("checked_in") {
                return if parse_bool(value)? {
                    Ok(Command::CheckIn { id })
                } else {
                    Err(SqlError::Unsupported("checked_in = false".into()))
                };
            }
            let start = get("start").map(parse_i64_expr).transpose()?;
            let end = get("end").map(parse_i64_expr).transpose()?;
            let plate = get("plate").map(parse_string_expr).transpose()?;
            if start.is_none() && end.is_none() && plate.is_none() {
                return Err(SqlError::Parse("nothing to update".into()));
            }
            Ok(Command::RescheduleBooking { id, start, end, plate })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "places" => Ok(Command::DeletePlace { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::CancelBooking { id, reason: None }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Flattened `a AND b AND ...` predicates of the form `column <op> value`.
struct Predicates<'a>(Vec<(String, BinaryOperator, &'a Expr)>);

impl<'a> Predicates<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Self {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut out);
        }
        Self(out)
    }

    fn find(&self, col: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(col, BinaryOperator::Eq).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, col: &str, op: BinaryOperator) -> Result<Option<Ms>, SqlError> {
        self.find(col, op).map(parse_i64_expr).transpose()
    }
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_predicates(left, out);
            collect_predicates(right, out);
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, op.clone(), right));
            }
        }
        _ => {}
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let preds = Predicates::from_selection(&select.selection);

    match table.as_str() {
        "places" => Ok(Command::SelectPlaces),
        "slots" => Ok(Command::SelectSlots {
            place_id: preds.ulid("place_id")?.ok_or(SqlError::MissingFilter("place_id"))?,
        }),
        "bookings" => {
            if let Some(id) = preds.ulid("id")? {
                return Ok(Command::SelectBooking { id });
            }
            let status = match preds.find("status", BinaryOperator::Eq) {
                Some(e) => {
                    let text = parse_string_expr(e)?;
                    Some(
                        BookingStatus::parse(&text)
                            .ok_or_else(|| SqlError::Parse(format!("unknown booking status: {text}")))?,
                    )
                }
                None => None,
            };
            let user_id = preds
                .find("user_id", BinaryOperator::Eq)
                .map(parse_string_expr)
                .transpose()?;
            let filter = BookingFilter {
                status,
                place_id: preds.ulid("place_id")?,
                slot_id: preds.ulid("slot_id")?,
                user_id,
                from: preds.i64("start", BinaryOperator::GtEq)?,
                to: preds.i64("end", BinaryOperator::LtEq)?,
            };
            Ok(Command::SelectBookings { filter, page: parse_page(query)? })
        }
        "availability" => {
            let target = match (preds.ulid("slot_id")?, preds.ulid("place_id")?) {
                (Some(slot), _) => AvailabilityTarget::Slot(slot),
                (None, Some(place)) => AvailabilityTarget::Place(place),
                (None, None) => return Err(SqlError::MissingFilter("slot_id or place_id")),
            };
            Ok(Command::SelectAvailability {
                target,
                start: preds
                    .i64("start", BinaryOperator::GtEq)?
                    .ok_or(SqlError::MissingFilter("start"))?,
                end: preds
                    .i64("end", BinaryOperator::LtEq)?
                    .ok_or(SqlError::MissingFilter("end"))?,
                min_duration: preds.i64("min_duration", BinaryOperator::Eq)?,
            })
        }
        "price" => Ok(Command::SelectPrice {
            slot_id: preds.ulid("slot_id")?.ok_or(SqlError::MissingFilter("slot_id"))?,
            start: preds
                .i64("start", BinaryOperator::Eq)?
                .ok_or(SqlError::MissingFilter("start"))?,
            end: preds
                .i64("end", BinaryOperator::Eq)?
                .ok_or(SqlError::MissingFilter("end"))?,
        }),
        "report" => Ok(Command::SelectReport {
            place_id: preds.ulid("place_id")?.ok_or(SqlError::MissingFilter("place_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_page(query: &ast::Query) -> Result<Page, SqlError> {
    let mut page = Page::default();
    match &query.limit_clause {
        None => {}
        Some(ast::LimitClause::LimitOffset { limit, offset, .. }) => {
            if let Some(limit) = limit {
                page.limit = parse_usize(limit)?;
            }
            if let Some(offset) = offset {
                page.offset = parse_usize(&offset.value)?;
            }
        }
        Some(ast::LimitClause::OffsetCommaLimit { offset, limit }) => {
            page.offset = parse_usize(offset)?;
            page.limit = parse_usize(limit)?;
        }
    }
    Ok(page)
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    Predicates::from_selection(selection)
        .ulid("id")?
        .ok_or(SqlError::MissingFilter("id"))
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid_expr(expr).map(Some) }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_string_expr(expr).map(Some) }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_f64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_f64_or_null(expr: &Expr) -> Result<Option<f64>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_f64_expr(expr).map(Some) }
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const ID2: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn id2() -> Ulid {
        Ulid::from_string(ID2).unwrap()
    }

    #[test]
    fn parse_insert_place() {
        let sql = format!("INSERT INTO places (id, name, hourly_rate, daily_rate) VALUES ('{ID}', 'Central', 2.5, 20)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPlace { id: id(), name: Some("Central".into()), hourly_rate: 2.5, daily_rate: Some(20.0) }
        );
    }

    #[test]
    fn parse_insert_place_positional() {
        let sql = format!("INSERT INTO places VALUES ('{ID}', NULL, 3)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPlace { id: id(), name: None, hourly_rate: 3.0, daily_rate: None }
        );
    }

    #[test]
    fn parse_insert_slot_inherits_pricing() {
        let sql = format!("INSERT INTO slots (id, place_id, label) VALUES ('{ID}', '{ID2}', 'B4')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertSlot { id: id(), place_id: id2(), label: Some("B4".into()), pricing: None }
        );
    }

    #[test]
    fn parse_insert_slot_with_pricing() {
        let sql = format!("INSERT INTO slots (id, place_id, hourly_rate, daily_rate) VALUES ('{ID}', '{ID2}', 4, 30)");
        match parse_sql(&sql).unwrap() {
            Command::InsertSlot { pricing, .. } => assert_eq!(pricing, Some(Pricing::with_daily(4.0, 30.0))),
            other => panic!("expected InsertSlot, got {other:?}"),
        }

        let sql = format!("INSERT INTO slots (id, place_id, daily_rate) VALUES ('{ID}', '{ID2}', 30)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("slots", "hourly_rate"))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, place_id, slot_id, start, "end", plate) VALUES ('{ID}', '{ID2}', '{ID2}', 1000, 2000, 'KA-01')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: id(),
                place_id: id2(),
                slot_id: Some(id2()),
                start: 1000,
                end: 2000,
                vehicle: Vehicle::plate("KA-01"),
            }
        );
    }

    #[test]
    fn parse_insert_booking_null_slot_is_quick_book() {
        let sql = format!(
            r#"INSERT INTO bookings (id, place_id, slot_id, start, "end", plate, vehicle_kind) VALUES ('{ID}', '{ID2}', NULL, 1000, 2000, 'KA-01', 'ev')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { slot_id, vehicle, .. } => {
                assert_eq!(slot_id, None);
                assert_eq!(vehicle.kind.as_deref(), Some("ev"));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_requires_plate() {
        let sql = format!(r#"INSERT INTO bookings (id, place_id, start, "end") VALUES ('{ID}', '{ID2}', 1000, 2000)"#);
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("bookings", "plate"))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = format!("INSERT INTO places (id, hourly_rate) VALUES ('{ID}', 1), ('{ID2}', 1)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_slot_status() {
        let sql = format!("UPDATE slots SET status = 'maintenance' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSlotStatus { id: id(), status: OperatorStatus::Maintenance }
        );
        let sql = format!("UPDATE slots SET status = 'available' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSlotStatus { id: id(), status: OperatorStatus::InService }
        );
        let sql = format!("UPDATE slots SET status = 'occupied' WHERE id = '{ID}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_booking_transitions() {
        let sql = format!("UPDATE bookings SET status = 'confirmed', payment_method = 'card', transaction_id = 'tx9' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ConfirmBooking { id: id(), payment_method: "card".into(), transaction_id: Some("tx9".into()) }
        );

        let sql = format!("UPDATE bookings SET status = 'cancelled', reason = 'rain' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelBooking { id: id(), reason: Some("rain".into()) }
        );

        let sql = format!("UPDATE bookings SET checked_in = true WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CheckIn { id: id() });

        let sql = format!("UPDATE bookings SET status = 'completed' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CheckOut { id: id() });

        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { id: id(), reason: None });
    }

    #[test]
    fn parse_confirm_requires_method() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("bookings", "payment_method"))
        ));
    }

    #[test]
    fn parse_reschedule() {
        let sql = format!(r#"UPDATE bookings SET start = 5000, "end" = 9000 WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RescheduleBooking { id: id(), start: Some(5000), end: Some(9000), plate: None }
        );
        let sql = format!("UPDATE bookings SET plate = 'NEW' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RescheduleBooking { id: id(), start: None, end: None, plate: Some("NEW".into()) }
        );
    }

    #[test]
    fn parse_update_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE bookings SET checked_in = true"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_delete_place_and_slot() {
        let sql = format!("DELETE FROM places WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeletePlace { id: id() });
        let sql = format!("DELETE FROM slots WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteSlot { id: id() });
    }

    #[test]
    fn parse_select_bookings_with_filters_and_page() {
        let sql = format!(
            r#"SELECT * FROM bookings WHERE status = 'pending' AND place_id = '{ID}' AND start >= 100 AND "end" <= 900 LIMIT 10 OFFSET 20"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings { filter, page } => {
                assert_eq!(filter.status, Some(BookingStatus::Pending));
                assert_eq!(filter.place_id, Some(id()));
                assert_eq!(filter.slot_id, None);
                assert_eq!((filter.from, filter.to), (Some(100), Some(900)));
                assert_eq!(page, Page { offset: 20, limit: 10 });
            }
            other => panic!("expected SelectBookings, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_defaults() {
        match parse_sql("SELECT * FROM bookings").unwrap() {
            Command::SelectBookings { filter, page } => {
                assert_eq!(filter, BookingFilter::default());
                assert_eq!(page, Page::default());
            }
            other => panic!("expected SelectBookings, got {other:?}"),
        }
        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectBooking { id: id() });
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(r#"SELECT * FROM availability WHERE slot_id = '{ID}' AND start >= 1000 AND "end" <= 2000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                target: AvailabilityTarget::Slot(id()),
                start: 1000,
                end: 2000,
                min_duration: None,
            }
        );

        let sql = format!(
            r#"SELECT * FROM availability WHERE (place_id = '{ID}' AND start >= 1000) AND "end" <= 2000 AND min_duration = 600"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                target: AvailabilityTarget::Place(id()),
                start: 1000,
                end: 2000,
                min_duration: Some(600),
            }
        );
    }

    #[test]
    fn parse_select_availability_needs_window() {
        let sql = format!("SELECT * FROM availability WHERE slot_id = '{ID}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_price_and_report() {
        let sql = format!(r#"SELECT * FROM price WHERE slot_id = '{ID}' AND start = 0 AND "end" = 7200000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectPrice { slot_id: id(), start: 0, end: 7_200_000 }
        );
        let sql = format!("SELECT * FROM report WHERE place_id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectReport { place_id: id() });
    }

    #[test]
    fn parse_select_slots_and_places() {
        let sql = format!("SELECT * FROM slots WHERE place_id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectSlots { place_id: id() });
        assert_eq!(parse_sql("SELECT * FROM places").unwrap(), Command::SelectPlaces);
    }

    #[test]
    fn parse_listen() {
        let sql = format!("LISTEN place_{ID};");
        assert_eq!(parse_sql(&sql).unwrap(), Command::Listen { channel: format!("place_{ID}") });
    }

    #[test]
    fn parse_multibyte_prefix_is_an_error_not_a_panic() {
        assert!(matches!(parse_sql("SELECTé * FROM places"), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql("LISTENé place"), Err(SqlError::Parse(_))));
        assert_eq!(
            parse_sql("listen  plätze").unwrap(),
            Command::Listen { channel: "plätze".into() }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
