use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Parsed command from one input line.
#[derive(Debug, PartialEq)]
pub enum Command {
    Use {
        store: String,
    },
    InsertLocation {
        id: LocationId,
        name: String,
    },
    InsertChair {
        key: ChairKey,
        name: Option<String>,
    },
    InsertService {
        id: ServiceId,
        price_cents: i64,
        paid: bool,
        kind: ServiceKind,
    },
    LinkService {
        key: ChairKey,
        service_id: ServiceId,
    },
    InsertTournament {
        id: BlackoutId,
        name: Option<String>,
        start: Ms,
        end: Ms,
    },
    Reserve {
        user_id: UserId,
        key: ChairKey,
        start: Ms,
        end: Ms,
    },
    /// All rows of a multi-row insert; they must target one reservation.
    AttachServices {
        key: ChairKey,
        user_id: UserId,
        reservation_id: ReservationId,
        service_ids: Vec<ServiceId>,
    },
    AttachDrink {
        user_id: UserId,
        reservation_id: ReservationId,
        service_id: ServiceId,
        quantity: i64,
    },
    RecordUsage {
        reservation_id: ReservationId,
        hours: f64,
    },
    SelectLocations,
    SelectServices,
    /// All tournaments, or those overlapping a window.
    SelectTournaments {
        window: Option<(Ms, Ms)>,
    },
    SelectChairs {
        location_id: LocationId,
    },
    SelectAvailability {
        location_id: LocationId,
        chair_id: Option<ChairId>,
        start: Ms,
        end: Ms,
    },
    SelectReservation {
        id: ReservationId,
    },
    SelectReservations {
        key: ChairKey,
    },
    SelectUsageWindow {
        reservation_id: ReservationId,
        check_date: Ms,
    },
    SelectReservationServices {
        reservation_id: ReservationId,
    },
    SelectReservationDrinks {
        reservation_id: ReservationId,
    },
    SelectUnbookedServices {
        reservation_id: ReservationId,
    },
    SelectCharges {
        reservation_id: ReservationId,
    },
    SelectChairServices {
        key: ChairKey,
    },
    SelectUsageStats {
        key: ChairKey,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("USE ")) {
        let store = trimmed[4..].trim().trim_matches(';').trim().trim_matches('"').to_string();
        if store.is_empty() {
            return Err(SqlError::Parse("USE without store name".into()));
        }
        return Ok(Command::Use { store });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = columns_in_order(&table, &insert.columns, extract_insert_rows(insert)?)?;
    if table != "reservation_services" && rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row insert into {table}")));
    }
    let values = &rows[0];

    match table.as_str() {
        "locations" => {
            expect_arity("locations", values, 2)?;
            Ok(Command::InsertLocation {
                id: parse_u32(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "chairs" => {
            expect_arity("chairs", values, 2)?;
            let name = match values.get(2) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertChair {
                key: ChairKey::new(parse_u32(&values[0])?, parse_u32(&values[1])?),
                name,
            })
        }
        "services" => {
            expect_arity("services", values, 4)?;
            let kind = parse_string(&values[3])?;
            Ok(Command::InsertService {
                id: parse_u32(&values[0])?,
                price_cents: parse_i64(&values[1])?,
                paid: parse_bool(&values[2])?,
                kind: kind
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad service kind: {kind}")))?,
            })
        }
        "chair_services" => {
            expect_arity("chair_services", values, 3)?;
            Ok(Command::LinkService {
                key: ChairKey::new(parse_u32(&values[0])?, parse_u32(&values[1])?),
                service_id: parse_u32(&values[2])?,
            })
        }
        "tournaments" => {
            expect_arity("tournaments", values, 4)?;
            Ok(Command::InsertTournament {
                id: parse_u32(&values[0])?,
                name: parse_string_or_null(&values[1])?,
                start: parse_time(&values[2])?,
                end: parse_time(&values[3])?,
            })
        }
        "reservations" => {
            expect_arity("reservations", values, 5)?;
            Ok(Command::Reserve {
                user_id: parse_u64(&values[0])?,
                key: ChairKey::new(parse_u32(&values[1])?, parse_u32(&values[2])?),
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
            })
        }
        "reservation_services" => parse_attach_services(&rows),
        "reservation_drinks" => {
            expect_arity("reservation_drinks", values, 4)?;
            Ok(Command::AttachDrink {
                user_id: parse_u64(&values[0])?,
                reservation_id: parse_u64(&values[1])?,
                service_id: parse_u32(&values[2])?,
                quantity: parse_i64(&values[3])?,
            })
        }
        "usage_log" => {
            expect_arity("usage_log", values, 2)?;
            Ok(Command::RecordUsage {
                reservation_id: parse_u64(&values[0])?,
                hours: parse_f64(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Rows are `(location_id, chair_id, service_id, user_id, reservation_id)`.
fn parse_attach_services(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut target: Option<(ChairKey, UserId, ReservationId)> = None;
    let mut service_ids = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        expect_arity("reservation_services row", row, 5)?;
        let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let key = ChairKey::new(
            parse_u32(&row[0]).map_err(row_err)?,
            parse_u32(&row[1]).map_err(row_err)?,
        );
        let service_id = parse_u32(&row[2]).map_err(row_err)?;
        let user_id = parse_u64(&row[3]).map_err(row_err)?;
        let reservation_id = parse_u64(&row[4]).map_err(row_err)?;

        match target {
            None => target = Some((key, user_id, reservation_id)),
            Some(t) if t == (key, user_id, reservation_id) => {}
            Some(_) => {
                return Err(SqlError::Parse(format!(
                    "row {i}: all rows must target the same reservation"
                )));
            }
        }
        service_ids.push(service_id);
    }
    let (key, user_id, reservation_id) = target.ok_or(SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::AttachServices {
        key,
        user_id,
        reservation_id,
        service_ids,
    })
}

/// Column order each INSERT is read in. Only `chairs.name` may be left out.
fn table_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "locations" => &["id", "name"],
        "chairs" => &["location_id", "chair_id", "name"],
        "services" => &["id", "price_cents", "paid", "kind"],
        "chair_services" => &["location_id", "chair_id", "service_id"],
        "tournaments" => &["id", "name", "start", "end"],
        "reservations" => &["user_id", "location_id", "chair_id", "start", "end"],
        "reservation_services" => &["location_id", "chair_id", "service_id", "user_id", "reservation_id"],
        "reservation_drinks" => &["user_id", "reservation_id", "service_id", "amount"],
        "usage_log" => &["reservation_id", "hours"],
        _ => return None,
    })
}

/// Reorder VALUES rows from the statement's column list into `table_columns` order.
/// Without a column list, values are taken positionally.
fn columns_in_order(
    table: &str,
    columns: &[ast::Ident],
    rows: Vec<Vec<Expr>>,
) -> Result<Vec<Vec<Expr>>, SqlError> {
    let Some(expected) = table_columns(table) else {
        return Ok(rows);
    };
    if columns.is_empty() {
        return Ok(rows);
    }

    let given: Vec<String> = columns.iter().map(|c| c.value.to_lowercase()).collect();
    if let Some(unknown) = given.iter().find(|c| !expected.contains(&c.as_str())) {
        return Err(SqlError::Parse(format!("unknown column {unknown} in {table}")));
    }
    // Columns must cover a prefix of `expected`, each exactly once.
    let positions: Vec<usize> = expected
        .iter()
        .map_while(|col| given.iter().position(|g| g == col))
        .collect();
    if positions.len() != given.len() {
        return Err(SqlError::Parse(match expected.get(positions.len()) {
            Some(col) => format!("missing column {col} in {table}"),
            None => format!("repeated column in {table}"),
        }));
    }

    rows.into_iter()
        .map(|row| {
            if row.len() != given.len() {
                return Err(SqlError::Parse(format!(
                    "{} values for {} columns",
                    row.len(),
                    given.len()
                )));
            }
            Ok(positions.iter().map(|&i| row[i].clone()).collect())
        })
        .collect()
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let f = Filters(filters);

    match table.as_str() {
        "locations" => Ok(Command::SelectLocations),
        "services" => Ok(Command::SelectServices),
        "tournaments" => {
            let window = match (f.time("start")?, f.time("end")?) {
                (Some(start), Some(end)) => Some((start, end)),
                (None, None) => None,
                _ => return Err(SqlError::MissingFilter("start and end")),
            };
            Ok(Command::SelectTournaments { window })
        }
        "chairs" => Ok(Command::SelectChairs {
            location_id: f.require_u32("location_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            location_id: f.require_u32("location_id")?,
            chair_id: f.u32("chair_id")?,
            start: f.time("start")?.ok_or(SqlError::MissingFilter("start"))?,
            end: f.time("end")?.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "reservations" => match f.u64("id")? {
            Some(id) => Ok(Command::SelectReservation { id }),
            None => Ok(Command::SelectReservations { key: f.chair_key()? }),
        },
        "usage_window" => Ok(Command::SelectUsageWindow {
            reservation_id: f.require_u64("reservation_id")?,
            check_date: f
                .time("check_date")?
                .ok_or(SqlError::MissingFilter("check_date"))?,
        }),
        "reservation_services" => Ok(Command::SelectReservationServices {
            reservation_id: f.require_u64("reservation_id")?,
        }),
        "reservation_drinks" => Ok(Command::SelectReservationDrinks {
            reservation_id: f.require_u64("reservation_id")?,
        }),
        "unbooked_services" => Ok(Command::SelectUnbookedServices {
            reservation_id: f.require_u64("reservation_id")?,
        }),
        "charges" => Ok(Command::SelectCharges {
            reservation_id: f.require_u64("reservation_id")?,
        }),
        "chair_services" => Ok(Command::SelectChairServices { key: f.chair_key()? }),
        "usage_stats" => Ok(Command::SelectUsageStats { key: f.chair_key()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// `column op value` terms of an AND-only WHERE clause.
struct Filters(Vec<(String, ast::BinaryOperator, Expr)>);

impl Filters {
    /// Value compared to `col`. `start` matches `=` or `>=`, `end` matches `=` or `<=`.
    fn find(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find_map(|(c, op, value)| {
            let op_ok = match op {
                ast::BinaryOperator::Eq => true,
                ast::BinaryOperator::GtEq => col == "start",
                ast::BinaryOperator::LtEq => col == "end",
                _ => false,
            };
            (c == col && op_ok).then_some(value)
        })
    }

    fn u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.find(col).map(parse_u32).transpose()
    }

    fn u64(&self, col: &'static str) -> Result<Option<u64>, SqlError> {
        self.find(col).map(parse_u64).transpose()
    }

    fn time(&self, col: &'static str) -> Result<Option<Ms>, SqlError> {
        self.find(col).map(parse_time).transpose()
    }

    fn require_u32(&self, col: &'static str) -> Result<u32, SqlError> {
        self.u32(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn require_u64(&self, col: &'static str) -> Result<u64, SqlError> {
        self.u64(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn chair_key(&self) -> Result<ChairKey, SqlError> {
        Ok(ChairKey::new(
            self.require_u32("location_id")?,
            self.require_u32("chair_id")?,
        ))
    }
}

fn collect_filters(
    expr: &Expr,
    out: &mut Vec<(String, ast::BinaryOperator, Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, op.clone(), right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_arity(table: &'static str, values: &[Expr], at_least: usize) -> Result<(), SqlError> {
    if values.len() < at_least {
        return Err(SqlError::WrongArity(table, at_least, values.len()));
    }
    Ok(())
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

/// The operand of a unary minus, if `expr` is one.
fn negated(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Some(expr),
        _ => None,
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Some(inner) = negated(expr) {
        Ok(-parse_i64(inner)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Some(inner) = negated(expr) {
        Ok(-parse_f64(inner)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

/// A calendar day `'YYYY-MM-DD'` (midnight UTC) or epoch milliseconds.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        return date_to_ms(s).map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")));
    }
    parse_i64(expr)
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> Ms {
        date_to_ms(s).unwrap()
    }

    #[test]
    fn parse_use() {
        assert_eq!(
            parse_sql("USE sylt;").unwrap(),
            Command::Use { store: "sylt".into() }
        );
        assert_eq!(
            parse_sql("use amrum").unwrap(),
            Command::Use { store: "amrum".into() }
        );
    }

    #[test]
    fn parse_insert_location() {
        let cmd = parse_sql("INSERT INTO locations (id, name) VALUES (1, 'Nordstrand')").unwrap();
        assert_eq!(
            cmd,
            Command::InsertLocation { id: 1, name: "Nordstrand".into() }
        );
    }

    #[test]
    fn parse_insert_chair_name_optional() {
        let cmd = parse_sql("INSERT INTO chairs (location_id, chair_id) VALUES (1, 5)").unwrap();
        assert_eq!(cmd, Command::InsertChair { key: ChairKey::new(1, 5), name: None });

        let cmd =
            parse_sql("INSERT INTO chairs (location_id, chair_id, name) VALUES (1, 5, 'Korb 5')")
                .unwrap();
        assert_eq!(
            cmd,
            Command::InsertChair { key: ChairKey::new(1, 5), name: Some("Korb 5".into()) }
        );
    }

    #[test]
    fn parse_insert_service() {
        let sql = "INSERT INTO services (id, price_cents, paid, kind) VALUES (3, 450, false, 'drink')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertService {
                id: 3,
                price_cents: 450,
                paid: false,
                kind: ServiceKind::Drink,
            }
        );
        let bad = "INSERT INTO services (id, price_cents, paid, kind) VALUES (3, 450, false, 'boat')";
        assert!(parse_sql(bad).is_err());
    }

    #[test]
    fn parse_insert_tournament_with_dates() {
        let sql = r#"INSERT INTO tournaments (id, name, start, "end") VALUES (1, 'Cup', '2024-07-10', '2024-07-12')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertTournament {
                id: 1,
                name: Some("Cup".into()),
                start: day("2024-07-10"),
                end: day("2024-07-12"),
            }
        );
    }

    #[test]
    fn parse_reserve_accepts_dates_and_millis() {
        let sql = r#"INSERT INTO reservations (user_id, location_id, chair_id, start, "end") VALUES (42, 1, 5, '2024-07-01', 1720137600000)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Reserve {
                user_id: 42,
                key: ChairKey::new(1, 5),
                start: day("2024-07-01"),
                end: 1_720_137_600_000,
            }
        );
    }

    #[test]
    fn parse_reserve_bad_date() {
        let sql = r#"INSERT INTO reservations (user_id, location_id, chair_id, start, "end") VALUES (42, 1, 5, '2024-13-01', '2024-07-03')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_reserve_too_few_values() {
        let sql = "INSERT INTO reservations (user_id, location_id) VALUES (42, 1)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::WrongArity("reservations", 5, 2))
        ));
    }

    #[test]
    fn insert_columns_read_by_name() {
        let sql = r#"INSERT INTO reservations (location_id, chair_id, user_id, "end", start) VALUES (1, 5, 42, '2024-07-03', '2024-07-01')"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Reserve {
                user_id: 42,
                key: ChairKey::new(1, 5),
                start: day("2024-07-01"),
                end: day("2024-07-03"),
            }
        );

        let sql = "INSERT INTO reservation_drinks (amount, service_id, reservation_id, user_id) VALUES (2, 3, 7, 42)";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::AttachDrink { user_id: 42, reservation_id: 7, service_id: 3, quantity: 2 }
        ));
    }

    #[test]
    fn insert_columns_must_be_known_and_complete() {
        let unknown = "INSERT INTO locations (id, title) VALUES (1, 'a')";
        assert!(matches!(parse_sql(unknown), Err(SqlError::Parse(_))));

        let gap = r#"INSERT INTO reservations (location_id, chair_id, start, "end") VALUES (1, 5, 1, 2)"#;
        assert!(matches!(parse_sql(gap), Err(SqlError::Parse(_))));

        let repeated = "INSERT INTO locations (id, id) VALUES (1, 2)";
        assert!(matches!(parse_sql(repeated), Err(SqlError::Parse(_))));
        let repeated = "INSERT INTO locations (id, name, id) VALUES (1, 'a', 2)";
        assert!(matches!(parse_sql(repeated), Err(SqlError::Parse(_))));

        let short_row = "INSERT INTO locations (id, name) VALUES (1)";
        assert!(matches!(parse_sql(short_row), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_attach_services_batch() {
        let sql = "INSERT INTO reservation_services (location_id, chair_id, service_id, user_id, reservation_id) VALUES (1, 5, 1, 42, 7), (1, 5, 1, 42, 7), (1, 5, 2, 42, 7)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::AttachServices {
                key: ChairKey::new(1, 5),
                user_id: 42,
                reservation_id: 7,
                service_ids: vec![1, 1, 2],
            }
        );
    }

    #[test]
    fn parse_attach_services_mixed_targets_rejected() {
        let sql = "INSERT INTO reservation_services (location_id, chair_id, service_id, user_id, reservation_id) VALUES (1, 5, 1, 42, 7), (1, 5, 2, 42, 8)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_attach_drink_negative_amount() {
        let sql = "INSERT INTO reservation_drinks (user_id, reservation_id, service_id, amount) VALUES (42, 7, 3, -2)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::AttachDrink {
                user_id: 42,
                reservation_id: 7,
                service_id: 3,
                quantity: -2,
            }
        );
    }

    #[test]
    fn parse_record_usage() {
        let sql = "INSERT INTO usage_log (reservation_id, hours) VALUES (7, 3.5)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::RecordUsage { reservation_id: 7, hours: 3.5 }
        );
    }

    #[test]
    fn multi_row_insert_only_for_service_batches() {
        let sql = "INSERT INTO locations (id, name) VALUES (1, 'a'), (2, 'b')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = r#"SELECT * FROM availability WHERE location_id = 1 AND start >= '2024-07-03' AND "end" <= '2024-07-05'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                location_id: 1,
                chair_id: None,
                start: day("2024-07-03"),
                end: day("2024-07-05"),
            }
        );
    }

    #[test]
    fn parse_select_availability_single_chair() {
        let sql = r#"SELECT * FROM availability WHERE location_id = 1 AND chair_id = 5 AND start >= 0 AND "end" <= 1000"#;
        match parse_sql(sql).unwrap() {
            Command::SelectAvailability { chair_id, .. } => assert_eq!(chair_id, Some(5)),
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_missing_window() {
        let sql = "SELECT * FROM availability WHERE location_id = 1";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("start"))));
    }

    #[test]
    fn parse_select_tournaments() {
        assert_eq!(
            parse_sql("SELECT * FROM tournaments").unwrap(),
            Command::SelectTournaments { window: None }
        );
        let sql = r#"SELECT * FROM tournaments WHERE start >= '2024-07-01' AND "end" <= '2024-07-02'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectTournaments {
                window: Some((day("2024-07-01"), day("2024-07-02")))
            }
        );
    }

    #[test]
    fn parse_select_reservations_by_id_or_chair() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE id = 7").unwrap(),
            Command::SelectReservation { id: 7 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE location_id = 1 AND chair_id = 5").unwrap(),
            Command::SelectReservations { key: ChairKey::new(1, 5) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM reservations"),
            Err(SqlError::MissingFilter("location_id"))
        ));
    }

    #[test]
    fn parse_select_usage_window() {
        let sql = "SELECT * FROM usage_window WHERE reservation_id = 7 AND check_date = '2024-07-02'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectUsageWindow { reservation_id: 7, check_date: day("2024-07-02") }
        );
    }

    #[test]
    fn parse_select_per_reservation_tables() {
        for (table, expected) in [
            ("reservation_services", Command::SelectReservationServices { reservation_id: 7 }),
            ("reservation_drinks", Command::SelectReservationDrinks { reservation_id: 7 }),
            ("unbooked_services", Command::SelectUnbookedServices { reservation_id: 7 }),
            ("charges", Command::SelectCharges { reservation_id: 7 }),
        ] {
            let sql = format!("SELECT * FROM {table} WHERE reservation_id = 7");
            assert_eq!(parse_sql(&sql).unwrap(), expected, "{table}");
        }
    }

    #[test]
    fn parse_select_usage_stats() {
        let sql = "SELECT * FROM usage_stats WHERE location_id = 1 AND chair_id = 5";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectUsageStats { key: ChairKey::new(1, 5) }
        );
    }

    #[test]
    fn parse_or_filter_unsupported() {
        let sql = "SELECT * FROM chairs WHERE location_id = 1 OR location_id = 2";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM boats"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO boats (id) VALUES (1)"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_delete_unsupported() {
        assert!(matches!(
            parse_sql("DELETE FROM reservations WHERE id = 1"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
