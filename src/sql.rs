use std::collections::HashMap;
use std::ops::ControlFlow;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan, visit_expressions, visit_expressions_mut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::ReservationFilter;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource(ResourceInfo),
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertClosure {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    DeleteClosure {
        id: Ulid,
    },
    InsertStaff(Staff),
    UpdateStaff {
        id: Ulid,
        patch: StaffPatch,
    },
    DeleteStaff {
        id: Ulid,
    },
    InsertReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    UpsertParticipants {
        reservation_id: Ulid,
        participants: Participants,
    },
    InsertProgram {
        reservation_id: Ulid,
        session: ProgramSession,
    },
    /// Every row of one INSERT; they commit together or not at all.
    InsertRoomAssignments {
        reservation_id: Ulid,
        assignments: Vec<RoomAssignment>,
    },
    InsertPlaceBooking {
        reservation_id: Ulid,
        booking: PlaceBooking,
    },
    InsertMeal {
        reservation_id: Ulid,
        order: MealOrder,
    },
    InsertLedgerItem {
        reservation_id: Ulid,
        item: LedgerItem,
    },
    InsertDocument {
        reservation_id: Ulid,
        document: Document,
    },
    InsertSurvey {
        reservation_id: Ulid,
        response: SurveyResponse,
    },
    DeleteEntry {
        kind: EntryKind,
        id: Ulid,
    },
    SelectResources {
        kind: Option<ResourceKind>,
    },
    SelectClosures {
        resource_id: Ulid,
    },
    SelectBookings {
        resource_id: Ulid,
    },
    SelectStaff {
        id: Option<Ulid>,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectParticipants {
        reservation_id: Ulid,
    },
    SelectEntries {
        kind: EntryKind,
        reservation_id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectVacancies {
        kind: ResourceKind,
        start: Ms,
        end: Ms,
    },
    SelectSettlement {
        reservation_id: Ulid,
    },
    SelectStaffPayments {
        reservation_id: Ulid,
    },
    SelectSatisfaction {
        form: FormKind,
        filter: ReservationFilter,
    },
    SelectEffect {
        form: FormKind,
        filter: ReservationFilter,
    },
    SelectOperations {
        filter: ReservationFilter,
    },
}

// ── Tables ────────────────────────────────────────────────────

const RESOURCE_COLUMNS: &[&str] = &["id", "kind", "name", "capacity", "buffer_after", "max_occupancy"];
const CLOSURE_COLUMNS: &[&str] = &["id", "resource_id", "start", "end", "reason"];
const STAFF_COLUMNS: &[&str] = &["id", "name", "role", "rate"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "group_name",
    "contact_name",
    "contact_phone",
    "category",
    "start_date",
    "end_date",
    "status",
    "hold_until",
    "notes",
];
const PARTICIPANT_COLUMNS: &[&str] = &[
    "reservation_id",
    "male",
    "female",
    "male_leaders",
    "female_leaders",
    "age_group",
    "participant_type",
];
const PROGRAM_COLUMNS: &[&str] = &[
    "id",
    "reservation_id",
    "name",
    "start",
    "end",
    "place_id",
    "instructor_id",
    "assistant_id",
    "helper_id",
    "headcount",
];
const ROOM_ASSIGNMENT_COLUMNS: &[&str] = &["id", "reservation_id", "room_id", "check_in", "check_out", "occupants"];
const PLACE_BOOKING_COLUMNS: &[&str] = &["id", "reservation_id", "place_id", "start", "end", "headcount", "purpose"];
const MEAL_COLUMNS: &[&str] = &["id", "reservation_id", "date", "meal", "headcount", "unit_price"];
const LEDGER_COLUMNS: &[&str] = &["id", "reservation_id", "kind", "phase", "category", "description", "amount"];
const DOCUMENT_COLUMNS: &[&str] = &["id", "reservation_id", "kind", "title", "issued_on"];
const SURVEY_COLUMNS: &[&str] = &["id", "reservation_id", "form", "phase", "subject", "sex", "age_group", "scores"];

/// Category given to reservations inserted without one.
pub const DEFAULT_CATEGORY: &str = "general";

fn table_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "resources" => RESOURCE_COLUMNS,
        "closures" => CLOSURE_COLUMNS,
        "staff" => STAFF_COLUMNS,
        "reservations" => RESERVATION_COLUMNS,
        "participants" => PARTICIPANT_COLUMNS,
        "programs" => PROGRAM_COLUMNS,
        "room_assignments" => ROOM_ASSIGNMENT_COLUMNS,
        "place_bookings" => PLACE_BOOKING_COLUMNS,
        "meals" => MEAL_COLUMNS,
        "ledger" => LEDGER_COLUMNS,
        "documents" => DOCUMENT_COLUMNS,
        "surveys" => SURVEY_COLUMNS,
        _ => return None,
    })
}

fn entry_table(table: &str) -> Option<EntryKind> {
    Some(match table {
        "programs" => EntryKind::Program,
        "room_assignments" => EntryKind::Room,
        "place_bookings" => EntryKind::Place,
        "meals" => EntryKind::Meal,
        "ledger" => EntryKind::Ledger,
        "documents" => EntryKind::Document,
        "surveys" => EntryKind::Survey,
        _ => return None,
    })
}

/// Translate a single statement; anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_sql_with_params(sql, &[])
}

/// Translate the first statement with its `$n` placeholders bound to
/// `params` (text format, `None` for NULL). Binding replaces placeholder
/// nodes in the parsed tree, so bound text is never re-read as SQL.
pub fn parse_sql_with_params(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmts =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let first = stmts.first_mut().ok_or(SqlError::Empty)?;
    let _ = visit_expressions_mut(first, |expr| {
        if let Expr::Value(ValueWithSpan { value, .. }) = expr
            && let Value::Placeholder(p) = &*value
            && let Some(bound) = placeholder_index(p).and_then(|i| params.get(i))
        {
            *value = match bound {
                Some(text) => Value::SingleQuotedString(text.clone()),
                None => Value::Null,
            };
        }
        ControlFlow::<()>::Continue(())
    });
    parse_statement(first)
}

/// Number of parameters a statement takes: its highest `$n`. Unparseable
/// SQL takes none.
pub fn placeholder_count(sql: &str) -> usize {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return 0;
    };
    let mut count = 0;
    let _ = visit_expressions(&stmts, |expr| {
        if let Some(Value::Placeholder(p)) = extract_value(expr)
            && let Some(i) = placeholder_index(p)
        {
            count = count.max(i + 1);
        }
        ControlFlow::<()>::Continue(())
    });
    count
}

/// `$3` is parameter index 2.
fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .strip_prefix('$')?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}

/// Translate every statement of a simple-query string. The whole batch is
/// rejected if any statement fails to translate.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
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

/// The relation a SELECT reads from, used to describe result columns
/// before any parameter is bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let known = table_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let all_rows = extract_all_insert_rows(insert)?;
    let rows = all_rows
        .iter()
        .map(|values| Row::new(&table, known, &columns, values))
        .collect::<Result<Vec<_>, _>>()?;

    if table == "room_assignments" {
        return room_assignments(&rows);
    }
    let [row] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    };

    match table.as_str() {
        "resources" => Ok(Command::InsertResource(ResourceInfo {
            id: row.ulid("id")?,
            kind: row.parsed("kind", ResourceKind::parse)?,
            name: row.text("name")?,
            capacity: row.count_or("capacity", 1)?,
            buffer_after: row.opt_int("buffer_after")?,
            max_occupancy: row.opt_count("max_occupancy")?,
        })),
        "closures" => Ok(Command::InsertClosure {
            id: row.ulid("id")?,
            resource_id: row.ulid("resource_id")?,
            span: row.span("start", "end")?,
            reason: row.opt_text("reason")?,
        }),
        "staff" => Ok(Command::InsertStaff(Staff {
            id: row.ulid("id")?,
            name: row.text("name")?,
            role: row.parsed("role", StaffRole::parse)?,
            rate: row.int("rate")?,
        })),
        "reservations" => Ok(Command::InsertReservation(NewReservation {
            id: row.ulid("id")?,
            group_name: row.text("group_name")?,
            contact_name: row.opt_text("contact_name")?,
            contact_phone: row.opt_text("contact_phone")?,
            category: row
                .opt_text("category")?
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            start_date: row.date("start_date")?,
            end_date: row.date("end_date")?,
            status: row
                .opt_parsed("status", ReservationStatus::parse)?
                .unwrap_or(ReservationStatus::Tentative),
            hold_until: row.opt_timestamp("hold_until")?,
            notes: row.opt_text("notes")?,
        })),
        "participants" => Ok(Command::UpsertParticipants {
            reservation_id: row.ulid("reservation_id")?,
            participants: Participants {
                male: row.count_or("male", 0)?,
                female: row.count_or("female", 0)?,
                male_leaders: row.count_or("male_leaders", 0)?,
                female_leaders: row.count_or("female_leaders", 0)?,
                age_group: row.opt_text("age_group")?,
                participant_type: row.opt_text("participant_type")?,
            },
        }),
        "programs" => Ok(Command::InsertProgram {
            reservation_id: row.ulid("reservation_id")?,
            session: ProgramSession {
                id: row.ulid("id")?,
                name: row.text("name")?,
                span: row.span("start", "end")?,
                place_id: row.opt_ulid("place_id")?,
                instructor_id: row.opt_ulid("instructor_id")?,
                assistant_id: row.opt_ulid("assistant_id")?,
                helper_id: row.opt_ulid("helper_id")?,
                headcount: row.count_or("headcount", 0)?,
            },
        }),
        "place_bookings" => Ok(Command::InsertPlaceBooking {
            reservation_id: row.ulid("reservation_id")?,
            booking: PlaceBooking {
                id: row.ulid("id")?,
                place_id: row.ulid("place_id")?,
                span: row.span("start", "end")?,
                headcount: row.count_or("headcount", 0)?,
                purpose: row.opt_text("purpose")?,
            },
        }),
        "meals" => Ok(Command::InsertMeal {
            reservation_id: row.ulid("reservation_id")?,
            order: MealOrder {
                id: row.ulid("id")?,
                date: row.date("date")?,
                meal: row.parsed("meal", Meal::parse)?,
                headcount: row.count("headcount")?,
                unit_price: row.int("unit_price")?,
            },
        }),
        "ledger" => Ok(Command::InsertLedgerItem {
            reservation_id: row.ulid("reservation_id")?,
            item: LedgerItem {
                id: row.ulid("id")?,
                kind: row.parsed("kind", LedgerKind::parse)?,
                phase: row.parsed("phase", LedgerPhase::parse)?,
                category: row.text("category")?,
                description: row.opt_text("description")?,
                amount: row.int("amount")?,
            },
        }),
        "documents" => Ok(Command::InsertDocument {
            reservation_id: row.ulid("reservation_id")?,
            document: Document {
                id: row.ulid("id")?,
                kind: row.text("kind")?,
                title: row.text("title")?,
                issued_on: row.opt_date("issued_on")?,
            },
        }),
        "surveys" => Ok(Command::InsertSurvey {
            reservation_id: row.ulid("reservation_id")?,
            response: SurveyResponse {
                id: row.ulid("id")?,
                form: row.parsed("form", FormKind::parse)?,
                phase: row.opt_parsed("phase", SurveyPhase::parse)?,
                subject: row.opt_text("subject")?,
                sex: row.opt_text("sex")?,
                age_group: row.opt_text("age_group")?,
                scores: row.scores("scores")?,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn room_assignments(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let mut reservation_id = None;
    let mut assignments = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let rid = row.ulid("reservation_id")?;
        if reservation_id.is_some_and(|first| first != rid) {
            return Err(SqlError::BadValue {
                column: "reservation_id".into(),
                reason: format!("row {i}: every row of one INSERT must share a reservation"),
            });
        }
        reservation_id = Some(rid);
        assignments.push(RoomAssignment {
            id: row.ulid("id")?,
            room_id: row.ulid("room_id")?,
            check_in: row.date("check_in")?,
            check_out: row.date("check_out")?,
            occupants: row.count_or("occupants", 0)?,
        });
    }
    let reservation_id = reservation_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::InsertRoomAssignments {
        reservation_id,
        assignments,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let known = match table.as_str() {
        "resources" | "staff" | "reservations" => table_columns(&table).unwrap_or_default(),
        _ if table_columns(&table).is_some() => {
            return Err(SqlError::Unsupported(format!("UPDATE on {table}")));
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let mut columns = Vec::with_capacity(assignments.len());
    let mut values = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        if column == "id" {
            return Err(SqlError::Unsupported("changing id".into()));
        }
        columns.push(column);
        values.push(assignment.value.clone());
    }
    let row = Row::new(&table, known, &columns, &values)?;

    match table.as_str() {
        "resources" => {
            if row.has("kind") {
                return Err(SqlError::Unsupported("changing a resource's kind".into()));
            }
            Ok(Command::UpdateResource {
                id,
                patch: ResourcePatch {
                    name: row.patch("name", Row::text)?,
                    capacity: row.patch("capacity", Row::count)?,
                    buffer_after: row.patch("buffer_after", Row::opt_int)?,
                    max_occupancy: row.patch("max_occupancy", Row::opt_count)?,
                },
            })
        }
        "staff" => Ok(Command::UpdateStaff {
            id,
            patch: StaffPatch {
                name: row.patch("name", Row::text)?,
                role: row.patch("role", |r, c| r.parsed(c, StaffRole::parse))?,
                rate: row.patch("rate", Row::int)?,
            },
        }),
        _ => Ok(Command::UpdateReservation {
            id,
            patch: ReservationPatch {
                group_name: row.patch("group_name", Row::text)?,
                contact_name: row.patch("contact_name", Row::opt_text)?,
                contact_phone: row.patch("contact_phone", Row::opt_text)?,
                category: row.patch("category", Row::text)?,
                start_date: row.patch("start_date", Row::date)?,
                end_date: row.patch("end_date", Row::date)?,
                status: row.patch("status", |r, c| r.parsed(c, ReservationStatus::parse))?,
                hold_until: row.patch("hold_until", Row::opt_timestamp)?,
                notes: row.patch("notes", Row::opt_text)?,
            },
        }),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    if let Some(kind) = entry_table(&table) {
        return Ok(Command::DeleteEntry { kind, id });
    }
    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "closures" => Ok(Command::DeleteClosure { id }),
        "staff" => Ok(Command::DeleteStaff { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        "participants" => Err(SqlError::Unsupported(
            "participants are replaced by INSERT, not deleted".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

const REPORT_FILTERS: &[&str] = &["reservation_id", "status", "start_date", "category"];

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let allowed: &[&str] = match table.as_str() {
        "resources" => &["kind"],
        "closures" | "bookings" => &["resource_id"],
        "staff" => &["id"],
        "reservations" => &["id", "status", "start_date", "category"],
        "availability" => &["resource_id", "start", "end", "min_duration"],
        "vacancies" => &["kind", "start", "end"],
        "settlement" | "staff_payments" => &["reservation_id"],
        "satisfaction_report" | "effect_report" => {
            &["form", "reservation_id", "status", "start_date", "category"]
        }
        "operations_summary" => REPORT_FILTERS,
        t if table_columns(t).is_some() => &["reservation_id"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }
    filters.check_columns(&table, allowed)?;

    if let Some(kind) = entry_table(&table) {
        return Ok(Command::SelectEntries {
            kind,
            reservation_id: filters.required_ulid("reservation_id")?,
        });
    }
    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            kind: filters.eq_parsed("kind", ResourceKind::parse)?,
        }),
        "closures" => Ok(Command::SelectClosures {
            resource_id: filters.required_ulid("resource_id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            resource_id: filters.required_ulid("resource_id")?,
        }),
        "staff" => Ok(Command::SelectStaff {
            id: filters.eq_ulid("id")?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            filter: filters.reservation_filter("id")?,
        }),
        "participants" => Ok(Command::SelectParticipants {
            reservation_id: filters.required_ulid("reservation_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: filters.required_ulid("resource_id")?,
            start: filters.required_bound("start", Bound::Lower)?,
            end: filters.required_bound("end", Bound::Upper)?,
            min_duration: filters.eq_int("min_duration")?,
        }),
        "vacancies" => Ok(Command::SelectVacancies {
            kind: filters
                .eq_parsed("kind", ResourceKind::parse)?
                .ok_or(SqlError::MissingFilter("kind"))?,
            start: filters.required_bound("start", Bound::Lower)?,
            end: filters.required_bound("end", Bound::Upper)?,
        }),
        "settlement" => Ok(Command::SelectSettlement {
            reservation_id: filters.required_ulid("reservation_id")?,
        }),
        "staff_payments" => Ok(Command::SelectStaffPayments {
            reservation_id: filters.required_ulid("reservation_id")?,
        }),
        "satisfaction_report" => Ok(Command::SelectSatisfaction {
            form: filters.required_form()?,
            filter: filters.reservation_filter("reservation_id")?,
        }),
        "effect_report" => Ok(Command::SelectEffect {
            form: filters.required_form()?,
            filter: filters.reservation_filter("reservation_id")?,
        }),
        "operations_summary" => Ok(Command::SelectOperations {
            filter: filters.reservation_filter("reservation_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bound {
    Lower,
    Upper,
}

/// Conjunction of `column <op> value` predicates from a WHERE clause.
#[derive(Debug, Default)]
struct Filters<'a> {
    preds: Vec<(String, Op, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => Op::Eq,
                    ast::BinaryOperator::GtEq => Op::GtEq,
                    ast::BinaryOperator::LtEq => Op::LtEq,
                    other => {
                        return Err(SqlError::Unsupported(format!(
                            "operator {other} (use =, >= or <=)"
                        )));
                    }
                };
                if let Some(col) = expr_column_name(left) {
                    self.preds.push((col, op, right.as_ref()));
                } else if let Some(col) = expr_column_name(right) {
                    let flipped = match op {
                        Op::GtEq => Op::LtEq,
                        Op::LtEq => Op::GtEq,
                        Op::Eq => Op::Eq,
                    };
                    self.preds.push((col, flipped, left.as_ref()));
                } else {
                    return Err(SqlError::Unsupported(format!("predicate {expr}")));
                }
                Ok(())
            }
            Expr::Between {
                expr: column,
                negated: false,
                low,
                high,
            } => {
                let col = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                self.preds.push((col.clone(), Op::GtEq, low.as_ref()));
                self.preds.push((col, Op::LtEq, high.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    fn check_columns(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.preds.iter().find(|(col, _, _)| !allowed.contains(&col.as_str())) {
            Some((col, _, _)) => Err(SqlError::Unsupported(format!("filter on {table}.{col}"))),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str, wanted: impl Fn(Op) -> bool) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(col, op, _)| col == column && wanted(*op))
            .map(|(_, _, expr)| *expr)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, |op| op == Op::Eq)
    }

    fn bound(&self, column: &str, bound: Bound) -> Option<&'a Expr> {
        let side = match bound {
            Bound::Lower => Op::GtEq,
            Bound::Upper => Op::LtEq,
        };
        self.find(column, |op| op == side || op == Op::Eq)
    }

    fn eq_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column)
            .map(|e| parse_ulid(e).map_err(|r| bad(column, r)))
            .transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.eq_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn eq_int(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.eq(column)
            .map(|e| parse_int(e).map_err(|r| bad(column, r)))
            .transpose()
    }

    fn eq_parsed<T>(&self, column: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, SqlError> {
        self.eq(column)
            .map(|e| parse_enum(e, &parse).map_err(|r| bad(column, r)))
            .transpose()
    }

    fn required_bound(&self, column: &'static str, bound: Bound) -> Result<Ms, SqlError> {
        let expr = self.bound(column, bound).ok_or(SqlError::MissingFilter(column))?;
        parse_timestamp_expr(expr).map_err(|r| bad(column, r))
    }

    fn date_bound(&self, column: &str, bound: Bound) -> Result<Option<NaiveDate>, SqlError> {
        self.bound(column, bound)
            .map(|e| parse_date_expr(e).map_err(|r| bad(column, r)))
            .transpose()
    }

    fn required_form(&self) -> Result<FormKind, SqlError> {
        self.eq_parsed("form", FormKind::parse)?
            .ok_or(SqlError::MissingFilter("form"))
    }

    fn reservation_filter(&self, id_column: &str) -> Result<ReservationFilter, SqlError> {
        Ok(ReservationFilter {
            id: self.eq_ulid(id_column)?,
            status: self.eq_parsed("status", ReservationStatus::parse)?,
            from: self.date_bound("start_date", Bound::Lower)?,
            to: self.date_bound("start_date", Bound::Upper)?,
            category: self
                .eq("category")
                .map(|e| parse_text(e).map_err(|r| bad("category", r)))
                .transpose()?,
        })
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// One VALUES tuple (or SET list) keyed by column name.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &str,
        known: &[&str],
        columns: &[String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        if values.len() != columns.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::Unsupported(format!("column {table}.{unknown}")));
        }
        Ok(Self {
            values: columns.iter().cloned().zip(values).collect(),
        })
    }

    fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// The column's expression, `None` when omitted or NULL.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, column: &str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or_else(|| SqlError::MissingColumn(column.to_string()))
    }

    fn opt<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, String>,
    ) -> Result<Option<T>, SqlError> {
        self.get(column)
            .map(|e| parse(e).map_err(|r| bad(column, r)))
            .transpose()
    }

    fn req<T>(&self, column: &str, parse: impl Fn(&Expr) -> Result<T, String>) -> Result<T, SqlError> {
        parse(self.required(column)?).map_err(|r| bad(column, r))
    }

    /// `Some(value)` when the column was assigned, for partial updates.
    fn patch<T>(
        &self,
        column: &str,
        read: impl Fn(&Self, &str) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        if self.has(column) {
            read(self, column).map(Some)
        } else {
            Ok(None)
        }
    }

    fn ulid(&self, column: &str) -> Result<Ulid, SqlError> {
        self.req(column, parse_ulid)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.opt(column, parse_ulid)
    }

    fn text(&self, column: &str) -> Result<String, SqlError> {
        self.req(column, parse_text)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.opt(column, parse_text)
    }

    fn int(&self, column: &str) -> Result<i64, SqlError> {
        self.req(column, parse_int)
    }

    fn opt_int(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.opt(column, parse_int)
    }

    fn count(&self, column: &str) -> Result<u32, SqlError> {
        self.req(column, parse_count)
    }

    fn opt_count(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.opt(column, parse_count)
    }

    fn count_or(&self, column: &str, default: u32) -> Result<u32, SqlError> {
        Ok(self.opt_count(column)?.unwrap_or(default))
    }

    fn date(&self, column: &str) -> Result<NaiveDate, SqlError> {
        self.req(column, parse_date_expr)
    }

    fn opt_date(&self, column: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.opt(column, parse_date_expr)
    }

    fn opt_timestamp(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.opt(column, parse_timestamp_expr)
    }

    fn span(&self, start: &str, end: &str) -> Result<Span, SqlError> {
        let (s, e) = (
            self.req(start, parse_timestamp_expr)?,
            self.req(end, parse_timestamp_expr)?,
        );
        if s >= e {
            return Err(bad(end, format!("{end} must be after {start}")));
        }
        Ok(Span::new(s, e))
    }

    fn parsed<T>(&self, column: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, SqlError> {
        self.req(column, |e| parse_enum(e, &parse))
    }

    fn opt_parsed<T>(
        &self,
        column: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, SqlError> {
        self.opt(column, |e| parse_enum(e, &parse))
    }

    /// JSON array of numbers and nulls, e.g. `'[5, 4, null, 3]'`.
    fn scores(&self, column: &str) -> Result<Vec<Option<f64>>, SqlError> {
        self.req(column, |e| {
            let text = parse_text(e)?;
            serde_json::from_str(&text).map_err(|err| format!("expected a JSON array of scores: {err}"))
        })
    }
}

fn bad(column: &str, reason: String) -> SqlError {
    SqlError::BadValue {
        column: column.to_string(),
        reason,
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => {
            parse_ulid(right).map_err(|r| bad("id", r))
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

fn parse_text(expr: &Expr) -> Result<String, String> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Placeholder(p)) => Err(format!("unbound parameter {p}")),
        Some(value) => Err(format!("expected string, got {value}")),
        None => Err(format!("expected value, got {expr}")),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, String> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| format!("bad ULID {s:?}: {e}"))
}

fn parse_int(expr: &Expr) -> Result<i64, String> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_int(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim().parse().map_err(|e| format!("bad integer {s:?}: {e}"))
}

fn parse_count(expr: &Expr) -> Result<u32, String> {
    let v = parse_int(expr)?;
    u32::try_from(v).map_err(|_| format!("{v} out of range"))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, String> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or_else(|| format!("expected YYYY-MM-DD, got {s:?}"))
}

/// Milliseconds, either as an integer or as `'YYYY-MM-DD[ HH:MM[:SS]]'`.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, String> {
    if let Ok(ms) = parse_int(expr) {
        return Ok(ms);
    }
    let s = parse_text(expr)?;
    parse_timestamp(&s).ok_or_else(|| format!("expected ms or YYYY-MM-DD HH:MM, got {s:?}"))
}

fn parse_enum<T>(expr: &Expr, parse: impl Fn(&str) -> Option<T>) -> Result<T, String> {
    let s = parse_text(expr)?;
    parse(&s).ok_or_else(|| format!("unknown value {s:?}"))
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
    #[error("missing column: {0}")]
    MissingColumn(String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value for {column}: {reason}")]
    BadValue { column: String, reason: String },
}
