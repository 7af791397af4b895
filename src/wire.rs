use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::HavenAuthSource;
use crate::engine::reports::{EffectRow, OperationsRow, ScoreRow, SettlementLine, StaffPayment};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct HavenHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HavenQueryParser>,
}

impl HavenHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HavenQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute one statement and record its metrics.
    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(command = label, error = %e, "command failed");
        }
        result.map_err(engine_err)
    }
}

fn parse_failed(e: SqlError) -> PgWireError {
    metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
    sql_err(e)
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
    match cmd {
        // ── Resources and staff ──────────────────────────────
        Command::InsertResource(info) => {
            engine.create_resource(info).await?;
            Ok(inserted(1))
        }
        Command::UpdateResource { id, patch } => {
            engine.update_resource(id, patch).await?;
            Ok(updated())
        }
        Command::DeleteResource { id } => {
            engine.delete_resource(id).await?;
            Ok(deleted())
        }
        Command::InsertClosure {
            id,
            resource_id,
            span,
            reason,
        } => {
            engine.add_closure(id, resource_id, span, reason).await?;
            Ok(inserted(1))
        }
        Command::DeleteClosure { id } => {
            engine.remove_closure(id).await?;
            Ok(deleted())
        }
        Command::InsertStaff(staff) => {
            engine.create_staff(staff).await?;
            Ok(inserted(1))
        }
        Command::UpdateStaff { id, patch } => {
            engine.update_staff(id, patch).await?;
            Ok(updated())
        }
        Command::DeleteStaff { id } => {
            engine.delete_staff(id).await?;
            Ok(deleted())
        }

        // ── Reservations ─────────────────────────────────────
        Command::InsertReservation(new) => {
            engine.create_reservation(new).await?;
            Ok(inserted(1))
        }
        Command::UpdateReservation { id, patch } => {
            engine.update_reservation(id, patch).await?;
            Ok(updated())
        }
        Command::DeleteReservation { id } => {
            engine.delete_reservation(id).await?;
            Ok(deleted())
        }
        Command::UpsertParticipants {
            reservation_id,
            participants,
        } => {
            engine.set_participants(reservation_id, participants).await?;
            Ok(inserted(1))
        }
        Command::InsertProgram {
            reservation_id,
            session,
        } => {
            engine.schedule_program(reservation_id, session).await?;
            Ok(inserted(1))
        }
        Command::InsertRoomAssignments {
            reservation_id,
            assignments,
        } => {
            let count = assignments.len();
            engine.assign_rooms(reservation_id, assignments).await?;
            Ok(inserted(count))
        }
        Command::InsertPlaceBooking {
            reservation_id,
            booking,
        } => {
            engine.book_place(reservation_id, booking).await?;
            Ok(inserted(1))
        }
        Command::InsertMeal {
            reservation_id,
            order,
        } => {
            engine.order_meal(reservation_id, order).await?;
            Ok(inserted(1))
        }
        Command::InsertLedgerItem {
            reservation_id,
            item,
        } => {
            engine.add_ledger_item(reservation_id, item).await?;
            Ok(inserted(1))
        }
        Command::InsertDocument {
            reservation_id,
            document,
        } => {
            engine.add_document(reservation_id, document).await?;
            Ok(inserted(1))
        }
        Command::InsertSurvey {
            reservation_id,
            response,
        } => {
            engine.record_survey(reservation_id, response).await?;
            Ok(inserted(1))
        }
        Command::DeleteEntry { kind, id } => {
            engine.remove_entry(kind, id).await?;
            Ok(deleted())
        }

        // ── Listings ─────────────────────────────────────────
        Command::SelectResources { kind } => {
            let rows = engine.list_resources(kind).await;
            Ok(query_response(RESOURCES, rows.iter().map(resource_row)))
        }
        Command::SelectClosures { resource_id } => {
            let rows = engine.get_closures(resource_id).await;
            Ok(query_response(
                CLOSURES,
                rows.into_iter().map(|c| {
                    vec![
                        Cell::text(c.id),
                        Cell::text(c.resource_id),
                        Cell::Int(Some(c.start)),
                        Cell::Int(Some(c.end)),
                        Cell::Text(c.reason),
                    ]
                }),
            ))
        }
        Command::SelectBookings { resource_id } => {
            let rows = engine.get_bookings(resource_id).await;
            Ok(query_response(
                BOOKINGS,
                rows.into_iter().map(|b| {
                    vec![
                        Cell::text(b.id),
                        Cell::text(b.resource_id),
                        Cell::text(b.reservation_id),
                        Cell::Int(Some(b.start)),
                        Cell::Int(Some(b.end)),
                    ]
                }),
            ))
        }
        Command::SelectStaff { id } => {
            let rows = engine.list_staff();
            Ok(query_response(
                STAFF,
                rows.into_iter()
                    .filter(|s| id.is_none_or(|id| id == s.id))
                    .map(|s| {
                        vec![
                            Cell::text(s.id),
                            Cell::Text(Some(s.name)),
                            Cell::text(s.role.as_str()),
                            Cell::Int(Some(s.rate)),
                        ]
                    }),
            ))
        }
        Command::SelectReservations { filter } => {
            let rows = engine.list_reservations(&filter).await;
            Ok(query_response(RESERVATIONS, rows.into_iter().map(reservation_row)))
        }
        Command::SelectParticipants { reservation_id } => {
            let state = engine.get_reservation(reservation_id).await?;
            Ok(query_response(
                PARTICIPANTS,
                state.participants.into_iter().map(|p| {
                    vec![
                        Cell::text(reservation_id),
                        Cell::count(p.male),
                        Cell::count(p.female),
                        Cell::count(p.male_leaders),
                        Cell::count(p.female_leaders),
                        Cell::count(p.total()),
                        Cell::Text(p.age_group),
                        Cell::Text(p.participant_type),
                    ]
                }),
            ))
        }
        Command::SelectEntries {
            kind,
            reservation_id,
        } => {
            let state = engine.get_reservation(reservation_id).await?;
            Ok(entry_rows(kind, state))
        }

        // ── Views ────────────────────────────────────────────
        Command::SelectAvailability {
            resource_id,
            start,
            end,
            min_duration,
        } => {
            let slots = engine
                .compute_availability(resource_id, start, end, min_duration)
                .await?;
            Ok(query_response(
                AVAILABILITY,
                slots.into_iter().map(|slot| {
                    vec![
                        Cell::text(resource_id),
                        Cell::Int(Some(slot.start)),
                        Cell::Int(Some(slot.end)),
                    ]
                }),
            ))
        }
        Command::SelectVacancies { kind, start, end } => {
            let rows = engine.free_resources(kind, Span { start, end }).await?;
            Ok(query_response(RESOURCES, rows.iter().map(resource_row)))
        }
        Command::SelectSettlement { reservation_id } => {
            let rows = engine.settlement(reservation_id).await?;
            Ok(query_response(SETTLEMENT, rows.into_iter().map(settlement_row)))
        }
        Command::SelectStaffPayments { reservation_id } => {
            let rows = engine.staff_payments(reservation_id).await?;
            Ok(query_response(STAFF_PAYMENTS, rows.into_iter().map(payment_row)))
        }
        Command::SelectSatisfaction { form, filter } => {
            let rows = engine.satisfaction_report(form, &filter).await?;
            Ok(query_response(SATISFACTION, rows.into_iter().map(score_row)))
        }
        Command::SelectEffect { form, filter } => {
            let rows = engine.effect_report(form, &filter).await?;
            Ok(query_response(EFFECT, rows.into_iter().map(effect_row)))
        }
        Command::SelectOperations { filter } => {
            let rows = engine.operations_summary(&filter).await?;
            Ok(query_response(OPERATIONS, rows.into_iter().map(operations_row)))
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Col {
    Text,
    Int,
    Float,
}

type Columns = &'static [(&'static str, Col)];

const RESOURCES: Columns = &[
    ("id", Col::Text),
    ("kind", Col::Text),
    ("name", Col::Text),
    ("capacity", Col::Int),
    ("buffer_after", Col::Int),
    ("max_occupancy", Col::Int),
];
const CLOSURES: Columns = &[
    ("id", Col::Text),
    ("resource_id", Col::Text),
    ("start", Col::Int),
    ("end", Col::Int),
    ("reason", Col::Text),
];
const BOOKINGS: Columns = &[
    ("id", Col::Text),
    ("resource_id", Col::Text),
    ("reservation_id", Col::Text),
    ("start", Col::Int),
    ("end", Col::Int),
];
const STAFF: Columns = &[
    ("id", Col::Text),
    ("name", Col::Text),
    ("role", Col::Text),
    ("rate", Col::Int),
];
const RESERVATIONS: Columns = &[
    ("id", Col::Text),
    ("group_name", Col::Text),
    ("contact_name", Col::Text),
    ("contact_phone", Col::Text),
    ("category", Col::Text),
    ("start_date", Col::Text),
    ("end_date", Col::Text),
    ("status", Col::Text),
    ("hold_until", Col::Int),
    ("notes", Col::Text),
    ("created_at", Col::Int),
    ("updated_at", Col::Int),
];
const PARTICIPANTS: Columns = &[
    ("reservation_id", Col::Text),
    ("male", Col::Int),
    ("female", Col::Int),
    ("male_leaders", Col::Int),
    ("female_leaders", Col::Int),
    ("total", Col::Int),
    ("age_group", Col::Text),
    ("participant_type", Col::Text),
];
const PROGRAMS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("name", Col::Text),
    ("start", Col::Int),
    ("end", Col::Int),
    ("place_id", Col::Text),
    ("instructor_id", Col::Text),
    ("assistant_id", Col::Text),
    ("helper_id", Col::Text),
    ("headcount", Col::Int),
];
const ROOM_ASSIGNMENTS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("room_id", Col::Text),
    ("check_in", Col::Text),
    ("check_out", Col::Text),
    ("occupants", Col::Int),
];
const PLACE_BOOKINGS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("place_id", Col::Text),
    ("start", Col::Int),
    ("end", Col::Int),
    ("headcount", Col::Int),
    ("purpose", Col::Text),
];
const MEALS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("date", Col::Text),
    ("meal", Col::Text),
    ("headcount", Col::Int),
    ("unit_price", Col::Int),
    ("cost", Col::Int),
];
const LEDGER: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("kind", Col::Text),
    ("phase", Col::Text),
    ("category", Col::Text),
    ("description", Col::Text),
    ("amount", Col::Int),
];
const DOCUMENTS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("kind", Col::Text),
    ("title", Col::Text),
    ("issued_on", Col::Text),
];
const SURVEYS: Columns = &[
    ("id", Col::Text),
    ("reservation_id", Col::Text),
    ("form", Col::Text),
    ("phase", Col::Text),
    ("subject", Col::Text),
    ("sex", Col::Text),
    ("age_group", Col::Text),
    ("scores", Col::Text),
];
const AVAILABILITY: Columns = &[
    ("resource_id", Col::Text),
    ("start", Col::Int),
    ("end", Col::Int),
];
const SETTLEMENT: Columns = &[
    ("kind", Col::Text),
    ("category", Col::Text),
    ("planned", Col::Int),
    ("actual", Col::Int),
    ("variance", Col::Int),
    ("execution_rate", Col::Float),
];
const STAFF_PAYMENTS: Columns = &[
    ("staff_id", Col::Text),
    ("name", Col::Text),
    ("role", Col::Text),
    ("sessions", Col::Int),
    ("hours", Col::Int),
    ("days", Col::Int),
    ("amount", Col::Int),
];
const SATISFACTION: Columns = &[
    ("scope", Col::Text),
    ("name", Col::Text),
    ("responses", Col::Int),
    ("mean", Col::Float),
    ("satisfied_pct", Col::Float),
];
const EFFECT: Columns = &[
    ("scope", Col::Text),
    ("name", Col::Text),
    ("pre_n", Col::Int),
    ("pre_mean", Col::Float),
    ("post_n", Col::Int),
    ("post_mean", Col::Float),
    ("diff", Col::Float),
    ("change_pct", Col::Float),
];
const OPERATIONS: Columns = &[
    ("category", Col::Text),
    ("reservations", Col::Int),
    ("participants", Col::Int),
    ("person_days", Col::Int),
    ("planned_income", Col::Int),
    ("actual_income", Col::Int),
    ("actual_expense", Col::Int),
];

/// Columns a SELECT from `table` returns; `None` for unknown relations.
fn columns_for(table: &str) -> Option<Columns> {
    Some(match table {
        "resources" | "vacancies" => RESOURCES,
        "closures" => CLOSURES,
        "bookings" => BOOKINGS,
        "staff" => STAFF,
        "reservations" => RESERVATIONS,
        "participants" => PARTICIPANTS,
        "programs" => PROGRAMS,
        "room_assignments" => ROOM_ASSIGNMENTS,
        "place_bookings" => PLACE_BOOKINGS,
        "meals" => MEALS,
        "ledger" => LEDGER,
        "documents" => DOCUMENTS,
        "surveys" => SURVEYS,
        "availability" => AVAILABILITY,
        "settlement" => SETTLEMENT,
        "staff_payments" => STAFF_PAYMENTS,
        "satisfaction_report" => SATISFACTION,
        "effect_report" => EFFECT,
        "operations_summary" => OPERATIONS,
        _ => return None,
    })
}

fn schema(columns: Columns) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|(name, col)| {
            let ty = match col {
                Col::Text => Type::VARCHAR,
                Col::Int => Type::INT8,
                Col::Float => Type::FLOAT8,
            };
            FieldInfo::new((*name).into(), None, None, ty, FieldFormat::Text)
        })
        .collect()
}

/// Result schema of a statement, empty for anything but a known SELECT.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .and_then(|table| columns_for(&table))
        .map(schema)
        .unwrap_or_default()
}

// ── Row encoding ─────────────────────────────────────────────────

enum Cell {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
}

impl Cell {
    fn text(value: impl ToString) -> Self {
        Cell::Text(Some(value.to_string()))
    }

    fn opt_text(value: Option<impl ToString>) -> Self {
        Cell::Text(value.map(|v| v.to_string()))
    }

    fn count(value: u32) -> Self {
        Cell::Int(Some(value as i64))
    }
}

fn query_response(columns: Columns, rows: impl Iterator<Item = Vec<Cell>>) -> Response {
    let schema = Arc::new(schema(columns));
    let rows: Vec<PgWireResult<_>> = rows
        .map(|cells| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in &cells {
                match cell {
                    Cell::Text(v) => encoder.encode_field(v)?,
                    Cell::Int(v) => encoder.encode_field(v)?,
                    Cell::Float(v) => encoder.encode_field(v)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resource_row(r: &ResourceInfo) -> Vec<Cell> {
    vec![
        Cell::text(r.id),
        Cell::text(r.kind),
        Cell::Text(Some(r.name.clone())),
        Cell::count(r.capacity),
        Cell::Int(r.buffer_after),
        Cell::Int(r.max_occupancy.map(i64::from)),
    ]
}

fn reservation_row(r: Reservation) -> Vec<Cell> {
    vec![
        Cell::text(r.id),
        Cell::Text(Some(r.group_name)),
        Cell::Text(r.contact_name),
        Cell::Text(r.contact_phone),
        Cell::Text(Some(r.category)),
        Cell::text(r.start_date),
        Cell::text(r.end_date),
        Cell::text(r.status),
        Cell::Int(r.hold_until),
        Cell::Text(r.notes),
        Cell::Int(Some(r.created_at)),
        Cell::Int(Some(r.updated_at)),
    ]
}

fn entry_rows(kind: EntryKind, state: ReservationState) -> Response {
    let rid = state.id();
    match kind {
        EntryKind::Program => query_response(
            PROGRAMS,
            state.programs.into_iter().map(|s| {
                vec![
                    Cell::text(s.id),
                    Cell::text(rid),
                    Cell::Text(Some(s.name)),
                    Cell::Int(Some(s.span.start)),
                    Cell::Int(Some(s.span.end)),
                    Cell::opt_text(s.place_id),
                    Cell::opt_text(s.instructor_id),
                    Cell::opt_text(s.assistant_id),
                    Cell::opt_text(s.helper_id),
                    Cell::count(s.headcount),
                ]
            }),
        ),
        EntryKind::Room => query_response(
            ROOM_ASSIGNMENTS,
            state.rooms.into_iter().map(|r| {
                vec![
                    Cell::text(r.id),
                    Cell::text(rid),
                    Cell::text(r.room_id),
                    Cell::text(r.check_in),
                    Cell::text(r.check_out),
                    Cell::count(r.occupants),
                ]
            }),
        ),
        EntryKind::Place => query_response(
            PLACE_BOOKINGS,
            state.places.into_iter().map(|p| {
                vec![
                    Cell::text(p.id),
                    Cell::text(rid),
                    Cell::text(p.place_id),
                    Cell::Int(Some(p.span.start)),
                    Cell::Int(Some(p.span.end)),
                    Cell::count(p.headcount),
                    Cell::Text(p.purpose),
                ]
            }),
        ),
        EntryKind::Meal => query_response(
            MEALS,
            state.meals.into_iter().map(|m| {
                vec![
                    Cell::text(m.id),
                    Cell::text(rid),
                    Cell::text(m.date),
                    Cell::text(m.meal.as_str()),
                    Cell::count(m.headcount),
                    Cell::Int(Some(m.unit_price)),
                    Cell::Int(m.cost()),
                ]
            }),
        ),
        EntryKind::Ledger => query_response(
            LEDGER,
            state.ledger.into_iter().map(|i| {
                vec![
                    Cell::text(i.id),
                    Cell::text(rid),
                    Cell::text(i.kind.as_str()),
                    Cell::text(i.phase.as_str()),
                    Cell::Text(Some(i.category)),
                    Cell::Text(i.description),
                    Cell::Int(Some(i.amount)),
                ]
            }),
        ),
        EntryKind::Document => query_response(
            DOCUMENTS,
            state.documents.into_iter().map(|d| {
                vec![
                    Cell::text(d.id),
                    Cell::text(rid),
                    Cell::Text(Some(d.kind)),
                    Cell::Text(Some(d.title)),
                    Cell::opt_text(d.issued_on),
                ]
            }),
        ),
        EntryKind::Survey => query_response(
            SURVEYS,
            state.surveys.into_iter().map(|s| {
                vec![
                    Cell::text(s.id),
                    Cell::text(rid),
                    Cell::text(s.form.as_str()),
                    Cell::opt_text(s.phase.map(|p| p.as_str())),
                    Cell::Text(s.subject),
                    Cell::Text(s.sex),
                    Cell::Text(s.age_group),
                    Cell::Text(serde_json::to_string(&s.scores).ok()),
                ]
            }),
        ),
    }
}

fn settlement_row(l: SettlementLine) -> Vec<Cell> {
    vec![
        Cell::text(l.kind),
        Cell::Text(Some(l.category)),
        Cell::Int(Some(l.planned)),
        Cell::Int(Some(l.actual)),
        Cell::Int(Some(l.variance)),
        Cell::Float(l.execution_rate),
    ]
}

fn payment_row(p: StaffPayment) -> Vec<Cell> {
    vec![
        Cell::text(p.staff_id),
        Cell::Text(Some(p.name)),
        Cell::text(p.role.as_str()),
        Cell::count(p.sessions),
        Cell::Int(Some(p.hours)),
        Cell::count(p.days),
        Cell::Int(Some(p.amount)),
    ]
}

fn score_row(r: ScoreRow) -> Vec<Cell> {
    vec![
        Cell::text(r.scope),
        Cell::Text(Some(r.name)),
        Cell::count(r.responses),
        Cell::Float(r.mean),
        Cell::Float(r.satisfied_pct),
    ]
}

fn effect_row(r: EffectRow) -> Vec<Cell> {
    vec![
        Cell::text(r.scope),
        Cell::Text(Some(r.name)),
        Cell::count(r.pre_n),
        Cell::Float(r.pre_mean),
        Cell::count(r.post_n),
        Cell::Float(r.post_mean),
        Cell::Float(r.diff),
        Cell::Float(r.change_pct),
    ]
}

fn operations_row(r: OperationsRow) -> Vec<Cell> {
    let big = |n: u64| Cell::Int(Some(i64::try_from(n).unwrap_or(i64::MAX)));
    vec![
        Cell::Text(Some(r.category)),
        Cell::count(r.reservations),
        big(r.participants),
        big(r.person_days),
        Cell::Int(Some(r.planned_income)),
        Cell::Int(Some(r.actual_income)),
        Cell::Int(Some(r.actual_expense)),
    ]
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for HavenHandler {
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
        if query.trim().trim_end_matches(';').trim().is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        let engine = self.resolve_engine(client)?;
        let cmds = sql::parse_batch(query).map_err(parse_failed)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run_command(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HavenQueryParser;

#[async_trait]
impl QueryParser for HavenQueryParser {
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
        Ok(vec![Type::VARCHAR; sql::placeholder_count(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HavenHandler {
    type Statement = String;
    type QueryParser = HavenQueryParser;

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
        let query = &portal.statement.statement;
        if query.trim().trim_end_matches(';').trim().is_empty() {
            return Ok(Response::EmptyQuery);
        }
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql_with_params(query, &text_params(portal)).map_err(parse_failed)?;
        self.run_command(&engine, cmd).await
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
        let param_types = vec![Type::VARCHAR; sql::placeholder_count(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Bound parameters in text format.
fn text_params(portal: &Portal<String>) -> Vec<Option<String>> {
    portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect()
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HavenFactory {
    handler: Arc<HavenHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<HavenAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HavenFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: &str) -> Self {
        Self {
            handler: Arc::new(HavenHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                HavenAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HavenFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: &str,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = HavenFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for an engine error.
fn error_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "02000",
        e if e.is_conflict() => "23P01",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        error_code(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
