//! Settlement, staff pay and survey statistics.
//!
//! Everything here is a pure function of reservation snapshots, so reports
//! never hold a lock while they aggregate.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::queries::ReservationFilter;
use super::{Engine, EngineError};

/// Ledger category the derived meal cost is compared against.
pub const MEALS_CATEGORY: &str = "meals";
/// Ledger category the derived staff cost is compared against.
pub const STAFF_CATEGORY: &str = "staff";

/// Scores at or above this count as "satisfied".
const SATISFIED_AT: f64 = 4.0;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn rate(part: f64, whole: f64) -> Option<f64> {
    (whole != 0.0).then(|| round2(part / whole * 100.0))
}

fn add_won(a: Won, b: Won) -> Result<Won, EngineError> {
    a.checked_add(b)
        .ok_or(EngineError::LimitExceeded("money total out of range"))
}

fn sum_won(amounts: impl IntoIterator<Item = Won>) -> Result<Won, EngineError> {
    amounts.into_iter().try_fold(0, add_won)
}

// ── Settlement ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementLine {
    /// `expense`, `income`, `net` or `derived`.
    pub kind: &'static str,
    pub category: String,
    pub planned: Won,
    pub actual: Won,
    pub variance: Won,
    /// actual / planned in percent; absent when nothing was planned.
    pub execution_rate: Option<f64>,
}

impl SettlementLine {
    fn new(kind: &'static str, category: impl Into<String>, planned: Won, actual: Won) -> Self {
        Self {
            kind,
            category: category.into(),
            planned,
            actual,
            variance: actual - planned,
            execution_rate: rate(actual as f64, planned as f64),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    planned: Won,
    actual: Won,
}

impl Totals {
    fn add(&mut self, phase: LedgerPhase, amount: Won) -> Result<(), EngineError> {
        let slot = match phase {
            LedgerPhase::Planned => &mut self.planned,
            LedgerPhase::Actual => &mut self.actual,
        };
        *slot = add_won(*slot, amount)?;
        Ok(())
    }
}

/// Ledger amounts are non-negative, so once every total fits, variance and
/// net differences fit as well.
pub fn settlement(
    state: &ReservationState,
    staff: &HashMap<Ulid, Staff>,
) -> Result<Vec<SettlementLine>, EngineError> {
    let mut by_category: BTreeMap<(LedgerKind, &str), Totals> = BTreeMap::new();
    let mut totals: HashMap<LedgerKind, Totals> = HashMap::new();
    for item in &state.ledger {
        by_category
            .entry((item.kind, item.category.as_str()))
            .or_default()
            .add(item.phase, item.amount)?;
        totals.entry(item.kind).or_default().add(item.phase, item.amount)?;
    }

    let mut lines = Vec::new();
    for kind in [LedgerKind::Expense, LedgerKind::Income] {
        for ((_, category), t) in by_category.range((kind, "")..).take_while(|((k, _), _)| *k == kind) {
            lines.push(SettlementLine::new(kind.as_str(), *category, t.planned, t.actual));
        }
        let t = totals.get(&kind).copied().unwrap_or_default();
        lines.push(SettlementLine::new(kind.as_str(), "total", t.planned, t.actual));
    }

    let expense = totals.get(&LedgerKind::Expense).copied().unwrap_or_default();
    let income = totals.get(&LedgerKind::Income).copied().unwrap_or_default();
    lines.push(SettlementLine::new(
        "net",
        "net",
        income.planned - expense.planned,
        income.actual - expense.actual,
    ));

    let recorded = |category: &str| {
        sum_won(
            state
                .ledger
                .iter()
                .filter(|i| i.kind == LedgerKind::Expense && i.phase == LedgerPhase::Actual && i.category == category)
                .map(|i| i.amount),
        )
    };
    let meal_cost = state.meals.iter().try_fold(0, |acc, m| {
        let cost = m
            .cost()
            .ok_or(EngineError::LimitExceeded("meal cost out of range"))?;
        add_won(acc, cost)
    })?;
    lines.push(SettlementLine::new("derived", "meal_cost", meal_cost, recorded(MEALS_CATEGORY)?));
    let staff_cost = sum_won(staff_payments(state, staff)?.iter().map(|p| p.amount))?;
    lines.push(SettlementLine::new("derived", "staff_cost", staff_cost, recorded(STAFF_CATEGORY)?));
    Ok(lines)
}

// ── Staff pay ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffPayment {
    pub staff_id: Ulid,
    pub name: String,
    pub role: StaffRole,
    pub sessions: u32,
    /// Started hours across all sessions (instructors are paid by these).
    pub hours: i64,
    /// Distinct days worked (helpers are paid by these).
    pub days: u32,
    pub amount: Won,
}

/// Started hours of a session, never less than one.
fn billed_hours(span: &Span) -> i64 {
    ((span.duration_ms() + HOUR_MS - 1) / HOUR_MS).max(1)
}

pub fn staff_payments(
    state: &ReservationState,
    staff: &HashMap<Ulid, Staff>,
) -> Result<Vec<StaffPayment>, EngineError> {
    struct Work {
        sessions: u32,
        hours: i64,
        days: BTreeSet<i64>,
    }
    let mut work: BTreeMap<Ulid, Work> = BTreeMap::new();
    for session in &state.programs {
        for staff_id in session.staff_ids() {
            let w = work.entry(staff_id).or_insert_with(|| Work {
                sessions: 0,
                hours: 0,
                days: BTreeSet::new(),
            });
            w.sessions += 1;
            w.hours += billed_hours(&session.span);
            w.days.insert(session.span.start.div_euclid(DAY_MS));
        }
    }

    let mut payments = Vec::with_capacity(work.len());
    for (staff_id, w) in work {
        let Some(person) = staff.get(&staff_id) else {
            continue;
        };
        let days = w.days.len() as u32;
        let units = match person.role {
            StaffRole::Instructor => w.hours,
            StaffRole::Assistant => w.sessions as Won,
            StaffRole::Helper => days as Won,
        };
        let amount = person
            .rate
            .checked_mul(units)
            .ok_or(EngineError::LimitExceeded("staff payment out of range"))?;
        payments.push(StaffPayment {
            staff_id,
            name: person.name.clone(),
            role: person.role,
            sessions: w.sessions,
            hours: w.hours,
            days,
            amount,
        });
    }
    Ok(payments)
}

// ── Survey statistics ────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    n: u32,
    sum: f64,
    satisfied: u32,
}

impl Tally {
    fn add(&mut self, score: f64) {
        self.n += 1;
        self.sum += score;
        if score >= SATISFIED_AT {
            self.satisfied += 1;
        }
    }

    fn add_all<'a>(&mut self, scores: impl IntoIterator<Item = &'a Option<f64>>) {
        for score in scores.into_iter().flatten() {
            self.add(*score);
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    /// `item`, `group`, `overall` or `subject`.
    pub scope: &'static str,
    pub name: String,
    pub responses: u32,
    pub mean: Option<f64>,
    pub satisfied_pct: Option<f64>,
}

impl ScoreRow {
    fn new(scope: &'static str, name: impl Into<String>, t: &Tally) -> Self {
        Self {
            scope,
            name: name.into(),
            responses: t.n,
            mean: t.mean().map(round2),
            satisfied_pct: rate(t.satisfied as f64, t.n as f64),
        }
    }
}

fn item_name(i: usize) -> String {
    format!("q{}", i + 1)
}

/// Mean and share of satisfied answers per item, per group and overall,
/// plus one row per program for the program form.
pub fn satisfaction_report<'a>(
    form: FormKind,
    responses: impl IntoIterator<Item = &'a SurveyResponse>,
) -> Vec<ScoreRow> {
    let spec = form.spec();
    let mut items = vec![Tally::default(); spec.items];
    let mut subjects: BTreeMap<String, Tally> = BTreeMap::new();
    for r in responses.into_iter().filter(|r| r.form == form) {
        for (tally, score) in items.iter_mut().zip(&r.scores) {
            if let Some(score) = score {
                tally.add(*score);
            }
        }
        if form == FormKind::Program
            && let Some(subject) = &r.subject
        {
            subjects.entry(subject.clone()).or_default().add_all(&r.scores);
        }
    }

    let mut rows: Vec<ScoreRow> = items
        .iter()
        .enumerate()
        .map(|(i, t)| ScoreRow::new("item", item_name(i), t))
        .collect();
    let mut overall = Tally::default();
    for (name, range) in spec.groups {
        let group = items[range.clone()].iter().fold(Tally::default(), |acc, t| Tally {
            n: acc.n + t.n,
            sum: acc.sum + t.sum,
            satisfied: acc.satisfied + t.satisfied,
        });
        overall.n += group.n;
        overall.sum += group.sum;
        overall.satisfied += group.satisfied;
        rows.push(ScoreRow::new("group", *name, &group));
    }
    rows.push(ScoreRow::new("overall", "overall", &overall));
    rows.extend(
        subjects
            .iter()
            .map(|(subject, t)| ScoreRow::new("subject", subject.clone(), t)),
    );
    rows
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectRow {
    /// `item`, `group` or `overall`.
    pub scope: &'static str,
    pub name: String,
    pub pre_n: u32,
    pub pre_mean: Option<f64>,
    pub post_n: u32,
    pub post_mean: Option<f64>,
    /// post mean - pre mean.
    pub diff: Option<f64>,
    /// diff / pre mean in percent.
    pub change_pct: Option<f64>,
}

impl EffectRow {
    fn new(scope: &'static str, name: impl Into<String>, pre: &Tally, post: &Tally) -> Self {
        let (pre_mean, post_mean) = (pre.mean(), post.mean());
        let diff = pre_mean.zip(post_mean).map(|(a, b)| b - a);
        Self {
            scope,
            name: name.into(),
            pre_n: pre.n,
            pre_mean: pre_mean.map(round2),
            post_n: post.n,
            post_mean: post_mean.map(round2),
            diff: diff.map(round2),
            change_pct: diff.zip(pre_mean).and_then(|(d, p)| rate(d, p)),
        }
    }
}

/// Pre/post comparison per item, per group and overall.
pub fn effect_report<'a>(
    form: FormKind,
    responses: impl IntoIterator<Item = &'a SurveyResponse>,
) -> Vec<EffectRow> {
    let spec = form.spec();
    let mut pre = vec![Tally::default(); spec.items];
    let mut post = vec![Tally::default(); spec.items];
    for r in responses.into_iter().filter(|r| r.form == form) {
        let tallies = match r.phase {
            Some(SurveyPhase::Pre) => &mut pre,
            Some(SurveyPhase::Post) => &mut post,
            None => continue,
        };
        for (tally, score) in tallies.iter_mut().zip(&r.scores) {
            if let Some(score) = score {
                tally.add(*score);
            }
        }
    }

    let sum = |tallies: &[Tally]| {
        tallies.iter().fold(Tally::default(), |acc, t| Tally {
            n: acc.n + t.n,
            sum: acc.sum + t.sum,
            satisfied: acc.satisfied + t.satisfied,
        })
    };
    let mut rows: Vec<EffectRow> = (0..spec.items)
        .map(|i| EffectRow::new("item", item_name(i), &pre[i], &post[i]))
        .collect();
    for (name, range) in spec.groups {
        rows.push(EffectRow::new(
            "group",
            *name,
            &sum(&pre[range.clone()]),
            &sum(&post[range.clone()]),
        ));
    }
    rows.push(EffectRow::new("overall", "overall", &sum(&pre[..]), &sum(&post[..])));
    rows
}

// ── Operations summary ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationsRow {
    pub category: String,
    pub reservations: u32,
    pub participants: u64,
    /// Participants times nights, a day visit counting as one night.
    pub person_days: u64,
    pub planned_income: Won,
    pub actual_income: Won,
    pub actual_expense: Won,
}

impl OperationsRow {
    fn absorb(&mut self, other: &OperationsRow) -> Result<(), EngineError> {
        self.reservations += other.reservations;
        self.participants += other.participants;
        self.person_days += other.person_days;
        self.planned_income = add_won(self.planned_income, other.planned_income)?;
        self.actual_income = add_won(self.actual_income, other.actual_income)?;
        self.actual_expense = add_won(self.actual_expense, other.actual_expense)?;
        Ok(())
    }
}

/// One row per reservation category and a closing `total` row. Cancelled
/// reservations are left out.
pub fn operations_summary<'a>(
    states: impl IntoIterator<Item = &'a ReservationState>,
) -> Result<Vec<OperationsRow>, EngineError> {
    let mut by_category: BTreeMap<String, OperationsRow> = BTreeMap::new();
    for state in states {
        let r = &state.reservation;
        if r.status == ReservationStatus::Cancelled {
            continue;
        }
        let participants = state.participants.as_ref().map_or(0, |p| p.total() as u64);
        let mut row = OperationsRow {
            reservations: 1,
            participants,
            person_days: participants * r.nights() as u64,
            ..OperationsRow::default()
        };
        for item in &state.ledger {
            let slot = match (item.kind, item.phase) {
                (LedgerKind::Income, LedgerPhase::Planned) => &mut row.planned_income,
                (LedgerKind::Income, LedgerPhase::Actual) => &mut row.actual_income,
                (LedgerKind::Expense, LedgerPhase::Actual) => &mut row.actual_expense,
                (LedgerKind::Expense, LedgerPhase::Planned) => continue,
            };
            *slot = add_won(*slot, item.amount)?;
        }
        by_category
            .entry(r.category.clone())
            .or_insert_with(|| OperationsRow {
                category: r.category.clone(),
                ..OperationsRow::default()
            })
            .absorb(&row)?;
    }

    let mut total = OperationsRow {
        category: "total".into(),
        ..OperationsRow::default()
    };
    let mut rows: Vec<OperationsRow> = by_category.into_values().collect();
    for row in &rows {
        total.absorb(row)?;
    }
    rows.push(total);
    Ok(rows)
}

// ── Engine entry points ──────────────────────────────────────────

fn staff_index(staff: Vec<Staff>) -> HashMap<Ulid, Staff> {
    staff.into_iter().map(|s| (s.id, s)).collect()
}

impl Engine {
    pub async fn settlement(&self, reservation_id: Ulid) -> Result<Vec<SettlementLine>, EngineError> {
        let state = self.get_reservation(reservation_id).await?;
        settlement(&state, &staff_index(self.list_staff()))
    }

    pub async fn staff_payments(&self, reservation_id: Ulid) -> Result<Vec<StaffPayment>, EngineError> {
        let state = self.get_reservation(reservation_id).await?;
        staff_payments(&state, &staff_index(self.list_staff()))
    }

    pub async fn satisfaction_report(
        &self,
        form: FormKind,
        filter: &ReservationFilter,
    ) -> Result<Vec<ScoreRow>, EngineError> {
        if form.spec().measures_effect {
            return Err(EngineError::invalid(format!(
                "{} is a pre/post form; use effect_report",
                form.as_str()
            )));
        }
        let states = self.select_reservations(filter).await;
        Ok(satisfaction_report(form, states.iter().flat_map(|s| &s.surveys)))
    }

    pub async fn effect_report(
        &self,
        form: FormKind,
        filter: &ReservationFilter,
    ) -> Result<Vec<EffectRow>, EngineError> {
        if !form.spec().measures_effect {
            return Err(EngineError::invalid(format!(
                "{} is a satisfaction form; use satisfaction_report",
                form.as_str()
            )));
        }
        let states = self.select_reservations(filter).await;
        Ok(effect_report(form, states.iter().flat_map(|s| &s.surveys)))
    }

    pub async fn operations_summary(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<OperationsRow>, EngineError> {
        let states = self.select_reservations(filter).await;
        operations_summary(&states)
    }
}
