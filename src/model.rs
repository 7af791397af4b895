use std::ops::Range;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Facility wall-clock time is stored as if it were UTC.
pub type Ms = i64;

/// Money, in won.
pub type Won = i64;

pub const DAY_MS: Ms = 86_400_000;
pub const HOUR_MS: Ms = 3_600_000;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Same span with the end pushed out by `buffer` (changeover time).
    pub fn extended(&self, buffer: Ms) -> Span {
        Span::new(self.start, self.end.saturating_add(buffer))
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Midnight at the start of `date`.
pub fn date_start_ms(date: NaiveDate) -> Ms {
    (date.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE) * DAY_MS
}

/// Calendar date containing the instant `ms`.
pub fn ms_to_date(ms: Ms) -> Option<NaiveDate> {
    let days = ms.div_euclid(DAY_MS) + UNIX_EPOCH_DAYS_FROM_CE;
    NaiveDate::from_num_days_from_ce_opt(i32::try_from(days).ok()?)
}

/// A stay from check-in day to check-out day: `[check_in 00:00, check_out 00:00)`.
/// Guests leaving on the day others arrive do not overlap.
pub fn stay_span(check_in: NaiveDate, check_out: NaiveDate) -> Span {
    Span::new(date_start_ms(check_in), date_start_ms(check_out))
}

/// Every instant of the inclusive date range `[start, end]`.
pub fn date_window(start: NaiveDate, end: NaiveDate) -> Span {
    Span::new(date_start_ms(start), date_start_ms(end) + DAY_MS)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Accepts `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]` or a bare date (midnight).
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    parse_date(s).map(date_start_ms)
}

pub fn format_timestamp(ms: Ms) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Lodging, booked by whole nights.
    Room,
    /// Hall, classroom, outdoor field; booked by time range.
    Place,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Room => "room",
            ResourceKind::Place => "place",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "room" => Some(ResourceKind::Room),
            "place" => Some(ResourceKind::Place),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an interval on a resource represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// Maintenance or holiday: nothing can be booked.
    Closure { reason: Option<String> },
    /// Held by a reservation (room stay, place booking or program session).
    Booking { reservation_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn is_booking(&self) -> bool {
        matches!(self.kind, IntervalKind::Booking { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: String,
    /// Max concurrent bookings (default 1).
    pub capacity: u32,
    /// Changeover time in ms after each booking ends.
    pub buffer_after: Option<Ms>,
    /// Max people a single booking may bring.
    pub max_occupancy: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub buffer_after: Option<Option<Ms>>,
    pub max_occupancy: Option<Option<u32>>,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub info: ResourceInfo,
    /// Closures and bookings, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    /// Set under the write lock when the resource is removed, so a writer that
    /// fetched the Arc earlier sees it gone.
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            intervals: Vec::new(),
            deleted: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.info.id
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        let query_start = query.start;
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query_start)
    }

    pub fn has_bookings(&self) -> bool {
        self.intervals.iter().any(Interval::is_booking)
    }
}

// ── Staff ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaffRole {
    /// Paid per started hour of each session.
    Instructor,
    /// Paid per session.
    Assistant,
    /// Paid per day worked.
    Helper,
}

impl StaffRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaffRole::Instructor => "instructor",
            StaffRole::Assistant => "assistant",
            StaffRole::Helper => "helper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "instructor" => Some(StaffRole::Instructor),
            "assistant" => Some(StaffRole::Assistant),
            "helper" => Some(StaffRole::Helper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Ulid,
    pub name: String,
    pub role: StaffRole,
    pub rate: Won,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaffPatch {
    pub name: Option<String>,
    pub role: Option<StaffRole>,
    pub rate: Option<Won>,
}

// ── Reservation header (Page1) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Tentative,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Tentative => "tentative",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tentative" => Some(ReservationStatus::Tentative),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn can_become(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Tentative, Confirmed) | (Tentative, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
            )
    }

    /// Rooms, places, programs and meals can only change while the stay is open.
    pub fn is_open(&self) -> bool {
        matches!(self, ReservationStatus::Tentative | ReservationStatus::Confirmed)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub group_name: String,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    /// Business category used by the operations summary, e.g. "social_contribution".
    pub category: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: ReservationStatus,
    /// Tentative reservations are cancelled once this passes.
    pub hold_until: Option<Ms>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn window(&self) -> Span {
        date_window(self.start_date, self.end_date)
    }

    /// Nights between arrival and departure; a day visit counts as one.
    pub fn nights(&self) -> i64 {
        (self.end_date - self.start_date).num_days().max(1)
    }
}

/// Fields supplied when a reservation is created; timestamps are set by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub group_name: String,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub category: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: ReservationStatus,
    pub hold_until: Option<Ms>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub group_name: Option<String>,
    pub contact_name: Option<Option<String>>,
    pub contact_phone: Option<Option<String>>,
    pub category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub hold_until: Option<Option<Ms>>,
    pub notes: Option<Option<String>>,
}

impl ReservationPatch {
    pub fn status(status: ReservationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

// ── Page2: participants and programs ─────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub male: u32,
    pub female: u32,
    pub male_leaders: u32,
    pub female_leaders: u32,
    pub age_group: Option<String>,
    pub participant_type: Option<String>,
}

impl Participants {
    pub fn total(&self) -> u32 {
        self.male + self.female + self.male_leaders + self.female_leaders
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSession {
    pub id: Ulid,
    pub name: String,
    pub span: Span,
    /// Place the session occupies; booked like any place booking.
    pub place_id: Option<Ulid>,
    pub instructor_id: Option<Ulid>,
    pub assistant_id: Option<Ulid>,
    pub helper_id: Option<Ulid>,
    pub headcount: u32,
}

impl ProgramSession {
    pub fn staff_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        [self.instructor_id, self.assistant_id, self.helper_id]
            .into_iter()
            .flatten()
    }
}

// ── Page3: rooms, meals, places ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAssignment {
    pub id: Ulid,
    pub room_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub occupants: u32,
}

impl RoomAssignment {
    pub fn span(&self) -> Span {
        stay_span(self.check_in, self.check_out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Meal {
    Breakfast,
    Lunch,
    Dinner,
}

impl Meal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Meal::Breakfast => "breakfast",
            Meal::Lunch => "lunch",
            Meal::Dinner => "dinner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "breakfast" => Some(Meal::Breakfast),
            "lunch" => Some(Meal::Lunch),
            "dinner" => Some(Meal::Dinner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealOrder {
    pub id: Ulid,
    pub date: NaiveDate,
    pub meal: Meal,
    pub headcount: u32,
    pub unit_price: Won,
}

impl MealOrder {
    /// None when headcount x unit price does not fit in `Won`.
    pub fn cost(&self) -> Option<Won> {
        (self.headcount as Won).checked_mul(self.unit_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceBooking {
    pub id: Ulid,
    pub place_id: Ulid,
    pub span: Span,
    pub headcount: u32,
    pub purpose: Option<String>,
}

// ── Page4: expenses and income ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LedgerKind {
    Expense,
    Income,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Expense => "expense",
            LedgerKind::Income => "income",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "expense" => Some(LedgerKind::Expense),
            "income" => Some(LedgerKind::Income),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerPhase {
    Planned,
    Actual,
}

impl LedgerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerPhase::Planned => "planned",
            LedgerPhase::Actual => "actual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "planned" => Some(LedgerPhase::Planned),
            "actual" => Some(LedgerPhase::Actual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerItem {
    pub id: Ulid,
    pub kind: LedgerKind,
    pub phase: LedgerPhase,
    pub category: String,
    pub description: Option<String>,
    pub amount: Won,
}

// ── Page5: documents ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Ulid,
    /// e.g. "quote", "contract", "invoice", "receipt".
    pub kind: String,
    pub title: String,
    pub issued_on: Option<NaiveDate>,
}

// ── Surveys ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormKind {
    Service,
    Program,
    Prevent,
    Healing,
    CounselTherapy,
    Hrv,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// Likert items, inclusive bounds.
    Likert { min: u8, max: u8 },
    /// Physiological readings, any non-negative value.
    Reading,
}

#[derive(Debug)]
pub struct FormSpec {
    pub items: usize,
    pub scale: Scale,
    /// Named item ranges (0-based, half-open).
    pub groups: &'static [(&'static str, Range<usize>)],
    /// Pre/post effect measurement rather than a one-off satisfaction score.
    pub measures_effect: bool,
}

const LIKERT_5: Scale = Scale::Likert { min: 1, max: 5 };

static SERVICE_FORM: FormSpec = FormSpec {
    items: 10,
    scale: LIKERT_5,
    groups: &[("facility", 0..3), ("meals", 3..5), ("staff", 5..8), ("overall", 8..10)],
    measures_effect: false,
};

static PROGRAM_FORM: FormSpec = FormSpec {
    items: 9,
    scale: LIKERT_5,
    groups: &[("instructor", 0..3), ("content", 3..6), ("effect", 6..9)],
    measures_effect: false,
};

static PREVENT_FORM: FormSpec = FormSpec {
    items: 20,
    scale: LIKERT_5,
    groups: &[("awareness", 0..7), ("self_control", 7..14), ("coping", 14..20)],
    measures_effect: true,
};

static HEALING_FORM: FormSpec = FormSpec {
    items: 22,
    scale: LIKERT_5,
    groups: &[
        ("stress", 0..6),
        ("emotion", 6..12),
        ("vitality", 12..17),
        ("relationship", 17..22),
    ],
    measures_effect: true,
};

static COUNSEL_FORM: FormSpec = FormSpec {
    items: 16,
    scale: LIKERT_5,
    groups: &[("depression", 0..8), ("anxiety", 8..16)],
    measures_effect: true,
};

static HRV_FORM: FormSpec = FormSpec {
    items: 5,
    scale: Scale::Reading,
    groups: &[
        ("autonomic_activity", 0..1),
        ("autonomic_balance", 1..2),
        ("stress_resistance", 2..3),
        ("stress_index", 3..4),
        ("fatigue", 4..5),
    ],
    measures_effect: true,
};

impl FormKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormKind::Service => "service",
            FormKind::Program => "program",
            FormKind::Prevent => "prevent",
            FormKind::Healing => "healing",
            FormKind::CounselTherapy => "counsel",
            FormKind::Hrv => "hrv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "service" => Some(FormKind::Service),
            "program" => Some(FormKind::Program),
            "prevent" => Some(FormKind::Prevent),
            "healing" => Some(FormKind::Healing),
            "counsel" | "counsel_therapy" => Some(FormKind::CounselTherapy),
            "hrv" => Some(FormKind::Hrv),
            _ => None,
        }
    }

    pub fn spec(&self) -> &'static FormSpec {
        match self {
            FormKind::Service => &SERVICE_FORM,
            FormKind::Program => &PROGRAM_FORM,
            FormKind::Prevent => &PREVENT_FORM,
            FormKind::Healing => &HEALING_FORM,
            FormKind::CounselTherapy => &COUNSEL_FORM,
            FormKind::Hrv => &HRV_FORM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurveyPhase {
    Pre,
    Post,
}

impl SurveyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyPhase::Pre => "pre",
            SurveyPhase::Post => "post",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pre" => Some(SurveyPhase::Pre),
            "post" => Some(SurveyPhase::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: Ulid,
    pub form: FormKind,
    pub phase: Option<SurveyPhase>,
    /// Program name (program form) or counselling type.
    pub subject: Option<String>,
    pub sex: Option<String>,
    pub age_group: Option<String>,
    /// One slot per form item; `None` for unanswered items.
    pub scores: Vec<Option<f64>>,
}

// ── Reservation aggregate ────────────────────────────────────────

/// Which detail table an entry id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Program,
    Room,
    Place,
    Meal,
    Ledger,
    Document,
    Survey,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Program => "program",
            EntryKind::Room => "room assignment",
            EntryKind::Place => "place booking",
            EntryKind::Meal => "meal order",
            EntryKind::Ledger => "ledger item",
            EntryKind::Document => "document",
            EntryKind::Survey => "survey response",
        }
    }

    /// Whether adding or removing this entry touches the stay itself.
    pub fn requires_open_reservation(&self) -> bool {
        matches!(
            self,
            EntryKind::Program | EntryKind::Room | EntryKind::Place | EntryKind::Meal
        )
    }
}

/// A booking an entry holds on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldBooking {
    pub resource_id: Ulid,
    pub entry_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ReservationState {
    pub reservation: Reservation,
    pub participants: Option<Participants>,
    pub programs: Vec<ProgramSession>,
    pub rooms: Vec<RoomAssignment>,
    pub places: Vec<PlaceBooking>,
    pub meals: Vec<MealOrder>,
    pub ledger: Vec<LedgerItem>,
    pub documents: Vec<Document>,
    pub surveys: Vec<SurveyResponse>,
    pub deleted: bool,
}

impl ReservationState {
    pub fn new(reservation: Reservation) -> Self {
        Self {
            reservation,
            participants: None,
            programs: Vec::new(),
            rooms: Vec::new(),
            places: Vec::new(),
            meals: Vec::new(),
            ledger: Vec::new(),
            documents: Vec::new(),
            surveys: Vec::new(),
            deleted: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.reservation.id
    }

    /// Cancelled reservations keep their records but hold no resource time.
    pub fn holds_intervals(&self) -> bool {
        self.reservation.status != ReservationStatus::Cancelled
    }

    pub fn entry_count(&self) -> usize {
        self.programs.len()
            + self.rooms.len()
            + self.places.len()
            + self.meals.len()
            + self.ledger.len()
            + self.documents.len()
            + self.surveys.len()
    }

    /// Every resource booking recorded on this reservation, whether or not it
    /// currently holds time.
    pub fn bookings(&self) -> Vec<HeldBooking> {
        let rooms = self.rooms.iter().map(|r| HeldBooking {
            resource_id: r.room_id,
            entry_id: r.id,
            span: r.span(),
        });
        let places = self.places.iter().map(|p| HeldBooking {
            resource_id: p.place_id,
            entry_id: p.id,
            span: p.span,
        });
        let programs = self.programs.iter().filter_map(|s| {
            s.place_id.map(|place_id| HeldBooking {
                resource_id: place_id,
                entry_id: s.id,
                span: s.span,
            })
        });
        rooms.chain(places).chain(programs).collect()
    }

    pub fn booking_of(&self, entry_id: Ulid) -> Option<HeldBooking> {
        self.bookings().into_iter().find(|b| b.entry_id == entry_id)
    }

    /// Returns the kind of the removed entry, if it existed.
    pub fn remove_entry(&mut self, id: Ulid) -> Option<EntryKind> {
        fn take<T>(items: &mut Vec<T>, id: Ulid, key: impl Fn(&T) -> Ulid) -> bool {
            match items.iter().position(|item| key(item) == id) {
                Some(pos) => {
                    items.remove(pos);
                    true
                }
                None => false,
            }
        }
        if take(&mut self.programs, id, |e| e.id) {
            Some(EntryKind::Program)
        } else if take(&mut self.rooms, id, |e| e.id) {
            Some(EntryKind::Room)
        } else if take(&mut self.places, id, |e| e.id) {
            Some(EntryKind::Place)
        } else if take(&mut self.meals, id, |e| e.id) {
            Some(EntryKind::Meal)
        } else if take(&mut self.ledger, id, |e| e.id) {
            Some(EntryKind::Ledger)
        } else if take(&mut self.documents, id, |e| e.id) {
            Some(EntryKind::Document)
        } else if take(&mut self.surveys, id, |e| e.id) {
            Some(EntryKind::Survey)
        } else {
            None
        }
    }

    /// Whether every dated detail falls inside `[start, end]`.
    pub fn details_fit(&self, start: NaiveDate, end: NaiveDate) -> bool {
        let window = date_window(start, end);
        self.rooms
            .iter()
            .all(|r| start <= r.check_in && r.check_out <= end)
            && self.meals.iter().all(|m| start <= m.date && m.date <= end)
            && self.places.iter().all(|p| window.contains_span(&p.span))
            && self.programs.iter().all(|s| window.contains_span(&s.span))
    }

    pub fn uses_staff(&self, staff_id: Ulid) -> bool {
        self.programs
            .iter()
            .any(|s| s.staff_ids().any(|id| id == staff_id))
    }
}

// ── Events (WAL record format) ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: ResourceInfo,
    },
    ResourceUpdated {
        resource: ResourceInfo,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ClosureAdded {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    ClosureRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    StaffCreated {
        staff: Staff,
    },
    StaffUpdated {
        staff: Staff,
    },
    StaffDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    /// Removes the reservation and every record beneath it.
    ReservationDeleted {
        id: Ulid,
    },
    ParticipantsSet {
        reservation_id: Ulid,
        participants: Participants,
    },
    ProgramScheduled {
        reservation_id: Ulid,
        session: ProgramSession,
    },
    /// A whole room-assignment batch commits as one record.
    RoomsAssigned {
        reservation_id: Ulid,
        assignments: Vec<RoomAssignment>,
    },
    PlaceBooked {
        reservation_id: Ulid,
        booking: PlaceBooking,
    },
    MealOrdered {
        reservation_id: Ulid,
        order: MealOrder,
    },
    LedgerItemAdded {
        reservation_id: Ulid,
        item: LedgerItem,
    },
    DocumentAdded {
        reservation_id: Ulid,
        document: Document,
    },
    SurveyRecorded {
        reservation_id: Ulid,
        response: SurveyResponse,
    },
    /// Removes any detail entry (program, room, place, meal, ledger, document, survey).
    EntryRemoved {
        id: Ulid,
        reservation_id: Ulid,
    },
}

impl Event {
    /// The reservation an event applies to, if any.
    pub fn reservation_id(&self) -> Option<Ulid> {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                Some(reservation.id)
            }
            Event::ReservationDeleted { id } => Some(*id),
            Event::ParticipantsSet { reservation_id, .. }
            | Event::ProgramScheduled { reservation_id, .. }
            | Event::RoomsAssigned { reservation_id, .. }
            | Event::PlaceBooked { reservation_id, .. }
            | Event::MealOrdered { reservation_id, .. }
            | Event::LedgerItemAdded { reservation_id, .. }
            | Event::DocumentAdded { reservation_id, .. }
            | Event::SurveyRecorded { reservation_id, .. }
            | Event::EntryRemoved { reservation_id, .. } => Some(*reservation_id),
            Event::ResourceCreated { .. }
            | Event::ResourceUpdated { .. }
            | Event::ResourceDeleted { .. }
            | Event::ClosureAdded { .. }
            | Event::ClosureRemoved { .. }
            | Event::StaffCreated { .. }
            | Event::StaffUpdated { .. }
            | Event::StaffDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub reservation_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}
