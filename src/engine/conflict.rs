use crate::model::*;

use super::EngineError;
use super::availability::compute_saturated_spans;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::invalid("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// The one booking rule. `span` may be placed on `rs` if no closure overlaps
/// it and, with every booking (including the new one) extended by the
/// resource's `buffer_after`, no instant would hold more than `capacity`
/// bookings.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    let resource_id = rs.id();
    let buffer = rs.info.buffer_after.unwrap_or(0);
    let wanted = span.extended(buffer);
    // Existing bookings reach forward by `buffer`, and ours reaches forward into them.
    let search = Span::new(span.start.saturating_sub(buffer), wanted.end);

    let mut allocs = Vec::new();
    for interval in rs.overlapping(&search) {
        match &interval.kind {
            IntervalKind::Closure { .. } => {
                if interval.span.overlaps(span) {
                    return Err(EngineError::ClosedForBooking {
                        resource_id,
                        closure: interval.id,
                    });
                }
            }
            IntervalKind::Booking { .. } => {
                let effective = interval.span.extended(buffer);
                if !effective.overlaps(&wanted) {
                    continue;
                }
                if rs.info.capacity <= 1 {
                    return Err(EngineError::Conflict {
                        resource_id,
                        with: interval.id,
                    });
                }
                allocs.push(effective);
            }
        }
    }

    if rs.info.capacity > 1 {
        allocs.sort_by_key(|s| s.start);
        let saturated = compute_saturated_spans(&allocs, rs.info.capacity);
        if saturated.iter().any(|sat| sat.overlaps(&wanted)) {
            return Err(EngineError::CapacityExceeded {
                resource_id,
                capacity: rs.info.capacity,
            });
        }
    }
    Ok(())
}
