use crate::model::*;

/// Free time of `resource` inside `query`: the window minus closures minus
/// the ranges where bookings (extended by `buffer_after`) fill every slot.
pub fn availability(resource: &ResourceState, query: &Span) -> Vec<Span> {
    let buffer = resource.info.buffer_after.unwrap_or(0);
    let search = Span::new(query.start.saturating_sub(buffer), query.end);

    let mut closed = Vec::new();
    let mut allocs = Vec::new();
    for interval in resource.overlapping(&search) {
        match interval.kind {
            IntervalKind::Closure { .. } => closed.push(interval.span),
            IntervalKind::Booking { .. } => allocs.push(interval.span.extended(buffer)),
        }
    }

    let mut free = vec![*query];
    if !closed.is_empty() {
        closed.sort_by_key(|s| s.start);
        free = subtract_intervals(&free, &merge_overlapping(&closed));
    }
    if !allocs.is_empty() {
        allocs.sort_by_key(|s| s.start);
        let saturated = compute_saturated_spans(&allocs, resource.info.capacity);
        free = subtract_intervals(&free, &saturated);
    }
    free
}

/// Merge sorted overlapping or touching spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut first = 0;

    for &b in base {
        let mut cursor = b.start;
        while first < to_remove.len() && to_remove[first].end <= cursor {
            first += 1;
        }
        for r in to_remove[first..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }
    result
}

/// Sweep line over sorted allocations: the merged ranges where at least
/// `capacity` of them are live at once.
pub fn compute_saturated_spans(allocs: &[Span], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(allocs);
    }

    // Ends sort before starts at the same instant: touching spans never stack.
    let mut edges: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        edges.push((a.start, 1));
        edges.push((a.end, -1));
    }
    edges.sort_unstable();

    let mut result: Vec<Span> = Vec::new();
    let mut live: i64 = 0;
    let mut saturated_since: Option<Ms> = None;
    for (at, delta) in edges {
        live += delta as i64;
        if live >= capacity as i64 {
            saturated_since.get_or_insert(at);
        } else if let Some(start) = saturated_since.take()
            && at > start
        {
            match result.last_mut() {
                Some(last) if last.end == start => last.end = at,
                _ => result.push(Span::new(start, at)),
            }
        }
    }
    result
}

/// Drop free spans shorter than `min_duration`.
pub fn filter_min_duration(spans: Vec<Span>, min_duration: Option<Ms>) -> Vec<Span> {
    match min_duration {
        Some(min) => spans.into_iter().filter(|s| s.duration_ms() >= min).collect(),
        None => spans,
    }
}
