use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Sessions that can still block a slot on `date`.
fn live_on<'a>(
    sessions: &'a [Session],
    date: NaiveDate,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Session> {
    sessions.iter().filter(move |s| {
        !s.deleted && s.state.occupies_slot() && s.date == date && Some(s.id) != exclude
    })
}

/// Classify existing sessions overlapping `candidate` as professional and/or
/// location conflicts.
pub fn find_conflicts(
    sessions: &[Session],
    candidate: &ConflictCandidate,
    exclude_session_id: Option<Ulid>,
) -> ConflictResult {
    let mut result = ConflictResult::default();

    for session in live_on(sessions, candidate.date, exclude_session_id) {
        if !session.window().overlaps(&candidate.window) {
            continue;
        }
        if session.professional_id == candidate.professional_id {
            result.professional_conflicts.push(session.clone());
        }
        if let (Some(theirs), Some(ours)) = (session.location_id, candidate.location_id)
            && theirs == ours
        {
            result.location_conflicts.push(session.clone());
        }
    }

    result.has_conflict =
        !result.professional_conflicts.is_empty() || !result.location_conflicts.is_empty();
    result
}

/// Every live session on `date` for the filtered professional or location,
/// as busy slots. A session matching both filters yields two slots.
pub fn find_busy_slots(sessions: &[Session], date: NaiveDate, filter: &ResourceFilter) -> Vec<BusySlot> {
    let mut slots = Vec::new();

    for session in live_on(sessions, date, None) {
        if filter.professional_id == Some(session.professional_id) {
            slots.push(busy_slot(session, ResourceKind::Professional));
        }
        if filter.location_id.is_some() && filter.location_id == session.location_id {
            slots.push(busy_slot(session, ResourceKind::Location));
        }
    }

    slots.sort_by_key(|s| s.start);
    slots
}

fn busy_slot(session: &Session, resource_type: ResourceKind) -> BusySlot {
    BusySlot {
        start: session.start_time,
        end: session.end_time,
        title: session.title.clone(),
        resource_type,
    }
}

/// Whether two sessions occupy overlapping time on the same calendar date.
pub(crate) fn sessions_collide(a: &Session, b: &Session) -> bool {
    a.date == b.date && a.window().overlaps(&b.window())
}
