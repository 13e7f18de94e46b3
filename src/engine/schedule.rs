use crate::config::ScheduleConfig;
use crate::model::*;

/// Back-to-back slot spans for one calendar day.
///
/// `day` is any instant within the day; slots start at `day_start` and a
/// trailing remainder shorter than one slot is dropped.
pub fn day_slots(day: Ms, schedule: &ScheduleConfig) -> Vec<Span> {
    let midnight = day_of(day);
    let last_start = schedule.day_end_ms - schedule.slot_duration_ms;
    let mut spans = Vec::new();
    let mut offset = schedule.day_start_ms;
    while offset <= last_start {
        let start = midnight + offset;
        spans.push(Span::new(start, start + schedule.slot_duration_ms));
        offset += schedule.slot_duration_ms;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 60 * MINUTE_MS;
    const DAY: Ms = 19_700 * DAY_MS;

    #[test]
    fn default_schedule_is_hourly_8_to_22() {
        let spans = day_slots(DAY, &ScheduleConfig::default());
        assert_eq!(spans.len(), 14);
        assert_eq!(spans[0], Span::new(DAY + 8 * H, DAY + 9 * H));
        assert_eq!(spans[13], Span::new(DAY + 21 * H, DAY + 22 * H));
    }

    #[test]
    fn any_instant_in_day_yields_same_slots() {
        let schedule = ScheduleConfig::default();
        assert_eq!(day_slots(DAY, &schedule), day_slots(DAY + 15 * H + 7, &schedule));
    }

    #[test]
    fn partial_trailing_slot_dropped() {
        let schedule = ScheduleConfig::new(45, "09:00", "11:00").unwrap();
        let spans = day_slots(DAY, &schedule);
        assert_eq!(
            spans,
            vec![
                Span::new(DAY + 9 * H, DAY + 9 * H + 45 * MINUTE_MS),
                Span::new(DAY + 9 * H + 45 * MINUTE_MS, DAY + 10 * H + 30 * MINUTE_MS),
            ]
        );
    }

    #[test]
    fn slots_are_contiguous() {
        let schedule = ScheduleConfig::new(30, "08:00", "12:00").unwrap();
        let spans = day_slots(DAY, &schedule);
        assert_eq!(spans.len(), 8);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
