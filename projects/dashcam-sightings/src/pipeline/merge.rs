// Cross-sighting merge: folds the sightings of every video into one row per
// continuous appearance of a vehicle

use crate::pipeline::types::{ReportRow, Sighting};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sightings of one plate starting within this many seconds of the previous
/// row's end are folded into it.
pub const DEFAULT_MERGE_GAP_SECS: f64 = 1.0;

pub fn merge(sightings: &[Sighting]) -> Vec<ReportRow> {
    merge_with_gap(sightings, DEFAULT_MERGE_GAP_SECS)
}

/// Group by identity key, then fold each group's time-sorted sightings.
///
/// The result depends only on the set of sightings, not their order: rows come
/// out sorted by key, then by start time.
pub fn merge_with_gap(sightings: &[Sighting], gap: f64) -> Vec<ReportRow> {
    let mut groups: BTreeMap<String, Vec<&Sighting>> = BTreeMap::new();

    let mut plateless: Vec<&Sighting> = Vec::new();
    for sighting in sightings {
        match sighting.plate_number() {
            Some(number) => groups.entry(number.to_string()).or_default().push(sighting),
            None => plateless.push(sighting),
        }
    }

    // Plateless sightings never merge with each other; each gets its own key
    plateless.sort_by(|a, b| {
        chronological(a, b).then_with(|| a.confidence.total_cmp(&b.confidence))
    });
    for (seq, sighting) in plateless.into_iter().enumerate() {
        groups.insert(synthetic_key(sighting, seq), vec![sighting]);
    }

    let mut rows = Vec::new();
    for (key, mut group) in groups {
        group.sort_by(|a, b| chronological(a, b));
        let folded = fold_group(&group, gap);
        tracing::debug!("Merged group {}: {} sightings -> {} rows", key, group.len(), folded.len());
        rows.extend(folded);
    }
    rows
}

fn synthetic_key(sighting: &Sighting, seq: usize) -> String {
    let millis = (sighting.time_start * 1000.0).round().max(0.0) as u64;
    format!("Unknown-{:010}-{:04}", millis, seq)
}

fn chronological(a: &Sighting, b: &Sighting) -> Ordering {
    a.time_start
        .total_cmp(&b.time_start)
        .then_with(|| a.time_end.total_cmp(&b.time_end))
        .then_with(|| a.origin.source.cmp(&b.origin.source))
}

fn fold_group(group: &[&Sighting], gap: f64) -> Vec<ReportRow> {
    let mut rows = Vec::new();
    let mut iter = group.iter();
    let Some(first) = iter.next() else {
        return rows;
    };

    let mut acc = row_from(first);
    for sighting in iter {
        if sighting.time_start <= acc.time_end + gap {
            acc.time_end = acc.time_end.max(sighting.time_end);
            acc.bbox = sighting.bbox;
            acc.confidence = acc.confidence.max(sighting.confidence);
            if sighting.plate.is_some() {
                acc.plate = sighting.plate.clone();
            }
            if sighting.identity.is_some() {
                acc.identity = sighting.identity.clone();
            }
        } else {
            rows.push(std::mem::replace(&mut acc, row_from(sighting)));
        }
    }
    rows.push(acc);
    rows
}

fn row_from(sighting: &Sighting) -> ReportRow {
    ReportRow {
        time_start: sighting.time_start,
        time_end: sighting.time_end,
        bbox: sighting.bbox,
        confidence: sighting.confidence,
        plate: sighting.plate.clone(),
        identity: sighting.identity.clone(),
        origin: sighting.origin.clone(),
    }
}

/// `HH:MM:SS.mmm`, rounded to the nearest millisecond
pub fn format_time(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round().max(0.0) as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.3}s", seconds)
    } else if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else {
        let whole = seconds as u64;
        format!("{}m {}s", whole / 60, whole % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{
        BBox, CameraAngle, SightingOrigin, TrackedPlate, VehicleIdentity,
    };
    use std::path::PathBuf;

    fn sighting(start: f64, end: f64, plate: Option<&str>) -> Sighting {
        Sighting {
            time_start: start,
            time_end: end,
            bbox: BBox::new(0.1, 0.1, 0.2, 0.2),
            confidence: 0.8,
            plate: plate.map(|number| TrackedPlate {
                number: number.to_string(),
                confidence: 0.9,
                bbox: BBox::new(0.15, 0.2, 0.05, 0.02),
                first_appearance: start,
                last_appearance: end,
            }),
            identity: None,
            origin: SightingOrigin {
                source: PathBuf::from("2024-03-01_08-15-00-front.mp4"),
                angle: CameraAngle::Front,
                clip_id: "2024-03-01_08-15-00".to_string(),
            },
        }
    }

    #[test]
    fn test_merges_within_gap_and_splits_beyond() {
        let rows = merge(&[
            sighting(0.0, 2.0, Some("ABC-123")),
            sighting(2.5, 4.0, Some("ABC-123")),
            sighting(10.0, 12.0, Some("ABC-123")),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].time_start, rows[0].time_end), (0.0, 4.0));
        assert_eq!((rows[1].time_start, rows[1].time_end), (10.0, 12.0));
        assert_eq!(rows[0].plate_number(), "ABC-123");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let rows = merge(&[
            sighting(0.0, 2.0, Some("ABC-123")),
            sighting(2.5, 4.0, Some("ABC-123")),
            sighting(1.0, 3.0, None),
            sighting(1.0, 3.0, None),
            sighting(5.0, 6.0, Some("XYZ 9876")),
        ]);
        let as_sightings: Vec<Sighting> = rows.iter().map(Sighting::from).collect();
        assert_eq!(merge(&as_sightings), rows);
    }

    #[test]
    fn test_merge_ignores_input_order() {
        let mut input = vec![
            sighting(10.0, 12.0, Some("ABC-123")),
            sighting(3.0, 4.0, None),
            sighting(0.0, 2.0, Some("ABC-123")),
            sighting(0.5, 1.0, None),
            sighting(2.5, 4.0, Some("ABC-123")),
        ];
        let forward = merge(&input);
        input.reverse();
        assert_eq!(merge(&input), forward);
    }

    #[test]
    fn test_plateless_sightings_stay_separate() {
        let rows = merge(&[sighting(0.0, 2.0, None), sighting(0.5, 2.5, None)]);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.plate_number().is_empty()));
    }

    #[test]
    fn test_rows_ordered_by_key_then_start() {
        let rows = merge(&[
            sighting(20.0, 21.0, Some("ZZZ-999")),
            sighting(30.0, 31.0, Some("AAA-111")),
            sighting(0.0, 1.0, Some("AAA-111")),
        ]);
        let order: Vec<(&str, f64)> = rows.iter().map(|r| (r.plate_number(), r.time_start)).collect();
        assert_eq!(order, vec![("AAA-111", 0.0), ("AAA-111", 30.0), ("ZZZ-999", 20.0)]);
    }

    #[test]
    fn test_fold_takes_latest_identity_and_max_confidence() {
        let mut first = sighting(0.0, 2.0, Some("ABC-123"));
        first.identity = Some(VehicleIdentity {
            make: Some("Tesla".to_string()),
            ..Default::default()
        });
        first.confidence = 0.95;
        let second = sighting(2.2, 3.0, Some("ABC-123"));

        let rows = merge(&[first, second]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].make(), "Tesla");
        assert_eq!(rows[0].confidence, 0.95);
        assert_eq!(rows[0].time_end, 3.0);
    }

    #[test]
    fn test_format_time_and_duration() {
        assert_eq!(format_time(0.0), "00:00:00.000");
        assert_eq!(format_time(3723.4567), "01:02:03.457");
        assert_eq!(format_duration(0.5), "0.500s");
        assert_eq!(format_duration(12.34), "12.3s");
        assert_eq!(format_duration(75.0), "1m 15s");
    }
}
