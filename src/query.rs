use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::Result;
use crate::model::{format_timestamp, TIMESTAMP_FORMAT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCount {
    pub kind: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCount {
    pub subject: String,
    pub count: usize,
}

/// Mean gap between consecutive records of one kind for one subject.
#[derive(Debug, Clone, PartialEq)]
pub enum IntervalStats {
    Average { seconds: f64, count: usize },
    InsufficientData { count: usize },
}

/// Records per kind that occurred at or after `since`.
pub fn count_by_kind(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<KindCount>> {
    let mut stmt = conn.prepare(
        "SELECT kind, COUNT(*) FROM events
         WHERE occurred_at >= ?1
         GROUP BY kind
         ORDER BY COUNT(*) DESC, kind",
    )?;
    let rows = stmt
        .query_map(params![format_timestamp(&since)], |row| {
            Ok(KindCount {
                kind: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most active subjects since `since`, busiest first.
pub fn top_subjects(conn: &Connection, since: DateTime<Utc>, limit: usize) -> Result<Vec<SubjectCount>> {
    let mut stmt = conn.prepare(
        "SELECT subject, COUNT(*) AS cnt FROM events
         WHERE occurred_at >= ?1
         GROUP BY subject
         ORDER BY cnt DESC, subject
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![format_timestamp(&since), limit], |row| {
            Ok(SubjectCount {
                subject: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn average_interval(conn: &Connection, subject: &str, kind: &str) -> Result<IntervalStats> {
    let mut stmt = conn.prepare(
        "SELECT occurred_at FROM events
         WHERE subject = ?1 AND kind = ?2
         ORDER BY occurred_at",
    )?;
    let stamps = stmt
        .query_map(params![subject, kind], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Stored values were written with TIMESTAMP_FORMAT, so anything unparseable is foreign data.
    let times: Vec<DateTime<Utc>> = stamps
        .iter()
        .filter_map(|s| chrono::NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
        .map(|t| t.and_utc())
        .collect();

    Ok(interval_stats(&times))
}

fn interval_stats(times: &[DateTime<Utc>]) -> IntervalStats {
    let count = times.len();
    if count < 2 {
        return IntervalStats::InsufficientData { count };
    }
    let total: f64 = times
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .sum();
    IntervalStats::Average {
        seconds: total / (count - 1) as f64,
        count,
    }
}

/// Subjects with more than one record of `kind`, most records first.
pub fn repeated_subjects(conn: &Connection, kind: &str) -> Result<Vec<SubjectCount>> {
    let mut stmt = conn.prepare(
        "SELECT subject, COUNT(*) AS cnt FROM events
         WHERE kind = ?1
         GROUP BY subject
         HAVING cnt > 1
         ORDER BY cnt DESC, subject",
    )?;
    let rows = stmt
        .query_map(params![kind], |row| {
            Ok(SubjectCount {
                subject: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
