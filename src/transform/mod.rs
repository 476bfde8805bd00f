pub mod normalize;

use std::collections::HashSet;

use indicatif::ProgressBar;
use rayon::prelude::*;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::Archive;
use crate::db;
use crate::error::StorageError;
use crate::model::{ArchiveRef, RawPage};
use crate::settings::Settings;
use normalize::{normalize, Disposition};

/// Per-page tally. `seen` = inserted + filtered + invalid + duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageReport {
    pub key: String,
    pub seen: usize,
    pub inserted: usize,
    pub filtered: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

#[derive(Debug)]
pub enum TransformStop {
    Cancelled,
    Storage(StorageError),
}

#[derive(Debug, Default)]
pub struct TransformReport {
    pub pages: Vec<PageReport>,
    pub unreadable: usize,
    pub stopped: Option<TransformStop>,
}

impl TransformReport {
    pub fn inserted(&self) -> usize {
        self.pages.iter().map(|p| p.inserted).sum()
    }
}

/// Turns archived pages into stored records, once per upstream id.
pub struct Transformer {
    kinds: HashSet<String>,
    max_payload_bytes: usize,
}

impl Transformer {
    pub fn new(kinds: HashSet<String>, max_payload_bytes: usize) -> Self {
        Transformer {
            kinds,
            max_payload_bytes,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.allowed_kinds(), settings.max_payload_bytes)
    }

    /// Process `refs` in order. A store failure stops the remaining pages; earlier pages stay committed.
    pub fn transform_pages(
        &self,
        conn: &Connection,
        archive: &Archive,
        refs: &[ArchiveRef],
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> TransformReport {
        let mut report = TransformReport::default();

        for page_ref in refs {
            if cancel.is_cancelled() {
                info!(key = %page_ref.key, "Transform cancelled before page");
                report.stopped = Some(TransformStop::Cancelled);
                break;
            }

            let page = match archive.read(page_ref) {
                Ok(p) => p,
                Err(e) => {
                    error!(key = %page_ref.key, "Skipping unreadable archived page: {}", e);
                    report.unreadable += 1;
                    progress.inc(1);
                    continue;
                }
            };

            match self.transform_page(conn, &page) {
                Ok(page_report) => {
                    info!(
                        key = %page_report.key,
                        seen = page_report.seen,
                        inserted = page_report.inserted,
                        filtered = page_report.filtered,
                        invalid = page_report.invalid,
                        duplicates = page_report.duplicates,
                        "Transformed page"
                    );
                    report.pages.push(page_report);
                }
                Err(e) => {
                    error!(key = %page_ref.key, "Store failure, abandoning remaining pages: {}", e);
                    report.stopped = Some(TransformStop::Storage(e));
                    break;
                }
            }
            progress.inc(1);
        }

        report
    }

    /// All inserts for one page commit together or not at all.
    pub fn transform_page(&self, conn: &Connection, page: &RawPage) -> Result<PageReport, StorageError> {
        let decided: Vec<Disposition> = page
            .records
            .par_iter()
            .map(|raw| normalize(raw, &self.kinds, self.max_payload_bytes))
            .collect();

        let mut report = PageReport {
            key: page.key.clone(),
            seen: decided.len(),
            ..Default::default()
        };

        let tx = db::begin_batch(conn)?;
        for disposition in decided {
            match disposition {
                Disposition::Filtered => report.filtered += 1,
                Disposition::Invalid { id, error } => {
                    warn!(
                        key = %page.key,
                        id = id.as_deref().unwrap_or("-"),
                        "Dropping malformed record: {}",
                        error
                    );
                    report.invalid += 1;
                }
                Disposition::Accept(record) => {
                    // The existence check skips the common case; the primary key settles races.
                    if db::event_exists(&tx, &record.id)? || !db::insert_event(&tx, &record)? {
                        debug!(id = %record.id, "Already stored");
                        report.duplicates += 1;
                    } else {
                        report.inserted += 1;
                    }
                }
            }
        }
        tx.commit()?;

        Ok(report)
    }
}
