//! Host-side driver: reads visit contexts, runs the dimension over a bounded
//! number of concurrent interactions, and writes the records as NDJSON.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::contact::{ContactResolver, ContactSource};
use crate::dimension::custom_key::CustomKey;
use crate::dimension::metric::AggregateRecord;
use crate::dimension::Dimension;
use crate::export::health::HealthMetrics;
use crate::interaction::parse::{parse_visit, ParseError};
use crate::unique::UniqueEventCache;

/// Builds the configured dimension on top of a contact source.
///
/// When `metrics` is given, contact lookups and aggregation outcomes are
/// recorded in it.
pub fn dimension_from_config<S: ContactSource>(
    cfg: &Config,
    source: S,
    metrics: Option<Arc<HealthMetrics>>,
) -> Dimension<S> {
    let cache = Arc::new(UniqueEventCache::new(cfg.unique_events.ttl));

    let mut resolver =
        ContactResolver::new(source, cfg.contacts.facet.clone(), cfg.contacts.retry.clone());
    if let Some(ref m) = metrics {
        let m = Arc::clone(m);
        resolver = resolver.with_metrics(Box::new(move |status, duration| {
            m.record_contact_lookup(status, duration);
        }));
    }

    let dimension = Dimension::new(
        cfg.dimension.id,
        CustomKey::from_config(&cfg.dimension),
        cache,
        resolver,
    );

    match metrics {
        Some(m) => dimension.with_metrics(m),
        None => dimension,
    }
}

/// One output line: a record tagged with where it came from.
#[derive(Debug, Serialize)]
struct OutputRecord<'a> {
    dimension_id: Uuid,
    visit_id: Uuid,
    #[serde(flatten)]
    record: &'a AggregateRecord,
}

/// Counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Non-blank input lines.
    pub lines_read: usize,
    /// Lines that could not be decoded.
    pub parse_errors: usize,
    /// Visit contexts handed to the dimension.
    pub visits_processed: usize,
    pub records_emitted: usize,
    /// Whether reading stopped early on cancellation.
    pub cancelled: bool,
}

struct Pending {
    visit_id: Uuid,
    handle: JoinHandle<Vec<AggregateRecord>>,
}

/// Runs a dimension over a stream of visit contexts.
///
/// Each interaction is aggregated start to finish on its own task; at most
/// `workers` run at once. Records are written in input order.
pub struct Pipeline<S> {
    dimension: Arc<Dimension<S>>,
    workers: usize,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: ContactSource + 'static> Pipeline<S> {
    pub fn new(dimension: Dimension<S>, workers: usize) -> Self {
        Self {
            dimension: Arc::new(dimension),
            workers: workers.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reads NDJSON visit contexts from `input` until EOF or cancellation and
    /// writes every resulting record to `output`.
    ///
    /// Undecodable lines are logged and skipped. An interaction whose task
    /// fails is logged and contributes no records. Interactions already
    /// started when `cancel` fires are finished and written.
    pub async fn run<R, W>(
        &self,
        input: R,
        mut output: W,
        cancel: CancellationToken,
    ) -> Result<PipelineSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = PipelineSummary::default();
        let mut lines = input.lines();
        let mut pending: VecDeque<Pending> = VecDeque::with_capacity(self.workers);
        let mut line_no = 0usize;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(in_flight = pending.len(), "input cancelled, finishing in-flight interactions");
                    summary.cancelled = true;
                    break;
                }
                line = lines.next_line() => line.context("reading input")?,
            };

            let Some(line) = line else {
                break;
            };
            line_no += 1;

            let ctx = match parse_visit(line_no, &line) {
                Ok(ctx) => ctx,
                Err(ParseError::Empty { .. }) => continue,
                Err(e) => {
                    summary.lines_read += 1;
                    summary.parse_errors += 1;
                    warn!(error = %e, "skipping undecodable input line");
                    if let Some(ref m) = self.metrics {
                        m.input_parse_errors.with_label_values(&[e.kind()]).inc();
                    }
                    continue;
                }
            };
            summary.lines_read += 1;

            if pending.len() >= self.workers {
                if let Some(done) = pending.pop_front() {
                    self.finish(done, &mut output, &mut summary).await?;
                }
            }

            let dimension = Arc::clone(&self.dimension);
            let visit_id = ctx.visit_id;
            let handle = tokio::spawn(async move { dimension.get_data(&ctx).await });
            pending.push_back(Pending { visit_id, handle });
        }

        while let Some(done) = pending.pop_front() {
            self.finish(done, &mut output, &mut summary).await?;
        }

        output.flush().await.context("flushing output")?;

        debug!(
            lines = summary.lines_read,
            parse_errors = summary.parse_errors,
            visits = summary.visits_processed,
            records = summary.records_emitted,
            "pipeline finished"
        );

        Ok(summary)
    }

    async fn finish<W>(
        &self,
        pending: Pending,
        output: &mut W,
        summary: &mut PipelineSummary,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let records = match pending.handle.await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    visit_id = %pending.visit_id,
                    error = %e,
                    "aggregation task failed, visit yields no records"
                );
                if let Some(ref m) = self.metrics {
                    m.visits_failed.inc();
                }
                Vec::new()
            }
        };

        summary.visits_processed += 1;

        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in &records {
            serde_json::to_writer(
                &mut buf,
                &OutputRecord {
                    dimension_id: self.dimension.id(),
                    visit_id: pending.visit_id,
                    record,
                },
            )
            .context("encoding record")?;
            buf.push(b'\n');
        }

        output.write_all(&buf).await.context("writing records")?;
        summary.records_emitted += records.len();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{Contact, LookupError};

    struct NoContacts;

    impl ContactSource for NoContacts {
        async fn fetch_contact(
            &self,
            _contact_id: Uuid,
            _facet: &str,
        ) -> Result<Option<Contact>, LookupError> {
            Ok(None)
        }
    }

    fn pipeline(workers: usize) -> Pipeline<NoContacts> {
        let cfg = Config::default();
        Pipeline::new(dimension_from_config(&cfg, NoContacts, None), workers)
    }

    const VISIT: &str = r#"{"visit_id":"00000000-0000-0000-0000-0000000000aa","interaction":{"id":"00000000-0000-0000-0000-000000000001","events":[{"id":"00000000-0000-0000-0000-000000000010","timestamp":"2024-03-01T10:00:00Z","type":"message","event_kind":"open","message_id":"00000000-0000-0000-0000-000000000100","manager_root_id":"00000000-0000-0000-0000-000000000102"}]}}"#;

    #[tokio::test]
    async fn test_run_writes_records_and_skips_bad_lines() {
        let input = format!("{VISIT}\n\n{{broken\n{VISIT}\n");
        let mut out = Vec::new();

        let summary = pipeline(2)
            .run(input.as_bytes(), &mut out, CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(summary.lines_read, 3);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.visits_processed, 2);
        assert_eq!(summary.records_emitted, 2);
        assert!(!summary.cancelled);

        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["visit_id"], "00000000-0000-0000-0000-0000000000aa");
        assert_eq!(
            lines[0]["dimension_id"],
            "7558fc89-c25f-4606-bbc5-43b91a382ac9"
        );
        assert_eq!(lines[0]["bounces"], 1);
    }

    /// Crashes on one contact, knows nobody else.
    struct CrashesOn(Uuid);

    impl ContactSource for CrashesOn {
        async fn fetch_contact(
            &self,
            contact_id: Uuid,
            _facet: &str,
        ) -> Result<Option<Contact>, LookupError> {
            if contact_id == self.0 {
                panic!("contact client crashed");
            }
            Ok(None)
        }
    }

    fn with_contact(visit: &str, contact: &str) -> String {
        visit.replace(
            r#""interaction":{"id""#,
            &format!(r#""interaction":{{"contact_id":"{contact}","id""#),
        )
    }

    #[tokio::test]
    async fn test_failed_interaction_does_not_stop_run() {
        let crashing = Uuid::from_u128(0xdead);
        let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let pipeline = Pipeline::new(
            dimension_from_config(&Config::default(), CrashesOn(crashing), None),
            2,
        )
        .with_metrics(Arc::clone(&metrics));

        let first = with_contact(VISIT, &crashing.to_string());
        let second = with_contact(
            &VISIT.replace("0000000000aa", "0000000000bb"),
            &Uuid::from_u128(0xbeef).to_string(),
        );
        let third = VISIT.replace("0000000000aa", "0000000000cc");
        let input = format!("{first}\n{second}\n{third}\n");
        let mut out = Vec::new();

        let summary = pipeline
            .run(input.as_bytes(), &mut out, CancellationToken::new())
            .await
            .expect("run survives a failed interaction");

        assert_eq!(summary.visits_processed, 3);
        assert_eq!(summary.records_emitted, 2);

        let text = String::from_utf8(out).expect("utf8");
        let visits: Vec<String> = text
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).expect("json line");
                v["visit_id"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(
            visits,
            vec![
                "00000000-0000-0000-0000-0000000000bb",
                "00000000-0000-0000-0000-0000000000cc"
            ]
        );

        let rendered = metrics.render().expect("render metrics");
        assert!(rendered.contains("campaign_dimensions_visits_failed_total 1"));
    }

    #[tokio::test]
    async fn test_run_stops_reading_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let input = format!("{VISIT}\n");
        let mut out = Vec::new();
        let summary = pipeline(1)
            .run(input.as_bytes(), &mut out, cancel)
            .await
            .expect("run");

        assert!(summary.cancelled);
        assert_eq!(summary.visits_processed, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_run_preserves_input_order_with_one_worker() {
        let second = VISIT.replace("0000000000aa", "0000000000bb");
        let input = format!("{VISIT}\n{second}\n");
        let mut out = Vec::new();

        pipeline(1)
            .run(input.as_bytes(), &mut out, CancellationToken::new())
            .await
            .expect("run");

        let text = String::from_utf8(out).expect("utf8");
        let visits: Vec<String> = text
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).expect("json line");
                v["visit_id"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(
            visits,
            vec![
                "00000000-0000-0000-0000-0000000000aa",
                "00000000-0000-0000-0000-0000000000bb"
            ]
        );
    }
}
