use crate::cli::Pattern;
use crate::config::{BenchmarkSettings, OutputSettings};
use crate::error::FailureKind;
use crate::matrix::{CaseParams, TestCase};
use crate::metrics::{ReceiveTotals, SessionMetrics};
use crate::protocol::PairAssignment;
use crate::utils::{format_bits_rate, generate_test_id, print_table_row, print_table_separator};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Columns of the results CSV, in order
pub const CSV_COLUMNS: [&str; 19] = [
    "case_index",
    "pattern",
    "message_size",
    "message_count",
    "zero_copy",
    "send_hwm",
    "recv_hwm",
    "pair_id",
    "messages_sent",
    "messages_received",
    "sender_dropped",
    "receiver_dropped",
    "pct_received",
    "bytes_transferred",
    "elapsed_seconds",
    "throughput_bps",
    "status",
    "failure_kind",
    "detail",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    Failed { kind: FailureKind, detail: String },
}

/// One receiver's share of a pair record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverResult {
    pub worker_id: String,
    pub slot: usize,
    /// False when the receiver never delivered a CASE_RESULT
    pub reported: bool,
    pub messages_received: u64,
    /// Received over the sender's message count
    pub pct_received: f64,
    pub elapsed_seconds: f64,
}

/// Result of one pair for one case. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub case_index: u64,
    pub pattern: Pattern,
    pub message_size: usize,
    pub message_count: u64,
    pub zero_copy: bool,
    pub send_hwm: usize,
    pub recv_hwm: usize,
    pub pair_id: usize,
    /// Deliveries offered by the sender: the count for work-queue, the count
    /// times the number of receivers for fan-out
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Fan-out messages the sender discarded at a full peer queue
    pub sender_dropped: u64,
    /// Fan-out messages the receivers discarded at their own full queues
    pub receiver_dropped: u64,
    pub bytes_transferred: u64,
    pub elapsed_seconds: f64,
    /// Bits per second
    pub throughput_bps: f64,
    pub pct_received: f64,
    pub status: RecordStatus,
    pub receivers: Vec<ReceiverResult>,
}

impl ResultRecord {
    /// Build a pair's record from what its workers reported. `reports`
    /// follows the order of `pair.receivers`; `None` marks a worker that
    /// sent nothing. The sender's report only contributes its drop count. Any `failure` marks the record failed but keeps the
    /// partial counts.
    pub fn from_reports(
        case: &TestCase,
        pair: &PairAssignment,
        sender: Option<&SessionMetrics>,
        reports: &[Option<&SessionMetrics>],
        failure: Option<(FailureKind, String)>,
    ) -> Self {
        let messages_sent = case.offered_messages(pair.receivers.len());

        let receivers: Vec<ReceiverResult> = pair
            .receivers
            .iter()
            .enumerate()
            .map(|(i, receiver)| {
                let report = reports.get(i).copied().flatten();
                let received = report.map_or(0, |m| m.messages_received);
                ReceiverResult {
                    worker_id: receiver.id.clone(),
                    slot: receiver.slot,
                    reported: report.is_some(),
                    messages_received: received,
                    pct_received: ratio(received, case.message_count),
                    elapsed_seconds: report.map_or(0.0, |m| m.elapsed_seconds),
                }
            })
            .collect();

        let totals = ReceiveTotals::aggregate(reports.iter().copied().flatten());

        Self {
            case_index: case.index,
            pattern: case.pattern,
            message_size: case.message_size,
            message_count: case.message_count,
            zero_copy: case.zero_copy,
            send_hwm: case.send_hwm,
            recv_hwm: case.recv_hwm,
            pair_id: pair.pair_id,
            messages_sent,
            messages_received: totals.messages_received,
            sender_dropped: sender.map_or(0, |m| m.messages_dropped),
            receiver_dropped: totals.messages_dropped,
            bytes_transferred: totals.bytes_transferred,
            elapsed_seconds: totals.elapsed_seconds,
            throughput_bps: totals.throughput_bps(),
            pct_received: ratio(totals.messages_received, messages_sent),
            status: match failure {
                Some((kind, detail)) => RecordStatus::Failed { kind, detail },
                None => RecordStatus::Ok,
            },
            receivers,
        }
    }

    /// Record for a pair that never ran the case
    pub fn failed(case: &TestCase, pair: &PairAssignment, kind: FailureKind, detail: String) -> Self {
        Self::from_reports(case, pair, None, &[], Some((kind, detail)))
    }

    pub fn is_ok(&self) -> bool {
        self.status == RecordStatus::Ok
    }

    pub fn params(&self) -> CaseParams {
        CaseParams {
            pattern: self.pattern,
            message_size: self.message_size,
            message_count: self.message_count,
            zero_copy: self.zero_copy,
            send_hwm: self.send_hwm,
            recv_hwm: self.recv_hwm,
        }
    }

    fn csv_row(&self) -> String {
        let (status, kind, detail) = match &self.status {
            RecordStatus::Ok => ("ok", String::new(), String::new()),
            RecordStatus::Failed { kind, detail } => ("failed", kind.to_string(), detail.clone()),
        };
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{:.6},{},{:.6},{:.2},{},{},{}\n",
            self.case_index,
            self.pattern,
            self.message_size,
            self.message_count,
            self.zero_copy,
            self.send_hwm,
            self.recv_hwm,
            self.pair_id,
            self.messages_sent,
            self.messages_received,
            self.sender_dropped,
            self.receiver_dropped,
            self.pct_received,
            self.bytes_transferred,
            self.elapsed_seconds,
            self.throughput_bps,
            status,
            kind,
            csv_field(&detail),
        )
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Quote a free-text field when it would break the row
fn csv_field(text: &str) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.contains([',', '"']) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

/// Split one CSV line, honouring double-quoted fields
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Where a run's files go
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub dir: PathBuf,
    pub csv: PathBuf,
    pub json: PathBuf,
    pub config: PathBuf,
}

impl OutputPaths {
    pub fn new(run_dir: &Path, output: &OutputSettings) -> Self {
        Self {
            dir: run_dir.to_path_buf(),
            csv: run_dir.join(&output.results_file),
            json: run_dir.join(&output.json_file),
            config: run_dir.join(&output.config_file),
        }
    }
}

/// Final document written at the end of a run
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalResults {
    pub metadata: RunMetadata,
    pub settings: BenchmarkSettings,
    pub records: Vec<ResultRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique id of this run
    pub run_id: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_records: usize,
    pub failed_records: usize,
    pub system_info: SystemInfo,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub hostname: Option<String>,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            hostname: std::env::var("HOSTNAME").ok(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Ordered store of result records with incremental CSV output
pub struct ResultAggregator {
    records: BTreeMap<(u64, usize), ResultRecord>,
    output: Option<OutputPaths>,
}

impl ResultAggregator {
    /// Aggregator that keeps records in memory only
    pub fn in_memory() -> Self {
        Self {
            records: BTreeMap::new(),
            output: None,
        }
    }

    /// Aggregator that also writes under `paths.dir`
    pub fn with_output(paths: OutputPaths) -> Result<Self> {
        std::fs::create_dir_all(&paths.dir)
            .with_context(|| format!("Failed to create output directory {}", paths.dir.display()))?;
        debug!("Writing results under {}", paths.dir.display());
        Ok(Self {
            records: BTreeMap::new(),
            output: Some(paths),
        })
    }

    pub fn paths(&self) -> Option<&OutputPaths> {
        self.output.as_ref()
    }

    /// Store one case's records and append them to the CSV
    pub fn record_case(&mut self, records: Vec<ResultRecord>) -> Result<()> {
        let mut batch = HashSet::new();
        for record in &records {
            let key = (record.case_index, record.pair_id);
            if self.records.contains_key(&key) || !batch.insert(key) {
                anyhow::bail!(
                    "Duplicate result for case {} pair {}",
                    record.case_index,
                    record.pair_id
                );
            }
        }

        if let Some(paths) = &self.output {
            append_csv(&paths.csv, &records)?;
        }

        for record in records {
            self.records
                .insert((record.case_index, record.pair_id), record);
        }
        Ok(())
    }

    /// Records ordered by case index, then pair id
    pub fn records(&self) -> impl Iterator<Item = &ResultRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.records.values().filter(|r| !r.is_ok()).count()
    }

    /// Write the JSON document with every record
    pub fn finalize(&self, settings: &BenchmarkSettings) -> Result<()> {
        let Some(paths) = &self.output else {
            return Ok(());
        };
        info!("Finalizing benchmark results");

        let final_results = FinalResults {
            metadata: RunMetadata {
                run_id: generate_test_id(),
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_records: self.records.len(),
                failed_records: self.failed_count(),
                system_info: SystemInfo::default(),
            },
            settings: settings.clone(),
            records: self.records.values().cloned().collect(),
        };

        let json = serde_json::to_string_pretty(&final_results)?;
        std::fs::write(&paths.json, json)
            .with_context(|| format!("Failed to write {}", paths.json.display()))?;

        info!("Results written to: {:?}", paths.csv);
        Ok(())
    }

    /// Console table of every record
    pub fn print_summary(&self) {
        if self.records.is_empty() {
            println!("No results recorded.");
            return;
        }

        let widths = [5, 10, 9, 8, 5, 9, 4, 8, 14, 16];
        print_table_separator(&widths);
        print_table_row(
            &[
                "Case", "Pattern", "Size", "Count", "ZC", "HWM s/r", "Pair", "Recv %", "Throughput",
                "Status",
            ],
            &widths,
        );
        print_table_separator(&widths);
        for record in self.records.values() {
            let hwm = format!("{}/{}", record.send_hwm, record.recv_hwm);
            let pct = format!("{:.2}", record.pct_received * 100.0);
            let status = match &record.status {
                RecordStatus::Ok => "ok".to_string(),
                RecordStatus::Failed { kind, .. } => kind.to_string(),
            };
            print_table_row(
                &[
                    &record.case_index.to_string(),
                    &record.pattern.to_string(),
                    &record.message_size.to_string(),
                    &record.message_count.to_string(),
                    if record.zero_copy { "yes" } else { "no" },
                    &hwm,
                    &record.pair_id.to_string(),
                    &pct,
                    &format_bits_rate(record.throughput_bps),
                    &status,
                ],
                &widths,
            );
        }
        print_table_separator(&widths);
    }
}

fn append_csv(path: &Path, records: &[ResultRecord]) -> Result<()> {
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    if needs_header {
        writeln!(file, "{}", CSV_COLUMNS.join(","))?;
    }
    for record in records {
        file.write_all(record.csv_row().as_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Cases a previous run finished with every pair ok. Their parameters are
/// matched against the new matrix, so the old indices do not need to line up.
pub fn load_completed_cases(path: &Path, num_pairs: usize) -> Result<HashSet<CaseParams>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read results file {}", path.display()))?;
    let mut lines = text.lines();
    let header = split_csv_line(lines.next().unwrap_or_default());
    let column = |name: &str| -> Result<usize> {
        header
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("Results file {} has no {} column", path.display(), name))
    };

    let pattern_col = column("pattern")?;
    let size_col = column("message_size")?;
    let count_col = column("message_count")?;
    let zero_copy_col = column("zero_copy")?;
    let send_hwm_col = column("send_hwm")?;
    let recv_hwm_col = column("recv_hwm")?;
    let pair_col = column("pair_id")?;
    let status_col = column("status")?;

    let mut ok_pairs: HashMap<CaseParams, HashSet<usize>> = HashMap::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        let field = |col: usize| -> Result<String> {
            fields
                .get(col)
                .map(|f| f.trim().to_string())
                .with_context(|| format!("Row {} of {} is truncated", line_no + 2, path.display()))
        };
        if field(status_col)? != "ok" {
            continue;
        }

        let params = CaseParams {
            pattern: field(pattern_col)?
                .parse()
                .map_err(anyhow::Error::msg)?,
            message_size: field(size_col)?.parse()?,
            message_count: field(count_col)?.parse()?,
            zero_copy: field(zero_copy_col)?.parse()?,
            send_hwm: field(send_hwm_col)?.parse()?,
            recv_hwm: field(recv_hwm_col)?.parse()?,
        };
        let pair: usize = field(pair_col)?.parse()?;
        ok_pairs.entry(params).or_default().insert(pair);
    }

    Ok(ok_pairs
        .into_iter()
        .filter(|(_, pairs)| (0..num_pairs).all(|p| pairs.contains(&p)))
        .map(|(params, _)| params)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::protocol::{DataLayout, WorkerIdentity};
    use tempfile::TempDir;

    fn case(index: u64, pattern: Pattern) -> TestCase {
        TestCase {
            index,
            pattern,
            message_size: 1024,
            message_count: 1000,
            zero_copy: false,
            send_hwm: 100,
            recv_hwm: 100,
        }
    }

    fn pair(pair_id: usize, receivers: usize) -> PairAssignment {
        let member = |id: String, role, slot| WorkerIdentity {
            id,
            role,
            pair_index: pair_id,
            slot,
            address: "127.0.0.1".parse().unwrap(),
        };
        PairAssignment {
            pair_id,
            sender: member(format!("s{}", pair_id), Role::Sender, 0),
            receivers: (0..receivers)
                .map(|slot| member(format!("r{}-{}", pair_id, slot), Role::Receiver, slot))
                .collect(),
            layout: DataLayout::ReceiversBind {
                ports: (0..receivers).map(|k| 6000 + k as u16).collect(),
            },
        }
    }

    fn received(messages: u64, elapsed_seconds: f64) -> SessionMetrics {
        SessionMetrics {
            messages_received: messages,
            bytes_transferred: messages * 1024,
            elapsed_seconds,
            ..Default::default()
        }
    }

    #[test]
    fn test_work_queue_record_math() {
        let metrics = received(1000, 0.5);
        let record = ResultRecord::from_reports(
            &case(0, Pattern::WorkQueue),
            &pair(0, 1),
            None,
            &[Some(&metrics)],
            None,
        );

        assert!(record.is_ok());
        assert_eq!(record.messages_sent, 1000);
        assert_eq!(record.messages_received, 1000);
        assert_eq!(record.pct_received, 1.0);
        assert_eq!(record.bytes_transferred, 1000 * 1024);
        let expected = record.bytes_transferred as f64 * 8.0 / record.elapsed_seconds;
        assert!((record.throughput_bps - expected).abs() < 1e-6);
    }

    #[test]
    fn test_fan_out_counts_offered_deliveries() {
        let sent = SessionMetrics {
            messages_sent: 2400,
            messages_dropped: 600,
            ..Default::default()
        };
        let a = received(1000, 1.0);
        let mut b = received(400, 2.0);
        b.messages_dropped = 100;
        let record = ResultRecord::from_reports(
            &case(1, Pattern::FanOut),
            &pair(0, 3),
            Some(&sent),
            &[Some(&a), Some(&b), None],
            Some((FailureKind::CaseTimeout, "r0-2 missed the deadline".to_string())),
        );

        assert_eq!(record.messages_sent, 3000);
        assert_eq!(record.messages_received, 1400);
        assert!(record.pct_received < 1.0);
        assert_eq!(record.elapsed_seconds, 2.0);
        assert_eq!(record.sender_dropped, 600);
        assert_eq!(record.receiver_dropped, 100);
        assert!(!record.is_ok());
        assert_eq!(record.receivers[1].pct_received, 0.4);
        assert!(!record.receivers[2].reported);
    }

    #[test]
    fn test_failed_record_keeps_offered_count() {
        let record = ResultRecord::failed(
            &case(2, Pattern::WorkQueue),
            &pair(1, 1),
            FailureKind::SocketBindError,
            "port busy".to_string(),
        );
        assert_eq!(record.messages_sent, 1000);
        assert_eq!(record.messages_received, 0);
        assert_eq!(record.throughput_bps, 0.0);
        assert_eq!(
            record.status,
            RecordStatus::Failed {
                kind: FailureKind::SocketBindError,
                detail: "port busy".to_string()
            }
        );
    }

    #[test]
    fn test_aggregator_orders_and_rejects_duplicates() {
        let mut aggregator = ResultAggregator::in_memory();
        let metrics = received(1000, 1.0);
        let make = |index, pair_id| {
            ResultRecord::from_reports(
                &case(index, Pattern::WorkQueue),
                &pair(pair_id, 1),
                None,
                &[Some(&metrics)],
                None,
            )
        };

        aggregator.record_case(vec![make(1, 1), make(1, 0)]).unwrap();
        aggregator.record_case(vec![make(0, 0)]).unwrap();
        assert!(aggregator.record_case(vec![make(1, 0)]).is_err());

        let keys: Vec<_> = aggregator
            .records()
            .map(|r| (r.case_index, r.pair_id))
            .collect();
        assert_eq!(keys, vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_csv_written_per_case_and_reloaded_for_resume() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::new(dir.path(), &OutputSettings::default());
        let mut aggregator = ResultAggregator::with_output(paths.clone()).unwrap();

        let metrics = received(1000, 1.0);
        let ok = |index| {
            ResultRecord::from_reports(
                &case(index, Pattern::WorkQueue),
                &pair(0, 1),
                None,
                &[Some(&metrics)],
                None,
            )
        };
        let mut second = case(1, Pattern::WorkQueue);
        second.message_size = 64;
        let failed = ResultRecord::failed(
            &second,
            &pair(0, 1),
            FailureKind::SocketBindError,
            "bind 127.0.0.1:6000, \"in use\"".to_string(),
        );

        aggregator.record_case(vec![ok(0)]).unwrap();
        let text = std::fs::read_to_string(&paths.csv).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("case_index,pattern,"));
        for line in text.lines() {
            assert_eq!(split_csv_line(line).len(), CSV_COLUMNS.len());
        }

        aggregator.record_case(vec![failed]).unwrap();
        let text = std::fs::read_to_string(&paths.csv).unwrap();
        assert_eq!(text.lines().count(), 3);

        let completed = load_completed_cases(&paths.csv, 1).unwrap();
        assert_eq!(completed.len(), 1);
        assert!(completed.contains(&case(0, Pattern::WorkQueue).params()));
        assert!(!completed.contains(&second.params()));

        aggregator.finalize(&BenchmarkSettings::default()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(json["metadata"]["total_records"], 2);
        assert_eq!(json["metadata"]["failed_records"], 1);
    }

    #[test]
    fn test_resume_requires_every_pair() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::new(dir.path(), &OutputSettings::default());
        let mut aggregator = ResultAggregator::with_output(paths.clone()).unwrap();
        let metrics = received(1000, 1.0);
        aggregator
            .record_case(vec![ResultRecord::from_reports(
                &case(0, Pattern::WorkQueue),
                &pair(0, 1),
                None,
                &[Some(&metrics)],
                None,
            )])
            .unwrap();

        assert_eq!(load_completed_cases(&paths.csv, 1).unwrap().len(), 1);
        assert!(load_completed_cases(&paths.csv, 2).unwrap().is_empty());
    }

    #[test]
    fn test_split_csv_line_handles_quotes() {
        let fields = split_csv_line(r#"1,ok,"a, ""b""",x"#);
        assert_eq!(fields, vec!["1", "ok", "a, \"b\"", "x"]);
    }
}
