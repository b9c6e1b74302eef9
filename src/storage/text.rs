//! Plain-text chain files.
//!
//! Every chain writes `<prefix>_process_<n>_chain.txt`, where `n` is the
//! one-based chain number. The file starts with `#` header lines that
//! describe the configuration, followed by a column-name line and one
//! comma-separated row per distinct point:
//!
//! ```text
//! # format = dram-rs-chain-1
//! # dimension = 2
//! ...
//! sample_weight,sample_log_func,delayed_rejection_stage,mean_acceptance_rate,adaptation_measure,x_1,x_2
//! 3,-1.25,0,0,0,0.5,-1.5
//! ```
//!
//! Floats use Rust's shortest round-trip representation, so identical runs
//! produce identical files. When a chain finishes, a report file and
//! optionally a refined sample file are written next to the chain file.

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::warn;

use crate::{
    chain::SampleRecord,
    diagnostics::{ChainStatus, ChainSummary},
    dram::DramError,
    settings::{OutputSettings, RunConfiguration, StartPoint},
    storage::{ChainFiles, ChainStart, ChainStorage, StorageConfig},
};

const FORMAT: &str = "dram-rs-chain-1";
const COLUMNS: [&str; 5] = [
    "sample_weight",
    "sample_log_func",
    "delayed_rejection_stage",
    "mean_acceptance_rate",
    "adaptation_measure",
];

/// Configuration for plain-text chain files.
#[derive(Debug, Clone)]
pub struct TextConfig {
    output: OutputSettings,
}

impl TextConfig {
    pub fn new(output: OutputSettings) -> Self {
        Self { output }
    }

    pub fn output(&self) -> &OutputSettings {
        &self.output
    }

    fn path(&self, chain: u64, kind: &str) -> PathBuf {
        let mut name: OsString = self.output.file_name.as_os_str().to_owned();
        name.push(format!("_process_{}_{}.txt", chain + 1, kind));
        PathBuf::from(name)
    }

    pub fn chain_path(&self, chain: u64) -> PathBuf {
        self.path(chain, "chain")
    }

    pub fn report_path(&self, chain: u64) -> PathBuf {
        self.path(chain, "report")
    }

    pub fn sample_path(&self, chain: u64) -> PathBuf {
        self.path(chain, "sample")
    }

    /// Read an existing chain file and check it against the configuration.
    fn read_existing(
        &self,
        path: &Path,
        settings: &RunConfiguration,
        chain: u64,
    ) -> Result<ExistingChain> {
        let text = fs::read_to_string(path).map_err(|source| DramError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !text.starts_with("# format = ") {
            return Err(DramError::OutputExists(path.to_path_buf()).into());
        }
        let incompatible = |reason: String| DramError::IncompatibleOutput {
            path: path.to_path_buf(),
            reason,
        };

        let mut existing = ExistingChain {
            records: Vec::new(),
            rows_start: None,
            last_row_offset: None,
        };
        let mut header = HashMap::new();
        let mut offset = 0u64;

        for line in text.split_inclusive('\n') {
            let start = offset;
            offset += line.len() as u64;
            let Some(line) = line.strip_suffix('\n') else {
                // a partially written line is dropped
                break;
            };
            if existing.rows_start.is_none() {
                if let Some(entry) = line.strip_prefix("# ") {
                    let (key, value) = entry
                        .split_once(" = ")
                        .ok_or_else(|| incompatible(format!("malformed header line {:?}", line)))?;
                    header.insert(key.to_string(), value.to_string());
                    continue;
                }
                check_header(&header, settings, chain).map_err(incompatible)?;
                if line != column_line(settings.dimension) {
                    return Err(incompatible("unexpected column names".into()).into());
                }
                existing.rows_start = Some(offset);
                continue;
            }
            let record = parse_row(line, settings.dimension).map_err(|reason| {
                incompatible(format!("row {}: {}", existing.records.len() + 1, reason))
            })?;
            existing.records.push(record);
            existing.last_row_offset = Some(start);
        }

        if existing.rows_start.is_none() {
            // the header was cut short, only the format can be checked
            if header.get("format").map(String::as_str) != Some(FORMAT) {
                return Err(incompatible("unknown file format".into()).into());
            }
        }
        Ok(existing)
    }

    fn is_complete(&self, chain: u64) -> bool {
        let Ok(report) = fs::read_to_string(self.report_path(chain)) else {
            return false;
        };
        report
            .lines()
            .filter_map(|line| line.split_once(" = "))
            .any(|(key, value)| key == "status" && value == "complete")
    }

    fn files(&self, chain: u64, with_sample: bool) -> ChainFiles {
        ChainFiles {
            chain: self.chain_path(chain),
            report: self.report_path(chain),
            sample: with_sample.then(|| self.sample_path(chain)),
        }
    }

    fn create(&self, settings: &RunConfiguration, chain: u64) -> Result<TextChainStorage> {
        let path = self.chain_path(chain);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
            }
        }
        for stale in [self.report_path(chain), self.sample_path(chain)] {
            match fs::remove_file(&stale) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    return Err(err)
                        .with_context(|| format!("Failed to remove old output file: {:?}", stale));
                }
                _ => {}
            }
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create chain file: {:?}", path))?;
        let mut header = String::new();
        for (key, value) in header_fields(settings, chain) {
            header.push_str(&format!("# {} = {}\n", key, value));
        }
        header.push_str(&column_line(settings.dimension));
        header.push('\n');

        let mut storage = TextChainStorage {
            file,
            path,
            committed: 0,
            pending: header.into_bytes(),
            config: self.clone(),
            chain,
        };
        storage
            .flush()
            .with_context(|| format!("Failed to write header of {:?}", storage.path))?;
        Ok(storage)
    }

    fn reopen(&self, chain: u64, keep: u64) -> Result<TextChainStorage> {
        let path = self.chain_path(chain);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open chain file: {:?}", path))?;
        file.set_len(keep)
            .with_context(|| format!("Failed to truncate chain file: {:?}", path))?;
        for stale in [self.report_path(chain), self.sample_path(chain)] {
            if stale.exists() {
                fs::remove_file(&stale)
                    .with_context(|| format!("Failed to remove old output file: {:?}", stale))?;
            }
        }
        Ok(TextChainStorage {
            file,
            path,
            committed: keep,
            pending: Vec::new(),
            config: self.clone(),
            chain,
        })
    }
}

struct ExistingChain {
    records: Vec<SampleRecord>,
    /// End of the column-name line, `None` if the header is incomplete.
    rows_start: Option<u64>,
    /// Start of the last complete row.
    last_row_offset: Option<u64>,
}

/// Per-chain plain-text storage
pub struct TextChainStorage {
    file: File,
    path: PathBuf,
    /// Number of bytes of `file` that hold finished output.
    committed: u64,
    pending: Vec<u8>,
    config: TextConfig,
    chain: u64,
}

impl TextChainStorage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_report(&self, summary: &ChainSummary) -> Result<PathBuf> {
        let path = self.config.report_path(self.chain);
        let mut report = String::new();
        let mut line = |key: &str, value: &dyn Display| {
            report.push_str(&format!("{} = {}\n", key, value));
        };
        line("status", &summary.status.as_str());
        if let ChainStatus::Failed(reason) = &summary.status {
            line("reason", reason);
        }
        line("chain", &summary.chain);
        line("steps", &summary.steps);
        line("unique_points", &summary.unique_points);
        line("acceptance_rate", &summary.acceptance_rate);
        line("evaluation_failures", &summary.evaluation_failures);
        line("out_of_domain", &summary.out_of_domain);
        line("adaptive_updates", &summary.adaptive_updates);
        line("numerical_fallbacks", &summary.numerical_fallbacks);
        line("burnin_location", &summary.burnin);
        line("effective_sample_size", &summary.effective_sample_size);
        line("refined_sample_size", &summary.refined_size);
        line("mean", &summary.mean.iter().join(","));
        line("covariance", &summary.covariance.iter().join(","));
        fs::write(&path, report)
            .with_context(|| format!("Failed to write chain report: {:?}", path))?;
        Ok(path)
    }

    fn write_sample(&self, records: &[SampleRecord], refined: &[usize]) -> Result<PathBuf> {
        let path = self.config.sample_path(self.chain);
        let dim = records.first().map(|r| r.point.len()).unwrap_or(0);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create sample file: {:?}", path))?;
        let mut writer = io::BufWriter::new(file);
        let columns = std::iter::once("sample_log_func".to_string())
            .chain((1..=dim).map(|i| format!("x_{}", i)))
            .join(",");
        writeln!(writer, "{}", columns)?;
        for &index in refined {
            let record = &records[index];
            writeln!(writer, "{},{}", record.logp, record.point.iter().join(","))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write sample file: {:?}", path))?;
        Ok(path)
    }
}

impl ChainStorage for TextChainStorage {
    fn record_sample(&mut self, record: &SampleRecord) -> Result<()> {
        writeln!(
            self.pending,
            "{},{},{},{},{},{}",
            record.weight,
            record.logp,
            record.stage,
            record.mean_acceptance_rate,
            record.adaptation_measure,
            record.point.iter().join(",")
        )?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.committed))?;
        self.file.write_all(&self.pending)?;
        self.file.flush()?;
        self.committed += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    fn finalize(
        mut self,
        summary: &ChainSummary,
        records: &[SampleRecord],
        refined: &[usize],
    ) -> Result<Option<ChainFiles>> {
        self.flush()
            .with_context(|| format!("Failed to write chain file: {:?}", self.path))?;
        let sample = if self.config.output.refined_sample && !refined.is_empty() {
            Some(self.write_sample(records, refined)?)
        } else {
            None
        };
        let report = self.write_report(summary)?;
        Ok(Some(ChainFiles {
            chain: self.path,
            report,
            sample,
        }))
    }
}

impl StorageConfig for TextConfig {
    type ChainStorage = TextChainStorage;

    fn prepare(&self, settings: &RunConfiguration) -> Result<()> {
        for chain in 0..settings.chain_count() as u64 {
            let path = self.chain_path(chain);
            let existed = path.exists();
            if existed && !self.output.overwrite_requested {
                self.read_existing(&path, settings, chain)?;
            }
            check_writable(&path, existed)?;
        }
        Ok(())
    }

    fn new_chain(
        &self,
        settings: &RunConfiguration,
        chain: u64,
    ) -> Result<ChainStart<TextChainStorage>> {
        let path = self.chain_path(chain);
        if !path.exists() || self.output.overwrite_requested {
            return Ok(ChainStart::Fresh(self.create(settings, chain)?));
        }

        let existing = self.read_existing(&path, settings, chain)?;
        if existing.records.is_empty() {
            return Ok(match existing.rows_start {
                Some(end) => ChainStart::Fresh(self.reopen(chain, end)?),
                None => ChainStart::Fresh(self.create(settings, chain)?),
            });
        }
        if self.is_complete(chain) {
            let with_sample = self.sample_path(chain).exists();
            return Ok(ChainStart::Complete {
                records: existing.records,
                files: Some(self.files(chain, with_sample)),
            });
        }

        let keep = existing
            .last_row_offset
            .context("Stored chain has rows but no row offset")?;
        warn!(
            "chain {}: resuming from {} stored rows in {:?}",
            chain,
            existing.records.len(),
            path
        );
        Ok(ChainStart::Resume {
            storage: self.reopen(chain, keep)?,
            records: existing.records,
        })
    }
}

/// Make sure the chain file can be opened for writing.
///
/// Missing parent directories are created. A file created by the check is
/// removed again, so it is not mistaken for foreign output later.
fn check_writable(path: &Path, existed: bool) -> Result<()> {
    let io_error = |source| DramError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| DramError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(io_error)?;
    if !existed {
        fs::remove_file(path).map_err(io_error)?;
    }
    Ok(())
}

fn join_floats(values: &[f64]) -> String {
    values.iter().join(",")
}

/// Header entries that must match for a chain file to be continued.
fn header_fields(settings: &RunConfiguration, chain: u64) -> Vec<(&'static str, String)> {
    let start = match &settings.start_point {
        StartPoint::Origin => "origin".to_string(),
        StartPoint::Fixed(point) => format!("fixed({})", join_floats(point)),
        StartPoint::Random { lower, upper } => {
            format!("random({};{})", join_floats(lower), join_floats(upper))
        }
    };
    vec![
        ("format", FORMAT.to_string()),
        ("dimension", settings.dimension.to_string()),
        ("seed", settings.seed.to_string()),
        ("chain", chain.to_string()),
        ("chain_size", settings.chain_size.to_string()),
        ("scale_factor", settings.scale_factor().to_string()),
        (
            "delayed_rejection_count",
            settings.delayed_rejection.count.to_string(),
        ),
        ("domain_lower", join_floats(&settings.domain.lower)),
        ("domain_upper", join_floats(&settings.domain.upper)),
        ("start_point", start),
    ]
}

fn check_header(
    header: &HashMap<String, String>,
    settings: &RunConfiguration,
    chain: u64,
) -> std::result::Result<(), String> {
    for (key, expected) in header_fields(settings, chain) {
        match header.get(key) {
            None => return Err(format!("missing header entry {}", key)),
            Some(found) if *found != expected => {
                return Err(format!("{} is {}, expected {}", key, found, expected));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn column_line(dim: usize) -> String {
    COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain((1..=dim).map(|i| format!("x_{}", i)))
        .join(",")
}

fn parse_row(line: &str, dim: usize) -> std::result::Result<SampleRecord, String> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != COLUMNS.len() + dim {
        return Err(format!(
            "expected {} fields, found {}",
            COLUMNS.len() + dim,
            fields.len()
        ));
    }
    let float = |s: &str| s.parse::<f64>().map_err(|e| format!("{:?}: {}", s, e));
    let weight = fields[0]
        .parse::<u64>()
        .map_err(|e| format!("{:?}: {}", fields[0], e))?;
    if weight == 0 {
        return Err("zero sample weight".into());
    }
    Ok(SampleRecord {
        weight,
        logp: float(fields[1])?,
        stage: fields[2]
            .parse::<usize>()
            .map_err(|e| format!("{:?}: {}", fields[2], e))?,
        mean_acceptance_rate: float(fields[3])?,
        adaptation_measure: float(fields[4])?,
        point: fields[COLUMNS.len()..]
            .iter()
            .map(|s| float(s))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into(),
    })
}
