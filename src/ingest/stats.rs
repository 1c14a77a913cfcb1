//! Computation of per-file variant statistics.
//!
//! Statistics are computed in two streaming passes over the decompressed
//! file.  The first pass only looks at the `ALT` column and decides, under an
//! `AltTallyPolicy`, whether per-`ALT` counts are collected in the second
//! pass.  The second pass classifies every record as substitution or indel
//! and updates the global and per-chromosome counters.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::BufRead,
    path::Path,
};

use crate::{
    common::{format_number, io::open_read, io::Compression, pad_chrom, truncate_with},
    err::IngestError,
    ingest::{
        report::{ProgressBand, Reporter},
        validate::ColumnLayout,
    },
    store::StatRow,
};

/// Persisted statistics tags are cut to this many characters.
pub const MAX_STAT_TAG_CHARS: usize = 40;
/// Persisted statistics values are cut to this many characters.
pub const MAX_STAT_VALUE_CHARS: usize = 200;
/// Appended to cut statistics tags and values.
pub const STAT_ELLIPSIS: &str = "...";

/// When per-`ALT` value counts are collected.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AltTallyPolicy {
    /// Only if every `ALT` in the file is a single nucleotide; one other
    /// value disables the tally for the whole file.
    #[default]
    RequireAllSnv,
    /// Always tally.
    Always,
    /// Never tally.
    Never,
}

/// Whether `alt` is a single nucleotide character.
pub fn is_single_nucleotide(alt: &str) -> bool {
    alt.len() == 1
        && matches!(
            alt.as_bytes()[0].to_ascii_uppercase(),
            b'A' | b'C' | b'G' | b'T'
        )
}

/// Counters for one chromosome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChromCounts {
    /// Number of substitutions, `len(REF) == len(ALT)`.
    pub snp: u64,
    /// Number of insertions and deletions.
    pub indel: u64,
}

impl ChromCounts {
    pub fn variants(&self) -> u64 {
        self.snp + self.indel
    }
}

/// Value of one statistics entry.
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Count(u64),
    Float(f64),
    Set(BTreeSet<String>),
}

impl std::fmt::Display for StatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatValue::Count(value) => write!(f, "{}", value),
            StatValue::Float(value) => write!(f, "{}", format_number(*value)),
            StatValue::Set(values) => {
                write!(f, "{}", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
        }
    }
}

/// Result of the statistics passes; immutable once computed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VariantStatistics {
    pub total_snp_count: u64,
    pub total_indel_count: u64,
    /// Counters by normalized chromosome name.
    pub per_chrom: BTreeMap<String, ChromCounts>,
    /// Counts by `ALT` value, absent if the tally policy suppressed it.
    pub alt_counts: Option<BTreeMap<String, u64>>,
    /// Mean `ALT` length of the indels, absent without indels.
    pub avg_indel_length: Option<f64>,
    pub avg_snp_per_chrom: Option<u64>,
    pub avg_indel_per_chrom: Option<u64>,
    pub avg_variant_per_chrom: Option<u64>,
}

impl VariantStatistics {
    /// Number of variants seen.
    pub fn variant_count(&self) -> u64 {
        self.total_snp_count + self.total_indel_count
    }

    /// The distinct normalized chromosome names.
    pub fn chromosomes(&self) -> BTreeSet<String> {
        self.per_chrom.keys().cloned().collect()
    }

    /// The distinct `ALT` values, only if tallied.
    pub fn alt_types(&self) -> Option<BTreeSet<String>> {
        self.alt_counts
            .as_ref()
            .filter(|counts| !counts.is_empty())
            .map(|counts| counts.keys().cloned().collect())
    }

    /// Flatten into the metric name/value mapping that is persisted.
    pub fn to_entries(&self) -> Vec<(String, StatValue)> {
        let mut result = vec![
            (
                String::from("Total_SNP_Count"),
                StatValue::Count(self.total_snp_count),
            ),
            (
                String::from("Total_Indel_Count"),
                StatValue::Count(self.total_indel_count),
            ),
        ];
        for (chrom, counts) in &self.per_chrom {
            result.push((
                format!("{}_Chrom_SNP_Count", chrom),
                StatValue::Count(counts.snp),
            ));
            result.push((
                format!("{}_Chrom_Indel_Count", chrom),
                StatValue::Count(counts.indel),
            ));
            result.push((
                format!("{}_Chrom_Variant_Count", chrom),
                StatValue::Count(counts.variants()),
            ));
        }
        if let Some(alt_counts) = &self.alt_counts {
            for (alt, count) in alt_counts {
                result.push((format!("{}_Alt_Count", alt), StatValue::Count(*count)));
            }
        }
        if let Some(value) = self.avg_indel_length {
            result.push((String::from("Avg_Indel_Length"), StatValue::Float(value)));
        }
        for (name, value) in [
            ("Avg_SNP_per_Chrom", self.avg_snp_per_chrom),
            ("Avg_Indel_per_Chrom", self.avg_indel_per_chrom),
            ("Avg_Variant_per_Chrom", self.avg_variant_per_chrom),
        ] {
            if let Some(value) = value {
                result.push((String::from(name), StatValue::Count(value)));
            }
        }
        result.push((
            String::from("List_Chromosomes"),
            StatValue::Set(self.chromosomes()),
        ));
        if let Some(alt_types) = self.alt_types() {
            result.push((String::from("ALT_Types"), StatValue::Set(alt_types)));
        }
        result
    }

    /// The rows of the persisted statistics table.
    ///
    /// Long tags and values are truncated, so the persisted table is lossy.
    pub fn to_rows(&self) -> Vec<StatRow> {
        self.to_entries()
            .into_iter()
            .map(|(tag, value)| StatRow {
                tag: truncate_with(&tag, MAX_STAT_TAG_CHARS, STAT_ELLIPSIS),
                result: truncate_with(&value.to_string(), MAX_STAT_VALUE_CHARS, STAT_ELLIPSIS),
            })
            .collect()
    }

    /// Look up one flattened entry by name.
    pub fn get(&self, name: &str) -> Option<StatValue> {
        self.to_entries()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// First pass: decides whether `ALT` values are tallied.
#[derive(Debug)]
pub struct AltPrescan {
    policy: AltTallyPolicy,
    all_snv: bool,
}

impl AltPrescan {
    pub fn new(policy: AltTallyPolicy) -> Self {
        Self {
            policy,
            all_snv: true,
        }
    }

    pub fn push(&mut self, alt: &str) {
        if self.all_snv && !is_single_nucleotide(alt) {
            self.all_snv = false;
        }
    }

    /// Whether the second pass should tally `ALT` values.
    pub fn allows_tally(&self) -> bool {
        match self.policy {
            AltTallyPolicy::RequireAllSnv => self.all_snv,
            AltTallyPolicy::Always => true,
            AltTallyPolicy::Never => false,
        }
    }
}

/// Second pass: incremental aggregation of the counters.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    tally_alts: bool,
    total_snp_count: u64,
    total_indel_count: u64,
    indel_length_sum: u64,
    per_chrom: BTreeMap<String, ChromCounts>,
    alt_counts: BTreeMap<String, u64>,
}

impl StatisticsAggregator {
    pub fn new(tally_alts: bool) -> Self {
        Self {
            tally_alts,
            ..Default::default()
        }
    }

    /// Account for one record.
    pub fn push(&mut self, chrom: &str, reference: &str, alternative: &str) {
        let counts = self
            .per_chrom
            .entry(pad_chrom(chrom).into_owned())
            .or_default();
        if reference.len() == alternative.len() {
            self.total_snp_count += 1;
            counts.snp += 1;
        } else {
            self.total_indel_count += 1;
            counts.indel += 1;
            self.indel_length_sum += alternative.len() as u64;
        }
        if self.tally_alts {
            *self.alt_counts.entry(alternative.to_owned()).or_default() += 1;
        }
    }

    /// Derive the summary metrics.
    pub fn finish(self) -> VariantStatistics {
        let avg_indel_length = if self.total_indel_count > 0 {
            let avg = self.indel_length_sum as f64 / self.total_indel_count as f64;
            Some((avg * 1000.0).round() / 1000.0)
        } else {
            None
        };
        let n_chroms = self.per_chrom.len() as u64;
        let per_chrom_avg = |total: u64| (n_chroms > 0).then(|| total / n_chroms);
        VariantStatistics {
            total_snp_count: self.total_snp_count,
            total_indel_count: self.total_indel_count,
            avg_indel_length,
            avg_snp_per_chrom: per_chrom_avg(self.total_snp_count),
            avg_indel_per_chrom: per_chrom_avg(self.total_indel_count),
            avg_variant_per_chrom: per_chrom_avg(self.total_snp_count + self.total_indel_count),
            alt_counts: self.tally_alts.then_some(self.alt_counts),
            per_chrom: self.per_chrom,
        }
    }
}

/// Call `f` with the tab-split fields of every data line in `reader`.
///
/// `on_chunk` gets the number of bytes read so far after every
/// `chunk_size` records.
fn for_each_record<R, F>(
    mut reader: R,
    layout: &ColumnLayout,
    chunk_size: usize,
    on_chunk: &mut dyn FnMut(u64),
    mut f: F,
) -> Result<(), IngestError>
where
    R: BufRead,
    F: FnMut(&[&str]),
{
    let needed = [layout.chrom, layout.reference, layout.alternative]
        .into_iter()
        .max()
        .unwrap_or_default()
        + 1;
    let chunk_size = chunk_size.max(1);
    let mut line = String::new();
    let mut line_no = 0;
    let mut bytes = 0;
    let mut records = 0;
    loop {
        line.clear();
        line_no += 1;
        let n = reader
            .read_line(&mut line)
            .map_err(|e| IngestError::Parse {
                line_no,
                reason: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        let record = line.trim_end_matches(['\n', '\r']);
        if record.starts_with('#') || record.trim().is_empty() {
            continue;
        }
        let fields = record.split('\t').collect::<Vec<_>>();
        if fields.len() < needed {
            return Err(IngestError::Parse {
                line_no,
                reason: format!("expected at least {} columns, got {}", needed, fields.len()),
            });
        }
        f(&fields);
        records += 1;
        if records % chunk_size == 0 {
            on_chunk(bytes);
        }
    }
    Ok(())
}

/// Run both passes over the decompressed file at `path`.
///
/// The file is opened once per pass and closed at the end of each pass.
/// Each pass reports its progress in one half of `band`.
pub fn compute<P: AsRef<Path>>(
    path: P,
    layout: &ColumnLayout,
    policy: AltTallyPolicy,
    chunk_size: usize,
    reporter: &mut dyn Reporter,
    band: ProgressBand,
) -> Result<VariantStatistics, IngestError> {
    let path = path.as_ref();
    let total = std::fs::metadata(path)
        .map_err(|e| IngestError::file_access(path, e))?
        .len();

    let mut prescan = AltPrescan::new(policy);
    {
        let pass = band.half(false);
        let reader = open_read(path, Compression::None)?;
        for_each_record(
            reader,
            layout,
            chunk_size,
            &mut |bytes| reporter.progress(pass.at(bytes, total), "Computing statistics: ALT values"),
            |fields| prescan.push(fields[layout.alternative]),
        )?;
        reporter.progress(pass.to, "Computing statistics: ALT values");
    }
    tracing::debug!(
        "ALT tally {} under policy {}",
        if prescan.allows_tally() {
            "enabled"
        } else {
            "disabled"
        },
        policy
    );

    let mut aggregator = StatisticsAggregator::new(prescan.allows_tally());
    {
        let pass = band.half(true);
        let reader = open_read(path, Compression::None)?;
        for_each_record(
            reader,
            layout,
            chunk_size,
            &mut |bytes| reporter.progress(pass.at(bytes, total), "Computing statistics: counts"),
            |fields| {
                aggregator.push(
                    fields[layout.chrom],
                    fields[layout.reference],
                    fields[layout.alternative],
                )
            },
        )?;
        reporter.progress(pass.to, "Computing statistics: counts");
    }
    Ok(aggregator.finish())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ingest::report::RecordingReporter;

    fn aggregate(records: &[(&str, &str, &str)], policy: AltTallyPolicy) -> VariantStatistics {
        let mut prescan = AltPrescan::new(policy);
        for (_, _, alt) in records {
            prescan.push(alt);
        }
        let mut aggregator = StatisticsAggregator::new(prescan.allows_tally());
        for (chrom, reference, alt) in records {
            aggregator.push(chrom, reference, alt);
        }
        aggregator.finish()
    }

    #[rstest::rstest]
    #[case("A", "G", true)]
    #[case("AC", "GT", true)]
    #[case("A", "AT", false)]
    #[case("ACG", "A", false)]
    #[case("A", "<DEL>", false)]
    fn substitution_iff_equal_length(
        #[case] reference: &str,
        #[case] alt: &str,
        #[case] is_snp: bool,
    ) {
        let stats = aggregate(&[("1", reference, alt)], AltTallyPolicy::Never);

        assert_eq!(stats.total_snp_count, u64::from(is_snp));
        assert_eq!(stats.total_indel_count, u64::from(!is_snp));
        assert_eq!(stats.variant_count(), 1);
    }

    #[test]
    fn thirty_snps_on_chrom_one() {
        let records = vec![("1", "A", "G"); 30];
        let stats = aggregate(&records, AltTallyPolicy::default());

        assert_eq!(stats.get("Total_SNP_Count"), Some(StatValue::Count(30)));
        assert_eq!(stats.get("Total_Indel_Count"), Some(StatValue::Count(0)));
        assert_eq!(stats.get("Avg_SNP_per_Chrom"), Some(StatValue::Count(30)));
        assert_eq!(stats.get("01_Chrom_SNP_Count"), Some(StatValue::Count(30)));
        assert_eq!(stats.get("Avg_Indel_Length"), None);
        assert_eq!(stats.get("G_Alt_Count"), Some(StatValue::Count(30)));
        assert_eq!(
            stats.get("List_Chromosomes").map(|v| v.to_string()),
            Some(String::from("01"))
        );
        assert_eq!(
            stats.get("ALT_Types").map(|v| v.to_string()),
            Some(String::from("G"))
        );
    }

    #[test]
    fn mixed_file_suppresses_alt_tally() {
        let records = vec![
            ("1", "A", "G"),
            ("1", "A", "T"),
            ("2", "A", "ATT"),
            ("X", "ACGT", "A"),
        ];
        let stats = aggregate(&records, AltTallyPolicy::RequireAllSnv);

        assert_eq!(stats.alt_counts, None);
        assert_eq!(stats.get("ALT_Types"), None);
        assert_eq!(stats.total_snp_count, 2);
        assert_eq!(stats.total_indel_count, 2);
        // ALT lengths 3 and 1
        assert_eq!(stats.avg_indel_length, Some(2.0));
        // 3 chromosomes, integer division
        assert_eq!(stats.avg_snp_per_chrom, Some(0));
        assert_eq!(stats.avg_indel_per_chrom, Some(0));
        assert_eq!(stats.avg_variant_per_chrom, Some(1));
        assert_eq!(
            stats.chromosomes().into_iter().collect::<Vec<_>>(),
            vec!["01", "02", "X"]
        );

        let stats = aggregate(&records, AltTallyPolicy::Always);
        assert_eq!(stats.alt_counts.map(|c| c.len()), Some(4));
    }

    #[test]
    fn avg_indel_length_rounded() {
        let records = vec![("1", "A", "AT"), ("1", "A", "AT"), ("1", "A", "ATTTT")];
        let stats = aggregate(&records, AltTallyPolicy::Never);

        assert!(float_cmp::approx_eq!(
            f64,
            stats.avg_indel_length.unwrap(),
            3.0,
            ulps = 2
        ));

        let records = vec![("1", "AC", "A"), ("1", "AC", "A"), ("1", "A", "AT")];
        let stats = aggregate(&records, AltTallyPolicy::Never);
        assert!(float_cmp::approx_eq!(
            f64,
            stats.avg_indel_length.unwrap(),
            1.333,
            epsilon = 1e-9
        ));
    }

    #[test]
    fn rows_are_truncated() {
        let long_alt = "A".repeat(50);
        let records = vec![("1", "A", long_alt.as_str())];
        let stats = aggregate(&records, AltTallyPolicy::Always);
        let rows = stats.to_rows();

        let alt_row = rows
            .iter()
            .find(|row| row.tag.starts_with("AAAA"))
            .unwrap();
        assert_eq!(alt_row.tag, format!("{}...", "A".repeat(MAX_STAT_TAG_CHARS)));
        assert_eq!(alt_row.result, "1");
        let types_row = rows.iter().find(|row| row.tag == "ALT_Types").unwrap();
        assert_eq!(types_row.result, long_alt);
    }

    #[test]
    fn no_records_no_division_by_zero() {
        let stats = aggregate(&[], AltTallyPolicy::default());

        assert_eq!(stats.avg_snp_per_chrom, None);
        assert_eq!(stats.avg_variant_per_chrom, None);
        assert_eq!(stats.alt_types(), None);
        assert_eq!(stats.get("Total_SNP_Count"), Some(StatValue::Count(0)));
    }

    #[test]
    fn compute_from_file() -> Result<(), anyhow::Error> {
        let path = "tests/vcf/mixed.vcf";
        let lines = crate::common::io::head_lines(path, Compression::None, 100)?;
        let validation = crate::ingest::validate::validate(&lines)?;
        let mut reporter = RecordingReporter::default();

        let stats = compute(
            path,
            &validation.layout,
            AltTallyPolicy::default(),
            100,
            &mut reporter,
            ProgressBand::new(15.0, 25.0),
        )?;

        assert_eq!(stats.variant_count() as usize, validation.variant_count);
        assert_eq!(stats.total_indel_count, 3);
        assert_eq!(stats.alt_counts, None);
        assert_eq!(reporter.percentages(), vec![20.0, 25.0]);

        Ok(())
    }

    #[test]
    fn compute_reports_every_chunk() -> Result<(), anyhow::Error> {
        let path = "tests/vcf/mixed.vcf";
        let lines = crate::common::io::head_lines(path, Compression::None, 100)?;
        let validation = crate::ingest::validate::validate(&lines)?;
        let mut reporter = RecordingReporter::default();

        compute(
            path,
            &validation.layout,
            AltTallyPolicy::default(),
            2,
            &mut reporter,
            ProgressBand::new(0.0, 100.0),
        )?;

        // seven records give three chunk reports and one final report per pass
        let percentages = reporter.percentages();
        assert_eq!(percentages.len(), 8);
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert!(percentages[..3].iter().all(|&p| p > 0.0 && p < 50.0));
        assert_eq!(percentages[3], 50.0);
        assert_eq!(percentages.last().copied(), Some(100.0));

        Ok(())
    }
}
