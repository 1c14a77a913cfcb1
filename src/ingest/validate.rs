//! Validation of the head of a VCF file.
//!
//! The validator is a small state machine over the first lines of the
//! decompressed file.  It starts in `Start`, moves to `HeaderSeen` on the
//! `#CHROM` column header line and checks every following data line against
//! the grammar of the `POS`, `REF`, `ALT`, and `QUAL` columns.  Any violation
//! ends validation with a `FormatProblem`.

use crate::err::FormatProblem;

/// Marker of the column header line.
pub const COLUMN_HEADER_MARKER: &str = "#CHROM";

/// Columns that every VCF must have.
pub const MANDATORY_COLUMNS: &[&str] = &["#CHROM", "POS", "REF", "ALT", "QUAL", "FILTER", "INFO"];

/// Files with fewer variants than this are rejected.
pub const MIN_VARIANTS: usize = 5;

/// Files with fewer variants than this are accepted with a warning.
pub const SUFFICIENT_VARIANTS: usize = 30;

/// Positions of the fixed VCF columns in the column header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    /// All column names as given in the header line.
    pub names: Vec<String>,
    pub chrom: usize,
    pub pos: usize,
    /// `ID` is not mandatory but needed for annotation.
    pub id: Option<usize>,
    pub reference: usize,
    pub alternative: usize,
    pub qual: usize,
    pub filter: usize,
    pub info: usize,
}

impl ColumnLayout {
    /// Parse the tab-separated `#CHROM` header line.
    pub fn from_header_line(line: &str) -> Result<Self, FormatProblem> {
        let names = line
            .trim_end()
            .split('\t')
            .map(|s| s.trim().to_owned())
            .collect::<Vec<_>>();

        let missing = MANDATORY_COLUMNS
            .iter()
            .filter(|col| !names.iter().any(|name| name == *col))
            .map(|col| col.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(FormatProblem::MissingColumns {
                missing,
                found: names,
            });
        }

        let idx = |col: &str| names.iter().position(|name| name == col);
        // All of the following are present, checked above.
        let find = |col: &str| idx(col).unwrap_or_default();
        Ok(Self {
            chrom: find("#CHROM"),
            pos: find("POS"),
            id: idx("ID"),
            reference: find("REF"),
            alternative: find("ALT"),
            qual: find("QUAL"),
            filter: find("FILTER"),
            info: find("INFO"),
            names,
        })
    }

    /// Minimal number of fields a data line needs, with the name of the last column.
    fn required_width(&self) -> (usize, &str) {
        let last = [self.chrom, self.pos, self.reference, self.alternative, self.qual]
            .into_iter()
            .max()
            .unwrap_or_default();
        (last + 1, self.names[last].as_str())
    }
}

/// Classification of the number of variants seen in the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Density {
    /// Only rudimentary statistics are possible.
    Sparse,
    /// Enough variants for all statistics.
    Sufficient,
}

/// Successful outcome of validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Column layout from the `#CHROM` line.
    pub layout: ColumnLayout,
    /// Number of lines up to and including the `#CHROM` line.
    pub header_line_count: usize,
    /// Number of variant lines in the head.
    pub variant_count: usize,
    /// Density classification.
    pub density: Density,
}

impl Validation {
    /// Warning message to show for sparse files.
    pub fn warning(&self) -> Option<String> {
        match self.density {
            Density::Sparse => Some(format!(
                "VCF contains very few variants ({}), only rudimentary statistics can be performed",
                self.variant_count
            )),
            Density::Sufficient => None,
        }
    }
}

/// State of the validator.
#[derive(Debug)]
enum State {
    Start,
    HeaderSeen {
        layout: ColumnLayout,
        header_line_count: usize,
        variant_count: usize,
    },
}

/// Validate the head lines of a decompressed VCF file.
pub fn validate<S: AsRef<str>>(lines: &[S]) -> Result<Validation, FormatProblem> {
    let mut state = State::Start;
    for (i, line) in lines.iter().enumerate() {
        let line = line.as_ref();
        let line_no = i + 1;
        state = match state {
            State::Start => {
                if line.starts_with(COLUMN_HEADER_MARKER) {
                    State::HeaderSeen {
                        layout: ColumnLayout::from_header_line(line)?,
                        header_line_count: line_no,
                        variant_count: 0,
                    }
                } else if line.starts_with('#') || line.trim().is_empty() {
                    State::Start
                } else {
                    return Err(FormatProblem::DataBeforeHeader { line_no });
                }
            }
            State::HeaderSeen {
                layout,
                header_line_count,
                variant_count,
            } => {
                let is_variant = !line.starts_with('#') && !line.trim().is_empty();
                if is_variant {
                    check_data_line(&layout, line_no, line)?;
                }
                State::HeaderSeen {
                    layout,
                    header_line_count,
                    variant_count: variant_count + usize::from(is_variant),
                }
            }
        };
    }

    match state {
        State::Start if lines.iter().all(|l| l.as_ref().trim().is_empty()) => {
            Err(FormatProblem::Empty)
        }
        State::Start => Err(FormatProblem::MissingHeader { lines: lines.len() }),
        State::HeaderSeen {
            layout,
            header_line_count,
            variant_count,
        } => {
            let density = match variant_count {
                0 => return Err(FormatProblem::Empty),
                n if n < MIN_VARIANTS => {
                    return Err(FormatProblem::TooFewVariants { count: n })
                }
                n if n < SUFFICIENT_VARIANTS => Density::Sparse,
                _ => Density::Sufficient,
            };
            tracing::debug!(
                "validated head: {} header lines, {} variants ({})",
                header_line_count,
                variant_count,
                density
            );
            Ok(Validation {
                layout,
                header_line_count,
                variant_count,
                density,
            })
        }
    }
}

/// Check one data line against the column grammars.
fn check_data_line(layout: &ColumnLayout, line_no: usize, line: &str) -> Result<(), FormatProblem> {
    let fields = line.split('\t').map(str::trim).collect::<Vec<_>>();
    let (needed, column) = layout.required_width();
    if fields.len() < needed {
        return Err(FormatProblem::TooFewColumns {
            line_no,
            column: column.to_owned(),
            needed,
            found: fields.len(),
        });
    }

    let pos = fields[layout.pos];
    if !is_valid_pos(pos) {
        return Err(FormatProblem::InvalidPos {
            value: pos.to_owned(),
        });
    }
    let reference = fields[layout.reference];
    if !is_valid_ref(reference) {
        return Err(FormatProblem::InvalidRef {
            value: reference.to_owned(),
        });
    }
    let alternative = fields[layout.alternative];
    if !is_valid_alt(alternative) {
        return Err(FormatProblem::InvalidAlt {
            value: alternative.to_owned(),
        });
    }
    let qual = fields[layout.qual];
    if !is_valid_qual(qual) {
        return Err(FormatProblem::InvalidQual {
            value: qual.to_owned(),
        });
    }
    Ok(())
}

fn is_nucleotides(value: &str) -> bool {
    value
        .bytes()
        .all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N'))
}

/// `POS` must consist of digits only.
pub fn is_valid_pos(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// `REF` is drawn from `ACGTN`, case-insensitive.
pub fn is_valid_ref(value: &str) -> bool {
    is_nucleotides(value)
}

/// Every comma-separated `ALT` allele must be a nucleotide string, a
/// bracketed symbolic allele such as `<DEL>`, the spanning deletion `*`, or
/// the missing value `.`.  Breakend notation is not accepted.
pub fn is_valid_alt(value: &str) -> bool {
    value.split(',').all(|allele| {
        let symbolic = allele.len() > 2 && allele.starts_with('<') && allele.ends_with('>');
        symbolic
            || allele == "*"
            || allele == "."
            || (!allele.is_empty() && is_nucleotides(allele))
    })
}

/// `QUAL` is a digit string, the missing value `.`, or a floating point number.
pub fn is_valid_qual(value: &str) -> bool {
    value == "." || is_valid_pos(value) || value.parse::<f64>().is_ok()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const HEADER: &str = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO";

    fn vcf_head(n_variants: usize) -> Vec<String> {
        let mut lines = vec![
            String::from("##fileformat=VCFv4.1"),
            String::from("##source=test"),
            String::from(HEADER),
        ];
        for i in 0..n_variants {
            lines.push(format!("1\t{}\t.\tA\tG\t50\tPASS\tDP=10", 100 + i));
        }
        lines
    }

    #[test]
    fn layout_from_header_line() -> Result<(), anyhow::Error> {
        let layout = ColumnLayout::from_header_line(&format!("{}\tFORMAT\tsample1\n", HEADER))?;

        assert_eq!(layout.chrom, 0);
        assert_eq!(layout.pos, 1);
        assert_eq!(layout.id, Some(2));
        assert_eq!(layout.reference, 3);
        assert_eq!(layout.alternative, 4);
        assert_eq!(layout.qual, 5);
        assert_eq!(layout.filter, 6);
        assert_eq!(layout.info, 7);
        assert_eq!(layout.names.len(), 10);

        Ok(())
    }

    #[test]
    fn layout_missing_columns() {
        let err = ColumnLayout::from_header_line("#CHROM\tPOS\tID\tREF\tALT\tQUAL").unwrap_err();

        assert_eq!(
            err,
            FormatProblem::MissingColumns {
                missing: vec![String::from("FILTER"), String::from("INFO")],
                found: ["#CHROM", "POS", "ID", "REF", "ALT", "QUAL"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }
        );
    }

    #[rstest::rstest]
    #[case(0, Err(FormatProblem::Empty))]
    #[case(3, Err(FormatProblem::TooFewVariants { count: 3 }))]
    #[case(4, Err(FormatProblem::TooFewVariants { count: 4 }))]
    #[case(5, Ok(Density::Sparse))]
    #[case(29, Ok(Density::Sparse))]
    #[case(30, Ok(Density::Sufficient))]
    #[case(97, Ok(Density::Sufficient))]
    fn density(#[case] n_variants: usize, #[case] expected: Result<Density, FormatProblem>) {
        let result = validate(&vcf_head(n_variants)).map(|v| v.density);

        assert_eq!(result, expected);
    }

    #[test]
    fn header_line_count_and_warning() -> Result<(), anyhow::Error> {
        let validation = validate(&vcf_head(10))?;

        assert_eq!(validation.header_line_count, 3);
        assert_eq!(validation.variant_count, 10);
        assert!(validation.warning().is_some());
        assert_eq!(validate(&vcf_head(30))?.warning(), None);

        Ok(())
    }

    #[rstest::rstest]
    #[case("1\t1x0\t.\tA\tG\t50\tPASS\t.", FormatProblem::InvalidPos { value: "1x0".into() })]
    #[case("1\t100\t.\tAXG\tG\t50\tPASS\t.", FormatProblem::InvalidRef { value: "AXG".into() })]
    #[case("1\t100\t.\tA\tG]1:5]\t50\tPASS\t.", FormatProblem::InvalidAlt { value: "G]1:5]".into() })]
    #[case("1\t100\t.\tA\tDEL>\t50\tPASS\t.", FormatProblem::InvalidAlt { value: "DEL>".into() })]
    #[case("1\t100\t.\tA\tG\thigh\tPASS\t.", FormatProblem::InvalidQual { value: "high".into() })]
    fn invalid_row(#[case] row: &str, #[case] expected: FormatProblem) {
        let mut lines = vcf_head(40);
        lines.push(row.to_owned());

        assert_eq!(validate(&lines).unwrap_err(), expected);
    }

    #[test]
    fn too_few_columns() {
        let mut lines = vcf_head(40);
        lines.push(String::from("1\t100\t."));

        assert!(matches!(
            validate(&lines).unwrap_err(),
            FormatProblem::TooFewColumns { line_no: 44, .. }
        ));
    }

    #[test]
    fn data_before_header() {
        let lines = vec!["##fileformat=VCFv4.1", "1\t100\t.\tA\tG\t50\tPASS\t."];

        assert_eq!(
            validate(&lines).unwrap_err(),
            FormatProblem::DataBeforeHeader { line_no: 2 }
        );
    }

    #[test]
    fn missing_header() {
        let lines = vec!["##fileformat=VCFv4.1", "##source=test"];

        assert_eq!(
            validate(&lines).unwrap_err(),
            FormatProblem::MissingHeader { lines: 2 }
        );
    }

    #[rstest::rstest]
    #[case("A", true)]
    #[case("acgtn", true)]
    #[case("A,TT", true)]
    #[case("<DEL>", true)]
    #[case("<INS:ME:ALU>", true)]
    #[case("*", true)]
    #[case(".", true)]
    #[case("<>", false)]
    #[case("DEL>", false)]
    #[case("<DEL", false)]
    #[case("A,", false)]
    #[case("N[2:100[", false)]
    fn alt_grammar(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_valid_alt(value), expected);
    }

    #[rstest::rstest]
    #[case("50", true)]
    #[case(".", true)]
    #[case("12.5", true)]
    #[case("1e3", true)]
    #[case("", false)]
    #[case("abc", false)]
    fn qual_grammar(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_valid_qual(value), expected);
    }
}
