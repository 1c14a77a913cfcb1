//! Common, IO-related code.
//!
//! The compression scheme of an input file is determined by sniffing the
//! magic bytes at the start of the file, never by looking at its extension.

use std::{
    cell::Cell,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
    rc::Rc,
};

use flate2::bufread::MultiGzDecoder;

use crate::err::IngestError;

/// Number of lines read in "head" mode.
pub const HEAD_LINES: usize = 100;

/// Magic bytes of the supported container formats.
const MAGIC_GZIP: &[u8] = &[0x1f, 0x8b];
const MAGIC_BZIP2: &[u8] = b"BZh";
const MAGIC_XZ: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// The compression schemes that we can read.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    /// Plain text.
    None,
    /// gzip, including multi-member files such as bgzip output.
    Gzip,
    /// bzip2.
    Bzip2,
    /// xz / LZMA2.
    Xz,
}

impl Compression {
    /// Classify a buffer holding the first bytes of a file.
    pub fn from_magic(buf: &[u8]) -> Self {
        if buf.starts_with(MAGIC_GZIP) {
            Compression::Gzip
        } else if buf.starts_with(MAGIC_XZ) {
            Compression::Xz
        } else if buf.starts_with(MAGIC_BZIP2) {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    /// Sniff the compression of the file at `path` from its content.
    pub fn sniff<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| IngestError::file_access(path, e))?;
        let mut buf = [0u8; 6];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| IngestError::file_access(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let result = Self::from_magic(&buf[..filled]);
        tracing::debug!("sniffed compression of {:?} as {}", path, result);
        Ok(result)
    }

    /// Human readable label of the detected file type.
    pub fn label(&self) -> &'static str {
        match self {
            Compression::None => "uncompressed VCF",
            Compression::Gzip => "gz compressed VCF",
            Compression::Bzip2 => "bz2 compressed VCF",
            Compression::Xz => "xz compressed VCF",
        }
    }
}

/// Number of decompressed bytes between two progress callbacks.
const PROGRESS_EVERY_BYTES: u64 = 16 * 1024 * 1024;

/// Wrap `inner` into the decoder for `compression`.
fn decoder<R: Read + 'static>(inner: R, compression: Compression) -> Box<dyn BufRead> {
    let inner = BufReader::new(inner);
    match compression {
        Compression::None => Box::new(inner),
        Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(inner))),
        Compression::Bzip2 => Box::new(BufReader::new(bzip2::bufread::MultiBzDecoder::new(inner))),
        Compression::Xz => Box::new(BufReader::new(xz2::bufread::XzDecoder::new_multi_decoder(
            inner,
        ))),
    }
}

/// Open a file for reading, wrapping it into the decoder for `compression`.
pub fn open_read<P>(path: P, compression: Compression) -> Result<Box<dyn BufRead>, IngestError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| IngestError::file_access(path, e))?;
    tracing::trace!("Opening {:?} as {} for reading", path, compression);
    Ok(decoder(file, compression))
}

/// Reader that counts the bytes taken from the underlying file.
struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

/// Read at most `limit` lines from the decompressed file without materializing it.
///
/// Line terminators are stripped.  Invalid UTF-8 in a plain text file means
/// that the file is not a VCF; in a compressed file it is reported as a
/// decompression failure.
pub fn head_lines<P>(
    path: P,
    compression: Compression,
    limit: usize,
) -> Result<Vec<String>, IngestError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let mut reader = open_read(path, compression)?;
    let mut result = Vec::with_capacity(limit);
    let mut buf = Vec::new();
    while result.len() < limit {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| IngestError::decompression(path, e))?;
        if n == 0 {
            break;
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(_) if compression == Compression::None => {
                return Err(IngestError::UnknownFormat {
                    path: path.to_owned(),
                })
            }
            Err(e) => {
                return Err(IngestError::Decompression {
                    path: path.to_owned(),
                    reason: e.to_string(),
                })
            }
        };
        result.push(line.trim_end_matches(['\n', '\r']).to_owned());
    }
    Ok(result)
}

/// Stream the fully decompressed content of `path_in` to `path_out`.
///
/// `on_progress` is called with the consumed and total input bytes every
/// few megabytes and once at the end.  Returns the number of bytes written.
pub fn decompress_to<P, Q>(
    path_in: P,
    compression: Compression,
    path_out: Q,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, IngestError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let (path_in, path_out) = (path_in.as_ref(), path_out.as_ref());
    let file = File::open(path_in).map_err(|e| IngestError::file_access(path_in, e))?;
    let total = file
        .metadata()
        .map_err(|e| IngestError::file_access(path_in, e))?
        .len();
    let consumed = Rc::new(Cell::new(0));
    let mut reader = decoder(
        CountingReader {
            inner: file,
            count: Rc::clone(&consumed),
        },
        compression,
    );
    let mut writer = File::create(path_out)
        .map(BufWriter::new)
        .map_err(|e| IngestError::file_access(path_out, e))?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0;
    let mut next_report = PROGRESS_EVERY_BYTES;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| IngestError::decompression(path_in, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| IngestError::file_access(path_out, e))?;
        written += n as u64;
        if written >= next_report {
            on_progress(consumed.get(), total);
            next_report += PROGRESS_EVERY_BYTES;
        }
    }
    writer
        .flush()
        .map_err(|e| IngestError::file_access(path_out, e))?;
    on_progress(total, total);
    tracing::debug!(
        "decompressed {:?} to {:?} ({} bytes)",
        path_in,
        path_out,
        written
    );
    Ok(written)
}

/// Helpers for writing compressed fixtures in tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;
    use std::path::Path;

    use super::Compression;

    /// Write `content` to `path`, compressed with `compression`.
    pub fn write_compressed(
        path: &Path,
        content: &[u8],
        compression: Compression,
    ) -> Result<(), anyhow::Error> {
        let file = std::fs::File::create(path)?;
        match compression {
            Compression::None => {
                let mut file = file;
                file.write_all(content)?;
            }
            Compression::Gzip => {
                let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
                enc.write_all(content)?;
                enc.finish()?;
            }
            Compression::Bzip2 => {
                let mut enc = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
                enc.write_all(content)?;
                enc.finish()?;
            }
            Compression::Xz => {
                let mut enc = xz2::write::XzEncoder::new(file, 6);
                enc.write_all(content)?;
                enc.finish()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::fixtures::write_compressed;
    use super::*;

    const CONTENT: &str = "##fileformat=VCFv4.1\n#CHROM\tPOS\n1\t2\n1\t3\n";

    #[rstest::rstest]
    #[case(Compression::None)]
    #[case(Compression::Gzip)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Xz)]
    fn sniff_ignores_extension(#[case] compression: Compression) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("input.vcf");
        write_compressed(&path, CONTENT.as_bytes(), compression)?;

        assert_eq!(Compression::sniff(&path)?, compression);

        Ok(())
    }

    #[rstest::rstest]
    #[case(Compression::None)]
    #[case(Compression::Gzip)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Xz)]
    fn head_and_full(#[case] compression: Compression) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("input.vcf.bin");
        write_compressed(&path, CONTENT.as_bytes(), compression)?;

        let head = head_lines(&path, compression, 2)?;
        assert_eq!(head, vec!["##fileformat=VCFv4.1", "#CHROM\tPOS"]);

        let path_out = tmp_dir.join("out.vcf");
        let written = decompress_to(&path, compression, &path_out, &mut |_, _| ())?;
        assert_eq!(written as usize, CONTENT.len());
        assert_eq!(std::fs::read_to_string(&path_out)?, CONTENT);

        Ok(())
    }

    #[rstest::rstest]
    #[case(Compression::None)]
    #[case(Compression::Gzip)]
    fn decompress_reports_consumed_input(
        #[case] compression: Compression,
    ) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("large.vcf");
        let line = "1\t12345\trs1\tA\tG\t50\tPASS\tDP=10\n";
        let content = line.repeat(40 * 1024 * 1024 / line.len());
        write_compressed(&path, content.as_bytes(), compression)?;
        let size = std::fs::metadata(&path)?.len();

        let mut calls = Vec::new();
        let written = decompress_to(&path, compression, tmp_dir.join("out.vcf"), &mut |done, total| {
            calls.push((done, total))
        })?;

        assert_eq!(written as usize, content.len());
        assert!(calls.len() >= 3);
        assert!(calls.iter().all(|&(done, total)| total == size && done <= total));
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(calls.last().copied(), Some((size, size)));

        Ok(())
    }

    #[test]
    fn head_stops_at_limit() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("many.vcf");
        let content = (0..1000).map(|i| format!("line{}\n", i)).collect::<String>();
        std::fs::write(&path, content)?;

        let head = head_lines(&path, Compression::None, HEAD_LINES)?;
        assert_eq!(head.len(), HEAD_LINES);
        assert_eq!(head[99], "line99");

        Ok(())
    }

    #[test]
    fn missing_file_is_file_access() {
        let err = Compression::sniff("tests/does/not/exist.vcf").unwrap_err();
        assert!(matches!(err, IngestError::FileAccess { .. }));
    }

    #[test]
    fn corrupt_gzip_is_decompression_failure() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("corrupt.vcf");
        std::fs::write(
            &path,
            [
                0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
            ],
        )?;

        let err = decompress_to(&path, Compression::Gzip, tmp_dir.join("out.vcf"), &mut |_, _| ())
            .unwrap_err();
        assert!(matches!(err, IngestError::Decompression { .. }));

        Ok(())
    }

    #[test]
    fn binary_plain_file_is_unknown_format() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("binary.vcf");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x81, b'\n'])?;

        let err = head_lines(&path, Compression::None, 10).unwrap_err();
        assert!(matches!(err, IngestError::UnknownFormat { .. }));

        Ok(())
    }
}
