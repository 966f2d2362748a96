//! Byte-offset index over FASTA/FASTQ files for positioned sequence reads.
//!
//! The index records, per identifier, where the sequence line starts in the
//! backing file and how long it is (plus the average Phred score for FASTQ),
//! so a sequence can later be fetched with a single positioned read instead
//! of re-parsing the file. Records are strictly two lines (FASTA) or four
//! lines (FASTQ); multi-line sequences are not supported.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::info;

use crate::errors::TargetedBfsError;

/// Per-thread fetch buffer cap.
pub const MAX_SEQ_LEN: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SeqCoordinates {
    pub seq_start: u64,
    pub seq_len: u64,
    pub phred_avg: f64,
}

pub struct SeqIndex {
    seqs_filepath: PathBuf,
    coords: IndexMap<String, SeqCoordinates>,
    has_phred: bool,
}

fn header_id(
    line: &str,
    path: &Path,
    line_no: usize,
    sigil: char,
) -> Result<String, TargetedBfsError> {
    let rest = line
        .strip_prefix(sigil)
        .ok_or_else(|| TargetedBfsError::BadSeqs {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("expected header starting with '{}'", sigil),
        })?;
    let id = rest.split_whitespace().next().unwrap_or("");
    if id.is_empty() {
        return Err(TargetedBfsError::BadSeqs {
            path: path.to_path_buf(),
            line: line_no,
            reason: "empty identifier".to_string(),
        });
    }
    Ok(id.to_string())
}

impl SeqIndex {
    /// Scan a FASTA/FASTQ file and record sequence coordinates. The format
    /// is detected from the first byte (`@` means FASTQ).
    pub fn build(seqs_filepath: &Path) -> Result<Self, TargetedBfsError> {
        info!("Building index for {:?}", seqs_filepath);

        let mut reader = BufReader::new(File::open(seqs_filepath)?);
        let fastq = reader.fill_buf()?.first() == Some(&b'@');

        let mut coords = IndexMap::new();
        let mut line = String::new();
        let mut byte: u64 = 0;
        let mut line_no: usize = 0;

        let mut id = String::new();
        let mut id_endbyte: u64 = 0;
        let mut seq_start: u64 = 0;
        let mut seq_len: u64 = 0;

        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let content = line.strip_suffix('\n').unwrap_or(&line);
            let endbyte = byte + content.len() as u64;

            if fastq {
                match line_no % 4 {
                    0 => {
                        id = header_id(content, seqs_filepath, line_no, '@')?;
                        id_endbyte = endbyte;
                    }
                    1 => {
                        seq_start = id_endbyte + 1;
                        seq_len = endbyte - id_endbyte - 1;
                        if seq_len == 0 {
                            return Err(TargetedBfsError::BadSeqs {
                                path: seqs_filepath.to_path_buf(),
                                line: line_no,
                                reason: "empty sequence line".to_string(),
                            });
                        }
                    }
                    2 => {
                        if !content.starts_with('+') {
                            return Err(TargetedBfsError::BadSeqs {
                                path: seqs_filepath.to_path_buf(),
                                line: line_no,
                                reason: "expected separator line starting with '+'".to_string(),
                            });
                        }
                    }
                    _ => {
                        let qual = content.as_bytes();
                        let phred_avg = if qual.is_empty() {
                            0.0
                        } else {
                            qual.iter().map(|&b| f64::from(b) - 33.0).sum::<f64>()
                                / qual.len() as f64
                        };
                        coords
                            .entry(std::mem::take(&mut id))
                            .or_insert(SeqCoordinates {
                                seq_start,
                                seq_len,
                                phred_avg,
                            });
                    }
                }
            } else {
                if line_no % 2 == 0 {
                    id = header_id(content, seqs_filepath, line_no, '>')?;
                    id_endbyte = endbyte;
                } else {
                    let seq_start = id_endbyte + 1;
                    let seq_len = endbyte - id_endbyte - 1;
                    if seq_len == 0 {
                        return Err(TargetedBfsError::BadSeqs {
                            path: seqs_filepath.to_path_buf(),
                            line: line_no,
                            reason: "empty sequence line".to_string(),
                        });
                    }
                    coords
                        .entry(std::mem::take(&mut id))
                        .or_insert(SeqCoordinates {
                            seq_start,
                            seq_len,
                            phred_avg: 0.0,
                        });
                }
            }

            byte = endbyte + 1;
            line_no += 1;
        }

        info!("Indexed {} records from {:?}", coords.len(), seqs_filepath);
        Ok(SeqIndex {
            seqs_filepath: seqs_filepath.to_path_buf(),
            coords,
            has_phred: fastq,
        })
    }

    /// Load a previously saved index. Three columns per line for FASTA-built
    /// indexes, four when the average Phred score is present.
    pub fn load(index_filepath: &Path, seqs_filepath: &Path) -> Result<Self, TargetedBfsError> {
        info!("Loading index from {:?}", index_filepath);

        let bad = |line_no: usize, reason: String| TargetedBfsError::BadIndex {
            path: index_filepath.to_path_buf(),
            line: line_no,
            reason,
        };

        let reader = BufReader::new(File::open(index_filepath)?);
        let mut coords = IndexMap::new();
        let mut has_phred = false;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 3 && fields.len() != 4 {
                return Err(bad(line_no, format!("{} columns", fields.len())));
            }
            let seq_start: u64 = fields[1]
                .parse()
                .map_err(|_| bad(line_no, format!("bad seq_start {:?}", fields[1])))?;
            let seq_len: u64 = fields[2]
                .parse()
                .map_err(|_| bad(line_no, format!("bad seq_len {:?}", fields[2])))?;
            let phred_avg: f64 = if fields.len() == 4 {
                has_phred = true;
                fields[3]
                    .parse()
                    .map_err(|_| bad(line_no, format!("bad phred_avg {:?}", fields[3])))?
            } else {
                0.0
            };
            coords.entry(fields[0].to_string()).or_insert(SeqCoordinates {
                seq_start,
                seq_len,
                phred_avg,
            });
        }

        info!("Loaded {} records from {:?}", coords.len(), index_filepath);
        Ok(SeqIndex {
            seqs_filepath: seqs_filepath.to_path_buf(),
            coords,
            has_phred,
        })
    }

    pub fn save(&self, filepath: &Path) -> Result<(), TargetedBfsError> {
        info!("Saving index to {:?}", filepath);

        let mut writer = BufWriter::new(File::create(filepath)?);
        for (id, c) in &self.coords {
            if self.has_phred {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}",
                    id, c.seq_start, c.seq_len, c.phred_avg
                )?;
            } else {
                writeln!(writer, "{}\t{}\t{}", id, c.seq_start, c.seq_len)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn seq_exists(&self, id: &str) -> bool {
        self.coords.contains_key(id)
    }

    pub fn get_seq_len(&self, id: &str) -> Result<u64, TargetedBfsError> {
        self.coords
            .get(id)
            .map(|c| c.seq_len)
            .ok_or_else(|| TargetedBfsError::UnknownId(id.to_string()))
    }

    /// Zero for every record of a FASTA-built index.
    pub fn get_phred_avg(&self, id: &str) -> Result<f64, TargetedBfsError> {
        self.coords
            .get(id)
            .map(|c| c.phred_avg)
            .ok_or_else(|| TargetedBfsError::UnknownId(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &SeqCoordinates)> {
        self.coords.iter().map(|(id, c)| (id.as_str(), c))
    }

    /// Open a positioned-read handle for the calling thread. Each thread
    /// keeps its own cursor; the cursor owns a file descriptor and one
    /// reusable buffer.
    pub fn cursor(&self) -> Result<SeqCursor<'_>, TargetedBfsError> {
        let file = File::open(&self.seqs_filepath)?;
        #[cfg(target_os = "linux")]
        {
            use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
            use std::os::unix::io::AsRawFd;
            let _ = posix_fadvise(file.as_raw_fd(), 0, 0, PosixFadviseAdvice::POSIX_FADV_RANDOM);
        }
        Ok(SeqCursor {
            index: self,
            file,
            buf: Vec::new(),
        })
    }
}

/// Per-thread positioned reader. The slice returned by `get_seq` borrows the
/// cursor's buffer and stays valid until the next fetch on the same cursor.
pub struct SeqCursor<'a> {
    index: &'a SeqIndex,
    file: File,
    buf: Vec<u8>,
}

impl SeqCursor<'_> {
    pub fn get_seq(&mut self, id: &str) -> Result<&[u8], TargetedBfsError> {
        use std::os::unix::fs::FileExt;

        let coords = self
            .index
            .coords
            .get(id)
            .ok_or_else(|| TargetedBfsError::UnknownId(id.to_string()))?;
        if coords.seq_len > MAX_SEQ_LEN {
            return Err(TargetedBfsError::SeqTooLarge {
                id: id.to_string(),
                len: coords.seq_len,
                max: MAX_SEQ_LEN,
            });
        }
        self.buf.resize(coords.seq_len as usize, 0);
        self.file.read_exact_at(&mut self.buf, coords.seq_start)?;
        Ok(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn write_seqs(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn fasta_offsets() {
        let f = write_seqs(">r1\nACGT\n>r2\nTTTT\n");
        let index = SeqIndex::build(f.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get_seq_len("r1").unwrap(), 4);
        assert_eq!(index.get_seq_len("r2").unwrap(), 4);
        let records: Vec<_> = index.records().collect();
        assert_eq!(records[0].1.seq_start, 4);
        assert_eq!(records[1].1.seq_start, 13);
        assert_eq!(index.get_phred_avg("r1").unwrap(), 0.0);
    }

    #[test]
    fn fastq_offsets_and_phred() {
        let f = write_seqs("@r1\nACGT\n+\n!!!!\n@r2 desc\nGG\n+\n5I\n");
        let index = SeqIndex::build(f.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get_seq_len("r1").unwrap(), 4);
        assert_eq!(index.get_phred_avg("r1").unwrap(), 0.0);
        // '5' is Phred 20, 'I' is Phred 40.
        assert_eq!(index.get_phred_avg("r2").unwrap(), 30.0);
    }

    #[test]
    fn header_id_stops_at_whitespace() {
        let f = write_seqs(">r1 some description here\nACGT\n");
        let index = SeqIndex::build(f.path()).unwrap();
        assert!(index.seq_exists("r1"));
        assert!(!index.seq_exists("r1 some"));
    }

    #[test]
    fn positioned_fetch_returns_raw_bytes() {
        let f = write_seqs(">a\nACGTACGT\n>b\nTTGGCC\n");
        let index = SeqIndex::build(f.path()).unwrap();
        let mut cursor = index.cursor().unwrap();
        assert_eq!(cursor.get_seq("a").unwrap(), b"ACGTACGT");
        assert_eq!(cursor.get_seq("b").unwrap(), b"TTGGCC");
        assert_eq!(cursor.get_seq("a").unwrap(), b"ACGTACGT");
        assert!(matches!(
            cursor.get_seq("missing"),
            Err(TargetedBfsError::UnknownId(_))
        ));
    }

    #[test]
    fn save_load_round_trip() {
        let f = write_seqs("@r1\nACGT\n+\nIIII\n@r2\nGGCC\n+\n!!#%\n");
        let built = SeqIndex::build(f.path()).unwrap();

        let out = NamedTempFile::new().unwrap();
        built.save(out.path()).unwrap();
        let loaded = SeqIndex::load(out.path(), f.path()).unwrap();

        let a: Vec<_> = built.records().collect();
        let b: Vec<_> = loaded.records().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn save_format_matches_build_kind() {
        let f = write_seqs(">r1\nACGT\n>r2\nTTTT\n");
        let index = SeqIndex::build(f.path()).unwrap();
        let out = NamedTempFile::new().unwrap();
        index.save(out.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.path()).unwrap(),
            "r1\t4\t4\nr2\t13\t4\n"
        );

        let f = write_seqs("@r1\nACGT\n+\n!!!!\n");
        let index = SeqIndex::build(f.path()).unwrap();
        let out = NamedTempFile::new().unwrap();
        index.save(out.path()).unwrap();
        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "r1\t4\t4\t0\n");
    }

    #[test]
    fn load_rejects_malformed_lines() {
        let idx = write_seqs("r1\t4\n");
        assert!(matches!(
            SeqIndex::load(idx.path(), Path::new("unused")),
            Err(TargetedBfsError::BadIndex { .. })
        ));

        let idx = write_seqs("r1\tfour\t4\n");
        assert!(matches!(
            SeqIndex::load(idx.path(), Path::new("unused")),
            Err(TargetedBfsError::BadIndex { .. })
        ));
    }

    #[test]
    fn build_rejects_bad_headers() {
        let f = write_seqs("ACGT\n>r1\n");
        assert!(matches!(
            SeqIndex::build(f.path()),
            Err(TargetedBfsError::BadSeqs { .. })
        ));
    }
}
