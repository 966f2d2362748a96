//! Many-to-many target-to-mapped-sequence relation.
//!
//! Loaded once at startup from either an ntLink verbose-mapping stream or a
//! SAM file, restricted to targets present in the target index, and (for
//! ntLink input) density-capped per target by an adaptive minimizer
//! threshold. Read-only afterwards and shared by every batch worker.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use log::info;

use crate::errors::TargetedBfsError;
use crate::pipes::Tokens;
use crate::seq_index::SeqIndex;

#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub seq_id: String,
    /// Minimizers in common with the target, as reported by the upstream
    /// mapper. Zero for SAM input.
    pub mx_in_common: u32,
}

pub struct AllMappings {
    map: HashMap<String, Vec<Mapping>>,
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>, TargetedBfsError> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Filename with a trailing `.gz` stripped, for format detection.
fn plain_name(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    let name = name.unwrap_or_default();
    name.strip_suffix(".gz").unwrap_or(&name).to_string()
}

impl AllMappings {
    pub fn load(
        filepath: &Path,
        target_index: &SeqIndex,
        mx_threshold_min: u32,
        mx_threshold_max: u32,
        mx_max_mapped_seqs_per_target_10kbp: f64,
    ) -> Result<Self, TargetedBfsError> {
        let name = plain_name(filepath);
        let mut all = if name.ends_with(".sam") || name.ends_with(".bam") {
            Self::load_sam(filepath, target_index)?
        } else {
            let mut all = Self::load_ntlink(filepath, target_index, mx_threshold_min)?;
            all.filter(
                mx_max_mapped_seqs_per_target_10kbp,
                mx_threshold_min,
                mx_threshold_max,
                target_index,
            )?;
            all
        };
        all.map.shrink_to_fit();
        Ok(all)
    }

    /// Mappings supporting `target_id`, empty for unknown targets.
    pub fn get(&self, target_id: &str) -> &[Mapping] {
        self.map.get(target_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// ntLink verbose mappings: a whitespace-separated stream of
    /// `(mapped_id, target_id, mx)` triples, recovered positionally.
    fn load_ntlink(
        filepath: &Path,
        target_index: &SeqIndex,
        mx_threshold_min: u32,
    ) -> Result<Self, TargetedBfsError> {
        info!("Loading ntLink mappings from {:?}", filepath);

        let mut map: HashMap<String, Vec<Mapping>> = HashMap::new();
        let mut tokens = Tokens::new(open_reader(filepath)?);
        let mut mapped_id = String::new();
        let mut target_id = String::new();
        let mut i: u64 = 0;
        while let Some(token) = tokens.next_token()? {
            match i % 3 {
                0 => mapped_id = token,
                1 => target_id = token,
                _ => {
                    if target_index.seq_exists(&target_id) {
                        let mx: u32 =
                            token
                                .parse()
                                .map_err(|_| TargetedBfsError::BadMappings {
                                    path: filepath.to_path_buf(),
                                    reason: format!("non-numeric minimizer count {:?}", token),
                                })?;
                        let mappings = map.entry(target_id.clone()).or_default();
                        if mx >= mx_threshold_min {
                            mappings.push(Mapping {
                                seq_id: mapped_id.clone(),
                                mx_in_common: mx,
                            });
                        }
                    }
                }
            }
            i += 1;
        }

        info!("Loaded mappings for {} targets", map.len());
        Ok(AllMappings { map })
    }

    /// SAM: only QNAME and RNAME are used; header lines are skipped and the
    /// FLAG column is ignored.
    fn load_sam(filepath: &Path, target_index: &SeqIndex) -> Result<Self, TargetedBfsError> {
        info!("Loading SAM mappings from {:?}", filepath);

        let mut map: HashMap<String, Vec<Mapping>> = HashMap::new();
        for line in open_reader(filepath)?.lines() {
            let line = line?;
            if line.starts_with('@') || line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let qname = fields.next();
            let rname = fields.nth(1);
            let (Some(mapped_id), Some(target_id)) = (qname, rname) else {
                return Err(TargetedBfsError::BadMappings {
                    path: filepath.to_path_buf(),
                    reason: format!("truncated SAM record {:?}", line),
                });
            };
            if target_index.seq_exists(target_id) {
                map.entry(target_id.to_string()).or_default().push(Mapping {
                    seq_id: mapped_id.to_string(),
                    mx_in_common: 0,
                });
            }
        }

        info!("Loaded mappings for {} targets", map.len());
        Ok(AllMappings { map })
    }

    /// Cap mapped-per-target density. For each target, pick the smallest
    /// minimizer threshold in `[min, max]` that brings the survivor count
    /// under `ceil(len * max_per_10kbp / 10000)`; when even `max` cannot,
    /// apply `max` and accept the overshoot.
    fn filter(
        &mut self,
        max_mapped_seqs_per_target_10kbp: f64,
        mx_threshold_min: u32,
        mx_threshold_max: u32,
        target_index: &SeqIndex,
    ) -> Result<(), TargetedBfsError> {
        info!("Filtering mapped seqs per target");

        if max_mapped_seqs_per_target_10kbp <= 0.0 {
            return Err(TargetedBfsError::NonPositiveRate(
                "mx_max_mapped_seqs_per_target_10kbp",
            ));
        }
        if mx_threshold_min >= mx_threshold_max {
            return Err(TargetedBfsError::BadMxThresholds {
                min: mx_threshold_min,
                max: mx_threshold_max,
            });
        }

        for (target_id, mappings) in &mut self.map {
            if mappings.is_empty() {
                continue;
            }
            let Ok(target_len) = target_index.get_seq_len(target_id) else {
                continue;
            };
            let cap = (target_len as f64 * max_mapped_seqs_per_target_10kbp / 10_000.0).ceil()
                as usize;
            debug_assert!(cap >= 1);

            let survivors = |threshold: u32| {
                mappings
                    .iter()
                    .filter(|m| m.mx_in_common >= threshold)
                    .count()
            };

            let threshold = if mappings.len() <= cap {
                mx_threshold_min
            } else if survivors(mx_threshold_max) > cap {
                // Even the top of the range overshoots; take it anyway.
                mx_threshold_max
            } else {
                let mut lo = mx_threshold_min;
                let mut hi = mx_threshold_max;
                // Invariant: survivors(lo) > cap, survivors(hi) <= cap.
                while hi - lo > 1 {
                    let mid = (lo + hi) / 2;
                    if survivors(mid) > cap {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                hi
            };

            mappings.retain(|m| m.mx_in_common >= threshold);
        }

        info!("Done filtering");
        Ok(())
    }
}
