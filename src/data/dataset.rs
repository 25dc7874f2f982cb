use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use walkdir::WalkDir;

use crate::error::{ReidError, ReidResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReidSample {
    pub path: PathBuf,
    pub pid: usize,
    pub camid: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReidDataset {
    samples: Vec<ReidSample>,
}

impl ReidDataset {
    pub fn new(samples: Vec<ReidSample>) -> Self {
        Self { samples }
    }

    /// Load a list file with one `relative/path pid [camid]` entry per line,
    /// paths relative to `root`. Blank lines and `#` comments are skipped.
    pub fn from_list(root: impl AsRef<Path>, list_file: impl AsRef<Path>) -> ReidResult<Self> {
        let root = root.as_ref();
        let list_file = list_file.as_ref();
        let content = fs::read_to_string(list_file).map_err(|e| ReidError::io(list_file, e))?;

        let mut samples = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 || fields.len() > 3 {
                return Err(ReidError::dataset(
                    list_file,
                    format!("line {}: expected 'path pid [camid]', got '{}'", line_no + 1, line),
                ));
            }

            let parse = |value: &str, what: &str| {
                value.parse::<usize>().map_err(|_| {
                    ReidError::dataset(
                        list_file,
                        format!("line {}: invalid {} '{}'", line_no + 1, what, value),
                    )
                })
            };

            samples.push(ReidSample {
                path: root.join(fields[0]),
                pid: parse(fields[1], "pid")?,
                camid: match fields.get(2) {
                    Some(camid) => parse(camid, "camid")?,
                    None => 0,
                },
            });
        }

        Self::non_empty(samples, list_file)
    }

    /// Scan a Market-1501 style directory (`0002_c1s1_000451_03.jpg`).
    /// Junk images (pid -1) are dropped. Camera ids become 0-based.
    pub fn from_market1501(dir: impl AsRef<Path>) -> ReidResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ReidError::dataset(dir, "directory not found"));
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ReidError::dataset(dir, e.to_string()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_image(path) {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            match parse_market_name(&name) {
                Some((Some(pid), camid)) => samples.push(ReidSample {
                    path: path.to_path_buf(),
                    pid,
                    camid,
                }),
                Some((None, _)) => {}
                None => {
                    return Err(ReidError::dataset(
                        path,
                        "file name does not follow the 'PPPP_cCsS_*' pattern",
                    ));
                }
            }
        }

        Self::non_empty(samples, dir)
    }

    fn non_empty(samples: Vec<ReidSample>, source: &Path) -> ReidResult<Self> {
        if samples.is_empty() {
            return Err(ReidError::dataset(source, "no samples found"));
        }
        log::info!("Loaded {} samples from {}", samples.len(), source.display());
        Ok(Self { samples })
    }

    /// Map raw pids onto `0..num_pids` in ascending pid order.
    pub fn relabel(&self) -> Self {
        let labels: BTreeMap<usize, usize> = self
            .samples
            .iter()
            .map(|s| (s.pid, 0))
            .collect::<BTreeMap<_, _>>()
            .into_keys()
            .enumerate()
            .map(|(label, pid)| (pid, label))
            .collect();

        let samples = self
            .samples
            .iter()
            .map(|s| ReidSample {
                pid: labels[&s.pid],
                ..s.clone()
            })
            .collect();

        Self { samples }
    }

    pub fn num_pids(&self) -> usize {
        let mut pids: Vec<usize> = self.samples.iter().map(|s| s.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        pids.len()
    }

    pub fn num_cams(&self) -> usize {
        let mut cams: Vec<usize> = self.samples.iter().map(|s| s.camid).collect();
        cams.sort_unstable();
        cams.dedup();
        cams.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[ReidSample] {
        &self.samples
    }

    pub fn sample(&self, index: usize) -> &ReidSample {
        &self.samples[index]
    }

    pub fn load_image(&self, index: usize) -> ReidResult<DynamicImage> {
        let path = &self.samples[index].path;
        image::open(path).map_err(|source| ReidError::Image {
            path: path.clone(),
            source,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "{} images, {} ids, {} cameras",
            self.len(),
            self.num_pids(),
            self.num_cams()
        )
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("jpg" | "jpeg" | "png")
    )
}

/// `(pid, camid)` of a Market-1501 file name; `pid` is `None` for junk (-1).
fn parse_market_name(name: &str) -> Option<(Option<usize>, usize)> {
    let mut fields = name.split('_');
    let pid = fields.next()?;
    let camera = fields.next()?.strip_prefix('c')?;
    let digits: String = camera.chars().take_while(|c| c.is_ascii_digit()).collect();
    let camid = digits.parse::<usize>().ok()?.checked_sub(1)?;

    if pid == "-1" {
        return Some((None, camid));
    }
    Some((Some(pid.parse().ok()?), camid))
}
