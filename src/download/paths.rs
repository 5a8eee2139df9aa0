//! 输出路径解析与文件名清洗。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::models::DownloadJob;

const MAX_FILENAME_LEN: usize = 255 - 10; // room for extension and a suffix
const FALLBACK_NAME: &str = "download";

fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s.\-]").expect("static regex"))
}

/// Replaces characters outside `[\w\s.-]` with `_`, trims, and caps the byte length.
pub fn sanitize_filename(name: &str) -> String {
    let replaced = invalid_chars().replace_all(name.trim(), "_");
    let mut cleaned: String = replaced
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    if cleaned.len() > MAX_FILENAME_LEN {
        let mut end = MAX_FILENAME_LEN;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    let cleaned = cleaned.trim().trim_end_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(dir: &Path) -> PathBuf {
    let Ok(rest) = dir.strip_prefix("~") else {
        return dir.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => dir.to_path_buf(),
    }
}

pub fn output_file_name(job: &DownloadJob) -> String {
    format!(
        "{}.{}",
        sanitize_filename(job.name()),
        job.options().file_extension()
    )
}

/// Creates the destination directory and returns the job's target file path.
pub fn prepare_output_path(destination_dir: &Path, job: &DownloadJob) -> io::Result<PathBuf> {
    let dir = expand_home(destination_dir);
    fs::create_dir_all(&dir)?;
    Ok(dir.join(output_file_name(job)))
}
