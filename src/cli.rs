use clap::Parser;
use segdl::config::{DEFAULT_MAX_PARALLEL, DEFAULT_SEGMENTS};
use segdl::EngineConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// File name of the transfer list kept next to the downloads.
pub const STATE_FILE: &str = "segdl.json";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// URLs to download
    #[arg(index = 1)]
    pub urls: Vec<String>,

    /// Path to a file containing URLs (one per line)
    #[arg(short = 't', long = "tasks-file")]
    pub tasks_file: Option<PathBuf>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Maximum number of transfers running at once; the rest are held
    #[arg(short = 'c', long = "max-parallel", default_value_t = DEFAULT_MAX_PARALLEL)]
    pub max_parallel: usize,

    /// Number of segments per file
    #[arg(short = 's', long, default_value_t = DEFAULT_SEGMENTS)]
    pub segments: usize,

    /// Extra request header, e.g. -H 'Authorization: Bearer xyz' (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// List all transfers recorded in the download directory and exit
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Resume paused transfers from the previous session
    #[arg(short = 'r', long)]
    pub resume: bool,
}

impl Args {
    pub fn state_file(&self) -> PathBuf {
        self.download_dir.join(STATE_FILE)
    }

    pub fn request_headers(&self) -> Option<BTreeMap<String, String>> {
        if self.headers.is_empty() {
            return None;
        }
        Some(self.headers.iter().cloned().collect())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel: self.max_parallel,
            segments: self.segments,
            ..EngineConfig::default()
        }
    }
}

/// Parse `Name: value`.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_split_on_first_colon() {
        assert_eq!(
            parse_header("Referer: https://example.com:8080/x").unwrap(),
            ("Referer".to_string(), "https://example.com:8080/x".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn args_map_onto_engine_config() {
        let args = Args::parse_from(["segdl", "-c", "2", "-s", "8", "-H", "X-A: 1", "http://h/f.bin"]);
        let config = args.engine_config();
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.segments, 8);
        assert_eq!(args.urls, vec!["http://h/f.bin"]);
        assert_eq!(args.request_headers().unwrap()["X-A"], "1");
        assert_eq!(args.state_file(), PathBuf::from("downloads").join(STATE_FILE));
    }
}
