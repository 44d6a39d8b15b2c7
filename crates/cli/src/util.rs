use std::path::PathBuf;

use url::Url;

// For argp::FromArgs
pub fn parse_path(value: &str) -> Result<PathBuf, String> { Ok(PathBuf::from(value)) }

pub fn parse_url(value: &str) -> Result<Url, String> {
    value.parse().map_err(|e: url::ParseError| e.to_string())
}
