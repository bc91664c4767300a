//! Command-line configuration.

use clap::Parser;
use std::path::PathBuf;

/// Embeds a compact symbol table into a linked PE image.
///
/// Debug information is read from the `.stab`/`.stabstr` sections or, for
/// assembly-only modules, from the COFF symbol table. The verbose debug
/// sections are stripped, base relocations deduplicated, and the result
/// appended as a discardable `.rossym` section.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// Source tree root used to shorten recorded file paths.
    #[arg(short = 's', value_name = "sources")]
    pub sources: Option<PathBuf>,

    /// Input PE image.
    pub input: PathBuf,

    /// Output image.
    pub output: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_input_and_output() {
        let config = Config::try_parse_from(["rsym", "in.exe", "out.exe"]).unwrap();
        assert_eq!(config.input, PathBuf::from("in.exe"));
        assert_eq!(config.output, PathBuf::from("out.exe"));
        assert!(config.sources.is_none());
    }

    #[test]
    fn sources_flag() {
        let config =
            Config::try_parse_from(["rsym", "-s", "/src/ros", "in.exe", "out.exe"]).unwrap();
        assert_eq!(config.sources, Some(PathBuf::from("/src/ros")));
    }

    #[test]
    fn missing_output_is_an_error() {
        assert!(Config::try_parse_from(["rsym", "in.exe"]).is_err());
    }
}
