//! Command-line arguments

use std::path::PathBuf;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use tarstitch_formats::{ManifestOptions, PartLimits, SplitStrategy};
use tarstitch_store::{
    AssemblyConfig, DriftCheck, ObjectRef, RetryPolicy, SourceSet, parse_split_strategy,
    parse_store_url,
};

/// Build tar archives out of objects that are already in a store
#[derive(Debug, Parser)]
#[command(name = "tarstitch", version, about)]
pub struct Cli {
    /// Directory backing the object store; each bucket is a sub-directory
    #[arg(long, global = true, env = "TARSTITCH_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TARSTITCH_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Archive every object under a source prefix into one tar object
    Create(CreateArgs),
    /// Print the manifest an archive of the source prefix would carry
    Layout(LayoutArgs),
    /// Show how an object of the given size would be split into parts
    Parts(PartsArgs),
    /// Abort abandoned multipart uploads
    Sweep(SweepArgs),
}

/// Multipart limits and copy splitting
#[derive(Debug, Clone, Args)]
pub struct PartArgs {
    /// Minimum size of every part but the last (accepts K, M, G suffixes)
    #[arg(
        long,
        env = "TARSTITCH_MIN_PART_SIZE",
        default_value = "5M",
        value_parser = parse_size
    )]
    pub min_part_size: u64,

    /// Maximum part size (accepts K, M, G suffixes)
    #[arg(
        long,
        env = "TARSTITCH_MAX_PART_SIZE",
        default_value = "5G",
        value_parser = parse_size
    )]
    pub max_part_size: u64,

    /// Maximum number of parts per upload
    #[arg(long, env = "TARSTITCH_MAX_PART_COUNT", default_value_t = 10_000)]
    pub max_part_count: u64,

    /// Part count for large copies: midpoint or minimum
    #[arg(
        long,
        env = "TARSTITCH_SPLIT_STRATEGY",
        default_value = "midpoint",
        value_parser = parse_strategy
    )]
    pub split_strategy: SplitStrategy,
}

impl PartArgs {
    pub fn limits(&self) -> PartLimits {
        PartLimits::new(self.min_part_size, self.max_part_size, self.max_part_count)
    }
}

/// Manifest member settings
#[derive(Debug, Clone, Args)]
pub struct ManifestArgs {
    /// Start the manifest with a `name,offset,size,etag` row
    #[arg(long, env = "TARSTITCH_HEADER_ROW")]
    pub header_row: bool,

    /// Modification time of the manifest member, seconds since the epoch
    #[arg(long, default_value_t = 0)]
    pub manifest_mtime: u64,
}

impl ManifestArgs {
    pub fn options(&self) -> ManifestOptions {
        ManifestOptions::default()
            .with_header_row(self.header_row)
            .with_mtime(self.manifest_mtime)
    }
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Source prefix and destination object, e.g. s3://bucket/prefix/
    /// s3://bucket/archive.tar; only the destination with --source-manifest
    #[arg(
        required = true,
        num_args = 1..=2,
        value_names = ["SOURCE", "DESTINATION"]
    )]
    pub locations: Vec<String>,

    /// CSV list of `bucket,key,size,etag` rows to archive instead of a
    /// prefix, as a local path or s3://bucket/key
    #[arg(long, env = "TARSTITCH_SOURCE_MANIFEST")]
    pub source_manifest: Option<String>,

    /// Drop the first row of the source manifest
    #[arg(long, requires = "source_manifest")]
    pub skip_manifest_header: bool,

    /// Concurrent part workers
    #[arg(long, env = "TARSTITCH_THREADS", default_value_t = 16)]
    pub threads: usize,

    /// Re-check sources before copying: strict or off
    #[arg(long, env = "TARSTITCH_DRIFT_CHECK", default_value = "strict")]
    pub drift_check: DriftCheck,

    /// Delete the archived sources once the archive is complete
    #[arg(long)]
    pub delete_source: bool,

    #[command(flatten)]
    pub parts: PartArgs,

    #[command(flatten)]
    pub manifest: ManifestArgs,
}

impl CreateArgs {
    /// Where the objects come from and where the archive goes
    pub fn source_and_destination(&self) -> anyhow::Result<(SourceSet, ObjectRef)> {
        let (source, destination) = match (&self.source_manifest, self.locations.as_slice()) {
            (Some(location), [destination]) => (
                SourceSet::Manifest {
                    location: location.clone(),
                    skip_header: self.skip_manifest_header,
                },
                destination,
            ),
            (None, [source, destination]) => {
                (SourceSet::Prefix(parse_store_url(source)?), destination)
            }
            (Some(_), _) => bail!("--source-manifest takes only a destination"),
            (None, _) => bail!("expected a source and a destination"),
        };

        let destination = parse_store_url(destination)?;
        if destination.key.is_empty() {
            bail!("destination {destination} names no object key");
        }
        Ok((source, destination))
    }

    /// Assembly settings, with the retry policy taken from the environment
    pub fn config(&self) -> anyhow::Result<AssemblyConfig> {
        Ok(AssemblyConfig::default()
            .with_threads(self.threads)
            .with_part_limits(self.parts.limits())
            .with_split_strategy(self.parts.split_strategy)
            .with_drift_check(self.drift_check)
            .with_retry_policy(RetryPolicy::from_env()?))
    }
}

#[derive(Debug, Args)]
pub struct LayoutArgs {
    /// Source location, e.g. s3://bucket/prefix/
    pub source: String,

    #[command(flatten)]
    pub manifest: ManifestArgs,
}

#[derive(Debug, Args)]
pub struct PartsArgs {
    /// Object size in bytes (accepts K, M, G suffixes)
    #[arg(value_parser = parse_size)]
    pub size: u64,

    #[command(flatten)]
    pub parts: PartArgs,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Bucket and optional key prefix, e.g. s3://bucket/tmp/
    pub location: String,
}

/// Parse a byte count with an optional binary suffix (`K`, `M`, `G`, `T`)
pub fn parse_size(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {value:?}"))?;

    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => return Err(format!("unknown size suffix {other:?}")),
    };
    number
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size {value:?} is too large"))
}

fn parse_strategy(value: &str) -> Result<SplitStrategy, String> {
    parse_split_strategy(value).map_err(|e| e.to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("5M").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_size("5MiB").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_size("2 g").unwrap(), 2 << 30);
        assert!(parse_size("M").is_err());
        assert!(parse_size("5X").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_create_defaults() {
        let cli = Cli::try_parse_from([
            "tarstitch",
            "create",
            "s3://src/logs/",
            "s3://dst/logs.tar",
        ])
        .expect("arguments should parse");
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.threads, 16);
        assert_eq!(args.drift_check, DriftCheck::Strict);
        assert_eq!(args.parts.limits(), PartLimits::S3);
        assert_eq!(args.parts.split_strategy, SplitStrategy::Midpoint);
        assert!(!args.delete_source);
        assert!(!args.manifest.options().include_header_row);
    }

    #[test]
    fn test_create_overrides() {
        let cli = Cli::try_parse_from([
            "tarstitch",
            "--root",
            "/data",
            "create",
            "s3://src/logs/",
            "s3://dst/logs.tar",
            "--threads",
            "4",
            "--min-part-size",
            "8M",
            "--split-strategy",
            "minimum",
            "--drift-check",
            "off",
            "--header-row",
            "--delete-source",
        ])
        .expect("arguments should parse");
        assert_eq!(cli.root, PathBuf::from("/data"));
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.threads, 4);
        assert_eq!(args.parts.min_part_size, 8 * 1024 * 1024);
        assert_eq!(args.parts.split_strategy, SplitStrategy::Minimum);
        assert_eq!(args.drift_check, DriftCheck::Off);
        assert!(args.delete_source);
        assert!(args.manifest.options().include_header_row);
    }

    #[test]
    fn test_create_from_source_manifest() {
        let cli = Cli::try_parse_from([
            "tarstitch",
            "create",
            "--source-manifest",
            "s3://lists/batch.csv",
            "--skip-manifest-header",
            "s3://dst/batch.tar",
        ])
        .expect("arguments should parse");
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        let (source, destination) = args.source_and_destination().expect("locations");
        assert_eq!(
            source,
            SourceSet::Manifest {
                location: "s3://lists/batch.csv".to_string(),
                skip_header: true,
            }
        );
        assert_eq!(destination, ObjectRef::new("dst", "batch.tar"));
    }

    #[test]
    fn test_create_location_count_checked() {
        let parse = |args: &[&str]| {
            let cli = Cli::try_parse_from(args.iter().copied()).expect("arguments should parse");
            let Command::Create(args) = cli.command else {
                panic!("expected create");
            };
            args.source_and_destination()
        };

        let (source, _) = parse(&["tarstitch", "create", "s3://src/logs/", "s3://dst/a.tar"])
            .expect("prefix source");
        assert_eq!(source, SourceSet::Prefix(ObjectRef::new("src", "logs/")));

        assert!(parse(&["tarstitch", "create", "s3://dst/a.tar"]).is_err());
        let bad_destination = ["tarstitch", "create", "s3://src/", "s3://dst/"];
        assert!(parse(&bad_destination).is_err());
        let both = [
            "tarstitch",
            "create",
            "--source-manifest",
            "list.csv",
            "s3://src/logs/",
            "s3://dst/a.tar",
        ];
        assert!(parse(&both).is_err());
    }

    #[test]
    fn test_skip_header_requires_source_manifest() {
        let result = Cli::try_parse_from([
            "tarstitch",
            "create",
            "--skip-manifest-header",
            "s3://src/logs/",
            "s3://dst/a.tar",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = Cli::try_parse_from(["tarstitch", "parts", "1G", "--split-strategy", "max"]);
        assert!(result.is_err());
    }
}
