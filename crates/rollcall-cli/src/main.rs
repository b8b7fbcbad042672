use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{BoundingBox, FaceTemplate};
use rollcall_engine::{spawn_engine, Config, EngineHandle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face verification and daily attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the largest face in an image
    Detect { image: PathBuf },
    /// Encode the largest face into a template
    Encode {
        image: PathBuf,
        /// Write the raw template bytes here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Enroll a face for an identity (replaces any previous template)
    Enroll {
        #[arg(short, long)]
        identity: String,
        image: PathBuf,
    },
    /// Compare two template files
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(short, long, default_value_t = rollcall_core::DEFAULT_MATCH_THRESHOLD)]
        threshold: f64,
    },
    /// Verify a photo against an enrolled identity
    Verify {
        #[arg(short, long)]
        identity: String,
        image: PathBuf,
    },
    /// Find the enrolled identity that best matches a photo
    Search { image: PathBuf },
    /// Mark today's attendance from a photo
    Mark {
        image: PathBuf,
        /// Verify against this identity instead of searching everyone
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// List enrolled identities
    List,
    /// Show the attendance ledger for a day (default: today)
    Attendance {
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Only this identity's rows
        #[arg(short, long)]
        identity: Option<String>,
    },
}

#[derive(Serialize)]
struct EncodeSummary {
    face: BoundingBox,
    confidence: f64,
    template_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    tracing::debug!(db = %config.db_path.display(), threshold = config.match_threshold, "configuration loaded");
    run(&config, cli.command).await
}

async fn run(config: &Config, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Detect { image } => {
            let result = engine(config)?.detect(read_image(&image)?).await?;
            print_json(&result)?;
            Ok(exit_for(result.face.is_some()))
        }
        Commands::Encode { image, out } => {
            let encoding = engine(config)?.encode(read_image(&image)?).await?;
            if let Some(path) = &out {
                std::fs::write(path, encoding.template.to_bytes())
                    .with_context(|| format!("writing template to {}", path.display()))?;
            }
            print_json(&EncodeSummary {
                face: encoding.face,
                confidence: encoding.confidence,
                template_len: encoding.template.len(),
                out,
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enroll { identity, image } => {
            let enrolled = engine(config)?.enroll(identity, read_image(&image)?).await?;
            print_json(&enrolled.record)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compare { a, b, threshold } => {
            let len = config.encoder.template_len();
            let result = rollcall_core::compare(&read_template(&a, len)?, &read_template(&b, len)?, threshold)
                .context("comparing templates")?;
            print_json(&result)?;
            Ok(exit_for(result.matched))
        }
        Commands::Verify { identity, image } => {
            let result = engine(config)?.verify(identity, read_image(&image)?).await?;
            print_json(&result)?;
            Ok(exit_for(result.matched))
        }
        Commands::Search { image } => {
            let result = engine(config)?.search(read_image(&image)?).await?;
            print_json(&result)?;
            Ok(exit_for(result.matched))
        }
        Commands::Mark { image, identity } => {
            let marked = engine(config)?
                .mark_attendance(read_image(&image)?, identity)
                .await?;
            print_json(&marked.outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            print_json(&engine(config)?.templates().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Attendance { date, identity } => {
            let date = date.unwrap_or_else(rollcall_engine::store::today);
            print_json(&engine(config)?.attendance(date, identity).await?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Start the engine thread; `compare` never needs it.
fn engine(config: &Config) -> Result<EngineHandle> {
    spawn_engine(config)
        .with_context(|| format!("starting engine with database {}", config.db_path.display()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// Templates written by `encode --out` at the configured patch size.
fn read_template(path: &Path, len: usize) -> Result<FaceTemplate> {
    let bytes = std::fs::read(path).with_context(|| format!("reading template {}", path.display()))?;
    FaceTemplate::from_bytes_with_len(&bytes, len)
        .with_context(|| format!("decoding template {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_file(name: &str, len: usize) -> (PathBuf, FaceTemplate) {
        let mut values = vec![0.5; len];
        values[0] = 1.0;
        let template = FaceTemplate::new(values).unwrap();
        let path = std::env::temp_dir().join(format!("rollcall-cli-{}-{name}.bin", std::process::id()));
        std::fs::write(&path, template.to_bytes()).unwrap();
        (path, template)
    }

    #[test]
    fn test_read_template_uses_configured_patch_size() {
        let mut config = Config::default();
        config.encoder.patch_size = 64;
        let len = config.encoder.template_len();
        let (path, template) = template_file("narrow", len);

        assert_eq!(read_template(&path, len).unwrap(), template);
        assert!(read_template(&path, rollcall_core::TEMPLATE_LEN).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_attendance_accepts_identity_filter() {
        let cli = Cli::try_parse_from(["rollcall", "attendance", "--date", "2026-10-19", "--identity", "ada"]).unwrap();
        let Commands::Attendance { date, identity } = cli.command else {
            panic!("parsed the wrong subcommand");
        };
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 10, 19));
        assert_eq!(identity.as_deref(), Some("ada"));
    }
}
