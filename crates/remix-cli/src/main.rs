use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use remix_contracts::events::{now_utc_iso, EventWriter};
use remix_contracts::quota::{
    apply_billing_event, reset_usage, JsonFileQuotaStore, QuotaRecord, QuotaStore,
    SubscriptionTier,
};
use remix_contracts::summary::{write_summary, BatchSummary};
use remix_contracts::{
    BatchResult, BinaryAsset, Descriptor, DescriptorBatchBuilder, GenerationOutcome,
    VariationKind,
};
use remix_engine::{
    default_client_registry, CancellationToken, EngineConfig, GenerationOrchestrator,
    OrchestratorError,
};
use serde_json::{json, Map};
use tracing_subscriber::EnvFilter;

const DEFAULT_QUOTA_FILE: &str = ".remix/quota.json";
const EXIT_STORAGE_UNAVAILABLE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "remix-rs", version, about = "Quota-gated image variation batches")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Quota(QuotaArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "reference", required = true)]
    references: Vec<PathBuf>,
    #[arg(long = "pose")]
    poses: Vec<String>,
    #[arg(long = "style")]
    styles: Vec<String>,
    #[arg(long = "background")]
    backgrounds: Vec<String>,
    #[arg(long = "instruction")]
    instructions: Vec<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = DEFAULT_QUOTA_FILE)]
    quota_file: PathBuf,
    #[arg(long)]
    free_limit: Option<u32>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    deadline_secs: Option<f64>,
}

#[derive(Debug, Parser)]
struct QuotaArgs {
    #[arg(long, global = true, default_value = DEFAULT_QUOTA_FILE)]
    quota_file: PathBuf,
    #[arg(long, global = true)]
    free_limit: Option<u32>,
    #[command(subcommand)]
    action: QuotaAction,
}

#[derive(Debug, Subcommand)]
enum QuotaAction {
    Show {
        #[arg(long)]
        user: String,
    },
    /// Replays a billing event: sets the tier and its expiry.
    Upgrade {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tier: SubscriptionTier,
        #[arg(long)]
        days: u32,
    },
    Reset {
        #[arg(long)]
        user: String,
    },
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("remix-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Quota(args) => run_quota(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(limit) = args.free_limit.filter(|limit| *limit > 0) {
        config.free_limit = limit;
    }

    let descriptors = build_descriptors(&args)?;
    let store = JsonFileQuotaStore::new(&args.quota_file, config.free_limit);
    let registry = default_client_registry(&config);
    let client = registry.get(&args.provider).with_context(|| {
        format!(
            "unknown provider '{}' (available: {})",
            args.provider,
            registry.names().join(", ")
        )
    })?;

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let cancel = CancellationToken::new();
    if let Some(secs) = args.deadline_secs.filter(|secs| secs.is_finite() && *secs > 0.0) {
        cancel.cancel_after(Duration::from_secs_f64(secs));
    }

    let orchestrator = GenerationOrchestrator::new(&store, client)
        .with_events(EventWriter::new(events_path, "remix-rs"));
    let started_at = now_utc_iso();
    let (result, exit_code) = match orchestrator.run_with_cancel(&args.user, &descriptors, &cancel)
    {
        Ok(result) => (result, 0),
        Err(OrchestratorError::StorageUnavailable { partial, source }) => {
            eprintln!("remix-rs error: batch aborted: {source}");
            (*partial, EXIT_STORAGE_UNAVAILABLE)
        }
        Err(err) => return Err(err.into()),
    };

    let image_paths = write_outcome_images(&args.out, &result)?;
    let summary = BatchSummary::from_result(
        &result,
        &args.user,
        started_at,
        now_utc_iso(),
        &image_paths,
    );
    let mut extra = Map::new();
    extra.insert("provider".to_string(), json!(client.name()));
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;

    print_batch(&result, &image_paths);
    Ok(exit_code)
}

fn build_descriptors(args: &GenerateArgs) -> Result<Vec<Descriptor>> {
    let references = args
        .references
        .iter()
        .map(|path| BinaryAsset::from_path(path))
        .collect::<Result<Vec<_>>>()?;
    let mut builder = DescriptorBatchBuilder::new(references);
    let groups = [
        (VariationKind::Pose, &args.poses),
        (VariationKind::Style, &args.styles),
        (VariationKind::Background, &args.backgrounds),
        (VariationKind::Custom, &args.instructions),
    ];
    for (kind, labels) in groups {
        for label in labels {
            builder.push(kind, label);
        }
    }
    if builder.is_empty() {
        bail!("at least one --pose, --style, --background or --instruction is required");
    }
    Ok(builder.build())
}

fn write_outcome_images(out_dir: &Path, result: &BatchResult) -> Result<HashMap<String, PathBuf>> {
    let mut paths = HashMap::new();
    for outcome in result.outcomes() {
        let GenerationOutcome::Success {
            descriptor_id,
            image_asset,
        } = outcome
        else {
            continue;
        };
        let path = out_dir.join(format!("{descriptor_id}.{}", image_asset.extension()));
        std::fs::write(&path, &image_asset.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        paths.insert(descriptor_id.clone(), path);
    }
    Ok(paths)
}

fn print_batch(result: &BatchResult, image_paths: &HashMap<String, PathBuf>) {
    for outcome in result.outcomes() {
        match outcome {
            GenerationOutcome::Success { descriptor_id, .. } => {
                let path = image_paths
                    .get(descriptor_id)
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                println!("{descriptor_id}  ok      {path}");
            }
            GenerationOutcome::Failure {
                descriptor_id,
                reason,
                detail,
            } => {
                println!("{descriptor_id}  failed  {reason}: {}", first_line(detail));
            }
        }
    }
    println!(
        "Batch {} {}: {} succeeded, {} failed",
        result.batch_id(),
        result.status(),
        result.succeeded_count(),
        result.failed_count()
    );
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn run_quota(args: QuotaArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(limit) = args.free_limit.filter(|limit| *limit > 0) {
        config.free_limit = limit;
    }
    let store = JsonFileQuotaStore::new(&args.quota_file, config.free_limit);
    let record = match args.action {
        QuotaAction::Show { user } => store.load(&user)?,
        QuotaAction::Upgrade { user, tier, days } => {
            apply_billing_event(&store, &user, tier, days, chrono::Utc::now())?
        }
        QuotaAction::Reset { user } => reset_usage(&store, &user)?,
    };
    print_quota(&record)?;
    Ok(0)
}

fn print_quota(record: &QuotaRecord) -> Result<()> {
    let mut payload = match serde_json::to_value(record)? {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("can_generate".to_string(), json!(record.can_generate()));
    payload.insert("remaining_free".to_string(), json!(record.remaining_free()));
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use remix_contracts::quota::{JsonFileQuotaStore, QuotaStore, SubscriptionTier};
    use serde_json::Value;

    use super::{build_descriptors, run_generate, run_quota, Cli, Command, GenerateArgs, QuotaAction};

    fn generate_args(root: &std::path::Path, reference: PathBuf) -> GenerateArgs {
        GenerateArgs {
            user: "alice".to_string(),
            references: vec![reference],
            poses: vec!["jumping".to_string()],
            styles: vec!["pixel art".to_string()],
            backgrounds: vec!["a snowy forest".to_string()],
            instructions: Vec::new(),
            out: root.join("out"),
            provider: "dryrun".to_string(),
            quota_file: root.join("quota.json"),
            free_limit: Some(2),
            events: None,
            deadline_secs: None,
        }
    }

    #[test]
    fn descriptors_follow_flag_groups_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        std::fs::write(&reference, [1u8, 2, 3])?;
        let mut args = generate_args(temp.path(), reference);
        args.instructions = vec!["add a hat".to_string()];

        let descriptors = build_descriptors(&args)?;
        let ids: Vec<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["v01", "v02", "v03", "v04"]);
        assert!(descriptors[0].instruction_text.contains("jumping"));
        assert_eq!(descriptors[3].instruction_text, "add a hat");
        assert_eq!(descriptors[2].reference_assets[0].bytes, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn descriptors_require_at_least_one_variation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        std::fs::write(&reference, [1u8])?;
        let mut args = generate_args(temp.path(), reference);
        args.poses.clear();
        args.styles.clear();
        args.backgrounds.clear();
        assert!(build_descriptors(&args).is_err());
        Ok(())
    }

    #[test]
    fn dryrun_generate_writes_images_summary_and_quota() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        std::fs::write(&reference, [1u8, 2, 3])?;
        let args = generate_args(temp.path(), reference);
        let out = args.out.clone();
        let quota_file = args.quota_file.clone();

        let code = run_generate(args)?;
        assert_eq!(code, 0);
        assert!(out.join("v01.png").exists());
        assert!(out.join("v02.png").exists());
        assert!(!out.join("v03.png").exists());

        let summary: Value = serde_json::from_str(&std::fs::read_to_string(out.join("summary.json"))?)?;
        assert_eq!(summary["succeeded"], 2);
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["items"][2]["reason"], "quota_exceeded");
        assert_eq!(summary["provider"], "dryrun");
        assert!(out.join("events.jsonl").exists());

        let record = JsonFileQuotaStore::new(quota_file, 2).load("alice")?;
        assert_eq!(record.free_used, 2);
        Ok(())
    }

    #[test]
    fn unknown_provider_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        std::fs::write(&reference, [1u8])?;
        let mut args = generate_args(temp.path(), reference);
        args.provider = "midjourney".to_string();
        let err = run_generate(args).err().map(|err| err.to_string()).unwrap_or_default();
        assert!(err.contains("unknown provider 'midjourney'"));
        Ok(())
    }

    #[test]
    fn quota_upgrade_parses_and_persists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let quota_file = temp.path().join("quota.json");
        let cli = Cli::try_parse_from([
            "remix-rs",
            "quota",
            "--quota-file",
            quota_file.to_str().unwrap_or_default(),
            "upgrade",
            "--user",
            "bob",
            "--tier",
            "starter",
            "--days",
            "30",
        ])?;
        let Command::Quota(args) = cli.command else {
            panic!("expected quota command");
        };
        assert!(matches!(args.action, QuotaAction::Upgrade { days: 30, .. }));
        assert_eq!(run_quota(args)?, 0);

        let record = JsonFileQuotaStore::new(&quota_file, 3).load("bob")?;
        assert_eq!(record.subscription_tier, SubscriptionTier::Starter);
        assert!(record.can_generate());
        Ok(())
    }
}
