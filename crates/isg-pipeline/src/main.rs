use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use isg_core::{CandidateDraft, CandidateId, CommitId, EntityId, ExtractionBatch, HumanDecision};
use isg_pipeline::{telemetry, ChangeRequest, Disposition, Pipeline, PipelineConfig, StaticProposer};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn cli() -> Command {
    Command::new("isg")
        .version(isg_pipeline::VERSION)
        .about("Interface signature graph: retrieval and validated mutation")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the TOML configuration"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("ingest")
                .about("Load an extraction batch (JSON) into the graph")
                .arg(
                    Arg::new("batch")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Batch file"),
                ),
        )
        .subcommand(
            Command::new("retrieve")
                .about("Show the ranked neighbourhood and context bundle for seeds")
                .arg(
                    Arg::new("seed")
                        .required(true)
                        .num_args(1..)
                        .help("Seed entity ids, e.g. rt::task::spawn"),
                )
                .arg(
                    Arg::new("hops")
                        .long("hops")
                        .value_parser(value_parser!(u32))
                        .help("Maximum traversal depth"),
                )
                .arg(
                    Arg::new("budget")
                        .long("budget")
                        .value_parser(value_parser!(usize))
                        .help("Context budget"),
                )
                .arg(
                    Arg::new("render")
                        .long("render")
                        .action(ArgAction::SetTrue)
                        .help("Print the packed context text"),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("Run a change request with drafts read from a file")
                .arg(
                    Arg::new("request")
                        .long("request")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Change request (JSON)"),
                )
                .arg(
                    Arg::new("drafts")
                        .long("drafts")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Candidate drafts (JSON array)"),
                ),
        )
        .subcommand(Command::new("candidates").about("List pending candidates"))
        .subcommand(
            Command::new("approve")
                .about("Record a reviewer decision on a pending candidate")
                .arg(Arg::new("candidate").required(true).help("Candidate id"))
                .arg(
                    Arg::new("reviewer")
                        .long("reviewer")
                        .required(true)
                        .help("Reviewer name for the audit trail"),
                )
                .arg(
                    Arg::new("reject")
                        .long("reject")
                        .value_name("NOTE")
                        .help("Reject instead of approving"),
                ),
        )
        .subcommand(
            Command::new("rollback")
                .about("Undo a commit")
                .arg(Arg::new("commit").required(true).help("Commit id")),
        )
        .subcommand(Command::new("history").about("Print the audit trail"))
        .subcommand(Command::new("verify").about("Verify the audit hash chain"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("decoding {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<PipelineConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::load(path)?,
        None if Path::new("isg.toml").exists() => PipelineConfig::load("isg.toml")?,
        None => PipelineConfig::default(),
    };
    if config.storage.dir.is_none() {
        tracing::warn!("no storage.dir configured; state will not outlive this process");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    telemetry::init(matches.get_flag("json-logs"));
    let config = load_config(&matches)?;

    let drafts: Vec<CandidateDraft> = match matches.subcommand() {
        Some(("submit", args)) => read_json(args.get_one::<PathBuf>("drafts").context("missing --drafts")?)?,
        _ => Vec::new(),
    };
    let pipeline = Pipeline::new(config, Arc::new(StaticProposer::new(drafts)))?;

    match matches.subcommand() {
        Some(("ingest", args)) => {
            let path = args.get_one::<PathBuf>("batch").context("missing batch")?;
            let batch: ExtractionBatch = read_json(path)?;
            let report = pipeline.ingest(batch)?;
            println!(
                "inserted {} updated {} unchanged {} edges {}",
                report.inserted, report.updated, report.unchanged, report.edges
            );
        }
        Some(("retrieve", args)) => {
            let seeds = args
                .get_many::<String>("seed")
                .context("missing seed")?
                .map(|s| s.parse::<EntityId>().with_context(|| format!("invalid entity id {s}")))
                .collect::<Result<Vec<_>>>()?;
            let mut request = ChangeRequest::new("", seeds);
            request.max_hops = args.get_one::<u32>("hops").copied();
            request.budget = args.get_one::<usize>("budget").copied();
            let ranked = pipeline.retrieve(&request)?;
            for entry in &ranked.entries {
                println!("{:<12} {:.3}  {}", entry.level.to_string(), entry.score, entry.entity.id);
            }
            if ranked.truncated > 0 {
                println!("({} more past the cap)", ranked.truncated);
            }
            if args.get_flag("render") {
                let bundle = pipeline.assemble(&request, &ranked);
                println!("{}", bundle.render());
            }
        }
        Some(("submit", args)) => {
            let path = args.get_one::<PathBuf>("request").context("missing --request")?;
            let request: ChangeRequest = read_json(path)?;
            let outcome = pipeline.handle(&request).await?;
            for c in &outcome.candidates {
                let probability = c.report.as_ref().map_or(f64::NAN, |r| r.probability);
                let status = match &c.disposition {
                    Disposition::Committed(r) => format!("committed as {}", r.commit),
                    Disposition::AwaitingReview => "awaiting review".to_string(),
                    Disposition::Rejected(why) => format!("rejected: {why}"),
                    Disposition::Conflicted(why) => format!("conflict: {why}"),
                };
                println!("{}  p={probability:.3}  {status}", c.candidate.short());
            }
        }
        Some(("candidates", _)) => {
            for record in pipeline.list_pending() {
                let latest = pipeline.validation_log().latest(&record.candidate.id);
                let verdict = latest.map_or_else(|| "unvalidated".to_string(), |r| format!("{:?}", r.verdict));
                println!(
                    "{}  {} mutation(s)  {verdict}",
                    record.candidate.id,
                    record.candidate.mutations.len()
                );
            }
        }
        Some(("approve", args)) => {
            let raw = args.get_one::<String>("candidate").context("missing candidate")?;
            let candidate: CandidateId = raw.parse().with_context(|| format!("invalid candidate id {raw}"))?;
            let reviewer = args.get_one::<String>("reviewer").context("missing --reviewer")?;
            let decision = match args.get_one::<String>("reject") {
                Some(note) => HumanDecision::reject(reviewer, note),
                None => HumanDecision::approve(reviewer),
            };
            match pipeline.approve(&candidate, decision)? {
                Disposition::Committed(result) => println!("committed as {}", result.commit),
                Disposition::Rejected(why) => println!("{why}"),
                other => bail!("unexpected disposition {other:?}"),
            }
        }
        Some(("rollback", args)) => {
            let raw = args.get_one::<String>("commit").context("missing commit")?;
            let commit: CommitId = raw.parse().with_context(|| format!("invalid commit id {raw}"))?;
            let result = pipeline.rollback(&commit)?;
            println!("restored {} entities", result.restored.len());
        }
        Some(("history", _)) => print_json(&pipeline.history())?,
        Some(("verify", _)) => {
            pipeline.verify_audit()?;
            println!("audit chain intact ({} records)", pipeline.history().len());
        }
        Some((other, _)) => bail!("unknown command {other}"),
        None => bail!("no command given"),
    }
    Ok(())
}
