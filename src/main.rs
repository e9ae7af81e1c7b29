use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use synthon_space::{
    assembly::{assemble_with, AssemblyMode},
    cancel::CancellationToken,
    canonize::{canonical_encoding, parse_encoding},
    loader::{read_descriptor, read_synthon_tsv, space_from_blob, space_to_blob, write_space, SpaceBlob},
    molecule::Molecule,
    search::{SearchConfig, SearchHit, SimilarityParams, SpaceSearchOrchestrator},
    space::{SpaceDescriptor, SpaceKind},
    split::{compute_all_valid_splits, SplitConfig},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a space from a `reaction \t position \t encoding` file.
    Build(BuildArgs),

    /// Find products similar to a query.
    Similar(SimilarArgs),

    /// Find products containing a query.
    Substructure(SubstructureArgs),

    /// Print every valid split of a molecule.
    Split {
        query: String,

        #[arg(long, default_value_t = 3)]
        max_cuts: usize,

        #[arg(long, default_value_t = 3)]
        max_fragments: usize,
    },

    /// Join synthons at matching connectors.
    Assemble {
        #[arg(required = true)]
        fragments: Vec<String>,

        #[arg(long, value_enum, default_value_t = AssemblyMode::PerClass)]
        mode: AssemblyMode,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    synthons: PathBuf,

    /// Output directory for the descriptor and blob.
    #[arg(short, long)]
    out: PathBuf,

    #[arg(long)]
    name: String,

    #[arg(long, default_value = "1")]
    version: String,

    #[arg(long, default_value = "unknown")]
    provider: String,

    #[arg(long, value_enum, default_value_t = SpaceKind::Similarity)]
    kind: SpaceKind,

    #[arg(long, default_value = "path")]
    fingerprint: String,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Space descriptor (CSV).
    space: PathBuf,

    /// Query molecule encoding.
    query: String,

    #[arg(long)]
    threads: Option<usize>,

    /// JSON file with search settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SimilarArgs {
    #[command(flatten)]
    query: QueryArgs,

    #[arg(short, long, default_value_t = 0.7)]
    threshold: f64,

    #[arg(long, default_value_t = 1000)]
    screened: usize,

    #[arg(long, default_value_t = 100)]
    considered: usize,

    #[arg(long, default_value_t = 1000)]
    expansions: usize,

    /// Only search these reactions.
    #[arg(long, value_delimiter = ',')]
    reactions: Vec<String>,
}

#[derive(Args, Debug)]
struct SubstructureArgs {
    #[command(flatten)]
    query: QueryArgs,

    #[arg(long, default_value_t = 1000)]
    max_extensions: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Build(args) => build(args),
        Command::Similar(args) => {
            let params = SimilarityParams {
                threshold: args.threshold,
                primary_hits_screened: args.screened,
                primary_hits_considered: args.considered,
                num_expansions: args.expansions,
                allowed_reactions: (!args.reactions.is_empty())
                    .then(|| args.reactions.into_iter().collect::<BTreeSet<_>>()),
            };
            let (orchestrator, name, query, threads) = prepare(&args.query, Some(SpaceKind::Similarity))?;
            let hits = orchestrator.find_similar(&name, &query, &params, threads, &CancellationToken::new())?;
            print_hits(hits.value());
            Ok(())
        }
        Command::Substructure(args) => {
            let (orchestrator, name, query, threads) = prepare(&args.query, None)?;
            let hits = orchestrator.find_substructures(
                &name,
                &query,
                args.max_extensions,
                threads,
                &CancellationToken::new(),
            )?;
            print_hits(hits.value());
            Ok(())
        }
        Command::Split {
            query,
            max_cuts,
            max_fragments,
        } => {
            let mol = parse_query(&query)?;
            let config = SplitConfig {
                max_cuts,
                max_fragments,
            };
            config.validate()?;
            let splits = compute_all_valid_splits(&mol, &config, &CancellationToken::new());
            for (cut_set, split) in splits.value() {
                let fragments: Vec<String> = split.fragments.iter().map(canonical_encoding).collect();
                println!("{cut_set:?}\t{}", fragments.join("\t"));
            }
            Ok(())
        }
        Command::Assemble { fragments, mode } => {
            let molecules = fragments
                .iter()
                .map(|f| parse_query(f))
                .collect::<Result<Vec<Molecule>>>()?;
            let assembled = assemble_with(&molecules, mode, false);
            if !assembled.unresolved.is_empty() {
                eprintln!("unresolved connectors: {:?}", assembled.unresolved);
            }
            println!("{}", canonical_encoding(&assembled.molecule));
            Ok(())
        }
    }
}

fn build(args: BuildArgs) -> Result<()> {
    let reactions = read_synthon_tsv(&args.synthons)
        .with_context(|| format!("reading synthons from {:?}", args.synthons))?;
    let descriptor = SpaceDescriptor {
        file: PathBuf::from(format!("{}.json", args.name)),
        name: args.name,
        version: args.version,
        provider: args.provider,
        kind: args.kind,
    };
    let blob = SpaceBlob {
        fingerprint: args.fingerprint,
        lsh: None,
        reactions,
    };

    // Round-trip through a space to validate and deduplicate.
    let space = space_from_blob(descriptor.clone(), blob)?;
    let path = write_space(&args.out, &descriptor, &space_to_blob(&space))?;
    info!("wrote {path:?}");
    println!(
        "{}\t{} synthons\t{} products",
        path.display(),
        space.num_synthons(),
        space.num_products()
    );
    Ok(())
}

// Substructure queries run on spaces of either kind.
fn prepare(
    args: &QueryArgs,
    kind: Option<SpaceKind>,
) -> Result<(SpaceSearchOrchestrator, String, Molecule, usize)> {
    let config = match &args.config {
        Some(path) => read_config(path)?,
        None => SearchConfig::default(),
    };
    let threads = args.threads.unwrap_or_else(rayon::current_num_threads);
    let kind = match kind {
        Some(kind) => kind,
        None => read_descriptor(&args.space)?.kind,
    };
    let orchestrator = SpaceSearchOrchestrator::new(config)?;
    let name = orchestrator
        .load_space(&args.space, kind, threads)
        .with_context(|| format!("loading {:?}", args.space))?;
    Ok((orchestrator, name, parse_query(&args.query)?, threads))
}

fn read_config(path: &Path) -> Result<SearchConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    Ok(serde_json::from_str(&text)?)
}

fn parse_query(s: &str) -> Result<Molecule> {
    let mol = parse_encoding(s).with_context(|| format!("parsing `{s}`"))?;
    if mol.is_malformed() {
        bail!("Bad input! Molecule has self-loops or doubled edges")
    }
    Ok(mol)
}

fn print_hits(hits: &[SearchHit]) {
    for hit in hits {
        let fragments: Vec<String> = hit.fragments.iter().map(|f| f.encoding.clone()).collect();
        match hit.similarity {
            Some(s) => println!("{}\t{}\t{s:.3}\t{}", hit.encoding, hit.reaction, fragments.join(" ")),
            None => println!("{}\t{}\t{}", hit.encoding, hit.reaction, fragments.join(" ")),
        }
    }
}
