//! Score one submission from the command line and print the result as JSON.
//!
//!   score_text [--doc <path>] [--explain] [TEXT...]
//!
//! Without TEXT the submission is read from stdin. `--explain` adds the per-category
//! rule breakdown on stderr.

use std::io::Read;

use anyhow::{bail, Context};
use plan_completeness_analyzer::{build_engine, init_tracing, AnalysisInput, AnalysisResponse};

struct Args {
    text: String,
    doc: Option<String>,
    explain: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut words = Vec::new();
    let mut doc = None;
    let mut explain = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--doc" => {
                let path = it.next().context("--doc needs a path")?;
                let body = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading document text from {path}"))?;
                doc = Some(body);
            }
            "--explain" => explain = true,
            "-h" | "--help" => {
                println!("usage: score_text [--doc <path>] [--explain] [TEXT...]");
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ => words.push(arg),
        }
    }

    let text = if words.is_empty() {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading text from stdin")?;
        buf
    } else {
        words.join(" ")
    };

    Ok(Args { text, doc, explain })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = parse_args()?;
    let input = AnalysisInput::new(args.text, args.doc)?;
    let engine = build_engine()?;

    if args.explain {
        let rule = engine.explain(&input);
        eprintln!("rule score: {:.3}", rule.normalized_score);
        for c in &rule.categories {
            eprintln!(
                "  {:<10} hits={} threshold={} weight={:.2} contribution={:.3}",
                c.category, c.hit_count, c.threshold, c.weight, c.contribution
            );
        }
    }

    let analysis = engine.analyze(&input).await?;
    let out = AnalysisResponse::from(&analysis.score);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
